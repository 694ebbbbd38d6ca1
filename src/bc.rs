//! Bytecode for the silt interpreter, and the machinery that writes it.
//!
//! [`CodeStream`] collects ops for one function or promise body, with labels
//! for jump targets and a source side-list for diagnostics. Finalizing a
//! stream through [`FunctionWriter`] encodes it to the interpreter's byte
//! layout — one opcode byte followed by fixed-width little-endian u32
//! immediates — patching jumps to relative offsets. The writer collects the
//! finished [`CodeObj`]s into one [`Function`].
//!
//! A [`DispatchTable`] per closure selects which compiled body the
//! interpreter runs; the baseline sits at tier 0 and this crate installs at
//! tier 1.

use std::fmt;
use std::rc::Rc;

use crate::ir::{Id, Name, PoolIdx, SrcIdx, TypeTag};

// ─── Labels and opcodes ─────────────────────────────────────────────────────

/// Marker type for code-stream labels.
pub struct LabelMarker;
/// A jump target within one code stream.
pub type Label = Id<LabelMarker>;

/// Index of a finalized code object within its function.
pub type FunIdx = Id<CodeObj>;

/// One bytecode operation, as collected by the stream before encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BcOp {
    /// Push a constant-pool entry.
    Push(PoolIdx),
    Ldfun(Name),
    LdvarNoForce(Name),
    LdvarNoForceSuper(Name),
    Stvar(Name),
    StvarSuper(Name),
    Ldarg(u32),
    Ldloc(u32),
    Stloc(u32),
    Pop,
    Swap,
    SetEnv,
    GetEnv,
    ParentEnv,
    MakeEnv,
    /// Create a promise from the code object at the given index.
    Promise(FunIdx),
    Close,
    Force,
    Inc,
    Identical,
    LglOr,
    LglAnd,
    AsBool,
    Length,
    CheckMissing,
    IsFun,
    Seq,
    IsObj,
    Is(TypeTag),
    ForSeqSize,
    Add,
    Sub,
    Mul,
    Div,
    IDiv,
    Mod,
    Pow,
    Lt,
    Gt,
    Lte,
    Gte,
    Eq,
    Neq,
    Colon,
    AsLogical,
    UPlus,
    UMinus,
    Not,
    Extract1_1,
    Extract2_1,
    Extract1_2,
    Extract2_2,
    Subassign1,
    Subassign2(Name),
    Call { nargs: u32, ast: PoolIdx },
    StaticCall { nargs: u32, ast: PoolIdx, target: PoolIdx },
    Br(Label),
    Brfalse(Label),
    Ret,
    Trap,
}

/// Opcode bytes of the wire format. Zero is reserved as invalid.
mod op {
    pub const PUSH: u8 = 0x01;
    pub const LDFUN: u8 = 0x02;
    pub const LDVAR: u8 = 0x03;
    pub const LDVAR_SUPER: u8 = 0x04;
    pub const STVAR: u8 = 0x05;
    pub const STVAR_SUPER: u8 = 0x06;
    pub const LDARG: u8 = 0x07;
    pub const LDLOC: u8 = 0x08;
    pub const STLOC: u8 = 0x09;
    pub const POP: u8 = 0x0a;
    pub const SWAP: u8 = 0x0b;
    pub const SET_ENV: u8 = 0x0c;
    pub const GET_ENV: u8 = 0x0d;
    pub const PARENT_ENV: u8 = 0x0e;
    pub const MAKE_ENV: u8 = 0x0f;
    pub const PROMISE: u8 = 0x10;
    pub const CLOSE: u8 = 0x11;
    pub const FORCE: u8 = 0x12;
    pub const INC: u8 = 0x13;
    pub const IDENTICAL: u8 = 0x14;
    pub const LGL_OR: u8 = 0x15;
    pub const LGL_AND: u8 = 0x16;
    pub const ASBOOL: u8 = 0x17;
    pub const LENGTH: u8 = 0x18;
    pub const CHECK_MISSING: u8 = 0x19;
    pub const ISFUN: u8 = 0x1a;
    pub const SEQ: u8 = 0x1b;
    pub const ISOBJ: u8 = 0x1c;
    pub const IS: u8 = 0x1d;
    pub const FOR_SEQ_SIZE: u8 = 0x1e;
    pub const ADD: u8 = 0x1f;
    pub const SUB: u8 = 0x20;
    pub const MUL: u8 = 0x21;
    pub const DIV: u8 = 0x22;
    pub const IDIV: u8 = 0x23;
    pub const MOD: u8 = 0x24;
    pub const POW: u8 = 0x25;
    pub const LT: u8 = 0x26;
    pub const GT: u8 = 0x27;
    pub const LTE: u8 = 0x28;
    pub const GTE: u8 = 0x29;
    pub const EQ: u8 = 0x2a;
    pub const NEQ: u8 = 0x2b;
    pub const COLON: u8 = 0x2c;
    pub const AS_LOGICAL: u8 = 0x2d;
    pub const UPLUS: u8 = 0x2e;
    pub const UMINUS: u8 = 0x2f;
    pub const NOT: u8 = 0x30;
    pub const EXTRACT1_1: u8 = 0x31;
    pub const EXTRACT2_1: u8 = 0x32;
    pub const EXTRACT1_2: u8 = 0x33;
    pub const EXTRACT2_2: u8 = 0x34;
    pub const SUBASSIGN1: u8 = 0x35;
    pub const SUBASSIGN2: u8 = 0x36;
    pub const CALL: u8 = 0x37;
    pub const STATIC_CALL: u8 = 0x38;
    pub const BR: u8 = 0x39;
    pub const BRFALSE: u8 = 0x3a;
    pub const RET: u8 = 0x3b;
    pub const TRAP: u8 = 0x3c;
}

impl BcOp {
    /// Encoded size in bytes: one opcode byte plus u32 immediates.
    fn size(&self) -> usize {
        1 + 4 * match self {
            BcOp::Push(_)
            | BcOp::Ldfun(_)
            | BcOp::LdvarNoForce(_)
            | BcOp::LdvarNoForceSuper(_)
            | BcOp::Stvar(_)
            | BcOp::StvarSuper(_)
            | BcOp::Ldarg(_)
            | BcOp::Ldloc(_)
            | BcOp::Stloc(_)
            | BcOp::Promise(_)
            | BcOp::Is(_)
            | BcOp::Subassign2(_)
            | BcOp::Br(_)
            | BcOp::Brfalse(_) => 1,
            BcOp::Call { .. } => 2,
            BcOp::StaticCall { .. } => 3,
            _ => 0,
        }
    }
}

// ─── CodeStream ─────────────────────────────────────────────────────────────

/// Bytecode sink for one body. Ops are collected symbolically and encoded at
/// finalization.
pub struct CodeStream {
    ops: Vec<BcOp>,
    /// Bound position (op index) per label.
    labels: Vec<Option<usize>>,
    /// Source attachments: (op index, source-pool index).
    srcs: Vec<(usize, SrcIdx)>,
}

impl Default for CodeStream {
    fn default() -> Self {
        Self::new()
    }
}

impl CodeStream {
    pub fn new() -> Self {
        CodeStream {
            ops: Vec::new(),
            labels: Vec::new(),
            srcs: Vec::new(),
        }
    }

    /// Mint a fresh, unbound label.
    pub fn mk_label(&mut self) -> Label {
        let label = Id::new(self.labels.len() as u32);
        self.labels.push(None);
        label
    }

    /// Bind `label` to the current stream position.
    pub fn bind(&mut self, label: Label) {
        let slot = &mut self.labels[label.index()];
        assert!(slot.is_none(), "label L{} bound twice", label.index());
        *slot = Some(self.ops.len());
    }

    pub fn emit(&mut self, op: BcOp) {
        self.ops.push(op);
    }

    /// Attach a source-pool index to the most recently emitted op.
    pub fn add_src_idx(&mut self, src: SrcIdx) {
        let pos = self
            .ops
            .len()
            .checked_sub(1)
            .expect("source attachment needs a preceding op");
        self.srcs.push((pos, src));
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

// ─── CodeObj and Function ───────────────────────────────────────────────────

/// One finalized body in the interpreter's byte layout.
#[derive(Debug)]
pub struct CodeObj {
    pub bytes: Vec<u8>,
    /// `(byte offset, source index)` pairs, ordered by offset.
    pub srclist: Vec<(u32, SrcIdx)>,
    pub locals_count: u32,
    pub is_default_arg: bool,
}

/// A compiled function: every code object produced for one closure, with
/// `body` naming the function body itself (promises come first).
#[derive(Debug)]
pub struct Function {
    pub codes: Vec<CodeObj>,
    pub body: FunIdx,
}

impl Function {
    pub fn code(&self, idx: FunIdx) -> &CodeObj {
        &self.codes[idx.index()]
    }
}

// ─── FunctionWriter ─────────────────────────────────────────────────────────

/// Accumulates finalized code objects and hands back the function.
pub struct FunctionWriter {
    codes: Vec<CodeObj>,
}

impl Default for FunctionWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl FunctionWriter {
    pub fn new() -> Self {
        FunctionWriter { codes: Vec::new() }
    }

    /// Encode `stream` and append the resulting code object. Jump targets
    /// are patched to signed offsets relative to the end of the jump
    /// instruction; an unbound label is a hard error.
    pub fn finalize(
        &mut self,
        stream: CodeStream,
        is_default_arg: bool,
        locals_count: u32,
    ) -> FunIdx {
        // Byte offset of every op, then of every label.
        let mut offsets = Vec::with_capacity(stream.ops.len() + 1);
        let mut at = 0usize;
        for op in &stream.ops {
            offsets.push(at);
            at += op.size();
        }
        offsets.push(at);

        let label_offset = |label: Label| -> usize {
            let pos = stream.labels[label.index()]
                .unwrap_or_else(|| panic!("jump to unbound label L{}", label.index()));
            offsets[pos]
        };

        let mut bytes = Vec::with_capacity(at);
        for op in &stream.ops {
            encode(op, &mut bytes, &label_offset);
        }
        debug_assert_eq!(bytes.len(), at);

        let srclist = stream
            .srcs
            .iter()
            .map(|&(pos, src)| (offsets[pos] as u32, src))
            .collect();

        let idx = Id::new(self.codes.len() as u32);
        self.codes.push(CodeObj {
            bytes,
            srclist,
            locals_count,
            is_default_arg,
        });
        idx
    }

    /// Hand the collected code objects back as one function.
    pub fn finish(self, body: FunIdx) -> Function {
        assert!(
            body.index() < self.codes.len(),
            "function body index {} out of range",
            body.index()
        );
        Function {
            codes: self.codes,
            body,
        }
    }
}

fn encode(op: &BcOp, bytes: &mut Vec<u8>, label_offset: &dyn Fn(Label) -> usize) {
    let imm = |bytes: &mut Vec<u8>, v: u32| bytes.extend_from_slice(&v.to_le_bytes());
    match *op {
        BcOp::Push(idx) => {
            bytes.push(op::PUSH);
            imm(bytes, idx.index() as u32);
        }
        BcOp::Ldfun(name) => {
            bytes.push(op::LDFUN);
            imm(bytes, name.index() as u32);
        }
        BcOp::LdvarNoForce(name) => {
            bytes.push(op::LDVAR);
            imm(bytes, name.index() as u32);
        }
        BcOp::LdvarNoForceSuper(name) => {
            bytes.push(op::LDVAR_SUPER);
            imm(bytes, name.index() as u32);
        }
        BcOp::Stvar(name) => {
            bytes.push(op::STVAR);
            imm(bytes, name.index() as u32);
        }
        BcOp::StvarSuper(name) => {
            bytes.push(op::STVAR_SUPER);
            imm(bytes, name.index() as u32);
        }
        BcOp::Ldarg(i) => {
            bytes.push(op::LDARG);
            imm(bytes, i);
        }
        BcOp::Ldloc(i) => {
            bytes.push(op::LDLOC);
            imm(bytes, i);
        }
        BcOp::Stloc(i) => {
            bytes.push(op::STLOC);
            imm(bytes, i);
        }
        BcOp::Pop => bytes.push(op::POP),
        BcOp::Swap => bytes.push(op::SWAP),
        BcOp::SetEnv => bytes.push(op::SET_ENV),
        BcOp::GetEnv => bytes.push(op::GET_ENV),
        BcOp::ParentEnv => bytes.push(op::PARENT_ENV),
        BcOp::MakeEnv => bytes.push(op::MAKE_ENV),
        BcOp::Promise(idx) => {
            bytes.push(op::PROMISE);
            imm(bytes, idx.index() as u32);
        }
        BcOp::Close => bytes.push(op::CLOSE),
        BcOp::Force => bytes.push(op::FORCE),
        BcOp::Inc => bytes.push(op::INC),
        BcOp::Identical => bytes.push(op::IDENTICAL),
        BcOp::LglOr => bytes.push(op::LGL_OR),
        BcOp::LglAnd => bytes.push(op::LGL_AND),
        BcOp::AsBool => bytes.push(op::ASBOOL),
        BcOp::Length => bytes.push(op::LENGTH),
        BcOp::CheckMissing => bytes.push(op::CHECK_MISSING),
        BcOp::IsFun => bytes.push(op::ISFUN),
        BcOp::Seq => bytes.push(op::SEQ),
        BcOp::IsObj => bytes.push(op::ISOBJ),
        BcOp::Is(tag) => {
            bytes.push(op::IS);
            imm(bytes, tag.code() as u32);
        }
        BcOp::ForSeqSize => bytes.push(op::FOR_SEQ_SIZE),
        BcOp::Add => bytes.push(op::ADD),
        BcOp::Sub => bytes.push(op::SUB),
        BcOp::Mul => bytes.push(op::MUL),
        BcOp::Div => bytes.push(op::DIV),
        BcOp::IDiv => bytes.push(op::IDIV),
        BcOp::Mod => bytes.push(op::MOD),
        BcOp::Pow => bytes.push(op::POW),
        BcOp::Lt => bytes.push(op::LT),
        BcOp::Gt => bytes.push(op::GT),
        BcOp::Lte => bytes.push(op::LTE),
        BcOp::Gte => bytes.push(op::GTE),
        BcOp::Eq => bytes.push(op::EQ),
        BcOp::Neq => bytes.push(op::NEQ),
        BcOp::Colon => bytes.push(op::COLON),
        BcOp::AsLogical => bytes.push(op::AS_LOGICAL),
        BcOp::UPlus => bytes.push(op::UPLUS),
        BcOp::UMinus => bytes.push(op::UMINUS),
        BcOp::Not => bytes.push(op::NOT),
        BcOp::Extract1_1 => bytes.push(op::EXTRACT1_1),
        BcOp::Extract2_1 => bytes.push(op::EXTRACT2_1),
        BcOp::Extract1_2 => bytes.push(op::EXTRACT1_2),
        BcOp::Extract2_2 => bytes.push(op::EXTRACT2_2),
        BcOp::Subassign1 => bytes.push(op::SUBASSIGN1),
        BcOp::Subassign2(name) => {
            bytes.push(op::SUBASSIGN2);
            imm(bytes, name.index() as u32);
        }
        BcOp::Call { nargs, ast } => {
            bytes.push(op::CALL);
            imm(bytes, nargs);
            imm(bytes, ast.index() as u32);
        }
        BcOp::StaticCall { nargs, ast, target } => {
            bytes.push(op::STATIC_CALL);
            imm(bytes, nargs);
            imm(bytes, ast.index() as u32);
            imm(bytes, target.index() as u32);
        }
        BcOp::Br(label) | BcOp::Brfalse(label) => {
            bytes.push(if matches!(*op, BcOp::Br(_)) {
                op::BR
            } else {
                op::BRFALSE
            });
            let pc_after = bytes.len() + 4;
            let rel = label_offset(label) as i64 - pc_after as i64;
            bytes.extend_from_slice(&(rel as i32).to_le_bytes());
        }
        BcOp::Ret => bytes.push(op::RET),
        BcOp::Trap => bytes.push(op::TRAP),
    }
}

// ─── Disassembly ────────────────────────────────────────────────────────────

impl CodeObj {
    /// Decode the byte stream back to one mnemonic per line. Jump targets
    /// print as absolute byte offsets.
    pub fn disassemble(&self) -> String {
        use std::fmt::Write;
        let mut out = String::new();
        let mut pc = 0usize;
        while pc < self.bytes.len() {
            let opcode = self.bytes[pc];
            write!(out, "{pc:4}: ").unwrap();
            pc += 1;
            let imm = |pc: &mut usize| -> u32 {
                let v = u32::from_le_bytes(self.bytes[*pc..*pc + 4].try_into().unwrap());
                *pc += 4;
                v
            };
            match opcode {
                op::PUSH => writeln!(out, "push [{}]", imm(&mut pc)).unwrap(),
                op::LDFUN => writeln!(out, "ldfun @{}", imm(&mut pc)).unwrap(),
                op::LDVAR => writeln!(out, "ldvar @{}", imm(&mut pc)).unwrap(),
                op::LDVAR_SUPER => writeln!(out, "ldvarsuper @{}", imm(&mut pc)).unwrap(),
                op::STVAR => writeln!(out, "stvar @{}", imm(&mut pc)).unwrap(),
                op::STVAR_SUPER => writeln!(out, "stvarsuper @{}", imm(&mut pc)).unwrap(),
                op::LDARG => writeln!(out, "ldarg {}", imm(&mut pc)).unwrap(),
                op::LDLOC => writeln!(out, "ldloc {}", imm(&mut pc)).unwrap(),
                op::STLOC => writeln!(out, "stloc {}", imm(&mut pc)).unwrap(),
                op::POP => writeln!(out, "pop").unwrap(),
                op::SWAP => writeln!(out, "swap").unwrap(),
                op::SET_ENV => writeln!(out, "setenv").unwrap(),
                op::GET_ENV => writeln!(out, "getenv").unwrap(),
                op::PARENT_ENV => writeln!(out, "parentenv").unwrap(),
                op::MAKE_ENV => writeln!(out, "makeenv").unwrap(),
                op::PROMISE => writeln!(out, "promise {}", imm(&mut pc)).unwrap(),
                op::CLOSE => writeln!(out, "close").unwrap(),
                op::FORCE => writeln!(out, "force").unwrap(),
                op::INC => writeln!(out, "inc").unwrap(),
                op::IDENTICAL => writeln!(out, "identical").unwrap(),
                op::LGL_OR => writeln!(out, "lglor").unwrap(),
                op::LGL_AND => writeln!(out, "lgland").unwrap(),
                op::ASBOOL => writeln!(out, "asbool").unwrap(),
                op::LENGTH => writeln!(out, "length").unwrap(),
                op::CHECK_MISSING => writeln!(out, "checkmissing").unwrap(),
                op::ISFUN => writeln!(out, "isfun").unwrap(),
                op::SEQ => writeln!(out, "seq").unwrap(),
                op::ISOBJ => writeln!(out, "isobj").unwrap(),
                op::IS => {
                    let tag = TypeTag::from_code(imm(&mut pc) as u8);
                    writeln!(out, "is {}", tag.name()).unwrap()
                }
                op::FOR_SEQ_SIZE => writeln!(out, "forseqsize").unwrap(),
                op::ADD => writeln!(out, "add").unwrap(),
                op::SUB => writeln!(out, "sub").unwrap(),
                op::MUL => writeln!(out, "mul").unwrap(),
                op::DIV => writeln!(out, "div").unwrap(),
                op::IDIV => writeln!(out, "idiv").unwrap(),
                op::MOD => writeln!(out, "mod").unwrap(),
                op::POW => writeln!(out, "pow").unwrap(),
                op::LT => writeln!(out, "lt").unwrap(),
                op::GT => writeln!(out, "gt").unwrap(),
                op::LTE => writeln!(out, "lte").unwrap(),
                op::GTE => writeln!(out, "gte").unwrap(),
                op::EQ => writeln!(out, "eq").unwrap(),
                op::NEQ => writeln!(out, "neq").unwrap(),
                op::COLON => writeln!(out, "colon").unwrap(),
                op::AS_LOGICAL => writeln!(out, "aslogical").unwrap(),
                op::UPLUS => writeln!(out, "uplus").unwrap(),
                op::UMINUS => writeln!(out, "uminus").unwrap(),
                op::NOT => writeln!(out, "not").unwrap(),
                op::EXTRACT1_1 => writeln!(out, "extract1").unwrap(),
                op::EXTRACT2_1 => writeln!(out, "extract2").unwrap(),
                op::EXTRACT1_2 => writeln!(out, "extract1m").unwrap(),
                op::EXTRACT2_2 => writeln!(out, "extract2m").unwrap(),
                op::SUBASSIGN1 => writeln!(out, "subassign1").unwrap(),
                op::SUBASSIGN2 => writeln!(out, "subassign2 @{}", imm(&mut pc)).unwrap(),
                op::CALL => {
                    let nargs = imm(&mut pc);
                    let ast = imm(&mut pc);
                    writeln!(out, "call {nargs} [{ast}]").unwrap()
                }
                op::STATIC_CALL => {
                    let nargs = imm(&mut pc);
                    let ast = imm(&mut pc);
                    let target = imm(&mut pc);
                    writeln!(out, "staticcall {nargs} [{ast}] [{target}]").unwrap()
                }
                op::BR | op::BRFALSE => {
                    let rel =
                        i32::from_le_bytes(self.bytes[pc..pc + 4].try_into().unwrap());
                    pc += 4;
                    let target = (pc as i64 + rel as i64) as usize;
                    let name = if opcode == op::BR { "br" } else { "brfalse" };
                    writeln!(out, "{name} -> {target}").unwrap()
                }
                op::RET => writeln!(out, "ret").unwrap(),
                op::TRAP => writeln!(out, "trap").unwrap(),
                other => panic!("unknown opcode byte {other:#04x} at offset {}", pc - 1),
            }
        }
        out
    }

    /// Mnemonic sequence without offsets, convenient for assertions.
    pub fn mnemonics(&self) -> Vec<String> {
        self.disassemble()
            .lines()
            .map(|l| l.splitn(2, ": ").nth(1).unwrap_or(l).to_owned())
            .collect()
    }
}

impl fmt::Display for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, code) in self.codes.iter().enumerate() {
            let role = if i == self.body.index() {
                "body"
            } else if code.is_default_arg {
                "default-arg"
            } else {
                "promise"
            };
            writeln!(f, "code {i} ({role}, locals: {}):", code.locals_count)?;
            for line in code.disassemble().lines() {
                writeln!(f, "  {line}")?;
            }
        }
        Ok(())
    }
}

// ─── Dispatch table ─────────────────────────────────────────────────────────

/// Per-closure table of compiled bodies, indexed by tier. Tier 0 is the
/// baseline; the lowering tier installs at tier 1.
#[derive(Debug)]
pub struct DispatchTable {
    slots: Vec<Option<Rc<Function>>>,
}

impl DispatchTable {
    pub fn new(capacity: usize) -> Self {
        DispatchTable {
            slots: vec![None; capacity],
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn available(&self, tier: usize) -> bool {
        self.slots.get(tier).is_some_and(|slot| slot.is_some())
    }

    /// The lowest occupied tier.
    pub fn first(&self) -> Option<&Rc<Function>> {
        self.slots.iter().flatten().next()
    }

    pub fn get(&self, tier: usize) -> Option<&Rc<Function>> {
        self.slots.get(tier).and_then(Option::as_ref)
    }

    pub fn put(&mut self, tier: usize, function: Function) {
        assert!(tier < self.slots.len(), "tier {tier} out of range");
        self.slots[tier] = Some(Rc::new(function));
    }
}

impl Default for DispatchTable {
    fn default() -> Self {
        // Baseline plus one optimized tier.
        Self::new(2)
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
