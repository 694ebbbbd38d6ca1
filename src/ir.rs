//! SSA intermediate representation consumed by the lowering tier.
//!
//! The optimizer produces this IR: a graph of basic blocks holding tagged
//! instructions in SSA form, with phis at merge points and explicit
//! environment operands. Blocks and instructions live in arenas and refer to
//! each other by dense typed indices; the liveness and allocation passes key
//! their sidecar maps on the same indices.
//!
//! A [`Module`] bundles the closures and promises of one compilation unit
//! together with the constant pool, name interner, and source pool they
//! share.

use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;

use smallvec::SmallVec;

use crate::bc::DispatchTable;

// ─── Arena and ID types ─────────────────────────────────────────────────────

/// Typed index into an [`Arena`]. Generic over the element type for type
/// safety.
pub struct Id<T> {
    index: u32,
    _phantom: PhantomData<T>,
}

// Manual impls to avoid requiring T: Clone/Copy/Debug/PartialEq/Eq/Hash.
// Id<T> equality depends only on the index, not on T.
impl<T> Clone for Id<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Id<T> {}

impl<T> PartialEq for Id<T> {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index
    }
}

impl<T> Eq for Id<T> {}

impl<T> PartialOrd for Id<T> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Id<T> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.index.cmp(&other.index)
    }
}

impl<T> std::hash::Hash for Id<T> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.index.hash(state);
    }
}

impl<T> fmt::Debug for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.index)
    }
}

impl<T> Id<T> {
    pub(crate) fn new(index: u32) -> Self {
        Self {
            index,
            _phantom: PhantomData,
        }
    }

    /// The raw index into the arena.
    pub fn index(self) -> usize {
        self.index as usize
    }
}

/// Vec-backed arena with typed indexing via [`Id`].
pub struct Arena<T> {
    items: Vec<T>,
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Arena<T> {
    pub fn new() -> Self {
        Self { items: Vec::new() }
    }

    pub fn push(&mut self, item: T) -> Id<T> {
        let id = Id::new(self.items.len() as u32);
        self.items.push(item);
        id
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Id<T>, &T)> {
        self.items
            .iter()
            .enumerate()
            .map(|(i, item)| (Id::new(i as u32), item))
    }

    pub fn ids(&self) -> impl Iterator<Item = Id<T>> + use<T> {
        (0..self.items.len() as u32).map(Id::new)
    }
}

impl<T> std::ops::Index<Id<T>> for Arena<T> {
    type Output = T;
    fn index(&self, id: Id<T>) -> &T {
        &self.items[id.index()]
    }
}

impl<T> std::ops::IndexMut<Id<T>> for Arena<T> {
    fn index_mut(&mut self, id: Id<T>) -> &mut T {
        &mut self.items[id.index()]
    }
}

impl<T: fmt::Debug> fmt::Debug for Arena<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.items.iter()).finish()
    }
}

// ─── Type aliases ───────────────────────────────────────────────────────────

pub type InstrId = Id<Instr>;
pub type BbId = Id<BasicBlock>;
pub type ClosureId = Id<Closure>;
pub type PromiseId = Id<Promise>;
pub type PoolIdx = Id<PoolEntry>;

/// Marker type for interned names.
pub struct NameMarker;
/// An interned symbol (variable or function name).
pub type Name = Id<NameMarker>;

/// Marker type for source-pool references.
pub struct SrcMarker;
/// Index into the source pool, for diagnostic attachment.
pub type SrcIdx = Id<SrcMarker>;

// ─── Values ─────────────────────────────────────────────────────────────────

/// Anything an instruction can consume: the result of another instruction,
/// or one of the global sentinels that are materialized at their use site
/// and never allocated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Value {
    Instr(InstrId),
    Global(Global),
}

impl Value {
    /// The instruction behind this value, if it is one.
    pub fn as_instr(self) -> Option<InstrId> {
        match self {
            Value::Instr(id) => Some(id),
            Value::Global(_) => None,
        }
    }
}

/// The non-instruction values. None of these occupy storage; the emitter
/// materializes them inline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Global {
    /// The nil value.
    Nil,
    /// The missing-argument sentinel. Only legal feeding `MkArg`.
    Missing,
    /// The static base environment.
    BaseEnv,
    /// "Not closed yet": resolve to the caller's environment at run time.
    NotClosed,
}

impl fmt::Display for Global {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Global::Nil => write!(f, "nil"),
            Global::Missing => write!(f, "missing"),
            Global::BaseEnv => write!(f, "baseenv"),
            Global::NotClosed => write!(f, "notclosed"),
        }
    }
}

/// Result type of an instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Ty {
    /// An ordinary runtime value.
    Val,
    /// An environment.
    Env,
    /// No result.
    Void,
}

impl fmt::Display for Ty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Ty::Val => write!(f, "val"),
            Ty::Env => write!(f, "env"),
            Ty::Void => write!(f, "void"),
        }
    }
}

/// Runtime type tags testable by the `Is` instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypeTag {
    Nil,
    Logical,
    Int,
    Real,
    Str,
    Vec,
    Closure,
}

impl TypeTag {
    pub fn name(self) -> &'static str {
        match self {
            TypeTag::Nil => "nil",
            TypeTag::Logical => "logical",
            TypeTag::Int => "int",
            TypeTag::Real => "real",
            TypeTag::Str => "str",
            TypeTag::Vec => "vec",
            TypeTag::Closure => "closure",
        }
    }

    /// Wire encoding used by the `is` bytecode immediate.
    pub fn code(self) -> u8 {
        match self {
            TypeTag::Nil => 0,
            TypeTag::Logical => 1,
            TypeTag::Int => 2,
            TypeTag::Real => 3,
            TypeTag::Str => 4,
            TypeTag::Vec => 5,
            TypeTag::Closure => 6,
        }
    }

    pub fn from_code(code: u8) -> Self {
        match code {
            0 => TypeTag::Nil,
            1 => TypeTag::Logical,
            2 => TypeTag::Int,
            3 => TypeTag::Real,
            4 => TypeTag::Str,
            5 => TypeTag::Vec,
            6 => TypeTag::Closure,
            other => panic!("invalid type-tag encoding {other}"),
        }
    }
}

// ─── Instruction tags ───────────────────────────────────────────────────────

/// The instruction vocabulary of the optimizer IR.
///
/// Tag payloads carry compile-time attributes (names, pool indices, nested
/// bodies); runtime operands travel in [`Instr::args`].
#[derive(Debug, Clone, PartialEq)]
pub enum Tag {
    // ── Loads and stores ──
    /// Load a constant from the pool.
    LdConst { idx: PoolIdx },
    /// Load a variable from the environment, without forcing.
    LdVar { name: Name },
    /// Load a variable from the enclosing environment.
    LdVarSuper { name: Name },
    /// Load a function binding (skipping non-function values).
    LdFun { name: Name },
    /// Load the n-th call argument.
    LdArg { index: u32 },
    /// Load the environment the current function body runs in.
    LdFunctionEnv,
    /// Store a variable into the environment.
    StVar { name: Name },
    /// Store a variable into the enclosing environment.
    StVarSuper { name: Name },

    // ── Allocation ──
    /// Create an environment with the given local names. Args are the local
    /// values followed by the parent environment.
    MkEnv { names: Vec<Name> },
    /// Create a lazy argument wrapping a promise body.
    MkArg { promise: PromiseId },
    /// Create a closure from a compile-time known function.
    MkFunCls { closure: ClosureId },
    /// Create a closure from formals/body/env taken off the stack.
    MkCls,

    // ── SSA structure ──
    /// Identity copy, inserted by CSSA construction.
    Copy,
    /// Merge-point value selection. Incoming blocks in [`Instr::phi_preds`].
    Phi,
    /// Static type adjustment; no runtime effect.
    CastType,

    // ── Unary operations ──
    Force,
    Inc,
    AsBool,
    Length,
    ChkMissing,
    ChkClosure,
    IsObject,
    /// Runtime type test.
    Is { tag: TypeTag },
    /// Length of a for-loop sequence.
    ForSeqSize,
    AsLogical,
    Plus,
    Minus,
    Not,

    // ── Binary operations ──
    Identical,
    LglOr,
    LglAnd,
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
    Seq,

    // ── Indexing ──
    Extract1_1D,
    Extract2_1D,
    Extract1_2D,
    Extract2_2D,
    Subassign1,
    Subassign2 { name: Name },

    // ── Calls ──
    /// Call a function value. Args: callee, call arguments, environment.
    Call,
    /// Call a compile-time known closure.
    StaticCall { target: ClosureId },
    /// Call a builtin by name.
    CallBuiltin { builtin: Name },

    // ── Terminators ──
    /// Conditional branch on the single argument. The block's `next1` is the
    /// true target, `next0` the false target.
    Branch,
    /// Return the single argument.
    Return,
    /// Escape to the baseline interpreter.
    Deopt,
}

impl Tag {
    /// Lower-case mnemonic used in dumps and diagnostics.
    pub fn name(&self) -> &'static str {
        match self {
            Tag::LdConst { .. } => "ldconst",
            Tag::LdVar { .. } => "ldvar",
            Tag::LdVarSuper { .. } => "ldvarsuper",
            Tag::LdFun { .. } => "ldfun",
            Tag::LdArg { .. } => "ldarg",
            Tag::LdFunctionEnv => "ldfunctionenv",
            Tag::StVar { .. } => "stvar",
            Tag::StVarSuper { .. } => "stvarsuper",
            Tag::MkEnv { .. } => "mkenv",
            Tag::MkArg { .. } => "mkarg",
            Tag::MkFunCls { .. } => "mkfuncls",
            Tag::MkCls => "mkcls",
            Tag::Copy => "copy",
            Tag::Phi => "phi",
            Tag::CastType => "casttype",
            Tag::Force => "force",
            Tag::Inc => "inc",
            Tag::AsBool => "asbool",
            Tag::Length => "length",
            Tag::ChkMissing => "chkmissing",
            Tag::ChkClosure => "chkclosure",
            Tag::IsObject => "isobject",
            Tag::Is { .. } => "is",
            Tag::ForSeqSize => "forseqsize",
            Tag::AsLogical => "aslogical",
            Tag::Plus => "plus",
            Tag::Minus => "minus",
            Tag::Not => "not",
            Tag::Identical => "identical",
            Tag::LglOr => "lglor",
            Tag::LglAnd => "lgland",
            Tag::Add => "add",
            Tag::Sub => "sub",
            Tag::Mul => "mul",
            Tag::Div => "div",
            Tag::IDiv => "idiv",
            Tag::Mod => "mod",
            Tag::Pow => "pow",
            Tag::Lt => "lt",
            Tag::Gt => "gt",
            Tag::Lte => "lte",
            Tag::Gte => "gte",
            Tag::Eq => "eq",
            Tag::Neq => "neq",
            Tag::Colon => "colon",
            Tag::Seq => "seq",
            Tag::Extract1_1D => "extract1",
            Tag::Extract2_1D => "extract2",
            Tag::Extract1_2D => "extract1m",
            Tag::Extract2_2D => "extract2m",
            Tag::Subassign1 => "subassign1",
            Tag::Subassign2 { .. } => "subassign2",
            Tag::Call => "call",
            Tag::StaticCall { .. } => "staticcall",
            Tag::CallBuiltin { .. } => "callbuiltin",
            Tag::Branch => "branch",
            Tag::Return => "ret",
            Tag::Deopt => "deopt",
        }
    }

    /// True for tags that terminate their block.
    pub fn is_terminator(&self) -> bool {
        matches!(self, Tag::Branch | Tag::Return | Tag::Deopt)
    }
}

// ─── Instructions ───────────────────────────────────────────────────────────

/// One instruction: a tag, its runtime operands, and bookkeeping.
#[derive(Debug, Clone)]
pub struct Instr {
    pub tag: Tag,
    /// Result type; `Void` means no result.
    pub ty: Ty,
    /// Runtime operands, in consumption order.
    pub args: SmallVec<[Value; 2]>,
    /// For phis: the predecessor block each argument flows in from,
    /// parallel to `args`. Empty otherwise.
    pub phi_preds: Vec<BbId>,
    /// Index into `args` of the environment operand, if the instruction
    /// takes one. Always the last argument.
    pub env_slot: Option<u32>,
    /// Source-pool attachment for diagnostics.
    pub src_idx: Option<SrcIdx>,
    /// The containing block.
    pub bb: BbId,
}

impl Instr {
    pub fn is_phi(&self) -> bool {
        matches!(self.tag, Tag::Phi)
    }

    pub fn nargs(&self) -> usize {
        self.args.len()
    }

    pub fn has_env(&self) -> bool {
        self.env_slot.is_some()
    }

    /// The environment operand. Panics if the instruction has none.
    pub fn env(&self) -> Value {
        let slot = self.env_slot.expect("instruction has no environment operand");
        self.args[slot as usize]
    }

    pub fn has_result(&self) -> bool {
        self.ty != Ty::Void
    }
}

// ─── Basic blocks and code ──────────────────────────────────────────────────

/// Straight-line instruction sequence with up to two successors.
/// Two successors iff the terminator is a conditional branch.
#[derive(Debug, Clone, Default)]
pub struct BasicBlock {
    pub instrs: Vec<InstrId>,
    pub next0: Option<BbId>,
    pub next1: Option<BbId>,
}

impl BasicBlock {
    pub fn is_empty(&self) -> bool {
        self.instrs.is_empty()
    }

    pub fn len(&self) -> usize {
        self.instrs.len()
    }

    pub fn is_exit(&self) -> bool {
        self.next0.is_none() && self.next1.is_none()
    }

    pub fn successors(&self) -> impl Iterator<Item = BbId> + '_ {
        self.next0.into_iter().chain(self.next1)
    }
}

/// One function or promise body: a block graph with a distinguished entry.
#[derive(Debug)]
pub struct Code {
    pub blocks: Arena<BasicBlock>,
    pub instrs: Arena<Instr>,
    pub entry: BbId,
}

impl Default for Code {
    fn default() -> Self {
        let mut blocks = Arena::new();
        let entry = blocks.push(BasicBlock::default());
        Code {
            blocks,
            instrs: Arena::new(),
            entry,
        }
    }
}

impl Code {
    pub fn new() -> Self {
        Self::default()
    }

    /// One past the highest block id.
    pub fn next_bb_id(&self) -> usize {
        self.blocks.len()
    }

    /// Append an instruction to the end of a block.
    pub fn append(&mut self, bb: BbId, mut instr: Instr) -> InstrId {
        instr.bb = bb;
        let id = self.instrs.push(instr);
        self.blocks[bb].instrs.push(id);
        id
    }

    /// Insert an instruction at a position within a block.
    pub fn insert(&mut self, bb: BbId, pos: usize, mut instr: Instr) -> InstrId {
        instr.bb = bb;
        let id = self.instrs.push(instr);
        self.blocks[bb].instrs.insert(pos, id);
        id
    }

    /// Rewrite every use of `of` to `with`, except inside `except`.
    pub fn replace_uses(&mut self, of: Value, with: Value, except: InstrId) {
        for id in self.instrs.ids() {
            if id == except {
                continue;
            }
            for arg in &mut self.instrs[id].args {
                if *arg == of {
                    *arg = with;
                }
            }
        }
    }

    /// Number of uses per instruction, counting each argument occurrence.
    pub fn use_counts(&self) -> Vec<u32> {
        let mut counts = vec![0u32; self.instrs.len()];
        for (_, instr) in self.instrs.iter() {
            for arg in &instr.args {
                if let Value::Instr(id) = arg {
                    counts[id.index()] += 1;
                }
            }
        }
        counts
    }

    /// Structural well-formedness, checked after construction and after CSSA.
    ///
    /// Panics on: a terminator in the middle of a block, a conditional branch
    /// without two successors, successors on a returning block, or a phi
    /// whose inputs and predecessor list disagree.
    pub fn validate(&self) {
        for (bb_id, bb) in self.blocks.iter() {
            for (pos, &id) in bb.instrs.iter().enumerate() {
                let instr = &self.instrs[id];
                assert_eq!(
                    instr.bb, bb_id,
                    "instruction {:?} recorded in the wrong block",
                    id
                );
                if instr.tag.is_terminator() {
                    assert_eq!(
                        pos,
                        bb.instrs.len() - 1,
                        "terminator {} mid-block in bb{}",
                        instr.tag.name(),
                        bb_id.index()
                    );
                }
                if let Some(slot) = instr.env_slot {
                    assert_eq!(
                        slot as usize,
                        instr.args.len() - 1,
                        "environment operand of {} must be the last argument",
                        instr.tag.name()
                    );
                }
                if instr.is_phi() {
                    assert_eq!(
                        instr.phi_preds.len(),
                        instr.args.len(),
                        "phi {:?} inputs and predecessor list disagree",
                        id
                    );
                }
            }
            match bb.instrs.last().map(|&id| &self.instrs[id].tag) {
                Some(Tag::Branch) => {
                    assert!(
                        bb.next0.is_some() && bb.next1.is_some(),
                        "bb{} branches but lacks two successors",
                        bb_id.index()
                    );
                }
                Some(Tag::Return) | Some(Tag::Deopt) => {
                    assert!(
                        bb.is_exit(),
                        "bb{} terminates but still has successors",
                        bb_id.index()
                    );
                }
                _ => {
                    assert!(
                        bb.next1.is_none(),
                        "bb{} has a second successor without a branch",
                        bb_id.index()
                    );
                }
            }
        }
    }
}

// ─── Module: closures, promises, pools ──────────────────────────────────────

/// A user-level function known to the compiler.
#[derive(Debug)]
pub struct Closure {
    pub name: Option<String>,
    pub formals: Vec<Name>,
    /// Default-argument promise per formal, where one exists.
    pub default_args: Vec<Option<PromiseId>>,
    pub code: Code,
    pub dispatch: DispatchTable,
    pub src_idx: Option<SrcIdx>,
}

/// A deferred computation with its own body.
#[derive(Debug)]
pub struct Promise {
    pub code: Code,
    pub src_idx: Option<SrcIdx>,
}

/// Compilation unit: all closures and promises plus the pools they share.
#[derive(Debug)]
pub struct Module {
    pub closures: Arena<Closure>,
    pub promises: Arena<Promise>,
    pub pool: ConstantPool,
    pub names: NameInterner,
    pub src_pool: Vec<String>,
}

impl Default for Module {
    fn default() -> Self {
        Self::new()
    }
}

impl Module {
    pub fn new() -> Self {
        Module {
            closures: Arena::new(),
            promises: Arena::new(),
            pool: ConstantPool::new(),
            names: NameInterner::new(),
            src_pool: Vec::new(),
        }
    }

    pub fn name(&mut self, s: &str) -> Name {
        self.names.intern(s)
    }

    pub fn add_src(&mut self, s: impl Into<String>) -> SrcIdx {
        let idx = Id::new(self.src_pool.len() as u32);
        self.src_pool.push(s.into());
        idx
    }
}

/// Interned symbols. Names compare by index.
#[derive(Debug)]
pub struct NameInterner {
    names: Vec<String>,
    map: HashMap<String, Name>,
}

impl Default for NameInterner {
    fn default() -> Self {
        Self::new()
    }
}

impl NameInterner {
    pub fn new() -> Self {
        NameInterner {
            names: Vec::new(),
            map: HashMap::new(),
        }
    }

    pub fn intern(&mut self, s: &str) -> Name {
        if let Some(&name) = self.map.get(s) {
            return name;
        }
        let name = Id::new(self.names.len() as u32);
        self.names.push(s.to_owned());
        self.map.insert(s.to_owned(), name);
        name
    }

    pub fn get(&self, name: Name) -> &str {
        &self.names[name.index()]
    }
}

/// An entry in the constant pool.
#[derive(Debug, Clone, PartialEq)]
pub enum PoolEntry {
    Nil,
    /// The unbound-value sentinel pushed for missing arguments.
    Unbound,
    /// The static base environment.
    BaseEnv,
    Int(i32),
    Real(f64),
    Str(String),
    Sym(Name),
    /// Formal parameter list of a closure.
    Formals(Vec<Name>),
    /// Reference to a compile-time known closure.
    Closure(ClosureId),
    /// Reference into the source pool.
    Ast(SrcIdx),
}

/// Interning constant pool shared by every code object of a module.
///
/// Scalar entries are deduplicated; reals intern by bit pattern so that
/// distinct NaNs stay distinct and `-0.0` is not conflated with `0.0`.
#[derive(Debug)]
pub struct ConstantPool {
    entries: Vec<PoolEntry>,
    ints: HashMap<i32, PoolIdx>,
    reals: HashMap<u64, PoolIdx>,
    strs: HashMap<String, PoolIdx>,
    syms: HashMap<Name, PoolIdx>,
    closures: HashMap<ClosureId, PoolIdx>,
    asts: HashMap<SrcIdx, PoolIdx>,
    nil: Option<PoolIdx>,
    unbound: Option<PoolIdx>,
    base_env: Option<PoolIdx>,
}

impl Default for ConstantPool {
    fn default() -> Self {
        Self::new()
    }
}

impl ConstantPool {
    pub fn new() -> Self {
        ConstantPool {
            entries: Vec::new(),
            ints: HashMap::new(),
            reals: HashMap::new(),
            strs: HashMap::new(),
            syms: HashMap::new(),
            closures: HashMap::new(),
            asts: HashMap::new(),
            nil: None,
            unbound: None,
            base_env: None,
        }
    }

    fn push(&mut self, entry: PoolEntry) -> PoolIdx {
        let idx = Id::new(self.entries.len() as u32);
        self.entries.push(entry);
        idx
    }

    pub fn nil(&mut self) -> PoolIdx {
        if let Some(idx) = self.nil {
            return idx;
        }
        let idx = self.push(PoolEntry::Nil);
        self.nil = Some(idx);
        idx
    }

    pub fn unbound(&mut self) -> PoolIdx {
        if let Some(idx) = self.unbound {
            return idx;
        }
        let idx = self.push(PoolEntry::Unbound);
        self.unbound = Some(idx);
        idx
    }

    pub fn int(&mut self, n: i32) -> PoolIdx {
        if let Some(&idx) = self.ints.get(&n) {
            return idx;
        }
        let idx = self.push(PoolEntry::Int(n));
        self.ints.insert(n, idx);
        idx
    }

    pub fn real(&mut self, n: f64) -> PoolIdx {
        let bits = n.to_bits();
        if let Some(&idx) = self.reals.get(&bits) {
            return idx;
        }
        let idx = self.push(PoolEntry::Real(n));
        self.reals.insert(bits, idx);
        idx
    }

    pub fn str(&mut self, s: &str) -> PoolIdx {
        if let Some(&idx) = self.strs.get(s) {
            return idx;
        }
        let idx = self.push(PoolEntry::Str(s.to_owned()));
        self.strs.insert(s.to_owned(), idx);
        idx
    }

    pub fn base_env(&mut self) -> PoolIdx {
        if let Some(idx) = self.base_env {
            return idx;
        }
        let idx = self.push(PoolEntry::BaseEnv);
        self.base_env = Some(idx);
        idx
    }

    pub fn sym(&mut self, name: Name) -> PoolIdx {
        if let Some(&idx) = self.syms.get(&name) {
            return idx;
        }
        let idx = self.push(PoolEntry::Sym(name));
        self.syms.insert(name, idx);
        idx
    }

    pub fn closure(&mut self, cls: ClosureId) -> PoolIdx {
        if let Some(&idx) = self.closures.get(&cls) {
            return idx;
        }
        let idx = self.push(PoolEntry::Closure(cls));
        self.closures.insert(cls, idx);
        idx
    }

    pub fn ast(&mut self, src: SrcIdx) -> PoolIdx {
        if let Some(&idx) = self.asts.get(&src) {
            return idx;
        }
        let idx = self.push(PoolEntry::Ast(src));
        self.asts.insert(src, idx);
        idx
    }

    /// Entries without an interning key (formal lists); callers hold on to
    /// the returned index.
    pub fn insert(&mut self, entry: PoolEntry) -> PoolIdx {
        self.push(entry)
    }

    pub fn get(&self, idx: PoolIdx) -> &PoolEntry {
        &self.entries[idx.index()]
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ─── Builder ────────────────────────────────────────────────────────────────

/// Convenience layer for constructing [`Code`] in program order.
///
/// Used by the textual parser and by tests; the optimizer upstream builds
/// the arenas directly.
pub struct CodeBuilder {
    code: Code,
}

impl Default for CodeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl CodeBuilder {
    pub fn new() -> Self {
        CodeBuilder { code: Code::new() }
    }

    pub fn entry(&self) -> BbId {
        self.code.entry
    }

    pub fn add_block(&mut self) -> BbId {
        self.code.blocks.push(BasicBlock::default())
    }

    /// Append an instruction with full control over the fields.
    pub fn push_full(
        &mut self,
        bb: BbId,
        tag: Tag,
        ty: Ty,
        args: &[Value],
        env_slot: Option<u32>,
        src_idx: Option<SrcIdx>,
    ) -> Value {
        let id = self.code.append(
            bb,
            Instr {
                tag,
                ty,
                args: SmallVec::from_slice(args),
                phi_preds: Vec::new(),
                env_slot,
                src_idx,
                bb,
            },
        );
        Value::Instr(id)
    }

    /// Append a plain value-producing instruction.
    pub fn push(&mut self, bb: BbId, tag: Tag, args: &[Value]) -> Value {
        self.push_full(bb, tag, Ty::Val, args, None, None)
    }

    /// Append an instruction whose last argument is its environment.
    pub fn push_env(&mut self, bb: BbId, tag: Tag, ty: Ty, args: &[Value]) -> Value {
        assert!(!args.is_empty(), "environment-taking instruction needs args");
        self.push_full(bb, tag, ty, args, Some(args.len() as u32 - 1), None)
    }

    /// Append a phi merging `inputs` at the head of `bb`.
    pub fn phi(&mut self, bb: BbId, ty: Ty, inputs: &[(BbId, Value)]) -> Value {
        let args: SmallVec<[Value; 2]> = inputs.iter().map(|&(_, v)| v).collect();
        let preds: Vec<BbId> = inputs.iter().map(|&(p, _)| p).collect();
        let id = self.code.append(
            bb,
            Instr {
                tag: Tag::Phi,
                ty,
                args,
                phi_preds: preds,
                env_slot: None,
                src_idx: None,
                bb,
            },
        );
        Value::Instr(id)
    }

    /// Terminate `bb` with a conditional branch: `next1` when `cond` is
    /// true, `next0` otherwise.
    pub fn branch(&mut self, bb: BbId, cond: Value, next1: BbId, next0: BbId) {
        self.push_full(bb, Tag::Branch, Ty::Void, &[cond], None, None);
        self.code.blocks[bb].next0 = Some(next0);
        self.code.blocks[bb].next1 = Some(next1);
    }

    /// Fall through from `bb` to `next`.
    pub fn goto(&mut self, bb: BbId, next: BbId) {
        self.code.blocks[bb].next0 = Some(next);
    }

    /// Terminate `bb` with a return of `value`.
    pub fn ret(&mut self, bb: BbId, value: Value) {
        self.push_full(bb, Tag::Return, Ty::Void, &[value], None, None);
    }

    /// Terminate `bb` with a deopt carrying the given operands.
    pub fn deopt(&mut self, bb: BbId, args: &[Value]) {
        self.push_full(bb, Tag::Deopt, Ty::Void, args, None, None);
    }

    /// Validate and hand back the finished code.
    pub fn finish(self) -> Code {
        self.code.validate();
        self.code
    }
}

// ─── Display ────────────────────────────────────────────────────────────────

fn fmt_value(f: &mut fmt::Formatter<'_>, v: Value) -> fmt::Result {
    match v {
        Value::Instr(id) => write!(f, "%{}", id.index()),
        Value::Global(g) => write!(f, "{g}"),
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (bb_id, bb) in self.blocks.iter() {
            writeln!(f, "bb{}:", bb_id.index())?;
            for &id in &bb.instrs {
                let instr = &self.instrs[id];
                write!(f, "  ")?;
                if instr.has_result() {
                    write!(f, "%{} = ", id.index())?;
                }
                write!(f, "{}", instr.tag.name())?;
                fmt_payload(f, &instr.tag)?;
                if instr.is_phi() {
                    for (i, (&arg, &pred)) in
                        instr.args.iter().zip(&instr.phi_preds).enumerate()
                    {
                        write!(f, "{}", if i == 0 { " " } else { ", " })?;
                        write!(f, "bb{}:", pred.index())?;
                        fmt_value(f, arg)?;
                    }
                } else {
                    for (i, &arg) in instr.args.iter().enumerate() {
                        write!(f, "{}", if i == 0 { " " } else { ", " })?;
                        if instr.env_slot == Some(i as u32) {
                            write!(f, "env=")?;
                        }
                        fmt_value(f, arg)?;
                    }
                }
                if matches!(instr.tag, Tag::Branch) {
                    write!(
                        f,
                        " then bb{} else bb{}",
                        bb.next1.expect("branch has true target").index(),
                        bb.next0.expect("branch has false target").index()
                    )?;
                }
                if instr.has_result() && instr.ty != Ty::Val {
                    write!(f, " : {}", instr.ty)?;
                }
                if let Some(src) = instr.src_idx {
                    write!(f, " !{}", src.index())?;
                }
                writeln!(f)?;
            }
            let last_is_term = bb
                .instrs
                .last()
                .is_some_and(|&id| self.instrs[id].tag.is_terminator());
            if !last_is_term && let Some(next) = bb.next0 {
                writeln!(f, "  goto bb{}", next.index())?;
            }
        }
        Ok(())
    }
}

fn fmt_payload(f: &mut fmt::Formatter<'_>, tag: &Tag) -> fmt::Result {
    match tag {
        Tag::LdConst { idx } => write!(f, " [{}]", idx.index()),
        Tag::LdVar { name }
        | Tag::LdVarSuper { name }
        | Tag::LdFun { name }
        | Tag::StVar { name }
        | Tag::StVarSuper { name }
        | Tag::Subassign2 { name }
        | Tag::CallBuiltin { builtin: name } => write!(f, " @{}", name.index()),
        Tag::LdArg { index } => write!(f, " {index}"),
        Tag::MkEnv { names } => {
            for name in names {
                write!(f, " @{}", name.index())?;
            }
            Ok(())
        }
        Tag::MkArg { promise } => write!(f, " prom{}", promise.index()),
        Tag::MkFunCls { closure } => write!(f, " cls{}", closure.index()),
        Tag::StaticCall { target } => write!(f, " cls{}", target.index()),
        Tag::Is { tag } => write!(f, " {}", tag.name()),
        _ => Ok(()),
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arena_ids_are_dense_and_typed() {
        let mut arena: Arena<&str> = Arena::new();
        let a = arena.push("a");
        let b = arena.push("b");
        assert_eq!(a.index(), 0);
        assert_eq!(b.index(), 1);
        assert_eq!(arena[b], "b");
        assert_ne!(a, b);
    }

    #[test]
    fn pool_interns_scalars() {
        let mut pool = ConstantPool::new();
        assert_eq!(pool.int(42), pool.int(42));
        assert_ne!(pool.int(42), pool.int(43));
        assert_eq!(pool.real(1.5), pool.real(1.5));
        // -0.0 and 0.0 are distinct entries.
        assert_ne!(pool.real(0.0), pool.real(-0.0));
        assert_eq!(pool.str("x"), pool.str("x"));
        assert_eq!(pool.nil(), pool.nil());
    }

    #[test]
    fn builder_straight_line_displays() {
        let mut b = CodeBuilder::new();
        let entry = b.entry();
        let x = b.push(entry, Tag::LdArg { index: 0 }, &[]);
        let y = b.push(entry, Tag::LdArg { index: 1 }, &[]);
        let sum = b.push(entry, Tag::Add, &[x, y]);
        b.ret(entry, sum);
        let code = b.finish();

        let display = format!("{code}");
        assert!(display.contains("%0 = ldarg 0"), "{display}");
        assert!(display.contains("%2 = add %0, %1"), "{display}");
        assert!(display.contains("ret %2"), "{display}");
    }

    #[test]
    fn builder_diamond_has_two_successors() {
        let mut b = CodeBuilder::new();
        let entry = b.entry();
        let b1 = b.add_block();
        let b2 = b.add_block();
        let merge = b.add_block();
        let c = b.push(entry, Tag::LdArg { index: 0 }, &[]);
        b.branch(entry, c, b1, b2);
        let x = b.push(b1, Tag::LdArg { index: 1 }, &[]);
        b.goto(b1, merge);
        let y = b.push(b2, Tag::LdArg { index: 2 }, &[]);
        b.goto(b2, merge);
        let p = b.phi(merge, Ty::Val, &[(b1, x), (b2, y)]);
        b.ret(merge, p);
        let code = b.finish();

        let entry_bb = &code.blocks[code.entry];
        assert_eq!(entry_bb.successors().count(), 2);
        let display = format!("{code}");
        assert!(display.contains("phi bb1:%1, bb2:%2"), "{display}");
        assert!(display.contains("then bb1 else bb2"), "{display}");
    }

    #[test]
    #[should_panic(expected = "mid-block")]
    fn validate_rejects_midblock_terminator() {
        let mut b = CodeBuilder::new();
        let entry = b.entry();
        let v = b.push(entry, Tag::LdArg { index: 0 }, &[]);
        b.ret(entry, v);
        b.push(entry, Tag::LdArg { index: 1 }, &[]);
        b.finish();
    }

    #[test]
    fn use_counts_track_each_occurrence() {
        let mut b = CodeBuilder::new();
        let entry = b.entry();
        let x = b.push(entry, Tag::LdArg { index: 0 }, &[]);
        let d = b.push(entry, Tag::Add, &[x, x]);
        b.ret(entry, d);
        let code = b.finish();

        let counts = code.use_counts();
        assert_eq!(counts[0], 2, "x is used twice by the add");
        assert_eq!(counts[1], 1, "the sum is used once by ret");
    }
}
