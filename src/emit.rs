//! Bytecode emission and the lowering entry point.
//!
//! [`Lowering::compile`] drives the whole pipeline for one closure: CSSA,
//! liveness, allocation, verification, then a breadth-first walk over the
//! blocks emitting bytecode into a [`CodeStream`] per body. Promise bodies
//! are lowered on first reference and cached by index; nested closures
//! recurse through the same entry point, bounded by a done-set and each
//! closure's dispatch table. The finished [`Function`] is installed at
//! tier 1 unless the dry-run flag is set.
//!
//! Emission rules per instruction: the active environment is tracked and
//! `set-env` issued only on change; non-stack operands are loaded with
//! `ldloc`; results are popped when dead, stored with `stloc` when local,
//! and left in place when stack-allocated. Jump targets chase through empty
//! blocks, which never receive labels.

use std::collections::{HashMap, HashSet};
use std::mem;

use crate::DebugFlags;
use crate::alloc::{Allocation, SlotNumber};
use crate::bc::{BcOp, CodeStream, FunIdx, Function, FunctionWriter, Label};
use crate::cfg::{Cfg, DomTree, breadth_first};
use crate::cssa;
use crate::ir::{
    BbId, ClosureId, Code, Global, InstrId, Module, PoolEntry, PromiseId, Tag, Value,
};
use crate::liveness;
use crate::verify;

// ─── Lowering context ───────────────────────────────────────────────────────

/// Per-closure lowering state: the open code streams (innermost last) and
/// the promise index cache.
struct LowerCtx {
    writer: FunctionWriter,
    streams: Vec<(CodeStream, bool)>,
    promise_idx: HashMap<PromiseId, FunIdx>,
}

impl LowerCtx {
    fn new() -> Self {
        LowerCtx {
            writer: FunctionWriter::new(),
            streams: Vec::new(),
            promise_idx: HashMap::new(),
        }
    }

    fn cs(&mut self) -> &mut CodeStream {
        &mut self
            .streams
            .last_mut()
            .expect("emission needs an open code stream")
            .0
    }

    fn push_stream(&mut self, is_default_arg: bool) {
        self.streams.push((CodeStream::new(), is_default_arg));
    }

    fn finalize_top(&mut self, locals_count: u32) -> FunIdx {
        let (stream, is_default_arg) = self
            .streams
            .pop()
            .expect("finalizing needs an open code stream");
        self.writer.finalize(stream, is_default_arg, locals_count)
    }
}

// ─── Lowering driver ────────────────────────────────────────────────────────

/// Compiles closures to tier-1 bytecode. One instance per batch of
/// compilations; the done-set keeps mutually recursive closures from
/// recursing forever.
pub struct Lowering {
    flags: DebugFlags,
    done: HashSet<ClosureId>,
}

impl Lowering {
    pub fn new(flags: DebugFlags) -> Self {
        Lowering {
            flags,
            done: HashSet::new(),
        }
    }

    /// Lower `cls` and install the result at tier 1 of its dispatch table.
    /// Returns without work if the closure was already compiled (or is
    /// currently being compiled further up the stack).
    pub fn compile(&mut self, module: &mut Module, cls: ClosureId) {
        if !self.done.insert(cls) {
            return;
        }
        if module.closures[cls].dispatch.available(1) {
            return;
        }

        let function = self.lower_closure(module, cls);

        if self.flags.print_bytecode {
            print!("{function}");
        }
        if self.flags.dry_run {
            return;
        }
        module.closures[cls].dispatch.put(1, function);
    }

    fn lower_closure(&mut self, module: &mut Module, cls: ClosureId) -> Function {
        let mut ctx = LowerCtx::new();

        let defaults: Vec<PromiseId> = module.closures[cls]
            .default_args
            .iter()
            .flatten()
            .copied()
            .collect();
        for promise in defaults {
            self.promise_code(module, &mut ctx, promise, true);
        }

        ctx.push_stream(false);
        let mut code = mem::take(&mut module.closures[cls].code);
        let locals = self.compile_code(module, &mut ctx, &mut code);
        module.closures[cls].code = code;
        let body = ctx.finalize_top(locals);

        assert!(ctx.streams.is_empty(), "unbalanced code streams");
        ctx.writer.finish(body)
    }

    /// Lower a promise body once and return its code-object index.
    fn promise_code(
        &mut self,
        module: &mut Module,
        ctx: &mut LowerCtx,
        promise: PromiseId,
        is_default_arg: bool,
    ) -> FunIdx {
        if let Some(&idx) = ctx.promise_idx.get(&promise) {
            return idx;
        }
        ctx.push_stream(is_default_arg);
        let mut code = mem::take(&mut module.promises[promise].code);
        let locals = self.compile_code(module, ctx, &mut code);
        module.promises[promise].code = code;
        let idx = ctx.finalize_top(locals);
        ctx.promise_idx.insert(promise, idx);
        idx
    }

    /// Run the pipeline over one body and emit it into the current stream.
    /// Returns the local-slot count for finalization.
    fn compile_code(&mut self, module: &mut Module, ctx: &mut LowerCtx, code: &mut Code) -> u32 {
        cssa::convert(code);
        code.validate();
        if self.flags.print_cssa {
            println!("{code}");
        }

        let cfg = Cfg::compute(code);
        let dom = DomTree::compute(code, &cfg);
        let live = liveness::compute(code, &cfg, self.flags.trace_liveness);
        let alloc = Allocation::compute(code, &cfg, &dom, &live);

        if self.flags.print_allocation {
            print!("{}", alloc.dump(code));
        }
        if self.flags.print_final_ir {
            println!("{code}");
        }

        verify::check(code, &alloc);
        self.emit_code(module, ctx, code, &alloc);
        alloc.local_count()
    }

    // ─── Emission ───────────────────────────────────────────────────

    fn emit_code(
        &mut self,
        module: &mut Module,
        ctx: &mut LowerCtx,
        code: &Code,
        alloc: &Allocation,
    ) {
        let order = breadth_first(code);

        // Labels exist only for non-empty blocks; jumps chase through the
        // empty ones.
        let mut labels: Vec<Option<Label>> = vec![None; code.next_bb_id()];
        for &bb in &order {
            if !code.blocks[bb].is_empty() {
                labels[bb.index()] = Some(ctx.cs().mk_label());
            }
        }

        for &bb in &order {
            if code.blocks[bb].is_empty() {
                continue;
            }
            self.emit_block(module, ctx, code, alloc, &labels, bb);
        }
    }

    fn emit_block(
        &mut self,
        module: &mut Module,
        ctx: &mut LowerCtx,
        code: &Code,
        alloc: &Allocation,
        labels: &[Option<Label>],
        bb: BbId,
    ) {
        let label = labels[bb.index()].expect("non-empty block has a label");
        ctx.cs().bind(label);

        let mut current_env: Option<Value> = None;

        for &id in &code.blocks[bb].instrs {
            let instr = &code.instrs[id];

            // MkEnv consumes its parent environment as an ordinary operand;
            // deopt never switches the active environment.
            let explicit_env = matches!(instr.tag, Tag::MkEnv { .. } | Tag::Deopt);

            if !instr.is_phi() {
                // Step one: make the instruction's environment active.
                if instr.has_env() && !explicit_env {
                    assert_eq!(
                        instr.env_slot,
                        Some(instr.nargs() as u32 - 1),
                        "environment of {} must be its last argument",
                        instr.tag.name()
                    );
                    let env = instr.env();
                    if current_env != Some(env) {
                        self.load_env(module, ctx, alloc, env);
                        ctx.cs().emit(BcOp::SetEnv);
                        current_env = Some(env);
                    } else if alloc.value_slot(env) == Some(SlotNumber::Stack) {
                        // Already active, but the pre-coloring pushed it for
                        // this instruction.
                        ctx.cs().emit(BcOp::Pop);
                    }
                }

                // Step two: load the remaining operands.
                for (i, &arg) in instr.args.iter().enumerate() {
                    if instr.env_slot == Some(i as u32) {
                        if explicit_env {
                            self.load_env(module, ctx, alloc, arg);
                        }
                    } else {
                        self.load_arg(module, ctx, alloc, &instr.tag, id, arg);
                    }
                }
            }

            // Step three: the opcode itself.
            match &instr.tag {
                Tag::LdConst { idx } => ctx.cs().emit(BcOp::Push(*idx)),
                Tag::LdFun { name } => ctx.cs().emit(BcOp::Ldfun(*name)),
                Tag::LdVar { name } => ctx.cs().emit(BcOp::LdvarNoForce(*name)),
                Tag::LdVarSuper { name } => ctx.cs().emit(BcOp::LdvarNoForceSuper(*name)),
                Tag::StVar { name } => ctx.cs().emit(BcOp::Stvar(*name)),
                Tag::StVarSuper { name } => ctx.cs().emit(BcOp::StvarSuper(*name)),
                Tag::LdArg { index } => ctx.cs().emit(BcOp::Ldarg(*index)),
                Tag::LdFunctionEnv => ctx.cs().emit(BcOp::GetEnv),

                Tag::ForSeqSize => {
                    // The sequence is always popped after measuring; a later
                    // use reloads it from its local.
                    ctx.cs().emit(BcOp::ForSeqSize);
                    ctx.cs().emit(BcOp::Swap);
                    ctx.cs().emit(BcOp::Pop);
                }

                Tag::MkArg { promise } => {
                    let idx = self.promise_code(module, ctx, *promise, false);
                    ctx.cs().emit(BcOp::Promise(idx));
                }

                Tag::MkFunCls { closure } => {
                    let target = *closure;
                    let dispatch = &module.closures[target].dispatch;
                    if dispatch.capacity() > 1 && !dispatch.available(1) {
                        self.compile(module, target);
                    }
                    let formals = module.closures[target].formals.clone();
                    let formals_idx = module.pool.insert(PoolEntry::Formals(formals));
                    let cls_idx = module.pool.closure(target);
                    let src = match module.closures[target].src_idx {
                        Some(s) => module.pool.ast(s),
                        None => module.pool.nil(),
                    };
                    ctx.cs().emit(BcOp::Push(formals_idx));
                    ctx.cs().emit(BcOp::Push(cls_idx));
                    ctx.cs().emit(BcOp::Push(src));
                    ctx.cs().emit(BcOp::Close);
                }

                Tag::MkCls => ctx.cs().emit(BcOp::Close),

                Tag::MkEnv { names } => {
                    ctx.cs().emit(BcOp::MakeEnv);
                    if !names.is_empty() {
                        ctx.cs().emit(BcOp::SetEnv);
                        current_env = Some(Value::Instr(id));
                        for &name in names.iter().rev() {
                            ctx.cs().emit(BcOp::Stvar(name));
                        }
                        ctx.cs().emit(BcOp::GetEnv);
                    }
                }

                // After coalescing, a phi is a no-op: the verifier has
                // already proven its operands share its slot.
                Tag::Phi => {}

                // Pure data movement the allocator already resolved.
                Tag::Copy | Tag::CastType => {}

                Tag::Is { tag } => ctx.cs().emit(BcOp::Is(*tag)),

                Tag::Call => {
                    let nargs =
                        instr.nargs() as u32 - 1 - u32::from(instr.has_env());
                    let ast = self.call_ast(module, instr.src_idx);
                    ctx.cs().emit(BcOp::Call { nargs, ast });
                }

                Tag::StaticCall { target } => {
                    let target = *target;
                    self.compile(module, target);
                    let nargs = instr.nargs() as u32 - u32::from(instr.has_env());
                    let ast = self.call_ast(module, instr.src_idx);
                    let target_idx = module.pool.closure(target);
                    ctx.cs().emit(BcOp::StaticCall {
                        nargs,
                        ast,
                        target: target_idx,
                    });
                }

                Tag::CallBuiltin { builtin } => {
                    let nargs = instr.nargs() as u32 - u32::from(instr.has_env());
                    let ast = self.call_ast(module, instr.src_idx);
                    let target_idx = module.pool.sym(*builtin);
                    ctx.cs().emit(BcOp::StaticCall {
                        nargs,
                        ast,
                        target: target_idx,
                    });
                }

                Tag::Branch => {
                    let block = &code.blocks[bb];
                    let next0 = chase(code, block.next0.expect("branch has a false target"));
                    let next1 = chase(code, block.next1.expect("branch has a true target"));
                    let l0 = labels[next0.index()].expect("jump target has a label");
                    let l1 = labels[next1.index()].expect("jump target has a label");
                    ctx.cs().emit(BcOp::Brfalse(l0));
                    ctx.cs().emit(BcOp::Br(l1));
                    return;
                }

                Tag::Return => {
                    ctx.cs().emit(BcOp::Ret);
                    return;
                }

                Tag::Deopt => {
                    for _ in 0..instr.nargs() {
                        ctx.cs().emit(BcOp::Pop);
                    }
                    ctx.cs().emit(BcOp::Trap);
                    let nil = module.pool.nil();
                    ctx.cs().emit(BcOp::Push(nil));
                    ctx.cs().emit(BcOp::Ret);
                    return;
                }

                tag => {
                    if let Some(bc) = simple_bc(tag) {
                        ctx.cs().emit(bc);
                    } else if let Some(bc) = arith_bc(tag) {
                        ctx.cs().emit(bc);
                        if let Some(src) = instr.src_idx {
                            ctx.cs().add_src_idx(src);
                        }
                    } else {
                        panic!("cannot emit {} in bb{}", tag.name(), bb.index());
                    }
                }
            }

            // Step four: place the result.
            if instr.has_result() && !instr.is_phi() {
                match alloc.slot(id) {
                    None => ctx.cs().emit(BcOp::Pop),
                    Some(SlotNumber::Stack) => {}
                    Some(SlotNumber::Local(_)) => {
                        ctx.cs().emit(BcOp::Stloc(alloc.local_index(id)))
                    }
                }
            }
        }

        // No terminator: exactly one successor, reached by an explicit jump.
        let next0 = code.blocks[bb]
            .next0
            .expect("unterminated block falls through");
        let next = chase(code, next0);
        let label = labels[next.index()].expect("jump target has a label");
        ctx.cs().emit(BcOp::Br(label));
    }

    fn call_ast(&mut self, module: &mut Module, src: Option<crate::ir::SrcIdx>) -> crate::ir::PoolIdx {
        match src {
            Some(s) => module.pool.ast(s),
            None => module.pool.nil(),
        }
    }

    fn load_env(&mut self, module: &mut Module, ctx: &mut LowerCtx, alloc: &Allocation, what: Value) {
        match what {
            Value::Global(Global::BaseEnv) => {
                let idx = module.pool.base_env();
                ctx.cs().emit(BcOp::Push(idx));
            }
            Value::Global(Global::NotClosed) => ctx.cs().emit(BcOp::ParentEnv),
            Value::Instr(id) => match alloc.slot(id) {
                None => panic!(
                    "don't know how to load the environment %{}",
                    id.index()
                ),
                Some(SlotNumber::Stack) => {}
                Some(SlotNumber::Local(_)) => {
                    ctx.cs().emit(BcOp::Ldloc(alloc.local_index(id)))
                }
            },
            Value::Global(g) => panic!("{g} cannot serve as an environment"),
        }
    }

    fn load_arg(
        &mut self,
        module: &mut Module,
        ctx: &mut LowerCtx,
        alloc: &Allocation,
        tag: &Tag,
        user: InstrId,
        what: Value,
    ) {
        match what {
            Value::Global(Global::Missing) => {
                // Stack shuffling would be needed if the missing sentinel
                // could flow into wider instructions.
                assert!(
                    matches!(tag, Tag::MkArg { .. }),
                    "only mkarg accepts the missing sentinel, not {}",
                    tag.name()
                );
                let idx = module.pool.unbound();
                ctx.cs().emit(BcOp::Push(idx));
            }
            Value::Global(Global::Nil) => {
                let idx = module.pool.nil();
                ctx.cs().emit(BcOp::Push(idx));
            }
            Value::Global(g) => panic!(
                "don't know how to load {g} as an argument of %{} ({})",
                user.index(),
                tag.name()
            ),
            Value::Instr(id) => match alloc.slot(id) {
                None => panic!(
                    "don't know how to load the argument %{} of %{} ({})",
                    id.index(),
                    user.index(),
                    tag.name()
                ),
                Some(SlotNumber::Stack) => {}
                Some(SlotNumber::Local(_)) => {
                    ctx.cs().emit(BcOp::Ldloc(alloc.local_index(id)))
                }
            },
        }
    }
}

/// Skip zero-instruction blocks along `next0` until a real block turns up.
fn chase(code: &Code, mut bb: BbId) -> BbId {
    while code.blocks[bb].is_empty() {
        bb = code.blocks[bb]
            .next0
            .expect("empty block chain must lead somewhere");
    }
    bb
}

/// Tags that lower to exactly one opcode with no source attachment.
fn simple_bc(tag: &Tag) -> Option<BcOp> {
    Some(match tag {
        Tag::Force => BcOp::Force,
        Tag::Inc => BcOp::Inc,
        Tag::Identical => BcOp::Identical,
        Tag::LglOr => BcOp::LglOr,
        Tag::LglAnd => BcOp::LglAnd,
        Tag::AsBool => BcOp::AsBool,
        Tag::Length => BcOp::Length,
        Tag::ChkMissing => BcOp::CheckMissing,
        Tag::ChkClosure => BcOp::IsFun,
        Tag::IsObject => BcOp::IsObj,
        Tag::Seq => BcOp::Seq,
        _ => return None,
    })
}

/// Tags that lower to one opcode and carry their source index to the side
/// list, for runtime error attribution.
fn arith_bc(tag: &Tag) -> Option<BcOp> {
    Some(match tag {
        Tag::Add => BcOp::Add,
        Tag::Sub => BcOp::Sub,
        Tag::Mul => BcOp::Mul,
        Tag::Div => BcOp::Div,
        Tag::IDiv => BcOp::IDiv,
        Tag::Mod => BcOp::Mod,
        Tag::Pow => BcOp::Pow,
        Tag::Lt => BcOp::Lt,
        Tag::Gt => BcOp::Gt,
        Tag::Lte => BcOp::Lte,
        Tag::Gte => BcOp::Gte,
        Tag::Eq => BcOp::Eq,
        Tag::Neq => BcOp::Neq,
        Tag::Colon => BcOp::Colon,
        Tag::AsLogical => BcOp::AsLogical,
        Tag::Plus => BcOp::UPlus,
        Tag::Minus => BcOp::UMinus,
        Tag::Not => BcOp::Not,
        Tag::Extract1_1D => BcOp::Extract1_1,
        Tag::Extract2_1D => BcOp::Extract2_1,
        Tag::Extract1_2D => BcOp::Extract1_2,
        Tag::Extract2_2D => BcOp::Extract2_2,
        Tag::Subassign1 => BcOp::Subassign1,
        Tag::Subassign2 { name } => BcOp::Subassign2(*name),
        _ => return None,
    })
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bc::DispatchTable;
    use crate::ir::{Closure, CodeBuilder, Promise, Ty};

    fn add_closure(module: &mut Module, code: Code) -> ClosureId {
        module.closures.push(Closure {
            name: None,
            formals: Vec::new(),
            default_args: Vec::new(),
            code,
            dispatch: DispatchTable::default(),
            src_idx: None,
        })
    }

    fn compiled(module: &Module, cls: ClosureId) -> Vec<String> {
        let fun = module.closures[cls]
            .dispatch
            .get(1)
            .expect("closure compiled to tier 1");
        fun.code(fun.body).mnemonics()
    }

    fn lower(module: &mut Module, cls: ClosureId) {
        Lowering::new(DebugFlags::default()).compile(module, cls);
    }

    #[test]
    fn empty_function_pushes_nil() {
        let mut module = Module::new();
        let mut b = CodeBuilder::new();
        b.ret(b.entry(), Value::Global(Global::Nil));
        let cls = add_closure(&mut module, b.finish());

        lower(&mut module, cls);

        // The nil constant is the pool's first entry.
        assert_eq!(compiled(&module, cls), ["push [0]", "ret"]);
        let fun = module.closures[cls].dispatch.get(1).unwrap();
        assert_eq!(fun.code(fun.body).locals_count, 0);
    }

    #[test]
    fn straight_line_arithmetic_stays_on_the_stack() {
        let mut module = Module::new();
        let mut b = CodeBuilder::new();
        let entry = b.entry();
        let x = b.push(entry, Tag::LdArg { index: 0 }, &[]);
        let y = b.push(entry, Tag::LdArg { index: 1 }, &[]);
        let sum = b.push(entry, Tag::Add, &[x, y]);
        b.ret(entry, sum);
        let cls = add_closure(&mut module, b.finish());

        lower(&mut module, cls);

        assert_eq!(
            compiled(&module, cls),
            ["ldarg 0", "ldarg 1", "add", "ret"]
        );
        let fun = module.closures[cls].dispatch.get(1).unwrap();
        assert_eq!(fun.code(fun.body).locals_count, 0);
    }

    #[test]
    fn reused_value_loads_from_its_local() {
        let mut module = Module::new();
        let mut b = CodeBuilder::new();
        let entry = b.entry();
        let x = b.push(entry, Tag::LdArg { index: 0 }, &[]);
        let sum = b.push(entry, Tag::Add, &[x, x]);
        b.ret(entry, sum);
        let cls = add_closure(&mut module, b.finish());

        lower(&mut module, cls);

        assert_eq!(
            compiled(&module, cls),
            ["ldarg 0", "stloc 0", "ldloc 0", "ldloc 0", "add", "ret"]
        );
        let fun = module.closures[cls].dispatch.get(1).unwrap();
        assert_eq!(fun.code(fun.body).locals_count, 1);
    }

    #[test]
    fn diamond_phi_merges_through_one_local() {
        let mut module = Module::new();
        let k1 = module.pool.int(1);
        let k2 = module.pool.int(2);

        let mut b = CodeBuilder::new();
        let entry = b.entry();
        let b1 = b.add_block();
        let b2 = b.add_block();
        let merge = b.add_block();
        let c = b.push(entry, Tag::LdArg { index: 0 }, &[]);
        b.branch(entry, c, b1, b2);
        let x = b.push(b1, Tag::LdConst { idx: k1 }, &[]);
        b.goto(b1, merge);
        let y = b.push(b2, Tag::LdConst { idx: k2 }, &[]);
        b.goto(b2, merge);
        let p = b.phi(merge, Ty::Val, &[(b1, x), (b2, y)]);
        b.ret(merge, p);
        let cls = add_closure(&mut module, b.finish());

        lower(&mut module, cls);

        // Layout: entry (15 bytes), b1 at 15, b2 at 30, merge at 45. The
        // constants sit at pool indices 0 and 1.
        assert_eq!((k1.index(), k2.index()), (0, 1));
        assert_eq!(
            compiled(&module, cls),
            [
                "ldarg 0",
                "brfalse -> 30",
                "br -> 15",
                "push [0]",
                "stloc 0",
                "br -> 45",
                "push [1]",
                "stloc 0",
                "br -> 45",
                "ldloc 0",
                "ret",
            ]
        );
    }

    #[test]
    fn shared_environment_sets_env_once() {
        let mut module = Module::new();
        let x = module.name("x");
        let y = module.name("y");
        let base = Value::Global(Global::BaseEnv);

        let mut b = CodeBuilder::new();
        let entry = b.entry();
        let a = b.push_env(entry, Tag::LdVar { name: x }, Ty::Val, &[base]);
        let c = b.push_env(entry, Tag::LdVar { name: y }, Ty::Val, &[base]);
        let sum = b.push(entry, Tag::Add, &[a, c]);
        b.ret(entry, sum);
        let cls = add_closure(&mut module, b.finish());

        lower(&mut module, cls);

        // Pool: base environment at 0. Names: x at 0, y at 1.
        assert_eq!(module.pool.base_env().index(), 0);
        assert_eq!((x.index(), y.index()), (0, 1));
        assert_eq!(
            compiled(&module, cls),
            ["push [0]", "setenv", "ldvar @0", "ldvar @1", "add", "ret"]
        );
    }

    #[test]
    fn mkenv_stores_locals_in_reverse_and_becomes_active() {
        let mut module = Module::new();
        let a = module.name("a");
        let x = module.name("x");
        let k = module.pool.int(7);

        let mut b = CodeBuilder::new();
        let entry = b.entry();
        let v = b.push(entry, Tag::LdConst { idx: k }, &[]);
        let env = b.push_env(
            entry,
            Tag::MkEnv { names: vec![a] },
            Ty::Env,
            &[v, Value::Global(Global::NotClosed)],
        );
        let r = b.push_env(entry, Tag::LdVar { name: x }, Ty::Val, &[env]);
        b.ret(entry, r);
        let cls = add_closure(&mut module, b.finish());

        lower(&mut module, cls);

        assert_eq!((k.index(), a.index(), x.index()), (0, 0, 1));
        assert_eq!(
            compiled(&module, cls),
            [
                "push [0]",
                "stloc 0",
                "ldloc 0",
                "parentenv",
                "makeenv",
                "setenv",
                "stvar @0",
                "getenv",
                // The environment is already active; the copy the allocator
                // left on the stack is discarded.
                "pop",
                "ldvar @1",
                "ret",
            ]
        );
    }

    #[test]
    fn dead_result_is_popped() {
        let mut module = Module::new();
        let mut b = CodeBuilder::new();
        let entry = b.entry();
        let _dead = b.push(entry, Tag::LdArg { index: 1 }, &[]);
        b.ret(entry, Value::Global(Global::Nil));
        let cls = add_closure(&mut module, b.finish());

        lower(&mut module, cls);

        assert_eq!(
            compiled(&module, cls),
            ["ldarg 1", "pop", "push [0]", "ret"]
        );
    }

    #[test]
    fn deopt_pops_operands_and_traps() {
        let mut module = Module::new();
        let mut b = CodeBuilder::new();
        let entry = b.entry();
        let x = b.push(entry, Tag::LdArg { index: 0 }, &[]);
        b.deopt(entry, &[x]);
        let cls = add_closure(&mut module, b.finish());

        lower(&mut module, cls);

        assert_eq!(
            compiled(&module, cls),
            ["ldarg 0", "pop", "trap", "push [0]", "ret"]
        );
    }

    #[test]
    fn jump_targets_chase_through_empty_blocks() {
        let mut module = Module::new();
        let mut b = CodeBuilder::new();
        let entry = b.entry();
        let hollow = b.add_block();
        let tail = b.add_block();
        let x = b.push(entry, Tag::LdArg { index: 0 }, &[]);
        b.goto(entry, hollow);
        b.goto(hollow, tail);
        b.ret(tail, x);
        let cls = add_closure(&mut module, b.finish());

        lower(&mut module, cls);

        // x must cross two boundaries, so it lives in a local; the entry
        // jumps straight to the tail block at byte 15.
        assert_eq!(
            compiled(&module, cls),
            ["ldarg 0", "stloc 0", "br -> 15", "ldloc 0", "ret"]
        );
    }

    #[test]
    fn static_call_compiles_its_target_first() {
        let mut module = Module::new();
        let mut tb = CodeBuilder::new();
        tb.ret(tb.entry(), Value::Global(Global::Nil));
        let target = add_closure(&mut module, tb.finish());

        let mut b = CodeBuilder::new();
        let entry = b.entry();
        let r = b.push_env(
            entry,
            Tag::StaticCall { target },
            Ty::Val,
            &[Value::Global(Global::BaseEnv)],
        );
        b.ret(entry, r);
        let caller = add_closure(&mut module, b.finish());

        lower(&mut module, caller);

        assert!(
            module.closures[target].dispatch.available(1),
            "the callee is compiled before the call site"
        );
        let lines = compiled(&module, caller);
        assert!(
            lines.iter().any(|l| l.starts_with("staticcall 0")),
            "{lines:?}"
        );
    }

    #[test]
    fn promise_bodies_finalize_before_their_users() {
        let mut module = Module::new();

        // Innermost promise: just nil.
        let mut pb = CodeBuilder::new();
        pb.ret(pb.entry(), Value::Global(Global::Nil));
        let inner = module.promises.push(Promise {
            code: pb.finish(),
            src_idx: None,
        });

        // Outer promise wraps the inner one.
        let mut ob = CodeBuilder::new();
        let entry = ob.entry();
        let arg = ob.push_env(
            entry,
            Tag::MkArg { promise: inner },
            Ty::Val,
            &[Value::Global(Global::Missing), Value::Global(Global::BaseEnv)],
        );
        ob.ret(entry, arg);
        let outer = module.promises.push(Promise {
            code: ob.finish(),
            src_idx: None,
        });

        let mut b = CodeBuilder::new();
        let entry = b.entry();
        let arg = b.push_env(
            entry,
            Tag::MkArg { promise: outer },
            Ty::Val,
            &[Value::Global(Global::Missing), Value::Global(Global::BaseEnv)],
        );
        b.ret(entry, arg);
        let cls = add_closure(&mut module, b.finish());

        lower(&mut module, cls);

        let fun = module.closures[cls].dispatch.get(1).unwrap();
        assert_eq!(fun.codes.len(), 3, "two promises plus the body");
        assert_eq!(fun.body.index(), 2);
        // The outer promise (index 1) references the inner one (index 0).
        let outer_lines = fun.codes[1].disassemble();
        assert!(outer_lines.contains("promise 0"), "{outer_lines}");
        let body_lines = fun.code(fun.body).disassemble();
        assert!(body_lines.contains("promise 1"), "{body_lines}");
    }

    #[test]
    fn nested_closure_is_not_recompiled_when_tier1_exists() {
        let mut module = Module::new();

        let mut ib = CodeBuilder::new();
        ib.ret(ib.entry(), Value::Global(Global::Nil));
        let inner = add_closure(&mut module, ib.finish());

        // Pre-install a tier-1 body for the inner closure.
        Lowering::new(DebugFlags::default()).compile(&mut module, inner);
        let installed = std::rc::Rc::clone(module.closures[inner].dispatch.get(1).unwrap());

        let mut ob = CodeBuilder::new();
        let entry = ob.entry();
        let f = ob.push_env(
            entry,
            Tag::MkFunCls { closure: inner },
            Ty::Val,
            &[Value::Global(Global::BaseEnv)],
        );
        ob.ret(entry, f);
        let outer = add_closure(&mut module, ob.finish());

        lower(&mut module, outer);

        let after = module.closures[inner].dispatch.get(1).unwrap();
        assert!(
            std::rc::Rc::ptr_eq(&installed, after),
            "existing tier-1 body must be kept"
        );
        let lines = compiled(&module, outer);
        assert_eq!(lines.iter().filter(|l| *l == "close").count(), 1);
    }

    #[test]
    fn dry_run_does_not_install() {
        let mut module = Module::new();
        let mut b = CodeBuilder::new();
        b.ret(b.entry(), Value::Global(Global::Nil));
        let cls = add_closure(&mut module, b.finish());

        let flags = DebugFlags {
            dry_run: true,
            ..DebugFlags::default()
        };
        Lowering::new(flags).compile(&mut module, cls);

        assert!(module.closures[cls].dispatch.get(1).is_none());
    }

    #[test]
    fn loop_with_induction_phi_lowers_and_verifies() {
        let mut module = Module::new();
        let mut b = CodeBuilder::new();
        let entry = b.entry();
        let header = b.add_block();
        let exit = b.add_block();
        let init = b.push(entry, Tag::LdArg { index: 0 }, &[]);
        b.goto(entry, header);
        let phi = b.phi(header, Ty::Val, &[(entry, init)]);
        let next = b.push(header, Tag::Inc, &[phi]);
        let cond = b.push(header, Tag::AsBool, &[next]);
        b.branch(header, cond, header, exit);
        b.ret(exit, next);
        let mut code = b.finish();
        let phi_id = phi.as_instr().unwrap();
        code.instrs[phi_id].args.push(next);
        code.instrs[phi_id].phi_preds.push(header);
        let cls = add_closure(&mut module, code);

        lower(&mut module, cls);

        let lines = compiled(&module, cls);
        assert!(lines.iter().any(|l| l.starts_with("brfalse")), "{lines:?}");
        assert!(lines.contains(&"inc".to_string()), "{lines:?}");
    }
}
