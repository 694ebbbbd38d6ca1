//! End-to-end lowering throughput over synthetic bodies.

use divan::Bencher;

use silt::DebugFlags;
use silt::bc::DispatchTable;
use silt::emit::Lowering;
use silt::ir::{Closure, ClosureId, CodeBuilder, Module, Tag, Ty};

fn main() {
    divan::main();
}

/// A single block of `n` dependent additions with periodic value reuse, so
/// both the stack window and the local-slot allocator see work.
fn chain_module(n: usize) -> (Module, ClosureId) {
    let mut b = CodeBuilder::new();
    let entry = b.entry();
    let mut prev = b.push(entry, Tag::LdArg { index: 0 }, &[]);
    let reused = b.push(entry, Tag::LdArg { index: 1 }, &[]);
    for i in 0..n {
        prev = if i % 7 == 0 {
            b.push(entry, Tag::Add, &[prev, reused])
        } else {
            b.push(entry, Tag::Inc, &[prev])
        };
    }
    b.ret(entry, prev);
    finish(b)
}

/// A ladder of `n` diamonds, each merging through a phi, chained together.
fn diamond_module(n: usize) -> (Module, ClosureId) {
    let mut b = CodeBuilder::new();
    let mut bb = b.entry();
    let mut carry = b.push(bb, Tag::LdArg { index: 0 }, &[]);
    for _ in 0..n {
        let left = b.add_block();
        let right = b.add_block();
        let merge = b.add_block();
        let c = b.push(bb, Tag::AsBool, &[carry]);
        b.branch(bb, c, left, right);
        let x = b.push(left, Tag::Inc, &[carry]);
        b.goto(left, merge);
        let y = b.push(right, Tag::Force, &[carry]);
        b.goto(right, merge);
        carry = b.phi(merge, Ty::Val, &[(left, x), (right, y)]);
        bb = merge;
    }
    b.ret(bb, carry);
    finish(b)
}

fn finish(b: CodeBuilder) -> (Module, ClosureId) {
    let mut module = Module::new();
    let cls = module.closures.push(Closure {
        name: None,
        formals: Vec::new(),
        default_args: Vec::new(),
        code: b.finish(),
        dispatch: DispatchTable::default(),
        src_idx: None,
    });
    (module, cls)
}

#[divan::bench(args = [16, 128, 1024])]
fn lower_chain(bencher: Bencher, n: usize) {
    bencher
        .with_inputs(|| chain_module(n))
        .bench_local_values(|(mut module, cls)| {
            Lowering::new(DebugFlags::default()).compile(&mut module, cls);
            module
        });
}

#[divan::bench(args = [4, 32, 128])]
fn lower_diamond_ladder(bencher: Bencher, n: usize) {
    bencher
        .with_inputs(|| diamond_module(n))
        .bench_local_values(|(mut module, cls)| {
            Lowering::new(DebugFlags::default()).compile(&mut module, cls);
            module
        });
}
