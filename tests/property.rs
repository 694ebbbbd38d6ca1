//! Property tests for the lowering pipeline.
//!
//! Random well-formed bodies are generated through the builder, then pushed
//! through the full pipeline. The in-pipeline verifier turns every case
//! into a stack-discipline check; on top of that we assert the conversion
//! invariant and bit-level determinism.

use proptest::prelude::*;

use silt::DebugFlags;
use silt::bc::DispatchTable;
use silt::cssa;
use silt::emit::Lowering;
use silt::ir::{Closure, ClosureId, Code, CodeBuilder, Module, Tag, Ty};

/// One straight-line step: an operation and which prior values it consumes.
#[derive(Debug, Clone)]
struct Step {
    op: u8,
    lhs: prop::sample::Index,
    rhs: prop::sample::Index,
}

fn steps() -> impl Strategy<Value = Vec<Step>> {
    prop::collection::vec(
        (0u8..5, any::<prop::sample::Index>(), any::<prop::sample::Index>())
            .prop_map(|(op, lhs, rhs)| Step { op, lhs, rhs }),
        1..24,
    )
}

/// Straight-line body: two arguments, then the generated op chain, then a
/// return of the last value.
fn build_straight_line(steps: &[Step]) -> Code {
    let mut b = CodeBuilder::new();
    let entry = b.entry();
    let mut values = vec![
        b.push(entry, Tag::LdArg { index: 0 }, &[]),
        b.push(entry, Tag::LdArg { index: 1 }, &[]),
    ];
    for step in steps {
        let lhs = *step.lhs.get(&values);
        let rhs = *step.rhs.get(&values);
        let v = match step.op {
            0 => b.push(entry, Tag::Add, &[lhs, rhs]),
            1 => b.push(entry, Tag::Sub, &[lhs, rhs]),
            2 => b.push(entry, Tag::Mul, &[lhs, rhs]),
            3 => b.push(entry, Tag::Inc, &[lhs]),
            _ => b.push(entry, Tag::Force, &[lhs]),
        };
        values.push(v);
    }
    let result = *values.last().unwrap();
    b.ret(entry, result);
    b.finish()
}

/// Diamond body: entry branches over two arms of generated length, merging
/// at a phi.
fn build_diamond(left: &[Step], right: &[Step]) -> Code {
    let mut b = CodeBuilder::new();
    let entry = b.entry();
    let b1 = b.add_block();
    let b2 = b.add_block();
    let merge = b.add_block();
    let c = b.push(entry, Tag::LdArg { index: 0 }, &[]);
    b.branch(entry, c, b1, b2);

    let mut arm = |bb, steps: &[Step], b: &mut CodeBuilder| {
        let mut values = vec![b.push(bb, Tag::LdArg { index: 1 }, &[])];
        for step in steps {
            let lhs = *step.lhs.get(&values);
            let v = match step.op % 2 {
                0 => b.push(bb, Tag::Inc, &[lhs]),
                _ => b.push(bb, Tag::Force, &[lhs]),
            };
            values.push(v);
        }
        *values.last().unwrap()
    };
    let x = arm(b1, left, &mut b);
    b.goto(b1, merge);
    let y = arm(b2, right, &mut b);
    b.goto(b2, merge);

    let p = b.phi(merge, Ty::Val, &[(b1, x), (b2, y)]);
    b.ret(merge, p);
    b.finish()
}

fn as_closure(code: Code) -> (Module, ClosureId) {
    let mut module = Module::new();
    let cls = module.closures.push(Closure {
        name: None,
        formals: Vec::new(),
        default_args: Vec::new(),
        code,
        dispatch: DispatchTable::default(),
        src_idx: None,
    });
    (module, cls)
}

fn lowered_bytes(code: Code) -> Vec<Vec<u8>> {
    let (mut module, cls) = as_closure(code);
    Lowering::new(DebugFlags::default()).compile(&mut module, cls);
    let fun = module.closures[cls].dispatch.get(1).expect("installed");
    fun.codes.iter().map(|c| c.bytes.clone()).collect()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    /// Every generated straight-line body survives the pipeline; the
    /// in-pipeline verifier would panic on any misallocation.
    #[test]
    fn straight_line_bodies_lower(steps in steps()) {
        let bytes = lowered_bytes(build_straight_line(&steps));
        prop_assert!(!bytes[0].is_empty());
    }

    /// Same for diamonds with a merge phi.
    #[test]
    fn diamond_bodies_lower(left in steps(), right in steps()) {
        let bytes = lowered_bytes(build_diamond(&left, &right));
        prop_assert!(!bytes[0].is_empty());
    }

    /// Lowering is a pure function of the input: two independent runs yield
    /// byte-identical code objects.
    #[test]
    fn lowering_is_deterministic(left in steps(), right in steps()) {
        let a = lowered_bytes(build_diamond(&left, &right));
        let b = lowered_bytes(build_diamond(&left, &right));
        prop_assert_eq!(a, b);
    }

    /// One conversion pass establishes the conventional-form invariant and
    /// a second pass preserves it.
    #[test]
    fn conversion_is_stable(left in steps(), right in steps()) {
        let mut code = build_diamond(&left, &right);
        cssa::convert(&mut code);
        prop_assert!(cssa::is_conventional(&code));
        let instrs_after_one = code.instrs.len();

        cssa::convert(&mut code);
        code.validate();
        prop_assert!(cssa::is_conventional(&code));
        // The second pass adds exactly one copy per phi input plus one per
        // phi result: the shape is stable, not growing per value.
        prop_assert_eq!(code.instrs.len(), instrs_after_one + 3);
    }
}
