//! Symbolic verification of the allocation.
//!
//! Before emission, every allocation is checked by abstract interpretation:
//! the verifier walks each reachable `(from, to)` edge of the block graph
//! exactly once, carrying a register file and an operand stack of value
//! identities, and asserts that every operand read observes exactly the
//! value the allocator placed there. Any mismatch is a compiler bug and
//! panics with the offending slot, expected and found values, and block id.

use std::collections::HashSet;

use crate::alloc::{Allocation, SlotNumber};
use crate::ir::{BbId, Code, InstrId};

/// Run the verifier over `code` under `alloc`. Panics on the first fault.
pub fn check(code: &Code, alloc: &Allocation) {
    let mut taken: HashSet<(BbId, BbId)> = HashSet::new();
    let mut regs: Vec<Option<InstrId>> = vec![None; alloc.local_count() as usize + 1];
    let mut stack: Vec<InstrId> = Vec::new();
    check_bb(code, alloc, code.entry, &mut regs, &mut stack, &mut taken);
}

fn check_bb(
    code: &Code,
    alloc: &Allocation,
    bb: BbId,
    regs: &mut Vec<Option<InstrId>>,
    stack: &mut Vec<InstrId>,
    taken: &mut HashSet<(BbId, BbId)>,
) {
    for &id in &code.blocks[bb].instrs {
        let instr = &code.instrs[id];

        if instr.is_phi() {
            let slot = alloc.slot(id).unwrap_or_else(|| {
                panic!("phi %{} in bb{} has no allocation", id.index(), bb.index())
            });
            for &arg in &instr.args {
                let Some(input) = arg.as_instr() else { continue };
                if alloc.slot(input) != Some(slot) {
                    panic!(
                        "phi %{} and its input %{} have different allocations in bb{}: \
                         {:?} vs {:?}",
                        id.index(),
                        input.index(),
                        bb.index(),
                        slot,
                        alloc.slot(input)
                    );
                }
            }
            if slot == SlotNumber::Stack {
                // The predecessor pushed the coalesced copy; its identity is
                // not checked, only the stack height.
                stack.pop().unwrap_or_else(|| {
                    panic!(
                        "stack underflow at phi %{} in bb{}",
                        id.index(),
                        bb.index()
                    )
                });
            }
        } else {
            for &arg in instr.args.iter().rev() {
                let Some(a) = arg.as_instr() else { continue };
                match alloc.slot(a) {
                    None => panic!(
                        "%{} ({}) in bb{} needs %{} but it is not allocated",
                        id.index(),
                        instr.tag.name(),
                        bb.index(),
                        a.index()
                    ),
                    Some(SlotNumber::Stack) => {
                        let given = stack.pop().unwrap_or_else(|| {
                            panic!(
                                "%{} ({}) in bb{} needs %{} but the stack is empty",
                                id.index(),
                                instr.tag.name(),
                                bb.index(),
                                a.index()
                            )
                        });
                        if given != a {
                            panic!(
                                "%{} ({}) in bb{} needs %{} but the stack has %{}",
                                id.index(),
                                instr.tag.name(),
                                bb.index(),
                                a.index(),
                                given.index()
                            );
                        }
                    }
                    Some(SlotNumber::Local(n)) => {
                        let given = regs
                            .get(n as usize)
                            .copied()
                            .flatten()
                            .unwrap_or_else(|| {
                                panic!(
                                    "%{} ({}) in bb{} reads slot {} before any write",
                                    id.index(),
                                    instr.tag.name(),
                                    bb.index(),
                                    n
                                )
                            });
                        if given != a {
                            panic!(
                                "%{} ({}) in bb{} needs %{} but slot {} was overridden \
                                 by %{}",
                                id.index(),
                                instr.tag.name(),
                                bb.index(),
                                a.index(),
                                n,
                                given.index()
                            );
                        }
                    }
                }
            }
        }

        // Commit the result.
        match alloc.slot(id) {
            Some(SlotNumber::Stack) => stack.push(id),
            Some(SlotNumber::Local(n)) => {
                if regs.len() <= n as usize {
                    regs.resize(n as usize + 1, None);
                }
                regs[n as usize] = Some(id);
            }
            None => {}
        }
    }

    let block = &code.blocks[bb];
    if block.is_exit() && !stack.is_empty() {
        panic!(
            "bb{} tries to terminate with {} element(s) left on the stack",
            bb.index(),
            stack.len()
        );
    }

    if let Some(next0) = block.next0
        && taken.insert((bb, next0))
    {
        if block.next1.is_none() {
            check_bb(code, alloc, next0, regs, stack, taken);
        } else {
            // The other branch still needs this state; explore a copy.
            let mut regs_copy = regs.clone();
            let mut stack_copy = stack.clone();
            check_bb(code, alloc, next0, &mut regs_copy, &mut stack_copy, taken);
        }
    }
    if let Some(next1) = block.next1
        && taken.insert((bb, next1))
    {
        check_bb(code, alloc, next1, regs, stack, taken);
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
