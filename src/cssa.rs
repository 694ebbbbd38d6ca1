//! Conventional SSA construction.
//!
//! Splits every phi into explicit copies: one copy per input, placed in the
//! incoming block, and one copy of the phi result placed right after the phi.
//! Afterwards each phi input is a value with a single use (the phi), and the
//! phi's result has a single definition point disjoint from its inputs —
//! which is what lets the allocator coalesce a phi and all its inputs into
//! one slot.

use smallvec::smallvec;

use crate::cfg::breadth_first;
use crate::ir::{BbId, Code, Instr, Tag, Value};

/// Place `code` in conventional SSA form. The only pass that mutates the IR.
pub fn convert(code: &mut Code) {
    let order = breadth_first(code);
    for bb in order {
        let mut pos = 0;
        while pos < code.blocks[bb].instrs.len() {
            let id = code.blocks[bb].instrs[pos];
            if !code.instrs[id].is_phi() {
                pos += 1;
                continue;
            }

            let ty = code.instrs[id].ty;
            for i in 0..code.instrs[id].args.len() {
                let pred = code.instrs[id].phi_preds[i];
                let input = code.instrs[id].args[i];
                let at = copy_insert_pos(code, pred);
                let copy = code.insert(
                    pred,
                    at,
                    Instr {
                        tag: Tag::Copy,
                        ty,
                        args: smallvec![input],
                        phi_preds: Vec::new(),
                        env_slot: None,
                        src_idx: None,
                        bb: pred,
                    },
                );
                code.instrs[id].args[i] = Value::Instr(copy);
            }

            let result_copy = code.insert(
                bb,
                pos + 1,
                Instr {
                    tag: Tag::Copy,
                    ty,
                    args: smallvec![Value::Instr(id)],
                    phi_preds: Vec::new(),
                    env_slot: None,
                    src_idx: None,
                    bb,
                },
            );
            code.replace_uses(Value::Instr(id), Value::Instr(result_copy), result_copy);

            // Step over the phi and the copy we just placed after it.
            pos += 2;
        }
    }
}

/// Where to place a phi-input copy in `pred`: before the terminating branch
/// if there is one, otherwise at the end.
fn copy_insert_pos(code: &Code, pred: BbId) -> usize {
    let block = &code.blocks[pred];
    match block.instrs.last() {
        Some(&last) if code.instrs[last].tag.is_terminator() => block.instrs.len() - 1,
        _ => block.instrs.len(),
    }
}

/// True when every phi input is a copy used only by that phi, and every phi
/// result has a single use (the copy following it).
pub fn is_conventional(code: &Code) -> bool {
    let counts = code.use_counts();
    for (id, instr) in code.instrs.iter() {
        if !instr.is_phi() {
            continue;
        }
        for &arg in &instr.args {
            let Some(input) = arg.as_instr() else {
                return false;
            };
            if !matches!(code.instrs[input].tag, Tag::Copy) || counts[input.index()] != 1 {
                return false;
            }
        }
        if counts[id.index()] != 1 {
            return false;
        }
    }
    true
}

// ─── Tests ───────────────────────────────────────────────────────────────────
