//! Two-tier storage allocation.
//!
//! Every value that survives liveness gets either the evaluation stack or a
//! numbered local slot:
//!
//! 1. Stack pre-coloring marks values that can ride the stack with no
//!    shuffling: phis at a block entry whose inputs arrive on top of the
//!    stack from a fallthrough predecessor, and in-block producer/consumer
//!    chains found by simulating a stack window over each block.
//! 2. The rest are colored onto local slots: phis are coalesced with all
//!    their inputs onto one slot (CSSA makes this safe), then a
//!    dominator-tree preorder walk eagerly assigns first-fit slots, trying
//!    the first argument's slot first to avoid a load/store pair.
//!
//! Values with no liveness record are dead; the emitter pops their results.

use std::collections::VecDeque;

use crate::cfg::{Cfg, DomTree, breadth_first};
use crate::ir::{BbId, Code, InstrId, Value};
use crate::liveness::Liveness;

/// Where a value lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotNumber {
    /// The evaluation stack.
    Stack,
    /// A numbered local, counted from 1. Slot 0 is the unassigned sentinel
    /// and never appears here.
    Local(u32),
}

/// The allocation map: a partial assignment of values to slots.
pub struct Allocation {
    slots: Vec<Option<SlotNumber>>,
    local_count: u32,
}

impl Allocation {
    /// Compute the full allocation for `code`.
    pub fn compute(code: &Code, cfg: &Cfg, dom: &DomTree, live: &Liveness) -> Self {
        let mut alloc = Allocation {
            slots: vec![None; code.instrs.len()],
            local_count: 0,
        };
        alloc.stack_precolor(code, cfg);
        alloc.color_locals(code, dom, live);
        alloc
    }

    pub fn has_slot(&self, id: InstrId) -> bool {
        self.slots[id.index()].is_some()
    }

    pub fn on_stack(&self, id: InstrId) -> bool {
        self.slots[id.index()] == Some(SlotNumber::Stack)
    }

    pub fn slot(&self, id: InstrId) -> Option<SlotNumber> {
        self.slots[id.index()]
    }

    /// Zero-based local index for the bytecode. Panics for stack-allocated
    /// or dead values.
    pub fn local_index(&self, id: InstrId) -> u32 {
        match self.slots[id.index()] {
            Some(SlotNumber::Local(n)) => n - 1,
            other => panic!("%{} is not in a local slot (got {other:?})", id.index()),
        }
    }

    /// Number of local slots the frame needs.
    pub fn local_count(&self) -> u32 {
        self.local_count
    }

    /// Slot lookup for a value; globals are never allocated.
    pub fn value_slot(&self, v: Value) -> Option<SlotNumber> {
        v.as_instr().and_then(|id| self.slot(id))
    }

    /// Override one assignment. Only the verifier tests use this, to exercise
    /// fault detection on corrupted maps.
    pub(crate) fn set_slot(&mut self, id: InstrId, slot: Option<SlotNumber>) {
        self.slots[id.index()] = slot;
    }

    // ─── Stack pre-coloring ─────────────────────────────────────────

    fn stack_precolor(&mut self, code: &Code, cfg: &Cfg) {
        let use_counts = code.use_counts();
        for bb in breadth_first(code) {
            self.precolor_entry_phis(code, cfg, bb);
            self.precolor_stack_window(code, bb, &use_counts);
        }
    }

    /// Phi-at-entry rule. A leading phi and its inputs stay on the stack
    /// when every input is the top of its predecessor at the boundary and
    /// the block is entered only by a genuine fallthrough: a single
    /// predecessor whose unconditional `next0` edge lands here. Any
    /// conditional or joining entry disqualifies the phi and stops the
    /// sweep.
    fn precolor_entry_phis(&mut self, code: &Code, cfg: &Cfg, bb: BbId) {
        let single_fallthrough_entry = cfg.predecessors(bb).len() == 1 && {
            let pred = cfg.predecessors(bb)[0];
            let pb = &code.blocks[pred];
            pb.next1.is_none() && pb.next0 == Some(bb)
        };

        let mut pos = 1usize;
        for &id in &code.blocks[bb].instrs {
            if !code.instrs[id].is_phi() {
                break;
            }
            let args_in_right_order = single_fallthrough_entry
                && code.instrs[id]
                    .args
                    .iter()
                    .zip(&code.instrs[id].phi_preds)
                    .all(|(&arg, &pred)| {
                        let pb = &code.blocks[pred];
                        pb.next0 == Some(bb)
                            && pb.len() >= pos
                            && arg.as_instr() == Some(pb.instrs[pb.len() - pos])
                    });
            if !args_in_right_order {
                break;
            }
            for &arg in &code.instrs[id].args {
                let input = arg.as_instr().expect("matched phi input is an instruction");
                self.slots[input.index()] = Some(SlotNumber::Stack);
            }
            self.slots[id.index()] = Some(SlotNumber::Stack);
            pos += 1;
        }
    }

    /// In-block stack window. Simulates a stack while walking the block;
    /// single-use results are pushed, and an instruction whose arguments
    /// all appear in order in the window marks them as stack-resident.
    fn precolor_stack_window(&mut self, code: &Code, bb: BbId, use_counts: &[u32]) {
        let mut window: VecDeque<InstrId> = VecDeque::new();

        for &id in &code.blocks[bb].instrs {
            self.try_match_window(code, id, &mut window);

            let instr = &code.instrs[id];
            if self.slots[id.index()].is_none()
                && instr.has_result()
                && !instr.is_phi()
                && use_counts[id.index()] == 1
            {
                window.push_back(id);
            }
        }
    }

    /// Scan the window top-down for the argument sequence in reverse. On a
    /// full match, every argument becomes stack-resident, entries above the
    /// deepest match are popped, and mismatched entries in between are
    /// dropped (they fall back to local slots during coloring).
    fn try_match_window(&mut self, code: &Code, id: InstrId, window: &mut VecDeque<InstrId>) {
        let instr = &code.instrs[id];
        if instr.nargs() == 0 || window.len() < instr.nargs() {
            return;
        }

        let mut check = window.len();
        let mut new_size = window.len();
        let mut found_all = true;
        for arg in instr.args.iter().rev() {
            let target = arg.as_instr();
            while check > 0 && Some(window[check - 1]) != target {
                check -= 1;
                new_size -= 1;
            }
            if check == 0 {
                found_all = false;
            } else {
                check -= 1;
                new_size -= 1;
            }
        }
        if !found_all {
            return;
        }

        window.truncate(new_size);
        for arg in &instr.args {
            let input = arg.as_instr().expect("matched window entry is an instruction");
            self.slots[input.index()] = Some(SlotNumber::Stack);
        }
    }

    // ─── Local-slot coloring ────────────────────────────────────────

    fn color_locals(&mut self, code: &Code, dom: &DomTree, live: &Liveness) {
        // Values currently occupying each slot; index 0 stays unused.
        let mut occupants: Vec<Vec<InstrId>> = vec![Vec::new()];

        let slot_available =
            |occupants: &[Vec<InstrId>], slot: usize, v: InstrId, live: &Liveness| {
                occupants
                    .get(slot)
                    .is_none_or(|o| o.iter().all(|&other| !live.interfere(other, v)))
            };

        let assign = |occupants: &mut Vec<Vec<InstrId>>,
                      slots: &mut Vec<Option<SlotNumber>>,
                      local_count: &mut u32,
                      slot: usize,
                      v: InstrId| {
            while occupants.len() <= slot {
                occupants.push(Vec::new());
            }
            occupants[slot].push(v);
            slots[v.index()] = Some(SlotNumber::Local(slot as u32));
            *local_count = (*local_count).max(slot as u32);
        };

        // Coalesce each remaining phi with all of its inputs onto the first
        // slot free for the whole group.
        for bb in breadth_first(code) {
            for &id in &code.blocks[bb].instrs {
                let instr = &code.instrs[id];
                if !instr.is_phi() || self.slots[id.index()].is_some() {
                    continue;
                }
                let mut slot = 1usize;
                loop {
                    let group_fits = slot_available(&occupants, slot, id, live)
                        && instr.args.iter().all(|arg| {
                            let input = arg
                                .as_instr()
                                .expect("phi input is a copy after conversion");
                            slot_available(&occupants, slot, input, live)
                        });
                    if group_fits {
                        break;
                    }
                    slot += 1;
                }
                assign(&mut occupants, &mut self.slots, &mut self.local_count, slot, id);
                for i in 0..code.instrs[id].args.len() {
                    let input = code.instrs[id].args[i]
                        .as_instr()
                        .expect("phi input is a copy after conversion");
                    assign(
                        &mut occupants,
                        &mut self.slots,
                        &mut self.local_count,
                        slot,
                        input,
                    );
                }
            }
        }

        // Dominance-preorder eager coloring of everything else. Phi inputs
        // are gone already, so a value's slot is free along the whole
        // dominated region once taken.
        for bb in dom.preorder() {
            for &id in &code.blocks[bb].instrs {
                if self.slots[id.index()].is_some() || !live.has_interval(id) {
                    continue;
                }

                // Reuse the first argument's slot when possible, to turn a
                // load/store pair into a slot overwrite.
                let hint = code.instrs[id].args.first().and_then(|arg| {
                    arg.as_instr().and_then(|o| match self.slots[o.index()] {
                        Some(SlotNumber::Local(n)) => Some(n as usize),
                        _ => None,
                    })
                });

                let slot = match hint {
                    Some(h) if slot_available(&occupants, h, id, live) => h,
                    _ => {
                        let mut s = 1usize;
                        while !slot_available(&occupants, s, id, live) {
                            s += 1;
                        }
                        s
                    }
                };
                assign(&mut occupants, &mut self.slots, &mut self.local_count, slot, id);
            }
        }
    }

    // ─── Dump ───────────────────────────────────────────────────────

    /// Allocation listing in block order, with dead values and the slot
    /// count at the end.
    pub fn dump(&self, code: &Code) -> String {
        use std::fmt::Write;
        let mut out = String::new();
        writeln!(out, "======= allocation ======").unwrap();
        for bb in breadth_first(code) {
            write!(out, "bb{}:", bb.index()).unwrap();
            for &id in &code.blocks[bb].instrs {
                match self.slots[id.index()] {
                    Some(SlotNumber::Stack) => write!(out, " %{}@s", id.index()).unwrap(),
                    Some(SlotNumber::Local(n)) => {
                        write!(out, " %{}@{}", id.index(), n).unwrap()
                    }
                    None => {}
                }
            }
            writeln!(out).unwrap();
        }
        write!(out, "dead:").unwrap();
        for bb in breadth_first(code) {
            for &id in &code.blocks[bb].instrs {
                if self.slots[id.index()].is_none() {
                    write!(out, " %{}", id.index()).unwrap();
                }
            }
        }
        writeln!(out).unwrap();
        writeln!(out, "slots: {}", self.local_count).unwrap();
        writeln!(out, "======= end allocation ==").unwrap();
        out
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
