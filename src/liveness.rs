//! Backward liveness analysis over SSA values.
//!
//! Worklist-driven fixed point starting from the exit blocks. For every
//! instruction result we record, per basic block, whether it is live there
//! and the `[begin, end]` position range it covers. `begin` is the definition
//! position (0 for live-through), `end` the last use position (the block
//! length for live-out).
//!
//! Phi inputs are special: their liveness propagates only toward the
//! predecessor block they flow in from (and blocks between that predecessor
//! and the phi), not into every predecessor.

use std::collections::{BTreeMap, BTreeSet};

use crate::cfg::Cfg;
use crate::ir::{BbId, Code, InstrId, Value};

/// Live range of one value within one basic block.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BbLiveness {
    pub live: bool,
    pub begin: u32,
    pub end: u32,
}

/// Per-value, per-block liveness intervals.
pub struct Liveness {
    /// Indexed by instruction, then by block id. `None` means the value is
    /// never used and needs no storage.
    intervals: Vec<Option<Vec<BbLiveness>>>,
    nbbs: usize,
}

impl Liveness {
    /// Values without an interval are dead; the emitter pops their results.
    pub fn has_interval(&self, id: InstrId) -> bool {
        self.intervals[id.index()].is_some()
    }

    /// The live range of `id` inside `bb`, if the value has intervals at all.
    pub fn record(&self, id: InstrId, bb: BbId) -> Option<BbLiveness> {
        self.intervals[id.index()]
            .as_ref()
            .map(|ranges| ranges[bb.index()])
    }

    /// Two values interfere iff some block holds both live with overlapping
    /// ranges. Equal `begin` positions always interfere: two definitions at
    /// one position need two slots.
    pub fn interfere(&self, a: InstrId, b: InstrId) -> bool {
        let ra = self.intervals[a.index()]
            .as_ref()
            .unwrap_or_else(|| panic!("no liveness interval for {a:?}"));
        let rb = self.intervals[b.index()]
            .as_ref()
            .unwrap_or_else(|| panic!("no liveness interval for {b:?}"));
        for bb in 0..self.nbbs {
            let mine = &ra[bb];
            let their = &rb[bb];
            if mine.live
                && their.live
                && (mine.begin == their.begin
                    || (mine.begin < their.begin && mine.end >= their.begin)
                    || (mine.begin > their.begin && their.end >= mine.begin))
            {
                return true;
            }
        }
        false
    }

    /// Human-readable interval listing, used by the liveness trace flag.
    pub fn dump(&self) -> String {
        use std::fmt::Write;
        let mut out = String::new();
        writeln!(out, "======= liveness ========").unwrap();
        for (idx, ranges) in self.intervals.iter().enumerate() {
            let Some(ranges) = ranges else { continue };
            write!(out, "%{idx} is live :").unwrap();
            for (bb, r) in ranges.iter().enumerate() {
                if r.live {
                    write!(out, " bb{bb} [{},{}]", r.begin, r.end).unwrap();
                }
            }
            writeln!(out).unwrap();
        }
        writeln!(out, "======= end liveness ====").unwrap();
        out
    }
}

/// Compute liveness for `code`. `trace` prints the resulting intervals.
pub fn compute(code: &Code, cfg: &Cfg, trace: bool) -> Liveness {
    let nbbs = code.next_bb_id();
    let mut intervals: Vec<Option<Vec<BbLiveness>>> = vec![None; code.instrs.len()];
    let mut live_at_end: Vec<Option<BTreeSet<InstrId>>> = vec![None; nbbs];

    let mut todo: BTreeSet<BbId> = cfg.exits().iter().copied().collect();

    while let Some(&bb) = todo.iter().next() {
        todo.remove(&bb);
        let block = &code.blocks[bb];
        let block_size = block.len() as u32;

        // Values live somewhere below the current walk position.
        let mut accumulated: BTreeSet<InstrId> = BTreeSet::new();
        // Phi inputs, keyed by the predecessor block they flow in from.
        let mut accumulated_phi: BTreeMap<BbId, BTreeSet<InstrId>> = BTreeMap::new();

        // Mark all (backwards) incoming live values.
        if let Some(live_out) = &live_at_end[bb.index()] {
            for &v in live_out {
                let ranges = intervals[v.index()]
                    .as_mut()
                    .expect("live-out value has an interval record");
                let r = &mut ranges[bb.index()];
                if !r.live || r.end < block_size {
                    r.live = true;
                    r.end = block_size;
                    accumulated.insert(v);
                }
            }
        }

        // Walk the block in reverse.
        for pos in (0..block.len()).rev() {
            let id = block.instrs[pos];
            let instr = &code.instrs[id];

            // First time an argument is seen in this block: record the use
            // position as the end of its range.
            let mark_if_not_seen = |intervals: &mut Vec<Option<Vec<BbLiveness>>>,
                                    v: InstrId|
             -> bool {
                let ranges = intervals[v.index()]
                    .get_or_insert_with(|| vec![BbLiveness::default(); nbbs]);
                let r = &mut ranges[bb.index()];
                if !r.live {
                    r.live = true;
                    r.end = pos as u32;
                    return true;
                }
                false
            };

            if instr.is_phi() {
                for (&arg, &pred) in instr.args.iter().zip(&instr.phi_preds) {
                    if let Value::Instr(v) = arg
                        && mark_if_not_seen(&mut intervals, v)
                    {
                        accumulated_phi.entry(pred).or_default().insert(v);
                    }
                }
            } else {
                for &arg in &instr.args {
                    if let Value::Instr(v) = arg
                        && mark_if_not_seen(&mut intervals, v)
                    {
                        accumulated.insert(v);
                    }
                }
            }

            // The definition closes the range.
            if accumulated.remove(&id) {
                let ranges = intervals[id.index()]
                    .as_mut()
                    .expect("accumulated value has an interval record");
                ranges[bb.index()].begin = pos as u32;
            }
        }

        // Whatever survived the walk is live into the block.
        for &v in accumulated.iter().chain(accumulated_phi.values().flatten()) {
            let ranges = intervals[v.index()]
                .as_mut()
                .expect("live-in value has an interval record");
            let r = &mut ranges[bb.index()];
            debug_assert!(r.live);
            r.begin = 0;
        }

        // Merge live-in values into every predecessor's live-out. Phi inputs
        // go only to their own predecessor chain.
        let merge = |live_at_end: &mut Vec<Option<BTreeSet<InstrId>>>,
                     todo: &mut BTreeSet<BbId>,
                     into: BbId,
                     live: &BTreeSet<InstrId>| {
            let out = live_at_end[into.index()].get_or_insert_with(BTreeSet::new);
            if !live.is_subset(out) {
                out.extend(live);
                todo.insert(into);
            }
        };

        for &pred in cfg.predecessors(bb) {
            let first_time = live_at_end[pred.index()].is_none();
            merge(&mut live_at_end, &mut todo, pred, &accumulated);
            if first_time {
                todo.insert(pred);
            }
            for (&in_bb, live) in &accumulated_phi {
                if pred == in_bb || cfg.is_predecessor(in_bb, pred) {
                    merge(&mut live_at_end, &mut todo, pred, live);
                }
            }
        }
    }

    let liveness = Liveness { intervals, nbbs };
    if trace {
        print!("{}", liveness.dump());
    }
    liveness
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{CodeBuilder, Id, Tag, Ty};

    fn bb(i: u32) -> BbId {
        Id::new(i)
    }

    fn instr(i: u32) -> InstrId {
        Id::new(i)
    }

    #[test]
    fn straight_line_ranges() {
        // %0 = ldarg 0; %1 = ldarg 1; %2 = add %0 %1; ret %2
        let mut b = CodeBuilder::new();
        let entry = b.entry();
        let x = b.push(entry, Tag::LdArg { index: 0 }, &[]);
        let y = b.push(entry, Tag::LdArg { index: 1 }, &[]);
        let sum = b.push(entry, Tag::Add, &[x, y]);
        b.ret(entry, sum);
        let code = b.finish();

        let cfg = Cfg::compute(&code);
        let live = compute(&code, &cfg, false);

        let r0 = live.record(instr(0), bb(0)).unwrap();
        assert_eq!((r0.live, r0.begin, r0.end), (true, 0, 2));
        let r2 = live.record(instr(2), bb(0)).unwrap();
        assert_eq!((r2.live, r2.begin, r2.end), (true, 2, 3));
    }

    #[test]
    fn disjoint_ranges_do_not_interfere() {
        // A chain of single-use values: each dies exactly where the next is
        // defined, so only adjacent pairs interfere.
        let mut b = CodeBuilder::new();
        let entry = b.entry();
        let x = b.push(entry, Tag::LdArg { index: 0 }, &[]);
        let f = b.push(entry, Tag::Force, &[x]);
        let g = b.push(entry, Tag::Inc, &[f]);
        b.ret(entry, g);
        let code = b.finish();

        let cfg = Cfg::compute(&code);
        let live = compute(&code, &cfg, false);

        // x: [0,1], f: [1,2], g: [2,3]
        assert!(live.interfere(instr(0), instr(1)), "producer/consumer overlap");
        assert!(!live.interfere(instr(0), instr(2)), "x is dead before g exists");
    }

    #[test]
    fn arguments_of_one_consumer_interfere() {
        let mut b = CodeBuilder::new();
        let entry = b.entry();
        let x = b.push(entry, Tag::LdArg { index: 0 }, &[]);
        let y = b.push(entry, Tag::LdArg { index: 1 }, &[]);
        let sum = b.push(entry, Tag::Add, &[x, y]);
        b.ret(entry, sum);
        let code = b.finish();

        let cfg = Cfg::compute(&code);
        let live = compute(&code, &cfg, false);
        // Both arguments stay live up to the add, so they can never share a
        // slot.
        assert!(live.interfere(instr(0), instr(1)));
    }

    #[test]
    fn dead_result_has_no_interval() {
        let mut b = CodeBuilder::new();
        let entry = b.entry();
        let x = b.push(entry, Tag::LdArg { index: 0 }, &[]);
        let _unused = b.push(entry, Tag::LdArg { index: 1 }, &[]);
        b.ret(entry, x);
        let code = b.finish();

        let cfg = Cfg::compute(&code);
        let live = compute(&code, &cfg, false);
        assert!(live.has_interval(instr(0)));
        assert!(!live.has_interval(instr(1)));
    }

    #[test]
    fn value_live_through_a_branch_arm() {
        // x defined in entry, used in the merge: live through both arms.
        let mut b = CodeBuilder::new();
        let entry = b.entry();
        let b1 = b.add_block();
        let b2 = b.add_block();
        let merge = b.add_block();
        let x = b.push(entry, Tag::LdArg { index: 0 }, &[]);
        let c = b.push(entry, Tag::LdArg { index: 1 }, &[]);
        b.branch(entry, c, b1, b2);
        b.goto(b1, merge);
        b.goto(b2, merge);
        let r = b.push(merge, Tag::Force, &[x]);
        b.ret(merge, r);
        let code = b.finish();

        let cfg = Cfg::compute(&code);
        let live = compute(&code, &cfg, false);

        for arm in [bb(1), bb(2)] {
            let r = live.record(instr(0), arm).unwrap();
            assert!(r.live, "x live through bb{}", arm.index());
            assert_eq!(r.begin, 0);
            assert_eq!(r.end, 0, "live-out of an empty block spans its size");
        }
        let r = live.record(instr(0), bb(3)).unwrap();
        assert_eq!((r.begin, r.end), (0, 0));
    }

    #[test]
    fn phi_inputs_propagate_only_to_their_predecessor() {
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

        let cfg = Cfg::compute(&code);
        let live = compute(&code, &cfg, false);

        let x_id = instr(1);
        let y_id = instr(2);
        // x lives in b1 only; it must not leak into b2.
        assert!(live.record(x_id, bb(1)).unwrap().live);
        assert!(!live.record(x_id, bb(2)).unwrap().live);
        assert!(!live.record(y_id, bb(1)).unwrap().live);
        // Phi inputs never interfere with each other at the merge.
        assert!(!live.interfere(x_id, y_id));
    }

    #[test]
    fn loop_phi_is_live_around_the_back_edge() {
        let mut b = CodeBuilder::new();
        let entry = b.entry();
        let header = b.add_block();
        let exit = b.add_block();
        let init = b.push(entry, Tag::LdArg { index: 0 }, &[]);
        b.goto(entry, header);
        let phi = b.phi(header, Ty::Val, &[(entry, init)]);
        let next = b.push(header, Tag::Inc, &[phi]);
        let c = b.push(header, Tag::AsBool, &[next]);
        b.branch(header, c, header, exit);
        b.ret(exit, next);
        let mut code = b.finish();
        let phi_id = phi.as_instr().unwrap();
        code.instrs[phi_id].args.push(next);
        code.instrs[phi_id].phi_preds.push(header);

        let cfg = Cfg::compute(&code);
        let live = compute(&code, &cfg, false);

        // `next` is live out of the header (back edge + exit use).
        let next_id = next.as_instr().unwrap();
        let r = live.record(next_id, bb(1)).unwrap();
        assert!(r.live);
        assert_eq!(r.end, code.blocks[bb(1)].len() as u32);
        // The phi interferes with `next` inside the header.
        assert!(live.interfere(phi_id, next_id));
    }
}
