//! Combinational dependency graph and dirty-set draining.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, BinaryHeap};

use log::debug;

use crate::elaborate::{Block, Netlist};
use crate::error::{Result, SimError};
use crate::model::SignalId;
use crate::value::mask;

#[derive(Debug, Clone)]
pub struct Schedule {
    order: Vec<usize>,
    rank: Vec<usize>,
    readers: Vec<Vec<usize>>,
}

/// A block reading a signal it also writes is only acyclic when earlier
/// statements of the same block have already written every bit of it.
fn reads_own_output(netlist: &Netlist, block: &Block) -> bool {
    let mut written: BTreeMap<SignalId, u64> = BTreeMap::new();
    for assign in &block.assigns {
        let mut hit = false;
        assign.expr.for_each_signal(&mut |id| {
            let covered = written.get(&id).copied().unwrap_or(0);
            if block.writes.binary_search(&id).is_ok() && covered != mask(netlist.width(id.0)) {
                hit = true;
            }
        });
        if hit {
            return true;
        }
        let net = assign.target.signal;
        let (_, m) = assign.target.placement(netlist.width(net.0));
        *written.entry(net).or_insert(0) |= m;
    }
    false
}

impl Schedule {
    pub fn build(netlist: &Netlist) -> Result<Self> {
        let blocks = &netlist.comb;
        let mut writers: Vec<Vec<usize>> = vec![Vec::new(); netlist.nets.len()];
        let mut readers: Vec<Vec<usize>> = vec![Vec::new(); netlist.nets.len()];
        for (b, block) in blocks.iter().enumerate() {
            if reads_own_output(netlist, block) {
                return Err(SimError::CombinationalCycle { blocks: vec![block.name.clone()] });
            }
            for w in &block.writes {
                writers[w.0].push(b);
            }
            for r in &block.reads {
                readers[r.0].push(b);
            }
        }

        let mut succ: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); blocks.len()];
        for (b, block) in blocks.iter().enumerate() {
            for r in &block.reads {
                for &w in &writers[r.0] {
                    if w != b {
                        succ[w].insert(b);
                    }
                }
            }
        }
        let mut indegree = vec![0usize; blocks.len()];
        for next in &succ {
            for &b in next {
                indegree[b] += 1;
            }
        }

        let mut ready: BinaryHeap<Reverse<usize>> = indegree
            .iter()
            .enumerate()
            .filter(|(_, d)| **d == 0)
            .map(|(b, _)| Reverse(b))
            .collect();
        let mut order = Vec::with_capacity(blocks.len());
        while let Some(Reverse(b)) = ready.pop() {
            order.push(b);
            for &next in &succ[b] {
                indegree[next] -= 1;
                if indegree[next] == 0 {
                    ready.push(Reverse(next));
                }
            }
        }

        if order.len() < blocks.len() {
            let mut left: BTreeSet<usize> =
                (0..blocks.len()).filter(|b| indegree[*b] > 0).collect();
            // peel off blocks that are merely downstream of the loop
            loop {
                let sinks: Vec<usize> = left
                    .iter()
                    .copied()
                    .filter(|b| succ[*b].iter().all(|s| !left.contains(s)))
                    .collect();
                if sinks.is_empty() {
                    break;
                }
                for b in sinks {
                    left.remove(&b);
                }
            }
            return Err(SimError::CombinationalCycle {
                blocks: left.into_iter().map(|b| blocks[b].name.clone()).collect(),
            });
        }

        let mut rank = vec![0usize; blocks.len()];
        for (pos, &b) in order.iter().enumerate() {
            rank[b] = pos;
        }
        debug!("scheduled {} combinational blocks", order.len());
        Ok(Self { order, rank, readers })
    }

    /// Combinational block indices in evaluation order.
    pub fn order(&self) -> &[usize] {
        &self.order
    }

    pub fn readers(&self, net: usize) -> &[usize] {
        &self.readers[net]
    }

    pub fn rank(&self, block: usize) -> usize {
        self.rank[block]
    }

    pub fn block_count(&self) -> usize {
        self.order.len()
    }
}

/// Pending combinational blocks, drained lowest topological rank first.
#[derive(Debug, Clone)]
pub struct DirtySet {
    heap: BinaryHeap<Reverse<usize>>,
    queued: Vec<bool>,
}

impl DirtySet {
    pub fn new(blocks: usize) -> Self {
        Self { heap: BinaryHeap::new(), queued: vec![false; blocks] }
    }

    pub fn mark(&mut self, schedule: &Schedule, block: usize) {
        if !self.queued[block] {
            self.queued[block] = true;
            self.heap.push(Reverse(schedule.rank(block)));
        }
    }

    pub fn mark_readers(&mut self, schedule: &Schedule, net: usize, except: Option<usize>) {
        for &b in schedule.readers(net) {
            if Some(b) != except {
                self.mark(schedule, b);
            }
        }
    }

    pub fn mark_all(&mut self, schedule: &Schedule) {
        for b in 0..self.queued.len() {
            self.mark(schedule, b);
        }
    }

    pub fn pop(&mut self, schedule: &Schedule) -> Option<usize> {
        let Reverse(rank) = self.heap.pop()?;
        let block = schedule.order()[rank];
        self.queued[block] = false;
        Some(block)
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Pending blocks in drain order.
    pub fn pending(&self, schedule: &Schedule) -> Vec<usize> {
        let mut ranks: Vec<usize> = self.heap.iter().map(|Reverse(r)| *r).collect();
        ranks.sort_unstable();
        ranks.into_iter().map(|r| schedule.order()[r]).collect()
    }

    pub fn clear(&mut self) {
        self.heap.clear();
        self.queued.iter_mut().for_each(|q| *q = false);
    }
}

/// Drain `dirty` lowest rank first. `eval` runs one block against `values`;
/// the readers of every net it changed are queued behind it. Fails with
/// [`SimError::NonConvergence`] once `limit` evaluations have run and blocks
/// are still pending.
pub fn drain<F>(
    dirty: &mut DirtySet,
    schedule: &Schedule,
    netlist: &Netlist,
    values: &mut [u64],
    limit: usize,
    mut eval: F,
) -> Result<usize>
where
    F: FnMut(usize, &mut [u64]),
{
    let mut evals = 0usize;
    while !dirty.is_empty() {
        if evals >= limit {
            let pending = dirty
                .pending(schedule)
                .into_iter()
                .map(|b| netlist.comb[b].name.clone())
                .collect();
            return Err(SimError::NonConvergence { limit, pending });
        }
        let Some(b) = dirty.pop(schedule) else { break };
        evals += 1;
        let writes = &netlist.comb[b].writes;
        let before: Vec<u64> = writes.iter().map(|w| values[w.0]).collect();
        eval(b, values);
        for (w, old) in writes.iter().zip(before) {
            if values[w.0] != old {
                dirty.mark_readers(schedule, w.0, Some(b));
            }
        }
    }
    Ok(evals)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::elaborate::elaborate;
    use crate::ir::{Assign, Expr};
    use crate::model::Design;

    #[test]
    fn test_order_follows_dataflow() {
        let mut d = Design::new("top");
        let root = d.root();
        let a = d.input(root, "a", 8).unwrap();
        let b = d.wire(root, "b", 8).unwrap();
        let c = d.output(root, "c", 8).unwrap();
        let (eb, ea) = (d.sig(b), d.sig(a));
        // declared consumer first
        d.comb(root, "second", vec![Assign::new(c, eb + Expr::lit(1, 8))]);
        d.comb(root, "first", vec![Assign::new(b, ea)]);
        let nl = elaborate(&d).unwrap();
        let s = Schedule::build(&nl).unwrap();
        assert_eq!(s.order(), &[1, 0]);
        assert_eq!(s.rank(1), 0);
        assert_eq!(s.readers(nl.net("b").unwrap()), &[0]);
    }

    #[test]
    fn test_two_block_cycle_rejected() {
        let mut d = Design::new("top");
        let root = d.root();
        let x = d.wire(root, "x", 4).unwrap();
        let y = d.wire(root, "y", 4).unwrap();
        let z = d.output(root, "z", 4).unwrap();
        let (ex, ey) = (d.sig(x), d.sig(y));
        d.comb(root, "fwd", vec![Assign::new(y, ex.clone())]);
        d.comb(root, "back", vec![Assign::new(x, ey)]);
        d.comb(root, "tail", vec![Assign::new(z, ex)]);
        let nl = elaborate(&d).unwrap();
        match Schedule::build(&nl) {
            Err(SimError::CombinationalCycle { blocks }) => {
                assert_eq!(blocks, vec!["fwd".to_string(), "back".to_string()]);
            }
            other => panic!("expected CombinationalCycle, got {:?}", other),
        }
    }

    #[test]
    fn test_self_read_rules() {
        let mut d = Design::new("top");
        let root = d.root();
        let x = d.wire(root, "x", 4).unwrap();
        let ex = d.sig(x);
        d.comb(root, "loop", vec![Assign::new(x, ex + Expr::lit(1, 4))]);
        let nl = elaborate(&d).unwrap();
        assert!(matches!(Schedule::build(&nl), Err(SimError::CombinationalCycle { .. })));

        let mut d = Design::new("top");
        let root = d.root();
        let a = d.input(root, "a", 4).unwrap();
        let t = d.wire(root, "t", 4).unwrap();
        let o = d.output(root, "o", 4).unwrap();
        let (ea, et) = (d.sig(a), d.sig(t));
        d.comb(root, "seq", vec![Assign::new(t, ea), Assign::new(o, et + Expr::lit(1, 4))]);
        let nl = elaborate(&d).unwrap();
        assert!(Schedule::build(&nl).is_ok());
    }

    fn halves(cover_high: bool) -> Design {
        let mut d = Design::new("top");
        let root = d.root();
        let a = d.input(root, "a", 4).unwrap();
        let t = d.wire(root, "t", 4).unwrap();
        let o = d.output(root, "o", 4).unwrap();
        let (ea, et) = (d.sig(a), d.sig(t));
        let mut assigns = vec![Assign::slice(t, 0, 2, ea.clone().slice(0, 2))];
        if cover_high {
            assigns.push(Assign::slice(t, 2, 4, ea.slice(2, 4)));
        }
        assigns.push(Assign::new(o, et + Expr::lit(1, 4)));
        d.comb(root, "halves", assigns);
        d
    }

    #[test]
    fn test_self_read_after_slice_cover() {
        let nl = elaborate(&halves(true)).unwrap();
        assert!(Schedule::build(&nl).is_ok());

        let nl = elaborate(&halves(false)).unwrap();
        match Schedule::build(&nl) {
            Err(SimError::CombinationalCycle { blocks }) => assert_eq!(blocks, vec!["halves".to_string()]),
            other => panic!("expected CombinationalCycle, got {:?}", other),
        }
    }

    #[test]
    fn test_drain_stops_at_limit() {
        let mut d = Design::new("top");
        let root = d.root();
        let a = d.input(root, "a", 8).unwrap();
        let b = d.wire(root, "b", 8).unwrap();
        let c = d.output(root, "c", 8).unwrap();
        let (ea, eb) = (d.sig(a), d.sig(b));
        d.comb(root, "late", vec![Assign::new(c, eb)]);
        d.comb(root, "early", vec![Assign::new(b, ea + Expr::lit(1, 8))]);
        let nl = elaborate(&d).unwrap();
        let s = Schedule::build(&nl).unwrap();
        let mut values = vec![0u64; nl.nets.len()];
        let run = |b: usize, values: &mut [u64]| {
            for assign in &nl.comb[b].assigns {
                values[assign.target.signal.0] = assign.expr.eval(values);
            }
        };

        let mut dirty = DirtySet::new(s.block_count());
        dirty.mark_all(&s);
        assert_eq!(
            drain(&mut dirty, &s, &nl, &mut values, 1, run),
            Err(SimError::NonConvergence { limit: 1, pending: vec!["late".to_string()] })
        );

        let mut dirty = DirtySet::new(s.block_count());
        dirty.mark_all(&s);
        assert_eq!(drain(&mut dirty, &s, &nl, &mut values, 2, run), Ok(2));
        assert_eq!(values[nl.net("c").unwrap()], 1);
    }

    #[test]
    fn test_dirty_set_drains_in_rank_order() {
        let mut d = Design::new("top");
        let root = d.root();
        let a = d.input(root, "a", 8).unwrap();
        let b = d.wire(root, "b", 8).unwrap();
        let c = d.output(root, "c", 8).unwrap();
        let (ea, eb) = (d.sig(a), d.sig(b));
        d.comb(root, "late", vec![Assign::new(c, eb)]);
        d.comb(root, "early", vec![Assign::new(b, ea)]);
        let nl = elaborate(&d).unwrap();
        let s = Schedule::build(&nl).unwrap();
        let mut dirty = DirtySet::new(s.block_count());
        dirty.mark(&s, 0);
        dirty.mark(&s, 1);
        dirty.mark(&s, 0);
        assert_eq!(dirty.pending(&s), vec![1, 0]);
        assert_eq!(dirty.pop(&s), Some(1));
        assert_eq!(dirty.pop(&s), Some(0));
        assert!(dirty.pop(&s).is_none());
    }
}
