//! Flat-op backend.
//!
//! Every combinational assignment is lowered, in schedule order, into one
//! stream of [`FlatOp`]s whose operands are pre-resolved net, temp or
//! constant indices. Each block owns a contiguous run of the stream, and a
//! settle drains dirty blocks exactly like the interpreter does. Clocked
//! assignments live in a second stream that only stages writes.

use std::ops::Range;
use std::sync::Arc;

use log::{debug, trace};

use crate::backend::{Backend, Simulate};
use crate::config::SimConfig;
use crate::elaborate::Netlist;
use crate::error::Result;
use crate::ir::{Assign, BinaryOp, Expr, UnaryOp};
use crate::lifecycle::{Lifecycle, SimState};
use crate::schedule::{drain, DirtySet, Schedule};
use crate::store::{SignalStore, WriteOp};
use crate::value::{mask, sign_extend, Bits};

/// Operand source
#[derive(Debug, Clone, Copy)]
pub enum Operand {
    Signal(usize),
    Immediate(u64),
    Temp(usize),
    /// Constant too wide for an inline immediate.
    Pool(usize),
}

#[derive(Debug, Clone, Copy)]
pub struct FlatOp {
    pub op_type: u8,
    pub dst: usize,
    pub arg0: u64,
    pub arg1: u64,
    pub arg2: u64,
}

pub const OP_MUX: u8 = 0;
pub const OP_SLICE: u8 = 1;
pub const OP_CONCAT_INIT: u8 = 2;
pub const OP_CONCAT_ACCUM: u8 = 3;
pub const OP_CONCAT_FINISH: u8 = 4;
pub const OP_RESIZE: u8 = 5;
pub const OP_SEXT: u8 = 6;
pub const OP_STORE: u8 = 7;
pub const OP_STORE_NEXT: u8 = 8;
/// `OP_UNARY + op as u8`
pub const OP_UNARY: u8 = 16;
/// `OP_BINARY + op as u8`
pub const OP_BINARY: u8 = 32;

const TAG_SIGNAL: u64 = 0;
const TAG_IMMEDIATE: u64 = 1 << 62;
const TAG_TEMP: u64 = 2 << 62;
const TAG_POOL: u64 = 3 << 62;
const TAG_MASK: u64 = 3 << 62;
const VAL_MASK: u64 = !(3u64 << 62);

impl FlatOp {
    #[inline(always)]
    pub fn encode_operand(op: Operand) -> u64 {
        match op {
            Operand::Signal(idx) => TAG_SIGNAL | (idx as u64),
            Operand::Immediate(val) => TAG_IMMEDIATE | (val & VAL_MASK),
            Operand::Temp(idx) => TAG_TEMP | (idx as u64),
            Operand::Pool(idx) => TAG_POOL | (idx as u64),
        }
    }

    #[inline(always)]
    pub fn get_operand(signals: &[u64], temps: &[u64], pool: &[u64], encoded: u64) -> u64 {
        let val = encoded & VAL_MASK;
        match encoded & TAG_MASK {
            TAG_SIGNAL => signals[val as usize],
            TAG_IMMEDIATE => val,
            TAG_TEMP => temps[val as usize],
            _ => pool[val as usize],
        }
    }
}

#[derive(Default)]
struct Lowering {
    ops: Vec<FlatOp>,
    pool: Vec<u64>,
    temp: usize,
    max_temps: usize,
}

impl Lowering {
    fn next_temp(&mut self) -> usize {
        let t = self.temp;
        self.temp += 1;
        self.max_temps = self.max_temps.max(self.temp);
        t
    }

    fn constant(&mut self, value: u64) -> Operand {
        if value <= VAL_MASK {
            Operand::Immediate(value)
        } else {
            self.pool.push(value);
            Operand::Pool(self.pool.len() - 1)
        }
    }

    fn push(&mut self, op_type: u8, dst: usize, arg0: u64, arg1: u64, arg2: u64) {
        self.ops.push(FlatOp { op_type, dst, arg0, arg1, arg2 });
    }

    fn expr(&mut self, expr: &Expr) -> Operand {
        match expr {
            Expr::Signal { id, .. } => Operand::Signal(id.0),
            Expr::Literal { value, width } => self.constant(value & mask(*width)),
            Expr::Unary { op, operand, width } => {
                let src = self.expr(operand);
                let dst = self.next_temp();
                let op_type = OP_UNARY + *op as u8;
                self.push(
                    op_type,
                    dst,
                    FlatOp::encode_operand(src),
                    mask(operand.width()),
                    mask(*width),
                );
                Operand::Temp(dst)
            }
            Expr::Binary { op, left, right, width } => {
                let l = self.expr(left);
                let r = self.expr(right);
                let dst = self.next_temp();
                let op_type = OP_BINARY + *op as u8;
                self.push(
                    op_type,
                    dst,
                    FlatOp::encode_operand(l),
                    FlatOp::encode_operand(r),
                    mask(*width),
                );
                Operand::Temp(dst)
            }
            Expr::Mux { cond, when_true, when_false, .. } => {
                let c = self.expr(cond);
                let t = self.expr(when_true);
                let f = self.expr(when_false);
                let dst = self.next_temp();
                self.push(
                    OP_MUX,
                    dst,
                    FlatOp::encode_operand(c),
                    FlatOp::encode_operand(t),
                    FlatOp::encode_operand(f),
                );
                Operand::Temp(dst)
            }
            Expr::Slice { base, low, width } => {
                let src = self.expr(base);
                let dst = self.next_temp();
                self.push(OP_SLICE, dst, FlatOp::encode_operand(src), *low as u64, mask(*width));
                Operand::Temp(dst)
            }
            Expr::Concat { parts, width } => {
                let dst = self.next_temp();
                self.push(OP_CONCAT_INIT, dst, 0, 0, 0);
                let mut shift = 0u64;
                for part in parts.iter().rev() {
                    let src = self.expr(part);
                    self.push(
                        OP_CONCAT_ACCUM,
                        dst,
                        FlatOp::encode_operand(src),
                        shift,
                        mask(part.width()),
                    );
                    shift += part.width() as u64;
                }
                self.push(OP_CONCAT_FINISH, dst, 0, 0, mask(*width));
                Operand::Temp(dst)
            }
            Expr::Zext { expr, width } => {
                let src = self.expr(expr);
                let dst = self.next_temp();
                self.push(OP_RESIZE, dst, FlatOp::encode_operand(src), 0, mask(*width));
                Operand::Temp(dst)
            }
            Expr::Sext { expr, width } => {
                let src = self.expr(expr);
                let dst = self.next_temp();
                self.push(
                    OP_SEXT,
                    dst,
                    FlatOp::encode_operand(src),
                    expr.width() as u64,
                    mask(*width),
                );
                Operand::Temp(dst)
            }
        }
    }

    fn assign(&mut self, netlist: &Netlist, assign: &Assign, store_op: u8) {
        self.temp = 0;
        let src = self.expr(&assign.expr);
        let net = assign.target.signal.0;
        let (shift, m) = assign.target.placement(netlist.width(net));
        self.push(store_op, net, FlatOp::encode_operand(src), shift as u64, m);
    }
}

#[inline(always)]
fn execute(signals: &mut [u64], temps: &mut [u64], pool: &[u64], op: &FlatOp) {
    macro_rules! get {
        ($signals:expr, $temps:expr, $encoded:expr) => {
            FlatOp::get_operand($signals, $temps, pool, $encoded)
        };
    }
    match op.op_type {
        OP_STORE => {
            let v = get!(signals, temps, op.arg0);
            let cur = signals[op.dst];
            signals[op.dst] = (cur & !op.arg2) | ((v << op.arg1) & op.arg2);
        }
        OP_MUX => {
            let c = get!(signals, temps, op.arg0);
            temps[op.dst] = if c != 0 {
                get!(signals, temps, op.arg1)
            } else {
                get!(signals, temps, op.arg2)
            };
        }
        OP_SLICE => {
            temps[op.dst] = (get!(signals, temps, op.arg0) >> op.arg1) & op.arg2;
        }
        OP_CONCAT_INIT => {
            temps[op.dst] = 0;
        }
        OP_CONCAT_ACCUM => {
            let part = get!(signals, temps, op.arg0) & op.arg2;
            if op.arg1 < 64 {
                temps[op.dst] |= part << op.arg1;
            }
        }
        OP_CONCAT_FINISH => {
            temps[op.dst] &= op.arg2;
        }
        OP_RESIZE => {
            temps[op.dst] = get!(signals, temps, op.arg0) & op.arg2;
        }
        OP_SEXT => {
            let v = get!(signals, temps, op.arg0);
            temps[op.dst] = sign_extend(v, op.arg1 as usize) & op.arg2;
        }
        t if t >= OP_BINARY => {
            let l = get!(signals, temps, op.arg0);
            let r = get!(signals, temps, op.arg1);
            temps[op.dst] = BinaryOp::ALL[(t - OP_BINARY) as usize].apply(l, r, op.arg2);
        }
        t if t >= OP_UNARY => {
            let v = get!(signals, temps, op.arg0);
            temps[op.dst] = UnaryOp::ALL[(t - OP_UNARY) as usize].apply(v, op.arg1, op.arg2);
        }
        _ => {}
    }
}

pub struct CompiledSimulator {
    netlist: Arc<Netlist>,
    schedule: Arc<Schedule>,
    comb_ops: Vec<FlatOp>,
    /// Slice of `comb_ops` belonging to each combinational block.
    block_ops: Vec<Range<usize>>,
    sample_ops: Vec<FlatOp>,
    pool: Vec<u64>,
    temps: Vec<u64>,
    store: SignalStore,
    dirty: DirtySet,
    max_settle_evals: usize,
    lifecycle: Lifecycle,
}

impl CompiledSimulator {
    pub fn new(netlist: Arc<Netlist>, schedule: Arc<Schedule>, config: &SimConfig) -> Self {
        let mut comb = Lowering::default();
        let mut block_ops = vec![0..0; netlist.comb.len()];
        for &b in schedule.order() {
            let start = comb.ops.len();
            for assign in &netlist.comb[b].assigns {
                comb.assign(&netlist, assign, OP_STORE);
            }
            block_ops[b] = start..comb.ops.len();
        }
        let comb_ops = std::mem::take(&mut comb.ops);
        // share the constant pool and temp sizing
        let mut lowering = comb;
        for block in &netlist.clocked {
            for assign in &block.assigns {
                lowering.assign(&netlist, assign, OP_STORE_NEXT);
            }
        }
        debug!(
            "compiled {} combinational and {} clocked ops ({} temps)",
            comb_ops.len(),
            lowering.ops.len(),
            lowering.max_temps
        );
        let store = SignalStore::new(&netlist);
        let dirty = DirtySet::new(schedule.block_count());
        Self {
            netlist,
            schedule,
            comb_ops,
            block_ops,
            sample_ops: lowering.ops,
            pool: lowering.pool,
            temps: vec![0; lowering.max_temps.max(1)],
            store,
            dirty,
            max_settle_evals: config.max_settle_evals,
            lifecycle: Lifecycle::new(SimState::Elaborated),
        }
    }

    pub fn op_count(&self) -> usize {
        self.comb_ops.len() + self.sample_ops.len()
    }

    fn settle(&mut self) -> Result<()> {
        let (ops, ranges, pool, temps) = (&self.comb_ops, &self.block_ops, &self.pool, &mut self.temps);
        let evals = drain(
            &mut self.dirty,
            &self.schedule,
            &self.netlist,
            &mut self.store.values,
            self.max_settle_evals,
            |b, values| {
                for op in &ops[ranges[b].clone()] {
                    execute(values, temps, pool, op);
                }
            },
        )?;
        trace!("settled after {} block evaluations", evals);
        Ok(())
    }

    fn step(&mut self) -> Result<()> {
        self.settle()?;
        self.sample();
        for net in self.store.commit() {
            self.dirty.mark_readers(&self.schedule, net, None);
        }
        self.store.ncycles += 1;
        self.settle()
    }

    fn sample(&mut self) {
        for op in &self.sample_ops {
            if op.op_type == OP_STORE_NEXT {
                let v = FlatOp::get_operand(&self.store.values, &self.temps, &self.pool, op.arg0);
                self.store.stage(op.dst, (v << op.arg1) & op.arg2, op.arg2);
            } else {
                execute(&mut self.store.values, &mut self.temps, &self.pool, op);
            }
        }
    }

    fn external(
        &mut self,
        op: &'static str,
        path: &str,
        range: Option<(usize, usize)>,
        value: u64,
        next: bool,
    ) -> Result<()> {
        self.lifecycle.write(op)?;
        let write = WriteOp::resolve(&self.netlist, path, range, value)?;
        if next {
            self.store.write_next(&write);
        } else if self.store.write_now(&write) {
            self.dirty.mark_readers(&self.schedule, write.net, None);
        }
        Ok(())
    }
}

impl Simulate for CompiledSimulator {
    fn backend(&self) -> Backend {
        Backend::Compiled
    }

    fn state(&self) -> SimState {
        self.lifecycle.state()
    }

    fn elaborate(&mut self) -> Result<()> {
        self.lifecycle.elaborate()
    }

    fn reset(&mut self) -> Result<()> {
        self.lifecycle.reset()?;
        self.store.reset(&self.netlist);
        self.dirty.clear();
        self.dirty.mark_all(&self.schedule);
        let result = self.settle();
        self.lifecycle.guard(result)?;
        self.lifecycle.enter(SimState::Reset);
        Ok(())
    }

    fn cycle(&mut self) -> Result<()> {
        self.lifecycle.cycle()?;
        let result = self.step();
        self.lifecycle.guard(result)?;
        self.lifecycle.enter(SimState::Running);
        Ok(())
    }

    fn evaluate(&mut self) -> Result<()> {
        self.lifecycle.evaluate()?;
        let result = self.settle();
        self.lifecycle.guard(result)
    }

    fn read(&self, path: &str) -> Result<Bits> {
        self.lifecycle.observe("read")?;
        let net = self.netlist.net(path)?;
        Ok(Bits::from_raw(self.netlist.width(net), self.store.values[net]))
    }

    fn write(&mut self, path: &str, value: u64) -> Result<()> {
        self.external("write", path, None, value, false)
    }

    fn write_next(&mut self, path: &str, value: u64) -> Result<()> {
        self.external("write_next", path, None, value, true)
    }

    fn write_slice(&mut self, path: &str, lo: usize, hi: usize, value: u64) -> Result<()> {
        self.external("write_slice", path, Some((lo, hi)), value, false)
    }

    fn write_slice_next(&mut self, path: &str, lo: usize, hi: usize, value: u64) -> Result<()> {
        self.external("write_slice_next", path, Some((lo, hi)), value, true)
    }

    fn ncycles(&self) -> u64 {
        self.store.ncycles
    }

    fn port_names(&self) -> Vec<String> {
        self.netlist.port_names().to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::elaborate::elaborate;
    use crate::model::Design;

    fn compile(d: &Design) -> CompiledSimulator {
        let nl = elaborate(d).unwrap();
        let s = Schedule::build(&nl).unwrap();
        CompiledSimulator::new(Arc::new(nl), Arc::new(s), &SimConfig::default())
    }

    #[test]
    fn test_operand_encoding() {
        let signals = [7u64, 9];
        let temps = [3u64];
        let pool = [u64::MAX];
        for (op, expected) in [
            (Operand::Signal(1), 9),
            (Operand::Immediate(42), 42),
            (Operand::Temp(0), 3),
            (Operand::Pool(0), u64::MAX),
        ] {
            let enc = FlatOp::encode_operand(op);
            assert_eq!(FlatOp::get_operand(&signals, &temps, &pool, enc), expected);
        }
    }

    #[test]
    fn test_wide_literal_goes_to_pool() {
        let mut d = Design::new("wide");
        let root = d.root();
        let a = d.input(root, "a", 64).unwrap();
        let y = d.output(root, "y", 64).unwrap();
        let ea = d.sig(a);
        d.comb(root, "xor", vec![Assign::new(y, ea ^ Expr::lit(0xc000_0000_0000_0001, 64))]);
        let mut sim = compile(&d);
        sim.reset().unwrap();
        sim.write("a", 1).unwrap();
        sim.evaluate().unwrap();
        assert_eq!(sim.read("y").unwrap().value(), 0xc000_0000_0000_0000);
        assert_eq!(sim.pool.len(), 1);
    }

    #[test]
    fn test_counter_with_slice_store() {
        let mut d = Design::new("count");
        let root = d.root();
        let q = d.reg(root, "q", 4, 0).unwrap();
        let y = d.output(root, "y", 8).unwrap();
        let eq = d.sig(q);
        d.clocked(root, "inc", vec![Assign::new(q, eq.clone() + Expr::lit(1, 4))]);
        d.comb(
            root,
            "view",
            vec![Assign::new(y, Expr::lit(0xa0, 8)), Assign::slice(y, 0, 4, eq)],
        );
        let mut sim = compile(&d);
        assert!(matches!(sim.cycle(), Err(crate::error::SimError::InvalidState { .. })));
        sim.reset().unwrap();
        assert_eq!(sim.read("y").unwrap().value(), 0xa0);
        for _ in 0..17 {
            sim.cycle().unwrap();
        }
        assert_eq!(sim.read("q").unwrap().value(), 1);
        assert_eq!(sim.read("y").unwrap().value(), 0xa1);
        assert_eq!(sim.ncycles(), 17);
    }

    #[test]
    fn test_settle_limit_halts() {
        let mut d = Design::new("chain");
        let root = d.root();
        let a = d.input(root, "a", 8).unwrap();
        let t = d.wire(root, "t", 8).unwrap();
        let y = d.output(root, "y", 8).unwrap();
        let (ea, et) = (d.sig(a), d.sig(t));
        d.comb(root, "first", vec![Assign::new(t, ea + Expr::lit(1, 8))]);
        d.comb(root, "second", vec![Assign::new(y, et + Expr::lit(1, 8))]);
        let nl = elaborate(&d).unwrap();
        let s = Arc::new(Schedule::build(&nl).unwrap());
        let nl = Arc::new(nl);

        let config = SimConfig::default().with_max_settle_evals(2);
        let mut sim = CompiledSimulator::new(Arc::clone(&nl), Arc::clone(&s), &config);
        sim.reset().unwrap();
        sim.write("a", 5).unwrap();
        sim.evaluate().unwrap();
        assert_eq!(sim.read("y").unwrap().value(), 7);

        let config = SimConfig::default().with_max_settle_evals(1);
        let mut sim = CompiledSimulator::new(nl, s, &config);
        assert_eq!(
            sim.reset(),
            Err(crate::error::SimError::NonConvergence { limit: 1, pending: vec!["second".to_string()] })
        );
        assert_eq!(sim.state(), SimState::Halted);
    }
}
