//! Interpreted simulation driver.
//!
//! Combinational blocks are re-run only when something they read changes,
//! drained in topological order. Clocked blocks all sample the settled
//! pre-edge state before any of their writes are committed.

use std::sync::Arc;

use log::{debug, trace};

use crate::backend::{Backend, Simulate};
use crate::config::SimConfig;
use crate::elaborate::{elaborate, Netlist};
use crate::error::{Result, SimError};
use crate::lifecycle::{Lifecycle, SimState};
use crate::model::Design;
use crate::schedule::{drain, DirtySet, Schedule};
use crate::store::{SignalStore, WriteOp};
use crate::value::Bits;

struct Engine {
    netlist: Arc<Netlist>,
    schedule: Arc<Schedule>,
    store: SignalStore,
    dirty: DirtySet,
}

impl Engine {
    fn new(netlist: Arc<Netlist>, schedule: Arc<Schedule>) -> Self {
        let store = SignalStore::new(&netlist);
        let dirty = DirtySet::new(schedule.block_count());
        Self { netlist, schedule, store, dirty }
    }

    fn settle(&mut self, limit: usize) -> Result<()> {
        let netlist = &self.netlist;
        let evals = drain(
            &mut self.dirty,
            &self.schedule,
            netlist,
            &mut self.store.values,
            limit,
            |b, values| {
                for assign in &netlist.comb[b].assigns {
                    let v = assign.expr.eval(values);
                    let net = assign.target.signal.0;
                    let (shift, m) = assign.target.placement(netlist.nets[net].width);
                    values[net] = (values[net] & !m) | ((v << shift) & m);
                }
            },
        )?;
        trace!("settled after {} block evaluations", evals);
        Ok(())
    }

    fn sample(&mut self) {
        for block in &self.netlist.clocked {
            for assign in &block.assigns {
                let v = assign.expr.eval(&self.store.values);
                let net = assign.target.signal.0;
                let (shift, m) = assign.target.placement(self.netlist.nets[net].width);
                self.store.stage(net, (v << shift) & m, m);
            }
        }
    }

    fn step(&mut self, limit: usize) -> Result<()> {
        self.settle(limit)?;
        self.sample();
        let changed = self.store.commit();
        for &net in &changed {
            self.dirty.mark_readers(&self.schedule, net, None);
        }
        self.store.ncycles += 1;
        trace!("cycle {}: {} nets changed at the edge", self.store.ncycles, changed.len());
        self.settle(limit)
    }

    fn reset(&mut self, limit: usize) -> Result<()> {
        self.store.reset(&self.netlist);
        self.dirty.clear();
        self.dirty.mark_all(&self.schedule);
        self.settle(limit)
    }
}

pub struct Simulator {
    design: Option<Design>,
    config: SimConfig,
    lifecycle: Lifecycle,
    engine: Option<Engine>,
}

impl Simulator {
    pub fn new(design: Design, config: SimConfig) -> Self {
        Self {
            design: Some(design),
            config,
            lifecycle: Lifecycle::new(SimState::Unelaborated),
            engine: None,
        }
    }

    /// An already elaborated simulator over a shared netlist.
    pub fn from_netlist(netlist: Arc<Netlist>, schedule: Arc<Schedule>, config: SimConfig) -> Self {
        Self {
            design: None,
            config,
            lifecycle: Lifecycle::new(SimState::Elaborated),
            engine: Some(Engine::new(netlist, schedule)),
        }
    }

    pub fn elaborate(&mut self) -> Result<()> {
        self.lifecycle.elaborate()?;
        let design = self.design.as_ref().ok_or(SimError::AlreadyElaborated)?;
        let built = elaborate(design).and_then(|netlist| {
            let schedule = Schedule::build(&netlist)?;
            Ok((netlist, schedule))
        });
        let (netlist, schedule) = self.lifecycle.guard(built)?;
        debug!(
            "design `{}` ready: {} nets, {} ports",
            design.model(design.root()).name,
            netlist.nets.len(),
            netlist.port_names().len()
        );
        self.engine = Some(Engine::new(Arc::new(netlist), Arc::new(schedule)));
        self.lifecycle.enter(SimState::Elaborated);
        Ok(())
    }

    fn engine(&self) -> Result<&Engine> {
        self.engine.as_ref().ok_or(SimError::InvalidState {
            op: "access",
            state: self.lifecycle.state(),
        })
    }

    fn engine_mut(&mut self) -> Result<&mut Engine> {
        let state = self.lifecycle.state();
        self.engine
            .as_mut()
            .ok_or(SimError::InvalidState { op: "access", state })
    }

    pub fn design(&self) -> Option<&Design> {
        self.design.as_ref()
    }

    pub fn config(&self) -> &SimConfig {
        &self.config
    }

    pub fn state(&self) -> SimState {
        self.lifecycle.state()
    }

    pub fn netlist(&self) -> Result<Arc<Netlist>> {
        Ok(Arc::clone(&self.engine()?.netlist))
    }

    pub fn schedule(&self) -> Result<Arc<Schedule>> {
        Ok(Arc::clone(&self.engine()?.schedule))
    }

    pub fn reset(&mut self) -> Result<()> {
        self.lifecycle.reset()?;
        let limit = self.config.max_settle_evals;
        let result = self.engine_mut().and_then(|e| e.reset(limit));
        self.lifecycle.guard(result)?;
        self.lifecycle.enter(SimState::Reset);
        Ok(())
    }

    pub fn cycle(&mut self) -> Result<()> {
        self.lifecycle.cycle()?;
        let limit = self.config.max_settle_evals;
        let result = self.engine_mut().and_then(|e| e.step(limit));
        self.lifecycle.guard(result)?;
        self.lifecycle.enter(SimState::Running);
        Ok(())
    }

    /// Settle combinational logic without advancing the clock.
    pub fn evaluate(&mut self) -> Result<()> {
        self.lifecycle.evaluate()?;
        let limit = self.config.max_settle_evals;
        let result = self.engine_mut().and_then(|e| e.settle(limit));
        self.lifecycle.guard(result)
    }

    pub fn read(&self, path: &str) -> Result<Bits> {
        self.lifecycle.observe("read")?;
        let engine = self.engine()?;
        let net = engine.netlist.net(path)?;
        Ok(Bits::from_raw(engine.netlist.width(net), engine.store.values[net]))
    }

    pub fn peek(&self, path: &str) -> Result<u64> {
        Ok(self.read(path)?.value())
    }

    fn write_op(
        &mut self,
        op: &'static str,
        path: &str,
        range: Option<(usize, usize)>,
        value: u64,
        next: bool,
    ) -> Result<()> {
        self.lifecycle.write(op)?;
        let engine = self.engine_mut()?;
        let write = WriteOp::resolve(&engine.netlist, path, range, value)?;
        if next {
            engine.store.write_next(&write);
        } else if engine.store.write_now(&write) {
            engine.dirty.mark_readers(&engine.schedule, write.net, None);
        }
        Ok(())
    }

    /// Immediate write, seen by the next settle.
    pub fn write(&mut self, path: &str, value: u64) -> Result<()> {
        self.write_op("write", path, None, value, false)
    }

    pub fn poke(&mut self, path: &str, value: u64) -> Result<()> {
        self.write(path, value)
    }

    /// Scheduled write, applied at the next clock edge.
    pub fn write_next(&mut self, path: &str, value: u64) -> Result<()> {
        self.write_op("write_next", path, None, value, true)
    }

    pub fn write_slice(&mut self, path: &str, lo: usize, hi: usize, value: u64) -> Result<()> {
        self.write_op("write_slice", path, Some((lo, hi)), value, false)
    }

    pub fn write_slice_next(&mut self, path: &str, lo: usize, hi: usize, value: u64) -> Result<()> {
        self.write_op("write_slice_next", path, Some((lo, hi)), value, true)
    }

    pub fn ncycles(&self) -> u64 {
        self.engine.as_ref().map_or(0, |e| e.store.ncycles)
    }

    pub fn port_names(&self) -> Vec<String> {
        self.engine
            .as_ref()
            .map_or_else(Vec::new, |e| e.netlist.port_names().to_vec())
    }

    pub fn signal_names(&self) -> Vec<String> {
        self.engine
            .as_ref()
            .map_or_else(Vec::new, |e| e.netlist.signal_names().to_vec())
    }
}

impl Simulate for Simulator {
    fn backend(&self) -> Backend {
        Backend::Interpreted
    }

    fn state(&self) -> SimState {
        Simulator::state(self)
    }

    fn elaborate(&mut self) -> Result<()> {
        Simulator::elaborate(self)
    }

    fn reset(&mut self) -> Result<()> {
        Simulator::reset(self)
    }

    fn cycle(&mut self) -> Result<()> {
        Simulator::cycle(self)
    }

    fn evaluate(&mut self) -> Result<()> {
        Simulator::evaluate(self)
    }

    fn read(&self, path: &str) -> Result<Bits> {
        Simulator::read(self, path)
    }

    fn write(&mut self, path: &str, value: u64) -> Result<()> {
        Simulator::write(self, path, value)
    }

    fn write_next(&mut self, path: &str, value: u64) -> Result<()> {
        Simulator::write_next(self, path, value)
    }

    fn write_slice(&mut self, path: &str, lo: usize, hi: usize, value: u64) -> Result<()> {
        Simulator::write_slice(self, path, lo, hi, value)
    }

    fn write_slice_next(&mut self, path: &str, lo: usize, hi: usize, value: u64) -> Result<()> {
        Simulator::write_slice_next(self, path, lo, hi, value)
    }

    fn ncycles(&self) -> u64 {
        Simulator::ncycles(self)
    }

    fn port_names(&self) -> Vec<String> {
        Simulator::port_names(self)
    }
}
