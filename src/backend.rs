//! Backend substitution and lockstep equivalence checking.
//!
//! Every backend implements [`Simulate`], so a harness written against the
//! interpreted [`Simulator`] runs unchanged on a substituted implementation.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::compiled::CompiledSimulator;
use crate::config::SimConfig;
use crate::core::Simulator;
use crate::elaborate::Netlist;
use crate::error::{Result, SimError};
use crate::lifecycle::SimState;
use crate::model::Design;
use crate::schedule::Schedule;
use crate::value::Bits;

/// An elaboratable, steppable simulation.
pub trait Simulate {
    fn backend(&self) -> Backend;

    fn state(&self) -> SimState;

    fn elaborate(&mut self) -> Result<()>;

    fn reset(&mut self) -> Result<()>;

    /// Settle, sample clocked blocks, commit, count, settle again.
    fn cycle(&mut self) -> Result<()>;

    /// Settle combinational logic without a clock edge.
    fn evaluate(&mut self) -> Result<()>;

    fn read(&self, path: &str) -> Result<Bits>;

    fn write(&mut self, path: &str, value: u64) -> Result<()>;

    fn write_next(&mut self, path: &str, value: u64) -> Result<()>;

    fn write_slice(&mut self, path: &str, lo: usize, hi: usize, value: u64) -> Result<()>;

    fn write_slice_next(&mut self, path: &str, lo: usize, hi: usize, value: u64) -> Result<()>;

    fn ncycles(&self) -> u64;

    fn port_names(&self) -> Vec<String>;

    fn peek(&self, path: &str) -> Result<u64> {
        Ok(self.read(path)?.value())
    }

    fn poke(&mut self, path: &str, value: u64) -> Result<()> {
        self.write(path, value)
    }

    fn cycles(&mut self, n: u64) -> Result<()> {
        for _ in 0..n {
            self.cycle()?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    Interpreted,
    Compiled,
    Native,
}

impl Backend {
    pub fn is_available(self) -> bool {
        match self {
            Backend::Native => cfg!(feature = "native"),
            _ => true,
        }
    }

    pub fn available() -> Vec<Backend> {
        [Backend::Interpreted, Backend::Compiled, Backend::Native]
            .into_iter()
            .filter(|b| b.is_available())
            .collect()
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Backend::Interpreted => "interpreted",
            Backend::Compiled => "compiled",
            Backend::Native => "native",
        };
        f.write_str(name)
    }
}

impl FromStr for Backend {
    type Err = SimError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "interpreted" | "interpreter" | "interp" => Ok(Backend::Interpreted),
            "compiled" | "compiler" | "flat" => Ok(Backend::Compiled),
            "native" | "rustc" => Ok(Backend::Native),
            other => Err(SimError::Parse(format!("unknown backend `{}`", other))),
        }
    }
}

#[cfg(feature = "native")]
fn native(netlist: Arc<Netlist>, schedule: Arc<Schedule>, config: &SimConfig) -> Result<Box<dyn Simulate>> {
    let sim = crate::native::NativeSimulator::new(netlist, schedule, config)?;
    Ok(Box::new(sim))
}

#[cfg(not(feature = "native"))]
fn native(_: Arc<Netlist>, _: Arc<Schedule>, _: &SimConfig) -> Result<Box<dyn Simulate>> {
    Err(SimError::Native("built without the `native` feature".to_string()))
}

/// A fresh, elaborated replacement for `sim` running on `backend`.
pub fn substitute(sim: &Simulator, backend: Backend) -> Result<Box<dyn Simulate>> {
    if matches!(sim.state(), SimState::Unelaborated | SimState::Halted) {
        return Err(SimError::InvalidState { op: "substitute", state: sim.state() });
    }
    let netlist = sim.netlist()?;
    let schedule = sim.schedule()?;
    info!("substituting {} backend", backend);
    match backend {
        Backend::Interpreted => Ok(Box::new(Simulator::from_netlist(
            netlist,
            schedule,
            sim.config().clone(),
        ))),
        Backend::Compiled => Ok(Box::new(CompiledSimulator::new(netlist, schedule, sim.config()))),
        Backend::Native => native(netlist, schedule, sim.config()),
    }
}

/// Elaborate `design` and return it on the backend named by `config`.
pub fn build(design: Design, config: SimConfig) -> Result<Box<dyn Simulate>> {
    let backend = config.backend;
    let mut sim = Simulator::new(design, config);
    sim.elaborate()?;
    match backend {
        Backend::Interpreted => Ok(Box::new(sim)),
        other => substitute(&sim, other),
    }
}

/// Interpreted reference and `candidate` driven together.
pub fn lockstep(design: Design, config: SimConfig, candidate: Backend) -> Result<Lockstep> {
    let mut sim = Simulator::new(design, config);
    sim.elaborate()?;
    let candidate = substitute(&sim, candidate)?;
    Lockstep::new(Box::new(sim), candidate)
}

/// Runs two implementations side by side and fails on the first port whose
/// value differs after a reset, settle or cycle.
pub struct Lockstep {
    reference: Box<dyn Simulate>,
    candidate: Box<dyn Simulate>,
    ports: Vec<String>,
    halted: bool,
}

impl Lockstep {
    pub fn new(reference: Box<dyn Simulate>, candidate: Box<dyn Simulate>) -> Result<Self> {
        let ports = reference.port_names();
        let other = candidate.port_names();
        if let Some(missing) = ports.iter().find(|p| !other.contains(p)) {
            return Err(SimError::UnknownSignal(missing.clone()));
        }
        Ok(Self { reference, candidate, ports, halted: false })
    }

    pub fn reference(&self) -> &dyn Simulate {
        self.reference.as_ref()
    }

    pub fn candidate(&self) -> &dyn Simulate {
        self.candidate.as_ref()
    }

    fn both<T>(&mut self, op: &'static str, f: impl Fn(&mut dyn Simulate) -> Result<T>) -> Result<T> {
        if self.halted {
            return Err(SimError::InvalidState { op, state: SimState::Halted });
        }
        let r = f(self.reference.as_mut());
        let c = f(self.candidate.as_mut());
        match (r, c) {
            (Ok(v), Ok(_)) => Ok(v),
            (Err(e), Err(_)) => Err(e),
            (Err(e), Ok(_)) | (Ok(_), Err(e)) => {
                warn!("lockstep `{}` failed on one side only: {}", op, e);
                self.halted = true;
                Err(e)
            }
        }
    }

    fn compare(&mut self) -> Result<()> {
        for port in &self.ports {
            let r = self.reference.read(port)?;
            let c = self.candidate.read(port)?;
            if r != c {
                self.halted = true;
                return Err(SimError::Divergence {
                    port: port.clone(),
                    cycle: self.reference.ncycles(),
                    reference: r.value(),
                    candidate: c.value(),
                });
            }
        }
        Ok(())
    }
}

impl Simulate for Lockstep {
    fn backend(&self) -> Backend {
        self.candidate.backend()
    }

    fn state(&self) -> SimState {
        if self.halted {
            SimState::Halted
        } else {
            self.reference.state()
        }
    }

    fn elaborate(&mut self) -> Result<()> {
        self.both("elaborate", |s| s.elaborate())
    }

    fn reset(&mut self) -> Result<()> {
        self.both("reset", |s| s.reset())?;
        self.compare()
    }

    fn cycle(&mut self) -> Result<()> {
        self.both("cycle", |s| s.cycle())?;
        self.compare()
    }

    fn evaluate(&mut self) -> Result<()> {
        self.both("evaluate", |s| s.evaluate())?;
        self.compare()
    }

    fn read(&self, path: &str) -> Result<Bits> {
        let r = self.reference.read(path)?;
        let c = self.candidate.read(path)?;
        if r != c {
            return Err(SimError::Divergence {
                port: path.to_string(),
                cycle: self.reference.ncycles(),
                reference: r.value(),
                candidate: c.value(),
            });
        }
        Ok(r)
    }

    fn write(&mut self, path: &str, value: u64) -> Result<()> {
        self.both("write", |s| s.write(path, value))
    }

    fn write_next(&mut self, path: &str, value: u64) -> Result<()> {
        self.both("write_next", |s| s.write_next(path, value))
    }

    fn write_slice(&mut self, path: &str, lo: usize, hi: usize, value: u64) -> Result<()> {
        self.both("write_slice", |s| s.write_slice(path, lo, hi, value))
    }

    fn write_slice_next(&mut self, path: &str, lo: usize, hi: usize, value: u64) -> Result<()> {
        self.both("write_slice_next", |s| s.write_slice_next(path, lo, hi, value))
    }

    fn ncycles(&self) -> u64 {
        self.reference.ncycles()
    }

    fn port_names(&self) -> Vec<String> {
        self.ports.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Assign, Expr};

    fn counter() -> Design {
        let mut d = Design::new("counter");
        let root = d.root();
        let en = d.input(root, "en", 1).unwrap();
        let q = d.reg_output(root, "q", 4, 0).unwrap();
        let (een, eq) = (d.sig(en), d.sig(q));
        let next = Expr::mux(een, eq.clone() + Expr::lit(1, 4), eq);
        d.clocked(root, "count", vec![Assign::new(q, next)]);
        d
    }

    #[test]
    fn test_backend_names() {
        assert_eq!("compiled".parse::<Backend>().unwrap(), Backend::Compiled);
        assert_eq!(" Interpreter ".parse::<Backend>().unwrap(), Backend::Interpreted);
        assert!(matches!("verilator".parse::<Backend>(), Err(SimError::Parse(_))));
        assert_eq!(Backend::Native.to_string(), "native");
        assert!(Backend::available().contains(&Backend::Compiled));
    }

    #[test]
    fn test_substitute_requires_elaboration() {
        let sim = Simulator::new(counter(), SimConfig::default());
        assert!(matches!(
            substitute(&sim, Backend::Compiled),
            Err(SimError::InvalidState { op: "substitute", .. })
        ));
    }

    #[test]
    fn test_substitute_is_fresh_and_elaborated() {
        let mut sim = Simulator::new(counter(), SimConfig::default());
        sim.elaborate().unwrap();
        sim.reset().unwrap();
        sim.write("en", 1).unwrap();
        sim.cycle().unwrap();
        let mut sub = substitute(&sim, Backend::Compiled).unwrap();
        assert_eq!(sub.state(), SimState::Elaborated);
        assert_eq!(sub.elaborate(), Err(SimError::AlreadyElaborated));
        sub.reset().unwrap();
        assert_eq!(sub.peek("q").unwrap(), 0);
        assert_eq!(sub.port_names(), sim.port_names());
    }

    #[test]
    fn test_lockstep_counts_together() {
        let mut ls = lockstep(counter(), SimConfig::default(), Backend::Compiled).unwrap();
        ls.reset().unwrap();
        ls.poke("en", 1).unwrap();
        ls.cycles(20).unwrap();
        assert_eq!(ls.peek("q").unwrap(), 4);
        assert_eq!(ls.ncycles(), 20);
        assert_eq!(ls.backend(), Backend::Compiled);
    }

    /// A candidate that reports one port wrong.
    struct Skewed(Box<dyn Simulate>);

    impl Simulate for Skewed {
        fn backend(&self) -> Backend {
            self.0.backend()
        }
        fn state(&self) -> SimState {
            self.0.state()
        }
        fn elaborate(&mut self) -> Result<()> {
            self.0.elaborate()
        }
        fn reset(&mut self) -> Result<()> {
            self.0.reset()
        }
        fn cycle(&mut self) -> Result<()> {
            self.0.cycle()
        }
        fn evaluate(&mut self) -> Result<()> {
            self.0.evaluate()
        }
        fn read(&self, path: &str) -> Result<Bits> {
            let v = self.0.read(path)?;
            if path == "q" && self.0.ncycles() == 3 {
                return Bits::new(v.width(), v.value() ^ 1);
            }
            Ok(v)
        }
        fn write(&mut self, path: &str, value: u64) -> Result<()> {
            self.0.write(path, value)
        }
        fn write_next(&mut self, path: &str, value: u64) -> Result<()> {
            self.0.write_next(path, value)
        }
        fn write_slice(&mut self, path: &str, lo: usize, hi: usize, value: u64) -> Result<()> {
            self.0.write_slice(path, lo, hi, value)
        }
        fn write_slice_next(&mut self, path: &str, lo: usize, hi: usize, value: u64) -> Result<()> {
            self.0.write_slice_next(path, lo, hi, value)
        }
        fn ncycles(&self) -> u64 {
            self.0.ncycles()
        }
        fn port_names(&self) -> Vec<String> {
            self.0.port_names()
        }
    }

    #[test]
    fn test_lockstep_reports_divergence() {
        let mut sim = Simulator::new(counter(), SimConfig::default());
        sim.elaborate().unwrap();
        let candidate = Skewed(substitute(&sim, Backend::Compiled).unwrap());
        let mut ls = Lockstep::new(Box::new(sim), Box::new(candidate)).unwrap();
        ls.reset().unwrap();
        ls.write("en", 1).unwrap();
        ls.cycle().unwrap();
        ls.cycle().unwrap();
        match ls.cycle() {
            Err(SimError::Divergence { port, cycle, reference, candidate }) => {
                assert_eq!(port, "q");
                assert_eq!(cycle, 3);
                assert_eq!(reference, 3);
                assert_eq!(candidate, 2);
            }
            other => panic!("expected Divergence, got {:?}", other),
        }
        assert_eq!(ls.state(), SimState::Halted);
        assert!(ls.cycle().is_err());
    }
}
