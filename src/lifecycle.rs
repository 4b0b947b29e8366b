//! Driver state machine shared by every backend.

use std::fmt;

use log::warn;

use crate::error::{Result, SimError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SimState {
    Unelaborated,
    Elaborated,
    Reset,
    Running,
    Halted,
}

impl fmt::Display for SimState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SimState::Unelaborated => "unelaborated",
            SimState::Elaborated => "elaborated",
            SimState::Reset => "reset",
            SimState::Running => "running",
            SimState::Halted => "halted",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
pub struct Lifecycle {
    state: SimState,
}

impl Lifecycle {
    pub fn new(state: SimState) -> Self {
        Self { state }
    }

    pub fn state(&self) -> SimState {
        self.state
    }

    fn require(&self, op: &'static str, allowed: &[SimState]) -> Result<()> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(SimError::InvalidState { op, state: self.state })
        }
    }

    pub fn elaborate(&mut self) -> Result<()> {
        match self.state {
            SimState::Unelaborated => Ok(()),
            SimState::Halted => Err(SimError::InvalidState { op: "elaborate", state: self.state }),
            _ => Err(SimError::AlreadyElaborated),
        }
    }

    pub fn reset(&self) -> Result<()> {
        self.require("reset", &[SimState::Elaborated, SimState::Reset, SimState::Running])
    }

    pub fn cycle(&self) -> Result<()> {
        self.require("cycle", &[SimState::Reset, SimState::Running])
    }

    pub fn evaluate(&self) -> Result<()> {
        self.require("evaluate", &[SimState::Reset, SimState::Running])
    }

    pub fn write(&self, op: &'static str) -> Result<()> {
        self.require(op, &[SimState::Elaborated, SimState::Reset, SimState::Running])
    }

    pub fn observe(&self, op: &'static str) -> Result<()> {
        if self.state == SimState::Unelaborated {
            return Err(SimError::InvalidState { op, state: self.state });
        }
        Ok(())
    }

    pub fn enter(&mut self, state: SimState) {
        self.state = state;
    }

    /// Halts on any run-time failure; the caller returns `result` unchanged.
    pub fn guard<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            warn!("simulation halted: {}", e);
            self.state = SimState::Halted;
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transitions() {
        let mut lc = Lifecycle::new(SimState::Unelaborated);
        assert!(matches!(lc.cycle(), Err(SimError::InvalidState { op: "cycle", .. })));
        assert!(lc.observe("read").is_err());
        lc.elaborate().unwrap();
        lc.enter(SimState::Elaborated);
        assert_eq!(lc.elaborate(), Err(SimError::AlreadyElaborated));
        assert!(lc.cycle().is_err());
        assert!(lc.reset().is_ok());
        lc.enter(SimState::Reset);
        assert!(lc.cycle().is_ok());
    }

    #[test]
    fn test_guard_halts() {
        let mut lc = Lifecycle::new(SimState::Running);
        let r: Result<()> = Err(SimError::Timeout(3));
        assert!(lc.guard(r).is_err());
        assert_eq!(lc.state(), SimState::Halted);
        assert!(lc.cycle().is_err());
        assert!(lc.reset().is_err());
        assert!(lc.observe("read").is_ok());
    }
}
