//! Cycle loop shared by test-bench collaborators.

use log::trace;

use crate::backend::Simulate;
use crate::error::{Result, SimError};

/// A model outside the simulation that talks to it through root ports.
///
/// `drive` writes inputs for the coming edge; `sample` observes the settled
/// pre-edge state and updates the collaborator's own bookkeeping.
pub trait Collaborator {
    fn drive(&mut self, sim: &mut dyn Simulate) -> Result<()>;

    fn sample(&mut self, sim: &dyn Simulate) -> Result<()>;
}

/// One clock edge: drive all, settle, sample all, cycle.
pub fn step(sim: &mut dyn Simulate, parts: &mut [&mut dyn Collaborator]) -> Result<()> {
    for part in parts.iter_mut() {
        part.drive(sim)?;
    }
    sim.evaluate()?;
    for part in parts.iter_mut() {
        part.sample(&*sim)?;
    }
    sim.cycle()
}

/// Step until `done` holds, returning the cycle count reached.
pub fn run_until<F>(
    sim: &mut dyn Simulate,
    parts: &mut [&mut dyn Collaborator],
    mut done: F,
    max_cycles: u64,
) -> Result<u64>
where
    F: FnMut(&dyn Simulate) -> Result<bool>,
{
    loop {
        if done(&*sim)? {
            trace!("condition reached after {} cycles", sim.ncycles());
            return Ok(sim.ncycles());
        }
        if sim.ncycles() >= max_cycles {
            return Err(SimError::Timeout(max_cycles));
        }
        step(sim, parts)?;
    }
}
