//! Error taxonomy for elaboration and simulation.
//!
//! Description errors (`Width`, `Range`, `MultiDriver`, `UnconnectedInput`,
//! `CombinationalCycle`) mean the circuit itself is invalid. `NonConvergence`
//! and `Divergence` abort a running simulation. The remaining variants are
//! usage errors and leave the simulator where it was.

use thiserror::Error;

use crate::lifecycle::SimState;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SimError {
    #[error("width error: {0}")]
    Width(String),

    #[error("range error: [{lo}:{hi}) is not a valid slice of a {width}-bit value")]
    Range { lo: usize, hi: usize, width: usize },

    #[error("multiple drivers for `{signal}`: {}", drivers.join(", "))]
    MultiDriver { signal: String, drivers: Vec<String> },

    #[error("input port `{port}` has no driver")]
    UnconnectedInput { port: String },

    #[error("combinational cycle through blocks: {}", blocks.join(" -> "))]
    CombinationalCycle { blocks: Vec<String> },

    #[error("combinational logic did not settle within {limit} block evaluations (still pending: {})", pending.join(", "))]
    NonConvergence { limit: usize, pending: Vec<String> },

    #[error("design is already elaborated")]
    AlreadyElaborated,

    #[error("`{op}` is not allowed while the simulator is {state}")]
    InvalidState { op: &'static str, state: SimState },

    #[error("unknown signal: {0}")]
    UnknownSignal(String),

    #[error("`{0}` is declared more than once")]
    DuplicateName(String),

    #[error("port `{port}` diverged at cycle {cycle}: reference={reference:#x} candidate={candidate:#x}")]
    Divergence {
        port: String,
        cycle: u64,
        reference: u64,
        candidate: u64,
    },

    #[error("condition not reached after {0} cycles")]
    Timeout(u64),

    #[error("failed to parse description: {0}")]
    Parse(String),

    #[error("native backend: {0}")]
    Native(String),
}

impl SimError {
    /// True for errors that describe an invalid circuit rather than a bad call.
    pub fn is_description_error(&self) -> bool {
        matches!(
            self,
            SimError::Width(_)
                | SimError::Range { .. }
                | SimError::MultiDriver { .. }
                | SimError::UnconnectedInput { .. }
                | SimError::CombinationalCycle { .. }
        )
    }
}

impl From<serde_json::Error> for SimError {
    fn from(e: serde_json::Error) -> Self {
        SimError::Parse(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SimError>;
