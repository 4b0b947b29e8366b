//! Cycle-based RTL simulator
//!
//! A hierarchical [`Design`] is elaborated into a flat [`elaborate::Netlist`],
//! scheduled once, then stepped one clock edge at a time. Each cycle settles
//! combinational logic to a fixed point and commits every clocked block's
//! scheduled writes together.
//!
//! The module is organized as:
//! - core.rs: interpreted, event-driven simulator
//! - compiled.rs: flat-op backend with pre-resolved indices
//! - native.rs: generated Rust compiled with rustc (feature `native`)
//! - backend.rs: the `Simulate` trait, backend substitution and lockstep checking
//! - extensions/: harness collaborators and reference designs

pub mod backend;
pub mod compiled;
pub mod config;
pub mod core;
pub mod elaborate;
pub mod error;
pub mod extensions;
pub mod ir;
pub mod lifecycle;
pub mod loader;
pub mod model;
pub mod native;
pub mod schedule;
pub mod store;
pub mod value;

pub use backend::{build, lockstep, substitute, Backend, Lockstep, Simulate};
pub use config::SimConfig;
pub use crate::core::Simulator;
pub use error::{Result, SimError};
pub use ir::{Assign, Expr};
pub use lifecycle::SimState;
pub use model::{Design, ModelId, SignalId};
pub use value::Bits;
