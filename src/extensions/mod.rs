//! Extension modules
//!
//! Test-bench collaborators that drive a simulation through its root ports,
//! and reference designs built on the public [`Design`](crate::Design) API.

pub mod harness;
pub mod memory;
pub mod mvmult;
pub mod primitives;
pub mod source;

pub use harness::{run_until, step, Collaborator};
pub use memory::TestMemory;
pub use mvmult::{LaneHarness, ManagedHarness};
pub use source::{ConfigMsg, Selector, TestSource};
