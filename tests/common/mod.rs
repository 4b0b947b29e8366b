#![allow(dead_code)]

use cycle_sim::extensions::{run_until, step, Collaborator, TestMemory, TestSource};
use cycle_sim::{build, lockstep, Backend, Design, SimConfig, Simulate};

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Every available backend built from `make`, plus each non-interpreted
/// backend in lockstep with the interpreter. All are elaborated, none reset.
pub fn engines<F: Fn() -> Design>(make: F) -> Vec<(String, Box<dyn Simulate>)> {
    init_logger();
    let mut out: Vec<(String, Box<dyn Simulate>)> = Vec::new();
    for backend in Backend::available() {
        let sim = build(make(), SimConfig::default().with_backend(backend)).unwrap();
        out.push((backend.to_string(), sim));
    }
    for backend in Backend::available() {
        if backend == Backend::Interpreted {
            continue;
        }
        let checked = lockstep(make(), SimConfig::default(), backend).unwrap();
        out.push((format!("lockstep/{}", backend), Box::new(checked)));
    }
    out
}

pub const MATRIX: [u32; 9] = [5, 1, 3, 1, 1, 1, 1, 2, 1];
pub const VECTOR: [u32; 3] = [1, 2, 3];

pub struct LaneRun {
    pub matrix_base: u32,
    pub vector_base: u32,
    pub dest_base: u32,
    pub size: u32,
}

/// Program a single lane, pulse `go` for one committed cycle, then step the
/// memory until `done`.
pub fn run_lane(sim: &mut dyn Simulate, mem: &mut TestMemory, run: &LaneRun) -> u64 {
    sim.reset().unwrap();
    sim.write("matrix_base", run.matrix_base as u64).unwrap();
    sim.write("vector_base", run.vector_base as u64).unwrap();
    sim.write("dest_base", run.dest_base as u64).unwrap();
    sim.write("size", run.size as u64).unwrap();
    sim.cycle().unwrap();
    sim.write("go", 1).unwrap();
    {
        let parts: &mut [&mut dyn Collaborator] = &mut [&mut *mem];
        step(sim, parts).unwrap();
    }
    sim.write("go", 0).unwrap();
    let parts: &mut [&mut dyn Collaborator] = &mut [mem];
    run_until(sim, parts, |s| Ok(s.peek("done")? == 1), 200).unwrap()
}

/// Stream `source` into a managed harness alongside `mem` until the aggregate
/// `done` rises.
pub fn run_managed(sim: &mut dyn Simulate, source: &mut TestSource, mem: &mut TestMemory, nlanes: usize) -> u64 {
    sim.reset().unwrap();
    let parts: &mut [&mut dyn Collaborator] = &mut [source, mem];
    run_until(
        sim,
        parts,
        |s| {
            let done = s.peek("done")? == 1;
            if done {
                for i in 0..nlanes {
                    assert_eq!(s.peek(&format!("lane{}.done", i))?, 1);
                }
            }
            Ok(done)
        },
        2000,
    )
    .unwrap()
}
