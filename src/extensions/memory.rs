//! Test memory collaborator
//!
//! Serves any number of requesters, each on its own set of root ports named
//! `<prefix>req_val`, `<prefix>req_rdy`, `<prefix>req_type`, `<prefix>req_addr`,
//! `<prefix>req_data`, `<prefix>resp_val`, `<prefix>resp_rdy` and
//! `<prefix>resp_data`. Requests are always accepted; each response becomes
//! visible `delay` committed cycles after the cycle following its request, in
//! request order per requester.

use std::collections::{HashMap, VecDeque};

use log::trace;

use crate::backend::Simulate;
use crate::error::Result;
use crate::extensions::harness::Collaborator;
use crate::model::Direction;

pub const TYPE_READ: u64 = 0;
pub const TYPE_WRITE: u64 = 1;

/// Requester-side ports: name, width, and direction as seen by the requester.
pub const PORTS: [(&str, usize, Direction); 8] = [
    ("req_val", 1, Direction::Out),
    ("req_rdy", 1, Direction::In),
    ("req_type", 1, Direction::Out),
    ("req_addr", 32, Direction::Out),
    ("req_data", 32, Direction::Out),
    ("resp_val", 1, Direction::In),
    ("resp_rdy", 1, Direction::Out),
    ("resp_data", 32, Direction::In),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Pending {
    ready_at: u64,
    data: u32,
}

#[derive(Debug, Clone)]
pub struct TestMemory {
    mem: HashMap<u32, u8>,
    prefixes: Vec<String>,
    delay: u64,
    queues: Vec<VecDeque<Pending>>,
    presented: Vec<bool>,
}

impl TestMemory {
    /// `nports` requesters prefixed `mem0_`, `mem1_`, ...
    pub fn new(nports: usize, delay: u64) -> Self {
        Self::with_prefixes((0..nports).map(|i| format!("mem{}_", i)).collect(), delay)
    }

    pub fn with_prefixes(prefixes: Vec<String>, delay: u64) -> Self {
        let n = prefixes.len();
        Self {
            mem: HashMap::new(),
            prefixes,
            delay,
            queues: vec![VecDeque::new(); n],
            presented: vec![false; n],
        }
    }

    pub fn prefix(&self, idx: usize) -> &str {
        &self.prefixes[idx]
    }

    pub fn nports(&self) -> usize {
        self.prefixes.len()
    }

    pub fn load_bytes(&mut self, base: u32, data: &[u8]) {
        for (i, byte) in data.iter().enumerate() {
            self.mem.insert(base.wrapping_add(i as u32), *byte);
        }
    }

    /// Store consecutive little-endian 32-bit words starting at `base`.
    pub fn load_words(&mut self, base: u32, words: &[u32]) {
        for (i, word) in words.iter().enumerate() {
            self.write_word(base.wrapping_add(4 * i as u32), *word);
        }
    }

    pub fn read_byte(&self, addr: u32) -> u8 {
        self.mem.get(&addr).copied().unwrap_or(0)
    }

    pub fn read_word(&self, addr: u32) -> u32 {
        let mut bytes = [0u8; 4];
        for (i, b) in bytes.iter_mut().enumerate() {
            *b = self.read_byte(addr.wrapping_add(i as u32));
        }
        u32::from_le_bytes(bytes)
    }

    pub fn write_word(&mut self, addr: u32, value: u32) {
        self.load_bytes(addr, &value.to_le_bytes());
    }

    /// Responses queued for requester `idx`, delivered or not.
    pub fn in_flight(&self, idx: usize) -> usize {
        self.queues[idx].len()
    }

    fn port(&self, idx: usize, name: &str) -> String {
        format!("{}{}", self.prefixes[idx], name)
    }
}

impl Collaborator for TestMemory {
    fn drive(&mut self, sim: &mut dyn Simulate) -> Result<()> {
        let now = sim.ncycles();
        for idx in 0..self.prefixes.len() {
            sim.write(&self.port(idx, "req_rdy"), 1)?;
            let ready = self.queues[idx].front().filter(|p| p.ready_at <= now).copied();
            self.presented[idx] = ready.is_some();
            let data = ready.map(|p| p.data).unwrap_or(0);
            sim.write(&self.port(idx, "resp_val"), ready.is_some() as u64)?;
            sim.write(&self.port(idx, "resp_data"), data as u64)?;
        }
        Ok(())
    }

    fn sample(&mut self, sim: &dyn Simulate) -> Result<()> {
        let now = sim.ncycles();
        for idx in 0..self.prefixes.len() {
            if self.presented[idx] && sim.peek(&self.port(idx, "resp_rdy"))? != 0 {
                self.queues[idx].pop_front();
            }
            if sim.peek(&self.port(idx, "req_val"))? == 0 {
                continue;
            }
            let addr = sim.peek(&self.port(idx, "req_addr"))? as u32;
            let data = if sim.peek(&self.port(idx, "req_type"))? == TYPE_WRITE {
                let value = sim.peek(&self.port(idx, "req_data"))? as u32;
                trace!("mem[{}] write {:#x} <- {}", idx, addr, value);
                self.write_word(addr, value);
                0
            } else {
                let value = self.read_word(addr);
                trace!("mem[{}] read {:#x} -> {}", idx, addr, value);
                value
            };
            self.queues[idx].push_back(Pending { ready_at: now + 1 + self.delay, data });
        }
        Ok(())
    }
}
