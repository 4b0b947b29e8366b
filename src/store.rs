//! Net value table with the two write channels.
//!
//! Immediate writes land in `values`; scheduled writes accumulate as
//! `(value, mask)` pairs until [`SignalStore::commit`].

use crate::elaborate::Netlist;
use crate::error::{Result, SimError};
use crate::value::{self, mask};

/// A checked external write: `value` goes into the bits selected by `mask`,
/// starting at `shift`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteOp {
    pub net: usize,
    pub shift: usize,
    pub mask: u64,
    pub value: u64,
}

impl WriteOp {
    pub fn resolve(
        netlist: &Netlist,
        path: &str,
        range: Option<(usize, usize)>,
        value: u64,
    ) -> Result<Self> {
        let net = netlist.writable(path)?;
        let width = netlist.width(net);
        let (shift, bits) = match range {
            None => (0, width),
            Some((lo, hi)) => {
                value::check_range(lo, hi, width)?;
                (lo, hi - lo)
            }
        };
        if value & !mask(bits) != 0 {
            return Err(SimError::Width(format!(
                "{:#x} does not fit in {} bits of `{}`",
                value, bits, path
            )));
        }
        Ok(Self { net, shift, mask: mask(bits) << shift, value })
    }

    fn merge(&self, current: u64) -> u64 {
        (current & !self.mask) | ((self.value << self.shift) & self.mask)
    }
}

#[derive(Debug, Clone)]
pub struct SignalStore {
    pub values: Vec<u64>,
    next_value: Vec<u64>,
    next_mask: Vec<u64>,
    pending: Vec<usize>,
    pub ncycles: u64,
}

impl SignalStore {
    pub fn new(netlist: &Netlist) -> Self {
        let n = netlist.nets.len();
        let mut store = Self {
            values: vec![0; n],
            next_value: vec![0; n],
            next_mask: vec![0; n],
            pending: Vec::new(),
            ncycles: 0,
        };
        store.reset(netlist);
        store
    }

    /// Initial values everywhere, nothing pending, cycle count zero.
    pub fn reset(&mut self, netlist: &Netlist) {
        for (v, net) in self.values.iter_mut().zip(&netlist.nets) {
            *v = net.init;
        }
        for &net in &self.pending {
            self.next_mask[net] = 0;
        }
        self.pending.clear();
        self.ncycles = 0;
    }

    /// Returns whether the net changed.
    pub fn write_now(&mut self, op: &WriteOp) -> bool {
        let old = self.values[op.net];
        self.values[op.net] = op.merge(old);
        self.values[op.net] != old
    }

    /// Stage for the next commit. Later writes win on overlapping bits.
    pub fn write_next(&mut self, op: &WriteOp) {
        self.stage(op.net, (op.value << op.shift) & op.mask, op.mask);
    }

    /// `value` is already positioned under `mask`.
    #[inline(always)]
    pub fn stage(&mut self, net: usize, value: u64, mask: u64) {
        if self.next_mask[net] == 0 {
            self.pending.push(net);
            self.next_value[net] = 0;
        }
        self.next_value[net] = (self.next_value[net] & !mask) | (value & mask);
        self.next_mask[net] |= mask;
    }

    /// Apply every staged write and return the nets whose value changed.
    pub fn commit(&mut self) -> Vec<usize> {
        let mut changed = Vec::new();
        for net in self.pending.drain(..) {
            let m = self.next_mask[net];
            let old = self.values[net];
            let new = (old & !m) | (self.next_value[net] & m);
            self.next_mask[net] = 0;
            if new != old {
                self.values[net] = new;
                changed.push(net);
            }
        }
        changed
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }
}
