//! Configuration messages and the source that streams them.

use std::collections::VecDeque;

use crate::backend::Simulate;
use crate::error::{Result, SimError};
use crate::extensions::harness::Collaborator;
use crate::value::mask;

/// Width of a packed message: 3-bit selector above a 32-bit value.
pub const MSG_WIDTH: usize = 35;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Selector {
    Go = 0,
    Size = 1,
    MatrixBase = 2,
    VectorBase = 3,
    DestBase = 4,
}

impl TryFrom<u64> for Selector {
    type Error = SimError;

    fn try_from(raw: u64) -> Result<Self> {
        match raw {
            0 => Ok(Selector::Go),
            1 => Ok(Selector::Size),
            2 => Ok(Selector::MatrixBase),
            3 => Ok(Selector::VectorBase),
            4 => Ok(Selector::DestBase),
            other => Err(SimError::Parse(format!("unknown config selector {}", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfigMsg {
    pub selector: Selector,
    pub value: u32,
}

impl ConfigMsg {
    pub fn new(selector: Selector, value: u32) -> Self {
        Self { selector, value }
    }

    pub fn encode(&self) -> u64 {
        ((self.selector as u64) << 32) | self.value as u64
    }

    pub fn decode(raw: u64) -> Result<Self> {
        if raw & !mask(MSG_WIDTH) != 0 {
            return Err(SimError::Width(format!(
                "config message {:#x} does not fit in {} bits",
                raw, MSG_WIDTH
            )));
        }
        Ok(Self { selector: Selector::try_from(raw >> 32)?, value: raw as u32 })
    }

    /// Size, matrix, vector and destination setup followed by a start pulse.
    pub fn program(size: u32, matrix_base: u32, vector_base: u32, dest_base: u32) -> Vec<ConfigMsg> {
        vec![
            ConfigMsg::new(Selector::Size, size),
            ConfigMsg::new(Selector::MatrixBase, matrix_base),
            ConfigMsg::new(Selector::VectorBase, vector_base),
            ConfigMsg::new(Selector::DestBase, dest_base),
            ConfigMsg::new(Selector::Go, 1),
        ]
    }
}

/// Streams messages over `<prefix>val`, `<prefix>rdy` and `<prefix>msg`,
/// waiting `delay` cycles after each accepted message.
#[derive(Debug, Clone)]
pub struct TestSource {
    prefix: String,
    msgs: VecDeque<u64>,
    delay: u64,
    wait: u64,
    presented: bool,
}

impl TestSource {
    pub fn new(prefix: &str, msgs: &[ConfigMsg], delay: u64) -> Self {
        Self {
            prefix: prefix.to_string(),
            msgs: msgs.iter().map(ConfigMsg::encode).collect(),
            delay,
            wait: 0,
            presented: false,
        }
    }

    pub fn done(&self) -> bool {
        self.msgs.is_empty()
    }

    fn port(&self, name: &str) -> String {
        format!("{}{}", self.prefix, name)
    }
}

impl Collaborator for TestSource {
    fn drive(&mut self, sim: &mut dyn Simulate) -> Result<()> {
        let front = if self.wait == 0 { self.msgs.front().copied() } else { None };
        self.presented = front.is_some();
        sim.write(&self.port("val"), self.presented as u64)?;
        sim.write(&self.port("msg"), front.unwrap_or(0))
    }

    fn sample(&mut self, sim: &dyn Simulate) -> Result<()> {
        if self.presented && sim.peek(&self.port("rdy"))? != 0 {
            self.msgs.pop_front();
            self.wait = self.delay;
        } else if self.wait > 0 {
            self.wait -= 1;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_msg_packing() {
        let msg = ConfigMsg::new(Selector::DestBase, 160);
        assert_eq!(msg.encode(), (4 << 32) | 160);
        assert_eq!(ConfigMsg::decode(msg.encode()).unwrap(), msg);
        assert_eq!(ConfigMsg::new(Selector::Go, 0).encode(), 0);
        assert!(matches!(ConfigMsg::decode(5 << 32), Err(SimError::Parse(_))));
        assert!(matches!(ConfigMsg::decode(1 << 35), Err(SimError::Width(_))));
    }

    #[test]
    fn test_program_order() {
        let msgs = ConfigMsg::program(3, 0, 80, 160);
        let selectors: Vec<Selector> = msgs.iter().map(|m| m.selector).collect();
        assert_eq!(
            selectors,
            vec![Selector::Size, Selector::MatrixBase, Selector::VectorBase, Selector::DestBase, Selector::Go]
        );
        let source = TestSource::new("cfg_", &msgs, 0);
        assert!(!source.done());
        assert_eq!(source.port("msg"), "cfg_msg");
    }
}
