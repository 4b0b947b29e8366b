//! Small building blocks for composing designs.

use crate::error::Result;
use crate::ir::Assign;
use crate::model::{Design, ModelId, SignalId};

/// A register child model with ports `in_` and `out`, returned in that order.
pub fn register(
    d: &mut Design,
    parent: ModelId,
    name: &str,
    width: usize,
    reset: u64,
) -> Result<(SignalId, SignalId)> {
    let m = d.add_model(parent, name)?;
    let input = d.input(m, "in_", width)?;
    let out = d.reg_output(m, "out", width, reset)?;
    let next = d.sig(input);
    d.clocked(m, "seq", vec![Assign::new(out, next)]);
    Ok((input, out))
}

/// A combinational wire-through child model with ports `in_` and `out`.
pub fn pass_through(d: &mut Design, parent: ModelId, name: &str, width: usize) -> Result<(SignalId, SignalId)> {
    let m = d.add_model(parent, name)?;
    let input = d.input(m, "in_", width)?;
    let out = d.output(m, "out", width)?;
    let value = d.sig(input);
    d.comb(m, "comb", vec![Assign::new(out, value)]);
    Ok((input, out))
}
