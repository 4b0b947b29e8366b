//! Expression and assignment IR shared by every backend.
//!
//! Blocks are ordered lists of [`Assign`]s. Every expression node carries its
//! result width, so read/write sets and width rules can be checked once at
//! elaboration instead of being discovered by running the block.

use std::collections::BTreeSet;
use std::ops::{Add, BitAnd, BitOr, BitXor, Mul, Not, Shl, Shr, Sub};

use serde::{Deserialize, Serialize};

use crate::error::{Result, SimError};
use crate::model::SignalId;
use crate::value::{self, mask, sign_extend};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnaryOp {
    Not,
    ReduceAnd,
    ReduceOr,
    ReduceXor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BinaryOp {
    And,
    Or,
    Xor,
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Shl,
    Shr,
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
}

impl BinaryOp {
    pub const ALL: [BinaryOp; 16] = [
        BinaryOp::And,
        BinaryOp::Or,
        BinaryOp::Xor,
        BinaryOp::Add,
        BinaryOp::Sub,
        BinaryOp::Mul,
        BinaryOp::Div,
        BinaryOp::Rem,
        BinaryOp::Shl,
        BinaryOp::Shr,
        BinaryOp::Eq,
        BinaryOp::Ne,
        BinaryOp::Lt,
        BinaryOp::Gt,
        BinaryOp::Le,
        BinaryOp::Ge,
    ];

    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            BinaryOp::Eq | BinaryOp::Ne | BinaryOp::Lt | BinaryOp::Gt | BinaryOp::Le | BinaryOp::Ge
        )
    }

    pub fn is_shift(self) -> bool {
        matches!(self, BinaryOp::Shl | BinaryOp::Shr)
    }

    /// Apply to two operands already reduced to their widths; `m` is the
    /// result mask.
    #[inline(always)]
    pub fn apply(self, l: u64, r: u64, m: u64) -> u64 {
        match self {
            BinaryOp::And => l & r,
            BinaryOp::Or => l | r,
            BinaryOp::Xor => l ^ r,
            BinaryOp::Add => l.wrapping_add(r) & m,
            BinaryOp::Sub => l.wrapping_sub(r) & m,
            BinaryOp::Mul => l.wrapping_mul(r) & m,
            BinaryOp::Div => if r != 0 { l / r } else { 0 },
            BinaryOp::Rem => if r != 0 { l % r } else { 0 },
            BinaryOp::Shl => if r >= 64 { 0 } else { (l << r) & m },
            BinaryOp::Shr => if r >= 64 { 0 } else { l >> r },
            BinaryOp::Eq => (l == r) as u64,
            BinaryOp::Ne => (l != r) as u64,
            BinaryOp::Lt => (l < r) as u64,
            BinaryOp::Gt => (l > r) as u64,
            BinaryOp::Le => (l <= r) as u64,
            BinaryOp::Ge => (l >= r) as u64,
        }
    }
}

impl UnaryOp {
    pub const ALL: [UnaryOp; 4] = [UnaryOp::Not, UnaryOp::ReduceAnd, UnaryOp::ReduceOr, UnaryOp::ReduceXor];

    /// `operand_mask` is needed by the AND reduction, `m` masks the result.
    #[inline(always)]
    pub fn apply(self, v: u64, operand_mask: u64, m: u64) -> u64 {
        match self {
            UnaryOp::Not => !v & m,
            UnaryOp::ReduceAnd => ((v & operand_mask) == operand_mask) as u64,
            UnaryOp::ReduceOr => (v != 0) as u64,
            UnaryOp::ReduceXor => (v.count_ones() & 1) as u64,
        }
    }
}

#[derive(Debug, Clone)]
pub enum Expr {
    Signal { id: SignalId, width: usize },
    Literal { value: u64, width: usize },
    Unary { op: UnaryOp, operand: Box<Expr>, width: usize },
    Binary { op: BinaryOp, left: Box<Expr>, right: Box<Expr>, width: usize },
    Mux { cond: Box<Expr>, when_true: Box<Expr>, when_false: Box<Expr>, width: usize },
    Slice { base: Box<Expr>, low: usize, width: usize },
    Concat { parts: Vec<Expr>, width: usize },
    Zext { expr: Box<Expr>, width: usize },
    Sext { expr: Box<Expr>, width: usize },
}

impl Expr {
    pub fn lit(value: u64, width: usize) -> Expr {
        Expr::Literal { value, width }
    }

    pub fn width(&self) -> usize {
        match self {
            Expr::Signal { width, .. }
            | Expr::Literal { width, .. }
            | Expr::Unary { width, .. }
            | Expr::Binary { width, .. }
            | Expr::Mux { width, .. }
            | Expr::Slice { width, .. }
            | Expr::Concat { width, .. }
            | Expr::Zext { width, .. }
            | Expr::Sext { width, .. } => *width,
        }
    }

    fn binary(self, op: BinaryOp, rhs: Expr) -> Expr {
        let width = if op.is_comparison() { 1 } else { self.width() };
        Expr::Binary { op, left: Box::new(self), right: Box::new(rhs), width }
    }

    fn unary(self, op: UnaryOp) -> Expr {
        let width = if op == UnaryOp::Not { self.width() } else { 1 };
        Expr::Unary { op, operand: Box::new(self), width }
    }

    pub fn cmp_eq(self, rhs: Expr) -> Expr {
        self.binary(BinaryOp::Eq, rhs)
    }

    pub fn cmp_ne(self, rhs: Expr) -> Expr {
        self.binary(BinaryOp::Ne, rhs)
    }

    pub fn cmp_lt(self, rhs: Expr) -> Expr {
        self.binary(BinaryOp::Lt, rhs)
    }

    pub fn cmp_gt(self, rhs: Expr) -> Expr {
        self.binary(BinaryOp::Gt, rhs)
    }

    pub fn cmp_le(self, rhs: Expr) -> Expr {
        self.binary(BinaryOp::Le, rhs)
    }

    pub fn cmp_ge(self, rhs: Expr) -> Expr {
        self.binary(BinaryOp::Ge, rhs)
    }

    pub fn div(self, rhs: Expr) -> Expr {
        self.binary(BinaryOp::Div, rhs)
    }

    pub fn rem(self, rhs: Expr) -> Expr {
        self.binary(BinaryOp::Rem, rhs)
    }

    pub fn reduce_and(self) -> Expr {
        self.unary(UnaryOp::ReduceAnd)
    }

    pub fn reduce_or(self) -> Expr {
        self.unary(UnaryOp::ReduceOr)
    }

    pub fn reduce_xor(self) -> Expr {
        self.unary(UnaryOp::ReduceXor)
    }

    /// Bits `[low, high)`.
    pub fn slice(self, low: usize, high: usize) -> Expr {
        Expr::Slice { base: Box::new(self), low, width: high.saturating_sub(low) }
    }

    pub fn zext(self, width: usize) -> Expr {
        Expr::Zext { expr: Box::new(self), width }
    }

    pub fn sext(self, width: usize) -> Expr {
        Expr::Sext { expr: Box::new(self), width }
    }

    pub fn mux(cond: Expr, when_true: Expr, when_false: Expr) -> Expr {
        let width = when_true.width();
        Expr::Mux {
            cond: Box::new(cond),
            when_true: Box::new(when_true),
            when_false: Box::new(when_false),
            width,
        }
    }

    /// Most-significant part first.
    pub fn concat(parts: Vec<Expr>) -> Expr {
        let width = parts.iter().map(Expr::width).sum();
        Expr::Concat { parts, width }
    }

    /// Every signal this expression reads.
    pub fn for_each_signal<F: FnMut(SignalId)>(&self, f: &mut F) {
        match self {
            Expr::Signal { id, .. } => f(*id),
            Expr::Literal { .. } => {}
            Expr::Unary { operand, .. } => operand.for_each_signal(f),
            Expr::Binary { left, right, .. } => {
                left.for_each_signal(f);
                right.for_each_signal(f);
            }
            Expr::Mux { cond, when_true, when_false, .. } => {
                cond.for_each_signal(f);
                when_true.for_each_signal(f);
                when_false.for_each_signal(f);
            }
            Expr::Slice { base, .. } => base.for_each_signal(f),
            Expr::Concat { parts, .. } => {
                for part in parts {
                    part.for_each_signal(f);
                }
            }
            Expr::Zext { expr, .. } | Expr::Sext { expr, .. } => expr.for_each_signal(f),
        }
    }

    pub fn signals(&self) -> BTreeSet<SignalId> {
        let mut deps = BTreeSet::new();
        self.for_each_signal(&mut |id| {
            deps.insert(id);
        });
        deps
    }

    /// Rewrite every signal reference in place.
    pub fn map_signals<F: FnMut(SignalId) -> SignalId>(&mut self, f: &mut F) {
        match self {
            Expr::Signal { id, .. } => *id = f(*id),
            Expr::Literal { .. } => {}
            Expr::Unary { operand, .. } => operand.map_signals(f),
            Expr::Binary { left, right, .. } => {
                left.map_signals(f);
                right.map_signals(f);
            }
            Expr::Mux { cond, when_true, when_false, .. } => {
                cond.map_signals(f);
                when_true.map_signals(f);
                when_false.map_signals(f);
            }
            Expr::Slice { base, .. } => base.map_signals(f),
            Expr::Concat { parts, .. } => {
                for part in parts {
                    part.map_signals(f);
                }
            }
            Expr::Zext { expr, .. } | Expr::Sext { expr, .. } => expr.map_signals(f),
        }
    }

    /// Check the width rules of every node.
    pub fn validate(&self) -> Result<()> {
        value::check_width(self.width())?;
        match self {
            Expr::Signal { .. } => Ok(()),
            Expr::Literal { value, width } => {
                if value & !mask(*width) != 0 {
                    return Err(SimError::Width(format!(
                        "literal {:#x} does not fit in {} bits",
                        value, width
                    )));
                }
                Ok(())
            }
            Expr::Unary { op, operand, width } => {
                operand.validate()?;
                let expected = if *op == UnaryOp::Not { operand.width() } else { 1 };
                expect_width(*width, expected, "unary result")
            }
            Expr::Binary { op, left, right, width } => {
                left.validate()?;
                right.validate()?;
                if op.is_shift() {
                    return expect_width(*width, left.width(), "shift result");
                }
                expect_width(right.width(), left.width(), &format!("{:?} operands", op))?;
                let expected = if op.is_comparison() { 1 } else { left.width() };
                expect_width(*width, expected, &format!("{:?} result", op))
            }
            Expr::Mux { cond, when_true, when_false, width } => {
                cond.validate()?;
                expect_width(cond.width(), 1, "mux condition")?;
                when_true.validate()?;
                when_false.validate()?;
                expect_width(when_false.width(), when_true.width(), "mux arms")?;
                expect_width(*width, when_true.width(), "mux result")
            }
            Expr::Slice { base, low, width } => {
                base.validate()?;
                value::check_range(*low, low + width, base.width())
            }
            Expr::Concat { parts, width } => {
                for part in parts {
                    part.validate()?;
                }
                let total: usize = parts.iter().map(Expr::width).sum();
                expect_width(*width, total, "concat result")
            }
            Expr::Zext { expr, width } | Expr::Sext { expr, width } => {
                expr.validate()?;
                if *width < expr.width() {
                    return Err(SimError::Width(format!(
                        "cannot extend {} bits down to {}",
                        expr.width(),
                        width
                    )));
                }
                Ok(())
            }
        }
    }

    /// Tree-walking evaluation against a value table indexed by signal.
    pub fn eval(&self, values: &[u64]) -> u64 {
        match self {
            Expr::Signal { id, width } => values[id.0] & mask(*width),
            Expr::Literal { value, width } => value & mask(*width),
            Expr::Unary { op, operand, width } => {
                op.apply(operand.eval(values), mask(operand.width()), mask(*width))
            }
            Expr::Binary { op, left, right, width } => {
                op.apply(left.eval(values), right.eval(values), mask(*width))
            }
            Expr::Mux { cond, when_true, when_false, .. } => {
                if cond.eval(values) != 0 {
                    when_true.eval(values)
                } else {
                    when_false.eval(values)
                }
            }
            Expr::Slice { base, low, width } => (base.eval(values) >> low) & mask(*width),
            Expr::Concat { parts, width } => {
                let mut result = 0u64;
                let mut shift = 0usize;
                for part in parts.iter().rev() {
                    let v = part.eval(values) & mask(part.width());
                    if shift < 64 {
                        result |= v << shift;
                    }
                    shift += part.width();
                }
                result & mask(*width)
            }
            Expr::Zext { expr, width } => expr.eval(values) & mask(*width),
            Expr::Sext { expr, width } => sign_extend(expr.eval(values), expr.width()) & mask(*width),
        }
    }
}

fn expect_width(actual: usize, expected: usize, what: &str) -> Result<()> {
    if actual != expected {
        return Err(SimError::Width(format!(
            "{} is {} bits wide, expected {}",
            what, actual, expected
        )));
    }
    Ok(())
}

macro_rules! impl_expr_op {
    ($trait:ident, $fn:ident, $op:expr) => {
        impl $trait for Expr {
            type Output = Expr;

            fn $fn(self, rhs: Expr) -> Expr {
                self.binary($op, rhs)
            }
        }
    };
}

impl_expr_op!(BitAnd, bitand, BinaryOp::And);
impl_expr_op!(BitOr, bitor, BinaryOp::Or);
impl_expr_op!(BitXor, bitxor, BinaryOp::Xor);
impl_expr_op!(Add, add, BinaryOp::Add);
impl_expr_op!(Sub, sub, BinaryOp::Sub);
impl_expr_op!(Mul, mul, BinaryOp::Mul);
impl_expr_op!(Shl, shl, BinaryOp::Shl);
impl_expr_op!(Shr, shr, BinaryOp::Shr);

impl Not for Expr {
    type Output = Expr;

    fn not(self) -> Expr {
        self.unary(UnaryOp::Not)
    }
}

/// Left-hand side of an assignment: a whole signal or bits `[low, high)` of it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Target {
    pub signal: SignalId,
    pub range: Option<(usize, usize)>,
}

impl Target {
    pub fn whole(signal: SignalId) -> Self {
        Self { signal, range: None }
    }

    pub fn slice(signal: SignalId, low: usize, high: usize) -> Self {
        Self { signal, range: Some((low, high)) }
    }

    /// `(shift, mask)` for a target on a signal of `signal_width` bits.
    pub fn placement(&self, signal_width: usize) -> (usize, u64) {
        match self.range {
            None => (0, mask(signal_width)),
            Some((lo, hi)) => (lo, value::range_mask(lo, hi)),
        }
    }

    pub fn width(&self, signal_width: usize) -> usize {
        match self.range {
            None => signal_width,
            Some((lo, hi)) => hi.saturating_sub(lo),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Assign {
    pub target: Target,
    pub expr: Expr,
}

impl Assign {
    pub fn new(signal: SignalId, expr: Expr) -> Self {
        Self { target: Target::whole(signal), expr }
    }

    pub fn slice(signal: SignalId, low: usize, high: usize, expr: Expr) -> Self {
        Self { target: Target::slice(signal, low, high), expr }
    }
}
