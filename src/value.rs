//! Fixed-width unsigned bit-vector values (1 to 64 bits).
//!
//! Arithmetic wraps at the declared width the way a hardware register does.
//! Binary operators require both operands to have the same width; mix widths
//! with [`Bits::zext`] / [`Bits::sext`] first.

use std::fmt;
use std::ops::{Add, BitAnd, BitOr, BitXor, Mul, Not, Shl, Shr, Sub};

use serde::{Deserialize, Serialize};

use crate::error::{Result, SimError};

pub const MAX_WIDTH: usize = 64;

#[inline(always)]
pub fn mask(width: usize) -> u64 {
    if width >= 64 { u64::MAX } else { (1u64 << width) - 1 }
}

/// Mask covering bits `[lo, hi)`.
#[inline(always)]
pub fn range_mask(lo: usize, hi: usize) -> u64 {
    mask(hi - lo) << lo
}

pub(crate) fn check_width(width: usize) -> Result<()> {
    if width == 0 || width > MAX_WIDTH {
        return Err(SimError::Width(format!(
            "width {} is outside 1..={}",
            width, MAX_WIDTH
        )));
    }
    Ok(())
}

pub(crate) fn check_range(lo: usize, hi: usize, width: usize) -> Result<()> {
    if hi > width || lo >= hi {
        return Err(SimError::Range { lo, hi, width });
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Bits {
    width: usize,
    value: u64,
}

impl Bits {
    /// Checked constructor: `value` must fit in `width` bits.
    pub fn new(width: usize, value: u64) -> Result<Self> {
        check_width(width)?;
        if value & !mask(width) != 0 {
            return Err(SimError::Width(format!(
                "{:#x} does not fit in {} bits",
                value, width
            )));
        }
        Ok(Self { width, value })
    }

    /// Wrapping constructor, drops the bits above `width`.
    pub fn truncate(width: usize, value: u64) -> Result<Self> {
        check_width(width)?;
        Ok(Self { width, value: value & mask(width) })
    }

    pub(crate) fn from_raw(width: usize, value: u64) -> Self {
        debug_assert!(width >= 1 && width <= MAX_WIDTH);
        Self { width, value: value & mask(width) }
    }

    pub fn zero(width: usize) -> Result<Self> {
        Self::new(width, 0)
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn value(&self) -> u64 {
        self.value
    }

    pub fn is_zero(&self) -> bool {
        self.value == 0
    }

    pub fn bit(&self, idx: usize) -> Result<bool> {
        check_range(idx, idx + 1, self.width)?;
        Ok((self.value >> idx) & 1 == 1)
    }

    /// Bits `[lo, hi)` as a `hi - lo` wide value.
    pub fn slice(&self, lo: usize, hi: usize) -> Result<Bits> {
        check_range(lo, hi, self.width)?;
        Ok(Bits::from_raw(hi - lo, self.value >> lo))
    }

    /// Replace bits `[lo, hi)` with `part`, leaving every other bit untouched.
    pub fn set_slice(&mut self, lo: usize, hi: usize, part: Bits) -> Result<()> {
        check_range(lo, hi, self.width)?;
        if part.width != hi - lo {
            return Err(SimError::Width(format!(
                "cannot write a {}-bit value into [{}:{})",
                part.width, lo, hi
            )));
        }
        let m = range_mask(lo, hi);
        self.value = (self.value & !m) | ((part.value << lo) & m);
        Ok(())
    }

    /// Concatenate, most-significant operand first.
    pub fn concat(parts: &[Bits]) -> Result<Bits> {
        let width: usize = parts.iter().map(|p| p.width).sum();
        check_width(width)?;
        let value = parts
            .iter()
            .fold(0u64, |acc, p| if p.width >= 64 { p.value } else { (acc << p.width) | p.value });
        Ok(Bits { width, value })
    }

    pub fn zext(&self, width: usize) -> Result<Bits> {
        check_width(width)?;
        if width < self.width {
            return Err(SimError::Width(format!(
                "cannot zero-extend {} bits to {}",
                self.width, width
            )));
        }
        Ok(Bits { width, value: self.value })
    }

    pub fn sext(&self, width: usize) -> Result<Bits> {
        check_width(width)?;
        if width < self.width {
            return Err(SimError::Width(format!(
                "cannot sign-extend {} bits to {}",
                self.width, width
            )));
        }
        Ok(Bits::from_raw(width, sign_extend(self.value, self.width)))
    }

    fn same_width(&self, rhs: &Bits, op: &str) {
        if self.width != rhs.width {
            panic!(
                "cannot use `{}` with bit vector of width {} and bit vector of width {}",
                op, self.width, rhs.width
            )
        }
    }
}

/// Sign-extend the low `width` bits of `value` to 64 bits.
#[inline(always)]
pub fn sign_extend(value: u64, width: usize) -> u64 {
    if width >= 64 {
        return value;
    }
    let shift = 64 - width as u32;
    (((value << shift) as i64) >> shift) as u64
}

impl fmt::Display for Bits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}'h{:x}", self.width, self.value)
    }
}

impl fmt::LowerHex for Bits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.value, f)
    }
}

impl fmt::Binary for Bits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Binary::fmt(&self.value, f)
    }
}

impl PartialEq<u64> for Bits {
    fn eq(&self, other: &u64) -> bool {
        self.value == *other
    }
}

macro_rules! impl_wrapping_op {
    ($trait:ident, $fn:ident, $sym:literal, |$a:ident, $b:ident| $body:expr) => {
        impl $trait for Bits {
            type Output = Bits;

            fn $fn(self, rhs: Bits) -> Bits {
                self.same_width(&rhs, $sym);
                let ($a, $b) = (self.value, rhs.value);
                Bits::from_raw(self.width, $body)
            }
        }
    };
}

impl_wrapping_op!(BitAnd, bitand, "&", |a, b| a & b);
impl_wrapping_op!(BitOr, bitor, "|", |a, b| a | b);
impl_wrapping_op!(BitXor, bitxor, "^", |a, b| a ^ b);
impl_wrapping_op!(Add, add, "+", |a, b| a.wrapping_add(b));
impl_wrapping_op!(Sub, sub, "-", |a, b| a.wrapping_sub(b));
impl_wrapping_op!(Mul, mul, "*", |a, b| a.wrapping_mul(b));

impl Not for Bits {
    type Output = Bits;

    fn not(self) -> Bits {
        Bits::from_raw(self.width, !self.value)
    }
}

impl Shl<u32> for Bits {
    type Output = Bits;

    fn shl(self, rhs: u32) -> Bits {
        Bits::from_raw(self.width, self.value.checked_shl(rhs).unwrap_or(0))
    }
}

impl Shr<u32> for Bits {
    type Output = Bits;

    fn shr(self, rhs: u32) -> Bits {
        Bits::from_raw(self.width, self.value.checked_shr(rhs).unwrap_or(0))
    }
}
