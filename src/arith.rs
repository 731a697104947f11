//! Overflow predicates for the fixed-width weight arithmetic.
//!
//! Weights are `u32` fixed-point values (16.16 by convention, see
//! [`crate::bucket::WEIGHT_ONE`]). Every place that combines weights
//! consults these predicates before committing a result, so an overflow
//! surfaces as [`crate::Error::Overflow`] rather than a wrapped sum.

/// Returns true if `a + b` would overflow the weight width.
#[inline]
#[must_use]
pub fn addition_is_unsafe(a: u32, b: u32) -> bool {
    a.checked_add(b).is_none()
}

/// Returns true if `a * b` would overflow the weight width.
#[inline]
#[must_use]
pub fn multiplication_is_unsafe(a: u32, b: u32) -> bool {
    a.checked_mul(b).is_none()
}
