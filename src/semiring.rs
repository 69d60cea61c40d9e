//! Log-space semirings for chart scores.
//!
//! All chart values are log-domain scores, so "multiplication" is addition
//! of scores. The two semirings differ only in how alternatives combine:
//! - MaxPlus (Viterbi): keep the best alternative
//! - LogSum (inside): accumulate total mass with a stable log-add

use ordered_float::OrderedFloat;
use std::fmt::Debug;
use std::ops::{Add, Mul};

/// A semiring provides addition (aggregation) and multiplication (combination) operations.
pub trait Semiring: Clone + Copy + Debug + Default + PartialEq + Add<Output = Self> + Mul<Output = Self> {
    /// The additive identity (zero element).
    fn zero() -> Self;

    /// The multiplicative identity (one element).
    fn one() -> Self;

    /// Check if this value is the additive identity.
    fn is_zero(&self) -> bool;

    /// The underlying log-domain score.
    fn score(&self) -> f64;
}

/// `log(exp(x) + exp(y))` without overflow.
#[inline]
pub fn log_add(x: f64, y: f64) -> f64 {
    let (hi, lo) = if x >= y { (x, y) } else { (y, x) };
    if hi == f64::NEG_INFINITY {
        return f64::NEG_INFINITY;
    }
    if hi == f64::INFINITY {
        return f64::INFINITY;
    }
    hi + (lo - hi).exp().ln_1p()
}

/// `log(sum(exp(x_i)))` over a slice; `-inf` for an empty slice.
pub fn log_sum_exp(xs: &[f64]) -> f64 {
    let max = xs.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if max == f64::NEG_INFINITY || max == f64::INFINITY {
        return max;
    }
    let sum: f64 = xs.iter().map(|x| (x - max).exp()).sum();
    max + sum.ln()
}

/// Convert log scores into a normalized probability distribution.
///
/// Returns an empty vector when every score is `-inf`.
pub fn normalize_log(xs: &[f64]) -> Vec<f64> {
    let total = log_sum_exp(xs);
    if total == f64::NEG_INFINITY {
        return Vec::new();
    }
    xs.iter().map(|x| (x - total).exp()).collect()
}

/// Viterbi semiring over log scores: max and +.
#[derive(Clone, Copy, Debug, PartialEq, PartialOrd)]
pub struct MaxPlus(pub OrderedFloat<f64>);

impl MaxPlus {
    pub fn new(x: f64) -> Self {
        MaxPlus(OrderedFloat(x))
    }

    pub fn value(&self) -> f64 {
        self.0.into_inner()
    }
}

impl Default for MaxPlus {
    fn default() -> Self {
        MaxPlus::zero()
    }
}

impl Semiring for MaxPlus {
    fn zero() -> Self {
        MaxPlus::new(f64::NEG_INFINITY)
    }

    fn one() -> Self {
        MaxPlus::new(0.0)
    }

    fn is_zero(&self) -> bool {
        self.0.into_inner() == f64::NEG_INFINITY
    }

    fn score(&self) -> f64 {
        self.value()
    }
}

impl Add for MaxPlus {
    type Output = Self;

    fn add(self, other: Self) -> Self {
        MaxPlus(self.0.max(other.0))
    }
}

impl Mul for MaxPlus {
    type Output = Self;

    fn mul(self, other: Self) -> Self {
        MaxPlus(OrderedFloat(self.0.into_inner() + other.0.into_inner()))
    }
}

/// Inside semiring over log scores: log-add and +.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LogSum(pub f64);

impl LogSum {
    pub fn new(x: f64) -> Self {
        LogSum(x)
    }

    pub fn value(&self) -> f64 {
        self.0
    }
}

impl Default for LogSum {
    fn default() -> Self {
        LogSum::zero()
    }
}

impl Semiring for LogSum {
    fn zero() -> Self {
        LogSum(f64::NEG_INFINITY)
    }

    fn one() -> Self {
        LogSum(0.0)
    }

    fn is_zero(&self) -> bool {
        self.0 == f64::NEG_INFINITY
    }

    fn score(&self) -> f64 {
        self.0
    }
}

impl Add for LogSum {
    type Output = Self;

    fn add(self, other: Self) -> Self {
        LogSum(log_add(self.0, other.0))
    }
}

impl Mul for LogSum {
    type Output = Self;

    fn mul(self, other: Self) -> Self {
        LogSum(self.0 + other.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_add_matches_direct() {
        let a: f64 = 0.3;
        let b: f64 = -1.7;
        let direct = (a.exp() + b.exp()).ln();
        assert!((log_add(a, b) - direct).abs() < 1e-12);
        assert!((log_add(b, a) - direct).abs() < 1e-12);
    }

    #[test]
    fn test_log_add_is_stable() {
        // exp(1000) overflows, the stable form does not.
        let x = log_add(1000.0, 1000.0);
        assert!((x - (1000.0 + 2f64.ln())).abs() < 1e-9);
        assert_eq!(log_add(f64::NEG_INFINITY, 5.0), 5.0);
        assert_eq!(log_add(f64::NEG_INFINITY, f64::NEG_INFINITY), f64::NEG_INFINITY);
    }

    #[test]
    fn test_log_sum_exp() {
        let xs = [0.0, 0.0, 0.0, 0.0];
        assert!((log_sum_exp(&xs) - 4f64.ln()).abs() < 1e-12);
        assert_eq!(log_sum_exp(&[]), f64::NEG_INFINITY);
    }

    #[test]
    fn test_normalize_log() {
        let p = normalize_log(&[1.0, 2.0, f64::NEG_INFINITY, 0.5]);
        let total: f64 = p.iter().sum();
        assert!((total - 1.0).abs() < 1e-12);
        assert_eq!(p[2], 0.0);
        assert!(p[1] > p[0] && p[0] > p[3]);
        assert!(normalize_log(&[f64::NEG_INFINITY]).is_empty());
    }

    #[test]
    fn test_maxplus_semiring() {
        let a = MaxPlus::new(3.0);
        let b = MaxPlus::new(5.0);

        assert_eq!(a + b, MaxPlus::new(5.0));
        assert_eq!(a * b, MaxPlus::new(8.0));

        // Identity elements
        assert_eq!(a + MaxPlus::zero(), a);
        assert_eq!(a * MaxPlus::one(), a);
        assert!(MaxPlus::zero().is_zero());
    }

    #[test]
    fn test_logsum_semiring() {
        let a = LogSum::new(2f64.ln());
        let b = LogSum::new(3f64.ln());

        assert!(((a + b).value() - 5f64.ln()).abs() < 1e-12);
        assert!(((a * b).value() - 6f64.ln()).abs() < 1e-12);
        assert_eq!((a + LogSum::zero()).value(), a.value());
        assert_eq!(a * LogSum::one(), a);
    }
}
