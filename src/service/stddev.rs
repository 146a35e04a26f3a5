//! Mean / standard deviation from quantity buckets and their pooled merge

use crate::models::QuantityBuckets;

/// Decimal digits kept on reported standard deviations.
pub const STD_DEV_DIGITS: i32 = 5;

/// Sample size, mean and population standard deviation of per-clear quantities.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Moments {
    pub n: f64,
    pub mean: f64,
    pub std_dev: f64,
}

impl Moments {
    pub const EMPTY: Moments = Moments {
        n: 0.0,
        mean: 0.0,
        std_dev: 0.0,
    };

    /// Clears missing from the buckets (`times - Σ buckets`) count as zero-quantity clears.
    pub fn from_buckets(buckets: &QuantityBuckets, times: i64) -> Self {
        if times <= 0 {
            return Self::EMPTY;
        }
        let n = times as f64;
        let (sum, sum_sq) = buckets.iter().fold((0.0, 0.0), |(sum, sum_sq), (&k, &b)| {
            let (k, b) = (k as f64, b as f64);
            (sum + b * k, sum_sq + b * k * k)
        });
        let mean = sum / n;
        let variance = (sum_sq / n - mean * mean).max(0.0);
        Self {
            n,
            mean,
            std_dev: variance.sqrt(),
        }
    }

    /// Pooled variance of the union of two samples.
    pub fn merge(self, other: Moments) -> Moments {
        if self.n <= 0.0 {
            return other;
        }
        if other.n <= 0.0 {
            return self;
        }
        let n = self.n + other.n;
        let mean = (self.n * self.mean + other.n * other.mean) / n;
        let variance = (self.n * (self.std_dev.powi(2) + (self.mean - mean).powi(2))
            + other.n * (other.std_dev.powi(2) + (other.mean - mean).powi(2)))
            / n;
        Moments {
            n,
            mean,
            std_dev: variance.max(0.0).sqrt(),
        }
    }
}

pub fn round_std_dev(value: f64) -> f64 {
    let factor = 10f64.powi(STD_DEV_DIGITS);
    (value * factor).round() / factor
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buckets(pairs: &[(i32, i64)]) -> QuantityBuckets {
        pairs.iter().copied().collect()
    }

    #[test]
    fn zero_mass_is_inferred_from_times() {
        // five clears with 1, three with 2, two with nothing
        let m = Moments::from_buckets(&buckets(&[(1, 5), (2, 3)]), 10);
        assert!((m.mean - 1.1).abs() < 1e-12);
        assert_eq!(round_std_dev(m.std_dev), 0.7);

        let explicit = Moments::from_buckets(&buckets(&[(0, 2), (1, 5), (2, 3)]), 10);
        assert_eq!(round_std_dev(explicit.std_dev), round_std_dev(m.std_dev));
    }

    #[test]
    fn no_clears_is_empty() {
        assert_eq!(Moments::from_buckets(&buckets(&[(1, 3)]), 0), Moments::EMPTY);
        let m = Moments::from_buckets(&buckets(&[(0, 4)]), 4);
        assert_eq!(m.mean, 0.0);
        assert_eq!(m.std_dev, 0.0);
    }

    #[test]
    fn merge_matches_computing_over_the_union() {
        let a = Moments::from_buckets(&buckets(&[(1, 2), (3, 1)]), 4);
        let b = Moments::from_buckets(&buckets(&[(2, 5)]), 6);
        let whole = Moments::from_buckets(&buckets(&[(1, 2), (2, 5), (3, 1)]), 10);
        let merged = a.merge(b);
        assert_eq!(merged.n, 10.0);
        assert!((merged.mean - whole.mean).abs() < 1e-12);
        assert!((merged.std_dev - whole.std_dev).abs() < 1e-12);
    }

    #[test]
    fn merge_is_associative_up_to_rounding() {
        let a = Moments::from_buckets(&buckets(&[(1, 3)]), 5);
        let b = Moments::from_buckets(&buckets(&[(2, 1), (4, 1)]), 3);
        let c = Moments::from_buckets(&buckets(&[(1, 7), (3, 2)]), 12);
        let left = a.merge(b).merge(c);
        let right = a.merge(b.merge(c));
        assert_eq!(round_std_dev(left.std_dev), round_std_dev(right.std_dev));
        assert!((left.mean - right.mean).abs() < 1e-12);
    }

    #[test]
    fn empty_is_merge_identity() {
        let a = Moments::from_buckets(&buckets(&[(1, 3)]), 5);
        assert_eq!(Moments::EMPTY.merge(a), a);
        assert_eq!(a.merge(Moments::EMPTY), a);
    }
}
