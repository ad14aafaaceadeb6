//! Welch's unequal-variance two-sample t-test.

use crate::normal::student_t_two_sided;

/// Count, mean and (unbiased) variance of one side of a comparison.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SampleMoments {
    pub n: usize,
    pub mean: f64,
    pub variance: f64,
}

impl SampleMoments {
    /// Moments of `samples`; a single sample gets zero variance.
    pub fn from_samples(samples: &[f64]) -> Option<Self> {
        if samples.is_empty() {
            return None;
        }
        let n = samples.len();
        let mean = samples.iter().sum::<f64>() / n as f64;
        let variance = if n < 2 {
            0.0
        } else {
            samples.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / (n - 1) as f64
        };
        Some(Self { n, mean, variance })
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WelchTest {
    pub statistic: f64,
    pub df: f64,
    /// Two-sided p-value for the null hypothesis of equal means.
    pub p_value: f64,
}

pub fn welch_t_test(a: &SampleMoments, b: &SampleMoments) -> WelchTest {
    let va = a.variance / a.n.max(1) as f64;
    let vb = b.variance / b.n.max(1) as f64;
    let se2 = va + vb;
    let diff = a.mean - b.mean;

    if se2 <= 0.0 || !se2.is_finite() {
        // No spread on either side: the means either match exactly or they don't.
        let (statistic, p_value) = if diff == 0.0 {
            (0.0, 1.0)
        } else {
            (diff.signum() * f64::INFINITY, 0.0)
        };
        return WelchTest {
            statistic,
            df: f64::INFINITY,
            p_value,
        };
    }

    let statistic = diff / se2.sqrt();
    // Welch-Satterthwaite degrees of freedom; a single-sample side counts as one.
    let df_denom = va.powi(2) / (a.n.saturating_sub(1).max(1)) as f64
        + vb.powi(2) / (b.n.saturating_sub(1).max(1)) as f64;
    let df = se2.powi(2) / df_denom;

    WelchTest {
        statistic,
        df,
        p_value: student_t_two_sided(statistic.abs(), df),
    }
}

/// Convenience wrapper over raw samples; `None` if either side is empty.
pub fn welch_t_test_samples(a: &[f64], b: &[f64]) -> Option<WelchTest> {
    Some(welch_t_test(
        &SampleMoments::from_samples(a)?,
        &SampleMoments::from_samples(b)?,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_samples_are_indistinguishable() {
        let samples = [100.0, 102.0, 98.0, 101.0, 99.0, 100.0, 101.0, 99.0];
        let result = welch_t_test_samples(&samples, &samples).unwrap();
        assert_eq!(result.statistic, 0.0);
        assert!(result.p_value > 0.99);
    }

    #[test]
    fn clear_difference_is_significant() {
        let baseline = [100.0, 102.0, 98.0, 101.0, 99.0, 100.0, 101.0, 99.0];
        let candidate = [200.0, 202.0, 198.0, 201.0, 199.0, 200.0, 201.0, 199.0];
        let result = welch_t_test_samples(&baseline, &candidate).unwrap();
        assert!(result.statistic < 0.0);
        assert!(result.p_value < 1e-6);
    }

    #[test]
    fn matches_reference_p_value() {
        // t = -1.897, df = 5.88, two-sided p = 0.1075
        let result = welch_t_test_samples(&[1.0, 2.0, 3.0, 4.0, 5.0], &[2.0, 4.0, 6.0, 8.0, 10.0]).unwrap();
        assert!((result.p_value - 0.1075).abs() < 1e-3, "p={}", result.p_value);
    }

    #[test]
    fn zero_variance_sides() {
        let same = welch_t_test_samples(&[5.0, 5.0], &[5.0]).unwrap();
        assert_eq!(same.p_value, 1.0);
        let apart = welch_t_test_samples(&[5.0, 5.0], &[6.0, 6.0]).unwrap();
        assert_eq!(apart.p_value, 0.0);
        assert!(welch_t_test_samples(&[], &[1.0]).is_none());
    }
}
