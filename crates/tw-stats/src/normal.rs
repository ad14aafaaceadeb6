//! Normal model and the special functions behind it.

use serde::{Deserialize, Serialize};
use std::f64::consts::{PI, SQRT_2};

/// Normal distribution `N(mean, std_dev²)`. A zero `std_dev` is a point mass.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Normal {
    pub mean: f64,
    pub std_dev: f64,
}

impl Normal {
    pub fn new(mean: f64, std_dev: f64) -> Self {
        Self {
            mean,
            std_dev: std_dev.abs(),
        }
    }

    /// Maximum-likelihood fit (population variance). `None` for an empty slice.
    pub fn fit(samples: &[f64]) -> Option<Self> {
        if samples.is_empty() {
            return None;
        }
        let n = samples.len() as f64;
        let mean = samples.iter().sum::<f64>() / n;
        let variance = samples.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n;
        Some(Self::new(mean, variance.sqrt()))
    }

    pub fn variance(&self) -> f64 {
        self.std_dev * self.std_dev
    }

    fn is_degenerate(&self) -> bool {
        self.std_dev <= 0.0 || !self.std_dev.is_finite()
    }

    pub fn pdf(&self, x: f64) -> f64 {
        if self.is_degenerate() {
            return if x == self.mean { f64::INFINITY } else { 0.0 };
        }
        let z = (x - self.mean) / self.std_dev;
        (-0.5 * z * z).exp() / (self.std_dev * (2.0 * PI).sqrt())
    }

    /// `P(X <= x)`
    pub fn cdf(&self, x: f64) -> f64 {
        if self.is_degenerate() {
            return if x < self.mean { 0.0 } else { 1.0 };
        }
        0.5 * erfc(-(x - self.mean) / (self.std_dev * SQRT_2))
    }

    /// Survival function `P(X > x)`, computed directly so the upper tail keeps precision.
    pub fn sf(&self, x: f64) -> f64 {
        if self.is_degenerate() {
            return if x < self.mean { 1.0 } else { 0.0 };
        }
        0.5 * erfc((x - self.mean) / (self.std_dev * SQRT_2))
    }

    /// Quantile function: the `x` with `cdf(x) == p`.
    pub fn ppf(&self, p: f64) -> f64 {
        if p <= 0.0 {
            return f64::NEG_INFINITY;
        }
        if p >= 1.0 {
            return f64::INFINITY;
        }
        if self.is_degenerate() {
            return self.mean;
        }
        self.mean + self.std_dev * inverse_standard_normal(p)
    }

    /// Inverse survival function: the `x` with `sf(x) == q`.
    pub fn isf(&self, q: f64) -> f64 {
        if q <= 0.0 {
            return f64::INFINITY;
        }
        if q >= 1.0 {
            return f64::NEG_INFINITY;
        }
        if self.is_degenerate() {
            return self.mean;
        }
        self.mean - self.std_dev * inverse_standard_normal(q)
    }
}

/// Complementary error function, fractional error below 1.2e-7 everywhere.
pub fn erfc(x: f64) -> f64 {
    let z = x.abs();
    let t = 1.0 / (1.0 + 0.5 * z);
    let poly = -z * z - 1.265_512_23
        + t * (1.000_023_68
            + t * (0.374_091_96
                + t * (0.096_784_18
                    + t * (-0.186_288_06
                        + t * (0.278_868_07
                            + t * (-1.135_203_98
                                + t * (1.488_515_87 + t * (-0.822_152_23 + t * 0.170_872_77))))))));
    let ans = t * poly.exp();
    if x >= 0.0 {
        ans
    } else {
        2.0 - ans
    }
}

/// Inverse of the standard normal CDF (Acklam) with one Halley refinement step.
pub fn inverse_standard_normal(p: f64) -> f64 {
    const A: [f64; 6] = [
        -3.969_683_028_665_376e1,
        2.209_460_984_245_205e2,
        -2.759_285_104_469_687e2,
        1.383_577_518_672_690e2,
        -3.066_479_806_614_716e1,
        2.506_628_277_459_239,
    ];
    const B: [f64; 5] = [
        -5.447_609_879_822_406e1,
        1.615_858_368_580_409e2,
        -1.556_989_798_598_866e2,
        6.680_131_188_771_972e1,
        -1.328_068_155_288_572e1,
    ];
    const C: [f64; 6] = [
        -7.784_894_002_430_293e-3,
        -3.223_964_580_411_365e-1,
        -2.400_758_277_161_838,
        -2.549_732_539_343_734,
        4.374_664_141_464_968,
        2.938_163_982_698_783,
    ];
    const D: [f64; 4] = [
        7.784_695_709_041_462e-3,
        3.224_671_290_700_398e-1,
        2.445_134_137_142_996,
        3.754_408_661_907_416,
    ];
    const P_LOW: f64 = 0.02425;

    if p <= 0.0 {
        return f64::NEG_INFINITY;
    }
    if p >= 1.0 {
        return f64::INFINITY;
    }

    let tail = |q: f64| {
        (((((C[0] * q + C[1]) * q + C[2]) * q + C[3]) * q + C[4]) * q + C[5])
            / ((((D[0] * q + D[1]) * q + D[2]) * q + D[3]) * q + 1.0)
    };

    let x = if p < P_LOW {
        tail((-2.0 * p.ln()).sqrt())
    } else if p <= 1.0 - P_LOW {
        let q = p - 0.5;
        let r = q * q;
        (((((A[0] * r + A[1]) * r + A[2]) * r + A[3]) * r + A[4]) * r + A[5]) * q
            / (((((B[0] * r + B[1]) * r + B[2]) * r + B[3]) * r + B[4]) * r + 1.0)
    } else {
        -tail((-2.0 * (1.0 - p).ln()).sqrt())
    };

    let e = 0.5 * erfc(-x / SQRT_2) - p;
    let u = e * (2.0 * PI).sqrt() * (x * x / 2.0).exp();
    x - u / (1.0 + x * u / 2.0)
}

pub fn ln_gamma(value: f64) -> f64 {
    if value <= 0.0 {
        return 0.0;
    }
    // Lanczos approximation (g=7, n=9)
    let lanczos_g = 7.0;
    #[allow(clippy::excessive_precision)]
    let coefficients = [
        0.999_999_999_999_809_93,
        676.520_368_121_885_1,
        -1_259.139_216_722_402_9,
        771.323_428_777_653_1,
        -176.615_029_162_140_6,
        12.507_343_278_686_905,
        -0.138_571_095_265_720_12,
        9.984_369_578_019_571_6e-6,
        1.505_632_735_149_311_6e-7,
    ];

    if value < 0.5 {
        // Reflection formula
        return PI.ln() - (PI * value).sin().ln() - ln_gamma(1.0 - value);
    }

    let x = value - 1.0;
    let mut sum = coefficients[0];
    for (i, c) in coefficients.iter().enumerate().skip(1) {
        sum += c / (x + i as f64);
    }
    let t = x + lanczos_g + 0.5;
    0.5 * (2.0 * PI).ln() + (x + 0.5) * t.ln() - t + sum.ln()
}

/// Regularized incomplete beta function `I_x(a, b)`.
pub fn incomplete_beta(x: f64, a: f64, b: f64) -> f64 {
    if x <= 0.0 {
        return 0.0;
    }
    if x >= 1.0 {
        return 1.0;
    }
    let ln_front = ln_gamma(a + b) - ln_gamma(a) - ln_gamma(b) + a * x.ln() + b * (1.0 - x).ln();
    if x < (a + 1.0) / (a + b + 2.0) {
        ln_front.exp() * beta_continued_fraction(x, a, b) / a
    } else {
        1.0 - ln_front.exp() * beta_continued_fraction(1.0 - x, b, a) / b
    }
}

// Modified Lentz evaluation of the incomplete beta continued fraction.
fn beta_continued_fraction(x: f64, a: f64, b: f64) -> f64 {
    const MAX_ITER: usize = 300;
    const EPS: f64 = 1e-14;
    const FPMIN: f64 = 1e-300;

    let qab = a + b;
    let qap = a + 1.0;
    let qam = a - 1.0;
    let mut c = 1.0;
    let mut d = 1.0 - qab * x / qap;
    if d.abs() < FPMIN {
        d = FPMIN;
    }
    d = 1.0 / d;
    let mut h = d;

    for m in 1..=MAX_ITER {
        let m = m as f64;
        let m2 = 2.0 * m;

        let aa = m * (b - m) * x / ((qam + m2) * (a + m2));
        d = 1.0 + aa * d;
        if d.abs() < FPMIN {
            d = FPMIN;
        }
        c = 1.0 + aa / c;
        if c.abs() < FPMIN {
            c = FPMIN;
        }
        d = 1.0 / d;
        h *= d * c;

        let aa = -(a + m) * (qab + m) * x / ((a + m2) * (qap + m2));
        d = 1.0 + aa * d;
        if d.abs() < FPMIN {
            d = FPMIN;
        }
        c = 1.0 + aa / c;
        if c.abs() < FPMIN {
            c = FPMIN;
        }
        d = 1.0 / d;
        let delta = d * c;
        h *= delta;
        if (delta - 1.0).abs() < EPS {
            break;
        }
    }
    h
}

/// Two-sided tail probability `P(|T| >= t)` of Student's t with `df` degrees of freedom.
pub fn student_t_two_sided(t: f64, df: f64) -> f64 {
    if !t.is_finite() {
        return 0.0;
    }
    if df <= 0.0 || !df.is_finite() {
        // Limit of large df
        return erfc(t.abs() / SQRT_2);
    }
    let x = df / (df + t * t);
    incomplete_beta(x, df / 2.0, 0.5).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f64, b: f64, tol: f64) -> bool {
        (a - b).abs() < tol
    }

    #[test]
    fn standard_normal_reference_values() {
        let n = Normal::new(0.0, 1.0);
        assert!(close(n.cdf(0.0), 0.5, 1e-7));
        assert!(close(n.cdf(1.96), 0.975_002, 1e-5));
        assert!(close(n.sf(1.96), 0.024_998, 1e-5));
        assert!(close(n.ppf(0.975), 1.959_964, 1e-5));
        assert!(close(n.isf(0.025), 1.959_964, 1e-5));
    }

    #[test]
    fn quantiles_invert_cdf() {
        let n = Normal::new(10.0, 2.5);
        for p in [0.001, 0.05, 0.3, 0.5, 0.8, 0.99] {
            assert!(close(n.cdf(n.ppf(p)), p, 1e-6), "p={p}");
            assert!(close(n.sf(n.isf(p)), p, 1e-6), "q={p}");
        }
    }

    #[test]
    fn degenerate_distribution() {
        let n = Normal::new(3.0, 0.0);
        assert_eq!(n.cdf(2.9), 0.0);
        assert_eq!(n.sf(3.1), 0.0);
        assert_eq!(n.ppf(0.2), 3.0);
        assert_eq!(n.isf(0.0), f64::INFINITY);
    }

    #[test]
    fn fit_uses_population_variance() {
        let n = Normal::fit(&[1.0, 3.0]).unwrap();
        assert!(close(n.mean, 2.0, 1e-12));
        assert!(close(n.std_dev, 1.0, 1e-12));
        assert!(Normal::fit(&[]).is_none());
    }

    #[test]
    fn ln_gamma_known_values() {
        assert!(close(ln_gamma(1.0), 0.0, 1e-6));
        assert!(close(ln_gamma(5.0), 24.0f64.ln(), 1e-6));
        assert!(close(ln_gamma(0.5), PI.sqrt().ln(), 1e-6));
    }

    #[test]
    fn student_t_reference_values() {
        // t=2.228 with df=10 is the two-sided 5% critical value
        assert!(close(student_t_two_sided(2.228, 10.0), 0.05, 1e-3));
        assert!(close(student_t_two_sided(0.0, 4.0), 1.0, 1e-9));
        // df=1 is Cauchy: P(|T|>1) = 0.5
        assert!(close(student_t_two_sided(1.0, 1.0), 0.5, 1e-6));
    }
}
