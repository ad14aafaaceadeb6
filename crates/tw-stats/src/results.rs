//! Per-input-size sample store with censored-sample interpolation.
//!
//! A [`ResultDistribution`] keeps two kinds of samples: real ones from runs
//! that finished, and censored ones from runs that hit their time limit and
//! therefore only give a lower bound. After every add the store rebuilds an
//! interpolated sample set in which each censored value is replaced by a
//! plausible draw from the upper tail of the fitted model, and refits a
//! normal to it.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use tw_types::{StatsError, TunerConfig};

use crate::normal::Normal;
use crate::ttest::{welch_t_test, SampleMoments};

/// Fitting knobs copied out of the tuner configuration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResultSettings {
    /// Stddev guess, as a fraction of the value, for a single sample.
    pub prior_stddev_pct: f64,
    /// Floor on the fitted stddev, as a fraction of the mean.
    pub min_std_pct: f64,
    /// Confidence used by the `Display` impl.
    pub display_confidence: f64,
}

impl Default for ResultSettings {
    fn default() -> Self {
        Self::from(&TunerConfig::default())
    }
}

impl From<&TunerConfig> for ResultSettings {
    fn from(config: &TunerConfig) -> Self {
        Self {
            prior_stddev_pct: config.prior_stddev_pct,
            min_std_pct: config.min_std_pct,
            display_confidence: config.display_confidence,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResultDistribution {
    settings: ResultSettings,
    real: Vec<f64>,
    censored: Vec<f64>,
    interpolated: Vec<f64>,
    distribution: Option<Normal>,
}

impl ResultDistribution {
    pub fn new(settings: ResultSettings) -> Self {
        Self {
            settings,
            real: Vec::new(),
            censored: Vec::new(),
            interpolated: Vec::new(),
            distribution: None,
        }
    }

    pub fn add_real(&mut self, value: f64) {
        self.real.push(value);
        self.refit();
    }

    /// Record a lower bound from a run that was cut off at `value`.
    pub fn add_censored(&mut self, value: f64) {
        self.censored.push(value);
        self.refit();
    }

    pub fn real_samples(&self) -> &[f64] {
        &self.real
    }

    pub fn censored_samples(&self) -> &[f64] {
        &self.censored
    }

    pub fn interpolated_samples(&self) -> &[f64] {
        &self.interpolated
    }

    /// Number of samples of either kind.
    pub fn len(&self) -> usize {
        self.real.len() + self.censored.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fitted model of a single observation.
    pub fn point_distribution(&self) -> Option<Normal> {
        self.distribution
    }

    /// Model of the sample mean: same center, variance divided by the sample count.
    pub fn mean_distribution(&self) -> Option<Normal> {
        let point = self.distribution?;
        let n = self.interpolated.len().max(1) as f64;
        Some(Normal::new(point.mean, (point.variance() / n).sqrt()))
    }

    pub fn mean(&self) -> Option<f64> {
        self.distribution.map(|d| d.mean)
    }

    /// Upper `confidence` quantile of the mean, scaled by `multiplier`.
    pub fn time_limit(&self, confidence: f64, multiplier: f64) -> Option<f64> {
        self.mean_distribution()
            .map(|d| d.ppf(confidence) * multiplier)
    }

    /// Two-sided p-value that `self` and `other` share a mean.
    pub fn compare(&self, other: &ResultDistribution) -> Result<f64, StatsError> {
        let a = self.moments().ok_or_else(|| StatsError::Empty {
            side: "first".to_string(),
        })?;
        let b = other.moments().ok_or_else(|| StatsError::Empty {
            side: "second".to_string(),
        })?;
        Ok(welch_t_test(&a, &b).p_value)
    }

    // A lone sample has no sample variance, so it borrows the fitted prior.
    fn moments(&self) -> Option<SampleMoments> {
        let mut moments = SampleMoments::from_samples(&self.interpolated)?;
        if moments.n < 2 {
            moments.variance = self.distribution.map(|d| d.variance()).unwrap_or(0.0);
        }
        Some(moments)
    }

    fn refit(&mut self) {
        self.interpolated.clear();
        self.distribution = None;

        if self.real.is_empty() {
            if self.censored.is_empty() {
                return;
            }
            let mean = self.censored.iter().sum::<f64>() / self.censored.len() as f64;
            self.interpolated.push(2.0 * mean);
            self.distribution = self.fit(&self.interpolated);
            return;
        }

        self.interpolated.extend_from_slice(&self.real);
        self.distribution = self.fit(&self.interpolated);

        let mut censored = self.censored.clone();
        censored.sort_by(|a, b| a.total_cmp(b));
        for bound in censored {
            let Some(model) = self.distribution else {
                break;
            };
            // Median of the tail beyond the bound, capped at twice the bound.
            let tail_median = model.isf(model.sf(bound) / 2.0);
            let value = bound.max((2.0 * bound).min(tail_median));
            self.interpolated.push(value);
            self.distribution = self.fit(&self.interpolated);
        }
    }

    fn fit(&self, samples: &[f64]) -> Option<Normal> {
        match samples {
            [] => None,
            [value] => Some(Normal::new(*value, value.abs() * self.settings.prior_stddev_pct)),
            _ => {
                let fitted = Normal::fit(samples)?;
                let floor = fitted.mean.abs() * self.settings.min_std_pct;
                Some(Normal::new(fitted.mean, fitted.std_dev.max(floor)))
            }
        }
    }

    /// Comma-separated raw samples, censored ones prefixed with `>`.
    pub fn raw_summary(&self) -> String {
        self.real
            .iter()
            .map(|v| format!("{v:.4}"))
            .chain(self.censored.iter().map(|v| format!(">{v:.4}")))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

impl Default for ResultDistribution {
    fn default() -> Self {
        Self::new(ResultSettings::default())
    }
}

impl fmt::Display for ResultDistribution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.mean_distribution() {
            None => write!(f, "???"),
            Some(d) => {
                let center = d.ppf(0.5);
                let low = d.ppf((1.0 - self.settings.display_confidence) / 2.0);
                write!(f, "{:.4} (+- {:.4})", center, center - low)
            }
        }
    }
}

/// Distribution shared between aliased candidates.
pub type SharedResults = Arc<Mutex<ResultDistribution>>;

/// Results for one metric, keyed by input size.
#[derive(Debug)]
pub struct ResultsDb {
    metric: String,
    settings: ResultSettings,
    by_size: BTreeMap<u64, SharedResults>,
}

impl ResultsDb {
    pub fn new(metric: impl Into<String>, settings: ResultSettings) -> Self {
        Self {
            metric: metric.into(),
            settings,
            by_size: BTreeMap::new(),
        }
    }

    pub fn metric(&self) -> &str {
        &self.metric
    }

    /// Distribution for size `n`, created empty on first access.
    pub fn at(&mut self, n: u64) -> SharedResults {
        let settings = self.settings;
        self.by_size
            .entry(n)
            .or_insert_with(|| Arc::new(Mutex::new(ResultDistribution::new(settings))))
            .clone()
    }

    pub fn get(&self, n: u64) -> Option<SharedResults> {
        self.by_size.get(&n).cloned()
    }

    pub fn sizes(&self) -> Vec<u64> {
        self.by_size.keys().copied().collect()
    }

    /// Copy of the map whose entries point at the same distributions.
    pub fn aliased(&self) -> Self {
        Self {
            metric: self.metric.clone(),
            settings: self.settings,
            by_size: self.by_size.clone(),
        }
    }

    /// Swap in fresh distributions for every size `>= n`.
    pub fn clear_above(&mut self, n: u64) {
        let settings = self.settings;
        for (_, slot) in self.by_size.range_mut(n..) {
            *slot = Arc::new(Mutex::new(ResultDistribution::new(settings)));
        }
    }

    pub fn clear(&mut self) {
        self.clear_above(0);
    }
}
