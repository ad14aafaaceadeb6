//! A configuration under test together with everything measured for it.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

use tw_types::{Configuration, StatsError};

use crate::results::{ResultSettings, ResultsDb, SharedResults};

pub type CandidateId = Uuid;

#[derive(Debug)]
pub struct Candidate {
    pub id: CandidateId,
    pub configuration: Configuration,
    /// One results store per metric, in metric order.
    pub metrics: Vec<ResultsDb>,
}

impl Candidate {
    pub fn new(configuration: Configuration, metrics: &[String], settings: ResultSettings) -> Self {
        Self {
            id: Uuid::new_v4(),
            configuration,
            metrics: metrics
                .iter()
                .map(|m| ResultsDb::new(m.clone(), settings))
                .collect(),
        }
    }

    /// New candidate with a copied configuration that shares this one's
    /// result distributions. Samples added through either are seen by both.
    /// Only sizes that already exist are shared; a size first measured after
    /// the clone gets a separate distribution on each side.
    pub fn clone_aliased(&self) -> Self {
        Self {
            id: Uuid::new_v4(),
            configuration: self.configuration.clone(),
            metrics: self.metrics.iter().map(ResultsDb::aliased).collect(),
        }
    }

    pub fn metric_index(&self, metric: &str) -> Option<usize> {
        self.metrics.iter().position(|db| db.metric() == metric)
    }

    /// Distribution for `metric_idx` at size `n`, created on first use.
    pub fn results(&mut self, metric_idx: usize, n: u64) -> Option<SharedResults> {
        self.metrics.get_mut(metric_idx).map(|db| db.at(n))
    }

    /// Per-run limit implied by what is already measured at `n`, if anything.
    pub fn time_limit(&self, metric_idx: usize, n: u64, confidence: f64, multiplier: f64) -> Option<f64> {
        let results = self.metrics.get(metric_idx)?.get(n)?;
        let limit = results.lock().time_limit(confidence, multiplier);
        limit
    }

    pub fn clear_results_above(&mut self, n: u64) {
        debug!("candidate {}: clearing results for n >= {}", self.id, n);
        for db in &mut self.metrics {
            db.clear_above(n);
        }
    }

    pub fn clear_results(&mut self) {
        for db in &mut self.metrics {
            db.clear();
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    First,
    Second,
}

/// Outcome of a go/no-go comparison between two candidates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Comparison {
    pub p_value: f64,
    pub mean_a: f64,
    pub mean_b: f64,
    /// Side with the lower mean, `None` on a tie.
    pub faster: Option<Side>,
    /// Whether `p_value` falls below the requested significance level.
    pub significant: bool,
}

pub fn compare_candidates(
    a: &Candidate,
    b: &Candidate,
    metric_idx: usize,
    n: u64,
    significance: f64,
) -> Result<Comparison, StatsError> {
    let lookup = |c: &Candidate| {
        let db = c.metrics.get(metric_idx);
        let missing = || StatsError::NoDistribution {
            metric: db.map(|d| d.metric().to_string()).unwrap_or_else(|| metric_idx.to_string()),
            n,
        };
        db.and_then(|d| d.get(n)).ok_or_else(missing)
    };
    let da = lookup(a)?;
    let db = lookup(b)?;

    // Aliased candidates share the same mutex, so there is nothing to compare.
    if Arc::ptr_eq(&da, &db) {
        let guard = da.lock();
        let mean = guard.mean().ok_or_else(|| StatsError::Empty {
            side: "first".to_string(),
        })?;
        return Ok(Comparison {
            p_value: 1.0,
            mean_a: mean,
            mean_b: mean,
            faster: None,
            significant: false,
        });
    }

    let left = da.lock();
    let right = db.lock();
    let p_value = left.compare(&right)?;
    let (mean_a, mean_b) = match (left.mean(), right.mean()) {
        (Some(x), Some(y)) => (x, y),
        _ => {
            return Err(StatsError::Empty {
                side: "first".to_string(),
            })
        }
    };
    let faster = if mean_a < mean_b {
        Some(Side::First)
    } else if mean_b < mean_a {
        Some(Side::Second)
    } else {
        None
    };
    Ok(Comparison {
        p_value,
        mean_a,
        mean_b,
        faster,
        significant: p_value < significance,
    })
}
