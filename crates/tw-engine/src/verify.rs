//! Final timing check of the tuned configuration.

use serde::{Deserialize, Serialize};
use tracing::info;

use tw_exec::{CandidateTester, TestOutcome};
use tw_types::{StatsError, TuneResult};

use crate::session::Session;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerifyReport {
    pub n: u64,
    pub trials: usize,
    pub timeouts: usize,
    pub mean: f64,
    /// Half-width of the confidence interval on the mean.
    pub half_width: f64,
}

impl VerifyReport {
    pub fn relative_half_width(&self) -> f64 {
        if self.mean == 0.0 {
            0.0
        } else {
            self.half_width / self.mean.abs()
        }
    }
}

impl std::fmt::Display for VerifyReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "n={}: {:.6} (+- {:.6}) over {} trial(s)",
            self.n, self.mean, self.half_width, self.trials
        )
    }
}

/// Time the session's configuration at size `n`, adding trials one at a
/// time until the interval is tight enough or `max_trials` is reached.
pub fn verify_timing(session: &Session, n: u64) -> TuneResult<VerifyReport> {
    let config = &session.config;
    let timing = config.timing_metric_idx();
    let mut tester = CandidateTester::for_config(session.program.clone(), n, config);
    let mut candidate = session.new_candidate(session.candidate.configuration.clone());

    let mut outcomes = tester.test_repeated(&session.collector, &mut candidate, config.min_trials)?;
    let tolerance = config.same_threshold_pct * 10.0;

    let report = loop {
        let results = candidate
            .results(timing, n)
            .ok_or_else(|| StatsError::NoDistribution {
                metric: config.metrics[timing].clone(),
                n,
            })?;
        let estimate = {
            let results = results.lock();
            results.mean_distribution().map(|d| {
                let low = d.ppf((1.0 - config.display_confidence) / 2.0);
                (d.mean, d.mean - low)
            })
        };
        let (mean, half_width) = estimate.ok_or_else(|| StatsError::NoDistribution {
            metric: config.metrics[timing].clone(),
            n,
        })?;

        let report = VerifyReport {
            n,
            trials: outcomes.len(),
            timeouts: outcomes.iter().filter(|o| **o == TestOutcome::TimedOut).count(),
            mean,
            half_width,
        };
        if report.relative_half_width() <= tolerance || outcomes.len() >= config.max_trials {
            break report;
        }
        // later trials are cut off at the limit the first ones imply
        tester.time_limit = candidate.time_limit(timing, n, config.limit_conf_pct, config.limit_multiplier);
        outcomes.push(tester.test(&session.collector, &mut candidate)?);
    };

    info!("verified {}", report);
    Ok(report)
}
