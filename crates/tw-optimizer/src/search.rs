//! Interval-narrowing search over one integer tunable.
//!
//! Each round samples `B` evenly spaced points of the current interval,
//! measures them under a time cap just above the best cost so far, and
//! recenters a narrower interval on the best point. The search stops when a
//! round improves by less than the threshold or the interval becomes too
//! narrow to sample.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use tw_types::{validation_error, Configuration, OptimizerConfig, Tunable, TuneResult};

use crate::objective::{Objective, Probe};
use crate::trial::{ProbeRecord, SearchPhase, SearchRound, SearchTrace};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchOutcome {
    pub value: i64,
    pub cost: f64,
    /// `worst / best - 1` over everything measured.
    pub impact: f64,
    pub trace: SearchTrace,
}

impl SearchOutcome {
    pub fn phase(&self) -> SearchPhase {
        self.trace.phase
    }
}

/// Evenly spaced integer sample points of `[start, stop)`, deduplicated.
pub fn sample_points(start: i64, stop: i64, branch_factor: usize, step: f64) -> Vec<i64> {
    let last = i128::from(stop) - 1;
    let mut points: Vec<i64> = (0..branch_factor)
        .map(|i| (i128::from(start) + (i as f64 * step).round() as i128).min(last) as i64)
        .collect();
    points.dedup();
    points
}

#[derive(Debug, Clone, Default)]
pub struct ParameterOptimizer {
    config: OptimizerConfig,
}

impl ParameterOptimizer {
    pub fn new(config: OptimizerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &OptimizerConfig {
        &self.config
    }

    /// Search `tunable` over `[start, stop)`.
    ///
    /// `best` is the incumbent `(value, cost)`; without one the tunable's
    /// current value is measured first. Trials run on copies of
    /// `configuration`, which is only set to the winning value at the end.
    pub fn optimize(
        &self,
        configuration: &mut Configuration,
        tunable: &Tunable,
        start: i64,
        stop: i64,
        best: Option<(i64, f64)>,
        objective: &mut dyn Objective,
    ) -> TuneResult<SearchOutcome> {
        self.config.validate()?;
        if stop <= start {
            return Err(validation_error!(
                "empty search interval [{}, {}) for {}",
                start,
                stop,
                tunable.name
            ));
        }

        let name = tunable.name.as_str();
        let penalty = self.config.timeout_penalty;
        let branch = self.config.branch_factor;
        let (lower, upper) = (start, stop);
        let mut trace = SearchTrace::new(name);

        let (mut best_value, mut best_cost) = match best {
            Some(incumbent) => incumbent,
            None => {
                let current = tunable.clamp(configuration.get(name).unwrap_or(tunable.min));
                let probe = objective.evaluate(&configuration.with_value(name, current), None)?;
                (current, probe.effective_cost(None, penalty))
            }
        };
        let mut worst = best_cost;
        info!("optimizing {} over [{}, {}), starting at {} ({:.6})", name, start, stop, best_value, best_cost);

        let (mut start, mut stop) = (start, stop);
        loop {
            let step = stop.abs_diff(start) as f64 / (branch - 1) as f64;
            if step < 1.0 {
                trace.enter(SearchPhase::Expired);
                break;
            }

            trace.enter(SearchPhase::Sampling);
            let points = sample_points(start, stop, branch, step);
            let cap = best_cost.is_finite().then(|| best_cost + self.config.probe_slack);
            let fresh: Vec<i64> = points.iter().copied().filter(|&p| p != best_value).collect();
            let configs: Vec<Configuration> = fresh.iter().map(|&p| configuration.with_value(name, p)).collect();

            trace.enter(SearchPhase::Evaluating);
            let probes = objective.evaluate_round(&configs, cap)?;
            let mut measured = fresh.iter().copied().zip(probes);
            let now = Utc::now();
            let records: Vec<ProbeRecord> = points
                .iter()
                .map(|&value| {
                    if value == best_value {
                        return ProbeRecord {
                            value,
                            probe: None,
                            cost: best_cost,
                            recorded_at: now,
                        };
                    }
                    let probe = measured.next().map(|(_, probe)| probe);
                    let cost = probe.map_or(f64::INFINITY, |p| p.effective_cost(cap, penalty));
                    if let Some(Probe::Failed { code }) = probe {
                        warn!("{}={} failed (exit {:?})", name, value, code);
                    }
                    debug!("{}={} -> {:?} cost {:.6}", name, value, probe, cost);
                    ProbeRecord {
                        value,
                        probe,
                        cost,
                        recorded_at: now,
                    }
                })
                .collect();

            let mut round_min = f64::INFINITY;
            let mut round_max = f64::NEG_INFINITY;
            for record in &records {
                if record.cost < best_cost {
                    best_cost = record.cost;
                    best_value = record.value;
                }
                if record.cost.is_finite() {
                    round_min = round_min.min(record.cost);
                    round_max = round_max.max(record.cost);
                    worst = worst.max(record.cost);
                }
            }
            let improvement = if round_max > 0.0 && round_max.is_finite() {
                (round_max - round_min) / round_max
            } else {
                0.0
            };

            trace.rounds.push(SearchRound {
                round: trace.rounds.len(),
                start,
                stop,
                step,
                cap,
                probes: records,
                improvement,
            });

            start = ((best_value as f64 - step).floor() as i64).max(lower);
            stop = ((best_value as f64 + step).ceil() as i64).min(upper);
            debug!(
                "{} round {}: best {}={:.6}, improvement {:.3}, next [{}, {})",
                name,
                trace.rounds.len(),
                best_value,
                best_cost,
                improvement,
                start,
                stop
            );

            if improvement <= self.config.improvement_threshold {
                trace.enter(SearchPhase::Converged);
                break;
            }
            if stop.abs_diff(start) <= 1 {
                trace.enter(SearchPhase::Expired);
                break;
            }
        }

        configuration.set(name, best_value);
        let impact = if best_cost > 0.0 && worst.is_finite() {
            worst / best_cost - 1.0
        } else {
            0.0
        };
        info!(
            "{} = {} after {} round(s) ({:?}), impact {:.3}",
            name,
            best_value,
            trace.rounds.len(),
            trace.phase,
            impact
        );

        Ok(SearchOutcome {
            value: best_value,
            cost: best_cost,
            impact,
            trace,
        })
    }
}
