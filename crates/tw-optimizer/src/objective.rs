//! What the search minimizes.

use serde::{Deserialize, Serialize};

use tw_types::{Configuration, TuneResult};

/// Result of evaluating one configuration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Probe {
    /// Lower is better.
    Cost(f64),
    /// Gave up at `limit`; the true cost is higher.
    TimedOut { limit: f64 },
    Failed { code: Option<i32> },
}

impl Probe {
    /// Cost used for ranking. Capped and failed probes get a finite penalty
    /// of `penalty` times the cap they ran under.
    pub fn effective_cost(&self, cap: Option<f64>, penalty: f64) -> f64 {
        match *self {
            Probe::Cost(cost) => cost,
            Probe::TimedOut { limit } => limit * penalty,
            Probe::Failed { .. } => cap.map_or(f64::INFINITY, |c| c * penalty),
        }
    }

    pub fn is_cost(&self) -> bool {
        matches!(self, Probe::Cost(_))
    }
}

pub trait Objective {
    /// Evaluate `configuration`, giving up once the cost would exceed `limit`.
    fn evaluate(&mut self, configuration: &Configuration, limit: Option<f64>) -> TuneResult<Probe>;

    /// Evaluate a whole round. Implementations that can run probes
    /// concurrently should override this.
    fn evaluate_round(&mut self, configurations: &[Configuration], limit: Option<f64>) -> TuneResult<Vec<Probe>> {
        configurations
            .iter()
            .map(|configuration| self.evaluate(configuration, limit))
            .collect()
    }
}

/// Adapter for closures.
pub struct FnObjective<F>(pub F);

impl<F> Objective for FnObjective<F>
where
    F: FnMut(&Configuration, Option<f64>) -> TuneResult<Probe>,
{
    fn evaluate(&mut self, configuration: &Configuration, limit: Option<f64>) -> TuneResult<Probe> {
        (self.0)(configuration, limit)
    }
}
