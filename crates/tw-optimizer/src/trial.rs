//! Search trace: every round and probe of one parameter search.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::objective::Probe;

/// Unique search identifier.
pub type SearchId = Uuid;

/// Lifecycle of an interval-narrowing search.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SearchPhase {
    Init,
    Sampling,
    Evaluating,
    /// A round improved less than the threshold.
    Converged,
    /// The interval became too narrow to sample.
    Expired,
}

impl SearchPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SearchPhase::Converged | SearchPhase::Expired)
    }
}

/// One evaluated (or cached) point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeRecord {
    pub value: i64,
    /// `None` when the cost was reused from the incumbent.
    pub probe: Option<Probe>,
    pub cost: f64,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchRound {
    pub round: usize,
    pub start: i64,
    pub stop: i64,
    pub step: f64,
    /// Time cap the probes ran under.
    pub cap: Option<f64>,
    pub probes: Vec<ProbeRecord>,
    pub improvement: f64,
}

impl SearchRound {
    pub fn best(&self) -> Option<&ProbeRecord> {
        self.probes.iter().min_by(|a, b| a.cost.total_cmp(&b.cost))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchTrace {
    pub id: SearchId,
    pub tunable: String,
    pub phase: SearchPhase,
    pub rounds: Vec<SearchRound>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl SearchTrace {
    pub fn new(tunable: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            tunable: tunable.into(),
            phase: SearchPhase::Init,
            rounds: Vec::new(),
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn enter(&mut self, phase: SearchPhase) {
        self.phase = phase;
        if phase.is_terminal() {
            self.finished_at = Some(Utc::now());
        }
    }

    /// Number of probes that actually ran.
    pub fn evaluations(&self) -> usize {
        self.rounds
            .iter()
            .flat_map(|r| r.probes.iter())
            .filter(|p| p.probe.is_some())
            .count()
    }

    pub fn duration_secs(&self) -> Option<f64> {
        self.finished_at
            .map(|end| (end - self.started_at).num_milliseconds() as f64 / 1000.0)
    }
}
