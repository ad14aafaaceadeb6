//! Runs candidates at a fixed input size and files the samples under them.

use serde::{Deserialize, Serialize};
use tracing::debug;

use tw_stats::Candidate;
use tw_types::{ProgramHandle, TuneError, TuneResult, TunerConfig};

use crate::collector::{Measurement, MeasurementCollector, MeasurementRequest};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum TestOutcome {
    Completed,
    TimedOut,
    Failed { code: Option<i32> },
}

pub struct CandidateTester {
    pub program: ProgramHandle,
    pub n: u64,
    pub time_limit: Option<f64>,
    pub args: Vec<String>,
}

impl CandidateTester {
    pub fn new(program: ProgramHandle, n: u64) -> Self {
        Self {
            program,
            n,
            time_limit: None,
            args: vec!["--trials=1".to_string()],
        }
    }

    pub fn for_config(program: ProgramHandle, n: u64, config: &TunerConfig) -> Self {
        let mut tester = Self::new(program, n);
        if config.offset > 0 {
            tester.args.push(format!("--offset={}", config.offset));
        }
        tester
    }

    pub fn with_time_limit(mut self, limit: Option<f64>) -> Self {
        self.time_limit = limit;
        self
    }

    fn request(&self, candidate: &Candidate) -> MeasurementRequest {
        MeasurementRequest::new(self.n, candidate.configuration.clone())
            .with_time_limit(self.time_limit)
            .with_args(self.args.iter().cloned())
    }

    /// Run `candidate` once and record what came back.
    pub fn test(&self, collector: &MeasurementCollector, candidate: &mut Candidate) -> TuneResult<TestOutcome> {
        let measurement = collector.measure(&self.program, self.request(candidate))?;
        Ok(self.record(collector, candidate, measurement))
    }

    /// One run per candidate, executed concurrently. After an interrupt the
    /// runs that finished are still recorded before the error is returned.
    pub fn test_many(
        &self,
        collector: &MeasurementCollector,
        candidates: &mut [&mut Candidate],
    ) -> TuneResult<Vec<TestOutcome>> {
        let requests = candidates.iter().map(|c| self.request(c)).collect();
        let batch = collector.measure_batch(&self.program, requests);
        let interrupted = batch.interrupted;
        let completed = batch.completed();
        let mut outcomes = Vec::with_capacity(completed);
        let mut failure = None;
        for (candidate, result) in candidates.iter_mut().zip(batch.results) {
            match result {
                Some(Ok(measurement)) => outcomes.push(self.record(collector, candidate, measurement)),
                Some(Err(err)) => {
                    failure.get_or_insert(err);
                }
                None => {}
            }
        }
        settle(outcomes, failure, interrupted.then_some(completed))
    }

    /// `trials` runs of the same candidate in one concurrent batch.
    pub fn test_repeated(
        &self,
        collector: &MeasurementCollector,
        candidate: &mut Candidate,
        trials: usize,
    ) -> TuneResult<Vec<TestOutcome>> {
        let requests = (0..trials).map(|_| self.request(candidate)).collect();
        let batch = collector.measure_batch(&self.program, requests);
        let interrupted = batch.interrupted;
        let completed = batch.completed();
        let mut outcomes = Vec::with_capacity(completed);
        let mut failure = None;
        for result in batch.results.into_iter().flatten() {
            match result {
                Ok(measurement) => outcomes.push(self.record(collector, candidate, measurement)),
                Err(err) => {
                    failure.get_or_insert(err);
                }
            }
        }
        settle(outcomes, failure, interrupted.then_some(completed))
    }

    fn record(&self, collector: &MeasurementCollector, candidate: &mut Candidate, measurement: Measurement) -> TestOutcome {
        match measurement {
            Measurement::Success(records) => {
                for (idx, metric) in collector.metrics().iter().enumerate() {
                    if let (Some(value), Some(results)) = (records.average(metric), candidate.results(idx, self.n)) {
                        results.lock().add_real(value);
                    }
                }
                TestOutcome::Completed
            }
            Measurement::TimedOut { limit } => {
                debug!("candidate {} timed out at n={} after {:.3}s", candidate.id, self.n, limit);
                if let Some(results) = candidate.results(0, self.n) {
                    results.lock().add_censored(limit);
                }
                TestOutcome::TimedOut
            }
            Measurement::Failed { code } => TestOutcome::Failed { code },
        }
    }
}

/// An interrupt outranks a per-run failure; both outrank the outcomes.
fn settle(
    outcomes: Vec<TestOutcome>,
    failure: Option<TuneError>,
    interrupted: Option<usize>,
) -> TuneResult<Vec<TestOutcome>> {
    if let Some(completed) = interrupted {
        return Err(TuneError::Interrupted { completed });
    }
    match failure {
        Some(err) => Err(err),
        None => Ok(outcomes),
    }
}
