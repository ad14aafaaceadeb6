use tw_exec::{Measurement, MeasurementCollector, MeasurementRequest};
use tw_optimizer::{Objective, Probe};
use tw_types::{Configuration, ProgramHandle, TuneResult};

/// Prices a configuration by timing one run of the program at size `n`.
pub struct ProgramObjective<'a> {
    collector: &'a MeasurementCollector,
    program: &'a ProgramHandle,
    n: u64,
    args: Vec<String>,
}

impl<'a> ProgramObjective<'a> {
    pub fn new(collector: &'a MeasurementCollector, program: &'a ProgramHandle, n: u64) -> Self {
        Self {
            collector,
            program,
            n,
            args: vec!["--trials=1".to_string()],
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    fn request(&self, configuration: &Configuration, limit: Option<f64>) -> MeasurementRequest {
        MeasurementRequest::new(self.n, configuration.clone())
            .with_time_limit(limit)
            .with_args(self.args.iter().cloned())
    }

    fn probe(&self, measurement: Measurement) -> TuneResult<Probe> {
        Ok(match measurement {
            Measurement::Success(records) => {
                let timing = self
                    .collector
                    .metrics()
                    .first()
                    .map(String::as_str)
                    .unwrap_or("timing");
                Probe::Cost(records.require_average(timing)?)
            }
            Measurement::TimedOut { limit } => Probe::TimedOut { limit },
            Measurement::Failed { code } => Probe::Failed { code },
        })
    }
}

impl Objective for ProgramObjective<'_> {
    fn evaluate(&mut self, configuration: &Configuration, limit: Option<f64>) -> TuneResult<Probe> {
        let measurement = self.collector.measure(self.program, self.request(configuration, limit))?;
        self.probe(measurement)
    }

    /// The whole round goes to the executor as one batch.
    fn evaluate_round(&mut self, configurations: &[Configuration], limit: Option<f64>) -> TuneResult<Vec<Probe>> {
        let requests = configurations.iter().map(|c| self.request(c, limit)).collect();
        self.collector
            .measure_batch(self.program, requests)
            .into_results()?
            .into_iter()
            .map(|measurement| self.probe(measurement?))
            .collect()
    }
}
