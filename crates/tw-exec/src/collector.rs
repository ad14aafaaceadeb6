//! Turns program runs into measurements.
//!
//! The tuned program is invoked as
//! `<binary> --config=<tmp> --n=<n> --time [--max-sec=<limit>] <extra>` and
//! reports one JSON object per stdout line, for example
//! `{"metric": "timing", "average": 0.12}`. Other lines are ignored.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use tw_types::{Configuration, MeasurementError, ProgramHandle, TuneError, TuneResult, TunerConfig};

use crate::job::{JobOutcome, JobSpec, JobStatus};
use crate::pool::{InterruptHandle, JobExecutor, TracingObserver};

/// One metric record from the program's output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricRecord {
    pub metric: String,
    /// Every other field of the record, untouched.
    pub attributes: BTreeMap<String, serde_json::Value>,
}

impl MetricRecord {
    pub fn average(&self) -> Option<f64> {
        self.attributes.get("average").and_then(serde_json::Value::as_f64)
    }

    pub fn attribute(&self, name: &str) -> Option<&serde_json::Value> {
        self.attributes.get(name)
    }
}

/// Records reported by one successful run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunRecords {
    pub records: Vec<MetricRecord>,
}

impl RunRecords {
    pub fn parse(output: &str) -> Self {
        let records = output
            .lines()
            .filter_map(|line| {
                let mut fields: BTreeMap<String, serde_json::Value> =
                    serde_json::from_str(line.trim()).ok()?;
                let metric = fields.remove("metric")?.as_str()?.to_string();
                Some(MetricRecord {
                    metric,
                    attributes: fields,
                })
            })
            .collect();
        Self { records }
    }

    pub fn get(&self, metric: &str) -> Option<&MetricRecord> {
        self.records.iter().find(|r| r.metric == metric)
    }

    pub fn average(&self, metric: &str) -> Option<f64> {
        self.get(metric).and_then(MetricRecord::average)
    }

    pub fn require_average(&self, metric: &str) -> Result<f64, MeasurementError> {
        self.average(metric).ok_or_else(|| MeasurementError::MissingMetric {
            metric: metric.to_string(),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Measurement {
    Success(RunRecords),
    /// The run was cut off at `limit` seconds.
    TimedOut { limit: f64 },
    Failed { code: Option<i32> },
}

impl Measurement {
    pub fn is_success(&self) -> bool {
        matches!(self, Measurement::Success(_))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MeasurementRequest {
    pub n: u64,
    pub configuration: Configuration,
    /// Seconds the program may use before it should give up.
    pub time_limit: Option<f64>,
    pub args: Vec<String>,
}

impl MeasurementRequest {
    pub fn new(n: u64, configuration: Configuration) -> Self {
        Self {
            n,
            configuration,
            time_limit: None,
            args: Vec::new(),
        }
    }

    pub fn with_time_limit(mut self, limit: Option<f64>) -> Self {
        self.time_limit = limit;
        self
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    fn command_args(&self) -> Vec<String> {
        let mut args = vec![format!("--n={}", self.n), "--time".to_string()];
        if let Some(limit) = self.time_limit {
            args.push(format!("--max-sec={limit}"));
        }
        args.extend(self.args.iter().cloned());
        args
    }
}

/// Per-request results of one concurrent batch.
#[derive(Debug)]
pub struct MeasurementBatch {
    /// One slot per request, in request order. Requests killed or cancelled
    /// by an interrupt hold `None`.
    pub results: Vec<Option<TuneResult<Measurement>>>,
    pub interrupted: bool,
}

impl MeasurementBatch {
    /// Requests that ran to their own end.
    pub fn completed(&self) -> usize {
        self.results.iter().filter(|r| r.is_some()).count()
    }

    /// Every result, or [`TuneError::Interrupted`] if the batch was cut short.
    pub fn into_results(self) -> TuneResult<Vec<TuneResult<Measurement>>> {
        if self.interrupted {
            return Err(TuneError::Interrupted {
                completed: self.completed(),
            });
        }
        Ok(self.results.into_iter().flatten().collect())
    }
}

pub struct MeasurementCollector {
    executor: JobExecutor,
    metrics: Vec<String>,
    kill_grace: Duration,
}

impl MeasurementCollector {
    pub fn new(executor: JobExecutor, metrics: Vec<String>, kill_grace: Duration) -> Self {
        Self {
            executor,
            metrics,
            kill_grace,
        }
    }

    pub fn from_tuner_config(config: &TunerConfig) -> Self {
        Self::new(
            JobExecutor::from_tuner_config(config),
            config.metrics.clone(),
            Duration::from_secs_f64(config.kill_grace_sec.max(0.0)),
        )
    }

    pub fn metrics(&self) -> &[String] {
        &self.metrics
    }

    pub fn executor(&self) -> &JobExecutor {
        &self.executor
    }

    pub fn interrupt_handle(&self) -> InterruptHandle {
        self.executor.interrupt_handle()
    }

    pub fn measure(&self, program: &ProgramHandle, request: MeasurementRequest) -> TuneResult<Measurement> {
        let mut results = self.measure_batch(program, vec![request]).into_results()?;
        results
            .pop()
            .unwrap_or_else(|| Err(TuneError::Internal("empty measurement batch".to_string())))
    }

    /// Measure every request concurrently. Per-request failures are reported
    /// individually; an interrupt keeps whatever had already finished.
    pub fn measure_batch(&self, program: &ProgramHandle, requests: Vec<MeasurementRequest>) -> MeasurementBatch {
        let limits: Vec<Option<f64>> = requests.iter().map(|r| r.time_limit).collect();
        let specs = requests
            .into_iter()
            .map(|request| {
                let label = format!("{} n={}", program.name, request.n);
                let mut spec = JobSpec::new(label, &program.binary)
                    .with_args(request.command_args())
                    .with_config(request.configuration);
                if let Some(limit) = request.time_limit {
                    spec = spec.with_time_limit(Duration::from_secs_f64(limit.max(0.0)) + self.kill_grace);
                }
                spec
            })
            .collect();

        let report = self.executor.run(specs, &mut TracingObserver::default());
        let results = report
            .outcomes
            .iter()
            .zip(limits)
            .map(|(outcome, limit)| {
                if outcome.status.is_cancelled() {
                    None
                } else {
                    Some(self.classify(outcome, limit))
                }
            })
            .collect();
        let batch = MeasurementBatch {
            results,
            interrupted: report.interrupted,
        };
        if batch.interrupted {
            info!(
                "batch interrupted with {} of {} measurement(s) finished",
                batch.completed(),
                batch.results.len()
            );
        }
        batch
    }

    fn classify(&self, outcome: &JobOutcome, limit: Option<f64>) -> TuneResult<Measurement> {
        let limit_or_elapsed = || limit.unwrap_or_else(|| outcome.elapsed.as_secs_f64());
        match outcome.status {
            JobStatus::Succeeded => {
                let records = RunRecords::parse(&outcome.output);
                let timing = self.metrics.first().map(String::as_str).unwrap_or("timing");
                if records.average(timing).is_none() {
                    return Err(MeasurementError::Parse {
                        message: format!("{}: no {} average in output: {}", outcome.label, timing, outcome.message()),
                    }
                    .into());
                }
                Ok(Measurement::Success(records))
            }
            JobStatus::TimedOut => Ok(Measurement::TimedOut {
                limit: limit_or_elapsed(),
            }),
            JobStatus::Failed {
                signal: Some(libc::SIGTERM),
                ..
            } => Ok(Measurement::TimedOut {
                limit: limit_or_elapsed(),
            }),
            JobStatus::Failed { code, .. } => {
                if let Some(error) = &outcome.error {
                    warn!("{}", error);
                }
                Ok(Measurement::Failed { code })
            }
            JobStatus::Interrupted | JobStatus::Cancelled => Err(TuneError::Interrupted { completed: 0 }),
        }
    }

    /// Time the program at increasing sizes until `max_time` seconds have
    /// been spent or a run times out. Returns `(n, average)` pairs.
    pub fn collect_timing_series(
        &self,
        program: &ProgramHandle,
        configuration: &Configuration,
        sizes: impl IntoIterator<Item = u64>,
        max_time: f64,
    ) -> TuneResult<Vec<(u64, f64)>> {
        let started = Instant::now();
        let timing = self.metrics.first().cloned().unwrap_or_else(|| "timing".to_string());
        let mut series = Vec::new();

        for n in sizes {
            let left = max_time - started.elapsed().as_secs_f64();
            if left <= 0.0 {
                break;
            }
            let request = MeasurementRequest::new(n, configuration.clone()).with_time_limit(Some(left.ceil() + 1.0));
            match self.measure(program, request)? {
                Measurement::Success(records) => {
                    let average = records.require_average(&timing)?;
                    debug!("timing series: n={} {:.6}s", n, average);
                    series.push((n, average));
                }
                Measurement::TimedOut { limit } => {
                    if series.is_empty() {
                        return Err(MeasurementError::TimedOut { limit }.into());
                    }
                    break;
                }
                Measurement::Failed { code } => {
                    return Err(MeasurementError::ProcessFailed { code }.into());
                }
            }
        }
        info!("collected {} timing point(s) for {}", series.len(), program.name);
        Ok(series)
    }
}

#[cfg(all(test, unix))]
pub(crate) mod tests {
    use super::*;
    use crate::pool::PoolConfig;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;
    use tempfile::TempDir;

    /// Executable `/bin/sh` script in `dir`.
    pub(crate) fn script(dir: &Path, name: &str, body: &str) -> ProgramHandle {
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        ProgramHandle::new(name, path, dir.join(format!("{name}.cfg")))
    }

    pub(crate) fn collector(dir: &TempDir) -> MeasurementCollector {
        MeasurementCollector::new(
            JobExecutor::new(PoolConfig::fixed(4), dir.path()),
            vec!["timing".to_string(), "accuracy".to_string()],
            Duration::from_millis(200),
        )
    }

    #[test]
    fn parses_json_records_and_skips_noise() {
        let records = RunRecords::parse(
            "starting up\n{\"metric\": \"timing\", \"average\": 0.25, \"count\": 3}\n[1,2]\n{\"metric\": \"accuracy\", \"average\": 0.9}\n",
        );
        assert_eq!(records.records.len(), 2);
        assert_eq!(records.average("timing"), Some(0.25));
        assert_eq!(records.get("timing").unwrap().attribute("count"), Some(&serde_json::json!(3)));
        assert_eq!(records.average("accuracy"), Some(0.9));
        assert!(matches!(
            records.require_average("energy"),
            Err(MeasurementError::MissingMetric { .. })
        ));
    }

    #[test]
    fn request_arguments() {
        let request = MeasurementRequest::new(128, Configuration::new())
            .with_time_limit(Some(1.5))
            .with_args(["--trials=1"]);
        assert_eq!(request.command_args(), vec!["--n=128", "--time", "--max-sec=1.5", "--trials=1"]);
    }

    #[test]
    fn successful_run_passes_size_through() {
        let dir = tempfile::tempdir().unwrap();
        let program = script(
            dir.path(),
            "echo-n",
            r#"for a in "$@"; do case "$a" in --n=*) n="${a#--n=}";; esac; done
echo "{\"metric\": \"timing\", \"average\": $n}""#,
        );
        let result = collector(&dir)
            .measure(&program, MeasurementRequest::new(7, Configuration::new()))
            .unwrap();
        match result {
            Measurement::Success(records) => assert_eq!(records.average("timing"), Some(7.0)),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn sigterm_is_a_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let program = script(dir.path(), "self-term", "kill -TERM $$");
        let result = collector(&dir)
            .measure(
                &program,
                MeasurementRequest::new(1, Configuration::new()).with_time_limit(Some(3.0)),
            )
            .unwrap();
        assert_eq!(result, Measurement::TimedOut { limit: 3.0 });
    }

    #[test]
    fn hard_deadline_is_a_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let program = script(dir.path(), "hang", "exec sleep 30");
        let started = Instant::now();
        let result = collector(&dir)
            .measure(
                &program,
                MeasurementRequest::new(1, Configuration::new()).with_time_limit(Some(0.1)),
            )
            .unwrap();
        assert_eq!(result, Measurement::TimedOut { limit: 0.1 });
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn nonzero_exit_is_a_failure_and_missing_timing_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let c = collector(&dir);
        let failing = script(dir.path(), "fail", "exit 3");
        assert_eq!(
            c.measure(&failing, MeasurementRequest::new(1, Configuration::new())).unwrap(),
            Measurement::Failed { code: Some(3) }
        );

        let silent = script(dir.path(), "silent", "echo nothing useful");
        let err = c
            .measure(&silent, MeasurementRequest::new(1, Configuration::new()))
            .unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn interrupted_batch_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let c = collector(&dir);
        let program = script(dir.path(), "ok", "echo '{\"metric\":\"timing\",\"average\":1}'");
        c.interrupt_handle().interrupt();
        let batch = c.measure_batch(&program, vec![MeasurementRequest::new(1, Configuration::new())]);
        assert!(batch.interrupted);
        assert!(batch.results[0].is_none());
        assert!(matches!(batch.into_results(), Err(TuneError::Interrupted { completed: 0 })));
    }

    // Reports its size, except that n=2 hangs.
    pub(crate) const HANG_ON_TWO: &str = r#"for a in "$@"; do case "$a" in --n=*) n="${a#--n=}";; esac; done
if [ "$n" -eq 2 ]; then exec sleep 30; fi
echo "{\"metric\": \"timing\", \"average\": $n}""#;

    /// Interrupts `collector` once `delay` has passed.
    pub(crate) fn interrupt_after(collector: &MeasurementCollector, delay: Duration) -> std::thread::JoinHandle<()> {
        let handle = collector.interrupt_handle();
        std::thread::spawn(move || {
            std::thread::sleep(delay);
            handle.interrupt();
        })
    }

    #[test]
    fn interrupted_batch_keeps_finished_measurements() {
        let dir = tempfile::tempdir().unwrap();
        let c = collector(&dir);
        let program = script(dir.path(), "hang-on-two", HANG_ON_TWO);
        let trigger = interrupt_after(&c, Duration::from_millis(800));

        let started = Instant::now();
        let batch = c.measure_batch(
            &program,
            vec![
                MeasurementRequest::new(1, Configuration::new()),
                MeasurementRequest::new(2, Configuration::new()),
            ],
        );
        trigger.join().unwrap();

        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(batch.interrupted);
        assert_eq!(batch.completed(), 1);
        match &batch.results[0] {
            Some(Ok(Measurement::Success(records))) => assert_eq!(records.average("timing"), Some(1.0)),
            other => panic!("unexpected {other:?}"),
        }
        assert!(batch.results[1].is_none());
    }

    #[test]
    fn timing_series_stops_at_first_timeout() {
        let dir = tempfile::tempdir().unwrap();
        // sizes above 4 hang
        let program = script(
            dir.path(),
            "grow",
            r#"for a in "$@"; do case "$a" in --n=*) n="${a#--n=}";; esac; done
if [ "$n" -gt 4 ]; then exec sleep 30; fi
echo "{\"metric\": \"timing\", \"average\": $n}""#,
        );
        let series = collector(&dir)
            .collect_timing_series(&program, &Configuration::new(), [1, 2, 4, 8, 16], 1.0)
            .unwrap();
        assert_eq!(series, vec![(1, 1.0), (2, 2.0), (4, 4.0)]);
    }
}
