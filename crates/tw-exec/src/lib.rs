//! # tw-exec
//!
//! Runs the tuned program. [`JobExecutor`] keeps a bounded set of external
//! processes in flight and delivers their output in submission order.
//! [`MeasurementCollector`] turns those runs into measurements, which
//! [`CandidateTester`] files under the candidate that produced them.

pub mod collector;
pub mod job;
pub mod pool;
pub mod tester;

pub use collector::{Measurement, MeasurementBatch, MeasurementCollector, MeasurementRequest, MetricRecord, RunRecords};
pub use job::{JobOutcome, JobSpec, JobStatus};
pub use pool::{
    InterruptHandle, JobExecutor, JobObserver, JobReport, NullObserver, PoolConfig, PoolSnapshot,
    TracingObserver,
};
pub use tester::{CandidateTester, TestOutcome};
