//! Job descriptions and outcomes.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::process::ExitStatus;
use std::time::Duration;

use tw_types::Configuration;

/// One external-process invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct JobSpec {
    pub label: String,
    pub program: PathBuf,
    pub args: Vec<String>,
    /// Written to a private temporary file and passed as `--config=<path>`.
    pub config: Option<Configuration>,
    /// Hard limit after which the executor kills the job.
    pub time_limit: Option<Duration>,
}

impl JobSpec {
    pub fn new(label: impl Into<String>, program: impl Into<PathBuf>) -> Self {
        Self {
            label: label.into(),
            program: program.into(),
            args: Vec::new(),
            config: None,
            time_limit: None,
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn with_config(mut self, config: Configuration) -> Self {
        self.config = Some(config);
        self
    }

    pub fn with_time_limit(mut self, limit: Duration) -> Self {
        self.time_limit = Some(limit);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    Succeeded,
    /// Non-zero exit or death by signal. Also used when the job could not be started.
    Failed {
        code: Option<i32>,
        signal: Option<i32>,
    },
    /// Killed by the executor after its hard deadline.
    TimedOut,
    /// Running when the pool was interrupted, then killed.
    Interrupted,
    /// Still pending when the pool was interrupted.
    Cancelled,
}

impl JobStatus {
    pub fn from_exit(status: ExitStatus) -> Self {
        if status.success() {
            JobStatus::Succeeded
        } else {
            JobStatus::Failed {
                code: status.code(),
                signal: exit_signal(status),
            }
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, JobStatus::Succeeded)
    }

    /// Whether the job ended because of an interrupt rather than on its own.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, JobStatus::Interrupted | JobStatus::Cancelled)
    }
}

#[cfg(unix)]
fn exit_signal(status: ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: ExitStatus) -> Option<i32> {
    None
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobOutcome {
    /// Submission index within the batch.
    pub index: usize,
    pub label: String,
    pub status: JobStatus,
    /// Captured stdout.
    pub output: String,
    pub pid: Option<u32>,
    pub elapsed: Duration,
    /// Why the job could not be started, if it never ran.
    pub error: Option<String>,
}

impl JobOutcome {
    pub(crate) fn not_started(index: usize, label: String, status: JobStatus, error: Option<String>) -> Self {
        Self {
            index,
            label,
            status,
            output: String::new(),
            pid: None,
            elapsed: Duration::ZERO,
            error,
        }
    }

    /// Output collapsed onto one line.
    pub fn message(&self) -> String {
        self.output
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_collects_args() {
        let spec = JobSpec::new("probe", "/bin/true")
            .with_args(["--n=10", "--time"])
            .with_time_limit(Duration::from_secs(2));
        assert_eq!(spec.args, vec!["--n=10", "--time"]);
        assert_eq!(spec.time_limit, Some(Duration::from_secs(2)));
        assert!(spec.config.is_none());
    }

    #[test]
    fn message_is_single_line() {
        let mut outcome = JobOutcome::not_started(0, "x".into(), JobStatus::Succeeded, None);
        outcome.output = "line one\n  line two\n".into();
        assert_eq!(outcome.message(), "line one line two");
    }

    #[test]
    fn status_predicates() {
        assert!(JobStatus::Succeeded.is_success());
        assert!(JobStatus::Cancelled.is_cancelled());
        assert!(!JobStatus::TimedOut.is_cancelled());
    }
}
