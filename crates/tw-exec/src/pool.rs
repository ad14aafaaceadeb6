//! Bounded-concurrency executor for external program runs.
//!
//! Jobs are launched until the running set reaches the pool bound. The
//! executor then blocks in a [`Select`] over one event channel per running
//! job plus the interrupt channel, waking early only for the nearest hard
//! deadline. Each job has a detached reader thread that forwards stdout
//! chunks and finally a `Closed` sentinel.

use crossbeam_channel::{unbounded, Receiver, RecvError, Select, Sender};
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::io::{ErrorKind, Read, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdout, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Instant;
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use tw_types::{ExecError, TunerConfig};

use crate::job::{JobOutcome, JobSpec, JobStatus};

const INTERRUPTED_NOTE: &str = "INTERRUPTED";

/// How many jobs may run at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolConfig {
    /// Exact bound; `None` derives it from the CPU count.
    pub workers: Option<usize>,
    pub slack: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: None,
            slack: 2,
        }
    }
}

impl PoolConfig {
    pub fn fixed(workers: usize) -> Self {
        Self {
            workers: Some(workers),
            slack: 0,
        }
    }

    /// Concurrency bound for a batch of `jobs` submissions.
    pub fn bound(&self, jobs: usize) -> usize {
        let bound = match self.workers {
            Some(k) => k,
            None => {
                let cpus = thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
                cpus.min(jobs) + self.slack
            }
        };
        bound.max(1)
    }
}

impl From<&TunerConfig> for PoolConfig {
    fn from(config: &TunerConfig) -> Self {
        Self {
            workers: config.max_parallel_jobs,
            slack: config.pool_slack,
        }
    }
}

/// Counts reported to observers after every state transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSnapshot {
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
}

impl PoolSnapshot {
    /// Pending jobs count double: they still have to start and finish.
    pub fn remaining_weight(&self) -> usize {
        2 * self.pending + self.running
    }

    pub fn total(&self) -> usize {
        self.pending + self.running + self.completed + self.failed
    }
}

impl fmt::Display for PoolSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "running jobs: {} complete, {} failed, {} running, {} pending",
            self.completed, self.failed, self.running, self.pending
        )
    }
}

/// Callbacks from inside [`JobExecutor::run`].
pub trait JobObserver {
    fn on_progress(&mut self, _snapshot: &PoolSnapshot) {}

    /// Called once per job, in submission order.
    fn on_flush(&mut self, _outcome: &JobOutcome) {}
}

pub struct NullObserver;

impl JobObserver for NullObserver {}

/// Logs pool progress and every flushed job.
#[derive(Debug, Default)]
pub struct TracingObserver {
    last: Option<PoolSnapshot>,
}

impl JobObserver for TracingObserver {
    fn on_progress(&mut self, snapshot: &PoolSnapshot) {
        if self.last != Some(*snapshot) {
            debug!("{}", snapshot);
            self.last = Some(*snapshot);
        }
    }

    fn on_flush(&mut self, outcome: &JobOutcome) {
        match outcome.status {
            JobStatus::Succeeded => debug!("{}: {}", outcome.label, outcome.message()),
            status => warn!("{}: {:?} {}", outcome.label, status, outcome.message()),
        }
    }
}

/// Cloneable trigger that aborts the executor it came from. Once raised it
/// stays raised, so later runs cancel everything immediately.
#[derive(Debug, Clone)]
pub struct InterruptHandle {
    raised: Arc<AtomicBool>,
    wake: Sender<()>,
}

impl InterruptHandle {
    pub fn interrupt(&self) {
        self.raised.store(true, Ordering::SeqCst);
        let _ = self.wake.send(());
    }

    pub fn is_raised(&self) -> bool {
        self.raised.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct JobReport {
    /// One outcome per submitted job, in submission order.
    pub outcomes: Vec<JobOutcome>,
    pub interrupted: bool,
}

impl JobReport {
    pub fn succeeded(&self) -> usize {
        self.count(|s| s.is_success())
    }

    pub fn count(&self, pred: impl Fn(&JobStatus) -> bool) -> usize {
        self.outcomes.iter().filter(|o| pred(&o.status)).count()
    }
}

enum JobEvent {
    Output(Vec<u8>),
    Closed,
}

struct RunningJob {
    index: usize,
    label: String,
    child: Child,
    events: Receiver<JobEvent>,
    output: Vec<u8>,
    started: Instant,
    deadline: Option<Instant>,
    // Removed when the job is dropped.
    _config: Option<NamedTempFile>,
}

impl RunningJob {
    fn drain(&mut self) {
        for event in self.events.try_iter() {
            if let JobEvent::Output(bytes) = event {
                self.output.extend_from_slice(&bytes);
            }
        }
    }

    fn into_outcome(self, status: JobStatus) -> JobOutcome {
        JobOutcome {
            index: self.index,
            label: self.label,
            status,
            output: String::from_utf8_lossy(&self.output).into_owned(),
            pid: Some(self.child.id()),
            elapsed: self.started.elapsed(),
            error: None,
        }
    }

    fn finish(mut self) -> JobOutcome {
        let status = match self.child.wait() {
            Ok(exit) => JobStatus::from_exit(exit),
            Err(e) => {
                warn!("{}: failed to reap process: {}", self.label, e);
                JobStatus::Failed {
                    code: None,
                    signal: None,
                }
            }
        };
        self.drain();
        self.into_outcome(status)
    }

    fn kill(mut self, status: JobStatus) -> JobOutcome {
        let _ = self.child.kill();
        let _ = self.child.wait();
        self.drain();
        if status == JobStatus::Interrupted {
            if !self.output.is_empty() && !self.output.ends_with(b"\n") {
                self.output.push(b'\n');
            }
            self.output.extend_from_slice(INTERRUPTED_NOTE.as_bytes());
        }
        self.into_outcome(status)
    }
}

enum Wake {
    Event(usize, Result<JobEvent, RecvError>),
    Deadline,
    Interrupt,
}

pub struct JobExecutor {
    config: PoolConfig,
    tmpdir: PathBuf,
    raised: Arc<AtomicBool>,
    wake_tx: Sender<()>,
    wake_rx: Receiver<()>,
}

impl JobExecutor {
    pub fn new(config: PoolConfig, tmpdir: impl Into<PathBuf>) -> Self {
        let (wake_tx, wake_rx) = unbounded();
        Self {
            config,
            tmpdir: tmpdir.into(),
            raised: Arc::new(AtomicBool::new(false)),
            wake_tx,
            wake_rx,
        }
    }

    pub fn from_tuner_config(config: &TunerConfig) -> Self {
        Self::new(PoolConfig::from(config), config.tmpdir.clone())
    }

    pub fn pool_config(&self) -> PoolConfig {
        self.config
    }

    pub fn interrupt_handle(&self) -> InterruptHandle {
        InterruptHandle {
            raised: Arc::clone(&self.raised),
            wake: self.wake_tx.clone(),
        }
    }

    /// Run every job until it ends on its own or the pool is interrupted.
    pub fn run(&self, specs: Vec<JobSpec>, observer: &mut dyn JobObserver) -> JobReport {
        let total = specs.len();
        let bound = self.config.bound(total);
        debug!("executing {} job(s) with up to {} at once", total, bound);

        let mut pending: VecDeque<(usize, JobSpec)> = specs.into_iter().enumerate().collect();
        let mut running: Vec<RunningJob> = Vec::new();
        let mut done: BTreeMap<usize, JobOutcome> = BTreeMap::new();
        let mut flushed = 0;
        let mut interrupted = false;

        loop {
            if self.raised.load(Ordering::SeqCst) {
                interrupted = true;
                break;
            }

            while running.len() < bound {
                let Some((index, spec)) = pending.pop_front() else {
                    break;
                };
                match self.launch(index, spec) {
                    Ok(job) => running.push(job),
                    Err(outcome) => {
                        done.insert(index, outcome);
                    }
                }
                observer.on_progress(&snapshot(&pending, &running, &done));
            }
            flush(&done, &mut flushed, observer);

            if running.is_empty() {
                if pending.is_empty() {
                    break;
                }
                continue;
            }

            let wake = {
                let mut select = Select::new();
                for job in &running {
                    select.recv(&job.events);
                }
                let interrupt_idx = select.recv(&self.wake_rx);
                let nearest = running.iter().filter_map(|j| j.deadline).min();
                let op = match nearest {
                    Some(deadline) => select.select_deadline(deadline).ok(),
                    None => Some(select.select()),
                };
                match op {
                    None => Wake::Deadline,
                    Some(op) if op.index() == interrupt_idx => {
                        let _ = op.recv(&self.wake_rx);
                        Wake::Interrupt
                    }
                    Some(op) => {
                        let i = op.index();
                        Wake::Event(i, op.recv(&running[i].events))
                    }
                }
            };

            match wake {
                Wake::Interrupt => {
                    interrupted = true;
                    break;
                }
                Wake::Event(i, Ok(JobEvent::Output(bytes))) => {
                    running[i].output.extend_from_slice(&bytes);
                }
                Wake::Event(i, Ok(JobEvent::Closed) | Err(_)) => {
                    let outcome = running.remove(i).finish();
                    debug!("{} finished: {:?}", outcome.label, outcome.status);
                    done.insert(outcome.index, outcome);
                    observer.on_progress(&snapshot(&pending, &running, &done));
                }
                Wake::Deadline => {
                    let now = Instant::now();
                    let mut i = 0;
                    while i < running.len() {
                        if running[i].deadline.is_some_and(|d| d <= now) {
                            let outcome = running.remove(i).kill(JobStatus::TimedOut);
                            debug!("{} hit its deadline after {:?}", outcome.label, outcome.elapsed);
                            done.insert(outcome.index, outcome);
                            observer.on_progress(&snapshot(&pending, &running, &done));
                        } else {
                            i += 1;
                        }
                    }
                }
            }
            flush(&done, &mut flushed, observer);
        }

        if interrupted {
            info!(
                "interrupted: killing {} running job(s), cancelling {} pending",
                running.len(),
                pending.len()
            );
            for job in running.drain(..) {
                let outcome = job.kill(JobStatus::Interrupted);
                done.insert(outcome.index, outcome);
            }
            for (index, spec) in pending.drain(..) {
                done.insert(
                    index,
                    JobOutcome::not_started(index, spec.label, JobStatus::Cancelled, None),
                );
            }
            observer.on_progress(&snapshot(&pending, &running, &done));
            flush(&done, &mut flushed, observer);
        }

        JobReport {
            outcomes: done.into_values().collect(),
            interrupted,
        }
    }

    fn launch(&self, index: usize, spec: JobSpec) -> Result<RunningJob, JobOutcome> {
        let JobSpec {
            label,
            program,
            args,
            config,
            time_limit,
        } = spec;

        let config_file = match config {
            Some(config) => match self.write_config(&label, &config.render()) {
                Ok(file) => Some(file),
                Err(e) => return Err(failed_to_start(index, label, e)),
            },
            None => None,
        };

        let mut command = Command::new(&program);
        if let Some(file) = &config_file {
            command.arg(format!("--config={}", file.path().display()));
        }
        command
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null());

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(source) => {
                let err = ExecError::Spawn {
                    label: label.clone(),
                    source,
                };
                return Err(failed_to_start(index, label, err));
            }
        };

        let (tx, events) = unbounded();
        match child.stdout.take() {
            Some(stdout) => spawn_reader(stdout, tx),
            None => {
                let _ = tx.send(JobEvent::Closed);
            }
        }

        let started = Instant::now();
        debug!("launched {} (pid {})", label, child.id());
        Ok(RunningJob {
            index,
            label,
            child,
            events,
            output: Vec::new(),
            started,
            deadline: time_limit.map(|limit| started + limit),
            _config: config_file,
        })
    }

    fn write_config(&self, label: &str, contents: &str) -> Result<NamedTempFile, ExecError> {
        let wrap = |source| ExecError::ConfigFile {
            label: label.to_string(),
            source,
        };
        let mut file = tempfile::Builder::new()
            .prefix("twtune_")
            .suffix(".cfg")
            .tempfile_in(&self.tmpdir)
            .map_err(wrap)?;
        file.write_all(contents.as_bytes()).map_err(wrap)?;
        file.flush().map_err(wrap)?;
        Ok(file)
    }
}

fn failed_to_start(index: usize, label: String, err: ExecError) -> JobOutcome {
    warn!("{}", err);
    JobOutcome::not_started(
        index,
        label,
        JobStatus::Failed {
            code: None,
            signal: None,
        },
        Some(err.to_string()),
    )
}

fn spawn_reader(mut stdout: ChildStdout, tx: Sender<JobEvent>) {
    thread::spawn(move || {
        let mut buf = [0u8; 4096];
        loop {
            match stdout.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if tx.send(JobEvent::Output(buf[..n].to_vec())).is_err() {
                        return;
                    }
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(_) => break,
            }
        }
        let _ = tx.send(JobEvent::Closed);
    });
}

fn snapshot(
    pending: &VecDeque<(usize, JobSpec)>,
    running: &[RunningJob],
    done: &BTreeMap<usize, JobOutcome>,
) -> PoolSnapshot {
    let failed = done.values().filter(|o| !o.status.is_success()).count();
    PoolSnapshot {
        pending: pending.len(),
        running: running.len(),
        completed: done.len() - failed,
        failed,
    }
}

fn flush(done: &BTreeMap<usize, JobOutcome>, flushed: &mut usize, observer: &mut dyn JobObserver) {
    while let Some(outcome) = done.get(flushed) {
        observer.on_flush(outcome);
        *flushed += 1;
    }
}
