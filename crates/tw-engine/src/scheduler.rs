//! FIFO task scheduler with learned per-category weights.
//!
//! Every task belongs to a category. A category's weight estimates how long
//! one of its tasks takes; progress is the weighted share of queued work
//! still to run. Weights are frozen for the duration of a run and relearned
//! from the recorded timings for the next session.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::fs;
use std::path::Path;
use std::time::Instant;
use tracing::{info, warn};

use tw_types::{TuneError, TuneResult};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CategoryStats {
    pub count: u64,
    pub seconds: f64,
    pub weight: f64,
}

impl Default for CategoryStats {
    fn default() -> Self {
        Self {
            count: 0,
            seconds: 0.0,
            weight: 1.0,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskStats {
    categories: BTreeMap<String, CategoryStats>,
}

impl TaskStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Weight of `category`, registering it with weight 1 on first sight.
    pub fn weight(&mut self, category: &str) -> f64 {
        self.categories.entry(category.to_string()).or_default().weight
    }

    pub fn get(&self, category: &str) -> Option<&CategoryStats> {
        self.categories.get(category)
    }

    pub fn record(&mut self, category: &str, seconds: f64) {
        let entry = self.categories.entry(category.to_string()).or_default();
        entry.count += 1;
        entry.seconds += seconds;
    }

    /// Copy with every weight relearned as mean seconds per task.
    pub fn for_next_session(&self) -> Self {
        let categories = self
            .categories
            .iter()
            .map(|(name, stats)| {
                let mut next = *stats;
                if stats.count > 0 && stats.seconds > 0.0 {
                    next.weight = stats.seconds / stats.count as f64;
                }
                (name.clone(), next)
            })
            .collect();
        Self { categories }
    }

    pub fn load(path: impl AsRef<Path>) -> TuneResult<Self> {
        let text = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> TuneResult<()> {
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}

pub type TaskBody<C> = Box<dyn FnOnce(&mut C, &mut TaskQueue<C>) -> TuneResult<()>>;

pub struct Task<C> {
    pub name: String,
    pub category: String,
    /// Cost relative to other tasks of the same category.
    pub multiplier: f64,
    body: TaskBody<C>,
}

impl<C> Task<C> {
    pub fn new<F>(name: impl Into<String>, category: impl Into<String>, body: F) -> Self
    where
        F: FnOnce(&mut C, &mut TaskQueue<C>) -> TuneResult<()> + 'static,
    {
        Self {
            name: name.into(),
            category: category.into(),
            multiplier: 1.0,
            body: Box::new(body),
        }
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }
}

impl<C> std::fmt::Debug for Task<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.name)
            .field("category", &self.category)
            .field("multiplier", &self.multiplier)
            .finish()
    }
}

/// Tasks waiting to run. Task bodies receive it to enqueue follow-up work.
pub struct TaskQueue<C> {
    tasks: VecDeque<Task<C>>,
}

impl<C> Default for TaskQueue<C> {
    fn default() -> Self {
        Self {
            tasks: VecDeque::new(),
        }
    }
}

impl<C> TaskQueue<C> {
    pub fn push(&mut self, task: Task<C>) {
        self.tasks.push_back(task);
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.tasks.iter().map(|t| t.name.as_str()).collect()
    }

    fn pop(&mut self) -> Option<Task<C>> {
        self.tasks.pop_front()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    /// Task about to run; empty for the final report.
    pub task: String,
    pub remaining_weight: f64,
    pub completed_weight: f64,
    pub fraction_remaining: f64,
}

pub trait ProgressSink {
    fn report(&mut self, progress: &Progress);
}

#[derive(Debug, Default)]
pub struct TracingProgress;

impl ProgressSink for TracingProgress {
    fn report(&mut self, progress: &Progress) {
        let done = (1.0 - progress.fraction_remaining) * 100.0;
        if progress.task.is_empty() {
            info!("[{:5.1}%] done", done);
        } else {
            info!("[{:5.1}%] {}", done, progress.task);
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TaskStatus {
    Completed,
    Failed { error: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub name: String,
    pub category: String,
    pub status: TaskStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub seconds: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RunOutcome {
    Completed,
    Interrupted { task: String },
    Aborted { task: String, error: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub records: Vec<TaskRecord>,
    pub outcome: RunOutcome,
    /// Names of tasks left unrun after a halt.
    pub unrun: Vec<String>,
}

impl RunSummary {
    pub fn failed(&self) -> impl Iterator<Item = &TaskRecord> {
        self.records
            .iter()
            .filter(|r| matches!(r.status, TaskStatus::Failed { .. }))
    }
}

pub struct Scheduler<C> {
    queue: TaskQueue<C>,
    stats: TaskStats,
}

impl<C> Scheduler<C> {
    pub fn new(stats: TaskStats) -> Self {
        Self {
            queue: TaskQueue::default(),
            stats,
        }
    }

    pub fn push(&mut self, task: Task<C>) {
        self.queue.push(task);
    }

    pub fn stats(&self) -> &TaskStats {
        &self.stats
    }

    pub fn into_stats(self) -> TaskStats {
        self.stats
    }

    /// Drain the queue in FIFO order. A fatal task error stops the run and
    /// leaves the remaining tasks unrun; any other error only fails its task.
    pub fn run(&mut self, ctx: &mut C, sink: &mut dyn ProgressSink) -> RunSummary {
        let mut records = Vec::new();
        let mut completed_weight = 0.0;
        let mut last_fraction: f64 = 1.0;
        let mut outcome = RunOutcome::Completed;

        while let Some(task) = self.queue.pop() {
            let weight = self.stats.weight(&task.category) * task.multiplier;
            let remaining_weight = weight + queued_weight(&self.queue, &mut self.stats);
            let total = remaining_weight + completed_weight;
            let fraction = if total > 0.0 { remaining_weight / total } else { 0.0 };
            last_fraction = last_fraction.min(fraction);
            sink.report(&Progress {
                task: task.name.clone(),
                remaining_weight,
                completed_weight,
                fraction_remaining: last_fraction,
            });

            let Task {
                name, category, body, ..
            } = task;
            let started_at = Utc::now();
            let clock = Instant::now();
            let result = body(ctx, &mut self.queue);
            let seconds = clock.elapsed().as_secs_f64();
            self.stats.record(&category, seconds);
            completed_weight += weight;

            let status = match &result {
                Ok(()) => TaskStatus::Completed,
                Err(e) => {
                    warn!("task {} failed: {}", name, e);
                    TaskStatus::Failed { error: e.to_string() }
                }
            };
            records.push(TaskRecord {
                name: name.clone(),
                category,
                status,
                started_at,
                finished_at: Utc::now(),
                seconds,
            });

            if let Err(e) = result {
                if e.is_fatal() {
                    outcome = match e {
                        TuneError::Interrupted { .. } => RunOutcome::Interrupted { task: name },
                        other => RunOutcome::Aborted {
                            task: name,
                            error: other.to_string(),
                        },
                    };
                    break;
                }
            }
        }

        let unrun: Vec<String> = self.queue.names().into_iter().map(String::from).collect();
        if outcome == RunOutcome::Completed {
            sink.report(&Progress {
                task: String::new(),
                remaining_weight: 0.0,
                completed_weight,
                fraction_remaining: 0.0,
            });
        } else {
            warn!("run halted with {} task(s) unrun: {:?}", unrun.len(), outcome);
        }
        self.queue = TaskQueue::default();

        RunSummary {
            records,
            outcome,
            unrun,
        }
    }
}

fn queued_weight<C>(queue: &TaskQueue<C>, stats: &mut TaskStats) -> f64 {
    queue
        .tasks
        .iter()
        .map(|t| stats.weight(&t.category) * t.multiplier)
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tw_types::MeasurementError;

    #[derive(Default)]
    struct Collect(Vec<Progress>);

    impl ProgressSink for Collect {
        fn report(&mut self, progress: &Progress) {
            self.0.push(progress.clone());
        }
    }

    type Log = Vec<String>;

    fn note(name: &'static str) -> Task<Log> {
        Task::new(name, "step", move |log: &mut Log, _: &mut TaskQueue<Log>| {
            log.push(name.to_string());
            Ok(())
        })
    }

    #[test]
    fn remaining_weight_counts_current_and_queued_tasks() {
        let mut scheduler = Scheduler::new(TaskStats::new());
        scheduler.push(note("a").with_multiplier(2.0));
        scheduler.push(note("b"));
        scheduler.push(note("c").with_multiplier(2.0));

        let mut log = Log::new();
        let mut sink = Collect::default();
        let summary = scheduler.run(&mut log, &mut sink);

        assert_eq!(summary.outcome, RunOutcome::Completed);
        assert_eq!(log, vec!["a", "b", "c"]);
        let remaining: Vec<f64> = sink.0.iter().map(|p| p.remaining_weight).collect();
        assert_eq!(remaining, vec![5.0, 3.0, 2.0, 0.0]);
        let fractions: Vec<f64> = sink.0.iter().map(|p| p.fraction_remaining).collect();
        assert!(fractions.windows(2).all(|w| w[1] <= w[0]));
        assert_eq!(*fractions.last().unwrap(), 0.0);
    }

    fn noted(name: &'static str, category: &'static str) -> Task<Log> {
        Task::new(name, category, move |log: &mut Log, _: &mut TaskQueue<Log>| {
            log.push(name.to_string());
            Ok(())
        })
    }

    #[test]
    fn remaining_weight_uses_learned_category_weights() {
        let stats: TaskStats = serde_json::from_str(
            r#"{"A": {"count": 4, "seconds": 8.0, "weight": 2.0},
                "B": {"count": 4, "seconds": 4.0, "weight": 1.0}}"#,
        )
        .unwrap();
        let mut scheduler = Scheduler::new(stats);
        scheduler.push(noted("a1", "A"));
        scheduler.push(noted("b", "B"));
        scheduler.push(noted("a2", "A"));

        let mut log = Log::new();
        let mut sink = Collect::default();
        scheduler.run(&mut log, &mut sink);

        let remaining: Vec<f64> = sink.0.iter().map(|p| p.remaining_weight).collect();
        assert_eq!(remaining, vec![5.0, 3.0, 2.0, 0.0]);
        assert_eq!(scheduler.stats().get("A").unwrap().count, 6);
    }

    #[test]
    fn tasks_can_enqueue_more_work_in_fifo_order() {
        let mut scheduler = Scheduler::new(TaskStats::new());
        scheduler.push(Task::new("plan", "plan", |log: &mut Log, queue: &mut TaskQueue<Log>| {
            log.push("plan".into());
            queue.push(note("x"));
            queue.push(note("y"));
            Ok(())
        }));
        scheduler.push(note("z"));

        let mut log = Log::new();
        let mut sink = Collect::default();
        scheduler.run(&mut log, &mut sink);

        assert_eq!(log, vec!["plan", "z", "x", "y"]);
        // never increases even though the plan task grew the queue
        let fractions: Vec<f64> = sink.0.iter().map(|p| p.fraction_remaining).collect();
        assert!(fractions.windows(2).all(|w| w[1] <= w[0]));
    }

    #[test]
    fn non_fatal_error_fails_only_its_task() {
        let mut scheduler = Scheduler::new(TaskStats::new());
        scheduler.push(Task::new("bad", "step", |_: &mut Log, _: &mut TaskQueue<Log>| {
            Err(TuneError::Config("broken".into()))
        }));
        scheduler.push(note("after"));

        let mut log = Log::new();
        let summary = scheduler.run(&mut log, &mut Collect::default());
        assert_eq!(summary.outcome, RunOutcome::Completed);
        assert_eq!(summary.failed().count(), 1);
        assert_eq!(log, vec!["after"]);
    }

    #[test]
    fn fatal_error_halts_the_run() {
        let mut scheduler = Scheduler::new(TaskStats::new());
        scheduler.push(note("first"));
        scheduler.push(Task::new("parse", "step", |_: &mut Log, _: &mut TaskQueue<Log>| {
            Err(MeasurementError::Parse {
                message: "garbage".into(),
            }
            .into())
        }));
        scheduler.push(note("never"));

        let mut log = Log::new();
        let mut sink = Collect::default();
        let summary = scheduler.run(&mut log, &mut sink);

        assert!(matches!(summary.outcome, RunOutcome::Aborted { ref task, .. } if task == "parse"));
        assert_eq!(summary.unrun, vec!["never"]);
        assert_eq!(log, vec!["first"]);
        // no final 0% report after a halt
        assert!(sink.0.iter().all(|p| !p.task.is_empty()));
    }

    #[test]
    fn interrupt_is_reported_as_such() {
        let mut scheduler = Scheduler::new(TaskStats::new());
        scheduler.push(Task::new("measure", "step", |_: &mut Log, _: &mut TaskQueue<Log>| {
            Err(TuneError::Interrupted { completed: 1 })
        }));
        let summary = scheduler.run(&mut Log::new(), &mut Collect::default());
        assert_eq!(
            summary.outcome,
            RunOutcome::Interrupted {
                task: "measure".into()
            }
        );
    }

    #[test]
    fn weights_are_relearned_between_sessions() {
        let mut stats = TaskStats::new();
        assert_eq!(stats.weight("optimize"), 1.0);
        stats.record("optimize", 4.0);
        stats.record("optimize", 2.0);
        // unchanged until the next session
        assert_eq!(stats.weight("optimize"), 1.0);

        let next = stats.for_next_session();
        assert_eq!(next.get("optimize").unwrap().weight, 3.0);
        assert_eq!(next.get("optimize").unwrap().count, 2);
    }

    #[test]
    fn stats_persist_as_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stats.json");
        let mut stats = TaskStats::new();
        stats.record("choice", 1.5);
        stats.save(&path).unwrap();
        assert_eq!(TaskStats::load(&path).unwrap(), stats);
    }
}
