//! Tuner settings: an immutable base configuration plus named override sets.
//!
//! A [`TunerConfig`] is never edited in place by the tuner. Variants are
//! produced with the `with_*` builders or by applying a [`ConfigPatch`],
//! both of which return a new value.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::errors::TuneResult;
use crate::validation_error;

/// Knobs of the interval-narrowing parameter search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizerConfig {
    /// Points sampled per round.
    pub branch_factor: usize,
    /// Relative round improvement below which the search stops.
    pub improvement_threshold: f64,
    /// Added to the best cost to form the per-probe time cap.
    pub probe_slack: f64,
    /// Cost assigned to a capped probe, as a multiple of the cap.
    pub timeout_penalty: f64,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            branch_factor: 7,
            improvement_threshold: 0.05,
            probe_slack: 0.01,
            timeout_penalty: 2.0,
        }
    }
}

impl OptimizerConfig {
    pub fn validate(&self) -> TuneResult<()> {
        if self.branch_factor < 2 {
            return Err(validation_error!(
                "branch factor must be at least 2, got {}",
                self.branch_factor
            ));
        }
        if self.timeout_penalty < 1.0 {
            return Err(validation_error!(
                "timeout penalty must be >= 1, got {}",
                self.timeout_penalty
            ));
        }
        Ok(())
    }
}

/// Top-level configuration for a tuning session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TunerConfig {
    /// Metric names in record order; the first one is timing.
    pub metrics: Vec<String>,

    /// Guessed stddev, as a fraction of the value, when only one sample exists.
    pub prior_stddev_pct: f64,
    /// Floor on the fitted stddev, as a fraction of the mean.
    pub min_std_pct: f64,
    /// Confidence used when rendering `mean (+- half-width)`.
    pub display_confidence: f64,
    /// Confidence for generated execution time limits.
    pub limit_conf_pct: f64,
    /// Multiplier applied to generated time limits.
    pub limit_multiplier: f64,
    /// Relative change treated as "the same" when comparing two candidates.
    pub same_threshold_pct: f64,
    /// p-value gate for accepting one candidate over another.
    pub significance: f64,

    pub min_trials: usize,
    pub max_trials: usize,

    /// Added to every input size handed to the program.
    pub offset: u64,
    /// Input size used when optimizing individual tunables.
    pub random_size: u64,
    pub min_size: u64,
    pub max_size: u64,

    /// Thread count written to the program's `worker_threads` entry.
    pub worker_threads: Option<i64>,
    /// Hard cap on concurrently running jobs; `None` sizes the pool from the CPU count.
    pub max_parallel_jobs: Option<usize>,
    pub pool_slack: usize,
    /// Extra time allowed past a time limit before the job is killed.
    pub kill_grace_sec: f64,

    /// Value written to sequential cutoffs while tuning sequential code.
    pub cutoff_max_val: i64,
    /// Value written to sequential cutoffs while tuning parallel code.
    pub parallel_seq_cutoff: i64,

    /// Skip the second refinement pass.
    pub fast: bool,
    pub debug: bool,

    pub tmpdir: PathBuf,
    /// Tunables and choice sites left untouched by the session.
    pub ignore: Vec<String>,

    pub optimizer: OptimizerConfig,
}

impl Default for TunerConfig {
    fn default() -> Self {
        Self {
            metrics: vec!["timing".to_string(), "accuracy".to_string()],
            prior_stddev_pct: 0.15,
            min_std_pct: 0.000001,
            display_confidence: 0.95,
            limit_conf_pct: 0.95,
            limit_multiplier: 12.0,
            same_threshold_pct: 0.02,
            significance: 0.05,
            min_trials: 3,
            max_trials: 7,
            offset: 0,
            random_size: 100_000,
            min_size: 64,
            max_size: 4096,
            worker_threads: None,
            max_parallel_jobs: None,
            pool_slack: 2,
            kill_grace_sec: 1.0,
            cutoff_max_val: 1 << 30,
            parallel_seq_cutoff: 50,
            fast: false,
            debug: false,
            tmpdir: std::env::temp_dir(),
            ignore: Vec::new(),
            optimizer: OptimizerConfig::default(),
        }
    }
}

impl TunerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_threads(mut self, threads: i64) -> Self {
        self.worker_threads = Some(threads);
        self
    }

    pub fn with_random_size(mut self, n: u64) -> Self {
        self.random_size = n;
        self
    }

    pub fn with_size_bounds(mut self, min: u64, max: u64) -> Self {
        self.min_size = min;
        self.max_size = max;
        self
    }

    pub fn with_fast(mut self, fast: bool) -> Self {
        self.fast = fast;
        self
    }

    pub fn with_ignore(mut self, names: Vec<String>) -> Self {
        self.ignore = names;
        self
    }

    pub fn with_max_parallel_jobs(mut self, jobs: usize) -> Self {
        self.max_parallel_jobs = Some(jobs);
        self
    }

    pub fn with_optimizer(mut self, optimizer: OptimizerConfig) -> Self {
        self.optimizer = optimizer;
        self
    }

    pub fn with_tmpdir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.tmpdir = dir.into();
        self
    }

    /// Index of the timing metric inside [`TunerConfig::metrics`].
    pub fn timing_metric_idx(&self) -> usize {
        0
    }

    pub fn validate(&self) -> TuneResult<()> {
        if self.metrics.is_empty() {
            return Err(validation_error!("at least one metric is required"));
        }
        if self.min_trials == 0 || self.min_trials > self.max_trials {
            return Err(validation_error!(
                "invalid trial bounds: min {} max {}",
                self.min_trials,
                self.max_trials
            ));
        }
        if self.min_size > self.max_size {
            return Err(validation_error!(
                "invalid size bounds: min {} max {}",
                self.min_size,
                self.max_size
            ));
        }
        for (name, p) in [
            ("display_confidence", self.display_confidence),
            ("limit_conf_pct", self.limit_conf_pct),
            ("significance", self.significance),
        ] {
            if !(0.0..1.0).contains(&p) {
                return Err(validation_error!("{name} must be in [0, 1), got {p}"));
            }
        }
        self.optimizer.validate()
    }

    /// New configuration with every field set in `patch` overridden.
    pub fn apply(&self, patch: &ConfigPatch) -> Self {
        let mut next = self.clone();
        macro_rules! merge {
            ($($field:ident),* $(,)?) => {
                $(if let Some(value) = &patch.$field {
                    next.$field = value.clone();
                })*
            };
        }
        merge!(
            metrics,
            prior_stddev_pct,
            min_std_pct,
            display_confidence,
            limit_conf_pct,
            limit_multiplier,
            same_threshold_pct,
            significance,
            min_trials,
            max_trials,
            offset,
            random_size,
            min_size,
            max_size,
            pool_slack,
            kill_grace_sec,
            fast,
            debug,
            tmpdir,
        );
        if let Some(threads) = patch.worker_threads {
            next.worker_threads = Some(threads);
        }
        if let Some(jobs) = patch.max_parallel_jobs {
            next.max_parallel_jobs = Some(jobs);
        }
        if let Some(names) = &patch.ignore {
            next.ignore.extend(names.iter().cloned());
        }
        if let Some(optimizer) = &patch.optimizer {
            next.optimizer = optimizer.clone();
        }
        next
    }

    /// Apply a sequence of patches left to right.
    pub fn apply_all<'a>(&self, patches: impl IntoIterator<Item = &'a ConfigPatch>) -> Self {
        patches
            .into_iter()
            .fold(self.clone(), |config, patch| config.apply(patch))
    }

    pub fn from_json(text: &str) -> TuneResult<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn to_json(&self) -> TuneResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Named set of overrides; unset fields keep the base value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigPatch {
    pub name: String,
    pub metrics: Option<Vec<String>>,
    pub prior_stddev_pct: Option<f64>,
    pub min_std_pct: Option<f64>,
    pub display_confidence: Option<f64>,
    pub limit_conf_pct: Option<f64>,
    pub limit_multiplier: Option<f64>,
    pub same_threshold_pct: Option<f64>,
    pub significance: Option<f64>,
    pub min_trials: Option<usize>,
    pub max_trials: Option<usize>,
    pub offset: Option<u64>,
    pub random_size: Option<u64>,
    pub min_size: Option<u64>,
    pub max_size: Option<u64>,
    pub worker_threads: Option<i64>,
    pub max_parallel_jobs: Option<usize>,
    pub pool_slack: Option<usize>,
    pub kill_grace_sec: Option<f64>,
    pub fast: Option<bool>,
    pub debug: Option<bool>,
    pub tmpdir: Option<PathBuf>,
    /// Appended to the base ignore list.
    pub ignore: Option<Vec<String>>,
    pub optimizer: Option<OptimizerConfig>,
}

impl ConfigPatch {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Settings for automated regression checks.
    pub fn check() -> Self {
        Self {
            max_size: Some(2048),
            limit_multiplier: Some(15.0),
            min_trials: Some(2),
            max_trials: Some(2),
            ..Self::named("check")
        }
    }

    /// Settings for unattended runs.
    pub fn noninteractive() -> Self {
        Self {
            debug: Some(false),
            tmpdir: Some(PathBuf::from("/tmp")),
            ..Self::named("noninteractive")
        }
    }

    pub fn debug() -> Self {
        Self {
            debug: Some(true),
            ..Self::named("debug")
        }
    }

    /// More trials per candidate when inputs are not shared between runs.
    pub fn online_learning() -> Self {
        Self {
            min_trials: Some(5),
            max_trials: Some(30),
            ..Self::named("online_learning")
        }
    }

    /// Tune for a single target input size, rounded to a power of two.
    pub fn for_input_size(n: u64) -> Self {
        let rounded = if n <= 1 {
            1
        } else {
            1u64 << ((n as f64).log2().round() as u32)
        };
        Self {
            max_size: Some(rounded),
            random_size: Some(n),
            ..Self::named(format!("n={n}"))
        }
    }
}
