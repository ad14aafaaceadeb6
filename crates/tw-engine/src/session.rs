//! Tuning session state and the task plan that drives it.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use tw_exec::MeasurementCollector;
use tw_optimizer::{ParameterOptimizer, SearchPhase};
use tw_stats::{Candidate, ResultSettings};
use tw_types::{
    ChoiceSite, Configuration, ProgramHandle, ProgramInfo, Tunable, TunableKind, TuneError, TuneResult,
    TunerConfig,
};

use crate::choice::{tune_choice_site, ChoiceReport};
use crate::objective::ProgramObjective;
use crate::scheduler::{ProgressSink, RunSummary, Scheduler, Task, TaskQueue, TaskStats};
use crate::verify::{verify_timing, VerifyReport};

pub const WORKER_THREADS: &str = "worker_threads";

/// Result of optimizing one tunable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TunableReport {
    pub name: String,
    pub n: u64,
    pub value: i64,
    pub cost: f64,
    pub impact: f64,
    pub phase: SearchPhase,
    pub rounds: usize,
}

/// Everything a running session owns. Tasks get it by `&mut`.
pub struct Session {
    pub program: ProgramHandle,
    pub info: ProgramInfo,
    pub config: TunerConfig,
    pub candidate: Candidate,
    pub collector: MeasurementCollector,
    pub optimizer: ParameterOptimizer,
    pub tunable_reports: Vec<TunableReport>,
    pub choice_reports: Vec<ChoiceReport>,
    pub verify_report: Option<VerifyReport>,
}

impl Session {
    pub fn new(program: ProgramHandle, info: ProgramInfo, config: TunerConfig) -> TuneResult<Self> {
        let collector = MeasurementCollector::from_tuner_config(&config);
        Self::with_collector(program, info, config, collector)
    }

    pub fn with_collector(
        program: ProgramHandle,
        info: ProgramInfo,
        config: TunerConfig,
        collector: MeasurementCollector,
    ) -> TuneResult<Self> {
        config.validate()?;
        let base = Configuration::load(&program.config_path)?;
        let candidate = Candidate::new(base, &config.metrics, ResultSettings::from(&config));
        Ok(Self {
            optimizer: ParameterOptimizer::new(config.optimizer.clone()),
            program,
            info,
            config,
            candidate,
            collector,
            tunable_reports: Vec::new(),
            choice_reports: Vec::new(),
            verify_report: None,
        })
    }

    pub fn configuration(&self) -> &Configuration {
        &self.candidate.configuration
    }

    /// Fresh candidate with the given configuration and this session's metrics.
    pub fn new_candidate(&self, configuration: Configuration) -> Candidate {
        Candidate::new(configuration, &self.config.metrics, ResultSettings::from(&self.config))
    }

    pub fn is_ignored(&self, name: &str) -> bool {
        self.config.ignore.iter().any(|i| i == name)
    }

    pub fn tunable(&self, name: &str) -> TuneResult<Tunable> {
        self.info.tunable(name).cloned().ok_or_else(|| TuneError::UnknownTunable {
            name: name.to_string(),
        })
    }

    /// Reload the base configuration, keeping the values of ignored tunables.
    pub fn reset(&mut self) -> TuneResult<()> {
        let mut base = Configuration::load(&self.program.config_path)?;
        for name in &self.config.ignore {
            if let Some(value) = self.candidate.configuration.get(name) {
                base.set(name.clone(), value);
            }
        }
        info!("reset {} to its base configuration ({} entries)", self.program.name, base.len());
        self.candidate = self.new_candidate(base);
        Ok(())
    }

    /// Set one entry of the working configuration, dropping stale results.
    pub fn set_value(&mut self, name: &str, value: i64) {
        if self.candidate.configuration.set(name, value) != Some(value) {
            debug!("{} = {}", name, value);
            self.candidate.clear_results();
        }
    }

    pub fn set_all(&mut self, names: &[String], value: i64) {
        for name in names {
            self.set_value(name, value);
        }
    }

    /// Search one tunable over its whole domain at input size `n`.
    pub fn optimize_tunable(&mut self, name: &str, n: u64) -> TuneResult<TunableReport> {
        let tunable = self.tunable(name)?;
        let (start, stop) = tunable.search_interval();
        let mut objective = ProgramObjective::new(&self.collector, &self.program, n);
        let outcome = self.optimizer.optimize(
            &mut self.candidate.configuration,
            &tunable,
            start,
            stop,
            None,
            &mut objective,
        )?;
        self.candidate.clear_results();

        let report = TunableReport {
            name: tunable.name,
            n,
            value: outcome.value,
            cost: outcome.cost,
            impact: outcome.impact,
            phase: outcome.phase(),
            rounds: outcome.trace.rounds.len(),
        };
        info!(
            "{} = {} (impact {:.1}%)",
            report.name,
            report.value,
            report.impact * 100.0
        );
        self.tunable_reports.push(report.clone());
        Ok(report)
    }

    /// Write the working configuration over the program's configuration file.
    pub fn save(&self) -> TuneResult<()> {
        self.candidate.configuration.save(&self.program.config_path)?;
        info!("saved configuration to {}", self.program.config_path.display());
        Ok(())
    }
}

/// The standard tuning pass: algorithm choices first, then cutoffs and
/// user tunables, then a final timing check.
pub struct TuningPlan;

impl TuningPlan {
    pub fn scheduler(stats: TaskStats) -> Scheduler<Session> {
        let mut scheduler = Scheduler::new(stats);
        scheduler.push(Task::new("plan", "plan", |session: &mut Session, queue: &mut TaskQueue<Session>| {
            Self::enqueue(session, queue);
            Ok(())
        }));
        scheduler
    }

    pub fn run(session: &mut Session, stats: TaskStats, sink: &mut dyn ProgressSink) -> (RunSummary, TaskStats) {
        info!(
            "tuning {} (fast = {}, threads = {:?})",
            session.program.name, session.config.fast, session.config.worker_threads
        );
        let mut scheduler = Self::scheduler(stats);
        let summary = scheduler.run(session, sink);
        (summary, scheduler.into_stats())
    }

    fn enqueue(session: &Session, queue: &mut TaskQueue<Session>) {
        let config = &session.config;
        let ignore = &config.ignore;
        let names = |kind| -> Vec<String> {
            session
                .info
                .tunables_of_kind(kind, ignore)
                .into_iter()
                .map(|t| t.name.clone())
                .collect()
        };
        let seq_cutoffs = names(TunableKind::SequentialCutoff);
        let split_sizes = names(TunableKind::SplitSize);
        let user_tunables = names(TunableKind::UserTunable);
        let (static_sites, dynamic_sites) = session.info.choice_sites(ignore);
        let static_sites: Vec<ChoiceSite> = static_sites.into_iter().cloned().collect();
        let dynamic_sites: Vec<ChoiceSite> = dynamic_sites.into_iter().cloned().collect();

        queue.push(Task::new("reset", "reset", |s: &mut Session, _: &mut TaskQueue<Session>| s.reset()));

        if let Some(threads) = config.worker_threads {
            queue.push(Task::new(
                format!("{WORKER_THREADS}={threads}"),
                "config",
                move |s: &mut Session, _: &mut TaskQueue<Session>| {
                    s.set_value(WORKER_THREADS, threads);
                    Ok(())
                },
            ));
        }

        // Sequential code first, with parallel recursion switched off.
        queue.push(set_all_task(seq_cutoffs.clone(), config.cutoff_max_val));
        for site in &static_sites {
            queue.push(choice_task(session, site, config.max_size / 8));
        }

        queue.push(set_all_task(seq_cutoffs.clone(), config.parallel_seq_cutoff));
        for site in &dynamic_sites {
            queue.push(choice_task(session, site, config.max_size));
        }

        let passes = if config.fast { 1 } else { 2 };
        for _ in 0..passes {
            for name in seq_cutoffs.iter().chain(&split_sizes).chain(&user_tunables) {
                queue.push(optimize_task(name.clone(), config.random_size));
            }
            for site in &dynamic_sites {
                queue.push(choice_task(session, site, config.max_size));
            }
        }

        queue.push(Task::new("verify", "verify", |s: &mut Session, _: &mut TaskQueue<Session>| {
            let n = s.config.random_size;
            verify_timing(s, n).map(|report| s.verify_report = Some(report))
        }));
        queue.push(Task::new("save", "save", |s: &mut Session, _: &mut TaskQueue<Session>| s.save()));
        info!("planned {} task(s)", queue.len());
    }
}

fn set_all_task(names: Vec<String>, value: i64) -> Task<Session> {
    Task::new(
        format!("set {} cutoff(s) = {}", names.len(), value),
        "config",
        move |s: &mut Session, _: &mut TaskQueue<Session>| {
            s.set_all(&names, value);
            Ok(())
        },
    )
}

fn optimize_task(name: String, n: u64) -> Task<Session> {
    Task::new(
        format!("optimize {name}"),
        "optimize",
        move |s: &mut Session, _: &mut TaskQueue<Session>| s.optimize_tunable(&name, n).map(|_| ()),
    )
}

fn choice_task(session: &Session, site: &ChoiceSite, max_n: u64) -> Task<Session> {
    // One unit of work per algorithm to try.
    let options = session
        .info
        .tunable(&site.algorithm)
        .map(|t| t.max.abs_diff(t.min) as f64 + 1.0)
        .unwrap_or(1.0);
    let site = site.clone();
    Task::new(
        format!("choice {}", site.name),
        "choice",
        move |s: &mut Session, _: &mut TaskQueue<Session>| {
            let report = tune_choice_site(s, &site, max_n)?;
            s.choice_reports.push(report);
            Ok(())
        },
    )
    .with_multiplier(options)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::scheduler::{RunOutcome, TracingProgress};
    use crate::testing::{collector, fake_program, info};

    const KNOB_INFO: &str = r#"{
      "name": "fake",
      "transforms": [{
        "name": "Main",
        "tunables": [
          {"name": "knob", "kind": "user.tunable", "min": 0, "max": 128},
          {"name": "frozen", "kind": "user.tunable", "min": 0, "max": 10}
        ]
      }]
    }"#;

    fn session(dir: &std::path::Path, config: TunerConfig) -> Session {
        let program = fake_program(dir, &["knob"], "((knob-42)^2+1)/1000", "knob = 0\nfrozen = 1\n");
        let collector = collector(dir, &config);
        Session::with_collector(program, info(KNOB_INFO), config, collector).unwrap()
    }

    #[test]
    fn reset_keeps_ignored_values() {
        let dir = tempfile::tempdir().unwrap();
        let config = TunerConfig::default()
            .with_tmpdir(dir.path())
            .with_ignore(vec!["frozen".to_string()]);
        let mut s = session(dir.path(), config);
        s.set_value("knob", 9);
        s.set_value("frozen", 7);
        s.reset().unwrap();
        assert_eq!(s.configuration().get("knob"), Some(0));
        assert_eq!(s.configuration().get("frozen"), Some(7));
    }

    #[test]
    fn changing_a_value_drops_stale_results() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = session(dir.path(), TunerConfig::default().with_tmpdir(dir.path()));
        s.candidate.results(0, 10).unwrap().lock().add_real(1.0);
        s.set_value("knob", 0);
        assert_eq!(s.candidate.results(0, 10).unwrap().lock().len(), 1);
        s.set_value("knob", 5);
        assert!(s.candidate.results(0, 10).unwrap().lock().is_empty());
    }

    #[test]
    fn invalid_config_is_rejected_with_an_injected_collector() {
        let dir = tempfile::tempdir().unwrap();
        let program = fake_program(dir.path(), &["knob"], "knob", "knob = 0\n");
        let mut config = TunerConfig::default().with_tmpdir(dir.path());
        config.metrics.clear();
        let collector = collector(dir.path(), &config);
        assert!(matches!(
            Session::with_collector(program, info(KNOB_INFO), config, collector),
            Err(TuneError::Validation(_))
        ));
    }

    #[test]
    fn choice_weight_covers_the_full_algorithm_range() {
        let dir = tempfile::tempdir().unwrap();
        let wide = r#"{
          "name": "fake",
          "transforms": [{
            "name": "Sort",
            "tunables": [
              {"name": "Sort_0_rule", "kind": "algchoice.alg", "min": -9223372036854775808, "max": 9223372036854775807}
            ],
            "choice_sites": [{"name": "Sort_0", "kind": "sequential", "algorithm": "Sort_0_rule"}]
          }]
        }"#;
        let program = fake_program(dir.path(), &[], "1", "Sort_0_rule = 0\n");
        let config = TunerConfig::default().with_tmpdir(dir.path());
        let collector = collector(dir.path(), &config);
        let s = Session::with_collector(program, info(wide), config, collector).unwrap();
        let site = s.info.choice_sites(&[]).0[0].clone();

        let task = choice_task(&s, &site, 64);
        assert_eq!(task.multiplier, 2f64.powi(64));
    }

    #[test]
    fn unknown_tunable_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = session(dir.path(), TunerConfig::default().with_tmpdir(dir.path()));
        assert!(matches!(
            s.optimize_tunable("missing", 10),
            Err(TuneError::UnknownTunable { .. })
        ));
    }

    #[test]
    fn plan_tunes_fake_program_to_its_optimum() {
        let dir = tempfile::tempdir().unwrap();
        let config = TunerConfig::default()
            .with_tmpdir(dir.path())
            .with_random_size(100)
            .with_ignore(vec!["frozen".to_string()]);
        let mut s = session(dir.path(), config);

        let (summary, stats) = TuningPlan::run(&mut s, TaskStats::new(), &mut TracingProgress);

        assert_eq!(summary.outcome, RunOutcome::Completed);
        assert_eq!(summary.failed().count(), 0);
        let names: Vec<&str> = summary.records.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names.first(), Some(&"plan"));
        assert_eq!(names.iter().filter(|n| **n == "optimize knob").count(), 2);
        assert_eq!(&names[names.len() - 2..], &["verify", "save"]);

        // two passes, both land on the bowl's floor
        assert_eq!(s.tunable_reports.len(), 2);
        for report in &s.tunable_reports {
            assert!((41..=43).contains(&report.value), "{report:?}");
        }
        let saved = Configuration::load(&s.program.config_path).unwrap();
        let knob = saved.get("knob").unwrap();
        assert!((41..=43).contains(&knob));
        assert_eq!(saved.get("frozen"), Some(1));

        let verify = s.verify_report.as_ref().unwrap();
        assert!(verify.mean < 0.01);
        assert_eq!(stats.get("optimize").unwrap().count, 2);
    }

    #[test]
    fn fast_mode_runs_one_pass() {
        let dir = tempfile::tempdir().unwrap();
        let config = TunerConfig::default()
            .with_tmpdir(dir.path())
            .with_random_size(100)
            .with_fast(true)
            .with_threads(2);
        let mut s = session(dir.path(), config);
        let (summary, _) = TuningPlan::run(&mut s, TaskStats::new(), &mut TracingProgress);

        assert_eq!(summary.outcome, RunOutcome::Completed);
        // frozen is not ignored here, so both tunables are optimized once
        assert_eq!(s.tunable_reports.len(), 2);
        let saved = Configuration::load(&s.program.config_path).unwrap();
        assert_eq!(saved.get(WORKER_THREADS), Some(2));
    }
}
