//! # tw-engine
//!
//! Drives a Tunewright session. The [`Scheduler`] runs weighted tasks in FIFO
//! order and reports progress. [`TuningPlan`] fills it with the standard
//! pass over a program's choice sites and tunables, each task operating on
//! the shared [`Session`].

pub mod choice;
pub mod objective;
pub mod scheduler;
pub mod session;
pub mod verify;

pub use choice::{tune_choice_site, ChoiceOption, ChoiceReport};
pub use objective::ProgramObjective;
pub use scheduler::{
    CategoryStats, Progress, ProgressSink, RunOutcome, RunSummary, Scheduler, Task, TaskBody, TaskQueue,
    TaskRecord, TaskStats, TaskStatus, TracingProgress,
};
pub use session::{Session, TunableReport, TuningPlan, WORKER_THREADS};
pub use verify::{verify_timing, VerifyReport};

#[cfg(all(test, unix))]
pub(crate) mod testing {
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;
    use std::time::Duration;

    use tw_exec::{JobExecutor, MeasurementCollector, PoolConfig};
    use tw_types::{ProgramHandle, ProgramInfo, TunerConfig};

    /// Fake program: reads `name = value` entries from its `--config` file
    /// and reports `body` (an awk expression over those names) as timing.
    pub fn fake_program(dir: &Path, names: &[&str], timing_expr: &str, base: &str) -> ProgramHandle {
        let binary = dir.join("fake");
        let config_path = dir.join("fake.cfg");
        let vars: String = names
            .iter()
            .map(|n| format!(" -v {n}=\"$(sed -n 's/^{n} = //p' \"$cfg\")\""))
            .collect();
        let script = format!(
            "#!/bin/sh\ncfg=\"${{1#--config=}}\"\nawk{vars} 'BEGIN {{ printf \"{{\\\"metric\\\": \\\"timing\\\", \\\"average\\\": %.6f}}\\n\", {timing_expr} }}'\n"
        );
        std::fs::write(&binary, script).unwrap();
        std::fs::set_permissions(&binary, std::fs::Permissions::from_mode(0o755)).unwrap();
        std::fs::write(&config_path, base).unwrap();
        ProgramHandle::new("fake", binary, config_path)
    }

    pub fn collector(dir: &Path, config: &TunerConfig) -> MeasurementCollector {
        MeasurementCollector::new(
            JobExecutor::new(PoolConfig::fixed(4), dir),
            config.metrics.clone(),
            Duration::from_secs(2),
        )
    }

    pub fn info(json: &str) -> ProgramInfo {
        ProgramInfo::from_json(json).unwrap()
    }
}
