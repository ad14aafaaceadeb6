//! Picks the algorithm (and its cutoff) at one choice site.
//!
//! Every algorithm value is tried on its own candidate: its cutoff is
//! optimized first, then `min_trials` timing runs are taken at `max_n`. A
//! newcomer only displaces the incumbent when it is faster and the
//! difference is statistically significant. Once an incumbent exists, a
//! newcomer's runs are cut off at the limit implied by the incumbent's
//! timing, and a cut-off run counts as a censored sample.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use tw_exec::CandidateTester;
use tw_stats::{compare_candidates, Candidate, Side};
use tw_types::{ChoiceSite, TuneResult};

use crate::objective::ProgramObjective;
use crate::session::Session;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChoiceOption {
    pub algorithm: i64,
    pub cutoff: Option<i64>,
    pub mean: Option<f64>,
    /// `mean (+- half-width)` of the timing samples.
    pub summary: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChoiceReport {
    pub site: String,
    pub n: u64,
    pub options: Vec<ChoiceOption>,
    /// Index into `options` of the chosen algorithm.
    pub chosen: Option<usize>,
}

pub fn tune_choice_site(session: &mut Session, site: &ChoiceSite, max_n: u64) -> TuneResult<ChoiceReport> {
    let algorithm = session.tunable(&site.algorithm)?;
    let cutoff = site.cutoff.as_deref().map(|name| session.tunable(name)).transpose()?;
    let timing = session.config.timing_metric_idx();
    let mut tester = CandidateTester::for_config(session.program.clone(), max_n, &session.config);
    info!(
        "choice site {}: {} algorithm(s) at n={}",
        site.name,
        algorithm.max.abs_diff(algorithm.min) as u128 + 1,
        max_n
    );

    let mut options = Vec::new();
    let mut incumbent: Option<(usize, Candidate)> = None;

    for value in algorithm.min..=algorithm.max {
        let mut configuration = session.candidate.configuration.with_value(&algorithm.name, value);

        let mut chosen_cutoff = None;
        if let Some(cutoff) = &cutoff {
            let hi = cutoff.max.min(max_n as i64);
            if hi >= cutoff.min {
                let mut objective = ProgramObjective::new(&session.collector, &session.program, max_n);
                let outcome = session.optimizer.optimize(
                    &mut configuration,
                    cutoff,
                    cutoff.min,
                    hi + 1,
                    None,
                    &mut objective,
                )?;
                chosen_cutoff = Some(outcome.value);
            }
        }

        let mut candidate = session.new_candidate(configuration);
        tester.time_limit = incumbent.as_ref().and_then(|(_, current)| {
            current.time_limit(timing, max_n, session.config.limit_conf_pct, session.config.limit_multiplier)
        });
        tester.test_repeated(&session.collector, &mut candidate, session.config.min_trials)?;

        let (mean, summary) = match candidate.results(timing, max_n) {
            Some(results) => {
                let results = results.lock();
                (results.mean(), results.to_string())
            }
            None => (None, "???".to_string()),
        };
        debug!("{} {}={}: {}", site.name, algorithm.name, value, summary);
        options.push(ChoiceOption {
            algorithm: value,
            cutoff: chosen_cutoff,
            mean,
            summary,
        });
        if mean.is_none() {
            continue;
        }

        let replace = match &incumbent {
            None => true,
            Some((_, current)) => match compare_candidates(&candidate, current, timing, max_n, session.config.significance) {
                Ok(cmp) => cmp.significant && cmp.faster == Some(Side::First),
                // incumbent has no usable data
                Err(_) => true,
            },
        };
        if replace {
            incumbent = Some((options.len() - 1, candidate));
        }
    }

    let chosen = incumbent.map(|(index, winner)| {
        info!("{}: picked {}", site.name, winner.configuration.get(&algorithm.name).unwrap_or_default());
        session.candidate = session.new_candidate(winner.configuration.clone());
        index
    });

    Ok(ChoiceReport {
        site: site.name.clone(),
        n: max_n,
        options,
        chosen,
    })
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::testing::{collector, fake_program, info};
    use std::os::unix::fs::PermissionsExt;
    use std::time::{Duration, Instant};
    use tw_types::{ProgramHandle, TunerConfig};

    const SITE_INFO: &str = r#"{
      "name": "fake",
      "transforms": [{
        "name": "Sort",
        "tunables": [
          {"name": "Sort_0_rule", "kind": "algchoice.alg", "min": 0, "max": 2},
          {"name": "Sort_0_cutoff", "kind": "system.cutoff.sequential", "min": 1, "max": 1000}
        ],
        "choice_sites": [
          {"name": "Sort_0", "kind": "sequential", "algorithm": "Sort_0_rule", "cutoff": "Sort_0_cutoff"}
        ]
      }]
    }"#;

    #[test]
    fn picks_the_significantly_faster_algorithm() {
        let dir = tempfile::tempdir().unwrap();
        // rule 1 is fastest, and best with a cutoff near 20
        let program = fake_program(
            dir.path(),
            &["Sort_0_rule", "Sort_0_cutoff"],
            "(Sort_0_rule == 1 ? 0.001 : 0.01) * (1 + (Sort_0_cutoff-20)^2/100)",
            "Sort_0_rule = 0\nSort_0_cutoff = 1\n",
        );
        let config = TunerConfig::default().with_tmpdir(dir.path());
        let collector = collector(dir.path(), &config);
        let mut session = Session::with_collector(program, info(SITE_INFO), config, collector).unwrap();

        let site = session.info.choice_sites(&[]).0[0].clone();
        let report = tune_choice_site(&mut session, &site, 64).unwrap();

        assert_eq!(report.options.len(), 3);
        assert_eq!(report.chosen, Some(1));
        assert_eq!(session.configuration().get("Sort_0_rule"), Some(1));
        // cutoff search is capped at max_n
        for option in &report.options {
            let cutoff = option.cutoff.unwrap();
            assert!((1..=64).contains(&cutoff));
        }
        let cutoff = session.configuration().get("Sort_0_cutoff").unwrap();
        assert!((18..=22).contains(&cutoff), "cutoff {cutoff}");
    }

    #[test]
    fn slow_newcomer_is_cut_off_at_the_incumbent_limit() {
        let dir = tempfile::tempdir().unwrap();
        // rule 1 never finishes on its own
        let binary = dir.path().join("stalls");
        std::fs::write(
            &binary,
            r#"#!/bin/sh
cfg="${1#--config=}"
rule=$(sed -n 's/^Sort_0_rule = //p' "$cfg")
if [ "$rule" = 1 ]; then exec sleep 30; fi
echo '{"metric": "timing", "average": 0.01}'
"#,
        )
        .unwrap();
        std::fs::set_permissions(&binary, std::fs::Permissions::from_mode(0o755)).unwrap();
        let config_path = dir.path().join("stalls.cfg");
        std::fs::write(&config_path, "Sort_0_rule = 0\n").unwrap();
        let program = ProgramHandle::new("stalls", binary, config_path);
        let site_info = r#"{
          "name": "stalls",
          "transforms": [{
            "name": "Sort",
            "tunables": [{"name": "Sort_0_rule", "kind": "algchoice.alg", "min": 0, "max": 1}],
            "choice_sites": [{"name": "Sort_0", "kind": "sequential", "algorithm": "Sort_0_rule"}]
          }]
        }"#;
        let config = TunerConfig::default().with_tmpdir(dir.path());
        let collector = collector(dir.path(), &config);
        let mut session = Session::with_collector(program, info(site_info), config, collector).unwrap();

        let site = session.info.choice_sites(&[]).0[0].clone();
        let started = Instant::now();
        let report = tune_choice_site(&mut session, &site, 16).unwrap();

        assert!(started.elapsed() < Duration::from_secs(20));
        assert_eq!(report.chosen, Some(0));
        let stalled = report.options[1].mean.unwrap();
        assert!(stalled > report.options[0].mean.unwrap());
        assert_eq!(session.configuration().get("Sort_0_rule"), Some(0));
    }
}
