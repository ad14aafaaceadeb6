//! In-memory view of the tuned program: its binary and its call-tree descriptor.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::errors::TuneResult;
use crate::tunable::{Tunable, TunableKind};

/// Runnable program plus the configuration file it ships with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgramHandle {
    pub name: String,
    pub binary: PathBuf,
    /// Base configuration, reloaded on reset and overwritten by the final save.
    pub config_path: PathBuf,
}

impl ProgramHandle {
    pub fn new(name: impl Into<String>, binary: impl Into<PathBuf>, config_path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            binary: binary.into(),
            config_path: config_path.into(),
        }
    }
}

/// Whether a choice site runs sequentially or may spawn parallel work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChoiceKind {
    Sequential,
    Parallel,
}

/// A point in the call tree where one of several algorithms is picked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChoiceSite {
    pub name: String,
    pub kind: ChoiceKind,
    /// Algorithm-choice tunable selecting the rule.
    pub algorithm: String,
    /// Cutoff tunable switching to the next level, when the site has one.
    #[serde(default)]
    pub cutoff: Option<String>,
}

/// One transform node with its tunables, choice sites and callees.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransformInfo {
    pub name: String,
    #[serde(default)]
    pub tunables: Vec<Tunable>,
    #[serde(default)]
    pub choice_sites: Vec<ChoiceSite>,
    #[serde(default)]
    pub calls: Vec<TransformInfo>,
}

/// Descriptor tree produced by the external descriptor parser.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgramInfo {
    pub name: String,
    pub transforms: Vec<TransformInfo>,
}

impl ProgramInfo {
    pub fn from_json(text: &str) -> TuneResult<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Depth-first, pre-order walk over every transform in the call tree.
    pub fn walk(&self) -> Vec<&TransformInfo> {
        let mut out = Vec::new();
        let mut stack: Vec<&TransformInfo> = self.transforms.iter().rev().collect();
        while let Some(node) = stack.pop() {
            out.push(node);
            stack.extend(node.calls.iter().rev());
        }
        out
    }

    pub fn tunable(&self, name: &str) -> Option<&Tunable> {
        self.walk()
            .into_iter()
            .flat_map(|t| t.tunables.iter())
            .find(|t| t.name == name)
    }

    /// Tunables of one kind, in call-tree order, minus the ignored names.
    pub fn tunables_of_kind(&self, kind: TunableKind, ignore: &[String]) -> Vec<&Tunable> {
        self.walk()
            .into_iter()
            .flat_map(|t| t.tunables.iter())
            .filter(|t| t.kind == kind && !ignore.contains(&t.name))
            .collect()
    }

    /// Choice sites split into (sequential, parallel), minus the ignored names.
    pub fn choice_sites(&self, ignore: &[String]) -> (Vec<&ChoiceSite>, Vec<&ChoiceSite>) {
        self.walk()
            .into_iter()
            .flat_map(|t| t.choice_sites.iter())
            .filter(|c| !ignore.contains(&c.name))
            .partition(|c| c.kind == ChoiceKind::Sequential)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_info() -> ProgramInfo {
        ProgramInfo::from_json(
            r#"{
              "name": "sort",
              "transforms": [{
                "name": "Sort",
                "tunables": [
                  {"name": "sort_seq", "kind": "system.cutoff.sequential", "min": 1, "max": 4096},
                  {"name": "sort_split", "kind": "system.cutoff.splitsize", "min": 1, "max": 512}
                ],
                "choice_sites": [
                  {"name": "Sort_0", "kind": "sequential", "algorithm": "Sort_0_lvl1_rule", "cutoff": "Sort_0_lvl1_cutoff"}
                ],
                "calls": [{
                  "name": "Merge",
                  "tunables": [{"name": "merge_k", "kind": "user.tunable", "min": 2, "max": 16}],
                  "choice_sites": [{"name": "Merge_0", "kind": "parallel", "algorithm": "Merge_0_lvl1_rule"}]
                }]
              }]
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn walk_is_preorder() {
        let info = sample_info();
        let names: Vec<&str> = info.walk().iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["Sort", "Merge"]);
    }

    #[test]
    fn tunables_filtered_by_kind_and_ignore_list() {
        let info = sample_info();
        let seq = info.tunables_of_kind(TunableKind::SequentialCutoff, &[]);
        assert_eq!(seq.len(), 1);
        let user = info.tunables_of_kind(TunableKind::UserTunable, &["merge_k".to_string()]);
        assert!(user.is_empty());
        assert_eq!(info.tunable("merge_k").map(|t| t.max), Some(16));
    }

    #[test]
    fn choice_sites_split_by_kind() {
        let info = sample_info();
        let (seq, par) = info.choice_sites(&[]);
        assert_eq!(seq[0].name, "Sort_0");
        assert_eq!(par[0].name, "Merge_0");
        assert!(par[0].cutoff.is_none());
    }
}
