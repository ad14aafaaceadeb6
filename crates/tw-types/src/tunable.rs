//! Tunable descriptors.

use serde::{Deserialize, Serialize};

use crate::errors::TuneResult;
use crate::validation_error;

/// Declared role of a tunable inside the compiled program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TunableKind {
    #[serde(rename = "system.cutoff.sequential")]
    SequentialCutoff,
    #[serde(rename = "system.cutoff.splitsize")]
    SplitSize,
    #[serde(rename = "user.tunable")]
    UserTunable,
    #[serde(rename = "algchoice.alg")]
    AlgorithmChoice,
}

impl std::fmt::Display for TunableKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tag = match self {
            Self::SequentialCutoff => "system.cutoff.sequential",
            Self::SplitSize => "system.cutoff.splitsize",
            Self::UserTunable => "user.tunable",
            Self::AlgorithmChoice => "algchoice.alg",
        };
        f.write_str(tag)
    }
}

/// A named numeric knob with an inclusive domain `[min, max]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tunable {
    pub name: String,
    pub kind: TunableKind,
    pub min: i64,
    pub max: i64,
}

impl Tunable {
    pub fn new(name: impl Into<String>, kind: TunableKind, min: i64, max: i64) -> TuneResult<Self> {
        let name = name.into();
        if min > max {
            return Err(validation_error!(
                "tunable {name} has an empty domain [{min}, {max}]"
            ));
        }
        Ok(Self {
            name,
            kind,
            min,
            max,
        })
    }

    pub fn contains(&self, value: i64) -> bool {
        (self.min..=self.max).contains(&value)
    }

    pub fn clamp(&self, value: i64) -> i64 {
        value.clamp(self.min, self.max)
    }

    /// Half-open search interval covering the whole domain.
    pub fn search_interval(&self) -> (i64, i64) {
        (self.min, self.max.saturating_add(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_inverted_domain() {
        assert!(Tunable::new("x", TunableKind::UserTunable, 5, 4).is_err());
        assert!(Tunable::new("x", TunableKind::UserTunable, 4, 4).is_ok());
    }

    #[test]
    fn clamp_and_interval() {
        let t = Tunable::new("cutoff", TunableKind::SequentialCutoff, 1, 128).unwrap();
        assert_eq!(t.clamp(0), 1);
        assert_eq!(t.clamp(500), 128);
        assert!(t.contains(64));
        assert_eq!(t.search_interval(), (1, 129));
    }

    #[test]
    fn kind_uses_descriptor_tags() {
        let json = serde_json::to_string(&TunableKind::SplitSize).unwrap();
        assert_eq!(json, "\"system.cutoff.splitsize\"");
        let kind: TunableKind = serde_json::from_str("\"user.tunable\"").unwrap();
        assert_eq!(kind, TunableKind::UserTunable);
    }
}
