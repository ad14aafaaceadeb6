//! Flat `name = value` configuration store handed to the tuned program.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use crate::config_error;
use crate::errors::{TuneError, TuneResult};

/// One value per tunable, rewritten wholesale on every save.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Configuration {
    values: BTreeMap<String, i64>,
}

impl Configuration {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<i64> {
        self.values.get(name).copied()
    }

    /// Value of `name`, or an [`TuneError::UnknownTunable`] error.
    pub fn require(&self, name: &str) -> TuneResult<i64> {
        self.get(name).ok_or_else(|| TuneError::UnknownTunable {
            name: name.to_string(),
        })
    }

    /// Set `name`, returning the previous value.
    pub fn set(&mut self, name: impl Into<String>, value: i64) -> Option<i64> {
        self.values.insert(name.into(), value)
    }

    /// Copy of this configuration with a single value replaced.
    pub fn with_value(&self, name: &str, value: i64) -> Self {
        let mut next = self.clone();
        next.set(name, value);
        next
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, i64)> {
        self.values.iter().map(|(k, v)| (k.as_str(), *v))
    }

    pub fn parse(text: &str) -> TuneResult<Self> {
        let mut values = BTreeMap::new();
        for (line_num, line) in text.lines().enumerate() {
            let line = line.split('#').next().unwrap_or_default().trim();
            if line.is_empty() {
                continue;
            }
            let (name, value) = line
                .split_once('=')
                .ok_or_else(|| config_error!("line {}: expected `name = value`", line_num + 1))?;
            let value = value.trim().parse::<i64>().map_err(|e| {
                config_error!("line {}: invalid value for {}: {}", line_num + 1, name.trim(), e)
            })?;
            values.insert(name.trim().to_string(), value);
        }
        Ok(Self { values })
    }

    pub fn load(path: impl AsRef<Path>) -> TuneResult<Self> {
        let text = fs::read_to_string(path.as_ref())?;
        Self::parse(&text)
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        for (name, value) in &self.values {
            out.push_str(name);
            out.push_str(" = ");
            out.push_str(&value.to_string());
            out.push('\n');
        }
        out
    }

    pub fn save(&self, path: impl AsRef<Path>) -> TuneResult<()> {
        fs::write(path.as_ref(), self.render())?;
        Ok(())
    }
}

impl FromIterator<(String, i64)> for Configuration {
    fn from_iter<I: IntoIterator<Item = (String, i64)>>(iter: I) -> Self {
        Self {
            values: iter.into_iter().collect(),
        }
    }
}
