//! Matrix expansion and `{{key}}` substitution.

use ciwi_core::pipeline::JobConfig;
use ciwi_core::{Error, Result};
use regex::{Captures, Regex};
use std::collections::BTreeMap;
use std::sync::LazyLock;

#[allow(clippy::expect_used)]
static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{\s*([A-Za-z0-9_.\-]+)\s*\}\}").expect("constant regex pattern is valid")
});

/// One concrete instance of a job.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MatrixInstance {
    /// `None` when the job has no matrix.
    pub name: Option<String>,
    pub vars: BTreeMap<String, String>,
}

impl MatrixInstance {
    /// Replace `{{key}}` with the instance's values. `{{name}}` resolves to
    /// the entry name unless the entry defines `name` itself. Unknown keys are
    /// left untouched.
    pub fn substitute(&self, text: &str) -> String {
        if self.vars.is_empty() && self.name.is_none() {
            return text.to_string();
        }
        PLACEHOLDER
            .replace_all(text, |caps: &Captures<'_>| {
                let key = &caps[1];
                match self.vars.get(key) {
                    Some(value) => value.clone(),
                    None if key == "name" => self.name.clone().unwrap_or_else(|| caps[0].to_string()),
                    None => caps[0].to_string(),
                }
            })
            .into_owned()
    }

    pub fn substitute_map(&self, map: &BTreeMap<String, String>) -> BTreeMap<String, String> {
        map.iter()
            .map(|(k, v)| (k.clone(), self.substitute(v)))
            .collect()
    }
}

/// Expander for `matrix.include` entries.
pub struct MatrixExpander;

impl MatrixExpander {
    pub fn new() -> Self {
        Self
    }

    /// Every entry of the job's matrix, or only `selected` when given.
    /// A job without a matrix yields a single anonymous instance.
    pub fn expand(&self, job: &JobConfig, selected: Option<&str>) -> Result<Vec<MatrixInstance>> {
        let entries = job
            .matrix
            .as_ref()
            .map(|m| m.include.as_slice())
            .unwrap_or_default();

        let instances: Vec<MatrixInstance> = entries
            .iter()
            .filter(|entry| selected.is_none_or(|name| entry.name == name))
            .map(|entry| MatrixInstance {
                name: Some(entry.name.clone()),
                vars: entry.vars.clone(),
            })
            .collect();

        match selected {
            Some(name) if instances.is_empty() => Err(Error::validation(format!(
                "unknown matrix entry \"{name}\" for job \"{}\"",
                job.id
            ))),
            None if entries.is_empty() => Ok(vec![MatrixInstance::default()]),
            _ => Ok(instances),
        }
    }
}

impl Default for MatrixExpander {
    fn default() -> Self {
        Self::new()
    }
}
