//! Capability requirements and agent matching.

use ciwi_core::agent::caps;
use ciwi_core::pipeline::JobConfig;
use ciwi_core::version::compare_tool_versions;
use std::cmp::Ordering;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparator {
    Ge,
    Gt,
    Eq,
}

impl Comparator {
    fn symbol(self) -> &'static str {
        match self {
            Comparator::Ge => ">=",
            Comparator::Gt => ">",
            Comparator::Eq => "=",
        }
    }

    fn accepts(self, ord: Ordering) -> bool {
        match self {
            Comparator::Ge => ord != Ordering::Less,
            Comparator::Gt => ord == Ordering::Greater,
            Comparator::Eq => ord == Ordering::Equal,
        }
    }
}

/// A parsed requirement value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Requirement<'a> {
    /// Empty value: the capability only has to be advertised.
    Present,
    Literal(&'a str),
    Compare(Comparator, &'a str),
}

impl<'a> Requirement<'a> {
    pub fn parse(raw: &'a str) -> Self {
        let raw = raw.trim();
        if raw.is_empty() {
            return Requirement::Present;
        }
        if let Some(rest) = raw.strip_prefix(">=") {
            Requirement::Compare(Comparator::Ge, rest.trim())
        } else if let Some(rest) = raw.strip_prefix('>') {
            Requirement::Compare(Comparator::Gt, rest.trim())
        } else if let Some(rest) = raw.strip_prefix('=') {
            Requirement::Compare(Comparator::Eq, rest.trim())
        } else {
            Requirement::Literal(raw)
        }
    }

    fn accepts(self, have: &str) -> bool {
        let have = have.trim();
        match self {
            Requirement::Present => true,
            Requirement::Literal(want) => have == want,
            Requirement::Compare(op, want) => match compare_tool_versions(have, want) {
                Some(ord) => op.accepts(ord),
                None => op != Comparator::Gt && have == want,
            },
        }
    }
}

/// Whether one requirement is met by `capabilities`.
pub fn requirement_met(key: &str, want: &str, capabilities: &BTreeMap<String, String>) -> bool {
    if key == caps::SHELL {
        let want = want.trim();
        let in_list = capabilities.get(caps::SHELLS).is_some_and(|shells| {
            shells.split(',').any(|s| s.trim().eq_ignore_ascii_case(want))
        });
        return in_list
            || capabilities
                .get(caps::SHELL)
                .is_some_and(|s| s.trim().eq_ignore_ascii_case(want));
    }
    match capabilities.get(key) {
        Some(have) => Requirement::parse(want).accepts(have),
        None => false,
    }
}

pub fn satisfies(
    required: &BTreeMap<String, String>,
    capabilities: &BTreeMap<String, String>,
) -> bool {
    required
        .iter()
        .all(|(key, want)| requirement_met(key, want, capabilities))
}

/// Render a requirement for `unmet_requirements`: `key=value` or `keyOPvalue`.
pub fn render(key: &str, want: &str) -> String {
    match Requirement::parse(want) {
        Requirement::Present => key.to_string(),
        Requirement::Literal(value) => format!("{key}={value}"),
        Requirement::Compare(op, value) => format!("{key}{}{value}", op.symbol()),
    }
}

/// Requirements no known agent satisfies, each checked on its own.
pub fn unmet_requirements(
    required: &BTreeMap<String, String>,
    agents: &[BTreeMap<String, String>],
) -> Vec<String> {
    required
        .iter()
        .filter(|(key, want)| !agents.iter().any(|caps| requirement_met(key, want, caps)))
        .map(|(key, want)| render(key, want))
        .collect()
}

/// `runs_on` merged with `requires.tools` as `requires.tool.<name>`.
pub fn job_requirements(job: &JobConfig) -> BTreeMap<String, String> {
    let mut required = job.runs_on.clone();
    for (tool, constraint) in &job.requires.tools {
        required.insert(format!("{}{tool}", caps::TOOL_PREFIX), constraint.clone());
    }
    required
}
