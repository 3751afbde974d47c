//! Step marker script generation and build-summary parsing.
//!
//! Steps are joined into one script. Each step is preceded by a marker line
//! the agent recognizes:
//!
//! ```text
//! __CIWI_STEP_BEGIN__ index=1 total=2 name=compile
//! __CIWI_STEP_BEGIN__ index=2 total=2 name=unit kind=test test_name=unit test_format=go-test-json test_report=out.json
//! ```

use ciwi_core::pipeline::{Step, StepConfig};
use ciwi_core::Result;
use std::collections::BTreeMap;

pub const STEP_MARKER: &str = "__CIWI_STEP_BEGIN__";
pub const BUILD_SUMMARY_MARKER: &str = "__CIWI_BUILD_SUMMARY__";

/// Marker values may not contain whitespace.
fn marker_value(raw: &str) -> String {
    let value: String = raw
        .trim()
        .chars()
        .map(|c| if c.is_whitespace() { '_' } else { c })
        .collect();
    if value.is_empty() { "-".to_string() } else { value }
}

pub fn render_steps(steps: &[StepConfig]) -> Result<String> {
    let total = steps.len();
    let mut script = String::new();
    for (i, step) in steps.iter().enumerate() {
        let index = i + 1;
        let (marker, body) = match step.kind()? {
            Step::Run(command) => (
                format!("{STEP_MARKER} index={index} total={total} name=step-{index}"),
                command.to_string(),
            ),
            Step::Test(test) => {
                let name = if test.name.trim().is_empty() { "test" } else { test.name.as_str() };
                (
                    format!(
                        "{STEP_MARKER} index={index} total={total} name={} kind=test test_name={} test_format={} test_report={}",
                        marker_value(name),
                        marker_value(name),
                        marker_value(&test.format),
                        marker_value(&test.report),
                    ),
                    test.command.clone(),
                )
            }
        };
        script.push_str("echo \"");
        script.push_str(&marker);
        script.push_str("\"\n");
        script.push_str(body.trim_end());
        script.push('\n');
    }
    Ok(script)
}

/// Metadata from `__CIWI_BUILD_SUMMARY__ target=… version=… output=…` lines.
/// The last line wins for repeated keys.
pub fn parse_build_summary(output: &str) -> BTreeMap<String, String> {
    let mut metadata = BTreeMap::new();
    for line in output.lines() {
        let Some(rest) = line.trim().strip_prefix(BUILD_SUMMARY_MARKER) else {
            continue;
        };
        for token in rest.split_whitespace() {
            let Some((key, value)) = token.split_once('=') else {
                continue;
            };
            let meta_key = match key {
                "target" => ciwi_core::job::meta::BUILD_TARGET,
                "version" => ciwi_core::job::meta::BUILD_VERSION,
                "output" => ciwi_core::job::meta::BUILD_OUTPUT,
                _ => continue,
            };
            metadata.insert(meta_key.to_string(), value.to_string());
        }
    }
    metadata
}
