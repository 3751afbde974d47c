//! Sample project configs and request bodies.

use crate::source::FakeSource;
use serde_json::{Value, json};

pub const DEMO_REPO: &str = "https://example.com/demo.git";
pub const DEMO_COMMIT: &str = "0123456789abcdef0123456789abcdef01234567";

/// Versioned `build`, a `release` that depends on it, and a `second`
/// pipeline whose `publish` needs `prep`, chained as `build -> second`.
pub const DEMO_PROJECT: &str = r#"
version: 1
project:
  name: demo
  pipelines:
    - id: build
      source: { repo: https://example.com/demo.git, ref: main }
      versioning: { file: VERSION, tag_prefix: v }
      jobs:
        - id: compile
          runs_on: { os: linux }
          steps:
            - run: make
    - id: release
      depends_on: [build]
      jobs:
        - id: publish
          steps:
            - run: make publish
    - id: second
      jobs:
        - id: prep
          steps:
            - run: make prep
        - id: publish
          needs: [prep]
          steps:
            - run: make publish
  pipeline_chains:
    - id: ship
      pipelines: [build, second]
"#;

/// A remote where `main` of the demo repo resolves and carries `VERSION`.
pub fn demo_source() -> FakeSource {
    FakeSource::default()
        .with_commit(DEMO_REPO, "main", DEMO_COMMIT)
        .with_file(DEMO_REPO, DEMO_COMMIT, "VERSION", "1.2.3\n")
}

pub fn heartbeat_body(agent_id: &str, version: &str, capabilities: &[(&str, &str)]) -> Value {
    json!({
        "agent_id": agent_id,
        "hostname": format!("{agent_id}.local"),
        "os": "linux",
        "arch": "amd64",
        "version": version,
        "capabilities": capabilities_map(capabilities),
    })
}

pub fn lease_body(agent_id: &str, capabilities: &[(&str, &str)]) -> Value {
    json!({
        "agent_id": agent_id,
        "capabilities": capabilities_map(capabilities),
    })
}

pub fn status_body(agent_id: &str, status: &str) -> Value {
    json!({ "agent_id": agent_id, "status": status })
}

fn capabilities_map(capabilities: &[(&str, &str)]) -> Value {
    capabilities
        .iter()
        .map(|(k, v)| (k.to_string(), Value::String(v.to_string())))
        .collect::<serde_json::Map<_, _>>()
        .into()
}

/// Id of pipeline `pipeline_id` in a project detail body.
pub fn pipeline_record_id(project: &Value, pipeline_id: &str) -> Option<i64> {
    project["pipelines"]
        .as_array()?
        .iter()
        .find(|p| p["pipeline_id"] == pipeline_id)?["id"]
        .as_i64()
}

/// Id of chain `chain_id` in a project detail body.
pub fn chain_record_id(project: &Value, chain_id: &str) -> Option<i64> {
    project["pipeline_chains"]
        .as_array()?
        .iter()
        .find(|c| c["chain_id"] == chain_id)?["id"]
        .as_i64()
}
