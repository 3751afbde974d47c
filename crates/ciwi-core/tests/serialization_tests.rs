//! Wire-format tests for ciwi-core types.

use chrono::Utc;
use ciwi_core::agent::*;
use ciwi_core::events::*;
use ciwi_core::job::*;
use serde_json::json;
use std::collections::BTreeMap;

#[test]
fn test_job_execution_wire_shape() {
    let mut env = BTreeMap::new();
    env.insert("CIWI_DRY_RUN".to_string(), "1".to_string());
    let job = JobExecution::queued(
        NewJobExecution {
            script: "echo hi".into(),
            env,
            timeout_seconds: 30,
            ..Default::default()
        },
        Utc::now(),
    );

    let value = serde_json::to_value(&job).expect("serialize");
    assert_eq!(value["status"], "queued");
    assert_eq!(value["env"]["CIWI_DRY_RUN"], "1");
    assert!(value.get("started_utc").is_none());
    assert!(value.get("leased_by_agent_id").is_none());

    let parsed: JobExecution = serde_json::from_value(value).expect("deserialize");
    assert_eq!(parsed, job);
}

#[test]
fn test_new_job_accepts_minimal_body() {
    let new: NewJobExecution = serde_json::from_value(json!({
        "script": "make",
        "source": {"repo": "https://example.com/r.git", "ref": "main"}
    }))
    .expect("deserialize");
    assert_eq!(new.source.unwrap().git_ref, "main");
    assert!(new.required_capabilities.is_empty());
}

#[test]
fn test_heartbeat_request_defaults() {
    let req: HeartbeatRequest = serde_json::from_value(json!({
        "agent_id": "agent-1",
        "capabilities": {"executor": "script", "shells": "posix"}
    }))
    .expect("deserialize");
    assert_eq!(req.agent_id, "agent-1");
    assert!(req.timestamp_utc.is_none());
    assert!(req.update_failure_reason.is_none());
}

#[test]
fn test_agent_view_status_is_snake_case() {
    let mut agent = AgentState::new("agent-1");
    agent.last_seen_utc = Some(Utc::now());
    let value = serde_json::to_value(agent.view(Utc::now(), "dev")).expect("serialize");
    assert_eq!(value["status"], "online");
    assert_eq!(value["needs_update"], false);
}

#[test]
fn test_event_input_keeps_unknown_fields() {
    let input: JobEventInput = serde_json::from_value(json!({
        "type": "artifact.announce",
        "path": "dist/app",
    }))
    .expect("deserialize");
    assert_eq!(input.effect(), EventEffect::ArtifactAnnounce);
    assert_eq!(input.payload_value()["path"], "dist/app");
}
