//! End-to-end scenarios driven through the HTTP API.

use chrono::{Duration, Utc};
use ciwi_core::agent::HeartbeatRequest;
use ciwi_tests::{
    DEMO_COMMIT, TestContext, chain_record_id, demo_source, heartbeat_body, lease_body,
    pipeline_record_id, status_body,
};
use reqwest::StatusCode;
use serde_json::{Value, json};

const SCRIPT_CAPS: [(&str, &str); 2] = [("executor", "script"), ("shells", "posix")];

async fn load_demo(ctx: &TestContext) -> Value {
    ctx.write_config("demo.yaml", ciwi_tests::DEMO_PROJECT).unwrap();
    let body = ctx
        .client
        .post_json("/api/v1/config/load", &json!({ "path": "demo.yaml" }))
        .await
        .unwrap();
    body["project"].clone()
}

async fn job_count(ctx: &TestContext) -> usize {
    ctx.client.get_json("/api/v1/jobs").await.unwrap()["job_executions"]
        .as_array()
        .unwrap()
        .len()
}

/// Lease and succeed every job `agent` can take.
async fn succeed_all(ctx: &TestContext, agent: &str) -> usize {
    let mut done = 0;
    loop {
        let lease = ctx
            .client
            .post_json("/api/v1/agent/lease", &lease_body(agent, &[]))
            .await
            .unwrap();
        if lease["assigned"] != true {
            return done;
        }
        let id = lease["job_execution"]["id"].as_str().unwrap().to_string();
        let resp = ctx
            .client
            .post(
                &format!("/api/v1/jobs/{id}/status"),
                &status_body(agent, "succeeded"),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        done += 1;
    }
}

#[tokio::test]
async fn test_targeted_adhoc_script() {
    let ctx = TestContext::new().await.unwrap();
    ctx.client
        .post_json("/api/v1/heartbeat", &heartbeat_body("agent-run", "v1.0.0", &SCRIPT_CAPS))
        .await
        .unwrap();

    let resp = ctx
        .client
        .post(
            "/api/v1/agents/agent-run/run-script",
            &json!({ "shell": "posix", "script": "echo hello", "timeout_seconds": 120 }),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::CREATED);
    let queued: Value = resp.json().await.unwrap();
    assert_eq!(queued["queued"], true);
    assert_eq!(queued["timeout_seconds"], 120);
    let job_id = queued["job_execution_id"].as_str().unwrap().to_string();

    let other = ctx
        .client
        .post_json("/api/v1/agent/lease", &lease_body("agent-other", &SCRIPT_CAPS))
        .await
        .unwrap();
    assert_eq!(other["assigned"], false);

    let lease = ctx
        .client
        .post_json("/api/v1/agent/lease", &lease_body("agent-run", &SCRIPT_CAPS))
        .await
        .unwrap();
    assert_eq!(lease["assigned"], true);
    assert_eq!(lease["job_execution"]["id"], job_id.as_str());
    assert_eq!(lease["job_execution"]["metadata"]["adhoc"], "1");

    let again = ctx
        .client
        .post_json("/api/v1/agent/lease", &lease_body("agent-run", &SCRIPT_CAPS))
        .await
        .unwrap();
    assert_eq!(again["assigned"], false);
    assert_eq!(again["message"], "agent has active job");
}

#[tokio::test]
async fn test_unsupported_shell_rejected() {
    let ctx = TestContext::new().await.unwrap();
    ctx.client
        .post_json("/api/v1/heartbeat", &heartbeat_body("agent-run", "v1.0.0", &SCRIPT_CAPS))
        .await
        .unwrap();

    let resp = ctx
        .client
        .post(
            "/api/v1/agents/agent-run/run-script",
            &json!({ "shell": "powershell", "script": "Write-Host hi" }),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    assert!(resp.text().await.unwrap().contains("does not support requested shell"));
    assert_eq!(job_count(&ctx).await, 0);

    let missing = ctx
        .client
        .post(
            "/api/v1/agents/nobody/run-script",
            &json!({ "shell": "posix", "script": "true" }),
        )
        .await
        .unwrap();
    assert_eq!(missing.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_chain_run_is_atomic() {
    let ctx = TestContext::with_source(demo_source()).await.unwrap();
    let project = load_demo(&ctx).await;
    let chain = chain_record_id(&project, "ship").unwrap();
    let before = job_count(&ctx).await;

    let resp = ctx
        .client
        .post(
            &format!("/api/v1/pipeline-chains/{chain}/run"),
            &json!({ "pipeline_job_id": "publish" }),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    assert!(resp
        .text()
        .await
        .unwrap()
        .contains("selection excludes required job \"prep\" needed by \"publish\""));
    assert_eq!(job_count(&ctx).await, before);

    let run = ctx
        .client
        .post_json(&format!("/api/v1/pipeline-chains/{chain}/run"), &json!({}))
        .await
        .unwrap();
    assert_eq!(run["enqueued"], 3);
    assert_eq!(job_count(&ctx).await, before + 3);
}

#[tokio::test]
async fn test_version_inherited_by_dependent_pipeline() {
    let ctx = TestContext::with_source(demo_source()).await.unwrap();
    let project = load_demo(&ctx).await;
    let build = pipeline_record_id(&project, "build").unwrap();
    let release = pipeline_record_id(&project, "release").unwrap();
    ctx.client
        .post_json("/api/v1/heartbeat", &heartbeat_body("agent-1", "v1.0.0", &[]))
        .await
        .unwrap();

    let preview = ctx
        .client
        .get_json(&format!("/api/v1/pipelines/{build}/version-preview"))
        .await
        .unwrap();
    assert_eq!(preview["ok"], true);
    assert_eq!(preview["pipeline_version"], "v1.2.3");

    let blocked = ctx
        .client
        .post_empty(&format!("/api/v1/pipelines/{release}/run"))
        .await
        .unwrap();
    assert_eq!(blocked.status(), StatusCode::BAD_REQUEST);

    let run = ctx
        .client
        .post_json(&format!("/api/v1/pipelines/{build}/run"), &json!({}))
        .await
        .unwrap();
    assert_eq!(run["enqueued"], 1);
    assert_eq!(succeed_all(&ctx, "agent-1").await, 1);

    let run = ctx
        .client
        .post_json(&format!("/api/v1/pipelines/{release}/run"), &json!({}))
        .await
        .unwrap();
    let id = run["job_execution_ids"][0].as_str().unwrap();
    let job = ctx.client.get_json(&format!("/api/v1/jobs/{id}")).await.unwrap();
    let job = &job["job_execution"];
    assert_eq!(job["metadata"]["pipeline_version"], "v1.2.3");
    assert_eq!(job["source"]["ref"], DEMO_COMMIT);
    assert_eq!(job["env"]["CIWI_PIPELINE_VERSION"], "v1.2.3");
}

#[tokio::test]
async fn test_agent_update_backoff() {
    let ctx = TestContext::new().await.unwrap();
    ctx.client
        .post_json("/api/v1/heartbeat", &heartbeat_body("agent-old", "v0.9.0", &[]))
        .await
        .unwrap();
    let requested = ctx
        .client
        .post_json("/api/v1/agents/agent-old/update", &json!({}))
        .await
        .unwrap();
    assert_eq!(requested["requested"], true);
    assert_eq!(requested["target"], "v1.0.0");

    let hb = ctx
        .client
        .post_json("/api/v1/heartbeat", &heartbeat_body("agent-old", "v0.9.0", &[]))
        .await
        .unwrap();
    assert_eq!(hb["update_requested"], true);
    assert_eq!(hb["update_target"], "v1.0.0");

    let mut failed = heartbeat_body("agent-old", "v0.9.0", &[]);
    failed["update_failure_reason"] = json!("network");
    ctx.client.post_json("/api/v1/heartbeat", &failed).await.unwrap();

    let hb = ctx
        .client
        .post_json("/api/v1/heartbeat", &heartbeat_body("agent-old", "v0.9.0", &[]))
        .await
        .unwrap();
    assert_eq!(hb["update_requested"], false);
    assert_eq!(hb["update_target"], "");

    let agent = ctx.client.get_json("/api/v1/agents/agent-old").await.unwrap();
    let agent = &agent["agent"];
    assert!(agent["update_attempts"].as_u64().unwrap() >= 1);
    let next_retry: chrono::DateTime<Utc> =
        serde_json::from_value(agent["update_next_retry_utc"].clone()).unwrap();
    assert!(next_retry > Utc::now());
    assert_eq!(agent["update_last_error"], "network");

    let later = ctx
        .state
        .registry()
        .heartbeat(
            HeartbeatRequest {
                agent_id: "agent-old".into(),
                version: "v0.9.0".into(),
                ..Default::default()
            },
            next_retry + Duration::seconds(1),
        )
        .await
        .unwrap();
    assert!(later.update_requested);
    assert_eq!(later.update_target, "v1.0.0");
}

#[tokio::test]
async fn test_force_fail_then_flush() {
    let ctx = TestContext::new().await.unwrap();
    let created = ctx
        .client
        .post_json("/api/v1/jobs", &json!({ "script": "sleep 600", "timeout_seconds": 900 }))
        .await
        .unwrap();
    let id = created["job_execution"]["id"].as_str().unwrap().to_string();

    let lease = ctx
        .client
        .post_json("/api/v1/agent/lease", &lease_body("agent-1", &[]))
        .await
        .unwrap();
    assert_eq!(lease["job_execution"]["id"], id.as_str());
    ctx.client
        .post_json(&format!("/api/v1/jobs/{id}/status"), &status_body("agent-1", "running"))
        .await
        .unwrap();

    let failed = ctx
        .client
        .post_json(&format!("/api/v1/jobs/{id}/force-fail"), &json!({}))
        .await
        .unwrap();
    let job = &failed["job_execution"];
    assert_eq!(job["status"], "failed");
    assert!(job["error"].as_str().unwrap().contains("force-failed"));
    assert!(job["output"]
        .as_str()
        .unwrap()
        .contains("[control] job force-failed from UI"));

    let again = ctx
        .client
        .post_empty(&format!("/api/v1/jobs/{id}/force-fail"))
        .await
        .unwrap();
    assert_eq!(again.status(), StatusCode::CONFLICT);

    let flushed = ctx
        .client
        .post_json("/api/v1/jobs/flush-history", &json!({}))
        .await
        .unwrap();
    assert_eq!(flushed["flushed"], 1);
    let gone = ctx.client.get(&format!("/api/v1/jobs/{id}")).await.unwrap();
    assert_eq!(gone.status(), StatusCode::NOT_FOUND);
}
