//! Job events posted by agents alongside status updates.
//!
//! The event log is an open set: every posted event is stored verbatim, but
//! only a closed set of types has an effect on the job execution.

use crate::ids::JobExecutionId;
use crate::job::{JobExecution, StepProgress};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

pub const STEP_STARTED: &str = "step.started";
pub const STEP_FINISHED: &str = "step.finished";
pub const METADATA_PATCH: &str = "metadata.patch";
pub const ARTIFACT_ANNOUNCE: &str = "artifact.announce";
/// Recorded by the server when a lease is returned to the queue.
pub const LEASE_EXPIRED: &str = "lease.expired";

/// An event as posted by an agent: a `type` plus arbitrary fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEventInput {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

/// A persisted event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEvent {
    pub sequence: i64,
    pub job_execution_id: JobExecutionId,
    #[serde(rename = "type")]
    pub event_type: String,
    pub payload: Value,
    pub created_utc: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EventEffect {
    StepStarted(StepProgress),
    StepFinished(StepProgress),
    MetadataPatch(BTreeMap<String, String>),
    ArtifactAnnounce,
    None,
}

impl JobEventInput {
    pub fn new(event_type: impl Into<String>, payload: Value) -> Self {
        let payload = match payload {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Self {
            event_type: event_type.into(),
            payload,
        }
    }

    /// Classify the event. Malformed known events degrade to `None`.
    pub fn effect(&self) -> EventEffect {
        match self.event_type.as_str() {
            STEP_STARTED => self
                .step()
                .map(EventEffect::StepStarted)
                .unwrap_or(EventEffect::None),
            STEP_FINISHED => self
                .step()
                .map(|mut step| {
                    step.finished = true;
                    EventEffect::StepFinished(step)
                })
                .unwrap_or(EventEffect::None),
            METADATA_PATCH => match self.payload.get("metadata") {
                Some(Value::Object(map)) => EventEffect::MetadataPatch(
                    map.iter()
                        .map(|(k, v)| (k.clone(), value_to_string(v)))
                        .collect(),
                ),
                _ => EventEffect::None,
            },
            ARTIFACT_ANNOUNCE => EventEffect::ArtifactAnnounce,
            _ => EventEffect::None,
        }
    }

    fn step(&self) -> Option<StepProgress> {
        let step = self.payload.get("step")?.as_object()?;
        Some(StepProgress {
            index: step.get("index")?.as_u64()? as u32,
            total: step.get("total").and_then(Value::as_u64).unwrap_or(0) as u32,
            name: step
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            finished: false,
        })
    }

    pub fn payload_value(&self) -> Value {
        Value::Object(self.payload.clone())
    }
}

fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

impl EventEffect {
    pub fn apply(&self, job: &mut JobExecution) {
        match self {
            EventEffect::StepStarted(step) | EventEffect::StepFinished(step) => {
                job.current_step = Some(step.clone());
            }
            EventEffect::MetadataPatch(patch) => {
                for (key, value) in patch {
                    job.metadata.insert(key.clone(), value.clone());
                }
            }
            EventEffect::ArtifactAnnounce | EventEffect::None => {}
        }
    }

    pub fn is_metadata_patch(&self) -> bool {
        matches!(self, EventEffect::MetadataPatch(_))
    }
}
