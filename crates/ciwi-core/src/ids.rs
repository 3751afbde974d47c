//! Identifiers for domain entities.
//!
//! Job executions and pipeline runs carry opaque, time-ordered string ids.
//! Persisted catalogue rows (projects, pipelines, chains, vault connections)
//! are keyed by the store's integer row ids.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! define_id {
    ($name:ident, $prefix:expr) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Generate a fresh id. UUIDv7 keeps ids monotonic in creation order.
            pub fn new() -> Self {
                Self(format!("{}-{}", $prefix, Uuid::now_v7().simple()))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }
    };
}

define_id!(JobExecutionId, "job");
define_id!(PipelineRunId, "run");

pub type ProjectId = i64;
pub type PipelineRecordId = i64;
pub type PipelineChainRecordId = i64;
pub type VaultConnectionId = i64;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_id_display() {
        let id = JobExecutionId::new();
        assert!(id.to_string().starts_with("job-"));
    }

    #[test]
    fn test_run_ids_are_monotonic() {
        let first = PipelineRunId::new();
        let second = PipelineRunId::new();
        assert!(first < second);
    }

    #[test]
    fn test_id_from_path_segment() {
        let id = JobExecutionId::from("job-abc");
        assert_eq!(id.as_str(), "job-abc");
    }
}
