//! Agent update policy.

use ciwi_core::version::is_version_newer;
use chrono::Duration;

const BASE_BACKOFF_SECS: i64 = 60;
const MAX_BACKOFF_SECS: i64 = 3600;

/// Whether an agent at `agent_version` should be asked to move to `target`.
pub fn should_request_agent_update(agent_version: &str, target: &str, auto_update: bool) -> bool {
    auto_update && !target.trim().is_empty() && is_version_newer(target, agent_version)
}

/// Delay before the next update request after `attempts` consecutive failures:
/// `min(60s * 2^attempts, 1h)`.
pub fn retry_backoff(attempts: u32) -> Duration {
    let secs = 1i64
        .checked_shl(attempts.min(32))
        .and_then(|factor| BASE_BACKOFF_SECS.checked_mul(factor))
        .unwrap_or(MAX_BACKOFF_SECS)
        .min(MAX_BACKOFF_SECS);
    Duration::seconds(secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_should_request_agent_update() {
        assert!(should_request_agent_update("v1.0.0", "v1.1.0", true));
        assert!(!should_request_agent_update("v1.1.0", "v1.1.0", true));
        assert!(!should_request_agent_update("v1.2.0", "v1.1.0", true));
        assert!(!should_request_agent_update("v1.0.0", "", true));
        assert!(!should_request_agent_update("v1.0.0", "v1.1.0", false));
        assert!(should_request_agent_update("dev", "v1.1.0", true));
    }

    #[test]
    fn test_retry_backoff_is_capped_exponential() {
        assert_eq!(retry_backoff(0), Duration::seconds(60));
        assert_eq!(retry_backoff(1), Duration::seconds(120));
        assert_eq!(retry_backoff(3), Duration::seconds(480));
        assert_eq!(retry_backoff(6), Duration::seconds(3600));
        assert_eq!(retry_backoff(40), Duration::seconds(3600));
        let mut previous = Duration::zero();
        for attempt in 0..10 {
            assert!(retry_backoff(attempt) >= previous);
            previous = retry_backoff(attempt);
        }
    }
}
