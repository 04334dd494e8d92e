//! Restart-policy engine (spec.md §4.6): decides whether a Monitor task
//! should schedule a restart after a container exits, and how long to
//! back off first.
//!
//! Grounded in the teacher's `server/crash.rs` windowed-retry counter,
//! repurposed here as a per-exit backoff calculation rather than a crash
//! loop detector.

use std::time::Duration;

use serde::{Deserialize, Serialize};

const BASE_BACKOFF_MS: u64 = 100;
const MAX_BACKOFF: Duration = Duration::from_secs(60);
const JITTER_FRACTION: f64 = 0.2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RestartPolicy {
    No,
    Always,
    UnlessStopped,
    /// `0` means unlimited retries, matching Docker's own convention.
    OnFailure(u32),
}

impl RestartPolicy {
    /// Parses Docker's wire shape: `{"Name": "on-failure", "MaximumRetryCount": 2}`.
    pub fn parse(name: &str, max_retry_count: i64) -> Self {
        match name {
            "always" => RestartPolicy::Always,
            "unless-stopped" => RestartPolicy::UnlessStopped,
            "on-failure" => RestartPolicy::OnFailure(max_retry_count.max(0) as u32),
            _ => RestartPolicy::No,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            RestartPolicy::No => "no",
            RestartPolicy::Always => "always",
            RestartPolicy::UnlessStopped => "unless-stopped",
            RestartPolicy::OnFailure(_) => "on-failure",
        }
    }

    pub fn max_retry_count(&self) -> i64 {
        match self {
            RestartPolicy::OnFailure(n) => *n as i64,
            _ => 0,
        }
    }
}

impl Default for RestartPolicy {
    fn default() -> Self {
        RestartPolicy::No
    }
}

/// Whether the last user-initiated action against a container was a stop,
/// distinct from an exit the process itself caused. `unless-stopped`
/// needs this to avoid restarting a container the user deliberately
/// stopped, even though its exit looks identical to a crash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    ProcessExited,
    UserStopped,
}

/// `should_restart` returns `true` when a Monitor task should schedule a
/// restart for the given policy, exit code, exit reason, and current
/// restart count (spec.md §4.6).
pub fn should_restart(
    policy: RestartPolicy,
    exit_code: i64,
    reason: ExitReason,
    restart_count: u32,
) -> bool {
    match policy {
        RestartPolicy::No => false,
        RestartPolicy::Always => reason != ExitReason::UserStopped,
        RestartPolicy::UnlessStopped => reason != ExitReason::UserStopped,
        RestartPolicy::OnFailure(max) => {
            reason != ExitReason::UserStopped && exit_code != 0 && (max == 0 || restart_count < max)
        }
    }
}

/// Exponential backoff with full jitter: base 100ms, doubling per
/// attempt, capped at 1 minute, jitter ±20% (spec.md §4.6). Jitter comes
/// from `uuid`'s RNG (already a dependency for container IDs) rather than
/// pulling in a dedicated `rand` dependency just for this.
pub fn backoff_delay(attempt: u32) -> Duration {
    let exp = BASE_BACKOFF_MS.saturating_mul(1u64 << attempt.min(20));
    let capped = Duration::from_millis(exp).min(MAX_BACKOFF);

    let sample = uuid::Uuid::new_v4().as_u128();
    // Fold the UUID's random bits into a uniform value in [-1.0, 1.0].
    let unit = ((sample % 2_000_001) as f64 / 1_000_000.0) - 1.0;
    let jitter = capped.as_secs_f64() * JITTER_FRACTION * unit;
    let jittered = (capped.as_secs_f64() + jitter).max(0.0);
    Duration::from_secs_f64(jittered)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_docker_restart_policy_wire_shape() {
        assert_eq!(RestartPolicy::parse("always", 0), RestartPolicy::Always);
        assert_eq!(RestartPolicy::parse("on-failure", 3), RestartPolicy::OnFailure(3));
        assert_eq!(RestartPolicy::parse("unless-stopped", 0), RestartPolicy::UnlessStopped);
        assert_eq!(RestartPolicy::parse("no", 0), RestartPolicy::No);
        assert_eq!(RestartPolicy::parse("bogus", 0), RestartPolicy::No);
    }

    #[test]
    fn no_policy_never_restarts() {
        assert!(!should_restart(RestartPolicy::No, 1, ExitReason::ProcessExited, 0));
    }

    #[test]
    fn always_restarts_unless_user_stopped() {
        assert!(should_restart(RestartPolicy::Always, 0, ExitReason::ProcessExited, 5));
        assert!(!should_restart(RestartPolicy::Always, 0, ExitReason::UserStopped, 5));
    }

    #[test]
    fn on_failure_respects_retry_cap_and_zero_exit() {
        assert!(should_restart(RestartPolicy::OnFailure(2), 1, ExitReason::ProcessExited, 1));
        assert!(!should_restart(RestartPolicy::OnFailure(2), 1, ExitReason::ProcessExited, 2));
        assert!(!should_restart(RestartPolicy::OnFailure(2), 0, ExitReason::ProcessExited, 0));
    }

    #[test]
    fn on_failure_zero_max_is_unlimited() {
        assert!(should_restart(RestartPolicy::OnFailure(0), 1, ExitReason::ProcessExited, 10_000));
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let d0 = backoff_delay(0);
        assert!(d0.as_millis() >= 80 && d0.as_millis() <= 120, "{:?}", d0);

        let d_large = backoff_delay(30);
        assert!(d_large <= MAX_BACKOFF + Duration::from_secs(1));
    }
}
