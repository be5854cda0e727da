//! Post-deploy health checking.
//!
//! A server is declared healthy only after `requiredConsecutiveSuccesses`
//! probes in a row succeed. Any failed probe resets the streak, and the
//! check gives up after `maxAttempts` probes in total. Network errors are
//! ordinary probe failures.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use flotilla_core::{HealthCheckPolicy, ServerSpec};

/// Result of a single probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeState {
    /// 2xx response reporting `status: "Healthy"`.
    Healthy,
    /// The server answered but is not healthy.
    Unhealthy,
    /// The server could not be reached.
    Unreachable,
}

impl ProbeState {
    /// Returns a string representation for display.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Unhealthy => "unhealthy",
            Self::Unreachable => "unreachable",
        }
    }
}

impl std::fmt::Display for ProbeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A single probe observation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeResult {
    /// Probe state.
    pub state: ProbeState,

    /// Response time, when the server answered.
    pub response_time: Option<Duration>,

    /// Optional message with details.
    pub message: Option<String>,
}

impl ProbeResult {
    /// Creates a healthy result.
    pub const fn healthy(response_time: Duration) -> Self {
        Self {
            state: ProbeState::Healthy,
            response_time: Some(response_time),
            message: None,
        }
    }

    /// Creates an unhealthy result.
    pub fn unhealthy(message: impl Into<String>) -> Self {
        Self {
            state: ProbeState::Unhealthy,
            response_time: None,
            message: Some(message.into()),
        }
    }

    /// Creates an unreachable result.
    pub fn unreachable(message: impl Into<String>) -> Self {
        Self {
            state: ProbeState::Unreachable,
            response_time: None,
            message: Some(message.into()),
        }
    }

    /// Returns true if the probe succeeded.
    pub fn is_success(&self) -> bool {
        self.state == ProbeState::Healthy
    }
}

/// Sends one probe to a server's health endpoint.
///
/// Implementations never fail: transport errors are reported as
/// [`ProbeState::Unreachable`].
#[async_trait]
pub trait Probe: Send + Sync {
    /// Probes `server` according to `policy`.
    async fn probe(&self, server: &ServerSpec, policy: &HealthCheckPolicy) -> ProbeResult;
}

/// Consecutive-success tracker for one health check.
#[derive(Debug, Clone)]
pub struct HealthTracker {
    /// Consecutive success count.
    pub consecutive_successes: u32,

    /// Consecutive failure count.
    pub consecutive_failures: u32,

    /// Total probes recorded.
    pub total_probes: u32,

    /// Last failure message.
    pub last_failure: Option<String>,

    required: u32,
}

impl HealthTracker {
    /// Creates a tracker requiring `required` consecutive successes.
    pub const fn new(required: u32) -> Self {
        Self {
            consecutive_successes: 0,
            consecutive_failures: 0,
            total_probes: 0,
            last_failure: None,
            required,
        }
    }

    /// Records a probe and returns true once the streak is long enough.
    pub fn record(&mut self, result: &ProbeResult) -> bool {
        self.total_probes += 1;

        if result.is_success() {
            self.consecutive_successes += 1;
            self.consecutive_failures = 0;
        } else {
            self.consecutive_successes = 0;
            self.consecutive_failures += 1;
            self.last_failure = Some(
                result
                    .message
                    .clone()
                    .unwrap_or_else(|| result.state.to_string()),
            );
        }

        self.is_healthy()
    }

    /// Returns true if the required streak has been reached.
    pub const fn is_healthy(&self) -> bool {
        self.consecutive_successes >= self.required
    }
}

/// Final verdict of a health check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthOutcome {
    /// The server reached the required streak.
    Healthy {
        /// Probes performed.
        attempts: u32,
    },
    /// Probes were exhausted.
    Unhealthy {
        /// Probes performed.
        attempts: u32,
        /// Last probe failure.
        reason: String,
    },
}

impl HealthOutcome {
    /// Returns true for [`HealthOutcome::Healthy`].
    pub const fn is_healthy(&self) -> bool {
        matches!(self, Self::Healthy { .. })
    }

    /// Returns the number of probes performed.
    pub const fn attempts(&self) -> u32 {
        match self {
            Self::Healthy { attempts } | Self::Unhealthy { attempts, .. } => *attempts,
        }
    }
}

/// Polls a server until it is healthy or the attempt budget runs out.
#[derive(Clone)]
pub struct HealthChecker {
    probe: Arc<dyn Probe>,
}

impl std::fmt::Debug for HealthChecker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthChecker").finish_non_exhaustive()
    }
}

impl HealthChecker {
    /// Creates a checker using `probe` as transport.
    pub fn new(probe: Arc<dyn Probe>) -> Self {
        Self { probe }
    }

    /// Checks one server.
    ///
    /// Sleeps `intervalSeconds` between probes, never after the last one.
    pub async fn check_server(&self, server: &ServerSpec, policy: &HealthCheckPolicy) -> HealthOutcome {
        let mut tracker = HealthTracker::new(policy.required_consecutive_successes);

        for attempt in 1..=policy.max_attempts {
            let result = self.probe.probe(server, policy).await;
            let healthy = tracker.record(&result);

            if result.is_success() {
                tracing::debug!(
                    server_id = %server.id,
                    attempt,
                    streak = tracker.consecutive_successes,
                    "health probe succeeded"
                );
            } else {
                tracing::debug!(
                    server_id = %server.id,
                    attempt,
                    state = %result.state,
                    message = result.message.as_deref().unwrap_or(""),
                    "health probe failed"
                );
            }

            if healthy {
                return HealthOutcome::Healthy { attempts: attempt };
            }

            if attempt < policy.max_attempts {
                tokio::time::sleep(policy.interval()).await;
            }
        }

        let reason = tracker
            .last_failure
            .unwrap_or_else(|| "not enough consecutive successful probes".to_string());
        tracing::warn!(
            server_id = %server.id,
            attempts = tracker.total_probes,
            reason = %reason,
            "health check exhausted"
        );
        HealthOutcome::Unhealthy {
            attempts: tracker.total_probes,
            reason,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    /// Replays a fixed sequence of probe states, then repeats the last one.
    struct ScriptedProbe {
        script: Mutex<VecDeque<ProbeState>>,
        calls: Mutex<u32>,
    }

    impl ScriptedProbe {
        fn new(states: &[ProbeState]) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(states.iter().copied().collect()),
                calls: Mutex::new(0),
            })
        }

        fn calls(&self) -> u32 {
            *self.calls.lock()
        }
    }

    #[async_trait]
    impl Probe for ScriptedProbe {
        async fn probe(&self, _server: &ServerSpec, _policy: &HealthCheckPolicy) -> ProbeResult {
            *self.calls.lock() += 1;
            let mut script = self.script.lock();
            let state = if script.len() > 1 {
                script.pop_front().unwrap_or(ProbeState::Unreachable)
            } else {
                script.front().copied().unwrap_or(ProbeState::Unreachable)
            };
            match state {
                ProbeState::Healthy => ProbeResult::healthy(Duration::from_millis(5)),
                ProbeState::Unhealthy => ProbeResult::unhealthy("status Unhealthy"),
                ProbeState::Unreachable => ProbeResult::unreachable("connection refused"),
            }
        }
    }

    fn policy(max_attempts: u32, required: u32) -> HealthCheckPolicy {
        HealthCheckPolicy {
            max_attempts,
            required_consecutive_successes: required,
            ..HealthCheckPolicy::default()
        }
    }

    fn server() -> ServerSpec {
        ServerSpec::new("web-1", "10.0.0.1:8080")
    }

    #[test]
    fn test_tracker_resets_on_failure() {
        let mut tracker = HealthTracker::new(2);
        assert!(!tracker.record(&ProbeResult::healthy(Duration::ZERO)));
        assert!(!tracker.record(&ProbeResult::unreachable("timeout")));
        assert_eq!(tracker.consecutive_successes, 0);
        assert_eq!(tracker.consecutive_failures, 1);
        assert!(!tracker.record(&ProbeResult::healthy(Duration::ZERO)));
        assert!(tracker.record(&ProbeResult::healthy(Duration::ZERO)));
        assert_eq!(tracker.total_probes, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_healthy_after_required_streak() {
        use ProbeState::{Healthy, Unhealthy};
        let probe = ScriptedProbe::new(&[Unhealthy, Healthy, Healthy, Healthy]);
        let checker = HealthChecker::new(probe.clone());

        let outcome = checker.check_server(&server(), &policy(10, 3)).await;
        assert_eq!(outcome, HealthOutcome::Healthy { attempts: 4 });
        assert_eq!(probe.calls(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_interleaved_failure_resets_streak() {
        use ProbeState::{Healthy, Unreachable};
        let probe = ScriptedProbe::new(&[Healthy, Healthy, Unreachable, Healthy, Healthy, Unreachable]);
        let checker = HealthChecker::new(probe.clone());

        let outcome = checker.check_server(&server(), &policy(6, 3)).await;
        assert!(!outcome.is_healthy());
        assert_eq!(outcome.attempts(), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_attempts() {
        let probe = ScriptedProbe::new(&[ProbeState::Unreachable]);
        let checker = HealthChecker::new(probe.clone());

        let start = tokio::time::Instant::now();
        let outcome = checker.check_server(&server(), &policy(3, 1)).await;

        match outcome {
            HealthOutcome::Unhealthy { attempts, reason } => {
                assert_eq!(attempts, 3);
                assert_eq!(reason, "connection refused");
            }
            HealthOutcome::Healthy { .. } => panic!("expected unhealthy"),
        }
        assert_eq!(probe.calls(), 3);
        // Two intervals between three probes.
        assert_eq!(start.elapsed(), Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_network_errors_do_not_abort_early() {
        use ProbeState::{Healthy, Unreachable};
        let probe = ScriptedProbe::new(&[Unreachable, Unreachable, Healthy]);
        let checker = HealthChecker::new(probe.clone());

        let outcome = checker.check_server(&server(), &policy(5, 1)).await;
        assert_eq!(outcome, HealthOutcome::Healthy { attempts: 3 });
    }
}
