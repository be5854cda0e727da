//! Retry with exponential backoff for deployer calls.
//!
//! Only connectivity errors are retried. A deployer that answers with a
//! failed outcome is not asked again.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use flotilla_core::{RetrySettings, ServerSpec};

use crate::adapters::{DeployOutcome, Deployer};
use crate::error::{OrchestratorError, Result};

/// Backoff schedule for retried calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first call.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial_backoff: Duration,
    /// Upper bound for any delay.
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetrySettings::default())
    }
}

impl From<&RetrySettings> for RetryPolicy {
    fn from(settings: &RetrySettings) -> Self {
        Self {
            max_attempts: settings.max_attempts.max(1),
            initial_backoff: Duration::from_millis(settings.initial_backoff_ms),
            max_backoff: Duration::from_millis(settings.max_backoff_ms),
        }
    }
}

impl RetryPolicy {
    /// Delay to wait after failed attempt number `attempt` (1-based).
    ///
    /// Doubles per attempt and is capped at `max_backoff`.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.initial_backoff
            .saturating_mul(1u32 << exponent)
            .min(self.max_backoff)
    }
}

/// A [`Deployer`] that retries transient connectivity failures.
#[derive(Clone)]
pub struct RetryingDeployer {
    inner: Arc<dyn Deployer>,
    policy: RetryPolicy,
}

impl std::fmt::Debug for RetryingDeployer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryingDeployer")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl RetryingDeployer {
    /// Wraps `inner` with the given policy.
    pub fn new(inner: Arc<dyn Deployer>, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    /// Returns the retry policy.
    pub const fn policy(&self) -> RetryPolicy {
        self.policy
    }
}

#[async_trait]
impl Deployer for RetryingDeployer {
    async fn deploy(&self, server: &ServerSpec, version: &str) -> Result<DeployOutcome> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.inner.deploy(server, version).await {
                Ok(outcome) => return Ok(outcome),
                Err(e) if e.is_retryable() && attempt < self.policy.max_attempts => {
                    let delay = self.policy.backoff_for(attempt);
                    tracing::debug!(
                        server_id = %server.id,
                        attempt,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %e,
                        "deploy failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) if e.is_retryable() => {
                    tracing::warn!(server_id = %server.id, attempts = attempt, error = %e, "deployer unreachable");
                    return Err(OrchestratorError::Connectivity {
                        target: server.id.clone(),
                        reason: format!("deployer unreachable after {attempt} attempts: {e}"),
                    });
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    struct FlakyDeployer {
        failures_left: Mutex<u32>,
        calls: Mutex<u32>,
    }

    #[async_trait]
    impl Deployer for FlakyDeployer {
        async fn deploy(&self, server: &ServerSpec, _version: &str) -> Result<DeployOutcome> {
            *self.calls.lock() += 1;
            let mut left = self.failures_left.lock();
            if *left > 0 {
                *left -= 1;
                return Err(OrchestratorError::Connectivity {
                    target: server.id.clone(),
                    reason: "connection reset".to_string(),
                });
            }
            Ok(DeployOutcome::success())
        }
    }

    fn flaky(failures: u32) -> Arc<FlakyDeployer> {
        Arc::new(FlakyDeployer {
            failures_left: Mutex::new(failures),
            calls: Mutex::new(0),
        })
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_millis(1500),
        };
        assert_eq!(policy.backoff_for(1), Duration::from_millis(500));
        assert_eq!(policy.backoff_for(2), Duration::from_millis(1000));
        assert_eq!(policy.backoff_for(3), Duration::from_millis(1500));
        assert_eq!(policy.backoff_for(40), Duration::from_millis(1500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_from_transient_failures() {
        let inner = flaky(2);
        let deployer = RetryingDeployer::new(inner.clone(), RetryPolicy::default());

        let start = tokio::time::Instant::now();
        let outcome = deployer
            .deploy(&ServerSpec::new("web-1", "h:1"), "2.0.0")
            .await
            .unwrap();

        assert!(outcome.success);
        assert_eq!(*inner.calls.lock(), 3);
        assert_eq!(start.elapsed(), Duration::from_millis(1500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_attempts() {
        let inner = flaky(10);
        let deployer = RetryingDeployer::new(inner.clone(), RetryPolicy::default());

        let err = deployer
            .deploy(&ServerSpec::new("web-1", "h:1"), "2.0.0")
            .await
            .unwrap_err();

        assert!(matches!(err, OrchestratorError::Connectivity { .. }));
        assert_eq!(*inner.calls.lock(), 3);
    }
}
