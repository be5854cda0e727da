//! Interfaces to the external systems a run drives.
//!
//! The orchestrator core only talks to these traits. Transport details
//! (HTTP, SSH, agent APIs) live in implementations such as
//! [`crate::http`] or the simulated fleet in [`crate::testing`].

use std::sync::Arc;

use async_trait::async_trait;
use flotilla_core::{MetricSample, ServerSpec, Slot, TrafficState};

use crate::error::Result;
use crate::health::Probe;

/// Controls which servers receive load-balanced traffic.
#[async_trait]
pub trait LoadBalancerAdapter: Send + Sync {
    /// Puts a server into (`true`) or takes it out of (`false`) rotation.
    async fn set_availability(&self, server_id: &str, available: bool) -> Result<()>;

    /// Returns the server's current traffic state.
    async fn status(&self, server_id: &str) -> Result<TrafficState>;

    /// Returns the blue/green slot currently receiving traffic, if the
    /// environment uses one.
    async fn active_slot(&self) -> Result<Option<Slot>>;

    /// Atomically points the environment's traffic at `slot`.
    async fn switch_slot(&self, slot: Slot) -> Result<()>;
}

/// Result reported by a [`Deployer`] for one push.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeployOutcome {
    /// Whether the package was installed.
    pub success: bool,
    /// Failure detail when `success` is false.
    pub error_detail: Option<String>,
}

impl DeployOutcome {
    /// A successful push.
    pub const fn success() -> Self {
        Self {
            success: true,
            error_detail: None,
        }
    }

    /// A failed push.
    pub fn failed(detail: impl Into<String>) -> Self {
        Self {
            success: false,
            error_detail: Some(detail.into()),
        }
    }
}

/// Pushes a package version onto a server.
///
/// An `Err` return means the deployer could not be reached and the call
/// may be retried; a definitive failure is an `Ok` outcome with
/// `success == false`.
#[async_trait]
pub trait Deployer: Send + Sync {
    /// Deploys `version` onto `server`.
    async fn deploy(&self, server: &ServerSpec, version: &str) -> Result<DeployOutcome>;
}

/// Reads runtime metrics from a server.
#[async_trait]
pub trait MetricsSource: Send + Sync {
    /// Takes one sample.
    async fn sample(&self, server: &ServerSpec) -> Result<MetricSample>;
}

/// Outcome of an acceptance-suite run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestReport {
    /// Whether every check passed.
    pub passed: bool,
    /// Short human-readable summary.
    pub summary: String,
}

/// Runs automated acceptance tests against a blue-green standby slot.
#[async_trait]
pub trait TestSuite: Send + Sync {
    /// Runs the suite against `servers` in `slot`.
    async fn run(&self, environment: &str, slot: Slot, servers: &[ServerSpec]) -> Result<TestReport>;
}

/// Suite used when no acceptance command is configured. Always passes.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoTestSuite;

#[async_trait]
impl TestSuite for NoTestSuite {
    async fn run(&self, environment: &str, slot: Slot, _servers: &[ServerSpec]) -> Result<TestReport> {
        tracing::warn!(
            environment = %environment,
            slot = %slot,
            "no acceptance suite configured, switching without tests"
        );
        Ok(TestReport {
            passed: true,
            summary: "no acceptance suite configured".to_string(),
        })
    }
}

/// The set of external collaborators a run uses.
#[derive(Clone)]
pub struct Collaborators {
    /// Load balancer control.
    pub load_balancer: Arc<dyn LoadBalancerAdapter>,
    /// Package deployer.
    pub deployer: Arc<dyn Deployer>,
    /// Health endpoint probe.
    pub probe: Arc<dyn Probe>,
    /// Runtime metrics source.
    pub metrics: Arc<dyn MetricsSource>,
    /// Blue-green acceptance suite.
    pub tests: Arc<dyn TestSuite>,
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collaborators").finish_non_exhaustive()
    }
}
