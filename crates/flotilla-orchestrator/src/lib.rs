//! Flotilla Orchestrator
//!
//! Rolls a new version across a fleet of servers behind a load balancer,
//! gating each step on live health checks and rolling back when runtime
//! metrics breach their thresholds.
//!
//! # Overview
//!
//! - **Strategies**: rolling batches, canary subset then rolling, and
//!   blue-green slot switching
//! - **Health checking**: consecutive-success probing with a bounded attempt count
//! - **Metrics monitoring**: windowed watches that can abort a run from a
//!   background task
//! - **Rollback**: scoped to the failing batch, the canary subset or the
//!   whole environment; a failed rollback stops automation
//! - **History and locks**: one record per run, one run per environment
//!
//! # Architecture
//!
//! ```text
//!  deploy / rollback / status
//!             │
//!  ┌──────────▼───────────┐   alerts   ┌────────────────┐
//!  │ DeploymentOrchestrator│◄──────────│ MetricsMonitor │
//!  └──┬────────┬───────┬──┘            └────────────────┘
//!     │        │       │
//!     ▼        ▼       ▼
//!  LoadBalancer Deployer HealthChecker ──► servers
//! ```
//!
//! # Example
//!
//! ```rust
//! use flotilla_core::{DeploymentPlan, ServerSpec, Strategy};
//! use flotilla_orchestrator::testing::SimulatedFleet;
//! use flotilla_orchestrator::DeploymentOrchestrator;
//! use tokio_util::sync::CancellationToken;
//!
//! # #[tokio::main(flavor = "current_thread", start_paused = true)]
//! # async fn main() {
//! let servers = vec![
//!     ServerSpec::new("web-1", "10.0.0.1:8080"),
//!     ServerSpec::new("web-2", "10.0.0.2:8080"),
//! ];
//! let fleet = SimulatedFleet::new(&servers, "1.0.0");
//! let orchestrator = DeploymentOrchestrator::builder(fleet.collaborators()).build();
//!
//! let plan = DeploymentPlan::builder("staging", "1.1.0")
//!     .strategy(Strategy::Rolling)
//!     .servers(servers)
//!     .post_deploy_monitor(false)
//!     .build()
//!     .unwrap();
//!
//! let report = orchestrator.deploy(plan, CancellationToken::new()).await.unwrap();
//! assert!(report.is_success());
//! assert_eq!(fleet.version_of("web-2").as_deref(), Some("1.1.0"));
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::significant_drop_tightening)]
#![allow(clippy::unused_async)]

pub mod adapters;
pub mod error;
pub mod events;
pub mod executor;
pub mod fleet;
pub mod health;
pub mod history;
pub mod http;
pub mod lock;
pub mod monitor;
pub mod orchestrator;
pub mod retry;
pub mod rollback;
pub mod strategy;
pub mod testing;

pub use adapters::{
    Collaborators, DeployOutcome, Deployer, LoadBalancerAdapter, MetricsSource, NoTestSuite,
    TestReport, TestSuite,
};
pub use error::{ErrorKind, OrchestratorError, Result};
pub use events::{DeploymentEvent, EventBus};
pub use fleet::Fleet;
pub use health::{HealthChecker, HealthOutcome, Probe, ProbeResult, ProbeState};
pub use history::{FileHistory, HistoryStore, InMemoryHistory};
pub use http::{CommandTestSuite, HttpDeployer, HttpLoadBalancer, HttpMetricsSource, HttpProbe};
pub use lock::{EnvironmentGuard, EnvironmentLocks, LockFile, LockInfo};
pub use monitor::{MetricsMonitor, WatchOutcome};
pub use orchestrator::{
    DeploymentOrchestrator, DeploymentOrchestratorBuilder, DeploymentReport, EnvironmentStatus,
    FailureSummary, RollbackOutcome,
};
pub use retry::RetryPolicy;
pub use rollback::RollbackManager;
pub use strategy::{Batch, Phase};
