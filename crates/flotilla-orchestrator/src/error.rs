//! Error types for the orchestrator crate.
//!
//! Every failure a run can hit maps onto one [`ErrorKind`]. Kinds decide
//! what happens next: connectivity errors are retried where they occur,
//! deploy and health failures trigger a scoped rollback, and
//! `RollbackFailure` / `NoRollbackTarget` stop automation entirely.

use std::fmt;

use flotilla_audit::LoggerError;
use flotilla_core::{ConfigError, RollbackDecision, ServerId};
use serde::Serialize;
use thiserror::Error;

/// Result type alias for orchestrator operations.
pub type Result<T> = std::result::Result<T, OrchestratorError>;

/// Error taxonomy used for exit codes, audit entries and terminal events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ErrorKind {
    /// Invalid plan or arguments; nothing was touched.
    ConfigurationError,
    /// A collaborator could not be reached.
    ConnectivityError,
    /// A server never reached the required consecutive health probes.
    HealthCheckTimeout,
    /// The deployer reported a failure.
    DeploymentFailure,
    /// Runtime metrics crossed their limits.
    ThresholdBreach,
    /// Restoring the known-good version failed. Needs an operator.
    RollbackFailure,
    /// No successful deployment exists to restore. Needs an operator.
    NoRollbackTarget,
    /// Another run holds the environment.
    DeploymentInProgress,
    /// The run was cancelled by an operator.
    Cancelled,
    /// History, audit or internal bookkeeping failed.
    Internal,
}

impl ErrorKind {
    /// Returns a string representation for display.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ConfigurationError => "ConfigurationError",
            Self::ConnectivityError => "ConnectivityError",
            Self::HealthCheckTimeout => "HealthCheckTimeout",
            Self::DeploymentFailure => "DeploymentFailure",
            Self::ThresholdBreach => "ThresholdBreach",
            Self::RollbackFailure => "RollbackFailure",
            Self::NoRollbackTarget => "NoRollbackTarget",
            Self::DeploymentInProgress => "DeploymentInProgress",
            Self::Cancelled => "Cancelled",
            Self::Internal => "Internal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors that can occur while orchestrating a deployment.
#[derive(Error, Debug)]
pub enum OrchestratorError {
    /// The plan could not be loaded or is invalid.
    #[error("configuration error: {0}")]
    Configuration(#[from] ConfigError),

    /// A collaborator was unreachable after retries.
    #[error("cannot reach {target}: {reason}")]
    Connectivity {
        /// What was being contacted (server id or endpoint).
        target: String,
        /// Failure reason.
        reason: String,
    },

    /// Health checks were exhausted without enough consecutive successes.
    #[error("server '{server_id}' failed its health check after {attempts} probes: {reason}")]
    HealthCheckTimeout {
        /// Server identifier.
        server_id: ServerId,
        /// Probes performed.
        attempts: u32,
        /// Last probe failure.
        reason: String,
    },

    /// The deployer rejected or failed the package push.
    #[error("deployment to server '{server_id}' failed: {reason}")]
    DeploymentFailure {
        /// Server identifier.
        server_id: ServerId,
        /// Deployer error detail.
        reason: String,
    },

    /// Runtime metrics breached their thresholds.
    #[error("threshold breach: {0}")]
    ThresholdBreach(RollbackDecision),

    /// Restoring the known-good version failed.
    #[error("rollback of '{environment}' failed on {servers:?}: {reason}")]
    RollbackFailure {
        /// Environment name.
        environment: String,
        /// Servers that could not be restored.
        servers: Vec<ServerId>,
        /// Failure reason.
        reason: String,
    },

    /// There is no successful deployment to roll back to.
    #[error("no successful deployment recorded for '{environment}'; nothing to roll back to")]
    NoRollbackTarget {
        /// Environment name.
        environment: String,
    },

    /// Another run holds the environment lock.
    #[error("deployment already in progress for environment '{environment}': {holder}")]
    DeploymentInProgress {
        /// Environment name.
        environment: String,
        /// Identifier of the run (or process) holding the lock.
        holder: String,
    },

    /// The load balancer rejected a traffic change.
    #[error("load balancer error for '{target}': {reason}")]
    LoadBalancer {
        /// Server id or `pointer`.
        target: String,
        /// Failure reason.
        reason: String,
    },

    /// The blue-green acceptance suite failed.
    #[error("acceptance tests failed against the {slot} slot: {summary}")]
    TestSuiteFailed {
        /// Slot under test.
        slot: String,
        /// Suite output summary.
        summary: String,
    },

    /// The run was cancelled.
    #[error("deployment cancelled by operator")]
    Cancelled,

    /// Deployment history could not be read or written.
    #[error("history error: {0}")]
    History(String),

    /// The audit log rejected an event.
    #[error("audit error: {0}")]
    Audit(#[from] LoggerError),

    /// Internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl OrchestratorError {
    /// Returns the error's taxonomy kind.
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Configuration(_) => ErrorKind::ConfigurationError,
            Self::Connectivity { .. } | Self::LoadBalancer { .. } => ErrorKind::ConnectivityError,
            Self::HealthCheckTimeout { .. } => ErrorKind::HealthCheckTimeout,
            Self::DeploymentFailure { .. } | Self::TestSuiteFailed { .. } => {
                ErrorKind::DeploymentFailure
            }
            Self::ThresholdBreach(_) => ErrorKind::ThresholdBreach,
            Self::RollbackFailure { .. } => ErrorKind::RollbackFailure,
            Self::NoRollbackTarget { .. } => ErrorKind::NoRollbackTarget,
            Self::DeploymentInProgress { .. } => ErrorKind::DeploymentInProgress,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::History(_) | Self::Audit(_) | Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Returns true if this error is worth retrying at the boundary where it occurred.
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Connectivity { .. })
    }

    /// Returns true if automation must stop until an operator intervenes.
    pub const fn requires_intervention(&self) -> bool {
        matches!(
            self,
            Self::RollbackFailure { .. } | Self::NoRollbackTarget { .. }
        )
    }

    /// Returns the process exit code for this error.
    pub const fn exit_code(&self) -> u8 {
        match self {
            Self::Configuration(_) => 2,
            _ => 1,
        }
    }
}
