//! Terminal events published by the orchestrator.
//!
//! Every run ends with exactly one [`DeploymentEvent`]. Subscribers such as
//! chat notifiers or dashboards receive them over a broadcast channel; a
//! run never waits for subscribers, and a run with no subscribers simply
//! drops its event.

use flotilla_core::RollbackDecision;
use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::error::ErrorKind;

/// Capacity of the event channel. Slow subscribers lose the oldest events.
const EVENT_CAPACITY: usize = 64;

/// The outcome of a run, as announced to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum DeploymentEvent {
    /// The target version is live on every server.
    #[serde(rename_all = "camelCase")]
    Completed {
        /// Environment name.
        environment: String,
        /// Run identifier.
        deployment_id: Uuid,
        /// Deployed version.
        version: String,
    },

    /// The run stopped without restoring the previous version everywhere.
    #[serde(rename_all = "camelCase")]
    Failed {
        /// Environment name.
        environment: String,
        /// Run identifier.
        deployment_id: Uuid,
        /// Version that was being deployed.
        version: String,
        /// Error kind.
        kind: ErrorKind,
        /// Error detail.
        reason: String,
    },

    /// The previous known-good version was restored.
    #[serde(rename_all = "camelCase")]
    RolledBack {
        /// Environment name.
        environment: String,
        /// Run identifier.
        deployment_id: Uuid,
        /// Version that is live again, when history knows it.
        #[serde(skip_serializing_if = "Option::is_none")]
        restored_version: Option<String>,
        /// Why the rollback happened.
        decision: RollbackDecision,
    },

    /// Restoring the previous version failed. Needs an operator.
    #[serde(rename_all = "camelCase")]
    RollbackFailed {
        /// Environment name.
        environment: String,
        /// Run identifier.
        deployment_id: Uuid,
        /// Error detail.
        reason: String,
    },
}

impl DeploymentEvent {
    /// Returns the environment the event concerns.
    pub fn environment(&self) -> &str {
        match self {
            Self::Completed { environment, .. }
            | Self::Failed { environment, .. }
            | Self::RolledBack { environment, .. }
            | Self::RollbackFailed { environment, .. } => environment,
        }
    }

    /// Returns the run identifier.
    pub const fn deployment_id(&self) -> Uuid {
        match self {
            Self::Completed { deployment_id, .. }
            | Self::Failed { deployment_id, .. }
            | Self::RolledBack { deployment_id, .. }
            | Self::RollbackFailed { deployment_id, .. } => *deployment_id,
        }
    }
}

/// Fan-out channel for [`DeploymentEvent`]s.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<DeploymentEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    /// Creates a bus with no subscribers.
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CAPACITY);
        Self { sender }
    }

    /// Registers a new subscriber.
    pub fn subscribe(&self) -> broadcast::Receiver<DeploymentEvent> {
        self.sender.subscribe()
    }

    /// Publishes an event without waiting for subscribers.
    pub fn publish(&self, event: DeploymentEvent) {
        tracing::debug!(
            environment = %event.environment(),
            deployment_id = %event.deployment_id(),
            subscribers = self.sender.receiver_count(),
            "publishing deployment event"
        );
        // An error only means nobody is listening.
        let _ = self.sender.send(event);
    }
}
