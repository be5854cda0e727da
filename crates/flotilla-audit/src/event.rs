//! Audit event definitions.

use chrono::{DateTime, Utc};
use flotilla_core::{RollbackDecision, RollbackScope, RollbackTrigger, RunState};
use serde::{Deserialize, Serialize};
use uuid::{Timestamp, Uuid};

/// Generates a new v7 UUID for audit events.
fn new_event_id() -> Uuid {
    let ts = Timestamp::now(uuid::NoContext);
    Uuid::new_v7(ts)
}

/// Severity level for audit events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EventSeverity {
    /// Informational event
    #[default]
    Info,
    /// Warning event
    Warning,
    /// Error event
    Error,
    /// Critical event requiring immediate attention
    Critical,
}

/// Outcome of an audited step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventOutcome {
    /// Step succeeded
    Success,
    /// Step failed
    Failure,
    /// Step is in progress
    InProgress,
}

/// Base trait for all audit events.
pub trait AuditEvent: Serialize {
    /// Returns the event type identifier.
    fn event_type(&self) -> &'static str;

    /// Returns the event severity.
    fn severity(&self) -> EventSeverity;

    /// Returns the event timestamp.
    fn timestamp(&self) -> DateTime<Utc>;

    /// Returns the run this event belongs to.
    fn deployment_id(&self) -> Option<Uuid>;
}

/// A run state transition.
///
/// Every transition of the orchestrator state machine produces exactly
/// one of these.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransitionEvent {
    /// Unique event ID
    pub id: Uuid,

    /// Event timestamp
    pub timestamp: DateTime<Utc>,

    /// Environment name
    pub environment: String,

    /// Run the transition belongs to
    pub deployment_id: Uuid,

    /// State being left
    pub from_state: RunState,

    /// State being entered
    pub to_state: RunState,

    /// Why the transition happened
    pub reason: String,

    /// Event outcome
    pub outcome: EventOutcome,
}

impl TransitionEvent {
    /// Creates a transition event.
    #[must_use]
    pub fn new(
        environment: &str,
        deployment_id: Uuid,
        from_state: RunState,
        to_state: RunState,
        reason: impl Into<String>,
    ) -> Self {
        let outcome = match to_state {
            RunState::Failed => EventOutcome::Failure,
            RunState::Completed | RunState::RolledBack => EventOutcome::Success,
            _ => EventOutcome::InProgress,
        };
        Self {
            id: new_event_id(),
            timestamp: Utc::now(),
            environment: environment.to_string(),
            deployment_id,
            from_state,
            to_state,
            reason: reason.into(),
            outcome,
        }
    }
}

impl AuditEvent for TransitionEvent {
    fn event_type(&self) -> &'static str {
        "run.transition"
    }

    fn severity(&self) -> EventSeverity {
        match self.to_state {
            RunState::Failed => EventSeverity::Error,
            RunState::RollingBack => EventSeverity::Warning,
            _ => EventSeverity::Info,
        }
    }

    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    fn deployment_id(&self) -> Option<Uuid> {
        Some(self.deployment_id)
    }
}

/// A rollback decision and its result.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecisionEvent {
    /// Unique event ID
    pub id: Uuid,

    /// Event timestamp
    pub timestamp: DateTime<Utc>,

    /// Environment name
    pub environment: String,

    /// Run the decision belongs to
    pub deployment_id: Uuid,

    /// What triggered the rollback
    pub triggered_by: RollbackTrigger,

    /// Which servers are restored
    pub scope: RollbackScope,

    /// Human-readable reason
    pub reason: String,

    /// Version being restored
    #[serde(skip_serializing_if = "Option::is_none")]
    pub restore_version: Option<String>,

    /// Servers covered by the rollback
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub servers: Vec<String>,

    /// Event outcome
    pub outcome: EventOutcome,
}

impl DecisionEvent {
    /// Records that a rollback was decided.
    #[must_use]
    pub fn decided(environment: &str, deployment_id: Uuid, decision: &RollbackDecision) -> Self {
        Self {
            id: new_event_id(),
            timestamp: Utc::now(),
            environment: environment.to_string(),
            deployment_id,
            triggered_by: decision.triggered_by,
            scope: decision.scope,
            reason: decision.reason.clone(),
            restore_version: None,
            servers: Vec::new(),
            outcome: EventOutcome::InProgress,
        }
    }

    /// Sets the version being restored.
    #[must_use]
    pub fn restoring(mut self, version: &str) -> Self {
        self.restore_version = Some(version.to_string());
        self
    }

    /// Sets the servers covered.
    #[must_use]
    pub fn covering<I, S>(mut self, servers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.servers = servers.into_iter().map(Into::into).collect();
        self
    }

    /// Marks the rollback as finished with the given outcome.
    #[must_use]
    pub fn finished(mut self, outcome: EventOutcome) -> Self {
        self.id = new_event_id();
        self.timestamp = Utc::now();
        self.outcome = outcome;
        self
    }
}

impl AuditEvent for DecisionEvent {
    fn event_type(&self) -> &'static str {
        match self.outcome {
            EventOutcome::InProgress => "rollback.decided",
            EventOutcome::Success => "rollback.completed",
            EventOutcome::Failure => "rollback.failed",
        }
    }

    fn severity(&self) -> EventSeverity {
        match self.outcome {
            EventOutcome::Failure => EventSeverity::Critical,
            _ => EventSeverity::Warning,
        }
    }

    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    fn deployment_id(&self) -> Option<Uuid> {
        Some(self.deployment_id)
    }
}

/// Per-server actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerAction {
    /// Removed from traffic
    Drained,
    /// Package pushed
    Deployed,
    /// Health check finished
    HealthChecked,
    /// Returned to traffic
    Reintegrated,
    /// Restored to the known-good version
    Restored,
}

/// A single per-server step.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerEvent {
    /// Unique event ID
    pub id: Uuid,

    /// Event timestamp
    pub timestamp: DateTime<Utc>,

    /// Environment name
    pub environment: String,

    /// Run the step belongs to
    pub deployment_id: Uuid,

    /// Server the step acted on
    pub server_id: String,

    /// What was done
    pub action: ServerAction,

    /// Version involved, when relevant
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    /// Event outcome
    pub outcome: EventOutcome,

    /// Additional details
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ServerEvent {
    /// Creates a server event.
    #[must_use]
    pub fn new(
        environment: &str,
        deployment_id: Uuid,
        server_id: &str,
        action: ServerAction,
        outcome: EventOutcome,
    ) -> Self {
        Self {
            id: new_event_id(),
            timestamp: Utc::now(),
            environment: environment.to_string(),
            deployment_id,
            server_id: server_id.to_string(),
            action,
            version: None,
            outcome,
            details: None,
        }
    }

    /// Sets the version.
    #[must_use]
    pub fn with_version(mut self, version: &str) -> Self {
        self.version = Some(version.to_string());
        self
    }

    /// Sets additional details.
    #[must_use]
    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

impl AuditEvent for ServerEvent {
    fn event_type(&self) -> &'static str {
        match self.action {
            ServerAction::Drained => "server.drained",
            ServerAction::Deployed => "server.deployed",
            ServerAction::HealthChecked => "server.health_checked",
            ServerAction::Reintegrated => "server.reintegrated",
            ServerAction::Restored => "server.restored",
        }
    }

    fn severity(&self) -> EventSeverity {
        match self.outcome {
            EventOutcome::Failure => EventSeverity::Warning,
            _ => EventSeverity::Info,
        }
    }

    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    fn deployment_id(&self) -> Option<Uuid> {
        Some(self.deployment_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transition_event_fields() {
        let run = Uuid::now_v7();
        let event = TransitionEvent::new(
            "production",
            run,
            RunState::Planning,
            RunState::BatchInProgress,
            "batch 1 of 3",
        );
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["environment"], "production");
        assert_eq!(json["fromState"], "Planning");
        assert_eq!(json["toState"], "BatchInProgress");
        assert_eq!(json["reason"], "batch 1 of 3");
        assert!(json.get("timestamp").is_some());
        assert_eq!(event.event_type(), "run.transition");
        assert_eq!(event.severity(), EventSeverity::Info);
    }

    #[test]
    fn test_transition_to_failed_is_error() {
        let event = TransitionEvent::new(
            "production",
            Uuid::now_v7(),
            RunState::RollingBack,
            RunState::Failed,
            "batch 2 failed",
        );
        assert_eq!(event.severity(), EventSeverity::Error);
        assert_eq!(event.outcome, EventOutcome::Failure);
    }

    #[test]
    fn test_decision_event_lifecycle() {
        let decision = RollbackDecision::new(
            RollbackTrigger::ThresholdBreach,
            RollbackScope::Environment,
            "3 of 5 servers unhealthy",
        );
        let decided = DecisionEvent::decided("production", Uuid::now_v7(), &decision)
            .restoring("1.0.0")
            .covering(["web-1", "web-2"]);
        assert_eq!(decided.event_type(), "rollback.decided");
        assert_eq!(decided.servers.len(), 2);

        let failed = decided.clone().finished(EventOutcome::Failure);
        assert_eq!(failed.event_type(), "rollback.failed");
        assert_eq!(failed.severity(), EventSeverity::Critical);
        assert_ne!(failed.id, decided.id);
    }

    #[test]
    fn test_server_event_serialization() {
        let event = ServerEvent::new(
            "staging",
            Uuid::now_v7(),
            "web-3",
            ServerAction::HealthChecked,
            EventOutcome::Failure,
        )
        .with_details("3 consecutive probe failures");
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"action\":\"health_checked\""));
        assert!(json.contains("\"serverId\":\"web-3\""));
        assert!(json.contains("\"outcome\":\"failure\""));
        assert_eq!(event.severity(), EventSeverity::Warning);
    }

    #[test]
    fn test_severity_ordering() {
        assert!(EventSeverity::Critical > EventSeverity::Warning);
        assert!(EventSeverity::Info < EventSeverity::Error);
    }
}
