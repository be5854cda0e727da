//! Deployment records, metric samples and rollback decisions.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::plan::{RollbackThresholds, Strategy};
use crate::server::{ServerId, Slot};

/// Terminal status of a deployment or rollback run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeploymentStatus {
    /// The run completed and the target version is live.
    Success,
    /// The run aborted; the fleet is in a defined, partially deployed state.
    Failed,
    /// The run's changes were reverted to the last known-good state.
    RolledBack,
}

impl DeploymentStatus {
    /// Returns a string representation for display.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Success => "Success",
            Self::Failed => "Failed",
            Self::RolledBack => "RolledBack",
        }
    }
}

impl fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An immutable history entry for one finished run.
///
/// The most recent `Success` record for an environment is the only
/// valid rollback target.
///
/// # Examples
///
/// ```
/// use chrono::Utc;
/// use flotilla_core::{DeploymentRecord, DeploymentStatus, Strategy};
///
/// let started = Utc::now();
/// let record = DeploymentRecord::new("staging", "1.4.0", Strategy::Rolling, started)
///     .finish(DeploymentStatus::Success, Utc::now());
/// assert!(record.is_success());
/// assert!(!record.is_rollback());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentRecord {
    /// Record identifier (UUID v7, time-ordered).
    pub id: Uuid,

    /// Environment name.
    pub environment: String,

    /// Version deployed (or restored, for rollback records).
    pub version: String,

    /// Strategy used by the run.
    pub strategy: Strategy,

    /// When the run started.
    pub started_at: DateTime<Utc>,

    /// When the run reached its terminal state.
    pub ended_at: DateTime<Utc>,

    /// Terminal status.
    pub status: DeploymentStatus,

    /// Id of the `Success` record that was current when the run started.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_reference: Option<Uuid>,

    /// Active blue/green slot at the end of the run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_slot: Option<Slot>,

    /// For manual rollbacks, the id of the record that was restored.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollback_of: Option<Uuid>,

    /// Error summary for unsuccessful runs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DeploymentRecord {
    /// Starts a record for a run. The status is provisional until [`finish`](Self::finish).
    pub fn new(
        environment: impl Into<String>,
        version: impl Into<String>,
        strategy: Strategy,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            environment: environment.into(),
            version: version.into(),
            strategy,
            started_at,
            ended_at: started_at,
            status: DeploymentStatus::Failed,
            backup_reference: None,
            active_slot: None,
            rollback_of: None,
            error: None,
        }
    }

    /// Sets the backup reference.
    #[must_use]
    pub const fn with_backup(mut self, backup: Option<Uuid>) -> Self {
        self.backup_reference = backup;
        self
    }

    /// Sets the active slot.
    #[must_use]
    pub const fn with_active_slot(mut self, slot: Option<Slot>) -> Self {
        self.active_slot = slot;
        self
    }

    /// Marks the record as a manual rollback restoring `target`.
    #[must_use]
    pub const fn rolling_back(mut self, target: Uuid) -> Self {
        self.rollback_of = Some(target);
        self
    }

    /// Attaches an error summary.
    #[must_use]
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    /// Sets the terminal status and end time.
    #[must_use]
    pub const fn finish(mut self, status: DeploymentStatus, ended_at: DateTime<Utc>) -> Self {
        self.status = status;
        self.ended_at = ended_at;
        self
    }

    /// Returns true if the run succeeded.
    pub fn is_success(&self) -> bool {
        self.status == DeploymentStatus::Success
    }

    /// Returns true for manual rollback records.
    pub const fn is_rollback(&self) -> bool {
        self.rollback_of.is_some()
    }
}

/// What caused a rollback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RollbackTrigger {
    /// A server failed its deploy or health check.
    HealthCheckFailure,
    /// The metrics monitor saw too many unhealthy servers.
    ThresholdBreach,
    /// An operator cancelled the run.
    OperatorCancel,
}

impl fmt::Display for RollbackTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::HealthCheckFailure => write!(f, "HealthCheckFailure"),
            Self::ThresholdBreach => write!(f, "ThresholdBreach"),
            Self::OperatorCancel => write!(f, "OperatorCancel"),
        }
    }
}

/// Which servers a rollback restores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RollbackScope {
    /// Only the servers of the failing batch.
    Batch,
    /// Only the canary subset.
    Canary,
    /// Every server the run touched (or, for manual rollback, the whole environment).
    Environment,
}

impl fmt::Display for RollbackScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Batch => write!(f, "Batch"),
            Self::Canary => write!(f, "Canary"),
            Self::Environment => write!(f, "Environment"),
        }
    }
}

/// A decision to roll back part or all of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RollbackDecision {
    /// What triggered the rollback.
    pub triggered_by: RollbackTrigger,
    /// Which servers are restored.
    pub scope: RollbackScope,
    /// Human-readable reason.
    pub reason: String,
}

impl RollbackDecision {
    /// Creates a decision.
    pub fn new(triggered_by: RollbackTrigger, scope: RollbackScope, reason: impl Into<String>) -> Self {
        Self {
            triggered_by,
            scope,
            reason: reason.into(),
        }
    }

    /// Returns the same decision with a different scope.
    #[must_use]
    pub fn with_scope(mut self, scope: RollbackScope) -> Self {
        self.scope = scope;
        self
    }
}

impl fmt::Display for RollbackDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({} scope): {}", self.triggered_by, self.scope, self.reason)
    }
}

/// One round of runtime metrics from a server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricSample {
    /// Server the sample came from.
    pub server_id: ServerId,

    /// When the sample was taken.
    pub timestamp: DateTime<Utc>,

    /// Error rate, in percent.
    pub error_rate: f64,

    /// p95 latency in milliseconds.
    pub latency_p95: f64,

    /// CPU utilisation, in percent.
    pub cpu_percent: f64,

    /// Memory utilisation, in percent.
    pub memory_percent: f64,

    /// Availability, in percent, if the server reports it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub availability_percent: Option<f64>,
}

impl MetricSample {
    /// Creates a sample with all metrics at zero.
    pub fn idle(server_id: impl Into<ServerId>) -> Self {
        Self {
            server_id: server_id.into(),
            timestamp: Utc::now(),
            error_rate: 0.0,
            latency_p95: 0.0,
            cpu_percent: 0.0,
            memory_percent: 0.0,
            availability_percent: None,
        }
    }

    /// Sets the error rate.
    #[must_use]
    pub const fn error_rate(mut self, pct: f64) -> Self {
        self.error_rate = pct;
        self
    }

    /// Sets the p95 latency.
    #[must_use]
    pub const fn latency_p95(mut self, ms: f64) -> Self {
        self.latency_p95 = ms;
        self
    }

    /// Sets CPU utilisation.
    #[must_use]
    pub const fn cpu(mut self, pct: f64) -> Self {
        self.cpu_percent = pct;
        self
    }

    /// Sets memory utilisation.
    #[must_use]
    pub const fn memory(mut self, pct: f64) -> Self {
        self.memory_percent = pct;
        self
    }

    /// Sets availability.
    #[must_use]
    pub const fn availability(mut self, pct: f64) -> Self {
        self.availability_percent = Some(pct);
        self
    }

    /// Lists every threshold this sample exceeds.
    ///
    /// An empty list means the server counts as healthy for the round.
    pub fn violations(&self, thresholds: &RollbackThresholds) -> Vec<String> {
        let mut out = Vec::new();
        let limits = [
            ("errorRate", self.error_rate, thresholds.error_rate),
            ("p95LatencyMs", self.latency_p95, thresholds.p95_latency_ms),
            ("cpuPercent", self.cpu_percent, thresholds.cpu_percent),
            ("memoryPercent", self.memory_percent, thresholds.memory_percent),
        ];
        for (name, value, limit) in limits {
            if value > limit {
                out.push(format!("{name} {value} > {limit}"));
            }
        }
        if let (Some(min), Some(actual)) =
            (thresholds.min_availability_percent, self.availability_percent)
        {
            if actual < min {
                out.push(format!("availabilityPercent {actual} < {min}"));
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_within_thresholds() {
        let sample = MetricSample::idle("web-1").cpu(50.0).error_rate(1.0);
        assert!(sample.violations(&RollbackThresholds::default()).is_empty());
    }

    #[test]
    fn test_sample_exceeds_cpu() {
        let sample = MetricSample::idle("web-1").cpu(96.0);
        let violations = sample.violations(&RollbackThresholds::default());
        assert_eq!(violations.len(), 1);
        assert!(violations[0].starts_with("cpuPercent"));
    }

    #[test]
    fn test_sample_at_threshold_is_not_a_violation() {
        let sample = MetricSample::idle("web-1").error_rate(5.0);
        assert!(sample.violations(&RollbackThresholds::default()).is_empty());
    }

    #[test]
    fn test_availability_only_checked_when_configured() {
        let sample = MetricSample::idle("web-1").availability(80.0);
        assert!(sample.violations(&RollbackThresholds::default()).is_empty());

        let thresholds = RollbackThresholds {
            min_availability_percent: Some(99.0),
            ..RollbackThresholds::default()
        };
        assert_eq!(sample.violations(&thresholds).len(), 1);
    }

    #[test]
    fn test_record_serializes_camel_case() {
        let record = DeploymentRecord::new("prod", "2.0.0", Strategy::BlueGreen, Utc::now())
            .with_active_slot(Some(Slot::Green))
            .finish(DeploymentStatus::Success, Utc::now());
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["status"], "Success");
        assert_eq!(json["strategy"], "blue-green");
        assert_eq!(json["activeSlot"], "green");
        assert!(json.get("startedAt").is_some());
        assert!(json.get("rollbackOf").is_none());

        let back: DeploymentRecord = serde_json::from_value(json).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn test_rollback_record() {
        let target = Uuid::now_v7();
        let record = DeploymentRecord::new("prod", "1.0.0", Strategy::Rolling, Utc::now())
            .rolling_back(target)
            .finish(DeploymentStatus::RolledBack, Utc::now());
        assert!(record.is_rollback());
        assert_eq!(record.rollback_of, Some(target));
    }

    #[test]
    fn test_decision_display() {
        let decision = RollbackDecision::new(
            RollbackTrigger::ThresholdBreach,
            RollbackScope::Environment,
            "3 of 5 servers unhealthy",
        );
        assert_eq!(
            decision.to_string(),
            "ThresholdBreach (Environment scope): 3 of 5 servers unhealthy"
        );
    }
}
