//! Runtime metrics watch.
//!
//! A watch samples every server in scope once per interval for the
//! length of a window. After each round it counts the servers with at
//! least one metric over its threshold (a server that returns no sample
//! counts as unhealthy). When that fraction exceeds
//! `unhealthyServerFraction` the watch stops early with a
//! [`RollbackDecision`].

use std::sync::Arc;
use std::time::Duration;

use flotilla_core::{
    MetricSample, RollbackDecision, RollbackScope, RollbackThresholds, RollbackTrigger, ServerSpec,
};
use futures::future::join_all;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::adapters::MetricsSource;

/// Stand-in for a deadline that does not fit in an [`Instant`].
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// `now + duration`, saturating at roughly thirty years out.
fn deadline_after(duration: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(duration).unwrap_or_else(|| now + FAR_FUTURE)
}

/// How a watch ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchOutcome {
    /// The window elapsed without a breach.
    Clean {
        /// Sample rounds taken.
        rounds: u32,
    },
    /// Too many servers breached their thresholds.
    Breach(RollbackDecision),
    /// The watch was cancelled before the window elapsed.
    Cancelled,
}

/// Evaluation of a single sample round.
#[derive(Debug, Clone, PartialEq)]
pub struct RoundReport {
    /// Servers sampled.
    pub total: usize,
    /// Servers counted as unhealthy, with the reasons.
    pub unhealthy: Vec<(String, String)>,
}

impl RoundReport {
    /// Fraction of unhealthy servers in the round.
    #[allow(clippy::cast_precision_loss)]
    pub fn unhealthy_fraction(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.unhealthy.len() as f64 / self.total as f64
        }
    }
}

/// Evaluates one round of samples against the thresholds.
///
/// `samples` pairs each server id with its sample, or `None` when the
/// sample could not be collected.
pub fn evaluate_round(
    samples: &[(String, Option<MetricSample>)],
    thresholds: &RollbackThresholds,
) -> RoundReport {
    let unhealthy = samples
        .iter()
        .filter_map(|(id, sample)| match sample {
            None => Some((id.clone(), "no metrics sample".to_string())),
            Some(sample) => {
                let violations = sample.violations(thresholds);
                if violations.is_empty() {
                    None
                } else {
                    Some((id.clone(), violations.join(", ")))
                }
            }
        })
        .collect();

    RoundReport {
        total: samples.len(),
        unhealthy,
    }
}

/// Watches a set of servers for threshold breaches.
#[derive(Clone)]
pub struct MetricsMonitor {
    source: Arc<dyn MetricsSource>,
    interval: Duration,
}

impl std::fmt::Debug for MetricsMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsMonitor")
            .field("interval", &self.interval)
            .finish_non_exhaustive()
    }
}

impl MetricsMonitor {
    /// Creates a monitor sampling every `interval`.
    pub fn new(source: Arc<dyn MetricsSource>, interval: Duration) -> Self {
        Self { source, interval }
    }

    /// Returns the sampling interval.
    pub const fn interval(&self) -> Duration {
        self.interval
    }

    /// Runs a watch to completion.
    ///
    /// The first round is taken immediately. A breach found by any round
    /// ends the watch with a decision of the given `scope`.
    pub async fn watch(
        &self,
        servers: &[ServerSpec],
        window: Duration,
        thresholds: &RollbackThresholds,
        scope: RollbackScope,
        cancel: CancellationToken,
    ) -> WatchOutcome {
        let deadline = deadline_after(window);
        let mut rounds = 0u32;

        loop {
            if cancel.is_cancelled() {
                return WatchOutcome::Cancelled;
            }

            let samples = self.sample_round(servers).await;
            rounds += 1;
            let report = evaluate_round(&samples, thresholds);

            if report.unhealthy_fraction() > thresholds.unhealthy_server_fraction {
                let details = report
                    .unhealthy
                    .iter()
                    .map(|(id, why)| format!("{id}: {why}"))
                    .collect::<Vec<_>>()
                    .join("; ");
                let reason = format!(
                    "{} of {} servers over thresholds ({:.0}% > {:.0}%): {details}",
                    report.unhealthy.len(),
                    report.total,
                    report.unhealthy_fraction() * 100.0,
                    thresholds.unhealthy_server_fraction * 100.0,
                );
                tracing::warn!(
                    servers = report.total,
                    unhealthy = report.unhealthy.len(),
                    round = rounds,
                    "metrics threshold breach"
                );
                return WatchOutcome::Breach(RollbackDecision::new(
                    RollbackTrigger::ThresholdBreach,
                    scope,
                    reason,
                ));
            }

            tracing::debug!(
                servers = report.total,
                unhealthy = report.unhealthy.len(),
                round = rounds,
                "metrics round clean"
            );

            let next = deadline_after(self.interval);
            if next >= deadline {
                tokio::select! {
                    () = tokio::time::sleep_until(deadline) => return WatchOutcome::Clean { rounds },
                    () = cancel.cancelled() => return WatchOutcome::Cancelled,
                }
            }
            tokio::select! {
                () = tokio::time::sleep_until(next) => {}
                () = cancel.cancelled() => return WatchOutcome::Cancelled,
            }
        }
    }

    /// Starts a watch on a background task.
    ///
    /// A breach is also sent on `alerts`, tagged with the request label,
    /// so the coordinator can notice it without joining the task.
    pub fn spawn(
        &self,
        request: WatchRequest,
        alerts: mpsc::UnboundedSender<(String, RollbackDecision)>,
        cancel: CancellationToken,
    ) -> MonitorHandle {
        let monitor = self.clone();
        let label = request.label.clone();
        let scope = request.scope;
        let task_cancel = cancel.clone();
        let handle = tokio::spawn(async move {
            let outcome = monitor
                .watch(
                    &request.servers,
                    request.window,
                    &request.thresholds,
                    request.scope,
                    task_cancel,
                )
                .await;
            if let WatchOutcome::Breach(decision) = &outcome {
                // The receiver is gone only when the run already finished.
                let _ = alerts.send((request.label, decision.clone()));
            }
            outcome
        });
        MonitorHandle {
            label,
            scope,
            cancel,
            handle,
        }
    }

    async fn sample_round(&self, servers: &[ServerSpec]) -> Vec<(String, Option<MetricSample>)> {
        let futures = servers.iter().map(|server| async move {
            match self.source.sample(server).await {
                Ok(sample) => (server.id.clone(), Some(sample)),
                Err(e) => {
                    tracing::debug!(server_id = %server.id, error = %e, "metrics sample failed");
                    (server.id.clone(), None)
                }
            }
        });
        join_all(futures).await
    }
}

/// Parameters of a background watch.
#[derive(Debug, Clone)]
pub struct WatchRequest {
    /// Label used in logs and alerts (e.g. `batch 2`).
    pub label: String,
    /// Servers in scope.
    pub servers: Vec<ServerSpec>,
    /// Watch length.
    pub window: Duration,
    /// Metric limits.
    pub thresholds: RollbackThresholds,
    /// Scope of the decision on breach.
    pub scope: RollbackScope,
}

/// A background watch.
#[derive(Debug)]
pub struct MonitorHandle {
    label: String,
    scope: RollbackScope,
    cancel: CancellationToken,
    handle: JoinHandle<WatchOutcome>,
}

impl MonitorHandle {
    /// Returns the label given at spawn time.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Asks the watch to stop early.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Returns true once the task has finished.
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Waits for the watch to finish.
    ///
    /// A watch task that died without an outcome left the window
    /// unverified and is reported as a breach.
    pub async fn join(self) -> WatchOutcome {
        match self.handle.await {
            Ok(outcome) => outcome,
            Err(e) if e.is_cancelled() => WatchOutcome::Cancelled,
            Err(e) => {
                tracing::error!(label = %self.label, error = %e, "metrics watch task failed");
                WatchOutcome::Breach(RollbackDecision::new(
                    RollbackTrigger::ThresholdBreach,
                    self.scope,
                    format!("metrics watch for {} failed: {e}", self.label),
                ))
            }
        }
    }
}
