//! The deployment state machine.
//!
//! One coordinating task drives each run through
//! `Idle -> Planning -> BatchInProgress -> Monitoring -> BatchComplete ->
//! ... -> Completed`, or into `RollingBack -> RolledBack | Failed`. Every
//! step returns an explicit result; the run inspects it and makes the
//! rollback decision itself.
//!
//! Each transition is written to the audit log. Each run ends with one
//! history record and one [`DeploymentEvent`].

use std::sync::Arc;

use chrono::Utc;
use flotilla_audit::{AuditLogger, TracingBackend, TransitionEvent};
use flotilla_core::{
    ConfigError, DeploymentPlan, DeploymentRecord, DeploymentStatus, RollbackDecision,
    RollbackScope, RollbackTrigger, RunState, Server, ServerSpec, Slot, Strategy, Validate,
};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use crate::adapters::Collaborators;
use crate::error::{ErrorKind, OrchestratorError, Result};
use crate::events::{DeploymentEvent, EventBus};
use crate::executor::{first_failure, BatchExecutor, RunContext};
use crate::fleet::Fleet;
use crate::history::{HistoryStore, InMemoryHistory};
use crate::lock::EnvironmentLocks;
use crate::monitor::{MetricsMonitor, MonitorHandle, WatchOutcome, WatchRequest};
use crate::retry::RetryPolicy;
use crate::rollback::RollbackManager;
use crate::strategy::{self, batch_count, canary_split, partition, Phase};

/// Error summary carried by a report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureSummary {
    /// Error kind.
    pub kind: ErrorKind,
    /// Error message.
    pub message: String,
}

/// Result of a deploy run that reached a well-defined terminal state.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentReport {
    /// The history record written for the run.
    pub record: DeploymentRecord,
    /// Terminal state.
    pub final_state: RunState,
    /// Rollback decision, if one was made.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decision: Option<RollbackDecision>,
    /// Failure, if the run did not complete.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureSummary>,
    /// Server state at the end of the run.
    pub servers: Vec<Server>,
    /// Batches planned (canary subset and blue/green slot count as one).
    pub batches_total: usize,
    /// Batches reintegrated.
    pub batches_completed: usize,
}

impl DeploymentReport {
    /// Returns true if the run completed.
    pub fn is_success(&self) -> bool {
        self.record.is_success()
    }

    /// Process exit code for the run.
    pub fn exit_code(&self) -> u8 {
        u8::from(!self.is_success())
    }
}

/// Result of a manual rollback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RollbackOutcome {
    /// The known-good version was restored by this call.
    Restored(DeploymentRecord),
    /// The environment was already restored; nothing was done.
    AlreadyRestored(DeploymentRecord),
}

impl RollbackOutcome {
    /// Returns the record describing the restored state.
    pub const fn record(&self) -> &DeploymentRecord {
        match self {
            Self::Restored(record) | Self::AlreadyRestored(record) => record,
        }
    }
}

/// Point-in-time view of an environment.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvironmentStatus {
    /// Environment name.
    pub environment: String,
    /// Live blue/green slot, for blue-green environments.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_slot: Option<Slot>,
    /// Servers as reported by the load balancer.
    pub servers: Vec<Server>,
    /// The current rollback target.
    pub last_success: Option<DeploymentRecord>,
    /// The most recent run of any status.
    pub latest: Option<DeploymentRecord>,
    /// Who holds the environment lock, if anyone.
    pub lock_holder: Option<String>,
}

/// Drives deployments, rollbacks and status queries.
#[derive(Clone)]
pub struct DeploymentOrchestrator {
    collaborators: Collaborators,
    history: Arc<dyn HistoryStore>,
    audit: Arc<AuditLogger>,
    locks: EnvironmentLocks,
    events: EventBus,
}

impl std::fmt::Debug for DeploymentOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeploymentOrchestrator")
            .field("locks", &self.locks)
            .finish_non_exhaustive()
    }
}

impl DeploymentOrchestrator {
    /// Creates a builder.
    pub fn builder(collaborators: Collaborators) -> DeploymentOrchestratorBuilder {
        DeploymentOrchestratorBuilder::new(collaborators)
    }

    /// Subscribes to terminal run events.
    pub fn subscribe(&self) -> broadcast::Receiver<DeploymentEvent> {
        self.events.subscribe()
    }

    /// Deploys `plan.target_version` to the environment.
    ///
    /// Returns `Ok` whenever the run reached a well-defined terminal state
    /// (`Completed`, `Failed` or `RolledBack`); inspect the report for
    /// which. Returns `Err` for invalid plans, for a held environment lock,
    /// and for failures that need an operator (`RollbackFailure`,
    /// `NoRollbackTarget`) after they have been recorded.
    pub async fn deploy(
        &self,
        plan: DeploymentPlan,
        cancel: CancellationToken,
    ) -> Result<DeploymentReport> {
        plan.validate().map_err(ConfigError::from)?;
        let record = DeploymentRecord::new(
            plan.environment.clone(),
            plan.target_version.clone(),
            plan.strategy,
            Utc::now(),
        );
        let _guard = self.locks.try_acquire(&plan.environment, record.id)?;

        let span = tracing::info_span!(
            "deploy",
            environment = %plan.environment,
            version = %plan.target_version,
            deployment_id = %record.id,
        );
        self.run_deploy(Arc::new(plan), record, cancel)
            .instrument(span)
            .await
    }

    async fn run_deploy(
        &self,
        plan: Arc<DeploymentPlan>,
        record: DeploymentRecord,
        cancel: CancellationToken,
    ) -> Result<DeploymentReport> {
        let mut run = Run::new(&self.collaborators, &self.audit, Arc::clone(&plan), record.id);
        run.transition(
            RunState::Planning,
            format!(
                "{} deployment of {} to {} servers",
                plan.strategy,
                plan.target_version,
                plan.servers.len()
            ),
        );

        let backup = match self.history.last_success(&plan.environment).await {
            Ok(backup) => backup,
            Err(error) => {
                run.transition(RunState::Failed, error.to_string());
                return self.finish_deploy(run, record, Ending::failed(error), None).await;
            }
        };

        let lb = Arc::clone(&self.collaborators.load_balancer);
        let ending = match Fleet::observe(&plan.servers, lb.as_ref()).await {
            Ok(fleet) => {
                run.ctx.fleet = fleet;
                tracing::info!(
                    batch_size = plan.batch_size,
                    max_parallelism = plan.max_parallelism,
                    rollback_target = backup.as_ref().map_or("none", |b| b.version.as_str()),
                    "deployment planned"
                );
                match plan.strategy {
                    Strategy::Rolling => run.rolling(backup.as_ref(), &cancel).await,
                    Strategy::Canary => run.canary(backup.as_ref(), &cancel).await,
                    Strategy::BlueGreen => run.blue_green(backup.as_ref(), &cancel).await,
                }
            }
            Err(error) => {
                run.transition(RunState::Failed, error.to_string());
                Ending::failed(error)
            }
        };

        self.finish_deploy(run, record, ending, backup.as_ref()).await
    }

    async fn finish_deploy(
        &self,
        run: Run,
        record: DeploymentRecord,
        ending: Ending,
        backup: Option<&DeploymentRecord>,
    ) -> Result<DeploymentReport> {
        let environment = run.ctx.plan.environment.clone();
        let deployment_id = record.id;
        let version = record.version.clone();

        let (status, event, decision, error) = match ending {
            Ending::Completed => (
                DeploymentStatus::Success,
                DeploymentEvent::Completed {
                    environment,
                    deployment_id,
                    version,
                },
                None,
                None,
            ),
            Ending::RolledBack { decision, restored } => (
                DeploymentStatus::RolledBack,
                DeploymentEvent::RolledBack {
                    environment,
                    deployment_id,
                    restored_version: restored,
                    decision: decision.clone(),
                },
                Some(decision),
                None,
            ),
            Ending::Failed { error, decision } => {
                let event = if error.kind() == ErrorKind::RollbackFailure {
                    DeploymentEvent::RollbackFailed {
                        environment,
                        deployment_id,
                        reason: error.to_string(),
                    }
                } else {
                    DeploymentEvent::Failed {
                        environment,
                        deployment_id,
                        version,
                        kind: error.kind(),
                        reason: error.to_string(),
                    }
                };
                (DeploymentStatus::Failed, event, decision, Some(error))
            }
        };

        let failure = error.as_ref().map(|e| FailureSummary {
            kind: e.kind(),
            message: e.to_string(),
        });
        let mut record = record
            .with_backup(backup.map(|b| b.id))
            .with_active_slot(run.active_slot);
        if let Some(failure) = &failure {
            record = record.with_error(failure.message.clone());
        }
        let record = record.finish(status, Utc::now());

        self.history.append(&record).await?;
        self.events.publish(event);

        match &failure {
            Some(f) => tracing::warn!(status = %record.status, kind = %f.kind, error = %f.message, "deployment finished"),
            None => tracing::info!(status = %record.status, "deployment finished"),
        }

        if let Some(error) = error.filter(OrchestratorError::requires_intervention) {
            return Err(error);
        }

        Ok(DeploymentReport {
            servers: run.ctx.fleet.snapshot(),
            final_state: run.state,
            batches_total: run.batches_total,
            batches_completed: run.batches_completed,
            record,
            decision,
            failure,
        })
    }

    /// Restores the most recent successful deployment.
    ///
    /// Calling it again before another successful deploy returns
    /// [`RollbackOutcome::AlreadyRestored`] without touching any server.
    pub async fn rollback(&self, plan: DeploymentPlan) -> Result<RollbackOutcome> {
        plan.validate_for_restore().map_err(ConfigError::from)?;
        let environment = plan.environment.clone();

        let run_id = Uuid::now_v7();
        let _guard = self.locks.try_acquire(&environment, run_id)?;

        let Some(target) = self.history.last_success(&environment).await? else {
            tracing::error!(environment = %environment, "rollback requested but no successful deployment is recorded");
            return Err(OrchestratorError::NoRollbackTarget { environment });
        };

        if let Some(latest) = self.history.latest(&environment).await? {
            let restores_target = latest.rollback_of == Some(target.id)
                || latest.backup_reference == Some(target.id);
            if latest.status == DeploymentStatus::RolledBack && restores_target {
                tracing::info!(
                    environment = %environment,
                    version = %target.version,
                    "environment already restored, nothing to do"
                );
                return Ok(RollbackOutcome::AlreadyRestored(latest));
            }
        }

        let span = tracing::info_span!(
            "rollback",
            environment = %environment,
            version = %target.version,
            deployment_id = %run_id,
        );
        self.run_rollback(plan.targeting(target.version.clone()), target, run_id)
            .instrument(span)
            .await
    }

    async fn run_rollback(
        &self,
        plan: DeploymentPlan,
        target: DeploymentRecord,
        run_id: Uuid,
    ) -> Result<RollbackOutcome> {
        let plan = Arc::new(plan);
        let mut record =
            DeploymentRecord::new(plan.environment.clone(), target.version.clone(), target.strategy, Utc::now())
                .rolling_back(target.id)
                .with_backup(Some(target.id));
        record.id = run_id;

        let mut run = Run::new(&self.collaborators, &self.audit, Arc::clone(&plan), run_id);
        run.transition(
            RunState::Planning,
            format!("manual rollback to {} (run {})", target.version, target.id),
        );
        let decision = RollbackDecision::new(
            RollbackTrigger::OperatorCancel,
            RollbackScope::Environment,
            format!("manual rollback to {}", target.version),
        );

        let lb = Arc::clone(&self.collaborators.load_balancer);
        let result = match Fleet::observe(&plan.servers, lb.as_ref()).await {
            Ok(fleet) => {
                run.ctx.fleet = fleet;
                run.transition(RunState::RollingBack, decision.to_string());
                match (target.strategy, target.active_slot) {
                    (Strategy::BlueGreen, Some(slot)) => {
                        let servers = plan.servers_in_slot(slot);
                        run.rollback
                            .restore_slot(&run.ctx, &decision, slot, &servers)
                            .await
                            .map(|()| Some(slot))
                    }
                    _ => run
                        .rollback
                        .restore(&run.ctx, &decision, &plan.servers, &target.version)
                        .await
                        .map(|()| None),
                }
            }
            Err(error) => Err(error),
        };

        match result {
            Ok(slot) => {
                run.transition(
                    RunState::RolledBack,
                    format!("{} restored", target.version),
                );
                let record = record
                    .with_active_slot(slot)
                    .finish(DeploymentStatus::RolledBack, Utc::now());
                self.history.append(&record).await?;
                self.events.publish(DeploymentEvent::RolledBack {
                    environment: plan.environment.clone(),
                    deployment_id: run_id,
                    restored_version: Some(target.version),
                    decision,
                });
                Ok(RollbackOutcome::Restored(record))
            }
            Err(error) => {
                run.transition(RunState::Failed, error.to_string());
                let record = record
                    .with_error(error.to_string())
                    .finish(DeploymentStatus::Failed, Utc::now());
                self.history.append(&record).await?;
                self.events.publish(DeploymentEvent::RollbackFailed {
                    environment: plan.environment.clone(),
                    deployment_id: run_id,
                    reason: error.to_string(),
                });
                Err(error)
            }
        }
    }

    /// Reports the environment's live state and history.
    pub async fn status(&self, plan: &DeploymentPlan) -> Result<EnvironmentStatus> {
        let environment = plan.environment.clone();
        let lb = &self.collaborators.load_balancer;

        let fleet = Fleet::observe(&plan.servers, lb.as_ref()).await?;
        let active_slot = if plan.strategy == Strategy::BlueGreen {
            lb.active_slot().await?
        } else {
            None
        };

        Ok(EnvironmentStatus {
            active_slot,
            servers: fleet.snapshot(),
            last_success: self.history.last_success(&environment).await?,
            latest: self.history.latest(&environment).await?,
            lock_holder: self.locks.holder(&environment),
            environment,
        })
    }

    /// Computes the phases a deploy of `plan` would go through, without
    /// touching any server.
    pub async fn preview(&self, plan: &DeploymentPlan) -> Result<Vec<Phase>> {
        plan.validate().map_err(ConfigError::from)?;
        let active_slot = if plan.strategy == Strategy::BlueGreen {
            self.collaborators.load_balancer.active_slot().await?
        } else {
            None
        };
        Ok(strategy::rollout_phases(plan, active_slot))
    }
}

/// Builder for [`DeploymentOrchestrator`].
pub struct DeploymentOrchestratorBuilder {
    collaborators: Collaborators,
    history: Option<Arc<dyn HistoryStore>>,
    audit: Option<Arc<AuditLogger>>,
    locks: Option<EnvironmentLocks>,
}

impl std::fmt::Debug for DeploymentOrchestratorBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeploymentOrchestratorBuilder")
            .finish_non_exhaustive()
    }
}

impl DeploymentOrchestratorBuilder {
    fn new(collaborators: Collaborators) -> Self {
        Self {
            collaborators,
            history: None,
            audit: None,
            locks: None,
        }
    }

    /// Sets the history store. Defaults to an in-memory store.
    pub fn history(mut self, history: Arc<dyn HistoryStore>) -> Self {
        self.history = Some(history);
        self
    }

    /// Sets the audit logger. Defaults to logging through `tracing`.
    pub fn audit(mut self, audit: Arc<AuditLogger>) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Sets the lock table. Defaults to an in-process table.
    pub fn locks(mut self, locks: EnvironmentLocks) -> Self {
        self.locks = Some(locks);
        self
    }

    /// Builds the orchestrator.
    pub fn build(self) -> DeploymentOrchestrator {
        DeploymentOrchestrator {
            collaborators: self.collaborators,
            history: self
                .history
                .unwrap_or_else(|| Arc::new(InMemoryHistory::new())),
            audit: self.audit.unwrap_or_else(|| {
                Arc::new(
                    AuditLogger::builder()
                        .with_backend(Arc::new(TracingBackend::new()))
                        .build(),
                )
            }),
            locks: self.locks.unwrap_or_default(),
            events: EventBus::new(),
        }
    }
}

/// How a run ended.
enum Ending {
    Completed,
    RolledBack {
        decision: RollbackDecision,
        restored: Option<String>,
    },
    Failed {
        error: OrchestratorError,
        decision: Option<RollbackDecision>,
    },
}

impl Ending {
    const fn failed(error: OrchestratorError) -> Self {
        Self::Failed {
            error,
            decision: None,
        }
    }
}

/// Something that stops a rollout before it completes.
enum Interrupt {
    Breach(RollbackDecision),
    Cancelled,
}

impl Interrupt {
    fn into_decision(self) -> RollbackDecision {
        match self {
            Self::Breach(decision) => decision.with_scope(RollbackScope::Environment),
            Self::Cancelled => RollbackDecision::new(
                RollbackTrigger::OperatorCancel,
                RollbackScope::Environment,
                "cancelled by operator",
            ),
        }
    }
}

enum Halt {
    /// Breach or cancel: restore everything the run touched.
    Interrupted(Interrupt),
    /// A batch (or the canary subset) failed: restore only its servers.
    BatchFailed {
        servers: Vec<ServerSpec>,
        error: OrchestratorError,
        decision: RollbackDecision,
    },
}

/// Background metrics watches started after each reintegrated batch.
struct Watchers {
    monitor: MetricsMonitor,
    stop: CancellationToken,
    handles: Vec<MonitorHandle>,
    alerts_tx: mpsc::UnboundedSender<(String, RollbackDecision)>,
    alerts_rx: mpsc::UnboundedReceiver<(String, RollbackDecision)>,
}

impl Watchers {
    fn new(monitor: MetricsMonitor, cancel: &CancellationToken) -> Self {
        let (alerts_tx, alerts_rx) = mpsc::unbounded_channel();
        Self {
            monitor,
            stop: cancel.child_token(),
            handles: Vec::new(),
            alerts_tx,
            alerts_rx,
        }
    }

    fn spawn(&mut self, request: WatchRequest) {
        tracing::debug!(label = %request.label, servers = request.servers.len(), "starting background metrics watch");
        let handle = self
            .monitor
            .spawn(request, self.alerts_tx.clone(), self.stop.clone());
        self.handles.push(handle);
    }

    fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Non-blocking check for a breach alert or an operator cancel.
    fn checkpoint(&mut self, cancel: &CancellationToken) -> Option<Interrupt> {
        if let Ok((label, decision)) = self.alerts_rx.try_recv() {
            tracing::warn!(label = %label, reason = %decision.reason, "background metrics watch breached");
            return Some(Interrupt::Breach(decision));
        }
        cancel.is_cancelled().then_some(Interrupt::Cancelled)
    }

    /// Waits for every running watch to finish.
    async fn settle(&mut self, cancel: &CancellationToken) -> Option<Interrupt> {
        if let Some(interrupt) = self.checkpoint(cancel) {
            return Some(interrupt);
        }

        let handles = std::mem::take(&mut self.handles);
        let all = futures::future::join_all(handles.into_iter().map(MonitorHandle::join));
        let interrupt = tokio::select! {
            biased;
            Some((label, decision)) = self.alerts_rx.recv() => {
                tracing::warn!(label = %label, reason = %decision.reason, "background metrics watch breached");
                Some(Interrupt::Breach(decision))
            }
            () = cancel.cancelled() => Some(Interrupt::Cancelled),
            outcomes = all => outcomes.into_iter().find_map(|outcome| match outcome {
                WatchOutcome::Breach(decision) => Some(Interrupt::Breach(decision)),
                WatchOutcome::Clean { .. } | WatchOutcome::Cancelled => None,
            }),
        };
        interrupt.or_else(|| cancel.is_cancelled().then_some(Interrupt::Cancelled))
    }

    fn shutdown(&mut self) {
        self.stop.cancel();
        self.handles.clear();
    }
}

impl Drop for Watchers {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

/// State of one deploy or rollback run.
struct Run {
    ctx: RunContext,
    state: RunState,
    collaborators: Collaborators,
    executor: BatchExecutor,
    rollback: RollbackManager,
    monitor: MetricsMonitor,
    touched: Vec<ServerSpec>,
    batches_total: usize,
    batches_completed: usize,
    active_slot: Option<Slot>,
}

impl Run {
    fn new(
        collaborators: &Collaborators,
        audit: &Arc<AuditLogger>,
        plan: Arc<DeploymentPlan>,
        deployment_id: Uuid,
    ) -> Self {
        let executor = BatchExecutor::new(collaborators, RetryPolicy::from(&plan.retry));
        let rollback = RollbackManager::new(executor.clone(), Arc::clone(&collaborators.load_balancer));
        let monitor = MetricsMonitor::new(Arc::clone(&collaborators.metrics), plan.monitor_interval());
        Self {
            ctx: RunContext {
                plan,
                deployment_id,
                fleet: Fleet::default(),
                audit: Arc::clone(audit),
            },
            state: RunState::Idle,
            collaborators: collaborators.clone(),
            executor,
            rollback,
            monitor,
            touched: Vec::new(),
            batches_total: 0,
            batches_completed: 0,
            active_slot: None,
        }
    }

    fn transition(&mut self, next: RunState, reason: impl Into<String>) {
        let reason = reason.into();
        if !self.state.can_transition_to(next) {
            tracing::error!(from = %self.state, to = %next, "unexpected state transition");
        }
        self.ctx.record(&TransitionEvent::new(
            self.ctx.environment(),
            self.ctx.deployment_id,
            self.state,
            next,
            reason.clone(),
        ));
        tracing::info!(from = %self.state, to = %next, reason = %reason, "state transition");
        self.state = next;
    }

    fn touch(&mut self, servers: &[ServerSpec]) {
        for server in servers {
            if !self.touched.iter().any(|t| t.id == server.id) {
                self.touched.push(server.clone());
            }
        }
    }

    async fn rolling(&mut self, backup: Option<&DeploymentRecord>, cancel: &CancellationToken) -> Ending {
        let plan = Arc::clone(&self.ctx.plan);
        self.batches_total = batch_count(plan.servers.len(), plan.batch_size);
        let mut watchers = Watchers::new(self.monitor.clone(), cancel);

        match self.roll_out(&plan.servers, &mut watchers, cancel).await {
            Ok(()) => self.conclude(&mut watchers, backup, cancel).await,
            Err(halt) => self.halt(halt, &mut watchers, backup).await,
        }
    }

    async fn canary(&mut self, backup: Option<&DeploymentRecord>, cancel: &CancellationToken) -> Ending {
        let plan = Arc::clone(&self.ctx.plan);
        let (canary, rest) = canary_split(&plan.servers, plan.canary_percent.unwrap_or(0.0));
        self.batches_total = 1 + batch_count(rest.len(), plan.batch_size);
        let mut watchers = Watchers::new(self.monitor.clone(), cancel);

        if let Some(interrupt) = watchers.checkpoint(cancel) {
            return self.halt(Halt::Interrupted(interrupt), &mut watchers, backup).await;
        }
        let ids: Vec<&str> = canary.iter().map(|s| s.id.as_str()).collect();
        self.transition(
            RunState::BatchInProgress,
            format!("canary of {} servers: {}", canary.len(), ids.join(", ")),
        );
        if let Err(halt) = self
            .process_batch(&canary, RollbackScope::Canary, &mut watchers, cancel)
            .await
        {
            return self.halt(halt, &mut watchers, backup).await;
        }

        self.transition(
            RunState::Monitoring,
            format!("canary metrics watch for {}s", plan.monitor_window_seconds),
        );
        let outcome = self
            .monitor
            .watch(
                &canary,
                plan.monitor_window(),
                &plan.rollback_thresholds,
                RollbackScope::Canary,
                cancel.clone(),
            )
            .await;
        match outcome {
            WatchOutcome::Clean { rounds } => {
                self.batches_completed += 1;
                self.transition(
                    RunState::BatchComplete,
                    format!("canary clean after {rounds} sample rounds"),
                );
            }
            WatchOutcome::Breach(decision) => {
                let halt = Halt::BatchFailed {
                    servers: canary,
                    error: OrchestratorError::ThresholdBreach(decision.clone()),
                    decision,
                };
                return self.halt(halt, &mut watchers, backup).await;
            }
            WatchOutcome::Cancelled => {
                return self
                    .halt(Halt::Interrupted(Interrupt::Cancelled), &mut watchers, backup)
                    .await;
            }
        }

        match self.roll_out(&rest, &mut watchers, cancel).await {
            Ok(()) => self.conclude(&mut watchers, backup, cancel).await,
            Err(halt) => self.halt(halt, &mut watchers, backup).await,
        }
    }

    async fn blue_green(&mut self, backup: Option<&DeploymentRecord>, cancel: &CancellationToken) -> Ending {
        let plan = Arc::clone(&self.ctx.plan);
        let lb = Arc::clone(&self.collaborators.load_balancer);
        let restored = backup.map(|b| b.version.clone());

        let previous = match lb.active_slot().await {
            Ok(slot) => slot.unwrap_or(Slot::Blue),
            Err(error) => {
                self.transition(RunState::Failed, error.to_string());
                return Ending::failed(error);
            }
        };
        let target = previous.opposite();
        let standby = plan.servers_in_slot(target);
        let live = plan.servers_in_slot(previous);
        self.active_slot = Some(previous);
        self.batches_total = 1;

        if cancel.is_cancelled() {
            return self.cancel_before_switch(restored);
        }
        self.transition(
            RunState::BatchInProgress,
            format!(
                "deploying {} to {target} slot ({} servers)",
                plan.target_version,
                standby.len()
            ),
        );
        let results = self
            .executor
            .deploy_and_verify(&self.ctx, &standby, &plan.target_version)
            .await;
        if let Some(error) = first_failure(results) {
            self.transition(
                RunState::Failed,
                format!("{target} slot not ready, {previous} keeps serving: {error}"),
            );
            return Ending::failed(error);
        }
        if cancel.is_cancelled() {
            return self.cancel_before_switch(restored);
        }

        self.transition(
            RunState::Monitoring,
            format!("running acceptance tests against {target}"),
        );
        let tests = self
            .collaborators
            .tests
            .run(&plan.environment, target, &standby)
            .await;
        match tests {
            Ok(report) if report.passed => {
                tracing::info!(slot = %target, summary = %report.summary, "acceptance tests passed");
            }
            Ok(report) => {
                let error = OrchestratorError::TestSuiteFailed {
                    slot: target.to_string(),
                    summary: report.summary,
                };
                self.transition(RunState::Failed, error.to_string());
                return Ending::failed(error);
            }
            Err(error) => {
                self.transition(RunState::Failed, error.to_string());
                return Ending::failed(error);
            }
        }
        if cancel.is_cancelled() {
            return self.cancel_before_switch(restored);
        }

        if let Err(error) = lb.switch_slot(target).await {
            self.transition(RunState::Failed, error.to_string());
            return Ending::failed(error);
        }
        if let Err(error) = self.point_fleet_at(&standby, &live) {
            self.transition(RunState::Failed, error.to_string());
            return Ending::failed(error);
        }
        self.active_slot = Some(target);
        self.batches_completed = 1;
        self.transition(
            RunState::BatchComplete,
            format!("traffic switched from {previous} to {target}"),
        );

        if plan.post_deploy_monitor {
            self.transition(
                RunState::Monitoring,
                format!("post-switch metrics watch for {}s", plan.monitor_window_seconds),
            );
            let outcome = self
                .monitor
                .watch(
                    &standby,
                    plan.monitor_window(),
                    &plan.rollback_thresholds,
                    RollbackScope::Environment,
                    cancel.clone(),
                )
                .await;
            let decision = match outcome {
                WatchOutcome::Clean { .. } => None,
                WatchOutcome::Breach(decision) => Some(decision),
                WatchOutcome::Cancelled => Some(Interrupt::Cancelled.into_decision()),
            };
            if let Some(decision) = decision {
                self.transition(RunState::RollingBack, decision.to_string());
                return match self
                    .rollback
                    .restore_slot(&self.ctx, &decision, previous, &live)
                    .await
                {
                    Ok(()) => {
                        self.active_slot = Some(previous);
                        self.transition(RunState::RolledBack, format!("traffic back on {previous}"));
                        Ending::RolledBack { decision, restored }
                    }
                    Err(error) => {
                        self.transition(RunState::Failed, error.to_string());
                        Ending::Failed {
                            error,
                            decision: Some(decision),
                        }
                    }
                };
            }
            self.transition(RunState::BatchComplete, "post-switch watch clean");
        }

        self.transition(
            RunState::Completed,
            format!("{} live on {target}", plan.target_version),
        );
        Ending::Completed
    }

    fn cancel_before_switch(&mut self, restored: Option<String>) -> Ending {
        let decision = Interrupt::Cancelled.into_decision();
        self.transition(RunState::RollingBack, decision.to_string());
        self.transition(RunState::RolledBack, "traffic never left the live slot");
        Ending::RolledBack { decision, restored }
    }

    fn point_fleet_at(&self, standby: &[ServerSpec], live: &[ServerSpec]) -> Result<()> {
        for server in standby {
            self.ctx.fleet.set_traffic(&server.id, flotilla_core::TrafficState::Active)?;
        }
        for server in live {
            self.ctx.fleet.set_traffic(&server.id, flotilla_core::TrafficState::Offline)?;
        }
        Ok(())
    }

    /// Processes `servers` in batches, starting a background watch after each one.
    async fn roll_out(
        &mut self,
        servers: &[ServerSpec],
        watchers: &mut Watchers,
        cancel: &CancellationToken,
    ) -> std::result::Result<(), Halt> {
        let plan = Arc::clone(&self.ctx.plan);
        let batches = partition(servers, plan.batch_size);
        let count = batches.len();

        for batch in batches {
            if let Some(interrupt) = watchers.checkpoint(cancel) {
                return Err(Halt::Interrupted(interrupt));
            }
            self.transition(
                RunState::BatchInProgress,
                format!("batch {}/{count}: {}", batch.number, batch.ids().join(", ")),
            );
            self.process_batch(&batch.servers, RollbackScope::Batch, watchers, cancel)
                .await?;
            self.batches_completed += 1;
            self.transition(
                RunState::BatchComplete,
                format!("batch {}/{count} healthy and reintegrated", batch.number),
            );

            if plan.post_deploy_monitor {
                watchers.spawn(WatchRequest {
                    label: format!("batch {}", batch.number),
                    servers: batch.servers.clone(),
                    window: plan.monitor_window(),
                    thresholds: plan.rollback_thresholds.clone(),
                    scope: RollbackScope::Environment,
                });
            }
        }
        Ok(())
    }

    /// Drain, deploy, health-check and reintegrate one batch.
    async fn process_batch(
        &mut self,
        servers: &[ServerSpec],
        scope: RollbackScope,
        watchers: &mut Watchers,
        cancel: &CancellationToken,
    ) -> std::result::Result<(), Halt> {
        let plan = Arc::clone(&self.ctx.plan);
        let batch_failed = |error: OrchestratorError| Halt::BatchFailed {
            servers: servers.to_vec(),
            decision: RollbackDecision::new(RollbackTrigger::HealthCheckFailure, scope, error.to_string()),
            error,
        };

        self.touch(servers);
        self.executor
            .drain(&self.ctx, servers)
            .await
            .map_err(batch_failed)?;
        tokio::select! {
            () = tokio::time::sleep(plan.drain_duration()) => {}
            () = cancel.cancelled() => return Err(Halt::Interrupted(Interrupt::Cancelled)),
        }
        self.executor
            .mark_offline(&self.ctx, servers)
            .map_err(batch_failed)?;
        if let Some(interrupt) = watchers.checkpoint(cancel) {
            return Err(Halt::Interrupted(interrupt));
        }

        let results = self
            .executor
            .deploy_and_verify(&self.ctx, servers, &plan.target_version)
            .await;
        if let Some(error) = first_failure(results) {
            return Err(batch_failed(error));
        }
        if let Some(interrupt) = watchers.checkpoint(cancel) {
            return Err(Halt::Interrupted(interrupt));
        }

        self.executor
            .reintegrate(&self.ctx, servers)
            .await
            .map_err(batch_failed)
    }

    /// Waits for outstanding background watches, then completes.
    async fn conclude(
        &mut self,
        watchers: &mut Watchers,
        backup: Option<&DeploymentRecord>,
        cancel: &CancellationToken,
    ) -> Ending {
        if watchers.is_empty() {
            if let Some(interrupt) = watchers.checkpoint(cancel) {
                return self.halt(Halt::Interrupted(interrupt), watchers, backup).await;
            }
        } else {
            self.transition(
                RunState::Monitoring,
                format!("waiting for {} post-deploy metrics watches", watchers.handles.len()),
            );
            if let Some(interrupt) = watchers.settle(cancel).await {
                return self.halt(Halt::Interrupted(interrupt), watchers, backup).await;
            }
            self.transition(RunState::BatchComplete, "post-deploy metrics watches clean");
        }

        let plan = Arc::clone(&self.ctx.plan);
        self.transition(
            RunState::Completed,
            format!("{} live on {} servers", plan.target_version, plan.servers.len()),
        );
        Ending::Completed
    }

    async fn halt(
        &mut self,
        halt: Halt,
        watchers: &mut Watchers,
        backup: Option<&DeploymentRecord>,
    ) -> Ending {
        watchers.shutdown();

        match halt {
            Halt::Interrupted(interrupt) => {
                let decision = interrupt.into_decision();
                self.transition(RunState::RollingBack, decision.to_string());
                if self.touched.is_empty() {
                    self.transition(RunState::RolledBack, "no server had been modified");
                    return Ending::RolledBack {
                        decision,
                        restored: backup.map(|b| b.version.clone()),
                    };
                }
                let Some(target) = backup else {
                    return self.no_rollback_target(decision);
                };

                let servers = self.touched.clone();
                match self
                    .rollback
                    .restore(&self.ctx, &decision, &servers, &target.version)
                    .await
                {
                    Ok(()) => {
                        self.transition(
                            RunState::RolledBack,
                            format!("{} restored on {} servers", target.version, servers.len()),
                        );
                        Ending::RolledBack {
                            decision,
                            restored: Some(target.version.clone()),
                        }
                    }
                    Err(error) => {
                        self.transition(RunState::Failed, error.to_string());
                        Ending::Failed {
                            error,
                            decision: Some(decision),
                        }
                    }
                }
            }
            Halt::BatchFailed {
                servers,
                error,
                decision,
            } => {
                if decision.triggered_by == RollbackTrigger::ThresholdBreach {
                    tracing::warn!(reason = %decision.reason, "threshold breach");
                }
                self.transition(RunState::RollingBack, decision.to_string());
                let Some(target) = backup else {
                    return self.no_rollback_target(decision);
                };

                match self
                    .rollback
                    .restore(&self.ctx, &decision, &servers, &target.version)
                    .await
                {
                    Ok(()) => {
                        self.transition(RunState::Failed, error.to_string());
                        Ending::Failed {
                            error,
                            decision: Some(decision),
                        }
                    }
                    Err(rollback_error) => {
                        self.transition(RunState::Failed, rollback_error.to_string());
                        Ending::Failed {
                            error: rollback_error,
                            decision: Some(decision),
                        }
                    }
                }
            }
        }
    }

    fn no_rollback_target(&mut self, decision: RollbackDecision) -> Ending {
        let error = OrchestratorError::NoRollbackTarget {
            environment: self.ctx.environment().to_string(),
        };
        tracing::error!(reason = %decision.reason, "rollback needed but no successful deployment is recorded");
        self.transition(RunState::Failed, error.to_string());
        Ending::Failed {
            error,
            decision: Some(decision),
        }
    }
}
