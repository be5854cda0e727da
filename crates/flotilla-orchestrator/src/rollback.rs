//! Restoring the last known-good state.
//!
//! Rollback is a single attempt. If any restored server fails its health
//! check the result is [`OrchestratorError::RollbackFailure`] and nothing
//! further is automated; an operator has to look at the environment.

use std::sync::Arc;

use flotilla_audit::{DecisionEvent, EventOutcome, ServerAction, ServerEvent};
use flotilla_core::{DeployState, RollbackDecision, ServerSpec, Slot, TrafficState};
use futures::future::join_all;

use crate::adapters::LoadBalancerAdapter;
use crate::error::{OrchestratorError, Result};
use crate::executor::{BatchExecutor, RunContext};

/// Restores servers or the blue/green pointer.
#[derive(Clone)]
pub struct RollbackManager {
    executor: BatchExecutor,
    load_balancer: Arc<dyn LoadBalancerAdapter>,
}

impl std::fmt::Debug for RollbackManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RollbackManager").finish_non_exhaustive()
    }
}

impl RollbackManager {
    /// Creates a manager that restores through `executor`.
    pub fn new(executor: BatchExecutor, load_balancer: Arc<dyn LoadBalancerAdapter>) -> Self {
        Self {
            executor,
            load_balancer,
        }
    }

    /// Redeploys `version` onto exactly `servers`.
    ///
    /// Servers are processed in chunks of `batchSize`: drain, wait, deploy,
    /// health-check, reintegrate. The first chunk with an unhealthy server
    /// stops the rollback; servers that did recover are put back in
    /// rotation, the rest stay out. Later chunks are left untouched, still
    /// on whatever they ran before, for the operator to inspect.
    pub async fn restore(
        &self,
        ctx: &RunContext,
        decision: &RollbackDecision,
        servers: &[ServerSpec],
        version: &str,
    ) -> Result<()> {
        let started = DecisionEvent::decided(ctx.environment(), ctx.deployment_id, decision)
            .restoring(version)
            .covering(servers.iter().map(|s| s.id.clone()));
        ctx.record(&started);
        tracing::warn!(
            environment = %ctx.environment(),
            deployment_id = %ctx.deployment_id,
            scope = %decision.scope,
            servers = servers.len(),
            version = %version,
            reason = %decision.reason,
            "rolling back"
        );

        match self.restore_servers(ctx, servers, version).await {
            Ok(()) => {
                ctx.record(&started.finished(EventOutcome::Success));
                tracing::info!(environment = %ctx.environment(), version = %version, "rollback complete");
                Ok(())
            }
            Err(e) => {
                ctx.record(&started.finished(EventOutcome::Failure));
                tracing::error!(environment = %ctx.environment(), error = %e, "rollback failed, manual intervention required");
                Err(e)
            }
        }
    }

    async fn restore_servers(&self, ctx: &RunContext, servers: &[ServerSpec], version: &str) -> Result<()> {
        let failure = |servers: Vec<String>, reason: String| OrchestratorError::RollbackFailure {
            environment: ctx.environment().to_string(),
            servers,
            reason,
        };
        let ids = |chunk: &[ServerSpec]| chunk.iter().map(|s| s.id.clone()).collect::<Vec<_>>();

        for chunk in servers.chunks(ctx.plan.batch_size.max(1)) {
            let drained = self
                .executor
                .drain(ctx, chunk)
                .await
                .map_err(|e| failure(ids(chunk), e.to_string()))?;
            if drained > 0 {
                tokio::time::sleep(ctx.plan.drain_duration()).await;
            }
            self.executor
                .mark_offline(ctx, chunk)
                .map_err(|e| failure(ids(chunk), e.to_string()))?;

            let results = self.executor.deploy_and_verify(ctx, chunk, version).await;
            let (healthy, failed): (Vec<_>, Vec<_>) =
                results.into_iter().partition(|r| r.result.is_ok());

            let recovered: Vec<ServerSpec> = chunk
                .iter()
                .filter(|s| healthy.iter().any(|r| r.server_id == s.id))
                .cloned()
                .collect();
            for server in &recovered {
                ctx.record(
                    &ServerEvent::new(
                        ctx.environment(),
                        ctx.deployment_id,
                        &server.id,
                        ServerAction::Restored,
                        EventOutcome::Success,
                    )
                    .with_version(version),
                );
            }
            self.executor
                .reintegrate(ctx, &recovered)
                .await
                .map_err(|e| failure(ids(&recovered), e.to_string()))?;

            if !failed.is_empty() {
                let reason = failed
                    .iter()
                    .filter_map(|r| r.result.as_ref().err().map(ToString::to_string))
                    .collect::<Vec<_>>()
                    .join("; ");
                return Err(failure(
                    failed.into_iter().map(|r| r.server_id).collect(),
                    reason,
                ));
            }
        }
        Ok(())
    }

    /// Points traffic back at `slot`, whose servers were left untouched.
    ///
    /// Every server in `slot` must pass its health check before the
    /// pointer moves.
    pub async fn restore_slot(
        &self,
        ctx: &RunContext,
        decision: &RollbackDecision,
        slot: Slot,
        servers: &[ServerSpec],
    ) -> Result<()> {
        let started = DecisionEvent::decided(ctx.environment(), ctx.deployment_id, decision)
            .covering(servers.iter().map(|s| s.id.clone()));
        ctx.record(&started);
        tracing::warn!(
            environment = %ctx.environment(),
            slot = %slot,
            reason = %decision.reason,
            "switching traffic back"
        );

        let result = self.switch_back(ctx, slot, servers).await;
        let outcome = if result.is_ok() {
            EventOutcome::Success
        } else {
            EventOutcome::Failure
        };
        ctx.record(&started.finished(outcome));
        result
    }

    async fn switch_back(&self, ctx: &RunContext, slot: Slot, servers: &[ServerSpec]) -> Result<()> {
        let checks = servers.iter().map(|server| async move {
            let outcome = self
                .executor
                .health()
                .check_server(server, &ctx.plan.health_check)
                .await;
            (server.id.clone(), outcome)
        });
        let unhealthy: Vec<String> = join_all(checks)
            .await
            .into_iter()
            .filter(|(_, outcome)| !outcome.is_healthy())
            .map(|(id, _)| id)
            .collect();
        if !unhealthy.is_empty() {
            return Err(OrchestratorError::RollbackFailure {
                environment: ctx.environment().to_string(),
                servers: unhealthy,
                reason: format!("{slot} slot is not healthy"),
            });
        }

        self.load_balancer
            .switch_slot(slot)
            .await
            .map_err(|e| OrchestratorError::RollbackFailure {
                environment: ctx.environment().to_string(),
                servers: Vec::new(),
                reason: format!("cannot switch traffic to {slot}: {e}"),
            })?;

        for server in ctx.fleet.snapshot() {
            if server.slot() == Some(slot) {
                ctx.fleet.set_deploy(server.id(), DeployState::Healthy)?;
                ctx.fleet.set_traffic(server.id(), TrafficState::Active)?;
            } else if server.traffic_state == TrafficState::Active {
                ctx.fleet.set_traffic(server.id(), TrafficState::Offline)?;
            }
        }
        Ok(())
    }
}
