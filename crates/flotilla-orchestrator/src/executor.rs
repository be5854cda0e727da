//! Per-batch server work: drain, deploy, health check, reintegrate.
//!
//! Each step fans out over the batch with at most
//! `min(batchSize, maxParallelism)` servers in flight and returns only
//! once every server has finished, which is the barrier between batches.

use std::sync::Arc;

use flotilla_audit::{AuditEvent, AuditLogger, EventOutcome, ServerAction, ServerEvent};
use flotilla_core::{DeployState, DeploymentPlan, ServerId, ServerSpec, TrafficState};
use futures::stream::{self, StreamExt};
use uuid::Uuid;

use crate::adapters::{Collaborators, Deployer, LoadBalancerAdapter};
use crate::error::{OrchestratorError, Result};
use crate::fleet::Fleet;
use crate::health::{HealthChecker, HealthOutcome};
use crate::retry::{RetryPolicy, RetryingDeployer};

/// Everything a step needs to know about the run it belongs to.
#[derive(Debug, Clone)]
pub struct RunContext {
    /// The plan, immutable for the whole run.
    pub plan: Arc<DeploymentPlan>,
    /// Run identifier.
    pub deployment_id: Uuid,
    /// Server state for the run.
    pub fleet: Fleet,
    /// Audit sink.
    pub audit: Arc<AuditLogger>,
}

impl RunContext {
    /// Returns the environment name.
    pub fn environment(&self) -> &str {
        &self.plan.environment
    }

    /// Writes an audit event. Sink failures are logged, never fatal.
    pub fn record<E: AuditEvent>(&self, event: &E) {
        if let Err(e) = self.audit.log(event) {
            tracing::warn!(
                environment = %self.plan.environment,
                deployment_id = %self.deployment_id,
                event_type = event.event_type(),
                error = %e,
                "failed to write audit event"
            );
        }
    }

    fn server_event(&self, server_id: &str, action: ServerAction, outcome: EventOutcome) -> ServerEvent {
        ServerEvent::new(self.environment(), self.deployment_id, server_id, action, outcome)
    }
}

/// Result of deploying and verifying one server.
#[derive(Debug)]
pub struct ServerResult {
    /// Server identifier.
    pub server_id: ServerId,
    /// `Ok` when the server is deployed and healthy.
    pub result: Result<()>,
}

/// Runs the per-server steps of a batch.
#[derive(Clone)]
pub struct BatchExecutor {
    load_balancer: Arc<dyn LoadBalancerAdapter>,
    deployer: RetryingDeployer,
    health: HealthChecker,
}

impl std::fmt::Debug for BatchExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchExecutor")
            .field("deployer", &self.deployer)
            .finish_non_exhaustive()
    }
}

impl BatchExecutor {
    /// Creates an executor over the given collaborators.
    pub fn new(collaborators: &Collaborators, retry: RetryPolicy) -> Self {
        Self {
            load_balancer: Arc::clone(&collaborators.load_balancer),
            deployer: RetryingDeployer::new(Arc::clone(&collaborators.deployer), retry),
            health: HealthChecker::new(Arc::clone(&collaborators.probe)),
        }
    }

    /// Returns the health checker.
    pub const fn health(&self) -> &HealthChecker {
        &self.health
    }

    /// Takes every active server of the batch out of rotation.
    ///
    /// Servers that carry no traffic are left alone. Returns how many
    /// servers were drained. The caller waits `drainSeconds` and then calls
    /// [`mark_offline`](Self::mark_offline).
    pub async fn drain(&self, ctx: &RunContext, servers: &[ServerSpec]) -> Result<usize> {
        let limit = ctx.plan.worker_limit();
        let results: Vec<Result<bool>> = stream::iter(servers)
            .map(|server| async move {
                let traffic = ctx.fleet.get(&server.id).map(|s| s.traffic_state);
                if traffic != Some(TrafficState::Active) {
                    return Ok(false);
                }
                if let Err(e) = self.load_balancer.set_availability(&server.id, false).await {
                    ctx.record(
                        &ctx.server_event(&server.id, ServerAction::Drained, EventOutcome::Failure)
                            .with_details(e.to_string()),
                    );
                    return Err(e);
                }
                ctx.fleet.set_traffic(&server.id, TrafficState::Draining)?;
                ctx.record(&ctx.server_event(&server.id, ServerAction::Drained, EventOutcome::Success));
                tracing::debug!(server_id = %server.id, "server draining");
                Ok(true)
            })
            .buffer_unordered(limit)
            .boxed()
            .collect()
            .await;

        results
            .into_iter()
            .try_fold(0, |drained, r| r.map(|d| drained + usize::from(d)))
    }

    /// Marks drained servers as offline once the drain period is over.
    pub fn mark_offline(&self, ctx: &RunContext, servers: &[ServerSpec]) -> Result<()> {
        for server in servers {
            let draining = ctx
                .fleet
                .get(&server.id)
                .is_some_and(|s| s.traffic_state == TrafficState::Draining);
            if draining {
                ctx.fleet.set_traffic(&server.id, TrafficState::Offline)?;
            }
        }
        Ok(())
    }

    /// Deploys `version` to every server in parallel and health-checks each one.
    ///
    /// Returns one result per server. Every server is attempted even when
    /// another one in the batch fails.
    pub async fn deploy_and_verify(
        &self,
        ctx: &RunContext,
        servers: &[ServerSpec],
        version: &str,
    ) -> Vec<ServerResult> {
        let limit = ctx.plan.worker_limit();
        stream::iter(servers)
            .map(|server| async move {
                ServerResult {
                    server_id: server.id.clone(),
                    result: self.deploy_one(ctx, server, version).await,
                }
            })
            .buffer_unordered(limit)
            .boxed()
            .collect()
            .await
    }

    async fn deploy_one(&self, ctx: &RunContext, server: &ServerSpec, version: &str) -> Result<()> {
        ctx.fleet.set_deploy(&server.id, DeployState::Deploying)?;

        let failure = match self.deployer.deploy(server, version).await {
            Ok(outcome) if outcome.success => None,
            Ok(outcome) => Some(OrchestratorError::DeploymentFailure {
                server_id: server.id.clone(),
                reason: outcome
                    .error_detail
                    .unwrap_or_else(|| "deployer reported failure".to_string()),
            }),
            Err(e) => Some(e),
        };
        if let Some(err) = failure {
            ctx.fleet.set_deploy(&server.id, DeployState::Failed)?;
            ctx.record(
                &ctx.server_event(&server.id, ServerAction::Deployed, EventOutcome::Failure)
                    .with_version(version)
                    .with_details(err.to_string()),
            );
            tracing::warn!(server_id = %server.id, version = %version, error = %err, "deploy failed");
            return Err(err);
        }

        ctx.fleet.set_version(&server.id, version)?;
        ctx.record(
            &ctx.server_event(&server.id, ServerAction::Deployed, EventOutcome::Success)
                .with_version(version),
        );

        ctx.fleet.set_deploy(&server.id, DeployState::HealthChecking)?;
        match self.health.check_server(server, &ctx.plan.health_check).await {
            HealthOutcome::Healthy { attempts } => {
                ctx.fleet.set_deploy(&server.id, DeployState::Healthy)?;
                ctx.record(
                    &ctx.server_event(&server.id, ServerAction::HealthChecked, EventOutcome::Success)
                        .with_version(version)
                        .with_details(format!("healthy after {attempts} probes")),
                );
                tracing::info!(server_id = %server.id, version = %version, attempts, "server healthy");
                Ok(())
            }
            HealthOutcome::Unhealthy { attempts, reason } => {
                ctx.fleet.set_deploy(&server.id, DeployState::Failed)?;
                ctx.record(
                    &ctx.server_event(&server.id, ServerAction::HealthChecked, EventOutcome::Failure)
                        .with_version(version)
                        .with_details(reason.clone()),
                );
                Err(OrchestratorError::HealthCheckTimeout {
                    server_id: server.id.clone(),
                    attempts,
                    reason,
                })
            }
        }
    }

    /// Returns healthy servers to rotation.
    ///
    /// The fleet refuses to activate a server that is not `Healthy`, so the
    /// load balancer is only asked after that check passes.
    pub async fn reintegrate(&self, ctx: &RunContext, servers: &[ServerSpec]) -> Result<()> {
        let limit = ctx.plan.worker_limit();
        let results: Vec<Result<()>> = stream::iter(servers)
            .map(|server| async move {
                let previous = ctx
                    .fleet
                    .get(&server.id)
                    .map_or(TrafficState::Offline, |s| s.traffic_state);
                ctx.fleet.set_traffic(&server.id, TrafficState::Active)?;

                if let Err(e) = self.load_balancer.set_availability(&server.id, true).await {
                    ctx.fleet.set_traffic(&server.id, previous)?;
                    ctx.record(
                        &ctx.server_event(&server.id, ServerAction::Reintegrated, EventOutcome::Failure)
                            .with_details(e.to_string()),
                    );
                    return Err(e);
                }
                ctx.record(&ctx.server_event(&server.id, ServerAction::Reintegrated, EventOutcome::Success));
                tracing::debug!(server_id = %server.id, "server reintegrated");
                Ok(())
            })
            .buffer_unordered(limit)
            .boxed()
            .collect()
            .await;

        results.into_iter().collect()
    }
}

/// Returns the first error of a batch, if any.
pub fn first_failure(results: Vec<ServerResult>) -> Option<OrchestratorError> {
    results.into_iter().find_map(|r| r.result.err())
}
