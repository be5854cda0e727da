//! A scriptable in-memory fleet for tests and dry runs.
//!
//! [`SimulatedFleet`] implements every collaborator trait over one shared
//! state, so a test can script failures per server and version, then
//! inspect what the orchestrator did. It also records invariant
//! violations as they happen: a deploy that starts on a server still in
//! rotation, or a server put back in rotation while failing its health
//! check.
//!
//! ```rust
//! use flotilla_core::ServerSpec;
//! use flotilla_orchestrator::testing::SimulatedFleet;
//!
//! let servers = vec![ServerSpec::new("web-1", "10.0.0.1:8080")];
//! let fleet = SimulatedFleet::new(&servers, "1.0.0");
//! fleet.fail_health("web-1", "2.0.0");
//! assert_eq!(fleet.version_of("web-1").as_deref(), Some("1.0.0"));
//! ```

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use flotilla_core::{HealthCheckPolicy, MetricSample, ServerSpec, Slot, TrafficState};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::adapters::{
    Collaborators, DeployOutcome, Deployer, LoadBalancerAdapter, MetricsSource, TestReport,
    TestSuite,
};
use crate::error::{OrchestratorError, Result};
use crate::health::{Probe, ProbeResult};

/// One call made against the simulated fleet, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FleetCall {
    /// `set_availability`.
    Availability {
        /// Server.
        server_id: String,
        /// Requested availability.
        available: bool,
    },
    /// A deploy started.
    Deploy {
        /// Server.
        server_id: String,
        /// Version pushed.
        version: String,
    },
    /// The blue/green pointer moved.
    Switch(Slot),
}

#[derive(Debug, Clone)]
struct SimServer {
    traffic: TrafficState,
    version: Option<String>,
}

#[derive(Debug, Default)]
struct State {
    servers: BTreeMap<String, SimServer>,
    pointer: Option<Slot>,
    unhealthy: HashSet<(String, String)>,
    failing_deploys: HashSet<(String, String)>,
    unreachable: HashMap<String, u32>,
    degraded_versions: HashMap<String, f64>,
    overloaded: HashMap<(String, String), f64>,
    failing_tests: Option<String>,
    unreachable_pointer: bool,
    cancel_at: Option<(usize, CancellationToken)>,
    calls: Vec<FleetCall>,
    violations: Vec<String>,
    in_flight: usize,
    max_in_flight: usize,
}

impl State {
    fn deploys(&self) -> usize {
        self.calls
            .iter()
            .filter(|c| matches!(c, FleetCall::Deploy { .. }))
            .count()
    }

    fn is_unhealthy(&self, server_id: &str) -> bool {
        self.servers
            .get(server_id)
            .and_then(|s| s.version.clone())
            .is_some_and(|v| self.unhealthy.contains(&(server_id.to_string(), v)))
    }
}

/// In-memory load balancer, deployer, probe, metrics source and test suite.
#[derive(Debug, Clone)]
pub struct SimulatedFleet {
    state: Arc<Mutex<State>>,
    deploy_time: Duration,
}

impl SimulatedFleet {
    /// Creates a fleet where every server runs `version` and is in rotation.
    pub fn new(servers: &[ServerSpec], version: &str) -> Self {
        let servers = servers
            .iter()
            .map(|s| {
                (
                    s.id.clone(),
                    SimServer {
                        traffic: TrafficState::Active,
                        version: Some(version.to_string()),
                    },
                )
            })
            .collect();
        Self {
            state: Arc::new(Mutex::new(State {
                servers,
                ..State::default()
            })),
            deploy_time: Duration::from_millis(200),
        }
    }

    /// Creates a blue/green fleet with traffic on `live`.
    ///
    /// Servers in `live` are in rotation; the others are offline.
    pub fn blue_green(servers: &[ServerSpec], live: Slot, version: &str) -> Self {
        let fleet = Self::new(servers, version);
        {
            let mut state = fleet.state.lock();
            state.pointer = Some(live);
            for spec in servers {
                if spec.slot != Some(live) {
                    if let Some(server) = state.servers.get_mut(&spec.id) {
                        server.traffic = TrafficState::Offline;
                    }
                }
            }
        }
        fleet
    }

    /// Sets how long each deploy takes.
    #[must_use]
    pub const fn with_deploy_time(mut self, deploy_time: Duration) -> Self {
        self.deploy_time = deploy_time;
        self
    }

    /// Returns collaborators backed by this fleet.
    pub fn collaborators(&self) -> Collaborators {
        let fleet = Arc::new(self.clone());
        Collaborators {
            load_balancer: fleet.clone(),
            deployer: fleet.clone(),
            probe: fleet.clone(),
            metrics: fleet.clone(),
            tests: fleet,
        }
    }

    /// `server_id` fails every health probe while it runs `version`.
    pub fn fail_health(&self, server_id: &str, version: &str) {
        self.state
            .lock()
            .unhealthy
            .insert((server_id.to_string(), version.to_string()));
    }

    /// The deployer rejects `version` on `server_id`.
    pub fn fail_deploy(&self, server_id: &str, version: &str) {
        self.state
            .lock()
            .failing_deploys
            .insert((server_id.to_string(), version.to_string()));
    }

    /// The next `times` deploy calls to `server_id` fail with a connectivity error.
    pub fn unreachable_deployer(&self, server_id: &str, times: u32) {
        self.state.lock().unreachable.insert(server_id.to_string(), times);
    }

    /// Servers running `version` report `error_rate` percent errors.
    pub fn degrade_version(&self, version: &str, error_rate: f64) {
        self.state
            .lock()
            .degraded_versions
            .insert(version.to_string(), error_rate);
    }

    /// `server_id` reports `cpu_percent` CPU while it runs `version`.
    pub fn overload_cpu(&self, server_id: &str, version: &str, cpu_percent: f64) {
        self.state
            .lock()
            .overloaded
            .insert((server_id.to_string(), version.to_string()), cpu_percent);
    }

    /// The acceptance suite fails with `summary`.
    pub fn fail_tests(&self, summary: &str) {
        self.state.lock().failing_tests = Some(summary.to_string());
    }

    /// Pointer reads and writes fail with a connectivity error.
    pub fn unreachable_pointer(&self) {
        self.state.lock().unreachable_pointer = true;
    }

    /// Cancels `token` when the `count`-th deploy starts.
    pub fn cancel_on_deploy(&self, count: usize, token: CancellationToken) {
        self.state.lock().cancel_at = Some((count, token));
    }

    /// Returns the version a server runs.
    pub fn version_of(&self, server_id: &str) -> Option<String> {
        self.state
            .lock()
            .servers
            .get(server_id)
            .and_then(|s| s.version.clone())
    }

    /// Returns the load balancer's view of a server.
    pub fn traffic_of(&self, server_id: &str) -> Option<TrafficState> {
        self.state.lock().servers.get(server_id).map(|s| s.traffic)
    }

    /// Returns the blue/green pointer.
    pub fn pointer(&self) -> Option<Slot> {
        self.state.lock().pointer
    }

    /// Returns every call made so far.
    pub fn calls(&self) -> Vec<FleetCall> {
        self.state.lock().calls.clone()
    }

    /// Returns the servers deployed to, in call order.
    pub fn deployed(&self) -> Vec<(String, String)> {
        self.state
            .lock()
            .calls
            .iter()
            .filter_map(|c| match c {
                FleetCall::Deploy { server_id, version } => {
                    Some((server_id.clone(), version.clone()))
                }
                _ => None,
            })
            .collect()
    }

    /// Returns the number of deploys started.
    pub fn deploy_count(&self) -> usize {
        self.state.lock().deploys()
    }

    /// Returns the highest number of deploys that ran at once.
    pub fn max_concurrent_deploys(&self) -> usize {
        self.state.lock().max_in_flight
    }

    /// Returns invariant violations observed so far.
    pub fn violations(&self) -> Vec<String> {
        self.state.lock().violations.clone()
    }
}

#[async_trait]
impl LoadBalancerAdapter for SimulatedFleet {
    async fn set_availability(&self, server_id: &str, available: bool) -> Result<()> {
        let mut state = self.state.lock();
        state.calls.push(FleetCall::Availability {
            server_id: server_id.to_string(),
            available,
        });
        if available && state.is_unhealthy(server_id) {
            state
                .violations
                .push(format!("{server_id} put in rotation while failing health checks"));
        }
        let server = state
            .servers
            .get_mut(server_id)
            .ok_or_else(|| OrchestratorError::LoadBalancer {
                target: server_id.to_string(),
                reason: "unknown server".to_string(),
            })?;
        server.traffic = if available {
            TrafficState::Active
        } else {
            TrafficState::Draining
        };
        Ok(())
    }

    async fn status(&self, server_id: &str) -> Result<TrafficState> {
        Ok(self
            .state
            .lock()
            .servers
            .get(server_id)
            .map_or(TrafficState::Offline, |s| s.traffic))
    }

    async fn active_slot(&self) -> Result<Option<Slot>> {
        let state = self.state.lock();
        if state.unreachable_pointer {
            return Err(OrchestratorError::Connectivity {
                target: "pointer".to_string(),
                reason: "connection refused".to_string(),
            });
        }
        Ok(state.pointer)
    }

    async fn switch_slot(&self, slot: Slot) -> Result<()> {
        let mut state = self.state.lock();
        if state.unreachable_pointer {
            return Err(OrchestratorError::Connectivity {
                target: "pointer".to_string(),
                reason: "connection refused".to_string(),
            });
        }
        state.calls.push(FleetCall::Switch(slot));
        state.pointer = Some(slot);
        Ok(())
    }
}

#[async_trait]
impl Deployer for SimulatedFleet {
    async fn deploy(&self, server: &ServerSpec, version: &str) -> Result<DeployOutcome> {
        {
            let mut state = self.state.lock();
            if let Some(left) = state.unreachable.get_mut(&server.id) {
                if *left > 0 {
                    *left -= 1;
                    return Err(OrchestratorError::Connectivity {
                        target: server.id.clone(),
                        reason: "connection refused".to_string(),
                    });
                }
            }

            state.calls.push(FleetCall::Deploy {
                server_id: server.id.clone(),
                version: version.to_string(),
            });
            let serving = state.pointer.is_none() || server.slot == state.pointer;
            if serving && state.servers.get(&server.id).map(|s| s.traffic) == Some(TrafficState::Active) {
                state
                    .violations
                    .push(format!("{} deployed while in rotation", server.id));
            }
            state.in_flight += 1;
            state.max_in_flight = state.max_in_flight.max(state.in_flight);

            let started = state.deploys();
            if let Some((at, token)) = &state.cancel_at {
                if started >= *at {
                    token.cancel();
                }
            }
        }

        tokio::time::sleep(self.deploy_time).await;

        let mut state = self.state.lock();
        state.in_flight -= 1;
        if state
            .failing_deploys
            .contains(&(server.id.clone(), version.to_string()))
        {
            return Ok(DeployOutcome::failed(format!("package {version} rejected")));
        }
        if let Some(sim) = state.servers.get_mut(&server.id) {
            sim.version = Some(version.to_string());
        }
        Ok(DeployOutcome::success())
    }
}

#[async_trait]
impl Probe for SimulatedFleet {
    async fn probe(&self, server: &ServerSpec, _policy: &HealthCheckPolicy) -> ProbeResult {
        if self.state.lock().is_unhealthy(&server.id) {
            ProbeResult::unhealthy("reported status 'Unhealthy'")
        } else {
            ProbeResult::healthy(Duration::from_millis(5))
        }
    }
}

#[async_trait]
impl MetricsSource for SimulatedFleet {
    async fn sample(&self, server: &ServerSpec) -> Result<MetricSample> {
        let state = self.state.lock();
        let version = state
            .servers
            .get(&server.id)
            .and_then(|s| s.version.clone())
            .unwrap_or_default();
        let error_rate = state.degraded_versions.get(&version).copied().unwrap_or(0.2);
        let cpu = state
            .overloaded
            .get(&(server.id.clone(), version))
            .copied()
            .unwrap_or(35.0);
        Ok(MetricSample::idle(&server.id)
            .error_rate(error_rate)
            .latency_p95(120.0)
            .cpu(cpu)
            .memory(40.0))
    }
}

#[async_trait]
impl TestSuite for SimulatedFleet {
    async fn run(&self, _environment: &str, slot: Slot, servers: &[ServerSpec]) -> Result<TestReport> {
        let failing = self.state.lock().failing_tests.clone();
        Ok(failing.map_or_else(
            || TestReport {
                passed: true,
                summary: format!("{} servers in {slot} passed", servers.len()),
            },
            |summary| TestReport {
                passed: false,
                summary,
            },
        ))
    }
}
