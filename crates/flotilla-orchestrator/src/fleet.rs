//! In-run view of the servers being deployed.
//!
//! The fleet is the single place server state is changed during a run.
//! Concurrent batch workers update it through short critical sections;
//! every transition goes through [`Server::set_traffic`] and
//! [`Server::set_deploy`] so an unhealthy server can never be recorded as
//! active.

use std::collections::BTreeMap;
use std::sync::Arc;

use flotilla_core::{DeployState, Server, ServerId, ServerSpec, TrafficState};
use parking_lot::Mutex;

use crate::adapters::LoadBalancerAdapter;
use crate::error::{OrchestratorError, Result};

/// Shared server state for one run.
#[derive(Debug, Clone, Default)]
pub struct Fleet {
    servers: Arc<Mutex<BTreeMap<ServerId, Server>>>,
}

impl Fleet {
    /// Creates a fleet from already-observed servers.
    pub fn new(servers: impl IntoIterator<Item = Server>) -> Self {
        let map = servers
            .into_iter()
            .map(|s| (s.spec.id.clone(), s))
            .collect();
        Self {
            servers: Arc::new(Mutex::new(map)),
        }
    }

    /// Builds the fleet by asking the load balancer for each server's traffic state.
    pub async fn observe(specs: &[ServerSpec], lb: &dyn LoadBalancerAdapter) -> Result<Self> {
        let mut servers = Vec::with_capacity(specs.len());
        for spec in specs {
            let traffic = lb.status(&spec.id).await?;
            servers.push(Server::observed(spec.clone(), traffic));
        }
        Ok(Self::new(servers))
    }

    /// Returns a copy of one server.
    pub fn get(&self, id: &str) -> Option<Server> {
        self.servers.lock().get(id).cloned()
    }

    /// Returns a copy of every server, ordered by id.
    pub fn snapshot(&self) -> Vec<Server> {
        self.servers.lock().values().cloned().collect()
    }

    /// Changes a server's traffic state.
    pub fn set_traffic(&self, id: &str, state: TrafficState) -> Result<()> {
        self.with_server(id, |server| {
            server
                .set_traffic(state)
                .map_err(|e| OrchestratorError::Internal(e.to_string()))
        })
    }

    /// Changes a server's deploy state.
    pub fn set_deploy(&self, id: &str, state: DeployState) -> Result<()> {
        self.with_server(id, |server| {
            server
                .set_deploy(state)
                .map_err(|e| OrchestratorError::Internal(e.to_string()))
        })
    }

    /// Records the version now installed on a server.
    pub fn set_version(&self, id: &str, version: &str) -> Result<()> {
        self.with_server(id, |server| {
            server.version = Some(version.to_string());
            Ok(())
        })
    }

    /// Returns the ids of servers currently carrying traffic.
    pub fn active_ids(&self) -> Vec<ServerId> {
        self.servers
            .lock()
            .values()
            .filter(|s| s.traffic_state == TrafficState::Active)
            .map(|s| s.spec.id.clone())
            .collect()
    }

    fn with_server<T>(&self, id: &str, f: impl FnOnce(&mut Server) -> Result<T>) -> Result<T> {
        let mut servers = self.servers.lock();
        let server = servers
            .get_mut(id)
            .ok_or_else(|| OrchestratorError::Internal(format!("unknown server '{id}'")))?;
        f(server)
    }
}
