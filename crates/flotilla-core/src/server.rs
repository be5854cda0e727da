//! Server inventory and per-server deployment state.
//!
//! A [`Server`] pairs the inventory entry (id, address, blue/green slot)
//! with the two state machines the orchestrator drives: traffic state
//! (owned by the load balancer) and deploy state (owned by the run).
//! The transition methods enforce that a server only carries traffic
//! while its deploy state is `Healthy`.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Unique identifier for a server within an environment.
pub type ServerId = String;

/// Traffic state of a server as seen by the load balancer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrafficState {
    /// Receiving live traffic.
    Active,
    /// Removed from rotation, finishing in-flight requests.
    Draining,
    /// Not receiving traffic.
    Offline,
}

impl TrafficState {
    /// Returns a string representation for display.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Draining => "draining",
            Self::Offline => "offline",
        }
    }
}

impl fmt::Display for TrafficState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Deployment progress of a server within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeployState {
    /// Not yet touched by the run.
    Pending,
    /// A package is being pushed.
    Deploying,
    /// Waiting for consecutive successful health probes.
    HealthChecking,
    /// Serving the current version and passing health checks.
    Healthy,
    /// Deploy or health check failed.
    Failed,
}

impl DeployState {
    /// Returns a string representation for display.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Deploying => "deploying",
            Self::HealthChecking => "health_checking",
            Self::Healthy => "healthy",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for DeployState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Blue/green slot a server belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Slot {
    /// The blue copy of the environment.
    Blue,
    /// The green copy of the environment.
    Green,
}

impl Slot {
    /// Returns the other slot.
    #[must_use]
    pub const fn opposite(self) -> Self {
        match self {
            Self::Blue => Self::Green,
            Self::Green => Self::Blue,
        }
    }

    /// Returns a string representation for display.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Blue => "blue",
            Self::Green => "green",
        }
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inventory entry for a server, as written in a plan file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ServerSpec {
    /// Unique server identifier.
    pub id: ServerId,

    /// Network address (`host:port` or a base URL).
    pub address: String,

    /// Blue/green slot, required for blue-green environments.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slot: Option<Slot>,
}

impl ServerSpec {
    /// Creates a new inventory entry.
    pub fn new(id: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
            slot: None,
        }
    }

    /// Places the server in a blue/green slot.
    #[must_use]
    pub const fn in_slot(mut self, slot: Slot) -> Self {
        self.slot = Some(slot);
        self
    }

    /// Returns the base URL for the server's HTTP endpoints.
    pub fn base_url(&self) -> String {
        if self.address.starts_with("http://") || self.address.starts_with("https://") {
            self.address.trim_end_matches('/').to_string()
        } else {
            format!("http://{}", self.address)
        }
    }
}

/// An illegal server state transition.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransitionError {
    /// Attempted to activate a server that has not passed its health checks.
    #[error("server '{server_id}' cannot become active while {deploy_state}")]
    ActivateUnhealthy {
        /// Server identifier.
        server_id: ServerId,
        /// Deploy state at the time of the attempt.
        deploy_state: DeployState,
    },

    /// Attempted to deploy to a server that is still carrying traffic.
    #[error("server '{server_id}' must be drained before it can enter {deploy_state}")]
    NotDrained {
        /// Server identifier.
        server_id: ServerId,
        /// Requested deploy state.
        deploy_state: DeployState,
    },
}

/// A server under the orchestrator's control.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Server {
    /// Inventory entry.
    #[serde(flatten)]
    pub spec: ServerSpec,

    /// Current traffic state.
    pub traffic_state: TrafficState,

    /// Current deploy state.
    pub deploy_state: DeployState,

    /// Version most recently deployed by this process, if known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

impl Server {
    /// Creates a server from its inventory entry and observed traffic state.
    ///
    /// A server observed as active is serving its current version and is
    /// treated as healthy; anything else starts out pending.
    pub fn observed(spec: ServerSpec, traffic_state: TrafficState) -> Self {
        let deploy_state = if traffic_state == TrafficState::Active {
            DeployState::Healthy
        } else {
            DeployState::Pending
        };
        Self {
            spec,
            traffic_state,
            deploy_state,
            version: None,
        }
    }

    /// Returns the server id.
    pub fn id(&self) -> &str {
        &self.spec.id
    }

    /// Returns the server's blue/green slot.
    pub const fn slot(&self) -> Option<Slot> {
        self.spec.slot
    }

    /// Returns true if the server is active and healthy.
    pub fn is_serving(&self) -> bool {
        self.traffic_state == TrafficState::Active && self.deploy_state == DeployState::Healthy
    }

    /// Moves the server to a new traffic state.
    ///
    /// # Errors
    ///
    /// Returns [`TransitionError::ActivateUnhealthy`] when activating a
    /// server whose deploy state is not `Healthy`.
    pub fn set_traffic(&mut self, state: TrafficState) -> Result<(), TransitionError> {
        if state == TrafficState::Active && self.deploy_state != DeployState::Healthy {
            return Err(TransitionError::ActivateUnhealthy {
                server_id: self.spec.id.clone(),
                deploy_state: self.deploy_state,
            });
        }
        self.traffic_state = state;
        Ok(())
    }

    /// Moves the server to a new deploy state.
    ///
    /// # Errors
    ///
    /// Returns [`TransitionError::NotDrained`] when leaving `Healthy`
    /// while the server is still active.
    pub fn set_deploy(&mut self, state: DeployState) -> Result<(), TransitionError> {
        if self.traffic_state == TrafficState::Active && state != DeployState::Healthy {
            return Err(TransitionError::NotDrained {
                server_id: self.spec.id.clone(),
                deploy_state: state,
            });
        }
        self.deploy_state = state;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn active_server() -> Server {
        Server::observed(ServerSpec::new("web-1", "10.0.0.1:8080"), TrafficState::Active)
    }

    #[test]
    fn test_observed_active_is_healthy() {
        let server = active_server();
        assert_eq!(server.deploy_state, DeployState::Healthy);
        assert!(server.is_serving());
    }

    #[test]
    fn test_observed_offline_is_pending() {
        let server = Server::observed(ServerSpec::new("web-1", "h:1"), TrafficState::Offline);
        assert_eq!(server.deploy_state, DeployState::Pending);
        assert!(!server.is_serving());
    }

    #[test]
    fn test_cannot_deploy_while_active() {
        let mut server = active_server();
        let err = server.set_deploy(DeployState::Deploying).unwrap_err();
        assert!(matches!(err, TransitionError::NotDrained { .. }));
        assert_eq!(server.deploy_state, DeployState::Healthy);
    }

    #[test]
    fn test_cannot_activate_unhealthy() {
        let mut server = active_server();
        server.set_traffic(TrafficState::Draining).unwrap();
        server.set_deploy(DeployState::HealthChecking).unwrap();

        let err = server.set_traffic(TrafficState::Active).unwrap_err();
        assert!(matches!(err, TransitionError::ActivateUnhealthy { .. }));
        assert_eq!(server.traffic_state, TrafficState::Draining);
    }

    #[test]
    fn test_full_cycle() {
        let mut server = active_server();
        server.set_traffic(TrafficState::Draining).unwrap();
        server.set_deploy(DeployState::Deploying).unwrap();
        server.set_deploy(DeployState::HealthChecking).unwrap();
        server.set_deploy(DeployState::Healthy).unwrap();
        server.set_traffic(TrafficState::Active).unwrap();
        assert!(server.is_serving());
    }

    #[test]
    fn test_base_url() {
        assert_eq!(ServerSpec::new("a", "10.0.0.1:8080").base_url(), "http://10.0.0.1:8080");
        assert_eq!(
            ServerSpec::new("a", "https://web-1.internal/").base_url(),
            "https://web-1.internal"
        );
    }

    #[test]
    fn test_slot_opposite() {
        assert_eq!(Slot::Blue.opposite(), Slot::Green);
        assert_eq!(Slot::Green.opposite(), Slot::Blue);
    }
}
