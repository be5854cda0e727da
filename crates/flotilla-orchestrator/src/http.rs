//! HTTP and process implementations of the collaborator traits.
//!
//! Conventions:
//!
//! - load balancer: `PUT {base}/servers/{id}/availability` with
//!   `{"available": bool}`, `GET {base}/servers/{id}` returning
//!   `{"state": "active"|"draining"|"offline"}`, `GET`/`PUT {base}/pointer`
//!   with `{"activeSlot": "blue"|"green"}`
//! - deployer: `POST {base}/deployments` with
//!   `{"serverId", "address", "version"}`, answering
//!   `{"success": bool, "errorDetail": string?}`
//! - health: `GET <endpoint>` answering `{"status": "Healthy", ...}`
//! - metrics: `GET <server><metricsPath>` answering a [`MetricSample`]

use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use flotilla_core::{
    ConfigError, HealthCheckPolicy, MetricSample, ServerSpec, Slot, TrafficState, ValidationError,
    ValidationErrors,
};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tokio::process::Command;

use crate::adapters::{
    DeployOutcome, Deployer, LoadBalancerAdapter, MetricsSource, TestReport, TestSuite,
};
use crate::error::{OrchestratorError, Result};
use crate::health::{Probe, ProbeResult};

const USER_AGENT: &str = concat!("flotilla/", env!("CARGO_PKG_VERSION"));

/// Default request timeout for control-plane calls.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default metrics path when the plan does not set one.
pub const DEFAULT_METRICS_PATH: &str = "/metrics";

fn build_client(timeout: Duration) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .user_agent(USER_AGENT)
        .build()
        .map_err(|e| OrchestratorError::Internal(format!("cannot build HTTP client: {e}")))
}

fn connectivity(target: &str, error: &reqwest::Error) -> OrchestratorError {
    OrchestratorError::Connectivity {
        target: target.to_string(),
        reason: error.to_string(),
    }
}

fn normalize_base(url: &str) -> Result<String> {
    let parsed = url::Url::parse(url).map_err(|e| {
        let mut errors = ValidationErrors::new();
        errors.add(ValidationError::constraint(
            "integrations",
            format!("invalid base URL '{url}': {e}"),
        ));
        OrchestratorError::Configuration(ConfigError::Invalid(errors))
    })?;
    Ok(parsed.as_str().trim_end_matches('/').to_string())
}

#[derive(Serialize)]
struct AvailabilityRequest {
    available: bool,
}

#[derive(Deserialize)]
struct ServerStatusResponse {
    state: TrafficState,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PointerBody {
    active_slot: Option<Slot>,
}

/// Load balancer control over a REST API.
#[derive(Debug, Clone)]
pub struct HttpLoadBalancer {
    base: String,
    http: reqwest::Client,
}

impl HttpLoadBalancer {
    /// Creates a client for the API at `base_url`.
    pub fn new(base_url: &str) -> Result<Self> {
        Ok(Self {
            base: normalize_base(base_url)?,
            http: build_client(DEFAULT_TIMEOUT)?,
        })
    }

    async fn check(&self, target: &str, response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        if status.is_server_error() {
            return Err(OrchestratorError::Connectivity {
                target: target.to_string(),
                reason: format!("load balancer returned {status}: {body}"),
            });
        }
        Err(OrchestratorError::LoadBalancer {
            target: target.to_string(),
            reason: format!("{status}: {body}"),
        })
    }
}

#[async_trait]
impl LoadBalancerAdapter for HttpLoadBalancer {
    async fn set_availability(&self, server_id: &str, available: bool) -> Result<()> {
        let url = format!("{}/servers/{server_id}/availability", self.base);
        let response = self
            .http
            .put(&url)
            .json(&AvailabilityRequest { available })
            .send()
            .await
            .map_err(|e| connectivity(server_id, &e))?;
        self.check(server_id, response).await?;
        tracing::debug!(server_id = %server_id, available, "load balancer updated");
        Ok(())
    }

    async fn status(&self, server_id: &str) -> Result<TrafficState> {
        let url = format!("{}/servers/{server_id}", self.base);
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| connectivity(server_id, &e))?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(TrafficState::Offline);
        }
        let body: ServerStatusResponse = self
            .check(server_id, response)
            .await?
            .json()
            .await
            .map_err(|e| connectivity(server_id, &e))?;
        Ok(body.state)
    }

    async fn active_slot(&self) -> Result<Option<Slot>> {
        let url = format!("{}/pointer", self.base);
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| connectivity("pointer", &e))?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let body: PointerBody = self
            .check("pointer", response)
            .await?
            .json()
            .await
            .map_err(|e| connectivity("pointer", &e))?;
        Ok(body.active_slot)
    }

    async fn switch_slot(&self, slot: Slot) -> Result<()> {
        let url = format!("{}/pointer", self.base);
        let response = self
            .http
            .put(&url)
            .json(&PointerBody {
                active_slot: Some(slot),
            })
            .send()
            .await
            .map_err(|e| connectivity("pointer", &e))?;
        self.check("pointer", response).await?;
        tracing::info!(slot = %slot, "traffic pointer switched");
        Ok(())
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DeployRequest<'a> {
    server_id: &'a str,
    address: &'a str,
    version: &'a str,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeployResponse {
    success: bool,
    #[serde(default)]
    error_detail: Option<String>,
}

/// Deployment agent reached over HTTP.
///
/// Transport errors and 5xx answers are reported as connectivity errors
/// so they are retried; 4xx answers are definitive failures.
#[derive(Debug, Clone)]
pub struct HttpDeployer {
    base: String,
    http: reqwest::Client,
}

impl HttpDeployer {
    /// Creates a client for the agent at `base_url`.
    pub fn new(base_url: &str) -> Result<Self> {
        Ok(Self {
            base: normalize_base(base_url)?,
            http: build_client(Duration::from_secs(600))?,
        })
    }
}

#[async_trait]
impl Deployer for HttpDeployer {
    async fn deploy(&self, server: &ServerSpec, version: &str) -> Result<DeployOutcome> {
        let url = format!("{}/deployments", self.base);
        let response = self
            .http
            .post(&url)
            .json(&DeployRequest {
                server_id: &server.id,
                address: &server.address,
                version,
            })
            .send()
            .await
            .map_err(|e| connectivity(&server.id, &e))?;

        let status = response.status();
        if status.is_server_error() {
            let body = response.text().await.unwrap_or_default();
            return Err(OrchestratorError::Connectivity {
                target: server.id.clone(),
                reason: format!("deployer returned {status}: {body}"),
            });
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Ok(DeployOutcome::failed(format!("deployer returned {status}: {body}")));
        }

        let body: DeployResponse = response
            .json()
            .await
            .map_err(|e| connectivity(&server.id, &e))?;
        if body.success {
            Ok(DeployOutcome::success())
        } else {
            Ok(DeployOutcome::failed(
                body.error_detail
                    .unwrap_or_else(|| "deployer reported failure".to_string()),
            ))
        }
    }
}

#[derive(Deserialize)]
struct HealthBody {
    status: String,
}

/// Health probe over HTTP.
#[derive(Debug, Clone)]
pub struct HttpProbe {
    http: reqwest::Client,
}

impl HttpProbe {
    /// Creates a probe. The per-request timeout comes from the policy.
    pub fn new() -> Result<Self> {
        Ok(Self {
            http: build_client(DEFAULT_TIMEOUT)?,
        })
    }
}

#[async_trait]
impl Probe for HttpProbe {
    async fn probe(&self, server: &ServerSpec, policy: &HealthCheckPolicy) -> ProbeResult {
        let url = policy.url_for(server);
        let started = Instant::now();

        let response = match self.http.get(&url).timeout(policy.timeout()).send().await {
            Ok(response) => response,
            Err(e) if e.is_timeout() => {
                return ProbeResult::unreachable(format!("timed out after {}s", policy.timeout_seconds))
            }
            Err(e) => return ProbeResult::unreachable(e.to_string()),
        };
        let elapsed = started.elapsed();

        let status = response.status();
        if !status.is_success() {
            return ProbeResult::unhealthy(format!("HTTP {status}"));
        }
        match response.json::<HealthBody>().await {
            Ok(body) if body.status == "Healthy" => ProbeResult::healthy(elapsed),
            Ok(body) => ProbeResult::unhealthy(format!("reported status '{}'", body.status)),
            Err(e) => ProbeResult::unhealthy(format!("invalid health response: {e}")),
        }
    }
}

/// Per-server metrics endpoint.
#[derive(Debug, Clone)]
pub struct HttpMetricsSource {
    path: String,
    http: reqwest::Client,
}

impl HttpMetricsSource {
    /// Creates a source reading `path` on each server.
    pub fn new(path: Option<&str>) -> Result<Self> {
        let path = path.unwrap_or(DEFAULT_METRICS_PATH);
        Ok(Self {
            path: format!("/{}", path.trim_start_matches('/')),
            http: build_client(Duration::from_secs(10))?,
        })
    }

    /// Returns the metrics URL for `server`.
    pub fn url_for(&self, server: &ServerSpec) -> String {
        format!("{}{}", server.base_url(), self.path)
    }
}

#[async_trait]
impl MetricsSource for HttpMetricsSource {
    async fn sample(&self, server: &ServerSpec) -> Result<MetricSample> {
        let response = self
            .http
            .get(self.url_for(server))
            .send()
            .await
            .map_err(|e| connectivity(&server.id, &e))?;
        if !response.status().is_success() {
            return Err(OrchestratorError::Connectivity {
                target: server.id.clone(),
                reason: format!("metrics endpoint returned {}", response.status()),
            });
        }
        let mut sample: MetricSample = response
            .json()
            .await
            .map_err(|e| connectivity(&server.id, &e))?;
        sample.server_id.clone_from(&server.id);
        Ok(sample)
    }
}

/// Runs an external command as the blue-green acceptance suite.
///
/// The command sees `FLOTILLA_ENVIRONMENT`, `FLOTILLA_SLOT` and
/// `FLOTILLA_SERVERS` (comma-separated base URLs). Exit status 0 passes.
#[derive(Debug, Clone)]
pub struct CommandTestSuite {
    argv: Vec<String>,
}

impl CommandTestSuite {
    /// Creates a suite from an argv. Returns `None` for an empty argv.
    pub fn new(argv: Vec<String>) -> Option<Self> {
        (!argv.is_empty()).then_some(Self { argv })
    }
}

#[async_trait]
impl TestSuite for CommandTestSuite {
    async fn run(&self, environment: &str, slot: Slot, servers: &[ServerSpec]) -> Result<TestReport> {
        let Some((program, args)) = self.argv.split_first() else {
            return Err(OrchestratorError::Internal("empty test command".to_string()));
        };
        let targets = servers
            .iter()
            .map(ServerSpec::base_url)
            .collect::<Vec<_>>()
            .join(",");

        tracing::info!(program = %program, slot = %slot, "running acceptance suite");
        let output = Command::new(program)
            .args(args)
            .env("FLOTILLA_ENVIRONMENT", environment)
            .env("FLOTILLA_SLOT", slot.to_string())
            .env("FLOTILLA_SERVERS", targets)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| OrchestratorError::Internal(format!("cannot run '{program}': {e}")))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        let last_line = stderr
            .lines()
            .chain(stdout.lines())
            .filter(|l| !l.trim().is_empty())
            .last()
            .unwrap_or("")
            .trim()
            .to_string();

        let summary = if output.status.success() {
            format!("'{program}' passed")
        } else {
            format!("'{program}' exited with {}: {last_line}", output.status)
        };
        Ok(TestReport {
            passed: output.status.success(),
            summary,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_base_trims_slash() {
        assert_eq!(
            normalize_base("http://lb.internal:8080/").unwrap(),
            "http://lb.internal:8080"
        );
        assert_eq!(normalize_base("not a url").unwrap_err().exit_code(), 2);
    }

    #[test]
    fn test_metrics_url() {
        let source = HttpMetricsSource::new(Some("stats")).unwrap();
        let server = ServerSpec::new("web-1", "10.0.0.1:8080");
        assert_eq!(source.url_for(&server), "http://10.0.0.1:8080/stats");

        let default = HttpMetricsSource::new(None).unwrap();
        assert_eq!(default.url_for(&server), "http://10.0.0.1:8080/metrics");
    }

    #[test]
    fn test_pointer_body_shape() {
        let body = PointerBody {
            active_slot: Some(Slot::Green),
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["activeSlot"], serde_json::to_value(Slot::Green).unwrap());
    }

    #[test]
    fn test_empty_test_command() {
        assert!(CommandTestSuite::new(Vec::new()).is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_suite_reports_exit_status() {
        let servers = vec![ServerSpec::new("g-1", "10.0.1.1:8080")];

        let pass = CommandTestSuite::new(vec![
            "sh".to_string(),
            "-c".to_string(),
            "test \"$FLOTILLA_SLOT\" = green && test -n \"$FLOTILLA_SERVERS\"".to_string(),
        ])
        .unwrap();
        let report = pass.run("prod", Slot::Green, &servers).await.unwrap();
        assert!(report.passed, "{}", report.summary);

        let fail = CommandTestSuite::new(vec![
            "sh".to_string(),
            "-c".to_string(),
            "echo 'checkout flow broken' >&2; exit 3".to_string(),
        ])
        .unwrap();
        let report = fail.run("prod", Slot::Green, &servers).await.unwrap();
        assert!(!report.passed);
        assert!(report.summary.contains("checkout flow broken"));
    }

    #[tokio::test]
    async fn test_probe_unreachable_server() {
        let probe = HttpProbe::new().unwrap();
        // Port 9 (discard) on localhost is closed in test environments.
        let server = ServerSpec::new("web-1", "127.0.0.1:9");
        let policy = HealthCheckPolicy {
            timeout_seconds: 1,
            ..HealthCheckPolicy::default()
        };
        let result = probe.probe(&server, &policy).await;
        assert!(!result.is_success());
    }
}
