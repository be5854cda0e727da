//! Deployment plan configuration.
//!
//! A plan file describes one environment: its server inventory, the
//! rollout strategy, health-check policy and rollback thresholds. It is
//! loaded once per run, combined with the target version from the
//! command line, validated, and then shared read-only for the rest of
//! the run.

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, Result};
use crate::server::{ServerSpec, Slot};
use crate::validation::{Validate, ValidationError, ValidationErrors};

/// Rollout strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
    /// Sequential batches of `batchSize` servers.
    #[default]
    Rolling,
    /// A gated canary subset, then a rolling rollout of the rest.
    Canary,
    /// Deploy to the standby slot, then flip the active pointer.
    BlueGreen,
}

impl Strategy {
    /// Returns a string representation for display.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Rolling => "rolling",
            Self::Canary => "canary",
            Self::BlueGreen => "blue-green",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Strategy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "rolling" => Ok(Self::Rolling),
            "canary" => Ok(Self::Canary),
            "blue-green" | "bluegreen" | "blue_green" => Ok(Self::BlueGreen),
            other => Err(format!(
                "unknown strategy '{other}' (expected rolling, canary or blue-green)"
            )),
        }
    }
}

/// Health-check policy applied after every deploy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct HealthCheckPolicy {
    /// Path (or absolute URL) of the health endpoint.
    pub endpoint: String,

    /// Seconds between probes.
    pub interval_seconds: u64,

    /// Total probes before giving up.
    pub max_attempts: u32,

    /// Consecutive successful probes required to call a server healthy.
    pub required_consecutive_successes: u32,

    /// Per-probe request timeout in seconds.
    pub timeout_seconds: u64,
}

impl Default for HealthCheckPolicy {
    fn default() -> Self {
        Self {
            endpoint: "/health".to_string(),
            interval_seconds: 5,
            max_attempts: 10,
            required_consecutive_successes: 3,
            timeout_seconds: 5,
        }
    }
}

impl HealthCheckPolicy {
    /// Returns the probe interval.
    pub const fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_seconds)
    }

    /// Returns the per-probe timeout.
    pub const fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    /// Resolves the health URL for a server.
    pub fn url_for(&self, server: &ServerSpec) -> String {
        if self.endpoint.starts_with("http://") || self.endpoint.starts_with("https://") {
            return self.endpoint.clone();
        }
        let path = self.endpoint.trim_start_matches('/');
        format!("{}/{path}", server.base_url())
    }
}

/// Metric limits that trigger an automatic rollback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct RollbackThresholds {
    /// Maximum error rate, in percent.
    pub error_rate: f64,

    /// Maximum p95 latency in milliseconds.
    pub p95_latency_ms: f64,

    /// Maximum CPU utilisation, in percent.
    pub cpu_percent: f64,

    /// Maximum memory utilisation, in percent.
    pub memory_percent: f64,

    /// Fraction of unhealthy servers above which the watch breaches.
    pub unhealthy_server_fraction: f64,

    /// Minimum availability, in percent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_availability_percent: Option<f64>,
}

impl Default for RollbackThresholds {
    fn default() -> Self {
        Self {
            error_rate: 5.0,
            p95_latency_ms: 1000.0,
            cpu_percent: 90.0,
            memory_percent: 90.0,
            unhealthy_server_fraction: 0.5,
            min_availability_percent: None,
        }
    }
}

/// Retry behaviour for transient connectivity errors at the deployer boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct RetrySettings {
    /// Total attempts, including the first.
    pub max_attempts: u32,

    /// Backoff before the first retry, in milliseconds.
    pub initial_backoff_ms: u64,

    /// Upper bound on the backoff, in milliseconds.
    pub max_backoff_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 500,
            max_backoff_ms: 5000,
        }
    }
}

/// Endpoints of the external collaborators used by the command-line wiring.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct Integrations {
    /// Base URL of the load-balancer control API.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub load_balancer_url: Option<String>,

    /// Base URL of the deployment agent API.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deployer_url: Option<String>,

    /// Path of the per-server metrics endpoint.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics_path: Option<String>,

    /// Command (argv) running the blue-green acceptance suite.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub test_command: Vec<String>,
}

const fn default_batch_size() -> usize {
    1
}

const fn default_drain_seconds() -> u64 {
    30
}

const fn default_max_parallelism() -> usize {
    10
}

const fn default_monitor_window() -> u64 {
    300
}

const fn default_monitor_interval() -> u64 {
    30
}

const fn default_true() -> bool {
    true
}

/// Upper bound for every duration field of a plan, in seconds (one week).
pub const MAX_DURATION_SECONDS: u64 = 7 * 24 * 60 * 60;

/// True when `name` can be used as a file stem under the config and state
/// directories: non-blank, no path separators, no leading dot.
pub fn is_valid_environment_name(name: &str) -> bool {
    !name.trim().is_empty() && !name.contains(['/', '\\']) && !name.starts_with('.')
}

/// A validated, immutable deployment plan for one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct DeploymentPlan {
    /// Environment name.
    pub environment: String,

    /// Version being rolled out. Supplied on the command line.
    #[serde(default)]
    pub target_version: String,

    /// Rollout strategy.
    #[serde(default)]
    pub strategy: Strategy,

    /// Servers per batch.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Seconds to wait after draining before deploying.
    #[serde(default = "default_drain_seconds")]
    pub drain_seconds: u64,

    /// Global cap on concurrent per-server operations.
    #[serde(default = "default_max_parallelism")]
    pub max_parallelism: usize,

    /// Health-check policy.
    #[serde(default)]
    pub health_check: HealthCheckPolicy,

    /// Rollback thresholds for the metrics monitor.
    #[serde(default)]
    pub rollback_thresholds: RollbackThresholds,

    /// Percentage of servers in the canary subset (canary strategy only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub canary_percent: Option<f64>,

    /// Duration of a metrics watch, in seconds.
    #[serde(default = "default_monitor_window")]
    pub monitor_window_seconds: u64,

    /// Seconds between metric sample rounds.
    #[serde(default = "default_monitor_interval")]
    pub monitor_interval_seconds: u64,

    /// Watch each reintegrated batch (and a flipped blue-green slot).
    #[serde(default = "default_true")]
    pub post_deploy_monitor: bool,

    /// Deployer retry behaviour.
    #[serde(default)]
    pub retry: RetrySettings,

    /// Server inventory.
    #[serde(default)]
    pub servers: Vec<ServerSpec>,

    /// External collaborator endpoints.
    #[serde(default)]
    pub integrations: Integrations,
}

impl DeploymentPlan {
    /// Creates a builder for a plan.
    pub fn builder(
        environment: impl Into<String>,
        target_version: impl Into<String>,
    ) -> DeploymentPlanBuilder {
        DeploymentPlanBuilder::new(environment, target_version)
    }

    /// Returns the drain wait.
    pub const fn drain_duration(&self) -> Duration {
        Duration::from_secs(self.drain_seconds)
    }

    /// Returns the metrics watch window.
    pub const fn monitor_window(&self) -> Duration {
        Duration::from_secs(self.monitor_window_seconds)
    }

    /// Returns the interval between metric sample rounds.
    pub const fn monitor_interval(&self) -> Duration {
        Duration::from_secs(self.monitor_interval_seconds)
    }

    /// Concurrency bound for per-server work within a batch.
    pub fn worker_limit(&self) -> usize {
        self.batch_size.min(self.max_parallelism).max(1)
    }

    /// Returns the servers assigned to a blue/green slot.
    pub fn servers_in_slot(&self, slot: Slot) -> Vec<ServerSpec> {
        self.servers
            .iter()
            .filter(|s| s.slot == Some(slot))
            .cloned()
            .collect()
    }

    /// Returns the inventory entry for a server id.
    pub fn server(&self, id: &str) -> Option<&ServerSpec> {
        self.servers.iter().find(|s| s.id == id)
    }
}

impl Validate for DeploymentPlan {
    fn validate(&self) -> std::result::Result<(), ValidationErrors> {
        self.check(true)
    }
}

impl DeploymentPlan {
    /// Validates everything except `targetVersion`.
    ///
    /// Rollback and status runs take their version from history, not
    /// from the command line.
    ///
    /// # Errors
    ///
    /// Returns every violation found.
    pub fn validate_for_restore(&self) -> std::result::Result<(), ValidationErrors> {
        self.check(false)
    }

    /// Returns a copy of the plan targeting `version`.
    #[must_use]
    pub fn targeting(&self, version: impl Into<String>) -> Self {
        Self {
            target_version: version.into(),
            ..self.clone()
        }
    }

    fn check(&self, require_version: bool) -> std::result::Result<(), ValidationErrors> {
        let mut errors = ValidationErrors::new();

        if self.environment.trim().is_empty() {
            errors.add(ValidationError::required("environment"));
        } else if !is_valid_environment_name(&self.environment) {
            errors.add(ValidationError::constraint(
                "environment",
                "must not contain path separators or start with '.'",
            ));
        }
        if require_version && self.target_version.trim().is_empty() {
            errors.add(ValidationError::required("targetVersion"));
        }
        if self.batch_size == 0 {
            errors.add(ValidationError::range("batchSize", "must be greater than zero"));
        }
        if self.max_parallelism == 0 {
            errors.add(ValidationError::range(
                "maxParallelism",
                "must be greater than zero",
            ));
        }
        if self.monitor_interval_seconds == 0 {
            errors.add(ValidationError::range(
                "monitorIntervalSeconds",
                "must be greater than zero",
            ));
        }

        let durations = [
            ("drainSeconds", self.drain_seconds),
            ("monitorWindowSeconds", self.monitor_window_seconds),
            ("monitorIntervalSeconds", self.monitor_interval_seconds),
            ("healthCheck.intervalSeconds", self.health_check.interval_seconds),
            ("healthCheck.timeoutSeconds", self.health_check.timeout_seconds),
        ];
        for (field, secs) in durations {
            if secs > MAX_DURATION_SECONDS {
                errors.add(ValidationError::range(
                    field,
                    format!("must be at most {MAX_DURATION_SECONDS} seconds"),
                ));
            }
        }

        let hc = &self.health_check;
        if hc.endpoint.trim().is_empty() {
            errors.add(ValidationError::required("healthCheck.endpoint"));
        }
        if hc.max_attempts == 0 {
            errors.add(ValidationError::range(
                "healthCheck.maxAttempts",
                "must be greater than zero",
            ));
        }
        if hc.required_consecutive_successes == 0 {
            errors.add(ValidationError::range(
                "healthCheck.requiredConsecutiveSuccesses",
                "must be greater than zero",
            ));
        } else if hc.required_consecutive_successes > hc.max_attempts {
            errors.add(ValidationError::constraint(
                "healthCheck.requiredConsecutiveSuccesses",
                "cannot exceed healthCheck.maxAttempts",
            ));
        }

        validate_thresholds(&self.rollback_thresholds, &mut errors);
        self.validate_inventory(&mut errors);

        match self.strategy {
            Strategy::Canary => match self.canary_percent {
                None => errors.add(ValidationError::required("canaryPercent")),
                Some(pct) if !(pct > 0.0 && pct < 100.0) => errors.add(ValidationError::range(
                    "canaryPercent",
                    "must be strictly between 0 and 100",
                )),
                Some(_) => {}
            },
            Strategy::BlueGreen => {
                for slot in [Slot::Blue, Slot::Green] {
                    if !self.servers.iter().any(|s| s.slot == Some(slot)) {
                        errors.add(ValidationError::constraint(
                            "servers",
                            format!("blue-green strategy requires at least one {slot} server"),
                        ));
                    }
                }
            }
            Strategy::Rolling => {}
        }

        errors.into_result()
    }

    fn validate_inventory(&self, errors: &mut ValidationErrors) {
        if self.servers.is_empty() {
            errors.add(ValidationError::empty("servers"));
            return;
        }

        let mut seen = HashSet::new();
        for (i, server) in self.servers.iter().enumerate() {
            if server.id.trim().is_empty() {
                errors.add(ValidationError::required(format!("servers[{i}].id")));
            } else if !seen.insert(server.id.as_str()) {
                errors.add(ValidationError::duplicate(format!("servers[{i}].id"), &server.id));
            }
            if server.address.trim().is_empty() {
                errors.add(ValidationError::required(format!("servers[{i}].address")));
            }
        }
    }
}

fn validate_thresholds(t: &RollbackThresholds, errors: &mut ValidationErrors) {
    let limits = [
        ("rollbackThresholds.errorRate", t.error_rate),
        ("rollbackThresholds.p95LatencyMs", t.p95_latency_ms),
        ("rollbackThresholds.cpuPercent", t.cpu_percent),
        ("rollbackThresholds.memoryPercent", t.memory_percent),
        (
            "rollbackThresholds.unhealthyServerFraction",
            t.unhealthy_server_fraction,
        ),
    ];
    for (field, value) in limits {
        if value.is_nan() || value < 0.0 {
            errors.add(ValidationError::range(field, "must not be negative"));
        }
    }
    if t.unhealthy_server_fraction > 1.0 {
        errors.add(ValidationError::range(
            "rollbackThresholds.unhealthyServerFraction",
            "must be between 0 and 1",
        ));
    }
    if let Some(min) = t.min_availability_percent {
        if min.is_nan() || !(0.0..=100.0).contains(&min) {
            errors.add(ValidationError::range(
                "rollbackThresholds.minAvailabilityPercent",
                "must be between 0 and 100",
            ));
        }
    }
}

/// Loads plan files from disk.
#[derive(Debug, Clone)]
pub struct PlanLoader {
    config_dir: PathBuf,
}

impl PlanLoader {
    /// Creates a loader rooted at a configuration directory.
    pub fn new(config_dir: impl Into<PathBuf>) -> Self {
        Self {
            config_dir: config_dir.into(),
        }
    }

    /// Finds the plan file for an environment (`<env>.yaml`, `.yml` or `.json`).
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] when `environment` is not usable as
    /// a file name, and [`ConfigError::PlanNotFound`] when no candidate
    /// exists.
    pub fn locate(&self, environment: &str) -> Result<PathBuf> {
        if !is_valid_environment_name(environment) {
            let errors: ValidationErrors = std::iter::once(ValidationError::constraint(
                "environment",
                format!("'{environment}' is not a valid environment name"),
            ))
            .collect();
            return Err(ConfigError::Invalid(errors));
        }
        ["yaml", "yml", "json"]
            .iter()
            .map(|ext| self.config_dir.join(format!("{environment}.{ext}")))
            .find(|p| p.is_file())
            .ok_or_else(|| ConfigError::PlanNotFound {
                environment: environment.to_string(),
                dir: self.config_dir.clone(),
            })
    }

    /// Loads and validates the plan for a run.
    ///
    /// `strategy` overrides the strategy from the file when given.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] if the file cannot be found, read, parsed
    /// or validated, or if it describes a different environment.
    pub fn load(
        &self,
        environment: &str,
        target_version: &str,
        strategy: Option<Strategy>,
    ) -> Result<DeploymentPlan> {
        let path = self.locate(environment)?;
        load_plan(&path, environment, target_version, strategy)
    }

    /// Loads the plan for a rollback or status query.
    ///
    /// The version is left as written in the file and is not required.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] if the file cannot be found, read, parsed
    /// or validated, or if it describes a different environment.
    pub fn load_inventory(&self, environment: &str) -> Result<DeploymentPlan> {
        let path = self.locate(environment)?;
        load_inventory(&path, environment)
    }
}

/// Loads a plan from an explicit path for a rollback or status query.
///
/// # Errors
///
/// Returns a [`ConfigError`] if the file cannot be read, parsed or
/// validated, or if it describes a different environment.
pub fn load_inventory(path: &Path, environment: &str) -> Result<DeploymentPlan> {
    let plan = read_environment(path, environment)?;
    plan.validate_for_restore()?;
    Ok(plan)
}

/// Loads and validates a plan from an explicit path.
///
/// # Errors
///
/// Returns a [`ConfigError`] if the file cannot be read, parsed or
/// validated, or if it describes a different environment.
pub fn load_plan(
    path: &Path,
    environment: &str,
    target_version: &str,
    strategy: Option<Strategy>,
) -> Result<DeploymentPlan> {
    let mut plan = read_environment(path, environment)?;
    plan.target_version = target_version.to_string();
    if let Some(strategy) = strategy {
        plan.strategy = strategy;
    }
    plan.validate()?;
    tracing::debug!(
        environment = %plan.environment,
        path = %path.display(),
        servers = plan.servers.len(),
        strategy = %plan.strategy,
        "loaded deployment plan"
    );
    Ok(plan)
}

fn read_environment(path: &Path, environment: &str) -> Result<DeploymentPlan> {
    let plan = read_plan_file(path)?;
    if plan.environment != environment {
        let mut errors = ValidationErrors::new();
        errors.add(ValidationError::constraint(
            "environment",
            format!(
                "plan file {} describes '{}', not '{environment}'",
                path.display(),
                plan.environment
            ),
        ));
        return Err(errors.into());
    }
    Ok(plan)
}

/// Reads a plan file without validating it.
///
/// # Errors
///
/// Returns a [`ConfigError`] on I/O or parse failure, or for an
/// unsupported extension.
pub fn read_plan_file(path: &Path) -> Result<DeploymentPlan> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);
    match ext.as_deref() {
        Some("json") => serde_json::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            reason: e.to_string(),
        }),
        Some("yaml" | "yml") => serde_yaml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            reason: e.to_string(),
        }),
        _ => Err(ConfigError::UnsupportedFormat {
            path: path.to_path_buf(),
        }),
    }
}

/// Builder for [`DeploymentPlan`].
#[derive(Debug, Clone)]
pub struct DeploymentPlanBuilder {
    plan: DeploymentPlan,
}

impl DeploymentPlanBuilder {
    fn new(environment: impl Into<String>, target_version: impl Into<String>) -> Self {
        Self {
            plan: DeploymentPlan {
                environment: environment.into(),
                target_version: target_version.into(),
                strategy: Strategy::default(),
                batch_size: default_batch_size(),
                drain_seconds: default_drain_seconds(),
                max_parallelism: default_max_parallelism(),
                health_check: HealthCheckPolicy::default(),
                rollback_thresholds: RollbackThresholds::default(),
                canary_percent: None,
                monitor_window_seconds: default_monitor_window(),
                monitor_interval_seconds: default_monitor_interval(),
                post_deploy_monitor: true,
                retry: RetrySettings::default(),
                servers: Vec::new(),
                integrations: Integrations::default(),
            },
        }
    }

    /// Sets the strategy.
    #[must_use]
    pub const fn strategy(mut self, strategy: Strategy) -> Self {
        self.plan.strategy = strategy;
        self
    }

    /// Sets the batch size.
    #[must_use]
    pub const fn batch_size(mut self, size: usize) -> Self {
        self.plan.batch_size = size;
        self
    }

    /// Sets the drain wait in seconds.
    #[must_use]
    pub const fn drain_seconds(mut self, secs: u64) -> Self {
        self.plan.drain_seconds = secs;
        self
    }

    /// Sets the global parallelism cap.
    #[must_use]
    pub const fn max_parallelism(mut self, max: usize) -> Self {
        self.plan.max_parallelism = max;
        self
    }

    /// Sets the health-check policy.
    #[must_use]
    pub fn health_check(mut self, policy: HealthCheckPolicy) -> Self {
        self.plan.health_check = policy;
        self
    }

    /// Sets the rollback thresholds.
    #[must_use]
    pub fn thresholds(mut self, thresholds: RollbackThresholds) -> Self {
        self.plan.rollback_thresholds = thresholds;
        self
    }

    /// Sets the canary percentage.
    #[must_use]
    pub const fn canary_percent(mut self, pct: f64) -> Self {
        self.plan.canary_percent = Some(pct);
        self
    }

    /// Sets the monitor window and sample interval, in seconds.
    #[must_use]
    pub const fn monitor(mut self, window_secs: u64, interval_secs: u64) -> Self {
        self.plan.monitor_window_seconds = window_secs;
        self.plan.monitor_interval_seconds = interval_secs;
        self
    }

    /// Enables or disables post-deploy monitoring.
    #[must_use]
    pub const fn post_deploy_monitor(mut self, enabled: bool) -> Self {
        self.plan.post_deploy_monitor = enabled;
        self
    }

    /// Sets the retry behaviour.
    #[must_use]
    pub fn retry(mut self, retry: RetrySettings) -> Self {
        self.plan.retry = retry;
        self
    }

    /// Adds a server to the inventory.
    #[must_use]
    pub fn server(mut self, spec: ServerSpec) -> Self {
        self.plan.servers.push(spec);
        self
    }

    /// Replaces the inventory.
    #[must_use]
    pub fn servers(mut self, specs: impl IntoIterator<Item = ServerSpec>) -> Self {
        self.plan.servers = specs.into_iter().collect();
        self
    }

    /// Validates and returns the plan.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if validation fails.
    pub fn build(self) -> Result<DeploymentPlan> {
        self.plan.validate()?;
        Ok(self.plan)
    }

    /// Returns the plan without validating it.
    pub fn build_unchecked(self) -> DeploymentPlan {
        self.plan
    }
}
