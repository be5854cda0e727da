//! CLI commands and argument parsing.

pub mod deploy;
pub mod rollback;
pub mod status;
pub mod validate;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use flotilla_audit::{AuditLogger, EventSeverity, FileBackend, TracingBackend};
use flotilla_core::{
    load_inventory, load_plan, ConfigError, DeploymentPlan, PlanLoader, Strategy,
    ValidationError, ValidationErrors,
};
use flotilla_orchestrator::{
    Collaborators, CommandTestSuite, DeploymentOrchestrator, EnvironmentLocks, FileHistory,
    HttpDeployer, HttpLoadBalancer, HttpMetricsSource, HttpProbe, NoTestSuite,
    OrchestratorError, TestSuite,
};

/// Flotilla - fleet deployment orchestrator
#[derive(Parser)]
#[command(name = "flotilla")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Directory holding one plan file per environment
    #[arg(long, global = true, env = "FLOTILLA_CONFIG_DIR", default_value = "deploy")]
    pub config_dir: PathBuf,

    /// Directory for deployment history, audit logs and locks
    #[arg(long, global = true, env = "FLOTILLA_STATE_DIR", default_value = ".flotilla")]
    pub state_dir: PathBuf,

    /// Log output format
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    /// Returns the directories the commands operate on.
    pub fn workspace(&self) -> Workspace {
        Workspace {
            config_dir: self.config_dir.clone(),
            state_dir: self.state_dir.clone(),
        }
    }
}

/// Available commands.
#[derive(Subcommand)]
pub enum Commands {
    /// Roll a version out to an environment
    Deploy(deploy::DeployArgs),

    /// Restore the last successful deployment of an environment
    Rollback(rollback::RollbackArgs),

    /// Show servers, slot and history for an environment
    Status(status::StatusArgs),

    /// Validate a plan file without contacting any server
    Validate(validate::ValidateArgs),

    /// Print version information
    Version,
}

/// Log output format.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum LogFormat {
    /// Human-readable lines.
    #[default]
    Text,
    /// One JSON object per line.
    Json,
}

/// Output format for command results.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    /// Human-readable summary.
    #[default]
    Text,
    /// Pretty-printed JSON.
    Json,
}

/// Config and state directories, plus the wiring from a plan to live
/// collaborators.
#[derive(Debug, Clone)]
pub struct Workspace {
    /// Plan directory.
    pub config_dir: PathBuf,
    /// State directory.
    pub state_dir: PathBuf,
}

impl Workspace {
    /// Loads the plan for a deploy run.
    pub fn plan(
        &self,
        environment: &str,
        version: &str,
        strategy: Option<Strategy>,
        path: Option<&Path>,
    ) -> Result<DeploymentPlan, ConfigError> {
        match path {
            Some(path) => load_plan(path, environment, version, strategy),
            None => PlanLoader::new(&self.config_dir).load(environment, version, strategy),
        }
    }

    /// Loads the plan for a rollback or status query.
    pub fn inventory(
        &self,
        environment: &str,
        path: Option<&Path>,
    ) -> Result<DeploymentPlan, ConfigError> {
        match path {
            Some(path) => load_inventory(path, environment),
            None => PlanLoader::new(&self.config_dir).load_inventory(environment),
        }
    }

    /// Audit log file for an environment.
    pub fn audit_path(&self, environment: &str) -> PathBuf {
        self.state_dir
            .join("audit")
            .join(format!("{environment}.jsonl"))
    }

    /// Lock directory shared by every process using this state directory.
    pub fn lock_dir(&self) -> PathBuf {
        self.state_dir.join("locks")
    }

    /// Builds an orchestrator talking to the plan's integrations.
    pub fn orchestrator(&self, plan: &DeploymentPlan) -> anyhow::Result<DeploymentOrchestrator> {
        let collaborators = collaborators(plan)?;
        let audit = AuditLogger::builder()
            .with_backend(Arc::new(FileBackend::open(
                self.audit_path(&plan.environment),
            )?))
            .with_backend_at(Arc::new(TracingBackend::new()), EventSeverity::Warning)
            .build();

        Ok(DeploymentOrchestrator::builder(collaborators)
            .history(Arc::new(FileHistory::new(&self.state_dir)))
            .audit(Arc::new(audit))
            .locks(EnvironmentLocks::with_lock_dir(self.lock_dir()))
            .build())
    }
}

/// Builds HTTP collaborators from the plan's `integrations` section.
pub fn collaborators(plan: &DeploymentPlan) -> Result<Collaborators, OrchestratorError> {
    let integrations = &plan.integrations;
    let load_balancer_url = required(
        integrations.load_balancer_url.as_deref(),
        "integrations.loadBalancerUrl",
    )?;
    let deployer_url = required(integrations.deployer_url.as_deref(), "integrations.deployerUrl")?;

    let tests: Arc<dyn TestSuite> = match CommandTestSuite::new(integrations.test_command.clone()) {
        Some(suite) => Arc::new(suite),
        None => Arc::new(NoTestSuite),
    };

    Ok(Collaborators {
        load_balancer: Arc::new(HttpLoadBalancer::new(load_balancer_url)?),
        deployer: Arc::new(HttpDeployer::new(deployer_url)?),
        probe: Arc::new(HttpProbe::new()?),
        metrics: Arc::new(HttpMetricsSource::new(integrations.metrics_path.as_deref())?),
        tests,
    })
}

fn required<'a>(value: Option<&'a str>, field: &str) -> Result<&'a str, OrchestratorError> {
    value.filter(|v| !v.trim().is_empty()).ok_or_else(|| {
        let mut errors = ValidationErrors::new();
        errors.add(ValidationError::required(field));
        OrchestratorError::Configuration(ConfigError::Invalid(errors))
    })
}
