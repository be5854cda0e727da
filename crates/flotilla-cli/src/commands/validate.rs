//! Validate command implementation.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::Args;
use flotilla_core::{ConfigError, DeploymentPlan, Strategy};
use flotilla_orchestrator::strategy::rollout_phases;
use tracing::info;

use super::Workspace;

/// Arguments for the validate command.
#[derive(Args)]
pub struct ValidateArgs {
    /// Environment whose plan should be checked
    pub environment: String,

    /// Version to validate the plan against; checks the inventory only when omitted
    #[arg(long)]
    pub version: Option<String>,

    /// Override the plan's strategy (rolling, canary, blue-green)
    #[arg(short, long)]
    pub strategy: Option<Strategy>,

    /// Plan file to use instead of <config-dir>/<environment>.yaml
    #[arg(long)]
    pub plan: Option<PathBuf>,

    /// Show the rollout phases
    #[arg(short, long)]
    pub verbose: bool,
}

/// Runs the validate command.
pub fn run(workspace: &Workspace, args: &ValidateArgs) -> Result<ExitCode> {
    info!(environment = %args.environment, "Validating plan");

    let plan = load(workspace, args)?;

    println!("✓ {} ({} servers, {})", plan.environment, plan.servers.len(), plan.strategy);
    if args.verbose && !plan.target_version.is_empty() {
        println!();
        for phase in rollout_phases(&plan, None) {
            println!("{phase}");
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn load(workspace: &Workspace, args: &ValidateArgs) -> Result<DeploymentPlan> {
    let plan = match &args.version {
        Some(version) => workspace.plan(
            &args.environment,
            version,
            args.strategy,
            args.plan.as_deref(),
        )?,
        None => {
            let mut plan = workspace.inventory(&args.environment, args.plan.as_deref())?;
            if let Some(strategy) = args.strategy {
                plan.strategy = strategy;
                plan.validate_for_restore().map_err(ConfigError::from)?;
            }
            plan
        }
    };
    Ok(plan)
}
