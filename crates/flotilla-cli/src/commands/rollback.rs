//! Rollback command implementation.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::Args;
use flotilla_orchestrator::RollbackOutcome;
use tracing::info;

use super::{OutputFormat, Workspace};

/// Arguments for the rollback command.
#[derive(Args)]
pub struct RollbackArgs {
    /// Environment to restore
    pub environment: String,

    /// Plan file to use instead of <config-dir>/<environment>.yaml
    #[arg(long)]
    pub plan: Option<PathBuf>,

    /// Output format (text, json)
    #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
}

/// Runs the rollback command.
pub async fn execute(workspace: &Workspace, args: &RollbackArgs) -> Result<ExitCode> {
    let plan = workspace.inventory(&args.environment, args.plan.as_deref())?;
    let orchestrator = workspace.orchestrator(&plan)?;

    info!(environment = %plan.environment, "Rolling back to last successful deployment");
    let outcome = orchestrator.rollback(plan).await?;

    match args.format {
        OutputFormat::Text => print_outcome(&outcome),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(outcome.record())?),
    }
    Ok(ExitCode::SUCCESS)
}

fn print_outcome(outcome: &RollbackOutcome) {
    let record = outcome.record();
    match outcome {
        RollbackOutcome::Restored(_) => {
            println!("✓ {} restored to {}", record.environment, record.version);
        }
        RollbackOutcome::AlreadyRestored(_) => {
            println!(
                "✓ {} already runs {}; nothing to do",
                record.environment, record.version
            );
        }
    }
    println!("  Record: {}", record.id);
    if let Some(target) = record.rollback_of {
        println!("  Restores deployment: {target}");
    }
    if let Some(slot) = record.active_slot {
        println!("  Live slot: {slot}");
    }
}
