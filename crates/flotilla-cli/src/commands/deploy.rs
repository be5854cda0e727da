//! Deploy command implementation.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::Args;
use flotilla_core::Strategy;
use flotilla_orchestrator::{DeploymentReport, Phase};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::{OutputFormat, Workspace};

/// Arguments for the deploy command.
#[derive(Args)]
pub struct DeployArgs {
    /// Environment to deploy to
    pub environment: String,

    /// Version to roll out
    pub version: String,

    /// Override the plan's strategy (rolling, canary, blue-green)
    #[arg(short, long)]
    pub strategy: Option<Strategy>,

    /// Plan file to use instead of <config-dir>/<environment>.yaml
    #[arg(long)]
    pub plan: Option<PathBuf>,

    /// Show the rollout phases without touching any server
    #[arg(long)]
    pub dry_run: bool,

    /// Output format (text, json)
    #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PhaseView {
    name: String,
    gated: bool,
    batches: Vec<Vec<String>>,
}

impl From<&Phase> for PhaseView {
    fn from(phase: &Phase) -> Self {
        Self {
            name: phase.name.clone(),
            gated: phase.gated,
            batches: phase.batches.iter().map(flotilla_orchestrator::Batch::ids).collect(),
        }
    }
}

/// Runs the deploy command.
pub async fn execute(workspace: &Workspace, args: DeployArgs) -> Result<ExitCode> {
    let plan = workspace.plan(
        &args.environment,
        &args.version,
        args.strategy,
        args.plan.as_deref(),
    )?;
    let orchestrator = workspace.orchestrator(&plan)?;

    if args.dry_run {
        let phases = orchestrator.preview(&plan).await?;
        print_phases(&plan.environment, &plan.target_version, &phases, args.format)?;
        return Ok(ExitCode::SUCCESS);
    }

    info!(
        environment = %plan.environment,
        version = %plan.target_version,
        strategy = %plan.strategy,
        servers = plan.servers.len(),
        "Starting deployment"
    );

    let cancel = CancellationToken::new();
    let interrupt = tokio::spawn(cancel_on_interrupt(cancel.clone()));
    let result = orchestrator.deploy(plan, cancel).await;
    interrupt.abort();

    let report = result?;
    match args.format {
        OutputFormat::Text => print_report(&report),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
    }
    Ok(ExitCode::from(report.exit_code()))
}

async fn cancel_on_interrupt(cancel: CancellationToken) {
    if tokio::signal::ctrl_c().await.is_ok() {
        warn!("Interrupt received, cancelling deployment");
        cancel.cancel();
    }
}

fn print_phases(
    environment: &str,
    version: &str,
    phases: &[Phase],
    format: OutputFormat,
) -> Result<()> {
    match format {
        OutputFormat::Text => {
            println!("Rollout of {version} to {environment} (dry run)");
            println!();
            for phase in phases {
                println!("{phase}");
            }
        }
        OutputFormat::Json => {
            let views: Vec<PhaseView> = phases.iter().map(PhaseView::from).collect();
            println!("{}", serde_json::to_string_pretty(&views)?);
        }
    }
    Ok(())
}

fn print_report(report: &DeploymentReport) {
    let record = &report.record;
    let icon = if report.is_success() { "✓" } else { "✗" };

    println!(
        "{icon} {} {} → {} ({})",
        record.environment, record.version, report.final_state, record.strategy
    );
    println!("  Deployment: {}", record.id);
    println!(
        "  Batches:    {}/{}",
        report.batches_completed, report.batches_total
    );
    if let Some(slot) = record.active_slot {
        println!("  Live slot:  {slot}");
    }
    if let Some(decision) = &report.decision {
        println!("  Rollback:   {decision}");
    }
    if let Some(failure) = &report.failure {
        println!("  Failure:    {} - {}", failure.kind, failure.message);
    }

    println!();
    for server in &report.servers {
        println!(
            "  {:<16} {:<10} {:<12} {}",
            server.spec.id,
            server.traffic_state,
            server.deploy_state,
            server.version.as_deref().unwrap_or("-")
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flotilla_core::ServerSpec;
    use flotilla_orchestrator::strategy::partition;

    #[test]
    fn test_phase_view() {
        let servers = vec![
            ServerSpec::new("web-1", "10.0.0.1:8080"),
            ServerSpec::new("web-2", "10.0.0.2:8080"),
            ServerSpec::new("web-3", "10.0.0.3:8080"),
        ];
        let phase = Phase {
            name: "rolling".to_string(),
            batches: partition(&servers, 2),
            gated: false,
        };

        let view = serde_json::to_value(PhaseView::from(&phase)).unwrap();
        assert_eq!(view["name"], "rolling");
        assert_eq!(view["batches"][0].as_array().unwrap().len(), 2);
        assert_eq!(view["batches"][1][0], "web-3");
    }
}
