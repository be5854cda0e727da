//! Status command implementation.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::Args;
use flotilla_core::{DeploymentRecord, TrafficState};
use flotilla_orchestrator::EnvironmentStatus;
use tracing::info;

use super::{OutputFormat, Workspace};

/// Arguments for the status command.
#[derive(Args)]
pub struct StatusArgs {
    /// Environment to inspect
    pub environment: String,

    /// Plan file to use instead of <config-dir>/<environment>.yaml
    #[arg(long)]
    pub plan: Option<PathBuf>,

    /// Output format (text, json)
    #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
}

/// Runs the status command.
pub async fn execute(workspace: &Workspace, args: &StatusArgs) -> Result<ExitCode> {
    info!(environment = %args.environment, "Checking environment status");

    let plan = workspace.inventory(&args.environment, args.plan.as_deref())?;
    let orchestrator = workspace.orchestrator(&plan)?;
    let status = orchestrator.status(&plan).await?;

    match args.format {
        OutputFormat::Text => print_text_status(&status),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&status)?),
    }
    Ok(ExitCode::SUCCESS)
}

fn print_text_status(status: &EnvironmentStatus) {
    println!("Environment: {}", status.environment);
    if let Some(slot) = status.active_slot {
        println!("Live slot:   {slot}");
    }
    if let Some(holder) = &status.lock_holder {
        println!("In progress: {holder}");
    }

    let active = status
        .servers
        .iter()
        .filter(|s| s.traffic_state == TrafficState::Active)
        .count();
    println!(
        "Servers:     {} ({active} active, {} out of rotation)",
        status.servers.len(),
        status.servers.len() - active
    );
    println!();

    for server in &status.servers {
        let icon = match server.traffic_state {
            TrafficState::Active => "✓",
            TrafficState::Draining => "⟳",
            TrafficState::Offline => "✗",
        };
        let slot = server.spec.slot.map(|s| s.to_string()).unwrap_or_default();
        println!(
            "  {icon} {:<16} {:<22} {:<6} {}",
            server.spec.id,
            server.spec.address,
            slot,
            server.traffic_state
        );
    }

    println!();
    print_record("Last success", status.last_success.as_ref());
    if status.latest != status.last_success {
        print_record("Latest run", status.latest.as_ref());
    }
}

fn print_record(label: &str, record: Option<&DeploymentRecord>) {
    match record {
        Some(record) => {
            println!(
                "{label}: {} {} ({}, finished {})",
                record.version,
                record.status,
                record.strategy,
                record.ended_at.format("%Y-%m-%d %H:%M:%S UTC")
            );
            if let Some(error) = &record.error {
                println!("  {error}");
            }
        }
        None => println!("{label}: none"),
    }
}
