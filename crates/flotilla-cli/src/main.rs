//! Flotilla CLI - rolls new versions across a server fleet.
//!
//! Exit codes: `0` when the run succeeded, `1` when it failed or was
//! rolled back, `2` when the configuration or arguments were invalid.

use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod commands;

use commands::{Cli, Commands, LogFormat};
use flotilla_core::ConfigError;
use flotilla_orchestrator::OrchestratorError;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let workspace = cli.workspace();
    let result = match cli.command {
        Commands::Deploy(args) => commands::deploy::execute(&workspace, args).await,
        Commands::Rollback(args) => commands::rollback::execute(&workspace, &args).await,
        Commands::Status(args) => commands::status::execute(&workspace, &args).await,
        Commands::Validate(args) => commands::validate::run(&workspace, &args),
        Commands::Version => {
            println!("flotilla {}", env!("CARGO_PKG_VERSION"));
            Ok(ExitCode::SUCCESS)
        }
    };

    result.unwrap_or_else(|err| {
        eprintln!("error: {err:#}");
        ExitCode::from(exit_code(&err))
    })
}

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "flotilla=info".into());

    match format {
        LogFormat::Text => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init(),
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .init(),
    }
}

/// Maps an error to the process exit code.
fn exit_code(err: &anyhow::Error) -> u8 {
    if let Some(err) = err.downcast_ref::<OrchestratorError>() {
        return err.exit_code();
    }
    if err.downcast_ref::<ConfigError>().is_some() {
        return 2;
    }
    1
}

#[cfg(test)]
mod tests {
    use super::*;
    use flotilla_core::ValidationErrors;

    #[test]
    fn test_exit_code_for_config_error() {
        let err = anyhow::Error::new(ConfigError::PlanNotFound {
            environment: "prod".to_string(),
            dir: "deploy".into(),
        });
        assert_eq!(exit_code(&err), 2);

        let wrapped = anyhow::Error::new(ConfigError::Invalid(ValidationErrors::new()))
            .context("loading plan");
        assert_eq!(exit_code(&wrapped), 2);
    }

    #[test]
    fn test_exit_code_for_orchestrator_error() {
        let err = anyhow::Error::new(OrchestratorError::NoRollbackTarget {
            environment: "prod".to_string(),
        });
        assert_eq!(exit_code(&err), 1);

        let config = anyhow::Error::new(OrchestratorError::Configuration(
            ConfigError::PlanNotFound {
                environment: "prod".to_string(),
                dir: "deploy".into(),
            },
        ));
        assert_eq!(exit_code(&config), 2);
    }

    #[test]
    fn test_exit_code_for_other_errors() {
        let err = anyhow::anyhow!("disk full");
        assert_eq!(exit_code(&err), 1);
    }
}
