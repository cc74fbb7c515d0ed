mod canary;
mod cli;
mod compose;
mod config;
mod container;
mod deploy;
mod executor;
mod git;
mod model;
mod monitor;
mod output;
mod queue;
mod secrets;
mod ssh;
mod status;
mod store;
mod traefik;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use cli::{Cli, Command, SecretsAction};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup tracing
    let filter = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .without_time()
        .init();

    let config = config::DockyardConfig::load(&cli.config)?;

    match cli.command {
        Command::Deploy(args) => {
            cli::deploy::run(config, args).await?;
        }

        Command::Rollback { to } => {
            cli::rollback::run(config, to).await?;
        }

        Command::Cancel { id } => {
            cli::cancel::run(config, id).await?;
        }

        Command::Status { id } => {
            cli::status::run(config, id).await?;
        }

        Command::Canary { action } => {
            cli::canary::run(config, action).await?;
        }

        Command::Secrets { action } => match action {
            SecretsAction::Hash { preview } => {
                cli::secrets_cmd::hash(&config, preview)?;
            }
            SecretsAction::Flags { preview } => {
                cli::secrets_cmd::flags(&config, preview)?;
            }
            SecretsAction::Compose { file, preview } => {
                cli::secrets_cmd::compose(&config, &file, preview)?;
            }
        },
    }

    Ok(())
}
