use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

use crate::config::DockyardConfig;
use crate::store::{DeploymentStore, FileStore};

pub mod canary;
pub mod cancel;
pub mod deploy;
pub mod rollback;
pub mod secrets_cmd;
pub mod status;

#[derive(Parser)]
#[command(name = "dockyard", version, about = "Deploy Docker apps to your own servers")]
pub struct Cli {
    /// Path to dockyard.toml
    #[arg(short, long, default_value = "dockyard.toml")]
    pub config: PathBuf,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Deploy the application
    Deploy(DeployArgs),

    /// Redeploy the commit of an earlier deployment
    Rollback {
        /// Deployment to return to
        #[arg(long)]
        to: uuid::Uuid,
    },

    /// Cancel a queued or running deployment
    Cancel {
        /// Deployment id
        id: uuid::Uuid,
    },

    /// List deployments, or show one with its logs
    Status {
        /// Deployment id
        id: Option<uuid::Uuid>,
    },

    /// Drive an active canary rollout
    Canary {
        #[command(subcommand)]
        action: CanaryAction,
    },

    /// Inspect build secrets derived from the configured variables
    Secrets {
        #[command(subcommand)]
        action: SecretsAction,
    },
}

#[derive(clap::Args)]
pub struct DeployArgs {
    /// Branch or tag to deploy (defaults to app.branch)
    #[arg(long = "ref")]
    pub git_ref: Option<String>,

    /// Pull request number for a preview deployment
    #[arg(long, default_value = "0")]
    pub pr: u64,

    /// Target server (defaults to the first configured)
    #[arg(short, long)]
    pub server: Option<String>,

    /// Replace the old container even if the new one is not healthy
    #[arg(long)]
    pub force_restart: bool,

    /// Skip the additional destinations
    #[arg(long)]
    pub only_this_server: bool,
}

#[derive(Subcommand)]
pub enum CanaryAction {
    /// Route a new share of traffic to the canary
    Shift {
        /// Percentage of traffic for the canary (0-100)
        #[arg(short, long)]
        weight: u32,
        #[arg(short, long)]
        server: Option<String>,
    },
    /// Send all traffic to the canary and remove the old container
    Promote {
        #[arg(short, long)]
        server: Option<String>,
    },
    /// Send all traffic back to the stable container and remove the canary
    Rollback {
        #[arg(short, long)]
        server: Option<String>,
    },
}

#[derive(Subcommand)]
pub enum SecretsAction {
    /// Print the build secrets hash
    Hash {
        /// Use the preview partition
        #[arg(long)]
        preview: bool,
    },
    /// Print the flags handed to the builder
    Flags {
        #[arg(long)]
        preview: bool,
    },
    /// Print a compose file with build secrets injected
    Compose {
        /// Compose file to read
        file: PathBuf,
        #[arg(long)]
        preview: bool,
    },
}

/// Deployment records live next to the config, under `deploy.state_dir`.
pub(crate) async fn open_store(config: &DockyardConfig) -> Result<Arc<dyn DeploymentStore>> {
    let store = FileStore::open(&config.deploy.state_dir)
        .await
        .with_context(|| {
            format!(
                "Failed to open deployment store at {}",
                config.deploy.state_dir.display()
            )
        })?;
    Ok(Arc::new(store))
}
