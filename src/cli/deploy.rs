use anyhow::{bail, Result};
use std::sync::Arc;

use crate::config::DockyardConfig;
use crate::deploy::engine::{Engine, LogNotifier, SshConnector};
use crate::model::{DeploymentRequest, DeploymentStatus};
use crate::output;
use crate::store::DeploymentStore;

use super::status::{print_logs, print_summary};
use super::DeployArgs;

pub async fn run(config: DockyardConfig, args: DeployArgs) -> Result<()> {
    let server = config.server(args.server.as_deref())?.name.clone();
    let git_ref = args.git_ref.unwrap_or_else(|| config.app.branch.clone());

    let mut request = DeploymentRequest::new(&config.app.name, &server, &git_ref);
    request.pull_request_id = args.pr;
    request.force_restart = args.force_restart;
    request.only_this_server = args.only_this_server;

    output::header(&format!(
        "Deploying {}@{} to {}",
        config.app.name, git_ref, server
    ));
    submit_and_wait(config, request).await
}

/// Queue `request`, wait for it and everything it triggers, then report.
pub(crate) async fn submit_and_wait(config: DockyardConfig, request: DeploymentRequest) -> Result<()> {
    let app = config.app.name.clone();
    let store = super::open_store(&config).await?;
    let engine = Engine::new(
        config,
        store.clone(),
        Arc::new(SshConnector),
        Arc::new(LogNotifier),
    );

    let id = engine.submit(request).await?;
    output::info(&format!("Deployment {} queued", id));

    let spinner = output::create_spinner("Deploying...");
    engine.wait().await;
    spinner.finish_and_clear();

    let record = store.load(id).await?;
    print_logs(&record);
    println!();

    let followups: Vec<_> = store
        .list(Some(&app))
        .await?
        .into_iter()
        .filter(|r| r.id != id && r.created_at >= record.created_at)
        .collect();
    if !followups.is_empty() {
        output::info("Triggered deployments:");
        for r in &followups {
            print_summary(r);
        }
        println!();
    }

    report(store.as_ref(), id).await
}

async fn report(store: &dyn DeploymentStore, id: uuid::Uuid) -> Result<()> {
    let record = store.load(id).await?;
    match record.status {
        DeploymentStatus::Finished => {
            output::success(&format!(
                "Deploy complete! {} is live.",
                record.container_name.as_deref().unwrap_or(&record.application)
            ));
            Ok(())
        }
        DeploymentStatus::CancelledByUser => {
            output::warning("Deployment was cancelled");
            Ok(())
        }
        status => {
            output::error(record.failure_reason.as_deref().unwrap_or("No reason recorded"));
            bail!("Deployment {} {}", id, status)
        }
    }
}
