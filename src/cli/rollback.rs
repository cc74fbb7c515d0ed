use anyhow::{bail, Context, Result};
use uuid::Uuid;

use crate::config::DockyardConfig;
use crate::model::{DeploymentRequest, DeploymentStatus, RollbackEvent};
use crate::output;

pub async fn run(config: DockyardConfig, to: Uuid) -> Result<()> {
    let store = super::open_store(&config).await?;

    let target = store
        .load(to)
        .await
        .with_context(|| format!("Deployment {} not found", to))?;
    if target.status != DeploymentStatus::Finished {
        bail!("Deployment {} is {}, only finished deployments can be restored", to, target.status);
    }
    let commit = target
        .commit_sha
        .clone()
        .context("Deployment has no recorded commit")?;

    let mut request = DeploymentRequest::new(&target.application, &target.server, &target.git_ref);
    request.commit = Some(commit.clone());
    request.pull_request_id = target.pull_request_id;
    request.only_this_server = true;

    // The deployment currently live on that server is the one being reverted.
    let live = store
        .list(Some(&target.application))
        .await?
        .into_iter()
        .rev()
        .find(|r| {
            r.status == DeploymentStatus::Finished
                && r.server == target.server
                && r.pull_request_id == target.pull_request_id
        });
    if let Some(live) = live.filter(|l| l.id != target.id) {
        request.rollback_of = Some(live.id);
        store
            .insert_rollback_event(RollbackEvent::pending(
                &target.application,
                live.id,
                request.id,
                "Manual rollback",
            ))
            .await?;
    }

    output::header(&format!(
        "Rolling back {} on {} to {}",
        target.application,
        target.server,
        &commit[..commit.len().min(12)]
    ));
    super::deploy::submit_and_wait(config, request).await
}
