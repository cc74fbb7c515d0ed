pub mod context;
pub mod engine;
pub mod error;

use tracing::{error, info, warn};

use crate::canary;
use crate::compose;
use crate::container::{self, health};
use crate::executor::RemoteExecutor;
use crate::git;
use crate::model::{BuildPack, DeploymentStatus, LogEntry};
use crate::secrets;
use crate::status::DeploymentStatusMachine;

use context::DeploymentContext;
use error::{DeployError, CANCELLED_MESSAGE};

/// Run one deployment to completion and return the status it ended in.
///
/// Stage failures never escape: they end the deployment as `failed` (or
/// `cancelled-by-user`). `Err` means the store itself could not be updated.
pub async fn run(
    ctx: &mut DeploymentContext,
    exec: &dyn RemoteExecutor,
    build_exec: Option<&dyn RemoteExecutor>,
    machine: &DeploymentStatusMachine,
) -> Result<DeploymentStatus, DeployError> {
    let id = ctx.deployment_id();

    match pipeline(ctx, exec, build_exec, machine).await {
        Ok(()) => {
            machine.complete_deployment(ctx).await?;
        }
        Err(e) if e.is_cancelled() => {
            warn!("Deployment {} was cancelled", id);
            ctx.store
                .append_log(id, LogEntry::warning(CANCELLED_MESSAGE))
                .await?;
        }
        Err(e) => {
            error!("Deployment {} failed: {}", id, e);
            machine.fail_deployment(ctx, &e.to_string()).await?;
        }
    }

    let status = ctx.store.status(id).await?;
    info!("Deployment {} ended {}", id, status);
    Ok(status)
}

async fn pipeline(
    ctx: &mut DeploymentContext,
    exec: &dyn RemoteExecutor,
    build_exec: Option<&dyn RemoteExecutor>,
    machine: &DeploymentStatusMachine,
) -> Result<(), DeployError> {
    machine.start(ctx).await?;

    if ctx.application.build_pack == BuildPack::Dockerimage {
        // Image-only apps have no repository to resolve or check out.
        ctx.store
            .append_log(
                ctx.deployment_id(),
                LogEntry::info(format!("Deploying image {}.", ctx.image_name())),
            )
            .await?;
    } else {
        // Step 1: Pin the ref to a commit
        let delta = git::resolve_commit(ctx, exec).await?;
        ctx.apply(delta);
        machine.set_progress(ctx, 10).await?;

        // Step 2: Clone and import env templates
        let delta = git::clone_repository(ctx, exec).await?;
        ctx.apply(delta);
    }
    machine.set_progress(ctx, 20).await?;

    // Step 3: Partition variables into build secrets
    let delta = secrets::provision(ctx, exec).await?;
    ctx.apply(delta);

    // Step 4: Compose manifest and .env
    let delta = compose::write_manifest(ctx, exec).await?;
    ctx.apply(delta);
    machine.set_progress(ctx, 30).await?;

    // Step 5: Build
    let delta = container::build_image(ctx, exec, build_exec).await?;
    ctx.apply(delta);
    machine.set_progress(ctx, 50).await?;

    let canary_rollout = ctx.application.settings.canary && !ctx.uses_fixed_container_name();
    if canary_rollout {
        let delta = canary::capture_stable_container_for_canary(ctx, exec).await?;
        ctx.apply(delta);
    }

    // Step 6: Start the new container. A fixed name has to be free first.
    if ctx.uses_fixed_container_name() {
        let delta = container::stop_running_container(ctx, exec, true).await?;
        ctx.apply(delta);
    }
    let delta = container::start_by_compose_file(ctx, exec).await?;
    ctx.apply(delta);
    machine.set_progress(ctx, 70).await?;

    // Step 7: Health check
    let delta = health::check(ctx, exec).await?;
    ctx.apply(delta);
    machine.set_progress(ctx, 85).await?;

    // Step 8: Hand traffic over
    if ctx.canary.is_some() && ctx.new_version_healthy {
        let delta = canary::start_canary(ctx, exec).await?;
        ctx.apply(delta);
    } else if !ctx.uses_fixed_container_name() {
        let delta = container::stop_running_container(ctx, exec, ctx.request.force_restart).await?;
        ctx.apply(delta);
    } else if !ctx.new_version_healthy {
        return Err(DeployError::fatal("New container is not healthy."));
    }

    Ok(())
}
