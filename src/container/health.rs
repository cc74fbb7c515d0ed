use tracing::debug;

use crate::deploy::context::{ContextDelta, DeploymentContext, Stage};
use crate::deploy::error::DeployError;
use crate::executor::{quote, ExecOptions, RemoteExecutor};

use super::new_containers;

/// `docker inspect` template printing the health status, or the plain state when
/// the image defines no HEALTHCHECK.
pub const STATUS_FORMAT: &str =
    "{{if .State.Health}}{{.State.Health.Status}}{{else}}{{.State.Status}}{{end}}";

pub fn inspect_command(container: &str) -> String {
    format!("docker inspect --format '{}' {}", STATUS_FORMAT, quote(container))
}

/// Poll the new containers until all report `healthy`.
///
/// `unhealthy` ends the check early; running out of retries counts as unhealthy.
/// With health checks disabled a container only has to be running.
pub async fn check(ctx: &DeploymentContext, exec: &dyn RemoteExecutor) -> Result<ContextDelta, DeployError> {
    let mut stage = Stage::new(ctx, exec);
    let hc = &ctx.deploy.health_check;
    let containers = new_containers(&mut stage).await?;

    if containers.is_empty() {
        stage.warn("No new container found to check.").await?;
        stage.delta().new_version_healthy = Some(false);
        return Ok(stage.finish());
    }

    let mut healthy = true;
    for container in &containers {
        let verdict = if hc.enabled {
            wait_until_healthy(&mut stage, container).await?
        } else {
            let status = inspect(&mut stage, container).await?;
            status == "running"
        };
        if !verdict {
            healthy = false;
            break;
        }
    }

    if healthy {
        stage.info("New container is healthy.").await?;
    }
    stage.delta().new_version_healthy = Some(healthy);
    stage.delta().new_containers = Some(containers);
    Ok(stage.finish())
}

async fn inspect(stage: &mut Stage<'_>, container: &str) -> Result<String, DeployError> {
    let output = stage
        .run(&inspect_command(container), ExecOptions::default().ignore_errors())
        .await?;
    Ok(output.stdout.trim().to_string())
}

async fn wait_until_healthy(stage: &mut Stage<'_>, container: &str) -> Result<bool, DeployError> {
    let hc = &stage.ctx().deploy.health_check;
    let (retries, interval) = (hc.retries, hc.interval());

    stage
        .info(&format!("Waiting for health check of {} to pass.", container))
        .await?;
    for attempt in 1..=retries {
        let status = inspect(stage, container).await?;
        stage
            .info(&format!(
                "Attempt {} of {} | Healthcheck status: {}",
                attempt,
                retries,
                if status.is_empty() { "unknown" } else { status.as_str() }
            ))
            .await?;

        match status.as_str() {
            "healthy" => return Ok(true),
            "unhealthy" => return Ok(false),
            _ => debug!("{} is {} (attempt {}/{})", container, status, attempt, retries),
        }

        if attempt < retries {
            tokio::time::sleep(interval).await;
        }
    }

    stage
        .warn(&format!(
            "Health check of {} did not pass after {} attempts.",
            container, retries
        ))
        .await?;
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deploy::context::testing::context;
    use crate::executor::fake::ScriptedExecutor;

    #[tokio::test]
    async fn healthy_after_starting() {
        let ctx = context().await;
        let exec = ScriptedExecutor::new()
            .once("docker inspect", "starting")
            .on("docker inspect", "healthy");

        let delta = check(&ctx, &exec).await.unwrap();

        assert_eq!(delta.new_version_healthy, Some(true));
        assert_eq!(delta.new_containers, Some(vec![ctx.container_name()]));
        assert_eq!(exec.commands().len(), 2);
    }

    #[tokio::test]
    async fn unhealthy_stops_polling() {
        let ctx = context().await;
        let exec = ScriptedExecutor::new().on("docker inspect", "unhealthy");

        let delta = check(&ctx, &exec).await.unwrap();

        assert_eq!(delta.new_version_healthy, Some(false));
        assert_eq!(exec.commands().len(), 1);
    }

    #[tokio::test]
    async fn running_without_healthcheck_times_out() {
        let ctx = context().await;
        let exec = ScriptedExecutor::new().on("docker inspect", "running");

        let delta = check(&ctx, &exec).await.unwrap();

        assert_eq!(delta.new_version_healthy, Some(false));
        assert_eq!(exec.commands().len(), ctx.deploy.health_check.retries as usize);
        let record = ctx.store.load(ctx.deployment_id()).await.unwrap();
        assert!(record
            .visible_logs()
            .any(|e| e.message.contains("did not pass after 2 attempts")));
    }

    #[tokio::test]
    async fn disabled_check_only_needs_running() {
        let mut ctx = context().await;
        ctx.deploy.health_check.enabled = false;
        let exec = ScriptedExecutor::new().on("docker inspect", "running\n");

        let delta = check(&ctx, &exec).await.unwrap();
        assert_eq!(delta.new_version_healthy, Some(true));
    }

    #[test]
    fn inspect_quotes_container() {
        assert_eq!(
            inspect_command("shop-1"),
            "docker inspect --format '{{if .State.Health}}{{.State.Health.Status}}{{else}}{{.State.Status}}{{end}}' 'shop-1'"
        );
    }
}
