//! Image build, container start and teardown on the target server.

pub mod health;

use tracing::debug;

use crate::deploy::context::{ContextDelta, DeploymentContext, Stage};
use crate::deploy::error::DeployError;
use crate::executor::{quote, ExecOptions, RemoteExecutor};
use crate::model::{BuildPack, LogEntry};
use crate::secrets::{BuildSecretProvisioner, BuildSecretSet, DockerEnvFlags};

/// `docker stop` (and `docker rm -f` unless `skip_remove`) for one container.
pub fn shutdown_commands(name: &str, timeout: u64, skip_remove: bool) -> Vec<String> {
    let name = quote(name);
    let mut commands = vec![format!("docker stop -t {} {}", timeout, name)];
    if !skip_remove {
        commands.push(format!("docker rm -f {}", name));
    }
    commands
}

/// Stop and remove a container. Failures are logged on the deployment, never returned,
/// except for cancellation.
pub async fn graceful_shutdown(stage: &mut Stage<'_>, name: &str, skip_remove: bool) -> Result<(), DeployError> {
    let timeout = stage.ctx().deploy.mode.stop_timeout();
    for command in shutdown_commands(name, timeout, skip_remove) {
        match stage.run(&command, ExecOptions::hidden().ignore_errors()).await {
            Ok(_) => {}
            Err(e) if e.is_cancelled() => return Err(e),
            Err(e) => {
                stage
                    .log(LogEntry::error(format!("Error stopping container {}: {}", name, e)))
                    .await?;
                return Ok(());
            }
        }
    }
    Ok(())
}

fn label_filter(ctx: &DeploymentContext) -> String {
    format!(
        "--filter label=dockyard.application={} --filter label=dockyard.pull_request={}",
        quote(ctx.application.uuid()),
        ctx.request.pull_request_id
    )
}

/// Names of the application's running containers, newest first.
pub async fn running_containers(stage: &mut Stage<'_>) -> Result<Vec<String>, DeployError> {
    let command = format!("docker ps {} --format '{{{{.Names}}}}'", label_filter(stage.ctx()));
    let output = stage.run(&command, ExecOptions::default()).await?;
    Ok(output
        .stdout
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect())
}

/// Containers of this application that belong to other deployments, running or not.
async fn previous_containers(stage: &mut Stage<'_>) -> Result<Vec<String>, DeployError> {
    let ctx = stage.ctx();
    if ctx.uses_fixed_container_name() {
        return Ok(vec![ctx.container_name()]);
    }

    let command = format!(
        "docker ps -a {} --format '{{{{.Names}}}}\t{{{{.Label \"dockyard.deployment\"}}}}'",
        label_filter(ctx)
    );
    let output = stage.run(&command, ExecOptions::default()).await?;
    let current = ctx.deployment_id().to_string();
    Ok(output
        .stdout
        .lines()
        .filter_map(|line| {
            let (name, deployment) = line.split_once('\t').unwrap_or((line, ""));
            let name = name.trim();
            (!name.is_empty() && deployment.trim() != current).then(|| name.to_string())
        })
        .collect())
}

/// Containers started by this deployment.
pub async fn new_containers(stage: &mut Stage<'_>) -> Result<Vec<String>, DeployError> {
    let ctx = stage.ctx();
    if ctx.application.build_pack != BuildPack::Dockercompose {
        return Ok(vec![ctx.container_name()]);
    }
    let command = format!(
        "docker ps -a --filter label=com.docker.compose.project={} --format '{{{{.Names}}}}'",
        quote(&ctx.project_name())
    );
    let output = stage.run(&command, ExecOptions::default()).await?;
    Ok(output
        .stdout
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect())
}

async fn remove_previous(stage: &mut Stage<'_>) -> Result<(), DeployError> {
    let previous = previous_containers(stage).await?;
    if previous.is_empty() {
        return Ok(());
    }
    stage.info("Removing old containers.").await?;
    for name in &previous {
        graceful_shutdown(stage, name, false).await?;
    }
    stage.delta().previous_containers = Some(previous);
    Ok(())
}

/// Retire the previous containers once the new version is healthy (or `force`).
/// An unhealthy new version is removed instead and the deployment fails.
///
/// Cleanup errors are only warnings while the new version is healthy.
pub async fn stop_running_container(
    ctx: &DeploymentContext,
    exec: &dyn RemoteExecutor,
    force: bool,
) -> Result<ContextDelta, DeployError> {
    let mut stage = Stage::new(ctx, exec);

    if ctx.new_version_healthy || force {
        if let Err(e) = remove_previous(&mut stage).await {
            if e.is_cancelled() {
                return Err(e);
            }
            let message = format!("Failed to clean up old containers: {}", e);
            if !ctx.new_version_healthy {
                return Err(DeployError::fatal(message));
            }
            stage.warn(&message).await?;
        }
        return Ok(stage.finish());
    }

    stage
        .log(LogEntry::error(
            "New container is not healthy, rolling back to the old container.",
        ))
        .await?;
    if matches!(
        ctx.application.build_pack,
        BuildPack::Dockerfile | BuildPack::Dockerimage
    ) {
        stage
            .warn(
                "Make sure the image can report its health: the HEALTHCHECK needs curl, wget or nc \
                 inside the container, otherwise it never becomes healthy.",
            )
            .await?;
    }

    let removal: Result<(), DeployError> = async {
        for name in new_containers(&mut stage).await? {
            graceful_shutdown(&mut stage, &name, false).await?;
        }
        Ok(())
    }
    .await;
    if let Err(e) = removal {
        if e.is_cancelled() {
            return Err(e);
        }
        return Err(DeployError::fatal(format!(
            "Failed to remove unhealthy container: {}",
            e
        )));
    }

    Err(DeployError::fatal(
        "New container is not healthy. The old container is still running.",
    ))
}

fn compose_command(ctx: &DeploymentContext) -> String {
    format!(
        "docker compose --project-name {} --env-file {} -f {}",
        quote(&ctx.project_name()),
        quote(&ctx.env_file()),
        quote(&ctx.compose_path())
    )
}

/// Bring the new release up from its compose manifest.
pub async fn start_by_compose_file(
    ctx: &DeploymentContext,
    exec: &dyn RemoteExecutor,
) -> Result<ContextDelta, DeployError> {
    let mut stage = Stage::new(ctx, exec);
    let compose = compose_command(ctx);

    stage.info("Starting new container.").await?;
    stage
        .run(&format!("touch {}", quote(&ctx.env_file())), ExecOptions::hidden())
        .await?;

    if ctx.application.build_pack == BuildPack::Dockerimage {
        stage.info("Pulling latest image.").await?;
        stage
            .run(&format!("{} pull", compose), ExecOptions::default())
            .await
            .map_err(|e| fatal_unless_cancelled(e, "Failed to pull image"))?;
    }

    let up = if ctx.build_server.is_some() {
        // The image was built elsewhere and loaded onto this server.
        format!("{} up -d --no-build --remove-orphans", compose)
    } else {
        format!("{} up -d --remove-orphans", compose)
    };
    stage
        .run(&format!("cd {} && {}", quote(&ctx.workdir()), up), ExecOptions::default())
        .await
        .map_err(|e| fatal_unless_cancelled(e, "Failed to start new container"))?;

    stage.info("New container started.").await?;
    Ok(stage.finish())
}

fn fatal_unless_cancelled(error: DeployError, what: &str) -> DeployError {
    if error.is_cancelled() {
        error
    } else {
        DeployError::fatal(format!("{}: {}", what, error))
    }
}

/// Build command run inside the helper container for the dockerfile pack.
pub fn dockerfile_build_command(
    ctx: &DeploymentContext,
    set: &BuildSecretSet,
) -> Result<String, DeployError> {
    let mut provisioner = BuildSecretProvisioner::new(
        ctx.application.settings.build_secrets,
        &ctx.deploy.signing_key,
        &[],
        Some(set.clone()),
    );
    let (env, build_flags) = match provisioner.generate_docker_env_flags()? {
        Some(env) => (env, provisioner.generate_build_secrets()?),
        None => (DockerEnvFlags::for_set(set), set.build_arg_flags()),
    };

    let inner = format!(
        "cd /artifacts && DOCKER_BUILDKIT=1 docker build {} --network host -f {} -t {} .",
        build_flags,
        quote(&ctx.application.dockerfile),
        quote(&ctx.image_name())
    );
    let run = format!(
        "docker run --rm --network host -v /var/run/docker.sock:/var/run/docker.sock -v {}:/artifacts {} {} sh -c {}",
        quote(&ctx.workdir()),
        env.flags,
        quote(&ctx.deploy.helper_image),
        quote(&inner)
    );
    Ok(join_exports(&env.exports, &run))
}

/// `docker compose build` for the dockercompose pack; compose reads the secrets from
/// its own environment.
pub fn compose_build_command(ctx: &DeploymentContext, set: &BuildSecretSet) -> String {
    let build = format!(
        "cd {} && {} build",
        quote(&ctx.workdir()),
        compose_command(ctx)
    );
    join_exports(&set.env_exports(), &build)
}

fn join_exports(exports: &str, command: &str) -> String {
    if exports.is_empty() {
        command.to_string()
    } else {
        format!("{} {}", exports, command)
    }
}

/// Build the release image. Commands carrying variable values are hidden.
///
/// With a dedicated build server the image is built there and streamed to the
/// target with `docker save | docker load`.
pub async fn build_image(
    ctx: &DeploymentContext,
    exec: &dyn RemoteExecutor,
    build_exec: Option<&dyn RemoteExecutor>,
) -> Result<ContextDelta, DeployError> {
    let mut stage = Stage::new(ctx, exec);
    let empty = BuildSecretSet::from_variables(std::iter::empty(), &ctx.deploy.signing_key)?;
    let set = ctx.build_secrets.as_ref().unwrap_or(&empty);

    let command = match ctx.application.build_pack {
        BuildPack::Dockerimage => {
            debug!("Skipping build for image {}", ctx.image_name());
            return Ok(stage.finish());
        }
        BuildPack::Dockerfile => dockerfile_build_command(ctx, set)?,
        BuildPack::Dockercompose => compose_build_command(ctx, set),
    };
    let opts = if set.is_empty() {
        ExecOptions::default()
    } else {
        ExecOptions::hidden()
    };

    match (build_exec, &ctx.build_server) {
        (Some(builder), Some(server)) if ctx.application.build_pack == BuildPack::Dockerfile => {
            stage
                .info(&format!("Building image {} on {}.", ctx.image_name(), server.name))
                .await?;
            let mut remote = Stage::new(ctx, builder);
            remote
                .run(&command, opts)
                .await
                .map_err(|e| fatal_unless_cancelled(e, "Failed to build image"))?;
            let transfer = format!(
                "docker save {} | ssh -o StrictHostKeyChecking=no -o ConnectTimeout=30 {}{}@{} docker load",
                quote(&ctx.image_name()),
                ctx.server.port.map(|p| format!("-p {} ", p)).unwrap_or_default(),
                ctx.server.user(),
                ctx.server.address
            );
            remote
                .run(&transfer, ExecOptions::default())
                .await
                .map_err(|e| fatal_unless_cancelled(e, "Failed to transfer image"))?;
        }
        _ => {
            stage
                .info(&format!("Building image {}.", ctx.image_name()))
                .await?;
            stage
                .run(&command, opts)
                .await
                .map_err(|e| fatal_unless_cancelled(e, "Failed to build image"))?;
        }
    }

    stage.info("Image built.").await?;
    Ok(stage.finish())
}
