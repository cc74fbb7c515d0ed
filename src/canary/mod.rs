//! Weighted traffic rollout between the running ("stable") container and a freshly
//! started ("canary") one.
//!
//! Routing lives in a Traefik dynamic config file; the rollout itself is persisted as
//! `canary.json` next to the releases so later `shift`, `promote` and `rollback`
//! invocations can pick it up.

use serde::{Deserialize, Serialize};

use crate::config::DeployConfig;
use crate::container;
use crate::deploy::context::{ContextDelta, DeploymentContext, Stage};
use crate::deploy::error::DeployError;
use crate::executor::{quote, write_file_command, ExecOptions, RemoteExecutor};
use crate::model::Application;
use crate::traefik::{self, Route, WeightedRouting};

pub const DEFAULT_PORT: u16 = 80;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanaryState {
    /// Share of traffic sent to the canary, 0..=100.
    pub canary_weight: u32,
    pub canary_container: String,
    pub stable_container: String,
}

impl CanaryState {
    pub fn new(canary_weight: u32, canary_container: &str, stable_container: &str) -> Self {
        Self {
            canary_weight: canary_weight.min(100),
            canary_container: canary_container.to_string(),
            stable_container: stable_container.to_string(),
        }
    }

    pub fn stable_weight(&self) -> u32 {
        stable_weight(self.canary_weight)
    }
}

/// Share left for the stable container, clamped at zero.
pub fn stable_weight(canary_weight: u32) -> u32 {
    100u32.saturating_sub(canary_weight)
}

/// First entry of `ports_exposes`, or 80.
pub fn backend_port(ports_exposes: Option<&str>) -> u16 {
    ports_exposes
        .and_then(|ports| ports.split(',').next())
        .and_then(|port| port.trim().parse().ok())
        .unwrap_or(DEFAULT_PORT)
}

pub fn state_path(application: &Application, deploy: &DeployConfig) -> String {
    format!("{}/{}/canary.json", deploy.deploy_to, application.name)
}

pub fn routing_path(application: &Application) -> String {
    traefik::dynamic_config_path(&format!("{}-canary", application.uuid()))
}

pub fn generate_canary_routing_config(
    application: &Application,
    canary_weight: u32,
    stable_weight: u32,
    canary_container: &str,
    stable_container: &str,
) -> Result<String, DeployError> {
    let route = application
        .fqdn
        .as_deref()
        .and_then(Route::from_fqdn)
        .ok_or_else(|| DeployError::fatal("Canary deployments need an fqdn to route."))?;

    let rendered = traefik::render_weighted_routing(&WeightedRouting {
        name: application.uuid(),
        route: &route,
        port: backend_port(application.ports_exposes.as_deref()),
        canary_weight: canary_weight.min(100),
        stable_weight,
        canary_container,
        stable_container,
    })?;
    Ok(rendered)
}

/// Commands that publish `state`: routing config first, then the state file.
pub fn apply_commands(
    application: &Application,
    deploy: &DeployConfig,
    state: &CanaryState,
) -> Result<Vec<String>, DeployError> {
    let routing = generate_canary_routing_config(
        application,
        state.canary_weight,
        state.stable_weight(),
        &state.canary_container,
        &state.stable_container,
    )?;
    let state_json = serde_json::to_string_pretty(state)?;

    Ok(vec![
        format!("mkdir -p {}", traefik::DYNAMIC_DIR),
        write_file_command(&routing_path(application), &routing),
        write_file_command(&state_path(application, deploy), &state_json),
    ])
}

fn clear_commands(application: &Application, deploy: &DeployConfig) -> Vec<String> {
    vec![
        format!("rm -f {}", quote(&routing_path(application))),
        format!("rm -f {}", quote(&state_path(application, deploy))),
    ]
}

fn remove_container_commands(deploy: &DeployConfig, name: &str) -> Vec<String> {
    container::shutdown_commands(name, deploy.mode.stop_timeout(), false)
}

/// All traffic to the canary; the former stable container is removed right away.
pub fn promote_commands(application: &Application, deploy: &DeployConfig, state: &CanaryState) -> Vec<String> {
    let mut commands = clear_commands(application, deploy);
    commands.extend(remove_container_commands(deploy, &state.stable_container));
    commands
}

/// All traffic back to stable; the canary container is removed.
pub fn rollback_commands(application: &Application, deploy: &DeployConfig, state: &CanaryState) -> Vec<String> {
    let mut commands = clear_commands(application, deploy);
    commands.extend(remove_container_commands(deploy, &state.canary_container));
    commands
}

/// Rollout state stored on the server, if a canary is active.
pub async fn load_state(
    exec: &dyn RemoteExecutor,
    application: &Application,
    deploy: &DeployConfig,
) -> Result<Option<CanaryState>, DeployError> {
    let output = exec
        .execute(
            &format!("cat {} 2>/dev/null || true", quote(&state_path(application, deploy))),
            &ExecOptions::default(),
        )
        .await?;
    let content = output.stdout.trim();
    if content.is_empty() {
        return Ok(None);
    }
    Ok(Some(serde_json::from_str(content)?))
}

/// Drives an active rollout outside of a deployment.
pub struct CanaryController<'a> {
    exec: &'a dyn RemoteExecutor,
    application: &'a Application,
    deploy: &'a DeployConfig,
}

impl<'a> CanaryController<'a> {
    pub fn new(exec: &'a dyn RemoteExecutor, application: &'a Application, deploy: &'a DeployConfig) -> Self {
        Self {
            exec,
            application,
            deploy,
        }
    }

    async fn active(&self) -> Result<CanaryState, DeployError> {
        load_state(self.exec, self.application, self.deploy)
            .await?
            .ok_or_else(|| {
                DeployError::fatal(format!(
                    "No canary rollout is active for {}.",
                    self.application.name
                ))
            })
    }

    async fn run_all(&self, commands: Vec<String>, ignore_errors: bool) -> Result<(), DeployError> {
        for command in commands {
            let opts = if ignore_errors {
                ExecOptions::hidden().ignore_errors()
            } else {
                ExecOptions::default()
            };
            let output = self.exec.execute(&command, &opts).await?;
            if !output.success() && !ignore_errors {
                return Err(DeployError::Command {
                    command,
                    exit_code: output.exit_code,
                    output: output.stdout.trim().to_string(),
                });
            }
        }
        Ok(())
    }

    /// Route `weight` percent to the canary.
    pub async fn shift(&self, weight: u32) -> Result<CanaryState, DeployError> {
        let mut state = self.active().await?;
        state.canary_weight = weight.min(100);
        self.run_all(apply_commands(self.application, self.deploy, &state)?, false)
            .await?;
        Ok(state)
    }

    pub async fn promote(&self) -> Result<CanaryState, DeployError> {
        let state = self.active().await?;
        self.run_all(promote_commands(self.application, self.deploy, &state), true)
            .await?;
        Ok(state)
    }

    pub async fn rollback(&self) -> Result<CanaryState, DeployError> {
        let state = self.active().await?;
        self.run_all(rollback_commands(self.application, self.deploy, &state), true)
            .await?;
        Ok(state)
    }
}

/// Remember the running container before the canary starts so a rollback has a target.
///
/// Yields no canary state when nothing is running yet; the deployment then proceeds
/// as a regular rollout.
pub async fn capture_stable_container_for_canary(
    ctx: &DeploymentContext,
    exec: &dyn RemoteExecutor,
) -> Result<ContextDelta, DeployError> {
    let mut stage = Stage::new(ctx, exec);

    if load_state(exec, &ctx.application, &ctx.deploy).await?.is_some() {
        return Err(DeployError::fatal(format!(
            "A canary rollout is already active for {}. Promote or roll it back before deploying.",
            ctx.application.name
        )));
    }

    let running = container::running_containers(&mut stage).await?;
    let new_container = ctx.container_name();
    let Some(stable) = running.into_iter().find(|name| *name != new_container) else {
        stage
            .info("No running container to compare against, deploying without canary.")
            .await?;
        return Ok(stage.finish());
    };

    let state = CanaryState::new(
        u32::from(ctx.application.settings.canary_weight),
        &new_container,
        &stable,
    );
    stage
        .info(&format!(
            "Canary rollout: {}% to {}, {}% to {}.",
            state.canary_weight,
            state.canary_container,
            state.stable_weight(),
            state.stable_container
        ))
        .await?;
    stage.delta().canary = Some(Some(state));
    Ok(stage.finish())
}

/// Publish routing for the captured canary once the new container is healthy.
pub async fn start_canary(ctx: &DeploymentContext, exec: &dyn RemoteExecutor) -> Result<ContextDelta, DeployError> {
    let mut stage = Stage::new(ctx, exec);
    let Some(state) = &ctx.canary else {
        return Ok(stage.finish());
    };

    for command in apply_commands(&ctx.application, &ctx.deploy, state)? {
        stage.run(&command, ExecOptions::hidden()).await?;
    }
    stage
        .info(&format!(
            "Canary is live with {}% of traffic. Use `dockyard canary promote` or `dockyard canary rollback` to finish.",
            state.canary_weight
        ))
        .await?;
    Ok(stage.finish())
}
