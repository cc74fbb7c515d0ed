use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::canary::CanaryState;
use crate::config::DeployConfig;
use crate::executor::{CommandOutput, ExecOptions, RemoteExecutor};
use crate::model::{Application, DeploymentRequest, DeploymentStatus, EnvVariable, LogEntry, Server};
use crate::secrets::BuildSecretSet;
use crate::store::DeploymentStore;

use super::error::DeployError;

/// Everything a pipeline stage may read. Stages never mutate it directly; they
/// return a [`ContextDelta`] that the runner applies between stages.
pub struct DeploymentContext {
    pub request: DeploymentRequest,
    pub application: Application,
    pub server: Server,
    /// Dedicated server images are built on, when it is not `server` itself.
    pub build_server: Option<Server>,
    pub deploy: DeployConfig,
    pub store: Arc<dyn DeploymentStore>,
    /// Timestamped release name, `%Y%m%d-%H%M%S`.
    pub release: String,
    pub commit: Option<String>,
    pub commit_message: Option<String>,
    pub saved: HashMap<String, String>,
    pub build_secrets: Option<BuildSecretSet>,
    pub new_version_healthy: bool,
    pub previous_containers: Vec<String>,
    /// Containers started by this deployment, known after the health check.
    pub new_containers: Vec<String>,
    pub canary: Option<CanaryState>,
}

impl DeploymentContext {
    pub fn new(
        request: DeploymentRequest,
        application: Application,
        server: Server,
        deploy: DeployConfig,
        store: Arc<dyn DeploymentStore>,
    ) -> Self {
        let commit = request.commit.clone();
        Self {
            request,
            application,
            server,
            build_server: None,
            deploy,
            store,
            release: chrono::Local::now().format("%Y%m%d-%H%M%S").to_string(),
            commit,
            commit_message: None,
            saved: HashMap::new(),
            build_secrets: None,
            new_version_healthy: false,
            previous_containers: Vec::new(),
            new_containers: Vec::new(),
            canary: None,
        }
    }

    pub fn deployment_id(&self) -> Uuid {
        self.request.id
    }

    pub fn is_preview(&self) -> bool {
        self.request.is_preview()
    }

    pub fn app_path(&self) -> String {
        format!("{}/{}", self.deploy.deploy_to, self.application.name)
    }

    /// Working tree of this deployment on the server.
    pub fn workdir(&self) -> String {
        format!("{}/releases/{}", self.app_path(), self.release)
    }

    pub fn env_file(&self) -> String {
        format!("{}/.env", self.workdir())
    }

    /// Compose manifest the new container is started from.
    pub fn compose_path(&self) -> String {
        match self.application.build_pack {
            crate::model::BuildPack::Dockercompose => {
                format!("{}/{}", self.workdir(), self.application.compose_file)
            }
            _ => format!("{}/docker-compose.dockyard.yml", self.workdir()),
        }
    }

    pub fn project_name(&self) -> String {
        if self.application.settings.consistent_container_name {
            self.application.uuid().to_string()
        } else {
            format!("{}-{}", self.application.uuid(), self.release)
        }
    }

    /// Preview and consistent-name deployments reuse one container name, so the old
    /// container has to go before the new one can start.
    pub fn uses_fixed_container_name(&self) -> bool {
        self.is_preview() || self.application.settings.consistent_container_name
    }

    pub fn container_name(&self) -> String {
        if self.is_preview() {
            format!("{}-pr-{}", self.application.uuid(), self.request.pull_request_id)
        } else {
            self.project_name()
        }
    }

    pub fn image_name(&self) -> String {
        match self.application.build_pack {
            crate::model::BuildPack::Dockerimage => {
                self.application.image.clone().unwrap_or_default()
            }
            _ => {
                let tag = self
                    .commit
                    .as_deref()
                    .map(|c| &c[..12.min(c.len())])
                    .unwrap_or(self.release.as_str());
                format!("{}:{}", self.application.uuid(), tag)
            }
        }
    }

    /// Variables of the partition this deployment belongs to.
    pub fn variables(&self) -> Vec<EnvVariable> {
        self.application
            .variables_for(self.is_preview())
            .cloned()
            .collect()
    }

    pub fn apply(&mut self, delta: ContextDelta) {
        if let Some(commit) = delta.commit {
            self.commit = Some(commit);
        }
        if let Some(message) = delta.commit_message {
            self.commit_message = Some(message);
        }
        self.application.variables.extend(delta.new_variables);
        self.saved.extend(delta.saved);
        if let Some(set) = delta.build_secrets {
            self.build_secrets = Some(set);
        }
        if let Some(healthy) = delta.new_version_healthy {
            self.new_version_healthy = healthy;
        }
        if let Some(previous) = delta.previous_containers {
            self.previous_containers = previous;
        }
        if let Some(started) = delta.new_containers {
            self.new_containers = started;
        }
        if let Some(canary) = delta.canary {
            self.canary = canary;
        }
    }
}

/// Changes a stage wants applied to the context.
#[derive(Debug, Default)]
pub struct ContextDelta {
    pub commit: Option<String>,
    pub commit_message: Option<String>,
    pub new_variables: Vec<EnvVariable>,
    pub saved: HashMap<String, String>,
    pub build_secrets: Option<BuildSecretSet>,
    pub new_version_healthy: Option<bool>,
    pub previous_containers: Option<Vec<String>>,
    pub new_containers: Option<Vec<String>>,
    /// `Some(None)` clears the canary state.
    pub canary: Option<Option<CanaryState>>,
}

/// Remote-call and logging helper handed to each stage.
pub struct Stage<'a> {
    ctx: &'a DeploymentContext,
    exec: &'a dyn RemoteExecutor,
    delta: ContextDelta,
}

impl<'a> Stage<'a> {
    pub fn new(ctx: &'a DeploymentContext, exec: &'a dyn RemoteExecutor) -> Self {
        Self {
            ctx,
            exec,
            delta: ContextDelta::default(),
        }
    }

    pub fn ctx(&self) -> &'a DeploymentContext {
        self.ctx
    }

    pub fn executor(&self) -> &'a dyn RemoteExecutor {
        self.exec
    }

    pub fn delta(&mut self) -> &mut ContextDelta {
        &mut self.delta
    }

    pub fn finish(self) -> ContextDelta {
        self.delta
    }

    /// Run one remote command, log it, honour its flags, then check for cancellation.
    pub async fn run(&mut self, command: &str, opts: ExecOptions) -> Result<CommandOutput, DeployError> {
        let output = self.exec.execute(command, &opts).await?;

        self.log(
            LogEntry::info(command)
                .hidden(opts.hidden)
                .ignore_errors(opts.ignore_errors),
        )
        .await?;
        let stdout = output.stdout.trim();
        if !stdout.is_empty() {
            self.log(
                LogEntry::info(stdout)
                    .hidden(opts.hidden)
                    .ignore_errors(opts.ignore_errors),
            )
            .await?;
        }

        if let Some(name) = &opts.save_as {
            self.delta.saved.insert(name.clone(), stdout.to_string());
        }

        self.check_cancelled().await?;

        if !output.success() && !opts.ignore_errors {
            let (command, output_text) = if opts.hidden {
                ("<hidden>".to_string(), String::new())
            } else {
                (command.to_string(), stdout.to_string())
            };
            return Err(DeployError::Command {
                command,
                exit_code: output.exit_code,
                output: output_text,
            });
        }

        Ok(output)
    }

    pub async fn check_cancelled(&self) -> Result<(), DeployError> {
        match self.ctx.store.status(self.ctx.deployment_id()).await? {
            DeploymentStatus::CancelledByUser => Err(DeployError::Cancelled),
            _ => Ok(()),
        }
    }

    pub async fn info(&self, message: &str) -> Result<(), DeployError> {
        info!(deployment = %self.ctx.deployment_id(), "{}", message);
        self.log(LogEntry::info(message)).await
    }

    pub async fn warn(&self, message: &str) -> Result<(), DeployError> {
        warn!(deployment = %self.ctx.deployment_id(), "{}", message);
        self.log(LogEntry::warning(message)).await
    }

    pub async fn log(&self, entry: LogEntry) -> Result<(), DeployError> {
        self.ctx
            .store
            .append_log(self.ctx.deployment_id(), entry)
            .await?;
        Ok(())
    }

    /// Persist the resolved commit onto the record and the context.
    pub async fn set_commit(&mut self, sha: &str, message: Option<&str>) -> Result<(), DeployError> {
        let sha_owned = sha.to_string();
        let message_owned = message.map(str::to_string);
        self.ctx
            .store
            .update(self.ctx.deployment_id(), &|record| {
                record.commit_sha = Some(sha_owned.clone());
                if message_owned.is_some() {
                    record.commit_message = message_owned.clone();
                }
            })
            .await?;
        self.delta.commit = Some(sha.to_string());
        if let Some(message) = message {
            self.delta.commit_message = Some(message.to_string());
        }
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::executor::fake::ScriptedExecutor;

    #[tokio::test]
    async fn run_logs_visible_commands_and_saves_output() {
        let ctx = context().await;
        let exec = ScriptedExecutor::new().on("echo hi", "hi\n");
        let mut stage = Stage::new(&ctx, &exec);

        stage
            .run("echo hi", ExecOptions::default().save_as("greeting"))
            .await
            .unwrap();
        let delta = stage.finish();

        assert_eq!(delta.saved.get("greeting").map(String::as_str), Some("hi"));
        let record = ctx.store.load(ctx.deployment_id()).await.unwrap();
        let visible: Vec<_> = record.visible_logs().map(|e| e.message.clone()).collect();
        assert_eq!(visible, vec!["echo hi".to_string(), "hi".to_string()]);
    }

    #[tokio::test]
    async fn hidden_failures_do_not_leak_the_command() {
        let ctx = context().await;
        let exec = ScriptedExecutor::new().fail("secret-token", 128);
        let mut stage = Stage::new(&ctx, &exec);

        let err = stage
            .run("git ls-remote secret-token", ExecOptions::hidden())
            .await
            .unwrap_err();

        assert!(!err.to_string().contains("secret-token"));
        let record = ctx.store.load(ctx.deployment_id()).await.unwrap();
        assert_eq!(record.visible_logs().count(), 0);
        assert!(record.log_entries.iter().all(|e| e.hidden));
    }

    #[tokio::test]
    async fn ignored_errors_continue() {
        let ctx = context().await;
        let exec = ScriptedExecutor::new().fail("docker rm", 1);
        let mut stage = Stage::new(&ctx, &exec);

        let output = stage
            .run("docker rm -f old", ExecOptions::default().ignore_errors())
            .await
            .unwrap();
        assert_eq!(output.exit_code, 1);
    }

    #[tokio::test]
    async fn cancellation_is_observed_after_the_remote_call() {
        let ctx = context().await;
        ctx.store
            .update(ctx.deployment_id(), &|r| r.status = DeploymentStatus::CancelledByUser)
            .await
            .unwrap();
        let exec = ScriptedExecutor::new();
        let mut stage = Stage::new(&ctx, &exec);

        let err = stage.run("docker build .", ExecOptions::default()).await.unwrap_err();
        assert!(err.is_cancelled());
        assert!(exec.ran("docker build"));
    }

    #[tokio::test]
    async fn apply_merges_delta() {
        let mut ctx = context().await;
        let mut delta = ContextDelta::default();
        delta.commit = Some("a".repeat(40));
        delta.new_variables.push(var("NEW", "1"));
        delta.new_version_healthy = Some(true);
        ctx.apply(delta);

        assert_eq!(ctx.commit.as_deref().map(str::len), Some(40));
        assert!(ctx.new_version_healthy);
        assert_eq!(ctx.variables().len(), 1);
        assert!(ctx.image_name().starts_with("shop:aaaaaaaaaaaa"));
    }
}
