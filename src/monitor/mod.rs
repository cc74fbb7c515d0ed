//! Post-deploy health monitor.
//!
//! Runs outside the deployment pipeline after a successful rollout and watches the
//! new containers for a fixed window. A crash loop or an `unhealthy` report queues a
//! rollback to the last successful commit.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::AutoRollbackConfig;
use crate::container::health::STATUS_FORMAT;
use crate::deploy::error::DeployError;
use crate::executor::{quote, ExecOptions, RemoteExecutor};
use crate::model::{Application, DeploymentRequest, LogEntry, RollbackEvent, Server};
use crate::status::Platform;
use crate::store::DeploymentStore;

/// A finished deployment to keep an eye on.
#[derive(Debug, Clone)]
pub struct MonitorTarget {
    pub deployment_id: Uuid,
    pub application: Application,
    pub server: Server,
    pub containers: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sample {
    pub restarts: u32,
    pub status: String,
}

impl Sample {
    /// Parse `"{restart count} {status}"`.
    pub fn parse(line: &str) -> Option<Self> {
        let (restarts, status) = line.trim().split_once(' ')?;
        Some(Self {
            restarts: restarts.parse().ok()?,
            status: status.trim().to_string(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Stable,
    /// The container disappeared; somebody else replaced or removed it.
    Gone,
    Degraded { restarts: u32, reason: String },
}

pub struct HealthMonitor {
    exec: Arc<dyn RemoteExecutor>,
    store: Arc<dyn DeploymentStore>,
    platform: Arc<dyn Platform>,
    config: AutoRollbackConfig,
}

impl HealthMonitor {
    pub fn new(
        exec: Arc<dyn RemoteExecutor>,
        store: Arc<dyn DeploymentStore>,
        platform: Arc<dyn Platform>,
        config: AutoRollbackConfig,
    ) -> Self {
        Self {
            exec,
            store,
            platform,
            config,
        }
    }

    async fn sample(&self, container: &str) -> Result<Option<Sample>, DeployError> {
        let command = format!(
            "docker inspect --format '{{{{.RestartCount}}}} {}' {}",
            STATUS_FORMAT,
            quote(container)
        );
        let output = self.exec.execute(&command, &ExecOptions::default()).await?;
        if !output.success() {
            return Ok(None);
        }
        Ok(Sample::parse(&output.stdout))
    }

    /// Sample every container each `interval` until `window` has elapsed.
    pub async fn observe(&self, target: &MonitorTarget) -> Result<Verdict, DeployError> {
        let deadline = Instant::now() + Duration::from_secs(self.config.window);
        let interval = Duration::from_secs(self.config.interval.max(1));

        loop {
            for container in &target.containers {
                let Some(sample) = self.sample(container).await? else {
                    return Ok(Verdict::Gone);
                };
                debug!("{}: {} restart(s), {}", container, sample.restarts, sample.status);

                if sample.restarts > self.config.max_restarts {
                    return Ok(Verdict::Degraded {
                        restarts: sample.restarts,
                        reason: format!(
                            "{} restarted {} times (limit {}).",
                            container, sample.restarts, self.config.max_restarts
                        ),
                    });
                }
                if sample.status == "unhealthy" {
                    return Ok(Verdict::Degraded {
                        restarts: sample.restarts,
                        reason: format!("{} reports unhealthy.", container),
                    });
                }
            }

            if Instant::now() >= deadline {
                return Ok(Verdict::Stable);
            }
            tokio::time::sleep(interval.min(deadline - Instant::now())).await;
        }
    }

    /// Observe `target` and queue a rollback if it degrades. Returns the id of the
    /// queued rollback deployment.
    pub async fn run(&self, target: MonitorTarget) -> Result<Option<Uuid>, DeployError> {
        info!(
            "Watching {} for {}s after deployment {}",
            target.application.name, self.config.window, target.deployment_id
        );

        match self.observe(&target).await? {
            Verdict::Stable => {
                info!("Deployment {} stayed healthy", target.deployment_id);
                Ok(None)
            }
            Verdict::Gone => {
                debug!("Containers of {} are gone, stopping monitor", target.deployment_id);
                Ok(None)
            }
            Verdict::Degraded { restarts, reason } => {
                warn!("Deployment {} degraded: {}", target.deployment_id, reason);
                self.store
                    .update(target.deployment_id, &|record| record.restart_count = restarts)
                    .await?;
                self.store
                    .append_log(
                        target.deployment_id,
                        LogEntry::warning(format!("Health monitor: {}", reason)),
                    )
                    .await?;
                self.trigger_rollback(&target, &reason).await
            }
        }
    }

    async fn trigger_rollback(&self, target: &MonitorTarget, reason: &str) -> Result<Option<Uuid>, DeployError> {
        let record = self.store.load(target.deployment_id).await?;
        let previous = match record.last_successful_deployment_id {
            Some(id) => Some(self.store.load(id).await?),
            None => {
                self.store
                    .last_successful(&target.application.name, target.deployment_id)
                    .await?
            }
        };

        let Some((previous, commit)) = previous.and_then(|p| {
            let commit = p.commit_sha.clone()?;
            Some((p, commit))
        }) else {
            self.store
                .append_log(
                    target.deployment_id,
                    LogEntry::warning("No earlier successful deployment to roll back to."),
                )
                .await?;
            return Ok(None);
        };

        let mut request = DeploymentRequest::new(&target.application.name, &target.server.name, &previous.git_ref);
        request.commit = Some(commit.clone());
        request.rollback_of = Some(target.deployment_id);
        request.only_this_server = true;

        self.store
            .insert_rollback_event(RollbackEvent::pending(
                &target.application.name,
                target.deployment_id,
                request.id,
                reason,
            ))
            .await?;
        self.store
            .append_log(
                target.deployment_id,
                LogEntry::warning(format!(
                    "Rolling back to {} (deployment {}).",
                    &commit[..commit.len().min(12)],
                    previous.id
                )),
            )
            .await?;

        let id = request.id;
        self.platform
            .queue_deployment(request)
            .await
            .map_err(|e| DeployError::fatal(format!("Failed to queue rollback: {:#}", e)))?;
        Ok(Some(id))
    }
}
