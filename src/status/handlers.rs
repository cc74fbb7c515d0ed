use async_trait::async_trait;
use tracing::warn;

use crate::deploy::context::DeploymentContext;
use crate::deploy::error::DeployError;
use crate::model::{DeploymentRecord, DeploymentRequest, LogEntry};
use crate::monitor::MonitorTarget;

use super::hooks::{DeploymentEvent, EventKind, Notifier, Platform};

/// What a handler gets to see once a terminal status is persisted.
pub struct Transition<'a> {
    pub ctx: &'a DeploymentContext,
    pub record: &'a DeploymentRecord,
    pub platform: &'a dyn Platform,
    pub notifier: &'a dyn Notifier,
}

impl Transition<'_> {
    async fn warn(&self, message: String) -> Result<(), DeployError> {
        warn!(deployment = %self.record.id, "{}", message);
        self.ctx
            .store
            .append_log(self.record.id, LogEntry::warning(message))
            .await?;
        Ok(())
    }

    /// Send `kind` to the owning team. No team, no notification.
    async fn notify(&self, kind: EventKind) -> Result<(), DeployError> {
        let Some(team) = self.ctx.application.team() else {
            return Ok(());
        };
        let event = DeploymentEvent::new(kind, &self.ctx.application, self.record);
        if let Err(e) = self.notifier.notify(team, &event).await {
            self.warn(format!("Failed to send notification: {:#}", e)).await?;
        }
        Ok(())
    }
}

/// Side effects of reaching one terminal status.
#[async_trait]
pub trait StatusHandler: Send + Sync {
    async fn handle(&self, transition: &Transition<'_>) -> Result<(), DeployError>;
}

pub struct SuccessHandler;

#[async_trait]
impl StatusHandler for SuccessHandler {
    async fn handle(&self, t: &Transition<'_>) -> Result<(), DeployError> {
        let ctx = t.ctx;
        let application = &ctx.application;
        let request = &ctx.request;

        let previous = ctx
            .store
            .last_successful(&application.name, t.record.id)
            .await?
            .map(|r| r.id);
        ctx.store
            .update(t.record.id, &|record| {
                record.restart_count = 0;
                record.last_successful_deployment_id = previous;
            })
            .await?;

        if let Err(e) = t.platform.application_configuration_changed(application).await {
            t.warn(format!("Failed to publish configuration change: {:#}", e))
                .await?;
        }

        if !application.is_single_server() && !request.only_this_server {
            for destination in application
                .destinations
                .iter()
                .filter(|d| **d != ctx.server.name)
            {
                let mut next = DeploymentRequest::new(&application.name, destination, &request.git_ref);
                next.pull_request_id = request.pull_request_id;
                next.commit = t.record.commit_sha.clone();
                next.force_restart = request.force_restart;
                next.only_this_server = true;
                if let Err(e) = t.platform.queue_deployment(next).await {
                    t.warn(format!("Failed to queue deployment to {}: {:#}", destination, e))
                        .await?;
                }
            }
        }

        t.notify(EventKind::DeploymentSuccess).await?;

        let auto_rollback = application.settings.auto_rollback || request.auto_rollback_enabled;
        if auto_rollback && !request.is_preview() && !request.is_rollback() {
            let containers = if ctx.new_containers.is_empty() {
                vec![ctx.container_name()]
            } else {
                ctx.new_containers.clone()
            };
            t.platform.schedule_health_monitor(MonitorTarget {
                deployment_id: t.record.id,
                application: application.clone(),
                server: ctx.server.clone(),
                containers,
            });
        }

        if !ctx.server.primary {
            if let Err(e) = t.platform.sync_remote_route(application, &ctx.server.name).await {
                t.warn(format!("Failed to sync route to the primary proxy: {:#}", e))
                    .await?;
            }
        }

        Ok(())
    }
}

pub struct FailureHandler;

#[async_trait]
impl StatusHandler for FailureHandler {
    async fn handle(&self, t: &Transition<'_>) -> Result<(), DeployError> {
        t.notify(EventKind::DeploymentFailed).await
    }
}
