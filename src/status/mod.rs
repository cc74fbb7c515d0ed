//! The deployment lifecycle: `queued → in-progress → {finished, failed}`, with
//! `cancelled-by-user` possible before either terminal state.
//!
//! Every status write goes through [`DeploymentStatusMachine`]. Terminal records are
//! never changed again, and the guard lives inside the store update so a concurrent
//! cancellation cannot be overwritten.

pub mod handlers;
pub mod hooks;

use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::deploy::context::DeploymentContext;
use crate::deploy::error::DeployError;
use crate::model::{DeploymentRecord, DeploymentStatus, LogEntry, RollbackOutcome};

use handlers::{FailureHandler, StatusHandler, SuccessHandler, Transition};
pub use hooks::{DeploymentEvent, EventKind, Notifier, Platform};

pub struct DeploymentStatusMachine {
    platform: Arc<dyn Platform>,
    notifier: Arc<dyn Notifier>,
    handlers: HashMap<DeploymentStatus, Box<dyn StatusHandler>>,
}

impl DeploymentStatusMachine {
    pub fn new(platform: Arc<dyn Platform>, notifier: Arc<dyn Notifier>) -> Self {
        let mut machine = Self {
            platform,
            notifier,
            handlers: HashMap::new(),
        };
        machine.register(DeploymentStatus::Finished, SuccessHandler);
        machine.register(DeploymentStatus::Failed, FailureHandler);
        machine
    }

    pub fn register(&mut self, status: DeploymentStatus, handler: impl StatusHandler + 'static) {
        self.handlers.insert(status, Box::new(handler));
    }

    /// Move a queued deployment to `in-progress`.
    pub async fn start(&self, ctx: &DeploymentContext) -> Result<(), DeployError> {
        if self.is_in_terminal_state(ctx).await? {
            let status = ctx.store.status(ctx.deployment_id()).await?;
            return Err(DeployError::fatal(format!(
                "Deployment {} is already {}.",
                ctx.deployment_id(),
                status
            )));
        }
        self.write_status(ctx, DeploymentStatus::InProgress, None).await?;
        ctx.store
            .append_log(
                ctx.deployment_id(),
                LogEntry::info(format!(
                    "Starting deployment of {}@{} to {}.",
                    ctx.application.name, ctx.request.git_ref, ctx.server.name
                )),
            )
            .await?;
        Ok(())
    }

    /// Re-read the persisted status. A cancelled deployment yields
    /// [`DeployError::Cancelled`].
    pub async fn is_in_terminal_state(&self, ctx: &DeploymentContext) -> Result<bool, DeployError> {
        match ctx.store.status(ctx.deployment_id()).await? {
            DeploymentStatus::CancelledByUser => Err(DeployError::Cancelled),
            status => Ok(status.is_terminal()),
        }
    }

    pub async fn set_progress(&self, ctx: &DeploymentContext, percent: u8) -> Result<(), DeployError> {
        ctx.store
            .update(ctx.deployment_id(), &|record| {
                if !record.status.is_terminal() {
                    record.progress_percent = percent.min(100);
                }
            })
            .await?;
        Ok(())
    }

    /// Persist `status` and run its handler. Returns `false` when nothing changed:
    /// the deployment was already terminal or `status` is not a forward move.
    pub async fn transition_to_status(
        &self,
        ctx: &DeploymentContext,
        status: DeploymentStatus,
        reason: Option<&str>,
    ) -> Result<bool, DeployError> {
        match self.is_in_terminal_state(ctx).await {
            Ok(false) => {}
            Ok(true) | Err(DeployError::Cancelled) => {
                debug!("Deployment {} is terminal, ignoring {}", ctx.deployment_id(), status);
                return Ok(false);
            }
            Err(e) => return Err(e),
        }

        let Some(record) = self.write_status(ctx, status, reason).await? else {
            return Ok(false);
        };
        info!("Deployment {} {}", record.id, status);

        if status.is_terminal() {
            self.track_rollback_outcome(ctx, &record).await?;
        }

        if let Some(handler) = self.handlers.get(&status) {
            let transition = Transition {
                ctx,
                record: &record,
                platform: self.platform.as_ref(),
                notifier: self.notifier.as_ref(),
            };
            if let Err(e) = handler.handle(&transition).await {
                warn!("{} handler for {} failed: {}", status, record.id, e);
            }
        }
        Ok(true)
    }

    pub async fn complete_deployment(&self, ctx: &DeploymentContext) -> Result<bool, DeployError> {
        self.transition_to_status(ctx, DeploymentStatus::Finished, None)
            .await
    }

    pub async fn fail_deployment(&self, ctx: &DeploymentContext, reason: &str) -> Result<bool, DeployError> {
        self.transition_to_status(ctx, DeploymentStatus::Failed, Some(reason))
            .await
    }

    /// Status write that only moves forward and never leaves a terminal state.
    /// `None` if the guard refused.
    async fn write_status(
        &self,
        ctx: &DeploymentContext,
        status: DeploymentStatus,
        reason: Option<&str>,
    ) -> Result<Option<DeploymentRecord>, DeployError> {
        let container = ctx.container_name();
        let reason = reason.map(str::to_string);
        let record = ctx
            .store
            .update(ctx.deployment_id(), &|record| {
                if !record.status.can_advance_to(status) {
                    return;
                }
                record.status = status;
                match status {
                    DeploymentStatus::Finished => {
                        record.progress_percent = 100;
                        record.container_name = Some(container.clone());
                    }
                    DeploymentStatus::Failed => {
                        record.failure_reason = reason.clone();
                        if let Some(reason) = &reason {
                            record.log_entries.push(LogEntry::error(reason.clone()));
                        }
                    }
                    _ => {}
                }
            })
            .await?;
        Ok((record.status == status).then_some(record))
    }

    /// A rollback deployment that finishes or fails settles its tracking record.
    async fn track_rollback_outcome(
        &self,
        ctx: &DeploymentContext,
        record: &DeploymentRecord,
    ) -> Result<(), DeployError> {
        if record.rollback_deployment_id.is_none() {
            return Ok(());
        }
        let Some(mut event) = ctx.store.find_rollback_event(record.id).await? else {
            return Ok(());
        };
        event.outcome = match record.status {
            DeploymentStatus::Finished => RollbackOutcome::Succeeded,
            DeploymentStatus::Failed => RollbackOutcome::Failed,
            _ => return Ok(()),
        };
        event.completed_at = Some(Utc::now());
        ctx.store.save_rollback_event(&event).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::hooks::fake::{RecordingNotifier, RecordingPlatform};
    use super::*;
    use crate::deploy::context::testing::{application, context, context_with};
    use crate::model::application::{Environment, Project};
    use crate::model::{Application, DeploymentRequest, RollbackEvent, Team};
    use uuid::Uuid;

    fn with_team(mut app: Application) -> Application {
        app.environment = Some(Environment {
            name: "production".into(),
            project: Some(Project {
                name: "storefront".into(),
                team: Some(Team {
                    id: 7,
                    name: "commerce".into(),
                }),
            }),
        });
        app
    }

    fn machine() -> (DeploymentStatusMachine, Arc<RecordingPlatform>, Arc<RecordingNotifier>) {
        let platform = Arc::new(RecordingPlatform::default());
        let notifier = Arc::new(RecordingNotifier::default());
        (
            DeploymentStatusMachine::new(platform.clone(), notifier.clone()),
            platform,
            notifier,
        )
    }

    #[tokio::test]
    async fn terminal_status_is_final() {
        let ctx = context().await;
        let (machine, _, _) = machine();

        machine.start(&ctx).await.unwrap();
        assert!(machine.complete_deployment(&ctx).await.unwrap());
        assert!(!machine.fail_deployment(&ctx, "late failure").await.unwrap());
        assert!(!machine.complete_deployment(&ctx).await.unwrap());

        let record = ctx.store.load(ctx.deployment_id()).await.unwrap();
        assert_eq!(record.status, DeploymentStatus::Finished);
        assert_eq!(record.failure_reason, None);
        assert_eq!(record.progress_percent, 100);
    }

    #[tokio::test]
    async fn start_refuses_terminal_deployments() {
        let ctx = context().await;
        let (machine, _, _) = machine();
        machine.fail_deployment(&ctx, "boom").await.unwrap();

        let err = machine.start(&ctx).await.unwrap_err();
        assert!(err.to_string().contains("already failed"));
    }

    #[tokio::test]
    async fn status_never_moves_backwards() {
        let ctx = context().await;
        let (machine, _, _) = machine();
        machine.start(&ctx).await.unwrap();

        assert!(!machine
            .transition_to_status(&ctx, DeploymentStatus::Queued, None)
            .await
            .unwrap());
        assert_eq!(
            ctx.store.status(ctx.deployment_id()).await.unwrap(),
            DeploymentStatus::InProgress
        );
    }

    #[tokio::test]
    async fn cancellation_is_raised_and_never_overwritten() {
        let ctx = context().await;
        let (machine, _, notifier) = machine();
        ctx.store
            .update(ctx.deployment_id(), &|r| r.status = DeploymentStatus::CancelledByUser)
            .await
            .unwrap();

        assert!(machine.is_in_terminal_state(&ctx).await.unwrap_err().is_cancelled());
        assert!(!machine.fail_deployment(&ctx, "x").await.unwrap());
        assert_eq!(
            ctx.store.status(ctx.deployment_id()).await.unwrap(),
            DeploymentStatus::CancelledByUser
        );
        assert!(notifier.kinds().is_empty());
    }

    #[tokio::test]
    async fn success_side_effects() {
        let mut app = with_team(application());
        app.settings.auto_rollback = true;
        let ctx = context_with(app, DeploymentRequest::new("shop", "edge-1", "main")).await;
        ctx.store
            .update(ctx.deployment_id(), &|r| r.restart_count = 4)
            .await
            .unwrap();
        let (machine, platform, notifier) = machine();

        machine.start(&ctx).await.unwrap();
        machine.complete_deployment(&ctx).await.unwrap();

        let record = ctx.store.load(ctx.deployment_id()).await.unwrap();
        assert_eq!(record.restart_count, 0);
        assert_eq!(*platform.config_changed.lock().unwrap(), 1);
        assert_eq!(notifier.kinds(), vec![EventKind::DeploymentSuccess]);
        assert_eq!(notifier.events.lock().unwrap()[0].0, 7);
        assert_eq!(platform.monitors.lock().unwrap().len(), 1);
        assert!(platform.queued.lock().unwrap().is_empty());
        assert!(platform.synced.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn last_successful_points_at_previous_live_deployment() {
        let ctx = context().await;
        let (machine, _, _) = machine();
        machine.complete_deployment(&ctx).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;

        let next_request = DeploymentRequest::new("shop", "edge-1", "main");
        ctx.store
            .insert(DeploymentRecord::queued(&next_request))
            .await
            .unwrap();
        let next = DeploymentContext::new(
            next_request,
            ctx.application.clone(),
            ctx.server.clone(),
            ctx.deploy.clone(),
            ctx.store.clone(),
        );
        machine.complete_deployment(&next).await.unwrap();

        let record = next.store.load(next.deployment_id()).await.unwrap();
        assert_eq!(record.last_successful_deployment_id, Some(ctx.deployment_id()));
    }

    #[tokio::test]
    async fn monitor_skipped_for_previews_and_rollbacks() {
        let mut app = application();
        app.settings.auto_rollback = true;

        let mut preview = DeploymentRequest::new("shop", "edge-1", "main");
        preview.pull_request_id = 12;
        let mut rollback = DeploymentRequest::new("shop", "edge-1", "main");
        rollback.rollback_of = Some(Uuid::new_v4());

        for request in [preview, rollback] {
            let ctx = context_with(app.clone(), request).await;
            let (machine, platform, _) = machine();
            machine.complete_deployment(&ctx).await.unwrap();
            assert!(platform.monitors.lock().unwrap().is_empty());
        }
    }

    #[tokio::test]
    async fn fans_out_to_other_destinations() {
        let mut app = application();
        app.destinations = vec!["edge-1".into(), "edge-2".into(), "edge-3".into()];
        let ctx = context_with(app, DeploymentRequest::new("shop", "edge-1", "main")).await;
        ctx.store
            .update(ctx.deployment_id(), &|r| r.commit_sha = Some("c".repeat(40)))
            .await
            .unwrap();
        let (machine, platform, _) = machine();

        machine.complete_deployment(&ctx).await.unwrap();

        let queued = platform.queued.lock().unwrap().clone();
        let servers: Vec<_> = queued.iter().map(|r| r.server.as_str()).collect();
        assert_eq!(servers, vec!["edge-2", "edge-3"]);
        assert!(queued.iter().all(|r| r.only_this_server));
        assert!(queued.iter().all(|r| r.commit.as_deref() == Some("c".repeat(40).as_str())));
    }

    #[tokio::test]
    async fn no_fan_out_for_single_server_requests() {
        let mut app = application();
        app.destinations = vec!["edge-2".into()];
        let mut request = DeploymentRequest::new("shop", "edge-1", "main");
        request.only_this_server = true;
        let ctx = context_with(app, request).await;
        let (machine, platform, _) = machine();

        machine.complete_deployment(&ctx).await.unwrap();
        assert!(platform.queued.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn proxy_sync_failure_is_only_a_warning() {
        let mut ctx = context().await;
        ctx.server.primary = false;
        let platform = Arc::new(RecordingPlatform {
            fail_sync: true,
            ..RecordingPlatform::default()
        });
        let machine = DeploymentStatusMachine::new(platform, Arc::new(RecordingNotifier::default()));

        assert!(machine.complete_deployment(&ctx).await.unwrap());

        let record = ctx.store.load(ctx.deployment_id()).await.unwrap();
        assert_eq!(record.status, DeploymentStatus::Finished);
        assert!(record
            .visible_logs()
            .any(|e| e.message.starts_with("Failed to sync route to the primary proxy")));
    }

    #[tokio::test]
    async fn failure_notifies_the_team() {
        let ctx = context_with(
            with_team(application()),
            DeploymentRequest::new("shop", "edge-1", "main"),
        )
        .await;
        let (machine, _, notifier) = machine();

        machine.fail_deployment(&ctx, "Image build failed").await.unwrap();

        let events = notifier.events.lock().unwrap().clone();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].1.kind, EventKind::DeploymentFailed);
        assert_eq!(events[0].1.failure_reason.as_deref(), Some("Image build failed"));
    }

    #[tokio::test]
    async fn missing_team_link_skips_notification() {
        let mut app = with_team(application());
        if let Some(env) = app.environment.as_mut() {
            env.project = None;
        }
        let ctx = context_with(app, DeploymentRequest::new("shop", "edge-1", "main")).await;
        let (machine, _, notifier) = machine();

        assert!(machine.fail_deployment(&ctx, "x").await.unwrap());
        assert!(notifier.kinds().is_empty());
    }

    #[tokio::test]
    async fn rollback_outcome_is_tracked() {
        for (finish, expected) in [(true, RollbackOutcome::Succeeded), (false, RollbackOutcome::Failed)] {
            let origin = Uuid::new_v4();
            let mut request = DeploymentRequest::new("shop", "edge-1", "main");
            request.rollback_of = Some(origin);
            let ctx = context_with(application(), request).await;
            ctx.store
                .insert_rollback_event(RollbackEvent::pending("shop", origin, ctx.deployment_id(), "crash"))
                .await
                .unwrap();
            let (machine, _, _) = machine();

            if finish {
                machine.complete_deployment(&ctx).await.unwrap();
            } else {
                machine.fail_deployment(&ctx, "still broken").await.unwrap();
            }

            let event = ctx
                .store
                .find_rollback_event(ctx.deployment_id())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(event.outcome, expected);
            assert!(event.completed_at.is_some());
        }
    }

    #[tokio::test]
    async fn rollback_without_tracking_record_is_a_no_op() {
        let mut request = DeploymentRequest::new("shop", "edge-1", "main");
        request.rollback_of = Some(Uuid::new_v4());
        let ctx = context_with(application(), request).await;
        let (machine, _, _) = machine();

        assert!(machine.complete_deployment(&ctx).await.unwrap());
    }
}
