use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use uuid::Uuid;

use crate::model::{Application, DeploymentRecord, DeploymentRequest, Team};
use crate::monitor::MonitorTarget;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EventKind {
    DeploymentSuccess,
    DeploymentFailed,
}

/// Payload handed to a team's notification channels.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeploymentEvent {
    pub kind: EventKind,
    pub application: String,
    pub application_uuid: String,
    pub deployment_id: Uuid,
    pub server: String,
    pub commit_sha: Option<String>,
    pub commit_message: Option<String>,
    pub pull_request_id: u64,
    pub failure_reason: Option<String>,
}

impl DeploymentEvent {
    pub fn new(kind: EventKind, application: &Application, record: &DeploymentRecord) -> Self {
        Self {
            kind,
            application: application.name.clone(),
            application_uuid: application.uuid().to_string(),
            deployment_id: record.id,
            server: record.server.clone(),
            commit_sha: record.commit_sha.clone(),
            commit_message: record.commit_message.clone(),
            pull_request_id: record.pull_request_id,
            failure_reason: record.failure_reason.clone(),
        }
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, team: &Team, event: &DeploymentEvent) -> Result<()>;
}

/// Everything outside the engine that reacts to a finished deployment.
#[async_trait]
pub trait Platform: Send + Sync {
    /// The application's running configuration changed.
    async fn application_configuration_changed(&self, application: &Application) -> Result<()>;

    /// Queue another deployment, e.g. to an additional destination.
    async fn queue_deployment(&self, request: DeploymentRequest) -> Result<()>;

    /// Point the primary proxy at the application on `server`.
    async fn sync_remote_route(&self, application: &Application, server: &str) -> Result<()>;

    /// Start watching a freshly deployed container in the background.
    fn schedule_health_monitor(&self, target: MonitorTarget);
}

#[cfg(test)]
pub mod fake {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct RecordingNotifier {
        pub events: Mutex<Vec<(u64, DeploymentEvent)>>,
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn notify(&self, team: &Team, event: &DeploymentEvent) -> Result<()> {
            self.events.lock().unwrap().push((team.id, event.clone()));
            Ok(())
        }
    }

    impl RecordingNotifier {
        pub fn kinds(&self) -> Vec<EventKind> {
            self.events.lock().unwrap().iter().map(|(_, e)| e.kind).collect()
        }
    }

    #[derive(Default)]
    pub struct RecordingPlatform {
        pub config_changed: Mutex<u32>,
        pub queued: Mutex<Vec<DeploymentRequest>>,
        pub synced: Mutex<Vec<String>>,
        pub monitors: Mutex<Vec<MonitorTarget>>,
        pub fail_sync: bool,
    }

    #[async_trait]
    impl Platform for RecordingPlatform {
        async fn application_configuration_changed(&self, _application: &Application) -> Result<()> {
            *self.config_changed.lock().unwrap() += 1;
            Ok(())
        }

        async fn queue_deployment(&self, request: DeploymentRequest) -> Result<()> {
            self.queued.lock().unwrap().push(request);
            Ok(())
        }

        async fn sync_remote_route(&self, _application: &Application, server: &str) -> Result<()> {
            if self.fail_sync {
                anyhow::bail!("primary proxy unreachable");
            }
            self.synced.lock().unwrap().push(server.to_string());
            Ok(())
        }

        fn schedule_health_monitor(&self, target: MonitorTarget) {
            self.monitors.lock().unwrap().push(target);
        }
    }
}
