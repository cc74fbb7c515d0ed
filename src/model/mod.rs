use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod application;

pub use application::{Application, BuildPack, GitProvider, Server, Team};

/// Lifecycle state of a deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeploymentStatus {
    Queued,
    InProgress,
    Finished,
    Failed,
    CancelledByUser,
}

impl DeploymentStatus {
    /// No further status mutation is allowed from a terminal state.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            DeploymentStatus::Finished | DeploymentStatus::Failed | DeploymentStatus::CancelledByUser
        )
    }

    /// Statuses only move forward: queued, then in-progress, then a terminal state.
    pub fn can_advance_to(self, next: DeploymentStatus) -> bool {
        !self.is_terminal() && next.rank() > self.rank()
    }

    fn rank(self) -> u8 {
        match self {
            DeploymentStatus::Queued => 0,
            DeploymentStatus::InProgress => 1,
            _ => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DeploymentStatus::Queued => "queued",
            DeploymentStatus::InProgress => "in-progress",
            DeploymentStatus::Finished => "finished",
            DeploymentStatus::Failed => "failed",
            DeploymentStatus::CancelledByUser => "cancelled-by-user",
        }
    }
}

impl std::fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A queued request to deploy one revision of an application to one server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentRequest {
    pub id: Uuid,
    pub application: String,
    pub server: String,
    pub git_ref: String,
    /// Pull/merge request number, 0 when this is a regular branch deployment.
    #[serde(default)]
    pub pull_request_id: u64,
    #[serde(default)]
    pub only_this_server: bool,
    #[serde(default)]
    pub force_restart: bool,
    #[serde(default)]
    pub auto_rollback_enabled: bool,
    /// Set when this request reverts the deployment with the given id.
    #[serde(default)]
    pub rollback_of: Option<Uuid>,
    /// Pin the deployment to an exact commit instead of resolving `git_ref`.
    #[serde(default)]
    pub commit: Option<String>,
}

impl DeploymentRequest {
    pub fn new(application: &str, server: &str, git_ref: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            application: application.to_string(),
            server: server.to_string(),
            git_ref: git_ref.to_string(),
            pull_request_id: 0,
            only_this_server: false,
            force_restart: false,
            auto_rollback_enabled: false,
            rollback_of: None,
            commit: None,
        }
    }

    pub fn is_preview(&self) -> bool {
        self.pull_request_id != 0
    }

    pub fn is_rollback(&self) -> bool {
        self.rollback_of.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warning,
    Error,
}

/// One append-only line of deployment output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub message: String,
    #[serde(default)]
    pub hidden: bool,
    #[serde(default)]
    pub ignore_errors: bool,
    pub level: LogLevel,
    pub timestamp: DateTime<Utc>,
}

impl LogEntry {
    pub fn info(message: impl Into<String>) -> Self {
        Self::with_level(message, LogLevel::Info)
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self::with_level(message, LogLevel::Warning)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::with_level(message, LogLevel::Error)
    }

    fn with_level(message: impl Into<String>, level: LogLevel) -> Self {
        Self {
            message: message.into(),
            hidden: false,
            ignore_errors: false,
            level,
            timestamp: Utc::now(),
        }
    }

    pub fn hidden(mut self, hidden: bool) -> Self {
        self.hidden = hidden;
        self
    }

    pub fn ignore_errors(mut self, ignore_errors: bool) -> Self {
        self.ignore_errors = ignore_errors;
        self
    }
}

/// Mutable execution record of a deployment. Status is owned by the status machine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentRecord {
    pub id: Uuid,
    pub application: String,
    pub server: String,
    pub git_ref: String,
    #[serde(default)]
    pub pull_request_id: u64,
    pub status: DeploymentStatus,
    pub commit_sha: Option<String>,
    pub commit_message: Option<String>,
    #[serde(default)]
    pub progress_percent: u8,
    #[serde(default)]
    pub log_entries: Vec<LogEntry>,
    #[serde(default)]
    pub restart_count: u32,
    pub last_successful_deployment_id: Option<Uuid>,
    /// Id of the deployment this record reverts, when it is a rollback.
    pub rollback_deployment_id: Option<Uuid>,
    pub container_name: Option<String>,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DeploymentRecord {
    pub fn queued(request: &DeploymentRequest) -> Self {
        let now = Utc::now();
        Self {
            id: request.id,
            application: request.application.clone(),
            server: request.server.clone(),
            git_ref: request.git_ref.clone(),
            pull_request_id: request.pull_request_id,
            status: DeploymentStatus::Queued,
            commit_sha: None,
            commit_message: None,
            progress_percent: 0,
            log_entries: Vec::new(),
            restart_count: 0,
            last_successful_deployment_id: None,
            rollback_deployment_id: request.rollback_of,
            container_name: None,
            failure_reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Log lines that may be shown to end users.
    pub fn visible_logs(&self) -> impl Iterator<Item = &LogEntry> {
        self.log_entries.iter().filter(|e| !e.hidden)
    }
}

/// Environment variable attached to an application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvVariable {
    pub key: String,
    pub value: String,
    #[serde(default = "default_true", alias = "runtime")]
    pub is_runtime: bool,
    #[serde(default = "default_true", alias = "buildtime")]
    pub is_buildtime: bool,
    #[serde(default, alias = "required")]
    pub is_required: bool,
    #[serde(default, alias = "preview")]
    pub is_preview: bool,
    #[serde(default)]
    pub source_template: Option<String>,
}

fn default_true() -> bool {
    true
}

impl EnvVariable {
    pub fn new(key: &str, value: &str) -> Self {
        Self {
            key: key.to_string(),
            value: value.to_string(),
            is_runtime: true,
            is_buildtime: true,
            is_required: false,
            is_preview: false,
            source_template: None,
        }
    }

    /// Names are spliced into shell command lines, so only `[A-Za-z_][A-Za-z0-9_]*`
    /// is accepted.
    pub fn is_valid_key(key: &str) -> bool {
        let mut chars = key.chars();
        matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
            && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RollbackOutcome {
    Pending,
    Succeeded,
    Failed,
}

/// Links a corrective deployment to the deployment it reverts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackEvent {
    pub id: Uuid,
    pub application: String,
    /// The deployment being reverted.
    pub from_deployment_id: Uuid,
    /// The corrective deployment.
    pub rollback_deployment_id: Uuid,
    pub reason: String,
    pub outcome: RollbackOutcome,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl RollbackEvent {
    pub fn pending(application: &str, from: Uuid, rollback: Uuid, reason: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            application: application.to_string(),
            from_deployment_id: from,
            rollback_deployment_id: rollback,
            reason: reason.to_string(),
            outcome: RollbackOutcome::Pending,
            created_at: Utc::now(),
            completed_at: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states() {
        assert!(!DeploymentStatus::Queued.is_terminal());
        assert!(!DeploymentStatus::InProgress.is_terminal());
        assert!(DeploymentStatus::Finished.is_terminal());
        assert!(DeploymentStatus::Failed.is_terminal());
        assert!(DeploymentStatus::CancelledByUser.is_terminal());
    }

    #[test]
    fn statuses_only_move_forward() {
        use DeploymentStatus::*;
        assert!(Queued.can_advance_to(InProgress));
        assert!(Queued.can_advance_to(Failed));
        assert!(InProgress.can_advance_to(CancelledByUser));
        assert!(!InProgress.can_advance_to(Queued));
        assert!(!InProgress.can_advance_to(InProgress));
        assert!(!Finished.can_advance_to(Failed));
        assert!(!CancelledByUser.can_advance_to(Finished));
    }

    #[test]
    fn variable_keys_must_be_shell_safe() {
        assert!(EnvVariable::is_valid_key("DATABASE_URL"));
        assert!(EnvVariable::is_valid_key("_private1"));
        assert!(!EnvVariable::is_valid_key("1PASSWORD"));
        assert!(!EnvVariable::is_valid_key("X$(touch${IFS}/tmp/x)"));
        assert!(!EnvVariable::is_valid_key("A-B"));
        assert!(!EnvVariable::is_valid_key(""));
    }

    #[test]
    fn status_serializes_kebab_case() {
        let json = serde_json::to_string(&DeploymentStatus::CancelledByUser).unwrap();
        assert_eq!(json, "\"cancelled-by-user\"");
    }

    #[test]
    fn visible_logs_skip_hidden_entries() {
        let mut record = DeploymentRecord::queued(&DeploymentRequest::new("web", "main", "main"));
        record.log_entries.push(LogEntry::info("git ls-remote secret").hidden(true));
        record.log_entries.push(LogEntry::info("Cloning repository"));

        let visible: Vec<_> = record.visible_logs().map(|e| e.message.as_str()).collect();
        assert_eq!(visible, vec!["Cloning repository"]);
    }

    #[test]
    fn rollback_request_carries_origin_into_record() {
        let origin = Uuid::new_v4();
        let mut request = DeploymentRequest::new("web", "main", "main");
        request.rollback_of = Some(origin);

        let record = DeploymentRecord::queued(&request);
        assert_eq!(record.rollback_deployment_id, Some(origin));
        assert!(request.is_rollback());
        assert!(!request.is_preview());
    }
}
