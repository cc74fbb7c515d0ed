use anyhow::Result;
use uuid::Uuid;

use crate::config::DockyardConfig;
use crate::model::{DeploymentStatus, LogEntry};
use crate::output;

/// Mark a deployment cancelled. A running pipeline notices after its current
/// remote command.
pub async fn run(config: DockyardConfig, id: Uuid) -> Result<()> {
    let store = super::open_store(&config).await?;

    let record = store
        .update(id, &|record| {
            if record.status.can_advance_to(DeploymentStatus::CancelledByUser) {
                record.status = DeploymentStatus::CancelledByUser;
                record
                    .log_entries
                    .push(LogEntry::warning("Cancellation requested."));
            }
        })
        .await?;

    if record.status == DeploymentStatus::CancelledByUser {
        output::success(&format!("Deployment {} cancelled", id));
    } else {
        output::warning(&format!(
            "Deployment {} already {}, nothing to cancel",
            id, record.status
        ));
    }
    Ok(())
}
