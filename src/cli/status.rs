use anyhow::Result;
use console::style;
use uuid::Uuid;

use crate::config::DockyardConfig;
use crate::model::DeploymentRecord;
use crate::output;

pub async fn run(config: DockyardConfig, id: Option<Uuid>) -> Result<()> {
    let store = super::open_store(&config).await?;

    match id {
        Some(id) => {
            let record = store.load(id).await?;
            print_summary(&record);
            println!();
            print_logs(&record);
        }
        None => {
            let records = store.list(Some(&config.app.name)).await?;
            output::header(&format!("Deployments of {}", config.app.name));
            if records.is_empty() {
                output::warning("No deployments yet");
            }
            for record in records.iter().rev() {
                print_summary(record);
            }
        }
    }
    Ok(())
}

pub(crate) fn print_summary(record: &DeploymentRecord) {
    let commit = record
        .commit_sha
        .as_deref()
        .map(|c| &c[..c.len().min(7)])
        .unwrap_or("-------");
    let preview = if record.pull_request_id != 0 {
        format!(" (PR #{})", record.pull_request_id)
    } else {
        String::new()
    };
    println!(
        "  {}  {:<18} {} {}{}  {} {}%",
        record.id,
        output::status(record.status),
        commit,
        record.server,
        preview,
        record.created_at.format("%Y-%m-%d %H:%M:%S"),
        record.progress_percent
    );
    if let Some(reason) = &record.failure_reason {
        println!("      {}", style(reason).red());
    }
}

/// Hidden entries may carry secrets and are never printed.
pub(crate) fn print_logs(record: &DeploymentRecord) {
    for entry in record.visible_logs() {
        output::log_entry(entry);
    }
}
