use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

use crate::model::{DeploymentStatus, LogEntry, LogLevel};

pub fn create_spinner(msg: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    if let Ok(spinner) = ProgressStyle::default_spinner()
        .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏")
        .template("{spinner:.cyan} {msg} ({elapsed})")
    {
        pb.set_style(spinner);
    }
    pb.set_message(msg.to_string());
    pb.enable_steady_tick(Duration::from_millis(80));
    pb
}

pub fn success(msg: &str) {
    println!("{} {}", style("✓").bold().green(), msg);
}

pub fn error(msg: &str) {
    eprintln!("{} {}", style("✗").bold().red(), msg);
}

pub fn warning(msg: &str) {
    eprintln!("{} {}", style("!").bold().yellow(), msg);
}

pub fn info(msg: &str) {
    println!("{} {}", style("→").bold().blue(), msg);
}

pub fn header(msg: &str) {
    println!("\n{}", style(msg).bold().underlined());
}

/// Status word coloured by outcome.
pub fn status(status: DeploymentStatus) -> String {
    let word = style(status.as_str());
    match status {
        DeploymentStatus::Finished => word.green(),
        DeploymentStatus::Failed => word.red(),
        DeploymentStatus::CancelledByUser => word.yellow(),
        DeploymentStatus::Queued | DeploymentStatus::InProgress => word.cyan(),
    }
    .to_string()
}

/// One deployment log line. Callers pass only visible entries.
pub fn log_entry(entry: &LogEntry) {
    let time = style(entry.timestamp.format("%H:%M:%S")).dim();
    match entry.level {
        LogLevel::Info => println!("{} {}", time, entry.message),
        LogLevel::Warning => println!("{} {}", time, style(&entry.message).yellow()),
        LogLevel::Error => println!("{} {}", time, style(&entry.message).red()),
    }
}
