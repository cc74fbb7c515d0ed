use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use thiserror::Error;

#[cfg(test)]
pub mod fake;

/// Per-command flags understood by every executor.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOptions {
    /// Keep the command line and its output out of user-visible logs.
    pub hidden: bool,
    /// A non-zero exit does not fail the stage.
    pub ignore_errors: bool,
    /// Capture trimmed stdout under this name on the deployment context.
    pub save_as: Option<String>,
}

impl ExecOptions {
    pub fn hidden() -> Self {
        Self {
            hidden: true,
            ..Self::default()
        }
    }

    pub fn ignore_errors(mut self) -> Self {
        self.ignore_errors = true;
        self
    }

    pub fn save_as(mut self, name: &str) -> Self {
        self.save_as = Some(name.to_string());
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub exit_code: i32,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("connection to {host} failed: {message}")]
    Connection { host: String, message: String },

    #[error("remote execution on {host} failed: {message}")]
    Transport { host: String, message: String },
}

/// Runs shell commands on the target host.
///
/// A command that runs and exits non-zero is reported through
/// [`CommandOutput::exit_code`]; `Err` is reserved for transport failures.
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    async fn execute(&self, command: &str, opts: &ExecOptions) -> Result<CommandOutput, ExecError>;

    /// Release the connection. Commands issued afterwards fail.
    async fn close(&self) -> Result<(), ExecError> {
        Ok(())
    }
}

/// Quote a value for interpolation into a POSIX shell command line.
pub fn quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "'\\''"))
}

/// Command that writes `content` to `path` on the remote side. The payload travels
/// base64-encoded so quoting and heredoc terminators in the content cannot break out.
pub fn write_file_command(path: &str, content: &str) -> String {
    format!(
        "echo '{}' | base64 -d > {}",
        STANDARD.encode(content.as_bytes()),
        quote(path)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quote_wraps_and_escapes_single_quotes() {
        assert_eq!(quote("web"), "'web'");
        assert_eq!(quote("it's"), "'it'\\''s'");
        assert_eq!(quote("a; rm -rf /"), "'a; rm -rf /'");
    }

    #[test]
    fn write_file_command_encodes_payload() {
        let cmd = write_file_command("/tmp/a b.yml", "x: 'y'\nEOF\n");
        assert!(cmd.starts_with("echo '"));
        assert!(cmd.ends_with("| base64 -d > '/tmp/a b.yml'"));
        assert!(!cmd.contains("EOF"));
    }

    #[test]
    fn options_builders() {
        let opts = ExecOptions::hidden().ignore_errors().save_as("sha");
        assert!(opts.hidden);
        assert!(opts.ignore_errors);
        assert_eq!(opts.save_as.as_deref(), Some("sha"));
        assert_eq!(ExecOptions::default().save_as, None);
    }
}
