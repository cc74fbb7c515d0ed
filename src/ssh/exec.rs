use async_trait::async_trait;
use tracing::{debug, trace};

use super::SshSession;
use crate::executor::{CommandOutput, ExecError, ExecOptions, RemoteExecutor};

#[async_trait]
impl RemoteExecutor for SshSession {
    async fn execute(&self, cmd: &str, opts: &ExecOptions) -> Result<CommandOutput, ExecError> {
        if opts.hidden {
            debug!("[{}] exec: <hidden>", self.host);
        } else {
            debug!("[{}] exec: {}", self.host, cmd);
        }

        let guard = self.session.read().await;
        let Some(session) = guard.as_ref() else {
            return Err(ExecError::Transport {
                host: self.host.clone(),
                message: "session already closed".into(),
            });
        };

        let output = session
            .command("bash")
            .arg("-c")
            .arg(cmd)
            .output()
            .await
            .map_err(|e| ExecError::Transport {
                host: self.host.clone(),
                message: e.to_string(),
            })?;

        let mut stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr);
        let exit_code = output.status.code().unwrap_or(-1);

        if exit_code != 0 && !stderr.trim().is_empty() {
            if !stdout.is_empty() && !stdout.ends_with('\n') {
                stdout.push('\n');
            }
            stdout.push_str(stderr.trim());
        }

        if !opts.hidden {
            trace!("[{}] exit {}: {}", self.host, exit_code, stdout.trim());
        }

        Ok(CommandOutput { stdout, exit_code })
    }

    async fn close(&self) -> Result<(), ExecError> {
        let Some(session) = self.session.write().await.take() else {
            return Ok(());
        };
        debug!("[{}] closing session", self.host);
        session.close().await.map_err(|e| ExecError::Transport {
            host: self.host.clone(),
            message: format!("failed to close session: {}", e),
        })
    }
}
