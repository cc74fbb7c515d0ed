pub mod exec;

use anyhow::{Context, Result};
use openssh::{KnownHosts, Session, SessionBuilder};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::debug;

use crate::model::Server;

/// Multiplexed SSH connection. `None` once closed through
/// [`RemoteExecutor::close`](crate::executor::RemoteExecutor::close).
pub struct SshSession {
    session: RwLock<Option<Session>>,
    host: String,
}

impl SshSession {
    pub async fn connect(server: &Server) -> Result<Self> {
        let user = server.user();
        let host = &server.address;
        debug!("Connecting to {}@{}", user, host);

        let mut builder = SessionBuilder::default();
        builder.known_hosts_check(KnownHosts::Accept);
        builder.connect_timeout(Duration::from_secs(30));
        builder.user(user.to_string());

        if let Some(port) = server.port {
            builder.port(port);
        }

        let session = builder
            .connect(host)
            .await
            .with_context(|| format!("Failed to connect to {}@{}", user, host))?;

        Ok(Self {
            session: RwLock::new(Some(session)),
            host: host.to_string(),
        })
    }
}
