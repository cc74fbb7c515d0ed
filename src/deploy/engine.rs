//! Wires the pipeline to real servers: queueing, SSH connections, fan-out, route
//! sync and post-deploy monitors.

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::FutureExt;
use std::sync::{Arc, Mutex, Weak};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::{DeployConfig, DockyardConfig};
use crate::executor::{write_file_command, ExecError, ExecOptions, RemoteExecutor};
use crate::model::{Application, DeploymentRecord, DeploymentRequest, DeploymentStatus, Server, Team};
use crate::monitor::{HealthMonitor, MonitorTarget};
use crate::queue::DeploymentQueue;
use crate::ssh::SshSession;
use crate::status::{DeploymentEvent, DeploymentStatusMachine, EventKind, Notifier, Platform};
use crate::store::DeploymentStore;
use crate::traefik::{self, Route};

use super::context::DeploymentContext;
use super::error::DeployError;

/// Opens an executor for a server.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, server: &Server) -> Result<Arc<dyn RemoteExecutor>, ExecError>;
}

pub struct SshConnector;

#[async_trait]
impl Connector for SshConnector {
    async fn connect(&self, server: &Server) -> Result<Arc<dyn RemoteExecutor>, ExecError> {
        let session = SshSession::connect(server)
            .await
            .map_err(|e| ExecError::Connection {
                host: server.address.clone(),
                message: format!("{:#}", e),
            })?;
        Ok(Arc::new(session))
    }
}

/// Notifier that reports through the process log.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, team: &Team, event: &DeploymentEvent) -> Result<()> {
        let commit = event.commit_sha.as_deref().map(|c| &c[..c.len().min(7)]).unwrap_or("-");
        match event.kind {
            EventKind::DeploymentSuccess => info!(
                team = %team.name,
                "{} deployed {} to {}",
                event.application, commit, event.server
            ),
            EventKind::DeploymentFailed => warn!(
                team = %team.name,
                "{} failed to deploy {} to {}: {}",
                event.application,
                commit,
                event.server,
                event.failure_reason.as_deref().unwrap_or("unknown reason")
            ),
        }
        Ok(())
    }
}

pub struct Engine {
    this: Weak<Engine>,
    application: Application,
    deploy: DeployConfig,
    servers: Vec<Server>,
    store: Arc<dyn DeploymentStore>,
    connector: Arc<dyn Connector>,
    notifier: Arc<dyn Notifier>,
    queue: DeploymentQueue,
    monitors: Mutex<Vec<JoinHandle<()>>>,
}

impl Engine {
    pub fn new(
        config: DockyardConfig,
        store: Arc<dyn DeploymentStore>,
        connector: Arc<dyn Connector>,
        notifier: Arc<dyn Notifier>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            application: config.app,
            deploy: config.deploy,
            servers: config.servers,
            store,
            connector,
            notifier,
            queue: DeploymentQueue::new(),
            monitors: Mutex::new(Vec::new()),
        })
    }

    fn handle(&self) -> Result<Arc<Engine>, DeployError> {
        self.this
            .upgrade()
            .ok_or_else(|| DeployError::fatal("Engine is shutting down."))
    }

    fn server(&self, name: &str) -> Result<&Server, DeployError> {
        self.servers
            .iter()
            .find(|s| s.name == name)
            .ok_or_else(|| DeployError::fatal(format!("Server '{}' not found in config.", name)))
    }

    /// Build server images are produced on, when it is a different machine.
    fn build_server_for(&self, target: &Server) -> Option<Server> {
        self.servers
            .iter()
            .find(|s| s.build_server && s.name != target.name)
            .cloned()
    }

    /// Record `request` as queued and schedule it behind earlier deployments of the
    /// same application.
    pub async fn submit(&self, request: DeploymentRequest) -> Result<Uuid, DeployError> {
        if request.application != self.application.name {
            return Err(DeployError::fatal(format!(
                "Unknown application '{}'.",
                request.application
            )));
        }
        self.server(&request.server)?;

        let engine = self.handle()?;
        let id = request.id;
        self.store.insert(DeploymentRecord::queued(&request)).await?;
        debug!("Queued deployment {} to {}", id, request.server);

        self.queue.enqueue(
            self.application.uuid(),
            async move {
                if let Err(e) = engine.execute(request).await {
                    error!("Deployment {} could not be recorded: {}", id, e);
                }
            }
            .boxed(),
        );
        Ok(id)
    }

    async fn execute(&self, request: DeploymentRequest) -> Result<DeploymentStatus, DeployError> {
        let id = request.id;
        let server = self.server(&request.server)?.clone();
        let builder = self.build_server_for(&server);
        let machine = DeploymentStatusMachine::new(self.handle()?, self.notifier.clone());

        let mut ctx = DeploymentContext::new(
            request,
            self.application.clone(),
            server.clone(),
            self.deploy.clone(),
            self.store.clone(),
        );
        ctx.build_server = builder.clone();

        let exec = match self.connector.connect(&server).await {
            Ok(exec) => exec,
            Err(e) => {
                machine.fail_deployment(&ctx, &e.to_string()).await?;
                return Ok(self.store.status(id).await?);
            }
        };
        let build_exec = match &builder {
            Some(b) => match self.connector.connect(b).await {
                Ok(exec) => Some(exec),
                Err(e) => {
                    close(exec.as_ref()).await;
                    machine.fail_deployment(&ctx, &e.to_string()).await?;
                    return Ok(self.store.status(id).await?);
                }
            },
            None => None,
        };

        let status = super::run(&mut ctx, exec.as_ref(), build_exec.as_deref(), &machine).await;
        close(exec.as_ref()).await;
        if let Some(build_exec) = &build_exec {
            close(build_exec.as_ref()).await;
        }
        status
    }

    /// Wait for queued deployments, monitors and anything they queue in turn.
    pub async fn wait(&self) {
        loop {
            self.queue.wait_idle().await;
            let handles = std::mem::take(&mut *self.monitors.lock().unwrap_or_else(|e| e.into_inner()));
            if handles.is_empty() && self.queue.pending() == 0 {
                break;
            }
            for handle in handles {
                if let Err(e) = handle.await {
                    error!("Health monitor task failed: {}", e);
                }
            }
        }
    }
}

/// A close failure never changes a deployment's outcome.
async fn close(exec: &dyn RemoteExecutor) {
    if let Err(e) = exec.close().await {
        warn!("{}", e);
    }
}

#[async_trait]
impl Platform for Engine {
    async fn application_configuration_changed(&self, application: &Application) -> Result<()> {
        info!("Configuration of {} changed", application.name);
        Ok(())
    }

    async fn queue_deployment(&self, request: DeploymentRequest) -> Result<()> {
        self.submit(request).await?;
        Ok(())
    }

    async fn sync_remote_route(&self, application: &Application, server: &str) -> Result<()> {
        let Some(route) = application.fqdn.as_deref().and_then(Route::from_fqdn) else {
            return Ok(());
        };
        let remote = self.server(server)?;
        let primary = self
            .servers
            .iter()
            .find(|s| s.primary)
            .context("No primary server configured")?;

        let name = format!("{}-{}", application.uuid(), remote.name);
        let config = traefik::render_remote_route(&name, &route, &remote.address)?;
        let command = format!(
            "mkdir -p {} && {}",
            traefik::DYNAMIC_DIR,
            write_file_command(&traefik::dynamic_config_path(&name), &config)
        );

        let exec = self.connector.connect(primary).await?;
        let output = exec.execute(&command, &ExecOptions::default()).await;
        close(exec.as_ref()).await;
        let output = output?;
        if !output.success() {
            anyhow::bail!(
                "Writing route on {} exited with {}: {}",
                primary.name,
                output.exit_code,
                output.stdout.trim()
            );
        }
        info!("Routed {} on {} to {}", route.host, primary.name, remote.name);
        Ok(())
    }

    fn schedule_health_monitor(&self, target: MonitorTarget) {
        let Ok(engine) = self.handle() else {
            return;
        };
        let handle = tokio::spawn(async move {
            let exec = match engine.connector.connect(&target.server).await {
                Ok(exec) => exec,
                Err(e) => {
                    warn!("Health monitor could not connect: {}", e);
                    return;
                }
            };
            let monitor = HealthMonitor::new(
                exec.clone(),
                engine.store.clone(),
                engine.clone(),
                engine.deploy.auto_rollback.clone(),
            );
            let outcome = monitor.run(target).await;
            close(exec.as_ref()).await;
            match outcome {
                Ok(Some(rollback)) => warn!("Queued rollback deployment {}", rollback),
                Ok(None) => {}
                Err(e) => error!("Health monitor failed: {}", e),
            }
        });
        self.monitors
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(handle);
    }
}
