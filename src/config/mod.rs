use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::model::{Application, Server};

mod validate;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DockyardConfig {
    pub app: Application,
    #[serde(default)]
    pub deploy: DeployConfig,
    #[serde(default)]
    pub servers: Vec<Server>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    #[default]
    Production,
    Development,
}

impl RunMode {
    /// Grace period handed to `docker stop -t`.
    pub fn stop_timeout(self) -> u64 {
        match self {
            RunMode::Production => 30,
            RunMode::Development => 1,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DeployConfig {
    #[serde(default = "default_deploy_to")]
    pub deploy_to: String,
    #[serde(default)]
    pub mode: RunMode,
    /// Key for the build-secrets HMAC. Independent of the secret values.
    #[serde(default)]
    pub signing_key: String,
    #[serde(default = "default_helper_image")]
    pub helper_image: String,
    #[serde(default)]
    pub health_check: HealthCheckConfig,
    #[serde(default)]
    pub auto_rollback: AutoRollbackConfig,
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
}

impl Default for DeployConfig {
    fn default() -> Self {
        Self {
            deploy_to: default_deploy_to(),
            mode: RunMode::default(),
            signing_key: String::new(),
            helper_image: default_helper_image(),
            health_check: HealthCheckConfig::default(),
            auto_rollback: AutoRollbackConfig::default(),
            state_dir: default_state_dir(),
        }
    }
}

fn default_deploy_to() -> String {
    "/var/deploy".to_string()
}

fn default_helper_image() -> String {
    "docker:27-cli".to_string()
}

fn default_state_dir() -> PathBuf {
    PathBuf::from(".dockyard")
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HealthCheckConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_health_interval")]
    pub interval: u64,
    #[serde(default = "default_health_retries")]
    pub retries: u32,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: default_health_interval(),
            retries: default_health_retries(),
        }
    }
}

impl HealthCheckConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval)
    }
}

fn default_true() -> bool {
    true
}
fn default_health_interval() -> u64 {
    2
}
fn default_health_retries() -> u32 {
    15
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AutoRollbackConfig {
    /// Seconds the new container is observed after a successful deployment.
    #[serde(default = "default_window")]
    pub window: u64,
    #[serde(default = "default_monitor_interval")]
    pub interval: u64,
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,
}

impl Default for AutoRollbackConfig {
    fn default() -> Self {
        Self {
            window: default_window(),
            interval: default_monitor_interval(),
            max_restarts: default_max_restarts(),
        }
    }
}

fn default_window() -> u64 {
    300
}
fn default_monitor_interval() -> u64 {
    10
}
fn default_max_restarts() -> u32 {
    3
}

impl DockyardConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        validate::validate(&config)?;

        Ok(config)
    }

    /// Named server, or the first configured one.
    pub fn server(&self, name: Option<&str>) -> Result<&Server> {
        match name {
            Some(name) => self
                .servers
                .iter()
                .find(|s| s.name == name)
                .with_context(|| format!("Server '{}' not found in config", name)),
            None => self.servers.first().context("No servers configured"),
        }
    }
}
