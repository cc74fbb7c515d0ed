use anyhow::{bail, Result};
use std::collections::HashSet;

use super::DockyardConfig;
use crate::model::{BuildPack, EnvVariable};

pub fn validate(config: &DockyardConfig) -> Result<()> {
    let app = &config.app;

    if app.name.is_empty() {
        bail!("app.name cannot be empty");
    }

    if app.repository.is_empty() && app.build_pack != BuildPack::Dockerimage {
        bail!("app.repository cannot be empty");
    }

    if app.build_pack == BuildPack::Dockerimage && app.image.as_deref().unwrap_or("").is_empty() {
        bail!("app.image is required when build_pack = \"dockerimage\"");
    }

    if app.settings.canary_weight > 100 {
        bail!(
            "app.settings.canary_weight must be between 0 and 100, got {}",
            app.settings.canary_weight
        );
    }

    let mut seen = HashSet::new();
    for var in &app.variables {
        if var.key.is_empty() {
            bail!("Environment variable with empty key");
        }
        if !EnvVariable::is_valid_key(&var.key) {
            bail!(
                "Environment variable '{}' must match [A-Za-z_][A-Za-z0-9_]*",
                var.key
            );
        }
        if !seen.insert((var.key.to_lowercase(), var.is_preview)) {
            bail!("Environment variable '{}' is defined twice", var.key);
        }
    }

    if config.servers.is_empty() {
        bail!("No servers defined");
    }

    for server in &config.servers {
        if server.address.is_empty() {
            bail!("Server '{}' has an empty address", server.name);
        }
    }

    for dest in &app.destinations {
        if !config.servers.iter().any(|s| &s.name == dest) {
            bail!("Destination '{}' does not match any server", dest);
        }
    }

    if config.deploy.health_check.retries == 0 {
        bail!("deploy.health_check.retries must be at least 1");
    }

    Ok(())
}
