//! BuildKit secrets derived from an application's variables.
//!
//! The set is recomputed for every deployment. Its HMAC is added as the synthetic
//! `BUILD_SECRETS_HASH` secret so that any change to a variable invalidates the
//! image layers that mount secrets.

pub mod compose;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use hmac::digest::KeyInit;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::collections::BTreeMap;
use tracing::warn;

use crate::deploy::context::{ContextDelta, DeploymentContext, Stage};
use crate::deploy::error::DeployError;
use crate::executor::{quote, RemoteExecutor};
use crate::model::EnvVariable;

pub use compose::inject_into_compose;

type HmacSha256 = Hmac<Sha256>;

pub const HASH_KEY: &str = "BUILD_SECRETS_HASH";

/// Sorted `key → value` secrets plus their HMAC.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildSecretSet {
    entries: BTreeMap<String, String>,
    hash: String,
}

impl BuildSecretSet {
    /// Build-time variables of one partition, keyed and sorted by name. Variables
    /// whose names are not shell-safe are left out.
    pub fn from_variables<'a>(
        variables: impl IntoIterator<Item = &'a EnvVariable>,
        signing_key: &str,
    ) -> Result<Self, DeployError> {
        let entries: BTreeMap<String, String> = variables
            .into_iter()
            .filter(|v| v.is_buildtime)
            .filter(|v| {
                let valid = EnvVariable::is_valid_key(&v.key);
                if !valid {
                    warn!("Variable {:?} is not a valid name, not passed to the build", v.key);
                }
                valid
            })
            .map(|v| (v.key.clone(), v.value.clone()))
            .collect();
        let hash = compute_hash(&entries, signing_key)?;
        Ok(Self { entries, hash })
    }

    pub fn hash(&self) -> &str {
        &self.hash
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Variables plus the synthetic hash entry, in key order.
    pub fn entries(&self) -> Vec<(&str, &str)> {
        if self.entries.is_empty() {
            return Vec::new();
        }
        let mut all: Vec<(&str, &str)> = self
            .entries
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        all.push((HASH_KEY, self.hash.as_str()));
        all
    }

    pub fn keys(&self) -> Vec<&str> {
        self.entries().into_iter().map(|(k, _)| k).collect()
    }

    /// `--secret id=K,env=K` for every entry; empty when there are no variables.
    pub fn secret_flags(&self) -> String {
        self.keys()
            .into_iter()
            .map(|k| format!("--secret id={k},env={k}"))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// `-e K` for every entry, matching [`env_exports`](Self::env_exports).
    pub fn env_flags(&self) -> String {
        self.keys()
            .into_iter()
            .map(|k| format!("-e {}", k))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// `--build-arg K` flags, used when build secrets are disabled. Docker takes the
    /// value from the environment of the build command.
    pub fn build_arg_flags(&self) -> String {
        self.entries
            .keys()
            .map(|k| format!("--build-arg {}", k))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Shell assignments that place every entry in the environment of the command
    /// that follows. Multi-line values cannot be inlined as one token, so they are
    /// decoded from base64 in a subshell instead. Command substitution strips
    /// trailing newlines, so a `.` sentinel is decoded along with the value and
    /// removed afterwards.
    pub fn env_exports(&self) -> String {
        self.entries()
            .into_iter()
            .map(|(k, v)| {
                if v.contains('\n') {
                    format!(
                        "{k}=\"$(printf '%s' '{}' | base64 -d; printf .)\" {k}=\"${{{k}%.}}\"",
                        STANDARD.encode(v.as_bytes())
                    )
                } else {
                    format!("{}={}", k, quote(v))
                }
            })
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Sort by key, render `KEY=value`, join with `|`, HMAC-SHA256 with `signing_key`.
pub fn compute_hash(
    entries: &BTreeMap<String, String>,
    signing_key: &str,
) -> Result<String, DeployError> {
    let payload = entries
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("|");

    let mut mac = <HmacSha256 as KeyInit>::new_from_slice(signing_key.as_bytes())
        .map_err(|e| DeployError::fatal(format!("Invalid build secrets signing key: {}", e)))?;
    mac.update(payload.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Flags handed to the build container (`docker run -e K`) and the environment it
/// needs, computed lazily from the application's variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DockerEnvFlags {
    pub exports: String,
    pub flags: String,
}

pub struct BuildSecretProvisioner<'a> {
    enabled: bool,
    signing_key: &'a str,
    variables: &'a [EnvVariable],
    set: Option<BuildSecretSet>,
}

impl<'a> BuildSecretProvisioner<'a> {
    pub fn new(
        enabled: bool,
        signing_key: &'a str,
        variables: &'a [EnvVariable],
        set: Option<BuildSecretSet>,
    ) -> Self {
        Self {
            enabled,
            signing_key,
            variables,
            set,
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn secret_set(&mut self) -> Result<&BuildSecretSet, DeployError> {
        let set = match self.set.take() {
            Some(set) => set,
            None => BuildSecretSet::from_variables(self.variables, self.signing_key)?,
        };
        Ok(self.set.insert(set))
    }

    pub fn into_set(self) -> Result<BuildSecretSet, DeployError> {
        match self.set {
            Some(set) => Ok(set),
            None => BuildSecretSet::from_variables(self.variables, self.signing_key),
        }
    }

    /// `--secret` flags for the builder; empty when disabled or nothing to pass.
    pub fn generate_build_secrets(&mut self) -> Result<String, DeployError> {
        if !self.enabled {
            return Ok(String::new());
        }
        Ok(self.secret_set()?.secret_flags())
    }

    /// `-e K` flags for the build container, `None` when build secrets are disabled.
    pub fn generate_docker_env_flags(&mut self) -> Result<Option<DockerEnvFlags>, DeployError> {
        if !self.enabled {
            return Ok(None);
        }
        Ok(Some(DockerEnvFlags::for_set(self.secret_set()?)))
    }
}

impl DockerEnvFlags {
    pub fn for_set(set: &BuildSecretSet) -> Self {
        Self {
            exports: set.env_exports(),
            flags: set.env_flags(),
        }
    }
}

/// Compute the build secret set for this deployment.
pub async fn provision(
    ctx: &DeploymentContext,
    exec: &dyn RemoteExecutor,
) -> Result<ContextDelta, DeployError> {
    let mut stage = Stage::new(ctx, exec);
    let variables = ctx.variables();
    let enabled = ctx.application.settings.build_secrets;
    let mut provisioner =
        BuildSecretProvisioner::new(enabled, &ctx.deploy.signing_key, &variables, None);

    if provisioner.enabled() {
        let set = provisioner.secret_set()?;
        if !set.is_empty() {
            stage
                .info(&format!(
                    "Passing {} variable(s) as build secrets (hash {}).",
                    set.keys().len() - 1,
                    &set.hash()[..12]
                ))
                .await?;
        }
    } else {
        stage
            .info("Build secrets are disabled, variables are passed as build arguments.")
            .await?;
    }

    stage.delta().build_secrets = Some(provisioner.into_set()?);
    Ok(stage.finish())
}
