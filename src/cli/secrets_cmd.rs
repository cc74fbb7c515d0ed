use anyhow::{Context, Result};
use std::path::Path;

use crate::config::DockyardConfig;
use crate::model::EnvVariable;
use crate::output;
use crate::secrets::{inject_into_compose, BuildSecretProvisioner, BuildSecretSet};

fn partition(config: &DockyardConfig, preview: bool) -> Vec<EnvVariable> {
    config.app.variables_for(preview).cloned().collect()
}

fn secret_set(config: &DockyardConfig, preview: bool) -> Result<BuildSecretSet> {
    Ok(BuildSecretSet::from_variables(
        &partition(config, preview),
        &config.deploy.signing_key,
    )?)
}

pub fn hash(config: &DockyardConfig, preview: bool) -> Result<()> {
    let set = secret_set(config, preview)?;
    if set.is_empty() {
        output::warning("No build-time variables configured");
    }
    println!("{}", set.hash());
    Ok(())
}

pub fn flags(config: &DockyardConfig, preview: bool) -> Result<()> {
    let variables = partition(config, preview);
    let mut provisioner = BuildSecretProvisioner::new(
        config.app.settings.build_secrets,
        &config.deploy.signing_key,
        &variables,
        None,
    );

    match provisioner.generate_docker_env_flags()? {
        Some(env) => {
            output::info("Build container:");
            println!("  {}", env.flags);
            output::info("Builder:");
            println!("  {}", provisioner.generate_build_secrets()?);
        }
        None => {
            output::info("Build secrets disabled, builder gets:");
            println!("  {}", provisioner.secret_set()?.build_arg_flags());
        }
    }
    Ok(())
}

pub fn compose(config: &DockyardConfig, file: &Path, preview: bool) -> Result<()> {
    let content = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let mut manifest: serde_yaml::Value = serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse {}", file.display()))?;

    let set = secret_set(config, preview)?;
    inject_into_compose(&mut manifest, &set.keys());

    print!("{}", serde_yaml::to_string(&manifest)?);
    Ok(())
}
