//! Commit resolution and working-tree checkout on the target server.
//!
//! The commit is resolved with `git ls-remote` against the exact refspec, so no
//! clone is needed to know what will be deployed. The checkout then fetches that
//! refspec, records the commit subject, imports `.env` templates and strips `.git`
//! before anything is built.

pub mod env_template;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use regex::Regex;
use std::sync::OnceLock;
use tracing::debug;

use crate::deploy::context::{ContextDelta, DeploymentContext, Stage};
use crate::deploy::error::DeployError;
use crate::executor::{quote, ExecOptions, RemoteExecutor};
use crate::model::GitProvider;

/// Refspec for a branch, a GitHub/Gitea pull request or a GitLab merge request.
pub fn refspec(provider: GitProvider, branch: &str, pull_request_id: u64) -> String {
    if pull_request_id == 0 {
        return format!("refs/heads/{}", branch);
    }
    match provider {
        GitProvider::Gitlab => format!("refs/merge-requests/{}/head", pull_request_id),
        GitProvider::Github | GitProvider::Gitea | GitProvider::Other => {
            format!("refs/pull/{}/head", pull_request_id)
        }
    }
}

fn sha_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"(?m)^([0-9a-fA-F]{40})\t").ok())
        .as_ref()
}

/// Commit SHA from `git ls-remote` output (`{sha}\t{ref}` lines).
pub fn extract_sha(output: &str) -> Option<String> {
    sha_pattern()?
        .captures(output)
        .map(|c| c[1].to_lowercase())
}

/// Where the ephemeral deploy key lives for this deployment.
fn key_path(ctx: &DeploymentContext) -> String {
    format!("/tmp/dockyard-{}.key", ctx.deployment_id())
}

/// Shell prefix that installs the ephemeral identity and exports `GIT_SSH_COMMAND`.
/// Empty when the repository needs no key.
pub fn ssh_identity_prefix(private_key: Option<&str>, key_file: &str) -> String {
    let Some(key) = private_key else {
        return String::new();
    };
    let encoded = STANDARD.encode(key.as_bytes());
    format!(
        "echo '{encoded}' | base64 -d > {file} && chmod 600 {file} && \
         GIT_SSH_COMMAND=\"ssh -o ConnectTimeout=30 -o LogLevel=ERROR \
         -o StrictHostKeyChecking=no -o UserKnownHostsFile=/dev/null -i {file}\" ",
        encoded = encoded,
        file = key_file,
    )
}

pub fn ls_remote_command(repository: &str, refspec: &str, private_key: Option<&str>, key_file: &str) -> String {
    format!(
        "{}git ls-remote {} {}",
        ssh_identity_prefix(private_key, key_file),
        quote(repository),
        quote(refspec)
    )
}

fn deploy_key(ctx: &DeploymentContext) -> Result<Option<String>, DeployError> {
    match &ctx.application.deploy_key {
        None => Ok(None),
        Some(path) => std::fs::read_to_string(path)
            .map(Some)
            .map_err(|e| DeployError::fatal(format!("Failed to read deploy key {}: {}", path, e))),
    }
}

fn current_refspec(ctx: &DeploymentContext) -> String {
    refspec(
        ctx.application.provider,
        &ctx.request.git_ref,
        ctx.request.pull_request_id,
    )
}

/// Resolve the requested ref to a commit SHA without cloning.
///
/// Unparsable `ls-remote` output is logged and the deployment continues unpinned.
/// The ephemeral key is removed whatever the outcome.
pub async fn resolve_commit(
    ctx: &DeploymentContext,
    exec: &dyn RemoteExecutor,
) -> Result<ContextDelta, DeployError> {
    let mut stage = Stage::new(ctx, exec);

    if let Some(commit) = &ctx.request.commit {
        stage
            .info(&format!("Deploying pinned commit {}.", commit))
            .await?;
        return Ok(stage.finish());
    }

    let refspec = current_refspec(ctx);
    let key = deploy_key(ctx)?;
    let key_file = key_path(ctx);
    let command = ls_remote_command(
        &ctx.application.repository,
        &refspec,
        key.as_deref(),
        &key_file,
    );

    let resolved = stage
        .run(
            &command,
            ExecOptions::hidden().save_as("git_commit_sha"),
        )
        .await;
    if key.is_some() {
        remove_key(&mut stage, &key_file).await?;
    }
    resolved?;

    let line = stage
        .delta()
        .saved
        .get("git_commit_sha")
        .cloned()
        .unwrap_or_default();

    if !line.contains('\t') {
        stage
            .warn(&format!(
                "Could not parse commit SHA for {}: unexpected format from git ls-remote.",
                refspec
            ))
            .await?;
        return Ok(stage.finish());
    }

    match extract_sha(&line) {
        Some(sha) => {
            debug!("Resolved {} to {}", refspec, sha);
            stage.delta().commit = Some(sha);
        }
        None => {
            stage
                .warn(&format!("Could not parse commit SHA for {}.", refspec))
                .await?;
        }
    }

    Ok(stage.finish())
}

async fn remove_key(stage: &mut Stage<'_>, key_file: &str) -> Result<(), DeployError> {
    stage
        .run(
            &format!("rm -f {}", key_file),
            ExecOptions::hidden().ignore_errors(),
        )
        .await?;
    Ok(())
}

/// Clone the repository at the resolved ref, record the commit, import env
/// templates and drop the `.git` directory.
pub async fn clone_repository(
    ctx: &DeploymentContext,
    exec: &dyn RemoteExecutor,
) -> Result<ContextDelta, DeployError> {
    let mut stage = Stage::new(ctx, exec);
    let workdir = ctx.workdir();
    let refspec = current_refspec(ctx);
    let key = deploy_key(ctx)?;
    let key_file = key_path(ctx);

    stage
        .info(&format!(
            "Importing {}:{} (commit sha {}) to {}.",
            ctx.application.repository,
            ctx.request.git_ref,
            ctx.commit.as_deref().unwrap_or("HEAD"),
            workdir
        ))
        .await?;

    // Pinned commits (rollbacks) are fetched by SHA; everything else by refspec.
    let fetch_target = ctx.request.commit.as_deref().unwrap_or(&refspec);
    let checkout_target = ctx.commit.as_deref().unwrap_or("FETCH_HEAD");
    let prefix = ssh_identity_prefix(key.as_deref(), &key_file);
    let clone = format!(
        "mkdir -p {dir} && cd {dir} && git init -q && \
         {prefix}git fetch -q --depth=1 {repo} {fetch} && \
         git -c advice.detachedHead=false checkout -q {target}",
        dir = quote(&workdir),
        prefix = prefix,
        repo = quote(&ctx.application.repository),
        fetch = quote(fetch_target),
        target = quote(checkout_target),
    );
    let cloned = stage.run(&clone, ExecOptions::hidden()).await;
    if key.is_some() {
        remove_key(&mut stage, &key_file).await?;
    }
    cloned?;

    let sha = stage
        .run(
            &format!("cd {} && git rev-parse HEAD", quote(&workdir)),
            ExecOptions::hidden().save_as("git_head"),
        )
        .await?
        .stdout
        .trim()
        .to_string();
    let subject = stage
        .run(
            &format!("cd {} && git log -1 --pretty=%B", quote(&workdir)),
            ExecOptions::hidden().save_as("commit_message"),
        )
        .await?
        .stdout
        .trim()
        .to_string();

    let sha = ctx.commit.clone().unwrap_or(sha);
    let message = subject.lines().next().unwrap_or("").to_string();
    stage
        .set_commit(&sha, (!message.is_empty()).then_some(message.as_str()))
        .await?;

    env_template::import(&mut stage).await?;

    stage
        .run(
            &format!("cd {} && rm -fr .git", quote(&workdir)),
            ExecOptions::hidden(),
        )
        .await?;

    Ok(stage.finish())
}
