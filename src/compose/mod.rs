use minijinja::Environment;
use serde_yaml::{Mapping, Value};

use crate::canary::backend_port;
use crate::deploy::context::{ContextDelta, DeploymentContext, Stage};
use crate::deploy::error::DeployError;
use crate::executor::{quote, write_file_command, ExecOptions, RemoteExecutor};
use crate::model::{BuildPack, EnvVariable};
use crate::secrets::inject_into_compose;
use crate::traefik::Route;

const COMPOSE_TEMPLATE: &str = include_str!("../../templates/docker-compose.yml.j2");

/// Manifest for the dockerfile and dockerimage build packs.
pub fn generate_manifest(ctx: &DeploymentContext) -> Result<String, DeployError> {
    let route = ctx.application.fqdn.as_deref().and_then(Route::from_fqdn);

    let mut env = Environment::new();
    env.add_template("compose", COMPOSE_TEMPLATE)?;
    let rendered = env.get_template("compose")?.render(minijinja::context! {
        service => ctx.application.uuid(),
        image => ctx.image_name(),
        container_name => ctx.container_name(),
        application => ctx.application.uuid(),
        deployment => ctx.deployment_id().to_string(),
        pull_request => ctx.request.pull_request_id,
        host => route.as_ref().map(|r| r.host.clone()),
        tls => route.as_ref().map_or(false, |r| r.tls),
        entrypoint => route.as_ref().map_or("web", Route::entrypoint),
        port => backend_port(ctx.application.ports_exposes.as_deref()),
    })?;
    Ok(rendered)
}

/// Patch a repository compose file: labels on every service and, when enabled,
/// build secrets on every service that builds.
pub fn prepare_repository_manifest(
    ctx: &DeploymentContext,
    content: &str,
) -> Result<String, DeployError> {
    let mut manifest: Value = serde_yaml::from_str(content)?;
    if !manifest.get("services").is_some_and(Value::is_mapping) {
        return Err(DeployError::fatal(format!(
            "{} has no services.",
            ctx.application.compose_file
        )));
    }

    let labels = [
        ("dockyard.managed", "true".to_string()),
        ("dockyard.application", ctx.application.uuid().to_string()),
        ("dockyard.deployment", ctx.deployment_id().to_string()),
        ("dockyard.pull_request", ctx.request.pull_request_id.to_string()),
    ];
    if let Some(services) = manifest.get_mut("services").and_then(Value::as_mapping_mut) {
        for (_, service) in services.iter_mut() {
            let Some(service) = service.as_mapping_mut() else {
                continue;
            };
            add_labels(service, &labels);
        }
    }

    if ctx.application.settings.build_secrets {
        if let Some(set) = &ctx.build_secrets {
            inject_into_compose(&mut manifest, &set.keys());
        }
    }

    Ok(serde_yaml::to_string(&manifest)?)
}

fn add_labels(service: &mut Mapping, labels: &[(&str, String)]) {
    let entry = service
        .entry("labels".into())
        .or_insert_with(|| Value::Mapping(Mapping::new()));

    match entry {
        Value::Mapping(map) => {
            for (key, value) in labels {
                map.insert((*key).into(), Value::String(value.clone()));
            }
        }
        Value::Sequence(list) => {
            for (key, value) in labels {
                list.push(Value::String(format!("{}={}", key, value)));
            }
        }
        other => {
            let mut map = Mapping::new();
            for (key, value) in labels {
                map.insert((*key).into(), Value::String(value.clone()));
            }
            *other = Value::Mapping(map);
        }
    }
}

/// `.env` content for runtime variables. Values that would not survive a bare
/// `KEY=value` line are double-quoted with escapes.
pub fn render_env_file<'a>(variables: impl IntoIterator<Item = &'a EnvVariable>) -> String {
    let mut lines: Vec<String> = variables
        .into_iter()
        .filter(|v| v.is_runtime)
        .map(|v| {
            if v.value.contains(['\n', '"', '\'', '#', ' ', '$', '\\']) {
                let escaped = v
                    .value
                    .replace('\\', "\\\\")
                    .replace('"', "\\\"")
                    .replace('$', "$$")
                    .replace('\n', "\\n");
                format!("{}=\"{}\"", v.key, escaped)
            } else {
                format!("{}={}", v.key, v.value)
            }
        })
        .collect();
    lines.push(String::new());
    lines.join("\n")
}

/// Write `.env` and the compose manifest into the release directory.
pub async fn write_manifest(ctx: &DeploymentContext, exec: &dyn RemoteExecutor) -> Result<ContextDelta, DeployError> {
    let mut stage = Stage::new(ctx, exec);
    let variables = ctx.variables();

    stage
        .run(
            &format!("mkdir -p {}", quote(&ctx.workdir())),
            ExecOptions::hidden(),
        )
        .await?;
    stage
        .run(
            &write_file_command(&ctx.env_file(), &render_env_file(&variables)),
            ExecOptions::hidden(),
        )
        .await?;

    let manifest = match ctx.application.build_pack {
        BuildPack::Dockercompose => {
            let output = stage
                .run(
                    &format!("cat {}", quote(&ctx.compose_path())),
                    ExecOptions::hidden().ignore_errors(),
                )
                .await?;
            if !output.success() {
                return Err(DeployError::fatal(format!(
                    "{} not found in the repository.",
                    ctx.application.compose_file
                )));
            }
            prepare_repository_manifest(ctx, &output.stdout)?
        }
        BuildPack::Dockerfile | BuildPack::Dockerimage => generate_manifest(ctx)?,
    };

    stage
        .run(
            &write_file_command(&ctx.compose_path(), &manifest),
            ExecOptions::hidden(),
        )
        .await?;
    stage.info("Generated compose manifest.").await?;
    Ok(stage.finish())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deploy::context::testing::{application, context, context_with};
    use crate::executor::fake::ScriptedExecutor;
    use crate::model::DeploymentRequest;
    use crate::secrets::BuildSecretSet;

    #[tokio::test]
    async fn generated_manifest_carries_labels_and_route() {
        let ctx = context().await;
        let yaml = generate_manifest(&ctx).unwrap();
        let doc: Value = serde_yaml::from_str(&yaml).unwrap();
        let service = &doc["services"]["shop"];
        let name = ctx.container_name();

        assert_eq!(service["container_name"], Value::from(name.as_str()));
        assert_eq!(service["labels"]["dockyard.application"], Value::from("shop"));
        assert_eq!(
            service["labels"]["dockyard.deployment"],
            Value::from(ctx.deployment_id().to_string())
        );
        assert_eq!(
            service["labels"][format!("traefik.http.routers.{}.rule", name).as_str()],
            Value::from("Host(`shop.example.com`)")
        );
        assert_eq!(doc["networks"]["traefik"]["external"], Value::from(true));
    }

    #[tokio::test]
    async fn manifest_without_fqdn_has_no_router() {
        let mut app = application();
        app.fqdn = None;
        let ctx = context_with(app, DeploymentRequest::new("shop", "edge-1", "main")).await;
        let yaml = generate_manifest(&ctx).unwrap();
        assert!(!yaml.contains("traefik.enable"));
    }

    #[tokio::test]
    async fn repository_manifest_gets_labels_and_secrets() {
        let mut app = application();
        app.build_pack = BuildPack::Dockercompose;
        let mut ctx = context_with(app, DeploymentRequest::new("shop", "edge-1", "main")).await;
        ctx.build_secrets = Some(BuildSecretSet::from_variables(
            &[EnvVariable::new("TOKEN", "x")],
            "k",
        )
        .unwrap());

        let yaml = prepare_repository_manifest(
            &ctx,
            "services:\n  web:\n    build: .\n    labels:\n      - app=web\n  redis:\n    image: redis:7\n",
        )
        .unwrap();
        let doc: Value = serde_yaml::from_str(&yaml).unwrap();

        assert_eq!(doc["services"]["web"]["labels"][0], Value::from("app=web"));
        assert_eq!(
            doc["services"]["web"]["labels"][1],
            Value::from("dockyard.managed=true")
        );
        assert_eq!(
            doc["services"]["redis"]["labels"]["dockyard.application"],
            Value::from("shop")
        );
        assert!(doc["services"]["redis"]["build"].is_null());
        assert_eq!(doc["services"]["web"]["build"]["secrets"][0], Value::from("TOKEN"));
        assert_eq!(doc["secrets"]["TOKEN"]["environment"], Value::from("TOKEN"));
    }

    #[tokio::test]
    async fn repository_manifest_needs_services() {
        let ctx = context().await;
        assert!(prepare_repository_manifest(&ctx, "version: '3'\n").is_err());
    }

    #[test]
    fn env_file_contains_runtime_variables_only() {
        let mut build_only = EnvVariable::new("NPM_TOKEN", "t");
        build_only.is_runtime = false;
        let vars = vec![
            EnvVariable::new("PORT", "3000"),
            EnvVariable::new("CERT", "a\nb"),
            EnvVariable::new("GREETING", "say \"hi\" $USER"),
            build_only,
        ];

        let content = render_env_file(&vars);

        assert_eq!(
            content,
            "PORT=3000\nCERT=\"a\\nb\"\nGREETING=\"say \\\"hi\\\" $$USER\"\n"
        );
    }

    #[tokio::test]
    async fn write_manifest_hides_env_values() {
        let mut app = application();
        app.variables.push(EnvVariable::new("DB_PASSWORD", "hunter2"));
        let ctx = context_with(app, DeploymentRequest::new("shop", "edge-1", "main")).await;
        let exec = ScriptedExecutor::new();

        write_manifest(&ctx, &exec).await.unwrap();

        assert!(exec.calls().iter().all(|(_, o)| o.hidden));
        assert!(exec.ran("docker-compose.dockyard.yml"));
        let record = ctx.store.load(ctx.deployment_id()).await.unwrap();
        let visible: Vec<_> = record.visible_logs().map(|e| e.message.clone()).collect();
        assert_eq!(visible, vec!["Generated compose manifest.".to_string()]);
    }

    #[tokio::test]
    async fn missing_repository_compose_file_is_fatal() {
        let mut app = application();
        app.build_pack = BuildPack::Dockercompose;
        let ctx = context_with(app, DeploymentRequest::new("shop", "edge-1", "main")).await;
        let exec = ScriptedExecutor::new().fail("cat ", 1);

        let err = write_manifest(&ctx, &exec).await.unwrap_err();
        assert!(err.to_string().contains("docker-compose.yml not found"));
    }
}
