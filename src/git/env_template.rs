//! Materialise variables declared in a repository's `.env` template.

use tracing::warn;

use crate::deploy::context::Stage;
use crate::deploy::error::DeployError;
use crate::executor::{quote, ExecOptions};
use crate::model::EnvVariable;

/// Checked in this order; the first non-empty one wins.
pub const TEMPLATE_FILES: [&str; 3] = [".env.example", ".env.sample", ".env.template"];

const PLACEHOLDERS: &[&str] = &["changeme", "change_me", "change-me", "xxx", "todo", "replace_me"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateEntry {
    pub key: String,
    pub value: String,
    pub is_required: bool,
}

/// Parse dotenv-style template content.
///
/// An entry is required when its value is empty, looks like a placeholder, or the
/// line ends with a `# required` comment. Keys that are not plain shell names are
/// dropped.
pub fn parse(content: &str) -> Vec<TemplateEntry> {
    let mut entries = Vec::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line = line.strip_prefix("export ").unwrap_or(line);
        let Some((key, rest)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        if !EnvVariable::is_valid_key(key) {
            warn!("Ignoring template entry with invalid name {:?}", key);
            continue;
        }

        let rest = rest.trim();
        let (value, comment) = split_value(rest);
        let marked = comment
            .map(|c| c.to_lowercase().contains("required"))
            .unwrap_or(false);

        entries.push(TemplateEntry {
            key: key.to_string(),
            is_required: marked || is_placeholder(&value),
            value,
        });
    }
    entries
}

/// Split `value  # comment`, honouring quoted values.
fn split_value(rest: &str) -> (String, Option<&str>) {
    for quote_char in ['"', '\''] {
        if let Some(inner) = rest.strip_prefix(quote_char) {
            if let Some(end) = inner.find(quote_char) {
                let comment = inner[end + 1..].trim().strip_prefix('#').map(str::trim);
                return (inner[..end].to_string(), comment);
            }
        }
    }
    match rest.find(" #") {
        Some(idx) => (
            rest[..idx].trim().to_string(),
            Some(rest[idx + 2..].trim()),
        ),
        None => (rest.to_string(), None),
    }
}

fn is_placeholder(value: &str) -> bool {
    let lower = value.trim().to_lowercase();
    lower.is_empty()
        || PLACEHOLDERS.contains(&lower.as_str())
        || lower.starts_with("your_")
        || lower.starts_with("your-")
        || (lower.starts_with('<') && lower.ends_with('>'))
}

/// Best-effort framework guess from the key set of a template.
pub fn detect_framework(keys: &[&str]) -> Option<&'static str> {
    let has = |k: &str| keys.iter().any(|key| key.eq_ignore_ascii_case(k));
    let prefixed = |p: &str| keys.iter().any(|key| key.to_uppercase().starts_with(p));

    if has("ADMIN_JWT_SECRET") && has("API_TOKEN_SALT") {
        Some("Strapi")
    } else if has("APP_KEY") && has("DB_CONNECTION") {
        Some("Laravel")
    } else if has("APP_SECRET") && has("APP_ENV") {
        Some("Symfony")
    } else if prefixed("DJANGO_") {
        Some("Django")
    } else if has("RAILS_ENV") || has("SECRET_KEY_BASE") {
        Some("Rails")
    } else if prefixed("NEXT_PUBLIC_") || has("NEXTAUTH_URL") {
        Some("Next.js")
    } else if prefixed("NUXT_") {
        Some("Nuxt")
    } else if prefixed("VITE_") {
        Some("Vite")
    } else if prefixed("PUBLIC_") && has("ORIGIN") {
        Some("SvelteKit")
    } else if prefixed("PRISMA_") || has("SHADOW_DATABASE_URL") {
        Some("Prisma")
    } else {
        None
    }
}

#[derive(Debug, Default)]
pub struct ImportPlan {
    pub created: Vec<EnvVariable>,
    pub skipped: usize,
    pub required_unfilled: Vec<String>,
    pub total: usize,
    pub framework: Option<&'static str>,
}

/// Decide which template entries become new variables. Existing keys (compared
/// case-insensitively within the same preview partition) are never overwritten.
pub fn plan(
    existing: &[EnvVariable],
    entries: &[TemplateEntry],
    template: &str,
    preview: bool,
) -> ImportPlan {
    let keys: Vec<&str> = entries.iter().map(|e| e.key.as_str()).collect();
    let mut plan = ImportPlan {
        total: entries.len(),
        framework: detect_framework(&keys),
        ..ImportPlan::default()
    };

    for entry in entries {
        let already_defined = existing
            .iter()
            .filter(|v| v.is_preview == preview)
            .chain(plan.created.iter())
            .any(|v| v.key.eq_ignore_ascii_case(&entry.key));
        if already_defined {
            plan.skipped += 1;
            continue;
        }

        if entry.is_required {
            plan.required_unfilled.push(entry.key.clone());
        }
        plan.created.push(EnvVariable {
            key: entry.key.clone(),
            value: entry.value.clone(),
            is_runtime: true,
            is_buildtime: true,
            is_required: entry.is_required,
            is_preview: preview,
            source_template: Some(template.to_string()),
        });
    }

    plan
}

/// Read the first available template from the working tree and add the
/// missing variables to the stage delta.
pub async fn import(stage: &mut Stage<'_>) -> Result<(), DeployError> {
    let ctx = stage.ctx();
    let workdir = ctx.workdir();

    let mut found = None;
    for file in TEMPLATE_FILES {
        let output = stage
            .run(
                &format!("cat {}/{} 2>/dev/null || echo ''", quote(&workdir), file),
                ExecOptions::hidden().ignore_errors(),
            )
            .await?;
        if !output.stdout.trim().is_empty() {
            found = Some((file, output.stdout));
            break;
        }
    }

    let Some((file, content)) = found else {
        return Ok(());
    };
    let entries = parse(&content);
    if entries.is_empty() {
        return Ok(());
    }

    let plan = plan(&ctx.application.variables, &entries, file, ctx.is_preview());

    if let Some(framework) = plan.framework {
        stage
            .info(&format!("Detected {} environment template.", framework))
            .await?;
    }
    stage
        .info(&format!("Found {} variable(s) in {}.", plan.total, file))
        .await?;
    stage
        .info(&format!("Created {} new variable(s).", plan.created.len()))
        .await?;
    stage
        .info(&format!("Skipped {} already defined variable(s).", plan.skipped))
        .await?;
    if !plan.required_unfilled.is_empty() {
        stage
            .warn(&format!(
                "Required variables need values: {}",
                plan.required_unfilled.join(", ")
            ))
            .await?;
    }

    stage.delta().new_variables.extend(plan.created);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deploy::context::testing::{application, context_with};
    use crate::deploy::context::Stage;
    use crate::executor::fake::ScriptedExecutor;
    use crate::model::DeploymentRequest;

    #[test]
    fn parses_comments_quotes_and_requiredness() {
        let entries = parse(
            "# Database\n\
             DB_HOST=localhost\n\
             DB_PASSWORD=\n\
             export API_KEY=\"your_api_key\"\n\
             MAIL_FROM='ops@example.com' # required\n\
             PORT=3000 # http port\n\
             not a variable\n",
        );

        let summary: Vec<_> = entries
            .iter()
            .map(|e| (e.key.as_str(), e.value.as_str(), e.is_required))
            .collect();
        assert_eq!(
            summary,
            vec![
                ("DB_HOST", "localhost", false),
                ("DB_PASSWORD", "", true),
                ("API_KEY", "your_api_key", true),
                ("MAIL_FROM", "ops@example.com", true),
                ("PORT", "3000", false),
            ]
        );
    }

    #[test]
    fn rejects_keys_that_are_not_shell_names() {
        let entries = parse(
            "X$(touch${IFS}/tmp/pwned)=1\n\
             `id`=2\n\
             9LIVES=3\n\
             GOOD_KEY=4\n",
        );

        let keys: Vec<_> = entries.iter().map(|e| e.key.as_str()).collect();
        assert_eq!(keys, vec!["GOOD_KEY"]);
    }

    #[test]
    fn placeholder_values_are_required() {
        assert!(is_placeholder("changeme"));
        assert!(is_placeholder("<token>"));
        assert!(is_placeholder("YOUR-SECRET"));
        assert!(!is_placeholder("postgres://db"));
    }

    #[test]
    fn detects_frameworks() {
        assert_eq!(detect_framework(&["APP_KEY", "DB_CONNECTION"]), Some("Laravel"));
        assert_eq!(detect_framework(&["NEXT_PUBLIC_API", "X"]), Some("Next.js"));
        assert_eq!(detect_framework(&["DJANGO_SECRET_KEY"]), Some("Django"));
        assert_eq!(detect_framework(&["VITE_URL"]), Some("Vite"));
        assert_eq!(detect_framework(&["DATABASE_URL", "SHADOW_DATABASE_URL"]), Some("Prisma"));
        assert_eq!(detect_framework(&["PORT"]), None);
    }

    #[test]
    fn existing_keys_match_case_insensitively() {
        let existing = vec![EnvVariable::new("API_KEY", "live")];
        let entries = parse("Api_Key=changeme\nNEW_ONE=1\n");

        let plan = plan(&existing, &entries, ".env.example", false);

        assert_eq!(plan.skipped, 1);
        assert_eq!(plan.created.len(), 1);
        let created = &plan.created[0];
        assert_eq!(created.key, "NEW_ONE");
        assert!(created.is_runtime && created.is_buildtime);
        assert_eq!(created.source_template.as_deref(), Some(".env.example"));
    }

    #[test]
    fn preview_partition_is_separate() {
        let existing = vec![EnvVariable::new("TOKEN", "prod")];
        let entries = parse("TOKEN=\n");

        let plan = plan(&existing, &entries, ".env.sample", true);

        assert_eq!(plan.skipped, 0);
        assert!(plan.created[0].is_preview);
        assert_eq!(plan.required_unfilled, vec!["TOKEN".to_string()]);
    }

    #[tokio::test]
    async fn skips_already_defined_host() {
        let mut app = application();
        app.variables.push(EnvVariable::new("db_host", "prod.internal"));
        let ctx = context_with(app, DeploymentRequest::new("shop", "edge-1", "main")).await;
        let exec = ScriptedExecutor::new().on(".env.example", "DB_HOST=changeme\n");

        let mut stage = Stage::new(&ctx, &exec);
        import(&mut stage).await.unwrap();
        let delta = stage.finish();

        assert!(delta.new_variables.is_empty());
        let record = ctx.store.load(ctx.deployment_id()).await.unwrap();
        let messages: Vec<_> = record.visible_logs().map(|e| e.message.clone()).collect();
        assert!(messages.contains(&"Skipped 1 already defined variable(s).".to_string()));
        assert!(messages.contains(&"Created 0 new variable(s).".to_string()));
        assert!(!exec.ran(".env.sample"));
    }

    #[tokio::test]
    async fn falls_back_through_template_names() {
        let mut request = DeploymentRequest::new("shop", "edge-1", "main");
        request.pull_request_id = 3;
        let ctx = context_with(application(), request).await;
        let exec = ScriptedExecutor::new().on(".env.template", "SECRET_KEY_BASE=\n");

        let mut stage = Stage::new(&ctx, &exec);
        import(&mut stage).await.unwrap();
        let delta = stage.finish();

        assert!(exec.ran(".env.example") && exec.ran(".env.sample"));
        assert_eq!(delta.new_variables.len(), 1);
        assert!(delta.new_variables[0].is_preview);
        let record = ctx.store.load(ctx.deployment_id()).await.unwrap();
        assert!(record.visible_logs().any(|e| e.message.contains("Rails")));
        assert!(record
            .visible_logs()
            .any(|e| e.message.contains("SECRET_KEY_BASE")));
    }

    #[tokio::test]
    async fn missing_templates_are_a_no_op() {
        let ctx = context_with(application(), DeploymentRequest::new("shop", "edge-1", "main")).await;
        let exec = ScriptedExecutor::new();

        let mut stage = Stage::new(&ctx, &exec);
        import(&mut stage).await.unwrap();

        assert!(stage.finish().new_variables.is_empty());
        assert_eq!(exec.commands().len(), 3);
        assert!(exec.calls().iter().all(|(_, o)| o.hidden && o.ignore_errors));
    }
}
