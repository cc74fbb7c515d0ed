use serde::{Deserialize, Serialize};

use super::EnvVariable;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GitProvider {
    #[default]
    Github,
    Gitea,
    Gitlab,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildPack {
    #[default]
    Dockerfile,
    Dockercompose,
    Dockerimage,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Team {
    pub id: u64,
    pub name: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Project {
    pub name: String,
    pub team: Option<Team>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Environment {
    pub name: String,
    pub project: Option<Project>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationSettings {
    #[serde(default)]
    pub consistent_container_name: bool,
    #[serde(default = "default_true")]
    pub build_secrets: bool,
    #[serde(default)]
    pub auto_rollback: bool,
    #[serde(default)]
    pub canary: bool,
    #[serde(default = "default_canary_weight")]
    pub canary_weight: u8,
    #[serde(default)]
    pub only_this_server: bool,
}

impl Default for ApplicationSettings {
    fn default() -> Self {
        Self {
            consistent_container_name: false,
            build_secrets: true,
            auto_rollback: false,
            canary: false,
            canary_weight: default_canary_weight(),
            only_this_server: false,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_canary_weight() -> u8 {
    10
}

fn default_branch() -> String {
    "main".to_string()
}

fn default_compose_file() -> String {
    "docker-compose.yml".to_string()
}

fn default_dockerfile() -> String {
    "Dockerfile".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Application {
    pub name: String,
    #[serde(default)]
    pub uuid: Option<String>,
    pub repository: String,
    #[serde(default = "default_branch")]
    pub branch: String,
    #[serde(default)]
    pub provider: GitProvider,
    /// Path to the private deploy key used for git over SSH.
    #[serde(default)]
    pub deploy_key: Option<String>,
    #[serde(default)]
    pub build_pack: BuildPack,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default = "default_compose_file")]
    pub compose_file: String,
    #[serde(default = "default_dockerfile")]
    pub dockerfile: String,
    #[serde(default)]
    pub fqdn: Option<String>,
    #[serde(default)]
    pub ports_exposes: Option<String>,
    /// Additional server names this application is deployed to.
    #[serde(default)]
    pub destinations: Vec<String>,
    #[serde(default)]
    pub settings: ApplicationSettings,
    #[serde(default)]
    pub environment: Option<Environment>,
    #[serde(default, rename = "env")]
    pub variables: Vec<EnvVariable>,
}

impl Application {
    pub fn uuid(&self) -> &str {
        self.uuid.as_deref().unwrap_or(&self.name)
    }

    /// Owning team, if every link of the environment → project → team chain is present.
    pub fn team(&self) -> Option<&Team> {
        self.environment.as_ref()?.project.as_ref()?.team.as_ref()
    }

    /// Variables of the preview or production partition.
    pub fn variables_for(&self, preview: bool) -> impl Iterator<Item = &EnvVariable> {
        self.variables.iter().filter(move |v| v.is_preview == preview)
    }

    pub fn is_single_server(&self) -> bool {
        self.settings.only_this_server || self.destinations.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Server {
    pub name: String,
    pub address: String,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    /// Runs the master reverse proxy; other servers sync their routes into it.
    #[serde(default)]
    pub primary: bool,
    /// Images are built here and shipped to the target server.
    #[serde(default)]
    pub build_server: bool,
}

impl Server {
    pub fn user(&self) -> &str {
        self.user.as_deref().unwrap_or("deploy")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn app() -> Application {
        toml::from_str(
            r#"
            name = "web"
            repository = "git@github.com:acme/web.git"
            "#,
        )
        .unwrap()
    }

    #[test]
    fn defaults_from_minimal_toml() {
        let app = app();
        assert_eq!(app.branch, "main");
        assert_eq!(app.provider, GitProvider::Github);
        assert_eq!(app.build_pack, BuildPack::Dockerfile);
        assert_eq!(app.uuid(), "web");
        assert!(app.settings.build_secrets);
        assert_eq!(app.settings.canary_weight, 10);
    }

    #[test]
    fn team_requires_full_chain() {
        let mut app = app();
        assert!(app.team().is_none());

        app.environment = Some(Environment {
            name: "production".into(),
            project: Some(Project {
                name: "shop".into(),
                team: None,
            }),
        });
        assert!(app.team().is_none());

        if let Some(project) = app.environment.as_mut().and_then(|e| e.project.as_mut()) {
            project.team = Some(Team {
                id: 7,
                name: "core".into(),
            });
        }
        assert_eq!(app.team().map(|t| t.id), Some(7));
    }

    #[test]
    fn variables_partition_by_preview() {
        let mut app = app();
        let mut preview = EnvVariable::new("A", "1");
        preview.is_preview = true;
        app.variables = vec![EnvVariable::new("A", "2"), preview];

        assert_eq!(app.variables_for(false).count(), 1);
        assert_eq!(app.variables_for(true).next().map(|v| v.value.as_str()), Some("1"));
    }
}
