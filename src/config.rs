use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result, bail};
use serde::Deserialize;

pub mod auth;
pub mod logging;
pub mod refresh;
pub mod registry;
pub mod repository;
pub mod server;
pub mod upstream;


pub use auth::AuthConfig;
pub use logging::LoggingConfig;
pub use refresh::RefreshConfig;
pub use registry::RegistryConfig;
pub use repository::{RepositoryConfig, RepositoryFileEntry};
pub use server::ServerConfig;
pub use upstream::UpstreamConfig;

pub const DEFAULT_CONFIG_FILE: &str = "caproxy.toml";

#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub refresh: RefreshConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Optional JSON file with additional repositories in the deployment format.
    #[serde(default)]
    pub repositories_file: Option<PathBuf>,
    #[serde(default)]
    pub repositories: Vec<RepositoryConfig>,
}

impl Config {
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let candidate = path.unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));
        let (mut config, base_dir) = if candidate.exists() {
            let raw = fs::read_to_string(&candidate)
                .with_context(|| format!("failed to read config {}", candidate.display()))?;
            let config: Config = toml::from_str(&raw)
                .with_context(|| format!("invalid config {}", candidate.display()))?;
            let base_dir = candidate
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from("."));
            (config, base_dir)
        } else {
            tracing::warn!(
                path = %candidate.display(),
                "configuration file not found, using defaults"
            );
            let cwd = std::env::current_dir().context("reading current directory")?;
            (Config::default(), cwd)
        };

        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        config.load_repositories_file(&base_dir)?;
        Ok(config)
    }

    /// Applies `CAP_*` overrides on top of the file configuration.
    ///
    /// The lookup is injected so tests do not have to mutate the process environment.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        if let Some(region) = non_empty("CAP_REGION") {
            self.registry.region = region;
        }
        if let Some(account_id) = non_empty("CAP_ACCOUNT_ID") {
            self.registry.account_id = account_id;
        }
        if let Some(port) = non_empty("CAP_PORT") {
            self.server.port = port
                .trim()
                .parse()
                .with_context(|| format!("CAP_PORT is not a valid port: {port}"))?;
        }
        if let Some(path) = non_empty("CAP_HEALTH_CHECK_PATH") {
            self.server.health_check_path = path;
        }
        if let Some(secret_id) = non_empty("CAP_AUTH_SECRET") {
            self.auth.secret_id = Some(secret_id);
        }
        if let Some(path) = non_empty("CAP_CONFIG_PATH") {
            self.repositories_file = Some(PathBuf::from(path));
        }
        Ok(())
    }

    fn load_repositories_file(&mut self, base_dir: &Path) -> Result<()> {
        let Some(path) = self.repositories_file.as_mut() else {
            return Ok(());
        };
        if path.is_relative() {
            *path = base_dir.join(&*path);
        }

        let raw = fs::read_to_string(&*path).with_context(|| {
            format!(
                "failed to read repositories file {}; make sure it was provisioned before startup",
                path.display()
            )
        })?;
        let entries: Vec<RepositoryFileEntry> = serde_json::from_str(&raw)
            .with_context(|| format!("invalid repositories file {}", path.display()))?;

        tracing::debug!(
            path = %path.display(),
            count = entries.len(),
            "loaded repositories file"
        );
        self.repositories
            .extend(entries.into_iter().map(RepositoryConfig::from));
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.repositories.is_empty() {
            bail!("no repositories configured");
        }
        self.registry.validate()?;
        self.refresh.validate()?;
        self.auth.validate()?;

        if !self.server.health_check_path.starts_with('/') {
            bail!(
                "server.health_check_path must start with '/' (got {})",
                self.server.health_check_path
            );
        }

        for (idx, repository) in self.repositories.iter().enumerate() {
            repository
                .validate()
                .with_context(|| format!("repository #{idx}"))?;
        }
        Ok(())
    }
}
