use anyhow::{Result, bail};
use serde::Deserialize;

/// One backend repository and the public hostnames routed to it.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct RepositoryConfig {
    pub hosts: Vec<String>,
    pub domain: String,
    pub repository: String,
    /// Package format as CodeArtifact names it (`pypi`, `npm`, `maven`, ...).
    pub format: String,
}

impl RepositoryConfig {
    pub fn validate(&self) -> Result<()> {
        if self.hosts.is_empty() {
            bail!("repository {} declares no hosts", self.repository);
        }
        if self.hosts.iter().any(|host| host.trim().is_empty()) {
            bail!("repository {} declares an empty host", self.repository);
        }
        if self.domain.trim().is_empty() {
            bail!("repository domain must not be empty");
        }
        if self.repository.trim().is_empty() {
            bail!("repository name must not be empty");
        }
        if self.format.trim().is_empty() {
            bail!("repository {} has no package format", self.repository);
        }
        Ok(())
    }
}

/// Entry of the JSON repositories file, in the field names deployments already use.
#[derive(Debug, Clone, Deserialize)]
pub struct RepositoryFileEntry {
    pub hosts: Vec<String>,
    pub code_artifact_domain: String,
    pub code_artifact_repository: String,
    pub package_manager_format: String,
}

impl From<RepositoryFileEntry> for RepositoryConfig {
    fn from(entry: RepositoryFileEntry) -> Self {
        Self {
            hosts: entry.hosts,
            domain: entry.code_artifact_domain,
            repository: entry.code_artifact_repository,
            format: entry.package_manager_format,
        }
    }
}
