use std::time::Duration;

use anyhow::{Result, bail};
use serde::Deserialize;

/// Shortest and longest token lifetimes CodeArtifact will issue.
pub const MIN_TOKEN_DURATION_SECS: u64 = 900;
pub const MAX_TOKEN_DURATION_SECS: u64 = 43_200;

/// Coordinates of the AWS account that owns every configured domain.
#[derive(Debug, Clone, Deserialize)]
pub struct RegistryConfig {
    #[serde(default)]
    pub account_id: String,
    #[serde(default)]
    pub region: String,
    #[serde(default = "RegistryConfig::default_token_duration_secs")]
    pub token_duration_secs: u64,
    /// Overrides the CodeArtifact API endpoint (local stacks, VPC endpoints).
    #[serde(default)]
    pub endpoint_url: Option<String>,
}

impl RegistryConfig {
    fn default_token_duration_secs() -> u64 {
        MAX_TOKEN_DURATION_SECS
    }

    pub fn token_duration(&self) -> Duration {
        Duration::from_secs(self.token_duration_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if self.account_id.trim().is_empty() {
            bail!("registry.account_id is required (or set CAP_ACCOUNT_ID)");
        }
        if self.region.trim().is_empty() {
            bail!("registry.region is required (or set CAP_REGION)");
        }
        if !(MIN_TOKEN_DURATION_SECS..=MAX_TOKEN_DURATION_SECS).contains(&self.token_duration_secs)
        {
            bail!(
                "registry.token_duration_secs must be between {MIN_TOKEN_DURATION_SECS} and {MAX_TOKEN_DURATION_SECS} (got {})",
                self.token_duration_secs
            );
        }
        Ok(())
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            account_id: String::new(),
            region: String::new(),
            token_duration_secs: Self::default_token_duration_secs(),
            endpoint_url: None,
        }
    }
}
