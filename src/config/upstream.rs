use std::time::Duration;

use serde::Deserialize;

/// Outbound forwarding behaviour.
#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamConfig {
    /// Upper bound for receiving the backend response head. Unset means no timeout.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    /// `User-Agent` prefixes of clients whose metadata responses are rewritten.
    #[serde(default = "UpstreamConfig::default_rewrite_user_agents")]
    pub rewrite_user_agents: Vec<String>,
    /// Content types (substring match) eligible for body rewriting.
    #[serde(default = "UpstreamConfig::default_rewrite_content_types")]
    pub rewrite_content_types: Vec<String>,
    /// Ceiling on a gunzipped metadata body. Larger bodies fail the request.
    #[serde(default = "UpstreamConfig::default_max_decoded_body_bytes")]
    pub max_decoded_body_bytes: u64,
}

impl UpstreamConfig {
    fn default_rewrite_user_agents() -> Vec<String> {
        ["npm", "pnpm", "yarn", "Bun"]
            .into_iter()
            .map(str::to_string)
            .collect()
    }

    fn default_rewrite_content_types() -> Vec<String> {
        ["application/json", "application/vnd.npm.install-v1+json"]
            .into_iter()
            .map(str::to_string)
            .collect()
    }

    fn default_max_decoded_body_bytes() -> u64 {
        256 * 1024 * 1024
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            timeout_secs: None,
            rewrite_user_agents: Self::default_rewrite_user_agents(),
            rewrite_content_types: Self::default_rewrite_content_types(),
            max_decoded_body_bytes: Self::default_max_decoded_body_bytes(),
        }
    }
}
