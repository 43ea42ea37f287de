use anyhow::{Result, bail};
use serde::Deserialize;

/// Front-door Basic auth. With neither a secret nor a static pair the proxy is anonymous.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthConfig {
    /// Secrets Manager id holding `{"username": ..., "password": ...}`.
    #[serde(default)]
    pub secret_id: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

impl AuthConfig {
    pub fn validate(&self) -> Result<()> {
        let username = self.username.as_deref().is_some_and(|v| !v.is_empty());
        let password = self.password.as_deref().is_some_and(|v| !v.is_empty());
        if username != password {
            bail!("auth.username and auth.password must be set together");
        }
        if self.secret_id.is_some() && username {
            bail!("auth.secret_id and a static auth.username/password are mutually exclusive");
        }
        Ok(())
    }
}
