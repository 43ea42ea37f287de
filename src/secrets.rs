//! Secret Store: resolves the front-door Basic credentials.

use async_trait::async_trait;
use aws_sdk_secretsmanager::error::DisplayErrorContext;
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SecretError {
    #[error("fetching secret {secret_id}: {message}")]
    Fetch { secret_id: String, message: String },
    #[error("secret {secret_id} has no string value")]
    Empty { secret_id: String },
    #[error("secret {secret_id} is not a username/password document: {source}")]
    Malformed {
        secret_id: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("secret {secret_id} is missing a non-empty {field}")]
    MissingField {
        secret_id: String,
        field: &'static str,
    },
}

/// Username/password pair accepted by the proxy's own front door.
#[derive(Clone, PartialEq, Eq, Deserialize)]
pub struct FrontDoorCredentials {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

impl std::fmt::Debug for FrontDoorCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrontDoorCredentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

impl FrontDoorCredentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    /// Parses the JSON secret document `{"username": "...", "password": "..."}`.
    pub fn from_secret_string(secret_id: &str, raw: &str) -> Result<Self, SecretError> {
        let credentials: Self =
            serde_json::from_str(raw).map_err(|source| SecretError::Malformed {
                secret_id: secret_id.to_string(),
                source,
            })?;

        if credentials.username.is_empty() {
            return Err(SecretError::MissingField {
                secret_id: secret_id.to_string(),
                field: "username",
            });
        }
        if credentials.password.is_empty() {
            return Err(SecretError::MissingField {
                secret_id: secret_id.to_string(),
                field: "password",
            });
        }
        Ok(credentials)
    }
}

#[async_trait]
pub trait SecretStore: Send + Sync {
    async fn fetch(&self, secret_id: &str) -> Result<FrontDoorCredentials, SecretError>;
}

#[derive(Debug, Clone)]
pub struct SecretsManagerStore {
    client: aws_sdk_secretsmanager::Client,
}

impl SecretsManagerStore {
    pub async fn new(region: &str) -> Self {
        let shared = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(aws_sdk_secretsmanager::config::Region::new(region.to_string()))
            .load()
            .await;

        Self {
            client: aws_sdk_secretsmanager::Client::new(&shared),
        }
    }
}

#[async_trait]
impl SecretStore for SecretsManagerStore {
    async fn fetch(&self, secret_id: &str) -> Result<FrontDoorCredentials, SecretError> {
        let output = self
            .client
            .get_secret_value()
            .secret_id(secret_id)
            .send()
            .await
            .map_err(|err| SecretError::Fetch {
                secret_id: secret_id.to_string(),
                message: DisplayErrorContext(&err).to_string(),
            })?;

        let raw = output.secret_string().ok_or_else(|| SecretError::Empty {
            secret_id: secret_id.to_string(),
        })?;

        let credentials = FrontDoorCredentials::from_secret_string(secret_id, raw)?;
        tracing::info!(secret_id, username = %credentials.username, "loaded front-door credentials");
        Ok(credentials)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_username_and_password() {
        let creds = FrontDoorCredentials::from_secret_string(
            "proxy/front-door",
            r#"{"username": "ci", "password": "hunter2"}"#,
        )
        .unwrap();
        assert_eq!(creds, FrontDoorCredentials::new("ci", "hunter2"));
    }

    #[test]
    fn missing_password_is_rejected() {
        let err = FrontDoorCredentials::from_secret_string("s", r#"{"username": "ci"}"#)
            .unwrap_err();
        assert!(matches!(err, SecretError::MissingField { field: "password", .. }));
    }

    #[test]
    fn empty_username_is_rejected() {
        let err = FrontDoorCredentials::from_secret_string(
            "s",
            r#"{"username": "", "password": "x"}"#,
        )
        .unwrap_err();
        assert!(matches!(err, SecretError::MissingField { field: "username", .. }));
    }

    #[test]
    fn non_json_secret_is_rejected() {
        let err = FrontDoorCredentials::from_secret_string("s", "ci:hunter2").unwrap_err();
        assert!(matches!(err, SecretError::Malformed { .. }));
    }

    #[test]
    fn debug_hides_password() {
        let rendered = format!("{:?}", FrontDoorCredentials::new("ci", "hunter2"));
        assert!(rendered.contains("ci"));
        assert!(!rendered.contains("hunter2"));
    }
}
