//! Registry Directory: issues bearer tokens and resolves repository endpoints.

use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_codeartifact::{error::DisplayErrorContext, types::PackageFormat};
use thiserror::Error;

use crate::config::RegistryConfig;

#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("issuing token for domain {domain}: {message}")]
    Token { domain: String, message: String },
    #[error("resolving endpoint for {domain}/{repository}: {message}")]
    Endpoint {
        domain: String,
        repository: String,
        message: String,
    },
}

/// Credential issuance and endpoint resolution for backend repositories.
#[async_trait]
pub trait RegistryDirectory: Send + Sync {
    async fn issue_token(&self, domain: &str, duration: Duration) -> Result<String, DirectoryError>;

    async fn resolve_endpoint(
        &self,
        domain: &str,
        repository: &str,
        format: &str,
    ) -> Result<String, DirectoryError>;
}

/// AWS CodeArtifact backed directory. All domains belong to one owner account.
#[derive(Debug, Clone)]
pub struct CodeArtifactDirectory {
    client: aws_sdk_codeartifact::Client,
    account_id: String,
}

impl CodeArtifactDirectory {
    pub async fn new(config: &RegistryConfig) -> Self {
        let shared = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(aws_sdk_codeartifact::config::Region::new(config.region.clone()))
            .load()
            .await;

        let mut builder = aws_sdk_codeartifact::config::Builder::from(&shared);
        if let Some(endpoint) = config.endpoint_url.clone() {
            builder = builder.endpoint_url(endpoint);
        }

        tracing::debug!(
            region = %config.region,
            account_id = %config.account_id,
            "CodeArtifact client initialized"
        );

        Self {
            client: aws_sdk_codeartifact::Client::from_conf(builder.build()),
            account_id: config.account_id.clone(),
        }
    }
}

#[async_trait]
impl RegistryDirectory for CodeArtifactDirectory {
    async fn issue_token(&self, domain: &str, duration: Duration) -> Result<String, DirectoryError> {
        let output = self
            .client
            .get_authorization_token()
            .domain(domain)
            .domain_owner(&self.account_id)
            .duration_seconds(duration.as_secs() as i64)
            .send()
            .await
            .map_err(|err| DirectoryError::Token {
                domain: domain.to_string(),
                message: DisplayErrorContext(&err).to_string(),
            })?;

        output
            .authorization_token()
            .map(str::to_string)
            .ok_or_else(|| DirectoryError::Token {
                domain: domain.to_string(),
                message: "response carried no authorization token".to_string(),
            })
    }

    async fn resolve_endpoint(
        &self,
        domain: &str,
        repository: &str,
        format: &str,
    ) -> Result<String, DirectoryError> {
        let endpoint_error = |message: String| DirectoryError::Endpoint {
            domain: domain.to_string(),
            repository: repository.to_string(),
            message,
        };

        let output = self
            .client
            .get_repository_endpoint()
            .domain(domain)
            .domain_owner(&self.account_id)
            .repository(repository)
            .format(PackageFormat::from(format))
            .send()
            .await
            .map_err(|err| endpoint_error(DisplayErrorContext(&err).to_string()))?;

        output
            .repository_endpoint()
            .map(str::to_string)
            .ok_or_else(|| endpoint_error("response carried no repository endpoint".to_string()))
    }
}

/// The endpoint CodeArtifact publishes for a repository, derived without an API call.
///
/// Pure: identical inputs always yield the identical URL.
pub fn derive_endpoint(
    domain: &str,
    account_id: &str,
    region: &str,
    format: &str,
    repository: &str,
) -> String {
    format!("https://{domain}-{account_id}.d.codeartifact.{region}.amazonaws.com/{format}/{repository}/")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derive_endpoint_matches_codeartifact_layout() {
        assert_eq!(
            derive_endpoint("test-domain", "123456789012", "us-east-1", "pypi", "test-repo"),
            "https://test-domain-123456789012.d.codeartifact.us-east-1.amazonaws.com/pypi/test-repo/"
        );
    }

    #[test]
    fn derive_endpoint_is_deterministic() {
        let a = derive_endpoint("acme", "111111111111", "eu-west-1", "npm", "js");
        let b = derive_endpoint("acme", "111111111111", "eu-west-1", "npm", "js");
        assert_eq!(a, b);
    }

    #[test]
    fn directory_errors_name_the_target() {
        let err = DirectoryError::Endpoint {
            domain: "acme".to_string(),
            repository: "libs".to_string(),
            message: "access denied".to_string(),
        };
        assert_eq!(err.to_string(), "resolving endpoint for acme/libs: access denied");
    }
}
