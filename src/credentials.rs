//! Credential cache: per-domain bearer tokens and per-host backend endpoints.
//!
//! Readers take a cheap clone of the current immutable snapshot under a read
//! lock; a refresh builds a complete replacement off to the side and swaps it
//! in under the write lock. A reader therefore sees either the previous cycle
//! or the new one, never a token from one and an endpoint from the other.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use thiserror::Error;

use crate::directory::{DirectoryError, RegistryDirectory};
use crate::proxy::{TargetError, UpstreamTarget};
use crate::routing::{RoutingTable, normalize_host};

/// Opaque backend bearer token. Never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct BearerToken(String);

impl BearerToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for BearerToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("BearerToken(***)")
    }
}

#[derive(Debug, Error)]
pub enum RefreshError {
    #[error(transparent)]
    Directory(#[from] DirectoryError),
    #[error("endpoint for {domain}/{repository} rejected: {source}")]
    InvalidEndpoint {
        domain: String,
        repository: String,
        #[source]
        source: TargetError,
    },
}

/// Everything needed to forward one request, taken from a single snapshot.
#[derive(Debug, Clone)]
pub struct ResolvedBackend {
    pub token: BearerToken,
    pub target: UpstreamTarget,
}

#[derive(Debug, Default)]
struct Snapshot {
    tokens: HashMap<String, BearerToken>,
    endpoints: HashMap<String, UpstreamTarget>,
}

/// Outcome of the refresh cycles so far, exposed through the health endpoint.
#[derive(Debug, Clone, Default)]
pub struct RefreshStatus {
    pub last_success: Option<DateTime<Utc>>,
    pub last_failure: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub consecutive_failures: u32,
}

impl RefreshStatus {
    pub fn is_healthy(&self) -> bool {
        self.last_success.is_some() && self.consecutive_failures == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefreshSummary {
    pub domains: usize,
    pub hosts: usize,
}

pub struct CredentialCache {
    routes: Arc<RoutingTable>,
    token_duration: Duration,
    snapshot: RwLock<Arc<Snapshot>>,
    status: Mutex<RefreshStatus>,
}

impl CredentialCache {
    pub fn new(routes: Arc<RoutingTable>, token_duration: Duration) -> Self {
        Self {
            routes,
            token_duration,
            snapshot: RwLock::new(Arc::new(Snapshot::default())),
            status: Mutex::new(RefreshStatus::default()),
        }
    }

    pub fn routes(&self) -> &RoutingTable {
        &self.routes
    }

    fn current(&self) -> Arc<Snapshot> {
        self.snapshot.read().clone()
    }

    pub fn get_token(&self, domain: &str) -> Option<BearerToken> {
        self.current().tokens.get(domain).cloned()
    }

    pub fn get_base_url(&self, host: &str) -> Option<UpstreamTarget> {
        self.current().endpoints.get(&normalize_host(host)).cloned()
    }

    /// Token and endpoint for a request, both read from the same refresh cycle.
    pub fn resolve(&self, host: &str, domain: &str) -> Option<ResolvedBackend> {
        let snapshot = self.current();
        let target = snapshot.endpoints.get(&normalize_host(host))?.clone();
        let token = snapshot.tokens.get(domain)?.clone();
        Some(ResolvedBackend { token, target })
    }

    /// True once a refresh has populated the cache.
    pub fn is_ready(&self) -> bool {
        !self.current().endpoints.is_empty()
    }

    pub fn status(&self) -> RefreshStatus {
        self.status.lock().clone()
    }

    /// Re-issues every domain token and re-resolves every repository endpoint.
    ///
    /// All-or-nothing: on any failure the previous snapshot stays in place and
    /// the error is recorded in [`RefreshStatus`]. Whether that is fatal is the
    /// caller's decision.
    pub async fn refresh(
        &self,
        directory: &dyn RegistryDirectory,
    ) -> Result<RefreshSummary, RefreshError> {
        match self.build_snapshot(directory).await {
            Ok(snapshot) => {
                let summary = RefreshSummary {
                    domains: snapshot.tokens.len(),
                    hosts: snapshot.endpoints.len(),
                };
                *self.snapshot.write() = Arc::new(snapshot);

                let mut status = self.status.lock();
                status.last_success = Some(Utc::now());
                status.consecutive_failures = 0;
                status.last_error = None;
                Ok(summary)
            }
            Err(err) => {
                self.record_failure(&err);
                Err(err)
            }
        }
    }

    /// Marks the cache as failing without touching the current snapshot.
    pub fn record_failure(&self, error: &dyn std::fmt::Display) {
        let mut status = self.status.lock();
        status.last_failure = Some(Utc::now());
        status.consecutive_failures += 1;
        status.last_error = Some(error.to_string());
    }

    async fn build_snapshot(
        &self,
        directory: &dyn RegistryDirectory,
    ) -> Result<Snapshot, RefreshError> {
        let mut snapshot = Snapshot::default();

        for domain in self.routes.domains() {
            let token = directory.issue_token(domain, self.token_duration).await?;
            tracing::debug!(domain, "issued backend token");
            snapshot
                .tokens
                .insert(domain.to_string(), BearerToken::new(token));
        }

        for descriptor in self.routes.descriptors() {
            let raw = directory
                .resolve_endpoint(&descriptor.domain, &descriptor.repository, &descriptor.format)
                .await?;
            let target =
                UpstreamTarget::parse(&raw).map_err(|source| RefreshError::InvalidEndpoint {
                    domain: descriptor.domain.clone(),
                    repository: descriptor.repository.clone(),
                    source,
                })?;
            tracing::debug!(
                domain = %descriptor.domain,
                repository = %descriptor.repository,
                endpoint = %target,
                "resolved backend endpoint"
            );
            for host in &descriptor.hosts {
                snapshot.endpoints.insert(host.clone(), target.clone());
            }
        }

        Ok(snapshot)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use parking_lot::Mutex;

    use crate::directory::{DirectoryError, RegistryDirectory};

    /// In-memory directory; tokens carry a generation counter so tests can tell cycles apart.
    #[derive(Default)]
    pub struct StaticDirectory {
        pub endpoints: Mutex<HashMap<(String, String), String>>,
        pub failing_domains: Mutex<Vec<String>>,
        pub generation: AtomicUsize,
        pub token_calls: AtomicUsize,
    }

    impl StaticDirectory {
        pub fn with_endpoint(self, domain: &str, repository: &str, url: &str) -> Self {
            self.endpoints
                .lock()
                .insert((domain.to_string(), repository.to_string()), url.to_string());
            self
        }

        pub fn next_generation(&self) {
            self.generation.fetch_add(1, Ordering::SeqCst);
        }

        pub fn fail_domain(&self, domain: &str) {
            self.failing_domains.lock().push(domain.to_string());
        }

        pub fn heal(&self) {
            self.failing_domains.lock().clear();
        }
    }

    #[async_trait]
    impl RegistryDirectory for StaticDirectory {
        async fn issue_token(
            &self,
            domain: &str,
            _duration: Duration,
        ) -> Result<String, DirectoryError> {
            self.token_calls.fetch_add(1, Ordering::SeqCst);
            if self.failing_domains.lock().iter().any(|d| d == domain) {
                return Err(DirectoryError::Token {
                    domain: domain.to_string(),
                    message: "throttled".to_string(),
                });
            }
            Ok(format!(
                "{domain}-token-{}",
                self.generation.load(Ordering::SeqCst)
            ))
        }

        async fn resolve_endpoint(
            &self,
            domain: &str,
            repository: &str,
            _format: &str,
        ) -> Result<String, DirectoryError> {
            self.endpoints
                .lock()
                .get(&(domain.to_string(), repository.to_string()))
                .cloned()
                .ok_or_else(|| DirectoryError::Endpoint {
                    domain: domain.to_string(),
                    repository: repository.to_string(),
                    message: "repository not found".to_string(),
                })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::StaticDirectory;
    use super::*;
    use crate::routing::RepositoryDescriptor;

    const LIBS_URL: &str = "https://acme-111111111111.d.codeartifact.eu-west-1.amazonaws.com/pypi/libs/";
    const JS_URL: &str = "https://acme-111111111111.d.codeartifact.eu-west-1.amazonaws.com/npm/js/";
    const BETA_URL: &str = "https://beta-111111111111.d.codeartifact.eu-west-1.amazonaws.com/npm/web/";

    fn routes() -> Arc<RoutingTable> {
        let descriptor = |hosts: &[&str], domain: &str, repository: &str, format: &str| {
            RepositoryDescriptor {
                hosts: hosts.iter().map(|h| h.to_string()).collect(),
                domain: domain.to_string(),
                repository: repository.to_string(),
                format: format.to_string(),
            }
        };
        Arc::new(
            RoutingTable::new(vec![
                descriptor(&["pkg.example.com"], "acme", "libs", "pypi"),
                descriptor(&["npm.example.com", "npm.internal"], "acme", "js", "npm"),
                descriptor(&["web.example.com"], "beta", "web", "npm"),
            ])
            .unwrap(),
        )
    }

    fn directory() -> StaticDirectory {
        StaticDirectory::default()
            .with_endpoint("acme", "libs", LIBS_URL)
            .with_endpoint("acme", "js", JS_URL)
            .with_endpoint("beta", "web", BETA_URL)
    }

    fn cache() -> CredentialCache {
        CredentialCache::new(routes(), Duration::from_secs(43_200))
    }

    #[test]
    fn empty_before_first_refresh() {
        let cache = cache();
        assert!(!cache.is_ready());
        assert!(cache.get_token("acme").is_none());
        assert!(cache.get_base_url("pkg.example.com").is_none());
        assert!(cache.resolve("pkg.example.com", "acme").is_none());
        assert!(!cache.status().is_healthy());
    }

    #[tokio::test]
    async fn refresh_populates_every_host_and_domain() {
        let cache = cache();
        let directory = directory();

        let summary = cache.refresh(&directory).await.unwrap();
        assert_eq!(summary, RefreshSummary { domains: 2, hosts: 4 });
        assert!(cache.is_ready());

        for (host, descriptor) in cache.routes().hosts() {
            let resolved = cache.resolve(host, &descriptor.domain).unwrap();
            assert_eq!(resolved.token.expose(), format!("{}-token-0", descriptor.domain));
        }

        let libs = cache.get_base_url("pkg.example.com").unwrap();
        assert_eq!(
            libs.to_string(),
            "https://acme-111111111111.d.codeartifact.eu-west-1.amazonaws.com/pypi/libs"
        );
        assert_eq!(
            cache.get_base_url("npm.internal"),
            cache.get_base_url("npm.example.com")
        );
        assert!(cache.status().is_healthy());
    }

    #[tokio::test]
    async fn one_token_per_distinct_domain() {
        let cache = cache();
        let directory = directory();
        cache.refresh(&directory).await.unwrap();
        assert_eq!(
            directory
                .token_calls
                .load(std::sync::atomic::Ordering::SeqCst),
            2
        );
    }

    #[tokio::test]
    async fn failed_refresh_keeps_previous_snapshot() {
        let cache = cache();
        let directory = directory();
        cache.refresh(&directory).await.unwrap();

        directory.next_generation();
        directory.fail_domain("beta");
        let err = cache.refresh(&directory).await.unwrap_err();
        assert!(matches!(err, RefreshError::Directory(_)));

        // acme was re-issued in the failed cycle but must not leak into the cache
        assert_eq!(cache.get_token("acme").unwrap().expose(), "acme-token-0");
        assert_eq!(cache.get_token("beta").unwrap().expose(), "beta-token-0");

        let status = cache.status();
        assert_eq!(status.consecutive_failures, 1);
        assert!(status.last_error.unwrap().contains("throttled"));
        assert!(!cache.status().is_healthy());

        directory.heal();
        cache.refresh(&directory).await.unwrap();
        assert_eq!(cache.get_token("acme").unwrap().expose(), "acme-token-1");
        assert_eq!(cache.status().consecutive_failures, 0);
    }

    #[tokio::test]
    async fn first_refresh_failure_leaves_cache_empty() {
        let cache = cache();
        let directory = directory();
        directory.fail_domain("acme");

        assert!(cache.refresh(&directory).await.is_err());
        assert!(!cache.is_ready());
        assert!(cache.get_token("beta").is_none());
    }

    #[tokio::test]
    async fn non_https_endpoint_is_rejected() {
        let cache = cache();
        let directory = directory().with_endpoint("beta", "web", "http://insecure.example.com/npm/web/");

        let err = cache.refresh(&directory).await.unwrap_err();
        match err {
            RefreshError::InvalidEndpoint { source, .. } => {
                assert!(matches!(source, TargetError::NotHttps(_)));
            }
            other => panic!("unexpected error {other}"),
        }
        assert!(!cache.is_ready());
    }

    #[tokio::test]
    async fn missing_endpoint_fails_the_cycle() {
        let cache = cache();
        let directory = StaticDirectory::default().with_endpoint("acme", "libs", LIBS_URL);
        assert!(cache.refresh(&directory).await.is_err());
        assert!(!cache.is_ready());
    }

    #[tokio::test]
    async fn lookups_normalize_host() {
        let cache = cache();
        cache.refresh(&directory()).await.unwrap();
        assert!(cache.get_base_url("PKG.example.com:5000").is_some());
        assert!(cache.resolve("pkg.example.com:443", "acme").is_some());
        assert!(cache.resolve("pkg.example.com", "unknown").is_none());
    }

    #[test]
    fn bearer_token_debug_is_redacted() {
        let token = BearerToken::new("super-secret");
        assert_eq!(format!("{token:?}"), "BearerToken(***)");
        assert_eq!(token.expose(), "super-secret");
    }

    #[tokio::test]
    async fn concurrent_readers_never_see_mixed_cycles() {
        let cache = Arc::new(cache());
        let directory = Arc::new(directory());
        cache.refresh(directory.as_ref()).await.unwrap();

        let reader = {
            let cache = cache.clone();
            tokio::spawn(async move {
                for _ in 0..2_000 {
                    let resolved = cache.resolve("npm.example.com", "acme").unwrap();
                    assert!(resolved.token.expose().starts_with("acme-token-"));
                    assert_eq!(resolved.target.base_path(), "/npm/js");
                    tokio::task::yield_now().await;
                }
            })
        };

        for _ in 0..50 {
            directory.next_generation();
            cache.refresh(directory.as_ref()).await.unwrap();
            tokio::task::yield_now().await;
        }
        reader.await.unwrap();
    }
}
