//! Host-based routing table.
//!
//! Built once at startup and never mutated afterwards, so lookups need no
//! synchronisation.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use thiserror::Error;

use crate::config::RepositoryConfig;

/// One configured backend repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepositoryDescriptor {
    pub hosts: Vec<String>,
    pub domain: String,
    pub repository: String,
    pub format: String,
}

impl From<&RepositoryConfig> for RepositoryDescriptor {
    fn from(config: &RepositoryConfig) -> Self {
        Self {
            hosts: config.hosts.clone(),
            domain: config.domain.trim().to_string(),
            repository: config.repository.trim().to_string(),
            format: config.format.trim().to_ascii_lowercase(),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RoutingError {
    #[error("host {host} is claimed by both {first} and {second}")]
    DuplicateHost {
        host: String,
        first: String,
        second: String,
    },
    #[error("repository {repository} declares an empty host")]
    EmptyHost { repository: String },
}

#[derive(Debug, Clone, Default)]
pub struct RoutingTable {
    by_host: HashMap<String, Arc<RepositoryDescriptor>>,
    descriptors: Vec<Arc<RepositoryDescriptor>>,
}

impl RoutingTable {
    pub fn new(descriptors: Vec<RepositoryDescriptor>) -> Result<Self, RoutingError> {
        let mut by_host: HashMap<String, Arc<RepositoryDescriptor>> = HashMap::new();
        let mut owned = Vec::with_capacity(descriptors.len());

        for mut descriptor in descriptors {
            descriptor.hosts = descriptor.hosts.iter().map(|h| normalize_host(h)).collect();
            let descriptor = Arc::new(descriptor);
            for host in &descriptor.hosts {
                if host.is_empty() {
                    return Err(RoutingError::EmptyHost {
                        repository: descriptor.repository.clone(),
                    });
                }
                if let Some(existing) = by_host.get(host) {
                    return Err(RoutingError::DuplicateHost {
                        host: host.clone(),
                        first: label(existing),
                        second: label(&descriptor),
                    });
                }
                by_host.insert(host.clone(), descriptor.clone());
            }
            owned.push(descriptor);
        }

        Ok(Self {
            by_host,
            descriptors: owned,
        })
    }

    pub fn from_config(repositories: &[RepositoryConfig]) -> Result<Self, RoutingError> {
        Self::new(repositories.iter().map(RepositoryDescriptor::from).collect())
    }

    /// Looks up the descriptor for an inbound `Host` value. Case and any port suffix are ignored.
    pub fn resolve(&self, host: &str) -> Option<&Arc<RepositoryDescriptor>> {
        self.by_host.get(&normalize_host(host))
    }

    pub fn descriptors(&self) -> &[Arc<RepositoryDescriptor>] {
        &self.descriptors
    }

    /// Distinct backend domains, in a stable order.
    pub fn domains(&self) -> BTreeSet<&str> {
        self.descriptors.iter().map(|d| d.domain.as_str()).collect()
    }

    pub fn hosts(&self) -> impl Iterator<Item = (&str, &Arc<RepositoryDescriptor>)> {
        self.by_host.iter().map(|(host, d)| (host.as_str(), d))
    }

    pub fn len(&self) -> usize {
        self.by_host.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_host.is_empty()
    }
}

fn label(descriptor: &RepositoryDescriptor) -> String {
    format!("{}/{}", descriptor.domain, descriptor.repository)
}

/// Lowercases and drops a `:port` suffix (IPv6 literals keep their brackets).
pub fn normalize_host(raw: &str) -> String {
    let host = raw.trim();
    let without_port = if let Some(rest) = host.strip_prefix('[') {
        match rest.find(']') {
            Some(end) => &host[..end + 2],
            None => host,
        }
    } else {
        match host.rsplit_once(':') {
            Some((name, port)) if port.chars().all(|c| c.is_ascii_digit()) => name,
            _ => host,
        }
    };
    without_port.trim_end_matches('.').to_ascii_lowercase()
}
