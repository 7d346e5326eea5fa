//! Kind to REST resource mapping
//!
//! Bindings reference services and workloads by apiVersion and kind. Reading
//! those objects and writing webhook rules both need the plural resource
//! name, which only API discovery knows.

use async_trait::async_trait;
use dashmap::DashMap;
use kube::api::{ApiResource, GroupVersionKind};
use kube::Client;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use crate::{Error, Result};

/// Resolves a group/version/kind to its REST resource
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ResourceMapper: Send + Sync {
    /// Map a kind to its API resource (including the plural name).
    ///
    /// Fails with [`Error::Mapping`] when the kind is not served.
    async fn resolve(&self, gvk: &GroupVersionKind) -> Result<ApiResource>;
}

type CacheKey = (String, String, String);

/// Discovery-backed mapper with a per-kind cache.
///
/// Only successful lookups are cached, so a CRD installed after start-up is
/// picked up the next time a binding references it.
pub struct DiscoveryMapper {
    client: Client,
    entries: DashMap<CacheKey, ApiResource>,
}

impl DiscoveryMapper {
    /// Create a mapper querying the given cluster
    pub fn new(client: Client) -> Self {
        Self {
            client,
            entries: DashMap::new(),
        }
    }
}

fn cache_key(gvk: &GroupVersionKind) -> CacheKey {
    (gvk.group.clone(), gvk.version.clone(), gvk.kind.clone())
}

#[async_trait]
impl ResourceMapper for DiscoveryMapper {
    async fn resolve(&self, gvk: &GroupVersionKind) -> Result<ApiResource> {
        let key = cache_key(gvk);
        if let Some(ar) = self.entries.get(&key) {
            return Ok(ar.clone());
        }

        let (ar, _caps) = kube::discovery::pinned_kind(&self.client, gvk)
            .await
            .map_err(|e| Error::mapping(&gvk.group, &gvk.version, &gvk.kind, e.to_string()))?;

        debug!(
            group = %gvk.group,
            version = %gvk.version,
            kind = %gvk.kind,
            plural = %ar.plural,
            "Discovered resource mapping"
        );
        self.entries.insert(key, ar.clone());
        Ok(ar)
    }
}
