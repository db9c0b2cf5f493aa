//! Bounded pool of live sub-domain clones.

use std::sync::Arc;

use indexmap::IndexMap;

use crate::clone::SubdomainClone;

/// Get-or-create map from replica domain name to live clone, bounded by
/// entry count with least-recently-used eviction. Evicted clones are
/// closed asynchronously and best-effort — a stuck close must not block
/// insertion of a new entry.
///
/// Mutating access is expected to happen while the caller holds the
/// tenant registry's write lock, so two callers never race to create two
/// clones for the same identity; the cache itself is not locked.
pub struct SubdomainCache {
    entries: IndexMap<String, Arc<SubdomainClone>>,
    max: usize,
}

impl SubdomainCache {
    /// Create a cache bounded at `max` live clones.
    pub fn new(max: usize) -> Self {
        Self {
            entries: IndexMap::new(),
            max: max.max(1),
        }
    }

    /// Look up a live clone, refreshing its recency.
    pub fn get(&mut self, domain: &str) -> Option<Arc<SubdomainClone>> {
        let entry = self.entries.shift_remove(domain)?;
        self.entries.insert(domain.to_string(), entry.clone());
        Some(entry)
    }

    /// Insert a live clone, evicting the least-recently-used entry past
    /// the bound.
    pub fn insert(&mut self, domain: impl Into<String>, clone: Arc<SubdomainClone>) {
        let domain = domain.into();
        self.entries.shift_remove(&domain);
        while self.entries.len() >= self.max {
            if let Some((evicted_domain, evicted)) = self.entries.shift_remove_index(0) {
                tracing::debug!(domain = %evicted_domain, "evicting sub-domain clone");
                close_detached(evicted);
            }
        }
        self.entries.insert(domain, clone);
    }

    /// Remove a clone, handing it back to the caller unclosed.
    pub fn remove(&mut self, domain: &str) -> Option<Arc<SubdomainClone>> {
        self.entries.shift_remove(domain)
    }

    /// Whether a clone is cached for the domain.
    pub fn contains(&self, domain: &str) -> bool {
        self.entries.contains_key(domain)
    }

    /// Number of live clones.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Close every clone, awaiting completion. Used for shutdown.
    pub async fn clear(&mut self) {
        for (domain, clone) in self.entries.drain(..) {
            if let Err(e) = clone.close().await {
                tracing::warn!(%domain, error = %e, "failed to close sub-domain clone");
            }
        }
    }
}

/// Close a clone in the background, logging rather than retrying on
/// failure.
fn close_detached(clone: Arc<SubdomainClone>) {
    tokio::spawn(async move {
        if let Err(e) = clone.close().await {
            tracing::warn!(domain = clone.domain(), error = %e, "failed to close evicted clone");
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clone::SubdomainSpec;
    use crate::memory::MemoryCloneFactory;
    use crate::replica::{CloneFactory, Replica, ReplicaConfig, ReusableConfig};

    async fn make_clone(
        factory: &MemoryCloneFactory,
        dir: &std::path::Path,
        name: &str,
    ) -> Arc<SubdomainClone> {
        let domain = format!("{name}.acme.ex.org");
        let replica = factory
            .create(
                &ReplicaConfig {
                    id: format!("gw-{name}"),
                    domain: domain.clone(),
                    genesis: true,
                    reusable: ReusableConfig::default(),
                },
                dir,
            )
            .await
            .unwrap();
        Arc::new(
            SubdomainClone::new(
                SubdomainSpec::new("acme", name, false),
                replica,
                &dir.join(format!("{name}.redb")),
                None,
            )
            .unwrap(),
        )
    }

    #[tokio::test]
    async fn test_lru_eviction_closes_oldest() {
        let factory = MemoryCloneFactory::new();
        let dir = tempfile::tempdir().unwrap();
        let mut cache = SubdomainCache::new(2);

        let a = make_clone(&factory, dir.path(), "a").await;
        cache.insert(a.domain().to_string(), a.clone());
        let b = make_clone(&factory, dir.path(), "b").await;
        cache.insert(b.domain().to_string(), b.clone());

        // Refresh "a" so "b" becomes the eviction candidate
        assert!(cache.get(a.domain()).is_some());

        let c = make_clone(&factory, dir.path(), "c").await;
        cache.insert(c.domain().to_string(), c);
        assert_eq!(cache.len(), 2);
        assert!(cache.contains(a.domain()));
        assert!(!cache.contains(b.domain()));

        // The evicted clone's replica winds down in the background
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(b.replica().online().await.is_err());
    }

    #[tokio::test]
    async fn test_clear_closes_everything() {
        let factory = MemoryCloneFactory::new();
        let dir = tempfile::tempdir().unwrap();
        let mut cache = SubdomainCache::new(10);

        let a = make_clone(&factory, dir.path(), "a").await;
        let b = make_clone(&factory, dir.path(), "b").await;
        cache.insert(a.domain().to_string(), a.clone());
        cache.insert(b.domain().to_string(), b.clone());

        cache.clear().await;
        assert!(cache.is_empty());
        assert!(a.replica().online().await.is_err());
        assert!(b.replica().online().await.is_err());
    }

    #[tokio::test]
    async fn test_remove_hands_back_unclosed() {
        let factory = MemoryCloneFactory::new();
        let dir = tempfile::tempdir().unwrap();
        let mut cache = SubdomainCache::new(10);

        let a = make_clone(&factory, dir.path(), "a").await;
        cache.insert(a.domain().to_string(), a.clone());
        let removed = cache.remove(a.domain()).unwrap();
        assert!(removed.replica().online().await.is_ok());
    }
}
