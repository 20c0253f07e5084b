//! Periodic reconciliation of cached instances against the registry
//!
//! Sites that were unpublished or trashed since their instance was built are
//! torn down here, even if no request for them ever arrives again.

use crate::cache::TenantCache;
use crate::error::Result;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info};

pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(60);

pub struct Janitor {
    cache: Arc<TenantCache>,
    interval: Duration,
}

impl Janitor {
    pub fn new(cache: Arc<TenantCache>, interval: Duration) -> Self {
        Self { cache, interval }
    }

    /// Tear down every Ready, unpinned instance whose tenant is no longer
    /// live. Returns the evicted ids.
    pub async fn sweep(&self) -> Result<Vec<String>> {
        let ids = self.cache.ready_unpinned_ids();
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let live: HashSet<String> = self
            .cache
            .registry()
            .live_ids(&ids)
            .await?
            .into_iter()
            .collect();

        let dead: Vec<String> = ids.into_iter().filter(|id| !live.contains(id)).collect();
        debug!(checked = live.len() + dead.len(), dead = dead.len(), "Janitor sweep");

        let evictions = dead.iter().map(|id| self.cache.evict(id, "unpublished"));
        let results = futures::future::join_all(evictions).await;

        let evicted: Vec<String> = dead
            .into_iter()
            .zip(results)
            .filter_map(|(id, evicted)| evicted.then_some(id))
            .collect();
        for id in &evicted {
            info!(tenant_id = %id, "Evicted instance of site that is no longer live");
        }
        Ok(evicted)
    }

    pub async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {
                    if let Err(e) = self.sweep().await {
                        error!(error = %e, "Janitor sweep failed");
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }
        debug!("Janitor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheSettings;
    use crate::instance::testing::EchoInstance;
    use crate::instance::{ConfigOverlay, InstanceFactory, InstanceState, TenantInstance};
    use crate::tenant::testing::MemoryRegistry;
    use crate::tenant::TenantRecord;
    use async_trait::async_trait;

    struct EchoFactory;

    #[async_trait]
    impl InstanceFactory for EchoFactory {
        async fn build(
            &self,
            record: &TenantRecord,
            _overlay: &ConfigOverlay,
        ) -> Result<Arc<dyn TenantInstance>> {
            Ok(Arc::new(EchoInstance::new(&record.id)))
        }
    }

    async fn create_warm_cache() -> (Arc<TenantCache>, Arc<MemoryRegistry>) {
        let registry = Arc::new(MemoryRegistry::default());
        for id in ["a", "b", "c"] {
            registry.put(TenantRecord::new(id, &format!("{}.example", id)));
        }
        let cache = TenantCache::new(registry.clone(), Arc::new(EchoFactory), CacheSettings::default());
        for id in ["a", "b", "c"] {
            cache.acquire(id).await.unwrap();
        }
        (cache, registry)
    }

    #[tokio::test]
    async fn test_sweep_evicts_unpublished_and_trashed() {
        let (cache, registry) = create_warm_cache().await;
        registry.update("a", |r| r.published = false);
        registry.update("b", |r| r.trashed = true);

        let janitor = Janitor::new(cache.clone(), DEFAULT_INTERVAL);
        let mut evicted = janitor.sweep().await.unwrap();
        evicted.sort();

        assert_eq!(evicted, vec!["a", "b"]);
        assert_eq!(cache.state("a"), None);
        assert_eq!(cache.state("b"), None);
        assert_eq!(cache.state("c"), Some(InstanceState::Ready));
    }

    #[tokio::test]
    async fn test_sweep_skips_pinned() {
        let (cache, registry) = create_warm_cache().await;
        cache.pin("a");
        registry.update("a", |r| r.published = false);

        let janitor = Janitor::new(cache.clone(), DEFAULT_INTERVAL);
        assert!(janitor.sweep().await.unwrap().is_empty());
        assert_eq!(cache.state("a"), Some(InstanceState::Ready));
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let (cache, registry) = create_warm_cache().await;
        registry.update("c", |r| r.published = false);
        let (tx, rx) = watch::channel(false);

        let janitor = Janitor::new(cache.clone(), Duration::from_millis(20));
        let task = tokio::spawn(janitor.run(rx));

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(cache.state("c"), None);

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }
}
