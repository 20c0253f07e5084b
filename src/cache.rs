//! Tenant instance cache
//!
//! Owns the id → slot map. Each tenant moves through `Pending → Ready →
//! Destroying → (removed)`. The map is only mutated through the entry API, so
//! checking a slot and marking it `Pending` or `Destroying` happens under the
//! shard lock with no suspension in between. Builds and teardowns run in
//! spawned tasks and report completion over watch channels, so a caller that
//! gives up waiting never cancels them.

use crate::error::{Error, Result};
use crate::instance::{ConfigOverlay, InstanceFactory, InstanceHandle, InstanceState};
use crate::tenant::{TenantRecord, TenantRegistry};
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Reference to a tenant passed to [`TenantCache::acquire`]
#[derive(Debug, Clone)]
pub enum TenantRef {
    /// Resolved against the registry on every pass
    Id(String),
    /// Used as given
    Record(TenantRecord),
}

impl TenantRef {
    pub fn id(&self) -> &str {
        match self {
            TenantRef::Id(id) => id,
            TenantRef::Record(record) => &record.id,
        }
    }
}

impl From<&str> for TenantRef {
    fn from(id: &str) -> Self {
        TenantRef::Id(id.to_string())
    }
}

impl From<TenantRecord> for TenantRef {
    fn from(record: TenantRecord) -> Self {
        TenantRef::Record(record)
    }
}

/// Outcome of a build, published to everyone waiting on it
#[derive(Debug, Clone)]
enum BuildStatus {
    Building,
    Ready,
    Failed(Error),
}

#[derive(Clone)]
enum Slot {
    Pending {
        build_id: u64,
        done: watch::Receiver<BuildStatus>,
    },
    Ready(InstanceHandle),
    Destroying {
        done: watch::Receiver<bool>,
    },
}

/// What `acquire` decided to do after inspecting the slot
enum Step {
    Return(InstanceHandle),
    AwaitBuild(u64, watch::Receiver<BuildStatus>),
    AwaitTeardown(watch::Receiver<bool>),
    StartBuild(u64, watch::Sender<BuildStatus>, watch::Receiver<BuildStatus>),
    StartTeardown(InstanceHandle, watch::Sender<bool>, watch::Receiver<bool>),
}

/// Timing limits for builds and teardowns
#[derive(Debug, Clone, Copy)]
pub struct CacheSettings {
    /// A build still running after this long is abandoned
    pub max_build: Duration,
    /// How long teardown waits for in-flight dispatches
    pub drain_timeout: Duration,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            max_build: Duration::from_secs(120),
            drain_timeout: Duration::from_secs(30),
        }
    }
}

/// One row of [`TenantCache::snapshot`]
#[derive(Debug, Clone, Serialize)]
pub struct SlotInfo {
    pub tenant_id: String,
    pub state: InstanceState,
    pub built_at_version: Option<DateTime<Utc>>,
    pub in_flight: usize,
    pub uptime_secs: Option<u64>,
    pub pinned: bool,
}

pub struct TenantCache {
    registry: Arc<dyn TenantRegistry>,
    factory: Arc<dyn InstanceFactory>,
    settings: CacheSettings,
    slots: DashMap<String, Slot>,
    pinned: RwLock<HashSet<String>>,
    next_build_id: AtomicU64,
}

impl TenantCache {
    pub fn new(
        registry: Arc<dyn TenantRegistry>,
        factory: Arc<dyn InstanceFactory>,
        settings: CacheSettings,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            factory,
            settings,
            slots: DashMap::new(),
            pinned: RwLock::new(HashSet::new()),
            next_build_id: AtomicU64::new(1),
        })
    }

    pub fn registry(&self) -> &Arc<dyn TenantRegistry> {
        &self.registry
    }

    /// Exclude a tenant from janitor sweeps
    pub fn pin(&self, tenant_id: &str) {
        self.pinned.write().insert(tenant_id.to_string());
    }

    pub fn is_pinned(&self, tenant_id: &str) -> bool {
        self.pinned.read().contains(tenant_id)
    }

    /// Current state of a tenant's slot, if any
    pub fn state(&self, tenant_id: &str) -> Option<InstanceState> {
        self.slots.get(tenant_id).map(|slot| match slot.value() {
            Slot::Pending { .. } => InstanceState::Pending,
            Slot::Ready(handle) => handle.state(),
            Slot::Destroying { .. } => InstanceState::Destroying,
        })
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Ids of Ready slots that the janitor is allowed to reap
    pub fn ready_unpinned_ids(&self) -> Vec<String> {
        let pinned = self.pinned.read();
        self.slots
            .iter()
            .filter(|entry| matches!(entry.value(), Slot::Ready(_)))
            .map(|entry| entry.key().clone())
            .filter(|id| !pinned.contains(id))
            .collect()
    }

    pub async fn acquire(self: &Arc<Self>, tenant: impl Into<TenantRef>) -> Result<InstanceHandle> {
        self.acquire_with_overlay(tenant, &ConfigOverlay::default())
            .await
    }

    /// Return a ready, current instance for the tenant, building it if needed.
    ///
    /// The overlay only applies when this call ends up starting the build.
    pub async fn acquire_with_overlay(
        self: &Arc<Self>,
        tenant: impl Into<TenantRef>,
        overlay: &ConfigOverlay,
    ) -> Result<InstanceHandle> {
        let tenant = tenant.into();
        let id = tenant.id().to_string();

        loop {
            let record = match &tenant {
                TenantRef::Record(record) => record.clone(),
                TenantRef::Id(id) => self
                    .registry
                    .find_by_id(id)
                    .await?
                    .ok_or_else(|| Error::TenantNotFound(id.clone()))?,
            };

            match self.inspect(&record) {
                Step::Return(handle) => return Ok(handle),
                Step::AwaitBuild(build_id, done) => {
                    self.await_build(&id, build_id, done).await?;
                }
                Step::AwaitTeardown(done) => {
                    self.await_teardown(&id, done).await;
                }
                Step::StartBuild(build_id, tx, done) => {
                    self.spawn_build(record, overlay.clone(), build_id, tx);
                    self.await_build(&id, build_id, done).await?;
                }
                Step::StartTeardown(handle, tx, done) => {
                    info!(
                        tenant_id = %id,
                        built_at = %handle.built_at_version(),
                        updated_at = %record.updated_at,
                        "Site configuration changed, rebuilding instance"
                    );
                    self.spawn_teardown(handle, tx, "stale");
                    self.await_teardown(&id, done).await;
                }
            }
        }
    }

    /// Check the slot and, when needed, mark it under the shard lock
    fn inspect(&self, record: &TenantRecord) -> Step {
        match self.slots.entry(record.id.clone()) {
            Entry::Occupied(mut entry) => match entry.get().clone() {
                Slot::Pending { build_id, done } => Step::AwaitBuild(build_id, done),
                Slot::Destroying { done } => Step::AwaitTeardown(done),
                Slot::Ready(handle) if handle.built_at_version() < record.updated_at => {
                    handle.retire();
                    let (tx, rx) = watch::channel(false);
                    entry.insert(Slot::Destroying { done: rx.clone() });
                    Step::StartTeardown(handle, tx, rx)
                }
                Slot::Ready(handle) => Step::Return(handle),
            },
            Entry::Vacant(entry) => {
                let build_id = self.next_build_id.fetch_add(1, Ordering::Relaxed);
                let (tx, rx) = watch::channel(BuildStatus::Building);
                entry.insert(Slot::Pending {
                    build_id,
                    done: rx.clone(),
                });
                Step::StartBuild(build_id, tx, rx)
            }
        }
    }

    fn spawn_build(
        self: &Arc<Self>,
        record: TenantRecord,
        overlay: ConfigOverlay,
        build_id: u64,
        done: watch::Sender<BuildStatus>,
    ) {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let id = record.id.clone();
            let start = Instant::now();
            info!(tenant_id = %id, site = record.display_name(), "Building site instance");

            let max_build = cache.settings.max_build;
            let outcome =
                match tokio::time::timeout(max_build, cache.factory.build(&record, &overlay)).await {
                    Ok(Ok(instance)) => Ok(instance),
                    Ok(Err(err @ Error::BuildFailure { .. })) => Err(err),
                    Ok(Err(err)) => Err(Error::BuildFailure {
                        tenant_id: id.clone(),
                        message: err.to_string(),
                    }),
                    Err(_) => Err(Error::BuildTimeout {
                        tenant_id: id.clone(),
                        timeout: max_build,
                    }),
                };

            match outcome {
                Ok(instance) => {
                    let handle = InstanceHandle::new(&id, record.updated_at, instance);
                    cache.slots.insert(id.clone(), Slot::Ready(handle));
                    info!(
                        tenant_id = %id,
                        site = record.display_name(),
                        elapsed_ms = start.elapsed().as_millis(),
                        "Site instance ready"
                    );
                    let _ = done.send(BuildStatus::Ready);
                }
                Err(err) => {
                    cache.remove_pending(&id, build_id);
                    error!(tenant_id = %id, site = record.display_name(), error = %err, "Site instance build failed");
                    let _ = done.send(BuildStatus::Failed(err));
                }
            }
        });
    }

    fn spawn_teardown(
        self: &Arc<Self>,
        handle: InstanceHandle,
        done: watch::Sender<bool>,
        reason: &'static str,
    ) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let id = handle.tenant_id().to_string();
            debug!(tenant_id = %id, reason, "Tearing down site instance");

            if let Err(err) = handle.teardown(cache.settings.drain_timeout).await {
                warn!(tenant_id = %id, error = %err, "Teardown failed, discarding instance anyway");
            }

            cache
                .slots
                .remove_if(&id, |_, slot| matches!(slot, Slot::Destroying { .. }));
            info!(tenant_id = %id, reason, "Site instance torn down");
            let _ = done.send(true);
        })
    }

    fn remove_pending(&self, id: &str, build_id: u64) {
        self.slots.remove_if(id, |_, slot| {
            matches!(slot, Slot::Pending { build_id: current, .. } if *current == build_id)
        });
    }

    /// Park until the build settles. A failure is shared with every waiter.
    async fn await_build(
        &self,
        id: &str,
        build_id: u64,
        mut done: watch::Receiver<BuildStatus>,
    ) -> Result<()> {
        loop {
            match &*done.borrow_and_update() {
                BuildStatus::Building => {}
                BuildStatus::Ready => return Ok(()),
                BuildStatus::Failed(err) => return Err(err.clone()),
            }
            if done.changed().await.is_err() {
                // The build task went away without reporting
                if matches!(*done.borrow(), BuildStatus::Building) {
                    self.remove_pending(id, build_id);
                    return Err(Error::BuildFailure {
                        tenant_id: id.to_string(),
                        message: "build task ended without a result".to_string(),
                    });
                }
            }
        }
    }

    async fn await_teardown(&self, id: &str, mut done: watch::Receiver<bool>) {
        while !*done.borrow_and_update() {
            if done.changed().await.is_err() {
                if !*done.borrow() {
                    self.slots
                        .remove_if(id, |_, slot| matches!(slot, Slot::Destroying { .. }));
                }
                return;
            }
        }
    }

    /// Move a Ready slot to Destroying and start its teardown
    fn begin_teardown(self: &Arc<Self>, tenant_id: &str, reason: &'static str) -> Option<JoinHandle<()>> {
        let (handle, tx) = match self.slots.entry(tenant_id.to_string()) {
            Entry::Occupied(mut entry) => match entry.get().clone() {
                Slot::Ready(handle) => {
                    handle.retire();
                    let (tx, rx) = watch::channel(false);
                    entry.insert(Slot::Destroying { done: rx });
                    (handle, tx)
                }
                _ => return None,
            },
            Entry::Vacant(_) => return None,
        };
        Some(self.spawn_teardown(handle, tx, reason))
    }

    /// Tear down a tenant's Ready instance and wait for removal.
    ///
    /// Returns false when there was no Ready instance.
    pub async fn evict(self: &Arc<Self>, tenant_id: &str, reason: &'static str) -> bool {
        match self.begin_teardown(tenant_id, reason) {
            Some(task) => {
                if let Err(err) = task.await {
                    error!(tenant_id, error = %err, "Teardown task panicked");
                }
                true
            }
            None => false,
        }
    }

    /// Tear down every Ready instance concurrently
    pub async fn shutdown_all(self: &Arc<Self>) {
        let ids: Vec<String> = self
            .slots
            .iter()
            .filter(|entry| matches!(entry.value(), Slot::Ready(_)))
            .map(|entry| entry.key().clone())
            .collect();
        if ids.is_empty() {
            return;
        }

        info!(count = ids.len(), "Tearing down all site instances");
        let tasks: Vec<_> = ids
            .iter()
            .filter_map(|id| self.begin_teardown(id, "shutdown"))
            .collect();
        for result in futures::future::join_all(tasks).await {
            if let Err(err) = result {
                error!(error = %err, "Teardown task panicked");
            }
        }
    }

    pub fn snapshot(&self) -> Vec<SlotInfo> {
        let pinned = self.pinned.read();
        let mut rows: Vec<SlotInfo> = self
            .slots
            .iter()
            .map(|entry| {
                let tenant_id = entry.key().clone();
                let is_pinned = pinned.contains(&tenant_id);
                match entry.value() {
                    Slot::Pending { .. } => SlotInfo {
                        tenant_id,
                        state: InstanceState::Pending,
                        built_at_version: None,
                        in_flight: 0,
                        uptime_secs: None,
                        pinned: is_pinned,
                    },
                    Slot::Ready(handle) => SlotInfo {
                        tenant_id,
                        state: handle.state(),
                        built_at_version: Some(handle.built_at_version()),
                        in_flight: handle.in_flight(),
                        uptime_secs: Some(handle.uptime().as_secs()),
                        pinned: is_pinned,
                    },
                    Slot::Destroying { .. } => SlotInfo {
                        tenant_id,
                        state: InstanceState::Destroying,
                        built_at_version: None,
                        in_flight: 0,
                        uptime_secs: None,
                        pinned: is_pinned,
                    },
                }
            })
            .collect();
        rows.sort_by(|a, b| a.tenant_id.cmp(&b.tenant_id));
        rows
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::testing::{empty_request, EchoInstance};
    use crate::instance::TenantInstance;
    use crate::tenant::testing::MemoryRegistry;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize};

    #[derive(Default)]
    struct CountingFactory {
        builds: AtomicUsize,
        fail: AtomicBool,
        delay_ms: AtomicU64,
        instances: parking_lot::Mutex<Vec<Arc<EchoInstance>>>,
    }

    impl CountingFactory {
        fn builds(&self) -> usize {
            self.builds.load(Ordering::SeqCst)
        }

        fn shutdowns(&self) -> usize {
            self.instances
                .lock()
                .iter()
                .map(|i| i.shutdowns.load(Ordering::SeqCst))
                .sum()
        }
    }

    #[async_trait]
    impl InstanceFactory for CountingFactory {
        async fn build(
            &self,
            record: &TenantRecord,
            _overlay: &ConfigOverlay,
        ) -> Result<Arc<dyn TenantInstance>> {
            self.builds.fetch_add(1, Ordering::SeqCst);
            let delay = self.delay_ms.load(Ordering::SeqCst);
            if delay > 0 {
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
            if self.fail.load(Ordering::SeqCst) {
                return Err(Error::BuildFailure {
                    tenant_id: record.id.clone(),
                    message: "factory refused".to_string(),
                });
            }
            let instance = Arc::new(EchoInstance::new(&record.id));
            self.instances.lock().push(instance.clone());
            Ok(instance)
        }
    }

    fn create_test_cache() -> (Arc<TenantCache>, Arc<MemoryRegistry>, Arc<CountingFactory>) {
        let registry = Arc::new(MemoryRegistry::default());
        let factory = Arc::new(CountingFactory::default());
        let cache = TenantCache::new(
            registry.clone(),
            factory.clone(),
            CacheSettings {
                max_build: Duration::from_secs(2),
                drain_timeout: Duration::from_secs(1),
            },
        );
        (cache, registry, factory)
    }

    #[tokio::test]
    async fn test_acquire_builds_once() {
        let (cache, registry, factory) = create_test_cache();
        registry.put(TenantRecord::new("a", "a.example"));

        let first = cache.acquire("a").await.unwrap();
        let second = cache.acquire("a").await.unwrap();
        assert!(first.same_instance(&second));
        assert_eq!(factory.builds(), 1);
        assert_eq!(cache.state("a"), Some(InstanceState::Ready));
    }

    #[tokio::test]
    async fn test_concurrent_acquire_coalesces() {
        let (cache, registry, factory) = create_test_cache();
        factory.delay_ms.store(100, Ordering::SeqCst);
        registry.put(TenantRecord::new("a", "a.example"));

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let cache = cache.clone();
                tokio::spawn(async move { cache.acquire("a").await })
            })
            .collect();

        let mut handles = Vec::new();
        for task in tasks {
            handles.push(task.await.unwrap().unwrap());
        }
        assert_eq!(factory.builds(), 1);
        assert!(handles.windows(2).all(|w| w[0].same_instance(&w[1])));
    }

    #[tokio::test]
    async fn test_unknown_tenant() {
        let (cache, _registry, factory) = create_test_cache();
        let err = cache.acquire("missing").await.unwrap_err();
        assert!(matches!(err, Error::TenantNotFound(_)));
        assert_eq!(factory.builds(), 0);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_failed_build_clears_slot() {
        let (cache, registry, factory) = create_test_cache();
        registry.put(TenantRecord::new("a", "a.example"));
        factory.fail.store(true, Ordering::SeqCst);

        let err = cache.acquire("a").await.unwrap_err();
        assert!(matches!(err, Error::BuildFailure { .. }));
        assert_eq!(cache.state("a"), None);

        // Next caller starts a fresh build
        factory.fail.store(false, Ordering::SeqCst);
        cache.acquire("a").await.unwrap();
        assert_eq!(factory.builds(), 2);
    }

    #[tokio::test]
    async fn test_waiters_share_build_failure() {
        let (cache, registry, factory) = create_test_cache();
        registry.put(TenantRecord::new("a", "a.example"));
        factory.fail.store(true, Ordering::SeqCst);
        factory.delay_ms.store(100, Ordering::SeqCst);

        let (first, second) = tokio::join!(cache.acquire("a"), cache.acquire("a"));
        assert!(first.is_err());
        assert!(second.is_err());
        assert_eq!(factory.builds(), 1);
    }

    #[tokio::test]
    async fn test_build_timeout() {
        let (cache, registry, factory) = create_test_cache();
        registry.put(TenantRecord::new("a", "a.example"));
        factory.delay_ms.store(5_000, Ordering::SeqCst);

        let err = cache.acquire("a").await.unwrap_err();
        assert!(matches!(err, Error::BuildTimeout { .. }));
        assert_eq!(cache.state("a"), None);
    }

    #[tokio::test]
    async fn test_stale_instance_rebuilt() {
        let (cache, registry, factory) = create_test_cache();
        registry.put(TenantRecord::new("a", "a.example"));

        let old = cache.acquire("a").await.unwrap();
        registry.update("a", |r| r.updated_at = r.updated_at + chrono::Duration::seconds(1));

        let new = cache.acquire("a").await.unwrap();
        assert!(!old.same_instance(&new));
        assert_eq!(old.state(), InstanceState::Destroying);
        assert_eq!(factory.builds(), 2);
        assert_eq!(factory.shutdowns(), 1);

        let err = old.dispatch(empty_request("/")).await.unwrap_err();
        assert!(matches!(err, Error::InstanceRetired(_)));
    }

    #[tokio::test]
    async fn test_stale_handle_retired_when_teardown_starts() {
        let (cache, registry, _factory) = create_test_cache();
        registry.put(TenantRecord::new("a", "a.example"));
        let old = cache.acquire("a").await.unwrap();

        let mut bumped = TenantRecord::new("a", "a.example");
        bumped.updated_at = old.built_at_version() + chrono::Duration::seconds(1);
        let step = cache.inspect(&bumped);
        assert!(matches!(step, Step::StartTeardown(..)));
        assert_eq!(cache.state("a"), Some(InstanceState::Destroying));
        assert_eq!(old.state(), InstanceState::Destroying);

        let err = old.dispatch(empty_request("/")).await.unwrap_err();
        assert!(matches!(err, Error::InstanceRetired(_)));
    }

    #[tokio::test]
    async fn test_evicted_handle_retired_before_teardown_runs() {
        let (cache, registry, _factory) = create_test_cache();
        registry.put(TenantRecord::new("a", "a.example"));
        let old = cache.acquire("a").await.unwrap();

        let task = cache.begin_teardown("a", "test").unwrap();
        assert_eq!(old.state(), InstanceState::Destroying);
        assert!(old.try_dispatch(empty_request("/")).await.is_err());
        task.await.unwrap();
        assert_eq!(cache.state("a"), None);
    }

    #[tokio::test]
    async fn test_supplied_record_skips_registry() {
        let (cache, _registry, factory) = create_test_cache();
        let mut record = TenantRecord::new("draft", "draft.example");
        record.published = false;

        cache.acquire(record).await.unwrap();
        assert_eq!(factory.builds(), 1);
    }

    #[tokio::test]
    async fn test_evict_and_snapshot() {
        let (cache, registry, factory) = create_test_cache();
        registry.put(TenantRecord::new("a", "a.example"));
        registry.put(TenantRecord::new("b", "b.example"));
        cache.acquire("a").await.unwrap();
        cache.acquire("b").await.unwrap();
        cache.pin("b");

        let rows = cache.snapshot();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].tenant_id, "a");
        assert!(rows[1].pinned);
        assert_eq!(cache.ready_unpinned_ids(), vec!["a".to_string()]);

        assert!(cache.evict("a", "admin").await);
        assert!(!cache.evict("a", "admin").await);
        assert_eq!(cache.state("a"), None);
        assert_eq!(factory.shutdowns(), 1);
    }

    #[tokio::test]
    async fn test_teardown_failure_still_removes() {
        let (cache, registry, factory) = create_test_cache();
        registry.put(TenantRecord::new("a", "a.example"));
        cache.acquire("a").await.unwrap();
        factory.instances.lock()[0]
            .fail_shutdown
            .store(true, Ordering::SeqCst);

        assert!(cache.evict("a", "test").await);
        assert_eq!(cache.state("a"), None);
    }

    #[tokio::test]
    async fn test_shutdown_all() {
        let (cache, registry, factory) = create_test_cache();
        for id in ["a", "b", "c"] {
            registry.put(TenantRecord::new(id, &format!("{}.example", id)));
            cache.acquire(id).await.unwrap();
        }

        cache.shutdown_all().await;
        assert!(cache.is_empty());
        assert_eq!(factory.shutdowns(), 3);
    }
}
