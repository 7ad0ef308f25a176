//! The per-tab entry point: one instance, built at startup and handed to
//! consumers by reference.

use crate::broadcast::StatusChannel;
use crate::clock::Clock;
use crate::config::{CacheConfig, LockConfig};
use crate::criteria::{HardFilters, WeightCriteria};
use crate::fingerprint::{
    generate_analysis_hashes, AnalysisContext, FileDescriptor, FingerprintError,
};
use crate::lock::{Exclusive, ExclusiveLock, LockStatus, PlatformLocks, TabId};
use crate::resolver::{self, Resolution};
use crate::scheduler::Scheduler;
use crate::store::{CacheStatistics, CacheStore};
use crate::storage::KeyValueStorage;
use log::info;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::rc::Rc;

/// Everything the service needs from its environment.
pub struct ServiceParts {
    pub tab: TabId,
    pub storage: Rc<dyn KeyValueStorage>,
    pub clock: Rc<dyn Clock>,
    pub channel: Rc<dyn StatusChannel>,
    pub scheduler: Rc<dyn Scheduler>,
    pub cache: CacheConfig,
    pub lock: LockConfig,
}

pub struct AnalysisService<R> {
    store: CacheStore<R>,
    lock: ExclusiveLock,
}

impl<R> AnalysisService<R>
where
    R: Serialize + DeserializeOwned,
{
    pub fn new(parts: ServiceParts) -> Self {
        info!(
            "Analysis cache ready in tab {} (capacity {})",
            parts.tab,
            parts.cache.capacity
        );
        let store = CacheStore::new(parts.storage.clone(), parts.clock.clone(), parts.cache);
        let lock = ExclusiveLock::new(
            parts.tab,
            parts.storage,
            parts.clock,
            parts.channel,
            parts.scheduler,
            parts.lock,
        );
        Self { store, lock }
    }

    /// Guard exclusive runs with a platform lock primitive as well.
    pub fn with_platform_locks(self, locks: Rc<dyn PlatformLocks>) -> Self {
        let Self { store, lock } = self;
        Self { store, lock: lock.with_platform_locks(locks) }
    }

    pub fn analysis_hashes(
        &self,
        jd_text: &str,
        weights: &WeightCriteria,
        filters: &HardFilters,
    ) -> Result<AnalysisContext, FingerprintError> {
        generate_analysis_hashes(jd_text, weights, filters)
    }

    pub fn resolve(&self, files: &[FileDescriptor], context: &AnalysisContext) -> Resolution<R> {
        resolver::resolve(&self.store, files, context)
    }

    pub fn cache_analysis(&self, file: &FileDescriptor, result: &R, context: &AnalysisContext) {
        resolver::cache_analysis(&self.store, file, result, context)
    }

    pub fn cache_stats(&self) -> CacheStatistics {
        self.store.stats()
    }

    pub fn clear_cache(&self) {
        info!("Clearing analysis cache");
        self.store.clear();
    }

    pub async fn run_exclusive<F, Fut, T, E>(&self, action: F) -> Result<Exclusive<T>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.lock.run_exclusive(action).await
    }

    pub fn lock_status(&self) -> LockStatus {
        self.lock.status()
    }

    pub fn lock(&self) -> &ExclusiveLock {
        &self.lock
    }

    pub fn store(&self) -> &CacheStore<R> {
        &self.store
    }
}
