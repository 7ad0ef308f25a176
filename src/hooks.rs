use screener_cache::{AnalysisService, CacheStatistics, ExclusiveLock, LockStatus};
use serde_json::Value;
use std::rc::Rc;
use yew::prelude::*;

/// Current cache statistics plus a callback to re-read them.
pub struct CacheStatsHandle {
    pub stats: CacheStatistics,
    pub refresh: Callback<()>,
}

#[hook]
pub fn use_cache_stats(service: Rc<AnalysisService<Value>>) -> CacheStatsHandle {
    let stats = {
        let service = service.clone();
        use_state(move || service.cache_stats())
    };

    let refresh = {
        let stats = stats.clone();
        Callback::from(move |_| stats.set(service.cache_stats()))
    };

    CacheStatsHandle { stats: (*stats).clone(), refresh }
}

/// Lock status of this tab, re-rendered whenever it changes.
#[hook]
pub fn use_lock_status(lock: ExclusiveLock) -> LockStatus {
    let status = use_state(|| lock.status());

    {
        let status = status.clone();
        use_effect_with((), move |_| {
            let watch = lock.watch(move |current| status.set(current));
            // The record may have changed between the first render and now.
            lock.refresh_status();
            move || drop(watch)
        });
    }

    *status
}
