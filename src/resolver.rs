//! Split a batch of resumes into already-analysed and still-to-analyse.

use crate::fingerprint::{AnalysisContext, CacheKey, FileDescriptor};
use crate::store::CacheStore;
use log::{debug, warn};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// A file served from cache together with its stored analysis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedAnalysis<R> {
    pub file: FileDescriptor,
    pub result: R,
}

/// Outcome of [`resolve`]. Both lists keep the input order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resolution<R> {
    pub cached: Vec<CachedAnalysis<R>>,
    pub uncached: Vec<FileDescriptor>,
}

impl<R> Resolution<R> {
    pub fn total(&self) -> usize {
        self.cached.len() + self.uncached.len()
    }

    pub fn is_fully_cached(&self) -> bool {
        self.uncached.is_empty()
    }
}

/// Partition `files` by whether an entry exists under their exact composite key.
///
/// Files whose fingerprint cannot be computed always land in `uncached`.
pub fn resolve<R>(
    store: &CacheStore<R>,
    files: &[FileDescriptor],
    context: &AnalysisContext,
) -> Resolution<R>
where
    R: Serialize + DeserializeOwned,
{
    let mut resolution = Resolution { cached: Vec::new(), uncached: Vec::new() };

    for file in files {
        let key = match CacheKey::for_file(file, context) {
            Ok(key) => key,
            Err(e) => {
                warn!("No cache key for {:?}: {}", file.name, e);
                resolution.uncached.push(file.clone());
                continue;
            }
        };

        match store.get(&key) {
            Some(entry) => {
                resolution.cached.push(CachedAnalysis { file: file.clone(), result: entry.result })
            }
            None => resolution.uncached.push(file.clone()),
        }
    }

    debug!(
        "Resolved {} files: {} cached, {} to analyse",
        files.len(),
        resolution.cached.len(),
        resolution.uncached.len()
    );
    resolution
}

/// Store a freshly computed analysis under the file's key for `context`.
pub fn cache_analysis<R>(
    store: &CacheStore<R>,
    file: &FileDescriptor,
    result: &R,
    context: &AnalysisContext,
) where
    R: Serialize + DeserializeOwned,
{
    match CacheKey::for_file(file, context) {
        Ok(key) => store.put(&key, result),
        Err(e) => warn!("Not caching {:?}: {}", file.name, e),
    }
}
