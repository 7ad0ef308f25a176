//! Result caching and cross-tab coordination for resume screening.
//!
//! A screening run fingerprints each resume together with the job
//! description, criterion weights and hard filters. Resumes whose exact
//! combination was analysed before are answered from a persistent LRU cache;
//! the rest go to the analyzer, guarded by a lock that lets only one tab of
//! the origin run an analysis at a time.

pub mod broadcast;
pub mod clock;
pub mod config;
pub mod credentials;
pub mod criteria;
pub mod fingerprint;
pub mod lock;
pub mod orchestrator;
pub mod resolver;
pub mod scheduler;
pub mod service;
pub mod storage;
pub mod store;
pub mod web;

pub use config::{CacheConfig, ConfigError, LockConfig};
pub use criteria::{HardFilters, MainCriterion, SubCriterion, WeightCriteria};
pub use fingerprint::{
    fingerprint_file, generate_analysis_hashes, hash_structured, hash_text, AnalysisContext,
    CacheKey, Digest, FileDescriptor, FingerprintError,
};
pub use lock::{Exclusive, ExclusiveLock, LockPhase, LockStatus, PlatformLocks, TabId};
pub use orchestrator::{
    AnalysisEvent, AnalysisOrchestrator, AnalysisRequest, CandidateAnalyzer, RunError, RunSummary,
};
pub use resolver::{CachedAnalysis, Resolution};
pub use service::{AnalysisService, ServiceParts};
pub use storage::{KeyValueStorage, StorageError};
pub use store::{CacheEntry, CacheStatistics, CacheStore};
