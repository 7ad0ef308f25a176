//! Application-level configuration constants and the typed settings built from them.

use std::fmt;
use std::num::NonZeroUsize;

// Cache store
pub const CACHE_CAPACITY: usize = 100;
pub const CACHE_STORAGE_PREFIX: &str = "analysis_cache:";

// Cross-tab lock
pub const LOCK_NAME: &str = "analysis_action_lock";
pub const CHANNEL_NAME: &str = "analysis_action_channel";
pub const LOCK_TTL_MS: u32 = 10_000;
pub const HEARTBEAT_INTERVAL_MS: u32 = 2_000;
pub const STATUS_POLL_INTERVAL_MS: u32 = 1_000;

/// Rejected configuration values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    ZeroCapacity,
    HeartbeatNotBelowTtl { heartbeat_ms: u32, ttl_ms: u32 },
    EmptyName(&'static str),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::ZeroCapacity => write!(f, "Cache capacity must be at least 1"),
            ConfigError::HeartbeatNotBelowTtl { heartbeat_ms, ttl_ms } => write!(
                f,
                "Heartbeat interval {}ms must be shorter than the lock TTL {}ms",
                heartbeat_ms, ttl_ms
            ),
            ConfigError::EmptyName(field) => write!(f, "{} cannot be empty", field),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Settings for the persistent analysis cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    pub capacity: NonZeroUsize,
    /// Every entry is stored under `storage_prefix + encoded key`.
    pub storage_prefix: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: NonZeroUsize::new(CACHE_CAPACITY).unwrap_or(NonZeroUsize::MIN),
            storage_prefix: CACHE_STORAGE_PREFIX.to_string(),
        }
    }
}

impl CacheConfig {
    pub fn with_capacity(mut self, capacity: usize) -> Result<Self, ConfigError> {
        self.capacity = NonZeroUsize::new(capacity).ok_or(ConfigError::ZeroCapacity)?;
        Ok(self)
    }

    pub fn with_storage_prefix(mut self, prefix: impl Into<String>) -> Result<Self, ConfigError> {
        let prefix = prefix.into();
        if prefix.is_empty() {
            return Err(ConfigError::EmptyName("Storage prefix"));
        }
        self.storage_prefix = prefix;
        Ok(self)
    }
}

/// Settings for the cross-tab exclusive lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockConfig {
    /// Storage key of the lock record.
    pub name: String,
    /// BroadcastChannel name used for busy/idle signals.
    pub channel: String,
    pub ttl_ms: u32,
    pub heartbeat_ms: u32,
    /// Re-check period for the storage transport, and while another tab
    /// looks busy.
    pub poll_ms: u32,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            name: LOCK_NAME.to_string(),
            channel: CHANNEL_NAME.to_string(),
            ttl_ms: LOCK_TTL_MS,
            heartbeat_ms: HEARTBEAT_INTERVAL_MS,
            poll_ms: STATUS_POLL_INTERVAL_MS,
        }
    }
}

impl LockConfig {
    pub fn with_timing(mut self, ttl_ms: u32, heartbeat_ms: u32) -> Result<Self, ConfigError> {
        self.ttl_ms = ttl_ms;
        self.heartbeat_ms = heartbeat_ms;
        self.validate()?;
        Ok(self)
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Result<Self, ConfigError> {
        self.name = name.into();
        self.validate()?;
        Ok(self)
    }

    /// A heartbeat that is not shorter than the TTL would let a live lock expire.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.is_empty() {
            return Err(ConfigError::EmptyName("Lock name"));
        }
        if self.channel.is_empty() {
            return Err(ConfigError::EmptyName("Channel name"));
        }
        if self.heartbeat_ms == 0 || self.heartbeat_ms >= self.ttl_ms {
            return Err(ConfigError::HeartbeatNotBelowTtl {
                heartbeat_ms: self.heartbeat_ms,
                ttl_ms: self.ttl_ms,
            });
        }
        Ok(())
    }
}
