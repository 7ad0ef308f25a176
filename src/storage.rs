//! Durable per-origin key/value storage seam.
//!
//! The browser implementation wraps `window.localStorage` (see [`crate::web`]);
//! [`MemoryStorage`] stands in for it natively. Clones of a `MemoryStorage`
//! share one backing map, which is how tests model several tabs of the same
//! origin.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// Storage is disabled or not present (private mode, no window).
    Unavailable(String),
    QuotaExceeded,
    Backend(String),
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageError::Unavailable(why) => write!(f, "Storage unavailable: {}", why),
            StorageError::QuotaExceeded => write!(f, "Storage quota exceeded"),
            StorageError::Backend(msg) => write!(f, "Storage error: {}", msg),
        }
    }
}

impl std::error::Error for StorageError {}

/// String-to-string storage with the `localStorage` surface.
pub trait KeyValueStorage {
    fn get_item(&self, key: &str) -> Result<Option<String>, StorageError>;
    fn set_item(&self, key: &str, value: &str) -> Result<(), StorageError>;
    fn remove_item(&self, key: &str) -> Result<(), StorageError>;
    /// All keys currently stored, in no particular order.
    fn keys(&self) -> Result<Vec<String>, StorageError>;
}

#[derive(Debug, Default)]
struct MemoryInner {
    items: BTreeMap<String, String>,
    quota_bytes: Option<usize>,
    broken: bool,
}

impl MemoryInner {
    fn used_bytes(&self) -> usize {
        self.items.iter().map(|(k, v)| k.len() + v.len()).sum()
    }
}

/// In-process storage. Optional byte quota mimics `QuotaExceededError`.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    inner: Rc<RefCell<MemoryInner>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rejects writes that would push keys + values past `bytes`.
    pub fn with_quota(bytes: usize) -> Self {
        let storage = Self::default();
        storage.inner.borrow_mut().quota_bytes = Some(bytes);
        storage
    }

    /// Makes every subsequent call fail with `Unavailable`, as disabled storage does.
    pub fn set_broken(&self, broken: bool) {
        self.inner.borrow_mut().broken = broken;
    }

    pub fn len(&self) -> usize {
        self.inner.borrow().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check(&self) -> Result<(), StorageError> {
        if self.inner.borrow().broken {
            Err(StorageError::Unavailable("storage disabled".to_string()))
        } else {
            Ok(())
        }
    }
}

impl KeyValueStorage for MemoryStorage {
    fn get_item(&self, key: &str) -> Result<Option<String>, StorageError> {
        self.check()?;
        Ok(self.inner.borrow().items.get(key).cloned())
    }

    fn set_item(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.check()?;
        let mut inner = self.inner.borrow_mut();
        if let Some(quota) = inner.quota_bytes {
            let replaced = inner.items.get(key).map(|old| key.len() + old.len()).unwrap_or(0);
            if inner.used_bytes() - replaced + key.len() + value.len() > quota {
                return Err(StorageError::QuotaExceeded);
            }
        }
        inner.items.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove_item(&self, key: &str) -> Result<(), StorageError> {
        self.check()?;
        self.inner.borrow_mut().items.remove(key);
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>, StorageError> {
        self.check()?;
        Ok(self.inner.borrow().items.keys().cloned().collect())
    }
}
