//! Round-robin failover across several API credentials.

use log::{info, warn};
use std::cell::Cell;
use std::fmt;
use std::future::Future;

#[derive(Debug, PartialEq, Eq)]
pub enum RotationError<E> {
    /// No usable credential was configured.
    Empty,
    /// Every credential was tried once and the last attempt failed with `last`.
    Exhausted { attempts: usize, last: E },
}

impl<E: fmt::Display> fmt::Display for RotationError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RotationError::Empty => write!(f, "No API credentials configured"),
            RotationError::Exhausted { attempts, last } => {
                write!(f, "All {} API credentials failed, last error: {}", attempts, last)
            }
        }
    }
}

impl<E: fmt::Debug + fmt::Display> std::error::Error for RotationError<E> {}

/// Index tried after `current` in a pool of `len` credentials.
pub fn next_candidate(current: usize, len: usize) -> usize {
    if len == 0 {
        0
    } else {
        (current + 1) % len
    }
}

/// Ordered credentials plus the one currently in use. The current index
/// survives between calls, so a failing key stays skipped until the pool
/// wraps around to it again.
pub struct CredentialPool {
    keys: Vec<String>,
    current: Cell<usize>,
}

impl CredentialPool {
    /// Blank entries are dropped, as unset environment slots would be.
    pub fn new<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let keys = keys
            .into_iter()
            .map(Into::<String>::into)
            .filter(|key| !key.trim().is_empty())
            .collect();
        Self { keys, current: Cell::new(0) }
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn current_index(&self) -> usize {
        self.current.get()
    }

    pub fn current(&self) -> Option<&str> {
        self.keys.get(self.current.get()).map(String::as_str)
    }

    pub fn advance(&self) {
        self.current.set(next_candidate(self.current.get(), self.keys.len()));
    }

    /// Run `op` with the current credential, moving to the next one after
    /// each failure. Gives up once every credential has been tried.
    pub async fn with_rotation<F, Fut, T, E>(&self, mut op: F) -> Result<T, RotationError<E>>
    where
        F: FnMut(String) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
    {
        let mut last = None;
        for attempt in 1..=self.keys.len() {
            let Some(key) = self.current() else { break };
            match op(key.to_string()).await {
                Ok(value) => {
                    if attempt > 1 {
                        info!(
                            "API credential {} succeeded after {} attempts",
                            self.current.get() + 1,
                            attempt
                        );
                    }
                    return Ok(value);
                }
                Err(e) => {
                    warn!("API credential {} failed: {}", self.current.get() + 1, e);
                    last = Some(e);
                    self.advance();
                }
            }
        }

        match last {
            Some(last) => Err(RotationError::Exhausted { attempts: self.keys.len(), last }),
            None => Err(RotationError::Empty),
        }
    }
}

impl fmt::Debug for CredentialPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialPool")
            .field("len", &self.keys.len())
            .field("current", &self.current.get())
            .finish()
    }
}
