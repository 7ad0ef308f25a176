//! Wall-clock source in epoch milliseconds.

use std::cell::Cell;
use std::rc::Rc;

/// Milliseconds since the Unix epoch, the unit `Date.now()` uses.
pub type Millis = i64;

pub trait Clock {
    fn now_ms(&self) -> Millis;
}

/// Real time: `Date.now()` in the browser, `SystemTime` elsewhere.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    #[cfg(target_arch = "wasm32")]
    fn now_ms(&self) -> Millis {
        js_sys::Date::now() as Millis
    }

    #[cfg(not(target_arch = "wasm32"))]
    fn now_ms(&self) -> Millis {
        use std::time::{SystemTime, UNIX_EPOCH};
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as Millis)
            .unwrap_or(0)
    }
}

/// Hand-driven clock. Clones share the same time.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Rc<Cell<Millis>>,
}

impl ManualClock {
    pub fn new(start: Millis) -> Self {
        Self { now: Rc::new(Cell::new(start)) }
    }

    pub fn set(&self, now: Millis) {
        self.now.set(now);
    }

    pub fn advance(&self, by: Millis) {
        self.now.set(self.now.get() + by);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> Millis {
        self.now.get()
    }
}
