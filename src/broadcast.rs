//! Busy/idle signalling between tabs of one origin.
//!
//! The lock state machine talks to a [`StatusChannel`] and does not care how
//! messages travel. Two transports exist in the browser (see [`crate::web`]):
//! a `BroadcastChannel`, and storage-change signalling where writes to the
//! lock record itself are the message. [`StoragePollChannel`] is the polling
//! half of the latter and [`MemoryBus`] connects simulated tabs in tests.

use crate::lock::TabId;
use crate::scheduler::{CancelOnDrop, Scheduler};
use crate::storage::KeyValueStorage;
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::rc::Rc;

/// Wire message, `{"type":"status","payload":{"busy":…,"origin":…}}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "lowercase")]
pub enum StatusMessage {
    Status { busy: bool, origin: TabId },
}

impl StatusMessage {
    pub fn busy(origin: &TabId) -> Self {
        StatusMessage::Status { busy: true, origin: origin.clone() }
    }

    pub fn idle(origin: &TabId) -> Self {
        StatusMessage::Status { busy: false, origin: origin.clone() }
    }
}

/// What a subscriber is told.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusSignal {
    /// Explicit message from another tab.
    Message(StatusMessage),
    /// The lock record changed; re-read it to learn the status.
    RecordChanged,
}

pub type StatusListener = Rc<dyn Fn(StatusSignal)>;

pub trait StatusChannel {
    fn publish(&self, message: &StatusMessage);
    /// Deliver signals to `listener` until the handle is dropped.
    fn subscribe(&self, listener: StatusListener) -> CancelOnDrop;
}

/// Polls the lock record and reports every change. Publishing is a no-op:
/// acquiring, renewing and releasing already rewrite the record.
pub struct StoragePollChannel {
    storage: Rc<dyn KeyValueStorage>,
    scheduler: Rc<dyn Scheduler>,
    record_key: String,
    poll_ms: u32,
}

impl StoragePollChannel {
    pub fn new(
        storage: Rc<dyn KeyValueStorage>,
        scheduler: Rc<dyn Scheduler>,
        record_key: impl Into<String>,
        poll_ms: u32,
    ) -> Self {
        Self { storage, scheduler, record_key: record_key.into(), poll_ms }
    }

    pub fn record_key(&self) -> &str {
        &self.record_key
    }
}

impl StatusChannel for StoragePollChannel {
    fn publish(&self, _message: &StatusMessage) {}

    fn subscribe(&self, listener: StatusListener) -> CancelOnDrop {
        let storage = self.storage.clone();
        let key = self.record_key.clone();
        let last_seen = RefCell::new(storage.get_item(&key).ok().flatten());
        let tick = move || {
            let current = storage.get_item(&key).ok().flatten();
            let changed = *last_seen.borrow() != current;
            if changed {
                *last_seen.borrow_mut() = current;
                listener(StatusSignal::RecordChanged);
            }
        };
        self.scheduler.every(self.poll_ms, Box::new(tick))
    }
}

type Subscriber = (u64, TabId, StatusListener);

/// In-process stand-in for a `BroadcastChannel` shared by several tabs.
#[derive(Clone, Default)]
pub struct MemoryBus {
    subscribers: Rc<RefCell<Vec<Subscriber>>>,
    next_id: Rc<RefCell<u64>>,
    published: Rc<RefCell<Vec<StatusMessage>>>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// The endpoint one tab uses.
    pub fn channel(&self, tab: TabId) -> MemoryChannel {
        MemoryChannel { bus: self.clone(), tab }
    }

    /// Every message published so far, in order.
    pub fn published(&self) -> Vec<StatusMessage> {
        self.published.borrow().clone()
    }
}

pub struct MemoryChannel {
    bus: MemoryBus,
    tab: TabId,
}

impl StatusChannel for MemoryChannel {
    fn publish(&self, message: &StatusMessage) {
        self.bus.published.borrow_mut().push(message.clone());
        // Snapshot first: listeners may publish or unsubscribe re-entrantly.
        let targets: Vec<StatusListener> = self
            .bus
            .subscribers
            .borrow()
            .iter()
            .filter(|(_, tab, _)| *tab != self.tab)
            .map(|(_, _, listener)| listener.clone())
            .collect();
        for listener in targets {
            listener(StatusSignal::Message(message.clone()));
        }
    }

    fn subscribe(&self, listener: StatusListener) -> CancelOnDrop {
        let id = {
            let mut next = self.bus.next_id.borrow_mut();
            *next += 1;
            *next
        };
        self.bus.subscribers.borrow_mut().push((id, self.tab.clone(), listener));
        let subscribers = self.bus.subscribers.clone();
        CancelOnDrop::new(move || subscribers.borrow_mut().retain(|(sub, _, _)| *sub != id))
    }
}
