//! Cross-tab exclusive execution lock.
//!
//! At most one tab of an origin runs the guarded action at a time. When the
//! platform offers an exclusive lock primitive ([`PlatformLocks`], the Web
//! Locks API in browsers) it decides who wins. The record `{owner, expiresAt}`
//! in shared storage is written either way: it carries the status to other
//! tabs and is the only guard when no primitive exists. An expired record
//! counts as absent, so a crashed holder frees the lock after one TTL.
//!
//! # State transitions
//!
//! ```text
//! Idle ── run_exclusive() ──→ Requesting ──→ Acquired ── done ──→ Idle
//!                                  │
//!                                  └──→ Denied ── idle signal ──→ Idle
//! ```
//!
//! While acquired, a heartbeat pushes `expiresAt` forward and repeats the busy
//! message every `heartbeat_ms`. Release runs from a drop guard, so it happens
//! whether the action succeeds, fails, panics or is dropped mid-flight.
//!
//! A tab that sees another one busy re-checks every `poll_ms`. It returns to
//! idle once the record has expired and no busy message arrived within a TTL.

use crate::broadcast::{StatusChannel, StatusMessage, StatusSignal};
use crate::clock::{Clock, Millis};
use crate::config::LockConfig;
use crate::scheduler::{CancelOnDrop, Scheduler};
use crate::storage::{KeyValueStorage, StorageError};
use futures::future::LocalBoxFuture;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::cell::{Cell, RefCell};
use std::fmt;
use std::future::Future;
use std::rc::{Rc, Weak};

/// Opaque identifier of one browser tab.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TabId(String);

impl TabId {
    /// Time-based prefix plus random suffix, both base 36.
    pub fn generate(clock: &dyn Clock) -> Self {
        let now = clock.now_ms().max(0) as u64;
        TabId(format!("{}{}", base36(now), base36(rand::random::<u64>())))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for TabId {
    fn from(id: &str) -> Self {
        TabId(id.to_string())
    }
}

impl fmt::Display for TabId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn base36(mut n: u64) -> String {
    const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if n == 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while n > 0 {
        out.push(char::from(DIGITS[(n % 36) as usize]));
        n /= 36;
    }
    out.iter().rev().collect()
}

/// Persisted lock record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockRecord {
    pub owner: TabId,
    pub expires_at: Millis,
}

impl LockRecord {
    pub fn is_live(&self, now: Millis) -> bool {
        self.expires_at > now
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockPhase {
    Idle,
    Requesting,
    Acquired,
    Denied,
}

/// What this tab shows the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockStatus {
    Idle,
    BusyHere,
    BusyElsewhere,
}

impl LockStatus {
    pub fn is_busy(self) -> bool {
        self != LockStatus::Idle
    }
}

/// Result of [`ExclusiveLock::run_exclusive`]. Denial is an expected outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Exclusive<T> {
    Ran(T),
    Denied,
}

impl<T> Exclusive<T> {
    pub fn ran(&self) -> bool {
        matches!(self, Exclusive::Ran(_))
    }
}

/// Exclusive request primitive offered by the platform.
pub trait PlatformLocks {
    /// Take `name` without waiting. `Ok(None)` means another context holds
    /// it; a granted lock is kept until the returned handle is dropped.
    fn try_request(
        &self,
        name: &str,
    ) -> LocalBoxFuture<'static, Result<Option<CancelOnDrop>, String>>;
}

type Watcher = (u64, Rc<dyn Fn(LockStatus)>);

struct LockInner {
    this: Weak<LockInner>,
    tab: TabId,
    storage: Rc<dyn KeyValueStorage>,
    clock: Rc<dyn Clock>,
    channel: Rc<dyn StatusChannel>,
    scheduler: Rc<dyn Scheduler>,
    config: LockConfig,
    platform: RefCell<Option<Rc<dyn PlatformLocks>>>,
    phase: Cell<LockPhase>,
    status: Cell<LockStatus>,
    /// Set by busy messages from other tabs, cleared by idle ones.
    busy_until: Cell<Millis>,
    /// Bumped on every acquisition so a stale guard cannot release a newer hold.
    lease: Cell<u64>,
    heartbeat: RefCell<Option<CancelOnDrop>>,
    grant: RefCell<Option<CancelOnDrop>>,
    expiry_check: RefCell<Option<CancelOnDrop>>,
    watchers: RefCell<Vec<Watcher>>,
    next_watcher: Cell<u64>,
    _subscription: CancelOnDrop,
}

impl LockInner {
    fn read_record(&self) -> Option<LockRecord> {
        let raw = match self.storage.get_item(&self.config.name) {
            Ok(raw) => raw?,
            Err(e) => {
                warn!("Cannot read lock record: {}", e);
                return None;
            }
        };
        match serde_json::from_str(&raw) {
            Ok(record) => Some(record),
            Err(e) => {
                warn!("Ignoring corrupted lock record: {}", e);
                None
            }
        }
    }

    fn write_record(&self, record: &LockRecord) -> Result<(), StorageError> {
        let json = serde_json::to_string(record).map_err(|e| StorageError::Backend(e.to_string()))?;
        self.storage.set_item(&self.config.name, &json)
    }

    fn fresh_record(&self) -> LockRecord {
        LockRecord {
            owner: self.tab.clone(),
            expires_at: self.clock.now_ms() + Millis::from(self.config.ttl_ms),
        }
    }

    /// Storage-only acquisition, used when the platform has no lock
    /// primitive. Storage has no compare-and-swap, so this is not airtight:
    /// two tabs that both read an absent record before either writes will
    /// each read back their own write and both proceed. The read-back only
    /// catches a writer that lands between our write and our read.
    fn try_acquire(&self) -> bool {
        let now = self.clock.now_ms();
        if let Some(record) = self.read_record() {
            if record.is_live(now) && record.owner != self.tab {
                debug!(
                    "Lock {} held by {} until {}",
                    self.config.name, record.owner, record.expires_at
                );
                return false;
            }
        }

        if let Err(e) = self.write_record(&self.fresh_record()) {
            warn!("Cannot write lock record, running without cross-tab exclusion: {}", e);
            return true;
        }

        match self.read_record() {
            Some(record) if record.owner != self.tab => {
                debug!("Lost lock race to {}", record.owner);
                false
            }
            _ => true,
        }
    }

    /// Record write under a platform grant. Replaces whatever is stored,
    /// including a live record left by a holder that has since died.
    fn claim(&self) {
        if let Err(e) = self.write_record(&self.fresh_record()) {
            warn!("Cannot write lock record: {}", e);
        }
    }

    fn renew(&self) {
        match self.read_record() {
            Some(record) if record.owner == self.tab => {
                if let Err(e) = self.write_record(&self.fresh_record()) {
                    warn!("Lock renewal failed: {}", e);
                }
                self.channel.publish(&StatusMessage::busy(&self.tab));
            }
            Some(record) => warn!("Lock {} was taken over by {}", self.config.name, record.owner),
            None => warn!("Lock {} vanished while held", self.config.name),
        }
    }

    /// Remove the record only if this tab still owns it.
    fn release(&self) {
        if let Some(record) = self.read_record() {
            if record.owner == self.tab {
                if let Err(e) = self.storage.remove_item(&self.config.name) {
                    warn!("Lock release failed: {}", e);
                }
            }
        }
    }

    /// Stop the heartbeat, remove our record, free the platform grant and
    /// tell the other tabs. Does nothing unless the lock is held.
    fn relinquish(&self) {
        if self.phase.get() != LockPhase::Acquired {
            return;
        }
        let heartbeat = self.heartbeat.borrow_mut().take();
        drop(heartbeat);
        self.release();
        let grant = self.grant.borrow_mut().take();
        drop(grant);
        self.phase.set(LockPhase::Idle);
        self.channel.publish(&StatusMessage::idle(&self.tab));
        self.refresh_status();
        info!("Tab {} released {}", self.tab, self.config.name);
    }

    /// Keeps a `poll_ms` re-check running exactly while another tab looks busy.
    fn watch_expiry(&self, busy_elsewhere: bool) {
        if !busy_elsewhere {
            let stopped = self.expiry_check.borrow_mut().take();
            drop(stopped);
            return;
        }
        if self.expiry_check.borrow().is_some() {
            return;
        }
        let weak = self.this.clone();
        let check = self.scheduler.every(
            self.config.poll_ms,
            Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.refresh_status();
                }
            }),
        );
        *self.expiry_check.borrow_mut() = Some(check);
    }

    fn set_status(&self, status: LockStatus) {
        if status == LockStatus::Idle && self.phase.get() == LockPhase::Denied {
            self.phase.set(LockPhase::Idle);
        }
        self.watch_expiry(status == LockStatus::BusyElsewhere);
        if self.status.replace(status) == status {
            return;
        }
        let watchers: Vec<_> = self.watchers.borrow().iter().map(|(_, w)| w.clone()).collect();
        for watcher in watchers {
            watcher(status);
        }
    }

    fn refresh_status(&self) {
        if self.phase.get() == LockPhase::Acquired {
            self.set_status(LockStatus::BusyHere);
            return;
        }
        let now = self.clock.now_ms();
        let held_elsewhere = matches!(
            self.read_record(),
            Some(record) if record.is_live(now) && record.owner != self.tab
        );
        let announced = now < self.busy_until.get();
        self.set_status(if held_elsewhere || announced {
            LockStatus::BusyElsewhere
        } else {
            LockStatus::Idle
        });
    }

    fn on_signal(&self, signal: StatusSignal) {
        match signal {
            StatusSignal::Message(StatusMessage::Status { busy, origin }) => {
                if origin == self.tab {
                    return;
                }
                if busy {
                    let ttl = Millis::from(self.config.ttl_ms);
                    self.busy_until.set(self.clock.now_ms() + ttl);
                } else {
                    self.busy_until.set(0);
                }
                self.refresh_status();
            }
            StatusSignal::RecordChanged => self.refresh_status(),
        }
    }
}

/// Holds the lock for the lifetime of the guarded action.
struct Held {
    inner: Rc<LockInner>,
    lease: u64,
}

impl Held {
    fn enter(inner: &Rc<LockInner>, grant: Option<CancelOnDrop>) -> Self {
        let lease = inner.lease.get() + 1;
        inner.lease.set(lease);
        inner.phase.set(LockPhase::Acquired);
        *inner.grant.borrow_mut() = grant;
        inner.set_status(LockStatus::BusyHere);
        inner.channel.publish(&StatusMessage::busy(&inner.tab));

        let weak = Rc::downgrade(inner);
        let heartbeat = inner.scheduler.every(
            inner.config.heartbeat_ms,
            Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.renew();
                }
            }),
        );
        *inner.heartbeat.borrow_mut() = Some(heartbeat);
        info!("Tab {} acquired {}", inner.tab, inner.config.name);
        Held { inner: inner.clone(), lease }
    }
}

impl Drop for Held {
    fn drop(&mut self) {
        if self.inner.lease.get() == self.lease {
            self.inner.relinquish();
        }
    }
}

/// Resets a request abandoned while waiting on the platform.
struct PendingRequest<'a>(&'a LockInner);

impl Drop for PendingRequest<'_> {
    fn drop(&mut self) {
        if self.0.phase.get() == LockPhase::Requesting {
            self.0.phase.set(LockPhase::Idle);
        }
    }
}

/// Per-tab handle on the cross-tab lock. Clones share state.
#[derive(Clone)]
pub struct ExclusiveLock {
    inner: Rc<LockInner>,
}

impl ExclusiveLock {
    pub fn new(
        tab: TabId,
        storage: Rc<dyn KeyValueStorage>,
        clock: Rc<dyn Clock>,
        channel: Rc<dyn StatusChannel>,
        scheduler: Rc<dyn Scheduler>,
        config: LockConfig,
    ) -> Self {
        let inner = Rc::new_cyclic(|weak: &Weak<LockInner>| {
            let listener = weak.clone();
            let subscription = channel.subscribe(Rc::new(move |signal: StatusSignal| {
                if let Some(inner) = listener.upgrade() {
                    inner.on_signal(signal);
                }
            }));
            LockInner {
                this: weak.clone(),
                tab,
                storage,
                clock,
                channel,
                scheduler,
                config,
                platform: RefCell::new(None),
                phase: Cell::new(LockPhase::Idle),
                status: Cell::new(LockStatus::Idle),
                busy_until: Cell::new(0),
                lease: Cell::new(0),
                heartbeat: RefCell::new(None),
                grant: RefCell::new(None),
                expiry_check: RefCell::new(None),
                watchers: RefCell::new(Vec::new()),
                next_watcher: Cell::new(0),
                _subscription: subscription,
            }
        });
        inner.refresh_status();

        ExclusiveLock { inner }
    }

    /// Let `locks` decide who wins before the storage record is consulted.
    pub fn with_platform_locks(self, locks: Rc<dyn PlatformLocks>) -> Self {
        *self.inner.platform.borrow_mut() = Some(locks);
        self
    }

    pub fn tab(&self) -> &TabId {
        &self.inner.tab
    }

    pub fn phase(&self) -> LockPhase {
        self.inner.phase.get()
    }

    pub fn status(&self) -> LockStatus {
        self.inner.status.get()
    }

    /// Current record, or `None` when absent, unreadable or expired.
    pub fn live_record(&self) -> Option<LockRecord> {
        let now = self.inner.clock.now_ms();
        self.inner.read_record().filter(|r| r.is_live(now))
    }

    /// Recompute the status from the stored record.
    pub fn refresh_status(&self) {
        self.inner.refresh_status();
    }

    /// Called with every status change until the handle is dropped.
    pub fn watch(&self, listener: impl Fn(LockStatus) + 'static) -> CancelOnDrop {
        let id = self.inner.next_watcher.get() + 1;
        self.inner.next_watcher.set(id);
        self.inner.watchers.borrow_mut().push((id, Rc::new(listener)));
        let weak = Rc::downgrade(&self.inner);
        CancelOnDrop::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.watchers.borrow_mut().retain(|(w, _)| *w != id);
            }
        })
    }

    /// Run `action` if no other tab holds the lock.
    ///
    /// Returns `Ok(Exclusive::Denied)` without running the action when the
    /// lock is busy, including an overlapping request from this same tab.
    /// Errors from the action are returned unchanged after the lock is
    /// released.
    pub async fn run_exclusive<F, Fut, T, E>(&self, action: F) -> Result<Exclusive<T>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if matches!(self.inner.phase.get(), LockPhase::Acquired | LockPhase::Requesting) {
            debug!("Overlapping exclusive request in tab {} denied", self.inner.tab);
            return Ok(Exclusive::Denied);
        }

        self.inner.phase.set(LockPhase::Requesting);
        let pending = PendingRequest(&self.inner);
        let platform = self.inner.platform.borrow().clone();
        let grant = match platform {
            Some(locks) => match locks.try_request(&self.inner.config.name).await {
                Ok(Some(grant)) => Some(grant),
                Ok(None) => return Ok(self.deny()),
                Err(e) => {
                    warn!("Platform lock request failed, using the storage record: {}", e);
                    None
                }
            },
            None => None,
        };

        if grant.is_some() {
            self.inner.claim();
        } else if !self.inner.try_acquire() {
            return Ok(self.deny());
        }
        drop(pending);

        let held = Held::enter(&self.inner, grant);
        let outcome = action().await;
        drop(held);
        outcome.map(Exclusive::Ran)
    }

    fn deny<T>(&self) -> Exclusive<T> {
        self.inner.phase.set(LockPhase::Denied);
        self.inner.set_status(LockStatus::BusyElsewhere);
        info!("Tab {} denied {}: busy elsewhere", self.inner.tab, self.inner.config.name);
        Exclusive::Denied
    }

    /// Give the lock up immediately, e.g. when the page unloads mid-action.
    /// The action keeps running but no longer holds the lock, and its guard
    /// does nothing more when it finishes.
    pub fn release_if_held(&self) {
        self.inner.relinquish();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::MemoryBus;
    use crate::clock::ManualClock;
    use crate::scheduler::ManualScheduler;
    use crate::storage::MemoryStorage;
    use futures::executor::block_on;
    use futures::FutureExt;

    const LOCK_KEY: &str = crate::config::LOCK_NAME;

    struct Tabs {
        storage: MemoryStorage,
        clock: ManualClock,
        bus: MemoryBus,
        scheduler: ManualScheduler,
    }

    impl Tabs {
        fn new() -> Self {
            Tabs {
                storage: MemoryStorage::new(),
                clock: ManualClock::new(1_000_000),
                bus: MemoryBus::new(),
                scheduler: ManualScheduler::new(),
            }
        }

        fn open(&self, id: &str) -> ExclusiveLock {
            ExclusiveLock::new(
                TabId::from(id),
                Rc::new(self.storage.clone()),
                Rc::new(self.clock.clone()),
                Rc::new(self.bus.channel(TabId::from(id))),
                Rc::new(self.scheduler.clone()),
                LockConfig::default(),
            )
        }

        fn record(&self) -> Option<LockRecord> {
            let raw = self.storage.get_item(LOCK_KEY).unwrap()?;
            serde_json::from_str(&raw).ok()
        }

        fn plant(&self, record: &LockRecord) {
            self.storage
                .set_item(LOCK_KEY, &serde_json::to_string(record).unwrap())
                .unwrap();
        }
    }

    #[test]
    fn base36_matches_radix_formatting() {
        assert_eq!(base36(0), "0");
        assert_eq!(base36(35), "z");
        assert_eq!(base36(36), "10");
        assert_eq!(base36(1_295), "zz");
    }

    #[test]
    fn generated_tab_ids_differ() {
        let clock = ManualClock::new(42);
        assert_ne!(TabId::generate(&clock), TabId::generate(&clock));
    }

    #[test]
    fn action_runs_holding_the_lock_and_releases_after() {
        let tabs = &Tabs::new();
        let lock = &tabs.open("a");

        let outcome = block_on(lock.run_exclusive(move || async move {
            assert_eq!(lock.phase(), LockPhase::Acquired);
            assert_eq!(lock.status(), LockStatus::BusyHere);
            let record = tabs.record().expect("lock record written");
            assert_eq!(record.owner, TabId::from("a"));
            assert_eq!(record.expires_at, 1_000_000 + 10_000);
            Ok::<_, ()>(7)
        }));

        assert_eq!(outcome, Ok(Exclusive::Ran(7)));
        assert!(tabs.record().is_none());
        assert_eq!(lock.phase(), LockPhase::Idle);
        assert_eq!(lock.status(), LockStatus::Idle);
        assert_eq!(tabs.scheduler.active(), 0);
    }

    #[test]
    fn second_tab_is_denied_and_sees_busy() {
        let tabs = &Tabs::new();
        let a = &tabs.open("a");
        let b = &tabs.open("b");

        let outcome = block_on(a.run_exclusive(move || async move {
            assert_eq!(b.status(), LockStatus::BusyElsewhere);
            let nested = b.run_exclusive(|| async { Ok::<_, ()>(()) }).await;
            assert_eq!(nested, Ok(Exclusive::Denied));
            assert_eq!(b.phase(), LockPhase::Denied);
            Ok::<_, ()>(())
        }));

        assert!(outcome.unwrap().ran());
        assert_eq!(b.status(), LockStatus::Idle);
        assert_eq!(b.phase(), LockPhase::Idle);
    }

    #[test]
    fn nested_request_in_holding_tab_is_denied() {
        let tabs = &Tabs::new();
        let a = &tabs.open("a");
        let outcome = block_on(a.run_exclusive(move || async move {
            let inner = a.run_exclusive(|| async { Ok::<_, ()>(()) }).await;
            assert_eq!(inner, Ok(Exclusive::Denied));
            assert_eq!(a.status(), LockStatus::BusyHere);
            Ok::<_, ()>(())
        }));
        assert!(outcome.unwrap().ran());
    }

    #[test]
    fn expired_record_is_taken_over() {
        let tabs = &Tabs::new();
        tabs.plant(&LockRecord { owner: TabId::from("crashed"), expires_at: 999_999 });

        let lock = &tabs.open("a");
        assert_eq!(lock.status(), LockStatus::Idle);
        assert!(lock.live_record().is_none());
        let outcome = block_on(lock.run_exclusive(|| async { Ok::<_, ()>(()) }));
        assert!(outcome.unwrap().ran());
    }

    #[test]
    fn live_foreign_record_denies() {
        let tabs = &Tabs::new();
        let live = LockRecord { owner: TabId::from("other"), expires_at: 1_000_500 };
        tabs.plant(&live);

        let lock = &tabs.open("a");
        assert_eq!(lock.status(), LockStatus::BusyElsewhere);
        let ran = &Cell::new(false);
        let outcome = block_on(lock.run_exclusive(move || async move {
            ran.set(true);
            Ok::<_, ()>(())
        }));
        assert_eq!(outcome, Ok(Exclusive::Denied));
        assert!(!ran.get());
        assert_eq!(tabs.record(), Some(live));
    }

    #[test]
    fn failing_action_still_releases_and_propagates() {
        let tabs = &Tabs::new();
        let a = &tabs.open("a");
        let b = &tabs.open("b");

        let outcome = block_on(a.run_exclusive(|| async { Err::<(), _>("quota".to_string()) }));

        assert_eq!(outcome, Err("quota".to_string()));
        assert!(tabs.record().is_none());
        assert_eq!(a.status(), LockStatus::Idle);
        assert_eq!(b.status(), LockStatus::Idle);
        let published = tabs.bus.published();
        assert_eq!(published.last(), Some(&StatusMessage::idle(&TabId::from("a"))));
    }

    #[test]
    fn heartbeat_extends_expiry_until_completion() {
        let tabs = &Tabs::new();
        let lock = &tabs.open("a");
        let outcome = block_on(lock.run_exclusive(move || async move {
            assert_eq!(tabs.scheduler.periods(), vec![2_000]);
            tabs.clock.advance(8_000);
            tabs.scheduler.fire();
            assert_eq!(tabs.record().unwrap().expires_at, 1_008_000 + 10_000);
            Ok::<_, ()>(())
        }));
        assert!(outcome.unwrap().ran());
        assert_eq!(tabs.scheduler.active(), 0);
    }

    #[test]
    fn heartbeat_does_not_reclaim_a_lost_lock() {
        let tabs = &Tabs::new();
        let lock = &tabs.open("a");
        let thief = LockRecord { owner: TabId::from("b"), expires_at: 2_000_000 };
        let planted = thief.clone();
        let outcome = block_on(lock.run_exclusive(move || async move {
            tabs.plant(&planted);
            tabs.scheduler.fire();
            Ok::<_, ()>(())
        }));
        assert!(outcome.unwrap().ran());
        // A record owned by someone else is never removed.
        assert_eq!(tabs.record(), Some(thief));
        assert_eq!(lock.status(), LockStatus::BusyElsewhere);
    }

    #[test]
    fn corrupted_record_counts_as_absent() {
        let tabs = &Tabs::new();
        tabs.storage.set_item(LOCK_KEY, "garbage").unwrap();
        let lock = &tabs.open("a");
        let outcome = block_on(lock.run_exclusive(|| async { Ok::<_, ()>(()) }));
        assert!(outcome.unwrap().ran());
    }

    #[test]
    fn broken_storage_does_not_block_the_action() {
        let tabs = &Tabs::new();
        tabs.storage.set_broken(true);
        let lock = &tabs.open("a");
        let outcome = block_on(lock.run_exclusive(|| async { Ok::<_, ()>("done") }));
        assert_eq!(outcome, Ok(Exclusive::Ran("done")));
    }

    #[test]
    fn watchers_see_status_changes() {
        let tabs = &Tabs::new();
        let a = &tabs.open("a");
        let b = &tabs.open("b");
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();
        let watch = b.watch(move |status| sink.borrow_mut().push(status));

        let first = block_on(a.run_exclusive(|| async { Ok::<_, ()>(()) }));
        assert!(first.unwrap().ran());
        assert_eq!(*seen.borrow(), vec![LockStatus::BusyElsewhere, LockStatus::Idle]);

        drop(watch);
        let second = block_on(a.run_exclusive(|| async { Ok::<_, ()>(()) }));
        assert!(second.unwrap().ran());
        assert_eq!(seen.borrow().len(), 2);
    }

    #[test]
    fn release_if_held_ends_the_hold_once() {
        let tabs = &Tabs::new();
        let a = &tabs.open("a");
        let b = &tabs.open("b");
        let outcome = block_on(a.run_exclusive(move || async move {
            assert_eq!(b.status(), LockStatus::BusyElsewhere);
            a.release_if_held();
            assert!(tabs.record().is_none());
            assert_eq!(a.phase(), LockPhase::Idle);
            assert_eq!(a.status(), LockStatus::Idle);
            assert_eq!(b.status(), LockStatus::Idle);
            // Heartbeat gone, and b stopped re-checking.
            assert_eq!(tabs.scheduler.active(), 0);
            Ok::<_, ()>(())
        }));
        assert!(outcome.unwrap().ran());

        let idle = StatusMessage::idle(&TabId::from("a"));
        let idles = tabs.bus.published().iter().filter(|m| **m == idle).count();
        assert_eq!(idles, 1);
    }

    #[test]
    fn busy_tab_that_dies_silently_is_forgotten_after_the_ttl() {
        let tabs = &Tabs::new();
        let b = &tabs.open("b");

        // Tab a acquired, announced itself and was then killed.
        tabs.plant(&LockRecord { owner: TabId::from("a"), expires_at: 1_010_000 });
        tabs.bus.channel(TabId::from("a")).publish(&StatusMessage::busy(&TabId::from("a")));
        assert_eq!(b.status(), LockStatus::BusyElsewhere);
        assert_eq!(tabs.scheduler.periods(), vec![1_000]);

        tabs.clock.advance(5_000);
        tabs.scheduler.fire();
        assert_eq!(b.status(), LockStatus::BusyElsewhere);

        tabs.clock.advance(55_000);
        tabs.scheduler.fire();
        assert!(b.live_record().is_none());
        assert_eq!(b.status(), LockStatus::Idle);
        assert_eq!(b.phase(), LockPhase::Idle);
        assert_eq!(tabs.scheduler.active(), 0);
    }

    #[test]
    fn busy_message_without_a_record_lasts_one_ttl() {
        let tabs = &Tabs::new();
        let b = &tabs.open("b");
        tabs.bus.channel(TabId::from("a")).publish(&StatusMessage::busy(&TabId::from("a")));
        assert_eq!(b.status(), LockStatus::BusyElsewhere);

        tabs.clock.advance(9_999);
        tabs.scheduler.fire();
        assert_eq!(b.status(), LockStatus::BusyElsewhere);

        tabs.clock.advance(1);
        tabs.scheduler.fire();
        assert_eq!(b.status(), LockStatus::Idle);
    }

    #[test]
    fn heartbeat_repeats_the_busy_message() {
        let tabs = &Tabs::new();
        let a = &tabs.open("a");
        let b = &tabs.open("b");
        let busy = StatusMessage::busy(&TabId::from("a"));
        let outcome = block_on(a.run_exclusive(move || async move {
            for _ in 0..3 {
                tabs.clock.advance(8_000);
                tabs.scheduler.fire();
                assert_eq!(b.status(), LockStatus::BusyElsewhere);
            }
            Ok::<_, ()>(())
        }));
        assert!(outcome.unwrap().ran());
        let announced = tabs.bus.published().iter().filter(|m| **m == busy).count();
        assert_eq!(announced, 4);
        assert_eq!(b.status(), LockStatus::Idle);
    }

    /// One platform lock shared by every tab, like `navigator.locks`.
    #[derive(Clone, Default)]
    struct SharedLocks {
        held: Rc<Cell<bool>>,
        failing: bool,
    }

    impl PlatformLocks for SharedLocks {
        fn try_request(
            &self,
            _name: &str,
        ) -> LocalBoxFuture<'static, Result<Option<CancelOnDrop>, String>> {
            let answer = if self.failing {
                Err("SecurityError".to_string())
            } else if self.held.get() {
                Ok(None)
            } else {
                self.held.set(true);
                let held = self.held.clone();
                Ok(Some(CancelOnDrop::new(move || held.set(false))))
            };
            futures::future::ready(answer).boxed_local()
        }
    }

    #[test]
    fn platform_lock_decides_even_when_the_record_is_missing() {
        let tabs = &Tabs::new();
        let locks = SharedLocks::default();
        let a = &tabs.open("a").with_platform_locks(Rc::new(locks.clone()));
        let b = &tabs.open("b").with_platform_locks(Rc::new(locks.clone()));

        let outcome = block_on(a.run_exclusive(move || async move {
            assert_eq!(tabs.record().unwrap().owner, TabId::from("a"));
            // A racing writer wiped the record; storage alone would let b in.
            tabs.storage.remove_item(LOCK_KEY).unwrap();
            let second = b.run_exclusive(|| async { Ok::<_, ()>(()) }).await;
            assert_eq!(second, Ok(Exclusive::Denied));
            Ok::<_, ()>(())
        }));
        assert!(outcome.unwrap().ran());
        assert!(!locks.held.get());

        let retry = block_on(b.run_exclusive(|| async { Ok::<_, ()>("b") }));
        assert_eq!(retry, Ok(Exclusive::Ran("b")));
    }

    #[test]
    fn platform_grant_overrides_a_dead_holders_record() {
        let tabs = &Tabs::new();
        tabs.plant(&LockRecord { owner: TabId::from("ghost"), expires_at: 1_005_000 });
        let locks = SharedLocks::default();
        let a = &tabs.open("a").with_platform_locks(Rc::new(locks.clone()));

        let outcome = block_on(a.run_exclusive(move || async move {
            assert_eq!(tabs.record().unwrap().owner, TabId::from("a"));
            Ok::<_, ()>(())
        }));
        assert!(outcome.unwrap().ran());
        assert!(tabs.record().is_none());
    }

    #[test]
    fn failing_platform_lock_falls_back_to_the_record() {
        let tabs = &Tabs::new();
        let broken = SharedLocks { failing: true, ..SharedLocks::default() };
        let a = &tabs.open("a").with_platform_locks(Rc::new(broken));
        let b = &tabs.open("b");

        let outcome = block_on(a.run_exclusive(move || async move {
            assert_eq!(tabs.record().unwrap().owner, TabId::from("a"));
            let second = b.run_exclusive(|| async { Ok::<_, ()>(()) }).await;
            assert_eq!(second, Ok(Exclusive::Denied));
            Ok::<_, ()>(())
        }));
        assert!(outcome.unwrap().ran());
    }

    #[test]
    fn release_if_held_frees_the_platform_grant() {
        let tabs = &Tabs::new();
        let locks = SharedLocks::default();
        let a = &tabs.open("a").with_platform_locks(Rc::new(locks.clone()));
        let held = locks.held.clone();
        let outcome = block_on(a.run_exclusive(move || async move {
            assert!(held.get());
            a.release_if_held();
            assert!(!held.get());
            Ok::<_, ()>(())
        }));
        assert!(outcome.unwrap().ran());
    }
}
