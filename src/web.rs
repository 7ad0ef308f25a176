//! Browser bindings: `localStorage`, tab-to-tab signalling, Web Locks,
//! console logging and the classes exported to JavaScript.

use crate::broadcast::{
    StatusChannel, StatusListener, StatusMessage, StatusSignal, StoragePollChannel,
};
use crate::clock::{Clock, SystemClock};
use crate::config::{CacheConfig, LockConfig};
use crate::credentials::CredentialPool;
use crate::criteria::{HardFilters, WeightCriteria};
use crate::fingerprint::{AnalysisContext, FileDescriptor};
use crate::lock::{Exclusive, ExclusiveLock, LockStatus, PlatformLocks, TabId};
use crate::scheduler::{CancelOnDrop, IntervalScheduler, Scheduler};
use crate::service::{AnalysisService, ServiceParts};
use crate::storage::{KeyValueStorage, MemoryStorage, StorageError};
use futures::channel::oneshot;
use futures::future::LocalBoxFuture;
use futures::FutureExt;
use gloo_utils::format::JsValueSerdeExt;
use log::{debug, warn, Level, LevelFilter, Log, Metadata, Record};
use serde::Serialize;
use serde_json::Value;
use std::cell::RefCell;
use std::rc::Rc;
use wasm_bindgen::prelude::*;
use wasm_bindgen::convert::FromWasmAbi;
use wasm_bindgen::JsCast;
use wasm_bindgen_futures::JsFuture;

fn describe(err: &JsValue) -> String {
    err.as_string()
        .or_else(|| js_sys::Reflect::get(err, &JsValue::from_str("message")).ok()?.as_string())
        .unwrap_or_else(|| format!("{:?}", err))
}

fn storage_error(err: JsValue) -> StorageError {
    let name = js_sys::Reflect::get(&err, &JsValue::from_str("name"))
        .ok()
        .and_then(|n| n.as_string());
    match name.as_deref() {
        Some("QuotaExceededError") | Some("NS_ERROR_DOM_QUOTA_REACHED") => {
            StorageError::QuotaExceeded
        }
        _ => StorageError::Backend(describe(&err)),
    }
}

/// `window.localStorage`.
pub struct LocalStorage {
    inner: web_sys::Storage,
}

impl LocalStorage {
    pub fn open() -> Result<Self, StorageError> {
        let window =
            web_sys::window().ok_or_else(|| StorageError::Unavailable("no window".into()))?;
        let inner = window
            .local_storage()
            .map_err(|e| StorageError::Unavailable(describe(&e)))?
            .ok_or_else(|| StorageError::Unavailable("localStorage is disabled".into()))?;
        Ok(Self { inner })
    }
}

impl KeyValueStorage for LocalStorage {
    fn get_item(&self, key: &str) -> Result<Option<String>, StorageError> {
        self.inner.get_item(key).map_err(storage_error)
    }

    fn set_item(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.inner.set_item(key, value).map_err(storage_error)
    }

    fn remove_item(&self, key: &str) -> Result<(), StorageError> {
        self.inner.remove_item(key).map_err(storage_error)
    }

    fn keys(&self) -> Result<Vec<String>, StorageError> {
        let len = self.inner.length().map_err(storage_error)?;
        let mut keys = Vec::with_capacity(len as usize);
        for i in 0..len {
            if let Some(key) = self.inner.key(i).map_err(storage_error)? {
                keys.push(key);
            }
        }
        Ok(keys)
    }
}

/// Adds `callback` as a `type` listener on `target`; dropping the handle removes it.
fn listen<E: FromWasmAbi + 'static>(
    target: web_sys::EventTarget,
    event_type: &'static str,
    callback: impl FnMut(E) + 'static,
) -> Result<CancelOnDrop, JsValue> {
    let closure = Closure::<dyn FnMut(E)>::new(callback);
    target.add_event_listener_with_callback(event_type, closure.as_ref().unchecked_ref())?;
    Ok(CancelOnDrop::new(move || {
        let _ = target
            .remove_event_listener_with_callback(event_type, closure.as_ref().unchecked_ref());
        drop(closure);
    }))
}

/// Status messages over a `BroadcastChannel`. The sender never hears itself.
pub struct BroadcastChannelTransport {
    channel: web_sys::BroadcastChannel,
}

impl BroadcastChannelTransport {
    pub fn open(name: &str) -> Result<Self, JsValue> {
        Ok(Self { channel: web_sys::BroadcastChannel::new(name)? })
    }
}

impl StatusChannel for BroadcastChannelTransport {
    fn publish(&self, message: &StatusMessage) {
        let value = match JsValue::from_serde(message) {
            Ok(value) => value,
            Err(e) => {
                warn!("Cannot encode status message: {}", e);
                return;
            }
        };
        if let Err(e) = self.channel.post_message(&value) {
            warn!("Status broadcast failed: {}", describe(&e));
        }
    }

    fn subscribe(&self, listener: StatusListener) -> CancelOnDrop {
        let on_message = move |event: web_sys::MessageEvent| {
            match event.data().into_serde::<StatusMessage>() {
                Ok(message) => listener(StatusSignal::Message(message)),
                Err(e) => debug!("Ignoring foreign channel message: {}", e),
            }
        };
        let target: web_sys::EventTarget = self.channel.clone().into();
        listen(target, "message", on_message).unwrap_or_else(|e| {
            warn!("Cannot listen on status channel: {}", describe(&e));
            CancelOnDrop::new(|| {})
        })
    }
}

impl Drop for BroadcastChannelTransport {
    fn drop(&mut self) {
        self.channel.close();
    }
}

/// Fallback when `BroadcastChannel` is missing: `storage` events for the lock
/// record plus a periodic re-read of it.
pub struct StorageEventTransport {
    poll: StoragePollChannel,
}

impl StorageEventTransport {
    pub fn new(
        storage: Rc<dyn KeyValueStorage>,
        scheduler: Rc<dyn Scheduler>,
        config: &LockConfig,
    ) -> Self {
        let poll =
            StoragePollChannel::new(storage, scheduler, config.name.clone(), config.poll_ms);
        Self { poll }
    }
}

impl StatusChannel for StorageEventTransport {
    fn publish(&self, message: &StatusMessage) {
        self.poll.publish(message);
    }

    fn subscribe(&self, listener: StatusListener) -> CancelOnDrop {
        let polling = self.poll.subscribe(listener.clone());
        let Some(window) = web_sys::window() else {
            return polling;
        };

        let record_key = self.poll.record_key().to_string();
        let on_storage = move |event: web_sys::StorageEvent| {
            // `key` is null when another tab cleared the whole storage.
            if event.key().map_or(true, |key| key == record_key) {
                listener(StatusSignal::RecordChanged);
            }
        };
        match listen(window.into(), "storage", on_storage) {
            Ok(events) => CancelOnDrop::new(move || {
                drop(events);
                drop(polling);
            }),
            Err(e) => {
                warn!("Cannot listen for storage events: {}", describe(&e));
                polling
            }
        }
    }
}

/// `navigator.locks`, requested with `ifAvailable` so a busy lock is refused
/// instead of queued.
pub struct WebLocks {
    locks: JsValue,
    request: js_sys::Function,
}

impl WebLocks {
    /// `None` in browsers without the Web Locks API.
    pub fn detect() -> Option<Self> {
        let navigator = web_sys::window()?.navigator();
        let locks = js_sys::Reflect::get(&navigator, &JsValue::from_str("locks")).ok()?;
        if locks.is_undefined() || locks.is_null() {
            return None;
        }
        let request = js_sys::Reflect::get(&locks, &JsValue::from_str("request"))
            .ok()?
            .dyn_into::<js_sys::Function>()
            .ok()?;
        Some(Self { locks, request })
    }
}

impl PlatformLocks for WebLocks {
    fn try_request(
        &self,
        name: &str,
    ) -> LocalBoxFuture<'static, Result<Option<CancelOnDrop>, String>> {
        let (answer_tx, answer_rx) = oneshot::channel::<Result<bool, String>>();
        let answer = Rc::new(RefCell::new(Some(answer_tx)));
        let (release_tx, release_rx) = oneshot::channel::<()>();

        let reply = answer.clone();
        let on_grant = Closure::once_into_js(move |lock: JsValue| -> js_sys::Promise {
            let granted = !lock.is_null();
            if let Some(tx) = reply.borrow_mut().take() {
                let _ = tx.send(Ok(granted));
            }
            if !granted {
                return js_sys::Promise::resolve(&JsValue::UNDEFINED);
            }
            // The browser holds the lock until this promise settles.
            wasm_bindgen_futures::future_to_promise(async move {
                let _ = release_rx.await;
                Ok(JsValue::UNDEFINED)
            })
        });

        let options = js_sys::Object::new();
        let _ = js_sys::Reflect::set(&options, &"mode".into(), &"exclusive".into());
        let _ = js_sys::Reflect::set(&options, &"ifAvailable".into(), &JsValue::TRUE);
        let name = JsValue::from_str(name);
        let pending = match self.request.call3(&self.locks, &name, &options, &on_grant) {
            Ok(pending) => pending,
            Err(e) => return futures::future::ready(Err(describe(&e))).boxed_local(),
        };
        if let Ok(pending) = pending.dyn_into::<js_sys::Promise>() {
            wasm_bindgen_futures::spawn_local(async move {
                if let Err(e) = JsFuture::from(pending).await {
                    if let Some(tx) = answer.borrow_mut().take() {
                        let _ = tx.send(Err(describe(&e)));
                    }
                }
            });
        }

        async move {
            match answer_rx.await {
                Ok(Ok(true)) => Ok(Some(CancelOnDrop::new(move || drop(release_tx)))),
                Ok(Ok(false)) => Ok(None),
                Ok(Err(e)) => Err(e),
                Err(_) => Err("lock request was abandoned".to_string()),
            }
        }
        .boxed_local()
    }
}

/// `localStorage`, or an in-memory map when the browser refuses it. Caching
/// then only lasts for the page's lifetime.
pub fn open_storage() -> Rc<dyn KeyValueStorage> {
    match LocalStorage::open() {
        Ok(storage) => Rc::new(storage),
        Err(e) => {
            warn!("{}; falling back to in-memory storage", e);
            Rc::new(MemoryStorage::new())
        }
    }
}

/// `BroadcastChannel` when available, storage signalling otherwise.
pub fn open_channel(
    storage: Rc<dyn KeyValueStorage>,
    scheduler: Rc<dyn Scheduler>,
    config: &LockConfig,
) -> Rc<dyn StatusChannel> {
    match BroadcastChannelTransport::open(&config.channel) {
        Ok(channel) => Rc::new(channel),
        Err(e) => {
            debug!("BroadcastChannel unavailable ({}), using storage events", describe(&e));
            Rc::new(StorageEventTransport::new(storage, scheduler, config))
        }
    }
}

/// The service wired to real browser facilities, with a fresh tab id.
pub fn connect<R>(cache: CacheConfig, lock: LockConfig) -> AnalysisService<R>
where
    R: Serialize + serde::de::DeserializeOwned,
{
    let clock: Rc<dyn Clock> = Rc::new(SystemClock);
    let storage = open_storage();
    let scheduler: Rc<dyn Scheduler> = Rc::new(IntervalScheduler);
    let channel = open_channel(storage.clone(), scheduler.clone(), &lock);
    let service = AnalysisService::new(ServiceParts {
        tab: TabId::generate(clock.as_ref()),
        storage,
        clock,
        channel,
        scheduler,
        cache,
        lock,
    });
    match WebLocks::detect() {
        Some(locks) => service.with_platform_locks(Rc::new(locks)),
        None => {
            debug!("Web Locks API unavailable, the lock record alone guards runs");
            service
        }
    }
}

/// Drop the lock record as the page goes away, so other tabs need not wait
/// out the TTL.
pub fn release_on_unload(lock: &ExclusiveLock) -> CancelOnDrop {
    let Some(window) = web_sys::window() else {
        return CancelOnDrop::new(|| {});
    };
    let lock = lock.clone();
    let on_unload = move |_: web_sys::Event| lock.release_if_held();
    listen(window.into(), "beforeunload", on_unload).unwrap_or_else(|e| {
        warn!("Cannot watch page unload: {}", describe(&e));
        CancelOnDrop::new(|| {})
    })
}

/// `log` backend writing to the browser console.
struct ConsoleLogger;

impl Log for ConsoleLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let line = JsValue::from_str(&format!("[{}] {}", record.target(), record.args()));
        match record.level() {
            Level::Error => web_sys::console::error_1(&line),
            Level::Warn => web_sys::console::warn_1(&line),
            Level::Info => web_sys::console::info_1(&line),
            Level::Debug | Level::Trace => web_sys::console::debug_1(&line),
        }
    }

    fn flush(&self) {}
}

static LOGGER: ConsoleLogger = ConsoleLogger;

/// Route `log` output to the console. Later calls only change the level.
pub fn init_logging(level: LevelFilter) {
    let _ = log::set_logger(&LOGGER);
    log::set_max_level(level);
}

fn to_js<T: Serialize + ?Sized>(value: &T) -> Result<JsValue, JsValue> {
    value
        .serialize(&serde_wasm_bindgen::Serializer::json_compatible())
        .map_err(JsValue::from)
}

fn from_js<T: serde::de::DeserializeOwned>(value: JsValue, what: &str) -> Result<T, JsValue> {
    serde_wasm_bindgen::from_value(value)
        .map_err(|e| JsValue::from_str(&format!("Invalid {}: {}", what, e)))
}

fn status_name(status: LockStatus) -> &'static str {
    match status {
        LockStatus::Idle => "idle",
        LockStatus::BusyHere => "busy-here",
        LockStatus::BusyElsewhere => "busy-elsewhere",
    }
}

/// Analysis cache and cross-tab lock for JavaScript callers. Results are
/// stored as arbitrary JSON.
#[wasm_bindgen]
pub struct JsAnalysisCache {
    service: Rc<AnalysisService<Value>>,
    watchers: RefCell<Vec<CancelOnDrop>>,
    _unload: CancelOnDrop,
}

#[wasm_bindgen]
impl JsAnalysisCache {
    #[wasm_bindgen(constructor)]
    pub fn new() -> JsAnalysisCache {
        console_error_panic_hook::set_once();
        init_logging(LevelFilter::Info);
        let service = Rc::new(connect(CacheConfig::default(), LockConfig::default()));
        let unload = release_on_unload(service.lock());
        JsAnalysisCache { service, watchers: RefCell::new(Vec::new()), _unload: unload }
    }

    #[wasm_bindgen(js_name = generateAnalysisHashes)]
    pub fn generate_analysis_hashes(
        &self,
        jd_text: &str,
        weights: JsValue,
        filters: JsValue,
    ) -> Result<JsValue, JsValue> {
        let weights: WeightCriteria = from_js(weights, "weights")?;
        let filters: HardFilters = from_js(filters, "filters")?;
        let context = self
            .service
            .analysis_hashes(jd_text, &weights, &filters)
            .map_err(|e| JsValue::from_str(&e.to_string()))?;
        to_js(&context)
    }

    /// `{cached: [{file, result}], uncached: [file]}`.
    pub fn resolve(&self, files: JsValue, context: JsValue) -> Result<JsValue, JsValue> {
        let files: Vec<FileDescriptor> = from_js(files, "files")?;
        let context: AnalysisContext = from_js(context, "analysis hashes")?;
        to_js(&self.service.resolve(&files, &context))
    }

    #[wasm_bindgen(js_name = cacheAnalysis)]
    pub fn cache_analysis(
        &self,
        file: JsValue,
        result: JsValue,
        context: JsValue,
    ) -> Result<(), JsValue> {
        let file: FileDescriptor = from_js(file, "file")?;
        let result: Value = from_js(result, "result")?;
        let context: AnalysisContext = from_js(context, "analysis hashes")?;
        self.service.cache_analysis(&file, &result, &context);
        Ok(())
    }

    #[wasm_bindgen(js_name = getCacheStats)]
    pub fn get_cache_stats(&self) -> Result<JsValue, JsValue> {
        to_js(&self.service.cache_stats())
    }

    /// Every stored entry, oldest first.
    #[wasm_bindgen(js_name = getCacheEntries)]
    pub fn get_cache_entries(&self) -> Result<JsValue, JsValue> {
        to_js(&self.service.store().entries())
    }

    #[wasm_bindgen(js_name = clearCache)]
    pub fn clear_cache(&self) {
        self.service.clear_cache();
    }

    /// `"idle"`, `"busy-here"` or `"busy-elsewhere"`.
    pub fn status(&self) -> String {
        status_name(self.service.lock_status()).to_string()
    }

    #[wasm_bindgen(js_name = onStatusChange)]
    pub fn on_status_change(&self, callback: js_sys::Function) {
        let handle = self.service.lock().watch(move |status| {
            let name = JsValue::from_str(status_name(status));
            if let Err(e) = callback.call1(&JsValue::NULL, &name) {
                warn!("Status callback threw: {}", describe(&e));
            }
        });
        self.watchers.borrow_mut().push(handle);
    }

    /// Runs `action` (which may return a promise) if no other tab is busy.
    /// Resolves to `{ran: true, value}` or `{ran: false}`; rejects with
    /// whatever the action threw.
    #[wasm_bindgen(js_name = runExclusive)]
    pub fn run_exclusive(&self, action: js_sys::Function) -> js_sys::Promise {
        let service = self.service.clone();
        wasm_bindgen_futures::future_to_promise(async move {
            let outcome = service
                .run_exclusive(move || async move {
                    let returned = action.call0(&JsValue::NULL)?;
                    JsFuture::from(js_sys::Promise::resolve(&returned)).await
                })
                .await?;

            let reply = js_sys::Object::new();
            let (ran, value) = match outcome {
                Exclusive::Ran(value) => (true, value),
                Exclusive::Denied => (false, JsValue::UNDEFINED),
            };
            js_sys::Reflect::set(&reply, &JsValue::from_str("ran"), &JsValue::from_bool(ran))?;
            if ran {
                js_sys::Reflect::set(&reply, &JsValue::from_str("value"), &value)?;
            }
            Ok(reply.into())
        })
    }

    pub fn release(&self) {
        self.service.lock().release_if_held();
    }
}

impl Default for JsAnalysisCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Rotating API credentials for JavaScript callers.
#[wasm_bindgen]
pub struct JsCredentialPool {
    pool: Rc<CredentialPool>,
}

#[wasm_bindgen]
impl JsCredentialPool {
    #[wasm_bindgen(constructor)]
    pub fn new(keys: Vec<String>) -> JsCredentialPool {
        JsCredentialPool { pool: Rc::new(CredentialPool::new(keys)) }
    }

    pub fn size(&self) -> usize {
        self.pool.len()
    }

    #[wasm_bindgen(js_name = currentIndex)]
    pub fn current_index(&self) -> usize {
        self.pool.current_index()
    }

    /// Calls `op(key)`, which may return a promise, with one credential after
    /// another until a call succeeds. Rejects once every credential failed.
    #[wasm_bindgen(js_name = withRotation)]
    pub fn with_rotation(&self, op: js_sys::Function) -> js_sys::Promise {
        let pool = self.pool.clone();
        wasm_bindgen_futures::future_to_promise(async move {
            pool.with_rotation(|key| {
                let op = op.clone();
                async move {
                    let returned = op
                        .call1(&JsValue::NULL, &JsValue::from_str(&key))
                        .map_err(|e| describe(&e))?;
                    JsFuture::from(js_sys::Promise::resolve(&returned))
                        .await
                        .map_err(|e| describe(&e))
                }
            })
            .await
            .map_err(|e| JsValue::from_str(&e.to_string()))
        })
    }
}
