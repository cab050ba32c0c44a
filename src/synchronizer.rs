//! Keeps the current configuration generation up to date: single-flight refreshes, cache
//! fallback, offline mode and background polling.
use std::{
    panic::{self, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Condvar, Mutex, MutexGuard, Weak,
    },
    thread::JoinHandle,
    time::Duration,
};

use chrono::{DateTime, Utc};

use crate::{
    cache::{parse_entry, serialize_entry, ConfigCache},
    configuration_fetcher::{ConfigurationFetcher, FetchOutcome},
    configuration_store::ConfigurationStore,
    poller::PollerThread,
    Configuration, Error, Result,
};

/// Callback invoked after a refresh replaced the configuration with different content.
pub type ConfigChangedHook = Arc<dyn Fn(&Configuration) + Send + Sync>;

/// A one-shot result that any number of threads can wait for. The result is kept after it is
/// delivered, so late waiters see it too.
#[derive(Default)]
pub(crate) struct Completion {
    result: Mutex<Option<Result<()>>>,
    signal: Condvar,
}

impl Completion {
    /// Store `result` and wake all waiters. Returns `false` if already completed.
    pub fn complete(&self, result: Result<()>) -> bool {
        let Ok(mut slot) = self.result.lock() else {
            return false;
        };
        if slot.is_some() {
            return false;
        }
        *slot = Some(result);
        self.signal.notify_all();
        true
    }

    /// Block until completed.
    pub fn wait(&self) -> Result<()> {
        let mut lock = self.result.lock().map_err(|_| Error::WorkerPanicked)?;
        loop {
            match &*lock {
                Some(result) => return result.clone(),
                None => lock = self.signal.wait(lock).map_err(|_| Error::WorkerPanicked)?,
            }
        }
    }

    /// Block until completed or `timeout` elapses. `None` means the timeout elapsed.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<()>> {
        let lock = match self.result.lock() {
            Ok(lock) => lock,
            Err(_) => return Some(Err(Error::WorkerPanicked)),
        };
        match self
            .signal
            .wait_timeout_while(lock, timeout, |result| result.is_none())
        {
            Ok((lock, _)) => lock.clone(),
            Err(_) => Some(Err(Error::WorkerPanicked)),
        }
    }
}

pub(crate) struct SynchronizerOptions {
    pub fetcher: ConfigurationFetcher,
    pub cache: Option<Arc<dyn ConfigCache>>,
    pub cache_key: String,
    pub offline: bool,
    pub on_config_changed: Option<ConfigChangedHook>,
}

pub(crate) struct Synchronizer {
    inner: Arc<Inner>,
    poller: Mutex<Option<PollerThread>>,
}

struct Inner {
    store: ConfigurationStore,
    fetcher: ConfigurationFetcher,
    cache: Option<Arc<dyn ConfigCache>>,
    cache_key: String,
    offline: AtomicBool,
    /// Guarded by `in_flight` for writes so that no worker starts after `close`.
    closed: AtomicBool,
    /// Completion of the refresh currently running, if any.
    in_flight: Mutex<Option<Arc<Completion>>>,
    /// Worker threads that may still be running.
    workers: Mutex<Vec<JoinHandle<()>>>,
    /// Fired once, after the first refresh cycle finishes, whatever its outcome.
    ready: Completion,
    on_config_changed: Option<ConfigChangedHook>,
}

/// Point in time `age` ago. Saturates instead of overflowing.
pub(crate) fn older_than(age: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(age)
        .ok()
        .and_then(|age| Utc::now().checked_sub_signed(age))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // Nothing panics while holding these locks; recover the data if it ever happens.
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl Synchronizer {
    pub fn new(options: SynchronizerOptions) -> Synchronizer {
        Synchronizer {
            inner: Arc::new(Inner {
                store: ConfigurationStore::new(),
                fetcher: options.fetcher,
                cache: options.cache,
                cache_key: options.cache_key,
                offline: AtomicBool::new(options.offline),
                closed: AtomicBool::new(false),
                in_flight: Mutex::new(None),
                workers: Mutex::new(Vec::new()),
                ready: Completion::default(),
                on_config_changed: options.on_config_changed,
            }),
            poller: Mutex::new(None),
        }
    }

    /// Current configuration generation. Never blocks.
    pub fn configuration(&self) -> Arc<Configuration> {
        self.inner.store.get_configuration()
    }

    /// Refresh unless the held configuration was fetched at or after `threshold`.
    ///
    /// Concurrent callers share one refresh. With `wait == false` the refresh runs in the
    /// background and this returns immediately.
    pub fn refresh_if_older(&self, threshold: DateTime<Utc>, wait: bool) -> Result<()> {
        self.inner.refresh_if_older(threshold, wait)
    }

    /// Refresh now and wait for the outcome.
    pub fn refresh(&self) -> Result<()> {
        self.refresh_if_older(DateTime::<Utc>::MAX_UTC, true)
    }

    /// Refresh now, waiting at most `timeout`. The refresh keeps running after a timeout and
    /// still updates the configuration when it completes.
    pub fn refresh_with_timeout(&self, timeout: Duration) -> Result<()> {
        let completion = self.inner.start(DateTime::<Utc>::MAX_UTC)?;
        completion
            .wait_timeout(timeout)
            .unwrap_or(Err(Error::RefreshTimeout))
    }

    /// Start refreshing in the background every `interval` (plus up to `jitter`).
    pub fn start_polling(&self, interval: Duration, jitter: Duration) -> Result<()> {
        let mut poller = lock(&self.poller);
        if poller.is_some() {
            return Ok(());
        }

        let inner: Weak<Inner> = Arc::downgrade(&self.inner);
        *poller = Some(PollerThread::start(interval, jitter, move || {
            let Some(inner) = inner.upgrade() else {
                return;
            };
            // A refresh triggered by someone else in the meantime counts.
            if let Err(err) = inner.refresh_if_older(older_than(interval / 2), true) {
                log::warn!(target: "remote_flags", "scheduled refresh failed: {err}");
            }
        })?);
        Ok(())
    }

    pub fn set_offline(&self) {
        if !self.inner.offline.swap(true, Ordering::AcqRel) {
            log::info!(target: "remote_flags", "switched to offline mode");
        }
    }

    pub fn set_online(&self) {
        if self.inner.offline.swap(false, Ordering::AcqRel) {
            log::info!(target: "remote_flags", "switched to online mode");
        }
    }

    pub fn is_offline(&self) -> bool {
        self.inner.offline.load(Ordering::Acquire)
    }

    /// Wait until the first refresh cycle finished. Returns `false` on timeout.
    pub fn wait_for_ready(&self, timeout: Duration) -> bool {
        self.inner.ready.wait_timeout(timeout).is_some()
    }

    /// Stop polling and wait for outstanding refreshes. No background writes happen afterwards.
    pub fn close(&self) -> Result<()> {
        {
            let _in_flight = lock(&self.inner.in_flight);
            if self.inner.closed.swap(true, Ordering::AcqRel) {
                return Ok(());
            }
        }

        if let Some(poller) = lock(&self.poller).take() {
            poller.shutdown()?;
        }

        let workers = std::mem::take(&mut *lock(&self.inner.workers));
        for worker in workers {
            worker.join().map_err(|_| Error::WorkerPanicked)?;
        }
        log::debug!(target: "remote_flags", "synchronizer closed");
        Ok(())
    }
}

impl Drop for Synchronizer {
    fn drop(&mut self) {
        if let Some(poller) = lock(&self.poller).as_ref() {
            poller.stop();
        }
    }
}

impl Inner {
    fn refresh_if_older(self: &Arc<Self>, threshold: DateTime<Utc>, wait: bool) -> Result<()> {
        let held = self.store.get_configuration();
        if !held.is_empty() && held.fetch_time() >= threshold {
            return Ok(());
        }
        let completion = self.start(threshold)?;
        if wait {
            completion.wait()
        } else {
            Ok(())
        }
    }

    /// Start a refresh cycle, or join the one already running.
    fn start(self: &Arc<Self>, threshold: DateTime<Utc>) -> Result<Arc<Completion>> {
        let mut in_flight = lock(&self.in_flight);
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        if let Some(completion) = in_flight.as_ref() {
            return Ok(completion.clone());
        }

        let completion = Arc::new(Completion::default());
        let worker = {
            let inner = Arc::clone(self);
            let completion = Arc::clone(&completion);
            std::thread::Builder::new()
                .name("remote-flags-refresh".to_owned())
                .spawn(move || {
                    // Waiters are released even when a hook panics.
                    let result = panic::catch_unwind(AssertUnwindSafe(|| inner.run_cycle(threshold)))
                        .unwrap_or_else(|_| {
                            log::error!(target: "remote_flags", "configuration refresh panicked");
                            Err(Error::WorkerPanicked)
                        });
                    *lock(&inner.in_flight) = None;
                    inner.ready.complete(Ok(()));
                    completion.complete(result);
                })?
        };
        *in_flight = Some(completion.clone());

        let mut workers = lock(&self.workers);
        workers.retain(|worker| !worker.is_finished());
        workers.push(worker);

        Ok(completion)
    }

    /// One fetch/cache cycle. Runs on a worker thread, never concurrently with another cycle.
    fn run_cycle(&self, threshold: DateTime<Utc>) -> Result<()> {
        let mut previous = self.store.get_configuration();

        if self.offline.load(Ordering::Acquire) {
            if self.cache.is_none() {
                log::warn!(target: "remote_flags", "cannot refresh in offline mode without a cache");
                return Err(Error::OfflineWithoutCache);
            }
            if let Some(cached) = self.read_cache() {
                self.publish_if_not_older(cached, &previous);
            }
            return Ok(());
        }

        // The cache may be shared with other processes that fetched recently enough.
        if previous.is_empty() {
            if let Some(cached) = self.read_cache() {
                let fresh = cached.fetch_time() >= threshold;
                if self.publish_if_not_older(cached, &previous) {
                    previous = self.store.get_configuration();
                    if fresh {
                        log::debug!(target: "remote_flags", "using configuration from cache");
                        return Ok(());
                    }
                }
            }
        }

        match self.fetcher.fetch(&previous) {
            Ok(FetchOutcome::Fetched(configuration)) => {
                self.publish(configuration, &previous);
                self.write_cache();
                Ok(())
            }
            Ok(FetchOutcome::NotModified) => {
                if !previous.is_empty() {
                    self.store
                        .set_configuration(previous.with_fetch_time(Utc::now()));
                    self.write_cache();
                }
                Ok(())
            }
            Err(err) => {
                log::warn!(target: "remote_flags", "failed to fetch configuration: {err}");
                if let Some(cached) = self.read_cache() {
                    if self.publish_if_not_older(cached, &previous) {
                        log::info!(target: "remote_flags", "using newer configuration from cache");
                        return Ok(());
                    }
                }
                Err(err)
            }
        }
    }

    fn publish(&self, configuration: Configuration, previous: &Configuration) {
        let changed = !configuration.same_content(previous);
        self.store.set_configuration(configuration);
        if changed {
            log::debug!(target: "remote_flags", "configuration changed");
            if let Some(hook) = &self.on_config_changed {
                hook(&self.store.get_configuration());
            }
        }
    }

    /// Publish `cached` unless it is older than what is held. An entry of the same age with the
    /// same content is the held configuration itself and does not count. Returns `true` if
    /// published.
    fn publish_if_not_older(&self, cached: Configuration, previous: &Configuration) -> bool {
        let held_since = previous.fetch_time();
        if cached.fetch_time() < held_since
            || (cached.fetch_time() == held_since && cached.same_content(previous))
        {
            log::debug!(target: "remote_flags", "cached configuration is not newer than the held one");
            return false;
        }
        self.publish(cached, previous);
        true
    }

    /// Read and parse the cache entry. Failures are logged and treated as a miss.
    fn read_cache(&self) -> Option<Configuration> {
        let cache = self.cache.as_ref()?;
        let entry = match cache.get(&self.cache_key) {
            Ok(entry) => entry?,
            Err(err) => {
                log::warn!(target: "remote_flags", "{err}");
                return None;
            }
        };
        match parse_entry(&entry) {
            Ok(configuration) => Some(configuration),
            Err(err) => {
                log::warn!(target: "remote_flags", "{err}");
                None
            }
        }
    }

    fn write_cache(&self) {
        let Some(cache) = &self.cache else {
            return;
        };
        let entry = serialize_entry(&self.store.get_configuration());
        if let Err(err) = cache.set(&self.cache_key, &entry) {
            log::warn!(target: "remote_flags", "{err}");
        }
    }
}
