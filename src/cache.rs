//! Answer caches.
//!
//! Two variants share the [`ResolverCache`] contract:
//! - [`Cache`]: unbounded, entries expire by TTL and are purged lazily and by
//!   a background cleaner thread.
//! - [`LruCache`]: bounded, entries expire by TTL (checked on lookup only) and
//!   the least-recently-used entry is evicted under capacity pressure.
//!
//! Each instance guards its state with one mutex, so every call is atomic
//! with respect to the mapping (and, for the LRU variant, the recency list).

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::thread;
use std::time::{Duration, Instant};

use hickory_proto::rr::{DNSClass, Name, RecordType};
use tracing::{debug, warn};

use crate::answer::Answer;

/// Default pause between background cleaning passes.
pub const DEFAULT_CLEANING_INTERVAL: Duration = Duration::from_secs(300);

/// Default capacity of an [`LruCache`].
pub const DEFAULT_MAX_ENTRIES: usize = 100_000;

/// Anything that can sit in a cache: it only has to know when it goes stale.
pub trait Expiring {
    fn expiration(&self) -> Instant;

    fn is_expired_at(&self, now: Instant) -> bool {
        self.expiration() <= now
    }
}

/// Query and cache identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RecordKey {
    pub name: Name,
    pub rtype: RecordType,
    pub rclass: DNSClass,
}

impl RecordKey {
    pub fn new(name: Name, rtype: RecordType, rclass: DNSClass) -> Self {
        Self { name, rtype, rclass }
    }
}

/// Contract shared by both cache variants. A miss is `None`, never an error.
pub trait ResolverCache<V = Answer>: Send + Sync {
    /// Returns the live value for `key`; expired entries are dropped on touch.
    fn get(&self, key: &RecordKey) -> Option<V>;

    /// Inserts or replaces the value for `key`.
    fn put(&self, key: RecordKey, value: V);

    /// Removes one entry, or every entry when `key` is `None`.
    fn flush(&self, key: Option<&RecordKey>);
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // A panic mid-operation can't leave the map half-updated, keep serving.
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct CacheState<V> {
    data: HashMap<RecordKey, V>,
    cleaning_interval: Duration,
    next_cleaning: Instant,
    stats: CacheStats,
}

impl<V: Expiring> CacheState<V> {
    fn purge_expired(&mut self, now: Instant) -> usize {
        let before = self.data.len();
        self.data.retain(|_, v| !v.is_expired_at(now));
        self.next_cleaning = now + self.cleaning_interval;
        before - self.data.len()
    }

    fn maybe_clean(&mut self, now: Instant) {
        if self.cleaning_interval.is_zero() || now < self.next_cleaning {
            return;
        }
        let purged = self.purge_expired(now);
        if purged > 0 {
            debug!(target = "cache", purged, "lazy cleaning pass");
        }
    }
}

/// Unbounded TTL cache with a background cleaner.
///
/// With a non-zero cleaning interval a dedicated thread purges expired
/// entries every interval, and `put` runs a pass whenever one is overdue.
/// With a zero interval there is no cleaner; expired entries are only
/// dropped when looked up.
pub struct Cache<V = Answer> {
    state: Arc<Mutex<CacheState<V>>>,
    cleaner: Option<Cleaner>,
}

impl<V: Expiring + Clone + Send + 'static> Cache<V> {
    pub fn new() -> Self {
        Self::with_cleaning_interval(DEFAULT_CLEANING_INTERVAL)
    }

    pub fn with_cleaning_interval(interval: Duration) -> Self {
        let state = Arc::new(Mutex::new(CacheState {
            data: HashMap::new(),
            cleaning_interval: interval,
            next_cleaning: Instant::now() + interval,
            stats: CacheStats::default(),
        }));
        let cleaner = if interval.is_zero() {
            None
        } else {
            Cleaner::spawn(Arc::downgrade(&state), interval)
        };
        Self { state, cleaner }
    }

    pub fn get(&self, key: &RecordKey) -> Option<V> {
        let now = Instant::now();
        let mut state = lock(&self.state);
        let live = match state.data.get(key) {
            Some(v) if !v.is_expired_at(now) => Some(v.clone()),
            Some(_) => {
                state.data.remove(key);
                None
            }
            None => None,
        };
        match live {
            Some(v) => {
                state.stats.hits += 1;
                Some(v)
            }
            None => {
                state.stats.misses += 1;
                None
            }
        }
    }

    pub fn put(&self, key: RecordKey, value: V) {
        let mut state = lock(&self.state);
        state.maybe_clean(Instant::now());
        state.data.insert(key, value);
    }

    pub fn flush(&self, key: Option<&RecordKey>) {
        let mut state = lock(&self.state);
        match key {
            Some(key) => {
                state.data.remove(key);
            }
            None => {
                state.data.clear();
                state.next_cleaning = Instant::now() + state.cleaning_interval;
            }
        }
    }

    /// Entries currently stored, expired or not.
    pub fn len(&self) -> usize {
        lock(&self.state).data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        lock(&self.state).stats
    }

    pub fn cleaning_interval(&self) -> Duration {
        lock(&self.state).cleaning_interval
    }

    /// Stops the background cleaner and waits for its thread to exit.
    /// Lookups keep dropping expired entries lazily.
    pub fn stop_cleaning(&mut self) {
        self.cleaner.take();
    }
}

impl<V: Expiring + Clone + Send + 'static> Default for Cache<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: Expiring + Clone + Send + 'static> ResolverCache<V> for Cache<V> {
    fn get(&self, key: &RecordKey) -> Option<V> {
        Cache::get(self, key)
    }

    fn put(&self, key: RecordKey, value: V) {
        Cache::put(self, key, value)
    }

    fn flush(&self, key: Option<&RecordKey>) {
        Cache::flush(self, key)
    }
}

/// Periodic purge running on its own thread. Dropping it closes the stop
/// channel, which wakes the thread immediately, then joins it.
struct Cleaner {
    stop: Option<mpsc::Sender<()>>,
    handle: Option<thread::JoinHandle<()>>,
}

impl Cleaner {
    fn spawn<V>(state: Weak<Mutex<CacheState<V>>>, interval: Duration) -> Option<Self>
    where
        V: Expiring + Send + 'static,
    {
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let spawned = thread::Builder::new()
            .name("cache-cleaner".into())
            .spawn(move || run_cleaner(state, stop_rx, interval));
        match spawned {
            Ok(handle) => Some(Self {
                stop: Some(stop_tx),
                handle: Some(handle),
            }),
            Err(err) => {
                warn!(target = "cache", error = %err, "failed to start cache cleaner, expiring lazily only");
                None
            }
        }
    }
}

impl Drop for Cleaner {
    fn drop(&mut self) {
        drop(self.stop.take());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn run_cleaner<V: Expiring>(
    state: Weak<Mutex<CacheState<V>>>,
    stop: mpsc::Receiver<()>,
    interval: Duration,
) {
    loop {
        match stop.recv_timeout(interval) {
            Err(RecvTimeoutError::Timeout) => {}
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }
        let Some(state) = state.upgrade() else {
            break;
        };
        let purged = lock(&state).purge_expired(Instant::now());
        if purged > 0 {
            debug!(target = "cache", purged, "background cleaning pass");
        }
    }
}

/// `lru::LruCache` needs at least one slot; a zero capacity is enforced in `put`.
fn slots(max_size: usize) -> NonZeroUsize {
    NonZeroUsize::new(max_size).unwrap_or(NonZeroUsize::MIN)
}

struct LruState<V> {
    entries: lru::LruCache<RecordKey, V>,
    stats: CacheStats,
}

/// Bounded TTL cache with least-recently-used eviction.
///
/// There is no background cleaning: an expired entry keeps its slot (and
/// its place in the recency order) until it is looked up or evicted.
/// A capacity of zero stores nothing.
pub struct LruCache<V = Answer> {
    state: Mutex<LruState<V>>,
    max_size: usize,
}

impl<V: Expiring + Clone + Send> LruCache<V> {
    pub fn new(max_size: usize) -> Self {
        Self {
            state: Mutex::new(LruState {
                entries: lru::LruCache::new(slots(max_size)),
                stats: CacheStats::default(),
            }),
            max_size,
        }
    }

    /// Changes the capacity, evicting least-recently-used entries if it shrinks.
    pub fn set_max_size(&mut self, max_size: usize) {
        let mut state = lock(&self.state);
        state.entries.resize(slots(max_size));
        if max_size == 0 {
            state.entries.clear();
        }
        drop(state);
        self.max_size = max_size;
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn get(&self, key: &RecordKey) -> Option<V> {
        let now = Instant::now();
        let mut state = lock(&self.state);
        // `get` promotes the entry to most-recently-used.
        let live = match state.entries.get(key) {
            Some(v) if !v.is_expired_at(now) => Some(v.clone()),
            Some(_) => {
                state.entries.pop(key);
                None
            }
            None => None,
        };
        match live {
            Some(v) => {
                state.stats.hits += 1;
                Some(v)
            }
            None => {
                state.stats.misses += 1;
                None
            }
        }
    }

    pub fn put(&self, key: RecordKey, value: V) {
        if self.max_size == 0 {
            return;
        }
        let mut state = lock(&self.state);
        if let Some((evicted, _)) = state.entries.push(key.clone(), value) {
            if evicted != key {
                debug!(target = "cache", name = %evicted.name, rtype = %evicted.rtype, "lru eviction");
            }
        }
    }

    pub fn flush(&self, key: Option<&RecordKey>) {
        let mut state = lock(&self.state);
        match key {
            Some(key) => {
                state.entries.pop(key);
            }
            None => state.entries.clear(),
        }
    }

    pub fn len(&self) -> usize {
        lock(&self.state).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        lock(&self.state).stats
    }
}

impl<V: Expiring + Clone + Send> Default for LruCache<V> {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ENTRIES)
    }
}

impl<V: Expiring + Clone + Send> ResolverCache<V> for LruCache<V> {
    fn get(&self, key: &RecordKey) -> Option<V> {
        LruCache::get(self, key)
    }

    fn put(&self, key: RecordKey, value: V) {
        LruCache::put(self, key, value)
    }

    fn flush(&self, key: Option<&RecordKey>) {
        LruCache::flush(self, key)
    }
}
