//! Time- and size-bounded key/value cache.
//!
//! Structure: IndexMap<String, CacheEntry> + TimerQueue<String>
//! - IndexMap keeps insertion order, so the oldest entry is always index 0
//! - every stored entry owns exactly one pending expiry timer
//!
//! Expiry is by *idle* time: `get()` reschedules the entry's timer, so reads
//! keep an entry alive. Size is bounded by a FIFO rule: when the serialized
//! size is at or above the ceiling before an insert, the single oldest entry
//! is evicted first (not LRU).
//!
//! Timers fire when the owner calls [`BoundedCache::tick`]; every other
//! operation also retires due timers first, so an expired entry is never
//! observable even if the host ticks late.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use indexmap::IndexMap;
use log::{debug, trace, warn};
use serde::{Serialize, Serializer};
use serde_json::{Map, Value};

use super::clock::Clock;
use super::timers::{TimerId, TimerQueue};

/// Default time-to-idle: 1 hour
pub const DEFAULT_TTL: Duration = Duration::from_millis(3_600_000);

/// Default size ceiling in KB (2 MB)
pub const DEFAULT_LIMIT_KB: f64 = 2000.0;

/// Entry fields that metadata may not override
const RESERVED_KEYS: [&str; 3] = ["id", "data", "duration"];

fn duration_as_millis<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}

/// Single cached record. `get()` hands out clones of this.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheEntry {
    pub id: String,
    /// Payload; `None` for placeholders such as in-flight requests
    pub data: Option<Value>,
    #[serde(serialize_with = "duration_as_millis")]
    pub duration: Duration,
    /// Extra caller fields, serialized alongside the entry
    #[serde(flatten)]
    pub metadata: Map<String, Value>,
    #[serde(skip)]
    timer: Option<TimerId>,
    #[serde(skip)]
    size_bytes: usize,
}

impl CacheEntry {
    pub fn meta(&self, key: &str) -> Option<&Value> {
        self.metadata.get(key)
    }

    pub fn meta_bool(&self, key: &str) -> bool {
        self.metadata.get(key).and_then(Value::as_bool).unwrap_or(false)
    }

    /// Serialized size as counted by [`BoundedCache::size_kb`]
    fn measure(&self) -> usize {
        // Brackets, commas and quotes are not counted
        serde_json::to_string(self)
            .map(|s| s.chars().filter(|c| !matches!(c, '[' | ']' | ',' | '"')).count())
            .unwrap_or(0)
    }
}

/// Cache statistics for monitoring
#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    expired: AtomicU64,
    evicted: AtomicU64,
}

impl CacheStats {
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Entries removed by their idle timer
    pub fn expired(&self) -> u64 {
        self.expired.load(Ordering::Relaxed)
    }

    /// Entries removed by the size bound
    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }

    pub fn hit_rate(&self) -> f64 {
        let total = self.hits() + self.misses();
        if total == 0 { 0.0 } else { self.hits() as f64 / total as f64 }
    }
}

struct Store {
    entries: IndexMap<String, CacheEntry>,
    timers: TimerQueue<String>,
    /// Sum of CacheEntry::measure() over all entries
    total_bytes: usize,
}

impl Store {
    fn take(&mut self, id: &str) -> Option<CacheEntry> {
        let entry = self.entries.shift_remove(id)?;
        if let Some(timer) = entry.timer {
            self.timers.cancel(timer);
        }
        self.total_bytes = self.total_bytes.saturating_sub(entry.size_bytes);
        Some(entry)
    }

    fn size_kb(&self) -> f64 {
        (self.total_bytes as f64 / 1024.0 * 100.0).round() / 100.0
    }
}

/// Process-wide TTL + size bounded cache.
///
/// Cloning yields another handle to the same store.
#[derive(Clone)]
pub struct BoundedCache {
    store: Arc<Mutex<Store>>,
    clock: Arc<dyn Clock>,
    stats: Arc<CacheStats>,
    limit_kb: f64,
    default_ttl: Duration,
}

impl fmt::Debug for BoundedCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundedCache")
            .field("len", &self.len())
            .field("limit_kb", &self.limit_kb)
            .field("default_ttl", &self.default_ttl)
            .finish()
    }
}

impl BoundedCache {
    /// Cache with the default 2000 KB ceiling and 1 hour idle TTL
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self::with_limits(clock, DEFAULT_LIMIT_KB, DEFAULT_TTL)
    }

    pub fn with_limits(clock: Arc<dyn Clock>, limit_kb: f64, default_ttl: Duration) -> Self {
        debug!("BoundedCache created: limit={}KB, ttl={}ms", limit_kb, default_ttl.as_millis());
        Self {
            store: Arc::new(Mutex::new(Store {
                entries: IndexMap::new(),
                timers: TimerQueue::new(),
                total_bytes: 0,
            })),
            clock,
            stats: Arc::new(CacheStats::default()),
            limit_kb,
            default_ttl,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Store> {
        self.store.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Retire due timers on an already locked store
    fn expire(&self, store: &mut Store) -> Vec<String> {
        let now = self.clock.now();
        let mut removed = Vec::new();
        for (timer, id) in store.timers.due(now) {
            // Only remove the entry if this timer is still the one it owns
            let owned = store.entries.get(&id).is_some_and(|e| e.timer == Some(timer));
            if owned {
                store.take(&id);
                self.stats.expired.fetch_add(1, Ordering::Relaxed);
                trace!("cache - expired item ({})", id);
                removed.push(id);
            }
        }
        removed
    }

    /// Get an entry and renew its idle timer.
    ///
    /// Returns a snapshot; mutate in place with [`update`](Self::update).
    pub fn get(&self, id: &str) -> Option<CacheEntry> {
        let mut store = self.lock();
        self.expire(&mut store);
        let found = self.renew(&mut store, id);
        match found {
            Some(_) => self.stats.hits.fetch_add(1, Ordering::Relaxed),
            None => self.stats.misses.fetch_add(1, Ordering::Relaxed),
        };
        found
    }

    /// Add an entry.
    ///
    /// `duration` defaults to the cache TTL (1 hour). If the cache is at or over
    /// its size ceiling, the oldest entry is evicted first. An existing entry with
    /// the same id is replaced and moves to the back of the insertion order.
    pub fn add(
        &self,
        id: &str,
        data: Option<Value>,
        metadata: Option<Map<String, Value>>,
        duration: Option<Duration>,
    ) -> CacheEntry {
        let mut store = self.lock();
        self.expire(&mut store);
        self.insert(&mut store, id, data, metadata.unwrap_or_default(), duration)
    }

    /// Atomically get an existing entry (renewing it) or insert a placeholder.
    ///
    /// Returns (entry, was_inserted). The placeholder has no data, the given
    /// metadata and the default duration. Prevents two callers from both
    /// missing and both inserting.
    pub fn get_or_insert(&self, id: &str, metadata: Map<String, Value>) -> (CacheEntry, bool) {
        let mut store = self.lock();
        self.expire(&mut store);
        if let Some(entry) = self.renew(&mut store, id) {
            self.stats.hits.fetch_add(1, Ordering::Relaxed);
            return (entry, false);
        }
        self.stats.misses.fetch_add(1, Ordering::Relaxed);
        (self.insert(&mut store, id, None, metadata, None), true)
    }

    /// Restart the idle timer of `id`
    fn renew(&self, store: &mut Store, id: &str) -> Option<CacheEntry> {
        let now = self.clock.now();
        let entry = store.entries.get_mut(id)?;
        if let Some(old) = entry.timer.take() {
            store.timers.cancel(old);
        }
        entry.timer = Some(store.timers.schedule(entry.id.clone(), now, entry.duration));
        Some(entry.clone())
    }

    fn insert(
        &self,
        store: &mut Store,
        id: &str,
        data: Option<Value>,
        mut metadata: Map<String, Value>,
        duration: Option<Duration>,
    ) -> CacheEntry {
        if store.take(id).is_some() {
            debug!("cache - replacing item ({})", id);
        }

        if store.size_kb() >= self.limit_kb {
            if let Some(oldest) = store.entries.get_index(0).map(|(k, _)| k.clone()) {
                warn!("Cache limit exceeded ({}KB), removing first object ({})", store.size_kb(), oldest);
                store.take(&oldest);
                self.stats.evicted.fetch_add(1, Ordering::Relaxed);
            }
        }

        metadata.retain(|k, _| !RESERVED_KEYS.contains(&k.as_str()));

        let duration = duration.unwrap_or(self.default_ttl);
        let timer = store.timers.schedule(id.to_string(), self.clock.now(), duration);
        let mut entry = CacheEntry {
            id: id.to_string(),
            data,
            duration,
            metadata,
            timer: Some(timer),
            size_bytes: 0,
        };
        entry.size_bytes = entry.measure();
        store.total_bytes += entry.size_bytes;
        store.entries.insert(id.to_string(), entry.clone());

        trace!("cache - added item ({}, {} bytes, {}ms)", id, entry.size_bytes, duration.as_millis());
        entry
    }

    /// Mutate an entry in place without renewing its timer.
    ///
    /// Returns false if the entry is absent.
    pub fn update<F>(&self, id: &str, f: F) -> bool
    where
        F: FnOnce(&mut CacheEntry),
    {
        let mut store = self.lock();
        self.expire(&mut store);

        let store = &mut *store;
        let Some(entry) = store.entries.get_mut(id) else {
            return false;
        };
        f(entry);
        // id, timer and duration are owned by the cache
        entry.id = id.to_string();
        entry.metadata.retain(|k, _| !RESERVED_KEYS.contains(&k.as_str()));

        let old = entry.size_bytes;
        entry.size_bytes = entry.measure();
        store.total_bytes = store.total_bytes.saturating_sub(old) + entry.size_bytes;
        true
    }

    /// Cancel the entry's timer and delete it. Unknown ids are ignored.
    pub fn remove(&self, id: &str) {
        let mut store = self.lock();
        self.expire(&mut store);
        if store.take(id).is_some() {
            trace!("cache - removed item ({})", id);
        }
    }

    /// Remove one entry, or everything when `id` is `None`
    pub fn empty(&self, id: Option<&str>) {
        match id {
            Some(id) => self.remove(id),
            None => {
                let mut store = self.lock();
                store.timers.clear();
                store.entries.clear();
                store.total_bytes = 0;
                debug!("cache - emptied");
            }
        }
    }

    /// Fire due expiry timers. Returns the ids that expired.
    pub fn tick(&self) -> Vec<String> {
        let mut store = self.lock();
        self.expire(&mut store)
    }

    /// Approximate serialized size in KB, two decimals
    pub fn size_kb(&self) -> f64 {
        let mut store = self.lock();
        self.expire(&mut store);
        store.size_kb()
    }

    /// Presence check that does not renew the timer
    pub fn contains(&self, id: &str) -> bool {
        let mut store = self.lock();
        self.expire(&mut store);
        store.entries.contains_key(id)
    }

    pub fn len(&self) -> usize {
        let mut store = self.lock();
        self.expire(&mut store);
        store.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Entry ids in insertion order (debugging)
    pub fn ids(&self) -> Vec<String> {
        let mut store = self.lock();
        self.expire(&mut store);
        store.entries.keys().cloned().collect()
    }

    /// Number of live expiry timers; always equals `len()`
    pub fn pending_timers(&self) -> usize {
        let mut store = self.lock();
        self.expire(&mut store);
        store.timers.len()
    }

    pub fn stats(&self) -> Arc<CacheStats> {
        Arc::clone(&self.stats)
    }

    pub fn limit_kb(&self) -> f64 {
        self.limit_kb
    }
}
