//! Two-tier document cache
//!
//! Holds raw document sources fetched by the viewer:
//! - the **persistent** tier survives restarts, is written through to a
//!   [`KeyValueStore`] on every change, and expires entries after a TTL
//! - the **preload** tier lives only in memory and is filled by background
//!   prefetching
//!
//! A third structure, the in-flight set, records paths whose prefetch is
//! running. [`DocumentCache::mark_in_flight`] is the only gate that lets a
//! fetch start, so two fetches for one path never overlap.
//!
//! # Error Handling
//!
//! Every operation here is best-effort. Store write failures are logged and
//! the in-memory state is kept; a corrupt persisted layout is discarded on
//! open. Nothing in this module returns an error to the caller.

mod admin;
mod clock;
mod sweep;

pub use admin::{CacheReport, EntryReport, Tier};
pub use clock::{Clock, ManualClock, SystemClock};
pub use sweep::spawn_expiry_sweep;

use crate::store::chunked::{self, LoadOutcome};
use crate::store::KeyValueStore;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

/// Default time-to-live for persistent entries (10 minutes).
pub const DEFAULT_TTL_MS: i64 = 10 * 60 * 1000;

/// A persisted document body and the moment it was stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub content: String,
    /// Epoch milliseconds
    pub timestamp: i64,
}

impl CacheEntry {
    /// Milliseconds since the entry was stored, saturating on extreme timestamps.
    pub fn age_ms(&self, now: i64) -> i64 {
        now.saturating_sub(self.timestamp)
    }
}

/// Persistent tier contents keyed by document path.
pub type Entries = BTreeMap<String, CacheEntry>;

/// Process-wide tier toggles, persisted under `cache_options`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheOptions {
    #[serde(default)]
    pub disable_persistent: bool,
    #[serde(default)]
    pub disable_preload: bool,
}

/// Tunables for a cache instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheSettings {
    pub ttl_ms: i64,
    pub chunk_size: usize,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            ttl_ms: DEFAULT_TTL_MS,
            chunk_size: chunked::DEFAULT_CHUNK_SIZE,
        }
    }
}

#[derive(Debug, Default)]
struct CacheState {
    persistent: Entries,
    preload: HashMap<String, String>,
    in_flight: HashSet<String>,
    options: CacheOptions,
    tier_generation: u64,
    options_generation: u64,
}

/// Generations most recently handed to the store.
#[derive(Debug, Default)]
struct Written {
    tier: u64,
    options: u64,
}

/// The cache service. Construct one per viewer session and share it via `Arc`.
///
/// Store writes happen after the state lock is released, so a blocking
/// store such as [`crate::store::DirStore`] never stalls readers. Writes are
/// ordered by generation; a stale snapshot is never written over a newer one.
pub struct DocumentCache {
    state: Mutex<CacheState>,
    written: Mutex<Written>,
    store: Box<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    settings: CacheSettings,
}

impl std::fmt::Debug for DocumentCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentCache")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl DocumentCache {
    /// Open a cache over `store` using the system clock.
    pub fn open(store: impl KeyValueStore + 'static, settings: CacheSettings) -> Self {
        Self::open_with_clock(store, settings, Arc::new(SystemClock))
    }

    /// Open a cache with an explicit clock.
    ///
    /// Loads options and the persisted tier, then runs one expiry sweep. A
    /// persisted tier that cannot be reassembled is dropped and its keys are
    /// cleared from the store.
    pub fn open_with_clock(
        store: impl KeyValueStore + 'static,
        settings: CacheSettings,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let store: Box<dyn KeyValueStore> = Box::new(store);
        let options = chunked::load_options(store.as_ref());

        let persistent = if options.disable_persistent {
            Entries::new()
        } else {
            match chunked::load(store.as_ref()) {
                LoadOutcome::Loaded(entries) => entries,
                LoadOutcome::Empty => Entries::new(),
                LoadOutcome::Corrupt(err) => {
                    tracing::warn!("discarding unreadable persistent cache: {err}");
                    if let Err(err) = chunked::clear(store.as_ref()) {
                        tracing::warn!("failed to clear persistent cache keys: {err}");
                    }
                    Entries::new()
                }
            }
        };

        let cache = Self {
            state: Mutex::new(CacheState {
                persistent,
                options,
                ..CacheState::default()
            }),
            written: Mutex::new(Written::default()),
            store,
            clock,
            settings,
        };
        cache.clear_expired();
        cache
    }

    fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn written(&self) -> MutexGuard<'_, Written> {
        self.written.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn is_expired(&self, entry: &CacheEntry, now: i64) -> bool {
        entry.age_ms(now) >= self.settings.ttl_ms
    }

    /// Write the persistent tier through to the store.
    ///
    /// Serializes under the state lock and releases it before any store I/O.
    fn persist(&self, mut state: MutexGuard<'_, CacheState>) {
        state.tier_generation += 1;
        let generation = state.tier_generation;
        let encoded = chunked::encode(&state.persistent);
        drop(state);

        let mut written = self.written();
        if written.tier >= generation {
            return;
        }
        written.tier = generation;
        let result = encoded.and_then(|encoded| {
            chunked::write(self.store.as_ref(), &encoded, self.settings.chunk_size)
        });
        if let Err(err) = result {
            tracing::warn!("failed to persist document cache: {err}");
        }
    }

    fn persist_options(&self, options: CacheOptions, generation: u64) {
        let mut written = self.written();
        if written.options >= generation {
            return;
        }
        written.options = generation;
        if let Err(err) = chunked::save_options(self.store.as_ref(), &options) {
            tracing::warn!("failed to persist cache options: {err}");
        }
    }

    /// Content for `path` from the preload tier, else a live persistent entry.
    ///
    /// An expired persistent entry is deleted on the way out.
    pub fn lookup(&self, path: &str) -> Option<String> {
        let mut state = self.lock();
        if !state.options.disable_preload {
            if let Some(content) = state.preload.get(path) {
                return Some(content.clone());
            }
        }
        if state.options.disable_persistent {
            return None;
        }

        let now = self.clock.now_millis();
        match state.persistent.get(path) {
            None => return None,
            Some(entry) if !self.is_expired(entry, now) => return Some(entry.content.clone()),
            Some(_) => {}
        }

        state.persistent.remove(path);
        tracing::debug!(path, "persistent entry expired on lookup");
        self.persist(state);
        None
    }

    /// Upsert `path` into the persistent tier with a fresh timestamp.
    pub fn store_persistent(&self, path: &str, content: impl Into<String>) {
        let mut state = self.lock();
        if state.options.disable_persistent {
            return;
        }
        let timestamp = self.clock.now_millis();
        state.persistent.insert(
            path.to_string(),
            CacheEntry {
                content: content.into(),
                timestamp,
            },
        );
        self.persist(state);
    }

    /// Record a finished prefetch. Always releases the in-flight mark.
    pub fn store_preload(&self, path: &str, content: impl Into<String>) {
        let mut state = self.lock();
        state.in_flight.remove(path);
        if state.options.disable_preload {
            return;
        }
        state.preload.insert(path.to_string(), content.into());
    }

    /// Claim `path` for fetching.
    ///
    /// Returns `false` without side effects when the path is already in
    /// flight or already held by either tier.
    pub fn mark_in_flight(&self, path: &str) -> bool {
        let mut state = self.lock();
        if state.in_flight.contains(path) || self.holds(&state, path) {
            return false;
        }
        state.in_flight.insert(path.to_string())
    }

    /// Free a path whose fetch failed or was cancelled, so it can be replanned.
    pub fn release_in_flight(&self, path: &str) {
        self.lock().in_flight.remove(path);
    }

    pub fn is_in_flight(&self, path: &str) -> bool {
        self.lock().in_flight.contains(path)
    }

    /// True when a fetch for `path` would be redundant.
    pub fn is_cached_or_in_flight(&self, path: &str) -> bool {
        let state = self.lock();
        state.in_flight.contains(path) || self.holds(&state, path)
    }

    fn holds(&self, state: &CacheState, path: &str) -> bool {
        if state.preload.contains_key(path) {
            return true;
        }
        let now = self.clock.now_millis();
        state
            .persistent
            .get(path)
            .is_some_and(|entry| !self.is_expired(entry, now))
    }

    /// Drop every expired persistent entry. Returns how many were removed.
    pub fn clear_expired(&self) -> usize {
        let mut state = self.lock();
        let now = self.clock.now_millis();
        let before = state.persistent.len();
        let ttl = self.settings.ttl_ms;
        state.persistent.retain(|_, entry| entry.age_ms(now) < ttl);
        let removed = before - state.persistent.len();
        if removed > 0 {
            tracing::info!(removed, "expired persistent cache entries");
            self.persist(state);
        }
        removed
    }

    pub fn options(&self) -> CacheOptions {
        self.lock().options
    }

    /// Update the tier toggles. Disabling a tier empties it immediately.
    pub fn set_options(&self, disable_persistent: bool, disable_preload: bool) {
        let mut state = self.lock();
        let previous = state.options;
        state.options = CacheOptions {
            disable_persistent,
            disable_preload,
        };

        if disable_preload && !previous.disable_preload {
            state.preload.clear();
            tracing::info!("preload cache disabled and cleared");
        }
        state.options_generation += 1;
        let generation = state.options_generation;
        let options = state.options;

        if disable_persistent && !previous.disable_persistent {
            state.persistent.clear();
            tracing::info!("persistent cache disabled and cleared");
            self.persist(state);
        } else {
            drop(state);
        }
        self.persist_options(options, generation);
    }

    /// Remove one path from one tier. Returns whether anything was removed.
    pub fn remove_one(&self, path: &str, tier: Tier) -> bool {
        let mut state = self.lock();
        match tier {
            Tier::Persistent => {
                let removed = state.persistent.remove(path).is_some();
                if removed {
                    self.persist(state);
                }
                removed
            }
            Tier::Preload => state.preload.remove(path).is_some(),
        }
    }

    pub fn clear_tier(&self, tier: Tier) {
        let mut state = self.lock();
        match tier {
            Tier::Persistent => {
                state.persistent.clear();
                self.persist(state);
            }
            Tier::Preload => state.preload.clear(),
        }
    }

    /// Empty both tiers. Running fetches keep their in-flight marks.
    pub fn clear_all(&self) {
        let mut state = self.lock();
        state.preload.clear();
        state.persistent.clear();
        self.persist(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::chunked::{INFO_KEY, OPTIONS_KEY};
    use crate::store::MemoryStore;

    const T0: i64 = 1_700_000_000_000;

    /// Store handle that shares one `MemoryStore` between a test and the cache.
    #[derive(Clone)]
    struct SharedStore(Arc<MemoryStore>);

    impl KeyValueStore for SharedStore {
        fn get(&self, key: &str) -> crate::store::Result<Option<String>> {
            self.0.get(key)
        }
        fn set(&self, key: &str, value: &str) -> crate::store::Result<()> {
            self.0.set(key, value)
        }
        fn remove(&self, key: &str) -> crate::store::Result<()> {
            self.0.remove(key)
        }
        fn keys(&self) -> crate::store::Result<Vec<String>> {
            self.0.keys()
        }
    }

    fn cache_with_clock() -> (DocumentCache, Arc<ManualClock>, SharedStore) {
        let clock = Arc::new(ManualClock::new(T0));
        let store = SharedStore(Arc::new(MemoryStore::new()));
        let cache =
            DocumentCache::open_with_clock(store.clone(), CacheSettings::default(), clock.clone());
        (cache, clock, store)
    }

    #[test]
    fn lookup_prefers_preload_tier() {
        let (cache, _, _) = cache_with_clock();
        cache.store_persistent("a.md", "persistent");
        assert_eq!(cache.lookup("a.md").as_deref(), Some("persistent"));

        cache.store_preload("a.md", "preloaded");
        assert_eq!(cache.lookup("a.md").as_deref(), Some("preloaded"));
        assert_eq!(cache.lookup("missing.md"), None);
    }

    #[test]
    fn expired_entry_is_absent_and_removed_on_lookup() {
        let (cache, clock, store) = cache_with_clock();
        cache.store_persistent("x.md", "hi");
        assert!(store.get(INFO_KEY).unwrap().unwrap().contains("x.md"));

        clock.advance(DEFAULT_TTL_MS - 1);
        assert_eq!(cache.lookup("x.md").as_deref(), Some("hi"));

        clock.advance(1);
        assert_eq!(cache.lookup("x.md"), None);
        assert!(!cache.get_persistent_paths().contains(&"x.md".to_string()));
        assert!(!store.get(INFO_KEY).unwrap().unwrap().contains("x.md"));
    }

    #[test]
    fn restoring_refreshes_timestamp() {
        let (cache, clock, _) = cache_with_clock();
        cache.store_persistent("x.md", "v1");
        clock.advance(DEFAULT_TTL_MS - 10);
        cache.store_persistent("x.md", "v2");
        clock.advance(20);
        assert_eq!(cache.lookup("x.md").as_deref(), Some("v2"));
    }

    #[test]
    fn clear_expired_sweeps_only_stale_entries() {
        let (cache, clock, _) = cache_with_clock();
        cache.store_persistent("old.md", "old");
        clock.advance(DEFAULT_TTL_MS / 2);
        cache.store_persistent("new.md", "new");
        cache.store_preload("pre.md", "pre");

        clock.advance(DEFAULT_TTL_MS / 2);
        assert_eq!(cache.clear_expired(), 1);
        assert_eq!(cache.get_persistent_paths(), vec!["new.md"]);
        // Preload entries never expire.
        assert!(cache.is_preloaded("pre.md"));
        assert_eq!(cache.clear_expired(), 0);
    }

    #[test]
    fn mark_in_flight_deduplicates() {
        let (cache, _, _) = cache_with_clock();
        assert!(cache.mark_in_flight("a.md"));
        assert!(!cache.mark_in_flight("a.md"));
        assert!(cache.is_in_flight("a.md"));

        cache.store_preload("a.md", "body");
        assert!(!cache.is_in_flight("a.md"));
        // Cached now, so still refused.
        assert!(!cache.mark_in_flight("a.md"));

        cache.store_persistent("b.md", "body");
        assert!(!cache.mark_in_flight("b.md"));

        assert!(cache.mark_in_flight("c.md"));
        cache.release_in_flight("c.md");
        assert!(cache.mark_in_flight("c.md"));
    }

    #[test]
    fn expired_persistent_entry_does_not_block_prefetch() {
        let (cache, clock, _) = cache_with_clock();
        cache.store_persistent("a.md", "body");
        clock.advance(DEFAULT_TTL_MS);
        assert!(!cache.is_cached_or_in_flight("a.md"));
        assert!(cache.mark_in_flight("a.md"));
    }

    #[test]
    fn disabling_persistent_cascades_and_blocks_stores() {
        let (cache, _, store) = cache_with_clock();
        cache.store_persistent("a.md", "body");
        cache.store_preload("b.md", "body");

        cache.set_options(true, false);
        assert!(cache.get_persistent_paths().is_empty());
        assert!(cache.is_preloaded("b.md"));
        assert!(store.get(OPTIONS_KEY).unwrap().unwrap().contains("\"disablePersistent\":true"));

        cache.store_persistent("a.md", "again");
        assert_eq!(cache.lookup("a.md"), None);

        cache.set_options(false, false);
        cache.store_persistent("a.md", "again");
        assert_eq!(cache.lookup("a.md").as_deref(), Some("again"));
    }

    #[test]
    fn disabling_preload_cascades_and_blocks_stores() {
        let (cache, _, _) = cache_with_clock();
        cache.store_preload("a.md", "body");
        cache.store_persistent("b.md", "body");

        cache.set_options(false, true);
        assert!(cache.get_preloaded_paths().is_empty());
        assert!(cache.is_cached("b.md"));

        assert!(cache.mark_in_flight("c.md"));
        cache.store_preload("c.md", "body");
        assert!(!cache.is_preloaded("c.md"));
        assert!(!cache.is_in_flight("c.md"));
    }

    #[test]
    fn persistent_tier_and_options_survive_reopen() {
        let (cache, clock, store) = cache_with_clock();
        cache.store_persistent("a.md", "body");
        cache.store_preload("b.md", "body");
        cache.set_options(false, true);
        drop(cache);

        let reopened =
            DocumentCache::open_with_clock(store, CacheSettings::default(), clock.clone());
        assert_eq!(reopened.lookup("a.md").as_deref(), Some("body"));
        assert!(!reopened.is_preloaded("b.md"));
        assert!(reopened.options().disable_preload);
    }

    #[test]
    fn open_sweeps_entries_that_expired_while_closed() {
        let (cache, clock, store) = cache_with_clock();
        cache.store_persistent("a.md", "body");
        drop(cache);

        clock.advance(DEFAULT_TTL_MS + 1);
        let reopened = DocumentCache::open_with_clock(store, CacheSettings::default(), clock);
        assert!(reopened.get_persistent_paths().is_empty());
    }

    #[test]
    fn corrupt_layout_fails_closed() {
        let store = SharedStore(Arc::new(MemoryStore::new()));
        store
            .set(INFO_KEY, r#"{"version":1,"timestamp":1,"chunkCount":2,"paths":["a.md"]}"#)
            .unwrap();
        store.set("cache_chunk_0", r#"{"a.md":{"con"#).unwrap();

        let cache = DocumentCache::open(store.clone(), CacheSettings::default());
        assert!(cache.get_persistent_paths().is_empty());
        assert_eq!(store.get(INFO_KEY).unwrap(), None);
        assert_eq!(store.get("cache_chunk_0").unwrap(), None);
    }

    #[test]
    fn extreme_persisted_timestamps_expire_on_open() {
        let store = SharedStore(Arc::new(MemoryStore::new()));
        store
            .set(INFO_KEY, r#"{"version":1,"timestamp":1,"chunkCount":1,"paths":["x.md"]}"#)
            .unwrap();
        store
            .set(
                "cache_chunk_0",
                r#"{"x.md":{"content":"hi","timestamp":-9223372036854775808}}"#,
            )
            .unwrap();

        let clock = Arc::new(ManualClock::new(T0));
        let cache =
            DocumentCache::open_with_clock(store.clone(), CacheSettings::default(), clock);
        assert_eq!(cache.lookup("x.md"), None);
        assert!(cache.report().entries.is_empty());
        assert!(!store.get(INFO_KEY).unwrap().unwrap().contains("x.md"));
    }

    #[test]
    fn entry_age_saturates() {
        let entry = CacheEntry {
            content: String::new(),
            timestamp: i64::MIN,
        };
        assert_eq!(entry.age_ms(T0), i64::MAX);
        let fresh = CacheEntry {
            content: String::new(),
            timestamp: T0 - 5,
        };
        assert_eq!(fresh.age_ms(T0), 5);
    }

    #[test]
    fn concurrent_writes_leave_the_newest_layout() {
        let (cache, clock, store) = cache_with_clock();
        let cache = Arc::new(cache);
        let writers: Vec<_> = (0..8)
            .map(|t| {
                let cache = Arc::clone(&cache);
                std::thread::spawn(move || {
                    for i in 0..10 {
                        cache.store_persistent(&format!("t{t}/doc{i}.md"), "body");
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.join().unwrap();
        }
        drop(cache);

        let reopened = DocumentCache::open_with_clock(store, CacheSettings::default(), clock);
        assert_eq!(reopened.get_persistent_paths().len(), 80);
    }

    #[test]
    fn write_failure_keeps_memory_state() {
        let clock = Arc::new(ManualClock::new(T0));
        let cache = DocumentCache::open_with_clock(
            MemoryStore::with_value_limit(64),
            CacheSettings {
                ttl_ms: DEFAULT_TTL_MS,
                chunk_size: 1_000,
            },
            clock,
        );
        let body = "x".repeat(500);
        cache.store_persistent("big.md", body.clone());
        assert_eq!(cache.lookup("big.md"), Some(body));
    }

    #[test]
    fn remove_and_clear_primitives() {
        let (cache, _, _) = cache_with_clock();
        cache.store_persistent("a.md", "1");
        cache.store_persistent("b.md", "2");
        cache.store_preload("c.md", "3");

        assert!(cache.remove_one("a.md", Tier::Persistent));
        assert!(!cache.remove_one("a.md", Tier::Persistent));
        assert!(!cache.remove_one("b.md", Tier::Preload));
        assert!(cache.remove_one("c.md", Tier::Preload));

        cache.store_preload("d.md", "4");
        cache.clear_tier(Tier::Preload);
        assert!(cache.get_preloaded_paths().is_empty());
        assert_eq!(cache.get_persistent_paths(), vec!["b.md"]);

        cache.store_preload("e.md", "5");
        assert!(cache.mark_in_flight("f.md"));
        cache.clear_all();
        assert!(cache.get_all_cached_paths().is_empty());
        assert!(cache.is_in_flight("f.md"));
    }
}
