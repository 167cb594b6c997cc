//! Administration surface: enumeration, targeted eviction, reporting.

use super::DocumentCache;
use serde::Serialize;
use std::collections::BTreeSet;

/// Which cache tier an administrative call targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    /// TTL-bounded tier written through to the store
    Persistent,
    /// In-memory tier filled by background prefetch
    Preload,
}

impl Tier {
    /// Get human-readable label for the tier
    pub fn label(&self) -> &'static str {
        match self {
            Tier::Persistent => "Persistent",
            Tier::Preload => "Preload",
        }
    }

    /// Get description for the tier
    pub fn description(&self) -> &'static str {
        match self {
            Tier::Persistent => "documents you opened, kept for the TTL",
            Tier::Preload => "neighbouring documents fetched in the background",
        }
    }

    /// Get all tiers in display order
    pub fn all() -> [Tier; 2] {
        [Tier::Persistent, Tier::Preload]
    }
}

/// One cached document as shown to an administrator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntryReport {
    pub path: String,
    pub tier: Tier,
    pub bytes: usize,
    /// Milliseconds since the entry was stored; preload entries carry none.
    pub age_ms: Option<i64>,
}

/// Snapshot of both tiers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheReport {
    pub entries: Vec<EntryReport>,
    pub in_flight: Vec<String>,
}

impl CacheReport {
    pub fn count(&self, tier: Tier) -> usize {
        self.entries.iter().filter(|e| e.tier == tier).count()
    }

    pub fn bytes(&self, tier: Tier) -> usize {
        self.entries
            .iter()
            .filter(|e| e.tier == tier)
            .map(|e| e.bytes)
            .sum()
    }
}

impl DocumentCache {
    /// Paths held by either tier, sorted and deduplicated.
    pub fn get_all_cached_paths(&self) -> Vec<String> {
        let mut all: BTreeSet<String> = self.get_persistent_paths().into_iter().collect();
        all.extend(self.get_preloaded_paths());
        all.into_iter().collect()
    }

    /// Live (unexpired) persistent paths, sorted.
    pub fn get_persistent_paths(&self) -> Vec<String> {
        let state = self.lock();
        let now = self.clock.now_millis();
        state
            .persistent
            .iter()
            .filter(|(_, entry)| !self.is_expired(entry, now))
            .map(|(path, _)| path.clone())
            .collect()
    }

    pub fn get_preloaded_paths(&self) -> Vec<String> {
        let state = self.lock();
        let mut paths: Vec<String> = state.preload.keys().cloned().collect();
        paths.sort();
        paths
    }

    /// True when the persistent tier holds a live entry for `path`.
    pub fn is_cached(&self, path: &str) -> bool {
        let state = self.lock();
        let now = self.clock.now_millis();
        state
            .persistent
            .get(path)
            .is_some_and(|entry| !self.is_expired(entry, now))
    }

    pub fn is_preloaded(&self, path: &str) -> bool {
        self.lock().preload.contains_key(path)
    }

    pub fn remove_from_persistent(&self, path: &str) -> bool {
        self.remove_one(path, Tier::Persistent)
    }

    pub fn remove_from_preload(&self, path: &str) -> bool {
        self.remove_one(path, Tier::Preload)
    }

    pub fn clear_persistent(&self) {
        self.clear_tier(Tier::Persistent);
    }

    pub fn clear_preload(&self) {
        self.clear_tier(Tier::Preload);
    }

    pub fn report(&self) -> CacheReport {
        let state = self.lock();
        let now = self.clock.now_millis();

        let mut entries: Vec<EntryReport> = state
            .persistent
            .iter()
            .filter(|(_, entry)| !self.is_expired(entry, now))
            .map(|(path, entry)| EntryReport {
                path: path.clone(),
                tier: Tier::Persistent,
                bytes: entry.content.len(),
                age_ms: Some(entry.age_ms(now)),
            })
            .collect();

        let mut preloaded: Vec<EntryReport> = state
            .preload
            .iter()
            .map(|(path, content)| EntryReport {
                path: path.clone(),
                tier: Tier::Preload,
                bytes: content.len(),
                age_ms: None,
            })
            .collect();
        preloaded.sort_by(|a, b| a.path.cmp(&b.path));
        entries.extend(preloaded);

        let mut in_flight: Vec<String> = state.in_flight.iter().cloned().collect();
        in_flight.sort();

        CacheReport { entries, in_flight }
    }
}
