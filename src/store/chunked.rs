//! Chunked persistence of the persistent cache tier
//!
//! The whole tier is serialized to one JSON string on every change, split
//! into fixed-size chunks, and written as:
//!
//! ```text
//! cache_info      = { version, timestamp, chunkSize, chunkCount, paths[] }
//! cache_chunk_0.. = successive substrings of the serialized map
//! cache_options   = { disablePersistent, disablePreload }
//! ```
//!
//! Write order is: delete old chunks, write the header, write new chunks.
//! A crash between the header and the last chunk leaves a header pointing
//! at chunks that do not exist; [`load`] reports that as
//! [`LoadOutcome::Corrupt`] and the cache starts empty.

use super::{KeyValueStore, StoreError};
use crate::cache::{CacheOptions, Entries};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

pub const INFO_KEY: &str = "cache_info";
pub const CHUNK_KEY_PREFIX: &str = "cache_chunk_";
pub const OPTIONS_KEY: &str = "cache_options";

/// Current header layout version.
pub const FORMAT_VERSION: u32 = 1;

/// Characters per chunk, sized under common per-key storage ceilings.
pub const DEFAULT_CHUNK_SIZE: usize = 500_000;

/// Errors while writing or reassembling the chunked layout.
#[derive(Debug, thiserror::Error)]
pub enum ChunkError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("chunk {index} of {count} is missing")]
    MissingChunk { index: usize, count: usize },

    #[error("unsupported chunk layout version: supported {supported}, found {found}")]
    UnsupportedVersion { supported: u32, found: u32 },
}

/// The `cache_info` record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkHeader {
    /// Headers written before versioning carry no version and read as 1.
    #[serde(default = "legacy_version")]
    pub version: u32,
    pub timestamp: i64,
    #[serde(default)]
    pub chunk_size: Option<usize>,
    pub chunk_count: usize,
    #[serde(default)]
    pub paths: Vec<String>,
}

fn legacy_version() -> u32 {
    1
}

/// Result of reading the persisted tier.
#[derive(Debug)]
pub enum LoadOutcome {
    /// No header was ever written.
    Empty,
    Loaded(Entries),
    /// The layout exists but cannot be trusted.
    Corrupt(ChunkError),
}

pub fn chunk_key(index: usize) -> String {
    format!("{CHUNK_KEY_PREFIX}{index}")
}

/// Split `data` into pieces of at most `chunk_size` characters.
///
/// Splits land on character boundaries so every chunk is valid UTF-8.
pub fn split_chunks(data: &str, chunk_size: usize) -> Vec<&str> {
    let chunk_size = chunk_size.max(1);
    let mut chunks = Vec::new();
    let mut start = 0;
    let mut chars = 0;
    for (offset, _) in data.char_indices() {
        if chars == chunk_size {
            chunks.push(&data[start..offset]);
            start = offset;
            chars = 0;
        }
        chars += 1;
    }
    if start < data.len() {
        chunks.push(&data[start..]);
    }
    chunks
}

/// A serialized tier waiting to be written with [`write`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedTier {
    serialized: String,
    paths: Vec<String>,
}

/// Serialize `entries` without touching any store.
pub fn encode(entries: &Entries) -> Result<EncodedTier, ChunkError> {
    Ok(EncodedTier {
        serialized: serde_json::to_string(entries)?,
        paths: entries.keys().cloned().collect(),
    })
}

/// Replace whatever layout the store held with `encoded`.
///
/// Returns the number of chunks written.
pub fn write(
    store: &dyn KeyValueStore,
    encoded: &EncodedTier,
    chunk_size: usize,
) -> Result<usize, ChunkError> {
    let chunks = split_chunks(&encoded.serialized, chunk_size);

    remove_chunks(store)?;

    let header = ChunkHeader {
        version: FORMAT_VERSION,
        timestamp: Utc::now().timestamp_millis(),
        chunk_size: Some(chunk_size.max(1)),
        chunk_count: chunks.len(),
        paths: encoded.paths.clone(),
    };
    store.set(INFO_KEY, &serde_json::to_string(&header)?)?;

    for (index, chunk) in chunks.iter().enumerate() {
        store.set(&chunk_key(index), chunk)?;
    }

    tracing::debug!(
        entries = encoded.paths.len(),
        chunks = chunks.len(),
        chars = encoded.serialized.chars().count(),
        "persisted cache tier"
    );
    Ok(chunks.len())
}

/// Serialize `entries` and replace whatever layout the store held before.
pub fn save(
    store: &dyn KeyValueStore,
    entries: &Entries,
    chunk_size: usize,
) -> Result<usize, ChunkError> {
    write(store, &encode(entries)?, chunk_size)
}

/// Read and reassemble the persisted tier.
pub fn load(store: &dyn KeyValueStore) -> LoadOutcome {
    match try_load(store) {
        Ok(Some(entries)) => LoadOutcome::Loaded(entries),
        Ok(None) => LoadOutcome::Empty,
        Err(err) => LoadOutcome::Corrupt(err),
    }
}

fn try_load(store: &dyn KeyValueStore) -> Result<Option<Entries>, ChunkError> {
    let Some(raw_header) = store.get(INFO_KEY)? else {
        return Ok(None);
    };
    let header: ChunkHeader = serde_json::from_str(&raw_header)?;
    if header.version > FORMAT_VERSION {
        return Err(ChunkError::UnsupportedVersion {
            supported: FORMAT_VERSION,
            found: header.version,
        });
    }
    if header.chunk_count == 0 {
        return Ok(Some(Entries::new()));
    }

    let mut serialized = String::new();
    for index in 0..header.chunk_count {
        let chunk = store
            .get(&chunk_key(index))?
            .ok_or(ChunkError::MissingChunk {
                index,
                count: header.chunk_count,
            })?;
        serialized.push_str(&chunk);
    }

    let entries: Entries = serde_json::from_str(&serialized)?;
    if entries.len() != header.paths.len() {
        tracing::debug!(
            header_paths = header.paths.len(),
            entries = entries.len(),
            "cache header path list disagrees with chunk contents"
        );
    }
    Ok(Some(entries))
}

/// Delete the header and every chunk key.
pub fn clear(store: &dyn KeyValueStore) -> Result<(), StoreError> {
    remove_chunks(store)?;
    store.remove(INFO_KEY)
}

/// Delete chunks named by the current header plus any stray `cache_chunk_*` keys.
fn remove_chunks(store: &dyn KeyValueStore) -> Result<(), StoreError> {
    let mut stale: BTreeSet<String> = store
        .keys()?
        .into_iter()
        .filter(|key| key.starts_with(CHUNK_KEY_PREFIX))
        .collect();

    let previous_count = store
        .get(INFO_KEY)?
        .and_then(|raw| serde_json::from_str::<ChunkHeader>(&raw).ok())
        .map(|header| header.chunk_count)
        .unwrap_or(0);
    stale.extend((0..previous_count).map(chunk_key));

    for key in stale {
        store.remove(&key)?;
    }
    Ok(())
}

/// Read persisted options, falling back to defaults when absent or unreadable.
pub fn load_options(store: &dyn KeyValueStore) -> CacheOptions {
    match store.get(OPTIONS_KEY) {
        Ok(Some(raw)) => serde_json::from_str(&raw).unwrap_or_else(|err| {
            tracing::warn!("ignoring unreadable cache options: {err}");
            CacheOptions::default()
        }),
        Ok(None) => CacheOptions::default(),
        Err(err) => {
            tracing::warn!("failed to read cache options: {err}");
            CacheOptions::default()
        }
    }
}

pub fn save_options(store: &dyn KeyValueStore, options: &CacheOptions) -> Result<(), ChunkError> {
    store.set(OPTIONS_KEY, &serde_json::to_string(options)?)?;
    Ok(())
}
