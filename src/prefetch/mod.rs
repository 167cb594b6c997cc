//! Prefetch planning and background preloading
//!
//! When the reader finishes loading a document, the viewer asks for its
//! neighbours: sibling files in the same folder, the folder's index, and the
//! index documents of sibling folders. Planning is pure; execution marks each
//! planned path in flight and fetches them concurrently on one tokio task.
//!
//! Preloading is best-effort. A failed fetch frees its path for a later plan
//! and is only logged.

mod fetch;

pub use fetch::{fetcher_for_root, is_remote_root, join_url, FileFetcher, Fetcher, HttpFetcher};

use crate::cache::DocumentCache;
use crate::tree::DocumentTree;
use futures::future::join_all;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Default number of neighbours preloaded after a document loads.
pub const DEFAULT_MAX_AUTO_PRELOAD: usize = 3;

/// Paths worth fetching around `current`, in discovery order, at most `max_count`.
///
/// Discovery order is: sibling files, then the parent folder's index, then
/// the index documents of sibling folders, each in declared order. Anything
/// already cached or in flight is skipped. A document without a parent
/// folder (the root, or an unknown path) yields an empty plan.
pub fn plan_around_current(
    current: &str,
    tree: &DocumentTree,
    cache: &DocumentCache,
    max_count: usize,
) -> Vec<String> {
    let Some(located) = tree.find_node_and_parent(current) else {
        tracing::debug!(current, "no tree node for current document; nothing to plan");
        return Vec::new();
    };
    let Some(parent) = located.parent else {
        return Vec::new();
    };

    let siblings: Vec<_> = tree.children_of(parent).collect();
    let mut candidates: Vec<&str> = Vec::new();

    for sibling in &siblings {
        if sibling.is_leaf() {
            if let Some(path) = sibling.path.as_deref() {
                if path != current {
                    candidates.push(path);
                }
            }
        }
    }
    if let Some(index) = parent.index_path() {
        if index != current {
            candidates.push(index);
        }
    }
    for sibling in &siblings {
        if sibling.is_folder() && !sibling.matches(current) {
            if let Some(index) = sibling.index_path() {
                candidates.push(index);
            }
        }
    }

    filter_and_truncate(candidates, cache, Some(max_count))
}

/// Every document in the tree not yet cached or in flight, optionally bounded.
pub fn plan_all(tree: &DocumentTree, cache: &DocumentCache, max_count: Option<usize>) -> Vec<String> {
    let paths = tree.collect_all_paths();
    filter_and_truncate(paths.iter().map(String::as_str), cache, max_count)
}

fn filter_and_truncate<'a>(
    candidates: impl IntoIterator<Item = &'a str>,
    cache: &DocumentCache,
    max_count: Option<usize>,
) -> Vec<String> {
    let limit = max_count.unwrap_or(usize::MAX);
    let mut seen = HashSet::new();
    candidates
        .into_iter()
        .filter(|path| seen.insert(*path))
        .filter(|path| !cache.is_cached_or_in_flight(path))
        .take(limit)
        .map(str::to_string)
        .collect()
}

/// What happened to each path of one prefetch dispatch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PrefetchReport {
    pub fetched: Vec<String>,
    pub failed: Vec<String>,
    pub cancelled: Vec<String>,
}

enum FetchOutcome {
    Fetched(String),
    Failed(String),
    Cancelled(String),
}

impl PrefetchReport {
    fn from_outcomes(outcomes: Vec<FetchOutcome>) -> Self {
        let mut report = Self::default();
        for outcome in outcomes {
            match outcome {
                FetchOutcome::Fetched(path) => report.fetched.push(path),
                FetchOutcome::Failed(path) => report.failed.push(path),
                FetchOutcome::Cancelled(path) => report.cancelled.push(path),
            }
        }
        report
    }
}

/// A running prefetch. Dropping it lets the fetches finish in the background.
#[derive(Debug)]
pub struct PrefetchHandle {
    planned: Vec<String>,
    token: CancellationToken,
    task: Option<JoinHandle<PrefetchReport>>,
}

impl PrefetchHandle {
    fn idle(token: CancellationToken) -> Self {
        Self {
            planned: Vec::new(),
            token,
            task: None,
        }
    }

    /// Paths this dispatch claimed and is fetching.
    pub fn planned(&self) -> &[String] {
        &self.planned
    }

    /// Stop fetches that have not completed; their paths are released.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Wait for every fetch of this dispatch to settle.
    pub async fn wait(self) -> anyhow::Result<PrefetchReport> {
        match self.task {
            Some(task) => Ok(task.await?),
            None => Ok(PrefetchReport::default()),
        }
    }
}

/// Executes prefetch plans against a shared cache and document tree.
///
/// Dispatching spawns onto the current tokio runtime.
pub struct Prefetcher {
    cache: Arc<DocumentCache>,
    tree: Arc<DocumentTree>,
    fetcher: Arc<dyn Fetcher>,
    max_auto_preload: usize,
    max_manual_preload: Option<usize>,
}

impl Prefetcher {
    pub fn new(
        cache: Arc<DocumentCache>,
        tree: Arc<DocumentTree>,
        fetcher: Arc<dyn Fetcher>,
    ) -> Self {
        Self {
            cache,
            tree,
            fetcher,
            max_auto_preload: DEFAULT_MAX_AUTO_PRELOAD,
            max_manual_preload: None,
        }
    }

    pub fn with_limits(mut self, max_auto_preload: usize, max_manual_preload: Option<usize>) -> Self {
        self.max_auto_preload = max_auto_preload;
        self.max_manual_preload = max_manual_preload;
        self
    }

    /// Preload the neighbours of `current` (fire-and-forget friendly).
    pub fn preload_around(&self, current: &str) -> PrefetchHandle {
        self.preload_around_with(current, CancellationToken::new())
    }

    pub fn preload_around_with(&self, current: &str, token: CancellationToken) -> PrefetchHandle {
        if self.cache.options().disable_preload {
            return PrefetchHandle::idle(token);
        }
        let plan = plan_around_current(current, &self.tree, &self.cache, self.max_auto_preload);
        tracing::debug!(current, ?plan, "planned neighbour preload");
        self.dispatch(plan, token)
    }

    /// Preload the whole tree, bounded by the manual preload limit.
    pub fn preload_all(&self) -> PrefetchHandle {
        self.preload_all_with(CancellationToken::new())
    }

    pub fn preload_all_with(&self, token: CancellationToken) -> PrefetchHandle {
        if self.cache.options().disable_preload {
            return PrefetchHandle::idle(token);
        }
        let plan = plan_all(&self.tree, &self.cache, self.max_manual_preload);
        tracing::debug!(count = plan.len(), "planned full preload");
        self.dispatch(plan, token)
    }

    fn dispatch(&self, plan: Vec<String>, token: CancellationToken) -> PrefetchHandle {
        let claimed: Vec<String> = plan
            .into_iter()
            .filter(|path| self.cache.mark_in_flight(path))
            .collect();
        if claimed.is_empty() {
            return PrefetchHandle::idle(token);
        }

        let fetches: Vec<_> = claimed
            .iter()
            .map(|path| {
                let cache = Arc::clone(&self.cache);
                let fetcher = Arc::clone(&self.fetcher);
                let token = token.clone();
                let request = path.clone();
                let path = path.clone();
                async move {
                    tokio::select! {
                        biased;
                        _ = token.cancelled() => {
                            cache.release_in_flight(&path);
                            FetchOutcome::Cancelled(path)
                        }
                        result = fetcher.fetch(&request) => match result {
                            Ok(content) => {
                                cache.store_preload(&path, content);
                                FetchOutcome::Fetched(path)
                            }
                            Err(err) => {
                                tracing::warn!(path = %path, "preload failed: {err:#}");
                                cache.release_in_flight(&path);
                                FetchOutcome::Failed(path)
                            }
                        },
                    }
                }
            })
            .collect();

        let task = tokio::spawn(async move {
            let report = PrefetchReport::from_outcomes(join_all(fetches).await);
            tracing::debug!(
                fetched = report.fetched.len(),
                failed = report.failed.len(),
                cancelled = report.cancelled.len(),
                "preload finished"
            );
            report
        });

        PrefetchHandle {
            planned: claimed,
            token,
            task: Some(task),
        }
    }
}
