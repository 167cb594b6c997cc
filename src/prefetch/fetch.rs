//! Document fetchers

use anyhow::Context;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Retrieves the raw body of one document, addressed by its path below the
/// fetcher's document root.
pub trait Fetcher: Send + Sync {
    fn fetch<'a>(&'a self, path: &'a str) -> BoxFuture<'a, anyhow::Result<String>>;
}

/// Plain HTTP GET below a base URL. Any non-2xx status is an error.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    root: String,
}

impl HttpFetcher {
    pub fn new(root: impl Into<String>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            root: root.into(),
        })
    }
}

impl Fetcher for HttpFetcher {
    fn fetch<'a>(&'a self, path: &'a str) -> BoxFuture<'a, anyhow::Result<String>> {
        async move {
            let url = join_url(&self.root, path);
            let response = self
                .client
                .get(&url)
                .send()
                .await
                .with_context(|| format!("GET {url} failed"))?;
            let status = response.status();
            if !status.is_success() {
                anyhow::bail!("GET {url} returned {status}");
            }
            response
                .text()
                .await
                .with_context(|| format!("Failed to read body of {url}"))
        }
        .boxed()
    }
}

/// Reads documents from a local directory.
///
/// The root itself may be any path, `..` included. Document paths must stay
/// below it.
#[derive(Debug, Clone)]
pub struct FileFetcher {
    root: PathBuf,
}

impl FileFetcher {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

/// `path` as a relative path that cannot climb out of its root.
fn contained(path: &str) -> Option<&Path> {
    let relative = Path::new(path.trim_start_matches('/'));
    relative
        .components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
        .then_some(relative)
}

impl Fetcher for FileFetcher {
    fn fetch<'a>(&'a self, path: &'a str) -> BoxFuture<'a, anyhow::Result<String>> {
        async move {
            let Some(relative) = contained(path) else {
                anyhow::bail!("refusing to read {path}: path leaves the document root");
            };
            let file = self.root.join(relative);
            tokio::fs::read_to_string(&file)
                .await
                .with_context(|| format!("Failed to read {}", file.display()))
        }
        .boxed()
    }
}

/// True when `root` is an http(s) URL rather than a local directory.
pub fn is_remote_root(root: &str) -> bool {
    url::Url::parse(root)
        .map(|parsed| matches!(parsed.scheme(), "http" | "https"))
        .unwrap_or(false)
}

/// Pick the fetcher matching the configured root directory.
pub fn fetcher_for_root(root: &str) -> anyhow::Result<Arc<dyn Fetcher>> {
    if is_remote_root(root) {
        Ok(Arc::new(HttpFetcher::new(root)?))
    } else {
        Ok(Arc::new(FileFetcher::new(root)))
    }
}

/// Join the root directory and a document path with exactly one `/`.
pub fn join_url(root: &str, path: &str) -> String {
    let path = path.trim_start_matches('/');
    let root = root.trim_end_matches('/');
    if root.is_empty() {
        path.to_string()
    } else {
        format!("{root}/{path}")
    }
}
