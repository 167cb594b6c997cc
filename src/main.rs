//! folio - document cache and prefetch engine
//!
//! Command-line front end over the library: fetch documents through the
//! cache, preload neighbours, inspect and administer both cache tiers.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use folio::cache::{self, DocumentCache, Tier};
use folio::config::Config;
use folio::prefetch::{self, Prefetcher};
use folio::store::DirStore;
use folio::tree::{self, DocumentTree};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "folio",
    about = "Cache and preload documents for a documentation viewer",
    version
)]
struct Args {
    /// Directory backing the persistent cache store
    #[arg(long, global = true)]
    state_dir: Option<PathBuf>,

    /// Document root: a local directory or an http(s) URL
    #[arg(long, global = true)]
    root: Option<String>,

    /// Document tree JSON file
    #[arg(long, global = true)]
    tree: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print a document, fetching and caching it on a miss
    Get {
        path: String,
        /// Do not preload neighbouring documents afterwards
        #[arg(long)]
        no_preload: bool,
    },
    /// Preload the neighbours of a document
    Preload { path: String },
    /// Preload every document in the tree
    PreloadAll {
        /// Upper bound on documents to fetch
        #[arg(long)]
        max: Option<usize>,
    },
    /// List cached documents in both tiers
    List,
    /// Remove one document from a tier
    Remove {
        path: String,
        #[arg(long, value_enum, default_value_t = TierArg::Persistent)]
        tier: TierArg,
    },
    /// Clear a tier, or everything
    Clear {
        #[arg(value_enum, default_value_t = ClearTarget::All)]
        target: ClearTarget,
    },
    /// Show or change the tier toggles
    Options {
        #[arg(long)]
        disable_persistent: Option<bool>,
        #[arg(long)]
        disable_preload: Option<bool>,
    },
    /// Drop expired persistent entries now
    Sweep,
    /// Print the effective configuration
    Config {
        /// Write the effective configuration to the config file
        #[arg(long)]
        save: bool,
    },
    /// Document tree utilities
    Tree {
        #[command(subcommand)]
        command: TreeCommand,
    },
}

#[derive(Subcommand, Debug)]
enum TreeCommand {
    /// Generate tree JSON from a local documentation directory
    Build { dir: PathBuf },
    /// Print the configured tree in reading order
    Show,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum TierArg {
    Persistent,
    Preload,
}

impl From<TierArg> for Tier {
    fn from(arg: TierArg) -> Self {
        match arg {
            TierArg::Persistent => Tier::Persistent,
            TierArg::Preload => Tier::Preload,
        }
    }
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum ClearTarget {
    Persistent,
    Preload,
    All,
}

fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("folio=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();

    let mut config = Config::load();
    if let Some(dir) = args.state_dir.clone() {
        config.state_dir = Some(dir);
    }
    if let Some(root) = args.root.clone() {
        config.root_directory = root;
    }
    if let Some(tree) = args.tree.clone() {
        config.tree_file = tree;
    }

    match &args.command {
        Command::Tree {
            command: TreeCommand::Build { dir },
        } => {
            let node = tree::scan_directory(dir, tree::DEFAULT_INDEX_NAMES)?;
            println!("{}", serde_json::to_string_pretty(&node)?);
            return Ok(());
        }
        Command::Config { save } => {
            if *save {
                config.save()?;
                eprintln!("Saved {}", Config::config_location());
            }
            println!("{}", serde_json::to_string_pretty(&config)?);
            return Ok(());
        }
        _ => {}
    }

    let state_dir = config.resolved_state_dir();
    let store = DirStore::open(&state_dir)
        .with_context(|| format!("Failed to open cache store at {}", state_dir.display()))?;
    let cache = Arc::new(DocumentCache::open(store, config.cache_settings()));

    let sweep_token = CancellationToken::new();
    let sweep = cache::spawn_expiry_sweep(cache.clone(), config.sweep_interval(), sweep_token.clone());

    let result = run(args.command, &config, cache).await;

    sweep_token.cancel();
    let _ = sweep.await;
    result
}

async fn run(command: Command, config: &Config, cache: Arc<DocumentCache>) -> Result<()> {
    match command {
        Command::Get { path, no_preload } => {
            let content = match cache.lookup(&path) {
                Some(content) => {
                    tracing::debug!(path = %path, "cache hit");
                    content
                }
                None => {
                    let fetcher = prefetch::fetcher_for_root(&config.root_directory)?;
                    let content = fetcher.fetch(&path).await?;
                    cache.store_persistent(&path, content.clone());
                    content
                }
            };
            println!("{content}");

            if !no_preload {
                match DocumentTree::load(&config.tree_file) {
                    Ok(tree) => {
                        let report = prefetcher(config, cache, tree)?
                            .preload_around(&path)
                            .wait()
                            .await?;
                        tracing::info!(fetched = report.fetched.len(), "preloaded neighbours");
                    }
                    Err(err) => tracing::warn!("skipping preload: {err:#}"),
                }
            }
        }
        Command::Preload { path } => {
            let tree = DocumentTree::load(&config.tree_file)?;
            let report = prefetcher(config, cache, tree)?
                .preload_around(&path)
                .wait()
                .await?;
            print_report(&report);
        }
        Command::PreloadAll { max } => {
            let tree = DocumentTree::load(&config.tree_file)?;
            let limit = max.or(config.max_manual_preload);
            let report = prefetcher(config, cache, tree)?
                .with_limits(config.max_auto_preload, limit)
                .preload_all()
                .wait()
                .await?;
            print_report(&report);
        }
        Command::List => {
            let report = cache.report();
            for tier in Tier::all() {
                println!(
                    "{} ({}): {} documents, {} bytes",
                    tier.label(),
                    tier.description(),
                    report.count(tier),
                    report.bytes(tier)
                );
                for entry in report.entries.iter().filter(|e| e.tier == tier) {
                    match entry.age_ms {
                        Some(age) => println!("  {}  {} B  {}s old", entry.path, entry.bytes, age / 1000),
                        None => println!("  {}  {} B", entry.path, entry.bytes),
                    }
                }
            }
            if !report.in_flight.is_empty() {
                println!("In flight: {}", report.in_flight.join(", "));
            }
        }
        Command::Remove { path, tier } => {
            let tier = Tier::from(tier);
            if cache.remove_one(&path, tier) {
                println!("Removed {} from {}", path, tier.label());
            } else {
                println!("{} was not in {}", path, tier.label());
            }
        }
        Command::Clear { target } => match target {
            ClearTarget::Persistent => cache.clear_persistent(),
            ClearTarget::Preload => cache.clear_preload(),
            ClearTarget::All => cache.clear_all(),
        },
        Command::Options {
            disable_persistent,
            disable_preload,
        } => {
            let current = cache.options();
            if disable_persistent.is_some() || disable_preload.is_some() {
                cache.set_options(
                    disable_persistent.unwrap_or(current.disable_persistent),
                    disable_preload.unwrap_or(current.disable_preload),
                );
            }
            let options = cache.options();
            println!("disable_persistent = {}", options.disable_persistent);
            println!("disable_preload    = {}", options.disable_preload);
        }
        Command::Sweep => {
            let removed = cache.clear_expired();
            println!("Removed {removed} expired documents");
        }
        Command::Tree { command } => match command {
            TreeCommand::Show => {
                let tree = DocumentTree::load(&config.tree_file)?;
                for path in tree.reading_order() {
                    println!("{path}");
                }
            }
            TreeCommand::Build { .. } => unreachable!("handled before the cache is opened"),
        },
        Command::Config { .. } => unreachable!("handled before the cache is opened"),
    }
    Ok(())
}

fn prefetcher(config: &Config, cache: Arc<DocumentCache>, tree: DocumentTree) -> Result<Prefetcher> {
    let fetcher = prefetch::fetcher_for_root(&config.root_directory)?;
    Ok(
        Prefetcher::new(cache, Arc::new(tree), fetcher)
            .with_limits(config.max_auto_preload, config.max_manual_preload),
    )
}

fn print_report(report: &prefetch::PrefetchReport) {
    println!(
        "Preloaded {} documents ({} failed, {} cancelled)",
        report.fetched.len(),
        report.failed.len(),
        report.cancelled.len()
    );
    for path in &report.fetched {
        println!("  + {path}");
    }
    for path in &report.failed {
        println!("  ! {path}");
    }
}
