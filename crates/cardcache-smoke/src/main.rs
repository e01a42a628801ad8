//! CardCache Smoke Harness
//!
//! Runs one worker version against a live origin, then routes each given
//! path and reports where the response came from. With `--store`, a version
//! whose cache store is already in the snapshot resumes without installing,
//! so a second run with the origin stopped shows the offline behaviour.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use cardcache_common::{init_logging, LogConfig, LogFormat};
use cardcache_net::{Fetcher, FetcherConfig, HttpFetcher, Request};
use cardcache_sw::{CacheConfig, CacheStorage, FetchOutcome, ServiceWorkerContainer};
use clap::Parser;
use serde_json::json;
use tokio::sync::RwLock;
use tracing::{debug, error, info, Level};
use url::Url;

#[derive(Parser, Debug)]
#[command(name = "cardcache-smoke")]
#[command(about = "Route requests through an offline cache worker")]
struct Args {
    /// Worker configuration JSON
    #[arg(long)]
    config: Option<PathBuf>,

    /// Use the per-card worker for this card id
    #[arg(long, conflicts_with = "config")]
    card: Option<u64>,

    /// Avatar path of the card, relative to the site root
    #[arg(long, requires = "card")]
    avatar: Option<String>,

    /// Origin scope, overriding the configured one
    #[arg(long)]
    scope: Option<Url>,

    /// Cache snapshot to restore from and save to
    #[arg(long)]
    store: Option<PathBuf>,

    /// Log as JSON
    #[arg(long)]
    json_logs: bool,

    /// Debug logging with source locations
    #[arg(short, long)]
    verbose: bool,

    /// Paths to request, resolved against the scope
    #[arg(required = true)]
    paths: Vec<String>,
}

impl Args {
    fn load_config(&self) -> anyhow::Result<CacheConfig> {
        let mut config = match (&self.config, self.card) {
            (Some(path), _) => CacheConfig::load(path)?,
            (None, Some(card)) => {
                CacheConfig::for_card(card, self.avatar.as_deref().unwrap_or(""))
            }
            (None, None) => CacheConfig::default(),
        };
        if let Some(ref scope) = self.scope {
            config = config.with_scope(scope.clone());
        }
        config.validate()?;
        Ok(config)
    }

    fn log_config(&self) -> LogConfig {
        let mut config = if self.json_logs {
            LogConfig::production().with_format(LogFormat::Json)
        } else {
            LogConfig::from_env()
        };
        if self.verbose {
            config.level = Level::DEBUG;
            config.include_location = true;
        }
        config
    }
}

/// A path whose last segment has no extension is treated as a page load.
fn looks_like_page(url: &Url) -> bool {
    let last = url.path_segments().and_then(|mut s| s.next_back()).unwrap_or("");
    !last.contains('.')
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(args.log_config()).context("logging already initialised")?;

    let config = args.load_config()?;
    let scope = config.scope.clone();
    let cache_name = config.cache_name.clone();

    let caches = match args.store {
        Some(ref path) => CacheStorage::load(path)
            .with_context(|| format!("cannot load cache store {}", path.display()))?,
        None => CacheStorage::new(),
    };
    let caches = Arc::new(RwLock::new(caches));

    let fetcher: Arc<dyn Fetcher> = Arc::new(HttpFetcher::new(FetcherConfig::default())?);
    let (container, mut events) =
        ServiceWorkerContainer::new(scope.clone(), Arc::clone(&caches), Arc::clone(&fetcher));

    let start = Instant::now();
    let restored = container.restore(config.clone()).await?.is_some();
    if restored {
        info!(cache = %cache_name, "Resumed from snapshot, refreshing");
    }
    let installed = match container.register(config).await {
        Ok(id) => {
            info!(worker = id.raw(), cache = %cache_name, "Worker installed");
            true
        }
        Err(e) if restored => {
            error!(error = %e, "Refresh failed, serving the restored version");
            false
        }
        Err(e) => {
            error!(error = %e, "Worker install failed, requests go straight to the network");
            false
        }
    };
    while let Ok(event) = events.try_recv() {
        debug!(?event, "Lifecycle event");
    }

    let mut counts: BTreeMap<&'static str, usize> = BTreeMap::new();
    let mut results = Vec::new();

    for path in &args.paths {
        let url = scope
            .join(path)
            .with_context(|| format!("cannot resolve {path} against {scope}"))?;
        let request = if looks_like_page(&url) {
            Request::navigate(url.clone())
        } else {
            Request::get(url.clone())
        };

        let outcome = container.handle_fetch(&request).await;
        let (kind, status) = match outcome {
            FetchOutcome::Passthrough => match fetcher.fetch(&request).await {
                Ok(response) => ("passthrough", Some(response.status.as_u16())),
                Err(e) => {
                    debug!(url = %url, error = %e, "Passthrough fetch failed");
                    ("passthrough", None)
                }
            },
            ref other => (other.kind(), other.response().map(|r| r.status.as_u16())),
        };

        let shown = status.map_or_else(|| "---".to_string(), |s| s.to_string());
        println!("{:<12} {} {}", kind, shown, url);

        *counts.entry(kind).or_insert(0) += 1;
        results.push(json!({
            "url": url.as_str(),
            "navigation": request.is_navigation(),
            "outcome": kind,
            "status": status,
        }));
    }

    container.settle().await;

    if let Some(ref path) = args.store {
        caches
            .read()
            .await
            .save(path)
            .with_context(|| format!("cannot save cache store {}", path.display()))?;
    }

    let stores: Vec<String> = caches
        .read()
        .await
        .keys()
        .into_iter()
        .map(str::to_string)
        .collect();

    let summary = json!({
        "scope": scope.as_str(),
        "cache": cache_name,
        "restored": restored,
        "installed": installed,
        "stores": stores,
        "outcomes": counts,
        "requests": results,
        "elapsed_ms": start.elapsed().as_millis() as u64,
    });
    println!("{}", summary);

    Ok(())
}
