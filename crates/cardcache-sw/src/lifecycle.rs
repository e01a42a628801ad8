//! Install and activate handlers.
//!
//! Install fills the version's cache store with the app shell, all or
//! nothing. Activate drops every other store and claims open pages.

use std::sync::Arc;

use cardcache_net::{Fetcher, Request};
use futures::future::try_join_all;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::{CacheEntry, CacheStorage, RequestKey};
use crate::clients::Clients;
use crate::config::CacheConfig;
use crate::registration::ServiceWorkerId;
use crate::ServiceWorkerError;

/// What a successful install stored.
#[derive(Debug, Clone)]
pub struct InstallReport {
    pub cache_name: String,
    /// Manifest URLs now in the store, in manifest order.
    pub cached: Vec<Url>,
}

/// What an activation changed.
#[derive(Debug, Clone, Default)]
pub struct ActivateReport {
    /// Stale stores that were deleted.
    pub deleted: Vec<String>,
    /// Clients whose controller changed.
    pub claimed: Vec<String>,
}

/// Runs the lifecycle events for one worker version.
pub struct LifecycleController {
    config: Arc<CacheConfig>,
    caches: Arc<RwLock<CacheStorage>>,
    fetcher: Arc<dyn Fetcher>,
}

impl LifecycleController {
    pub fn new(
        config: Arc<CacheConfig>,
        caches: Arc<RwLock<CacheStorage>>,
        fetcher: Arc<dyn Fetcher>,
    ) -> Self {
        Self {
            config,
            caches,
            fetcher,
        }
    }

    /// Handle the install event.
    ///
    /// Every manifest URL is fetched before anything is stored. Any transport
    /// failure or non-2xx status fails the whole install and leaves the store
    /// as it was.
    pub async fn install(&self) -> Result<InstallReport, ServiceWorkerError> {
        let cache_name = &self.config.cache_name;
        let urls = self.config.app_shell_urls()?;
        info!(cache = %cache_name, entries = urls.len(), "Installing app shell");

        let staged = try_join_all(urls.iter().map(|url| self.fetch_for_install(url))).await?;

        let mut storage = self.caches.write().await;
        let existed = storage.has(cache_name);
        let result = storage
            .open_with_quota(cache_name, self.config.cache_quota_bytes)
            .add_all(staged);

        if let Err(e) = result {
            if !existed {
                storage.delete(cache_name);
            }
            warn!(cache = %cache_name, error = %e, "App shell does not fit in cache");
            return Err(e.into());
        }

        info!(cache = %cache_name, "App shell cached");
        Ok(InstallReport {
            cache_name: cache_name.clone(),
            cached: urls,
        })
    }

    /// Handle the activate event.
    ///
    /// Stale stores are all gone before any client is claimed. With
    /// `purge_stale_caches` off, other stores are kept.
    pub async fn activate(
        &self,
        worker: ServiceWorkerId,
        clients: &RwLock<Clients>,
    ) -> ActivateReport {
        let current = &self.config.cache_name;

        let deleted = if !self.config.purge_stale_caches {
            Vec::new()
        } else {
            let mut storage = self.caches.write().await;
            let stale: Vec<String> = storage
                .keys()
                .into_iter()
                .filter(|name| *name != current.as_str())
                .map(str::to_string)
                .collect();
            for name in &stale {
                storage.delete(name);
                debug!(cache = %name, "Deleted stale cache");
            }
            stale
        };

        let claimed = clients.write().await.claim(worker, &self.config.scope);

        info!(
            cache = %current,
            deleted = deleted.len(),
            claimed = claimed.len(),
            "Activated"
        );
        ActivateReport { deleted, claimed }
    }

    async fn fetch_for_install(&self, url: &Url) -> Result<CacheEntry, ServiceWorkerError> {
        let request = Request::get(url.clone());
        let response = self.fetcher.fetch(&request).await.map_err(|e| {
            warn!(url = %url, error = %e, "App shell fetch failed");
            ServiceWorkerError::InstallFailed {
                url: url.to_string(),
                reason: e.to_string(),
            }
        })?;

        if !response.ok() {
            warn!(url = %url, status = %response.status, "App shell fetch returned error status");
            return Err(ServiceWorkerError::InstallFailed {
                url: url.to_string(),
                reason: format!("status {}", response.status),
            });
        }

        Ok(CacheEntry::from_response(
            &RequestKey::from_request(&request),
            &response,
        ))
    }
}
