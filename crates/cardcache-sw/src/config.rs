//! Worker configuration.
//!
//! One [`CacheConfig`] describes one deployed worker version. It is built once
//! at startup, wrapped in an `Arc` and shared read-only by the lifecycle
//! controller and the router.

use std::path::Path;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::offline::{OfflineTemplate, StaticCatalog};
use crate::ServiceWorkerError;

/// Configuration of one worker version.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Version-qualified cache store name.
    pub cache_name: String,

    /// Origin scope the worker controls. Relative manifest entries resolve
    /// against it.
    pub scope: Url,

    /// App shell manifest, fetched at install. Also the static asset list
    /// served cache-first.
    pub app_shell: Vec<String>,

    /// Path fragment marking API requests, which are never intercepted.
    pub api_marker: String,

    /// Rendered offline document served for failed navigations.
    pub offline_page: String,

    /// Size limit for the cache store, in bytes.
    pub cache_quota_bytes: Option<u64>,

    /// Activate right after install instead of waiting.
    pub skip_waiting: bool,

    /// Delete every other cache store on activation.
    pub purge_stale_caches: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_name: "business-card-cache-v3".to_string(),
            scope: default_scope(),
            app_shell: vec![
                "/static/style.css".to_string(),
                "/static/collapse.js".to_string(),
            ],
            api_marker: "/api/".to_string(),
            offline_page: OfflineTemplate::default().render(&StaticCatalog::builtin(), "en"),
            cache_quota_bytes: None,
            skip_waiting: true,
            purge_stale_caches: true,
        }
    }
}

/// Version tag of the per-card worker's store.
const CARD_CACHE_VERSION: &str = "v8";

/// Card page assets pre-cached by the per-card worker.
const CARD_ASSETS: &[&str] = &[
    "/static/style.css",
    "/static/cards.css",
    "/static/card.css",
    "/static/card.js",
    "/static/collapse.js",
    "/static/copy.js",
    "/static/preview.js",
    "/static/airplane.svg",
    "/static/burger.svg",
    "/static/close.svg",
    "/static/contact.svg",
    "/static/copy.svg",
    "/static/copy-svgrepo-com.svg",
    "/static/delete.svg",
    "/static/edit.svg",
    "/static/email.svg",
    "/static/favicon-192.svg",
    "/static/fly.svg",
    "/static/lock.svg",
    "/static/logo.svg",
    "/static/phone.svg",
    "/static/qr-code-.svg",
    "/static/telegram.svg",
    "/static/unlock.svg",
    "/static/view.svg",
    "/static/vk-logo.svg",
    "/static/yandex-logo.svg",
];

/// Third-party scripts the card page loads.
const CARD_SCRIPTS: &[&str] = &[
    "https://cdnjs.cloudflare.com/ajax/libs/qrcodejs/1.0.0/qrcode.js",
    "https://cdnjs.cloudflare.com/ajax/libs/dom-to-image/2.6.0/dom-to-image.min.js",
];

impl CacheConfig {
    /// Default configuration for `scope`.
    pub fn for_scope(scope: Url) -> Self {
        Self {
            scope,
            ..Default::default()
        }
    }

    /// Worker for a single card page, so a visitor can reopen the card
    /// offline.
    ///
    /// Its store is named per card and pre-caches the card page, the card
    /// assets and `avatar` (a path relative to the site root; empty for none).
    /// Activation leaves other stores alone, since other cards' workers
    /// share the origin.
    pub fn for_card(card_id: u64, avatar: &str) -> Self {
        let mut app_shell = vec![
            "/".to_string(),
            format!("/c/{card_id}"),
            format!("/c/{card_id}/"),
        ];
        app_shell.extend(CARD_ASSETS.iter().map(|s| s.to_string()));
        let avatar = avatar.trim_start_matches('/');
        if !avatar.is_empty() {
            app_shell.push(format!("/{avatar}"));
        }
        app_shell.extend(CARD_SCRIPTS.iter().map(|s| s.to_string()));

        Self {
            cache_name: format!("card-{card_id}-{CARD_CACHE_VERSION}"),
            app_shell,
            purge_stale_caches: false,
            ..Default::default()
        }
    }

    /// Parse a JSON configuration. Missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self, ServiceWorkerError> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| ServiceWorkerError::Config(format!("invalid config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a JSON configuration file.
    pub fn load(path: &Path) -> Result<Self, ServiceWorkerError> {
        let json = std::fs::read_to_string(path).map_err(|e| {
            ServiceWorkerError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_json_str(&json)
    }

    pub fn with_scope(mut self, scope: Url) -> Self {
        self.scope = scope;
        self
    }

    pub fn with_cache_name(mut self, name: impl Into<String>) -> Self {
        self.cache_name = name.into();
        self
    }

    pub fn with_app_shell<I, S>(mut self, urls: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.app_shell = urls.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_offline_page(mut self, html: impl Into<String>) -> Self {
        self.offline_page = html.into();
        self
    }

    pub fn with_quota(mut self, bytes: u64) -> Self {
        self.cache_quota_bytes = Some(bytes);
        self
    }

    pub fn with_skip_waiting(mut self, skip: bool) -> Self {
        self.skip_waiting = skip;
        self
    }

    pub fn with_purge_stale_caches(mut self, purge: bool) -> Self {
        self.purge_stale_caches = purge;
        self
    }

    /// Check the configuration is usable.
    pub fn validate(&self) -> Result<(), ServiceWorkerError> {
        if self.cache_name.trim().is_empty() {
            return Err(ServiceWorkerError::Config(
                "cache_name must not be empty".to_string(),
            ));
        }
        if self.api_marker.is_empty() {
            return Err(ServiceWorkerError::Config(
                "api_marker must not be empty".to_string(),
            ));
        }
        if self.scope.cannot_be_a_base() {
            return Err(ServiceWorkerError::Config(format!(
                "scope {} cannot resolve relative URLs",
                self.scope
            )));
        }
        self.app_shell_urls().map(|_| ())
    }

    /// Manifest entries resolved against the scope, in manifest order.
    pub fn app_shell_urls(&self) -> Result<Vec<Url>, ServiceWorkerError> {
        self.app_shell
            .iter()
            .map(|entry| {
                self.scope.join(entry).map_err(|e| {
                    ServiceWorkerError::Config(format!("bad app shell entry {entry:?}: {e}"))
                })
            })
            .collect()
    }
}

fn default_scope() -> Url {
    Url::parse("http://localhost/").expect("static scope URL is valid")
}
