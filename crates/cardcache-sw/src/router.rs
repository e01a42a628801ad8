//! Fetch interception.
//!
//! Every request is put in exactly one [`RequestClass`], first match wins:
//!
//! | class        | rule                               | strategy                        |
//! |--------------|------------------------------------|---------------------------------|
//! | `Bypass`     | not GET, or path has the API marker | not intercepted                 |
//! | `StaticAsset`| matches an app shell entry         | cache first, network fallback   |
//! | `Navigation` | top-level document load            | network first, offline page     |
//! | `Other`      | everything else                    | network first, cache fallback   |
//!
//! Successful (2xx) network responses for `Navigation` and `Other` are written
//! back to the store in the background; the page never waits for the write.

use std::sync::Arc;

use cardcache_net::{Fetcher, Request, Response};
use http::Method;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinSet;
use tracing::{debug, trace, warn};
use url::Url;

use crate::cache::{CacheEntry, CacheStorage, RequestKey};
use crate::config::CacheConfig;
use crate::offline::offline_response;

/// Which strategy a request gets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestClass {
    Bypass,
    StaticAsset,
    Navigation,
    Other,
}

/// Result of routing one request.
#[derive(Debug, Clone)]
pub enum FetchOutcome {
    /// Not intercepted; the page's own network handling applies.
    Passthrough,
    /// Served from the network.
    Network(Response),
    /// Served from the cache store.
    Cache(Response),
    /// Network failed on a navigation; the offline document was served.
    Offline(Response),
    /// Network failed and nothing was cached.
    Unavailable,
}

impl FetchOutcome {
    /// The response handed to the page, if any.
    pub fn into_response(self) -> Option<Response> {
        match self {
            Self::Network(r) | Self::Cache(r) | Self::Offline(r) => Some(r),
            Self::Passthrough | Self::Unavailable => None,
        }
    }

    pub fn response(&self) -> Option<&Response> {
        match self {
            Self::Network(r) | Self::Cache(r) | Self::Offline(r) => Some(r),
            Self::Passthrough | Self::Unavailable => None,
        }
    }

    /// Short label for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Passthrough => "passthrough",
            Self::Network(_) => "network",
            Self::Cache(_) => "cache",
            Self::Offline(_) => "offline",
            Self::Unavailable => "unavailable",
        }
    }
}

/// An app shell entry, kept raw for substring matching and resolved for
/// exact matching.
#[derive(Debug, Clone)]
struct StaticAsset {
    raw: String,
    resolved: Url,
}

impl StaticAsset {
    fn matches(&self, url: &Url) -> bool {
        let mut url = url.clone();
        url.set_fragment(None);
        if url == self.resolved {
            return true;
        }
        // A bare "/" would contain-match every URL on the origin.
        self.resolved.path() != "/" && url.as_str().contains(self.raw.as_str())
    }
}

/// Routes intercepted requests for one worker version.
pub struct Router {
    config: Arc<CacheConfig>,
    caches: Arc<RwLock<CacheStorage>>,
    fetcher: Arc<dyn Fetcher>,
    static_assets: Vec<StaticAsset>,
    write_backs: Mutex<JoinSet<()>>,
}

impl Router {
    /// Create a router. Manifest entries that do not resolve are skipped;
    /// [`CacheConfig::validate`] reports them.
    pub fn new(
        config: Arc<CacheConfig>,
        caches: Arc<RwLock<CacheStorage>>,
        fetcher: Arc<dyn Fetcher>,
    ) -> Self {
        let static_assets = config
            .app_shell
            .iter()
            .filter_map(|raw| {
                config.scope.join(raw).ok().map(|resolved| StaticAsset {
                    raw: raw.clone(),
                    resolved,
                })
            })
            .collect();

        Self {
            config,
            caches,
            fetcher,
            static_assets,
            write_backs: Mutex::new(JoinSet::new()),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Classify a request.
    pub fn classify(&self, request: &Request) -> RequestClass {
        if request.method != Method::GET {
            return RequestClass::Bypass;
        }
        if request.url.path().contains(self.config.api_marker.as_str()) {
            return RequestClass::Bypass;
        }
        if self.static_assets.iter().any(|a| a.matches(&request.url)) {
            return RequestClass::StaticAsset;
        }
        if request.is_navigation() {
            return RequestClass::Navigation;
        }
        RequestClass::Other
    }

    /// Handle an intercepted request.
    pub async fn handle(&self, request: &Request) -> FetchOutcome {
        let class = self.classify(request);
        let outcome = match class {
            RequestClass::Bypass => FetchOutcome::Passthrough,
            RequestClass::StaticAsset => self.cache_first(request).await,
            RequestClass::Navigation => self.network_first_offline(request).await,
            RequestClass::Other => self.network_first_cache(request).await,
        };
        debug!(
            url = %request.url,
            method = %request.method,
            class = ?class,
            outcome = outcome.kind(),
            "Routed request"
        );
        outcome
    }

    /// Wait for every pending cache write-back.
    pub async fn settle(&self) {
        let mut pending = std::mem::take(&mut *self.write_backs.lock().await);
        while let Some(result) = pending.join_next().await {
            if let Err(e) = result {
                warn!(error = %e, "Cache write-back task failed");
            }
        }
    }

    async fn cache_first(&self, request: &Request) -> FetchOutcome {
        if let Some(response) = self.lookup(request).await {
            return FetchOutcome::Cache(response);
        }

        // Not written back: a manifest entry that missed install stays uncached.
        match self.fetcher.fetch(request).await {
            Ok(response) => FetchOutcome::Network(response),
            Err(e) => {
                debug!(url = %request.url, error = %e, "Static asset unavailable");
                FetchOutcome::Unavailable
            }
        }
    }

    async fn network_first_offline(&self, request: &Request) -> FetchOutcome {
        match self.fetcher.fetch(request).await {
            Ok(response) => {
                self.write_back(request, &response).await;
                FetchOutcome::Network(response)
            }
            Err(e) => {
                debug!(url = %request.url, error = %e, "Navigation failed, serving offline page");
                FetchOutcome::Offline(offline_response(
                    request.url.clone(),
                    &self.config.offline_page,
                ))
            }
        }
    }

    async fn network_first_cache(&self, request: &Request) -> FetchOutcome {
        match self.fetcher.fetch(request).await {
            Ok(response) => {
                self.write_back(request, &response).await;
                FetchOutcome::Network(response)
            }
            Err(e) => {
                debug!(url = %request.url, error = %e, "Network failed, trying cache");
                match self.lookup(request).await {
                    Some(response) => FetchOutcome::Cache(response),
                    None => FetchOutcome::Unavailable,
                }
            }
        }
    }

    async fn lookup(&self, request: &Request) -> Option<Response> {
        let key = RequestKey::from_request(request);
        let storage = self.caches.read().await;
        let entry = storage.get(&self.config.cache_name)?.match_request(&key)?;
        let response = entry.to_response();
        if response.is_none() {
            warn!(url = %key.url, "Unreadable cache entry, treating as miss");
        }
        response
    }

    /// Persist a copy of `response` in the background if it is 2xx.
    async fn write_back(&self, request: &Request, response: &Response) {
        if !response.ok() {
            trace!(url = %request.url, status = %response.status, "Not caching error response");
            return;
        }

        let key = RequestKey::from_request(request);
        let entry = CacheEntry::from_response(&key, response);
        let caches = Arc::clone(&self.caches);
        let cache_name = self.config.cache_name.clone();
        let quota = self.config.cache_quota_bytes;

        let mut write_backs = self.write_backs.lock().await;
        while write_backs.try_join_next().is_some() {}
        write_backs.spawn(async move {
            let mut storage = caches.write().await;
            match storage.open_with_quota(&cache_name, quota).put(entry) {
                Ok(_) => trace!(cache = %cache_name, url = %key.url, "Cached response"),
                Err(e) => warn!(cache = %cache_name, url = %key.url, error = %e, "Cache write-back dropped"),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedFetcher;
    use http::StatusCode;

    const STYLE: &str = "http://localhost/static/style.css";

    struct Harness {
        router: Router,
        caches: Arc<RwLock<CacheStorage>>,
        fetcher: Arc<ScriptedFetcher>,
    }

    fn harness(config: CacheConfig, fetcher: ScriptedFetcher) -> Harness {
        let caches = Arc::new(RwLock::new(CacheStorage::new()));
        let fetcher = Arc::new(fetcher);
        let router = Router::new(
            Arc::new(config),
            Arc::clone(&caches),
            Arc::clone(&fetcher) as Arc<dyn Fetcher>,
        );
        Harness {
            router,
            caches,
            fetcher,
        }
    }

    fn get(url: &str) -> Request {
        Request::parse(url).unwrap()
    }

    async fn seed(caches: &RwLock<CacheStorage>, url: &str, body: &'static str) {
        let url = Url::parse(url).unwrap();
        let key = RequestKey::get(&url);
        let response = Response::new(url, StatusCode::OK, body);
        caches
            .write()
            .await
            .open("business-card-cache-v3")
            .put(CacheEntry::from_response(&key, &response))
            .unwrap();
    }

    async fn cached(caches: &RwLock<CacheStorage>, url: &str) -> bool {
        let key = RequestKey::get(&Url::parse(url).unwrap());
        caches
            .read()
            .await
            .get("business-card-cache-v3")
            .and_then(|c| c.match_request(&key))
            .is_some()
    }

    #[test]
    fn test_classify() {
        let h = harness(
            CacheConfig::default().with_app_shell([
                "/static/style.css",
                "https://cdn.jsdelivr.net/npm/cropperjs@1.5.13/dist/cropper.min.js",
            ]),
            ScriptedFetcher::new(),
        );
        let r = &h.router;

        assert_eq!(
            r.classify(&get("http://localhost/c/1").method(Method::POST)),
            RequestClass::Bypass
        );
        assert_eq!(
            r.classify(&get("http://localhost/api/cards/1")),
            RequestClass::Bypass
        );
        assert_eq!(r.classify(&get(STYLE)), RequestClass::StaticAsset);
        assert_eq!(
            r.classify(&get("http://localhost/static/style.css?v=3")),
            RequestClass::StaticAsset
        );
        assert_eq!(
            r.classify(&get(
                "https://cdn.jsdelivr.net/npm/cropperjs@1.5.13/dist/cropper.min.js"
            )),
            RequestClass::StaticAsset
        );
        assert_eq!(
            r.classify(&Request::navigate(Url::parse("http://localhost/editor").unwrap())),
            RequestClass::Navigation
        );
        assert_eq!(
            r.classify(&get("http://localhost/uploads/avatar.png")),
            RequestClass::Other
        );
    }

    #[test]
    fn test_api_navigation_is_bypassed() {
        let h = harness(CacheConfig::default(), ScriptedFetcher::new());
        let request = Request::navigate(Url::parse("http://localhost/api/export").unwrap());
        assert_eq!(h.router.classify(&request), RequestClass::Bypass);
    }

    #[test]
    fn test_root_entry_matches_exactly() {
        let h = harness(
            CacheConfig::default().with_app_shell(["/"]),
            ScriptedFetcher::new(),
        );
        assert_eq!(
            h.router.classify(&get("http://localhost/")),
            RequestClass::StaticAsset
        );
        assert_eq!(
            h.router.classify(&get("http://localhost/c/1")),
            RequestClass::Other
        );
    }

    #[tokio::test]
    async fn test_non_get_passes_through_untouched() {
        let h = harness(CacheConfig::default(), ScriptedFetcher::new());
        let request = get("http://localhost/c/1").method(Method::POST);

        let outcome = h.router.handle(&request).await;
        h.router.settle().await;

        assert!(matches!(outcome, FetchOutcome::Passthrough));
        assert_eq!(h.fetcher.calls(), 0);
        assert!(h.caches.read().await.keys().is_empty());
    }

    #[tokio::test]
    async fn test_api_never_touches_store() {
        let fetcher = ScriptedFetcher::new().respond("http://localhost/api/card", 200, "{}");
        let h = harness(CacheConfig::default(), fetcher);

        let outcome = h.router.handle(&get("http://localhost/api/card")).await;
        h.router.settle().await;

        assert!(matches!(outcome, FetchOutcome::Passthrough));
        assert!(h.caches.read().await.keys().is_empty());
    }

    #[tokio::test]
    async fn test_static_asset_served_from_cache_while_network_hangs() {
        let h = harness(CacheConfig::default(), ScriptedFetcher::new().hang(STYLE));
        seed(&h.caches, STYLE, "body{color:red}").await;

        let outcome = h.router.handle(&get(STYLE)).await;

        match outcome {
            FetchOutcome::Cache(response) => assert_eq!(response.text().unwrap(), "body{color:red}"),
            other => panic!("expected cache hit, got {}", other.kind()),
        }
        assert_eq!(h.fetcher.calls(), 0);
    }

    #[tokio::test]
    async fn test_static_asset_miss_is_not_written_back() {
        let h = harness(
            CacheConfig::default(),
            ScriptedFetcher::new().respond(STYLE, 200, "body{}"),
        );

        let outcome = h.router.handle(&get(STYLE)).await;
        h.router.settle().await;

        assert!(matches!(outcome, FetchOutcome::Network(_)));
        assert!(!cached(&h.caches, STYLE).await);
    }

    #[tokio::test]
    async fn test_static_asset_miss_offline_is_unavailable() {
        let h = harness(CacheConfig::default(), ScriptedFetcher::new().fail(STYLE));
        let outcome = h.router.handle(&get(STYLE)).await;
        assert!(matches!(outcome, FetchOutcome::Unavailable));
    }

    #[tokio::test]
    async fn test_navigation_success_is_cached() {
        let url = "http://localhost/c/42";
        let h = harness(
            CacheConfig::default(),
            ScriptedFetcher::new().respond(url, 200, "<h1>card</h1>"),
        );

        let request = Request::navigate(Url::parse(url).unwrap());
        let outcome = h.router.handle(&request).await;
        h.router.settle().await;

        assert_eq!(outcome.kind(), "network");
        assert!(cached(&h.caches, url).await);
    }

    #[tokio::test]
    async fn test_navigation_offline_serves_offline_document() {
        let h = harness(CacheConfig::default(), ScriptedFetcher::new());
        // Even a cached copy is ignored: failed navigations always get the offline page.
        seed(&h.caches, "http://localhost/editor", "<p>stale</p>").await;

        let request = Request::navigate(Url::parse("http://localhost/editor").unwrap());
        let response = match h.router.handle(&request).await {
            FetchOutcome::Offline(response) => response,
            other => panic!("expected offline page, got {}", other.kind()),
        };

        assert_eq!(response.content_type().unwrap().essence_str(), "text/html");
        let body = response.text().unwrap();
        assert!(body.contains("You are offline"));
        assert!(body.contains("location.reload()"));
    }

    #[tokio::test]
    async fn test_custom_offline_page() {
        let h = harness(
            CacheConfig::default().with_offline_page("<p>Нет сети</p>"),
            ScriptedFetcher::new(),
        );
        let request = Request::navigate(Url::parse("http://localhost/").unwrap());
        let response = h.router.handle(&request).await.into_response().unwrap();
        assert_eq!(response.text().unwrap(), "<p>Нет сети</p>");
    }

    #[tokio::test]
    async fn test_subresource_round_trip() {
        let url = "http://localhost/uploads/avatar.png";
        let h = harness(
            CacheConfig::default(),
            ScriptedFetcher::new().respond(url, 200, "PNG"),
        );

        let first = h.router.handle(&get(url)).await;
        assert_eq!(first.kind(), "network");
        h.router.settle().await;

        h.fetcher.go_offline();
        match h.router.handle(&get(url)).await {
            FetchOutcome::Cache(response) => assert_eq!(&response.body[..], b"PNG"),
            other => panic!("expected cache fallback, got {}", other.kind()),
        }
    }

    #[tokio::test]
    async fn test_subresource_offline_without_entry_is_unavailable() {
        let h = harness(CacheConfig::default(), ScriptedFetcher::new());
        let outcome = h.router.handle(&get("http://localhost/uploads/x.png")).await;

        assert!(matches!(outcome, FetchOutcome::Unavailable));
        assert!(outcome.into_response().is_none());
    }

    #[tokio::test]
    async fn test_error_status_not_cached() {
        let url = "http://localhost/uploads/gone.png";
        let h = harness(
            CacheConfig::default(),
            ScriptedFetcher::new().respond(url, 404, "nope"),
        );

        let outcome = h.router.handle(&get(url)).await;
        h.router.settle().await;

        assert_eq!(outcome.response().unwrap().status, StatusCode::NOT_FOUND);
        assert!(!cached(&h.caches, url).await);
    }

    #[tokio::test]
    async fn test_quota_overflow_does_not_affect_response() {
        let url = "http://localhost/uploads/big.png";
        let h = harness(
            CacheConfig::default().with_quota(4),
            ScriptedFetcher::new().respond(url, 200, "a large body"),
        );

        let outcome = h.router.handle(&get(url)).await;
        h.router.settle().await;

        assert_eq!(outcome.response().unwrap().text().unwrap(), "a large body");
        assert!(!cached(&h.caches, url).await);
    }
}
