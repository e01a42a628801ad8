//! Cache API: named stores of request/response pairs.
//!
//! ```text
//! CacheStorage (caches)
//!     └── Cache ("business-card-cache-v3")
//!             └── RequestKey (GET + URL) → CacheEntry
//! ```

use std::fs;
use std::io::ErrorKind;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use cardcache_net::{Request, Response};
use hashbrown::HashMap;
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};
use url::Url;

/// Snapshot format version written by [`CacheStorage::save`].
const SNAPSHOT_VERSION: u32 = 1;

// ==================== Errors ====================

/// Errors from cache store operations.
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Cache '{cache}' quota exceeded: {required} bytes needed, {quota} allowed")]
    QuotaExceeded {
        cache: String,
        required: u64,
        quota: u64,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Snapshot error: {0}")]
    Snapshot(#[from] serde_json::Error),

    #[error("Unsupported snapshot version {0}")]
    SnapshotVersion(u32),
}

// ==================== Keys & Entries ====================

/// Identity of a cached request: method plus URL without fragment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestKey {
    pub method: String,
    pub url: String,
}

impl RequestKey {
    /// Key for `method` + `url`.
    pub fn new(method: &Method, url: &Url) -> Self {
        let mut url = url.clone();
        url.set_fragment(None);
        Self {
            method: method.as_str().to_string(),
            url: url.into(),
        }
    }

    /// Key for a GET of `url`.
    pub fn get(url: &Url) -> Self {
        Self::new(&Method::GET, url)
    }

    /// Key for an intercepted request.
    pub fn from_request(request: &Request) -> Self {
        Self::new(&request.method, &request.url)
    }
}

/// A cached request/response pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Request URL.
    pub url: String,

    /// Request method.
    pub method: String,

    /// Response status.
    pub status: u16,

    /// Response headers, in order, repeated names allowed.
    pub headers: Vec<(String, String)>,

    /// Response body.
    #[serde(with = "base64_body")]
    pub body: Bytes,

    /// Cached at timestamp (ms since epoch).
    pub cached_at: u64,
}

impl CacheEntry {
    /// Snapshot `response` under `key`.
    ///
    /// Header values that are not visible ASCII are dropped.
    pub fn from_response(key: &RequestKey, response: &Response) -> Self {
        let headers = response
            .headers
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();

        Self {
            url: key.url.clone(),
            method: key.method.clone(),
            status: response.status.as_u16(),
            headers,
            body: response.body.clone(),
            cached_at: now_millis(),
        }
    }

    /// The key this entry is stored under.
    pub fn key(&self) -> RequestKey {
        RequestKey {
            method: self.method.clone(),
            url: self.url.clone(),
        }
    }

    /// Approximate storage cost in bytes.
    pub fn size(&self) -> u64 {
        let headers: usize = self.headers.iter().map(|(n, v)| n.len() + v.len()).sum();
        (self.url.len() + self.method.len() + headers + self.body.len()) as u64
    }

    /// Rebuild a response, or `None` if the stored snapshot is unusable.
    pub fn to_response(&self) -> Option<Response> {
        let url = Url::parse(&self.url).ok()?;
        let status = StatusCode::from_u16(self.status).ok()?;

        let mut headers = HeaderMap::new();
        for (name, value) in &self.headers {
            if let (Ok(n), Ok(v)) = (
                HeaderName::try_from(name.as_str()),
                HeaderValue::try_from(value.as_str()),
            ) {
                headers.append(n, v);
            }
        }

        Some(Response {
            url,
            status,
            headers,
            body: self.body.clone(),
        })
    }
}

// ==================== Cache ====================

/// A single named cache store.
#[derive(Debug, Default)]
pub struct Cache {
    /// Cache name.
    pub name: String,

    /// Cached entries.
    entries: HashMap<RequestKey, CacheEntry>,

    /// Maximum total entry size in bytes.
    quota: Option<u64>,
}

impl Cache {
    /// Create a new cache.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            entries: HashMap::new(),
            quota: None,
        }
    }

    /// Set the size quota. Existing entries are kept even if over quota.
    pub fn set_quota(&mut self, quota: Option<u64>) {
        self.quota = quota;
    }

    pub fn quota(&self) -> Option<u64> {
        self.quota
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total size of all entries.
    pub fn size_bytes(&self) -> u64 {
        self.entries.values().map(CacheEntry::size).sum()
    }

    /// Match a request.
    pub fn match_request(&self, key: &RequestKey) -> Option<&CacheEntry> {
        self.entries.get(key)
    }

    /// Store an entry, replacing any entry with the same key.
    pub fn put(&mut self, entry: CacheEntry) -> Result<Option<CacheEntry>, CacheError> {
        let key = entry.key();
        if let Some(quota) = self.quota {
            let replaced = self.entries.get(&key).map(CacheEntry::size).unwrap_or(0);
            let required = self.size_bytes() - replaced + entry.size();
            self.check_quota(required, quota)?;
        }
        Ok(self.entries.insert(key, entry))
    }

    /// Store all entries, or none of them if the batch would exceed the quota.
    pub fn add_all(&mut self, entries: Vec<CacheEntry>) -> Result<(), CacheError> {
        if let Some(quota) = self.quota {
            let mut sizes: HashMap<RequestKey, u64> = self
                .entries
                .iter()
                .map(|(k, e)| (k.clone(), e.size()))
                .collect();
            for entry in &entries {
                sizes.insert(entry.key(), entry.size());
            }
            self.check_quota(sizes.values().sum(), quota)?;
        }

        for entry in entries {
            self.entries.insert(entry.key(), entry);
        }
        Ok(())
    }

    /// Delete entry.
    pub fn delete(&mut self, key: &RequestKey) -> bool {
        self.entries.remove(key).is_some()
    }

    /// Get all keys.
    pub fn keys(&self) -> Vec<&RequestKey> {
        self.entries.keys().collect()
    }

    fn check_quota(&self, required: u64, quota: u64) -> Result<(), CacheError> {
        if required > quota {
            return Err(CacheError::QuotaExceeded {
                cache: self.name.clone(),
                required,
                quota,
            });
        }
        Ok(())
    }
}

// ==================== Cache Storage ====================

/// Cache storage (the `caches` global), shared by every worker version.
#[derive(Debug, Default)]
pub struct CacheStorage {
    caches: HashMap<String, Cache>,
}

impl CacheStorage {
    /// Create new cache storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a cache (creates if doesn't exist).
    pub fn open(&mut self, name: &str) -> &mut Cache {
        self.caches
            .entry(name.to_string())
            .or_insert_with(|| Cache::new(name))
    }

    /// Open a cache and apply `quota` to it.
    pub fn open_with_quota(&mut self, name: &str, quota: Option<u64>) -> &mut Cache {
        let cache = self.open(name);
        cache.set_quota(quota);
        cache
    }

    /// Get a cache without creating it.
    pub fn get(&self, name: &str) -> Option<&Cache> {
        self.caches.get(name)
    }

    /// Check if cache exists.
    pub fn has(&self, name: &str) -> bool {
        self.caches.contains_key(name)
    }

    /// Delete a cache.
    pub fn delete(&mut self, name: &str) -> bool {
        self.caches.remove(name).is_some()
    }

    /// Get all cache names.
    pub fn keys(&self) -> Vec<&str> {
        self.caches.keys().map(|s| s.as_str()).collect()
    }

    /// Match across all caches.
    pub fn match_request(&self, key: &RequestKey) -> Option<&CacheEntry> {
        self.caches
            .values()
            .find_map(|cache| cache.match_request(key))
    }

    // ==================== Persistence ====================

    /// Write a JSON snapshot of every cache to `path`.
    ///
    /// The snapshot is written next to `path` and renamed into place.
    pub fn save(&self, path: &Path) -> Result<(), CacheError> {
        let snapshot = StorageSnapshot {
            version: SNAPSHOT_VERSION,
            caches: self
                .caches
                .values()
                .map(|cache| CacheSnapshot {
                    name: cache.name.clone(),
                    quota: cache.quota,
                    entries: cache.entries.values().cloned().collect(),
                })
                .collect(),
        };

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let tmp = path.with_extension("tmp");
        fs::write(&tmp, serde_json::to_vec(&snapshot)?)?;
        fs::rename(&tmp, path)?;

        info!(path = %path.display(), caches = snapshot.caches.len(), "Cache storage saved");
        Ok(())
    }

    /// Load a snapshot written by [`save`](Self::save).
    ///
    /// A missing file yields empty storage.
    pub fn load(path: &Path) -> Result<Self, CacheError> {
        let data = match fs::read(path) {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(path = %path.display(), "No cache snapshot, starting empty");
                return Ok(Self::new());
            }
            Err(e) => return Err(e.into()),
        };

        let snapshot: StorageSnapshot = serde_json::from_slice(&data)?;
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(CacheError::SnapshotVersion(snapshot.version));
        }

        let mut storage = Self::new();
        for cached in snapshot.caches {
            let cache = storage.open_with_quota(&cached.name, cached.quota);
            for entry in cached.entries {
                cache.entries.insert(entry.key(), entry);
            }
        }

        info!(path = %path.display(), caches = storage.caches.len(), "Cache storage loaded");
        Ok(storage)
    }
}

#[derive(Serialize, Deserialize)]
struct StorageSnapshot {
    version: u32,
    caches: Vec<CacheSnapshot>,
}

#[derive(Serialize, Deserialize)]
struct CacheSnapshot {
    name: String,
    quota: Option<u64>,
    entries: Vec<CacheEntry>,
}

mod base64_body {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(body: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(body))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded)
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    fn entry(u: &str, body: &'static [u8]) -> CacheEntry {
        let key = RequestKey::get(&url(u));
        let mut response = Response::new(url(u), StatusCode::OK, Bytes::from_static(body));
        response
            .headers
            .insert("content-type", HeaderValue::from_static("text/css"));
        CacheEntry::from_response(&key, &response)
    }

    #[test]
    fn test_request_key_ignores_fragment() {
        let a = RequestKey::get(&url("https://example.com/c#top"));
        let b = RequestKey::get(&url("https://example.com/c"));
        assert_eq!(a, b);
        assert_ne!(a, RequestKey::new(&Method::HEAD, &url("https://example.com/c")));
    }

    #[test]
    fn test_cache() {
        let mut cache = Cache::new("v1");
        cache.put(entry("https://example.com/style.css", b"body{}")).unwrap();

        assert!(cache
            .match_request(&RequestKey::get(&url("https://example.com/style.css")))
            .is_some());
        assert!(cache
            .match_request(&RequestKey::get(&url("https://example.com/other.css")))
            .is_none());
    }

    #[test]
    fn test_cache_delete() {
        let mut cache = Cache::new("v1");
        let key = RequestKey::get(&url("https://example.com/style.css"));

        cache.put(entry("https://example.com/style.css", b"body{}")).unwrap();
        assert!(cache.delete(&key));
        assert!(cache.match_request(&key).is_none());
        assert!(!cache.delete(&key));
    }

    #[test]
    fn test_entry_round_trips_to_response() {
        let e = entry("https://example.com/style.css", b"body{}");
        let response = e.to_response().unwrap();

        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(response.header("content-type"), Some("text/css"));
        assert_eq!(&response.body[..], b"body{}");
    }

    #[test]
    fn test_corrupt_entry_is_a_miss() {
        let mut e = entry("https://example.com/style.css", b"");
        e.status = 9999;
        assert!(e.to_response().is_none());
    }

    #[test]
    fn test_put_respects_quota() {
        let mut cache = Cache::new("v1");
        let small = entry("https://example.com/a.css", b"a");
        cache.set_quota(Some(small.size() + 4));

        cache.put(small.clone()).unwrap();
        // Replacing an entry only counts the difference.
        cache.put(small).unwrap();

        let err = cache
            .put(entry("https://example.com/b.css", b"bbbbbbbb"))
            .unwrap_err();
        assert!(matches!(err, CacheError::QuotaExceeded { .. }));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_add_all_is_all_or_nothing() {
        let mut cache = Cache::new("v1");
        let a = entry("https://example.com/a.css", b"aaaa");
        cache.set_quota(Some(a.size() + 1));

        let result = cache.add_all(vec![a, entry("https://example.com/b.css", b"bbbb")]);
        assert!(result.is_err());
        assert!(cache.is_empty());

        cache.set_quota(None);
        cache
            .add_all(vec![
                entry("https://example.com/a.css", b"aaaa"),
                entry("https://example.com/b.css", b"bbbb"),
            ])
            .unwrap();
        assert_eq!(cache.keys().len(), 2);
    }

    #[test]
    fn test_cache_storage() {
        let mut storage = CacheStorage::new();

        assert!(!storage.has("v1"));

        storage.open("v1");
        assert!(storage.has("v1"));
        assert_eq!(storage.keys(), vec!["v1"]);

        assert!(storage.delete("v1"));
        assert!(!storage.has("v1"));
    }

    #[test]
    fn test_storage_match_across_caches() {
        let mut storage = CacheStorage::new();
        storage.open("v1");
        storage
            .open("v2")
            .put(entry("https://example.com/a.css", b"a"))
            .unwrap();

        let key = RequestKey::get(&url("https://example.com/a.css"));
        assert!(storage.match_request(&key).is_some());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("caches.json");

        let mut storage = CacheStorage::new();
        storage
            .open_with_quota("v3", Some(4096))
            .put(entry("https://example.com/style.css", b"\x00\xffbinary"))
            .unwrap();
        storage.save(&path).unwrap();

        let loaded = CacheStorage::load(&path).unwrap();
        let cache = loaded.get("v3").unwrap();
        assert_eq!(cache.quota(), Some(4096));

        let key = RequestKey::get(&url("https://example.com/style.css"));
        let restored = cache.match_request(&key).unwrap();
        assert_eq!(&restored.body[..], b"\x00\xffbinary");
        assert_eq!(restored.headers, vec![("content-type".to_string(), "text/css".to_string())]);
    }

    #[test]
    fn test_load_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let storage = CacheStorage::load(&dir.path().join("absent.json")).unwrap();
        assert!(storage.keys().is_empty());
    }

    #[test]
    fn test_load_rejects_unknown_version() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("caches.json");
        fs::write(&path, r#"{"version":99,"caches":[]}"#).unwrap();

        assert!(matches!(
            CacheStorage::load(&path),
            Err(CacheError::SnapshotVersion(99))
        ));
    }
}
