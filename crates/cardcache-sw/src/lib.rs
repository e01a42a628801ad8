//! # CardCache Service Worker
//!
//! Offline cache manager for the business card web app: a proxy at the
//! origin scope that intercepts page requests and answers them from a
//! versioned cache store or the network.
//!
//! ## Features
//!
//! - **Lifecycle**: install (app shell pre-cache, all or nothing), activate
//!   (old versions purged, open pages claimed)
//! - **Cache API**: named stores of request/response pairs, optional quota,
//!   JSON snapshots so stores survive restarts
//! - **Fetch interception**: per-class strategies (see [`router`])
//! - **Offline page**: self-contained HTML served when navigation fails
//!
//! ## Architecture
//!
//! ```text
//! ServiceWorkerContainer
//!     ├── ServiceWorkerRegistration (installing / waiting / active)
//!     ├── Clients
//!     ├── Router (active version) ──► Fetcher (network)
//!     └── CacheStorage ◄── LifecycleController
//! ```

use thiserror::Error;

pub mod cache;
pub mod clients;
pub mod config;
pub mod container;
pub mod lifecycle;
pub mod offline;
pub mod registration;
pub mod router;

#[cfg(test)]
mod testing;

pub use cache::{Cache, CacheEntry, CacheError, CacheStorage, RequestKey};
pub use clients::{Client, Clients};
pub use config::CacheConfig;
pub use container::{ServiceWorkerContainer, ServiceWorkerEvent};
pub use lifecycle::{ActivateReport, InstallReport, LifecycleController};
pub use offline::{
    MessageCatalog, OfflineTemplate, StaticCatalog, DEFAULT_LANG, DEFAULT_OFFLINE_TEMPLATE,
};
pub use registration::{
    ServiceWorker, ServiceWorkerId, ServiceWorkerRegistration, ServiceWorkerState,
};
pub use router::{FetchOutcome, RequestClass, Router};

/// Errors that can occur in service worker operations.
#[derive(Error, Debug)]
pub enum ServiceWorkerError {
    #[error("Install failed fetching {url}: {reason}")]
    InstallFailed { url: String, reason: String },

    #[error("State error: {0}")]
    StateError(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),
}
