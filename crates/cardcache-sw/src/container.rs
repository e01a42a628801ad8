//! Service worker container: one registration, its workers, and the router of
//! whichever version is active.

use std::sync::Arc;

use cardcache_net::{Fetcher, Request};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::CacheStorage;
use crate::clients::{Client, Clients};
use crate::config::CacheConfig;
use crate::lifecycle::{ActivateReport, LifecycleController};
use crate::registration::{
    ServiceWorker, ServiceWorkerId, ServiceWorkerRegistration, ServiceWorkerState,
};
use crate::router::{FetchOutcome, Router};
use crate::ServiceWorkerError;

/// Service worker events.
#[derive(Debug, Clone)]
pub enum ServiceWorkerEvent {
    /// State changed.
    StateChange {
        worker_id: ServiceWorkerId,
        cache_name: String,
        new_state: ServiceWorkerState,
    },
    /// A new version started installing.
    UpdateFound { worker_id: ServiceWorkerId },
    /// Install failed; the worker is redundant.
    InstallFailed {
        worker_id: ServiceWorkerId,
        reason: String,
    },
    /// A page got a new controller.
    ControllerChange {
        client_id: String,
        worker_id: ServiceWorkerId,
    },
}

/// An installed-but-waiting version, with what it needs to activate.
struct Pending {
    id: ServiceWorkerId,
    controller: LifecycleController,
    router: Arc<Router>,
}

/// Hosts the workers for one scope.
pub struct ServiceWorkerContainer {
    scope: Url,
    registration: RwLock<ServiceWorkerRegistration>,
    caches: Arc<RwLock<CacheStorage>>,
    clients: RwLock<Clients>,
    fetcher: Arc<dyn Fetcher>,
    router: RwLock<Option<Arc<Router>>>,
    waiting: RwLock<Option<Pending>>,
    event_tx: mpsc::UnboundedSender<ServiceWorkerEvent>,
}

impl ServiceWorkerContainer {
    /// Create a container over `caches`, which may already hold stores from
    /// an earlier run.
    pub fn new(
        scope: Url,
        caches: Arc<RwLock<CacheStorage>>,
        fetcher: Arc<dyn Fetcher>,
    ) -> (Self, mpsc::UnboundedReceiver<ServiceWorkerEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        (
            Self {
                registration: RwLock::new(ServiceWorkerRegistration::new(scope.clone())),
                scope,
                caches,
                clients: RwLock::new(Clients::new()),
                fetcher,
                router: RwLock::new(None),
                waiting: RwLock::new(None),
                event_tx,
            },
            event_rx,
        )
    }

    pub fn scope(&self) -> &Url {
        &self.scope
    }

    /// Shared cache storage.
    pub fn caches(&self) -> Arc<RwLock<CacheStorage>> {
        Arc::clone(&self.caches)
    }

    /// Register and install a worker version.
    ///
    /// On install failure the error is returned, the new worker is redundant
    /// and the active version keeps serving. With `skip_waiting` the new
    /// version is activated right away; otherwise it waits for
    /// [`activate_waiting`](Self::activate_waiting).
    pub async fn register(&self, config: CacheConfig) -> Result<ServiceWorkerId, ServiceWorkerError> {
        config.validate()?;
        self.check_scope(&config)?;
        let config = Arc::new(config);

        let (id, superseded) = self
            .registration
            .write()
            .await
            .begin_install(&config.cache_name);
        if let Some(old) = superseded {
            self.emit_state(&old);
        }
        let _ = self.event_tx.send(ServiceWorkerEvent::UpdateFound { worker_id: id });
        self.emit(id, &config.cache_name, ServiceWorkerState::Installing);

        let controller = LifecycleController::new(
            Arc::clone(&config),
            Arc::clone(&self.caches),
            Arc::clone(&self.fetcher),
        );

        if let Err(e) = controller.install().await {
            warn!(worker = id.raw(), cache = %config.cache_name, error = %e, "Install failed");
            if let Ok(worker) = self.registration.write().await.install_failed(id, &e.to_string()) {
                self.emit_state(&worker);
            }
            let _ = self.event_tx.send(ServiceWorkerEvent::InstallFailed {
                worker_id: id,
                reason: e.to_string(),
            });
            return Err(e);
        }

        let replaced = self.registration.write().await.install_complete(id)?;
        if let Some(old) = replaced {
            self.emit_state(&old);
        }
        self.emit(id, &config.cache_name, ServiceWorkerState::Installed);

        let router = Arc::new(Router::new(
            Arc::clone(&config),
            Arc::clone(&self.caches),
            Arc::clone(&self.fetcher),
        ));
        *self.waiting.write().await = Some(Pending {
            id,
            controller,
            router,
        });

        if config.skip_waiting {
            self.activate_waiting().await?;
        } else {
            info!(worker = id.raw(), cache = %config.cache_name, "Installed, waiting");
        }
        Ok(id)
    }

    /// Resume the version described by `config` from a cache store that
    /// survived a restart, without installing it again.
    ///
    /// Returns `None` when the store is missing; the caller should
    /// [`register`](Self::register) instead. Open pages in scope are claimed,
    /// other stores are left alone.
    pub async fn restore(
        &self,
        config: CacheConfig,
    ) -> Result<Option<ServiceWorkerId>, ServiceWorkerError> {
        config.validate()?;
        self.check_scope(&config)?;

        if !self.caches.read().await.has(&config.cache_name) {
            debug!(cache = %config.cache_name, "No cache store to restore");
            return Ok(None);
        }

        let id = self
            .registration
            .write()
            .await
            .restore_active(&config.cache_name)?;
        let config = Arc::new(config);
        *self.router.write().await = Some(Arc::new(Router::new(
            Arc::clone(&config),
            Arc::clone(&self.caches),
            Arc::clone(&self.fetcher),
        )));
        self.emit(id, &config.cache_name, ServiceWorkerState::Activated);

        let claimed = self.clients.write().await.claim(id, &config.scope);
        for client_id in claimed {
            let _ = self.event_tx.send(ServiceWorkerEvent::ControllerChange {
                client_id,
                worker_id: id,
            });
        }

        info!(worker = id.raw(), cache = %config.cache_name, "Restored from cache store");
        Ok(Some(id))
    }

    /// Activate the waiting worker, if any.
    pub async fn activate_waiting(&self) -> Result<Option<ActivateReport>, ServiceWorkerError> {
        let Some(pending) = self.waiting.write().await.take() else {
            return Ok(None);
        };
        let cache_name = pending.router.config().cache_name.clone();

        let old = self.registration.write().await.begin_activate(pending.id)?;
        if let Some(old) = old {
            self.emit_state(&old);
        }
        self.emit(pending.id, &cache_name, ServiceWorkerState::Activating);

        // New requests route through the new version from here on.
        *self.router.write().await = Some(pending.router);

        let report = pending.controller.activate(pending.id, &self.clients).await;
        for client_id in &report.claimed {
            let _ = self.event_tx.send(ServiceWorkerEvent::ControllerChange {
                client_id: client_id.clone(),
                worker_id: pending.id,
            });
        }

        self.registration.write().await.activate_complete(pending.id)?;
        self.emit(pending.id, &cache_name, ServiceWorkerState::Activated);

        Ok(Some(report))
    }

    /// Route an intercepted request through the active version.
    ///
    /// Without an active version nothing is intercepted.
    pub async fn handle_fetch(&self, request: &Request) -> FetchOutcome {
        let router = self.router.read().await.clone();
        match router {
            Some(router) => router.handle(request).await,
            None => FetchOutcome::Passthrough,
        }
    }

    /// Wait for the active version's pending cache write-backs.
    pub async fn settle(&self) {
        let router = self.router.read().await.clone();
        if let Some(router) = router {
            router.settle().await;
        }
    }

    /// The active worker, if any.
    pub async fn active(&self) -> Option<ServiceWorker> {
        self.registration.read().await.get_active().cloned()
    }

    /// The waiting worker, if any.
    pub async fn waiting(&self) -> Option<ServiceWorker> {
        self.registration.read().await.waiting.clone()
    }

    /// A page opened inside the scope. New pages are controlled by the active
    /// worker from the start.
    pub async fn open_client(&self, url: &str) -> Result<Client, ServiceWorkerError> {
        let controller = self
            .active()
            .await
            .filter(ServiceWorker::is_active)
            .map(|w| w.id);
        self.clients.write().await.open_window(url, controller)
    }

    /// Look up a page.
    pub async fn client(&self, id: &str) -> Option<Client> {
        self.clients.read().await.get(id).cloned()
    }

    /// A page closed.
    pub async fn close_client(&self, id: &str) -> Option<Client> {
        self.clients.write().await.remove(id)
    }

    fn check_scope(&self, config: &CacheConfig) -> Result<(), ServiceWorkerError> {
        if config.scope != self.scope {
            return Err(ServiceWorkerError::Config(format!(
                "worker scope {} does not match container scope {}",
                config.scope, self.scope
            )));
        }
        Ok(())
    }

    fn emit(&self, worker_id: ServiceWorkerId, cache_name: &str, new_state: ServiceWorkerState) {
        info!(worker = worker_id.raw(), cache = %cache_name, state = ?new_state, "Worker state changed");
        let _ = self.event_tx.send(ServiceWorkerEvent::StateChange {
            worker_id,
            cache_name: cache_name.to_string(),
            new_state,
        });
    }

    fn emit_state(&self, worker: &ServiceWorker) {
        self.emit(worker.id, &worker.cache_name, worker.state);
    }
}
