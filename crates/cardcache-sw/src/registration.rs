//! Worker records and the registration that holds them.
//!
//! ```text
//! ServiceWorkerRegistration (scope)
//!     ├── installing (ServiceWorker)
//!     ├── waiting    (ServiceWorker)
//!     └── active     (ServiceWorker)
//! ```
//!
//! A worker moves `Parsed → Installing → Installed → Activating → Activated`.
//! A failed install, or being replaced, makes it `Redundant`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::ServiceWorkerError;

/// Unique identifier for a service worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServiceWorkerId(u64);

impl ServiceWorkerId {
    fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// Service worker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ServiceWorkerState {
    /// Created, install not started.
    #[default]
    Parsed,
    /// Installing (install event).
    Installing,
    /// Installed but waiting for activation.
    Installed,
    /// Activating (activate event).
    Activating,
    /// Active and controlling pages.
    Activated,
    /// Redundant (replaced or install failed).
    Redundant,
}

/// A service worker instance, one per deployed cache version.
#[derive(Debug, Clone)]
pub struct ServiceWorker {
    /// Unique ID.
    pub id: ServiceWorkerId,

    /// Cache store this version owns.
    pub cache_name: String,

    /// Current state.
    pub state: ServiceWorkerState,

    /// Error message if install failed.
    pub error: Option<String>,

    /// Time of last state change.
    pub state_changed_at: Instant,
}

impl ServiceWorker {
    /// Create a new service worker.
    pub fn new(cache_name: &str) -> Self {
        Self {
            id: ServiceWorkerId::new(),
            cache_name: cache_name.to_string(),
            state: ServiceWorkerState::Parsed,
            error: None,
            state_changed_at: Instant::now(),
        }
    }

    /// Set state.
    pub fn set_state(&mut self, state: ServiceWorkerState) {
        self.state = state;
        self.state_changed_at = Instant::now();
    }

    /// Check if active.
    pub fn is_active(&self) -> bool {
        self.state == ServiceWorkerState::Activated
    }

    /// Check if redundant.
    pub fn is_redundant(&self) -> bool {
        self.state == ServiceWorkerState::Redundant
    }
}

/// The registration for one scope.
#[derive(Debug)]
pub struct ServiceWorkerRegistration {
    /// Scope URL.
    pub scope: Url,

    /// Installing worker.
    pub installing: Option<ServiceWorker>,

    /// Waiting worker (installed but not active).
    pub waiting: Option<ServiceWorker>,

    /// Active worker.
    pub active: Option<ServiceWorker>,

    /// Last update time.
    pub last_update: Option<Instant>,
}

impl ServiceWorkerRegistration {
    /// Create a new registration.
    pub fn new(scope: Url) -> Self {
        Self {
            scope,
            installing: None,
            waiting: None,
            active: None,
            last_update: None,
        }
    }

    /// Get the active worker.
    pub fn get_active(&self) -> Option<&ServiceWorker> {
        self.active.as_ref()
    }

    /// Start installing a new version.
    ///
    /// Returns the new worker's id and the installing worker it superseded,
    /// which is now redundant.
    pub fn begin_install(
        &mut self,
        cache_name: &str,
    ) -> (ServiceWorkerId, Option<ServiceWorker>) {
        let superseded = self.installing.take().map(|mut old| {
            old.set_state(ServiceWorkerState::Redundant);
            old
        });

        let mut worker = ServiceWorker::new(cache_name);
        worker.set_state(ServiceWorkerState::Installing);
        let id = worker.id;

        self.installing = Some(worker);
        self.last_update = Some(Instant::now());
        (id, superseded)
    }

    /// Transition installing to waiting.
    ///
    /// Returns the previously waiting worker, which is now redundant.
    pub fn install_complete(
        &mut self,
        id: ServiceWorkerId,
    ) -> Result<Option<ServiceWorker>, ServiceWorkerError> {
        let mut worker = self.take_installing(id)?;
        worker.set_state(ServiceWorkerState::Installed);

        let replaced = self.waiting.replace(worker).map(|mut old| {
            old.set_state(ServiceWorkerState::Redundant);
            old
        });
        Ok(replaced)
    }

    /// Discard the installing worker after a failed install.
    pub fn install_failed(
        &mut self,
        id: ServiceWorkerId,
        reason: &str,
    ) -> Result<ServiceWorker, ServiceWorkerError> {
        let mut worker = self.take_installing(id)?;
        worker.error = Some(reason.to_string());
        worker.set_state(ServiceWorkerState::Redundant);
        Ok(worker)
    }

    /// Promote the waiting worker to active, in the `Activating` state.
    ///
    /// Returns the previously active worker, which is now redundant.
    pub fn begin_activate(
        &mut self,
        id: ServiceWorkerId,
    ) -> Result<Option<ServiceWorker>, ServiceWorkerError> {
        let mut worker = match self.waiting.take() {
            Some(worker) if worker.id == id => worker,
            other => {
                self.waiting = other;
                return Err(ServiceWorkerError::StateError(format!(
                    "worker {} is not waiting",
                    id.raw()
                )));
            }
        };
        worker.set_state(ServiceWorkerState::Activating);

        let old = self.active.replace(worker).map(|mut old| {
            old.set_state(ServiceWorkerState::Redundant);
            old
        });
        Ok(old)
    }

    /// Finish activation of the active worker.
    pub fn activate_complete(&mut self, id: ServiceWorkerId) -> Result<(), ServiceWorkerError> {
        match self.active.as_mut() {
            Some(worker) if worker.id == id && worker.state == ServiceWorkerState::Activating => {
                worker.set_state(ServiceWorkerState::Activated);
                Ok(())
            }
            _ => Err(ServiceWorkerError::StateError(format!(
                "worker {} is not activating",
                id.raw()
            ))),
        }
    }

    /// Bring back a version whose cache store survived a restart.
    ///
    /// The worker goes straight to `Activated` without an install. Fails if
    /// a worker is already active.
    pub fn restore_active(
        &mut self,
        cache_name: &str,
    ) -> Result<ServiceWorkerId, ServiceWorkerError> {
        if let Some(active) = &self.active {
            return Err(ServiceWorkerError::StateError(format!(
                "worker {} is already active",
                active.id.raw()
            )));
        }

        let mut worker = ServiceWorker::new(cache_name);
        worker.set_state(ServiceWorkerState::Activated);
        let id = worker.id;

        self.active = Some(worker);
        self.last_update = Some(Instant::now());
        Ok(id)
    }

    fn take_installing(&mut self, id: ServiceWorkerId) -> Result<ServiceWorker, ServiceWorkerError> {
        match self.installing.take() {
            Some(worker) if worker.id == id => Ok(worker),
            other => {
                self.installing = other;
                Err(ServiceWorkerError::StateError(format!(
                    "worker {} is not installing",
                    id.raw()
                )))
            }
        }
    }
}
