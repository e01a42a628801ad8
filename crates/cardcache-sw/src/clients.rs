//! Clients API: the pages a worker may control.

use std::sync::atomic::{AtomicU64, Ordering};

use hashbrown::HashMap;
use url::Url;

use crate::registration::ServiceWorkerId;
use crate::ServiceWorkerError;

/// A client (open page).
#[derive(Debug, Clone)]
pub struct Client {
    /// Client ID.
    pub id: String,

    /// Client URL.
    pub url: Url,

    /// Worker controlling this page, if any.
    pub controller: Option<ServiceWorkerId>,
}

/// Clients API.
#[derive(Debug, Default)]
pub struct Clients {
    clients: HashMap<String, Client>,
}

impl Clients {
    /// Create new clients manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a client by ID.
    pub fn get(&self, id: &str) -> Option<&Client> {
        self.clients.get(id)
    }

    /// Number of open clients.
    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Open a page at `url`, controlled by `controller` from the start.
    pub fn open_window(
        &mut self,
        url: &str,
        controller: Option<ServiceWorkerId>,
    ) -> Result<Client, ServiceWorkerError> {
        let url = Url::parse(url)
            .map_err(|e| ServiceWorkerError::StateError(format!("invalid client URL: {e}")))?;

        let client = Client {
            id: next_client_id(),
            url,
            controller,
        };

        self.clients.insert(client.id.clone(), client.clone());
        Ok(client)
    }

    /// Make `worker` the controller of every client inside `scope`.
    ///
    /// Returns the ids of clients whose controller changed.
    pub fn claim(&mut self, worker: ServiceWorkerId, scope: &Url) -> Vec<String> {
        let mut changed = Vec::new();
        for client in self.clients.values_mut() {
            if !client.url.as_str().starts_with(scope.as_str()) {
                continue;
            }
            if client.controller != Some(worker) {
                client.controller = Some(worker);
                changed.push(client.id.clone());
            }
        }
        changed
    }

    /// Remove a client.
    pub fn remove(&mut self, id: &str) -> Option<Client> {
        self.clients.remove(id)
    }
}

fn next_client_id() -> String {
    static COUNTER: AtomicU64 = AtomicU64::new(1);
    format!("client-{}", COUNTER.fetch_add(1, Ordering::Relaxed))
}
