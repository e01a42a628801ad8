//! Scripted [`Fetcher`] for unit tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use bytes::Bytes;
use cardcache_net::{FetchFuture, Fetcher, NetError, Request, Response};
use hashbrown::HashMap;
use http::StatusCode;

#[derive(Clone)]
enum Script {
    Respond(StatusCode, &'static str),
    Fail,
    Hang,
}

/// Answers by URL. Unknown URLs fail like an unreachable network.
#[derive(Default)]
pub struct ScriptedFetcher {
    scripts: Mutex<HashMap<String, Script>>,
    offline: Mutex<bool>,
    calls: AtomicUsize,
}

impl ScriptedFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(self, url: &str, status: u16, body: &'static str) -> Self {
        self.set(url, Script::Respond(StatusCode::from_u16(status).unwrap(), body));
        self
    }

    pub fn fail(self, url: &str) -> Self {
        self.set(url, Script::Fail);
        self
    }

    pub fn hang(self, url: &str) -> Self {
        self.set(url, Script::Hang);
        self
    }

    /// Make every request fail from now on.
    pub fn go_offline(&self) {
        *self.offline.lock().unwrap() = true;
    }

    /// Number of fetches made so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn set(&self, url: &str, script: Script) {
        self.scripts.lock().unwrap().insert(url.to_string(), script);
    }
}

impl Fetcher for ScriptedFetcher {
    fn fetch<'a>(&'a self, request: &'a Request) -> FetchFuture<'a> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let script = if *self.offline.lock().unwrap() {
            Script::Fail
        } else {
            self.scripts
                .lock()
                .unwrap()
                .get(request.url.as_str())
                .cloned()
                .unwrap_or(Script::Fail)
        };
        let url = request.url.clone();

        Box::pin(async move {
            match script {
                Script::Respond(status, body) => {
                    Ok(Response::new(url, status, Bytes::from_static(body.as_bytes())))
                }
                Script::Fail => Err(NetError::RequestFailed(format!("unreachable: {url}"))),
                Script::Hang => futures::future::pending().await,
            }
        })
    }
}
