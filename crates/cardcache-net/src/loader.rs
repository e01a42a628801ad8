//! `reqwest`-backed [`Fetcher`].

use std::time::Duration;

use reqwest::Client;
use tracing::{debug, info, trace};

use crate::{FetchFuture, Fetcher, NetError, Request, Response};

/// HTTP fetcher configuration.
#[derive(Debug, Clone)]
pub struct FetcherConfig {
    /// User agent string.
    pub user_agent: String,
    /// Accept-Language header.
    pub accept_language: String,
    /// Per-request timeout.
    pub timeout: Duration,
    /// Maximum redirects.
    pub max_redirects: usize,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            user_agent: format!("CardCache/{}", env!("CARGO_PKG_VERSION")),
            accept_language: "en-US,en;q=0.9".to_string(),
            timeout: Duration::from_secs(30),
            max_redirects: 10,
        }
    }
}

/// Fetches requests over HTTP(S).
pub struct HttpFetcher {
    client: Client,
    config: FetcherConfig,
}

impl HttpFetcher {
    /// Create a new fetcher.
    pub fn new(config: FetcherConfig) -> Result<Self, NetError> {
        let client = Client::builder()
            .user_agent(&config.user_agent)
            .timeout(config.timeout)
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects))
            .build()
            .map_err(|e| NetError::RequestFailed(e.to_string()))?;

        info!(timeout = ?config.timeout, "HttpFetcher initialized");

        Ok(Self { client, config })
    }

    async fn send(&self, request: &Request) -> Result<Response, NetError> {
        debug!(url = %request.url, method = %request.method, mode = ?request.mode, "Fetching");

        let mut builder = self
            .client
            .request(request.method.clone(), request.url.clone())
            .header("Accept-Language", &self.config.accept_language);

        for (name, value) in request.headers.iter() {
            builder = builder.header(name, value);
        }

        let response = builder.send().await.map_err(|e| self.map_error(e))?;

        let status = response.status();
        let headers = response.headers().clone();
        let url = response.url().clone();
        let body = response.bytes().await.map_err(|e| self.map_error(e))?;

        trace!(url = %url, status = %status, body_len = body.len(), "Response received");

        Ok(Response {
            url,
            status,
            headers,
            body,
        })
    }

    fn map_error(&self, error: reqwest::Error) -> NetError {
        if error.is_timeout() {
            NetError::Timeout(self.config.timeout)
        } else {
            NetError::Http(error)
        }
    }
}

impl Fetcher for HttpFetcher {
    fn fetch<'a>(&'a self, request: &'a Request) -> FetchFuture<'a> {
        Box::pin(self.send(request))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use url::Url;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn fetcher() -> HttpFetcher {
        HttpFetcher::new(FetcherConfig {
            timeout: Duration::from_millis(500),
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_fetcher_config_default() {
        let config = FetcherConfig::default();
        assert!(config.user_agent.starts_with("CardCache/"));
        assert_eq!(config.max_redirects, 10);
    }

    #[tokio::test]
    async fn test_fetch_success() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/static/style.css"))
            .and(header("accept-language", "en-US,en;q=0.9"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/css")
                    .set_body_string("body{}"),
            )
            .mount(&server)
            .await;

        let url = Url::parse(&format!("{}/static/style.css", server.uri())).unwrap();
        let response = fetcher().fetch(&Request::get(url)).await.unwrap();

        assert!(response.ok());
        assert_eq!(response.header("content-type"), Some("text/css"));
        assert_eq!(response.text().unwrap(), "body{}");
    }

    #[tokio::test]
    async fn test_http_error_is_a_response() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let url = Url::parse(&format!("{}/missing.png", server.uri())).unwrap();
        let response = fetcher().fetch(&Request::get(url)).await.unwrap();

        assert!(!response.ok());
        assert_eq!(response.status.as_u16(), 404);
    }

    #[tokio::test]
    async fn test_timeout() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(5)))
            .mount(&server)
            .await;

        let url = Url::parse(&format!("{}/slow", server.uri())).unwrap();
        let result = fetcher().fetch(&Request::get(url)).await;

        assert!(matches!(result, Err(NetError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_connection_refused() {
        let server = MockServer::start().await;
        let uri = server.uri();
        drop(server);

        let url = Url::parse(&format!("{uri}/")).unwrap();
        let result = fetcher().fetch(&Request::navigate(url)).await;

        assert!(matches!(result, Err(NetError::Http(_))));
    }
}
