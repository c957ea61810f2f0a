use std::sync::{Arc, OnceLock};
use std::time::Duration;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use crate::config::EndpointConfig;
use crate::error::ChatError;

use super::PARSED_URL_CACHE_MAX_ENTRIES;

fn build_reqwest_client(
    pool_max_idle_per_host: usize,
    pool_idle_timeout: Option<Duration>,
    connect_timeout: Duration,
    read_timeout: Duration,
    use_env_proxy: bool,
) -> Result<reqwest::Client, ChatError> {
    // No total timeout: a streamed completion may legitimately run for minutes.
    let mut builder = reqwest::Client::builder()
        .pool_max_idle_per_host(pool_max_idle_per_host)
        .pool_idle_timeout(pool_idle_timeout)
        .tcp_nodelay(true)
        .connect_timeout(connect_timeout)
        .read_timeout(read_timeout)
        .redirect(reqwest::redirect::Policy::none());

    if !use_env_proxy {
        builder = builder.no_proxy();
    }

    builder
        .build()
        .map_err(|err| ChatError::Transport(format!("Failed to build HTTP client: {err}")))
}

/// HTTP transport for the single upstream endpoint.
///
/// One pooled client is built lazily on first use and shared by completions,
/// capability fetches and uploads. Requests are sent exactly once: there is no
/// retry or backoff layer.
pub struct HttpTransport {
    client: OnceLock<Arc<reqwest::Client>>,
    parsed_url_cache: RwLock<FxHashMap<String, Arc<url::Url>>>,
    pool_max_idle_per_host: usize,
    pool_idle_timeout: Option<Duration>,
    connect_timeout: Duration,
    read_timeout: Duration,
    use_env_proxy: bool,
}

impl HttpTransport {
    /// Create a new transport with connection pooling and timeouts from the endpoint config.
    #[must_use]
    pub fn new(config: &EndpointConfig) -> Self {
        let pool_idle_timeout = if config.http_pool_idle_timeout_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(config.http_pool_idle_timeout_secs))
        };
        Self {
            client: OnceLock::new(),
            parsed_url_cache: RwLock::new(FxHashMap::default()),
            pool_max_idle_per_host: config.http_pool_max_idle_per_host.max(1),
            pool_idle_timeout,
            connect_timeout: Duration::from_secs(config.connect_timeout_secs),
            read_timeout: Duration::from_secs(config.timeout_secs),
            use_env_proxy: config.http_use_env_proxy,
        }
    }

    fn build_client(&self) -> Arc<reqwest::Client> {
        match build_reqwest_client(
            self.pool_max_idle_per_host,
            self.pool_idle_timeout,
            self.connect_timeout,
            self.read_timeout,
            self.use_env_proxy,
        ) {
            Ok(client) => Arc::new(client),
            Err(err) => {
                tracing::error!(error = %err, "failed to build configured reqwest client, falling back to default client");
                Arc::new(reqwest::Client::new())
            }
        }
    }

    fn client(&self) -> Arc<reqwest::Client> {
        if let Some(existing) = self.client.get() {
            return existing.clone();
        }

        let built = self.build_client();
        let _ = self.client.set(built.clone());
        self.client.get().cloned().unwrap_or(built)
    }

    fn parsed_url(&self, url: &str) -> Result<Arc<url::Url>, ChatError> {
        if let Some(cached) = self.parsed_url_cache.read().get(url) {
            return Ok(cached.clone());
        }

        let parsed = url::Url::parse(url)
            .map_err(|e| ChatError::Transport(format!("Invalid upstream URL: {e}")))?;

        let mut cache = self.parsed_url_cache.write();
        if let Some(existing) = cache.get(url) {
            return Ok(existing.clone());
        }
        if cache.len() >= PARSED_URL_CACHE_MAX_ENTRIES {
            cache.clear();
        }
        let parsed = Arc::new(parsed);
        cache.insert(url.to_string(), parsed.clone());
        Ok(parsed)
    }

    /// Send one request and return the response with its body unread.
    ///
    /// The status code is not inspected; callers decide what counts as
    /// success.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::Transport`] when URL parsing fails or the request
    /// cannot be executed.
    pub async fn send(
        &self,
        method: http::Method,
        url: &str,
        headers: &http::HeaderMap,
        body: Option<reqwest::Body>,
    ) -> Result<reqwest::Response, ChatError> {
        let parsed_url = self.parsed_url(url)?;
        let mut request = reqwest::Request::new(method, parsed_url.as_ref().clone());
        *request.headers_mut() = headers.clone();
        *request.body_mut() = body;

        let client = self.client();
        client.execute(request).await.map_err(|err| {
            tracing::debug!(url = url, error = %err, "upstream request failed");
            ChatError::Transport(err.to_string())
        })
    }
}
