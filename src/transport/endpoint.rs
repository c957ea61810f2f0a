use crate::config::EndpointConfig;

/// Precomputed URLs and headers for the upstream endpoint.
#[derive(Debug, Clone)]
pub struct Endpoint {
    base: String,
    chat_completions_url: String,
    api_key: String,
    auth_headers: http::HeaderMap,
    json_headers: http::HeaderMap,
    sse_headers: http::HeaderMap,
}

impl Endpoint {
    /// Build the endpoint cache. A trailing `/` on `base_url` is ignored.
    #[must_use]
    pub fn new(base_url: &str, api_key: &str) -> Self {
        let base = base_url.trim().trim_end_matches('/').to_string();
        let chat_completions_url = format!("{base}/chat/completions");

        let mut auth_headers = http::HeaderMap::new();
        if !api_key.is_empty() {
            if let Ok(val) = http::HeaderValue::from_str(&format!("Bearer {api_key}")) {
                auth_headers.insert(http::header::AUTHORIZATION, val);
            }
        }

        let mut json_headers = auth_headers.clone();
        json_headers.insert(
            http::header::CONTENT_TYPE,
            http::HeaderValue::from_static("application/json"),
        );

        let mut sse_headers = json_headers.clone();
        sse_headers.insert(
            http::header::ACCEPT,
            http::HeaderValue::from_static("text/event-stream"),
        );

        Self {
            base,
            chat_completions_url,
            api_key: api_key.to_string(),
            auth_headers,
            json_headers,
            sse_headers,
        }
    }

    #[must_use]
    pub fn from_config(config: &EndpointConfig) -> Self {
        Self::new(&config.base_url, &config.api_key)
    }

    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base
    }

    #[must_use]
    pub fn api_key(&self) -> &str {
        &self.api_key
    }

    /// `<base>/chat/completions`.
    #[must_use]
    pub fn chat_completions_url(&self) -> &str {
        &self.chat_completions_url
    }

    /// Join a sibling path (`/models`, `/files/list`, ...) onto the base URL.
    #[must_use]
    pub fn url(&self, path: &str) -> String {
        let path = path.trim_start_matches('/');
        let mut out = String::with_capacity(self.base.len() + path.len() + 1);
        out.push_str(&self.base);
        out.push('/');
        out.push_str(path);
        out
    }

    /// `Authorization` only; used for GETs and raw uploads.
    #[must_use]
    pub fn auth_headers(&self) -> &http::HeaderMap {
        &self.auth_headers
    }

    /// Authorization plus `Content-Type: application/json`.
    #[must_use]
    pub fn json_headers(&self) -> &http::HeaderMap {
        &self.json_headers
    }

    /// JSON headers plus `Accept: text/event-stream`.
    #[must_use]
    pub fn sse_headers(&self) -> &http::HeaderMap {
        &self.sse_headers
    }
}
