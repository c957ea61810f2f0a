mod endpoint;
mod http_transport;

pub use endpoint::Endpoint;
pub use http_transport::HttpTransport;

/// Bound on cached parsed URLs; the cache is cleared when it fills up.
pub(crate) const PARSED_URL_CACHE_MAX_ENTRIES: usize = 64;
