use axum::http::HeaderMap;
use std::net::IpAddr;

/// Snapshot of the inbound request fields the decision engine consumes.
/// Immutable once built; the only mutations the engine performs are on the
/// forwarded header set it derives (see `normalize`).
#[derive(Debug, Clone)]
pub struct RequestMeta {
    pub client_ip: IpAddr,
    pub method: String,
    pub path: String,
    pub query: String,
    pub headers: HeaderMap,
}

impl RequestMeta {
    pub fn new(
        client_ip: IpAddr,
        method: impl Into<String>,
        path: impl Into<String>,
        query: impl Into<String>,
        headers: HeaderMap,
    ) -> Self {
        Self {
            client_ip,
            method: method.into(),
            path: path.into(),
            query: query.into(),
            headers,
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn user_agent(&self) -> &str {
        self.header("user-agent").unwrap_or("")
    }

    /// Path plus query string, the URL identity a cache key derives from.
    pub fn path_and_query(&self) -> String {
        if self.query.is_empty() {
            self.path.clone()
        } else {
            format!("{}?{}", self.path, self.query)
        }
    }
}
