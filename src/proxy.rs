use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::{
    body::Body,
    extract::{ConnectInfo, Request, State},
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::any,
    Router,
};
use bytes::Bytes;
use http_body_util::BodyExt;
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::cache::{CacheStore, StoredResponse};
use crate::classify::{classify, Classification};
use crate::config::{Config, ServerConfig};
use crate::error::{GateError, Result as GateResult};
use crate::normalize::{normalize, NormalizedHeaders};
use crate::policy::{CachePolicyEngine, PostDecision, PreDecision, ResponseMeta};
use crate::pool::{AdmissionPermit, BackendPool, PoolRegistry};
use crate::purge::PurgeAuthority;
use crate::request::RequestMeta;
use crate::router::BackendRouter;

/// Response coming back from the origin, before the storage decision.
struct OriginResponse {
    status: u16,
    headers: HeaderMap,
    body: Bytes,
}

/// The request pipeline: classification, purge handling, cache decisions,
/// pool admission and origin forwarding, wired in front of an axum server.
pub struct Gatekeeper {
    registry: Arc<PoolRegistry>,
    router: BackendRouter,
    policy: CachePolicyEngine,
    cache: Arc<CacheStore>,
    purge: PurgeAuthority,
    /// One origin client per pool, carrying that pool's network timeouts.
    clients: HashMap<String, reqwest::Client>,
}

#[derive(Clone)]
struct AppState {
    gatekeeper: Arc<Gatekeeper>,
}

impl Gatekeeper {
    pub fn new(config: &Config) -> Result<Arc<Self>> {
        let registry = Arc::new(PoolRegistry::from_config(&config.pools));
        let router = BackendRouter::new(&registry)?;
        let cache = Arc::new(CacheStore::new(&config.cache));
        let purge = PurgeAuthority::new(&config.purge);
        let policy = CachePolicyEngine::new(config.cache.default_ttl);

        let mut clients = HashMap::new();
        for pool in registry.all() {
            let cfg = pool.config();
            let client = reqwest::Client::builder()
                .connect_timeout(cfg.connect_timeout)
                // First-byte bound doubles as the overall request deadline.
                .timeout(cfg.first_byte_timeout)
                .read_timeout(cfg.between_bytes_timeout)
                .build()
                .map_err(|e| anyhow::anyhow!("Failed to build client for pool '{}': {}", cfg.name, e))?;
            clients.insert(cfg.name.clone(), client);
        }

        Ok(Arc::new(Self {
            registry,
            router,
            policy,
            cache,
            purge,
            clients,
        }))
    }

    /// Start the front server.
    pub async fn serve(self: Arc<Self>, server: &ServerConfig) -> GateResult<()> {
        let state = AppState { gatekeeper: self };

        let app = Router::new()
            .route("/*path", any(handle_request))
            .fallback(handle_request)
            .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()).into_inner())
            .with_state(state);

        let addr = format!("{}:{}", server.host, server.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| GateError::Internal(format!("Failed to bind to {}: {}", addr, e)))?;

        info!("Gatekeeper listening on {}", addr);

        axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
            .await
            .map_err(|e| GateError::Internal(format!("Server error: {}", e)))?;

        Ok(())
    }

    /// Process one request end to end.
    #[instrument(skip(self, meta, body), fields(request_id, client_ip = %meta.client_ip, method = %meta.method, path = %meta.path))]
    pub async fn process(&self, meta: RequestMeta, body: Bytes) -> GateResult<Response> {
        let request_id = Uuid::new_v4().to_string();
        tracing::Span::current().record("request_id", request_id.as_str());

        let classification = classify(&meta);
        let normalized = normalize(&meta, classification.device);
        let path_and_query = meta.path_and_query();

        match self.policy.pre_decide(&meta, &classification, &normalized) {
            PreDecision::Purge => {
                let removed = self
                    .purge
                    .execute(meta.client_ip, &path_and_query, &self.cache)
                    .await?;
                Ok((
                    StatusCode::OK,
                    axum::Json(serde_json::json!({
                        "purged": path_and_query,
                        "entries_removed": removed,
                    })),
                )
                    .into_response())
            }
            PreDecision::Pass { ban_first } => {
                if ban_first {
                    // The client refused cached content: invalidate so the
                    // next response is freshly stored, not merely bypassed.
                    self.cache.ban(&path_and_query).await;
                }
                self.fetch_and_respond(&meta, &classification, &normalized, body, &request_id, None)
                    .await
            }
            PreDecision::Hash { key } => {
                if let Some(hit) = self.cache.lookup(&key).await {
                    debug!("Serving cache hit for {}", key);
                    return Ok(build_cached_response(hit, &meta.method));
                }
                // Only responses fetched for GET are stored: a HEAD miss
                // fetches an empty body that must never be cached under
                // the key subsequent GETs share.
                let store_key = if meta.method == "GET" { Some(key) } else { None };
                self.fetch_and_respond(&meta, &classification, &normalized, body, &request_id, store_key)
                    .await
            }
        }
    }

    /// Miss/pass path: pooled admission where it applies, then the origin
    /// fetch, post-decision and optional store.
    async fn fetch_and_respond(
        &self,
        meta: &RequestMeta,
        classification: &Classification,
        normalized: &NormalizedHeaders,
        body: Bytes,
        request_id: &str,
        store_key: Option<String>,
    ) -> GateResult<Response> {
        let decision = self.router.route(meta, classification);

        let _permit: Option<AdmissionPermit> = if decision.admission {
            Some(decision.pool.clone().acquire().await?)
        } else {
            None
        };

        let origin = self
            .forward(meta, normalized, &decision.pool, body, request_id)
            .await?;

        let response_meta = ResponseMeta {
            status: origin.status,
            headers: origin.headers.clone(),
        };

        if let Some(key) = store_key {
            match self.policy.post_decide(&response_meta) {
                PostDecision::Cacheable { ttl } => {
                    let stored = StoredResponse {
                        status: origin.status,
                        headers: header_pairs(&origin.headers),
                        body: origin.body.clone(),
                    };
                    self.cache.store(key, stored, ttl).await;
                }
                PostDecision::Uncacheable { reason } => {
                    debug!("Response not stored: {:?}", reason);
                }
            }
        }

        Ok(build_origin_response(origin))
    }

    /// Forward the request to the pool's origin with the normalized and
    /// augmented header set.
    async fn forward(
        &self,
        meta: &RequestMeta,
        normalized: &NormalizedHeaders,
        pool: &Arc<BackendPool>,
        body: Bytes,
        request_id: &str,
    ) -> GateResult<OriginResponse> {
        let client = self
            .clients
            .get(pool.name())
            .ok_or_else(|| GateError::Internal(format!("No client for pool '{}'", pool.name())))?;

        let target_url = format!("{}{}", pool.origin_base_url(), meta.path_and_query());
        debug!("Forwarding to {} via pool '{}'", target_url, pool.name());

        let method = reqwest::Method::from_bytes(meta.method.as_bytes())
            .map_err(|e| GateError::BadRequest(format!("Invalid method: {}", e)))?;

        let headers = forward_headers(meta, normalized, request_id);
        let mut request_builder = client.request(method, &target_url);
        for (name, value) in headers.iter() {
            request_builder = request_builder.header(name.as_str(), value.as_bytes());
        }
        if !body.is_empty() {
            request_builder = request_builder.body(body);
        }

        let response = request_builder.send().await.map_err(|e| {
            warn!("Origin request failed via pool '{}': {}", pool.name(), e);
            GateError::OriginUnavailable(e.to_string())
        })?;

        let status = response.status().as_u16();
        let mut headers = HeaderMap::new();
        for (name, value) in response.headers().iter() {
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_str().as_bytes()),
                HeaderValue::from_bytes(value.as_bytes()),
            ) {
                headers.append(name, value);
            }
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| GateError::OriginUnavailable(format!("Failed to read origin body: {}", e)))?;

        Ok(OriginResponse { status, headers, body })
    }

    pub fn cache(&self) -> &Arc<CacheStore> {
        &self.cache
    }

    pub fn registry(&self) -> &Arc<PoolRegistry> {
        &self.registry
    }
}

/// Compute the header set forwarded to the origin: original headers minus
/// hop-by-hop, Accept-Encoding collapsed to the normalized variant, the
/// synthetic X-Device marker and the appended X-Forwarded-For chain.
fn forward_headers(
    meta: &RequestMeta,
    normalized: &NormalizedHeaders,
    request_id: &str,
) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, value) in meta.headers.iter() {
        if is_hop_by_hop_header(name) || name == "accept-encoding" || name == "x-forwarded-for" {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }

    if let Some(encoding) = normalized.encoding.header_value() {
        headers.insert("accept-encoding", HeaderValue::from_static(encoding));
    }
    if let Ok(chain) = HeaderValue::from_str(&normalized.forwarded_for) {
        headers.insert("x-forwarded-for", chain);
    }
    headers.insert("x-device", HeaderValue::from_static(normalized.device.as_str()));
    if let Ok(id) = HeaderValue::from_str(request_id) {
        headers.insert("x-request-id", id);
    }

    headers
}

fn is_hop_by_hop_header(name: &HeaderName) -> bool {
    matches!(
        name.as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
    )
}

/// Headers snapshot for storage. Values that are not valid UTF-8 are
/// skipped entirely rather than replayed blanked.
fn header_pairs(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect()
}

fn build_cached_response(stored: StoredResponse, method: &str) -> Response {
    let mut builder = Response::builder().status(stored.status);
    for (name, value) in &stored.headers {
        builder = builder.header(name, value);
    }
    builder = builder.header("x-cache", "HIT");
    // Cached entries are fetched for GET; a HEAD hit gets the same
    // headers with the body stripped.
    let body = if method == "HEAD" {
        Body::empty()
    } else {
        Body::from(stored.body)
    };
    builder
        .body(body)
        .unwrap_or_else(|e| {
            error!("Failed to build cached response: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        })
}

fn build_origin_response(origin: OriginResponse) -> Response {
    let mut builder = Response::builder().status(origin.status);
    for (name, value) in origin.headers.iter() {
        if !is_hop_by_hop_header(name) {
            builder = builder.header(name, value);
        }
    }
    builder = builder.header("x-cache", "MISS");
    builder
        .body(Body::from(origin.body))
        .unwrap_or_else(|e| {
            error!("Failed to build origin response: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        })
}

/// Axum entry point: snapshot the request, run the pipeline, render
/// failures through the error taxonomy.
async fn handle_request(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    req: Request,
) -> Response {
    let (parts, body) = req.into_parts();
    let body_bytes = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            error!("Failed to read request body: {}", e);
            return StatusCode::BAD_REQUEST.into_response();
        }
    };

    let meta = RequestMeta::new(
        addr.ip(),
        parts.method.as_str(),
        parts.uri.path(),
        parts.uri.query().unwrap_or(""),
        parts.headers,
    );

    match state.gatekeeper.process(meta, body_bytes).await {
        Ok(response) => response,
        Err(e) => e.into_response(),
    }
}
