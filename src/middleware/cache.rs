// TTL response cache for GET requests

use std::{collections::HashMap, sync::Arc, time::Duration};

use axum::{
    body::{Body, Bytes},
    extract::State,
    http::{HeaderMap, HeaderValue, Method, Request, StatusCode, Uri},
    middleware::Next,
    response::Response,
};
use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use tokio::time::Instant;
use tracing::{debug, error};

use crate::auth::AuthError;

pub const CACHE_STATUS_HEADER: &str = "x-cache";

#[derive(Debug, Clone)]
struct CachedResponse {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
    expires_at: Instant,
}

impl CachedResponse {
    fn is_fresh(&self, now: Instant) -> bool {
        now < self.expires_at
    }

    fn to_response(&self) -> Response {
        let mut response = Response::new(Body::from(self.body.clone()));
        *response.status_mut() = self.status;
        *response.headers_mut() = self.headers.clone();
        response
    }
}

/// In-process cache of successful GET responses
///
/// Entries expire `ttl` after being stored. No invalidation happens when the
/// underlying data changes. At most `max_entries` are held; at capacity,
/// expired entries go first, then the one closest to expiry.
pub struct ResponseCache {
    ttl: Duration,
    max_entries: usize,
    entries: RwLock<HashMap<String, CachedResponse>>,
}

impl ResponseCache {
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            ttl,
            max_entries: max_entries.max(1),
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Key over method, path and the raw query string
    ///
    /// The query is used exactly as received, so `?a=1&b=2` and `?b=2&a=1`
    /// are distinct entries.
    pub fn cache_key(method: &Method, uri: &Uri) -> String {
        let raw = format!("{}:{}:{}", method, uri.path(), uri.query().unwrap_or(""));
        format!("{:x}", Sha256::digest(raw.as_bytes()))
    }

    fn lookup(&self, key: &str) -> Option<Response> {
        let entries = self.entries.read();
        entries
            .get(key)
            .filter(|entry| entry.is_fresh(Instant::now()))
            .map(CachedResponse::to_response)
    }

    /// Insert or overwrite an entry; false when the expiry is unrepresentable
    fn store(&self, key: String, status: StatusCode, headers: HeaderMap, body: Bytes) -> bool {
        let now = Instant::now();
        let Some(expires_at) = now.checked_add(self.ttl) else {
            debug!(ttl_secs = self.ttl.as_secs(), "Cache TTL overflows the clock; not caching");
            return false;
        };
        let entry = CachedResponse {
            status,
            headers,
            body,
            expires_at,
        };

        let mut entries = self.entries.write();
        if !entries.contains_key(&key) && entries.len() >= self.max_entries {
            entries.retain(|_, cached| cached.is_fresh(now));

            if entries.len() >= self.max_entries {
                let soonest = entries
                    .iter()
                    .min_by_key(|(_, cached)| cached.expires_at)
                    .map(|(key, _)| key.clone());
                if let Some(soonest) = soonest {
                    entries.remove(&soonest);
                }
            }
        }
        entries.insert(key, entry);
        true
    }

    /// Remove expired entries; returns how many were dropped
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, cached| cached.is_fresh(now));
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

/// Middleware serving GET requests from the cache when possible
///
/// Hits carry `X-Cache: HIT` and skip the handler. Misses run the handler and
/// store the response only when it is exactly 200 OK; the stored copy is
/// returned marked `X-Cache: MISS`.
pub async fn cache_responses(
    State(cache): State<Arc<ResponseCache>>,
    request: Request<Body>,
    next: Next,
) -> Result<Response, AuthError> {
    if *request.method() != Method::GET {
        return Ok(next.run(request).await);
    }

    let key = ResponseCache::cache_key(request.method(), request.uri());
    if let Some(mut response) = cache.lookup(&key) {
        debug!(path = %request.uri().path(), "Cache hit");
        response
            .headers_mut()
            .insert(CACHE_STATUS_HEADER, HeaderValue::from_static("HIT"));
        return Ok(response);
    }

    let response = next.run(request).await;
    if response.status() != StatusCode::OK {
        return Ok(response);
    }

    let (mut parts, body) = response.into_parts();
    let bytes = axum::body::to_bytes(body, usize::MAX).await.map_err(|e| {
        error!(error = %e, "Failed to buffer response for caching");
        AuthError::StorageError(format!("Failed to buffer response body: {}", e))
    })?;

    cache.store(key, parts.status, parts.headers.clone(), bytes.clone());

    parts
        .headers
        .insert(CACHE_STATUS_HEADER, HeaderValue::from_static("MISS"));
    Ok(Response::from_parts(parts, Body::from(bytes)))
}
