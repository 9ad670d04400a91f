//! The request pipeline: HTTP metrics, access logging, per-IP rate
//! limiting, and the deny-by-default bearer authenticator.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use axum::extract::{ConnectInfo, Request, State};
use axum::http::header::{AUTHORIZATION, USER_AGENT};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use certm3_kernel::{metrics, telemetry};

use crate::state::{AppState, AuthContext};

/// Sliding-window request counter keyed by remote address.
///
/// One mutex guards the whole map; it is held across the window scan, the
/// decision, and the append, and never across an await point. Eviction is
/// lazy: stale entries are dropped the next time their address shows up.
pub struct RateLimiter {
    limit: usize,
    window: Duration,
    requests: Mutex<HashMap<IpAddr, Vec<Instant>>>,
}

impl RateLimiter {
    pub fn new(limit: usize, window: Duration) -> Self {
        Self {
            limit,
            window,
            requests: Mutex::new(HashMap::new()),
        }
    }

    /// Records an arrival and reports whether it is within the limit.
    pub fn allow(&self, addr: IpAddr) -> bool {
        let mut requests = self.requests.lock().expect("rate limiter lock poisoned");
        let now = Instant::now();
        let entry = requests.entry(addr).or_default();
        entry.retain(|arrival| now.duration_since(*arrival) < self.window);
        if entry.len() >= self.limit {
            return false;
        }
        entry.push(now);
        true
    }
}

/// The remote peer address, attached to every request by [`access_log`] so
/// handlers can include it in security events.
#[derive(Clone, Copy, Debug)]
pub struct ClientIp(pub IpAddr);

/// The remote peer address, or unspecified when the connection info is
/// absent (in-process test requests).
pub(crate) fn remote_ip(request: &Request) -> IpAddr {
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0.ip())
        .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED))
}

/// Outermost layer: request counters, duration histogram, in-flight gauge.
pub async fn http_metrics(request: Request, next: Next) -> Response {
    let method = request.method().to_string();
    let path = request.uri().path().to_string();

    metrics::http_in_flight_inc(&method, &path);
    let start = Instant::now();
    let response = next.run(request).await;
    metrics::http_in_flight_dec(&method, &path);
    metrics::record_http_request(&method, &path, response.status().as_u16(), start.elapsed());

    response
}

/// Structured access log, one record per completed request. Also stamps
/// the request with [`ClientIp`] for downstream handlers.
pub async fn access_log(mut request: Request, next: Next) -> Response {
    let method = request.method().to_string();
    let path = request.uri().path().to_string();
    let ip = remote_ip(&request);
    request.extensions_mut().insert(ClientIp(ip));
    let remote_ip = ip.to_string();
    let user_agent = request
        .headers()
        .get(USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();

    let start = Instant::now();
    let response = next.run(request).await;
    let status = response.status().as_u16();
    let duration_ms = start.elapsed().as_millis() as u64;

    tracing::info!(%method, %path, status, duration_ms, "request completed");
    tracing::debug!(%method, %path, %remote_ip, %user_agent, "request detail");

    response
}

/// Per-IP sliding-window rate limit; a rejected request never reaches the
/// authenticator or a handler.
pub async fn rate_limit(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    let ip = remote_ip(&request);
    if !state.rate_limiter.allow(ip) {
        let path = request.uri().path();
        metrics::record_rate_limit_exceeded(path);
        tracing::warn!(%ip, path, "rate limit exceeded");
        return (StatusCode::TOO_MANY_REQUESTS, "Rate limit exceeded\n").into_response();
    }
    next.run(request).await
}

/// Routes reachable without a bearer token.
fn is_public(path: &str) -> bool {
    matches!(
        path,
        "/health" | "/metrics" | "/app/initiate-request" | "/app/validate-email"
    ) || path.starts_with("/app/check-username/")
        || path.starts_with("/app/groups/")
}

/// Deny-by-default bearer authenticator.
///
/// Anything off the allow-list needs `Authorization: Bearer <token>`; a
/// valid token attaches an [`AuthContext`] to the request for downstream
/// handlers.
pub async fn authenticate(
    State(state): State<Arc<AppState>>,
    mut request: Request,
    next: Next,
) -> Response {
    let path = request.uri().path().to_string();
    if is_public(&path) {
        return next.run(request).await;
    }

    let remote_ip = remote_ip(&request).to_string();
    let header = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let Some(header) = header else {
        telemetry::security_event("missing_auth_header", &path, &remote_ip, "");
        return (StatusCode::UNAUTHORIZED, "Authorization header required\n").into_response();
    };
    let Some(token) = header.strip_prefix("Bearer ") else {
        telemetry::security_event("invalid_auth_header", &path, &remote_ip, "");
        return (
            StatusCode::UNAUTHORIZED,
            "Invalid authorization header format\n",
        )
            .into_response();
    };

    match state.tokens.validate(token) {
        Ok(claims) => {
            metrics::record_jwt_validation("success", None);
            request.extensions_mut().insert(AuthContext {
                user_id: claims.user_id,
                request_id: claims.request_id,
            });
            next.run(request).await
        }
        Err(error) => {
            telemetry::security_event("invalid_token", &path, &remote_ip, &error.to_string());
            metrics::record_jwt_validation("error", Some(jwt_error_kind(&error)));
            (StatusCode::UNAUTHORIZED, "Invalid token\n").into_response()
        }
    }
}

fn jwt_error_kind(error: &certm3_kernel::token::TokenError) -> &'static str {
    use certm3_kernel::token::TokenError;
    match error {
        TokenError::Expired => "expired",
        TokenError::Invalid(_) => "invalid",
        TokenError::Signing(_) => "signing",
        TokenError::Secret(_) => "secret",
    }
}
