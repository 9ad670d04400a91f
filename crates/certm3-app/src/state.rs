//! Shared gateway state and the request-scoped identity record.

use metrics_exporter_prometheus::PrometheusHandle;

use certm3_kernel::{Config, TokenManager};

use crate::middleware::RateLimiter;
use crate::registry::RegistryClient;

pub struct AppState {
    pub config: Config,
    pub tokens: TokenManager,
    pub registry: RegistryClient,
    pub rate_limiter: RateLimiter,
    /// Present only in the process that installed the Prometheus recorder.
    pub prometheus: Option<PrometheusHandle>,
}

/// Identity attached to a request by the bearer authenticator.
///
/// A typed extension rather than loose string keys: handlers that need the
/// caller's identity state it in their signature, and nothing else can
/// collide with it.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub user_id: String,
    pub request_id: String,
}
