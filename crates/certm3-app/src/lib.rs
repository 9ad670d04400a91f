/*!
# certm3-app

The public-facing gateway of the certM3 middleware. It terminates the
enrolment HTTP surface, applies the request pipeline (metrics, access log,
per-IP rate limit, bearer-token authentication), proxies data calls to the
registry backend, and hands CSRs to the signer daemon over its unix socket.

The gateway owns no user or group state. Its only persistent artifact is
the token-signing secret file; everything else lives in the registry or in
the client's browser.
*/

use std::sync::Arc;
use std::time::Duration;

use axum::middleware::{from_fn, from_fn_with_state};
use axum::routing::{get, post};
use axum::Router;
use tower::ServiceBuilder;
use tower_http::timeout::TimeoutLayer;

pub mod error;
pub mod handlers;
pub mod middleware;
pub mod registry;
pub mod signer_client;
pub mod state;
pub mod testapi;

pub use state::{AppState, AuthContext};

/// Builds the gateway router.
///
/// The pipeline applies, outermost first: HTTP metrics, access logging,
/// the per-IP rate limit, and the deny-by-default bearer authenticator.
/// Handlers run inside a 15 s timeout.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/app/initiate-request", post(handlers::initiate_request))
        .route("/app/validate-email", post(handlers::validate_email))
        .route("/app/submit-csr", post(handlers::submit_csr))
        .route("/app/check-username/{username}", get(handlers::check_username))
        .route("/app/groups/{username}", get(handlers::user_groups))
        .route("/health", get(handlers::health))
        .route("/metrics", get(handlers::metrics_scrape))
        .layer(
            ServiceBuilder::new()
                .layer(from_fn(middleware::http_metrics))
                .layer(from_fn(middleware::access_log))
                .layer(from_fn_with_state(state.clone(), middleware::rate_limit))
                .layer(from_fn_with_state(state.clone(), middleware::authenticate))
                .layer(TimeoutLayer::new(Duration::from_secs(15))),
        )
        .with_state(state)
}
