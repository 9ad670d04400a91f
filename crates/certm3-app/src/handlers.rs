//! The six routes of the enrolment surface.
//!
//! Input discipline comes first: every field is checked against its
//! grammar before any registry or signer call goes out, and a failure is
//! both a 400 and a security-event record. The enrolment ordering is
//! strict: group creation only happens after the registry acknowledged
//! validation, and the token is only minted after both memberships stuck.

use std::sync::{Arc, LazyLock};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::header::{AUTHORIZATION, CONTENT_TYPE};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use regex::Regex;
use serde::Deserialize;

use certm3_kernel::{metrics, telemetry};

use crate::error::AppError;
use crate::middleware::ClientIp;
use crate::signer_client::{self, SignerRequest};
use crate::state::{AppState, AuthContext};

static EMAIL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9._%+\-]+@[A-Za-z0-9.\-]+\.[A-Za-z]{2,}$").unwrap());
static USERNAME_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_]+$").unwrap());
static REQUEST_ID_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}$").unwrap()
});
static CHALLENGE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^challenge-[a-f0-9-]+$").unwrap());

fn client_ip(ip: &Option<Extension<ClientIp>>) -> String {
    ip.as_ref()
        .map(|Extension(ClientIp(ip))| ip.to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

fn json_response(status: u16, body: Vec<u8>) -> Response {
    (
        StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
        [(CONTENT_TYPE, "application/json")],
        body,
    )
        .into_response()
}

#[derive(Debug, Deserialize)]
struct InitiatePayload {
    #[serde(default)]
    email: String,
    #[serde(default)]
    username: String,
    #[serde(rename = "displayName", default)]
    display_name: String,
}

/// `POST /app/initiate-request`: starts an enrolment and proxies the
/// registry's `{id, challenge}` back to the client.
pub async fn initiate_request(
    State(state): State<Arc<AppState>>,
    ip: Option<Extension<ClientIp>>,
    body: Bytes,
) -> Result<Response, AppError> {
    let remote_ip = client_ip(&ip);
    let payload: InitiatePayload = serde_json::from_slice(&body)
        .map_err(|_| AppError::BadRequest("Invalid request body".into()))?;

    if payload.email.is_empty() {
        telemetry::security_event("missing_email", "/app/initiate-request", &remote_ip, "");
        return Err(AppError::BadRequest("Email is required".into()));
    }
    if payload.username.is_empty() {
        telemetry::security_event("missing_username", "/app/initiate-request", &remote_ip, "");
        return Err(AppError::BadRequest("Username is required".into()));
    }
    if !EMAIL_RE.is_match(&payload.email) {
        telemetry::security_event(
            "invalid_email_format",
            "/app/initiate-request",
            &remote_ip,
            &payload.email,
        );
        return Err(AppError::BadRequest("Invalid email format".into()));
    }
    if !USERNAME_RE.is_match(&payload.username) {
        telemetry::security_event(
            "invalid_username_format",
            "/app/initiate-request",
            &remote_ip,
            &payload.username,
        );
        return Err(AppError::BadRequest("Invalid username format".into()));
    }

    metrics::record_certificate_request("attempted");

    let forwarded = serde_json::json!({
        "email": payload.email,
        "username": payload.username,
        "displayName": payload.display_name,
    });
    let (status, response_body) = state.registry.create_request(&forwarded).await.map_err(
        |error| {
            tracing::error!(%error, "registry create-request failed");
            AppError::Upstream("Internal server error".into())
        },
    )?;

    metrics::record_certificate_request(if status == 200 { "success" } else { "failed" });

    Ok(json_response(status, response_body))
}

#[derive(Debug, Deserialize)]
struct ValidatePayload {
    #[serde(rename = "requestId", default)]
    request_id: String,
    #[serde(rename = "challengeToken", default)]
    challenge_token: String,
}

#[derive(Debug, Deserialize)]
struct ValidateResponse {
    #[serde(rename = "userId", default)]
    user_id: String,
}

/// `POST /app/validate-email`: presents the challenge; on registry
/// success, creates the personal group, joins it plus `users`, and mints
/// the bearer token.
pub async fn validate_email(
    State(state): State<Arc<AppState>>,
    ip: Option<Extension<ClientIp>>,
    body: Bytes,
) -> Result<Response, AppError> {
    const PATH: &str = "/app/validate-email";
    let remote_ip = client_ip(&ip);
    let payload: ValidatePayload = serde_json::from_slice(&body)
        .map_err(|_| AppError::BadRequest("Invalid request body".into()))?;

    if payload.request_id.is_empty() {
        telemetry::security_event("missing_request_id", PATH, &remote_ip, "");
        return Err(AppError::BadRequest("Request ID is required".into()));
    }
    if payload.challenge_token.is_empty() {
        telemetry::security_event("missing_validation_code", PATH, &remote_ip, "");
        return Err(AppError::BadRequest("Validation code is required".into()));
    }
    if !REQUEST_ID_RE.is_match(&payload.request_id) {
        telemetry::security_event(
            "invalid_request_id_format",
            PATH,
            &remote_ip,
            &payload.request_id,
        );
        return Err(AppError::BadRequest("Invalid request ID format".into()));
    }
    if !CHALLENGE_RE.is_match(&payload.challenge_token) {
        telemetry::security_event(
            "invalid_validation_code_format",
            PATH,
            &remote_ip,
            &payload.challenge_token,
        );
        return Err(AppError::BadRequest("Invalid validation code format".into()));
    }

    metrics::record_email_validation("attempted");

    let (status, response_body) = state
        .registry
        .validate_request(&payload.request_id, &payload.challenge_token)
        .await
        .map_err(|error| {
            tracing::error!(%error, request_id = %payload.request_id, "registry validate failed");
            AppError::Upstream("Internal server error".into())
        })?;

    if status != 200 {
        metrics::record_email_validation("failed");
        return Ok(json_response(status, response_body));
    }
    metrics::record_email_validation("success");

    let validated: ValidateResponse = serde_json::from_slice(&response_body).map_err(|error| {
        tracing::error!(%error, "registry validate response did not decode");
        AppError::Upstream("Internal server error".into())
    })?;

    // The validate response carries only the user id; the username that
    // names the personal group has to come from the request record.
    let username = state
        .registry
        .request_username(&payload.request_id)
        .await
        .map_err(|error| {
            tracing::error!(%error, request_id = %payload.request_id, "request re-read failed");
            AppError::Upstream("Internal server error".into())
        })?;

    tracing::info!(
        %username,
        user_id = %validated.user_id,
        request_id = %payload.request_id,
        "email validated, creating groups"
    );

    // The three inserts below are not transactional; the registry treats
    // them idempotently and the first hard failure aborts the call.
    let group_status = state
        .registry
        .create_group(
            &username,
            &format!("{username}'s Group"),
            &format!("Personal group for {username}"),
        )
        .await
        .map_err(|error| {
            tracing::error!(%error, %username, "personal group creation failed");
            AppError::Upstream("Internal server error".into())
        })?;
    if group_status != 201 && group_status != 200 {
        tracing::error!(status = group_status, %username, "personal group creation rejected");
        return Err(AppError::Upstream("Failed to create self group".into()));
    }

    let member_status = state
        .registry
        .add_group_member(&username, &validated.user_id)
        .await
        .map_err(|error| {
            tracing::error!(%error, %username, "personal group membership failed");
            AppError::Upstream("Internal server error".into())
        })?;
    if member_status != 204 {
        tracing::error!(status = member_status, %username, "personal group membership rejected");
        return Err(AppError::Upstream("Failed to add user to self group".into()));
    }

    let users_status = state
        .registry
        .add_group_member("users", &validated.user_id)
        .await
        .map_err(|error| {
            tracing::error!(%error, %username, "users group membership failed");
            AppError::Upstream("Internal server error".into())
        })?;
    if users_status != 204 {
        tracing::error!(status = users_status, %username, "users group membership rejected");
        return Err(AppError::Upstream("Failed to add user to users group".into()));
    }

    let token = state
        .tokens
        .mint(&validated.user_id, &payload.request_id)
        .map_err(|error| {
            tracing::error!(%error, "token minting failed");
            AppError::Upstream("Internal server error".into())
        })?;

    Ok(Json(serde_json::json!({ "token": token })).into_response())
}

#[derive(Debug, Deserialize)]
struct SubmitPayload {
    #[serde(default)]
    csr: String,
    #[serde(default)]
    groups: Vec<String>,
}

/// `POST /app/submit-csr`: forwards the CSR, the claimed groups, and the
/// bearer envelope to the signer; returns `{certificate, caCertificate}`.
pub async fn submit_csr(
    State(state): State<Arc<AppState>>,
    ip: Option<Extension<ClientIp>>,
    auth: Option<Extension<AuthContext>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    const PATH: &str = "/app/submit-csr";
    let remote_ip = client_ip(&ip);

    let (user_id, request_id) = match auth {
        Some(Extension(context)) => (context.user_id, context.request_id),
        None => {
            telemetry::security_event("missing_user_id", PATH, &remote_ip, "");
            return Err(AppError::Unauthorized("Unauthorized".into()));
        }
    };

    tracing::info!(%user_id, %request_id, "CSR submission received");

    let payload: SubmitPayload = serde_json::from_slice(&body).map_err(|error| {
        telemetry::security_event("invalid_csr_format", PATH, &remote_ip, &error.to_string());
        AppError::BadRequest("Invalid request format: request must be JSON with a csr field".into())
    })?;
    if payload.csr.is_empty() {
        telemetry::security_event("missing_csr", PATH, &remote_ip, "");
        return Err(AppError::BadRequest("CSR is required".into()));
    }

    metrics::record_certificate_request("submitted");

    // The claimed group list stays opaque here; the signer intersects it
    // against the registry. The raw Authorization value rides along for
    // correlation.
    let token = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();

    tracing::info!(%user_id, %request_id, requested_groups = ?payload.groups, "dispatching CSR to signer");

    let start = Instant::now();
    let signed = signer_client::sign(
        &state.config.signer.socket_path,
        &SignerRequest {
            request_id: request_id.clone(),
            csr: payload.csr,
            groups: payload.groups,
            token,
        },
    )
    .await
    .map_err(|error| {
        metrics::record_csr_signing("error", start.elapsed(), Some("dispatch"));
        tracing::error!(%error, %request_id, "signer dispatch failed");
        match error {
            signer_client::SignerClientError::Refused(_) => {
                AppError::Upstream("Failed to sign CSR".into())
            }
            _ => AppError::Upstream("Internal server error".into()),
        }
    })?;
    metrics::record_csr_signing("success", start.elapsed(), None);

    Ok(Json(serde_json::json!({
        "certificate": signed.certificate,
        "caCertificate": signed.ca_certificate,
    }))
    .into_response())
}

/// `GET /app/check-username/{username}`: registry 404 means available.
pub async fn check_username(
    State(state): State<Arc<AppState>>,
    Path(username): Path<String>,
) -> Result<Response, AppError> {
    tracing::debug!(%username, "checking username availability");
    let status = state
        .registry
        .check_username(&username)
        .await
        .map_err(|error| {
            tracing::error!(%error, %username, "username probe failed");
            AppError::Upstream("Internal server error".into())
        })?;
    let available = status == 404;
    Ok(Json(serde_json::json!({ "available": available })).into_response())
}

/// `GET /app/groups/{username}`: proxies the registry's user→groups
/// lookup.
pub async fn user_groups(
    State(state): State<Arc<AppState>>,
    Path(username): Path<String>,
) -> Result<Response, AppError> {
    let groups = state.registry.user_groups(&username).await.map_err(|error| {
        tracing::error!(%error, %username, "groups lookup failed");
        AppError::Upstream("Internal server error".into())
    })?;
    Ok(Json(groups).into_response())
}

/// `GET /health`: liveness.
pub async fn health() -> Response {
    let ts = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    Json(serde_json::json!({
        "build": env!("CARGO_PKG_VERSION"),
        "ts": ts,
    }))
    .into_response()
}

/// `GET /metrics`: Prometheus scrape.
pub async fn metrics_scrape(State(state): State<Arc<AppState>>) -> Response {
    match &state.prometheus {
        Some(handle) => handle.render().into_response(),
        None => (StatusCode::NOT_FOUND, "metrics recorder not installed\n").into_response(),
    }
}
