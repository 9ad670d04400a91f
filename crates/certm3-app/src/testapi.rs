//! The `--testapi` synthetic enrolment flow.
//!
//! Drives the real router in-process: initiate a request for a generated
//! user, pull the challenge out of the registry's test-email spool file,
//! validate, mint a keypair and CSR, and submit it with the bearer token.
//! Exits non-zero on any protocol failure, which makes it suitable as a
//! deployment smoke check.

use std::sync::Arc;
use std::sync::LazyLock;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{bail, Context};
use axum::body::Body;
use axum::http::header::{AUTHORIZATION, CONTENT_TYPE};
use axum::http::Request;
use regex::Regex;
use tower::ServiceExt;

use crate::state::AppState;

const TEST_EMAIL_DIR: &str = "/var/spool/certM3/test-emails";
const POLL_ATTEMPTS: u32 = 5;
const POLL_INTERVAL: Duration = Duration::from_secs(2);

static CHALLENGE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"challenge-[a-f0-9-]+").unwrap());

pub async fn run(state: Arc<AppState>) -> anyhow::Result<()> {
    tracing::info!("starting test API flow");
    let app = crate::router(state);

    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .context("clock before epoch")?
        .as_nanos();
    let username = format!("testuser{nanos}");
    tracing::info!(%username, "generated test username");

    // Step 1: initiate.
    let initiate = serde_json::json!({
        "email": format!("test{username}@example.com"),
        "username": username,
        "displayName": "Test User",
    });
    let (status, body) = post_json(&app, "/app/initiate-request", None, &initiate).await?;
    if status != 200 {
        bail!("initiate request failed with status {status}: {body}");
    }
    let initiated: serde_json::Value =
        serde_json::from_str(&body).context("initiate response is not JSON")?;
    let request_id = initiated["id"]
        .as_str()
        .context("initiate response carries no id")?
        .to_string();
    tracing::info!(%request_id, "enrolment request opened");

    // Step 2: extract the challenge the registry dropped into the spool.
    let challenge = poll_for_challenge(&username).await?;
    tracing::info!(%challenge, "extracted challenge token");

    // Step 3: validate.
    let validate = serde_json::json!({
        "requestId": request_id,
        "challengeToken": challenge,
    });
    let (status, body) = post_json(&app, "/app/validate-email", None, &validate).await?;
    if status != 200 {
        bail!("validate email failed with status {status}: {body}");
    }
    let validated: serde_json::Value =
        serde_json::from_str(&body).context("validate response is not JSON")?;
    let token = validated["token"]
        .as_str()
        .context("validate response carries no token")?
        .to_string();

    // Step 4: generate key material and submit the CSR.
    let csr = generate_csr(&username)?;
    let submit = serde_json::json!({
        "csr": csr,
        "groups": ["test-group"],
    });
    let (status, body) = post_json(
        &app,
        "/app/submit-csr",
        Some(&format!("Bearer {token}")),
        &submit,
    )
    .await?;
    if status != 200 {
        bail!("submit CSR failed with status {status}: {body}");
    }
    let issued: serde_json::Value =
        serde_json::from_str(&body).context("submit response is not JSON")?;
    let certificate = issued["certificate"]
        .as_str()
        .context("submit response carries no certificate")?;
    if !certificate.contains("BEGIN CERTIFICATE") {
        bail!("issued certificate is not PEM");
    }

    tracing::info!("test API flow completed");
    Ok(())
}

async fn post_json(
    app: &axum::Router,
    path: &str,
    authorization: Option<&str>,
    body: &serde_json::Value,
) -> anyhow::Result<(u16, String)> {
    let mut request = Request::builder()
        .method("POST")
        .uri(path)
        .header(CONTENT_TYPE, "application/json");
    if let Some(value) = authorization {
        request = request.header(AUTHORIZATION, value);
    }
    let request = request
        .body(Body::from(body.to_string()))
        .context("failed to build request")?;

    let response = app
        .clone()
        .oneshot(request)
        .await
        .context("router rejected request")?;
    let status = response.status().as_u16();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .context("failed to read response body")?;
    Ok((status, String::from_utf8_lossy(&bytes).to_string()))
}

/// Finds the newest spool file for `username` and pulls the challenge
/// token out of it. The registry writes the file asynchronously, so poll.
async fn poll_for_challenge(username: &str) -> anyhow::Result<String> {
    let suffix = format!("-{username}-validation.txt");
    for attempt in 1..=POLL_ATTEMPTS {
        tracing::info!(attempt, dir = TEST_EMAIL_DIR, "looking for validation email");

        let mut newest: Option<(SystemTime, std::path::PathBuf)> = None;
        let entries = std::fs::read_dir(TEST_EMAIL_DIR)
            .with_context(|| format!("failed to read {TEST_EMAIL_DIR}"))?;
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            if !name.ends_with(&suffix) {
                continue;
            }
            let modified = entry
                .metadata()
                .and_then(|m| m.modified())
                .unwrap_or(UNIX_EPOCH);
            if newest.as_ref().map_or(true, |(when, _)| modified > *when) {
                newest = Some((modified, entry.path()));
            }
        }

        if let Some((_, path)) = newest {
            tracing::info!(file = %path.display(), "using most recent validation email");
            let contents = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            return CHALLENGE_RE
                .find(&contents)
                .map(|m| m.as_str().to_string())
                .context("challenge code not found in test email");
        }

        if attempt < POLL_ATTEMPTS {
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }
    bail!("no test email found for username {username} in {TEST_EMAIL_DIR}");
}

/// P-256 keypair + CSR with CN = username, the same shape the browser
/// client produces.
fn generate_csr(username: &str) -> anyhow::Result<String> {
    let key = rcgen::KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256)
        .context("key generation failed")?;
    let mut params =
        rcgen::CertificateParams::new(vec![]).context("failed to create CSR params")?;
    let mut dn = rcgen::DistinguishedName::new();
    dn.push(rcgen::DnType::CommonName, username);
    dn.push(rcgen::DnType::OrganizationName, "ogt11.com");
    dn.push(rcgen::DnType::OrganizationalUnitName, "CertM3");
    params.distinguished_name = dn;
    let csr = params
        .serialize_request(&key)
        .context("CSR serialization failed")?;
    csr.pem().context("CSR PEM encoding failed")
}
