//! Registry lookups made by the signer.
//!
//! The signer needs exactly one fact from the registry: the set of groups
//! the CSR's subject actually belongs to. The lookup is two-step: resolve
//! the username to a user id, then fetch that user's groups. Failures are
//! surfaced to the caller, which degrades to the baseline group set rather
//! than refusing issuance.

use std::time::{Duration, Instant};

use serde::Deserialize;
use thiserror::Error;

use certm3_kernel::metrics;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("registry request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("registry returned status {status} for {what}")]
    Status { what: &'static str, status: u16 },
}

#[derive(Debug, Deserialize)]
struct UserRecord {
    id: String,
}

/// Minimal registry client for user→groups resolution.
#[derive(Clone)]
pub struct RegistryClient {
    http: reqwest::Client,
    base_url: String,
}

impl RegistryClient {
    pub fn new(base_url: &str) -> Result<Self, RegistryError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Resolves `username` to the registry's group list for that user.
    pub async fn user_groups(&self, username: &str) -> Result<Vec<String>, RegistryError> {
        let start = Instant::now();
        let response = self
            .http
            .get(format!("{}/users/username/{}", self.base_url, username))
            .send()
            .await
            .inspect_err(|_| metrics::record_backend_error("user_lookup"))?;
        let status = response.status();
        metrics::record_backend_request(
            "GET",
            "/users/username",
            status.as_str(),
            start.elapsed(),
        );
        if !status.is_success() {
            return Err(RegistryError::Status {
                what: "user lookup",
                status: status.as_u16(),
            });
        }
        let user: UserRecord = response.json().await?;

        let start = Instant::now();
        let response = self
            .http
            .get(format!("{}/users/{}/groups", self.base_url, user.id))
            .send()
            .await
            .inspect_err(|_| metrics::record_backend_error("groups_lookup"))?;
        let status = response.status();
        metrics::record_backend_request("GET", "/users/groups", status.as_str(), start.elapsed());
        if !status.is_success() {
            return Err(RegistryError::Status {
                what: "groups lookup",
                status: status.as_u16(),
            });
        }
        Ok(response.json().await?)
    }
}
