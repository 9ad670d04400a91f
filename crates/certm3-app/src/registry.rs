//! Typed client for the registry backend.
//!
//! Every enrolment mutation and lookup the gateway performs goes through
//! here, with per-call metrics. The client applies a 30 s deadline, a 30 s
//! connect timeout with keepalive, and pins the local address to IPv4;
//! the registry deployment does not answer on v6.

use std::net::{IpAddr, Ipv4Addr};
use std::time::{Duration, Instant};

use serde::Deserialize;
use thiserror::Error;

use certm3_kernel::metrics;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("registry request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("registry response did not decode: {0}")]
    Decode(String),
}

#[derive(Debug, Deserialize)]
struct UserRecord {
    id: String,
}

#[derive(Debug, Deserialize)]
struct RequestRecord {
    #[serde(default)]
    username: String,
}

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
            .tcp_keepalive(Duration::from_secs(30))
            .local_address(IpAddr::V4(Ipv4Addr::UNSPECIFIED))
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn post_json(
        &self,
        metric_path: &'static str,
        url: String,
        body: &serde_json::Value,
    ) -> Result<(u16, Vec<u8>), RegistryError> {
        let start = Instant::now();
        let response = self
            .http
            .post(url)
            .json(body)
            .send()
            .await
            .inspect_err(|_| metrics::record_backend_error(metric_path))?;
        let status = response.status();
        metrics::record_backend_request("POST", metric_path, status.as_str(), start.elapsed());
        let bytes = response.bytes().await?.to_vec();
        Ok((status.as_u16(), bytes))
    }

    async fn get(
        &self,
        metric_path: &'static str,
        url: String,
    ) -> Result<(u16, Vec<u8>), RegistryError> {
        let start = Instant::now();
        let response = self
            .http
            .get(url)
            .send()
            .await
            .inspect_err(|_| metrics::record_backend_error(metric_path))?;
        let status = response.status();
        metrics::record_backend_request("GET", metric_path, status.as_str(), start.elapsed());
        let bytes = response.bytes().await?.to_vec();
        Ok((status.as_u16(), bytes))
    }

    /// `POST /requests`: opens a new enrolment request. The registry's
    /// response (request id + challenge) streams back to the client.
    pub async fn create_request(
        &self,
        body: &serde_json::Value,
    ) -> Result<(u16, Vec<u8>), RegistryError> {
        self.post_json("/requests", format!("{}/requests", self.base_url), body)
            .await
    }

    /// `POST /requests/{id}/validate`: presents the challenge token.
    pub async fn validate_request(
        &self,
        request_id: &str,
        challenge: &str,
    ) -> Result<(u16, Vec<u8>), RegistryError> {
        self.post_json(
            "/requests/validate",
            format!("{}/requests/{}/validate", self.base_url, request_id),
            &serde_json::json!({ "challenge": challenge }),
        )
        .await
    }

    /// `GET /requests/{id}`: re-reads the request record; the validate
    /// response does not echo the username, so it is fetched here.
    pub async fn request_username(&self, request_id: &str) -> Result<String, RegistryError> {
        let (status, body) = self
            .get(
                "/requests",
                format!("{}/requests/{}", self.base_url, request_id),
            )
            .await?;
        if status != 200 {
            return Err(RegistryError::Decode(format!(
                "request lookup returned status {status}"
            )));
        }
        let record: RequestRecord = serde_json::from_slice(&body)
            .map_err(|e| RegistryError::Decode(e.to_string()))?;
        Ok(record.username)
    }

    /// `POST /groups`: creates a group. Returns the raw status; the
    /// caller tolerates 200 as well as 201 because the registry treats the
    /// insert idempotently.
    pub async fn create_group(
        &self,
        name: &str,
        display_name: &str,
        description: &str,
    ) -> Result<u16, RegistryError> {
        let (status, _) = self
            .post_json(
                "/groups",
                format!("{}/groups", self.base_url),
                &serde_json::json!({
                    "name": name,
                    "displayName": display_name,
                    "description": description,
                }),
            )
            .await?;
        Ok(status)
    }

    /// `POST /groups/{name}/members`: adds a user to a group.
    pub async fn add_group_member(
        &self,
        group: &str,
        user_id: &str,
    ) -> Result<u16, RegistryError> {
        let (status, _) = self
            .post_json(
                "/groups/members",
                format!("{}/groups/{}/members", self.base_url, group),
                &serde_json::json!({ "userIds": [user_id] }),
            )
            .await?;
        Ok(status)
    }

    /// `GET /request/check-username/{name}`: availability probe. 404
    /// means available.
    pub async fn check_username(&self, username: &str) -> Result<u16, RegistryError> {
        let (status, _) = self
            .get(
                "/request/check-username",
                format!("{}/request/check-username/{}", self.base_url, username),
            )
            .await?;
        Ok(status)
    }

    /// Two-step username → groups resolution for the public groups proxy.
    pub async fn user_groups(&self, username: &str) -> Result<Vec<String>, RegistryError> {
        let (status, body) = self
            .get(
                "/users/username",
                format!("{}/users/username/{}", self.base_url, username),
            )
            .await?;
        if status != 200 {
            return Err(RegistryError::Decode(format!(
                "user lookup returned status {status}"
            )));
        }
        let user: UserRecord =
            serde_json::from_slice(&body).map_err(|e| RegistryError::Decode(e.to_string()))?;

        let (status, body) = self
            .get(
                "/users/groups",
                format!("{}/users/{}/groups", self.base_url, user.id),
            )
            .await?;
        if status != 200 {
            return Err(RegistryError::Decode(format!(
                "groups lookup returned status {status}"
            )));
        }
        serde_json::from_slice(&body).map_err(|e| RegistryError::Decode(e.to_string()))
    }
}
