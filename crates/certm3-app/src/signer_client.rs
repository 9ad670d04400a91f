//! One-shot dispatch to the signer daemon.
//!
//! The gateway opens a fresh unix-socket connection per signing request,
//! writes one newline-terminated JSON object, reads one JSON response, and
//! closes. No pipelining, no retries: a failed round-trip surfaces as a
//! 500 and the client decides whether to resubmit.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

#[derive(Debug, Error)]
pub enum SignerClientError {
    #[error("failed to reach signer: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to encode signing request: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("signer protocol violation: {0}")]
    Protocol(String),
    #[error("signer refused: {0}")]
    Refused(String),
}

#[derive(Debug, Serialize)]
pub struct SignerRequest {
    #[serde(rename = "requestId")]
    pub request_id: String,
    pub csr: String,
    pub groups: Vec<String>,
    /// The bearer envelope, forwarded verbatim for correlation.
    pub token: String,
}

#[derive(Debug, Deserialize)]
struct SignerResponse {
    success: bool,
    #[serde(default)]
    data: Option<SignerData>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct SignerData {
    pub certificate: String,
    #[serde(rename = "caCertificate")]
    pub ca_certificate: String,
}

/// Performs one signing round-trip against the daemon at `socket_path`.
pub async fn sign(
    socket_path: &str,
    request: &SignerRequest,
) -> Result<SignerData, SignerClientError> {
    let stream = UnixStream::connect(socket_path).await?;
    let (reader, mut writer) = stream.into_split();

    let mut payload = serde_json::to_string(request)?;
    payload.push('\n');
    writer.write_all(payload.as_bytes()).await?;
    writer.flush().await?;

    let mut lines = BufReader::new(reader).lines();
    let line = lines
        .next_line()
        .await?
        .ok_or_else(|| SignerClientError::Protocol("signer closed without responding".into()))?;

    let response: SignerResponse = serde_json::from_str(&line)
        .map_err(|e| SignerClientError::Protocol(format!("undecodable response: {e}")))?;

    if !response.success {
        return Err(SignerClientError::Refused(
            response.error.unwrap_or_else(|| "unknown error".into()),
        ));
    }
    response
        .data
        .ok_or_else(|| SignerClientError::Protocol("success response without data".into()))
}
