//! The unix-socket signing service.
//!
//! Protocol: the peer writes exactly one JSON object terminated by a
//! newline, the daemon writes exactly one JSON response terminated by a
//! newline, and both sides close. There is no pipelining; the gateway opens
//! a fresh connection per signing request.
//!
//! Request:  `{"requestId": …, "csr": …, "groups": […], "token": …}`
//! Response: `{"success": true, "data": {"certificate": …, "caCertificate": …}}`
//!        or `{"success": false, "error": …}`

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio_util::sync::CancellationToken;

use certm3_kernel::metrics;

use crate::authorize;
use crate::csr;
use crate::registry::RegistryClient;
use crate::sign::{self, CaMaterial, SignError};

/// Bounds how long a connected peer may take to send its request.
const READ_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Deserialize)]
pub struct SignRequest {
    #[serde(rename = "requestId", default)]
    pub request_id: String,
    #[serde(default)]
    pub csr: String,
    #[serde(default)]
    pub groups: Vec<String>,
    #[serde(default)]
    pub token: String,
}

#[derive(Debug, Serialize)]
pub struct SignResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<SignData>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct SignData {
    pub certificate: String,
    #[serde(rename = "caCertificate")]
    pub ca_certificate: String,
}

impl SignResponse {
    fn success(data: SignData) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message.into()),
        }
    }
}

pub struct SignerService {
    ca: CaMaterial,
    registry: RegistryClient,
    group_oid: String,
    validity_days: u32,
}

impl SignerService {
    pub fn new(
        ca: CaMaterial,
        registry: RegistryClient,
        group_oid: String,
        validity_days: u32,
    ) -> Self {
        Self {
            ca,
            registry,
            group_oid,
            validity_days,
        }
    }

    /// Binds the socket and serves until `halt` is cancelled. The socket
    /// file is unlinked before bind and again on the way out; its mode is
    /// 0666 so the gateway user can connect.
    pub async fn run(
        self: Arc<Self>,
        socket_path: &Path,
        halt: CancellationToken,
    ) -> anyhow::Result<()> {
        if let Some(parent) = socket_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        remove_stale_socket(socket_path)?;

        let listener = UnixListener::bind(socket_path)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(socket_path, std::fs::Permissions::from_mode(0o666))?;
        }
        tracing::info!(socket = %socket_path.display(), "signer listening");

        loop {
            tokio::select! {
                _ = halt.cancelled() => {
                    tracing::info!("signer shutting down");
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, _addr)) => {
                        let service = Arc::clone(&self);
                        tokio::spawn(async move {
                            service.handle_connection(stream).await;
                        });
                    }
                    Err(error) => {
                        tracing::error!(%error, "failed to accept connection");
                    }
                }
            }
        }

        drop(listener);
        remove_stale_socket(socket_path)?;
        Ok(())
    }

    async fn handle_connection(&self, stream: UnixStream) {
        let (reader, mut writer) = stream.into_split();
        let mut lines = BufReader::new(reader).lines();

        let line = match tokio::time::timeout(READ_TIMEOUT, lines.next_line()).await {
            Ok(Ok(Some(line))) => line,
            Ok(Ok(None)) => {
                tracing::debug!("peer closed connection before sending a request");
                return;
            }
            Ok(Err(error)) => {
                tracing::error!(%error, "failed to read request");
                return;
            }
            Err(_) => {
                tracing::warn!("connection idle past read deadline, dropping");
                return;
            }
        };

        let response = match serde_json::from_str::<SignRequest>(&line) {
            Ok(request) => self.process(request).await,
            Err(error) => {
                tracing::error!(%error, "failed to decode request");
                SignResponse::failure("Invalid request format")
            }
        };

        let mut payload = match serde_json::to_string(&response) {
            Ok(payload) => payload,
            Err(error) => {
                tracing::error!(%error, "failed to encode response");
                return;
            }
        };
        payload.push('\n');
        if let Err(error) = writer.write_all(payload.as_bytes()).await {
            tracing::error!(%error, "failed to write response");
            return;
        }
        let _ = writer.shutdown().await;
    }

    /// Handles one signing request end to end.
    pub async fn process(&self, request: SignRequest) -> SignResponse {
        let started = Instant::now();

        if request.csr.is_empty() || request.request_id.is_empty() || request.token.is_empty() {
            metrics::record_csr_signing("error", started.elapsed(), Some("missing_fields"));
            return SignResponse::failure("Missing required fields");
        }

        // Token verification already happened at the gateway; the value is
        // logged here only so the two processes' records correlate.
        tracing::debug!(
            request_id = %request.request_id,
            token = %request.token,
            requested_groups = ?request.groups,
            "signing request received"
        );

        match self.sign(&request).await {
            Ok(data) => {
                metrics::record_csr_signing("success", started.elapsed(), None);
                SignResponse::success(data)
            }
            Err(error) => {
                metrics::record_csr_signing("error", started.elapsed(), Some(error_kind(&error)));
                tracing::error!(request_id = %request.request_id, %error, "failed to sign CSR");
                SignResponse::failure("Failed to sign CSR")
            }
        }
    }

    async fn sign(&self, request: &SignRequest) -> Result<SignData, SignError> {
        let parsed = csr::parse_csr(&request.csr)?;
        let username = parsed.username.clone();

        let actual = match self.registry.user_groups(&username).await {
            Ok(groups) => groups,
            Err(error) => {
                tracing::error!(
                    %username,
                    %error,
                    "registry group lookup failed; issuing with baseline groups only"
                );
                Vec::new()
            }
        };

        let authorized = authorize::authorized_groups(&username, &request.groups, &actual);
        tracing::info!(
            %username,
            requested = ?request.groups,
            actual = ?actual,
            authorized = ?authorized,
            "authorised group set computed"
        );

        let certificate = sign::sign_certificate(
            &self.ca,
            &parsed,
            &authorized,
            &self.group_oid,
            self.validity_days,
        )?;

        Ok(SignData {
            certificate,
            ca_certificate: self.ca.cert_pem.clone(),
        })
    }
}

fn remove_stale_socket(path: &Path) -> std::io::Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(error) => Err(error),
    }
}

/// Stable label for the signing-error metric.
fn error_kind(error: &SignError) -> &'static str {
    match error {
        SignError::Csr(_) => "csr_parse",
        SignError::OpenSsl(_) => "crypto",
        SignError::GroupExtension(_) => "group_extension",
        SignError::Read { .. } => "io",
        SignError::UnsupportedKeyType(_) | SignError::KeyNotPem => "key_format",
        SignError::Utf8 => "encoding",
    }
}

/// Convenience for binaries and tests: resolves the socket path from
/// configuration.
pub fn socket_path(config: &certm3_kernel::Config) -> PathBuf {
    PathBuf::from(&config.signer.socket_path)
}
