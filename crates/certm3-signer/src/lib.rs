/*!
# certm3-signer

The signing daemon of the certM3 middleware. It listens on a local unix
socket for one-shot JSON signing requests from the app gateway, parses the
submitted PKCS#10 CSR, authorises the claimed group set against the
registry, and returns an X.509 client certificate signed with the CA key.

The daemon is the privilege boundary: it is the only process that can read
the CA private key, and it is reachable only through the socket, never from
the network. See [`service`] for the wire protocol and [`authorize`] for the
group policy.
*/

use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

pub mod authorize;
pub mod csr;
pub mod registry;
pub mod service;
pub mod sign;

/// Installs SIGTERM/SIGINT handlers that cancel `halt_token`.
///
/// In-flight signings complete; the accept loop stops taking new
/// connections and removes the socket file on the way out.
pub async fn signal_handler(halt_token: CancellationToken) -> Result<(), anyhow::Error> {
    let mut sigterm_stream = signal(SignalKind::terminate()).inspect_err(|error| {
        tracing::error!(?error, "Failed to register a SIGTERM signal handler");
    })?;
    let mut sigint_stream = signal(SignalKind::interrupt()).inspect_err(|error| {
        tracing::error!(?error, "Failed to register a SIGINT signal handler");
    })?;

    tokio::select! {
        _ = sigterm_stream.recv() => {
            tracing::info!("SIGTERM received, beginning service shutdown");
        }
        _ = sigint_stream.recv() => {
            tracing::info!("SIGINT received, beginning service shutdown");
        }
    }
    halt_token.cancel();

    Ok(())
}
