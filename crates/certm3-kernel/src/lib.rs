/*!
# certm3-kernel

Shared kernel for the certM3 middleware tier. Both the app gateway and the
signer daemon link against this crate; it carries the pieces that must agree
across the two processes:

* [`config`]: the YAML configuration file both binaries load.
* [`token`]: the HMAC-signed bearer token that carries `(user_id,
  request_id)` from email validation to CSR submission, plus the persistent
  signing-key file.
* [`metrics`]: the Prometheus metric surface (names, labels, helpers).
* [`telemetry`]: structured JSON logging to the shared log file.

The kernel deliberately has no networking: HTTP belongs to the gateway and
the socket protocol to the signer.
*/

pub mod config;
pub mod metrics;
pub mod telemetry;
pub mod token;

pub use config::Config;
pub use token::TokenManager;
