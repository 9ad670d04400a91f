use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;

use certm3_kernel::{telemetry, Config};
use certm3_signer::registry::RegistryClient;
use certm3_signer::service::{socket_path, SignerService};
use certm3_signer::{sign, signal_handler};

#[derive(Parser, Debug)]
#[command(name = "certm3-signer")]
#[command(about = "certM3 signing daemon")]
struct Args {
    /// Path to the YAML configuration file.
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = Config::load(&args.config)
        .with_context(|| format!("failed to load configuration from {}", args.config.display()))?;
    config.validate().context("invalid configuration")?;

    telemetry::init(&config.log_level, &config.log_file, config.verbose)
        .context("failed to initialize logging")?;

    // CA material and the extension OID are loaded and checked before the
    // socket opens; a misconfigured CA must never accept a connection.
    let ca = sign::load_ca(&config.signer.ca_cert_path, &config.signer.ca_key_path)
        .context("failed to load CA material")?;
    let registry = RegistryClient::new(&config.app_server.backend_api_url)
        .context("failed to construct registry client")?;

    let service = Arc::new(SignerService::new(
        ca,
        registry,
        config.signer.role_extension_oid.clone(),
        config.signer.cert_validity_days,
    ));

    let halt = CancellationToken::new();
    tokio::spawn(signal_handler(halt.clone()));

    service.run(&socket_path(&config), halt).await
}
