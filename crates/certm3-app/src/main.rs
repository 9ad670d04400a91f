use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

use certm3_app::middleware::RateLimiter;
use certm3_app::registry::RegistryClient;
use certm3_app::{router, testapi, AppState};
use certm3_kernel::{metrics, telemetry, token, Config, TokenManager};

const JWT_SECRET_PATH: &str = "/var/spool/certM3/mw/JWT-secret";
const SHUTDOWN_DRAIN: Duration = Duration::from_secs(30);

#[derive(Parser, Debug)]
#[command(name = "certm3-app")]
#[command(about = "certM3 app gateway")]
struct Args {
    /// Path to the YAML configuration file.
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,
    /// Run the synthetic end-to-end enrolment flow and exit.
    #[arg(long)]
    testapi: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = Config::load(&args.config)
        .with_context(|| format!("failed to load configuration from {}", args.config.display()))?;
    config.validate().context("invalid configuration")?;

    telemetry::init(&config.log_level, &config.log_file, config.verbose)
        .context("failed to initialize logging")?;

    let secret =
        token::load_or_generate_secret(JWT_SECRET_PATH).context("token-signing key unavailable")?;
    let tokens = TokenManager::new(&secret, token::ISSUER, token::AUDIENCE);

    let prometheus = PrometheusBuilder::new()
        .install_recorder()
        .context("failed to install metrics recorder")?;
    metrics::describe_all();

    let registry = RegistryClient::new(&config.app_server.backend_api_url)
        .context("failed to construct registry client")?;
    let rate_limiter = RateLimiter::new(
        config.app_server.rate_limit_per_ip as usize,
        Duration::from_secs(1),
    );

    let bind_addr = config.app_server.bind_addr();
    let state = Arc::new(AppState {
        config,
        tokens,
        registry,
        rate_limiter,
        prometheus: Some(prometheus),
    });

    if args.testapi {
        return testapi::run(state).await;
    }

    let app = router(Arc::clone(&state));
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind {bind_addr}"))?;
    tracing::info!(addr = %bind_addr, "gateway listening");

    // Graceful shutdown: stop accepting on SIGINT/SIGTERM, then give
    // in-flight requests a bounded drain.
    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            wait_for_signal().await;
            shutdown.cancel();
        });
    }

    let graceful = {
        let shutdown = shutdown.clone();
        async move { shutdown.cancelled().await }
    };
    let serve = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(graceful);

    tokio::select! {
        result = serve => {
            result.context("server error")?;
        }
        _ = async {
            shutdown.cancelled().await;
            tokio::time::sleep(SHUTDOWN_DRAIN).await;
        } => {
            tracing::warn!("drain deadline reached, exiting");
        }
    }

    tracing::info!("server stopped");
    Ok(())
}

async fn wait_for_signal() {
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(stream) => stream,
        Err(error) => {
            tracing::error!(?error, "Failed to register a SIGTERM signal handler");
            return;
        }
    };
    let mut sigint = match signal(SignalKind::interrupt()) {
        Ok(stream) => stream,
        Err(error) => {
            tracing::error!(?error, "Failed to register a SIGINT signal handler");
            return;
        }
    };
    tokio::select! {
        _ = sigterm.recv() => tracing::info!("SIGTERM received, beginning shutdown"),
        _ = sigint.recv() => tracing::info!("SIGINT received, beginning shutdown"),
    }
}
