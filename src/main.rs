//! statebridge -- Terraform state backend over the S3 protocol.
//!
//! SIGTERM/SIGINT stop accepting connections; in-flight requests get
//! `server.shutdown_timeout` seconds to finish.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{info, warn};

use statebridge::config::{Config, LoggingConfig};
use statebridge::credentials::{parse_ttl, CredentialIssuer, EnvSecretSource, SigningKeyStore};
use statebridge::deps::{DependencyGraphUpdater, RefreshQueue};
use statebridge::token::{JwtTokenVerifier, TokenVerifier};
use statebridge::verifier::SignatureVerifier;

/// Command-line arguments for the statebridge server.
#[derive(Parser, Debug)]
#[command(
    name = "statebridge",
    version,
    about = "Terraform state backend speaking the S3 protocol"
)]
struct Cli {
    /// Path to the YAML configuration file. Defaults apply when omitted.
    #[arg(short, long)]
    config: Option<String>,

    /// Override the bind address (host:port).
    #[arg(short, long)]
    bind: Option<String>,
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if logging.format.eq_ignore_ascii_case("json") {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => statebridge::config::load_config(path)?,
        None => Config::default(),
    };
    init_tracing(&config.logging);
    if let Some(path) = &cli.config {
        info!("Loaded configuration from {}", path);
    }

    let bind_addr = cli
        .bind
        .unwrap_or_else(|| format!("{}:{}", config.server.host, config.server.port));

    if config.observability.metrics {
        statebridge::metrics::init_metrics()?;
        statebridge::metrics::describe_metrics();
        info!("Prometheus metrics initialized");
    }

    let store = statebridge::storage::open_store(&config.storage).await?;

    let sts = &config.auth.sts;
    let keys = Arc::new(SigningKeyStore::load(
        &sts.active_kid,
        &sts.keys,
        Arc::new(EnvSecretSource::new(sts.env_prefix.clone())),
    ));
    info!(kid = keys.active_kid(), "Signing keys loaded");

    let tokens: Arc<dyn TokenVerifier> = Arc::new(JwtTokenVerifier::from_config(&config.auth.token)?);
    let issuer = CredentialIssuer::new(Arc::clone(&keys), parse_ttl(&sts.ttl));
    let verifier = SignatureVerifier::new(Arc::clone(&keys), Arc::clone(&tokens))
        .with_max_clock_skew(config.auth.max_clock_skew);

    let graph = if config.deps.enabled {
        let updater = Arc::new(DependencyGraphUpdater::from_config(&config.deps));
        info!(graph_unit = updater.graph_unit_id(), "Dependency graph refresh enabled");
        Some(RefreshQueue::start(
            Arc::clone(&store),
            updater,
            config.deps.max_pending,
        ))
    } else {
        None
    };

    let shutdown_timeout = Duration::from_secs(config.server.shutdown_timeout);
    let state = Arc::new(statebridge::AppState {
        config,
        store,
        verifier,
        issuer,
        tokens,
        graph,
    });

    let app = statebridge::server::app(state);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!("statebridge listening on {}", bind_addr);

    let (signalled_tx, signalled_rx) = tokio::sync::oneshot::channel::<()>();
    let server = axum::serve(listener, app).with_graceful_shutdown(async move {
        shutdown_signal().await;
        let _ = signalled_tx.send(());
    });
    let mut serve = tokio::spawn(async move { server.await });

    tokio::select! {
        biased;
        res = &mut serve => res??,
        _ = signalled_rx => {
            match tokio::time::timeout(shutdown_timeout, &mut serve).await {
                Ok(res) => res??,
                Err(_) => warn!(
                    timeout_secs = shutdown_timeout.as_secs(),
                    "in-flight requests did not finish before the shutdown timeout"
                ),
            }
        }
    }

    info!("statebridge shut down");
    Ok(())
}

/// Wait for SIGTERM or SIGINT (Ctrl+C), then return to trigger graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("failed to listen for Ctrl+C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!("failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT, shutting down");
        },
        _ = terminate => {
            info!("Received SIGTERM, shutting down");
        },
    }
}
