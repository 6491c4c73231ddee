mod connection;
mod error;
mod forwarder;
mod tls;

use std::path::PathBuf;

use clap::Parser;
use rtun_core::backoff::HealthTracker;
use rtun_core::config::{ClientSection, FileConfig};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// rtun-client: durable tunnel client, dials out to an rtun-server and
/// forwards registered-subdomain traffic to a local origin.
#[derive(Parser, Debug)]
#[command(name = "rtun-client", version, about)]
struct Cli {
    /// Optional TOML config file; CLI flags below override its `[client]` section.
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long)]
    server: Option<String>,

    #[arg(long)]
    server_port: Option<u16>,

    #[arg(long)]
    local: Option<String>,

    #[arg(long)]
    local_port: Option<u16>,

    #[arg(long)]
    subdomain: Option<String>,

    #[arg(long)]
    no_ssl: bool,

    /// Skip TLS certificate verification. Off by default.
    #[arg(long)]
    insecure: bool,
}

impl Cli {
    fn apply(self, mut section: ClientSection) -> ClientSection {
        if let Some(server) = self.server {
            section.server = server;
        }
        if let Some(port) = self.server_port {
            section.server_port = port;
        }
        if let Some(local) = self.local {
            section.local = local;
        }
        if let Some(port) = self.local_port {
            section.local_port = port;
        }
        if let Some(subdomain) = self.subdomain {
            section.subdomain = Some(subdomain);
        }
        if self.no_ssl {
            section.no_ssl = true;
        }
        if self.insecure {
            section.insecure = true;
        }
        section
    }
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "rtun_client=info".into()),
        )
        .init();
}

#[tokio::main]
async fn main() {
    color_eyre::install().ok();
    init_tracing();
    rustls::crypto::ring::default_provider()
        .install_default()
        .ok();

    let cli = Cli::parse();
    let config_path = cli.config.clone();

    let file_config = match FileConfig::load(config_path.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            error!("configuration error: {e}");
            std::process::exit(2);
        }
    };
    let section = cli.apply(file_config.client);

    if section.server.is_empty() {
        error!("configuration error: --server is required");
        std::process::exit(2);
    }
    if section.subdomain.is_none() {
        error!("configuration error: --subdomain is required");
        std::process::exit(2);
    }

    let shutdown = CancellationToken::new();
    spawn_signal_handler(shutdown.clone());

    run(section, shutdown).await;
    std::process::exit(0);
}

/// Idle → (Connecting → Registering → Serving → Reconnecting)* loop,
/// applying the backoff policy between attempts until a graceful
/// shutdown is observed.
async fn run(section: ClientSection, shutdown: CancellationToken) {
    let mut health = HealthTracker::new();

    loop {
        if shutdown.is_cancelled() {
            break;
        }

        match connection::run_once(&section, shutdown.clone()).await {
            Ok(result) if result.graceful => {
                info!("graceful shutdown complete");
                break;
            }
            Ok(result) => {
                if result.served_for >= std::time::Duration::from_secs(60) {
                    health.record_success();
                    health.reset_after_stable_session();
                } else {
                    health.record_failure();
                }
            }
            Err(e) => {
                warn!("connection attempt failed: {e}");
                health.record_failure();
            }
        }

        if shutdown.is_cancelled() {
            break;
        }

        let delay = health.next_delay();
        info!(delay_secs = delay.as_secs(), attempts = health.consecutive_failures(), "reconnecting");
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.cancelled() => break,
        }
    }
}

fn spawn_signal_handler(shutdown: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("failed to register SIGTERM handler");
            tokio::select! {
                _ = ctrl_c => info!("received Ctrl+C, shutting down…"),
                _ = sigterm.recv() => info!("received SIGTERM, shutting down…"),
            }
        }
        #[cfg(not(unix))]
        {
            ctrl_c.await.ok();
            info!("received Ctrl+C, shutting down…");
        }
        shutdown.cancel();
    });
}
