mod control_listener;
mod error;
mod frontend;
mod registry;
mod session;
mod status;
mod tls;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use rtun_core::config::{FileConfig, ServerSection};

use crate::error::ServerError;
use crate::registry::TunnelRegistry;

/// rtun-server: rendezvous server for the rtun reverse HTTP tunnel.
#[derive(Parser, Debug)]
#[command(name = "rtun-server", version, about)]
struct Cli {
    /// Optional TOML config file; CLI flags below override its `[server]` section.
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long)]
    host: Option<String>,

    #[arg(long)]
    control_port: Option<u16>,

    #[arg(long)]
    http_port: Option<u16>,

    /// The apex zone tunnels are served under, e.g. `tunnel.example.com`.
    #[arg(long)]
    zone: Option<String>,

    #[arg(long)]
    no_ssl: bool,

    #[arg(long)]
    cert: Option<PathBuf>,

    #[arg(long)]
    key: Option<PathBuf>,
}

impl Cli {
    fn apply(self, mut section: ServerSection) -> ServerSection {
        if let Some(host) = self.host {
            section.host = host;
        }
        if let Some(port) = self.control_port {
            section.control_port = port;
        }
        if let Some(port) = self.http_port {
            section.http_port = port;
        }
        if let Some(zone) = self.zone {
            section.zone = zone;
        }
        if self.no_ssl {
            section.no_ssl = true;
        }
        if let Some(cert) = self.cert {
            section.cert = Some(cert);
        }
        if let Some(key) = self.key {
            section.key = Some(key);
        }
        section
    }
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "rtun_server=info,tower_http=info".into()),
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
    let section = cli.apply(file_config.server);

    match run(section).await {
        Ok(()) => std::process::exit(0),
        Err(e @ (ServerError::Bind { .. } | ServerError::TlsLoad(_))) => {
            error!("startup failed: {e}");
            std::process::exit(1);
        }
        Err(ServerError::Config(e)) => {
            error!("configuration error: {e}");
            std::process::exit(2);
        }
        Err(e) => {
            error!("fatal error: {e}");
            std::process::exit(1);
        }
    }
}

async fn run(section: ServerSection) -> Result<(), ServerError> {
    let registry = Arc::new(TunnelRegistry::new());
    let shutdown = CancellationToken::new();
    spawn_signal_handler(shutdown.clone());

    let control_addr: SocketAddr = format!("{}:{}", section.host, section.control_port)
        .parse()
        .map_err(|e| ServerError::Config(format!("invalid control listen address: {e}")))?;
    let http_addr: SocketAddr = format!("{}:{}", section.host, section.http_port)
        .parse()
        .map_err(|e| ServerError::Config(format!("invalid http listen address: {e}")))?;

    let tls_acceptor = if section.no_ssl {
        None
    } else {
        let cert = section
            .cert
            .clone()
            .ok_or_else(|| ServerError::Config("--cert is required unless --no-ssl".into()))?;
        let key = section
            .key
            .clone()
            .ok_or_else(|| ServerError::Config("--key is required unless --no-ssl".into()))?;
        let server_config = tls::load_server_config(&cert, &key)?;
        Some(tokio_rustls::TlsAcceptor::from(server_config))
    };

    let control = control_listener::serve(
        control_addr,
        tls_acceptor,
        registry.clone(),
        section.timing.clone(),
        shutdown.clone(),
    );

    let frontend_state = Arc::new(frontend::FrontendState {
        registry: registry.clone(),
        zone: section.zone.clone(),
        timing: section.timing.clone(),
        tls: !section.no_ssl,
        redact_client_ips: section.redact_client_ips,
    });
    let app = frontend::router(frontend_state);
    let http_listener = tokio::net::TcpListener::bind(http_addr)
        .await
        .map_err(|source| ServerError::Bind { addr: http_addr, source })?;
    info!(%http_addr, zone = %section.zone, "public HTTP front-end listening");

    let http = axum::serve(
        http_listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown.clone().cancelled_owned());

    tokio::select! {
        res = control => res?,
        res = http => { res?; }
    }

    info!("rtun-server shut down cleanly");
    Ok(())
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
