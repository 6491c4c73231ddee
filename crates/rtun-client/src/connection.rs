//! Client Connection Manager: Idle → Connecting → Registering →
//! Serving → Reconnecting. Two cooperating tasks per connection (reader,
//! heartbeat emitter) plus a bounded worker pool for request dispatch,
//! communicating through a single serialized writer task for a durable
//! outbound connection.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use rtun_core::config::ClientSection;
use rtun_core::frame::{
    self, ClosePayload, Frame, HeartbeatPayload, RegisterPayload, PROTOCOL_VERSION,
};

use crate::error::{ClientError, Result};
use crate::forwarder::{self, ForwarderConfig};
use crate::tls;

type BoxRead = Box<dyn AsyncRead + Unpin + Send>;
type BoxWrite = Box<dyn AsyncWrite + Unpin + Send>;

pub struct ConnectionResult {
    /// How long this attempt stayed in `Serving` before ending; drives the
    /// backoff counter reset at >= 60s.
    pub served_for: Duration,
    /// `true` only when the outer shutdown signal ended the connection
    /// gracefully — the caller stops reconnecting in that case.
    pub graceful: bool,
}

fn unix_time() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn spawn_writer(mut writer: BoxWrite) -> mpsc::Sender<Frame> {
    let (tx, mut rx) = mpsc::channel::<Frame>(256);
    tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if let Err(e) = frame::write_frame(&mut writer, &frame).await {
                warn!("control writer error: {e}");
                break;
            }
        }
    });
    tx
}

async fn dial(cfg: &ClientSection) -> Result<(BoxRead, BoxWrite)> {
    let addr = format!("{}:{}", cfg.server, cfg.server_port);
    let tcp = tokio::time::timeout(Duration::from_secs(10), TcpStream::connect(addr.as_str()))
        .await
        .map_err(|_| ClientError::Dial {
            addr: addr.clone(),
            source: std::io::Error::new(std::io::ErrorKind::TimedOut, "connect timed out"),
        })?
        .map_err(|source| ClientError::Dial { addr: addr.clone(), source })?;
    tcp.set_nodelay(true).ok();

    if cfg.no_ssl {
        let (r, w) = tokio::io::split(tcp);
        return Ok((Box::new(r), Box::new(w)));
    }

    let connector = tokio_rustls::TlsConnector::from(tls::client_config(cfg.insecure));
    let server_name = ServerName::try_from(cfg.server.clone())
        .map_err(|e| ClientError::Tls(format!("invalid server name {}: {e}", cfg.server)))?;
    let tls_stream = connector
        .connect(server_name, tcp)
        .await
        .map_err(|e| ClientError::Tls(e.to_string()))?;
    let (r, w) = tokio::io::split(tls_stream);
    Ok((Box::new(r), Box::new(w)))
}

async fn register(
    reader: &mut BoxRead,
    writer: &mut BoxWrite,
    subdomain: &str,
) -> Result<String> {
    frame::write_frame(
        writer,
        &Frame::Register(RegisterPayload {
            subdomain: subdomain.to_string(),
            protocol_version: PROTOCOL_VERSION,
        }),
    )
    .await?;

    let ack = tokio::time::timeout(Duration::from_secs(10), frame::read_frame(reader))
        .await
        .map_err(|_| ClientError::HandshakeTimeout)??;

    match ack {
        Frame::RegisterAck(a) => Ok(a.client_id),
        Frame::RegisterNack(n) => Err(ClientError::RegisterNack(n.reason)),
        other => Err(ClientError::RegisterNack(format!(
            "unexpected frame during registration: {other:?}"
        ))),
    }
}

/// Run one connection attempt end to end: dial, register, serve until
/// disconnected or asked to shut down.
pub async fn run_once(cfg: &ClientSection, outer_shutdown: CancellationToken) -> Result<ConnectionResult> {
    let subdomain = cfg
        .subdomain
        .as_deref()
        .ok_or_else(|| ClientError::Config("--subdomain is required".into()))?;

    info!(server = %cfg.server, port = cfg.server_port, "connecting to tunnel server");
    let (mut reader, mut writer) = dial(cfg).await?;

    let client_id = register(&mut reader, &mut writer, subdomain).await?;
    info!(%client_id, %subdomain, "registered");

    serve(cfg, reader, writer, outer_shutdown).await
}

async fn serve(
    cfg: &ClientSection,
    reader: BoxRead,
    writer: BoxWrite,
    outer_shutdown: CancellationToken,
) -> Result<ConnectionResult> {
    let frame_tx = spawn_writer(writer);
    let conn_shutdown = CancellationToken::new();
    let last_ack = Arc::new(Mutex::new(Instant::now()));
    let nonce = Arc::new(AtomicU64::new(0));
    let semaphore = Arc::new(Semaphore::new(cfg.timing.in_flight_limit));
    let forwarder_cfg = Arc::new(ForwarderConfig {
        local_host: cfg.local.clone(),
        local_port: cfg.local_port,
        request_timeout: Duration::from_secs(cfg.timing.request_timeout_secs),
    });

    let heartbeat_handle = spawn_heartbeat(
        frame_tx.clone(),
        last_ack.clone(),
        nonce,
        conn_shutdown.clone(),
        Duration::from_secs(cfg.timing.heartbeat_interval_secs),
        Duration::from_secs(cfg.timing.heartbeat_timeout_secs),
    );

    let started = Instant::now();
    let mut reader = reader;
    let mut graceful = false;

    loop {
        tokio::select! {
            _ = conn_shutdown.cancelled() => {
                warn!("heartbeat timeout, disconnecting");
                break;
            }
            _ = outer_shutdown.cancelled() => {
                graceful = true;
                let _ = frame_tx
                    .send(Frame::Close(ClosePayload { reason: Some("client-shutdown".into()) }))
                    .await;
                let drain = semaphore.acquire_many(cfg.timing.in_flight_limit as u32);
                let _ = tokio::time::timeout(Duration::from_secs(2), drain).await;
                break;
            }
            read = frame::read_frame(&mut reader) => {
                match read {
                    Ok(Frame::HeartbeatAck(_)) => {
                        *last_ack.lock().unwrap() = Instant::now();
                    }
                    Ok(Frame::Request(req)) => {
                        dispatch_request(req, &semaphore, &forwarder_cfg, &frame_tx);
                    }
                    Ok(Frame::Close(_)) => {
                        info!("server requested close");
                        break;
                    }
                    Ok(other) => {
                        warn!("unexpected frame while serving: {other:?}");
                    }
                    Err(e) => {
                        warn!("control connection read error: {e}");
                        break;
                    }
                }
            }
        }
    }

    conn_shutdown.cancel();
    heartbeat_handle.abort();

    Ok(ConnectionResult {
        served_for: started.elapsed(),
        graceful,
    })
}

fn spawn_heartbeat(
    frame_tx: mpsc::Sender<Frame>,
    last_ack: Arc<Mutex<Instant>>,
    nonce: Arc<AtomicU64>,
    conn_shutdown: CancellationToken,
    interval: Duration,
    timeout: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await; // first tick fires immediately; skip it
        loop {
            tokio::select! {
                _ = conn_shutdown.cancelled() => return,
                _ = ticker.tick() => {}
            }
            let n = nonce.fetch_add(1, Ordering::Relaxed);
            let sent = frame_tx
                .send(Frame::Heartbeat(HeartbeatPayload { nonce: n, timestamp: unix_time() }))
                .await;
            if sent.is_err() {
                conn_shutdown.cancel();
                return;
            }
            let elapsed = last_ack.lock().unwrap().elapsed();
            if elapsed > timeout {
                conn_shutdown.cancel();
                return;
            }
        }
    })
}

fn dispatch_request(
    req: rtun_core::frame::RequestPayload,
    semaphore: &Arc<Semaphore>,
    forwarder_cfg: &Arc<ForwarderConfig>,
    frame_tx: &mpsc::Sender<Frame>,
) {
    let request_id = req.request_id;
    match semaphore.clone().try_acquire_owned() {
        Ok(permit) => {
            let forwarder_cfg = forwarder_cfg.clone();
            let frame_tx = frame_tx.clone();
            tokio::spawn(async move {
                let _permit = permit;
                let resp = forwarder::forward(&req, &forwarder_cfg).await;
                let _ = frame_tx.send(Frame::Response(resp)).await;
            });
        }
        Err(_) => {
            warn!(request_id, "in-flight limit reached, rejecting request");
            let overloaded = rtun_core::frame::ResponsePayload {
                request_id,
                status_code: 502,
                reason: Some("client-overloaded".to_string()),
                headers: rtun_core::headers::HeaderList::new(),
                body: Vec::new(),
            };
            let frame_tx = frame_tx.clone();
            tokio::spawn(async move {
                let _ = frame_tx.send(Frame::Response(overloaded)).await;
            });
        }
    }
}
