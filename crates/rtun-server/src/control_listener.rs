//! The server's control-channel listener: accepts client connections,
//! drives the `Awaiting-Registration` handshake, then hands each
//! successfully registered connection off to [`session::run`].

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tracing::{info, warn};

use rtun_core::config::TimingConfig;
use rtun_core::frame::{self, Frame, RegisterAckPayload, RegisterNackPayload, PROTOCOL_VERSION};

use crate::error::{Result, ServerError};
use crate::registry::TunnelRegistry;
use crate::session::{self, BoxRead, BoxWrite};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Run the control listener until the process is asked to shut down.
pub async fn serve(
    addr: SocketAddr,
    tls_acceptor: Option<TlsAcceptor>,
    registry: Arc<TunnelRegistry>,
    timing: TimingConfig,
    shutdown: tokio_util::sync::CancellationToken,
) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|source| ServerError::Bind { addr, source })?;
    info!(%addr, "control listener bound");

    loop {
        let accepted = tokio::select! {
            res = listener.accept() => res,
            _ = shutdown.cancelled() => {
                info!("control listener shutting down");
                return Ok(());
            }
        };
        let (stream, peer_addr) = match accepted {
            Ok(pair) => pair,
            Err(e) => {
                warn!("control accept error: {e}");
                continue;
            }
        };
        stream.set_nodelay(true).ok();

        let registry = registry.clone();
        let tls_acceptor = tls_acceptor.clone();
        let timing = timing.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, peer_addr, tls_acceptor, registry, timing).await {
                warn!(%peer_addr, "control connection ended: {e}");
            }
        });
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    tls_acceptor: Option<TlsAcceptor>,
    registry: Arc<TunnelRegistry>,
    timing: TimingConfig,
) -> Result<()> {
    let (reader, writer): (BoxRead, BoxWrite) = match tls_acceptor {
        Some(acceptor) => {
            let tls_stream = acceptor.accept(stream).await?;
            let (r, w) = tokio::io::split(tls_stream);
            (Box::new(r), Box::new(w))
        }
        None => {
            let (r, w) = tokio::io::split(stream);
            (Box::new(r), Box::new(w))
        }
    };

    match handshake(reader, writer, peer_addr).await? {
        Some((session, reader)) => {
            match registry.register(&session.subdomain, session.clone()) {
                Ok(()) => {
                    send_ack(&session, session.client_id.clone()).await;
                    info!(subdomain = %session.subdomain, client_id = %session.client_id, %peer_addr, "tunnel registered");
                    session::run(session, reader, registry, timing).await;
                }
                Err(_conflict) => {
                    send_nack(&session, "conflict").await;
                    warn!(subdomain = %session.subdomain, %peer_addr, "registration conflict");
                }
            }
            Ok(())
        }
        None => Ok(()),
    }
}

/// Read and validate the mandatory first `REGISTER` frame, constructing a
/// not-yet-registered `Session` whose writer task is already running so a
/// NACK (or the eventual ACK) can be sent on it. Returns `None` if the
/// handshake itself failed before a `Session` could be built.
async fn handshake(
    mut reader: BoxRead,
    writer: BoxWrite,
    peer_addr: SocketAddr,
) -> Result<Option<(Arc<session::Session>, BoxRead)>> {
    let frame = match tokio::time::timeout(HANDSHAKE_TIMEOUT, frame::read_frame(&mut reader)).await {
        Ok(Ok(frame)) => frame,
        Ok(Err(e)) => {
            warn!(%peer_addr, "handshake framing error: {e}");
            return Ok(None);
        }
        Err(_elapsed) => {
            warn!(%peer_addr, "handshake timed out waiting for REGISTER");
            return Ok(None);
        }
    };

    let register = match frame {
        Frame::Register(r) => r,
        other => {
            warn!(%peer_addr, "first frame was not REGISTER: {other:?}");
            return Ok(None);
        }
    };

    if register.protocol_version != PROTOCOL_VERSION {
        let mut tmp_writer = writer;
        let _ = frame::write_frame(
            &mut tmp_writer,
            &Frame::RegisterNack(RegisterNackPayload {
                reason: "version".to_string(),
            }),
        )
        .await;
        return Ok(None);
    }

    let subdomain = match validate_subdomain(&register.subdomain) {
        Ok(s) => s,
        Err(reason) => {
            let mut tmp_writer = writer;
            let _ = frame::write_frame(
                &mut tmp_writer,
                &Frame::RegisterNack(RegisterNackPayload { reason }),
            )
            .await;
            return Ok(None);
        }
    };

    let client_id = generate_client_id();
    let session = session::new_registered(subdomain, client_id, peer_addr, writer);
    Ok(Some((session, reader)))
}

async fn send_ack(session: &Arc<session::Session>, client_id: String) {
    let ack = Frame::RegisterAck(RegisterAckPayload {
        client_id,
        server_time: session::unix_time(),
        protocol_version: PROTOCOL_VERSION,
    });
    // The writer task was spawned as part of `new_registered`; reach it
    // through the normal request-submission channel path is unavailable
    // pre-registration, so send directly via the session's internal sender.
    let _ = session.send_control(ack).await;
}

async fn send_nack(session: &Arc<session::Session>, reason: &str) {
    let nack = Frame::RegisterNack(RegisterNackPayload {
        reason: reason.to_string(),
    });
    let _ = session.send_control(nack).await;
}

/// `[a-z0-9](-?[a-z0-9])*`, non-empty, length <= 63, lowercased at ingress.
fn validate_subdomain(raw: &str) -> std::result::Result<String, String> {
    let s = raw.to_ascii_lowercase();
    if s.is_empty() || s.len() > 63 {
        return Err("invalid".to_string());
    }
    let bytes = s.as_bytes();
    let is_label_char = |b: u8| b.is_ascii_lowercase() || b.is_ascii_digit();
    if !is_label_char(bytes[0]) || !is_label_char(bytes[bytes.len() - 1]) {
        return Err("invalid".to_string());
    }
    let mut prev_hyphen = false;
    for &b in bytes {
        if b == b'-' {
            if prev_hyphen {
                return Err("invalid".to_string());
            }
            prev_hyphen = true;
        } else if is_label_char(b) {
            prev_hyphen = false;
        } else {
            return Err("invalid".to_string());
        }
    }
    Ok(s)
}

fn generate_client_id() -> String {
    let mut rng = rand::rng();
    (0..16)
        .map(|_| {
            let idx = rng.random_range(0..16u32);
            std::char::from_digit(idx, 16).unwrap()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_well_formed_labels() {
        assert_eq!(validate_subdomain("p").unwrap(), "p");
        assert_eq!(validate_subdomain("My-App1").unwrap(), "my-app1");
        assert_eq!(validate_subdomain("a-b-c").unwrap(), "a-b-c");
    }

    #[test]
    fn rejects_empty_and_oversize() {
        assert!(validate_subdomain("").is_err());
        assert!(validate_subdomain(&"a".repeat(64)).is_err());
        assert!(validate_subdomain(&"a".repeat(63)).is_ok());
    }

    #[test]
    fn rejects_leading_trailing_and_double_hyphen() {
        assert!(validate_subdomain("-abc").is_err());
        assert!(validate_subdomain("abc-").is_err());
        assert!(validate_subdomain("a--b").is_err());
    }

    #[test]
    fn rejects_non_label_characters() {
        assert!(validate_subdomain("foo.bar").is_err());
        assert!(validate_subdomain("foo_bar").is_err());
        assert!(validate_subdomain("foo bar").is_err());
    }

    #[test]
    fn client_id_is_16_hex_chars() {
        let id = generate_client_id();
        assert_eq!(id.len(), 16);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
