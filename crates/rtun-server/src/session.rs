//! Control Session: per-client state machine from registration
//! through draining to close, owning request dispatch and response
//! demultiplexing for a single control connection.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use rtun_core::config::TimingConfig;
use rtun_core::frame::{self, ErrorPayload, Frame, HeartbeatPayload, RequestPayload, ResponsePayload};
use rtun_core::headers::HeaderList;

use crate::registry::{TunnelRegistry, TunnelSnapshot};

pub type BoxRead = Box<dyn AsyncRead + Unpin + Send>;
pub type BoxWrite = Box<dyn AsyncWrite + Unpin + Send>;

/// Session lifecycle, as observed once a client has registered a subdomain.
/// `Connecting`/`Awaiting-Registration` precede the existence of a
/// [`Session`] value — the handshake that produces one is handled in
/// `control_listener::handshake` before any `Session` is constructed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    Registered = 0,
    Draining = 1,
    Closed = 2,
}

impl SessionState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Registered,
            1 => Self::Draining,
            _ => Self::Closed,
        }
    }
}

/// Resolution of a pending request's one-shot slot.
enum SlotOutcome {
    Response(ResponsePayload),
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchError {
    /// The session closed (or was already closed) before a response arrived.
    SessionClosed,
    /// `request_timeout` elapsed with no response.
    Timeout,
}

/// A registered client's control connection. Reachable from the Tunnel
/// Registry (for lookup/unregister) and from the public front-end (for
/// request submission); the reader loop in [`run`] is the only place that
/// drives frame I/O.
pub struct Session {
    pub subdomain: String,
    pub client_id: String,
    pub peer_addr: SocketAddr,
    pub registered_at: Instant,

    state: AtomicU8,
    last_heartbeat_at: Mutex<Instant>,
    last_frame_at: Mutex<Instant>,

    next_request_id: AtomicU64,
    pending: Mutex<HashMap<u64, oneshot::Sender<SlotOutcome>>>,
    frame_tx: mpsc::Sender<Frame>,

    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    request_count: AtomicU64,
    error_count: AtomicU64,
}

impl Session {
    fn new(
        subdomain: String,
        client_id: String,
        peer_addr: SocketAddr,
        frame_tx: mpsc::Sender<Frame>,
    ) -> Self {
        let now = Instant::now();
        Self {
            subdomain,
            client_id,
            peer_addr,
            registered_at: now,
            state: AtomicU8::new(SessionState::Registered as u8),
            last_heartbeat_at: Mutex::new(now),
            last_frame_at: Mutex::new(now),
            next_request_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
            frame_tx,
            bytes_in: AtomicU64::new(0),
            bytes_out: AtomicU64::new(0),
            request_count: AtomicU64::new(0),
            error_count: AtomicU64::new(0),
        }
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: SessionState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn touch(&self) {
        *self.last_frame_at.lock().unwrap() = Instant::now();
    }

    fn record_heartbeat(&self) {
        *self.last_heartbeat_at.lock().unwrap() = Instant::now();
    }

    pub fn last_frame_at(&self) -> Instant {
        *self.last_frame_at.lock().unwrap()
    }

    pub fn snapshot(&self, subdomain: String) -> TunnelSnapshot {
        TunnelSnapshot {
            subdomain,
            client_id: self.client_id.clone(),
            peer_addr: self.peer_addr,
            registered_at: self.registered_at,
            last_heartbeat_at: *self.last_heartbeat_at.lock().unwrap(),
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            bytes_out: self.bytes_out.load(Ordering::Relaxed),
            request_count: self.request_count.load(Ordering::Relaxed),
            error_count: self.error_count.load(Ordering::Relaxed),
        }
    }

    /// Submit an HTTP request to the client over the control channel and
    /// await the matching response, honoring `timeout`.
    pub async fn submit_request(
        &self,
        method: String,
        path: String,
        headers: HeaderList,
        body: Vec<u8>,
        timeout: Duration,
    ) -> Result<ResponsePayload, DispatchError> {
        if self.state() != SessionState::Registered {
            return Err(DispatchError::SessionClosed);
        }

        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(request_id, tx);

        let request = RequestPayload {
            request_id,
            method,
            path,
            headers,
            body,
        };
        self.request_count.fetch_add(1, Ordering::Relaxed);
        self.bytes_out
            .fetch_add(request.body.len() as u64, Ordering::Relaxed);

        if self.frame_tx.send(Frame::Request(request)).await.is_err() {
            self.pending.lock().unwrap().remove(&request_id);
            return Err(DispatchError::SessionClosed);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(SlotOutcome::Response(resp))) => {
                self.bytes_in
                    .fetch_add(resp.body.len() as u64, Ordering::Relaxed);
                Ok(resp)
            }
            Ok(Ok(SlotOutcome::Closed)) | Ok(Err(_)) => Err(DispatchError::SessionClosed),
            Err(_elapsed) => {
                // No response will come; drop the slot so a late RESPONSE is
                // discarded rather than delivered to nobody.
                self.pending.lock().unwrap().remove(&request_id);
                Err(DispatchError::Timeout)
            }
        }
    }

    /// Send a frame directly on the writer channel, bypassing pending-slot
    /// bookkeeping. Used by the handshake for `REGISTER_ACK`/`REGISTER_NACK`
    /// and by the reader loop for `HEARTBEAT_ACK`.
    pub(crate) async fn send_control(&self, frame: Frame) -> std::result::Result<(), ()> {
        self.frame_tx.send(frame).await.map_err(|_| ())
    }

    pub(crate) fn deliver_response(&self, resp: ResponsePayload) {
        let slot = self.pending.lock().unwrap().remove(&resp.request_id);
        match slot {
            Some(tx) => {
                let _ = tx.send(SlotOutcome::Response(resp));
            }
            None => {
                debug!(request_id = resp.request_id, subdomain = %self.subdomain, "late response, no pending slot");
            }
        }
    }

    fn fail_all_pending(&self) {
        let pending: HashMap<_, _> = std::mem::take(&mut *self.pending.lock().unwrap());
        for (_, tx) in pending {
            let _ = tx.send(SlotOutcome::Closed);
        }
    }
}

/// Spawn the single serialized writer task for this connection: every
/// outbound frame, from the reader loop's heartbeat echoes and the
/// front-end's request submissions alike, funnels through this one task so
/// writes are never interleaved.
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

pub fn unix_time() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Construct a `Registered` session around an already-accepted connection,
/// spawning its writer task. Called by `control_listener` after a
/// successful `REGISTER`.
pub fn new_registered(
    subdomain: String,
    client_id: String,
    peer_addr: SocketAddr,
    writer: BoxWrite,
) -> Arc<Session> {
    let frame_tx = spawn_writer(writer);
    Arc::new(Session::new(subdomain, client_id, peer_addr, frame_tx))
}

/// Drive the reader side of a registered session until it closes, then
/// tear it down: fail every pending slot, unregister (only if still the
/// occupant), and let the writer task wind down with the last `Arc`.
pub async fn run(session: Arc<Session>, mut reader: BoxRead, registry: Arc<TunnelRegistry>, timing: TimingConfig) {
    let heartbeat_timeout = Duration::from_secs(timing.heartbeat_timeout_secs);
    let mut close_reason = "eof";

    loop {
        let read = tokio::time::timeout(heartbeat_timeout, frame::read_frame(&mut reader)).await;
        match read {
            Ok(Ok(frame)) => {
                session.touch();
                match frame {
                    Frame::Heartbeat(HeartbeatPayload { nonce, .. }) => {
                        session.record_heartbeat();
                        let ack = Frame::HeartbeatAck(HeartbeatPayload {
                            nonce,
                            timestamp: unix_time(),
                        });
                        if session.frame_tx.send(ack).await.is_err() {
                            close_reason = "writer-closed";
                            break;
                        }
                    }
                    Frame::Response(resp) => session.deliver_response(resp),
                    Frame::Close(_) => {
                        close_reason = "client-close";
                        session.set_state(SessionState::Draining);
                        break;
                    }
                    Frame::Error(e) => {
                        session.error_count.fetch_add(1, Ordering::Relaxed);
                        warn!(subdomain = %session.subdomain, "peer reported error: {}", e.message);
                    }
                    other => {
                        warn!(subdomain = %session.subdomain, "unexpected frame in Registered state: {other:?}");
                    }
                }
            }
            Ok(Err(e)) => {
                warn!(subdomain = %session.subdomain, "control session read error: {e}");
                let _ = session
                    .frame_tx
                    .send(Frame::Error(ErrorPayload { message: e.to_string() }))
                    .await;
                close_reason = "read-error";
                break;
            }
            Err(_elapsed) => {
                warn!(subdomain = %session.subdomain, "heartbeat timeout");
                close_reason = "heartbeat-timeout";
                break;
            }
        }
    }

    session.set_state(SessionState::Closed);
    session.fail_all_pending();
    registry.unregister(&session.subdomain, &session);
    info!(subdomain = %session.subdomain, client_id = %session.client_id, reason = close_reason, "control session closed");
}

#[cfg(test)]
pub mod test_support {
    use super::*;

    /// A `Session` with no live writer, for registry unit tests that only
    /// care about identity and subdomain, never actual frame I/O.
    pub fn test_session(subdomain: &str) -> Arc<Session> {
        let (tx, rx) = mpsc::channel::<Frame>(1);
        std::mem::forget(rx); // keep tx usable without a live writer task
        Arc::new(Session::new(
            subdomain.to_string(),
            "test-client".to_string(),
            "127.0.0.1:0".parse().unwrap(),
            tx,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rtun_core::headers::HeaderList;

    #[tokio::test]
    async fn submit_request_times_out_without_response() {
        let (tx, mut rx) = mpsc::channel::<Frame>(4);
        let session = Arc::new(Session::new(
            "p".into(),
            "c1".into(),
            "127.0.0.1:0".parse().unwrap(),
            tx,
        ));
        let session2 = session.clone();
        tokio::spawn(async move {
            // Drain the REQUEST frame but never answer it.
            let _ = rx.recv().await;
            let _ = session2; // keep session alive for the duration
        });

        let err = session
            .submit_request(
                "GET".into(),
                "/".into(),
                HeaderList::new(),
                Vec::new(),
                Duration::from_millis(20),
            )
            .await
            .unwrap_err();
        assert_eq!(err, DispatchError::Timeout);
        assert!(session.pending.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn submit_request_resolves_on_matching_response() {
        let (tx, mut rx) = mpsc::channel::<Frame>(4);
        let session = Arc::new(Session::new(
            "p".into(),
            "c1".into(),
            "127.0.0.1:0".parse().unwrap(),
            tx,
        ));
        let session2 = session.clone();
        tokio::spawn(async move {
            if let Some(Frame::Request(req)) = rx.recv().await {
                session2.deliver_response(ResponsePayload {
                    request_id: req.request_id,
                    status_code: 200,
                    reason: None,
                    headers: HeaderList::new(),
                    body: b"ok".to_vec(),
                });
            }
        });

        let resp = session
            .submit_request(
                "GET".into(),
                "/hello".into(),
                HeaderList::new(),
                Vec::new(),
                Duration::from_secs(1),
            )
            .await
            .unwrap();
        assert_eq!(resp.status_code, 200);
        assert_eq!(resp.body, b"ok");
    }

    #[tokio::test]
    async fn fail_all_pending_resolves_outstanding_slots() {
        let (tx, _rx) = mpsc::channel::<Frame>(4);
        let session = Arc::new(Session::new(
            "p".into(),
            "c1".into(),
            "127.0.0.1:0".parse().unwrap(),
            tx,
        ));
        let session2 = session.clone();
        let submit = tokio::spawn(async move {
            session2
                .submit_request(
                    "GET".into(),
                    "/".into(),
                    HeaderList::new(),
                    Vec::new(),
                    Duration::from_secs(5),
                )
                .await
        });
        // Give the submission a chance to register its pending slot.
        tokio::time::sleep(Duration::from_millis(10)).await;
        session.fail_all_pending();
        let err = submit.await.unwrap().unwrap_err();
        assert_eq!(err, DispatchError::SessionClosed);
    }

    #[tokio::test]
    async fn submit_request_rejected_once_draining() {
        let (tx, _rx) = mpsc::channel::<Frame>(4);
        let session = Arc::new(Session::new(
            "p".into(),
            "c1".into(),
            "127.0.0.1:0".parse().unwrap(),
            tx,
        ));
        session.set_state(SessionState::Draining);
        let err = session
            .submit_request(
                "GET".into(),
                "/".into(),
                HeaderList::new(),
                Vec::new(),
                Duration::from_secs(1),
            )
            .await
            .unwrap_err();
        assert_eq!(err, DispatchError::SessionClosed);
    }

    #[tokio::test]
    async fn read_error_emits_error_frame_before_close() {
        let (client_side, server_side) = tokio::io::duplex(64 * 1024);
        let (mut client_read, mut client_write) = tokio::io::split(client_side);
        let (server_read, server_write) = tokio::io::split(server_side);

        let registry = Arc::new(TunnelRegistry::new());
        let session = new_registered(
            "p".into(),
            "c1".into(),
            "127.0.0.1:0".parse().unwrap(),
            Box::new(server_write),
        );
        registry.register("p", session.clone()).unwrap();

        let run_handle = tokio::spawn(run(
            session.clone(),
            Box::new(server_read),
            registry.clone(),
            TimingConfig::default(),
        ));

        // An oversize length prefix is a framing error the reader must treat
        // as fatal to the session but not to the process.
        use tokio::io::AsyncWriteExt;
        client_write
            .write_u32((frame::MAX_FRAME_SIZE as u32) + 1)
            .await
            .unwrap();

        let echoed = tokio::time::timeout(Duration::from_secs(1), frame::read_frame(&mut client_read))
            .await
            .expect("session should emit an ERROR frame before closing")
            .unwrap();
        assert!(matches!(echoed, Frame::Error(_)));

        run_handle.await.unwrap();
        assert_eq!(session.state(), SessionState::Closed);
        assert!(registry.lookup("p").is_none());
    }
}
