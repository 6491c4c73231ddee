//! Public HTTP Front-End: the server's public listener. Parses each
//! inbound HTTP/1.1 request, routes by the `Host` header's subdomain
//! label, and relays it to the owning control session — never blocking
//! that session's read loop while doing so.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Router;
use tower_http::trace::TraceLayer;
use tracing::warn;

use rtun_core::config::TimingConfig;
use rtun_core::headers::HeaderList;

use crate::registry::TunnelRegistry;
use crate::session::DispatchError;
use crate::status;

pub struct FrontendState {
    pub registry: Arc<TunnelRegistry>,
    pub zone: String,
    pub timing: TimingConfig,
    pub tls: bool,
    pub redact_client_ips: bool,
}

pub fn router(state: Arc<FrontendState>) -> Router {
    Router::new()
        .fallback(dispatch)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn dispatch(
    State(state): State<Arc<FrontendState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    req: Request<Body>,
) -> Response {
    let host = host_header(req.headers()).unwrap_or_default();
    let Some(label) = routing_key(&host, &state.zone) else {
        return status::render(&state.registry, state.redact_client_ips);
    };

    let Some(session) = state.registry.lookup(&label) else {
        return bad_gateway(&format!("no tunnel registered for \"{label}\""));
    };

    let method = req.method().to_string();
    let path = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| req.uri().path().to_string());

    let mut headers = collect_headers(req.headers());
    append_forwarded_for(&mut headers, peer.ip().to_string());
    headers.push("X-Forwarded-Proto", if state.tls { "https" } else { "http" });

    let body = match axum::body::to_bytes(req.into_body(), state.timing.max_body_bytes).await {
        Ok(bytes) => bytes.to_vec(),
        Err(_) => return payload_too_large(),
    };

    let timeout = Duration::from_secs(state.timing.request_timeout_secs);
    match session
        .submit_request(method, path, headers, body, timeout)
        .await
    {
        Ok(resp) => build_response(resp, &session.client_id),
        Err(DispatchError::Timeout) => gateway_timeout(),
        Err(DispatchError::SessionClosed) => bad_gateway("tunnel session closed"),
    }
}

fn host_header(headers: &HeaderMap) -> Option<String> {
    headers
        .get(axum::http::header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}

/// `Host = <label>.<zone>` → routing key `<label>`; apex or unrelated host
/// → `None` (status page). Port suffix is dropped, comparison is
/// lowercase.
fn routing_key(host: &str, zone: &str) -> Option<String> {
    let host = host.split(':').next().unwrap_or(host).to_ascii_lowercase();
    let zone = zone.to_ascii_lowercase();
    if host == zone {
        return None;
    }
    let suffix = format!(".{zone}");
    host.strip_suffix(&suffix)
        .filter(|label| !label.is_empty())
        .map(|label| label.to_string())
}

fn collect_headers(headers: &HeaderMap) -> HeaderList {
    let mut out = HeaderList::new();
    for (name, value) in headers {
        if HeaderList::is_hop_by_hop(name.as_str()) {
            continue;
        }
        if let Ok(v) = value.to_str() {
            out.push(name.as_str(), v);
        }
    }
    out
}

fn append_forwarded_for(headers: &mut HeaderList, peer_ip: String) {
    let existing = headers.get("x-forwarded-for").map(|v| v.to_string());
    headers.remove("x-forwarded-for");
    let value = match existing {
        Some(prior) if !prior.is_empty() => format!("{prior}, {peer_ip}"),
        _ => peer_ip,
    };
    headers.push("X-Forwarded-For", value);
}

fn build_response(resp: rtun_core::frame::ResponsePayload, client_id: &str) -> Response {
    let status = StatusCode::from_u16(resp.status_code).unwrap_or(StatusCode::BAD_GATEWAY);
    let mut builder = axum::http::Response::builder().status(status);
    if let Some(header_map) = builder.headers_mut() {
        for (name, value) in resp.headers.iter() {
            if HeaderList::is_hop_by_hop(name) {
                continue;
            }
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                header_map.append(name, value);
            }
        }
        header_map.insert(
            "X-Tunnel-Client",
            HeaderValue::from_str(client_id).unwrap_or(HeaderValue::from_static("")),
        );
    }
    builder
        .body(Body::from(resp.body))
        .unwrap_or_else(|_| bad_gateway("malformed upstream response"))
}

fn bad_gateway(detail: &str) -> Response {
    warn!("502: {detail}");
    (StatusCode::BAD_GATEWAY, format!("502 Bad Gateway: {detail}\n")).into_response()
}

fn gateway_timeout() -> Response {
    (StatusCode::GATEWAY_TIMEOUT, "504 Gateway Timeout\n").into_response()
}

fn payload_too_large() -> Response {
    (StatusCode::PAYLOAD_TOO_LARGE, "413 Payload Too Large\n").into_response()
}


#[cfg(test)]
mod router_tests {
    use super::*;
    use axum::body::Body;
    use http_body_util::BodyExt;
    use rtun_core::frame::{Frame, ResponsePayload};
    use tower::ServiceExt;

    fn peer() -> SocketAddr {
        "203.0.113.9:54321".parse().unwrap()
    }

    fn request(host: &str, addr: SocketAddr) -> Request<Body> {
        let mut req = Request::builder()
            .uri("/widgets")
            .header(axum::http::header::HOST, host)
            .body(Body::empty())
            .unwrap();
        req.extensions_mut().insert(ConnectInfo(addr));
        req
    }

    fn test_state() -> Arc<FrontendState> {
        Arc::new(FrontendState {
            registry: Arc::new(TunnelRegistry::default()),
            zone: "tunnel.test".to_string(),
            timing: TimingConfig::default(),
            tls: false,
            redact_client_ips: false,
        })
    }

    #[tokio::test]
    async fn apex_host_serves_status_page() {
        let state = test_state();
        let app = router(state);
        let resp = app.oneshot(request("tunnel.test", peer())).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        assert!(String::from_utf8_lossy(&body).contains("<html"));
    }

    #[tokio::test]
    async fn unknown_subdomain_is_bad_gateway() {
        let state = test_state();
        let app = router(state);
        let resp = app
            .oneshot(request("ghost.tunnel.test", peer()))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn registered_subdomain_round_trips_through_the_session() {
        let state = test_state();
        let (server_side, remote_side) = tokio::io::duplex(64 * 1024);
        let (_server_read, server_write) = tokio::io::split(server_side);
        let (mut remote_read, _remote_write) = tokio::io::split(remote_side);

        let session = crate::session::new_registered(
            "demo".to_string(),
            "c1".to_string(),
            "127.0.0.1:0".parse().unwrap(),
            Box::new(server_write),
        );
        state.registry.register("demo", session.clone()).unwrap();

        // Stand in for the remote client: read the REQUEST the router sends
        // over the session's writer and answer it with a 200, the way a
        // real rtun-client would after forwarding to its origin.
        tokio::spawn(async move {
            if let Ok(Frame::Request(req)) = rtun_core::frame::read_frame(&mut remote_read).await {
                session.deliver_response(ResponsePayload {
                    request_id: req.request_id,
                    status_code: 200,
                    reason: None,
                    headers: HeaderList::new(),
                    body: b"hello from origin".to_vec(),
                });
            }
        });

        let app = router(state.clone());
        let resp = app
            .oneshot(request("demo.tunnel.test", peer()))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"hello from origin");
    }
}
