//! Local HTTP Forwarder: the short-lived, un-pooled round trip from
//! a received REQUEST envelope to the origin at `local_host:local_port`.
//! Built on a plain `hyper_util` legacy client over an `HttpConnector` —
//! a fresh connection per in-flight request, never pooled or retried.

use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::header::{HeaderName, HeaderValue, HOST};
use hyper::{Request, Uri};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;

use rtun_core::frame::{RequestPayload, ResponsePayload};
use rtun_core::headers::HeaderList;

#[derive(Debug, Clone)]
pub struct ForwarderConfig {
    pub local_host: String,
    pub local_port: u16,
    pub request_timeout: Duration,
}

/// Forward one REQUEST envelope to the origin and build the RESPONSE
/// envelope. Never fails outwardly: origin errors become a 502 with
/// `X-Tunnel-Error` rather than propagating — the origin is never
/// retried since its idempotence is unknown.
pub async fn forward(req: &RequestPayload, cfg: &ForwarderConfig) -> ResponsePayload {
    match try_forward(req, cfg).await {
        Ok(resp) => resp,
        Err(reason) => error_response(req.request_id, &reason),
    }
}

async fn try_forward(req: &RequestPayload, cfg: &ForwarderConfig) -> Result<ResponsePayload, String> {
    let client: Client<HttpConnector, Full<Bytes>> = Client::builder(TokioExecutor::new()).build_http();

    let uri: Uri = format!("http://{}:{}{}", cfg.local_host, cfg.local_port, req.path)
        .parse()
        .map_err(|e| format!("invalid request target: {e}"))?;

    let mut builder = Request::builder().method(req.method.as_str()).uri(uri);
    {
        let headers_mut = builder.headers_mut().ok_or("malformed request builder state")?;
        for (name, value) in req.headers.iter() {
            if HeaderList::is_hop_by_hop(name) || name.eq_ignore_ascii_case("host") {
                continue;
            }
            if let (Ok(n), Ok(v)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                headers_mut.append(n, v);
            }
        }
        let host_value = format!("{}:{}", cfg.local_host, cfg.local_port);
        headers_mut.insert(
            HOST,
            HeaderValue::from_str(&host_value).map_err(|e| e.to_string())?,
        );
    }

    let request = builder
        .body(Full::new(Bytes::from(req.body.clone())))
        .map_err(|e| e.to_string())?;

    let response = tokio::time::timeout(cfg.request_timeout, client.request(request))
        .await
        .map_err(|_| "origin request timed out".to_string())?
        .map_err(|e| format!("origin connection error: {e}"))?;

    let status_code = response.status().as_u16();
    let mut headers = HeaderList::new();
    for (name, value) in response.headers() {
        if HeaderList::is_hop_by_hop(name.as_str()) {
            continue;
        }
        if let Ok(v) = value.to_str() {
            headers.push(name.as_str(), v);
        }
    }

    let body = response
        .into_body()
        .collect()
        .await
        .map_err(|e| format!("error reading origin response body: {e}"))?
        .to_bytes()
        .to_vec();

    Ok(ResponsePayload {
        request_id: req.request_id,
        status_code,
        reason: None,
        headers,
        body,
    })
}

fn error_response(request_id: u64, reason: &str) -> ResponsePayload {
    let mut headers = HeaderList::new();
    headers.push("X-Tunnel-Error", reason);
    ResponsePayload {
        request_id,
        status_code: 502,
        reason: Some(reason.to_string()),
        headers,
        body: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unreachable_origin_yields_502_with_tunnel_error_header() {
        // Port 1 is reserved and nothing listens there in test environments.
        let cfg = ForwarderConfig {
            local_host: "127.0.0.1".to_string(),
            local_port: 1,
            request_timeout: Duration::from_millis(500),
        };
        let req = RequestPayload {
            request_id: 1,
            method: "GET".to_string(),
            path: "/".to_string(),
            headers: HeaderList::new(),
            body: Vec::new(),
        };
        let resp = forward(&req, &cfg).await;
        assert_eq!(resp.status_code, 502);
        assert!(resp.headers.get("x-tunnel-error").is_some());
    }

    #[tokio::test]
    async fn invalid_path_yields_502() {
        let cfg = ForwarderConfig {
            local_host: "127.0.0.1".to_string(),
            local_port: 8080,
            request_timeout: Duration::from_secs(1),
        };
        let req = RequestPayload {
            request_id: 2,
            method: "GET".to_string(),
            path: "not a valid path \u{0}".to_string(),
            headers: HeaderList::new(),
            body: Vec::new(),
        };
        let resp = forward(&req, &cfg).await;
        assert_eq!(resp.status_code, 502);
    }
}
