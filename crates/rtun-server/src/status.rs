//! Status Page: a read-only summary of the Tunnel Registry for
//! requests whose Host is the apex zone or doesn't resolve to a tunnel.
//! No control actions live here.

use std::net::IpAddr;
use std::time::Instant;

use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Response};

use crate::registry::{TunnelRegistry, TunnelSnapshot};

pub fn render(registry: &TunnelRegistry, redact_client_ips: bool) -> Response {
    let mut tunnels = registry.snapshot();
    tunnels.sort_by(|a, b| a.subdomain.cmp(&b.subdomain));

    let mut body = String::new();
    body.push_str("<!doctype html><html><head><title>rtun</title></head><body>");
    body.push_str("<h1>rtun</h1>");
    body.push_str(&format!("<p>{} tunnel(s) registered</p>", tunnels.len()));
    body.push_str("<table border=\"1\" cellpadding=\"4\"><tr><th>subdomain</th><th>client</th><th>uptime</th><th>requests</th><th>errors</th></tr>");
    for t in &tunnels {
        body.push_str(&format!(
            "<tr><td>{}</td><td>{}</td><td>{}s</td><td>{}</td><td>{}</td></tr>",
            html_escape(&t.subdomain),
            html_escape(&client_label(t, redact_client_ips)),
            uptime_secs(t),
            t.request_count,
            t.error_count,
        ));
    }
    body.push_str("</table></body></html>");

    (StatusCode::OK, Html(body)).into_response()
}

fn uptime_secs(t: &TunnelSnapshot) -> u64 {
    t.registered_at.elapsed().as_secs()
}

fn client_label(t: &TunnelSnapshot, redact: bool) -> String {
    if !redact {
        return t.peer_addr.to_string();
    }
    match t.peer_addr.ip() {
        IpAddr::V4(v4) => {
            let o = v4.octets();
            format!("{}.{}.{}.0/24", o[0], o[1], o[2])
        }
        IpAddr::V6(_) => "redacted".to_string(),
    }
}

fn html_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::test_support::test_session;

    #[test]
    fn redacts_to_slash_24() {
        let registry = TunnelRegistry::new();
        registry.register("p", test_session("p")).unwrap();
        let _ = render(&registry, true);

        let snap = TunnelSnapshot {
            subdomain: "p".into(),
            client_id: "c".into(),
            peer_addr: "203.0.113.42:5555".parse().unwrap(),
            registered_at: Instant::now(),
            last_heartbeat_at: Instant::now(),
            bytes_in: 0,
            bytes_out: 0,
            request_count: 0,
            error_count: 0,
        };
        assert_eq!(client_label(&snap, true), "203.0.113.0/24");
        assert_eq!(client_label(&snap, false), "203.0.113.42:5555");
    }
}
