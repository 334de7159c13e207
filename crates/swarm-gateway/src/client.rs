//! Outbound RPC to the session gateway. Pure transport: rate limiting,
//! dedup and retry all live in the dispatcher.

use std::time::Duration;

use crate::error::GatewayError;
use crate::types::{SpawnRequest, SpawnResponse};

/// The seam the dispatcher spawns through. The HTTP client implements it
/// for production; tests substitute a recording mock.
pub trait SpawnBackend: Send + Sync {
    fn spawn(&self, request: &SpawnRequest) -> Result<SpawnResponse, GatewayError>;
}

#[derive(Debug)]
pub struct GatewayClient {
    base_url: String,
    token: Option<String>,
    http: reqwest::blocking::Client,
}

impl GatewayClient {
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> Self {
        let http = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_else(|_| reqwest::blocking::Client::new());
        Self {
            base_url: base_url.into(),
            token,
            http,
        }
    }

    fn spawn_url(&self) -> String {
        format!("{}/spawn", self.base_url.trim_end_matches('/'))
    }
}

impl SpawnBackend for GatewayClient {
    fn spawn(&self, request: &SpawnRequest) -> Result<SpawnResponse, GatewayError> {
        let url = self.spawn_url();
        let mut builder = self.http.post(&url).json(request);
        if let Some(token) = &self.token {
            builder = builder.bearer_auth(token);
        }

        let response = builder.send().map_err(|source| GatewayError::Transport {
            url: url.clone(),
            source,
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(GatewayError::BadStatus {
                url,
                status: status.as_u16(),
                body,
            });
        }

        let decoded: SpawnResponse = response
            .json()
            .map_err(|source| GatewayError::Decode { url, source })?;
        if !decoded.ok {
            return Err(GatewayError::SpawnRefused {
                reason: "gateway responded ok=false".to_string(),
            });
        }
        Ok(decoded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ThinkingLevel;
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::thread;

    fn mk_request() -> SpawnRequest {
        SpawnRequest {
            task: "prompt".to_string(),
            label: "label".to_string(),
            model: "claude-sonnet".to_string(),
            thinking: ThinkingLevel::Medium,
            cleanup: true,
            run_timeout_seconds: Some(600),
            skip_verify: None,
        }
    }

    /// Minimal one-shot HTTP server answering the next request with `body`.
    fn one_shot_server(status_line: &'static str, body: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr");
        thread::spawn(move || {
            if let Ok((mut stream, _)) = listener.accept() {
                let mut buf = [0u8; 4096];
                let _ = stream.read(&mut buf);
                let response = format!(
                    "{status_line}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = stream.write_all(response.as_bytes());
            }
        });
        format!("http://{addr}")
    }

    #[test]
    fn spawn_decodes_successful_response() {
        let base = one_shot_server(
            "HTTP/1.1 200 OK",
            r#"{"ok":true,"runId":"gw-1","childSessionKey":"sess-9","verified":true}"#,
        );
        let client = GatewayClient::new(base, Some("token".to_string()));

        let response = client.spawn(&mk_request()).expect("spawn");
        assert_eq!(response.child_session_key.as_deref(), Some("sess-9"));
        assert!(response.verified);
    }

    #[test]
    fn spawn_surfaces_http_errors_as_bad_status() {
        let base = one_shot_server("HTTP/1.1 503 Service Unavailable", "overloaded");
        let client = GatewayClient::new(base, None);

        let err = client.spawn(&mk_request()).expect_err("bad status");
        assert!(matches!(err, GatewayError::BadStatus { status: 503, .. }));
    }

    #[test]
    fn spawn_treats_ok_false_as_refusal() {
        let base = one_shot_server("HTTP/1.1 200 OK", r#"{"ok":false}"#);
        let client = GatewayClient::new(base, None);

        let err = client.spawn(&mk_request()).expect_err("refused");
        assert!(matches!(err, GatewayError::SpawnRefused { .. }));
    }

    #[test]
    fn unreachable_gateway_is_a_transport_error() {
        // Reserved-but-closed port: connection refused immediately.
        let client = GatewayClient::new("http://127.0.0.1:1", None);
        let err = client.spawn(&mk_request()).expect_err("transport");
        assert!(matches!(err, GatewayError::Transport { .. }));
    }

    #[test]
    fn spawn_url_normalizes_trailing_slash() {
        let client = GatewayClient::new("http://gw:9800/", None);
        assert_eq!(client.spawn_url(), "http://gw:9800/spawn");
    }
}
