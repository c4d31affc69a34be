//! Thin wrapper over the Spotify Web API. One shared reqwest client with
//! explicit request and connect timeouts; every call carries a bearer
//! token. HTTP error responses and transport failures map to distinct
//! [`DaemonError`] variants so callers can tell them apart.

use reqwest::{Client, Method, StatusCode};
use serde_json::Value;
use std::time::Duration;

use crate::error::DaemonError;

pub const API_BASE: &str = "https://api.spotify.com/v1";
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone)]
pub struct SpotifyClient {
    http: Client,
    base: String,
}

impl SpotifyClient {
    pub fn new() -> anyhow::Result<Self> {
        Ok(Self {
            http: Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .connect_timeout(REQUEST_TIMEOUT)
                .build()?,
            base: API_BASE.to_string(),
        })
    }

    /// Point the client at a different API root. Test hook.
    #[cfg(test)]
    pub fn with_base(mut self, base: &str) -> Self {
        self.base = base.trim_end_matches('/').to_string();
        self
    }

    pub async fn get(
        &self,
        endpoint: &str,
        token: &str,
        query: &[(&str, String)],
    ) -> Result<Option<Value>, DaemonError> {
        self.request(Method::GET, endpoint, token, query, None).await
    }

    pub async fn put(
        &self,
        endpoint: &str,
        token: &str,
        query: &[(&str, String)],
        body: Option<&Value>,
    ) -> Result<Option<Value>, DaemonError> {
        self.request(Method::PUT, endpoint, token, query, body).await
    }

    pub async fn post(
        &self,
        endpoint: &str,
        token: &str,
        query: &[(&str, String)],
    ) -> Result<Option<Value>, DaemonError> {
        self.request(Method::POST, endpoint, token, query, None).await
    }

    async fn request(
        &self,
        method: Method,
        endpoint: &str,
        token: &str,
        query: &[(&str, String)],
        body: Option<&Value>,
    ) -> Result<Option<Value>, DaemonError> {
        let url = format!("{}/{}", self.base, endpoint);
        let mut req = self.http.request(method, &url).bearer_auth(token);
        if !query.is_empty() {
            req = req.query(query);
        }
        if let Some(body) = body {
            req = req.json(body);
        }

        let resp = req.send().await?;
        let status = resp.status();

        if status == StatusCode::NO_CONTENT {
            return Ok(None);
        }
        if !status.is_success() {
            let raw = resp.text().await.unwrap_or_default();
            return Err(DaemonError::Api {
                status: status.as_u16(),
                message: parse_error_message(&raw, status.as_u16()),
            });
        }

        let raw = resp.text().await?;
        if raw.trim().is_empty() {
            return Ok(None);
        }
        match serde_json::from_str(&raw) {
            Ok(value) => Ok(Some(value)),
            Err(_) => Ok(None),
        }
    }
}

/// Extract the human-readable message from an API error body, falling
/// back to the status code.
fn parse_error_message(raw: &str, status: u16) -> String {
    serde_json::from_str::<Value>(raw)
        .ok()
        .and_then(|v| {
            v.get("error")?
                .get("message")?
                .as_str()
                .map(|s| s.to_string())
        })
        .unwrap_or_else(|| format!("Spotify API error: {status}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_message_extraction() {
        let raw = r#"{"error": {"status": 404, "message": "Device not found"}}"#;
        assert_eq!(parse_error_message(raw, 404), "Device not found");
    }

    #[test]
    fn test_error_message_fallback_on_garbage() {
        assert_eq!(parse_error_message("<html>", 502), "Spotify API error: 502");
        assert_eq!(parse_error_message("{}", 403), "Spotify API error: 403");
    }

    /// One-shot local endpoint answering every request with the given
    /// canned response.
    async fn mock_endpoint(response: &'static str) -> String {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    return;
                };
                let mut buf = [0u8; 2048];
                let _ = stream.read(&mut buf).await;
                let _ = stream.write_all(response.as_bytes()).await;
            }
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn test_no_content_maps_to_none() {
        let base = mock_endpoint("HTTP/1.1 204 No Content\r\nConnection: close\r\n\r\n").await;
        let client = SpotifyClient::new().unwrap().with_base(&base);
        let resp = client.get("me/player", "tok", &[]).await.unwrap();
        assert!(resp.is_none());
    }

    #[tokio::test]
    async fn test_http_failure_maps_to_api_error() {
        let body = r#"{"error": {"status": 404, "message": "Device not found"}}"#;
        let base = mock_endpoint(
            "HTTP/1.1 404 Not Found\r\nContent-Type: application/json\r\nContent-Length: 57\r\nConnection: close\r\n\r\n{\"error\": {\"status\": 404, \"message\": \"Device not found\"}}",
        )
        .await;
        assert_eq!(body.len(), 57);

        let client = SpotifyClient::new().unwrap().with_base(&base);
        let err = client
            .put("me/player/play", "tok", &[], None)
            .await
            .unwrap_err();
        assert!(err.is_reachable());
        match err {
            DaemonError::Api { status, message } => {
                assert_eq!(status, 404);
                assert_eq!(message, "Device not found");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
