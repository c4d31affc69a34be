//! Minimal HTTP/1.1 plumbing shared by both listeners.
//!
//! Deliberately not a framework: each connection is served by one read of
//! up to 64 KiB (headers plus any JSON body must fit), one response, then
//! `Connection: close`. Bodies larger than the read window and chunked
//! requests are unsupported. Generic over the stream so the same code
//! serves plain TCP and TLS.

use serde_json::Value;
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;

const MAX_REQUEST: usize = 65536;
/// A client that sends nothing for this long is silently dropped.
pub const READ_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug)]
pub struct Request {
    pub method: String,
    pub path: String,
    pub query: HashMap<String, String>,
    pub body: Option<Value>,
}

impl Request {
    pub fn query_param(&self, key: &str) -> Option<&str> {
        self.query.get(key).map(|s| s.as_str())
    }

    /// The `offset` pagination param, defaulting to 0 on absence or junk.
    pub fn offset(&self) -> u64 {
        self.query_param("offset")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
    }

    /// A param that may arrive in the JSON body or the query string, body
    /// taking precedence.
    pub fn body_or_query(&self, key: &str) -> Option<String> {
        if let Some(value) = self.body.as_ref().and_then(|b| b.get(key)) {
            if let Some(s) = value.as_str() {
                return Some(s.to_string());
            }
        }
        self.query_param(key).map(|s| s.to_string())
    }
}

/// Outcome of the single read that starts every connection.
#[derive(Debug)]
pub enum Received {
    Request(Request),
    /// Bytes arrived but the request line is not HTTP. The caller owes the
    /// peer a 400 before closing.
    Malformed,
    /// Timeout or empty read; drop the connection without a response.
    Nothing,
}

/// Read one request from the stream.
pub async fn read_request<S>(stream: &mut S) -> std::io::Result<Received>
where
    S: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; MAX_REQUEST];
    let n = match timeout(READ_TIMEOUT, stream.read(&mut buf)).await {
        Ok(Ok(n)) => n,
        Ok(Err(e)) => return Err(e),
        Err(_) => return Ok(Received::Nothing),
    };
    if n == 0 {
        return Ok(Received::Nothing);
    }
    Ok(match parse_request(&buf[..n]) {
        Some(req) => Received::Request(req),
        None => Received::Malformed,
    })
}

pub fn parse_request(raw: &[u8]) -> Option<Request> {
    let text = String::from_utf8_lossy(raw);
    let request_line = text.split("\r\n").next()?;
    let mut parts = request_line.split(' ');
    let method = parts.next()?.to_string();
    let target = parts.next()?;
    if method.is_empty() || !target.starts_with('/') {
        return None;
    }

    let (path, query_str) = match target.split_once('?') {
        Some((p, q)) => (p.to_string(), q),
        None => (target.to_string(), ""),
    };
    let query = parse_query(query_str);

    let body = if method == "POST" || method == "PUT" {
        text.split_once("\r\n\r\n")
            .map(|(_, b)| b.trim())
            .filter(|b| !b.is_empty())
            .and_then(|b| serde_json::from_str(b).ok())
    } else {
        None
    };

    Some(Request {
        method,
        path,
        query,
        body,
    })
}

pub fn parse_query(query: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for pair in query.split('&').filter(|p| !p.is_empty()) {
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        let key = urlencoding::decode(key).map(|s| s.into_owned());
        let value = value.replace('+', " ");
        let value = urlencoding::decode(&value).map(|s| s.into_owned());
        if let (Ok(key), Ok(value)) = (key, value) {
            map.insert(key, value);
        }
    }
    map
}

fn status_reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        204 => "No Content",
        302 => "Found",
        400 => "Bad Request",
        403 => "Forbidden",
        404 => "Not Found",
        500 => "Internal Server Error",
        _ => "OK",
    }
}

pub async fn write_json<S>(stream: &mut S, status: u16, data: &Value) -> std::io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    let body = data.to_string();
    let header = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nAccess-Control-Allow-Origin: *\r\nConnection: close\r\n\r\n",
        status,
        status_reason(status),
        body.len(),
    );
    stream.write_all(header.as_bytes()).await?;
    stream.write_all(body.as_bytes()).await?;
    stream.flush().await
}

pub async fn write_html<S>(stream: &mut S, status: u16, html: &str) -> std::io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    let header = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: text/html; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        status,
        status_reason(status),
        html.len(),
    );
    stream.write_all(header.as_bytes()).await?;
    stream.write_all(html.as_bytes()).await?;
    stream.flush().await
}

pub async fn write_redirect<S>(stream: &mut S, location: &str) -> std::io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    let header = format!(
        "HTTP/1.1 302 Found\r\nLocation: {location}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
    );
    stream.write_all(header.as_bytes()).await?;
    stream.flush().await
}

/// CORS preflight answer for the dashboard's API routes.
pub async fn write_preflight<S>(stream: &mut S) -> std::io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    let header = "HTTP/1.1 204 No Content\r\nAccess-Control-Allow-Origin: *\r\nAccess-Control-Allow-Methods: GET, POST, OPTIONS\r\nAccess-Control-Allow-Headers: Content-Type\r\nConnection: close\r\n\r\n";
    stream.write_all(header.as_bytes()).await?;
    stream.flush().await
}

pub async fn write_bytes<S>(
    stream: &mut S,
    content_type: &str,
    immutable: bool,
    body: &[u8],
) -> std::io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    let cache = if immutable {
        "Cache-Control: public, max-age=31536000, immutable\r\n"
    } else {
        ""
    };
    let header = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: {}\r\nContent-Length: {}\r\n{}Connection: close\r\n\r\n",
        content_type,
        body.len(),
        cache,
    );
    stream.write_all(header.as_bytes()).await?;
    stream.write_all(body).await?;
    stream.flush().await
}

// ── static files ──────────────────────────────────────────────────────────────

#[derive(Debug, PartialEq, Eq)]
pub enum StaticFile {
    Found(PathBuf),
    Forbidden,
    NotFound,
}

/// Resolve a request path against the static root. Any `..` component is
/// rejected before the filesystem is consulted.
pub fn resolve_static(root: &Path, rel_path: &str) -> StaticFile {
    let rel = Path::new(rel_path);
    if rel
        .components()
        .any(|c| matches!(c, Component::ParentDir | Component::Prefix(_) | Component::RootDir))
    {
        return StaticFile::Forbidden;
    }
    let full = root.join(rel);
    if full.is_file() {
        StaticFile::Found(full)
    } else {
        StaticFile::NotFound
    }
}

pub fn content_type_for(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()).unwrap_or("") {
        "html" => "text/html; charset=utf-8",
        "js" => "application/javascript",
        "css" => "text/css",
        "svg" => "image/svg+xml",
        "png" => "image/png",
        "ico" => "image/x-icon",
        "json" => "application/json",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_get_with_query() {
        let req = parse_request(b"GET /api/search?q=daft%20punk&offset=20 HTTP/1.1\r\nHost: x\r\n\r\n")
            .unwrap();
        assert_eq!(req.method, "GET");
        assert_eq!(req.path, "/api/search");
        assert_eq!(req.query_param("q"), Some("daft punk"));
        assert_eq!(req.offset(), 20);
        assert!(req.body.is_none());
    }

    #[test]
    fn test_parse_plus_as_space_in_query() {
        let req = parse_request(b"GET /api/search?q=daft+punk HTTP/1.1\r\n\r\n").unwrap();
        assert_eq!(req.query_param("q"), Some("daft punk"));
    }

    #[test]
    fn test_parse_post_json_body() {
        let raw = b"POST /api/play HTTP/1.1\r\nContent-Type: application/json\r\n\r\n{\"context_uri\": \"spotify:album:x\", \"position\": 3}";
        let req = parse_request(raw).unwrap();
        assert_eq!(req.method, "POST");
        assert_eq!(
            req.body_or_query("context_uri").as_deref(),
            Some("spotify:album:x")
        );
        assert_eq!(req.body.as_ref().unwrap()["position"], json!(3));
    }

    #[test]
    fn test_body_takes_precedence_over_query() {
        let raw =
            b"POST /api/play?context_uri=from-query HTTP/1.1\r\n\r\n{\"context_uri\": \"from-body\"}";
        let req = parse_request(raw).unwrap();
        assert_eq!(req.body_or_query("context_uri").as_deref(), Some("from-body"));
    }

    #[test]
    fn test_garbage_request_line_is_rejected() {
        assert!(parse_request(b"\r\n\r\n").is_none());
        assert!(parse_request(b"GET\r\n\r\n").is_none());
        assert!(parse_request(b"GET notapath HTTP/1.1\r\n\r\n").is_none());
    }

    #[tokio::test]
    async fn test_read_request_separates_malformed_from_empty() {
        let outcome = read_request(&mut &b"GARBAGE\r\n\r\n"[..]).await.unwrap();
        assert!(matches!(outcome, Received::Malformed));

        let outcome = read_request(&mut &b""[..]).await.unwrap();
        assert!(matches!(outcome, Received::Nothing));

        let outcome = read_request(&mut &b"GET / HTTP/1.1\r\n\r\n"[..]).await.unwrap();
        assert!(matches!(outcome, Received::Request(_)));
    }

    #[test]
    fn test_invalid_body_json_is_ignored() {
        let req = parse_request(b"POST /api/play HTTP/1.1\r\n\r\n{not json").unwrap();
        assert!(req.body.is_none());
    }

    #[test]
    fn test_offset_defaults_on_junk() {
        let req = parse_request(b"GET /api/albums?offset=lots HTTP/1.1\r\n\r\n").unwrap();
        assert_eq!(req.offset(), 0);
    }

    #[test]
    fn test_traversal_is_forbidden() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("index.html"), "<html></html>").unwrap();
        assert_eq!(
            resolve_static(dir.path(), "../../etc/passwd"),
            StaticFile::Forbidden
        );
        assert_eq!(
            resolve_static(dir.path(), "assets/../../secret"),
            StaticFile::Forbidden
        );
        assert_eq!(resolve_static(dir.path(), "missing.js"), StaticFile::NotFound);
        assert!(matches!(
            resolve_static(dir.path(), "index.html"),
            StaticFile::Found(_)
        ));
    }

    #[test]
    fn test_content_types() {
        assert_eq!(
            content_type_for(Path::new("index.html")),
            "text/html; charset=utf-8"
        );
        assert_eq!(
            content_type_for(Path::new("assets/app.js")),
            "application/javascript"
        );
        assert_eq!(content_type_for(Path::new("data.bin")), "application/octet-stream");
    }

    #[tokio::test]
    async fn test_write_json_shape() {
        let mut out = Vec::new();
        write_json(&mut out, 200, &json!({"ok": true})).await.unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("Access-Control-Allow-Origin: *\r\n"));
        assert!(text.contains("Connection: close\r\n"));
        assert!(text.ends_with(r#"{"ok":true}"#));
    }
}
