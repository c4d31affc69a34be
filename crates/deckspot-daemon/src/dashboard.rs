//! Loopback dashboard listener: the `/api/*` JSON surface plus the static
//! frontend bundle with an SPA fallback. Plain HTTP, bound to localhost.

use serde_json::{json, Value};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::commands::{self, PlayRequest};
use crate::context::{Daemon, TaskHandle};
use crate::httpd::{self, Request, StaticFile};

pub async fn start(daemon: Arc<Daemon>) -> anyhow::Result<TaskHandle> {
    let config = &daemon.config.dashboard;
    let listener = TcpListener::bind((config.bind_address.as_str(), config.port)).await?;
    info!("dashboard listening on {}:{}", config.bind_address, config.port);

    let cancel = CancellationToken::new();
    let token = cancel.clone();
    let join = tokio::spawn(async move {
        loop {
            let (stream, _peer) = tokio::select! {
                _ = token.cancelled() => return,
                accepted = listener.accept() => match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!("dashboard accept failed: {}", e);
                        continue;
                    }
                },
            };
            let daemon = Arc::clone(&daemon);
            tokio::spawn(async move {
                let mut stream = stream;
                if let Err(e) = serve_connection(&daemon, &mut stream).await {
                    debug!("dashboard connection error: {}", e);
                }
            });
        }
    });
    Ok(TaskHandle { cancel, join })
}

async fn serve_connection<S>(daemon: &Arc<Daemon>, stream: &mut S) -> std::io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let req = match httpd::read_request(stream).await? {
        httpd::Received::Request(req) => req,
        httpd::Received::Malformed => return bad_request(stream, "Bad request").await,
        httpd::Received::Nothing => return Ok(()),
    };
    if req.method == "OPTIONS" {
        return httpd::write_preflight(stream).await;
    }
    if req.path.starts_with("/api/") {
        return handle_api(daemon, &req, stream).await;
    }
    serve_static(daemon, &req.path, stream).await
}

async fn handle_api<S>(daemon: &Arc<Daemon>, req: &Request, stream: &mut S) -> std::io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let response: Value = match (req.method.as_str(), req.path.as_str()) {
        ("GET", "/api/status") => commands::status(daemon).await,

        ("POST", "/api/control") => match req.query_param("action").filter(|a| !a.is_empty()) {
            Some(action) => {
                commands::control(daemon, action, req.query_param("device_id")).await
            }
            None => return bad_request(stream, "Missing action param").await,
        },

        ("POST", "/api/volume") => {
            match req.query_param("value").and_then(|v| v.parse::<i64>().ok()) {
                Some(value) => commands::set_volume(daemon, value).await,
                None => return bad_request(stream, "Missing value param").await,
            }
        }

        ("GET", "/api/playlists") => commands::playlists(daemon, req.offset()).await,
        ("GET", "/api/liked-tracks") => commands::liked_tracks(daemon, req.offset()).await,
        ("GET", "/api/episodes") => commands::episodes(daemon, req.offset()).await,
        ("GET", "/api/albums") => commands::albums(daemon, req.offset()).await,
        ("GET", "/api/artists") => commands::artists(daemon).await,

        ("GET", path) if matches_nested(path, "playlists", "tracks") => {
            match resource_id(path) {
                Some(id) => commands::playlist_tracks(daemon, id, req.offset()).await,
                None => return bad_request(stream, "Missing playlist id").await,
            }
        }
        ("GET", path) if matches_nested(path, "albums", "tracks") => match resource_id(path) {
            Some(id) => commands::album_tracks(daemon, id, req.offset()).await,
            None => return bad_request(stream, "Missing album id").await,
        },
        ("GET", path) if matches_nested(path, "artists", "albums") => match resource_id(path) {
            Some(id) => commands::artist_albums(daemon, id, req.offset()).await,
            None => return bad_request(stream, "Missing artist id").await,
        },

        ("GET", "/api/search") => match req.query_param("q").filter(|q| !q.is_empty()) {
            Some(q) => commands::search(daemon, q, req.offset()).await,
            None => return bad_request(stream, "Missing q param").await,
        },

        ("POST", "/api/play") => commands::play(daemon, play_request(req)).await,

        ("POST", "/api/librespot/start") => commands::librespot_start(daemon).await,
        ("POST", "/api/librespot/stop") => commands::librespot_stop(daemon).await,

        ("POST", "/api/auth/start") => commands::auth_start(daemon).await,
        ("GET", "/api/auth/status") => commands::auth_status(daemon).await,
        ("POST", "/api/auth/logout") => commands::logout(daemon).await,

        // Unknown API paths fall through to the static bundle like any
        // other unmatched path.
        _ => return serve_static(daemon, &req.path, stream).await,
    };
    httpd::write_json(stream, 200, &response).await
}

async fn bad_request<S>(stream: &mut S, message: &str) -> std::io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    httpd::write_json(stream, 400, &json!({"error": message})).await
}

/// `/api/{collection}/{id}/{leaf}`
fn matches_nested(path: &str, collection: &str, leaf: &str) -> bool {
    let mut parts = path.trim_start_matches('/').split('/');
    parts.next() == Some("api")
        && parts.next() == Some(collection)
        && matches!(parts.next(), Some(id) if !id.is_empty())
        && parts.next() == Some(leaf)
        && parts.next().is_none()
}

fn resource_id(path: &str) -> Option<&str> {
    path.trim_start_matches('/')
        .split('/')
        .nth(2)
        .filter(|id| !id.is_empty())
}

fn play_request(req: &Request) -> PlayRequest {
    let body = req.body.as_ref();
    let uris = body
        .and_then(|b| b.get("uris"))
        .and_then(|u| u.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        });
    let position = body
        .and_then(|b| b.get("position"))
        .and_then(|p| p.as_u64())
        .unwrap_or(0);
    PlayRequest {
        context_uri: req.body_or_query("context_uri"),
        offset_uri: req.body_or_query("offset_uri"),
        uris,
        position,
    }
}

async fn serve_static<S>(daemon: &Daemon, path: &str, stream: &mut S) -> std::io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    let rel = static_rel_path(path);
    let root = &daemon.config.dashboard.static_dir;
    match httpd::resolve_static(root, rel) {
        StaticFile::Found(file) => {
            let immutable = rel.starts_with("assets/");
            send_file(stream, &file, immutable).await
        }
        StaticFile::Forbidden => {
            httpd::write_json(stream, 403, &json!({"error": "Forbidden"})).await
        }
        StaticFile::NotFound => {
            httpd::write_json(stream, 404, &json!({"error": "Not found"})).await
        }
    }
}

/// A file that vanishes or turns unreadable between resolution and the
/// read becomes a 500 instead of a dropped connection.
async fn send_file<S>(stream: &mut S, file: &std::path::Path, immutable: bool) -> std::io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    match tokio::fs::read(file).await {
        Ok(body) => {
            httpd::write_bytes(stream, httpd::content_type_for(file), immutable, &body).await
        }
        Err(e) => httpd::write_json(stream, 500, &json!({"error": e.to_string()})).await,
    }
}

/// Only `/assets/*` maps to real files; anything else that isn't the index
/// falls back to it so client-side routes survive a reload.
fn static_rel_path(path: &str) -> &str {
    if path.starts_with("/assets/") {
        &path[1..]
    } else {
        "index.html"
    }
}
