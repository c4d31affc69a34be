//! Single-use TLS listener for the Spotify authorization flow.
//!
//! Listens on all interfaces so the user's phone or desktop browser can
//! reach the device; HTTPS is mandatory because Spotify only accepts
//! secure redirect URIs. The listener exists only for the duration of one
//! authorization and shuts itself down after handling `/callback`.

use serde_json::json;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use deckspot_proto::platform;

use crate::context::{Daemon, TaskHandle};
use crate::httpd::{self, Request};
use crate::tls;

pub struct OauthServer {
    pub landing_url: String,
    pub redirect_uri: String,
    handle: TaskHandle,
}

impl OauthServer {
    pub async fn stop(self) {
        self.handle.stop().await;
        info!("authorization listener stopped");
    }
}

/// (Re)start the authorization listener and return its landing URL.
pub async fn start(daemon: &Arc<Daemon>) -> anyhow::Result<String> {
    if let Some(server) = daemon.oauth.lock().await.take() {
        server.stop().await;
    }

    let config = &daemon.config.oauth;
    let acceptor = tls::load_or_generate(&config.cert_file, &config.key_file)?;
    let host = platform::mdns_host();
    let landing_url = format!("https://{}:{}", host, config.port);
    let redirect_uri = format!("{landing_url}/callback");

    let listener = TcpListener::bind((config.bind_address.as_str(), config.port)).await?;
    let cancel = CancellationToken::new();
    let join = tokio::spawn(accept_loop(
        listener,
        acceptor,
        Arc::clone(daemon),
        redirect_uri.clone(),
        cancel.clone(),
    ));

    *daemon.oauth.lock().await = Some(OauthServer {
        landing_url: landing_url.clone(),
        redirect_uri,
        handle: TaskHandle { cancel, join },
    });
    info!("authorization listener started, landing URL: {}", landing_url);
    Ok(landing_url)
}

async fn accept_loop(
    listener: TcpListener,
    acceptor: TlsAcceptor,
    daemon: Arc<Daemon>,
    redirect_uri: String,
    cancel: CancellationToken,
) {
    loop {
        let (stream, peer) = tokio::select! {
            _ = cancel.cancelled() => return,
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    warn!("authorization accept failed: {}", e);
                    continue;
                }
            },
        };
        let acceptor = acceptor.clone();
        let daemon = Arc::clone(&daemon);
        let redirect_uri = redirect_uri.clone();
        tokio::spawn(async move {
            // Browsers probe with plain HTTP and abandoned preconnects;
            // a failed handshake is routine, not an error.
            let mut stream = match acceptor.accept(stream).await {
                Ok(stream) => stream,
                Err(e) => {
                    debug!("TLS handshake with {} failed: {}", peer, e);
                    return;
                }
            };
            if let Err(e) = handle_connection(&daemon, &redirect_uri, &mut stream).await {
                debug!("authorization connection error: {}", e);
            }
        });
    }
}

async fn handle_connection<S>(
    daemon: &Arc<Daemon>,
    redirect_uri: &str,
    stream: &mut S,
) -> std::io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let req = match httpd::read_request(stream).await? {
        httpd::Received::Request(req) => req,
        httpd::Received::Malformed => {
            return httpd::write_html(stream, 400, &simple_page("Bad request")).await;
        }
        httpd::Received::Nothing => return Ok(()),
    };
    match req.path.as_str() {
        "/favicon.ico" => httpd::write_html(stream, 404, &simple_page("Not found")).await,
        "/callback" => handle_callback(daemon, &req, stream).await,
        "/auth" => handle_auth(daemon, redirect_uri, &req, stream).await,
        _ => landing(daemon, redirect_uri, stream).await,
    }
}

async fn handle_callback<S>(
    daemon: &Arc<Daemon>,
    req: &Request,
    stream: &mut S,
) -> std::io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let Some(code) = req.query_param("code").filter(|c| !c.is_empty()) else {
        return httpd::write_html(stream, 400, &simple_page("Missing code parameter.")).await;
    };

    let result = daemon.tokens.complete_authorization(code).await;
    let written = match &result {
        Ok(()) => httpd::write_html(stream, 200, SUCCESS_PAGE).await,
        Err(e) => {
            error!("authorization callback failed: {}", e);
            httpd::write_html(stream, 500, &simple_page(&format!("Error: {e}"))).await
        }
    };

    if result.is_ok() {
        daemon.start_poller().await;
        daemon.sink.emit("oauth_complete", json!({"authenticated": true}));
    }

    // Single use either way: a failed exchange needs a fresh flow anyway.
    if let Some(server) = daemon.oauth.lock().await.take() {
        server.stop().await;
    }
    written
}

async fn handle_auth<S>(
    daemon: &Arc<Daemon>,
    redirect_uri: &str,
    req: &Request,
    stream: &mut S,
) -> std::io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let client_id = req
        .query_param("client_id")
        .map(str::trim)
        .unwrap_or_default()
        .to_string();
    if client_id.is_empty() {
        return httpd::write_html(stream, 400, &simple_page("Missing client_id")).await;
    }
    if let Err(e) = daemon.store.update(&mut |s| {
        s.spotify_client_id = client_id.clone();
    }) {
        error!("failed to save client id: {}", e);
        return httpd::write_html(stream, 500, &simple_page(&format!("Error: {e}"))).await;
    }
    info!("client id saved from web form");
    redirect_to_authorize(daemon, redirect_uri, &client_id, stream).await
}

async fn landing<S>(daemon: &Arc<Daemon>, redirect_uri: &str, stream: &mut S) -> std::io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let client_id = daemon.store.snapshot().spotify_client_id.trim().to_string();
    if !client_id.is_empty() {
        return redirect_to_authorize(daemon, redirect_uri, &client_id, stream).await;
    }
    httpd::write_html(stream, 200, &landing_page(redirect_uri)).await
}

async fn redirect_to_authorize<S>(
    daemon: &Arc<Daemon>,
    redirect_uri: &str,
    client_id: &str,
    stream: &mut S,
) -> std::io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let auth_url = daemon.tokens.begin_authorization(client_id, redirect_uri);
    httpd::write_redirect(stream, &auth_url).await
}

// ── pages ─────────────────────────────────────────────────────────────────────

const SUCCESS_PAGE: &str = concat!(
    r#"<!DOCTYPE html><html><head><meta name="viewport" content="width=device-width,initial-scale=1">"#,
    r#"<title>Deckspot</title></head>"#,
    r#"<body style="background:#121212;color:#fff;display:flex;justify-content:center;"#,
    r#"align-items:center;min-height:100vh;margin:0;font-family:-apple-system,sans-serif">"#,
    r#"<div style="text-align:center">"#,
    r#"<h2 style="color:#1DB954">Authorization Successful</h2>"#,
    r#"<p style="color:#b3b3b3">You can close this page and return to your Steam Deck.</p>"#,
    r#"</div></body></html>"#,
);

fn landing_page(redirect_uri: &str) -> String {
    format!(
        concat!(
            r#"<!DOCTYPE html><html><head><meta name="viewport" content="width=device-width,initial-scale=1">"#,
            r#"<title>Deckspot - Spotify Login</title></head>"#,
            r#"<body style="background:#121212;color:#fff;display:flex;justify-content:center;"#,
            r#"align-items:center;min-height:100vh;margin:0;font-family:-apple-system,sans-serif">"#,
            r#"<div style="text-align:center;padding:24px;max-width:400px">"#,
            r#"<h1 style="font-size:28px;margin-bottom:8px">Deckspot</h1>"#,
            r#"<p style="color:#b3b3b3;margin-bottom:24px">Connect your Spotify account to your Steam Deck</p>"#,
            r#"<form action="/auth" method="get" style="text-align:left">"#,
            r#"<label style="display:block;color:#b3b3b3;font-size:14px;margin-bottom:6px">Spotify Client ID</label>"#,
            r#"<input name="client_id" type="text" required placeholder="e.g. a1b2c3d4e5f6a1b2c3d4e5f6a1b2c3d4""#,
            r#" style="width:100%;padding:12px;border:1px solid #333;border-radius:8px;"#,
            r#"background:#1a1a1a;color:#fff;font-size:14px;box-sizing:border-box;margin-bottom:16px">"#,
            r#"<p style="color:#666;font-size:12px;margin:0 0 16px">"#,
            "Redirect URI for your Spotify App settings:<br>",
            r#"<code style="color:#999;word-break:break-all">{redirect_uri}</code></p>"#,
            r#"<button type="submit" style="width:100%;padding:14px;border:none;border-radius:24px;"#,
            r#"background:#1DB954;color:#fff;font-size:16px;font-weight:600;cursor:pointer">Continue</button>"#,
            "</form>",
            r#"<p style="color:#666;font-size:11px;margin-top:24px">"#,
            r#"Create an app at <span style="color:#999">developer.spotify.com</span></p>"#,
            "</div></body></html>",
        ),
        redirect_uri = redirect_uri,
    )
}

fn simple_page(message: &str) -> String {
    format!("<html><body><h2>{message}</h2></body></html>")
}
