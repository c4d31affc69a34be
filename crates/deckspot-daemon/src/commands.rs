//! Command handlers behind the dashboard's `/api/*` routes. Every handler
//! returns a JSON value in the `{ok: bool, ...}` envelope; failures carry
//! `{ok: false, error}` so the frontend can render them directly.

use serde::Deserialize;
use serde_json::{json, Value};
use std::fmt::Display;
use std::sync::Arc;
use tracing::{error, info};

use deckspot_proto::library::{
    AlbumSummary, ApiAlbum, ApiArtist, ApiPlaylist, ApiTrack, ArtistSummary, EpisodeSummary,
    Page, PlaylistSummary, SavedAlbum, SavedEpisode, SavedTrack, SearchResponse, TrackSummary,
};
use deckspot_proto::playback::{PlayState, PlaybackSnapshot};

use crate::context::Daemon;
use crate::error::DaemonError;

const PAGE_LIMIT: u64 = 50;
const SEARCH_LIMIT: u64 = 10;
const NO_ACTIVE_DEVICE: &str = "No active device — connect via Spotify app first";

fn fail(error: impl Display) -> Value {
    json!({"ok": false, "error": error.to_string()})
}

async fn bearer_or_fail(daemon: &Daemon) -> Result<String, Value> {
    daemon.bearer().await.map_err(fail)
}

fn parse<T: for<'de> Deserialize<'de> + Default>(raw: Option<Value>) -> Result<T, DaemonError> {
    match raw {
        Some(value) => Ok(serde_json::from_value(value)?),
        None => Ok(T::default()),
    }
}

// ── status ────────────────────────────────────────────────────────────────────

pub async fn status(daemon: &Daemon) -> Value {
    let snapshot = daemon.playback_snapshot().await;
    let settings = daemon.store.snapshot();
    json!({
        "ok": true,
        "authenticated": daemon.tokens.is_authenticated(),
        "librespot_running": daemon.supervisor.is_running().await,
        "binary_found": daemon.supervisor.binary_found(),
        "play_state": snapshot.play_state,
        "is_playing": snapshot.play_state == PlayState::Playing,
        "track": snapshot.track,
        "position_ms": snapshot.position_ms,
        "duration_ms": snapshot.duration_ms,
        "device": snapshot.device,
        "volume": snapshot.volume_percent,
        "settings": {
            "device_name": settings.device_name,
            "bitrate": settings.bitrate,
            "spotify_client_id": settings.spotify_client_id,
        },
    })
}

// ── playback control ──────────────────────────────────────────────────────────

pub async fn control(daemon: &Daemon, action: &str, device_id: Option<&str>) -> Value {
    info!("control: action={} device_id={:?}", action, device_id);
    let token = match bearer_or_fail(daemon).await {
        Ok(t) => t,
        Err(v) => return v,
    };

    let query: Vec<(&str, String)> = device_id
        .map(|id| vec![("device_id", id.to_string())])
        .unwrap_or_default();

    let result = match action {
        "play" => daemon.api.put("me/player/play", &token, &query, None).await,
        "pause" => daemon.api.put("me/player/pause", &token, &query, None).await,
        "next" => daemon.api.post("me/player/next", &token, &query).await,
        "previous" => daemon.api.post("me/player/previous", &token, &query).await,
        other => return fail(format!("Unknown action: {other}")),
    };

    match result {
        Ok(_) => json!({"ok": true}),
        Err(DaemonError::Api { status: 404, .. }) if action == "play" => {
            auto_transfer_and_play(daemon, &token, device_id).await
        }
        Err(DaemonError::Api { status: 404, .. }) => fail(NO_ACTIVE_DEVICE),
        Err(e) => {
            error!("control({}) failed: {}", action, e);
            fail(e)
        }
    }
}

/// A 404 from `play` means no active device. Pick one (preferring the
/// caller's), transfer playback to it with play=true, and report that as
/// the play result.
async fn auto_transfer_and_play(daemon: &Daemon, token: &str, device_id: Option<&str>) -> Value {
    let mut target = device_id.unwrap_or_default().to_string();
    if target.is_empty() {
        match daemon.api.get("me/player/devices", token, &[]).await {
            Ok(Some(data)) => {
                if let Some(first) = data["devices"].get(0) {
                    target = first["id"].as_str().unwrap_or_default().to_string();
                    info!(
                        "no device_id provided, picked {} ({})",
                        first["name"].as_str().unwrap_or("?"),
                        target
                    );
                }
            }
            Ok(None) => {}
            Err(e) => error!("device listing for auto-transfer failed: {}", e),
        }
    }
    if target.is_empty() {
        return fail(NO_ACTIVE_DEVICE);
    }

    info!("auto-transferring playback to {}", target);
    let body = json!({"device_ids": [target], "play": true});
    match daemon.api.put("me/player", token, &[], Some(&body)).await {
        Ok(_) => json!({"ok": true}),
        Err(e) => {
            error!("auto-transfer failed: {}", e);
            fail(NO_ACTIVE_DEVICE)
        }
    }
}

pub async fn set_volume(daemon: &Daemon, volume_percent: i64) -> Value {
    let token = match bearer_or_fail(daemon).await {
        Ok(t) => t,
        Err(v) => return v,
    };
    let volume = volume_percent.clamp(0, 100);
    let query = [("volume_percent", volume.to_string())];
    match daemon.api.put("me/player/volume", &token, &query, None).await {
        Ok(_) => json!({"ok": true}),
        Err(DaemonError::Api { status: 404, .. }) => fail("No active device found"),
        Err(e) => {
            error!("set_volume({}) failed: {}", volume, e);
            fail(e)
        }
    }
}

// ── library browsing ──────────────────────────────────────────────────────────

pub async fn playlists(daemon: &Daemon, offset: u64) -> Value {
    let token = match bearer_or_fail(daemon).await {
        Ok(t) => t,
        Err(v) => return v,
    };
    let query = [
        ("limit", PAGE_LIMIT.to_string()),
        ("offset", offset.to_string()),
    ];
    match daemon
        .api
        .get("me/playlists", &token, &query)
        .await
        .and_then(parse::<Page<ApiPlaylist>>)
    {
        Ok(page) => {
            let playlists: Vec<PlaylistSummary> =
                page.items.into_iter().map(Into::into).collect();
            json!({"ok": true, "playlists": playlists, "total": page.total, "offset": offset})
        }
        Err(e) => {
            error!("playlists failed: {}", e);
            fail(e)
        }
    }
}

pub async fn playlist_tracks(daemon: &Daemon, playlist_id: &str, offset: u64) -> Value {
    wrapped_tracks(
        daemon,
        &format!("playlists/{playlist_id}/items"),
        offset,
        "playlist_tracks",
    )
    .await
}

pub async fn liked_tracks(daemon: &Daemon, offset: u64) -> Value {
    wrapped_tracks(daemon, "me/tracks", offset, "liked_tracks").await
}

/// Shared shape for resources whose pages wrap each track one level deep.
async fn wrapped_tracks(daemon: &Daemon, endpoint: &str, offset: u64, what: &str) -> Value {
    let token = match bearer_or_fail(daemon).await {
        Ok(t) => t,
        Err(v) => return v,
    };
    let query = [
        ("limit", PAGE_LIMIT.to_string()),
        ("offset", offset.to_string()),
    ];
    match daemon
        .api
        .get(endpoint, &token, &query)
        .await
        .and_then(parse::<Page<SavedTrack>>)
    {
        Ok(page) => {
            let tracks: Vec<TrackSummary> = page
                .items
                .into_iter()
                .filter_map(|entry| entry.track)
                .map(Into::into)
                .collect();
            json!({"ok": true, "tracks": tracks, "total": page.total, "offset": offset})
        }
        Err(e) => {
            error!("{} failed: {}", what, e);
            fail(e)
        }
    }
}

pub async fn episodes(daemon: &Daemon, offset: u64) -> Value {
    let token = match bearer_or_fail(daemon).await {
        Ok(t) => t,
        Err(v) => return v,
    };
    let query = [
        ("limit", PAGE_LIMIT.to_string()),
        ("offset", offset.to_string()),
    ];
    match daemon
        .api
        .get("me/episodes", &token, &query)
        .await
        .and_then(parse::<Page<SavedEpisode>>)
    {
        Ok(page) => {
            let episodes: Vec<EpisodeSummary> = page
                .items
                .into_iter()
                .filter_map(|entry| entry.episode)
                .map(Into::into)
                .collect();
            json!({"ok": true, "episodes": episodes, "total": page.total, "offset": offset})
        }
        Err(e) => {
            error!("episodes failed: {}", e);
            fail(e)
        }
    }
}

pub async fn albums(daemon: &Daemon, offset: u64) -> Value {
    let token = match bearer_or_fail(daemon).await {
        Ok(t) => t,
        Err(v) => return v,
    };
    let query = [
        ("limit", PAGE_LIMIT.to_string()),
        ("offset", offset.to_string()),
    ];
    match daemon
        .api
        .get("me/albums", &token, &query)
        .await
        .and_then(parse::<Page<SavedAlbum>>)
    {
        Ok(page) => {
            let albums: Vec<AlbumSummary> = page
                .items
                .into_iter()
                .filter_map(|entry| entry.album)
                .map(Into::into)
                .collect();
            json!({"ok": true, "albums": albums, "total": page.total, "offset": offset})
        }
        Err(e) => {
            error!("albums failed: {}", e);
            fail(e)
        }
    }
}

pub async fn album_tracks(daemon: &Daemon, album_id: &str, offset: u64) -> Value {
    let token = match bearer_or_fail(daemon).await {
        Ok(t) => t,
        Err(v) => return v,
    };
    let query = [
        ("limit", PAGE_LIMIT.to_string()),
        ("offset", offset.to_string()),
    ];
    match daemon
        .api
        .get(&format!("albums/{album_id}/tracks"), &token, &query)
        .await
        .and_then(parse::<Page<ApiTrack>>)
    {
        Ok(page) => {
            let tracks: Vec<TrackSummary> = page.items.into_iter().map(Into::into).collect();
            json!({"ok": true, "tracks": tracks, "total": page.total, "offset": offset})
        }
        Err(e) => {
            error!("album_tracks failed: {}", e);
            fail(e)
        }
    }
}

pub async fn artists(daemon: &Daemon) -> Value {
    #[derive(Debug, Default, Deserialize)]
    struct Followed {
        #[serde(default)]
        artists: Page<ApiArtist>,
    }

    let token = match bearer_or_fail(daemon).await {
        Ok(t) => t,
        Err(v) => return v,
    };
    let query = [
        ("type", "artist".to_string()),
        ("limit", PAGE_LIMIT.to_string()),
    ];
    match daemon
        .api
        .get("me/following", &token, &query)
        .await
        .and_then(parse::<Followed>)
    {
        Ok(followed) => {
            let artists: Vec<ArtistSummary> =
                followed.artists.items.into_iter().map(Into::into).collect();
            json!({"ok": true, "artists": artists})
        }
        Err(e) => {
            error!("artists failed: {}", e);
            fail(e)
        }
    }
}

pub async fn artist_albums(daemon: &Daemon, artist_id: &str, offset: u64) -> Value {
    let token = match bearer_or_fail(daemon).await {
        Ok(t) => t,
        Err(v) => return v,
    };
    let query = [
        ("limit", SEARCH_LIMIT.to_string()),
        ("offset", offset.to_string()),
        ("include_groups", "album,single".to_string()),
    ];
    match daemon
        .api
        .get(&format!("artists/{artist_id}/albums"), &token, &query)
        .await
        .and_then(parse::<Page<ApiAlbum>>)
    {
        Ok(page) => {
            let albums: Vec<AlbumSummary> = page.items.into_iter().map(Into::into).collect();
            json!({"ok": true, "albums": albums, "total": page.total, "offset": offset})
        }
        Err(e) => {
            error!("artist_albums failed: {}", e);
            fail(e)
        }
    }
}

pub async fn search(daemon: &Daemon, q: &str, offset: u64) -> Value {
    let token = match bearer_or_fail(daemon).await {
        Ok(t) => t,
        Err(v) => return v,
    };
    let query = [
        ("q", q.to_string()),
        ("type", "track,artist,album,playlist".to_string()),
        ("limit", SEARCH_LIMIT.to_string()),
        ("offset", offset.to_string()),
    ];
    match daemon
        .api
        .get("search", &token, &query)
        .await
        .and_then(parse::<SearchResponse>)
    {
        Ok(resp) => {
            let tracks: Vec<TrackSummary> = resp
                .tracks
                .unwrap_or_default()
                .items
                .into_iter()
                .map(Into::into)
                .collect();
            let artists: Vec<ArtistSummary> = resp
                .artists
                .unwrap_or_default()
                .items
                .into_iter()
                .map(Into::into)
                .collect();
            let albums: Vec<AlbumSummary> = resp
                .albums
                .unwrap_or_default()
                .items
                .into_iter()
                .map(Into::into)
                .collect();
            // Playlist pages can contain literal nulls.
            let playlists: Vec<PlaylistSummary> = resp
                .playlists
                .unwrap_or_default()
                .items
                .into_iter()
                .flatten()
                .map(Into::into)
                .collect();
            json!({
                "ok": true,
                "tracks": tracks,
                "artists": artists,
                "albums": albums,
                "playlists": playlists,
            })
        }
        Err(e) => {
            error!("search failed: {}", e);
            fail(e)
        }
    }
}

// ── context play ──────────────────────────────────────────────────────────────

pub struct PlayRequest {
    pub context_uri: Option<String>,
    pub offset_uri: Option<String>,
    pub uris: Option<Vec<String>>,
    pub position: u64,
}

pub async fn play(daemon: &Daemon, req: PlayRequest) -> Value {
    let token = match bearer_or_fail(daemon).await {
        Ok(t) => t,
        Err(v) => return v,
    };

    let mut body = serde_json::Map::new();
    if let Some(context_uri) = req.context_uri.filter(|s| !s.is_empty()) {
        body.insert("context_uri".to_string(), json!(context_uri));
        if let Some(offset_uri) = req.offset_uri.filter(|s| !s.is_empty()) {
            body.insert("offset".to_string(), json!({"uri": offset_uri}));
        }
    } else if let Some(uris) = req.uris.filter(|u| !u.is_empty()) {
        body.insert("uris".to_string(), json!(uris));
        if req.position > 0 {
            body.insert("offset".to_string(), json!({"position": req.position}));
        }
    }

    let body = Value::Object(body);
    match daemon.api.put("me/player/play", &token, &[], Some(&body)).await {
        Ok(_) => json!({"ok": true}),
        Err(DaemonError::Api { status: 404, .. }) => fail("No active device"),
        Err(e) => {
            error!("play failed: {}", e);
            fail(e)
        }
    }
}

// ── librespot control ─────────────────────────────────────────────────────────

pub async fn librespot_start(daemon: &Arc<Daemon>) -> Value {
    match daemon.supervisor.start().await {
        Ok(pid) => json!({"ok": true, "pid": pid}),
        Err(e) => fail(e),
    }
}

pub async fn librespot_stop(daemon: &Daemon) -> Value {
    daemon.supervisor.stop().await;
    json!({"ok": true})
}

// ── auth ──────────────────────────────────────────────────────────────────────

pub async fn auth_start(daemon: &Arc<Daemon>) -> Value {
    match crate::oauth::start(daemon).await {
        Ok(landing_url) => json!({"ok": true, "landing_url": landing_url}),
        Err(e) => {
            error!("failed to start authorization listener: {}", e);
            fail(e)
        }
    }
}

pub async fn auth_status(daemon: &Daemon) -> Value {
    let (authenticated, needs_reauth) = daemon.tokens.auth_status();
    let mut status = json!({
        "ok": true,
        "authenticated": authenticated,
        "needs_reauth": needs_reauth,
    });
    // While a flow is in progress, repeat where the user should go.
    if let Some(server) = daemon.oauth.lock().await.as_ref() {
        status["landing_url"] = json!(server.landing_url);
        status["redirect_uri"] = json!(server.redirect_uri);
    }
    status
}

pub async fn logout(daemon: &Daemon) -> Value {
    daemon.stop_poller().await;
    if let Err(e) = daemon.tokens.logout() {
        return fail(e);
    }
    *daemon.snapshot.write().await = PlaybackSnapshot::default();
    json!({"ok": true})
}
