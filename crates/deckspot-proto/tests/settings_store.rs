//! Persistence behavior of the JSON settings store and the event fan-out,
//! exercised through the public API only.

use std::sync::Arc;

use deckspot_proto::events::{BroadcastSink, EventSink};
use deckspot_proto::settings::{JsonSettingsStore, SettingsStore};
use serde_json::json;

#[test]
fn token_fields_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("settings.json");

    let store = JsonSettingsStore::open(path.clone());
    store
        .update(&mut |s| {
            s.spotify_client_id = "client-1".to_string();
            s.access_token = Some("access".to_string());
            s.refresh_token = Some("refresh".to_string());
            s.token_expires_at = Some(1_700_000_000);
            s.scopes_version = 4;
        })
        .unwrap();
    drop(store);

    let store = JsonSettingsStore::open(path);
    let settings = store.snapshot();
    assert_eq!(settings.spotify_client_id, "client-1");
    assert_eq!(settings.access_token.as_deref(), Some("access"));
    assert_eq!(settings.refresh_token.as_deref(), Some("refresh"));
    assert_eq!(settings.token_expires_at, Some(1_700_000_000));
    assert_eq!(settings.scopes_version, 4);
    // Untouched fields keep their defaults.
    assert_eq!(settings.device_name, "Steam Deck");
    assert_eq!(settings.bitrate, 320);
}

#[test]
fn cleared_tokens_are_not_written_back() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("settings.json");

    let store = JsonSettingsStore::open(path.clone());
    store
        .update(&mut |s| {
            s.access_token = Some("access".to_string());
        })
        .unwrap();
    store
        .update(&mut |s| {
            s.access_token = None;
            s.refresh_token = None;
            s.token_expires_at = None;
        })
        .unwrap();

    let raw = std::fs::read_to_string(&path).unwrap();
    assert!(!raw.contains("access_token"));
    assert!(!raw.contains("refresh_token"));
}

#[tokio::test]
async fn broadcast_sink_fans_out_to_all_subscribers() {
    let (sink, mut first) = BroadcastSink::new(16);
    let sink = Arc::new(sink);
    let mut second = sink.subscribe();

    sink.emit("librespot_status", json!({"running": true, "error": null}));

    let a = first.recv().await.unwrap();
    let b = second.recv().await.unwrap();
    assert_eq!(a.name, "librespot_status");
    assert_eq!(b.payload["running"], true);
}
