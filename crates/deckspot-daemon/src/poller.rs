//! Playback poller: periodically reads the remote `me/player` resource,
//! diffs it against the last snapshot, and emits edge-triggered events.
//!
//! Event contract:
//!   `librespot_event {"event":"stopped"}`      on the active→inactive edge
//!   `librespot_event {"event":"playing",...}`  every tick while playing
//!   `librespot_event {"event":"paused",...}`   on the →paused edge
//!   `librespot_event {"event":"volume_set"}`   when the volume changed
//!   `track_metadata`                           when the track id changed
//!   `device_changed`                           when the device id changed
//!
//! "playing" repeats on purpose so listeners can re-anchor their position
//! estimate from `position_ms` each tick.

use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use deckspot_proto::playback::{DeviceInfo, PlayState, PlaybackSnapshot, PlayerState};

use crate::context::Daemon;
use crate::error::DaemonError;

pub const POLL_INTERVAL: Duration = Duration::from_secs(3);

pub async fn poll_loop(daemon: Arc<Daemon>, cancel: CancellationToken) {
    loop {
        poll_once(&daemon).await;
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = sleep(POLL_INTERVAL) => {}
        }
    }
}

async fn poll_once(daemon: &Daemon) {
    // No token means nothing to poll. The loop keeps ticking so it picks
    // up a later authorization without being restarted.
    let Some(token) = daemon.tokens.ensure_valid_token().await else {
        return;
    };

    let raw = match daemon.api.get("me/player", &token, &[]).await {
        Ok(raw) => raw,
        Err(DaemonError::Api { status: 401, .. }) => {
            // Token rejected server-side. Expire it so the next tick
            // refreshes before retrying.
            daemon.tokens.force_expire();
            return;
        }
        Err(e) if e.is_reachable() => {
            warn!("playback poll API error: {}", e);
            return;
        }
        Err(e) => {
            warn!("playback poll failed: {}", e);
            return;
        }
    };

    let state = match raw {
        Some(value) => match serde_json::from_value::<PlayerState>(value) {
            Ok(state) => Some(state),
            Err(e) => {
                warn!("malformed player state: {}", e);
                return;
            }
        },
        None => None,
    };

    let events = {
        let mut snapshot = daemon.snapshot.write().await;
        apply_poll(&mut snapshot, state.as_ref())
    };
    for (name, payload) in events {
        daemon.sink.emit(name, payload);
    }
}

/// Fold one poll response into the snapshot and return the events the
/// transition produces. Pure with respect to I/O so the edge rules are
/// testable in isolation.
fn apply_poll(
    snapshot: &mut PlaybackSnapshot,
    state: Option<&PlayerState>,
) -> Vec<(&'static str, Value)> {
    let mut events = Vec::new();

    // No content means no active playback anywhere. Last track metadata
    // is kept so status queries can still show what was playing.
    let Some(state) = state else {
        let was_active = matches!(snapshot.play_state, PlayState::Playing | PlayState::Paused);
        snapshot.play_state = PlayState::Stopped;
        snapshot.current_track_id = None;
        if was_active {
            events.push(("librespot_event", json!({"event": "stopped"})));
        }
        return events;
    };

    // Active session without an item (e.g. a private session); treat the
    // whole tick as a no-op like an unreadable response.
    let Some(item) = state.item.as_ref() else {
        return events;
    };

    let track_id = item.id.clone().unwrap_or_default();
    if snapshot.current_track_id.as_deref() != Some(track_id.as_str()) {
        let meta = item.to_track_meta();
        events.push((
            "track_metadata",
            serde_json::to_value(&meta).unwrap_or(Value::Null),
        ));
        snapshot.current_track_id = Some(track_id.clone());
        snapshot.track = Some(meta);
    }

    let new_state = if state.is_playing {
        PlayState::Playing
    } else {
        PlayState::Paused
    };
    if state.is_playing {
        events.push((
            "librespot_event",
            json!({
                "event": "playing",
                "track_id": track_id,
                "position_ms": state.progress_ms,
                "duration_ms": item.duration_ms,
            }),
        ));
    } else if new_state != snapshot.play_state {
        events.push((
            "librespot_event",
            json!({
                "event": "paused",
                "track_id": track_id,
                "position_ms": state.progress_ms,
                "duration_ms": item.duration_ms,
            }),
        ));
    }
    snapshot.play_state = new_state;
    snapshot.position_ms = state.progress_ms;
    snapshot.duration_ms = item.duration_ms;

    if let Some(device) = state.device.as_ref() {
        if let Some(id) = device.id.as_ref() {
            let info = DeviceInfo {
                id: id.clone(),
                name: device.name.clone(),
                kind: device.kind.clone(),
            };
            let prev_id = snapshot.device.as_ref().map(|d| d.id.clone());
            if prev_id.as_deref() != Some(id.as_str()) {
                events.push((
                    "device_changed",
                    serde_json::to_value(&info).unwrap_or(Value::Null),
                ));
            }
            snapshot.device = Some(info);
        }
        if let Some(volume) = device.volume_percent {
            if snapshot.volume_percent != Some(volume) {
                snapshot.volume_percent = Some(volume);
                events.push((
                    "librespot_event",
                    json!({"event": "volume_set", "volume": volume}),
                ));
            }
        }
    }

    events
}

#[cfg(test)]
mod tests {
    use super::*;

    fn playing_state(track_id: &str, progress: u64) -> PlayerState {
        serde_json::from_value(json!({
            "is_playing": true,
            "progress_ms": progress,
            "item": {
                "id": track_id,
                "name": "Song",
                "duration_ms": 200_000,
                "artists": [{"name": "Artist"}],
                "album": {"name": "Album", "images": [{"url": "http://img"}]}
            },
            "device": {
                "id": "dev1",
                "name": "Steam Deck",
                "type": "computer",
                "volume_percent": 40
            }
        }))
        .unwrap()
    }

    fn names(events: &[(&'static str, Value)]) -> Vec<String> {
        events
            .iter()
            .map(|(name, payload)| {
                payload
                    .get("event")
                    .and_then(|e| e.as_str())
                    .map(|e| format!("{name}:{e}"))
                    .unwrap_or_else(|| name.to_string())
            })
            .collect()
    }

    #[test]
    fn test_first_playing_tick_emits_metadata_playing_device_volume() {
        let mut snapshot = PlaybackSnapshot::default();
        let events = apply_poll(&mut snapshot, Some(&playing_state("t1", 1000)));
        assert_eq!(
            names(&events),
            vec![
                "track_metadata",
                "librespot_event:playing",
                "device_changed",
                "librespot_event:volume_set",
            ]
        );
        assert_eq!(snapshot.play_state, PlayState::Playing);
        assert_eq!(snapshot.current_track_id.as_deref(), Some("t1"));
        assert_eq!(snapshot.volume_percent, Some(40));
    }

    #[test]
    fn test_playing_repeats_every_tick_but_diffs_are_edges() {
        let mut snapshot = PlaybackSnapshot::default();
        apply_poll(&mut snapshot, Some(&playing_state("t1", 1000)));
        let events = apply_poll(&mut snapshot, Some(&playing_state("t1", 4000)));
        assert_eq!(names(&events), vec!["librespot_event:playing"]);
        assert_eq!(snapshot.position_ms, 4000);
    }

    #[test]
    fn test_track_change_emits_metadata() {
        let mut snapshot = PlaybackSnapshot::default();
        apply_poll(&mut snapshot, Some(&playing_state("t1", 1000)));
        let events = apply_poll(&mut snapshot, Some(&playing_state("t2", 0)));
        assert_eq!(
            names(&events),
            vec!["track_metadata", "librespot_event:playing"]
        );
        assert_eq!(snapshot.track.as_ref().unwrap().track_id, "t2");
    }

    #[test]
    fn test_pause_emits_once() {
        let mut snapshot = PlaybackSnapshot::default();
        apply_poll(&mut snapshot, Some(&playing_state("t1", 1000)));

        let mut paused = playing_state("t1", 2000);
        paused.is_playing = false;
        let events = apply_poll(&mut snapshot, Some(&paused));
        assert_eq!(names(&events), vec!["librespot_event:paused"]);

        // Still paused next tick: silent.
        let events = apply_poll(&mut snapshot, Some(&paused));
        assert!(events.is_empty());
    }

    #[test]
    fn test_no_content_emits_stopped_once_and_keeps_metadata() {
        let mut snapshot = PlaybackSnapshot::default();
        apply_poll(&mut snapshot, Some(&playing_state("t1", 1000)));

        let events = apply_poll(&mut snapshot, None);
        assert_eq!(names(&events), vec!["librespot_event:stopped"]);
        assert_eq!(snapshot.play_state, PlayState::Stopped);
        assert!(snapshot.current_track_id.is_none());
        // Metadata survives for status queries.
        assert!(snapshot.track.is_some());

        let events = apply_poll(&mut snapshot, None);
        assert!(events.is_empty());
    }

    #[test]
    fn test_no_content_from_idle_is_silent() {
        let mut snapshot = PlaybackSnapshot::default();
        let events = apply_poll(&mut snapshot, None);
        assert!(events.is_empty());
        assert_eq!(snapshot.play_state, PlayState::Stopped);
    }

    #[test]
    fn test_missing_item_is_a_no_op() {
        let mut snapshot = PlaybackSnapshot::default();
        apply_poll(&mut snapshot, Some(&playing_state("t1", 1000)));
        let state: PlayerState = serde_json::from_value(json!({"is_playing": true})).unwrap();
        let events = apply_poll(&mut snapshot, Some(&state));
        assert!(events.is_empty());
        assert_eq!(snapshot.play_state, PlayState::Playing);
    }

    #[test]
    fn test_device_switch_emits_device_changed() {
        let mut snapshot = PlaybackSnapshot::default();
        apply_poll(&mut snapshot, Some(&playing_state("t1", 1000)));

        let mut moved = playing_state("t1", 2000);
        if let Some(device) = moved.device.as_mut() {
            device.id = Some("dev2".to_string());
        }
        let events = apply_poll(&mut snapshot, Some(&moved));
        assert!(names(&events).contains(&"device_changed".to_string()));
        assert_eq!(snapshot.device.as_ref().unwrap().id, "dev2");
    }

    #[test]
    fn test_volume_change_emits_volume_set() {
        let mut snapshot = PlaybackSnapshot::default();
        apply_poll(&mut snapshot, Some(&playing_state("t1", 1000)));

        let mut louder = playing_state("t1", 2000);
        if let Some(device) = louder.device.as_mut() {
            device.volume_percent = Some(70);
        }
        let events = apply_poll(&mut snapshot, Some(&louder));
        assert!(names(&events).contains(&"librespot_event:volume_set".to_string()));
        assert_eq!(snapshot.volume_percent, Some(70));
    }
}
