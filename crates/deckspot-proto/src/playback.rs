//! Playback state types: the poller-owned snapshot and the wire shape of
//! the remote `me/player` resource.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PlayState {
    Stopped,
    Playing,
    Paused,
    #[default]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackMeta {
    pub track_id: String,
    pub name: String,
    pub artist: String,
    pub album: String,
    pub artwork_url: Option<String>,
    pub duration_ms: u64,
}

/// Last-known view of remote playback, used to answer status queries
/// without a live call. Written only by the poller.
#[derive(Debug, Clone, Serialize, Default)]
pub struct PlaybackSnapshot {
    pub play_state: PlayState,
    pub current_track_id: Option<String>,
    pub position_ms: u64,
    pub duration_ms: u64,
    pub device: Option<DeviceInfo>,
    pub volume_percent: Option<u8>,
    pub track: Option<TrackMeta>,
}

// ── wire shapes (subset of the remote player resource) ───────────────────────

#[derive(Debug, Clone, Deserialize, Default)]
pub struct PlayerState {
    #[serde(default)]
    pub is_playing: bool,
    #[serde(default)]
    pub progress_ms: u64,
    pub item: Option<PlayerItem>,
    pub device: Option<PlayerDevice>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct PlayerItem {
    pub id: Option<String>,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub duration_ms: u64,
    #[serde(default)]
    pub artists: Vec<ArtistRef>,
    #[serde(default)]
    pub album: AlbumRef,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ArtistRef {
    pub name: String,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct AlbumRef {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub images: Vec<ImageRef>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ImageRef {
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlayerDevice {
    pub id: Option<String>,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    pub volume_percent: Option<u8>,
}

impl PlayerItem {
    pub fn joined_artists(&self) -> String {
        let joined = self
            .artists
            .iter()
            .map(|a| a.name.as_str())
            .collect::<Vec<_>>()
            .join(", ");
        if joined.is_empty() {
            "Unknown".to_string()
        } else {
            joined
        }
    }

    pub fn artwork_url(&self) -> Option<String> {
        self.album.images.first().map(|i| i.url.clone())
    }

    pub fn to_track_meta(&self) -> TrackMeta {
        TrackMeta {
            track_id: self.id.clone().unwrap_or_default(),
            name: if self.name.is_empty() {
                "Unknown".to_string()
            } else {
                self.name.clone()
            },
            artist: self.joined_artists(),
            album: self.album.name.clone(),
            artwork_url: self.artwork_url(),
            duration_ms: self.duration_ms,
        }
    }
}
