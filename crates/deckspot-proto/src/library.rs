//! Display DTOs for the dashboard library endpoints, flattened from the
//! remote catalog resources (first image, joined artist names, totals).

use serde::{Deserialize, Serialize};

use crate::playback::{AlbumRef, ArtistRef, ImageRef};

#[derive(Debug, Clone, Deserialize)]
pub struct Page<T> {
    #[serde(default = "Vec::new")]
    pub items: Vec<T>,
    #[serde(default)]
    pub total: u64,
}

impl<T> Default for Page<T> {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            total: 0,
        }
    }
}

fn first_image(images: &[ImageRef]) -> Option<String> {
    images.first().map(|i| i.url.clone())
}

fn join_artists(artists: &[ArtistRef]) -> String {
    artists
        .iter()
        .map(|a| a.name.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

// ── playlists ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct ApiPlaylist {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub images: Vec<ImageRef>,
    /// Some API variants report the entry count under `items`.
    #[serde(default, alias = "items")]
    pub tracks: Option<CountRef>,
    #[serde(default)]
    pub owner: Option<OwnerRef>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CountRef {
    #[serde(default)]
    pub total: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OwnerRef {
    #[serde(default)]
    pub id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct PlaylistSummary {
    pub id: String,
    pub name: String,
    pub image_url: Option<String>,
    pub track_count: u64,
    pub owner_id: String,
}

impl From<ApiPlaylist> for PlaylistSummary {
    fn from(p: ApiPlaylist) -> Self {
        Self {
            image_url: first_image(&p.images),
            track_count: p.tracks.map(|t| t.total).unwrap_or(0),
            owner_id: p.owner.map(|o| o.id).unwrap_or_default(),
            id: p.id,
            name: p.name,
        }
    }
}

// ── tracks ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ApiTrack {
    pub id: Option<String>,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub artists: Vec<ArtistRef>,
    #[serde(default)]
    pub album: AlbumRef,
    #[serde(default)]
    pub uri: String,
    #[serde(default)]
    pub duration_ms: u64,
}

/// Playlist and saved-track pages wrap the track one level deep; the key
/// differs between resources.
#[derive(Debug, Clone, Deserialize)]
pub struct SavedTrack {
    #[serde(default, alias = "item")]
    pub track: Option<ApiTrack>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TrackSummary {
    pub id: Option<String>,
    pub name: String,
    pub artist: String,
    pub album: String,
    pub uri: String,
    pub duration_ms: u64,
    pub image_url: Option<String>,
}

impl From<ApiTrack> for TrackSummary {
    fn from(t: ApiTrack) -> Self {
        Self {
            id: t.id,
            artist: join_artists(&t.artists),
            album: t.album.name,
            image_url: first_image(&t.album.images),
            name: t.name,
            uri: t.uri,
            duration_ms: t.duration_ms,
        }
    }
}

// ── albums ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct ApiAlbum {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub artists: Vec<ArtistRef>,
    #[serde(default)]
    pub images: Vec<ImageRef>,
    #[serde(default)]
    pub total_tracks: u64,
    #[serde(default)]
    pub uri: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SavedAlbum {
    pub album: Option<ApiAlbum>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AlbumSummary {
    pub id: String,
    pub name: String,
    pub artist: String,
    pub image_url: Option<String>,
    pub track_count: u64,
    pub uri: String,
}

impl From<ApiAlbum> for AlbumSummary {
    fn from(a: ApiAlbum) -> Self {
        Self {
            artist: join_artists(&a.artists),
            image_url: first_image(&a.images),
            id: a.id,
            name: a.name,
            track_count: a.total_tracks,
            uri: a.uri,
        }
    }
}

// ── artists ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct ApiArtist {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub images: Vec<ImageRef>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ArtistSummary {
    pub id: String,
    pub name: String,
    pub image_url: Option<String>,
}

impl From<ApiArtist> for ArtistSummary {
    fn from(a: ApiArtist) -> Self {
        Self {
            image_url: first_image(&a.images),
            id: a.id,
            name: a.name,
        }
    }
}

// ── episodes ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct SavedEpisode {
    pub episode: Option<ApiEpisode>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiEpisode {
    pub id: Option<String>,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub show: Option<ShowRef>,
    #[serde(default)]
    pub uri: String,
    #[serde(default)]
    pub duration_ms: u64,
    #[serde(default)]
    pub images: Vec<ImageRef>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ShowRef {
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct EpisodeSummary {
    pub id: Option<String>,
    pub name: String,
    pub show_name: String,
    pub uri: String,
    pub duration_ms: u64,
    pub image_url: Option<String>,
}

impl From<ApiEpisode> for EpisodeSummary {
    fn from(e: ApiEpisode) -> Self {
        Self {
            show_name: e.show.map(|s| s.name).unwrap_or_default(),
            image_url: first_image(&e.images),
            id: e.id,
            name: e.name,
            uri: e.uri,
            duration_ms: e.duration_ms,
        }
    }
}

// ── search ────────────────────────────────────────────────────────────────────

/// Search playlists pages may contain null entries, hence the Option.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct SearchResponse {
    pub tracks: Option<Page<ApiTrack>>,
    pub artists: Option<Page<ApiArtist>>,
    pub albums: Option<Page<ApiAlbum>>,
    pub playlists: Option<Page<Option<ApiPlaylist>>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_playlist_summary_mapping() {
        let page: Page<ApiPlaylist> = serde_json::from_str(
            r#"{
                "items": [{
                    "id": "p1",
                    "name": "Mix",
                    "images": [{"url": "http://img/a"}, {"url": "http://img/b"}],
                    "tracks": {"total": 12},
                    "owner": {"id": "me"}
                }],
                "total": 1
            }"#,
        )
        .unwrap();
        assert_eq!(page.total, 1);
        let summary = PlaylistSummary::from(page.items.into_iter().next().unwrap());
        assert_eq!(summary.image_url.as_deref(), Some("http://img/a"));
        assert_eq!(summary.track_count, 12);
        assert_eq!(summary.owner_id, "me");
    }

    #[test]
    fn test_playlist_count_under_items_key() {
        let playlist: ApiPlaylist =
            serde_json::from_str(r#"{"id": "p2", "items": {"total": 3}}"#).unwrap();
        assert_eq!(PlaylistSummary::from(playlist).track_count, 3);
    }

    #[test]
    fn test_saved_track_with_missing_track_is_none() {
        let saved: SavedTrack = serde_json::from_str(r#"{"added_at": "2024"}"#).unwrap();
        assert!(saved.track.is_none());
    }

    #[test]
    fn test_search_playlists_tolerate_null_entries() {
        let resp: SearchResponse = serde_json::from_str(
            r#"{"playlists": {"items": [null, {"id": "p3", "name": "x"}], "total": 2}}"#,
        )
        .unwrap();
        let playlists = resp.playlists.unwrap();
        assert_eq!(playlists.items.len(), 2);
        assert!(playlists.items[0].is_none());
        assert_eq!(playlists.items[1].as_ref().unwrap().id, "p3");
    }

    #[test]
    fn test_empty_page_defaults() {
        let page: Page<ApiTrack> = serde_json::from_str("{}").unwrap();
        assert!(page.items.is_empty());
        assert_eq!(page.total, 0);
    }
}
