use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::spotify::{StreamingApi, TrackDescriptor};

/// A stored playlist: host-assigned identity plus track stubs or fully
/// resolved descriptors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Playlist {
    pub id: String,
    pub title: String,
    pub tracks: Vec<TrackDescriptor>,
}

/// Fills in display metadata (names, artwork, preview URLs) for playlists
/// that were stored with bare track ids.
pub struct PlaylistEnhancer {
    api: Arc<dyn StreamingApi>,
}

impl PlaylistEnhancer {
    pub fn new(api: Arc<dyn StreamingApi>) -> Self {
        Self { api }
    }

    /// Produce an enriched copy of the playlist. The input is never
    /// mutated, tracks that already carry metadata are passed through
    /// untouched, and a lookup failure on one track leaves that track a
    /// stub without affecting its neighbors.
    pub async fn enhance(&self, playlist: &Playlist) -> Playlist {
        let mut tracks = Vec::with_capacity(playlist.tracks.len());

        for track in &playlist.tracks {
            if !track.is_stub() {
                tracks.push(track.clone());
                continue;
            }

            let lookup_id = normalize_track_id(&track.service_track_id);
            match self.api.get_track(lookup_id).await {
                Ok(resolved) => tracks.push(TrackDescriptor {
                    // Keep the stored id so host references stay stable.
                    service_track_id: track.service_track_id.clone(),
                    name: resolved.name,
                    artist_name: resolved.artist_name,
                    album_art_url: resolved.album_art_url,
                    preview_url: resolved.preview_url,
                }),
                Err(e) => {
                    warn!(
                        "Enrichment failed for track {}: {e}",
                        track.service_track_id
                    );
                    tracks.push(track.clone());
                }
            }
        }

        Playlist {
            id: playlist.id.clone(),
            title: playlist.title.clone(),
            tracks,
        }
    }
}

/// Stored ids sometimes carry a service namespace (`spotify:track:<id>`);
/// the REST API wants the bare id.
fn normalize_track_id(raw: &str) -> &str {
    raw.rsplit(':').next().unwrap_or(raw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spotify::PlayCommandError;
    use anyhow::{anyhow, Result};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeApi {
        failing_id: Option<String>,
        lookups: AtomicUsize,
    }

    impl FakeApi {
        fn new(failing_id: Option<&str>) -> Arc<Self> {
            Arc::new(Self {
                failing_id: failing_id.map(String::from),
                lookups: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl StreamingApi for FakeApi {
        async fn get_track(&self, track_id: &str) -> Result<TrackDescriptor> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            if self.failing_id.as_deref() == Some(track_id) {
                return Err(anyhow!("lookup failed"));
            }
            Ok(TrackDescriptor {
                service_track_id: track_id.to_string(),
                name: format!("Song {track_id}"),
                artist_name: "Artist".to_string(),
                album_art_url: Some(format!("https://img/{track_id}.jpg")),
                preview_url: Some(format!("https://preview/{track_id}.mp3")),
            })
        }

        async fn play_on_device(
            &self,
            _device_id: &str,
            _track_id: &str,
        ) -> Result<(), PlayCommandError> {
            Ok(())
        }

        async fn check_premium(&self) -> Result<bool> {
            Ok(false)
        }
    }

    fn playlist(tracks: Vec<TrackDescriptor>) -> Playlist {
        Playlist {
            id: "pl-1".to_string(),
            title: "Saturday".to_string(),
            tracks,
        }
    }

    #[tokio::test]
    async fn one_failed_lookup_leaves_other_tracks_enriched() {
        let api = FakeApi::new(Some("t1"));
        let enhancer = PlaylistEnhancer::new(api);
        let input = playlist(vec![
            TrackDescriptor::stub("t0"),
            TrackDescriptor::stub("t1"),
            TrackDescriptor::stub("t2"),
        ]);

        let out = enhancer.enhance(&input).await;

        assert_eq!(out.tracks.len(), 3);
        assert_eq!(out.tracks[0].name, "Song t0");
        assert!(out.tracks[1].is_stub());
        assert_eq!(out.tracks[2].name, "Song t2");
        // Input untouched.
        assert!(input.tracks[0].is_stub());
    }

    #[tokio::test]
    async fn namespaced_ids_are_normalized_but_preserved() {
        let api = FakeApi::new(None);
        let enhancer = PlaylistEnhancer::new(api);
        let input = playlist(vec![TrackDescriptor::stub("spotify:track:abc123")]);

        let out = enhancer.enhance(&input).await;

        assert_eq!(out.tracks[0].service_track_id, "spotify:track:abc123");
        assert_eq!(out.tracks[0].name, "Song abc123");
    }

    #[tokio::test]
    async fn already_enriched_tracks_skip_the_lookup() {
        let api = FakeApi::new(None);
        let enhancer = PlaylistEnhancer::new(api.clone());
        let full = TrackDescriptor {
            service_track_id: "t0".to_string(),
            name: "Kept".to_string(),
            artist_name: "Artist".to_string(),
            album_art_url: None,
            preview_url: None,
        };
        let input = playlist(vec![full.clone()]);

        let out = enhancer.enhance(&input).await;

        assert_eq!(out.tracks[0], full);
        assert_eq!(api.lookups.load(Ordering::SeqCst), 0);
    }
}
