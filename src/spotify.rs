use std::fmt;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use reqwest::{Client as HttpClient, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::auth::TokenSource;

/// A track with resolved metadata. Immutable once resolved; enrichment
/// either produces a fully populated descriptor or leaves the stub alone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackDescriptor {
    pub service_track_id: String,
    pub name: String,
    pub artist_name: String,
    pub album_art_url: Option<String>,
    pub preview_url: Option<String>,
}

impl TrackDescriptor {
    /// A bare stub carrying only the service track id, as stored playlists
    /// keep them.
    pub fn stub(service_track_id: impl Into<String>) -> Self {
        Self {
            service_track_id: service_track_id.into(),
            name: String::new(),
            artist_name: String::new(),
            album_art_url: None,
            preview_url: None,
        }
    }

    pub fn is_stub(&self) -> bool {
        self.name.is_empty()
    }
}

/// How a device-play command failed, as far as the resolver cares.
#[derive(Debug)]
pub enum PlayCommandError {
    /// 403: full-track device playback needs the paid tier.
    PremiumRequired,
    /// 404: the track cannot be played on a device.
    NotPlayable,
    /// The service's known false-negative control-plane error; audio
    /// actually starts despite it. Matched by configured substring.
    Benign(String),
    Other(anyhow::Error),
}

impl fmt::Display for PlayCommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlayCommandError::PremiumRequired => write!(f, "premium entitlement required"),
            PlayCommandError::NotPlayable => write!(f, "track not playable on a device"),
            PlayCommandError::Benign(m) => write!(f, "benign control-plane error: {}", m),
            PlayCommandError::Other(e) => write!(f, "play command failed: {}", e),
        }
    }
}

/// The slice of the streaming service's REST surface this layer calls.
#[async_trait]
pub trait StreamingApi: Send + Sync {
    /// `GET /tracks/{id}`: metadata including the preview-clip URL.
    async fn get_track(&self, track_id: &str) -> Result<TrackDescriptor>;

    /// `PUT /me/player/play?device_id=...`: start full-track playback on
    /// the managed device.
    async fn play_on_device(&self, device_id: &str, track_id: &str)
        -> Result<(), PlayCommandError>;

    /// `GET /me`: whether the account has the premium entitlement. The
    /// resolver never needs this (a 403 on the play command already covers
    /// it); hosts call it up front to decide whether to offer device
    /// playback in the UI at all.
    async fn check_premium(&self) -> Result<bool>;
}

/// reqwest-backed client against the configured API base.
pub struct SpotifyClient {
    http: HttpClient,
    api_base_url: String,
    tokens: Arc<dyn TokenSource>,
    benign_markers: Vec<String>,
}

impl SpotifyClient {
    pub fn new(
        http: HttpClient,
        api_base_url: String,
        tokens: Arc<dyn TokenSource>,
        benign_markers: Vec<String>,
    ) -> Self {
        Self {
            http,
            api_base_url,
            tokens,
            benign_markers,
        }
    }

    async fn bearer(&self) -> Result<String> {
        self.tokens
            .access_token()
            .await
            .ok_or_else(|| anyhow!("No access token available"))
    }

    fn parse_track(json: &Value) -> Option<TrackDescriptor> {
        let id = json.get("id")?.as_str()?.to_string();
        let name = json.get("name")?.as_str()?.to_string();

        let artist_name = json
            .get("artists")
            .and_then(|a| a.as_array())
            .and_then(|arr| arr.first())
            .and_then(|a| a.get("name"))
            .and_then(|n| n.as_str())
            .unwrap_or("Unknown Artist")
            .to_string();

        let album_art_url = json
            .get("album")
            .and_then(|a| a.get("images"))
            .and_then(|i| i.as_array())
            .and_then(|arr| arr.first())
            .and_then(|img| img.get("url"))
            .and_then(|u| u.as_str())
            .map(|s| s.to_string());

        let preview_url = json
            .get("preview_url")
            .and_then(|p| p.as_str())
            .map(|s| s.to_string());

        Some(TrackDescriptor {
            service_track_id: id,
            name,
            artist_name,
            album_art_url,
            preview_url,
        })
    }

    fn has_premium_product(json: &Value) -> bool {
        json.get("product").and_then(|p| p.as_str()) == Some("premium")
    }

    fn classify_play_failure(&self, status: StatusCode, body: &str) -> PlayCommandError {
        // The benign marker is matched purely on the message and wins over
        // the status code; the service has delivered it under more than one.
        if self.benign_markers.iter().any(|m| body.contains(m.as_str())) {
            return PlayCommandError::Benign(body.to_string());
        }
        if status == StatusCode::FORBIDDEN {
            return PlayCommandError::PremiumRequired;
        }
        if status == StatusCode::NOT_FOUND {
            return PlayCommandError::NotPlayable;
        }
        PlayCommandError::Other(anyhow!("Play command returned {}: {}", status, body))
    }
}

#[async_trait]
impl StreamingApi for SpotifyClient {
    async fn get_track(&self, track_id: &str) -> Result<TrackDescriptor> {
        let token = self.bearer().await?;
        let url = format!("{}/tracks/{}", self.api_base_url, track_id);

        let response = self.http.get(&url).bearer_auth(&token).send().await?;

        if !response.status().is_success() {
            let status = response.status();
            return Err(anyhow!("Track lookup returned {}", status));
        }

        let json: Value = response.json().await?;
        Self::parse_track(&json).ok_or_else(|| anyhow!("Malformed track payload"))
    }

    async fn play_on_device(
        &self,
        device_id: &str,
        track_id: &str,
    ) -> Result<(), PlayCommandError> {
        let token = self
            .bearer()
            .await
            .map_err(PlayCommandError::Other)?;

        let url = format!(
            "{}/me/player/play?device_id={}",
            self.api_base_url, device_id
        );
        let body = json!({ "uris": [format!("spotify:track:{}", track_id)] });

        let response = self
            .http
            .put(&url)
            .bearer_auth(&token)
            .json(&body)
            .send()
            .await
            .map_err(|e| PlayCommandError::Other(e.into()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let text = response.text().await.unwrap_or_default();
        Err(self.classify_play_failure(status, &text))
    }

    async fn check_premium(&self) -> Result<bool> {
        let token = self.bearer().await?;
        let url = format!("{}/me", self.api_base_url);

        let response = self.http.get(&url).bearer_auth(&token).send().await?;
        if !response.status().is_success() {
            return Err(anyhow!("Profile lookup returned {}", response.status()));
        }

        let json: Value = response.json().await?;
        Ok(Self::has_premium_product(&json))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client_with_markers(markers: Vec<String>) -> SpotifyClient {
        struct NoTokens;

        #[async_trait]
        impl TokenSource for NoTokens {
            async fn access_token(&self) -> Option<String> {
                None
            }
            async fn user_authenticated(&self) -> bool {
                false
            }
        }

        SpotifyClient::new(
            HttpClient::new(),
            "https://api.example.com/v1".to_string(),
            Arc::new(NoTokens),
            markers,
        )
    }

    #[test]
    fn parse_track_reads_preview_and_artwork() {
        let json: Value = serde_json::from_str(
            r#"{
                "id": "abc123",
                "name": "Song",
                "artists": [{"name": "Artist"}],
                "album": {"images": [{"url": "https://img/640.jpg"}, {"url": "https://img/300.jpg"}]},
                "preview_url": "https://preview/clip.mp3"
            }"#,
        )
        .unwrap();

        let track = SpotifyClient::parse_track(&json).unwrap();
        assert_eq!(track.service_track_id, "abc123");
        assert_eq!(track.name, "Song");
        assert_eq!(track.artist_name, "Artist");
        assert_eq!(track.album_art_url.as_deref(), Some("https://img/640.jpg"));
        assert_eq!(track.preview_url.as_deref(), Some("https://preview/clip.mp3"));
    }

    #[test]
    fn parse_track_tolerates_missing_optional_fields() {
        let json: Value =
            serde_json::from_str(r#"{"id": "abc123", "name": "Song", "preview_url": null}"#)
                .unwrap();

        let track = SpotifyClient::parse_track(&json).unwrap();
        assert_eq!(track.artist_name, "Unknown Artist");
        assert!(track.album_art_url.is_none());
        assert!(track.preview_url.is_none());
    }

    #[test]
    fn parse_track_rejects_payload_without_id() {
        let json: Value = serde_json::from_str(r#"{"name": "Song"}"#).unwrap();
        assert!(SpotifyClient::parse_track(&json).is_none());
    }

    #[test]
    fn classify_distinguishes_premium_and_not_playable() {
        let client = client_with_markers(vec![]);

        assert!(matches!(
            client.classify_play_failure(StatusCode::FORBIDDEN, "Premium required"),
            PlayCommandError::PremiumRequired
        ));
        assert!(matches!(
            client.classify_play_failure(StatusCode::NOT_FOUND, "Not found"),
            PlayCommandError::NotPlayable
        ));
    }

    #[test]
    fn classify_matches_configured_benign_marker() {
        let client = client_with_markers(vec!["Restriction violated".to_string()]);

        let err = client.classify_play_failure(
            StatusCode::BAD_GATEWAY,
            r#"{"error":{"message":"Restriction violated"}}"#,
        );
        assert!(matches!(err, PlayCommandError::Benign(_)));

        // Without the marker configured the same body is a real failure.
        let strict = client_with_markers(vec![]);
        let err = strict.classify_play_failure(
            StatusCode::BAD_GATEWAY,
            r#"{"error":{"message":"Restriction violated"}}"#,
        );
        assert!(matches!(err, PlayCommandError::Other(_)));
    }

    #[test]
    fn premium_entitlement_is_read_from_the_product_field() {
        let premium: Value = serde_json::from_str(r#"{"product":"premium"}"#).unwrap();
        assert!(SpotifyClient::has_premium_product(&premium));

        let free: Value = serde_json::from_str(r#"{"product":"free"}"#).unwrap();
        assert!(!SpotifyClient::has_premium_product(&free));

        let missing: Value = serde_json::from_str(r#"{"display_name":"x"}"#).unwrap();
        assert!(!SpotifyClient::has_premium_product(&missing));
    }

    #[test]
    fn benign_marker_wins_over_status_classification() {
        let client = client_with_markers(vec!["Restriction violated".to_string()]);

        let err =
            client.classify_play_failure(StatusCode::FORBIDDEN, "Restriction violated");
        assert!(matches!(err, PlayCommandError::Benign(_)));

        let err = client.classify_play_failure(StatusCode::NOT_FOUND, "Restriction violated");
        assert!(matches!(err, PlayCommandError::Benign(_)));
    }

    #[test]
    fn stub_descriptor_is_recognized() {
        let stub = TrackDescriptor::stub("abc123");
        assert!(stub.is_stub());

        let full = TrackDescriptor {
            service_track_id: "abc123".into(),
            name: "Song".into(),
            artist_name: "Artist".into(),
            album_art_url: None,
            preview_url: None,
        };
        assert!(!full.is_stub());
    }
}
