use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtistRef {
    pub name: String,
    #[serde(rename = "type", default)]
    pub kind: ArtistType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum ArtistType {
    #[default]
    Main,
    Featured,
}

/// Album-level metadata, cached by album id so every track in the album
/// shares one lookup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlbumMeta {
    pub id: i64,
    pub artist: String,
    pub title: String,
    pub release_date: Option<String>,
    pub cover_id: Option<String>,
    pub total_tracks: u32,
    pub total_volumes: u32,
}

/// The common attributes every track carries regardless of how it was
/// fetched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackCommon {
    pub id: i64,
    pub title: String,
    pub artists: Vec<ArtistRef>,
    pub duration_seconds: u32,
    pub track_number: u32,
    pub volume_number: u32,
    pub version: Option<String>,
    pub isrc: Option<String>,
    pub copyright: Option<String>,
}

/// A track fetched standalone - we still need to fetch its album info
/// separately to get cover/title.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SingleTrackMeta {
    #[serde(flatten)]
    pub track: TrackCommon,
    pub album_id: i64,
}

/// A track fetched as part of an album's item listing; credits arrive
/// inline so no extra per-track credits call is needed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlbumTrackMeta {
    #[serde(flatten)]
    pub track: TrackCommon,
    pub album_id: i64,
    pub credits: TrackCredits,
}

/// A track fetched as part of a playlist or mix's item listing. `cut`
/// is normally absent/null; when the catalog returns a non-null value the
/// item has been licensing-cut and cannot be downloaded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListTrackMeta {
    #[serde(flatten)]
    pub track: TrackCommon,
    pub album_id: i64,
    pub album_title: String,
    pub cover_id: Option<String>,
    #[serde(default)]
    pub cut: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TrackCredits {
    #[serde(default)]
    pub producers: Vec<String>,
    #[serde(default)]
    pub composers: Vec<String>,
    #[serde(default)]
    pub lyricists: Vec<String>,
    #[serde(default)]
    pub additional_producers: Vec<String>,
}

impl TrackCredits {
    pub fn from_raw(raw: Vec<RawCreditGroup>) -> TrackCredits {
        let mut credits = TrackCredits::default();
        for group in raw {
            let names: Vec<String> = group.contributors.into_iter().map(|c| c.name).collect();
            match group.kind.as_str() {
                "Producer" => credits.producers = names,
                "Composer" => credits.composers = names,
                "Lyricist" => credits.lyricists = names,
                "Additional Producer" => credits.additional_producers = names,
                _ => {}
            }
        }
        credits
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawCreditGroup {
    #[serde(rename = "type")]
    pub kind: String,
    pub contributors: Vec<RawContributor>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawContributor {
    pub name: String,
}

/// A single page of a paginated catalog listing.
#[derive(Debug, Clone, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: u64,
}

/// Response envelope for the album/playlist/mix items endpoints, where each
/// item is wrapped with its own `item` key.
#[derive(Debug, Clone, Deserialize)]
pub struct ItemEnvelope<T> {
    pub item: T,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlaybackInfoResponse {
    #[serde(rename = "manifestMimeType")]
    pub manifest_mime_type: String,
    pub manifest: String,
}

/// A resolved streaming manifest, dispatched on `manifestMimeType`.
#[derive(Debug, Clone)]
pub enum StreamManifest {
    Dash(DashStream),
    Vnd(VndStream),
}

#[derive(Debug, Clone)]
pub struct DashStream {
    pub mime_type: String,
    pub codec: String,
    pub segment_count: u32,
    pub url_template: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VndStream {
    #[serde(rename = "mimeType")]
    pub mime_type: String,
    pub codecs: String,
    #[serde(rename = "encryptionType")]
    pub encryption_type: String,
    pub urls: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiErrorBody {
    pub status: Option<i64>,
    #[serde(rename = "subStatus")]
    pub sub_status: Option<i64>,
    #[serde(rename = "userMessage")]
    pub user_message: Option<String>,
}
