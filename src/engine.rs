use std::sync::Arc;

use futures::stream::{self, StreamExt};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::api::client::CatalogClient;
use crate::api::models::{AlbumMeta, ArtistRef, ArtistType, TrackCredits};
use crate::cache::Caches;
use crate::error::Flaw;
use crate::fs_layout::{Cover, DownloadDir, InfoFile, TrackFile};
use crate::models::{Kind, TrackFormat};
use crate::tag::{self, TagAttrs};

/// Races `fut` against cancellation, so a per-track step that isn't itself
/// cancellation-aware (credits/lyrics lookups, the ffmpeg tag embed) is
/// abandoned promptly once the job is canceled.
async fn cancelable<T>(
    cancel: &CancellationToken,
    fut: impl std::future::Future<Output = Result<T, Flaw>>,
) -> Result<T, Flaw> {
    tokio::select! {
        _ = cancel.cancelled() => Err(Flaw::Canceled),
        result = fut => result,
    }
}

/// Per-kind concurrency caps, loaded from `Settings`.
#[derive(Clone, Copy)]
pub struct EngineLimits {
    pub album_download_concurrency: usize,
    pub playlist_download_concurrency: usize,
    pub mix_download_concurrency: usize,
    pub vnd_concurrency: usize,
}

/// Sidecar written once per album/playlist/mix, read back by the Upload
/// Batcher to know what to publish.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KindSidecar {
    pub caption: String,
    /// For a playlist/mix this has exactly one inner vec; for an album one
    /// inner vec per volume.
    pub volume_track_ids: Vec<Vec<i64>>,
}

/// Per-track sidecar mirroring the final tagged state of the file, read
/// back by the Upload Batcher to build captions/attributes without
/// re-touching the catalog API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackSidecar {
    pub id: i64,
    pub title: String,
    pub artists: Vec<(String, ArtistTypeWire)>,
    pub performer: String,
    pub duration_seconds: u32,
    pub extension: String,
    pub cover_id: Option<String>,
    pub version: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ArtistTypeWire {
    Main,
    Featured,
}

impl From<ArtistType> for ArtistTypeWire {
    fn from(a: ArtistType) -> Self {
        match a {
            ArtistType::Main => ArtistTypeWire::Main,
            ArtistType::Featured => ArtistTypeWire::Featured,
        }
    }
}

impl From<ArtistTypeWire> for ArtistType {
    fn from(a: ArtistTypeWire) -> Self {
        match a {
            ArtistTypeWire::Main => ArtistType::Main,
            ArtistTypeWire::Featured => ArtistType::Featured,
        }
    }
}

pub struct DownloadEngine {
    client: Arc<CatalogClient>,
    http: reqwest::Client,
    caches: Arc<Caches>,
    dir: DownloadDir,
    limits: EngineLimits,
}

impl DownloadEngine {
    pub fn new(
        client: Arc<CatalogClient>,
        http: reqwest::Client,
        caches: Arc<Caches>,
        dir: DownloadDir,
        limits: EngineLimits,
    ) -> Self {
        DownloadEngine {
            client,
            http,
            caches,
            dir,
            limits,
        }
    }

    pub async fn single(&self, id: i64, cancel: &CancellationToken) -> Result<(), Flaw> {
        let meta = self.client.track_info(id).await?;
        let album = self.album_meta(meta.album_id).await?;
        if let Some(cover_id) = &album.cover_id {
            self.ensure_cover(cover_id).await?;
        }
        self.download_and_tag(
            id,
            &meta.track.title,
            &meta.track.artists,
            meta.track.duration_seconds,
            meta.track.track_number,
            album.total_tracks,
            meta.track.volume_number,
            album.total_volumes,
            &album.title,
            &album.artist,
            meta.track.copyright.as_deref(),
            meta.track.isrc.as_deref(),
            album.release_date.as_deref(),
            meta.track.version.as_deref(),
            album.cover_id.as_deref(),
            cancel,
        )
        .await?;

        let sidecar = KindSidecar {
            caption: format!("{} - {}", album.artist, meta.track.title),
            volume_track_ids: vec![vec![id]],
        };
        InfoFile::at(self.dir.kind_sidecar_path(Kind::Track, &id.to_string()))
            .write(&sidecar)
            .await?;
        Ok(())
    }

    pub async fn album(&self, album_id: i64, cancel: &CancellationToken) -> Result<(), Flaw> {
        let album = self.client.album_info(album_id).await?;
        self.caches
            .albums_meta
            .set(album_id, Arc::new(album.clone()))
            .await;

        if let Some(cover_id) = &album.cover_id {
            self.ensure_cover(cover_id).await?;
        }

        let tracks = self.client.album_items(album_id).await?;
        // pre-populate credits, since the album-items endpoint already
        // returned them inline - avoids a per-track credits call.
        for t in &tracks {
            self.caches
                .track_credits
                .set(t.track.id, Arc::new(t.credits.clone()))
                .await;
        }

        let mut by_volume: std::collections::BTreeMap<u32, Vec<i64>> =
            std::collections::BTreeMap::new();
        for t in &tracks {
            by_volume.entry(t.track.volume_number).or_default().push(t.track.id);
        }

        let results: Vec<Result<(), Flaw>> = stream::iter(tracks.iter().cloned())
            .map(|t| {
                let album = album.clone();
                async move {
                    let id = t.track.id;
                    if self.dir.track_sidecar_path(id).exists() {
                        return Ok(());
                    }
                    self.download_and_tag(
                        id,
                        &t.track.title,
                        &t.track.artists,
                        t.track.duration_seconds,
                        t.track.track_number,
                        album.total_tracks,
                        t.track.volume_number,
                        album.total_volumes,
                        &album.title,
                        &album.artist,
                        t.track.copyright.as_deref(),
                        t.track.isrc.as_deref(),
                        album.release_date.as_deref(),
                        t.track.version.as_deref(),
                        album.cover_id.as_deref(),
                        cancel,
                    )
                    .await
                }
            })
            .buffer_unordered(self.limits.album_download_concurrency)
            .collect()
            .await;
        report_failures(results)?;

        let sidecar = KindSidecar {
            caption: format!("{} - {}", album.artist, album.title),
            volume_track_ids: by_volume.into_values().collect(),
        };
        InfoFile::at(self.dir.kind_sidecar_path(Kind::Album, &album_id.to_string()))
            .write(&sidecar)
            .await?;
        Ok(())
    }

    pub async fn playlist(&self, uuid: &str, cancel: &CancellationToken) -> Result<(), Flaw> {
        self.download_list(Kind::Playlist, uuid, &format!("/playlists/{uuid}/items"), cancel)
            .await
    }

    pub async fn mix(&self, id: &str, cancel: &CancellationToken) -> Result<(), Flaw> {
        self.download_list(Kind::Mix, id, &format!("/mixes/{id}/items"), cancel)
            .await
    }

    async fn download_list(
        &self,
        kind: Kind,
        id: &str,
        items_path: &str,
        cancel: &CancellationToken,
    ) -> Result<(), Flaw> {
        let info = match kind {
            Kind::Playlist => self.client.playlist_info(id).await?,
            Kind::Mix => self.client.mix_info(id).await?,
            _ => unreachable!("download_list only handles playlist/mix"),
        };
        let tracks = self.client.list_items(items_path).await?;
        if let Some(cut_item) = tracks.iter().find(|t| t.cut.is_some()) {
            return Err(Flaw::structured(
                "playlist item is cut and cannot be downloaded",
                anyhow::anyhow!(
                    "track_id={} title={:?}",
                    cut_item.track.id,
                    cut_item.track.title
                ),
            ));
        }

        let concurrency = match kind {
            Kind::Playlist => self.limits.playlist_download_concurrency,
            Kind::Mix => self.limits.mix_download_concurrency,
            _ => unreachable!(),
        };

        let results: Vec<Result<(), Flaw>> = stream::iter(tracks.iter().cloned())
            .map(|t| async move {
                let id = t.track.id;
                if self.dir.track_sidecar_path(id).exists() {
                    return Ok(());
                }
                let album = self.album_meta(t.album_id).await?;
                if let Some(cover_id) = t.cover_id.as_deref().or(album.cover_id.as_deref()) {
                    self.ensure_cover(cover_id).await?;
                }
                self.download_and_tag(
                    id,
                    &t.track.title,
                    &t.track.artists,
                    t.track.duration_seconds,
                    t.track.track_number,
                    album.total_tracks,
                    t.track.volume_number,
                    album.total_volumes,
                    &t.album_title,
                    &album.artist,
                    t.track.copyright.as_deref(),
                    t.track.isrc.as_deref(),
                    album.release_date.as_deref(),
                    t.track.version.as_deref(),
                    t.cover_id.as_deref().or(album.cover_id.as_deref()),
                    cancel,
                )
                .await
            })
            .buffer_unordered(concurrency)
            .collect()
            .await;
        report_failures(results)?;

        let sidecar = KindSidecar {
            caption: info.title.clone(),
            volume_track_ids: vec![tracks.iter().map(|t| t.track.id).collect()],
        };
        InfoFile::at(self.dir.kind_sidecar_path(kind, id))
            .write(&sidecar)
            .await?;
        Ok(())
    }

    async fn album_meta(&self, album_id: i64) -> Result<Arc<AlbumMeta>, Flaw> {
        let client = self.client.clone();
        self.caches
            .albums_meta
            .fetch(album_id, || async move {
                client.album_info(album_id).await.map(Arc::new)
            })
            .await
    }

    async fn ensure_cover(&self, cover_id: &str) -> Result<(), Flaw> {
        let cover = Cover::at(self.dir.cover_path(cover_id));
        if cover.exists() {
            return Ok(());
        }
        let client = self.client.clone();
        let http = self.http.clone();
        let cover_id_owned = cover_id.to_string();
        let bytes = self
            .caches
            .downloaded_covers
            .fetch(cover_id.to_string(), || async move {
                fetch_cover(&http, &client, &cover_id_owned).await.map(Arc::new)
            })
            .await?;
        cover.write(&bytes).await
    }

    async fn credits(&self, track_id: i64) -> Result<Arc<TrackCredits>, Flaw> {
        let client = self.client.clone();
        self.caches
            .track_credits
            .fetch(track_id, || async move { client.track_credits(track_id).await.map(Arc::new) })
            .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn download_and_tag(
        &self,
        track_id: i64,
        title: &str,
        artists: &[ArtistRef],
        duration_seconds: u32,
        track_number: u32,
        total_tracks: u32,
        volume_number: u32,
        total_volumes: u32,
        album_title: &str,
        album_artist: &str,
        copyright: Option<&str>,
        isrc: Option<&str>,
        release_date: Option<&str>,
        version: Option<&str>,
        cover_id: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<(), Flaw> {
        let dst = self.dir.track_path(track_id);
        let track_file = TrackFile::at(dst.clone());
        if track_file.exists() {
            return Ok(());
        }

        let result = self
            .download_and_tag_inner(
                track_id,
                title,
                artists,
                duration_seconds,
                track_number,
                total_tracks,
                volume_number,
                total_volumes,
                album_title,
                album_artist,
                copyright,
                isrc,
                release_date,
                version,
                cover_id,
                &dst,
                cancel,
            )
            .await;

        if result.is_err() {
            if let Err(cleanup_err) = track_file.remove().await {
                warn!("failed to clean up partial track {track_id}: {cleanup_err}");
            }
        }
        result
    }

    #[allow(clippy::too_many_arguments)]
    async fn download_and_tag_inner(
        &self,
        track_id: i64,
        title: &str,
        artists: &[ArtistRef],
        duration_seconds: u32,
        track_number: u32,
        total_tracks: u32,
        volume_number: u32,
        total_volumes: u32,
        album_title: &str,
        album_artist: &str,
        copyright: Option<&str>,
        isrc: Option<&str>,
        release_date: Option<&str>,
        version: Option<&str>,
        cover_id: Option<&str>,
        dst: &std::path::Path,
        cancel: &CancellationToken,
    ) -> Result<(), Flaw> {
        let format = crate::stream::download_track(
            &self.client,
            &self.http,
            track_id,
            dst,
            self.limits.vnd_concurrency,
            cancel,
        )
        .await?;

        let credits = cancelable(cancel, async { self.credits(track_id).await }).await?;
        let lyrics =
            cancelable(cancel, async { self.client.track_lyrics(track_id).await }).await?;
        let cover_path = cover_id
            .map(|id| self.dir.cover_path(id))
            .unwrap_or_else(|| self.dir.cover_path("none"));

        let attrs = TagAttrs {
            artists: artists
                .iter()
                .map(|a| (a.name.clone(), a.kind))
                .collect(),
            title: title.to_string(),
            album: album_title.to_string(),
            album_artist: album_artist.to_string(),
            copyright: copyright.map(|s| s.to_string()),
            isrc: isrc.map(|s| s.to_string()),
            track_number,
            total_tracks,
            disc_number: volume_number,
            total_discs: total_volumes,
            release_date: release_date.map(|s| s.to_string()),
            lyrics,
            credits: (*credits).clone(),
            version: version.map(|s| s.to_string()),
        };

        cancelable(cancel, async { tag::embed(dst, &cover_path, format, &attrs).await }).await?;

        let performer = attrs
            .artists
            .iter()
            .find(|(_, k)| *k == ArtistType::Main)
            .map(|(n, _)| n.clone())
            .unwrap_or_else(|| album_artist.to_string());

        let sidecar = TrackSidecar {
            id: track_id,
            title: title.to_string(),
            artists: artists
                .iter()
                .map(|a| (a.name.clone(), ArtistTypeWire::from(a.kind)))
                .collect(),
            performer,
            duration_seconds,
            extension: format.extension().to_string(),
            cover_id: cover_id.map(|s| s.to_string()),
            version: version.map(|s| s.to_string()),
        };
        InfoFile::at(self.dir.track_sidecar_path(track_id))
            .write(&sidecar)
            .await?;
        Ok(())
    }
}

async fn fetch_cover(
    http: &reqwest::Client,
    _client: &CatalogClient,
    cover_id: &str,
) -> Result<Vec<u8>, Flaw> {
    let uuid_path = cover_id.replace('-', "/");
    let url = format!("https://resources.tidal.com/images/{uuid_path}/1280x1280.jpg");
    let response = http
        .get(&url)
        .send()
        .await
        .map_err(|e| Flaw::structured("cover request failed", e.into()))?;
    if !response.status().is_success() {
        return Err(Flaw::structured(
            "cover request returned an error",
            anyhow::anyhow!("status={}", response.status()),
        ));
    }
    response
        .bytes()
        .await
        .map(|b| b.to_vec())
        .map_err(|e| Flaw::structured("failed to read cover body", e.into()))
}

/// Logs every per-track failure, then surfaces one of them to the caller so
/// a kind-call that lost tracks to a retryable error doesn't report success.
/// A retryable failure (if any) wins over a terminal one, since that's the
/// one the Job Controller's retry loop needs to see.
fn report_failures(results: Vec<Result<(), Flaw>>) -> Result<(), Flaw> {
    let ok_count = results.iter().filter(|r| r.is_ok()).count();
    let total = results.len();
    for result in &results {
        if let Err(err) = result {
            warn!("track download failed: {err}");
        }
    }
    info!("{ok_count} of {total} tracks downloaded successfully");

    let mut first_terminal = None;
    for result in results {
        if let Err(err) = result {
            if err.is_retryable() {
                return Err(err);
            }
            if first_terminal.is_none() {
                first_terminal = Some(err);
            }
        }
    }
    match first_terminal {
        Some(err) => Err(err),
        None => Ok(()),
    }
}
