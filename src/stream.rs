use std::cmp::min;
use std::path::{Path, PathBuf};

use anyhow::anyhow;
use base64::Engine;
use futures::future::try_join_all;
use log::debug;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use crate::api::client::CatalogClient;
use crate::api::models::{DashStream, StreamManifest, VndStream};
use crate::api::mpd;
use crate::error::Flaw;
use crate::fs_layout::PartialFileGuard;
use crate::models::TrackFormat;

const DASH_SEGMENTS_PER_BATCH: u32 = 10;
const VND_CHUNK_SIZE: u64 = 1024 * 1024;

/// Races `fut` against cancellation, so an in-flight HTTP call is abandoned
/// rather than awaited to completion once the caller cancels.
async fn cancelable<T>(
    cancel: &CancellationToken,
    fut: impl std::future::Future<Output = Result<T, Flaw>>,
) -> Result<T, Flaw> {
    tokio::select! {
        _ = cancel.cancelled() => Err(Flaw::Canceled),
        result = fut => result,
    }
}

/// Resolves a track's playback manifest and downloads the audio to `dst`,
/// returning the resolved container/codec. `dst` must not already exist;
/// callers are responsible for the download-root skip-if-exists check.
pub async fn download_track(
    client: &CatalogClient,
    http: &reqwest::Client,
    track_id: i64,
    dst: &Path,
    vnd_concurrency: usize,
    cancel: &CancellationToken,
) -> Result<TrackFormat, Flaw> {
    tokio::select! {
        _ = cancel.cancelled() => return Err(Flaw::Canceled),
        _ = pre_download_jitter() => {}
    }

    let manifest = resolve_manifest(client, track_id, cancel).await?;
    let format = match &manifest {
        StreamManifest::Dash(d) => TrackFormat::from_mime_and_codec(&d.mime_type, &d.codec)?,
        StreamManifest::Vnd(v) => TrackFormat::from_mime_and_codec(&v.mime_type, &v.codecs)?,
    };

    let mut guard = PartialFileGuard::new(dst.to_path_buf());
    match manifest {
        StreamManifest::Dash(dash) => download_dash(http, &dash, dst, cancel).await?,
        StreamManifest::Vnd(vnd) => download_vnd(http, &vnd, dst, vnd_concurrency, cancel).await?,
    }
    guard.disarm();

    Ok(format)
}

async fn resolve_manifest(
    client: &CatalogClient,
    track_id: i64,
    cancel: &CancellationToken,
) -> Result<StreamManifest, Flaw> {
    let info = cancelable(cancel, client.playback_info(track_id)).await?;
    let manifest_bytes = base64::engine::general_purpose::STANDARD
        .decode(&info.manifest)
        .map_err(|e| Flaw::structured("failed to decode playback manifest", e.into()))?;

    match info.manifest_mime_type.as_str() {
        "application/dash+xml" => {
            let xml = String::from_utf8(manifest_bytes)
                .map_err(|e| Flaw::structured("dash manifest was not utf8", e.into()))?;
            let dash = mpd::parse_stream_info(&xml)
                .map_err(|e| Flaw::structured("failed to parse dash manifest", e))?;
            Ok(StreamManifest::Dash(dash))
        }
        "application/vnd.tidal.bts" => {
            let vnd: VndStream = serde_json::from_slice(&manifest_bytes)
                .map_err(|e| Flaw::structured("failed to parse vnd manifest", e.into()))?;
            if vnd.encryption_type != "NONE" {
                return Err(Flaw::structured(
                    "encrypted streams are not supported",
                    anyhow!("encryption_type={}", vnd.encryption_type),
                ));
            }
            if vnd.urls.is_empty() {
                return Err(Flaw::structured(
                    "vnd manifest carried no urls",
                    anyhow!(""),
                ));
            }
            Ok(StreamManifest::Vnd(vnd))
        }
        other => Err(Flaw::structured(
            "unsupported manifest mime type",
            anyhow!("{other}"),
        )),
    }
}

async fn download_dash(
    http: &reqwest::Client,
    dash: &DashStream,
    dst: &Path,
    cancel: &CancellationToken,
) -> Result<(), Flaw> {
    let num_batches =
        (dash.segment_count + DASH_SEGMENTS_PER_BATCH - 1) / DASH_SEGMENTS_PER_BATCH;
    let mut batch_futures = Vec::with_capacity(num_batches as usize);
    for batch in 0..num_batches {
        let start = batch * DASH_SEGMENTS_PER_BATCH;
        let end = min(start + DASH_SEGMENTS_PER_BATCH, dash.segment_count);
        let part_path = part_path(dst, batch);
        let template = dash.url_template.clone();
        let http = http.clone();
        let cancel = cancel.clone();
        batch_futures.push(tokio::spawn(async move {
            download_dash_batch(&http, &template, start, end, &part_path, &cancel).await
        }));
    }

    let results = try_join_all(batch_futures)
        .await
        .map_err(|e| Flaw::structured("dash batch task panicked", e.into()))?;
    for result in results {
        result?;
    }

    assemble_parts(dst, num_batches).await
}

async fn download_dash_batch(
    http: &reqwest::Client,
    url_template: &str,
    start: u32,
    end: u32,
    part_path: &Path,
    cancel: &CancellationToken,
) -> Result<(), Flaw> {
    let mut guard = PartialFileGuard::new(part_path.to_path_buf());
    let file = tokio::fs::File::create(part_path)
        .await
        .map_err(|e| Flaw::structured("failed to create dash batch part file", e.into()))?;
    let mut writer = tokio::io::BufWriter::new(file);

    for segment in start..end {
        let url = mpd::segment_url(url_template, segment);
        let bytes = cancelable(cancel, fetch_bytes(http, &url)).await?;
        writer
            .write_all(&bytes)
            .await
            .map_err(|e| Flaw::structured("failed to write dash segment", e.into()))?;
    }
    writer
        .flush()
        .await
        .map_err(|e| Flaw::structured("failed to flush dash batch part file", e.into()))?;
    guard.disarm();
    Ok(())
}

async fn download_vnd(
    http: &reqwest::Client,
    vnd: &VndStream,
    dst: &Path,
    concurrency: usize,
    cancel: &CancellationToken,
) -> Result<(), Flaw> {
    let url = &vnd.urls[0];
    let head = cancelable(cancel, async {
        http.head(url)
            .send()
            .await
            .map_err(|e| Flaw::structured("vnd HEAD request failed", e.into()))
    })
    .await?;
    let total_size = head
        .content_length()
        .ok_or_else(|| Flaw::structured("vnd stream had no content-length", anyhow!("{url}")))?;
    let num_chunks = ((total_size + VND_CHUNK_SIZE - 1) / VND_CHUNK_SIZE) as u32;

    let semaphore = std::sync::Arc::new(tokio::sync::Semaphore::new(concurrency.max(1)));
    let mut chunk_futures = Vec::with_capacity(num_chunks as usize);
    for chunk in 0..num_chunks {
        let start = chunk as u64 * VND_CHUNK_SIZE;
        let end = min(start + VND_CHUNK_SIZE, total_size) - 1;
        let part_path = part_path(dst, chunk);
        let http = http.clone();
        let url = url.clone();
        let semaphore = semaphore.clone();
        let cancel = cancel.clone();
        chunk_futures.push(tokio::spawn(async move {
            let _permit = semaphore.acquire_owned().await.expect("semaphore closed");
            download_vnd_chunk(&http, &url, start, end, &part_path, &cancel).await
        }));
    }

    let results = try_join_all(chunk_futures)
        .await
        .map_err(|e| Flaw::structured("vnd chunk task panicked", e.into()))?;
    for result in results {
        result?;
    }

    assemble_parts(dst, num_chunks).await
}

async fn download_vnd_chunk(
    http: &reqwest::Client,
    url: &str,
    start: u64,
    end: u64,
    part_path: &Path,
    cancel: &CancellationToken,
) -> Result<(), Flaw> {
    let mut guard = PartialFileGuard::new(part_path.to_path_buf());
    let response = cancelable(cancel, async {
        http.get(url)
            .header("Range", format!("bytes={start}-{end}"))
            .send()
            .await
            .map_err(|e| Flaw::structured("vnd range request failed", e.into()))
    })
    .await?;
    if !response.status().is_success() {
        return Err(Flaw::structured(
            "vnd range request returned an error",
            anyhow!("status={}", response.status()),
        ));
    }
    let bytes = cancelable(cancel, async {
        response
            .bytes()
            .await
            .map_err(|e| Flaw::structured("failed to read vnd chunk body", e.into()))
    })
    .await?;
    tokio::fs::write(part_path, &bytes)
        .await
        .map_err(|e| Flaw::structured("failed to write vnd chunk", e.into()))?;
    guard.disarm();
    Ok(())
}

async fn fetch_bytes(http: &reqwest::Client, url: &str) -> Result<Vec<u8>, Flaw> {
    let response = http
        .get(url)
        .send()
        .await
        .map_err(|e| Flaw::structured("segment request failed", e.into()))?;
    if !response.status().is_success() {
        return Err(Flaw::structured(
            "segment request returned an error",
            anyhow!("status={}", response.status()),
        ));
    }
    let bytes = response
        .bytes()
        .await
        .map_err(|e| Flaw::structured("failed to read segment body", e.into()))?;
    Ok(bytes.to_vec())
}

fn part_path(dst: &Path, index: u32) -> PathBuf {
    let mut name = dst.file_name().unwrap_or_default().to_os_string();
    name.push(format!(".part.{index}"));
    dst.with_file_name(name)
}

/// Concatenates part files `0..count` in ascending order into `dst`. This
/// ordering is the only thing that makes the result byte-identical to a
/// serial download, regardless of which order the parts actually finished
/// downloading in.
async fn assemble_parts(dst: &Path, count: u32) -> Result<(), Flaw> {
    let mut guard = PartialFileGuard::new(dst.to_path_buf());
    if let Some(parent) = dst.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| Flaw::structured("failed to create track directory", e.into()))?;
    }
    let file = tokio::fs::File::create(dst)
        .await
        .map_err(|e| Flaw::structured("failed to create assembled track file", e.into()))?;
    let mut writer = tokio::io::BufWriter::with_capacity(1024 * 1024, file);

    let result: Result<(), Flaw> = async {
        for index in 0..count {
            let part = part_path(dst, index);
            let mut part_file = tokio::fs::File::open(&part)
                .await
                .map_err(|e| Flaw::structured("failed to open part file", e.into()))?;
            let mut buf = Vec::new();
            part_file
                .read_to_end(&mut buf)
                .await
                .map_err(|e| Flaw::structured("failed to read part file", e.into()))?;
            writer
                .write_all(&buf)
                .await
                .map_err(|e| Flaw::structured("failed to write assembled track file", e.into()))?;
        }
        writer
            .flush()
            .await
            .map_err(|e| Flaw::structured("failed to flush assembled track file", e.into()))?;
        writer
            .get_ref()
            .sync_all()
            .await
            .map_err(|e| Flaw::structured("failed to fsync assembled track file", e.into()))?;
        Ok(())
    }
    .await;

    for index in 0..count {
        let _ = tokio::fs::remove_file(part_path(dst, index)).await;
    }

    result?;
    guard.disarm();
    Ok(())
}

async fn pre_download_jitter() {
    let millis = fastrand::u64(100..=500);
    tokio::time::sleep(std::time::Duration::from_millis(millis)).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn assembling_parts_is_order_stable_regardless_of_write_order() {
        let dir = tempfile::tempdir().unwrap();
        let dst = dir.path().join("123");

        // simulate batches "finishing" out of order by writing part files
        // in reverse, then assembling - the output must still read 0,1,2.
        for (i, content) in [(2u32, "ccc"), (0, "aaa"), (1, "bbb")] {
            tokio::fs::write(part_path(&dst, i), content).await.unwrap();
        }
        assemble_parts(&dst, 3).await.unwrap();

        let contents = tokio::fs::read_to_string(&dst).await.unwrap();
        assert_eq!(contents, "aaabbbccc");
    }

    #[tokio::test]
    async fn assembly_failure_removes_destination() {
        let dir = tempfile::tempdir().unwrap();
        let dst = dir.path().join("123");
        // no part files exist - assembly must fail and leave nothing behind.
        let result = assemble_parts(&dst, 2).await;
        assert!(result.is_err());
        assert!(!dst.exists());
    }
}
