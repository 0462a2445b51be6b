use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{de::DeserializeOwned, Serialize};

use crate::error::Flaw;
use crate::models::Kind;

/// Path computation and JSON sidecar I/O under a single download root,
/// following the layout:
///
/// ```text
/// <root>/<id>            audio file (single track, or a list/album track)
/// <root>/<id>.json       per-track sidecar
/// <root>/<id>.jpg        per-track cover (lists) or per-album cover (albums)
/// <root>/<kind-id>.json  kind-level sidecar (caption + track ids)
/// ```
#[derive(Clone)]
pub struct DownloadDir {
    root: PathBuf,
}

impl DownloadDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        DownloadDir { root: root.into() }
    }

    pub fn track_path(&self, track_id: i64) -> PathBuf {
        self.root.join(track_id.to_string())
    }

    pub fn track_sidecar_path(&self, track_id: i64) -> PathBuf {
        self.root.join(format!("{track_id}.json"))
    }

    pub fn cover_path(&self, cover_id: &str) -> PathBuf {
        self.root.join(format!("{cover_id}.jpg"))
    }

    pub fn kind_sidecar_path(&self, kind: Kind, id: &str) -> PathBuf {
        self.root.join(format!("{kind}-{id}.json"))
    }

    pub async fn ensure_root(&self) -> Result<(), Flaw> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|e| Flaw::structured("failed to create download root", e.into()))
    }
}

/// A single-file cover image on disk. Reads and writes are atomic with
/// respect to each call (each call is one whole-file operation, never a
/// partial write visible to another reader).
pub struct Cover {
    path: PathBuf,
}

impl Cover {
    pub fn at(path: PathBuf) -> Self {
        Cover { path }
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    pub async fn read(&self) -> Result<Vec<u8>, Flaw> {
        tokio::fs::read(&self.path)
            .await
            .map_err(|e| Flaw::structured("failed to read cover", e.into()))
    }

    pub async fn write(&self, bytes: &[u8]) -> Result<(), Flaw> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Flaw::structured("failed to create cover directory", e.into()))?;
        }
        let tmp = self.path.with_extension("jpg.tmp");
        tokio::fs::write(&tmp, bytes)
            .await
            .map_err(|e| Flaw::structured("failed to write cover", e.into()))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| Flaw::structured("failed to finalize cover write", e.into()))?;
        Ok(())
    }
}

/// A JSON sidecar file, read or written as a whole. Writes are fsynced so a
/// concurrent reader never observes a partially-flushed file.
pub struct InfoFile<T> {
    path: PathBuf,
    _marker: std::marker::PhantomData<T>,
}

impl<T> InfoFile<T>
where
    T: Serialize + DeserializeOwned,
{
    pub fn at(path: PathBuf) -> Self {
        InfoFile {
            path,
            _marker: std::marker::PhantomData,
        }
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    pub async fn read(&self) -> Result<T, Flaw> {
        let bytes = tokio::fs::read(&self.path)
            .await
            .map_err(|e| Flaw::structured("failed to read sidecar", e.into()))?;
        serde_json::from_slice(&bytes)
            .map_err(|e| Flaw::structured("failed to decode sidecar", e.into()))
    }

    pub async fn write(&self, value: &T) -> Result<(), Flaw> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Flaw::structured("failed to create sidecar directory", e.into()))?;
        }
        let bytes = serde_json::to_vec_pretty(value)
            .map_err(|e| Flaw::structured("failed to encode sidecar", e.into()))?;
        let file = tokio::fs::File::create(&self.path)
            .await
            .map_err(|e| Flaw::structured("failed to create sidecar file", e.into()))?;
        use tokio::io::AsyncWriteExt;
        let mut file = file;
        file.write_all(&bytes)
            .await
            .map_err(|e| Flaw::structured("failed to write sidecar", e.into()))?;
        file.sync_all()
            .await
            .map_err(|e| Flaw::structured("failed to fsync sidecar", e.into()))?;
        Ok(())
    }
}

/// The downloaded-but-not-yet-tagged (or mid-download) audio file. `remove`
/// tolerates the file's absence, since it's called from every cleanup path
/// regardless of how far the download progressed.
pub struct TrackFile {
    path: PathBuf,
}

impl TrackFile {
    pub fn at(path: PathBuf) -> Self {
        TrackFile { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    pub async fn remove(&self) -> Result<(), Flaw> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Flaw::structured("failed to remove partial track file", e.into())),
        }
    }
}

/// RAII guard that removes the file at `path` on drop unless `disarm` was
/// called. Used on every download/tag-embed path so a partial file never
/// survives an error.
pub struct PartialFileGuard {
    path: Option<PathBuf>,
}

impl PartialFileGuard {
    pub fn new(path: PathBuf) -> Self {
        PartialFileGuard { path: Some(path) }
    }

    pub fn disarm(&mut self) {
        self.path = None;
    }
}

impl Drop for PartialFileGuard {
    fn drop(&mut self) {
        if let Some(path) = self.path.take() {
            let _ = std::fs::remove_file(path);
        }
    }
}

pub fn ensure_private_dir(path: &Path) -> anyhow::Result<()> {
    std::fs::create_dir_all(path).context("creating directory")?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))
            .context("setting directory permissions")?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn track_remove_tolerates_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let track = TrackFile::at(dir.path().join("1234"));
        assert!(!track.exists());
        track.remove().await.unwrap();
    }

    #[tokio::test]
    async fn info_file_round_trips() {
        #[derive(serde::Serialize, serde::Deserialize, PartialEq, Debug)]
        struct Payload {
            caption: String,
            track_ids: Vec<i64>,
        }
        let dir = tempfile::tempdir().unwrap();
        let info = InfoFile::<Payload>::at(dir.path().join("42.json"));
        let value = Payload {
            caption: "hello".into(),
            track_ids: vec![1, 2, 3],
        };
        info.write(&value).await.unwrap();
        let read_back = info.read().await.unwrap();
        assert_eq!(read_back, value);
    }

    #[tokio::test]
    async fn partial_file_guard_removes_unless_disarmed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("partial.bin");
        tokio::fs::write(&path, b"data").await.unwrap();
        {
            let _guard = PartialFileGuard::new(path.clone());
        }
        assert!(!path.exists());

        tokio::fs::write(&path, b"data").await.unwrap();
        {
            let mut guard = PartialFileGuard::new(path.clone());
            guard.disarm();
        }
        assert!(path.exists());
    }
}
