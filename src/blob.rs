//! Blob storage collaborator.
//!
//! The core only sees [`BlobStore`]. [`LocalBlobStore`] keeps files under a
//! media root, one directory per [`BlobKind`], and is what the HTTP binary
//! serves under the public media URL.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::{fs, io::AsyncReadExt};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlobKind {
    Video,
    Image,
}

impl BlobKind {
    pub fn as_str(self) -> &'static str {
        match self {
            BlobKind::Video => "video",
            BlobKind::Image => "image",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "video" => Some(BlobKind::Video),
            "image" => Some(BlobKind::Image),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredBlob {
    pub url: String,
    pub storage_id: String,
    /// Playback length in seconds, when the backend can tell.
    pub duration: Option<f64>,
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Takes ownership of `local` (a finished upload) and returns where it
    /// is published.
    async fn store(&self, local: &Path, kind: BlobKind) -> CoreResult<StoredBlob>;

    async fn delete(&self, storage_id: &str, kind: BlobKind) -> CoreResult<()>;
}

pub struct LocalBlobStore {
    root: PathBuf,
    public_url: String,
}

impl LocalBlobStore {
    pub fn new(root: impl Into<PathBuf>, public_url: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            public_url: public_url.into().trim_end_matches('/').to_owned(),
        }
    }

    /// On-disk location of a published blob. Rejects names that could
    /// escape the kind's directory.
    pub fn resolve(&self, kind: BlobKind, storage_id: &str) -> CoreResult<PathBuf> {
        validate_storage_id(storage_id)?;
        Ok(self.root.join(kind.as_str()).join(storage_id))
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    async fn store(&self, local: &Path, kind: BlobKind) -> CoreResult<StoredBlob> {
        let digest = digest_file(local).await?;
        let extension = local
            .extension()
            .and_then(|ext| ext.to_str())
            .filter(|ext| !ext.is_empty() && ext.chars().all(|c| c.is_ascii_alphanumeric()))
            .map(|ext| ext.to_ascii_lowercase());
        // Digest prefix plus a per-upload suffix: identical bytes never share a file.
        let stem = format!("{}-{}", &digest[..32], Uuid::new_v4().simple());
        let storage_id = match extension {
            Some(ext) => format!("{stem}.{ext}"),
            None => stem,
        };

        let dir = self.root.join(kind.as_str());
        fs::create_dir_all(&dir).await?;
        let target = dir.join(&storage_id);
        fs::copy(local, &target).await?;
        if let Err(err) = fs::remove_file(local).await {
            warn!(path = %local.display(), "failed to remove staged upload: {err}");
        }
        debug!(kind = kind.as_str(), %storage_id, "stored blob");

        Ok(StoredBlob {
            url: format!("{}/{}/{}", self.public_url, kind.as_str(), storage_id),
            storage_id,
            duration: None,
        })
    }

    async fn delete(&self, storage_id: &str, kind: BlobKind) -> CoreResult<()> {
        let path = self.resolve(kind, storage_id)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "blob already gone");
                Ok(())
            }
            Err(err) => Err(CoreError::upstream(format!(
                "deleting {}: {err}",
                path.display()
            ))),
        }
    }
}

fn validate_storage_id(storage_id: &str) -> CoreResult<()> {
    let valid = !storage_id.is_empty()
        && !storage_id.starts_with('.')
        && storage_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(CoreError::invalid(format!("invalid storage id `{storage_id}`")))
    }
}

async fn digest_file(path: &Path) -> CoreResult<String> {
    let mut file = fs::File::open(path).await.map_err(|err| {
        CoreError::invalid(format!("upload {} is not readable: {err}", path.display()))
    })?;
    let mut hasher = blake3::Hasher::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let read = file.read(&mut buf).await?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    Ok(hasher.finalize().to_hex().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn store_moves_upload_under_kind_directory() {
        let media = TempDir::new().unwrap();
        let staging = TempDir::new().unwrap();
        let upload = staging.path().join("Clip.MP4");
        std::fs::write(&upload, b"frames").unwrap();

        let blobs = LocalBlobStore::new(media.path(), "/media/");
        let stored = blobs.store(&upload, BlobKind::Video).await.unwrap();

        assert!(!upload.exists());
        assert!(stored.storage_id.ends_with(".mp4"));
        assert_eq!(stored.url, format!("/media/video/{}", stored.storage_id));
        let on_disk = blobs.resolve(BlobKind::Video, &stored.storage_id).unwrap();
        assert_eq!(std::fs::read(&on_disk).unwrap(), b"frames");

        blobs.delete(&stored.storage_id, BlobKind::Video).await.unwrap();
        assert!(!on_disk.exists());
        blobs.delete(&stored.storage_id, BlobKind::Video).await.unwrap();
    }

    #[tokio::test]
    async fn identical_uploads_get_distinct_names() {
        let media = TempDir::new().unwrap();
        let staging = TempDir::new().unwrap();
        let blobs = LocalBlobStore::new(media.path(), "/media");
        let mut ids = Vec::new();
        for name in ["a.png", "b.png"] {
            let path = staging.path().join(name);
            std::fs::write(&path, b"same").unwrap();
            ids.push(blobs.store(&path, BlobKind::Image).await.unwrap().storage_id);
        }
        assert_ne!(ids[0], ids[1]);
        assert_eq!(ids[0][..32], ids[1][..32]);
    }

    #[test]
    fn resolve_rejects_traversal() {
        let blobs = LocalBlobStore::new("/srv/media", "/media");
        assert!(blobs.resolve(BlobKind::Image, "../secret").is_err());
        assert!(blobs.resolve(BlobKind::Image, "a/b.png").is_err());
        assert!(blobs.resolve(BlobKind::Image, "").is_err());
        assert!(blobs.resolve(BlobKind::Image, "abc.png").is_ok());
    }

    #[tokio::test]
    async fn missing_upload_is_invalid() {
        let media = TempDir::new().unwrap();
        let blobs = LocalBlobStore::new(media.path(), "/media");
        let err = blobs
            .store(Path::new("/definitely/not/here.mp4"), BlobKind::Video)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidArgument(_)));
    }
}
