use std::path::{Component, Path, PathBuf};

use tokio::fs;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::ServerError;

/// Image formats accepted for upload, detected from magic bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageKind {
    Png,
    Jpeg,
    Gif,
    Webp,
}

impl ImageKind {
    pub fn sniff(data: &[u8]) -> Option<Self> {
        if data.starts_with(&[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A]) {
            Some(Self::Png)
        } else if data.starts_with(&[0xFF, 0xD8, 0xFF]) {
            Some(Self::Jpeg)
        } else if data.starts_with(b"GIF87a") || data.starts_with(b"GIF89a") {
            Some(Self::Gif)
        } else if data.len() >= 12 && &data[..4] == b"RIFF" && &data[8..12] == b"WEBP" {
            Some(Self::Webp)
        } else {
            None
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            Self::Png => "image/png",
            Self::Jpeg => "image/jpeg",
            Self::Gif => "image/gif",
            Self::Webp => "image/webp",
        }
    }
}

/// Resolve `target` under `base`, refusing anything that climbs out of it.
fn ensure_within(base: &Path, target: &Path) -> Result<PathBuf, ServerError> {
    let canonical_base = base.canonicalize().unwrap_or_else(|_| base.to_path_buf());
    let mut resolved = canonical_base.clone();
    for component in target
        .strip_prefix(base)
        .unwrap_or(target)
        .components()
    {
        match component {
            Component::Normal(c) => resolved.push(c),
            Component::ParentDir => {
                return Err(ServerError::BadRequest("Path traversal detected".into()));
            }
            _ => {}
        }
    }
    if !resolved.starts_with(&canonical_base) {
        return Err(ServerError::BadRequest("Path traversal detected".into()));
    }
    Ok(resolved)
}

/// Flat directory of uploaded chat images, one file per upload named by its
/// UUID.
#[derive(Debug, Clone)]
pub struct BlobStore {
    base_path: PathBuf,
    max_size: usize,
}

impl BlobStore {
    pub async fn new(base_path: PathBuf, max_size: usize) -> Result<Self, ServerError> {
        fs::create_dir_all(&base_path).await.map_err(|e| {
            ServerError::BlobStorage(format!(
                "Failed to create upload directory '{}': {}",
                base_path.display(),
                e
            ))
        })?;

        info!(path = %base_path.display(), max_size, "Upload store initialized");

        Ok(Self {
            base_path,
            max_size,
        })
    }

    pub async fn store_image(&self, data: &[u8]) -> Result<(Uuid, ImageKind), ServerError> {
        if data.is_empty() {
            return Err(ServerError::BadRequest("Empty upload".into()));
        }
        if data.len() > self.max_size {
            return Err(ServerError::PayloadTooLarge {
                size: data.len(),
                max: self.max_size,
            });
        }
        let kind = ImageKind::sniff(data)
            .ok_or_else(|| ServerError::BadRequest("Unsupported image format".into()))?;

        let id = Uuid::new_v4();
        let path = self.image_path(&id)?;
        fs::write(&path, data)
            .await
            .map_err(|e| ServerError::BlobStorage(format!("Failed to write upload {id}: {e}")))?;

        debug!(id = %id, size = data.len(), kind = kind.content_type(), "Stored image");
        Ok((id, kind))
    }

    pub async fn get_image(&self, id: Uuid) -> Result<(Vec<u8>, ImageKind), ServerError> {
        let path = self.image_path(&id)?;
        let data = match fs::read(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ServerError::NotFound(format!("upload {id}")));
            }
            Err(e) => {
                return Err(ServerError::BlobStorage(format!(
                    "Failed to read upload {id}: {e}"
                )));
            }
        };
        let kind = ImageKind::sniff(&data)
            .ok_or_else(|| ServerError::BlobStorage(format!("Upload {id} is not an image")))?;
        Ok((data, kind))
    }

    /// Public URL under which an upload is served.
    pub fn url_for(base_url: &str, id: &Uuid) -> String {
        format!("{}/uploads/{}", base_url.trim_end_matches('/'), id)
    }

    fn image_path(&self, id: &Uuid) -> Result<PathBuf, ServerError> {
        ensure_within(&self.base_path, &self.base_path.join(id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    const PNG: &[u8] = &[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0, 0, 0, 13];

    async fn test_store(max: usize) -> (BlobStore, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = BlobStore::new(dir.path().to_path_buf(), max).await.unwrap();
        (store, dir)
    }

    #[tokio::test]
    async fn test_store_and_get() {
        let (store, _dir) = test_store(1024).await;
        let (id, kind) = store.store_image(PNG).await.unwrap();
        assert_eq!(kind, ImageKind::Png);

        let (data, kind) = store.get_image(id).await.unwrap();
        assert_eq!(data, PNG);
        assert_eq!(kind.content_type(), "image/png");
    }

    #[tokio::test]
    async fn test_rejects_non_images() {
        let (store, _dir) = test_store(1024).await;
        assert!(matches!(
            store.store_image(b"#!/bin/sh\necho hi").await,
            Err(ServerError::BadRequest(_))
        ));
        assert!(matches!(
            store.store_image(b"").await,
            Err(ServerError::BadRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_rejects_oversized() {
        let (store, _dir) = test_store(8).await;
        assert!(matches!(
            store.store_image(PNG).await,
            Err(ServerError::PayloadTooLarge { size: 12, max: 8 })
        ));
    }

    #[tokio::test]
    async fn test_missing_is_not_found() {
        let (store, _dir) = test_store(1024).await;
        assert!(matches!(
            store.get_image(Uuid::new_v4()).await,
            Err(ServerError::NotFound(_))
        ));
    }

    #[test]
    fn test_sniff() {
        assert_eq!(ImageKind::sniff(&[0xFF, 0xD8, 0xFF, 0xE0]), Some(ImageKind::Jpeg));
        assert_eq!(ImageKind::sniff(b"GIF89a...."), Some(ImageKind::Gif));
        assert_eq!(ImageKind::sniff(b"RIFF\0\0\0\0WEBPVP8 "), Some(ImageKind::Webp));
        assert_eq!(ImageKind::sniff(b"RIFF"), None);
    }

    #[test]
    fn test_traversal_rejected() {
        let base = Path::new("/srv/uploads");
        assert!(ensure_within(base, &base.join("../etc/passwd")).is_err());
    }

    #[test]
    fn test_url_for() {
        let id = Uuid::nil();
        assert_eq!(
            BlobStore::url_for("http://localhost:5000/", &id),
            format!("http://localhost:5000/uploads/{id}")
        );
    }
}
