//! Store that keeps one file per image under a data directory

use super::{file_uri_path, open_file, path_to_file_uri, ImageData, Store, StoredImage};
use crate::error::{Result, TiticacaError};
use async_trait::async_trait;
use futures::StreamExt;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct FilesystemStore {
    id: String,
    datadir: PathBuf,
}

impl FilesystemStore {
    pub fn new(id: impl Into<String>, datadir: impl Into<PathBuf>) -> Self {
        Self {
            id: id.into(),
            datadir: datadir.into(),
        }
    }

    pub fn datadir(&self) -> &Path {
        &self.datadir
    }

    pub fn path_for(&self, image_id: &str) -> PathBuf {
        self.datadir.join(image_id)
    }

    async fn create(&self, path: &Path) -> Result<fs::File> {
        fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::AlreadyExists => TiticacaError::Store(format!(
                    "{} already holds {}",
                    self.id,
                    path.display()
                )),
                _ => TiticacaError::Io(e),
            })
    }
}

async fn write_all(file: &mut fs::File, mut data: ImageData) -> Result<(u64, String)> {
    let mut hasher = Sha256::new();
    let mut written = 0u64;
    while let Some(chunk) = data.next().await {
        let chunk = chunk?;
        hasher.update(&chunk);
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;
    }
    file.flush().await?;

    Ok((written, format!("{:x}", hasher.finalize())))
}

#[async_trait]
impl Store for FilesystemStore {
    fn id(&self) -> &str {
        &self.id
    }

    async fn add(&self, image_id: &str, data: ImageData, size_hint: u64) -> Result<StoredImage> {
        fs::create_dir_all(&self.datadir).await?;
        let path = self.path_for(image_id);
        debug!(store = %self.id, image_id = %image_id, size_hint, "Writing image data");

        let mut file = self.create(&path).await?;

        match write_all(&mut file, data).await {
            Ok((bytes_written, checksum)) => {
                let mut metadata = BTreeMap::new();
                metadata.insert("store".to_string(), self.id.clone());
                Ok(StoredImage {
                    location: path_to_file_uri(&path),
                    bytes_written,
                    checksum,
                    metadata,
                })
            }
            Err(e) => {
                drop(file);
                if let Err(cleanup) = fs::remove_file(&path).await {
                    warn!(path = %path.display(), error = %cleanup, "Failed to remove partial write");
                }
                Err(e)
            }
        }
    }

    async fn get(&self, location: &str) -> Result<(ImageData, u64)> {
        open_file(&file_uri_path(location)?).await
    }

    async fn delete(&self, location: &str) -> Result<()> {
        let path = file_uri_path(location)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(TiticacaError::NotFound(
                format!("no data at {}", path.display()),
            )),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;
    use tempfile::TempDir;

    fn chunks(parts: Vec<Vec<u8>>) -> ImageData {
        stream::iter(parts.into_iter().map(Ok)).boxed()
    }

    #[tokio::test]
    async fn test_add_get_delete() {
        let temp_dir = TempDir::new().unwrap();
        let store = FilesystemStore::new("fast", temp_dir.path().join("fast"));

        let stored = store
            .add("img", chunks(vec![b"hello ".to_vec(), b"world".to_vec()]), 0)
            .await
            .unwrap();
        assert_eq!(stored.bytes_written, 11);
        assert_eq!(
            stored.checksum,
            format!("{:x}", Sha256::digest(b"hello world"))
        );
        assert!(stored.location.ends_with("/fast/img"));

        let (mut data, size) = store.get(&stored.location).await.unwrap();
        assert_eq!(size, 11);
        let mut read = Vec::new();
        while let Some(chunk) = data.next().await {
            read.extend(chunk.unwrap());
        }
        assert_eq!(read, b"hello world");

        store.delete(&stored.location).await.unwrap();
        assert!(matches!(
            store.delete(&stored.location).await,
            Err(TiticacaError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_duplicate_add_keeps_original() {
        let temp_dir = TempDir::new().unwrap();
        let store = FilesystemStore::new("fast", temp_dir.path());

        store.add("img", chunks(vec![b"one".to_vec()]), 3).await.unwrap();
        let err = store
            .add("img", chunks(vec![b"two!".to_vec()]), 4)
            .await
            .unwrap_err();
        assert!(matches!(err, TiticacaError::Store(_)));
        assert_eq!(std::fs::read(store.path_for("img")).unwrap(), b"one");
    }

    #[tokio::test]
    async fn test_failed_stream_leaves_nothing() {
        let temp_dir = TempDir::new().unwrap();
        let store = FilesystemStore::new("fast", temp_dir.path());

        let data = stream::iter(vec![
            Ok(b"partial".to_vec()),
            Err(TiticacaError::Store("connection reset".to_string())),
        ])
        .boxed();
        assert!(store.add("img", data, 0).await.is_err());
        assert!(!store.path_for("img").exists());
    }

    #[tokio::test]
    async fn test_get_missing() {
        let temp_dir = TempDir::new().unwrap();
        let store = FilesystemStore::new("fast", temp_dir.path());
        let location = path_to_file_uri(&store.path_for("nothing"));
        assert!(matches!(
            store.get(&location).await,
            Err(TiticacaError::NotFound(_))
        ));
    }
}
