//! Byte storage backends
//!
//! A store persists image data under a store identifier. One identifier,
//! [`STAGING_STORE_ID`], is reserved for the staging area that holds data
//! while an import is in flight.

pub mod filesystem;

pub use filesystem::FilesystemStore;

use crate::config::TiticacaConfig;
use crate::error::{Result, TiticacaError};
use crate::models::ImageLocation;
use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncReadExt;

/// Reserved identifier of the staging store
pub const STAGING_STORE_ID: &str = "os_titicaca_staging_store";

const CHUNK_SIZE: usize = 64 * 1024;

/// A stream of image data chunks
pub type ImageData = BoxStream<'static, Result<Vec<u8>>>;

/// What a store reports after persisting data
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredImage {
    pub location: String,
    pub bytes_written: u64,
    /// Hex sha256 of the bytes written
    pub checksum: String,
    pub metadata: BTreeMap<String, String>,
}

#[async_trait]
pub trait Store: Send + Sync {
    fn id(&self) -> &str;

    /// Persist `data` for `image_id`. `size_hint` may be 0 when unknown.
    async fn add(&self, image_id: &str, data: ImageData, size_hint: u64) -> Result<StoredImage>;

    /// Open the data behind a location, with its size
    async fn get(&self, location: &str) -> Result<(ImageData, u64)>;

    /// Fails with `NotFound` when nothing is stored at `location`
    async fn delete(&self, location: &str) -> Result<()>;
}

/// Local path behind a `file://` URI
pub fn file_uri_path(uri: &str) -> Result<PathBuf> {
    uri.strip_prefix("file://")
        .filter(|p| !p.is_empty())
        .map(PathBuf::from)
        .ok_or_else(|| TiticacaError::Store(format!("not a file location: {}", uri)))
}

pub fn path_to_file_uri(path: &Path) -> String {
    format!("file://{}", path.display())
}

/// Stream a local file in fixed-size chunks
pub fn file_stream(file: tokio::fs::File) -> ImageData {
    futures::stream::unfold(Some(file), |state| async move {
        let mut file = state?;
        let mut buf = vec![0u8; CHUNK_SIZE];
        match file.read(&mut buf).await {
            Ok(0) => None,
            Ok(n) => {
                buf.truncate(n);
                Some((Ok(buf), Some(file)))
            }
            Err(e) => Some((Err(TiticacaError::Io(e)), None)),
        }
    })
    .boxed()
}

/// Open a local file as image data
pub async fn open_file(path: &Path) -> Result<(ImageData, u64)> {
    let file = match tokio::fs::File::open(path).await {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(TiticacaError::NotFound(format!(
                "no data at {}",
                path.display()
            )))
        }
        Err(e) => return Err(e.into()),
    };
    let size = file.metadata().await?.len();
    Ok((file_stream(file), size))
}

/// Stores known to this process, by identifier
#[derive(Clone, Default)]
pub struct StoreRegistry {
    stores: HashMap<String, Arc<dyn Store>>,
    default_store: Option<String>,
}

impl StoreRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Filesystem stores for every configured backend plus the staging area
    pub fn from_config(config: &TiticacaConfig) -> Result<Self> {
        let mut registry = Self::new();
        if let Some(dir) = config.staging.staging_dir() {
            registry.register(Arc::new(FilesystemStore::new(STAGING_STORE_ID, dir)));
        }
        for (id, backend) in &config.stores.backends {
            if id == STAGING_STORE_ID {
                return Err(TiticacaError::Config(format!(
                    "{} is reserved for the staging area",
                    STAGING_STORE_ID
                )));
            }
            registry.register(Arc::new(FilesystemStore::new(id, backend.datadir.clone())));
        }
        if let Some(default) = &config.stores.default_backend {
            registry.set_default(default)?;
        }
        Ok(registry)
    }

    pub fn register(&mut self, store: Arc<dyn Store>) {
        self.stores.insert(store.id().to_string(), store);
    }

    pub fn set_default(&mut self, store_id: &str) -> Result<()> {
        if !self.stores.contains_key(store_id) {
            return Err(TiticacaError::Config(format!(
                "default store {} is not configured",
                store_id
            )));
        }
        self.default_store = Some(store_id.to_string());
        Ok(())
    }

    pub fn get(&self, store_id: &str) -> Result<Arc<dyn Store>> {
        self.stores
            .get(store_id)
            .cloned()
            .ok_or_else(|| TiticacaError::Store(format!("unknown store {}", store_id)))
    }

    /// The staging store; its absence is a configuration problem
    pub fn staging(&self) -> Result<Arc<dyn Store>> {
        self.stores.get(STAGING_STORE_ID).cloned().ok_or_else(|| {
            TiticacaError::BadTaskConfiguration("no staging store is configured".to_string())
        })
    }

    pub fn default_store(&self) -> Option<&str> {
        self.default_store.as_deref()
    }

    pub fn for_location(&self, location: &ImageLocation) -> Result<Arc<dyn Store>> {
        self.get(&location.store)
    }

    /// Configured backend identifiers, staging excluded
    pub fn store_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .stores
            .keys()
            .filter(|id| id.as_str() != STAGING_STORE_ID)
            .cloned()
            .collect();
        ids.sort();
        ids
    }
}
