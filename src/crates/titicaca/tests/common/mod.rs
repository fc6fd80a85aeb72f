//! Common test utilities and setup

#![allow(dead_code)]

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::TempDir;
use titicaca::config::{BackendConfig, EngineMode, TiticacaConfig};
use titicaca::db::MemoryDatabase;
use titicaca::flows::{DataSource, FlowRegistry, FlowServices};
use titicaca::models::{Image, ImageStatus, Task, TaskType};
use titicaca::policy::RolePolicy;
use titicaca::qemu::{ImageInfo, ImageInspector};
use titicaca::repositories::{ImageRepository, TaskRepository};
use titicaca::store::{FilesystemStore, ImageData, Store, StoreRegistry, StoredImage};
use titicaca::{Engine, RequestContext, Result, TaskExecutor, TiticacaError};

pub const FAST: &str = "fast";
pub const SLOW: &str = "slow";

/// Config rooted in `root`: staging plus two filesystem backends
pub fn test_config(root: &Path, engine_mode: EngineMode) -> TiticacaConfig {
    let mut config = TiticacaConfig::default();
    config.staging.node_staging_uri = format!("file://{}", root.join("staging").display());
    for id in [FAST, SLOW] {
        config.stores.backends.insert(
            id.to_string(),
            BackendConfig {
                datadir: root.join(id),
            },
        );
    }
    config.stores.default_backend = Some(FAST.to_string());
    config.taskflow_executor.engine_mode = engine_mode;
    config.taskflow_executor.max_workers = 4;
    config.image_cache.image_cache_dir = root.join("cache");
    config.image_cache.lock_path = root.join("lock");
    config
}

/// Reports a fixed `ImageInfo` and copies files instead of converting
#[derive(Default)]
pub struct FakeInspector {
    pub info: Mutex<ImageInfo>,
    pub convert_calls: AtomicUsize,
    pub tool_missing: bool,
}

impl FakeInspector {
    pub fn reporting(format: &str, virtual_size: u64) -> Self {
        Self {
            info: Mutex::new(ImageInfo {
                format: Some(format.to_string()),
                virtual_size: Some(virtual_size),
                ..Default::default()
            }),
            convert_calls: AtomicUsize::new(0),
            tool_missing: false,
        }
    }

    /// Behaves as if qemu-img is not installed
    pub fn without_tool() -> Self {
        Self {
            tool_missing: true,
            ..Default::default()
        }
    }

    pub fn converts(&self) -> usize {
        self.convert_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ImageInspector for FakeInspector {
    async fn info(&self, _path: &Path) -> Result<ImageInfo> {
        if self.tool_missing {
            return Err(TiticacaError::ToolNotInstalled("qemu-img".to_string()));
        }
        Ok(self.info.lock().clone())
    }

    async fn convert(&self, src: &Path, _src_format: &str, dest: &Path, _dest_format: &str) -> Result<()> {
        self.convert_calls.fetch_add(1, Ordering::SeqCst);
        tokio::fs::copy(src, dest).await?;
        Ok(())
    }
}

/// Serves the same bytes for every URI, announcing `declared` as length
pub struct FixedSource {
    pub body: Vec<u8>,
    pub declared: Option<u64>,
}

impl FixedSource {
    pub fn new(body: Vec<u8>, declared: Option<u64>) -> Self {
        Self { body, declared }
    }
}

#[async_trait]
impl DataSource for FixedSource {
    async fn open(&self, _uri: &str) -> Result<(ImageData, Option<u64>)> {
        let chunks: Vec<Result<Vec<u8>>> = self.body.chunks(256).map(|c| Ok(c.to_vec())).collect();
        Ok((futures::stream::iter(chunks).boxed(), self.declared))
    }
}

/// Filesystem store that counts reads
pub struct CountingStore {
    inner: FilesystemStore,
    pub gets: AtomicUsize,
}

impl CountingStore {
    pub fn new(id: &str, datadir: impl Into<PathBuf>) -> Self {
        Self {
            inner: FilesystemStore::new(id, datadir),
            gets: AtomicUsize::new(0),
        }
    }

    pub fn get_count(&self) -> usize {
        self.gets.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Store for CountingStore {
    fn id(&self) -> &str {
        self.inner.id()
    }

    async fn add(&self, image_id: &str, data: ImageData, size_hint: u64) -> Result<StoredImage> {
        self.inner.add(image_id, data, size_hint).await
    }

    async fn get(&self, location: &str) -> Result<(ImageData, u64)> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        self.inner.get(location).await
    }

    async fn delete(&self, location: &str) -> Result<()> {
        self.inner.delete(location).await
    }
}

/// Store whose writes and reads always fail
pub struct FailingStore {
    id: String,
}

impl FailingStore {
    pub fn new(id: &str) -> Self {
        Self { id: id.to_string() }
    }
}

#[async_trait]
impl Store for FailingStore {
    fn id(&self) -> &str {
        &self.id
    }

    async fn add(&self, _image_id: &str, _data: ImageData, _size_hint: u64) -> Result<StoredImage> {
        Err(TiticacaError::Store(format!("{} is unavailable", self.id)))
    }

    async fn get(&self, _location: &str) -> Result<(ImageData, u64)> {
        Err(TiticacaError::Store(format!("{} is unavailable", self.id)))
    }

    async fn delete(&self, location: &str) -> Result<()> {
        Err(TiticacaError::NotFound(format!("no data at {}", location)))
    }
}

/// Everything a flow test needs, rooted in one temporary directory
pub struct TestEnv {
    pub temp_dir: TempDir,
    pub db: Arc<MemoryDatabase>,
    pub config: Arc<TiticacaConfig>,
    pub stores: StoreRegistry,
    pub inspector: Arc<FakeInspector>,
    pub source: Arc<FixedSource>,
}

impl TestEnv {
    pub fn new(engine_mode: EngineMode) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let config = test_config(temp_dir.path(), engine_mode);
        let stores = StoreRegistry::from_config(&config).expect("Failed to build stores");
        Self {
            temp_dir,
            db: Arc::new(MemoryDatabase::new()),
            config: Arc::new(config),
            stores,
            inspector: Arc::new(FakeInspector::reporting("raw", 1024)),
            source: Arc::new(FixedSource::new(vec![7u8; 1024], Some(1024))),
        }
    }

    pub fn with_config(mut self, f: impl FnOnce(&mut TiticacaConfig)) -> Self {
        let mut config = (*self.config).clone();
        f(&mut config);
        self.config = Arc::new(config);
        self
    }

    pub fn with_source(mut self, source: FixedSource) -> Self {
        self.source = Arc::new(source);
        self
    }

    pub fn with_inspector(mut self, inspector: FakeInspector) -> Self {
        self.inspector = Arc::new(inspector);
        self
    }

    pub fn with_store(mut self, store: Arc<dyn Store>) -> Self {
        self.stores.register(store);
        self
    }

    pub fn root(&self) -> &Path {
        self.temp_dir.path()
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.root().join("staging")
    }

    pub fn staging_path(&self, image_id: &str) -> PathBuf {
        self.staging_dir().join(image_id)
    }

    /// Put data in staging the way an upload would
    pub fn stage(&self, image_id: &str, body: &[u8]) {
        std::fs::create_dir_all(self.staging_dir()).expect("Failed to create staging dir");
        std::fs::write(self.staging_path(image_id), body).expect("Failed to stage data");
    }

    pub fn services(&self) -> FlowServices {
        FlowServices {
            images: self.db.clone(),
            stores: Arc::new(self.stores.clone()),
            inspector: self.inspector.clone(),
            source: self.source.clone(),
            policy: Arc::new(RolePolicy::new()),
            config: self.config.clone(),
        }
    }

    pub fn executor(&self) -> TaskExecutor {
        TaskExecutor::new(
            RequestContext::new("user", "project"),
            self.db.clone(),
            self.services(),
            Arc::new(FlowRegistry::default()),
            Engine::from_config(&self.config.taskflow_executor),
        )
    }

    pub async fn add_image(&self, image: Image) -> Image {
        ImageRepository::add(self.db.as_ref(), &image)
            .await
            .expect("Failed to add image")
    }

    pub async fn queued_image(&self) -> Image {
        self.add_image(Image::new("project").with_formats("raw", "bare"))
            .await
    }

    pub async fn image(&self, image_id: &str) -> Image {
        ImageRepository::get(self.db.as_ref(), image_id)
            .await
            .expect("Failed to get image")
    }

    pub async fn task(&self, task_id: &str) -> Task {
        TaskRepository::get(self.db.as_ref(), task_id)
            .await
            .expect("Failed to get task")
    }

    /// Store a pending `api_image_import` task for `image_id`
    pub async fn api_import_task(&self, image_id: &str, import_req: serde_json::Value) -> Task {
        let task = Task::new(
            TaskType::ApiImageImport,
            "project",
            serde_json::json!({ "image_id": image_id, "import_req": import_req }),
        )
        .with_image_id(image_id);
        TaskRepository::add(self.db.as_ref(), &task)
            .await
            .expect("Failed to add task");
        task
    }
}

/// An active image with data in `store`
pub async fn active_image_in(env: &TestEnv, store: &str, body: &[u8]) -> Image {
    let image = env.queued_image().await;
    let backend = env.stores.get(store).expect("Unknown store");
    let data: ImageData = futures::stream::iter(vec![Ok(body.to_vec())]).boxed();
    let stored = backend
        .add(&image.id, data, body.len() as u64)
        .await
        .expect("Failed to write image data");

    let mut image = image;
    image.status = ImageStatus::Active;
    image.size = Some(stored.bytes_written);
    image.checksum = Some(stored.checksum.clone());
    image.locations.push(titicaca::models::ImageLocation {
        url: stored.location,
        store: store.to_string(),
        metadata: BTreeMap::new(),
    });
    image.completed_stores.insert(store.to_string());
    ImageRepository::save(env.db.as_ref(), &image)
        .await
        .expect("Failed to save image")
}
