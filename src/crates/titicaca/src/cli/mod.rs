//! CLI command implementations
//!
//! [`App`] wires configuration, the database, the gateway and the stores
//! together; the `task` and `cache` modules hold the command handlers.

pub mod cache;
pub mod task;

use crate::config::{LoggingConfig, TiticacaConfig};
use crate::context::RequestContext;
use crate::db::Database;
use crate::error::Result;
use crate::executor::{Engine, TaskExecutor};
use crate::flows::{FlowRegistry, FlowServices, HttpSource};
use crate::gateway::Gateway;
use crate::image_cache::ImageCache;
use crate::models::TaskFactory;
use crate::qemu::QemuImg;
use crate::repositories::{SqlImageRepository, SqlTaskRepository};
use crate::store::StoreRegistry;
use std::sync::Arc;
use tracing::debug;
use tracing_subscriber::EnvFilter;

/// Install the global tracing subscriber. `RUST_LOG` wins over the
/// configured level.
pub fn init_logging(config: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.as_str()));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    let installed = if config.format == "json" {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    if installed.is_err() {
        debug!("Tracing subscriber already installed");
    }
}

/// Everything a command needs, built once per invocation
pub struct App {
    pub config: Arc<TiticacaConfig>,
    pub db: Arc<Database>,
    pub gateway: Gateway,
    pub stores: Arc<StoreRegistry>,
}

impl App {
    pub async fn new(config: TiticacaConfig) -> Result<Self> {
        let db = Arc::new(Database::new(config.database_path()).await?);
        db.run_migrations().await?;

        let gateway = Gateway::builder()
            .images(Arc::new(SqlImageRepository::new(db.clone())))
            .tasks(Arc::new(SqlTaskRepository::new(db.clone())))
            .quota(config.quota.clone())
            .build()?;
        let stores = Arc::new(StoreRegistry::from_config(&config)?);

        Ok(Self {
            config: Arc::new(config),
            db,
            gateway,
            stores,
        })
    }

    pub fn task_factory(&self) -> TaskFactory {
        TaskFactory::new(
            self.config.task.task_time_to_live,
            self.config.staging.staging_dir(),
        )
    }

    /// Executor acting for `ctx`; flows write images without policy checks
    pub fn executor(&self, ctx: RequestContext) -> TaskExecutor {
        let services = FlowServices {
            images: self.gateway.image_repo(&ctx, false),
            stores: self.stores.clone(),
            inspector: Arc::new(QemuImg::new(self.config.qemu_img.clone())),
            source: Arc::new(HttpSource::new()),
            policy: self.gateway.policy(),
            config: self.config.clone(),
        };
        TaskExecutor::new(
            ctx.clone(),
            self.gateway.task_repo(&ctx, true),
            services,
            Arc::new(FlowRegistry::default()),
            Engine::from_config(&self.config.taskflow_executor),
        )
    }

    pub async fn image_cache(&self) -> Result<Arc<ImageCache>> {
        Ok(Arc::new(
            ImageCache::from_config(&self.config.image_cache).await?,
        ))
    }
}
