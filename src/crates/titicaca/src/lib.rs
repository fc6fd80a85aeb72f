//! # Titicaca - Image Import Pipeline
//!
//! The asynchronous side of an image service: long running tasks that pull
//! image data from a source, stage it locally, run it through a chain of
//! plugins and write it to one or more backend stores, plus the maintenance
//! jobs of a local image cache.
//!
//! ## Features
//!
//! - **Tasks** - Persistent task records with a validated state machine
//! - **Import Flows** - `titicaca-direct`, `web-download` and `copy-image`
//!   imports, as well as the legacy `import` task
//! - **Optimistic Concurrency** - [`ImportActionWrapper`] replays queued
//!   image mutations on top of the latest image version
//! - **Rollback** - Every flow step can revert itself; failed flows unwind in
//!   reverse order
//! - **Serial and Parallel Engines** - Run flows inline or on a bounded
//!   worker pool
//! - **Image Cache** - Prefetch queued images, clean stalled entries, prune
//!   down to the size limit
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use titicaca::cli::App;
//! use titicaca::RequestContext;
//!
//! # async fn example() -> titicaca::Result<()> {
//! let config = titicaca::load_config(None).await?;
//! let app = App::new(config).await?;
//!
//! let task = app.executor(RequestContext::admin()).begin_processing("task-id").await?;
//! println!("{}: {}", task.id, task.status);
//! # Ok(())
//! # }
//! ```

// Core modules
pub mod cli;
pub mod config;
pub mod context;
pub mod db;
pub mod error;
pub mod executor;
pub mod flows;
pub mod gateway;
pub mod image_cache;
pub mod models;
pub mod notifier;
pub mod policy;
pub mod qemu;
pub mod repositories;
pub mod store;

// Re-export main types
pub use config::{load_config, TiticacaConfig};
pub use context::RequestContext;
pub use db::Database;
pub use error::{ErrorKind, Result, TiticacaError};
pub use executor::{Engine, TaskExecutor};
pub use flows::{FlowRegistry, ImportActionWrapper};
pub use gateway::Gateway;
pub use models::{Image, ImageStatus, Task, TaskStatus, TaskType};
