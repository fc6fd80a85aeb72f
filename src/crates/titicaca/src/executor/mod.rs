//! Task Executor - runs a task's flow and records how it ended
//!
//! # Components
//!
//! - **Task Executor** - resolves the flow for a task and decides its terminal status
//! - **Engine** - serial or worker-pool execution with compensating reverts
//! - **Retry** - bounded backoff used by optimistic image updates

pub mod engine;
pub mod retry;
mod task_executor;

pub use engine::Engine;
pub use retry::{with_retry, RetryConfig};
pub use task_executor::TaskExecutor;
