//! Import flows
//!
//! A [`Flow`] is a linear list of [`FlowStep`]s sharing one [`FlowContext`].
//! Steps run strictly in order. When one fails, the engine reverts it and
//! then every step that already completed, newest first.

pub mod action_wrapper;
pub mod api_import;
pub mod convert;
pub mod copy_image;
pub mod inject_metadata;
pub mod introspect;
pub mod legacy_import;
pub mod no_op;
pub mod plugins;
pub mod registry;
pub mod web_download;

pub use action_wrapper::{ImportAction, ImportActionWrapper};
pub use registry::{FlowFactory, FlowRegistry, FlowRequest};
pub use web_download::{DataSource, HttpSource};

use crate::config::TiticacaConfig;
use crate::error::{Result, TiticacaError};
use crate::policy::Policy;
use crate::qemu::ImageInspector;
use crate::repositories::ImageRepository;
use crate::store::StoreRegistry;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

/// Context key holding the local path of the staged image data
pub const STAGED_PATH: &str = "staged_path";

/// How a step ended, as seen by its revert
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    /// The step finished; a later one failed
    Completed(Option<Value>),
    /// The step itself failed with this message
    Failed(String),
}

impl StepOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, StepOutcome::Failed(_))
    }
}

#[async_trait]
pub trait FlowStep: Send + Sync {
    fn name(&self) -> &str;

    async fn execute(&self, ctx: &FlowContext) -> Result<Option<Value>>;

    async fn revert(&self, _ctx: &FlowContext, _outcome: &StepOutcome) -> Result<()> {
        Ok(())
    }
}

/// Values steps hand to later steps
#[derive(Debug, Default)]
pub struct FlowContext {
    values: Mutex<HashMap<String, Value>>,
}

impl FlowContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn provide(&self, key: impl Into<String>, value: Value) {
        self.values.lock().insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.values.lock().get(key).cloned()
    }

    pub fn require_str(&self, key: &str) -> Result<String> {
        match self.get(key) {
            Some(Value::String(s)) => Ok(s),
            _ => Err(TiticacaError::Other(format!(
                "flow value {} was never provided",
                key
            ))),
        }
    }

    pub fn staged_path(&self) -> Result<PathBuf> {
        self.require_str(STAGED_PATH).map(PathBuf::from)
    }
}

/// An ordered chain of steps for one task
pub struct Flow {
    name: String,
    steps: Vec<Arc<dyn FlowStep>>,
    context: Arc<FlowContext>,
}

impl std::fmt::Debug for Flow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Flow")
            .field("name", &self.name)
            .field("steps", &self.step_names())
            .finish()
    }
}

impl Flow {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            steps: Vec::new(),
            context: Arc::new(FlowContext::new()),
        }
    }

    pub fn add(mut self, step: Arc<dyn FlowStep>) -> Self {
        self.steps.push(step);
        self
    }

    pub fn add_all(mut self, steps: impl IntoIterator<Item = Arc<dyn FlowStep>>) -> Self {
        self.steps.extend(steps);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn steps(&self) -> &[Arc<dyn FlowStep>] {
        &self.steps
    }

    pub fn context(&self) -> &Arc<FlowContext> {
        &self.context
    }

    pub fn step_names(&self) -> Vec<String> {
        self.steps.iter().map(|s| s.name().to_string()).collect()
    }
}

/// Collaborators every flow step may need
#[derive(Clone)]
pub struct FlowServices {
    pub images: Arc<dyn ImageRepository>,
    pub stores: Arc<StoreRegistry>,
    pub inspector: Arc<dyn ImageInspector>,
    pub source: Arc<dyn DataSource>,
    pub policy: Arc<dyn Policy>,
    pub config: Arc<TiticacaConfig>,
}

impl FlowServices {
    /// Where the staging store keeps data for `image_id`
    pub fn staging_path(&self, image_id: &str) -> Result<PathBuf> {
        self.config
            .staging
            .staging_dir()
            .map(|dir| dir.join(image_id))
            .ok_or_else(|| {
                TiticacaError::BadTaskConfiguration(
                    "node_staging_uri must be a file:// URI".to_string(),
                )
            })
    }
}

/// Step name in the `<task type>-<Step>-<task id>` form used in logs
pub(crate) fn step_name(task_type: &str, step: &str, task_id: &str) -> String {
    format!("{}-{}-{}", task_type, step, task_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Named(&'static str);

    #[async_trait]
    impl FlowStep for Named {
        fn name(&self) -> &str {
            self.0
        }

        async fn execute(&self, _ctx: &FlowContext) -> Result<Option<Value>> {
            Ok(None)
        }
    }

    #[test]
    fn test_context_values() {
        let ctx = FlowContext::new();
        assert!(ctx.staged_path().is_err());
        ctx.provide(STAGED_PATH, json!("/tmp/staging/abc"));
        assert_eq!(ctx.staged_path().unwrap(), PathBuf::from("/tmp/staging/abc"));
    }

    #[test]
    fn test_flow_keeps_order() {
        let flow = Flow::new("test")
            .add(Arc::new(Named("first")))
            .add_all(vec![
                Arc::new(Named("second")) as Arc<dyn FlowStep>,
                Arc::new(Named("third")),
            ]);
        assert_eq!(flow.step_names(), vec!["first", "second", "third"]);
    }

    #[test]
    fn test_step_name() {
        assert_eq!(
            step_name("api_image_import", "Introspect", "t1"),
            "api_image_import-Introspect-t1"
        );
    }
}
