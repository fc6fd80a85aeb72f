//! Pull the embedded metadata out of a staged image file

use super::{FlowContext, FlowStep, ImportActionWrapper};
use crate::error::{Result, TiticacaError};
use crate::qemu::ImageInspector;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Optional step: a missing inspection tool is logged, not fatal
pub struct Introspect {
    name: String,
    wrapper: Arc<ImportActionWrapper>,
    inspector: Arc<dyn ImageInspector>,
}

impl Introspect {
    pub fn new(
        name: String,
        wrapper: Arc<ImportActionWrapper>,
        inspector: Arc<dyn ImageInspector>,
    ) -> Self {
        Self {
            name,
            wrapper,
            inspector,
        }
    }
}

#[async_trait]
impl FlowStep for Introspect {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, ctx: &FlowContext) -> Result<Option<Value>> {
        let path = ctx.staged_path()?;

        let info = match self.inspector.info(&path).await {
            Ok(info) => info,
            Err(TiticacaError::ToolNotInstalled(tool)) => {
                warn!(step = %self.name, tool = %tool, "Skipping introspection, tool not installed");
                return Ok(None);
            }
            Err(e) => {
                error!(task_id = %self.wrapper.task_id(), error = %e, "Failed to execute introspection");
                return Err(e);
            }
        };

        self.wrapper
            .apply(|action| {
                action.set_virtual_size(info.virtual_size.unwrap_or(0))?;
                if let Some(format) = &info.format {
                    action.set_disk_format(format.clone())?;
                }
                Ok(())
            })
            .await?;

        debug!(
            task_id = %self.wrapper.task_id(),
            file = %path.display(),
            "Introspection successful"
        );
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryDatabase;
    use crate::executor::retry::RetryConfig;
    use crate::flows::STAGED_PATH;
    use crate::models::{Image, IMPORT_LOCK_PROPERTY};
    use crate::qemu::ImageInfo;
    use crate::repositories::ImageRepository;
    use serde_json::json;
    use std::path::Path;

    struct ScriptedInspector {
        info: fn() -> Result<ImageInfo>,
    }

    #[async_trait]
    impl ImageInspector for ScriptedInspector {
        async fn info(&self, _path: &Path) -> Result<ImageInfo> {
            (self.info)()
        }

        async fn convert(&self, _src: &Path, _sf: &str, _dest: &Path, _df: &str) -> Result<()> {
            unreachable!("introspection never converts")
        }
    }

    async fn setup(info: fn() -> Result<ImageInfo>) -> (Introspect, Arc<MemoryDatabase>, String, FlowContext) {
        let db = Arc::new(MemoryDatabase::new());
        let mut image = Image::new("owner");
        image
            .extra_properties
            .insert(IMPORT_LOCK_PROPERTY.to_string(), "task-1".to_string());
        let image = ImageRepository::add(db.as_ref(), &image).await.unwrap();

        let wrapper = Arc::new(ImportActionWrapper::new(
            db.clone(),
            image.id.clone(),
            "task-1",
            RetryConfig::default(),
        ));
        let step = Introspect::new(
            "introspect".to_string(),
            wrapper,
            Arc::new(ScriptedInspector { info }),
        );
        let ctx = FlowContext::new();
        ctx.provide(STAGED_PATH, json!("/tmp/staging/image"));
        (step, db, image.id, ctx)
    }

    #[tokio::test]
    async fn test_records_virtual_size_and_format() {
        let (step, db, image_id, ctx) = setup(|| {
            Ok(ImageInfo {
                format: Some("qcow2".to_string()),
                virtual_size: Some(4096),
                ..Default::default()
            })
        })
        .await;

        assert!(step.execute(&ctx).await.unwrap().is_none());

        let image = ImageRepository::get(db.as_ref(), &image_id).await.unwrap();
        assert_eq!(image.virtual_size, Some(4096));
        assert_eq!(image.disk_format.as_deref(), Some("qcow2"));
    }

    #[tokio::test]
    async fn test_missing_tool_is_skipped() {
        let (step, db, image_id, ctx) =
            setup(|| Err(TiticacaError::ToolNotInstalled("qemu-img".to_string()))).await;

        assert!(step.execute(&ctx).await.unwrap().is_none());

        let image = ImageRepository::get(db.as_ref(), &image_id).await.unwrap();
        assert_eq!(image.virtual_size, None);
    }

    #[tokio::test]
    async fn test_tool_error_fails_the_step() {
        let (step, _, _, ctx) =
            setup(|| Err(TiticacaError::ToolFailed("garbage output".to_string()))).await;

        let err = step.execute(&ctx).await.unwrap_err();
        assert!(matches!(err, TiticacaError::ToolFailed(_)));
    }
}
