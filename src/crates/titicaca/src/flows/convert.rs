//! Convert staged image data to the configured target format

use super::{FlowContext, FlowStep, ImportActionWrapper, StepOutcome};
use crate::config::{ImageConversionConfig, ImageFormatConfig};
use crate::error::{Result, TiticacaError};
use crate::qemu::{ImageInfo, ImageInspector};
use async_trait::async_trait;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct ConvertImage {
    name: String,
    wrapper: Arc<ImportActionWrapper>,
    inspector: Arc<dyn ImageInspector>,
    target_format: String,
    vmdk_allowed_types: Vec<String>,
}

impl ConvertImage {
    pub fn new(
        name: String,
        wrapper: Arc<ImportActionWrapper>,
        inspector: Arc<dyn ImageInspector>,
        conversion: &ImageConversionConfig,
        formats: &ImageFormatConfig,
    ) -> Self {
        Self {
            name,
            wrapper,
            inspector,
            target_format: conversion.output_format.clone(),
            vmdk_allowed_types: formats.vmdk_allowed_types.clone(),
        }
    }

    fn dest_path(&self, src: &Path) -> PathBuf {
        let mut dest = src.as_os_str().to_owned();
        dest.push(".");
        dest.push(&self.target_format);
        PathBuf::from(dest)
    }

    /// Refuse shapes that could read outside the staged file
    fn check_safe(&self, info: &ImageInfo) -> Result<String> {
        let format = info
            .format
            .clone()
            .ok_or_else(|| TiticacaError::ImportTask("Source format not reported".to_string()))?;

        if info.backing_filename.is_some() {
            warn!(step = %self.name, "Refusing to process QCOW image with a backing file");
            return Err(TiticacaError::UnsafeImage(
                "QCOW images with backing files are not allowed".to_string(),
            ));
        }

        if format == "vmdk" {
            match &info.create_type {
                None => {
                    return Err(TiticacaError::UnsafeImage(
                        "Image is a VMDK, but no VMDK createType is specified".to_string(),
                    ))
                }
                Some(create_type) if !self.vmdk_allowed_types.contains(create_type) => {
                    warn!(create_type = %create_type, "Refusing to process VMDK file");
                    return Err(TiticacaError::UnsafeImage(
                        "Invalid VMDK create-type specified".to_string(),
                    ));
                }
                Some(_) => {}
            }
        }

        Ok(format)
    }
}

#[async_trait]
impl FlowStep for ConvertImage {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, ctx: &FlowContext) -> Result<Option<Value>> {
        let src = ctx.staged_path()?;
        let info = self.inspector.info(&src).await?;
        let source_format = self.check_safe(&info)?;
        let virtual_size = info.virtual_size.unwrap_or(0);

        self.wrapper
            .apply(|action| action.set_virtual_size(virtual_size))
            .await?;

        if source_format == self.target_format {
            debug!(
                image_id = %self.wrapper.image_id(),
                format = %source_format,
                "Source is already in target format, not doing conversion"
            );
            return Ok(None);
        }

        let dest = self.dest_path(&src);
        self.inspector
            .convert(&src, &source_format, &dest, &self.target_format)
            .await?;
        tokio::fs::rename(&dest, &src).await?;
        let size = tokio::fs::metadata(&src).await?.len();

        let target = self.target_format.clone();
        self.wrapper
            .apply(move |action| {
                action.set_disk_format(target)?;
                action.set_container_format("bare")?;
                action.set_size(size)
            })
            .await?;

        info!(
            image_id = %self.wrapper.image_id(),
            from = %source_format,
            to = %self.target_format,
            size,
            "Converted staged image"
        );
        Ok(None)
    }

    async fn revert(&self, ctx: &FlowContext, _outcome: &StepOutcome) -> Result<()> {
        let Ok(src) = ctx.staged_path() else {
            return Ok(());
        };
        let dest = self.dest_path(&src);
        if tokio::fs::try_exists(&dest).await.unwrap_or(false) {
            tokio::fs::remove_file(&dest).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryDatabase;
    use crate::executor::retry::RetryConfig;

    struct NoInspector;

    #[async_trait]
    impl ImageInspector for NoInspector {
        async fn info(&self, _path: &Path) -> Result<ImageInfo> {
            Err(TiticacaError::ToolNotInstalled("qemu-img".to_string()))
        }

        async fn convert(&self, _src: &Path, _sf: &str, _dest: &Path, _df: &str) -> Result<()> {
            Err(TiticacaError::ToolNotInstalled("qemu-img".to_string()))
        }
    }

    fn step() -> ConvertImage {
        let wrapper = Arc::new(ImportActionWrapper::new(
            Arc::new(MemoryDatabase::new()),
            "image-1".to_string(),
            "task-1",
            RetryConfig::default(),
        ));
        ConvertImage::new(
            "convert".to_string(),
            wrapper,
            Arc::new(NoInspector),
            &ImageConversionConfig::default(),
            &ImageFormatConfig::default(),
        )
    }

    fn vmdk(create_type: Option<&str>) -> ImageInfo {
        ImageInfo {
            format: Some("vmdk".to_string()),
            virtual_size: Some(1024),
            create_type: create_type.map(str::to_string),
            ..Default::default()
        }
    }

    #[test]
    fn test_vmdk_allowed_types_pass() {
        let step = step();
        assert_eq!(step.check_safe(&vmdk(Some("streamOptimized"))).unwrap(), "vmdk");
        assert_eq!(step.check_safe(&vmdk(Some("monolithicSparse"))).unwrap(), "vmdk");
    }

    #[test]
    fn test_vmdk_unlisted_type_rejected() {
        let err = step().check_safe(&vmdk(Some("monolithicFlat"))).unwrap_err();
        assert!(matches!(err, TiticacaError::UnsafeImage(_)));
    }

    #[test]
    fn test_vmdk_without_type_rejected() {
        let err = step().check_safe(&vmdk(None)).unwrap_err();
        assert!(matches!(err, TiticacaError::UnsafeImage(_)));
    }

    #[test]
    fn test_backing_file_rejected() {
        let info = ImageInfo {
            format: Some("qcow2".to_string()),
            backing_filename: Some("/etc/passwd".to_string()),
            ..Default::default()
        };
        let err = step().check_safe(&info).unwrap_err();
        assert!(matches!(err, TiticacaError::UnsafeImage(_)));
    }

    #[test]
    fn test_unreported_format_rejected() {
        let err = step().check_safe(&ImageInfo::default()).unwrap_err();
        assert!(matches!(err, TiticacaError::ImportTask(_)));
    }

    #[test]
    fn test_dest_path_appends_target_format() {
        assert_eq!(
            step().dest_path(Path::new("/tmp/staging/image-1")),
            PathBuf::from("/tmp/staging/image-1.raw")
        );
    }
}
