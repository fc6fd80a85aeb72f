//! Disk image inspection and conversion through `qemu-img`
//!
//! Staged files come from untrusted sources, so every invocation runs with
//! CPU-time and address-space limits set in the child before exec.

use crate::config::QemuImgConfig;
use crate::error::{Result, TiticacaError};
use async_trait::async_trait;
use serde::Deserialize;
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

/// What the inspection tool reports about a file
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImageInfo {
    pub format: Option<String>,
    pub virtual_size: Option<u64>,
    pub backing_filename: Option<String>,
    /// VMDK sub-type
    pub create_type: Option<String>,
}

#[derive(Deserialize)]
struct RawInfo {
    format: Option<String>,
    #[serde(rename = "virtual-size")]
    virtual_size: Option<u64>,
    #[serde(rename = "backing-filename")]
    backing_filename: Option<String>,
    #[serde(rename = "format-specific")]
    format_specific: Option<RawFormatSpecific>,
}

#[derive(Deserialize)]
struct RawFormatSpecific {
    data: Option<RawFormatData>,
}

#[derive(Deserialize)]
struct RawFormatData {
    #[serde(rename = "create-type")]
    create_type: Option<String>,
}

impl ImageInfo {
    /// Parse `qemu-img info --output=json`
    pub fn from_json(raw: &str) -> Result<Self> {
        let info: RawInfo = serde_json::from_str(raw)
            .map_err(|e| TiticacaError::ToolFailed(format!("unreadable image info: {}", e)))?;
        Ok(Self {
            format: info.format,
            virtual_size: info.virtual_size,
            backing_filename: info.backing_filename,
            create_type: info
                .format_specific
                .and_then(|f| f.data)
                .and_then(|d| d.create_type),
        })
    }
}

#[async_trait]
pub trait ImageInspector: Send + Sync {
    async fn info(&self, path: &Path) -> Result<ImageInfo>;

    async fn convert(&self, src: &Path, src_format: &str, dest: &Path, dest_format: &str)
        -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct QemuImg {
    config: QemuImgConfig,
}

impl QemuImg {
    pub fn new(config: QemuImgConfig) -> Self {
        Self { config }
    }

    async fn run(&self, args: &[&str]) -> Result<String> {
        let cpu_secs = self.config.cpu_time_limit_secs as libc::rlim_t;
        let address_space = self.config.address_space_limit_bytes as libc::rlim_t;

        let mut cmd = Command::new(&self.config.binary);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        // SAFETY: only async-signal-safe calls between fork and exec
        unsafe {
            cmd.pre_exec(move || {
                let cpu = libc::rlimit {
                    rlim_cur: cpu_secs,
                    rlim_max: cpu_secs,
                };
                if libc::setrlimit(libc::RLIMIT_CPU, &cpu) != 0 {
                    return Err(std::io::Error::last_os_error());
                }
                let memory = libc::rlimit {
                    rlim_cur: address_space,
                    rlim_max: address_space,
                };
                if libc::setrlimit(libc::RLIMIT_AS, &memory) != 0 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }

        debug!(binary = %self.config.binary, ?args, "Running image tool");

        let output = match cmd.output().await {
            Ok(output) => output,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(TiticacaError::ToolNotInstalled(self.config.binary.clone()))
            }
            Err(e) => return Err(e.into()),
        };

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if !stderr.is_empty() {
            return Err(TiticacaError::ToolFailed(stderr));
        }
        if !output.status.success() {
            return Err(TiticacaError::ToolFailed(format!(
                "{} exited with {}",
                self.config.binary, output.status
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl ImageInspector for QemuImg {
    async fn info(&self, path: &Path) -> Result<ImageInfo> {
        let path = path.to_string_lossy();
        let stdout = self.run(&["info", "--output=json", &path]).await?;
        ImageInfo::from_json(&stdout)
    }

    async fn convert(
        &self,
        src: &Path,
        src_format: &str,
        dest: &Path,
        dest_format: &str,
    ) -> Result<()> {
        let src = src.to_string_lossy();
        let dest = dest.to_string_lossy();
        self.run(&["convert", "-f", src_format, "-O", dest_format, &src, &dest])
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_vmdk_info() {
        let raw = r#"{
            "virtual-size": 10737418240,
            "filename": "disk.vmdk",
            "format": "vmdk",
            "format-specific": {"type": "vmdk", "data": {"create-type": "streamOptimized"}}
        }"#;
        let info = ImageInfo::from_json(raw).unwrap();
        assert_eq!(info.format.as_deref(), Some("vmdk"));
        assert_eq!(info.virtual_size, Some(10737418240));
        assert_eq!(info.create_type.as_deref(), Some("streamOptimized"));
        assert!(info.backing_filename.is_none());
    }

    #[test]
    fn test_parse_qcow_backing_file() {
        let raw = r#"{"format": "qcow2", "virtual-size": 1024, "backing-filename": "/etc/passwd"}"#;
        let info = ImageInfo::from_json(raw).unwrap();
        assert_eq!(info.backing_filename.as_deref(), Some("/etc/passwd"));
    }

    #[test]
    fn test_garbage_output_is_tool_failure() {
        assert!(matches!(
            ImageInfo::from_json("not json"),
            Err(TiticacaError::ToolFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_binary() {
        let tool = QemuImg::new(QemuImgConfig {
            binary: "/nonexistent/qemu-img".to_string(),
            ..Default::default()
        });
        let err = tool.info(Path::new("/tmp/whatever")).await.unwrap_err();
        assert!(matches!(err, TiticacaError::ToolNotInstalled(_)));
    }
}
