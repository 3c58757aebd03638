//! Boundary to the native backend process.
//!
//! [`Backend`] is the RPC surface the client consumes. [`IpcBridge`] speaks it
//! over a sidecar's stdio; tests use the scripted backend in `mock`.

use crate::job::types::{CompressMode, CropRegion, JobProgressEvent, JobRequest, JobState, ProcessOptions};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};

pub mod ipc;
#[cfg(test)]
pub(crate) mod mock;

pub use ipc::IpcBridge;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum BackendError {
    #[error("Backend does not support {method}")]
    Unsupported { method: String },
    #[error("{message}")]
    Remote {
        method: String,
        code: Option<String>,
        message: String,
    },
    #[error("Backend did not answer {method} in time")]
    Timeout { method: String },
    #[error("Backend connection lost")]
    Disconnected,
    #[error("Backend transport error: {0}")]
    Transport(String),
    #[error("Malformed backend message: {0}")]
    Decode(String),
}

impl BackendError {
    /// An invocation-level rejection of the entry point itself, as opposed to
    /// a failure of the work it was asked to do.
    pub fn is_unsupported(&self) -> bool {
        matches!(self, BackendError::Unsupported { .. })
    }
}

impl From<serde_json::Error> for BackendError {
    fn from(e: serde_json::Error) -> Self {
        BackendError::Decode(e.to_string())
    }
}

impl From<std::io::Error> for BackendError {
    fn from(e: std::io::Error) -> Self {
        BackendError::Transport(e.to_string())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FileInfo {
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default)]
    pub size_bytes: u64,
    #[serde(default)]
    pub format: Option<String>,
    #[serde(default)]
    pub width: Option<u32>,
    #[serde(default)]
    pub height: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FfmpegCheck {
    pub available: bool,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub version: String,
}

/// Arguments of the legacy single-shot `compress_image` command.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompressImageParams {
    pub path: PathBuf,
    pub output_path: PathBuf,
    pub mode: CompressMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub crop_region: Option<CropRegion>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub options: Option<ProcessOptions>,
}

/// Per-call progress channel handed to `compress_image`.
pub type ProgressSender = mpsc::UnboundedSender<f32>;

#[async_trait::async_trait]
pub trait Backend: Send + Sync {
    async fn get_file_info(&self, path: &Path) -> Result<FileInfo, BackendError>;

    async fn list_image_files_in_directory(&self, dir: &Path) -> Result<Vec<PathBuf>, BackendError>;

    async fn crop_image(
        &self,
        path: &Path,
        output_path: &Path,
        crop_region: CropRegion,
    ) -> Result<(), BackendError>;

    async fn compress_image(
        &self,
        params: CompressImageParams,
        progress: ProgressSender,
    ) -> Result<(), BackendError>;

    async fn compress_video(
        &self,
        path: &Path,
        output_path: &Path,
        mode: CompressMode,
    ) -> Result<(), BackendError>;

    async fn create_image_job(&self, request: &JobRequest) -> Result<String, BackendError>;

    async fn get_image_job(&self, job_id: &str) -> Result<JobState, BackendError>;

    async fn cancel_image_job(&self, job_id: &str) -> Result<(), BackendError>;

    async fn copy_file(&self, from: &Path, to: &Path) -> Result<(), BackendError>;

    async fn open_folder(&self, path: &Path) -> Result<(), BackendError>;

    async fn check_ffmpeg(&self) -> Result<FfmpegCheck, BackendError>;

    /// Listener on the global `image-job-progress` channel. Events for every
    /// job arrive here; callers filter by job id.
    fn subscribe_job_progress(&self) -> broadcast::Receiver<JobProgressEvent>;
}
