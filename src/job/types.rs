use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CompressMode {
    Lossless,
    VisuallyLossless,
}

impl Default for CompressMode {
    fn default() -> Self {
        CompressMode::VisuallyLossless
    }
}

impl CompressMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            CompressMode::Lossless => "lossless",
            CompressMode::VisuallyLossless => "visuallyLossless",
        }
    }
}

impl fmt::Display for CompressMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CompressMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "lossless" => Ok(CompressMode::Lossless),
            "visuallylossless" | "visually-lossless" | "visually_lossless" => {
                Ok(CompressMode::VisuallyLossless)
            }
            other => Err(format!("Unknown compression mode: {}", other)),
        }
    }
}

/// Pixel rectangle in source image coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CropRegion {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// Codec options forwarded to the backend as-is.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
}

impl ProcessOptions {
    pub fn is_empty(&self) -> bool {
        self.quality.is_none() && self.format.is_none() && self.width.is_none() && self.height.is_none()
    }

    /// True when the options ask for a format other than the source one.
    pub fn converts_format(&self) -> bool {
        self.format
            .as_deref()
            .map(|f| {
                let f = f.trim().to_lowercase();
                !f.is_empty() && f != "auto"
            })
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PipelineStage {
    Crop,
    Resize,
    Convert,
    Compress,
    Save,
}

impl PipelineStage {
    /// Position of the stage in a well-formed pipeline.
    pub fn order(self) -> u8 {
        match self {
            Self::Crop => 0,
            Self::Resize => 1,
            Self::Convert => 2,
            Self::Compress => 3,
            Self::Save => 4,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Crop => "crop",
            Self::Resize => "resize",
            Self::Convert => "convert",
            Self::Compress => "compress",
            Self::Save => "save",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

/// Immutable description of one submission. The position of a path in
/// `inputs` is the `fileIndex` used by progress events and snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRequest {
    pub inputs: Vec<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_dir: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<CompressMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crop_region: Option<CropRegion>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<ProcessOptions>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pipeline: Option<Vec<PipelineStage>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrency: Option<usize>,
}

impl JobRequest {
    pub fn len(&self) -> usize {
        self.inputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inputs.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobFileState {
    pub input_path: PathBuf,
    #[serde(default)]
    pub output_path: Option<PathBuf>,
    pub status: JobStatus,
    #[serde(default)]
    pub progress: f32,
    #[serde(default)]
    pub error: Option<String>,
}

/// Authoritative backend-held snapshot of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobState {
    pub job_id: String,
    pub status: JobStatus,
    pub created_at_ms: u64,
    #[serde(default)]
    pub started_at_ms: Option<u64>,
    #[serde(default)]
    pub completed_at_ms: Option<u64>,
    pub total_files: usize,
    #[serde(default)]
    pub completed_files: usize,
    #[serde(default)]
    pub failed_files: usize,
    #[serde(default)]
    pub cancelled_files: usize,
    #[serde(default)]
    pub overall_progress: f32,
    #[serde(default)]
    pub files: Vec<JobFileState>,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn file(&self, index: usize) -> Option<&JobFileState> {
        self.files.get(index)
    }
}

/// One push notification on the progress channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobProgressEvent {
    pub job_id: String,
    pub file_index: usize,
    pub total_files: usize,
    #[serde(default)]
    pub input_path: Option<PathBuf>,
    #[serde(default)]
    pub output_path: Option<PathBuf>,
    #[serde(default)]
    pub stage: Option<PipelineStage>,
    #[serde(default)]
    pub stage_progress: f32,
    #[serde(default)]
    pub overall_progress: f32,
    pub status: JobStatus,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

impl JobProgressEvent {
    /// Events without an input path describe the whole job.
    pub fn is_job_level(&self) -> bool {
        self.input_path.is_none()
    }

    pub fn is_job_terminal(&self) -> bool {
        self.is_job_level() && self.status.is_terminal()
    }
}
