use crate::classify;
use crate::constants::{DEFAULT_RENDER_HEIGHT, DEFAULT_RENDER_QUALITY, DEFAULT_RENDER_WIDTH};
use crate::job::error::JobError;
use crate::job::types::{CompressMode, CropRegion, JobRequest, PipelineStage, ProcessOptions};
use crate::services::file_service::{compressed_output_path, crop_path, preview_path};
use crate::services::ValidationService;
use crate::state::CompressionTask;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RenderFormat {
    Auto,
    Jpeg,
    Png,
    Webp,
}

impl RenderFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            RenderFormat::Auto => "auto",
            RenderFormat::Jpeg => "jpeg",
            RenderFormat::Png => "png",
            RenderFormat::Webp => "webp",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            RenderFormat::Jpeg => "jpg",
            other => other.as_str(),
        }
    }
}

impl fmt::Display for RenderFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RenderFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "auto" => Ok(RenderFormat::Auto),
            "jpeg" | "jpg" => Ok(RenderFormat::Jpeg),
            "png" => Ok(RenderFormat::Png),
            "webp" => Ok(RenderFormat::Webp),
            other => Err(format!("Unknown output format: {}", other)),
        }
    }
}

/// Parameters of a single-image render from the detail view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderSettings {
    pub quality: u8,
    pub format: RenderFormat,
    pub width: u32,
    pub height: u32,
}

impl Default for RenderSettings {
    fn default() -> Self {
        Self {
            quality: DEFAULT_RENDER_QUALITY,
            format: RenderFormat::Auto,
            width: DEFAULT_RENDER_WIDTH,
            height: DEFAULT_RENDER_HEIGHT,
        }
    }
}

impl RenderSettings {
    pub fn new(quality: u8, format: RenderFormat, width: u32, height: u32) -> Self {
        Self {
            quality: quality.clamp(1, 100),
            format,
            width: width.max(1),
            height: height.max(1),
        }
    }

    /// Concrete format for `source`: an explicit choice wins, `auto` keeps
    /// jpeg/webp/png sources and turns everything else into png.
    pub fn resolve_format(&self, source: &Path) -> RenderFormat {
        if self.format != RenderFormat::Auto {
            return self.format;
        }
        match classify::extension_of(source).as_str() {
            "jpg" | "jpeg" => RenderFormat::Jpeg,
            "webp" => RenderFormat::Webp,
            _ => RenderFormat::Png,
        }
    }

    pub fn to_options(&self, source: &Path) -> ProcessOptions {
        ProcessOptions {
            quality: Some(self.quality),
            format: Some(self.resolve_format(source).as_str().to_string()),
            width: Some(self.width),
            height: Some(self.height),
        }
    }
}

/// A request plus what the client needs to project results back: the task
/// behind each input index and the output the legacy path should write.
#[derive(Debug, Clone, PartialEq)]
pub struct JobPlan {
    pub request: JobRequest,
    pub task_ids: Vec<Uuid>,
    pub legacy_outputs: Vec<PathBuf>,
}

impl JobPlan {
    pub fn len(&self) -> usize {
        self.task_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.task_ids.is_empty()
    }
}

#[derive(Debug, Clone, Default)]
pub struct JobRequestBuilder {
    mode: CompressMode,
    output_dir: Option<PathBuf>,
    crop_region: Option<CropRegion>,
    options: Option<ProcessOptions>,
    pipeline: Option<Vec<PipelineStage>>,
    max_concurrency: Option<usize>,
    validator: ValidationService,
}

impl JobRequestBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mode(mut self, mode: CompressMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn output_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.output_dir = dir;
        self
    }

    pub fn crop_region(mut self, crop: Option<CropRegion>) -> Self {
        self.crop_region = crop;
        self
    }

    pub fn options(mut self, options: ProcessOptions) -> Self {
        self.options = if options.is_empty() {
            None
        } else {
            Some(options)
        };
        self
    }

    pub fn pipeline(mut self, stages: Vec<PipelineStage>) -> Self {
        self.pipeline = Some(stages);
        self
    }

    pub fn max_concurrency(mut self, limit: Option<usize>) -> Self {
        self.max_concurrency = limit;
        self
    }

    /// One input per task, in the order given. A task that was cropped in the
    /// detail view contributes its intermediate file.
    pub fn build_batch(&self, tasks: &[CompressionTask]) -> Result<JobPlan, JobError> {
        if tasks.is_empty() {
            return Err(JobError::EmptyRequest);
        }

        let request = JobRequest {
            inputs: tasks.iter().map(|t| t.working_path().clone()).collect(),
            output_dir: self.output_dir.clone(),
            mode: Some(self.mode),
            crop_region: self.crop_region,
            options: self.options.clone(),
            pipeline: self.pipeline.clone(),
            max_concurrency: self.max_concurrency,
        };
        self.validator.validate_request(&request)?;

        Ok(JobPlan {
            request,
            task_ids: tasks.iter().map(|t| t.id).collect(),
            legacy_outputs: tasks
                .iter()
                .map(|t| compressed_output_path(&t.path, self.output_dir.as_deref()))
                .collect(),
        })
    }

    /// Full compress of one image into a preview file under `temp_dir`, with
    /// the derived stage list attached.
    pub fn render(
        &self,
        task: &CompressionTask,
        settings: &RenderSettings,
        crop: Option<CropRegion>,
        temp_dir: &Path,
    ) -> Result<JobPlan, JobError> {
        let source = task.working_path();
        let format = settings.resolve_format(source);
        let mut request = JobRequest {
            inputs: vec![source.clone()],
            output_dir: Some(temp_dir.to_path_buf()),
            mode: Some(self.mode),
            crop_region: crop,
            options: Some(settings.to_options(source)),
            pipeline: None,
            max_concurrency: None,
        };
        request.pipeline = Some(self.validator.resolve_pipeline(&request));
        self.validator.validate_request(&request)?;

        Ok(JobPlan {
            request,
            task_ids: vec![task.id],
            legacy_outputs: vec![preview_path(temp_dir, task.id, format.extension())],
        })
    }

    /// Pure crop-then-save of the original source into an intermediate file.
    pub fn crop(
        &self,
        task: &CompressionTask,
        crop: CropRegion,
        temp_dir: &Path,
    ) -> Result<JobPlan, JobError> {
        let request = JobRequest {
            inputs: vec![task.path.clone()],
            output_dir: Some(temp_dir.to_path_buf()),
            mode: Some(self.mode),
            crop_region: Some(crop),
            options: None,
            pipeline: Some(vec![PipelineStage::Crop, PipelineStage::Save]),
            max_concurrency: None,
        };
        self.validator.validate_request(&request)?;

        Ok(JobPlan {
            request,
            task_ids: vec![task.id],
            legacy_outputs: vec![crop_path(temp_dir, task.id, &task.path)],
        })
    }
}
