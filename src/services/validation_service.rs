use crate::job::types::{CropRegion, JobRequest, PipelineStage, ProcessOptions};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("At least one input file is required")]
    MissingInputs,
    #[error("Invalid quality value: {quality} (expected 1-100)")]
    InvalidQuality { quality: u8 },
    #[error("Invalid {field}: must be greater than zero")]
    InvalidDimension { field: &'static str },
    #[error("Crop width and height must be greater than zero")]
    EmptyCropRegion,
    #[error("Pipeline must not be empty")]
    EmptyPipeline,
    #[error("Pipeline stage {stage} is out of order")]
    PipelineOrder { stage: &'static str },
    #[error("Pipeline must contain the save stage exactly once (found {count})")]
    SaveStageCount { count: usize },
}

#[derive(Debug, Clone, Default)]
pub struct ValidationService;

impl ValidationService {
    pub fn new() -> Self {
        Self
    }

    pub fn validate_request(&self, request: &JobRequest) -> Result<(), ValidationError> {
        if request.inputs.is_empty() {
            return Err(ValidationError::MissingInputs);
        }

        if let Some(options) = &request.options {
            self.validate_options(options)?;
        }

        if let Some(crop) = &request.crop_region {
            self.validate_crop(crop)?;
        }

        if let Some(stages) = &request.pipeline {
            self.validate_pipeline(stages)?;
        }

        if request.max_concurrency == Some(0) {
            return Err(ValidationError::InvalidDimension {
                field: "max concurrency",
            });
        }

        Ok(())
    }

    pub fn validate_options(&self, options: &ProcessOptions) -> Result<(), ValidationError> {
        if let Some(quality) = options.quality {
            if !(1..=100).contains(&quality) {
                return Err(ValidationError::InvalidQuality { quality });
            }
        }
        if options.width == Some(0) {
            return Err(ValidationError::InvalidDimension { field: "width" });
        }
        if options.height == Some(0) {
            return Err(ValidationError::InvalidDimension { field: "height" });
        }
        Ok(())
    }

    pub fn validate_crop(&self, crop: &CropRegion) -> Result<(), ValidationError> {
        if crop.width == 0 || crop.height == 0 {
            return Err(ValidationError::EmptyCropRegion);
        }
        Ok(())
    }

    /// Stages must follow crop, resize, convert, compress, save and end in a
    /// single save.
    pub fn validate_pipeline(&self, stages: &[PipelineStage]) -> Result<(), ValidationError> {
        if stages.is_empty() {
            return Err(ValidationError::EmptyPipeline);
        }

        for pair in stages.windows(2) {
            if pair[1].order() < pair[0].order() {
                return Err(ValidationError::PipelineOrder {
                    stage: pair[1].as_str(),
                });
            }
        }

        let count = stages
            .iter()
            .filter(|s| **s == PipelineStage::Save)
            .count();
        if count != 1 {
            return Err(ValidationError::SaveStageCount { count });
        }

        Ok(())
    }

    /// The stage list the backend runs when the request carries none.
    pub fn resolve_pipeline(&self, request: &JobRequest) -> Vec<PipelineStage> {
        if let Some(stages) = &request.pipeline {
            return stages.clone();
        }

        let mut stages = Vec::new();
        if request.crop_region.is_some() {
            stages.push(PipelineStage::Crop);
        }
        if let Some(options) = &request.options {
            if options.width.is_some() || options.height.is_some() {
                stages.push(PipelineStage::Resize);
            }
            if options.converts_format() {
                stages.push(PipelineStage::Convert);
            }
        }
        stages.push(PipelineStage::Compress);
        stages.push(PipelineStage::Save);
        stages
    }
}
