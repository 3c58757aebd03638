use crate::bridge::BackendError;
use crate::services::validation_service::ValidationError;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum JobError {
    #[error("Image job API is not available on this backend")]
    BackendUnavailable,
    #[error("Job submission failed: {0}")]
    JobSubmissionFailed(String),
    #[error("File {index} failed: {message}")]
    FileProcessingFailed { index: usize, message: String },
    #[error("Job was cancelled")]
    JobCancelled,
    #[error("{operation} timed out after {}s", .after.as_secs())]
    Timeout { operation: String, after: Duration },
    #[error("No files to process")]
    EmptyRequest,
    #[error("Invalid job request: {0}")]
    Validation(#[from] ValidationError),
    #[error("Task not found: {task_id}")]
    TaskNotFound { task_id: Uuid },
}

impl JobError {
    /// Submission errors are split on the structured backend tag: a missing
    /// entry point means "fall back", anything else failed the whole job.
    pub fn from_submission(err: BackendError) -> Self {
        if err.is_unsupported() {
            JobError::BackendUnavailable
        } else {
            JobError::JobSubmissionFailed(err.to_string())
        }
    }

    pub fn user_message(&self) -> String {
        match self {
            Self::BackendUnavailable => {
                "The processing backend is outdated; using the compatibility path.".to_string()
            }
            Self::JobSubmissionFailed(msg) => format!("Could not start processing: {}", msg),
            Self::FileProcessingFailed { message, .. } => message.clone(),
            Self::JobCancelled => "Processing was cancelled.".to_string(),
            Self::Timeout { operation, .. } => {
                format!("{} took too long and was stopped.", operation)
            }
            Self::EmptyRequest => "Select at least one pending file first.".to_string(),
            Self::Validation(e) => e.to_string(),
            Self::TaskNotFound { .. } => "The file is no longer in the list.".to_string(),
        }
    }
}
