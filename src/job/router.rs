//! Demultiplexes the global progress channel into signals for one job.

use crate::job::types::{JobProgressEvent, JobStatus, PipelineStage};
use crate::state::clamp_percent;
use std::path::PathBuf;
use tokio::sync::broadcast::{self, error::RecvError};

#[derive(Debug, Clone, PartialEq)]
pub enum JobSignal {
    FileProgress {
        index: usize,
        percent: f32,
        stage: Option<PipelineStage>,
    },
    FileCompleted {
        index: usize,
        output_path: Option<PathBuf>,
    },
    FileFailed {
        index: usize,
        error: String,
    },
    FileCancelled {
        index: usize,
        error: Option<String>,
    },
    JobTerminal {
        status: JobStatus,
        error: Option<String>,
    },
}

/// Listener scoped to a single job id.
///
/// The receiver is opened before the job is submitted, so events that arrive
/// while `create_image_job` is still in flight queue up in the channel and
/// are routed once the id is known via [`JobSubscription::bind`]. Dropping
/// the subscription unsubscribes.
pub struct JobSubscription {
    rx: broadcast::Receiver<JobProgressEvent>,
    job_id: Option<String>,
    expected: usize,
    last_progress: Vec<Option<f32>>,
    settled: Vec<bool>,
    finished: bool,
}

impl JobSubscription {
    pub fn new(rx: broadcast::Receiver<JobProgressEvent>, expected: usize) -> Self {
        Self {
            rx,
            job_id: None,
            expected,
            last_progress: vec![None; expected],
            settled: vec![false; expected],
            finished: false,
        }
    }

    pub fn bind(&mut self, job_id: impl Into<String>) {
        self.job_id = Some(job_id.into());
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Next signal for the bound job, or `None` once the job-terminal event
    /// was routed or the channel closed.
    pub async fn next(&mut self) -> Option<JobSignal> {
        loop {
            if self.finished {
                return None;
            }
            match self.rx.recv().await {
                Ok(event) => {
                    if let Some(signal) = self.route(event) {
                        return Some(signal);
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(
                        "Progress listener for job {:?} lagged, {} events skipped",
                        self.job_id,
                        skipped
                    );
                }
                Err(RecvError::Closed) => {
                    tracing::warn!("Progress channel closed for job {:?}", self.job_id);
                    return None;
                }
            }
        }
    }

    pub fn route(&mut self, event: JobProgressEvent) -> Option<JobSignal> {
        if self.finished {
            return None;
        }
        match self.job_id.as_deref() {
            Some(id) if id == event.job_id => {}
            _ => return None,
        }

        if event.is_job_level() {
            if !event.is_job_terminal() {
                return None;
            }
            self.finished = true;
            return Some(JobSignal::JobTerminal {
                status: event.status,
                error: event.error,
            });
        }

        let index = event.file_index;
        if index >= event.total_files || index >= self.expected {
            tracing::warn!(
                "Dropping progress event for job {} with file index {} of {}",
                event.job_id,
                index,
                event.total_files
            );
            return None;
        }
        if self.settled[index] {
            return None;
        }

        match event.status {
            JobStatus::Pending => None,
            JobStatus::Running => {
                let percent = clamp_percent(event.stage_progress);
                if let Some(previous) = self.last_progress[index] {
                    if percent <= previous {
                        return None;
                    }
                }
                self.last_progress[index] = Some(percent);
                Some(JobSignal::FileProgress {
                    index,
                    percent,
                    stage: event.stage,
                })
            }
            JobStatus::Completed => {
                self.settled[index] = true;
                Some(JobSignal::FileCompleted {
                    index,
                    output_path: event.output_path,
                })
            }
            JobStatus::Failed => {
                self.settled[index] = true;
                Some(JobSignal::FileFailed {
                    index,
                    error: event
                        .error
                        .or(event.message)
                        .unwrap_or_else(|| "Processing failed".to_string()),
                })
            }
            JobStatus::Cancelled => {
                self.settled[index] = true;
                Some(JobSignal::FileCancelled {
                    index,
                    error: event.error,
                })
            }
        }
    }
}
