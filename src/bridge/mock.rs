//! Scripted in-memory backend for tests.

use super::{Backend, BackendError, CompressImageParams, FfmpegCheck, FileInfo, ProgressSender};
use crate::job::types::{
    CompressMode, CropRegion, JobFileState, JobProgressEvent, JobRequest, JobState, JobStatus,
};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::broadcast;

pub(crate) const JOB_ID: &str = "img-job-1";

#[derive(Default)]
pub(crate) struct MockState {
    pub calls: Vec<String>,
    pub create_result: Option<Result<String, BackendError>>,
    /// Emitted while `create_image_job` runs, before it returns.
    pub job_script: Vec<JobProgressEvent>,
    /// Emitted when `cancel_image_job` is called.
    pub cancel_script: Vec<JobProgressEvent>,
    pub snapshot: Option<Result<JobState, BackendError>>,
    /// Replaces `snapshot` once the job is cancelled.
    pub cancelled_snapshot: Option<JobState>,
    pub requests: Vec<JobRequest>,
    pub legacy_calls: Vec<CompressImageParams>,
    pub legacy_progress: Vec<f32>,
    pub legacy_failures: HashMap<PathBuf, String>,
    pub crop_calls: Vec<(PathBuf, PathBuf, CropRegion)>,
    pub crop_error: Option<BackendError>,
    pub crop_delay: Option<Duration>,
    /// Holds `create_image_job` before it answers.
    pub create_delay: Option<Duration>,
    pub video_calls: Vec<(PathBuf, PathBuf, CompressMode)>,
    pub video_failures: HashMap<PathBuf, String>,
    pub file_sizes: HashMap<PathBuf, u64>,
    pub file_info_fails: bool,
    pub listing: Option<Result<Vec<PathBuf>, BackendError>>,
    pub copies: Vec<(PathBuf, PathBuf)>,
    pub copy_error: Option<BackendError>,
    pub opened: Vec<PathBuf>,
    pub ffmpeg: Option<FfmpegCheck>,
}

pub(crate) struct MockBackend {
    state: Mutex<MockState>,
    events: broadcast::Sender<JobProgressEvent>,
}

impl MockBackend {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            state: Mutex::new(MockState::default()),
            events,
        }
    }

    pub fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    pub fn calls_named(&self, name: &str) -> usize {
        self.state().calls.iter().filter(|c| c.as_str() == name).count()
    }

    pub fn emit(&self, event: JobProgressEvent) {
        let _ = self.events.send(event);
    }

    fn record(&self, name: &str) {
        self.state().calls.push(name.to_string());
    }
}

pub(crate) fn file_event(
    index: usize,
    total: usize,
    input: &str,
    status: JobStatus,
    progress: f32,
) -> JobProgressEvent {
    JobProgressEvent {
        job_id: JOB_ID.to_string(),
        file_index: index,
        total_files: total,
        input_path: Some(PathBuf::from(input)),
        output_path: None,
        stage: None,
        stage_progress: progress,
        overall_progress: 0.0,
        status,
        message: None,
        error: None,
    }
}

pub(crate) fn completed_event(index: usize, total: usize, input: &str, output: &str) -> JobProgressEvent {
    JobProgressEvent {
        output_path: Some(PathBuf::from(output)),
        ..file_event(index, total, input, JobStatus::Completed, 100.0)
    }
}

pub(crate) fn failed_event(index: usize, total: usize, input: &str, error: &str) -> JobProgressEvent {
    JobProgressEvent {
        error: Some(error.to_string()),
        ..file_event(index, total, input, JobStatus::Failed, 0.0)
    }
}

pub(crate) fn job_event(total: usize, status: JobStatus) -> JobProgressEvent {
    JobProgressEvent {
        job_id: JOB_ID.to_string(),
        file_index: 0,
        total_files: total,
        input_path: None,
        output_path: None,
        stage: None,
        stage_progress: 100.0,
        overall_progress: 100.0,
        status,
        message: None,
        error: None,
    }
}

pub(crate) fn file_state(input: &str, status: JobStatus, output: Option<&str>, error: Option<&str>) -> JobFileState {
    JobFileState {
        input_path: PathBuf::from(input),
        output_path: output.map(PathBuf::from),
        status,
        progress: if status == JobStatus::Completed { 100.0 } else { 0.0 },
        error: error.map(str::to_string),
    }
}

pub(crate) fn job_state(status: JobStatus, files: Vec<JobFileState>) -> JobState {
    let count = |s: JobStatus| files.iter().filter(|f| f.status == s).count();
    JobState {
        job_id: JOB_ID.to_string(),
        status,
        created_at_ms: 1,
        started_at_ms: Some(2),
        completed_at_ms: Some(3),
        total_files: files.len(),
        completed_files: count(JobStatus::Completed),
        failed_files: count(JobStatus::Failed),
        cancelled_files: count(JobStatus::Cancelled),
        overall_progress: 100.0,
        files,
    }
}

#[async_trait::async_trait]
impl Backend for MockBackend {
    async fn get_file_info(&self, path: &Path) -> Result<FileInfo, BackendError> {
        self.record("get_file_info");
        let state = self.state();
        if state.file_info_fails {
            return Err(BackendError::Remote {
                method: "get_file_info".to_string(),
                code: None,
                message: "probe failed".to_string(),
            });
        }
        Ok(FileInfo {
            path: Some(path.to_path_buf()),
            size_bytes: state.file_sizes.get(path).copied().unwrap_or(1024),
            format: None,
            width: Some(640),
            height: Some(480),
        })
    }

    async fn list_image_files_in_directory(&self, _dir: &Path) -> Result<Vec<PathBuf>, BackendError> {
        self.record("list_image_files_in_directory");
        self.state().listing.clone().unwrap_or_else(|| Ok(Vec::new()))
    }

    async fn crop_image(
        &self,
        path: &Path,
        output_path: &Path,
        crop_region: CropRegion,
    ) -> Result<(), BackendError> {
        self.record("crop_image");
        let (delay, error) = {
            let mut state = self.state();
            state
                .crop_calls
                .push((path.to_path_buf(), output_path.to_path_buf(), crop_region));
            (state.crop_delay, state.crop_error.clone())
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        match error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn compress_image(
        &self,
        params: CompressImageParams,
        progress: ProgressSender,
    ) -> Result<(), BackendError> {
        self.record("compress_image");
        let (steps, failure) = {
            let mut state = self.state();
            state.legacy_calls.push(params.clone());
            (
                state.legacy_progress.clone(),
                state.legacy_failures.get(&params.path).cloned(),
            )
        };
        for step in steps {
            let _ = progress.send(step);
            tokio::task::yield_now().await;
        }
        match failure {
            Some(message) => Err(BackendError::Remote {
                method: "compress_image".to_string(),
                code: None,
                message,
            }),
            None => Ok(()),
        }
    }

    async fn compress_video(
        &self,
        path: &Path,
        output_path: &Path,
        mode: CompressMode,
    ) -> Result<(), BackendError> {
        self.record("compress_video");
        let mut state = self.state();
        state
            .video_calls
            .push((path.to_path_buf(), output_path.to_path_buf(), mode));
        match state.video_failures.get(path) {
            Some(message) => Err(BackendError::Remote {
                method: "compress_video".to_string(),
                code: None,
                message: message.clone(),
            }),
            None => Ok(()),
        }
    }

    async fn create_image_job(&self, request: &JobRequest) -> Result<String, BackendError> {
        self.record("create_image_job");
        let delay = {
            let mut state = self.state();
            state.requests.push(request.clone());
            state.create_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let (result, script) = {
            let mut state = self.state();
            (
                state
                    .create_result
                    .clone()
                    .unwrap_or_else(|| Ok(JOB_ID.to_string())),
                std::mem::take(&mut state.job_script),
            )
        };
        if result.is_ok() {
            for event in script {
                self.emit(event);
            }
        }
        result
    }

    async fn get_image_job(&self, job_id: &str) -> Result<JobState, BackendError> {
        self.record("get_image_job");
        match self.state().snapshot.clone() {
            Some(snapshot) => snapshot,
            None => Err(BackendError::Remote {
                method: "get_image_job".to_string(),
                code: None,
                message: format!("Job not found: {}", job_id),
            }),
        }
    }

    async fn cancel_image_job(&self, _job_id: &str) -> Result<(), BackendError> {
        self.record("cancel_image_job");
        let script = {
            let mut state = self.state();
            if let Some(cancelled) = state.cancelled_snapshot.take() {
                state.snapshot = Some(Ok(cancelled));
            }
            std::mem::take(&mut state.cancel_script)
        };
        for event in script {
            self.emit(event);
        }
        Ok(())
    }

    async fn copy_file(&self, from: &Path, to: &Path) -> Result<(), BackendError> {
        self.record("copy_file");
        let mut state = self.state();
        if let Some(e) = state.copy_error.clone() {
            return Err(e);
        }
        state.copies.push((from.to_path_buf(), to.to_path_buf()));
        Ok(())
    }

    async fn open_folder(&self, path: &Path) -> Result<(), BackendError> {
        self.record("open_folder");
        self.state().opened.push(path.to_path_buf());
        Ok(())
    }

    async fn check_ffmpeg(&self) -> Result<FfmpegCheck, BackendError> {
        self.record("check_ffmpeg");
        self.state()
            .ffmpeg
            .clone()
            .ok_or(BackendError::Disconnected)
    }

    fn subscribe_job_progress(&self) -> broadcast::Receiver<JobProgressEvent> {
        self.record("subscribe");
        self.events.subscribe()
    }
}
