//! Single-image render and crop launched from the detail view.

use crate::constants::{CROP_TIMEOUT_SECONDS, MAX_NOTIFICATIONS, RENDER_TIMEOUT_SECONDS};
use crate::events::AppEvent;
use crate::job::client::{FileOutcome, ImageJobClient, JobReport, JobSlot, Projection};
use crate::job::error::JobError;
use crate::job::request::{JobPlan, JobRequestBuilder, RenderSettings};
use crate::job::types::{CompressMode, CropRegion, JobStatus};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::timeout;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetailKind {
    Render,
    Crop,
}

impl DetailKind {
    pub fn label(&self) -> &'static str {
        match self {
            DetailKind::Render => "Render",
            DetailKind::Crop => "Crop",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationOutcome {
    Success,
    Failure,
}

/// Transient feedback for one detail operation; independent of task state.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub id: Uuid,
    pub job_id: Option<String>,
    pub task_id: Uuid,
    pub kind: DetailKind,
    pub outcome: NotificationOutcome,
    pub error: Option<String>,
}

/// Bounded FIFO; the oldest entry is dropped when full.
#[derive(Debug)]
pub struct NotificationQueue {
    items: VecDeque<Notification>,
    capacity: usize,
}

impl Default for NotificationQueue {
    fn default() -> Self {
        Self::with_capacity(MAX_NOTIFICATIONS)
    }
}

impl NotificationQueue {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            items: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&mut self, notification: Notification) {
        if self.items.len() == self.capacity {
            self.items.pop_front();
        }
        self.items.push_back(notification);
    }

    pub fn dismiss(&mut self, id: Uuid) -> bool {
        let before = self.items.len();
        self.items.retain(|n| n.id != id);
        self.items.len() != before
    }

    pub fn list(&self) -> Vec<Notification> {
        self.items.iter().cloned().collect()
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

#[derive(Clone)]
pub struct DetailJobRunner {
    client: ImageJobClient,
    slot: Arc<JobSlot>,
    notifications: Arc<RwLock<NotificationQueue>>,
    force_legacy: Arc<AtomicBool>,
    temp_dir: PathBuf,
    mode: CompressMode,
    render_timeout: Duration,
    crop_timeout: Duration,
}

impl DetailJobRunner {
    pub fn new(client: ImageJobClient, temp_dir: PathBuf) -> Self {
        Self {
            client,
            slot: Arc::new(JobSlot::default()),
            notifications: Arc::new(RwLock::new(NotificationQueue::default())),
            force_legacy: Arc::new(AtomicBool::new(false)),
            temp_dir,
            mode: CompressMode::default(),
            render_timeout: Duration::from_secs(RENDER_TIMEOUT_SECONDS),
            crop_timeout: Duration::from_secs(CROP_TIMEOUT_SECONDS),
        }
    }

    pub fn with_timeouts(mut self, render: Duration, crop: Duration) -> Self {
        self.render_timeout = render;
        self.crop_timeout = crop;
        self
    }

    pub fn with_mode(mut self, mode: CompressMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn set_force_legacy(&self, force: bool) {
        self.force_legacy.store(force, Ordering::SeqCst);
    }

    pub async fn active_job(&self) -> Option<String> {
        self.slot.job_id().await
    }

    pub async fn cancel(&self) -> bool {
        self.client.cancel_slot(&self.slot).await
    }

    pub async fn notifications(&self) -> Vec<Notification> {
        self.notifications.read().await.list()
    }

    pub async fn dismiss(&self, id: Uuid) -> bool {
        self.notifications.write().await.dismiss(id)
    }

    pub async fn clear_notifications(&self) {
        self.notifications.write().await.clear();
    }

    /// Renders the task's current source into a preview file. The task ends
    /// `done` on success and `error` on failure or timeout.
    pub async fn render(
        &self,
        task_id: Uuid,
        settings: RenderSettings,
        crop: Option<CropRegion>,
    ) -> Result<PathBuf, JobError> {
        let task = self
            .client
            .store()
            .get(task_id)
            .ok_or(JobError::TaskNotFound { task_id })?;
        let plan = JobRequestBuilder::new()
            .mode(self.mode)
            .render(&task, &settings, crop, &self.temp_dir)?;

        self.run(DetailKind::Render, task_id, &plan, self.render_timeout)
            .await
    }

    /// Crops the original source into an intermediate file. Whatever happens,
    /// the task goes back to `pending`; only the cropped path and error differ.
    pub async fn apply_crop(&self, task_id: Uuid, crop: CropRegion) -> Result<PathBuf, JobError> {
        let store = self.client.store();
        let task = store.get(task_id).ok_or(JobError::TaskNotFound { task_id })?;
        let plan = JobRequestBuilder::new()
            .mode(self.mode)
            .crop(&task, crop, &self.temp_dir)?;
        store.set_crop(task_id, Some(crop));

        self.run(DetailKind::Crop, task_id, &plan, self.crop_timeout)
            .await
    }

    async fn run(
        &self,
        kind: DetailKind,
        task_id: Uuid,
        plan: &JobPlan,
        limit: Duration,
    ) -> Result<PathBuf, JobError> {
        let projection = match kind {
            DetailKind::Render => Projection::Compress,
            DetailKind::Crop => Projection::Crop,
        };

        self.slot.reset();
        let (job_id, result) = match timeout(limit, self.execute(plan, projection)).await {
            Ok(Ok(report)) => (report.job_id.clone(), self.produced(kind, task_id, &report)),
            Ok(Err(e)) => {
                self.revert(kind, task_id, e.user_message());
                (None, Err(e))
            }
            Err(_) => {
                self.slot.request_cancel();
                let job_id = self.abandon().await;
                let err = JobError::Timeout {
                    operation: kind.label().to_string(),
                    after: limit,
                };
                tracing::error!("{} of {} timed out", kind.label(), task_id);
                self.revert(kind, task_id, err.to_string());
                (job_id, Err(err))
            }
        };

        self.notify(kind, task_id, job_id, &result).await;
        result
    }

    fn produced(&self, kind: DetailKind, task_id: Uuid, report: &JobReport) -> Result<PathBuf, JobError> {
        match report.outcomes.first() {
            Some(FileOutcome::Completed { .. }) => {
                let task = self
                    .client
                    .store()
                    .get(task_id)
                    .ok_or(JobError::TaskNotFound { task_id })?;
                let path = match kind {
                    DetailKind::Render => task.output_path,
                    DetailKind::Crop => task.cropped_image_path,
                };
                path.ok_or(JobError::TaskNotFound { task_id })
            }
            Some(FileOutcome::Cancelled(_)) => Err(JobError::JobCancelled),
            Some(FileOutcome::Failed(message)) => Err(JobError::FileProcessingFailed {
                index: 0,
                message: message.clone(),
            }),
            _ => Err(JobError::FileProcessingFailed {
                index: 0,
                message: format!("{} did not finish", kind.label()),
            }),
        }
    }

    /// Render failures leave the task retryable as `error`; crop failures
    /// never strand it, the original source is untouched.
    fn revert(&self, kind: DetailKind, task_id: Uuid, message: String) {
        let store = self.client.store();
        match kind {
            DetailKind::Render => store.update(task_id, |t| Some(t.fail(message))),
            DetailKind::Crop => store.update(task_id, |t| Some(t.crop_failed(message))),
        };
    }

    async fn execute(&self, plan: &JobPlan, projection: Projection) -> Result<JobReport, JobError> {
        let legacy = self.force_legacy.load(Ordering::SeqCst) || self.client.job_api_unsupported();
        if !legacy {
            match self.client.drive(plan, projection, &self.slot).await {
                Err(JobError::BackendUnavailable) => {
                    tracing::warn!("Detail job falling back to the legacy command");
                }
                other => return other,
            }
        }

        match projection {
            Projection::Compress => Ok(self.client.run_legacy(plan, &self.slot).await),
            Projection::Crop => Ok(self.legacy_crop(plan).await),
        }
    }

    async fn legacy_crop(&self, plan: &JobPlan) -> JobReport {
        let store = self.client.store();
        let task_id = plan.task_ids[0];
        let output_path = plan.legacy_outputs[0].clone();
        let crop = plan.request.crop_region;

        store.update(task_id, |t| Some(t.start()));
        let outcome = match crop {
            Some(crop) => match self
                .client
                .legacy_crop(&plan.request.inputs[0], &output_path, crop)
                .await
            {
                Ok(()) => {
                    let path = output_path.clone();
                    store.update(task_id, |t| Some(t.cropped(path)));
                    FileOutcome::Completed {
                        output_path: Some(output_path),
                    }
                }
                Err(e) => {
                    let message = e.user_message();
                    store.update(task_id, |t| Some(t.crop_failed(message.clone())));
                    FileOutcome::Failed(message)
                }
            },
            None => {
                store.update(task_id, |t| Some(t.reset()));
                FileOutcome::Failed("No crop region".to_string())
            }
        };

        let status = match outcome {
            FileOutcome::Completed { .. } => JobStatus::Completed,
            _ => JobStatus::Failed,
        };
        JobReport {
            job_id: None,
            status,
            used_fallback: true,
            outcomes: vec![outcome],
        }
    }

    /// Best-effort cancel of a job whose wait was abandoned. A submission
    /// still in flight cancels its job itself once the id arrives.
    async fn abandon(&self) -> Option<String> {
        let job_id = self.slot.job_id().await?;
        self.client.cancel_job(&job_id).await;
        self.slot.release(&job_id).await;
        Some(job_id)
    }

    async fn notify(
        &self,
        kind: DetailKind,
        task_id: Uuid,
        job_id: Option<String>,
        result: &Result<PathBuf, JobError>,
    ) {
        let (outcome, error) = match result {
            Ok(_) => (NotificationOutcome::Success, None),
            Err(e) => (NotificationOutcome::Failure, Some(e.user_message())),
        };
        let notification = Notification {
            id: Uuid::new_v4(),
            job_id,
            task_id,
            kind,
            outcome,
            error,
        };
        self.notifications.write().await.push(notification.clone());
        self.client.send_event(AppEvent::Notification(notification));
    }
}
