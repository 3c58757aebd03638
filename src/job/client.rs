//! Submission, live projection and reconciliation of image jobs.

use crate::bridge::Backend;
use crate::events::{AppEvent, BatchProgress, EventSender};
use crate::job::error::JobError;
use crate::job::request::JobPlan;
use crate::job::router::{JobSignal, JobSubscription};
use crate::job::types::{JobFileState, JobRequest, JobState, JobStatus};
use crate::state::TaskStore;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, RwLock};

/// How per-file results land on the task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Projection {
    /// Finished files become `done`, `error` or `cancelled`.
    Compress,
    /// Finished files go back to `pending`, carrying the cropped intermediate.
    Crop,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FileOutcome {
    Unfinished,
    Completed { output_path: Option<PathBuf> },
    Failed(String),
    Cancelled(Option<String>),
}

impl FileOutcome {
    /// The settled outcome a snapshot entry reports, `None` while the backend
    /// still lists the file as pending or running.
    fn from_snapshot(file: &JobFileState) -> Option<Self> {
        match file.status {
            JobStatus::Completed => Some(FileOutcome::Completed {
                output_path: file.output_path.clone(),
            }),
            JobStatus::Failed => Some(FileOutcome::Failed(
                file.error
                    .clone()
                    .unwrap_or_else(|| "Processing failed".to_string()),
            )),
            JobStatus::Cancelled => Some(FileOutcome::Cancelled(file.error.clone())),
            JobStatus::Pending | JobStatus::Running => None,
        }
    }

    /// A file the backend never finished inside a settled job.
    fn left_over(job_status: JobStatus) -> Self {
        match job_status {
            JobStatus::Cancelled => FileOutcome::Cancelled(None),
            _ => FileOutcome::Failed("File did not finish".to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct JobReport {
    pub job_id: Option<String>,
    pub status: JobStatus,
    pub used_fallback: bool,
    pub outcomes: Vec<FileOutcome>,
}

impl JobReport {
    pub fn done(&self) -> usize {
        self.count(|o| matches!(o, FileOutcome::Completed { .. }))
    }

    pub fn failed(&self) -> usize {
        self.count(|o| matches!(o, FileOutcome::Failed(_)))
    }

    pub fn cancelled(&self) -> usize {
        self.count(|o| matches!(o, FileOutcome::Cancelled(_)))
    }

    fn count(&self, f: impl Fn(&FileOutcome) -> bool) -> usize {
        self.outcomes.iter().filter(|o| f(o)).count()
    }
}

/// Owned handle on the job a run is currently driving.
#[derive(Debug, Default)]
pub struct JobSlot {
    job_id: RwLock<Option<String>>,
    cancel_requested: AtomicBool,
    reports_progress: bool,
}

impl JobSlot {
    /// Slot of the batch run; only runs through it publish batch progress.
    pub(crate) fn batch() -> Self {
        Self {
            reports_progress: true,
            ..Self::default()
        }
    }

    pub fn reports_progress(&self) -> bool {
        self.reports_progress
    }

    pub async fn job_id(&self) -> Option<String> {
        self.job_id.read().await.clone()
    }

    pub fn cancel_requested(&self) -> bool {
        self.cancel_requested.load(Ordering::SeqCst)
    }

    pub(crate) fn request_cancel(&self) {
        self.cancel_requested.store(true, Ordering::SeqCst);
    }

    pub(crate) fn reset(&self) {
        self.cancel_requested.store(false, Ordering::SeqCst);
    }

    pub(crate) async fn set(&self, job_id: Option<String>) {
        *self.job_id.write().await = job_id;
    }

    /// Clears the slot unless a newer job already took it over.
    pub(crate) async fn release(&self, job_id: &str) {
        let mut slot = self.job_id.write().await;
        if slot.as_deref() == Some(job_id) {
            *slot = None;
        }
    }
}

#[derive(Clone)]
pub struct ImageJobClient {
    pub(super) backend: Arc<dyn Backend>,
    pub(super) store: TaskStore,
    pub(super) event_sender: EventSender,
    active: Arc<JobSlot>,
    last_state: Arc<RwLock<Option<JobState>>>,
    job_api_unsupported: Arc<AtomicBool>,
    progress: Arc<watch::Sender<Option<BatchProgress>>>,
}

impl ImageJobClient {
    pub fn new(backend: Arc<dyn Backend>, store: TaskStore, event_sender: EventSender) -> Self {
        Self {
            backend,
            store,
            event_sender,
            active: Arc::new(JobSlot::batch()),
            last_state: Arc::new(RwLock::new(None)),
            job_api_unsupported: Arc::new(AtomicBool::new(false)),
            progress: Arc::new(watch::channel(None).0),
        }
    }

    pub fn store(&self) -> &TaskStore {
        &self.store
    }

    pub fn backend(&self) -> Arc<dyn Backend> {
        self.backend.clone()
    }

    pub async fn active_job(&self) -> Option<String> {
        self.active.job_id().await
    }

    /// Snapshot fetched by the most recent reconciliation.
    pub async fn last_job_state(&self) -> Option<JobState> {
        self.last_state.read().await.clone()
    }

    /// Completed-file count of the run in flight, `None` once it settles.
    pub fn batch_progress(&self) -> Option<BatchProgress> {
        *self.progress.borrow()
    }

    pub fn watch_progress(&self) -> watch::Receiver<Option<BatchProgress>> {
        self.progress.subscribe()
    }

    pub fn job_api_unsupported(&self) -> bool {
        self.job_api_unsupported.load(Ordering::SeqCst)
    }

    /// Opens a listener for a job that is about to be submitted.
    pub fn subscribe(&self, expected_files: usize) -> JobSubscription {
        JobSubscription::new(self.backend.subscribe_job_progress(), expected_files)
    }

    /// Creates the job on the backend. Once the entry point has been reported
    /// missing, later submissions fail fast without another round trip.
    pub async fn submit(&self, request: &JobRequest) -> Result<String, JobError> {
        if self.job_api_unsupported() {
            return Err(JobError::BackendUnavailable);
        }

        match self.backend.create_image_job(request).await {
            Ok(job_id) => {
                tracing::info!("Image job {} created for {} files", job_id, request.len());
                Ok(job_id)
            }
            Err(e) => {
                let err = JobError::from_submission(e);
                if err == JobError::BackendUnavailable {
                    self.job_api_unsupported.store(true, Ordering::SeqCst);
                    tracing::warn!("Image job API unavailable on this backend");
                } else {
                    tracing::error!("Image job submission failed: {}", err);
                }
                Err(err)
            }
        }
    }

    /// Runs a batch of compress tasks to completion. Falls back to one legacy
    /// call per input when the job API is missing or `force_legacy` is set.
    pub async fn run_batch(&self, plan: &JobPlan, force_legacy: bool) -> Result<JobReport, JobError> {
        if plan.is_empty() {
            return Err(JobError::EmptyRequest);
        }
        self.active.reset();

        if force_legacy || self.job_api_unsupported() {
            return Ok(self.run_legacy(plan, &self.active).await);
        }

        match self.drive(plan, Projection::Compress, &self.active).await {
            Ok(report) => Ok(report),
            Err(JobError::BackendUnavailable) => {
                tracing::warn!("Falling back to per-file compression for {} files", plan.len());
                self.send_event(AppEvent::JobFallback { total: plan.len() });
                Ok(self.run_legacy(plan, &self.active).await)
            }
            Err(e) => {
                let message = match &e {
                    JobError::JobSubmissionFailed(msg) => msg.clone(),
                    other => other.to_string(),
                };
                for task_id in &plan.task_ids {
                    self.store.update(*task_id, |t| Some(t.fail(message.clone())));
                }
                Err(e)
            }
        }
    }

    /// Requests cooperative cancellation of the active batch. Returns false
    /// when no job was running yet; the run then cancels right after submit.
    pub async fn cancel(&self) -> bool {
        self.cancel_slot(&self.active).await
    }

    pub(crate) async fn cancel_slot(&self, slot: &JobSlot) -> bool {
        slot.request_cancel();
        match slot.job_id().await {
            Some(job_id) => {
                self.cancel_job(&job_id).await;
                true
            }
            None => false,
        }
    }

    pub async fn cancel_job(&self, job_id: &str) {
        match self.backend.cancel_image_job(job_id).await {
            Ok(()) => tracing::info!("Cancellation requested for job {}", job_id),
            Err(e) => tracing::warn!("Failed to cancel job {}: {}", job_id, e),
        }
    }

    /// Submits on a task of its own, so the new job lands in `slot` even when
    /// the caller stops waiting mid-flight. A cancel requested before the id
    /// was known is applied as soon as it is.
    async fn submit_into(&self, request: &JobRequest, slot: &Arc<JobSlot>) -> Result<String, JobError> {
        let client = self.clone();
        let request = request.clone();
        let slot = slot.clone();
        let submission = tokio::spawn(async move {
            let job_id = client.submit(&request).await?;
            slot.set(Some(job_id.clone())).await;
            if slot.cancel_requested() {
                client.cancel_job(&job_id).await;
            }
            Ok::<_, JobError>(job_id)
        });

        submission
            .await
            .map_err(|e| JobError::JobSubmissionFailed(e.to_string()))?
    }

    /// Subscribe, submit, project signals onto the store, then reconcile.
    pub(crate) async fn drive(
        &self,
        plan: &JobPlan,
        projection: Projection,
        slot: &Arc<JobSlot>,
    ) -> Result<JobReport, JobError> {
        let mut subscription = self.subscribe(plan.len());
        for task_id in &plan.task_ids {
            self.store.update(*task_id, |t| Some(t.start()));
        }

        let job_id = self.submit_into(&plan.request, slot).await?;
        subscription.bind(job_id.clone());
        self.send_event(AppEvent::JobSubmitted {
            job_id: job_id.clone(),
            total: plan.len(),
        });

        let mut outcomes = vec![FileOutcome::Unfinished; plan.len()];
        let mut terminal = None;
        while let Some(signal) = subscription.next().await {
            let (index, outcome) = match signal {
                JobSignal::FileProgress { index, percent, .. } => {
                    self.store
                        .update(plan.task_ids[index], |t| t.record_progress(percent));
                    continue;
                }
                JobSignal::FileCompleted { index, output_path } => {
                    (index, FileOutcome::Completed { output_path })
                }
                JobSignal::FileFailed { index, error } => (index, FileOutcome::Failed(error)),
                JobSignal::FileCancelled { index, error } => {
                    (index, FileOutcome::Cancelled(error))
                }
                JobSignal::JobTerminal { status, error } => {
                    terminal = Some((status, error));
                    break;
                }
            };
            self.settle_file(plan, index, projection, &outcome).await;
            outcomes[index] = outcome;
            self.report_progress(slot, projection, &outcomes);
        }

        if terminal.is_none() {
            tracing::warn!("Progress stream for job {} ended without a terminal event", job_id);
        }
        let status = self
            .reconcile(&job_id, plan, projection, &mut outcomes, terminal)
            .await;
        self.report_progress(slot, projection, &outcomes);

        slot.release(&job_id).await;
        if slot.reports_progress() {
            self.clear_progress();
        }
        self.send_event(AppEvent::JobSettled {
            job_id: Some(job_id.clone()),
        });

        Ok(JobReport {
            job_id: Some(job_id),
            status,
            used_fallback: false,
            outcomes,
        })
    }

    /// Fetches the authoritative snapshot once and applies every file whose
    /// final state differs from what the event stream delivered. A file the
    /// snapshot omits or still lists as unfinished keeps any outcome the
    /// stream already settled; only files with no outcome at all are closed
    /// off as left over.
    pub async fn reconcile(
        &self,
        job_id: &str,
        plan: &JobPlan,
        projection: Projection,
        outcomes: &mut [FileOutcome],
        terminal: Option<(JobStatus, Option<String>)>,
    ) -> JobStatus {
        match self.backend.get_image_job(job_id).await {
            Ok(state) => {
                for index in 0..outcomes.len() {
                    let reported = state.file(index).and_then(FileOutcome::from_snapshot);
                    let resolved = match reported {
                        Some(outcome) => outcome,
                        None if outcomes[index] == FileOutcome::Unfinished => {
                            FileOutcome::left_over(state.status)
                        }
                        None => continue,
                    };
                    let known_output = matches!(
                        (&resolved, &outcomes[index]),
                        (
                            FileOutcome::Completed { output_path: None },
                            FileOutcome::Completed { .. }
                        )
                    );
                    if resolved == outcomes[index] || known_output {
                        continue;
                    }
                    self.settle_file(plan, index, projection, &resolved).await;
                    outcomes[index] = resolved;
                }

                let status = if state.is_terminal() {
                    state.status
                } else {
                    JobStatus::Failed
                };
                tracing::info!(
                    "Job {} reconciled: {} completed, {} failed, {} cancelled",
                    job_id,
                    state.completed_files,
                    state.failed_files,
                    state.cancelled_files
                );
                *self.last_state.write().await = Some(state);
                self.send_event(AppEvent::JobReconciled {
                    job_id: job_id.to_string(),
                    status,
                });
                status
            }
            Err(e) => {
                tracing::warn!("Snapshot fetch for job {} failed: {}", job_id, e);
                let (status, error) = terminal.unwrap_or((
                    JobStatus::Failed,
                    Some("Backend connection lost".to_string()),
                ));
                for index in 0..outcomes.len() {
                    if outcomes[index] != FileOutcome::Unfinished {
                        continue;
                    }
                    let resolved = match status {
                        JobStatus::Completed => FileOutcome::Failed("Missing result".to_string()),
                        JobStatus::Cancelled => FileOutcome::Cancelled(None),
                        _ => FileOutcome::Failed(
                            error.clone().unwrap_or_else(|| "Job failed".to_string()),
                        ),
                    };
                    self.settle_file(plan, index, projection, &resolved).await;
                    outcomes[index] = resolved;
                }
                if status.is_terminal() {
                    status
                } else {
                    JobStatus::Failed
                }
            }
        }
    }

    async fn settle_file(
        &self,
        plan: &JobPlan,
        index: usize,
        projection: Projection,
        outcome: &FileOutcome,
    ) {
        let task_id = plan.task_ids[index];
        let planned = &plan.legacy_outputs[index];

        match (projection, outcome) {
            (_, FileOutcome::Unfinished) => {}
            (Projection::Compress, FileOutcome::Completed { output_path }) => {
                let path = output_path
                    .clone()
                    .or_else(|| self.store.get(task_id).and_then(|t| t.output_path))
                    .unwrap_or_else(|| planned.clone());
                let size = self.output_size(&path).await;
                self.store
                    .update(task_id, |t| Some(t.complete(Some(path), Some(size))));
            }
            (Projection::Compress, FileOutcome::Failed(error)) => {
                tracing::error!("File {} of the job failed: {}", index, error);
                self.store.update(task_id, |t| Some(t.fail(error.clone())));
            }
            (Projection::Compress, FileOutcome::Cancelled(reason)) => {
                self.store.update(task_id, |t| Some(t.cancel(reason.clone())));
            }
            (Projection::Crop, FileOutcome::Completed { output_path }) => {
                let path = output_path.clone().unwrap_or_else(|| planned.clone());
                self.store.update(task_id, |t| Some(t.cropped(path)));
            }
            (Projection::Crop, FileOutcome::Failed(error)) => {
                self.store
                    .update(task_id, |t| Some(t.crop_failed(error.clone())));
            }
            (Projection::Crop, FileOutcome::Cancelled(_)) => {
                self.store
                    .update(task_id, |t| Some(t.crop_failed("Crop cancelled")));
            }
        }
    }

    /// Size of a produced file; a failed probe reads as zero.
    pub(crate) async fn output_size(&self, path: &Path) -> u64 {
        match self.backend.get_file_info(path).await {
            Ok(info) => info.size_bytes,
            Err(e) => {
                tracing::warn!("Could not read output size of {}: {}", path.display(), e);
                0
            }
        }
    }

    fn report_progress(&self, slot: &JobSlot, projection: Projection, outcomes: &[FileOutcome]) {
        if projection != Projection::Compress || !slot.reports_progress() {
            return;
        }
        let current = outcomes
            .iter()
            .filter(|o| **o != FileOutcome::Unfinished)
            .count();
        self.publish_progress(BatchProgress {
            current,
            total: outcomes.len(),
        });
    }

    pub(crate) fn publish_progress(&self, progress: BatchProgress) {
        self.progress.send_replace(Some(progress));
        self.send_event(AppEvent::BatchProgress(progress));
    }

    pub(crate) fn clear_progress(&self) {
        self.progress.send_replace(None);
    }

    pub(super) fn send_event(&self, event: AppEvent) {
        if let Err(e) = self.event_sender.send(event) {
            tracing::error!("Failed to send job event: {}", e);
        }
    }
}
