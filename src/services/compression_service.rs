use crate::bridge::FfmpegCheck;
use crate::classify::MediaKind;
use crate::config::AppConfig;
use crate::events::{AppEvent, BatchProgress, EventSender};
use crate::job::{ImageJobClient, JobError, JobReport, JobRequestBuilder};
use crate::services::file_service::compressed_output_path;
use crate::services::{ConfigService, Service};
use crate::state::{CompressionTask, TaskStatus};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CompressionServiceError {
    #[error("A compression run is already in progress")]
    AlreadyRunning,
    #[error("Task not found: {task_id}")]
    TaskNotFound { task_id: Uuid },
    #[error("Task {task_id} is not pending")]
    NotPending { task_id: Uuid },
    #[error(transparent)]
    Job(#[from] JobError),
}

#[derive(Debug, Clone, PartialEq)]
pub struct BatchReport {
    pub kind: MediaKind,
    pub job_id: Option<String>,
    pub total: usize,
    pub done: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub used_fallback: bool,
}

impl BatchReport {
    fn from_job(kind: MediaKind, report: &JobReport) -> Self {
        Self {
            kind,
            job_id: report.job_id.clone(),
            total: report.outcomes.len(),
            done: report.done(),
            failed: report.failed(),
            cancelled: report.cancelled(),
            used_fallback: report.used_fallback,
        }
    }
}

/// Clears the running flag when a run ends, however it ends.
struct RunGuard(Arc<AtomicBool>);

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

#[derive(Clone)]
pub struct CompressionService {
    client: ImageJobClient,
    config: ConfigService,
    running: Arc<AtomicBool>,
    video_cancel: Arc<AtomicBool>,
    event_sender: EventSender,
}

impl CompressionService {
    pub fn new(client: ImageJobClient, config: ConfigService, event_sender: EventSender) -> Self {
        Self {
            client,
            config,
            running: Arc::new(AtomicBool::new(false)),
            video_cancel: Arc::new(AtomicBool::new(false)),
            event_sender,
        }
    }

    pub fn client(&self) -> &ImageJobClient {
        &self.client
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn begin(&self) -> Result<RunGuard, CompressionServiceError> {
        self.running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| CompressionServiceError::AlreadyRunning)?;
        self.video_cancel.store(false, Ordering::SeqCst);
        Ok(RunGuard(self.running.clone()))
    }

    /// Runs every selected pending task of one media kind.
    pub async fn run_selected_by_kind(
        &self,
        kind: MediaKind,
    ) -> Result<BatchReport, CompressionServiceError> {
        let _guard = self.begin()?;
        let tasks = self.client.store().runnable(kind);
        if tasks.is_empty() {
            return Err(JobError::EmptyRequest.into());
        }
        self.run(kind, tasks).await
    }

    /// Runs one pending task through the same path as a batch.
    pub async fn run_single_task(
        &self,
        task_id: Uuid,
    ) -> Result<BatchReport, CompressionServiceError> {
        let task = self
            .client
            .store()
            .get(task_id)
            .ok_or(CompressionServiceError::TaskNotFound { task_id })?;
        if task.status != TaskStatus::Pending {
            return Err(CompressionServiceError::NotPending { task_id });
        }

        let _guard = self.begin()?;
        self.run(task.kind, vec![task]).await
    }

    /// Asks the active run to stop. Returns whether a run was in progress.
    pub async fn cancel_active(&self) -> bool {
        let running = self.is_running();
        self.video_cancel.store(true, Ordering::SeqCst);
        let job_cancelled = self.client.cancel().await;
        if running {
            tracing::info!(
                "Cancellation requested for the active run{}",
                if job_cancelled { " and its job" } else { "" }
            );
        }
        running
    }

    async fn run(
        &self,
        kind: MediaKind,
        tasks: Vec<CompressionTask>,
    ) -> Result<BatchReport, CompressionServiceError> {
        let config = self.config.get_config().await;
        self.send_event(AppEvent::BatchStarted {
            kind,
            total: tasks.len(),
        });
        tracing::info!("Starting {} run over {} files", kind, tasks.len());

        let result = match kind {
            MediaKind::Image => self.run_images(&tasks, &config).await,
            MediaKind::Video => Ok(self.run_videos(&tasks, &config).await),
        };

        let (done, failed, cancelled) = match &result {
            Ok(report) => (report.done, report.failed, report.cancelled),
            Err(_) => (0, tasks.len(), 0),
        };
        self.send_event(AppEvent::BatchFinished {
            kind,
            done,
            failed,
            cancelled,
        });
        tracing::info!(
            "{} run finished: {} done, {} failed, {} cancelled",
            kind,
            done,
            failed,
            cancelled
        );
        result
    }

    async fn run_images(
        &self,
        tasks: &[CompressionTask],
        config: &AppConfig,
    ) -> Result<BatchReport, CompressionServiceError> {
        let plan = JobRequestBuilder::new()
            .mode(config.compress_mode)
            .output_dir(config.output_dir.clone())
            .max_concurrency(config.max_concurrency)
            .build_batch(tasks)?;
        let report = self
            .client
            .run_batch(&plan, config.use_legacy_image_command)
            .await?;
        Ok(BatchReport::from_job(MediaKind::Image, &report))
    }

    /// Videos have no job tracking: one call per file, in order.
    async fn run_videos(&self, tasks: &[CompressionTask], config: &AppConfig) -> BatchReport {
        let store = self.client.store();
        let backend = self.client.backend();
        let total = tasks.len();
        let mut report = BatchReport {
            kind: MediaKind::Video,
            job_id: None,
            total,
            done: 0,
            failed: 0,
            cancelled: 0,
            used_fallback: false,
        };

        for (index, task) in tasks.iter().enumerate() {
            if self.video_cancel.load(Ordering::SeqCst) {
                store.update(task.id, |t| Some(t.cancel(None)));
                report.cancelled += 1;
                continue;
            }

            let output_path = compressed_output_path(&task.path, config.output_dir.as_deref());
            store.update(task.id, |t| Some(t.start()));

            match backend
                .compress_video(&task.path, &output_path, config.compress_mode)
                .await
            {
                Ok(()) => {
                    let size = self.client.output_size(&output_path).await;
                    store.update(task.id, |t| {
                        Some(t.complete(Some(output_path.clone()), Some(size)))
                    });
                    report.done += 1;
                }
                Err(e) => {
                    tracing::error!("Video compression of {} failed: {}", task.name, e);
                    store.update(task.id, |t| Some(t.fail(e.to_string())));
                    report.failed += 1;
                }
            }

            self.client.publish_progress(BatchProgress {
                current: index + 1,
                total,
            });
        }

        self.client.clear_progress();
        report
    }

    /// Capability probe for the video path. A failed probe reads as missing.
    pub async fn probe_ffmpeg(&self) -> FfmpegCheck {
        let check = match self.client.backend().check_ffmpeg().await {
            Ok(check) => check,
            Err(e) => {
                tracing::warn!("FFmpeg probe failed: {}", e);
                FfmpegCheck::default()
            }
        };
        if !check.available {
            tracing::warn!("FFmpeg not available; video compression will fail");
        }
        self.send_event(AppEvent::FfmpegStatus {
            available: check.available,
            version: check.version.clone(),
        });
        check
    }

    fn send_event(&self, event: AppEvent) {
        if let Err(e) = self.event_sender.send(event) {
            tracing::error!("Failed to send compression event: {}", e);
        }
    }
}

#[async_trait::async_trait]
impl Service for CompressionService {
    async fn initialize(&self) -> Result<(), Box<dyn std::error::Error>> {
        self.probe_ffmpeg().await;
        tracing::info!("Compression service initialized");
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), Box<dyn std::error::Error>> {
        self.cancel_active().await;
        tracing::info!("Compression service shutdown");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::mock::{file_state, job_event, job_state, MockBackend};
    use crate::events::{create_event_channel, EventReceiver};
    use crate::job::types::{CompressMode, JobStatus};
    use crate::state::{ImportedFile, TaskStore};
    use std::path::PathBuf;

    struct Harness {
        backend: Arc<MockBackend>,
        store: TaskStore,
        service: CompressionService,
        ids: Vec<Uuid>,
        rx: EventReceiver,
    }

    fn harness(paths: &[&str]) -> Harness {
        let backend = Arc::new(MockBackend::new());
        let store = TaskStore::new();
        let ids = store.add(paths.iter().map(|p| ImportedFile::new(*p)).collect());
        let (tx, rx) = create_event_channel();
        let client = ImageJobClient::new(backend.clone(), store.clone(), tx.clone());
        let config = ConfigService::with_path(tx.clone(), None);
        let service = CompressionService::new(client, config, tx);
        Harness {
            backend,
            store,
            service,
            ids,
            rx,
        }
    }

    #[tokio::test]
    async fn test_video_run_is_sequential_and_untracked() {
        let mut h = harness(&["/v/a.mp4", "/p/b.png", "/v/c.mov"]);
        h.backend
            .state()
            .video_failures
            .insert(PathBuf::from("/v/c.mov"), "codec missing".to_string());

        let report = h
            .service
            .run_selected_by_kind(MediaKind::Video)
            .await
            .unwrap();

        assert_eq!(report.total, 2);
        assert_eq!(report.done, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(h.backend.calls_named("create_image_job"), 0);

        let calls = h.backend.state().video_calls.clone();
        assert_eq!(calls[0].0, PathBuf::from("/v/a.mp4"));
        assert_eq!(calls[0].1, PathBuf::from("/v/a_compressed.mp4"));
        assert_eq!(calls[0].2, CompressMode::VisuallyLossless);

        let image = h.store.get(h.ids[1]).unwrap();
        assert_eq!(image.status, TaskStatus::Pending);
        let failed = h.store.get(h.ids[2]).unwrap();
        assert_eq!(failed.error.as_deref(), Some("codec missing"));
        assert!(!h.service.is_running());
        assert_eq!(h.service.client().batch_progress(), None);

        let mut saw_finish = false;
        while let Ok(event) = h.rx.try_recv() {
            if let AppEvent::BatchFinished { done, failed, .. } = event {
                assert_eq!((done, failed), (1, 1));
                saw_finish = true;
            }
        }
        assert!(saw_finish);
    }

    #[tokio::test]
    async fn test_single_task_requires_pending() {
        let h = harness(&["/p/a.png"]);
        h.store.update(h.ids[0], |t| Some(t.start().fail("boom")));

        assert_eq!(
            h.service.run_single_task(h.ids[0]).await,
            Err(CompressionServiceError::NotPending { task_id: h.ids[0] })
        );
        let missing = Uuid::new_v4();
        assert_eq!(
            h.service.run_single_task(missing).await,
            Err(CompressionServiceError::TaskNotFound { task_id: missing })
        );
    }

    #[tokio::test]
    async fn test_single_task_runs_even_when_unselected() {
        let h = harness(&["/p/a.png", "/p/b.png"]);
        h.store.set_selected(h.ids[0], false);
        h.service
            .config
            .set_legacy_image_command(true)
            .await;

        let report = h.service.run_single_task(h.ids[0]).await.unwrap();

        assert_eq!(report.done, 1);
        assert!(report.used_fallback);
        assert_eq!(h.backend.state().legacy_calls.len(), 1);
        assert_eq!(h.store.get(h.ids[1]).unwrap().status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn test_nothing_selected() {
        let h = harness(&["/v/a.mp4"]);
        assert_eq!(
            h.service.run_selected_by_kind(MediaKind::Image).await,
            Err(CompressionServiceError::Job(JobError::EmptyRequest))
        );
        assert!(!h.service.is_running());
    }

    #[tokio::test]
    async fn test_second_run_is_rejected_while_active() {
        let h = harness(&["/p/a.png"]);
        {
            let mut state = h.backend.state();
            state.cancel_script = vec![job_event(1, JobStatus::Cancelled)];
            state.cancelled_snapshot = Some(job_state(
                JobStatus::Cancelled,
                vec![file_state("/p/a.png", JobStatus::Cancelled, None, None)],
            ));
        }

        let second = async {
            loop {
                if h.service.client().active_job().await.is_some() {
                    let rejected = h.service.run_selected_by_kind(MediaKind::Image).await;
                    assert!(h.service.cancel_active().await);
                    return rejected;
                }
                tokio::task::yield_now().await;
            }
        };
        let (first, rejected) = tokio::join!(
            h.service.run_selected_by_kind(MediaKind::Image),
            second
        );

        assert_eq!(rejected, Err(CompressionServiceError::AlreadyRunning));
        let first = first.unwrap();
        assert_eq!(first.cancelled, 1);
        assert_eq!(h.store.get(h.ids[0]).unwrap().status, TaskStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_cancel_reports_active_legacy_run() {
        let h = harness(&["/p/a.png", "/p/b.png", "/p/c.png"]);
        h.service.config.set_legacy_image_command(true).await;
        h.backend.state().legacy_progress = vec![10.0, 20.0, 30.0];
        assert!(!h.service.cancel_active().await);

        let canceller = async {
            loop {
                let started = h
                    .store
                    .get(h.ids[0])
                    .map(|t| t.status == TaskStatus::Compressing)
                    .unwrap_or(false);
                if h.service.is_running() && started {
                    assert!(h.service.cancel_active().await);
                    break;
                }
                tokio::task::yield_now().await;
            }
        };
        let (report, _) = tokio::join!(
            h.service.run_selected_by_kind(MediaKind::Image),
            canceller
        );

        let report = report.unwrap();
        assert!(report.used_fallback);
        assert_eq!(report.done, 1);
        assert_eq!(report.cancelled, 2);
        assert_eq!(h.backend.state().legacy_calls.len(), 1);
        assert!(!h.service.is_running());
    }

    #[tokio::test]
    async fn test_ffmpeg_probe_failure_is_non_fatal() {
        let mut h = harness(&[]);
        let check = h.service.probe_ffmpeg().await;
        assert!(!check.available);
        assert_eq!(
            h.rx.try_recv().ok(),
            Some(AppEvent::FfmpegStatus {
                available: false,
                version: String::new()
            })
        );

        h.backend.state().ffmpeg = Some(FfmpegCheck {
            available: true,
            path: "/usr/bin/ffmpeg".to_string(),
            version: "6.1".to_string(),
        });
        assert!(h.service.probe_ffmpeg().await.available);
    }
}
