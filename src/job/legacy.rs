//! Single-shot compatibility path for backends without the job API.

use crate::bridge::CompressImageParams;
use crate::events::{AppEvent, BatchProgress};
use crate::job::client::{FileOutcome, ImageJobClient, JobReport, JobSlot};
use crate::job::error::JobError;
use crate::job::request::JobPlan;
use crate::job::types::{CropRegion, JobStatus};
use std::path::Path;
use tokio::sync::mpsc;

impl ImageJobClient {
    /// One `compress_image` call per input, strictly in request order. A
    /// cancel request stops the loop before the next file starts.
    pub(crate) async fn run_legacy(&self, plan: &JobPlan, slot: &JobSlot) -> JobReport {
        let total = plan.len();
        let mut outcomes = vec![FileOutcome::Unfinished; total];

        for index in 0..total {
            let task_id = plan.task_ids[index];

            if slot.cancel_requested() {
                self.store.update(task_id, |t| Some(t.cancel(None)));
                outcomes[index] = FileOutcome::Cancelled(None);
                continue;
            }

            let output_path = plan.legacy_outputs[index].clone();
            let params = CompressImageParams {
                path: plan.request.inputs[index].clone(),
                output_path: output_path.clone(),
                mode: plan.request.mode.unwrap_or_default(),
                crop_region: plan.request.crop_region,
                options: plan.request.options.clone(),
            };

            self.store.update(task_id, |t| Some(t.start()));
            let (progress_tx, mut progress_rx) = mpsc::unbounded_channel();
            let call = self.backend.compress_image(params, progress_tx);
            tokio::pin!(call);

            let result = loop {
                tokio::select! {
                    result = &mut call => break result,
                    Some(percent) = progress_rx.recv() => {
                        self.store.update(task_id, |t| t.record_progress(percent));
                    }
                }
            };
            while let Ok(percent) = progress_rx.try_recv() {
                self.store.update(task_id, |t| t.record_progress(percent));
            }

            outcomes[index] = match result {
                Ok(()) => {
                    let size = self.output_size(&output_path).await;
                    let path = output_path.clone();
                    self.store
                        .update(task_id, |t| Some(t.complete(Some(path), Some(size))));
                    tracing::info!("Compressed {} (legacy)", output_path.display());
                    FileOutcome::Completed {
                        output_path: Some(output_path),
                    }
                }
                Err(e) => {
                    let message = e.to_string();
                    tracing::error!("Legacy compress of file {} failed: {}", index, message);
                    self.store
                        .update(task_id, |t| Some(t.fail(message.clone())));
                    FileOutcome::Failed(message)
                }
            };

            if slot.reports_progress() {
                self.publish_progress(BatchProgress {
                    current: index + 1,
                    total,
                });
            }
        }

        let report = JobReport {
            job_id: None,
            status: JobStatus::Completed,
            used_fallback: true,
            outcomes,
        };
        let status = if report.cancelled() > 0 {
            JobStatus::Cancelled
        } else if report.failed() == total {
            JobStatus::Failed
        } else {
            JobStatus::Completed
        };
        if slot.reports_progress() {
            self.clear_progress();
        }
        self.send_event(AppEvent::JobSettled { job_id: None });
        JobReport { status, ..report }
    }

    /// Direct crop through the old `crop_image` command.
    pub(crate) async fn legacy_crop(
        &self,
        source: &Path,
        output_path: &Path,
        crop: CropRegion,
    ) -> Result<(), JobError> {
        self.backend
            .crop_image(source, output_path, crop)
            .await
            .map_err(|e| {
                tracing::error!("Legacy crop of {} failed: {}", source.display(), e);
                JobError::FileProcessingFailed {
                    index: 0,
                    message: e.to_string(),
                }
            })
    }
}
