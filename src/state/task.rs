use crate::classify::{self, MediaKind};
use crate::job::types::CropRegion;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TaskStatus {
    Pending,
    Compressing,
    Done,
    Error,
    Cancelled,
}

impl Default for TaskStatus {
    fn default() -> Self {
        TaskStatus::Pending
    }
}

impl TaskStatus {
    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            TaskStatus::Done | TaskStatus::Error | TaskStatus::Cancelled
        )
    }

}

/// Metadata gathered when a path is imported.
#[derive(Debug, Clone, Default)]
pub struct ImportedFile {
    pub path: PathBuf,
    pub size_bytes: u64,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

impl ImportedFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }
}

/// One user-visible unit of work.
///
/// Transitions return a modified copy so the store can swap whole snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompressionTask {
    pub id: Uuid,
    pub kind: MediaKind,
    pub path: PathBuf,
    pub name: String,
    pub size_bytes: u64,
    pub status: TaskStatus,
    pub error: Option<String>,
    pub output_path: Option<PathBuf>,
    pub output_size_bytes: Option<u64>,
    pub crop_region: Option<CropRegion>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub selected: bool,
    pub progress_percent: Option<f32>,
    pub cropped_image_path: Option<PathBuf>,
}

impl CompressionTask {
    pub fn from_import(file: ImportedFile) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind: classify::classify(&file.path),
            name: classify::display_name(&file.path),
            path: file.path,
            size_bytes: file.size_bytes,
            status: TaskStatus::Pending,
            error: None,
            output_path: None,
            output_size_bytes: None,
            crop_region: None,
            width: file.width,
            height: file.height,
            selected: true,
            progress_percent: None,
            cropped_image_path: None,
        }
    }

    /// Path rendered or re-compressed from the detail view.
    pub fn working_path(&self) -> &PathBuf {
        self.cropped_image_path.as_ref().unwrap_or(&self.path)
    }

    pub fn is_runnable(&self) -> bool {
        self.status == TaskStatus::Pending && self.selected
    }

    pub fn start(&self) -> Self {
        Self {
            status: TaskStatus::Compressing,
            progress_percent: Some(0.0),
            error: None,
            output_path: None,
            output_size_bytes: None,
            ..self.clone()
        }
    }

    /// Returns `None` when the update would not change anything: the task is no
    /// longer in flight, or the value regresses below what was already seen.
    pub fn record_progress(&self, percent: f32) -> Option<Self> {
        if self.status.is_finished() {
            return None;
        }
        let percent = clamp_percent(percent);
        if let Some(previous) = self.progress_percent {
            if self.status == TaskStatus::Compressing && percent <= previous {
                return None;
            }
        }
        Some(Self {
            status: TaskStatus::Compressing,
            progress_percent: Some(percent),
            ..self.clone()
        })
    }

    pub fn complete(&self, output_path: Option<PathBuf>, output_size_bytes: Option<u64>) -> Self {
        Self {
            status: TaskStatus::Done,
            output_path: output_path.or_else(|| self.output_path.clone()),
            output_size_bytes: output_size_bytes.or(self.output_size_bytes),
            progress_percent: Some(100.0),
            error: None,
            ..self.clone()
        }
    }

    pub fn fail(&self, error: impl Into<String>) -> Self {
        Self {
            status: TaskStatus::Error,
            error: Some(error.into()),
            output_path: None,
            output_size_bytes: None,
            progress_percent: Some(self.progress_percent.unwrap_or(0.0)),
            ..self.clone()
        }
    }

    pub fn cancel(&self, reason: Option<String>) -> Self {
        Self {
            status: TaskStatus::Cancelled,
            error: reason,
            output_path: None,
            output_size_bytes: None,
            progress_percent: Some(self.progress_percent.unwrap_or(0.0)),
            ..self.clone()
        }
    }

    /// Back to a fresh pending state, keeping crop data and selection.
    pub fn reset(&self) -> Self {
        Self {
            status: TaskStatus::Pending,
            error: None,
            output_path: None,
            output_size_bytes: None,
            progress_percent: None,
            ..self.clone()
        }
    }

    /// Crop finished: the source for the next render is the intermediate file.
    pub fn cropped(&self, cropped_path: PathBuf) -> Self {
        Self {
            cropped_image_path: Some(cropped_path),
            ..self.reset()
        }
    }

    /// Crop failed or timed out: the original source is untouched.
    pub fn crop_failed(&self, error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..self.reset()
        }
    }
}

pub fn clamp_percent(percent: f32) -> f32 {
    if percent.is_nan() {
        0.0
    } else {
        percent.clamp(0.0, 100.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(path: &str) -> CompressionTask {
        CompressionTask::from_import(ImportedFile::new(path))
    }

    #[test]
    fn test_from_import_defaults() {
        let t = task("/tmp/photo.png");
        assert_eq!(t.kind, MediaKind::Image);
        assert_eq!(t.name, "photo.png");
        assert_eq!(t.status, TaskStatus::Pending);
        assert!(t.selected);
        assert!(t.progress_percent.is_none());
    }

    #[test]
    fn test_progress_is_clamped_and_monotonic() {
        let t = task("a.png").start();
        let t = t.record_progress(140.0).unwrap();
        assert_eq!(t.progress_percent, Some(100.0));

        let t = task("a.png").start().record_progress(40.0).unwrap();
        assert!(t.record_progress(30.0).is_none());
        assert!(t.record_progress(40.0).is_none());
        assert_eq!(t.record_progress(55.0).unwrap().progress_percent, Some(55.0));
    }

    #[test]
    fn test_terminal_overrides_progress() {
        let t = task("a.png").start().record_progress(40.0).unwrap();
        let done = t.complete(Some(PathBuf::from("out.png")), None);
        assert_eq!(done.status, TaskStatus::Done);
        assert_eq!(done.progress_percent, Some(100.0));
        assert!(done.record_progress(10.0).is_none());
    }

    #[test]
    fn test_failure_freezes_progress_and_clears_output() {
        let t = task("a.png").start().record_progress(62.0).unwrap();
        let failed = t.fail("decoder error");
        assert_eq!(failed.status, TaskStatus::Error);
        assert_eq!(failed.progress_percent, Some(62.0));
        assert!(failed.output_path.is_none());
        assert_eq!(failed.error.as_deref(), Some("decoder error"));
    }

    #[test]
    fn test_complete_keeps_prior_output_when_absent() {
        let mut t = task("a.png").start();
        t.output_path = Some(PathBuf::from("prior.png"));
        let done = t.complete(None, Some(10));
        assert_eq!(done.output_path, Some(PathBuf::from("prior.png")));
    }

    #[test]
    fn test_reset_allows_retry() {
        let t = task("a.png").start().fail("boom");
        assert_eq!(t.status, TaskStatus::Error);
        let t = t.reset();
        assert_eq!(t.status, TaskStatus::Pending);
        assert!(t.error.is_none());
        assert!(t.progress_percent.is_none());
    }

    #[test]
    fn test_crop_transitions_return_to_pending() {
        let t = task("a.png").start();
        let ok = t.cropped(PathBuf::from("/tmp/cruncher_crop_x.png"));
        assert_eq!(ok.status, TaskStatus::Pending);
        assert_eq!(ok.working_path(), &PathBuf::from("/tmp/cruncher_crop_x.png"));

        let failed = ok.start().crop_failed("Crop timeout");
        assert_eq!(failed.status, TaskStatus::Pending);
        assert_eq!(
            failed.cropped_image_path,
            Some(PathBuf::from("/tmp/cruncher_crop_x.png"))
        );
        assert_eq!(failed.error.as_deref(), Some("Crop timeout"));
    }
}
