use crate::classify::MediaKind;
use crate::job::types::CropRegion;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use uuid::Uuid;

pub mod task;

pub use task::{clamp_percent, CompressionTask, ImportedFile, TaskStatus};

pub type TaskSnapshot = Arc<Vec<CompressionTask>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionScope {
    Kind(MediaKind),
    All,
}

impl SelectionScope {
    fn matches(&self, task: &CompressionTask) -> bool {
        match self {
            SelectionScope::Kind(kind) => task.kind == *kind,
            SelectionScope::All => true,
        }
    }
}

/// In-memory task collection.
///
/// Every mutation builds the next collection from the latest snapshot and
/// replaces it whole; observers holding a receiver never see a half-applied
/// update and a stale snapshot can never be written back.
#[derive(Clone)]
pub struct TaskStore {
    tx: Arc<watch::Sender<TaskSnapshot>>,
}

impl Default for TaskStore {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskStore {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(Arc::new(Vec::new()));
        Self { tx: Arc::new(tx) }
    }

    pub fn subscribe(&self) -> watch::Receiver<TaskSnapshot> {
        self.tx.subscribe()
    }

    pub fn snapshot(&self) -> TaskSnapshot {
        self.tx.borrow().clone()
    }

    pub fn len(&self) -> usize {
        self.tx.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tx.borrow().is_empty()
    }

    pub fn get(&self, id: Uuid) -> Option<CompressionTask> {
        self.tx.borrow().iter().find(|t| t.id == id).cloned()
    }

    /// Appends one task per file, in input order, and returns their fresh ids.
    pub fn add(&self, files: Vec<ImportedFile>) -> Vec<Uuid> {
        if files.is_empty() {
            return Vec::new();
        }
        let new_tasks: Vec<CompressionTask> =
            files.into_iter().map(CompressionTask::from_import).collect();
        let ids = new_tasks.iter().map(|t| t.id).collect();

        self.tx.send_modify(|current| {
            let mut next = Vec::with_capacity(current.len() + new_tasks.len());
            next.extend(current.iter().cloned());
            next.extend(new_tasks);
            *current = Arc::new(next);
        });
        ids
    }

    pub fn remove(&self, id: Uuid) -> bool {
        self.tx.send_if_modified(|current| {
            if !current.iter().any(|t| t.id == id) {
                return false;
            }
            let next: Vec<CompressionTask> =
                current.iter().filter(|t| t.id != id).cloned().collect();
            *current = Arc::new(next);
            true
        })
    }

    /// Applies `f` to the task with `id`. Returns false when the task is gone
    /// (e.g. removed while a job was in flight) or `f` declined the change.
    pub fn update<F>(&self, id: Uuid, f: F) -> bool
    where
        F: FnOnce(&CompressionTask) -> Option<CompressionTask>,
    {
        self.tx.send_if_modified(|current| {
            let Some(pos) = current.iter().position(|t| t.id == id) else {
                return false;
            };
            let Some(updated) = f(&current[pos]) else {
                return false;
            };
            if updated == current[pos] {
                return false;
            }
            let mut next: Vec<CompressionTask> = current.as_ref().clone();
            next[pos] = updated;
            *current = Arc::new(next);
            true
        })
    }

    pub fn set_crop(&self, id: Uuid, crop_region: Option<CropRegion>) -> bool {
        self.update(id, |t| {
            Some(CompressionTask {
                crop_region,
                ..t.clone()
            })
        })
    }

    pub fn set_cropped_path(&self, id: Uuid, cropped_image_path: Option<PathBuf>) -> bool {
        self.update(id, |t| {
            Some(CompressionTask {
                cropped_image_path: cropped_image_path.clone(),
                ..t.clone()
            })
        })
    }

    pub fn set_selected(&self, id: Uuid, selected: bool) -> bool {
        self.update(id, |t| {
            Some(CompressionTask {
                selected,
                ..t.clone()
            })
        })
    }

    pub fn set_selected_all(&self, scope: SelectionScope, selected: bool) {
        self.tx.send_if_modified(|current| {
            if !current
                .iter()
                .any(|t| scope.matches(t) && t.selected != selected)
            {
                return false;
            }
            let next: Vec<CompressionTask> = current
                .iter()
                .map(|t| {
                    if scope.matches(t) {
                        CompressionTask {
                            selected,
                            ..t.clone()
                        }
                    } else {
                        t.clone()
                    }
                })
                .collect();
            *current = Arc::new(next);
            true
        });
    }

    /// Returns a task to `pending` so it can be retried without re-importing.
    pub fn reset_output(&self, id: Uuid) -> bool {
        self.update(id, |t| Some(t.reset()))
    }

    /// Selected pending tasks of one kind, in collection order.
    pub fn runnable(&self, kind: MediaKind) -> Vec<CompressionTask> {
        self.tx
            .borrow()
            .iter()
            .filter(|t| t.kind == kind && t.is_runnable())
            .cloned()
            .collect()
    }

    pub fn count_status(&self, ids: &[Uuid], status: TaskStatus) -> usize {
        self.tx
            .borrow()
            .iter()
            .filter(|t| ids.contains(&t.id) && t.status == status)
            .count()
    }
}
