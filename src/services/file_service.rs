use crate::bridge::{Backend, BackendError};
use crate::constants::{
    COMPRESSED_SUFFIX, CROP_FILE_PREFIX, IMPORT_BATCH_SIZE, PREVIEW_FILE_PREFIX, SAFE_ID_MAX_LEN,
};
use crate::events::{AppEvent, EventSender};
use crate::services::Service;
use crate::state::{ImportedFile, TaskStore};
use futures_util::future::join_all;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum FileError {
    #[error("Task not found: {task_id}")]
    TaskNotFound { task_id: Uuid },
    #[error("Nothing to export for {name}")]
    NoOutput { name: String },
    #[error("Source file is empty: {path}")]
    SourceEmpty { path: String },
    #[error("Copy failed: {0}")]
    CopyFailed(String),
    #[error("Could not open folder: {0}")]
    OpenFailed(String),
}

impl FileError {
    pub fn user_message(&self) -> String {
        match self {
            Self::SourceEmpty { .. } => {
                "The file to export is empty. Compress it again before exporting.".to_string()
            }
            other => other.to_string(),
        }
    }

    fn from_copy(err: BackendError, from: &Path) -> Self {
        let empty = match &err {
            BackendError::Remote { code, message, .. } => {
                code.as_deref() == Some("source_empty")
                    || message.to_lowercase().contains("is empty")
            }
            _ => false,
        };
        if empty {
            FileError::SourceEmpty {
                path: from.display().to_string(),
            }
        } else {
            FileError::CopyFailed(err.to_string())
        }
    }
}

/// `<dir>/<stem>_compressed.<ext>`, where `dir` defaults to the source folder.
pub fn compressed_output_path(input: &Path, output_dir: Option<&Path>) -> PathBuf {
    let dir = output_dir
        .map(Path::to_path_buf)
        .or_else(|| input.parent().map(Path::to_path_buf))
        .unwrap_or_else(|| PathBuf::from("."));
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "output".to_string());
    let name = match input.extension() {
        Some(ext) => format!("{}{}.{}", stem, COMPRESSED_SUFFIX, ext.to_string_lossy()),
        None => format!("{}{}", stem, COMPRESSED_SUFFIX),
    };
    dir.join(name)
}

fn unsafe_chars() -> Option<&'static Regex> {
    static UNSAFE: OnceLock<Option<Regex>> = OnceLock::new();
    UNSAFE
        .get_or_init(|| Regex::new(r"[^A-Za-z0-9_-]").ok())
        .as_ref()
}

/// File-name-safe form of a task id.
pub fn safe_id(id: &str) -> String {
    let cleaned = match unsafe_chars() {
        Some(re) => re.replace_all(id, "_").into_owned(),
        None => id.to_string(),
    };
    cleaned.chars().take(SAFE_ID_MAX_LEN).collect()
}

pub fn preview_path(temp_dir: &Path, task_id: Uuid, extension: &str) -> PathBuf {
    temp_dir.join(format!(
        "{}{}.{}",
        PREVIEW_FILE_PREFIX,
        safe_id(&task_id.to_string()),
        extension
    ))
}

pub fn crop_path(temp_dir: &Path, task_id: Uuid, source: &Path) -> PathBuf {
    let ext = source
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();
    temp_dir.join(format!(
        "{}{}{}",
        CROP_FILE_PREFIX,
        safe_id(&task_id.to_string()),
        ext
    ))
}

#[derive(Clone)]
pub struct FileService {
    backend: Arc<dyn Backend>,
    store: TaskStore,
    event_sender: EventSender,
}

impl FileService {
    pub fn new(backend: Arc<dyn Backend>, store: TaskStore, event_sender: EventSender) -> Self {
        Self {
            backend,
            store,
            event_sender,
        }
    }

    /// Probes every path and adds one pending task per path, in input order.
    pub async fn import_paths(&self, paths: Vec<PathBuf>) -> Vec<Uuid> {
        if paths.is_empty() {
            return Vec::new();
        }

        let total = paths.len();
        let mut imported = Vec::with_capacity(total);

        for chunk in paths.chunks(IMPORT_BATCH_SIZE) {
            let probes = chunk.iter().map(|path| self.probe(path.clone()));
            imported.extend(join_all(probes).await);
            self.send_event(AppEvent::ImportProgress {
                current: imported.len(),
                total,
            });
        }

        let ids = self.store.add(imported);
        tracing::info!("Imported {} files", ids.len());
        ids
    }

    pub async fn import_folder(&self, dir: &Path) -> Vec<Uuid> {
        match self.backend.list_image_files_in_directory(dir).await {
            Ok(paths) => self.import_paths(paths).await,
            Err(e) => {
                tracing::error!("Failed to list images in {}: {}", dir.display(), e);
                Vec::new()
            }
        }
    }

    async fn probe(&self, path: PathBuf) -> ImportedFile {
        match self.backend.get_file_info(&path).await {
            Ok(info) => ImportedFile {
                size_bytes: info.size_bytes,
                width: info.width,
                height: info.height,
                path,
            },
            Err(e) => {
                tracing::warn!("Metadata probe failed for {}: {}", path.display(), e);
                ImportedFile::new(path)
            }
        }
    }

    /// Copies the produced file (or the cropped intermediate when nothing was
    /// rendered yet) to `destination` and reveals it. Failures are reported as
    /// alerts and never touch the task.
    pub async fn export_output(&self, task_id: Uuid, destination: &Path) -> Result<(), FileError> {
        let result = self.copy_and_reveal(task_id, destination).await;
        if let Err(e) = &result {
            tracing::error!("Export of {} failed: {}", task_id, e);
            self.send_event(AppEvent::ErrorOccurred(e.user_message()));
        }
        result
    }

    async fn copy_and_reveal(&self, task_id: Uuid, destination: &Path) -> Result<(), FileError> {
        let task = self
            .store
            .get(task_id)
            .ok_or(FileError::TaskNotFound { task_id })?;
        let source = task
            .output_path
            .clone()
            .or_else(|| task.cropped_image_path.clone())
            .ok_or_else(|| FileError::NoOutput {
                name: task.name.clone(),
            })?;

        self.backend
            .copy_file(&source, destination)
            .await
            .map_err(|e| FileError::from_copy(e, &source))?;

        let folder = destination.parent().unwrap_or(destination);
        self.reveal(folder).await?;

        tracing::info!("Exported {} to {}", task.name, destination.display());
        Ok(())
    }

    pub async fn reveal(&self, path: &Path) -> Result<(), FileError> {
        self.backend
            .open_folder(path)
            .await
            .map_err(|e| FileError::OpenFailed(e.to_string()))
    }

    fn send_event(&self, event: AppEvent) {
        if let Err(e) = self.event_sender.send(event) {
            tracing::error!("Failed to send file event: {}", e);
        }
    }
}

#[async_trait::async_trait]
impl Service for FileService {
    async fn initialize(&self) -> Result<(), Box<dyn std::error::Error>> {
        tracing::info!("File service initialized");
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), Box<dyn std::error::Error>> {
        tracing::info!("File service shutdown");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::mock::MockBackend;
    use crate::classify::MediaKind;
    use crate::events::{create_event_channel, EventReceiver};

    fn service() -> (Arc<MockBackend>, TaskStore, FileService, EventReceiver) {
        let backend = Arc::new(MockBackend::new());
        let store = TaskStore::new();
        let (tx, rx) = create_event_channel();
        let service = FileService::new(backend.clone(), store.clone(), tx);
        (backend, store, service, rx)
    }

    #[test]
    fn test_compressed_output_path() {
        assert_eq!(
            compressed_output_path(Path::new("/photos/cat.png"), None),
            PathBuf::from("/photos/cat_compressed.png")
        );
        assert_eq!(
            compressed_output_path(Path::new("/photos/cat.png"), Some(Path::new("/out"))),
            PathBuf::from("/out/cat_compressed.png")
        );
        assert_eq!(
            compressed_output_path(Path::new("/photos/README"), None),
            PathBuf::from("/photos/README_compressed")
        );
    }

    #[test]
    fn test_safe_id_and_temp_paths() {
        assert_eq!(safe_id("a b/c.d-e_f"), "a_b_c_d-e_f");
        assert_eq!(safe_id(&"x".repeat(80)).len(), 50);

        let id = Uuid::nil();
        let preview = preview_path(Path::new("/tmp"), id, "webp");
        assert_eq!(
            preview,
            PathBuf::from("/tmp/cruncher_preview_00000000-0000-0000-0000-000000000000.webp")
        );
        let crop = crop_path(Path::new("/tmp"), id, Path::new("/photos/cat.JPG"));
        assert_eq!(
            crop,
            PathBuf::from("/tmp/cruncher_crop_00000000-0000-0000-0000-000000000000.JPG")
        );
    }

    #[tokio::test]
    async fn test_import_probes_metadata_in_order() {
        let (backend, store, service, mut rx) = service();
        backend
            .state()
            .file_sizes
            .insert(PathBuf::from("b.jpg"), 2048);

        let paths: Vec<PathBuf> = ["a.png", "b.jpg", "c.mp4"]
            .iter()
            .map(PathBuf::from)
            .collect();
        let ids = service.import_paths(paths).await;

        assert_eq!(ids.len(), 3);
        let snapshot = store.snapshot();
        assert_eq!(snapshot[1].size_bytes, 2048);
        assert_eq!(snapshot[0].width, Some(640));
        assert_eq!(snapshot[2].kind, MediaKind::Video);
        assert_eq!(backend.calls_named("get_file_info"), 3);
        assert_eq!(
            rx.try_recv().ok(),
            Some(AppEvent::ImportProgress {
                current: 3,
                total: 3
            })
        );
    }

    #[tokio::test]
    async fn test_import_batches_progress() {
        let (_backend, _store, service, mut rx) = service();
        let paths: Vec<PathBuf> = (0..10).map(|i| PathBuf::from(format!("{}.png", i))).collect();
        service.import_paths(paths).await;

        assert_eq!(
            rx.try_recv().ok(),
            Some(AppEvent::ImportProgress {
                current: 8,
                total: 10
            })
        );
        assert_eq!(
            rx.try_recv().ok(),
            Some(AppEvent::ImportProgress {
                current: 10,
                total: 10
            })
        );
    }

    #[tokio::test]
    async fn test_failed_probe_imports_zero_size() {
        let (backend, store, service, _rx) = service();
        backend.state().file_info_fails = true;

        service.import_paths(vec![PathBuf::from("a.png")]).await;
        let task = &store.snapshot()[0];
        assert_eq!(task.size_bytes, 0);
        assert_eq!(task.width, None);
    }

    #[tokio::test]
    async fn test_folder_listing_failure_imports_nothing() {
        let (backend, store, service, _rx) = service();
        backend.state().listing = Some(Err(BackendError::Disconnected));

        assert!(service.import_folder(Path::new("/photos")).await.is_empty());
        assert!(store.is_empty());

        backend.state().listing = Some(Ok(vec![PathBuf::from("/photos/a.png")]));
        assert_eq!(service.import_folder(Path::new("/photos")).await.len(), 1);
    }

    #[tokio::test]
    async fn test_export_copies_and_reveals() {
        let (backend, store, service, _rx) = service();
        let ids = store.add(vec![ImportedFile::new("/photos/a.png")]);
        store.update(ids[0], |t| {
            Some(t.start().complete(Some(PathBuf::from("/photos/a_compressed.png")), Some(10)))
        });

        service
            .export_output(ids[0], Path::new("/downloads/a.png"))
            .await
            .unwrap();

        let state = backend.state();
        assert_eq!(
            state.copies,
            vec![(
                PathBuf::from("/photos/a_compressed.png"),
                PathBuf::from("/downloads/a.png")
            )]
        );
        assert_eq!(state.opened, vec![PathBuf::from("/downloads")]);
    }

    #[tokio::test]
    async fn test_export_failure_is_an_alert_not_task_state() {
        let (backend, store, service, mut rx) = service();
        let ids = store.add(vec![ImportedFile::new("/photos/a.png")]);
        store.update(ids[0], |t| {
            Some(t.start().complete(Some(PathBuf::from("/photos/a_compressed.png")), None))
        });
        backend.state().copy_error = Some(BackendError::Remote {
            method: "copy_file".to_string(),
            code: None,
            message: "Source file is empty".to_string(),
        });

        let err = service
            .export_output(ids[0], Path::new("/downloads/a.png"))
            .await
            .unwrap_err();
        assert!(matches!(err, FileError::SourceEmpty { .. }));

        let task = store.get(ids[0]).unwrap();
        assert!(task.error.is_none());
        assert!(matches!(rx.try_recv(), Ok(AppEvent::ErrorOccurred(_))));
        assert!(backend.state().opened.is_empty());
    }

    #[tokio::test]
    async fn test_export_without_output() {
        let (_backend, store, service, _rx) = service();
        let ids = store.add(vec![ImportedFile::new("a.png")]);
        let err = service
            .export_output(ids[0], Path::new("/downloads/a.png"))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            FileError::NoOutput {
                name: "a.png".to_string()
            }
        );
    }
}
