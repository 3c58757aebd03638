use crate::classify::MediaKind;
use crate::job::detail::Notification;
use crate::job::types::JobStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchProgress {
    pub current: usize,
    pub total: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AppEvent {
    // Import events
    ImportProgress {
        current: usize,
        total: usize,
    },

    // Batch run events
    BatchStarted {
        kind: MediaKind,
        total: usize,
    },
    BatchProgress(BatchProgress),
    BatchFinished {
        kind: MediaKind,
        done: usize,
        failed: usize,
        cancelled: usize,
    },

    // Job pipeline events
    JobSubmitted {
        job_id: String,
        total: usize,
    },
    JobFallback {
        total: usize,
    },
    JobReconciled {
        job_id: String,
        status: JobStatus,
    },
    JobSettled {
        job_id: Option<String>,
    },
    Notification(Notification),

    // Capability probe
    FfmpegStatus {
        available: bool,
        version: String,
    },

    // Config events
    ConfigLoaded,
    ConfigSaved,
    SettingsChanged,

    // Error events
    ErrorOccurred(String),
}

pub type EventSender = tokio::sync::mpsc::UnboundedSender<AppEvent>;
pub type EventReceiver = tokio::sync::mpsc::UnboundedReceiver<AppEvent>;

pub fn create_event_channel() -> (EventSender, EventReceiver) {
    tokio::sync::mpsc::unbounded_channel()
}
