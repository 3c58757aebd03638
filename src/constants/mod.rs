// App Constants
pub const APP_NAME: &str = "Cruncher";
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");
pub const CONFIG_DIR_NAME: &str = "cruncher";

// Backend push channel carrying job progress
pub const IMAGE_JOB_PROGRESS_EVENT: &str = "image-job-progress";
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

// Detail operation bounds
pub const RENDER_TIMEOUT_SECONDS: u64 = 120;
pub const CROP_TIMEOUT_SECONDS: u64 = 60;
pub const BACKEND_REQUEST_TIMEOUT_SECONDS: u64 = 30;

// Import
pub const IMPORT_BATCH_SIZE: usize = 8;

// File handling
pub const VIDEO_EXTENSIONS: &[&str] = &["mp4", "mkv", "avi", "mov", "webm", "flv", "wmv"];

// Output naming
pub const COMPRESSED_SUFFIX: &str = "_compressed";
pub const PREVIEW_FILE_PREFIX: &str = "cruncher_preview_";
pub const CROP_FILE_PREFIX: &str = "cruncher_crop_";
pub const SAFE_ID_MAX_LEN: usize = 50;

// Render defaults
pub const DEFAULT_RENDER_QUALITY: u8 = 80;
pub const DEFAULT_RENDER_WIDTH: u32 = 1920;
pub const DEFAULT_RENDER_HEIGHT: u32 = 1080;

// Notifications
pub const MAX_NOTIFICATIONS: usize = 32;
