use crate::constants::{CONFIG_DIR_NAME, CROP_TIMEOUT_SECONDS, RENDER_TIMEOUT_SECONDS};
use crate::job::types::CompressMode;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub output_dir: Option<PathBuf>,
    pub compress_mode: CompressMode,
    /// Operational rollback switch: always use the single-shot command.
    #[serde(rename = "useLegacyImageCommand")]
    pub use_legacy_image_command: bool,
    pub backend_command: Option<String>,
    pub backend_args: Vec<String>,
    pub render_timeout_secs: u64,
    pub crop_timeout_secs: u64,
    pub max_concurrency: Option<usize>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            output_dir: None,
            compress_mode: CompressMode::default(),
            use_legacy_image_command: false,
            backend_command: None,
            backend_args: Vec::new(),
            render_timeout_secs: RENDER_TIMEOUT_SECONDS,
            crop_timeout_secs: CROP_TIMEOUT_SECONDS,
            max_concurrency: None,
        }
    }
}

impl AppConfig {
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join(CONFIG_DIR_NAME).join("config.json"))
    }

    pub fn render_timeout(&self) -> Duration {
        Duration::from_secs(self.render_timeout_secs.max(1))
    }

    pub fn crop_timeout(&self) -> Duration {
        Duration::from_secs(self.crop_timeout_secs.max(1))
    }
}
