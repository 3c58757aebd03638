use crate::config::AppConfig;
use crate::events::{AppEvent, EventSender};
use crate::job::types::CompressMode;
use crate::services::Service;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("No config location available on this platform")]
    NoLocation,
    #[error("Config file {path} could not be accessed: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Config file is not valid JSON: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Owns the live [`AppConfig`] and its JSON file.
#[derive(Clone)]
pub struct ConfigService {
    current: Arc<RwLock<AppConfig>>,
    location: Option<PathBuf>,
    event_sender: EventSender,
}

impl ConfigService {
    pub fn new(event_sender: EventSender) -> Self {
        Self::with_path(event_sender, AppConfig::default_path())
    }

    pub fn with_path(event_sender: EventSender, location: Option<PathBuf>) -> Self {
        Self {
            current: Arc::new(RwLock::new(AppConfig::default())),
            location,
            event_sender,
        }
    }

    async fn read_file(path: &Path) -> Result<Option<AppConfig>, ConfigError> {
        let raw = match tokio::fs::read_to_string(path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(ConfigError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        Ok(Some(serde_json::from_str(&raw)?))
    }

    /// Replaces the live config with the file's content. Anything short of a
    /// readable, well-formed file leaves the defaults in place.
    pub async fn load_config(&self) -> AppConfig {
        let loaded = match &self.location {
            None => {
                tracing::warn!("{}; running with default settings", ConfigError::NoLocation);
                None
            }
            Some(path) => match Self::read_file(path).await {
                Ok(Some(config)) => {
                    tracing::info!("Settings read from {}", path.display());
                    Some(config)
                }
                Ok(None) => {
                    tracing::info!("No settings file at {}, starting fresh", path.display());
                    None
                }
                Err(e) => {
                    tracing::warn!("Ignoring settings file: {}", e);
                    None
                }
            },
        };

        let config = loaded.unwrap_or_default();
        *self.current.write().await = config.clone();
        self.send_event(AppEvent::ConfigLoaded);
        config
    }

    pub async fn save_config(&self) -> Result<(), ConfigError> {
        let path = self.location.as_deref().ok_or(ConfigError::NoLocation)?;
        let io_err = |source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        };

        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir).await.map_err(io_err)?;
        }
        let body = serde_json::to_string_pretty(&*self.current.read().await)?;
        tokio::fs::write(path, body).await.map_err(io_err)?;

        tracing::info!("Settings written to {}", path.display());
        self.send_event(AppEvent::ConfigSaved);
        Ok(())
    }

    pub async fn get_config(&self) -> AppConfig {
        self.current.read().await.clone()
    }

    pub async fn update_config(&self, edit: impl FnOnce(&mut AppConfig)) {
        edit(&mut *self.current.write().await);
        self.send_event(AppEvent::SettingsChanged);
    }

    pub async fn set_legacy_image_command(&self, enabled: bool) {
        if enabled {
            tracing::warn!("Legacy image command forced; the job API will be skipped");
        }
        self.update_config(|c| c.use_legacy_image_command = enabled)
            .await;
    }

    pub async fn set_output_dir(&self, dir: Option<PathBuf>) {
        self.update_config(|c| c.output_dir = dir).await;
    }

    pub async fn set_compress_mode(&self, mode: CompressMode) {
        self.update_config(|c| c.compress_mode = mode).await;
    }

    pub async fn reset_to_defaults(&self) {
        self.update_config(|c| *c = AppConfig::default()).await;
    }

    fn send_event(&self, event: AppEvent) {
        if let Err(e) = self.event_sender.send(event) {
            tracing::error!("Failed to send config event: {}", e);
        }
    }
}

#[async_trait::async_trait]
impl Service for ConfigService {
    async fn initialize(&self) -> Result<(), Box<dyn std::error::Error>> {
        self.load_config().await;
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), Box<dyn std::error::Error>> {
        Ok(self.save_config().await?)
    }
}
