use crate::bridge::Backend;
use crate::config::AppConfig;
use crate::events::{AppEvent, EventSender};
use crate::job::{DetailJobRunner, ImageJobClient};
use crate::state::TaskStore;
use std::path::PathBuf;
use std::sync::Arc;

pub mod compression_service;
pub mod config_service;
pub mod file_service;
pub mod validation_service;

pub use compression_service::CompressionService;
pub use config_service::ConfigService;
pub use file_service::FileService;
pub use validation_service::ValidationService;

#[derive(Clone)]
pub struct ServiceManager {
    pub compression: CompressionService,
    pub file: FileService,
    pub config: ConfigService,
    store: TaskStore,
    event_sender: EventSender,
}

impl ServiceManager {
    pub fn new(backend: Arc<dyn Backend>, event_sender: EventSender) -> Self {
        let config = ConfigService::new(event_sender.clone());
        Self::with_config(backend, event_sender, config)
    }

    pub fn with_config(
        backend: Arc<dyn Backend>,
        event_sender: EventSender,
        config: ConfigService,
    ) -> Self {
        let store = TaskStore::new();
        let client = ImageJobClient::new(backend.clone(), store.clone(), event_sender.clone());
        Self {
            compression: CompressionService::new(client, config.clone(), event_sender.clone()),
            file: FileService::new(backend, store.clone(), event_sender.clone()),
            config,
            store,
            event_sender,
        }
    }

    pub fn store(&self) -> &TaskStore {
        &self.store
    }

    /// Detail-view runner sharing the batch client, tuned from `config`.
    pub fn detail_runner(&self, config: &AppConfig) -> DetailJobRunner {
        let runner = DetailJobRunner::new(self.compression.client().clone(), std::env::temp_dir())
            .with_timeouts(config.render_timeout(), config.crop_timeout())
            .with_mode(config.compress_mode);
        runner.set_force_legacy(config.use_legacy_image_command);
        runner
    }

    pub async fn initialize(&self) -> Result<(), Box<dyn std::error::Error>> {
        self.config.initialize().await?;
        self.file.initialize().await?;
        self.compression.initialize().await?;

        Ok(())
    }

    pub async fn shutdown(&self) -> Result<(), Box<dyn std::error::Error>> {
        self.compression.shutdown().await?;
        self.file.shutdown().await?;
        if let Err(e) = self.config.shutdown().await {
            tracing::warn!("Config not persisted on shutdown: {}", e);
        }

        Ok(())
    }

    pub fn send_event(&self, event: AppEvent) {
        if let Err(e) = self.event_sender.send(event) {
            tracing::error!("Failed to send event: {}", e);
        }
    }
}

#[async_trait::async_trait]
pub trait Service {
    async fn initialize(&self) -> Result<(), Box<dyn std::error::Error>>;
    async fn shutdown(&self) -> Result<(), Box<dyn std::error::Error>>;
}
