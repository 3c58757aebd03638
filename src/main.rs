use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use cruncher::bridge::{Backend, IpcBridge};
use cruncher::classify::MediaKind;
use cruncher::constants::{APP_NAME, APP_VERSION};
use cruncher::events::{create_event_channel, AppEvent, EventReceiver};
use cruncher::job::types::{CompressMode, CropRegion};
use cruncher::job::{DetailJobRunner, RenderFormat, RenderSettings};
use cruncher::services::ServiceManager;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "cruncher", version, about = "Compress images and videos through a native backend")]
struct Cli {
    /// Backend sidecar executable; overrides the config file
    #[arg(long, global = true)]
    backend: Option<String>,

    /// Directory for compressed outputs (defaults to next to each source)
    #[arg(long, global = true)]
    output_dir: Option<PathBuf>,

    #[arg(long, global = true)]
    mode: Option<CompressMode>,

    /// Skip the job API and run the per-file command
    #[arg(long, global = true)]
    legacy: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Compress the given files
    Run {
        #[arg(required = true)]
        paths: Vec<PathBuf>,
        #[arg(long, value_enum)]
        kind: Option<KindArg>,
    },
    /// Compress every image in a folder
    Folder { dir: PathBuf },
    /// Crop one image into a temporary file
    Crop {
        path: PathBuf,
        /// Region as x,y,width,height
        #[arg(long, value_parser = parse_crop)]
        region: CropRegion,
    },
    /// Render a preview of one image
    Render {
        path: PathBuf,
        #[arg(long, default_value_t = 80)]
        quality: u8,
        #[arg(long, default_value = "auto")]
        format: RenderFormat,
        #[arg(long, default_value_t = 1920)]
        width: u32,
        #[arg(long, default_value_t = 1080)]
        height: u32,
        #[arg(long, value_parser = parse_crop)]
        crop: Option<CropRegion>,
    },
    /// Check whether the backend can compress video
    Probe,
}

#[derive(Clone, Copy, ValueEnum)]
enum KindArg {
    Image,
    Video,
}

impl From<KindArg> for MediaKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Image => MediaKind::Image,
            KindArg::Video => MediaKind::Video,
        }
    }
}

fn parse_crop(s: &str) -> Result<CropRegion, String> {
    let parts = s
        .split(',')
        .map(|p| p.trim().parse::<u32>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| format!("invalid crop region: {}", e))?;
    match parts.as_slice() {
        [x, y, width, height] => Ok(CropRegion {
            x: *x,
            y: *y,
            width: *width,
            height: *height,
        }),
        _ => Err("crop region needs four values: x,y,width,height".to_string()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("cruncher=info")),
        )
        .init();

    let cli = Cli::parse();
    tracing::info!("Starting {} {}", APP_NAME, APP_VERSION);

    let (event_sender, event_receiver) = create_event_channel();
    tokio::spawn(log_events(event_receiver));

    let config_service = cruncher::services::ConfigService::new(event_sender.clone());
    let mut config = config_service.load_config().await;
    if let Some(dir) = cli.output_dir.clone() {
        config.output_dir = Some(dir);
    }
    if let Some(mode) = cli.mode {
        config.compress_mode = mode;
    }
    if cli.legacy {
        config.use_legacy_image_command = true;
    }
    if let Some(backend) = cli.backend.clone() {
        config.backend_command = Some(backend);
    }
    let overrides = config.clone();
    config_service
        .update_config(move |current| *current = overrides)
        .await;

    let command = config
        .backend_command
        .clone()
        .ok_or_else(|| anyhow!("No backend configured; pass --backend or set backend_command"))?;
    let bridge = Arc::new(
        IpcBridge::spawn(&command, &config.backend_args)
            .with_context(|| format!("Failed to start backend {}", command))?,
    );
    let backend: Arc<dyn Backend> = bridge.clone();

    let manager = ServiceManager::with_config(backend, event_sender, config_service);
    let detail = manager.detail_runner(&config);

    let work = run_command(&manager, &detail, cli.command);
    tokio::pin!(work);
    let result = tokio::select! {
        result = &mut work => result,
        _ = tokio::signal::ctrl_c() => {
            tracing::warn!("Interrupted, cancelling active work");
            manager.compression.cancel_active().await;
            detail.cancel().await;
            work.await
        }
    };

    bridge.shutdown().await;
    tracing::info!("{} shutting down", APP_NAME);
    result
}

async fn run_command(
    manager: &ServiceManager,
    detail: &DetailJobRunner,
    command: Command,
) -> Result<()> {
    match command {
        Command::Run { paths, kind } => {
            let ids = manager.file.import_paths(paths).await;
            if ids.is_empty() {
                return Err(anyhow!("Nothing to compress"));
            }
            let kinds = match kind {
                Some(kind) => vec![kind.into()],
                None => vec![MediaKind::Image, MediaKind::Video],
            };
            for kind in kinds {
                if manager.store().runnable(kind).is_empty() {
                    continue;
                }
                let report = manager.compression.run_selected_by_kind(kind).await?;
                println!(
                    "{}: {} done, {} failed, {} cancelled{}",
                    kind,
                    report.done,
                    report.failed,
                    report.cancelled,
                    if report.used_fallback { " (legacy)" } else { "" }
                );
            }
            print_failures(manager);
        }
        Command::Folder { dir } => {
            let ids = manager.file.import_folder(&dir).await;
            if ids.is_empty() {
                return Err(anyhow!("No images found in {}", dir.display()));
            }
            let report = manager
                .compression
                .run_selected_by_kind(MediaKind::Image)
                .await?;
            println!(
                "{} images: {} done, {} failed, {} cancelled",
                report.total, report.done, report.failed, report.cancelled
            );
            print_failures(manager);
        }
        Command::Crop { path, region } => {
            let id = single_task(manager, path).await?;
            let cropped = detail
                .apply_crop(id, region)
                .await
                .map_err(|e| anyhow!(e.user_message()))?;
            println!("{}", cropped.display());
        }
        Command::Render {
            path,
            quality,
            format,
            width,
            height,
            crop,
        } => {
            let id = single_task(manager, path).await?;
            let settings = RenderSettings::new(quality, format, width, height);
            let preview = detail
                .render(id, settings, crop)
                .await
                .map_err(|e| anyhow!(e.user_message()))?;
            println!("{}", preview.display());
        }
        Command::Probe => {
            let check = manager.compression.probe_ffmpeg().await;
            if check.available {
                println!("ffmpeg {} at {}", check.version, check.path);
            } else {
                println!("ffmpeg not available");
            }
        }
    }
    Ok(())
}

async fn single_task(manager: &ServiceManager, path: PathBuf) -> Result<uuid::Uuid> {
    manager
        .file
        .import_paths(vec![path.clone()])
        .await
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("Could not import {}", path.display()))
}

fn print_failures(manager: &ServiceManager) {
    for task in manager.store().snapshot().iter() {
        if let Some(error) = &task.error {
            eprintln!("{}: {}", task.name, error);
        }
    }
}

async fn log_events(mut receiver: EventReceiver) {
    while let Some(event) = receiver.recv().await {
        match event {
            AppEvent::ErrorOccurred(message) => tracing::error!("{}", message),
            AppEvent::JobFallback { total } => {
                tracing::warn!("Job API unavailable, running {} files one by one", total)
            }
            AppEvent::BatchProgress(progress) => {
                tracing::info!("Progress {}/{}", progress.current, progress.total)
            }
            AppEvent::Notification(notification) => tracing::info!(
                "{} {:?} for task {}",
                notification.kind.label(),
                notification.outcome,
                notification.task_id
            ),
            other => tracing::debug!("{:?}", other),
        }
    }
}
