use anyhow::{ensure, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

mod action;
mod monitor;
mod pidfile;
mod preview;
mod settings;

use action::ActionExecutor;
use facewatch_core::{FaceApiClient, ImageRef, ModelStore, ScrfdDetector};
use facewatch_hw::{Camera, ImageSource};
use monitor::{MonitorConfig, PresenceMonitor, SessionEnd};
use pidfile::PidFile;
use preview::{FrameSink, NullSink, PreviewWriter};
use settings::Settings;

#[derive(Parser)]
#[command(
    name = "facewatch",
    about = "Webcam presence monitor — locks the workstation when you leave"
)]
struct Cli {
    /// Settings file (default: $XDG_CONFIG_HOME/facewatch/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enroll the reference face from an image file or URL
    Enroll {
        /// Path or HTTP(S) URL of a photo showing exactly your face
        image: String,
    },
    /// Watch the webcam and fire the trigger action on sustained absence
    Monitor {
        /// Fire the action after this many seconds without a verified face
        #[arg(short = 't', long, default_value_t = 30.0)]
        trigger_seconds: f64,

        /// Target spacing between evaluated frames
        #[arg(long, alias = "sleep-seconds", default_value_t = 1.0)]
        sample_interval_seconds: f64,

        /// Minimum verification confidence counted as a match
        /// (default taken from settings)
        #[arg(long)]
        confidence_threshold: Option<f32>,

        /// Write an annotated preview frame for external viewers
        #[arg(long)]
        display: bool,

        /// Keep monitoring after the action fires instead of exiting
        #[arg(long, alias = "always")]
        continue_after_trigger: bool,

        /// Command to run on trigger instead of locking the screen
        /// (repeatable)
        #[arg(long = "exec", value_name = "COMMAND")]
        exec: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let settings = Settings::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Enroll { image } => run_enroll(&settings, &image).await,
        Commands::Monitor {
            trigger_seconds,
            sample_interval_seconds,
            confidence_threshold,
            display,
            continue_after_trigger,
            exec,
        } => {
            ensure!(trigger_seconds > 0.0, "--trigger-seconds must be positive");
            ensure!(
                sample_interval_seconds > 0.0,
                "--sample-interval-seconds must be positive"
            );

            let config = MonitorConfig {
                sample_interval: Duration::from_secs_f64(sample_interval_seconds),
                trigger_after: Duration::from_secs_f64(trigger_seconds),
                confidence_threshold: confidence_threshold
                    .unwrap_or(settings.api.confidence_threshold),
                continue_after_trigger,
                display_overlay: display,
            };
            run_monitor(&settings, config, exec).await
        }
    }
}

async fn run_enroll(settings: &Settings, image: &str) -> Result<()> {
    settings.require_api()?;
    let client = FaceApiClient::new(&settings.api.endpoint, &settings.api.key);

    let image = ImageRef::parse(image);
    let model = facewatch_core::enroll(&client, &image).await?;

    let store = ModelStore::new(&settings.storage.model_file);
    store.save(&model)?;

    println!("Enrolled reference face from {image}");
    println!("Model written to {}", store.path().display());
    Ok(())
}

async fn run_monitor(settings: &Settings, config: MonitorConfig, exec: Vec<String>) -> Result<()> {
    settings.require_api()?;
    let _pid_guard = PidFile::acquire(&settings.storage.pid_file)?;

    // Everything fallible is resolved before the loop: model, fingerprint
    // freshness, trigger action, detector, camera.
    let store = ModelStore::new(&settings.storage.model_file);
    let model = store.load()?;

    let client = FaceApiClient::new(&settings.api.endpoint, &settings.api.key);
    let was_stale = model.is_stale(Utc::now());
    let model = facewatch_core::refresh_if_stale(&client, model, Utc::now())
        .await
        .context("fingerprint refresh failed")?;
    if was_stale {
        store.save(&model)?;
    }

    let action = if exec.is_empty() {
        ActionExecutor::lock_screen()?
    } else {
        ActionExecutor::from_commands(exec)
    };

    let detector = ScrfdDetector::load(&settings.detector.model_path.to_string_lossy())?;

    let mut camera = Camera::open(&settings.camera.device)?;
    for _ in 0..settings.camera.warmup_frames {
        let _ = camera.grab();
    }

    let preview: Box<dyn FrameSink> = if config.display_overlay {
        Box::new(PreviewWriter::new(&settings.storage.preview_file))
    } else {
        Box::new(NullSink)
    };

    let cancel = CancellationToken::new();
    let signal_token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("stop requested, finishing current tick");
            signal_token.cancel();
        }
    });

    let mut session = PresenceMonitor {
        source: camera,
        detector,
        verifier: client,
        action,
        preview,
    };

    match session.run(&model, &config, &cancel).await? {
        SessionEnd::Triggered => tracing::info!("session ended after trigger"),
        SessionEnd::Cancelled => tracing::info!("session cancelled"),
    }
    Ok(())
}
