use anyhow::Context;
use clap::{Parser, Subcommand};
use motion_recorder::config::{JsonFileSource, RecorderSettings};
use motion_recorder::fleet::{run_test_once, Fleet, RecordingLog};
use motion_recorder::utils::error::ErrorResponse;
use motion_recorder::RecorderError;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Parser)]
#[command(version, about = "Record motion-triggered clips from networked cameras")]
struct Cli {
    /// Recorder settings (JSON); defaults apply when omitted
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Camera list (JSON array)
    #[arg(long)]
    cameras: PathBuf,

    /// Where finalized recordings are logged, one JSON record per line
    #[arg(long, default_value = "./data/recordings.jsonl")]
    recordings_log: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run every enabled camera until interrupted
    Run {
        /// Re-read the camera list this often
        #[arg(long, default_value_t = 60)]
        refresh_secs: u64,

        /// Log a status line per camera this often
        #[arg(long, default_value_t = 30)]
        status_secs: u64,
    },
    /// Capture a short clip from one camera to check connectivity
    TestClip {
        camera_id: String,

        #[arg(long, default_value_t = 3)]
        duration: u32,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    motion_recorder::init_tracing();

    let cli = Cli::parse();
    tracing::info!("Starting motion-recorder v{}", env!("CARGO_PKG_VERSION"));

    let settings = match &cli.settings {
        Some(path) => RecorderSettings::load(path)
            .with_context(|| format!("failed to load settings from {}", path.display()))?,
        None => RecorderSettings::default(),
    };
    let settings = Arc::new(settings);
    let source = Arc::new(JsonFileSource::new(&cli.cameras));
    let sink = Arc::new(RecordingLog::new(&cli.recordings_log));

    match cli.command {
        Command::Run {
            refresh_secs,
            status_secs,
        } => {
            let fleet = Fleet::launch(settings, source, sink)
                .await
                .context("failed to launch fleet")?;
            run(&fleet, refresh_secs, status_secs).await;
            fleet.shutdown().await;
        }
        Command::TestClip {
            camera_id,
            duration,
        } => {
            let result = run_test_once(&settings, source.as_ref(), &camera_id, duration).await;
            report_test_clip(result)?;
        }
    }

    Ok(())
}

async fn run(fleet: &Fleet, refresh_secs: u64, status_secs: u64) {
    let mut refresh = tokio::time::interval(Duration::from_secs(refresh_secs.max(1)));
    let mut status = tokio::time::interval(Duration::from_secs(status_secs.max(1)));
    // Both fire immediately; the fleet was just refreshed by launch
    refresh.tick().await;
    status.tick().await;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted, shutting down");
                break;
            }
            _ = refresh.tick() => match fleet.refresh_configs().await {
                Ok(0) => {}
                Ok(n) => tracing::info!("Started {} new camera pipeline(s)", n),
                Err(e) => tracing::warn!("Failed to refresh camera list: {}", e),
            },
            _ = status.tick() => {
                for report in fleet.get_statuses().await {
                    tracing::info!(
                        camera_id = %report.id,
                        connected = report.status.stream_connected,
                        state = ?report.status.motion_state,
                        last_seen = ?report.status.last_seen,
                        last_motion_at = ?report.status.last_motion_at,
                        disk_free_gb = ?report.disk_free_gb,
                        clips = report.status.recordings_finalized,
                        "Camera status"
                    );
                }
            }
        }
    }
}

fn report_test_clip(result: Result<PathBuf, RecorderError>) -> anyhow::Result<()> {
    match result {
        Ok(path) => {
            println!("{}", path.display());
            Ok(())
        }
        Err(e) => {
            let response = ErrorResponse::from(e);
            let rendered = serde_json::to_string(&response)?;
            eprintln!("{}", rendered);
            anyhow::bail!("test clip failed: {}", response.message)
        }
    }
}
