//! Motion Recorder - motion-triggered clips from networked cameras.
//!
//! Each camera runs a pipeline that keeps a short rolling buffer of stream
//! segments, watches a scene-change detector, and joins the buffered and
//! live segments into one clip per motion event. A fleet coordinator runs
//! one pipeline per enabled camera and forwards finished clips to a sink.

pub mod config;
pub mod fleet;
pub mod recorder;
pub mod utils;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

pub use config::{CameraConfig, RecorderSettings};
pub use fleet::{Fleet, RecordingLog, RecordingSink};
pub use utils::{RecorderError, RecorderResult};

/// Install the console logger, honouring `RUST_LOG` when set
pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "motion_recorder=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
