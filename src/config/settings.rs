//! Recorder settings
//!
//! Process-wide settings loaded from a JSON document. Every field has a
//! default, so `{}` is a valid settings file.

use crate::utils::error::{RecorderError, RecorderResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// How a crashed subprocess is relaunched
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum RestartPolicy {
    /// Same delay before every relaunch, forever
    #[serde(rename_all = "camelCase")]
    Fixed { delay_secs: f64 },
    /// Delay doubles per consecutive failure up to `max_secs`
    #[serde(rename_all = "camelCase")]
    CappedExponential { initial_secs: f64, max_secs: f64 },
}

impl Default for RestartPolicy {
    fn default() -> Self {
        RestartPolicy::Fixed { delay_secs: 2.0 }
    }
}

impl RestartPolicy {
    /// Delay before relaunch number `attempt` (0-based count of consecutive failures)
    pub fn delay(&self, attempt: u32) -> Duration {
        match *self {
            RestartPolicy::Fixed { delay_secs } => Duration::from_secs_f64(delay_secs),
            RestartPolicy::CappedExponential {
                initial_secs,
                max_secs,
            } => {
                let factor = 2f64.powi(attempt.min(30) as i32);
                Duration::from_secs_f64((initial_secs * factor).min(max_secs))
            }
        }
    }
}

/// Upper bound for window and timing values, one day
const MAX_WINDOW_SECONDS: f64 = 86_400.0;

/// Recorder configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RecorderSettings {
    /// Root for per-camera segment scratch directories
    pub scratch_dir: PathBuf,
    /// Root for per-camera, per-day clip directories
    pub recordings_dir: PathBuf,
    /// ffmpeg-compatible binary used for all three tools
    pub ffmpeg_path: PathBuf,
    /// RTSP transport for `rtsp://` inputs
    pub rtsp_transport: String,
    pub segment_seconds: f64,
    /// Ring buffer window
    pub pre_roll_seconds: f64,
    pub post_seconds: f64,
    /// Used when a camera does not set its own
    pub min_motion_seconds: f64,
    /// Used when a camera does not set its own
    pub cooldown_seconds: f64,
    /// Scene-change score at or above which a frame counts as motion
    pub scene_threshold: f64,
    pub restart_policy: RestartPolicy,
    /// `None` waits on the concatenation tool indefinitely
    pub concat_timeout_seconds: Option<f64>,
    pub stop_grace_seconds: f64,
    pub scratch_retention_seconds: f64,
    pub stale_stream_seconds: f64,
}

impl Default for RecorderSettings {
    fn default() -> Self {
        Self {
            scratch_dir: PathBuf::from("./data/scratch"),
            recordings_dir: PathBuf::from("./data/recordings"),
            ffmpeg_path: PathBuf::from("ffmpeg"),
            rtsp_transport: "tcp".to_string(),
            segment_seconds: 1.0,
            pre_roll_seconds: 12.0,
            post_seconds: 2.0,
            min_motion_seconds: 2.0,
            cooldown_seconds: 5.0,
            scene_threshold: 0.3,
            restart_policy: RestartPolicy::default(),
            concat_timeout_seconds: Some(120.0),
            stop_grace_seconds: 5.0,
            scratch_retention_seconds: 300.0,
            stale_stream_seconds: 10.0,
        }
    }
}

impl RecorderSettings {
    /// Load settings from a JSON file
    pub fn load(path: &Path) -> RecorderResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let settings: RecorderSettings = serde_json::from_str(&content)?;
        settings.validate()?;

        tracing::debug!("Loaded recorder settings from {:?}", path);
        Ok(settings)
    }

    /// Reject settings the pipeline cannot run with
    pub fn validate(&self) -> RecorderResult<()> {
        let positive = [
            ("segmentSeconds", self.segment_seconds),
            ("preRollSeconds", self.pre_roll_seconds),
            ("stopGraceSeconds", self.stop_grace_seconds),
            ("scratchRetentionSeconds", self.scratch_retention_seconds),
            ("staleStreamSeconds", self.stale_stream_seconds),
        ];
        for (name, value) in positive {
            if !(value.is_finite() && value > 0.0) {
                return Err(RecorderError::Config(format!(
                    "{name} must be positive, got {value}"
                )));
            }
        }

        let non_negative = [
            ("postSeconds", self.post_seconds),
            ("minMotionSeconds", self.min_motion_seconds),
            ("cooldownSeconds", self.cooldown_seconds),
        ];
        for (name, value) in non_negative {
            if !(value.is_finite() && value >= 0.0) {
                return Err(RecorderError::Config(format!(
                    "{name} must not be negative, got {value}"
                )));
            }
        }

        let timed = [
            ("segmentSeconds", self.segment_seconds),
            ("preRollSeconds", self.pre_roll_seconds),
            ("postSeconds", self.post_seconds),
            ("minMotionSeconds", self.min_motion_seconds),
            ("cooldownSeconds", self.cooldown_seconds),
            ("staleStreamSeconds", self.stale_stream_seconds),
            ("stopGraceSeconds", self.stop_grace_seconds),
        ];
        for (name, value) in timed {
            if value > MAX_WINDOW_SECONDS {
                return Err(RecorderError::Config(format!(
                    "{name} must be at most {MAX_WINDOW_SECONDS}, got {value}"
                )));
            }
        }

        // Sweeping must never reach footage the next clip may still need
        let needed = self.pre_roll_seconds + self.post_seconds;
        if self.scratch_retention_seconds < needed {
            return Err(RecorderError::Config(format!(
                "scratchRetentionSeconds must be at least preRollSeconds + postSeconds ({needed}), got {}",
                self.scratch_retention_seconds
            )));
        }

        if !(self.scene_threshold > 0.0 && self.scene_threshold <= 1.0) {
            return Err(RecorderError::Config(format!(
                "sceneThreshold must be in (0, 1], got {}",
                self.scene_threshold
            )));
        }

        if let Some(timeout) = self.concat_timeout_seconds {
            if !(timeout.is_finite() && timeout > 0.0) {
                return Err(RecorderError::Config(format!(
                    "concatTimeoutSeconds must be positive, got {timeout}"
                )));
            }
        }

        let delays_ok = match self.restart_policy {
            RestartPolicy::Fixed { delay_secs } => delay_secs.is_finite() && delay_secs >= 0.0,
            RestartPolicy::CappedExponential {
                initial_secs,
                max_secs,
            } => initial_secs.is_finite() && initial_secs > 0.0 && max_secs >= initial_secs,
        };
        if !delays_ok {
            return Err(RecorderError::Config(format!(
                "invalid restartPolicy: {:?}",
                self.restart_policy
            )));
        }

        Ok(())
    }

    pub fn concat_timeout(&self) -> Option<Duration> {
        self.concat_timeout_seconds.map(Duration::from_secs_f64)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs_f64(self.stop_grace_seconds)
    }

    pub fn scratch_retention(&self) -> Duration {
        Duration::from_secs_f64(self.scratch_retention_seconds)
    }

    /// Scratch directory for one camera
    pub fn camera_scratch_dir(&self, camera_id: &str) -> PathBuf {
        self.scratch_dir.join(camera_id)
    }

    /// Clip root for one camera
    pub fn camera_recordings_dir(&self, camera_id: &str) -> PathBuf {
        self.recordings_dir.join(camera_id)
    }
}
