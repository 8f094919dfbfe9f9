//! Scene-change detector
//!
//! The detector tool prints a structured record for every frame whose
//! scene-change score reaches the threshold:
//!
//! ```text
//! frame:41   pts:164000  pts_time:1.64
//! lavfi.scene_score=0.412000
//! ```
//!
//! Records are parsed into [`SceneEvent`]s and forwarded to the camera's
//! event loop as motion signals.

use super::ffmpeg::{self, ToolInvocation, SCENE_SCORE_KEY};
use super::pipeline::PipelineInput;
use super::status::SharedStatus;
use super::supervisor::SupervisedTask;
use crate::config::RecorderSettings;
use async_trait::async_trait;
use chrono::Utc;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;

/// One scored frame reported by the detector
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SceneEvent {
    /// Stream timestamp of the frame, when the header line was seen
    pub pts_time: Option<f64>,
    pub score: f64,
}

/// Line-oriented parser for detector output
#[derive(Debug, Default)]
pub struct SceneScoreParser {
    pending_pts: Option<f64>,
}

impl SceneScoreParser {
    /// Feed one line; returns an event when a score record completes
    pub fn feed(&mut self, line: &str) -> Option<SceneEvent> {
        let line = line.trim();

        if line.starts_with("frame:") {
            self.pending_pts = line
                .split_whitespace()
                .find_map(|field| field.strip_prefix("pts_time:"))
                .and_then(|v| v.parse().ok());
            return None;
        }

        let value = line.strip_prefix(SCENE_SCORE_KEY)?.strip_prefix('=')?;
        let score: f64 = value.trim().parse().ok()?;
        if !score.is_finite() {
            return None;
        }

        Some(SceneEvent {
            pts_time: self.pending_pts.take(),
            score,
        })
    }
}

/// Supervised scene-change detector for one camera
pub struct DetectorTask {
    settings: Arc<RecorderSettings>,
    stream_address: String,
    status: SharedStatus,
    inputs: mpsc::Sender<PipelineInput>,
}

impl DetectorTask {
    pub fn new(
        settings: Arc<RecorderSettings>,
        stream_address: String,
        status: SharedStatus,
        inputs: mpsc::Sender<PipelineInput>,
    ) -> Self {
        Self {
            settings,
            stream_address,
            status,
            inputs,
        }
    }
}

#[async_trait]
impl SupervisedTask for DetectorTask {
    fn name(&self) -> &'static str {
        "detector"
    }

    fn invocation(&mut self) -> ToolInvocation {
        ffmpeg::detector(&self.settings, &self.stream_address)
    }

    fn configure(&self, command: &mut Command) {
        command.stdout(Stdio::piped());
    }

    async fn run(&mut self, child: &mut Child) -> std::io::Result<ExitStatus> {
        let stdout = child.stdout.take().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::Other, "detector stdout not captured")
        })?;

        let mut lines = BufReader::new(stdout).lines();
        let mut parser = SceneScoreParser::default();

        while let Some(line) = lines.next_line().await? {
            let Some(event) = parser.feed(&line) else {
                continue;
            };
            if event.score < self.settings.scene_threshold {
                continue;
            }

            let signal = PipelineInput::Motion {
                at: Utc::now(),
                score: event.score,
            };
            if self.inputs.send(signal).await.is_err() {
                // Event loop is gone; the pipeline is shutting down
                break;
            }
        }

        child.wait().await
    }

    fn on_exit(&mut self) {
        self.status.write().detector_restarts += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parses_header_and_score() {
        let mut parser = SceneScoreParser::default();
        assert_eq!(parser.feed("frame:41   pts:164000  pts_time:1.64"), None);
        let event = parser.feed("lavfi.scene_score=0.412000").unwrap();
        assert_eq!(event.score, 0.412);
        assert_eq!(event.pts_time, Some(1.64));
    }

    #[test]
    fn test_score_without_header() {
        let mut parser = SceneScoreParser::default();
        let event = parser.feed("lavfi.scene_score=0.9").unwrap();
        assert_eq!(event.pts_time, None);
    }

    #[test]
    fn test_header_is_consumed_once() {
        let mut parser = SceneScoreParser::default();
        parser.feed("frame:1 pts:10 pts_time:0.1");
        parser.feed("lavfi.scene_score=0.5");
        let second = parser.feed("lavfi.scene_score=0.6").unwrap();
        assert_eq!(second.pts_time, None);
    }

    #[test]
    fn test_ignores_noise() {
        let mut parser = SceneScoreParser::default();
        assert_eq!(parser.feed(""), None);
        assert_eq!(parser.feed("[rtsp @ 0x55] method SETUP failed: 461"), None);
        assert_eq!(parser.feed("lavfi.scene_score=abc"), None);
        assert_eq!(parser.feed("lavfi.scene_score_other=0.5"), None);
        assert_eq!(parser.feed("lavfi.scene_score=NaN"), None);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_only_scores_at_threshold_become_motion() {
        use crate::recorder::status::CameraStatus;
        use parking_lot::RwLock;

        let settings = Arc::new(RecorderSettings {
            scene_threshold: 0.3,
            ..Default::default()
        });
        let status: SharedStatus = Arc::new(RwLock::new(CameraStatus::default()));
        let (inputs_tx, mut inputs_rx) = mpsc::channel(8);
        let mut task = DetectorTask::new(
            settings,
            "rtsp://127.0.0.1:9/none".to_string(),
            status.clone(),
            inputs_tx,
        );

        let script = "printf 'frame:1 pts:1 pts_time:0.1\\nlavfi.scene_score=0.1\\n\
                      frame:2 pts:2 pts_time:0.2\\nlavfi.scene_score=0.3\\n\
                      frame:3 pts:3 pts_time:0.3\\nlavfi.scene_score=0.75\\n'";
        let mut command = Command::new("sh");
        command.arg("-c").arg(script);
        task.configure(&mut command);
        let mut child = command.spawn().unwrap();

        let exit = task.run(&mut child).await.unwrap();
        assert!(exit.success());
        task.on_exit();
        drop(task);

        let mut scores = Vec::new();
        while let Some(input) = inputs_rx.recv().await {
            match input {
                PipelineInput::Motion { score, .. } => scores.push(score),
                other => panic!("unexpected input {:?}", other),
            }
        }
        assert_eq!(scores, vec![0.3, 0.75]);
        assert_eq!(status.read().detector_restarts, 1);
    }
}
