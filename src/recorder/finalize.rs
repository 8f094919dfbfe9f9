//! Clip finalization
//!
//! Joins an event's segments into one durable clip, and captures the
//! on-demand test clips used to check camera connectivity.

use super::ffmpeg::{self, MANIFEST_PREFIX};
use super::segments::Segment;
use crate::config::{CameraConfig, RecorderSettings};
use crate::utils::error::{stderr_tail, RecorderError, RecorderResult};
use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

/// Extra time a test capture gets on top of its clip length
const TEST_CLIP_SLACK: Duration = Duration::from_secs(20);

/// A finished clip, handed to the recording sink exactly once
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordingEvent {
    pub camera_id: String,
    pub file_path: PathBuf,
    pub started_at: DateTime<Utc>,
}

/// What produced a clip; used as the file-name suffix
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClipKind {
    Event,
    Test,
}

impl ClipKind {
    pub fn suffix(&self) -> &'static str {
        match self {
            ClipKind::Event => "event",
            ClipKind::Test => "test",
        }
    }
}

/// `<recordings>/<camera>/<YYYY-MM-DD>/<HH-MM-SS>_<kind>.mp4`, in local time
pub fn clip_path(
    settings: &RecorderSettings,
    camera_id: &str,
    at: DateTime<Utc>,
    kind: ClipKind,
) -> PathBuf {
    numbered_clip_path(settings, camera_id, at, kind, 0)
}

/// `clip_path` with `-<n>` after the time of day when `n > 0`
fn numbered_clip_path(
    settings: &RecorderSettings,
    camera_id: &str,
    at: DateTime<Utc>,
    kind: ClipKind,
    n: u32,
) -> PathBuf {
    let local = at.with_timezone(&Local);
    let time = local.format("%H-%M-%S");
    let name = match n {
        0 => format!("{}_{}.mp4", time, kind.suffix()),
        n => format!("{}-{}_{}.mp4", time, n, kind.suffix()),
    };
    settings
        .camera_recordings_dir(camera_id)
        .join(local.format("%Y-%m-%d").to_string())
        .join(name)
}

/// First clip path for `at` that does not exist yet.
///
/// Two clips in the same second, or in the hour repeated when clocks go
/// back, would otherwise share a name.
pub async fn unused_clip_path(
    settings: &RecorderSettings,
    camera_id: &str,
    at: DateTime<Utc>,
    kind: ClipKind,
) -> PathBuf {
    let mut n = 0;
    loop {
        let path = numbered_clip_path(settings, camera_id, at, kind, n);
        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return path;
        }
        n += 1;
    }
}

/// Segments collected for one motion event
#[derive(Debug, Clone, PartialEq)]
pub struct EventCapture {
    pub started_at: DateTime<Utc>,
    /// Pre-roll first, then everything observed while the event was open
    pub segments: Vec<Segment>,
}

impl EventCapture {
    pub fn open(started_at: DateTime<Utc>, pre_roll: Vec<Segment>) -> Self {
        Self {
            started_at,
            segments: pre_roll,
        }
    }

    pub fn push(&mut self, segment: Segment) {
        self.segments.push(segment);
    }

    pub fn duration_secs(&self) -> f64 {
        self.segments.iter().map(|s| s.duration_secs).sum()
    }
}

/// Concatenate an event's segments into a clip.
///
/// Fails without producing an event when there is nothing to join, the
/// tool exits non-zero or times out, or no output file appears.
pub async fn finalize_recording(
    settings: &RecorderSettings,
    camera_id: &str,
    scratch_dir: &Path,
    capture: EventCapture,
) -> RecorderResult<RecordingEvent> {
    let mut segments = Vec::with_capacity(capture.segments.len());
    for segment in capture.segments {
        if tokio::fs::try_exists(&segment.file_path).await.unwrap_or(false) {
            segments.push(segment);
        } else {
            tracing::warn!(
                camera_id = %camera_id,
                "Segment vanished before finalize: {:?}",
                segment.file_path
            );
        }
    }

    if segments.is_empty() {
        return Err(RecorderError::Process(format!(
            "no segments to join for event at {}",
            capture.started_at
        )));
    }

    let output = unused_clip_path(settings, camera_id, capture.started_at, ClipKind::Event).await;
    if let Some(parent) = output.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let manifest = scratch_dir.join(format!(
        "{}{}.txt",
        MANIFEST_PREFIX,
        capture.started_at.timestamp_millis()
    ));
    ffmpeg::write_concat_manifest(&manifest, &segments).await?;

    tracing::info!(
        camera_id = %camera_id,
        segments = segments.len(),
        "Joining clip into {:?}",
        output
    );

    let invocation = ffmpeg::concat(settings, &manifest, &output);
    let mut command = invocation.command();
    command.stdin(Stdio::null()).stderr(Stdio::piped());
    let child = command
        .spawn()
        .map_err(|e| RecorderError::Process(format!("failed to start concatenation: {}", e)));

    let result = match child {
        Ok(child) => match settings.concat_timeout() {
            // Dropping the timed-out future drops the child, which kills it
            Some(limit) => tokio::time::timeout(limit, child.wait_with_output())
                .await
                .unwrap_or_else(|_| {
                    Err(std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        format!("concatenation exceeded {:?}", limit),
                    ))
                }),
            None => child.wait_with_output().await,
        }
        .map_err(|e| RecorderError::Process(format!("concatenation failed: {}", e))),
        Err(e) => Err(e),
    };

    if let Err(e) = tokio::fs::remove_file(&manifest).await {
        tracing::debug!("Failed to remove manifest {:?}: {}", manifest, e);
    }

    let output_status = result?;
    if !output_status.status.success() {
        return Err(RecorderError::Process(format!(
            "concatenation exited with {}: {}",
            output_status.status,
            stderr_tail(&output_status.stderr)
        )));
    }

    if !tokio::fs::try_exists(&output).await.unwrap_or(false) {
        return Err(RecorderError::Process(format!(
            "concatenation produced no file at {:?}",
            output
        )));
    }

    Ok(RecordingEvent {
        camera_id: camera_id.to_string(),
        file_path: output,
        started_at: capture.started_at,
    })
}

/// Capture `duration_secs` of the live stream straight into a test clip
pub async fn capture_test_clip(
    settings: &RecorderSettings,
    camera: &CameraConfig,
    duration_secs: u32,
) -> RecorderResult<PathBuf> {
    let output = unused_clip_path(settings, &camera.id, Utc::now(), ClipKind::Test).await;
    if let Some(parent) = output.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    tracing::info!(
        camera_id = %camera.id,
        "Capturing {}s test clip to {:?}",
        duration_secs,
        output
    );

    let invocation = ffmpeg::test_clip(settings, &camera.stream_address, duration_secs, &output);
    let mut command = invocation.command();
    command.stdin(Stdio::null()).stderr(Stdio::piped());
    let child = command.spawn()?;

    let limit = Duration::from_secs(duration_secs as u64) + TEST_CLIP_SLACK;
    let result = match tokio::time::timeout(limit, child.wait_with_output()).await {
        Ok(result) => result?,
        Err(_) => {
            return Err(RecorderError::CaptureFailed {
                camera_id: camera.id.clone(),
                status: "timed out".to_string(),
                detail: format!("no result after {:?}", limit),
            })
        }
    };

    if !result.status.success() {
        return Err(RecorderError::capture_failed(
            &camera.id,
            result.status,
            &result.stderr,
        ));
    }

    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::tempdir;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 30, 15).unwrap()
    }

    fn settings_in(root: &Path, ffmpeg_path: impl Into<PathBuf>) -> RecorderSettings {
        RecorderSettings {
            scratch_dir: root.join("scratch"),
            recordings_dir: root.join("recordings"),
            ffmpeg_path: ffmpeg_path.into(),
            ..Default::default()
        }
    }

    fn write_segment(dir: &Path, name: &str) -> Segment {
        std::fs::create_dir_all(dir).unwrap();
        let path = dir.join(name);
        std::fs::write(&path, b"segment").unwrap();
        Segment {
            file_path: path,
            started_at: t0(),
            duration_secs: 1.0,
        }
    }

    /// Stand-in tool that creates its last argument and exits 0
    #[cfg(unix)]
    fn fake_tool(dir: &Path) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join("fake-ffmpeg.sh");
        std::fs::write(&path, "#!/bin/sh\nfor last; do :; done\n: > \"$last\"\n").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[test]
    fn test_clip_path_layout() {
        let settings = RecorderSettings {
            recordings_dir: PathBuf::from("/srv/clips"),
            ..Default::default()
        };
        let local = t0().with_timezone(&Local);
        let expected = PathBuf::from("/srv/clips/front")
            .join(local.format("%Y-%m-%d").to_string())
            .join(format!("{}_event.mp4", local.format("%H-%M-%S")));

        assert_eq!(clip_path(&settings, "front", t0(), ClipKind::Event), expected);
        assert!(clip_path(&settings, "front", t0(), ClipKind::Test)
            .to_string_lossy()
            .ends_with("_test.mp4"));
    }

    #[tokio::test]
    async fn test_unused_clip_path_skips_existing_files() {
        let dir = tempdir().unwrap();
        let settings = settings_in(dir.path(), "ffmpeg");

        let first = unused_clip_path(&settings, "front", t0(), ClipKind::Test).await;
        assert_eq!(first, clip_path(&settings, "front", t0(), ClipKind::Test));
        std::fs::create_dir_all(first.parent().unwrap()).unwrap();
        std::fs::write(&first, b"clip").unwrap();

        let second = unused_clip_path(&settings, "front", t0(), ClipKind::Test).await;
        assert_ne!(second, first);
        assert!(second.to_string_lossy().ends_with("-1_test.mp4"));
        std::fs::write(&second, b"clip").unwrap();

        let third = unused_clip_path(&settings, "front", t0(), ClipKind::Test).await;
        assert!(third.to_string_lossy().ends_with("-2_test.mp4"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_test_clips_in_same_second_do_not_overwrite() {
        let dir = tempdir().unwrap();
        let settings = settings_in(dir.path(), fake_tool(dir.path()));
        let camera = CameraConfig::new("front", "rtsp://127.0.0.1:9/none");

        let a = capture_test_clip(&settings, &camera, 1).await.unwrap();
        let b = capture_test_clip(&settings, &camera, 1).await.unwrap();
        assert_ne!(a, b);
        assert!(a.exists() && b.exists());
    }

    #[test]
    fn test_capture_duration() {
        let mut capture = EventCapture::open(t0(), vec![]);
        capture.push(Segment {
            file_path: PathBuf::from("a.ts"),
            started_at: t0(),
            duration_secs: 1.0,
        });
        capture.push(Segment {
            file_path: PathBuf::from("b.ts"),
            started_at: t0(),
            duration_secs: 1.5,
        });
        assert_eq!(capture.duration_secs(), 2.5);
    }

    #[tokio::test]
    async fn test_finalize_without_segments_fails() {
        let dir = tempdir().unwrap();
        let settings = settings_in(dir.path(), "ffmpeg");
        let capture = EventCapture::open(t0(), vec![]);

        let result = finalize_recording(&settings, "front", dir.path(), capture).await;
        assert!(matches!(result, Err(RecorderError::Process(_))));
    }

    #[tokio::test]
    async fn test_finalize_failure_suppresses_event() {
        let dir = tempdir().unwrap();
        let settings = settings_in(dir.path(), "false");
        let scratch = settings.camera_scratch_dir("front");
        let capture = EventCapture::open(t0(), vec![write_segment(&scratch, "seg_1_000000.ts")]);

        let result = finalize_recording(&settings, "front", &scratch, capture).await;
        assert!(matches!(result, Err(RecorderError::Process(_))));

        // Manifest is cleaned up either way
        let leftovers: Vec<_> = std::fs::read_dir(&scratch)
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with(MANIFEST_PREFIX))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_finalize_success_produces_event() {
        let dir = tempdir().unwrap();
        let settings = settings_in(dir.path(), fake_tool(dir.path()));
        let scratch = settings.camera_scratch_dir("front");
        let capture = EventCapture::open(
            t0(),
            vec![
                write_segment(&scratch, "seg_1_000000.ts"),
                write_segment(&scratch, "seg_1_000001.ts"),
            ],
        );

        let event = finalize_recording(&settings, "front", &scratch, capture)
            .await
            .unwrap();
        assert_eq!(event.camera_id, "front");
        assert_eq!(event.started_at, t0());
        assert_eq!(
            event.file_path,
            clip_path(&settings, "front", t0(), ClipKind::Event)
        );
        assert!(event.file_path.exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_finalize_skips_vanished_segments() {
        let dir = tempdir().unwrap();
        let settings = settings_in(dir.path(), fake_tool(dir.path()));
        let scratch = settings.camera_scratch_dir("front");
        let mut capture = EventCapture::open(t0(), vec![write_segment(&scratch, "seg_1_000000.ts")]);
        capture.push(Segment {
            file_path: scratch.join("seg_1_000001.ts"),
            started_at: t0(),
            duration_secs: 1.0,
        });

        assert!(finalize_recording(&settings, "front", &scratch, capture)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_test_clip_nonzero_exit_is_capture_failed() {
        let dir = tempdir().unwrap();
        let settings = settings_in(dir.path(), "false");
        let camera = CameraConfig::new("front", "rtsp://127.0.0.1:9/none");

        let result = capture_test_clip(&settings, &camera, 3).await;
        assert!(matches!(
            result,
            Err(RecorderError::CaptureFailed { ref camera_id, .. }) if camera_id == "front"
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_test_clip_success_returns_path() {
        let dir = tempdir().unwrap();
        let settings = settings_in(dir.path(), fake_tool(dir.path()));
        let camera = CameraConfig::new("front", "rtsp://127.0.0.1:9/none");

        let path = capture_test_clip(&settings, &camera, 3).await.unwrap();
        assert!(path.exists());
        assert!(path.to_string_lossy().ends_with("_test.mp4"));
    }
}
