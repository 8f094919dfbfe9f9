//! FFmpeg command lines for the recording pipeline
//!
//! Builds the argument lists for the three external tools a camera uses:
//! the stream segmenter, the scene-change detector and the segment
//! concatenator, plus the one-off test clip capture.

use crate::config::RecorderSettings;
use crate::recorder::segments::Segment;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;

/// Extension of segment files written by the segmenter
pub const SEGMENT_EXTENSION: &str = "ts";

/// File-name prefix shared by every segment file
pub const SEGMENT_PREFIX: &str = "seg_";

/// File-name prefix of generated concatenation manifests
pub const MANIFEST_PREFIX: &str = "concat_";

/// Metadata key the detector prints for every selected frame
pub const SCENE_SCORE_KEY: &str = "lavfi.scene_score";

/// A fully specified tool invocation
#[derive(Debug, Clone, PartialEq)]
pub struct ToolInvocation {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl ToolInvocation {
    /// Build a command with stdin piped, so it can be asked to quit
    pub fn command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        command
    }
}

/// Common input options for a live stream
fn input_args(settings: &RecorderSettings, stream_address: &str) -> Vec<String> {
    let mut args = vec![
        "-hide_banner".to_string(),
        "-nostats".to_string(),
        "-loglevel".to_string(),
        "error".to_string(),
    ];

    if stream_address.starts_with("rtsp://") || stream_address.starts_with("rtsps://") {
        args.extend(["-rtsp_transport".to_string(), settings.rtsp_transport.clone()]);
    }

    args.extend(["-i".to_string(), stream_address.to_string()]);
    args
}

/// Per-launch file-name prefix, so a relaunched segmenter never reuses names
pub fn launch_prefix(now: DateTime<Utc>) -> String {
    format!("{}{}_", SEGMENT_PREFIX, now.timestamp_millis())
}

/// Stream -> fixed-length segment files in `scratch_dir`
pub fn segmenter(
    settings: &RecorderSettings,
    stream_address: &str,
    scratch_dir: &Path,
    prefix: &str,
) -> ToolInvocation {
    let mut args = input_args(settings, stream_address);

    let pattern = scratch_dir
        .join(format!("{}%06d.{}", prefix, SEGMENT_EXTENSION))
        .to_string_lossy()
        .to_string();

    args.extend([
        "-map".to_string(),
        "0".to_string(),
        "-c".to_string(),
        "copy".to_string(),
        "-f".to_string(),
        "segment".to_string(),
        "-segment_time".to_string(),
        settings.segment_seconds.to_string(),
        "-segment_format".to_string(),
        "mpegts".to_string(),
        "-reset_timestamps".to_string(),
        "1".to_string(),
        pattern,
    ]);

    ToolInvocation {
        program: settings.ffmpeg_path.clone(),
        args,
    }
}

/// Stream -> one `frame:` header plus one `lavfi.scene_score=` line per
/// frame whose scene score reaches the threshold, on stdout
pub fn detector(settings: &RecorderSettings, stream_address: &str) -> ToolInvocation {
    let mut args = input_args(settings, stream_address);

    let filter = format!(
        "select=gte(scene\\,{threshold}),metadata=mode=print:key={key}:file=pipe\\\\:1",
        threshold = settings.scene_threshold,
        key = SCENE_SCORE_KEY,
    );

    args.extend([
        "-an".to_string(),
        "-vf".to_string(),
        filter,
        "-f".to_string(),
        "null".to_string(),
        "-".to_string(),
    ]);

    ToolInvocation {
        program: settings.ffmpeg_path.clone(),
        args,
    }
}

/// Ordered manifest -> single stream-copied, fast-start clip
pub fn concat(settings: &RecorderSettings, manifest: &Path, output: &Path) -> ToolInvocation {
    ToolInvocation {
        program: settings.ffmpeg_path.clone(),
        args: vec![
            "-hide_banner".to_string(),
            "-nostats".to_string(),
            "-loglevel".to_string(),
            "error".to_string(),
            "-y".to_string(),
            "-f".to_string(),
            "concat".to_string(),
            "-safe".to_string(),
            "0".to_string(),
            "-i".to_string(),
            manifest.to_string_lossy().to_string(),
            "-c".to_string(),
            "copy".to_string(),
            "-movflags".to_string(),
            "+faststart".to_string(),
            output.to_string_lossy().to_string(),
        ],
    }
}

/// Stream -> short fixed-duration clip
pub fn test_clip(
    settings: &RecorderSettings,
    stream_address: &str,
    duration_secs: u32,
    output: &Path,
) -> ToolInvocation {
    let mut args = vec!["-y".to_string()];
    args.extend(input_args(settings, stream_address));
    args.extend([
        "-t".to_string(),
        duration_secs.to_string(),
        "-c".to_string(),
        "copy".to_string(),
        "-movflags".to_string(),
        "+faststart".to_string(),
        output.to_string_lossy().to_string(),
    ]);

    ToolInvocation {
        program: settings.ffmpeg_path.clone(),
        args,
    }
}

/// Render a concat-demuxer manifest, one `file` directive per segment
pub fn render_concat_manifest(segments: &[Segment]) -> String {
    let mut manifest = String::from("ffconcat version 1.0\n");
    for segment in segments {
        // Single quotes are closed, escaped, and reopened
        let path = segment.file_path.to_string_lossy().replace('\'', "'\\''");
        manifest.push_str(&format!("file '{}'\n", path));
    }
    manifest
}

/// Write the manifest for `segments` to `path`
pub async fn write_concat_manifest(path: &Path, segments: &[Segment]) -> std::io::Result<()> {
    tokio::fs::write(path, render_concat_manifest(segments)).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn segment(path: &str) -> Segment {
        Segment {
            file_path: PathBuf::from(path),
            started_at: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
            duration_secs: 1.0,
        }
    }

    #[test]
    fn test_rtsp_input_forces_transport() {
        let settings = RecorderSettings::default();
        let invocation = detector(&settings, "rtsp://10.0.0.5/main");
        let joined = invocation.args.join(" ");
        assert!(joined.contains("-rtsp_transport tcp -i rtsp://10.0.0.5/main"));
    }

    #[test]
    fn test_http_input_has_no_rtsp_transport() {
        let settings = RecorderSettings::default();
        let invocation = detector(&settings, "http://10.0.0.5/stream.mjpg");
        assert!(!invocation.args.iter().any(|a| a == "-rtsp_transport"));
    }

    #[test]
    fn test_segmenter_pattern_and_length() {
        let settings = RecorderSettings::default();
        let invocation = segmenter(
            &settings,
            "rtsp://cam/main",
            Path::new("/tmp/scratch/front"),
            "seg_1714564800000_",
        );
        assert_eq!(invocation.program, PathBuf::from("ffmpeg"));
        let joined = invocation.args.join(" ");
        assert!(joined.contains("-f segment -segment_time 1"));
        assert!(joined.ends_with("/tmp/scratch/front/seg_1714564800000_%06d.ts"));
    }

    #[test]
    fn test_detector_filter_uses_threshold() {
        let settings = RecorderSettings {
            scene_threshold: 0.25,
            ..Default::default()
        };
        let invocation = detector(&settings, "rtsp://cam/main");
        let filter = invocation
            .args
            .iter()
            .skip_while(|a| *a != "-vf")
            .nth(1)
            .unwrap();
        assert!(filter.starts_with("select=gte(scene\\,0.25),metadata"));
        assert!(filter.contains("key=lavfi.scene_score"));
    }

    #[test]
    fn test_concat_is_lossless_and_faststart() {
        let settings = RecorderSettings::default();
        let invocation = concat(
            &settings,
            Path::new("/tmp/concat_1.txt"),
            Path::new("/clips/out.mp4"),
        );
        let joined = invocation.args.join(" ");
        assert!(joined.contains("-f concat -safe 0 -i /tmp/concat_1.txt"));
        assert!(joined.contains("-c copy -movflags +faststart /clips/out.mp4"));
    }

    #[test]
    fn test_test_clip_duration() {
        let settings = RecorderSettings::default();
        let invocation = test_clip(&settings, "rtsp://cam/main", 3, Path::new("/clips/t.mp4"));
        let joined = invocation.args.join(" ");
        assert!(joined.starts_with("-y "));
        assert!(joined.contains("-t 3 -c copy"));
    }

    #[test]
    fn test_manifest_preserves_order_and_escapes_quotes() {
        let manifest = render_concat_manifest(&[
            segment("/scratch/a.ts"),
            segment("/scratch/it's.ts"),
        ]);
        let lines: Vec<&str> = manifest.lines().collect();
        assert_eq!(lines[0], "ffconcat version 1.0");
        assert_eq!(lines[1], "file '/scratch/a.ts'");
        assert_eq!(lines[2], "file '/scratch/it'\\''s.ts'");
    }

    #[test]
    fn test_launch_prefix_is_unique_per_millisecond() {
        let t = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let a = launch_prefix(t);
        let b = launch_prefix(t + chrono::Duration::milliseconds(1));
        assert_ne!(a, b);
        assert!(a.starts_with(SEGMENT_PREFIX));
    }
}
