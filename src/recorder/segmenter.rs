//! Stream segmenter and scratch directory watcher
//!
//! The segmenter tool writes fixed-length segment files into the camera's
//! scratch directory. The watcher polls that directory and reports each
//! segment once a newer one exists, because the newest file is still being
//! written. Old files are swept by the camera's event loop, which knows
//! which of them an open event still needs.

use super::ffmpeg::{self, ToolInvocation, MANIFEST_PREFIX, SEGMENT_EXTENSION, SEGMENT_PREFIX};
use super::pipeline::PipelineInput;
use super::segments::{Segment, SegmentCandidate};
use super::status::SharedStatus;
use super::supervisor::SupervisedTask;
use crate::config::RecorderSettings;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::process::Child;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;

const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// A finished segment file found on disk
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentFile {
    pub path: PathBuf,
    pub size_bytes: u64,
}

fn is_segment_name(name: &str) -> bool {
    name.starts_with(SEGMENT_PREFIX)
        && Path::new(name).extension().and_then(|e| e.to_str()) == Some(SEGMENT_EXTENSION)
}

/// Segment files in `dir`, sorted by name (which is creation order)
async fn list_segments(dir: &Path) -> std::io::Result<Vec<(String, SegmentFile)>> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut files = Vec::new();

    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name().to_string_lossy().to_string();
        if !is_segment_name(&name) {
            continue;
        }
        let Ok(metadata) = entry.metadata().await else {
            continue;
        };
        if !metadata.is_file() {
            continue;
        }
        files.push((
            name,
            SegmentFile {
                path: entry.path(),
                size_bytes: metadata.len(),
            },
        ));
    }

    files.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(files)
}

/// Polls a scratch directory for newly completed segment files
pub struct SegmentWatcher {
    dir: PathBuf,
    reported: HashSet<String>,
}

impl SegmentWatcher {
    /// Start watching `dir`; files already present are never reported
    pub async fn new(dir: PathBuf) -> std::io::Result<Self> {
        let reported = list_segments(&dir)
            .await?
            .into_iter()
            .map(|(name, _)| name)
            .collect();
        Ok(Self { dir, reported })
    }

    /// Report segments that appeared since the last poll.
    ///
    /// The newest file is held back unless `include_newest` is set, which
    /// callers use once the writer has exited.
    pub async fn poll(&mut self, include_newest: bool) -> std::io::Result<Vec<SegmentFile>> {
        let mut files = list_segments(&self.dir).await?;
        let present: HashSet<String> = files.iter().map(|(name, _)| name.clone()).collect();

        if !include_newest {
            files.pop();
        }

        let mut fresh = Vec::new();
        for (name, file) in files {
            if self.reported.insert(name) {
                fresh.push(file);
            }
        }

        self.reported.retain(|name| present.contains(name));
        Ok(fresh)
    }
}

/// Delete segment files and manifests in `dir` older than `retention`.
///
/// Paths in `protected` are kept whatever their age.
pub async fn sweep_scratch(
    dir: &Path,
    retention: Duration,
    protected: &HashSet<PathBuf>,
) -> std::io::Result<usize> {
    let Some(cutoff) = SystemTime::now().checked_sub(retention) else {
        return Ok(0);
    };

    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut removed = 0;

    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name().to_string_lossy().to_string();
        if !is_segment_name(&name) && !name.starts_with(MANIFEST_PREFIX) {
            continue;
        }
        let path = entry.path();
        if protected.contains(&path) {
            continue;
        }
        let Ok(modified) = entry.metadata().await.and_then(|m| m.modified()) else {
            continue;
        };
        if modified < cutoff && tokio::fs::remove_file(&path).await.is_ok() {
            removed += 1;
        }
    }

    Ok(removed)
}

/// Supervised stream segmenter for one camera
pub struct SegmenterTask {
    settings: Arc<RecorderSettings>,
    stream_address: String,
    watcher: SegmentWatcher,
    status: SharedStatus,
    inputs: mpsc::Sender<PipelineInput>,
}

impl SegmenterTask {
    pub fn new(
        settings: Arc<RecorderSettings>,
        stream_address: String,
        watcher: SegmentWatcher,
        status: SharedStatus,
        inputs: mpsc::Sender<PipelineInput>,
    ) -> Self {
        Self {
            settings,
            stream_address,
            watcher,
            status,
            inputs,
        }
    }

    /// Turn newly finished files into validated segments for the event loop
    async fn forward(&mut self, include_newest: bool) {
        let files = match self.watcher.poll(include_newest).await {
            Ok(files) => files,
            Err(e) => {
                tracing::warn!("Failed to scan {:?}: {}", self.watcher.dir, e);
                return;
            }
        };

        for file in files {
            if file.size_bytes == 0 {
                tracing::debug!("Skipping empty segment {:?}", file.path);
                continue;
            }

            let candidate = SegmentCandidate {
                file_path: Some(file.path),
                started_at: Some(Utc::now()),
                duration_secs: Some(self.settings.segment_seconds),
            };
            let segment = match Segment::try_from(candidate) {
                Ok(segment) => segment,
                Err(reason) => {
                    tracing::debug!("Dropping malformed segment: {:?}", reason);
                    continue;
                }
            };

            tracing::trace!(
                path = ?segment.file_path,
                size_bytes = file.size_bytes,
                "Segment ready"
            );

            if self.inputs.send(PipelineInput::Segment(segment)).await.is_err() {
                return;
            }
        }
    }
}

#[async_trait]
impl SupervisedTask for SegmenterTask {
    fn name(&self) -> &'static str {
        "segmenter"
    }

    fn invocation(&mut self) -> ToolInvocation {
        let prefix = ffmpeg::launch_prefix(Utc::now());
        ffmpeg::segmenter(
            &self.settings,
            &self.stream_address,
            &self.watcher.dir,
            &prefix,
        )
    }

    async fn run(&mut self, child: &mut Child) -> std::io::Result<ExitStatus> {
        let mut ticker = tokio::time::interval(POLL_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                status = child.wait() => {
                    self.forward(true).await;
                    return status;
                }
                _ = ticker.tick() => self.forward(false).await,
            }
        }
    }

    fn on_exit(&mut self) {
        let mut status = self.status.write();
        status.stream_connected = false;
        status.segmenter_restarts += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn touch(dir: &Path, name: &str, bytes: &[u8]) {
        std::fs::write(dir.join(name), bytes).unwrap();
    }

    #[tokio::test]
    async fn test_newest_file_is_held_back() {
        let dir = tempdir().unwrap();
        let mut watcher = SegmentWatcher::new(dir.path().to_path_buf()).await.unwrap();

        touch(dir.path(), "seg_1000_000000.ts", b"a");
        assert!(watcher.poll(false).await.unwrap().is_empty());

        touch(dir.path(), "seg_1000_000001.ts", b"b");
        let fresh = watcher.poll(false).await.unwrap();
        assert_eq!(fresh.len(), 1);
        assert!(fresh[0].path.ends_with("seg_1000_000000.ts"));
        assert_eq!(fresh[0].size_bytes, 1);

        // Writer exited: flush the last one
        let fresh = watcher.poll(true).await.unwrap();
        assert_eq!(fresh.len(), 1);
        assert!(fresh[0].path.ends_with("seg_1000_000001.ts"));
        assert!(watcher.poll(true).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_preexisting_files_are_ignored() {
        let dir = tempdir().unwrap();
        touch(dir.path(), "seg_999_000000.ts", b"old");
        touch(dir.path(), "seg_999_000001.ts", b"old");

        let mut watcher = SegmentWatcher::new(dir.path().to_path_buf()).await.unwrap();
        assert!(watcher.poll(true).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_non_segment_files_are_ignored() {
        let dir = tempdir().unwrap();
        let mut watcher = SegmentWatcher::new(dir.path().to_path_buf()).await.unwrap();

        touch(dir.path(), "concat_1.txt", b"ffconcat");
        touch(dir.path(), "seg_1000_000000.mp4", b"x");
        touch(dir.path(), "notes.ts", b"x");
        assert!(watcher.poll(true).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_sweep_removes_only_stale_files() {
        let dir = tempdir().unwrap();
        let none = HashSet::new();
        touch(dir.path(), "seg_1000_000000.ts", b"a");
        touch(dir.path(), "keep.txt", b"a");

        assert_eq!(
            sweep_scratch(dir.path(), Duration::from_secs(3600), &none).await.unwrap(),
            0
        );

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(
            sweep_scratch(dir.path(), Duration::from_millis(1), &none).await.unwrap(),
            1
        );
        assert!(dir.path().join("keep.txt").exists());
    }

    #[tokio::test]
    async fn test_sweep_keeps_protected_files() {
        let dir = tempdir().unwrap();
        for i in 0..3 {
            touch(dir.path(), &format!("seg_1000_00000{i}.ts"), b"a");
        }
        let protected: HashSet<PathBuf> = [
            dir.path().join("seg_1000_000000.ts"),
            dir.path().join("seg_1000_000001.ts"),
        ]
        .into_iter()
        .collect();

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(
            sweep_scratch(dir.path(), Duration::from_millis(1), &protected)
                .await
                .unwrap(),
            1
        );
        assert!(dir.path().join("seg_1000_000000.ts").exists());
        assert!(dir.path().join("seg_1000_000001.ts").exists());
        assert!(!dir.path().join("seg_1000_000002.ts").exists());
    }
}
