//! Finalized-recording sinks
//!
//! The fleet hands each finished clip to exactly one [`RecordingSink`].
//! [`RecordingLog`] is the default: an append-only JSON-lines file.

use crate::recorder::finalize::RecordingEvent;
use crate::utils::error::{RecorderError, RecorderResult};
use async_trait::async_trait;
use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

/// Receives every finalized recording, once
#[async_trait]
pub trait RecordingSink: Send + Sync {
    async fn on_recording_finalized(&self, event: RecordingEvent) -> RecorderResult<()>;
}

/// Durable metadata for one clip
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordingRecord {
    pub id: Uuid,
    pub camera_id: String,
    pub file_path: PathBuf,
    /// Local calendar day the event started on
    pub date: String,
    pub size: u64,
    pub created_at: DateTime<Utc>,
}

impl RecordingRecord {
    /// Stable id for a clip path, the same on every run
    pub fn id_for(path: &Path) -> Uuid {
        Uuid::new_v5(&Uuid::NAMESPACE_URL, path.to_string_lossy().as_bytes())
    }

    pub async fn from_event(event: &RecordingEvent) -> RecorderResult<Self> {
        let metadata = tokio::fs::metadata(&event.file_path).await?;

        Ok(Self {
            id: Self::id_for(&event.file_path),
            camera_id: event.camera_id.clone(),
            file_path: event.file_path.clone(),
            date: event
                .started_at
                .with_timezone(&Local)
                .format("%Y-%m-%d")
                .to_string(),
            size: metadata.len(),
            created_at: Utc::now(),
        })
    }
}

/// Appends one [`RecordingRecord`] per line to a file
pub struct RecordingLog {
    path: PathBuf,
    lock: tokio::sync::Mutex<()>,
}

impl RecordingLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read every record back, skipping lines that do not parse
    pub async fn read_all(&self) -> RecorderResult<Vec<RecordingRecord>> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        Ok(content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect())
    }
}

#[async_trait]
impl RecordingSink for RecordingLog {
    async fn on_recording_finalized(&self, event: RecordingEvent) -> RecorderResult<()> {
        let record = RecordingRecord::from_event(&event).await?;
        let mut line = serde_json::to_string(&record)?;
        line.push('\n');

        let _guard = self.lock.lock().await;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| RecorderError::Sink(format!("cannot open {:?}: {}", self.path, e)))?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;

        tracing::info!(
            camera_id = %record.camera_id,
            id = %record.id,
            size = record.size,
            "Recording logged"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn event_for(path: PathBuf) -> RecordingEvent {
        RecordingEvent {
            camera_id: "front".to_string(),
            file_path: path,
            started_at: Utc::now(),
        }
    }

    #[test]
    fn test_id_is_stable_per_path() {
        let a = RecordingRecord::id_for(Path::new("/clips/front/a.mp4"));
        let b = RecordingRecord::id_for(Path::new("/clips/front/a.mp4"));
        let c = RecordingRecord::id_for(Path::new("/clips/front/b.mp4"));
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[tokio::test]
    async fn test_log_appends_records() {
        let dir = tempdir().unwrap();
        let clip = dir.path().join("clip.mp4");
        std::fs::write(&clip, vec![0u8; 42]).unwrap();

        let log = RecordingLog::new(dir.path().join("db").join("recordings.jsonl"));
        log.on_recording_finalized(event_for(clip.clone())).await.unwrap();
        log.on_recording_finalized(event_for(clip.clone())).await.unwrap();

        let records = log.read_all().await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].size, 42);
        assert_eq!(records[0].camera_id, "front");
        assert_eq!(records[0].id, records[1].id);

        let raw = std::fs::read_to_string(log.path()).unwrap();
        assert!(raw.contains("\"cameraId\":\"front\""));
        assert!(raw.contains("\"createdAt\""));
    }

    #[tokio::test]
    async fn test_missing_clip_is_an_error() {
        let dir = tempdir().unwrap();
        let log = RecordingLog::new(dir.path().join("recordings.jsonl"));

        let result = log
            .on_recording_finalized(event_for(dir.path().join("gone.mp4")))
            .await;
        assert!(result.is_err());
        assert!(log.read_all().await.unwrap().is_empty());
    }
}
