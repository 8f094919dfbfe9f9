//! Fleet coordinator
//!
//! Owns the id -> pipeline registry, starts pipelines for newly enabled
//! cameras and funnels every finalized recording into one sink.

use super::sink::RecordingSink;
use super::system::{self, SystemSnapshot};
use crate::config::{CameraConfigSource, RecorderSettings};
use crate::recorder::finalize::{self, RecordingEvent};
use crate::recorder::pipeline::CameraPipeline;
use crate::recorder::status::CameraStatus;
use crate::utils::error::{RecorderError, RecorderResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, watch, RwLock};
use tokio::task::JoinHandle;

/// One camera's entry in a status report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CameraStatusReport {
    pub id: String,
    #[serde(flatten)]
    pub status: CameraStatus,
    #[serde(rename = "diskFreeGB")]
    pub disk_free_gb: Option<f64>,
    pub memory_free_mb: u64,
}

impl CameraStatusReport {
    pub fn last_seen(&self) -> Option<DateTime<Utc>> {
        self.status.last_seen
    }
}

async fn deliver(sink: &dyn RecordingSink, event: RecordingEvent) {
    let camera_id = event.camera_id.clone();
    if let Err(e) = sink.on_recording_finalized(event).await {
        tracing::error!(camera_id = %camera_id, "Recording sink failed: {}", e);
    }
}

async fn forward_events(
    sink: Arc<dyn RecordingSink>,
    mut events: mpsc::UnboundedReceiver<RecordingEvent>,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => deliver(sink.as_ref(), event).await,
                None => break,
            },
            _ = stop.changed() => {
                // Pipelines are already stopped; drain what they produced
                while let Ok(event) = events.try_recv() {
                    deliver(sink.as_ref(), event).await;
                }
                break;
            }
        }
    }
}

/// Capture a test clip for one enabled camera without starting any pipeline
pub async fn run_test_once(
    settings: &RecorderSettings,
    source: &dyn CameraConfigSource,
    camera_id: &str,
    duration_secs: u32,
) -> RecorderResult<PathBuf> {
    let camera = source
        .load()
        .await?
        .into_iter()
        .find(|config| config.id == camera_id && config.enabled)
        .ok_or_else(|| RecorderError::CameraNotActive(camera_id.to_string()))?;

    finalize::capture_test_clip(settings, &camera, duration_secs).await
}

/// Manages every camera pipeline on this host
pub struct Fleet {
    settings: Arc<RecorderSettings>,
    source: Arc<dyn CameraConfigSource>,
    sink: Arc<dyn RecordingSink>,
    pipelines: RwLock<HashMap<String, Arc<CameraPipeline>>>,
    events_tx: mpsc::UnboundedSender<RecordingEvent>,
    stop_tx: watch::Sender<bool>,
    forwarder: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl Fleet {
    /// Create an empty fleet. Must be called from within a tokio runtime.
    pub fn new(
        settings: Arc<RecorderSettings>,
        source: Arc<dyn CameraConfigSource>,
        sink: Arc<dyn RecordingSink>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = watch::channel(false);
        let forwarder = tokio::spawn(forward_events(sink.clone(), events_rx, stop_rx));

        Self {
            settings,
            source,
            sink,
            pipelines: RwLock::new(HashMap::new()),
            events_tx,
            stop_tx,
            forwarder: parking_lot::Mutex::new(Some(forwarder)),
        }
    }

    /// Create a fleet and start pipelines for the current configuration
    pub async fn launch(
        settings: Arc<RecorderSettings>,
        source: Arc<dyn CameraConfigSource>,
        sink: Arc<dyn RecordingSink>,
    ) -> RecorderResult<Self> {
        let fleet = Self::new(settings, source, sink);
        let started = fleet.refresh_configs().await?;
        tracing::info!("Fleet launched with {} camera(s)", started);
        Ok(fleet)
    }

    pub fn settings(&self) -> &RecorderSettings {
        &self.settings
    }

    /// Start a pipeline for every enabled camera that lacks one.
    ///
    /// Running pipelines are never touched, even if their camera was
    /// changed or disabled. Returns how many pipelines were started.
    pub async fn refresh_configs(&self) -> RecorderResult<usize> {
        let configs = self.source.load().await?;
        let mut pipelines = self.pipelines.write().await;
        let mut started = 0;

        for config in configs {
            if !config.enabled {
                if pipelines.contains_key(&config.id) {
                    tracing::warn!(
                        camera_id = %config.id,
                        "Camera disabled but its pipeline keeps running"
                    );
                } else {
                    tracing::debug!(camera_id = %config.id, "Skipping disabled camera");
                }
                continue;
            }
            if pipelines.contains_key(&config.id) {
                continue;
            }

            let id = config.id.clone();
            let pipeline = Arc::new(CameraPipeline::new(
                config,
                self.settings.clone(),
                self.events_tx.clone(),
            ));

            match pipeline.start().await {
                Ok(()) => {
                    pipelines.insert(id, pipeline);
                    started += 1;
                }
                Err(e) => {
                    tracing::error!(camera_id = %id, "Failed to start pipeline: {}", e);
                }
            }
        }

        Ok(started)
    }

    /// Capture a test clip from an active camera
    pub async fn run_test(&self, camera_id: &str, duration_secs: u32) -> RecorderResult<PathBuf> {
        let pipeline = self
            .pipelines
            .read()
            .await
            .get(camera_id)
            .cloned()
            .ok_or_else(|| RecorderError::CameraNotActive(camera_id.to_string()))?;

        pipeline.run_test_clip(duration_secs).await
    }

    /// One status entry per active camera, sorted by id
    pub async fn get_statuses(&self) -> Vec<CameraStatusReport> {
        let recordings_dir = self.settings.recordings_dir.clone();
        let host = tokio::task::spawn_blocking(move || system::snapshot(&recordings_dir))
            .await
            .unwrap_or_else(|e| {
                tracing::warn!("System probe failed: {}", e);
                SystemSnapshot::default()
            });

        let pipelines = self.pipelines.read().await;
        let mut reports: Vec<CameraStatusReport> = pipelines
            .values()
            .map(|pipeline| CameraStatusReport {
                id: pipeline.id().to_string(),
                status: pipeline.status(),
                disk_free_gb: host.disk_free_gb,
                memory_free_mb: host.memory_free_mb,
            })
            .collect();

        reports.sort_by(|a, b| a.id.cmp(&b.id));
        reports
    }

    /// Pass a finalized recording to the sink
    pub async fn handle_finalize(&self, event: RecordingEvent) {
        deliver(self.sink.as_ref(), event).await;
    }

    pub async fn pipeline_count(&self) -> usize {
        self.pipelines.read().await.len()
    }

    pub async fn camera_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.pipelines.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Stop every pipeline, then deliver any recordings they finalized
    pub async fn shutdown(&self) {
        let drained: Vec<Arc<CameraPipeline>> = {
            let mut pipelines = self.pipelines.write().await;
            pipelines.drain().map(|(_, pipeline)| pipeline).collect()
        };

        tracing::info!("Stopping {} pipeline(s)", drained.len());
        for pipeline in &drained {
            pipeline.stop().await;
        }

        self.stop_tx.send_replace(true);
        let forwarder = self.forwarder.lock().take();
        if let Some(handle) = forwarder {
            if let Err(e) = handle.await {
                tracing::warn!("Recording forwarder failed: {}", e);
            }
        }
    }
}
