//! Camera pipeline
//!
//! One pipeline per camera. A single event-loop task owns the motion state
//! machine, the segment ring buffer and the open event; the segmenter and
//! detector supervisors feed it over a channel, and a 1-second clock drives
//! state transitions and finalization.

use super::detector::DetectorTask;
use super::finalize::{self, EventCapture, RecordingEvent};
use super::segmenter::{sweep_scratch, SegmentWatcher, SegmenterTask};
use super::segments::{newest_age, Segment, SegmentBuffer};
use super::state::{MotionState, MotionStateMachine, MotionTiming, Transition};
use super::status::{CameraStatus, SharedStatus};
use super::supervisor::supervise;
use crate::config::{CameraConfig, RecorderSettings};
use crate::utils::error::RecorderResult;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

const CLOCK_INTERVAL: Duration = Duration::from_secs(1);

/// Bound on queued segment and motion signals per camera
const INPUT_QUEUE: usize = 256;

/// How often the scratch directory is swept, in clock ticks
const SWEEP_EVERY_TICKS: u64 = 30;

/// Signals fed into a camera's event loop
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineInput {
    /// A finished segment file
    Segment(Segment),
    /// A scene-change record at or above the threshold
    Motion { at: DateTime<Utc>, score: f64 },
}

/// Synchronous heart of a pipeline: everything the event loop owns
#[derive(Debug)]
pub struct PipelineCore {
    machine: MotionStateMachine,
    buffer: SegmentBuffer,
    open_event: Option<EventCapture>,
    stale_after_secs: f64,
}

impl PipelineCore {
    pub fn new(timing: MotionTiming, pre_roll_secs: f64, stale_after_secs: f64) -> Self {
        Self {
            machine: MotionStateMachine::new(timing),
            buffer: SegmentBuffer::new(pre_roll_secs),
            open_event: None,
            stale_after_secs,
        }
    }

    pub fn state(&self) -> MotionState {
        self.machine.state()
    }

    pub fn buffer(&self) -> &SegmentBuffer {
        &self.buffer
    }

    pub fn is_recording(&self) -> bool {
        self.open_event.is_some()
    }

    pub fn on_segment(&mut self, segment: Segment) {
        if let Some(event) = self.open_event.as_mut() {
            event.push(segment.clone());
        }
        self.buffer.push(segment);
    }

    /// Returns `true` when this signal opened a new event
    pub fn on_motion(&mut self, at: DateTime<Utc>) -> bool {
        if !self.machine.mark_motion(at) {
            return false;
        }
        self.open_event = Some(EventCapture::open(at, self.buffer.snapshot()));
        true
    }

    /// Advance the clock; returns the event to finalize when motion ends
    pub fn on_tick(&mut self, now: DateTime<Utc>) -> Option<EventCapture> {
        match self.machine.tick(now) {
            Transition::EnteredPost => self.open_event.take(),
            Transition::EnteredIdle | Transition::None => None,
        }
    }

    /// Close any open event regardless of state, for shutdown
    pub fn take_open_event(&mut self) -> Option<EventCapture> {
        self.open_event.take()
    }

    /// Segment files the buffer or the open event still refer to
    pub fn referenced_paths(&self) -> HashSet<PathBuf> {
        let buffered = self.buffer.snapshot().into_iter();
        let open = self
            .open_event
            .iter()
            .flat_map(|event| event.segments.iter().cloned());
        buffered.chain(open).map(|s| s.file_path).collect()
    }

    /// No segment has started within the stale window
    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        self.buffer
            .recent_segments(self.stale_after_secs, now)
            .is_empty()
    }
}

/// What the event loop needs besides its core
struct LoopContext {
    camera_id: String,
    settings: Arc<RecorderSettings>,
    scratch_dir: PathBuf,
    status: SharedStatus,
    events: mpsc::UnboundedSender<RecordingEvent>,
}

impl LoopContext {
    fn on_input(&self, core: &mut PipelineCore, input: PipelineInput) {
        match input {
            PipelineInput::Segment(segment) => {
                let arrived = Utc::now();
                core.on_segment(segment);

                let mut status = self.status.write();
                status.last_seen = Some(arrived);
                if !status.stream_connected {
                    tracing::info!(camera_id = %self.camera_id, "Stream connected");
                }
                status.stream_connected = true;
            }
            PipelineInput::Motion { at, score } => {
                if core.on_motion(at) {
                    tracing::info!(
                        camera_id = %self.camera_id,
                        score,
                        pre_roll = core.buffer().len(),
                        "Motion started"
                    );
                }

                let mut status = self.status.write();
                status.last_motion_at = Some(at);
                status.motion_state = core.state();
            }
        }
    }

    async fn on_tick(&self, core: &mut PipelineCore) {
        let now = Utc::now();
        let finished = core.on_tick(now);

        {
            let mut status = self.status.write();
            status.motion_state = core.state();
            if status.stream_connected && core.is_stale(now) {
                tracing::warn!(
                    camera_id = %self.camera_id,
                    newest_age_secs = ?newest_age(core.buffer(), now).map(|age| age.num_seconds()),
                    "No segments for {}s, marking stream disconnected",
                    self.settings.stale_stream_seconds
                );
                status.stream_connected = false;
            }
        }

        if let Some(capture) = finished {
            self.finalize(capture).await;
        }
    }

    /// Remove old scratch files, keeping anything a clip may still need
    async fn sweep(&self, core: &PipelineCore) {
        let protected = core.referenced_paths();
        match sweep_scratch(&self.scratch_dir, self.settings.scratch_retention(), &protected).await
        {
            Ok(0) => {}
            Ok(n) => tracing::debug!(camera_id = %self.camera_id, "Swept {} stale scratch file(s)", n),
            Err(e) => tracing::warn!(camera_id = %self.camera_id, "Scratch sweep failed: {}", e),
        }
    }

    async fn finalize(&self, capture: EventCapture) {
        let started_at = capture.started_at;
        match finalize::finalize_recording(
            &self.settings,
            &self.camera_id,
            &self.scratch_dir,
            capture,
        )
        .await
        {
            Ok(event) => {
                tracing::info!(
                    camera_id = %self.camera_id,
                    "Recording finalized: {:?}",
                    event.file_path
                );
                self.status.write().recordings_finalized += 1;
                if self.events.send(event).is_err() {
                    tracing::warn!(
                        camera_id = %self.camera_id,
                        "Recording finalized after the fleet stopped listening"
                    );
                }
            }
            Err(e) => {
                tracing::error!(
                    camera_id = %self.camera_id,
                    started_at = %started_at,
                    "Failed to finalize recording: {}",
                    e
                );
            }
        }
    }
}

async fn event_loop(
    ctx: LoopContext,
    mut core: PipelineCore,
    mut inputs: mpsc::Receiver<PipelineInput>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut clock = tokio::time::interval(CLOCK_INTERVAL);
    clock.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut ticks: u64 = 0;

    loop {
        tokio::select! {
            input = inputs.recv() => match input {
                Some(input) => ctx.on_input(&mut core, input),
                None => break,
            },
            _ = clock.tick() => {
                ctx.on_tick(&mut core).await;
                ticks += 1;
                if ticks % SWEEP_EVERY_TICKS == 0 {
                    ctx.sweep(&core).await;
                }
            }
            _ = shutdown.changed() => break,
        }
    }

    // Keep whatever was captured so far
    if let Some(capture) = core.take_open_event() {
        tracing::info!(camera_id = %ctx.camera_id, "Finalizing open event before stopping");
        ctx.finalize(capture).await;
    }
}

/// Supervised recording pipeline for one camera
pub struct CameraPipeline {
    config: CameraConfig,
    settings: Arc<RecorderSettings>,
    status: SharedStatus,
    events: mpsc::UnboundedSender<RecordingEvent>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl CameraPipeline {
    pub fn new(
        config: CameraConfig,
        settings: Arc<RecorderSettings>,
        events: mpsc::UnboundedSender<RecordingEvent>,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            config,
            settings,
            status: Arc::new(RwLock::new(CameraStatus::default())),
            events,
            shutdown,
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }

    pub fn config(&self) -> &CameraConfig {
        &self.config
    }

    pub fn status(&self) -> CameraStatus {
        self.status.read().clone()
    }

    pub fn is_running(&self) -> bool {
        self.tasks.lock().iter().any(|task| !task.is_finished())
    }

    /// Create directories and launch the event loop plus both supervisors.
    ///
    /// Calling `start` on a running pipeline does nothing.
    pub async fn start(&self) -> RecorderResult<()> {
        if self.is_running() {
            return Ok(());
        }

        let camera_id = self.config.id.clone();
        let scratch_dir = self.settings.camera_scratch_dir(&camera_id);
        tokio::fs::create_dir_all(&scratch_dir).await?;
        tokio::fs::create_dir_all(self.settings.camera_recordings_dir(&camera_id)).await?;

        let watcher = SegmentWatcher::new(scratch_dir.clone()).await?;
        let (inputs_tx, inputs_rx) = mpsc::channel(INPUT_QUEUE);

        let core = PipelineCore::new(
            self.config.motion_timing(&self.settings),
            self.settings.pre_roll_seconds,
            self.settings.stale_stream_seconds,
        );
        let ctx = LoopContext {
            camera_id: camera_id.clone(),
            settings: self.settings.clone(),
            scratch_dir,
            status: self.status.clone(),
            events: self.events.clone(),
        };

        let segmenter = SegmenterTask::new(
            self.settings.clone(),
            self.config.stream_address.clone(),
            watcher,
            self.status.clone(),
            inputs_tx.clone(),
        );
        let detector = DetectorTask::new(
            self.settings.clone(),
            self.config.stream_address.clone(),
            self.status.clone(),
            inputs_tx,
        );

        let policy = self.settings.restart_policy;
        let grace = self.settings.stop_grace();

        let handles = vec![
            tokio::spawn(event_loop(ctx, core, inputs_rx, self.shutdown.subscribe())),
            tokio::spawn(supervise(
                camera_id.clone(),
                segmenter,
                policy,
                grace,
                self.shutdown.subscribe(),
            )),
            tokio::spawn(supervise(
                camera_id.clone(),
                detector,
                policy,
                grace,
                self.shutdown.subscribe(),
            )),
        ];
        *self.tasks.lock() = handles;

        tracing::info!(camera_id = %camera_id, "Pipeline started");
        Ok(())
    }

    /// Ask both tools to quit and wait for every task to finish
    pub async fn stop(&self) {
        self.shutdown.send_replace(true);

        let handles = std::mem::take(&mut *self.tasks.lock());
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::warn!(camera_id = %self.config.id, "Pipeline task failed: {}", e);
            }
        }

        tracing::info!(camera_id = %self.config.id, "Pipeline stopped");
    }

    /// Capture a short clip straight from the stream, outside the motion path
    pub async fn run_test_clip(&self, duration_secs: u32) -> RecorderResult<PathBuf> {
        finalize::capture_test_clip(&self.settings, &self.config, duration_secs).await
    }
}
