//! Per-camera recording
//!
//! - Motion state machine and segment ring buffer
//! - Supervised segmenter and detector processes
//! - CameraPipeline tying them to a clock and clip finalization

pub mod detector;
pub mod ffmpeg;
pub mod finalize;
pub mod pipeline;
pub mod segmenter;
pub mod segments;
pub mod state;
pub mod status;
pub mod supervisor;

pub use finalize::{ClipKind, EventCapture, RecordingEvent};
pub use pipeline::{CameraPipeline, PipelineCore, PipelineInput};
pub use segments::{Segment, SegmentBuffer, SegmentCandidate};
pub use state::{MotionState, MotionStateMachine, MotionTiming, Transition};
pub use status::CameraStatus;
