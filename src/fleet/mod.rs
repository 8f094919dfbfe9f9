//! Fleet coordination
//!
//! Runs one pipeline per enabled camera and forwards finalized recordings
//! to a single sink.

pub mod coordinator;
pub mod sink;
pub mod system;

pub use coordinator::{run_test_once, CameraStatusReport, Fleet};
pub use sink::{RecordingLog, RecordingRecord, RecordingSink};
pub use system::SystemSnapshot;
