//! Configuration
//!
//! Recorder-wide settings and the camera configuration source.

pub mod camera;
pub mod settings;

pub use camera::{CameraConfig, CameraConfigSource, JsonFileSource, StaticSource};
pub use settings::{RecorderSettings, RestartPolicy};
