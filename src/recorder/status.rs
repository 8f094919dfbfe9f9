//! Per-camera status record

use super::state::MotionState;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Live status of one camera, written only by that camera's own tasks
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CameraStatus {
    /// When the last segment arrived
    pub last_seen: Option<DateTime<Utc>>,
    pub stream_connected: bool,
    pub last_motion_at: Option<DateTime<Utc>>,
    pub motion_state: MotionState,
    pub segmenter_restarts: u32,
    pub detector_restarts: u32,
    pub recordings_finalized: u64,
}

pub type SharedStatus = Arc<RwLock<CameraStatus>>;
