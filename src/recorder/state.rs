//! Motion state management
//!
//! Defines the timer-driven motion state machine. Every method takes the
//! current time from the caller, so the machine never reads a clock.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Current state of a camera's motion tracking
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MotionState {
    /// No activity
    Idle,
    /// Motion signals are arriving
    Motion,
    /// Event is over, waiting out the cooldown
    Post,
}

impl Default for MotionState {
    fn default() -> Self {
        Self::Idle
    }
}

/// Edge reported by [`MotionStateMachine::tick`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    None,
    /// Motion -> Post: the event is complete
    EnteredPost,
    /// Post -> Idle: cooldown elapsed
    EnteredIdle,
}

/// Timing thresholds for one camera
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MotionTiming {
    /// Minimum time since motion started before the event may close
    pub min_motion: Duration,
    /// Quiet period since the last signal before the event closes
    pub post: Duration,
    /// Quiet period since the last signal before returning to idle
    pub cooldown: Duration,
}

impl MotionTiming {
    pub fn from_secs(min_motion_secs: f64, post_secs: f64, cooldown_secs: f64) -> Self {
        Self {
            min_motion: secs_to_duration(min_motion_secs),
            post: secs_to_duration(post_secs),
            cooldown: secs_to_duration(cooldown_secs),
        }
    }
}

/// Longest duration any timing value is converted to
const MAX_DURATION_MS: i64 = 100 * 365 * 24 * 3600 * 1000;

/// Convert fractional seconds to a millisecond-precision duration.
///
/// Values are clamped to `0..=100 years`; NaN becomes zero.
pub fn secs_to_duration(secs: f64) -> Duration {
    let ms = (secs * 1000.0).round();
    let ms = if ms.is_nan() {
        0
    } else {
        (ms as i64).clamp(0, MAX_DURATION_MS)
    };
    Duration::milliseconds(ms)
}

#[derive(Debug, Clone)]
pub struct MotionStateMachine {
    timing: MotionTiming,
    state: MotionState,
    motion_started_at: Option<DateTime<Utc>>,
    last_motion_at: Option<DateTime<Utc>>,
}

impl MotionStateMachine {
    pub fn new(timing: MotionTiming) -> Self {
        Self {
            timing,
            state: MotionState::Idle,
            motion_started_at: None,
            last_motion_at: None,
        }
    }

    pub fn state(&self) -> MotionState {
        self.state
    }

    pub fn motion_started_at(&self) -> Option<DateTime<Utc>> {
        self.motion_started_at
    }

    pub fn last_motion_at(&self) -> Option<DateTime<Utc>> {
        self.last_motion_at
    }

    /// Record a motion signal.
    ///
    /// Returns `true` only on the Idle -> Motion edge. Signals arriving in
    /// `Post` are ignored.
    pub fn mark_motion(&mut self, now: DateTime<Utc>) -> bool {
        match self.state {
            MotionState::Idle => {
                self.state = MotionState::Motion;
                self.motion_started_at = Some(now);
                self.last_motion_at = Some(now);
                true
            }
            MotionState::Motion => {
                self.last_motion_at = Some(now);
                false
            }
            MotionState::Post => false,
        }
    }

    /// Advance the machine to `now`
    pub fn tick(&mut self, now: DateTime<Utc>) -> Transition {
        match (self.state, self.motion_started_at, self.last_motion_at) {
            (MotionState::Motion, Some(started), Some(last)) => {
                if now - started >= self.timing.min_motion && now - last >= self.timing.post {
                    self.state = MotionState::Post;
                    Transition::EnteredPost
                } else {
                    Transition::None
                }
            }
            (MotionState::Post, _, Some(last)) => {
                if now - last >= self.timing.cooldown {
                    self.state = MotionState::Idle;
                    Transition::EnteredIdle
                } else {
                    Transition::None
                }
            }
            _ => Transition::None,
        }
    }

    /// Force the machine back to idle and forget all timestamps
    pub fn reset(&mut self) {
        self.state = MotionState::Idle;
        self.motion_started_at = None;
        self.last_motion_at = None;
    }
}
