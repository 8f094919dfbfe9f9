//! Segment ring buffer
//!
//! Holds references to the most recent stream segments so a clip can
//! include the seconds before motion was confirmed.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::PathBuf;

use super::state::secs_to_duration;

/// A short slice of a camera's stream on disk
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Segment {
    pub file_path: PathBuf,
    pub started_at: DateTime<Utc>,
    pub duration_secs: f64,
}

/// Unvalidated segment report, as produced by a directory watcher
#[derive(Debug, Clone, Default)]
pub struct SegmentCandidate {
    pub file_path: Option<PathBuf>,
    pub started_at: Option<DateTime<Utc>>,
    pub duration_secs: Option<f64>,
}

/// Why a candidate was rejected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MalformedSegment {
    MissingPath,
    MissingTimestamp,
    BadDuration,
}

impl TryFrom<SegmentCandidate> for Segment {
    type Error = MalformedSegment;

    fn try_from(candidate: SegmentCandidate) -> Result<Self, Self::Error> {
        let file_path = candidate
            .file_path
            .filter(|p| !p.as_os_str().is_empty())
            .ok_or(MalformedSegment::MissingPath)?;
        let started_at = candidate
            .started_at
            .ok_or(MalformedSegment::MissingTimestamp)?;
        let duration_secs = candidate
            .duration_secs
            .filter(|d| d.is_finite() && *d >= 0.0)
            .ok_or(MalformedSegment::BadDuration)?;

        Ok(Segment {
            file_path,
            started_at,
            duration_secs,
        })
    }
}

/// Bounded FIFO of recent segments, capped by total duration
#[derive(Debug, Clone)]
pub struct SegmentBuffer {
    max_seconds: f64,
    segments: VecDeque<Segment>,
}

impl SegmentBuffer {
    pub fn new(max_seconds: f64) -> Self {
        Self {
            max_seconds,
            segments: VecDeque::new(),
        }
    }

    pub fn max_seconds(&self) -> f64 {
        self.max_seconds
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Validate and append a raw report; malformed input is dropped.
    ///
    /// Returns whether the candidate was accepted.
    pub fn add_segment(&mut self, candidate: SegmentCandidate) -> bool {
        match Segment::try_from(candidate) {
            Ok(segment) => {
                self.push(segment);
                true
            }
            Err(reason) => {
                tracing::debug!("Dropping malformed segment: {:?}", reason);
                false
            }
        }
    }

    /// Append an already validated segment, then prune
    pub fn push(&mut self, segment: Segment) {
        self.segments.push_back(segment);
        self.prune();
    }

    /// Evict from the front until the buffer fits its window.
    ///
    /// Entries older than the newest entry's start minus the window are
    /// evicted too, so a gap in the stream does not leave stale pre-roll.
    pub fn prune(&mut self) {
        while self.total_duration() > self.max_seconds {
            self.segments.pop_front();
        }

        let Some(newest) = self.segments.back().map(|s| s.started_at) else {
            return;
        };
        // A window reaching before the representable range has no horizon
        let Some(horizon) = newest.checked_sub_signed(secs_to_duration(self.max_seconds)) else {
            return;
        };
        while self
            .segments
            .front()
            .is_some_and(|oldest| oldest.started_at < horizon)
        {
            self.segments.pop_front();
        }
    }

    /// Sum of buffered segment durations in seconds
    pub fn total_duration(&self) -> f64 {
        self.segments.iter().map(|s| s.duration_secs).sum()
    }

    /// Segments that started within `window_secs` before `now`
    pub fn recent_segments(&self, window_secs: f64, now: DateTime<Utc>) -> Vec<Segment> {
        let Some(since) = now.checked_sub_signed(secs_to_duration(window_secs)) else {
            return self.snapshot();
        };
        self.segments
            .iter()
            .filter(|s| s.started_at >= since)
            .cloned()
            .collect()
    }

    /// Owned copy of the buffer contents, oldest first
    pub fn snapshot(&self) -> Vec<Segment> {
        self.segments.iter().cloned().collect()
    }

    pub fn newest_started_at(&self) -> Option<DateTime<Utc>> {
        self.segments.back().map(|s| s.started_at)
    }
}

/// Age of the newest buffered segment relative to `now`
pub fn newest_age(buffer: &SegmentBuffer, now: DateTime<Utc>) -> Option<Duration> {
    buffer.newest_started_at().map(|t| now - t)
}
