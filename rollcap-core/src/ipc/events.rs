//! Event types emitted to the host application.
//!
//! | Event | Channel |
//! |-------|---------|
//! | `RecorderEvent` | `"rollcap://event"` |
//! | `RecorderStatusEvent` | `"rollcap://status"` |
//!
//! Delivery is fire-and-forget and at most once: events sent while nobody is
//! subscribed are dropped.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ErrorKind;

// ---------------------------------------------------------------------------
// Recorder events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum InterruptionKind {
    /// The capture device was taken; capture halts.
    Critical,
    /// Capture continues but the span is excluded from usable duration.
    NonCritical,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum RecorderEvent {
    DurationChanged {
        elapsed_ms: u64,
    },
    SegmentRotated {
        index: u64,
        duration_ms: u64,
    },
    InterruptionBegan {
        kind: InterruptionKind,
    },
    InterruptionEnded {
        kind: InterruptionKind,
    },
    Error {
        kind: ErrorKind,
        message: String,
        /// `false` for warnings the session recovered from.
        fatal: bool,
    },
}

// ---------------------------------------------------------------------------
// Status events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecorderStatusEvent {
    pub status: RecorderStatus,
    /// Optional human-readable detail (e.g. error message).
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecorderStatus {
    /// Created, `start()` not yet called.
    Idle,
    Recording,
    /// Manually paused.
    Paused,
    Interrupted,
    /// Final merge + trim in progress.
    Stopping,
    Stopped,
    /// Capture failed; `stop()` still returns what was recorded.
    Error,
}

// ---------------------------------------------------------------------------
// Stop result
// ---------------------------------------------------------------------------

/// Why a finished recording is not the exact trimmed result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DegradedReason {
    /// The final segment could not be appended; it is left on disk.
    FinalAppendFailed,
    /// The final segment was damaged during capture and never appended.
    FinalSegmentSkipped,
    /// The final head-trim failed; the artifact may exceed the window.
    TrimFailed,
    /// The final merge did not finish within the stop timeout.
    StopTimedOut,
    /// Publishing the output failed; the merged artifact is returned in place.
    FinalMergeFailed,
    /// Reassembled from a leftover session directory.
    Recovered,
}

/// The finished, trimmed artifact returned by `stop()`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinishedRecording {
    pub path: PathBuf,
    pub duration_ms: u64,
    pub sample_rate: u32,
    pub channels: u16,
    pub bitrate: u32,
    pub created_at: DateTime<Utc>,
    pub segments_recorded: u64,
    pub degraded: Option<DegradedReason>,
}

impl FinishedRecording {
    pub fn duration(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.duration_ms)
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.is_some()
    }
}
