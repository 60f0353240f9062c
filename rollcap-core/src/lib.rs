//! # rollcap-core
//!
//! Bounded-window rolling audio capture engine.
//!
//! Records continuously, keeps only the trailing `window` of audio on disk,
//! and returns a finished, trimmed recording on stop in time independent of
//! how long the session ran.
//!
//! ## Architecture
//!
//! ```text
//! AudioEncoder ─► ChunkSink ─► inbox ─► RecordingSession (capture thread)
//!                                 ▲          │  SegmentWriter: seg-N.wav
//!           SegmentScheduler ─────┘          │  DurationTracker / InterruptionCoordinator
//!           (Rotate / Tick)                  ▼
//!                                     MergeWorker (merge thread)
//!                                        │  RetentionManager: ≤ ceil(window / segment) files
//!                                        │  IncrementalMerger: append + head-trim
//!                                        ▼
//!                                  merged.wav ──stop──► PrecisionTrimmer ─► <session>.wav
//! ```
//!
//! The capture thread never waits on a merge: finalized segments are handed
//! to the merge thread, which keeps the merged artifact within one window at
//! all times.

#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub mod audio;
pub mod config;
pub mod engine;
pub mod error;
pub mod ipc;
pub mod merge;
pub mod recovery;
pub mod retention;
pub mod segment;
pub mod session;
pub mod store;

// Convenience re-exports for downstream crates
pub use audio::stub::{Pacing, StubEncoder};
pub use audio::{AudioEncoder, AudioFormat, ChunkSink, EncodedChunk};
pub use config::RecorderConfig;
pub use engine::diagnostics::DiagnosticsSnapshot;
pub use engine::RollingRecorder;
pub use error::{ErrorKind, RollcapError};
pub use ipc::events::{
    DegradedReason, FinishedRecording, InterruptionKind, RecorderEvent, RecorderStatus,
    RecorderStatusEvent,
};
pub use session::duration::{Clock, ManualClock, SystemClock};
pub use session::interruption::InterruptionSignal;
pub use store::{ContainerStore, ResourceHandle, WavStore};
