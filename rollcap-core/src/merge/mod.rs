//! Incremental merge of finalized segments into one rolling artifact.
//!
//! ## Per-segment step
//!
//! ```text
//! finalized segment N
//!     │  (damaged or index <= last appended → skipped)
//!     ▼
//! store.append(merged, N)        ── fail → roll back to previous length, retry
//!     │
//!     ▼
//! frames > window ?  → store.truncate(merged, overflow..frames)   (head-trim)
//! ```
//!
//! The artifact never holds more than one window plus one segment, so every
//! step costs one segment append plus at most one window-sized rewrite,
//! regardless of how long the session has been running.

pub mod trim;
pub mod worker;

use std::sync::{atomic::Ordering, Arc};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::audio::AudioFormat;
use crate::engine::diagnostics::CaptureDiagnostics;
use crate::error::{Result, RollcapError};
use crate::segment::Segment;
use crate::store::{ContainerStore, ResourceHandle};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergedArtifact {
    pub handle: ResourceHandle,
    pub format: AudioFormat,
    pub frames: u64,
    pub last_appended_segment: Option<u64>,
}

impl MergedArtifact {
    pub fn cumulative_duration(&self) -> Duration {
        self.format.frames_to_duration(self.frames)
    }
}

#[derive(Debug)]
pub enum MergeOutcome {
    Appended { frames: u64, trimmed: u64 },
    Skipped(RollcapError),
}

impl MergeOutcome {
    pub fn is_appended(&self) -> bool {
        matches!(self, Self::Appended { .. })
    }
}

pub struct IncrementalMerger {
    store: Arc<dyn ContainerStore>,
    artifact: MergedArtifact,
    window_frames: u64,
    retries: u32,
    skipped: Vec<u64>,
    diagnostics: Arc<CaptureDiagnostics>,
}

impl IncrementalMerger {
    /// Create an empty merged container at `handle`.
    pub fn new(
        store: Arc<dyn ContainerStore>,
        handle: ResourceHandle,
        format: AudioFormat,
        window: Duration,
        retries: u32,
        diagnostics: Arc<CaptureDiagnostics>,
    ) -> Result<Self> {
        store.create(&handle, format)?.finalize()?;
        info!(container = %handle, window_ms = window.as_millis() as u64, "merged artifact created");
        let artifact = MergedArtifact {
            handle,
            format,
            frames: 0,
            last_appended_segment: None,
        };
        Ok(Self::resume(store, artifact, window, retries, diagnostics))
    }

    /// Continue merging onto an existing artifact.
    pub fn resume(
        store: Arc<dyn ContainerStore>,
        artifact: MergedArtifact,
        window: Duration,
        retries: u32,
        diagnostics: Arc<CaptureDiagnostics>,
    ) -> Self {
        let window_frames = artifact.format.duration_to_frames(window);
        Self {
            store,
            artifact,
            window_frames,
            retries,
            skipped: Vec::new(),
            diagnostics,
        }
    }

    pub fn current_artifact(&self) -> &MergedArtifact {
        &self.artifact
    }

    pub fn window_frames(&self) -> u64 {
        self.window_frames
    }

    /// Indices of segments permanently left out of the artifact.
    pub fn skipped(&self) -> &[u64] {
        &self.skipped
    }

    /// Copy the artifact into a new container at `handle` and continue from
    /// there. The original artifact is not touched by the returned merger.
    pub fn fork(&self, handle: ResourceHandle) -> Result<Self> {
        self.store.create(&handle, self.artifact.format)?.finalize()?;
        let frames = if self.artifact.frames > 0 {
            self.store.append(&handle, &self.artifact.handle)?
        } else {
            0
        };
        debug!(from = %self.artifact.handle, to = %handle, frames, "merged artifact forked");
        Ok(Self {
            store: Arc::clone(&self.store),
            artifact: MergedArtifact {
                handle,
                frames,
                ..self.artifact.clone()
            },
            window_frames: self.window_frames,
            retries: self.retries,
            skipped: self.skipped.clone(),
            diagnostics: Arc::clone(&self.diagnostics),
        })
    }

    /// Append a segment, then head-trim back to the window.
    pub fn on_segment_finalized(&mut self, segment: &Segment) -> MergeOutcome {
        match self.append_segment(segment) {
            MergeOutcome::Appended { frames, .. } => {
                let trimmed = match self.head_trim_to(self.window_frames) {
                    Ok(trimmed) => trimmed,
                    Err(e) => {
                        // Overflow stays bounded: the next step trims again.
                        warn!(segment = segment.index, error = %e, "head-trim failed");
                        0
                    }
                };
                MergeOutcome::Appended { frames, trimmed }
            }
            skipped => skipped,
        }
    }

    /// Append a segment without trimming. Retries per configuration.
    pub fn append_segment(&mut self, segment: &Segment) -> MergeOutcome {
        if let Some(reason) = &segment.damaged {
            self.skipped.push(segment.index);
            return MergeOutcome::Skipped(RollcapError::SegmentIo {
                index: segment.index,
                message: reason.clone(),
            });
        }
        if let Some(last) = self.artifact.last_appended_segment {
            if segment.index <= last {
                return MergeOutcome::Skipped(RollcapError::RetentionInvariantViolation(format!(
                    "segment {} offered after segment {last} was already merged",
                    segment.index
                )));
            }
        }

        let attempts = 1 + self.retries;
        let mut last_error = None;
        for attempt in 1..=attempts {
            let before = self.artifact.frames;
            match self.store.append(&self.artifact.handle, &segment.handle) {
                Ok(frames) => {
                    if frames != segment.frames {
                        warn!(
                            segment = segment.index,
                            expected = segment.frames,
                            appended = frames,
                            "segment frame count differs from container"
                        );
                    }
                    self.artifact.frames += frames;
                    self.artifact.last_appended_segment = Some(segment.index);
                    self.diagnostics
                        .segments_merged
                        .fetch_add(1, Ordering::Relaxed);
                    debug!(
                        segment = segment.index,
                        frames,
                        total = self.artifact.frames,
                        "segment merged"
                    );
                    return MergeOutcome::Appended { frames, trimmed: 0 };
                }
                Err(e) => {
                    warn!(segment = segment.index, attempt, error = %e, "segment append failed");
                    self.roll_back(before);
                    if attempt < attempts {
                        self.diagnostics.merge_retries.fetch_add(1, Ordering::Relaxed);
                    }
                    last_error = Some(e);
                }
            }
        }

        self.diagnostics
            .merge_failures
            .fetch_add(1, Ordering::Relaxed);
        self.skipped.push(segment.index);
        MergeOutcome::Skipped(RollcapError::MergeFailure {
            index: segment.index,
            message: last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "append failed".into()),
        })
    }

    /// Drop frames from the head until at most `target_frames` remain.
    /// Returns the number of frames removed.
    pub fn head_trim_to(&mut self, target_frames: u64) -> Result<u64> {
        if self.artifact.frames <= target_frames {
            return Ok(0);
        }
        let overflow = self.artifact.frames - target_frames;
        let remaining = self
            .store
            .truncate(&self.artifact.handle, overflow..self.artifact.frames)
            .map_err(|e| RollcapError::TrimFailure(e.to_string()))?;
        self.artifact.frames = remaining;
        self.diagnostics.head_trims.fetch_add(1, Ordering::Relaxed);
        debug!(overflow, remaining, "merged artifact head-trimmed");
        Ok(overflow)
    }

    /// Restore the artifact to `frames` after a failed append.
    fn roll_back(&mut self, frames: u64) {
        match self.store.stat(&self.artifact.handle) {
            Ok(stat) if stat.frames == frames => {}
            Ok(stat) => {
                warn!(from = stat.frames, to = frames, "rolling back partial append");
                match self.store.truncate(&self.artifact.handle, 0..frames) {
                    Ok(remaining) => self.artifact.frames = remaining,
                    Err(e) => warn!(error = %e, "rollback truncate failed"),
                }
            }
            Err(e) => warn!(error = %e, "cannot stat merged artifact after failed append"),
        }
    }
}
