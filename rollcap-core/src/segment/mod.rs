//! Segment files and the writer that owns the active one.
//!
//! ## Lifecycle
//!
//! ```text
//! SegmentWriter::open()      → active segment N, container created
//!     └─► write(chunk)*      → frames appended to N
//!         └─► rotate()       → N finalized (moved out), N+1 opened
//!             └─► finalize() → last segment moved out, nothing active
//! ```
//!
//! At most one segment is active. A finalized [`Segment`] is returned by
//! value; the writer keeps no reference to it afterwards.

pub mod scheduler;

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::audio::{AudioFormat, EncodedChunk};
use crate::error::{Result, RollcapError};
use crate::store::{ContainerStore, ContainerWriter, ResourceHandle};

/// Where a finalized segment stands with respect to the merged artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MergeState {
    Pending,
    Merged,
    /// Permanently skipped; kept on disk for manual recovery until evicted.
    Failed,
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Segment {
    pub index: u64,
    pub handle: ResourceHandle,
    /// Media offset of the first frame from session start.
    pub start_offset: Duration,
    pub length: Duration,
    pub frames: u64,
    pub finalized: bool,
    pub merge_state: MergeState,
    /// Set when a write to this segment failed; such segments are never merged.
    pub damaged: Option<String>,
}

struct ActiveSegment {
    index: u64,
    handle: ResourceHandle,
    start_frames: u64,
    writer: Option<Box<dyn ContainerWriter>>,
    frames: u64,
    damaged: Option<String>,
}

pub struct SegmentWriter {
    store: Arc<dyn ContainerStore>,
    format: AudioFormat,
    dir: String,
    next_index: u64,
    /// Frames written across all finalized segments.
    media_frames: u64,
    active: Option<ActiveSegment>,
}

impl SegmentWriter {
    /// `dir` is the handle prefix segment containers are created under.
    pub fn new(store: Arc<dyn ContainerStore>, format: AudioFormat, dir: impl Into<String>) -> Self {
        Self {
            store,
            format,
            dir: dir.into(),
            next_index: 0,
            media_frames: 0,
            active: None,
        }
    }

    pub fn segment_handle(dir: &str, index: u64) -> ResourceHandle {
        ResourceHandle::new(format!("{dir}/seg-{index:06}.wav"))
    }

    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    pub fn active_index(&self) -> Option<u64> {
        self.active.as_ref().map(|a| a.index)
    }

    pub fn active_frames(&self) -> u64 {
        self.active.as_ref().map(|a| a.frames).unwrap_or(0)
    }

    /// Frames across finalized segments plus the active one.
    pub fn total_frames(&self) -> u64 {
        self.media_frames + self.active_frames()
    }

    /// Open the next segment. Fails if one is already active.
    pub fn open(&mut self) -> Result<u64> {
        if let Some(active) = &self.active {
            return Err(RollcapError::RetentionInvariantViolation(format!(
                "segment {} is still active",
                active.index
            )));
        }
        let index = self.next_index;
        self.next_index += 1;
        let handle = Self::segment_handle(&self.dir, index);
        let writer = self
            .store
            .create(&handle, self.format)
            .map_err(|e| RollcapError::SegmentIo {
                index,
                message: e.to_string(),
            })?;
        debug!(segment = index, container = %handle, "segment opened");
        self.active = Some(ActiveSegment {
            index,
            handle,
            start_frames: self.media_frames,
            writer: Some(writer),
            frames: 0,
            damaged: None,
        });
        Ok(index)
    }

    /// Write a chunk into the active segment.
    ///
    /// A write failure marks the segment damaged and returns `SegmentIo`;
    /// later writes to the same segment are discarded until it is rotated.
    pub fn write(&mut self, chunk: &EncodedChunk) -> Result<()> {
        let channels = self.format.channels;
        let Some(active) = self.active.as_mut() else {
            return Err(RollcapError::NoActiveRecording);
        };
        if chunk.samples.len() % channels as usize != 0 {
            return Err(RollcapError::InvalidChunk(format!(
                "{} samples is not a whole number of {channels}-channel frames",
                chunk.samples.len()
            )));
        }
        let Some(writer) = active.writer.as_mut() else {
            return Ok(());
        };
        match writer.write(&chunk.samples) {
            Ok(()) => {
                active.frames += chunk.frames(channels);
                Ok(())
            }
            Err(e) => {
                let message = e.to_string();
                warn!(segment = active.index, error = %message, "segment write failed");
                active.damaged = Some(message.clone());
                active.writer = None;
                Err(RollcapError::SegmentIo {
                    index: active.index,
                    message,
                })
            }
        }
    }

    /// Close the active segment and hand it out.
    ///
    /// An empty, undamaged segment holds no audio: its container is deleted
    /// and `None` is returned.
    pub fn finalize(&mut self) -> Option<Segment> {
        let mut active = self.active.take()?;
        if let Some(writer) = active.writer.take() {
            if let Err(e) = writer.finalize() {
                warn!(segment = active.index, error = %e, "segment finalize failed");
                active.damaged = Some(e.to_string());
            }
        }

        if active.frames == 0 && active.damaged.is_none() {
            debug!(segment = active.index, "discarding empty segment");
            if let Err(e) = self.store.delete(&active.handle) {
                warn!(segment = active.index, error = %e, "failed to delete empty segment");
            }
            return None;
        }

        self.media_frames += active.frames;
        let segment = Segment {
            index: active.index,
            handle: active.handle,
            start_offset: self.format.frames_to_duration(active.start_frames),
            length: self.format.frames_to_duration(active.frames),
            frames: active.frames,
            finalized: true,
            merge_state: MergeState::Pending,
            damaged: active.damaged,
        };
        debug!(
            segment = segment.index,
            frames = segment.frames,
            damaged = segment.damaged.is_some(),
            "segment finalized"
        );
        Some(segment)
    }

    /// Finalize the active segment and immediately open the next one.
    ///
    /// The next segment is opened even when the current one is discarded, so
    /// capture never gaps.
    pub fn rotate(&mut self) -> Result<Option<Segment>> {
        let finalized = self.finalize();
        self.open()?;
        Ok(finalized)
    }
}
