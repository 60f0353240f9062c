//! Filesystem collaborator contract.
//!
//! The engine addresses containers through opaque [`ResourceHandle`]s and
//! needs only create / append / truncate / delete / stat, plus rename to
//! publish the finished artifact. [`WavStore`] is the shipped implementation.

pub mod wav;

pub use wav::WavStore;

use std::fmt;
use std::ops::Range;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::audio::AudioFormat;
use crate::error::Result;

/// Opaque name of a container inside a store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceHandle(String);

impl ResourceHandle {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Result of a stat query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContainerStat {
    pub format: AudioFormat,
    /// Frames (samples per channel) recorded in the container header.
    pub frames: u64,
    pub bytes: u64,
}

/// Streaming writer for a freshly created container.
pub trait ContainerWriter: Send {
    /// Append interleaved PCM samples.
    fn write(&mut self, samples: &[i16]) -> Result<()>;

    /// Frames written so far.
    fn frames(&self) -> u64;

    /// Flush and close. Returns the total frame count.
    fn finalize(self: Box<Self>) -> Result<u64>;
}

pub trait ContainerStore: Send + Sync + 'static {
    /// Create an empty container and return a writer positioned at its start.
    fn create(&self, handle: &ResourceHandle, format: AudioFormat)
        -> Result<Box<dyn ContainerWriter>>;

    /// Append every frame of `src` onto `dst` without re-encoding.
    /// Returns the number of frames appended.
    fn append(&self, dst: &ResourceHandle, src: &ResourceHandle) -> Result<u64>;

    /// Keep only frames in `keep`, dropping everything else.
    /// Returns the remaining frame count.
    fn truncate(&self, handle: &ResourceHandle, keep: Range<u64>) -> Result<u64>;

    /// Delete a container. Deleting a missing container is not an error.
    fn delete(&self, handle: &ResourceHandle) -> Result<()>;

    fn stat(&self, handle: &ResourceHandle) -> Result<ContainerStat>;

    fn exists(&self, handle: &ResourceHandle) -> bool;

    /// Atomically move `from` to `to`, replacing `to` if present.
    fn rename(&self, from: &ResourceHandle, to: &ResourceHandle) -> Result<()>;

    /// Filesystem path of a handle, for reporting to the host.
    fn locate(&self, handle: &ResourceHandle) -> PathBuf;
}
