//! Encoder collaborator contract.
//!
//! The engine never touches a capture device. An [`AudioEncoder`] owns the
//! device and the raw-to-encoded conversion; the engine only sends it
//! start / flush / stop signals and receives [`EncodedChunk`]s through a
//! [`ChunkSink`].
//!
//! Chunks are interleaved 16-bit PCM frames. The WAV container is the codec,
//! so container-level append copies frames verbatim.

pub mod stub;

use std::sync::{atomic::Ordering, Arc};
use std::time::Duration;

use crossbeam_channel::{Sender, TrySendError};
use serde::{Deserialize, Serialize};

use crate::engine::diagnostics::CaptureDiagnostics;
use crate::error::Result;
use crate::session::CaptureMessage;

/// Sample rate + channel layout shared by every container of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

impl AudioFormat {
    pub const BITS_PER_SAMPLE: u16 = 16;

    pub fn pcm_bitrate(&self) -> u32 {
        self.sample_rate * self.channels as u32 * Self::BITS_PER_SAMPLE as u32
    }

    pub fn frames_to_duration(&self, frames: u64) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        let secs = frames / self.sample_rate as u64;
        let rem = frames % self.sample_rate as u64;
        Duration::from_secs(secs)
            + Duration::from_nanos(rem * 1_000_000_000 / self.sample_rate as u64)
    }

    /// Rounds to the nearest frame.
    pub fn duration_to_frames(&self, duration: Duration) -> u64 {
        let nanos = duration.as_nanos() * self.sample_rate as u128;
        ((nanos + 500_000_000) / 1_000_000_000) as u64
    }
}

/// One block of encoded audio with its presentation timestamp.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedChunk {
    /// Offset from encoder start. Monotonically increasing within a session.
    pub pts: Duration,
    /// Interleaved PCM frames.
    pub samples: Vec<i16>,
}

impl EncodedChunk {
    pub fn new(pts: Duration, samples: Vec<i16>) -> Self {
        Self { pts, samples }
    }

    pub fn frames(&self, channels: u16) -> u64 {
        (self.samples.len() / channels.max(1) as usize) as u64
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Contract for the external encoder / capture device.
///
/// `flush` and `stop` return chunks the encoder still holds so the engine can
/// write them into the segment being finalized; nothing is lost at a
/// rotation or pause boundary.
pub trait AudioEncoder: Send + 'static {
    /// Begin producing chunks into `sink`. Called once, on the capture
    /// thread, when the session opens. Chunks pushed while capture is halted
    /// are discarded by the session.
    fn start(&mut self, format: AudioFormat, sink: ChunkSink) -> Result<()>;

    /// Drain buffered encoder state without stopping.
    fn flush(&mut self) -> Result<Vec<EncodedChunk>>;

    /// Stop producing chunks and return whatever was still buffered.
    fn stop(&mut self) -> Result<Vec<EncodedChunk>>;
}

/// Producer half handed to the encoder.
///
/// `push` never blocks: a full inbox drops the chunk and counts it, the same
/// contract a real-time audio callback needs.
#[derive(Clone)]
pub struct ChunkSink {
    tx: Sender<CaptureMessage>,
    diagnostics: Arc<CaptureDiagnostics>,
}

impl ChunkSink {
    pub(crate) fn new(tx: Sender<CaptureMessage>, diagnostics: Arc<CaptureDiagnostics>) -> Self {
        Self { tx, diagnostics }
    }

    /// Returns `false` if the chunk was dropped.
    pub fn push(&self, chunk: EncodedChunk) -> bool {
        match self.tx.try_send(CaptureMessage::Chunk(chunk)) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.diagnostics
                    .chunks_dropped
                    .fetch_add(1, Ordering::Relaxed);
                false
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }

    /// Report an unrecoverable encoder/device failure.
    pub fn fail(&self, message: impl Into<String>) {
        let _ = self.tx.send(CaptureMessage::EncoderFailed(message.into()));
    }
}

impl std::fmt::Debug for ChunkSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkSink").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_duration_conversions_are_exact_on_whole_frames() {
        let format = AudioFormat {
            sample_rate: 8_000,
            channels: 2,
        };
        assert_eq!(format.frames_to_duration(8_000), Duration::from_secs(1));
        assert_eq!(format.frames_to_duration(4_000), Duration::from_millis(500));
        assert_eq!(format.duration_to_frames(Duration::from_millis(250)), 2_000);
        assert_eq!(format.pcm_bitrate(), 256_000);
    }

    #[test]
    fn chunk_frames_account_for_channels() {
        let chunk = EncodedChunk::new(Duration::ZERO, vec![0; 960]);
        assert_eq!(chunk.frames(2), 480);
        assert_eq!(chunk.frames(1), 960);
    }
}
