//! Deterministic tone generator standing in for a real encoder.
//!
//! Used by the benchmark and integration tests so the whole capture → merge →
//! trim path can be exercised without a capture device. In
//! [`Pacing::RealTime`] mode a background thread pushes one chunk per
//! `chunk_ms`; in [`Pacing::Manual`] mode the caller pulls chunks with
//! [`StubEncoder::next_chunk`].

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::debug;

use super::{AudioEncoder, AudioFormat, ChunkSink, EncodedChunk};
use crate::error::Result;

const TONE_HZ: f32 = 440.0;
const AMPLITUDE: f32 = 0.25;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pacing {
    RealTime,
    Manual,
}

/// Shared tone state so paced and pulled chunks continue one timeline.
struct ToneState {
    format: AudioFormat,
    chunk_frames: u64,
    frames_emitted: u64,
}

impl ToneState {
    fn next_chunk(&mut self) -> EncodedChunk {
        let pts = self.format.frames_to_duration(self.frames_emitted);
        let channels = self.format.channels as usize;
        let mut samples = Vec::with_capacity(self.chunk_frames as usize * channels);
        for i in 0..self.chunk_frames {
            let t = (self.frames_emitted + i) as f32 / self.format.sample_rate as f32;
            let v = (t * TONE_HZ * std::f32::consts::TAU).sin() * AMPLITUDE;
            let s = (v * i16::MAX as f32) as i16;
            samples.extend(std::iter::repeat(s).take(channels));
        }
        self.frames_emitted += self.chunk_frames;
        EncodedChunk::new(pts, samples)
    }
}

pub struct StubEncoder {
    pacing: Pacing,
    chunk_ms: u64,
    state: Arc<Mutex<Option<ToneState>>>,
    running: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl StubEncoder {
    pub fn new(pacing: Pacing, chunk_ms: u64) -> Self {
        Self {
            pacing,
            chunk_ms: chunk_ms.max(1),
            state: Arc::new(Mutex::new(None)),
            running: Arc::new(AtomicBool::new(false)),
            worker: None,
        }
    }

    /// Pull the next chunk. `None` until `start` has been called.
    pub fn next_chunk(&self) -> Option<EncodedChunk> {
        self.state.lock().as_mut().map(ToneState::next_chunk)
    }

    /// Standalone chunk generator for callers that bypass the encoder
    /// lifecycle entirely.
    pub fn tone_chunks(format: AudioFormat, chunk_ms: u64, total: Duration) -> Vec<EncodedChunk> {
        let chunk_frames = format.duration_to_frames(Duration::from_millis(chunk_ms)).max(1);
        let total_frames = format.duration_to_frames(total);
        let mut state = ToneState {
            format,
            chunk_frames,
            frames_emitted: 0,
        };
        let mut out = Vec::new();
        while state.frames_emitted < total_frames {
            state.chunk_frames = chunk_frames.min(total_frames - state.frames_emitted);
            out.push(state.next_chunk());
        }
        out
    }

    fn join_worker(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
    }
}

impl AudioEncoder for StubEncoder {
    fn start(&mut self, format: AudioFormat, sink: ChunkSink) -> Result<()> {
        self.join_worker();
        {
            let mut state = self.state.lock();
            let chunk_frames = format
                .duration_to_frames(Duration::from_millis(self.chunk_ms))
                .max(1);
            // A restarted encoder continues its timeline.
            let frames_emitted = state.as_ref().map(|s| s.frames_emitted).unwrap_or(0);
            *state = Some(ToneState {
                format,
                chunk_frames,
                frames_emitted,
            });
        }
        debug!(pacing = ?self.pacing, chunk_ms = self.chunk_ms, "StubEncoder::start");

        if self.pacing == Pacing::RealTime {
            self.running.store(true, Ordering::SeqCst);
            let running = Arc::clone(&self.running);
            let state = Arc::clone(&self.state);
            let interval = Duration::from_millis(self.chunk_ms);
            self.worker = Some(std::thread::spawn(move || {
                while running.load(Ordering::SeqCst) {
                    std::thread::sleep(interval);
                    let chunk = state.lock().as_mut().map(ToneState::next_chunk);
                    if let Some(chunk) = chunk {
                        sink.push(chunk);
                    }
                }
            }));
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<Vec<EncodedChunk>> {
        Ok(Vec::new())
    }

    fn stop(&mut self) -> Result<Vec<EncodedChunk>> {
        debug!("StubEncoder::stop");
        self.join_worker();
        Ok(Vec::new())
    }
}

impl Drop for StubEncoder {
    fn drop(&mut self) {
        self.join_worker();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FORMAT: AudioFormat = AudioFormat {
        sample_rate: 8_000,
        channels: 1,
    };

    #[test]
    fn tone_chunks_cover_requested_duration_exactly() {
        let chunks = StubEncoder::tone_chunks(FORMAT, 100, Duration::from_millis(1_050));
        let frames: u64 = chunks.iter().map(|c| c.frames(1)).sum();
        assert_eq!(frames, 8_400);
        assert_eq!(chunks.len(), 11);
        assert_eq!(chunks[10].pts, Duration::from_secs(1));
    }

    #[test]
    fn manual_pacing_pulls_monotonic_chunks() {
        let mut encoder = StubEncoder::new(Pacing::Manual, 20);
        assert!(encoder.next_chunk().is_none());

        let (tx, _rx) = crossbeam_channel::unbounded();
        let sink = ChunkSink::new(tx, Arc::default());
        encoder.start(FORMAT, sink).expect("start");
        let a = encoder.next_chunk().expect("chunk a");
        let b = encoder.next_chunk().expect("chunk b");
        assert!(b.pts > a.pts);
        assert_eq!(a.frames(1), 160);
        assert!(a.samples.iter().any(|s| *s != 0));
    }
}
