//! Atomic counters shared by the capture thread and the merge worker.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

#[derive(Default)]
pub struct CaptureDiagnostics {
    pub chunks_in: AtomicU64,
    pub chunks_dropped: AtomicU64,
    pub chunks_out_of_order: AtomicU64,
    pub frames_written: AtomicU64,
    pub segments_finalized: AtomicU64,
    pub segments_merged: AtomicU64,
    pub segments_evicted: AtomicU64,
    pub merge_retries: AtomicU64,
    pub merge_failures: AtomicU64,
    pub segment_io_failures: AtomicU64,
    pub head_trims: AtomicU64,
}

impl CaptureDiagnostics {
    pub fn reset(&self) {
        for counter in self.counters() {
            counter.store(0, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        DiagnosticsSnapshot {
            chunks_in: self.chunks_in.load(Ordering::Relaxed),
            chunks_dropped: self.chunks_dropped.load(Ordering::Relaxed),
            chunks_out_of_order: self.chunks_out_of_order.load(Ordering::Relaxed),
            frames_written: self.frames_written.load(Ordering::Relaxed),
            segments_finalized: self.segments_finalized.load(Ordering::Relaxed),
            segments_merged: self.segments_merged.load(Ordering::Relaxed),
            segments_evicted: self.segments_evicted.load(Ordering::Relaxed),
            merge_retries: self.merge_retries.load(Ordering::Relaxed),
            merge_failures: self.merge_failures.load(Ordering::Relaxed),
            segment_io_failures: self.segment_io_failures.load(Ordering::Relaxed),
            head_trims: self.head_trims.load(Ordering::Relaxed),
        }
    }

    fn counters(&self) -> [&AtomicU64; 11] {
        [
            &self.chunks_in,
            &self.chunks_dropped,
            &self.chunks_out_of_order,
            &self.frames_written,
            &self.segments_finalized,
            &self.segments_merged,
            &self.segments_evicted,
            &self.merge_retries,
            &self.merge_failures,
            &self.segment_io_failures,
            &self.head_trims,
        ]
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticsSnapshot {
    pub chunks_in: u64,
    pub chunks_dropped: u64,
    pub chunks_out_of_order: u64,
    pub frames_written: u64,
    pub segments_finalized: u64,
    pub segments_merged: u64,
    pub segments_evicted: u64,
    pub merge_retries: u64,
    pub merge_failures: u64,
    pub segment_io_failures: u64,
    pub head_trims: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_zeroes_every_counter() {
        let diag = CaptureDiagnostics::default();
        for counter in diag.counters() {
            counter.fetch_add(3, Ordering::Relaxed);
        }
        assert_eq!(diag.snapshot().head_trims, 3);
        diag.reset();
        assert_eq!(diag.snapshot(), DiagnosticsSnapshot::default());
    }
}
