//! Stop-time finalization: append the last segment once, then one trim.
//!
//! Because the merged artifact is kept within the window throughout the
//! session, the work here is bounded by one segment append plus one
//! window-sized rewrite.

use std::time::Duration;

use tracing::{info, warn};

use crate::ipc::events::DegradedReason;
use crate::merge::{IncrementalMerger, MergeOutcome, MergedArtifact};
use crate::segment::{MergeState, Segment};

/// What the final merge produced.
#[derive(Debug)]
pub struct TrimReport {
    pub artifact: MergedArtifact,
    /// The last segment with its merge state settled, if there was one.
    pub final_segment: Option<Segment>,
    pub degraded: Option<DegradedReason>,
    pub trimmed_frames: u64,
}

pub struct PrecisionTrimmer {
    window_frames: u64,
}

impl PrecisionTrimmer {
    pub fn new(window_frames: u64) -> Self {
        Self { window_frames }
    }

    /// Merge `last` (if not already merged) and trim the artifact to the
    /// smaller of the window and `usable`.
    pub fn finalize(
        &self,
        merger: &mut IncrementalMerger,
        last: Option<Segment>,
        usable: Duration,
    ) -> TrimReport {
        let mut degraded = None;
        let final_segment = last.map(|mut segment| {
            let already_merged = merger
                .current_artifact()
                .last_appended_segment
                .is_some_and(|merged| merged >= segment.index);
            if already_merged {
                segment.merge_state = MergeState::Merged;
                return segment;
            }
            match merger.append_segment(&segment) {
                MergeOutcome::Appended { .. } => segment.merge_state = MergeState::Merged,
                MergeOutcome::Skipped(reason) => {
                    warn!(segment = segment.index, error = %reason, "final segment not merged");
                    segment.merge_state = MergeState::Failed;
                    degraded = Some(if segment.damaged.is_some() {
                        DegradedReason::FinalSegmentSkipped
                    } else {
                        DegradedReason::FinalAppendFailed
                    });
                }
            }
            segment
        });

        let format = merger.current_artifact().format;
        let target = self.window_frames.min(format.duration_to_frames(usable));
        let trimmed_frames = match merger.head_trim_to(target) {
            Ok(trimmed) => trimmed,
            Err(e) => {
                warn!(error = %e, "final trim failed; returning untrimmed artifact");
                degraded = Some(DegradedReason::TrimFailed);
                0
            }
        };

        let artifact = merger.current_artifact().clone();
        info!(
            frames = artifact.frames,
            duration_ms = artifact.cumulative_duration().as_millis() as u64,
            trimmed_frames,
            "final merge complete"
        );
        TrimReport {
            artifact,
            final_segment,
            degraded,
            trimmed_frames,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::audio::{AudioFormat, EncodedChunk};
    use crate::merge::test_support::FlakyStore;
    use crate::segment::SegmentWriter;
    use crate::store::{ContainerStore, ResourceHandle, WavStore};

    const FORMAT: AudioFormat = AudioFormat {
        sample_rate: 8_000,
        channels: 1,
    };

    fn setup(
        store: Arc<dyn ContainerStore>,
        window: Duration,
        seconds: &[u64],
    ) -> (IncrementalMerger, Vec<Segment>) {
        let mut writer = SegmentWriter::new(store.clone(), FORMAT, "segments");
        let mut segments = Vec::new();
        for secs in seconds {
            writer.open().expect("open");
            let frames = FORMAT.duration_to_frames(Duration::from_secs(*secs)) as usize;
            writer
                .write(&EncodedChunk::new(Duration::ZERO, vec![3; frames]))
                .expect("write");
            segments.push(writer.finalize().expect("segment"));
        }
        let merger = IncrementalMerger::new(
            store,
            ResourceHandle::new("merged.wav"),
            FORMAT,
            window,
            0,
            Arc::default(),
        )
        .expect("merger");
        (merger, segments)
    }

    #[test]
    fn appends_final_segment_and_trims_to_window() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store: Arc<dyn ContainerStore> = Arc::new(WavStore::new(dir.path()).expect("store"));
        let (mut merger, mut segments) = setup(store, Duration::from_secs(3), &[2, 2, 1]);
        let last = segments.pop();
        for segment in &segments {
            merger.on_segment_finalized(segment);
        }
        assert_eq!(merger.current_artifact().frames, 24_000);

        let trimmer = PrecisionTrimmer::new(merger.window_frames());
        let report = trimmer.finalize(&mut merger, last, Duration::from_secs(5));
        assert!(report.degraded.is_none());
        assert_eq!(report.artifact.cumulative_duration(), Duration::from_secs(3));
        assert_eq!(report.trimmed_frames, 8_000);
        let last = report.final_segment.expect("final segment");
        assert_eq!(last.merge_state, MergeState::Merged);
    }

    #[test]
    fn usable_duration_caps_result_below_window() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store: Arc<dyn ContainerStore> = Arc::new(WavStore::new(dir.path()).expect("store"));
        let (mut merger, mut segments) = setup(store, Duration::from_secs(10), &[2, 2]);
        let last = segments.pop();
        merger.on_segment_finalized(&segments[0]);

        let trimmer = PrecisionTrimmer::new(merger.window_frames());
        let report = trimmer.finalize(&mut merger, last, Duration::from_secs(3));
        assert_eq!(report.artifact.cumulative_duration(), Duration::from_secs(3));
    }

    #[test]
    fn already_merged_final_segment_is_not_appended_twice() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store: Arc<dyn ContainerStore> = Arc::new(WavStore::new(dir.path()).expect("store"));
        let (mut merger, mut segments) = setup(store, Duration::from_secs(10), &[1]);
        merger.on_segment_finalized(&segments[0]);
        let last = segments.pop();

        let trimmer = PrecisionTrimmer::new(merger.window_frames());
        let report = trimmer.finalize(&mut merger, last, Duration::from_secs(10));
        assert_eq!(report.artifact.frames, 8_000);
    }

    #[test]
    fn failed_final_append_degrades_but_keeps_merged_audio() {
        let dir = tempfile::tempdir().expect("tempdir");
        let flaky = Arc::new(FlakyStore::new(WavStore::new(dir.path()).expect("store"), 0));
        let store: Arc<dyn ContainerStore> = flaky.clone();
        let (mut merger, mut segments) = setup(store, Duration::from_secs(10), &[1, 1]);
        let last = segments.pop();
        merger.on_segment_finalized(&segments[0]);
        flaky
            .failing_appends
            .store(1, std::sync::atomic::Ordering::SeqCst);

        let trimmer = PrecisionTrimmer::new(merger.window_frames());
        let report = trimmer.finalize(&mut merger, last, Duration::from_secs(2));
        assert_eq!(report.degraded, Some(DegradedReason::FinalAppendFailed));
        assert_eq!(report.artifact.frames, 8_000);
        let last = report.final_segment.expect("final segment");
        assert_eq!(last.merge_state, MergeState::Failed);
    }

    #[test]
    fn trim_failure_returns_untrimmed_artifact() {
        let dir = tempfile::tempdir().expect("tempdir");
        let flaky = Arc::new(FlakyStore::new(WavStore::new(dir.path()).expect("store"), 0));
        let store: Arc<dyn ContainerStore> = flaky.clone();
        let (mut merger, mut segments) = setup(store, Duration::from_secs(10), &[2]);
        let last = segments.pop();
        flaky
            .failing_truncates
            .store(1, std::sync::atomic::Ordering::SeqCst);

        let trimmer = PrecisionTrimmer::new(merger.window_frames());
        let report = trimmer.finalize(&mut merger, last, Duration::from_secs(1));
        assert_eq!(report.degraded, Some(DegradedReason::TrimFailed));
        assert_eq!(report.artifact.frames, 16_000);
    }
}
