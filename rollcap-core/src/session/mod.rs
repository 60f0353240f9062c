//! The recording session actor.
//!
//! One `RecordingSession` exists per active recording and runs on the
//! capture thread. Everything that touches the active segment (chunk
//! ingestion, rotation, interruption transitions, stop) arrives as a
//! [`CaptureMessage`] on one inbox and is handled in order, so rotation and
//! stop can never interleave.
//!
//! ```text
//! encoder ──Chunk──┐
//! scheduler ─Rotate/Tick─┤
//! host ──Interruption/Stop─┴─► inbox ─► RecordingSession ──Segment──► MergeWorker
//! ```

pub mod duration;
pub mod interruption;

use std::sync::{atomic::Ordering, Arc};
use std::time::Duration;

use chrono::{DateTime, Utc};
use crossbeam_channel::{Receiver, Sender};
use tracing::{debug, error, info, info_span, warn};
use uuid::Uuid;

use crate::audio::{AudioEncoder, ChunkSink, EncodedChunk};
use crate::config::RecorderConfig;
use crate::engine::diagnostics::CaptureDiagnostics;
use crate::error::{Result, RollcapError};
use crate::ipc::events::{DegradedReason, FinishedRecording, RecorderEvent, RecorderStatus};
use crate::ipc::EventSink;
use crate::merge::worker::{FinalizeResult, MergeWorker, WorkerContext, WorkerSnapshot};
use crate::segment::scheduler::SegmentScheduler;
use crate::segment::{Segment, SegmentWriter};
use crate::store::ContainerStore;

use duration::{Clock, DurationTracker, SystemClock};
use interruption::{CoordinatorState, InterruptionCoordinator, InterruptionSignal};

/// Inbox depth: about 20 s of 20 ms chunks before the encoder starts dropping.
pub const INBOX_CAPACITY: usize = 1024;

pub enum CaptureMessage {
    Chunk(EncodedChunk),
    EncoderFailed(String),
    /// Timer rotation; ignored unless `epoch` matches the scheduler's.
    Rotate { epoch: u64 },
    RotateNow,
    Tick,
    Interruption(InterruptionSignal),
    Snapshot {
        reply: Sender<Option<WorkerSnapshot>>,
    },
    Stop {
        reply: Sender<Result<FinishedRecording>>,
    },
}

/// Both ends of a session inbox. The sender is what hosts and recorders post
/// to; the receiver goes to [`RecordingSession::run`].
pub struct SessionInbox {
    pub tx: Sender<CaptureMessage>,
    pub rx: Receiver<CaptureMessage>,
}

/// Collaborators a session is built from.
pub struct SessionSetup {
    pub config: RecorderConfig,
    pub store: Arc<dyn ContainerStore>,
    pub events: EventSink,
    pub diagnostics: Arc<CaptureDiagnostics>,
    pub clock: Arc<dyn Clock>,
    /// Spawn the rotation/progress timer. Off when the caller drives
    /// rotation by hand.
    pub timer_rotation: bool,
}

impl SessionSetup {
    pub fn new(config: RecorderConfig, store: Arc<dyn ContainerStore>) -> Self {
        Self {
            config,
            store,
            events: EventSink::new(),
            diagnostics: Arc::new(CaptureDiagnostics::default()),
            clock: Arc::new(SystemClock),
            timer_rotation: true,
        }
    }
}

pub struct RecordingSession {
    id: String,
    config: RecorderConfig,
    store: Arc<dyn ContainerStore>,
    writer: SegmentWriter,
    worker: Option<MergeWorker>,
    tracker: DurationTracker,
    coordinator: InterruptionCoordinator,
    scheduler: Option<SegmentScheduler>,
    encoder: Box<dyn AudioEncoder>,
    events: EventSink,
    diagnostics: Arc<CaptureDiagnostics>,
    clock: Arc<dyn Clock>,
    capture_halted: bool,
    failed: bool,
    last_pts: Option<Duration>,
    segments_recorded: u64,
    created_at: DateTime<Utc>,
}

impl RecordingSession {
    /// Open the first segment, spawn the merge worker and start the encoder.
    ///
    /// Returns the session together with its inbox.
    pub fn begin(
        setup: SessionSetup,
        mut encoder: Box<dyn AudioEncoder>,
    ) -> Result<(Self, SessionInbox)> {
        let SessionSetup {
            mut config,
            store,
            events,
            diagnostics,
            clock,
            timer_rotation,
        } = setup;
        config.normalize();
        config.validate()?;

        let id = Uuid::new_v4().to_string();
        let (inbox_tx, inbox_rx) = crossbeam_channel::bounded(INBOX_CAPACITY);

        let worker = MergeWorker::spawn(WorkerContext {
            session_id: id.clone(),
            store: Arc::clone(&store),
            config: config.clone(),
            events: events.clone(),
            diagnostics: Arc::clone(&diagnostics),
        })?;

        let mut writer = SegmentWriter::new(
            Arc::clone(&store),
            config.format(),
            format!("{id}/segments"),
        );
        writer.open()?;

        let tracker = DurationTracker::start(Arc::clone(&clock), config.effective_window());

        let scheduler = if timer_rotation {
            Some(SegmentScheduler::start(
                config.segment_length(),
                config.progress_interval(),
                inbox_tx.clone(),
            )?)
        } else {
            None
        };

        let sink = ChunkSink::new(inbox_tx.clone(), Arc::clone(&diagnostics));
        encoder
            .start(config.format(), sink)
            .map_err(|e| RollcapError::CaptureFailure(e.to_string()))?;

        info!(
            session = %id,
            window_s = config.window_secs,
            segment_s = config.segment_secs,
            sample_rate = config.sample_rate,
            channels = config.channels,
            "recording session started"
        );
        events.set_status(RecorderStatus::Recording, None);

        let session = Self {
            id,
            config,
            store,
            writer,
            worker: Some(worker),
            tracker,
            coordinator: InterruptionCoordinator::new(),
            scheduler,
            encoder,
            events,
            diagnostics,
            clock,
            capture_halted: false,
            failed: false,
            last_pts: None,
            segments_recorded: 0,
            created_at: Utc::now(),
        };
        Ok((
            session,
            SessionInbox {
                tx: inbox_tx,
                rx: inbox_rx,
            },
        ))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn config(&self) -> &RecorderConfig {
        &self.config
    }

    pub fn elapsed(&self) -> Duration {
        self.tracker.elapsed()
    }

    pub fn coordinator_state(&self) -> CoordinatorState {
        self.coordinator.state()
    }

    pub fn is_capture_halted(&self) -> bool {
        self.capture_halted
    }

    pub fn active_segment(&self) -> Option<u64> {
        self.writer.active_index()
    }

    pub fn segments_recorded(&self) -> u64 {
        self.segments_recorded
    }

    /// Waits for the merge worker to catch up, then reports its state.
    pub fn retention_snapshot(&self) -> Option<WorkerSnapshot> {
        self.worker.as_ref()?.snapshot()
    }

    /// Write one encoded chunk into the active segment.
    ///
    /// A segment write failure is reported and capture moves on to a fresh
    /// segment; the damaged one is kept out of the merge.
    pub fn ingest(&mut self, chunk: EncodedChunk) -> Result<()> {
        match self.write_chunk(chunk) {
            Err(e @ RollcapError::SegmentIo { .. }) => {
                self.diagnostics
                    .segment_io_failures
                    .fetch_add(1, Ordering::Relaxed);
                self.events.error(&e);
                self.rotate()
            }
            other => other,
        }
    }

    fn write_chunk(&mut self, chunk: EncodedChunk) -> Result<()> {
        self.diagnostics.chunks_in.fetch_add(1, Ordering::Relaxed);
        if self.capture_halted {
            return Ok(());
        }
        if let Some(last) = self.last_pts {
            if chunk.pts < last {
                self.diagnostics
                    .chunks_out_of_order
                    .fetch_add(1, Ordering::Relaxed);
                warn!(
                    pts_ms = chunk.pts.as_millis() as u64,
                    last_ms = last.as_millis() as u64,
                    "dropping out-of-order chunk"
                );
                return Ok(());
            }
        }
        self.last_pts = Some(chunk.pts);
        if chunk.is_empty() {
            return Ok(());
        }
        if !self.writer.is_active() {
            self.writer.open()?;
        }
        let frames = chunk.frames(self.config.channels);
        self.writer.write(&chunk)?;
        self.diagnostics
            .frames_written
            .fetch_add(frames, Ordering::Relaxed);
        Ok(())
    }

    /// Finalize the active segment, hand it to the merger and open the next.
    pub fn rotate(&mut self) -> Result<()> {
        if self.capture_halted {
            return Ok(());
        }
        self.drain_encoder();
        let finalized = self.writer.finalize();
        self.submit(finalized);
        self.writer.open()?;
        Ok(())
    }

    fn handle_rotate(&mut self, epoch: u64) -> Result<()> {
        let current = self.scheduler.as_ref().map(SegmentScheduler::epoch);
        if current != Some(epoch) {
            debug!(epoch, ?current, "ignoring stale rotation");
            return Ok(());
        }
        self.rotate()
    }

    /// Write whatever the encoder still buffers into the active segment.
    fn drain_encoder(&mut self) {
        match self.encoder.flush() {
            Ok(chunks) => {
                for chunk in chunks {
                    if let Err(e) = self.write_chunk(chunk) {
                        warn!(error = %e, "flushed chunk not written");
                    }
                }
            }
            Err(e) => warn!(error = %e, "encoder flush failed"),
        }
    }

    fn submit(&mut self, segment: Option<Segment>) {
        let Some(segment) = segment else {
            return;
        };
        self.note_finalized(&segment);
        let Some(worker) = self.worker.as_ref() else {
            return;
        };
        if let Err(e) = worker.submit(segment) {
            error!(error = %e, "merge worker rejected segment");
            self.events.error(&e);
        }
    }

    fn note_finalized(&mut self, segment: &Segment) {
        self.segments_recorded += 1;
        self.diagnostics
            .segments_finalized
            .fetch_add(1, Ordering::Relaxed);
        self.events.emit(RecorderEvent::SegmentRotated {
            index: segment.index,
            duration_ms: segment.length.as_millis() as u64,
        });
        info!(
            segment = segment.index,
            duration_ms = segment.length.as_millis() as u64,
            "segment rotated"
        );
    }

    /// Apply an interruption or manual pause/resume signal.
    pub fn interruption(&mut self, signal: InterruptionSignal) -> Result<()> {
        let transition = self.coordinator.handle(signal, self.clock.now())?;

        if let Some(kind) = transition.ended {
            self.events.emit(RecorderEvent::InterruptionEnded { kind });
        }
        if transition.pause_duration {
            self.tracker.pause();
        }
        if transition.halt_capture {
            self.halt_capture();
        }
        if transition.resume_capture {
            self.resume_capture()?;
        }
        if transition.resume_duration {
            self.tracker.resume();
        }
        if let Some(kind) = transition.began {
            self.events.emit(RecorderEvent::InterruptionBegan { kind });
        }
        self.publish_status();
        Ok(())
    }

    pub fn manual_pause(&mut self) -> Result<()> {
        self.interruption(InterruptionSignal::ManualPause)
    }

    pub fn manual_resume(&mut self) -> Result<()> {
        self.interruption(InterruptionSignal::ManualResume)
    }

    /// Close the active segment at this exact point and stop taking chunks.
    fn halt_capture(&mut self) {
        if self.capture_halted {
            return;
        }
        self.drain_encoder();
        let finalized = self.writer.finalize();
        self.submit(finalized);
        if let Some(scheduler) = &self.scheduler {
            scheduler.halt();
        }
        self.capture_halted = true;
        debug!("capture halted");
    }

    fn resume_capture(&mut self) -> Result<()> {
        if !self.capture_halted || self.failed {
            return Ok(());
        }
        self.writer.open()?;
        if let Some(scheduler) = &self.scheduler {
            scheduler.resume();
        }
        self.capture_halted = false;
        debug!("capture resumed");
        Ok(())
    }

    fn publish_status(&self) {
        if self.failed {
            return;
        }
        let status = match self.coordinator.state() {
            CoordinatorState::Active => RecorderStatus::Recording,
            CoordinatorState::Interrupted(_) => RecorderStatus::Interrupted,
            CoordinatorState::ManuallyPaused => RecorderStatus::Paused,
        };
        if self.events.status() != status {
            self.events.set_status(status, None);
        }
    }

    /// Emit a progress report.
    pub fn tick(&mut self) {
        let (elapsed, window_reached) = self.tracker.tick();
        if window_reached {
            info!(
                window_s = self.config.effective_window().as_secs(),
                "retention window filled; older audio now rolls off"
            );
        }
        self.events.emit(RecorderEvent::DurationChanged {
            elapsed_ms: elapsed.as_millis() as u64,
        });
    }

    /// The encoder reported an unrecoverable failure. Capture stops for good;
    /// what was recorded so far is still returned by `finish`.
    pub fn encoder_failed(&mut self, message: String) {
        let err = RollcapError::CaptureFailure(message.clone());
        error!(error = %err, "encoder failed");
        self.events.error(&err);
        self.halt_capture();
        self.tracker.pause();
        self.failed = true;
        self.events.set_status(RecorderStatus::Error, Some(message));
    }

    /// Stop capture and return the finished, trimmed recording.
    ///
    /// Costs one segment append plus one trim regardless of session length.
    /// If the final merge fails or does not finish within the stop timeout,
    /// the last known good merged artifact is returned in place, marked
    /// degraded.
    pub fn finish(mut self) -> Result<FinishedRecording> {
        self.events.set_status(RecorderStatus::Stopping, None);
        if let Some(mut scheduler) = self.scheduler.take() {
            scheduler.stop();
        }

        let tail = self.encoder.stop().unwrap_or_else(|e| {
            warn!(error = %e, "encoder stop failed");
            Vec::new()
        });
        for chunk in tail {
            if let Err(e) = self.write_chunk(chunk) {
                warn!(error = %e, "trailing chunk not written");
            }
        }
        let last = self.writer.finalize();
        if let Some(segment) = &last {
            self.note_finalized(segment);
        }
        self.tracker.pause();
        let usable = self.tracker.elapsed();

        let worker = self.worker.take().ok_or(RollcapError::NoActiveRecording)?;
        let timeout = self.config.stop_timeout();
        let recording = match worker.finalize(last, usable, timeout) {
            FinalizeResult::Completed(merge) => self.recording(
                merge.path,
                merge.artifact.cumulative_duration(),
                merge.degraded,
            ),
            FinalizeResult::Failed { error, last_good } => {
                error!(error = %error, "final merge failed; returning merged artifact in place");
                self.events.error(&error);
                self.recording(
                    self.store.locate(&last_good.handle),
                    last_good.cumulative_duration(),
                    Some(DegradedReason::FinalMergeFailed),
                )
            }
            FinalizeResult::TimedOut { last_good } => {
                let err = RollcapError::StopTimedOut {
                    timeout_ms: self.config.stop_timeout_ms,
                };
                self.events.error(&err);
                self.recording(
                    self.store.locate(&last_good.handle),
                    last_good.cumulative_duration(),
                    Some(DegradedReason::StopTimedOut),
                )
            }
        };

        info!(
            session = %self.id,
            path = %recording.path.display(),
            duration_ms = recording.duration_ms,
            segments = recording.segments_recorded,
            degraded = ?recording.degraded,
            "recording finished"
        );
        self.events.set_status(RecorderStatus::Stopped, None);
        Ok(recording)
    }

    fn recording(
        &self,
        path: std::path::PathBuf,
        duration: Duration,
        degraded: Option<DegradedReason>,
    ) -> FinishedRecording {
        FinishedRecording {
            path,
            duration_ms: duration.as_millis() as u64,
            sample_rate: self.config.sample_rate,
            channels: self.config.channels,
            bitrate: self.config.bitrate(),
            created_at: self.created_at,
            segments_recorded: self.segments_recorded,
            degraded,
        }
    }

    /// Actor loop. Returns after a `Stop`, or once every sender is gone.
    pub fn run(mut self, inbox: Receiver<CaptureMessage>) {
        let span = info_span!("session", id = %self.id);
        let _enter = span.enter();

        while let Ok(message) = inbox.recv() {
            let outcome = match message {
                CaptureMessage::Chunk(chunk) => self.ingest(chunk),
                CaptureMessage::EncoderFailed(message) => {
                    self.encoder_failed(message);
                    Ok(())
                }
                CaptureMessage::Rotate { epoch } => self.handle_rotate(epoch),
                CaptureMessage::RotateNow => self.rotate(),
                CaptureMessage::Tick => {
                    self.tick();
                    Ok(())
                }
                CaptureMessage::Interruption(signal) => self.interruption(signal),
                CaptureMessage::Snapshot { reply } => {
                    let _ = reply.send(self.retention_snapshot());
                    Ok(())
                }
                CaptureMessage::Stop { reply } => {
                    let _ = reply.send(self.finish());
                    return;
                }
            };
            if let Err(e) = outcome {
                warn!(error = %e, "capture message failed");
                self.events.error(&e);
            }
        }

        warn!("capture inbox closed without stop; finishing session");
        if let Err(e) = self.finish() {
            error!(error = %e, "implicit finish failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::stub::{Pacing, StubEncoder};
    use crate::audio::AudioFormat;
    use crate::ipc::events::InterruptionKind;
    use crate::store::WavStore;
    use duration::ManualClock;

    fn session(dir: &std::path::Path) -> (ManualClock, RecordingSession) {
        let config = RecorderConfig {
            window_secs: 60,
            segment_secs: 10,
            sample_rate: 8_000,
            output_dir: dir.to_path_buf(),
            ..RecorderConfig::default()
        };
        let store = Arc::new(WavStore::new(dir).expect("store"));
        let clock = ManualClock::new();
        let mut setup = SessionSetup::new(config, store);
        setup.clock = Arc::new(clock.clone());
        setup.timer_rotation = false;
        let (session, _inbox) =
            RecordingSession::begin(setup, Box::new(StubEncoder::new(Pacing::Manual, 1_000)))
                .expect("begin");
        (clock, session)
    }

    fn tone(secs: u64) -> Vec<EncodedChunk> {
        StubEncoder::tone_chunks(
            AudioFormat {
                sample_rate: 8_000,
                channels: 1,
            },
            1_000,
            Duration::from_secs(secs),
        )
    }

    #[test]
    fn out_of_order_chunks_are_dropped() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (_clock, mut session) = session(dir.path());
        let mut chunks = tone(3);
        let late = chunks.remove(0);
        for chunk in chunks {
            session.ingest(chunk).expect("ingest");
        }
        session.ingest(late).expect("ingest");
        let snapshot = session.diagnostics.snapshot();
        assert_eq!(snapshot.chunks_out_of_order, 1);
        assert_eq!(snapshot.frames_written, 16_000);
    }

    #[test]
    fn stale_rotation_epoch_is_ignored() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (_clock, mut session) = session(dir.path());
        session.handle_rotate(7).expect("rotate");
        assert_eq!(session.active_segment(), Some(0));
        session.rotate().expect("rotate");
        assert_eq!(session.active_segment(), Some(1));
    }

    #[test]
    fn critical_interruption_forces_one_boundary_and_drops_chunks() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (clock, mut session) = session(dir.path());
        let mut chunks = tone(6).into_iter();
        for chunk in chunks.by_ref().take(2) {
            session.ingest(chunk).expect("ingest");
        }
        clock.advance(Duration::from_secs(2));
        session
            .interruption(InterruptionSignal::Began(InterruptionKind::Critical))
            .expect("began");
        assert!(session.is_capture_halted());
        assert_eq!(session.active_segment(), None);
        for chunk in chunks.by_ref().take(2) {
            session.ingest(chunk).expect("ingest while halted");
        }
        clock.advance(Duration::from_secs(2));
        session
            .interruption(InterruptionSignal::Ended(InterruptionKind::Critical))
            .expect("ended");
        assert_eq!(session.active_segment(), Some(1));
        assert_eq!(session.segments_recorded(), 1);
        assert_eq!(session.elapsed(), Duration::from_secs(2));
    }

    #[test]
    fn encoder_failure_is_terminal_but_stop_still_returns_audio() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (clock, mut session) = session(dir.path());
        for chunk in tone(3) {
            session.ingest(chunk).expect("ingest");
        }
        clock.advance(Duration::from_secs(3));
        session.encoder_failed("device unplugged".into());
        assert_eq!(session.events.status(), RecorderStatus::Error);
        assert!(session.manual_resume().is_err());

        let recording = session.finish().expect("finish");
        assert_eq!(recording.duration(), Duration::from_secs(3));
        assert!(recording.path.exists());
    }
}
