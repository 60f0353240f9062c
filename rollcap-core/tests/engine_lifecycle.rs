use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use rollcap_core::session::{RecordingSession, SessionSetup};
use rollcap_core::store::{ContainerStat, ContainerWriter};
use rollcap_core::{
    AudioFormat, ContainerStore, DegradedReason, EncodedChunk, ErrorKind, ManualClock, Pacing,
    RecorderConfig, RecorderEvent, RecorderStatus, ResourceHandle, RollcapError, RollingRecorder,
    StubEncoder, WavStore,
};
use tokio::sync::broadcast::error::TryRecvError;

const RATE: u32 = 8_000;

// ── Store wrappers ───────────────────────────────────────────────────────────

/// Fails the next `failing_appends` appends; sleeps in append when `slow`;
/// fails every rename while `failing_renames` is set.
struct FaultyStore {
    inner: WavStore,
    failing_appends: AtomicU32,
    slow: AtomicBool,
    failing_renames: AtomicBool,
}

impl FaultyStore {
    fn new(root: &Path) -> Arc<Self> {
        Arc::new(Self {
            inner: WavStore::new(root).expect("store"),
            failing_appends: AtomicU32::new(0),
            slow: AtomicBool::new(false),
            failing_renames: AtomicBool::new(false),
        })
    }
}

impl ContainerStore for FaultyStore {
    fn create(
        &self,
        handle: &ResourceHandle,
        format: AudioFormat,
    ) -> rollcap_core::error::Result<Box<dyn ContainerWriter>> {
        self.inner.create(handle, format)
    }

    fn append(
        &self,
        dst: &ResourceHandle,
        src: &ResourceHandle,
    ) -> rollcap_core::error::Result<u64> {
        if self.slow.load(Ordering::SeqCst) {
            thread::sleep(Duration::from_millis(600));
        }
        let fail = self
            .failing_appends
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if fail {
            return Err(RollcapError::Io(std::io::Error::other("injected append failure")));
        }
        self.inner.append(dst, src)
    }

    fn truncate(
        &self,
        handle: &ResourceHandle,
        keep: Range<u64>,
    ) -> rollcap_core::error::Result<u64> {
        self.inner.truncate(handle, keep)
    }

    fn delete(&self, handle: &ResourceHandle) -> rollcap_core::error::Result<()> {
        self.inner.delete(handle)
    }

    fn stat(&self, handle: &ResourceHandle) -> rollcap_core::error::Result<ContainerStat> {
        self.inner.stat(handle)
    }

    fn exists(&self, handle: &ResourceHandle) -> bool {
        self.inner.exists(handle)
    }

    fn rename(&self, from: &ResourceHandle, to: &ResourceHandle) -> rollcap_core::error::Result<()> {
        if self.failing_renames.load(Ordering::SeqCst) {
            return Err(RollcapError::Io(std::io::Error::other("injected rename failure")));
        }
        self.inner.rename(from, to)
    }

    fn locate(&self, handle: &ResourceHandle) -> PathBuf {
        self.inner.locate(handle)
    }
}

// ── Helpers ──────────────────────────────────────────────────────────────────

fn config(dir: &Path) -> RecorderConfig {
    RecorderConfig {
        window_secs: 60,
        segment_secs: 10,
        sample_rate: RATE,
        channels: 1,
        output_dir: dir.to_path_buf(),
        ..RecorderConfig::default()
    }
}

fn manual_recorder(
    config: RecorderConfig,
    store: Arc<dyn ContainerStore>,
) -> (ManualClock, RollingRecorder) {
    let clock = ManualClock::new();
    let recorder = RollingRecorder::with_store(config, store)
        .expect("recorder")
        .with_clock(Arc::new(clock.clone()))
        .with_manual_rotation();
    recorder
        .start(Box::new(StubEncoder::new(Pacing::Manual, 1_000)))
        .expect("start");
    (clock, recorder)
}

fn second(n: u64) -> EncodedChunk {
    EncodedChunk::new(Duration::from_secs(n), vec![n as i16; RATE as usize])
}

fn wav_frames(path: &Path) -> u32 {
    hound::WavReader::open(path).expect("open wav").duration()
}

fn wait_for(what: &str, timeout: Duration, mut cond: impl FnMut() -> bool) {
    let start = Instant::now();
    while !cond() {
        if start.elapsed() >= timeout {
            panic!("timed out waiting for {what}");
        }
        thread::sleep(Duration::from_millis(5));
    }
}

fn drain_events(rx: &mut tokio::sync::broadcast::Receiver<RecorderEvent>) -> Vec<RecorderEvent> {
    let mut events = Vec::new();
    loop {
        match rx.try_recv() {
            Ok(event) => events.push(event),
            Err(TryRecvError::Lagged(_)) => continue,
            Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return events,
        }
    }
}

// ── Lifecycle ────────────────────────────────────────────────────────────────

#[test]
fn realtime_start_stop_produces_recording() {
    let dir = tempfile::tempdir().expect("tempdir");
    let recorder = RollingRecorder::new(config(dir.path())).expect("recorder");
    let mut status_rx = recorder.subscribe_status();
    assert_eq!(recorder.status(), RecorderStatus::Idle);

    recorder
        .start(Box::new(StubEncoder::new(Pacing::RealTime, 20)))
        .expect("start");
    assert!(recorder.is_recording());
    assert_eq!(recorder.status(), RecorderStatus::Recording);
    thread::sleep(Duration::from_millis(300));

    let recording = recorder.stop().expect("stop");
    assert!(recording.path.exists());
    assert!(recording.degraded.is_none());
    let secs = recording.duration().as_secs_f64();
    assert!((0.1..1.0).contains(&secs), "unexpected duration {secs}");
    assert_eq!(recorder.status(), RecorderStatus::Stopped);
    assert!(recorder.diagnostics_snapshot().chunks_in > 0);

    let mut statuses = Vec::new();
    while let Ok(event) = status_rx.try_recv() {
        statuses.push(event.status);
    }
    assert_eq!(
        statuses,
        vec![
            RecorderStatus::Recording,
            RecorderStatus::Stopping,
            RecorderStatus::Stopped
        ]
    );
}

#[test]
fn stop_is_idempotent() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store: Arc<dyn ContainerStore> = Arc::new(WavStore::new(dir.path()).expect("store"));
    let (clock, recorder) = manual_recorder(config(dir.path()), store);
    let sink = recorder.chunk_sink().expect("sink");
    assert!(sink.push(second(0)));
    clock.advance(Duration::from_secs(1));

    let first = recorder.stop().expect("first stop");
    let second = recorder.stop().expect("second stop");
    assert_eq!(first, second);
    assert!(!recorder.is_recording());
}

#[test]
fn stop_without_start_is_rejected() {
    let dir = tempfile::tempdir().expect("tempdir");
    let recorder = RollingRecorder::new(config(dir.path())).expect("recorder");
    assert!(matches!(recorder.stop(), Err(RollcapError::NoActiveRecording)));
    assert!(matches!(recorder.pause(), Err(RollcapError::NoActiveRecording)));
}

#[test]
fn second_start_is_rejected_while_recording() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store: Arc<dyn ContainerStore> = Arc::new(WavStore::new(dir.path()).expect("store"));
    let (_clock, recorder) = manual_recorder(config(dir.path()), store);
    let again = recorder.start(Box::new(StubEncoder::new(Pacing::Manual, 1_000)));
    assert!(matches!(again, Err(RollcapError::AlreadyRecording)));
    recorder.stop().expect("stop");
}

#[test]
fn recorder_can_record_again_after_stop() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store: Arc<dyn ContainerStore> = Arc::new(WavStore::new(dir.path()).expect("store"));
    let (clock, recorder) = manual_recorder(config(dir.path()), store);
    recorder.chunk_sink().expect("sink").push(second(0));
    clock.advance(Duration::from_secs(1));
    let first = recorder.stop().expect("first stop");

    recorder
        .start(Box::new(StubEncoder::new(Pacing::Manual, 1_000)))
        .expect("restart");
    recorder.chunk_sink().expect("sink").push(second(0));
    clock.advance(Duration::from_secs(1));
    let second = recorder.stop().expect("second stop");
    assert_ne!(first.path, second.path);
}

#[test]
fn rotate_now_feeds_the_merger_in_order() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store: Arc<dyn ContainerStore> = Arc::new(WavStore::new(dir.path()).expect("store"));
    let (clock, recorder) = manual_recorder(config(dir.path()), store);
    let sink = recorder.chunk_sink().expect("sink");
    let mut events = recorder.subscribe();

    sink.push(second(0));
    sink.push(second(1));
    recorder.rotate_now().expect("rotate");
    sink.push(second(2));
    recorder.rotate_now().expect("rotate");
    clock.advance(Duration::from_secs(3));

    let snapshot = recorder
        .retention_snapshot()
        .expect("snapshot")
        .expect("worker running");
    assert_eq!(snapshot.retained, vec![0, 1]);
    assert_eq!(snapshot.artifact.frames, 3 * RATE as u64);
    assert_eq!(snapshot.artifact.last_appended_segment, Some(1));

    let rotated: Vec<u64> = drain_events(&mut events)
        .into_iter()
        .filter_map(|e| match e {
            RecorderEvent::SegmentRotated { index, .. } => Some(index),
            _ => None,
        })
        .collect();
    assert_eq!(rotated, vec![0, 1]);

    let recording = recorder.stop().expect("stop");
    assert_eq!(recording.duration(), Duration::from_secs(3));
    // The empty active segment is discarded rather than merged.
    assert_eq!(recording.segments_recorded, 2);
}

#[test]
fn pause_and_resume_update_status() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store: Arc<dyn ContainerStore> = Arc::new(WavStore::new(dir.path()).expect("store"));
    let (_clock, recorder) = manual_recorder(config(dir.path()), store);

    recorder.pause().expect("pause");
    wait_for("paused status", Duration::from_secs(2), || {
        recorder.status() == RecorderStatus::Paused
    });
    recorder.resume().expect("resume");
    wait_for("recording status", Duration::from_secs(2), || {
        recorder.status() == RecorderStatus::Recording
    });
    recorder.stop().expect("stop");
}

#[test]
fn unmatched_interruption_end_is_reported_not_fatal() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store: Arc<dyn ContainerStore> = Arc::new(WavStore::new(dir.path()).expect("store"));
    let (_clock, recorder) = manual_recorder(config(dir.path()), store);
    let mut events = recorder.subscribe();

    recorder
        .interruption(rollcap_core::InterruptionSignal::Ended(
            rollcap_core::InterruptionKind::Critical,
        ))
        .expect("send");
    recorder.retention_snapshot().expect("barrier");
    let errors: Vec<_> = drain_events(&mut events)
        .into_iter()
        .filter_map(|e| match e {
            RecorderEvent::Error { kind, fatal, .. } => Some((kind, fatal)),
            _ => None,
        })
        .collect();
    assert_eq!(errors, vec![(ErrorKind::InvalidInput, false)]);
    assert_eq!(recorder.status(), RecorderStatus::Recording);
    recorder.stop().expect("stop");
}

// ── Failure paths ────────────────────────────────────────────────────────────

#[test]
fn encoder_failure_is_fatal_but_stop_returns_recorded_audio() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store: Arc<dyn ContainerStore> = Arc::new(WavStore::new(dir.path()).expect("store"));
    let (clock, recorder) = manual_recorder(config(dir.path()), store);
    let mut events = recorder.subscribe();
    let sink = recorder.chunk_sink().expect("sink");

    sink.push(second(0));
    sink.push(second(1));
    clock.advance(Duration::from_secs(2));
    sink.fail("device unplugged");
    wait_for("error status", Duration::from_secs(2), || {
        recorder.status() == RecorderStatus::Error
    });

    let fatal = drain_events(&mut events).into_iter().any(|e| {
        matches!(
            e,
            RecorderEvent::Error {
                kind: ErrorKind::CaptureFailure,
                fatal: true,
                ..
            }
        )
    });
    assert!(fatal, "expected a fatal capture failure event");

    // Chunks after the failure are ignored.
    sink.push(second(2));
    clock.advance(Duration::from_secs(5));

    let recording = recorder.stop().expect("stop");
    assert_eq!(recording.duration(), Duration::from_secs(2));
    assert!(recording.path.exists());
}

#[test]
fn persistent_merge_failure_skips_segment_and_keeps_recording() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = FaultyStore::new(dir.path());
    store.failing_appends.store(2, Ordering::SeqCst);
    let (clock, recorder) = manual_recorder(config(dir.path()), store.clone());
    let mut events = recorder.subscribe();
    let sink = recorder.chunk_sink().expect("sink");
    let session_id = recorder.session_id().expect("session id");

    sink.push(second(0));
    recorder.rotate_now().expect("rotate");
    sink.push(second(1));
    recorder.rotate_now().expect("rotate");
    clock.advance(Duration::from_secs(2));

    let snapshot = recorder
        .retention_snapshot()
        .expect("snapshot")
        .expect("worker running");
    assert_eq!(snapshot.skipped, vec![0]);
    assert_eq!(snapshot.artifact.frames, RATE as u64);

    let merge_errors = drain_events(&mut events)
        .into_iter()
        .filter(|e| {
            matches!(
                e,
                RecorderEvent::Error {
                    kind: ErrorKind::MergeFailure,
                    fatal: false,
                    ..
                }
            )
        })
        .count();
    assert_eq!(merge_errors, 1);
    assert_eq!(recorder.diagnostics_snapshot().merge_retries, 1);
    assert_eq!(recorder.diagnostics_snapshot().merge_failures, 1);

    let recording = recorder.stop().expect("stop");
    assert_eq!(recording.duration(), Duration::from_secs(1));
    assert!(recording.degraded.is_none());
    let skipped = dir
        .path()
        .join(&session_id)
        .join("segments")
        .join("seg-000000.wav");
    assert!(skipped.exists(), "skipped segment is kept for manual recovery");
}

#[test]
fn stop_timeout_returns_last_known_good_artifact() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = FaultyStore::new(dir.path());
    let mut config = config(dir.path());
    config.stop_timeout_ms = 100;
    let (clock, recorder) = manual_recorder(config, store.clone());
    let sink = recorder.chunk_sink().expect("sink");

    sink.push(second(0));
    recorder.rotate_now().expect("rotate");
    recorder.retention_snapshot().expect("merged");
    sink.push(second(1));
    clock.advance(Duration::from_secs(2));

    store.slow.store(true, Ordering::SeqCst);
    let started = Instant::now();
    let recording = recorder.stop().expect("stop");
    assert!(started.elapsed() < Duration::from_millis(550));
    assert_eq!(recording.degraded, Some(DegradedReason::StopTimedOut));
    assert_eq!(recording.duration(), Duration::from_secs(1));
    assert_eq!(wav_frames(&recording.path), RATE);
    // Handed out in place, so recovery must leave it alone.
    assert!(recorder.recover_orphans().expect("rescan").is_empty());

    // The detached merge finishes in the background (two slow appends).
    thread::sleep(Duration::from_millis(1_600));
    assert!(recording.path.exists());
    assert_eq!(wav_frames(&recording.path), RATE, "artifact changed after stop");
    assert!(recorder.recover_orphans().expect("rescan").is_empty());
    let session_dir = recording.path.parent().expect("session dir");
    assert!(!session_dir.join("final.wav").exists());
    let output = session_dir.with_extension("wav");
    assert!(!output.exists(), "abandoned stop must not publish an output");
}

#[test]
fn failed_output_rename_returns_merged_artifact_in_place() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = FaultyStore::new(dir.path());
    let (clock, recorder) = manual_recorder(config(dir.path()), store.clone());
    let mut events = recorder.subscribe();
    let sink = recorder.chunk_sink().expect("sink");

    for n in 0..3 {
        sink.push(second(n));
    }
    recorder.rotate_now().expect("rotate");
    recorder.retention_snapshot().expect("merged");
    for n in 3..5 {
        sink.push(second(n));
    }
    clock.advance(Duration::from_secs(5));

    store.failing_renames.store(true, Ordering::SeqCst);
    let recording = recorder.stop().expect("stop still returns audio");
    assert_eq!(recording.degraded, Some(DegradedReason::FinalMergeFailed));
    assert_eq!(recording.duration(), Duration::from_secs(3));
    assert_eq!(recording.path.file_name().and_then(|n| n.to_str()), Some("merged.wav"));
    assert_eq!(wav_frames(&recording.path), 3 * RATE);
    assert!(drain_events(&mut events)
        .iter()
        .any(|e| matches!(e, RecorderEvent::Error { .. })));

    // Cached, and not picked up as an orphan.
    assert_eq!(recorder.stop().expect("cached"), recording);
    store.failing_renames.store(false, Ordering::SeqCst);
    assert!(recorder.recover_orphans().expect("rescan").is_empty());
    assert!(recording.path.exists());
}

#[test]
fn orphaned_session_is_recovered() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store: Arc<dyn ContainerStore> = Arc::new(WavStore::new(dir.path()).expect("store"));

    // A session that never stops: dropped mid-segment, like a crash.
    {
        let mut setup = SessionSetup::new(config(dir.path()), Arc::clone(&store));
        setup.timer_rotation = false;
        let (mut session, _inbox) =
            RecordingSession::begin(setup, Box::new(StubEncoder::new(Pacing::Manual, 1_000)))
                .expect("begin");
        for n in 0..10 {
            session.ingest(second(n)).expect("ingest");
        }
        session.rotate().expect("rotate");
        session.retention_snapshot().expect("merged");
        for n in 10..12 {
            session.ingest(second(n)).expect("ingest");
        }
    }

    let recorder = RollingRecorder::with_store(config(dir.path()), store).expect("recorder");
    let recovered = recorder.recover_orphans().expect("recover");
    assert_eq!(recovered.len(), 1);
    let recording = &recovered[0];
    assert_eq!(recording.degraded, Some(DegradedReason::Recovered));
    assert_eq!(recording.duration(), Duration::from_secs(12));
    assert!(recording.path.exists());
    assert!(recorder.recover_orphans().expect("rescan").is_empty());
}
