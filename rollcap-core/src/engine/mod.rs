//! `RollingRecorder`: the top-level lifecycle controller.
//!
//! ## Lifecycle
//!
//! ```text
//! RollingRecorder::new(config)
//!     └─► start(encoder)     → session opened on the capture thread, status = Recording
//!         ├─► pause()/resume()/interruption(..)
//!         └─► stop()         → final merge + trim, status = Stopped, artifact returned
//! ```
//!
//! `start()` in the wrong state returns `AlreadyRecording`. `stop()` is
//! idempotent: a second call returns the same finished recording.
//!
//! ## Threading
//!
//! The session (and with it the encoder) is created *inside* the capture
//! thread so an encoder bound to a device never crosses a thread boundary.
//! A sync oneshot channel propagates open errors back to the `start()`
//! caller. Every later command is a message on the session inbox.

pub mod diagnostics;

use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::Sender;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::{
    audio::{AudioEncoder, ChunkSink},
    config::RecorderConfig,
    error::{Result, RollcapError},
    ipc::{
        events::{FinishedRecording, RecorderEvent, RecorderStatus, RecorderStatusEvent},
        EventSink,
    },
    merge::worker::WorkerSnapshot,
    recovery,
    session::{
        duration::{Clock, SystemClock},
        interruption::InterruptionSignal,
        CaptureMessage, RecordingSession, SessionSetup,
    },
    store::{ContainerStore, ResourceHandle, WavStore},
};
use diagnostics::{CaptureDiagnostics, DiagnosticsSnapshot};

struct ActiveSession {
    session_id: String,
    inbox: Sender<CaptureMessage>,
    sink: ChunkSink,
    thread: JoinHandle<()>,
}

/// The top-level recorder handle.
///
/// `RollingRecorder` is `Send + Sync`; wrap it in an `Arc` to share it
/// between a host's command handlers and event-forwarding tasks.
pub struct RollingRecorder {
    config: RecorderConfig,
    store: Arc<dyn ContainerStore>,
    clock: Arc<dyn Clock>,
    timer_rotation: bool,
    events: EventSink,
    diagnostics: Arc<CaptureDiagnostics>,
    active: Mutex<Option<ActiveSession>>,
    /// Result of the last completed stop, returned again on repeated stops.
    finished: Mutex<Option<FinishedRecording>>,
}

impl RollingRecorder {
    /// Recorder writing WAV containers under `config.output_dir`.
    pub fn new(mut config: RecorderConfig) -> Result<Self> {
        config.normalize();
        config.validate()?;
        let store = Arc::new(WavStore::new(&config.output_dir)?);
        Self::with_store(config, store)
    }

    pub fn with_store(mut config: RecorderConfig, store: Arc<dyn ContainerStore>) -> Result<Self> {
        config.normalize();
        config.validate()?;
        Ok(Self {
            config,
            store,
            clock: Arc::new(SystemClock),
            timer_rotation: true,
            events: EventSink::new(),
            diagnostics: Arc::new(CaptureDiagnostics::default()),
            active: Mutex::new(None),
            finished: Mutex::new(None),
        })
    }

    /// Replace the time source used for duration accounting.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Disable the rotation timer; segments rotate only on `rotate_now()`.
    pub fn with_manual_rotation(mut self) -> Self {
        self.timer_rotation = false;
        self
    }

    pub fn config(&self) -> &RecorderConfig {
        &self.config
    }

    /// Start a new recording session fed by `encoder`.
    ///
    /// Blocks until the first segment is open and the encoder started (or
    /// either failed), then returns.
    ///
    /// # Errors
    /// - `RollcapError::AlreadyRecording` if a session is active.
    /// - `RollcapError::CaptureFailure` if the encoder fails to start.
    pub fn start(&self, encoder: Box<dyn AudioEncoder>) -> Result<()> {
        let mut active = self.active.lock();
        if active.is_some() {
            return Err(RollcapError::AlreadyRecording);
        }

        self.diagnostics.reset();
        *self.finished.lock() = None;

        let setup = SessionSetup {
            config: self.config.clone(),
            store: Arc::clone(&self.store),
            events: self.events.clone(),
            diagnostics: Arc::clone(&self.diagnostics),
            clock: Arc::clone(&self.clock),
            timer_rotation: self.timer_rotation,
        };

        // Sync oneshot: the capture thread reports the opened session's id
        // and inbox, or the error that prevented it.
        let (open_tx, open_rx) =
            std::sync::mpsc::channel::<Result<(String, Sender<CaptureMessage>)>>();

        let thread = std::thread::Builder::new()
            .name("rollcap-capture".into())
            .spawn(move || match RecordingSession::begin(setup, encoder) {
                Ok((session, inbox)) => {
                    let _ = open_tx.send(Ok((session.id().to_string(), inbox.tx)));
                    session.run(inbox.rx);
                }
                Err(e) => {
                    let _ = open_tx.send(Err(e));
                }
            })?;

        match open_rx.recv() {
            Ok(Ok((session_id, inbox))) => {
                info!(session = %session_id, "recorder started");
                let sink = ChunkSink::new(inbox.clone(), Arc::clone(&self.diagnostics));
                *active = Some(ActiveSession {
                    session_id,
                    inbox,
                    sink,
                    thread,
                });
                Ok(())
            }
            Ok(Err(e)) => {
                let _ = thread.join();
                self.events.error(&e);
                self.events
                    .set_status(RecorderStatus::Error, Some(e.to_string()));
                Err(e)
            }
            Err(_) => {
                // Channel closed before a message was sent: the thread panicked.
                let _ = thread.join();
                self.events
                    .set_status(RecorderStatus::Error, Some("capture thread failed".into()));
                Err(RollcapError::Other(anyhow::anyhow!(
                    "capture thread died unexpectedly"
                )))
            }
        }
    }

    /// Stop the active session and return the finished recording.
    ///
    /// # Errors
    /// - `RollcapError::NoActiveRecording` if nothing was ever recorded.
    pub fn stop(&self) -> Result<FinishedRecording> {
        // Held for the whole stop so concurrent callers see the cached result.
        let mut active = self.active.lock();
        let Some(session) = active.take() else {
            return self
                .finished
                .lock()
                .clone()
                .ok_or(RollcapError::NoActiveRecording);
        };

        info!(session = %session.session_id, "stop requested");
        let result = finish_session(session);
        if let Ok(recording) = &result {
            *self.finished.lock() = Some(recording.clone());
        }
        result
    }

    pub fn is_recording(&self) -> bool {
        self.active.lock().is_some()
    }

    pub fn session_id(&self) -> Option<String> {
        self.active.lock().as_ref().map(|s| s.session_id.clone())
    }

    /// Producer handle for hosts that push encoded chunks themselves.
    pub fn chunk_sink(&self) -> Result<ChunkSink> {
        self.active
            .lock()
            .as_ref()
            .map(|s| s.sink.clone())
            .ok_or(RollcapError::NoActiveRecording)
    }

    /// Forward an interruption signal. Rejected signals surface as `error`
    /// events.
    pub fn interruption(&self, signal: InterruptionSignal) -> Result<()> {
        self.send(CaptureMessage::Interruption(signal))
    }

    pub fn pause(&self) -> Result<()> {
        self.interruption(InterruptionSignal::ManualPause)
    }

    pub fn resume(&self) -> Result<()> {
        self.interruption(InterruptionSignal::ManualResume)
    }

    /// Rotate the active segment now instead of waiting for the timer.
    pub fn rotate_now(&self) -> Result<()> {
        self.send(CaptureMessage::RotateNow)
    }

    /// Retention and merge state once every segment rotated so far is merged.
    pub fn retention_snapshot(&self) -> Result<Option<WorkerSnapshot>> {
        let (reply, rx) = crossbeam_channel::bounded(1);
        self.send(CaptureMessage::Snapshot { reply })?;
        rx.recv()
            .map_err(|_| RollcapError::Other(anyhow::anyhow!("capture thread exited")))
    }

    /// Reassemble sessions left behind by a crash into finished recordings.
    pub fn recover_orphans(&self) -> Result<Vec<FinishedRecording>> {
        let active_id = self.session_id();
        let root = self.store.locate(&ResourceHandle::new(""));
        let mut recovered = Vec::new();
        for session_id in recovery::find_orphaned_sessions(&root)? {
            if active_id.as_deref() == Some(session_id.as_str()) {
                continue;
            }
            match recovery::recover_session(Arc::clone(&self.store), &session_id, &self.config) {
                Ok(recording) => recovered.push(recording),
                Err(e) => warn!(session = %session_id, error = %e, "session not recoverable"),
            }
        }
        Ok(recovered)
    }

    /// Current recorder status (snapshot).
    pub fn status(&self) -> RecorderStatus {
        self.events.status()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RecorderEvent> {
        self.events.subscribe()
    }

    pub fn subscribe_status(&self) -> broadcast::Receiver<RecorderStatusEvent> {
        self.events.subscribe_status()
    }

    /// Snapshot of capture counters for observability.
    pub fn diagnostics_snapshot(&self) -> DiagnosticsSnapshot {
        self.diagnostics.snapshot()
    }

    // ── Internal helpers ─────────────────────────────────────────────────────

    fn send(&self, message: CaptureMessage) -> Result<()> {
        let active = self.active.lock();
        let session = active.as_ref().ok_or(RollcapError::NoActiveRecording)?;
        session
            .inbox
            .send(message)
            .map_err(|_| RollcapError::Other(anyhow::anyhow!("capture thread exited")))
    }
}

fn finish_session(session: ActiveSession) -> Result<FinishedRecording> {
    let (reply, rx) = crossbeam_channel::bounded(1);
    let sent = session.inbox.send(CaptureMessage::Stop { reply });
    let result = match sent {
        Ok(()) => rx
            .recv()
            .map_err(|_| RollcapError::Other(anyhow::anyhow!("capture thread exited during stop")))
            .and_then(|r| r),
        Err(_) => Err(RollcapError::Other(anyhow::anyhow!(
            "capture thread exited before stop"
        ))),
    };
    if session.thread.join().is_err() {
        warn!("capture thread panicked");
    }
    result
}

impl Drop for RollingRecorder {
    fn drop(&mut self) {
        if let Some(session) = self.active.get_mut().take() {
            warn!(session = %session.session_id, "recorder dropped while recording; stopping");
            if let Err(e) = finish_session(session) {
                warn!(error = %e, "implicit stop failed");
            }
        }
    }
}
