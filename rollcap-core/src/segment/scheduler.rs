//! Timer thread that drives segment rotation and progress ticks.
//!
//! The scheduler never touches segments. It posts `Rotate { epoch }` and
//! `Tick` messages into the session inbox; the session performs the actual
//! finalize-and-reopen, so rotation and stop are serialized by the one actor
//! that owns the writer.
//!
//! Every `halt`/`resume` bumps the epoch. A `Rotate` carrying an older epoch
//! was scheduled before the pause and must be ignored by the receiver.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{after, select, Receiver, Sender, TrySendError};
use tracing::{debug, info};

use crate::error::Result;
use crate::session::CaptureMessage;

enum Control {
    Halt,
    Resume,
    Stop,
}

pub struct SegmentScheduler {
    control: Sender<Control>,
    epoch: Arc<AtomicU64>,
    handle: Option<JoinHandle<()>>,
}

/// Timer state owned by the scheduler thread.
struct Timer {
    segment_length: Duration,
    progress_interval: Duration,
    next_rotation: Option<Instant>,
    next_tick: Instant,
}

impl Timer {
    fn deadline(&self) -> Instant {
        match self.next_rotation {
            Some(r) => r.min(self.next_tick),
            None => self.next_tick,
        }
    }

    /// Returns false once the timer should exit.
    fn apply(&mut self, control: Option<Control>) -> bool {
        match control {
            Some(Control::Halt) => {
                self.next_rotation = None;
                debug!("scheduler halted");
                true
            }
            Some(Control::Resume) => {
                self.next_rotation = Some(Instant::now() + self.segment_length);
                debug!("scheduler resumed");
                true
            }
            Some(Control::Stop) | None => false,
        }
    }
}

impl SegmentScheduler {
    /// Spawn the timer. The first rotation fires `segment_length` from now.
    pub fn start(
        segment_length: Duration,
        progress_interval: Duration,
        inbox: Sender<CaptureMessage>,
    ) -> Result<Self> {
        let (control, control_rx) = crossbeam_channel::unbounded::<Control>();
        let epoch = Arc::new(AtomicU64::new(0));
        let thread_epoch = Arc::clone(&epoch);
        let segment_length = segment_length.max(Duration::from_millis(1));
        let progress_interval = progress_interval.max(Duration::from_millis(1));

        let handle = std::thread::Builder::new()
            .name("rollcap-scheduler".into())
            .spawn(move || {
                let start = Instant::now();
                let mut timer = Timer {
                    segment_length,
                    progress_interval,
                    next_rotation: Some(start + segment_length),
                    next_tick: start + progress_interval,
                };
                run(&mut timer, &thread_epoch, &inbox, &control_rx);
                debug!("scheduler thread exiting");
            })?;

        info!(
            segment_ms = segment_length.as_millis() as u64,
            progress_ms = progress_interval.as_millis() as u64,
            "segment scheduler started"
        );
        Ok(Self {
            control,
            epoch,
            handle: Some(handle),
        })
    }

    /// Current epoch; a `Rotate` with any other value is stale.
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    /// Stop firing rotations (progress ticks continue).
    pub fn halt(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        let _ = self.control.send(Control::Halt);
    }

    /// Restart the rotation interval from now.
    pub fn resume(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        let _ = self.control.send(Control::Resume);
    }

    /// Cancel the timer and join its thread.
    pub fn stop(&mut self) {
        let _ = self.control.send(Control::Stop);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for SegmentScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(
    timer: &mut Timer,
    epoch: &AtomicU64,
    inbox: &Sender<CaptureMessage>,
    control: &Receiver<Control>,
) {
    loop {
        let wait = timer.deadline().saturating_duration_since(Instant::now());
        let woke = select! {
            recv(control) -> msg => Some(msg.ok()),
            recv(after(wait)) -> _ => None,
        };
        if let Some(msg) = woke {
            if !timer.apply(msg) {
                return;
            }
            continue;
        }

        let now = Instant::now();
        if let Some(due) = timer.next_rotation.filter(|due| now >= *due) {
            let rotate = CaptureMessage::Rotate {
                epoch: epoch.load(Ordering::SeqCst),
            };
            // The inbox may be full while its reader is joining us, so a
            // pending rotation always yields to control.
            let posted = select! {
                send(inbox, rotate) -> sent => Ok(sent.is_ok()),
                recv(control) -> msg => Err(msg.ok()),
            };
            match posted {
                Ok(true) => {}
                Ok(false) => return,
                Err(msg) => {
                    if !timer.apply(msg) {
                        return;
                    }
                    continue;
                }
            }
            // Fixed cadence; after a long stall, restart from now.
            let next = due + timer.segment_length;
            timer.next_rotation = Some(if next > now {
                next
            } else {
                now + timer.segment_length
            });
        }
        if now >= timer.next_tick {
            match inbox.try_send(CaptureMessage::Tick) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => debug!("inbox full; progress tick skipped"),
                Err(TrySendError::Disconnected(_)) => return,
            }
            timer.next_tick = now + timer.progress_interval;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect_rotations(
        rx: &crossbeam_channel::Receiver<CaptureMessage>,
        window: Duration,
    ) -> Vec<u64> {
        let deadline = Instant::now() + window;
        let mut epochs = Vec::new();
        while let Ok(msg) = rx.recv_deadline(deadline) {
            if let CaptureMessage::Rotate { epoch } = msg {
                epochs.push(epoch);
            }
        }
        epochs
    }

    #[test]
    fn fires_rotations_on_interval() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let mut scheduler =
            SegmentScheduler::start(Duration::from_millis(40), Duration::from_secs(60), tx)
                .expect("start");
        let rotations = collect_rotations(&rx, Duration::from_millis(230));
        scheduler.stop();
        assert!(
            (3..=6).contains(&rotations.len()),
            "unexpected rotation count {}",
            rotations.len()
        );
        assert!(rotations.iter().all(|e| *e == 0));
    }

    #[test]
    fn halt_suppresses_rotation_and_resume_bumps_epoch() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let mut scheduler =
            SegmentScheduler::start(Duration::from_millis(30), Duration::from_secs(60), tx)
                .expect("start");
        scheduler.halt();
        let while_halted = collect_rotations(&rx, Duration::from_millis(120));
        assert!(while_halted.is_empty(), "rotations fired while halted");

        scheduler.resume();
        let resumed_epoch = scheduler.epoch();
        assert_eq!(resumed_epoch, 2);
        let after = collect_rotations(&rx, Duration::from_millis(100));
        scheduler.stop();
        assert!(!after.is_empty());
        assert!(after.iter().all(|e| *e == resumed_epoch));
    }

    #[test]
    fn stop_returns_while_inbox_is_full() {
        let (tx, rx) = crossbeam_channel::bounded(1);
        tx.send(CaptureMessage::RotateNow).expect("fill inbox");
        let mut scheduler =
            SegmentScheduler::start(Duration::from_millis(5), Duration::from_millis(5), tx)
                .expect("start");
        // Long enough for a rotation to fall due and block on the full inbox.
        std::thread::sleep(Duration::from_millis(50));

        let (done, stopped) = crossbeam_channel::bounded(1);
        std::thread::spawn(move || {
            scheduler.stop();
            let _ = done.send(());
        });
        assert!(
            stopped.recv_timeout(Duration::from_secs(2)).is_ok(),
            "scheduler stop blocked on a full inbox"
        );
        assert!(matches!(rx.try_recv(), Ok(CaptureMessage::RotateNow)));
    }

    #[test]
    fn emits_progress_ticks() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let mut scheduler =
            SegmentScheduler::start(Duration::from_secs(60), Duration::from_millis(20), tx)
                .expect("start");
        let deadline = Instant::now() + Duration::from_millis(150);
        let mut ticks = 0;
        while let Ok(msg) = rx.recv_deadline(deadline) {
            if matches!(msg, CaptureMessage::Tick) {
                ticks += 1;
            }
        }
        scheduler.stop();
        assert!(ticks >= 3, "only {ticks} ticks");
    }
}
