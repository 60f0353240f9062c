//! Interruption and pause policy.
//!
//! ```text
//!            Began(Critical)                     Ended(Critical)
//! Active ───────────────────► Interrupted(C) ───────────────────► Active
//!   │  Began(NonCritical)                        Ended(NonCritical)
//!   ├───────────────────────► Interrupted(N) ───────────────────► Active
//!   │  ManualPause                               ManualResume
//!   └───────────────────────► ManuallyPaused ───────────────────► Active
//! ```
//!
//! Every non-active state pauses duration accounting. Only `Interrupted(C)`
//! and `ManuallyPaused` halt capture. A `Began` that arrives while another
//! interruption or a manual pause is in effect is queued and takes over, in
//! arrival order, once the current one ends.

use std::collections::VecDeque;
use std::time::Instant;

use tracing::{debug, warn};

use crate::error::{Result, RollcapError};
use crate::ipc::events::InterruptionKind;

const HISTORY_CAP: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptionSignal {
    Began(InterruptionKind),
    Ended(InterruptionKind),
    ManualPause,
    ManualResume,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorState {
    Active,
    Interrupted(InterruptionKind),
    ManuallyPaused,
}

impl CoordinatorState {
    fn halts_capture(self) -> bool {
        matches!(
            self,
            Self::Interrupted(InterruptionKind::Critical) | Self::ManuallyPaused
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterruptionRecord {
    pub kind: InterruptionKind,
    pub began_at: Instant,
    pub ended_at: Option<Instant>,
}

/// Side effects the session must apply for one signal.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Transition {
    pub halt_capture: bool,
    pub resume_capture: bool,
    pub pause_duration: bool,
    pub resume_duration: bool,
    pub began: Option<InterruptionKind>,
    pub ended: Option<InterruptionKind>,
}

pub struct InterruptionCoordinator {
    state: CoordinatorState,
    current: Option<InterruptionRecord>,
    queued: VecDeque<InterruptionRecord>,
    history: VecDeque<InterruptionRecord>,
}

impl InterruptionCoordinator {
    pub fn new() -> Self {
        Self {
            state: CoordinatorState::Active,
            current: None,
            queued: VecDeque::new(),
            history: VecDeque::with_capacity(HISTORY_CAP),
        }
    }

    pub fn state(&self) -> CoordinatorState {
        self.state
    }

    pub fn queued(&self) -> usize {
        self.queued.len()
    }

    /// Completed interruptions, oldest first (the last 64 are kept).
    pub fn history(&self) -> impl Iterator<Item = &InterruptionRecord> {
        self.history.iter()
    }

    pub fn handle(&mut self, signal: InterruptionSignal, now: Instant) -> Result<Transition> {
        let before = self.state;
        let mut transition = Transition::default();

        match signal {
            InterruptionSignal::Began(kind) => {
                let record = InterruptionRecord {
                    kind,
                    began_at: now,
                    ended_at: None,
                };
                if before != CoordinatorState::Active {
                    debug!(?kind, state = ?before, "interruption queued");
                    self.queued.push_back(record);
                    return Ok(transition);
                }
                self.current = Some(record);
                self.state = CoordinatorState::Interrupted(kind);
                transition.began = Some(kind);
            }
            InterruptionSignal::Ended(kind) => match before {
                CoordinatorState::Interrupted(current) if current == kind => {
                    if let Some(mut record) = self.current.take() {
                        record.ended_at = Some(now);
                        self.remember(record);
                    }
                    transition.ended = Some(kind);
                    self.promote_queued(&mut transition);
                }
                _ => {
                    let Some(pos) = self.queued.iter().position(|r| r.kind == kind) else {
                        warn!(?kind, state = ?before, "interruption end with no matching begin");
                        return Err(RollcapError::UnexpectedSignal(format!(
                            "{kind:?} ended while {before:?}"
                        )));
                    };
                    if let Some(mut record) = self.queued.remove(pos) {
                        record.ended_at = Some(now);
                        self.remember(record);
                    }
                    debug!(?kind, "queued interruption ended before taking effect");
                    return Ok(transition);
                }
            },
            InterruptionSignal::ManualPause => {
                if before != CoordinatorState::Active {
                    return Err(RollcapError::UnexpectedSignal(format!(
                        "manual pause while {before:?}"
                    )));
                }
                self.state = CoordinatorState::ManuallyPaused;
            }
            InterruptionSignal::ManualResume => {
                if before != CoordinatorState::ManuallyPaused {
                    return Err(RollcapError::UnexpectedSignal(format!(
                        "manual resume while {before:?}"
                    )));
                }
                self.promote_queued(&mut transition);
            }
        }

        let after = self.state;
        transition.halt_capture = !before.halts_capture() && after.halts_capture();
        transition.resume_capture = before.halts_capture() && !after.halts_capture();
        transition.pause_duration =
            before == CoordinatorState::Active && after != CoordinatorState::Active;
        transition.resume_duration =
            before != CoordinatorState::Active && after == CoordinatorState::Active;
        debug!(?signal, from = ?before, to = ?after, "interruption transition");
        Ok(transition)
    }

    /// Leave the current state: the oldest queued interruption takes over,
    /// otherwise back to `Active`.
    fn promote_queued(&mut self, transition: &mut Transition) {
        match self.queued.pop_front() {
            Some(next) => {
                self.state = CoordinatorState::Interrupted(next.kind);
                transition.began = Some(next.kind);
                self.current = Some(next);
            }
            None => self.state = CoordinatorState::Active,
        }
    }

    fn remember(&mut self, record: InterruptionRecord) {
        if self.history.len() == HISTORY_CAP {
            self.history.pop_front();
        }
        self.history.push_back(record);
    }
}

impl Default for InterruptionCoordinator {
    fn default() -> Self {
        Self::new()
    }
}
