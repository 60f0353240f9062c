//! Background merge thread.
//!
//! The worker owns the retention buffer, the incremental merger and the
//! trimmer. The capture thread only submits jobs, so a slow append never
//! stalls chunk ingestion. Jobs are processed strictly in submission order,
//! which is what keeps segments merged in index order.
//!
//! Stop builds the output from a copy of the merged artifact. Until the
//! output is published, `merged.wav` only changes under the [`Published`]
//! lock, which is how a timed-out stop can hand it to the caller while the
//! worker is still busy: once released, the worker never touches it again.

use std::path::PathBuf;
use std::sync::{atomic::Ordering, Arc};
use std::thread::JoinHandle;
use std::time::Duration;

use chrono::Utc;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, info_span, warn};

use crate::config::RecorderConfig;
use crate::engine::diagnostics::CaptureDiagnostics;
use crate::error::{Result, RollcapError};
use crate::ipc::events::DegradedReason;
use crate::ipc::EventSink;
use crate::merge::trim::{PrecisionTrimmer, TrimReport};
use crate::merge::{IncrementalMerger, MergeOutcome, MergedArtifact};
use crate::recovery::{self, SegmentRecord, SessionManifest};
use crate::retention::RetentionManager;
use crate::segment::{MergeState, Segment};
use crate::store::{ContainerStore, ResourceHandle};

pub enum MergeJob {
    Segment(Segment),
    Snapshot {
        reply: Sender<WorkerSnapshot>,
    },
    Finalize {
        last: Option<Segment>,
        usable: Duration,
        reply: Sender<Result<FinalMerge>>,
    },
    Shutdown,
}

/// Point-in-time view of the worker state, for tests and diagnostics.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerSnapshot {
    pub retained: Vec<u64>,
    pub artifact: MergedArtifact,
    pub skipped: Vec<u64>,
}

/// The published result of a completed stop.
#[derive(Debug, Clone)]
pub struct FinalMerge {
    pub path: PathBuf,
    pub artifact: MergedArtifact,
    pub degraded: Option<DegradedReason>,
}

#[derive(Debug)]
pub enum FinalizeResult {
    Completed(FinalMerge),
    /// The final merge failed. `last_good` is left in place and the session
    /// manifest is marked finished so recovery does not move it.
    Failed {
        error: RollcapError,
        last_good: MergedArtifact,
    },
    /// The worker did not answer in time. `last_good` is the merged artifact
    /// as of the last completed segment merge, released to the caller.
    TimedOut { last_good: MergedArtifact },
}

/// The in-place artifact as last seen by the handle.
struct Published {
    artifact: MergedArtifact,
    /// Set once the artifact has been handed to a caller in place.
    released: bool,
}

/// Everything the worker needs from the session that spawned it.
pub struct WorkerContext {
    pub session_id: String,
    pub store: Arc<dyn ContainerStore>,
    pub config: RecorderConfig,
    pub events: EventSink,
    pub diagnostics: Arc<CaptureDiagnostics>,
}

pub struct MergeWorker {
    jobs: Sender<MergeJob>,
    published: Arc<Mutex<Published>>,
    store: Arc<dyn ContainerStore>,
    session_id: String,
    handle: Option<JoinHandle<()>>,
}

impl MergeWorker {
    /// Create the merged container and spawn the worker thread.
    pub fn spawn(ctx: WorkerContext) -> Result<Self> {
        let merger = IncrementalMerger::new(
            Arc::clone(&ctx.store),
            merged_handle(&ctx.session_id),
            ctx.config.format(),
            ctx.config.effective_window(),
            ctx.config.merge_retries,
            Arc::clone(&ctx.diagnostics),
        )?;
        Self::spawn_with(ctx, merger)
    }

    /// Spawn onto an existing merger (used by recovery tooling and tests).
    pub fn spawn_with(ctx: WorkerContext, merger: IncrementalMerger) -> Result<Self> {
        let published = Arc::new(Mutex::new(Published {
            artifact: merger.current_artifact().clone(),
            released: false,
        }));
        let store = Arc::clone(&ctx.store);
        let session_id = ctx.session_id.clone();
        let (jobs, rx) = crossbeam_channel::unbounded::<MergeJob>();
        let state = WorkerState {
            retention: RetentionManager::new(
                Arc::clone(&ctx.store),
                ctx.config.max_retained_segments(),
            ),
            trimmer: PrecisionTrimmer::new(merger.window_frames()),
            merger,
            published: Arc::clone(&published),
            ctx,
        };
        // A session is discoverable by recovery from the moment it exists.
        state.write_manifest(false);

        let handle = std::thread::Builder::new()
            .name("rollcap-merge".into())
            .spawn(move || run(state, rx))?;

        Ok(Self {
            jobs,
            published,
            store,
            session_id,
            handle: Some(handle),
        })
    }

    pub fn submit(&self, segment: Segment) -> Result<()> {
        let index = segment.index;
        self.jobs
            .send(MergeJob::Segment(segment))
            .map_err(|_| RollcapError::MergeFailure {
                index,
                message: "merge worker is not running".into(),
            })
    }

    /// Blocks until every job submitted before this call has been processed.
    pub fn snapshot(&self) -> Option<WorkerSnapshot> {
        let (reply, rx) = crossbeam_channel::bounded(1);
        self.jobs.send(MergeJob::Snapshot { reply }).ok()?;
        rx.recv().ok()
    }

    /// Hand over the last segment and wait up to `timeout` for the final
    /// merge. On timeout the in-place artifact is released to the caller and
    /// the worker thread is detached; it finishes without touching the
    /// artifact again and leaves the final segment on disk.
    pub fn finalize(
        mut self,
        last: Option<Segment>,
        usable: Duration,
        timeout: Duration,
    ) -> FinalizeResult {
        let (reply, rx) = crossbeam_channel::bounded(1);
        let job = MergeJob::Finalize {
            last,
            usable,
            reply,
        };
        if self.jobs.send(job).is_err() {
            return self.failed(RollcapError::Other(anyhow::anyhow!(
                "merge worker exited before stop"
            )));
        }

        let result = match rx.recv_timeout(timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => {
                let mut published = self.published.lock();
                // The worker replies while holding this lock, so no reply
                // now means it has not published and never will.
                match rx.try_recv() {
                    Ok(result) => {
                        drop(published);
                        result
                    }
                    Err(_) => {
                        published.released = true;
                        self.mark_manifest_finished();
                        let last_good = published.artifact.clone();
                        drop(published);
                        warn!(
                            timeout_ms = timeout.as_millis() as u64,
                            frames = last_good.frames,
                            "final merge timed out; returning last known good artifact"
                        );
                        // Detach: the thread exits on its own once the job finishes.
                        self.handle.take();
                        return FinalizeResult::TimedOut { last_good };
                    }
                }
            }
            Err(RecvTimeoutError::Disconnected) => Err(RollcapError::Other(anyhow::anyhow!(
                "merge worker died during stop"
            ))),
        };

        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        match result {
            Ok(merge) => FinalizeResult::Completed(merge),
            Err(error) => self.failed(error),
        }
    }

    fn failed(&self, error: RollcapError) -> FinalizeResult {
        let mut published = self.published.lock();
        published.released = true;
        self.mark_manifest_finished();
        FinalizeResult::Failed {
            error,
            last_good: published.artifact.clone(),
        }
    }

    /// Keep recovery away from an artifact that was handed out in place.
    fn mark_manifest_finished(&self) {
        let path = self.store.locate(&manifest_handle(&self.session_id));
        match recovery::read_manifest(&path) {
            Ok(mut manifest) if !manifest.finished => {
                manifest.finished = true;
                manifest.updated_at = Utc::now();
                if let Err(e) = recovery::write_manifest(&path, &manifest) {
                    warn!(error = %e, "failed to mark session manifest finished");
                }
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "session manifest unreadable"),
        }
    }
}

impl Drop for MergeWorker {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = self.jobs.send(MergeJob::Shutdown);
            let _ = handle.join();
        }
    }
}

pub fn merged_handle(session_id: &str) -> ResourceHandle {
    ResourceHandle::new(format!("{session_id}/merged.wav"))
}

/// Where stop stages the output before publishing it.
pub fn staged_handle(session_id: &str) -> ResourceHandle {
    ResourceHandle::new(format!("{session_id}/final.wav"))
}

pub fn output_handle(session_id: &str) -> ResourceHandle {
    ResourceHandle::new(format!("{session_id}.wav"))
}

pub fn manifest_handle(session_id: &str) -> ResourceHandle {
    ResourceHandle::new(format!("{session_id}/{}", recovery::MANIFEST_NAME))
}

struct WorkerState {
    ctx: WorkerContext,
    retention: RetentionManager,
    merger: IncrementalMerger,
    trimmer: PrecisionTrimmer,
    published: Arc<Mutex<Published>>,
}

fn run(mut state: WorkerState, rx: Receiver<MergeJob>) {
    let span = info_span!("session", id = %state.ctx.session_id);
    let _enter = span.enter();
    debug!("merge worker started");

    while let Ok(job) = rx.recv() {
        match job {
            MergeJob::Segment(segment) => state.merge_segment(segment),
            MergeJob::Snapshot { reply } => {
                let _ = reply.send(state.snapshot());
            }
            MergeJob::Finalize {
                last,
                usable,
                reply,
            } => {
                state.finalize(last, usable, reply);
                break;
            }
            MergeJob::Shutdown => break,
        }
    }
    debug!("merge worker exiting");
}

impl WorkerState {
    fn merge_segment(&mut self, mut segment: Segment) {
        let published = Arc::clone(&self.published);
        let mut published = published.lock();
        if published.released {
            debug!(segment = segment.index, "artifact released; segment left on disk");
            return;
        }

        let outcome = self.merger.on_segment_finalized(&segment);
        segment.merge_state = match &outcome {
            MergeOutcome::Appended { .. } => MergeState::Merged,
            MergeOutcome::Skipped(reason) => {
                warn!(segment = segment.index, error = %reason, "segment left out of merged artifact");
                self.ctx.events.error(reason);
                MergeState::Failed
            }
        };
        self.retain(segment);
        published.artifact = self.merger.current_artifact().clone();
        self.write_manifest(false);
    }

    fn retain(&mut self, segment: Segment) {
        let evicted = self.retention.make_room().and_then(|mut evicted| {
            evicted.extend(self.retention.admit(segment)?);
            Ok(evicted)
        });
        match evicted {
            Ok(evicted) => {
                self.ctx
                    .diagnostics
                    .segments_evicted
                    .fetch_add(evicted.len() as u64, Ordering::Relaxed);
            }
            Err(e) => {
                warn!(error = %e, "retention update failed");
                self.ctx.events.error(&e);
            }
        }
    }

    fn snapshot(&self) -> WorkerSnapshot {
        WorkerSnapshot {
            retained: self.retention.segments().map(|s| s.index).collect(),
            artifact: self.merger.current_artifact().clone(),
            skipped: self.merger.skipped().to_vec(),
        }
    }

    fn finalize(
        &mut self,
        last: Option<Segment>,
        usable: Duration,
        reply: Sender<Result<FinalMerge>>,
    ) {
        let staged = if self.published.lock().released {
            None
        } else {
            Some(self.stage_output(last, usable))
        };

        let published = Arc::clone(&self.published);
        let mut published = published.lock();
        let result = match staged {
            Some(Ok(report)) if !published.released => self.publish(report),
            Some(Ok(_)) | None => Err(RollcapError::StopTimedOut {
                timeout_ms: self.ctx.config.stop_timeout_ms,
            }),
            Some(Err(e)) => Err(e),
        };
        if let Err(e) = &result {
            info!(error = %e, "output not published; merged artifact stays in place");
            published.released = true;
            let staged = staged_handle(&self.ctx.session_id);
            if let Err(e) = self.ctx.store.delete(&staged) {
                warn!(error = %e, "failed to delete staged output");
            }
            self.write_manifest(true);
        }
        let _ = reply.send(result);
    }

    /// Copy the merged artifact, append the last segment to the copy and
    /// trim it. `merged.wav` itself is left as it was.
    fn stage_output(&mut self, last: Option<Segment>, usable: Duration) -> Result<TrimReport> {
        let mut staged = self.merger.fork(staged_handle(&self.ctx.session_id))?;
        Ok(self.trimmer.finalize(&mut staged, last, usable))
    }

    fn publish(&mut self, report: TrimReport) -> Result<FinalMerge> {
        let output = output_handle(&self.ctx.session_id);
        self.ctx.store.rename(&report.artifact.handle, &output)?;

        if let Some(segment) = report.final_segment {
            self.retain(segment);
        }
        let kept = self.release_segments();
        let merged = self.merger.current_artifact().handle.clone();
        if let Err(e) = self.ctx.store.delete(&merged) {
            warn!(error = %e, "failed to delete merged artifact");
        }

        if kept == 0 {
            self.remove_session_dir();
        } else {
            info!(kept, "segments left on disk");
            self.write_manifest(true);
        }

        Ok(FinalMerge {
            path: self.ctx.store.locate(&output),
            artifact: MergedArtifact {
                handle: output,
                ..report.artifact
            },
            degraded: report.degraded,
        })
    }

    /// Drop the retained segments, deleting the merged ones unless configured
    /// to keep them. Failed segments always stay. Returns how many remain.
    fn release_segments(&mut self) -> usize {
        let keep_all = self.ctx.config.keep_segments_on_stop;
        let mut kept = 0;
        for segment in self.retention.drain(false) {
            if keep_all || segment.merge_state != MergeState::Merged {
                kept += 1;
                continue;
            }
            if let Err(e) = self.ctx.store.delete(&segment.handle) {
                warn!(segment = segment.index, error = %e, "failed to delete segment");
                kept += 1;
            }
        }
        kept
    }

    fn remove_session_dir(&self) {
        let manifest = manifest_handle(&self.ctx.session_id);
        if let Err(e) = self.ctx.store.delete(&manifest) {
            warn!(error = %e, "failed to remove session manifest");
        }
        let session_dir = self
            .ctx
            .store
            .locate(&ResourceHandle::new(self.ctx.session_id.clone()));
        for dir in [session_dir.join("segments"), session_dir] {
            if let Err(e) = std::fs::remove_dir(&dir) {
                debug!(dir = %dir.display(), error = %e, "session directory not removed");
            }
        }
    }

    fn write_manifest(&self, finished: bool) {
        let manifest = SessionManifest {
            version: recovery::MANIFEST_VERSION,
            session_id: self.ctx.session_id.clone(),
            format: self.ctx.config.format(),
            window_secs: self.ctx.config.window_secs,
            segment_secs: self.ctx.config.segment_secs,
            artifact: self.merger.current_artifact().clone(),
            retained: self.retention.segments().map(SegmentRecord::from).collect(),
            skipped: self.merger.skipped().to_vec(),
            finished,
            updated_at: Utc::now(),
        };
        let path = self.ctx.store.locate(&manifest_handle(&self.ctx.session_id));
        if let Err(e) = recovery::write_manifest(&path, &manifest) {
            warn!(error = %e, "failed to write session manifest");
        }
    }
}
