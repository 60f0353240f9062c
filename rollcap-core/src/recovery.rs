//! Session manifest and crash recovery.
//!
//! The merge worker rewrites `<session>/manifest.json` after every merged
//! segment. If the process dies mid-session, the session directory still
//! holds the merged artifact, the retained segments and the manifest that
//! ties them together; [`recover_session`] reassembles them into a finished
//! recording.

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::audio::AudioFormat;
use crate::config::RecorderConfig;
use crate::engine::diagnostics::CaptureDiagnostics;
use crate::error::{Result, RollcapError};
use crate::ipc::events::{DegradedReason, FinishedRecording};
use crate::merge::worker::{manifest_handle, merged_handle, output_handle, staged_handle};
use crate::merge::{IncrementalMerger, MergeOutcome, MergedArtifact};
use crate::segment::{MergeState, Segment, SegmentWriter};
use crate::store::{ContainerStore, ResourceHandle};

pub const MANIFEST_VERSION: u32 = 1;
pub const MANIFEST_NAME: &str = "manifest.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SegmentRecord {
    pub index: u64,
    pub handle: ResourceHandle,
    pub frames: u64,
    pub merge_state: MergeState,
}

impl From<&Segment> for SegmentRecord {
    fn from(segment: &Segment) -> Self {
        Self {
            index: segment.index,
            handle: segment.handle.clone(),
            frames: segment.frames,
            merge_state: segment.merge_state,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionManifest {
    pub version: u32,
    pub session_id: String,
    pub format: AudioFormat,
    pub window_secs: u64,
    pub segment_secs: u64,
    pub artifact: MergedArtifact,
    pub retained: Vec<SegmentRecord>,
    pub skipped: Vec<u64>,
    /// Set once the session stopped cleanly but left segments behind.
    pub finished: bool,
    pub updated_at: DateTime<Utc>,
}

/// Write via a sibling temp file so a crash never leaves a torn manifest.
pub fn write_manifest(path: &Path, manifest: &SessionManifest) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, serde_json::to_vec_pretty(manifest)?)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

pub fn read_manifest(path: &Path) -> Result<SessionManifest> {
    let raw = fs::read(path)?;
    let manifest: SessionManifest = serde_json::from_slice(&raw)?;
    if manifest.version != MANIFEST_VERSION {
        return Err(RollcapError::Other(anyhow::anyhow!(
            "unsupported manifest version {}",
            manifest.version
        )));
    }
    Ok(manifest)
}

/// Session directories under `root` left behind by an unfinished session.
pub fn find_orphaned_sessions(root: &Path) -> Result<Vec<String>> {
    let mut sessions = Vec::new();
    for entry in fs::read_dir(root)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let dir = entry.path();
        let manifest = dir.join(MANIFEST_NAME);
        let unfinished = match read_manifest(&manifest) {
            Ok(m) => !m.finished,
            Err(_) => dir.join("segments").is_dir(),
        };
        if unfinished {
            sessions.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    sessions.sort();
    Ok(sessions)
}

/// Reassemble an interrupted session into `<session>.wav`.
///
/// Resumes from the manifest's merged artifact when both are present and
/// agree; otherwise the artifact is rebuilt from the segment files alone.
/// Segments not yet in the artifact are appended in index order, then the
/// result is trimmed to the window.
pub fn recover_session(
    store: Arc<dyn ContainerStore>,
    session_id: &str,
    config: &RecorderConfig,
) -> Result<FinishedRecording> {
    let manifest_path = store.locate(&manifest_handle(session_id));
    let manifest = match read_manifest(&manifest_path) {
        Ok(m) => Some(m),
        Err(e) => {
            warn!(session = session_id, error = %e, "no usable manifest; rebuilding from segments");
            None
        }
    };

    let segments_dir = format!("{session_id}/segments");
    let segments = discover_segments(store.as_ref(), &segments_dir)?;
    let format = match (&manifest, segments.first()) {
        (Some(m), _) => m.format,
        (None, Some(first)) => store.stat(&first.handle)?.format,
        (None, None) => {
            return Err(RollcapError::ContainerNotFound(format!(
                "session {session_id} has no recoverable audio"
            )))
        }
    };
    let window = match &manifest {
        Some(m) if config.clamp_window_to_segment => {
            Duration::from_secs(m.window_secs.max(m.segment_secs))
        }
        Some(m) => Duration::from_secs(m.window_secs),
        None => config.effective_window(),
    };

    let diagnostics = Arc::new(CaptureDiagnostics::default());
    let merged = merged_handle(session_id);
    let resumable = manifest.as_ref().and_then(|m| {
        let stat = store.stat(&merged).ok()?;
        (stat.frames == m.artifact.frames).then(|| m.artifact.clone())
    });
    let mut merger = match resumable {
        Some(artifact) => IncrementalMerger::resume(
            Arc::clone(&store),
            artifact,
            window,
            config.merge_retries,
            diagnostics,
        ),
        None => IncrementalMerger::new(
            Arc::clone(&store),
            merged.clone(),
            format,
            window,
            config.merge_retries,
            diagnostics,
        )?,
    };

    let last_appended = merger.current_artifact().last_appended_segment;
    let mut recovered = 0;
    for segment in &segments {
        if last_appended.is_some_and(|last| segment.index <= last) {
            continue;
        }
        match merger.on_segment_finalized(segment) {
            MergeOutcome::Appended { .. } => recovered += 1,
            MergeOutcome::Skipped(reason) => {
                warn!(segment = segment.index, error = %reason, "segment not recoverable")
            }
        }
    }
    merger.head_trim_to(merger.window_frames())?;

    let artifact = merger.current_artifact().clone();
    let output = output_handle(session_id);
    store.rename(&artifact.handle, &output)?;
    for segment in &segments {
        if merger.skipped().contains(&segment.index) {
            continue;
        }
        if let Err(e) = store.delete(&segment.handle) {
            warn!(segment = segment.index, error = %e, "failed to delete recovered segment");
        }
    }
    // A stop that died mid-publish leaves its staged output behind.
    for handle in [staged_handle(session_id), manifest_handle(session_id)] {
        if let Err(e) = store.delete(&handle) {
            warn!(container = %handle, error = %e, "failed to remove session file");
        }
    }
    let session_dir = store.locate(&ResourceHandle::new(session_id));
    for dir in [session_dir.join("segments"), session_dir] {
        if let Err(e) = fs::remove_dir(&dir) {
            debug!(dir = %dir.display(), error = %e, "session directory not removed");
        }
    }

    let created_at = manifest
        .as_ref()
        .map(|m| m.updated_at)
        .unwrap_or_else(Utc::now);
    info!(
        session = session_id,
        recovered,
        duration_ms = artifact.cumulative_duration().as_millis() as u64,
        "session recovered"
    );
    Ok(FinishedRecording {
        path: store.locate(&output),
        duration_ms: artifact.cumulative_duration().as_millis() as u64,
        sample_rate: format.sample_rate,
        channels: format.channels,
        bitrate: format.pcm_bitrate(),
        created_at,
        segments_recorded: segments.last().map(|s| s.index + 1).unwrap_or(0),
        degraded: Some(DegradedReason::Recovered),
    })
}

/// Segment containers in `dir`, ordered by index.
fn discover_segments(store: &dyn ContainerStore, dir: &str) -> Result<Vec<Segment>> {
    let root = store.locate(&ResourceHandle::new(dir));
    let entries = match fs::read_dir(&root) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut indices = Vec::new();
    for entry in entries {
        let name = entry?.file_name();
        let index = name
            .to_str()
            .and_then(|n| n.strip_prefix("seg-"))
            .and_then(|n| n.strip_suffix(".wav"))
            .and_then(|n| n.parse::<u64>().ok());
        if let Some(index) = index {
            indices.push(index);
        }
    }
    indices.sort_unstable();

    let mut segments = Vec::with_capacity(indices.len());
    let mut offset = 0;
    for index in indices {
        let handle = SegmentWriter::segment_handle(dir, index);
        let stat = match store.stat(&handle) {
            Ok(stat) => stat,
            Err(e) => {
                warn!(segment = index, error = %e, "skipping unreadable segment");
                continue;
            }
        };
        if stat.frames == 0 {
            continue;
        }
        segments.push(Segment {
            index,
            handle,
            start_offset: stat.format.frames_to_duration(offset),
            length: stat.format.frames_to_duration(stat.frames),
            frames: stat.frames,
            finalized: true,
            merge_state: MergeState::Pending,
            damaged: None,
        });
        offset += stat.frames;
    }
    Ok(segments)
}
