//! Recorder configuration (JSON file + environment overrides).
//!
//! Every field has a default, so a partial or missing file still yields a
//! usable configuration. Call [`RecorderConfig::normalize`] after loading;
//! out-of-range values are clamped rather than rejected.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::audio::AudioFormat;
use crate::error::{Result, RollcapError};

pub const MIN_SEGMENT_SECS: u64 = 10;
pub const MAX_SEGMENT_SECS: u64 = 300;
pub const DEFAULT_SEGMENT_SECS: u64 = 30;
pub const DEFAULT_WINDOW_SECS: u64 = 300;
pub const MAX_WINDOW_SECS: u64 = 6 * 60 * 60;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct RecorderConfig {
    /// Trailing duration guaranteed to be retained and returned.
    pub window_secs: u64,
    /// Rotation interval. Clamped to 10 s – 300 s.
    pub segment_secs: u64,
    pub sample_rate: u32,
    pub channels: u16,
    /// Declared bitrate (bits/s). `0` derives it from the PCM format.
    pub bitrate: u32,
    /// Root directory for session working dirs and finished recordings.
    pub output_dir: PathBuf,
    /// Upper bound on how long `stop()` waits for the final merge.
    pub stop_timeout_ms: u64,
    /// Interval between `durationChanged` events.
    pub progress_interval_ms: u64,
    /// Extra append attempts after a failed merge.
    pub merge_retries: u32,
    /// Treat a window shorter than one segment as one full segment.
    pub clamp_window_to_segment: bool,
    /// Keep retained segment files after a successful stop.
    pub keep_segments_on_stop: bool,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            window_secs: DEFAULT_WINDOW_SECS,
            segment_secs: DEFAULT_SEGMENT_SECS,
            sample_rate: 48_000,
            channels: 1,
            bitrate: 0,
            output_dir: default_output_dir(),
            stop_timeout_ms: 5_000,
            progress_interval_ms: 1_000,
            merge_retries: 1,
            clamp_window_to_segment: true,
            keep_segments_on_stop: false,
        }
    }
}

impl RecorderConfig {
    pub fn normalize(&mut self) {
        self.segment_secs = self.segment_secs.clamp(MIN_SEGMENT_SECS, MAX_SEGMENT_SECS);
        self.sample_rate = self.sample_rate.clamp(8_000, 192_000);
        self.channels = self.channels.clamp(1, 8);
        self.window_secs = self.window_secs.clamp(1, self.max_window_secs());
        if self.bitrate == 0 {
            self.bitrate = self.format().pcm_bitrate();
        }
        self.stop_timeout_ms = self.stop_timeout_ms.clamp(100, 120_000);
        self.progress_interval_ms = self.progress_interval_ms.clamp(50, 60_000);
        self.merge_retries = self.merge_retries.min(5);
    }

    /// Longest window whose merged artifact (window plus one segment) still
    /// fits a WAV container's 32-bit data size at this format.
    pub fn max_window_secs(&self) -> u64 {
        let bytes_per_sec = (self.format().pcm_bitrate() as u64 / 8).max(1);
        let fits = (u32::MAX as u64 / bytes_per_sec).saturating_sub(self.segment_secs);
        fits.clamp(1, MAX_WINDOW_SECS)
    }

    /// Reject configurations `normalize` cannot repair.
    pub fn validate(&self) -> Result<()> {
        if self.output_dir.as_os_str().is_empty() {
            return Err(RollcapError::InvalidConfig("output_dir is empty".into()));
        }
        if self.sample_rate == 0 || self.channels == 0 {
            return Err(RollcapError::InvalidConfig(
                "sample_rate and channels must be non-zero".into(),
            ));
        }
        if self.segment_secs == 0 || self.window_secs == 0 {
            return Err(RollcapError::InvalidConfig(
                "window and segment length must be non-zero".into(),
            ));
        }
        Ok(())
    }

    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    pub fn segment_length(&self) -> Duration {
        Duration::from_secs(self.segment_secs)
    }

    /// Window actually enforced by the trimmer.
    ///
    /// With `clamp_window_to_segment` a window shorter than one segment is
    /// widened to the segment length: the single retained segment is returned
    /// whole instead of being cut below its own length.
    pub fn effective_window(&self) -> Duration {
        if self.clamp_window_to_segment && self.window_secs < self.segment_secs {
            self.segment_length()
        } else {
            self.window()
        }
    }

    /// `ceil(window / segment_length)`, never below 1.
    pub fn max_retained_segments(&self) -> usize {
        let seg = self.segment_secs.max(1);
        (self.window_secs.div_ceil(seg) as usize).max(1)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }

    pub fn format(&self) -> AudioFormat {
        AudioFormat {
            sample_rate: self.sample_rate,
            channels: self.channels,
        }
    }

    pub fn bitrate(&self) -> u32 {
        if self.bitrate == 0 {
            self.format().pcm_bitrate()
        } else {
            self.bitrate
        }
    }
}

/// Environment overrides win over file values when set and parseable.
pub fn apply_env_overrides(config: &mut RecorderConfig) {
    if let Some(v) = env_u64("ROLLCAP_WINDOW_SECS") {
        config.window_secs = v;
    }
    if let Some(v) = env_u64("ROLLCAP_SEGMENT_SECS") {
        config.segment_secs = v;
    }
    if let Some(v) = env_u64("ROLLCAP_STOP_TIMEOUT_MS") {
        config.stop_timeout_ms = v;
    }
    if let Some(dir) = std::env::var_os("ROLLCAP_OUTPUT_DIR") {
        config.output_dir = PathBuf::from(dir);
    }
}

fn env_u64(key: &str) -> Option<u64> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().parse::<u64>() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!(key, value = %raw, "ignoring unparseable environment override");
            None
        }
    }
}

pub fn default_output_dir() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("LOCALAPPDATA")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."))
            .join("rollcap")
            .join("recordings")
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var_os("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                std::env::var_os("HOME")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from("/tmp"))
                    .join(".local")
                    .join("share")
            })
            .join("rollcap")
            .join("recordings")
    }
}

pub fn load_config(path: &Path) -> RecorderConfig {
    let mut config = fs::read_to_string(path)
        .ok()
        .and_then(|raw| serde_json::from_str::<RecorderConfig>(&raw).ok())
        .unwrap_or_default();
    config.normalize();
    config
}

pub fn save_config(path: &Path, config: &RecorderConfig) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(config)?;
    fs::write(path, json)?;
    Ok(())
}
