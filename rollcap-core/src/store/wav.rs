//! 16-bit PCM WAV containers on the local filesystem via `hound`.
//!
//! ## Crash behaviour
//!
//! `hound` patches the RIFF/data lengths on `finalize`. A container whose
//! writer never finalized still parses, with the header describing the last
//! finalized length, so an interrupted append never corrupts frames that were
//! already committed. Truncation writes a sibling temp file and renames it
//! over the original.

use std::fs::{self, File};
use std::io::BufWriter;
use std::ops::Range;
use std::path::{Path, PathBuf};

use hound::{SampleFormat, WavReader, WavSpec, WavWriter};
use tracing::debug;

use super::{ContainerStat, ContainerStore, ContainerWriter, ResourceHandle};
use crate::audio::AudioFormat;
use crate::error::{Result, RollcapError};

const TRIM_SUFFIX: &str = ".trim.tmp";

fn wav_spec(format: AudioFormat) -> WavSpec {
    WavSpec {
        channels: format.channels,
        sample_rate: format.sample_rate,
        bits_per_sample: AudioFormat::BITS_PER_SAMPLE,
        sample_format: SampleFormat::Int,
    }
}

fn audio_format(spec: &WavSpec) -> Result<AudioFormat> {
    if spec.bits_per_sample != AudioFormat::BITS_PER_SAMPLE || spec.sample_format != SampleFormat::Int
    {
        return Err(RollcapError::InvalidChunk(format!(
            "unsupported container encoding: {} bit {:?}",
            spec.bits_per_sample, spec.sample_format
        )));
    }
    Ok(AudioFormat {
        sample_rate: spec.sample_rate,
        channels: spec.channels,
    })
}

/// Directory-rooted container store.
#[derive(Debug, Clone)]
pub struct WavStore {
    root: PathBuf,
}

impl WavStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_of(&self, handle: &ResourceHandle) -> PathBuf {
        self.root.join(handle.as_str())
    }

    fn open_reader(&self, handle: &ResourceHandle) -> Result<WavReader<std::io::BufReader<File>>> {
        let path = self.path_of(handle);
        if !path.exists() {
            return Err(RollcapError::ContainerNotFound(handle.to_string()));
        }
        Ok(WavReader::open(path)?)
    }
}

struct WavContainerWriter {
    inner: WavWriter<BufWriter<File>>,
    channels: u16,
    samples_written: u64,
}

impl ContainerWriter for WavContainerWriter {
    fn write(&mut self, samples: &[i16]) -> Result<()> {
        for &s in samples {
            self.inner.write_sample(s)?;
        }
        self.samples_written += samples.len() as u64;
        Ok(())
    }

    fn frames(&self) -> u64 {
        self.samples_written / self.channels.max(1) as u64
    }

    fn finalize(self: Box<Self>) -> Result<u64> {
        let frames = self.frames();
        self.inner.finalize()?;
        Ok(frames)
    }
}

impl ContainerStore for WavStore {
    fn create(
        &self,
        handle: &ResourceHandle,
        format: AudioFormat,
    ) -> Result<Box<dyn ContainerWriter>> {
        let path = self.path_of(handle);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let inner = WavWriter::create(&path, wav_spec(format))?;
        debug!(container = %handle, "created container");
        Ok(Box::new(WavContainerWriter {
            inner,
            channels: format.channels,
            samples_written: 0,
        }))
    }

    fn append(&self, dst: &ResourceHandle, src: &ResourceHandle) -> Result<u64> {
        let mut reader = self.open_reader(src)?;
        let src_spec = reader.spec();
        let dst_path = self.path_of(dst);
        if !dst_path.exists() {
            return Err(RollcapError::ContainerNotFound(dst.to_string()));
        }
        let mut writer = WavWriter::append(&dst_path)?;
        if writer.spec() != src_spec {
            return Err(RollcapError::InvalidChunk(format!(
                "format mismatch appending {src} onto {dst}"
            )));
        }
        let frames = reader.duration() as u64;
        for sample in reader.samples::<i16>() {
            writer.write_sample(sample?)?;
        }
        writer.finalize()?;
        debug!(dst = %dst, src = %src, frames, "appended container");
        Ok(frames)
    }

    fn truncate(&self, handle: &ResourceHandle, keep: Range<u64>) -> Result<u64> {
        let mut reader = self.open_reader(handle)?;
        let spec = reader.spec();
        let total = reader.duration() as u64;
        let start = keep.start.min(total);
        let end = keep.end.min(total).max(start);
        if start == 0 && end == total {
            return Ok(total);
        }

        let path = self.path_of(handle);
        let mut tmp = path.clone().into_os_string();
        tmp.push(TRIM_SUFFIX);
        let tmp = PathBuf::from(tmp);

        let keep_frames = end - start;
        {
            let mut writer = WavWriter::create(&tmp, spec)?;
            if keep_frames > 0 {
                let offset = u32::try_from(start).map_err(|_| {
                    RollcapError::TrimFailure(format!(
                        "offset {start} is beyond the WAV frame range of {handle}"
                    ))
                })?;
                reader.seek(offset)?;
                let take = (keep_frames * spec.channels as u64) as usize;
                for sample in reader.samples::<i16>().take(take) {
                    writer.write_sample(sample?)?;
                }
            }
            writer.finalize()?;
        }
        drop(reader);
        fs::rename(&tmp, &path)?;
        debug!(container = %handle, start, end, "truncated container");
        Ok(keep_frames)
    }

    fn delete(&self, handle: &ResourceHandle) -> Result<()> {
        match fs::remove_file(self.path_of(handle)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn stat(&self, handle: &ResourceHandle) -> Result<ContainerStat> {
        let reader = self.open_reader(handle)?;
        let format = audio_format(&reader.spec())?;
        let frames = reader.duration() as u64;
        let bytes = fs::metadata(self.path_of(handle))?.len();
        Ok(ContainerStat {
            format,
            frames,
            bytes,
        })
    }

    fn exists(&self, handle: &ResourceHandle) -> bool {
        self.path_of(handle).exists()
    }

    fn rename(&self, from: &ResourceHandle, to: &ResourceHandle) -> Result<()> {
        let to_path = self.path_of(to);
        if let Some(parent) = to_path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::rename(self.path_of(from), to_path)?;
        Ok(())
    }

    fn locate(&self, handle: &ResourceHandle) -> PathBuf {
        self.path_of(handle)
    }
}
