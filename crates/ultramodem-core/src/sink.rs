//! Audio sink/source boundary
//!
//! Encoders hand finished [`Waveform`]s to an [`AudioSink`]. The modem
//! itself never plays or records audio; persistence is the sink's job.
//!
//! ```rust,no_run
//! use ultramodem_core::sink::{read_wav, AudioSink, WavSink};
//! use ultramodem_core::waveform::MultiCarrierFrameCodec;
//!
//! let codec = MultiCarrierFrameCodec::new(Default::default()).unwrap();
//! let waveform = codec.encode_bytes(b"hello").unwrap();
//!
//! let mut sink = WavSink::new("/tmp/hello.wav");
//! sink.write(&waveform).unwrap();
//!
//! let recorded = read_wav("/tmp/hello.wav").unwrap();
//! let data = codec.decode_bytes(&recorded, Some(5)).unwrap();
//! ```

use crate::types::{ModemResult, Waveform};
use hound::{SampleFormat, WavReader, WavSpec, WavWriter};
use std::path::{Path, PathBuf};

/// Peak level written files are normalized to.
pub const DEFAULT_PEAK: f32 = 0.85;

const PCM_BITS: u16 = 16;
const PCM_FULL_SCALE: f32 = 32767.0;

/// Destination for rendered transmissions.
pub trait AudioSink: Send {
    fn write(&mut self, waveform: &Waveform) -> ModemResult<()>;
}

/// Writes each waveform to one 16-bit mono PCM file, replacing it.
#[derive(Debug, Clone)]
pub struct WavSink {
    path: PathBuf,
    peak: Option<f32>,
}

impl WavSink {
    /// Sink normalizing to [`DEFAULT_PEAK`].
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            peak: Some(DEFAULT_PEAK),
        }
    }

    /// Normalize to `peak`, or write samples unscaled (clipped to full
    /// scale) with `None`.
    pub fn with_peak(mut self, peak: Option<f32>) -> Self {
        self.peak = peak;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl AudioSink for WavSink {
    fn write(&mut self, waveform: &Waveform) -> ModemResult<()> {
        write_wav(&self.path, waveform, self.peak)
    }
}

/// Keeps every waveform in memory.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    pub waveforms: Vec<Waveform>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// All waveforms joined end to end, or `None` if nothing was written.
    pub fn concatenated(&self) -> Option<Waveform> {
        let (first, rest) = self.waveforms.split_first()?;
        let mut joined = first.clone();
        for wf in rest {
            joined.append(wf).ok()?;
        }
        Some(joined)
    }
}

impl AudioSink for MemorySink {
    fn write(&mut self, waveform: &Waveform) -> ModemResult<()> {
        self.waveforms.push(waveform.clone());
        Ok(())
    }
}

/// Write `waveform` as 16-bit mono PCM, creating parent directories.
///
/// With `peak` the largest sample is scaled to that level; a silent
/// waveform is written as is.
pub fn write_wav(path: impl AsRef<Path>, waveform: &Waveform, peak: Option<f32>) -> ModemResult<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }

    let max = waveform.peak();
    let scale = match peak {
        Some(level) if max > 0.0 => level / max,
        _ => 1.0,
    };

    let spec = WavSpec {
        channels: 1,
        sample_rate: waveform.sample_rate,
        bits_per_sample: PCM_BITS,
        sample_format: SampleFormat::Int,
    };
    let mut writer = WavWriter::create(path, spec)?;
    for &sample in &waveform.samples {
        let pcm = (sample * scale * PCM_FULL_SCALE)
            .round()
            .clamp(-PCM_FULL_SCALE - 1.0, PCM_FULL_SCALE) as i16;
        writer.write_sample(pcm)?;
    }
    writer.finalize()?;

    tracing::debug!(
        path = %path.display(),
        samples = waveform.len(),
        sample_rate = waveform.sample_rate,
        scale,
        "waveform written"
    );
    Ok(())
}

/// Load a WAV file as a waveform in `[-1, 1]`.
///
/// Integer PCM of any width and 32-bit float are accepted. Only the first
/// channel of a multi-channel file is kept.
pub fn read_wav(path: impl AsRef<Path>) -> ModemResult<Waveform> {
    let mut reader = WavReader::open(path.as_ref())?;
    let spec = reader.spec();
    let channels = spec.channels.max(1) as usize;

    let interleaved: Vec<f32> = match spec.sample_format {
        SampleFormat::Int => {
            let full_scale = (1u64 << (spec.bits_per_sample.saturating_sub(1))) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as f32 / full_scale))
                .collect::<Result<_, _>>()?
        }
        SampleFormat::Float => reader.samples::<f32>().collect::<Result<_, _>>()?,
    };

    let samples = interleaved.into_iter().step_by(channels).collect();
    Ok(Waveform::new(samples, spec.sample_rate))
}
