//! Core types shared by both modem layers
//!
//! Everything that crosses a module boundary lives here: the real-valued
//! [`Waveform`] buffer produced by every encoder and consumed by every
//! decoder, the complex [`IQPoint`] used for constellation symbols, bitstream
//! helpers, and the crate-wide error type.
//!
//! ## Bit order
//!
//! A bitstream is a `Vec<u8>` whose elements are `0` or `1`. Bytes are
//! unpacked least-significant bit first:
//!
//! ```text
//! 0b1000_0011  →  [1, 1, 0, 0, 0, 0, 0, 1]
//! ```

use num_complex::Complex64;
use serde::{Deserialize, Serialize};

/// A point in the in-phase/quadrature plane (`re = I`, `im = Q`)
pub type IQPoint = Complex64;

/// Unpacked bits, one bit per element
pub type BitStream = Vec<u8>;

/// Result type for modem operations
pub type ModemResult<T> = Result<T, ModemError>;

/// Errors that can occur while configuring, encoding or decoding
#[derive(Debug, thiserror::Error)]
pub enum ModemError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("carrier {frequency_hz} Hz is at or above the Nyquist frequency {nyquist_hz} Hz")]
    NyquistViolation { frequency_hz: f64, nyquist_hz: f64 },

    #[error("modulation error: {0}")]
    Modulation(String),

    #[error("waveform contains no samples")]
    EmptyWaveform,

    #[error("invalid secret key: {0}")]
    Key(String),

    #[error("config file error: {0}")]
    ConfigFile(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WAV error: {0}")]
    Wav(#[from] hound::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ModemError {
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        ModemError::Config(msg.into())
    }
}

/// Fail with [`ModemError::NyquistViolation`] unless `frequency_hz < sample_rate / 2`.
pub(crate) fn check_nyquist(frequency_hz: f64, sample_rate: u32) -> ModemResult<()> {
    let nyquist_hz = sample_rate as f64 / 2.0;
    if frequency_hz >= nyquist_hz {
        return Err(ModemError::NyquistViolation {
            frequency_hz,
            nyquist_hz,
        });
    }
    Ok(())
}

/// A block of real audio samples in `[-1, 1]` at a fixed sample rate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Waveform {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl Waveform {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    /// An empty buffer at the given rate.
    pub fn empty(sample_rate: u32) -> Self {
        Self::new(Vec::new(), sample_rate)
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Duration in seconds implied by the sample count.
    pub fn duration_seconds(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / self.sample_rate as f64
    }

    /// Largest absolute sample value.
    pub fn peak(&self) -> f32 {
        self.samples.iter().fold(0.0f32, |acc, s| acc.max(s.abs()))
    }

    /// Root-mean-square level.
    pub fn rms(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        let sum: f64 = self.samples.iter().map(|&s| (s as f64) * (s as f64)).sum();
        (sum / self.samples.len() as f64).sqrt()
    }

    /// Append another buffer recorded at the same rate.
    pub fn append(&mut self, other: &Waveform) -> ModemResult<()> {
        if other.sample_rate != self.sample_rate {
            return Err(ModemError::config(format!(
                "cannot append {} Hz audio to a {} Hz waveform",
                other.sample_rate, self.sample_rate
            )));
        }
        self.samples.extend_from_slice(&other.samples);
        Ok(())
    }

    /// Slice of samples `[start, start + len)`, clamped to the buffer.
    pub fn window(&self, start: usize, len: usize) -> &[f32] {
        let start = start.min(self.samples.len());
        let end = start.saturating_add(len).min(self.samples.len());
        &self.samples[start..end]
    }
}

/// Unpack bytes into bits, least-significant bit first.
pub fn bytes_to_bits(data: &[u8]) -> BitStream {
    let mut bits = Vec::with_capacity(data.len() * 8);
    for byte in data {
        for i in 0..8 {
            bits.push((byte >> i) & 1);
        }
    }
    bits
}

/// Pack bits into bytes, least-significant bit first. A trailing partial
/// byte is zero-filled.
pub fn bits_to_bytes(bits: &[u8]) -> Vec<u8> {
    bits.chunks(8)
        .map(|chunk| {
            chunk
                .iter()
                .enumerate()
                .fold(0u8, |acc, (i, &bit)| acc | ((bit & 1) << i))
        })
        .collect()
}

/// Number of samples covering `seconds` at `sample_rate`, rounded to nearest.
pub(crate) fn seconds_to_samples(seconds: f64, sample_rate: u32) -> usize {
    (seconds * sample_rate as f64).round().max(0.0) as usize
}
