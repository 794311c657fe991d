//! Waveform codecs
//!
//! Two layers turn payloads into audio and back:
//!
//! | Codec | Payload | Technique |
//! |-------|---------|-----------|
//! | [`SpreadSpectrumSymbolCodec`] | semantic `(value, amplitude, phase)` triples | keyed carrier hopping, sinusoidal FM |
//! | [`MultiCarrierFrameCodec`] | bitstreams | parallel QAM carriers per frame (OFDM style) |
//!
//! The layers compose: [`MultiCarrierFrameCodec::encode_hopped`] moves every
//! frame to the sub-band picked by the hop sequence.
//!
//! Both codecs fail fast on bad configuration and degrade gracefully on bad
//! input audio: decode problems are reported as [`DecodeIssue`]s next to the
//! recovered data, never as errors (except for an empty waveform).

pub mod fhss;
pub mod ofdm;

pub use fhss::{
    DecodedMessage, DecodedSymbol, MessageMetadata, SemanticSymbol, SpreadSpectrumConfig,
    SpreadSpectrumSymbolCodec,
};
pub use ofdm::{
    CancellableEncode, DecodedFrames, MultiCarrierConfig, MultiCarrierFrameCodec,
};

use serde::Serialize;
use std::fmt;

/// Recoverable configuration problem. The codec still runs.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConfigWarning {
    /// Carrier spacing is not an integer multiple of `1 / symbol_duration`,
    /// so neighbouring carriers leak into each other.
    NonOrthogonal { spacing_hz: f64, symbol_rate_hz: f64 },
}

impl fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigWarning::NonOrthogonal {
                spacing_hz,
                symbol_rate_hz,
            } => write!(
                f,
                "carrier spacing {spacing_hz} Hz is not an integer multiple of the symbol rate {symbol_rate_hz} Hz"
            ),
        }
    }
}

/// Something the decoder noticed about the input audio.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DecodeIssue {
    /// The waveform was recorded at a different rate than the codec expects.
    SampleRateMismatch { expected: u32, actual: u32 },
    /// Trailing samples too short for a whole frame or dwell were skipped.
    Truncated { samples: usize, needed: usize },
    /// The payload length asked for more bits than the waveform carries.
    ShortPayload { requested: usize, available: usize },
    /// The carrier basis could not be inverted for this many frames; plain
    /// correlation was used instead.
    SingularCarrierBasis { frames: usize },
    /// A dwell window had no usable energy.
    LowEnergy { hop_index: u64 },
}

impl fmt::Display for DecodeIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeIssue::SampleRateMismatch { expected, actual } => {
                write!(f, "sample rate {actual} Hz does not match codec rate {expected} Hz")
            }
            DecodeIssue::Truncated { samples, needed } => {
                write!(f, "{samples} trailing samples ignored ({needed} needed)")
            }
            DecodeIssue::ShortPayload {
                requested,
                available,
            } => write!(f, "requested {requested} bits but only {available} decoded"),
            DecodeIssue::SingularCarrierBasis { frames } => {
                write!(f, "carrier basis singular in {frames} frames, correlator used")
            }
            DecodeIssue::LowEnergy { hop_index } => write!(f, "hop {hop_index}: no energy"),
        }
    }
}

/// Static description of a codec.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CodecInfo {
    pub name: &'static str,
    pub description: &'static str,
    pub sample_rate: u32,
    /// Samples per frame (multi-carrier) or per dwell (spread spectrum)
    pub samples_per_unit: usize,
    /// Lowest and highest frequency the codec can emit, in Hz
    pub band_hz: (f64, f64),
}

/// Common surface of both codecs.
pub trait ModemCodec: Send + Sync {
    fn info(&self) -> CodecInfo;

    fn sample_rate(&self) -> u32 {
        self.info().sample_rate
    }

    /// Samples produced per frame or dwell.
    fn samples_per_unit(&self) -> usize {
        self.info().samples_per_unit
    }
}
