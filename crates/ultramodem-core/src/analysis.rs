//! Bitrate and spectral-efficiency accounting
//!
//! ```text
//! bitrate    = payload_bits / duration          [bit/s]
//! efficiency = bitrate / occupied_bandwidth     [bit/s/Hz]
//! ```
//!
//! The analyzer only reads codec parameters; it never touches samples.

use crate::hopping::HopSequenceGenerator;
use crate::types::{ModemError, ModemResult, Waveform};
use crate::waveform::{MultiCarrierConfig, SpreadSpectrumConfig};
use serde::Serialize;

/// Summary of one transmission.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TransmissionStats {
    pub raw_bits: usize,
    pub duration_seconds: f64,
    pub bitrate_bps: f64,
    pub spectral_efficiency_bits_per_hz: f64,
}

impl TransmissionStats {
    pub fn to_json(&self) -> ModemResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

impl std::fmt::Display for TransmissionStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} bits in {:.4} s: {:.1} bit/s, {:.3} bit/s/Hz",
            self.raw_bits, self.duration_seconds, self.bitrate_bps, self.spectral_efficiency_bits_per_hz
        )
    }
}

/// Stateless calculator for [`TransmissionStats`].
#[derive(Debug, Clone, Copy, Default)]
pub struct TransmissionAnalyzer;

impl TransmissionAnalyzer {
    /// Fails with `Config` unless both `duration_seconds` and `bandwidth_hz`
    /// are positive and finite.
    pub fn analyze(
        payload_bits: usize,
        duration_seconds: f64,
        bandwidth_hz: f64,
    ) -> ModemResult<TransmissionStats> {
        if !duration_seconds.is_finite() || duration_seconds <= 0.0 {
            return Err(ModemError::config(format!(
                "waveform duration must be positive, got {duration_seconds} s"
            )));
        }
        if !bandwidth_hz.is_finite() || bandwidth_hz <= 0.0 {
            return Err(ModemError::config(format!(
                "bandwidth must be positive, got {bandwidth_hz} Hz"
            )));
        }

        let bitrate_bps = payload_bits as f64 / duration_seconds;
        Ok(TransmissionStats {
            raw_bits: payload_bits,
            duration_seconds,
            bitrate_bps,
            spectral_efficiency_bits_per_hz: bitrate_bps / bandwidth_hz,
        })
    }

    /// Stats for `payload_bits` sent with `config`.
    ///
    /// The duration counts the zero-padded last frame, so short payloads
    /// score below [`theoretical`](Self::theoretical).
    pub fn for_multicarrier(config: &MultiCarrierConfig, payload_bits: usize) -> ModemResult<TransmissionStats> {
        let per_frame = config.bits_per_frame();
        if per_frame == 0 {
            return Err(ModemError::config("configuration carries no bits per frame"));
        }
        let frames = payload_bits.div_ceil(per_frame);
        Self::analyze(
            payload_bits,
            frames as f64 * config.frame_duration(),
            config.occupied_bandwidth(),
        )
    }

    /// Stats for one completely filled frame.
    pub fn theoretical(config: &MultiCarrierConfig) -> ModemResult<TransmissionStats> {
        Self::for_multicarrier(config, config.bits_per_frame())
    }

    /// Stats with the duration taken from the rendered sample count.
    pub fn for_waveform(payload_bits: usize, waveform: &Waveform, bandwidth_hz: f64) -> ModemResult<TransmissionStats> {
        Self::analyze(payload_bits, waveform.duration_seconds(), bandwidth_hz)
    }

    /// Stats for `num_symbols` dwells, each worth `bits_per_symbol`, over the
    /// whole hop band.
    pub fn for_spread_spectrum(
        config: &SpreadSpectrumConfig,
        hopper: &HopSequenceGenerator,
        num_symbols: usize,
        bits_per_symbol: usize,
    ) -> ModemResult<TransmissionStats> {
        Self::analyze(
            num_symbols * bits_per_symbol,
            num_symbols as f64 * config.dwell_seconds(),
            hopper.grid().bandwidth(),
        )
    }
}
