//! Keyed frequency hopping with FM symbols
//!
//! Each semantic symbol occupies one dwell on the carrier picked by the hop
//! sequence. The symbol's value is a modulating frequency `f_m`; the carrier
//! swings `± Δf = f_c · deviation_fraction` around its centre at that rate.
//!
//! ## Mathematical Basis
//!
//! ```text
//! f_inst(t) = f_c + Δf · sin(2π f_m t)
//! φ(t)      = 2π f_c t + (Δf / f_m) · (1 − cos 2π f_m t)      (f_m = 0: pure carrier)
//! s(t)      = A · sin(φ(t) + θ),   0 ≤ t < dwell
//! ```
//!
//! ## Decoding
//!
//! ```text
//! window ─► analytic signal z ─► trim edges ─► f_inst − f_c
//!    RMS deviation small? ──yes──► f_m = 0
//!          │ no
//!          ▼
//!    spectral peak (coarse f_m) ─► grid + golden search on |⟨z, e^{jφ}⟩|
//!          ▼
//!    c = mean(z · e^{−jφ})  ─►  A = |c|,  θ = arg c + π/2
//! ```
//!
//! The receiver needs the same key as the sender to rebuild the carrier
//! sequence; a decoder with the wrong key correlates against the wrong
//! carriers and reports near-zero confidence.

use super::{CodecInfo, DecodeIssue, ModemCodec};
use crate::analytic::{analytic_signal, dominant_frequency, instantaneous_frequency, wrap_phase};
use crate::hopping::HopSequenceGenerator;
use crate::observe::{default_observer, Layer, ModemEvent, SharedObserver};
use crate::parallel;
use crate::types::{check_nyquist, seconds_to_samples, ModemError, ModemResult, Waveform};
use num_complex::Complex64;
use serde::{Deserialize, Serialize};
use std::f64::consts::{FRAC_PI_2, PI};
use std::fmt;
use std::sync::Arc;

/// Windows quieter than this RMS are not analysed.
const ENERGY_FLOOR: f64 = 1e-4;

/// Fraction of the dwell ignored at each edge of the analytic signal.
const EDGE_TRIM: f64 = 0.1;

/// Deviation RMS, relative to `Δf`, below which the carrier is unmodulated.
const STATIC_DEVIATION_RATIO: f64 = 0.05;

const MIN_ANALYSIS_SAMPLES: usize = 32;
const FM_GRID_MAX_POINTS: usize = 512;
const GOLDEN_ITERATIONS: usize = 40;

/// Spread-spectrum timing and deviation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpreadSpectrumConfig {
    /// Time spent on each carrier, in milliseconds
    pub dwell_time_ms: f64,
    /// Peak FM deviation as a fraction of the carrier frequency
    pub deviation_fraction: f64,
    pub sample_rate: u32,
}

impl Default for SpreadSpectrumConfig {
    fn default() -> Self {
        Self {
            dwell_time_ms: 10.0,
            deviation_fraction: 0.1,
            sample_rate: 192_000,
        }
    }
}

impl SpreadSpectrumConfig {
    pub fn dwell_seconds(&self) -> f64 {
        self.dwell_time_ms / 1000.0
    }

    pub fn samples_per_dwell(&self) -> usize {
        seconds_to_samples(self.dwell_seconds(), self.sample_rate)
    }

    pub fn validate(&self) -> ModemResult<()> {
        if self.sample_rate == 0 {
            return Err(ModemError::config("sample_rate must be positive"));
        }
        if !self.dwell_time_ms.is_finite() || self.dwell_time_ms <= 0.0 {
            return Err(ModemError::config(format!(
                "dwell_time_ms must be positive, got {}",
                self.dwell_time_ms
            )));
        }
        if self.samples_per_dwell() == 0 {
            return Err(ModemError::config(format!(
                "a {} ms dwell is shorter than one sample at {} Hz",
                self.dwell_time_ms, self.sample_rate
            )));
        }
        if !self.deviation_fraction.is_finite() || !(0.0..1.0).contains(&self.deviation_fraction) {
            return Err(ModemError::config(format!(
                "deviation_fraction must lie in [0, 1), got {}",
                self.deviation_fraction
            )));
        }
        Ok(())
    }
}

/// One semantic symbol: a modulating frequency with amplitude and phase.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SemanticSymbol {
    /// Modulating frequency `f_m` in Hz; `0` sends a bare carrier
    pub frequency: f64,
    /// Peak amplitude in `[0, 1]`
    pub amplitude: f64,
    /// Phase offset in radians
    pub phase: f64,
}

impl SemanticSymbol {
    pub fn new(frequency: f64, amplitude: f64, phase: f64) -> Self {
        Self {
            frequency,
            amplitude,
            phase,
        }
    }

    fn validate(&self, sample_rate: u32) -> ModemResult<()> {
        if !self.frequency.is_finite() || self.frequency < 0.0 {
            return Err(ModemError::config(format!(
                "symbol frequency must be finite and non-negative, got {}",
                self.frequency
            )));
        }
        if self.frequency >= sample_rate as f64 / 2.0 {
            return Err(ModemError::config(format!(
                "symbol frequency {} Hz is not below half the sample rate",
                self.frequency
            )));
        }
        if !(0.0..=1.0).contains(&self.amplitude) {
            return Err(ModemError::config(format!(
                "symbol amplitude must lie in [0, 1], got {}",
                self.amplitude
            )));
        }
        if !self.phase.is_finite() {
            return Err(ModemError::config("symbol phase must be finite"));
        }
        Ok(())
    }
}

/// Bookkeeping returned with an encoded message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageMetadata {
    pub num_symbols: usize,
    pub start_hop: u64,
    /// Hop index following the last symbol
    pub end_hop: u64,
    pub hops_used: usize,
    pub duration_seconds: f64,
    pub samples_per_dwell: usize,
    /// Carrier of each symbol, in order
    pub carriers: Vec<f64>,
}

impl MessageMetadata {
    pub fn to_json(&self) -> ModemResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// One recovered dwell.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DecodedSymbol {
    pub hop_index: u64,
    pub carrier_hz: f64,
    /// Recovered modulating frequency in Hz
    pub frequency: f64,
    pub amplitude: f64,
    /// Radians in `(-π, π]`
    pub phase: f64,
    /// `|⟨z, reference⟩| / mean|z|`, 0 for silent windows
    pub confidence: f64,
}

impl DecodedSymbol {
    fn silent(hop_index: u64, carrier_hz: f64) -> Self {
        Self {
            hop_index,
            carrier_hz,
            frequency: 0.0,
            amplitude: 0.0,
            phase: 0.0,
            confidence: 0.0,
        }
    }

    pub fn symbol(&self) -> SemanticSymbol {
        SemanticSymbol::new(self.frequency, self.amplitude, self.phase)
    }
}

/// Result of [`SpreadSpectrumSymbolCodec::decode_message`].
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DecodedMessage {
    pub symbols: Vec<DecodedSymbol>,
    pub issues: Vec<DecodeIssue>,
}

impl DecodedMessage {
    pub fn mean_confidence(&self) -> f64 {
        if self.symbols.is_empty() {
            return 0.0;
        }
        self.symbols.iter().map(|s| s.confidence).sum::<f64>() / self.symbols.len() as f64
    }
}

/// Encodes semantic symbols onto keyed hop carriers and back.
pub struct SpreadSpectrumSymbolCodec {
    hopper: Arc<HopSequenceGenerator>,
    config: SpreadSpectrumConfig,
    samples_per_dwell: usize,
    observer: SharedObserver,
}

impl fmt::Debug for SpreadSpectrumSymbolCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpreadSpectrumSymbolCodec")
            .field("channels", &self.hopper.channel_count())
            .field("config", &self.config)
            .field("samples_per_dwell", &self.samples_per_dwell)
            .finish_non_exhaustive()
    }
}

impl SpreadSpectrumSymbolCodec {
    /// Fails with `NyquistViolation` if the highest hop channel, or its peak
    /// deviated frequency, reaches `fs/2`.
    pub fn new(hopper: Arc<HopSequenceGenerator>, config: SpreadSpectrumConfig) -> ModemResult<Self> {
        config.validate()?;
        let highest = hopper.grid().highest();
        check_nyquist(highest, config.sample_rate)?;
        check_nyquist(highest * (1.0 + config.deviation_fraction), config.sample_rate)?;

        let samples_per_dwell = config.samples_per_dwell();
        tracing::debug!(
            channels = hopper.channel_count(),
            samples_per_dwell,
            deviation_fraction = config.deviation_fraction,
            "spread-spectrum codec ready"
        );

        Ok(Self {
            hopper,
            config,
            samples_per_dwell,
            observer: default_observer(),
        })
    }

    pub fn with_observer(mut self, observer: SharedObserver) -> Self {
        self.observer = observer;
        self
    }

    pub fn config(&self) -> &SpreadSpectrumConfig {
        &self.config
    }

    pub fn hopper(&self) -> &HopSequenceGenerator {
        &self.hopper
    }

    pub fn samples_per_dwell(&self) -> usize {
        self.samples_per_dwell
    }

    /// Render one symbol on the carrier for `hop_index`.
    pub fn encode_symbol(&self, symbol: &SemanticSymbol, hop_index: u64) -> ModemResult<Waveform> {
        symbol.validate(self.config.sample_rate)?;
        let mut samples = vec![0.0f32; self.samples_per_dwell];
        self.render_dwell(symbol, hop_index, &mut samples);
        Ok(Waveform::new(samples, self.config.sample_rate))
    }

    /// Render `symbols` back to back, advancing one hop per symbol.
    pub fn encode_message(
        &self,
        symbols: &[SemanticSymbol],
        start_hop: u64,
    ) -> ModemResult<(Waveform, MessageMetadata)> {
        for symbol in symbols {
            symbol.validate(self.config.sample_rate)?;
        }

        let samples = parallel::render_blocks(0..symbols.len(), self.samples_per_dwell, |i, block| {
            self.render_dwell(&symbols[i], hop_at(start_hop, i), block);
        });
        let waveform = Waveform::new(samples, self.config.sample_rate);

        let metadata = MessageMetadata {
            num_symbols: symbols.len(),
            start_hop,
            end_hop: hop_at(start_hop, symbols.len()),
            hops_used: symbols.len(),
            duration_seconds: waveform.duration_seconds(),
            samples_per_dwell: self.samples_per_dwell,
            carriers: (0..symbols.len())
                .map(|i| self.hopper.channel_at(hop_at(start_hop, i)))
                .collect(),
        };

        self.observer.on_event(&ModemEvent::Encoded {
            layer: Layer::SpreadSpectrum,
            units: symbols.len(),
            samples: waveform.len(),
        });
        Ok((waveform, metadata))
    }

    /// Recover the symbol in one dwell window.
    ///
    /// Silent windows come back with zero confidence rather than an error.
    pub fn decode_symbol(&self, window: &[f32], hop_index: u64) -> ModemResult<DecodedSymbol> {
        if window.is_empty() {
            return Err(ModemError::EmptyWaveform);
        }
        Ok(self.analyze(window, hop_index))
    }

    /// Decode every whole dwell of `waveform`, the first one on `start_hop`.
    pub fn decode_message(&self, waveform: &Waveform, start_hop: u64) -> ModemResult<DecodedMessage> {
        if waveform.is_empty() {
            return Err(ModemError::EmptyWaveform);
        }

        let mut result = DecodedMessage::default();
        if waveform.sample_rate != self.config.sample_rate {
            result.issues.push(DecodeIssue::SampleRateMismatch {
                expected: self.config.sample_rate,
                actual: waveform.sample_rate,
            });
            self.report_decoded(&result);
            return Ok(result);
        }

        let dwell = self.samples_per_dwell;
        let count = waveform.len() / dwell;
        let remainder = waveform.len() % dwell;
        if remainder > 0 {
            result.issues.push(DecodeIssue::Truncated {
                samples: remainder,
                needed: dwell,
            });
        }

        result.symbols = parallel::map_indexed(count, |i| {
            self.analyze(waveform.window(i * dwell, dwell), hop_at(start_hop, i))
        });

        for symbol in result.symbols.iter().filter(|s| s.confidence == 0.0) {
            result.issues.push(DecodeIssue::LowEnergy {
                hop_index: symbol.hop_index,
            });
        }

        self.report_decoded(&result);
        Ok(result)
    }

    fn render_dwell(&self, symbol: &SemanticSymbol, hop_index: u64, out: &mut [f32]) {
        let carrier = self.hopper.channel_at(hop_index);
        let deviation = carrier * self.config.deviation_fraction;
        let fs = self.config.sample_rate as f64;
        for (n, slot) in out.iter_mut().enumerate() {
            let t = n as f64 / fs;
            let phase = fm_phase(t, carrier, deviation, symbol.frequency) + symbol.phase;
            *slot = (symbol.amplitude * phase.sin()) as f32;
        }
    }

    fn analyze(&self, window: &[f32], hop_index: u64) -> DecodedSymbol {
        let carrier = self.hopper.channel_at(hop_index);
        let x: Vec<f64> = window.iter().map(|&s| s as f64).collect();

        let rms = (x.iter().map(|v| v * v).sum::<f64>() / x.len().max(1) as f64).sqrt();
        if rms < ENERGY_FLOOR || x.len() < MIN_ANALYSIS_SAMPLES {
            self.observer
                .on_event(&ModemEvent::LowEnergyWindow { hop_index, rms });
            return DecodedSymbol::silent(hop_index, carrier);
        }

        let z = analytic_signal(&x);
        let margin = (x.len() as f64 * EDGE_TRIM) as usize;
        let track = DwellTrack {
            body: &z[margin..z.len() - margin],
            offset: margin,
            sample_rate: self.config.sample_rate as f64,
            carrier,
            deviation: carrier * self.config.deviation_fraction,
        };

        let modulating = track.estimate_modulating_frequency();
        let c = track.correlate(modulating);
        let mean_magnitude = track.body.iter().map(|v| v.norm()).sum::<f64>() / track.body.len() as f64;
        let confidence = if mean_magnitude > 0.0 {
            (c.norm() / mean_magnitude).clamp(0.0, 1.0)
        } else {
            0.0
        };

        DecodedSymbol {
            hop_index,
            carrier_hz: carrier,
            frequency: modulating,
            amplitude: c.norm(),
            phase: wrap_phase(c.arg() + FRAC_PI_2),
            confidence,
        }
    }

    fn report_decoded(&self, result: &DecodedMessage) {
        self.observer.on_event(&ModemEvent::Decoded {
            layer: Layer::SpreadSpectrum,
            units: result.symbols.len(),
            mean_confidence: result.mean_confidence(),
            issues: result.issues.len(),
        });
    }
}

impl ModemCodec for SpreadSpectrumSymbolCodec {
    fn info(&self) -> CodecInfo {
        let grid = self.hopper.grid();
        let low = grid.freq_min() * (1.0 - self.config.deviation_fraction);
        let high = grid.highest() * (1.0 + self.config.deviation_fraction);
        CodecInfo {
            name: "spread-spectrum",
            description: "keyed frequency hopping with sinusoidal FM symbols",
            sample_rate: self.config.sample_rate,
            samples_per_unit: self.samples_per_dwell,
            band_hz: (low, high),
        }
    }
}

/// Trimmed analytic signal of one dwell plus what is known about its carrier.
struct DwellTrack<'a> {
    body: &'a [Complex64],
    /// Index of `body[0]` within the dwell
    offset: usize,
    sample_rate: f64,
    carrier: f64,
    deviation: f64,
}

impl DwellTrack<'_> {
    fn estimate_modulating_frequency(&self) -> f64 {
        if self.deviation <= 0.0 {
            return 0.0;
        }

        let offsets: Vec<f64> = instantaneous_frequency(self.body, self.sample_rate)
            .into_iter()
            .map(|f| f - self.carrier)
            .collect();
        let rms = (offsets.iter().map(|d| d * d).sum::<f64>() / offsets.len().max(1) as f64).sqrt();
        if rms < STATIC_DEVIATION_RATIO * self.deviation {
            return 0.0;
        }

        match dominant_frequency(&offsets, self.sample_rate) {
            Some(coarse) => self.refine(coarse),
            None => 0.0,
        }
    }

    /// Maximise the correlation magnitude within one analysis bin of `coarse`.
    fn refine(&self, coarse: f64) -> f64 {
        let bin = self.sample_rate / self.body.len() as f64;
        let lo = (coarse - bin).max(bin * 0.01);
        let hi = coarse + bin;

        // The correlation peak narrows as the modulation index grows.
        let duration = (self.offset + self.body.len()) as f64 / self.sample_rate;
        let step = (coarse / (8.0 * self.deviation * duration)).clamp(0.01, bin / 4.0);
        let points = (((hi - lo) / step).ceil() as usize + 1).clamp(2, FM_GRID_MAX_POINTS);
        let step = (hi - lo) / (points - 1) as f64;

        let score = |fm: f64| self.correlate(fm).norm();
        let (best, _) = (0..points)
            .map(|i| lo + i as f64 * step)
            .map(|fm| (fm, score(fm)))
            .fold((lo, f64::NEG_INFINITY), |acc, cand| if cand.1 > acc.1 { cand } else { acc });

        golden_section_max(score, (best - step).max(lo), (best + step).min(hi))
    }

    /// `mean(z · e^{−jφ})` for the reference trajectory with modulating `fm`.
    fn correlate(&self, fm: f64) -> Complex64 {
        let sum: Complex64 = self
            .body
            .iter()
            .enumerate()
            .map(|(i, z)| {
                let t = (self.offset + i) as f64 / self.sample_rate;
                z * Complex64::from_polar(1.0, -fm_phase(t, self.carrier, self.deviation, fm))
            })
            .sum();
        sum / self.body.len() as f64
    }
}

/// Integrated phase of the FM trajectory at time `t`.
#[inline]
fn fm_phase(t: f64, carrier: f64, deviation: f64, modulating: f64) -> f64 {
    let mut phase = 2.0 * PI * carrier * t;
    if modulating > 0.0 {
        phase += deviation / modulating * (1.0 - (2.0 * PI * modulating * t).cos());
    }
    phase
}

fn golden_section_max<F: Fn(f64) -> f64>(f: F, mut a: f64, mut b: f64) -> f64 {
    let ratio = (5.0_f64.sqrt() - 1.0) / 2.0;
    let mut c = b - ratio * (b - a);
    let mut d = a + ratio * (b - a);
    let (mut fc, mut fd) = (f(c), f(d));
    for _ in 0..GOLDEN_ITERATIONS {
        if fc > fd {
            b = d;
            d = c;
            fd = fc;
            c = b - ratio * (b - a);
            fc = f(c);
        } else {
            a = c;
            c = d;
            fc = fd;
            d = a + ratio * (b - a);
            fd = f(d);
        }
    }
    (a + b) / 2.0
}

#[inline]
fn hop_at(start_hop: u64, offset: usize) -> u64 {
    start_hop.wrapping_add(offset as u64)
}
