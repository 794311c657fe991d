//! Multi-carrier QAM framing (OFDM style)
//!
//! A bitstream is cut into frames of `num_carriers × bits_per_symbol` bits.
//! Every carrier of a frame carries one constellation point for one symbol
//! period, then the frame is followed by a silent guard interval.
//!
//! ## Mathematical Basis
//!
//! ```text
//! Transmit:  s(t) = (1/N) Σ_c [ I_c cos(2π f_c t) + Q_c sin(2π f_c t) ],  0 ≤ t < T
//!            then round(G · fs) zeros
//!
//! Receive, carriers on FFT bins (f_c · Ns / fs = k_c):
//!            I_c =  2N/Ns · Re X[k_c]
//!            Q_c = -2N/Ns · Im X[k_c]
//!
//! Receive, arbitrary carriers:
//!            r = Bᵀ x        (cos/sin correlator bank)
//!            u = N · (BᵀB)⁻¹ r   (exact least squares over the window)
//! ```
//!
//! With carriers spaced by integer multiples of `1/T` the correlators are
//! (nearly) independent. Any other spacing is accepted but reported as a
//! [`ConfigWarning::NonOrthogonal`].
//!
//! ## Frame Layout
//!
//! ```text
//! │◄──── Ns = round(T·fs) ────►│◄─ Ng ─►│◄──── Ns ────►│◄─ Ng ─►│
//! ┌────────────────────────────┬────────┬──────────────┬────────┐
//! │  frame 0: N carriers       │ guard  │  frame 1     │ guard  │ ...
//! └────────────────────────────┴────────┴──────────────┴────────┘
//! ```

use super::{CodecInfo, ConfigWarning, DecodeIssue, ModemCodec};
use crate::constellation::{ConstellationMapper, Modulation};
use crate::hopping::HopSequenceGenerator;
use crate::observe::{default_observer, Layer, ModemEvent, SharedObserver};
use crate::parallel;
use crate::types::{
    bits_to_bytes, bytes_to_bits, check_nyquist, seconds_to_samples, BitStream, IQPoint,
    ModemError, ModemResult, Waveform,
};
use num_complex::Complex64;
use rustfft::{Fft, FftPlanner};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::f64::consts::PI;
use std::fmt;
use std::ops::Range;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

const DEFAULT_SAMPLE_RATE: u32 = 192_000;

/// Relative tolerance when testing `spacing × T` for integrality.
const ORTHOGONALITY_TOLERANCE: f64 = 1e-6;

/// Tolerance when testing `f · Ns / fs` for integrality.
const BIN_TOLERANCE: f64 = 1e-6;

/// Frames rendered between two checks of the cancel flag.
const CANCEL_BATCH_FRAMES: usize = 16;

/// Pivot magnitude, relative to the largest Gram diagonal, treated as singular.
const SINGULAR_PIVOT: f64 = 1e-10;

/// Multi-carrier layout and timing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MultiCarrierConfig {
    pub num_carriers: usize,
    pub modulation: Modulation,
    /// Symbol period `T` in seconds
    pub symbol_duration: f64,
    /// Silent gap after every frame, in seconds
    pub guard_interval: f64,
    /// One frequency per carrier, in Hz
    pub carrier_frequencies: Vec<f64>,
    pub sample_rate: u32,
}

impl Default for MultiCarrierConfig {
    /// 64 QPSK carriers from 25 kHz, spaced `1/T` apart, at 192 kHz.
    fn default() -> Self {
        Self::evenly_spaced(64, 25_000.0, 1_000.0)
    }
}

impl MultiCarrierConfig {
    /// `num_carriers` carriers at `first_carrier + i · spacing`, with default
    /// timing (1 ms symbols, 0.2 ms guard), QPSK, 192 kHz.
    pub fn evenly_spaced(num_carriers: usize, first_carrier: f64, spacing: f64) -> Self {
        Self {
            num_carriers,
            modulation: Modulation::Qpsk,
            symbol_duration: 0.001,
            guard_interval: 0.0002,
            carrier_frequencies: (0..num_carriers)
                .map(|i| first_carrier + i as f64 * spacing)
                .collect(),
            sample_rate: DEFAULT_SAMPLE_RATE,
        }
    }

    /// Spread `num_carriers` over `[freq_min, freq_max)` with spacing
    /// `(freq_max - freq_min) / num_carriers`.
    ///
    /// The spacing rarely matches the symbol rate, so these layouts usually
    /// raise a non-orthogonality warning.
    pub fn band(num_carriers: usize, freq_min: f64, freq_max: f64) -> Self {
        let spacing = if num_carriers == 0 {
            0.0
        } else {
            (freq_max - freq_min) / num_carriers as f64
        };
        Self::evenly_spaced(num_carriers, freq_min, spacing)
    }

    pub fn with_modulation(mut self, modulation: Modulation) -> Self {
        self.modulation = modulation;
        self
    }

    pub fn with_timing(mut self, symbol_duration: f64, guard_interval: f64) -> Self {
        self.symbol_duration = symbol_duration;
        self.guard_interval = guard_interval;
        self
    }

    pub fn with_sample_rate(mut self, sample_rate: u32) -> Self {
        self.sample_rate = sample_rate;
        self
    }

    /// Payload bits carried by one frame.
    pub fn bits_per_frame(&self) -> usize {
        self.num_carriers * self.modulation.bits_per_symbol()
    }

    /// `symbol_duration + guard_interval`
    pub fn frame_duration(&self) -> f64 {
        self.symbol_duration + self.guard_interval
    }

    pub fn lowest_carrier(&self) -> f64 {
        self.carrier_frequencies
            .iter()
            .copied()
            .fold(f64::INFINITY, f64::min)
    }

    pub fn highest_carrier(&self) -> f64 {
        self.carrier_frequencies
            .iter()
            .copied()
            .fold(f64::NEG_INFINITY, f64::max)
    }

    /// Carrier span plus one symbol-rate main lobe.
    pub fn occupied_bandwidth(&self) -> f64 {
        if self.carrier_frequencies.is_empty() || self.symbol_duration <= 0.0 {
            return 0.0;
        }
        self.highest_carrier() - self.lowest_carrier() + 1.0 / self.symbol_duration
    }

    /// `bits_per_frame / frame_duration`
    pub fn theoretical_bitrate(&self) -> f64 {
        let frame = self.frame_duration();
        if frame <= 0.0 {
            return 0.0;
        }
        self.bits_per_frame() as f64 / frame
    }

    /// Check every construction constraint.
    pub fn validate(&self) -> ModemResult<()> {
        if self.sample_rate == 0 {
            return Err(ModemError::config("sample_rate must be positive"));
        }
        if self.num_carriers == 0 {
            return Err(ModemError::config("num_carriers must be at least 1"));
        }
        if self.carrier_frequencies.len() != self.num_carriers {
            return Err(ModemError::config(format!(
                "{} carrier frequencies given for {} carriers",
                self.carrier_frequencies.len(),
                self.num_carriers
            )));
        }
        if !self.symbol_duration.is_finite() || self.symbol_duration <= 0.0 {
            return Err(ModemError::config(format!(
                "symbol_duration must be positive, got {}",
                self.symbol_duration
            )));
        }
        if !self.guard_interval.is_finite() || self.guard_interval < 0.0 {
            return Err(ModemError::config(format!(
                "guard_interval must be non-negative, got {}",
                self.guard_interval
            )));
        }

        for &freq in &self.carrier_frequencies {
            if !freq.is_finite() || freq <= 0.0 {
                return Err(ModemError::config(format!(
                    "carrier frequencies must be positive, got {freq} Hz"
                )));
            }
            check_nyquist(freq, self.sample_rate)?;
        }

        let sorted = self.sorted_carriers();
        if let Some(w) = sorted.windows(2).find(|w| w[1] == w[0]) {
            return Err(ModemError::config(format!(
                "carrier {} Hz appears more than once",
                w[0]
            )));
        }

        let symbol_samples = seconds_to_samples(self.symbol_duration, self.sample_rate);
        if symbol_samples < 2 * self.num_carriers {
            return Err(ModemError::config(format!(
                "a {symbol_samples}-sample symbol cannot resolve {} carriers",
                self.num_carriers
            )));
        }

        Ok(())
    }

    /// `Some` when an adjacent carrier spacing is not an integer multiple of
    /// `1 / symbol_duration`.
    pub fn orthogonality_warning(&self) -> Option<ConfigWarning> {
        let symbol_rate_hz = 1.0 / self.symbol_duration;
        self.sorted_carriers().windows(2).find_map(|w| {
            let spacing_hz = w[1] - w[0];
            let cycles = spacing_hz * self.symbol_duration;
            let whole = cycles.round();
            let aligned =
                whole >= 1.0 && (cycles - whole).abs() <= ORTHOGONALITY_TOLERANCE * whole;
            (!aligned).then_some(ConfigWarning::NonOrthogonal {
                spacing_hz,
                symbol_rate_hz,
            })
        })
    }

    fn sorted_carriers(&self) -> Vec<f64> {
        let mut sorted = self.carrier_frequencies.clone();
        sorted.sort_by(f64::total_cmp);
        sorted
    }
}

/// Per-carrier cos/sin tables for one symbol period.
#[derive(Debug, Clone)]
struct FrameBasis {
    cos: Vec<Vec<f64>>,
    sin: Vec<Vec<f64>>,
}

impl FrameBasis {
    fn new(carriers: &[f64], len: usize, sample_rate: u32) -> Self {
        let fs = sample_rate as f64;
        let (cos, sin) = carriers
            .iter()
            .map(|&freq| {
                let w = 2.0 * PI * freq / fs;
                let cos: Vec<f64> = (0..len).map(|n| (w * n as f64).cos()).collect();
                let sin: Vec<f64> = (0..len).map(|n| (w * n as f64).sin()).collect();
                (cos, sin)
            })
            .unzip();
        Self { cos, sin }
    }

    fn carriers(&self) -> usize {
        self.cos.len()
    }

    /// Write `(1/N) Σ (I cos + Q sin)` into `out`.
    fn synthesize(&self, symbols: &[IQPoint], out: &mut [f32]) {
        let scale = 1.0 / self.carriers().max(1) as f64;
        for (n, slot) in out.iter_mut().enumerate() {
            let acc: f64 = symbols
                .iter()
                .zip(self.cos.iter().zip(&self.sin))
                .map(|(s, (c, q))| s.re * c[n] + s.im * q[n])
                .sum();
            *slot = (acc * scale) as f32;
        }
    }

    /// Rows are the cos columns followed by the sin columns.
    fn rows(&self) -> impl Iterator<Item = &Vec<f64>> {
        self.cos.iter().chain(self.sin.iter())
    }

    fn gram(&self) -> Vec<Vec<f64>> {
        let rows: Vec<&Vec<f64>> = self.rows().collect();
        rows.iter()
            .map(|a| {
                rows.iter()
                    .map(|b| a.iter().zip(b.iter()).map(|(x, y)| x * y).sum())
                    .collect()
            })
            .collect()
    }
}

/// Recovers the `(I, Q)` of every carrier from one symbol window.
enum Demodulator {
    /// Every carrier sits on its own bin of the frame-length FFT.
    Bins {
        bins: Vec<usize>,
        fft: Arc<dyn Fft<f64>>,
    },
    /// Correlator bank equalized by the inverse Gram matrix.
    LeastSquares {
        basis: FrameBasis,
        gram_inverse: Option<Vec<Vec<f64>>>,
        gram_diagonal: Vec<f64>,
    },
}

impl fmt::Debug for Demodulator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Demodulator::Bins { bins, .. } => f.debug_struct("Bins").field("bins", bins).finish(),
            Demodulator::LeastSquares { gram_inverse, .. } => f
                .debug_struct("LeastSquares")
                .field("singular", &gram_inverse.is_none())
                .finish_non_exhaustive(),
        }
    }
}

impl Demodulator {
    fn for_carriers(carriers: &[f64], len: usize, sample_rate: u32) -> Self {
        if let Some(bins) = aligned_bins(carriers, len, sample_rate) {
            let fft = FftPlanner::new().plan_fft_forward(len);
            return Demodulator::Bins { bins, fft };
        }

        let basis = FrameBasis::new(carriers, len, sample_rate);
        let gram = basis.gram();
        let gram_diagonal: Vec<f64> = gram.iter().enumerate().map(|(i, row)| row[i]).collect();
        let gram_inverse = mat_inverse(&gram);
        if gram_inverse.is_none() {
            tracing::debug!(carriers = carriers.len(), len, "carrier basis is singular");
        }
        Demodulator::LeastSquares {
            basis,
            gram_inverse,
            gram_diagonal,
        }
    }

    fn is_singular(&self) -> bool {
        matches!(
            self,
            Demodulator::LeastSquares {
                gram_inverse: None,
                ..
            }
        )
    }

    fn demodulate(&self, window: &[f64]) -> Vec<IQPoint> {
        match self {
            Demodulator::Bins { bins, fft } => {
                let mut spectrum: Vec<Complex64> =
                    window.iter().map(|&x| Complex64::new(x, 0.0)).collect();
                fft.process(&mut spectrum);
                let scale = 2.0 * bins.len() as f64 / window.len() as f64;
                bins.iter()
                    .map(|&k| IQPoint::new(scale * spectrum[k].re, -scale * spectrum[k].im))
                    .collect()
            }
            Demodulator::LeastSquares {
                basis,
                gram_inverse,
                gram_diagonal,
            } => {
                let n = basis.carriers();
                let correlations: Vec<f64> = basis
                    .rows()
                    .map(|row| row.iter().zip(window).map(|(b, x)| b * x).sum())
                    .collect();

                let coeffs: Vec<f64> = match gram_inverse {
                    Some(inverse) => inverse
                        .iter()
                        .map(|row| {
                            n as f64 * row.iter().zip(&correlations).map(|(g, r)| g * r).sum::<f64>()
                        })
                        .collect(),
                    None => correlations
                        .iter()
                        .zip(gram_diagonal)
                        .map(|(r, d)| if *d > 0.0 { n as f64 * r / d } else { 0.0 })
                        .collect(),
                };

                (0..n).map(|c| IQPoint::new(coeffs[c], coeffs[n + c])).collect()
            }
        }
    }
}

/// FFT bins of `carriers` for a `len`-point transform, if every carrier sits
/// on a distinct bin strictly between DC and Nyquist.
fn aligned_bins(carriers: &[f64], len: usize, sample_rate: u32) -> Option<Vec<usize>> {
    let mut bins = Vec::with_capacity(carriers.len());
    for &freq in carriers {
        let exact = freq * len as f64 / sample_rate as f64;
        let k = exact.round();
        if (exact - k).abs() > BIN_TOLERANCE || k < 1.0 || 2.0 * k >= len as f64 {
            return None;
        }
        bins.push(k as usize);
    }
    let mut unique = bins.clone();
    unique.sort_unstable();
    unique.dedup();
    (unique.len() == bins.len()).then_some(bins)
}

/// Gauss-Jordan inverse with partial pivoting; `None` when singular.
fn mat_inverse(a: &[Vec<f64>]) -> Option<Vec<Vec<f64>>> {
    let n = a.len();
    let scale = a
        .iter()
        .enumerate()
        .map(|(i, row)| row[i].abs())
        .fold(0.0, f64::max);
    if scale == 0.0 {
        return None;
    }

    // Augmented matrix [A | I]
    let mut aug: Vec<Vec<f64>> = a
        .iter()
        .enumerate()
        .map(|(i, row)| {
            let mut row = row.clone();
            row.resize(2 * n, 0.0);
            row[n + i] = 1.0;
            row
        })
        .collect();

    for col in 0..n {
        let (max_row, max_val) = (col..n)
            .map(|row| (row, aug[row][col].abs()))
            .fold((col, 0.0), |best, cand| if cand.1 > best.1 { cand } else { best });
        if max_val < SINGULAR_PIVOT * scale {
            return None;
        }
        aug.swap(col, max_row);

        let pivot = aug[col][col];
        aug[col].iter_mut().for_each(|v| *v /= pivot);
        let pivot_row = aug[col].clone();
        for (row, values) in aug.iter_mut().enumerate() {
            if row == col {
                continue;
            }
            let factor = values[col];
            if factor != 0.0 {
                values
                    .iter_mut()
                    .zip(&pivot_row)
                    .for_each(|(v, p)| *v -= factor * p);
            }
        }
    }

    Some(aug.into_iter().map(|row| row[n..].to_vec()).collect())
}

/// Result of [`MultiCarrierFrameCodec::decode`].
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DecodedFrames {
    /// Recovered payload, padding stripped when the length was known
    pub bits: BitStream,
    /// Equalized `(I, Q)` of every carrier of every frame
    pub symbols: Vec<IQPoint>,
    /// Demapping confidence per symbol, `0.0..=1.0`
    pub confidences: Vec<f64>,
    pub frames: usize,
    /// Trailing samples too short for a frame were ignored
    pub truncated: bool,
    pub issues: Vec<DecodeIssue>,
}

impl DecodedFrames {
    pub fn mean_confidence(&self) -> f64 {
        if self.confidences.is_empty() {
            return 0.0;
        }
        self.confidences.iter().sum::<f64>() / self.confidences.len() as f64
    }

    pub fn min_confidence(&self) -> f64 {
        self.confidences.iter().copied().reduce(f64::min).unwrap_or(0.0)
    }

    /// Bits packed into bytes, LSB first.
    pub fn bytes(&self) -> Vec<u8> {
        bits_to_bytes(&self.bits)
    }
}

/// Result of [`MultiCarrierFrameCodec::encode_cancellable`].
#[derive(Debug, Clone, PartialEq)]
pub struct CancellableEncode {
    /// Whole frames only
    pub waveform: Waveform,
    pub frames_completed: usize,
    pub frames_requested: usize,
    pub cancelled: bool,
}

/// Encodes bitstreams onto parallel carriers and back.
pub struct MultiCarrierFrameCodec {
    config: MultiCarrierConfig,
    mapper: ConstellationMapper,
    symbol_samples: usize,
    guard_samples: usize,
    basis: FrameBasis,
    demodulator: Arc<Demodulator>,
    warnings: Vec<ConfigWarning>,
    observer: SharedObserver,
}

impl fmt::Debug for MultiCarrierFrameCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MultiCarrierFrameCodec")
            .field("config", &self.config)
            .field("symbol_samples", &self.symbol_samples)
            .field("guard_samples", &self.guard_samples)
            .field("demodulator", &self.demodulator)
            .field("warnings", &self.warnings)
            .finish_non_exhaustive()
    }
}

impl MultiCarrierFrameCodec {
    /// Validate `config` and precompute the carrier tables.
    ///
    /// Fails with `NyquistViolation` for a carrier at or above `fs/2` and
    /// with `Config` for any other bad field. A non-orthogonal layout is
    /// accepted and reported through [`warnings`](Self::warnings) and the
    /// observer.
    pub fn new(config: MultiCarrierConfig) -> ModemResult<Self> {
        config.validate()?;

        let symbol_samples = seconds_to_samples(config.symbol_duration, config.sample_rate);
        let guard_samples = seconds_to_samples(config.guard_interval, config.sample_rate);
        let basis = FrameBasis::new(&config.carrier_frequencies, symbol_samples, config.sample_rate);
        let demodulator = Arc::new(Demodulator::for_carriers(
            &config.carrier_frequencies,
            symbol_samples,
            config.sample_rate,
        ));
        let warnings: Vec<ConfigWarning> = config.orthogonality_warning().into_iter().collect();

        tracing::debug!(
            carriers = config.num_carriers,
            modulation = %config.modulation,
            symbol_samples,
            guard_samples,
            demodulator = ?demodulator,
            "multi-carrier codec ready"
        );

        let codec = Self {
            mapper: ConstellationMapper::new(config.modulation),
            config,
            symbol_samples,
            guard_samples,
            basis,
            demodulator,
            warnings,
            observer: default_observer(),
        };
        codec.report_warnings();
        Ok(codec)
    }

    /// Route telemetry to `observer`. Construction warnings are replayed to it.
    pub fn with_observer(mut self, observer: SharedObserver) -> Self {
        self.observer = observer;
        self.report_warnings();
        self
    }

    pub fn config(&self) -> &MultiCarrierConfig {
        &self.config
    }

    /// Recoverable problems found at construction.
    pub fn warnings(&self) -> &[ConfigWarning] {
        &self.warnings
    }

    pub fn is_orthogonal(&self) -> bool {
        self.warnings.is_empty()
    }

    pub fn frame_capacity_bits(&self) -> usize {
        self.config.bits_per_frame()
    }

    /// Seconds per frame including the guard.
    pub fn frame_duration(&self) -> f64 {
        self.config.frame_duration()
    }

    /// Samples per frame including the guard.
    pub fn frame_samples(&self) -> usize {
        self.symbol_samples + self.guard_samples
    }

    pub fn symbol_samples(&self) -> usize {
        self.symbol_samples
    }

    pub fn guard_samples(&self) -> usize {
        self.guard_samples
    }

    pub fn occupied_bandwidth(&self) -> f64 {
        self.config.occupied_bandwidth()
    }

    pub fn theoretical_bitrate(&self) -> f64 {
        self.config.theoretical_bitrate()
    }

    /// Frames needed for `payload_bits` bits.
    pub fn frames_for(&self, payload_bits: usize) -> usize {
        payload_bits.div_ceil(self.frame_capacity_bits())
    }

    /// Encode `bits` (each `0` or `1`), zero-padding the last frame.
    pub fn encode(&self, bits: &[u8]) -> ModemResult<Waveform> {
        let symbols = self.map_frames(bits)?;
        let frames = symbols.len() / self.config.num_carriers;
        let samples = self.render(0..frames, &symbols);
        self.report_encoded(frames, samples.len());
        Ok(Waveform::new(samples, self.config.sample_rate))
    }

    /// Encode bytes, unpacked LSB first.
    pub fn encode_bytes(&self, data: &[u8]) -> ModemResult<Waveform> {
        self.encode(&bytes_to_bits(data))
    }

    /// Encode with frame `k` moved so its lowest carrier sits on
    /// `hopper.channel_at(start_hop + k)`.
    ///
    /// Every translated carrier is checked against Nyquist before any
    /// sample is rendered.
    pub fn encode_hopped(
        &self,
        bits: &[u8],
        hopper: &HopSequenceGenerator,
        start_hop: u64,
    ) -> ModemResult<Waveform> {
        let symbols = self.map_frames(bits)?;
        let n = self.config.num_carriers;
        let frames = symbols.len() / n;

        let carrier_sets = (0..frames)
            .map(|k| {
                let carriers = self.hopped_carriers(hopper, hop_for_frame(start_hop, k));
                self.check_translated(&carriers)?;
                Ok(carriers)
            })
            .collect::<ModemResult<Vec<_>>>()?;

        let ns = self.symbol_samples;
        let rate = self.config.sample_rate;
        let samples = parallel::render_blocks(0..frames, self.frame_samples(), |k, block| {
            FrameBasis::new(&carrier_sets[k], ns, rate)
                .synthesize(&symbols[k * n..(k + 1) * n], &mut block[..ns]);
        });

        tracing::debug!(frames, start_hop, "hopped frames rendered");
        self.report_encoded(frames, samples.len());
        Ok(Waveform::new(samples, rate))
    }

    /// Encode in batches of frames, checking `cancel` between batches.
    ///
    /// Once the flag is raised no further batch starts; the waveform holds
    /// only the frames completed so far.
    pub fn encode_cancellable(&self, bits: &[u8], cancel: &AtomicBool) -> ModemResult<CancellableEncode> {
        let symbols = self.map_frames(bits)?;
        let frames_requested = symbols.len() / self.config.num_carriers;

        let mut samples = Vec::with_capacity(frames_requested * self.frame_samples());
        let mut frames_completed = 0;
        for batch in parallel::batches(frames_requested, CANCEL_BATCH_FRAMES) {
            if cancel.load(Ordering::Acquire) {
                break;
            }
            frames_completed = batch.end;
            samples.extend(self.render(batch, &symbols));
        }

        let cancelled = frames_completed < frames_requested;
        if cancelled {
            self.observer.on_event(&ModemEvent::EncodeCancelled {
                frames_completed,
                frames_requested,
            });
        } else {
            self.report_encoded(frames_completed, samples.len());
        }

        Ok(CancellableEncode {
            waveform: Waveform::new(samples, self.config.sample_rate),
            frames_completed,
            frames_requested,
            cancelled,
        })
    }

    /// Decode every whole frame of `waveform`.
    ///
    /// With `payload_bits` the padding added by [`encode`](Self::encode) is
    /// stripped. Only an empty waveform is an error; everything else is
    /// reported in [`DecodedFrames::issues`].
    pub fn decode(&self, waveform: &Waveform, payload_bits: Option<usize>) -> ModemResult<DecodedFrames> {
        self.decode_frames(waveform, payload_bits, |frames| {
            Ok(vec![Arc::clone(&self.demodulator); frames])
        })
    }

    /// Decode and pack into `payload_len` bytes (or every whole byte).
    pub fn decode_bytes(&self, waveform: &Waveform, payload_len: Option<usize>) -> ModemResult<Vec<u8>> {
        let decoded = self.decode(waveform, payload_len.map(|n| n * 8))?;
        Ok(decoded.bytes())
    }

    /// Inverse of [`encode_hopped`](Self::encode_hopped).
    pub fn decode_hopped(
        &self,
        waveform: &Waveform,
        hopper: &HopSequenceGenerator,
        start_hop: u64,
        payload_bits: Option<usize>,
    ) -> ModemResult<DecodedFrames> {
        self.decode_frames(waveform, payload_bits, |frames| {
            let mut cache: HashMap<usize, Arc<Demodulator>> = HashMap::new();
            (0..frames)
                .map(|k| {
                    let hop = hop_for_frame(start_hop, k);
                    let channel = hopper.channel_index_at(hop);
                    if let Some(demod) = cache.get(&channel) {
                        return Ok(Arc::clone(demod));
                    }
                    let carriers = self.hopped_carriers(hopper, hop);
                    self.check_translated(&carriers)?;
                    let demod = Arc::new(Demodulator::for_carriers(
                        &carriers,
                        self.symbol_samples,
                        self.config.sample_rate,
                    ));
                    cache.insert(channel, Arc::clone(&demod));
                    Ok(demod)
                })
                .collect()
        })
    }

    fn decode_frames<P>(
        &self,
        waveform: &Waveform,
        payload_bits: Option<usize>,
        plan: P,
    ) -> ModemResult<DecodedFrames>
    where
        P: FnOnce(usize) -> ModemResult<Vec<Arc<Demodulator>>>,
    {
        if waveform.is_empty() {
            return Err(ModemError::EmptyWaveform);
        }

        let mut result = DecodedFrames::default();
        if waveform.sample_rate != self.config.sample_rate {
            result.issues.push(DecodeIssue::SampleRateMismatch {
                expected: self.config.sample_rate,
                actual: waveform.sample_rate,
            });
            self.report_decoded(&result);
            return Ok(result);
        }

        let frame_len = self.frame_samples();
        let ns = self.symbol_samples;
        let mut frames = waveform.len() / frame_len;
        let remainder = waveform.len() % frame_len;
        if remainder >= ns {
            // last guard cut short, symbol intact
            frames += 1;
        } else if remainder > 0 {
            result.truncated = true;
            result.issues.push(DecodeIssue::Truncated {
                samples: remainder,
                needed: ns,
            });
        }

        let demodulators = plan(frames)?;
        let per_frame: Vec<Vec<IQPoint>> = parallel::map_indexed(frames, |k| {
            let start = k * frame_len;
            let window: Vec<f64> = waveform.samples[start..start + ns]
                .iter()
                .map(|&s| s as f64)
                .collect();
            demodulators[k].demodulate(&window)
        });

        let singular = demodulators.iter().filter(|d| d.is_singular()).count();
        if singular > 0 {
            result.issues.push(DecodeIssue::SingularCarrierBasis { frames: singular });
        }

        let modulation = self.config.modulation;
        result.frames = frames;
        for point in per_frame.into_iter().flatten() {
            let demapped = self.mapper.demap(point);
            result.confidences.push(demapped.confidence(modulation));
            result.bits.extend_from_slice(&demapped.bits);
            result.symbols.push(point);
        }

        if let Some(requested) = payload_bits {
            if requested <= result.bits.len() {
                result.bits.truncate(requested);
            } else {
                result.issues.push(DecodeIssue::ShortPayload {
                    requested,
                    available: result.bits.len(),
                });
            }
        }

        self.report_decoded(&result);
        Ok(result)
    }

    /// Pad to whole frames and map every bit-group.
    fn map_frames(&self, bits: &[u8]) -> ModemResult<Vec<IQPoint>> {
        let capacity = self.frame_capacity_bits();
        let mut padded = bits.to_vec();
        padded.resize(self.frames_for(bits.len()) * capacity, 0);
        padded
            .chunks(self.mapper.bits_per_symbol())
            .map(|group| self.mapper.map(group))
            .collect()
    }

    fn render(&self, frames: Range<usize>, symbols: &[IQPoint]) -> Vec<f32> {
        let n = self.config.num_carriers;
        let ns = self.symbol_samples;
        parallel::render_blocks(frames, self.frame_samples(), |k, block| {
            self.basis
                .synthesize(&symbols[k * n..(k + 1) * n], &mut block[..ns]);
        })
    }

    fn hopped_carriers(&self, hopper: &HopSequenceGenerator, hop: u64) -> Vec<f64> {
        let offset = hopper.channel_at(hop) - self.config.lowest_carrier();
        self.config
            .carrier_frequencies
            .iter()
            .map(|f| f + offset)
            .collect()
    }

    fn check_translated(&self, carriers: &[f64]) -> ModemResult<()> {
        let highest = carriers.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        check_nyquist(highest, self.config.sample_rate)
    }

    fn report_warnings(&self) {
        for warning in &self.warnings {
            self.observer.on_event(&ModemEvent::ConfigWarning {
                layer: Layer::MultiCarrier,
                warning: warning.clone(),
            });
        }
    }

    fn report_encoded(&self, frames: usize, samples: usize) {
        self.observer.on_event(&ModemEvent::Encoded {
            layer: Layer::MultiCarrier,
            units: frames,
            samples,
        });
    }

    fn report_decoded(&self, result: &DecodedFrames) {
        self.observer.on_event(&ModemEvent::Decoded {
            layer: Layer::MultiCarrier,
            units: result.frames,
            mean_confidence: result.mean_confidence(),
            issues: result.issues.len(),
        });
    }
}

impl ModemCodec for MultiCarrierFrameCodec {
    fn info(&self) -> CodecInfo {
        CodecInfo {
            name: "multi-carrier",
            description: "parallel QAM carriers per frame with a silent guard",
            sample_rate: self.config.sample_rate,
            samples_per_unit: self.frame_samples(),
            band_hz: (self.config.lowest_carrier(), self.config.highest_carrier()),
        }
    }
}

#[inline]
fn hop_for_frame(start_hop: u64, frame: usize) -> u64 {
    start_hop.wrapping_add(frame as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::SecretKey;
    use crate::observe::RecordingObserver;
    use approx::assert_relative_eq;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn random_bits(count: usize, seed: u64) -> Vec<u8> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..count).map(|_| rng.gen_range(0..2u8)).collect()
    }

    /// 8 carriers spaced 1.5 symbol rates apart, off the FFT grid.
    fn off_grid_config() -> MultiCarrierConfig {
        MultiCarrierConfig::evenly_spaced(8, 5_000.0, 1_500.0).with_sample_rate(48_000)
    }

    #[test]
    fn test_round_trip_every_modulation() {
        for modulation in Modulation::ALL {
            let codec =
                MultiCarrierFrameCodec::new(MultiCarrierConfig::default().with_modulation(modulation)).unwrap();
            assert!(codec.is_orthogonal());
            let bits = random_bits(1000, 7);
            let wf = codec.encode(&bits).unwrap();
            assert_eq!(wf.len(), codec.frames_for(1000) * codec.frame_samples());

            let decoded = codec.decode(&wf, Some(bits.len())).unwrap();
            assert_eq!(decoded.bits, bits, "{modulation}");
            assert!(decoded.issues.is_empty());
            assert!(decoded.min_confidence() > 0.99, "{modulation}");
        }
    }

    #[test]
    fn test_round_trip_off_grid_carriers() {
        for modulation in Modulation::ALL {
            let codec =
                MultiCarrierFrameCodec::new(off_grid_config().with_modulation(modulation)).unwrap();
            assert!(!codec.is_orthogonal());
            let bits = random_bits(777, 11);
            let wf = codec.encode(&bits).unwrap();
            let decoded = codec.decode(&wf, Some(bits.len())).unwrap();
            assert_eq!(decoded.bits, bits, "{modulation}");
            assert!(decoded.min_confidence() > 0.95, "{modulation}");
        }
    }

    #[test]
    fn test_bytes_round_trip() {
        let codec = MultiCarrierFrameCodec::new(MultiCarrierConfig::default()).unwrap();
        let payload = b"ultrasonic payload".to_vec();
        let wf = codec.encode_bytes(&payload).unwrap();
        assert_eq!(codec.decode_bytes(&wf, Some(payload.len())).unwrap(), payload);
    }

    #[test]
    fn test_samples_stay_in_range_and_guard_is_silent() {
        let codec = MultiCarrierFrameCodec::new(
            MultiCarrierConfig::default().with_modulation(Modulation::Qam64),
        )
        .unwrap();
        let wf = codec.encode(&vec![1u8; 384 * 3]).unwrap();
        assert!(wf.peak() <= 1.0);
        let ns = codec.symbol_samples();
        let guard = wf.window(ns, codec.guard_samples());
        assert!(guard.iter().all(|&s| s == 0.0));
    }

    #[test]
    fn test_nyquist_carrier_rejected() {
        // last carrier lands exactly on fs/2
        let config = MultiCarrierConfig::evenly_spaced(4, 90_000.0, 2_000.0);
        match MultiCarrierFrameCodec::new(config) {
            Err(ModemError::NyquistViolation {
                frequency_hz,
                nyquist_hz,
            }) => {
                assert_eq!(frequency_hz, 96_000.0);
                assert_eq!(nyquist_hz, 96_000.0);
            }
            other => panic!("expected NyquistViolation, got {other:?}"),
        }
    }

    #[test]
    fn test_invalid_configs() {
        let mut mismatched = MultiCarrierConfig::default();
        mismatched.carrier_frequencies.pop();
        let mut duplicated = MultiCarrierConfig::evenly_spaced(4, 20_000.0, 1_000.0);
        duplicated.carrier_frequencies[3] = 20_000.0;

        for config in [
            MultiCarrierConfig::evenly_spaced(0, 20_000.0, 1_000.0),
            mismatched,
            duplicated,
            MultiCarrierConfig::default().with_timing(0.001, -0.1),
            MultiCarrierConfig::default().with_timing(0.0, 0.0),
            MultiCarrierConfig::evenly_spaced(4, -5.0, 1_000.0),
            MultiCarrierConfig::default().with_timing(0.0001, 0.0),
        ] {
            assert!(
                matches!(MultiCarrierFrameCodec::new(config.clone()), Err(ModemError::Config(_))),
                "{config:?}"
            );
        }
    }

    #[test]
    fn test_non_orthogonal_warning_reaches_observer() {
        let observer = Arc::new(RecordingObserver::new());
        let codec = MultiCarrierFrameCodec::new(MultiCarrierConfig::band(64, 25_000.0, 45_000.0))
            .unwrap()
            .with_observer(observer.clone());

        let expected = ConfigWarning::NonOrthogonal {
            spacing_hz: 312.5,
            symbol_rate_hz: 1000.0,
        };
        assert_eq!(codec.warnings(), &[expected.clone()]);
        assert_eq!(observer.warnings(), vec![expected]);
    }

    #[test]
    fn test_orthogonal_layout_has_no_warning() {
        let observer = Arc::new(RecordingObserver::new());
        let _codec = MultiCarrierFrameCodec::new(MultiCarrierConfig::evenly_spaced(16, 20_000.0, 2_000.0))
            .unwrap()
            .with_observer(observer.clone());
        assert!(observer.warnings().is_empty());
    }

    #[test]
    fn test_hopped_round_trip() {
        let key = SecretKey::derive(b"hopped frames");
        let hopper = HopSequenceGenerator::new(&key, 20_000.0, 40_000.0, 100.0).unwrap();
        let codec = MultiCarrierFrameCodec::new(
            MultiCarrierConfig::evenly_spaced(8, 1_000.0, 1_000.0).with_modulation(Modulation::Qam16),
        )
        .unwrap();

        let bits = random_bits(500, 3);
        let wf = codec.encode_hopped(&bits, &hopper, 5).unwrap();
        let decoded = codec.decode_hopped(&wf, &hopper, 5, Some(bits.len())).unwrap();
        assert_eq!(decoded.bits, bits);
        assert!(decoded.issues.is_empty());

        let wrong = codec.decode_hopped(&wf, &hopper, 6, Some(bits.len())).unwrap();
        assert_ne!(wrong.bits, bits);
    }

    #[test]
    fn test_hopped_frames_occupy_hop_channels() {
        let key = SecretKey::derive(b"sub-bands");
        let hopper = HopSequenceGenerator::new(&key, 20_000.0, 40_000.0, 1_000.0).unwrap();
        let codec = MultiCarrierFrameCodec::new(
            MultiCarrierConfig::evenly_spaced(1, 1_000.0, 1_000.0).with_modulation(Modulation::Bpsk),
        )
        .unwrap();
        let wf = codec.encode_hopped(&[1], &hopper, 0).unwrap();

        // single carrier, one frame: the tone sits on the first hop channel
        let ns = codec.symbol_samples();
        let window: Vec<f64> = wf.window(0, ns).iter().map(|&s| s as f64).collect();
        let peak = crate::analytic::dominant_frequency(&window, 192_000.0).unwrap();
        assert!((peak - hopper.channel_at(0)).abs() < 200.0, "peak {peak}");
    }

    #[test]
    fn test_hopped_nyquist_checked_before_synthesis() {
        let key = SecretKey::derive(b"too high");
        let hopper = HopSequenceGenerator::new(&key, 80_000.0, 95_000.0, 100.0).unwrap();
        let codec = MultiCarrierFrameCodec::new(MultiCarrierConfig::evenly_spaced(8, 1_000.0, 1_000.0)).unwrap();
        let bits = random_bits(16 * 200, 1);
        assert!(matches!(
            codec.encode_hopped(&bits, &hopper, 0),
            Err(ModemError::NyquistViolation { .. })
        ));
    }

    #[test]
    fn test_cancellation_returns_whole_frames() {
        let codec = MultiCarrierFrameCodec::new(MultiCarrierConfig::default()).unwrap();
        let bits = random_bits(128 * 40, 5);

        let cancel = AtomicBool::new(true);
        let stopped = codec.encode_cancellable(&bits, &cancel).unwrap();
        assert!(stopped.cancelled);
        assert_eq!(stopped.frames_completed, 0);
        assert_eq!(stopped.frames_requested, 40);
        assert!(stopped.waveform.is_empty());

        cancel.store(false, Ordering::Release);
        let full = codec.encode_cancellable(&bits, &cancel).unwrap();
        assert!(!full.cancelled);
        assert_eq!(full.frames_completed, 40);
        assert_eq!(full.waveform, codec.encode(&bits).unwrap());
        assert_eq!(full.waveform.len() % codec.frame_samples(), 0);
    }

    #[test]
    fn test_cancelled_prefix_decodes() {
        let codec = MultiCarrierFrameCodec::new(MultiCarrierConfig::default()).unwrap();
        let bits = random_bits(128 * 40, 9);
        let full = codec.encode(&bits).unwrap();

        // a cancelled encode is a frame-aligned prefix of the full one
        let prefix = Waveform::new(full.samples[..16 * codec.frame_samples()].to_vec(), full.sample_rate);
        let decoded = codec.decode(&prefix, None).unwrap();
        assert_eq!(decoded.frames, 16);
        assert_eq!(decoded.bits, bits[..16 * 128]);
    }

    #[test]
    fn test_truncated_waveform() {
        let codec = MultiCarrierFrameCodec::new(MultiCarrierConfig::default()).unwrap();
        let bits = random_bits(128 * 3, 2);
        let wf = codec.encode(&bits).unwrap();

        // missing guard only: the last symbol is intact
        let no_guard = Waveform::new(wf.samples[..wf.len() - codec.guard_samples()].to_vec(), wf.sample_rate);
        let decoded = codec.decode(&no_guard, Some(bits.len())).unwrap();
        assert_eq!(decoded.bits, bits);
        assert!(!decoded.truncated);

        // last symbol cut in half
        let cut = Waveform::new(wf.samples[..wf.len() - 150].to_vec(), wf.sample_rate);
        let decoded = codec.decode(&cut, Some(bits.len())).unwrap();
        assert!(decoded.truncated);
        assert_eq!(decoded.frames, 2);
        assert_eq!(decoded.bits, bits[..256]);
        assert!(decoded
            .issues
            .iter()
            .any(|i| matches!(i, DecodeIssue::ShortPayload { requested: 384, available: 256 })));
    }

    #[test]
    fn test_empty_and_mismatched_waveforms() {
        let codec = MultiCarrierFrameCodec::new(MultiCarrierConfig::default()).unwrap();
        assert!(matches!(
            codec.decode(&Waveform::empty(192_000), None),
            Err(ModemError::EmptyWaveform)
        ));

        let decoded = codec.decode(&Waveform::new(vec![0.1; 1000], 48_000), None).unwrap();
        assert!(decoded.bits.is_empty());
        assert_eq!(
            decoded.issues,
            vec![DecodeIssue::SampleRateMismatch {
                expected: 192_000,
                actual: 48_000
            }]
        );

        let short = codec.decode(&Waveform::new(vec![0.1; 50], 192_000), None).unwrap();
        assert_eq!(short.frames, 0);
        assert!(short.truncated);
    }

    #[test]
    fn test_non_binary_bits_rejected() {
        let codec = MultiCarrierFrameCodec::new(MultiCarrierConfig::default()).unwrap();
        assert!(matches!(codec.encode(&[0, 1, 2]), Err(ModemError::Modulation(_))));
    }

    #[test]
    fn test_scenario_bitrate() {
        let config = MultiCarrierConfig::default().with_modulation(Modulation::Qam64);
        assert_eq!(config.bits_per_frame(), 384);
        assert_relative_eq!(config.theoretical_bitrate(), 320_000.0, max_relative = 1e-12);
    }

    #[test]
    fn test_bitrate_grows_with_order() {
        let rates: Vec<f64> = Modulation::ALL
            .iter()
            .map(|&m| MultiCarrierConfig::default().with_modulation(m).theoretical_bitrate())
            .collect();
        assert!(rates.windows(2).all(|w| w[1] > w[0]));
    }

    #[test]
    fn test_band_layout() {
        let config = MultiCarrierConfig::band(64, 25_000.0, 45_000.0);
        assert_relative_eq!(config.carrier_frequencies[1] - config.carrier_frequencies[0], 312.5);
        assert_relative_eq!(config.occupied_bandwidth(), 63.0 * 312.5 + 1000.0);
    }

    #[test]
    fn test_mat_inverse() {
        let a = vec![vec![4.0, 7.0], vec![2.0, 6.0]];
        let inv = mat_inverse(&a).unwrap();
        assert_relative_eq!(inv[0][0], 0.6, epsilon = 1e-12);
        assert_relative_eq!(inv[0][1], -0.7, epsilon = 1e-12);
        assert_relative_eq!(inv[1][0], -0.2, epsilon = 1e-12);
        assert_relative_eq!(inv[1][1], 0.4, epsilon = 1e-12);

        assert!(mat_inverse(&[vec![1.0, 2.0], vec![2.0, 4.0]]).is_none());
    }
}
