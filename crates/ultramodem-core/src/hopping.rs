//! Key-derived hop sequences
//!
//! The hop set is a fixed grid of carriers; the order in which a link visits
//! them is a permutation derived from the shared [`SecretKey`].
//!
//! ```text
//! key ─SHA256─► d₀ ─SHA256(d₀‖0)─► d₁ ─SHA256(d₁‖1)─► d₂ ...
//!                                  │                  │
//!                      u32(d₁[0..4]) mod 200  u32(d₂[0..4]) mod 199 ...
//!                                  ▼                  ▼
//!                          pick from remaining channels, in order
//! ```
//!
//! This is a hash-driven Fisher–Yates shuffle: the same key always gives the
//! same permutation, and the avalanche property of the digest decorrelates
//! permutations for distinct keys. No RNG is involved.

use crate::key::SecretKey;
use crate::types::{ModemError, ModemResult};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::sync::Arc;

/// Ordered carrier frequencies `[f_min + i * spacing]` for `i in 0..count`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChannelGrid {
    freq_min: f64,
    freq_max: f64,
    spacing: f64,
    channels: Vec<f64>,
}

impl ChannelGrid {
    pub fn new(freq_min: f64, freq_max: f64, spacing: f64) -> ModemResult<Self> {
        if !freq_min.is_finite() || !freq_max.is_finite() || !spacing.is_finite() {
            return Err(ModemError::config("hop range and spacing must be finite"));
        }
        if freq_min < 0.0 {
            return Err(ModemError::config(format!(
                "hop range must start at a non-negative frequency, got {freq_min} Hz"
            )));
        }
        if freq_min >= freq_max {
            return Err(ModemError::config(format!(
                "hop range minimum {freq_min} Hz must be below maximum {freq_max} Hz"
            )));
        }
        if spacing <= 0.0 {
            return Err(ModemError::config(format!(
                "hop spacing must be positive, got {spacing} Hz"
            )));
        }

        let count = ((freq_max - freq_min) / spacing).floor() as usize;
        if count == 0 {
            return Err(ModemError::config(format!(
                "hop range {freq_min}..{freq_max} Hz holds no {spacing} Hz channel"
            )));
        }

        let channels = (0..count).map(|i| freq_min + i as f64 * spacing).collect();
        Ok(Self {
            freq_min,
            freq_max,
            spacing,
            channels,
        })
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Frequency of grid channel `index`.
    pub fn frequency(&self, index: usize) -> Option<f64> {
        self.channels.get(index).copied()
    }

    pub fn frequencies(&self) -> &[f64] {
        &self.channels
    }

    pub fn spacing(&self) -> f64 {
        self.spacing
    }

    pub fn freq_min(&self) -> f64 {
        self.freq_min
    }

    pub fn freq_max(&self) -> f64 {
        self.freq_max
    }

    /// Highest carrier actually on the grid.
    pub fn highest(&self) -> f64 {
        self.channels.last().copied().unwrap_or(self.freq_min)
    }

    /// Width of the hop band, `f_max - f_min`.
    pub fn bandwidth(&self) -> f64 {
        self.freq_max - self.freq_min
    }
}

/// Keyed permutation of a [`ChannelGrid`].
///
/// Immutable after construction and cheap to clone; clones share the
/// sequence buffers.
#[derive(Debug, Clone)]
pub struct HopSequenceGenerator {
    grid: Arc<ChannelGrid>,
    order: Arc<[usize]>,
    sequence: Arc<[f64]>,
}

impl HopSequenceGenerator {
    /// Build the grid and derive its permutation from `key`.
    pub fn new(key: &SecretKey, freq_min: f64, freq_max: f64, spacing: f64) -> ModemResult<Self> {
        let grid = ChannelGrid::new(freq_min, freq_max, spacing)?;
        Ok(Self::with_grid(key, grid))
    }

    /// Derive the permutation of an existing grid.
    pub fn with_grid(key: &SecretKey, grid: ChannelGrid) -> Self {
        let order = keyed_permutation(key.as_bytes(), grid.len());
        let sequence: Vec<f64> = order.iter().map(|&i| grid.channels[i]).collect();

        tracing::debug!(
            channels = grid.len(),
            freq_min = grid.freq_min,
            freq_max = grid.freq_max,
            spacing = grid.spacing,
            "hop sequence derived"
        );

        Self {
            grid: Arc::new(grid),
            order: order.into(),
            sequence: sequence.into(),
        }
    }

    /// `floor((freq_max - freq_min) / spacing)`
    pub fn channel_count(&self) -> usize {
        self.order.len()
    }

    /// The full permutation as carrier frequencies.
    pub fn sequence(&self) -> &[f64] {
        &self.sequence
    }

    /// The full permutation as grid indices.
    pub fn index_sequence(&self) -> &[usize] {
        &self.order
    }

    /// Carrier for `hop_index`, wrapping modulo the channel count.
    #[inline]
    pub fn channel_at(&self, hop_index: u64) -> f64 {
        self.sequence[self.position(hop_index)]
    }

    /// Grid index for `hop_index`, wrapping modulo the channel count.
    #[inline]
    pub fn channel_index_at(&self, hop_index: u64) -> usize {
        self.order[self.position(hop_index)]
    }

    pub fn grid(&self) -> &ChannelGrid {
        &self.grid
    }

    #[inline]
    fn position(&self, hop_index: u64) -> usize {
        (hop_index % self.order.len() as u64) as usize
    }
}

/// Hash-driven shuffle of `0..count`.
fn keyed_permutation(key: &[u8], count: usize) -> Vec<usize> {
    let mut digest: [u8; 32] = Sha256::digest(key).into();
    let mut remaining: Vec<usize> = (0..count).collect();
    let mut order = Vec::with_capacity(count);

    for i in 0..count {
        let mut hasher = Sha256::new();
        hasher.update(digest);
        hasher.update(minimal_be_bytes(i as u64));
        digest = hasher.finalize().into();

        let draw = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
        let idx = draw as usize % remaining.len();
        order.push(remaining.remove(idx));
    }

    order
}

/// Big-endian bytes of `value` without leading zeros; zero encodes as `[0]`.
fn minimal_be_bytes(value: u64) -> Vec<u8> {
    let bytes = value.to_be_bytes();
    let first = bytes.iter().position(|&b| b != 0).unwrap_or(bytes.len() - 1);
    bytes[first..].to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn scenario_key() -> SecretKey {
        SecretKey::derive(b"test")
    }

    #[test]
    fn test_scenario_channel_count() {
        let gen = HopSequenceGenerator::new(&scenario_key(), 20_000.0, 40_000.0, 100.0).unwrap();
        assert_eq!(gen.channel_count(), 200);

        let again = HopSequenceGenerator::new(&scenario_key(), 20_000.0, 40_000.0, 100.0).unwrap();
        assert_eq!(gen.channel_at(0), again.channel_at(0));
    }

    #[test]
    fn test_inverted_range_rejected() {
        let result = HopSequenceGenerator::new(&scenario_key(), 100.0, 50.0, 10.0);
        assert!(matches!(result, Err(ModemError::Config(_))));
    }

    #[test]
    fn test_bad_spacing_rejected() {
        for spacing in [0.0, -5.0, f64::NAN] {
            let result = HopSequenceGenerator::new(&scenario_key(), 100.0, 500.0, spacing);
            assert!(matches!(result, Err(ModemError::Config(_))), "spacing {spacing}");
        }
    }

    #[test]
    fn test_empty_grid_rejected() {
        let result = HopSequenceGenerator::new(&scenario_key(), 100.0, 150.0, 100.0);
        assert!(matches!(result, Err(ModemError::Config(_))));
    }

    #[test]
    fn test_permutation_is_bijection() {
        let gen = HopSequenceGenerator::new(&scenario_key(), 20_000.0, 40_000.0, 100.0).unwrap();
        let indices: HashSet<usize> = gen.index_sequence().iter().copied().collect();
        assert_eq!(indices.len(), gen.channel_count());
        assert!(indices.iter().all(|&i| i < gen.channel_count()));

        let mut freqs = gen.sequence().to_vec();
        freqs.sort_by(|a, b| a.partial_cmp(b).unwrap());
        assert_eq!(freqs, gen.grid().frequencies());
    }

    #[test]
    fn test_deterministic_for_same_key() {
        for n in 0..20u8 {
            let key = SecretKey::derive(&[n; 5]);
            let a = HopSequenceGenerator::new(&key, 20_000.0, 40_000.0, 100.0).unwrap();
            let b = HopSequenceGenerator::new(&key, 20_000.0, 40_000.0, 100.0).unwrap();
            assert_eq!(a.sequence(), b.sequence());
        }
    }

    #[test]
    fn test_distinct_keys_decorrelate() {
        for _ in 0..200 {
            let k1 = SecretKey::generate();
            let k2 = SecretKey::generate();
            let a = HopSequenceGenerator::new(&k1, 20_000.0, 40_000.0, 100.0).unwrap();
            let b = HopSequenceGenerator::new(&k2, 20_000.0, 40_000.0, 100.0).unwrap();
            assert_ne!(a.sequence(), b.sequence());
        }
    }

    #[test]
    fn test_wraparound() {
        let gen = HopSequenceGenerator::new(&scenario_key(), 1_000.0, 2_000.0, 100.0).unwrap();
        let count = gen.channel_count() as u64;
        for hop in [0u64, 3, 9, 10, 11, 57, 1_000_003] {
            assert_eq!(gen.channel_at(hop), gen.channel_at(hop % count));
            assert_eq!(gen.channel_index_at(hop), gen.channel_index_at(hop % count));
        }
    }

    #[test]
    fn test_not_identity_order() {
        let gen = HopSequenceGenerator::new(&scenario_key(), 20_000.0, 40_000.0, 100.0).unwrap();
        assert_ne!(gen.sequence(), gen.grid().frequencies());
    }

    #[test]
    fn test_minimal_be_bytes() {
        assert_eq!(minimal_be_bytes(0), vec![0]);
        assert_eq!(minimal_be_bytes(7), vec![7]);
        assert_eq!(minimal_be_bytes(255), vec![255]);
        assert_eq!(minimal_be_bytes(256), vec![1, 0]);
    }

    #[test]
    fn test_large_grid_beyond_one_byte_index() {
        let gen = HopSequenceGenerator::new(&scenario_key(), 20_000.0, 40_000.0, 10.0).unwrap();
        assert_eq!(gen.channel_count(), 2000);
        let unique: HashSet<usize> = gen.index_sequence().iter().copied().collect();
        assert_eq!(unique.len(), 2000);
    }
}
