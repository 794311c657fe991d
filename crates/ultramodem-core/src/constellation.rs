//! Constellation mapping for the multi-carrier layer
//!
//! Each modulation order has a fixed table from bit-group index to a point in
//! the I/Q plane. The index is read from the bit-group least-significant bit
//! first, so `[1, 0]` is index 1 and `[0, 1]` is index 2.
//!
//! ```text
//!   BPSK            QPSK               16-QAM (÷ 3√2)
//!                    1 │ 0             12 13 14 15
//!  0 ●───┼───● 1   ────┼────            8  9 10 11
//!                    2 │ 3              4  5  6  7
//!                                       0  1  2  3
//! ```
//!
//! Square QAM grids are scaled so the corner point has unit norm, keeping
//! every point inside `[-1, 1]²`.

use crate::types::{IQPoint, ModemError, ModemResult};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

/// Supported modulation orders
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Modulation {
    #[serde(rename = "BPSK")]
    Bpsk,
    #[serde(rename = "QPSK")]
    Qpsk,
    #[serde(rename = "16QAM")]
    Qam16,
    #[serde(rename = "64QAM")]
    Qam64,
}

impl Modulation {
    pub const ALL: [Modulation; 4] = [
        Modulation::Bpsk,
        Modulation::Qpsk,
        Modulation::Qam16,
        Modulation::Qam64,
    ];

    /// Bits carried by one symbol
    pub fn bits_per_symbol(&self) -> usize {
        match self {
            Self::Bpsk => 1,
            Self::Qpsk => 2,
            Self::Qam16 => 4,
            Self::Qam64 => 6,
        }
    }

    /// Number of constellation points
    pub fn order(&self) -> usize {
        1 << self.bits_per_symbol()
    }

    /// Look up by constellation size (2, 4, 16 or 64).
    pub fn from_order(order: usize) -> ModemResult<Self> {
        match order {
            2 => Ok(Self::Bpsk),
            4 => Ok(Self::Qpsk),
            16 => Ok(Self::Qam16),
            64 => Ok(Self::Qam64),
            other => Err(ModemError::Modulation(format!(
                "unsupported modulation order {other}; expected 2, 4, 16 or 64"
            ))),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Bpsk => "BPSK",
            Self::Qpsk => "QPSK",
            Self::Qam16 => "16QAM",
            Self::Qam64 => "64QAM",
        }
    }

    /// The point table for this order, built once and shared.
    pub fn points(&self) -> &'static [IQPoint] {
        static BPSK: OnceLock<Vec<IQPoint>> = OnceLock::new();
        static QPSK: OnceLock<Vec<IQPoint>> = OnceLock::new();
        static QAM16: OnceLock<Vec<IQPoint>> = OnceLock::new();
        static QAM64: OnceLock<Vec<IQPoint>> = OnceLock::new();

        match self {
            Self::Bpsk => BPSK
                .get_or_init(|| vec![IQPoint::new(-1.0, 0.0), IQPoint::new(1.0, 0.0)])
                .as_slice(),
            Self::Qpsk => QPSK.get_or_init(|| {
                [45.0f64, 135.0, 225.0, 315.0]
                    .iter()
                    .map(|deg| {
                        let a = deg * PI / 180.0;
                        IQPoint::new(a.cos(), a.sin())
                    })
                    .collect()
            })
            .as_slice(),
            Self::Qam16 => QAM16.get_or_init(|| square_grid(4)).as_slice(),
            Self::Qam64 => QAM64.get_or_init(|| square_grid(8)).as_slice(),
        }
    }

    /// Smallest distance between two distinct points.
    pub fn min_distance(&self) -> f64 {
        match self {
            Self::Bpsk => 2.0,
            Self::Qpsk => 2.0_f64.sqrt(),
            Self::Qam16 => 2.0 / (3.0 * 2.0_f64.sqrt()),
            Self::Qam64 => 2.0 / (7.0 * 2.0_f64.sqrt()),
        }
    }
}

impl fmt::Display for Modulation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Modulation {
    type Err = ModemError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "BPSK" => Ok(Self::Bpsk),
            "QPSK" => Ok(Self::Qpsk),
            "16QAM" | "QAM16" => Ok(Self::Qam16),
            "64QAM" | "QAM64" => Ok(Self::Qam64),
            _ => Err(ModemError::config(format!("unsupported modulation name '{s}'"))),
        }
    }
}

/// `side × side` grid, `I = level[k % side]`, `Q = level[k / side]`.
fn square_grid(side: usize) -> Vec<IQPoint> {
    let max_level = (side - 1) as f64;
    let scale = 1.0 / (max_level * 2.0_f64.sqrt());
    let level = |i: usize| (2.0 * i as f64 - max_level) * scale;
    (0..side * side)
        .map(|k| IQPoint::new(level(k % side), level(k / side)))
        .collect()
}

/// Outcome of nearest-point classification
#[derive(Debug, Clone, PartialEq)]
pub struct Demapped {
    /// Recovered bit-group, LSB first
    pub bits: Vec<u8>,
    /// Table index of the chosen point
    pub index: usize,
    /// Euclidean distance from the observation to the chosen point
    pub distance: f64,
}

impl Demapped {
    /// 1.0 on the point, falling to 0.0 at the decision boundary.
    pub fn confidence(&self, modulation: Modulation) -> f64 {
        let half = modulation.min_distance() / 2.0;
        (1.0 - self.distance / half).clamp(0.0, 1.0)
    }
}

/// Maps bit-groups to constellation points and back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConstellationMapper {
    modulation: Modulation,
}

impl ConstellationMapper {
    pub fn new(modulation: Modulation) -> Self {
        Self { modulation }
    }

    /// Mapper for a constellation size; fails for unsupported orders.
    pub fn for_order(order: usize) -> ModemResult<Self> {
        Modulation::from_order(order).map(Self::new)
    }

    pub fn modulation(&self) -> Modulation {
        self.modulation
    }

    pub fn bits_per_symbol(&self) -> usize {
        self.modulation.bits_per_symbol()
    }

    /// Map exactly `bits_per_symbol` bits to a point.
    pub fn map(&self, bits: &[u8]) -> ModemResult<IQPoint> {
        let index = self.group_index(bits)?;
        Ok(self.modulation.points()[index])
    }

    /// Map a table index directly.
    #[inline]
    pub fn map_index(&self, index: usize) -> IQPoint {
        let points = self.modulation.points();
        points[index % points.len()]
    }

    /// Nearest-point classification of a (possibly noisy) observation.
    pub fn demap(&self, point: IQPoint) -> Demapped {
        let (index, distance) = self
            .modulation
            .points()
            .iter()
            .enumerate()
            .map(|(i, p)| (i, (point - p).norm()))
            .fold((0, f64::INFINITY), |best, cand| if cand.1 < best.1 { cand } else { best });

        let bits = (0..self.bits_per_symbol())
            .map(|b| ((index >> b) & 1) as u8)
            .collect();

        Demapped {
            bits,
            index,
            distance,
        }
    }

    /// Bit-group to table index, LSB first.
    pub fn group_index(&self, bits: &[u8]) -> ModemResult<usize> {
        let width = self.bits_per_symbol();
        if bits.len() != width {
            return Err(ModemError::Modulation(format!(
                "{} expects {} bits per symbol, got {}",
                self.modulation,
                width,
                bits.len()
            )));
        }
        bits.iter().enumerate().try_fold(0usize, |acc, (i, &bit)| match bit {
            0 | 1 => Ok(acc | ((bit as usize) << i)),
            other => Err(ModemError::Modulation(format!(
                "bit values must be 0 or 1, got {other}"
            ))),
        })
    }
}

/// Map `bits` for a constellation of size `modulation_order`.
pub fn map(modulation_order: usize, bits: &[u8]) -> ModemResult<IQPoint> {
    ConstellationMapper::for_order(modulation_order)?.map(bits)
}

/// Demap an observation for a constellation of size `modulation_order`.
pub fn demap(modulation_order: usize, point: IQPoint) -> ModemResult<Demapped> {
    Ok(ConstellationMapper::for_order(modulation_order)?.demap(point))
}
