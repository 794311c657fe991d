//! # Ultrasonic Modem Core
//!
//! This crate moves digital payloads through a narrow acoustic band as an
//! audio waveform, using two layered techniques:
//!
//! - **Keyed frequency hopping**: a secret key selects a pseudorandom
//!   permutation of carrier channels; semantic symbols ride each carrier as
//!   sinusoidal FM for one dwell.
//! - **Multi-carrier QAM**: bitstreams are mapped onto many parallel carriers
//!   per frame (OFDM style) with a silent guard between frames.
//!
//! ## Signal Flow
//!
//! ```text
//! key → SHA-256 chain → hop sequence ─────────────┐
//!                                                  ▼
//! TX: bytes → bits → constellation → carriers → frames → waveform → sink
//! RX: waveform → frame windows → FFT bins / least squares → demap → bits → bytes
//!
//! TX: (value, amplitude, phase) → FM on hop carrier → dwell → waveform
//! RX: dwell → analytic signal → inst. frequency → f_m → correlation → symbol
//! ```
//!
//! ## Example
//!
//! ```rust,no_run
//! use ultramodem_core::prelude::*;
//!
//! let key = SecretKey::derive(b"shared secret");
//! let session = ModemSession::new(key, &ModemConfig::default()).unwrap();
//!
//! let sent = session.transmit_bytes(b"Hello ultrasound!").unwrap();
//! println!("{}", sent.stats);
//!
//! let data = session.receive_bytes(&sent.waveform, Some(17)).unwrap();
//! assert_eq!(data, b"Hello ultrasound!");
//! ```

pub mod analysis;
pub mod analytic;
pub mod config;
pub mod constellation;
pub mod hopping;
pub mod key;
pub mod observe;
pub mod parallel;
pub mod session;
pub mod sink;
pub mod types;
pub mod waveform;

// Re-export main types
pub use analysis::{TransmissionAnalyzer, TransmissionStats};
pub use config::ModemConfig;
pub use constellation::{ConstellationMapper, Modulation};
pub use hopping::{ChannelGrid, HopSequenceGenerator};
pub use key::{export_key, import_key, SecretKey};
pub use session::{ModemSession, Transmission};
pub use types::{bits_to_bytes, bytes_to_bits, BitStream, IQPoint, ModemError, ModemResult, Waveform};
pub use waveform::{
    ConfigWarning, DecodeIssue, MultiCarrierConfig, MultiCarrierFrameCodec, SemanticSymbol,
    SpreadSpectrumConfig, SpreadSpectrumSymbolCodec,
};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::analysis::{TransmissionAnalyzer, TransmissionStats};
    pub use crate::config::ModemConfig;
    pub use crate::constellation::Modulation;
    pub use crate::hopping::HopSequenceGenerator;
    pub use crate::key::SecretKey;
    pub use crate::observe::{init_logging, LogConfig, ModemObserver};
    pub use crate::session::ModemSession;
    pub use crate::sink::{AudioSink, WavSink};
    pub use crate::types::{ModemError, ModemResult, Waveform};
    pub use crate::waveform::{
        MultiCarrierConfig, MultiCarrierFrameCodec, SemanticSymbol, SpreadSpectrumConfig,
        SpreadSpectrumSymbolCodec,
    };
}
