//! # Observability
//!
//! The codecs never print. Everything they want to report goes through a
//! [`ModemObserver`] handed to them at construction, plus ordinary `tracing`
//! spans and events.
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │        MultiCarrierFrameCodec / FHSS codec    │
//! │   observer.on_event(..)     tracing::debug!() │
//! └──────────────┬──────────────────────┬─────────┘
//!                │                      │
//!                ▼                      ▼
//!      ┌──────────────────┐    ┌─────────────────┐
//!      │ ModemObserver     │    │ tracing-subscriber│
//!      │ Tracing/Recording │    │ (init_logging)    │
//!      └──────────────────┘    └─────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use ultramodem_core::observe::{init_logging, LogConfig, RecordingObserver};
//!
//! init_logging(&LogConfig::default());
//!
//! let observer = std::sync::Arc::new(RecordingObserver::new());
//! let codec = MultiCarrierFrameCodec::new(config)?.with_observer(observer.clone());
//! codec.encode(&bits)?;
//! for event in observer.events() {
//!     println!("{event}");
//! }
//! ```

pub mod logging;

pub use logging::{init_logging, LogConfig, LogFormat, LogLevel};

use crate::waveform::ConfigWarning;
use serde::Serialize;
use std::fmt;
use std::sync::{Arc, Mutex};

/// Which modem layer produced an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Layer {
    SpreadSpectrum,
    MultiCarrier,
}

impl fmt::Display for Layer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Layer::SpreadSpectrum => write!(f, "spread-spectrum"),
            Layer::MultiCarrier => write!(f, "multi-carrier"),
        }
    }
}

/// Telemetry emitted by the codecs.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ModemEvent {
    /// A recoverable configuration problem found at construction.
    ConfigWarning { layer: Layer, warning: ConfigWarning },
    /// An encode finished. `units` counts frames or dwell windows.
    Encoded {
        layer: Layer,
        units: usize,
        samples: usize,
    },
    /// A cancellable encode stopped early.
    EncodeCancelled {
        frames_completed: usize,
        frames_requested: usize,
    },
    /// A decode finished.
    Decoded {
        layer: Layer,
        units: usize,
        mean_confidence: f64,
        issues: usize,
    },
    /// A dwell window carried no usable energy.
    LowEnergyWindow { hop_index: u64, rms: f64 },
}

impl fmt::Display for ModemEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModemEvent::ConfigWarning { layer, warning } => write!(f, "[{layer}] warning: {warning}"),
            ModemEvent::Encoded {
                layer,
                units,
                samples,
            } => write!(f, "[{layer}] encoded {units} units into {samples} samples"),
            ModemEvent::EncodeCancelled {
                frames_completed,
                frames_requested,
            } => write!(f, "encode cancelled after {frames_completed}/{frames_requested} frames"),
            ModemEvent::Decoded {
                layer,
                units,
                mean_confidence,
                issues,
            } => write!(
                f,
                "[{layer}] decoded {units} units, mean confidence {mean_confidence:.3}, {issues} issues"
            ),
            ModemEvent::LowEnergyWindow { hop_index, rms } => {
                write!(f, "hop {hop_index}: window rms {rms:.2e} below energy floor")
            }
        }
    }
}

/// Receiver for codec telemetry.
///
/// Implementations must be cheap; they are called on the encode/decode path.
pub trait ModemObserver: Send + Sync {
    fn on_event(&self, event: &ModemEvent);
}

/// Forwards events to `tracing`. The default observer.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl ModemObserver for TracingObserver {
    fn on_event(&self, event: &ModemEvent) {
        match event {
            ModemEvent::ConfigWarning { layer, warning } => {
                tracing::warn!(%layer, %warning, "configuration warning");
            }
            ModemEvent::Encoded {
                layer,
                units,
                samples,
            } => {
                tracing::debug!(%layer, units, samples, "encode complete");
            }
            ModemEvent::EncodeCancelled {
                frames_completed,
                frames_requested,
            } => {
                tracing::info!(frames_completed, frames_requested, "encode cancelled");
            }
            ModemEvent::Decoded {
                layer,
                units,
                mean_confidence,
                issues,
            } => {
                tracing::debug!(%layer, units, mean_confidence, issues, "decode complete");
            }
            ModemEvent::LowEnergyWindow { hop_index, rms } => {
                tracing::debug!(hop_index, rms, "low energy dwell window");
            }
        }
    }
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullObserver;

impl ModemObserver for NullObserver {
    fn on_event(&self, _event: &ModemEvent) {}
}

/// Keeps every event in memory, in arrival order.
#[derive(Debug, Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<ModemEvent>>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the events seen so far.
    pub fn events(&self) -> Vec<ModemEvent> {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn warnings(&self) -> Vec<ConfigWarning> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                ModemEvent::ConfigWarning { warning, .. } => Some(warning),
                _ => None,
            })
            .collect()
    }

    pub fn clear(&self) {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clear();
    }
}

impl ModemObserver for RecordingObserver {
    fn on_event(&self, event: &ModemEvent) {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(event.clone());
    }
}

/// Shared observer handle stored by the codecs.
pub type SharedObserver = Arc<dyn ModemObserver>;

pub(crate) fn default_observer() -> SharedObserver {
    Arc::new(TracingObserver)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_observer_keeps_order() {
        let observer = RecordingObserver::new();
        observer.on_event(&ModemEvent::Encoded {
            layer: Layer::MultiCarrier,
            units: 3,
            samples: 3600,
        });
        observer.on_event(&ModemEvent::LowEnergyWindow {
            hop_index: 7,
            rms: 0.0,
        });
        let events = observer.events();
        assert_eq!(events.len(), 2);
        assert!(matches!(events[1], ModemEvent::LowEnergyWindow { hop_index: 7, .. }));

        observer.clear();
        assert!(observer.events().is_empty());
    }

    #[test]
    fn test_event_display() {
        let event = ModemEvent::EncodeCancelled {
            frames_completed: 4,
            frames_requested: 10,
        };
        assert_eq!(event.to_string(), "encode cancelled after 4/10 frames");
    }

    #[test]
    fn test_event_serializes_tagged() {
        let event = ModemEvent::Encoded {
            layer: Layer::SpreadSpectrum,
            units: 2,
            samples: 3840,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"event\":\"encoded\""));
        assert!(json.contains("\"layer\":\"spread_spectrum\""));
    }
}
