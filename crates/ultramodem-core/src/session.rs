//! Modem session
//!
//! A [`ModemSession`] owns everything one end of a link needs: the shared
//! key, the hop sequence derived from it, and both codecs built from one
//! [`ModemConfig`]. Two sessions built from the same config and key can
//! talk to each other.
//!
//! ```rust
//! use ultramodem_core::config::ModemConfig;
//! use ultramodem_core::session::ModemSession;
//!
//! let tx = ModemSession::from_config(&ModemConfig::default()).unwrap();
//! let rx = ModemSession::with_key_hex(&ModemConfig::default(), &tx.export_key()).unwrap();
//!
//! let sent = tx.transmit_bytes(b"ping").unwrap();
//! assert_eq!(rx.receive_bytes(&sent.waveform, Some(4)).unwrap(), b"ping");
//! ```

use crate::analysis::{TransmissionAnalyzer, TransmissionStats};
use crate::config::ModemConfig;
use crate::hopping::HopSequenceGenerator;
use crate::key::SecretKey;
use crate::observe::SharedObserver;
use crate::sink::AudioSink;
use crate::types::{bytes_to_bits, ModemResult, Waveform};
use crate::waveform::{
    DecodedFrames, DecodedMessage, MessageMetadata, MultiCarrierFrameCodec, SemanticSymbol,
    SpreadSpectrumSymbolCodec,
};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;

/// A rendered byte payload and its accounting.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Transmission {
    pub waveform: Waveform,
    pub frames: usize,
    pub stats: TransmissionStats,
}

/// Key, hop sequence and both codecs of one link end.
pub struct ModemSession {
    key: SecretKey,
    hopper: Arc<HopSequenceGenerator>,
    spread_spectrum: SpreadSpectrumSymbolCodec,
    multicarrier: MultiCarrierFrameCodec,
}

impl fmt::Debug for ModemSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModemSession")
            .field("key", &self.key)
            .field("channels", &self.hopper.channel_count())
            .field("multicarrier", &self.multicarrier)
            .finish_non_exhaustive()
    }
}

impl ModemSession {
    /// Validate `config` and use its key, generating one if it has none.
    pub fn from_config(config: &ModemConfig) -> ModemResult<Self> {
        config.validate()?;
        Self::new(config.secret_key()?, config)
    }

    /// Build with a key received as hex from the other end.
    pub fn with_key_hex(config: &ModemConfig, hex_key: &str) -> ModemResult<Self> {
        config.validate()?;
        Self::new(SecretKey::import_hex(hex_key)?, config)
    }

    /// Build with an explicit key, ignoring `config.secret_key`.
    pub fn new(key: SecretKey, config: &ModemConfig) -> ModemResult<Self> {
        let (freq_min, freq_max) = config.hopping.hop_range;
        let hopper = Arc::new(HopSequenceGenerator::new(
            &key,
            freq_min,
            freq_max,
            config.hopping.hop_spacing_hz,
        )?);
        let spread_spectrum =
            SpreadSpectrumSymbolCodec::new(Arc::clone(&hopper), config.to_spread_spectrum_config())?;
        let multicarrier = MultiCarrierFrameCodec::new(config.to_multicarrier_config())?;

        tracing::info!(
            channels = hopper.channel_count(),
            carriers = config.multicarrier.num_carriers,
            modulation = %config.multicarrier.modulation,
            sample_rate = config.sample_rate,
            "modem session ready"
        );

        Ok(Self {
            key,
            hopper,
            spread_spectrum,
            multicarrier,
        })
    }

    /// Route telemetry of both codecs to `observer`.
    pub fn with_observer(self, observer: SharedObserver) -> Self {
        Self {
            spread_spectrum: self.spread_spectrum.with_observer(Arc::clone(&observer)),
            multicarrier: self.multicarrier.with_observer(observer),
            ..self
        }
    }

    /// Hex form of the key, for the cooperating decoder.
    pub fn export_key(&self) -> String {
        self.key.export_hex()
    }

    pub fn key(&self) -> &SecretKey {
        &self.key
    }

    pub fn hopper(&self) -> &HopSequenceGenerator {
        &self.hopper
    }

    pub fn spread_spectrum(&self) -> &SpreadSpectrumSymbolCodec {
        &self.spread_spectrum
    }

    pub fn multicarrier(&self) -> &MultiCarrierFrameCodec {
        &self.multicarrier
    }

    /// Encode bytes on the fixed multi-carrier layout.
    pub fn transmit_bytes(&self, data: &[u8]) -> ModemResult<Transmission> {
        let waveform = self.multicarrier.encode_bytes(data)?;
        self.account(data.len() * 8, waveform)
    }

    /// Decode bytes from the fixed multi-carrier layout.
    pub fn receive_bytes(&self, waveform: &Waveform, payload_len: Option<usize>) -> ModemResult<Vec<u8>> {
        self.multicarrier.decode_bytes(waveform, payload_len)
    }

    /// Encode bytes with every frame moved to the next hop channel.
    pub fn transmit_hopped(&self, data: &[u8], start_hop: u64) -> ModemResult<Transmission> {
        let waveform = self
            .multicarrier
            .encode_hopped(&bytes_to_bits(data), &self.hopper, start_hop)?;
        self.account(data.len() * 8, waveform)
    }

    /// Inverse of [`transmit_hopped`](Self::transmit_hopped).
    pub fn receive_hopped(
        &self,
        waveform: &Waveform,
        start_hop: u64,
        payload_len: Option<usize>,
    ) -> ModemResult<DecodedFrames> {
        self.multicarrier
            .decode_hopped(waveform, &self.hopper, start_hop, payload_len.map(|n| n * 8))
    }

    /// Encode semantic symbols, one hop per symbol.
    pub fn transmit_symbols(
        &self,
        symbols: &[SemanticSymbol],
        start_hop: u64,
    ) -> ModemResult<(Waveform, MessageMetadata)> {
        self.spread_spectrum.encode_message(symbols, start_hop)
    }

    pub fn receive_symbols(&self, waveform: &Waveform, start_hop: u64) -> ModemResult<DecodedMessage> {
        self.spread_spectrum.decode_message(waveform, start_hop)
    }

    /// Encode bytes and hand the waveform to `sink`.
    pub fn transmit_to(&self, sink: &mut dyn AudioSink, data: &[u8]) -> ModemResult<TransmissionStats> {
        let transmission = self.transmit_bytes(data)?;
        sink.write(&transmission.waveform)?;
        Ok(transmission.stats)
    }

    fn account(&self, payload_bits: usize, waveform: Waveform) -> ModemResult<Transmission> {
        let config = self.multicarrier.config();
        let stats = TransmissionAnalyzer::for_multicarrier(config, payload_bits)?;
        tracing::debug!(
            bits = payload_bits,
            bitrate_bps = stats.bitrate_bps,
            efficiency = stats.spectral_efficiency_bits_per_hz,
            "transmission rendered"
        );
        Ok(Transmission {
            frames: self.multicarrier.frames_for(payload_bits),
            waveform,
            stats,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constellation::Modulation;
    use crate::observe::RecordingObserver;
    use crate::sink::MemorySink;
    use crate::types::ModemError;

    fn config() -> ModemConfig {
        let mut config = ModemConfig::default();
        config.secret_key = Some(SecretKey::derive(b"test").export_hex());
        config
    }

    fn narrow_config() -> ModemConfig {
        let mut config = config();
        config.multicarrier.num_carriers = 8;
        config.multicarrier.modulation = Modulation::Qam16;
        config
    }

    #[test]
    fn test_peers_share_hop_sequence() {
        let tx = ModemSession::from_config(&config()).unwrap();
        let rx = ModemSession::with_key_hex(&ModemConfig::default(), &tx.export_key()).unwrap();
        assert_eq!(tx.hopper().sequence(), rx.hopper().sequence());
        assert_eq!(tx.hopper().channel_count(), 200);
    }

    #[test]
    fn test_generated_key_when_unconfigured() {
        let a = ModemSession::from_config(&ModemConfig::default()).unwrap();
        let b = ModemSession::from_config(&ModemConfig::default()).unwrap();
        assert_ne!(a.export_key(), b.export_key());
    }

    #[test]
    fn test_bytes_round_trip_with_stats() {
        let session = ModemSession::from_config(&config()).unwrap();
        let payload = b"multi-carrier payload".to_vec();
        let sent = session.transmit_bytes(&payload).unwrap();

        // 168 bits over 128-bit QPSK frames
        assert_eq!(sent.frames, 2);
        assert_eq!(sent.stats.raw_bits, 168);
        assert_eq!(sent.waveform.len(), 2 * session.multicarrier().frame_samples());
        assert_eq!(
            session.receive_bytes(&sent.waveform, Some(payload.len())).unwrap(),
            payload
        );
    }

    #[test]
    fn test_hopped_round_trip() {
        let session = ModemSession::from_config(&narrow_config()).unwrap();
        let payload = b"hop by hop".to_vec();
        let sent = session.transmit_hopped(&payload, 7).unwrap();
        let decoded = session.receive_hopped(&sent.waveform, 7, Some(payload.len())).unwrap();
        assert_eq!(decoded.bytes(), payload);
        assert!(decoded.issues.is_empty());
    }

    #[test]
    fn test_hopped_layout_too_wide() {
        // 63 kHz of carriers above a 60 kHz hop channel pass Nyquist
        let mut high = config();
        high.hopping.hop_range = (60_000.0, 70_000.0);
        let session = ModemSession::from_config(&high).unwrap();
        assert!(matches!(
            session.transmit_hopped(&[0xFF; 64], 0),
            Err(ModemError::NyquistViolation { .. })
        ));
    }

    #[test]
    fn test_symbols_round_trip() {
        let session = ModemSession::from_config(&config()).unwrap();
        let symbols = vec![
            SemanticSymbol::new(250.0, 0.9, 0.5),
            SemanticSymbol::new(1200.0, 0.4, -1.0),
        ];
        let (waveform, metadata) = session.transmit_symbols(&symbols, 3).unwrap();
        assert_eq!(metadata.end_hop, 5);

        let decoded = session.receive_symbols(&waveform, 3).unwrap();
        assert_eq!(decoded.symbols.len(), 2);
        for (sent, got) in symbols.iter().zip(&decoded.symbols) {
            assert!((sent.frequency - got.frequency).abs() < 1.0);
            assert!((sent.amplitude - got.amplitude).abs() < 0.01);
        }
    }

    #[test]
    fn test_transmit_to_sink() {
        let session = ModemSession::from_config(&config()).unwrap();
        let mut sink = MemorySink::new();
        let stats = session.transmit_to(&mut sink, b"sink").unwrap();
        assert_eq!(stats.raw_bits, 32);
        assert_eq!(sink.waveforms.len(), 1);
    }

    #[test]
    fn test_observer_sees_both_layers() {
        let observer = Arc::new(RecordingObserver::new());
        let session = ModemSession::from_config(&config())
            .unwrap()
            .with_observer(observer.clone());
        session.transmit_bytes(b"a").unwrap();
        session
            .transmit_symbols(&[SemanticSymbol::new(100.0, 0.5, 0.0)], 0)
            .unwrap();
        assert_eq!(observer.events().len(), 2);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut bad = config();
        bad.hopping.hop_range = (100.0, 50.0);
        assert!(matches!(
            ModemSession::from_config(&bad),
            Err(ModemError::Config(_))
        ));
        assert!(ModemSession::with_key_hex(&config(), "zz").is_err());
    }
}
