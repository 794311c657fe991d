//! # Configuration File
//!
//! YAML configuration for a modem session:
//!
//! - sample rate and shared secret key
//! - hop band, dwell time and FM deviation of the spread-spectrum layer
//! - carrier layout, modulation and timing of the multi-carrier layer
//! - logging
//!
//! ## Configuration Search Path
//!
//! Configuration is loaded from the first file found:
//! 1. Path specified via `ULTRAMODEM_CONFIG` environment variable
//! 2. `./ultramodem.yaml` (current directory)
//! 3. `~/.config/ultramodem/config.yaml` (user config)
//! 4. `/etc/ultramodem/config.yaml` (system config)
//!
//! ## Example Configuration
//!
//! ```yaml
//! sample_rate: 192000
//! secret_key: "9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08"
//!
//! hopping:
//!   hop_range: [20000.0, 40000.0]
//!   hop_spacing_hz: 100.0
//!   dwell_time_ms: 10.0
//!
//! multicarrier:
//!   num_carriers: 64
//!   modulation: "16QAM"
//!   first_carrier_hz: 25000.0
//! ```

use crate::constellation::Modulation;
use crate::key::SecretKey;
use crate::observe::LogConfig;
use crate::types::{ModemError, ModemResult};
use crate::waveform::{MultiCarrierConfig, SpreadSpectrumConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV_VAR: &str = "ULTRAMODEM_CONFIG";

fn config_error(context: impl std::fmt::Display, err: impl std::fmt::Display) -> ModemError {
    ModemError::ConfigFile(format!("{context}: {err}"))
}

/// Spread-spectrum layer settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HoppingConfig {
    /// `[freq_min, freq_max)` of the hop band in Hz
    pub hop_range: (f64, f64),
    /// Channel grid spacing in Hz
    pub hop_spacing_hz: f64,
    /// Time on each carrier in milliseconds
    pub dwell_time_ms: f64,
    /// Peak FM deviation as a fraction of the carrier
    pub deviation_fraction: f64,
}

impl Default for HoppingConfig {
    fn default() -> Self {
        Self {
            hop_range: (20_000.0, 40_000.0),
            hop_spacing_hz: 100.0,
            dwell_time_ms: 10.0,
            deviation_fraction: 0.1,
        }
    }
}

/// Multi-carrier layer settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MultiCarrierSection {
    pub num_carriers: usize,
    pub modulation: Modulation,
    pub symbol_duration_s: f64,
    pub guard_interval_s: f64,
    pub first_carrier_hz: f64,
    /// `None` uses the symbol rate `1 / symbol_duration_s`
    pub carrier_spacing_hz: Option<f64>,
}

impl Default for MultiCarrierSection {
    fn default() -> Self {
        Self {
            num_carriers: 64,
            modulation: Modulation::Qpsk,
            symbol_duration_s: 0.001,
            guard_interval_s: 0.0002,
            first_carrier_hz: 25_000.0,
            carrier_spacing_hz: None,
        }
    }
}

impl MultiCarrierSection {
    /// Explicit spacing, or the orthogonal spacing `1 / T`.
    pub fn spacing_hz(&self) -> f64 {
        self.carrier_spacing_hz
            .unwrap_or_else(|| 1.0 / self.symbol_duration_s)
    }
}

/// Complete modem configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModemConfig {
    /// Sample rate shared by both layers, in Hz
    pub sample_rate: u32,
    /// Hex-encoded key; a fresh key is generated when absent
    pub secret_key: Option<String>,
    pub hopping: HoppingConfig,
    pub multicarrier: MultiCarrierSection,
    pub logging: LogConfig,
}

impl Default for ModemConfig {
    fn default() -> Self {
        Self {
            sample_rate: 192_000,
            secret_key: None,
            hopping: HoppingConfig::default(),
            multicarrier: MultiCarrierSection::default(),
            logging: LogConfig::default(),
        }
    }
}

impl ModemConfig {
    /// Load configuration from the default search path.
    ///
    /// Search order:
    /// 1. `ULTRAMODEM_CONFIG` environment variable
    /// 2. `./ultramodem.yaml`
    /// 3. `~/.config/ultramodem/config.yaml`
    /// 4. `/etc/ultramodem/config.yaml`
    ///
    /// Returns default config if no file is found.
    pub fn load() -> ModemResult<Self> {
        if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
            if Path::new(&path).exists() {
                return Self::load_from(Path::new(&path));
            }
            tracing::warn!(path = %path, "{CONFIG_ENV_VAR} points to a missing file");
        }

        for path in Self::config_search_paths() {
            if path.exists() {
                return Self::load_from(&path);
            }
        }

        tracing::debug!("no config file found, using defaults");
        Ok(Self::default())
    }

    /// Load configuration from a specific file.
    pub fn load_from(path: &Path) -> ModemResult<Self> {
        let content =
            std::fs::read_to_string(path).map_err(|e| config_error(path.display(), e))?;
        let config = Self::parse(&content)?;
        tracing::info!(path = %path.display(), "configuration loaded");
        Ok(config)
    }

    /// Parse configuration from a YAML string.
    pub fn parse(yaml: &str) -> ModemResult<Self> {
        serde_yaml::from_str(yaml).map_err(|e| config_error("parse", e))
    }

    /// Save configuration to a file.
    pub fn save(&self, path: &Path) -> ModemResult<()> {
        let content = serde_yaml::to_string(self).map_err(|e| config_error("serialize", e))?;
        std::fs::write(path, content).map_err(|e| config_error(path.display(), e))
    }

    /// Get configuration search paths.
    pub fn config_search_paths() -> Vec<PathBuf> {
        let mut paths = vec![PathBuf::from("./ultramodem.yaml")];

        if let Some(dirs) = directories::ProjectDirs::from("", "", "ultramodem") {
            paths.push(dirs.config_dir().join("config.yaml"));
        }

        paths.push(PathBuf::from("/etc/ultramodem/config.yaml"));
        paths
    }

    /// Check every range before a session is built.
    ///
    /// Codec-level constraints (Nyquist, orthogonality) are checked again by
    /// the codecs themselves.
    pub fn validate(&self) -> ModemResult<()> {
        if self.sample_rate == 0 {
            return Err(ModemError::config("sample_rate must be positive"));
        }

        if let Some(ref hex_key) = self.secret_key {
            SecretKey::import_hex(hex_key)?;
        }

        let (freq_min, freq_max) = self.hopping.hop_range;
        if !(freq_min.is_finite() && freq_max.is_finite()) || freq_min >= freq_max {
            return Err(ModemError::config(format!(
                "hop_range must satisfy min < max, got ({freq_min}, {freq_max})"
            )));
        }
        if !self.hopping.hop_spacing_hz.is_finite() || self.hopping.hop_spacing_hz <= 0.0 {
            return Err(ModemError::config("hop_spacing_hz must be positive"));
        }
        self.to_spread_spectrum_config().validate()?;

        let mc = &self.multicarrier;
        if mc.num_carriers == 0 {
            return Err(ModemError::config("num_carriers must be > 0"));
        }
        if !mc.symbol_duration_s.is_finite() || mc.symbol_duration_s <= 0.0 {
            return Err(ModemError::config("symbol_duration_s must be positive"));
        }
        if let Some(spacing) = mc.carrier_spacing_hz {
            if !spacing.is_finite() || spacing <= 0.0 {
                return Err(ModemError::config("carrier_spacing_hz must be positive"));
            }
        }
        self.to_multicarrier_config().validate()
    }

    /// The shared key, or a freshly generated one if none is configured.
    pub fn secret_key(&self) -> ModemResult<SecretKey> {
        match self.secret_key {
            Some(ref hex_key) => SecretKey::import_hex(hex_key),
            None => Ok(SecretKey::generate()),
        }
    }

    pub fn to_spread_spectrum_config(&self) -> SpreadSpectrumConfig {
        SpreadSpectrumConfig {
            dwell_time_ms: self.hopping.dwell_time_ms,
            deviation_fraction: self.hopping.deviation_fraction,
            sample_rate: self.sample_rate,
        }
    }

    pub fn to_multicarrier_config(&self) -> MultiCarrierConfig {
        let mc = &self.multicarrier;
        MultiCarrierConfig::evenly_spaced(mc.num_carriers, mc.first_carrier_hz, mc.spacing_hz())
            .with_modulation(mc.modulation)
            .with_timing(mc.symbol_duration_s, mc.guard_interval_s)
            .with_sample_rate(self.sample_rate)
    }

    /// Generate example configuration YAML.
    pub fn example_yaml() -> String {
        let config = Self {
            secret_key: Some(SecretKey::derive(b"test").export_hex()),
            multicarrier: MultiCarrierSection {
                modulation: Modulation::Qam16,
                ..Default::default()
            },
            ..Default::default()
        };

        serde_yaml::to_string(&config).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observe::LogFormat;

    #[test]
    fn test_default_config() {
        let config = ModemConfig::default();
        assert_eq!(config.sample_rate, 192_000);
        assert_eq!(config.hopping.hop_range, (20_000.0, 40_000.0));
        assert_eq!(config.multicarrier.num_carriers, 64);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_yaml() {
        let yaml = r#"
sample_rate: 96000
secret_key: "00112233445566778899aabbccddeeff"

hopping:
  hop_range: [18000.0, 30000.0]
  hop_spacing_hz: 50.0
  dwell_time_ms: 5.0

multicarrier:
  num_carriers: 16
  modulation: "64QAM"
  symbol_duration_s: 0.002
  guard_interval_s: 0.0

logging:
  level: debug
  format: json
"#;

        let config = ModemConfig::parse(yaml).unwrap();
        assert_eq!(config.sample_rate, 96_000);
        assert_eq!(config.hopping.hop_range, (18_000.0, 30_000.0));
        assert_eq!(config.hopping.hop_spacing_hz, 50.0);
        assert_eq!(config.hopping.deviation_fraction, 0.1);
        assert_eq!(config.multicarrier.modulation, Modulation::Qam64);
        assert_eq!(config.multicarrier.spacing_hz(), 500.0);
        assert_eq!(config.logging.format, LogFormat::Json);
        assert!(config.validate().is_ok());

        let mc = config.to_multicarrier_config();
        assert_eq!(mc.sample_rate, 96_000);
        assert_eq!(mc.carrier_frequencies[1], 25_500.0);
        assert_eq!(config.to_spread_spectrum_config().samples_per_dwell(), 480);
    }

    #[test]
    fn test_parse_partial_yaml() {
        let config = ModemConfig::parse("hopping:\n  dwell_time_ms: 20.0\n").unwrap();
        assert_eq!(config.hopping.dwell_time_ms, 20.0);
        assert_eq!(config.hopping.hop_spacing_hz, 100.0);
        assert_eq!(config.multicarrier.first_carrier_hz, 25_000.0);
    }

    #[test]
    fn test_parse_error() {
        let err = ModemConfig::parse("multicarrier:\n  modulation: 8PSK\n").unwrap_err();
        assert!(matches!(err, ModemError::ConfigFile(_)));
    }

    #[test]
    fn test_validation() {
        let mut config = ModemConfig::default();
        config.hopping.hop_range = (100.0, 50.0);
        assert!(matches!(config.validate(), Err(ModemError::Config(_))));

        let mut config = ModemConfig::default();
        config.secret_key = Some("not hex".to_string());
        assert!(matches!(config.validate(), Err(ModemError::Key(_))));

        let mut config = ModemConfig::default();
        config.multicarrier.num_carriers = 0;
        assert!(config.validate().is_err());

        let mut config = ModemConfig::default();
        config.multicarrier.first_carrier_hz = 90_000.0;
        assert!(matches!(
            config.validate(),
            Err(ModemError::NyquistViolation { .. })
        ));

        let mut config = ModemConfig::default();
        config.hopping.dwell_time_ms = 0.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_secret_key() {
        let mut config = ModemConfig::default();
        assert_eq!(config.secret_key().unwrap().len(), 32);

        let key = SecretKey::derive(b"shared");
        config.secret_key = Some(key.export_hex());
        assert_eq!(config.secret_key().unwrap(), key);
    }

    #[test]
    fn test_example_yaml() {
        let yaml = ModemConfig::example_yaml();
        assert!(yaml.contains("hopping:"));
        assert!(yaml.contains("multicarrier:"));
        let parsed = ModemConfig::parse(&yaml).unwrap();
        assert_eq!(parsed.multicarrier.modulation, Modulation::Qam16);
        assert!(parsed.validate().is_ok());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ultramodem.yaml");

        let mut config = ModemConfig::default();
        config.sample_rate = 96_000;
        config.multicarrier.carrier_spacing_hz = Some(2_000.0);
        config.save(&path).unwrap();

        let loaded = ModemConfig::load_from(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_load_missing_file() {
        let err = ModemConfig::load_from(Path::new("/nonexistent/ultramodem.yaml")).unwrap_err();
        assert!(matches!(err, ModemError::ConfigFile(_)));
    }

    #[test]
    fn test_config_search_paths() {
        let paths = ModemConfig::config_search_paths();
        assert!(!paths.is_empty());
        assert!(paths[0].ends_with("ultramodem.yaml"));
        assert!(paths.last().unwrap().starts_with("/etc/ultramodem"));
    }
}
