//! Build configuration.

use crate::errors::{ArpeggioError, Result};
use crate::model::quantize::QuantConfig;

/// Which storage backend a build produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// Open-addressing hash tables: expected O(1) lookup, more memory.
    Probing,
    /// Sorted bit-packed trie: binary-search lookup, less memory,
    /// supports value quantization.
    Trie,
}

/// Parameters for building a model from a text model.
#[derive(Debug, Clone)]
pub struct Config {
    /// Storage backend to build.
    pub backend: BackendKind,

    /// Headroom factor for probing-table sizing; must be greater
    /// than 1.0.
    pub probing_multiplier: f32,

    /// Maximum probe-sequence length. Exceeding it during build is a
    /// build error; during lookup it means not-found.
    pub max_probes: u32,

    /// Value quantization, trie backend only. `None` stores
    /// full-precision values.
    pub quant: Option<QuantConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backend: BackendKind::Probing,
            probing_multiplier: 1.5,
            max_probes: 100,
            quant: None,
        }
    }
}

impl Config {
    pub(crate) fn validate(&self) -> Result<()> {
        if self.probing_multiplier <= 1.0 {
            return Err(ArpeggioError::invalid_config(
                "probing_multiplier",
                format!("must be greater than 1.0, got {}", self.probing_multiplier),
            ));
        }
        if let Some(quant) = &self.quant {
            quant.validate()?;
            if self.backend == BackendKind::Probing {
                return Err(ArpeggioError::invalid_config(
                    "quant",
                    "value quantization requires the trie backend",
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_multiplier_must_exceed_one() {
        let config = Config {
            probing_multiplier: 1.0,
            ..Config::default()
        };
        assert!(matches!(
            config.validate().unwrap_err(),
            ArpeggioError::Config(_)
        ));
    }

    #[test]
    fn test_quantization_requires_trie() {
        let config = Config {
            quant: Some(QuantConfig::default()),
            ..Config::default()
        };
        assert!(matches!(
            config.validate().unwrap_err(),
            ArpeggioError::Config(_)
        ));
        let config = Config {
            backend: BackendKind::Trie,
            quant: Some(QuantConfig::default()),
            ..Config::default()
        };
        assert!(config.validate().is_ok());
    }
}
