//! Collector configuration
//!
//! Loaded from TOML or built in code; always validated before a heap
//! accepts it.

use crate::error::{HeapError, HeapResult};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GcConfig {
    /// Allocations since the last young pass before one runs automatically
    #[serde(default = "default_gen0")]
    pub gen0_threshold: usize,

    /// Promotions into gen1 before an automatic pass also examines gen1
    #[serde(default = "default_older")]
    pub gen1_threshold: usize,

    /// Promotions into gen2 before an automatic pass examines everything
    #[serde(default = "default_older")]
    pub gen2_threshold: usize,

    /// Threshold-triggered passes; manual `collect` and refcounting stay active
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Retain every unreachable batch in the garbage list instead of freeing it
    #[serde(default)]
    pub save_all: bool,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            gen0_threshold: default_gen0(),
            gen1_threshold: default_older(),
            gen2_threshold: default_older(),
            enabled: true,
            save_all: false,
        }
    }
}

fn default_gen0() -> usize { 700 }
fn default_older() -> usize { 10 }
fn default_true() -> bool { true }

impl GcConfig {
    /// Automatic collection off, manual collection still available
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    pub fn with_thresholds(mut self, gen0: usize, gen1: usize, gen2: usize) -> Self {
        self.gen0_threshold = gen0;
        self.gen1_threshold = gen1;
        self.gen2_threshold = gen2;
        self
    }

    pub fn with_save_all(mut self, save_all: bool) -> Self {
        self.save_all = save_all;
        self
    }

    pub fn thresholds(&self) -> [usize; 3] {
        [self.gen0_threshold, self.gen1_threshold, self.gen2_threshold]
    }

    pub fn validate(&self) -> HeapResult<()> {
        for (generation, threshold) in self.thresholds().iter().enumerate() {
            if *threshold == 0 {
                return Err(HeapError::InvalidConfiguration(format!(
                    "gen{}_threshold must be positive",
                    generation
                )));
            }
        }
        Ok(())
    }

    /// Parse and validate a TOML document
    pub fn parse(content: &str) -> HeapResult<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| HeapError::InvalidConfiguration(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> HeapResult<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            HeapError::InvalidConfiguration(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::parse(&content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_valid() {
        let config = GcConfig::default();
        assert_eq!(config.thresholds(), [700, 10, 10]);
        assert!(config.enabled);
        assert!(!config.save_all);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn zero_threshold_rejected() {
        let config = GcConfig::default().with_thresholds(5, 0, 3);
        match config.validate() {
            Err(HeapError::InvalidConfiguration(reason)) => assert!(reason.contains("gen1")),
            other => panic!("expected InvalidConfiguration, got {:?}", other),
        }
    }

    #[test]
    fn parse_fills_missing_keys() {
        let config = GcConfig::parse("gen0_threshold = 3\nsave_all = true\n").unwrap();
        assert_eq!(config.gen0_threshold, 3);
        assert_eq!(config.gen1_threshold, 10);
        assert!(config.save_all);
        assert!(config.enabled);
    }

    #[test]
    fn parse_rejects_unknown_keys_and_bad_values() {
        assert!(GcConfig::parse("gen3_threshold = 1").is_err());
        assert!(GcConfig::parse("gen0_threshold = 0").is_err());
        assert!(GcConfig::parse("gen0_threshold = -4").is_err());
    }

    #[test]
    fn load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "gen0_threshold = 50\nenabled = false").unwrap();

        let config = GcConfig::load(file.path()).unwrap();
        assert_eq!(config.gen0_threshold, 50);
        assert!(!config.enabled);
    }

    #[test]
    fn load_missing_file_is_configuration_error() {
        let err = GcConfig::load(Path::new("/definitely/not/here.toml")).unwrap_err();
        assert!(matches!(err, HeapError::InvalidConfiguration(_)));
    }
}
