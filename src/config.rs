//! Immutable configuration, constructed once and threaded through every
//! component by construction (see DESIGN.md, "Global flags vs configuration").

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Which coverage-code shape the block instrumenter emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoverageType {
    Block,
    Edge,
}

impl Default for CoverageType {
    fn default() -> Self {
        CoverageType::Block
    }
}

/// Process-wide instrumentation configuration. `compare_coverage` and
/// `input_to_state` are orthogonal gates: either, both, or neither may be on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub coverage_type: CoverageType,
    pub compare_coverage: bool,
    pub input_to_state: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            coverage_type: CoverageType::Block,
            compare_coverage: true,
            input_to_state: false,
        }
    }
}

impl Config {
    pub fn from_json_str(s: &str) -> Result<Self> {
        Ok(serde_json::from_str(s)?)
    }

    pub fn from_json_file(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)?;
        Self::from_json_str(&data)
    }

    pub fn to_json_string(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn write_json_file(&self, path: &Path) -> Result<()> {
        std::fs::write(path, self.to_json_string()?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_block_coverage_and_compare_on() {
        let config = Config::default();
        assert_eq!(config.coverage_type, CoverageType::Block);
        assert!(config.compare_coverage);
        assert!(!config.input_to_state);
    }

    #[test]
    fn json_round_trip() {
        let config = Config {
            coverage_type: CoverageType::Edge,
            compare_coverage: false,
            input_to_state: true,
        };
        let json = config.to_json_string().unwrap();
        let parsed = Config::from_json_str(&json).unwrap();
        assert_eq!(config, parsed);
    }

    #[test]
    fn missing_fields_fall_back_to_defaults() {
        let parsed = Config::from_json_str(r#"{"input_to_state": true}"#).unwrap();
        assert_eq!(parsed.coverage_type, CoverageType::Block);
        assert!(parsed.compare_coverage);
        assert!(parsed.input_to_state);
    }
}
