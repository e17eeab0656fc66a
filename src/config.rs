//! Configuration using Figment
//!
//! Configuration is loaded from:
//! 1. `sans.toml` (or the file given on the command line)
//! 2. Environment variables prefixed with `SANS_`, nested keys split on `__`
//!
//! Every field has a default, so an empty or missing file yields the
//! standard Larmor setup.
//!
//! # Environment Variable Overrides
//!
//! ```text
//! SANS_INSTRUMENT=zoom
//! SANS_LOGGING__LEVEL=debug
//! SANS_LARMOR__DETECTOR_POWER_UP_SECS=240
//! ```
//!
//! # Example
//!
//! ```no_run
//! use sans_scripting::config::SansConfig;
//!
//! fn main() -> anyhow::Result<()> {
//!     let config = SansConfig::load()?;
//!     println!("Instrument: {:?}", config.instrument);
//!     Ok(())
//! }
//! ```

use std::collections::BTreeMap;
use std::path::Path;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file or an override could not be parsed.
    #[error("Configuration load error: {0}")]
    LoadError(#[from] figment::Error),
    /// A value parsed but is out of range.
    #[error("Configuration validation error: {0}")]
    ValidationError(String),
}

/// Which beamline to drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstrumentSelection {
    /// Pick from the host name.
    #[default]
    Auto,
    /// Larmor.
    Larmor,
    /// Zoom.
    Zoom,
}

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SansConfig {
    /// Beamline selection
    #[serde(default)]
    pub instrument: InstrumentSelection,
    /// Log output
    #[serde(default)]
    pub logging: LoggingConfig,
    /// User-script execution
    #[serde(default)]
    pub script: ScriptConfig,
    /// Larmor settings
    #[serde(default)]
    pub larmor: LarmorConfig,
    /// Zoom settings
    #[serde(default)]
    pub zoom: ZoomConfig,
    /// Mock control system
    #[serde(default)]
    pub mock: MockConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Emit JSON lines instead of text
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

/// User-script configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptConfig {
    /// Dry-run every script against the mock before running it
    #[serde(default = "default_dry_run")]
    pub dry_run: bool,
    /// Rhai operation limit; runaway scripts are stopped after this many
    #[serde(default = "default_max_operations")]
    pub max_operations: u64,
}

impl Default for ScriptConfig {
    fn default() -> Self {
        Self {
            dry_run: default_dry_run(),
            max_operations: default_max_operations(),
        }
    }
}

/// Larmor configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LarmorConfig {
    /// Prefix of every Larmor PV
    #[serde(default = "default_larmor_prefix")]
    pub pv_prefix: String,
    /// Directory holding the DAE tables
    #[serde(default = "default_tables_dir")]
    pub tables_dir: String,
    /// Directory holding user mask tables
    #[serde(default = "default_masks_dir")]
    pub masks_dir: String,
    /// Wait after detector power up (s)
    #[serde(default = "default_power_up")]
    pub detector_power_up_secs: u64,
    /// Wait after detector power down (s)
    #[serde(default = "default_power_down")]
    pub detector_power_down_secs: u64,
    /// Time for the bench to lift or lower (s)
    #[serde(default = "default_bench_lift")]
    pub bench_lift_secs: u64,
    /// Pause between PI rotation stage commands (ms)
    #[serde(default = "default_pi_interval")]
    pub pi_command_interval_ms: u64,
}

impl Default for LarmorConfig {
    fn default() -> Self {
        Self {
            pv_prefix: default_larmor_prefix(),
            tables_dir: default_tables_dir(),
            masks_dir: default_masks_dir(),
            detector_power_up_secs: default_power_up(),
            detector_power_down_secs: default_power_down(),
            bench_lift_secs: default_bench_lift(),
            pi_command_interval_ms: default_pi_interval(),
        }
    }
}

/// Zoom configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZoomConfig {
    /// Prefix of every Zoom PV
    #[serde(default = "default_zoom_prefix")]
    pub pv_prefix: String,
}

impl Default for ZoomConfig {
    fn default() -> Self {
        Self {
            pv_prefix: default_zoom_prefix(),
        }
    }
}

/// Mock control system configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MockConfig {
    /// Blocks to register on top of the default set, with initial values
    #[serde(default)]
    pub extra_blocks: BTreeMap<String, f64>,
}

// ============================================================================
// Default value functions
// ============================================================================

fn default_log_level() -> String {
    "info".to_string()
}

fn default_dry_run() -> bool {
    true
}

fn default_max_operations() -> u64 {
    1_000_000
}

fn default_larmor_prefix() -> String {
    "IN:LARMOR:".to_string()
}

fn default_tables_dir() -> String {
    r"C:\Instrument\Settings\Tables".to_string()
}

fn default_masks_dir() -> String {
    r"U:\Users\Masks".to_string()
}

fn default_power_up() -> u64 {
    180
}

fn default_power_down() -> u64 {
    60
}

fn default_bench_lift() -> u64 {
    20
}

fn default_pi_interval() -> u64 {
    1000
}

fn default_zoom_prefix() -> String {
    "IN:ZOOM:".to_string()
}

// ============================================================================
// Configuration Loading and Validation
// ============================================================================

impl SansConfig {
    /// Load configuration from `sans.toml` and environment variables
    ///
    /// # Errors
    ///
    /// Returns a ConfigError if the file cannot be parsed or validation fails.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("sans.toml")
    }

    /// Load configuration from a specific file path
    ///
    /// Environment variables take precedence over the file. A missing file
    /// is treated as empty.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config: Self = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("SANS_").split("__"))
            .extract()
            .map_err(ConfigError::LoadError)?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration after loading
    ///
    /// Checks:
    /// - Log level is valid (trace, debug, info, warn, error)
    /// - PV prefixes are not empty
    /// - The script operation limit is non-zero
    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log level '{}'. Must be one of: {}",
                self.logging.level,
                valid_levels.join(", ")
            )));
        }

        if self.larmor.pv_prefix.is_empty() {
            return Err(ConfigError::ValidationError(
                "larmor.pv_prefix cannot be empty".to_string(),
            ));
        }
        if self.zoom.pv_prefix.is_empty() {
            return Err(ConfigError::ValidationError(
                "zoom.pv_prefix cannot be empty".to_string(),
            ));
        }

        if self.script.max_operations == 0 {
            return Err(ConfigError::ValidationError(
                "script.max_operations must be > 0".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_config(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = SansConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.instrument, InstrumentSelection::Auto);
        assert_eq!(config.larmor.pv_prefix, "IN:LARMOR:");
        assert_eq!(config.larmor.detector_power_up_secs, 180);
        assert!(config.script.dry_run);
    }

    #[test]
    #[serial]
    fn test_load_from_file() {
        let file = write_config(
            r#"
instrument = "zoom"

[logging]
level = "debug"
json = true

[larmor]
bench_lift_secs = 25

[mock.extra_blocks]
Julabo2_SP = 20.0
"#,
        );

        let config = SansConfig::load_from(file.path()).unwrap();
        assert_eq!(config.instrument, InstrumentSelection::Zoom);
        assert_eq!(config.logging.level, "debug");
        assert!(config.logging.json);
        assert_eq!(config.larmor.bench_lift_secs, 25);
        assert_eq!(config.larmor.tables_dir, r"C:\Instrument\Settings\Tables");
        assert_eq!(config.mock.extra_blocks.get("Julabo2_SP"), Some(&20.0));
    }

    #[test]
    #[serial]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = SansConfig::load_from(dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.zoom.pv_prefix, "IN:ZOOM:");
    }

    #[test]
    #[serial]
    fn test_env_overrides_file() {
        let file = write_config("[logging]\nlevel = \"info\"\n");
        std::env::set_var("SANS_LOGGING__LEVEL", "warn");
        let result = SansConfig::load_from(file.path());
        std::env::remove_var("SANS_LOGGING__LEVEL");

        assert_eq!(result.unwrap().logging.level, "warn");
    }

    #[test]
    #[serial]
    fn test_invalid_log_level_rejected() {
        let file = write_config("[logging]\nlevel = \"verbose\"\n");
        let result = SansConfig::load_from(file.path());
        assert!(matches!(result, Err(ConfigError::ValidationError(msg)) if msg.contains("verbose")));
    }

    #[test]
    #[serial]
    fn test_unknown_instrument_fails_to_load() {
        let file = write_config("instrument = \"sans2d\"\n");
        assert!(matches!(
            SansConfig::load_from(file.path()),
            Err(ConfigError::LoadError(_))
        ));
    }

    #[test]
    fn test_validation_rejects_empty_prefix_and_zero_limit() {
        let mut config = SansConfig::default();
        config.larmor.pv_prefix.clear();
        assert!(config.validate().is_err());

        let mut config = SansConfig::default();
        config.script.max_operations = 0;
        assert!(config.validate().is_err());
    }
}
