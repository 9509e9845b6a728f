//! Loader configuration (anvil.toml)
//!
//! Settings are read from TOML and can be overridden from the environment:
//!
//! | variable | field |
//! |---|---|
//! | `ANVIL_SIDE` | `side` (`client` or `server`) |
//! | `ANVIL_AUDIT` | `audit` (output archive path) |
//! | `ANVIL_SHOW_PERF` | `show_perf` (`true` or `false`) |
//! | `ANVIL_PRINT_CLASS_PATH` | `print_class_path` (`true` or `false`) |

use crate::side::Side;
use anvil_bytecode::OBJECT_CLASS;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Environment variable overriding `side`
pub const ENV_SIDE: &str = "ANVIL_SIDE";
/// Environment variable overriding `audit`
pub const ENV_AUDIT: &str = "ANVIL_AUDIT";
/// Environment variable overriding `show_perf`
pub const ENV_SHOW_PERF: &str = "ANVIL_SHOW_PERF";
/// Environment variable overriding `print_class_path`
pub const ENV_PRINT_CLASS_PATH: &str = "ANVIL_PRINT_CLASS_PATH";

/// Errors that can occur while loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the config file
    #[error("Failed to read config file: {0}")]
    IoError(#[from] std::io::Error),

    /// Failed to parse TOML
    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// A setting has an invalid value
    #[error("Invalid value {value:?} for {key}: expected {expected}")]
    InvalidValue {
        /// Setting or environment variable
        key: String,
        /// Rejected value
        value: String,
        /// Accepted values
        expected: &'static str,
    },

    /// Validation error
    #[error("Invalid config: {0}")]
    ValidationError(String),

    /// Missing required field
    #[error("Missing required field: {0}")]
    MissingField(String),
}

/// Loader settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoaderConfig {
    /// Physical side of this run
    pub side: Side,

    /// Write transformed classes to this archive instead of starting the game
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audit: Option<PathBuf>,

    /// Log performance counters
    #[serde(default)]
    pub show_perf: bool,

    /// Log the content layers at startup
    #[serde(default)]
    pub print_class_path: bool,

    /// Root of the type hierarchy (default: "lang.Object")
    #[serde(default = "default_universal_base")]
    pub universal_base: String,

    /// Extra names kept out of the pipeline
    #[serde(default)]
    pub ignore: IgnoreConfig,
}

/// Extra ignore rules
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct IgnoreConfig {
    /// Packages ignored together with their subpackages
    #[serde(default)]
    pub packages: Vec<String>,

    /// Packages whose direct classes are ignored
    #[serde(default)]
    pub absolute_packages: Vec<String>,

    /// Individual classes
    #[serde(default)]
    pub classes: Vec<String>,
}

fn default_universal_base() -> String {
    OBJECT_CLASS.to_string()
}

impl LoaderConfig {
    /// Default settings for `side`
    pub fn new(side: Side) -> Self {
        Self {
            side,
            audit: None,
            show_perf: false,
            print_class_path: false,
            universal_base: default_universal_base(),
            ignore: IgnoreConfig::default(),
        }
    }

    /// Load a config file and apply environment overrides
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let mut config: LoaderConfig = toml::from_str(&content)?;
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a config from a string
    pub fn from_str(content: &str) -> Result<Self, ConfigError> {
        let config: LoaderConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Build a config from the environment alone
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from an environment lookup; `ANVIL_SIDE` is required
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let side = lookup(ENV_SIDE).ok_or_else(|| ConfigError::MissingField(ENV_SIDE.to_string()))?;
        let mut config = Self::new(parse_side(ENV_SIDE, &side)?);
        config.apply_overrides(lookup)?;
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from the process environment
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an environment lookup
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        if let Some(value) = lookup(ENV_SIDE) {
            self.side = parse_side(ENV_SIDE, &value)?;
        }
        if let Some(value) = lookup(ENV_AUDIT) {
            if value.is_empty() {
                return Err(ConfigError::InvalidValue {
                    key: ENV_AUDIT.to_string(),
                    value,
                    expected: "an output archive path",
                });
            }
            self.audit = Some(PathBuf::from(value));
        }
        if let Some(value) = lookup(ENV_SHOW_PERF) {
            self.show_perf = parse_bool(ENV_SHOW_PERF, &value)?;
        }
        if let Some(value) = lookup(ENV_PRINT_CLASS_PATH) {
            self.print_class_path = parse_bool(ENV_PRINT_CLASS_PATH, &value)?;
        }
        Ok(())
    }

    /// Validate the config
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !is_valid_class_name(&self.universal_base) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid universal_base: {:?}",
                self.universal_base
            )));
        }

        let rules = [
            ("ignore.packages", &self.ignore.packages),
            ("ignore.absolute_packages", &self.ignore.absolute_packages),
            ("ignore.classes", &self.ignore.classes),
        ];
        for (key, names) in rules {
            if let Some(bad) = names.iter().find(|n| !is_valid_class_name(n)) {
                return Err(ConfigError::InvalidValue {
                    key: key.to_string(),
                    value: bad.clone(),
                    expected: "a dotted name",
                });
            }
        }
        Ok(())
    }

    /// Whether the run writes an audit archive
    pub fn is_auditing(&self) -> bool {
        self.audit.is_some()
    }
}

fn parse_side(key: &str, value: &str) -> Result<Side, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
        expected: "client or server",
    })
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
            expected: "true or false",
        }),
    }
}

fn is_valid_class_name(name: &str) -> bool {
    !name.is_empty()
        && name.split('.').all(|part| {
            !part.is_empty() && part.chars().all(|c| c.is_alphanumeric() || c == '_' || c == '$')
        })
}
