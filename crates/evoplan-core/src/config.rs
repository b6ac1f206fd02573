//! Configuration file support.
//!
//! Config files supply option defaults (`[defaults]`) and front-end
//! preferences; option files are a bare flat table of options. Both are TOML.

use crate::options::{OptionValue, RawOptions};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EvoplanConfig {
    /// Log level
    #[serde(default)]
    pub log_level: Option<String>,

    /// Output format preferences
    #[serde(default)]
    pub output: OutputConfig,

    /// Option defaults, keyed by option name
    #[serde(default)]
    pub defaults: toml::Table,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Default output format (human, json)
    #[serde(default = "default_output_format")]
    pub format: String,

    /// Always use JSON output
    #[serde(default)]
    pub always_json: bool,
}

fn default_output_format() -> String {
    "human".to_string()
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self { format: default_output_format(), always_json: false }
    }
}

impl OutputConfig {
    #[must_use]
    pub fn wants_json(&self) -> bool {
        self.always_json || self.format == "json"
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration file not found: {0}")]
    NotFound(String),

    #[error("Failed to read configuration file: {0}")]
    ReadError(String),

    #[error("Failed to parse configuration file: {0}")]
    ParseError(String),

    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

fn read(path: &Path) -> ConfigResult<String> {
    if !path.exists() {
        return Err(ConfigError::NotFound(path.display().to_string()));
    }
    std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError(format!("{}: {e}", path.display())))
}

impl EvoplanConfig {
    pub fn load_from_file(path: &Path) -> ConfigResult<Self> {
        let content = read(path)?;
        toml::from_str(&content).map_err(|e| ConfigError::ParseError(format!("{}: {e}", path.display())))
    }

    #[must_use]
    pub fn default_global_path() -> PathBuf {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("."))
            .join(".evoplan")
            .join("config.toml")
    }

    #[must_use]
    pub fn default_local_path() -> PathBuf {
        PathBuf::from(".evoplanrc")
    }

    /// Load the global then the local config; the local one wins.
    pub fn discover_and_load() -> ConfigResult<Self> {
        Self::discover_from(&Self::default_global_path(), &Self::default_local_path())
    }

    /// Like [`Self::discover_and_load`] with explicit paths. Missing files
    /// are skipped; unreadable or malformed ones are errors.
    pub fn discover_from(global: &Path, local: &Path) -> ConfigResult<Self> {
        let mut config = Self::default();
        for path in [global, local] {
            match Self::load_from_file(path) {
                Ok(found) => config.merge(&found),
                Err(ConfigError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(config)
    }

    /// Values from `other` override values in `self`, key by key.
    pub fn merge(&mut self, other: &Self) {
        if let Some(ref log_level) = other.log_level {
            self.log_level = Some(log_level.clone());
        }
        if other.output.always_json {
            self.output.always_json = true;
        }
        if other.output.format != "human" {
            self.output.format = other.output.format.clone();
        }
        for (key, value) in &other.defaults {
            self.defaults.insert(key.clone(), value.clone());
        }
    }

    /// The `[defaults]` table as options.
    pub fn default_options(&self) -> ConfigResult<RawOptions> {
        options_from_table(&self.defaults)
    }
}

/// Load an options file: a flat TOML table of option name to value.
pub fn load_options_file(path: &Path) -> ConfigResult<RawOptions> {
    let content = read(path)?;
    let table: toml::Table =
        toml::from_str(&content).map_err(|e| ConfigError::ParseError(format!("{}: {e}", path.display())))?;
    options_from_table(&table)
}

pub fn options_from_table(table: &toml::Table) -> ConfigResult<RawOptions> {
    table
        .iter()
        .map(|(key, value)| Ok((key.clone(), option_value(key, value)?)))
        .collect()
}

fn option_value(key: &str, value: &toml::Value) -> ConfigResult<OptionValue> {
    let unsupported = |what: &str| ConfigError::InvalidValue(format!("`{key}`: {what} is not a valid option value"));

    match value {
        toml::Value::String(s) => Ok(OptionValue::Str(s.clone())),
        toml::Value::Integer(n) => Ok(OptionValue::Int(*n)),
        toml::Value::Float(f) => Ok(OptionValue::Float(*f)),
        toml::Value::Boolean(b) => Ok(OptionValue::Bool(*b)),
        toml::Value::Array(items) if items.is_empty() => Ok(OptionValue::StrList(Vec::new())),
        toml::Value::Array(items) => {
            if let Some(ints) = items.iter().map(toml::Value::as_integer).collect::<Option<Vec<_>>>() {
                return Ok(OptionValue::IntList(ints));
            }
            if let Some(strs) = items
                .iter()
                .map(|v| v.as_str().map(str::to_string))
                .collect::<Option<Vec<_>>>()
            {
                return Ok(OptionValue::StrList(strs));
            }
            Err(unsupported("an array mixing types, or of something other than integers or strings,"))
        }
        toml::Value::Datetime(_) => Err(unsupported("a datetime")),
        toml::Value::Table(_) => Err(unsupported("a table")),
    }
}
