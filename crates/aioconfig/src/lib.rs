//! Configuration file parser for the async I/O core
//!
//! This crate parses INI-style configuration files in the same shape as
//! `ceph.conf` and turns individual values into typed options.
//!
//! # Example
//!
//! ```
//! use aioconfig::{ConfFile, Count, Size};
//!
//! let conf = ConfFile::parse(
//!     "[client]\nobjecter inflight ops = 64\nobjecter_inflight_op_bytes = 8M\n",
//! )
//! .unwrap();
//!
//! let ops: Count = conf.try_get(&["client", "global"], "objecter_inflight_ops").unwrap().unwrap();
//! let bytes: Size = conf.try_get(&["client", "global"], "objecter_inflight_op_bytes").unwrap().unwrap();
//! assert_eq!(ops.0, 64);
//! assert_eq!(bytes.0, 8 * 1024 * 1024);
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use thiserror::Error;

/// Sections consulted by default, most specific first
pub const DEFAULT_SECTIONS: &[&str] = &["client", "global"];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    ParseError(String),

    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Trait for types that can be parsed from configuration values
pub trait ConfigValue: Sized + Clone {
    /// Parse from a string value
    fn parse_config_value(s: &str) -> Result<Self, ConfigError>;

    /// Get the type name for error messages
    fn type_name() -> &'static str;
}

/// Size value in bytes (supports K, M, G, T, KB, MB, GB, TB)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Size(pub u64);

impl ConfigValue for Size {
    fn parse_config_value(s: &str) -> Result<Self, ConfigError> {
        parse_size(s).map(Size)
    }

    fn type_name() -> &'static str {
        "size"
    }
}

/// Duration value (supports s, ms, us, m, h, d)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Duration(pub std::time::Duration);

impl ConfigValue for Duration {
    fn parse_config_value(s: &str) -> Result<Self, ConfigError> {
        parse_duration(s).map(Duration)
    }

    fn type_name() -> &'static str {
        "duration"
    }
}

/// Count value (plain integer)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Count(pub u64);

impl ConfigValue for Count {
    fn parse_config_value(s: &str) -> Result<Self, ConfigError> {
        s.trim()
            .replace('_', "")
            .parse()
            .map(Count)
            .map_err(|_| ConfigError::ParseError(format!("Invalid count: {}", s)))
    }

    fn type_name() -> &'static str {
        "count"
    }
}

impl ConfigValue for bool {
    fn parse_config_value(s: &str) -> Result<Self, ConfigError> {
        match s.trim().to_lowercase().as_str() {
            "true" | "yes" | "1" | "on" => Ok(true),
            "false" | "no" | "0" | "off" => Ok(false),
            _ => Err(ConfigError::ParseError(format!("Invalid bool: {}", s))),
        }
    }

    fn type_name() -> &'static str {
        "bool"
    }
}

impl ConfigValue for String {
    fn parse_config_value(s: &str) -> Result<Self, ConfigError> {
        Ok(s.to_string())
    }

    fn type_name() -> &'static str {
        "string"
    }
}

/// A configuration option with name, type, and default value
pub struct ConfigOption<T: ConfigValue> {
    name: &'static str,
    default: T,
}

impl<T: ConfigValue> ConfigOption<T> {
    pub const fn new(name: &'static str, default: T) -> Self {
        Self { name, default }
    }

    /// Get the value from config, falling back to the default when the
    /// option is absent
    ///
    /// A value that is present but does not parse is an error rather than
    /// a silent fallback.
    pub fn get(&self, conf: &ConfFile, sections: &[&str]) -> Result<T, ConfigError> {
        Ok(conf
            .try_get(sections, self.name)?
            .unwrap_or_else(|| self.default.clone()))
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn default_value(&self) -> &T {
        &self.default
    }
}

/// Normalize an option name
///
/// `objecter inflight ops`, `objecter-inflight-ops` and
/// `objecter_inflight_ops` all name the same option.
pub fn normalize_key(key: &str) -> String {
    key.trim()
        .split(|c: char| c.is_whitespace() || c == '-' || c == '_')
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("_")
        .to_lowercase()
}

/// Split a numeric prefix from its unit suffix
fn split_unit(s: &str) -> Result<(f64, String), ConfigError> {
    let num_end = s
        .char_indices()
        .find(|(_, c)| !c.is_ascii_digit() && *c != '.')
        .map(|(i, _)| i)
        .unwrap_or(s.len());

    let (num_str, unit) = s.split_at(num_end);
    let num: f64 = num_str
        .parse()
        .map_err(|_| ConfigError::ParseError(format!("Invalid number: {}", num_str)))?;

    Ok((num, unit.trim().to_string()))
}

/// Parse size string with binary prefixes
fn parse_size(s: &str) -> Result<u64, ConfigError> {
    let s = s.trim().replace('_', "");
    let (num, unit) = split_unit(&s)?;

    let multiplier: u64 = match unit.to_uppercase().as_str() {
        "" | "B" => 1,
        "K" | "KB" | "KI" | "KIB" => 1 << 10,
        "M" | "MB" | "MI" | "MIB" => 1 << 20,
        "G" | "GB" | "GI" | "GIB" => 1 << 30,
        "T" | "TB" | "TI" | "TIB" => 1 << 40,
        other => {
            return Err(ConfigError::ParseError(format!(
                "Unknown size unit: {}",
                other
            )))
        }
    };

    Ok((num * multiplier as f64) as u64)
}

/// Parse duration string with time units
fn parse_duration(s: &str) -> Result<std::time::Duration, ConfigError> {
    let (num, unit) = split_unit(s.trim())?;

    let unit_nanos: f64 = match unit.to_lowercase().as_str() {
        "" | "s" | "sec" | "second" | "seconds" => 1e9,
        "ms" | "msec" | "millisecond" | "milliseconds" => 1e6,
        "us" | "usec" | "microsecond" | "microseconds" => 1e3,
        "m" | "min" | "minute" | "minutes" => 60.0 * 1e9,
        "h" | "hr" | "hour" | "hours" => 3600.0 * 1e9,
        "d" | "day" | "days" => 86400.0 * 1e9,
        other => {
            return Err(ConfigError::ParseError(format!(
                "Unknown time unit: {}",
                other
            )))
        }
    };

    Ok(std::time::Duration::from_nanos((num * unit_nanos).round() as u64))
}

/// A parsed configuration file
///
/// Keys are stored normalized (see [`normalize_key`]); lookups normalize the
/// requested key the same way.
#[derive(Debug, Clone, Default)]
pub struct ConfFile {
    sections: BTreeMap<String, BTreeMap<String, String>>,
}

impl ConfFile {
    /// Parse a configuration file from the given path
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse configuration from a string
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let mut sections: BTreeMap<String, BTreeMap<String, String>> = BTreeMap::new();
        let mut current_section = String::from("global");

        for (lineno, raw) in content.lines().enumerate() {
            let line = raw.trim();

            if line.is_empty() || line.starts_with(';') || line.starts_with('#') {
                continue;
            }

            if line.starts_with('[') {
                if !line.ends_with(']') || line.len() < 3 {
                    return Err(ConfigError::ParseError(format!(
                        "line {}: malformed section header '{}'",
                        lineno + 1,
                        line
                    )));
                }
                current_section = line[1..line.len() - 1].trim().to_string();
                sections.entry(current_section.clone()).or_default();
                continue;
            }

            let Some((key, value)) = line.split_once('=') else {
                return Err(ConfigError::ParseError(format!(
                    "line {}: expected 'key = value', got '{}'",
                    lineno + 1,
                    line
                )));
            };

            // Trailing comments are allowed after values
            let value = value
                .split(|c| c == ';' || c == '#')
                .next()
                .unwrap_or_default()
                .trim();

            sections
                .entry(current_section.clone())
                .or_default()
                .insert(normalize_key(key), value.to_string());
        }

        Ok(Self { sections })
    }

    /// Get a raw value from a specific section
    pub fn get(&self, section: &str, key: &str) -> Option<&str> {
        self.sections
            .get(section)
            .and_then(|s| s.get(&normalize_key(key)))
            .map(|v| v.as_str())
    }

    /// Get a raw value, checking multiple sections in order
    pub fn get_with_fallback(&self, sections: &[&str], key: &str) -> Option<&str> {
        sections.iter().find_map(|section| self.get(section, key))
    }

    /// Get a typed value, checking multiple sections in order
    ///
    /// Returns `Ok(None)` when the option is absent in every section.
    pub fn try_get<T: ConfigValue>(
        &self,
        sections: &[&str],
        key: &str,
    ) -> Result<Option<T>, ConfigError> {
        match self.get_with_fallback(sections, key) {
            Some(raw) => T::parse_config_value(raw)
                .map(Some)
                .map_err(|e| ConfigError::InvalidValue {
                    key: normalize_key(key),
                    message: format!("expected {}: {}", T::type_name(), e),
                }),
            None => Ok(None),
        }
    }

    /// Set a value, as a command-line override would
    pub fn set(&mut self, section: &str, key: &str, value: impl Into<String>) {
        self.sections
            .entry(section.to_string())
            .or_default()
            .insert(normalize_key(key), value.into());
    }

    /// Apply a `key=value` override to the `global` section
    pub fn apply_override(&mut self, assignment: &str) -> Result<(), ConfigError> {
        let (key, value) = assignment.split_once('=').ok_or_else(|| {
            ConfigError::ParseError(format!("expected key=value, got '{}'", assignment))
        })?;
        self.set("global", key, value.trim());
        Ok(())
    }

    /// Get all sections in the configuration
    pub fn sections(&self) -> Vec<&str> {
        self.sections.keys().map(|s| s.as_str()).collect()
    }

    /// Get all keys in a section
    pub fn keys(&self, section: &str) -> Vec<&str> {
        self.sections
            .get(section)
            .map(|s| s.keys().map(|k| k.as_str()).collect())
            .unwrap_or_default()
    }
}

/// Define a configuration struct with typed options
///
/// # Example
///
/// ```
/// use aioconfig::{define_options, ConfFile, Count, Duration};
///
/// define_options! {
///     /// Retry policy
///     pub struct RetryOptions {
///         /// Attempts before giving up
///         retry_attempts: Count = Count(3),
///         /// Pause between attempts
///         retry_backoff: Duration = Duration(std::time::Duration::from_millis(100)),
///     }
/// }
///
/// let conf = ConfFile::parse("[global]\nretry attempts = 5\n").unwrap();
/// let opts = RetryOptions::from_conf(&conf, &["client", "global"]).unwrap();
/// assert_eq!(opts.retry_attempts.0, 5);
/// assert_eq!(opts.retry_backoff.0, std::time::Duration::from_millis(100));
/// ```
#[macro_export]
macro_rules! define_options {
    (
        $(#[$meta:meta])*
        $vis:vis struct $name:ident {
            $(
                $(#[$field_meta:meta])*
                $field:ident: $ty:ty = $default:expr
            ),* $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone)]
        $vis struct $name {
            $(
                $(#[$field_meta])*
                pub $field: $ty,
            )*
        }

        impl $name {
            /// Create with default values
            pub fn new() -> Self {
                Self {
                    $(
                        $field: $default,
                    )*
                }
            }

            /// Load from a configuration file with section fallback
            pub fn from_conf(
                conf: &$crate::ConfFile,
                sections: &[&str],
            ) -> ::core::result::Result<Self, $crate::ConfigError> {
                ::core::result::Result::Ok(Self {
                    $(
                        $field: $crate::ConfigOption::new(stringify!($field), $default)
                            .get(conf, sections)?,
                    )*
                })
            }

            /// Get option names (for introspection)
            pub fn option_names() -> &'static [&'static str] {
                &[
                    $(stringify!($field),)*
                ]
            }
        }

        impl ::core::default::Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }
    };
}
