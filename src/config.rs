//! # Configuration Management
//!
//! This module loads the scheduler configuration from `sprinkler.toml`. Unlike
//! a display setting, a wrong zone table can flood a yard, so the file is
//! validated up front and a bad file is an error rather than a silent default.
//!
//! ```toml
//! board = "/dev/gpiochip0"
//! start_hour = 6
//! data_dir = "/var/lib/sprinkler"
//! lat = "40.7128"
//! long = "-74.0060"
//!
//! [zones.front]
//! pin = "17"
//! minutes = 20
//! priority = 1
//!
//! [zones.back]
//! pin = "27"
//! minutes = 15
//! ```

use crate::adjust::HeatCurve;
use crate::RAIN_SENSOR;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Default location of the configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "sprinkler.toml";

/// Errors raised while loading or validating the configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Configuration file could not be read
    #[error("cannot read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// File is not valid TOML for this schema
    #[error("invalid config format: {0}")]
    Parse(#[from] toml::de::Error),

    /// A required field is missing or empty
    #[error("missing required field `{0}`")]
    MissingField(&'static str),

    /// A field holds a value outside its allowed range
    #[error("invalid value for `{field}`: {reason}")]
    Invalid { field: String, reason: String },
}

/// One irrigation zone.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct ZoneConfig {
    /// Pin identifier handed to the board as-is
    pub pin: String,
    /// Daily watering target in minutes
    pub minutes: u32,
    /// Higher tiers are served first
    #[serde(default)]
    pub priority: i32,
}

/// Bind address of the JSON command endpoint.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct HttpConfig {
    pub bind: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        HttpConfig {
            bind: "127.0.0.1:9999".to_string(),
        }
    }
}

/// Complete scheduler configuration, immutable once loaded.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct SchedulerConfig {
    /// GPIO chip path, or `fake` for the in-memory board
    pub board: String,
    /// No watering before this local hour
    #[serde(default)]
    pub start_hour: u32,
    /// Forecast latitude; weather adjustment needs both coordinates
    #[serde(default)]
    pub lat: Option<String>,
    /// Forecast longitude
    #[serde(default)]
    pub long: Option<String>,
    /// Observation station for the observed-rain reading (e.g. "KJFK")
    #[serde(default)]
    pub station: Option<String>,
    /// Directory holding one ledger file per day
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Seconds between scheduler ticks
    #[serde(default = "default_tick_seconds")]
    pub tick_seconds: u64,
    /// Zone table keyed by zone name
    #[serde(default)]
    pub zones: BTreeMap<String, ZoneConfig>,
    /// Temperature response of the weather adjustment
    #[serde(default)]
    pub heat: HeatCurve,
    /// Command endpoint settings
    #[serde(default)]
    pub http: HttpConfig,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("sprinkler_data")
}

fn default_tick_seconds() -> u64 {
    1
}

impl SchedulerConfig {
    /// Minimal configuration for the given board and zones.
    pub fn new(board: impl Into<String>, zones: BTreeMap<String, ZoneConfig>) -> Self {
        SchedulerConfig {
            board: board.into(),
            start_hour: 0,
            lat: None,
            long: None,
            station: None,
            data_dir: default_data_dir(),
            tick_seconds: default_tick_seconds(),
            zones,
            heat: HeatCurve::default(),
            http: HttpConfig::default(),
        }
    }

    /// Load and validate configuration from `sprinkler.toml`.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_path(DEFAULT_CONFIG_PATH)
    }

    /// Load and validate configuration from the specified path.
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: SchedulerConfig = toml::from_str(&contents)?;
        config.validate()?;
        tracing::info!(
            path = %path.display(),
            zones = config.zones.len(),
            weather = config.weather_location().is_some(),
            "loaded configuration"
        );
        Ok(config)
    }

    /// Check the invariants the scheduler relies on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.board.trim().is_empty() {
            return Err(ConfigError::MissingField("board"));
        }
        if self.start_hour > 23 {
            return Err(invalid("start_hour", "must be between 0 and 23"));
        }
        if self.tick_seconds == 0 {
            return Err(invalid("tick_seconds", "must be at least 1"));
        }

        let lat = self.lat.as_deref().map(str::trim).unwrap_or_default();
        let long = self.long.as_deref().map(str::trim).unwrap_or_default();
        if lat.is_empty() != long.is_empty() {
            return Err(invalid("lat/long", "set both coordinates or neither"));
        }

        let mut pins = HashSet::new();
        for (name, zone) in &self.zones {
            let field = format!("zones.{name}");
            if name.is_empty() || name.chars().any(char::is_whitespace) {
                return Err(invalid(&field, "zone names must be non-empty without whitespace"));
            }
            if name == RAIN_SENSOR {
                return Err(invalid(&field, "name is reserved"));
            }
            if zone.pin.trim().is_empty() {
                return Err(invalid(&field, "pin must not be empty"));
            }
            if !pins.insert(zone.pin.as_str()) {
                return Err(invalid(&field, "pin is already used by another zone"));
            }
        }
        Ok(())
    }

    /// Latitude and longitude when both are configured.
    pub fn weather_location(&self) -> Option<(&str, &str)> {
        match (self.lat.as_deref(), self.long.as_deref()) {
            (Some(lat), Some(long)) if !lat.trim().is_empty() && !long.trim().is_empty() => {
                Some((lat.trim(), long.trim()))
            }
            _ => None,
        }
    }

    /// Sum of every zone's daily target.
    pub fn total_minutes(&self) -> u32 {
        self.zones.values().map(|z| z.minutes).sum()
    }

    /// Zone names in scheduling order.
    pub fn zone_order(&self) -> Vec<String> {
        crate::order::zone_order(&self.zones)
    }
}

fn invalid(field: &str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        field: field.to_string(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const SAMPLE: &str = r#"
board = "fake"
start_hour = 6
lat = "40.7"
long = "-74.0"

[zones.front]
pin = "17"
minutes = 20
priority = 1

[zones.back]
pin = "27"
minutes = 15
"#;

    fn zone(pin: &str, minutes: u32) -> ZoneConfig {
        ZoneConfig {
            pin: pin.to_string(),
            minutes,
            priority: 0,
        }
    }

    #[test]
    fn test_load_sample_config() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();

        let config = SchedulerConfig::load_from_path(file.path()).unwrap();
        assert_eq!(config.board, "fake");
        assert_eq!(config.start_hour, 6);
        assert_eq!(config.zones.len(), 2);
        assert_eq!(config.zones["front"].priority, 1);
        assert_eq!(config.zones["back"].priority, 0);
        assert_eq!(config.data_dir, PathBuf::from("sprinkler_data"));
        assert_eq!(config.tick_seconds, 1);
        assert_eq!(config.weather_location(), Some(("40.7", "-74.0")));
        assert_eq!(config.total_minutes(), 35);
    }

    #[test]
    fn test_load_nonexistent_file() {
        let err = SchedulerConfig::load_from_path("/nonexistent/path").unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn test_board_is_required() {
        let config = SchedulerConfig::new("  ", BTreeMap::new());
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingField("board"))
        ));
    }

    #[test]
    fn test_rejects_bad_start_hour() {
        let mut config = SchedulerConfig::new("fake", BTreeMap::new());
        config.start_hour = 24;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_reserved_and_duplicate_zones() {
        let mut zones = BTreeMap::new();
        zones.insert(RAIN_SENSOR.to_string(), zone("1", 10));
        assert!(SchedulerConfig::new("fake", zones).validate().is_err());

        let mut zones = BTreeMap::new();
        zones.insert("a".to_string(), zone("1", 10));
        zones.insert("b".to_string(), zone("1", 10));
        assert!(SchedulerConfig::new("fake", zones).validate().is_err());

        let mut zones = BTreeMap::new();
        zones.insert("side yard".to_string(), zone("1", 10));
        assert!(SchedulerConfig::new("fake", zones).validate().is_err());
    }

    #[test]
    fn test_half_configured_location_is_rejected() {
        let mut config = SchedulerConfig::new("fake", BTreeMap::new());
        config.lat = Some("40.7".to_string());
        assert!(config.validate().is_err());

        config.long = Some("".to_string());
        assert!(config.validate().is_err());

        config.lat = Some("".to_string());
        assert!(config.validate().is_ok());
        assert_eq!(config.weather_location(), None);
    }

    #[test]
    fn test_config_roundtrip() {
        let config: SchedulerConfig = toml::from_str(SAMPLE).unwrap();
        let toml_str = toml::to_string(&config).unwrap();
        let parsed: SchedulerConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(config.zones, parsed.zones);
        assert_eq!(config.board, parsed.board);
    }
}
