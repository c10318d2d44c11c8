//! # Sprinkler Core Library
//!
//! This library decides, once per tick, which single irrigation zone should be
//! watering. It keeps a per-day ledger of watered time on disk so daily quotas
//! and multi-day fairness survive restarts, and it nudges that ledger once a
//! day from the rain and temperature forecast.
//!
//! ## Design Philosophy
//!
//! ### One zone at a time
//! Household water pressure rarely supports more than one valve. The scheduler
//! therefore picks exactly one zone (or none) per tick and drives every other
//! valve off.
//!
//! ### The ledger is the schedule
//! There is no timetable. Each zone has a daily target in minutes; the ledger
//! records how long it actually ran today. Weather never touches the targets,
//! it only adds (rain) or removes (heat) ledger time, which shortens or extends
//! what the zone still needs.
//!
//! ### Data Flow
//! 1. **Accrue**: time since the last tick is credited to the running zone
//! 2. **Weather**: at most once a day, forecast rain and heat adjust the ledger
//! 3. **Select**: forced run, pause, start hour, then zone order against targets
//! 4. **Actuate**: pins are only touched when the selection changes
//!
//! ## Core Types
//!
//! - [`Readings`]: snapshot of today's progress used by the command endpoint
//! - [`ZoneReading`]: one zone's watered minutes against its target

use chrono::{DateTime, Local};
use serde::{Serialize, Serializer};
use serde_json::{Map, Value};

// Module declarations
pub mod adjust;
pub mod board;
pub mod command;
pub mod config;
#[cfg(all(target_os = "linux", feature = "hardware"))]
pub mod gpio;
pub mod http;
pub mod ledger;
pub mod order;
pub mod runner;
pub mod scheduler;
pub mod weather;

#[cfg(test)]
mod tests;

/// Ledger bucket that records whether today's weather adjustment already ran.
///
/// Zone names may not use this key.
pub const RAIN_SENSOR: &str = "rain_sensor";

/// Human-readable timestamp format used in readings and command replies.
pub const TIME_FORMAT: &str = "%a %b %e %H:%M:%S %Z %Y";

/// Progress of a single zone for the current day.
#[derive(Clone, Debug, PartialEq)]
pub struct ZoneReading {
    /// Zone name as configured
    pub name: String,
    /// Minutes credited today (may be negative after a rainy forecast)
    pub minutes_watered: f64,
    /// Daily target from the configuration
    pub configured_minutes: u32,
}

/// Point-in-time view of the scheduler.
///
/// Serializes to the flat key set used by the readings query:
/// `<zone>`, `<zone>-configured`, `running`, `pause_till`, `force_zone`,
/// `force_till` and `rain`.
///
/// # Example
/// ```
/// use sprinkler_lib::{Readings, ZoneReading};
///
/// let readings = Readings {
///     zones: vec![ZoneReading {
///         name: "lawn".to_string(),
///         minutes_watered: 2.5,
///         configured_minutes: 20,
///     }],
///     running: Some("lawn".to_string()),
///     pause_till: None,
///     force_zone: None,
///     force_till: None,
///     rain_minutes: 0.0,
///     observed_rain_mm: None,
/// };
///
/// let map = readings.to_map();
/// assert_eq!(map["lawn"], 2.5);
/// assert_eq!(map["lawn-configured"], 20);
/// assert_eq!(map["running"], "lawn");
/// assert_eq!(map["pause_till"], "");
/// ```
#[derive(Clone, Debug, PartialEq)]
pub struct Readings {
    /// Zones in scheduling order
    pub zones: Vec<ZoneReading>,
    /// Zone currently commanded on
    pub running: Option<String>,
    /// End of an active pause
    pub pause_till: Option<DateTime<Local>>,
    /// Zone pinned by an active forced run
    pub force_zone: Option<String>,
    /// End of the active forced run
    pub force_till: Option<DateTime<Local>>,
    /// Minutes recorded in the rain-sensor bucket today
    pub rain_minutes: f64,
    /// Observed precipitation over the last day, when a station is configured
    pub observed_rain_mm: Option<f64>,
}

impl Readings {
    /// Flatten into the readings key set.
    pub fn to_map(&self) -> Map<String, Value> {
        let mut map = Map::new();
        for zone in &self.zones {
            map.insert(zone.name.clone(), Value::from(zone.minutes_watered));
            map.insert(
                format!("{}-configured", zone.name),
                Value::from(zone.configured_minutes),
            );
        }

        let stamp = |t: &Option<DateTime<Local>>| {
            t.map(|t| t.format(TIME_FORMAT).to_string())
                .unwrap_or_default()
        };

        map.insert(
            "running".to_string(),
            Value::from(self.running.clone().unwrap_or_default()),
        );
        map.insert("pause_till".to_string(), Value::from(stamp(&self.pause_till)));
        map.insert(
            "force_zone".to_string(),
            Value::from(self.force_zone.clone().unwrap_or_default()),
        );
        map.insert("force_till".to_string(), Value::from(stamp(&self.force_till)));
        map.insert("rain".to_string(), Value::from(self.rain_minutes));
        if let Some(mm) = self.observed_rain_mm {
            map.insert("observed_rain".to_string(), Value::from(mm));
        }
        map
    }
}

impl Serialize for Readings {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_map().serialize(serializer)
    }
}
