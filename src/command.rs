//! JSON command surface.
//!
//! Commands arrive as loose JSON objects keyed by `cmd`:
//!
//! ```json
//! {"cmd": "order"}
//! {"cmd": "pause", "minutes": 30}
//! {"cmd": "run", "zone": "front", "minutes": 5}
//! {"cmd": "markZoneTime", "zone": "front", "minutes": -2.5}
//! ```
//!
//! Parsing separates "no such command" from "right command, bad arguments",
//! and the numeric checks that need no configuration happen here, before
//! the scheduler is touched.

use crate::ledger::try_from_minutes;
use crate::TIME_FORMAT;
use chrono::{DateTime, Duration, Local};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

const KNOWN: &[&str] = &["order", "pause", "run", "markZoneTime"];

#[derive(Error, Debug, PartialEq)]
pub enum CommandError {
    #[error("unrecognized command [{0}]")]
    Unrecognized(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(tag = "cmd", rename_all = "camelCase")]
pub enum Command {
    Order,
    Pause { minutes: f64 },
    Run { zone: String, minutes: f64 },
    MarkZoneTime { zone: String, minutes: f64 },
}

impl Command {
    /// Parse and validate a command object.
    pub fn from_json(value: &Value) -> Result<Self, CommandError> {
        let name = value.get("cmd").and_then(Value::as_str).unwrap_or_default();
        if !KNOWN.contains(&name) {
            return Err(CommandError::Unrecognized(name.to_string()));
        }

        let command: Command = serde_json::from_value(value.clone())
            .map_err(|e| CommandError::InvalidArgument(format!("{name}: {e}")))?;
        command.validate()?;
        Ok(command)
    }

    fn validate(&self) -> Result<(), CommandError> {
        match self {
            Command::Order => Ok(()),
            Command::Pause { minutes } | Command::Run { minutes, .. } => {
                checked_minutes(*minutes, false).map(drop)
            }
            Command::MarkZoneTime { minutes, .. } => checked_minutes(*minutes, true).map(drop),
        }
    }
}

/// Convert a minutes argument into a duration, rejecting non-finite or
/// out-of-range values and, unless `allow_negative`, negative ones.
pub fn checked_minutes(minutes: f64, allow_negative: bool) -> Result<Duration, CommandError> {
    if !minutes.is_finite() {
        return Err(CommandError::InvalidArgument(format!(
            "minutes must be a finite number, got {minutes}"
        )));
    }
    if minutes < 0.0 && !allow_negative {
        return Err(CommandError::InvalidArgument(format!(
            "minutes must not be negative, got {minutes}"
        )));
    }
    try_from_minutes(minutes)
        .ok_or_else(|| CommandError::InvalidArgument(format!("minutes out of range: {minutes}")))
}

/// Result object of a successful command.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum CommandResponse {
    Order { order: Vec<String> },
    Till { till: String },
    Empty {},
}

impl CommandResponse {
    pub fn till(t: DateTime<Local>) -> Self {
        CommandResponse::Till {
            till: t.format(TIME_FORMAT).to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_known_commands() {
        assert_eq!(Command::from_json(&json!({"cmd": "order"})), Ok(Command::Order));
        assert_eq!(
            Command::from_json(&json!({"cmd": "pause", "minutes": 30})),
            Ok(Command::Pause { minutes: 30.0 })
        );
        assert_eq!(
            Command::from_json(&json!({"cmd": "run", "zone": "a", "minutes": 1.5})),
            Ok(Command::Run {
                zone: "a".to_string(),
                minutes: 1.5
            })
        );
        assert_eq!(
            Command::from_json(&json!({"cmd": "markZoneTime", "zone": "a", "minutes": -2})),
            Ok(Command::MarkZoneTime {
                zone: "a".to_string(),
                minutes: -2.0
            })
        );
    }

    #[test]
    fn test_unknown_commands_are_unrecognized() {
        assert_eq!(
            Command::from_json(&json!({"cmd": "explode"})),
            Err(CommandError::Unrecognized("explode".to_string()))
        );
        assert!(matches!(
            Command::from_json(&json!({"minutes": 3})),
            Err(CommandError::Unrecognized(_))
        ));
        assert!(matches!(
            Command::from_json(&json!({"cmd": 7})),
            Err(CommandError::Unrecognized(_))
        ));
    }

    #[test]
    fn test_bad_arguments_are_invalid() {
        for bad in [
            json!({"cmd": "pause"}),
            json!({"cmd": "pause", "minutes": "ten"}),
            json!({"cmd": "pause", "minutes": -1}),
            json!({"cmd": "run", "minutes": 5}),
            json!({"cmd": "run", "zone": 3, "minutes": 5}),
            json!({"cmd": "markZoneTime", "zone": "a"}),
        ] {
            assert!(
                matches!(Command::from_json(&bad), Err(CommandError::InvalidArgument(_))),
                "{bad} should be invalid"
            );
        }
    }

    #[test]
    fn test_response_shapes() {
        let order = CommandResponse::Order {
            order: vec!["b".to_string(), "a".to_string()],
        };
        assert_eq!(serde_json::to_value(order).unwrap(), json!({"order": ["b", "a"]}));
        assert_eq!(serde_json::to_value(CommandResponse::Empty {}).unwrap(), json!({}));

        assert_eq!(checked_minutes(1.5, false), Ok(Duration::seconds(90)));
        assert_eq!(checked_minutes(-1.5, true), Ok(Duration::seconds(-90)));
        assert!(checked_minutes(f64::NAN, true).is_err());
        assert!(checked_minutes(1e13, false).is_err());
        assert!(checked_minutes(-1e13, true).is_err());

        let till = serde_json::to_value(CommandResponse::till(Local::now())).unwrap();
        assert!(till["till"].as_str().is_some_and(|s| !s.is_empty()));
    }
}
