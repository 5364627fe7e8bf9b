//! Core types for the charging protocol

use serde::{Deserialize, Serialize};
use std::fmt;

/// Upper bound for a charging target, in percent
pub const MAX_TARGET_PERCENTAGE: u8 = 100;

/// Longest session the controller ever grants, in seconds
pub const MAX_SESSION_SECS: u64 = 30 * 60;

/// Identifier of a car (free-form, chosen by the driver)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CarId(pub String);

impl CarId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CarId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CarId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Identifier of a charger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChargerId(pub u32);

impl fmt::Display for ChargerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a charging station (a group of chargers)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StationId(pub u32);

impl fmt::Display for StationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a reservation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReservationId(pub u64);

impl fmt::Display for ReservationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Commands published to a charger topic
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum ChargerCommand {
    /// Admission granted: charge `car_id` up to `battery_target` for at most
    /// `max_charging_time` seconds
    StartCharging {
        car_id: CarId,
        battery_target: u8,
        max_charging_time: u64,
    },

    /// Finish the running session
    StopCharging,

    /// Battery level reported by the car being charged
    BatteryUpdate { percentage: u8 },
}

/// Commands published to a car topic
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum CarCommand {
    /// The charger started delivering energy
    StartCharging { charger_id: ChargerId },

    /// The charger finished the session
    StopCharging,
}

macro_rules! json_codec {
    ($ty:ty) => {
        impl $ty {
            /// Serialize command to JSON bytes
            pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
                serde_json::to_vec(self)
            }

            /// Deserialize command from JSON bytes
            pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
                serde_json::from_slice(bytes)
            }
        }
    };
}

json_codec!(ChargerCommand);
json_codec!(CarCommand);

/// Coarse classification shared by every error in the system
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Bad request shape or business rule violation
    Validation,
    /// Referenced entity does not exist
    NotFound,
    /// Request lost against concurrent or existing state
    Conflict,
    /// A collaborator could not be reached
    Connectivity,
    /// Anything else
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Validation => write!(f, "validation"),
            ErrorKind::NotFound => write!(f, "not_found"),
            ErrorKind::Conflict => write!(f, "conflict"),
            ErrorKind::Connectivity => write!(f, "connectivity"),
            ErrorKind::Internal => write!(f, "internal"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_charger_command_wire_format() {
        let cmd = ChargerCommand::StartCharging {
            car_id: CarId::new("car-A"),
            battery_target: 80,
            max_charging_time: 1200,
        };

        let value: serde_json::Value = serde_json::from_slice(&cmd.to_bytes().unwrap()).unwrap();
        assert_eq!(
            value,
            serde_json::json!({
                "command": "start_charging",
                "car_id": "car-A",
                "battery_target": 80,
                "max_charging_time": 1200,
            })
        );

        let stop = serde_json::to_value(ChargerCommand::StopCharging).unwrap();
        assert_eq!(stop, serde_json::json!({ "command": "stop_charging" }));
    }

    #[test]
    fn test_car_command_parsing() {
        let cmd = CarCommand::from_bytes(br#"{"command":"start_charging","charger_id":3}"#).unwrap();
        assert_eq!(cmd, CarCommand::StartCharging { charger_id: ChargerId(3) });

        // Extra fields are tolerated, unknown commands are not
        let cmd = CarCommand::from_bytes(br#"{"command":"stop_charging","reason":"done"}"#).unwrap();
        assert_eq!(cmd, CarCommand::StopCharging);
        assert!(CarCommand::from_bytes(br#"{"command":"battery_update","percentage":4}"#).is_err());
        assert!(CarCommand::from_bytes(b"not json").is_err());
    }

    #[test]
    fn test_battery_update_parsing() {
        let cmd = ChargerCommand::from_bytes(br#"{"command":"battery_update","percentage":42}"#).unwrap();
        assert_eq!(cmd, ChargerCommand::BatteryUpdate { percentage: 42 });
    }
}
