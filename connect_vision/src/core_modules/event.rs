use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Identifier of a machine row in the plant database.
pub type MachineId = u32;

/// The kind of lifecycle event a trimmer cycle can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    /// A part arrived in the chuck. Opens a new cycle.
    Place,
    /// The part stayed long enough to be trimming.
    Trim,
    /// The part left the chuck. Closes the cycle.
    Push,
    /// The presence sequence made no sense for the current state.
    Unknown,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Place => "place",
            EventType::Trim => "trim",
            EventType::Push => "push",
            EventType::Unknown => "unknown",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "place" => Ok(EventType::Place),
            "trim" => Ok(EventType::Trim),
            "push" => Ok(EventType::Push),
            "unknown" => Ok(EventType::Unknown),
            other => Err(format!("unknown event type `{other}`")),
        }
    }
}

/// An append-only record of one committed cycle transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub machine_id: MachineId,
    pub event_type: EventType,
    /// Millisecond-precision time of the sample that committed the transition.
    pub timestamp: DateTime<Utc>,
    /// Groups the place, trim and push of one part. Absent on `unknown` events
    /// raised outside a cycle.
    pub cycle_id: Option<u64>,
    pub metadata: serde_json::Value,
}

impl Event {
    /// Measured contour area carried in the metadata, if any.
    pub fn area(&self) -> Option<u32> {
        self.metadata
            .get("area")
            .and_then(|area| area.as_u64())
            .map(|area| area as u32)
    }

    pub fn req_lot(&self) -> Option<&str> {
        self.metadata.get("req_lot").and_then(|lot| lot.as_str())
    }
}
