// THEORY:
// The `store` module is the persistence contract between the edge monitor, the
// plant database, and the dashboard. The monitoring core only ever sees the
// `MonitorStore` trait; the relational details live in `mysql`, and `memory`
// provides the same behaviour in-process for tests and for running a monitor
// without a database.
//
// Every write is a single, independently committed statement. Nothing needs a
// transaction: event inserts are append-only and heartbeat updates are
// last-write-wins, so the two kinds of write commute.

pub mod memory;
pub mod mysql;

use crate::core_modules::event::{Event, MachineId};
use crate::core_modules::roi::DetectionConfig;
use crate::error::VisionError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::future::Future;
use std::time::Duration;

pub use memory::{ManualClock, MemoryStore};
pub use mysql::MySqlStore;

/// The liveness row of one machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LivenessRecord {
    pub machine_id: MachineId,
    pub name: Option<String>,
    /// Time of the most recent heartbeat, or `None` if the machine never reported.
    pub last_seen: Option<DateTime<Utc>>,
}

/// The calibration stored for a machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachineProfile {
    pub machine_id: MachineId,
    pub name: String,
    pub detection: DetectionConfig,
}

/// A periodic health snapshot of one monitor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Telemetry {
    pub machine_id: MachineId,
    pub cycles_last_hour: u32,
    pub uptime_seconds: u64,
    pub status: String,
}

#[async_trait]
pub trait MonitorStore: Send + Sync {
    /// Marks the machine as alive. The store stamps `last_seen` with its own
    /// clock and returns the stamped value.
    async fn record_heartbeat(&self, machine_id: MachineId) -> Result<DateTime<Utc>, VisionError>;

    async fn append_event(&self, event: &Event) -> Result<(), VisionError>;

    async fn record_telemetry(&self, telemetry: &Telemetry) -> Result<(), VisionError>;

    /// Liveness rows for every known machine, ordered by machine id.
    async fn liveness(&self) -> Result<Vec<LivenessRecord>, VisionError>;

    async fn last_event(&self, machine_id: MachineId) -> Result<Option<Event>, VisionError>;

    /// Records which edge device is watching a machine.
    async fn register_device(
        &self,
        machine_id: MachineId,
        device_id: &str,
        ip_address: Option<&str>,
    ) -> Result<(), VisionError>;

    async fn load_profile(&self, machine_id: MachineId) -> Result<Option<MachineProfile>, VisionError>;

    /// The production lot currently assigned to the machine, if any.
    async fn active_lot(&self, machine_id: MachineId) -> Result<Option<String>, VisionError>;

    /// The store's current time, from the same clock that stamps `last_seen`.
    async fn clock(&self) -> Result<DateTime<Utc>, VisionError>;
}

/// Runs a store call with an upper bound on how long it may take.
///
/// A hung connection turns into `PersistenceUnavailable` instead of stalling
/// the caller.
pub async fn bounded<T, F>(limit: Duration, call: F) -> Result<T, VisionError>
where
    F: Future<Output = Result<T, VisionError>>,
{
    tokio::time::timeout(limit, call).await?
}
