use super::{LivenessRecord, MachineProfile, MonitorStore, Telemetry};
use crate::core_modules::event::{Event, MachineId};
use crate::core_modules::roi::DetectionConfig;
use crate::error::VisionError;
use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// A shared, hand-driven clock for deterministic tests.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn set(&self, at: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = at;
    }

    pub fn advance(&self, by: TimeDelta) {
        let mut now = self.now.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *now += by;
    }
}

#[derive(Debug, Clone, Default)]
struct MachineRow {
    name: Option<String>,
    last_seen: Option<DateTime<Utc>>,
    device_id: Option<String>,
    ip_address: Option<String>,
    detection: Option<DetectionConfig>,
    active_lot: Option<String>,
}

#[derive(Debug, Default)]
struct Tables {
    machines: BTreeMap<MachineId, MachineRow>,
    events: Vec<Event>,
    telemetry: Vec<Telemetry>,
}

/// In-process `MonitorStore`.
///
/// Heartbeats upsert the machine row, so it also works with no machines
/// registered up front. `set_available(false)` makes every call fail with
/// `PersistenceUnavailable`, which is how tests simulate a lost database.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    tables: Arc<Mutex<Tables>>,
    available: Arc<AtomicBool>,
    clock: Option<ManualClock>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            tables: Arc::new(Mutex::new(Tables::default())),
            available: Arc::new(AtomicBool::new(true)),
            clock: None,
        }
    }

    /// A store whose heartbeat timestamps come from `clock`.
    pub fn with_clock(clock: ManualClock) -> Self {
        Self {
            clock: Some(clock),
            ..Self::new()
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Adds or replaces a machine row with its calibration.
    pub fn insert_machine(&self, machine_id: MachineId, name: &str, detection: Option<DetectionConfig>) {
        let mut tables = self.lock();
        let row = tables.machines.entry(machine_id).or_default();
        row.name = Some(name.to_string());
        row.detection = detection;
    }

    pub fn assign_lot(&self, machine_id: MachineId, lot: Option<&str>) {
        let mut tables = self.lock();
        tables.machines.entry(machine_id).or_default().active_lot = lot.map(str::to_string);
    }

    pub fn events(&self) -> Vec<Event> {
        self.lock().events.clone()
    }

    pub fn events_for(&self, machine_id: MachineId) -> Vec<Event> {
        self.lock()
            .events
            .iter()
            .filter(|event| event.machine_id == machine_id)
            .cloned()
            .collect()
    }

    pub fn telemetry(&self) -> Vec<Telemetry> {
        self.lock().telemetry.clone()
    }

    pub fn last_seen(&self, machine_id: MachineId) -> Option<DateTime<Utc>> {
        self.lock()
            .machines
            .get(&machine_id)
            .and_then(|row| row.last_seen)
    }

    pub fn device_of(&self, machine_id: MachineId) -> Option<(String, Option<String>)> {
        let tables = self.lock();
        let row = tables.machines.get(&machine_id)?;
        row.device_id
            .clone()
            .map(|device| (device, row.ip_address.clone()))
    }

    fn now(&self) -> DateTime<Utc> {
        match &self.clock {
            Some(clock) => clock.now(),
            None => Utc::now(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Tables> {
        self.tables
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn ensure_available(&self) -> Result<(), VisionError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(VisionError::PersistenceUnavailable(
                "memory store switched off".to_string(),
            ))
        }
    }
}

#[async_trait]
impl MonitorStore for MemoryStore {
    async fn clock(&self) -> Result<DateTime<Utc>, VisionError> {
        self.ensure_available()?;
        Ok(self.now())
    }

    async fn record_heartbeat(&self, machine_id: MachineId) -> Result<DateTime<Utc>, VisionError> {
        self.ensure_available()?;
        let now = self.now();
        self.lock().machines.entry(machine_id).or_default().last_seen = Some(now);
        Ok(now)
    }

    async fn append_event(&self, event: &Event) -> Result<(), VisionError> {
        self.ensure_available()?;
        self.lock().events.push(event.clone());
        Ok(())
    }

    async fn record_telemetry(&self, telemetry: &Telemetry) -> Result<(), VisionError> {
        self.ensure_available()?;
        self.lock().telemetry.push(telemetry.clone());
        Ok(())
    }

    async fn liveness(&self) -> Result<Vec<LivenessRecord>, VisionError> {
        self.ensure_available()?;
        Ok(self
            .lock()
            .machines
            .iter()
            .map(|(&machine_id, row)| LivenessRecord {
                machine_id,
                name: row.name.clone(),
                last_seen: row.last_seen,
            })
            .collect())
    }

    async fn last_event(&self, machine_id: MachineId) -> Result<Option<Event>, VisionError> {
        self.ensure_available()?;
        Ok(self
            .lock()
            .events
            .iter()
            .rev()
            .find(|event| event.machine_id == machine_id)
            .cloned())
    }

    async fn register_device(
        &self,
        machine_id: MachineId,
        device_id: &str,
        ip_address: Option<&str>,
    ) -> Result<(), VisionError> {
        self.ensure_available()?;
        let now = self.now();
        let mut tables = self.lock();
        let row = tables.machines.entry(machine_id).or_default();
        row.device_id = Some(device_id.to_string());
        row.ip_address = ip_address.map(str::to_string);
        row.last_seen = Some(now);
        Ok(())
    }

    async fn load_profile(&self, machine_id: MachineId) -> Result<Option<MachineProfile>, VisionError> {
        self.ensure_available()?;
        let tables = self.lock();
        Ok(tables.machines.get(&machine_id).and_then(|row| {
            row.detection.map(|detection| MachineProfile {
                machine_id,
                name: row.name.clone().unwrap_or_else(|| machine_id.to_string()),
                detection,
            })
        }))
    }

    async fn active_lot(&self, machine_id: MachineId) -> Result<Option<String>, VisionError> {
        self.ensure_available()?;
        Ok(self
            .lock()
            .machines
            .get(&machine_id)
            .and_then(|row| row.active_lot.clone()))
    }
}
