// THEORY:
// The `HeartbeatEmitter` is the edge half of the liveness protocol. It tells the
// database "this machine's monitor is alive" on a fixed period, whether or not any
// part has moved. The dashboard never looks at events to decide if a machine is
// online; it only looks at how old the last heartbeat is.
//
// Retry policy: none beyond the schedule itself. A failed heartbeat is logged and
// the next attempt happens one period later, exactly as a successful one would.
// Missing a beat only costs a few seconds of apparent offline time, and a fixed
// period keeps that latency predictable.

use crate::core_modules::event::MachineId;
use crate::store::{MonitorStore, bounded};
use chrono::{DateTime, Utc};
use std::time::Duration;
use tracing::{debug, error, info, warn};

pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);

/// Emits periodic liveness signals for one machine.
#[derive(Debug, Clone)]
pub struct HeartbeatEmitter {
    machine_id: MachineId,
    /// Fixed period between attempts.
    interval: Duration,
    /// Upper bound on a single store call.
    call_timeout: Duration,
    /// Consecutive failures after which the outage is escalated to an operator.
    escalate_after: u32,
    /// Local time of the last attempt, successful or not.
    last_attempt: Option<DateTime<Utc>>,
    /// Local time of the last successful emission.
    last_success: Option<DateTime<Utc>>,
    /// The `last_seen` value the store recorded on the last success.
    last_recorded: Option<DateTime<Utc>>,
    consecutive_failures: u32,
}

impl HeartbeatEmitter {
    pub fn new(machine_id: MachineId, interval: Duration) -> Self {
        Self {
            machine_id,
            interval,
            call_timeout: Duration::from_secs(3),
            escalate_after: 5,
            last_attempt: None,
            last_success: None,
            last_recorded: None,
            consecutive_failures: 0,
        }
    }

    pub fn with_call_timeout(mut self, call_timeout: Duration) -> Self {
        self.call_timeout = call_timeout;
        self
    }

    pub fn with_escalation(mut self, escalate_after: u32) -> Self {
        self.escalate_after = escalate_after.max(1);
        self
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn last_success(&self) -> Option<DateTime<Utc>> {
        self.last_success
    }

    pub fn last_recorded(&self) -> Option<DateTime<Utc>> {
        self.last_recorded
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// True on the first call, then once per interval after the last attempt.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        match self.last_attempt {
            None => true,
            Some(last) => (now - last)
                .to_std()
                .map(|elapsed| elapsed >= self.interval)
                .unwrap_or(false),
        }
    }

    /// Emits if a heartbeat is due. Returns `None` when nothing was due.
    pub async fn tick(&mut self, store: &dyn MonitorStore, now: DateTime<Utc>) -> Option<bool> {
        if self.is_due(now) {
            Some(self.emit(store, now).await)
        } else {
            None
        }
    }

    /// Sends one heartbeat now. Never fails; returns whether the store accepted it.
    pub async fn emit(&mut self, store: &dyn MonitorStore, now: DateTime<Utc>) -> bool {
        self.last_attempt = Some(now);

        match bounded(self.call_timeout, store.record_heartbeat(self.machine_id)).await {
            Ok(recorded) => {
                if self.consecutive_failures >= self.escalate_after {
                    info!(
                        machine_id = self.machine_id,
                        missed = self.consecutive_failures,
                        "heartbeat restored"
                    );
                }
                debug!(machine_id = self.machine_id, last_seen = %recorded, "heartbeat sent");
                self.consecutive_failures = 0;
                self.last_success = Some(now);
                self.last_recorded = Some(recorded);
                true
            }
            Err(err) => {
                self.consecutive_failures += 1;
                if self.consecutive_failures == self.escalate_after {
                    error!(
                        machine_id = self.machine_id,
                        failures = self.consecutive_failures,
                        error = %err,
                        "heartbeats keep failing, machine will show offline on the dashboard"
                    );
                } else {
                    warn!(
                        machine_id = self.machine_id,
                        failures = self.consecutive_failures,
                        error = %err,
                        "heartbeat failed, retrying next period"
                    );
                }
                false
            }
        }
    }
}
