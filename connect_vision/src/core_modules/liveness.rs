// THEORY:
// The `liveness` module is the server half of the heartbeat protocol. It is a pure
// function of (last_seen, now): a machine is online while its last heartbeat is
// younger than the online threshold. There is no cache and no memory; the dashboard
// calls it fresh on every poll, because staleness *is* the signal.
//
// The threshold and the heartbeat period are one design decision, not two: the
// threshold must be a whole number of periods and leave room for at least two
// missed beats (10 s and 30 s by default). `LivenessPolicy` only exists as a
// validated pair.

use crate::core_modules::event::MachineId;
use crate::core_modules::heartbeat::DEFAULT_HEARTBEAT_INTERVAL;
use crate::error::VisionError;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;

pub const DEFAULT_ONLINE_THRESHOLD: Duration = Duration::from_secs(30);

/// Missed beats the threshold must tolerate on top of the regular period.
const MIN_MISSED_BEATS: u128 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Liveness {
    Online,
    Offline,
}

impl Liveness {
    pub fn is_online(&self) -> bool {
        matches!(self, Liveness::Online)
    }
}

/// Derived online status of a machine. Never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct OnlineStatus {
    pub machine_id: MachineId,
    pub last_seen: Option<DateTime<Utc>>,
    pub online: bool,
}

/// The heartbeat period and online threshold, validated together.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LivenessPolicy {
    heartbeat_interval: Duration,
    online_threshold: Duration,
}

impl Default for LivenessPolicy {
    fn default() -> Self {
        Self {
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            online_threshold: DEFAULT_ONLINE_THRESHOLD,
        }
    }
}

impl LivenessPolicy {
    pub fn new(heartbeat_interval: Duration, online_threshold: Duration) -> Result<Self, VisionError> {
        let period = heartbeat_interval.as_millis();
        let threshold = online_threshold.as_millis();
        if period == 0 {
            return Err(VisionError::Config(
                "heartbeat interval must be greater than zero".to_string(),
            ));
        }
        if threshold % period != 0 {
            return Err(VisionError::Config(format!(
                "online threshold {online_threshold:?} is not a whole number of heartbeat periods ({heartbeat_interval:?})"
            )));
        }
        if threshold / period < 1 + MIN_MISSED_BEATS {
            return Err(VisionError::Config(format!(
                "online threshold {online_threshold:?} must cover at least {} heartbeat periods of {heartbeat_interval:?}",
                1 + MIN_MISSED_BEATS
            )));
        }
        Ok(Self {
            heartbeat_interval,
            online_threshold,
        })
    }

    pub fn from_secs(heartbeat_interval_secs: u64, online_threshold_secs: u64) -> Result<Self, VisionError> {
        Self::new(
            Duration::from_secs(heartbeat_interval_secs),
            Duration::from_secs(online_threshold_secs),
        )
    }

    pub fn heartbeat_interval(&self) -> Duration {
        self.heartbeat_interval
    }

    pub fn online_threshold(&self) -> Duration {
        self.online_threshold
    }

    /// ONLINE iff `now - last_seen < online_threshold`. A machine that never
    /// reported is OFFLINE. A `last_seen` ahead of `now` (clock skew) is ONLINE.
    pub fn classify(&self, last_seen: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Liveness {
        let Some(last_seen) = last_seen else {
            return Liveness::Offline;
        };
        let fresh = match (now - last_seen).to_std() {
            Ok(age) => age < self.online_threshold,
            Err(_) => true,
        };
        if fresh { Liveness::Online } else { Liveness::Offline }
    }

    pub fn status(
        &self,
        machine_id: MachineId,
        last_seen: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> OnlineStatus {
        OnlineStatus {
            machine_id,
            last_seen,
            online: self.classify(last_seen, now).is_online(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;

    fn start() -> DateTime<Utc> {
        DateTime::from_timestamp(1_717_000_000, 0).unwrap()
    }

    #[test]
    fn boundary_around_thirty_seconds() {
        let policy = LivenessPolicy::default();
        let seen = Some(start());
        assert_eq!(policy.classify(seen, start() + TimeDelta::seconds(29)), Liveness::Online);
        assert_eq!(policy.classify(seen, start() + TimeDelta::seconds(30)), Liveness::Offline);
        assert_eq!(policy.classify(seen, start() + TimeDelta::seconds(31)), Liveness::Offline);
        assert_eq!(
            policy.classify(seen, start() + TimeDelta::milliseconds(29_999)),
            Liveness::Online
        );
    }

    #[test]
    fn never_seen_is_offline() {
        let policy = LivenessPolicy::default();
        assert_eq!(policy.classify(None, start()), Liveness::Offline);
        let status = policy.status(14, None, start());
        assert!(!status.online);
        assert_eq!(status.machine_id, 14);
    }

    #[test]
    fn heartbeat_from_the_future_is_online() {
        let policy = LivenessPolicy::default();
        assert!(
            policy
                .classify(Some(start() + TimeDelta::seconds(2)), start())
                .is_online()
        );
    }

    #[test]
    fn policy_pairs_are_validated() {
        assert!(LivenessPolicy::from_secs(10, 30).is_ok());
        assert!(LivenessPolicy::from_secs(5, 30).is_ok());
        assert!(LivenessPolicy::from_secs(10, 60).is_ok());
        assert!(LivenessPolicy::from_secs(10, 20).is_err());
        assert!(LivenessPolicy::from_secs(10, 35).is_err());
        assert!(LivenessPolicy::from_secs(0, 30).is_err());
    }

    #[test]
    fn larger_threshold_keeps_machines_online_longer() {
        let policy = LivenessPolicy::from_secs(10, 60).unwrap();
        assert!(
            policy
                .classify(Some(start()), start() + TimeDelta::seconds(45))
                .is_online()
        );
    }

    #[test]
    fn status_serializes_for_the_dashboard() {
        let status = LivenessPolicy::default().status(14, Some(start()), start());
        let json = serde_json::to_value(status).unwrap();
        assert_eq!(json["machine_id"], 14);
        assert_eq!(json["online"], true);
        assert_eq!(
            serde_json::to_value(Liveness::Offline).unwrap(),
            serde_json::json!("OFFLINE")
        );
    }
}
