// THEORY:
// The `cycle_state` module adds memory to the stateless presence detector. It turns
// a noisy per-frame "present / not present" signal into the discrete lifecycle of
// a part on a trimmer: it is placed, it is trimmed, it is pushed out.
//
// Key architectural principles:
// 1.  **Debounce first**: A change in presence only counts once it has held for
//     `debounce_samples` consecutive samples. A single-frame flicker from lighting
//     or camera jitter never reaches the state machine.
// 2.  **Pure transition table**: The lifecycle itself is the `transition` function,
//     a pure mapping from (state, stimulus) to (next state, emitted event). It can be
//     exercised directly without frames or clocks.
// 3.  **Dwell, not a sensor**: The camera cannot tell "placed" from "being trimmed".
//     A part that has stayed in the chuck for `trim_dwell` (measured on sample
//     timestamps) is considered trimming. A part removed before that still closes
//     its cycle with a `push`, flagged as an early removal.
// 4.  **Never crash on nonsense**: Contradictory stimuli and samples that go back
//     in time become `unknown` events. The loop keeps running.
// 5.  **Cycle grouping**: Every `place` opens a new `cycle_id`, strictly increasing
//     within the session, and the following `trim` and `push` reuse it.

use crate::core_modules::event::{Event, EventType, MachineId};
use crate::core_modules::presence_detector::PresenceSample;
use crate::error::VisionError;
use chrono::{DateTime, Utc};
use serde_json::json;
use std::fmt;
use std::time::Duration;
use tracing::warn;

pub const DEFAULT_DEBOUNCE_SAMPLES: u32 = 2;
pub const DEFAULT_TRIM_DWELL: Duration = Duration::from_millis(1000);

/// The high-level state of one trimmer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CycleState {
    Empty,
    Placed,
    Trimming,
}

impl CycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CycleState::Empty => "EMPTY",
            CycleState::Placed => "PLACED",
            CycleState::Trimming => "TRIMMING",
        }
    }

    pub fn is_occupied(&self) -> bool {
        !matches!(self, CycleState::Empty)
    }
}

impl fmt::Display for CycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What can happen to a trimmer between two samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stimulus {
    /// Debounced presence went from false to true.
    Arrived,
    /// Debounced presence went from true to false.
    Departed,
    /// The part has been in the chuck for at least the trim dwell.
    DwellElapsed,
}

impl fmt::Display for Stimulus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stimulus::Arrived => "arrived",
            Stimulus::Departed => "departed",
            Stimulus::DwellElapsed => "dwell elapsed",
        };
        f.write_str(name)
    }
}

/// The cycle lifecycle as a pure function.
pub fn transition(
    state: CycleState,
    stimulus: Stimulus,
) -> Result<(CycleState, Option<EventType>), VisionError> {
    match (state, stimulus) {
        (CycleState::Empty, Stimulus::Arrived) => Ok((CycleState::Placed, Some(EventType::Place))),
        (CycleState::Placed, Stimulus::DwellElapsed) => {
            Ok((CycleState::Trimming, Some(EventType::Trim)))
        }
        (CycleState::Placed | CycleState::Trimming, Stimulus::Departed) => {
            Ok((CycleState::Empty, Some(EventType::Push)))
        }
        // Dwell keeps ticking after trimming started, and means nothing while empty.
        (CycleState::Trimming | CycleState::Empty, Stimulus::DwellElapsed) => Ok((state, None)),
        (CycleState::Empty, Stimulus::Departed)
        | (CycleState::Placed | CycleState::Trimming, Stimulus::Arrived) => {
            Err(VisionError::UnrecognizedTransition {
                state: state.to_string(),
                edge: stimulus.to_string(),
            })
        }
    }
}

/// Tunables for the cycle state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleConfig {
    /// Consecutive samples a new presence value must hold before it is committed.
    pub debounce_samples: u32,
    /// Time a part must stay placed before it counts as trimming.
    pub trim_dwell: Duration,
}

impl Default for CycleConfig {
    fn default() -> Self {
        Self {
            debounce_samples: DEFAULT_DEBOUNCE_SAMPLES,
            trim_dwell: DEFAULT_TRIM_DWELL,
        }
    }
}

/// Filters single-sample flicker out of the raw presence signal.
#[derive(Debug, Clone)]
struct Debouncer {
    required: u32,
    stable: bool,
    streak: u32,
}

impl Debouncer {
    fn new(required: u32) -> Self {
        Self {
            required: required.max(1),
            stable: false,
            streak: 0,
        }
    }

    /// Feeds one raw value and returns the committed edge, if any.
    fn observe(&mut self, present: bool) -> Option<Stimulus> {
        if present == self.stable {
            self.streak = 0;
            return None;
        }
        self.streak += 1;
        if self.streak < self.required {
            return None;
        }
        self.stable = present;
        self.streak = 0;
        Some(if present {
            Stimulus::Arrived
        } else {
            Stimulus::Departed
        })
    }
}

/// Tracks one machine's cycle and emits an `Event` for every committed transition.
#[derive(Debug, Clone)]
pub struct CycleStateMachine {
    machine_id: MachineId,
    config: CycleConfig,
    debouncer: Debouncer,
    state: CycleState,
    /// Timestamp of the sample that moved the machine into its current state.
    entered_at: Option<DateTime<Utc>>,
    /// Timestamp of the `place` that opened the current cycle.
    placed_at: Option<DateTime<Utc>>,
    cycle_id: Option<u64>,
    last_cycle_id: Option<u64>,
    last_timestamp: Option<DateTime<Utc>>,
    completed_cycles: u64,
}

impl CycleStateMachine {
    pub fn new(machine_id: MachineId, config: CycleConfig) -> Self {
        Self {
            machine_id,
            config,
            debouncer: Debouncer::new(config.debounce_samples),
            state: CycleState::Empty,
            entered_at: None,
            placed_at: None,
            cycle_id: None,
            last_cycle_id: None,
            last_timestamp: None,
            completed_cycles: 0,
        }
    }

    pub fn machine_id(&self) -> MachineId {
        self.machine_id
    }

    pub fn state(&self) -> CycleState {
        self.state
    }

    /// The id of the cycle in progress, if a part is in the chuck.
    pub fn cycle_id(&self) -> Option<u64> {
        self.cycle_id
    }

    pub fn completed_cycles(&self) -> u64 {
        self.completed_cycles
    }

    /// Consumes one sample. Must be called in capture order.
    pub fn update(&mut self, sample: PresenceSample) -> Option<Event> {
        if let Some(last) = self.last_timestamp {
            if sample.timestamp < last {
                warn!(
                    machine_id = self.machine_id,
                    sample_at = %sample.timestamp,
                    last_at = %last,
                    "presence sample out of order, discarded"
                );
                return Some(self.event(
                    EventType::Unknown,
                    sample.timestamp,
                    json!({
                        "reason": "timestamp_regression",
                        "state": self.state.as_str(),
                        "area": sample.measured_area,
                    }),
                ));
            }
        }
        self.last_timestamp = Some(sample.timestamp);

        let stimulus = match self.debouncer.observe(sample.present) {
            Some(edge) => edge,
            None if self.state == CycleState::Placed && self.dwell_elapsed(sample.timestamp) => {
                Stimulus::DwellElapsed
            }
            None => return None,
        };

        let (next, emitted) = match transition(self.state, stimulus) {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!(machine_id = self.machine_id, error = %err, "contradictory presence sequence");
                return Some(self.event(
                    EventType::Unknown,
                    sample.timestamp,
                    json!({
                        "reason": err.to_string(),
                        "state": self.state.as_str(),
                        "area": sample.measured_area,
                    }),
                ));
            }
        };
        let event_type = emitted?;

        let metadata = match event_type {
            EventType::Place => {
                let cycle_id = self.next_cycle_id(sample.timestamp);
                self.cycle_id = Some(cycle_id);
                self.last_cycle_id = Some(cycle_id);
                self.placed_at = Some(sample.timestamp);
                json!({ "area": sample.measured_area })
            }
            EventType::Trim => json!({
                "area": sample.measured_area,
                "dwell_ms": self.millis_since(self.entered_at, sample.timestamp),
            }),
            EventType::Push => {
                self.completed_cycles += 1;
                json!({
                    "area": sample.measured_area,
                    "cycle_ms": self.millis_since(self.placed_at, sample.timestamp),
                    "early_removal": self.state == CycleState::Placed,
                })
            }
            EventType::Unknown => json!({ "state": self.state.as_str() }),
        };

        let event = self.event(event_type, sample.timestamp, metadata);

        self.state = next;
        self.entered_at = Some(sample.timestamp);
        if next == CycleState::Empty {
            self.cycle_id = None;
            self.placed_at = None;
        }

        Some(event)
    }

    fn dwell_elapsed(&self, now: DateTime<Utc>) -> bool {
        match self.entered_at {
            Some(entered) => (now - entered)
                .to_std()
                .map(|elapsed| elapsed >= self.config.trim_dwell)
                .unwrap_or(false),
            None => false,
        }
    }

    fn millis_since(&self, start: Option<DateTime<Utc>>, now: DateTime<Utc>) -> i64 {
        start
            .map(|start| (now - start).num_milliseconds())
            .unwrap_or(0)
    }

    /// Epoch milliseconds of the place, bumped past the previous id when two
    /// cycles start within the same millisecond.
    fn next_cycle_id(&self, placed_at: DateTime<Utc>) -> u64 {
        let millis = placed_at.timestamp_millis().max(0) as u64;
        match self.last_cycle_id {
            Some(previous) if millis <= previous => previous + 1,
            _ => millis,
        }
    }

    fn event(&self, event_type: EventType, timestamp: DateTime<Utc>, metadata: serde_json::Value) -> Event {
        Event {
            machine_id: self.machine_id,
            event_type,
            timestamp: truncate_to_millis(timestamp),
            cycle_id: self.cycle_id,
            metadata,
        }
    }
}

/// Events are stored with millisecond precision.
pub fn truncate_to_millis(timestamp: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(timestamp.timestamp_millis()).unwrap_or(timestamp)
}
