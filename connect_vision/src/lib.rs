// THEORY:
// This file is the main entry point for the `connect_vision` library crate, the
// monitoring core for the plant's trimmer machines. A camera watches the chuck of
// each trimmer; this crate turns those frames into a durable record of every part
// cycle and a continuous "this machine is alive" signal.
//
// The public surface is small:
// - `Monitor` / `Fleet`: the per-machine loop and the process that runs several.
// - `MonitorStore`: the persistence contract, with a MySQL and an in-memory backend.
// - `LivenessPolicy`: the pure ONLINE / OFFLINE rule the dashboard applies.
// The building blocks in `core_modules` (presence detection, the cycle state
// machine, heartbeats) are public too, so each stage can be driven on its own.

pub mod config;
pub mod core_modules;
pub mod error;
pub mod fleet;
pub mod frame;
pub mod monitor;
pub mod store;

pub use config::MonitorConfig;
pub use core_modules::cycle_state::{CycleConfig, CycleState, CycleStateMachine};
pub use core_modules::event::{Event, EventType, MachineId};
pub use core_modules::heartbeat::HeartbeatEmitter;
pub use core_modules::liveness::{Liveness, LivenessPolicy, OnlineStatus};
pub use core_modules::presence_detector::PresenceSample;
pub use core_modules::roi::{DetectionConfig, Roi};
pub use error::VisionError;
pub use fleet::{Fleet, MachineOutcome, MachineSession, stop_on_signal};
pub use frame::{Frame, FrameIter, FrameSource, ImageSequence};
pub use monitor::{Monitor, MonitorSettings, SessionSummary, StopReason};
pub use store::{MemoryStore, MonitorStore, MySqlStore};
