pub mod cycle_state;
pub mod event;
pub mod heartbeat;
pub mod liveness;
pub mod presence_detector;
pub mod roi;
