// THEORY:
// The `monitor` module is the top-level loop for one machine. It wires the stack
// together in a fixed order on every pass:
//
//   heartbeat due? -> next frame -> detect presence -> update cycle state
//   -> persist events -> telemetry due? -> sleep or stop
//
// Everything the loop knows lives in the `Monitor` value itself: the cycle state
// machine, the heartbeat schedule, the queue of events not yet stored, and the
// telemetry counters. Nothing is global, so two monitors in one process share
// only the store handle.
//
// Persistence never stops the loop. An event that cannot be written is kept in
// order in a bounded queue and retried on a fixed interval; heartbeats follow
// their own fixed period. A frame the source fails to deliver is retried the
// same way, with heartbeats still going out. The only things that end a session
// are a shutdown request, the frame source running dry, or an ROI that does not
// fit the frame.

use crate::core_modules::cycle_state::{CycleConfig, CycleState, CycleStateMachine};
use crate::core_modules::event::{Event, EventType, MachineId};
use crate::core_modules::heartbeat::HeartbeatEmitter;
use crate::core_modules::presence_detector::presence_detector;
use crate::core_modules::roi::DetectionConfig;
use crate::error::VisionError;
use crate::frame::{Frame, FrameSource};
use crate::store::{MonitorStore, Telemetry, bounded};
use chrono::{DateTime, TimeDelta, Utc};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Runtime tuning of one monitor loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorSettings {
    pub heartbeat_interval: Duration,
    /// Pause between frames. Zero processes frames back to back.
    pub frame_interval: Duration,
    /// Upper bound on any single store call.
    pub store_timeout: Duration,
    /// Fixed delay before a failed event write or frame read is attempted again.
    pub event_retry_interval: Duration,
    /// Consecutive failures after which an outage is logged as an error.
    pub failure_escalation: u32,
    pub telemetry_interval: Duration,
    /// Events kept while the store is unreachable. The oldest is dropped beyond this.
    pub max_pending_events: usize,
    pub cycle: CycleConfig,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(10),
            frame_interval: Duration::from_millis(100),
            store_timeout: Duration::from_secs(3),
            event_retry_interval: Duration::from_secs(1),
            failure_escalation: 5,
            telemetry_interval: Duration::from_secs(60),
            max_pending_events: 10_000,
            cycle: CycleConfig::default(),
        }
    }
}

/// Why a session ended without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Shutdown,
    FramesExhausted,
}

/// What a finished session did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSummary {
    pub machine_id: MachineId,
    pub stop_reason: StopReason,
    pub frames_processed: u64,
    pub completed_cycles: u64,
    pub final_state: CycleState,
    /// Events still unwritten after the final flush.
    pub pending_events: usize,
    /// Events discarded because the queue was full.
    pub dropped_events: u64,
}

/// The monitoring loop of one machine.
pub struct Monitor {
    machine_id: MachineId,
    detection: DetectionConfig,
    settings: MonitorSettings,
    cycle: CycleStateMachine,
    heartbeat: HeartbeatEmitter,
    /// Events in emission order, waiting to be written.
    pending: VecDeque<Event>,
    event_failures: u32,
    next_event_retry: Option<DateTime<Utc>>,
    dropped_events: u64,
    /// Consecutive frame reads that failed.
    frame_failures: u32,
    /// Lot the current cycle belongs to, looked up when the part was placed.
    current_lot: Option<String>,
    started_at: DateTime<Utc>,
    last_telemetry: Option<DateTime<Utc>>,
    /// Push times inside the telemetry window.
    recent_cycles: VecDeque<DateTime<Utc>>,
    frames_processed: u64,
}

impl Monitor {
    pub fn new(
        machine_id: MachineId,
        detection: DetectionConfig,
        settings: MonitorSettings,
        started_at: DateTime<Utc>,
    ) -> Self {
        let heartbeat = HeartbeatEmitter::new(machine_id, settings.heartbeat_interval)
            .with_call_timeout(settings.store_timeout)
            .with_escalation(settings.failure_escalation);
        Self {
            machine_id,
            detection,
            cycle: CycleStateMachine::new(machine_id, settings.cycle),
            heartbeat,
            pending: VecDeque::new(),
            event_failures: 0,
            next_event_retry: None,
            dropped_events: 0,
            frame_failures: 0,
            current_lot: None,
            started_at,
            last_telemetry: None,
            recent_cycles: VecDeque::new(),
            frames_processed: 0,
            settings,
        }
    }

    pub fn machine_id(&self) -> MachineId {
        self.machine_id
    }

    pub fn state(&self) -> CycleState {
        self.cycle.state()
    }

    pub fn pending_events(&self) -> usize {
        self.pending.len()
    }

    pub fn dropped_events(&self) -> u64 {
        self.dropped_events
    }

    pub fn heartbeat_emitter(&self) -> &HeartbeatEmitter {
        &self.heartbeat
    }

    /// Sends a heartbeat if one is due.
    pub async fn heartbeat(&mut self, store: &dyn MonitorStore, now: DateTime<Utc>) -> Option<bool> {
        self.heartbeat.tick(store, now).await
    }

    /// Runs one frame through detection and the cycle state machine, then tries
    /// to persist whatever is queued.
    ///
    /// Only a detection fault is returned as an error; store failures are absorbed
    /// by the retry queue.
    pub async fn process(
        &mut self,
        frame: &Frame,
        store: &dyn MonitorStore,
        now: DateTime<Utc>,
    ) -> Result<Option<Event>, VisionError> {
        let sample = presence_detector::detect(frame, &self.detection)?;
        self.frames_processed += 1;

        let emitted = match self.cycle.update(sample) {
            Some(event) => {
                let event = self.annotate(event, store).await;
                info!(
                    machine_id = self.machine_id,
                    event_type = %event.event_type,
                    cycle_id = ?event.cycle_id,
                    area = sample.measured_area,
                    state = self.cycle.state().as_str(),
                    "cycle transition"
                );
                self.enqueue(event.clone());
                Some(event)
            }
            None => None,
        };

        self.flush(store, now).await;
        Ok(emitted)
    }

    /// Writes queued events in order until the queue is empty or a write fails.
    ///
    /// After a failure nothing is attempted until `event_retry_interval` has
    /// passed. Returns how many events were written.
    pub async fn flush(&mut self, store: &dyn MonitorStore, now: DateTime<Utc>) -> usize {
        if self.pending.is_empty() {
            return 0;
        }
        if let Some(retry_at) = self.next_event_retry {
            if now < retry_at {
                return 0;
            }
        }

        let mut written = 0;
        while let Some(event) = self.pending.front() {
            let outcome = bounded(self.settings.store_timeout, store.append_event(event)).await;
            match outcome {
                Ok(()) => {
                    self.pending.pop_front();
                    written += 1;
                }
                Err(err) => {
                    self.event_failures += 1;
                    self.next_event_retry = Some(now + to_delta(self.settings.event_retry_interval));
                    if self.event_failures == self.settings.failure_escalation {
                        error!(
                            machine_id = self.machine_id,
                            failures = self.event_failures,
                            pending = self.pending.len(),
                            error = %err,
                            "event persistence keeps failing"
                        );
                    } else {
                        warn!(
                            machine_id = self.machine_id,
                            failures = self.event_failures,
                            pending = self.pending.len(),
                            error = %err,
                            "event write failed, will retry"
                        );
                    }
                    return written;
                }
            }
        }

        if self.event_failures > 0 {
            info!(
                machine_id = self.machine_id,
                failures = self.event_failures,
                written,
                "event persistence restored"
            );
        }
        self.event_failures = 0;
        self.next_event_retry = None;
        written
    }

    /// Records a telemetry snapshot if one is due.
    pub async fn telemetry(&mut self, store: &dyn MonitorStore, now: DateTime<Utc>) -> Option<bool> {
        let since = self.last_telemetry.unwrap_or(self.started_at);
        if now - since < to_delta(self.settings.telemetry_interval) {
            return None;
        }
        self.last_telemetry = Some(now);

        let snapshot = self.snapshot(now);
        match bounded(self.settings.store_timeout, store.record_telemetry(&snapshot)).await {
            Ok(()) => {
                debug!(
                    machine_id = self.machine_id,
                    cycles_last_hour = snapshot.cycles_last_hour,
                    uptime_seconds = snapshot.uptime_seconds,
                    "telemetry recorded"
                );
                Some(true)
            }
            Err(err) => {
                warn!(machine_id = self.machine_id, error = %err, "telemetry write failed");
                Some(false)
            }
        }
    }

    /// Health snapshot as of `now`. Cycles older than one hour are forgotten.
    pub fn snapshot(&mut self, now: DateTime<Utc>) -> Telemetry {
        while let Some(&oldest) = self.recent_cycles.front() {
            if now - oldest >= TimeDelta::hours(1) {
                self.recent_cycles.pop_front();
            } else {
                break;
            }
        }
        Telemetry {
            machine_id: self.machine_id,
            cycles_last_hour: self.recent_cycles.len() as u32,
            uptime_seconds: (now - self.started_at).num_seconds().max(0) as u64,
            status: "ONLINE".to_string(),
        }
    }

    /// Drives the loop until shutdown is requested or the source runs dry.
    pub async fn run<S>(
        mut self,
        mut source: S,
        store: Arc<dyn MonitorStore>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<SessionSummary, VisionError>
    where
        S: FrameSource,
    {
        info!(
            machine_id = self.machine_id,
            roi = %self.detection.roi,
            threshold = self.detection.threshold,
            min_area = self.detection.min_area,
            "monitor started"
        );

        let stop_reason = loop {
            let stopping = *shutdown.borrow();
            if stopping {
                break StopReason::Shutdown;
            }

            let now = Utc::now();
            self.heartbeat(store.as_ref(), now).await;

            let frame = match acquire(&mut source) {
                Ok(frame) => {
                    self.frame_recovered();
                    frame
                }
                Err(VisionError::FrameSourceExhausted) => break StopReason::FramesExhausted,
                Err(err) => {
                    self.frame_failed(&err);
                    self.flush(store.as_ref(), now).await;
                    if pause(&mut shutdown, self.settings.event_retry_interval).await {
                        break StopReason::Shutdown;
                    }
                    continue;
                }
            };

            if let Err(err) = self.process(&frame, store.as_ref(), now).await {
                error!(machine_id = self.machine_id, error = %err, "presence detection failed");
                self.final_flush(store.as_ref()).await;
                return Err(err);
            }

            self.telemetry(store.as_ref(), now).await;

            if !self.settings.frame_interval.is_zero()
                && pause(&mut shutdown, self.settings.frame_interval).await
            {
                break StopReason::Shutdown;
            }
        };

        self.final_flush(store.as_ref()).await;
        let summary = self.summary(stop_reason);
        info!(
            machine_id = summary.machine_id,
            reason = ?summary.stop_reason,
            frames = summary.frames_processed,
            cycles = summary.completed_cycles,
            unwritten = summary.pending_events,
            "monitor stopped"
        );
        Ok(summary)
    }

    pub fn summary(&self, stop_reason: StopReason) -> SessionSummary {
        SessionSummary {
            machine_id: self.machine_id,
            stop_reason,
            frames_processed: self.frames_processed,
            completed_cycles: self.cycle.completed_cycles(),
            final_state: self.cycle.state(),
            pending_events: self.pending.len(),
            dropped_events: self.dropped_events,
        }
    }

    /// One last write attempt that ignores the retry schedule.
    async fn final_flush(&mut self, store: &dyn MonitorStore) {
        self.next_event_retry = None;
        self.flush(store, Utc::now()).await;
        if !self.pending.is_empty() {
            warn!(
                machine_id = self.machine_id,
                unwritten = self.pending.len(),
                "stopping with events that were never stored"
            );
        }
    }

    fn frame_failed(&mut self, err: &VisionError) {
        self.frame_failures += 1;
        if self.frame_failures == self.settings.failure_escalation {
            error!(
                machine_id = self.machine_id,
                failures = self.frame_failures,
                error = %err,
                "frame acquisition keeps failing"
            );
        } else {
            warn!(
                machine_id = self.machine_id,
                failures = self.frame_failures,
                error = %err,
                "frame acquisition failed, will retry"
            );
        }
    }

    fn frame_recovered(&mut self) {
        if self.frame_failures > 0 {
            info!(
                machine_id = self.machine_id,
                failures = self.frame_failures,
                "frame acquisition restored"
            );
            self.frame_failures = 0;
        }
    }

    /// Attaches the production lot to cycle events.
    async fn annotate(&mut self, mut event: Event, store: &dyn MonitorStore) -> Event {
        match event.event_type {
            EventType::Place => {
                self.current_lot =
                    match bounded(self.settings.store_timeout, store.active_lot(self.machine_id)).await {
                        Ok(lot) => lot,
                        Err(err) => {
                            warn!(machine_id = self.machine_id, error = %err, "lot lookup failed");
                            None
                        }
                    };
            }
            EventType::Push => self.recent_cycles.push_back(event.timestamp),
            EventType::Trim | EventType::Unknown => {}
        }

        if let (Some(lot), Value::Object(fields)) = (&self.current_lot, &mut event.metadata) {
            fields.insert("req_lot".to_string(), Value::String(lot.clone()));
        }
        if event.event_type == EventType::Push {
            self.current_lot = None;
        }
        event
    }

    fn enqueue(&mut self, event: Event) {
        if self.pending.len() >= self.settings.max_pending_events {
            if let Some(dropped) = self.pending.pop_front() {
                self.dropped_events += 1;
                error!(
                    machine_id = self.machine_id,
                    event_type = %dropped.event_type,
                    cycle_id = ?dropped.cycle_id,
                    dropped = self.dropped_events,
                    "event queue full, oldest event discarded"
                );
            }
        }
        self.pending.push_back(event);
    }
}

/// Reads one frame. On a multi-threaded runtime the worker is handed off for the
/// duration of the read so other machines' tasks keep running.
fn acquire<S: FrameSource>(source: &mut S) -> Result<Frame, VisionError> {
    match Handle::try_current().map(|handle| handle.runtime_flavor()) {
        Ok(RuntimeFlavor::MultiThread) => tokio::task::block_in_place(|| source.next_frame()),
        _ => source.next_frame(),
    }
}

/// Waits for `period`. Returns true when the shutdown sender is gone; a sent
/// stop request is picked up at the top of the loop.
async fn pause(shutdown: &mut watch::Receiver<bool>, period: Duration) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(period) => false,
        changed = shutdown.changed() => changed.is_err(),
    }
}

fn to_delta(duration: Duration) -> TimeDelta {
    TimeDelta::from_std(duration).unwrap_or(TimeDelta::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_modules::roi::Roi;
    use crate::frame::FrameIter;
    use crate::store::MemoryStore;
    use image::{DynamicImage, GrayImage, Luma};

    fn start() -> DateTime<Utc> {
        DateTime::from_timestamp(1_717_000_000, 0).unwrap()
    }

    fn detection() -> DetectionConfig {
        DetectionConfig {
            roi: Roi::new(10, 10, 20, 20),
            threshold: 100,
            min_area: 50,
        }
    }

    fn frame(present: bool, at: DateTime<Utc>) -> Frame {
        let mut image = GrayImage::new(40, 40);
        if present {
            for y in 12..24 {
                for x in 12..24 {
                    image.put_pixel(x, y, Luma([255]));
                }
            }
        }
        Frame {
            image: DynamicImage::ImageLuma8(image),
            captured_at: at,
        }
    }

    fn settings() -> MonitorSettings {
        MonitorSettings {
            frame_interval: Duration::ZERO,
            store_timeout: Duration::from_millis(500),
            ..MonitorSettings::default()
        }
    }

    fn monitor() -> Monitor {
        Monitor::new(14, detection(), settings(), start())
    }

    /// Feeds presence flags at 100 ms spacing from `first_ms` and collects emitted events.
    async fn feed(monitor: &mut Monitor, store: &MemoryStore, first_ms: i64, flags: &[bool]) -> Vec<Event> {
        let mut events = Vec::new();
        for (i, &present) in flags.iter().enumerate() {
            let at = start() + TimeDelta::milliseconds(first_ms + 100 * i as i64);
            if let Some(event) = monitor.process(&frame(present, at), store, at).await.unwrap() {
                events.push(event);
            }
        }
        events
    }

    #[tokio::test]
    async fn short_visit_persists_place_and_push() {
        let store = MemoryStore::new();
        let mut monitor = monitor();
        let events = feed(
            &mut monitor,
            &store,
            0,
            &[false, true, true, true, true, true, false, false, false],
        )
        .await;

        let kinds: Vec<_> = events.iter().map(|event| event.event_type).collect();
        assert_eq!(kinds, vec![EventType::Place, EventType::Push]);
        assert_eq!(events[0].cycle_id, events[1].cycle_id);
        assert_eq!(store.events(), events);
        assert_eq!(monitor.state(), CycleState::Empty);
    }

    #[tokio::test]
    async fn outage_keeps_events_in_order_and_retries_on_schedule() {
        let store = MemoryStore::new();
        store.set_available(false);
        let mut monitor = monitor();

        feed(&mut monitor, &store, 0, &[true, true, true, false, false]).await;
        assert_eq!(monitor.pending_events(), 2);
        assert!(store.events().is_empty());

        store.set_available(true);
        // Still inside the retry interval of the failure at 100 ms.
        let early = start() + TimeDelta::milliseconds(900);
        assert_eq!(monitor.flush(&store, early).await, 0);

        let due = start() + TimeDelta::milliseconds(1_400);
        assert_eq!(monitor.flush(&store, due).await, 2);
        let kinds: Vec<_> = store.events().iter().map(|event| event.event_type).collect();
        assert_eq!(kinds, vec![EventType::Place, EventType::Push]);
        assert_eq!(monitor.pending_events(), 0);
    }

    #[tokio::test]
    async fn full_queue_drops_the_oldest_event() {
        let store = MemoryStore::new();
        store.set_available(false);
        let mut monitor = Monitor::new(
            14,
            detection(),
            MonitorSettings {
                max_pending_events: 3,
                ..settings()
            },
            start(),
        );

        feed(
            &mut monitor,
            &store,
            0,
            &[true, true, false, false, true, true, false, false],
        )
        .await;

        assert_eq!(monitor.pending_events(), 3);
        assert_eq!(monitor.dropped_events(), 1);
    }

    #[tokio::test]
    async fn placed_part_picks_up_the_active_lot() {
        let store = MemoryStore::new();
        store.assign_lot(14, Some("LOT-2024-118"));
        let mut monitor = monitor();

        feed(&mut monitor, &store, 0, &[true, true, false, false]).await;
        store.assign_lot(14, None);
        feed(&mut monitor, &store, 400, &[true, true]).await;

        let events = store.events();
        assert_eq!(events[0].req_lot(), Some("LOT-2024-118"));
        assert_eq!(events[1].req_lot(), Some("LOT-2024-118"));
        assert_eq!(events[2].event_type, EventType::Place);
        assert_eq!(events[2].req_lot(), None);
    }

    #[tokio::test]
    async fn roi_outside_the_frame_is_reported() {
        let store = MemoryStore::new();
        let mut monitor = Monitor::new(
            14,
            DetectionConfig {
                roi: Roi::new(30, 30, 20, 20),
                ..detection()
            },
            settings(),
            start(),
        );
        let err = monitor
            .process(&frame(true, start()), &store, start())
            .await
            .unwrap_err();
        assert!(matches!(err, VisionError::InvalidRoi { .. }));
    }

    #[tokio::test]
    async fn telemetry_counts_cycles_in_the_last_hour() {
        let store = MemoryStore::new();
        let mut monitor = monitor();
        feed(&mut monitor, &store, 0, &[true, true, false, false]).await;

        assert_eq!(monitor.telemetry(&store, start() + TimeDelta::seconds(30)).await, None);
        assert_eq!(
            monitor.telemetry(&store, start() + TimeDelta::seconds(60)).await,
            Some(true)
        );
        let snapshot = monitor.snapshot(start() + TimeDelta::minutes(61));
        assert_eq!(snapshot.cycles_last_hour, 0);
        assert_eq!(snapshot.uptime_seconds, 61 * 60);

        let recorded = store.telemetry();
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].cycles_last_hour, 1);
        assert_eq!(recorded[0].uptime_seconds, 60);
    }

    #[tokio::test]
    async fn run_stops_when_frames_run_out() {
        let store = MemoryStore::new();
        let (_stop, shutdown) = watch::channel(false);
        let frames: Vec<Frame> = [false, true, true, true, false, false]
            .into_iter()
            .enumerate()
            .map(|(i, present)| frame(present, start() + TimeDelta::milliseconds(100 * i as i64)))
            .collect();

        let summary = monitor()
            .run(FrameIter::new(frames), Arc::new(store.clone()), shutdown)
            .await
            .unwrap();

        assert_eq!(summary.stop_reason, StopReason::FramesExhausted);
        assert_eq!(summary.frames_processed, 6);
        assert_eq!(summary.completed_cycles, 1);
        assert_eq!(summary.pending_events, 0);
        assert_eq!(store.events().len(), 2);
        assert!(store.last_seen(14).is_some());
    }

    #[tokio::test]
    async fn run_honours_a_shutdown_request() {
        let store = MemoryStore::new();
        let (stop, shutdown) = watch::channel(false);
        let frames = std::iter::repeat_with(|| frame(false, Utc::now()));
        let mut settings = settings();
        settings.frame_interval = Duration::from_millis(10);

        let task = tokio::spawn(
            Monitor::new(14, detection(), settings, Utc::now()).run(
                FrameIter::new(frames),
                Arc::new(store),
                shutdown,
            ),
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
        stop.send(true).unwrap();

        let summary = task.await.unwrap().unwrap();
        assert_eq!(summary.stop_reason, StopReason::Shutdown);
        assert!(summary.frames_processed > 0);
    }

    /// Hands out frames and failures in a fixed order, then runs dry.
    struct Scripted(VecDeque<Result<Frame, VisionError>>);

    impl FrameSource for Scripted {
        fn next_frame(&mut self) -> Result<Frame, VisionError> {
            self.0
                .pop_front()
                .unwrap_or(Err(VisionError::FrameSourceExhausted))
        }
    }

    /// A camera that never delivers.
    struct Unplugged;

    impl FrameSource for Unplugged {
        fn next_frame(&mut self) -> Result<Frame, VisionError> {
            Err(VisionError::FrameSource("camera 0 returned no frame".to_string()))
        }
    }

    /// Blocks the calling thread like a camera read.
    struct SlowCamera {
        remaining: u32,
    }

    impl FrameSource for SlowCamera {
        fn next_frame(&mut self) -> Result<Frame, VisionError> {
            if self.remaining == 0 {
                return Err(VisionError::FrameSourceExhausted);
            }
            self.remaining -= 1;
            std::thread::sleep(Duration::from_millis(200));
            Ok(frame(false, Utc::now()))
        }
    }

    #[tokio::test]
    async fn dropped_frame_is_retried_and_the_session_goes_on() {
        let store = MemoryStore::new();
        let (_stop, shutdown) = watch::channel(false);
        let flags = [false, false, true, true, true, true, false, false, false, false];
        let mut script: VecDeque<_> = flags
            .iter()
            .enumerate()
            .map(|(i, &present)| Ok(frame(present, start() + TimeDelta::milliseconds(100 * i as i64))))
            .collect();
        script[2] = Err(VisionError::FrameSource("camera 0 returned no frame".to_string()));
        let settings = MonitorSettings {
            event_retry_interval: Duration::from_millis(5),
            ..settings()
        };

        let summary = Monitor::new(14, detection(), settings, start())
            .run(Scripted(script), Arc::new(store.clone()), shutdown)
            .await
            .unwrap();

        assert_eq!(summary.stop_reason, StopReason::FramesExhausted);
        assert_eq!(summary.frames_processed, 9);
        assert_eq!(summary.completed_cycles, 1);
        let kinds: Vec<_> = store.events().iter().map(|event| event.event_type).collect();
        assert_eq!(kinds, vec![EventType::Place, EventType::Push]);
    }

    #[tokio::test]
    async fn heartbeats_continue_while_the_camera_is_down() {
        let store = MemoryStore::new();
        let (stop, shutdown) = watch::channel(false);
        let settings = MonitorSettings {
            heartbeat_interval: Duration::from_millis(10),
            event_retry_interval: Duration::from_millis(5),
            failure_escalation: 3,
            ..settings()
        };
        let begun = Utc::now();

        let task = tokio::spawn(Monitor::new(14, detection(), settings, begun).run(
            Unplugged,
            Arc::new(store.clone()),
            shutdown,
        ));
        tokio::time::sleep(Duration::from_millis(100)).await;
        stop.send(true).unwrap();

        let summary = task.await.unwrap().unwrap();
        assert_eq!(summary.stop_reason, StopReason::Shutdown);
        assert_eq!(summary.frames_processed, 0);
        let last_seen = store.last_seen(14).unwrap();
        assert!(last_seen - begun >= TimeDelta::milliseconds(30));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn slow_capture_does_not_hold_up_other_tasks() {
        let store = MemoryStore::new();
        let (_stop, shutdown) = watch::channel(false);
        let session = tokio::spawn(monitor().run(
            SlowCamera { remaining: 3 },
            Arc::new(store),
            shutdown,
        ));
        tokio::time::sleep(Duration::from_millis(20)).await;

        let begun = std::time::Instant::now();
        let other = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            begun.elapsed()
        });
        assert!(other.await.unwrap() < Duration::from_millis(100));

        let summary = session.await.unwrap().unwrap();
        assert_eq!(summary.frames_processed, 3);
    }

    /// Runs a place/push visit while the store is down, then requests a stop.
    /// With `restore` the store comes back just before the stop request, long
    /// before the next scheduled retry.
    async fn stop_during_outage(restore: bool) -> (SessionSummary, MemoryStore) {
        let store = MemoryStore::new();
        store.set_available(false);
        let (stop, shutdown) = watch::channel(false);
        let settings = MonitorSettings {
            frame_interval: Duration::from_millis(5),
            event_retry_interval: Duration::from_secs(3600),
            ..settings()
        };
        let visit = [true, true, true]
            .into_iter()
            .chain(std::iter::repeat(false))
            .map(|present| frame(present, Utc::now()));

        let task = tokio::spawn(Monitor::new(14, detection(), settings, Utc::now()).run(
            FrameIter::new(visit),
            Arc::new(store.clone()),
            shutdown,
        ));
        tokio::time::sleep(Duration::from_millis(100)).await;
        if restore {
            store.set_available(true);
        }
        stop.send(true).unwrap();

        (task.await.unwrap().unwrap(), store)
    }

    #[tokio::test]
    async fn shutdown_writes_the_backlog_once_the_store_is_back() {
        let (summary, store) = stop_during_outage(true).await;

        assert_eq!(summary.stop_reason, StopReason::Shutdown);
        assert_eq!(summary.completed_cycles, 1);
        assert_eq!(summary.pending_events, 0);
        let kinds: Vec<_> = store.events().iter().map(|event| event.event_type).collect();
        assert_eq!(kinds, vec![EventType::Place, EventType::Push]);
    }

    #[tokio::test]
    async fn shutdown_reports_events_it_could_not_write() {
        let (summary, store) = stop_during_outage(false).await;

        assert_eq!(summary.stop_reason, StopReason::Shutdown);
        assert_eq!(summary.pending_events, 2);
        assert!(store.events().is_empty());
    }
}
