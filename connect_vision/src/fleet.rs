// THEORY:
// The `fleet` module runs several machine monitors inside one process. Each
// machine gets its own tokio task owning its own `Monitor` and `FrameSource`;
// the tasks share nothing but the store handle and the shutdown signal.
//
// A machine whose session fails (an ROI that does not fit, even a panic) is
// reported in its own `MachineOutcome` and the others keep running. The fleet
// returns once every task has finished.
//
// `stop_on_signal` turns SIGINT and SIGTERM (what systemd sends on stop) into
// the shared shutdown signal, so every loop gets its final flush.

use crate::core_modules::event::MachineId;
use crate::error::VisionError;
use crate::frame::FrameSource;
use crate::monitor::{Monitor, SessionSummary};
use crate::store::MonitorStore;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{error, info};

/// A monitor paired with the frames it will consume.
pub struct MachineSession {
    pub monitor: Monitor,
    pub source: Box<dyn FrameSource>,
}

impl MachineSession {
    pub fn new(monitor: Monitor, source: impl FrameSource + 'static) -> Self {
        Self {
            monitor,
            source: Box::new(source),
        }
    }
}

/// How one machine's session ended.
#[derive(Debug)]
pub struct MachineOutcome {
    pub machine_id: MachineId,
    pub result: Result<SessionSummary, VisionError>,
}

#[derive(Default)]
pub struct Fleet {
    sessions: Vec<MachineSession>,
}

impl Fleet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, session: MachineSession) {
        self.sessions.push(session);
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Runs every session to completion. Outcomes are ordered by machine id.
    pub async fn run(
        self,
        store: Arc<dyn MonitorStore>,
        shutdown: watch::Receiver<bool>,
    ) -> Vec<MachineOutcome> {
        let mut tasks = JoinSet::new();
        let mut machines = HashMap::new();

        for session in self.sessions {
            let machine_id = session.monitor.machine_id();
            let store = Arc::clone(&store);
            let shutdown = shutdown.clone();
            let handle = tasks.spawn(async move {
                session.monitor.run(session.source, store, shutdown).await
            });
            machines.insert(handle.id(), machine_id);
        }
        info!(machines = machines.len(), "fleet started");

        let mut outcomes = Vec::with_capacity(machines.len());
        while let Some(joined) = tasks.join_next_with_id().await {
            let outcome = match joined {
                Ok((id, result)) => MachineOutcome {
                    machine_id: machines.get(&id).copied().unwrap_or_default(),
                    result,
                },
                Err(err) => {
                    let machine_id = machines.get(&err.id()).copied().unwrap_or_default();
                    error!(machine_id, error = %err, "monitor task aborted");
                    MachineOutcome {
                        machine_id,
                        result: Err(VisionError::FrameSource(format!("monitor task aborted: {err}"))),
                    }
                }
            };
            if let Err(err) = &outcome.result {
                error!(machine_id = outcome.machine_id, error = %err, "machine session failed");
            }
            outcomes.push(outcome);
        }

        outcomes.sort_by_key(|outcome| outcome.machine_id);
        outcomes
    }
}

/// Sends `true` on `stop` at the first SIGINT or SIGTERM.
///
/// The handlers are installed before this returns, so a signal that arrives
/// right after the call is not lost.
#[cfg(unix)]
pub fn stop_on_signal(stop: watch::Sender<bool>) -> std::io::Result<JoinHandle<()>> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    Ok(tokio::spawn(async move {
        let name = tokio::select! {
            _ = interrupt.recv() => "SIGINT",
            _ = terminate.recv() => "SIGTERM",
        };
        info!(signal = name, "shutdown requested");
        let _ = stop.send(true);
    }))
}

#[cfg(not(unix))]
pub fn stop_on_signal(stop: watch::Sender<bool>) -> std::io::Result<JoinHandle<()>> {
    Ok(tokio::spawn(async move {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "cannot listen for ctrl-c, stopping");
        }
        let _ = stop.send(true);
    }))
}
