#[cfg(feature = "camera")]
mod camera;

use anyhow::{Context, bail};
use clap::Parser;
use connect_vision::config::{FrameSettings, MachineSettings};
use connect_vision::store::bounded;
use connect_vision::{
    DetectionConfig, Fleet, FrameSource, ImageSequence, MachineSession, MemoryStore, Monitor,
    MonitorConfig, MonitorStore, MySqlStore, stop_on_signal,
};
use chrono::Utc;
use std::net::UdpSocket;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Watches trimmer chucks and records every part cycle.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the monitor's TOML configuration.
    #[arg(short, long, default_value = "/etc/connect-vision/monitor.toml")]
    config: PathBuf,

    /// Only run these machines from the configuration. Repeatable.
    #[arg(long = "machine-id")]
    machine_ids: Vec<u32>,

    /// Overrides `database.url` from the configuration.
    #[arg(long)]
    database_url: Option<String>,

    /// Identifier this device registers under. Defaults to the host name.
    #[arg(long)]
    device_id: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let mut config = MonitorConfig::load(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    if let Some(url) = &args.database_url {
        config.database.url = Some(url.clone());
    }
    let machines = selected_machines(&config, &args.machine_ids)?;

    let store: Arc<dyn MonitorStore> = match &config.database.url {
        Some(url) => Arc::new(
            MySqlStore::connect_lazy(url, config.database.timeout())
                .context("invalid database url")?,
        ),
        None => {
            warn!("no database configured, events and heartbeats are kept in memory only");
            Arc::new(MemoryStore::new())
        }
    };

    let device_id = args.device_id.clone().unwrap_or_else(host_name);
    let ip_address = local_ip();
    let settings = config.monitor_settings();
    let timeout = config.database.timeout();

    let mut fleet = Fleet::new();
    for machine in machines {
        register(store.as_ref(), &machine, &device_id, ip_address.as_deref(), timeout).await;
        let detection = resolve_detection(store.as_ref(), &machine, timeout).await?;
        let source = open_source(&machine.frames)
            .with_context(|| format!("opening frames for machine {}", machine.machine_id))?;
        info!(
            machine_id = machine.machine_id,
            name = machine.name.as_deref().unwrap_or(""),
            roi = %detection.roi,
            "machine ready"
        );
        let monitor = Monitor::new(machine.machine_id, detection, settings.clone(), Utc::now());
        fleet.add(MachineSession {
            monitor,
            source,
        });
    }

    let (stop, shutdown) = watch::channel(false);
    stop_on_signal(stop).context("installing signal handlers")?;

    let outcomes = fleet.run(Arc::clone(&store), shutdown).await;

    let mut failed = 0;
    for outcome in &outcomes {
        match &outcome.result {
            Ok(summary) => info!(
                machine_id = summary.machine_id,
                reason = ?summary.stop_reason,
                cycles = summary.completed_cycles,
                frames = summary.frames_processed,
                unwritten = summary.pending_events,
                "session summary"
            ),
            Err(_) => failed += 1,
        }
    }
    if failed > 0 {
        bail!("{failed} of {} machine sessions failed", outcomes.len());
    }
    Ok(())
}

fn selected_machines(config: &MonitorConfig, only: &[u32]) -> anyhow::Result<Vec<MachineSettings>> {
    let machines: Vec<MachineSettings> = config
        .machines
        .iter()
        .filter(|machine| only.is_empty() || only.contains(&machine.machine_id))
        .cloned()
        .collect();
    if let Some(missing) = only
        .iter()
        .find(|id| !machines.iter().any(|machine| machine.machine_id == **id))
    {
        bail!("machine {missing} is not in the configuration");
    }
    if machines.is_empty() {
        bail!("no machines configured");
    }
    Ok(machines)
}

/// Tells the database which device watches the machine. Failure only costs
/// the dashboard that detail, so it is logged and ignored.
async fn register(
    store: &dyn MonitorStore,
    machine: &MachineSettings,
    device_id: &str,
    ip_address: Option<&str>,
    timeout: Duration,
) {
    let registration = store.register_device(machine.machine_id, device_id, ip_address);
    match bounded(timeout, registration).await {
        Ok(()) => info!(machine_id = machine.machine_id, device_id, ip = ip_address.unwrap_or("unknown"), "device registered"),
        Err(err) => warn!(machine_id = machine.machine_id, error = %err, "device registration failed"),
    }
}

/// Local calibration wins. Otherwise the stored profile is used, and the factory
/// defaults stand in while the database is unreachable.
async fn resolve_detection(
    store: &dyn MonitorStore,
    machine: &MachineSettings,
    timeout: Duration,
) -> anyhow::Result<DetectionConfig> {
    if let Some(detection) = machine.detection {
        return Ok(detection);
    }
    match bounded(timeout, store.load_profile(machine.machine_id)).await {
        Ok(Some(profile)) => Ok(profile.detection),
        Ok(None) => bail!(
            "machine {} has no calibration, add it to secondary_machines or the configuration",
            machine.machine_id
        ),
        Err(err) if err.is_transient() => {
            warn!(
                machine_id = machine.machine_id,
                error = %err,
                "calibration unavailable, using factory defaults"
            );
            Ok(DetectionConfig::default())
        }
        Err(err) => Err(err.into()),
    }
}

fn open_source(frames: &FrameSettings) -> anyhow::Result<Box<dyn FrameSource>> {
    match frames {
        FrameSettings::Directory { directory, repeat } => {
            Ok(Box::new(ImageSequence::open(directory, *repeat)?))
        }
        #[cfg(feature = "camera")]
        FrameSettings::Camera { camera_index } => Ok(Box::new(camera::CameraSource::open(*camera_index)?)),
        #[cfg(not(feature = "camera"))]
        FrameSettings::Camera { camera_index } => bail!(
            "camera {camera_index} requested but this build has no camera support (enable the `camera` feature)"
        ),
    }
}

fn host_name() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .or_else(|| std::fs::read_to_string("/etc/hostname").ok())
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "unknown".to_string())
}

/// The address this device uses to reach the network. No packet is sent.
fn local_ip() -> Option<String> {
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:80").ok()?;
    socket.local_addr().ok().map(|addr| addr.ip().to_string())
}
