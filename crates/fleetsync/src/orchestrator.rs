//! Orchestrator.
//!
//! Wires the acquisition source, buffer, sync engine and monitors together,
//! runs each as a supervised task, and owns the shutdown sequence.
//!
//! Tasks:
//!
//! | task | does |
//! |---|---|
//! | `acquisition` | reads the source into the observation channel |
//! | `intake` | filters, validates and appends observations |
//! | `connectivity` | probes reachability, signals the sync task on edges |
//! | `sync` | runs sync cycles on a timer or `SyncNow` |
//! | `power` | samples the battery and forwards power events |
//! | `retention` | evicts entries past the retention period |
//!
//! A task that returns an error or panics is restarted at the next health
//! check, up to `max_restarts` times; one more failure halts the daemon, as
//! does any error for which [`Error::is_fatal`] holds. A
//! task that returns `Ok` before shutdown (an exhausted replay file, a power
//! monitor that reported `Critical`) is considered finished.
//!
//! Shutdown is bounded by `shutdown_grace` as a whole: tasks still running
//! at the deadline are aborted, any interrupted batch goes back to pending,
//! and the final flush gets whatever time is left.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::acquisition::{build_source, AcquisitionSource};
use crate::buffer::BufferStore;
use crate::codec::CompressionKind;
use crate::config::{Config, ConnectivityMethod};
use crate::connectivity::{ConnectivityMonitor, ConnectivityProbe, ConnectivitySignal, TcpProbe};
use crate::error::{Error, Result};
use crate::power::{PowerEvent, PowerMonitor, PowerSource, PowerThresholds};
use crate::record::Observation;
use crate::remote::{HttpRemoteStore, RemoteStore};
use crate::sync::{SyncEngine, SyncOptions};

const OBSERVATION_QUEUE: usize = 256;
const SIGNAL_QUEUE: usize = 8;

/// Why [`Orchestrator::run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "reason")]
pub enum ShutdownReason {
    /// SIGINT or SIGTERM.
    Signal,
    /// [`Orchestrator::stop_handle`] was cancelled.
    Requested,
    /// The battery reached the critical tier.
    PowerCritical,
    /// A component kept failing after its restarts were used up.
    ComponentFailed {
        /// Task name.
        component: &'static str,
        /// Restarts attempted.
        restarts: u32,
    },
}

impl std::fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Signal => write!(f, "signal"),
            Self::Requested => write!(f, "requested"),
            Self::PowerCritical => write!(f, "power critical"),
            Self::ComponentFailed { component, restarts } => {
                write!(f, "component '{component}' failed after {restarts} restarts")
            }
        }
    }
}

/// Timing and limits for the orchestrator.
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// Records reporting fewer satellites (but more than zero) are dropped.
    pub min_satellites: u8,
    /// Sync batch limits.
    pub sync: SyncOptions,
    /// Payload compression.
    pub compression: CompressionKind,
    /// Scheduled sync interval.
    pub sync_interval: Duration,
    /// Connectivity probe interval.
    pub probe_interval: Duration,
    /// Connectivity probe timeout.
    pub probe_timeout: Duration,
    /// Battery sampling interval.
    pub power_poll_interval: Duration,
    /// Battery tier boundaries.
    pub power_thresholds: PowerThresholds,
    /// Retention sweep interval.
    pub sweep_interval: Duration,
    /// Health check interval.
    pub health_interval: Duration,
    /// Bound on the whole shutdown, task joins and final flush included.
    pub shutdown_grace: Duration,
    /// Restarts allowed per task.
    pub max_restarts: u32,
}

impl OrchestratorSettings {
    /// Settings from a loaded configuration.
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            min_satellites: config.acquisition.min_satellites,
            sync: config.sync_options(),
            compression: config.sync.compression,
            sync_interval: config.sync_interval(),
            probe_interval: config.probe_interval(),
            probe_timeout: config.probe_timeout(),
            power_poll_interval: config.power_poll_interval(),
            power_thresholds: config.power_thresholds(),
            sweep_interval: config.sweep_interval(),
            health_interval: config.health_interval(),
            shutdown_grace: config.shutdown_grace(),
            max_restarts: config.orchestrator.max_restarts,
        }
    }
}

/// The externally constructed handles the orchestrator drives.
#[derive(Debug)]
pub struct Components {
    /// Durable buffer.
    pub buffer: Arc<BufferStore>,
    /// Remote store client.
    pub remote: Arc<dyn RemoteStore>,
    /// Where observations come from.
    pub source: Arc<dyn AcquisitionSource>,
    /// Reachability check.
    pub probe: Arc<dyn ConnectivityProbe>,
    /// Battery readings; `None` disables the power monitor.
    pub power_source: Option<Arc<dyn PowerSource>>,
}

impl Components {
    /// Build production components from configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the buffer cannot be opened, the remote endpoint
    /// is missing, or the connectivity probe cannot be set up.
    pub fn from_config(config: &Config) -> Result<Self> {
        let endpoint = config.remote_endpoint()?;
        let buffer = Arc::new(BufferStore::open(
            config.database_path(),
            config.buffer_options(),
        )?);
        let remote = Arc::new(HttpRemoteStore::new(
            endpoint,
            &config.device.id,
            config.remote.auth_token.clone(),
            config.remote.auth_token_file.clone(),
            config.attempt_timeout(),
        )?);
        let source: Arc<dyn AcquisitionSource> = Arc::from(build_source(
            config.acquisition.kind,
            &config.acquisition.path,
            &config.device.id,
            config.acquisition.baud_rate,
        ));

        Ok(Self {
            buffer,
            remote,
            source,
            probe: probe_from_config(config, endpoint)?,
            power_source: power_source_from_config(config),
        })
    }
}

fn probe_from_config(config: &Config, endpoint: &str) -> Result<Arc<dyn ConnectivityProbe>> {
    match config.connectivity.method {
        ConnectivityMethod::Tcp => {
            let address = config
                .connectivity
                .probe_address
                .clone()
                .or_else(|| TcpProbe::address_for_endpoint(endpoint))
                .ok_or_else(|| Error::ConfigValidation {
                    message: format!("cannot derive a probe address from '{endpoint}'"),
                })?;
            Ok(Arc::new(TcpProbe::new(address)))
        }
        #[cfg(target_os = "linux")]
        ConnectivityMethod::Interface => {
            let interface = config.connectivity.interface.clone().unwrap_or_default();
            Ok(Arc::new(crate::connectivity::InterfaceProbe::new(interface)))
        }
        #[cfg(not(target_os = "linux"))]
        ConnectivityMethod::Interface => Err(Error::ConfigValidation {
            message: "connectivity.method 'interface' is only supported on Linux".to_string(),
        }),
    }
}

#[cfg(target_os = "linux")]
fn power_source_from_config(config: &Config) -> Option<Arc<dyn PowerSource>> {
    use crate::power::SysfsPowerSource;

    if !config.power.enabled {
        return None;
    }
    let source = match &config.power.supply_path {
        Some(path) => SysfsPowerSource::new(path.clone()),
        None => match SysfsPowerSource::detect() {
            Ok(source) => source,
            Err(e) => {
                warn!(error = %e, "No battery found, power monitoring disabled");
                return None;
            }
        },
    };
    Some(Arc::new(source))
}

#[cfg(not(target_os = "linux"))]
fn power_source_from_config(config: &Config) -> Option<Arc<dyn PowerSource>> {
    if config.power.enabled {
        warn!("Power monitoring is only supported on Linux, disabled");
    }
    None
}

/// Intake counters.
#[derive(Debug, Default)]
struct IntakeStats {
    accepted: AtomicU64,
    rejected: AtomicU64,
    filtered: AtomicU64,
    capacity: AtomicU64,
}

/// Snapshot of intake counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IntakeCounts {
    /// Records appended to the buffer.
    pub accepted: u64,
    /// Records that failed validation.
    pub rejected: u64,
    /// Records dropped for too few satellites.
    pub filtered: u64,
    /// Records refused because the buffer was full.
    pub capacity: u64,
}

impl IntakeStats {
    fn snapshot(&self) -> IntakeCounts {
        IntakeCounts {
            accepted: self.accepted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            filtered: self.filtered.load(Ordering::Relaxed),
            capacity: self.capacity.load(Ordering::Relaxed),
        }
    }
}

/// State shared by all tasks.
#[derive(Debug)]
struct Shared {
    settings: OrchestratorSettings,
    buffer: Arc<BufferStore>,
    engine: Arc<SyncEngine>,
    connectivity: ConnectivityMonitor,
    power: PowerMonitor,
    source: Arc<dyn AcquisitionSource>,
    probe: Arc<dyn ConnectivityProbe>,
    power_source: Option<Arc<dyn PowerSource>>,
    intake: IntakeStats,
    observations_tx: mpsc::Sender<Observation>,
    observations_rx: Mutex<mpsc::Receiver<Observation>>,
    signals_tx: mpsc::Sender<ConnectivitySignal>,
    signals_rx: Mutex<mpsc::Receiver<ConnectivitySignal>>,
    power_tx: mpsc::Sender<PowerEvent>,
    cancel: CancellationToken,
}

impl Shared {
    async fn acquire(&self) -> Result<()> {
        self.source.run(&self.observations_tx, &self.cancel).await
    }

    async fn intake(&self) -> Result<()> {
        let mut rx = self.observations_rx.lock().await;
        loop {
            let observation = tokio::select! {
                () = self.cancel.cancelled() => break,
                observation = rx.recv() => match observation {
                    Some(observation) => observation,
                    None => return Ok(()),
                },
            };
            self.admit(observation)?;
        }

        // keep what was already acquired
        rx.close();
        while let Ok(observation) = rx.try_recv() {
            self.admit(observation)?;
        }
        Ok(())
    }

    fn admit(&self, observation: Observation) -> Result<()> {
        let satellites = observation.record.quality.satellites;
        if satellites > 0 && satellites < self.settings.min_satellites {
            self.intake.filtered.fetch_add(1, Ordering::Relaxed);
            debug!(satellites, "Dropping fix with too few satellites");
            return Ok(());
        }

        match self
            .buffer
            .append_with_priority(&observation.record, observation.priority)
        {
            Ok(_) => {
                self.intake.accepted.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(e) if e.is_validation() => {
                self.intake.rejected.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, "Rejected telemetry record");
                Ok(())
            }
            Err(e) if e.is_capacity() => {
                self.intake.capacity.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, "Buffer full, record dropped");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn probe(&self) -> Result<()> {
        self.connectivity
            .run(
                self.probe.as_ref(),
                self.settings.probe_interval,
                self.settings.probe_timeout,
                &self.signals_tx,
                &self.cancel,
            )
            .await
    }

    async fn sync(&self) -> Result<()> {
        let mut signals = self.signals_rx.lock().await;
        self.engine
            .run(self.settings.sync_interval, &mut signals, &self.cancel)
            .await
    }

    async fn power(&self) -> Result<()> {
        let Some(source) = &self.power_source else {
            return Ok(());
        };
        self.power
            .run(
                source.as_ref(),
                self.settings.power_poll_interval,
                &self.power_tx,
                &self.cancel,
            )
            .await
    }

    async fn retention(&self) -> Result<()> {
        let mut ticker = tokio::time::interval(self.settings.sweep_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                () = self.cancel.cancelled() => return Ok(()),
                _ = ticker.tick() => {}
            }
            self.buffer.evict_expired()?;
        }
    }

    fn log_health(&self) {
        let intake = self.intake.snapshot();
        match self.buffer.stats() {
            Ok(stats) => debug!(
                connectivity = %self.connectivity.state(),
                power = ?self.power.tier(),
                pending = stats.pending,
                failed = stats.failed,
                stored_bytes = stats.stored_bytes,
                accepted = intake.accepted,
                rejected = intake.rejected,
                "Health check"
            ),
            Err(e) => warn!(error = %e, "Health check could not read buffer stats"),
        }
        if let Some(reason) = self.engine.suspension() {
            warn!(reason = %reason, "Sync suspended, send SIGHUP after fixing credentials");
        }
    }
}

type Spawner = Box<dyn Fn(Arc<Shared>) -> JoinHandle<Result<()>> + Send + Sync>;

struct Task {
    name: &'static str,
    restarts: u32,
    spawn: Spawner,
    handle: Option<JoinHandle<Result<()>>>,
}

impl Task {
    fn start(name: &'static str, shared: &Arc<Shared>, spawn: Spawner) -> Self {
        let handle = spawn(Arc::clone(shared));
        Self {
            name,
            restarts: 0,
            spawn,
            handle: Some(handle),
        }
    }
}

macro_rules! task {
    ($shared:expr, $name:literal, $method:ident) => {
        Task::start(
            $name,
            $shared,
            Box::new(|shared: Arc<Shared>| tokio::spawn(async move { shared.$method().await })),
        )
    };
}

enum Control {
    Shutdown,
    Reload,
}

#[cfg(unix)]
struct Signals {
    terminate: tokio::signal::unix::Signal,
    interrupt: tokio::signal::unix::Signal,
    hangup: tokio::signal::unix::Signal,
}

#[cfg(unix)]
impl Signals {
    fn new() -> Result<Self> {
        use tokio::signal::unix::{signal, SignalKind};
        Ok(Self {
            terminate: signal(SignalKind::terminate())?,
            interrupt: signal(SignalKind::interrupt())?,
            hangup: signal(SignalKind::hangup())?,
        })
    }

    async fn recv(&mut self) -> Control {
        tokio::select! {
            _ = self.terminate.recv() => Control::Shutdown,
            _ = self.interrupt.recv() => Control::Shutdown,
            _ = self.hangup.recv() => Control::Reload,
        }
    }
}

#[cfg(not(unix))]
struct Signals;

#[cfg(not(unix))]
impl Signals {
    #[allow(clippy::unnecessary_wraps)]
    fn new() -> Result<Self> {
        Ok(Self)
    }

    async fn recv(&mut self) -> Control {
        let _ = tokio::signal::ctrl_c().await;
        Control::Shutdown
    }
}

/// Runs the daemon until a shutdown trigger.
#[derive(Debug)]
pub struct Orchestrator {
    shared: Arc<Shared>,
    remote: Arc<dyn RemoteStore>,
    power_rx: mpsc::Receiver<PowerEvent>,
    stop: CancellationToken,
}

impl Orchestrator {
    /// Assemble the orchestrator from explicit components.
    #[must_use]
    pub fn new(settings: OrchestratorSettings, components: Components) -> Self {
        let connectivity = ConnectivityMonitor::new();
        let engine = Arc::new(SyncEngine::new(
            Arc::clone(&components.buffer),
            Arc::clone(&components.remote),
            settings.compression.compressor(),
            connectivity.subscribe(),
            settings.sync,
        ));
        let (observations_tx, observations_rx) = mpsc::channel(OBSERVATION_QUEUE);
        let (signals_tx, signals_rx) = mpsc::channel(SIGNAL_QUEUE);
        let (power_tx, power_rx) = mpsc::channel(SIGNAL_QUEUE);

        let shared = Arc::new(Shared {
            power: PowerMonitor::new(settings.power_thresholds),
            settings,
            buffer: components.buffer,
            engine,
            connectivity,
            source: components.source,
            probe: components.probe,
            power_source: components.power_source,
            intake: IntakeStats::default(),
            observations_tx,
            observations_rx: Mutex::new(observations_rx),
            signals_tx,
            signals_rx: Mutex::new(signals_rx),
            power_tx,
            cancel: CancellationToken::new(),
        });

        Self {
            shared,
            remote: components.remote,
            power_rx,
            stop: CancellationToken::new(),
        }
    }

    /// Token that stops [`Orchestrator::run`] when cancelled.
    #[must_use]
    pub fn stop_handle(&self) -> CancellationToken {
        self.stop.clone()
    }

    /// The sync engine.
    #[must_use]
    pub fn engine(&self) -> &Arc<SyncEngine> {
        &self.shared.engine
    }

    /// The buffer.
    #[must_use]
    pub fn buffer(&self) -> &Arc<BufferStore> {
        &self.shared.buffer
    }

    /// Path of the buffer database.
    #[must_use]
    pub fn database_path(&self) -> PathBuf {
        self.shared.buffer.path().to_path_buf()
    }

    /// Intake counters so far.
    #[must_use]
    pub fn intake_counts(&self) -> IntakeCounts {
        self.shared.intake.snapshot()
    }

    /// Re-read remote credentials and lift a fatal suspension.
    pub async fn reload_credentials(&self) {
        match self.remote.refresh_credentials().await {
            Ok(()) => self.shared.engine.resume(),
            Err(e) => error!(error = %e, "Credential reload failed, sync stays suspended"),
        }
    }

    /// Run until SIGINT/SIGTERM, a stop request, power-critical, or a
    /// component failing beyond its restarts. SIGHUP reloads credentials.
    ///
    /// # Errors
    ///
    /// Returns an error if signal handlers cannot be installed.
    pub async fn run(mut self) -> Result<ShutdownReason> {
        let mut signals = Signals::new()?;
        let shared = Arc::clone(&self.shared);
        let mut tasks = vec![
            task!(&shared, "intake", intake),
            task!(&shared, "acquisition", acquire),
            task!(&shared, "connectivity", probe),
            task!(&shared, "sync", sync),
            task!(&shared, "power", power),
            task!(&shared, "retention", retention),
        ];
        info!(
            source = shared.source.name(),
            probe = shared.probe.name(),
            remote = self.remote.name(),
            power = shared.power_source.as_ref().map_or("disabled", |s| s.name()),
            "Orchestrator started"
        );

        let mut health = tokio::time::interval(shared.settings.health_interval);
        health.set_missed_tick_behavior(MissedTickBehavior::Delay);
        health.tick().await;

        let reason = loop {
            tokio::select! {
                () = self.stop.cancelled() => break ShutdownReason::Requested,
                control = signals.recv() => match control {
                    Control::Shutdown => break ShutdownReason::Signal,
                    Control::Reload => {
                        info!("SIGHUP received, reloading credentials");
                        self.reload_credentials().await;
                    }
                },
                Some(event) = self.power_rx.recv() => {
                    if matches!(event, PowerEvent::Critical { .. }) {
                        break ShutdownReason::PowerCritical;
                    }
                }
                _ = health.tick() => {
                    shared.log_health();
                    if let Some(reason) = self.supervise(&mut tasks).await {
                        break reason;
                    }
                }
            }
        };

        self.shutdown(reason, tasks).await;
        Ok(reason)
    }

    async fn supervise(&self, tasks: &mut [Task]) -> Option<ShutdownReason> {
        for task in tasks.iter_mut() {
            if !task.handle.as_ref().is_some_and(JoinHandle::is_finished) {
                continue;
            }
            let Some(handle) = task.handle.take() else {
                continue;
            };
            let (failure, fatal) = match handle.await {
                Ok(Ok(())) => {
                    info!(component = task.name, "Component finished");
                    continue;
                }
                Ok(Err(e)) => (e.to_string(), e.is_fatal()),
                Err(e) => (format!("task panicked: {e}"), false),
            };

            if fatal || task.restarts >= self.shared.settings.max_restarts {
                error!(
                    component = task.name,
                    restarts = task.restarts,
                    error = %failure,
                    "Component failed permanently"
                );
                return Some(ShutdownReason::ComponentFailed {
                    component: task.name,
                    restarts: task.restarts,
                });
            }
            task.restarts += 1;
            warn!(
                component = task.name,
                attempt = task.restarts,
                error = %failure,
                "Restarting component"
            );
            task.handle = Some((task.spawn)(Arc::clone(&self.shared)));
        }
        None
    }

    async fn shutdown(&self, reason: ShutdownReason, tasks: Vec<Task>) {
        info!(%reason, "Shutting down");
        self.shared.cancel.cancel();
        let deadline = Instant::now() + self.shared.settings.shutdown_grace;

        for task in tasks {
            let Some(mut handle) = task.handle else {
                continue;
            };
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(Ok(Ok(()))) => {}
                Ok(Ok(Err(e))) => warn!(component = task.name, error = %e, "Component stopped with error"),
                Ok(Err(e)) => warn!(component = task.name, error = %e, "Component panicked during shutdown"),
                Err(_) => {
                    handle.abort();
                    let _ = handle.await;
                    warn!(component = task.name, "Component did not stop within the grace period, aborted");
                }
            }
        }

        // an aborted write leaves its batch in flight
        match self.shared.buffer.revert_all_in_flight() {
            Ok(0) => {}
            Ok(count) => info!(count, "Returned interrupted batch to pending"),
            Err(e) => warn!(error = %e, "Could not return in-flight entries to pending"),
        }

        if !matches!(reason, ShutdownReason::ComponentFailed { .. }) {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                warn!("Grace period used up, skipping shutdown flush");
            } else {
                match self.shared.engine.flush(remaining).await {
                    Ok(result) => debug!(sent = result.sent_count, "Shutdown flush complete"),
                    Err(e) => warn!(error = %e, "Shutdown flush failed"),
                }
            }
        }

        let intake = self.shared.intake.snapshot();
        match self.shared.buffer.stats() {
            Ok(stats) => info!(
                unsynced = stats.unsynced(),
                synced_total = stats.total_synced,
                accepted = intake.accepted,
                rejected = intake.rejected,
                filtered = intake.filtered,
                "Stopped; unsynced entries stay buffered for the next start"
            ),
            Err(e) => warn!(error = %e, "Could not read final buffer stats"),
        }
    }
}
