//! Fleet daemon
//!
//! This module provides the `Daemon`, the long-lived process that manages
//! every attached eVOLVER unit. It handles:
//! - the operator protocol (`initialize`, `refill`, `pause`, `unpause`,
//!   `stop_exp`), one request per connection, each bounded by a timeout
//! - admission of staged experiment fragments and ending of experiments
//! - collection of per-device fluid usage and fluid inventory accounting
//! - idle shutdown once no device has had work for long enough
//!
//! # Loops
//!
//! Besides the accept loop, three loops run on the configured cycle:
//! 1. **activity**: collect device updates, detach devices with no
//!    experiments, count idle cycles
//! 2. **admission**: expire stale announcements, admit staged fragments,
//!    end experiments on request
//! 3. **reconciliation**: charge fluid usage and raise low-fluid alerts
//!
//! Each loop sleeps for whatever remains of the cycle after its work, so the
//! cadence does not drift with load.
//!
//! # Shared state
//!
//! The device session table, pending starts, fluid inventory and update
//! queue each sit behind their own mutex. A loop never holds two of them at
//! once; the session table may be held while a device session is locked, but
//! never across a device connect.
//!
//! # Examples
//!
//! ```no_run
//! use std::sync::Arc;
//! use evolver_engine::config::Config;
//! use evolver_engine::daemon::Daemon;
//! use evolver_engine::device::SocketIoConnector;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::load_or_create()?;
//! let connector = SocketIoConnector::new(
//!     config.device.namespace.clone(),
//!     config.device.connect_timeout(),
//! );
//! let daemon = Arc::new(Daemon::new(config, Arc::new(connector)));
//! daemon.serve().await?;
//! # Ok(())
//! # }
//! ```

pub mod admission;
pub mod fluids;

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tracing::{debug, error, info, warn};

use sdk::device::numeric;
use sdk::errors::EngineError;
use sdk::types::{ExperimentAnnouncement, Request, Response};

use crate::alerts::{AlertSink, FluidAlert, LogAlertSink};
use crate::config::Config;
use crate::device::DeviceConnector;
use crate::manager::{wall_clock, DeviceSession, EvolverManager, FluidUpdate};
use crate::protocol::{read_message, write_message};
use crate::reactor::{Bioreactor, ReactorSpec};
use crate::staging::{FragmentName, StagingQueue};

pub use admission::{PendingStart, PendingStarts};
pub use fluids::FluidInventory;

/// Result type for daemon operations
pub type Result<T> = std::result::Result<T, EngineError>;

/// Orchestrates device sessions, experiments and fluids
pub struct Daemon {
    config: Config,
    connector: Arc<dyn DeviceConnector>,
    alerts: Arc<dyn AlertSink>,
    staging: StagingQueue,

    sessions: Mutex<BTreeMap<String, DeviceSession>>,
    pending: Mutex<PendingStarts>,
    to_end: Mutex<Vec<String>>,
    fluids: Mutex<FluidInventory>,
    updates: Mutex<Vec<FluidUpdate>>,

    alive: AtomicBool,
    paused: AtomicBool,
    idle_cycles: AtomicU32,
}

impl Daemon {
    /// Create a daemon; it is alive until shut down or idle for too long
    pub fn new(config: Config, connector: Arc<dyn DeviceConnector>) -> Self {
        let staging = StagingQueue::new(config.core.staging_dir.clone());
        Self {
            config,
            connector,
            alerts: Arc::new(LogAlertSink),
            staging,
            sessions: Mutex::new(BTreeMap::new()),
            pending: Mutex::new(PendingStarts::new()),
            to_end: Mutex::new(Vec::new()),
            fluids: Mutex::new(FluidInventory::new()),
            updates: Mutex::new(Vec::new()),
            alive: AtomicBool::new(true),
            paused: AtomicBool::new(false),
            idle_cycles: AtomicU32::new(0),
        }
    }

    /// Deliver low-fluid alerts through `sink`
    pub fn with_alert_sink(mut self, sink: Arc<dyn AlertSink>) -> Self {
        self.alerts = sink;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn staging(&self) -> &StagingQueue {
        &self.staging
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Ask every loop to stop at its next cycle
    pub fn signal_shutdown(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }

    /// Bind the configured operator address and run until shutdown
    pub async fn serve(self: Arc<Self>) -> Result<()> {
        let addr = format!("{}:{}", self.config.daemon.host, self.config.daemon.port);
        let listener = TcpListener::bind(&addr).await?;
        self.run(listener).await
    }

    /// Run every loop on `listener` until shutdown
    ///
    /// On the way out all pumps on every attached device are stopped and the
    /// devices are detached.
    pub async fn run(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        info!(addr = ?listener.local_addr().ok(), "Daemon listening");
        let signals = spawn_signal_handler(Arc::clone(&self));

        let tasks: Vec<JoinHandle<()>> = vec![
            tokio::spawn(Arc::clone(&self).accept_loop(listener)),
            tokio::spawn(Arc::clone(&self).activity_loop()),
            tokio::spawn(Arc::clone(&self).admission_loop()),
            tokio::spawn(Arc::clone(&self).reconciliation_loop()),
        ];
        for task in tasks {
            if let Err(e) = task.await {
                error!("Daemon task failed: {}", e);
            }
        }

        signals.abort();
        self.shutdown().await;
        Ok(())
    }

    /// Stop all pumps and detach every device
    pub async fn shutdown(&self) {
        self.signal_shutdown();
        let sessions = std::mem::take(&mut *self.sessions.lock().await);
        for (url, session) in sessions {
            let manager = session.manager();
            if let Err(e) = manager.lock().await.controls_mut().stop_all_pumps() {
                warn!(device = %url, "Failed to stop pumps at shutdown: {}", e);
            }
            session.detach();
        }
        info!("Daemon stopped");
    }

    async fn pace(&self, started: Instant) {
        let cycle = self.config.daemon.cycle();
        tokio::time::sleep(cycle.saturating_sub(started.elapsed())).await;
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        while self.is_alive() {
            match timeout(self.config.daemon.cycle(), listener.accept()).await {
                Ok(Ok((stream, peer))) => {
                    debug!(%peer, "Client connected");
                    let daemon = Arc::clone(&self);
                    tokio::spawn(async move { daemon.handle_client(stream).await });
                }
                Ok(Err(e)) => warn!("Failed to accept client: {}", e),
                Err(_) => {} // re-check the alive flag
            }
        }
    }

    async fn activity_loop(self: Arc<Self>) {
        while self.is_alive() {
            let started = Instant::now();
            self.check_activity().await;
            self.pace(started).await;
        }
    }

    async fn admission_loop(self: Arc<Self>) {
        while self.is_alive() {
            let started = Instant::now();
            self.admit_experiments().await;
            self.pace(started).await;
        }
    }

    async fn reconciliation_loop(self: Arc<Self>) {
        while self.is_alive() {
            let started = Instant::now();
            self.reconcile().await;
            self.pace(started).await;
        }
    }

    // Operator protocol

    /// Serve one client connection
    ///
    /// The whole exchange is bounded by the client timeout. Errors close the
    /// connection and never reach the other loops.
    pub async fn handle_client(&self, mut stream: TcpStream) {
        match timeout(self.config.daemon.client_timeout(), self.process(&mut stream)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Client exchange failed: {}", e),
            Err(_) => error!("Client took too long; connection closed"),
        }
    }

    /// Read one request, apply it and write the response
    pub async fn process<S>(&self, stream: &mut S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let request: Request = read_message(stream).await?;
        info!(command = %request.command, "Command received");

        let response = match request.command.as_str() {
            "initialize" => {
                let path = self.staging.dir().display().to_string();
                write_message(stream, &Response::with_path(path)).await?;
                let announcement: ExperimentAnnouncement = read_message(stream).await?;
                self.announce(&announcement).await
            }
            "refill" => self.refill(&request).await,
            "pause" => self.pause().await,
            "unpause" => self.unpause().await,
            "stop_exp" => self.stop_experiment(&request).await,
            other => {
                warn!(command = %other, "Unknown command");
                Response::error("Unknown command")
            }
        };
        write_message(stream, &response).await
    }

    /// Expect fragments for an experiment
    pub async fn announce(&self, announcement: &ExperimentAnnouncement) -> Response {
        if announcement.name.is_empty() || announcement.fragments == 0 {
            return Response::error("initialize needs a name and at least one fragment");
        }
        self.pending.lock().await.announce(
            &announcement.name,
            announcement.fragments,
            Instant::now(),
            self.config.daemon.pending_deadline(),
        );
        info!(
            experiment = %announcement.name,
            fragments = announcement.fragments,
            "Waiting for experiment fragments"
        );
        Response::ok()
    }

    /// Overwrite fluid volumes; unknown fluids are ignored
    pub async fn refill(&self, request: &Request) -> Response {
        let mut volumes = HashMap::new();
        for (fluid, value) in &request.args {
            match numeric(value) {
                Some(volume) if volume.is_finite() => {
                    volumes.insert(fluid.clone(), volume);
                }
                _ => return Response::error(format!("volume for '{}' is not a number", fluid)),
            }
        }
        let unknown = self.fluids.lock().await.refill(&volumes);
        if !unknown.is_empty() {
            info!(fluids = ?unknown, "Ignoring refill of untracked fluids");
        }
        Response::ok()
    }

    /// Lock pumps on every device
    pub async fn pause(&self) -> Response {
        self.set_paused(true).await;
        info!("Paused");
        Response::ok()
    }

    /// Unlock pumps on every device
    pub async fn unpause(&self) -> Response {
        self.set_paused(false).await;
        info!("Unpaused");
        Response::ok()
    }

    /// Apply a pause state to every device, then record it
    ///
    /// Every manager is locked before any pump is touched, and nothing after
    /// that awaits. A call dropped by the client timeout therefore changes
    /// either every device and the flag, or nothing at all. The session table
    /// stays held throughout so admission cannot attach a device in between.
    async fn set_paused(&self, paused: bool) {
        let sessions = self.sessions.lock().await;
        let mut managers = Vec::with_capacity(sessions.len());
        for (url, session) in sessions.iter() {
            managers.push((url, session.manager().lock_owned().await));
        }

        for (url, manager) in &mut managers {
            let applied = if paused {
                manager.lock()
            } else {
                manager.unlock()
            };
            if let Err(e) = applied {
                warn!(device = %url, paused, "Failed to switch pumps: {}", e);
            }
        }
        self.paused.store(paused, Ordering::SeqCst);
    }

    /// Queue an experiment to be ended by the admission loop
    pub async fn stop_experiment(&self, request: &Request) -> Response {
        match request.arg_str("name") {
            Ok(name) => {
                self.to_end.lock().await.push(name.to_string());
                info!(experiment = %name, "Experiment end requested");
                Response::ok()
            }
            Err(e) => Response::error(e.to_string()),
        }
    }

    // Background loop steps

    async fn managers(&self) -> Vec<(String, Arc<Mutex<EvolverManager>>)> {
        self.sessions
            .lock()
            .await
            .iter()
            .map(|(url, session)| (url.clone(), session.manager()))
            .collect()
    }

    /// Collect device updates, detach idle devices and count idle cycles
    pub async fn check_activity(&self) {
        let mut collected = Vec::new();
        let no_sessions = {
            let mut sessions = self.sessions.lock().await;
            let mut idle = Vec::new();
            for (url, session) in sessions.iter() {
                let manager = session.manager();
                let mut manager = manager.lock().await;
                collected.extend(manager.drain_updates());
                if manager.has_no_active_experiments() {
                    idle.push(url.clone());
                }
            }
            for url in idle {
                if let Some(session) = sessions.remove(&url) {
                    session.detach();
                }
            }
            sessions.is_empty()
        };
        if !collected.is_empty() {
            self.updates.lock().await.extend(collected);
        }

        let waiting = !self.pending.lock().await.is_empty();
        if no_sessions && !waiting {
            let idle = self.idle_cycles.fetch_add(1, Ordering::SeqCst) + 1;
            debug!(idle, "No devices attached");
            if idle > self.config.daemon.idle_cycles {
                info!("No active experiments for too long; shutting down");
                self.signal_shutdown();
            }
        } else {
            self.idle_cycles.store(0, Ordering::SeqCst);
        }
    }

    /// Admit staged fragments and end requested experiments
    pub async fn admit_experiments(&self) {
        for name in self.pending.lock().await.expire(Instant::now()) {
            error!(experiment = %name, "Timed out waiting for experiment fragments");
        }

        match self.staging.scan().await {
            Ok(names) => {
                for name in names {
                    self.admit_fragment(&name).await;
                }
            }
            Err(e) => warn!("Failed to scan staging directory: {}", e),
        }

        self.end_requested().await;
    }

    async fn discard(&self, name: &FragmentName) {
        if let Err(e) = self.staging.discard(name).await {
            warn!(fragment = %name, "Failed to remove fragment: {}", e);
        }
    }

    async fn admit_fragment(&self, name: &FragmentName) {
        if !self.pending.lock().await.contains(&name.experiment) {
            warn!(fragment = %name, "Discarding fragment of unknown experiment");
            self.discard(name).await;
            return;
        }

        let fragment = match self.staging.load(name).await {
            Ok(fragment) => fragment,
            Err(e) => {
                error!(fragment = %name, "Discarding unreadable fragment: {}", e);
                self.discard(name).await;
                return;
            }
        };

        let reactor = match Bioreactor::build(
            ReactorSpec {
                name: &name.experiment,
                mode: &name.mode,
                base: &fragment.base_settings,
                special: &fragment.special_settings,
                calibration: &fragment.calibration,
            },
            self.config.device.num_vials,
            &self.config.dilution,
            wall_clock(),
        ) {
            Ok(reactor) => reactor,
            Err(e) => {
                error!(fragment = %name, "Rejecting experiment settings: {}", e);
                self.discard(name).await;
                return;
            }
        };

        // connect without holding the session table; a slow unit must not
        // stall the protocol or the other loops
        let attached = if self.sessions.lock().await.contains_key(&fragment.url) {
            None
        } else {
            match DeviceSession::attach(self.connector.as_ref(), &fragment.url, &self.config).await
            {
                Ok(session) => Some(session),
                Err(e) => {
                    warn!(fragment = %name, "Device unavailable, will retry: {}", e);
                    return;
                }
            }
        };

        // from here the table stays locked so the activity loop cannot detach
        // the device before the reactor is registered
        {
            let mut sessions = self.sessions.lock().await;
            if let Some(session) = attached {
                if sessions.contains_key(&fragment.url) {
                    debug!(device = %fragment.url, "Device attached concurrently");
                    session.detach();
                } else {
                    if self.is_paused() {
                        if let Err(e) = session.manager().lock().await.lock() {
                            warn!(device = %fragment.url, "Failed to lock new device: {}", e);
                        }
                    }
                    sessions.insert(fragment.url.clone(), session);
                }
            }
            let Some(session) = sessions.get(&fragment.url) else {
                debug!(fragment = %name, "Device detached before admission, will retry");
                return;
            };
            let manager = session.manager();
            let mut manager = manager.lock().await;
            if let Err(e) =
                manager.add_experiment(&name.experiment, reactor, fragment.working_dir.clone())
            {
                error!(fragment = %name, "Could not add experiment: {}", e);
                drop(manager);
                drop(sessions);
                self.discard(name).await;
                return;
            }
        }

        if self.pending.lock().await.admit(&name.experiment) {
            info!(experiment = %name.experiment, "All fragments admitted");
        }
        self.fluids
            .lock()
            .await
            .register(&fragment.url, &fragment.fluid_key);
        self.discard(name).await;
        info!(fragment = %name, device = %fragment.url, "Fragment admitted");
    }

    async fn end_requested(&self) {
        let names = std::mem::take(&mut *self.to_end.lock().await);
        for name in names {
            if self.pending.lock().await.cancel(&name) {
                info!(experiment = %name, "Pending start cancelled");
            }
            let mut found = false;
            for (url, manager) in self.managers().await {
                let vials = manager.lock().await.end_experiment(&name);
                if vials.is_empty() {
                    continue;
                }
                found = true;
                let unused = self.fluids.lock().await.release(&url, &vials);
                debug!(experiment = %name, device = %url, ?unused, "Fluids released");
            }
            if !found {
                warn!(experiment = %name, "No running experiment to end");
            }
        }
    }

    /// Charge collected fluid usage and raise low-fluid alerts
    pub async fn reconcile(&self) {
        let now = wall_clock();
        self.reconcile_at(now).await;
    }

    /// `reconcile` with an explicit clock
    pub async fn reconcile_at(&self, now: f64) {
        let updates = std::mem::take(&mut *self.updates.lock().await);
        let low = {
            let mut fluids = self.fluids.lock().await;
            for update in &updates {
                fluids.apply(update, now);
            }
            fluids.advance(now);
            fluids.check_levels(self.config.daemon.min_fluid_volume)
        };

        for (fluid, volume) in low {
            warn!(fluid = %fluid, volume, "Fluid needs a refill");
            let Some(custodians) = self.config.alerts.custodians.get(&fluid) else {
                continue;
            };
            let alert = FluidAlert {
                fluid,
                volume,
                minimum: self.config.daemon.min_fluid_volume,
                custodians: custodians.clone(),
            };
            if let Err(e) = self.alerts.send(&alert).await {
                warn!(fluid = %alert.fluid, "Failed to send alert: {}", e);
            }
        }
    }

    // Inspection

    /// URLs of attached devices
    pub async fn session_urls(&self) -> Vec<String> {
        self.sessions.lock().await.keys().cloned().collect()
    }

    pub async fn manager(&self, url: &str) -> Option<Arc<Mutex<EvolverManager>>> {
        self.sessions.lock().await.get(url).map(DeviceSession::manager)
    }

    /// Fragments still expected for `experiment`
    pub async fn pending_fragments(&self, experiment: &str) -> Option<u32> {
        self.pending
            .lock()
            .await
            .get(experiment)
            .map(|entry| entry.remaining)
    }

    pub async fn fluid_volumes(&self) -> BTreeMap<String, f64> {
        self.fluids.lock().await.volumes().clone()
    }

    /// Queue fluid usage as if a device had reported it
    pub async fn push_update(&self, update: FluidUpdate) {
        self.updates.lock().await.push(update);
    }
}

/// Flip the daemon to not-alive on SIGTERM or Ctrl-C
#[cfg(unix)]
fn spawn_signal_handler(daemon: Arc<Daemon>) -> JoinHandle<()> {
    use tokio::signal::unix::{signal, SignalKind};

    tokio::spawn(async move {
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = sigterm.recv() => info!("Received SIGTERM signal"),
                    _ = tokio::signal::ctrl_c() => info!("Received Ctrl-C"),
                }
            }
            Err(e) => {
                warn!("SIGTERM handler unavailable: {}", e);
                if tokio::signal::ctrl_c().await.is_err() {
                    return;
                }
                info!("Received Ctrl-C");
            }
        }
        daemon.signal_shutdown();
    })
}

#[cfg(not(unix))]
fn spawn_signal_handler(daemon: Arc<Daemon>) -> JoinHandle<()> {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl-C");
            daemon.signal_shutdown();
        }
    })
}
