//! Daemon supervisor
//!
//! Owns the location → worker map. The roster (the device configs in the
//! configuration directory) decides which workers run; the watchdog
//! restarts workers whose heartbeat went stale or that exited on their own.

mod roster;

use futures::future::join_all;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::config::{ConfigDir, DeviceConfig};
use crate::worker::WorkerHealth;

pub use roster::{is_roster_event, RosterWatcher};

/// Starts a worker task for a device
pub trait WorkerSpawner: Send + Sync {
    fn spawn(
        &self,
        device: DeviceConfig,
        health: Arc<WorkerHealth>,
        cancel: CancellationToken,
    ) -> JoinHandle<()>;
}

/// Watchdog and roster timing
#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub sweep_interval: Duration,
    /// Heartbeat age after which a worker is restarted
    pub stale_after: Duration,
    /// How long a stopping worker may take before it is aborted
    pub stop_grace: Duration,
    /// Full roster rescan every this many sweeps
    pub rescan_every: u32,
    pub debounce: Duration,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(5),
            stale_after: Duration::from_secs(120),
            stop_grace: Duration::from_secs(3),
            rescan_every: 10,
            debounce: Duration::from_millis(500),
        }
    }
}

/// What a reconcile pass changed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub started: Vec<String>,
    pub stopped: Vec<String>,
    /// Config changed; the worker was replaced
    pub replaced: Vec<String>,
}

impl ReconcileReport {
    pub fn is_empty(&self) -> bool {
        self.started.is_empty() && self.stopped.is_empty() && self.replaced.is_empty()
    }
}

struct WorkerEntry {
    config: DeviceConfig,
    health: Arc<WorkerHealth>,
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

pub struct Supervisor {
    spawner: Arc<dyn WorkerSpawner>,
    settings: SupervisorSettings,
    workers: Mutex<HashMap<String, WorkerEntry>>,
    stopping: TaskTracker,
}

impl Supervisor {
    pub fn new(spawner: Arc<dyn WorkerSpawner>, settings: SupervisorSettings) -> Self {
        Self {
            spawner,
            settings,
            workers: Mutex::new(HashMap::new()),
            stopping: TaskTracker::new(),
        }
    }

    pub fn settings(&self) -> &SupervisorSettings {
        &self.settings
    }

    fn start(&self, config: DeviceConfig) -> WorkerEntry {
        let health = Arc::new(WorkerHealth::new());
        let cancel = CancellationToken::new();
        let join = self
            .spawner
            .spawn(config.clone(), health.clone(), cancel.clone());
        WorkerEntry {
            config,
            health,
            cancel,
            join,
        }
    }

    /// Cancel a worker and reap it in the background
    fn retire(&self, location: String, entry: WorkerEntry) {
        self.stopping
            .spawn(stop_worker(location, entry, self.settings.stop_grace));
    }

    /// Bring the running workers in line with `configs`
    ///
    /// New locations get a worker, vanished ones are stopped, and a changed
    /// config replaces its worker.
    pub async fn reconcile(&self, configs: Vec<DeviceConfig>) -> ReconcileReport {
        let mut desired: HashMap<String, DeviceConfig> = HashMap::new();
        for config in configs {
            if desired.contains_key(&config.location) {
                warn!(location = %config.location, "duplicate device config ignored");
                continue;
            }
            desired.insert(config.location.clone(), config);
        }

        let mut report = ReconcileReport::default();
        let mut workers = self.workers.lock().await;

        let running: Vec<String> = workers.keys().cloned().collect();
        for location in running {
            let unchanged = match (desired.get(&location), workers.get(&location)) {
                (Some(config), Some(entry)) => *config == entry.config,
                _ => false,
            };
            if unchanged {
                continue;
            }
            if let Some(entry) = workers.remove(&location) {
                if desired.contains_key(&location) {
                    info!(location = %location, "device config changed; replacing worker");
                    report.replaced.push(location.clone());
                } else {
                    info!(location = %location, "device config removed; stopping worker");
                    report.stopped.push(location.clone());
                }
                self.retire(location, entry);
            }
        }

        let replaced: HashSet<String> = report.replaced.iter().cloned().collect();
        for (location, config) in desired {
            if workers.contains_key(&location) {
                continue;
            }
            if !replaced.contains(&location) {
                info!(location = %location, "device config added; starting worker");
                report.started.push(location.clone());
            }
            let entry = self.start(config);
            workers.insert(location, entry);
        }

        report.started.sort();
        report.stopped.sort();
        report.replaced.sort();
        report
    }

    /// Restart every worker that is stale or has exited
    ///
    /// Returns the restarted locations.
    pub async fn watchdog_sweep(&self) -> Vec<String> {
        let now = Instant::now();
        let mut restarted = Vec::new();
        let mut workers = self.workers.lock().await;

        for (location, entry) in workers.iter_mut() {
            let stale = entry.health.is_stale(now, self.settings.stale_after);
            let exited = entry.join.is_finished();
            if !stale && !exited {
                continue;
            }
            if exited {
                warn!(
                    location = %location,
                    failed = entry.health.is_failed(),
                    "worker exited; restarting"
                );
            } else {
                warn!(
                    location = %location,
                    failures = entry.health.consecutive_failures(),
                    "worker heartbeat stale; restarting"
                );
            }
            let fresh = self.start(entry.config.clone());
            let old = std::mem::replace(entry, fresh);
            self.retire(location.clone(), old);
            restarted.push(location.clone());
        }

        restarted.sort();
        restarted
    }

    /// Re-read the configuration directory and reconcile
    pub async fn rescan(&self, store: &ConfigDir) {
        match store.list_device_configs() {
            Ok(configs) => {
                let report = self.reconcile(configs).await;
                if !report.is_empty() {
                    debug!(?report, "roster reconciled");
                }
            }
            Err(e) => warn!("cannot list device configs: {}", e),
        }
    }

    /// Supervise until `cancel` fires, then stop every worker
    pub async fn run(
        &self,
        store: &ConfigDir,
        mut roster: Option<RosterWatcher>,
        cancel: CancellationToken,
    ) {
        self.rescan(store).await;

        let mut sweep = interval(self.settings.sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        sweep.tick().await;
        let mut sweeps: u32 = 0;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = sweep.tick() => {
                    let restarted = self.watchdog_sweep().await;
                    if !restarted.is_empty() {
                        info!(?restarted, "watchdog restarted workers");
                    }
                    sweeps = sweeps.wrapping_add(1);
                    if self.settings.rescan_every > 0 && sweeps % self.settings.rescan_every == 0 {
                        self.rescan(store).await;
                    }
                }
                _ = roster_changed(&mut roster, self.settings.debounce) => {
                    debug!("roster change detected");
                    self.rescan(store).await;
                }
            }
        }

        self.shutdown().await;
    }

    /// Stop every worker and wait for them to finish
    pub async fn shutdown(&self) {
        let entries: Vec<(String, WorkerEntry)> = self.workers.lock().await.drain().collect();
        info!(workers = entries.len(), "stopping all workers");
        let grace = self.settings.stop_grace;
        join_all(
            entries
                .into_iter()
                .map(|(location, entry)| stop_worker(location, entry, grace)),
        )
        .await;
        self.stopping.close();
        self.stopping.wait().await;
    }

    /// Locations with a running worker, sorted
    pub async fn locations(&self) -> Vec<String> {
        let mut locations: Vec<String> = self.workers.lock().await.keys().cloned().collect();
        locations.sort();
        locations
    }

    pub async fn health(&self, location: &str) -> Option<Arc<WorkerHealth>> {
        self.workers
            .lock()
            .await
            .get(location)
            .map(|entry| entry.health.clone())
    }
}

async fn roster_changed(roster: &mut Option<RosterWatcher>, debounce: Duration) {
    match roster {
        Some(watcher) => watcher.changed(debounce).await,
        None => std::future::pending().await,
    }
}

async fn stop_worker(location: String, entry: WorkerEntry, grace: Duration) {
    entry.cancel.cancel();
    let mut join = entry.join;
    match tokio::time::timeout(grace, &mut join).await {
        Ok(Ok(())) => debug!(location = %location, "worker stopped"),
        Ok(Err(e)) if e.is_panic() => warn!(location = %location, "worker panicked: {}", e),
        Ok(Err(_)) => {}
        Err(_) => {
            warn!(location = %location, "worker did not stop in time; aborting");
            join.abort();
        }
    }
}
