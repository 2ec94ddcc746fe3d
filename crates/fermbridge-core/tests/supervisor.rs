//! Supervisor roster reconciliation and watchdog

mod common;

use common::*;
use fermbridge_core::api::Registration;
use fermbridge_core::config::{AppConfig, ConfigDir, DeviceConfig};
use fermbridge_core::protocol::TransportOpener;
use fermbridge_core::supervisor::{RosterWatcher, Supervisor, SupervisorSettings, WorkerSpawner};
use fermbridge_core::worker::{
    DeviceWorkerSpawner, TransportFactory, WorkerContext, WorkerHealth,
};
use pretty_assertions::assert_eq;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Spawns workers that beat every second, except for wedged locations
/// (never beat) and crashing ones (exit at once)
#[derive(Default)]
struct ScriptedSpawner {
    wedged: HashSet<String>,
    crashing: HashSet<String>,
    spawns: Mutex<HashMap<String, usize>>,
}

impl ScriptedSpawner {
    fn spawns(&self, location: &str) -> usize {
        self.spawns
            .lock()
            .unwrap()
            .get(location)
            .copied()
            .unwrap_or(0)
    }
}

impl WorkerSpawner for ScriptedSpawner {
    fn spawn(
        &self,
        device: DeviceConfig,
        health: Arc<WorkerHealth>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        *self
            .spawns
            .lock()
            .unwrap()
            .entry(device.location.clone())
            .or_default() += 1;
        let wedged = self.wedged.contains(&device.location);
        let crashing = self.crashing.contains(&device.location);
        tokio::spawn(async move {
            if crashing {
                return;
            }
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(Duration::from_secs(1)) => {
                        if !wedged {
                            health.beat();
                        }
                    }
                }
            }
        })
    }
}

fn devices(locations: &[&str]) -> Vec<DeviceConfig> {
    locations.iter().map(|l| DeviceConfig::new(*l)).collect()
}

#[tokio::test(start_paused = true)]
async fn test_watchdog_restarts_only_stale_workers() {
    let spawner = Arc::new(ScriptedSpawner {
        wedged: ["1-2".to_string()].into_iter().collect(),
        ..ScriptedSpawner::default()
    });
    let supervisor = Supervisor::new(spawner.clone(), SupervisorSettings::default());
    supervisor.reconcile(devices(&["1-1", "1-2", "1-3"])).await;

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert!(supervisor.watchdog_sweep().await.is_empty());

    tokio::time::sleep(Duration::from_secs(61)).await;
    assert_eq!(supervisor.watchdog_sweep().await, vec!["1-2"]);
    assert_eq!(spawner.spawns("1-1"), 1);
    assert_eq!(spawner.spawns("1-2"), 2);
    assert_eq!(spawner.spawns("1-3"), 1);

    // The replacement is fresh until it, too, goes quiet
    assert!(supervisor.watchdog_sweep().await.is_empty());
    tokio::time::sleep(Duration::from_secs(121)).await;

    let (restarted, report) = tokio::join!(
        supervisor.watchdog_sweep(),
        supervisor.reconcile(devices(&["1-1", "1-2", "2-1"]))
    );
    assert_eq!(restarted, vec!["1-2"]);
    assert_eq!(report.started, vec!["2-1"]);
    assert_eq!(report.stopped, vec!["1-3"]);
    assert_eq!(spawner.spawns("1-1"), 1);
    assert_eq!(spawner.spawns("1-2"), 3);
    assert_eq!(
        supervisor.locations().await,
        vec!["1-1", "1-2", "2-1"]
    );

    supervisor.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_watchdog_restarts_exited_workers() {
    let spawner = Arc::new(ScriptedSpawner {
        crashing: ["1-4".to_string()].into_iter().collect(),
        ..ScriptedSpawner::default()
    });
    let supervisor = Supervisor::new(spawner.clone(), SupervisorSettings::default());
    supervisor.reconcile(devices(&["1-1", "1-4"])).await;

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(supervisor.watchdog_sweep().await, vec!["1-4"]);
    assert_eq!(spawner.spawns("1-4"), 2);
    assert_eq!(spawner.spawns("1-1"), 1);

    supervisor.shutdown().await;
}

struct FixedTransport(Arc<DuplexOpener>);

impl TransportFactory for FixedTransport {
    fn opener(&self, _device: &DeviceConfig) -> Arc<dyn TransportOpener> {
        self.0.clone()
    }
}

#[tokio::test(start_paused = true)]
async fn test_removed_config_stops_worker_mid_push() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let store = ConfigDir::new(dir.path());
    let app = AppConfig {
        host: "localhost".into(),
        port: "80".into(),
        fermentrack_api_key: "key".into(),
        ..AppConfig::default()
    };
    store.save_app_config(&app).unwrap();
    let mut device = DeviceConfig::new("1-1");
    device.fermentrack_id = Some("4".into());
    store.save_device_config(&device).unwrap();

    // One controller that notes when its link is closed
    let (opener, mut links) = DuplexOpener::new();
    let closed = Arc::new(AtomicBool::new(false));
    tokio::spawn({
        let closed = closed.clone();
        async move {
            let mut link = ControllerLink::new(links.recv().await.unwrap());
            while let Some(command) = link.next_command().await {
                if let Some(reply) = reply_for(&command) {
                    link.send_line(reply).await;
                }
            }
            closed.store(true, Ordering::SeqCst);
        }
    });

    let api = MockApi::new();
    api.set_status_delay(Duration::from_secs(10));
    let ctx = Arc::new(WorkerContext::new(
        app,
        api.clone(),
        Arc::new(FixedTransport(opener.clone())),
        Some(store.clone()),
    ));
    let supervisor = Supervisor::new(
        Arc::new(DeviceWorkerSpawner::new(ctx)),
        SupervisorSettings::default(),
    );

    supervisor.rescan(&store).await;
    assert_eq!(supervisor.locations().await, vec!["1-1"]);

    // The first status push is in flight from 30 s to 40 s
    tokio::time::sleep(Duration::from_secs(32)).await;
    std::fs::remove_file(store.device_config_path("1-1")).unwrap();
    supervisor.rescan(&store).await;
    assert!(supervisor.locations().await.is_empty());

    tokio::time::sleep(Duration::from_secs(3)).await;
    assert!(closed.load(Ordering::SeqCst));

    tokio::time::sleep(Duration::from_secs(300)).await;
    assert_eq!(api.status_pushes(), 0);
    assert_eq!(opener.opens(), 1);

    supervisor.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_replaced_worker_uses_key_from_registration() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let store = ConfigDir::new(dir.path());
    let app = AppConfig {
        host: "localhost".into(),
        port: "80".into(),
        fermentrack_api_key: "key".into(),
        username: "brewer".into(),
        ..AppConfig::default()
    };
    store.save_app_config(&app).unwrap();
    let mut device = DeviceConfig::new("1-1");
    device.fermentrack_id = Some("4".into());
    device.guid = Some("0123456789abcdef".into());
    store.save_device_config(&device).unwrap();

    let (opener, links) = DuplexOpener::new();
    spawn_fake_controller(links);
    let api = MockApi::new();
    api.forget_device("4");
    api.set_registration(Ok(Registration {
        device_id: "9".into(),
        api_key: Some("fresh-key".into()),
    }));
    let ctx = Arc::new(WorkerContext::new(
        app,
        api.clone(),
        Arc::new(FixedTransport(opener.clone())),
        Some(store.clone()),
    ));
    let supervisor = Supervisor::new(
        Arc::new(DeviceWorkerSpawner::new(ctx.clone())),
        SupervisorSettings::default(),
    );

    // The first status push finds the device forgotten and registers it
    supervisor.rescan(&store).await;
    tokio::time::sleep(Duration::from_secs(31)).await;
    assert_eq!(ctx.api_key(), "fresh-key");
    let saved = store
        .load_device_config(&store.device_config_path("1-1"))
        .unwrap();
    assert_eq!(saved.fermentrack_id.as_deref(), Some("9"));

    // The rewritten config replaces the worker, which keeps the new key
    supervisor.rescan(&store).await;
    assert_eq!(supervisor.locations().await, vec!["1-1"]);
    tokio::time::sleep(Duration::from_secs(65)).await;
    assert_eq!(opener.opens(), 2);

    let pushes: Vec<(String, String)> = api
        .calls()
        .into_iter()
        .filter_map(|c| match c {
            ApiCall::Status {
                device_id, api_key, ..
            } => Some((device_id, api_key)),
            _ => None,
        })
        .collect();
    assert!(pushes.len() >= 2, "pushes {:?}", pushes);
    for push in &pushes {
        assert_eq!(push, &("9".to_string(), "fresh-key".to_string()));
    }

    supervisor.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_run_picks_up_configs_on_rescan() {
    let dir = tempfile::tempdir().unwrap();
    let store = ConfigDir::new(dir.path());
    store.save_device_config(&DeviceConfig::new("1-1")).unwrap();

    let spawner = Arc::new(ScriptedSpawner::default());
    let supervisor = Arc::new(Supervisor::new(
        spawner.clone(),
        SupervisorSettings {
            rescan_every: 1,
            ..SupervisorSettings::default()
        },
    ));
    let cancel = CancellationToken::new();
    let task = tokio::spawn({
        let supervisor = supervisor.clone();
        let store = store.clone();
        let cancel = cancel.clone();
        async move { supervisor.run(&store, None, cancel).await }
    });

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(supervisor.locations().await, vec!["1-1"]);

    store.save_device_config(&DeviceConfig::new("1-2")).unwrap();
    tokio::time::sleep(Duration::from_secs(6)).await;
    assert_eq!(supervisor.locations().await, vec!["1-1", "1-2"]);

    cancel.cancel();
    task.await.unwrap();
    assert!(supervisor.locations().await.is_empty());
}

#[tokio::test]
async fn test_roster_watcher_signals_config_changes() {
    let dir = tempfile::tempdir().unwrap();
    let store = ConfigDir::new(dir.path());
    let mut watcher = RosterWatcher::new(dir.path()).unwrap();

    store.save_device_config(&DeviceConfig::new("3-1")).unwrap();
    tokio::time::timeout(
        Duration::from_secs(10),
        watcher.changed(Duration::from_millis(50)),
    )
    .await
    .expect("change signalled");
}
