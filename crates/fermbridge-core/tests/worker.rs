//! Device worker cadences, remote commands and re-registration

mod common;

use common::*;
use fermbridge_core::api::{ApiError, Registration, RemoteCommand, RemoteConfig, StatusResponse};
use fermbridge_core::config::{AppConfig, ConfigDir, DeviceConfig};
use fermbridge_core::protocol::TransportOpener;
use fermbridge_core::worker::{
    DeviceWorker, TransportFactory, WorkerContext, WorkerError, WorkerHealth, WorkerSettings,
};
use pretty_assertions::assert_eq;
use serde_json::{json, Map};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

struct FixedTransport(Arc<DuplexOpener>);

impl TransportFactory for FixedTransport {
    fn opener(&self, _device: &DeviceConfig) -> Arc<dyn TransportOpener> {
        self.0.clone()
    }
}

struct Running {
    api: Arc<MockApi>,
    opener: Arc<DuplexOpener>,
    received: Arc<Mutex<Vec<String>>>,
    health: Arc<WorkerHealth>,
    cancel: CancellationToken,
    worker: JoinHandle<Result<(), WorkerError>>,
}

fn app_config() -> AppConfig {
    AppConfig {
        host: "localhost".into(),
        port: "80".into(),
        fermentrack_api_key: "key".into(),
        username: "brewer".into(),
        ..AppConfig::default()
    }
}

fn registered_device() -> DeviceConfig {
    let mut device = DeviceConfig::new("1-1");
    device.fermentrack_id = Some("4".into());
    device.guid = Some("0123456789abcdef".into());
    device
}

fn spawn_worker(
    api: Arc<MockApi>,
    device: DeviceConfig,
    store: Option<ConfigDir>,
    tweak: impl FnOnce(&mut WorkerSettings),
) -> Running {
    init_tracing();
    let app = app_config();
    let mut settings = WorkerSettings::from_app_config(&app);
    tweak(&mut settings);

    let (opener, links) = DuplexOpener::new();
    let received = spawn_fake_controller(links);
    let ctx = Arc::new(
        WorkerContext::new(app, api.clone(), Arc::new(FixedTransport(opener.clone())), store)
            .with_settings(settings),
    );
    let health = Arc::new(WorkerHealth::new());
    let cancel = CancellationToken::new();
    let worker = tokio::spawn(DeviceWorker::run(
        ctx,
        device,
        health.clone(),
        cancel.clone(),
    ));
    Running {
        api,
        opener,
        received,
        health,
        cancel,
        worker,
    }
}

fn received(run: &Running) -> Vec<String> {
    run.received.lock().unwrap().clone()
}

#[tokio::test(start_paused = true)]
async fn test_status_push_applies_remote_set_points() {
    let api = MockApi::new();
    api.queue_status_reply(Ok(StatusResponse {
        updated_mode: Some("f".into()),
        updated_fridge_set: Some(4.5),
        ..StatusResponse::default()
    }));
    let run = spawn_worker(api, registered_device(), None, |_| {});

    tokio::time::sleep(Duration::from_secs(31)).await;

    let pushes: Vec<ApiCall> = run
        .api
        .calls()
        .into_iter()
        .filter(|c| matches!(c, ApiCall::Status { .. }))
        .collect();
    assert_eq!(pushes.len(), 1);
    match &pushes[0] {
        ApiCall::Status { device_id, status, .. } => {
            assert_eq!(device_id, "4");
            assert_eq!(status.temps.get("FridgeTemp"), Some(&Some(18.25)));
            assert_eq!(status.lcd.len(), 4);
            assert_eq!(status.mode.as_str(), "b");
        }
        other => panic!("unexpected call {:?}", other),
    }

    let sent = received(&run);
    assert!(sent.contains(&r#"j{"mode":"f"}"#.to_string()), "{:?}", sent);
    assert!(sent.contains(&r#"j{"fridgeSet":4.5}"#.to_string()), "{:?}", sent);
    assert_eq!(run.health.consecutive_failures(), 0);

    run.cancel.cancel();
    run.worker.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_remote_commands_are_applied_and_acknowledged() {
    let api = MockApi::new();
    let mut settings = Map::new();
    settings.insert("beerSet".into(), json!(18.0));
    api.set_remote_config(RemoteConfig {
        control_settings: Some(settings),
        ..RemoteConfig::default()
    });
    api.queue_messages(vec![
        RemoteCommand::UpdatedControlSettings,
        RemoteCommand::UpdatedMinimumTimes,
        RemoteCommand::RefreshConfig,
    ]);
    let run = spawn_worker(api, registered_device(), None, |_| {});

    tokio::time::sleep(Duration::from_secs(6)).await;

    let calls: Vec<ApiCall> = run
        .api
        .calls()
        .into_iter()
        .filter(|c| !matches!(c, ApiCall::FetchMessages))
        .collect();
    assert_eq!(calls.len(), 5, "{:?}", calls);
    assert_eq!(calls[0], ApiCall::FetchFullConfig);
    assert_eq!(
        calls[1],
        ApiCall::MarkProcessed(RemoteCommand::UpdatedControlSettings)
    );
    assert_eq!(
        calls[2],
        ApiCall::MarkProcessed(RemoteCommand::UpdatedMinimumTimes)
    );
    assert_eq!(calls[3], ApiCall::MarkProcessed(RemoteCommand::RefreshConfig));
    match &calls[4] {
        ApiCall::SendFullConfig(config) => {
            assert_eq!(config.devices.len(), 2);
            assert!(config.cs.is_some());
            assert!(config.cc.is_some());
        }
        other => panic!("unexpected call {:?}", other),
    }
    assert!(received(&run).contains(&r#"j{"beerSet":18.0}"#.to_string()));

    run.cancel.cancel();
    run.worker.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_eeprom_reset_resyncs_and_pushes_config() {
    let api = MockApi::new();
    api.queue_messages(vec![RemoteCommand::ResetEeprom]);
    let run = spawn_worker(api, registered_device(), None, |_| {});

    tokio::time::sleep(Duration::from_secs(6)).await;

    let sent = received(&run);
    let reset = sent.iter().position(|c| c == "E").expect("E sent");
    assert!(sent[reset..].iter().any(|c| c == "c"), "{:?}", sent);
    assert!(run
        .api
        .calls()
        .iter()
        .any(|c| matches!(c, ApiCall::SendFullConfig(_))));

    run.cancel.cancel();
    run.worker.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_forgotten_device_is_registered_again() {
    let dir = tempfile::tempdir().unwrap();
    let store = ConfigDir::new(dir.path());
    store.save_app_config(&app_config()).unwrap();
    store.save_device_config(&registered_device()).unwrap();

    let api = MockApi::new();
    api.forget_device("4");
    api.set_registration(Ok(Registration {
        device_id: "9".into(),
        api_key: Some("fresh-key".into()),
    }));
    let run = spawn_worker(api, registered_device(), Some(store.clone()), |_| {});

    tokio::time::sleep(Duration::from_secs(31)).await;

    let registrations: Vec<ApiCall> = run
        .api
        .calls()
        .into_iter()
        .filter(|c| matches!(c, ApiCall::Register(_)))
        .collect();
    assert_eq!(registrations.len(), 1);
    match &registrations[0] {
        ApiCall::Register(request) => {
            assert_eq!(request.guid, "0123456789abcdef");
            assert_eq!(request.name, "BrewPi 01234567");
            assert_eq!(request.hardware, "m");
            assert_eq!(request.version, "0.15");
            assert_eq!(request.username, "brewer");
            assert_eq!(request.connection_type, "Serial (BSR)");
        }
        other => panic!("unexpected call {:?}", other),
    }

    // Persisted, and used from then on
    let saved = store
        .load_device_config(&store.device_config_path("1-1"))
        .unwrap();
    assert_eq!(saved.fermentrack_id.as_deref(), Some("9"));
    assert_eq!(saved.guid.as_deref(), Some("0123456789abcdef"));
    assert_eq!(
        store.load_app_config().unwrap().fermentrack_api_key,
        "fresh-key"
    );
    assert!(run.api.calls().iter().any(|c| matches!(
        c,
        ApiCall::Status { device_id, .. } if device_id == "9"
    )));

    run.cancel.cancel();
    run.worker.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_unregistered_device_gets_a_new_guid() {
    let api = MockApi::new();
    api.set_registration(Ok(Registration {
        device_id: "12".into(),
        api_key: None,
    }));
    let run = spawn_worker(api, DeviceConfig::new("1-1"), None, |_| {});

    tokio::time::sleep(Duration::from_secs(6)).await;

    let guid = run
        .api
        .calls()
        .into_iter()
        .find_map(|c| match c {
            ApiCall::Register(request) => Some(request.guid),
            _ => None,
        })
        .expect("registration attempted");
    assert_eq!(guid.len(), 36);

    run.cancel.cancel();
    run.worker.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_rejected_registration_counts_as_failure() {
    let api = MockApi::new();
    api.set_registration(Err(ApiError::RegistrationRejected {
        code: 3,
        message: "User not found in Fermentrack".into(),
    }));
    let run = spawn_worker(api, DeviceConfig::new("1-1"), None, |_| {});

    tokio::time::sleep(Duration::from_secs(11)).await;
    assert_eq!(run.health.consecutive_failures(), 2);
    assert_eq!(run.api.status_pushes(), 0);

    run.cancel.cancel();
    run.worker.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_persistent_api_failure_exhausts_retry_budget() {
    let api = MockApi::new();
    api.set_unavailable(true);
    let run = spawn_worker(api, registered_device(), None, |_| {});

    let result = tokio::time::timeout(Duration::from_secs(120), run.worker)
        .await
        .expect("worker gave up")
        .unwrap();
    match result {
        Err(WorkerError::RetryBudgetExhausted { failures, .. }) => assert_eq!(failures, 6),
        other => panic!("unexpected outcome {:?}", other),
    }
    assert!(run.health.is_failed());
}

#[tokio::test(start_paused = true)]
async fn test_unreachable_controller_fails_worker() {
    let api = MockApi::new();
    let (opener, _links) = DuplexOpener::new();
    opener.set_available(false);

    let app = app_config();
    let mut settings = WorkerSettings::from_app_config(&app);
    settings.session.backoff.max_attempts = 2;
    let ctx = Arc::new(
        WorkerContext::new(app, api.clone(), Arc::new(FixedTransport(opener.clone())), None)
            .with_settings(settings),
    );
    let health = Arc::new(WorkerHealth::new());
    let result = DeviceWorker::run(
        ctx,
        registered_device(),
        health.clone(),
        CancellationToken::new(),
    )
    .await;

    assert!(matches!(result, Err(WorkerError::SessionFailed(_))));
    assert!(health.is_failed());
    assert_eq!(api.status_pushes(), 0);
    assert_eq!(opener.opens(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_stop_mid_push_drops_the_push() {
    let api = MockApi::new();
    api.set_status_delay(Duration::from_secs(10));
    let run = spawn_worker(api, registered_device(), None, |_| {});

    // First push starts at 30 s and would land at 40 s
    tokio::time::sleep(Duration::from_secs(32)).await;
    run.cancel.cancel();
    run.worker.await.unwrap().unwrap();

    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(run.api.status_pushes(), 0);
    assert_eq!(run.opener.opens(), 1);
}
