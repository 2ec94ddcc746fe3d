//! Device worker
//!
//! One worker per configured controller. The worker owns a
//! [`ControllerSession`] and drives three cadences against the remote
//! service: status push, message poll and full configuration resync.
//! Every successful iteration refreshes its [`WorkerHealth`] heartbeat,
//! which the supervisor's watchdog reads.

mod health;

use serde_json::json;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::api::{
    ApiError, Credentials, FermentrackApi, RegistrationRequest, RemoteCommand, RemoteConfig,
    StatusResponse, CONNECTION_TYPE,
};
use crate::config::{AppConfig, ConfigDir, ConfigError, DeviceConfig};
use crate::controller::{ControllerSession, SessionConfig, SessionHandle, SessionState};
use crate::protocol::{ControllerMode, ProtocolError, SerialOpener, TransportOpener};
use crate::supervisor::WorkerSpawner;

pub use health::WorkerHealth;

/// Consecutive failed iterations tolerated before the worker gives up
pub const DEFAULT_RETRY_BUDGET: u32 = 5;

/// Pause after a controller-side reset before reading its state back
const SETTLE_DELAY: Duration = Duration::from_millis(200);

/// Errors that end a worker
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Giving up after {failures} consecutive failures; last: {last}")]
    RetryBudgetExhausted { failures: u32, last: String },

    #[error("Controller session failed: {0}")]
    SessionFailed(ProtocolError),

    #[error("Controller did not report firmware information")]
    NoFirmwareInfo,

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Api(#[from] ApiError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl WorkerError {
    fn requires_registration(&self) -> bool {
        matches!(self, WorkerError::Api(e) if e.requires_registration())
    }

    /// Session is between connections; the iteration is skipped
    fn is_offline(&self) -> bool {
        matches!(self, WorkerError::Protocol(ProtocolError::NotConnected))
    }
}

/// Cadences and limits for a worker
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub status_interval: Duration,
    pub message_interval: Duration,
    pub full_config_interval: Duration,
    pub retry_budget: u32,
    /// Session template; the location is filled in per device
    pub session: SessionConfig,
}

impl WorkerSettings {
    pub fn from_app_config(app: &AppConfig) -> Self {
        Self {
            status_interval: app.status_update_interval(),
            message_interval: app.message_check_interval(),
            full_config_interval: app.full_config_update_interval(),
            retry_budget: DEFAULT_RETRY_BUDGET,
            session: SessionConfig::new(""),
        }
    }
}

/// Builds the transport for a device
pub trait TransportFactory: Send + Sync {
    fn opener(&self, device: &DeviceConfig) -> Arc<dyn TransportOpener>;
}

/// Opens the serial port found at the device's USB location
#[derive(Debug, Default, Clone)]
pub struct SerialTransportFactory;

impl TransportFactory for SerialTransportFactory {
    fn opener(&self, device: &DeviceConfig) -> Arc<dyn TransportOpener> {
        Arc::new(SerialOpener::new(device.location.clone()))
    }
}

/// Everything a worker needs besides its device config
///
/// Built once at startup and shared by every worker. The API key is the
/// only mutable part: a registration may hand out a new one, and workers
/// started afterwards must use it.
pub struct WorkerContext {
    pub app: Arc<AppConfig>,
    pub api: Arc<dyn FermentrackApi>,
    pub transports: Arc<dyn TransportFactory>,
    pub settings: WorkerSettings,
    /// Where re-registration results are persisted
    pub store: Option<ConfigDir>,
    api_key: RwLock<String>,
}

impl WorkerContext {
    pub fn new(
        app: AppConfig,
        api: Arc<dyn FermentrackApi>,
        transports: Arc<dyn TransportFactory>,
        store: Option<ConfigDir>,
    ) -> Self {
        Self {
            settings: WorkerSettings::from_app_config(&app),
            api_key: RwLock::new(app.fermentrack_api_key.clone()),
            app: Arc::new(app),
            api,
            transports,
            store,
        }
    }

    pub fn with_settings(mut self, settings: WorkerSettings) -> Self {
        self.settings = settings;
        self
    }

    /// The key workers authenticate with right now
    pub fn api_key(&self) -> String {
        self.api_key
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_api_key(&self, api_key: &str) {
        *self
            .api_key
            .write()
            .unwrap_or_else(PoisonError::into_inner) = api_key.to_string();
    }
}

#[derive(Debug, Clone, Copy)]
enum Step {
    Status,
    Messages,
    FullConfig,
}

/// The per-device run loop
pub struct DeviceWorker {
    ctx: Arc<WorkerContext>,
    device: DeviceConfig,
    credentials: Option<Credentials>,
    session: SessionHandle,
    health: Arc<WorkerHealth>,
}

impl DeviceWorker {
    /// Run a worker until `cancel` fires or it gives up
    ///
    /// The session is torn down before this returns, so the serial port is
    /// closed once the future completes.
    pub async fn run(
        ctx: Arc<WorkerContext>,
        device: DeviceConfig,
        health: Arc<WorkerHealth>,
        cancel: CancellationToken,
    ) -> Result<(), WorkerError> {
        let mut session_config = ctx.settings.session.clone();
        session_config.location = device.location.clone();
        let session_cancel = cancel.child_token();
        let (session, session_task) = ControllerSession::spawn(
            session_config,
            ctx.transports.opener(&device),
            session_cancel.clone(),
        );

        let credentials = initial_credentials(&ctx.api_key(), &device);
        let mut worker = DeviceWorker {
            ctx,
            device,
            credentials,
            session,
            health: health.clone(),
        };
        let result = worker.run_loop(&cancel).await;

        session_cancel.cancel();
        if let Err(e) = session_task.await {
            warn!("session task ended abnormally: {}", e);
        }
        if result.is_err() {
            health.mark_failed();
        }
        result
    }

    async fn run_loop(&mut self, cancel: &CancellationToken) -> Result<(), WorkerError> {
        let settings = self.ctx.settings.clone();
        let start = Instant::now();
        let mut status_tick = interval_at(start + settings.status_interval, settings.status_interval);
        let mut message_tick =
            interval_at(start + settings.message_interval, settings.message_interval);
        let mut config_tick = interval_at(
            start + settings.full_config_interval,
            settings.full_config_interval,
        );
        for tick in [&mut status_tick, &mut message_tick, &mut config_tick] {
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        }
        let mut session_state = self.session.subscribe_session_state();

        info!(registered = self.credentials.is_some(), "worker started");
        self.health.beat();

        loop {
            let step = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = status_tick.tick() => Step::Status,
                _ = message_tick.tick() => Step::Messages,
                _ = config_tick.tick() => Step::FullConfig,
                changed = session_state.changed() => {
                    if changed.is_err() {
                        return Err(WorkerError::SessionFailed(ProtocolError::SessionClosed));
                    }
                    let state = *session_state.borrow_and_update();
                    if state == SessionState::Failed {
                        return Err(WorkerError::SessionFailed(ProtocolError::ReconnectExhausted {
                            attempts: settings.session.backoff.max_attempts,
                        }));
                    }
                    continue;
                }
            };

            let outcome = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                outcome = self.run_step(step) => outcome,
            };

            let outcome = match outcome {
                Err(e) if e.requires_registration() => {
                    warn!("remote service does not know this device; re-registering");
                    tokio::select! {
                        _ = cancel.cancelled() => return Ok(()),
                        outcome = self.reregister() => outcome,
                    }
                }
                other => other,
            };

            match outcome {
                Ok(()) => {
                    self.health.reset_failures();
                    self.health.beat();
                }
                Err(e) if e.is_offline() => {
                    debug!(?step, "controller offline; skipping");
                    self.health.beat();
                }
                Err(e) => self.record_failure(step, e)?,
            }
        }
    }

    fn record_failure(&self, step: Step, err: WorkerError) -> Result<(), WorkerError> {
        let failures = self.health.record_failure();
        warn!(?step, failures, "worker iteration failed: {}", err);
        if failures > self.ctx.settings.retry_budget {
            return Err(WorkerError::RetryBudgetExhausted {
                failures,
                last: err.to_string(),
            });
        }
        Ok(())
    }

    async fn run_step(&mut self, step: Step) -> Result<(), WorkerError> {
        if !self.session.session_state().is_online() {
            return Err(ProtocolError::NotConnected.into());
        }
        match step {
            Step::Status => self.push_status().await,
            Step::Messages => self.poll_messages().await,
            Step::FullConfig => self.push_full_config().await,
        }
    }

    fn credentials(&self) -> Result<Credentials, WorkerError> {
        self.credentials
            .clone()
            .ok_or(WorkerError::Api(ApiError::RegistrationRequired))
    }

    async fn push_status(&mut self) -> Result<(), WorkerError> {
        let creds = self.credentials()?;
        let (temps, lcd) = tokio::join!(
            self.session.request_temperatures(),
            self.session.request_lcd()
        );
        tolerate_in_flight(temps.map(|_| ()))?;
        tolerate_in_flight(lcd.map(|_| ()))?;

        let state = self.session.snapshot();
        if state.temps.is_empty() {
            debug!("no temperature readings yet; skipping status push");
            return Ok(());
        }

        let response = self.ctx.api.send_status(&creds, &state.status()).await?;
        self.apply_status_response(&response).await?;
        if response.has_messages {
            self.poll_messages().await?;
        }
        Ok(())
    }

    async fn apply_status_response(&self, response: &StatusResponse) -> Result<(), WorkerError> {
        if let Some(code) = response.updated_mode.as_deref().filter(|m| !m.is_empty()) {
            match ControllerMode::from_code(code) {
                Some(mode) => {
                    info!(mode = mode.as_str(), "remote service changed the mode");
                    self.session.set_parameter("mode", json!(mode.as_str())).await?;
                }
                None => warn!(mode = code, "ignoring unknown mode from remote service"),
            }
        }
        if let Some(temp) = response.updated_beer_set {
            info!(temp, "remote service changed the beer set point");
            self.session.set_parameter("beerSet", json!(temp)).await?;
        }
        if let Some(temp) = response.updated_fridge_set {
            info!(temp, "remote service changed the fridge set point");
            self.session.set_parameter("fridgeSet", json!(temp)).await?;
        }
        Ok(())
    }

    async fn poll_messages(&mut self) -> Result<(), WorkerError> {
        let creds = self.credentials()?;
        let commands = self.ctx.api.fetch_messages(&creds).await?;
        if commands.is_empty() {
            return Ok(());
        }
        debug!(count = commands.len(), "processing remote commands");

        let mut push_config = false;
        let mut remote_config: Option<RemoteConfig> = None;
        for command in commands {
            push_config |= self
                .handle_command(command, &creds, &mut remote_config)
                .await?;
            self.ctx.api.mark_message_processed(&creds, command).await?;
        }
        if push_config {
            self.push_full_config().await?;
        }
        Ok(())
    }

    /// Run one remote command; returns whether a full config push should follow
    async fn handle_command(
        &self,
        command: RemoteCommand,
        creds: &Credentials,
        remote_config: &mut Option<RemoteConfig>,
    ) -> Result<bool, WorkerError> {
        info!(command = command.flag(), "handling remote command");
        match command {
            RemoteCommand::RestartDevice => {
                self.session.restart_device().await?;
                Ok(false)
            }
            RemoteCommand::ResetEeprom => {
                self.session.reset_eeprom().await?;
                self.settle_and_resync().await?;
                Ok(true)
            }
            RemoteCommand::DefaultControlConstants => {
                self.session.load_default_control_constants().await?;
                self.settle_and_resync().await?;
                Ok(true)
            }
            RemoteCommand::DefaultControlSettings => {
                self.session.load_default_control_settings().await?;
                self.settle_and_resync().await?;
                Ok(true)
            }
            RemoteCommand::RefreshConfig => Ok(true),
            RemoteCommand::ResetConnection => {
                self.session.reconnect().await?;
                Ok(false)
            }
            RemoteCommand::UpdatedControlSettings => {
                let config = self.remote_config(creds, remote_config).await?;
                match config.control_settings.clone() {
                    Some(settings) => self.session.set_control_settings(settings).await?,
                    None => warn!("remote configuration has no control settings"),
                }
                Ok(false)
            }
            RemoteCommand::UpdatedControlConstants => {
                let config = self.remote_config(creds, remote_config).await?;
                match config.control_constants.clone() {
                    Some(constants) => self.session.set_control_constants(constants).await?,
                    None => warn!("remote configuration has no control constants"),
                }
                Ok(false)
            }
            RemoteCommand::UpdatedDevices => {
                let config = self.remote_config(creds, remote_config).await?;
                match config.devices.as_deref() {
                    Some(devices) => self.session.set_device_list(devices).await?,
                    None => warn!("remote configuration has no device list"),
                }
                Ok(false)
            }
            RemoteCommand::UpdatedMinimumTimes => {
                debug!("minimum time updates are not supported by this bridge");
                Ok(false)
            }
        }
    }

    /// Fetch the remote configuration at most once per message batch
    async fn remote_config<'a>(
        &self,
        creds: &Credentials,
        cached: &'a mut Option<RemoteConfig>,
    ) -> Result<&'a RemoteConfig, WorkerError> {
        if cached.is_none() {
            *cached = Some(self.ctx.api.fetch_full_config(creds).await?);
        }
        match cached {
            Some(config) => Ok(config),
            None => Err(ApiError::InvalidResponse("missing remote configuration".into()).into()),
        }
    }

    async fn settle_and_resync(&self) -> Result<(), WorkerError> {
        tokio::time::sleep(SETTLE_DELAY).await;
        self.session.resync().await?;
        Ok(())
    }

    async fn push_full_config(&mut self) -> Result<(), WorkerError> {
        let creds = self.credentials()?;
        self.session.resync().await?;
        let config = self.session.snapshot().full_config();
        self.ctx.api.send_full_config(&creds, &config).await?;
        debug!(devices = config.devices.len(), "full configuration pushed");
        Ok(())
    }

    /// Register again under the existing GUID (or a fresh one)
    async fn reregister(&mut self) -> Result<(), WorkerError> {
        let firmware = match self.session.snapshot().firmware {
            Some(info) => info,
            None => self.session.request_version().await?,
        };
        let hardware = firmware.board.clone().ok_or(WorkerError::NoFirmwareInfo)?;

        let guid = self
            .device
            .guid
            .clone()
            .filter(|g| !g.is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let short = guid.get(..8).unwrap_or(&guid);
        let request = RegistrationRequest {
            guid: guid.clone(),
            hardware,
            version: firmware.reported_version().to_string(),
            username: self.ctx.app.username.clone(),
            name: format!("BrewPi {}", short),
            connection_type: CONNECTION_TYPE.to_string(),
        };

        let registration = self.ctx.api.register_device(&request).await?;
        let api_key = registration
            .api_key
            .clone()
            .or_else(|| self.credentials.as_ref().map(|c| c.api_key.clone()))
            .unwrap_or_else(|| self.ctx.api_key());

        let mut device = self.device.clone();
        device.guid = Some(guid);
        device.fermentrack_id = Some(registration.device_id.clone());
        if let Some(store) = &self.ctx.store {
            store.save_device_config(&device)?;
            if let Some(key) = &registration.api_key {
                store.save_api_key(key)?;
            }
        }
        if let Some(key) = &registration.api_key {
            self.ctx.set_api_key(key);
        }

        info!(device_id = %registration.device_id, "device registered");
        self.device = device;
        self.credentials = Some(Credentials {
            device_id: registration.device_id,
            api_key,
        });
        Ok(())
    }
}

fn initial_credentials(api_key: &str, device: &DeviceConfig) -> Option<Credentials> {
    let device_id = device.fermentrack_id.clone().filter(|id| !id.is_empty())?;
    if api_key.is_empty() {
        return None;
    }
    Some(Credentials {
        device_id,
        api_key: api_key.to_string(),
    })
}

/// A request of the same kind already pending will refresh the state too
fn tolerate_in_flight(result: Result<(), ProtocolError>) -> Result<(), ProtocolError> {
    match result {
        Err(ProtocolError::RequestAlreadyInFlight(_)) => Ok(()),
        other => other,
    }
}

/// Spawns [`DeviceWorker`]s for the supervisor
pub struct DeviceWorkerSpawner {
    ctx: Arc<WorkerContext>,
}

impl DeviceWorkerSpawner {
    pub fn new(ctx: Arc<WorkerContext>) -> Self {
        Self { ctx }
    }
}

impl WorkerSpawner for DeviceWorkerSpawner {
    fn spawn(
        &self,
        device: DeviceConfig,
        health: Arc<WorkerHealth>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let span = info_span!("worker", location = %device.location);
        let ctx = self.ctx.clone();
        tokio::spawn(
            async move {
                match DeviceWorker::run(ctx, device, health, cancel).await {
                    Ok(()) => info!("worker stopped"),
                    Err(e) => error!("worker failed: {}", e),
                }
            }
            .instrument(span),
        )
    }
}
