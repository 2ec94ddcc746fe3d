//! Controller session
//!
//! One task per controller owns the transport, the framer, the correlator
//! and the latest [`ControllerState`]. Callers talk to it through a cloneable
//! [`SessionHandle`]; every request is a message to the task and every reply
//! comes back on a oneshot channel.
//!
//! Lifecycle: `Disconnected -> Connecting -> Connected <-> AwaitingResponse`.
//! A transport error moves the session to `Degraded` and starts the
//! reconnect loop (capped multiplicative backoff). Every reopen is followed
//! by a full resync. The backoff only resets once the controller answers,
//! so a port that opens and drops at once still counts against the attempt
//! ceiling. When the ceiling is reached the session parks in `Failed` until
//! [`SessionHandle::reconnect`] is called.

use futures::{SinkExt, StreamExt};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use super::backoff::{Backoff, BackoffPolicy};
use super::state::{ControllerState, SessionState};
use crate::protocol::{
    decode_line, BoxedTransport, ControlConstants, ControlSettings, Correlator, DeviceListItem,
    FirmwareInfo, FramedLine, LineFramer, ProtocolError, RawFrame, Reply, Request, RequestEncoder,
    Resolution, ResponseKind, ResponseRecord, Temperatures, TransportOpener, DEFAULT_TIMEOUT_MS,
    MAX_LINE_LENGTH,
};

/// Requests replayed after every (re)connect
const RESYNC_REQUESTS: [Request; 6] = [
    Request::Version,
    Request::Settings,
    Request::ControlConstants,
    Request::Temperatures,
    Request::Lcd,
    Request::DeviceList,
];

/// Session parameters
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// USB location, used for log context
    pub location: String,
    /// Per-request response deadline
    pub request_timeout: Duration,
    /// Maximum undelimited line length
    pub max_line_length: usize,
    pub backoff: BackoffPolicy,
}

impl SessionConfig {
    pub fn new(location: impl Into<String>) -> Self {
        Self {
            location: location.into(),
            request_timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            max_line_length: MAX_LINE_LENGTH,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug)]
enum SessionCommand {
    Request {
        request: Request,
        reply: oneshot::Sender<Reply>,
    },
    Cancel(ResponseKind),
    Reconnect,
}

/// Why a connected period ended
enum Ended {
    Shutdown,
    Reconnect,
    Lost(ProtocolError),
}

type Frames = FramedRead<ReadHalf<BoxedTransport>, LineFramer>;
type Sink = FramedWrite<WriteHalf<BoxedTransport>, RequestEncoder>;

/// The session task
pub struct ControllerSession {
    config: SessionConfig,
    opener: Arc<dyn TransportOpener>,
    commands: mpsc::Receiver<SessionCommand>,
    state: watch::Sender<ControllerState>,
    session_state: watch::Sender<SessionState>,
    correlator: Correlator,
    backoff: Backoff,
    cancel: CancellationToken,
}

impl ControllerSession {
    /// Start a session task
    ///
    /// The task stops when `cancel` fires or every handle is dropped; the
    /// returned join handle completes once the transport is closed.
    pub fn spawn(
        config: SessionConfig,
        opener: Arc<dyn TransportOpener>,
        cancel: CancellationToken,
    ) -> (SessionHandle, JoinHandle<()>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(32);
        let (state_tx, state_rx) = watch::channel(ControllerState::default());
        let (session_tx, session_rx) = watch::channel(SessionState::Disconnected);

        let span = tracing::info_span!("session", location = %config.location);
        let session = ControllerSession {
            correlator: Correlator::new(config.request_timeout),
            backoff: Backoff::new(config.backoff),
            config,
            opener,
            commands: cmd_rx,
            state: state_tx,
            session_state: session_tx,
            cancel: cancel.clone(),
        };
        let task = tokio::spawn(session.run().instrument(span));

        let handle = SessionHandle {
            commands: cmd_tx,
            state: state_rx,
            session_state: session_rx,
            cancel,
        };
        (handle, task)
    }

    async fn run(mut self) {
        let mut immediate = true;
        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            if !immediate {
                match self.backoff.next_delay() {
                    Some(delay) => {
                        tracing::info!(
                            attempt = self.backoff.attempts(),
                            delay_ms = delay.as_millis() as u64,
                            target = %self.opener.describe(),
                            "reconnecting"
                        );
                        if !self.wait_offline(delay).await {
                            break;
                        }
                    }
                    None => {
                        let attempts = self.backoff.attempts();
                        tracing::error!(attempts, "reconnect attempts exhausted");
                        self.set_state(SessionState::Failed);
                        if !self.wait_for_reconnect(attempts).await {
                            break;
                        }
                        self.backoff.reset();
                    }
                }
            }
            immediate = false;

            self.set_state(SessionState::Connecting);
            let opened = tokio::select! {
                _ = self.cancel.cancelled() => break,
                r = self.opener.open() => r,
            };
            let transport = match opened {
                Ok(t) => t,
                Err(e) => {
                    tracing::warn!(target = %self.opener.describe(), "open failed: {}", e);
                    self.set_state(SessionState::Degraded);
                    continue;
                }
            };

            match self.drive(transport).await {
                Ended::Shutdown => break,
                Ended::Reconnect => {
                    tracing::info!("reconnect requested");
                    self.correlator.cancel_all();
                    self.set_state(SessionState::Disconnected);
                    immediate = true;
                }
                Ended::Lost(e) => {
                    tracing::warn!("transport lost: {}", e);
                    self.correlator.fail_all(e);
                    self.set_state(SessionState::Degraded);
                }
            }
        }

        self.correlator.cancel_all();
        self.commands.close();
        while let Ok(cmd) = self.commands.try_recv() {
            if let SessionCommand::Request { reply, .. } = cmd {
                let _ = reply.send(Err(ProtocolError::SessionClosed));
            }
        }
        self.set_state(SessionState::Disconnected);
        tracing::debug!("session stopped");
    }

    /// Run one connected period until shutdown, reconnect or transport loss
    async fn drive(&mut self, transport: BoxedTransport) -> Ended {
        let (reader, writer) = tokio::io::split(transport);
        let mut frames: Frames =
            FramedRead::new(reader, LineFramer::with_max_length(self.config.max_line_length));
        let mut sink: Sink = FramedWrite::new(writer, RequestEncoder);

        for request in RESYNC_REQUESTS.iter().cloned() {
            if let Err(e) = self.dispatch(&mut sink, request, None).await {
                return Ended::Lost(e);
            }
        }

        loop {
            self.refresh_state();
            let deadline = self.correlator.next_deadline();

            tokio::select! {
                _ = self.cancel.cancelled() => return Ended::Shutdown,

                frame = frames.next() => match frame {
                    Some(Ok(FramedLine::Line(raw))) => self.on_line(&raw),
                    Some(Ok(FramedLine::TooLong { discarded })) => {
                        let err = ProtocolError::FrameTooLong {
                            max: self.config.max_line_length,
                            discarded,
                        };
                        tracing::warn!("{}", err);
                    }
                    Some(Err(e)) => return Ended::Lost(e.into()),
                    None => {
                        return Ended::Lost(ProtocolError::Transport(
                            "controller closed the connection".to_string(),
                        ))
                    }
                },

                cmd = self.commands.recv() => match cmd {
                    None => return Ended::Shutdown,
                    Some(SessionCommand::Request { request, reply }) => {
                        if let Err(e) = self.dispatch(&mut sink, request, Some(reply)).await {
                            return Ended::Lost(e);
                        }
                    }
                    Some(SessionCommand::Cancel(kind)) => {
                        self.correlator.cancel(kind);
                    }
                    Some(SessionCommand::Reconnect) => return Ended::Reconnect,
                },

                _ = sleep_until(deadline) => {
                    for kind in self.correlator.expire(Instant::now()) {
                        tracing::warn!(%kind, "request timed out");
                    }
                }
            }
        }
    }

    fn on_line(&mut self, raw: &RawFrame) {
        // An open port only counts once the controller has spoken
        if *self.session_state.borrow() == SessionState::Connecting {
            self.backoff.reset();
            self.set_state(SessionState::Connected);
        }

        let record = match decode_line(&raw.text()) {
            Ok(record) => record,
            Err(e) => {
                tracing::warn!("discarding frame: {}", e);
                return;
            }
        };
        if let ResponseRecord::Unknown(line) = &record {
            tracing::debug!(line = %line, "unrecognized line");
            return;
        }

        self.state.send_if_modified(|s| s.apply(&record));
        match self.correlator.resolve(&record) {
            Resolution::Matched(kind) => tracing::trace!(%kind, "request resolved"),
            Resolution::Unsolicited => match &record {
                ResponseRecord::Failure(message) => {
                    tracing::warn!(?message, "failure reported with no setter outstanding")
                }
                ResponseRecord::Success => {
                    tracing::debug!("acknowledgement with no setter outstanding")
                }
                other => tracing::debug!(kind = ?other.kind(), "unsolicited push"),
            },
        }
    }

    /// Register and write one request
    ///
    /// Only transport failures are returned; request-level errors go to the
    /// issuer's reply channel.
    async fn dispatch(
        &mut self,
        sink: &mut Sink,
        request: Request,
        reply: Option<oneshot::Sender<Reply>>,
    ) -> Result<(), ProtocolError> {
        let mut immediate_reply = None;
        match request.slot() {
            Some(slot) => {
                if let Err((err, reply)) = self.correlator.register(slot, reply, Instant::now()) {
                    match reply {
                        Some(tx) => {
                            let _ = tx.send(Err(err));
                        }
                        None => tracing::debug!(kind = %slot, "resync request already in flight"),
                    }
                    return Ok(());
                }
            }
            None => immediate_reply = reply,
        }

        tracing::trace!(letter = %(request.letter() as char), "sending request");
        let result = match tokio::time::timeout(self.config.request_timeout, sink.send(request)).await
        {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(ProtocolError::from(e)),
            Err(_) => Err(ProtocolError::Transport("write timed out".to_string())),
        };
        if let Some(tx) = immediate_reply {
            let _ = tx.send(result.clone().map(|_| ResponseRecord::Success));
        }
        result
    }

    /// Wait out a backoff delay while offline
    ///
    /// Returns `false` on shutdown. A reconnect request ends the wait early.
    async fn wait_offline(&mut self, delay: Duration) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return false,
                _ = &mut sleep => return true,
                cmd = self.commands.recv() => match cmd {
                    None => return false,
                    Some(SessionCommand::Request { reply, .. }) => {
                        let _ = reply.send(Err(ProtocolError::NotConnected));
                    }
                    Some(SessionCommand::Cancel(_)) => {}
                    Some(SessionCommand::Reconnect) => return true,
                },
            }
        }
    }

    /// Park in `Failed` until an explicit reconnect; `false` on shutdown
    async fn wait_for_reconnect(&mut self, attempts: u32) -> bool {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return false,
                cmd = self.commands.recv() => match cmd {
                    None => return false,
                    Some(SessionCommand::Request { reply, .. }) => {
                        let _ = reply.send(Err(ProtocolError::ReconnectExhausted { attempts }));
                    }
                    Some(SessionCommand::Cancel(_)) => {}
                    Some(SessionCommand::Reconnect) => return true,
                },
            }
        }
    }

    fn refresh_state(&self) {
        let current = *self.session_state.borrow();
        if matches!(
            current,
            SessionState::Connected | SessionState::AwaitingResponse
        ) {
            let next = if self.correlator.is_empty() {
                SessionState::Connected
            } else {
                SessionState::AwaitingResponse
            };
            self.set_state(next);
        }
    }

    fn set_state(&self, next: SessionState) {
        let changed = self.session_state.send_if_modified(|s| {
            if *s == next {
                false
            } else {
                *s = next;
                true
            }
        });
        if changed {
            match next {
                SessionState::Connected | SessionState::AwaitingResponse => {
                    tracing::trace!(state = ?next, "session state")
                }
                _ => tracing::debug!(state = ?next, "session state"),
            }
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(d).await,
        None => std::future::pending().await,
    }
}

/// Cloneable handle to a running session
#[derive(Debug, Clone)]
pub struct SessionHandle {
    commands: mpsc::Sender<SessionCommand>,
    state: watch::Receiver<ControllerState>,
    session_state: watch::Receiver<SessionState>,
    cancel: CancellationToken,
}

impl SessionHandle {
    /// Send a raw request and wait for its outcome
    ///
    /// Fire-and-forget requests resolve with [`ResponseRecord::Success`] once
    /// written.
    pub async fn request(&self, request: Request) -> Reply {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(SessionCommand::Request { request, reply: tx })
            .await
            .map_err(|_| ProtocolError::SessionClosed)?;
        rx.await.map_err(|_| ProtocolError::SessionClosed)?
    }

    pub async fn request_version(&self) -> Result<FirmwareInfo, ProtocolError> {
        match self.request(Request::Version).await? {
            ResponseRecord::Version(info) => Ok(info),
            other => Err(unexpected(ResponseKind::Version, other)),
        }
    }

    pub async fn request_temperatures(&self) -> Result<Temperatures, ProtocolError> {
        match self.request(Request::Temperatures).await? {
            ResponseRecord::Temperatures(temps) => Ok(temps),
            other => Err(unexpected(ResponseKind::Temperatures, other)),
        }
    }

    pub async fn request_lcd(&self) -> Result<Vec<String>, ProtocolError> {
        match self.request(Request::Lcd).await? {
            ResponseRecord::LcdContent(lines) => Ok(lines),
            other => Err(unexpected(ResponseKind::LcdContent, other)),
        }
    }

    pub async fn request_settings(&self) -> Result<ControlSettings, ProtocolError> {
        match self.request(Request::Settings).await? {
            ResponseRecord::Settings(cs) => Ok(cs),
            other => Err(unexpected(ResponseKind::Settings, other)),
        }
    }

    pub async fn request_control_constants(&self) -> Result<ControlConstants, ProtocolError> {
        match self.request(Request::ControlConstants).await? {
            ResponseRecord::ControlConstants(cc) => Ok(cc),
            other => Err(unexpected(ResponseKind::ControlConstants, other)),
        }
    }

    pub async fn request_device_list(&self) -> Result<Vec<DeviceListItem>, ProtocolError> {
        match self.request(Request::DeviceList).await? {
            ResponseRecord::DeviceList(items) => Ok(items),
            other => Err(unexpected(ResponseKind::DeviceList, other)),
        }
    }

    /// Assign one control parameter (e.g. `beerSet`, `mode`)
    pub async fn set_parameter(
        &self,
        name: impl Into<String>,
        value: Value,
    ) -> Result<(), ProtocolError> {
        self.request(Request::SetParameter {
            name: name.into(),
            value,
        })
        .await
        .map(|_| ())
    }

    pub async fn set_control_settings(
        &self,
        settings: Map<String, Value>,
    ) -> Result<(), ProtocolError> {
        self.request(Request::SetControlSettings(settings))
            .await
            .map(|_| ())
    }

    pub async fn set_control_constants(
        &self,
        constants: Map<String, Value>,
    ) -> Result<(), ProtocolError> {
        self.request(Request::SetControlConstants(constants))
            .await
            .map(|_| ())
    }

    /// Install device definitions one at a time, each waiting for its ack
    pub async fn set_device_list(&self, devices: &[DeviceListItem]) -> Result<(), ProtocolError> {
        for device in devices {
            let definition = match serde_json::to_value(device) {
                Ok(Value::Object(map)) => map,
                Ok(other) => {
                    return Err(ProtocolError::Encode(format!(
                        "device definition is not an object: {}",
                        other
                    )))
                }
                Err(e) => return Err(ProtocolError::Encode(e.to_string())),
            };
            self.request(Request::SetDevice(definition)).await?;
        }
        Ok(())
    }

    pub async fn restart_device(&self) -> Result<(), ProtocolError> {
        self.request(Request::RestartDevice).await.map(|_| ())
    }

    pub async fn reset_eeprom(&self) -> Result<(), ProtocolError> {
        self.request(Request::ResetEeprom).await.map(|_| ())
    }

    pub async fn load_default_control_settings(&self) -> Result<(), ProtocolError> {
        self.request(Request::DefaultControlSettings)
            .await
            .map(|_| ())
    }

    pub async fn load_default_control_constants(&self) -> Result<(), ProtocolError> {
        self.request(Request::DefaultControlConstants)
            .await
            .map(|_| ())
    }

    /// Refresh every part of the controller state
    ///
    /// Requests already in flight count as refreshed.
    pub async fn resync(&self) -> Result<(), ProtocolError> {
        let results =
            futures::future::join_all(RESYNC_REQUESTS.iter().cloned().map(|r| self.request(r)))
                .await;
        for result in results {
            match result {
                Ok(_) | Err(ProtocolError::RequestAlreadyInFlight(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Release the pending request of `kind` with a cancellation
    pub async fn cancel_request(&self, kind: ResponseKind) -> Result<(), ProtocolError> {
        self.commands
            .send(SessionCommand::Cancel(kind))
            .await
            .map_err(|_| ProtocolError::SessionClosed)
    }

    /// Drop the transport and reconnect now; also leaves `Failed`
    pub async fn reconnect(&self) -> Result<(), ProtocolError> {
        self.commands
            .send(SessionCommand::Reconnect)
            .await
            .map_err(|_| ProtocolError::SessionClosed)
    }

    /// Stop the session task
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Current controller state
    pub fn snapshot(&self) -> ControllerState {
        self.state.borrow().clone()
    }

    /// Current session state
    pub fn session_state(&self) -> SessionState {
        *self.session_state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ControllerState> {
        self.state.clone()
    }

    pub fn subscribe_session_state(&self) -> watch::Receiver<SessionState> {
        self.session_state.clone()
    }
}

fn unexpected(expected: ResponseKind, got: ResponseRecord) -> ProtocolError {
    ProtocolError::Decode {
        prefix: expected.prefix().unwrap_or("").to_string(),
        reason: format!("expected {} response, got {:?}", expected, got.kind()),
    }
}
