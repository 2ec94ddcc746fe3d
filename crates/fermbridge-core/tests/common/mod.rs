//! Shared harness: in-memory controller links and a recording remote service

#![allow(dead_code)]

use async_trait::async_trait;
use fermbridge_core::api::{
    ApiError, Credentials, FermentrackApi, Registration, RegistrationRequest, RemoteCommand,
    RemoteConfig, StatusResponse,
};
use fermbridge_core::controller::{ControllerStatus, FullConfig};
use fermbridge_core::protocol::{BoxedTransport, ProtocolError, TransportOpener};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

pub const VERSION_LINE: &str =
    r#"N:{"v":"0.2.4","n":"6d422d6","c":"6d422d6","s":0,"y":0,"b":"m","l":"1","e":"0.15"}"#;
pub const TEMPS_LINE: &str = r#"T:{"BeerTemp":19.5,"FridgeTemp":18.25,"RoomTemp":null}"#;
pub const LCD_LINE: &str =
    r#"L:["Mode   Beer Const.","Beer   19.5  20.0 C","Fridge 18.2  18.0 C","Idling for 01m12"]"#;
pub const SETTINGS_LINE: &str =
    r#"S:{"mode":"b","beerSet":20.0,"fridgeSet":18.0,"heatEst":0.2,"coolEst":5.0}"#;
pub const CONSTANTS_LINE: &str =
    r#"C:{"tempFormat":"C","tempSetMin":1.0,"tempSetMax":30.0,"Kp":5.0}"#;
pub const DEVICES_LINE: &str =
    r#"h:[{"i":0,"c":1,"b":0,"f":0,"h":1,"p":10,"x":1,"d":0},{"i":1,"c":1,"b":1,"f":9,"h":2,"p":6,"x":0,"d":0,"a":"28FF93A4711603A3","j":0.0,"v":19.5}]"#;
pub const ACK_LINE: &str = r#"{"success":true}"#;

/// Send session and worker logs to the captured test output
///
/// `RUST_LOG` overrides the default `warn` level. Safe to call from every test.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(filter)
        .try_init();
}

/// Opens in-memory pipes; the controller ends are handed to the test
pub struct DuplexOpener {
    links: mpsc::UnboundedSender<DuplexStream>,
    available: AtomicBool,
    opens: AtomicUsize,
}

impl DuplexOpener {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<DuplexStream>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let opener = Arc::new(Self {
            links: tx,
            available: AtomicBool::new(true),
            opens: AtomicUsize::new(0),
        });
        (opener, rx)
    }

    /// Make subsequent opens fail (port unplugged) or succeed again
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TransportOpener for DuplexOpener {
    async fn open(&self) -> Result<BoxedTransport, ProtocolError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        if !self.available.load(Ordering::SeqCst) {
            return Err(ProtocolError::PortNotFound("duplex".to_string()));
        }
        let (ours, theirs) = tokio::io::duplex(8192);
        self.links
            .send(theirs)
            .map_err(|_| ProtocolError::Transport("test harness gone".to_string()))?;
        Ok(Box::new(ours))
    }

    fn describe(&self) -> String {
        "duplex".to_string()
    }
}

/// The controller side of one link, driven by hand
pub struct ControllerLink {
    reader: BufReader<ReadHalf<DuplexStream>>,
    writer: WriteHalf<DuplexStream>,
}

impl ControllerLink {
    pub fn new(stream: DuplexStream) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            reader: BufReader::new(reader),
            writer,
        }
    }

    /// Next command line from the session, without its newline
    pub async fn next_command(&mut self) -> Option<String> {
        let mut line = String::new();
        match self.reader.read_line(&mut line).await {
            Ok(0) | Err(_) => None,
            Ok(_) => Some(line.trim_end_matches('\n').to_string()),
        }
    }

    pub async fn expect_command(&mut self, expected: &str) {
        let got = self.next_command().await;
        assert_eq!(got.as_deref(), Some(expected));
    }

    pub async fn send_line(&mut self, line: &str) {
        self.writer
            .write_all(format!("{}\r\n", line).as_bytes())
            .await
            .unwrap();
    }

    pub async fn send_raw(&mut self, bytes: &[u8]) {
        self.writer.write_all(bytes).await.unwrap();
    }

    /// Answer the six requests a session sends after connecting
    pub async fn answer_resync(&mut self) {
        for _ in 0..6 {
            let command = self.next_command().await.expect("resync command");
            match reply_for(&command) {
                Some(reply) => self.send_line(reply).await,
                None => panic!("unexpected resync command {:?}", command),
            }
        }
    }
}

/// Canned controller reply for a command; `None` for fire-and-forget
pub fn reply_for(command: &str) -> Option<&'static str> {
    match command {
        "n" => Some(VERSION_LINE),
        "t" => Some(TEMPS_LINE),
        "l" => Some(LCD_LINE),
        "s" => Some(SETTINGS_LINE),
        "c" => Some(CONSTANTS_LINE),
        "h{}" => Some(DEVICES_LINE),
        c if c.starts_with('j') || c.starts_with('U') => Some(ACK_LINE),
        _ => None,
    }
}

/// Answers every command with canned lines and records what it received
pub fn spawn_fake_controller(
    mut links: mpsc::UnboundedReceiver<DuplexStream>,
) -> Arc<Mutex<Vec<String>>> {
    let received = Arc::new(Mutex::new(Vec::new()));
    let log = received.clone();
    tokio::spawn(async move {
        while let Some(stream) = links.recv().await {
            let log = log.clone();
            tokio::spawn(async move {
                let mut link = ControllerLink::new(stream);
                while let Some(command) = link.next_command().await {
                    log.lock().unwrap().push(command.clone());
                    if let Some(reply) = reply_for(&command) {
                        link.send_line(reply).await;
                    }
                }
            });
        }
    });
    received
}

/// One call made against [`MockApi`]
#[derive(Debug, Clone, PartialEq)]
pub enum ApiCall {
    Status {
        device_id: String,
        api_key: String,
        status: ControllerStatus,
    },
    FetchMessages,
    MarkProcessed(RemoteCommand),
    SendFullConfig(FullConfig),
    FetchFullConfig,
    Register(RegistrationRequest),
}

/// Scriptable in-memory remote service
#[derive(Default)]
pub struct MockApi {
    calls: Mutex<Vec<ApiCall>>,
    status_replies: Mutex<VecDeque<Result<StatusResponse, ApiError>>>,
    message_batches: Mutex<VecDeque<Vec<RemoteCommand>>>,
    remote_config: Mutex<RemoteConfig>,
    registration: Mutex<Option<Result<Registration, ApiError>>>,
    /// Device ids the service has forgotten
    unknown_devices: Mutex<Vec<String>>,
    /// Delay applied to every status push
    status_delay: Mutex<Option<Duration>>,
    /// Every device endpoint answers 503
    unavailable: AtomicBool,
}

impl MockApi {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn calls(&self) -> Vec<ApiCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn status_pushes(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, ApiCall::Status { .. }))
            .count()
    }

    pub fn queue_status_reply(&self, reply: Result<StatusResponse, ApiError>) {
        self.status_replies.lock().unwrap().push_back(reply);
    }

    pub fn queue_messages(&self, commands: Vec<RemoteCommand>) {
        self.message_batches.lock().unwrap().push_back(commands);
    }

    pub fn set_remote_config(&self, config: RemoteConfig) {
        *self.remote_config.lock().unwrap() = config;
    }

    pub fn set_registration(&self, reply: Result<Registration, ApiError>) {
        *self.registration.lock().unwrap() = Some(reply);
    }

    pub fn forget_device(&self, device_id: &str) {
        self.unknown_devices
            .lock()
            .unwrap()
            .push(device_id.to_string());
    }

    pub fn set_status_delay(&self, delay: Duration) {
        *self.status_delay.lock().unwrap() = Some(delay);
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn record(&self, call: ApiCall) {
        self.calls.lock().unwrap().push(call);
    }

    fn check_known(&self, creds: &Credentials) -> Result<(), ApiError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(ApiError::Http {
                status: 503,
                body: "maintenance".to_string(),
            });
        }
        if self.unknown_devices.lock().unwrap().contains(&creds.device_id) {
            return Err(ApiError::RegistrationRequired);
        }
        Ok(())
    }
}

#[async_trait]
impl FermentrackApi for MockApi {
    async fn send_status(
        &self,
        creds: &Credentials,
        status: &ControllerStatus,
    ) -> Result<StatusResponse, ApiError> {
        let delay = *self.status_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.check_known(creds)?;
        self.record(ApiCall::Status {
            device_id: creds.device_id.clone(),
            api_key: creds.api_key.clone(),
            status: status.clone(),
        });
        self.status_replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(StatusResponse::default()))
    }

    async fn fetch_messages(&self, creds: &Credentials) -> Result<Vec<RemoteCommand>, ApiError> {
        self.check_known(creds)?;
        self.record(ApiCall::FetchMessages);
        Ok(self
            .message_batches
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_default())
    }

    async fn mark_message_processed(
        &self,
        creds: &Credentials,
        command: RemoteCommand,
    ) -> Result<(), ApiError> {
        self.check_known(creds)?;
        self.record(ApiCall::MarkProcessed(command));
        Ok(())
    }

    async fn send_full_config(
        &self,
        creds: &Credentials,
        config: &FullConfig,
    ) -> Result<(), ApiError> {
        self.check_known(creds)?;
        self.record(ApiCall::SendFullConfig(config.clone()));
        Ok(())
    }

    async fn fetch_full_config(&self, creds: &Credentials) -> Result<RemoteConfig, ApiError> {
        self.check_known(creds)?;
        self.record(ApiCall::FetchFullConfig);
        Ok(self.remote_config.lock().unwrap().clone())
    }

    async fn register_device(
        &self,
        request: &RegistrationRequest,
    ) -> Result<Registration, ApiError> {
        self.record(ApiCall::Register(request.clone()));
        self.registration
            .lock()
            .unwrap()
            .clone()
            .unwrap_or_else(|| Err(ApiError::Http {
                status: 500,
                body: "no registration scripted".to_string(),
            }))
    }
}
