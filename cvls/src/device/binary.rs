//! A unit reached over the binary socket.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use byteorder::{BigEndian, ByteOrder};
use log::{debug, info, trace, warn};

use crate::error::{Error, Result};
use crate::link::{BinarySocket, FrameSink, SocketConfig};
use crate::protocol::{AdminCommand, CommandSet, CommandWord, Frame, SystemCommand};
use crate::transfer::{
    ConfigExport, ConfigImport, EngineConfig, FirmwareUpload, LogDownload, Reply, TransferEngine,
    TransferVariant,
};

/// Firmware upload engine of a [`BinaryDevice`].
pub type BinaryFirmwareEngine = TransferEngine<FirmwareUpload<Arc<BinarySocket>>>;
/// Configuration export engine of a [`BinaryDevice`].
pub type BinaryExportEngine = TransferEngine<ConfigExport<Arc<BinarySocket>>>;
/// Configuration import engine of a [`BinaryDevice`].
pub type BinaryImportEngine = TransferEngine<ConfigImport<Arc<BinarySocket>>>;
/// Log download engine of a [`BinaryDevice`].
pub type BinaryLogEngine = TransferEngine<LogDownload<Arc<BinarySocket>>>;

/// How long [`BinaryDevice::firmware_version`] waits for the answer.
pub const FIRMWARE_VERSION_WAIT: Duration = Duration::from_millis(100);

/// How long [`BinaryDevice::login`] waits for the unit's verdict.
pub const LOGIN_WAIT: Duration = Duration::from_secs(1);

type MessageHandler = Arc<dyn Fn(&str) + Send + Sync>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A single answer the reader thread hands to a waiting caller.
struct Slot<T> {
    value: Mutex<Option<T>>,
    ready: Condvar,
}

impl<T> Default for Slot<T> {
    fn default() -> Self {
        Self {
            value: Mutex::new(None),
            ready: Condvar::new(),
        }
    }
}

impl<T: Clone> Slot<T> {
    fn clear(&self) {
        *lock(&self.value) = None;
    }

    fn fill(&self, value: T) {
        *lock(&self.value) = Some(value);
        self.ready.notify_all();
    }

    fn wait(&self, timeout: Duration) -> Option<T> {
        let value = lock(&self.value);
        let (value, _) = self
            .ready
            .wait_timeout_while(value, timeout, |v| v.is_none())
            .unwrap_or_else(PoisonError::into_inner);
        value.clone()
    }
}

fn broadcast(handlers: &Mutex<Vec<MessageHandler>>, message: &str) {
    let handlers: Vec<MessageHandler> = lock(handlers).clone();
    for handler in handlers {
        handler(message);
    }
}

/// Credentials go out as ASCII; anything else becomes `?`.
fn ascii_bytes(text: &str) -> Vec<u8> {
    text.chars()
        .map(|c| if c.is_ascii() { c as u8 } else { b'?' })
        .collect()
}

/// Dispatches frames from the reader thread. Holds the engines weakly
/// since they own the socket that owns this router.
struct Router {
    firmware: Weak<BinaryFirmwareEngine>,
    export: Weak<BinaryExportEngine>,
    import: Weak<BinaryImportEngine>,
    logs: Weak<BinaryLogEngine>,
    version: Arc<Slot<String>>,
    login: Arc<Slot<bool>>,
    messages: Arc<Mutex<Vec<MessageHandler>>>,
    unknown: Arc<AtomicU64>,
}

/// `page (BE u16) + data`.
fn page_reply(data: &[u8]) -> Option<Reply> {
    if data.len() < 2 {
        return None;
    }
    Some(Reply::Page {
        page: BigEndian::read_u16(&data[0..2]),
        data: data[2..].to_vec(),
    })
}

fn deliver<V: TransferVariant>(engine: &Weak<TransferEngine<V>>, reply: Option<Reply>) {
    match (engine.upgrade(), reply) {
        (Some(engine), Some(reply)) => engine.receive(reply),
        (_, None) => debug!("Malformed {} reply", V::NAME),
        (None, _) => {}
    }
}

fn deliver_count<V: TransferVariant>(engine: &Weak<TransferEngine<V>>, data: &[u8]) {
    if data.len() < 4 {
        debug!("Malformed {} count", V::NAME);
        return;
    }
    if let Some(engine) = engine.upgrade() {
        engine.set_page_count(BigEndian::read_u32(&data[0..4]));
    }
}

impl Router {
    fn route(&self, frame: Frame) {
        let command = frame.command;
        if command.command_type != 0 {
            self.unknown(command);
            return;
        }
        match command.set {
            CommandSet::System => self.route_system(command, &frame.data),
            CommandSet::Admin => self.route_admin(command, &frame.data),
            _ => self.unknown(command),
        }
    }

    fn route_system(&self, command: CommandWord, data: &[u8]) {
        match command.system_command() {
            Some(SystemCommand::Disconnect) => {
                self.broadcast("Client forcefully disconnected!");
            }
            Some(SystemCommand::MessageString) => {
                let message = String::from_utf8_lossy(data);
                info!("Unit: {message}");
                self.broadcast(&message);
            }
            Some(SystemCommand::LoginRequest) => self.broadcast("Please Log In!"),
            Some(SystemCommand::LoginSuccessful) => {
                debug!("Login accepted");
                self.login.fill(true);
            }
            Some(SystemCommand::LoginFailed) => {
                self.broadcast("Login Failed! Incorrect Username or Password.");
                self.login.fill(false);
            }
            Some(SystemCommand::FirmwareVersion) => {
                let version = String::from_utf8_lossy(data).trim().to_string();
                debug!("Unit firmware {version}");
                self.version.fill(version);
            }
            Some(other) => trace!("Ignoring {other:?}"),
            None => self.unknown(command),
        }
    }

    fn route_admin(&self, command: CommandWord, data: &[u8]) {
        match command.admin_command() {
            Some(AdminCommand::Firmware) => deliver(&self.firmware, page_reply(data)),
            Some(AdminCommand::ConfigExport) => deliver(&self.export, page_reply(data)),
            Some(AdminCommand::ConfigImport) => deliver(&self.import, page_reply(data)),
            Some(AdminCommand::LogsRead) => deliver(&self.logs, page_reply(data)),
            Some(AdminCommand::ConfigExportCount) => deliver_count(&self.export, data),
            Some(AdminCommand::LogsCount) => deliver_count(&self.logs, data),
            Some(AdminCommand::ConfigImportComplete) => {
                let reply = data.first().map(|&ok| Reply::ImportComplete { success: ok != 0 });
                deliver(&self.import, reply);
            }
            Some(AdminCommand::ConfigImportLogRead) => {
                let report = String::from_utf8_lossy(data).into_owned();
                deliver(&self.import, Some(Reply::ImportLog(report)));
            }
            Some(other) => trace!("Ignoring {other:?}"),
            None => self.unknown(command),
        }
    }

    fn broadcast(&self, message: &str) {
        broadcast(&self.messages, message);
    }

    fn unknown(&self, command: CommandWord) {
        self.unknown.fetch_add(1, Ordering::Relaxed);
        debug!("Unhandled frame {command:?}");
    }
}

/// A unit connected through the binary protocol, with one engine per
/// transfer kind.
pub struct BinaryDevice {
    socket: Arc<BinarySocket>,
    firmware: Arc<BinaryFirmwareEngine>,
    export: Arc<BinaryExportEngine>,
    import: Arc<BinaryImportEngine>,
    logs: Arc<BinaryLogEngine>,
    version: Arc<Slot<String>>,
    login: Arc<Slot<bool>>,
    messages: Arc<Mutex<Vec<MessageHandler>>>,
    unknown: Arc<AtomicU64>,
}

impl BinaryDevice {
    /// Connect to a unit.
    pub fn connect(socket: SocketConfig, engine: EngineConfig) -> Result<Self> {
        Ok(Self::new(BinarySocket::connect(socket)?, engine))
    }

    /// Take over a connected socket.
    pub fn new(socket: BinarySocket, engine: EngineConfig) -> Self {
        let socket = Arc::new(socket);
        let firmware = Arc::new(TransferEngine::new(
            FirmwareUpload::new(Arc::clone(&socket)),
            engine.clone(),
        ));
        let export = Arc::new(TransferEngine::new(
            ConfigExport::new(Arc::clone(&socket)),
            engine.clone(),
        ));
        let import = Arc::new(TransferEngine::new(
            ConfigImport::new(Arc::clone(&socket)),
            engine.clone(),
        ));
        let logs = Arc::new(TransferEngine::new(
            LogDownload::new(Arc::clone(&socket)),
            engine,
        ));

        let device = Self {
            socket,
            firmware,
            export,
            import,
            logs,
            version: Arc::default(),
            login: Arc::default(),
            messages: Arc::default(),
            unknown: Arc::default(),
        };

        let router = Router {
            firmware: Arc::downgrade(&device.firmware),
            export: Arc::downgrade(&device.export),
            import: Arc::downgrade(&device.import),
            logs: Arc::downgrade(&device.logs),
            version: Arc::clone(&device.version),
            login: Arc::clone(&device.login),
            messages: Arc::clone(&device.messages),
            unknown: Arc::clone(&device.unknown),
        };
        device.socket.on_frame(move |frame| router.route(frame));
        device
    }

    /// The underlying socket.
    pub fn socket(&self) -> &Arc<BinarySocket> {
        &self.socket
    }

    /// Whether the link is up.
    pub fn is_connected(&self) -> bool {
        self.socket.is_connected()
    }

    /// Firmware upload engine.
    pub fn firmware(&self) -> &Arc<BinaryFirmwareEngine> {
        &self.firmware
    }

    /// Configuration export engine.
    pub fn config_export(&self) -> &Arc<BinaryExportEngine> {
        &self.export
    }

    /// Configuration import engine.
    pub fn config_import(&self) -> &Arc<BinaryImportEngine> {
        &self.import
    }

    /// Log download engine.
    pub fn logs(&self) -> &Arc<BinaryLogEngine> {
        &self.logs
    }

    /// Call `handler` with every message the unit pushes.
    pub fn on_message<F>(&self, handler: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        lock(&self.messages).push(Arc::new(handler));
    }

    /// Frames that no handler recognized.
    pub fn unknown_frames(&self) -> u64 {
        self.unknown.load(Ordering::Relaxed)
    }

    /// Ask the unit for its firmware version string.
    pub fn firmware_version(&self) -> Option<String> {
        self.version.clear();
        let request = CommandWord::system(SystemCommand::FirmwareVersion);
        if let Err(e) = self.socket.send_command(request, &[]) {
            warn!("Firmware version not requested: {e}");
            return None;
        }
        self.version.wait(FIRMWARE_VERSION_WAIT)
    }

    /// Log in with `user` and `password`, which unlocks the command sets
    /// the account is entitled to.
    ///
    /// Returns whether the unit accepted the credentials. Fails with
    /// [`Error::Timeout`] if the unit gives no verdict within
    /// [`LOGIN_WAIT`].
    pub fn login(&self, user: &str, password: &str) -> Result<bool> {
        if !self.is_connected() {
            broadcast(
                &self.messages,
                "Please connect to a unit before trying to log in!",
            );
            return Err(Error::NotConnected);
        }

        self.login.clear();
        let username = CommandWord::system(SystemCommand::LoginUsername).with_write(true);
        self.socket.send_command(username, &ascii_bytes(user))?;
        let password_word = CommandWord::system(SystemCommand::LoginPassword).with_write(true);
        self.socket.send_command(password_word, &ascii_bytes(password))?;

        match self.login.wait(LOGIN_WAIT) {
            Some(true) => {
                info!("Logged in as {user}");
                Ok(true)
            }
            Some(false) => {
                warn!("Unit rejected the login for {user}");
                Ok(false)
            }
            None => Err(Error::Timeout(format!(
                "no login verdict within {LOGIN_WAIT:?}"
            ))),
        }
    }

    /// Drop the login privileges of this connection.
    pub fn logout(&self) -> Result<()> {
        let logout = CommandWord::system(SystemCommand::Logout).with_write(true);
        self.socket.send_command(logout, &[])?;
        debug!("Logged out");
        Ok(())
    }

    /// Stop every transfer and close the link.
    pub fn disconnect(&self) {
        self.firmware.stop();
        self.export.stop();
        self.import.stop();
        self.logs.stop();
        self.socket.disconnect();
    }
}
