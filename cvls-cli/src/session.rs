//! An open connection to one unit, whichever protocol it speaks.

use anyhow::{Context, Result};
use cvls::port::{NativePort, Port, SerialConfig, TcpPort};
use cvls::{BinaryDevice, EngineConfig, LogEntry, SocketConfig, TextDevice, TransferStatus};
use console::style;
use log::{debug, info, warn};
use std::time::Duration;

use crate::commands::transfer::{Progress, drive};
use crate::config::Protocol;

/// How long to wait for the unit to accept a TCP connection.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Where the unit is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Target {
    /// Text protocol on an RS-232 port.
    Serial { port: String, baud: u32 },
    /// Either protocol on a TCP socket.
    Tcp {
        host: String,
        port: u16,
        protocol: Protocol,
    },
}

impl std::fmt::Display for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Serial { port, baud } => write!(f, "{port} @ {baud} baud (text)"),
            Self::Tcp {
                host,
                port,
                protocol: Protocol::Binary,
            } => write!(f, "{host}:{port} (binary)"),
            Self::Tcp { host, port, .. } => write!(f, "{host}:{port} (text)"),
        }
    }
}

/// Binary protocol login.
#[derive(Clone, PartialEq, Eq)]
pub(crate) struct Credentials {
    pub(crate) user: String,
    pub(crate) password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .finish_non_exhaustive()
    }
}

/// Everything needed to reach a unit and run one transfer on it.
pub(crate) struct UnitOptions {
    pub(crate) target: Target,
    pub(crate) credentials: Option<Credentials>,
    pub(crate) engine: EngineConfig,
    pub(crate) progress: Progress,
    pub(crate) quiet: bool,
}

impl UnitOptions {
    /// Connect and announce the unit.
    pub(crate) fn connect(&self) -> Result<Session> {
        if !self.quiet {
            eprintln!("{} Connecting to {}", style("🔌").cyan(), self.target);
        }
        let session = Session::open(&self.target, self.engine.clone())?;
        match session.firmware_version() {
            Some(version) => info!("Unit firmware {version}"),
            None => debug!("Unit did not report its firmware version"),
        }
        if let Some(credentials) = &self.credentials {
            if let Err(e) = session.login(credentials) {
                session.close();
                return Err(e);
            }
        }
        Ok(session)
    }
}

pub(crate) enum Session {
    Binary(BinaryDevice),
    Text(TextDevice<Box<dyn Port>>),
}

impl Session {
    /// Connect to `target`.
    pub(crate) fn open(target: &Target, engine: EngineConfig) -> Result<Self> {
        debug!("Connecting to {target}");
        let session = match target {
            Target::Serial { port, baud } => {
                let serial = NativePort::open(&SerialConfig::new(port.as_str(), *baud))
                    .with_context(|| format!("Failed to open serial port {port}"))?;
                Self::Text(TextDevice::open(Box::new(serial) as Box<dyn Port>, engine)?)
            },
            Target::Tcp {
                host,
                port,
                protocol: Protocol::Binary,
            } => {
                let config =
                    SocketConfig::new(host.as_str(), *port).with_connect_timeout(CONNECT_TIMEOUT);
                let device = BinaryDevice::connect(config, engine)
                    .with_context(|| format!("Failed to connect to {host}:{port}"))?;
                device.on_message(|message| info!("Unit: {message}"));
                Self::Binary(device)
            },
            Target::Tcp { host, port, .. } => {
                let tcp = TcpPort::connect((host.as_str(), *port), CONNECT_TIMEOUT)
                    .with_context(|| format!("Failed to connect to {host}:{port}"))?;
                Self::Text(TextDevice::open(Box::new(tcp) as Box<dyn Port>, engine)?)
            },
        };
        Ok(session)
    }

    /// Firmware version reported by the unit, if it answers.
    pub(crate) fn firmware_version(&self) -> Option<String> {
        match self {
            Self::Binary(device) => device.firmware_version(),
            Self::Text(device) => device.firmware_version().map(|v| format!("{v:.2}")),
        }
    }

    /// Log in on a binary session. Text units have no login.
    pub(crate) fn login(&self, credentials: &Credentials) -> Result<()> {
        match self {
            Self::Binary(device) => {
                let accepted = device
                    .login(&credentials.user, &credentials.password)
                    .with_context(|| format!("Failed to log in as {}", credentials.user))?;
                if !accepted {
                    anyhow::bail!(
                        "Login as {} rejected: incorrect user name or password",
                        credentials.user
                    );
                }
                Ok(())
            },
            Self::Text(_) => {
                warn!("Ignoring --user: the text protocol has no login");
                Ok(())
            },
        }
    }

    pub(crate) fn upload_firmware(&self, image: Vec<u8>, progress: &Progress) -> Result<TransferStatus> {
        match self {
            Self::Binary(device) => drive(device.firmware(), image, progress),
            Self::Text(device) => drive(device.firmware(), image, progress),
        }
    }

    pub(crate) fn export_config(&self, progress: &Progress) -> Result<String> {
        match self {
            Self::Binary(device) => {
                drive(device.config_export(), (), progress)?;
                Ok(device.config_export().inspect(|export| export.text()))
            },
            Self::Text(device) => {
                drive(device.config_export(), (), progress)?;
                Ok(device.config_export().inspect(|export| export.text()))
            },
        }
    }

    pub(crate) fn import_config(&self, file: Vec<u8>, progress: &Progress) -> Result<TransferStatus> {
        match self {
            Self::Binary(device) => drive(device.config_import(), file, progress),
            Self::Text(device) => drive(device.config_import(), file, progress),
        }
    }

    pub(crate) fn download_logs(&self, progress: &Progress) -> Result<Vec<LogEntry>> {
        match self {
            Self::Binary(device) => {
                drive(device.logs(), (), progress)?;
                Ok(device.logs().inspect(|download| download.logs().to_vec()))
            },
            Self::Text(device) => {
                drive(device.logs(), (), progress)?;
                Ok(device.logs().inspect(|download| download.logs().to_vec()))
            },
        }
    }

    /// Stop all transfers and release the link.
    pub(crate) fn close(self) {
        match self {
            Self::Binary(device) => device.disconnect(),
            Self::Text(device) => {
                if let Err(e) = device.disconnect() {
                    warn!("Failed to close link: {e}");
                }
            },
        }
    }
}
