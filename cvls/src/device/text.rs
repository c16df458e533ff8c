//! A unit reached through the text protocol.

use std::sync::Arc;
use std::time::Duration;

use crate::error::Result;
use crate::link::{CommandLink, TextLink, TextLinkConfig};
use crate::port::{Port, TcpPort};
use crate::transfer::{
    EngineConfig, TextConfigExport, TextConfigImport, TextFirmwareUpload, TextLogDownload,
    TransferEngine,
};

/// A unit on a serial line or the text socket, with one engine per
/// transfer kind. All engines share one link; only one of them should run
/// at a time.
pub struct TextDevice<P: Port + 'static> {
    link: Arc<TextLink<P>>,
    firmware: Arc<TransferEngine<TextFirmwareUpload<Arc<TextLink<P>>>>>,
    export: Arc<TransferEngine<TextConfigExport<Arc<TextLink<P>>>>>,
    import: Arc<TransferEngine<TextConfigImport<Arc<TextLink<P>>>>>,
    logs: Arc<TransferEngine<TextLogDownload<Arc<TextLink<P>>>>>,
}

impl<P: Port + 'static> TextDevice<P> {
    /// Drive a unit through `link`.
    pub fn new(link: TextLink<P>, engine: EngineConfig) -> Self {
        let link = Arc::new(link);
        Self {
            firmware: Arc::new(TransferEngine::new(
                TextFirmwareUpload::new(Arc::clone(&link)),
                engine.clone(),
            )),
            export: Arc::new(TransferEngine::new(
                TextConfigExport::new(Arc::clone(&link)),
                engine.clone(),
            )),
            import: Arc::new(TransferEngine::new(
                TextConfigImport::new(Arc::clone(&link)),
                engine.clone(),
            )),
            logs: Arc::new(TransferEngine::new(
                TextLogDownload::new(Arc::clone(&link)),
                engine,
            )),
            link,
        }
    }

    /// Open `port` with the default link settings.
    pub fn open(port: P, engine: EngineConfig) -> Result<Self> {
        Ok(Self::new(TextLink::new(port, TextLinkConfig::default())?, engine))
    }

    /// The shared link.
    pub fn link(&self) -> &Arc<TextLink<P>> {
        &self.link
    }

    /// Whether the link is up.
    pub fn is_connected(&self) -> bool {
        self.link.is_connected()
    }

    /// Firmware upload engine.
    pub fn firmware(&self) -> &Arc<TransferEngine<TextFirmwareUpload<Arc<TextLink<P>>>>> {
        &self.firmware
    }

    /// Configuration export engine.
    pub fn config_export(&self) -> &Arc<TransferEngine<TextConfigExport<Arc<TextLink<P>>>>> {
        &self.export
    }

    /// Configuration import engine.
    pub fn config_import(&self) -> &Arc<TransferEngine<TextConfigImport<Arc<TextLink<P>>>>> {
        &self.import
    }

    /// Log download engine.
    pub fn logs(&self) -> &Arc<TransferEngine<TextLogDownload<Arc<TextLink<P>>>>> {
        &self.logs
    }

    /// Firmware version reported by the unit.
    pub fn firmware_version(&self) -> Option<f64> {
        self.link.firmware_version()
    }

    /// Stop every transfer and close the port.
    pub fn disconnect(&self) -> Result<()> {
        self.firmware.stop();
        self.export.stop();
        self.import.stop();
        self.logs.stop();
        self.link.close()
    }
}

impl TextDevice<TcpPort> {
    /// Connect to the text socket of a unit.
    pub fn connect_tcp(host: &str, port: u16, timeout: Duration, engine: EngineConfig) -> Result<Self> {
        let tcp = TcpPort::connect((host, port), timeout)?;
        Self::open(tcp, engine)
    }
}

#[cfg(feature = "native")]
impl TextDevice<crate::port::NativePort> {
    /// Open a unit on a serial port.
    pub fn open_serial(config: &crate::port::SerialConfig, engine: EngineConfig) -> Result<Self> {
        let port = crate::port::NativePort::open(config)?;
        Self::open(port, engine)
    }
}
