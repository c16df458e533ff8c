//! Byte stream transports for the text protocol.
//!
//! A unit answers text commands on its RS-232 connector and on a TCP
//! socket. [`TextLink`](crate::link::TextLink) only needs a byte stream whose
//! reads give up after a while, so both transports hide behind [`Port`]:
//! [`NativePort`] for the serial line and [`TcpPort`] for the socket.

#[cfg(feature = "native")]
pub mod native;
pub mod tcp;

use std::io::{Read, Write};
use std::time::Duration;

use crate::error::Result;

/// Baud rate of the unit's RS-232 port.
pub const DEFAULT_BAUD_RATE: u32 = 115_200;

/// How long a serial read waits for the unit by default.
pub const DEFAULT_SERIAL_TIMEOUT: Duration = Duration::from_millis(500);

/// Settings for a serial connection. Units talk 8 data bits without flow
/// control; parity and stop bits are exposed for adapters that need them.
#[derive(Debug, Clone)]
pub struct SerialConfig {
    /// Device path, e.g. `/dev/ttyUSB0` or `COM3`.
    pub port_name: String,
    /// Line speed.
    pub baud_rate: u32,
    /// Read timeout.
    pub timeout: Duration,
    /// Parity, none for every known unit.
    pub parity: Parity,
    /// Stop bits, one for every known unit.
    pub stop_bits: StopBits,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self::new("", DEFAULT_BAUD_RATE)
    }
}

impl SerialConfig {
    /// Settings for `port_name` at `baud_rate`, 8N1.
    pub fn new(port_name: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port_name: port_name.into(),
            baud_rate,
            timeout: DEFAULT_SERIAL_TIMEOUT,
            parity: Parity::default(),
            stop_bits: StopBits::default(),
        }
    }

    /// Set the read timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the parity.
    #[must_use]
    pub fn with_parity(mut self, parity: Parity) -> Self {
        self.parity = parity;
        self
    }

    /// Set the stop bits.
    #[must_use]
    pub fn with_stop_bits(mut self, stop_bits: StopBits) -> Self {
        self.stop_bits = stop_bits;
        self
    }
}

/// Serial parity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Parity {
    /// No parity bit.
    #[default]
    None,
    /// Odd parity.
    Odd,
    /// Even parity.
    Even,
}

/// Serial stop bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StopBits {
    /// One stop bit.
    #[default]
    One,
    /// Two stop bits.
    Two,
}

/// A serial port found on this machine.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct PortInfo {
    /// Device path to open.
    pub name: String,
    /// Adapter details when the port sits behind USB.
    pub usb: Option<UsbInfo>,
}

/// What a USB serial adapter reports about itself.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct UsbInfo {
    /// Vendor ID.
    pub vid: u16,
    /// Product ID.
    pub pid: u16,
    /// Manufacturer string.
    pub manufacturer: Option<String>,
    /// Product string.
    pub product: Option<String>,
    /// Serial number.
    pub serial_number: Option<String>,
}

/// A byte stream to a unit.
///
/// Reads block for at most [`timeout`](Self::timeout) and then fail with
/// an error for which [`is_timeout`] holds.
pub trait Port: Read + Write + Send {
    /// Change the read timeout.
    fn set_timeout(&mut self, timeout: Duration) -> Result<()>;

    /// Current read timeout.
    fn timeout(&self) -> Duration;

    /// Drop bytes the unit sent that nobody read yet.
    fn clear_buffers(&mut self) -> Result<()>;

    /// Name for logs, e.g. the device path or `host:port`.
    fn name(&self) -> &str;

    /// Release the stream. Further reads and writes fail.
    fn close(&mut self) -> Result<()>;
}

impl<P: Port + ?Sized> Port for Box<P> {
    fn set_timeout(&mut self, timeout: Duration) -> Result<()> {
        (**self).set_timeout(timeout)
    }

    fn timeout(&self) -> Duration {
        (**self).timeout()
    }

    fn clear_buffers(&mut self) -> Result<()> {
        (**self).clear_buffers()
    }

    fn name(&self) -> &str {
        (**self).name()
    }

    fn close(&mut self) -> Result<()> {
        (**self).close()
    }
}

/// Source of the serial ports a unit could be attached to.
pub trait PortEnumerator {
    /// Every serial port on this machine.
    fn list_ports() -> Result<Vec<PortInfo>>;
}

/// Whether an I/O error only means no data arrived in time.
pub fn is_timeout(error: &std::io::Error) -> bool {
    matches!(
        error.kind(),
        std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock
    )
}

#[cfg(feature = "native")]
pub use native::{NativePort, NativePortEnumerator};
pub use tcp::TcpPort;
