//! Links to a unit.
//!
//! Transfer variants talk to the unit through one of two small traits:
//!
//! - [`FrameSink`]: the binary protocol. Commands go out as frames and the
//!   replies come back asynchronously, routed by the connection owner.
//! - [`CommandLink`]: the text protocol. Every command is answered
//!   synchronously with one or more lines.
//!
//! [`BinarySocket`] and [`TextLink`] are the real implementations; tests use
//! in-memory fakes.

pub mod binary;
pub mod text;

#[cfg(test)]
pub(crate) mod mock;

use crate::error::Result;
use crate::protocol::CommandWord;
use crate::protocol::text::{FIRMWARE_VERSION, parse_firmware_version};

pub use binary::{BinarySocket, FrameHandler, SocketConfig};
pub use text::{TextLink, TextLinkConfig};

/// Outbound half of a binary protocol link.
pub trait FrameSink: Send + Sync + 'static {
    /// Whether the link is up.
    fn is_connected(&self) -> bool;

    /// Send `command` carrying `data`. The header's data length is taken
    /// from `data`.
    fn send_command(&self, command: CommandWord, data: &[u8]) -> Result<()>;
}

/// A text protocol link with request/reply semantics.
pub trait CommandLink: Send + Sync + 'static {
    /// Whether the link is up.
    fn is_connected(&self) -> bool;

    /// Send a command and collect up to `max_lines` reply lines. Collection
    /// also ends at the end-of-reply marker line, which is included, or when
    /// the unit goes quiet.
    fn query(&self, command: &[u8], max_lines: usize) -> Result<Vec<String>>;

    /// Firmware version of the unit, `None` if it cannot be read.
    fn firmware_version(&self) -> Option<f64> {
        let lines = self.query(FIRMWARE_VERSION.as_bytes(), 1).ok()?;
        parse_firmware_version(lines.first()?)
    }
}

impl<T: FrameSink + ?Sized> FrameSink for std::sync::Arc<T> {
    fn is_connected(&self) -> bool {
        (**self).is_connected()
    }

    fn send_command(&self, command: CommandWord, data: &[u8]) -> Result<()> {
        (**self).send_command(command, data)
    }
}

impl<T: CommandLink + ?Sized> CommandLink for std::sync::Arc<T> {
    fn is_connected(&self) -> bool {
        (**self).is_connected()
    }

    fn query(&self, command: &[u8], max_lines: usize) -> Result<Vec<String>> {
        (**self).query(command, max_lines)
    }

    fn firmware_version(&self) -> Option<f64> {
        (**self).firmware_version()
    }
}
