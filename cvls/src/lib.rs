//! # cvls
//!
//! Host-side driver for CVLS LED light source controllers.
//!
//! Units speak two protocols: a framed binary protocol on a TCP socket and a
//! line-based text protocol on RS-232 or a second socket. Both carry the same
//! paginated transfers:
//!
//! - firmware upload
//! - configuration export and import
//! - event log download
//!
//! Every transfer runs on its own worker thread inside a
//! [`TransferEngine`](transfer::TransferEngine) that retries missed pages,
//! tracks progress and reports a final [`TransferState`].
//!
//! ## Features
//!
//! - `native` (default): serial port support via `serialport`
//! - `serde`: `Serialize` for status and data types
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use cvls::device::BinaryDevice;
//! use cvls::link::SocketConfig;
//! use cvls::transfer::{EngineConfig, TransferState};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let device = BinaryDevice::connect(
//!         SocketConfig::new("192.168.0.2", 5000),
//!         EngineConfig::default(),
//!     )?;
//!
//!     let status = device.logs().run((), Duration::from_secs(30));
//!     if status.state == TransferState::Succeeded {
//!         device.logs().inspect(|download| {
//!             for entry in download.logs() {
//!                 println!("{entry}");
//!             }
//!         });
//!     }
//!     device.disconnect();
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod device;
pub mod error;
pub mod link;
pub mod port;
pub mod protocol;
pub mod transfer;

#[cfg(feature = "native")]
pub use port::{NativePort, NativePortEnumerator};
pub use {
    device::{BinaryDevice, TextDevice},
    error::{Error, Result},
    link::{BinarySocket, CommandLink, FrameSink, SocketConfig, TextLink, TextLinkConfig},
    port::{Port, PortEnumerator, PortInfo, SerialConfig, TcpPort, UsbInfo},
    protocol::{CommandWord, Frame, FrameDecoder, fletcher16},
    transfer::{EngineConfig, LogEntry, TransferEngine, TransferState, TransferStatus},
};
