//! Paginated transfers.
//!
//! [`engine`] holds the shared state machine; the other modules implement
//! one [`TransferVariant`] per kind of transfer and protocol flavor:
//!
//! | Transfer            | Binary socket            | Text protocol                |
//! |---------------------|--------------------------|------------------------------|
//! | Firmware upload     | [`FirmwareUpload`]       | [`TextFirmwareUpload`]       |
//! | Configuration export| [`ConfigExport`]         | [`TextConfigExport`]         |
//! | Configuration import| [`ConfigImport`]         | [`TextConfigImport`]         |
//! | Log download        | [`LogDownload`]          | [`TextLogDownload`]          |

pub mod config_export;
pub mod config_import;
pub mod engine;
pub mod firmware;
pub mod logs;
pub mod status;

use byteorder::{BigEndian, ByteOrder};

use crate::link::CommandLink;
use crate::protocol::text::{ReplyError, count_request, parse_count};

pub use config_export::{ConfigExport, TextConfigExport};
pub use config_import::{ConfigImport, TextConfigImport};
pub use engine::{
    Dispatch, EngineConfig, Failure, PageCursor, Plan, Reply, TransferEngine, TransferVariant,
    Verdict,
};
pub use firmware::{FirmwareCommands, FirmwareUpload, TextFirmwareUpload};
pub use logs::{LogDownload, LogEntry, TextLogDownload};
pub use status::{TransferState, TransferStatus};

/// Oldest unit firmware that supports text protocol transfers.
pub const MIN_TEXT_FIRMWARE: f64 = 1.14;

/// An upload payload split into fixed-size pages.
#[derive(Debug, Clone, Default)]
pub(crate) struct PagedPayload {
    data: Vec<u8>,
    page_size: usize,
    pages_per_send: u32,
}

impl PagedPayload {
    pub(crate) fn new(page_size: usize, pages_per_send: u32) -> Self {
        Self {
            data: Vec::new(),
            page_size,
            pages_per_send,
        }
    }

    pub(crate) fn load(&mut self, data: Vec<u8>) {
        self.data = data;
    }

    pub(crate) fn len(&self) -> usize {
        self.data.len()
    }

    /// Number of pages of `page_size`, the last one possibly short.
    pub(crate) fn page_count(&self) -> u32 {
        u32::try_from(self.data.len().div_ceil(self.page_size)).unwrap_or(u32::MAX)
    }

    /// Data covered by one send at `cursor`.
    pub(crate) fn chunk(&self, cursor: &PageCursor) -> &[u8] {
        let start = cursor.pointer.min(self.data.len());
        let end = (start + self.page_size * self.pages_per_send as usize).min(self.data.len());
        &self.data[start..end]
    }

    /// `page (BE) + chunk`, the binary page payload and its expected echo.
    pub(crate) fn indexed_chunk(&self, cursor: &PageCursor) -> Vec<u8> {
        let chunk = self.chunk(cursor);
        let mut out = Vec::with_capacity(chunk.len() + 2);
        out.extend_from_slice(&wire_page(cursor.page).to_be_bytes());
        out.extend_from_slice(chunk);
        out
    }

    /// Whether a binary echo matches what was sent at `cursor`.
    pub(crate) fn is_echo(&self, cursor: &PageCursor, page: u16, data: &[u8]) -> bool {
        page == wire_page(cursor.page) && data == self.chunk(cursor)
    }

    pub(crate) fn advance(&self, cursor: &PageCursor) -> Verdict {
        Verdict::Advance {
            bytes: self.chunk(cursor).len(),
            pages: self.pages_per_send,
        }
    }
}

/// Page index as carried on the wire.
pub(crate) fn wire_page(page: u32) -> u16 {
    (page & 0xFFFF) as u16
}

/// `page (BE)` request payload.
pub(crate) fn page_request_bytes(page: u32) -> [u8; 2] {
    let mut out = [0u8; 2];
    BigEndian::write_u16(&mut out, wire_page(page));
    out
}

/// Check the unit firmware for text protocol transfers.
pub(crate) fn check_text_firmware<L: CommandLink>(link: &L) -> Result<(), Failure> {
    match link.firmware_version() {
        Some(version) if version >= MIN_TEXT_FIRMWARE => Ok(()),
        version => {
            log::warn!("Unit firmware {version:?} is older than {MIN_TEXT_FIRMWARE}");
            Err(Failure::new(TransferState::FailedInvalidFirmware))
        }
    }
}

/// Ask the unit how many pages `command` has, e.g. `&@e?`.
pub(crate) fn query_count<L: CommandLink>(link: &L, command: &str) -> Option<u32> {
    let lines = link.query(&count_request(command), 1).ok()?;
    parse_count(command, lines.first()?)
}

/// Verdict for a text reply that did not acknowledge the page.
pub(crate) fn text_miss(command: &str, lines: &[String]) -> Verdict {
    match lines.first() {
        None => Verdict::Missed(Some("Lost Connection".to_string())),
        Some(line) => Verdict::Missed(
            ReplyError::parse(command, line).map(|error| error.message().to_string()),
        ),
    }
}
