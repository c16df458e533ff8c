//! Firmware upload.
//!
//! The image goes out in 256-byte pages, four pages per send, so the page
//! index advances by four with every acknowledged send. Images longer than
//! 16 bytes carry their own length as a big-endian `u32` at offset 12.

use byteorder::{BigEndian, ByteOrder};
use log::{debug, warn};

use crate::error::{Error, Result};
use crate::link::{CommandLink, FrameSink};
use crate::protocol::text::{FIRMWARE_UPLOAD, SENTINEL_PAGE, upload_ack, upload_packet};
use crate::protocol::{AdminCommand, CommandWord};
use crate::transfer::engine::{
    Dispatch, Failure, PageCursor, Plan, Reply, TransferVariant, Verdict,
};
use crate::transfer::status::TransferState;
use crate::transfer::{PagedPayload, check_text_firmware, text_miss, wire_page};

/// Firmware page size in bytes.
pub const FIRMWARE_PAGE_SIZE: usize = 256;

/// Pages carried by one send.
pub const FIRMWARE_PAGES_PER_SEND: u32 = 4;

const LENGTH_FIELD: std::ops::Range<usize> = 12..16;

/// Check the length embedded in a firmware image.
pub fn check_image(image: &[u8]) -> Result<()> {
    if image.len() <= LENGTH_FIELD.end {
        return Ok(());
    }
    let declared = BigEndian::read_u32(&image[LENGTH_FIELD]);
    if usize::try_from(declared).ok() != Some(image.len()) {
        return Err(Error::InvalidImage(format!(
            "header declares {declared} bytes, image has {}",
            image.len()
        )));
    }
    Ok(())
}

fn load_image(payload: &mut PagedPayload, image: Vec<u8>) -> std::result::Result<Plan, Failure> {
    if let Err(e) = check_image(&image) {
        warn!("{e}");
        return Err(Failure::new(TransferState::FailedInvalidFile));
    }
    payload.load(image);
    Ok(Plan {
        page_count: payload.page_count(),
        payload_len: Some(payload.len()),
    })
}

/// Commands used by the binary firmware upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FirmwareCommands {
    /// Carries a block of pages.
    pub write: CommandWord,
    /// Sent once every page is acknowledged.
    pub load: CommandWord,
}

impl Default for FirmwareCommands {
    fn default() -> Self {
        Self {
            write: CommandWord::admin(AdminCommand::Firmware).with_write(true),
            load: CommandWord::admin(AdminCommand::FirmwareLoad).with_write(true),
        }
    }
}

/// Firmware upload over the binary socket.
///
/// Each send is `page (BE) + data`; the unit echoes it back verbatim.
pub struct FirmwareUpload<S> {
    sink: S,
    commands: FirmwareCommands,
    payload: PagedPayload,
}

impl<S: FrameSink> FirmwareUpload<S> {
    /// Create an upload that sends through `sink`.
    pub fn new(sink: S) -> Self {
        Self {
            sink,
            commands: FirmwareCommands::default(),
            payload: PagedPayload::new(FIRMWARE_PAGE_SIZE, FIRMWARE_PAGES_PER_SEND),
        }
    }

    /// Use different write and load commands, e.g. for a bootloader.
    #[must_use]
    pub fn with_commands(mut self, commands: FirmwareCommands) -> Self {
        self.commands = commands;
        self
    }

    /// Replace the write and load commands.
    pub fn set_commands(&mut self, commands: FirmwareCommands) {
        self.commands = commands;
    }

    /// Commands in use.
    pub fn commands(&self) -> FirmwareCommands {
        self.commands
    }
}

impl<S: FrameSink> TransferVariant for FirmwareUpload<S> {
    type Job = Vec<u8>;
    const NAME: &'static str = "firmware";

    fn initialize(&mut self, image: Vec<u8>) -> std::result::Result<Plan, Failure> {
        if !self.sink.is_connected() {
            return Err(Failure::new(TransferState::FailedConnection));
        }
        load_image(&mut self.payload, image)
    }

    fn is_connected(&self) -> bool {
        self.sink.is_connected()
    }

    fn send_page(&mut self, cursor: &PageCursor) -> Dispatch {
        if cursor.finishing {
            debug!("Firmware sent, requesting load");
            return match self.sink.send_command(self.commands.load, &[]) {
                Ok(()) => Dispatch::Done(Verdict::Complete),
                Err(e) => Dispatch::Done(Verdict::Missed(Some(e.to_string()))),
            };
        }

        let payload = self.payload.indexed_chunk(cursor);
        match self.sink.send_command(self.commands.write, &payload) {
            Ok(()) => Dispatch::Await,
            Err(e) => Dispatch::Done(Verdict::Missed(Some(e.to_string()))),
        }
    }

    fn check_reply(&mut self, cursor: &PageCursor, reply: Reply) -> Verdict {
        match reply {
            Reply::Page { page, data } if self.payload.is_echo(cursor, page, &data) => {
                self.payload.advance(cursor)
            }
            Reply::Page { .. } => Verdict::Missed(None),
            _ => Verdict::Ignore,
        }
    }
}

/// Firmware upload over the text protocol (`&@f`).
///
/// Requires unit firmware 1.14 or later.
pub struct TextFirmwareUpload<L> {
    link: L,
    command: String,
    payload: PagedPayload,
}

impl<L: CommandLink> TextFirmwareUpload<L> {
    /// Create an upload that sends through `link`.
    pub fn new(link: L) -> Self {
        Self {
            link,
            command: FIRMWARE_UPLOAD.to_string(),
            payload: PagedPayload::new(FIRMWARE_PAGE_SIZE, FIRMWARE_PAGES_PER_SEND),
        }
    }

    /// Use a different upload command.
    #[must_use]
    pub fn with_command(mut self, command: impl Into<String>) -> Self {
        self.command = command.into();
        self
    }
}

impl<L: CommandLink> TransferVariant for TextFirmwareUpload<L> {
    type Job = Vec<u8>;
    const NAME: &'static str = "firmware";

    fn initialize(&mut self, image: Vec<u8>) -> std::result::Result<Plan, Failure> {
        if !self.link.is_connected() {
            return Err(Failure::new(TransferState::FailedConnection));
        }
        check_text_firmware(&self.link)?;
        load_image(&mut self.payload, image)
    }

    fn is_connected(&self) -> bool {
        self.link.is_connected()
    }

    fn send_page(&mut self, cursor: &PageCursor) -> Dispatch {
        if cursor.finishing {
            let packet = upload_packet(&self.command, SENTINEL_PAGE, &[]);
            if let Err(e) = self.link.query(&packet, 1) {
                warn!("End of firmware not confirmed: {e}");
            }
            return Dispatch::Done(Verdict::Complete);
        }

        let packet = upload_packet(&self.command, wire_page(cursor.page), self.payload.chunk(cursor));
        let lines = self.link.query(&packet, 1).unwrap_or_default();
        Dispatch::Replied(Reply::Lines(lines))
    }

    fn check_reply(&mut self, cursor: &PageCursor, reply: Reply) -> Verdict {
        let Reply::Lines(lines) = reply else {
            return Verdict::Ignore;
        };
        let ack = upload_ack(&self.command, wire_page(cursor.page), self.payload.chunk(cursor).len());
        if lines.first().is_some_and(|line| line.contains(&ack)) {
            return self.payload.advance(cursor);
        }
        text_miss(&self.command, &lines)
    }
}
