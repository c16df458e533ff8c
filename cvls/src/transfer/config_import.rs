//! Configuration import.
//!
//! The configuration file is uploaded in 1024-byte pages. Once every page is
//! stored the unit parses it and either accepts it or returns a list of
//! errors.

use log::{debug, warn};

use crate::link::{CommandLink, FrameSink};
use crate::protocol::text::{CONFIG_IMPORT, SENTINEL_PAGE, strip_end_prompt, upload_ack, upload_packet};
use crate::protocol::{AdminCommand, CommandWord};
use crate::transfer::engine::{Dispatch, Failure, PageCursor, Plan, Reply, TransferVariant, Verdict};
use crate::transfer::status::TransferState;
use crate::transfer::{PagedPayload, text_miss, wire_page};

/// Import page size in bytes.
pub const IMPORT_PAGE_SIZE: usize = 1024;

/// Text reply prefix of an accepted import.
const IMPORT_SUCCESS: &str = "&@us";

/// Text reply prefix of a rejected import.
const IMPORT_ERRORS: &str = "&@ue";

/// Lines read back after the end-of-transfer page.
const REPORT_MAX_LINES: usize = 5000;

fn rejected(report: &str) -> Failure {
    Failure::with_message(
        TransferState::FailedInvalidFile,
        format!("Configuration import failed, the unit reported:\n{}", report.trim_end()),
    )
}

fn load(payload: &mut PagedPayload, data: Vec<u8>) -> Plan {
    payload.load(data);
    Plan {
        page_count: payload.page_count(),
        payload_len: Some(payload.len()),
    }
}

/// Configuration import over the binary socket.
///
/// After the last page the unit is told to apply the file with
/// `ConfigImportComplete`. A rejection is followed up with
/// `ConfigImportLogRead` to fetch the unit's error report.
pub struct ConfigImport<S> {
    sink: S,
    payload: PagedPayload,
}

impl<S: FrameSink> ConfigImport<S> {
    /// Create an import that sends through `sink`.
    pub fn new(sink: S) -> Self {
        Self {
            sink,
            payload: PagedPayload::new(IMPORT_PAGE_SIZE, 1),
        }
    }

    fn send(&self, command: AdminCommand, data: &[u8]) -> Dispatch {
        match self
            .sink
            .send_command(CommandWord::admin(command).with_write(true), data)
        {
            Ok(()) => Dispatch::Await,
            Err(e) => Dispatch::Done(Verdict::Missed(Some(e.to_string()))),
        }
    }
}

impl<S: FrameSink> TransferVariant for ConfigImport<S> {
    type Job = Vec<u8>;
    const NAME: &'static str = "config-import";

    fn initialize(&mut self, data: Vec<u8>) -> Result<Plan, Failure> {
        if !self.sink.is_connected() {
            return Err(Failure::new(TransferState::FailedConnection));
        }
        Ok(load(&mut self.payload, data))
    }

    fn is_connected(&self) -> bool {
        self.sink.is_connected()
    }

    fn send_page(&mut self, cursor: &PageCursor) -> Dispatch {
        if cursor.finishing {
            return self.send(AdminCommand::ConfigImportComplete, &[]);
        }
        self.send(AdminCommand::ConfigImport, &self.payload.indexed_chunk(cursor))
    }

    fn check_reply(&mut self, cursor: &PageCursor, reply: Reply) -> Verdict {
        match (cursor.finishing, reply) {
            (false, Reply::Page { page, data }) => {
                if self.payload.is_echo(cursor, page, &data) {
                    self.payload.advance(cursor)
                } else {
                    Verdict::Missed(None)
                }
            }
            (true, Reply::ImportComplete { success: true }) => Verdict::Complete,
            (true, Reply::ImportComplete { success: false }) => {
                debug!("Configuration rejected, reading error report");
                match self.send(AdminCommand::ConfigImportLogRead, &[]) {
                    Dispatch::Done(verdict) => verdict,
                    _ => Verdict::Pending,
                }
            }
            (true, Reply::ImportLog(report)) => Verdict::Fail(rejected(&report)),
            _ => Verdict::Ignore,
        }
    }
}

/// Configuration import over the text protocol (`&@u`).
pub struct TextConfigImport<L> {
    link: L,
    payload: PagedPayload,
}

impl<L: CommandLink> TextConfigImport<L> {
    /// Create an import that sends through `link`.
    pub fn new(link: L) -> Self {
        Self {
            link,
            payload: PagedPayload::new(IMPORT_PAGE_SIZE, 1),
        }
    }
}

impl<L: CommandLink> TransferVariant for TextConfigImport<L> {
    type Job = Vec<u8>;
    const NAME: &'static str = "config-import";

    fn initialize(&mut self, data: Vec<u8>) -> Result<Plan, Failure> {
        if !self.link.is_connected() {
            return Err(Failure::new(TransferState::FailedConnection));
        }
        Ok(load(&mut self.payload, data))
    }

    fn is_connected(&self) -> bool {
        self.link.is_connected()
    }

    fn send_page(&mut self, cursor: &PageCursor) -> Dispatch {
        let (packet, max_lines) = if cursor.finishing {
            (upload_packet(CONFIG_IMPORT, SENTINEL_PAGE, &[]), REPORT_MAX_LINES)
        } else {
            let chunk = self.payload.chunk(cursor);
            (upload_packet(CONFIG_IMPORT, wire_page(cursor.page), chunk), 1)
        };

        let lines = self.link.query(&packet, max_lines).unwrap_or_else(|e| {
            warn!("Configuration page {} not sent: {e}", cursor.page);
            Vec::new()
        });
        Dispatch::Replied(Reply::Lines(lines))
    }

    fn check_reply(&mut self, cursor: &PageCursor, reply: Reply) -> Verdict {
        let Reply::Lines(mut lines) = reply else {
            return Verdict::Ignore;
        };

        if cursor.finishing {
            let Some(first) = lines.first() else {
                return Verdict::Fail(Failure::with_message(
                    TransferState::Failed,
                    "Unable to parse configuration, unknown error!",
                ));
            };
            if first.contains(IMPORT_SUCCESS) {
                return Verdict::Complete;
            }
            if first.contains(IMPORT_ERRORS) {
                lines[0] = lines[0].replacen(IMPORT_ERRORS, "", 1);
                strip_end_prompt(&mut lines);
                let report: Vec<&str> = lines
                    .iter()
                    .map(String::as_str)
                    .filter(|line| !line.is_empty())
                    .collect();
                return Verdict::Fail(rejected(&report.join("\r\n")));
            }
            return Verdict::Missed(None);
        }

        let ack = upload_ack(CONFIG_IMPORT, wire_page(cursor.page), self.payload.chunk(cursor).len());
        if lines.first().is_some_and(|line| line.contains(&ack)) {
            return self.payload.advance(cursor);
        }
        text_miss(CONFIG_IMPORT, &lines)
    }
}
