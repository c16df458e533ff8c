//! Configuration export.
//!
//! Pages are requested one by one until the unit signals the end. The page
//! count starts as a guess and is corrected once the unit reports it.

use log::{debug, warn};

use crate::link::{CommandLink, FrameSink};
use crate::protocol::text::{CONFIG_EXPORT, END_PROMPT, page_request, strip_end_prompt};
use crate::protocol::{AdminCommand, CommandWord};
use crate::transfer::engine::{Dispatch, Failure, PageCursor, Plan, Reply, TransferVariant, Verdict};
use crate::transfer::status::TransferState;
use crate::transfer::{check_text_firmware, page_request_bytes, query_count, text_miss, wire_page};

/// Page count assumed until the unit reports the real one.
pub const EXPORT_PAGE_GUESS: u32 = 5;

const PAGE_MAX_LINES: usize = 5000;

fn guess() -> Plan {
    Plan {
        page_count: EXPORT_PAGE_GUESS,
        payload_len: None,
    }
}

/// Configuration export over the binary socket.
///
/// A zero-length page marks the end of the file.
pub struct ConfigExport<S> {
    sink: S,
    data: Vec<u8>,
}

impl<S: FrameSink> ConfigExport<S> {
    /// Create an export that requests through `sink`.
    pub fn new(sink: S) -> Self {
        Self {
            sink,
            data: Vec::new(),
        }
    }

    /// Raw bytes received so far.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Configuration text received so far.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.data).into_owned()
    }
}

impl<S: FrameSink> TransferVariant for ConfigExport<S> {
    type Job = ();
    const NAME: &'static str = "config-export";

    fn initialize(&mut self, (): ()) -> Result<Plan, Failure> {
        if !self.sink.is_connected() {
            return Err(Failure::new(TransferState::FailedConnection));
        }
        self.data.clear();
        Ok(guess())
    }

    fn on_start(&mut self) {
        let command = CommandWord::admin(AdminCommand::ConfigExportCount).with_write(true);
        if let Err(e) = self.sink.send_command(command, &[]) {
            warn!("Export page count not requested: {e}");
        }
    }

    fn is_connected(&self) -> bool {
        self.sink.is_connected()
    }

    fn send_page(&mut self, cursor: &PageCursor) -> Dispatch {
        let command = CommandWord::admin(AdminCommand::ConfigExport).with_write(true);
        match self.sink.send_command(command, &page_request_bytes(cursor.page)) {
            Ok(()) => Dispatch::Await,
            Err(e) => Dispatch::Done(Verdict::Missed(Some(e.to_string()))),
        }
    }

    fn check_reply(&mut self, cursor: &PageCursor, reply: Reply) -> Verdict {
        match reply {
            Reply::Page { page, data } if page == wire_page(cursor.page) => {
                if data.is_empty() {
                    return Verdict::Complete;
                }
                self.data.extend_from_slice(&data);
                Verdict::Advance {
                    bytes: data.len(),
                    pages: 1,
                }
            }
            Reply::Page { .. } => Verdict::Missed(None),
            _ => Verdict::Ignore,
        }
    }
}

/// Configuration export over the text protocol (`&@i`).
///
/// Requires unit firmware 1.14 or later.
pub struct TextConfigExport<L> {
    link: L,
    lines: Vec<String>,
}

impl<L: CommandLink> TextConfigExport<L> {
    /// Create an export that requests through `link`.
    pub fn new(link: L) -> Self {
        Self {
            link,
            lines: Vec::new(),
        }
    }

    /// Configuration text received so far.
    pub fn text(&self) -> String {
        let mut text = self.lines.join("\r\n");
        if !text.is_empty() {
            text.push_str("\r\n");
        }
        text
    }
}

impl<L: CommandLink> TransferVariant for TextConfigExport<L> {
    type Job = ();
    const NAME: &'static str = "config-export";

    fn initialize(&mut self, (): ()) -> Result<Plan, Failure> {
        if !self.link.is_connected() {
            return Err(Failure::new(TransferState::FailedConnection));
        }
        check_text_firmware(&self.link)?;

        self.lines.clear();
        let mut plan = guess();
        if let Some(count) = query_count(&self.link, CONFIG_EXPORT) {
            debug!("Unit reports {count} export pages");
            plan.page_count = count;
        }
        Ok(plan)
    }

    fn is_connected(&self) -> bool {
        self.link.is_connected()
    }

    fn send_page(&mut self, cursor: &PageCursor) -> Dispatch {
        let request = page_request(CONFIG_EXPORT, wire_page(cursor.page));
        let lines = self.link.query(&request, PAGE_MAX_LINES).unwrap_or_default();
        Dispatch::Replied(Reply::Lines(lines))
    }

    fn check_reply(&mut self, cursor: &PageCursor, reply: Reply) -> Verdict {
        let Reply::Lines(mut lines) = reply else {
            return Verdict::Ignore;
        };

        let prefix = format!("{CONFIG_EXPORT}{},", wire_page(cursor.page));
        let Some(first) = lines.first().filter(|line| line.contains(&prefix)) else {
            return text_miss(CONFIG_EXPORT, &lines);
        };
        if first.contains(&format!("{prefix}{END_PROMPT}")) {
            return Verdict::Complete;
        }

        lines[0] = lines[0].replacen(&prefix, "", 1);
        strip_end_prompt(&mut lines);
        if lines.first().is_some_and(String::is_empty) {
            lines.remove(0);
        }
        let bytes = lines.iter().map(String::len).sum();
        self.lines.extend(lines);
        Verdict::Advance { bytes, pages: 1 }
    }
}
