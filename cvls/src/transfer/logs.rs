//! Event log download.
//!
//! Every page holds one log entry. The unit answers a page past the last
//! entry with an empty page, which ends the download.

use std::fmt;

use byteorder::{ByteOrder, LittleEndian};
use log::{debug, trace, warn};

use crate::link::{CommandLink, FrameSink};
use crate::protocol::text::{LOG_READ, page_request};
use crate::protocol::{AdminCommand, CommandWord};
use crate::transfer::engine::{Dispatch, Failure, PageCursor, Plan, Reply, TransferVariant, Verdict};
use crate::transfer::status::TransferState;
use crate::transfer::{check_text_firmware, page_request_bytes, query_count, text_miss, wire_page};

/// Page count assumed until the unit reports the real one.
pub const LOG_PAGE_GUESS: u32 = 256;

/// One entry of the unit's event log.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct LogEntry {
    /// How many times the event occurred.
    pub count: u32,
    /// Unit time of the last occurrence, in seconds.
    pub timestamp: u32,
    /// Event description.
    pub message: String,
}

impl LogEntry {
    /// Decode a binary log page: `count (LE u32) + timestamp (LE u32) +
    /// message (UTF-8)`.
    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        if data.len() < 8 {
            return None;
        }
        Some(Self {
            count: LittleEndian::read_u32(&data[0..4]),
            timestamp: LittleEndian::read_u32(&data[4..8]),
            message: String::from_utf8_lossy(&data[8..])
                .trim_end_matches('\0')
                .to_string(),
        })
    }

    /// Parse the fields of a text log reply, `index,count,time,message`,
    /// with the command prefix already removed. Returns the index too.
    pub fn from_fields(fields: &str) -> Option<(u32, Self)> {
        let mut parts = fields.splitn(4, ',');
        let index = parts.next()?.trim().parse().ok()?;
        let count = parts.next()?.trim().parse().ok()?;
        let timestamp = parts.next()?.trim().parse().ok()?;
        let message = parts.next().unwrap_or_default().to_string();
        Some((
            index,
            Self {
                count,
                timestamp,
                message,
            },
        ))
    }
}

impl fmt::Display for LogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:>10}s  x{:<5} {}", self.timestamp, self.count, self.message)
    }
}

fn guess() -> Plan {
    Plan {
        page_count: LOG_PAGE_GUESS,
        payload_len: None,
    }
}

/// Log download over the binary socket.
pub struct LogDownload<S> {
    sink: S,
    logs: Vec<LogEntry>,
}

impl<S: FrameSink> LogDownload<S> {
    /// Create a download that requests through `sink`.
    pub fn new(sink: S) -> Self {
        Self {
            sink,
            logs: Vec::new(),
        }
    }

    /// Entries received so far.
    pub fn logs(&self) -> &[LogEntry] {
        &self.logs
    }
}

impl<S: FrameSink> TransferVariant for LogDownload<S> {
    type Job = ();
    const NAME: &'static str = "logs";

    fn initialize(&mut self, (): ()) -> Result<Plan, Failure> {
        if !self.sink.is_connected() {
            return Err(Failure::new(TransferState::FailedConnection));
        }
        self.logs.clear();
        Ok(guess())
    }

    fn on_start(&mut self) {
        let command = CommandWord::admin(AdminCommand::LogsCount).with_write(true);
        if let Err(e) = self.sink.send_command(command, &[]) {
            warn!("Log count not requested: {e}");
        }
    }

    fn is_connected(&self) -> bool {
        self.sink.is_connected()
    }

    fn send_page(&mut self, cursor: &PageCursor) -> Dispatch {
        let command = CommandWord::admin(AdminCommand::LogsRead).with_write(true);
        match self.sink.send_command(command, &page_request_bytes(cursor.page)) {
            Ok(()) => Dispatch::Await,
            Err(e) => Dispatch::Done(Verdict::Missed(Some(e.to_string()))),
        }
    }

    fn check_reply(&mut self, cursor: &PageCursor, reply: Reply) -> Verdict {
        let Reply::Page { page, data } = reply else {
            return Verdict::Ignore;
        };
        if page != wire_page(cursor.page) {
            return Verdict::Missed(None);
        }
        if data.is_empty() {
            return Verdict::Complete;
        }
        match LogEntry::from_bytes(&data) {
            Some(entry) => {
                trace!("Log {page}: {entry}");
                self.logs.push(entry);
                Verdict::Advance {
                    bytes: data.len(),
                    pages: 1,
                }
            }
            None => Verdict::Missed(Some(format!("Log page {page} is truncated"))),
        }
    }
}

/// Log download over the text protocol (`&@e`).
///
/// Requires unit firmware 1.14 or later.
pub struct TextLogDownload<L> {
    link: L,
    logs: Vec<LogEntry>,
}

impl<L: CommandLink> TextLogDownload<L> {
    /// Create a download that requests through `link`.
    pub fn new(link: L) -> Self {
        Self {
            link,
            logs: Vec::new(),
        }
    }

    /// Entries received so far.
    pub fn logs(&self) -> &[LogEntry] {
        &self.logs
    }
}

impl<L: CommandLink> TransferVariant for TextLogDownload<L> {
    type Job = ();
    const NAME: &'static str = "logs";

    fn initialize(&mut self, (): ()) -> Result<Plan, Failure> {
        if !self.link.is_connected() {
            return Err(Failure::new(TransferState::FailedConnection));
        }
        check_text_firmware(&self.link)?;

        self.logs.clear();
        let mut plan = guess();
        if let Some(count) = query_count(&self.link, LOG_READ) {
            debug!("Unit reports {count} log entries");
            plan.page_count = count;
        }
        Ok(plan)
    }

    fn is_connected(&self) -> bool {
        self.link.is_connected()
    }

    fn send_page(&mut self, cursor: &PageCursor) -> Dispatch {
        let request = page_request(LOG_READ, wire_page(cursor.page));
        let lines = self.link.query(&request, 1).unwrap_or_default();
        Dispatch::Replied(Reply::Lines(lines))
    }

    fn check_reply(&mut self, cursor: &PageCursor, reply: Reply) -> Verdict {
        let Reply::Lines(lines) = reply else {
            return Verdict::Ignore;
        };
        let Some(fields) = lines.first().and_then(|line| line.strip_prefix(LOG_READ)) else {
            return text_miss(LOG_READ, &lines);
        };
        if fields.starts_with('!') {
            return text_miss(LOG_READ, &lines);
        }
        // A reply without log fields means there are no more entries.
        if !fields.contains(',') {
            return Verdict::Complete;
        }

        match LogEntry::from_fields(fields) {
            Some((index, entry)) if index == cursor.page => {
                self.logs.push(entry);
                Verdict::Advance {
                    bytes: fields.len(),
                    pages: 1,
                }
            }
            _ => Verdict::Missed(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::mock::{MockLink, MockSink};
    use crate::transfer::engine::{EngineConfig, TransferEngine};
    use std::sync::Arc;
    use std::time::Duration;

    fn config() -> EngineConfig {
        EngineConfig::default()
            .with_reply_window(Duration::from_millis(200))
            .with_stop_timeout(Duration::from_secs(2))
    }

    fn entry_bytes(count: u32, timestamp: u32, message: &str) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&count.to_le_bytes());
        out.extend_from_slice(&timestamp.to_le_bytes());
        out.extend_from_slice(message.as_bytes());
        out
    }

    #[test]
    fn test_entry_from_bytes() {
        let entry = LogEntry::from_bytes(&entry_bytes(3, 86_400, "Fan stalled")).unwrap();
        assert_eq!(entry.count, 3);
        assert_eq!(entry.timestamp, 86_400);
        assert_eq!(entry.message, "Fan stalled");

        let bare = LogEntry::from_bytes(&[1, 0, 0, 0, 2, 0, 0, 0]).unwrap();
        assert!(bare.message.is_empty());
        assert!(LogEntry::from_bytes(&[1, 0, 0, 0, 2, 0, 0]).is_none());
    }

    #[test]
    fn test_entry_from_fields_keeps_commas_in_message() {
        let (index, entry) = LogEntry::from_fields("4,1,1200,Over temperature, LED 2").unwrap();
        assert_eq!(index, 4);
        assert_eq!(entry.count, 1);
        assert_eq!(entry.timestamp, 1200);
        assert_eq!(entry.message, "Over temperature, LED 2");
        assert!(LogEntry::from_fields("4,x,1200,msg").is_none());
        assert!(LogEntry::from_fields("4,1").is_none());
    }

    #[test]
    fn test_binary_download_with_revised_count() {
        let sink = MockSink::new();
        let engine = Arc::new(TransferEngine::new(LogDownload::new(Arc::clone(&sink)), config()));
        let weak = Arc::downgrade(&engine);
        sink.respond_with(move |command, data| {
            let Some(engine) = weak.upgrade() else { return };
            match command.admin_command() {
                Some(AdminCommand::LogsCount) => engine.set_page_count(12),
                Some(AdminCommand::LogsRead) => {
                    let page = u16::from_be_bytes([data[0], data[1]]);
                    let data = if page < 12 {
                        entry_bytes(u32::from(page) + 1, 100 * u32::from(page), &format!("event {page}"))
                    } else {
                        Vec::new()
                    };
                    engine.receive(Reply::Page { page, data });
                }
                _ => {}
            }
        });

        let status = engine.run((), Duration::from_secs(5));
        assert_eq!(status.state, TransferState::Succeeded);
        assert_eq!(status.pages_total, 12);
        assert_eq!(status.percent, 100);
        engine.inspect(|v| {
            assert_eq!(v.logs().len(), 12);
            assert_eq!(v.logs()[11].message, "event 11");
            assert_eq!(v.logs()[11].timestamp, 1100);
        });
    }

    #[test]
    fn test_binary_download_unit_silent() {
        let sink = MockSink::new();
        let engine = TransferEngine::new(
            LogDownload::new(Arc::clone(&sink)),
            config().with_reply_window(Duration::from_millis(20)),
        );

        let status = engine.run((), Duration::from_secs(5));
        assert_eq!(status.state, TransferState::FailedLostPackets);
        // Count request plus six attempts on page zero.
        assert_eq!(sink.sent_count(), 7);
    }

    fn text_unit(entries: usize) -> Arc<MockLink> {
        MockLink::new(Some(1.14), move |request| {
            let request = String::from_utf8_lossy(request).into_owned();
            let arg = request.trim_start_matches(LOG_READ);
            if arg == "?" {
                return vec![format!("&@e{entries}")];
            }
            let index: usize = arg.parse().unwrap();
            if index < entries {
                vec![format!("&@e{index},2,{},Lamp {index}, check", 60 * index)]
            } else {
                vec!["&@e".to_string()]
            }
        })
    }

    #[test]
    fn test_text_download() {
        let link = text_unit(3);
        let engine = TransferEngine::new(TextLogDownload::new(Arc::clone(&link)), config());

        let status = engine.run((), Duration::from_secs(5));
        assert_eq!(status.state, TransferState::Succeeded);
        assert_eq!(status.pages_total, 3);
        engine.inspect(|v| {
            assert_eq!(v.logs().len(), 3);
            assert_eq!(v.logs()[2].timestamp, 120);
            assert_eq!(v.logs()[2].message, "Lamp 2, check");
        });
        assert_eq!(link.queries().len(), 5);
    }

    #[test]
    fn test_text_download_wrong_index_is_missed() {
        let link = MockLink::new(Some(1.2), |request| {
            if request == b"&@e?" {
                vec!["&@e4".to_string()]
            } else {
                vec!["&@e7,1,1,stale".to_string()]
            }
        });
        let engine = TransferEngine::new(TextLogDownload::new(link), config());

        let status = engine.run((), Duration::from_secs(5));
        assert_eq!(status.state, TransferState::FailedLostPackets);
        engine.inspect(|v| assert!(v.logs().is_empty()));
    }

    #[test]
    fn test_text_download_lost_connection_message() {
        let link = MockLink::new(Some(1.2), |_| Vec::new());
        let engine = TransferEngine::new(TextLogDownload::new(link), config());
        let status = engine.start(());
        assert_eq!(status.pages_total, LOG_PAGE_GUESS);

        let status = engine.wait(Duration::from_secs(5));
        assert_eq!(status.state, TransferState::FailedLostPackets);
    }

    #[test]
    fn test_text_download_requires_firmware() {
        let link = MockLink::new(None, |_| Vec::new());
        let engine = TransferEngine::new(TextLogDownload::new(link), config());
        assert_eq!(
            engine.run((), Duration::from_secs(1)).state,
            TransferState::FailedInvalidFirmware
        );
    }
}
