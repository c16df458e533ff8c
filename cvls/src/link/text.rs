//! Text protocol link.
//!
//! Commands are written with a line terminator; replies are lines. A reply
//! ends when the requested number of lines has arrived, when the
//! `MULTILINECOMPLETE` marker arrives, or when the unit stops talking for
//! one read timeout.

use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use log::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::link::CommandLink;
use crate::port::{Port, is_timeout};
use crate::protocol::text::is_end_prompt;

/// Text link settings.
#[derive(Debug, Clone)]
pub struct TextLinkConfig {
    /// Appended to every command.
    pub terminator: Vec<u8>,
    /// How long the unit may stay silent before a reply is considered over.
    pub reply_timeout: Duration,
}

impl Default for TextLinkConfig {
    fn default() -> Self {
        Self {
            terminator: b"\r\n".to_vec(),
            reply_timeout: Duration::from_millis(500),
        }
    }
}

impl TextLinkConfig {
    /// Set the line terminator.
    #[must_use]
    pub fn with_terminator(mut self, terminator: impl Into<Vec<u8>>) -> Self {
        self.terminator = terminator.into();
        self
    }

    /// Set the reply timeout.
    #[must_use]
    pub fn with_reply_timeout(mut self, reply_timeout: Duration) -> Self {
        self.reply_timeout = reply_timeout;
        self
    }
}

struct Inner<P> {
    port: P,
    pending: Vec<u8>,
}

impl<P: Port> Inner<P> {
    /// Take the next complete line out of `pending`.
    fn next_line(&mut self) -> Option<String> {
        let end = self.pending.iter().position(|&b| b == b'\n')?;
        let raw: Vec<u8> = self.pending.drain(..=end).collect();
        let line = String::from_utf8_lossy(&raw[..end]);
        Some(line.trim_end_matches('\r').to_string())
    }

    /// Read more bytes. `Ok(false)` when the unit went quiet.
    fn fill(&mut self) -> std::io::Result<bool> {
        let mut buf = [0u8; 512];
        match self.port.read(&mut buf) {
            Ok(0) => Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed by unit",
            )),
            Ok(n) => {
                trace!("RX {:02X?}", &buf[..n]);
                self.pending.extend_from_slice(&buf[..n]);
                Ok(true)
            }
            Err(e) if is_timeout(&e) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

/// A [`CommandLink`] over any [`Port`].
pub struct TextLink<P> {
    inner: Mutex<Inner<P>>,
    connected: AtomicBool,
    config: TextLinkConfig,
}

impl<P: Port + 'static> TextLink<P> {
    /// Wrap an open port. The port's timeout becomes the reply timeout.
    pub fn new(mut port: P, config: TextLinkConfig) -> Result<Self> {
        port.set_timeout(config.reply_timeout)?;
        debug!("Text link on {}", port.name());
        Ok(Self {
            inner: Mutex::new(Inner {
                port,
                pending: Vec::new(),
            }),
            connected: AtomicBool::new(true),
            config,
        })
    }

    /// Link settings.
    pub fn config(&self) -> &TextLinkConfig {
        &self.config
    }

    /// Name of the underlying port.
    pub fn port_name(&self) -> String {
        self.lock().port.name().to_string()
    }

    /// Close the port. Later queries fail with [`Error::NotConnected`].
    pub fn close(&self) -> Result<()> {
        self.connected.store(false, Ordering::Release);
        self.lock().port.close()
    }

    /// Whether the unit answers the probe command.
    pub fn probe(&self) -> bool {
        let probe = crate::protocol::text::PROBE;
        self.query(probe.as_bytes(), 1)
            .is_ok_and(|lines| lines.first().is_some_and(|l| l.contains(probe)))
    }

    fn lock(&self) -> MutexGuard<'_, Inner<P>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lost(&self, error: std::io::Error) -> Error {
        warn!("Text link lost: {error}");
        self.connected.store(false, Ordering::Release);
        Error::Io(error)
    }
}

impl<P: Port + 'static> CommandLink for TextLink<P> {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    fn query(&self, command: &[u8], max_lines: usize) -> Result<Vec<String>> {
        if !self.is_connected() {
            return Err(Error::NotConnected);
        }

        let mut inner = self.lock();
        // Bytes left over from an earlier reply answer nothing we asked.
        inner.pending.clear();
        inner.port.clear_buffers()?;

        let mut out = Vec::with_capacity(command.len() + self.config.terminator.len());
        out.extend_from_slice(command);
        out.extend_from_slice(&self.config.terminator);
        trace!("TX {}", String::from_utf8_lossy(command));
        if let Err(e) = inner.port.write_all(&out) {
            return Err(self.lost(e));
        }
        if let Err(e) = inner.port.flush() {
            return Err(self.lost(e));
        }

        let mut lines = Vec::new();
        while lines.len() < max_lines {
            let Some(line) = inner.next_line() else {
                match inner.fill() {
                    Ok(true) => continue,
                    Ok(false) => break,
                    Err(e) => return Err(self.lost(e)),
                }
            };
            if line.is_empty() {
                continue;
            }
            let done = is_end_prompt(&line);
            lines.push(line);
            if done {
                break;
            }
        }
        Ok(lines)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// Port that answers each written line with a canned reply.
    struct MockPort {
        replies: VecDeque<Vec<u8>>,
        read_buf: VecDeque<u8>,
        write_buf: Vec<u8>,
        broken: bool,
    }

    impl MockPort {
        fn new(replies: &[&str]) -> Self {
            Self {
                replies: replies.iter().map(|r| r.as_bytes().to_vec()).collect(),
                read_buf: VecDeque::new(),
                write_buf: Vec::new(),
                broken: false,
            }
        }
    }

    impl Read for MockPort {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if self.broken {
                return Err(std::io::ErrorKind::ConnectionReset.into());
            }
            if self.read_buf.is_empty() {
                return Err(std::io::Error::new(std::io::ErrorKind::TimedOut, "no data"));
            }
            // Hand out a few bytes at a time to exercise reassembly.
            let n = buf.len().min(self.read_buf.len()).min(7);
            for b in buf.iter_mut().take(n) {
                *b = self.read_buf.pop_front().unwrap();
            }
            Ok(n)
        }
    }

    impl Write for MockPort {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.write_buf.extend_from_slice(buf);
            if buf.ends_with(b"\n") {
                if let Some(reply) = self.replies.pop_front() {
                    self.read_buf.extend(reply);
                }
            }
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl Port for MockPort {
        fn set_timeout(&mut self, _timeout: Duration) -> Result<()> {
            Ok(())
        }

        fn timeout(&self) -> Duration {
            Duration::ZERO
        }

        fn clear_buffers(&mut self) -> Result<()> {
            self.read_buf.clear();
            Ok(())
        }

        fn name(&self) -> &str {
            "mock"
        }

        fn close(&mut self) -> Result<()> {
            Ok(())
        }
    }

    fn unit(replies: &[&str]) -> TextLink<MockPort> {
        TextLink::new(MockPort::new(replies), TextLinkConfig::default()).unwrap()
    }

    #[test]
    fn test_single_line_query() {
        let link = unit(&["&@e3\r\n"]);
        assert_eq!(link.query(b"&@e?", 1).unwrap(), vec!["&@e3"]);
        assert_eq!(link.lock().port.write_buf, b"&@e?\r\n");
    }

    #[test]
    fn test_multi_line_stops_at_end_prompt() {
        let link = unit(&["&@i0,[Led]\r\n\r\nPower=100\r\nMULTILINECOMPLETE\r\nstray\r\n"]);
        let lines = link.query(b"&@i0", 5000).unwrap();
        assert_eq!(lines, vec!["&@i0,[Led]", "Power=100", "MULTILINECOMPLETE"]);
    }

    #[test]
    fn test_silence_ends_reply() {
        let talking = unit(&["&@us\r\npartial"]);
        assert_eq!(talking.query(b"&@u", 5000).unwrap(), vec!["&@us"]);

        let silent = unit(&[]);
        assert!(silent.query(b"&@f", 1).unwrap().is_empty());
        assert!(silent.is_connected());
    }

    #[test]
    fn test_stale_bytes_are_discarded() {
        let link = unit(&["&@e1\r\nleftover\r\n", "&@e2\r\n"]);
        assert_eq!(link.query(b"&@e?", 1).unwrap(), vec!["&@e1"]);
        assert_eq!(link.query(b"&@e?", 1).unwrap(), vec!["&@e2"]);
    }

    #[test]
    fn test_firmware_version() {
        let link = unit(&["&f1.14 Mar 03 2021\r\n"]);
        assert_eq!(link.firmware_version(), Some(1.14));
    }

    #[test]
    fn test_io_error_disconnects() {
        let mut port = MockPort::new(&[]);
        port.broken = true;
        let link = TextLink::new(port, TextLinkConfig::default()).unwrap();

        assert!(matches!(link.query(b"&z", 1), Err(Error::Io(_))));
        assert!(!link.is_connected());
        assert!(matches!(link.query(b"&z", 1), Err(Error::NotConnected)));
    }

    #[test]
    fn test_probe() {
        assert!(unit(&["&z\r\n"]).probe());
        assert!(!unit(&["!e\r\n"]).probe());
    }
}
