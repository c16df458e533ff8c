//! In-memory links for unit tests.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::{Error, Result};
use crate::link::{CommandLink, FrameSink};
use crate::protocol::CommandWord;

type Hook = Box<dyn FnMut(CommandWord, &[u8]) + Send>;

/// Records every command sent through it.
#[derive(Default)]
pub(crate) struct MockSink {
    disconnected: AtomicBool,
    sent: Mutex<Vec<(CommandWord, Vec<u8>)>>,
    hook: Mutex<Option<Hook>>,
}

impl MockSink {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn disconnect(&self) {
        self.disconnected.store(true, Ordering::SeqCst);
    }

    /// Run `hook` on every command after it is recorded, e.g. to play the
    /// unit and feed a reply back to an engine.
    pub(crate) fn respond_with<F>(&self, hook: F)
    where
        F: FnMut(CommandWord, &[u8]) + Send + 'static,
    {
        *self.hook.lock().unwrap() = Some(Box::new(hook));
    }

    pub(crate) fn sent(&self) -> Vec<(CommandWord, Vec<u8>)> {
        self.sent.lock().unwrap().clone()
    }

    pub(crate) fn sent_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }
}

impl FrameSink for MockSink {
    fn is_connected(&self) -> bool {
        !self.disconnected.load(Ordering::SeqCst)
    }

    fn send_command(&self, command: CommandWord, data: &[u8]) -> Result<()> {
        if !self.is_connected() {
            return Err(Error::NotConnected);
        }
        let command = command.with_data_length(u16::try_from(data.len()).unwrap());
        self.sent.lock().unwrap().push((command, data.to_vec()));
        if let Some(hook) = self.hook.lock().unwrap().as_mut() {
            hook(command, data);
        }
        Ok(())
    }
}

type Responder = Box<dyn FnMut(&[u8]) -> Vec<String> + Send>;

/// Answers text commands through a closure.
pub(crate) struct MockLink {
    disconnected: AtomicBool,
    version: Option<f64>,
    responder: Mutex<Responder>,
    queries: Mutex<Vec<Vec<u8>>>,
}

impl MockLink {
    pub(crate) fn new<F>(version: Option<f64>, responder: F) -> Arc<Self>
    where
        F: FnMut(&[u8]) -> Vec<String> + Send + 'static,
    {
        Arc::new(Self {
            disconnected: AtomicBool::new(false),
            version,
            responder: Mutex::new(Box::new(responder)),
            queries: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn disconnect(&self) {
        self.disconnected.store(true, Ordering::SeqCst);
    }

    pub(crate) fn queries(&self) -> Vec<Vec<u8>> {
        self.queries.lock().unwrap().clone()
    }
}

impl CommandLink for MockLink {
    fn is_connected(&self) -> bool {
        !self.disconnected.load(Ordering::SeqCst)
    }

    fn query(&self, command: &[u8], _max_lines: usize) -> Result<Vec<String>> {
        if !self.is_connected() {
            return Err(Error::NotConnected);
        }
        self.queries.lock().unwrap().push(command.to_vec());
        Ok((self.responder.lock().unwrap())(command))
    }

    fn firmware_version(&self) -> Option<f64> {
        self.version
    }
}

/// Split a text page upload back into (page, data), undoing the escaping and
/// checking the checksum.
pub(crate) fn parse_upload(command: &str, packet: &[u8]) -> Option<(u16, Vec<u8>)> {
    let escaped = packet.strip_prefix(command.as_bytes())?;
    let mut raw = Vec::with_capacity(escaped.len());
    let mut bytes = escaped.iter();
    while let Some(&byte) = bytes.next() {
        if byte == crate::protocol::text::TEXT_ESCAPE {
            raw.push(*bytes.next()?);
        } else {
            raw.push(byte);
        }
    }
    if !crate::protocol::checksum::verify(&raw) || raw.len() < 4 {
        return None;
    }
    let page = u16::from_be_bytes([raw[0], raw[1]]);
    Some((page, raw[2..raw.len() - 2].to_vec()))
}
