//! Binary protocol over TCP.
//!
//! A [`BinarySocket`] owns two threads besides the caller's:
//!
//! - the reader pumps received bytes through a [`FrameDecoder`] and hands
//!   every frame to the installed [`FrameHandler`];
//! - the keepalive thread sends `System/Keepalive` at a fixed interval and
//!   drops the link when the unit stops answering them.
//!
//! Both stop when the link goes down, whichever side closes it.

use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, info, trace, warn};

use crate::error::{Error, Result};
use crate::link::FrameSink;
use crate::port::{is_timeout, tcp::resolve};
use crate::protocol::{CommandWord, Frame, FrameDecoder, SystemCommand, encode_frame};

/// Receives every decoded frame except keepalives. Runs on the reader
/// thread and must not block.
pub type FrameHandler = Box<dyn Fn(Frame) + Send + Sync>;

/// Address units ship with.
pub const DEFAULT_HOST: &str = "192.168.0.2";

/// TCP port of the binary protocol.
pub const DEFAULT_PORT: u16 = 5000;

/// Socket settings.
#[derive(Debug, Clone)]
pub struct SocketConfig {
    /// Unit host name or address.
    pub host: String,
    /// Unit TCP port.
    pub port: u16,
    /// How long to wait for the TCP connection.
    pub connect_timeout: Duration,
    /// Interval between keepalives.
    pub keepalive_interval: Duration,
    /// Keepalives sent without an answer before the link is dropped.
    pub max_missed_keepalives: u32,
    /// Bytes requested per socket read.
    pub read_chunk: usize,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            connect_timeout: Duration::from_secs(2),
            keepalive_interval: Duration::from_millis(100),
            max_missed_keepalives: 10,
            read_chunk: 1024,
        }
    }
}

impl SocketConfig {
    /// Configuration for `host:port` with default timing.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Default::default()
        }
    }

    /// Set the connect timeout.
    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the keepalive interval and how many may go unanswered.
    #[must_use]
    pub fn with_keepalive(mut self, interval: Duration, max_missed: u32) -> Self {
        self.keepalive_interval = interval;
        self.max_missed_keepalives = max_missed;
        self
    }
}

/// How long a blocked read waits before checking for shutdown.
const READ_POLL: Duration = Duration::from_millis(50);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Shared {
    writer: Mutex<TcpStream>,
    handler: Mutex<Option<FrameHandler>>,
    connected: AtomicBool,
    missed_keepalives: AtomicU32,
    dropped_frames: AtomicU64,
}

impl Shared {
    fn close(&self, reason: &str) {
        if self.connected.swap(false, Ordering::AcqRel) {
            info!("Unit link closed: {reason}");
            // The peer may already be gone.
            let _ = lock(&self.writer).shutdown(Shutdown::Both);
        }
    }

    fn send(&self, command: CommandWord, data: &[u8]) -> Result<()> {
        if !self.connected.load(Ordering::Acquire) {
            return Err(Error::NotConnected);
        }
        let frame = encode_frame(command, data)?;
        trace!("TX {frame:02X?}");
        let written = {
            let mut writer = lock(&self.writer);
            writer.write_all(&frame).and_then(|()| writer.flush())
        };
        written.map_err(|e| {
            self.close(&format!("write failed: {e}"));
            Error::Io(e)
        })
    }

    fn dispatch(&self, frame: Frame) {
        match frame.command.system_command() {
            Some(SystemCommand::Keepalive) => {
                self.missed_keepalives.store(0, Ordering::Release);
                return;
            }
            Some(SystemCommand::Disconnect) => self.close("unit requested disconnect"),
            _ => {}
        }
        match lock(&self.handler).as_ref() {
            Some(handler) => handler(frame),
            None => debug!("No handler for {:?}", frame.command),
        }
    }
}

/// Binary protocol link to a unit over TCP.
pub struct BinarySocket {
    shared: Arc<Shared>,
    config: SocketConfig,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl BinarySocket {
    /// Connect to the unit and start the reader and keepalive threads.
    pub fn connect(config: SocketConfig) -> Result<Self> {
        let addr = resolve((config.host.as_str(), config.port))?;
        debug!("Connecting to {addr}");
        let stream = TcpStream::connect_timeout(&addr, config.connect_timeout)?;
        stream.set_nodelay(true)?;
        stream.set_read_timeout(Some(READ_POLL))?;
        let reader = stream.try_clone()?;

        let shared = Arc::new(Shared {
            writer: Mutex::new(stream),
            handler: Mutex::new(None),
            connected: AtomicBool::new(true),
            missed_keepalives: AtomicU32::new(0),
            dropped_frames: AtomicU64::new(0),
        });
        let socket = Self {
            shared,
            config,
            threads: Mutex::new(Vec::new()),
        };
        socket.spawn("cvls-reader", {
            let shared = Arc::clone(&socket.shared);
            let chunk = socket.config.read_chunk;
            move || read_loop(&shared, reader, chunk)
        })?;
        socket.spawn("cvls-keepalive", {
            let shared = Arc::clone(&socket.shared);
            let interval = socket.config.keepalive_interval;
            let limit = socket.config.max_missed_keepalives;
            move || keepalive_loop(&shared, interval, limit)
        })?;
        info!("Connected to unit at {addr}");
        Ok(socket)
    }

    fn spawn<F>(&self, name: &str, f: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(f)
            .map_err(|e| {
                self.shared.close("thread spawn failed");
                Error::Thread(e.to_string())
            })?;
        lock(&self.threads).push(handle);
        Ok(())
    }

    /// Install the frame handler, replacing any previous one.
    pub fn on_frame<F>(&self, handler: F)
    where
        F: Fn(Frame) + Send + Sync + 'static,
    {
        *lock(&self.shared.handler) = Some(Box::new(handler));
    }

    /// Socket settings.
    pub fn config(&self) -> &SocketConfig {
        &self.config
    }

    /// Frames discarded for a bad length or checksum.
    pub fn dropped_frames(&self) -> u64 {
        self.shared.dropped_frames.load(Ordering::Acquire)
    }

    /// Keepalives currently unanswered.
    pub fn missed_keepalives(&self) -> u32 {
        self.shared.missed_keepalives.load(Ordering::Acquire)
    }

    /// Tell the unit goodbye and close the link.
    pub fn disconnect(&self) {
        if self.is_connected() {
            let goodbye = CommandWord::system(SystemCommand::Disconnect).with_write(true);
            if let Err(e) = self.shared.send(goodbye, &[]) {
                debug!("Disconnect not sent: {e}");
            }
        }
        self.shared.close("closed by host");
    }
}

impl FrameSink for BinarySocket {
    fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire)
    }

    fn send_command(&self, command: CommandWord, data: &[u8]) -> Result<()> {
        self.shared.send(command, data)
    }
}

impl Drop for BinarySocket {
    fn drop(&mut self) {
        self.shared.close("socket dropped");
        let current = thread::current().id();
        for handle in lock(&self.threads).drain(..) {
            if handle.thread().id() != current {
                let _ = handle.join();
            }
        }
    }
}

fn read_loop(shared: &Shared, mut stream: TcpStream, chunk: usize) {
    let mut decoder = FrameDecoder::new();
    let mut buf = vec![0u8; chunk.max(1)];

    while shared.connected.load(Ordering::Acquire) {
        match stream.read(&mut buf) {
            Ok(0) => {
                shared.close("closed by unit");
                break;
            }
            Ok(n) => {
                trace!("RX {:02X?}", &buf[..n]);
                let frames = decoder.push(&buf[..n]);
                shared
                    .dropped_frames
                    .store(decoder.dropped(), Ordering::Release);
                for frame in frames {
                    shared.dispatch(frame);
                }
            }
            Err(e) if is_timeout(&e) => {}
            Err(e) => {
                shared.close(&format!("read failed: {e}"));
                break;
            }
        }
    }
    debug!("Reader thread done");
}

fn keepalive_loop(shared: &Shared, interval: Duration, limit: u32) {
    let keepalive = CommandWord::system(SystemCommand::Keepalive).with_write(true);
    let mut next = Instant::now();

    while shared.connected.load(Ordering::Acquire) {
        let now = Instant::now();
        if now < next {
            thread::sleep((next - now).min(READ_POLL));
            continue;
        }
        next = now + interval;

        // Every keepalive gets one interval to be answered before it counts.
        if shared.missed_keepalives.load(Ordering::Acquire) >= limit {
            warn!("Unit missed {limit} keepalives");
            shared.close("keepalive timeout");
            break;
        }
        shared.missed_keepalives.fetch_add(1, Ordering::AcqRel);
        if shared.send(keepalive, &[]).is_err() {
            break;
        }
    }
    debug!("Keepalive thread done");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::AdminCommand;
    use std::net::TcpListener;
    use std::sync::mpsc;

    fn wait_until(mut f: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(3);
        while Instant::now() < deadline {
            if f() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    /// Unit that forwards every frame it receives, except keepalives when
    /// it answers them.
    fn fake_unit(answer_keepalives: bool) -> (SocketConfig, mpsc::Receiver<Frame>, mpsc::Sender<Vec<u8>>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let (frames_tx, frames_rx) = mpsc::channel();
        let (out_tx, out_rx) = mpsc::channel::<Vec<u8>>();

        thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            stream.set_read_timeout(Some(Duration::from_millis(5))).unwrap();
            let mut decoder = FrameDecoder::new();
            let mut buf = [0u8; 512];
            loop {
                while let Ok(bytes) = out_rx.try_recv() {
                    if stream.write_all(&bytes).is_err() {
                        return;
                    }
                }
                match stream.read(&mut buf) {
                    Ok(0) => return,
                    Ok(n) => {
                        for frame in decoder.push(&buf[..n]) {
                            let keepalive =
                                frame.command.system_command() == Some(SystemCommand::Keepalive);
                            if keepalive && answer_keepalives {
                                let reply = encode_frame(frame.command, &[]).unwrap();
                                let _ = stream.write_all(&reply);
                            } else if frames_tx.send(frame).is_err() {
                                return;
                            }
                        }
                    }
                    Err(e) if is_timeout(&e) => {}
                    Err(_) => return,
                }
            }
        });

        let config = SocketConfig::new("127.0.0.1", port)
            .with_keepalive(Duration::from_millis(10), 3);
        (config, frames_rx, out_tx)
    }

    #[test]
    fn test_commands_reach_unit() {
        let (config, frames, _out) = fake_unit(true);
        let socket = BinarySocket::connect(config).unwrap();

        let command = CommandWord::admin(AdminCommand::LogsRead).with_write(true);
        socket.send_command(command, &[0x00, 0x07]).unwrap();

        let frame = frames.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(frame.command.admin_command(), Some(AdminCommand::LogsRead));
        assert!(frame.command.write);
        assert_eq!(frame.command.data_length, 2);
        assert_eq!(frame.data, vec![0x00, 0x07]);
    }

    #[test]
    fn test_frames_reach_handler() {
        let (config, _frames, out) = fake_unit(true);
        let socket = BinarySocket::connect(config).unwrap();
        let (tx, rx) = mpsc::channel();
        socket.on_frame(move |frame| {
            let _ = tx.send(frame);
        });

        let command = CommandWord::admin(AdminCommand::ConfigExport);
        out.send(b"\x00\x00junk".to_vec()).unwrap();
        out.send(encode_frame(command, &[0x00, 0x01, b'x']).unwrap()).unwrap();

        let frame = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(frame.command.admin_command(), Some(AdminCommand::ConfigExport));
        assert_eq!(frame.data, vec![0x00, 0x01, b'x']);
        assert!(socket.is_connected());
    }

    #[test]
    fn test_answered_keepalives_hold_link() {
        let (config, _frames, _out) = fake_unit(true);
        let config = config.with_keepalive(Duration::from_millis(20), 10);
        let socket = BinarySocket::connect(config).unwrap();
        thread::sleep(Duration::from_millis(300));
        assert!(socket.is_connected());
    }

    #[test]
    fn test_unanswered_keepalives_drop_link() {
        let (config, _frames, _out) = fake_unit(false);
        let socket = BinarySocket::connect(config).unwrap();
        assert!(wait_until(|| !socket.is_connected()));
        assert!(matches!(
            socket.send_command(CommandWord::admin(AdminCommand::Firmware), &[]),
            Err(Error::NotConnected)
        ));
    }

    #[test]
    fn test_link_drops_after_exactly_limit_keepalives() {
        let (config, frames, _out) = fake_unit(false);
        let socket = BinarySocket::connect(config).unwrap();
        assert!(wait_until(|| !socket.is_connected()));

        // The unit sees EOF once the link is shut down, which ends the stream.
        let keepalives = frames
            .iter()
            .filter(|f| f.command.system_command() == Some(SystemCommand::Keepalive))
            .count();
        assert_eq!(keepalives, 3);
        assert_eq!(socket.missed_keepalives(), 3);
    }

    #[test]
    fn test_unit_disconnect_closes_link() {
        let (config, _frames, out) = fake_unit(true);
        let socket = BinarySocket::connect(config).unwrap();
        let goodbye = CommandWord::system(SystemCommand::Disconnect);
        out.send(encode_frame(goodbye, &[]).unwrap()).unwrap();
        assert!(wait_until(|| !socket.is_connected()));
    }

    #[test]
    fn test_bad_checksum_counts_dropped() {
        let (config, _frames, out) = fake_unit(true);
        let socket = BinarySocket::connect(config).unwrap();

        let mut frame = encode_frame(CommandWord::admin(AdminCommand::LogsRead), &[0, 1]).unwrap();
        let last = frame.len() - 2;
        frame[last] ^= 0x01;
        out.send(frame).unwrap();

        assert!(wait_until(|| socket.dropped_frames() == 1));
    }

    #[test]
    fn test_connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        assert!(BinarySocket::connect(SocketConfig::new("127.0.0.1", port)).is_err());
    }
}
