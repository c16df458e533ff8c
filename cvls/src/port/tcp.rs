//! Text protocol over Ethernet.

use std::io::{Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

use log::debug;

use crate::error::{Error, Result};
use crate::port::Port;

/// A [`Port`] over a TCP connection.
pub struct TcpPort {
    stream: Option<TcpStream>,
    name: String,
    timeout: Duration,
}

impl TcpPort {
    /// Connect to `addr` (e.g. `"192.168.0.2:5000"`), waiting at most
    /// `timeout` for the connection and for every read afterwards.
    pub fn connect(addr: impl ToSocketAddrs, timeout: Duration) -> Result<Self> {
        let addr = resolve(addr)?;
        debug!("Connecting to {addr}");
        let stream = TcpStream::connect_timeout(&addr, timeout)?;
        stream.set_nodelay(true)?;
        Self::from_stream(stream, timeout)
    }

    /// Wrap an already connected stream.
    pub fn from_stream(stream: TcpStream, timeout: Duration) -> Result<Self> {
        let name = stream
            .peer_addr()
            .map_or_else(|_| "tcp".to_string(), |addr| addr.to_string());
        stream.set_read_timeout(Some(timeout))?;
        stream.set_write_timeout(Some(timeout))?;
        Ok(Self {
            stream: Some(stream),
            name,
            timeout,
        })
    }

    fn stream(&mut self) -> std::io::Result<&mut TcpStream> {
        self.stream
            .as_mut()
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotConnected, "port closed"))
    }
}

/// First address `addr` resolves to.
pub(crate) fn resolve(addr: impl ToSocketAddrs) -> Result<SocketAddr> {
    addr.to_socket_addrs()?
        .next()
        .ok_or_else(|| Error::Config("address did not resolve".to_string()))
}

impl Port for TcpPort {
    fn set_timeout(&mut self, timeout: Duration) -> Result<()> {
        if let Some(stream) = &self.stream {
            stream.set_read_timeout(Some(timeout))?;
            stream.set_write_timeout(Some(timeout))?;
        }
        self.timeout = timeout;
        Ok(())
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn clear_buffers(&mut self) -> Result<()> {
        let Some(stream) = &mut self.stream else {
            return Ok(());
        };
        stream.set_nonblocking(true)?;
        let mut scratch = [0u8; 256];
        let drained = loop {
            match stream.read(&mut scratch) {
                Ok(0) => break Ok(()),
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break Ok(()),
                Err(e) => break Err(e),
            }
        };
        stream.set_nonblocking(false)?;
        drained.map_err(Error::from)
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn close(&mut self) -> Result<()> {
        if let Some(stream) = self.stream.take() {
            // Already closed by the peer is fine.
            let _ = stream.shutdown(Shutdown::Both);
        }
        Ok(())
    }
}

impl Read for TcpPort {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.stream()?.read(buf)
    }
}

impl Write for TcpPort {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.stream()?.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.stream()?.flush()
    }
}
