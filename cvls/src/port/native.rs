//! RS-232 port via the `serialport` crate.

use {
    crate::{
        error::{Error, Result},
        port::{Parity, Port, PortEnumerator, PortInfo, SerialConfig, StopBits, UsbInfo},
    },
    log::debug,
    serialport::{ClearBuffer, DataBits, FlowControl, SerialPort, SerialPortInfo, SerialPortType},
    std::{
        io::{self, Read, Write},
        time::Duration,
    },
};

/// Serial connection to a unit's RS-232 port. `None` once closed.
pub struct NativePort {
    inner: Option<Box<dyn SerialPort>>,
    name: String,
    timeout: Duration,
}

impl NativePort {
    /// Open the port described by `config`, 8 data bits, no flow control.
    pub fn open(config: &SerialConfig) -> Result<Self> {
        debug!("Opening {} at {} baud", config.port_name, config.baud_rate);
        let inner = serialport::new(&config.port_name, config.baud_rate)
            .data_bits(DataBits::Eight)
            .flow_control(FlowControl::None)
            .parity(serial_parity(config.parity))
            .stop_bits(serial_stop_bits(config.stop_bits))
            .timeout(config.timeout)
            .open()?;

        Ok(Self {
            inner: Some(inner),
            name: config.port_name.clone(),
            timeout: config.timeout,
        })
    }

    fn live(&mut self) -> io::Result<&mut dyn SerialPort> {
        match self.inner.as_deref_mut() {
            Some(port) => Ok(port),
            None => Err(io::Error::new(
                io::ErrorKind::NotConnected,
                format!("{} is closed", self.name),
            )),
        }
    }
}

impl Port for NativePort {
    fn set_timeout(&mut self, timeout: Duration) -> Result<()> {
        if let Some(port) = self.inner.as_deref_mut() {
            port.set_timeout(timeout)?;
        }
        self.timeout = timeout;
        Ok(())
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn clear_buffers(&mut self) -> Result<()> {
        match self.inner.as_deref_mut() {
            Some(port) => Ok(port.clear(ClearBuffer::Input)?),
            None => Ok(()),
        }
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn close(&mut self) -> Result<()> {
        if self.inner.take().is_some() {
            debug!("Closed {}", self.name);
        }
        Ok(())
    }
}

impl Read for NativePort {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.live()?.read(buf)
    }
}

impl Write for NativePort {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.live()?.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.live()?.flush()
    }
}

/// Lists the serial ports of this machine.
pub struct NativePortEnumerator;

impl PortEnumerator for NativePortEnumerator {
    fn list_ports() -> Result<Vec<PortInfo>> {
        let ports = serialport::available_ports().map_err(Error::Serial)?;
        Ok(ports.into_iter().map(PortInfo::from).collect())
    }
}

impl From<SerialPortInfo> for PortInfo {
    fn from(info: SerialPortInfo) -> Self {
        let usb = match info.port_type {
            SerialPortType::UsbPort(usb) => Some(UsbInfo {
                vid: usb.vid,
                pid: usb.pid,
                manufacturer: usb.manufacturer,
                product: usb.product,
                serial_number: usb.serial_number,
            }),
            _ => None,
        };
        Self {
            name: info.port_name,
            usb,
        }
    }
}

fn serial_parity(parity: Parity) -> serialport::Parity {
    match parity {
        Parity::None => serialport::Parity::None,
        Parity::Odd => serialport::Parity::Odd,
        Parity::Even => serialport::Parity::Even,
    }
}

fn serial_stop_bits(bits: StopBits) -> serialport::StopBits {
    match bits {
        StopBits::One => serialport::StopBits::One,
        StopBits::Two => serialport::StopBits::Two,
    }
}
