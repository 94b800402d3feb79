use std::io::ErrorKind as IoErrorKind;
use std::path::Path;
use std::time::Duration;

use embedded_hal::serial::{Read, Write};
use linux_embedded_hal::{Delay, Serial};
use serial_core::{
    BaudRate, CharSize, Error as SerialError, FlowControl, Parity, SerialDevice as _,
    SerialPortSettings as _, StopBits,
};

use crate::{Options, Programmer, Transport};

/// Programmer link over a Linux TTY.
///
/// The port is kept in non-blocking mode, bounded waits temporarily raise
/// the timeout and hold on to the byte that ended them.
pub struct SerialTransport {
    serial: Serial,
    peeked: Option<u8>,
}

fn io_kind(e: SerialError) -> IoErrorKind {
    std::io::Error::from(e).kind()
}

impl SerialTransport {
    /// Open and configure a serial port for the programmer (8N1, no flow control)
    pub fn open<P: AsRef<Path>>(port: P, baud: usize) -> Result<Self, SerialError> {
        let mut serial = Serial::open(port.as_ref())?;

        let mut settings = serial.0.read_settings()?;

        settings.set_char_size(CharSize::Bits8);
        settings.set_stop_bits(StopBits::Stop1);
        settings.set_baud_rate(BaudRate::from_speed(baud))?;
        settings.set_flow_control(FlowControl::FlowNone);
        settings.set_parity(Parity::ParityNone);

        serial.0.write_settings(&settings)?;
        serial.0.set_timeout(Duration::from_millis(0))?;

        Ok(Self { serial, peeked: None })
    }
}

impl Read<u8> for SerialTransport {
    type Error = IoErrorKind;

    fn read(&mut self) -> nb::Result<u8, Self::Error> {
        match self.peeked.take() {
            Some(b) => Ok(b),
            None => self.serial.read(),
        }
    }
}

impl Write<u8> for SerialTransport {
    type Error = IoErrorKind;

    fn write(&mut self, word: u8) -> nb::Result<(), Self::Error> {
        self.serial.write(word)
    }

    fn flush(&mut self) -> nb::Result<(), Self::Error> {
        self.serial.flush()
    }
}

impl Transport<IoErrorKind> for SerialTransport {
    fn wait_for_data(&mut self, timeout_ms: u32) -> Result<bool, IoErrorKind> {
        if self.peeked.is_some() {
            return Ok(true);
        }

        self.serial
            .0
            .set_timeout(Duration::from_millis(timeout_ms.into()))
            .map_err(io_kind)?;
        let res = self.serial.read();
        self.serial.0.set_timeout(Duration::from_millis(0)).map_err(io_kind)?;

        match res {
            Ok(b) => {
                self.peeked = Some(b);
                Ok(true)
            }
            Err(nb::Error::WouldBlock) => Ok(false),
            Err(nb::Error::Other(e)) => Err(e),
        }
    }

    fn set_dtr(&mut self, level: bool) -> Result<(), IoErrorKind> {
        self.serial.0.set_dtr(level).map_err(io_kind)
    }
}

impl Programmer<SerialTransport, Delay, IoErrorKind> {
    /// Create a new linux serial port programmer instance
    pub fn linux<P: AsRef<Path>>(
        port: P,
        baud: usize,
        options: Options,
    ) -> Result<Self, SerialError> {
        // Open port
        let transport = SerialTransport::open(port, baud)?;

        // Return instance
        Ok(Self::new(transport, Delay, options))
    }
}
