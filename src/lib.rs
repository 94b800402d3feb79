//! Serial 27Cxxx EPROM programmer.
//!
//! Drives the microcontroller bridge of the Arduino 27CXXX programmer over a
//! plain byte stream. Every operation is a short exchange: an 8 byte command
//! followed by marker-delimited responses, with writes streamed in 16 byte
//! blocks that the device requests and acknowledges one at a time.
//!
//! The [`Programmer`] can be driven by the host's own event loop
//! ([`Programmer::begin`], [`Programmer::on_data_available`],
//! [`Programmer::on_timeout`]) or through the blocking helpers
//! ([`Programmer::read_chip`] and friends) which run that loop on the
//! transport's bounded wait.

use core::fmt;
use core::marker::PhantomData;

#[macro_use]
extern crate log;

#[macro_use(block)]
extern crate nb;

extern crate embedded_hal;
use embedded_hal::blocking::delay::DelayMs;
use embedded_hal::serial::{Read, Write};

#[cfg(feature = "structopt")]
extern crate structopt;

#[cfg(feature = "linux")]
extern crate linux_embedded_hal;

pub mod framer;
pub mod protocol;
pub mod verify;

mod exchange;
pub use exchange::ExchangeKind;
use exchange::{Completion, Exchange, Step};

#[cfg(feature = "linux")]
pub mod linux;

use framer::find_marker;
use protocol::{ChipProfile, Command, PROGRAMMER_NAME, READ_CHUNK};

/// Programming voltage in hundredths of a volt
pub type Centivolts = u32;

/// Byte stream to the programmer.
///
/// `read` must return `nb::Error::WouldBlock` when nothing is buffered;
/// `wait_for_data` is the only call allowed to block.
pub trait Transport<E>: Write<u8, Error = E> + Read<u8, Error = E> {
    /// Wait up to `timeout_ms` for received data, returning whether any is available
    fn wait_for_data(&mut self, timeout_ms: u32) -> Result<bool, E>;

    /// Drive the DTR line, used to reset the programmer
    fn set_dtr(&mut self, level: bool) -> Result<(), E>;
}

#[derive(Copy, Clone, PartialEq, Debug)]
pub enum State {
    /// Programmer banner not seen yet
    Init,
    /// Connected with no exchange in progress
    Ready,
    /// An exchange is waiting on the programmer
    Busy(ExchangeKind),
}

/// Step of an exchange that ran out of time
#[derive(Copy, Clone, PartialEq, Debug)]
pub enum Stage {
    Connect,
    Select,
    Read,
    Write,
    /// Write block starting at this offset
    Block(usize),
    Voltage,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Connect => write!(f, "programmer banner"),
            Stage::Select => write!(f, "chip selection"),
            Stage::Read => write!(f, "chip read"),
            Stage::Write => write!(f, "chip write"),
            Stage::Block(offset) => write!(f, "block {:x}", offset),
            Stage::Voltage => write!(f, "voltage info"),
        }
    }
}

#[derive(Clone, PartialEq, Debug, thiserror::Error)]
pub enum Error<SerialError> {
    #[error("serial error: {0:?}")]
    Serial(SerialError),

    #[error("an exchange is already in progress")]
    Busy,

    #[error("no exchange in progress")]
    Idle,

    #[error("invalid data length of {actual}, chip expects {expected}")]
    LengthMismatch { expected: usize, actual: usize },

    #[error("programmer error: {0}")]
    DeviceError(String),

    #[error("invalid block {received:x} received, expected {expected:x}")]
    ProtocolDesync { expected: usize, received: usize },

    #[error("can't acknowledge {0}")]
    AcknowledgeTimeout(Stage),

    #[error("malformed response: {0}")]
    MalformedResponse(String),
}

impl<SerialError> From<SerialError> for Error<SerialError> {
    fn from(e: SerialError) -> Self {
        Self::Serial(e)
    }
}

#[derive(Clone, PartialEq, Debug)]
#[cfg_attr(feature = "structopt", derive(structopt::StructOpt))]
pub struct Options {
    /// Do not reset the programmer on connection
    #[cfg_attr(feature = "structopt", structopt(long))]
    pub no_reset: bool,

    /// Timeout to wait for programmer responses
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "1000"))]
    pub response_timeout_ms: u32,

    /// Timeout to wait for each part of the programmer banner
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "5000"))]
    pub banner_timeout_ms: u32,

    /// Length of the DTR reset pulse
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "100"))]
    pub reset_pulse_ms: u32,

    /// Period to wait after reset before listening for the banner
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "0"))]
    pub init_delay_ms: u32,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            no_reset: false,
            response_timeout_ms: 1000,
            banner_timeout_ms: 5000,
            reset_pulse_ms: 100,
            init_delay_ms: 0,
        }
    }
}

/// Request handed to [`Programmer::begin`]
#[derive(Clone, PartialEq, Debug)]
pub enum Operation {
    Select(ChipProfile),
    Read,
    Write(Vec<u8>),
    Voltage,
}

/// Terminal result of a successful exchange
#[derive(Copy, Clone, PartialEq, Debug)]
pub enum Outcome {
    Selected(ChipProfile),
    /// Bytes now held in the read buffer
    Read(usize),
    /// Bytes programmed
    Written(usize),
    Voltage(Centivolts),
}

/// Chip profile and the buffers of the last read and write
#[derive(Clone, PartialEq, Debug, Default)]
pub struct Session {
    profile: ChipProfile,
    read_buffer: Vec<u8>,
    write_buffer: Vec<u8>,
}

impl Session {
    pub fn profile(&self) -> ChipProfile {
        self.profile
    }

    /// Image size of the selected chip
    pub fn buffer_size(&self) -> usize {
        self.profile.buffer_size()
    }

    pub fn read_buffer(&self) -> &[u8] {
        &self.read_buffer
    }

    pub fn write_buffer(&self) -> &[u8] {
        &self.write_buffer
    }
}

pub struct Programmer<P, D, E> {
    connected: bool,
    options: Options,
    port: P,
    delay: D,
    session: Session,
    exchange: Option<Exchange>,
    _err: PhantomData<E>,
}

impl<P, D, E> Programmer<P, D, E>
where
    P: Transport<E>,
    D: DelayMs<u32>,
    E: core::fmt::Debug,
{
    /// Create a new programmer instance
    pub fn new(port: P, delay: D, options: Options) -> Self {
        Self {
            connected: false,
            options,
            port,
            delay,
            session: Session::default(),
            exchange: None,
            _err: PhantomData,
        }
    }

    /// Fetch the programmer state
    pub fn state(&self) -> State {
        match &self.exchange {
            Some(e) => State::Busy(e.kind()),
            None if self.connected => State::Ready,
            None => State::Init,
        }
    }

    pub fn is_busy(&self) -> bool {
        self.exchange.is_some()
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn chip_profile(&self) -> ChipProfile {
        self.session.profile
    }

    /// Image size of the selected chip, zero when none is selected
    pub fn chip_buffer_size(&self) -> usize {
        self.session.buffer_size()
    }

    /// Image captured by the last completed read
    pub fn read_buffer(&self) -> &[u8] {
        &self.session.read_buffer
    }

    /// Image sent by the last accepted write
    pub fn write_buffer(&self) -> &[u8] {
        &self.session.write_buffer
    }

    pub fn transport(&self) -> &P {
        &self.port
    }

    /// Release the underlying transport
    pub fn into_inner(self) -> P {
        self.port
    }

    /// Reset the programmer and wait for its banner, then deselect any chip
    pub fn connect(&mut self) -> Result<(), Error<E>> {
        if self.exchange.is_some() {
            return Err(Error::Busy);
        }

        if !self.options.no_reset {
            debug!("Resetting programmer");

            self.port.set_dtr(true)?;
            self.delay.delay_ms(self.options.reset_pulse_ms);
            self.port.set_dtr(false)?;

            self.delay.delay_ms(self.options.init_delay_ms);
        }

        debug!("Awaiting programmer banner");

        let mut banner = read_available(&mut self.port, usize::MAX)?;
        while find_marker(&banner, PROGRAMMER_NAME).is_none() {
            if !self.port.wait_for_data(self.options.banner_timeout_ms)? {
                error!("Programmer not found");
                return Err(Error::AcknowledgeTimeout(Stage::Connect));
            }
            banner.extend(read_available(&mut self.port, usize::MAX)?);
        }

        info!("Programmer connected");
        self.connected = true;

        self.select_chip(ChipProfile::None)
    }

    /// Send the command for `operation` and start tracking its exchange.
    ///
    /// Returns an outcome straight away only when there is nothing to wait
    /// for (reading with no chip selected).
    pub fn begin(&mut self, operation: Operation) -> Result<Option<Outcome>, Error<E>> {
        if let Some(active) = &self.exchange {
            warn!("Rejecting {:?}, {:?} exchange in progress", operation_kind(&operation), active.kind());
            return Err(Error::Busy);
        }

        let exchange = match operation {
            Operation::Select(profile) => {
                // Callers size their buffers from this before the device answers
                self.session.profile = profile;
                debug!("Selecting {} ({} bytes)", profile, profile.buffer_size());

                send(&mut self.port, &profile.select_command().encode())?;
                Exchange::select()
            }
            Operation::Read => {
                self.session.read_buffer.clear();

                let target = self.session.buffer_size();
                if target == 0 {
                    debug!("No chip selected, nothing to read");
                    return Ok(Some(Outcome::Read(0)));
                }

                debug!("Reading {} bytes from chip", target);
                send(&mut self.port, &Command::ReadChip.encode())?;
                Exchange::read(target)
            }
            Operation::Write(data) => {
                let expected = self.session.buffer_size();
                if data.len() != expected {
                    error!("Invalid data length of {}, expected {}", data.len(), expected);
                    return Err(Error::LengthMismatch { expected, actual: data.len() });
                }
                self.session.write_buffer = data;

                debug!("Writing {} bytes to chip", expected);
                send(&mut self.port, &Command::WriteChip.encode())?;
                Exchange::write()
            }
            Operation::Voltage => {
                send(&mut self.port, &Command::VoltageInfo.encode())?;
                Exchange::voltage()
            }
        };

        self.exchange = Some(exchange);
        Ok(None)
    }

    /// Feed everything the transport has buffered to the active exchange.
    ///
    /// Bytes are pulled in chunks of at most 64, progress is reported per
    /// chunk while reading and per block while writing.
    pub fn on_data_available<F>(&mut self, mut progress: F) -> Result<Option<Outcome>, Error<E>>
    where
        F: FnMut(usize),
    {
        let mut exchange = self.exchange.take().ok_or(Error::Idle)?;

        loop {
            let chunk = read_available(&mut self.port, READ_CHUNK)?;
            if chunk.is_empty() {
                self.exchange = Some(exchange);
                return Ok(None);
            }

            match exchange.on_bytes(&mut self.port, &self.session, &chunk, &mut progress) {
                Ok(Step::Pending) => (),
                Ok(Step::Done(c)) => return Ok(Some(self.complete(c))),
                Err(e) => {
                    error!("{:?} exchange failed: {}", exchange.kind(), e);
                    return Err(e);
                }
            }
        }
    }

    /// Response timer for the active exchange expired without new data
    pub fn on_timeout(&mut self) -> Result<Option<Outcome>, Error<E>> {
        let exchange = self.exchange.take().ok_or(Error::Idle)?;
        let kind = exchange.kind();

        match exchange.on_timeout() {
            Ok(c) => Ok(Some(self.complete(c))),
            Err(e) => {
                error!("{:?} exchange failed: {}", kind, e);
                Err(e)
            }
        }
    }

    /// Abandon the active exchange without sending anything further.
    ///
    /// Partial read data is discarded. Returns false if nothing was running.
    pub fn cancel(&mut self) -> bool {
        match self.exchange.take() {
            Some(e) => {
                warn!("Cancelled {:?} exchange", e.kind());
                true
            }
            None => false,
        }
    }

    /// Select a chip and wait for the programmer to confirm
    pub fn select_chip(&mut self, profile: ChipProfile) -> Result<(), Error<E>> {
        match self.run(Operation::Select(profile), |_| ())? {
            Outcome::Selected(_) => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    /// Read the whole chip, reporting the number of bytes received so far
    pub fn read_chip<F>(&mut self, progress: F) -> Result<&[u8], Error<E>>
    where
        F: FnMut(usize),
    {
        match self.run(Operation::Read, progress)? {
            Outcome::Read(_) => Ok(&self.session.read_buffer),
            other => Err(unexpected(other)),
        }
    }

    /// Program the whole chip, reporting the offset of each acknowledged block
    pub fn write_chip<F>(&mut self, data: &[u8], progress: F) -> Result<(), Error<E>>
    where
        F: FnMut(usize),
    {
        match self.run(Operation::Write(data.to_vec()), progress)? {
            Outcome::Written(_) => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    /// Sample the programming voltage
    pub fn read_voltage(&mut self) -> Result<Centivolts, Error<E>> {
        match self.run(Operation::Voltage, |_| ())? {
            Outcome::Voltage(v) => Ok(v),
            other => Err(unexpected(other)),
        }
    }

    fn run<F>(&mut self, operation: Operation, mut progress: F) -> Result<Outcome, Error<E>>
    where
        F: FnMut(usize),
    {
        if let Some(outcome) = self.begin(operation)? {
            return Ok(outcome);
        }

        loop {
            let ready = match self.port.wait_for_data(self.options.response_timeout_ms) {
                Ok(r) => r,
                Err(e) => {
                    self.exchange = None;
                    return Err(e.into());
                }
            };

            let outcome = if ready {
                self.on_data_available(&mut progress)?
            } else {
                self.on_timeout()?
            };

            if let Some(o) = outcome {
                return Ok(o);
            }
        }
    }

    fn complete(&mut self, completion: Completion) -> Outcome {
        let outcome = match completion {
            Completion::Selected => Outcome::Selected(self.session.profile),
            Completion::Read(data) => {
                self.session.read_buffer = data;
                Outcome::Read(self.session.read_buffer.len())
            }
            Completion::Written => Outcome::Written(self.session.write_buffer.len()),
            Completion::Voltage(v) => Outcome::Voltage(v),
        };

        info!("Exchange complete: {:?}", outcome);
        outcome
    }
}

fn operation_kind(operation: &Operation) -> ExchangeKind {
    match operation {
        Operation::Select(_) => ExchangeKind::Select,
        Operation::Read => ExchangeKind::Read,
        Operation::Write(_) => ExchangeKind::Write,
        Operation::Voltage => ExchangeKind::Voltage,
    }
}

fn unexpected<E>(outcome: Outcome) -> Error<E> {
    Error::MalformedResponse(format!("unexpected outcome {:?}", outcome))
}

/// Write `data` and flush it out to the programmer
pub(crate) fn send<P, E>(port: &mut P, data: &[u8]) -> Result<(), Error<E>>
where
    P: Transport<E>,
{
    for b in data {
        block!(port.write(*b))?;
    }
    block!(port.flush())?;

    Ok(())
}

/// Pull up to `max` already buffered bytes without blocking
pub(crate) fn read_available<P, E>(port: &mut P, max: usize) -> Result<Vec<u8>, Error<E>>
where
    P: Transport<E>,
{
    let mut data = Vec::new();

    while data.len() < max {
        match port.read() {
            Ok(b) => data.push(b),
            Err(nb::Error::WouldBlock) => break,
            Err(nb::Error::Other(e)) => return Err(e.into()),
        }
    }

    Ok(data)
}

/// Bounded wait, then append whatever arrived to `buffer`
pub(crate) fn collect<P, E>(port: &mut P, timeout_ms: u32, buffer: &mut Vec<u8>) -> Result<(), Error<E>>
where
    P: Transport<E>,
{
    port.wait_for_data(timeout_ms)?;
    buffer.extend(read_available(port, usize::MAX)?);
    Ok(())
}
