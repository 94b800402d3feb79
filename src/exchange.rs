//! Per-operation state machines.
//!
//! Each exchange consumes response bytes through [`Exchange::on_bytes`] until
//! it reaches a terminal state, or gives up in [`Exchange::on_timeout`]. The
//! write exchange runs its block loop synchronously once the programmer has
//! accepted the write command, using the transport's bounded waits.

use crate::framer::{find_after_marker, find_marker, leading_token, strip_to_marker, trimmed_text};
use crate::protocol::{
    BLOCK_ACK_FALLBACK_MS, BLOCK_SIZE, READ_CHUNK, RESPONSE_BLOCK_REQUEST, RESPONSE_ERROR, RESPONSE_OK,
    RESPONSE_OK_LINE, RESPONSE_READ_LINE, RESPONSE_VOLTAGE, RESPONSE_WRITE_LINE, SETTLE_MS,
};
use crate::{collect, read_available, send, Centivolts, Error, Session, Stage, Transport};

#[derive(Copy, Clone, PartialEq, Debug)]
pub enum ExchangeKind {
    Select,
    Read,
    Write,
    Voltage,
}

pub(crate) enum Step {
    Pending,
    Done(Completion),
}

pub(crate) enum Completion {
    Selected,
    Read(Vec<u8>),
    Written,
    Voltage(Centivolts),
}

pub(crate) enum Exchange {
    Select { rx: Vec<u8> },
    Read(ReadChip),
    Write { rx: Vec<u8> },
    Voltage { rx: Vec<u8> },
}

pub(crate) struct ReadChip {
    target: usize,
    data: Vec<u8>,
    /// Start of the stream, held back until a full chunk has arrived
    head: Option<Vec<u8>>,
}

impl Exchange {
    pub fn select() -> Self {
        Exchange::Select { rx: Vec::new() }
    }

    pub fn read(target: usize) -> Self {
        Exchange::Read(ReadChip {
            target,
            data: Vec::with_capacity(target),
            head: Some(Vec::with_capacity(READ_CHUNK)),
        })
    }

    pub fn write() -> Self {
        Exchange::Write { rx: Vec::new() }
    }

    pub fn voltage() -> Self {
        Exchange::Voltage { rx: Vec::new() }
    }

    pub fn kind(&self) -> ExchangeKind {
        match self {
            Exchange::Select { .. } => ExchangeKind::Select,
            Exchange::Read(_) => ExchangeKind::Read,
            Exchange::Write { .. } => ExchangeKind::Write,
            Exchange::Voltage { .. } => ExchangeKind::Voltage,
        }
    }

    pub fn on_bytes<P, E>(
        &mut self,
        port: &mut P,
        session: &Session,
        data: &[u8],
        progress: &mut dyn FnMut(usize),
    ) -> Result<Step, Error<E>>
    where
        P: Transport<E>,
    {
        match self {
            Exchange::Select { rx } => {
                rx.extend_from_slice(data);

                if find_marker(rx, RESPONSE_OK).is_some() {
                    debug!("Chip selection acknowledged");
                    return Ok(Step::Done(Completion::Selected));
                }
                Ok(Step::Pending)
            }
            Exchange::Read(read) => Ok(read.on_chunk(data, progress)),
            Exchange::Write { rx } => {
                rx.extend_from_slice(data);

                let ok_end = match find_after_marker(rx, RESPONSE_OK_LINE) {
                    Some(i) => i,
                    None => return Ok(Step::Pending),
                };
                let reply = &rx[ok_end..];

                if let Some(err_end) = find_after_marker(reply, RESPONSE_ERROR) {
                    return Err(device_error(port, reply[err_end..].to_vec()));
                }

                let header_end = match find_after_marker(reply, RESPONSE_WRITE_LINE) {
                    Some(i) => i,
                    None => return Ok(Step::Pending),
                };

                let pending = reply[header_end..].to_vec();
                write_blocks(port, session, pending, progress)?;

                Ok(Step::Done(Completion::Written))
            }
            Exchange::Voltage { rx } => {
                rx.extend_from_slice(data);

                match voltage_text(rx) {
                    Some(tail) => match leading_token(tail, false) {
                        Some(token) => parse_centivolts(token).map(|v| Step::Done(Completion::Voltage(v))),
                        None => Ok(Step::Pending),
                    },
                    None => Ok(Step::Pending),
                }
            }
        }
    }

    /// No further data arrived within the response timeout
    pub fn on_timeout<E>(self) -> Result<Completion, Error<E>> {
        match self {
            Exchange::Select { .. } => Err(Error::AcknowledgeTimeout(Stage::Select)),
            Exchange::Read(read) => {
                warn!("Read stalled after {} of {} bytes", read.data.len(), read.target);
                Err(Error::AcknowledgeTimeout(Stage::Read))
            }
            Exchange::Write { .. } => Err(Error::AcknowledgeTimeout(Stage::Write)),
            Exchange::Voltage { rx } => {
                // An unterminated reading is complete once the line goes quiet
                let tail = voltage_text(&rx).ok_or(Error::AcknowledgeTimeout(Stage::Voltage))?;
                let token = leading_token(tail, true)
                    .ok_or_else(|| Error::MalformedResponse("empty voltage info".to_string()))?;

                parse_centivolts(token).map(Completion::Voltage)
            }
        }
    }
}

impl ReadChip {
    fn on_chunk(&mut self, chunk: &[u8], progress: &mut dyn FnMut(usize)) -> Step {
        match self.head.take() {
            Some(mut head) => {
                head.extend_from_slice(chunk);
                if head.len() < READ_CHUNK {
                    self.head = Some(head);
                    progress(self.data.len());
                    return Step::Pending;
                }

                // The programmer may echo its status and header ahead of the image
                strip_to_marker(&mut head, RESPONSE_OK_LINE);
                strip_to_marker(&mut head, RESPONSE_READ_LINE);
                self.data.extend_from_slice(&head);
            }
            None => self.data.extend_from_slice(chunk),
        }

        if self.data.len() > self.target {
            self.data.truncate(self.target);
        }
        progress(self.data.len());

        if self.data.len() < self.target {
            return Step::Pending;
        }

        debug!("Read {} bytes", self.data.len());
        Step::Done(Completion::Read(core::mem::take(&mut self.data)))
    }
}

/// Stream the write buffer in blocks, each requested and acknowledged by the programmer
fn write_blocks<P, E>(
    port: &mut P,
    session: &Session,
    mut rx: Vec<u8>,
    progress: &mut dyn FnMut(usize),
) -> Result<(), Error<E>>
where
    P: Transport<E>,
{
    let image = session.write_buffer();
    let turnaround = session.profile().block_turnaround_ms();

    collect(port, SETTLE_MS, &mut rx)?;

    for offset in (0..image.len()).step_by(BLOCK_SIZE) {
        rx.extend(read_available(port, usize::MAX)?);

        // Block index may still be on its way behind the marker
        if let Some(end) = find_after_marker(&rx, RESPONSE_BLOCK_REQUEST) {
            if leading_token(&rx[end..], false).is_none() {
                collect(port, SETTLE_MS, &mut rx)?;
            }
        }

        let requested = block_request(&mut rx)?;
        if requested != offset {
            error!("Invalid block {:x} received, expected {:x}", requested, offset);
            return Err(Error::ProtocolDesync {
                expected: offset,
                received: requested,
            });
        }

        let end = (offset + BLOCK_SIZE).min(image.len());
        send(port, &image[offset..end])?;

        rx.clear();
        collect(port, turnaround, &mut rx)?;
        check_device_error(port, &rx)?;

        if find_marker(&rx, RESPONSE_OK_LINE).is_none() {
            debug!("Block {:x} not acknowledged yet", offset);
            collect(port, BLOCK_ACK_FALLBACK_MS, &mut rx)?;
            check_device_error(port, &rx)?;
        }

        if !strip_to_marker(&mut rx, RESPONSE_OK_LINE) {
            error!("Can't acknowledge block {:x}", offset);
            return Err(Error::AcknowledgeTimeout(Stage::Block(offset)));
        }

        progress(offset);
    }

    debug!("Wrote {} blocks", image.len() / BLOCK_SIZE);
    Ok(())
}

/// Consume a block request, returning the offset the programmer expects next
fn block_request<E>(rx: &mut Vec<u8>) -> Result<usize, Error<E>> {
    if !strip_to_marker(rx, RESPONSE_BLOCK_REQUEST) {
        return Err(Error::MalformedResponse("invalid acknowledge data received".to_string()));
    }

    let token = leading_token(rx, true)
        .ok_or_else(|| Error::MalformedResponse("missing block index".to_string()))?;
    let text = String::from_utf8_lossy(token);

    text.parse::<usize>()
        .map_err(|_| Error::MalformedResponse(format!("invalid block index '{}'", text)))
}

fn check_device_error<P, E>(port: &mut P, rx: &[u8]) -> Result<(), Error<E>>
where
    P: Transport<E>,
{
    match find_after_marker(rx, RESPONSE_ERROR) {
        Some(end) => Err(device_error(port, rx[end..].to_vec())),
        None => Ok(()),
    }
}

/// Give the rest of an error message a moment to arrive, then surface it
fn device_error<P, E>(port: &mut P, mut payload: Vec<u8>) -> Error<E>
where
    P: Transport<E>,
{
    if let Err(e) = collect(port, SETTLE_MS, &mut payload) {
        return e;
    }

    let message = trimmed_text(&payload);
    error!("Programmer reported: {}", message);
    Error::DeviceError(message)
}

/// Text following the voltage marker, once status and marker have both arrived
fn voltage_text(rx: &[u8]) -> Option<&[u8]> {
    let ok_end = find_after_marker(rx, RESPONSE_OK_LINE)?;
    let reply = &rx[ok_end..];
    let marker_end = find_after_marker(reply, RESPONSE_VOLTAGE)?;

    Some(&reply[marker_end..])
}

fn parse_centivolts<E>(token: &[u8]) -> Result<Centivolts, Error<E>> {
    let text = String::from_utf8_lossy(token);

    let volts: f64 = text
        .parse()
        .map_err(|_| Error::MalformedResponse(format!("invalid voltage '{}'", text)))?;
    if !volts.is_finite() || volts < 0.0 {
        return Err(Error::MalformedResponse(format!("invalid voltage '{}'", text)));
    }

    Ok((volts * 100.0).round() as Centivolts)
}
