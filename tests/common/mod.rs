//! Scripted programmer firmware for driving the engine without hardware.

#![allow(dead_code)]

use std::collections::VecDeque;

use embedded_hal::blocking::delay::DelayMs;
use embedded_hal::serial::{Read, Write};

use eprom_programmer::protocol::{BLOCK_SIZE, PROGRAMMER_NAME};
use eprom_programmer::{Options, Programmer, Transport};

const OK_LINE: &[u8] = b"$#@!OK  \r\n";

#[derive(Clone, Debug, PartialEq)]
pub struct LinkDown;

pub struct NoDelay;

impl DelayMs<u32> for NoDelay {
    fn delay_ms(&mut self, _ms: u32) {}
}

/// How the scripted firmware answers
#[derive(Clone, Debug)]
pub struct Firmware {
    /// Chip contents streamed in reply to a read
    pub image: Vec<u8>,
    /// Text sent after the voltage marker
    pub voltage: Vec<u8>,
    pub answer_select: bool,
    pub ack_blocks: bool,
    /// Request the wrong block index at this offset
    pub desync_at: Option<usize>,
    /// Fail programming the block at this offset
    pub error_at: Option<usize>,
    /// Refuse the write command with this message
    pub reject_write: Option<&'static str>,
    /// Print the banner when released from reset
    pub banner_on_reset: bool,
    /// Deliver at most this many bytes per bounded wait
    pub burst: Option<usize>,
}

impl Default for Firmware {
    fn default() -> Self {
        Self {
            image: Vec::new(),
            voltage: b" 12.34\r\n".to_vec(),
            answer_select: true,
            ack_blocks: true,
            desync_at: None,
            error_at: None,
            reject_write: None,
            banner_on_reset: true,
            burst: None,
        }
    }
}

pub struct MockPort {
    pub firmware: Firmware,
    /// Every byte written by the host
    pub tx: Vec<u8>,
    /// Block payloads accepted while writing
    pub written: Vec<u8>,
    /// Timeout of every bounded wait, in order
    pub waits: Vec<u32>,
    pub dtr: Vec<bool>,
    rx: VecDeque<u8>,
    pending: Vec<u8>,
    chip_size: usize,
    next_block: Option<usize>,
    budget: usize,
}

impl MockPort {
    pub fn new(firmware: Firmware) -> Self {
        Self {
            firmware,
            tx: Vec::new(),
            written: Vec::new(),
            waits: Vec::new(),
            dtr: Vec::new(),
            rx: VecDeque::new(),
            pending: Vec::new(),
            chip_size: 0,
            next_block: None,
            budget: 0,
        }
    }

    pub fn queue(&mut self, data: &[u8]) {
        self.rx.extend(data.iter().copied());
    }

    pub fn buffered(&self) -> usize {
        self.rx.len()
    }

    fn on_byte(&mut self, b: u8) {
        self.tx.push(b);
        self.pending.push(b);

        if let Some(offset) = self.next_block {
            if self.pending.len() == BLOCK_SIZE {
                let block = std::mem::take(&mut self.pending);
                self.written.extend_from_slice(&block);
                self.on_block(offset);
            }
            return;
        }

        if self.pending.len() == 8 {
            let command = std::mem::take(&mut self.pending);
            self.on_command(&command);
        }
    }

    fn on_command(&mut self, command: &[u8]) {
        assert_eq!(&command[..4], b"!@#$", "command without magic");

        match &command[4..] {
            b"NONE" => self.select(0),
            b"C16 " => self.select(0x0800),
            b"C32 " => self.select(0x1000),
            b"C64 " => self.select(0x2000),
            b"C128" => self.select(0x4000),
            b"C256" => self.select(0x8000),
            b"C512" => self.select(0x10000),
            b"READ" => {
                let image = self.firmware.image.clone();
                self.queue(OK_LINE);
                self.queue(b"$#@!READ\r\n");
                self.queue(&image);
            }
            b"VINF" => {
                let voltage = self.firmware.voltage.clone();
                self.queue(OK_LINE);
                self.queue(b"$#@!VINF");
                self.queue(&voltage);
            }
            b"WRIT" => {
                self.queue(OK_LINE);
                match self.firmware.reject_write {
                    Some(message) => self.queue(format!("$#@!ERR {}\r\n", message).as_bytes()),
                    None => {
                        self.queue(b"$#@!WRIT\r\n");
                        self.request(0);
                    }
                }
            }
            other => panic!("unknown command {:?}", String::from_utf8_lossy(other)),
        }
    }

    fn select(&mut self, size: usize) {
        self.chip_size = size;
        if self.firmware.answer_select {
            self.queue(OK_LINE);
        }
    }

    fn request(&mut self, offset: usize) {
        let shown = match self.firmware.desync_at {
            Some(at) if at == offset => offset + BLOCK_SIZE,
            _ => offset,
        };
        self.queue(format!("$#@!BLCK{}\r\n", shown).as_bytes());
        self.next_block = Some(offset);
    }

    fn on_block(&mut self, offset: usize) {
        if self.firmware.error_at == Some(offset) {
            self.next_block = None;
            self.queue(b"$#@!ERR Write failed\r\n");
            return;
        }
        if !self.firmware.ack_blocks {
            return;
        }

        self.queue(OK_LINE);
        let next = offset + BLOCK_SIZE;
        if next < self.chip_size {
            self.request(next);
        } else {
            self.next_block = None;
        }
    }
}

impl Read<u8> for MockPort {
    type Error = LinkDown;

    fn read(&mut self) -> nb::Result<u8, LinkDown> {
        if self.firmware.burst.is_some() {
            if self.budget == 0 {
                return Err(nb::Error::WouldBlock);
            }
            self.budget -= 1;
        }

        self.rx.pop_front().ok_or(nb::Error::WouldBlock)
    }
}

impl Write<u8> for MockPort {
    type Error = LinkDown;

    fn write(&mut self, word: u8) -> nb::Result<(), LinkDown> {
        self.on_byte(word);
        Ok(())
    }

    fn flush(&mut self) -> nb::Result<(), LinkDown> {
        Ok(())
    }
}

impl Transport<LinkDown> for MockPort {
    fn wait_for_data(&mut self, timeout_ms: u32) -> Result<bool, LinkDown> {
        self.waits.push(timeout_ms);
        if let Some(burst) = self.firmware.burst {
            self.budget = burst;
        }
        Ok(!self.rx.is_empty())
    }

    fn set_dtr(&mut self, level: bool) -> Result<(), LinkDown> {
        let released = self.dtr.last() == Some(&true) && !level;
        self.dtr.push(level);

        if released && self.firmware.banner_on_reset {
            self.queue(b"\r\n");
            self.queue(PROGRAMMER_NAME);
            self.queue(b"\r\n");
        }
        Ok(())
    }
}

pub type MockProgrammer = Programmer<MockPort, NoDelay, LinkDown>;

pub fn programmer(firmware: Firmware) -> MockProgrammer {
    Programmer::new(MockPort::new(firmware), NoDelay, Options::default())
}

/// Recognisable image of `len` bytes
pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 + i / 256) as u8).collect()
}
