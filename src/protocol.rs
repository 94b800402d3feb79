//! Wire tokens and chip profiles understood by the programmer firmware.

use core::fmt;
use core::str::FromStr;

/// Prefix of every command sent to the programmer
pub const COMMAND_MAGIC: &[u8; 4] = b"!@#$";

/// Prefix of every response sent by the programmer
pub const RESPONSE_MAGIC: &[u8; 4] = b"$#@!";

/// Response tokens are this long, magic included
pub const MARKER_LEN: usize = 8;

pub const RESPONSE_READ: &[u8; MARKER_LEN] = b"$#@!READ";
pub const RESPONSE_WRITE: &[u8; MARKER_LEN] = b"$#@!WRIT";
pub const RESPONSE_ERROR: &[u8; MARKER_LEN] = b"$#@!ERR ";
pub const RESPONSE_BLOCK_REQUEST: &[u8; MARKER_LEN] = b"$#@!BLCK";
pub const RESPONSE_OK: &[u8; MARKER_LEN] = b"$#@!OK  ";
pub const RESPONSE_VOLTAGE: &[u8; MARKER_LEN] = b"$#@!VINF";

/// Status and header responses the firmware terminates with a line break.
pub const RESPONSE_OK_LINE: &[u8] = b"$#@!OK  \r\n";
pub const RESPONSE_READ_LINE: &[u8] = b"$#@!READ\r\n";
pub const RESPONSE_WRITE_LINE: &[u8] = b"$#@!WRIT\r\n";

/// Banner printed by the firmware after reset
pub const PROGRAMMER_NAME: &[u8] = b"Arduino 27CXXX EEPROM programmer";

/// Bytes written per acknowledged write block
pub const BLOCK_SIZE: usize = 16;

/// Maximum bytes pulled from the transport per notification step
pub const READ_CHUNK: usize = 64;

/// Wait for trailing bytes after a header or error marker
pub const SETTLE_MS: u32 = 100;

/// Per-block turnaround for the 27C16
pub const BLOCK_TURNAROUND_C16_MS: u32 = 320;

/// Per-block turnaround for every other chip
pub const BLOCK_TURNAROUND_MS: u32 = 100;

/// Extra wait granted to a block acknowledge that has not arrived yet
pub const BLOCK_ACK_FALLBACK_MS: u32 = 250;

/// Baud rate the firmware listens at
pub const BAUD_RATE: usize = 115_200;

#[derive(Debug, PartialEq, Clone, Copy)]
pub enum Command {
    /// Deselect any chip
    SelectNone,
    /// Select a 2 KiB 27C16
    SelectC16,
    /// Select a 4 KiB 27C32
    SelectC32,
    /// Select an 8 KiB 27C64
    SelectC64,
    /// Select a 16 KiB 27C128
    SelectC128,
    /// Select a 32 KiB 27C256
    SelectC256,
    /// Select a 64 KiB 27C512
    SelectC512,
    /// Sample the programming voltage
    VoltageInfo,
    /// Stream the whole chip back to the host
    ReadChip,
    /// Program the whole chip in acknowledged blocks
    WriteChip,
}

impl Command {
    /// Tag following the command magic
    pub fn tag(&self) -> &'static [u8; 4] {
        match self {
            Command::SelectNone => b"NONE",
            Command::SelectC16 => b"C16 ",
            Command::SelectC32 => b"C32 ",
            Command::SelectC64 => b"C64 ",
            Command::SelectC128 => b"C128",
            Command::SelectC256 => b"C256",
            Command::SelectC512 => b"C512",
            Command::VoltageInfo => b"VINF",
            Command::ReadChip => b"READ",
            Command::WriteChip => b"WRIT",
        }
    }

    /// Full 8 byte frame as sent on the wire
    pub fn encode(&self) -> [u8; MARKER_LEN] {
        let mut frame = [0u8; MARKER_LEN];
        frame[..4].copy_from_slice(COMMAND_MAGIC);
        frame[4..].copy_from_slice(self.tag());
        frame
    }
}

/// Chip type selected on the programmer
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum ChipProfile {
    None,
    C16,
    C32,
    C64,
    C128,
    C256,
    C512,
}

impl Default for ChipProfile {
    fn default() -> Self {
        ChipProfile::None
    }
}

impl ChipProfile {
    pub const ALL: [ChipProfile; 7] = [
        ChipProfile::None,
        ChipProfile::C16,
        ChipProfile::C32,
        ChipProfile::C64,
        ChipProfile::C128,
        ChipProfile::C256,
        ChipProfile::C512,
    ];

    /// Image size in bytes for this chip
    pub fn buffer_size(&self) -> usize {
        match self {
            ChipProfile::None => 0,
            ChipProfile::C16 => 0x07FF + 1,
            ChipProfile::C32 => 0x0FFF + 1,
            ChipProfile::C64 => 0x1FFF + 1,
            ChipProfile::C128 => 0x3FFF + 1,
            ChipProfile::C256 => 0x7FFF + 1,
            ChipProfile::C512 => 0xFFFF + 1,
        }
    }

    pub fn select_command(&self) -> Command {
        match self {
            ChipProfile::None => Command::SelectNone,
            ChipProfile::C16 => Command::SelectC16,
            ChipProfile::C32 => Command::SelectC32,
            ChipProfile::C64 => Command::SelectC64,
            ChipProfile::C128 => Command::SelectC128,
            ChipProfile::C256 => Command::SelectC256,
            ChipProfile::C512 => Command::SelectC512,
        }
    }

    /// Bounded wait after each written block.
    ///
    /// The 27C16 has a slower program cycle on the reference hardware.
    pub fn block_turnaround_ms(&self) -> u32 {
        match self {
            ChipProfile::C16 => BLOCK_TURNAROUND_C16_MS,
            _ => BLOCK_TURNAROUND_MS,
        }
    }
}

impl fmt::Display for ChipProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChipProfile::None => "none",
            ChipProfile::C16 => "27C16",
            ChipProfile::C32 => "27C32",
            ChipProfile::C64 => "27C64",
            ChipProfile::C128 => "27C128",
            ChipProfile::C256 => "27C256",
            ChipProfile::C512 => "27C512",
        };
        f.write_str(name)
    }
}

#[derive(Debug, PartialEq, Clone)]
pub struct UnknownChip(pub String);

impl fmt::Display for UnknownChip {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown chip '{}', expected one of none, c16, c32, c64, c128, c256, c512", self.0)
    }
}

impl FromStr for ChipProfile {
    type Err = UnknownChip;

    /// Accepts `c16` as well as the full `27c16` part name
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.to_ascii_lowercase();
        let name = lower.strip_prefix("27").unwrap_or(&lower);

        match name {
            "none" => Ok(ChipProfile::None),
            "c16" => Ok(ChipProfile::C16),
            "c32" => Ok(ChipProfile::C32),
            "c64" => Ok(ChipProfile::C64),
            "c128" => Ok(ChipProfile::C128),
            "c256" => Ok(ChipProfile::C256),
            "c512" => Ok(ChipProfile::C512),
            _ => Err(UnknownChip(s.to_string())),
        }
    }
}
