#[macro_use]
extern crate log;

extern crate structopt;
use structopt::StructOpt;

extern crate simplelog;
use simplelog::{Config, LevelFilter, SimpleLogger};

use std::io::ErrorKind as IoErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use indicatif::{ProgressBar, ProgressStyle};
use linux_embedded_hal::Delay;

use eprom_programmer::linux::SerialTransport;
use eprom_programmer::protocol::{ChipProfile, BAUD_RATE, BLOCK_SIZE};
use eprom_programmer::verify::{blank_check, verify};
use eprom_programmer::{Options, Programmer};

type LinuxProgrammer = Programmer<SerialTransport, Delay, IoErrorKind>;

#[derive(Clone, Debug, StructOpt)]
pub struct Args {
    /// Serial port to connect to
    #[structopt(long, default_value = "/dev/ttyUSB0")]
    port: String,

    /// Serial port baud rate
    #[structopt(long, default_value = "115200")]
    baud: usize,

    /// Chip type (none, c16, c32, c64, c128, c256, c512)
    #[structopt(long, default_value = "none")]
    chip: ChipProfile,

    #[structopt(flatten)]
    options: Options,

    /// Log level for console output
    #[structopt(long, default_value = "info")]
    log_level: LevelFilter,

    #[structopt(subcommand)]
    action: Action,
}

#[derive(Clone, Debug, StructOpt)]
pub enum Action {
    /// Print the programming voltage
    Voltage,

    /// Read the chip, to a file or as a hex dump
    Read {
        /// File to save the image to
        #[structopt(long, parse(from_os_str))]
        output: Option<PathBuf>,
    },

    /// Program the chip from an image of exactly the chip size
    Write {
        #[structopt(parse(from_os_str))]
        input: PathBuf,

        /// Read the chip back and compare once written
        #[structopt(long)]
        verify: bool,
    },

    /// Compare the chip contents against an image
    Verify {
        #[structopt(parse(from_os_str))]
        input: PathBuf,
    },

    /// Check the chip is erased
    BlankCheck,
}

fn main() {
    // Parse out arguments
    let o = Args::from_args();

    // Configure logger
    let _ = SimpleLogger::init(o.log_level, Config::default());

    if o.baud != BAUD_RATE {
        warn!("Programmer firmware expects {} baud", BAUD_RATE);
    }

    info!("Connecting to serial port");

    let mut p = match Programmer::linux(&o.port, o.baud, o.options.clone()) {
        Ok(p) => p,
        Err(e) => {
            error!("Error connecting to serial port: {:?}", e);
            std::process::exit(1);
        }
    };

    info!("Connecting to programmer");

    if let Err(e) = p.connect() {
        error!("Error connecting to programmer: {}", e);
        std::process::exit(1);
    }

    if let Err(e) = run(&mut p, &o) {
        error!("{:#}", e);
        std::process::exit(1);
    }
}

fn run(p: &mut LinuxProgrammer, o: &Args) -> anyhow::Result<()> {
    if o.chip != ChipProfile::None {
        p.select_chip(o.chip)?;
        info!(
            "Selected {} ({})",
            o.chip,
            bytefmt::format(p.chip_buffer_size() as u64)
        );
    }

    match &o.action {
        Action::Voltage => {
            let cv = p.read_voltage()?;
            println!("{}.{:02} V", cv / 100, cv % 100);
        }
        Action::Read { output } => {
            let image = read_image(p)?;

            match output {
                Some(path) => {
                    std::fs::write(path, &image)
                        .with_context(|| format!("writing {}", path.display()))?;
                    info!("Saved {} to {}", bytefmt::format(image.len() as u64), path.display());
                }
                None => print_hex(&image),
            }
        }
        Action::Write { input, verify } => {
            let image = load_image(input)?;
            write_image(p, &image)?;

            if *verify {
                check_image(p, &image)?;
            }
        }
        Action::Verify { input } => {
            let image = load_image(input)?;
            check_image(p, &image)?;
        }
        Action::BlankCheck => {
            let image = read_image(p)?;

            match blank_check(&image) {
                None => println!("Chip clear."),
                Some(offset) => println!("Chip not clear, first programmed byte at {:#06x}.", offset),
            }
        }
    }

    Ok(())
}

fn progress_bar(len: usize, action: &str) -> ProgressBar {
    let pb = ProgressBar::new(len as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} {msg}")
            .progress_chars("#>-"),
    );
    pb.set_message(action);
    pb
}

fn load_image(path: &Path) -> anyhow::Result<Vec<u8>> {
    let image = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    info!("Loaded {} from {}", bytefmt::format(image.len() as u64), path.display());
    Ok(image)
}

fn read_image(p: &mut LinuxProgrammer) -> anyhow::Result<Vec<u8>> {
    if p.chip_profile() == ChipProfile::None {
        bail!("no chip selected, pass --chip");
    }

    let pb = progress_bar(p.chip_buffer_size(), "Reading");
    let image = p.read_chip(|n| pb.set_position(n as u64))?.to_vec();
    pb.finish_and_clear();

    info!("Read {}", bytefmt::format(image.len() as u64));
    Ok(image)
}

fn write_image(p: &mut LinuxProgrammer, image: &[u8]) -> anyhow::Result<()> {
    if p.chip_profile() == ChipProfile::None {
        bail!("no chip selected, pass --chip");
    }

    let pb = progress_bar(p.chip_buffer_size(), "Writing");
    p.write_chip(image, |offset| pb.set_position((offset + BLOCK_SIZE) as u64))?;
    pb.finish_and_clear();

    info!("Wrote {}", bytefmt::format(image.len() as u64));
    Ok(())
}

fn check_image(p: &mut LinuxProgrammer, image: &[u8]) -> anyhow::Result<()> {
    let read = read_image(p)?;
    let report = verify(image, &read);

    if report.is_ok() {
        println!("Verification successful.");
        return Ok(());
    }

    println!("Verification failed.");
    println!("Errors: {}.", report.unwritable);
    println!("Warnings: {}.", report.writable);
    if let Some(offset) = report.first_unwritable {
        println!("First unwritable byte at {:#06x}, chip needs erasing.", offset);
    }
    if let Some(offset) = report.first_writable {
        println!("First writable difference at {:#06x}.", offset);
    }

    bail!("chip contents differ from {} byte image", image.len())
}

fn print_hex(image: &[u8]) {
    for (row, chunk) in image.chunks(16).enumerate() {
        let text: String = chunk
            .iter()
            .map(|b| if b.is_ascii_graphic() || *b == b' ' { *b as char } else { '.' })
            .collect();

        println!("{:06x}  {:<32}  {}", row * 16, hex::encode(chunk), text);
    }
}
