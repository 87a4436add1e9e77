#[macro_use]
extern crate log;

use std::convert::TryInto;
use std::path::PathBuf;

use anyhow::{anyhow, Context};
use indicatif::{ProgressBar, ProgressStyle};
use simplelog::{Config as LogConfig, LevelFilter, SimpleLogger};
use structopt::StructOpt;

use stm32_uart_flasher::{Config, Session};

#[derive(Clone, Debug, StructOpt)]
pub struct Args {
    #[structopt(subcommand)]
    operation: Operation,

    #[structopt(flatten)]
    config: Config,

    /// Log level for console output
    #[structopt(long, default_value = "info")]
    log_level: LevelFilter,
}

#[derive(Clone, Debug, StructOpt)]
pub enum Operation {
    /// Erase the device and write a binary image
    Flash {
        /// Binary image to write
        file: PathBuf,

        /// Address to write the image at
        #[structopt(long, default_value = "0x08000000", parse(try_from_str = parse_address))]
        address: u32,
    },
    /// Print the device identity
    Identify,
    /// Power cycle the device into its application
    Reset,
    /// Read and print device memory
    Read {
        #[structopt(long, parse(try_from_str = parse_address))]
        address: u32,

        #[structopt(long, default_value = "16")]
        length: usize,
    },
}

fn parse_address(s: &str) -> Result<u32, std::num::ParseIntError> {
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => s.parse(),
    }
}

/// Split a read into bootloader sized chunks, rejecting ranges that leave the address space
fn read_chunks(address: u32, length: usize) -> anyhow::Result<Vec<(u32, usize)>> {
    let last = match length.checked_sub(1) {
        Some(n) => n,
        None => return Ok(vec![]),
    };

    last.try_into()
        .ok()
        .and_then(|n: u32| address.checked_add(n))
        .ok_or_else(|| anyhow!("{} bytes at 0x{:08x} runs past 0xffffffff", length, address))?;

    let chunks = (0..length)
        .step_by(256)
        .map(|offset| (address + offset as u32, (length - offset).min(256)))
        .collect();

    Ok(chunks)
}

fn main() -> anyhow::Result<()> {
    // Parse out arguments
    let o = Args::from_args();

    // Configure logger
    let _ = SimpleLogger::init(o.log_level, LogConfig::default());

    let mut s = Session::linux(o.config);

    info!("Using {} at {} baud", s.tty(), s.baud_rate());

    match o.operation {
        Operation::Flash { file, address } => {
            let data = std::fs::read(&file)
                .with_context(|| format!("reading {}", file.display()))?;

            info!(
                "Flashing {} ({}) at 0x{:08x}",
                file.display(),
                bytefmt::format(data.len() as u64),
                address
            );

            let pb = ProgressBar::new(data.len() as u64);
            pb.set_style(
                ProgressStyle::default_bar()
                    .template("{spinner} [{elapsed_precise}] [{bar:40}] {bytes}/{total_bytes}")
                    .progress_chars("=> "),
            );

            s.flash_with_progress(&data, address, |p| pb.set_position(p.bytes_complete as u64))?;

            pb.finish_with_message("done");
            info!("Flash complete");
        }
        Operation::Identify => {
            let id = s.identify()?;
            println!("{}", id);
        }
        Operation::Reset => {
            s.reset()?;
            info!("Device reset");
        }
        Operation::Read { address, length } => {
            let chunks = read_chunks(address, length)?;

            s.open()?;

            for (addr, n) in chunks {
                let data = s.read_memory(addr, n)?;

                for (i, line) in data.chunks(16).enumerate() {
                    println!("{:08x}: {}", addr as usize + i * 16, hex::encode(line));
                }
            }

            s.close();
        }
    }

    Ok(())
}
