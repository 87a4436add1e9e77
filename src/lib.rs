//! STM32 Serial Bootloader flashing.
//!
//! Base on AN3155, with the target's power and BOOT pins driven over GPIO so the
//! bootloader can be entered (and left) without a human pressing buttons.

use std::io::ErrorKind as IoErrorKind;
use std::path::PathBuf;

#[macro_use]
extern crate log;

use embedded_hal::serial::{Read, Write};

pub mod protocol;
pub use protocol::{Command, OpcodeTable};

pub mod config;
pub use config::Config;

pub mod transport;
pub mod sequencer;
pub mod bootloader;

pub mod flash;
pub use flash::Progress;

pub mod session;
pub use session::Session;

#[cfg(feature = "linux")]
pub mod linux;

#[cfg(test)]
mod mock;

/// Serial port usable by the background receiver
///
/// Reads are expected to return `WouldBlock` after a short poll period when no data
/// is available.
pub trait SerialPort: Write<u8, Error = IoErrorKind> + Read<u8, Error = IoErrorKind> + Send + 'static {}

impl<T> SerialPort for T where
    T: Write<u8, Error = IoErrorKind> + Read<u8, Error = IoErrorKind> + Send + 'static
{
}

/// Output line wired to one of the target's power or boot select pins
pub trait ControlPin {
    /// Drive the line high (`true`) or low (`false`)
    fn set(&mut self, high: bool) -> Result<(), Error>;

    /// Hand the line back to the system
    fn release(&mut self) -> Result<(), Error>;
}

/// Source of the ports, pins and delays a [`Session`] needs
pub trait Hardware {
    type Port: SerialPort;
    type Pin: ControlPin;
    type Delay: embedded_hal::blocking::delay::DelayMs<u32>;

    /// Open and configure (8E1 at `baud`) the serial device at `tty`
    fn open_port(&mut self, tty: &str, baud: u32) -> Result<Self::Port, Error>;

    /// Claim a GPIO line as an output at the provided initial level
    fn claim_pin(&mut self, line: u32, high: bool) -> Result<Self::Pin, Error>;

    fn delay(&mut self) -> &mut Self::Delay;
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("serial link is closed")]
    Closed,

    #[error("timed out waiting for bootloader response")]
    ResponseTimeout,

    #[error("bootloader responded with nack")]
    Nack,

    #[error("expected ack or nack, received 0x{0:02x}")]
    InvalidResponse(u8),

    #[error("serial io error: {0:?}")]
    Io(IoErrorKind),

    #[error("could not open serial port: {0}")]
    Open(String),

    #[error("gpio error: {0}")]
    Gpio(String),

    #[error("no opcode known for command {0:?}")]
    UnknownCommand(Command),

    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("could not read {}: {source}", .path.display())]
    File {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("could not {context}: {inner}")]
    Context { context: String, inner: Box<Error> },

    #[error("could not write segment {index}: {inner}")]
    Segment { index: usize, inner: Box<Error> },
}

impl Error {
    /// Wrap this error with the name of the step that failed
    pub fn context<C: Into<String>>(self, context: C) -> Self {
        Error::Context {
            context: context.into(),
            inner: Box::new(self),
        }
    }

    /// The underlying error with any step context removed
    pub fn root(&self) -> &Error {
        match self {
            Error::Context { inner, .. } | Error::Segment { inner, .. } => inner.root(),
            other => other,
        }
    }
}

impl From<IoErrorKind> for Error {
    fn from(e: IoErrorKind) -> Self {
        Self::Io(e)
    }
}
