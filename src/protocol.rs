//! AN3155 wire constants, commands and frame encoding.

use std::collections::BTreeMap;

use crate::Error;

/// Synchronisation byte sent to start the bootloader autobaud
pub const UART_SYNC: u8 = 0x7F;

pub const UART_ACK: u8 = 0x79;
pub const UART_NACK: u8 = 0x1F;

/// Maximum number of bytes moved by a single read or write memory exchange
pub const MAX_CHUNK: usize = 256;

/// Opcode used by bootloaders that replace Erase with Extended Erase
pub const EXTENDED_ERASE: u8 = 0x44;

/// Erase argument selecting a global (mass) erase
pub const MASS_ERASE: [u8; 2] = [0xFF, 0x00];

/// Extended erase argument selecting a mass erase (0xFFFF followed by its checksum)
pub const EXTENDED_MASS_ERASE: [u8; 3] = [0xFF, 0xFF, 0x00];

#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub enum Command {
    /// Autobaud synchronisation, not a real command and never reported by Get
    Sync,

    /// Fetch bootloader version and allowed commands
    Get,

    /// Gets the bootloader version and the Read Protection status of the Flash memory.
    GetVersion,

    /// Gets the chip ID
    GetId,

    /// Reads up to 256 bytes of memory starting from an address specified by the application.
    ReadMemory,

    /// Jumps to user application code located in the internal Flash memory or in the SRAM.
    Go,

    /// Writes up to 256 bytes to the RAM or Flash memory starting from an address specified by the application.
    WriteMemory,

    /// Erases from one to all the Flash memory pages.
    Erase,

    /// Enables the write protection for some sectors.
    WriteProtect,

    /// Disables the write protection for all Flash memory sectors
    WriteUnprotect,

    /// Enables the read protection
    ReadoutProtect,

    /// Disables the read protection.
    ReadoutUnprotect,
}

impl Command {
    /// Commands in the order their opcodes appear in a Get response
    pub const DISCOVERABLE: [Command; 11] = [
        Command::Get,
        Command::GetVersion,
        Command::GetId,
        Command::ReadMemory,
        Command::Go,
        Command::WriteMemory,
        Command::Erase,
        Command::WriteProtect,
        Command::WriteUnprotect,
        Command::ReadoutProtect,
        Command::ReadoutUnprotect,
    ];

    /// Opcode used when the device has not told us otherwise
    pub fn default_opcode(self) -> Option<u8> {
        use Command::*;

        match self {
            Sync => None,
            Get => Some(0x00),
            GetVersion => Some(0x01),
            GetId => Some(0x02),
            ReadMemory => Some(0x11),
            Go => Some(0x21),
            WriteMemory => Some(0x31),
            Erase => Some(0x43),
            WriteProtect => Some(0x63),
            WriteUnprotect => Some(0x73),
            ReadoutProtect => Some(0x82),
            ReadoutUnprotect => Some(0x92),
        }
    }
}

/// Opcodes reported by the connected device, layered over the defaults
#[derive(Clone, PartialEq, Debug, Default)]
pub struct OpcodeTable {
    discovered: BTreeMap<Command, u8>,
}

impl OpcodeTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Learn opcodes from the body of a Get response (everything after the version byte).
    ///
    /// Opcodes beyond the known command set are ignored, and commands the device did
    /// not report keep resolving to their defaults. An entry that is already known is
    /// never replaced.
    pub fn learn(&mut self, opcodes: &[u8]) {
        if opcodes.len() > Command::DISCOVERABLE.len() {
            debug!(
                "Ignoring {} opcodes beyond the known command set: {:02x?}",
                opcodes.len() - Command::DISCOVERABLE.len(),
                &opcodes[Command::DISCOVERABLE.len()..]
            );
        }

        for (command, &code) in Command::DISCOVERABLE.iter().zip(opcodes) {
            match self.discovered.get(command) {
                Some(&known) if known != code => {
                    warn!(
                        "Device reported opcode 0x{:02x} for {:?}, keeping 0x{:02x}",
                        code, command, known
                    );
                }
                Some(_) => (),
                None => {
                    self.discovered.insert(*command, code);
                }
            }
        }
    }

    /// Opcode discovered for a command, if any
    pub fn discovered(&self, command: Command) -> Option<u8> {
        self.discovered.get(&command).copied()
    }

    /// Resolve the wire opcode for a command, preferring the discovered value
    pub fn resolve(&self, command: Command) -> Result<u8, Error> {
        self.discovered(command)
            .or_else(|| command.default_opcode())
            .ok_or(Error::UnknownCommand(command))
    }

    /// Encode the bytes that introduce a command on the wire
    pub fn frame(&self, command: Command) -> Result<Vec<u8>, Error> {
        if command == Command::Sync {
            return Ok(vec![UART_SYNC]);
        }

        let code = self.resolve(command)?;
        Ok(command_frame(code).to_vec())
    }

    pub fn is_empty(&self) -> bool {
        self.discovered.is_empty()
    }
}

/// XOR checksum as appended to address and data frames
pub fn checksum(data: &[u8]) -> u8 {
    data.iter().fold(0x00, |acc, b| acc ^ b)
}

/// An opcode followed by its complement
pub fn command_frame(code: u8) -> [u8; 2] {
    [code, code ^ 0xFF]
}

/// Big-endian address followed by its checksum
pub fn address_frame(address: u32) -> [u8; 5] {
    let a = address.to_be_bytes();
    [a[0], a[1], a[2], a[3], checksum(&a)]
}

/// Data block prefixed by `len - 1` and suffixed by the checksum of both
pub fn data_frame(data: &[u8]) -> Result<Vec<u8>, Error> {
    if data.is_empty() || data.len() > MAX_CHUNK {
        return Err(Error::InvalidArgument("data block must be 1 to 256 bytes"));
    }

    let mut frame = Vec::with_capacity(data.len() + 2);
    frame.push((data.len() - 1) as u8);
    frame.extend_from_slice(data);
    frame.push(checksum(&frame));

    Ok(frame)
}

/// Interpret a single handshake byte
pub fn check_ack(value: u8) -> Result<(), Error> {
    match value {
        UART_ACK => Ok(()),
        UART_NACK => Err(Error::Nack),
        other => Err(Error::InvalidResponse(other)),
    }
}
