//! Command exchanges with the bootloader over an open transport.

use std::time::Duration;

use crate::flash::FlashTarget;
use crate::protocol::{
    address_frame, check_ack, command_frame, data_frame, Command, OpcodeTable, EXTENDED_ERASE,
    EXTENDED_MASS_ERASE, MASS_ERASE, MAX_CHUNK,
};
use crate::transport::Transport;
use crate::{Error, SerialPort};

/// One request/response conversation at a time with the bootloader
pub struct Bootloader<'a, P> {
    link: &'a Transport<P>,
    opcodes: &'a mut OpcodeTable,
    timeout: Duration,
}

impl<'a, P: SerialPort> Bootloader<'a, P> {
    pub fn new(link: &'a Transport<P>, opcodes: &'a mut OpcodeTable, timeout: Duration) -> Self {
        Self {
            link,
            opcodes,
            timeout,
        }
    }

    /// Send a command and await its acknowledgement
    pub fn exec(&mut self, command: Command) -> Result<(), Error> {
        let frame = self.opcodes.frame(command)?;
        self.link.write(&[&frame])?;
        self.await_ack()
    }

    fn await_ack(&mut self) -> Result<(), Error> {
        let resp = self.link.read_exact(1, self.timeout)?;
        check_ack(resp[0])
    }

    /// Read a response prefixed by a length byte holding `len - 1`
    fn read_with_length(&mut self) -> Result<Vec<u8>, Error> {
        let n = self.link.read_exact(1, self.timeout)?;
        self.link.read_exact(n[0] as usize + 1, self.timeout)
    }

    /// Synchronise with a freshly started bootloader
    pub fn sync(&mut self) -> Result<(), Error> {
        debug!("Sending sync");
        self.exec(Command::Sync)
    }

    /// Discover the bootloader version and learn the opcodes it supports
    pub fn get(&mut self) -> Result<u8, Error> {
        self.exec(Command::Get)?;

        let resp = self.read_with_length()?;
        self.await_ack()?;

        let (version, opcodes) = (resp[0], &resp[1..]);
        debug!("Bootloader version 0x{:02x}, opcodes: {:02x?}", version, opcodes);

        self.opcodes.learn(opcodes);

        Ok(version)
    }

    /// Bootloader version and the two option bytes
    pub fn get_version(&mut self) -> Result<(u8, [u8; 2]), Error> {
        self.exec(Command::GetVersion)?;

        let resp = self.link.read_exact(3, self.timeout)?;
        self.await_ack()?;

        Ok((resp[0], [resp[1], resp[2]]))
    }

    /// Raw product ID bytes
    pub fn get_id(&mut self) -> Result<Vec<u8>, Error> {
        self.exec(Command::GetId)?;

        let id = self.read_with_length()?;
        self.await_ack()?;

        Ok(id)
    }

    /// Erase all flash memory
    pub fn erase_all(&mut self) -> Result<(), Error> {
        self.exec(Command::Erase)?;

        let args: &[u8] = if self.opcodes.resolve(Command::Erase)? == EXTENDED_ERASE {
            &EXTENDED_MASS_ERASE
        } else {
            &MASS_ERASE
        };
        self.link.write(&[args])?;

        self.await_ack()
    }

    /// Write up to 256 bytes at `address`
    pub fn write_memory(&mut self, address: u32, data: &[u8]) -> Result<(), Error> {
        let frame = data_frame(data)?;

        self.exec(Command::WriteMemory)
            .map_err(|e| e.context("exec write memory"))?;

        self.link
            .write(&[&address_frame(address)])
            .map_err(|e| e.context("write address"))?;
        self.await_ack().map_err(|e| e.context("ack address"))?;

        self.link
            .write(&[&frame])
            .map_err(|e| e.context("write data"))?;
        self.await_ack()
            .map_err(|e| e.context("ack after write data"))
    }

    /// Read `len` (1 to 256) bytes from `address`
    pub fn read_memory(&mut self, address: u32, len: usize) -> Result<Vec<u8>, Error> {
        if len == 0 || len > MAX_CHUNK {
            return Err(Error::InvalidArgument("read length must be 1 to 256 bytes"));
        }

        self.exec(Command::ReadMemory)?;

        self.link.write(&[&address_frame(address)])?;
        self.await_ack()?;

        self.link.write(&[&command_frame((len - 1) as u8)])?;
        self.await_ack()?;

        self.link.read_exact(len, self.timeout)
    }

    /// Jump to the application at `address`
    pub fn go(&mut self, address: u32) -> Result<(), Error> {
        self.exec(Command::Go)?;

        self.link.write(&[&address_frame(address)])?;
        self.await_ack()
    }

    /// Remove write protection from all sectors
    ///
    /// The device resets once protection is removed, so the link is synchronised
    /// again before returning.
    pub fn write_unprotect(&mut self) -> Result<(), Error> {
        self.exec(Command::WriteUnprotect)?;

        // Second ack arrives once the option bytes are updated
        self.await_ack()?;

        self.sync()
    }
}

impl<'a, P: SerialPort> FlashTarget for Bootloader<'a, P> {
    fn write_unprotect(&mut self) -> Result<(), Error> {
        Bootloader::write_unprotect(self)
    }

    fn erase_all(&mut self) -> Result<(), Error> {
        Bootloader::erase_all(self)
    }

    fn write_block(&mut self, address: u32, data: &[u8]) -> Result<(), Error> {
        self.write_memory(address, data)
    }
}
