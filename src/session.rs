//! Owner of a single target link.
//!
//! A [`Session`] acquires the GPIO lines and serial port when an operation needs
//! them and gives them back afterwards, unless the caller opened the link
//! explicitly to keep it across several operations.

use std::path::Path;
use std::time::Duration;

use crate::bootloader::Bootloader;
use crate::flash::{self, Progress};
use crate::sequencer::BootPins;
use crate::transport::Transport;
use crate::{Config, Error, Hardware, OpcodeTable};

/// Prefix applied to the hex encoded product ID
pub const IDENTITY_PREFIX: &str = "STM_";

pub struct Session<H: Hardware> {
    config: Config,
    hardware: H,
    pins: Option<BootPins<H::Pin>>,
    transport: Option<Transport<H::Port>>,
    opcodes: OpcodeTable,
    version: Option<u8>,
    identity: Option<String>,
}

impl<H: Hardware> Session<H> {
    /// Create a session, no hardware is touched until the link is needed
    pub fn new(config: Config, hardware: H) -> Self {
        Self {
            config,
            hardware,
            pins: None,
            transport: None,
            opcodes: OpcodeTable::new(),
            version: None,
            identity: None,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Replace the configuration, closing the link and forgetting the previous device
    pub fn reconfigure(&mut self, config: Config) {
        self.close();

        self.config = config;
        self.opcodes = OpcodeTable::new();
        self.version = None;
        self.identity = None;
    }

    pub fn tty(&self) -> &str {
        self.config.tty()
    }

    pub fn baud_rate(&self) -> u32 {
        self.config.baud_rate()
    }

    /// Bootloader version reported by the last discovery
    pub fn bootloader_version(&self) -> Option<u8> {
        self.version
    }

    pub fn opcodes(&self) -> &OpcodeTable {
        &self.opcodes
    }

    pub fn is_open(&self) -> bool {
        self.transport.as_ref().map_or(false, |t| t.is_open())
    }

    /// Put the target in bootloader mode and synchronise with it
    ///
    /// Does nothing if the link is already open.
    pub fn open(&mut self) -> Result<(), Error> {
        if self.is_open() {
            return Ok(());
        }

        self.reap();

        if let Err(e) = self.connect() {
            self.close();
            return Err(e);
        }

        debug!("mcu open");

        Ok(())
    }

    fn connect(&mut self) -> Result<(), Error> {
        self.claim_pins().map_err(|e| e.context("setup pins"))?;

        let port = self
            .hardware
            .open_port(self.config.tty(), self.config.baud_rate())?;
        self.transport = Some(Transport::open(port)?);

        self.init().map_err(|e| e.context("init bootloader"))
    }

    fn init(&mut self) -> Result<(), Error> {
        if let Some(pins) = self.pins.as_mut() {
            pins.enter_bootloader(self.hardware.delay())?;
        }

        let mut bl = self.bootloader()?;
        bl.sync()?;
        let version = bl.get()?;

        self.version = Some(version);

        Ok(())
    }

    /// Return the target to run mode and release the port and GPIO lines
    ///
    /// Teardown failures are logged rather than returned so a later `open` is never
    /// blocked by a partial close.
    pub fn close(&mut self) {
        if self.pins.is_none() {
            if let Err(e) = self.claim_pins() {
                error!("could not claim pins to exit bootloader: {}", e);
            }
        }

        if let Some(pins) = self.pins.as_mut() {
            if let Err(e) = pins.exit_bootloader(self.hardware.delay()) {
                error!("could not exit bootloader: {}", e);
            }
        }

        if let Some(mut transport) = self.transport.take() {
            transport.close();
        }

        if let Some(pins) = self.pins.take() {
            if let Err(e) = pins.release() {
                error!("could not release pins: {}", e);
            }
        }

        debug!("mcu close");
    }

    /// Tear down a link whose receiver has exited, leaving the session fully closed
    fn reap(&mut self) {
        if self.transport.is_some() && !self.is_open() {
            warn!("serial link lost, closing");
            self.close();
        }
    }

    fn claim_pins(&mut self) -> Result<(), Error> {
        if self.pins.is_none() {
            let pins = BootPins::claim(
                &mut self.hardware,
                self.config.power_line(),
                self.config.boot0_line(),
                self.config.boot1_line(),
            )?;
            self.pins = Some(pins);
        }

        Ok(())
    }

    fn bootloader(&mut self) -> Result<Bootloader<'_, H::Port>, Error> {
        let link = self
            .transport
            .as_ref()
            .filter(|t| t.is_open())
            .ok_or(Error::Closed)?;

        Ok(Bootloader::new(
            link,
            &mut self.opcodes,
            self.config.response_timeout(),
        ))
    }

    /// Run `f` with the link open, closing it again only if it was opened here
    fn with_link<T, F>(&mut self, f: F) -> Result<T, Error>
    where
        F: FnOnce(&mut Self) -> Result<T, Error>,
    {
        self.reap();

        let opened = !self.is_open();
        if opened {
            self.open()?;
        }

        let res = f(self);

        if opened {
            self.close();
        }

        res
    }

    /// Write raw buffers to the open link
    pub fn write(&self, buffers: &[&[u8]]) -> Result<(), Error> {
        match &self.transport {
            Some(t) => t.write(buffers),
            None if buffers.is_empty() => {
                Err(Error::InvalidArgument("write requires at least one buffer"))
            }
            None => Err(Error::Closed),
        }
    }

    /// Read exactly `n` raw bytes from the open link
    pub fn read_exact(&self, n: usize, timeout: Duration) -> Result<Vec<u8>, Error> {
        match &self.transport {
            Some(t) => t.read_exact(n, timeout),
            None => Err(Error::Closed),
        }
    }

    /// Erase the target and program `data` at `address`
    pub fn flash(&mut self, data: &[u8], address: u32) -> Result<(), Error> {
        self.flash_with_progress(data, address, |_| ())
    }

    /// As [`Session::flash`], reporting progress after each block
    pub fn flash_with_progress<F>(
        &mut self,
        data: &[u8],
        address: u32,
        progress: F,
    ) -> Result<(), Error>
    where
        F: FnMut(Progress),
    {
        self.with_link(|s| {
            let unprotect = s.config.write_unprotect;
            let mut bl = s.bootloader()?;
            flash::flash(&mut bl, data, address, unprotect, progress)
        })
    }

    /// Program the contents of the file at `path` at `address`
    pub fn flash_from_file<P: AsRef<Path>>(&mut self, path: P, address: u32) -> Result<(), Error> {
        let path = path.as_ref();
        let data = std::fs::read(path).map_err(|source| Error::File {
            path: path.to_path_buf(),
            source,
        })?;

        self.flash(&data, address)
    }

    /// Unique identity string for the target, read once and cached
    pub fn identify(&mut self) -> Result<String, Error> {
        if let Some(id) = &self.identity {
            return Ok(id.clone());
        }

        let id = self.with_link(|s| s.bootloader()?.get_id().map_err(|e| e.context("get id")))?;
        let identity = format!("{}{}", IDENTITY_PREFIX, hex::encode(id));

        self.identity = Some(identity.clone());

        Ok(identity)
    }

    /// Read `len` bytes of target memory starting at `address`
    pub fn read_memory(&mut self, address: u32, len: usize) -> Result<Vec<u8>, Error> {
        self.with_link(|s| s.bootloader()?.read_memory(address, len))
    }

    /// Power cycle the target into its application, whether or not the link is open
    pub fn reset(&mut self) -> Result<(), Error> {
        self.reap();

        let claimed = self.pins.is_none();
        self.claim_pins()?;

        let res = match self.pins.as_mut() {
            Some(pins) => pins.exit_bootloader(self.hardware.delay()),
            None => Ok(()),
        };

        if claimed {
            if let Some(pins) = self.pins.take() {
                pins.release()?;
            }
        }

        res
    }
}

impl<H: Hardware> Drop for Session<H> {
    fn drop(&mut self) {
        if self.pins.is_some() || self.transport.is_some() {
            self.close();
        }
    }
}
