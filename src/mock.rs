//! Simulated hardware for tests: a loopback port, an AN3155 device, recording pins.

use std::collections::{BTreeMap, VecDeque};
use std::io::ErrorKind as IoErrorKind;
use std::sync::{Arc, Mutex};

use embedded_hal::blocking::delay::DelayMs;
use embedded_hal::serial::{Read, Write};

use crate::protocol::{checksum, Command, EXTENDED_ERASE, UART_ACK, UART_NACK, UART_SYNC};
use crate::{ControlPin, Error, Hardware};

#[derive(Default)]
struct LoopbackState {
    queue: VecDeque<u8>,
    read_error: Option<IoErrorKind>,
    write_budget: Option<usize>,
}

/// Port that echoes every written byte back to the reader
#[derive(Clone, Default)]
pub struct Loopback {
    inner: Arc<Mutex<LoopbackState>>,
}

impl Loopback {
    pub fn disconnect(&self) {
        self.fail_reads(IoErrorKind::BrokenPipe);
    }

    /// Every following read fails with `kind`
    pub fn fail_reads(&self, kind: IoErrorKind) {
        self.inner.lock().unwrap().read_error = Some(kind);
    }

    /// Accept `n` more bytes, then fail every write
    pub fn fail_writes_after(&self, n: usize) {
        self.inner.lock().unwrap().write_budget = Some(n);
    }
}

impl Write<u8> for Loopback {
    type Error = IoErrorKind;

    fn write(&mut self, word: u8) -> nb::Result<(), Self::Error> {
        let mut inner = self.inner.lock().unwrap();
        match inner.write_budget {
            Some(0) => return Err(nb::Error::Other(IoErrorKind::Other)),
            Some(n) => inner.write_budget = Some(n - 1),
            None => (),
        }
        inner.queue.push_back(word);
        Ok(())
    }

    fn flush(&mut self) -> nb::Result<(), Self::Error> {
        Ok(())
    }
}

impl Read<u8> for Loopback {
    type Error = IoErrorKind;

    fn read(&mut self) -> nb::Result<u8, Self::Error> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(kind) = inner.read_error {
            return Err(nb::Error::Other(kind));
        }
        inner.queue.pop_front().ok_or(nb::Error::WouldBlock)
    }
}

/// Completed exchange as seen by the simulated device
#[derive(Clone, PartialEq, Debug)]
pub enum Exchange {
    Sync,
    Get,
    GetVersion,
    GetId,
    Erase(Vec<u8>),
    Write { address: u32, data: Vec<u8> },
    Read { address: u32, len: usize },
    Go(u32),
    WriteUnprotect,
}

/// How the device answers a command
#[derive(Copy, Clone, PartialEq, Debug)]
pub enum Fault {
    /// NACK the command itself
    Nack,
    /// Reply with a byte that is neither ACK nor NACK
    Garble,
    /// Never reply
    Mute,
}

#[derive(Debug)]
enum Phase {
    Idle,
    Complement(u8),
    EraseArgs { extended: bool, buff: Vec<u8> },
    Address(Command, Vec<u8>),
    WriteData { address: u32, buff: Vec<u8> },
    ReadLength { address: u32, buff: Vec<u8> },
}

#[derive(Debug)]
pub struct DeviceState {
    pub version: u8,
    pub opcodes: Vec<u8>,
    pub id: Vec<u8>,
    pub faults: BTreeMap<Command, Fault>,
    pub memory: BTreeMap<u32, u8>,
    pub log: Vec<Exchange>,
    pub disconnected: bool,
    phase: Phase,
    outbox: VecDeque<u8>,
}

impl DeviceState {
    fn reply(&mut self, data: &[u8]) {
        self.outbox.extend(data.iter());
    }

    fn command(&self, code: u8) -> Option<Command> {
        self.opcodes
            .iter()
            .position(|&c| c == code)
            .and_then(|i| Command::DISCOVERABLE.get(i).copied())
    }

    fn feed(&mut self, b: u8) {
        let phase = std::mem::replace(&mut self.phase, Phase::Idle);

        self.phase = match phase {
            Phase::Idle if b == UART_SYNC => {
                self.log.push(Exchange::Sync);
                self.reply(&[UART_ACK]);
                Phase::Idle
            }
            Phase::Idle => Phase::Complement(b),
            Phase::Complement(code) => self.start(code, b),
            Phase::EraseArgs { extended, mut buff } => {
                buff.push(b);
                let expected = if extended { 3 } else { 2 };
                if buff.len() < expected {
                    Phase::EraseArgs { extended, buff }
                } else {
                    self.log.push(Exchange::Erase(buff));
                    self.reply(&[UART_ACK]);
                    Phase::Idle
                }
            }
            Phase::Address(command, mut buff) => {
                buff.push(b);
                if buff.len() < 5 {
                    Phase::Address(command, buff)
                } else if checksum(&buff[..4]) != buff[4] {
                    self.reply(&[UART_NACK]);
                    Phase::Idle
                } else {
                    let address = u32::from_be_bytes([buff[0], buff[1], buff[2], buff[3]]);
                    self.reply(&[UART_ACK]);

                    match command {
                        Command::WriteMemory => Phase::WriteData {
                            address,
                            buff: vec![],
                        },
                        Command::ReadMemory => Phase::ReadLength {
                            address,
                            buff: vec![],
                        },
                        _ => {
                            self.log.push(Exchange::Go(address));
                            Phase::Idle
                        }
                    }
                }
            }
            Phase::WriteData { address, mut buff } => {
                buff.push(b);
                if buff.len() < buff[0] as usize + 3 {
                    Phase::WriteData { address, buff }
                } else if checksum(&buff[..buff.len() - 1]) != buff[buff.len() - 1] {
                    self.reply(&[UART_NACK]);
                    Phase::Idle
                } else {
                    let data = buff[1..buff.len() - 1].to_vec();
                    for (i, d) in data.iter().enumerate() {
                        self.memory.insert(address + i as u32, *d);
                    }
                    self.log.push(Exchange::Write { address, data });
                    self.reply(&[UART_ACK]);
                    Phase::Idle
                }
            }
            Phase::ReadLength { address, mut buff } => {
                buff.push(b);
                if buff.len() < 2 {
                    Phase::ReadLength { address, buff }
                } else if buff[1] != buff[0] ^ 0xFF {
                    self.reply(&[UART_NACK]);
                    Phase::Idle
                } else {
                    let len = buff[0] as usize + 1;
                    let data = (0..len as u32)
                        .map(|i| *self.memory.get(&(address + i)).unwrap_or(&0xFF))
                        .collect::<Vec<_>>();
                    self.reply(&[UART_ACK]);
                    self.reply(&data);
                    self.log.push(Exchange::Read { address, len });
                    Phase::Idle
                }
            }
        };
    }

    fn start(&mut self, code: u8, complement: u8) -> Phase {
        let command = match self.command(code) {
            Some(c) if complement == code ^ 0xFF => c,
            _ => {
                self.reply(&[UART_NACK]);
                return Phase::Idle;
            }
        };

        match self.faults.get(&command).copied() {
            Some(Fault::Nack) => {
                self.reply(&[UART_NACK]);
                return Phase::Idle;
            }
            Some(Fault::Garble) => {
                self.reply(&[0x00]);
                return Phase::Idle;
            }
            Some(Fault::Mute) => return Phase::Idle,
            None => self.reply(&[UART_ACK]),
        }

        match command {
            Command::Get => {
                self.log.push(Exchange::Get);
                let mut resp = vec![self.opcodes.len() as u8, self.version];
                resp.extend_from_slice(&self.opcodes);
                resp.push(UART_ACK);
                self.reply(&resp);
                Phase::Idle
            }
            Command::GetVersion => {
                self.log.push(Exchange::GetVersion);
                let resp = [self.version, 0x00, 0x00, UART_ACK];
                self.reply(&resp);
                Phase::Idle
            }
            Command::GetId => {
                self.log.push(Exchange::GetId);
                let mut resp = vec![(self.id.len() - 1) as u8];
                resp.extend_from_slice(&self.id);
                resp.push(UART_ACK);
                self.reply(&resp);
                Phase::Idle
            }
            Command::Erase => Phase::EraseArgs {
                extended: code == EXTENDED_ERASE,
                buff: vec![],
            },
            Command::WriteMemory | Command::ReadMemory | Command::Go => {
                Phase::Address(command, vec![])
            }
            Command::WriteUnprotect => {
                self.log.push(Exchange::WriteUnprotect);
                self.reply(&[UART_ACK]);
                Phase::Idle
            }
            _ => Phase::Idle,
        }
    }
}

/// Simulated STM32 bootloader, clones share the same device
#[derive(Clone)]
pub struct Device {
    state: Arc<Mutex<DeviceState>>,
}

impl Default for Device {
    fn default() -> Self {
        let opcodes = Command::DISCOVERABLE
            .iter()
            .filter_map(|c| c.default_opcode())
            .collect();

        Self::new(0x31, opcodes, vec![0x04, 0x13])
    }
}

impl Device {
    pub fn new(version: u8, opcodes: Vec<u8>, id: Vec<u8>) -> Self {
        let state = DeviceState {
            version,
            opcodes,
            id,
            faults: BTreeMap::new(),
            memory: BTreeMap::new(),
            log: vec![],
            disconnected: false,
            phase: Phase::Idle,
            outbox: VecDeque::new(),
        };

        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    pub fn fault(&self, command: Command, fault: Fault) -> &Self {
        self.state.lock().unwrap().faults.insert(command, fault);
        self
    }

    pub fn log(&self) -> Vec<Exchange> {
        self.state.lock().unwrap().log.clone()
    }

    /// Exchanges other than the sync and discovery performed on every open
    pub fn operations(&self) -> Vec<Exchange> {
        self.log()
            .into_iter()
            .filter(|e| !matches!(e, Exchange::Sync | Exchange::Get))
            .collect()
    }

    pub fn writes(&self) -> Vec<(u32, usize)> {
        self.log()
            .into_iter()
            .filter_map(|e| match e {
                Exchange::Write { address, data } => Some((address, data.len())),
                _ => None,
            })
            .collect()
    }

    pub fn memory(&self, address: u32, len: usize) -> Vec<u8> {
        let state = self.state.lock().unwrap();
        (0..len as u32)
            .map(|i| *state.memory.get(&(address + i)).unwrap_or(&0xFF))
            .collect()
    }

    pub fn port(&self) -> DevicePort {
        DevicePort {
            state: self.state.clone(),
        }
    }

    pub fn disconnect(&self) {
        self.state.lock().unwrap().disconnected = true;
    }

    /// Push raw bytes to the host as if sent by the device
    pub fn inject(&self, data: &[u8]) {
        self.state.lock().unwrap().reply(data);
    }
}

/// Host side of the link to a simulated device
pub struct DevicePort {
    state: Arc<Mutex<DeviceState>>,
}

impl Write<u8> for DevicePort {
    type Error = IoErrorKind;

    fn write(&mut self, word: u8) -> nb::Result<(), Self::Error> {
        self.state.lock().unwrap().feed(word);
        Ok(())
    }

    fn flush(&mut self) -> nb::Result<(), Self::Error> {
        Ok(())
    }
}

impl Read<u8> for DevicePort {
    type Error = IoErrorKind;

    fn read(&mut self) -> nb::Result<u8, Self::Error> {
        let mut state = self.state.lock().unwrap();
        if state.disconnected {
            return Err(nb::Error::Other(IoErrorKind::BrokenPipe));
        }
        state.outbox.pop_front().ok_or(nb::Error::WouldBlock)
    }
}

/// Level changes and releases seen on the mock GPIO lines
#[derive(Copy, Clone, PartialEq, Debug)]
pub enum PinEvent {
    Claim(u32, bool),
    Set(u32, bool),
    Release(u32),
    Delay(u32),
}

pub type Trace = Arc<Mutex<Vec<PinEvent>>>;

pub struct MockPin {
    line: u32,
    trace: Trace,
}

impl MockPin {
    pub fn new(line: u32, trace: Trace) -> Self {
        Self { line, trace }
    }
}

impl ControlPin for MockPin {
    fn set(&mut self, high: bool) -> Result<(), Error> {
        self.trace.lock().unwrap().push(PinEvent::Set(self.line, high));
        Ok(())
    }

    fn release(&mut self) -> Result<(), Error> {
        self.trace.lock().unwrap().push(PinEvent::Release(self.line));
        Ok(())
    }
}

pub struct MockDelay {
    trace: Trace,
}

impl MockDelay {
    pub fn new(trace: Trace) -> Self {
        Self { trace }
    }
}

impl DelayMs<u32> for MockDelay {
    fn delay_ms(&mut self, ms: u32) {
        self.trace.lock().unwrap().push(PinEvent::Delay(ms));
    }
}

/// Hardware backend wired to a simulated device
pub struct MockHardware {
    pub device: Device,
    pub trace: Trace,
    pub opened: usize,
    pub fail_open: bool,
    pub fail_claim: Option<u32>,
    delay: MockDelay,
}

impl MockHardware {
    pub fn new(device: Device) -> Self {
        let trace = Trace::default();
        Self {
            device,
            delay: MockDelay::new(trace.clone()),
            trace,
            opened: 0,
            fail_open: false,
            fail_claim: None,
        }
    }

    pub fn events(&self) -> Vec<PinEvent> {
        self.trace.lock().unwrap().clone()
    }
}

impl Hardware for MockHardware {
    type Port = DevicePort;
    type Pin = MockPin;
    type Delay = MockDelay;

    fn open_port(&mut self, tty: &str, _baud: u32) -> Result<Self::Port, Error> {
        if self.fail_open {
            return Err(Error::Open(format!("{}: no such device", tty)));
        }
        self.opened += 1;
        Ok(self.device.port())
    }

    fn claim_pin(&mut self, line: u32, high: bool) -> Result<Self::Pin, Error> {
        if self.fail_claim == Some(line) {
            return Err(Error::Gpio(format!("line {}: busy", line)));
        }
        self.trace.lock().unwrap().push(PinEvent::Claim(line, high));
        Ok(MockPin::new(line, self.trace.clone()))
    }

    fn delay(&mut self) -> &mut Self::Delay {
        &mut self.delay
    }
}
