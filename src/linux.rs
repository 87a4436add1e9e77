use std::path::Path;

use embedded_hal::digital::v2::OutputPin;
use linux_embedded_hal::serial_core::{
    BaudRate, CharSize, Error as SerialError, FlowControl, Parity, SerialDevice as _,
    SerialPortSettings as _, StopBits,
};
use linux_embedded_hal::sysfs_gpio::Direction;
use linux_embedded_hal::{Delay, Serial, SysfsPin};

use crate::transport::POLL_INTERVAL;
use crate::{Config, ControlPin, Error, Hardware, Session};

/// Sysfs GPIO lines and a termios serial port
pub struct Linux {
    delay: Delay,
}

impl Default for Linux {
    fn default() -> Self {
        Self { delay: Delay {} }
    }
}

fn gpio_err<E: core::fmt::Debug>(line: u64) -> impl Fn(E) -> Error {
    move |e| Error::Gpio(format!("line {}: {:?}", line, e))
}

impl ControlPin for SysfsPin {
    fn set(&mut self, high: bool) -> Result<(), Error> {
        let res = if high { self.set_high() } else { self.set_low() };
        res.map_err(gpio_err(self.0.get_pin_num()))
    }

    fn release(&mut self) -> Result<(), Error> {
        self.0.unexport().map_err(gpio_err(self.0.get_pin_num()))
    }
}

impl Hardware for Linux {
    type Port = Serial;
    type Pin = SysfsPin;
    type Delay = Delay;

    fn open_port(&mut self, tty: &str, baud: u32) -> Result<Self::Port, Error> {
        let err = |e: SerialError| Error::Open(format!("{}: {}", tty, e));

        // Open port
        let mut port = Serial::open(Path::new(tty)).map_err(err)?;

        // Apply settings
        let mut settings = port.0.read_settings().map_err(err)?;

        settings.set_char_size(CharSize::Bits8);
        settings.set_stop_bits(StopBits::Stop1);
        settings
            .set_baud_rate(BaudRate::from_speed(baud as usize))
            .map_err(err)?;
        settings.set_flow_control(FlowControl::FlowNone);
        settings.set_parity(Parity::ParityEven);

        port.0.write_settings(&settings).map_err(err)?;

        // Reads return WouldBlock once this elapses without data
        port.0.set_timeout(POLL_INTERVAL).map_err(err)?;

        Ok(port)
    }

    fn claim_pin(&mut self, line: u32, high: bool) -> Result<Self::Pin, Error> {
        let line = line as u64;
        let pin = SysfsPin::new(line);

        pin.0.export().map_err(gpio_err(line))?;

        let direction = if high { Direction::High } else { Direction::Low };
        pin.0.set_direction(direction).map_err(gpio_err(line))?;

        Ok(pin)
    }

    fn delay(&mut self) -> &mut Self::Delay {
        &mut self.delay
    }
}

impl Session<Linux> {
    /// Create a new session using sysfs GPIO and the configured tty
    pub fn linux(config: Config) -> Self {
        Self::new(config, Linux::default())
    }
}
