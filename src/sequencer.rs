//! GPIO sequences that power cycle the target into and out of the bootloader.
//!
//! The boot select lines are sampled when power is reapplied, so each sequence drops
//! power, sets the boot lines, and brings power back after a settling delay. Nothing
//! is acknowledged by the device here; only a successful sync proves it booted.

use embedded_hal::blocking::delay::DelayMs;

use crate::{ControlPin, Error, Hardware};

/// Time allowed for lines and supply to settle at each step
pub const SETTLE_MS: u32 = 10;

pub struct BootPins<P> {
    power: P,
    boot0: P,
    boot1: P,
}

impl<P: ControlPin> BootPins<P> {
    pub fn new(power: P, boot0: P, boot1: P) -> Self {
        Self {
            power,
            boot0,
            boot1,
        }
    }

    /// Claim the three lines, power on and both boot selects low (normal run mode)
    pub fn claim<H>(hw: &mut H, power: u32, boot0: u32, boot1: u32) -> Result<Self, Error>
    where
        H: Hardware<Pin = P>,
    {
        let mut power = hw.claim_pin(power, true)?;

        let mut boot0 = match hw.claim_pin(boot0, false) {
            Ok(p) => p,
            Err(e) => {
                abandon(&mut [&mut power]);
                return Err(e);
            }
        };

        let boot1 = match hw.claim_pin(boot1, false) {
            Ok(p) => p,
            Err(e) => {
                abandon(&mut [&mut boot0, &mut power]);
                return Err(e);
            }
        };

        Ok(Self::new(power, boot0, boot1))
    }

    /// Power cycle with BOOT0 high and BOOT1 low, selecting the system memory bootloader
    pub fn enter_bootloader<D: DelayMs<u32>>(&mut self, delay: &mut D) -> Result<(), Error> {
        debug!("Entering bootloader");

        self.power.set(false)?;
        self.boot0.set(true)?;
        self.boot1.set(false)?;
        delay.delay_ms(SETTLE_MS);

        self.power.set(true)?;
        delay.delay_ms(SETTLE_MS);

        Ok(())
    }

    /// Power cycle with both boot selects low so the user application runs
    pub fn exit_bootloader<D: DelayMs<u32>>(&mut self, delay: &mut D) -> Result<(), Error> {
        debug!("Exiting bootloader");

        self.power.set(false)?;
        self.boot0.set(false)?;
        self.boot1.set(false)?;
        delay.delay_ms(SETTLE_MS);

        self.power.set(true)?;
        delay.delay_ms(SETTLE_MS);

        Ok(())
    }

    /// Release all three lines, attempting each one even if an earlier release fails
    pub fn release(mut self) -> Result<(), Error> {
        let results = vec![
            self.boot0.release(),
            self.boot1.release(),
            self.power.release(),
        ];

        results.into_iter().collect::<Result<Vec<_>, _>>().map(|_| ())
    }
}

/// Release lines from a partial claim, logging failures
fn abandon<P: ControlPin>(pins: &mut [&mut P]) {
    for pin in pins.iter_mut() {
        if let Err(e) = pin.release() {
            warn!("could not release pin: {}", e);
        }
    }
}
