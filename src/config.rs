use std::time::Duration;

pub const DEFAULT_BOOT0_GPIO: u32 = 39;
pub const DEFAULT_BOOT1_GPIO: u32 = 41;
pub const DEFAULT_POWER_GPIO: u32 = 19;

pub const DEFAULT_TTY: &str = "/dev/ttyS1";
pub const DEFAULT_BAUD: u32 = 115_200;

/// Default time allowed for each bootloader response
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Wiring and link settings for a target
///
/// Unset values (non-positive GPIO lines, an empty path, zero baud or timeout) fall
/// back to the defaults above when read through the accessor methods.
#[derive(Clone, PartialEq, Debug)]
#[cfg_attr(feature = "structopt", derive(structopt::StructOpt))]
pub struct Config {
    /// GPIO line wired to BOOT0
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "39"))]
    pub boot0_gpio: i32,

    /// GPIO line wired to BOOT1
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "41"))]
    pub boot1_gpio: i32,

    /// GPIO line switching target power
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "19"))]
    pub power_gpio: i32,

    /// Serial port connected to the target UART
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "/dev/ttyS1"))]
    pub tty: String,

    /// Serial baud rate used while in the bootloader
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "115200"))]
    pub baud: u32,

    /// Timeout to wait for each bootloader response
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "5000"))]
    pub response_timeout_ms: u64,

    /// Remove flash write protection before erasing
    #[cfg_attr(feature = "structopt", structopt(long))]
    pub write_unprotect: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            boot0_gpio: DEFAULT_BOOT0_GPIO as i32,
            boot1_gpio: DEFAULT_BOOT1_GPIO as i32,
            power_gpio: DEFAULT_POWER_GPIO as i32,
            tty: DEFAULT_TTY.to_string(),
            baud: DEFAULT_BAUD,
            response_timeout_ms: DEFAULT_RESPONSE_TIMEOUT.as_millis() as u64,
            write_unprotect: false,
        }
    }
}

fn line_or(value: i32, default: u32) -> u32 {
    if value > 0 {
        value as u32
    } else {
        default
    }
}

impl Config {
    pub fn boot0_line(&self) -> u32 {
        line_or(self.boot0_gpio, DEFAULT_BOOT0_GPIO)
    }

    pub fn boot1_line(&self) -> u32 {
        line_or(self.boot1_gpio, DEFAULT_BOOT1_GPIO)
    }

    pub fn power_line(&self) -> u32 {
        line_or(self.power_gpio, DEFAULT_POWER_GPIO)
    }

    pub fn tty(&self) -> &str {
        if self.tty.is_empty() {
            DEFAULT_TTY
        } else {
            &self.tty
        }
    }

    pub fn baud_rate(&self) -> u32 {
        if self.baud == 0 {
            DEFAULT_BAUD
        } else {
            self.baud
        }
    }

    pub fn response_timeout(&self) -> Duration {
        if self.response_timeout_ms == 0 {
            DEFAULT_RESPONSE_TIMEOUT
        } else {
            Duration::from_millis(self.response_timeout_ms)
        }
    }
}
