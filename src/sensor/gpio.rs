//! GPIO Character-Device Backend
//!
//! Opens the converter's two lines on a `/dev/gpiochipN` device and hands
//! them to [`Hx711`] as `embedded-hal` pins. Line numbers are offsets on
//! that chip, so they stay valid regardless of the kernel's global GPIO
//! numbering.

use std::path::Path;

use gpio_cdev::{Chip, LineRequestFlags};
use linux_embedded_hal::{CdevPin, Delay};
use tracing::debug;

use crate::sensor::bus::{BusError, Hx711};

/// Default GPIO chip device.
pub const DEFAULT_CHIP: &str = "/dev/gpiochip0";

/// Consumer label shown by `gpioinfo`.
const CONSUMER: &str = "dice-scale";

/// HX711 on character-device lines.
pub type CdevHx711 = Hx711<CdevPin, CdevPin, Delay>;

/// Request `data_line` as input and `clock_line` as output (driven low).
pub fn open_hx711(chip: &Path, data_line: u32, clock_line: u32) -> Result<CdevHx711, BusError> {
    let mut handle = Chip::new(chip).map_err(|e| BusError::Pin(format!("open {}: {e}", chip.display())))?;

    let data = request(&mut handle, data_line, LineRequestFlags::INPUT)?;
    let clock = request(&mut handle, clock_line, LineRequestFlags::OUTPUT)?;
    debug!("{}: line {} data, line {} clock", chip.display(), data_line, clock_line);

    Ok(Hx711::new(data, clock, Delay))
}

fn request(chip: &mut Chip, offset: u32, flags: LineRequestFlags) -> Result<CdevPin, BusError> {
    let line = chip
        .get_line(offset)
        .and_then(|line| line.request(flags, 0, CONSUMER))
        .map_err(|e| BusError::Pin(format!("line {offset}: {e}")))?;
    CdevPin::new(line).map_err(|e| BusError::Pin(format!("line {offset}: {e}")))
}
