//! Linux GPIO character-device board.
//!
//! Pin identifiers are line offsets on the chip named by the `board` setting,
//! e.g. `/dev/gpiochip0` with pin `"17"`. Every resolved line is requested as
//! an output, initially low.

use crate::board::{Board, BoardError, Pin};
use linux_embedded_hal::gpio_cdev::{Chip, LineHandle, LineRequestFlags};
use std::sync::{Arc, Mutex, PoisonError};

const CONSUMER: &str = "sprinkler";

pub struct CdevPin {
    name: String,
    line: LineHandle,
}

impl CdevPin {
    fn io_err(&self, e: impl ToString) -> BoardError {
        BoardError::Io {
            pin: self.name.clone(),
            reason: e.to_string(),
        }
    }
}

impl Pin for CdevPin {
    fn get(&self) -> Result<bool, BoardError> {
        Ok(self.line.get_value().map_err(|e| self.io_err(e))? == 1)
    }

    fn set(&self, high: bool) -> Result<(), BoardError> {
        self.line
            .set_value(u8::from(high))
            .map_err(|e| self.io_err(e))
    }
}

pub struct CdevBoard {
    chip: Mutex<Chip>,
}

impl CdevBoard {
    pub fn open(path: &str) -> Result<Self, BoardError> {
        let chip = Chip::new(path).map_err(|e| BoardError::Io {
            pin: path.to_string(),
            reason: e.to_string(),
        })?;
        tracing::info!(chip = path, "opened GPIO chip");
        Ok(CdevBoard {
            chip: Mutex::new(chip),
        })
    }
}

impl Board for CdevBoard {
    fn pin_by_name(&self, name: &str) -> Result<Arc<dyn Pin>, BoardError> {
        let offset: u32 = name
            .parse()
            .map_err(|_| BoardError::UnknownPin(name.to_string()))?;
        let io_err = |e: linux_embedded_hal::gpio_cdev::Error| BoardError::Io {
            pin: name.to_string(),
            reason: e.to_string(),
        };

        let mut chip = self.chip.lock().unwrap_or_else(PoisonError::into_inner);
        let line = chip
            .get_line(offset)
            .map_err(io_err)?
            .request(LineRequestFlags::OUTPUT, 0, CONSUMER)
            .map_err(io_err)?;
        Ok(Arc::new(CdevPin {
            name: name.to_string(),
            line,
        }))
    }
}
