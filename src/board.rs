//! Valve actuation seam.
//!
//! A [`Board`] resolves the opaque pin identifiers from the zone table into
//! [`Pin`] handles. The scheduler only ever reads and writes a boolean level;
//! what a level means electrically is the board's business.
//!
//! [`FakeBoard`] keeps every pin in memory and counts accesses, which is what
//! dry runs and tests use.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;

/// Board reference that selects the in-memory board.
pub const FAKE_BOARD: &str = "fake";

#[derive(Error, Debug)]
pub enum BoardError {
    /// The board has no pin by that identifier
    #[error("unknown pin [{0}]")]
    UnknownPin(String),

    /// Reading or writing a pin failed
    #[error("pin {pin}: {reason}")]
    Io { pin: String, reason: String },
}

/// A single digital output.
pub trait Pin: Send + Sync {
    /// Current level.
    fn get(&self) -> Result<bool, BoardError>;

    /// Drive the pin to `high`.
    fn set(&self, high: bool) -> Result<(), BoardError>;
}

/// Source of pins.
pub trait Board {
    fn pin_by_name(&self, name: &str) -> Result<Arc<dyn Pin>, BoardError>;
}

/// In-memory pin that records how often it is touched.
#[derive(Debug, Default)]
pub struct FakePin {
    level: AtomicBool,
    gets: AtomicUsize,
    sets: AtomicUsize,
    failing: AtomicBool,
}

impl FakePin {
    pub fn level(&self) -> bool {
        self.level.load(Ordering::SeqCst)
    }

    pub fn gets(&self) -> usize {
        self.gets.load(Ordering::SeqCst)
    }

    pub fn sets(&self) -> usize {
        self.sets.load(Ordering::SeqCst)
    }

    /// Total reads and writes.
    pub fn calls(&self) -> usize {
        self.gets() + self.sets()
    }

    /// Make every subsequent access fail (or succeed again).
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check(&self, op: &str) -> Result<(), BoardError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(BoardError::Io {
                pin: "fake".to_string(),
                reason: format!("{op} failed"),
            });
        }
        Ok(())
    }
}

impl Pin for FakePin {
    fn get(&self) -> Result<bool, BoardError> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        self.check("read")?;
        Ok(self.level())
    }

    fn set(&self, high: bool) -> Result<(), BoardError> {
        self.sets.fetch_add(1, Ordering::SeqCst);
        self.check("write")?;
        self.level.store(high, Ordering::SeqCst);
        Ok(())
    }
}

/// Board whose pins spring into existence on first lookup.
#[derive(Debug, Default)]
pub struct FakeBoard {
    pins: Mutex<HashMap<String, Arc<FakePin>>>,
}

impl FakeBoard {
    pub fn new() -> Self {
        Self::default()
    }

    /// The concrete pin behind `name`, creating it if needed.
    pub fn pin(&self, name: &str) -> Arc<FakePin> {
        self.pins
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(name.to_string())
            .or_default()
            .clone()
    }

    /// Identifiers of pins currently driven high.
    pub fn high_pins(&self) -> Vec<String> {
        let pins = self.pins.lock().unwrap_or_else(PoisonError::into_inner);
        let mut high: Vec<String> = pins
            .iter()
            .filter(|(_, p)| p.level())
            .map(|(n, _)| n.clone())
            .collect();
        high.sort();
        high
    }

    /// Sum of reads and writes across every pin.
    pub fn total_calls(&self) -> usize {
        self.pins
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|p| p.calls())
            .sum()
    }
}

impl Board for FakeBoard {
    fn pin_by_name(&self, name: &str) -> Result<Arc<dyn Pin>, BoardError> {
        Ok(self.pin(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fake_pins_are_shared_by_name() {
        let board = FakeBoard::new();
        let handle = board.pin_by_name("17").unwrap();
        handle.set(true).unwrap();

        assert!(board.pin("17").level());
        assert!(handle.get().unwrap());
        assert_eq!(board.high_pins(), vec!["17"]);
        assert_eq!(board.pin("17").sets(), 1);
        assert_eq!(board.pin("17").gets(), 1);
    }

    #[test]
    fn test_failing_pin_keeps_level() {
        let board = FakeBoard::new();
        let pin = board.pin("4");
        pin.set_failing(true);
        assert!(pin.set(true).is_err());
        assert!(!pin.level());

        pin.set_failing(false);
        pin.set(true).unwrap();
        assert!(pin.level());
        assert_eq!(board.total_calls(), 2);
    }
}
