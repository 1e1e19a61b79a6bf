//! Hardware seams for the decoder board.
//!
//! The bus driver only talks to these traits, so the same protocol code runs on
//! a real board binding and on [`SimBoard`].

mod sim;

pub use sim::{SimBoard, SimLine};

use crate::error::BusError;

/// One chip-select on the synchronous bus.
pub trait BusDevice: Send {
    /// Clocks `tx` out while clocking the same number of bytes into `rx`.
    fn transfer(&mut self, tx: &[u8], rx: &mut [u8]) -> Result<(), BusError>;

    /// Clocks `tx` out, discarding whatever comes back.
    fn write(&mut self, tx: &[u8]) -> Result<(), BusError>;
}

/// The chip's "ready for the next transaction" input line.
pub trait ReadySignal: Send + Sync {
    fn is_ready(&self) -> bool;

    /// Blocks until the line is asserted.
    ///
    /// The line clears within microseconds, so the default yields in a tight
    /// loop. An interrupt-driven binding can override this.
    fn await_ready(&self) {
        while !self.is_ready() {
            std::hint::spin_loop();
            std::thread::yield_now();
        }
    }
}

/// A push-pull output line (reset, mute, indicator LED).
pub trait OutputLine: Send {
    fn set_level(&mut self, high: bool);
}
