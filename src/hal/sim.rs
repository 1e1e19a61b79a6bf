//! In-memory decoder board.
//!
//! Emulates the register file and data port of the decoder chip and records
//! every line change, so the appliance can run on a development host and tests
//! can inspect exactly what the driver put on the wire.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use super::{BusDevice, OutputLine, ReadySignal};
use crate::audio::{DecoderLines, ResetTiming, Vs1053b};
use crate::error::BusError;

const OPCODE_READ: u8 = 0x03;
const OPCODE_WRITE: u8 = 0x02;

#[derive(Default)]
struct SimState {
    registers: [u16; 16],
    control_writes: Vec<(u8, u16)>,
    audio: Vec<u8>,
    largest_transfer: usize,
    lines: HashMap<&'static str, bool>,
    line_history: Vec<(&'static str, bool)>,
    fail_control: bool,
    data_delay: Duration,
}

/// Shared handle to a simulated board. Clones observe the same board.
#[derive(Clone)]
pub struct SimBoard {
    state: Arc<Mutex<SimState>>,
    ready: Arc<AtomicBool>,
}

impl Default for SimBoard {
    fn default() -> Self {
        Self::new()
    }
}

impl SimBoard {
    /// Creates a board whose ready line is asserted.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState::default())),
            ready: Arc::new(AtomicBool::new(true)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Chip-select of the control-register interface.
    pub fn control_device(&self) -> Box<dyn BusDevice> {
        Box::new(SimControl { board: self.clone() })
    }

    /// Chip-select of the audio data interface.
    pub fn data_device(&self) -> Box<dyn BusDevice> {
        Box::new(SimData { board: self.clone() })
    }

    pub fn ready_signal(&self) -> Box<dyn ReadySignal> {
        Box::new(SimReady {
            ready: Arc::clone(&self.ready),
        })
    }

    /// An output line identified by `name`.
    pub fn line(&self, name: &'static str) -> SimLine {
        SimLine {
            name,
            board: self.clone(),
        }
    }

    /// Decoder driver wired to this board's bus and lines.
    pub fn decoder(&self, timing: ResetTiming) -> Vs1053b {
        Vs1053b::new(
            self.control_device(),
            self.data_device(),
            self.ready_signal(),
            DecoderLines {
                reset: Box::new(self.line("reset")),
                codec_mute: Box::new(self.line("codec_mute")),
                amp_mute: Box::new(self.line("amp_mute")),
                amp_shutdown: Box::new(self.line("amp_shutdown")),
            },
            timing,
        )
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    /// Time each data-interface transfer takes, emulating decode pace.
    pub fn set_data_delay(&self, delay: Duration) {
        self.lock().data_delay = delay;
    }

    /// Makes every control transaction fail until cleared.
    pub fn fail_control_bus(&self, fail: bool) {
        self.lock().fail_control = fail;
    }

    pub fn register(&self, addr: u8) -> u16 {
        self.lock().registers[usize::from(addr & 0x0F)]
    }

    pub fn set_register(&self, addr: u8, value: u16) {
        self.lock().registers[usize::from(addr & 0x0F)] = value;
    }

    /// Every control write as `(address, value)`, oldest first.
    pub fn control_writes(&self) -> Vec<(u8, u16)> {
        self.lock().control_writes.clone()
    }

    /// All bytes received on the data interface.
    pub fn audio(&self) -> Vec<u8> {
        self.lock().audio.clone()
    }

    /// Size of the largest single data-interface transfer.
    pub fn largest_audio_transfer(&self) -> usize {
        self.lock().largest_transfer
    }

    pub fn line_level(&self, name: &str) -> Option<bool> {
        self.lock().lines.get(name).copied()
    }

    /// Levels driven on `name`, oldest first.
    pub fn line_history(&self, name: &str) -> Vec<bool> {
        self.lock()
            .line_history
            .iter()
            .filter(|(n, _)| *n == name)
            .map(|(_, level)| *level)
            .collect()
    }
}

struct SimControl {
    board: SimBoard,
}

impl BusDevice for SimControl {
    fn transfer(&mut self, tx: &[u8], rx: &mut [u8]) -> Result<(), BusError> {
        let mut state = self.board.lock();
        if state.fail_control {
            return Err(BusError::transaction("control", "no acknowledge"));
        }
        if tx.len() != 4 || rx.len() != tx.len() {
            return Err(BusError::transaction("control", "malformed transaction"));
        }
        let addr = tx[1] & 0x0F;
        match tx[0] {
            OPCODE_READ => {
                let value = state.registers[usize::from(addr)];
                rx[2..4].copy_from_slice(&value.to_be_bytes());
            }
            OPCODE_WRITE => {
                let value = u16::from_be_bytes([tx[2], tx[3]]);
                state.registers[usize::from(addr)] = value;
                state.control_writes.push((addr, value));
            }
            other => {
                return Err(BusError::transaction(
                    "control",
                    format!("unknown opcode {other:#04x}"),
                ))
            }
        }
        Ok(())
    }

    fn write(&mut self, tx: &[u8]) -> Result<(), BusError> {
        let mut rx = vec![0u8; tx.len()];
        self.transfer(tx, &mut rx)
    }
}

struct SimData {
    board: SimBoard,
}

impl BusDevice for SimData {
    fn transfer(&mut self, tx: &[u8], rx: &mut [u8]) -> Result<(), BusError> {
        rx.fill(0);
        self.write(tx)
    }

    fn write(&mut self, tx: &[u8]) -> Result<(), BusError> {
        let delay = {
            let mut state = self.board.lock();
            state.audio.extend_from_slice(tx);
            state.largest_transfer = state.largest_transfer.max(tx.len());
            state.data_delay
        };
        if !delay.is_zero() {
            thread::sleep(delay);
        }
        Ok(())
    }
}

struct SimReady {
    ready: Arc<AtomicBool>,
}

impl ReadySignal for SimReady {
    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }
}

/// Output line of a [`SimBoard`].
pub struct SimLine {
    name: &'static str,
    board: SimBoard,
}

impl OutputLine for SimLine {
    fn set_level(&mut self, high: bool) {
        let mut state = self.board.lock();
        state.lines.insert(self.name, high);
        state.line_history.push((self.name, high));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_round_trip_over_control_device() {
        let board = SimBoard::new();
        let mut dev = board.control_device();
        dev.write(&[OPCODE_WRITE, 0x0B, 0x12, 0x34]).unwrap();
        let mut rx = [0u8; 4];
        dev.transfer(&[OPCODE_READ, 0x0B, 0, 0], &mut rx).unwrap();
        assert_eq!(&rx[2..], &[0x12, 0x34]);
        assert_eq!(board.control_writes(), vec![(0x0B, 0x1234)]);
    }

    #[test]
    fn test_line_history_is_per_line() {
        let board = SimBoard::new();
        let mut led = board.line("led");
        let mut mute = board.line("mute");
        led.set_level(true);
        mute.set_level(false);
        led.set_level(false);
        assert_eq!(board.line_history("led"), vec![true, false]);
        assert_eq!(board.line_level("mute"), Some(false));
        assert_eq!(board.line_level("reset"), None);
    }
}
