//! VS1053b audio decoder driver.
//!
//! The chip exposes two independent chip-selects on one bus: the serial
//! control interface (SCI, 16-bit registers) and the serial data interface
//! (SDI, compressed audio). Each gets its own lock so register traffic never
//! stalls audio feeding. Every transaction is gated on the DREQ ready line.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use super::volume::{Attenuation, VolumeCurve};
use crate::error::BusError;
use crate::hal::{BusDevice, OutputLine, ReadySignal};

/// Largest SDI transfer that is always safe for the chip FIFO.
pub const CHUNK_SIZE_MAX: usize = 32;

pub const OPCODE_READ: u8 = 0x03;
pub const OPCODE_WRITE: u8 = 0x02;

pub const SCI_MODE: u8 = 0x00;
pub const SCI_STATUS: u8 = 0x01;
pub const SCI_BASS: u8 = 0x02;
pub const SCI_CLOCKF: u8 = 0x03;
pub const SCI_DECODE_TIME: u8 = 0x04;
pub const SCI_AUDATA: u8 = 0x05;
pub const SCI_WRAM: u8 = 0x06;
pub const SCI_WRAMADDR: u8 = 0x07;
pub const SCI_HDAT0: u8 = 0x08;
pub const SCI_HDAT1: u8 = 0x09;
pub const SCI_AIADDR: u8 = 0x0A;
pub const SCI_VOL: u8 = 0x0B;
pub const SCI_AICTRL0: u8 = 0x0C;
pub const SCI_AICTRL1: u8 = 0x0D;
pub const SCI_AICTRL2: u8 = 0x0E;
pub const SCI_AICTRL3: u8 = 0x0F;

pub const SM_DIFF: u16 = 0x0001;
pub const SM_LAYER12: u16 = 0x0002;
pub const SM_RESET: u16 = 0x0004;
pub const SM_CANCEL: u16 = 0x0008;
pub const SM_TESTS: u16 = 0x0020;
pub const SM_STREAM: u16 = 0x0040;
pub const SM_SDINEW: u16 = 0x0800;
pub const SM_LINE1: u16 = 0x4000;

/// Output lines wired to the decoder and its amplifier.
pub struct DecoderLines {
    /// XRESET, active low.
    pub reset: Box<dyn OutputLine>,
    /// Codec analog mute control, low mutes.
    pub codec_mute: Box<dyn OutputLine>,
    /// Amplifier mute, active low.
    pub amp_mute: Box<dyn OutputLine>,
    /// Amplifier shutdown, active low.
    pub amp_shutdown: Box<dyn OutputLine>,
}

/// Delays used by the reset and start sequences.
#[derive(Debug, Clone, Copy)]
pub struct ResetTiming {
    pub reset_pulse: Duration,
    pub power_up: Duration,
    pub mute_settle: Duration,
    pub mode_switch: Duration,
}

impl Default for ResetTiming {
    fn default() -> Self {
        Self {
            reset_pulse: Duration::from_millis(20),
            power_up: Duration::from_millis(500),
            mute_settle: Duration::from_millis(50),
            mode_switch: Duration::from_millis(150),
        }
    }
}

impl ResetTiming {
    /// No delays, for boards that settle instantly.
    pub fn immediate() -> Self {
        Self {
            reset_pulse: Duration::ZERO,
            power_up: Duration::ZERO,
            mute_settle: Duration::ZERO,
            mode_switch: Duration::ZERO,
        }
    }
}

pub struct Vs1053b {
    control: Mutex<Box<dyn BusDevice>>,
    data: Mutex<Box<dyn BusDevice>>,
    ready: Box<dyn ReadySignal>,
    reset: Mutex<Box<dyn OutputLine>>,
    codec_mute: Mutex<Box<dyn OutputLine>>,
    amp_mute: Mutex<Box<dyn OutputLine>>,
    curve: VolumeCurve,
    timing: ResetTiming,
}

fn guard<T: ?Sized>(m: &Mutex<Box<T>>) -> MutexGuard<'_, Box<T>> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Vs1053b {
    /// Takes ownership of the bus devices and lines and puts the chip in reset.
    ///
    /// The amplifier is enabled and unmuted; the codec stays in reset and
    /// muted until [`Vs1053b::start`].
    pub fn new(
        control: Box<dyn BusDevice>,
        data: Box<dyn BusDevice>,
        ready: Box<dyn ReadySignal>,
        mut lines: DecoderLines,
        timing: ResetTiming,
    ) -> Self {
        lines.reset.set_level(false);
        lines.codec_mute.set_level(false);
        lines.amp_mute.set_level(true);
        lines.amp_shutdown.set_level(true);
        thread::sleep(timing.mute_settle);

        let curve = VolumeCurve::default();
        log::info!("Decoder driver initialised, volume curve top = {}", curve.top());

        Self {
            control: Mutex::new(control),
            data: Mutex::new(data),
            ready,
            reset: Mutex::new(lines.reset),
            codec_mute: Mutex::new(lines.codec_mute),
            amp_mute: Mutex::new(lines.amp_mute),
            curve,
            timing,
        }
    }

    /// Releases reset and brings the chip into MP3 stream decoding.
    pub fn start(&self) -> Result<(), BusError> {
        guard(&self.reset).set_level(true);
        thread::sleep(self.timing.power_up);
        guard(&self.codec_mute).set_level(true);
        thread::sleep(self.timing.mute_settle);
        if !self.ready.is_ready() {
            log::error!("VS1053b audio decoder is unavailable");
            return Err(BusError::NotReady);
        }

        self.switch_to_mp3_mode()?;
        let version = (self.read_register(SCI_STATUS)? >> 4) & 0x0F;
        self.write_register(SCI_CLOCKF, 0xB8, 0x00)?;
        self.soft_reset()?;
        self.await_ready();
        self.set_volume(100.0)?;
        thread::sleep(self.timing.mute_settle);

        log::info!("VS1053b started, chip version = {:#x}", version);
        Ok(())
    }

    /// Blocks until DREQ is asserted.
    pub fn await_ready(&self) {
        self.ready.await_ready();
    }

    pub fn read_register(&self, addr: u8) -> Result<u16, BusError> {
        let mut rx = [0u8; 4];
        self.await_ready();
        {
            let mut dev = guard(&self.control);
            dev.transfer(&[OPCODE_READ, addr, 0, 0], &mut rx)?;
        }
        self.await_ready();
        Ok(u16::from_be_bytes([rx[2], rx[3]]))
    }

    pub fn write_register(&self, addr: u8, hi: u8, lo: u8) -> Result<(), BusError> {
        self.await_ready();
        {
            let mut dev = guard(&self.control);
            dev.write(&[OPCODE_WRITE, addr, hi, lo])?;
        }
        self.await_ready();
        Ok(())
    }

    /// Streams `bytes` to the decoder in FIFO-safe pieces.
    pub fn send_audio_chunk(&self, bytes: &[u8]) -> Result<(), BusError> {
        for piece in bytes.chunks(CHUNK_SIZE_MAX) {
            self.await_ready();
            let mut dev = guard(&self.data);
            dev.write(piece)?;
        }
        Ok(())
    }

    /// Pulses XRESET and checks that DREQ comes back.
    pub fn hard_reset(&self) -> Result<(), BusError> {
        {
            let mut reset = guard(&self.reset);
            reset.set_level(false);
            thread::sleep(self.timing.reset_pulse);
            reset.set_level(true);
        }
        thread::sleep(self.timing.reset_pulse);
        if self.ready.is_ready() {
            return Ok(());
        }
        thread::sleep(self.timing.reset_pulse);
        if self.ready.is_ready() {
            Ok(())
        } else {
            Err(BusError::NotReady)
        }
    }

    pub fn soft_reset(&self) -> Result<(), BusError> {
        let hi = ((SM_SDINEW | SM_LINE1) >> 8) as u8;
        self.write_register(SCI_MODE, hi, SM_RESET as u8)?;
        self.write_register(SCI_MODE, hi, SM_LAYER12 as u8)
    }

    /// Sets the output level from a logical 0..=100 volume.
    pub fn set_volume(&self, level: f32) -> Result<Attenuation, BusError> {
        let att = self.curve.attenuation(level);
        self.write_register(SCI_VOL, att.code, att.code)?;
        guard(&self.codec_mute).set_level(!att.muted);
        log::debug!("Volume {} -> attenuation {:#04x}, muted = {}", level, att.code, att.muted);
        Ok(att)
    }

    /// Drives the amplifier mute line.
    pub fn set_amp_mute(&self, muted: bool) {
        guard(&self.amp_mute).set_level(!muted);
    }

    /// Bitrate of the stream being decoded, in kbit/s.
    pub fn bitrate(&self) -> Result<u16, BusError> {
        let hdat0 = self.read_register(SCI_HDAT0)?;
        let hdat1 = self.read_register(SCI_HDAT1)?;
        Ok(decode_bitrate(hdat0, hdat1))
    }

    fn switch_to_mp3_mode(&self) -> Result<(), BusError> {
        self.write_register(SCI_WRAMADDR, 0xC0, 0x17)?;
        self.write_register(SCI_WRAM, 0x00, 0x03)?;
        self.write_register(SCI_WRAMADDR, 0xC0, 0x19)?;
        self.write_register(SCI_WRAM, 0x00, 0x00)?;
        thread::sleep(self.timing.mode_switch);
        self.hard_reset()
    }
}

// (floor, kbit/s per index step above floor), walked from the top down
const MPEG1_STEPS: &[(u16, u16)] = &[(13, 64), (9, 32), (5, 16), (1, 8)];
const MPEG2_STEPS: &[(u16, u16)] = &[(8, 16), (1, 8)];

/// Decodes the bitrate from the HDAT0/HDAT1 header registers.
pub fn decode_bitrate(hdat0: u16, hdat1: u16) -> u16 {
    let mut index = (hdat0 & 0xF000) >> 12;
    let id = (hdat1 & 0x18) >> 3;
    let (mut kbps, steps) = if id == 3 {
        (32, MPEG1_STEPS)
    } else {
        (8, MPEG2_STEPS)
    };
    for &(floor, step) in steps {
        if index > floor {
            kbps += (index - floor) * step;
            index = floor;
        }
    }
    kbps
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::SimBoard;

    fn driver(board: &SimBoard) -> Vs1053b {
        board.decoder(ResetTiming::immediate())
    }

    #[test]
    fn test_new_holds_codec_in_reset() {
        let board = SimBoard::new();
        let _codec = driver(&board);
        assert_eq!(board.line_level("reset"), Some(false));
        assert_eq!(board.line_level("amp_mute"), Some(true));
        assert_eq!(board.line_level("amp_shutdown"), Some(true));
    }

    #[test]
    fn test_register_write_then_read() {
        let board = SimBoard::new();
        let codec = driver(&board);
        codec.write_register(SCI_BASS, 0xAB, 0xCD).unwrap();
        assert_eq!(codec.read_register(SCI_BASS).unwrap(), 0xABCD);
    }

    #[test]
    fn test_bus_failure_is_surfaced() {
        let board = SimBoard::new();
        let codec = driver(&board);
        board.fail_control_bus(true);
        assert!(matches!(
            codec.write_register(SCI_VOL, 0, 0),
            Err(BusError::Transaction { channel: "control", .. })
        ));
    }

    #[test]
    fn test_audio_is_split_into_fifo_safe_pieces() {
        let board = SimBoard::new();
        let codec = driver(&board);
        let payload: Vec<u8> = (0..=255u8).cycle().take(1000).collect();
        codec.send_audio_chunk(&payload).unwrap();
        assert_eq!(board.audio(), payload);
        assert_eq!(board.largest_audio_transfer(), CHUNK_SIZE_MAX);
    }

    #[test]
    fn test_soft_reset_selects_decode_mode() {
        let board = SimBoard::new();
        let codec = driver(&board);
        codec.soft_reset().unwrap();
        assert_eq!(
            board.control_writes(),
            vec![(SCI_MODE, 0x4804), (SCI_MODE, 0x4802)]
        );
    }

    #[test]
    fn test_start_fails_without_ready_line() {
        let board = SimBoard::new();
        let codec = driver(&board);
        board.set_ready(false);
        assert!(matches!(codec.start(), Err(BusError::NotReady)));
    }

    #[test]
    fn test_start_sequence() {
        let board = SimBoard::new();
        let codec = driver(&board);
        codec.start().unwrap();
        let writes = board.control_writes();
        assert_eq!(writes[0], (SCI_WRAMADDR, 0xC017));
        assert!(writes.contains(&(SCI_CLOCKF, 0xB800)));
        assert_eq!(*writes.last().unwrap(), (SCI_VOL, 0x0000));
        assert_eq!(board.line_level("reset"), Some(true));
        assert_eq!(board.line_level("codec_mute"), Some(true));
    }

    #[test]
    fn test_set_volume_writes_both_channels_and_mute_line() {
        let board = SimBoard::new();
        let codec = driver(&board);
        let att = codec.set_volume(50.0).unwrap();
        assert_eq!(board.register(SCI_VOL), u16::from_be_bytes([att.code, att.code]));
        assert_eq!(board.line_level("codec_mute"), Some(true));

        codec.set_volume(0.0).unwrap();
        assert_eq!(board.line_level("codec_mute"), Some(false));
    }

    #[test]
    fn test_amp_mute_is_active_low() {
        let board = SimBoard::new();
        let codec = driver(&board);
        codec.set_amp_mute(true);
        assert_eq!(board.line_level("amp_mute"), Some(false));
        codec.set_amp_mute(false);
        assert_eq!(board.line_level("amp_mute"), Some(true));
    }

    #[test]
    fn test_decode_bitrate_mpeg1() {
        assert_eq!(decode_bitrate(0x1000, 0x18), 32);
        assert_eq!(decode_bitrate(0x9000, 0x18), 128);
        assert_eq!(decode_bitrate(0xE000, 0x18), 320);
    }

    #[test]
    fn test_decode_bitrate_mpeg2() {
        assert_eq!(decode_bitrate(0x1000, 0x10), 8);
        assert_eq!(decode_bitrate(0x8000, 0x10), 64);
        assert_eq!(decode_bitrate(0xE000, 0x10), 160);
    }

    #[test]
    fn test_bitrate_reads_header_registers() {
        let board = SimBoard::new();
        let codec = driver(&board);
        board.set_register(SCI_HDAT0, 0x9000);
        board.set_register(SCI_HDAT1, 0xFFFA);
        assert_eq!(codec.bitrate().unwrap(), 128);
    }
}
