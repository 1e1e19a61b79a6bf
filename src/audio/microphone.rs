//! Microphone capture driver.
//!
//! A microphone is a continuously clocked source of 16-bit little-endian mono
//! PCM. The driver keeps no buffering of its own: `take_samples` hands back
//! whatever the peripheral has within the timeout.

use std::f64::consts::PI;
use std::thread;
use std::time::{Duration, Instant};

use crate::error::MicError;

/// Audio the simulated peripheral ring holds; older samples are overwritten.
const SIM_RING_SPAN: Duration = Duration::from_millis(200);

/// A block-sampling PCM source.
pub trait Microphone: Send {
    /// Reads up to `dest.len()` bytes of PCM into `dest`.
    ///
    /// Returns fewer bytes than requested (possibly zero) when `timeout`
    /// elapses first. Never returns a partial sample.
    fn take_samples(&mut self, dest: &mut [u8], timeout: Duration) -> Result<usize, MicError>;
}

/// Synthetic microphone generating a tone (or silence) at a real-time pace.
pub struct SimMicrophone {
    sample_rate: u32,
    frequency: f64,
    amplitude: f64,
    position: u64,
    paced: bool,
    // Instant at which the sample at the given position was captured.
    anchor: Option<(Instant, u64)>,
}

impl SimMicrophone {
    /// A 440 Hz tone at half scale.
    pub fn sine(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            frequency: 440.0,
            amplitude: 0.5,
            position: 0,
            paced: true,
            anchor: None,
        }
    }

    pub fn silence(sample_rate: u32) -> Self {
        Self {
            amplitude: 0.0,
            ..Self::sine(sample_rate)
        }
    }

    /// Produces samples as fast as they are requested.
    pub fn unpaced(mut self) -> Self {
        self.paced = false;
        self
    }

    /// Number of samples generated so far.
    pub fn position(&self) -> u64 {
        self.position
    }

    fn next_sample(&mut self) -> i16 {
        let t = self.position as f64 / f64::from(self.sample_rate);
        self.position += 1;
        ((2.0 * PI * self.frequency * t).sin() * self.amplitude * 32767.0) as i16
    }

    // Samples the clock says should exist by now, capped at `want`.
    fn available(&mut self, want: usize, timeout: Duration) -> usize {
        if !self.paced {
            return want;
        }
        let rate = f64::from(self.sample_rate);
        let due_at = |(t0, p0): (Instant, u64), pos: u64| {
            t0 + Duration::from_secs_f64(pos.saturating_sub(p0) as f64 / rate)
        };

        // A reader that fell further behind than the ring holds restarts
        // from live audio instead of draining a backlog.
        let now = Instant::now();
        let anchor = match self.anchor {
            Some(a) if now.saturating_duration_since(due_at(a, self.position)) <= SIM_RING_SPAN => {
                a
            }
            previous => {
                if previous.is_some() {
                    log::debug!("Simulated microphone overrun, skipping to live audio");
                }
                (now, self.position)
            }
        };
        self.anchor = Some(anchor);

        let target = self.position + want as u64;
        let wake = due_at(anchor, target).min(now + timeout);
        let now = Instant::now();
        if wake > now {
            thread::sleep(wake - now);
        }

        let produced = anchor.1 + (anchor.0.elapsed().as_secs_f64() * rate) as u64;
        produced.saturating_sub(self.position).min(want as u64) as usize
    }
}

impl Microphone for SimMicrophone {
    fn take_samples(&mut self, dest: &mut [u8], timeout: Duration) -> Result<usize, MicError> {
        let count = self.available(dest.len() / 2, timeout);
        for pair in dest.chunks_exact_mut(2).take(count) {
            let sample = self.next_sample();
            pair.copy_from_slice(&sample.to_le_bytes());
        }
        Ok(count * 2)
    }
}

#[cfg(feature = "alsa")]
pub use self::alsa_mic::AlsaMicrophone;

#[cfg(feature = "alsa")]
mod alsa_mic {
    use std::time::Duration;

    use alsa::pcm::{Access, Format, HwParams, PCM};
    use alsa::{Direction, ValueOr};
    use anyhow::{Context, Result};

    use super::Microphone;
    use crate::error::MicError;

    /// Capture PCM opened as 16-bit mono.
    pub struct AlsaMicrophone {
        pcm: PCM,
    }

    impl AlsaMicrophone {
        pub fn open(device: &str, sample_rate: u32) -> Result<Self> {
            let pcm = PCM::new(device, Direction::Capture, false)
                .with_context(|| format!("Failed to open PCM device '{}' for Capture", device))?;

            {
                let hwp = HwParams::any(&pcm).with_context(|| "Failed to initialize HwParams")?;
                hwp.set_access(Access::RWInterleaved)?;
                hwp.set_format(Format::S16LE)?;
                hwp.set_channels(1)?;
                hwp.set_rate_near(sample_rate, ValueOr::Nearest)?;
                pcm.hw_params(&hwp)?;
            }

            let (rate, period) = {
                let hwp = pcm.hw_params_current()?;
                (hwp.get_rate()?, hwp.get_period_size()?)
            };
            if rate != sample_rate {
                log::warn!("ALSA capture negotiated {} Hz instead of {} Hz", rate, sample_rate);
            }
            pcm.start()?;

            log::info!("ALSA Capture: device={}, rate={}, period_size={}", device, rate, period);
            Ok(Self { pcm })
        }
    }

    impl Microphone for AlsaMicrophone {
        fn take_samples(&mut self, dest: &mut [u8], timeout: Duration) -> Result<usize, MicError> {
            let timeout_ms = u32::try_from(timeout.as_millis()).unwrap_or(u32::MAX);
            let ready = self
                .pcm
                .wait(Some(timeout_ms))
                .map_err(|e| MicError::Read(e.to_string()))?;
            if !ready {
                return Ok(0);
            }

            // Only what is already buffered, so the read cannot block past `timeout`.
            let avail = match self.pcm.avail_update() {
                Ok(frames) => usize::try_from(frames).unwrap_or(0),
                Err(e) => return self.recover(e),
            };
            let frames = (dest.len() / 2).min(avail);
            if frames == 0 {
                return Ok(0);
            }

            let io = self.pcm.io_bytes();
            match io.readi(&mut dest[..frames * 2]) {
                Ok(read) => Ok(read * 2),
                Err(e) => self.recover(e),
            }
        }
    }

    impl AlsaMicrophone {
        fn recover(&self, e: alsa::Error) -> Result<usize, MicError> {
            log::warn!("ALSA capture read failed: {}, recovering", e);
            self.pcm
                .try_recover(e, true)
                .map_err(|e| MicError::Read(e.to_string()))?;
            Ok(0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unpaced_fills_whole_buffer() {
        let mut mic = SimMicrophone::sine(16000).unpaced();
        let mut buf = [0u8; 1024];
        assert_eq!(mic.take_samples(&mut buf, Duration::ZERO).unwrap(), 1024);
        assert_eq!(mic.position(), 512);
        assert!(buf.iter().any(|b| *b != 0));
    }

    #[test]
    fn test_silence_is_zero() {
        let mut mic = SimMicrophone::silence(16000).unpaced();
        let mut buf = [0xAAu8; 64];
        mic.take_samples(&mut buf, Duration::ZERO).unwrap();
        assert!(buf.iter().all(|b| *b == 0));
    }

    #[test]
    fn test_paced_read_honours_timeout() {
        let mut mic = SimMicrophone::sine(16000);
        let mut buf = vec![0u8; 32000];
        let started = Instant::now();
        let n = mic.take_samples(&mut buf, Duration::from_millis(20)).unwrap();
        assert!(started.elapsed() < Duration::from_millis(500));
        assert!(n < buf.len());
        assert_eq!(n % 2, 0);
    }

    #[test]
    fn test_paced_read_after_long_gap_returns_live_audio() {
        let mut mic = SimMicrophone::sine(16000);
        let mut buf = vec![0u8; 32000];
        mic.take_samples(&mut buf[..64], Duration::from_millis(50)).unwrap();

        thread::sleep(Duration::from_millis(600));
        let n = mic.take_samples(&mut buf, Duration::from_millis(50)).unwrap();
        // 200 ms of 16 kHz mono at 2 bytes per sample; the gap alone would be 19200.
        assert!(n < 6400, "read {} bytes of backlog", n);
    }

    #[test]
    fn test_odd_buffer_never_splits_a_sample() {
        let mut mic = SimMicrophone::sine(16000).unpaced();
        let mut buf = [0u8; 7];
        assert_eq!(mic.take_samples(&mut buf, Duration::ZERO).unwrap(), 6);
    }
}
