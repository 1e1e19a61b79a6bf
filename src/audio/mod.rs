//! audio - Decoder chip and microphone drivers
//!
//! The decoder is a VS1053b on a synchronous bus, reached through the
//! traits in [`crate::hal`]. Capture comes from any [`Microphone`].

mod microphone;
mod volume;
mod vs1053b;
mod wav;

#[cfg(feature = "alsa")]
pub use microphone::AlsaMicrophone;
pub use microphone::{Microphone, SimMicrophone};
pub use volume::{Attenuation, VolumeCurve, MAX_ATTENUATION, VOL_RANGE, VOL_THRESHOLD};
pub use vs1053b::{decode_bitrate, DecoderLines, ResetTiming, Vs1053b, CHUNK_SIZE_MAX};
pub use wav::{WavHeader, WAV_HEADER_LEN};

/// Register addresses and mode bits of the decoder.
pub mod regs {
    pub use super::vs1053b::{
        OPCODE_READ, OPCODE_WRITE, SCI_AIADDR, SCI_AICTRL0, SCI_AICTRL1, SCI_AICTRL2,
        SCI_AICTRL3, SCI_AUDATA, SCI_BASS, SCI_CLOCKF, SCI_DECODE_TIME, SCI_HDAT0, SCI_HDAT1,
        SCI_MODE, SCI_STATUS, SCI_VOL, SCI_WRAM, SCI_WRAMADDR, SM_CANCEL, SM_DIFF, SM_LAYER12,
        SM_LINE1, SM_RESET, SM_SDINEW, SM_STREAM, SM_TESTS,
    };
}
