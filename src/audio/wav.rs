//! RIFF/WAVE header for the capture upload stream.

pub const WAV_HEADER_LEN: usize = 44;

const PCM_FORMAT: u16 = 1;
const FMT_CHUNK_LEN: u32 = 16;

/// Fixed 44-byte header prefixed to every capture upload.
///
/// The stream length is not known in advance, so `data_size` carries a
/// nominal value; the server reads until the upload ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WavHeader {
    pub channels: u16,
    pub sample_rate: u32,
    pub bits_per_sample: u16,
    pub data_size: u32,
}

impl WavHeader {
    /// Mono 16-bit PCM at `sample_rate`.
    pub fn pcm_mono16(sample_rate: u32, data_size: u32) -> Self {
        Self {
            channels: 1,
            sample_rate,
            bits_per_sample: 16,
            data_size,
        }
    }

    pub fn byte_rate(&self) -> u32 {
        u32::from(self.channels) * self.sample_rate * u32::from(self.bits_per_sample) / 8
    }

    pub fn block_align(&self) -> u16 {
        self.channels * self.bits_per_sample / 8
    }

    /// RIFF chunk size: everything after the first 8 bytes.
    pub fn chunk_size(&self) -> u32 {
        (WAV_HEADER_LEN as u32 - 8) + self.data_size
    }

    pub fn to_bytes(&self) -> [u8; WAV_HEADER_LEN] {
        let mut out = [0u8; WAV_HEADER_LEN];
        out[0..4].copy_from_slice(b"RIFF");
        out[4..8].copy_from_slice(&self.chunk_size().to_le_bytes());
        out[8..12].copy_from_slice(b"WAVE");
        out[12..16].copy_from_slice(b"fmt ");
        out[16..20].copy_from_slice(&FMT_CHUNK_LEN.to_le_bytes());
        out[20..22].copy_from_slice(&PCM_FORMAT.to_le_bytes());
        out[22..24].copy_from_slice(&self.channels.to_le_bytes());
        out[24..28].copy_from_slice(&self.sample_rate.to_le_bytes());
        out[28..32].copy_from_slice(&self.byte_rate().to_le_bytes());
        out[32..34].copy_from_slice(&self.block_align().to_le_bytes());
        out[34..36].copy_from_slice(&self.bits_per_sample.to_le_bytes());
        out[36..40].copy_from_slice(b"data");
        out[40..44].copy_from_slice(&self.data_size.to_le_bytes());
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derived_fields_for_voice_format() {
        let header = WavHeader::pcm_mono16(16000, 50 * 1024);
        assert_eq!(header.byte_rate(), 32000);
        assert_eq!(header.block_align(), 2);
        assert_eq!(header.chunk_size(), 36 + 51200);
    }

    #[test]
    fn test_layout() {
        let bytes = WavHeader::pcm_mono16(16000, 51200).to_bytes();
        assert_eq!(bytes.len(), WAV_HEADER_LEN);
        assert_eq!(&bytes[0..4], b"RIFF");
        assert_eq!(&bytes[8..16], b"WAVEfmt ");
        assert_eq!(&bytes[36..40], b"data");
        assert_eq!(u16::from_le_bytes([bytes[20], bytes[21]]), 1);
        assert_eq!(u16::from_le_bytes([bytes[22], bytes[23]]), 1);
        assert_eq!(
            u32::from_le_bytes([bytes[24], bytes[25], bytes[26], bytes[27]]),
            16000
        );
        assert_eq!(
            u32::from_le_bytes([bytes[28], bytes[29], bytes[30], bytes[31]]),
            32000
        );
        assert_eq!(u16::from_le_bytes([bytes[34], bytes[35]]), 16);
        assert_eq!(
            u32::from_le_bytes([bytes[40], bytes[41], bytes[42], bytes[43]]),
            51200
        );
    }
}
