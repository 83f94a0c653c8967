//! Opus decoder binding.
//!
//! The codec header is a fixed 12-byte block: `OPUS` magic, u32 sample rate,
//! u16 bit depth, u16 channels, all little-endian. Each wire chunk carries
//! exactly one Opus packet.

use crate::decode::{AudioFormat, Decoder};
use crate::error::DecodeError;

const OPUS_MAGIC: &[u8; 4] = b"OPUS";
/// Largest Opus frame: 120 ms at 48 kHz.
const MAX_FRAMES_PER_PACKET: usize = 5760;

pub struct OpusDecoder {
    inner: Option<opus::Decoder>,
    format: Option<AudioFormat>,
}

impl OpusDecoder {
    pub fn new() -> Self {
        Self {
            inner: None,
            format: None,
        }
    }
}

impl Default for OpusDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for OpusDecoder {
    fn init(&mut self, setup: &[u8]) -> Result<AudioFormat, DecodeError> {
        let format = parse_opus_header(setup)?;
        let channels = match format.channels {
            1 => opus::Channels::Mono,
            2 => opus::Channels::Stereo,
            n => {
                return Err(DecodeError::Fatal(format!(
                    "unsupported opus channel count {n}"
                )));
            }
        };
        let inner = opus::Decoder::new(format.sample_rate, channels)
            .map_err(|e| DecodeError::Fatal(format!("opus decoder init: {e}")))?;
        self.inner = Some(inner);
        self.format = Some(format);
        Ok(format)
    }

    fn decode(&mut self, chunk: &[u8]) -> Result<Vec<f32>, DecodeError> {
        let inner = self
            .inner
            .as_mut()
            .ok_or_else(|| DecodeError::Fatal("opus decoder not initialized".into()))?;
        let channels = self.format.map(|f| f.channels as usize).unwrap_or(2);

        let mut out = vec![0.0f32; MAX_FRAMES_PER_PACKET * channels];
        let frames = inner
            .decode_float(chunk, &mut out, false)
            .map_err(|e| DecodeError::Recoverable(format!("opus packet: {e}")))?;
        out.truncate(frames * channels);
        Ok(out)
    }

    fn reset(&mut self) {
        if let (Some(inner), Some(_)) = (self.inner.as_mut(), self.format) {
            let _ = inner.reset_state();
        }
    }
}

fn parse_opus_header(setup: &[u8]) -> Result<AudioFormat, DecodeError> {
    if setup.len() < 12 || &setup[0..4] != OPUS_MAGIC {
        return Err(DecodeError::Fatal("bad opus header".into()));
    }
    let sample_rate = u32::from_le_bytes([setup[4], setup[5], setup[6], setup[7]]);
    let bits_per_sample = u16::from_le_bytes([setup[8], setup[9]]);
    let channels = u16::from_le_bytes([setup[10], setup[11]]);
    if sample_rate == 0 || channels == 0 {
        return Err(DecodeError::Fatal("opus header with zero rate/channels".into()));
    }
    Ok(AudioFormat {
        sample_rate,
        channels,
        bits_per_sample,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(rate: u32, bits: u16, channels: u16) -> Vec<u8> {
        let mut h = Vec::new();
        h.extend_from_slice(OPUS_MAGIC);
        h.extend_from_slice(&rate.to_le_bytes());
        h.extend_from_slice(&bits.to_le_bytes());
        h.extend_from_slice(&channels.to_le_bytes());
        h
    }

    #[test]
    fn parses_header() {
        let fmt = parse_opus_header(&header(48_000, 16, 2)).unwrap();
        assert_eq!(fmt.sample_rate, 48_000);
        assert_eq!(fmt.channels, 2);
        assert_eq!(fmt.bits_per_sample, 16);
    }

    #[test]
    fn init_creates_decoder() {
        let mut d = OpusDecoder::new();
        let fmt = d.init(&header(48_000, 16, 2)).unwrap();
        assert_eq!(fmt.sample_rate, 48_000);
    }

    #[test]
    fn short_header_is_fatal() {
        let mut d = OpusDecoder::new();
        assert!(matches!(d.init(b"OPUS"), Err(DecodeError::Fatal(_))));
    }

    #[test]
    fn too_many_channels_is_fatal() {
        let mut d = OpusDecoder::new();
        assert!(matches!(
            d.init(&header(48_000, 16, 6)),
            Err(DecodeError::Fatal(_))
        ));
    }

    #[test]
    fn bad_packet_is_recoverable() {
        let mut d = OpusDecoder::new();
        d.init(&header(48_000, 16, 2)).unwrap();
        assert!(matches!(
            d.decode(&[0xFF; 3]),
            Err(DecodeError::Recoverable(_))
        ));
    }
}
