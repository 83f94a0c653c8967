//! PCM passthrough decoder.
//!
//! The codec header is a RIFF/WAVE header describing the raw stream; chunks
//! are interleaved little-endian samples at the advertised width.

use crate::decode::{AudioFormat, Decoder};
use crate::error::DecodeError;

pub struct PcmDecoder {
    format: Option<AudioFormat>,
    block_align: usize,
}

impl PcmDecoder {
    pub fn new() -> Self {
        Self {
            format: None,
            block_align: 0,
        }
    }
}

impl Default for PcmDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for PcmDecoder {
    fn init(&mut self, setup: &[u8]) -> Result<AudioFormat, DecodeError> {
        let fmt = parse_wave_header(setup)?;
        self.block_align = fmt.channels as usize * (fmt.bits_per_sample as usize / 8);
        self.format = Some(fmt);
        Ok(fmt)
    }

    fn decode(&mut self, chunk: &[u8]) -> Result<Vec<f32>, DecodeError> {
        let format = self
            .format
            .ok_or_else(|| DecodeError::Fatal("pcm decoder not initialized".into()))?;
        if self.block_align == 0 {
            return Err(DecodeError::Fatal("pcm block align is zero".into()));
        }
        if chunk.len() % self.block_align != 0 {
            return Err(DecodeError::Recoverable(format!(
                "pcm chunk length {} not a multiple of block align {}",
                chunk.len(),
                self.block_align
            )));
        }

        let bytes_per_sample = format.bits_per_sample as usize / 8;
        let mut out = Vec::with_capacity(chunk.len() / bytes_per_sample);
        match format.bits_per_sample {
            16 => {
                for s in chunk.chunks_exact(2) {
                    out.push(i16::from_le_bytes([s[0], s[1]]) as f32 / 32768.0);
                }
            }
            24 => {
                for s in chunk.chunks_exact(3) {
                    let v = i32::from_le_bytes([0, s[0], s[1], s[2]]) >> 8;
                    out.push(v as f32 / 8_388_608.0);
                }
            }
            32 => {
                for s in chunk.chunks_exact(4) {
                    let v = i32::from_le_bytes([s[0], s[1], s[2], s[3]]);
                    out.push(v as f32 / 2_147_483_648.0);
                }
            }
            other => {
                return Err(DecodeError::Fatal(format!(
                    "unsupported pcm width {other}"
                )));
            }
        }
        Ok(out)
    }

    fn reset(&mut self) {}
}

/// Minimal RIFF/WAVE parser: finds the `fmt ` chunk and reads the stream
/// description. Everything else in the header is ignored.
fn parse_wave_header(bytes: &[u8]) -> Result<AudioFormat, DecodeError> {
    let bad = |msg: &str| DecodeError::Fatal(format!("bad wave header: {msg}"));

    if bytes.len() < 12 || &bytes[0..4] != b"RIFF" || &bytes[8..12] != b"WAVE" {
        return Err(bad("missing RIFF/WAVE magic"));
    }

    let mut pos = 12;
    while pos + 8 <= bytes.len() {
        let id = &bytes[pos..pos + 4];
        let len = u32::from_le_bytes([
            bytes[pos + 4],
            bytes[pos + 5],
            bytes[pos + 6],
            bytes[pos + 7],
        ]) as usize;
        let body_start = pos + 8;
        if id == b"fmt " {
            if body_start + 16 > bytes.len() {
                return Err(bad("truncated fmt chunk"));
            }
            let b = &bytes[body_start..];
            let audio_format = u16::from_le_bytes([b[0], b[1]]);
            if audio_format != 1 && audio_format != 0xFFFE {
                return Err(bad("not linear pcm"));
            }
            let channels = u16::from_le_bytes([b[2], b[3]]);
            let sample_rate = u32::from_le_bytes([b[4], b[5], b[6], b[7]]);
            let bits_per_sample = u16::from_le_bytes([b[14], b[15]]);
            if channels == 0 || sample_rate == 0 {
                return Err(bad("zero channels or sample rate"));
            }
            return Ok(AudioFormat {
                sample_rate,
                channels,
                bits_per_sample,
            });
        }
        pos = body_start + len + (len & 1);
    }
    Err(bad("no fmt chunk"))
}
