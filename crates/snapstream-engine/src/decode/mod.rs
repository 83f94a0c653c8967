//! Decoder pipeline: opaque codec bytes in, interleaved f32 frames out.
//!
//! Each chunk is decoded independently and keeps its server timestamp; the
//! playout buffer derives per-frame deadlines from the frame count. Codec
//! implementations live behind [`Decoder`]; the engine only knows the
//! contract.

mod flac;
mod opus;
mod pcm;
mod vorbis;

pub use flac::FlacDecoder;
pub use opus::OpusDecoder;
pub use pcm::PcmDecoder;
pub use vorbis::VorbisDecoder;

use crate::error::DecodeError;

/// Stream format extracted from the codec header. Fixed for the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
    pub bits_per_sample: u16,
}

impl AudioFormat {
    pub fn frame_duration_us(&self) -> f64 {
        1_000_000.0 / self.sample_rate as f64
    }
}

/// Per-session codec binding.
///
/// `decode` must be deterministic: the same byte sequence always yields the
/// same PCM. Recoverable errors drop the chunk; fatal ones end the session.
pub trait Decoder: Send {
    /// Parse the codec setup blob and return the stream format.
    fn init(&mut self, setup: &[u8]) -> Result<AudioFormat, DecodeError>;

    /// Decode one wire chunk into interleaved f32 frames.
    fn decode(&mut self, chunk: &[u8]) -> Result<Vec<f32>, DecodeError>;

    /// Drop any inter-chunk state.
    fn reset(&mut self);
}

/// Choose a decoder by the codec tag carried in the codec header.
pub fn make_decoder(codec: &str) -> Result<Box<dyn Decoder>, DecodeError> {
    match codec {
        "pcm" => Ok(Box::new(PcmDecoder::new())),
        "flac" => Ok(Box::new(FlacDecoder::new())),
        "ogg" => Ok(Box::new(VorbisDecoder::new())),
        "opus" => Ok(Box::new(OpusDecoder::new())),
        other => Err(DecodeError::Fatal(format!("unsupported codec {other:?}"))),
    }
}
