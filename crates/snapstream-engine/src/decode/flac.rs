//! FLAC decoder binding (Symphonia).
//!
//! The codec header is a raw FLAC stream header (`fLaC` magic + metadata
//! blocks); the STREAMINFO block seeds the Symphonia decoder, and each wire
//! chunk is fed to it as one packet of whole FLAC frames.

use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{CODEC_TYPE_FLAC, CodecParameters, DecoderOptions};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::Packet;

use crate::decode::{AudioFormat, Decoder};
use crate::error::DecodeError;

const STREAMINFO_LEN: usize = 34;

pub struct FlacDecoder {
    inner: Option<Box<dyn symphonia::core::codecs::Decoder>>,
}

impl FlacDecoder {
    pub fn new() -> Self {
        Self { inner: None }
    }
}

impl Default for FlacDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FlacDecoder {
    fn init(&mut self, setup: &[u8]) -> Result<AudioFormat, DecodeError> {
        let streaminfo = extract_streaminfo(setup)?;
        let format = parse_streaminfo(&streaminfo)?;

        let mut params = CodecParameters::new();
        params
            .for_codec(CODEC_TYPE_FLAC)
            .with_sample_rate(format.sample_rate)
            .with_bits_per_sample(format.bits_per_sample as u32)
            .with_extra_data(streaminfo.into_boxed_slice());

        let inner = symphonia::default::get_codecs()
            .make(&params, &DecoderOptions::default())
            .map_err(|e| DecodeError::Fatal(format!("flac decoder init: {e}")))?;
        self.inner = Some(inner);
        Ok(format)
    }

    fn decode(&mut self, chunk: &[u8]) -> Result<Vec<f32>, DecodeError> {
        let inner = self
            .inner
            .as_mut()
            .ok_or_else(|| DecodeError::Fatal("flac decoder not initialized".into()))?;

        let packet = Packet::new_from_slice(0, 0, 0, chunk);
        let decoded = match inner.decode(&packet) {
            Ok(d) => d,
            Err(SymphoniaError::DecodeError(e)) => {
                return Err(DecodeError::Recoverable(format!("flac frame: {e}")));
            }
            Err(SymphoniaError::IoError(e)) => {
                return Err(DecodeError::Recoverable(format!("flac frame short: {e}")));
            }
            Err(e) => return Err(DecodeError::Fatal(format!("flac: {e}"))),
        };

        let mut buf = SampleBuffer::<f32>::new(decoded.frames() as u64, *decoded.spec());
        buf.copy_interleaved_ref(decoded);
        Ok(buf.samples().to_vec())
    }

    fn reset(&mut self) {
        if let Some(inner) = self.inner.as_mut() {
            inner.reset();
        }
    }
}

/// Pull the STREAMINFO payload out of a FLAC stream header.
fn extract_streaminfo(setup: &[u8]) -> Result<Vec<u8>, DecodeError> {
    let bad = |msg: &str| DecodeError::Fatal(format!("bad flac header: {msg}"));

    if setup.len() < 4 || &setup[0..4] != b"fLaC" {
        return Err(bad("missing fLaC magic"));
    }
    let mut pos = 4;
    loop {
        if pos + 4 > setup.len() {
            return Err(bad("no streaminfo block"));
        }
        let block_type = setup[pos] & 0x7F;
        let last = setup[pos] & 0x80 != 0;
        let len = u32::from_be_bytes([0, setup[pos + 1], setup[pos + 2], setup[pos + 3]]) as usize;
        let body = pos + 4;
        if body + len > setup.len() {
            return Err(bad("truncated metadata block"));
        }
        if block_type == 0 {
            if len != STREAMINFO_LEN {
                return Err(bad("streaminfo has wrong length"));
            }
            return Ok(setup[body..body + len].to_vec());
        }
        if last {
            return Err(bad("no streaminfo block"));
        }
        pos = body + len;
    }
}

/// Decode sample rate / channels / bit depth from the packed STREAMINFO.
fn parse_streaminfo(info: &[u8]) -> Result<AudioFormat, DecodeError> {
    if info.len() != STREAMINFO_LEN {
        return Err(DecodeError::Fatal("streaminfo has wrong length".into()));
    }
    let sample_rate =
        ((info[10] as u32) << 12) | ((info[11] as u32) << 4) | ((info[12] as u32) >> 4);
    let channels = ((info[12] >> 1) & 0x07) as u16 + 1;
    let bits_per_sample = ((((info[12] & 0x01) as u16) << 4) | ((info[13] as u16) >> 4)) + 1;
    if sample_rate == 0 {
        return Err(DecodeError::Fatal("streaminfo sample rate is zero".into()));
    }
    Ok(AudioFormat {
        sample_rate,
        channels,
        bits_per_sample,
    })
}
