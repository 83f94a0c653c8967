//! Ogg/Vorbis decoder binding (lewton).
//!
//! The codec header is the Ogg-encapsulated Vorbis header stream (ident,
//! comment, setup); wire chunks are Ogg pages. A small page splitter turns
//! pages into Vorbis packets, lewton decodes the packets.

use lewton::audio::{PreviousWindowRight, read_audio_packet_generic};
use lewton::header::{IdentHeader, SetupHeader, read_header_ident, read_header_setup};
use lewton::samples::InterleavedSamples;

use crate::decode::{AudioFormat, Decoder};
use crate::error::DecodeError;

pub struct VorbisDecoder {
    headers: Option<(IdentHeader, SetupHeader)>,
    pwr: PreviousWindowRight,
    pager: OggPager,
}

impl VorbisDecoder {
    pub fn new() -> Self {
        Self {
            headers: None,
            pwr: PreviousWindowRight::new(),
            pager: OggPager::default(),
        }
    }
}

impl Default for VorbisDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for VorbisDecoder {
    fn init(&mut self, setup: &[u8]) -> Result<AudioFormat, DecodeError> {
        let mut pager = OggPager::default();
        let packets = pager
            .push(setup)
            .map_err(|e| DecodeError::Fatal(format!("ogg header stream: {e}")))?;
        if packets.len() < 3 {
            return Err(DecodeError::Fatal(format!(
                "expected 3 vorbis header packets, got {}",
                packets.len()
            )));
        }

        let ident = read_header_ident(&packets[0])
            .map_err(|e| DecodeError::Fatal(format!("vorbis ident header: {e:?}")))?;
        // packets[1] is the comment header; nothing in it matters here.
        let setup_hdr = read_header_setup(
            &packets[2],
            ident.audio_channels,
            (ident.blocksize_0, ident.blocksize_1),
        )
        .map_err(|e| DecodeError::Fatal(format!("vorbis setup header: {e:?}")))?;

        let format = AudioFormat {
            sample_rate: ident.audio_sample_rate,
            channels: ident.audio_channels as u16,
            bits_per_sample: 16,
        };
        self.headers = Some((ident, setup_hdr));
        self.pwr = PreviousWindowRight::new();
        self.pager = OggPager::default();
        Ok(format)
    }

    fn decode(&mut self, chunk: &[u8]) -> Result<Vec<f32>, DecodeError> {
        let (ident, setup) = self
            .headers
            .as_ref()
            .ok_or_else(|| DecodeError::Fatal("vorbis decoder not initialized".into()))?;

        let packets = self
            .pager
            .push(chunk)
            .map_err(|e| DecodeError::Recoverable(format!("ogg page: {e}")))?;

        let mut out = Vec::new();
        for packet in packets {
            match read_audio_packet_generic::<InterleavedSamples<f32>>(
                ident, setup, &packet, &mut self.pwr,
            ) {
                Ok(samples) => out.extend_from_slice(&samples.samples),
                Err(e) => {
                    // One bad packet; the stream machinery stays usable.
                    tracing::debug!("vorbis packet skipped: {e:?}");
                }
            }
        }
        Ok(out)
    }

    fn reset(&mut self) {
        self.pwr = PreviousWindowRight::new();
        self.pager = OggPager::default();
    }
}

/// Incremental Ogg page splitter.
///
/// Keeps a byte buffer across calls (pages may straddle chunk boundaries)
/// and a partial packet across pages (lacing value 255 continues a packet).
#[derive(Default)]
struct OggPager {
    buf: Vec<u8>,
    partial: Vec<u8>,
}

impl OggPager {
    /// Append raw bytes and return every packet completed by them.
    fn push(&mut self, bytes: &[u8]) -> Result<Vec<Vec<u8>>, String> {
        self.buf.extend_from_slice(bytes);
        let mut packets = Vec::new();

        loop {
            // Resynchronize on the capture pattern if needed.
            match find_capture(&self.buf) {
                Some(0) => {}
                Some(skip) => {
                    self.buf.drain(..skip);
                }
                None => {
                    // Keep a possible capture-pattern prefix for the next push.
                    let keep = self.buf.len().min(3);
                    self.buf.drain(..self.buf.len() - keep);
                    return Ok(packets);
                }
            }
            if self.buf.len() < 27 {
                return Ok(packets);
            }
            if self.buf[4] != 0 {
                return Err(format!("unsupported ogg version {}", self.buf[4]));
            }
            let nsegs = self.buf[26] as usize;
            let header_len = 27 + nsegs;
            if self.buf.len() < header_len {
                return Ok(packets);
            }
            let body_len: usize = self.buf[27..header_len].iter().map(|&v| v as usize).sum();
            if self.buf.len() < header_len + body_len {
                return Ok(packets);
            }

            let continued = self.buf[5] & 0x01 != 0;
            if !continued && !self.partial.is_empty() {
                // The previous page promised a continuation that never came.
                self.partial.clear();
            }

            let mut offset = header_len;
            for i in 0..nsegs {
                let seg = self.buf[27 + i] as usize;
                self.partial.extend_from_slice(&self.buf[offset..offset + seg]);
                offset += seg;
                if seg < 255 {
                    packets.push(std::mem::take(&mut self.partial));
                }
            }
            self.buf.drain(..header_len + body_len);
        }
    }
}

fn find_capture(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"OggS")
}
