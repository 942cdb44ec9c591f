//! Uncompressed 16-bit PCM codec
//!
//! Samples are written little-endian, interleaved, exactly one frame per
//! payload. Always available; used when Opus is not.

use super::{AudioDecoder, AudioEncoder, CodecKind, CodecParams};
use crate::error::CodecError;

/// Reinterpret a payload as raw PCM if it has exactly the raw frame length
///
/// Replaces the contents of `out` on success. Leaves `out` untouched and
/// returns `false` if the length does not match.
pub fn reinterpret_into(payload: &[u8], params: &CodecParams, out: &mut Vec<i16>) -> bool {
    if payload.len() != params.raw_payload_len() {
        return false;
    }

    out.clear();
    out.extend(
        payload
            .chunks_exact(2)
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]])),
    );
    true
}

/// Raw PCM encoder
pub struct RawEncoder {
    params: CodecParams,
    /// Encoding buffer (reused to avoid allocations)
    encode_buffer: Vec<u8>,
}

impl RawEncoder {
    pub fn new(params: CodecParams) -> Self {
        Self {
            params,
            encode_buffer: Vec::with_capacity(params.raw_payload_len()),
        }
    }
}

impl AudioEncoder for RawEncoder {
    fn encode(&mut self, frame: &[i16]) -> Result<&[u8], CodecError> {
        if frame.len() != self.params.samples_per_frame() {
            return Err(CodecError::InvalidFrameSize(frame.len()));
        }

        self.encode_buffer.clear();
        for &sample in frame {
            self.encode_buffer.extend_from_slice(&sample.to_le_bytes());
        }
        Ok(&self.encode_buffer)
    }

    fn kind(&self) -> CodecKind {
        CodecKind::Raw
    }

    fn params(&self) -> &CodecParams {
        &self.params
    }
}

/// Raw PCM decoder
pub struct RawDecoder {
    params: CodecParams,
}

impl RawDecoder {
    pub fn new(params: CodecParams) -> Self {
        Self { params }
    }
}

impl AudioDecoder for RawDecoder {
    fn decode_into(&mut self, payload: &[u8], out: &mut Vec<i16>) -> Result<(), CodecError> {
        if reinterpret_into(payload, &self.params, out) {
            Ok(())
        } else {
            Err(CodecError::InvalidFrameSize(payload.len()))
        }
    }

    fn kind(&self) -> CodecKind {
        CodecKind::Raw
    }

    fn params(&self) -> &CodecParams {
        &self.params
    }
}
