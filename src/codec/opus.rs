//! Opus codec wrapper
//!
//! Low-latency Opus encoding and decoding bound to fixed session parameters.

use ::opus::{Application, Bitrate, Channels, Decoder, Encoder};

use super::{AudioDecoder, AudioEncoder, CodecKind, CodecParams};
use crate::error::CodecError;

/// Largest Opus packet we ever produce (libopus recommends 4000 bytes)
const MAX_PACKET_BYTES: usize = 4000;

/// 120 ms at 48 kHz stereo, the largest frame libopus can return
const MAX_DECODED_SAMPLES: usize = 48000 * 2 * 120 / 1000;

fn opus_channels(channels: u16) -> Result<Channels, String> {
    match channels {
        1 => Ok(Channels::Mono),
        2 => Ok(Channels::Stereo),
        n => Err(format!("Unsupported channel count: {}", n)),
    }
}

/// Opus only encodes 2.5, 5, 10, 20, 40 or 60 ms frames
fn check_frame_size(params: &CodecParams) -> Result<(), String> {
    if !matches!(params.sample_rate, 8000 | 12000 | 16000 | 24000 | 48000) {
        return Err(format!("Unsupported sample rate: {}", params.sample_rate));
    }

    // Frame duration in units of 2.5 ms
    let quarter_ticks = params.frame_size as u64 * 400;
    let rate = params.sample_rate as u64;
    if quarter_ticks % rate != 0 || !matches!(quarter_ticks / rate, 1 | 2 | 4 | 8 | 16 | 24) {
        return Err(format!(
            "Unsupported frame size: {} samples at {} Hz",
            params.frame_size, params.sample_rate
        ));
    }
    Ok(())
}

/// Opus encoder wrapper
pub struct OpusEncoder {
    encoder: Encoder,
    params: CodecParams,
    /// Encoding buffer (reused to avoid allocations)
    encode_buffer: Vec<u8>,
}

impl OpusEncoder {
    /// Create a new Opus encoder for the session parameters
    pub fn new(params: CodecParams) -> Result<Self, CodecError> {
        check_frame_size(&params).map_err(CodecError::EncoderInit)?;
        let channels = opus_channels(params.channels).map_err(CodecError::EncoderInit)?;

        let mut encoder = Encoder::new(params.sample_rate, channels, Application::Audio)
            .map_err(|e| CodecError::EncoderInit(e.to_string()))?;

        encoder
            .set_bitrate(Bitrate::Bits(params.bitrate as i32))
            .map_err(|e| CodecError::EncoderInit(format!("Failed to set bitrate: {}", e)))?;

        Ok(Self {
            encoder,
            params,
            encode_buffer: vec![0u8; MAX_PACKET_BYTES],
        })
    }
}

impl AudioEncoder for OpusEncoder {
    fn encode(&mut self, frame: &[i16]) -> Result<&[u8], CodecError> {
        if frame.len() != self.params.samples_per_frame() {
            return Err(CodecError::InvalidFrameSize(frame.len()));
        }

        let size = self
            .encoder
            .encode(frame, &mut self.encode_buffer)
            .map_err(|e| CodecError::EncodingFailed(e.to_string()))?;

        Ok(&self.encode_buffer[..size])
    }

    fn kind(&self) -> CodecKind {
        CodecKind::Opus
    }

    fn params(&self) -> &CodecParams {
        &self.params
    }
}

/// Opus decoder wrapper
pub struct OpusDecoder {
    decoder: Decoder,
    params: CodecParams,
    /// Decoding buffer (reused to avoid allocations)
    decode_buffer: Vec<i16>,
}

impl OpusDecoder {
    /// Create a new Opus decoder for the session parameters
    pub fn new(params: CodecParams) -> Result<Self, CodecError> {
        check_frame_size(&params).map_err(CodecError::DecoderInit)?;
        let channels = opus_channels(params.channels).map_err(CodecError::DecoderInit)?;

        let decoder = Decoder::new(params.sample_rate, channels)
            .map_err(|e| CodecError::DecoderInit(e.to_string()))?;

        Ok(Self {
            decoder,
            params,
            decode_buffer: vec![0i16; MAX_DECODED_SAMPLES],
        })
    }
}

impl AudioDecoder for OpusDecoder {
    fn decode_into(&mut self, payload: &[u8], out: &mut Vec<i16>) -> Result<(), CodecError> {
        // An empty payload would ask libopus for concealment, which we never do
        if payload.is_empty() {
            return Err(CodecError::DecodingFailed("empty payload".to_string()));
        }

        let per_channel = self
            .decoder
            .decode(payload, &mut self.decode_buffer, false)
            .map_err(|e| CodecError::DecodingFailed(e.to_string()))?;

        if per_channel != self.params.frame_size {
            return Err(CodecError::InvalidFrameSize(per_channel));
        }

        let total = per_channel * self.params.channels as usize;
        out.clear();
        out.extend_from_slice(&self.decode_buffer[..total]);
        Ok(())
    }

    fn kind(&self) -> CodecKind {
        CodecKind::Opus
    }

    fn params(&self) -> &CodecParams {
        &self.params
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PARAMS: CodecParams = CodecParams {
        sample_rate: 48000,
        channels: 2,
        frame_size: 960,
        bitrate: 64_000,
    };

    fn sine_frame() -> Vec<i16> {
        let mut samples = Vec::with_capacity(PARAMS.samples_per_frame());
        for i in 0..PARAMS.frame_size {
            let t = i as f32 / PARAMS.sample_rate as f32;
            let val = ((t * 440.0 * 2.0 * std::f32::consts::PI).sin() * 8000.0) as i16;
            samples.push(val); // Left
            samples.push(val); // Right
        }
        samples
    }

    #[test]
    fn test_encode_decode_roundtrip_keeps_shape() {
        let mut encoder = OpusEncoder::new(PARAMS).unwrap();
        let mut decoder = OpusDecoder::new(PARAMS).unwrap();

        let encoded = encoder.encode(&sine_frame()).unwrap();
        assert!(!encoded.is_empty());
        assert!(encoded.len() < PARAMS.raw_payload_len()); // Should be compressed

        let frame = decoder.decode(encoded).unwrap();
        assert_eq!(frame.samples.len(), PARAMS.samples_per_frame());
        assert_eq!(frame.channels, 2);
    }

    #[test]
    fn test_rejects_unsupported_parameters() {
        let mut params = PARAMS;
        params.sample_rate = 44100;
        assert!(OpusEncoder::new(params).is_err());

        let mut params = PARAMS;
        params.frame_size = 1000;
        assert!(OpusDecoder::new(params).is_err());

        let mut params = PARAMS;
        params.channels = 3;
        assert!(OpusEncoder::new(params).is_err());
    }

    #[test]
    fn test_accepts_all_opus_frame_durations() {
        for frame_size in [120, 240, 480, 960, 1920, 2880] {
            let mut params = PARAMS;
            params.frame_size = frame_size;
            assert!(OpusEncoder::new(params).is_ok(), "frame size {}", frame_size);
        }
    }

    #[test]
    fn test_empty_payload_is_an_error() {
        let mut decoder = OpusDecoder::new(PARAMS).unwrap();
        assert!(decoder.decode(&[]).is_err());
    }

    #[test]
    fn test_wrong_frame_length_is_rejected() {
        let mut encoder = OpusEncoder::new(PARAMS).unwrap();
        assert!(matches!(
            encoder.encode(&[0i16; 10]),
            Err(CodecError::InvalidFrameSize(10))
        ));
    }
}
