//! Audio codecs
//!
//! A session binds one encoder/decoder pair at start. Opus is preferred when
//! it is compiled in and accepts the session parameters; the raw 16-bit PCM
//! codec is always available and is selected automatically otherwise.
//!
//! Decoding never fails past [`AudioDecoder::decode_or_silence`]: a bad
//! payload becomes either a raw reinterpretation or a silent frame of the
//! session shape.

pub mod raw;
#[cfg(feature = "opus")]
pub mod opus;

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::audio::buffer::PcmFrame;
use crate::error::CodecError;

pub use raw::{RawDecoder, RawEncoder};
#[cfg(feature = "opus")]
pub use self::opus::{OpusDecoder, OpusEncoder};

/// Concrete codec in use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CodecKind {
    Opus,
    Raw,
}

impl std::fmt::Display for CodecKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CodecKind::Opus => write!(f, "opus"),
            CodecKind::Raw => write!(f, "raw-pcm16"),
        }
    }
}

/// Codec requested by configuration
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CodecPreference {
    #[default]
    Opus,
    Raw,
}

/// Per-session codec parameters, fixed at construction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodecParams {
    pub sample_rate: u32,
    pub channels: u16,
    /// Samples per channel in one frame
    pub frame_size: usize,
    /// Target bitrate in bits per second (ignored by raw)
    pub bitrate: u32,
}

impl CodecParams {
    /// Interleaved samples per frame
    pub fn samples_per_frame(&self) -> usize {
        self.frame_size.saturating_mul(self.channels as usize)
    }

    /// Time covered by one frame
    pub fn frame_duration(&self) -> Duration {
        Duration::from_micros((self.frame_size as u64).saturating_mul(1_000_000) / self.sample_rate.max(1) as u64)
    }

    /// Byte length of one frame in the raw codec
    pub fn raw_payload_len(&self) -> usize {
        self.samples_per_frame().saturating_mul(2)
    }

    pub fn validate(&self) -> Result<(), CodecError> {
        if self.sample_rate == 0 || self.channels == 0 || self.frame_size == 0 {
            return Err(CodecError::Unsupported(format!(
                "{} Hz / {} ch / {} samples",
                self.sample_rate, self.channels, self.frame_size
            )));
        }
        Ok(())
    }
}

/// Converts one PCM frame into a payload
pub trait AudioEncoder: Send {
    /// Encode exactly one interleaved frame of the session shape
    ///
    /// The payload borrows the encoder's internal buffer, so the capture
    /// path does not allocate.
    fn encode(&mut self, frame: &[i16]) -> Result<&[u8], CodecError>;

    fn kind(&self) -> CodecKind;

    fn params(&self) -> &CodecParams;
}

/// Result of decoding at the pipeline boundary
#[derive(Debug, Clone)]
pub enum DecodeOutcome {
    /// Decoded by the session codec
    Decoded(PcmFrame),
    /// Codec rejected the payload but it had the exact raw frame length
    Reinterpreted(PcmFrame),
    /// Substituted silence
    Silence(PcmFrame),
}

impl DecodeOutcome {
    pub fn into_frame(self) -> PcmFrame {
        match self {
            DecodeOutcome::Decoded(frame)
            | DecodeOutcome::Reinterpreted(frame)
            | DecodeOutcome::Silence(frame) => frame,
        }
    }

    pub fn is_substitute(&self) -> bool {
        !matches!(self, DecodeOutcome::Decoded(_))
    }
}

/// Reconstructs a PCM frame from a payload
pub trait AudioDecoder: Send {
    /// Decode one payload into `out`, replacing its contents
    ///
    /// On success `out` holds exactly one frame of the session shape. On
    /// failure its contents are unspecified.
    fn decode_into(&mut self, payload: &[u8], out: &mut Vec<i16>) -> Result<(), CodecError>;

    fn kind(&self) -> CodecKind;

    fn params(&self) -> &CodecParams;

    /// Decode one payload into a freshly allocated frame, or fail
    fn decode(&mut self, payload: &[u8]) -> Result<PcmFrame, CodecError> {
        let mut samples = Vec::new();
        self.decode_into(payload, &mut samples)?;
        Ok(PcmFrame::new(samples, self.params().channels))
    }

    /// Decode without ever failing
    fn decode_or_silence(&mut self, payload: &[u8]) -> DecodeOutcome {
        self.decode_or_silence_with(payload, Vec::new())
    }

    /// Same as [`decode_or_silence`](Self::decode_or_silence), writing into
    /// a recycled sample buffer so steady-state decoding does not allocate
    fn decode_or_silence_with(&mut self, payload: &[u8], spare: Vec<i16>) -> DecodeOutcome {
        let mut samples = spare;
        let params = *self.params();

        match self.decode_into(payload, &mut samples) {
            Ok(()) => DecodeOutcome::Decoded(PcmFrame::new(samples, params.channels)),
            Err(e) => {
                tracing::debug!("{} decode failed ({} bytes): {}", self.kind(), payload.len(), e);
                if raw::reinterpret_into(payload, &params, &mut samples) {
                    DecodeOutcome::Reinterpreted(PcmFrame::new(samples, params.channels))
                } else {
                    samples.clear();
                    samples.resize(params.samples_per_frame(), 0);
                    DecodeOutcome::Silence(PcmFrame::new(samples, params.channels))
                }
            }
        }
    }
}

/// Encoder/decoder pair chosen for a session
pub struct CodecSelection {
    pub kind: CodecKind,
    pub encoder: Box<dyn AudioEncoder>,
    pub decoder: Box<dyn AudioDecoder>,
    /// Why the preferred codec was not used, if it was not
    pub fallback_reason: Option<String>,
}

impl std::fmt::Debug for CodecSelection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodecSelection")
            .field("kind", &self.kind)
            .field("fallback_reason", &self.fallback_reason)
            .finish()
    }
}

/// Pick the best codec for `params`
pub fn negotiate(params: CodecParams, preference: CodecPreference) -> Result<CodecSelection, CodecError> {
    params.validate()?;

    let fallback_reason = match preference {
        CodecPreference::Raw => None,
        CodecPreference::Opus => match open_opus(&params) {
            Ok((encoder, decoder)) => {
                tracing::info!(
                    "Opus codec selected ({} Hz, {} ch, {} samples, {} bps)",
                    params.sample_rate,
                    params.channels,
                    params.frame_size,
                    params.bitrate
                );
                return Ok(CodecSelection {
                    kind: CodecKind::Opus,
                    encoder,
                    decoder,
                    fallback_reason: None,
                });
            }
            Err(e) => {
                tracing::warn!("Opus not available, using uncompressed audio: {}", e);
                Some(e.to_string())
            }
        },
    };

    Ok(CodecSelection {
        kind: CodecKind::Raw,
        encoder: Box::new(RawEncoder::new(params)),
        decoder: Box::new(RawDecoder::new(params)),
        fallback_reason,
    })
}

#[cfg(feature = "opus")]
fn open_opus(params: &CodecParams) -> Result<(Box<dyn AudioEncoder>, Box<dyn AudioDecoder>), CodecError> {
    let encoder = OpusEncoder::new(*params)?;
    let decoder = OpusDecoder::new(*params)?;
    Ok((Box::new(encoder), Box::new(decoder)))
}

#[cfg(not(feature = "opus"))]
fn open_opus(_params: &CodecParams) -> Result<(Box<dyn AudioEncoder>, Box<dyn AudioDecoder>), CodecError> {
    Err(CodecError::Unsupported("built without Opus support".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(sample_rate: u32, channels: u16) -> CodecParams {
        CodecParams {
            sample_rate,
            channels,
            frame_size: 960,
            bitrate: 64_000,
        }
    }

    #[test]
    fn test_raw_preference_has_no_fallback_reason() {
        let selection = negotiate(params(48000, 2), CodecPreference::Raw).unwrap();
        assert_eq!(selection.kind, CodecKind::Raw);
        assert_eq!(selection.encoder.kind(), CodecKind::Raw);
        assert!(selection.fallback_reason.is_none());
    }

    #[test]
    fn test_unsupported_rate_falls_back_to_raw() {
        // Opus has no 44.1 kHz mode
        let selection = negotiate(params(44100, 2), CodecPreference::Opus).unwrap();
        assert_eq!(selection.kind, CodecKind::Raw);
        assert_eq!(selection.decoder.kind(), CodecKind::Raw);
        assert!(selection.fallback_reason.is_some());
    }

    #[cfg(feature = "opus")]
    #[test]
    fn test_opus_selected_when_supported() {
        let selection = negotiate(params(48000, 2), CodecPreference::Opus).unwrap();
        assert_eq!(selection.kind, CodecKind::Opus);
        assert!(selection.fallback_reason.is_none());
    }

    #[cfg(not(feature = "opus"))]
    #[test]
    fn test_opus_missing_falls_back() {
        let selection = negotiate(params(48000, 2), CodecPreference::Opus).unwrap();
        assert_eq!(selection.kind, CodecKind::Raw);
        assert!(selection.fallback_reason.unwrap().contains("without Opus"));
    }

    #[test]
    fn test_zero_shape_is_rejected() {
        assert!(negotiate(params(48000, 0), CodecPreference::Raw).is_err());
    }

    #[test]
    fn test_garbage_payload_becomes_silence() {
        let mut selection = negotiate(params(48000, 2), CodecPreference::Opus).unwrap();
        let outcome = selection.decoder.decode_or_silence(&[0xFF; 3]);
        assert!(outcome.is_substitute());

        let frame = outcome.into_frame();
        assert_eq!(frame.samples.len(), 1920);
        assert_eq!(frame.channels, 2);
    }

    #[test]
    fn test_raw_sized_payload_is_reinterpreted_by_any_decoder() {
        let p = params(48000, 1);
        let mut selection = negotiate(p, CodecPreference::Opus).unwrap();

        let samples: Vec<i16> = (0..960).map(|i| i as i16).collect();
        let mut encoder = RawEncoder::new(p);
        let payload = encoder.encode(&samples).unwrap();

        let frame = selection.decoder.decode_or_silence(payload).into_frame();
        assert_eq!(frame.samples, samples);
    }

    #[test]
    fn test_decode_reuses_spare_buffer() {
        let p = params(48000, 2);
        let mut encoder = RawEncoder::new(p);
        let mut decoder = RawDecoder::new(p);
        let payload = encoder.encode(&vec![7i16; 1920]).unwrap().to_vec();

        let spare = Vec::with_capacity(p.samples_per_frame());
        let spare_ptr = spare.as_ptr();
        let outcome = decoder.decode_or_silence_with(&payload, spare);
        assert!(!outcome.is_substitute());

        let frame = outcome.into_frame();
        assert_eq!(frame.samples.as_ptr(), spare_ptr);
        assert_eq!(frame.samples, vec![7i16; 1920]);
    }

    #[test]
    fn test_silence_reuses_spare_buffer() {
        let p = params(48000, 2);
        let mut decoder = RawDecoder::new(p);

        // Stale samples from an earlier frame must not leak into the silence
        let spare = vec![1234i16; p.samples_per_frame()];
        let spare_ptr = spare.as_ptr();
        let outcome = decoder.decode_or_silence_with(&[0xFF; 3], spare);
        assert!(matches!(outcome, DecodeOutcome::Silence(_)));

        let frame = outcome.into_frame();
        assert_eq!(frame.samples.as_ptr(), spare_ptr);
        assert_eq!(frame.samples.len(), 1920);
        assert!(frame.is_silent());
    }
}
