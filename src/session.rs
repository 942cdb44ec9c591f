//! Audio session
//!
//! Wires one peer's pipeline together:
//!
//! ```text
//! FrameSource ─▶ encode ─▶ AudioStreamer::send
//! AudioStreamer (recv thread) ─▶ decode_or_silence ─▶ JitterBuffer ─▶ FrameSink
//! ```
//!
//! Start is all-or-nothing; whatever already started is torn down in reverse
//! order if a later stage fails.

use parking_lot::Mutex;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::audio::buffer::{create_shared_buffer, JitterStats, SharedJitterBuffer};
use crate::audio::{FrameSink, FrameSource};
use crate::codec::{negotiate, CodecKind};
use crate::config::AppConfig;
use crate::error::AudioError;
use crate::network::receiver::ReceivedPacket;
use crate::network::streamer::{AudioStreamer, StreamerStats};

/// Log the first encode failure and then every this many
const ENCODE_ERROR_LOG_INTERVAL: u64 = 1000;

#[derive(Default)]
struct CodecCounters {
    frames_encoded: AtomicU64,
    encode_errors: AtomicU64,
    frames_decoded: AtomicU64,
    decode_fallbacks: AtomicU64,
}

/// Codec diagnostics
#[derive(Debug, Clone, Serialize)]
pub struct CodecStats {
    pub kind: CodecKind,
    pub frames_encoded: u64,
    pub encode_errors: u64,
    pub frames_decoded: u64,
    /// Payloads replaced by a raw reinterpretation or silence
    pub decode_fallbacks: u64,
}

/// Session statistics snapshot
#[derive(Debug, Clone, Serialize)]
pub struct SessionStats {
    pub streamer: StreamerStats,
    pub playback: JitterStats,
    pub codec: CodecStats,
}

/// A running bidirectional audio session
pub struct AudioSession {
    config: AppConfig,
    streamer: Arc<AudioStreamer>,
    buffer: SharedJitterBuffer,
    source: Box<dyn FrameSource>,
    sink: Box<dyn FrameSink>,
    codec_kind: CodecKind,
    codec_fallback: Option<String>,
    counters: Arc<CodecCounters>,
    running: bool,
}

impl AudioSession {
    /// Validate `config`, pick codecs and start sink, network and source
    pub fn start(
        config: AppConfig,
        mut source: Box<dyn FrameSource>,
        mut sink: Box<dyn FrameSink>,
    ) -> crate::Result<Self> {
        let peer = config.validate()?;
        let selection = negotiate(config.audio.codec_params(), config.audio.codec)?;
        let codec_kind = selection.kind;
        let codec_fallback = selection.fallback_reason;

        let buffer = create_shared_buffer(config.audio.buffer_depth);
        buffer.set_volume(config.audio.volume);

        let counters = Arc::new(CodecCounters::default());

        let on_receive = {
            let decoder = Mutex::new(selection.decoder);
            let buffer = buffer.clone();
            let counters = counters.clone();
            Arc::new(move |packet: ReceivedPacket| {
                let spare = buffer.take_spare().unwrap_or_default();
                let outcome = decoder.lock().decode_or_silence_with(&packet.payload, spare);
                if outcome.is_substitute() {
                    counters.decode_fallbacks.fetch_add(1, Ordering::Relaxed);
                } else {
                    counters.frames_decoded.fetch_add(1, Ordering::Relaxed);
                }
                buffer.push(outcome.into_frame());
            })
        };

        let streamer = Arc::new(AudioStreamer::new(
            &config.network,
            peer,
            config.network.receive_socket_addr()?,
            on_receive,
        ));

        sink.start(buffer.clone())?;

        if let Err(e) = streamer.start() {
            sink.stop();
            return Err(e.into());
        }

        let on_frame = {
            let mut encoder = selection.encoder;
            let streamer = streamer.clone();
            let counters = counters.clone();
            Box::new(move |frame: &[i16]| match encoder.encode(frame) {
                Ok(payload) => {
                    counters.frames_encoded.fetch_add(1, Ordering::Relaxed);
                    streamer.send(payload);
                }
                Err(e) => {
                    let errors = counters.encode_errors.fetch_add(1, Ordering::Relaxed) + 1;
                    if errors == 1 || errors % ENCODE_ERROR_LOG_INTERVAL == 0 {
                        tracing::warn!("Failed to encode frame ({} failures): {}", errors, e);
                    }
                }
            })
        };

        if let Err(e) = source.start(on_frame) {
            streamer.stop();
            sink.stop();
            return Err(e.into());
        }

        tracing::info!(
            "Session started: {} -> {}, receiving on {}, codec {}",
            source.name(),
            peer,
            streamer
                .local_addr()
                .map(|a| a.to_string())
                .unwrap_or_else(|| "?".to_string()),
            codec_kind
        );

        Ok(Self {
            config,
            streamer,
            buffer,
            source,
            sink,
            codec_kind,
            codec_fallback,
            counters,
            running: true,
        })
    }

    /// Stop source, network and sink; idempotent
    pub fn stop(&mut self) {
        if !self.running {
            return;
        }
        self.running = false;

        self.source.stop();
        self.streamer.stop();
        self.sink.stop();
        self.buffer.clear();

        tracing::info!("Session stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Set playback volume; affects audio already buffered
    pub fn set_volume(&self, volume: f32) {
        self.buffer.set_volume(volume);
    }

    pub fn volume(&self) -> f32 {
        self.buffer.volume()
    }

    /// Redirect outgoing audio without restarting
    pub fn update_target(&self, target: SocketAddr) {
        self.streamer.update_target(target);
    }

    /// Address we receive audio on
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.streamer.local_addr()
    }

    pub fn codec_kind(&self) -> CodecKind {
        self.codec_kind
    }

    /// Why the preferred codec was not used, if it was not
    pub fn codec_fallback(&self) -> Option<&str> {
        self.codec_fallback.as_deref()
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn source_name(&self) -> &str {
        self.source.name()
    }

    pub fn sink_name(&self) -> &str {
        self.sink.name()
    }

    /// Drain asynchronous errors reported by the devices
    pub fn poll_device_errors(&mut self) -> Vec<AudioError> {
        let mut errors = Vec::new();
        while let Some(e) = self.source.poll_error() {
            errors.push(e);
        }
        while let Some(e) = self.sink.poll_error() {
            errors.push(e);
        }
        errors
    }

    pub fn stats(&self) -> SessionStats {
        SessionStats {
            streamer: self.streamer.stats(),
            playback: self.buffer.stats(),
            codec: CodecStats {
                kind: self.codec_kind,
                frames_encoded: self.counters.frames_encoded.load(Ordering::Relaxed),
                encode_errors: self.counters.encode_errors.load(Ordering::Relaxed),
                frames_decoded: self.counters.frames_decoded.load(Ordering::Relaxed),
                decode_fallbacks: self.counters.decode_fallbacks.load(Ordering::Relaxed),
            },
        }
    }
}

impl Drop for AudioSession {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::{NullSink, SyntheticSource};
    use crate::codec::CodecPreference;
    use crate::error::Error;

    fn local_config() -> AppConfig {
        let mut config = AppConfig::default();
        config.network.peer_address = "127.0.0.1".to_string();
        config.network.receive_port = 0;
        config.network.recv_timeout_ms = 20;
        config.audio.codec = CodecPreference::Raw;
        config
    }

    fn devices(config: &AppConfig) -> (Box<dyn FrameSource>, Box<dyn FrameSink>) {
        let params = config.audio.codec_params();
        (
            Box::new(SyntheticSource::silence(params)),
            Box::new(NullSink::new(params)),
        )
    }

    #[test]
    fn test_invalid_config_is_rejected_before_anything_starts() {
        let mut config = local_config();
        config.audio.channels = 0;
        let (source, sink) = devices(&config);
        assert!(matches!(
            AudioSession::start(config, source, sink),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_start_stop() {
        let config = local_config();
        let (source, sink) = devices(&config);
        let mut session = AudioSession::start(config, source, sink).unwrap();

        assert!(session.is_running());
        assert_eq!(session.codec_kind(), CodecKind::Raw);
        assert!(session.local_addr().is_some());
        assert_eq!(session.source_name(), "synthetic silence");

        session.stop();
        session.stop();
        assert!(!session.is_running());
        assert_eq!(session.local_addr(), None);
    }

    #[test]
    fn test_volume_is_applied_and_clamped() {
        let mut config = local_config();
        config.audio.volume = 0.5;
        let (source, sink) = devices(&config);
        let session = AudioSession::start(config, source, sink).unwrap();

        assert_eq!(session.volume(), 0.5);
        session.set_volume(1.5);
        assert_eq!(session.volume(), 1.0);
    }

    #[test]
    fn test_stats_serialize_to_json() {
        let config = local_config();
        let (source, sink) = devices(&config);
        let session = AudioSession::start(config, source, sink).unwrap();

        let json = serde_json::to_value(session.stats()).unwrap();
        assert_eq!(json["codec"]["kind"], "raw");
        assert_eq!(json["playback"]["capacity"], 20);
        assert!(json["streamer"]["receiver"]["packets_lost"].is_u64());
    }
}
