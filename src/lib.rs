//! # LAN Audio Relay
//!
//! Near-real-time bidirectional audio between two peers over UDP.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────── PEER A ────────────────────────────────┐
//! │                                                                        │
//! │  FrameSource ──▶ AudioEncoder ──▶ protocol::pack ──▶ AudioSender ──────┼──▶ UDP
//! │  (device cb)      (opus / raw)     12-byte header     seq + stats      │
//! │                                                                        │
//! │  FrameSink ◀── JitterBuffer ◀── AudioDecoder ◀── AudioReceiver ◀───────┼─── UDP
//! │  (device cb)   drop-oldest      decode_or_silence  recv thread,        │
//! │   volume       2 × depth                          loss estimation      │
//! │                                                                        │
//! │              AudioStreamer = AudioSender + AudioReceiver               │
//! │              AudioSession  = streamer + codecs + devices               │
//! └────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Peer B runs the same pipeline with the ports swapped. Each direction is
//! independent; nothing on the steady-state path is fatal.

pub mod audio;
pub mod codec;
pub mod config;
pub mod error;
pub mod network;
pub mod protocol;
pub mod session;

pub use error::{Error, Result};
pub use session::{AudioSession, SessionStats};

/// Application-wide constants
pub mod constants {
    /// Default sample rate for audio processing
    pub const DEFAULT_SAMPLE_RATE: u32 = 48000;

    /// Default channel count (stereo)
    pub const DEFAULT_CHANNELS: u16 = 2;

    /// Default frame size in samples per channel (20 ms at 48 kHz)
    pub const DEFAULT_FRAME_SIZE: usize = 960;

    /// Default Opus bitrate in bits per second
    pub const DEFAULT_BITRATE: u32 = 64_000;

    /// Default port the peer listens on for our audio
    pub const DEFAULT_SEND_PORT: u16 = 5001;

    /// Default local receive port
    pub const DEFAULT_RECEIVE_PORT: u16 = 5002;

    /// Default jitter buffer depth in frames (capacity is twice this)
    pub const DEFAULT_BUFFER_DEPTH: usize = 10;

    /// Socket buffer size for both directions
    pub const DEFAULT_SOCKET_BUFFER_SIZE: usize = 64 * 1024;

    /// Receive timeout; bounds how long a stop request can go unnoticed
    pub const DEFAULT_RECV_TIMEOUT_MS: u64 = 500;

    /// Largest UDP payload that fits in a single IPv4 datagram
    pub const MAX_DATAGRAM_SIZE: usize = 65507;

    /// Forward sequence gaps at or above this are treated as a stream reset
    pub const LARGE_GAP_THRESHOLD: u32 = 1000;
}
