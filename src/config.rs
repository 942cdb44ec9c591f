//! Configuration management

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::codec::{CodecParams, CodecPreference};
use crate::constants::*;
use crate::protocol::HEADER_SIZE;

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Network configuration
    pub network: NetworkConfig,

    /// Audio configuration
    pub audio: AudioConfig,
}

/// Network configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Remote peer IP address
    pub peer_address: String,

    /// Port on the peer that receives our audio
    pub send_port: u16,

    /// Local port we receive audio on (0 = OS assigned)
    pub receive_port: u16,

    /// Local bind address for the receive socket
    pub bind_address: String,

    /// Socket send buffer size
    pub send_buffer_size: usize,

    /// Socket receive buffer size
    pub recv_buffer_size: usize,

    /// Receive timeout in milliseconds
    pub recv_timeout_ms: u64,

    /// Enable SO_REUSEADDR on the receive socket
    ///
    /// Off by default so a port held by another session fails the bind.
    pub reuse_address: bool,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            peer_address: "192.168.1.100".to_string(),
            send_port: DEFAULT_SEND_PORT,
            receive_port: DEFAULT_RECEIVE_PORT,
            bind_address: "0.0.0.0".to_string(),
            send_buffer_size: DEFAULT_SOCKET_BUFFER_SIZE,
            recv_buffer_size: DEFAULT_SOCKET_BUFFER_SIZE,
            recv_timeout_ms: DEFAULT_RECV_TIMEOUT_MS,
            reuse_address: false,
        }
    }
}

impl NetworkConfig {
    /// Resolve the peer's audio address
    pub fn peer_socket_addr(&self) -> crate::Result<SocketAddr> {
        if self.send_port == 0 {
            return Err(crate::Error::Config("send port must be non-zero".to_string()));
        }

        let host = self.peer_address.trim();
        if host.is_empty() {
            return Err(crate::Error::Config("peer address is empty".to_string()));
        }

        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(SocketAddr::new(ip, self.send_port));
        }

        // Dotted numbers that failed to parse are a typo, not a host name
        if host.chars().all(|c| c.is_ascii_digit() || c == '.') {
            return Err(crate::Error::Config(format!("invalid peer address '{}'", host)));
        }

        (host, self.send_port)
            .to_socket_addrs()
            .map_err(|e| crate::Error::Config(format!("cannot resolve peer '{}': {}", host, e)))?
            .next()
            .ok_or_else(|| crate::Error::Config(format!("peer '{}' has no addresses", host)))
    }

    /// Local address the receiver binds to
    pub fn receive_socket_addr(&self) -> crate::Result<SocketAddr> {
        let ip: IpAddr = self.bind_address.trim().parse().map_err(|e| {
            crate::Error::Config(format!("invalid bind address '{}': {}", self.bind_address, e))
        })?;
        Ok(SocketAddr::new(ip, self.receive_port))
    }

    pub fn recv_timeout(&self) -> Duration {
        Duration::from_millis(self.recv_timeout_ms)
    }
}

/// Audio configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Sample rate in Hz
    pub sample_rate: u32,

    /// Channel count
    pub channels: u16,

    /// Samples per channel in one frame
    pub frame_size: usize,

    /// Target bitrate for compressed codecs
    pub bitrate: u32,

    /// Jitter buffer depth in frames
    pub buffer_depth: usize,

    /// Preferred codec
    pub codec: CodecPreference,

    /// Capture device id (None = default)
    pub input_device: Option<String>,

    /// Playback device id (None = default)
    pub output_device: Option<String>,

    /// Prefer a loopback (system output) source when no input is selected
    pub loopback: bool,

    /// Playback volume (0.0 - 1.0)
    pub volume: f32,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: DEFAULT_SAMPLE_RATE,
            channels: DEFAULT_CHANNELS,
            frame_size: DEFAULT_FRAME_SIZE,
            bitrate: DEFAULT_BITRATE,
            buffer_depth: DEFAULT_BUFFER_DEPTH,
            codec: CodecPreference::default(),
            input_device: None,
            output_device: None,
            loopback: true,
            volume: 1.0,
        }
    }
}

impl AudioConfig {
    /// Codec parameters bound for the session
    pub fn codec_params(&self) -> CodecParams {
        CodecParams {
            sample_rate: self.sample_rate,
            channels: self.channels,
            frame_size: self.frame_size,
            bitrate: self.bitrate,
        }
    }

    /// Interleaved samples per frame
    pub fn samples_per_frame(&self) -> usize {
        self.frame_size.saturating_mul(self.channels as usize)
    }

    /// Frame period
    pub fn frame_duration(&self) -> Duration {
        self.codec_params().frame_duration()
    }

    /// Jitter buffer capacity in frames
    pub fn buffer_capacity(&self) -> usize {
        self.buffer_depth * 2
    }
}

impl AppConfig {
    /// Load configuration from file
    pub fn load(path: &Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| crate::Error::Config(e.to_string()))?;
        Ok(config)
    }

    /// Load configuration, falling back to defaults if the file is missing or invalid
    pub fn load_or_default(path: &Path) -> Self {
        if !path.exists() {
            return Self::default();
        }
        match Self::load(path) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("Ignoring config file {}: {}", path.display(), e);
                Self::default()
            }
        }
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> crate::Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::Error::Config(e.to_string()))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Get default config file path
    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("com", "audio-streamer", "lan-audio-relay")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Check everything that must hold before a session may start
    pub fn validate(&self) -> crate::Result<SocketAddr> {
        let audio = &self.audio;

        if !(1..=2).contains(&audio.channels) {
            return Err(crate::Error::Config(format!(
                "unsupported channel count: {}",
                audio.channels
            )));
        }
        if audio.sample_rate == 0 {
            return Err(crate::Error::Config("sample rate must be non-zero".to_string()));
        }
        if audio.frame_size == 0 {
            return Err(crate::Error::Config("frame size must be non-zero".to_string()));
        }
        if audio.buffer_depth == 0 {
            return Err(crate::Error::Config("buffer depth must be non-zero".to_string()));
        }

        // The raw fallback is the largest payload we can produce
        let raw_datagram = audio
            .frame_size
            .checked_mul(audio.channels as usize)
            .and_then(|samples| samples.checked_mul(2))
            .and_then(|bytes| bytes.checked_add(HEADER_SIZE));
        match raw_datagram {
            Some(len) if len <= MAX_DATAGRAM_SIZE => {}
            Some(len) => {
                return Err(crate::Error::Config(format!(
                    "frame of {} samples does not fit in one datagram ({} > {} bytes)",
                    audio.samples_per_frame(),
                    len,
                    MAX_DATAGRAM_SIZE
                )));
            }
            None => {
                return Err(crate::Error::Config(format!(
                    "frame size {} is too large",
                    audio.frame_size
                )));
            }
        }

        self.network.receive_socket_addr()?;
        self.network.peer_socket_addr()
    }
}
