//! Bidirectional streamer
//!
//! One sender and one receiver sharing a lifecycle. Start is all-or-nothing:
//! if either half fails to open, the other is torn down and the streamer
//! stays idle.

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::net::SocketAddr;

use crate::config::NetworkConfig;
use crate::error::NetworkError;
use crate::network::receiver::{AudioReceiver, PacketCallback, ReceiverStats};
use crate::network::sender::{AudioSender, SenderStats};

/// Streamer lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamerState {
    Idle,
    Starting,
    Streaming,
    Stopping,
}

/// Sender and receiver under one lifecycle
pub struct AudioStreamer {
    sender: AudioSender,
    receiver: AudioReceiver,
    state: RwLock<StreamerState>,
    /// Serializes start/stop
    lifecycle: Mutex<()>,
}

impl AudioStreamer {
    pub fn new(
        config: &NetworkConfig,
        target: SocketAddr,
        bind_addr: SocketAddr,
        on_receive: PacketCallback,
    ) -> Self {
        Self {
            sender: AudioSender::new(config, target),
            receiver: AudioReceiver::new(config, bind_addr, on_receive),
            state: RwLock::new(StreamerState::Idle),
            lifecycle: Mutex::new(()),
        }
    }

    /// Build from configured peer and local addresses
    pub fn from_config(config: &NetworkConfig, on_receive: PacketCallback) -> crate::Result<Self> {
        let target = config.peer_socket_addr()?;
        let bind_addr = config.receive_socket_addr()?;
        Ok(Self::new(config, target, bind_addr, on_receive))
    }

    /// Open both sockets
    ///
    /// Does nothing if already streaming.
    pub fn start(&self) -> Result<(), NetworkError> {
        let _guard = self.lifecycle.lock();
        if *self.state.read() == StreamerState::Streaming {
            return Ok(());
        }

        *self.state.write() = StreamerState::Starting;

        if let Err(e) = self.sender.start() {
            *self.state.write() = StreamerState::Idle;
            return Err(e);
        }

        if let Err(e) = self.receiver.start() {
            self.sender.stop();
            *self.state.write() = StreamerState::Idle;
            return Err(e);
        }

        *self.state.write() = StreamerState::Streaming;
        Ok(())
    }

    /// Close both sockets
    pub fn stop(&self) {
        let _guard = self.lifecycle.lock();
        if *self.state.read() == StreamerState::Idle {
            return;
        }

        *self.state.write() = StreamerState::Stopping;
        self.sender.stop();
        self.receiver.stop();
        *self.state.write() = StreamerState::Idle;
    }

    /// Send one encoded frame, see [`AudioSender::send`]
    pub fn send(&self, payload: &[u8]) -> Option<u32> {
        self.sender.send(payload)
    }

    /// Redirect outgoing audio without restarting
    pub fn update_target(&self, target: SocketAddr) {
        self.sender.update_target(target);
    }

    pub fn state(&self) -> StreamerState {
        *self.state.read()
    }

    pub fn is_streaming(&self) -> bool {
        self.state() == StreamerState::Streaming
    }

    /// Address we receive audio on, once started
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.receiver.local_addr()
    }

    pub fn target(&self) -> SocketAddr {
        self.sender.target()
    }

    pub fn stats(&self) -> StreamerStats {
        StreamerStats {
            state: self.state(),
            sender: self.sender.stats(),
            receiver: self.receiver.stats(),
        }
    }
}

impl Drop for AudioStreamer {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Combined statistics snapshot
#[derive(Debug, Clone, Serialize)]
pub struct StreamerStats {
    pub state: StreamerState,
    pub sender: SenderStats,
    pub receiver: ReceiverStats,
}
