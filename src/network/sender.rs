//! Audio packet sender
//!
//! Sends one datagram per encoded frame, directly from the calling thread.
//! There is no queue: the capture callback packs and transmits synchronously,
//! and a failed send is logged and dropped.

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::cell::RefCell;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use crate::config::NetworkConfig;
use crate::error::NetworkError;
use crate::network::udp::create_send_socket;
use crate::protocol::{now_millis, pack_into};

/// Log the first failure and then every this many
const SEND_ERROR_LOG_INTERVAL: u64 = 1000;

thread_local! {
    /// Packet assembly buffer, one per sending thread
    static PACKET_BUFFER: RefCell<Vec<u8>> = const { RefCell::new(Vec::new()) };
}

/// Outbound half of a session
pub struct AudioSender {
    config: NetworkConfig,

    /// Where datagrams go; may change while running
    target: Mutex<SocketAddr>,

    /// Open socket, `None` when stopped
    socket: RwLock<Option<Arc<UdpSocket>>>,

    /// Next sequence number, wraps at 2^32
    sequence: AtomicU32,

    packets_sent: AtomicU64,
    bytes_sent: AtomicU64,
    send_errors: AtomicU64,
}

impl AudioSender {
    /// Create a stopped sender
    pub fn new(config: &NetworkConfig, target: SocketAddr) -> Self {
        Self {
            config: config.clone(),
            target: Mutex::new(target),
            socket: RwLock::new(None),
            sequence: AtomicU32::new(0),
            packets_sent: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            send_errors: AtomicU64::new(0),
        }
    }

    /// Open the socket and start a new session
    ///
    /// Sequence numbers and counters restart from zero. Calling this on a
    /// running sender does nothing.
    pub fn start(&self) -> Result<(), NetworkError> {
        let mut socket = self.socket.write();
        if socket.is_some() {
            return Ok(());
        }

        let target = *self.target.lock();
        let new_socket = create_send_socket(&self.config, target)?;

        self.sequence.store(0, Ordering::SeqCst);
        self.packets_sent.store(0, Ordering::Relaxed);
        self.bytes_sent.store(0, Ordering::Relaxed);
        self.send_errors.store(0, Ordering::Relaxed);

        *socket = Some(Arc::new(new_socket));
        tracing::info!("UDP sender started -> {}", target);
        Ok(())
    }

    /// Close the socket
    pub fn stop(&self) {
        if self.socket.write().take().is_some() {
            tracing::info!(
                "UDP sender stopped (sent {} packets, {} bytes)",
                self.packets_sent(),
                self.bytes_sent()
            );
        }
    }

    /// Frame `payload` and send it to the current target
    ///
    /// Does nothing if stopped. Returns the sequence number of a datagram that
    /// was handed to the OS. A sequence number is consumed even when the send
    /// fails, so the peer counts the datagram as lost. This includes payloads
    /// rejected before reaching the socket, such as `PacketTooLarge`.
    pub fn send(&self, payload: &[u8]) -> Option<u32> {
        let socket = match self.socket.read().as_ref() {
            Some(socket) => Arc::clone(socket),
            None => return None,
        };
        let target = *self.target.lock();
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);

        let result = PACKET_BUFFER.with(|buffer| {
            let mut buffer = buffer.borrow_mut();
            pack_into(sequence, now_millis(), payload, &mut buffer)?;
            socket
                .send_to(&buffer, target)
                .map_err(|e| NetworkError::SendFailed(e.to_string()))
        });

        match result {
            Ok(sent) => {
                self.packets_sent.fetch_add(1, Ordering::Relaxed);
                self.bytes_sent.fetch_add(sent as u64, Ordering::Relaxed);
                Some(sequence)
            }
            Err(e) => {
                let errors = self.send_errors.fetch_add(1, Ordering::Relaxed) + 1;
                if errors == 1 || errors % SEND_ERROR_LOG_INTERVAL == 0 {
                    tracing::warn!("Failed to send packet to {} ({} failures): {}", target, errors, e);
                }
                None
            }
        }
    }

    /// Redirect subsequent sends
    pub fn update_target(&self, target: SocketAddr) {
        let mut current = self.target.lock();
        if *current != target {
            tracing::info!("UDP sender target {} -> {}", *current, target);
            *current = target;
        }
    }

    pub fn target(&self) -> SocketAddr {
        *self.target.lock()
    }

    /// Check if running
    pub fn is_running(&self) -> bool {
        self.socket.read().is_some()
    }

    /// Local address of the open socket
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.read().as_ref().and_then(|s| s.local_addr().ok())
    }

    /// Get packets sent count
    pub fn packets_sent(&self) -> u64 {
        self.packets_sent.load(Ordering::Relaxed)
    }

    /// Get bytes sent count
    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> SenderStats {
        SenderStats {
            packets_sent: self.packets_sent(),
            bytes_sent: self.bytes_sent(),
            send_errors: self.send_errors.load(Ordering::Relaxed),
        }
    }
}

impl Drop for AudioSender {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Sender statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct SenderStats {
    pub packets_sent: u64,
    /// Header plus payload
    pub bytes_sent: u64,
    pub send_errors: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{unpack, HEADER_SIZE};
    use bytes::Bytes;
    use std::time::Duration;

    fn listener() -> (UdpSocket, SocketAddr) {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        socket.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        let addr = socket.local_addr().unwrap();
        (socket, addr)
    }

    fn recv(socket: &UdpSocket) -> (u32, u64, Bytes) {
        let mut buf = [0u8; 2048];
        let (n, _) = socket.recv_from(&mut buf).unwrap();
        unpack(Bytes::copy_from_slice(&buf[..n])).unwrap()
    }

    #[test]
    fn test_send_before_start_is_noop() {
        let (_socket, addr) = listener();
        let sender = AudioSender::new(&NetworkConfig::default(), addr);
        assert_eq!(sender.send(&[1, 2, 3]), None);
        assert_eq!(sender.packets_sent(), 0);
    }

    #[test]
    fn test_sequences_and_counters() {
        let (socket, addr) = listener();
        let sender = AudioSender::new(&NetworkConfig::default(), addr);
        sender.start().unwrap();

        assert_eq!(sender.send(&[0xAA; 10]), Some(0));
        assert_eq!(sender.send(&[0xBB; 20]), Some(1));

        let (seq, ts, payload) = recv(&socket);
        assert_eq!(seq, 0);
        assert!(ts > 0);
        assert_eq!(payload.as_ref(), &[0xAA; 10]);
        assert_eq!(recv(&socket).0, 1);

        let stats = sender.stats();
        assert_eq!(stats.packets_sent, 2);
        assert_eq!(stats.bytes_sent, (2 * HEADER_SIZE + 30) as u64);
    }

    #[test]
    fn test_restart_resets_sequence() {
        let (socket, addr) = listener();
        let sender = AudioSender::new(&NetworkConfig::default(), addr);

        sender.start().unwrap();
        sender.send(&[1]);
        sender.send(&[2]);
        sender.stop();
        assert!(!sender.is_running());

        sender.start().unwrap();
        assert_eq!(sender.send(&[3]), Some(0));
        assert_eq!(sender.packets_sent(), 1);

        for _ in 0..2 {
            recv(&socket);
        }
        assert_eq!(recv(&socket).0, 0);
    }

    #[test]
    fn test_start_twice_keeps_socket() {
        let (_socket, addr) = listener();
        let sender = AudioSender::new(&NetworkConfig::default(), addr);
        sender.start().unwrap();
        let local = sender.local_addr();
        sender.start().unwrap();
        assert_eq!(sender.local_addr(), local);
    }

    #[test]
    fn test_update_target_while_running() {
        let (first, first_addr) = listener();
        let (second, second_addr) = listener();

        let sender = AudioSender::new(&NetworkConfig::default(), first_addr);
        sender.start().unwrap();
        sender.send(&[1]);
        sender.update_target(second_addr);
        sender.send(&[2]);

        assert_eq!(recv(&first).2.as_ref(), &[1]);
        let (seq, _, payload) = recv(&second);
        assert_eq!(seq, 1);
        assert_eq!(payload.as_ref(), &[2]);
    }

    #[test]
    fn test_oversized_payload_is_dropped() {
        let (_socket, addr) = listener();
        let sender = AudioSender::new(&NetworkConfig::default(), addr);
        sender.start().unwrap();

        assert_eq!(sender.send(&vec![0u8; 70_000]), None);
        assert_eq!(sender.stats().send_errors, 1);
        assert_eq!(sender.packets_sent(), 0);
    }

    #[test]
    fn test_oversized_payload_consumes_sequence() {
        let (socket, addr) = listener();
        let sender = AudioSender::new(&NetworkConfig::default(), addr);
        sender.start().unwrap();

        assert_eq!(sender.send(&[1]), Some(0));
        assert_eq!(sender.send(&vec![0u8; 70_000]), None);
        assert_eq!(sender.send(&[3]), Some(2));

        assert_eq!(recv(&socket).0, 0);
        let (seq, _, payload) = recv(&socket);
        assert_eq!(seq, 2);
        assert_eq!(payload.as_ref(), &[3]);
    }
}
