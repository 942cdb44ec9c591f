//! Audio packet receiver
//!
//! A dedicated thread blocks on the socket with a read timeout, parses each
//! datagram, updates the loss estimate and hands the packet to a callback.
//! Packets are delivered strictly in arrival order.

use bytes::Bytes;
use parking_lot::Mutex;
use serde::Serialize;
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::config::NetworkConfig;
use crate::constants::LARGE_GAP_THRESHOLD;
use crate::error::NetworkError;
use crate::network::udp::create_recv_socket;
use crate::protocol::unpack;

/// Receive buffer, large enough for any UDP datagram
const RECV_BUFFER_SIZE: usize = 65536;

/// Extra time granted to the thread beyond one read timeout on stop
const JOIN_GRACE: Duration = Duration::from_millis(500);

/// Parsed datagram handed to the delivery callback
#[derive(Debug, Clone)]
pub struct ReceivedPacket {
    pub sequence: u32,
    pub timestamp_ms: u64,
    pub payload: Bytes,
}

/// Callback type for received packets
pub type PacketCallback = Arc<dyn Fn(ReceivedPacket) + Send + Sync>;

/// Sequence-gap loss estimate
///
/// Any forward gap below [`LARGE_GAP_THRESHOLD`] counts as loss, including
/// the apparent gap left by a reordered packet. Larger gaps are taken as a
/// sender restart and ignored. Duplicates are not detected.
#[derive(Debug, Clone, Default)]
pub struct LossEstimator {
    last_sequence: Option<u32>,
    lost: u64,
}

impl LossEstimator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Account for `sequence` and return how many packets it reveals as lost
    pub fn observe(&mut self, sequence: u32) -> u32 {
        let mut lost = 0;
        if let Some(last) = self.last_sequence {
            let expected = last.wrapping_add(1);
            if sequence != expected {
                let gap = sequence.wrapping_sub(expected);
                if gap < LARGE_GAP_THRESHOLD {
                    lost = gap;
                }
            }
        }
        self.last_sequence = Some(sequence);
        self.lost += lost as u64;
        lost
    }

    pub fn last_sequence(&self) -> Option<u32> {
        self.last_sequence
    }

    /// Total packets counted lost
    pub fn lost(&self) -> u64 {
        self.lost
    }
}

/// Counters shared with the receive thread
#[derive(Default)]
struct ReceiverShared {
    packets_received: AtomicU64,
    bytes_received: AtomicU64,
    packets_lost: AtomicU64,
}

struct Worker {
    handle: JoinHandle<()>,
    local_addr: SocketAddr,
    /// Stop flag owned by this thread alone
    running: Arc<AtomicBool>,
}

/// Inbound half of a session
pub struct AudioReceiver {
    config: NetworkConfig,
    bind_addr: SocketAddr,
    callback: PacketCallback,
    shared: Arc<ReceiverShared>,
    worker: Mutex<Option<Worker>>,
    /// Thread that outlived the stop deadline, still holding its socket
    lingering: Mutex<Option<(JoinHandle<()>, SocketAddr)>>,
}

impl AudioReceiver {
    /// Create a stopped receiver that will listen on `bind_addr`
    pub fn new(config: &NetworkConfig, bind_addr: SocketAddr, callback: PacketCallback) -> Self {
        Self {
            config: config.clone(),
            bind_addr,
            callback,
            shared: Arc::new(ReceiverShared::default()),
            worker: Mutex::new(None),
            lingering: Mutex::new(None),
        }
    }

    /// Bind the socket and spawn the receive thread
    ///
    /// Counters and the loss estimate restart from zero. Calling this on a
    /// running receiver does nothing. Fails while a thread detached by an
    /// earlier [`stop`](Self::stop) is still alive.
    pub fn start(&self) -> Result<(), NetworkError> {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return Ok(());
        }
        self.reap_lingering()?;

        let timeout = self.config.recv_timeout();
        let socket = create_recv_socket(&self.config, self.bind_addr, timeout)?;
        let local_addr = socket
            .local_addr()
            .map_err(|e| NetworkError::BindFailed(e.to_string()))?;

        self.shared.packets_received.store(0, Ordering::Relaxed);
        self.shared.bytes_received.store(0, Ordering::Relaxed);
        self.shared.packets_lost.store(0, Ordering::Relaxed);

        let running = Arc::new(AtomicBool::new(true));
        let thread_running = running.clone();
        let shared = self.shared.clone();
        let callback = self.callback.clone();
        let handle = thread::Builder::new()
            .name("audio-receiver".to_string())
            .spawn(move || receive_loop(socket, thread_running, shared, callback))
            .map_err(|e| NetworkError::ReceiveFailed(e.to_string()))?;

        *worker = Some(Worker {
            handle,
            local_addr,
            running,
        });
        tracing::info!("UDP receiver started on {}", local_addr);
        Ok(())
    }

    /// Stop the receive thread and close the socket
    ///
    /// Waits at most one read timeout plus a grace period, and the socket is
    /// closed once the thread has been joined. A thread still inside the
    /// callback after that is detached: it keeps its socket until the
    /// callback returns and then exits, and [`start`](Self::start) refuses
    /// to run until it has.
    pub fn stop(&self) {
        let mut worker = self.worker.lock();
        let Some(Worker {
            handle,
            local_addr,
            running,
        }) = worker.take()
        else {
            return;
        };
        running.store(false, Ordering::SeqCst);

        let deadline = Instant::now() + self.config.recv_timeout() + JOIN_GRACE;
        while !handle.is_finished() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }

        if handle.is_finished() {
            if handle.join().is_err() {
                tracing::error!("Receive thread on {} panicked", local_addr);
            }
        } else {
            tracing::warn!("Receive thread on {} did not stop in time, detaching", local_addr);
            *self.lingering.lock() = Some((handle, local_addr));
        }

        tracing::info!(
            "UDP receiver stopped (received {} packets, lost {})",
            self.packets_received(),
            self.packets_lost()
        );
    }

    /// Join a detached thread if it has exited since
    fn reap_lingering(&self) -> Result<(), NetworkError> {
        let mut lingering = self.lingering.lock();
        match lingering.take() {
            Some((handle, addr)) if !handle.is_finished() => {
                *lingering = Some((handle, addr));
                Err(NetworkError::ReceiveFailed(format!(
                    "previous receive thread on {} is still running",
                    addr
                )))
            }
            Some((handle, addr)) => {
                if handle.join().is_err() {
                    tracing::error!("Receive thread on {} panicked", addr);
                }
                Ok(())
            }
            None => Ok(()),
        }
    }

    /// Check if running
    pub fn is_running(&self) -> bool {
        self.worker.lock().is_some()
    }

    /// Address the socket is bound to, once started
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.worker.lock().as_ref().map(|w| w.local_addr)
    }

    /// Get packets received count
    pub fn packets_received(&self) -> u64 {
        self.shared.packets_received.load(Ordering::Relaxed)
    }

    /// Get bytes received count
    pub fn bytes_received(&self) -> u64 {
        self.shared.bytes_received.load(Ordering::Relaxed)
    }

    /// Estimated packets lost
    pub fn packets_lost(&self) -> u64 {
        self.shared.packets_lost.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> ReceiverStats {
        ReceiverStats {
            packets_received: self.packets_received(),
            bytes_received: self.bytes_received(),
            packets_lost: self.packets_lost(),
        }
    }
}

impl Drop for AudioReceiver {
    fn drop(&mut self) {
        self.stop();
    }
}

fn receive_loop(
    socket: UdpSocket,
    running: Arc<AtomicBool>,
    shared: Arc<ReceiverShared>,
    callback: PacketCallback,
) {
    let mut buffer = vec![0u8; RECV_BUFFER_SIZE];
    let mut loss = LossEstimator::new();

    while running.load(Ordering::Relaxed) {
        match socket.recv_from(&mut buffer) {
            Ok((size, from)) => {
                let datagram = Bytes::copy_from_slice(&buffer[..size]);
                let (sequence, timestamp_ms, payload) = match unpack(datagram) {
                    Ok(parts) => parts,
                    Err(e) => {
                        tracing::trace!("Dropping datagram from {}: {}", from, e);
                        continue;
                    }
                };

                let lost = loss.observe(sequence);
                if lost > 0 {
                    shared.packets_lost.fetch_add(lost as u64, Ordering::Relaxed);
                    tracing::debug!("Sequence gap before {}: {} packets lost", sequence, lost);
                }
                shared.packets_received.fetch_add(1, Ordering::Relaxed);
                shared.bytes_received.fetch_add(size as u64, Ordering::Relaxed);

                callback(ReceivedPacket {
                    sequence,
                    timestamp_ms,
                    payload,
                });
            }
            Err(ref e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {}
            Err(e) => {
                if running.load(Ordering::Relaxed) && e.kind() != io::ErrorKind::Interrupted {
                    tracing::warn!("Receive error: {}", e);
                }
                thread::sleep(Duration::from_millis(1));
            }
        }
    }
}

/// Receiver statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReceiverStats {
    pub packets_received: u64,
    /// Header plus payload
    pub bytes_received: u64,
    /// Estimated from sequence gaps
    pub packets_lost: u64,
}
