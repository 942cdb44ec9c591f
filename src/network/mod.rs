//! UDP transport for audio frames
//!
//! - `udp`: socket construction (buffer sizes, timeouts, address reuse)
//! - `sender`: sequencing and send statistics
//! - `receiver`: receive thread and loss estimation
//! - `streamer`: one sender plus one receiver with a shared lifecycle

pub mod receiver;
pub mod sender;
pub mod streamer;
pub mod udp;

pub use receiver::{AudioReceiver, LossEstimator, PacketCallback, ReceivedPacket, ReceiverStats};
pub use sender::{AudioSender, SenderStats};
pub use streamer::{AudioStreamer, StreamerState, StreamerStats};
