//! Audio subsystem module
//!
//! Capture and playback are collaborators behind two small traits so the
//! transport never depends on a particular backend. cpal devices are used
//! when the `device` feature is on; synthetic ones are always available.

pub mod buffer;
pub mod capture;
pub mod device;
pub mod playback;

use crate::error::AudioError;
use buffer::SharedJitterBuffer;

pub use buffer::{create_shared_buffer, JitterBuffer, JitterStats, PcmFrame};
pub use capture::{FrameAccumulator, SyntheticSource, Waveform};
pub use device::{
    list_sinks, list_sources, open_sink, open_source, DeviceBackend, DeviceInfo, DeviceSelection,
    SourceKind,
};
pub use playback::NullSink;

#[cfg(feature = "device")]
pub use capture::CpalSource;
#[cfg(feature = "device")]
pub use playback::CpalSink;

/// Called with every complete interleaved frame
pub type FrameCallback = Box<dyn FnMut(&[i16]) + Send>;

/// Push-style capture: delivers fixed-shape frames at the frame cadence
pub trait FrameSource: Send {
    fn start(&mut self, callback: FrameCallback) -> Result<(), AudioError>;

    /// Stop delivering frames; idempotent
    fn stop(&mut self);

    fn name(&self) -> &str;

    /// Next asynchronous device error, if any
    fn poll_error(&mut self) -> Option<AudioError> {
        None
    }
}

/// Pull-style playback: drains the jitter buffer at the device cadence
pub trait FrameSink: Send {
    fn start(&mut self, buffer: SharedJitterBuffer) -> Result<(), AudioError>;

    /// Stop pulling; idempotent
    fn stop(&mut self);

    fn name(&self) -> &str;

    /// Next asynchronous device error, if any
    fn poll_error(&mut self) -> Option<AudioError> {
        None
    }
}
