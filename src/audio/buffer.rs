//! PCM frames and the playback jitter buffer
//!
//! The jitter buffer is a bounded multi-producer/multi-consumer queue of
//! decoded frames sitting between the receive thread and the playback
//! device callback. Neither side ever blocks:
//! - on overflow the oldest queued frame is evicted (freshness over completeness)
//! - on underrun the output is filled with silence
//!
//! Sample buffers of played and evicted frames go to a spare pool the
//! producer draws from, so the device callback never frees memory.

use crossbeam::queue::ArrayQueue;
use serde::Serialize;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

/// Fixed-size block of interleaved signed 16-bit samples
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PcmFrame {
    /// Interleaved samples, `frame_size * channels` long
    pub samples: Vec<i16>,
    /// Number of channels
    pub channels: u16,
}

impl PcmFrame {
    pub fn new(samples: Vec<i16>, channels: u16) -> Self {
        Self { samples, channels }
    }

    /// All-zero frame of the given shape
    pub fn silence(frame_size: usize, channels: u16) -> Self {
        Self {
            samples: vec![0; frame_size * channels as usize],
            channels,
        }
    }

    /// Get number of samples per channel
    pub fn samples_per_channel(&self) -> usize {
        self.samples.len() / self.channels.max(1) as usize
    }

    pub fn is_silent(&self) -> bool {
        self.samples.iter().all(|&s| s == 0)
    }
}

/// Normalize a 16-bit sample to [-1.0, 1.0]
#[inline]
pub fn sample_to_f32(sample: i16) -> f32 {
    sample as f32 / i16::MAX as f32
}

/// Quantize a normalized sample to 16 bits, clipping out-of-range input
#[inline]
pub fn sample_from_f32(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * i16::MAX as f32).round() as i16
}

/// Spare buffers kept beyond the queue capacity
const SPARE_SLACK: usize = 4;

/// Bounded drop-oldest playback queue
pub struct JitterBuffer {
    queue: ArrayQueue<PcmFrame>,
    /// Sample buffers handed back for reuse
    spare: ArrayQueue<Vec<i16>>,
    /// Volume as f32 bits, applied when frames leave the queue
    volume: AtomicU32,
    overflows: AtomicU64,
    underruns: AtomicU64,
    frames_played: AtomicU64,
}

impl JitterBuffer {
    /// Create a buffer holding `2 * depth` frames
    pub fn with_depth(depth: usize) -> Self {
        Self::new(depth.max(1) * 2)
    }

    /// Create a buffer with an explicit capacity (at least one frame)
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            queue: ArrayQueue::new(capacity),
            spare: ArrayQueue::new(capacity + SPARE_SLACK),
            volume: AtomicU32::new(1.0f32.to_bits()),
            overflows: AtomicU64::new(0),
            underruns: AtomicU64::new(0),
            frames_played: AtomicU64::new(0),
        }
    }

    /// Enqueue a frame, evicting the oldest one if full
    ///
    /// Returns `true` if a frame was evicted.
    pub fn push(&self, frame: PcmFrame) -> bool {
        match self.queue.force_push(frame) {
            None => false,
            Some(evicted) => {
                self.recycle(evicted.samples);
                self.overflows.fetch_add(1, Ordering::Relaxed);
                true
            }
        }
    }

    /// Fill `output` with the next frame, volume-scaled and normalized
    ///
    /// Short frames are zero-padded, long frames truncated. If nothing is
    /// queued the whole output is silence. Returns whether a frame was played.
    pub fn pop_into(&self, output: &mut [f32]) -> bool {
        match self.queue.pop() {
            Some(frame) => {
                let volume = self.volume();
                let n = frame.samples.len().min(output.len());
                for (out, &sample) in output[..n].iter_mut().zip(&frame.samples) {
                    *out = sample_to_f32(sample) * volume;
                }
                output[n..].fill(0.0);
                self.recycle(frame.samples);
                self.frames_played.fetch_add(1, Ordering::Relaxed);
                true
            }
            None => {
                output.fill(0.0);
                self.underruns.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Same as [`pop_into`](Self::pop_into) for 16-bit output devices
    pub fn pop_into_i16(&self, output: &mut [i16]) -> bool {
        match self.queue.pop() {
            Some(frame) => {
                let volume = self.volume();
                let n = frame.samples.len().min(output.len());
                for (out, &sample) in output[..n].iter_mut().zip(&frame.samples) {
                    *out = sample_from_f32(sample_to_f32(sample) * volume);
                }
                output[n..].fill(0);
                self.recycle(frame.samples);
                self.frames_played.fetch_add(1, Ordering::Relaxed);
                true
            }
            None => {
                output.fill(0);
                self.underruns.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Take a sample buffer left over from a played or evicted frame
    ///
    /// Its length is unspecified; callers overwrite it.
    pub fn take_spare(&self) -> Option<Vec<i16>> {
        self.spare.pop()
    }

    fn recycle(&self, samples: Vec<i16>) {
        // Dropped if the pool is full
        let _ = self.spare.push(samples);
    }

    /// Set playback volume, clamped to [0.0, 1.0]
    pub fn set_volume(&self, volume: f32) {
        let volume = if volume.is_nan() { 0.0 } else { volume.clamp(0.0, 1.0) };
        self.volume.store(volume.to_bits(), Ordering::Relaxed);
    }

    /// Get volume
    pub fn volume(&self) -> f32 {
        f32::from_bits(self.volume.load(Ordering::Relaxed))
    }

    /// Drop everything queued
    pub fn clear(&self) {
        while self.queue.pop().is_some() {}
    }

    /// Get current buffer length
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Check if buffer is empty
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Get buffer capacity
    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }

    pub fn stats(&self) -> JitterStats {
        JitterStats {
            queued: self.len(),
            capacity: self.capacity(),
            overflows: self.overflows.load(Ordering::Relaxed),
            underruns: self.underruns.load(Ordering::Relaxed),
            frames_played: self.frames_played.load(Ordering::Relaxed),
        }
    }
}

/// Thread-safe handle to a jitter buffer
pub type SharedJitterBuffer = Arc<JitterBuffer>;

/// Create a new shared jitter buffer for the given depth
pub fn create_shared_buffer(depth: usize) -> SharedJitterBuffer {
    Arc::new(JitterBuffer::with_depth(depth))
}

/// Jitter buffer statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct JitterStats {
    pub queued: usize,
    pub capacity: usize,
    /// Frames evicted to make room
    pub overflows: u64,
    /// Pulls that found nothing queued
    pub underruns: u64,
    pub frames_played: u64,
}
