//! Audio playback sinks
//!
//! Sinks pull from the jitter buffer on their own cadence and never wait for
//! the network. When a device asks for blocks that are not exactly one frame,
//! [`OutputStager`] carries the remainder of the last frame over to the next
//! callback.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use super::buffer::SharedJitterBuffer;
use super::FrameSink;
use crate::codec::CodecParams;
use crate::error::AudioError;

/// Adapts whole-frame pulls to arbitrary device block sizes
pub struct OutputStager<T> {
    staged: Vec<T>,
    pos: usize,
}

impl<T: Copy + Default> OutputStager<T> {
    pub fn new(frame_len: usize) -> Self {
        let frame_len = frame_len.max(1);
        Self {
            staged: vec![T::default(); frame_len],
            pos: frame_len,
        }
    }

    /// Fill `output`, calling `pull` for each whole frame needed
    pub fn fill(&mut self, output: &mut [T], mut pull: impl FnMut(&mut [T])) {
        // Device block is exactly one frame and nothing is carried over
        if self.pos == self.staged.len() && output.len() == self.staged.len() {
            pull(output);
            return;
        }

        let mut written = 0;
        while written < output.len() {
            if self.pos == self.staged.len() {
                pull(&mut self.staged);
                self.pos = 0;
            }
            let n = (self.staged.len() - self.pos).min(output.len() - written);
            output[written..written + n].copy_from_slice(&self.staged[self.pos..self.pos + n]);
            self.pos += n;
            written += n;
        }
    }
}

/// Drains the jitter buffer at the frame cadence and discards the audio
pub struct NullSink {
    params: CodecParams,
    running: Arc<AtomicBool>,
    frames_pulled: Arc<AtomicU64>,
    thread_handle: Option<JoinHandle<()>>,
}

impl NullSink {
    pub fn new(params: CodecParams) -> Self {
        Self {
            params,
            running: Arc::new(AtomicBool::new(false)),
            frames_pulled: Arc::new(AtomicU64::new(0)),
            thread_handle: None,
        }
    }

    /// Pulls performed, including underruns
    pub fn frames_pulled(&self) -> u64 {
        self.frames_pulled.load(Ordering::Relaxed)
    }
}

impl FrameSink for NullSink {
    fn start(&mut self, buffer: SharedJitterBuffer) -> Result<(), AudioError> {
        if self.thread_handle.is_some() {
            return Ok(());
        }

        let running = self.running.clone();
        let frames_pulled = self.frames_pulled.clone();
        let params = self.params;

        running.store(true, Ordering::SeqCst);

        let handle = thread::Builder::new()
            .name("null-sink".to_string())
            .spawn(move || {
                let period = params.frame_duration();
                let mut output = vec![0i16; params.samples_per_frame()];
                let mut next = Instant::now();

                while running.load(Ordering::Relaxed) {
                    buffer.pop_into_i16(&mut output);
                    frames_pulled.fetch_add(1, Ordering::Relaxed);

                    next += period;
                    let now = Instant::now();
                    if next > now {
                        thread::sleep(next - now);
                    } else {
                        next = now;
                    }
                }
            })
            .map_err(|e| {
                self.running.store(false, Ordering::SeqCst);
                AudioError::StreamError(e.to_string())
            })?;

        self.thread_handle = Some(handle);
        Ok(())
    }

    fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);

        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }
    }

    fn name(&self) -> &str {
        "null sink"
    }
}

impl Drop for NullSink {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(feature = "device")]
pub use self::cpal_sink::CpalSink;

#[cfg(feature = "device")]
mod cpal_sink {
    use cpal::traits::{DeviceTrait, StreamTrait};
    use cpal::{SampleFormat, StreamConfig};
    use crossbeam_channel::{bounded, Receiver, Sender};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread::{self, JoinHandle};
    use std::time::Duration;

    use super::OutputStager;
    use crate::audio::buffer::SharedJitterBuffer;
    use crate::audio::device::{host, DeviceInfo};
    use crate::audio::FrameSink;
    use crate::codec::CodecParams;
    use crate::config::AudioConfig;
    use crate::error::AudioError;

    /// How long to wait for the stream thread to open the device
    const STREAM_OPEN_TIMEOUT: Duration = Duration::from_secs(3);

    /// Playback through a cpal output device
    pub struct CpalSink {
        info: DeviceInfo,
        params: CodecParams,
        sample_format: SampleFormat,
        running: Arc<AtomicBool>,
        thread_handle: Option<JoinHandle<()>>,
        error_rx: Option<Receiver<AudioError>>,
    }

    impl CpalSink {
        /// Resolve the configured device and its native sample format
        pub fn open(config: &AudioConfig) -> Result<Self, AudioError> {
            let (device, info) = host::resolve_sink(config)?;
            let default_config = device
                .default_output_config()
                .map_err(|e| AudioError::UnsupportedFormat(e.to_string()))?;

            Ok(Self {
                info,
                params: config.codec_params(),
                sample_format: default_config.sample_format(),
                running: Arc::new(AtomicBool::new(false)),
                thread_handle: None,
                error_rx: None,
            })
        }

        pub fn device_id(&self) -> &str {
            &self.info.id
        }
    }

    fn build_stream(
        device: &cpal::Device,
        config: &StreamConfig,
        sample_format: SampleFormat,
        buffer: &SharedJitterBuffer,
        frame_len: usize,
        error_tx: &Sender<AudioError>,
    ) -> Result<cpal::Stream, AudioError> {
        let error_tx = error_tx.clone();
        let err_fn = move |err: cpal::StreamError| {
            tracing::error!("Playback stream error: {}", err);
            let _ = error_tx.try_send(AudioError::StreamError(err.to_string()));
        };
        let buffer = buffer.clone();

        let stream = match sample_format {
            SampleFormat::F32 => {
                let mut stager = OutputStager::<f32>::new(frame_len);
                device.build_output_stream(
                    config,
                    move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                        stager.fill(data, |out| {
                            buffer.pop_into(out);
                        });
                    },
                    err_fn,
                    None,
                )
            }
            SampleFormat::I16 => {
                let mut stager = OutputStager::<i16>::new(frame_len);
                device.build_output_stream(
                    config,
                    move |data: &mut [i16], _: &cpal::OutputCallbackInfo| {
                        stager.fill(data, |out| {
                            buffer.pop_into_i16(out);
                        });
                    },
                    err_fn,
                    None,
                )
            }
            other => return Err(AudioError::UnsupportedFormat(format!("{:?}", other))),
        };

        stream.map_err(|e| AudioError::StreamError(e.to_string()))
    }

    impl FrameSink for CpalSink {
        fn start(&mut self, buffer: SharedJitterBuffer) -> Result<(), AudioError> {
            if self.thread_handle.is_some() {
                return Ok(());
            }

            let device = host::device_by_id(&self.info.id)?;
            let (error_tx, error_rx) = bounded::<AudioError>(16);
            let (ready_tx, ready_rx) = bounded::<Result<(), AudioError>>(1);
            self.error_rx = Some(error_rx);

            let running = self.running.clone();
            let sample_format = self.sample_format;
            let frame_len = self.params.samples_per_frame();
            let fixed = StreamConfig {
                channels: self.params.channels,
                sample_rate: cpal::SampleRate(self.params.sample_rate),
                buffer_size: cpal::BufferSize::Fixed(self.params.frame_size as u32),
            };

            running.store(true, Ordering::SeqCst);

            let handle = thread::Builder::new()
                .name("audio-playback".to_string())
                .spawn(move || {
                    // One device period per frame if the backend allows it
                    let stream = build_stream(&device, &fixed, sample_format, &buffer, frame_len, &error_tx)
                        .or_else(|e| {
                            tracing::debug!("Fixed buffer size rejected ({}), using device default", e);
                            let default = StreamConfig {
                                buffer_size: cpal::BufferSize::Default,
                                ..fixed.clone()
                            };
                            build_stream(&device, &default, sample_format, &buffer, frame_len, &error_tx)
                        });

                    let stream = match stream {
                        Ok(stream) => stream,
                        Err(e) => {
                            let _ = ready_tx.send(Err(e));
                            return;
                        }
                    };

                    if let Err(e) = stream.play() {
                        let _ = ready_tx.send(Err(AudioError::StreamError(e.to_string())));
                        return;
                    }
                    let _ = ready_tx.send(Ok(()));

                    // Keep thread alive while running
                    while running.load(Ordering::Relaxed) {
                        thread::sleep(Duration::from_millis(10));
                    }
                })
                .map_err(|e| AudioError::StreamError(e.to_string()))?;

            match ready_rx.recv_timeout(STREAM_OPEN_TIMEOUT) {
                Ok(Ok(())) => {
                    tracing::info!("Playback started on {} ({:?})", self.info.name, self.sample_format);
                    self.thread_handle = Some(handle);
                    Ok(())
                }
                Ok(Err(e)) => {
                    self.running.store(false, Ordering::SeqCst);
                    let _ = handle.join();
                    Err(e)
                }
                Err(_) => {
                    self.running.store(false, Ordering::SeqCst);
                    Err(AudioError::StreamError(format!("timed out opening {}", self.info.name)))
                }
            }
        }

        fn stop(&mut self) {
            self.running.store(false, Ordering::SeqCst);

            if let Some(handle) = self.thread_handle.take() {
                let _ = handle.join();
            }
        }

        fn name(&self) -> &str {
            &self.info.name
        }

        fn poll_error(&mut self) -> Option<AudioError> {
            self.error_rx.as_ref().and_then(|rx| rx.try_recv().ok())
        }
    }

    impl Drop for CpalSink {
        fn drop(&mut self) {
            self.stop();
        }
    }
}
