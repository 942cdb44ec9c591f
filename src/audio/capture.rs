//! Audio capture sources
//!
//! Device callbacks deliver arbitrary block sizes; [`FrameAccumulator`]
//! re-chunks them into fixed session frames without allocating.

use std::f32::consts::TAU;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use super::{FrameCallback, FrameSource};
use crate::codec::CodecParams;
use crate::error::AudioError;

/// Re-chunks device blocks into fixed frames and maps channel layouts
///
/// Mono sessions average all device channels. Otherwise each session
/// channel takes the device channel with the same index, repeating the last
/// device channel when the device has fewer.
pub struct FrameAccumulator {
    frame: Vec<i16>,
    filled: usize,
    device_channels: usize,
    frame_channels: usize,
}

impl FrameAccumulator {
    pub fn new(frame_size: usize, device_channels: u16, frame_channels: u16) -> Self {
        let frame_channels = frame_channels.max(1) as usize;
        Self {
            frame: vec![0; frame_size * frame_channels],
            filled: 0,
            device_channels: device_channels.max(1) as usize,
            frame_channels,
        }
    }

    /// Feed one device block; `emit` is called for every completed frame
    ///
    /// A trailing partial device frame (fewer samples than channels) is ignored.
    pub fn push<T: Copy>(&mut self, input: &[T], convert: impl Fn(T) -> i16, emit: &mut dyn FnMut(&[i16])) {
        for device_frame in input.chunks_exact(self.device_channels) {
            if self.frame_channels == 1 && self.device_channels > 1 {
                let sum: i32 = device_frame.iter().map(|&s| convert(s) as i32).sum();
                self.write((sum / self.device_channels as i32) as i16, emit);
            } else {
                for channel in 0..self.frame_channels {
                    let sample = device_frame[channel.min(self.device_channels - 1)];
                    self.write(convert(sample), emit);
                }
            }
        }
    }

    /// Samples waiting for the next frame
    pub fn pending(&self) -> usize {
        self.filled
    }

    #[inline]
    fn write(&mut self, sample: i16, emit: &mut dyn FnMut(&[i16])) {
        self.frame[self.filled] = sample;
        self.filled += 1;
        if self.filled == self.frame.len() {
            emit(&self.frame);
            self.filled = 0;
        }
    }
}

/// Signal produced by [`SyntheticSource`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Waveform {
    Silence,
    /// `amplitude` is relative to full scale
    Sine { frequency: f32, amplitude: f32 },
}

/// Timer-driven source used when no capture device is available
pub struct SyntheticSource {
    name: String,
    params: CodecParams,
    waveform: Waveform,
    running: Arc<AtomicBool>,
    frames_generated: Arc<AtomicU64>,
    thread_handle: Option<JoinHandle<()>>,
}

impl SyntheticSource {
    pub fn new(params: CodecParams, waveform: Waveform) -> Self {
        let name = match waveform {
            Waveform::Silence => "synthetic silence".to_string(),
            Waveform::Sine { frequency, .. } => format!("synthetic {} Hz tone", frequency),
        };
        Self {
            name,
            params,
            waveform,
            running: Arc::new(AtomicBool::new(false)),
            frames_generated: Arc::new(AtomicU64::new(0)),
            thread_handle: None,
        }
    }

    pub fn silence(params: CodecParams) -> Self {
        Self::new(params, Waveform::Silence)
    }

    /// Half-scale sine tone
    pub fn sine(params: CodecParams, frequency: f32) -> Self {
        Self::new(
            params,
            Waveform::Sine {
                frequency,
                amplitude: 0.5,
            },
        )
    }

    pub fn frames_generated(&self) -> u64 {
        self.frames_generated.load(Ordering::Relaxed)
    }
}

/// Fill one interleaved frame, advancing `phase`
fn render(frame: &mut [i16], params: &CodecParams, waveform: Waveform, phase: &mut f32) {
    match waveform {
        Waveform::Silence => frame.fill(0),
        Waveform::Sine { frequency, amplitude } => {
            let step = TAU * frequency / params.sample_rate.max(1) as f32;
            let scale = amplitude.clamp(0.0, 1.0) * i16::MAX as f32;
            for sample_frame in frame.chunks_exact_mut(params.channels.max(1) as usize) {
                sample_frame.fill((phase.sin() * scale) as i16);
                *phase = (*phase + step) % TAU;
            }
        }
    }
}

impl FrameSource for SyntheticSource {
    fn start(&mut self, mut callback: FrameCallback) -> Result<(), AudioError> {
        if self.thread_handle.is_some() {
            return Ok(());
        }

        let running = self.running.clone();
        let frames_generated = self.frames_generated.clone();
        let params = self.params;
        let waveform = self.waveform;

        running.store(true, Ordering::SeqCst);

        let handle = thread::Builder::new()
            .name("synthetic-source".to_string())
            .spawn(move || {
                let period = params.frame_duration();
                let mut frame = vec![0i16; params.samples_per_frame()];
                let mut phase = 0.0f32;
                let mut next = Instant::now();

                while running.load(Ordering::Relaxed) {
                    render(&mut frame, &params, waveform, &mut phase);
                    callback(&frame);
                    frames_generated.fetch_add(1, Ordering::Relaxed);

                    next += period;
                    let now = Instant::now();
                    if next > now {
                        thread::sleep(next - now);
                    } else {
                        // Fell behind; do not burst to catch up
                        next = now;
                    }
                }
            })
            .map_err(|e| {
                self.running.store(false, Ordering::SeqCst);
                AudioError::StreamError(e.to_string())
            })?;

        self.thread_handle = Some(handle);
        tracing::debug!("Started {}", self.name);
        Ok(())
    }

    fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);

        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for SyntheticSource {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(feature = "device")]
pub use self::cpal_source::CpalSource;

#[cfg(feature = "device")]
mod cpal_source {
    use cpal::traits::{DeviceTrait, StreamTrait};
    use cpal::{SampleFormat, StreamConfig};
    use crossbeam_channel::{bounded, Receiver};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread::{self, JoinHandle};
    use std::time::Duration;

    use super::FrameAccumulator;
    use crate::audio::buffer::sample_from_f32;
    use crate::audio::device::{host, DeviceInfo};
    use crate::audio::{FrameCallback, FrameSource};
    use crate::codec::CodecParams;
    use crate::config::AudioConfig;
    use crate::error::AudioError;

    /// How long to wait for the stream thread to open the device
    const STREAM_OPEN_TIMEOUT: Duration = Duration::from_secs(3);

    /// Capture from a cpal input (or WASAPI loopback) device
    pub struct CpalSource {
        info: DeviceInfo,
        params: CodecParams,
        device_channels: u16,
        sample_format: SampleFormat,
        stream_config: StreamConfig,
        running: Arc<AtomicBool>,
        thread_handle: Option<JoinHandle<()>>,
        error_rx: Option<Receiver<AudioError>>,
    }

    impl CpalSource {
        /// Resolve the configured device and its native format
        pub fn open(config: &AudioConfig) -> Result<Self, AudioError> {
            let (device, info) = host::resolve_source(config)?;

            // Loopback endpoints are render devices and only report output configs
            let default_config = if info.id.starts_with("loopback:") {
                device.default_output_config()
            } else {
                device.default_input_config()
            }
            .map_err(|e| AudioError::UnsupportedFormat(e.to_string()))?;

            let device_channels = default_config.channels();
            let stream_config = StreamConfig {
                channels: device_channels,
                sample_rate: cpal::SampleRate(config.sample_rate),
                buffer_size: cpal::BufferSize::Default,
            };

            Ok(Self {
                info,
                params: config.codec_params(),
                device_channels,
                sample_format: default_config.sample_format(),
                stream_config,
                running: Arc::new(AtomicBool::new(false)),
                thread_handle: None,
                error_rx: None,
            })
        }

        pub fn device_id(&self) -> &str {
            &self.info.id
        }
    }

    impl FrameSource for CpalSource {
        fn start(&mut self, mut callback: FrameCallback) -> Result<(), AudioError> {
            if self.thread_handle.is_some() {
                return Ok(());
            }

            let device = host::device_by_id(&self.info.id)?;
            let (error_tx, error_rx) = bounded::<AudioError>(16);
            let (ready_tx, ready_rx) = bounded::<Result<(), AudioError>>(1);
            self.error_rx = Some(error_rx);

            let running = self.running.clone();
            let stream_config = self.stream_config.clone();
            let sample_format = self.sample_format;
            let mut accumulator =
                FrameAccumulator::new(self.params.frame_size, self.device_channels, self.params.channels);

            running.store(true, Ordering::SeqCst);

            // cpal streams are not Send; the stream lives on this thread
            let handle = thread::Builder::new()
                .name("audio-capture".to_string())
                .spawn(move || {
                    let err_fn = move |err: cpal::StreamError| {
                        tracing::error!("Capture stream error: {}", err);
                        let _ = error_tx.try_send(AudioError::StreamError(err.to_string()));
                    };

                    let stream = match sample_format {
                        SampleFormat::F32 => device.build_input_stream(
                            &stream_config,
                            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                                accumulator.push(data, sample_from_f32, callback.as_mut());
                            },
                            err_fn,
                            None,
                        ),
                        SampleFormat::I16 => device.build_input_stream(
                            &stream_config,
                            move |data: &[i16], _: &cpal::InputCallbackInfo| {
                                accumulator.push(data, |s| s, callback.as_mut());
                            },
                            err_fn,
                            None,
                        ),
                        other => {
                            let _ = ready_tx.send(Err(AudioError::UnsupportedFormat(format!("{:?}", other))));
                            return;
                        }
                    };

                    let stream = match stream {
                        Ok(stream) => stream,
                        Err(e) => {
                            let _ = ready_tx.send(Err(AudioError::StreamError(e.to_string())));
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
                    // Stream is dropped here, stopping capture
                })
                .map_err(|e| AudioError::StreamError(e.to_string()))?;

            match ready_rx.recv_timeout(STREAM_OPEN_TIMEOUT) {
                Ok(Ok(())) => {
                    tracing::info!(
                        "Capture started on {} ({} ch, {:?})",
                        self.info.name,
                        self.device_channels,
                        self.sample_format
                    );
                    self.thread_handle = Some(handle);
                    Ok(())
                }
                Ok(Err(e)) => {
                    self.running.store(false, Ordering::SeqCst);
                    let _ = handle.join();
                    Err(e)
                }
                Err(_) => {
                    // Thread exits on its own once the backend returns
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

    impl Drop for CpalSource {
        fn drop(&mut self) {
            self.stop();
        }
    }
}
