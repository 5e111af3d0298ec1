//! Microphone capture and outbound frame encoding
//!
//! Acquires the default input device via CPAL, converts whatever the device
//! produces (f32/i16/u16, any channel count) to 16kHz mono PCM16, and pushes
//! fixed-duration frames into the bounded [`FrameQueue`] for the network
//! pump. The device is a scoped resource: stopping (or dropping) the
//! [`CaptureHandle`] releases the stream, including on error paths.
//!
//! The CPAL stream is not `Send`, so it lives on a dedicated audio thread;
//! the handle only carries the stop channel.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc as std_mpsc, Arc, Mutex};
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleFormat, Stream, StreamConfig};
use tokio::sync::Notify;

use super::analyser::AnalyserTap;
use super::frame_queue::FrameQueue;
use super::AudioError;

/// How long to wait for the audio thread to report stream readiness
const STREAM_READY_TIMEOUT: Duration = Duration::from_secs(5);

/// Handle to an active capture stream.
///
/// Stopping or dropping the handle unblocks the audio thread, which drops
/// the stream and releases the input device. `stop()` is idempotent.
pub struct CaptureHandle {
    stop_tx: std_mpsc::Sender<()>,
    is_capturing: Arc<AtomicBool>,
}

impl CaptureHandle {
    /// Stop capturing and release the input device.
    pub fn stop(&self) {
        self.is_capturing.store(false, Ordering::SeqCst);
        // Err means the audio thread already exited
        let _ = self.stop_tx.send(());
    }
}

/// Capture pipeline over the default input device.
pub struct AudioCapture {
    device: Device,
    config: StreamConfig,
    sample_format: SampleFormat,
}

impl AudioCapture {
    /// Acquire the default input device.
    pub fn new() -> Result<Self, AudioError> {
        let host = cpal::default_host();

        let device = host
            .default_input_device()
            .ok_or(AudioError::NoInputDevice)?;

        log::info!("Using audio input device: {:?}", device.name());

        let supported_config = device
            .default_input_config()
            .map_err(|_| AudioError::NoSupportedConfig)?;

        log::info!(
            "Capture config: {} Hz, {} channels, {:?}",
            supported_config.sample_rate().0,
            supported_config.channels(),
            supported_config.sample_format()
        );

        let sample_format = supported_config.sample_format();
        let config: StreamConfig = supported_config.into();

        Ok(Self {
            device,
            config,
            sample_format,
        })
    }

    /// Native sample rate of the acquired device.
    pub fn sample_rate(&self) -> u32 {
        self.config.sample_rate.0
    }

    /// Start streaming frames into `queue`.
    ///
    /// Each completed frame holds `frame_duration_ms` of `target_rate` mono
    /// PCM16; `notify` wakes the network pump after every push. `tap`
    /// receives a copy of the raw signal for visualization.
    pub fn start(
        &self,
        target_rate: u32,
        frame_duration_ms: u32,
        queue: Arc<Mutex<FrameQueue>>,
        notify: Arc<Notify>,
        tap: Arc<AnalyserTap>,
    ) -> Result<CaptureHandle, AudioError> {
        let frame_samples = ((target_rate * frame_duration_ms / 1000) as usize).max(1);
        let is_capturing = Arc::new(AtomicBool::new(true));

        let device = self.device.clone();
        let config = self.config.clone();
        let sample_format = self.sample_format;
        let flag = is_capturing.clone();

        let (ready_tx, ready_rx) = std_mpsc::sync_channel::<Result<(), AudioError>>(1);
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();

        std::thread::Builder::new()
            .name("falcon-capture".to_string())
            .spawn(move || {
                let stream = match build_capture_stream(
                    &device,
                    &config,
                    sample_format,
                    target_rate,
                    frame_samples,
                    queue,
                    notify,
                    tap,
                    flag,
                ) {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };

                if let Err(e) = stream.play() {
                    let _ = ready_tx.send(Err(AudioError::StreamCreationFailed(format!(
                        "Failed to start stream: {}",
                        e
                    ))));
                    return;
                }

                let _ = ready_tx.send(Ok(()));

                // Park until stop() is called or the handle is dropped
                let _ = stop_rx.recv();
                drop(stream);
                log::debug!("Capture thread exiting, input device released");
            })
            .map_err(|e| AudioError::StreamCreationFailed(e.to_string()))?;

        match ready_rx.recv_timeout(STREAM_READY_TIMEOUT) {
            Ok(Ok(())) => {
                log::info!(
                    "Capture started ({} Hz -> {} Hz, {} samples/frame)",
                    self.config.sample_rate.0,
                    target_rate,
                    frame_samples
                );
                Ok(CaptureHandle {
                    stop_tx,
                    is_capturing,
                })
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(AudioError::StreamCreationFailed(
                "Audio thread did not report readiness".to_string(),
            )),
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn build_capture_stream(
    device: &Device,
    config: &StreamConfig,
    sample_format: SampleFormat,
    target_rate: u32,
    frame_samples: usize,
    queue: Arc<Mutex<FrameQueue>>,
    notify: Arc<Notify>,
    tap: Arc<AnalyserTap>,
    is_capturing: Arc<AtomicBool>,
) -> Result<Stream, AudioError> {
    match sample_format {
        SampleFormat::I16 => build_capture_stream_typed::<i16>(
            device,
            config,
            target_rate,
            frame_samples,
            queue,
            notify,
            tap,
            is_capturing,
        ),
        SampleFormat::U16 => build_capture_stream_typed::<u16>(
            device,
            config,
            target_rate,
            frame_samples,
            queue,
            notify,
            tap,
            is_capturing,
        ),
        SampleFormat::F32 => build_capture_stream_typed::<f32>(
            device,
            config,
            target_rate,
            frame_samples,
            queue,
            notify,
            tap,
            is_capturing,
        ),
        _ => Err(AudioError::NoSupportedConfig),
    }
}

#[allow(clippy::too_many_arguments)]
fn build_capture_stream_typed<T>(
    device: &Device,
    config: &StreamConfig,
    target_rate: u32,
    frame_samples: usize,
    queue: Arc<Mutex<FrameQueue>>,
    notify: Arc<Notify>,
    tap: Arc<AnalyserTap>,
    is_capturing: Arc<AtomicBool>,
) -> Result<Stream, AudioError>
where
    T: cpal::Sample + cpal::SizedSample + Send + 'static,
    f32: cpal::FromSample<T>,
{
    let channels = config.channels as usize;
    let source_rate = config.sample_rate.0;
    let err_fn = |err| log::error!("Capture stream error: {}", err);

    // Accumulates downsampled audio until a full frame is ready.
    // Lives entirely inside the callback, so no lock is needed for it.
    let mut pending: Vec<i16> = Vec::with_capacity(frame_samples * 2);

    let stream = device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                if !is_capturing.load(Ordering::SeqCst) {
                    return;
                }

                let mono = downmix_to_mono(data, channels);
                tap.push_samples(&mono);

                let pcm: Vec<i16> = mono.iter().map(|&s| f32_to_i16(s)).collect();
                pending.extend(downsample(&pcm, source_rate, target_rate));

                while pending.len() >= frame_samples {
                    let frame: Vec<i16> = pending.drain(..frame_samples).collect();
                    {
                        let mut q = match queue.lock() {
                            Ok(guard) => guard,
                            Err(poisoned) => poisoned.into_inner(),
                        };
                        q.push(frame);
                    }
                    notify.notify_one();
                }
            },
            err_fn,
            None,
        )
        .map_err(|e| match e {
            cpal::BuildStreamError::DeviceNotAvailable => {
                AudioError::PermissionDenied(e.to_string())
            }
            other => AudioError::StreamCreationFailed(other.to_string()),
        })?;

    Ok(stream)
}

/// Average interleaved channels down to normalized mono f32.
fn downmix_to_mono<T>(data: &[T], channels: usize) -> Vec<f32>
where
    T: cpal::Sample,
    f32: cpal::FromSample<T>,
{
    if channels <= 1 {
        return data
            .iter()
            .map(|&s| cpal::Sample::from_sample(s))
            .collect();
    }

    data.chunks(channels)
        .map(|frame| {
            let sum: f32 = frame
                .iter()
                .map(|&s| {
                    let f: f32 = cpal::Sample::from_sample(s);
                    f
                })
                .sum();
            sum / frame.len() as f32
        })
        .collect()
}

/// Convert a normalized f32 sample to i16 for the wire.
fn f32_to_i16(sample: f32) -> i16 {
    let clamped = sample.clamp(-1.0, 1.0);
    (clamped * i16::MAX as f32) as i16
}

/// Downsample audio from source rate to target rate using simple averaging.
///
/// Supports integer ratios (48kHz -> 16kHz is 3:1). For other ratios the
/// original is returned unchanged with a warning.
pub fn downsample(samples: &[i16], source_rate: u32, target_rate: u32) -> Vec<i16> {
    if target_rate == 0 || source_rate == 0 {
        log::warn!(
            "Invalid sample rate (source: {}, target: {}), returning original",
            source_rate,
            target_rate
        );
        return samples.to_vec();
    }

    if source_rate == target_rate {
        return samples.to_vec();
    }

    if source_rate % target_rate != 0 {
        log::warn!(
            "Unsupported resample ratio {}:{}, returning original",
            source_rate,
            target_rate
        );
        return samples.to_vec();
    }

    let ratio = (source_rate / target_rate) as usize;

    samples
        .chunks(ratio)
        .map(|chunk| {
            // i64 accumulator so large chunks cannot overflow
            let sum: i64 = chunk.iter().map(|&s| s as i64).sum();
            (sum / chunk.len() as i64) as i16
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_f32_to_i16() {
        assert_eq!(f32_to_i16(0.0), 0);
        assert_eq!(f32_to_i16(1.0), i16::MAX);
        assert_eq!(f32_to_i16(-1.0), -i16::MAX);

        // Out-of-range input is clamped
        assert_eq!(f32_to_i16(2.0), i16::MAX);
        assert_eq!(f32_to_i16(-2.0), -i16::MAX);
    }

    #[test]
    fn test_downsample_3x() {
        // 48kHz -> 16kHz (3:1)
        let input = vec![100i16, 200, 300, 400, 500, 600];
        let output = downsample(&input, 48000, 16000);

        assert_eq!(output.len(), 2);
        assert_eq!(output[0], 200); // (100 + 200 + 300) / 3
        assert_eq!(output[1], 500); // (400 + 500 + 600) / 3
    }

    #[test]
    fn test_downsample_same_rate() {
        let input = vec![100i16, 200, 300];
        assert_eq!(downsample(&input, 16000, 16000), input);
    }

    #[test]
    fn test_downsample_unsupported_ratio() {
        // 44.1kHz -> 16kHz is not an integer ratio
        let input = vec![100i16, 200, 300];
        assert_eq!(downsample(&input, 44100, 16000), input);
    }

    #[test]
    fn test_downsample_zero_rate() {
        let input = vec![100i16, 200, 300];
        assert_eq!(downsample(&input, 48000, 0), input);
        assert_eq!(downsample(&input, 0, 16000), input);
    }

    #[test]
    fn test_downmix_stereo_to_mono() {
        // Interleaved L/R pairs average together
        let data = vec![0.2f32, 0.4, -0.5, -0.3];
        let mono = downmix_to_mono(&data, 2);

        assert_eq!(mono.len(), 2);
        assert!((mono[0] - 0.3).abs() < 1e-6);
        assert!((mono[1] + 0.4).abs() < 1e-6);
    }

    #[test]
    fn test_downmix_mono_passthrough() {
        let data = vec![0.1f32, 0.2, 0.3];
        let mono = downmix_to_mono(&data, 1);
        assert_eq!(mono, data);
    }

    #[test]
    #[ignore] // Requires an audio input device
    fn test_capture_acquires_device() {
        let capture = AudioCapture::new();
        assert!(capture.is_ok(), "No input device: {:?}", capture.err());
    }
}
