//! Gapless playback scheduling for synthesized speech
//!
//! Inbound audio chunks are decoded upstream and handed to an active
//! [`PlaybackHandle`], which schedules each chunk at
//! `max(playhead, cursor)` and advances the cursor by the chunk's duration:
//! playback is order-preserving and gap-free with no overlap, and a chunk
//! arriving after the backlog drained simply starts immediately.
//!
//! The cursor arithmetic lives in [`ScheduleCursor`], denominated in output
//! samples, so the ordering guarantees are testable without a device. The
//! output device itself is a scoped resource released when the handle stops;
//! like capture, the non-`Send` CPAL stream is parked on a dedicated audio
//! thread.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc as std_mpsc, Arc, Mutex};
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleFormat, Stream, StreamConfig};

use super::analyser::AnalyserTap;
use super::AudioError;

/// How long to wait for the audio thread to report stream readiness
const STREAM_READY_TIMEOUT: Duration = Duration::from_secs(5);

/// Next-start-time bookkeeping for gapless scheduling.
///
/// All positions are counts of mono output samples since the stream started.
#[derive(Debug, Default)]
pub struct ScheduleCursor {
    next_start: u64,
}

impl ScheduleCursor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule a chunk of `len` samples given the current playhead.
    ///
    /// Returns the chunk's start position: the end of the previously
    /// scheduled chunk, or the playhead if the backlog already drained.
    /// The cursor never moves backward.
    pub fn schedule(&mut self, playhead: u64, len: u64) -> u64 {
        let start = playhead.max(self.next_start);
        self.next_start = start + len;
        start
    }

    /// Position where the next chunk would start if scheduled back-to-back.
    pub fn next_start(&self) -> u64 {
        self.next_start
    }

    /// Reset for a fresh session.
    pub fn reset(&mut self) {
        self.next_start = 0;
    }
}

/// State shared between the scheduler and the output callback.
struct PlaybackShared {
    /// Pending mono samples in playback order
    queue: Mutex<VecDeque<f32>>,
    /// Mono samples consumed by the output callback (silence included)
    playhead: AtomicU64,
}

/// Playback pipeline over the default output device.
pub struct AudioPlayback {
    device: Device,
    config: StreamConfig,
    sample_format: SampleFormat,
}

impl AudioPlayback {
    /// Acquire the default output device.
    pub fn new() -> Result<Self, AudioError> {
        let host = cpal::default_host();

        let device = host
            .default_output_device()
            .ok_or(AudioError::NoOutputDevice)?;

        log::info!("Using audio output device: {:?}", device.name());

        let supported_config = device
            .default_output_config()
            .map_err(|_| AudioError::NoSupportedConfig)?;

        log::info!(
            "Playback config: {} Hz, {} channels, {:?}",
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

    /// Start the output stream.
    ///
    /// `source_rate` is the wire rate of inbound chunks (upsampled to the
    /// device rate on enqueue). `tap` observes exactly what the device
    /// plays, silence included.
    pub fn start(
        &self,
        source_rate: u32,
        tap: Arc<AnalyserTap>,
    ) -> Result<PlaybackHandle, AudioError> {
        let shared = Arc::new(PlaybackShared {
            queue: Mutex::new(VecDeque::new()),
            playhead: AtomicU64::new(0),
        });

        let device = self.device.clone();
        let config = self.config.clone();
        let sample_format = self.sample_format;
        let shared_for_thread = shared.clone();

        let (ready_tx, ready_rx) = std_mpsc::sync_channel::<Result<(), AudioError>>(1);
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();

        std::thread::Builder::new()
            .name("falcon-playback".to_string())
            .spawn(move || {
                let stream = match build_playback_stream(
                    &device,
                    &config,
                    sample_format,
                    shared_for_thread,
                    tap,
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
                log::debug!("Playback thread exiting, output device released");
            })
            .map_err(|e| AudioError::StreamCreationFailed(e.to_string()))?;

        match ready_rx.recv_timeout(STREAM_READY_TIMEOUT) {
            Ok(Ok(())) => {
                log::info!(
                    "Playback started ({} Hz wire -> {} Hz device)",
                    source_rate,
                    self.config.sample_rate.0
                );
                Ok(PlaybackHandle {
                    shared,
                    cursor: Mutex::new(ScheduleCursor::new()),
                    stop_tx,
                    source_rate,
                    device_rate: self.config.sample_rate.0,
                })
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(AudioError::StreamCreationFailed(
                "Audio thread did not report readiness".to_string(),
            )),
        }
    }
}

fn build_playback_stream(
    device: &Device,
    config: &StreamConfig,
    sample_format: SampleFormat,
    shared: Arc<PlaybackShared>,
    tap: Arc<AnalyserTap>,
) -> Result<Stream, AudioError> {
    match sample_format {
        SampleFormat::I16 => build_playback_stream_typed::<i16>(device, config, shared, tap),
        SampleFormat::U16 => build_playback_stream_typed::<u16>(device, config, shared, tap),
        SampleFormat::F32 => build_playback_stream_typed::<f32>(device, config, shared, tap),
        _ => Err(AudioError::NoSupportedConfig),
    }
}

fn build_playback_stream_typed<T>(
    device: &Device,
    config: &StreamConfig,
    shared: Arc<PlaybackShared>,
    tap: Arc<AnalyserTap>,
) -> Result<Stream, AudioError>
where
    T: cpal::SizedSample + cpal::FromSample<f32> + Send + 'static,
{
    let channels = (config.channels as usize).max(1);
    let err_fn = |err| log::error!("Playback stream error: {}", err);

    let mut written: Vec<f32> = Vec::new();

    let stream = device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                written.clear();

                {
                    let mut queue = match shared.queue.lock() {
                        Ok(guard) => guard,
                        Err(poisoned) => poisoned.into_inner(),
                    };

                    for frame in data.chunks_mut(channels) {
                        // Underrun plays silence; the playhead advances
                        // either way so late chunks start at "now"
                        let sample = queue.pop_front().unwrap_or(0.0);
                        let value: T = cpal::Sample::from_sample(sample);
                        for slot in frame.iter_mut() {
                            *slot = value;
                        }
                        written.push(sample);
                    }
                }

                shared
                    .playhead
                    .fetch_add(written.len() as u64, Ordering::SeqCst);
                tap.push_samples(&written);
            },
            err_fn,
            None,
        )
        .map_err(|e| AudioError::StreamCreationFailed(e.to_string()))?;

    Ok(stream)
}

/// Handle to an active playback stream.
///
/// Stopping or dropping the handle unblocks the audio thread, which drops
/// the stream and releases the output device. `stop()` is idempotent.
pub struct PlaybackHandle {
    shared: Arc<PlaybackShared>,
    cursor: Mutex<ScheduleCursor>,
    stop_tx: std_mpsc::Sender<()>,
    source_rate: u32,
    device_rate: u32,
}

impl PlaybackHandle {
    /// Schedule one decoded chunk for gapless playback.
    ///
    /// Returns the scheduled start position in device samples.
    pub fn enqueue(&self, samples: &[i16]) -> u64 {
        let upsampled = upsample_to_f32(samples, self.source_rate, self.device_rate);

        let mut queue = match self.shared.queue.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let playhead = self.shared.playhead.load(Ordering::SeqCst);

        let mut cursor = match self.cursor.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let start = cursor.schedule(playhead, upsampled.len() as u64);

        queue.extend(upsampled);
        start
    }

    /// Cancel all pending playback and reset the cursor.
    pub fn flush(&self) {
        let mut queue = match self.shared.queue.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let pending = queue.len();
        queue.clear();

        let mut cursor = match self.cursor.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        cursor.reset();

        if pending > 0 {
            log::debug!("Playback flushed, {} pending samples discarded", pending);
        }
    }

    /// Milliseconds of audio currently queued but not yet played.
    pub fn backlog_ms(&self) -> u64 {
        let queue = match self.shared.queue.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        queue.len() as u64 * 1000 / self.device_rate.max(1) as u64
    }

    /// Flush pending audio and release the output device.
    pub fn stop(&self) {
        self.flush();
        // Err means the audio thread already exited
        let _ = self.stop_tx.send(());
        log::info!("Playback stopped, output device released");
    }
}

/// Convert wire-rate PCM16 to device-rate f32 by sample repetition.
///
/// Supports integer upsampling ratios (24kHz -> 48kHz is 1:2); other ratios
/// pass through at the wire rate with a warning.
fn upsample_to_f32(samples: &[i16], source_rate: u32, target_rate: u32) -> Vec<f32> {
    let to_f32 = |s: i16| s as f32 / i16::MAX as f32;

    if source_rate == 0 || target_rate == 0 || source_rate == target_rate {
        return samples.iter().map(|&s| to_f32(s)).collect();
    }

    if target_rate % source_rate != 0 {
        log::warn!(
            "Unsupported playback resample ratio {}:{}, passing through",
            source_rate,
            target_rate
        );
        return samples.iter().map(|&s| to_f32(s)).collect();
    }

    let ratio = (target_rate / source_rate) as usize;
    let mut out = Vec::with_capacity(samples.len() * ratio);
    for &s in samples {
        let f = to_f32(s);
        for _ in 0..ratio {
            out.push(f);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunks_schedule_back_to_back() {
        let mut cursor = ScheduleCursor::new();

        // Playhead at 0, three chunks arrive in a burst
        let s1 = cursor.schedule(0, 2400);
        let s2 = cursor.schedule(0, 2400);
        let s3 = cursor.schedule(10, 1200);

        assert_eq!(s1, 0);
        assert_eq!(s2, 2400);
        assert_eq!(s3, 4800);
        assert_eq!(cursor.next_start(), 6000);
    }

    #[test]
    fn start_never_precedes_previous_end() {
        let mut cursor = ScheduleCursor::new();
        let mut prev_end = 0u64;
        let mut playhead = 0u64;

        // Mixed arrival pattern: bursts and gaps
        for (advance, len) in [(0, 100), (50, 200), (500, 100), (0, 300), (10_000, 50)] {
            playhead += advance;
            let start = cursor.schedule(playhead, len);
            assert!(
                start >= prev_end,
                "chunk started at {} before previous end {}",
                start,
                prev_end
            );
            prev_end = start + len;
        }
    }

    #[test]
    fn late_chunk_starts_at_playhead() {
        let mut cursor = ScheduleCursor::new();
        cursor.schedule(0, 100);

        // Backlog drained long ago; next chunk plays immediately
        let start = cursor.schedule(5000, 100);
        assert_eq!(start, 5000);
        assert_eq!(cursor.next_start(), 5100);
    }

    #[test]
    fn cursor_is_monotone() {
        let mut cursor = ScheduleCursor::new();
        let mut last = 0;
        for playhead in [0u64, 100, 50, 3000, 2999] {
            cursor.schedule(playhead, 10);
            assert!(cursor.next_start() >= last);
            last = cursor.next_start();
        }
    }

    #[test]
    fn reset_restarts_schedule() {
        let mut cursor = ScheduleCursor::new();
        cursor.schedule(0, 1000);
        cursor.reset();
        assert_eq!(cursor.next_start(), 0);
        assert_eq!(cursor.schedule(0, 10), 0);
    }

    #[test]
    fn upsample_doubles_at_2x() {
        let out = upsample_to_f32(&[i16::MAX, 0], 24000, 48000);
        assert_eq!(out.len(), 4);
        assert!((out[0] - 1.0).abs() < 1e-4);
        assert!((out[1] - 1.0).abs() < 1e-4);
        assert_eq!(out[2], 0.0);
        assert_eq!(out[3], 0.0);
    }

    #[test]
    fn upsample_passthrough_same_rate() {
        let out = upsample_to_f32(&[i16::MAX / 2], 24000, 24000);
        assert_eq!(out.len(), 1);
        assert!((out[0] - 0.5).abs() < 1e-3);
    }

    #[test]
    fn upsample_passthrough_non_integer_ratio() {
        let out = upsample_to_f32(&[100, 200], 24000, 44100);
        assert_eq!(out.len(), 2);
    }

    #[test]
    #[ignore] // Requires an audio output device
    fn test_playback_acquires_device() {
        let playback = AudioPlayback::new();
        assert!(playback.is_ok(), "No output device: {:?}", playback.err());
    }
}
