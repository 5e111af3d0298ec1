//! Passive volume analysis for visualization
//!
//! An [`AnalyserTap`] is a non-destructive read tap over a live audio path.
//! The capture and playback callbacks push copies of their samples into the
//! tap; the presentation layer polls [`AnalyserTap::volume`] on its own
//! render clock. The tap never feeds anything back into the signal, so any
//! number of taps can coexist with real consumption.

use std::collections::VecDeque;
use std::sync::Mutex;

use serde::Serialize;

/// Analysis window (~200ms at 24kHz mono)
const BUFFER_CAPACITY: usize = 4800;

/// EMA smoothing factor (0.3 = 30% new value, 70% previous)
const EMA_ALPHA: f32 = 0.3;

/// Instantaneous volume snapshot, recomputed on every poll
#[derive(Debug, Clone, Copy, Serialize)]
pub struct AudioVisualizerData {
    /// RMS level of the recent window, clamped to 0.0..=1.0
    pub volume: f32,
}

struct TapInner {
    samples: VecDeque<f32>,
    smoothed: f32,
    initialized: bool,
}

/// Read-only volume tap over a live audio signal
///
/// Shared between an audio callback (producer) and the presentation layer
/// (reader) behind an internal lock; both operations are short and
/// allocation-free.
pub struct AnalyserTap {
    inner: Mutex<TapInner>,
}

impl AnalyserTap {
    /// Create a tap with an empty analysis window
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(TapInner {
                samples: VecDeque::with_capacity(BUFFER_CAPACITY),
                smoothed: 0.0,
                initialized: false,
            }),
        }
    }

    /// Feed a copy of signal samples (normalized -1.0..=1.0) into the window
    ///
    /// Oldest samples are evicted once the window is full.
    pub fn push_samples(&self, samples: &[f32]) {
        let mut inner = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        let len = samples.len();

        // If one batch exceeds the window, keep only its tail
        if len >= BUFFER_CAPACITY {
            inner.samples.clear();
            inner.samples.extend(&samples[len - BUFFER_CAPACITY..]);
            return;
        }

        let to_remove = (inner.samples.len() + len).saturating_sub(BUFFER_CAPACITY);
        if to_remove > 0 {
            inner.samples.drain(0..to_remove);
        }

        inner.samples.extend(samples);
    }

    /// Compute the current volume with EMA smoothing applied
    pub fn volume(&self) -> AudioVisualizerData {
        let mut inner = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        let raw = if inner.samples.is_empty() {
            0.0
        } else {
            let sum_squares: f64 = inner
                .samples
                .iter()
                .map(|&s| {
                    let s = s as f64;
                    s * s
                })
                .sum();
            let rms = (sum_squares / inner.samples.len() as f64).sqrt();
            (rms as f32).clamp(0.0, 1.0)
        };

        let volume = if inner.initialized {
            EMA_ALPHA * raw + (1.0 - EMA_ALPHA) * inner.smoothed
        } else {
            inner.initialized = true;
            raw
        };
        inner.smoothed = volume;

        AudioVisualizerData {
            volume: volume.clamp(0.0, 1.0),
        }
    }

    /// Clear the window and smoothing state
    pub fn reset(&self) {
        let mut inner = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        inner.samples.clear();
        inner.smoothed = 0.0;
        inner.initialized = false;
    }
}

impl Default for AnalyserTap {
    fn default() -> Self {
        Self::new()
    }
}
