//! Audio pipeline: capture, playback scheduling, and analysis taps
//!
//! Capture and playback each own one CPAL stream as a scoped resource;
//! dropping a handle releases its device. The analyser taps observe both
//! paths without consuming them.

pub mod analyser;
pub mod capture;
pub mod frame_queue;
pub mod playback;

pub use analyser::{AnalyserTap, AudioVisualizerData};
pub use capture::{AudioCapture, CaptureHandle};
pub use frame_queue::{AudioFrame, FrameQueue};
pub use playback::{AudioPlayback, PlaybackHandle, ScheduleCursor};

/// Errors from device acquisition or stream setup.
#[derive(Debug, Clone)]
pub enum AudioError {
    NoInputDevice,
    NoOutputDevice,
    NoSupportedConfig,
    PermissionDenied(String),
    StreamCreationFailed(String),
}

impl std::fmt::Display for AudioError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AudioError::NoInputDevice => write!(f, "No audio input device found"),
            AudioError::NoOutputDevice => write!(f, "No audio output device found"),
            AudioError::NoSupportedConfig => write!(f, "No supported audio configuration"),
            AudioError::PermissionDenied(e) => {
                write!(f, "Microphone access denied: {}", e)
            }
            AudioError::StreamCreationFailed(e) => {
                write!(f, "Failed to create audio stream: {}", e)
            }
        }
    }
}

impl std::error::Error for AudioError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_audio_error_display() {
        assert!(AudioError::NoInputDevice.to_string().contains("input"));
        assert!(AudioError::NoOutputDevice.to_string().contains("output"));
        assert!(AudioError::PermissionDenied("denied".into())
            .to_string()
            .contains("denied"));
    }
}
