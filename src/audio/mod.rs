//! Audio input and output for live sessions
//!
//! Capture and playback are reached through traits so the session core can
//! run against real devices (cpal, behind the `device-audio` feature) or
//! against in-memory fakes in tests.

pub mod capture;
#[cfg(feature = "device-audio")]
pub mod device;
pub mod pcm;
pub mod playback;

pub use capture::{
    spawn_pump, CaptureConstraints, CaptureHandle, CaptureStream, MicrophoneSource,
};
pub use playback::{AudioOutput, OutputStream, PlaybackClock, PlaybackQueue};

/// Errors raised by audio devices
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AudioError {
    #[error("No audio input device found")]
    NoInputDevice,
    #[error("No audio output device found")]
    NoOutputDevice,
    #[error("Microphone access denied: {0}")]
    PermissionDenied(String),
    #[error("No supported audio configuration")]
    NoSupportedConfig,
    #[error("Failed to create audio stream: {0}")]
    StreamCreationFailed(String),
    #[error("Audio device error: {0}")]
    DeviceError(String),
}

impl AudioError {
    /// Whether retrying cannot help without user action
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            AudioError::NoInputDevice
                | AudioError::NoOutputDevice
                | AudioError::PermissionDenied(_)
                | AudioError::NoSupportedConfig
        )
    }
}
