//! Session error types
//!
//! One taxonomy for everything a voice session can report to its host.
//! Component errors convert into it so `?` routes them through the session.

use thiserror::Error;

use crate::core::codec::CodecError;
use crate::core::devices::DeviceError;
use crate::core::session::SessionState;
use crate::core::transport::TransportError;

/// Result type for session operations
pub type SessionResult<T> = Result<T, SessionError>;

/// Errors surfaced by a voice session
#[derive(Error, Debug, Clone)]
pub enum SessionError {
    // ─────────────────────────────────────────────────────────────────────────────
    // Fatal
    // ─────────────────────────────────────────────────────────────────────────────

    /// Microphone access refused
    #[error("Microphone permission denied: {0}")]
    PermissionDenied(String),

    /// Agent channel failed to open or dropped
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Capture or playback device failed
    #[error(transparent)]
    Device(DeviceError),

    // ─────────────────────────────────────────────────────────────────────────────
    // Recoverable
    // ─────────────────────────────────────────────────────────────────────────────

    /// A frame could not be encoded or decoded; it was dropped
    #[error(transparent)]
    Codec(#[from] CodecError),

    // ─────────────────────────────────────────────────────────────────────────────
    // Caller errors
    // ─────────────────────────────────────────────────────────────────────────────

    /// Operation not allowed in the current state
    #[error("Cannot {operation} while session is {state}")]
    InvalidState {
        operation: &'static str,
        state: SessionState,
    },

    /// `stop()` aborted a `start()` that was still connecting
    #[error("Session start cancelled by stop")]
    Cancelled,

    /// The session coordinator is gone
    #[error("Session coordinator is not running")]
    Shutdown,
}

impl From<DeviceError> for SessionError {
    fn from(error: DeviceError) -> Self {
        match error {
            DeviceError::PermissionDenied(reason) => SessionError::PermissionDenied(reason),
            other => SessionError::Device(other),
        }
    }
}

impl SessionError {
    /// Whether the error ends the session.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SessionError::PermissionDenied(_)
                | SessionError::Transport(_)
                | SessionError::Device(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permission_device_error_maps_to_permission_denied() {
        let err: SessionError = DeviceError::PermissionDenied("blocked".to_string()).into();
        assert!(matches!(err, SessionError::PermissionDenied(ref r) if r == "blocked"));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_other_device_errors_stay_device() {
        let err: SessionError = DeviceError::StreamEnded("gone".to_string()).into();
        assert!(matches!(err, SessionError::Device(DeviceError::StreamEnded(_))));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_codec_error_is_recoverable() {
        let err: SessionError = CodecError::NonFiniteSample { index: 3 }.into();
        assert!(!err.is_fatal());
        assert_eq!(err.to_string(), "Non-finite sample at index 3");
    }

    #[test]
    fn test_invalid_state_message() {
        let err = SessionError::InvalidState {
            operation: "start",
            state: SessionState::Active,
        };
        assert_eq!(err.to_string(), "Cannot start while session is Active");
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_cancelled_and_shutdown_are_not_fatal() {
        assert!(!SessionError::Cancelled.is_fatal());
        assert!(!SessionError::Shutdown.is_fatal());
    }

    #[test]
    fn test_transport_error_conversion() {
        let err: SessionError = TransportError::Timeout("connect".to_string()).into();
        assert!(err.is_fatal());
        assert!(err.to_string().contains("timed out"));
    }
}
