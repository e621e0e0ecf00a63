//! Capture-plane error kinds.

/// Errors surfaced by the capture plane: driver connect/capture lifecycle,
/// transport, and validation failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CaptureError {
    #[error("no error")]
    None,
    #[error("a capture is already in progress")]
    Busy,
    #[error("invalid capture parameters: {0}")]
    BadParams(String),
    #[error("hardware error: {0}")]
    HardwareError(String),
    #[error("unexpected error: {0}")]
    UnexpectedError(String),
    #[error("network command timed out")]
    NetworkTimeout,
    #[error("invalid frame")]
    InvalidFrame,
    #[error("invalid version string: {0}")]
    InvalidVersion(String),
    #[error("invalid frequency: {0}")]
    InvalidFrequency(String),
    #[error("invalid buffer size: {0}")]
    InvalidBufferSize(String),
    #[error("invalid channel count: {0}")]
    InvalidChannelCount(String),
    #[error("connection refused")]
    ConnectionRefused,
    #[error("device is disconnected")]
    Disconnected,
    #[error("bootloader entry failed")]
    BootloaderFailed,
}

pub type CaptureResult<T> = Result<T, CaptureError>;
