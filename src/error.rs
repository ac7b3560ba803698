//! Error types and result definitions for the lantuya crate.

use thiserror::Error;

/// Represents all possible errors raised while talking to a Tuya device
/// or handling the daemon configuration.
#[derive(Error, Debug, Clone)]
pub enum TuyaError {
    /// Standard IO error (network, timeout, etc.)
    #[error("IO error: {0}")]
    Io(String),

    /// JSON serialization or deserialization error
    #[error("JSON error: {0}")]
    Json(String),

    /// Failed to decrypt a message from the device (wrong key or version)
    #[error("Decryption failed")]
    DecryptionFailed,

    /// Failed to encrypt a message for the device
    #[error("Encryption failed")]
    EncryptionFailed,

    /// The payload received from the device was malformed or unexpected
    #[error("Invalid payload")]
    InvalidPayload,

    /// Cleartext too large for a single frame
    #[error("Payload too large to frame")]
    PayloadTooLarge,

    /// The frame header was invalid (bad prefix or truncated)
    #[error("Invalid frame header")]
    InvalidHeader,

    /// The frame trailer was invalid (bad suffix)
    #[error("Invalid frame trailer")]
    InvalidTrailer,

    /// The length field does not match the received byte count
    #[error("Frame length mismatch")]
    LengthMismatch,

    /// An encrypted frame was received but no local key is known
    #[error("Missing local key")]
    MissingKey,

    /// Request timed out
    #[error("Timeout waiting for device")]
    Timeout,

    /// TCP connection could not be established
    #[error("Socket connection failed")]
    ConnectionFailed,

    /// Unsupported or unparseable protocol version string
    #[error("Unsupported protocol version '{0}'")]
    UnsupportedVersion(String),

    /// Device index or name not present in the table
    #[error("Device '{0}' not found")]
    DeviceNotFound(String),

    /// Configuration blob rejected
    #[error("Configuration error: {0}")]
    Config(String),
}

/// A specialized Result type for lantuya operations.
pub type Result<T> = std::result::Result<T, TuyaError>;

impl From<std::io::Error> for TuyaError {
    fn from(err: std::io::Error) -> Self {
        TuyaError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for TuyaError {
    fn from(err: serde_json::Error) -> Self {
        TuyaError::Json(err.to_string())
    }
}
