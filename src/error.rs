use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LaminaError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Verification failed: {0}")]
    Verification(String),

    #[error("Unsupported algorithm: {0}")]
    UnsupportedAlgorithm(String),

    #[error("Compression error: {0}")]
    Compression(String),

    #[error("Decompression error: {0}")]
    Decompression(String),

    #[error("Key wrap error: {0}")]
    KeyWrap(String),
}

pub type Result<T> = std::result::Result<T, LaminaError>;

impl LaminaError {
    /// True when the error means the persisted metadata or stream layout is
    /// malformed, as opposed to data that fails authentication.
    pub fn is_protocol(&self) -> bool {
        matches!(self, LaminaError::Protocol(_))
    }

    /// True when recomputed digest/MAC material does not match a stored tag.
    pub fn is_verification(&self) -> bool {
        matches!(self, LaminaError::Verification(_))
    }
}

/// Carry a codec error through a `std::io` trait boundary without losing it.
/// Protocol and verification failures map to `InvalidData`; the original
/// error stays attached as the source so callers can downcast.
impl From<LaminaError> for io::Error {
    fn from(err: LaminaError) -> io::Error {
        match err {
            LaminaError::Io(e) => e,
            LaminaError::Protocol(_) | LaminaError::Verification(_) => {
                io::Error::new(io::ErrorKind::InvalidData, err)
            }
            other => io::Error::other(other),
        }
    }
}
