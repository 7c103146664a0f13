//! Error kinds for the whisper core — one tagged enum, matching the
//! reference implementation's `(wsp_errornum_t, syserr)` pair.
//!
//! `Io` carries a real `std::io::Error`, which already knows how to surface
//! `raw_os_error()` and a platform `Display`; there is no separate errno
//! field to keep in sync by hand.

use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum WhisperError {
    #[error("Context not initialized")]
    NotInitialized,
    #[error("Context already initialized")]
    AlreadyInitialized,
    #[error("I/O error")]
    Io {
        #[from]
        source: io::Error,
    },
    #[error("Whisper file not open")]
    NotOpen,
    #[error("Whisper file already open")]
    AlreadyOpen,
    #[error("Allocation failure")]
    Alloc,
    #[error("Invalid offset")]
    Offset,
    #[error("Future timestamp")]
    FutureTimestamp,
    #[error("Retention error")]
    Retention,
    #[error("Archive error: {reason}")]
    Archive { reason: String },
    #[error("Point out of bounds: index {index} of {count}")]
    PointOutOfBounds { index: u32, count: u32 },
    #[error("Unknown aggregation: {value}")]
    UnknownAggregation { value: u32 },
    #[error("Archive misaligned: {reason}")]
    ArchiveMisaligned { reason: String },
    #[error("Time interval error")]
    TimeInterval,
}

impl WhisperError {
    /// The OS error number captured on the `Io` variant, if any — the Rust
    /// equivalent of the reference implementation's `wsp_error_t.syserr`.
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            WhisperError::Io { source } => source.raw_os_error(),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, WhisperError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_match_reference_strings() {
        assert_eq!(WhisperError::NotInitialized.to_string(), "Context not initialized");
        assert_eq!(WhisperError::AlreadyInitialized.to_string(), "Context already initialized");
        assert_eq!(WhisperError::NotOpen.to_string(), "Whisper file not open");
        assert_eq!(WhisperError::AlreadyOpen.to_string(), "Whisper file already open");
        assert_eq!(WhisperError::Alloc.to_string(), "Allocation failure");
        assert_eq!(WhisperError::Offset.to_string(), "Invalid offset");
        assert_eq!(WhisperError::FutureTimestamp.to_string(), "Future timestamp");
        assert_eq!(WhisperError::Retention.to_string(), "Retention error");
        assert_eq!(WhisperError::TimeInterval.to_string(), "Time interval error");
    }

    #[test]
    fn io_variant_carries_os_errno() {
        let io_err = io::Error::from_raw_os_error(2); // ENOENT
        let err: WhisperError = io_err.into();
        assert_eq!(err.raw_os_error(), Some(2));
    }
}
