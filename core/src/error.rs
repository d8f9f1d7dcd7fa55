//! # Error Types
//!
//! The library-wide status surface. Every public entrypoint resolves to
//! one of these kinds; lower layers log the failing detail before the
//! error propagates.

use std::fmt;

use rdtk_hal::HwError;

/// Library error
#[derive(Debug)]
pub enum Error {
    /// Caller violated a precondition (empty topology, CDP required on a
    /// platform that cannot provide it, value out of range)
    InvalidParam,
    /// The platform exposes neither monitoring nor allocation, or the
    /// requested capability is absent
    NotSupported,
    /// A CPUID or MSR primitive failed, or cross-socket register state
    /// disagreed
    Hardware(HwError),
    /// Operation issued in the wrong lifecycle state
    InitState,
    /// Bounded storage for capability data overflowed
    OutOfMemory,
    /// A lower layer came up but a higher layer could not
    Generic,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidParam => write!(f, "invalid parameter"),
            Error::NotSupported => write!(f, "capability not supported"),
            Error::Hardware(e) => write!(f, "hardware access failed: {e}"),
            Error::InitState => write!(f, "wrong library state for this operation"),
            Error::OutOfMemory => write!(f, "capability storage exhausted"),
            Error::Generic => write!(f, "subsystem bring-up failed"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Hardware(e) => Some(e),
            _ => None,
        }
    }
}

impl From<HwError> for Error {
    fn from(e: HwError) -> Self {
        Error::Hardware(e)
    }
}

/// Result alias used across the crate
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hardware_errors_keep_their_source() {
        let err = Error::from(HwError::Unsupported);
        assert!(matches!(err, Error::Hardware(HwError::Unsupported)));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn display_is_stable() {
        assert_eq!(Error::InitState.to_string(), "wrong library state for this operation");
        assert_eq!(Error::InvalidParam.to_string(), "invalid parameter");
    }
}
