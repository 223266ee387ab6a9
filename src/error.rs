use std::fmt;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum NvError {
    #[error("I/O Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Object allocation failed: {0}")]
    AllocationFailure(String),

    #[error("Memory mapping failed: {0}")]
    MappingFailure(String),

    #[error("Control call failed: {0}")]
    ControlCallFailure(String),

    #[error("Channel scheduling failed: {0}")]
    SchedulingFailure(String),

    #[error("Submission did not complete within {waited:?}")]
    SubmissionTimeout { waited: Duration },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),
}

// A convenient alias
pub type NvResult<T> = Result<T, NvError>;

/// Raw status word returned by the resource manager and the UVM driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RmStatus(pub u32);

impl RmStatus {
    pub const OK: Self = Self(0x0000_0000);

    #[must_use]
    pub const fn is_ok(self) -> bool {
        self.0 == Self::OK.0
    }

    #[must_use]
    pub const fn name(self) -> Option<&'static str> {
        match self.0 {
            0x0000_0000 => Some("NV_OK"),
            0x0000_0003 => Some("NV_ERR_BUSY_RETRY"),
            0x0000_001B => Some("NV_ERR_INSUFFICIENT_PERMISSIONS"),
            0x0000_001E => Some("NV_ERR_INVALID_ADDRESS"),
            0x0000_001F => Some("NV_ERR_INVALID_ARGUMENT"),
            0x0000_0022 => Some("NV_ERR_INVALID_CLASS"),
            0x0000_0023 => Some("NV_ERR_INVALID_CLIENT"),
            0x0000_0026 => Some("NV_ERR_INVALID_DEVICE"),
            0x0000_0029 => Some("NV_ERR_INVALID_FLAGS"),
            0x0000_0040 => Some("NV_ERR_INVALID_STATE"),
            0x0000_0051 => Some("NV_ERR_NO_MEMORY"),
            0x0000_0056 => Some("NV_ERR_NOT_SUPPORTED"),
            0x0000_0057 => Some("NV_ERR_OBJECT_NOT_FOUND"),
            _ => None,
        }
    }
}

impl fmt::Display for RmStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{name} (0x{:x})", self.0),
            None => write!(f, "0x{:x}", self.0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_display_names_known_codes() {
        assert_eq!(RmStatus(0x1F).to_string(), "NV_ERR_INVALID_ARGUMENT (0x1f)");
        assert_eq!(RmStatus(0xdead).to_string(), "0xdead");
        assert!(RmStatus::OK.is_ok());
    }

    #[test]
    fn timeout_message_carries_the_bound() {
        let err = NvError::SubmissionTimeout {
            waited: Duration::from_millis(5),
        };
        assert_eq!(err.to_string(), "Submission did not complete within 5ms");
    }
}
