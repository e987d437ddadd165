use std::fmt;

use serde::{Deserialize, Serialize};

/// Wire-level status code delivered with every request callback.
///
/// Module-local error enums carry the detail (source errors, offending
/// values); this is the flattened form a caller can match on without
/// knowing which subsystem produced it.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    /// The operation completed.
    #[default]
    Success,
    /// The dedup index has no room for another entry.
    OutOfSpace,
    /// The physical allocator has no free blocks.
    NoSpace,
    /// An address fell outside the configured ranges.
    OutOfRange,
    /// A block-map entry decoded to an impossible mapping.
    BadMapping,
    /// A page failed self-description checks and cannot be used as read.
    BadPage,
    /// A checksummed structure failed validation on load.
    ChecksumMismatch,
    /// A delta list could not absorb another entry.
    Overflow,
    /// The target is temporarily unable to accept the request.
    Busy,
    /// The request was parked on an internal queue; it will be restarted.
    Queued,
    /// A caller-supplied parameter was rejected.
    InvalidArgument,
    /// The block layer has latched read-only; writes fail fast.
    ReadOnly,
    /// The session is draining and no longer accepts requests.
    ShuttingDown,
    /// An I/O error reached the caller undigested.
    IoError,
    /// The named record does not exist.
    NotFound,
}

impl Status {
    /// Whether this status represents a completed operation.
    pub fn is_ok(self) -> bool {
        self == Status::Success
    }

    /// Whether the request may be retried unchanged with a chance of
    /// success. `Queued` is not retryable by the caller: the core owns
    /// the restart.
    pub fn is_retryable(self) -> bool {
        matches!(self, Status::Busy)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Status::Success => "success",
            Status::OutOfSpace => "out of space",
            Status::NoSpace => "no space",
            Status::OutOfRange => "out of range",
            Status::BadMapping => "bad mapping",
            Status::BadPage => "bad page",
            Status::ChecksumMismatch => "checksum mismatch",
            Status::Overflow => "overflow",
            Status::Busy => "busy",
            Status::Queued => "queued",
            Status::InvalidArgument => "invalid argument",
            Status::ReadOnly => "read-only",
            Status::ShuttingDown => "shutting down",
            Status::IoError => "I/O error",
            Status::NotFound => "not found",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::Status;

    #[test]
    fn default_is_success() {
        assert_eq!(Status::default(), Status::Success);
        assert!(Status::Success.is_ok());
        assert!(!Status::Queued.is_ok());
    }

    #[test]
    fn only_busy_is_caller_retryable() {
        for status in [Status::Queued, Status::ReadOnly, Status::ShuttingDown] {
            assert!(!status.is_retryable(), "{status} should not be retryable");
        }
        assert!(Status::Busy.is_retryable());
    }
}
