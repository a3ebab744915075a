//! Result codes shared by every channel
//!
//! Every per-request failure is reported to the peer as a negative integer in the
//! first reply argument. Nothing in here is fatal to the master process.

use thiserror::Error;

/// Status codes returned to viewers and workers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum ErrorCode {
    #[error("target does not exist")]
    NotExist,

    #[error("invalid parameter")]
    InvalidParameter,

    #[error("target is in a faulted state")]
    Fault,

    #[error("a conflicting operation is in flight")]
    Busy,

    #[error("desired state already holds")]
    Already,

    #[error("permission denied")]
    PermissionDenied,

    #[error("timed out")]
    Timeout,

    #[error("out of memory")]
    OutOfMemory,

    #[error("disabled")]
    Disabled,

    #[error("no space left")]
    NoSpace,

    #[error("canceled")]
    Canceled,

    #[error("invalid state")]
    InvalidState,

    #[error("already exists")]
    Exist,

    #[error("i/o error")]
    Io,
}

/// Result type for registry and dispatcher operations
pub type WmResult<T> = Result<T, ErrorCode>;

impl ErrorCode {
    /// Wire code (negative errno style, 0 is success)
    pub fn code(self) -> i32 {
        match self {
            Self::NotExist => -2,
            Self::Io => -5,
            Self::OutOfMemory => -12,
            Self::PermissionDenied => -13,
            Self::Fault => -14,
            Self::Busy => -16,
            Self::Exist => -17,
            Self::InvalidParameter => -22,
            Self::NoSpace => -28,
            Self::InvalidState => -77,
            Self::Disabled => -95,
            Self::Timeout => -110,
            Self::Already => -114,
            Self::Canceled => -125,
        }
    }

    /// Map a wire code back to an error. `None` for success or unknown codes.
    pub fn from_code(code: i32) -> Option<Self> {
        let err = match code {
            -2 => Self::NotExist,
            -5 => Self::Io,
            -12 => Self::OutOfMemory,
            -13 => Self::PermissionDenied,
            -14 => Self::Fault,
            -16 => Self::Busy,
            -17 => Self::Exist,
            -22 => Self::InvalidParameter,
            -28 => Self::NoSpace,
            -77 => Self::InvalidState,
            -95 => Self::Disabled,
            -110 => Self::Timeout,
            -114 => Self::Already,
            -125 => Self::Canceled,
            _ => return None,
        };
        Some(err)
    }

    /// Turn a `ret` value received from a peer into a result
    pub fn check(ret: i32) -> WmResult<i32> {
        if ret >= 0 {
            Ok(ret)
        } else {
            Err(Self::from_code(ret).unwrap_or(Self::Fault))
        }
    }
}

impl From<std::io::Error> for ErrorCode {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::NotFound => Self::NotExist,
            std::io::ErrorKind::PermissionDenied => Self::PermissionDenied,
            std::io::ErrorKind::AlreadyExists => Self::Exist,
            std::io::ErrorKind::TimedOut => Self::Timeout,
            std::io::ErrorKind::OutOfMemory => Self::OutOfMemory,
            std::io::ErrorKind::StorageFull => Self::NoSpace,
            _ => Self::Io,
        }
    }
}

/// Convert a result into the `ret` argument of a reply
pub fn ret_code<T>(result: &WmResult<T>) -> i32 {
    match result {
        Ok(_) => 0,
        Err(e) => e.code(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [ErrorCode; 14] = [
        ErrorCode::NotExist,
        ErrorCode::InvalidParameter,
        ErrorCode::Fault,
        ErrorCode::Busy,
        ErrorCode::Already,
        ErrorCode::PermissionDenied,
        ErrorCode::Timeout,
        ErrorCode::OutOfMemory,
        ErrorCode::Disabled,
        ErrorCode::NoSpace,
        ErrorCode::Canceled,
        ErrorCode::InvalidState,
        ErrorCode::Exist,
        ErrorCode::Io,
    ];

    #[test]
    fn test_codes_are_negative_and_unique() {
        let mut seen = std::collections::HashSet::new();
        for err in ALL {
            assert!(err.code() < 0, "{err:?} must be negative");
            assert!(seen.insert(err.code()), "{err:?} code collides");
            assert_eq!(ErrorCode::from_code(err.code()), Some(err));
        }
    }

    #[test]
    fn test_check_accepts_non_negative() {
        assert_eq!(ErrorCode::check(0), Ok(0));
        assert_eq!(ErrorCode::check(3), Ok(3));
        assert_eq!(ErrorCode::check(-110), Err(ErrorCode::Timeout));
        assert_eq!(ErrorCode::check(-9999), Err(ErrorCode::Fault));
    }

    #[test]
    fn test_io_error_mapping() {
        let e = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        assert_eq!(ErrorCode::from(e), ErrorCode::NotExist);
    }

    #[test]
    fn test_ret_code() {
        assert_eq!(ret_code::<()>(&Ok(())), 0);
        assert_eq!(ret_code::<()>(&Err(ErrorCode::Busy)), -16);
    }
}
