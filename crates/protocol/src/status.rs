//! Error codes and operation status values
//!
//! Error codes returned to callers are strictly negative, device/operation
//! status values are non-negative, and "no error" is exactly zero. Both are
//! packed into the upper 16 bits of a single `i32` by [`make_error`], so the
//! two ranges never overlap.

use crate::error::{ProtocolError, Result};

/// Error codes for the user-space tools and library
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    PortFull = -9,
    Driver = -8,
    NotExist = -7,
    Status = -6,
    Protocol = -5,
    Version = -4,
    Network = -3,
    InvArg = -2,
    General = -1,
    None = 0,
}

impl TryFrom<i32> for ErrorCode {
    type Error = ProtocolError;

    fn try_from(value: i32) -> Result<Self> {
        Ok(match value {
            -9 => Self::PortFull,
            -8 => Self::Driver,
            -7 => Self::NotExist,
            -6 => Self::Status,
            -5 => Self::Protocol,
            -4 => Self::Version,
            -3 => Self::Network,
            -2 => Self::InvArg,
            -1 => Self::General,
            0 => Self::None,
            _ => {
                return Err(ProtocolError::InvalidValue {
                    what: "error code",
                    value: value.into(),
                });
            }
        })
    }
}

/// Operation status reported by the exporting host
///
/// `DevErr` and `Error` are separate codes and never collapsed.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpStatus {
    Ok = 0,
    /// Device is not available
    Na = 1,
    /// Device is already in use
    DevBusy = 2,
    /// Device is in an error state
    DevErr = 3,
    /// Requested bus-id not found
    NoDev = 4,
    Error = 5,
}

impl TryFrom<i32> for OpStatus {
    type Error = ProtocolError;

    fn try_from(value: i32) -> Result<Self> {
        Ok(match value {
            0 => Self::Ok,
            1 => Self::Na,
            2 => Self::DevBusy,
            3 => Self::DevErr,
            4 => Self::NoDev,
            5 => Self::Error,
            _ => {
                return Err(ProtocolError::InvalidValue {
                    what: "op status",
                    value: value.into(),
                });
            }
        })
    }
}

/// Result of unpacking a value produced by [`make_error`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Error(ErrorCode),
    Status(OpStatus),
}

/// Pack an error code, or a non-OK status which takes precedence, into one value
pub const fn make_error(err: ErrorCode, status: OpStatus) -> i32 {
    let value = match status {
        OpStatus::Ok => err as i32,
        status => status as i32,
    };
    value << 16
}

/// Inverse of [`make_error`]
///
/// Zero decodes as `Outcome::Error(ErrorCode::None)`.
pub fn split_error(packed: i32) -> Result<Outcome> {
    let value = packed >> 16;
    if value > 0 {
        OpStatus::try_from(value).map(Outcome::Status)
    } else {
        ErrorCode::try_from(value).map(Outcome::Error)
    }
}
