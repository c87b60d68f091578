//! Status codes and error type for broker operations.
//!
//! A `Code` enum mirroring the gRPC canonical status numbers, paired with a
//! `Status` carrying a code and a message. The emulator never touches the
//! network, so `Status` is a plain `thiserror` type rather than a wrapper
//! around a wire error.

use thiserror::Error;

/// gRPC-aligned status codes.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Code {
    Ok = 0,
    Cancelled = 1,
    InvalidArgument = 3,
    NotFound = 5,
    AlreadyExists = 6,
    PermissionDenied = 7,
    FailedPrecondition = 9,
    Unimplemented = 12,
    Internal = 13,
}

impl Code {
    pub fn description(&self) -> &'static str {
        match self {
            Code::Ok => "the operation completed successfully",
            Code::Cancelled => "the operation was cancelled",
            Code::InvalidArgument => "client specified an invalid argument",
            Code::NotFound => "some requested entity was not found",
            Code::AlreadyExists => "some entity that we attempted to create already exists",
            Code::PermissionDenied => "the caller does not have permission to execute the specified operation",
            Code::FailedPrecondition => "the system is not in a state required for the operation's execution",
            Code::Unimplemented => "operation is not implemented or not supported",
            Code::Internal => "internal error",
        }
    }
}

/// An error returned by the broker or one of its collaborators.
#[derive(Error, Clone, Debug)]
#[error("{code:?}: {message}")]
pub struct Status {
    code: Code,
    message: String,
}

impl Status {
    pub fn new(code: Code, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn code(&self) -> Code {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(Code::InvalidArgument, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(Code::NotFound, message)
    }

    pub fn already_exists(message: impl Into<String>) -> Self {
        Self::new(Code::AlreadyExists, message)
    }

    pub fn failed_precondition(message: impl Into<String>) -> Self {
        Self::new(Code::FailedPrecondition, message)
    }

    pub fn unimplemented(message: impl Into<String>) -> Self {
        Self::new(Code::Unimplemented, message)
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(Code::Cancelled, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(Code::Internal, message)
    }
}

pub type Result<T> = std::result::Result<T, Status>;
