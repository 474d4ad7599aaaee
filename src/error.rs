// SPDX-License-Identifier: MPL-2.0

use std::fmt;

/// The error types used in this crate.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Errno {
    /// An authenticity, freshness, or completeness check on a block failed.
    IntegrityViolation,
    /// Stored bytes decrypted fine but violate structural invariants.
    CorruptedStorage,
    /// Not found.
    NotFound,
    /// An entry with the same name already exists.
    AlreadyExists,
    /// IO error from the underlying storage.
    IoFailed,
    /// Invalid configuration, or local state that does not match it.
    BadConfig,
    /// API misuse by the caller.
    UsageError,
    /// Invalid arguments.
    InvalidArgs,
    /// Encryption operation failed.
    EncryptFailed,
    /// Decryption operation failed.
    DecryptFailed,
}

/// The error with an error type and an error message used in this crate.
#[derive(Clone, Debug)]
pub struct Error {
    errno: Errno,
    msg: Option<&'static str>,
    cause: Option<String>,
}

impl Error {
    /// Creates a new error with the given error type and no error message.
    pub const fn new(errno: Errno) -> Self {
        Error {
            errno,
            msg: None,
            cause: None,
        }
    }

    /// Creates a new error with the given error type and the error message.
    pub const fn with_msg(errno: Errno, msg: &'static str) -> Self {
        Error {
            errno,
            msg: Some(msg),
            cause: None,
        }
    }

    /// Attaches a dynamically-built cause to the error.
    pub fn with_cause(mut self, cause: impl ToString) -> Self {
        self.cause = Some(cause.to_string());
        self
    }

    /// Returns the error type.
    pub fn errno(&self) -> Errno {
        self.errno
    }
}

impl From<Errno> for Error {
    fn from(errno: Errno) -> Self {
        Error::new(errno)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        let errno = match err.kind() {
            std::io::ErrorKind::NotFound => Errno::NotFound,
            std::io::ErrorKind::AlreadyExists => Errno::AlreadyExists,
            _ => Errno::IoFailed,
        };
        Error::new(errno).with_cause(err)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.errno)?;
        if let Some(msg) = self.msg {
            write!(f, ": {}", msg)?;
        }
        if let Some(cause) = &self.cause {
            write!(f, " (caused by: {})", cause)?;
        }
        Ok(())
    }
}

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl std::error::Error for Error {}

#[macro_export]
macro_rules! return_errno {
    ($errno: expr) => {
        return core::result::Result::Err($crate::Error::new($errno))
    };
}

#[macro_export]
macro_rules! return_errno_with_msg {
    ($errno: expr, $msg: expr) => {
        return core::result::Result::Err($crate::Error::with_msg($errno, $msg))
    };
}
