//! Error taxonomy shared by every subsystem.

use std::fmt;
use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Failure reported by a `VariableStore` backend.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("variable not found")]
    NotFound,
    #[error("permission denied")]
    PermissionDenied,
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound)
    }

    /// Classify an `io::Error` coming out of a filesystem-backed store.
    pub fn from_io(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => StoreError::NotFound,
            io::ErrorKind::PermissionDenied => StoreError::PermissionDenied,
            _ => StoreError::Io(err),
        }
    }
}

/// Which store primitive failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOp {
    Read,
    Write,
    Delete,
}

impl fmt::Display for StoreOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StoreOp::Read => "read",
            StoreOp::Write => "write",
            StoreOp::Delete => "delete",
        })
    }
}

/// Password gate failures. Each one aborts the operation it guards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("no password of acceptable length was entered")]
    LengthPolicyExhausted,
    #[error("password confirmation did not match")]
    ConfirmationExhausted,
    #[error("password does not match the pending request")]
    VerificationFailed,
    #[error("password input closed")]
    InputClosed,
}

#[derive(Debug, Error)]
pub enum MokError {
    #[error("failed to read {}: {source}", path.display())]
    Input {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("{} is too large for a signature list", path.display())]
    TooLarge { path: PathBuf },
    #[error("failed to {op} {var}: {source}")]
    Store {
        op: StoreOp,
        var: String,
        #[source]
        source: StoreError,
    },
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error("terminal error: {0}")]
    Terminal(#[source] io::Error),
    #[error("failed to write {}: {source}", path.display())]
    Output {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("malformed {var}: {reason}")]
    Malformed { var: String, reason: &'static str },
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl MokError {
    pub fn store(op: StoreOp, var: impl fmt::Display, source: StoreError) -> Self {
        MokError::Store {
            op,
            var: var.to_string(),
            source,
        }
    }

    pub fn is_auth(&self) -> bool {
        matches!(self, MokError::Auth(_))
    }
}

pub type MokResult<T> = Result<T, MokError>;
