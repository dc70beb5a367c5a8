//! Error types for namespace bootstrap and mutex acquisition.
//!
//! Two layers:
//! - [`SystemError`] is what a [`NamespacePlatform`](crate::platform::NamespacePlatform)
//!   reports. The bootstrap retry loop matches on its `AlreadyExists` and
//!   `PathNotFound` variants.
//! - [`NamespaceError`] is what callers of this crate see, carrying the
//!   operation that failed and the underlying system error.

use std::io;
use thiserror::Error;

/// Platform-level failure creating, opening or waiting on a named object.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SystemError {
    /// The object already exists (namespace creation lost the race).
    #[error("Cannot create a file when that file already exists")]
    AlreadyExists,

    /// The object vanished between being observed and being opened.
    #[error("The system cannot find the path specified")]
    PathNotFound,

    /// The caller is not the namespace's trust principal, or the object's
    /// ownership does not match the boundary.
    #[error("Access is denied")]
    AccessDenied,

    /// Any other system failure.
    #[error("{message}")]
    Os { code: i32, message: String },
}

impl SystemError {
    /// Numeric system code for this error.
    pub fn code(&self) -> i32 {
        match self {
            Self::AlreadyExists => nix::errno::Errno::EEXIST as i32,
            Self::PathNotFound => nix::errno::Errno::ENOENT as i32,
            Self::AccessDenied => nix::errno::Errno::EACCES as i32,
            Self::Os { code, .. } => *code,
        }
    }
}

impl From<nix::errno::Errno> for SystemError {
    fn from(errno: nix::errno::Errno) -> Self {
        use nix::errno::Errno;
        match errno {
            Errno::EEXIST | Errno::ENOTEMPTY => Self::AlreadyExists,
            Errno::ENOENT => Self::PathNotFound,
            Errno::EACCES | Errno::EPERM => Self::AccessDenied,
            other => Self::Os {
                code: other as i32,
                message: other.desc().to_string(),
            },
        }
    }
}

impl From<io::Error> for SystemError {
    fn from(err: io::Error) -> Self {
        match err.raw_os_error() {
            Some(code) => nix::errno::Errno::from_i32(code).into(),
            None => match err.kind() {
                io::ErrorKind::AlreadyExists => Self::AlreadyExists,
                io::ErrorKind::NotFound => Self::PathNotFound,
                io::ErrorKind::PermissionDenied => Self::AccessDenied,
                _ => Self::Os {
                    code: -1,
                    message: err.to_string(),
                },
            },
        }
    }
}

/// Renders `"<prefix>: <system message> (Code 0x%08X)"`, the line format
/// used for every logged system failure.
pub fn format_system_error(prefix: &str, err: &SystemError) -> String {
    format!("{}: {} (Code 0x{:08X})", prefix, err, err.code() as u32)
}

/// Errors returned by the namespace runtime.
#[derive(Debug, Error)]
pub enum NamespaceError {
    /// Creating or opening the secured namespace failed.
    #[error("failed to create or open private namespace: {0}")]
    Bootstrap(#[source] SystemError),

    /// The create/open race was retried more often than the configured bound.
    #[error("private namespace kept disappearing after {attempts} attempts")]
    RetriesExhausted { attempts: u32 },

    /// A pool identifier could not be normalized.
    #[error("failed to normalize pool name: {0}")]
    Normalization(String),

    /// Creating or opening a named mutex failed.
    #[error("failed to create mutex {name}: {source}")]
    MutexCreate {
        name: String,
        #[source]
        source: SystemError,
    },

    /// Waiting for ownership of a named mutex failed.
    #[error("failed to acquire mutex {name}: {source}")]
    MutexWait {
        name: String,
        #[source]
        source: SystemError,
    },

    /// A cancellable acquisition was cancelled before ownership was granted.
    #[error("acquisition of {name} was cancelled")]
    Cancelled { name: String },

    /// The blocking worker running an acquisition panicked or was aborted.
    #[error("acquisition worker failed: {0}")]
    Worker(String),

    /// The configuration file could not be read.
    #[error("failed to read configuration {path}: {source}")]
    ConfigIo {
        path: String,
        #[source]
        source: io::Error,
    },

    /// The configuration file could not be parsed.
    #[error("invalid configuration: {0}")]
    Config(#[from] serde_json::Error),
}

impl NamespaceError {
    /// The underlying system error, when one caused this failure.
    pub fn system_error(&self) -> Option<&SystemError> {
        match self {
            Self::Bootstrap(e)
            | Self::MutexCreate { source: e, .. }
            | Self::MutexWait { source: e, .. } => Some(e),
            _ => None,
        }
    }
}

/// Result alias for namespace operations.
pub type Result<T> = std::result::Result<T, NamespaceError>;
