//! Error types for unbox-core

use crate::engine::ExtractionOutput;
use crate::format::ArchiveFormat;
use serde::Serialize;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Core error types for the unbox library
#[derive(Error, Debug)]
pub enum Error {
    /// Input bytes could not be classified or a decoder rejected them as corrupt
    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    /// The format was recognised but no strategy is registered for it
    #[error("Unsupported format: {0}")]
    UnsupportedFormat(ArchiveFormat),

    /// An entry failed one of the enabled security checks
    #[error("Security violation: {0}")]
    SecurityViolation(SecurityViolation),

    /// A byte ceiling was crossed
    #[error("Size limit exceeded ({kind}): limit {limit} bytes{}", .path.as_deref().map(|p| format!(" at {p}")).unwrap_or_default())]
    SizeLimitExceeded {
        kind: SizeLimitKind,
        limit: u64,
        path: Option<String>,
    },

    /// The archive holds more entries than the policy allows
    #[error("Entry count {count} exceeds maximum of {limit}")]
    CountLimitExceeded { count: usize, limit: usize },

    /// I/O operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The archive is encrypted and no password was supplied
    #[error("Archive is encrypted and requires a password")]
    PasswordRequired,

    /// The supplied password was rejected by the decoder
    #[error("Incorrect password")]
    PasswordIncorrect,

    /// The concurrent batch did not finish in time; `partial` holds what was
    /// recorded before the deadline
    #[error("Extraction timed out after {timeout:?} ({} files completed)", .partial.files.len())]
    Timeout {
        timeout: Duration,
        partial: Box<ExtractionOutput>,
    },

    /// Work was cancelled or a resource was shut down underneath it
    #[error("Interrupted: {0}")]
    Interrupted(String),

    /// Configuration-related error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Anything else, always carrying the original cause
    #[error("{context}: {source}")]
    Unknown {
        context: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

/// Sub-kinds of [`Error::SecurityViolation`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SecurityViolation {
    /// Entry path is absolute or resolves outside the extraction root
    PathTraversal { path: String },
    /// Entry extension is not in the allow-list
    DisallowedFileType { path: String, extension: String },
    /// The content inspector refused the entry
    ContentRejected { path: String, reason: String },
}

impl fmt::Display for SecurityViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SecurityViolation::PathTraversal { path } => {
                write!(f, "path traversal attempt: {:?}", path)
            }
            SecurityViolation::DisallowedFileType { path, extension } => {
                write!(f, "file type {:?} not allowed: {:?}", extension, path)
            }
            SecurityViolation::ContentRejected { path, reason } => {
                write!(f, "content rejected for {:?}: {}", path, reason)
            }
        }
    }
}

/// Which ceiling a [`Error::SizeLimitExceeded`] refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SizeLimitKind {
    /// Bytes written for a single entry
    PerFile,
    /// Bytes written across the whole call
    Aggregate,
    /// Decoded outer layer of a single-file or compound format
    CompoundInput,
    /// Raw compressed input, checked before decoding starts
    Input,
}

impl fmt::Display for SizeLimitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SizeLimitKind::PerFile => write!(f, "per-file"),
            SizeLimitKind::Aggregate => write!(f, "aggregate"),
            SizeLimitKind::CompoundInput => write!(f, "compound input"),
            SizeLimitKind::Input => write!(f, "input"),
        }
    }
}

/// Fieldless discriminant of [`Error`], used as a metrics key and in failure records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidFormat,
    UnsupportedFormat,
    PathTraversal,
    DisallowedFileType,
    ContentRejected,
    SizeLimitPerFile,
    SizeLimitAggregate,
    SizeLimitCompoundInput,
    SizeLimitInput,
    CountLimit,
    Io,
    PasswordRequired,
    PasswordIncorrect,
    Timeout,
    Interrupted,
    Config,
    Unknown,
}

impl ErrorKind {
    /// Every kind, in declaration order
    pub const ALL: [ErrorKind; 17] = [
        ErrorKind::InvalidFormat,
        ErrorKind::UnsupportedFormat,
        ErrorKind::PathTraversal,
        ErrorKind::DisallowedFileType,
        ErrorKind::ContentRejected,
        ErrorKind::SizeLimitPerFile,
        ErrorKind::SizeLimitAggregate,
        ErrorKind::SizeLimitCompoundInput,
        ErrorKind::SizeLimitInput,
        ErrorKind::CountLimit,
        ErrorKind::Io,
        ErrorKind::PasswordRequired,
        ErrorKind::PasswordIncorrect,
        ErrorKind::Timeout,
        ErrorKind::Interrupted,
        ErrorKind::Config,
        ErrorKind::Unknown,
    ];

    pub(crate) fn ordinal(self) -> usize {
        self as usize
    }
}

impl Error {
    /// Discriminant of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidFormat(_) => ErrorKind::InvalidFormat,
            Error::UnsupportedFormat(_) => ErrorKind::UnsupportedFormat,
            Error::SecurityViolation(SecurityViolation::PathTraversal { .. }) => {
                ErrorKind::PathTraversal
            }
            Error::SecurityViolation(SecurityViolation::DisallowedFileType { .. }) => {
                ErrorKind::DisallowedFileType
            }
            Error::SecurityViolation(SecurityViolation::ContentRejected { .. }) => {
                ErrorKind::ContentRejected
            }
            Error::SizeLimitExceeded { kind, .. } => match kind {
                SizeLimitKind::PerFile => ErrorKind::SizeLimitPerFile,
                SizeLimitKind::Aggregate => ErrorKind::SizeLimitAggregate,
                SizeLimitKind::CompoundInput => ErrorKind::SizeLimitCompoundInput,
                SizeLimitKind::Input => ErrorKind::SizeLimitInput,
            },
            Error::CountLimitExceeded { .. } => ErrorKind::CountLimit,
            Error::Io(_) => ErrorKind::Io,
            Error::PasswordRequired => ErrorKind::PasswordRequired,
            Error::PasswordIncorrect => ErrorKind::PasswordIncorrect,
            Error::Timeout { .. } => ErrorKind::Timeout,
            Error::Interrupted(_) => ErrorKind::Interrupted,
            Error::Config(_) => ErrorKind::Config,
            Error::Unknown { .. } => ErrorKind::Unknown,
        }
    }

    pub(crate) fn path_traversal(path: impl Into<String>) -> Self {
        Error::SecurityViolation(SecurityViolation::PathTraversal { path: path.into() })
    }

    pub(crate) fn unknown(
        context: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Error::Unknown {
            context: context.into(),
            source: Box::new(source),
        }
    }
}

impl From<zip::result::ZipError> for Error {
    fn from(err: zip::result::ZipError) -> Self {
        use zip::result::ZipError;
        match err {
            ZipError::Io(e) => Error::Io(e),
            ZipError::InvalidPassword => Error::PasswordIncorrect,
            ZipError::UnsupportedArchive(msg) if msg == ZipError::PASSWORD_REQUIRED => {
                Error::PasswordRequired
            }
            ZipError::InvalidArchive(msg) => Error::InvalidFormat(format!("zip: {}", msg)),
            ZipError::FileNotFound => Error::InvalidFormat("zip: entry not found".to_string()),
            other => Error::unknown("zip decoder", other),
        }
    }
}

impl From<sevenz_rust::Error> for Error {
    fn from(err: sevenz_rust::Error) -> Self {
        use sevenz_rust::Error as SzError;
        match err {
            SzError::PasswordRequired => Error::PasswordRequired,
            SzError::MaybeBadPassword(_) => Error::PasswordIncorrect,
            SzError::BadSignature(_) => Error::InvalidFormat("7z: bad signature".to_string()),
            other => Error::unknown("7z decoder", other),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
