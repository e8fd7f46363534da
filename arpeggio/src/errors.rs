//! Definition of errors.

use std::error::Error;
use std::fmt;

/// A specialized Result type for Arpeggio.
pub type Result<T, E = ArpeggioError> = std::result::Result<T, E>;

/// The error type for Arpeggio.
#[derive(Debug, thiserror::Error)]
pub enum ArpeggioError {
    /// The error variant for [`ConfigError`].
    #[error(transparent)]
    Config(ConfigError),

    /// The error variant for [`FormatError`].
    #[error(transparent)]
    Format(FormatError),

    /// The error variant for [`BuildError`].
    #[error(transparent)]
    Build(BuildError),

    /// The error variant for [`QueryError`].
    #[error(transparent)]
    Query(QueryError),

    /// The error variant for [`ParseFloatError`](std::num::ParseFloatError).
    #[error(transparent)]
    ParseFloat(#[from] std::num::ParseFloatError),

    /// The error variant for [`ParseIntError`](std::num::ParseIntError).
    #[error(transparent)]
    ParseInt(#[from] std::num::ParseIntError),

    /// The error variant for [`TryFromIntError`](std::num::TryFromIntError).
    #[error(transparent)]
    TryFromInt(#[from] std::num::TryFromIntError),

    /// The error variant for [`std::str::Utf8Error`].
    #[error(transparent)]
    Utf8(#[from] std::str::Utf8Error),

    /// The error variant for [`std::io::Error`].
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// The error variant for [`rkyv::rancor::Error`].
    #[error(transparent)]
    Rkyv(#[from] rkyv::rancor::Error),
}

impl ArpeggioError {
    pub(crate) fn invalid_config<S>(arg: &'static str, msg: S) -> Self
    where
        S: Into<String>,
    {
        Self::Config(ConfigError {
            arg,
            msg: msg.into(),
        })
    }

    pub(crate) fn invalid_format<S>(what: &'static str, msg: S) -> Self
    where
        S: Into<String>,
    {
        Self::Format(FormatError {
            what,
            msg: msg.into(),
        })
    }

    pub(crate) fn build_failed<S>(what: &'static str, msg: S) -> Self
    where
        S: Into<String>,
    {
        Self::Build(BuildError {
            what,
            msg: msg.into(),
        })
    }

    pub(crate) fn invalid_query<S>(msg: S) -> Self
    where
        S: Into<String>,
    {
        Self::Query(QueryError { msg: msg.into() })
    }
}

/// Error used when a build or load parameter is invalid.
#[derive(Debug)]
pub struct ConfigError {
    /// Name of the parameter.
    pub(crate) arg: &'static str,

    /// Error message.
    pub(crate) msg: String,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "ConfigError: {}: {}", self.arg, self.msg)
    }
}

impl Error for ConfigError {}

/// Error used when model data is malformed or incompatible, at either
/// text-ingestion or binary-load time.
#[derive(Debug)]
pub struct FormatError {
    /// Name of the input being parsed.
    pub(crate) what: &'static str,

    /// Error message.
    pub(crate) msg: String,
}

impl fmt::Display for FormatError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "FormatError: {}: {}", self.what, self.msg)
    }
}

impl Error for FormatError {}

/// Error used when an internal construction invariant is violated.
#[derive(Debug)]
pub struct BuildError {
    /// Name of the structure being built.
    pub(crate) what: &'static str,

    /// Error message.
    pub(crate) msg: String,
}

impl fmt::Display for BuildError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "BuildError: {}: {}", self.what, self.msg)
    }
}

impl Error for BuildError {}

/// Error used when query input is malformed.
#[derive(Debug)]
pub struct QueryError {
    /// Error message.
    pub(crate) msg: String,
}

impl fmt::Display for QueryError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "QueryError: {}", self.msg)
    }
}

impl Error for QueryError {}
