use serde_derive::{Deserialize, Serialize};

/// A quorumkv error. Errors are serializable, since they are returned across
/// the network to clients.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Error {
    /// The operation was aborted and must be retried, typically because the
    /// leader changed or the replica is shutting down.
    Abort,
    /// Log or metadata integrity failure. Fatal to the replica.
    Corruption(String),
    /// Invalid user input or configuration.
    InvalidInput(String),
    /// A storage failure. Fatal on durability-critical paths.
    IO(String),
    /// A peer was unreachable or the connection failed. Workers retry these
    /// internally, they are not surfaced to clients.
    Network(String),
    /// The requested item was not found.
    NotFound,
    /// The operation timed out.
    Timeout,
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Abort => write!(f, "operation aborted"),
            Error::Corruption(message) => write!(f, "corruption: {message}"),
            Error::InvalidInput(message) => write!(f, "invalid input: {message}"),
            Error::IO(message) => write!(f, "io error: {message}"),
            Error::Network(message) => write!(f, "network error: {message}"),
            Error::NotFound => write!(f, "not found"),
            Error::Timeout => write!(f, "operation timed out"),
        }
    }
}

impl Error {
    /// Returns whether the error is fatal to the replica. Safety-critical
    /// paths must not proceed past these.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Corruption(_) | Error::IO(_))
    }
}

/// Constructs an Error::Corruption via format!().
#[macro_export]
macro_rules! errcorrupt {
    ($($args:tt)*) => { $crate::error::Error::Corruption(format!($($args)*)).into() };
}

/// Constructs an Error::InvalidInput via format!().
#[macro_export]
macro_rules! errinput {
    ($($args:tt)*) => { $crate::error::Error::InvalidInput(format!($($args)*)).into() };
}

/// Constructs an Error::Network via format!().
#[macro_export]
macro_rules! errnet {
    ($($args:tt)*) => { $crate::error::Error::Network(format!($($args)*)).into() };
}

/// A quorumkv result returning Error.
pub type Result<T> = std::result::Result<T, Error>;

impl<T> From<Error> for Result<T> {
    fn from(error: Error) -> Self {
        Err(error)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::IO(err.to_string())
    }
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Error::Corruption(err.to_string())
    }
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Error::InvalidInput(err.to_string())
    }
}

impl From<log::ParseLevelError> for Error {
    fn from(err: log::ParseLevelError) -> Self {
        Error::InvalidInput(err.to_string())
    }
}

impl From<log::SetLoggerError> for Error {
    fn from(err: log::SetLoggerError) -> Self {
        Error::InvalidInput(err.to_string())
    }
}

impl<T> From<crossbeam::channel::SendError<T>> for Error {
    fn from(_err: crossbeam::channel::SendError<T>) -> Self {
        Error::Abort
    }
}
