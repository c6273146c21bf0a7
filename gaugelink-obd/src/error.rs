//! Transport-level errors.
//!
//! Everything above the transport follows the degrade-to-`None` policy: command
//! and query failures are logged and collapse to `None`, with connection-level
//! failures reported through the state callback instead of error returns.

use std::fmt;
use std::io;

/// Errors from opening or driving a transport.
#[derive(Debug)]
pub enum TransportError {
    /// The target address could not be parsed.
    InvalidTarget(String),
    /// The connect attempt did not complete within the connect timeout.
    ConnectTimedOut,
    /// Underlying socket error.
    Io(io::Error),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidTarget(target) => write!(f, "invalid target: {target}"),
            Self::ConnectTimedOut => write!(f, "connect timed out"),
            Self::Io(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for TransportError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

/// Errors from loading or saving the config file.
#[derive(Debug)]
pub enum ConfigError {
    /// Reading or writing the file failed.
    Io(io::Error),
    /// The file contents are not valid config JSON.
    Parse(serde_json::Error),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "{e}"),
            Self::Parse(e) => write!(f, "invalid config: {e}"),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Parse(e) => Some(e),
        }
    }
}

impl From<io::Error> for ConfigError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<serde_json::Error> for ConfigError {
    fn from(e: serde_json::Error) -> Self {
        Self::Parse(e)
    }
}
