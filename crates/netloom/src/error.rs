use std::fmt;

/// Specific error types for netloom.
#[derive(Debug, Clone)]
pub enum Error {
    /// Malformed or missing configuration attribute. The string describes
    /// why in detail.
    Config(String),

    /// A protocol session name that no registered session matches.
    UnknownProtocol(String),

    /// Two sessions registered under the same name or protocol number on
    /// one host.
    DuplicateProtocol(String),

    /// A channel mapping whose delay is below the lookahead required by the
    /// target timeline.
    Mapping(String),

    /// Invalid textual address form (IP, NHI, or MAC).
    Addr(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Error::Config(ref msg) => write!(f, "invalid configuration: {msg}"),
            Error::UnknownProtocol(ref msg) => write!(f, "unknown protocol: {msg}"),
            Error::DuplicateProtocol(ref msg) => write!(f, "duplicate protocol: {msg}"),
            Error::Mapping(ref msg) => write!(f, "invalid channel mapping: {msg}"),
            Error::Addr(ref msg) => write!(f, "invalid address: {msg}"),
        }
    }
}

impl std::error::Error for Error {}
