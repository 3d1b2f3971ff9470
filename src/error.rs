use std::error::Error as StdError;
use std::fmt;
use std::io;

use crate::Exception;

/// Errors when processing a connection.
#[derive(Debug)]
pub enum Error {
    /// An operation was attempted against the current exchange state, e.g.
    /// mutating headers after they have been flushed to the transport.
    State(&'static str),
    /// The peer sent bytes that don't form a valid HTTP/1.1 message.
    Protocol(String),
    /// The application handler failed while producing inbound or outbound
    /// data.
    Handler(Exception),
    /// Reading from or writing to the transport failed.
    Io(io::Error),
    /// A websocket upgrade handshake could not be completed.
    Upgrade(&'static str),
}

/// A specialized result type for connection processing.
pub type Result<T> = std::result::Result<T, Error>;

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::State(msg) => write!(f, "{}", msg),
            Error::Protocol(msg) => write!(f, "{}", msg),
            Error::Handler(err) => write!(f, "handler error: {}", err),
            Error::Io(err) => write!(f, "{}", err),
            Error::Upgrade(msg) => write!(f, "{}", msg),
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Error::Handler(err) => Some(&**err),
            Error::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(err)
    }
}
