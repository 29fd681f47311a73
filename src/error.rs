//! Error type for the multiplexed stream transport.

#![warn(missing_docs)]
#![warn(clippy::missing_docs_in_private_items)]

use std::error;
use std::fmt::{Display, Formatter};
use std::io;
use std::sync::Arc;

/// Error type for the multiplexed stream transport.
///
/// I/O errors are kept behind an [`Arc`] so that a single failure can be
/// handed to every transaction that was pending on a stream.
#[derive(Clone, Debug)]
pub enum Error {
    /// The stream was closed while the request was pending.
    ConnectionClosed,

    /// The connection has been disposed of and can no longer be used.
    ConnectionDisposed,

    /// Establishing the connection to the server failed.
    Connect(Arc<io::Error>),

    /// The connection lock could not be acquired in time.
    LockTimeout,

    /// Octet sequence too short to be a valid DNS message.
    ShortMessage,

    /// The request is too long to be sent over a stream.
    StreamLongMessage,

    /// Reading from the stream gave an error.
    StreamReadError(Arc<io::Error>),

    /// Reading from the stream ended in the middle of a message.
    StreamUnexpectedEndOfData,

    /// Writing to the stream gave an error.
    StreamWriteError(Arc<io::Error>),

    /// Writing to the stream stalled for too long.
    StreamWriteTimeout,

    /// Too many outstanding queries on a single stream transport.
    StreamTooManyOutstandingQueries,
}

impl Error {
    /// Returns whether the error is a transient fault of the connection.
    ///
    /// Such errors are not reported to the caller of a query. Instead the
    /// query returns no response and the next query will use a fresh
    /// connection.
    pub fn is_connection_fault(&self) -> bool {
        matches!(
            self,
            Error::ConnectionDisposed
                | Error::LockTimeout
                | Error::StreamWriteError(_)
                | Error::StreamWriteTimeout
        )
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), std::fmt::Error> {
        match self {
            Error::ConnectionClosed => write!(f, "connection closed"),
            Error::ConnectionDisposed => {
                write!(f, "connection has been disposed")
            }
            Error::Connect(err) => {
                write!(f, "error connecting to server: {err}")
            }
            Error::LockTimeout => {
                write!(f, "timeout waiting for the connection")
            }
            Error::ShortMessage => {
                write!(f, "octet sequence to short to be a valid message")
            }
            Error::StreamLongMessage => {
                write!(f, "message too long for stream transport")
            }
            Error::StreamReadError(_) => {
                write!(f, "error reading from stream")
            }
            Error::StreamUnexpectedEndOfData => {
                write!(f, "unexpected end of data")
            }
            Error::StreamWriteError(_) => {
                write!(f, "error writing to stream")
            }
            Error::StreamWriteTimeout => {
                write!(f, "timeout writing to stream")
            }
            Error::StreamTooManyOutstandingQueries => {
                write!(f, "too many outstanding queries on stream")
            }
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Error::ConnectionClosed => None,
            Error::ConnectionDisposed => None,
            Error::Connect(e) => Some(e),
            Error::LockTimeout => None,
            Error::ShortMessage => None,
            Error::StreamLongMessage => None,
            Error::StreamReadError(e) => Some(e),
            Error::StreamUnexpectedEndOfData => None,
            Error::StreamWriteError(e) => Some(e),
            Error::StreamWriteTimeout => None,
            Error::StreamTooManyOutstandingQueries => None,
        }
    }
}

//============ Tests =========================================================
