//! Error types for the server core.
//!
//! Socket-level failures are fatal to their connection and recovered by
//! closing it; stream-level failures are per-call and surfaced to the
//! writer that caused them.

use std::fmt;
use std::io;

/// Error reading a frame from the peer.
///
/// Every variant closes the connection.
#[derive(Debug)]
pub enum FrameError {
    /// Malformed header, reserved request id, oversized payload, or a
    /// stream continuation for an id with no live stream.
    InvalidPacket,
    /// The read deadline elapsed.
    Timeout,
    /// The peer closed the connection.
    Eof,
    /// Socket error.
    Io(io::Error),
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameError::InvalidPacket => write!(f, "invalid packet"),
            FrameError::Timeout => write!(f, "read deadline elapsed"),
            FrameError::Eof => write!(f, "connection closed by peer"),
            FrameError::Io(e) => write!(f, "read error: {e}"),
        }
    }
}

impl std::error::Error for FrameError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            FrameError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for FrameError {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::UnexpectedEof => FrameError::Eof,
            io::ErrorKind::TimedOut => FrameError::Timeout,
            _ => FrameError::Io(e),
        }
    }
}

/// Error surfaced to a caller by [`FrameWriter::end_write`](crate::FrameWriter::end_write).
///
/// The stream-level variants leave the connection open; `Io` means the
/// socket write failed and the connection is already closing.
#[derive(Debug)]
pub enum WriteError {
    /// `STREAM_RST` targeted an id with no live stream.
    RstNonExistingStream,
    /// Frame enqueued on a stream whose outbound half is already closed.
    WriteAfterCloseSelf,
    /// The connection's writer loop is gone.
    ConnectionClosed,
    /// Socket write failed.
    Io(io::Error),
}

impl fmt::Display for WriteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WriteError::RstNonExistingStream => write!(f, "reset for a non-existing stream"),
            WriteError::WriteAfterCloseSelf => write!(f, "write on a locally-closed stream"),
            WriteError::ConnectionClosed => write!(f, "connection closed"),
            WriteError::Io(e) => write!(f, "write error: {e}"),
        }
    }
}

impl std::error::Error for WriteError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            WriteError::Io(e) => Some(e),
            _ => None,
        }
    }
}

/// Error from the server lifecycle.
#[derive(Debug)]
pub enum ServerError {
    /// The server was shut down; accept loops terminated.
    Closed,
    /// Binding a listener failed.
    Io(io::Error),
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerError::Closed => write!(f, "server closed"),
            ServerError::Io(e) => write!(f, "server error: {e}"),
        }
    }
}

impl std::error::Error for ServerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ServerError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for ServerError {
    fn from(e: io::Error) -> Self {
        ServerError::Io(e)
    }
}
