use thiserror::Error;
use super::ids::StreamId;

/// Protocol violations that end the connection. Each maps to the code carried in the
/// `CONNECTION_CLOSE` frame sent to the peer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// Unparseable datagram: unknown frame tag, truncated field, or a length that overruns the
    /// buffer.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// The peer sent data beyond a limit we advertised, either on one stream or on the
    /// connection as a whole.
    #[error("flow control violation on {scope}: offset {offset} exceeds limit {limit}")]
    FlowControlViolation { scope: FlowScope, offset: u64, limit: u64 },

    /// A retransmission carried different bytes than the first transmission of the same range.
    #[error("inconsistent data on stream {stream_id} at offset {offset}")]
    DataInconsistent { stream_id: StreamId, offset: u64 },

    /// STREAM or RESET_STREAM frame contradicting an established final size.
    #[error("final size error on stream {0}")]
    FinalSizeError(StreamId),

    /// The peer opened more streams than we allowed.
    #[error("stream limit exceeded by stream {0}")]
    StreamLimitError(StreamId),

    /// A frame referenced a stream in a way its type or state does not permit.
    #[error("frame not permitted on stream {0}")]
    StreamStateError(StreamId),
}

impl TransportError {
    pub fn code(&self) -> u64 {
        match self {
            TransportError::FlowControlViolation { .. } => 0x03,
            TransportError::StreamLimitError(_) => 0x04,
            TransportError::StreamStateError(_) => 0x05,
            TransportError::FinalSizeError(_) => 0x06,
            TransportError::MalformedFrame(_) => 0x07,
            TransportError::DataInconsistent { .. } => 0x0a,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowScope {
    Connection,
    Stream(StreamId),
}

impl std::fmt::Display for FlowScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FlowScope::Connection => write!(f, "connection"),
            FlowScope::Stream(id) => write!(f, "stream {}", id),
        }
    }
}

/// Why a connection is no longer usable.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("closed by peer with code {code}: {reason}")]
    PeerClosed { code: u64, reason: String },
    #[error("connection closed locally")]
    LocallyClosed,
    #[error("connection idle timeout")]
    TimedOut,
}

/// Errors returned to callers of the connection and stream APIs.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// Write after `finish()`, on a reset stream, or on a receive-only stream; read on a
    /// send-only stream.
    #[error("stream {0} is closed")]
    StreamClosed(StreamId),

    #[error("stream {0} does not exist")]
    UnknownStream(StreamId),

    /// The peer's stream limit for this direction has been reached.
    #[error("too many open streams")]
    TooManyStreams,

    /// The stream was reset; carries the application error code.
    #[error("stream {stream_id} reset with code {error_code}")]
    Reset { stream_id: StreamId, error_code: u64 },

    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

impl From<TransportError> for Error {
    fn from(e: TransportError) -> Self {
        Error::Connection(ConnectionError::Transport(e))
    }
}

impl From<Error> for std::io::Error {
    fn from(e: Error) -> Self {
        let kind = match &e {
            Error::StreamClosed(_) => std::io::ErrorKind::BrokenPipe,
            Error::UnknownStream(_) => std::io::ErrorKind::NotFound,
            Error::TooManyStreams => std::io::ErrorKind::WouldBlock,
            Error::Reset { .. } => std::io::ErrorKind::ConnectionReset,
            Error::Connection(ConnectionError::TimedOut) => std::io::ErrorKind::TimedOut,
            Error::Connection(_) => std::io::ErrorKind::ConnectionAborted,
        };
        std::io::Error::new(kind, e)
    }
}
