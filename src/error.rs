use thiserror::Error as ThisError;

use crate::frame;

/// Errors surfaced to callers of the client.
///
/// Variants are cloneable so the same error can complete a request and feed
/// the connection health signal; I/O failures are carried as strings for that
/// reason.
#[derive(Debug, ThisError, Clone, PartialEq, Eq)]
pub enum ClientError {
    /// The byte stream could not be parsed as RESP. The connection is closed
    /// afterwards since the stream cannot be resynchronized.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// An error reply (`-...`) from the server. Scoped to one request; the
    /// connection stays usable.
    #[error("server error {kind}: {message}")]
    Server { kind: String, message: String },

    /// A well-formed RESP value that does not match the shape the command's
    /// decoder expects.
    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),

    /// Submission after shutdown, or a pending non-idempotent request lost to
    /// a connection drop.
    #[error("connection closed")]
    ConnectionClosed,

    /// Submission refused because the in-flight window is full.
    #[error("backpressure exceeded")]
    BackpressureExceeded,

    /// `receive_timeout` elapsed before the reply arrived. The wire reply is
    /// still consumed when it shows up.
    #[error("request timed out")]
    Timeout,

    /// The server rejected the connection handshake. Reconnecting will keep
    /// failing until the configuration changes.
    #[error("authentication failed {kind}: {message}")]
    AuthFailed { kind: String, message: String },

    /// A command that is not permitted in the connection's current mode,
    /// e.g. `GET` on a subscriber connection.
    #[error("command not allowed in this connection mode: {0}")]
    InvalidCommand(String),

    #[error("io error: {0}")]
    Io(String),
}

impl ClientError {
    /// Builds a `Server` error from the text of an error reply. The first
    /// whitespace-separated token is the error kind (`ERR`, `WRONGTYPE`,
    /// `NOAUTH`, ...).
    pub(crate) fn server(text: &str) -> ClientError {
        let (kind, message) = split_error_text(text);
        ClientError::Server { kind, message }
    }

    /// Same split as [`ClientError::server`], for handshake rejections.
    pub(crate) fn auth_failed(text: &str) -> ClientError {
        let (kind, message) = split_error_text(text);
        ClientError::AuthFailed { kind, message }
    }

    pub(crate) fn unexpected(command: &str, frame: &frame::Frame) -> ClientError {
        ClientError::UnexpectedResponse(format!("{command} got {frame}"))
    }
}

fn split_error_text(text: &str) -> (String, String) {
    match text.split_once(char::is_whitespace) {
        Some((kind, message)) => (kind.to_string(), message.trim_start().to_string()),
        None => (text.to_string(), String::new()),
    }
}

impl From<std::io::Error> for ClientError {
    fn from(err: std::io::Error) -> ClientError {
        ClientError::Io(err.to_string())
    }
}

impl From<frame::Error> for ClientError {
    fn from(err: frame::Error) -> ClientError {
        ClientError::Protocol(err.to_string())
    }
}
