//! Unified client error types.

use thiserror::Error;

/// Top-level client error.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ClientError {
    /// A call or connect waiter timed out locally.
    #[error("timeout")]
    Timeout,

    /// The session left `Connected` before a reply arrived.
    #[error("disconnected")]
    Disconnected,

    /// The transport refused the frame.
    #[error("transport write failed: {0}")]
    TransportWrite(String),

    /// A decoded frame was malformed.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The reply carried a server error object.
    #[error("server error: {0}")]
    Server(#[from] ServerError),

    /// The token provider returned empty, threw, or rejected.
    #[error("token error: {0}")]
    Token(String),

    /// The server signalled the client has fallen too far behind the
    /// channel log and recovery is impossible.
    #[error("unrecoverable position")]
    UnrecoverablePosition,

    /// The session is closed; no further calls are possible.
    #[error("client closed: {0}")]
    Closed(CloseReason),

    /// A subscription for this channel is already registered.
    #[error("duplicate subscription to channel {0}")]
    DuplicateSubscription(String),

    /// The session task is gone (client dropped mid-call).
    #[error("client shut down")]
    Shutdown,

    /// Connect was attempted with no usable transport endpoint.
    #[error("transport unavailable: {0}")]
    TransportUnavailable(String),
}

/// An `{code, message, temporary}` error object from a reply.
///
/// `temporary == true` signals the operation may be retried.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("[{code}] {message}")]
pub struct ServerError {
    pub code: u32,
    pub message: String,
    pub temporary: bool,
}

/// Why a session reached the terminal `Closed` state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The application called `close()`.
    Client,
    /// The server sent a terminal disconnect.
    Server,
    /// Connect failed with a permanent error.
    ConnectFailed,
    /// Connection token refresh failed permanently.
    RefreshFailed,
    /// The token provider produced an empty token.
    Unauthorized,
    /// The server reported an unrecoverable stream position.
    UnrecoverablePosition,
}

impl CloseReason {
    /// Whether server-subscription positions survive this close.
    ///
    /// Positions are dropped for client-initiated closes and for
    /// unrecoverable-position closes, kept otherwise.
    pub fn preserves_positions(self) -> bool {
        !matches!(self, CloseReason::Client | CloseReason::UnrecoverablePosition)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CloseReason::Client => "client",
            CloseReason::Server => "server",
            CloseReason::ConnectFailed => "connect failed",
            CloseReason::RefreshFailed => "refresh failed",
            CloseReason::Unauthorized => "unauthorized",
            CloseReason::UnrecoverablePosition => "unrecoverable position",
        }
    }
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_error_display() {
        let err = ServerError {
            code: 103,
            message: "permission denied".into(),
            temporary: false,
        };
        assert_eq!(err.to_string(), "[103] permission denied");
        assert_eq!(
            ClientError::from(err).to_string(),
            "server error: [103] permission denied"
        );
    }

    #[test]
    fn test_close_reason_position_preservation() {
        assert!(!CloseReason::Client.preserves_positions());
        assert!(!CloseReason::UnrecoverablePosition.preserves_positions());
        assert!(CloseReason::Server.preserves_positions());
        assert!(CloseReason::ConnectFailed.preserves_positions());
        assert!(CloseReason::RefreshFailed.preserves_positions());
        assert!(CloseReason::Unauthorized.preserves_positions());
    }

    #[test]
    fn test_close_reason_strings() {
        assert_eq!(CloseReason::UnrecoverablePosition.to_string(), "unrecoverable position");
        assert_eq!(CloseReason::Client.to_string(), "client");
    }
}
