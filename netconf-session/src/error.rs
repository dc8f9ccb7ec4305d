//! Session-level error types.

use thiserror::Error;

/// Errors surfaced by the session API.
///
/// Non-error outcomes are not represented here: a read that finds no whole
/// message within its budget returns `Ok(None)` (the would-block case), and
/// only the fatal kinds (malformed, transport, protocol) move the session to
/// the invalid state as a side effect.
#[derive(Error, Debug)]
pub enum SessionError {
    /// Deadline reached while waiting for a specific message.
    #[error("operation timed out")]
    Timeout,

    /// Framing or XML violation; the session has been invalidated.
    #[error("malformed message: {0}")]
    Malformed(String),

    /// A message type arrived on the side that must not consume it.
    #[error("message received on the wrong side: {0}")]
    WrongSide(&'static str),

    /// Transport-level authentication failed; no session was produced.
    #[error("authentication failed: {0}")]
    AuthFailed(String),

    /// I/O failure on the transport; the session has been invalidated.
    #[error("transport failed: {0}")]
    Transport(String),

    /// NETCONF protocol violation (capability mismatch, duplicate hello,
    /// rpc before hello); the session has been invalidated.
    #[error("protocol violated: {0}")]
    Protocol(String),

    /// Inconsistent caller-supplied parameters.
    #[error("invalid argument: {0}")]
    InvalidArg(&'static str),
}

impl From<std::io::Error> for SessionError {
    fn from(e: std::io::Error) -> Self {
        SessionError::Transport(e.to_string())
    }
}

impl From<netconf_wire::WireError> for SessionError {
    fn from(e: netconf_wire::WireError) -> Self {
        SessionError::Malformed(e.to_string())
    }
}
