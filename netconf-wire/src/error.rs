//! Wire protocol error types.

use thiserror::Error;

/// Wire protocol errors
#[derive(Error, Debug)]
pub enum WireError {
    /// Malformed framing
    #[error("malformed framing: {0}")]
    Framing(&'static str),

    /// Message size limit exceeded
    #[error("message size limit exceeded: {0}")]
    Size(usize),

    /// Invalid XML
    #[error("invalid xml: {0}")]
    Xml(String),

    /// Unexpected message root element
    #[error("invalid message root element <{0}>")]
    Root(String),

    /// Missing or invalid hello content
    #[error("invalid hello: {0}")]
    Hello(&'static str),
}
