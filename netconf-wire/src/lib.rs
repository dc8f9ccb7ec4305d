//! Wire framing, message model, and capability handling for NETCONF.
//!
//! This crate provides the byte-level and XML-level protocol pieces shared by
//! the client and server sides: both RFC 6242 framings, an owned XML element
//! tree, message classification, hello construction/parsing, and capability
//! version resolution.
//!
//! ## Framings
//!
//! ```text
//! NETCONF 1.0 (end-of-message):
//! +----------------------------+----------+
//! | XML message                | ]]>]]>   |
//! +----------------------------+----------+
//!
//! NETCONF 1.1 (chunked):
//! +------------+---------------+-----+--------+
//! | \n#<size>\n| <size> octets | ... | \n##\n |
//! +------------+---------------+-----+--------+
//! ```
//!
//! Decoders are incremental: they consume from a `BytesMut` and return
//! `Ok(None)` until a whole message is available, so callers can feed bytes
//! as they arrive from a non-blocking transport.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod capability;
pub mod error;
pub mod framing;
pub mod msg;
pub mod xml;

// Re-export main types
pub use capability::{resolve_version, Capabilities, Version, CAP_BASE_10, CAP_BASE_11};
pub use error::WireError;
pub use framing::{
    encode_msg, ChunkedDecoder, EndTagDecoder, FrameDecoder, DEFAULT_MAX_MSG_SIZE, ENDTAG,
    MAX_CHUNK_SIZE,
};
pub use msg::{
    build_hello, build_notification, build_reply, build_rpc, classify, message_id, parse_hello,
    parse_rpc_error, reply_kind, HelloInfo, MsgType, ReplyKind, RpcError, NS_BASE, NS_NOTIF,
};
pub use xml::XmlElement;
