//! NETCONF server: poll/dispatch engine, transport acceptors, call home.
//!
//! This crate provides the serving side of the session engine: named
//! listening endpoints with per-transport option families, an acceptor
//! that turns connections into authenticated running sessions, and a poll
//! set that multiplexes many sessions across worker threads with
//! per-session exclusion.
//!
//! ## Features
//!
//! - **Endpoint CRUD**: named (name, transport) endpoints, each option
//!   family behind its own mutex, no global lock
//! - **TLS acceptor**: rustls handshake plus ordered cert-to-name mapping
//!   with algorithm-prefixed fingerprints
//! - **SSH seam**: a narrow server-handshake adapter trait, plus direct
//!   fd acceptance for sshd-spawned `netconf` subsystems
//! - **Poll set**: worker threads dispatch ready sessions under try-lock,
//!   one message at a time, with rotating-scan fairness
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use netconf_server::{DispatchCode, PollSet, Server, ServerReply};
//! use netconf_session::{Context, TransportKind};
//!
//! # fn example() -> Result<(), netconf_session::SessionError> {
//! let server = Server::new(Arc::new(Context::new()));
//! server.add_endpoint("main", TransportKind::Tls, "0.0.0.0", 6513)?;
//!
//! let ps = PollSet::new(|_session, _rpc| ServerReply::Ok);
//! if let Some(session) = server.accept(Some(Duration::from_secs(1)))? {
//!     ps.add(session)?;
//! }
//! match ps.poll(Some(Duration::from_millis(500)))? {
//!     DispatchCode::SessionClosed => {
//!         ps.remove_invalid();
//!     }
//!     _ => {}
//! }
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod acceptor;
pub mod callhome;
pub mod config;
pub mod poll;
pub mod ssh;
pub mod tls;

// Re-export main types
pub use config::{
    AuthorizedKey, CtnEntry, CtnMapType, EndpointConfig, PemSource, Server, ServerFileConfig,
    SshAuthKind, SshServerOptions, TlsServerOptions,
};
pub use poll::{DispatchCode, PollSet, RpcHandler, ServerReply};
pub use ssh::{SshAccepted, SshServerHandshake};
pub use tls::cert_to_name;
