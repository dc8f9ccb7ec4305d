//! NETCONF session engine: transports, handshake, dispatch and correlation.
//!
//! This crate provides the long-lived session object shared by both
//! protocol roles, the byte-stream transports it runs over (fd pairs, SSH
//! channels, TLS connections), the hello handshake, and the client-side
//! RPC dispatch with message-id correlation.
//!
//! ## Features
//!
//! - **Three transports**: raw fd pairs, SSH (`netconf` subsystem over
//!   libssh2), and TLS (rustls), behind one closed adapter
//! - **Whole-message atomicity**: a per-session transport mutex held for
//!   the bytes of one message; shared by SSH-multiplexed siblings
//! - **Correlation queues**: replies and notifications that arrive while a
//!   caller waits for something else are steered into FIFO queues
//! - **Blocking with timeouts**: parallel OS threads, `poll(2)` as the
//!   only suspension primitive, cooperative cancellation via deadlines
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use netconf_session::{connect_ssh, Context, Rpc, Datastore, SshClientOptions};
//!
//! # fn example() -> Result<(), netconf_session::SessionError> {
//! let ctx = Arc::new(Context::new());
//! let mut opts = SshClientOptions::default();
//! opts.username = Some("admin".to_string());
//! opts.password = Some("secret".to_string());
//!
//! let session = connect_ssh(ctx, "192.0.2.1", 0, &opts)?;
//! let id = session.send_rpc(&Rpc::Lock { target: Datastore::Running })?;
//! let reply = session.recv_reply(id, Some(Duration::from_secs(10)))?;
//! println!("lock reply: {}", reply.to_xml());
//! session.close()?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod client;
pub mod config;
pub mod context;
pub mod error;
pub mod handshake;
pub mod log;
pub mod rpc;
pub mod session;
pub mod transport;

// Re-export main types
pub use client::{
    accept_callhome, connect_fd, connect_ssh, connect_ssh_channel, connect_tls,
    CallHomeTransport, PORT_CALLHOME, PORT_SSH, PORT_TLS,
};
pub use config::{
    client_options, set_client_options, ClientOptions, InteractiveCallback, SshAuthMethod,
    SshClientOptions, SshKeyPair, TlsClientOptions,
};
pub use context::Context;
pub use error::SessionError;
pub use handshake::{handshake_client, handshake_server, DEFAULT_HELLO_TIMEOUT};
pub use log::{init as init_logging, Verbosity};
pub use rpc::{
    ConfigSource, Datastore, DefaultOperation, EditContent, ErrorOption, Filter, Rpc, TestOption,
    WithDefaults,
};
pub use session::{IoGuard, Role, Session, SessionStatus, TermReason};
pub use transport::{PollOutcome, ReadOutcome, SshConnection, TransportKind};
