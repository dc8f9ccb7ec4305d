//! The NETCONF session object.
//!
//! A session is one long-lived conversation with a peer: role, protocol
//! version, status, the transport it runs over, and the per-side state
//! (client correlation queues, server identity and idle deadline). All
//! whole-message I/O goes through [`IoGuard`], which holds the transport
//! mutex for the full duration of one message in either direction; for
//! SSH-multiplexed sessions that mutex is shared between all siblings on
//! the same SSH connection.

use std::collections::VecDeque;
use std::net::TcpStream;
use std::os::unix::io::RawFd;
use std::sync::{Arc, Mutex, MutexGuard, TryLockError};
use std::time::{Duration, Instant};

use bytes::BytesMut;
use netconf_wire::{classify, Capabilities, FrameDecoder, MsgType, Version, XmlElement};
use tracing::{debug, trace, warn};

use crate::context::Context;
use crate::error::SessionError;
use crate::transport::{PollOutcome, ReadOutcome, Transport, TransportKind, READ_RETRY_SLEEP};

/// Lock a mutex, ignoring poisoning: session state stays usable even if a
/// worker thread panicked while holding it.
pub(crate) fn plock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// Which side of the conversation this session is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// The management station.
    Client,
    /// The managed device.
    Server,
}

/// Session lifecycle status; transitions are forward-only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionStatus {
    /// Created, handshake not yet complete.
    Starting,
    /// Handshake done; RPC traffic may flow.
    Running,
    /// Teardown in progress.
    Closing,
    /// Terminal; see the termination reason.
    Invalid,
}

/// Why a session reached the invalid state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TermReason {
    /// `<close-session>` exchanged.
    Closed,
    /// Terminated by `<kill-session>`.
    Killed,
    /// The transport went away under us.
    Dropped,
    /// Hello or idle deadline expired.
    Timeout,
    /// Capability negotiation failed.
    BadHello,
    /// Anything else (malformed traffic, internal errors).
    Other,
}

#[derive(Debug)]
struct State {
    status: SessionStatus,
    term_reason: Option<TermReason>,
    version: Option<Version>,
    id: u32,
}

/// Transport plus decode state, guarded by the transport mutex.
pub(crate) struct TransportIo {
    transport: Transport,
    inbuf: BytesMut,
    decoder: FrameDecoder,
    /// Wire framing version. Hello always travels in 1.0 framing; the
    /// negotiated version takes over afterwards.
    version: Version,
}

pub(crate) struct ClientData {
    next_msg_id: u64,
    replies: VecDeque<XmlElement>,
    notifs: VecDeque<XmlElement>,
}

struct ServerData {
    username: Option<String>,
    peer_cert: Option<Vec<u8>>,
    idle_timeout: Option<Duration>,
    idle_deadline: Mutex<Option<Instant>>,
}

enum SideData {
    Client(Mutex<ClientData>),
    Server(ServerData),
}

/// One NETCONF session.
pub struct Session {
    role: Role,
    ctx: Arc<Context>,
    host: Option<String>,
    port: u16,
    /// Poll fd of the transport, cached for the server poll set.
    poll_fd: RawFd,
    /// Transport mutex: exclusive for the bytes of one whole message.
    /// Shared (same `Arc`) between SSH-multiplexed siblings.
    lock: Arc<Mutex<()>>,
    io: Mutex<TransportIo>,
    state: Mutex<State>,
    capabilities: Mutex<Capabilities>,
    side: SideData,
    /// Keeps the shared SSH connection alive for multiplexed sessions.
    ssh_conn: Option<Arc<crate::transport::SshConnection>>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = plock(&self.state);
        f.debug_struct("Session")
            .field("role", &self.role)
            .field("id", &state.id)
            .field("status", &state.status)
            .field("version", &state.version)
            .field("host", &self.host)
            .field("port", &self.port)
            .finish()
    }
}

impl Session {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        role: Role,
        ctx: Arc<Context>,
        transport: Transport,
        lock: Arc<Mutex<()>>,
        ssh_conn: Option<Arc<crate::transport::SshConnection>>,
        host: Option<String>,
        port: u16,
        server_data: Option<(Option<String>, Option<Vec<u8>>, Option<Duration>)>,
    ) -> Self {
        let poll_fd = transport.poll_fd();
        let side = match role {
            Role::Client => SideData::Client(Mutex::new(ClientData {
                next_msg_id: 0,
                replies: VecDeque::new(),
                notifs: VecDeque::new(),
            })),
            Role::Server => {
                let (username, peer_cert, idle_timeout) = server_data.unwrap_or((None, None, None));
                SideData::Server(ServerData {
                    username,
                    peer_cert,
                    idle_timeout,
                    idle_deadline: Mutex::new(idle_timeout.map(|t| Instant::now() + t)),
                })
            }
        };
        Session {
            role,
            ctx,
            host,
            port,
            poll_fd,
            lock,
            io: Mutex::new(TransportIo {
                transport,
                inbuf: BytesMut::with_capacity(4096),
                decoder: FrameDecoder::new(Version::V10),
                version: Version::V10,
            }),
            state: Mutex::new(State {
                status: SessionStatus::Starting,
                term_reason: None,
                version: None,
                id: 0,
            }),
            capabilities: Mutex::new(Capabilities::default()),
            side,
            ssh_conn,
        }
    }

    /// Server session over an fd pair whose peer was already authenticated
    /// by an external transport (an sshd-spawned `netconf` subsystem, or an
    /// SSH server adapter). The NETCONF handshake still has to be run.
    pub fn server_fd(
        ctx: Arc<Context>,
        fd_in: RawFd,
        fd_out: RawFd,
        owned: bool,
        username: Option<String>,
        idle_timeout: Option<Duration>,
    ) -> Result<Session, SessionError> {
        let transport = Transport::fd(fd_in, fd_out, owned)?;
        Ok(Session::new(
            Role::Server,
            ctx,
            transport,
            Arc::new(Mutex::new(())),
            None,
            None,
            0,
            Some((username, None, idle_timeout)),
        ))
    }

    /// Server session over an accepted TLS stream. The username, if any,
    /// must have been resolved from the peer certificate beforehand.
    #[allow(clippy::too_many_arguments)]
    pub fn server_tls(
        ctx: Arc<Context>,
        stream: rustls::StreamOwned<rustls::ServerConnection, TcpStream>,
        username: Option<String>,
        peer_cert: Option<Vec<u8>>,
        host: Option<String>,
        port: u16,
        idle_timeout: Option<Duration>,
    ) -> Result<Session, SessionError> {
        let transport = Transport::tls_server(stream)?;
        Ok(Session::new(
            Role::Server,
            ctx,
            transport,
            Arc::new(Mutex::new(())),
            None,
            host,
            port,
            Some((username, peer_cert, idle_timeout)),
        ))
    }

    /// Which side of the conversation this session is.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Current lifecycle status.
    pub fn status(&self) -> SessionStatus {
        plock(&self.state).status
    }

    /// Why the session became invalid, if it did.
    pub fn termination_reason(&self) -> Option<TermReason> {
        plock(&self.state).term_reason
    }

    /// Negotiated protocol version; `None` until the handshake completes.
    pub fn version(&self) -> Option<Version> {
        plock(&self.state).version
    }

    /// Server-assigned session id (0 until assigned).
    pub fn session_id(&self) -> u32 {
        plock(&self.state).id
    }

    /// The transport backend kind.
    pub fn transport_kind(&self) -> TransportKind {
        plock(&self.io).transport.kind()
    }

    /// The schema/XML context this session parses against.
    pub fn context(&self) -> &Arc<Context> {
        &self.ctx
    }

    /// Authenticated username (server side only).
    pub fn username(&self) -> Option<String> {
        match &self.side {
            SideData::Server(s) => s.username.clone(),
            SideData::Client(_) => None,
        }
    }

    /// DER-encoded peer certificate (TLS server side only).
    pub fn peer_cert(&self) -> Option<Vec<u8>> {
        match &self.side {
            SideData::Server(s) => s.peer_cert.clone(),
            SideData::Client(_) => None,
        }
    }

    /// Peer host name or address, if known.
    pub fn host(&self) -> Option<&str> {
        self.host.as_deref()
    }

    /// Peer port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// The peer's advertised capabilities (empty before the handshake).
    pub fn capabilities(&self) -> Capabilities {
        plock(&self.capabilities).clone()
    }

    /// Whether two sessions share one transport mutex (SSH siblings do).
    pub fn shares_transport_lock(&self, other: &Session) -> bool {
        Arc::ptr_eq(&self.lock, &other.lock)
    }

    /// The fd a server poll set watches for readability.
    pub fn poll_fd(&self) -> RawFd {
        self.poll_fd
    }

    /// Whether the server-side idle deadline has passed.
    pub fn idle_expired(&self) -> bool {
        match &self.side {
            SideData::Server(s) => {
                plock(&s.idle_deadline).is_some_and(|d| Instant::now() >= d)
            }
            SideData::Client(_) => false,
        }
    }

    fn touch_idle(&self) {
        if let SideData::Server(s) = &self.side {
            if let Some(t) = s.idle_timeout {
                *plock(&s.idle_deadline) = Some(Instant::now() + t);
            }
        }
    }

    pub(crate) fn client_data(&self) -> &Mutex<ClientData> {
        match &self.side {
            SideData::Client(d) => d,
            SideData::Server(_) => unreachable!("client data on a server session"),
        }
    }

    /// Record the negotiated version, the peer capabilities, and the id,
    /// and move to running. Called exactly once, by the handshake.
    pub fn complete_handshake(
        &self,
        version: Version,
        peer_caps: Capabilities,
        id: u32,
    ) {
        {
            let mut io = plock(&self.io);
            io.set_version(version);
        }
        *plock(&self.capabilities) = peer_caps;
        let mut state = plock(&self.state);
        state.version = Some(version);
        state.id = id;
        if state.status == SessionStatus::Starting {
            state.status = SessionStatus::Running;
        }
        debug!(
            "session {} running: {:?}, version {}",
            state.id, self.role, version
        );
    }

    /// Forward-only status transition to closing. Subsequent polls and
    /// waits return promptly; this is the cooperative cancellation hook.
    pub fn mark_closing(&self) {
        let mut state = plock(&self.state);
        if state.status < SessionStatus::Closing {
            state.status = SessionStatus::Closing;
        }
    }

    /// Forward-only transition to invalid with a termination reason.
    /// The first recorded reason wins.
    pub fn mark_invalid(&self, reason: TermReason) {
        let mut state = plock(&self.state);
        if state.status != SessionStatus::Invalid {
            state.status = SessionStatus::Invalid;
            if state.term_reason.is_none() {
                state.term_reason = Some(reason);
            }
            debug!("session {} invalid: {:?}", state.id, reason);
        }
    }

    /// Terminate the session as killed (the `<kill-session>` target).
    pub fn kill(&self) {
        self.mark_invalid(TermReason::Killed);
    }

    /// Set the message-id the next outgoing rpc will carry. Client side
    /// only; servers always echo the request id.
    pub fn set_next_message_id(&self, next: u64) {
        if self.role == Role::Client {
            plock(self.client_data()).set_start_msg_id(next.wrapping_sub(1));
        }
    }

    /// Acquire the transport mutex for one whole-message operation.
    pub fn lock_io(&self) -> IoGuard<'_> {
        let wire = self.lock.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        IoGuard {
            session: self,
            _wire: wire,
            io: plock(&self.io),
        }
    }

    /// Try to acquire the transport mutex without blocking. `None` means
    /// another worker is mid-message on this session (or an SSH sibling).
    pub fn try_lock_io(&self) -> Option<IoGuard<'_>> {
        let wire = match self.lock.try_lock() {
            Ok(g) => g,
            Err(TryLockError::Poisoned(p)) => p.into_inner(),
            Err(TryLockError::WouldBlock) => return None,
        };
        Some(IoGuard {
            session: self,
            _wire: wire,
            io: plock(&self.io),
        })
    }

    /// Read one whole message, waiting up to `timeout` (`None` = forever).
    ///
    /// Returns `Ok(None)` when no complete message arrived in time; this
    /// never changes the session status.
    pub fn read_msg_poll(
        &self,
        timeout: Option<Duration>,
    ) -> Result<Option<(MsgType, XmlElement)>, SessionError> {
        self.lock_io().read_msg(timeout)
    }

    /// Serialize and send one message under the transport mutex.
    pub fn write_msg(&self, root: &XmlElement) -> Result<(), SessionError> {
        self.lock_io().write_msg(root)
    }

    pub(crate) fn transport_lock(&self) -> &Arc<Mutex<()>> {
        &self.lock
    }

    pub(crate) fn ssh_connection(&self) -> Option<&Arc<crate::transport::SshConnection>> {
        self.ssh_conn.as_ref()
    }
}

impl TransportIo {
    fn set_version(&mut self, version: Version) {
        if version != self.version {
            self.version = version;
            // Buffered bytes of pipelined messages survive the swap.
            self.decoder = FrameDecoder::new(version);
        }
    }

    fn decode_one(&mut self) -> Result<Option<bytes::Bytes>, netconf_wire::WireError> {
        if self.inbuf.is_empty() {
            return Ok(None);
        }
        self.decoder.decode(&mut self.inbuf)
    }
}

/// The transport mutex held across one whole-message read or write.
pub struct IoGuard<'a> {
    session: &'a Session,
    _wire: MutexGuard<'a, ()>,
    io: MutexGuard<'a, TransportIo>,
}

impl IoGuard<'_> {
    /// Read one whole framed message, parse, and classify it.
    ///
    /// `Ok(None)` when the timeout expires before a complete message; a
    /// message of a type the caller's side must not consume is an error
    /// (`WrongSide` for the mirror-image rpc/reply case, `Protocol` for a
    /// hello after the handshake). EOF and framing violations invalidate
    /// the session.
    pub fn read_msg(
        &mut self,
        timeout: Option<Duration>,
    ) -> Result<Option<(MsgType, XmlElement)>, SessionError> {
        let status = self.session.status();
        if status != SessionStatus::Running && status != SessionStatus::Starting {
            return Err(SessionError::InvalidArg("session not running"));
        }

        let deadline = timeout.map(|t| Instant::now() + t);
        let raw = loop {
            // Drain a message already sitting in the buffer first.
            match self.io.decode_one() {
                Ok(Some(raw)) => break raw,
                Ok(None) => {}
                Err(e) => {
                    self.session.mark_invalid(TermReason::Other);
                    return Err(SessionError::Malformed(e.to_string()));
                }
            }

            let remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));
            if matches!(remaining, Some(r) if r.is_zero()) {
                return Ok(None);
            }
            match self.io.transport.poll_readable(remaining)? {
                PollOutcome::TimedOut => return Ok(None),
                PollOutcome::Disconnect => {
                    self.session.mark_invalid(TermReason::Dropped);
                    return Err(SessionError::Transport("peer disconnected".to_string()));
                }
                PollOutcome::Ready => {}
            }

            let mut chunk = [0u8; 4096];
            match self.io.transport.read(&mut chunk) {
                Ok(ReadOutcome::Data(n)) => self.io.inbuf.extend_from_slice(&chunk[..n]),
                Ok(ReadOutcome::WouldBlock) => {
                    // Readiness was transport-level noise (TLS handshake
                    // records, a sibling SSH channel); retry a moment later.
                    std::thread::sleep(READ_RETRY_SLEEP);
                }
                Ok(ReadOutcome::Eof) => {
                    self.session.mark_invalid(TermReason::Dropped);
                    return Err(SessionError::Transport(
                        "connection closed by peer".to_string(),
                    ));
                }
                Err(e) => {
                    self.session.mark_invalid(TermReason::Dropped);
                    return Err(e);
                }
            }
        };

        let text = std::str::from_utf8(&raw).map_err(|_| {
            self.session.mark_invalid(TermReason::Other);
            SessionError::Malformed("message is not valid UTF-8".to_string())
        })?;
        trace!("received message: {}", text);

        let root = match XmlElement::parse(text) {
            Ok(root) => root,
            Err(e) => {
                self.session.mark_invalid(TermReason::Other);
                return Err(SessionError::Malformed(e.to_string()));
            }
        };

        let mtype = classify(&root);
        if mtype == MsgType::Unknown {
            self.session.mark_invalid(TermReason::Other);
            return Err(SessionError::Malformed(format!(
                "invalid message root element <{}>",
                root.name
            )));
        }

        // Side check: once running, a server only consumes rpcs and a
        // client only replies and notifications.
        if self.session.status() == SessionStatus::Running {
            match (self.session.role(), mtype) {
                (Role::Server, MsgType::Rpc) => {}
                (Role::Client, MsgType::Reply | MsgType::Notification) => {}
                (_, MsgType::Hello) => {
                    self.session.mark_invalid(TermReason::BadHello);
                    return Err(SessionError::Protocol(
                        "unexpected <hello> on an established session".to_string(),
                    ));
                }
                (Role::Server, _) => {
                    warn!("server session received {:?}", mtype);
                    return Err(SessionError::WrongSide("server can only receive <rpc>"));
                }
                (Role::Client, _) => {
                    warn!("client session received {:?}", mtype);
                    return Err(SessionError::WrongSide(
                        "client can only receive <rpc-reply> and <notification>",
                    ));
                }
            }
        }

        self.session.touch_idle();
        Ok(Some((mtype, root)))
    }

    /// Serialize one message, frame it for the session version, and write
    /// it out. Messages are atomic: any write failure invalidates the
    /// session.
    pub fn write_msg(&mut self, root: &XmlElement) -> Result<(), SessionError> {
        let status = self.session.status();
        if status != SessionStatus::Running
            && status != SessionStatus::Starting
            && status != SessionStatus::Closing
        {
            return Err(SessionError::InvalidArg("session not running"));
        }

        let text = root.to_xml();
        trace!("sending message: {}", text);

        let mut framed = BytesMut::with_capacity(text.len() + 16);
        netconf_wire::encode_msg(self.io.version, text.as_bytes(), &mut framed)?;
        if let Err(e) = self.io.transport.write_all(&framed) {
            self.session.mark_invalid(TermReason::Dropped);
            return Err(e);
        }
        Ok(())
    }
}

impl ClientData {
    pub(crate) fn next_message_id(&mut self) -> u64 {
        self.next_msg_id = self.next_msg_id.wrapping_add(1);
        self.next_msg_id
    }

    pub(crate) fn pop_reply(&mut self, msg_id: u64) -> Option<XmlElement> {
        let pos = self
            .replies
            .iter()
            .position(|r| netconf_wire::message_id(r) == Some(msg_id))?;
        self.replies.remove(pos)
    }

    pub(crate) fn push_reply(&mut self, reply: XmlElement) {
        self.replies.push_back(reply);
    }

    pub(crate) fn pop_notification(&mut self) -> Option<XmlElement> {
        self.notifs.pop_front()
    }

    pub(crate) fn push_notification(&mut self, notif: XmlElement) {
        self.notifs.push_back(notif);
    }

    pub(crate) fn set_start_msg_id(&mut self, last: u64) {
        self.next_msg_id = last;
    }
}
