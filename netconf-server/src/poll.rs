//! The poll set: multiplexing many sessions across worker threads.
//!
//! A [`PollSet`] holds running server sessions. Any number of worker
//! threads may call [`PollSet::poll`] concurrently; each call dispatches at
//! most one ready session (read one rpc, invoke the handler, write the
//! reply) under the session's transport try-lock, so no session is ever
//! serviced by two workers at once. A rotating scan offset keeps busy
//! sessions from starving the rest.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use netconf_wire::{build_reply, MsgType, RpcError, XmlElement};
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags};
use tracing::{debug, warn};

use netconf_session::{Session, SessionError, SessionStatus, TermReason};

use crate::config::plock;

/// Outcome of one [`PollSet::poll`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchCode {
    /// No member became ready in time.
    Timeout,
    /// A message was consumed without writing a reply (the handler chose
    /// not to answer).
    Dispatched,
    /// A member session was closed: by `<close-session>`, by transport
    /// loss, or by its idle deadline. Remove it from the set.
    SessionClosed,
    /// An rpc was handled and the reply written.
    RpcHandled,
    /// An rpc was handled and an error reply written.
    RpcError,
}

/// The reply a server rpc handler produces.
#[derive(Debug, Clone)]
pub enum ServerReply {
    /// `<ok/>`.
    Ok,
    /// `<data>` wrapping the given content.
    Data(Vec<XmlElement>),
    /// `<rpc-error>` with the given fields.
    Error(RpcError),
    /// Consume the rpc without replying.
    None,
}

/// Server rpc callback: the session the rpc arrived on and the whole
/// `<rpc>` element; produces the reply to send back under the same
/// message-id.
pub type RpcHandler = dyn Fn(&Session, &XmlElement) -> ServerReply + Send + Sync;

struct Members {
    sessions: Vec<Arc<Session>>,
    /// Rotating scan start, for fairness between ready sessions.
    offset: usize,
}

/// A mutable collection of sessions jointly polled by worker threads.
pub struct PollSet {
    handler: Box<RpcHandler>,
    members: Mutex<Members>,
}

impl PollSet {
    /// Create a poll set with the rpc handler its workers dispatch to.
    pub fn new(handler: impl Fn(&Session, &XmlElement) -> ServerReply + Send + Sync + 'static) -> Self {
        Self {
            handler: Box::new(handler),
            members: Mutex::new(Members {
                sessions: Vec::new(),
                offset: 0,
            }),
        }
    }

    /// Add a running session to the set.
    pub fn add(&self, session: Arc<Session>) -> Result<(), SessionError> {
        if session.status() != SessionStatus::Running {
            return Err(SessionError::InvalidArg("session not running"));
        }
        plock(&self.members).sessions.push(session);
        Ok(())
    }

    /// Remove a session from the set; returns whether it was a member.
    pub fn remove(&self, session: &Arc<Session>) -> bool {
        let mut members = plock(&self.members);
        let before = members.sessions.len();
        members.sessions.retain(|s| !Arc::ptr_eq(s, session));
        members.sessions.len() != before
    }

    /// Remove every session that is no longer running; returns how many
    /// were dropped.
    pub fn remove_invalid(&self) -> usize {
        let mut members = plock(&self.members);
        let before = members.sessions.len();
        members
            .sessions
            .retain(|s| s.status() == SessionStatus::Running);
        before - members.sessions.len()
    }

    /// Drop all member sessions.
    pub fn clear(&self) {
        plock(&self.members).sessions.clear();
    }

    /// Number of member sessions.
    pub fn len(&self) -> usize {
        plock(&self.members).sessions.len()
    }

    /// Whether the set has no members.
    pub fn is_empty(&self) -> bool {
        plock(&self.members).sessions.is_empty()
    }

    /// Wait up to `timeout` for a member to become readable and dispatch
    /// exactly one ready session.
    ///
    /// Concurrent calls are safe: the per-session transport try-lock
    /// guarantees at most one worker services any given session, and a
    /// contended session is simply skipped in favor of the next ready one.
    pub fn poll(&self, timeout: Option<Duration>) -> Result<DispatchCode, SessionError> {
        let deadline = timeout.map(|t| Instant::now() + t);

        loop {
            let (sessions, offset) = {
                let mut members = plock(&self.members);
                if members.sessions.is_empty() {
                    return Err(SessionError::InvalidArg("poll set is empty"));
                }
                members.offset = (members.offset + 1) % members.sessions.len();
                (members.sessions.clone(), members.offset)
            };

            // Report dead or idle-expired members before polling fds: their
            // descriptors may never fire again.
            for session in &sessions {
                if session.status() != SessionStatus::Running {
                    return Ok(DispatchCode::SessionClosed);
                }
                if session.idle_expired() {
                    warn!("session {} idle timeout", session.session_id());
                    session.mark_invalid(TermReason::Timeout);
                    return Ok(DispatchCode::SessionClosed);
                }
            }

            let mut fds: Vec<PollFd> = sessions
                .iter()
                .map(|s| PollFd::new(s.poll_fd(), PollFlags::POLLIN))
                .collect();
            let timeout_ms: i32 = match deadline {
                None => -1,
                Some(d) => d
                    .saturating_duration_since(Instant::now())
                    .as_millis()
                    .min(i32::MAX as u128) as i32,
            };
            let ready = match poll(&mut fds, timeout_ms) {
                Ok(n) => n,
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(SessionError::Transport(e.to_string())),
            };
            if ready == 0 {
                return Ok(DispatchCode::Timeout);
            }

            // Scan from the rotating offset; dispatch the first ready,
            // uncontended session.
            for k in 0..sessions.len() {
                let i = (offset + k) % sessions.len();
                let revents = fds[i].revents().unwrap_or(PollFlags::empty());
                if revents.is_empty() {
                    continue;
                }
                let session = &sessions[i];

                if !revents.contains(PollFlags::POLLIN) {
                    session.mark_invalid(TermReason::Dropped);
                    return Ok(DispatchCode::SessionClosed);
                }
                if let Some(code) = self.try_dispatch(session, deadline)? {
                    return Ok(code);
                }
                // Contended or spurious readiness; try the next one.
            }

            if matches!(deadline, Some(d) if Instant::now() >= d) {
                return Ok(DispatchCode::Timeout);
            }
        }
    }

    /// Service one ready session: read the rpc, run the handler, write the
    /// reply. `Ok(None)` means nothing was actually dispatched (transport
    /// mutex contended, or readiness was transport-level noise).
    fn try_dispatch(
        &self,
        session: &Arc<Session>,
        deadline: Option<Instant>,
    ) -> Result<Option<DispatchCode>, SessionError> {
        let Some(mut guard) = session.try_lock_io() else {
            return Ok(None);
        };

        let remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));
        let (mtype, rpc) = match guard.read_msg(remaining) {
            Ok(Some(msg)) => msg,
            Ok(None) => return Ok(None),
            Err(SessionError::Transport(_)) | Err(SessionError::Malformed(_))
                if session.status() == SessionStatus::Invalid =>
            {
                return Ok(Some(DispatchCode::SessionClosed));
            }
            Err(e) => return Err(e),
        };
        debug_assert_eq!(mtype, MsgType::Rpc);

        let msg_id = rpc.attr("message-id").unwrap_or("0").to_string();

        // <close-session> is answered by the engine itself; everything
        // else goes to the embedder's handler.
        if rpc.child("close-session").is_some() {
            debug!("session {} closed by peer", session.session_id());
            let reply = build_reply(&msg_id, vec![XmlElement::new("ok")]);
            let _ = guard.write_msg(&reply);
            drop(guard);
            session.mark_closing();
            session.mark_invalid(TermReason::Closed);
            return Ok(Some(DispatchCode::SessionClosed));
        }

        let reply = (self.handler)(session, &rpc);
        let code = match &reply {
            ServerReply::Ok | ServerReply::Data(_) => DispatchCode::RpcHandled,
            ServerReply::Error(_) => DispatchCode::RpcError,
            ServerReply::None => return Ok(Some(DispatchCode::Dispatched)),
        };
        guard.write_msg(&build_reply(&msg_id, reply.into_children()))?;
        Ok(Some(code))
    }
}

impl ServerReply {
    /// Render the reply body as `<rpc-reply>` children.
    fn into_children(self) -> Vec<XmlElement> {
        match self {
            ServerReply::Ok => vec![XmlElement::new("ok")],
            ServerReply::Data(content) => {
                let mut data = XmlElement::new("data");
                data.children = content;
                vec![data]
            }
            ServerReply::Error(err) => {
                let mut el = XmlElement::new("rpc-error")
                    .with_child(XmlElement::new("error-type").with_text(err.error_type))
                    .with_child(XmlElement::new("error-tag").with_text(err.tag))
                    .with_child(XmlElement::new("error-severity").with_text(err.severity));
                if let Some(msg) = err.message {
                    el.children
                        .push(XmlElement::new("error-message").with_text(msg));
                }
                if let Some(path) = err.path {
                    el.children
                        .push(XmlElement::new("error-path").with_text(path));
                }
                vec![el]
            }
            ServerReply::None => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use netconf_session::{Context, Session};
    use netconf_wire::{build_rpc, Capabilities, Version};
    use nix::unistd::pipe;
    use std::os::unix::io::RawFd;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// A running server session and its fake peer's (write, read) fds.
    fn server_session() -> (Arc<Session>, RawFd, RawFd) {
        let (s_in, peer_w) = pipe().unwrap();
        let (peer_r, s_out) = pipe().unwrap();
        let session = Session::server_fd(
            Arc::new(Context::new()),
            s_in,
            s_out,
            true,
            Some("admin".to_string()),
            None,
        )
        .unwrap();
        session.complete_handshake(Version::V10, Capabilities::client_default(), 1);
        (Arc::new(session), peer_w, peer_r)
    }

    fn feed_rpc(fd: RawFd, id: u64, op: &str) {
        let rpc = build_rpc(id, XmlElement::new(op), &[]);
        let framed = format!("{}]]>]]>", rpc.to_xml());
        nix::unistd::write(fd, framed.as_bytes()).unwrap();
    }

    fn read_reply(fd: RawFd) -> XmlElement {
        let mut buf = vec![0u8; 8192];
        let n = nix::unistd::read(fd, &mut buf).unwrap();
        let text = std::str::from_utf8(&buf[..n]).unwrap();
        let body = text.strip_suffix("]]>]]>").unwrap();
        XmlElement::parse(body).unwrap()
    }

    #[test]
    fn test_poll_times_out_on_idle_set() {
        let ps = PollSet::new(|_, _| ServerReply::Ok);
        let (session, _w, _r) = server_session();
        ps.add(session).unwrap();
        assert_eq!(
            ps.poll(Some(Duration::from_millis(30))).unwrap(),
            DispatchCode::Timeout
        );
    }

    #[test]
    fn test_poll_empty_set_is_an_error() {
        let ps = PollSet::new(|_, _| ServerReply::Ok);
        assert!(matches!(
            ps.poll(Some(Duration::from_millis(10))),
            Err(SessionError::InvalidArg(_))
        ));
    }

    #[test]
    fn test_rpc_dispatch_echoes_message_id() {
        let ps = PollSet::new(|_, rpc| {
            assert!(rpc.child("get").is_some());
            ServerReply::Ok
        });
        let (session, peer_w, peer_r) = server_session();
        ps.add(session).unwrap();

        feed_rpc(peer_w, 101, "get");
        assert_eq!(
            ps.poll(Some(Duration::from_secs(1))).unwrap(),
            DispatchCode::RpcHandled
        );

        let reply = read_reply(peer_r);
        assert_eq!(reply.name, "rpc-reply");
        assert_eq!(reply.attr("message-id"), Some("101"));
        assert!(reply.child("ok").is_some());
    }

    #[test]
    fn test_error_reply() {
        let ps = PollSet::new(|_, _| {
            ServerReply::Error(RpcError {
                error_type: "protocol".to_string(),
                tag: "operation-not-supported".to_string(),
                severity: "error".to_string(),
                message: Some("nope".to_string()),
                path: None,
            })
        });
        let (session, peer_w, peer_r) = server_session();
        ps.add(session).unwrap();

        feed_rpc(peer_w, 7, "frobnicate");
        assert_eq!(
            ps.poll(Some(Duration::from_secs(1))).unwrap(),
            DispatchCode::RpcError
        );

        let reply = read_reply(peer_r);
        let err = netconf_wire::parse_rpc_error(&reply).unwrap();
        assert_eq!(err.tag, "operation-not-supported");
    }

    #[test]
    fn test_close_session_is_answered_and_reported() {
        let ps = PollSet::new(|_, _| panic!("close-session must not reach the handler"));
        let (session, peer_w, peer_r) = server_session();
        ps.add(session.clone()).unwrap();

        feed_rpc(peer_w, 3, "close-session");
        assert_eq!(
            ps.poll(Some(Duration::from_secs(1))).unwrap(),
            DispatchCode::SessionClosed
        );
        assert_eq!(session.status(), SessionStatus::Invalid);
        assert_eq!(session.termination_reason(), Some(TermReason::Closed));

        let reply = read_reply(peer_r);
        assert!(reply.child("ok").is_some());
        assert_eq!(ps.remove_invalid(), 1);
    }

    #[test]
    fn test_membership_ops() {
        let ps = PollSet::new(|_, _| ServerReply::Ok);
        let (a, _aw, _ar) = server_session();
        let (b, _bw, _br) = server_session();
        ps.add(a.clone()).unwrap();
        ps.add(b.clone()).unwrap();
        assert_eq!(ps.len(), 2);
        assert!(ps.remove(&a));
        assert!(!ps.remove(&a));
        ps.clear();
        assert!(ps.is_empty());
    }

    #[test]
    fn test_concurrent_workers_dispatch_each_rpc_exactly_once() {
        static CALLS: AtomicUsize = AtomicUsize::new(0);
        let ps = Arc::new(PollSet::new(|_, _| {
            CALLS.fetch_add(1, Ordering::SeqCst);
            ServerReply::Ok
        }));

        let mut peers = Vec::new();
        for id in 0..3u64 {
            let (session, peer_w, peer_r) = server_session();
            ps.add(session).unwrap();
            feed_rpc(peer_w, 100 + id, "get");
            peers.push((peer_w, peer_r, 100 + id));
        }

        // Two workers drain the set concurrently.
        let workers: Vec<_> = (0..2)
            .map(|_| {
                let ps = ps.clone();
                std::thread::spawn(move || {
                    let mut handled = 0;
                    loop {
                        match ps.poll(Some(Duration::from_millis(200))) {
                            Ok(DispatchCode::RpcHandled) => handled += 1,
                            Ok(DispatchCode::Timeout) => break,
                            Ok(other) => panic!("unexpected outcome {other:?}"),
                            Err(e) => panic!("poll failed: {e}"),
                        }
                    }
                    handled
                })
            })
            .collect();

        let total: usize = workers.into_iter().map(|w| w.join().unwrap()).sum();
        assert_eq!(total, 3);
        assert_eq!(CALLS.load(Ordering::SeqCst), 3);

        // Every peer got exactly its own reply, with the matching id.
        for (_w, peer_r, id) in peers {
            let reply = read_reply(peer_r);
            assert_eq!(reply.attr("message-id"), Some(id.to_string().as_str()));
        }
    }
}
