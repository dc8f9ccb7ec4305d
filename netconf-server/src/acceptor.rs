//! Transport acceptors: turning accepted connections into running sessions.
//!
//! `accept` polls every listening endpoint, runs the transport handshake
//! and authentication for whichever fired, assigns a session id, and runs
//! the NETCONF hello. Sessions whose transport was established externally
//! (an sshd-spawned `netconf` subsystem) enter through `accept_inout`.

use std::net::{SocketAddr, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::Arc;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags};
use tracing::{debug, info, warn};

use netconf_session::{handshake_server, Session, SessionError, TransportKind};

use crate::config::{plock, Server};
use crate::tls;

impl Server {
    /// Wait up to `timeout` for an incoming connection on any endpoint and
    /// produce a running session from it. `Ok(None)` on timeout.
    ///
    /// Authentication failures close the TCP connection and surface as
    /// [`SessionError::AuthFailed`]; no session is produced.
    pub fn accept(&self, timeout: Option<Duration>) -> Result<Option<Arc<Session>>, SessionError> {
        let deadline = timeout.map(|t| Instant::now() + t);

        loop {
            let listeners: Vec<(std::net::TcpListener, TransportKind)> = {
                let binds = plock(&self.binds);
                if binds.is_empty() {
                    return Err(SessionError::InvalidArg("no listening endpoints"));
                }
                let mut snapshot = Vec::with_capacity(binds.len());
                for bind in binds.iter() {
                    snapshot.push((bind.listener.try_clone()?, bind.kind));
                }
                snapshot
            };

            let mut fds: Vec<PollFd> = listeners
                .iter()
                .map(|(l, _)| PollFd::new(l.as_raw_fd(), PollFlags::POLLIN))
                .collect();
            let timeout_ms: i32 = match deadline {
                None => -1,
                Some(d) => d
                    .saturating_duration_since(Instant::now())
                    .as_millis()
                    .min(i32::MAX as u128) as i32,
            };
            match poll(&mut fds, timeout_ms) {
                Ok(0) => return Ok(None),
                Ok(_) => {}
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(SessionError::Transport(e.to_string())),
            }

            for (i, (listener, kind)) in listeners.iter().enumerate() {
                let revents = fds[i].revents().unwrap_or(PollFlags::empty());
                if !revents.contains(PollFlags::POLLIN) {
                    continue;
                }
                match listener.accept() {
                    Ok((stream, peer)) => {
                        info!("accepted {kind:?} connection from {peer}");
                        stream.set_nonblocking(false)?;
                        return self.establish(stream, peer, *kind).map(Some);
                    }
                    // Another acceptor thread won the race for this one.
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
                    Err(e) => return Err(SessionError::Transport(e.to_string())),
                }
            }

            if matches!(deadline, Some(d) if Instant::now() >= d) {
                return Ok(None);
            }
        }
    }

    /// Produce a running server session over an fd pair whose peer was
    /// authenticated by an external transport (sshd `Subsystem netconf`).
    pub fn accept_inout(
        &self,
        fd_in: RawFd,
        fd_out: RawFd,
        username: &str,
    ) -> Result<Arc<Session>, SessionError> {
        let session = Session::server_fd(
            self.context().clone(),
            fd_in,
            fd_out,
            true,
            Some(username.to_string()),
            self.idle_timeout(),
        )?;
        self.finish_handshake(session)
    }

    /// Run the transport handshake for an established TCP connection and
    /// then the NETCONF hello. Shared by `accept` and call home.
    pub(crate) fn establish(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
        kind: TransportKind,
    ) -> Result<Arc<Session>, SessionError> {
        let idle = self.idle_timeout();
        let session = match kind {
            TransportKind::Tls => {
                let opts = self.tls_options();
                let config = tls::build_server_config(&opts)?;
                // A stalled peer must not wedge the acceptor mid-handshake.
                stream.set_read_timeout(Some(self.hello_timeout()))?;
                let (tls_stream, peer_cert) = tls::accept_tls(stream, config)?;

                let username = if opts.ctn.is_empty() {
                    None
                } else {
                    let cert = peer_cert.as_deref().ok_or_else(|| {
                        SessionError::AuthFailed("client certificate required".to_string())
                    })?;
                    let name = tls::cert_to_name(cert, &opts.ctn)?;
                    debug!("tls peer {peer} mapped to username {name}");
                    Some(name)
                };
                Session::server_tls(
                    self.context().clone(),
                    tls_stream,
                    username,
                    peer_cert,
                    Some(peer.ip().to_string()),
                    peer.port(),
                    idle,
                )?
            }
            TransportKind::Ssh => {
                let opts = self.ssh_options();
                let adapter = plock(&self.ssh_adapter).clone().ok_or_else(|| {
                    warn!("ssh connection from {peer} but no server adapter installed");
                    SessionError::AuthFailed("no SSH server adapter installed".to_string())
                })?;
                let accepted = adapter.handshake(stream, &opts)?;
                debug!("ssh peer {peer} authenticated as {}", accepted.username);
                Session::server_fd(
                    self.context().clone(),
                    accepted.fd_in,
                    accepted.fd_out,
                    true,
                    Some(accepted.username),
                    idle,
                )?
            }
            TransportKind::Fd => {
                return Err(SessionError::InvalidArg("fd transport cannot be accepted"))
            }
        };
        self.finish_handshake(session)
    }

    fn finish_handshake(&self, session: Session) -> Result<Arc<Session>, SessionError> {
        let id = self.next_session_id();
        handshake_server(
            &session,
            id,
            &self.capabilities(),
            Some(self.hello_timeout()),
        )?;
        info!(
            "session {id} running for {:?}",
            session.username().unwrap_or_default()
        );
        Ok(Arc::new(session))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use netconf_session::{connect_fd, Context, Datastore, Rpc, SessionStatus};
    use netconf_wire::{build_reply, MsgType, Version, XmlElement};
    use nix::unistd::pipe;

    #[test]
    fn test_accept_without_endpoints_is_an_error() {
        let server = Server::new(Arc::new(Context::new()));
        assert!(matches!(
            server.accept(Some(Duration::from_millis(10))),
            Err(SessionError::InvalidArg(_))
        ));
    }

    #[test]
    fn test_accept_times_out_quietly() {
        let server = Server::new(Arc::new(Context::new()));
        server
            .add_endpoint("main", TransportKind::Tls, "127.0.0.1", 0)
            .unwrap();
        let start = Instant::now();
        assert!(server.accept(Some(Duration::from_millis(50))).unwrap().is_none());
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn test_accept_inout_end_to_end() {
        let (c_in, s_out) = pipe().unwrap();
        let (s_in, c_out) = pipe().unwrap();

        // Client side runs in its own thread, exactly like a management
        // station talking to an sshd-spawned subsystem.
        let client_thread = std::thread::spawn(move || {
            let client = connect_fd(Arc::new(Context::new()), c_in, c_out, true).unwrap();
            let id = client
                .send_rpc(&Rpc::Lock {
                    target: Datastore::Running,
                })
                .unwrap();
            let reply = client.recv_reply(id, Some(Duration::from_secs(2))).unwrap();
            (client.session_id(), client.version(), reply)
        });

        let server = Server::new(Arc::new(Context::new()));
        let session = server.accept_inout(s_in, s_out, "operator").unwrap();
        assert_eq!(session.status(), SessionStatus::Running);
        assert_eq!(session.username().as_deref(), Some("operator"));
        assert_eq!(session.version(), Some(Version::V11));

        // Serve the one rpc by hand.
        let (mtype, rpc) = session
            .read_msg_poll(Some(Duration::from_secs(2)))
            .unwrap()
            .unwrap();
        assert_eq!(mtype, MsgType::Rpc);
        assert_eq!(rpc.children[0].name, "lock");
        let msg_id = rpc.attr("message-id").unwrap().to_string();
        session
            .write_msg(&build_reply(&msg_id, vec![XmlElement::new("ok")]))
            .unwrap();

        let (client_sid, client_version, reply) = client_thread.join().unwrap();
        assert_eq!(client_sid, session.session_id());
        assert_eq!(client_version, Some(Version::V11));
        assert!(reply.child("ok").is_some());
    }
}
