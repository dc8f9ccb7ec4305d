//! Client-side session establishment, dispatch, and correlation.
//!
//! A client connects over an fd pair, SSH, or TLS, runs the hello
//! handshake, and then issues RPCs. Replies are correlated by message-id;
//! replies and notifications that arrive while the caller waits for
//! something else are steered into per-session FIFO queues.

use std::net::{TcpListener, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use netconf_wire::{build_rpc, message_id, Capabilities, MsgType, XmlElement};
use tracing::{debug, info, warn};

use crate::config::{SshAuthMethod, SshClientOptions, TlsClientOptions};
use crate::context::Context;
use crate::error::SessionError;
use crate::handshake::{handshake_client, DEFAULT_HELLO_TIMEOUT};
use crate::session::{plock, Role, Session, SessionStatus, TermReason};
use crate::transport::{ssh_err, SshConnection, Transport};

/// Default NETCONF-over-SSH port.
pub const PORT_SSH: u16 = 830;

/// Default NETCONF-over-TLS port.
pub const PORT_TLS: u16 = 6513;

/// Default call-home listening port.
pub const PORT_CALLHOME: u16 = 6666;

/// How long a graceful close waits for the `<ok/>` reply.
const CLOSE_REPLY_TIMEOUT: Duration = Duration::from_millis(200);

/// Build a starting client session over an fd pair, no handshake yet.
pub(crate) fn session_from_fds(
    ctx: Arc<Context>,
    fd_in: RawFd,
    fd_out: RawFd,
    owned: bool,
) -> Result<Session, SessionError> {
    let transport = Transport::fd(fd_in, fd_out, owned)?;
    Ok(Session::new(
        Role::Client,
        ctx,
        transport,
        Arc::new(Mutex::new(())),
        None,
        None,
        0,
        None,
    ))
}

/// Connect over an existing fd pair (for example the pipes of a spawned
/// `ssh -s netconf`) and run the handshake.
pub fn connect_fd(
    ctx: Arc<Context>,
    fd_in: RawFd,
    fd_out: RawFd,
    owned: bool,
) -> Result<Session, SessionError> {
    let session = session_from_fds(ctx, fd_in, fd_out, owned)?;
    handshake_client(
        &session,
        &Capabilities::client_default(),
        Some(DEFAULT_HELLO_TIMEOUT),
    )?;
    Ok(session)
}

/// Connect to a NETCONF server over SSH and run the handshake.
/// `port` 0 selects the default port 830.
pub fn connect_ssh(
    ctx: Arc<Context>,
    host: &str,
    port: u16,
    opts: &SshClientOptions,
) -> Result<Session, SessionError> {
    let port = if port == 0 { PORT_SSH } else { port };
    let stream = TcpStream::connect((host, port))
        .map_err(|e| SessionError::Transport(format!("connect {host}:{port}: {e}")))?;
    session_over_ssh_stream(ctx, stream, host, port, opts)
}

/// Open another NETCONF session over the SSH connection of an existing
/// session. The new session shares the connection's transport mutex.
pub fn connect_ssh_channel(existing: &Session) -> Result<Session, SessionError> {
    let conn = existing
        .ssh_connection()
        .ok_or(SessionError::InvalidArg("not an SSH session"))?
        .clone();

    // Channel setup interleaves with sibling traffic, so it runs under the
    // shared transport mutex.
    let channel = {
        let _guard = existing.lock_io();
        conn.open_netconf_channel()?
    };

    let session = Session::new(
        Role::Client,
        existing.context().clone(),
        Transport::ssh(channel, conn.clone()),
        existing.transport_lock().clone(),
        Some(conn.clone()),
        Some(conn.host().to_string()),
        conn.port(),
        None,
    );
    handshake_client(
        &session,
        &Capabilities::client_default(),
        Some(DEFAULT_HELLO_TIMEOUT),
    )?;
    Ok(session)
}

/// Connect to a NETCONF server over TLS and run the handshake.
/// `port` 0 selects the default port 6513.
pub fn connect_tls(
    ctx: Arc<Context>,
    host: &str,
    port: u16,
    opts: &TlsClientOptions,
) -> Result<Session, SessionError> {
    let port = if port == 0 { PORT_TLS } else { port };
    let stream = TcpStream::connect((host, port))
        .map_err(|e| SessionError::Transport(format!("connect {host}:{port}: {e}")))?;
    session_over_tls_stream(ctx, stream, host, port, opts)
}

/// Transport choice for an incoming call-home connection.
pub enum CallHomeTransport<'a> {
    /// The dialing server speaks SSH.
    Ssh(&'a SshClientOptions),
    /// The dialing server speaks TLS.
    Tls(&'a TlsClientOptions),
}

/// Wait for a call-home connection: bind, accept one TCP connection from a
/// dialing server, then run the usual transport and NETCONF handshakes.
/// Returns `Ok(None)` if nothing dialed in before the timeout.
pub fn accept_callhome(
    ctx: Arc<Context>,
    bind_addr: &str,
    port: u16,
    timeout: Option<Duration>,
    transport: CallHomeTransport<'_>,
) -> Result<Option<Session>, SessionError> {
    let port = if port == 0 { PORT_CALLHOME } else { port };
    let listener = TcpListener::bind((bind_addr, port))
        .map_err(|e| SessionError::Transport(format!("bind {bind_addr}:{port}: {e}")))?;
    listener.set_nonblocking(true)?;
    info!("call-home: listening on {bind_addr}:{port}");

    let deadline = timeout.map(|t| Instant::now() + t);
    let stream = loop {
        match listener.accept() {
            Ok((stream, peer)) => {
                info!("call-home: connection from {peer}");
                stream.set_nonblocking(false)?;
                break stream;
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                match crate::transport::poll_raw_fd(listener.as_raw_fd(), deadline)? {
                    true => continue,
                    false => return Ok(None),
                }
            }
            Err(e) => return Err(SessionError::Transport(e.to_string())),
        }
    };

    let peer = stream
        .peer_addr()
        .map_err(|e| SessionError::Transport(e.to_string()))?;
    let host = peer.ip().to_string();
    match transport {
        CallHomeTransport::Ssh(opts) => {
            session_over_ssh_stream(ctx, stream, &host, peer.port(), opts).map(Some)
        }
        CallHomeTransport::Tls(opts) => {
            session_over_tls_stream(ctx, stream, &host, peer.port(), opts).map(Some)
        }
    }
}

/// SSH transport setup over an established TCP stream.
fn session_over_ssh_stream(
    ctx: Arc<Context>,
    stream: TcpStream,
    host: &str,
    port: u16,
    opts: &SshClientOptions,
) -> Result<Session, SessionError> {
    let socket_fd = stream.as_raw_fd();

    let mut ssh = ssh2::Session::new().map_err(ssh_err)?;
    ssh.set_tcp_stream(stream);
    ssh.set_timeout(30_000);
    ssh.handshake().map_err(ssh_err)?;

    let username = opts
        .username
        .clone()
        .or_else(|| std::env::var("USER").ok())
        .ok_or(SessionError::InvalidArg("no SSH username configured"))?;
    authenticate_ssh(&ssh, &username, opts)?;

    let mut channel = ssh.channel_session().map_err(ssh_err)?;
    channel.subsystem("netconf").map_err(ssh_err)?;
    debug!("ssh transport to {host}:{port} ready, user {username}");

    let conn = Arc::new(SshConnection::new(ssh, socket_fd, host.to_string(), port));
    let session = Session::new(
        Role::Client,
        ctx,
        Transport::ssh(channel, conn.clone()),
        Arc::new(Mutex::new(())),
        Some(conn),
        Some(host.to_string()),
        port,
        None,
    );
    handshake_client(
        &session,
        &Capabilities::client_default(),
        Some(DEFAULT_HELLO_TIMEOUT),
    )?;
    Ok(session)
}

/// Try the configured authentication methods in preference order.
fn authenticate_ssh(
    ssh: &ssh2::Session,
    username: &str,
    opts: &SshClientOptions,
) -> Result<(), SessionError> {
    let server_methods = ssh.auth_methods(username).unwrap_or("").to_string();
    debug!("server offers auth methods: {server_methods}");

    for method in opts.ordered_auth_methods() {
        if ssh.authenticated() {
            break;
        }
        match method {
            SshAuthMethod::Publickey => {
                if !server_methods.contains("publickey") {
                    continue;
                }
                for kp in &opts.keypairs {
                    let res = ssh.userauth_pubkey_file(
                        username,
                        kp.public.as_deref(),
                        &kp.private,
                        kp.passphrase.as_deref(),
                    );
                    match res {
                        Ok(()) => break,
                        Err(e) => debug!("publickey {:?} rejected: {e}", kp.private),
                    }
                }
            }
            SshAuthMethod::Password => {
                if !server_methods.contains("password") {
                    continue;
                }
                if let Some(password) = &opts.password {
                    if let Err(e) = ssh.userauth_password(username, password) {
                        debug!("password auth rejected: {e}");
                    }
                }
            }
            SshAuthMethod::Interactive => {
                if !server_methods.contains("keyboard-interactive") {
                    continue;
                }
                if let Some(cb) = &opts.interactive {
                    let mut prompter = Prompter(cb.clone());
                    if let Err(e) = ssh.userauth_keyboard_interactive(username, &mut prompter) {
                        debug!("keyboard-interactive auth rejected: {e}");
                    }
                }
            }
        }
    }

    if ssh.authenticated() {
        Ok(())
    } else {
        warn!("all SSH authentication methods failed for {username}");
        Err(SessionError::AuthFailed(format!(
            "ssh authentication failed for {username}"
        )))
    }
}

struct Prompter(crate::config::InteractiveCallback);

impl ssh2::KeyboardInteractivePrompt for Prompter {
    fn prompt<'a>(
        &mut self,
        _username: &str,
        _instructions: &str,
        prompts: &[ssh2::Prompt<'a>],
    ) -> Vec<String> {
        prompts.iter().map(|p| (self.0)(&p.text)).collect()
    }
}

/// TLS transport setup over an established TCP stream.
fn session_over_tls_stream(
    ctx: Arc<Context>,
    stream: TcpStream,
    host: &str,
    port: u16,
    opts: &TlsClientOptions,
) -> Result<Session, SessionError> {
    let config = build_tls_client_config(opts)?;
    let server_name = rustls::pki_types::ServerName::try_from(host.to_string())
        .map_err(|_| SessionError::InvalidArg("invalid TLS server name"))?;
    let conn = rustls::ClientConnection::new(config, server_name)
        .map_err(|e| SessionError::Transport(format!("tls: {e}")))?;

    // A stalled server must not wedge the connect mid-handshake.
    stream.set_read_timeout(Some(DEFAULT_HELLO_TIMEOUT))?;
    let mut tls = rustls::StreamOwned::new(conn, stream);
    while tls.conn.is_handshaking() {
        tls.conn
            .complete_io(&mut tls.sock)
            .map_err(|e| SessionError::AuthFailed(format!("tls handshake: {e}")))?;
    }
    debug!("tls transport to {host}:{port} ready");

    let session = Session::new(
        Role::Client,
        ctx,
        Transport::tls_client(tls)?,
        Arc::new(Mutex::new(())),
        None,
        Some(host.to_string()),
        port,
        None,
    );
    handshake_client(
        &session,
        &Capabilities::client_default(),
        Some(DEFAULT_HELLO_TIMEOUT),
    )?;
    Ok(session)
}

fn build_tls_client_config(
    opts: &TlsClientOptions,
) -> Result<Arc<rustls::ClientConfig>, SessionError> {
    let mut roots = rustls::RootCertStore::empty();
    let mut loaded = 0usize;
    if let Some(file) = &opts.ca_file {
        loaded += add_roots_from_file(&mut roots, file)?;
    }
    if let Some(dir) = &opts.ca_dir {
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().is_some_and(|e| e == "pem" || e == "crt") {
                loaded += add_roots_from_file(&mut roots, &path)?;
            }
        }
    }
    if loaded == 0 {
        return Err(SessionError::InvalidArg("no TLS trust anchors configured"));
    }

    let certs = load_certs(&opts.cert_path)?;
    let key = load_key(&opts.key_path)?;

    // With revocation lists configured, the server certificate is checked
    // against them through an explicit verifier.
    let crls = load_client_crls(opts)?;
    let config = if crls.is_empty() {
        rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_client_auth_cert(certs, key)
    } else {
        let verifier = rustls::client::WebPkiServerVerifier::builder(Arc::new(roots))
            .with_crls(crls)
            .build()
            .map_err(|e| SessionError::AuthFailed(format!("server verifier: {e}")))?;
        rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(verifier)
            .with_client_auth_cert(certs, key)
    }
    .map_err(|e| SessionError::AuthFailed(format!("tls client config: {e}")))?;
    Ok(Arc::new(config))
}

/// Load the configured revocation lists for server certificate checks.
fn load_client_crls(
    opts: &TlsClientOptions,
) -> Result<Vec<rustls::pki_types::CertificateRevocationListDer<'static>>, SessionError> {
    let mut files = Vec::new();
    if let Some(file) = &opts.crl_file {
        files.push(file.clone());
    }
    if let Some(dir) = &opts.crl_dir {
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().is_some_and(|e| e == "pem" || e == "crl") {
                files.push(path);
            }
        }
    }

    let mut crls = Vec::new();
    for path in files {
        let data = std::fs::read(&path)
            .map_err(|e| SessionError::Transport(format!("{}: {e}", path.display())))?;
        let mut reader = data.as_slice();
        for crl in rustls_pemfile::crls(&mut reader) {
            crls.push(crl.map_err(|e| {
                SessionError::AuthFailed(format!("bad CRL in {}: {e}", path.display()))
            })?);
        }
    }
    Ok(crls)
}

fn add_roots_from_file(
    roots: &mut rustls::RootCertStore,
    path: &Path,
) -> Result<usize, SessionError> {
    let mut n = 0;
    for cert in load_certs(path)? {
        roots
            .add(cert)
            .map_err(|e| {
                SessionError::AuthFailed(format!("bad CA certificate in {}: {e}", path.display()))
            })?;
        n += 1;
    }
    Ok(n)
}

pub(crate) fn load_certs(
    path: &Path,
) -> Result<Vec<rustls::pki_types::CertificateDer<'static>>, SessionError> {
    let file = std::fs::File::open(path)
        .map_err(|e| SessionError::Transport(format!("{}: {e}", path.display())))?;
    let mut reader = std::io::BufReader::new(file);
    rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| SessionError::Transport(format!("{}: {e}", path.display())))
}

pub(crate) fn load_key(
    path: &Path,
) -> Result<rustls::pki_types::PrivateKeyDer<'static>, SessionError> {
    let file = std::fs::File::open(path)
        .map_err(|e| SessionError::Transport(format!("{}: {e}", path.display())))?;
    let mut reader = std::io::BufReader::new(file);
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| SessionError::Transport(format!("{}: {e}", path.display())))?
        .ok_or(SessionError::InvalidArg("no private key in key file"))
}

impl Session {
    /// Send one RPC; returns the assigned message-id.
    ///
    /// The id is taken and the envelope written under the transport mutex,
    /// so concurrent senders appear on the wire in id order.
    pub fn send_rpc(&self, rpc: &crate::rpc::Rpc) -> Result<u64, SessionError> {
        self.send_rpc_with_attrs(rpc, &[])
    }

    /// Send one RPC with extra attributes on the `<rpc>` element.
    pub fn send_rpc_with_attrs(
        &self,
        rpc: &crate::rpc::Rpc,
        attrs: &[(String, String)],
    ) -> Result<u64, SessionError> {
        if self.role() != Role::Client {
            return Err(SessionError::InvalidArg("send_rpc on a server session"));
        }
        let mut guard = self.lock_io();
        let id = plock(self.client_data()).next_message_id();
        let envelope = build_rpc(id, rpc.to_body(), attrs);
        guard.write_msg(&envelope)?;
        debug!("sent <{}> as message {id}", rpc.operation_name());
        Ok(id)
    }

    /// Wait for the reply to a previously sent RPC.
    ///
    /// Replies to other in-flight RPCs and notifications read along the way
    /// are queued for their own consumers. Times out with the remaining
    /// budget accounted across the intermediate reads.
    pub fn recv_reply(
        &self,
        msg_id: u64,
        timeout: Option<Duration>,
    ) -> Result<XmlElement, SessionError> {
        if self.role() != Role::Client {
            return Err(SessionError::InvalidArg("recv_reply on a server session"));
        }
        let deadline = timeout.map(|t| Instant::now() + t);

        loop {
            if let Some(reply) = plock(self.client_data()).pop_reply(msg_id) {
                return Ok(reply);
            }

            let remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));
            if matches!(remaining, Some(r) if r.is_zero()) {
                return Err(SessionError::Timeout);
            }
            match self.read_msg_poll(remaining)? {
                None => return Err(SessionError::Timeout),
                Some((MsgType::Reply, root)) => {
                    if message_id(&root) == Some(msg_id) {
                        return Ok(root);
                    }
                    plock(self.client_data()).push_reply(root);
                }
                Some((MsgType::Notification, root)) => {
                    plock(self.client_data()).push_notification(root);
                }
                // read_msg already rejects everything else on this side.
                Some((other, _)) => {
                    return Err(SessionError::Protocol(format!(
                        "unexpected {other:?} while waiting for a reply"
                    )))
                }
            }
        }
    }

    /// Pull the next notification, if one arrives in time.
    ///
    /// Replies read along the way are queued for their `recv_reply`
    /// callers. There is no library-owned delivery thread; this is the
    /// only way notifications surface.
    pub fn recv_notification(
        &self,
        timeout: Option<Duration>,
    ) -> Result<Option<XmlElement>, SessionError> {
        if self.role() != Role::Client {
            return Err(SessionError::InvalidArg(
                "recv_notification on a server session",
            ));
        }
        let deadline = timeout.map(|t| Instant::now() + t);

        loop {
            if let Some(notif) = plock(self.client_data()).pop_notification() {
                return Ok(Some(notif));
            }

            let remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));
            if matches!(remaining, Some(r) if r.is_zero()) {
                return Ok(None);
            }
            match self.read_msg_poll(remaining)? {
                None => return Ok(None),
                Some((MsgType::Notification, root)) => return Ok(Some(root)),
                Some((MsgType::Reply, root)) => {
                    plock(self.client_data()).push_reply(root);
                }
                Some((other, _)) => {
                    return Err(SessionError::Protocol(format!(
                        "unexpected {other:?} while waiting for a notification"
                    )))
                }
            }
        }
    }

    /// Gracefully close a client session: send `<close-session>`, briefly
    /// wait for the `<ok/>`, then tear down.
    pub fn close(&self) -> Result<(), SessionError> {
        if self.role() == Role::Client && self.status() == SessionStatus::Running {
            match self.send_rpc(&crate::rpc::Rpc::CloseSession) {
                Ok(id) => {
                    // The reply is a courtesy; the peer may just drop.
                    let _ = self.recv_reply(id, Some(CLOSE_REPLY_TIMEOUT));
                }
                Err(e) => debug!("close-session not sent: {e}"),
            }
        }
        self.mark_closing();
        self.mark_invalid(TermReason::Closed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::{Datastore, Rpc};
    use netconf_wire::{build_notification, build_reply, Version, CAP_BASE_11};
    use nix::unistd::pipe;

    /// A running client session and the fds of its fake peer.
    fn running_client() -> (Session, RawFd, RawFd) {
        let (c_in, peer_w) = pipe().unwrap();
        let (peer_r, c_out) = pipe().unwrap();
        let session =
            session_from_fds(Arc::new(Context::new()), c_in, c_out, true).unwrap();
        session.complete_handshake(
            Version::V11,
            Capabilities::new(vec![CAP_BASE_11.to_string()]),
            9,
        );
        (session, peer_w, peer_r)
    }

    fn feed(fd: RawFd, root: &XmlElement) {
        let framed = format!("\n#{len}\n{xml}\n##\n", len = root.to_xml().len(), xml = root.to_xml());
        nix::unistd::write(fd, framed.as_bytes()).unwrap();
    }

    #[test]
    fn test_send_rpc_assigns_increasing_ids() {
        let (session, _w, _r) = running_client();
        let rpc = Rpc::Lock {
            target: Datastore::Running,
        };
        assert_eq!(session.send_rpc(&rpc).unwrap(), 1);
        assert_eq!(session.send_rpc(&rpc).unwrap(), 2);
        assert_eq!(session.send_rpc(&rpc).unwrap(), 3);
    }

    #[test]
    fn test_send_rpc_1_1_exact_bytes_from_configured_id() {
        let (session, _w, peer_r) = running_client();
        session.set_next_message_id(1000);
        let id = session
            .send_rpc(&Rpc::Lock {
                target: Datastore::Running,
            })
            .unwrap();
        assert_eq!(id, 1000);

        let mut buf = [0u8; 512];
        let n = nix::unistd::read(peer_r, &mut buf).unwrap();
        let payload = "<rpc message-id=\"1000\" \
                       xmlns=\"urn:ietf:params:xml:ns:netconf:base:1.0\">\
                       <lock><target><running/></target></lock></rpc>";
        let expected = format!("\n#{}\n{}\n##\n", payload.len(), payload);
        assert_eq!(std::str::from_utf8(&buf[..n]).unwrap(), expected);
    }

    #[test]
    fn test_recv_reply_correlates_by_id() {
        let (session, peer_w, _r) = running_client();
        let id = session
            .send_rpc(&Rpc::Lock {
                target: Datastore::Running,
            })
            .unwrap();

        feed(peer_w, &build_reply(&id.to_string(), vec![XmlElement::new("ok")]));
        let reply = session.recv_reply(id, Some(Duration::from_secs(1))).unwrap();
        assert_eq!(netconf_wire::reply_kind(&reply), netconf_wire::ReplyKind::Ok);
    }

    #[test]
    fn test_recv_reply_queues_misordered_messages() {
        let (session, peer_w, _r) = running_client();
        let id1 = session.send_rpc(&Rpc::DiscardChanges).unwrap();
        let id2 = session.send_rpc(&Rpc::DiscardChanges).unwrap();

        // The peer answers out of order and slips in a notification.
        feed(peer_w, &build_reply(&id2.to_string(), vec![XmlElement::new("ok")]));
        feed(
            peer_w,
            &build_notification("2024-01-01T00:00:00Z", XmlElement::new("config-change")),
        );
        feed(peer_w, &build_reply(&id1.to_string(), vec![XmlElement::new("ok")]));

        // Waiting for id1 steers the id2 reply and the notification aside.
        let r1 = session.recv_reply(id1, Some(Duration::from_secs(1))).unwrap();
        assert_eq!(netconf_wire::message_id(&r1), Some(id1));

        // Both queued messages pop without touching the wire.
        let r2 = session.recv_reply(id2, Some(Duration::from_millis(50))).unwrap();
        assert_eq!(netconf_wire::message_id(&r2), Some(id2));
        let n = session
            .recv_notification(Some(Duration::from_millis(50)))
            .unwrap()
            .unwrap();
        assert_eq!(n.child("config-change").is_some(), true);
    }

    #[test]
    fn test_recv_reply_times_out() {
        let (session, _w, _r) = running_client();
        let id = session.send_rpc(&Rpc::DiscardChanges).unwrap();
        let start = Instant::now();
        match session.recv_reply(id, Some(Duration::from_millis(50))) {
            Err(SessionError::Timeout) => {}
            other => panic!("expected Timeout, got {other:?}"),
        }
        assert!(start.elapsed() >= Duration::from_millis(50));
        // Timeouts never change session status.
        assert_eq!(session.status(), SessionStatus::Running);
    }

    #[test]
    fn test_recv_notification_empty() {
        let (session, _w, _r) = running_client();
        assert!(session
            .recv_notification(Some(Duration::from_millis(30)))
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_load_client_crls() {
        use std::io::Write;
        use std::path::PathBuf;

        // Nothing configured, nothing loaded.
        assert!(load_client_crls(&TlsClientOptions::default())
            .unwrap()
            .is_empty());

        // A configured file without CRL blocks contributes nothing.
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "no revocation lists here").unwrap();
        let mut opts = TlsClientOptions::default();
        opts.crl_file = Some(file.path().to_path_buf());
        assert!(load_client_crls(&opts).unwrap().is_empty());

        // An unreadable configured file is an error, not silence.
        let mut missing = TlsClientOptions::default();
        missing.crl_file = Some(PathBuf::from("/nonexistent/revoked.crl"));
        assert!(matches!(
            load_client_crls(&missing),
            Err(SessionError::Transport(_))
        ));
    }

    #[test]
    fn test_close_marks_session_closed() {
        let (session, _w, _r) = running_client();
        session.close().unwrap();
        assert_eq!(session.status(), SessionStatus::Invalid);
        assert_eq!(session.termination_reason(), Some(TermReason::Closed));
    }

    #[test]
    fn test_roundtrip_identical_trees() {
        // write_msg then read_msg over a loopback yields the same tree.
        let (c_in, s_w) = pipe().unwrap();
        let (s_r, c_out) = pipe().unwrap();
        let client =
            session_from_fds(Arc::new(Context::new()), c_in, c_out, true).unwrap();
        client.complete_handshake(Version::V11, Capabilities::client_default(), 1);
        let server = Session::server_fd(
            Arc::new(Context::new()),
            s_r,
            s_w,
            true,
            Some("admin".to_string()),
            None,
        )
        .unwrap();
        server.complete_handshake(Version::V11, Capabilities::client_default(), 1);

        let sent = build_rpc(
            42,
            Rpc::Lock {
                target: Datastore::Running,
            }
            .to_body(),
            &[],
        );
        client.write_msg(&sent).unwrap();
        let (mtype, received) = server
            .read_msg_poll(Some(Duration::from_secs(1)))
            .unwrap()
            .unwrap();
        assert_eq!(mtype, MsgType::Rpc);
        assert_eq!(received, sent);
    }
}
