//! Byte-stream transports for NETCONF sessions.
//!
//! A session's transport is a closed sum over raw file descriptors, an SSH
//! channel, and a TLS connection. All three expose the same three
//! operations: a non-blocking read, a blocking whole-buffer write, and
//! `poll_readable`, the only operation permitted to wait.

use std::net::TcpStream;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::poll::{poll, PollFd, PollFlags};
use tracing::{debug, trace};

use crate::error::SessionError;
use crate::session::plock;

/// Sleep between re-reads when a ready transport briefly has no bytes.
pub(crate) const READ_RETRY_SLEEP: Duration = Duration::from_micros(100);

/// Transport kinds a session can run over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// A pair of raw file descriptors (pipes, an inherited sshd channel).
    Fd,
    /// An SSH channel with the `netconf` subsystem.
    Ssh,
    /// A TLS connection.
    Tls,
}

/// Outcome of a non-blocking read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// `n > 0` bytes were read.
    Data(usize),
    /// No bytes available right now.
    WouldBlock,
    /// The peer closed the stream.
    Eof,
}

/// Outcome of `poll_readable`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// Bytes are (probably) available to read.
    Ready,
    /// The timeout expired first.
    TimedOut,
    /// The peer hung up.
    Disconnect,
}

/// Shared owner of one SSH connection multiplexing sibling NETCONF
/// sessions. Siblings hold this via `Arc` together with one shared
/// transport mutex; dropping the last sibling drops the connection.
pub struct SshConnection {
    session: Mutex<ssh2::Session>,
    socket_fd: RawFd,
    host: String,
    port: u16,
}

impl std::fmt::Debug for SshConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshConnection")
            .field("host", &self.host)
            .field("port", &self.port)
            .finish()
    }
}

impl SshConnection {
    pub(crate) fn new(session: ssh2::Session, socket_fd: RawFd, host: String, port: u16) -> Self {
        Self {
            session: Mutex::new(session),
            socket_fd,
            host,
            port,
        }
    }

    /// Open another `netconf` subsystem channel on this connection.
    ///
    /// Callers must hold the shared transport mutex: channel setup
    /// interleaves with sibling traffic on the same TCP stream.
    pub(crate) fn open_netconf_channel(&self) -> Result<ssh2::Channel, SessionError> {
        let session = plock(&self.session);
        session.set_blocking(true);
        let mut channel = session.channel_session().map_err(ssh_err)?;
        channel.subsystem("netconf").map_err(ssh_err)?;
        debug!("opened netconf channel to {}:{}", self.host, self.port);
        Ok(channel)
    }

    fn set_blocking(&self, blocking: bool) {
        plock(&self.session).set_blocking(blocking);
    }

    /// Remote host this connection is established with.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Remote port this connection is established with.
    pub fn port(&self) -> u16 {
        self.port
    }
}

/// TLS stream direction; rustls splits the connection type by role.
pub(crate) enum TlsStream {
    Server(rustls::StreamOwned<rustls::ServerConnection, TcpStream>),
    Client(rustls::StreamOwned<rustls::ClientConnection, TcpStream>),
}

impl TlsStream {
    fn sock(&self) -> &TcpStream {
        match self {
            TlsStream::Server(s) => &s.sock,
            TlsStream::Client(s) => &s.sock,
        }
    }

    fn buffered_plaintext(&mut self) -> Result<usize, SessionError> {
        let state = match self {
            TlsStream::Server(s) => s.conn.process_new_packets(),
            TlsStream::Client(s) => s.conn.process_new_packets(),
        };
        state
            .map(|io| io.plaintext_bytes_to_read())
            .map_err(|e| SessionError::Transport(format!("tls: {e}")))
    }

    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        use std::io::Read;
        match self {
            TlsStream::Server(s) => s.read(buf),
            TlsStream::Client(s) => s.read(buf),
        }
    }

    fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()> {
        use std::io::Write;
        match self {
            TlsStream::Server(s) => {
                s.write_all(buf)?;
                s.flush()
            }
            TlsStream::Client(s) => {
                s.write_all(buf)?;
                s.flush()
            }
        }
    }
}

/// The byte-stream backend of one session.
pub(crate) enum Transport {
    Fd {
        input: RawFd,
        output: RawFd,
        owned: bool,
    },
    Ssh {
        channel: ssh2::Channel,
        conn: std::sync::Arc<SshConnection>,
        /// One byte read ahead while probing channel readability.
        pushback: Option<u8>,
    },
    Tls(TlsStream),
}

impl Transport {
    /// Attach an fd pair. The input fd is switched to non-blocking mode.
    /// With `owned`, both fds are closed when the transport is dropped.
    pub(crate) fn fd(input: RawFd, output: RawFd, owned: bool) -> Result<Self, SessionError> {
        set_nonblocking(input)?;
        Ok(Transport::Fd {
            input,
            output,
            owned,
        })
    }

    pub(crate) fn ssh(channel: ssh2::Channel, conn: std::sync::Arc<SshConnection>) -> Self {
        Transport::Ssh {
            channel,
            conn,
            pushback: None,
        }
    }

    /// Attach a server-side TLS stream. A short socket read timeout gives
    /// the blocking socket would-block semantics.
    pub(crate) fn tls_server(
        stream: rustls::StreamOwned<rustls::ServerConnection, TcpStream>,
    ) -> Result<Self, SessionError> {
        stream
            .sock
            .set_read_timeout(Some(READ_RETRY_SLEEP.max(Duration::from_millis(10))))?;
        Ok(Transport::Tls(TlsStream::Server(stream)))
    }

    /// Attach a client-side TLS stream.
    pub(crate) fn tls_client(
        stream: rustls::StreamOwned<rustls::ClientConnection, TcpStream>,
    ) -> Result<Self, SessionError> {
        stream
            .sock
            .set_read_timeout(Some(READ_RETRY_SLEEP.max(Duration::from_millis(10))))?;
        Ok(Transport::Tls(TlsStream::Client(stream)))
    }

    pub(crate) fn kind(&self) -> TransportKind {
        match self {
            Transport::Fd { .. } => TransportKind::Fd,
            Transport::Ssh { .. } => TransportKind::Ssh,
            Transport::Tls(_) => TransportKind::Tls,
        }
    }

    /// The fd the server poll set watches for readability.
    pub(crate) fn poll_fd(&self) -> RawFd {
        match self {
            Transport::Fd { input, .. } => *input,
            Transport::Ssh { conn, .. } => conn.socket_fd,
            Transport::Tls(tls) => tls.sock().as_raw_fd(),
        }
    }

    /// Non-blocking read of whatever bytes are available.
    pub(crate) fn read(&mut self, buf: &mut [u8]) -> Result<ReadOutcome, SessionError> {
        match self {
            Transport::Fd { input, .. } => match nix::unistd::read(*input, buf) {
                Ok(0) => Ok(ReadOutcome::Eof),
                Ok(n) => Ok(ReadOutcome::Data(n)),
                Err(Errno::EAGAIN) => Ok(ReadOutcome::WouldBlock),
                Err(Errno::EINTR) => Ok(ReadOutcome::WouldBlock),
                Err(e) => Err(SessionError::Transport(e.to_string())),
            },
            Transport::Ssh {
                channel,
                conn,
                pushback,
            } => {
                let mut off = 0;
                if let Some(b) = pushback.take() {
                    if buf.is_empty() {
                        *pushback = Some(b);
                        return Ok(ReadOutcome::WouldBlock);
                    }
                    buf[0] = b;
                    off = 1;
                }
                conn.set_blocking(false);
                let res = std::io::Read::read(channel, &mut buf[off..]);
                conn.set_blocking(true);
                match res {
                    Ok(0) if off == 0 => Ok(ReadOutcome::Eof),
                    Ok(n) => Ok(ReadOutcome::Data(off + n)),
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                        if off > 0 {
                            Ok(ReadOutcome::Data(off))
                        } else {
                            Ok(ReadOutcome::WouldBlock)
                        }
                    }
                    Err(e) => Err(SessionError::Transport(format!("ssh: {e}"))),
                }
            }
            Transport::Tls(tls) => match tls.read(buf) {
                Ok(0) => Ok(ReadOutcome::Eof),
                Ok(n) => Ok(ReadOutcome::Data(n)),
                Err(e)
                    if matches!(
                        e.kind(),
                        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                    ) =>
                {
                    Ok(ReadOutcome::WouldBlock)
                }
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(ReadOutcome::Eof),
                Err(e) => Err(SessionError::Transport(format!("tls: {e}"))),
            },
        }
    }

    /// Blocking write of the whole buffer.
    ///
    /// A would-block on a non-blocking descriptor is waited out with a short
    /// sleep; any real error is final, partial output included.
    pub(crate) fn write_all(&mut self, buf: &[u8]) -> Result<(), SessionError> {
        match self {
            Transport::Fd { output, .. } => {
                let mut off = 0;
                while off < buf.len() {
                    match nix::unistd::write(*output, &buf[off..]) {
                        Ok(n) => off += n,
                        Err(Errno::EAGAIN) => std::thread::sleep(READ_RETRY_SLEEP),
                        Err(Errno::EINTR) => {}
                        Err(e) => return Err(SessionError::Transport(e.to_string())),
                    }
                }
                Ok(())
            }
            Transport::Ssh { channel, conn, .. } => {
                conn.set_blocking(true);
                std::io::Write::write_all(channel, buf)
                    .and_then(|()| std::io::Write::flush(channel))
                    .map_err(|e| SessionError::Transport(format!("ssh: {e}")))
            }
            Transport::Tls(tls) => tls
                .write_all(buf)
                .map_err(|e| SessionError::Transport(format!("tls: {e}"))),
        }
    }

    /// Wait until the transport has bytes to read, the peer disconnects,
    /// or the timeout expires. `None` waits indefinitely.
    pub(crate) fn poll_readable(
        &mut self,
        timeout: Option<Duration>,
    ) -> Result<PollOutcome, SessionError> {
        let deadline = timeout.map(|t| Instant::now() + t);
        match self {
            Transport::Fd { input, .. } => poll_fd(*input, deadline),
            Transport::Tls(tls) => {
                if tls.buffered_plaintext()? > 0 {
                    return Ok(PollOutcome::Ready);
                }
                poll_fd(tls.sock().as_raw_fd(), deadline)
            }
            Transport::Ssh {
                channel,
                conn,
                pushback,
            } => {
                // The socket becoming readable does not mean this channel
                // has data (the bytes may belong to a sibling channel or the
                // transport layer), and channel data may already sit in the
                // library's buffers while the socket is idle. Probe the
                // channel with a one-byte read between socket polls.
                loop {
                    if pushback.is_some() {
                        return Ok(PollOutcome::Ready);
                    }
                    let mut probe = [0u8; 1];
                    conn.set_blocking(false);
                    let res = std::io::Read::read(channel, &mut probe);
                    conn.set_blocking(true);
                    match res {
                        Ok(0) => return Ok(PollOutcome::Disconnect),
                        Ok(_) => {
                            *pushback = Some(probe[0]);
                            return Ok(PollOutcome::Ready);
                        }
                        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                            match poll_fd(conn.socket_fd, deadline)? {
                                PollOutcome::Ready => {
                                    trace!("ssh socket readable, re-probing channel");
                                    continue;
                                }
                                other => return Ok(other),
                            }
                        }
                        Err(e) => return Err(SessionError::Transport(format!("ssh: {e}"))),
                    }
                }
            }
        }
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        if let Transport::Fd {
            input,
            output,
            owned: true,
        } = self
        {
            let _ = nix::unistd::close(*input);
            if output != input {
                let _ = nix::unistd::close(*output);
            }
        }
    }
}

/// poll(2) an arbitrary fd (e.g. a listening socket) for readability;
/// `true` means readable, `false` means the deadline passed.
pub(crate) fn poll_raw_fd(fd: RawFd, deadline: Option<Instant>) -> Result<bool, SessionError> {
    Ok(matches!(poll_fd(fd, deadline)?, PollOutcome::Ready))
}

/// poll(2) one fd for readability until the deadline.
fn poll_fd(fd: RawFd, deadline: Option<Instant>) -> Result<PollOutcome, SessionError> {
    loop {
        let timeout_ms: i32 = match deadline {
            None => -1,
            Some(d) => {
                let left = d.saturating_duration_since(Instant::now());
                left.as_millis().min(i32::MAX as u128) as i32
            }
        };

        let mut fds = [PollFd::new(fd, PollFlags::POLLIN)];
        match poll(&mut fds, timeout_ms) {
            Ok(0) => return Ok(PollOutcome::TimedOut),
            Ok(_) => {
                let revents = fds[0].revents().unwrap_or(PollFlags::empty());
                if revents.contains(PollFlags::POLLIN) {
                    // Remaining bytes are drained even when HUP is also set.
                    return Ok(PollOutcome::Ready);
                }
                if revents.intersects(PollFlags::POLLHUP | PollFlags::POLLERR) {
                    return Ok(PollOutcome::Disconnect);
                }
                return Ok(PollOutcome::TimedOut);
            }
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(SessionError::Transport(e.to_string())),
        }
    }
}

fn set_nonblocking(fd: RawFd) -> Result<(), SessionError> {
    let flags = fcntl(fd, FcntlArg::F_GETFL).map_err(|e| SessionError::Transport(e.to_string()))?;
    let flags = OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK;
    fcntl(fd, FcntlArg::F_SETFL(flags)).map_err(|e| SessionError::Transport(e.to_string()))?;
    Ok(())
}

pub(crate) fn ssh_err(e: ssh2::Error) -> SessionError {
    SessionError::Transport(format!("ssh: {e}"))
}
