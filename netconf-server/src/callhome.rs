//! Call home: the server dials a waiting client.
//!
//! RFC 8071 reverses connection establishment for devices behind NAT or
//! firewalls: the server connects out to a listening management station.
//! Once the TCP connection stands, the transport handshake and the NETCONF
//! hello proceed exactly as in the forward direction.

use std::net::TcpStream;
use std::sync::Arc;

use tracing::info;

use netconf_session::{Session, SessionError, TransportKind, PORT_CALLHOME};

use crate::config::Server;

impl Server {
    /// Dial out to a call-home client and produce a running session.
    /// `port` 0 selects the default call-home port.
    pub fn connect_callhome(
        &self,
        host: &str,
        port: u16,
        kind: TransportKind,
    ) -> Result<Arc<Session>, SessionError> {
        let port = if port == 0 { PORT_CALLHOME } else { port };
        let stream = TcpStream::connect((host, port))
            .map_err(|e| SessionError::Transport(format!("call home {host}:{port}: {e}")))?;
        let peer = stream
            .peer_addr()
            .map_err(|e| SessionError::Transport(e.to_string()))?;
        info!("call home: connected to {peer}, {kind:?} transport");
        self.establish(stream, peer, kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use netconf_session::Context;

    #[test]
    fn test_callhome_to_nobody_fails_with_transport_error() {
        let server = Server::new(Arc::new(Context::new()));
        // Port 1 on localhost is reliably closed.
        match server.connect_callhome("127.0.0.1", 1, TransportKind::Tls) {
            Err(SessionError::Transport(_)) => {}
            other => panic!("expected Transport error, got {other:?}"),
        }
    }

    #[test]
    fn test_callhome_rejects_fd_transport() {
        let server = Server::new(Arc::new(Context::new()));
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        match server.connect_callhome("127.0.0.1", port, TransportKind::Fd) {
            Err(SessionError::InvalidArg(_)) => {}
            other => panic!("expected InvalidArg, got {other:?}"),
        }
    }
}
