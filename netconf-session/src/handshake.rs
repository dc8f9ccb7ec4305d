//! The NETCONF hello handshake.
//!
//! Immediately after transport attach both peers send `<hello>` listing
//! their capabilities; the highest base version supported by both is
//! selected and fixes the wire framing for the rest of the session. The
//! server's hello additionally carries the session id it assigned.

use std::time::Duration;

use netconf_wire::{build_hello, parse_hello, resolve_version, Capabilities, MsgType};
use tracing::{debug, warn};

use crate::error::SessionError;
use crate::session::{Role, Session, TermReason};

/// Hello must complete within this long unless configured otherwise.
pub const DEFAULT_HELLO_TIMEOUT: Duration = Duration::from_secs(60);

/// Run the client half of the handshake: send our hello, read the
/// server's, resolve the version, store the assigned session id.
pub fn handshake_client(
    session: &Session,
    local_caps: &Capabilities,
    timeout: Option<Duration>,
) -> Result<(), SessionError> {
    if session.role() != Role::Client {
        return Err(SessionError::InvalidArg("client handshake on a server session"));
    }

    session.write_msg(&build_hello(local_caps.as_slice(), None))?;

    let (mtype, root) = recv_hello(session, timeout)?;
    if mtype != MsgType::Hello {
        session.mark_invalid(TermReason::BadHello);
        return Err(SessionError::Protocol(format!(
            "expected <hello> from the server, got {mtype:?}"
        )));
    }

    let info = parse_hello(&root).map_err(|e| {
        session.mark_invalid(TermReason::BadHello);
        SessionError::Protocol(e.to_string())
    })?;
    let peer_caps = Capabilities::new(info.capabilities);

    let version = match resolve_version(local_caps, &peer_caps) {
        Some(v) => v,
        None => {
            warn!("no NETCONF base capability in common with the server");
            session.mark_invalid(TermReason::BadHello);
            return Err(SessionError::Protocol(
                "no common base capability".to_string(),
            ));
        }
    };
    let id = match info.session_id {
        Some(id) => id,
        None => {
            session.mark_invalid(TermReason::BadHello);
            return Err(SessionError::Protocol(
                "server hello carries no <session-id>".to_string(),
            ));
        }
    };

    debug!("client handshake done: session {id}, version {version}");
    session.complete_handshake(version, peer_caps, id);
    Ok(())
}

/// Run the server half of the handshake: send our hello with the assigned
/// session id, read the client's, resolve the version.
pub fn handshake_server(
    session: &Session,
    session_id: u32,
    local_caps: &Capabilities,
    timeout: Option<Duration>,
) -> Result<(), SessionError> {
    if session.role() != Role::Server {
        return Err(SessionError::InvalidArg("server handshake on a client session"));
    }

    session.write_msg(&build_hello(local_caps.as_slice(), Some(session_id)))?;

    let (mtype, root) = recv_hello(session, timeout)?;
    if mtype != MsgType::Hello {
        session.mark_invalid(TermReason::BadHello);
        return Err(SessionError::Protocol(format!(
            "expected <hello> from the client, got {mtype:?}"
        )));
    }

    if root.child("session-id").is_some() {
        session.mark_invalid(TermReason::BadHello);
        return Err(SessionError::Protocol(
            "client hello carries a <session-id>".to_string(),
        ));
    }

    let info = parse_hello(&root).map_err(|e| {
        session.mark_invalid(TermReason::BadHello);
        SessionError::Protocol(e.to_string())
    })?;
    let peer_caps = Capabilities::new(info.capabilities);

    let version = match resolve_version(local_caps, &peer_caps) {
        Some(v) => v,
        None => {
            warn!("no NETCONF base capability in common with the client");
            session.mark_invalid(TermReason::BadHello);
            return Err(SessionError::Protocol(
                "no common base capability".to_string(),
            ));
        }
    };

    debug!("server handshake done: session {session_id}, version {version}");
    session.complete_handshake(version, peer_caps, session_id);
    Ok(())
}

fn recv_hello(
    session: &Session,
    timeout: Option<Duration>,
) -> Result<(MsgType, netconf_wire::XmlElement), SessionError> {
    match session.read_msg_poll(timeout) {
        Ok(Some(msg)) => Ok(msg),
        Ok(None) => {
            session.mark_invalid(TermReason::Timeout);
            Err(SessionError::Timeout)
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Context;
    use crate::session::SessionStatus;
    use netconf_wire::{Version, CAP_BASE_10, CAP_BASE_11};
    use nix::unistd::pipe;
    use std::sync::Arc;

    fn caps(uris: &[&str]) -> Capabilities {
        Capabilities::new(uris.iter().map(|s| s.to_string()).collect())
    }

    /// Loopback pair: a client and a server session wired together with
    /// pipes.
    fn loopback() -> (Session, Session) {
        let (c_in, s_out) = pipe().unwrap();
        let (s_in, c_out) = pipe().unwrap();
        let ctx = Arc::new(Context::new());
        let client = crate::client::session_from_fds(ctx.clone(), c_in, c_out, true).unwrap();
        let server =
            Session::server_fd(ctx, s_in, s_out, true, Some("admin".to_string()), None).unwrap();
        (client, server)
    }

    #[test]
    fn test_hello_negotiates_highest_common_version() {
        let (client, server) = loopback();
        let server_caps = caps(&[CAP_BASE_11]);

        let t = std::thread::spawn(move || {
            handshake_server(
                &server,
                42,
                &server_caps,
                Some(Duration::from_secs(2)),
            )
            .map(|()| server)
        });

        handshake_client(
            &client,
            &caps(&[CAP_BASE_10, CAP_BASE_11]),
            Some(Duration::from_secs(2)),
        )
        .unwrap();
        let server = t.join().unwrap().unwrap();

        assert_eq!(client.status(), SessionStatus::Running);
        assert_eq!(server.status(), SessionStatus::Running);
        assert_eq!(client.version(), Some(Version::V11));
        assert_eq!(server.version(), Some(Version::V11));
        assert_eq!(client.session_id(), 42);
        assert!(client.capabilities().contains(CAP_BASE_11));
    }

    #[test]
    fn test_hello_mismatch_fails_both_sides() {
        let (client, server) = loopback();
        let server_caps = caps(&[CAP_BASE_11]);

        let t = std::thread::spawn(move || {
            let res = handshake_server(
                &server,
                42,
                &server_caps,
                Some(Duration::from_secs(2)),
            );
            (res, server)
        });

        let client_res = handshake_client(
            &client,
            &caps(&[CAP_BASE_10]),
            Some(Duration::from_secs(2)),
        );
        let (server_res, server) = t.join().unwrap();

        assert!(matches!(client_res, Err(SessionError::Protocol(_))));
        assert!(matches!(server_res, Err(SessionError::Protocol(_))));
        assert_eq!(client.status(), SessionStatus::Invalid);
        assert_eq!(server.status(), SessionStatus::Invalid);
        assert_eq!(client.termination_reason(), Some(TermReason::BadHello));
        assert_eq!(server.termination_reason(), Some(TermReason::BadHello));
    }

    #[test]
    fn test_rpc_before_hello_is_protocol_violation() {
        let (client, server) = loopback();

        // The "client" misbehaves: an rpc instead of a hello.
        let rpc = netconf_wire::build_rpc(1, netconf_wire::XmlElement::new("get"), &[]);
        client.write_msg(&rpc).unwrap();

        let res = handshake_server(
            &server,
            7,
            &Capabilities::client_default(),
            Some(Duration::from_secs(2)),
        );
        assert!(matches!(res, Err(SessionError::Protocol(_))));
        assert_eq!(server.status(), SessionStatus::Invalid);
    }

    #[test]
    fn test_hello_timeout() {
        let (_client, server) = loopback();
        let res = handshake_server(
            &server,
            7,
            &Capabilities::client_default(),
            Some(Duration::from_millis(50)),
        );
        assert!(matches!(res, Err(SessionError::Timeout)));
        assert_eq!(server.termination_reason(), Some(TermReason::Timeout));
    }
}
