//! Server-side SSH transport seam.
//!
//! The SSH protocol itself is out of scope; the acceptor consumes it
//! through the narrow [`SshServerHandshake`] adapter. An adapter performs
//! key exchange and user authentication over the freshly accepted TCP
//! connection, honoring the configured method set, attempt limit, and
//! authentication timeout, and hands the `netconf` subsystem channel back
//! as an fd pair together with the authenticated username.
//!
//! Deployments running under an external sshd (`Subsystem netconf
//! /path/to/server`) skip the adapter entirely and hand the inherited
//! stdio descriptors to [`Server::accept_inout`].
//!
//! [`Server::accept_inout`]: crate::Server::accept_inout

use std::net::TcpStream;
use std::os::unix::io::RawFd;

use netconf_session::SessionError;

use crate::config::SshServerOptions;

/// An authenticated SSH channel, ready to carry NETCONF.
#[derive(Debug)]
pub struct SshAccepted {
    /// Read side of the `netconf` subsystem channel.
    pub fd_in: RawFd,
    /// Write side of the `netconf` subsystem channel.
    pub fd_out: RawFd,
    /// The authenticated username.
    pub username: String,
}

/// Adapter interface to an SSH server implementation.
pub trait SshServerHandshake: Send + Sync {
    /// Run key exchange and user authentication on an accepted connection.
    ///
    /// Implementations must offer only the methods in
    /// `opts.auth_methods`, present `opts.banner` when set, resolve
    /// publickey logins through `opts.authorized_username`, and close the
    /// connection after `opts.auth_attempts` failures or once
    /// `opts.auth_timeout` has elapsed, in both cases returning
    /// [`SessionError::AuthFailed`], in which case no session is produced.
    fn handshake(
        &self,
        socket: TcpStream,
        opts: &SshServerOptions,
    ) -> Result<SshAccepted, SessionError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AuthorizedKey;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_authorized_key_lookup() {
        let mut keyfile = NamedTempFile::new().unwrap();
        writeln!(keyfile, "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIFakeKeyMaterial operator@host")
            .unwrap();

        let mut opts = SshServerOptions::default();
        opts.authorized_keys.push(AuthorizedKey {
            pubkey_path: keyfile.path().to_path_buf(),
            username: "operator".to_string(),
        });

        assert_eq!(
            opts.authorized_username("AAAAC3NzaC1lZDI1NTE5AAAAIFakeKeyMaterial"),
            Some("operator".to_string())
        );
        assert_eq!(opts.authorized_username("AAAAB3OtherKey"), None);
    }
}
