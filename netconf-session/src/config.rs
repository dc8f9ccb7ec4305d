//! Client-side options.
//!
//! Option values live in explicit structs handed to the connect functions;
//! a process-wide default instance is available for embedders that prefer
//! the set-once style.

use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use once_cell::sync::Lazy;

/// SSH user authentication methods, in the order they are attempted by
/// default.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SshAuthMethod {
    /// Public key authentication.
    Publickey,
    /// Keyboard-interactive authentication.
    Interactive,
    /// Password authentication.
    Password,
}

/// One client key pair for publickey authentication.
#[derive(Debug, Clone, Default)]
pub struct SshKeyPair {
    /// Public key file; derived from the private key when absent.
    pub public: Option<PathBuf>,
    /// Private key file.
    pub private: PathBuf,
    /// Passphrase for an encrypted private key.
    pub passphrase: Option<String>,
}

/// Callback answering keyboard-interactive prompts.
pub type InteractiveCallback = Arc<dyn Fn(&str) -> String + Send + Sync>;

/// Client SSH options.
#[derive(Clone)]
pub struct SshClientOptions {
    /// Username to authenticate as; falls back to `$USER`.
    pub username: Option<String>,
    /// Key pairs tried for publickey authentication, in order.
    pub keypairs: Vec<SshKeyPair>,
    /// Password for password authentication.
    pub password: Option<String>,
    /// Prompt callback for keyboard-interactive authentication.
    pub interactive: Option<InteractiveCallback>,
    /// Per-method preference: larger is tried earlier, negative disables.
    pub auth_preference: [(SshAuthMethod, i16); 3],
}

impl std::fmt::Debug for SshClientOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshClientOptions")
            .field("username", &self.username)
            .field("keypairs", &self.keypairs)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("interactive", &self.interactive.is_some())
            .field("auth_preference", &self.auth_preference)
            .finish()
    }
}

impl Default for SshClientOptions {
    fn default() -> Self {
        Self {
            username: None,
            keypairs: Vec::new(),
            password: None,
            interactive: None,
            auth_preference: [
                (SshAuthMethod::Publickey, 3),
                (SshAuthMethod::Interactive, 2),
                (SshAuthMethod::Password, 1),
            ],
        }
    }
}

impl SshClientOptions {
    /// Set the preference of one authentication method; negative disables.
    pub fn set_auth_preference(&mut self, method: SshAuthMethod, pref: i16) {
        for entry in &mut self.auth_preference {
            if entry.0 == method {
                entry.1 = pref;
            }
        }
    }

    /// Authentication methods in preference order, disabled ones removed.
    pub fn ordered_auth_methods(&self) -> Vec<SshAuthMethod> {
        let mut prefs: Vec<_> = self
            .auth_preference
            .iter()
            .filter(|(_, p)| *p >= 0)
            .copied()
            .collect();
        prefs.sort_by_key(|(_, p)| std::cmp::Reverse(*p));
        prefs.into_iter().map(|(m, _)| m).collect()
    }
}

/// Client TLS options.
#[derive(Debug, Clone, Default)]
pub struct TlsClientOptions {
    /// Client certificate (PEM file).
    pub cert_path: PathBuf,
    /// Client private key (PEM file).
    pub key_path: PathBuf,
    /// Trusted CA bundle file.
    pub ca_file: Option<PathBuf>,
    /// Directory of trusted CA PEM files.
    pub ca_dir: Option<PathBuf>,
    /// Certificate revocation list file.
    pub crl_file: Option<PathBuf>,
    /// Directory of revocation list files.
    pub crl_dir: Option<PathBuf>,
}

/// Process-wide default client options, a convenience layer over the
/// explicit structs.
#[derive(Debug, Clone, Default)]
pub struct ClientOptions {
    /// Default SSH options.
    pub ssh: SshClientOptions,
    /// Default TLS options.
    pub tls: TlsClientOptions,
}

static CLIENT_OPTIONS: Lazy<RwLock<ClientOptions>> =
    Lazy::new(|| RwLock::new(ClientOptions::default()));

/// Snapshot of the process-wide default client options.
pub fn client_options() -> ClientOptions {
    CLIENT_OPTIONS
        .read()
        .unwrap_or_else(|e| e.into_inner())
        .clone()
}

/// Replace the process-wide default client options.
pub fn set_client_options(opts: ClientOptions) {
    *CLIENT_OPTIONS.write().unwrap_or_else(|e| e.into_inner()) = opts;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_preference_ordering() {
        let mut opts = SshClientOptions::default();
        assert_eq!(
            opts.ordered_auth_methods(),
            vec![
                SshAuthMethod::Publickey,
                SshAuthMethod::Interactive,
                SshAuthMethod::Password
            ]
        );

        opts.set_auth_preference(SshAuthMethod::Password, 10);
        opts.set_auth_preference(SshAuthMethod::Interactive, -1);
        assert_eq!(
            opts.ordered_auth_methods(),
            vec![SshAuthMethod::Password, SshAuthMethod::Publickey]
        );
    }

    #[test]
    fn test_global_options_roundtrip() {
        let mut opts = ClientOptions::default();
        opts.ssh.username = Some("operator".to_string());
        set_client_options(opts);
        assert_eq!(
            client_options().ssh.username.as_deref(),
            Some("operator")
        );
        set_client_options(ClientOptions::default());
    }
}
