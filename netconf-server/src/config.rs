//! Server state and options.
//!
//! A [`Server`] owns the process-wide serving state: listening endpoints,
//! the session-id counter, timeouts, and the per-transport-kind option
//! families. Each option family sits behind its own mutex so endpoint CRUD
//! and handshakes on different transports never contend; there is no
//! global lock.

use std::net::TcpListener;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use netconf_session::{Context, SessionError, TransportKind, WithDefaults};
use netconf_wire::{Capabilities, CAP_BASE_10, CAP_BASE_11};
use serde::Deserialize;
use tracing::{info, warn};

pub(crate) fn plock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// SSH user authentication methods a server endpoint may offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SshAuthKind {
    /// Public key authentication.
    Publickey,
    /// Password authentication.
    Password,
    /// Keyboard-interactive authentication.
    Interactive,
}

/// One authorized public key and the username it maps to.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthorizedKey {
    /// Public key file (OpenSSH format).
    pub pubkey_path: PathBuf,
    /// Username granted to this key.
    pub username: String,
}

/// Server SSH option family.
#[derive(Debug, Clone)]
pub struct SshServerOptions {
    /// Host key files offered during key exchange.
    pub hostkeys: Vec<PathBuf>,
    /// Pre-authentication banner.
    pub banner: Option<String>,
    /// Permitted authentication methods.
    pub auth_methods: Vec<SshAuthKind>,
    /// Failed attempts before the connection is dropped.
    pub auth_attempts: u16,
    /// Budget for the whole authentication phase.
    pub auth_timeout: Duration,
    /// Authorized key list for publickey authentication.
    pub authorized_keys: Vec<AuthorizedKey>,
}

impl Default for SshServerOptions {
    fn default() -> Self {
        Self {
            hostkeys: Vec::new(),
            banner: None,
            auth_methods: vec![
                SshAuthKind::Publickey,
                SshAuthKind::Password,
                SshAuthKind::Interactive,
            ],
            auth_attempts: 3,
            auth_timeout: Duration::from_secs(10),
            authorized_keys: Vec::new(),
        }
    }
}

impl SshServerOptions {
    /// Username an offered public key maps to, by comparing the base64 key
    /// material against the authorized key list.
    pub fn authorized_username(&self, pubkey_b64: &str) -> Option<String> {
        for entry in &self.authorized_keys {
            let Ok(content) = std::fs::read_to_string(&entry.pubkey_path) else {
                warn!("unreadable authorized key {:?}", entry.pubkey_path);
                continue;
            };
            // OpenSSH format: "<type> <base64> [comment]"
            if content
                .split_whitespace()
                .nth(1)
                .is_some_and(|b64| b64 == pubkey_b64)
            {
                return Some(entry.username.clone());
            }
        }
        None
    }
}

/// PEM material, inline or by file path. A string containing a PEM
/// armor line is taken as inline material, anything else as a path.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(from = "String")]
pub enum PemSource {
    /// A file path.
    File(PathBuf),
    /// Inline PEM text.
    Inline(String),
}

impl From<String> for PemSource {
    fn from(value: String) -> Self {
        if value.contains("-----BEGIN") {
            PemSource::Inline(value)
        } else {
            PemSource::File(PathBuf::from(value))
        }
    }
}

impl PemSource {
    /// The PEM text, reading the file if needed.
    pub fn read(&self) -> Result<String, SessionError> {
        match self {
            PemSource::Inline(pem) => Ok(pem.clone()),
            PemSource::File(path) => std::fs::read_to_string(path)
                .map_err(|e| SessionError::Transport(format!("{}: {e}", path.display()))),
        }
    }
}

/// How a cert-to-name entry maps a matched certificate to a username.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CtnMapType {
    /// Use the name stored in the entry itself.
    Specified,
    /// Use the rfc822Name (email) SAN.
    SanRfc822,
    /// Use the dNSName SAN.
    SanDns,
    /// Use the iPAddress SAN.
    SanIp,
    /// Use any SAN, in rfc822/dns/ip order.
    SanAny,
    /// Use the subject common name.
    CommonName,
}

/// One ordered cert-to-name entry. The fingerprint is prefixed with the
/// digest algorithm id (`01`=MD5, `02`=SHA-1, `03`=SHA-224, `04`=SHA-256,
/// `05`=SHA-384, `06`=SHA-512), colon-separated hex.
#[derive(Debug, Clone, Deserialize)]
pub struct CtnEntry {
    /// Ordering id; lower ids are evaluated first.
    pub id: u32,
    /// Algorithm-prefixed certificate fingerprint.
    pub fingerprint: String,
    /// How the username is derived on a match.
    pub map_type: CtnMapType,
    /// Username for [`CtnMapType::Specified`].
    pub name: Option<String>,
}

/// Server TLS option family.
#[derive(Debug, Clone, Default)]
pub struct TlsServerOptions {
    /// Server certificate chain.
    pub cert: Option<PemSource>,
    /// Server private key.
    pub key: Option<PemSource>,
    /// Whether the key is an encrypted PKCS#8 blob.
    pub key_encrypted: bool,
    /// Passphrase for an encrypted key.
    pub key_passphrase: Option<String>,
    /// Individually trusted client certificates.
    pub trusted_certs: Vec<PemSource>,
    /// Trusted CA bundle file.
    pub ca_file: Option<PathBuf>,
    /// Directory of trusted CA PEM files.
    pub ca_dir: Option<PathBuf>,
    /// Certificate revocation list file.
    pub crl_file: Option<PathBuf>,
    /// Directory of revocation list files.
    pub crl_dir: Option<PathBuf>,
    /// Ordered cert-to-name list; non-empty makes client certs mandatory.
    pub ctn: Vec<CtnEntry>,
}

impl TlsServerOptions {
    /// Insert a cert-to-name entry, kept ordered by id.
    pub fn add_ctn(&mut self, entry: CtnEntry) {
        let pos = self
            .ctn
            .iter()
            .position(|e| e.id > entry.id)
            .unwrap_or(self.ctn.len());
        self.ctn.insert(pos, entry);
    }

    /// Remove the cert-to-name entry with the given id.
    pub fn del_ctn(&mut self, id: u32) -> bool {
        let before = self.ctn.len();
        self.ctn.retain(|e| e.id != id);
        self.ctn.len() != before
    }
}

/// One listening endpoint, keyed by (name, transport kind).
#[derive(Debug)]
pub(crate) struct Endpoint {
    pub name: String,
    pub kind: TransportKind,
    pub address: String,
    pub port: u16,
    pub listener: TcpListener,
}

/// The NETCONF server: endpoints, options, and the session-id counter.
pub struct Server {
    ctx: Arc<Context>,
    hello_timeout: Mutex<Duration>,
    idle_timeout: Mutex<Option<Duration>>,
    with_defaults: Mutex<WithDefaults>,
    extra_capabilities: Mutex<Vec<String>>,
    /// Session ids are unique per process; an atomic stands in for the
    /// original's spin lock around the counter.
    next_session_id: AtomicU32,
    pub(crate) binds: Mutex<Vec<Endpoint>>,
    ssh_opts: Mutex<SshServerOptions>,
    tls_opts: Mutex<TlsServerOptions>,
    pub(crate) ssh_adapter: Mutex<Option<Arc<dyn crate::ssh::SshServerHandshake>>>,
}

impl Server {
    /// Create a server with default timeouts and empty option families.
    pub fn new(ctx: Arc<Context>) -> Self {
        Self {
            ctx,
            hello_timeout: Mutex::new(netconf_session::DEFAULT_HELLO_TIMEOUT),
            idle_timeout: Mutex::new(Some(Duration::from_secs(180))),
            with_defaults: Mutex::new(WithDefaults::Explicit),
            extra_capabilities: Mutex::new(Vec::new()),
            next_session_id: AtomicU32::new(1),
            binds: Mutex::new(Vec::new()),
            ssh_opts: Mutex::new(SshServerOptions::default()),
            tls_opts: Mutex::new(TlsServerOptions::default()),
            ssh_adapter: Mutex::new(None),
        }
    }

    /// The schema/XML context sessions parse against.
    pub fn context(&self) -> &Arc<Context> {
        &self.ctx
    }

    /// Budget for the hello exchange on freshly accepted sessions.
    pub fn hello_timeout(&self) -> Duration {
        *plock(&self.hello_timeout)
    }

    /// Set the hello exchange budget.
    pub fn set_hello_timeout(&self, timeout: Duration) {
        *plock(&self.hello_timeout) = timeout;
    }

    /// Idle deadline applied to accepted sessions; `None` disables it.
    pub fn idle_timeout(&self) -> Option<Duration> {
        *plock(&self.idle_timeout)
    }

    /// Set (or disable) the idle deadline for future sessions.
    pub fn set_idle_timeout(&self, timeout: Option<Duration>) {
        *plock(&self.idle_timeout) = timeout;
    }

    /// The advertised default with-defaults mode.
    pub fn with_defaults_mode(&self) -> WithDefaults {
        *plock(&self.with_defaults)
    }

    /// Set the advertised default with-defaults mode.
    pub fn set_with_defaults_mode(&self, mode: WithDefaults) {
        *plock(&self.with_defaults) = mode;
    }

    /// Advertise an additional capability URI in the server hello.
    pub fn add_capability(&self, uri: impl Into<String>) {
        plock(&self.extra_capabilities).push(uri.into());
    }

    /// The full capability set sent in the server hello.
    pub fn capabilities(&self) -> Capabilities {
        let mut caps = vec![CAP_BASE_10.to_string(), CAP_BASE_11.to_string()];
        caps.push(format!(
            "urn:ietf:params:netconf:capability:with-defaults:1.0?basic-mode={}",
            self.with_defaults_mode().as_str()
        ));
        caps.extend(plock(&self.extra_capabilities).iter().cloned());
        Capabilities::new(caps)
    }

    /// Allocate the next session id.
    pub(crate) fn next_session_id(&self) -> u32 {
        self.next_session_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Bind a named listening endpoint. Only SSH and TLS endpoints can
    /// listen; fd transports arrive through [`Server::accept_inout`].
    pub fn add_endpoint(
        &self,
        name: &str,
        kind: TransportKind,
        address: &str,
        port: u16,
    ) -> Result<(), SessionError> {
        if kind == TransportKind::Fd {
            return Err(SessionError::InvalidArg("fd endpoints cannot listen"));
        }
        let mut binds = plock(&self.binds);
        if binds.iter().any(|b| b.name == name && b.kind == kind) {
            return Err(SessionError::InvalidArg("endpoint already exists"));
        }
        let listener = TcpListener::bind((address, port))
            .map_err(|e| SessionError::Transport(format!("bind {address}:{port}: {e}")))?;
        listener.set_nonblocking(true)?;
        info!("endpoint {name} ({kind:?}) listening on {address}:{port}");
        binds.push(Endpoint {
            name: name.to_string(),
            kind,
            address: address.to_string(),
            port,
            listener,
        });
        Ok(())
    }

    /// Rebind an endpoint on a new port.
    pub fn set_endpoint_port(
        &self,
        name: &str,
        kind: TransportKind,
        port: u16,
    ) -> Result<(), SessionError> {
        let mut binds = plock(&self.binds);
        let endpoint = binds
            .iter_mut()
            .find(|b| b.name == name && b.kind == kind)
            .ok_or(SessionError::InvalidArg("no such endpoint"))?;
        let listener = TcpListener::bind((endpoint.address.as_str(), port))
            .map_err(|e| SessionError::Transport(format!("bind {}:{port}: {e}", endpoint.address)))?;
        listener.set_nonblocking(true)?;
        endpoint.port = port;
        endpoint.listener = listener;
        Ok(())
    }

    /// Delete an endpoint; returns whether it existed.
    pub fn del_endpoint(&self, name: &str, kind: TransportKind) -> bool {
        let mut binds = plock(&self.binds);
        let before = binds.len();
        binds.retain(|b| !(b.name == name && b.kind == kind));
        binds.len() != before
    }

    /// Drop all endpoints.
    pub fn clear_endpoints(&self) {
        plock(&self.binds).clear();
    }

    /// Number of listening endpoints.
    pub fn endpoint_count(&self) -> usize {
        plock(&self.binds).len()
    }

    /// Snapshot of the SSH option family.
    pub fn ssh_options(&self) -> SshServerOptions {
        plock(&self.ssh_opts).clone()
    }

    /// Mutate the SSH option family under its lock.
    pub fn with_ssh_options<R>(&self, f: impl FnOnce(&mut SshServerOptions) -> R) -> R {
        f(&mut plock(&self.ssh_opts))
    }

    /// Snapshot of the TLS option family.
    pub fn tls_options(&self) -> TlsServerOptions {
        plock(&self.tls_opts).clone()
    }

    /// Mutate the TLS option family under its lock.
    pub fn with_tls_options<R>(&self, f: impl FnOnce(&mut TlsServerOptions) -> R) -> R {
        f(&mut plock(&self.tls_opts))
    }

    /// Install the SSH server-side transport adapter.
    pub fn set_ssh_adapter(&self, adapter: Arc<dyn crate::ssh::SshServerHandshake>) {
        *plock(&self.ssh_adapter) = Some(adapter);
    }
}

/// Embedder-facing configuration file (YAML): file values first,
/// environment overrides second.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServerFileConfig {
    /// Log verbosity: error, warning, verbose, debug.
    pub verbosity: Option<String>,
    /// Hello timeout in seconds.
    pub hello_timeout: Option<u64>,
    /// Idle timeout in seconds; 0 disables.
    pub idle_timeout: Option<u64>,
    /// Schema search path.
    pub schema_searchpath: Option<PathBuf>,
    /// Listening endpoints.
    #[serde(default)]
    pub endpoints: Vec<EndpointConfig>,
}

/// One endpoint in the config file.
#[derive(Debug, Clone, Deserialize)]
pub struct EndpointConfig {
    /// Endpoint name.
    pub name: String,
    /// `ssh` or `tls`.
    pub transport: String,
    /// Listen address.
    pub address: String,
    /// Listen port.
    pub port: u16,
}

impl ServerFileConfig {
    /// Load the file (missing file yields defaults) and apply environment
    /// overrides (`NETCONF_HELLO_TIMEOUT`, `NETCONF_IDLE_TIMEOUT`,
    /// `NETCONF_VERBOSITY`, `NETCONF_SCHEMA_SEARCHPATH`).
    pub fn load(path: impl AsRef<std::path::Path>) -> anyhow::Result<Self> {
        let mut config = match std::fs::read_to_string(&path) {
            Ok(content) => serde_yaml::from_str(&content)?,
            Err(_) => {
                warn!("config file {:?} not found, using defaults", path.as_ref());
                Self::default()
            }
        };
        config.apply_environment_overrides();
        Ok(config)
    }

    fn apply_environment_overrides(&mut self) {
        if let Ok(v) = std::env::var("NETCONF_VERBOSITY") {
            self.verbosity = Some(v);
        }
        if let Ok(v) = std::env::var("NETCONF_HELLO_TIMEOUT") {
            if let Ok(secs) = v.parse() {
                self.hello_timeout = Some(secs);
            }
        }
        if let Ok(v) = std::env::var("NETCONF_IDLE_TIMEOUT") {
            if let Ok(secs) = v.parse() {
                self.idle_timeout = Some(secs);
            }
        }
        if let Ok(v) = std::env::var("NETCONF_SCHEMA_SEARCHPATH") {
            self.schema_searchpath = Some(PathBuf::from(v));
        }
    }

    /// Build a server from this configuration.
    pub fn build(&self, ctx: Arc<Context>) -> Result<Server, SessionError> {
        if let Some(v) = self
            .verbosity
            .as_deref()
            .and_then(|v| v.parse::<netconf_session::Verbosity>().ok())
        {
            netconf_session::init_logging(v);
        }
        if let Some(path) = &self.schema_searchpath {
            ctx.set_searchpath(path);
        }

        let server = Server::new(ctx);
        if let Some(secs) = self.hello_timeout {
            server.set_hello_timeout(Duration::from_secs(secs));
        }
        if let Some(secs) = self.idle_timeout {
            server.set_idle_timeout((secs > 0).then(|| Duration::from_secs(secs)));
        }
        for ep in &self.endpoints {
            let kind = match ep.transport.as_str() {
                "ssh" => TransportKind::Ssh,
                "tls" => TransportKind::Tls,
                _ => return Err(SessionError::InvalidArg("unknown endpoint transport")),
            };
            server.add_endpoint(&ep.name, kind, &ep.address, ep.port)?;
        }
        Ok(server)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_session_ids_are_unique_and_increasing() {
        let server = Server::new(Arc::new(Context::new()));
        let a = server.next_session_id();
        let b = server.next_session_id();
        let c = server.next_session_id();
        assert!(a < b && b < c);
    }

    #[test]
    fn test_endpoint_crud() {
        let server = Server::new(Arc::new(Context::new()));
        server
            .add_endpoint("main", TransportKind::Tls, "127.0.0.1", 0)
            .unwrap();
        assert_eq!(server.endpoint_count(), 1);

        // Same (name, kind) is rejected; same name on another kind is fine.
        assert!(server
            .add_endpoint("main", TransportKind::Tls, "127.0.0.1", 0)
            .is_err());
        server
            .add_endpoint("main", TransportKind::Ssh, "127.0.0.1", 0)
            .unwrap();
        assert_eq!(server.endpoint_count(), 2);

        assert!(server.del_endpoint("main", TransportKind::Tls));
        assert!(!server.del_endpoint("main", TransportKind::Tls));
        server.clear_endpoints();
        assert_eq!(server.endpoint_count(), 0);
    }

    #[test]
    fn test_fd_endpoints_cannot_listen() {
        let server = Server::new(Arc::new(Context::new()));
        assert!(matches!(
            server.add_endpoint("x", TransportKind::Fd, "127.0.0.1", 0),
            Err(SessionError::InvalidArg(_))
        ));
    }

    #[test]
    fn test_capabilities_include_bases_and_with_defaults() {
        let server = Server::new(Arc::new(Context::new()));
        server.add_capability("urn:ietf:params:netconf:capability:candidate:1.0");
        let caps = server.capabilities();
        assert!(caps.contains(CAP_BASE_10));
        assert!(caps.contains(CAP_BASE_11));
        assert!(caps
            .iter()
            .any(|c| c.contains("with-defaults:1.0?basic-mode=explicit")));
        assert!(caps.contains("urn:ietf:params:netconf:capability:candidate:1.0"));
    }

    #[test]
    fn test_pem_source_classifies_inline_vs_path() {
        let inline: PemSource = serde_yaml::from_str(
            "\"-----BEGIN CERTIFICATE-----\\nabc\\n-----END CERTIFICATE-----\\n\"",
        )
        .unwrap();
        assert!(matches!(inline, PemSource::Inline(_)));
        // Inline material reads back without touching the filesystem.
        assert!(inline.read().unwrap().contains("BEGIN CERTIFICATE"));

        let file: PemSource = serde_yaml::from_str("\"/etc/netconf/server.pem\"").unwrap();
        assert_eq!(file, PemSource::File(PathBuf::from("/etc/netconf/server.pem")));
        assert!(file.read().is_err());
    }

    #[test]
    fn test_ctn_ordering() {
        let mut opts = TlsServerOptions::default();
        opts.add_ctn(CtnEntry {
            id: 10,
            fingerprint: "04:aa".to_string(),
            map_type: CtnMapType::CommonName,
            name: None,
        });
        opts.add_ctn(CtnEntry {
            id: 5,
            fingerprint: "04:bb".to_string(),
            map_type: CtnMapType::Specified,
            name: Some("admin".to_string()),
        });
        assert_eq!(opts.ctn[0].id, 5);
        assert_eq!(opts.ctn[1].id, 10);
        assert!(opts.del_ctn(5));
        assert!(!opts.del_ctn(5));
    }

    #[test]
    fn test_file_config_load() {
        let yaml = r#"
verbosity: warning
hello_timeout: 30
idle_timeout: 0
endpoints:
  - name: main
    transport: tls
    address: 127.0.0.1
    port: 0
"#;
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(yaml.as_bytes()).unwrap();

        let config = ServerFileConfig::load(file.path()).unwrap();
        assert_eq!(config.hello_timeout, Some(30));

        let server = config.build(Arc::new(Context::new())).unwrap();
        assert_eq!(server.hello_timeout(), Duration::from_secs(30));
        assert_eq!(server.idle_timeout(), None);
        assert_eq!(server.endpoint_count(), 1);
    }
}
