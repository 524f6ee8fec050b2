//! Resolving a reachable SSH endpoint for a node.
//!
//! Addresses are probed private-first under the startup deadline. The
//! first address that completes a handshake and authenticates wins, and
//! the host keys it offered are pinned in the cluster's known-hosts file
//! (trust on first use). Keys that contradict a pinned key disqualify the
//! address before any credentials are sent to it.

use std::fmt;
use std::net::{TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use log::{debug, info, warn};
use ssh2::{ErrorCode, Session};
use thiserror::Error;
use tokio::time::{sleep, timeout_at, Instant};

use crate::error::{ClusterError, ClusterResult};
use crate::known_hosts::{host_pattern, HostKey, KnownHosts};
use crate::node::Node;

/// Why a single probe failed
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProbeError {
    /// Nothing answered yet; worth retrying
    #[error("unreachable: {0}")]
    Unreachable(String),

    /// The server answered but cannot be used
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The server offered a key contradicting a pinned one
    #[error("host key mismatch: {0}")]
    HostKeyMismatch(String),
}

/// Keys already pinned for one `host` pattern, from every trusted source
#[derive(Debug, Clone, Default)]
pub struct PinnedKeys {
    host: String,
    sources: Vec<Vec<HostKey>>,
}

impl PinnedKeys {
    /// Collect the keys each of `stores` holds for `host`
    pub fn new(host: impl Into<String>, stores: &[&KnownHosts]) -> Self {
        let host = host.into();
        let sources = stores.iter().map(|store| store.keys(&host)).filter(|keys| !keys.is_empty()).collect();
        PinnedKeys { host, sources }
    }

    /// Host pattern the keys belong to
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Reject `offered` if any source pins a different key of the same type
    pub fn check(&self, offered: &[HostKey]) -> Result<(), ProbeError> {
        for key in offered {
            let contradicted = self
                .sources
                .iter()
                .flatten()
                .any(|pinned| pinned.key_type == key.key_type && pinned.key != key.key);
            if contradicted {
                return Err(ProbeError::HostKeyMismatch(format!(
                    "{} key of {} does not match the pinned one",
                    key.key_type, self.host
                )));
            }
        }
        Ok(())
    }
}

/// One connection attempt to an SSH server
#[async_trait]
pub trait HostProbe: Send + Sync {
    /// Connect and return the host keys the server offered
    ///
    /// The offered keys must pass `pinned.check` before any credentials
    /// are sent.
    async fn probe(&self, address: &str, port: u16, pinned: &PinnedKeys) -> Result<Vec<HostKey>, ProbeError>;
}

/// How to authenticate on the nodes
#[derive(Clone)]
pub struct SshCredentials {
    /// Remote user
    pub user: String,
    /// Private key file
    pub private_key: Option<PathBuf>,
    /// Password, tried after the key
    pub password: Option<String>,
}

impl fmt::Debug for SshCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SshCredentials")
            .field("user", &self.user)
            .field("private_key", &self.private_key)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Key type name at the head of an SSH wire-format public key
fn key_type_of(blob: &[u8]) -> Option<String> {
    let len = u32::from_be_bytes(blob.get(..4)?.try_into().ok()?) as usize;
    let name = blob.get(4..4 + len)?;
    std::str::from_utf8(name).ok().map(str::to_string)
}

// libssh2 error codes for failed algorithm negotiation or host key setup
const KEX_FAILURE: i32 = -5;
const KEY_EXCHANGE_FAILURE: i32 = -8;
const HOSTKEY_INIT: i32 = -10;
const HOSTKEY_SIGN: i32 = -11;
const METHOD_NOT_SUPPORTED: i32 = -33;

/// Classify a failed handshake
///
/// A server that cannot agree on algorithms will not change its mind, so
/// the address is dropped. Anything else may be sshd still starting up.
fn handshake_error(err: &ssh2::Error) -> ProbeError {
    match err.code() {
        ErrorCode::Session(KEX_FAILURE | KEY_EXCHANGE_FAILURE | HOSTKEY_INIT | HOSTKEY_SIGN | METHOD_NOT_SUPPORTED) => {
            ProbeError::Protocol(format!("handshake failed: {}", err))
        }
        _ => ProbeError::Unreachable(err.to_string()),
    }
}

/// Probe implemented with libssh2
#[derive(Debug, Clone)]
pub struct Ssh2Probe {
    credentials: SshCredentials,
    connect_timeout: Duration,
}

impl Ssh2Probe {
    /// Create a probe
    pub fn new(credentials: SshCredentials, connect_timeout: Duration) -> Self {
        Ssh2Probe { credentials, connect_timeout }
    }

    fn probe_blocking(
        credentials: &SshCredentials,
        connect_timeout: Duration,
        address: &str,
        port: u16,
        pinned: &PinnedKeys,
    ) -> Result<Vec<HostKey>, ProbeError> {
        let unreachable = |e: &dyn fmt::Display| ProbeError::Unreachable(e.to_string());

        let addr = (address, port)
            .to_socket_addrs()
            .map_err(|e| unreachable(&e))?
            .next()
            .ok_or_else(|| ProbeError::Unreachable(format!("{} does not resolve", address)))?;
        let tcp = TcpStream::connect_timeout(&addr, connect_timeout).map_err(|e| unreachable(&e))?;

        let mut session = Session::new().map_err(|e| ProbeError::Protocol(e.to_string()))?;
        session.set_tcp_stream(tcp);
        session.set_timeout(connect_timeout.as_millis().min(u32::MAX as u128) as u32);
        session.handshake().map_err(|e| handshake_error(&e))?;

        let keys: Vec<HostKey> = session
            .host_key()
            .and_then(|(blob, _)| Some(HostKey::new(key_type_of(blob)?, STANDARD.encode(blob))))
            .into_iter()
            .collect();
        pinned.check(&keys)?;

        let user = credentials.user.as_str();
        if let Some(key) = &credentials.private_key {
            if let Err(e) = session.userauth_pubkey_file(user, None, key, None) {
                debug!("public key authentication as {} on {} failed: {}", user, address, e);
            }
        }
        if !session.authenticated() {
            if let Some(password) = &credentials.password {
                if let Err(e) = session.userauth_password(user, password) {
                    debug!("password authentication as {} on {} failed: {}", user, address, e);
                }
            }
        }
        if !session.authenticated() {
            return Err(ProbeError::Protocol(format!("authentication as {} failed", user)));
        }
        Ok(keys)
    }
}

#[async_trait]
impl HostProbe for Ssh2Probe {
    async fn probe(&self, address: &str, port: u16, pinned: &PinnedKeys) -> Result<Vec<HostKey>, ProbeError> {
        let credentials = self.credentials.clone();
        let connect_timeout = self.connect_timeout;
        let address = address.to_string();
        let pinned = pinned.clone();
        tokio::task::spawn_blocking(move || {
            Self::probe_blocking(&credentials, connect_timeout, &address, port, &pinned)
        })
        .await
        .map_err(|e| ProbeError::Protocol(format!("probe task failed: {}", e)))?
    }
}

/// Where a node can be reached over SSH
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshEndpoint {
    /// Address that answered
    pub address: String,
    /// SSH port
    pub port: u16,
}

impl fmt::Display for SshEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.address, self.port)
    }
}

/// Finds the first usable address of a node and pins its host keys
pub struct SshResolver<'a> {
    probe: &'a dyn HostProbe,
    known_hosts_path: PathBuf,
    trusted: KnownHosts,
    interval: Duration,
    timeout: Duration,
}

impl<'a> SshResolver<'a> {
    /// Create a resolver writing pinned keys to `known_hosts_path`
    pub fn new(
        probe: &'a dyn HostProbe,
        known_hosts_path: impl Into<PathBuf>,
        interval: Duration,
        timeout: Duration,
    ) -> Self {
        SshResolver {
            probe,
            known_hosts_path: known_hosts_path.into(),
            trusted: KnownHosts::new(),
            interval,
            timeout,
        }
    }

    /// Treat the keys of another known-hosts file as already pinned
    pub fn with_trusted_file(mut self, path: &Path) -> ClusterResult<Self> {
        self.trusted = KnownHosts::load(path)?;
        Ok(self)
    }

    /// Resolve an endpoint for `node`
    ///
    /// Returns `TimeoutError` if no address answered before the deadline,
    /// in which case the known-hosts file is left as it was.
    pub async fn resolve(&self, node: &Node, port: u16) -> ClusterResult<SshEndpoint> {
        let deadline = Instant::now() + self.timeout;
        let pinned = KnownHosts::load(&self.known_hosts_path)?;

        let mut candidates: Vec<String> = Vec::new();
        for address in node.addresses() {
            if !candidates.iter().any(|c| c == address) {
                candidates.push(address.to_string());
            }
        }
        if candidates.is_empty() {
            return Err(ClusterError::SshError(format!("node {} has no known address", node.name)));
        }

        'rounds: loop {
            let mut dropped = Vec::new();
            for address in &candidates {
                debug!("trying to connect on {}:{}", address, port);
                let host = host_pattern(address, port);
                let known = PinnedKeys::new(host.as_str(), &[&pinned, &self.trusted]);
                let attempt = match timeout_at(deadline, self.probe.probe(address, port, &known)).await {
                    Ok(attempt) => attempt,
                    Err(_) => break 'rounds,
                };
                match attempt {
                    Ok(keys) => {
                        let mut updated = pinned.clone();
                        let added = updated.merge(&host, &keys);
                        if added > 0 {
                            updated.save(&self.known_hosts_path)?;
                            debug!("pinned {} host key(s) for {}", added, host);
                        }
                        info!("Node {} reachable via SSH on {}:{}", node.name, address, port);
                        return Ok(SshEndpoint { address: address.clone(), port });
                    }
                    Err(ProbeError::Unreachable(e)) => {
                        debug!("Host {} ({}) not reachable, retrying. ({})", node.name, address, e)
                    }
                    Err(ProbeError::HostKeyMismatch(e)) => {
                        warn!("{}, ignoring this address", e);
                        dropped.push(address.clone());
                    }
                    Err(ProbeError::Protocol(e)) => {
                        warn!("Ignoring error {} while connecting to {}", e, address);
                        dropped.push(address.clone());
                    }
                }
            }
            candidates.retain(|c| !dropped.contains(c));
            if candidates.is_empty() {
                return Err(ClusterError::SshError(format!(
                    "no usable SSH address for node {}",
                    node.name
                )));
            }

            let now = Instant::now();
            if now >= deadline {
                break;
            }
            sleep(self.interval.min(deadline - now)).await;
        }

        Err(ClusterError::TimeoutError(format!(
            "node {} not reachable via SSH within {:?}",
            node.name, self.timeout
        )))
    }
}
