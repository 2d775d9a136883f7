//! Descriptions of configured parent gateways ("peers").

use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// How many consecutive connect failures make us consider a peer down.
///
/// A successful connection resets the count.
const PEER_DOWN_THRESHOLD: u32 = 10;

/// A configured parent gateway that requests may be forwarded through.
///
/// A `Peer` is a long-lived, shared description of a next-hop proxy (or an
/// origin server operated in `origin_server` mode).  It carries the
/// configuration that the forwarding core needs when opening, securing, and
/// pooling connections to that gateway, plus a small amount of mutable
/// health state.
///
/// Peers are shared as `Arc<Peer>`; peer *identity* is `Arc` pointer
/// identity, so two configuration entries for the same host are distinct
/// peers.
#[derive(Debug, derive_builder::Builder)]
#[builder(derive(Debug))]
pub struct Peer {
    /// Short configured name, used in logs and pool bookkeeping.
    name: String,
    /// Hostname used for TLS server-name checks and CONNECT authorities.
    host: String,
    /// Port to connect to on every resolved address.
    port: u16,
    /// Resolved addresses for this peer, in configuration order.
    ///
    /// The standby refill loop cycles through these round-robin; the
    /// forwarding path receives per-address paths from peer selection
    /// instead.
    #[builder(default)]
    addresses: Vec<IpAddr>,
    /// Boolean knobs that modify how this peer is used.
    #[builder(default)]
    options: PeerOptions,
    /// TLS parameters, when the transport to this peer is encrypted.
    #[builder(default, setter(strip_option))]
    tls: Option<PeerTlsConfig>,
    /// Credentials to present in CONNECT requests through this peer.
    #[builder(default, setter(strip_option))]
    auth: Option<ProxyAuth>,
    /// Per-peer connect timeout override.
    #[builder(default, setter(strip_option))]
    connect_timeout: Option<Duration>,
    /// How many idle standby connections to keep pre-opened (0 = none).
    #[builder(default)]
    standby_limit: usize,
    /// Upper bound on concurrent connections we will open to this peer.
    #[builder(default, setter(strip_option))]
    max_connections: Option<usize>,
    /// Mutable connection-health state.
    #[builder(default, setter(skip))]
    health: PeerHealth,
}

impl Peer {
    /// Return a new builder for constructing a [`Peer`].
    pub fn builder() -> PeerBuilder {
        PeerBuilder::default()
    }

    /// Return this peer's configured name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Return the hostname used for TLS and CONNECT authorities.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Return the port used for every address of this peer.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Return the resolved addresses for this peer.
    pub fn addresses(&self) -> &[IpAddr] {
        &self.addresses
    }

    /// Return the boolean options configured for this peer.
    pub fn options(&self) -> &PeerOptions {
        &self.options
    }

    /// Return the TLS parameters, if the transport to this peer is encrypted.
    pub fn tls(&self) -> Option<&PeerTlsConfig> {
        self.tls.as_ref()
    }

    /// Return the CONNECT credentials for this peer, if any.
    pub fn auth(&self) -> Option<&ProxyAuth> {
        self.auth.as_ref()
    }

    /// Return the effective connect timeout, falling back to `default`.
    pub fn connect_timeout(&self, default: Duration) -> Duration {
        self.connect_timeout.unwrap_or(default)
    }

    /// Return the configured standby pool size (0 = no standby pool).
    pub fn standby_limit(&self) -> usize {
        self.standby_limit
    }

    /// Return the per-peer concurrent-connection cap, if any.
    pub fn max_connections(&self) -> Option<usize> {
        self.max_connections
    }

    /// Return this peer's mutable health state.
    pub fn health(&self) -> &PeerHealth {
        &self.health
    }

    /// Return true if `a` and `b` are the same configured peer.
    pub fn same_peer(a: &Arc<Peer>, b: &Arc<Peer>) -> bool {
        Arc::ptr_eq(a, b)
    }
}

impl std::fmt::Display for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// Boolean knobs that modify how a [`Peer`] is used.
#[derive(Debug, Clone, Default, Eq, PartialEq, Serialize, Deserialize)]
#[non_exhaustive]
pub struct PeerOptions {
    /// Treat this peer as an origin server rather than a proxy: requests are
    /// sent in origin form and CONNECT is never used to reach further hosts.
    pub origin_server: bool,
    /// Never spoof the client address on connections to this peer.
    pub no_tproxy: bool,
    /// Exempt traffic to this peer from rate limiting.
    pub no_delay: bool,
}

/// TLS parameters for a peer whose transport is encrypted.
#[derive(Debug, Clone, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[non_exhaustive]
pub struct PeerTlsConfig {
    /// Server name to present and verify, overriding the peer's host.
    pub sni: Option<String>,
    /// DER-encoded certificate this peer must present, if pinned.
    pub pinned_cert: Option<Vec<u8>>,
    /// Accept the handshake even when the certificate cannot be validated.
    pub accept_unvalidated: bool,
}

/// Credentials presented in a `Proxy-Authorization` header when CONNECTing
/// through a peer.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[non_exhaustive]
pub struct ProxyAuth {
    /// Username.
    pub user: String,
    /// Password.
    pub password: String,
}

impl ProxyAuth {
    /// Construct credentials from a username and password.
    pub fn new(user: impl Into<String>, password: impl Into<String>) -> Self {
        ProxyAuth {
            user: user.into(),
            password: password.into(),
        }
    }
}

/// Mutable per-peer connection-health state.
///
/// This is a deliberately small model: a peer is "up" until it accumulates
/// enough consecutive connect failures, and any success resets the count.
#[derive(Debug, Default)]
pub struct PeerHealth {
    /// Number of connect failures since the last success.
    consecutive_failures: AtomicU32,
}

impl PeerHealth {
    /// Record a successful connection to the peer.
    pub fn note_success(&self) {
        self.consecutive_failures.store(0, Ordering::Relaxed);
    }

    /// Record a failed connection attempt to the peer.
    pub fn note_failure(&self) {
        self.consecutive_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Return true if the peer is considered usable.
    pub fn is_up(&self) -> bool {
        self.consecutive_failures.load(Ordering::Relaxed) < PEER_DOWN_THRESHOLD
    }
}
