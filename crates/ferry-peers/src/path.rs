//! Candidate destinations (paths) and opened transport connections (links).

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use futures::io::{AsyncRead, AsyncWrite};
use safelog::sensitive as sv;

use crate::peer::Peer;

/// How a candidate destination was selected.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
#[non_exhaustive]
pub enum PathKind {
    /// Go straight to the origin server.
    Direct,
    /// Go through a configured parent gateway.
    Gateway,
    /// Use the client's original destination address (interception).
    OriginalDst,
    /// Reuse the connection pinned to the requesting client.
    Pinned,
    /// Opened ahead of demand for a standby pool.
    Standby,
}

/// The address family of a destination.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
#[allow(clippy::exhaustive_enums)]
pub enum AddrFamily {
    /// IPv4
    V4,
    /// IPv6
    V6,
}

/// An unopened candidate destination.
///
/// A profile records everything needed to open a transport connection to
/// one next hop: the remote address, the peer configuration (if the hop is
/// a configured gateway), the local address to bind, and the packet
/// markings to apply.  Opening a profile yields a [`Link`] carrying the
/// same attributes plus a live byte stream.
#[derive(Debug, Clone)]
pub struct PathProfile {
    /// Address to connect to.
    remote: SocketAddr,
    /// The configured gateway this path goes through, if any.
    peer: Option<Arc<Peer>>,
    /// How this path was selected.
    kind: PathKind,
    /// Local address to bind before connecting, if constrained.
    local: Option<SocketAddr>,
    /// Type-of-service value for packets on this connection (0 = unset).
    tos: u8,
    /// Netfilter mark for packets on this connection (0 = unset).
    nfmark: u32,
}

impl PathProfile {
    /// Construct a profile for a direct connection to `remote`.
    pub fn direct(remote: SocketAddr) -> Self {
        PathProfile {
            remote,
            peer: None,
            kind: PathKind::Direct,
            local: None,
            tos: 0,
            nfmark: 0,
        }
    }

    /// Construct a profile for a connection to `remote` through `peer`.
    pub fn via_peer(remote: SocketAddr, peer: Arc<Peer>, kind: PathKind) -> Self {
        PathProfile {
            remote,
            peer: Some(peer),
            kind,
            local: None,
            tos: 0,
            nfmark: 0,
        }
    }

    /// Return a copy of this profile with no per-attempt state.
    ///
    /// Profiles carry no live resources, so this is an ordinary clone; it
    /// exists so call sites can say what they mean when they fork a path
    /// for a fresh attempt.
    pub fn clone_profile(&self) -> Self {
        self.clone()
    }

    /// Return the remote address.
    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    /// Return the configured gateway, if this path goes through one.
    pub fn peer(&self) -> Option<&Arc<Peer>> {
        self.peer.as_ref()
    }

    /// Return how this path was selected.
    pub fn kind(&self) -> PathKind {
        self.kind
    }

    /// Replace how this path was selected.
    pub fn set_kind(&mut self, kind: PathKind) {
        self.kind = kind;
    }

    /// Return the constrained local address, if any.
    pub fn local(&self) -> Option<SocketAddr> {
        self.local
    }

    /// Constrain the local address to bind before connecting.
    pub fn set_local(&mut self, local: SocketAddr) {
        self.local = Some(local);
    }

    /// Return the (tos, nfmark) packet markings.
    pub fn markings(&self) -> (u8, u32) {
        (self.tos, self.nfmark)
    }

    /// Set the packet markings to apply to this connection.
    pub fn set_markings(&mut self, tos: u8, nfmark: u32) {
        self.tos = tos;
        self.nfmark = nfmark;
    }

    /// Return the address family of the remote endpoint.
    pub fn family(&self) -> AddrFamily {
        if self.remote.is_ipv4() {
            AddrFamily::V4
        } else {
            AddrFamily::V6
        }
    }

    /// Return true if `self` and `other` lead to the same gateway.
    ///
    /// Paths through configured peers compare by peer identity.  Paths with
    /// no peer all lead toward the same selected origin (peer selection
    /// emits the addresses of one origin contiguously), so they compare
    /// equal to each other.
    pub fn same_gateway(&self, other: &PathProfile) -> bool {
        match (&self.peer, &other.peer) {
            (Some(a), Some(b)) => Peer::same_peer(a, b),
            (None, None) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for PathProfile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.peer {
            Some(peer) => write!(f, "{}/{}", peer, sv(self.remote)),
            None => write!(f, "{}", sv(self.remote)),
        }
    }
}

/// Object-safe supertrait for the byte streams a [`Link`] may carry.
pub trait AbstractStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}
impl<T> AbstractStream for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// An owned, type-erased byte stream to a next hop.
pub type DynStream = Box<dyn AbstractStream>;

// `tor_rtcompat::TlsProvider` is generic over `S: StreamOps`; since the
// concrete stream type behind `DynStream` is erased, it can't forward to
// an inner `StreamOps` impl, so this satisfies the bound with the trait's
// documented "unsupported" defaults.
impl tor_rtcompat::StreamOps for Box<dyn AbstractStream> {}

/// An opened [`PathProfile`]: the profile plus a live byte stream.
///
/// A link has exactly one owner at any time; whoever holds it is
/// responsible for the stream, and closure is observed at the next I/O
/// operation.  Transferring a link transfers that responsibility.
pub struct Link {
    /// The profile this link was opened from.
    profile: PathProfile,
    /// The live byte stream.
    stream: DynStream,
    /// When the transport was opened.
    opened_at: Instant,
}

impl Link {
    /// Wrap an open stream to `profile`'s destination into a link.
    pub fn new(profile: PathProfile, stream: DynStream, opened_at: Instant) -> Self {
        Link {
            profile,
            stream,
            opened_at,
        }
    }

    /// Return the profile this link was opened from.
    pub fn profile(&self) -> &PathProfile {
        &self.profile
    }

    /// Return a mutable reference to the profile.
    pub fn profile_mut(&mut self) -> &mut PathProfile {
        &mut self.profile
    }

    /// Return when the transport was opened.
    pub fn opened_at(&self) -> Instant {
        self.opened_at
    }

    /// Return a mutable reference to the underlying stream.
    pub fn stream_mut(&mut self) -> &mut DynStream {
        &mut self.stream
    }

    /// Decompose this link into its profile and stream.
    pub fn into_parts(self) -> (PathProfile, DynStream, Instant) {
        (self.profile, self.stream, self.opened_at)
    }

    /// Replace the stream in this link, returning the old one.
    ///
    /// Used when a negotiation step (TLS) wraps the transport in place.
    pub fn replace_stream(&mut self, stream: DynStream) -> DynStream {
        std::mem::replace(&mut self.stream, stream)
    }
}

impl std::fmt::Debug for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Link")
            .field("profile", &self.profile)
            .field("opened_at", &self.opened_at)
            .finish_non_exhaustive()
    }
}

impl std::fmt::Display for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "link to {}", self.profile)
    }
}
