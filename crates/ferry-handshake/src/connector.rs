//! Performing a TLS handshake on an already-open transport.
//!
//! Two variants exist, mirroring the two ways the proxy negotiates TLS
//! with a server: the *blind* connector simply encrypts the transport per
//! the peer configuration, while the *peeking* connector consults a splice
//! policy and may instead hand the whole transaction over to raw-byte
//! tunneling.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use tor_rtcompat::tls::{CertifiedConn, TlsConnector};
use tor_rtcompat::{Runtime, SleepProviderExt, TlsProvider};

use ferry_peers::{DynStream, Link, Peer};

/// TLS parameters for securing one link.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct TlsParams {
    /// Server name to present (SNI) and verify.
    pub server_name: String,
    /// DER-encoded certificate the server must present, if pinned.
    pub pinned_cert: Option<Vec<u8>>,
    /// Which connector variant to run.
    pub variant: TlsVariant,
}

/// The connector variant to run.
#[derive(Clone)]
#[non_exhaustive]
pub enum TlsVariant {
    /// Encrypt the transport; the handshake either succeeds or fails.
    Blind,
    /// Consult a splice policy which may divert the transaction into a raw
    /// tunnel instead of completing the handshake.
    Peeking(Arc<dyn SplicePolicy>),
}

impl std::fmt::Debug for TlsVariant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TlsVariant::Blind => write!(f, "Blind"),
            TlsVariant::Peeking(_) => write!(f, "Peeking"),
        }
    }
}

impl TlsParams {
    /// Derive blind-handshake parameters for `peer`, falling back to
    /// `host_hint` when the peer config does not override the server name.
    pub fn for_peer(peer: &Peer, host_hint: Option<&str>) -> Self {
        let tls = peer.tls();
        let server_name = tls
            .and_then(|t| t.sni.clone())
            .unwrap_or_else(|| host_hint.unwrap_or(peer.host()).to_owned());
        TlsParams {
            server_name,
            pinned_cert: tls.and_then(|t| t.pinned_cert.clone()),
            variant: TlsVariant::Blind,
        }
    }

    /// Derive blind-handshake parameters for a direct connection to an
    /// origin named `host`.
    pub fn for_origin(host: &str) -> Self {
        TlsParams {
            server_name: host.to_owned(),
            pinned_cert: None,
            variant: TlsVariant::Blind,
        }
    }
}

/// What to do with a transaction whose server TLS we are peeking at.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
#[non_exhaustive]
pub enum SpliceDecision {
    /// Complete the handshake and keep forwarding at the HTTP layer.
    Continue,
    /// Stop interpreting the transaction; splice client and server into a
    /// raw tunnel.
    Splice,
}

/// Decides, per transaction, whether a peeked connection should be spliced.
pub trait SplicePolicy: Send + Sync {
    /// Decide what to do for a connection to `server_name`.
    fn decide(&self, server_name: &str) -> SpliceDecision;
}

/// The result of running a peer connector.
///
/// At most one of `link` and `tunneled` is meaningful: a tunneled answer
/// carries no link, and the initiator must treat it as a successful
/// terminal state whose connection is owned by the tunneling driver.
#[derive(Debug)]
#[non_exhaustive]
pub struct EncryptorAnswer {
    /// The secured link, when the handshake ran to completion.
    pub link: Option<Link>,
    /// True if forwarding responsibility moved to a raw tunnel.
    pub tunneled: bool,
}

/// An error from TLS negotiation with a server or peer.
#[derive(Debug, Clone, thiserror::Error)]
#[non_exhaustive]
pub enum TlsError {
    /// The handshake itself failed.
    #[error("TLS handshake with {server_name} failed")]
    Handshake {
        /// The server name we were negotiating with.
        server_name: String,
        /// The underlying failure.
        #[source]
        source: Arc<std::io::Error>,
    },

    /// The server presented a certificate other than the pinned one.
    #[error("server certificate does not match the pinned certificate")]
    CertificateMismatch,

    /// A certificate was pinned but the server presented none.
    #[error("server presented no certificate")]
    NoPeerCertificate,

    /// The handshake did not finish within the handshake timeout.
    #[error("TLS handshake timed out")]
    Timeout,
}

/// Secure `link` with TLS, returning the same link re-wrapped around the
/// encrypted stream.
///
/// This is the full connector: depending on `params.variant` it behaves
/// blindly or consults the splice policy first.  The handshake runs under
/// `timeout`, derived by the caller the same way as a connect timeout.
pub async fn secure_link<R, C>(
    runtime: &R,
    connector: &C,
    link: Link,
    params: &TlsParams,
    timeout: Duration,
) -> Result<EncryptorAnswer, TlsError>
where
    R: Runtime,
    C: TlsConnector<DynStream> + Send + Sync,
{
    if let TlsVariant::Peeking(policy) = &params.variant {
        if policy.decide(&params.server_name) == SpliceDecision::Splice {
            tracing::debug!("splicing {} instead of bumping", link.profile());
            // The caller inherits the (still cleartext) transport through
            // the tunneling driver; from the connector's point of view the
            // link is gone.
            return Ok(EncryptorAnswer {
                link: None,
                tunneled: true,
            });
        }
    }

    let secured = runtime
        .timeout(timeout, handshake(connector, link, params))
        .await
        .map_err(|_| TlsError::Timeout)??;
    Ok(EncryptorAnswer {
        link: Some(secured),
        tunneled: false,
    })
}

/// Run the handshake without enforcing a timeout.
fn handshake<'a, C>(
    connector: &'a C,
    link: Link,
    params: &'a TlsParams,
) -> BoxFuture<'a, Result<Link, TlsError>>
where
    C: TlsConnector<DynStream> + Send + Sync,
{
    async move { handshake_inner(connector, link, params).await }.boxed()
}

/// The body of [`handshake`], kept separate so the outer function can box
/// its future before the result is threaded through further generic/async
/// layers (rustc otherwise fails to unify the opaque future type produced
/// by `TlsConnector::negotiate_unvalidated` across those layers).
async fn handshake_inner<C>(connector: &C, link: Link, params: &TlsParams) -> Result<Link, TlsError>
where
    C: TlsConnector<DynStream> + Send + Sync,
{
    // The connector consumes the cleartext stream; the profile and open
    // timestamp carry over to the re-wrapped link.
    let (profile, cleartext, opened_at) = link.into_parts();
    let tls = connector
        .negotiate_unvalidated(cleartext, &params.server_name)
        .await
        .map_err(|e| TlsError::Handshake {
            server_name: params.server_name.clone(),
            source: Arc::new(e),
        })?;

    if let Some(pinned) = &params.pinned_cert {
        let presented = tls.peer_certificate().map_err(|e| TlsError::Handshake {
            server_name: params.server_name.clone(),
            source: Arc::new(e),
        })?;
        match presented {
            None => return Err(TlsError::NoPeerCertificate),
            Some(der) => {
                let der: &[u8] = der.as_ref();
                if der != pinned.as_slice() {
                    return Err(TlsError::CertificateMismatch);
                }
            }
        }
    }

    let link = Link::new(profile, Box::new(tls), opened_at);
    tracing::trace!("secured {}", link.profile());
    Ok(link)
}

/// Object-safe interface to TLS securing, so that components which need to
/// secure links (the standby pool refill, the forwarding drivers) can be
/// handed a securer without being generic over a TLS stack.
pub trait LinkSecurer: Send + Sync {
    /// Secure `link` per `params`, under `timeout`.
    fn secure(
        &self,
        link: Link,
        params: TlsParams,
        timeout: Duration,
    ) -> BoxFuture<'_, Result<EncryptorAnswer, TlsError>>;
}

/// The [`LinkSecurer`] backed by a runtime's TLS provider.
pub struct RuntimeSecurer<R>
where
    R: Runtime + TlsProvider<DynStream>,
{
    /// The runtime, for timeouts.
    runtime: R,
    /// The TLS connector built from the runtime's provider.
    connector: <R as TlsProvider<DynStream>>::Connector,
}

impl<R> RuntimeSecurer<R>
where
    R: Runtime + TlsProvider<DynStream>,
{
    /// Construct a securer from the given runtime.
    pub fn new(runtime: R) -> Self {
        let connector = <R as TlsProvider<DynStream>>::tls_connector(&runtime);
        RuntimeSecurer { runtime, connector }
    }
}

impl<R> LinkSecurer for RuntimeSecurer<R>
where
    R: Runtime + TlsProvider<DynStream>,
{
    fn secure(
        &self,
        link: Link,
        params: TlsParams,
        timeout: Duration,
    ) -> BoxFuture<'_, Result<EncryptorAnswer, TlsError>> {
        async move { secure_link(&self.runtime, &self.connector, link, &params, timeout).await }
            .boxed()
    }
}
