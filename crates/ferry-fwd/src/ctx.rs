//! Process-wide state shared by every forwarding transaction.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tor_rtcompat::Runtime;

use ferry_handshake::{LinkSecurer, SplicePolicy};
use ferry_opener::{OpenerConfig, OpenerGates};
use ferry_pconn::PconnPool;
use ferry_peers::access::AccessCheck;
use ferry_peers::{PeerSelector, WirePolicy};

use crate::config::ForwardConfig;
use crate::contract::{Diversions, ErrorPageRenderer, Exchange, PinnedConnections};
use crate::stats::ReplyStats;

/// Everything a forwarding driver needs beyond its own transaction:
/// the runtime, the shared pools and gates, the collaborator contracts,
/// and process-lifecycle state.
///
/// Built once at startup and shared as `Arc<ForwardContext<R>>`.
#[derive(derive_builder::Builder)]
#[builder(pattern = "owned")]
pub struct ForwardContext<R: Runtime> {
    /// The async runtime.
    runtime: R,
    /// Forwarding configuration.
    config: Arc<ForwardConfig>,
    /// Connection-opening configuration, shared with the gates.
    opener_config: Arc<OpenerConfig>,
    /// The persistent-connection pool.
    pool: Arc<PconnPool<R>>,
    /// The happy-eyeballs pacing gates.
    gates: Arc<OpenerGates<R>>,
    /// Outgoing-address and marking policy.
    policy: Arc<WirePolicy>,
    /// Produces candidate destinations per transaction.
    selector: Arc<dyn PeerSelector>,
    /// Performs TLS handshakes on open links.
    securer: Arc<dyn LinkSecurer>,
    /// Decides whether peeked TLS connections get spliced, when the
    /// deployment intercepts TLS at all.
    #[builder(default)]
    splice_policy: Option<Arc<dyn SplicePolicy>>,
    /// Access to client-pinned server connections.
    pinned: Arc<dyn PinnedConnections>,
    /// Runs the server-side protocol once a connection is ready.
    exchange: Arc<dyn Exchange>,
    /// Renders error pages.
    renderer: Arc<dyn ErrorPageRenderer>,
    /// Evaluates named access lists.
    access: Arc<dyn AccessCheck>,
    /// Handles request classes that bypass forwarding.
    diversions: Arc<dyn Diversions>,
    /// Reply-status statistics.
    #[builder(default, setter(skip))]
    stats: ReplyStats,
    /// Raised when the process begins shutting down.
    #[builder(default, setter(skip))]
    shutting_down: AtomicBool,
}

impl<R: Runtime> ForwardContext<R> {
    /// Return a new builder for constructing a [`ForwardContext`].
    pub fn builder() -> ForwardContextBuilder<R> {
        ForwardContextBuilder::default()
    }

    /// Return the async runtime.
    pub fn runtime(&self) -> &R {
        &self.runtime
    }

    /// Return the forwarding configuration.
    pub fn config(&self) -> &Arc<ForwardConfig> {
        &self.config
    }

    /// Return the connection-opening configuration.
    pub fn opener_config(&self) -> &Arc<OpenerConfig> {
        &self.opener_config
    }

    /// Return the persistent-connection pool.
    pub fn pool(&self) -> &Arc<PconnPool<R>> {
        &self.pool
    }

    /// Return the pacing gates.
    pub fn gates(&self) -> &Arc<OpenerGates<R>> {
        &self.gates
    }

    /// Return the outgoing-address and marking policy.
    pub fn policy(&self) -> &Arc<WirePolicy> {
        &self.policy
    }

    /// Return the peer selector.
    pub fn selector(&self) -> &Arc<dyn PeerSelector> {
        &self.selector
    }

    /// Return the TLS securer.
    pub fn securer(&self) -> &Arc<dyn LinkSecurer> {
        &self.securer
    }

    /// Return the splice policy, if TLS interception is configured.
    pub fn splice_policy(&self) -> Option<&Arc<dyn SplicePolicy>> {
        self.splice_policy.as_ref()
    }

    /// Return the pinned-connection registry.
    pub fn pinned(&self) -> &Arc<dyn PinnedConnections> {
        &self.pinned
    }

    /// Return the protocol exchange.
    pub fn exchange(&self) -> &Arc<dyn Exchange> {
        &self.exchange
    }

    /// Return the error-page renderer.
    pub fn renderer(&self) -> &Arc<dyn ErrorPageRenderer> {
        &self.renderer
    }

    /// Return the access checker.
    pub fn access(&self) -> &Arc<dyn AccessCheck> {
        &self.access
    }

    /// Return the diversion handlers.
    pub fn diversions(&self) -> &Arc<dyn Diversions> {
        &self.diversions
    }

    /// Return the reply-status statistics.
    pub fn stats(&self) -> &ReplyStats {
        &self.stats
    }

    /// Whether the process is shutting down.
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Relaxed)
    }

    /// Note that the process has begun shutting down: pending
    /// transactions stop retrying and new ones are refused.
    pub fn begin_shutdown(&self) {
        self.shutting_down.store(true, Ordering::Relaxed);
    }
}

impl<R: Runtime> std::fmt::Debug for ForwardContext<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ForwardContext")
            .field("config", &self.config)
            .field("shutting_down", &self.is_shutting_down())
            .finish_non_exhaustive()
    }
}
