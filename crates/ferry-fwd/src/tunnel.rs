//! The per-transaction driver for CONNECT and force-tunneled
//! transactions.

use std::sync::Arc;
use std::time::Instant;

use futures::FutureExt;
use futures::future::BoxFuture;
use futures::io::AsyncWriteExt;
use futures::stream::BoxStream;
use tor_rtcompat::{Runtime, SleepProvider};

use ferry_handshake::{Established, EncryptorAnswer, TlsError, TlsParams, TunnelError, TunnelRequest};
use ferry_opener::{Answer, HappyConnOpener};
use ferry_peers::{DestinationEvent, Destinations, Link, RequestInfo};

use crate::ctx::ForwardContext;
use crate::err::Error;
use crate::shovel::{NoRateLimit, ShovelOutcome, shovel};
use crate::util::enough_time_to_reforward;

/// The reply committed to a CONNECT client when its tunnel is ready.
const CONNECTION_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection established\r\n\r\n";

/// How a tunnel transaction ended.
#[derive(Debug, Clone, Copy)]
#[non_exhaustive]
pub enum TunnelOutcome {
    /// The tunnel committed and shoveled bytes until it ended.
    Tunneled(ShovelOutcome),
    /// The tunnel never committed; the client was answered (or left)
    /// with this status.
    Refused {
        /// The HTTP status of the error response.
        status: u16,
    },
}

/// The one asynchronous setup operation a tunnel waits on at a time.
enum Step {
    /// Nothing outstanding.
    Idle,
    /// Waiting for a transport connection (the opener).
    Transport(BoxFuture<'static, Answer>),
    /// Waiting for a CONNECT exchange through a parent proxy.
    PeerTunnel(BoxFuture<'static, Result<Established, TunnelError>>),
    /// Waiting for a TLS handshake with the parent proxy.
    Encryption(BoxFuture<'static, Result<EncryptorAnswer, TlsError>>),
}

/// What a completed [`Step`] produced.
enum StepOutcome {
    /// The opener finished.
    Transport(Answer),
    /// The CONNECT exchange finished.
    Tunnel(Result<Established, TunnelError>),
    /// The TLS handshake finished.
    Encrypt(Result<EncryptorAnswer, TlsError>),
}

/// Await the active step, or forever when idle.
async fn step_outcome(step: &mut Step) -> StepOutcome {
    match step {
        Step::Idle => futures::future::pending().await,
        Step::Transport(fut) => StepOutcome::Transport(fut.await),
        Step::PeerTunnel(fut) => StepOutcome::Tunnel(fut.await),
        Step::Encryption(fut) => StepOutcome::Encrypt(fut.await),
    }
}

/// Await the next selection event, or forever once unsubscribed.
async fn selection_event(
    stream: &mut BoxStream<'static, DestinationEvent>,
    subscribed: bool,
) -> Option<DestinationEvent> {
    use futures::StreamExt as _;
    if subscribed {
        stream.next().await
    } else {
        futures::future::pending().await
    }
}

/// The state engine that sets up a TCP tunnel from an accepted client
/// connection to a server, then shovels bytes between the two.
///
/// Until the commit point (the peer is ready to shovel) failures follow
/// the same retry-or-bail logic as ordinary forwarding; after it, the
/// client side has been dirtied and the tunnel is not retriable.
pub struct TunnelState<R: Runtime> {
    /// Shared process state.
    ctx: Arc<ForwardContext<R>>,
    /// The CONNECT (or force-tunneled) request.
    request: RequestInfo,
    /// When the tunnel attempt started.
    start: Instant,
    /// The accepted client connection, until the commit consumes it.
    client: Option<Link>,
    /// Bytes the client pushed before shoveling started.
    preread_client: Vec<u8>,
    /// Candidate paths, shared with the opener.
    dests: Arc<Destinations>,
    /// Details of the last failed attempt, for the eventual error page.
    saved_error: Option<Error>,
    /// Whether another destination may still be attempted.
    retriable: bool,
    /// Peer selection produced at least one candidate path.
    destinations_found: bool,
    /// Whether the selection subscription is still live.
    subscribed: bool,
    /// Forwarding attempts so far.
    n_tries: u32,
    /// The single outstanding setup operation.
    step: Step,
}

impl<R: Runtime> TunnelState<R> {
    /// Initiate tunneling; fire and forget.
    pub fn start(
        ctx: Arc<ForwardContext<R>>,
        request: RequestInfo,
        client: Link,
        preread_client: Vec<u8>,
    ) {
        use futures::task::SpawnExt as _;
        let runtime = ctx.runtime().clone();
        let _ignore = runtime.spawn(async move {
            let outcome = Self::run(ctx, request, client, preread_client).await;
            tracing::debug!("tunnel finished: {:?}", outcome);
        });
    }

    /// Run one tunnel transaction to completion.
    pub async fn run(
        ctx: Arc<ForwardContext<R>>,
        request: RequestInfo,
        client: Link,
        preread_client: Vec<u8>,
    ) -> TunnelOutcome {
        let start = ctx.runtime().now();
        tracing::debug!("tunneling {} for {}", request.authority(), client.profile());
        let mut state = TunnelState {
            ctx,
            request,
            start,
            client: Some(client),
            preread_client,
            dests: Arc::new(Destinations::new()),
            saved_error: None,
            retriable: true,
            destinations_found: false,
            subscribed: true,
            n_tries: 0,
            step: Step::Idle,
        };
        state.drive().await
    }

    /// The main setup loop, ending in a committed tunnel or an error
    /// response.
    async fn drive(&mut self) -> TunnelOutcome {
        // Check if this client is allowed to tunnel through us at all.
        if let Some(acl) = &self.ctx.config().miss_access {
            let exempt = self.request.client_addr().is_none();
            if !exempt
                && self
                    .ctx
                    .access()
                    .fast_check(acl, &self.request)
                    .denied()
            {
                return self.send_error(Error::Forbidden).await;
            }
        }
        if self.ctx.is_shutting_down() {
            return self.send_error(Error::ShuttingDown).await;
        }

        let mut selection = self.ctx.selector().subscribe(&self.request);
        let lifetime = {
            let runtime = self.ctx.runtime().clone();
            let limit = self.ctx.config().lifetime_timeout;
            async move { runtime.sleep(limit).await }
        };
        let mut lifetime = lifetime.boxed().fuse();

        loop {
            enum Ev {
                /// The pre-commit lifetime limit expired.
                Lifetime,
                /// A peer-selection event (None: the stream ended).
                Selection(Option<DestinationEvent>),
                /// The active step completed.
                Step(StepOutcome),
            }

            let event = futures::select_biased! {
                () = lifetime => Ev::Lifetime,
                outcome = step_outcome(&mut self.step).fuse() => Ev::Step(outcome),
                ev = selection_event(&mut selection, self.subscribed).fuse() => Ev::Selection(ev),
            };

            let finished = match event {
                Ev::Lifetime => {
                    tracing::debug!("tunnel lifetime expired before commit");
                    Some(self.send_error(Error::Budget).await)
                }
                Ev::Selection(Some(DestinationEvent::Path(path))) => {
                    self.note_destination(path).await
                }
                Ev::Selection(Some(DestinationEvent::UsePinned)) => self.use_pinned().await,
                Ev::Selection(Some(DestinationEvent::End(selection_error))) => {
                    self.note_destinations_end(selection_error).await
                }
                Ev::Selection(None) => self.note_destinations_end(None).await,
                Ev::Selection(Some(_)) => None,
                Ev::Step(StepOutcome::Transport(answer)) => self.note_connection(answer).await,
                Ev::Step(StepOutcome::Tunnel(result)) => self.tunnel_established(result).await,
                Ev::Step(StepOutcome::Encrypt(result)) => self.connected_to_peer(result).await,
            };
            if let Some(outcome) = finished {
                return outcome;
            }
        }
    }

    /// Whether the client was promised a reply to its CONNECT.
    ///
    /// Force-tunneled, intercepted, and already-bumped transactions have
    /// had their client side spoken for before tunneling started.
    fn client_expects_connect_response(&self) -> bool {
        let flags = self.request.flags();
        flags.connect
            && !flags.force_tunnel
            && !flags.intercepted
            && !flags.tproxy
            && !flags.tls_peek
            && !flags.tls_bumped
    }

    /// A new candidate path arrived from peer selection.
    async fn note_destination(&mut self, path: ferry_peers::PathProfile) -> Option<TunnelOutcome> {
        self.destinations_found = true;
        self.dests.with(|rp| rp.add(path));
        match self.step {
            Step::Transport(_) => {
                self.dests.note_change();
                None
            }
            Step::Idle => {
                self.start_connecting();
                None
            }
            // A connection is being prepared; keep the path in case we
            // need to retry.
            _ => None,
        }
    }

    /// Peer selection is done producing paths.
    async fn note_destinations_end(
        &mut self,
        selection_error: Option<ferry_peers::SelectionError>,
    ) -> Option<TunnelOutcome> {
        self.subscribed = false;
        self.dests.with(|rp| rp.finalize());

        if !self.destinations_found {
            let error = match selection_error {
                Some(error) => Error::Selection(error),
                None => self
                    .saved_error
                    .take()
                    .unwrap_or(Error::CannotForward),
            };
            return Some(self.send_error(error).await);
        }
        debug_assert!(selection_error.is_none());

        match self.step {
            Step::Transport(_) => {
                self.dests.note_change();
                None
            }
            Step::Idle => {
                // We were waiting for more destinations; none are coming.
                let error = self.saved_error.take().unwrap_or(Error::CannotForward);
                Some(self.send_error(error).await)
            }
            _ => None,
        }
    }

    /// Launch the connection opener over the current destination list.
    ///
    /// Tunnels never reuse persistent connections and are never
    /// retriable at the request level: the bytes are opaque.
    fn start_connecting(&mut self) {
        debug_assert!(!self.dests.with(|rp| rp.is_empty()));
        let mut opener = HappyConnOpener::new(
            self.ctx.runtime(),
            Arc::clone(self.ctx.opener_config()),
            Arc::clone(self.ctx.gates()),
            Arc::clone(self.ctx.pool()),
            Arc::clone(self.ctx.policy()),
            Arc::clone(&self.dests),
            self.request.clone(),
            self.start,
            self.n_tries,
        );
        opener.set_host(self.request.host());
        opener.set_retriable(false);
        opener.allow_persistent(false);
        self.step = Step::Transport(Box::pin(opener.run()));
    }

    /// The opener reported an open connection, or final defeat.
    async fn note_connection(&mut self, answer: Answer) -> Option<TunnelOutcome> {
        self.step = Step::Idle;
        self.n_tries = self.n_tries.max(answer.tries);
        match answer.outcome {
            Err(error) => {
                self.saved_error = Some(Error::Connect(error));
                self.retry_or_bail("tried all destinations").await
            }
            Ok(reached) => self.connect_done(reached.link, reached.reused).await,
        }
    }

    /// Route an established connection toward the commit point.
    async fn connect_done(&mut self, mut link: Link, reused: bool) -> Option<TunnelOutcome> {
        if reused {
            // Markings were chosen for some earlier transaction.
            self.ctx.policy().prepare(&self.request, link.profile_mut());
        }

        let via_proxy = link
            .profile()
            .peer()
            .is_some_and(|peer| !peer.options().origin_server);
        if !via_proxy {
            return self.ready_to_shovel(link, Vec::new()).await;
        }

        let peer_tls = link
            .profile()
            .peer()
            .is_some_and(|peer| peer.tls().is_some());
        if peer_tls {
            self.secure_connection(link);
            return None;
        }
        self.establish_tunnel_thru_proxy(link);
        None
    }

    /// Start the TLS handshake with the parent proxy.
    fn secure_connection(&mut self, link: Link) {
        let params = match link.profile().peer() {
            Some(peer) => TlsParams::for_peer(peer, Some(self.request.host())),
            None => TlsParams::for_origin(self.request.host()),
        };
        let timeout = self.connecting_timeout(link.profile());
        let securer = Arc::clone(self.ctx.securer());
        self.step = Step::Encryption(Box::pin(async move {
            securer.secure(link, params, timeout).await
        }));
    }

    /// The TLS handshake with the parent proxy finished.
    async fn connected_to_peer(
        &mut self,
        result: Result<EncryptorAnswer, TlsError>,
    ) -> Option<TunnelOutcome> {
        self.step = Step::Idle;
        match result {
            Ok(answer) if answer.tunneled => {
                // Tunnels do not peek; a splice here is an internal
                // confusion.
                self.saved_error = Some(Error::Internal(tor_error::internal!(
                    "peeking connector used on a tunnel path"
                )));
                self.retry_or_bail("unexpected splice").await
            }
            Ok(answer) => match answer.link {
                Some(link) => {
                    // An encrypted hop to the proxy still needs the
                    // CONNECT exchange inside it.
                    self.establish_tunnel_thru_proxy(link);
                    None
                }
                None => {
                    self.saved_error = Some(Error::Internal(tor_error::internal!(
                        "encryptor answered with neither link nor tunnel"
                    )));
                    self.retry_or_bail("TLS peer connection error").await
                }
            },
            Err(error) => {
                self.saved_error = Some(Error::Tls(error));
                self.retry_or_bail("TLS peer connection error").await
            }
        }
    }

    /// Start the CONNECT exchange through the parent proxy.
    fn establish_tunnel_thru_proxy(&mut self, link: Link) {
        let runtime = self.ctx.runtime().clone();
        let timeout = self.connecting_timeout(link.profile());
        let mut tunnel_request = TunnelRequest::new(
            self.request.authority(),
            self.ctx.config().user_agent.clone(),
        );
        tunnel_request.auth = link
            .profile()
            .peer()
            .and_then(|peer| peer.auth().cloned());
        self.step = Step::PeerTunnel(Box::pin(async move {
            ferry_handshake::establish_tunnel(&runtime, link, &tunnel_request, timeout).await
        }));
    }

    /// The CONNECT exchange through the parent proxy finished.
    async fn tunnel_established(
        &mut self,
        result: Result<Established, TunnelError>,
    ) -> Option<TunnelOutcome> {
        self.step = Step::Idle;
        match result {
            Ok(established) => {
                // Bytes behind the proxy's 200 belong to the tunnel.
                let preread_server = established.leftovers;
                self.ready_to_shovel(established.link, preread_server).await
            }
            Err(error) => {
                self.saved_error = Some(Error::Tunneler(error));
                self.retry_or_bail("tunneler error").await
            }
        }
    }

    /// Commit: answer the client (when owed) and shovel until the tunnel
    /// ends.
    async fn ready_to_shovel(
        &mut self,
        server: Link,
        preread_server: Vec<u8>,
    ) -> Option<TunnelOutcome> {
        self.retriable = false;
        self.subscribed = false;
        let mut client = match self.client.take() {
            Some(client) => client,
            None => {
                return Some(TunnelOutcome::Refused { status: 500 });
            }
        };

        if self.client_expects_connect_response() {
            let stream = client.stream_mut();
            if let Err(error) = stream.write_all(CONNECTION_ESTABLISHED).await {
                tracing::debug!("writing 200 to the client failed: {}", error);
                return Some(TunnelOutcome::Refused { status: 500 });
            }
            if let Err(error) = stream.flush().await {
                tracing::debug!("flushing 200 to the client failed: {}", error);
                return Some(TunnelOutcome::Refused { status: 500 });
            }
        }

        let outcome = shovel(
            self.ctx.runtime(),
            client,
            server,
            std::mem::take(&mut self.preread_client),
            preread_server,
            self.ctx.config().read_idle_timeout,
            Arc::new(NoRateLimit),
        )
        .await;
        tracing::debug!(
            "tunnel moved {}+{} bytes{}",
            outcome.client_to_server,
            outcome.server_to_client,
            if outcome.timed_out { " (idle timeout)" } else { "" }
        );
        Some(TunnelOutcome::Tunneled(outcome))
    }

    /// The reason (if any) the transaction must not try another
    /// destination.
    fn check_retry(&self) -> Option<&'static str> {
        if self.ctx.is_shutting_down() {
            return Some("shutting down");
        }
        if !enough_time_to_reforward(
            self.ctx.opener_config().forward_timeout,
            self.start,
            self.ctx.runtime().now(),
        ) {
            return Some("forwarding timeout");
        }
        if !self.retriable {
            return Some("not retriable");
        }
        if self.client.is_none() {
            return Some("no connections");
        }
        None
    }

    /// Try another destination, wait for one, or answer the client with
    /// the saved error.
    async fn retry_or_bail(&mut self, context: &'static str) -> Option<TunnelOutcome> {
        // No TCP payload has reached the client or the server yet, so
        // other destinations (including alternate families) are fair.
        let bail_reason = self.check_retry();
        if bail_reason.is_none() {
            if !self.dests.with(|rp| rp.is_empty()) {
                self.start_connecting();
                return None;
            }
            if self.subscribed {
                tracing::trace!("waiting for more destinations to try");
                return None;
            }
        }

        tracing::debug!(
            "tunnel giving up ({}): {}",
            context,
            bail_reason.unwrap_or("no more destinations")
        );
        let error = self.saved_error.take().unwrap_or(Error::CannotForward);
        Some(self.send_error(error).await)
    }

    /// Send the request over the connection pinned to the client.
    async fn use_pinned(&mut self) -> Option<TunnelOutcome> {
        debug_assert!(self.dests.with(|rp| rp.is_empty()));
        self.destinations_found = true;
        match self.ctx.pinned().borrow_pinned(&self.request) {
            Ok(link) => {
                self.n_tries += 1;
                self.request.flags_mut().pinned = true;
                self.connect_done(link, true).await
            }
            Err(error) => {
                // A pinned-path failure is fatal; do not wait for more
                // paths.
                Some(self.send_error(Error::Pinned(error)).await)
            }
        }
    }

    /// Answer the client with an error (when it still expects one) and
    /// end the transaction.
    async fn send_error(&mut self, error: Error) -> TunnelOutcome {
        let status = error.http_status(self.request.flags().needs_validation);
        tracing::debug!("tunnel refused ({}): {}", error.kind(), error);
        self.subscribed = false;
        self.step = Step::Idle;

        if let Some(mut client) = self.client.take() {
            if self.client_expects_connect_response() {
                let page = self.ctx.renderer().render(&error, &self.request);
                let bytes = page.to_http();
                let stream = client.stream_mut();
                let _ = stream.write_all(&bytes).await;
                let _ = stream.flush().await;
            }
            // Dropping the client link closes it.
        }
        TunnelOutcome::Refused { status }
    }

    /// The timeout for a setup step, derived like a connect timeout.
    fn connecting_timeout(&self, profile: &ferry_peers::PathProfile) -> std::time::Duration {
        let config = self.ctx.opener_config();
        let configured = profile
            .peer()
            .map_or(config.connect_timeout, |peer| {
                peer.connect_timeout(config.connect_timeout)
            });
        let remaining = crate::util::forward_timeout(
            config.forward_timeout,
            self.start,
            self.ctx.runtime().now(),
        );
        configured
            .min(remaining)
            .max(std::time::Duration::from_secs(1))
    }
}
