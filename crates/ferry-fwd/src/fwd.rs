//! The per-transaction forwarding driver for ordinary (non-tunneled)
//! requests.

use std::sync::Arc;
use std::time::Instant;

use futures::FutureExt;
use futures::StreamExt;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use tor_rtcompat::{Runtime, SleepProvider};

use ferry_handshake::{
    Established, EncryptorAnswer, TlsError, TlsParams, TlsVariant, TunnelError, TunnelRequest,
};
use ferry_opener::{Answer, HappyConnOpener};
use ferry_peers::{
    DestinationEvent, Destinations, Link, Method, PathProfile, PathRef, RequestInfo, Scheme,
};

use crate::contract::ExchangeOutcome;
use crate::contract::StoreSink;
use crate::ctx::ForwardContext;
use crate::err::Error;
use crate::util::enough_time_to_reforward;

/// Reply statuses that justify trying the request against another
/// destination: the kind of server-side trouble a different path might
/// not have.
fn reforwardable_status(status: u16) -> bool {
    matches!(status, 403 | 405 | 410 | 500 | 501 | 502 | 503 | 504)
}

/// Transaction flags tracked by the driver.
#[derive(Debug, Default)]
struct FwdFlags {
    /// A transport connection was established at least once; affects
    /// whether non-replayable requests may be retried.
    connected_okay: bool,
    /// Retrying is forbidden, whatever else is true.
    dont_retry: bool,
    /// The final accounting has run.
    forward_completed: bool,
    /// Peer selection produced at least one candidate path.
    destinations_found: bool,
}

/// States of the reuse race: a persistent connection may have been
/// closed by the server just as we picked it up.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
enum PconnRace {
    /// The connection was fresh; no race is possible.
    Impossible,
    /// The connection was reused; a race may yet surface.
    Possible,
    /// The reused connection died without yielding a reply byte.
    Happened,
}

/// The one asynchronous sub-operation a driver waits on at a time.
enum Step {
    /// Nothing outstanding.
    Idle,
    /// Waiting for a transport connection (the opener).
    Transport(BoxFuture<'static, Answer>),
    /// Waiting for a CONNECT exchange through a parent proxy.
    PeerTunnel(BoxFuture<'static, Result<Established, TunnelError>>),
    /// Waiting for a TLS handshake.
    Encryption(BoxFuture<'static, Result<EncryptorAnswer, TlsError>>),
    /// Waiting for the dispatched protocol exchange.
    Dispatch(BoxFuture<'static, ExchangeOutcome>),
}

/// What a completed [`Step`] produced.
enum StepOutcome {
    /// The opener finished.
    Transport(Answer),
    /// The CONNECT exchange finished.
    Tunnel(Result<Established, TunnelError>),
    /// The TLS handshake finished.
    Encrypt(Result<EncryptorAnswer, TlsError>),
    /// The protocol exchange finished.
    Dispatch(ExchangeOutcome),
}

/// Await the active step, or forever when idle.
async fn step_outcome(step: &mut Step) -> StepOutcome {
    match step {
        Step::Idle => futures::future::pending().await,
        Step::Transport(fut) => StepOutcome::Transport(fut.await),
        Step::PeerTunnel(fut) => StepOutcome::Tunnel(fut.await),
        Step::Encryption(fut) => StepOutcome::Encrypt(fut.await),
        Step::Dispatch(fut) => StepOutcome::Dispatch(fut.await),
    }
}

/// Await the next selection event, or forever once unsubscribed.
async fn selection_event(
    stream: &mut BoxStream<'static, DestinationEvent>,
    subscribed: bool,
) -> Option<DestinationEvent> {
    if subscribed {
        stream.next().await
    } else {
        futures::future::pending().await
    }
}

/// The top-level forwarding state machine for one transaction.
///
/// Drives peer selection, opens (or reuses) a transport connection,
/// layers CONNECT and TLS as the route demands, dispatches the protocol
/// exchange, and applies retry and re-forwarding policy.  The driver owns
/// itself for its whole life: [`start`](Self::start) spawns it and it
/// runs to completion.
pub struct FwdState<R: Runtime> {
    /// Shared process state.
    ctx: Arc<ForwardContext<R>>,
    /// The store entry the reply is written into.
    entry: Arc<dyn StoreSink>,
    /// The request being forwarded.
    request: RequestInfo,
    /// When forwarding started (basis of the time budget).
    start: Instant,
    /// Forwarding attempts so far.
    n_tries: u32,
    /// Candidate paths, shared with the opener.
    dests: Arc<Destinations>,
    /// The selection receipt of the connection we are using, for
    /// reinstatement after a reuse race.
    dest_receipt: Option<PathRef>,
    /// The most recent unrecoverable (so far) error.
    err: Option<Error>,
    /// Transaction flags.
    flags: FwdFlags,
    /// Reuse-race state.
    pconn_race: PconnRace,
    /// Why we are sure the whole reply was stored, when we are.
    stored_whole: Option<&'static str>,
    /// Whether the selection subscription is still live.
    subscribed: bool,
    /// The single outstanding asynchronous sub-operation.
    step: Step,
    /// Set (with a reason) when the driver should wind down.
    finished: Option<&'static str>,
}

impl<R: Runtime> FwdState<R> {
    /// Initiate request forwarding; fire and forget.
    ///
    /// The driver completes the entry (with a reply or an error page) and
    /// goes away.
    pub fn start(ctx: Arc<ForwardContext<R>>, entry: Arc<dyn StoreSink>, request: RequestInfo) {
        use futures::task::SpawnExt as _;
        let runtime = ctx.runtime().clone();
        let _ignore = runtime.spawn(Self::run(ctx, entry, request));
    }

    /// Forward one request to completion.
    ///
    /// This is `start` without the spawn, for callers that want to await
    /// the transaction themselves.
    pub async fn run(
        ctx: Arc<ForwardContext<R>>,
        entry: Arc<dyn StoreSink>,
        request: RequestInfo,
    ) {
        entry.lock("FwdState");

        // Pre-start gates.
        if let Some(denied) = Self::pre_start_denial(&ctx, &entry, &request) {
            let page = ctx.renderer().render(&denied, &request);
            entry.append_error_page(page.status, page.body);
            entry.unlock("FwdState");
            return;
        }
        if request.flags().internal {
            ctx.diversions().internal_request(&request, &entry);
            entry.unlock("FwdState");
            return;
        }
        if request.scheme() == Scheme::Urn {
            ctx.diversions().urn_request(&request, &entry);
            entry.unlock("FwdState");
            return;
        }

        let start = ctx.runtime().now();
        tracing::debug!("forwarding {} {}", request.method(), request.authority());
        let mut state = FwdState {
            ctx,
            entry,
            request,
            start,
            n_tries: 0,
            dests: Arc::new(Destinations::new()),
            dest_receipt: None,
            err: None,
            flags: FwdFlags::default(),
            pconn_race: PconnRace::Impossible,
            stored_whole: None,
            subscribed: true,
            step: Step::Idle,
            finished: None,
        };
        state.forward().await;
        state.completed();
        state.entry.unlock("FwdState");
    }

    /// The denial (if any) that stops this transaction before any
    /// forwarding work.
    fn pre_start_denial(
        ctx: &Arc<ForwardContext<R>>,
        _entry: &Arc<dyn StoreSink>,
        request: &RequestInfo,
    ) -> Option<Error> {
        if let Some(acl) = &ctx.config().miss_access {
            let exempt = request.client_addr().is_none() || request.flags().internal;
            if !exempt && ctx.access().fast_check(acl, request).denied() {
                tracing::debug!("miss access forbidden for {}", request.authority());
                return Some(Error::Forbidden);
            }
        }
        if ctx.is_shutting_down() {
            return Some(Error::ShuttingDown);
        }
        None
    }

    /// The main event loop: selection events and step completions, until
    /// something finishes the transaction.
    async fn forward(&mut self) {
        let mut selection = self.ctx.selector().subscribe(&self.request);
        let mut abort = self.entry.wait_abort().fuse();

        while self.finished.is_none() {
            enum Ev {
                /// The store abandoned the entry.
                Abort,
                /// A peer-selection event (None: the stream ended).
                Selection(Option<DestinationEvent>),
                /// The active step completed.
                Step(StepOutcome),
            }

            let event = futures::select_biased! {
                () = abort => Ev::Abort,
                outcome = step_outcome(&mut self.step).fuse() => Ev::Step(outcome),
                ev = selection_event(&mut selection, self.subscribed).fuse() => Ev::Selection(ev),
            };

            match event {
                Ev::Abort => {
                    tracing::debug!("store entry aborted");
                    self.stop("store entry aborted");
                }
                Ev::Selection(Some(DestinationEvent::Path(path))) => self.note_destination(path),
                Ev::Selection(Some(DestinationEvent::UsePinned)) => self.use_pinned(),
                Ev::Selection(Some(DestinationEvent::End(selection_error))) => {
                    self.note_destinations_end(selection_error);
                }
                Ev::Selection(None) => self.note_destinations_end(None),
                Ev::Selection(Some(_)) => {}
                Ev::Step(StepOutcome::Transport(answer)) => self.note_connection(answer),
                Ev::Step(StepOutcome::Tunnel(result)) => self.tunnel_established(result),
                Ev::Step(StepOutcome::Encrypt(result)) => self.connected_to_peer(result),
                Ev::Step(StepOutcome::Dispatch(outcome)) => self.exchange_finished(outcome),
            }
        }
    }

    /// Whether a forwarding attempt to some selected destination is in
    /// progress, beyond merely opening a transport.
    fn transporting(&self) -> bool {
        matches!(
            self.step,
            Step::PeerTunnel(_) | Step::Encryption(_) | Step::Dispatch(_)
        )
    }

    /// End the transaction (final accounting happens in `completed`).
    fn stop(&mut self, reason: &'static str) {
        tracing::debug!("stopping forwarding: {}", reason);
        self.step = Step::Idle;
        self.subscribed = false;
        self.finished = Some(reason);
    }

    /// Remember `error` as the best explanation of the failure so far.
    fn fail(&mut self, error: Error) {
        tracing::debug!("forwarding problem ({}): {}", error.kind(), error);
        self.err = Some(error);
        self.dest_receipt = None;
    }

    /// A new candidate path arrived from peer selection.
    fn note_destination(&mut self, path: PathProfile) {
        self.flags.destinations_found = true;
        self.dests.with(|rp| rp.add(path));

        if matches!(self.step, Step::Transport(_)) {
            // The opener shares the list; just wake it.
            self.dests.note_change();
            return;
        }
        if self.transporting() {
            // Keep the path for a potential re-forwarding attempt.
            return;
        }
        self.use_destinations();
    }

    /// Peer selection is done producing paths.
    fn note_destinations_end(&mut self, selection_error: Option<ferry_peers::SelectionError>) {
        self.subscribed = false;
        self.dests.with(|rp| rp.finalize());

        if !self.flags.destinations_found {
            if let Some(error) = selection_error {
                debug_assert!(self.err.is_none());
                self.fail(Error::Selection(error));
            }
            self.stop("path selection found no paths");
            return;
        }
        // Finding at least one path means selection succeeded.
        debug_assert!(selection_error.is_none());

        if matches!(self.step, Step::Transport(_)) {
            self.dests.note_change();
            return; // and continue to wait for the opener's answer
        }
        if self.transporting() {
            return; // already using a connection; paths were backup
        }

        // We were waiting for more destinations, and none are coming.
        tracing::debug!("no more destinations after {} attempts", self.n_tries);
        if self.err.is_none() {
            self.fail(Error::CannotForward);
        }
        self.stop("all found paths have failed");
    }

    /// Pick the next move now that the destination list has changed.
    fn use_destinations(&mut self) {
        if !self.dests.with(|rp| rp.is_empty()) {
            self.connect_start();
            return;
        }
        if self.subscribed {
            tracing::trace!("waiting for more destinations to try");
            return; // expect a further selection event
        }
        if self.err.is_none() {
            self.fail(Error::CannotForward);
        }
        self.stop("tried all destinations");
    }

    /// Launch the connection opener over the current destination list.
    fn connect_start(&mut self) {
        debug_assert!(!self.request.flags().pinned);
        debug_assert!(!self.transporting());

        // Ditch any error from the previous attempt; a new one will be
        // made if there's another problem.
        self.err = None;

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
        opener.set_retriable(self.check_retriable());
        opener.allow_persistent(self.pconn_race != PconnRace::Happened);
        self.step = Step::Transport(Box::pin(opener.run()));
    }

    /// The opener reported an open connection, or final defeat.
    fn note_connection(&mut self, answer: Answer) {
        self.step = Step::Idle;
        debug_assert!(self.dest_receipt.is_none());
        self.update_attempts(answer.tries);

        match answer.outcome {
            Err(error) => {
                // The opener tried everything the list offered.
                self.flags.dont_retry = true;
                self.fail(Error::Connect(error));
                self.retry_or_bail();
            }
            Ok(reached) => {
                self.dest_receipt = Some(reached.receipt);
                let mut link = reached.link;
                if reached.reused {
                    self.pconn_race = PconnRace::Possible;
                    // Markings were chosen for some earlier transaction;
                    // recompute them for this one.
                    self.ctx.policy().prepare(&self.request, link.profile_mut());
                    self.dispatch(link);
                } else {
                    self.pconn_race = PconnRace::Impossible;
                    self.advance_destination(link);
                }
            }
        }
    }

    /// Choose the post-connect preparation step for a fresh connection.
    fn advance_destination(&mut self, link: Link) {
        if let Some(peer) = link.profile().peer().cloned() {
            let client_first_bump = self.request.flags().tls_bumped;
            // We need a CONNECT tunnel to carry encrypted traffic through
            // a proxy, but TLS inside TLS is unsupported, so HTTPS
            // proxies are excluded.
            let origin_wants_encrypted = self.request.method() == &Method::Connect
                || self.request.flags().tls_peek
                || client_first_bump;
            if origin_wants_encrypted && !peer.options().origin_server && peer.tls().is_none() {
                self.establish_tunnel_thru_proxy(link);
                return;
            }
        }
        self.secure_connection_if_needed(link);
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
    fn tunnel_established(&mut self, result: Result<Established, TunnelError>) {
        self.step = Step::Idle;
        match result {
            Ok(established) => {
                if !established.leftovers.is_empty() {
                    // TLS servers do not speak first; early bytes mean
                    // something is wrong on the other side.
                    tracing::warn!(
                        "server sent {} bytes before the tunnel was usable",
                        established.leftovers.len()
                    );
                    self.fail(Error::EarlyServerTalk);
                    self.retry_or_bail();
                    return;
                }
                self.secure_connection_if_needed(established.link);
            }
            Err(error) => {
                self.fail(Error::Tunneler(error));
                self.retry_or_bail();
            }
        }
    }

    /// Start the TLS handshake when the route requires one; dispatch
    /// otherwise.
    fn secure_connection_if_needed(&mut self, link: Link) {
        debug_assert!(!self.request.flags().pinned);
        let peer = link.profile().peer().cloned();
        let peer_wants_tls = peer.as_ref().is_some_and(|p| p.tls().is_some());
        // For CONNECT to an origin-mode peer, the requesting user agent
        // performs any TLS itself.
        let user_will_tls = peer.as_ref().is_some_and(|p| p.options().origin_server)
            && self.request.method() == &Method::Connect;
        let need_tls_to_peer = peer_wants_tls && !user_will_tls;

        let client_first_bump = self.request.flags().tls_bumped;
        let needs_bump = self.request.flags().tls_peek || client_first_bump;
        let need_tls_to_origin =
            peer.is_none() && self.request.scheme() == Scheme::Https && !client_first_bump;

        if need_tls_to_peer || need_tls_to_origin || needs_bump {
            self.secure_connection(link);
        } else {
            self.dispatch(link);
        }
    }

    /// Start the TLS handshake.
    fn secure_connection(&mut self, link: Link) {
        let mut params = match link.profile().peer() {
            Some(peer) => TlsParams::for_peer(peer, Some(self.request.host())),
            None => TlsParams::for_origin(self.request.host()),
        };
        if self.request.flags().tls_peek {
            if let Some(policy) = self.ctx.splice_policy() {
                params.variant = TlsVariant::Peeking(Arc::clone(policy));
            }
        }
        let timeout = self.connecting_timeout(link.profile());
        let securer = Arc::clone(self.ctx.securer());
        self.step = Step::Encryption(Box::pin(async move {
            securer.secure(link, params, timeout).await
        }));
    }

    /// The TLS handshake finished.
    fn connected_to_peer(&mut self, result: Result<EncryptorAnswer, TlsError>) {
        self.step = Step::Idle;
        match result {
            Ok(answer) if answer.tunneled => {
                // A tunneling driver took over forwarding; our part ends
                // here, successfully but with nothing stored.
                self.flags.dont_retry = true;
                self.entry.abort();
                self.stop("forwarding control passed to a tunnel");
            }
            Ok(answer) => match answer.link {
                Some(link) => self.dispatch(link),
                None => {
                    self.fail(Error::Internal(tor_error::internal!(
                        "encryptor answered with neither link nor tunnel"
                    )));
                    self.retry_or_bail();
                }
            },
            Err(error) => {
                self.fail(Error::Tls(error));
                self.retry_or_bail();
            }
        }
    }

    /// Hand the prepared connection to the protocol exchange.
    fn dispatch(&mut self, link: Link) {
        tracing::debug!("dispatching {} to {}", self.request.method(), link.profile());
        self.flags.connected_okay = true;
        let exchange = Arc::clone(self.ctx.exchange());
        let request = self.request.clone();
        let entry = Arc::clone(&self.entry);
        self.step = Step::Dispatch(Box::pin(async move {
            exchange.run(link, &request, &entry).await
        }));
    }

    /// The protocol exchange finished.
    fn exchange_finished(&mut self, outcome: ExchangeOutcome) {
        self.step = Step::Idle;
        match outcome {
            ExchangeOutcome::Completed {
                status,
                stored_whole,
                server,
            } => {
                self.ctx.stats().record(self.n_tries, status);
                self.stored_whole = stored_whole;
                if self.reforward(status) {
                    tracing::debug!("re-forwarding after status {}", status);
                    drop(server);
                    self.dest_receipt = None;
                    self.stored_whole = None;
                    self.entry.reset();
                    self.use_destinations();
                } else {
                    if let Some(server) = server {
                        self.pconn_push(server);
                    }
                    self.stop("forwarding completed");
                }
            }
            ExchangeOutcome::ServerClosed => {
                if self.entry.is_empty() && self.pconn_race == PconnRace::Possible {
                    // The server closed its end of a reused connection
                    // before yielding a byte: the classic reuse race.
                    // The destination itself is fine; put it back.
                    tracing::debug!("persistent-connection race happened");
                    self.pconn_race = PconnRace::Happened;
                    if let Some(receipt) = self.dest_receipt.take() {
                        let _ = self.dests.with(|rp| rp.reinstate(&receipt));
                    }
                }
                self.fail(Error::ServerClosedEarly);
                self.retry_or_bail();
            }
            ExchangeOutcome::Aborted => {
                self.stop("dispatched activity aborted");
            }
        }
    }

    /// Deposit a still-usable server connection for reuse.
    fn pconn_push(&self, link: Link) {
        self.ctx.pool().push(link, Some(self.request.host()));
    }

    /// Retry against another destination, or finish with the saved error.
    fn retry_or_bail(&mut self) {
        if self.check_retry() {
            tracing::debug!("re-forwarding ({} tries so far)", self.n_tries);
            self.use_destinations();
            return;
        }
        if self.ctx.is_shutting_down() && self.err.is_none() && self.entry.is_empty() {
            self.fail(Error::ShuttingDown);
        }
        self.stop("cannot retry");
    }

    /// Whether the request should be retried after a connection-level
    /// failure.
    fn check_retry(&self) -> bool {
        if self.ctx.is_shutting_down() {
            return false;
        }
        if !self.entry.is_pending() {
            return false;
        }
        if !self.entry.is_empty() {
            return false;
        }
        if self.exhausted_tries() {
            return false;
        }
        if self.request.flags().pinned && !self.pinned_can_retry() {
            return false;
        }
        if !self.enough_time_left() {
            return false;
        }
        if self.flags.dont_retry {
            return false;
        }
        if self.request.flags().body_consumed {
            return false;
        }
        if !self.flags.connected_okay {
            // Not yet actually connected anywhere; retry is safe.
            return true;
        }
        self.check_retriable()
    }

    /// Whether this request may be sent again at all.
    fn check_retriable(&self) -> bool {
        // A body that is streamed cannot be replayed on another
        // connection once any of it may have been consumed.
        if self.request.flags().has_body {
            return false;
        }
        self.request.method().is_http_safe() || self.request.method().is_idempotent()
    }

    /// Whether a failed pinned connection may be replaced.
    fn pinned_can_retry(&self) -> bool {
        debug_assert!(self.request.flags().pinned);
        // A reuse race on a pinned connection cannot be retried: there is
        // no way to re-open somebody else's connection.
        if self.pconn_race == PconnRace::Happened {
            return false;
        }
        // A bumped-and-pinned connection gave the client our TLS peer
        // details; we cannot guarantee a replacement keeps them.
        if self.request.flags().tls_bumped {
            return false;
        }
        true
    }

    /// Whether a completed exchange should be re-run against another
    /// destination.
    fn reforward(&self, status: u16) -> bool {
        if self.entry.is_aborted() {
            return false;
        }
        if !self.entry.is_pending() {
            return false;
        }
        if self.stored_whole.is_some() {
            return false;
        }
        if self.request.flags().pinned && !self.pinned_can_retry() {
            return false;
        }
        if self.exhausted_tries() {
            return false;
        }
        if self.request.flags().body_consumed {
            return false;
        }
        if self.dests.with(|rp| rp.is_empty()) && !self.subscribed {
            tracing::debug!("no alternative forwarding paths left");
            return false;
        }
        reforwardable_status(status)
    }

    /// Whether the attempt budget is spent.
    fn exhausted_tries(&self) -> bool {
        self.n_tries >= self.ctx.opener_config().max_tries
    }

    /// Whether the time budget leaves room for another attempt.
    fn enough_time_left(&self) -> bool {
        enough_time_to_reforward(
            self.ctx.opener_config().forward_timeout,
            self.start,
            self.ctx.runtime().now(),
        )
    }

    /// Raise the attempt counter to `tries` (it never decreases).
    fn update_attempts(&mut self, tries: u32) {
        self.n_tries = self.n_tries.max(tries);
        tracing::trace!("attempts: {}", self.n_tries);
    }

    /// The timeout for a post-connect preparation step, derived the same
    /// way as a connect timeout.
    fn connecting_timeout(&self, profile: &PathProfile) -> std::time::Duration {
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

    /// Send the request over the connection pinned to the client.
    fn use_pinned(&mut self) {
        // PINNED must be the first and only destination, so it cannot
        // clash with an earlier forwarding attempt.
        debug_assert!(self.dests.with(|rp| rp.is_empty()));
        self.flags.destinations_found = true;
        match self.ctx.pinned().borrow_pinned(&self.request) {
            Ok(link) => {
                self.update_attempts(self.n_tries + 1);
                self.request.flags_mut().pinned = true;
                // The server may close the pinned connection before this
                // request; treat it like a reused connection.
                self.pconn_race = PconnRace::Possible;
                self.dispatch(link);
            }
            Err(error) => {
                // Connection managers close from-client connections when
                // their pinned to-server connection dies; retrying here
                // is futile.
                self.fail(Error::Pinned(error));
                self.stop("pinned connection failure");
            }
        }
    }

    /// Final accounting: finish the entry with the reply, or with an
    /// error page.
    fn completed(&mut self) {
        if self.flags.forward_completed {
            tracing::warn!("completed() called twice on one transaction");
            return;
        }
        self.flags.forward_completed = true;

        if self.entry.is_aborted() {
            return;
        }
        if !self.entry.is_pending() {
            return;
        }
        if self.entry.is_empty() {
            if self.err.is_none() {
                // We quit (e.g., the server connection closed) before
                // either an error or any content.
                self.err = Some(Error::ServerClosedEarly);
            }
            let error = self
                .err
                .take()
                .unwrap_or(Error::CannotForward);
            let page = self.ctx.renderer().render(&error, &self.request);
            tracing::debug!(
                "finishing {} with an error page: {} ({})",
                self.request.authority(),
                page.status,
                error.kind()
            );
            self.entry.append_error_page(page.status, page.body);
        } else if let Some(reason) = self.stored_whole {
            self.entry.complete_successfully(reason);
        } else {
            self.entry.complete_truncated("forwarding ended early");
        }
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::bool_assert_comparison)]
    #![allow(clippy::clone_on_copy)]
    #![allow(clippy::dbg_macro)]
    #![allow(clippy::mixed_attributes_style)]
    #![allow(clippy::print_stderr)]
    #![allow(clippy::print_stdout)]
    #![allow(clippy::single_char_pattern)]
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::unchecked_duration_subtraction)]
    #![allow(clippy::useless_vec)]
    #![allow(clippy::needless_pass_by_value)]

    use super::*;
    use crate::testing::{
        OnePinned, RigSpec, get_request, listen, paired_link, path_event, rig,
    };
    use ferry_peers::SelectionError;
    use ferry_peers::access::Decision;
    use std::sync::atomic::Ordering;
    use tor_rtmock::MockRuntime;

    #[test]
    fn forwards_and_completes() {
        MockRuntime::test_with_various(|rt| async move {
            let rig = rig(
                &rt,
                RigSpec {
                    events: vec![path_event("192.0.2.80:80"), DestinationEvent::End(None)],
                    script: vec![ExchangeOutcome::Completed {
                        status: 200,
                        stored_whole: Some("all stored"),
                        server: None,
                    }],
                    ..RigSpec::default()
                },
            );
            listen(&rig.network, &rt, "192.0.2.80:80").await;

            FwdState::run(Arc::clone(&rig.ctx), rig.store.clone(), get_request()).await;

            let state = rig.store.state.lock().unwrap();
            assert_eq!(state.completed, Some(("all stored", true)));
            assert!(state.error_page.is_none());
            assert_eq!(state.locks, 0);
            assert_eq!(rig.exchange.calls.load(Ordering::SeqCst), 1);
            assert_eq!(rig.ctx.stats().counts(200)[1], 1);
        });
    }

    #[test]
    fn reforwards_on_bad_gateway() {
        MockRuntime::test_with_various(|rt| async move {
            let rig = rig(
                &rt,
                RigSpec {
                    events: vec![
                        path_event("192.0.2.81:80"),
                        path_event("192.0.2.82:80"),
                        DestinationEvent::End(None),
                    ],
                    script: vec![
                        ExchangeOutcome::Completed {
                            status: 502,
                            stored_whole: None,
                            server: None,
                        },
                        ExchangeOutcome::Completed {
                            status: 200,
                            stored_whole: Some("second peer answered"),
                            server: None,
                        },
                    ],
                    ..RigSpec::default()
                },
            );
            listen(&rig.network, &rt, "192.0.2.81:80").await;
            listen(&rig.network, &rt, "192.0.2.82:80").await;

            FwdState::run(Arc::clone(&rig.ctx), rig.store.clone(), get_request()).await;

            let state = rig.store.state.lock().unwrap();
            assert_eq!(state.resets, 1);
            assert_eq!(state.completed, Some(("second peer answered", true)));
            assert_eq!(rig.exchange.calls.load(Ordering::SeqCst), 2);
            // The 502 came from attempt 1, the 200 from attempt 2.
            assert_eq!(rig.ctx.stats().counts(502)[1], 1);
            assert_eq!(rig.ctx.stats().counts(200)[2], 1);
        });
    }

    #[test]
    fn connect_failure_renders_error_page() {
        MockRuntime::test_with_various(|rt| async move {
            let rig = rig(
                &rt,
                RigSpec {
                    // Nothing listens here; connects fail fast.
                    events: vec![path_event("192.0.2.83:80"), DestinationEvent::End(None)],
                    ..RigSpec::default()
                },
            );

            FwdState::run(Arc::clone(&rig.ctx), rig.store.clone(), get_request()).await;

            let state = rig.store.state.lock().unwrap();
            let (status, _body) = state.error_page.clone().expect("error page expected");
            assert_eq!(status, 503);
            assert!(state.completed.is_none());
            assert_eq!(rig.exchange.calls.load(Ordering::SeqCst), 0);
        });
    }

    #[test]
    fn pinned_connection_is_used_directly() {
        MockRuntime::test_with_various(|rt| async move {
            let mut spec = RigSpec {
                events: vec![DestinationEvent::UsePinned, DestinationEvent::End(None)],
                script: vec![ExchangeOutcome::Completed {
                    status: 200,
                    stored_whole: Some("pinned reply"),
                    server: None,
                }],
                ..RigSpec::default()
            };
            let (link, _theirs) = paired_link(&rt);
            spec.pinned = Some(OnePinned::new(link));
            let rig = rig(&rt, spec);

            FwdState::run(Arc::clone(&rig.ctx), rig.store.clone(), get_request()).await;

            let state = rig.store.state.lock().unwrap();
            assert_eq!(state.completed, Some(("pinned reply", true)));
            assert_eq!(rig.exchange.calls.load(Ordering::SeqCst), 1);
        });
    }

    #[test]
    fn pinned_failure_is_never_retried() {
        MockRuntime::test_with_various(|rt| async move {
            let rig = rig(
                &rt,
                RigSpec {
                    // NoPinned always fails; the path behind it must not
                    // be attempted.
                    events: vec![DestinationEvent::UsePinned, DestinationEvent::End(None)],
                    ..RigSpec::default()
                },
            );

            FwdState::run(Arc::clone(&rig.ctx), rig.store.clone(), get_request()).await;

            let state = rig.store.state.lock().unwrap();
            let (status, _body) = state.error_page.clone().expect("error page expected");
            assert_eq!(status, 502);
            assert_eq!(rig.exchange.calls.load(Ordering::SeqCst), 0);
        });
    }

    #[test]
    fn miss_access_denial_forbids_forwarding() {
        MockRuntime::test_with_various(|rt| async move {
            let rig = rig(
                &rt,
                RigSpec {
                    events: vec![path_event("192.0.2.80:80"), DestinationEvent::End(None)],
                    miss_access: Some("miss".into()),
                    access: Decision::Denied,
                    ..RigSpec::default()
                },
            );

            FwdState::run(Arc::clone(&rig.ctx), rig.store.clone(), get_request()).await;

            let state = rig.store.state.lock().unwrap();
            let (status, _body) = state.error_page.clone().expect("error page expected");
            assert_eq!(status, 403);
            assert_eq!(rig.exchange.calls.load(Ordering::SeqCst), 0);
        });
    }

    #[test]
    fn selection_failure_is_reported() {
        MockRuntime::test_with_various(|rt| async move {
            let rig = rig(
                &rt,
                RigSpec {
                    events: vec![DestinationEvent::End(Some(SelectionError::new(
                        "no usable parents",
                    )))],
                    ..RigSpec::default()
                },
            );

            FwdState::run(Arc::clone(&rig.ctx), rig.store.clone(), get_request()).await;

            let state = rig.store.state.lock().unwrap();
            let (status, _body) = state.error_page.clone().expect("error page expected");
            assert_eq!(status, 500);
        });
    }

    #[test]
    fn shutdown_refuses_new_transactions() {
        MockRuntime::test_with_various(|rt| async move {
            let rig = rig(
                &rt,
                RigSpec {
                    events: vec![path_event("192.0.2.80:80"), DestinationEvent::End(None)],
                    ..RigSpec::default()
                },
            );
            rig.ctx.begin_shutdown();

            FwdState::run(Arc::clone(&rig.ctx), rig.store.clone(), get_request()).await;

            let state = rig.store.state.lock().unwrap();
            let (status, _body) = state.error_page.clone().expect("error page expected");
            assert_eq!(status, 503);
        });
    }

    #[test]
    fn reuse_race_reinstates_and_retries_fresh() {
        MockRuntime::test_with_various(|rt| async move {
            let rig = rig(
                &rt,
                RigSpec {
                    events: vec![path_event("192.0.2.84:80"), DestinationEvent::End(None)],
                    script: vec![
                        // The reused connection dies without a byte...
                        ExchangeOutcome::ServerClosed,
                        // ...and the fresh retry succeeds.
                        ExchangeOutcome::Completed {
                            status: 200,
                            stored_whole: Some("fresh retry"),
                            server: None,
                        },
                    ],
                    ..RigSpec::default()
                },
            );
            listen(&rig.network, &rt, "192.0.2.84:80").await;

            // Seed the pool so the first attempt is a reuse.
            let profile = ferry_peers::PathProfile::direct("192.0.2.84:80".parse().unwrap());
            let (idle, _their_end) = paired_link(&rt);
            let idle = Link::new(
                profile.clone(),
                idle.into_parts().1,
                rig.ctx.runtime().now(),
            );
            rig.ctx.pool().push(idle, Some("origin.example.net"));

            FwdState::run(Arc::clone(&rig.ctx), rig.store.clone(), get_request()).await;

            let state = rig.store.state.lock().unwrap();
            assert_eq!(state.completed, Some(("fresh retry", true)));
            assert_eq!(rig.exchange.calls.load(Ordering::SeqCst), 2);
            // The retry opened fresh: the pool was not consulted again,
            // and the raced path was reinstated for it.
            assert_eq!(rig.ctx.pool().count(), 0);
        });
    }

    #[test]
    fn reforwardable_statuses() {
        for status in [403, 405, 410, 500, 501, 502, 503, 504] {
            assert!(reforwardable_status(status), "{status}");
        }
        for status in [200, 204, 301, 304, 400, 401, 404, 429] {
            assert!(!reforwardable_status(status), "{status}");
        }
    }
}
