//! The dual-track (prime/spare) connection opener.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use futures::StreamExt;
use futures::channel::oneshot;
use futures::future::{BoxFuture, Fuse};
use safelog::{Sensitive, sensitive};
use tor_rtcompat::{NetStreamProvider, Runtime, SleepProvider, SleepProviderExt};

use ferry_pconn::PconnPool;
use ferry_peers::{Destinations, Link, PathProfile, PathRef, RequestInfo, WirePolicy};

use crate::config::OpenerConfig;
use crate::gates::{OpenerGates, SpareAllowance};

/// The floor on connect timeouts once a call is actually placed.
const MIN_CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

/// The final result of one opener run.
#[derive(Debug)]
#[non_exhaustive]
pub struct Answer {
    /// An open connection, or the reason there is none.
    pub outcome: Result<Reached, OpenerError>,
    /// Total connection attempts, counting reuses and any prior attempts
    /// supplied at construction.
    pub tries: u32,
}

/// A usable connection produced by the opener.
#[derive(Debug)]
#[non_exhaustive]
pub struct Reached {
    /// The open, ready-to-use connection.
    pub link: Link,
    /// The selection receipt: which candidate this is, and where it sat
    /// in the destination list (for a later reinstatement by the caller).
    pub receipt: PathRef,
    /// Whether the connection was opened earlier, by or for somebody else.
    pub reused: bool,
}

/// Why the opener could not produce a connection.
#[derive(Debug, Clone, thiserror::Error)]
#[non_exhaustive]
pub enum OpenerError {
    /// The destination list ended without ever yielding a usable path.
    #[error("no forwarding paths found")]
    NoPathsFound,

    /// The per-transaction attempt budget is spent.
    #[error("ran out of connection attempts after {tries} tries")]
    TriesExhausted {
        /// How many attempts were made.
        tries: u32,
    },

    /// The per-transaction time budget is spent.
    #[error("forwarding budget expired while connecting")]
    BudgetExpired,

    /// The last attempt timed out.
    #[error("connect to {peer} timed out")]
    ConnectTimeout {
        /// The destination of the attempt.
        peer: Sensitive<SocketAddr>,
    },

    /// The last attempt failed at the transport layer.
    #[error("connect to {peer} failed")]
    ConnectFailed {
        /// The destination of the attempt.
        peer: Sensitive<SocketAddr>,
        /// What went wrong.
        #[source]
        source: Arc<std::io::Error>,
    },
}

impl OpenerError {
    /// The HTTP status an error page for this failure should use.
    ///
    /// Failed validations answer 504 per RFC 9111; everything else is a
    /// generic 503.
    pub fn http_status(&self, needs_validation: bool) -> u16 {
        if needs_validation { 504 } else { 503 }
    }
}

/// How one attempt ended, before translation into an [`OpenerError`].
#[derive(Debug)]
enum AttemptError {
    /// The connect timed out.
    TimedOut,
    /// The connect failed.
    Io(Arc<std::io::Error>),
}

impl AttemptError {
    /// Translate into the public error type.
    fn into_opener_error(self, peer: SocketAddr) -> OpenerError {
        match self {
            AttemptError::TimedOut => OpenerError::ConnectTimeout {
                peer: sensitive(peer),
            },
            AttemptError::Io(source) => OpenerError::ConnectFailed {
                peer: sensitive(peer),
                source,
            },
        }
    }
}

/// Which track an attempt runs on.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
enum Track {
    /// The first-tried address family for the current peer.
    Prime,
    /// The other address family for the same peer.
    Spare,
}

/// A connection opening attempt in progress.
struct Attempt {
    /// The destination being attempted.
    path: PathRef,
    /// The pending connect.
    fut: Fuse<BoxFuture<'static, Result<Link, AttemptError>>>,
}

/// Why the spare track is currently paused.
///
/// The variants are mutually exclusive wait reasons; `Idle` means the
/// spare track is free to act.
enum SpareWait<R: Runtime> {
    /// Not waiting.
    Idle,
    /// Honoring the prime head start (once per current peer).  A prime
    /// connection failure ends this wait.
    GivePrimeChance(oneshot::Receiver<()>),
    /// Waiting for the spare gap/cap gate (one allowance per spare path).
    /// Prime exhaustion ends this wait.
    ForSpareAllowance(oneshot::Receiver<SpareAllowance<R>>),
    /// Concurrent spares are prohibited; waiting for the primes to fail.
    ForPrimesToFail,
    /// The current peer has no spares left to try; waiting for the
    /// current peer to change.
    ForNewPeer,
}

impl<R: Runtime> SpareWait<R> {
    /// Whether any wait reason is in force.
    fn is_active(&self) -> bool {
        !matches!(self, SpareWait::Idle)
    }
}

/// Which budget ran out first.
#[derive(Debug, Clone, Copy)]
enum RanOut {
    /// `max_tries` attempts have been made.
    Tries,
    /// The forwarding time budget is spent.
    Time,
}

/// What woke the opener's main loop.
enum Wake<R: Runtime> {
    /// The prime attempt finished.
    Prime(Result<Link, AttemptError>),
    /// The spare attempt finished.
    Spare(Result<Link, AttemptError>),
    /// The prime head start elapsed.
    PrimeChance,
    /// The allowance gate answered (None: the gate went away).
    Allowance(Option<SpareAllowance<R>>),
    /// The destination list changed.
    Changed,
}

/// A TCP connection opening algorithm based on Happy Eyeballs (RFC 8305).
///
/// Maintains two concurrent connection opening tracks, prime and spare,
/// over a destination list shared with the initiator (which may keep
/// appending to it).  Run it with [`run`](Self::run); cancel it by
/// dropping the future, which aborts both tracks and returns any spare
/// allowance to the gate.
pub struct HappyConnOpener<R: Runtime> {
    /// Runtime for connecting and timing.
    runtime: R,
    /// Shared opener configuration.
    config: Arc<OpenerConfig>,
    /// The process-wide pacing gates.
    gates: Arc<OpenerGates<R>>,
    /// The persistent-connection pool consulted before fresh opens.
    pool: Arc<PconnPool<R>>,
    /// Policy applied to fresh outgoing connections.
    policy: Arc<WirePolicy>,
    /// Candidate paths, shared with the initiator.
    destinations: Arc<Destinations>,
    /// The request that needs a to-server connection.
    cause: RequestInfo,
    /// Origin server domain name (or equivalent), for pool matching.
    host: Option<String>,
    /// When the whole forwarding effort started.
    fwd_start: Instant,
    /// Whether persistent connections may be reused.
    allow_pconn: bool,
    /// Whether the request may be resent if things go wrong.
    retriable: bool,
    /// Finished attempts, including reuses and prior attempts supplied by
    /// the initiator.
    n_tries: u32,

    /// The peer-and-family selection we are currently working on.
    current_peer: Option<PathProfile>,
    /// The prime-track attempt, if one is in flight.
    prime: Option<Attempt>,
    /// The spare-track attempt, if one is in flight.
    spare: Option<Attempt>,
    /// Why the spare track is paused.
    spare_wait: SpareWait<R>,
    /// The allowance licensing the in-flight spare attempt.
    got_allowance: Option<SpareAllowance<R>>,
    /// Whether spare attempts disregard pacing and caps.
    ignore_spare_restrictions: bool,
    /// When the first attempt for the current peer started.
    prime_start: Instant,
    /// The most recent attempt failure.
    last_error: Option<OpenerError>,
    /// Latched when the time or attempt budget first ran out.
    ran_out: Option<RanOut>,
}

impl<R: Runtime> HappyConnOpener<R> {
    /// Construct an opener over `destinations` for `cause`.
    ///
    /// `fwd_start` is the initiator's start time (the basis of the time
    /// budget) and `tries` the attempts it has already made.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        runtime: &R,
        config: Arc<OpenerConfig>,
        gates: Arc<OpenerGates<R>>,
        pool: Arc<PconnPool<R>>,
        policy: Arc<WirePolicy>,
        destinations: Arc<Destinations>,
        cause: RequestInfo,
        fwd_start: Instant,
        tries: u32,
    ) -> Self {
        let now = runtime.now();
        HappyConnOpener {
            runtime: runtime.clone(),
            config,
            gates,
            pool,
            policy,
            destinations,
            cause,
            host: None,
            fwd_start,
            allow_pconn: true,
            retriable: true,
            n_tries: tries,
            current_peer: None,
            prime: None,
            spare: None,
            spare_wait: SpareWait::Idle,
            got_allowance: None,
            ignore_spare_restrictions: false,
            prime_start: now,
            last_error: None,
            ran_out: None,
        }
    }

    /// Configure reuse of old connections.
    pub fn allow_persistent(&mut self, permitted: bool) {
        self.allow_pconn = permitted;
    }

    /// Configure whether the request may be retried later if things go
    /// wrong.
    pub fn set_retriable(&mut self, retriable: bool) {
        self.retriable = retriable;
    }

    /// Configure the origin server domain name.
    pub fn set_host(&mut self, host: impl Into<String>) {
        self.host = Some(host.into());
    }

    /// Open (or reuse) one connection, or report why we cannot.
    pub async fn run(mut self) -> Answer {
        let mut changes = self.destinations.watch().fuse();
        loop {
            if let Some(answer) = self.schedule() {
                return answer;
            }

            let wake: Wake<R> = futures::select_biased! {
                result = track(&mut self.prime).fuse() => Wake::Prime(result),
                result = track(&mut self.spare).fuse() => Wake::Spare(result),
                wake = wait(&mut self.spare_wait).fuse() => wake,
                _generation = changes.next() => Wake::Changed,
            };

            match wake {
                Wake::Prime(result) => {
                    let attempt = match self.prime.take() {
                        Some(a) => a,
                        None => continue,
                    };
                    if let Some(answer) = self.attempt_done(Track::Prime, attempt, result) {
                        return answer;
                    }
                }
                Wake::Spare(result) => {
                    let attempt = match self.spare.take() {
                        Some(a) => a,
                        None => continue,
                    };
                    if let Some(answer) = self.attempt_done(Track::Spare, attempt, result) {
                        return answer;
                    }
                }
                Wake::PrimeChance => {
                    // The prime had its chance; the next scheduling pass
                    // may start a spare.
                    self.spare_wait = SpareWait::Idle;
                }
                Wake::Allowance(Some(allowance)) => {
                    self.spare_wait = SpareWait::Idle;
                    if let Some(answer) = self.spare_allowance_granted(allowance) {
                        return answer;
                    }
                }
                Wake::Allowance(None) => {
                    // The gate disappeared; treat as a plain wakeup.
                    self.spare_wait = SpareWait::Idle;
                }
                Wake::Changed => {}
            }
        }
    }

    /// One synchronous scheduling pass.
    ///
    /// Called whenever an external event may have changed initiator
    /// interest, destinations, prime, spare, or the spare wait.  Leaves
    /// the opener in one of its stable states, or returns the final
    /// answer:
    ///
    /// 1. Working on a single peer: connecting on at least one track, or
    ///    paused waiting for a spare permission or more paths.
    /// 2. Waiting for a new peer: destinations empty but not final.
    /// 3. Finished: destinations empty and final (or budgets spent).
    fn schedule(&mut self) -> Option<Answer> {
        if self.ran_out() {
            if self.prime.is_some() || self.spare.is_some() {
                // In-flight attempts may still succeed; start nothing new.
                return None;
            }
            return Some(self.failure());
        }

        // Update stale current peer and/or stale spare wait.
        if let Some(current) = self.current_peer.clone() {
            let tracks_idle = self.prime.is_none() && self.spare.is_none();
            if tracks_idle && self.destinations.with(|rp| rp.done_with_peer(&current)) {
                tracing::trace!("done with peer {}", current);
                self.spare_wait = SpareWait::Idle;
                self.current_peer = None;
                self.ignore_spare_restrictions = false;
                debug_assert!(self.got_allowance.is_none());
            } else if self.spare_wait.is_active()
                && !matches!(self.spare_wait, SpareWait::ForNewPeer)
                && self.destinations.with(|rp| rp.done_with_spares(&current))
            {
                tracing::trace!("no spares are coming for {}", current);
                self.spare_wait = SpareWait::ForNewPeer;
            }
        }

        // Open a new prime and/or a new spare connection if needed.
        if !self.destinations.with(|rp| rp.is_empty()) {
            if self.current_peer.is_none() {
                let new_prime = self.destinations.with(|rp| rp.extract_front());
                let new_prime = match new_prime {
                    Ok(path) => path,
                    Err(bug) => {
                        // "Non-empty list with nothing to extract" cannot
                        // happen; treat it as an empty list.
                        tracing::warn!("path extraction failed: {}", bug);
                        return None;
                    }
                };
                self.current_peer = Some(new_prime.profile().clone_profile());
                tracing::debug!("new peer {}", new_prime.profile());
                self.prime_start = self.runtime.now();
                if let Some(answer) = self.start_connecting(Track::Prime, new_prime) {
                    return Some(answer);
                }
                self.maybe_give_prime_its_chance();
            } else if self.prime.is_none() {
                if let Some(answer) = self.maybe_open_another_prime() {
                    return Some(answer);
                }
            }

            if self.spare.is_none() && !self.spare_wait.is_active() {
                if let Some(answer) = self.maybe_open_spare() {
                    return Some(answer);
                }
            }
        }

        if self.current_peer.is_some() {
            return None; // connecting or paused
        }
        if !self.destinations.with(|rp| rp.finalized()) {
            tracing::trace!("waiting for more peers");
            return None;
        }
        tracing::debug!("done; no more peers");
        Some(self.failure())
    }

    /// Start opening (or reusing) a connection to `dest` on `track`.
    ///
    /// Returns the final answer when the attempt completed synchronously
    /// through persistent-connection reuse.
    fn start_connecting(&mut self, track: Track, dest: PathRef) -> Option<Answer> {
        let bump_through_peer =
            self.cause.flags().tls_bumped && dest.profile().peer().is_some();
        if self.allow_pconn && !bump_through_peer {
            if let Some(mut link) =
                self.pool
                    .pop(dest.profile(), self.host.as_deref(), self.retriable)
            {
                self.n_tries += 1;
                if track == Track::Spare {
                    if let Some(allowance) = self.got_allowance.take() {
                        allowance.mark_used();
                    }
                }
                ferry_peers::ResolvedPeers::retag_standby(link.profile_mut());
                return Some(self.success(link, dest, true));
            }
        }
        self.open_fresh_connection(track, dest);
        None
    }

    /// Open a fresh connection to `dest` on `track`.
    fn open_fresh_connection(&mut self, track: Track, dest: PathRef) {
        self.n_tries += 1;
        let mut profile = dest.profile().clone_profile();
        self.policy.prepare(&self.cause, &mut profile);
        let timeout = self.connect_timeout_for(&profile);
        tracing::debug!("opening {:?} connection to {}", track, profile);
        let fut = connect_future(self.runtime.clone(), profile, timeout).fuse();
        let attempt = Attempt { path: dest, fut };
        match track {
            Track::Prime => self.prime = Some(attempt),
            Track::Spare => self.spare = Some(attempt),
        }
    }

    /// The connect timeout for one attempt: the per-peer timeout capped
    /// by the remaining forwarding budget, but at least one second.
    fn connect_timeout_for(&self, profile: &PathProfile) -> Duration {
        let configured = profile
            .peer()
            .map_or(self.config.connect_timeout, |peer| {
                peer.connect_timeout(self.config.connect_timeout)
            });
        configured
            .min(self.forward_budget_left())
            .max(MIN_CONNECT_TIMEOUT)
    }

    /// Wall-clock budget still available to this transaction.
    fn forward_budget_left(&self) -> Duration {
        let spent = self
            .runtime
            .now()
            .saturating_duration_since(self.fwd_start);
        self.config.forward_timeout.saturating_sub(spent)
    }

    /// Check (and latch) the time and attempt budgets.
    fn ran_out(&mut self) -> bool {
        if self.ran_out.is_some() {
            return true;
        }
        if self.n_tries >= self.config.max_tries {
            tracing::debug!("maximum allowed tries exhausted");
            self.ran_out = Some(RanOut::Tries);
            return true;
        }
        if self.forward_budget_left() == Duration::ZERO {
            tracing::debug!("forwarding timeout");
            self.ran_out = Some(RanOut::Time);
            return true;
        }
        false
    }

    /// React to a finished attempt on `track`.
    fn attempt_done(
        &mut self,
        track: Track,
        attempt: Attempt,
        result: Result<Link, AttemptError>,
    ) -> Option<Answer> {
        if track == Track::Spare {
            if let Some(allowance) = self.got_allowance.take() {
                allowance.mark_used();
            }
        }
        match result {
            Ok(link) => Some(self.success(link, attempt.path, false)),
            Err(error) => {
                tracing::debug!("{:?} connection to {} failed", track, attempt.path);
                if let Some(peer) = attempt.path.profile().peer() {
                    peer.health().note_failure();
                }
                self.last_error =
                    Some(error.into_opener_error(attempt.path.profile().remote()));
                if self.spare_wait.is_active() {
                    self.update_spare_wait_after_prime_failure();
                }
                None
            }
        }
    }

    /// React to a prime attempt failure while the spare track waits.
    fn update_spare_wait_after_prime_failure(&mut self) {
        let Some(current) = self.current_peer.clone() else {
            return;
        };
        let no_primes_left = self.destinations.with(|rp| !rp.have_prime(&current));
        if no_primes_left {
            // The next spare attempt skips all pacing and caps.
            tracing::debug!("all primes failed for {}", current);
            self.spare_wait = SpareWait::Idle;
            self.ignore_spare_restrictions = true;
            return;
        }
        if matches!(self.spare_wait, SpareWait::GivePrimeChance(_)) {
            // Another prime may still succeed, but this failure ends the
            // head start.
            self.spare_wait = SpareWait::Idle;
        }
        // ForSpareAllowance and ForPrimesToFail stay in force.
    }

    /// Start a prime attempt if a prime path is available.
    fn maybe_open_another_prime(&mut self) -> Option<Answer> {
        let current = self.current_peer.clone()?;
        let dest = self.destinations.with(|rp| rp.extract_prime(&current))?;
        self.start_connecting(Track::Prime, dest)
        // else wait for more prime paths or their exhaustion
    }

    /// Start waiting for a spare permission, if spares may be possible.
    fn maybe_give_prime_its_chance(&mut self) {
        let Some(current) = self.current_peer.clone() else {
            return;
        };
        debug_assert!(!self.spare_wait.is_active());

        if self.destinations.with(|rp| rp.done_with_spares(&current)) {
            tracing::trace!("no spares for {}", current);
            self.spare_wait = SpareWait::ForNewPeer;
            return;
        }
        if self.config.spare_limit_reached(0) {
            // A zero limit prohibits concurrent spares outright.
            tracing::trace!("concurrent spares are prohibited");
            self.spare_wait = SpareWait::ForPrimesToFail;
            return;
        }
        if self.gates.prime_chance.ready_now(self.prime_start) {
            tracing::trace!("no prime head start configured");
            return;
        }
        let rx = self.gates.prime_chance.enqueue(self.prime_start);
        self.spare_wait = SpareWait::GivePrimeChance(rx);
        // Wait for a prime connect result or the head-start wakeup.
    }

    /// If possible, start a spare connection attempt.
    fn maybe_open_spare(&mut self) -> Option<Answer> {
        debug_assert!(self.spare.is_none());
        debug_assert!(!self.spare_wait.is_active());
        debug_assert!(self.got_allowance.is_none());
        let current = self.current_peer.clone()?;

        if self.ran_out() {
            return None; // will quit or continue working on prime
        }

        if !self.ignore_spare_restrictions
            && !self.gates.spare_allowance.ready_now()
            && self.destinations.with(|rp| rp.have_spare(&current))
        {
            let rx = self.gates.spare_allowance.enqueue();
            self.spare_wait = SpareWait::ForSpareAllowance(rx);
            return None;
        }

        if let Some(dest) = self.destinations.with(|rp| rp.extract_spare(&current)) {
            if !self.ignore_spare_restrictions {
                self.got_allowance = Some(self.gates.spare_allowance.instant_allowance());
            }
            return self.start_connecting(Track::Spare, dest);
        }

        None // wait for more spare paths or their exhaustion
    }

    /// React to winning a queued spare allowance.
    fn spare_allowance_granted(&mut self, allowance: SpareAllowance<R>) -> Option<Answer> {
        if self.ran_out() {
            drop(allowance); // returned to the gate
            return None; // will quit or continue working on prime
        }
        let current = self.current_peer.clone()?;
        match self.destinations.with(|rp| rp.extract_spare(&current)) {
            Some(dest) => {
                self.got_allowance = Some(allowance);
                self.start_connecting(Track::Spare, dest)
            }
            None => {
                // The spare we queued for is gone (the list changed while
                // we waited); return the allowance and re-evaluate.
                drop(allowance);
                None
            }
        }
    }

    /// Build the success answer, returning unfinished attempts' paths to
    /// the destination list for the initiator's possible re-forwarding.
    fn success(&mut self, link: Link, receipt: PathRef, reused: bool) -> Answer {
        if let Some(peer) = link.profile().peer() {
            peer.health().note_success();
        }
        for attempt in [self.prime.take(), self.spare.take()].into_iter().flatten() {
            let _ = self.destinations.with(|rp| rp.reinstate(&attempt.path));
        }
        self.spare_wait = SpareWait::Idle;
        tracing::debug!(
            "{} connection ready: {} after {} tries",
            if reused { "reused" } else { "new" },
            link.profile(),
            self.n_tries
        );
        Answer {
            outcome: Ok(Reached {
                link,
                receipt,
                reused,
            }),
            tries: self.n_tries,
        }
    }

    /// Build the failure answer from the last error or the spent budget.
    fn failure(&mut self) -> Answer {
        self.spare_wait = SpareWait::Idle;
        let error = match self.last_error.take() {
            Some(error) => error,
            None => match self.ran_out {
                Some(RanOut::Tries) => OpenerError::TriesExhausted {
                    tries: self.n_tries,
                },
                Some(RanOut::Time) => OpenerError::BudgetExpired,
                None => OpenerError::NoPathsFound,
            },
        };
        tracing::debug!("giving up after {} tries: {}", self.n_tries, error);
        Answer {
            outcome: Err(error),
            tries: self.n_tries,
        }
    }
}

/// Await the in-flight attempt, or forever when there is none.
async fn track(attempt: &mut Option<Attempt>) -> Result<Link, AttemptError> {
    match attempt {
        Some(attempt) => (&mut attempt.fut).await,
        None => futures::future::pending().await,
    }
}

/// Await the active spare wait, or forever when none needs awaiting.
async fn wait<R: Runtime>(spare_wait: &mut SpareWait<R>) -> Wake<R> {
    match spare_wait {
        SpareWait::GivePrimeChance(rx) => {
            let _ = rx.await;
            Wake::PrimeChance
        }
        SpareWait::ForSpareAllowance(rx) => {
            let allowance = rx.await.ok();
            Wake::Allowance(allowance)
        }
        SpareWait::Idle | SpareWait::ForPrimesToFail | SpareWait::ForNewPeer => {
            futures::future::pending().await
        }
    }
}

/// The pending connect for one attempt.
fn connect_future<R: Runtime>(
    runtime: R,
    profile: PathProfile,
    timeout: Duration,
) -> BoxFuture<'static, Result<Link, AttemptError>> {
    Box::pin(async move {
        let remote = profile.remote();
        let opened = runtime.now();
        match runtime.timeout(timeout, runtime.connect(&remote)).await {
            Ok(Ok(stream)) => Ok(Link::new(profile, Box::new(stream), opened)),
            Ok(Err(error)) => Err(AttemptError::Io(Arc::new(error))),
            Err(_) => Err(AttemptError::TimedOut),
        }
    })
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
    use crate::config::SpareLimit;
    use ferry_peers::{Method, Scheme};
    use futures::task::SpawnExt;
    use tor_rtmock::MockRuntime;
    use tor_rtmock::net::{MockNetRuntime, MockNetwork};

    /// The runtime our test openers run over.
    type TestRt = MockNetRuntime<MockRuntime>;

    /// Everything an opener needs, over a mock network.
    struct Rig {
        /// The client-side runtime (dual-stack).
        rt: TestRt,
        /// Shared configuration.
        config: Arc<OpenerConfig>,
        /// The pacing gates.
        gates: Arc<OpenerGates<TestRt>>,
        /// The persistent-connection pool.
        pool: Arc<PconnPool<TestRt>>,
        /// The shared destination list.
        dests: Arc<Destinations>,
        /// The mock network, for adding listeners and blackholes.
        network: Arc<MockNetwork>,
    }

    impl Rig {
        /// Build a rig with the given configuration.
        fn new(rt: &MockRuntime, config: OpenerConfig) -> Self {
            let network = MockNetwork::new();
            let client_rt = network
                .builder()
                .add_address("192.0.2.7".parse().unwrap())
                .add_address("2001:db8::7".parse().unwrap())
                .runtime(rt.clone());
            let config = Arc::new(config);
            let gates = OpenerGates::new(&client_rt, Arc::clone(&config));
            let pool = PconnPool::new(&client_rt);
            Rig {
                rt: client_rt,
                config,
                gates,
                pool,
                dests: Arc::new(Destinations::new()),
                network,
            }
        }

        /// Start a listener at `addr` on the server side of the network.
        async fn listen(&self, rt: &MockRuntime, addr: &str) {
            let addr: SocketAddr = addr.parse().unwrap();
            let server_rt = self.network.builder().add_address(addr.ip()).runtime(rt.clone());
            let listener = server_rt.mock_net().listen(&addr).await.unwrap();
            std::mem::forget(listener);
        }

        /// A GET request toward origin.example.net.
        fn request(&self) -> RequestInfo {
            RequestInfo::builder()
                .method(Method::Get)
                .scheme(Scheme::Http)
                .host("origin.example.net".into())
                .port(80)
                .build()
                .unwrap()
        }

        /// An opener over this rig's shared state.
        fn opener(&self) -> HappyConnOpener<TestRt> {
            let mut opener = HappyConnOpener::new(
                &self.rt,
                Arc::clone(&self.config),
                Arc::clone(&self.gates),
                Arc::clone(&self.pool),
                Arc::new(WirePolicy::permissive()),
                Arc::clone(&self.dests),
                self.request(),
                self.rt.now(),
                0,
            );
            opener.set_host("origin.example.net");
            opener
        }

        /// Append a direct path and wake the opener.
        fn add_path(&self, addr: &str) {
            self.dests
                .with(|rp| rp.add(PathProfile::direct(addr.parse().unwrap())));
            self.dests.note_change();
        }

        /// Finalize the destination list and wake the opener.
        fn finalize(&self) {
            self.dests.with(|rp| rp.finalize());
            self.dests.note_change();
        }
    }

    #[test]
    fn fast_prime_success() {
        MockRuntime::test_with_various(|rt| async move {
            let rig = Rig::new(&rt, OpenerConfig::default());
            rig.listen(&rt, "192.0.2.80:80").await;
            rig.add_path("192.0.2.80:80");
            rig.add_path("[2001:db8::80]:80");
            rig.finalize();

            let answer = rig.opener().run().await;
            let reached = answer.outcome.unwrap();
            assert!(!reached.reused);
            assert!(reached.link.profile().remote().is_ipv4());
            assert_eq!(answer.tries, 1);
            // The spare path was never consumed.
            assert_eq!(rig.dests.with(|rp| rp.size()), 1);
        });
    }

    #[test]
    fn spare_wins_when_prime_hangs() {
        MockRuntime::test_with_various(|rt| async move {
            let config = OpenerConfig::builder()
                .spare_limit(SpareLimit::Limit(1))
                .build()
                .unwrap();
            let rig = Rig::new(&rt, config);
            // The prime address swallows the connect attempt.
            rig.network
                .add_blackhole("192.0.2.66:80".parse().unwrap())
                .unwrap();
            rig.listen(&rt, "[2001:db8::80]:80").await;
            rig.add_path("192.0.2.66:80");
            rig.add_path("[2001:db8::80]:80");
            rig.finalize();

            let opener = rig.opener();
            let handle = rt.spawn_with_handle(opener.run()).unwrap();
            // Nothing before the prime's head start...
            rt.advance_by(Duration::from_millis(250)).await;
            rt.progress_until_stalled().await;
            let answer = handle.await;
            let reached = answer.outcome.unwrap();
            assert!(reached.link.profile().remote().is_ipv6());
            // Both the hung prime and the spare count as attempts.
            assert_eq!(answer.tries, 2);
        });
    }

    #[test]
    fn prime_exhaustion_lifts_spare_restrictions() {
        MockRuntime::test_with_various(|rt| async move {
            let config = OpenerConfig::builder()
                .spare_limit(SpareLimit::Limit(0))
                .build()
                .unwrap();
            let rig = Rig::new(&rt, config);
            // Nothing listens on the prime address: connects fail fast.
            rig.listen(&rt, "[2001:db8::80]:80").await;
            rig.add_path("192.0.2.66:80");

            let opener = rig.opener();
            let handle = rt.spawn_with_handle(opener.run()).unwrap();
            rt.progress_until_stalled().await;

            // The prime failed and spares are prohibited; the opener is
            // paused.  New spare paths may now start immediately, with no
            // head start and no allowance.
            rig.add_path("[2001:db8::80]:80");
            rt.progress_until_stalled().await;

            let answer = handle.await;
            let reached = answer.outcome.unwrap();
            assert!(reached.link.profile().remote().is_ipv6());
            assert_eq!(answer.tries, 2);
        });
    }

    #[test]
    fn reuses_pooled_connection() {
        MockRuntime::test_with_various(|rt| async move {
            let rig = Rig::new(&rt, OpenerConfig::default());
            rig.listen(&rt, "192.0.2.80:80").await;

            // Seed the pool with an idle link for the same destination.
            let profile = PathProfile::direct("192.0.2.80:80".parse().unwrap());
            let stream = rig.rt.connect(&profile.remote()).await.unwrap();
            let idle = Link::new(profile, Box::new(stream), rig.rt.now());
            rig.pool.push(idle, Some("origin.example.net"));

            rig.add_path("192.0.2.80:80");
            rig.finalize();

            let answer = rig.opener().run().await;
            let reached = answer.outcome.unwrap();
            assert!(reached.reused);
            assert_eq!(answer.tries, 1);
        });
    }

    #[test]
    fn failure_reports_last_error_and_tries() {
        MockRuntime::test_with_various(|rt| async move {
            let rig = Rig::new(&rt, OpenerConfig::default());
            // Two dead destinations, then the end of the list.
            rig.add_path("192.0.2.66:80");
            rig.add_path("192.0.2.67:80");
            rig.finalize();

            let answer = rig.opener().run().await;
            let error = answer.outcome.unwrap_err();
            assert!(matches!(error, OpenerError::ConnectFailed { .. }));
            assert_eq!(answer.tries, 2);
        });
    }

    #[test]
    fn attempt_budget_is_enforced() {
        MockRuntime::test_with_various(|rt| async move {
            let config = OpenerConfig::builder().max_tries(1).build().unwrap();
            let rig = Rig::new(&rt, config);
            rig.add_path("192.0.2.66:80");
            rig.add_path("192.0.2.67:80");
            rig.finalize();

            let answer = rig.opener().run().await;
            assert!(answer.outcome.is_err());
            assert_eq!(answer.tries, 1);
        });
    }

    #[test]
    fn no_paths_reports_selection_failure() {
        MockRuntime::test_with_various(|rt| async move {
            let rig = Rig::new(&rt, OpenerConfig::default());
            rig.finalize();
            let answer = rig.opener().run().await;
            assert!(matches!(
                answer.outcome.unwrap_err(),
                OpenerError::NoPathsFound
            ));
            assert_eq!(answer.tries, 0);
        });
    }

    #[test]
    fn cancellation_returns_spare_allowance() {
        MockRuntime::test_with_various(|rt| async move {
            let config = OpenerConfig::builder()
                .spare_limit(SpareLimit::Limit(1))
                .spare_gap(Duration::ZERO)
                .prime_head_start(Duration::from_millis(100))
                .build()
                .unwrap();
            let rig = Rig::new(&rt, config);
            rig.network
                .add_blackhole("192.0.2.66:80".parse().unwrap())
                .unwrap();
            rig.network
                .add_blackhole("[2001:db8::66]:80".parse().unwrap())
                .unwrap();
            rig.add_path("192.0.2.66:80");
            rig.add_path("[2001:db8::66]:80");
            rig.finalize();

            let opener = rig.opener();
            let handle = rt.spawn_with_handle(opener.run()).unwrap();
            // Let the spare start (consuming the one allowance)...
            rt.advance_by(Duration::from_millis(150)).await;
            rt.progress_until_stalled().await;
            // ...then cancel the opener outright.
            drop(handle);
            rt.progress_until_stalled().await;

            // The allowance made it back to the gate.
            assert!(rig.gates.spare_allowance.ready_now());
        });
    }
}
