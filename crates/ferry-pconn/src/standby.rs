//! Keeping a peer's standby pool topped up.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tor_rtcompat::{NetStreamProvider, Runtime, SleepProvider, SleepProviderExt};

use ferry_handshake::{LinkSecurer, TlsParams};
use ferry_peers::{Link, Method, PathKind, PathProfile, Peer, RequestInfo, Scheme, WirePolicy};

use crate::PconnPool;

/// A view of process-wide resource pressure.
///
/// The refill loop backs off while file descriptors are scarce, leaving
/// headroom for demand traffic.
pub trait ResourcePressure: Send + Sync {
    /// Return true while file-descriptor usage is high.
    fn fd_usage_high(&self) -> bool;
}

/// A [`ResourcePressure`] that never reports pressure.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoPressure;

impl ResourcePressure for NoPressure {
    fn fd_usage_high(&self) -> bool {
        false
    }
}

/// Maintains a fixed-size standby pool of open connections for one peer.
///
/// The manager runs as a task: every pool event (deposit, drain, sweep)
/// triggers a checkpoint that compares the peer's idle count to its
/// configured standby limit, opening one connection at a time while under
/// the limit and closing the excess while over it.
pub struct PeerPoolMgr<R: Runtime> {
    /// Runtime for connecting and timeouts.
    runtime: R,
    /// The peer whose pool we manage.
    peer: Arc<Peer>,
    /// The pool we deposit into.
    pool: Arc<PconnPool<R>>,
    /// TLS securer, consulted when the peer encrypts its transport.
    securer: Arc<dyn LinkSecurer>,
    /// Network policy applied to fresh standby connections.
    policy: Arc<WirePolicy>,
    /// Resource-pressure view.
    pressure: Arc<dyn ResourcePressure>,
    /// Fallback connect timeout when the peer does not override it.
    connect_timeout: Duration,
    /// A placeholder transaction for policy decisions.
    ///
    /// Outgoing-address and marking decisions expect a request; standby
    /// connections are opened for no transaction in particular, so we fake
    /// a minimal one aimed at the peer.
    request: RequestInfo,
    /// Counter for cycling through the peer's resolved addresses.
    addr_used: usize,
    /// Set when refill stopped for a reason that a future idle-connection
    /// closure may clear (per-peer cap, fd pressure).
    waiting_for_close: bool,
}

impl<R: Runtime> PeerPoolMgr<R> {
    /// Construct a manager for `peer`.
    pub fn new(
        runtime: &R,
        peer: Arc<Peer>,
        pool: Arc<PconnPool<R>>,
        securer: Arc<dyn LinkSecurer>,
        policy: Arc<WirePolicy>,
        pressure: Arc<dyn ResourcePressure>,
        connect_timeout: Duration,
    ) -> Self {
        let request = RequestInfo::builder()
            .method(Method::Options)
            .scheme(Scheme::Http)
            .host(peer.host().to_owned())
            .port(peer.port())
            .build()
            .unwrap_or_else(|_| unreachable!("all required fields are set"));
        PeerPoolMgr {
            runtime: runtime.clone(),
            peer,
            pool,
            securer,
            policy,
            pressure,
            connect_timeout,
            request,
            addr_used: 0,
            waiting_for_close: false,
        }
    }

    /// Run the refill loop until the pool is dropped.
    pub async fn run(mut self) {
        if self.peer.standby_limit() == 0 {
            return;
        }
        let mut events = self.pool.events();
        self.checkpoint("peer initialized").await;
        while let Some(_generation) = events.next().await {
            self.checkpoint("pool event").await;
        }
    }

    /// Compare the pool to the configured limit and converge toward it.
    ///
    /// At most one open-or-secure operation is in flight at a time: each
    /// iteration awaits its single open before looking again.
    pub async fn checkpoint(&mut self, reason: &str) {
        let limit = self.peer.standby_limit();
        loop {
            let count = self.pool.count_for_peer(&self.peer);
            tracing::trace!("standby checkpoint ({}): {} ? {}", reason, count, limit);

            if count > limit {
                self.pool.close_n_for_peer(&self.peer, count - limit);
                return;
            }
            if count == limit {
                return;
            }

            // Do not talk to a peer until it is ready.
            if !self.peer.health().is_up() {
                return;
            }
            // Do not violate peer limits.
            if self
                .peer
                .max_connections()
                .is_some_and(|max| count >= max)
            {
                self.waiting_for_close = true;
                return;
            }
            // Do not violate global restrictions.
            if self.pressure.fd_usage_high() {
                tracing::debug!("standby refill for {} deferred: fd pressure", self.peer);
                self.waiting_for_close = true;
                return;
            }
            self.waiting_for_close = false;

            if !self.open_new_connection().await {
                // Failure was recorded against the peer; the next pool
                // event (including the periodic sweep) retries.
                return;
            }
        }
    }

    /// Open, optionally secure, and deposit one standby connection.
    ///
    /// Returns true on success.
    async fn open_new_connection(&mut self) -> bool {
        let addresses = self.peer.addresses();
        if addresses.is_empty() {
            tracing::debug!("no addresses for standby peer {}", self.peer);
            return false;
        }
        // Cycle through all available addresses.
        let addr = addresses[self.addr_used % addresses.len()];
        self.addr_used = self.addr_used.wrapping_add(1);
        let remote = SocketAddr::new(addr, self.peer.port());

        let mut profile =
            PathProfile::via_peer(remote, Arc::clone(&self.peer), PathKind::Standby);
        self.policy.prepare(&self.request, &mut profile);

        let timeout = self.peer.connect_timeout(self.connect_timeout);
        let opened = self.runtime.now();
        let stream = match self
            .runtime
            .timeout(timeout, self.runtime.connect(&remote))
            .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                tracing::debug!("standby connect to {} failed: {}", profile, e);
                self.peer.health().note_failure();
                return false;
            }
            Err(_) => {
                tracing::debug!("standby connect to {} timed out", profile);
                self.peer.health().note_failure();
                return false;
            }
        };
        let link = Link::new(profile, Box::new(stream), opened);

        let link = if self.peer.tls().is_some() {
            // Spend whatever remains of the connect timeout on the
            // handshake, but always at least one second.
            let used = self.runtime.now().saturating_duration_since(opened);
            let left = timeout.saturating_sub(used).max(Duration::from_secs(1));
            let params = TlsParams::for_peer(&self.peer, None);
            match self.securer.secure(link, params, left).await {
                Ok(answer) => {
                    debug_assert!(!answer.tunneled);
                    match answer.link {
                        Some(link) => link,
                        None => {
                            self.peer.health().note_failure();
                            return false;
                        }
                    }
                }
                Err(e) => {
                    tracing::debug!("standby TLS to {} failed: {}", self.peer, e);
                    self.peer.health().note_failure();
                    return false;
                }
            }
        } else {
            link
        };

        self.peer.health().note_success();
        self.pool.push(link, None);
        true
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
    use ferry_handshake::{EncryptorAnswer, TlsError};
    use futures::future::BoxFuture;
    use futures::task::SpawnExt;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tor_rtmock::MockRuntime;
    use tor_rtmock::net::MockNetwork;

    /// A securer for tests that never expects to be called.
    struct NoTls;
    impl LinkSecurer for NoTls {
        fn secure(
            &self,
            _link: Link,
            _params: TlsParams,
            _timeout: Duration,
        ) -> BoxFuture<'_, Result<EncryptorAnswer, TlsError>> {
            panic!("cleartext peer must not be secured");
        }
    }

    /// A securer that counts handshakes and passes links through.
    #[derive(Default)]
    struct CountingTls(AtomicUsize);
    impl LinkSecurer for CountingTls {
        fn secure(
            &self,
            link: Link,
            _params: TlsParams,
            _timeout: Duration,
        ) -> BoxFuture<'_, Result<EncryptorAnswer, TlsError>> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move {
                Ok(EncryptorAnswer {
                    link: Some(link),
                    tunneled: false,
                })
            })
        }
    }

    /// Togglable fd pressure.
    #[derive(Default)]
    struct TogglePressure(AtomicBool);
    impl ResourcePressure for TogglePressure {
        fn fd_usage_high(&self) -> bool {
            self.0.load(Ordering::SeqCst)
        }
    }

    /// A standby-configured peer at 192.0.2.40:3128.
    fn standby_peer(limit: usize, tls: bool) -> Arc<Peer> {
        let mut builder = Peer::builder();
        builder
            .name("standby".into())
            .host("standby.example.com".into())
            .port(3128)
            .addresses(vec!["192.0.2.40".parse().unwrap()])
            .standby_limit(limit);
        if tls {
            builder.tls(ferry_peers::PeerTlsConfig::default());
        }
        Arc::new(builder.build().unwrap())
    }

    /// Spin up the mock network with a listener for `peer`, and a manager.
    async fn run_refill(
        rt: &MockRuntime,
        peer: Arc<Peer>,
        securer: Arc<dyn LinkSecurer>,
        pressure: Arc<dyn ResourcePressure>,
    ) -> Arc<PconnPool<tor_rtmock::net::MockNetRuntime<MockRuntime>>> {
        let network = MockNetwork::new();
        let client_rt = network
            .builder()
            .add_address("192.0.2.7".parse().unwrap())
            .runtime(rt.clone());
        let server_rt = network
            .builder()
            .add_address("192.0.2.40".parse().unwrap())
            .runtime(rt.clone());
        let _listener = server_rt
            .mock_net()
            .listen(&"192.0.2.40:3128".parse().unwrap())
            .await
            .unwrap();
        // Keep the listener alive for the whole test.
        std::mem::forget(_listener);

        let pool = PconnPool::new(&client_rt);
        pool.launch_background_tasks();
        let mgr = PeerPoolMgr::new(
            &client_rt,
            peer,
            Arc::clone(&pool),
            securer,
            Arc::new(WirePolicy::permissive()),
            pressure,
            Duration::from_secs(10),
        );
        rt.spawn(mgr.run()).unwrap();
        pool
    }

    #[test]
    fn refill_to_limit_and_back() {
        MockRuntime::test_with_various(|rt| async move {
            let peer = standby_peer(2, false);
            let pool = run_refill(
                &rt,
                Arc::clone(&peer),
                Arc::new(NoTls),
                Arc::new(NoPressure),
            )
            .await;

            rt.progress_until_stalled().await;
            assert_eq!(pool.count_for_peer(&peer), 2);

            // Drain one; the refill loop notices the pop event.
            let profile = PathProfile::via_peer(
                "192.0.2.40:3128".parse().unwrap(),
                Arc::clone(&peer),
                PathKind::Gateway,
            );
            let got = pool.pop(&profile, Some("origin.example.net"), true);
            assert!(got.is_some());
            rt.progress_until_stalled().await;
            assert_eq!(pool.count_for_peer(&peer), 2);
        });
    }

    #[test]
    fn tls_peer_is_secured_before_deposit() {
        MockRuntime::test_with_various(|rt| async move {
            let peer = standby_peer(1, true);
            let securer = Arc::new(CountingTls::default());
            let pool = run_refill(
                &rt,
                Arc::clone(&peer),
                Arc::clone(&securer) as Arc<dyn LinkSecurer>,
                Arc::new(NoPressure),
            )
            .await;

            rt.progress_until_stalled().await;
            assert_eq!(pool.count_for_peer(&peer), 1);
            assert_eq!(securer.0.load(Ordering::SeqCst), 1);
        });
    }

    #[test]
    fn fd_pressure_defers_refill() {
        MockRuntime::test_with_various(|rt| async move {
            let peer = standby_peer(2, false);
            let pressure = Arc::new(TogglePressure::default());
            pressure.0.store(true, Ordering::SeqCst);
            let pool = run_refill(
                &rt,
                Arc::clone(&peer),
                Arc::new(NoTls),
                Arc::clone(&pressure) as Arc<dyn ResourcePressure>,
            )
            .await;

            rt.progress_until_stalled().await;
            assert_eq!(pool.count_for_peer(&peer), 0);

            // Pressure clears; the next pool event (the sweep) retries.
            pressure.0.store(false, Ordering::SeqCst);
            rt.advance_by(Duration::from_secs(16)).await;
            rt.progress_until_stalled().await;
            assert_eq!(pool.count_for_peer(&peer), 2);
        });
    }

    #[test]
    fn down_peer_is_left_alone() {
        MockRuntime::test_with_various(|rt| async move {
            let peer = standby_peer(2, false);
            for _ in 0..20 {
                peer.health().note_failure();
            }
            let pool = run_refill(
                &rt,
                Arc::clone(&peer),
                Arc::new(NoTls),
                Arc::new(NoPressure),
            )
            .await;

            rt.progress_until_stalled().await;
            assert_eq!(pool.count_for_peer(&peer), 0);
        });
    }
}
