//! The process-wide pool of idle persistent connections.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::hash::{Hash, Hasher};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use postage::watch;
use rand::Rng;
use tor_rtcompat::{Runtime, SleepProvider};

use ferry_peers::{Link, PathProfile, Peer};

/// Bounds of the jittered per-entry idle lifetime.
///
/// Entries that sit unused longer than their lifetime are discarded; the
/// jitter keeps a burst of deposits from expiring as a burst of closures.
const IDLE_LIFETIME: std::ops::Range<u64> = 60..90;

/// How often the background sweep looks for expired entries.
const SWEEP_INTERVAL: Duration = Duration::from_secs(15);

/// The next-hop gateway component of a pool key.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
enum GatewayId {
    /// A configured peer, by identity.
    Peer(usize),
    /// A direct path, by remote address.
    Addr(SocketAddr),
}

/// The identity under which idle links are filed.
///
/// Push and pop both derive the key from the same profile fields, so a
/// popped link always matches what was pushed for the same destination:
/// the gateway, the origin host hint (always absent for peer gateways,
/// which serve any host), and a fingerprint of the TLS configuration.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
struct PoolKey {
    /// Where the connection leads.
    gateway: GatewayId,
    /// The origin host it is good for, when the gateway is origin-specific.
    host: Option<String>,
    /// Fingerprint of the TLS parameters the connection was opened with.
    tls: u64,
}

/// One idle connection waiting for reuse.
struct IdleLink {
    /// The pooled connection.
    link: Link,
    /// When it was deposited.
    deposited: Instant,
    /// How long it may sit idle before being discarded.
    max_idle: Duration,
}

/// Mutable pool state.
struct Inner {
    /// Idle links, most recently deposited at the back of each bucket.
    buckets: HashMap<PoolKey, VecDeque<IdleLink>>,
    /// Total number of idle links across all buckets.
    count: usize,
}

/// A pool of idle persistent connections to next-hop gateways.
///
/// The pool is shared process state, serialized behind a mutex; no lock is
/// held across awaits.  Every deposit, drain, and sweep bumps an event
/// generation that standby refill loops watch.
pub struct PconnPool<R: Runtime> {
    /// Runtime, for timestamps and the sweep task.
    runtime: R,
    /// Mutable pool state.
    inner: Mutex<Inner>,
    /// Sender half of the pool-activity signal.
    events_tx: Mutex<watch::Sender<u64>>,
    /// Receiver half of the pool-activity signal, cloned out to watchers.
    events_rx: watch::Receiver<u64>,
}

impl<R: Runtime> PconnPool<R> {
    /// Construct a new, empty pool.
    pub fn new(runtime: &R) -> Arc<Self> {
        let (events_tx, events_rx) = watch::channel();
        Arc::new(PconnPool {
            runtime: runtime.clone(),
            inner: Mutex::new(Inner {
                buckets: HashMap::new(),
                count: 0,
            }),
            events_tx: Mutex::new(events_tx),
            events_rx,
        })
    }

    /// Launch the periodic sweep that discards expired idle links.
    pub fn launch_background_tasks(self: &Arc<Self>) {
        use futures::task::SpawnExt as _;
        let pool = Arc::downgrade(self);
        let runtime = self.runtime.clone();
        let _ignore = self.runtime.spawn(async move {
            loop {
                runtime.sleep(SWEEP_INTERVAL).await;
                let Some(pool) = pool.upgrade() else { break };
                pool.sweep();
            }
        });
    }

    /// Deposit an idle connection for later reuse.
    pub fn push(&self, link: Link, host_hint: Option<&str>) {
        let key = key_for(link.profile(), host_hint);
        let max_idle = Duration::from_secs(rand::rng().random_range(IDLE_LIFETIME));
        let entry = IdleLink {
            link,
            deposited: self.runtime.now(),
            max_idle,
        };
        {
            let mut inner = self.inner.lock().expect("poisoned lock");
            inner.buckets.entry(key).or_default().push_back(entry);
            inner.count += 1;
        }
        self.note_event();
    }

    /// Withdraw an idle connection matching `profile` and `host_hint`.
    ///
    /// A request that cannot be resent must not gamble on a persistent
    /// connection (losing the reuse race would lose the request), so a
    /// non-retriable pop discards one matching idle link instead of
    /// returning it.
    ///
    /// Either way, a miss bumps the pool-activity signal so that a standby
    /// refill loop can react to the drained bucket.
    pub fn pop(&self, profile: &PathProfile, host_hint: Option<&str>, retriable: bool) -> Option<Link> {
        let key = key_for(profile, host_hint);
        let now = self.runtime.now();
        let popped = {
            let mut inner = self.inner.lock().expect("poisoned lock");
            let mut found = None;
            let mut removed = 0;
            if let Some(bucket) = inner.buckets.get_mut(&key) {
                while let Some(entry) = bucket.pop_front() {
                    removed += 1;
                    if expired(&entry, now) {
                        // stale; drop and keep looking
                        continue;
                    }
                    found = Some(entry);
                    break;
                }
            }
            inner.count -= removed;
            found
        };
        self.note_event();
        match popped {
            Some(entry) if retriable => {
                tracing::debug!("reusing idle connection: {}", entry.link);
                Some(entry.link)
            }
            Some(entry) => {
                tracing::debug!("discarding idle connection for non-retriable request");
                drop(entry);
                None
            }
            None => None,
        }
    }

    /// Return the total number of idle links in the pool.
    pub fn count(&self) -> usize {
        self.inner.lock().expect("poisoned lock").count
    }

    /// Return the number of idle links leading to `peer`.
    pub fn count_for_peer(&self, peer: &Arc<Peer>) -> usize {
        let id = GatewayId::Peer(peer_id(peer));
        let inner = self.inner.lock().expect("poisoned lock");
        inner
            .buckets
            .iter()
            .filter(|(k, _)| k.gateway == id)
            .map(|(_, b)| b.len())
            .sum()
    }

    /// Close up to `n` idle links, oldest first.
    pub fn close_n(&self, n: usize) {
        self.close_matching(n, |_| true);
    }

    /// Close up to `n` idle links leading to `peer`, oldest first.
    pub fn close_n_for_peer(&self, peer: &Arc<Peer>, n: usize) {
        let id = GatewayId::Peer(peer_id(peer));
        self.close_matching(n, |k| k.gateway == id);
    }

    /// Close up to `n` idle links whose key satisfies `matches`, oldest
    /// first.
    fn close_matching(&self, n: usize, matches: impl Fn(&PoolKey) -> bool) {
        let mut closed = 0;
        {
            let mut inner = self.inner.lock().expect("poisoned lock");
            while closed < n {
                // Front entries are the oldest in each bucket.
                let oldest = inner
                    .buckets
                    .iter()
                    .filter(|(k, b)| matches(k) && !b.is_empty())
                    .min_by_key(|(_, b)| b.front().map(|e| e.deposited))
                    .map(|(k, _)| k.clone());
                let Some(key) = oldest else { break };
                if let Some(bucket) = inner.buckets.get_mut(&key) {
                    if bucket.pop_front().is_some() {
                        inner.count -= 1;
                        closed += 1;
                    }
                }
            }
        }
        if closed > 0 {
            tracing::debug!("closed {} idle connections", closed);
            self.note_event();
        }
    }

    /// Return a receiver that wakes after every pool event.
    pub fn events(&self) -> watch::Receiver<u64> {
        self.events_rx.clone()
    }

    /// Discard expired idle links.
    fn sweep(&self) {
        let now = self.runtime.now();
        let mut dropped = 0;
        {
            let mut inner = self.inner.lock().expect("poisoned lock");
            for bucket in inner.buckets.values_mut() {
                let before = bucket.len();
                bucket.retain(|entry| !expired(entry, now));
                dropped += before - bucket.len();
            }
            inner.count -= dropped;
            inner.buckets.retain(|_, bucket| !bucket.is_empty());
        }
        if dropped > 0 {
            tracing::debug!("swept {} expired idle connections", dropped);
        }
        // Wake refill loops even when nothing expired: this is also the
        // periodic retry trigger after refill failures.
        self.note_event();
    }

    /// Bump the pool-activity generation.
    fn note_event(&self) {
        let mut tx = self.events_tx.lock().expect("poisoned lock");
        let next = *tx.borrow() + 1;
        *tx.borrow_mut() = next;
    }
}

/// Return true if `entry` has outlived its idle lifetime at `now`.
fn expired(entry: &IdleLink, now: Instant) -> bool {
    now.saturating_duration_since(entry.deposited) >= entry.max_idle
}

/// Stable in-process identity of a peer.
fn peer_id(peer: &Arc<Peer>) -> usize {
    Arc::as_ptr(peer) as usize
}

/// Derive the pool key for a destination profile.
fn key_for(profile: &PathProfile, host_hint: Option<&str>) -> PoolKey {
    let (gateway, tls) = match profile.peer() {
        Some(peer) => (GatewayId::Peer(peer_id(peer)), tls_fingerprint(peer)),
        None => (GatewayId::Addr(profile.remote()), 0),
    };
    // A peer gateway serves any origin; only direct connections are
    // origin-specific.
    let host = match profile.peer() {
        Some(_) => None,
        None => host_hint.map(str::to_owned),
    };
    PoolKey { gateway, host, tls }
}

/// Hash the TLS parameters a peer's connections are opened with.
fn tls_fingerprint(peer: &Arc<Peer>) -> u64 {
    match peer.tls() {
        None => 0,
        Some(tls) => {
            let mut hasher = std::collections::hash_map::DefaultHasher::new();
            tls.hash(&mut hasher);
            hasher.finish()
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
    use ferry_peers::PathKind;
    use futures::StreamExt;
    use tor_rtmock::MockRuntime;
    use tor_rtmock::io::stream_pair;

    /// A link to `addr` over a fresh in-memory stream.
    fn fake_link(rt: &MockRuntime, profile: PathProfile) -> Link {
        let (ours, theirs) = stream_pair();
        std::mem::forget(theirs);
        Link::new(profile, Box::new(ours), rt.now())
    }

    /// A direct profile.
    fn direct(addr: &str) -> PathProfile {
        PathProfile::direct(addr.parse().unwrap())
    }

    /// A peer for gateway profiles.
    fn peer(standby: usize) -> Arc<Peer> {
        Arc::new(
            Peer::builder()
                .name("gw".into())
                .host("gw.example.com".into())
                .port(3128)
                .standby_limit(standby)
                .build()
                .unwrap(),
        )
    }

    #[test]
    fn push_pop_roundtrip() {
        MockRuntime::test_with_various(|rt| async move {
            let pool = PconnPool::new(&rt);
            let profile = direct("192.0.2.1:80");
            pool.push(fake_link(&rt, profile.clone()), Some("origin.example.net"));
            assert_eq!(pool.count(), 1);

            // Wrong host: no match.
            assert!(pool.pop(&profile, Some("other.example.net"), true).is_none());
            // Right host: the pushed link comes back.
            let got = pool
                .pop(&profile, Some("origin.example.net"), true)
                .unwrap();
            assert_eq!(got.profile().remote(), profile.remote());
            assert_eq!(pool.count(), 0);
        });
    }

    #[test]
    fn peer_links_ignore_host_hint() {
        MockRuntime::test_with_various(|rt| async move {
            let pool = PconnPool::new(&rt);
            let gw = peer(0);
            let profile = PathProfile::via_peer(
                "192.0.2.8:3128".parse().unwrap(),
                Arc::clone(&gw),
                PathKind::Gateway,
            );
            // Standby refill pushes with no host hint...
            pool.push(fake_link(&rt, profile.clone()), None);
            // ...and a transaction for some origin still finds it.
            assert!(pool.pop(&profile, Some("origin.example.net"), true).is_some());
        });
    }

    #[test]
    fn non_retriable_pop_discards() {
        MockRuntime::test_with_various(|rt| async move {
            let pool = PconnPool::new(&rt);
            let profile = direct("192.0.2.1:80");
            pool.push(fake_link(&rt, profile.clone()), None);

            assert!(pool.pop(&profile, None, false).is_none());
            // The idle link was discarded, not kept.
            assert_eq!(pool.count(), 0);
        });
    }

    #[test]
    fn expired_links_are_not_returned() {
        MockRuntime::test_with_various(|rt| async move {
            let pool = PconnPool::new(&rt);
            let profile = direct("192.0.2.1:80");
            pool.push(fake_link(&rt, profile.clone()), None);

            rt.advance_by(Duration::from_secs(120)).await;
            assert!(pool.pop(&profile, None, true).is_none());
        });
    }

    #[test]
    fn close_n_removes_oldest_first() {
        MockRuntime::test_with_various(|rt| async move {
            let pool = PconnPool::new(&rt);
            let old = direct("192.0.2.1:80");
            let newer = direct("192.0.2.2:80");
            pool.push(fake_link(&rt, old.clone()), None);
            rt.advance_by(Duration::from_secs(1)).await;
            pool.push(fake_link(&rt, newer.clone()), None);

            pool.close_n(1);
            assert_eq!(pool.count(), 1);
            assert!(pool.pop(&old, None, true).is_none());
            assert!(pool.pop(&newer, None, true).is_some());
        });
    }

    #[test]
    fn events_fire_on_activity() {
        MockRuntime::test_with_various(|rt| async move {
            let pool = PconnPool::new(&rt);
            let mut events = pool.events();
            let initial = events.next().await.unwrap();

            pool.push(fake_link(&rt, direct("192.0.2.1:80")), None);
            let seen = events.next().await.unwrap();
            assert!(seen > initial);
        });
    }

    #[test]
    fn count_for_peer_ignores_other_gateways() {
        MockRuntime::test_with_various(|rt| async move {
            let pool = PconnPool::new(&rt);
            let gw = peer(2);
            let via = PathProfile::via_peer(
                "192.0.2.8:3128".parse().unwrap(),
                Arc::clone(&gw),
                PathKind::Standby,
            );
            pool.push(fake_link(&rt, via.clone()), None);
            pool.push(fake_link(&rt, direct("192.0.2.1:80")), None);

            assert_eq!(pool.count_for_peer(&gw), 1);
            pool.close_n_for_peer(&gw, 5);
            assert_eq!(pool.count_for_peer(&gw), 0);
            assert_eq!(pool.count(), 1);
        });
    }
}
