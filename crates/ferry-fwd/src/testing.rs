//! Fake collaborators and a ready-made context for driver tests.
#![allow(clippy::unwrap_used)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use futures::channel::oneshot;
use futures::future::BoxFuture;
use futures::stream::BoxStream;

use tor_rtcompat::SleepProvider;
use tor_rtmock::MockRuntime;
use tor_rtmock::net::{MockNetRuntime, MockNetwork};

use ferry_handshake::{EncryptorAnswer, LinkSecurer, TlsError, TlsParams};
use ferry_opener::{OpenerConfig, OpenerGates};
use ferry_pconn::PconnPool;
use ferry_peers::access::{AccessCheck, ConstantAccess, Decision};
use ferry_peers::{
    DestinationEvent, Link, Method, PeerSelector, RequestInfo, Scheme, WirePolicy,
};

use crate::config::ForwardConfig;
use crate::contract::{
    BasicErrorPages, Exchange, ExchangeOutcome, NoDiversions, NoPinned, PinnedConnections,
    PinnedError, StoreSink,
};
use crate::ctx::ForwardContext;

/// The runtime driver tests run over.
pub(crate) type TestRt = MockNetRuntime<MockRuntime>;

/// A store entry that records what the driver did to it.
#[derive(Debug, Default)]
pub(crate) struct FakeStore {
    /// Recorded state.
    pub(crate) state: Mutex<FakeStoreState>,
    /// Pending abort watchers.
    abort_watchers: Mutex<Vec<oneshot::Sender<()>>>,
}

/// The mutable state of a [`FakeStore`].
#[derive(Debug)]
pub(crate) struct FakeStoreState {
    /// Whether reply bytes have been committed.
    pub(crate) empty: bool,
    /// Whether the entry is still being filled.
    pub(crate) pending: bool,
    /// Whether the entry was aborted.
    pub(crate) aborted: bool,
    /// How many times the entry was reset.
    pub(crate) resets: usize,
    /// The final completion, if any: (reason, whole).
    pub(crate) completed: Option<(&'static str, bool)>,
    /// The appended error page, if any.
    pub(crate) error_page: Option<(u16, Vec<u8>)>,
    /// Outstanding lock count.
    pub(crate) locks: isize,
}

impl Default for FakeStoreState {
    fn default() -> Self {
        FakeStoreState {
            empty: true,
            pending: true,
            aborted: false,
            resets: 0,
            completed: None,
            error_page: None,
            locks: 0,
        }
    }
}

impl FakeStore {
    /// A fresh store entry.
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(FakeStore::default())
    }

    /// Abort the entry from the store side, waking abort watchers.
    #[allow(dead_code)]
    pub(crate) fn abort_from_store(&self) {
        self.state.lock().unwrap().aborted = true;
        for tx in self.abort_watchers.lock().unwrap().drain(..) {
            let _ = tx.send(());
        }
    }
}

impl StoreSink for FakeStore {
    fn is_empty(&self) -> bool {
        self.state.lock().unwrap().empty
    }
    fn is_pending(&self) -> bool {
        self.state.lock().unwrap().pending
    }
    fn is_aborted(&self) -> bool {
        self.state.lock().unwrap().aborted
    }
    fn abort(&self) {
        self.state.lock().unwrap().aborted = true;
    }
    fn reset(&self) {
        let mut state = self.state.lock().unwrap();
        state.resets += 1;
        state.empty = true;
    }
    fn complete_successfully(&self, reason: &'static str) {
        let mut state = self.state.lock().unwrap();
        state.pending = false;
        state.completed = Some((reason, true));
    }
    fn complete_truncated(&self, reason: &'static str) {
        let mut state = self.state.lock().unwrap();
        state.pending = false;
        state.completed = Some((reason, false));
    }
    fn append_error_page(&self, status: u16, body: Vec<u8>) {
        let mut state = self.state.lock().unwrap();
        state.empty = false;
        state.pending = false;
        state.error_page = Some((status, body));
    }
    fn lock(&self, _tag: &'static str) {
        self.state.lock().unwrap().locks += 1;
    }
    fn unlock(&self, _tag: &'static str) {
        self.state.lock().unwrap().locks -= 1;
    }
    fn wait_abort(&self) -> BoxFuture<'static, ()> {
        let (tx, rx) = oneshot::channel();
        self.abort_watchers.lock().unwrap().push(tx);
        async move {
            let _ = rx.await;
        }
        .boxed()
    }
}

/// A selector that plays back a fixed list of events, once.
pub(crate) struct ListSelector {
    /// The events still to be played.
    events: Mutex<Option<Vec<DestinationEvent>>>,
}

impl ListSelector {
    /// A selector that will yield `events` to its first subscriber.
    pub(crate) fn new(events: Vec<DestinationEvent>) -> Arc<Self> {
        Arc::new(ListSelector {
            events: Mutex::new(Some(events)),
        })
    }
}

impl PeerSelector for ListSelector {
    fn subscribe(&self, _request: &RequestInfo) -> BoxStream<'static, DestinationEvent> {
        let events = self.events.lock().unwrap().take().unwrap_or_default();
        Box::pin(futures::stream::iter(events))
    }
}

/// An exchange that answers from a script, counting its calls.
///
/// Completed outcomes also mark the fake store entry as written, the way
/// a real exchange stores the reply as it arrives.  When the script runs
/// dry, it reports a stored-whole 200.
pub(crate) struct ScriptedExchange {
    /// Outcomes still to be played.
    script: Mutex<VecDeque<ExchangeOutcome>>,
    /// The store whose entry we pretend to fill.
    store: Mutex<Option<Arc<FakeStore>>>,
    /// How many times the exchange ran.
    pub(crate) calls: AtomicUsize,
}

impl ScriptedExchange {
    /// An exchange that plays back `script`.
    pub(crate) fn new(script: Vec<ExchangeOutcome>) -> Arc<Self> {
        Arc::new(ScriptedExchange {
            script: Mutex::new(script.into()),
            store: Mutex::new(None),
            calls: AtomicUsize::new(0),
        })
    }

    /// Tie this exchange to the store it should pretend to write into.
    pub(crate) fn set_store(&self, store: Arc<FakeStore>) {
        *self.store.lock().unwrap() = Some(store);
    }
}

#[async_trait]
impl Exchange for ScriptedExchange {
    async fn run(
        &self,
        server: Link,
        _request: &RequestInfo,
        _entry: &Arc<dyn StoreSink>,
    ) -> ExchangeOutcome {
        drop(server);
        self.calls.fetch_add(1, Ordering::SeqCst);
        let outcome = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(ExchangeOutcome::Completed {
                status: 200,
                stored_whole: Some("scripted default"),
                server: None,
            });
        if matches!(outcome, ExchangeOutcome::Completed { .. }) {
            if let Some(store) = self.store.lock().unwrap().as_ref() {
                store.state.lock().unwrap().empty = false;
            }
        }
        outcome
    }
}

/// A securer for tests whose routes never need TLS.
pub(crate) struct NoTlsNeeded;

impl LinkSecurer for NoTlsNeeded {
    fn secure(
        &self,
        _link: Link,
        params: TlsParams,
        _timeout: Duration,
    ) -> BoxFuture<'_, Result<EncryptorAnswer, TlsError>> {
        panic!("unexpected TLS handshake with {}", params.server_name);
    }
}

/// A pinned-connection registry holding at most one prepared link.
pub(crate) struct OnePinned {
    /// The link to hand out.
    link: Mutex<Option<Link>>,
}

impl OnePinned {
    /// A registry that will hand out `link` once.
    pub(crate) fn new(link: Link) -> Arc<Self> {
        Arc::new(OnePinned {
            link: Mutex::new(Some(link)),
        })
    }
}

impl PinnedConnections for OnePinned {
    fn borrow_pinned(&self, _request: &RequestInfo) -> Result<Link, PinnedError> {
        self.link
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| PinnedError::new("pinned connection already taken"))
    }
}

/// Everything a driver test needs.
pub(crate) struct Rig {
    /// The client-side runtime (dual stack).
    pub(crate) rt: TestRt,
    /// The mock network, for listeners and blackholes.
    pub(crate) network: Arc<MockNetwork>,
    /// The shared context.
    pub(crate) ctx: Arc<ForwardContext<TestRt>>,
    /// The store entry under test.
    pub(crate) store: Arc<FakeStore>,
    /// The scripted exchange.
    pub(crate) exchange: Arc<ScriptedExchange>,
}

/// Options for building a [`Rig`].
pub(crate) struct RigSpec {
    /// Selection events to play back.
    pub(crate) events: Vec<DestinationEvent>,
    /// Exchange outcomes to play back.
    pub(crate) script: Vec<ExchangeOutcome>,
    /// The miss-access list name, if one should be enforced.
    pub(crate) miss_access: Option<String>,
    /// The access decision for every list.
    pub(crate) access: Decision,
    /// The pinned-connection registry.
    pub(crate) pinned: Option<Arc<dyn PinnedConnections>>,
}

impl Default for RigSpec {
    fn default() -> Self {
        RigSpec {
            events: Vec::new(),
            script: Vec::new(),
            miss_access: None,
            access: Decision::Allowed,
            pinned: None,
        }
    }
}

/// Build a rig over `rt` per `spec`.
pub(crate) fn rig(rt: &MockRuntime, spec: RigSpec) -> Rig {
    let network = MockNetwork::new();
    let client_rt = network
        .builder()
        .add_address("192.0.2.7".parse().unwrap())
        .add_address("2001:db8::7".parse().unwrap())
        .runtime(rt.clone());

    let opener_config = Arc::new(OpenerConfig::default());
    let config = Arc::new(
        ForwardConfig::builder()
            .miss_access(spec.miss_access)
            .build()
            .unwrap(),
    );
    let pool = PconnPool::new(&client_rt);
    let gates = OpenerGates::new(&client_rt, Arc::clone(&opener_config));
    let store = FakeStore::new();
    let exchange = ScriptedExchange::new(spec.script);
    exchange.set_store(Arc::clone(&store));

    let ctx = Arc::new(
        ForwardContext::builder()
            .runtime(client_rt.clone())
            .config(config)
            .opener_config(opener_config)
            .pool(pool)
            .gates(gates)
            .policy(Arc::new(WirePolicy::permissive()))
            .selector(ListSelector::new(spec.events) as Arc<dyn PeerSelector>)
            .securer(Arc::new(NoTlsNeeded) as Arc<dyn LinkSecurer>)
            .pinned(spec.pinned.unwrap_or_else(|| Arc::new(NoPinned)))
            .exchange(Arc::clone(&exchange) as Arc<dyn Exchange>)
            .renderer(Arc::new(BasicErrorPages))
            .access(Arc::new(ConstantAccess(spec.access)) as Arc<dyn AccessCheck>)
            .diversions(Arc::new(NoDiversions))
            .build()
            .unwrap(),
    );

    Rig {
        rt: client_rt,
        network,
        ctx,
        store,
        exchange,
    }
}

/// Add a listener at `addr` to `network`, kept alive for the test.
pub(crate) async fn listen(network: &Arc<MockNetwork>, rt: &MockRuntime, addr: &str) {
    let addr: std::net::SocketAddr = addr.parse().unwrap();
    let server_rt = network.builder().add_address(addr.ip()).runtime(rt.clone());
    let listener = server_rt.mock_net().listen(&addr).await.unwrap();
    std::mem::forget(listener);
}

/// A GET request for `http://origin.example.net/`.
pub(crate) fn get_request() -> RequestInfo {
    RequestInfo::builder()
        .method(Method::Get)
        .scheme(Scheme::Http)
        .host("origin.example.net".into())
        .port(80)
        .client_addr("198.51.100.9".parse().unwrap())
        .build()
        .unwrap()
}

/// A CONNECT request for `origin.example.net:443`.
pub(crate) fn connect_request() -> RequestInfo {
    let mut request = RequestInfo::builder()
        .method(Method::Connect)
        .scheme(Scheme::Https)
        .host("origin.example.net".into())
        .port(443)
        .client_addr("198.51.100.9".parse().unwrap())
        .build()
        .unwrap();
    request.flags_mut().connect = true;
    request
}

/// A link over one end of an in-memory stream pair; the other end is
/// returned for the test to script.
pub(crate) fn paired_link(rt: &MockRuntime) -> (Link, tor_rtmock::io::LocalStream) {
    let (ours, theirs) = tor_rtmock::io::stream_pair();
    let link = Link::new(
        ferry_peers::PathProfile::direct("192.0.2.33:443".parse().unwrap()),
        Box::new(ours),
        rt.now(),
    );
    (link, theirs)
}

/// Shorthand for a direct-path selection event.
pub(crate) fn path_event(addr: &str) -> DestinationEvent {
    DestinationEvent::Path(ferry_peers::PathProfile::direct(addr.parse().unwrap()))
}
