//! Shared destination lists and the peer-selection subscription contract.

use std::sync::Mutex;

use futures::stream::BoxStream;
use postage::watch;

use crate::path::PathProfile;
use crate::request::RequestInfo;
use crate::resolved::ResolvedPeers;

/// One notification from peer selection.
#[derive(Debug)]
#[non_exhaustive]
pub enum DestinationEvent {
    /// A new candidate destination is available.
    Path(PathProfile),
    /// Use the connection pinned to the requesting client.
    ///
    /// When this is sent at all, it is the first and only destination.
    UsePinned,
    /// Peer selection has finished; no further paths will arrive.
    ///
    /// Carries the selection error when selection failed outright.
    End(Option<SelectionError>),
}

/// Peer selection produced no usable result.
#[derive(Debug, Clone, thiserror::Error)]
#[error("peer selection failed: {reason}")]
#[non_exhaustive]
pub struct SelectionError {
    /// Human-readable reason, for the error page and the access log.
    pub reason: String,
}

impl SelectionError {
    /// Construct a selection error with the given reason.
    pub fn new(reason: impl Into<String>) -> Self {
        SelectionError {
            reason: reason.into(),
        }
    }
}

/// The contract by which the forwarding core receives candidate paths.
///
/// Implementations run the (external) peer-selection algorithm and yield
/// [`DestinationEvent`]s.  Dropping the returned stream unsubscribes.
pub trait PeerSelector: Send + Sync {
    /// Begin producing destinations for the given transaction.
    fn subscribe(&self, request: &RequestInfo) -> BoxStream<'static, DestinationEvent>;
}

/// A [`ResolvedPeers`] list shared between a forwarding driver and its
/// connection opener, with a change signal.
///
/// The driver appends paths as peer selection yields them; the opener
/// watches the change signal and re-examines the list.  Multiple changes
/// between looks coalesce into one wakeup.
pub struct Destinations {
    /// The candidate paths.
    inner: Mutex<ResolvedPeers>,
    /// Sender half of the change signal.
    tx: Mutex<watch::Sender<u64>>,
    /// Receiver half of the change signal, cloned out to watchers.
    rx: watch::Receiver<u64>,
}

impl Destinations {
    /// Return a new, empty destination list.
    pub fn new() -> Self {
        let (tx, rx) = watch::channel();
        Destinations {
            inner: Mutex::new(ResolvedPeers::new()),
            tx: Mutex::new(tx),
            rx,
        }
    }

    /// Run `f` with exclusive access to the path list.
    ///
    /// Mutations made through this method do not notify watchers; call
    /// [`note_change`](Self::note_change) afterwards if they should.
    pub fn with<T>(&self, f: impl FnOnce(&mut ResolvedPeers) -> T) -> T {
        let mut inner = self.inner.lock().expect("poisoned lock");
        f(&mut inner)
    }

    /// Wake any watcher: the path list has changed.
    pub fn note_change(&self) {
        let mut tx = self.tx.lock().expect("poisoned lock");
        let next = *tx.borrow() + 1;
        *tx.borrow_mut() = next;
    }

    /// Return a receiver that yields a value after every
    /// [`note_change`](Self::note_change).
    ///
    /// The receiver also yields the current generation immediately, which
    /// makes "subscribe, then look at the list" free of lost-wakeup races.
    pub fn watch(&self) -> watch::Receiver<u64> {
        self.rx.clone()
    }
}

impl Default for Destinations {
    fn default() -> Self {
        Destinations::new()
    }
}

impl std::fmt::Debug for Destinations {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock().expect("poisoned lock");
        write!(f, "Destinations({})", *inner)
    }
}
