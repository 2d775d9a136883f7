//! Contracts with the external collaborators of the forwarding core.
//!
//! The forwarding drivers do not parse HTTP, store objects, render error
//! pages, or resolve special request classes themselves; the embedder
//! supplies those behaviors through the traits here.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;

use ferry_peers::{Link, RequestInfo};

use crate::err::Error;

/// The store entry a forwarded reply is written into.
///
/// The drivers never write body bytes themselves (the protocol exchange
/// does that); they consult and finalize the entry.
pub trait StoreSink: Send + Sync {
    /// Whether no reply bytes have been committed yet.
    fn is_empty(&self) -> bool;
    /// Whether the entry is still being filled.
    fn is_pending(&self) -> bool;
    /// Whether the store has abandoned this entry.
    fn is_aborted(&self) -> bool;
    /// Abandon the entry from our side.
    fn abort(&self);
    /// Discard any committed reply data, ready for another attempt.
    fn reset(&self);
    /// Mark the reply complete: header and entire body were stored.
    fn complete_successfully(&self, reason: &'static str);
    /// Mark the reply complete but possibly truncated.
    fn complete_truncated(&self, reason: &'static str);
    /// Append a locally-rendered error page as the reply.
    fn append_error_page(&self, status: u16, body: Vec<u8>);
    /// Take a reference on the entry.
    fn lock(&self, tag: &'static str);
    /// Release a reference taken with [`lock`](Self::lock).
    fn unlock(&self, tag: &'static str);
    /// A future that resolves if the store aborts the entry.
    fn wait_abort(&self) -> BoxFuture<'static, ()>;
}

/// The server-side protocol exchange: everything that happens on an
/// established connection after forwarding hands it over.
///
/// Implementations drive HTTP (or an FTP/WHOIS gateway, chosen by scheme
/// and peer), writing the reply into the store entry as it arrives.
#[async_trait]
pub trait Exchange: Send + Sync {
    /// Run the exchange over `server`.
    async fn run(
        &self,
        server: Link,
        request: &RequestInfo,
        entry: &Arc<dyn StoreSink>,
    ) -> ExchangeOutcome;
}

/// How a protocol exchange ended.
#[derive(Debug)]
#[non_exhaustive]
pub enum ExchangeOutcome {
    /// A reply arrived (not necessarily a happy one).
    Completed {
        /// The reply status line's code.
        status: u16,
        /// Set when the entire reply, body included, was stored; the
        /// string says why the exchange is sure.
        stored_whole: Option<&'static str>,
        /// The server connection, when it is still open and reusable.
        server: Option<Link>,
    },
    /// The server connection closed before a complete reply arrived.
    ServerClosed,
    /// The exchange abandoned the transaction (store abort, client gone).
    Aborted,
}

/// Access to connections pinned to the requesting client.
pub trait PinnedConnections: Send + Sync {
    /// Borrow the to-server connection pinned for this request.
    fn borrow_pinned(&self, request: &RequestInfo) -> Result<Link, PinnedError>;
}

/// The pinned to-server connection could not be used.
#[derive(Debug, Clone, thiserror::Error)]
#[error("pinned connection unusable: {reason}")]
#[non_exhaustive]
pub struct PinnedError {
    /// Why the pinned connection could not be borrowed.
    pub reason: String,
}

impl PinnedError {
    /// Construct an error with the given reason.
    pub fn new(reason: impl Into<String>) -> Self {
        PinnedError {
            reason: reason.into(),
        }
    }
}

/// A [`PinnedConnections`] for deployments with no connection pinning.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoPinned;

impl PinnedConnections for NoPinned {
    fn borrow_pinned(&self, _request: &RequestInfo) -> Result<Link, PinnedError> {
        Err(PinnedError::new("no pinned connections available"))
    }
}

/// A rendered error page.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct ErrorPage {
    /// The HTTP status to answer with.
    pub status: u16,
    /// The response body.
    pub body: Vec<u8>,
}

impl ErrorPage {
    /// Render this page as a complete HTTP/1.1 response.
    ///
    /// Used when the page must be written to a raw client connection
    /// (tunnels); replies through the store carry status and body
    /// separately.
    pub fn to_http(&self) -> Vec<u8> {
        let mut out = format!(
            "HTTP/1.1 {} {}\r\nContent-Type: text/html\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            self.status,
            reason_phrase(self.status),
            self.body.len()
        )
        .into_bytes();
        out.extend_from_slice(&self.body);
        out
    }
}

/// The standard reason phrase for the statuses we emit.
fn reason_phrase(status: u16) -> &'static str {
    match status {
        403 => "Forbidden",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        _ => "Error",
    }
}

/// Renders [`Error`]s into pages for the client.
pub trait ErrorPageRenderer: Send + Sync {
    /// Render a page describing `error`.
    fn render(&self, error: &Error, request: &RequestInfo) -> ErrorPage;
}

/// A plain, template-free [`ErrorPageRenderer`].
#[derive(Debug, Clone, Copy, Default)]
pub struct BasicErrorPages;

impl ErrorPageRenderer for BasicErrorPages {
    fn render(&self, error: &Error, request: &RequestInfo) -> ErrorPage {
        let status = error.http_status(request.flags().needs_validation);
        let body = format!(
            "<html><head><title>{status}</title></head>\
             <body><h1>Unable to forward the request</h1><p>{error}</p></body></html>"
        )
        .into_bytes();
        ErrorPage { status, body }
    }
}

/// Handlers for request classes the forwarder routes elsewhere before
/// doing any forwarding work.
pub trait Diversions: Send + Sync {
    /// Serve an internally-generated request.
    fn internal_request(&self, request: &RequestInfo, entry: &Arc<dyn StoreSink>);
    /// Resolve a URN request.
    fn urn_request(&self, request: &RequestInfo, entry: &Arc<dyn StoreSink>);
}

/// A [`Diversions`] for embedders with neither internal requests nor URN
/// support: every diverted request gets a truncated empty reply.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoDiversions;

impl Diversions for NoDiversions {
    fn internal_request(&self, request: &RequestInfo, entry: &Arc<dyn StoreSink>) {
        tracing::warn!("no handler for internal request to {}", request.host());
        entry.complete_truncated("internal request with no handler");
    }
    fn urn_request(&self, request: &RequestInfo, entry: &Arc<dyn StoreSink>) {
        tracing::warn!("no handler for URN request to {}", request.host());
        entry.complete_truncated("URN request with no handler");
    }
}
