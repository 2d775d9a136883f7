//! Errors that end (or redirect) a forwarding attempt.

use thiserror::Error;

use ferry_handshake::{TlsError, TunnelError};
use ferry_opener::OpenerError;
use ferry_peers::SelectionError;

use crate::contract::PinnedError;

/// Why a transaction could not be forwarded (or could not be forwarded
/// any further).
///
/// Unrecoverable values are turned into error pages by the embedder's
/// renderer; the access log is annotated with [`kind`](Error::kind).
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum Error {
    /// The miss-access policy rejected the client/request tuple.
    #[error("forwarding denied by policy")]
    Forbidden,

    /// The process is shutting down; no new forwarding is started.
    #[error("forwarding refused: shutting down")]
    ShuttingDown,

    /// Peer selection produced no usable destinations.
    #[error(transparent)]
    Selection(#[from] SelectionError),

    /// All attempted transports failed.
    #[error("connection failed")]
    Connect(#[from] OpenerError),

    /// The parent proxy refused or garbled its CONNECT response.
    #[error("tunnel through parent proxy failed")]
    Tunneler(#[from] TunnelError),

    /// The server sent bytes before the tunnel was usable.
    #[error("server talked before the tunnel was established")]
    EarlyServerTalk,

    /// The TLS handshake with the server or peer failed.
    #[error("TLS negotiation failed")]
    Tls(#[from] TlsError),

    /// The client's pinned to-server connection failed; never retried.
    #[error(transparent)]
    Pinned(#[from] PinnedError),

    /// The total forwarding budget expired.
    #[error("forwarding budget expired")]
    Budget,

    /// The server closed before a complete reply arrived.
    #[error("server closed the connection early")]
    ServerClosedEarly,

    /// There are no (more) destinations to forward to.
    #[error("cannot forward the request")]
    CannotForward,

    /// An internal error of some kind that should never occur.
    #[error("Internal error")]
    Internal(#[from] tor_error::Bug),
}

impl Error {
    /// A short, stable label for access-log annotation.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Forbidden => "FORWARDING_DENIED",
            Error::ShuttingDown => "SHUTTING_DOWN",
            Error::Selection(_) => "SELECTION_FAILED",
            Error::Connect(_) => "CONNECT_FAIL",
            Error::Tunneler(_) => "TUNNEL_FAIL",
            Error::EarlyServerTalk => "TUNNEL_EARLY_DATA",
            Error::Tls(_) => "TLS_FAIL",
            Error::Pinned(_) => "PINNED_FAIL",
            Error::Budget => "FORWARDING_TIMEOUT",
            Error::ServerClosedEarly => "SERVER_CLOSED",
            Error::CannotForward => "CANNOT_FORWARD",
            Error::Internal(_) => "INTERNAL",
        }
    }

    /// The HTTP status for the error page describing this failure.
    ///
    /// `needs_validation` selects 504 over 503 where a failed validation
    /// must be reported as a gateway timeout.
    pub fn http_status(&self, needs_validation: bool) -> u16 {
        match self {
            Error::Forbidden => 403,
            Error::ShuttingDown => 503,
            Error::Selection(_) => 500,
            Error::Connect(e) => e.http_status(needs_validation),
            // Preserve a 502/503 from the parent proxy; everything else
            // it said becomes our own bad-gateway report.
            Error::Tunneler(TunnelError::Refused { status })
                if *status == 502 || *status == 503 =>
            {
                *status
            }
            Error::Tunneler(_) => 502,
            Error::EarlyServerTalk => 502,
            Error::Tls(_) => 502,
            Error::Pinned(_) => 502,
            Error::Budget => 504,
            Error::ServerClosedEarly => 502,
            Error::CannotForward => 502,
            Error::Internal(_) => 500,
        }
    }
}
