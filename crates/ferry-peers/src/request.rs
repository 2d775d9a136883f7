//! A minimal description of the transaction whose request is being forwarded.
//!
//! The forwarding core does not parse HTTP; the embedder hands it the few
//! facts about the already-parsed request that forwarding decisions depend
//! on: the method (for retry safety), the target authority, the scheme, and
//! a set of transaction flags.

use std::net::IpAddr;

use serde::{Deserialize, Serialize};

/// The request method, reduced to what forwarding policy needs.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[non_exhaustive]
pub enum Method {
    /// GET
    Get,
    /// HEAD
    Head,
    /// POST
    Post,
    /// PUT
    Put,
    /// DELETE
    Delete,
    /// OPTIONS
    Options,
    /// TRACE
    Trace,
    /// CONNECT
    Connect,
    /// Any other method, carried verbatim.
    Other(String),
}

impl Method {
    /// Return true if this is a safe method (RFC 9110 §9.2.1).
    pub fn is_http_safe(&self) -> bool {
        matches!(
            self,
            Method::Get | Method::Head | Method::Options | Method::Trace
        )
    }

    /// Return true if this is an idempotent method (RFC 9110 §9.2.2).
    pub fn is_idempotent(&self) -> bool {
        self.is_http_safe() || matches!(self, Method::Put | Method::Delete)
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Method::Get => "GET",
            Method::Head => "HEAD",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Options => "OPTIONS",
            Method::Trace => "TRACE",
            Method::Connect => "CONNECT",
            Method::Other(s) => s.as_str(),
        };
        write!(f, "{}", s)
    }
}

/// The scheme of the request URL, reduced to what dispatch needs.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
#[non_exhaustive]
pub enum Scheme {
    /// Plain HTTP.
    Http,
    /// HTTP over TLS.
    Https,
    /// FTP, relayed through an external gateway.
    Ftp,
    /// WHOIS, relayed through an external gateway.
    Whois,
    /// URN, resolved by an external resolver before forwarding.
    Urn,
}

/// Transaction flags that modify forwarding behavior.
///
/// These correspond to facts established before forwarding starts: how the
/// request reached us, what TLS interception steps have already happened,
/// and whether the request is bound to a particular client-side state.
#[derive(Debug, Clone, Default, Eq, PartialEq, Serialize, Deserialize)]
#[non_exhaustive]
pub struct RequestFlags {
    /// The client sent us a CONNECT request.
    pub connect: bool,
    /// The request was intercepted (NAT or policy routing), not proxied.
    pub intercepted: bool,
    /// The request was intercepted transparently (TPROXY).
    pub tproxy: bool,
    /// Outgoing connections should spoof the client address.
    pub spoof_client_ip: bool,
    /// The transaction has been elevated to raw-byte tunneling.
    pub force_tunnel: bool,
    /// We are peeking at the TLS client hello before deciding what to do.
    pub tls_peek: bool,
    /// The client connection was already client-first bumped.
    pub tls_bumped: bool,
    /// The request was generated internally rather than by a client.
    pub internal: bool,
    /// The request must reuse a particular to-server connection.
    pub pinned: bool,
    /// Part of the request body has already been consumed.
    pub body_consumed: bool,
    /// The request has a body that is streamed (and cannot be replayed).
    pub has_body: bool,
    /// A cached reply is being validated; affects error status selection.
    pub needs_validation: bool,
}

/// Facts about one transaction that the forwarding core consults.
#[derive(Debug, Clone, derive_builder::Builder)]
#[builder(derive(Debug))]
pub struct RequestInfo {
    /// The request method.
    method: Method,
    /// The request scheme.
    scheme: Scheme,
    /// The host part of the target authority.
    host: String,
    /// The port part of the target authority.
    port: u16,
    /// The address of the requesting client, when there is one.
    ///
    /// Internally-generated requests have no client address.
    #[builder(default, setter(strip_option))]
    client_addr: Option<IpAddr>,
    /// Transaction flags.
    #[builder(default)]
    flags: RequestFlags,
}

impl RequestInfo {
    /// Return a new builder for constructing a [`RequestInfo`].
    pub fn builder() -> RequestInfoBuilder {
        RequestInfoBuilder::default()
    }

    /// Return the request method.
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Return the request scheme.
    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    /// Return the host part of the target authority.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Return the port part of the target authority.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Return the `host:port` authority of this request.
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Return the client address, if the request came from a client.
    pub fn client_addr(&self) -> Option<IpAddr> {
        self.client_addr
    }

    /// Return the transaction flags.
    pub fn flags(&self) -> &RequestFlags {
        &self.flags
    }

    /// Return a mutable reference to the transaction flags.
    pub fn flags_mut(&mut self) -> &mut RequestFlags {
        &mut self.flags
    }
}
