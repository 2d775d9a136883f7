//! Outgoing-address selection and packet-marking policy.
//!
//! Before a fresh connection is opened, its [`PathProfile`] is prepared:
//! the local address may be constrained (to a configured outgoing address,
//! or to the spoofed client address for transparently intercepted
//! traffic), and TOS / netfilter-mark values are chosen by walking an
//! ACL-guarded table.  The core computes and records these attributes on
//! the profile; applying them to sockets is platform glue outside this
//! workspace.

use std::net::IpAddr;
use std::sync::Arc;

use crate::access::{AccessCheck, Decision};
use crate::path::PathProfile;
use crate::request::RequestInfo;

/// One row of the packet-marking table.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct MarkingEntry {
    /// Name of the access list guarding this row; None matches always.
    pub acl: Option<String>,
    /// Type-of-service value to set (0 = none).
    pub tos: u8,
    /// Netfilter mark to set (0 = none).
    pub nfmark: u32,
}

/// One row of the outgoing-address table.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct OutgoingAddressEntry {
    /// Name of the access list guarding this row; None matches always.
    pub acl: Option<String>,
    /// The local address to bind when this row matches.
    pub addr: IpAddr,
}

/// The network policy applied to every fresh outgoing connection.
#[derive(derive_builder::Builder)]
pub struct WirePolicy {
    /// The access checker used to evaluate guarded table rows.
    access: Arc<dyn AccessCheck>,
    /// TOS/mark rows consulted in order; first match wins.
    #[builder(default)]
    markings: Vec<MarkingEntry>,
    /// Outgoing-address rows consulted in order; first family-compatible
    /// match wins.
    #[builder(default)]
    outgoing: Vec<OutgoingAddressEntry>,
}

impl std::fmt::Debug for WirePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WirePolicy")
            .field("markings", &self.markings.len())
            .field("outgoing", &self.outgoing.len())
            .finish_non_exhaustive()
    }
}

impl WirePolicy {
    /// Return a new builder for constructing a [`WirePolicy`].
    pub fn builder() -> WirePolicyBuilder {
        WirePolicyBuilder::default()
    }

    /// A policy that marks nothing and binds nothing.
    pub fn permissive() -> Self {
        WirePolicy {
            access: Arc::new(crate::access::ConstantAccess(Decision::Allowed)),
            markings: Vec::new(),
            outgoing: Vec::new(),
        }
    }

    /// Prepare `profile` for a fresh connection attempt on behalf of
    /// `request`: pick a local address and record packet markings.
    pub fn prepare(&self, request: &RequestInfo, profile: &mut PathProfile) {
        self.select_outgoing_address(request, profile);
        let (tos, nfmark) = self.markings_for(request);
        profile.set_markings(tos, nfmark);
        tracing::trace!(
            "prepared {}: tos {} mark {}",
            profile,
            tos,
            nfmark
        );
    }

    /// Walk the marking table and return the first matching (tos, nfmark).
    fn markings_for(&self, request: &RequestInfo) -> (u8, u32) {
        for entry in &self.markings {
            let matched = match &entry.acl {
                None => true,
                Some(acl) => self.access.fast_check(acl, request).allowed(),
            };
            if matched {
                return (entry.tos, entry.nfmark);
            }
        }
        (0, 0)
    }

    /// Choose the local address for `profile`, if anything constrains it.
    fn select_outgoing_address(&self, request: &RequestInfo, profile: &mut PathProfile) {
        // An address chosen earlier (e.g. by selection) wins.
        if profile.local().is_some() {
            return;
        }

        // Transparent interception spoofs the client address, unless the
        // destination peer opts out.
        if request.flags().spoof_client_ip {
            let peer_allows = profile
                .peer()
                .map_or(true, |peer| !peer.options().no_tproxy);
            if peer_allows {
                if let Some(client) = request.client_addr() {
                    // Port 0: let the stack pick, to avoid address clashes.
                    profile.set_local(std::net::SocketAddr::new(client, 0));
                    return;
                }
            }
        }

        let want_v4 = profile.remote().is_ipv4();
        for entry in &self.outgoing {
            // The outgoing address must be usable toward the destination.
            if entry.addr.is_ipv4() != want_v4 {
                continue;
            }
            let matched = match &entry.acl {
                None => true,
                Some(acl) => self.access.fast_check(acl, request).allowed(),
            };
            if matched {
                profile.set_local(std::net::SocketAddr::new(entry.addr, 0));
                return;
            }
        }
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::bool_assert_comparison)]
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::access::ConstantAccess;
    use crate::request::{Method, RequestInfo, Scheme};

    /// A request to exercise policy walks with.
    fn request(spoof: bool) -> RequestInfo {
        let mut req = RequestInfo::builder()
            .method(Method::Get)
            .scheme(Scheme::Http)
            .host("origin.example.net".into())
            .port(80)
            .client_addr("198.51.100.7".parse().unwrap())
            .build()
            .unwrap();
        req.flags_mut().spoof_client_ip = spoof;
        req
    }

    /// An access checker that allows exactly one named list.
    struct OneList(&'static str);
    impl AccessCheck for OneList {
        fn fast_check(&self, list: &str, _req: &RequestInfo) -> Decision {
            if list == self.0 {
                Decision::Allowed
            } else {
                Decision::Denied
            }
        }
    }

    #[test]
    fn first_matching_marking_wins() {
        let policy = WirePolicy::builder()
            .access(Arc::new(OneList("gold")) as Arc<dyn AccessCheck>)
            .markings(vec![
                MarkingEntry {
                    acl: Some("silver".into()),
                    tos: 0x10,
                    nfmark: 1,
                },
                MarkingEntry {
                    acl: Some("gold".into()),
                    tos: 0x20,
                    nfmark: 2,
                },
            ])
            .build()
            .unwrap();

        let mut profile = PathProfile::direct("192.0.2.1:80".parse().unwrap());
        policy.prepare(&request(false), &mut profile);
        assert_eq!(profile.markings(), (0x20, 2));
    }

    #[test]
    fn spoofed_client_address_beats_table() {
        let policy = WirePolicy::builder()
            .access(Arc::new(ConstantAccess(Decision::Allowed)) as Arc<dyn AccessCheck>)
            .outgoing(vec![OutgoingAddressEntry {
                acl: None,
                addr: "192.0.2.99".parse().unwrap(),
            }])
            .build()
            .unwrap();

        let mut profile = PathProfile::direct("192.0.2.1:80".parse().unwrap());
        policy.prepare(&request(true), &mut profile);
        let local = profile.local().unwrap();
        assert_eq!(local.ip(), "198.51.100.7".parse::<IpAddr>().unwrap());
        assert_eq!(local.port(), 0);
    }

    #[test]
    fn outgoing_address_family_must_match() {
        let policy = WirePolicy::builder()
            .access(Arc::new(ConstantAccess(Decision::Allowed)) as Arc<dyn AccessCheck>)
            .outgoing(vec![
                OutgoingAddressEntry {
                    acl: None,
                    addr: "2001:db8::5".parse().unwrap(),
                },
                OutgoingAddressEntry {
                    acl: None,
                    addr: "192.0.2.5".parse().unwrap(),
                },
            ])
            .build()
            .unwrap();

        let mut profile = PathProfile::direct("192.0.2.1:80".parse().unwrap());
        policy.prepare(&request(false), &mut profile);
        assert_eq!(
            profile.local().unwrap().ip(),
            "192.0.2.5".parse::<IpAddr>().unwrap()
        );
    }
}
