//! Endpoints and contacts: the things a routing table stores.

use crate::node::NodeId;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::Instant;

/// An IPv4 endpoint with a validated, nonzero port.
///
/// The compact node/peer wire formats are IPv4-only (see the crate's
/// non-goals around IPv6), so this wraps `SocketAddrV4` rather than the
/// general `SocketAddr`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Endpoint(SocketAddrV4);

impl Endpoint {
    pub fn new(ip: Ipv4Addr, port: u16) -> Option<Endpoint> {
        if port == 0 {
            return None;
        }
        Some(Endpoint(SocketAddrV4::new(ip, port)))
    }

    pub fn from_socket_addr_v4(addr: SocketAddrV4) -> Option<Endpoint> {
        Self::new(*addr.ip(), addr.port())
    }

    pub fn ip(&self) -> Ipv4Addr {
        *self.0.ip()
    }

    pub fn port(&self) -> u16 {
        self.0.port()
    }

    pub fn socket_addr(&self) -> SocketAddrV4 {
        self.0
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A remote node's identity, address, and freshness, as stored in a
/// [`crate::routing::RoutingTable`].
#[derive(Debug, Clone)]
pub struct Contact {
    pub id: NodeId,
    pub endpoint: Endpoint,
    pub last_seen: Instant,
}

impl Contact {
    pub fn new(id: NodeId, endpoint: Endpoint) -> Contact {
        Contact {
            id,
            endpoint,
            last_seen: Instant::now(),
        }
    }

    pub fn touch(&mut self) {
        self.last_seen = Instant::now();
    }
}

impl PartialEq for Contact {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}
impl Eq for Contact {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_zero_is_rejected() {
        assert!(Endpoint::new(Ipv4Addr::LOCALHOST, 0).is_none());
    }

    #[test]
    fn valid_port_is_accepted() {
        assert!(Endpoint::new(Ipv4Addr::LOCALHOST, 6881).is_some());
    }

    #[test]
    fn contact_equality_is_by_id_only() {
        let id = NodeId::random();
        let a = Contact::new(id, Endpoint::new(Ipv4Addr::new(1, 2, 3, 4), 6881).unwrap());
        let b = Contact::new(id, Endpoint::new(Ipv4Addr::new(5, 6, 7, 8), 6969).unwrap());
        assert_eq!(a, b);
    }
}
