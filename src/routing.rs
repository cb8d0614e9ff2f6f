//! Kademlia k-bucket routing table.
//!
//! 160 buckets, one per bit position of the XOR distance space. Unlike a
//! textbook Kademlia table, a full bucket is replaced immediately (no
//! ping-the-LRU-first probe) -- see `DESIGN.md` for why this implementation
//! keeps that policy rather than the BEP 5-recommended variant.

use crate::contact::{Contact, Endpoint};
use crate::node::NodeId;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Default bucket capacity.
pub const DEFAULT_K: usize = 8;

pub const NUM_BUCKETS: usize = 160;

/// Hard cap on `closest_nodes` callers, to keep a single pathological
/// request from forcing an unbounded allocation.
const MAX_CLOSEST: usize = 1000;

/// Outcome of a single [`RoutingTable::insert`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// The id was already present; its freshness was refreshed.
    Updated,
    /// The bucket had room and the contact was appended.
    Inserted,
    /// The bucket was full; the least-recently-seen contact was evicted.
    Replaced,
    /// Rejected: the id was our own, or otherwise out of bounds.
    Rejected,
}

struct Bucket {
    contacts: VecDeque<Contact>,
    capacity: usize,
}

impl Bucket {
    fn new(capacity: usize) -> Bucket {
        Bucket {
            contacts: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    fn insert(&mut self, contact: Contact) -> InsertOutcome {
        if let Some(pos) = self.contacts.iter().position(|c| c.id == contact.id) {
            let mut existing = self.contacts.remove(pos).unwrap();
            existing.endpoint = contact.endpoint;
            existing.touch();
            self.contacts.push_back(existing);
            return InsertOutcome::Updated;
        }

        if self.contacts.len() < self.capacity {
            self.contacts.push_back(contact);
            return InsertOutcome::Inserted;
        }

        // Bucket full: evict the least-recently-seen (front) contact. A
        // production DHT would ping it first and only replace on timeout;
        // this engine replaces immediately (see Open Question (a)).
        self.contacts.pop_front();
        self.contacts.push_back(contact);
        InsertOutcome::Replaced
    }

    fn remove(&mut self, id: &NodeId) -> bool {
        if let Some(pos) = self.contacts.iter().position(|c| c.id == *id) {
            self.contacts.remove(pos);
            true
        } else {
            false
        }
    }

    fn prune_stale(&mut self, max_age: Duration) {
        let now = Instant::now();
        self.contacts.retain(|c| now.duration_since(c.last_seen) < max_age);
    }
}

/// A Kademlia routing table bounded by 160 k-buckets.
pub struct RoutingTable {
    own_id: NodeId,
    buckets: Vec<Bucket>,
    k: usize,
}

impl RoutingTable {
    /// Creates a table for `own_id` with the given per-bucket capacity `k`.
    ///
    /// `k` is clamped into `[1, 100]` per the data model's documented range.
    pub fn new(own_id: NodeId, k: usize) -> RoutingTable {
        let k = k.clamp(1, 100);
        let buckets = (0..NUM_BUCKETS).map(|_| Bucket::new(k)).collect();
        RoutingTable { own_id, buckets, k }
    }

    pub fn own_id(&self) -> NodeId {
        self.own_id
    }

    pub fn k(&self) -> usize {
        self.k
    }

    /// The bucket index for a remote id: the position (0-indexed from the
    /// most-significant bit) of the leading 1 bit of `own_id XOR id`.
    /// Returns `None` for our own id (distance zero has no leading bit).
    pub fn bucket_index(&self, id: &NodeId) -> Option<usize> {
        self.own_id.distance(id).leading_bit()
    }

    /// Inserts or refreshes a contact. Rejects (silently, via the returned
    /// [`InsertOutcome::Rejected`]) insertion of our own id.
    pub fn insert(&mut self, contact: Contact) -> InsertOutcome {
        match self.bucket_index(&contact.id) {
            Some(idx) => self.buckets[idx].insert(contact),
            None => InsertOutcome::Rejected,
        }
    }

    pub fn remove(&mut self, id: &NodeId) -> bool {
        match self.bucket_index(id) {
            Some(idx) => self.buckets[idx].remove(id),
            None => false,
        }
    }

    /// The `min(n, total, 1000)` contacts closest to `target`, sorted
    /// ascending by XOR distance. Ties break on endpoint ordering so the
    /// result is deterministic.
    pub fn closest_nodes(&self, target: &NodeId, n: usize) -> Vec<Contact> {
        let n = n.min(MAX_CLOSEST);
        let mut all: Vec<&Contact> = self.buckets.iter().flat_map(|b| b.contacts.iter()).collect();
        all.sort_by(|a, b| {
            let da = a.id.distance(target);
            let db = b.id.distance(target);
            da.cmp(&db).then_with(|| cmp_endpoint(&a.endpoint, &b.endpoint))
        });
        all.into_iter().take(n).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.contacts.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, id: &NodeId) -> Option<&Contact> {
        let idx = self.bucket_index(id)?;
        self.buckets[idx].contacts.iter().find(|c| c.id == *id)
    }

    /// Drops contacts not seen within `max_age`, across every bucket.
    pub fn prune_stale(&mut self, max_age: Duration) {
        for bucket in &mut self.buckets {
            bucket.prune_stale(max_age);
        }
    }
}

fn cmp_endpoint(a: &Endpoint, b: &Endpoint) -> std::cmp::Ordering {
    (a.ip(), a.port()).cmp(&(b.ip(), b.port()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn contact_at(idx: usize) -> Contact {
        let endpoint = Endpoint::new(Ipv4Addr::new(10, 0, 0, (idx % 250) as u8 + 1), 6881).unwrap();
        Contact::new(NodeId::random(), endpoint)
    }

    #[test]
    fn bucket_index_in_range() {
        let table = RoutingTable::new(NodeId::random(), DEFAULT_K);
        for _ in 0..200 {
            let id = NodeId::random();
            if let Some(idx) = table.bucket_index(&id) {
                assert!(idx < NUM_BUCKETS);
            }
        }
    }

    #[test]
    fn own_id_insertion_is_noop() {
        let own_id = NodeId::random();
        let mut table = RoutingTable::new(own_id, DEFAULT_K);
        let contact = Contact::new(own_id, Endpoint::new(Ipv4Addr::LOCALHOST, 6881).unwrap());
        assert_eq!(table.insert(contact), InsertOutcome::Rejected);
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn insert_then_update_refreshes_in_place() {
        let mut table = RoutingTable::new(NodeId::random(), DEFAULT_K);
        let id = NodeId::random();
        let ep = Endpoint::new(Ipv4Addr::LOCALHOST, 6881).unwrap();
        assert_eq!(table.insert(Contact::new(id, ep)), InsertOutcome::Inserted);
        assert_eq!(table.insert(Contact::new(id, ep)), InsertOutcome::Updated);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn bucket_overflow_replaces_lru() {
        let own_id = NodeId::ZERO;
        let mut table = RoutingTable::new(own_id, 2);

        // Force three distinct ids that land in the same bucket by sharing
        // a bucket index: flip only the lowest bit so they all have
        // leading_bit() == 159 relative to the zero own_id.
        let mut ids = Vec::new();
        for i in 1u8..=3 {
            let mut buf = [0u8; crate::node::ID_LEN];
            buf[crate::node::ID_LEN - 1] = i;
            ids.push(NodeId::from_bytes(buf));
        }

        let ep = |n: u8| Endpoint::new(Ipv4Addr::new(127, 0, 0, n), 6881).unwrap();
        assert_eq!(
            table.insert(Contact::new(ids[0], ep(1))),
            InsertOutcome::Inserted
        );
        assert_eq!(
            table.insert(Contact::new(ids[1], ep(2))),
            InsertOutcome::Inserted
        );
        assert_eq!(
            table.insert(Contact::new(ids[2], ep(3))),
            InsertOutcome::Replaced
        );
        assert_eq!(table.len(), 2);
        assert!(table.get(&ids[0]).is_none(), "LRU victim should be evicted");
        assert!(table.get(&ids[1]).is_some());
        assert!(table.get(&ids[2]).is_some());
    }

    #[test]
    fn closest_nodes_on_empty_table_is_empty() {
        let table = RoutingTable::new(NodeId::random(), DEFAULT_K);
        assert!(table.closest_nodes(&NodeId::random(), 8).is_empty());
    }

    #[test]
    fn closest_nodes_sorted_ascending() {
        let mut table = RoutingTable::new(NodeId::random(), DEFAULT_K);
        for i in 0..50 {
            let _ = table.insert(contact_at(i));
        }
        let target = NodeId::random();
        let closest = table.closest_nodes(&target, 10);
        assert!(closest.len() <= 10);
        for w in closest.windows(2) {
            assert!(w[0].id.distance(&target) <= w[1].id.distance(&target));
        }
    }

    #[test]
    fn prune_stale_with_zero_max_age_clears_everything() {
        let mut table = RoutingTable::new(NodeId::random(), DEFAULT_K);
        for i in 0..10 {
            let _ = table.insert(contact_at(i));
        }
        assert!(table.len() > 0);
        table.prune_stale(Duration::ZERO);
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn no_bucket_exceeds_k() {
        let own_id = NodeId::ZERO;
        let mut table = RoutingTable::new(own_id, 4);
        for i in 1u8..=20 {
            let mut buf = [0u8; crate::node::ID_LEN];
            buf[crate::node::ID_LEN - 1] = i;
            let id = NodeId::from_bytes(buf);
            let ep = Endpoint::new(Ipv4Addr::new(127, 0, 0, i), 6881).unwrap();
            let _ = table.insert(Contact::new(id, ep));
        }
        assert!(table.buckets.iter().all(|b| b.contacts.len() <= 4));
    }
}
