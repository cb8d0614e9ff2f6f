//! The UDP I/O loop tying the routing table and protocol layer together:
//! bootstrap, the transaction registry, the iterative `scrape_peers` lookup,
//! and the `crawl_network` tick loop.

use crate::contact::{Contact, Endpoint};
use crate::error::DhtError;
use crate::node::NodeId;
use crate::protocol::{self, CompactNode, Query, ResponseFields};
use crate::routing::{self, RoutingTable};
use log::{debug, error, info, warn};
use mio::net::UdpSocket;
use mio::{Events, Interest, Poll, Token};
use rand::seq::SliceRandom;
use rand::RngCore;
use std::collections::{HashMap, HashSet};
use std::net::{Ipv4Addr, SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const SOCKET_TOKEN: Token = Token(0);
const READ_BUF_LEN: usize = 2048;
const CRAWL_BATCH: usize = 5;
const REAP_INTERVAL_TICKS: u64 = 30;
const CONTACT_STALE_AFTER: Duration = Duration::from_secs(15 * 60);
const BEP51_INTERVAL_HINT: i64 = 21600;

/// Construction-time knobs for an [`Engine`].
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub port: u16,
    /// `host:port` strings resolved (via blocking DNS) at bootstrap time.
    pub bootstrap: Vec<String>,
    pub query_timeout: Duration,
    pub k: usize,
    pub alpha: usize,
    pub crawl_query_interval: u64,
    pub bep51_enabled: bool,
    /// Cap on the discovered-info_hash store. `None` means unbounded, which
    /// is the source behavior but is unsafe for an unattended infinite
    /// crawl -- see Open Question (c) in `DESIGN.md`.
    pub discovered_cap: Option<usize>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            port: 6881,
            bootstrap: vec![
                "router.bittorrent.com:6881".to_string(),
                "dht.transmissionbt.com:6881".to_string(),
            ],
            query_timeout: Duration::from_secs(5),
            k: routing::DEFAULT_K,
            alpha: 8,
            crawl_query_interval: 3,
            bep51_enabled: true,
            discovered_cap: None,
        }
    }
}

/// Why a newly observed info_hash was first seen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryTag {
    GetPeers,
    Bep51,
}

/// Fired at most once per newly observed info_hash.
#[derive(Debug, Clone, Copy)]
pub struct DiscoveryEvent {
    pub info_hash: NodeId,
    pub source: Endpoint,
    pub tag: DiscoveryTag,
}

/// Snapshot handed to the progress callback once per crawl tick.
#[derive(Debug, Clone, Copy)]
pub struct ProgressStats {
    pub elapsed_secs: u64,
    pub unique_info_hashes: usize,
    pub discoveries_per_minute: f64,
    pub total_requests_seen: u64,
    pub routing_table_size: usize,
    pub bep51_samples_sent: u64,
    pub bep51_samples_received: u64,
}

struct DiscoveredInfoHash {
    #[allow(dead_code)]
    source: Endpoint,
    #[allow(dead_code)]
    tag: DiscoveryTag,
    request_count: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TransactionKind {
    Bootstrap,
    FindNode,
    GetPeersLookup,
}

struct PendingTransaction {
    kind: TransactionKind,
    dest: Endpoint,
    deadline: Instant,
}

/// State for one in-flight `scrape_peers` call. Updated by
/// [`Engine::handle_response`] whenever a response for a transaction tagged
/// [`TransactionKind::GetPeersLookup`] arrives.
struct LookupState {
    target: NodeId,
    candidates: Vec<Contact>,
    queried: HashSet<NodeId>,
    pending: HashSet<[u8; 2]>,
    peers: Vec<Endpoint>,
    peers_seen: HashSet<Endpoint>,
}

/// A cloneable handle that can request cancellation of a running
/// `scrape_peers`/`crawl_network` call from outside (e.g. a signal handler).
#[derive(Clone)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// The DHT engine: one UDP socket, one routing table, one transaction
/// registry. All mutation happens on whatever thread calls into it --
/// there's no internal locking because there's only ever one writer.
pub struct Engine {
    config: EngineConfig,
    own_id: NodeId,
    socket: UdpSocket,
    poll: Poll,
    events: Events,
    routing_table: RoutingTable,
    transactions: HashMap<[u8; 2], PendingTransaction>,
    discovered: HashMap<NodeId, DiscoveredInfoHash>,
    pending_discoveries: Vec<DiscoveryEvent>,
    active_lookup: Option<LookupState>,
    requests_seen: u64,
    samples_sent: u64,
    samples_received: u64,
    cancelled: Arc<AtomicBool>,
}

impl Engine {
    /// Binds the UDP socket (falling back to an OS-chosen port if the
    /// configured one is taken) and generates a fresh random node id.
    pub fn new(config: EngineConfig) -> Result<Engine, DhtError> {
        let own_id = NodeId::random();
        let k = config.k;

        let mut socket = match UdpSocket::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.port))) {
            Ok(s) => s,
            Err(e) => {
                warn!(
                    "bind on port {} failed ({}), falling back to an OS-chosen port",
                    config.port, e
                );
                match UdpSocket::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))) {
                    Ok(s) => s,
                    Err(e) => {
                        error!("fallback bind to an OS-chosen port also failed: {}", e);
                        return Err(DhtError::Io(e));
                    }
                }
            }
        };

        let poll = Poll::new()?;
        poll.registry()
            .register(&mut socket, SOCKET_TOKEN, Interest::READABLE)?;

        info!("bound DHT socket on {:?}, own id {:?}", socket.local_addr()?, own_id);

        Ok(Engine {
            config,
            own_id,
            socket,
            poll,
            events: Events::with_capacity(1024),
            routing_table: RoutingTable::new(own_id, k),
            transactions: HashMap::new(),
            discovered: HashMap::new(),
            pending_discoveries: Vec::new(),
            active_lookup: None,
            requests_seen: 0,
            samples_sent: 0,
            samples_received: 0,
            cancelled: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn own_id(&self) -> NodeId {
        self.own_id
    }

    pub fn routing_table_len(&self) -> usize {
        self.routing_table.len()
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle(self.cancelled.clone())
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    /// Resolves the configured bootstrap hosts and sends `find_node(own_id)`
    /// to each. Escalates (returns `Err`) only if every send failed.
    pub fn bootstrap(&mut self) -> Result<(), DhtError> {
        let own_id = self.own_id;
        let hosts = self.config.bootstrap.clone();
        let mut successes = 0usize;

        for host in &hosts {
            match host.to_socket_addrs() {
                Ok(addrs) => {
                    for addr in addrs {
                        if let SocketAddr::V4(v4) = addr {
                            if let Some(endpoint) = Endpoint::from_socket_addr_v4(v4) {
                                if self
                                    .send_query(endpoint, Query::FindNode { target: own_id }, TransactionKind::Bootstrap)
                                    .is_ok()
                                {
                                    successes += 1;
                                }
                            }
                        }
                    }
                }
                Err(e) => warn!("failed to resolve bootstrap host {}: {}", host, e),
            }
        }

        if successes == 0 {
            return Err(DhtError::Io(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "no bootstrap endpoint could be reached",
            )));
        }

        let deadline = Instant::now() + self.config.query_timeout;
        while Instant::now() < deadline && !self.transactions.is_empty() && !self.is_cancelled() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let _ = self.poll_once(remaining.min(Duration::from_millis(100)));
        }
        self.reap_expired_transactions();
        Ok(())
    }

    fn next_tid(&self) -> [u8; 2] {
        loop {
            let mut buf = [0u8; 2];
            rand::thread_rng().fill_bytes(&mut buf);
            if !self.transactions.contains_key(&buf) {
                return buf;
            }
        }
    }

    fn send_query(&mut self, dest: Endpoint, query: Query, kind: TransactionKind) -> Result<[u8; 2], DhtError> {
        let tid = self.next_tid();
        let bytes = protocol::build_query(&tid, &self.own_id, &query);
        match self.socket.send_to(&bytes, SocketAddr::V4(dest.socket_addr())) {
            Ok(_) => {
                self.transactions.insert(
                    tid,
                    PendingTransaction {
                        kind,
                        dest,
                        deadline: Instant::now() + self.config.query_timeout,
                    },
                );
                debug!("transaction {:?} ({:?}) created for {:?} to {}", tid, kind, query, dest);
                Ok(tid)
            }
            Err(e) => {
                warn!("send to {} failed: {}", dest, e);
                Err(DhtError::Io(e))
            }
        }
    }

    fn send_bytes(&mut self, dest: Endpoint, bytes: Vec<u8>) {
        if let Err(e) = self.socket.send_to(&bytes, SocketAddr::V4(dest.socket_addr())) {
            warn!("send to {} failed: {}", dest, e);
        }
    }

    fn reap_expired_transactions(&mut self) {
        let now = Instant::now();
        let expired: Vec<[u8; 2]> = self
            .transactions
            .iter()
            .filter(|(_, p)| p.deadline <= now)
            .map(|(tid, _)| *tid)
            .collect();
        for tid in expired {
            self.transactions.remove(&tid);
            if let Some(lookup) = &mut self.active_lookup {
                lookup.pending.remove(&tid);
            }
        }
    }

    /// Polls the socket for up to `timeout`, dispatching any datagrams that
    /// arrive, and reaps expired transactions.
    fn poll_once(&mut self, timeout: Duration) -> Result<(), DhtError> {
        self.poll.poll(&mut self.events, Some(timeout))?;
        self.drain_datagrams();
        self.reap_expired_transactions();
        Ok(())
    }

    fn drain_datagrams(&mut self) {
        let mut buf = [0u8; READ_BUF_LEN];
        loop {
            match self.socket.recv_from(&mut buf) {
                Ok((len, src)) => self.handle_datagram(&buf[..len], src),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!("socket read error: {}", e);
                    break;
                }
            }
        }
    }

    fn handle_datagram(&mut self, bytes: &[u8], src: SocketAddr) {
        let src_v4 = match src {
            SocketAddr::V4(v4) => v4,
            SocketAddr::V6(_) => {
                debug!("dropping datagram from IPv6 peer (out of scope)");
                return;
            }
        };
        let endpoint = match Endpoint::from_socket_addr_v4(src_v4) {
            Some(e) => e,
            None => {
                debug!("dropping datagram from zero-port peer {}", src_v4);
                return;
            }
        };
        match protocol::parse(bytes) {
            Ok(msg) => self.handle_message(msg, endpoint),
            Err(e) => {
                warn!("malformed datagram from {}: {}", endpoint, e.error);
                if e.is_query {
                    if let Some(tid) = e.tid {
                        let bytes = protocol::build_error(&tid, protocol::ERR_PROTOCOL, "malformed request");
                        self.send_bytes(endpoint, bytes);
                    }
                }
            }
        }
    }

    fn handle_message(&mut self, msg: protocol::Message, src: Endpoint) {
        match msg {
            protocol::Message::Query { tid, sender_id, query } => {
                self.handle_query(tid, sender_id, query, src)
            }
            protocol::Message::Response { tid, sender_id, fields } => {
                self.handle_response(tid, sender_id, fields, src)
            }
            protocol::Message::Error { tid, code, text } => {
                debug!("peer {} returned error {} ({}) for tid {:?}", src, code, text, tid);
            }
        }
    }

    fn closest_compact(&self, target: &NodeId, n: usize) -> Vec<CompactNode> {
        self.routing_table
            .closest_nodes(target, n)
            .into_iter()
            .map(|c| CompactNode {
                id: c.id,
                endpoint: c.endpoint,
            })
            .collect()
    }

    fn generate_token(&self) -> Vec<u8> {
        let mut buf = [0u8; 4];
        rand::thread_rng().fill_bytes(&mut buf);
        buf.to_vec()
    }

    /// Picks up to `n` discovered info_hashes at random, without
    /// replacement, for a `sample_infohashes` response.
    fn sample_discovered(&self, n: usize) -> Vec<NodeId> {
        let mut keys: Vec<NodeId> = self.discovered.keys().copied().collect();
        keys.shuffle(&mut rand::thread_rng());
        keys.truncate(n.min(protocol::MAX_SAMPLES));
        keys
    }

    fn record_discovery(&mut self, info_hash: NodeId, source: Endpoint, tag: DiscoveryTag) {
        if self.discovered.contains_key(&info_hash) {
            if let Some(entry) = self.discovered.get_mut(&info_hash) {
                entry.request_count += 1;
            }
            return;
        }
        if let Some(cap) = self.config.discovered_cap {
            if self.discovered.len() >= cap {
                warn!("discovered-info_hash store at cap ({}), dropping new sighting", cap);
                return;
            }
        }
        self.discovered
            .insert(info_hash, DiscoveredInfoHash { source, tag, request_count: 1 });
        self.pending_discoveries.push(DiscoveryEvent { info_hash, source, tag });
    }

    fn handle_query(&mut self, tid: Vec<u8>, sender_id: NodeId, query: Query, src: Endpoint) {
        self.requests_seen += 1;
        let outcome = self.routing_table.insert(Contact::new(sender_id, src));
        debug!("routing table insert of {:?}: {:?}", sender_id, outcome);

        match query {
            Query::Ping => {
                let bytes = protocol::build_response(&tid, &self.own_id, &ResponseFields::default());
                self.send_bytes(src, bytes);
            }
            Query::FindNode { target } => {
                let fields = ResponseFields {
                    nodes: Some(self.closest_compact(&target, 8)),
                    ..Default::default()
                };
                let bytes = protocol::build_response(&tid, &self.own_id, &fields);
                self.send_bytes(src, bytes);
            }
            Query::GetPeers { info_hash } => {
                self.record_discovery(info_hash, src, DiscoveryTag::GetPeers);
                let fields = ResponseFields {
                    nodes: Some(self.closest_compact(&info_hash, 8)),
                    token: Some(self.generate_token()),
                    ..Default::default()
                };
                let bytes = protocol::build_response(&tid, &self.own_id, &fields);
                self.send_bytes(src, bytes);
            }
            Query::SampleInfohashes { target } => {
                if !self.config.bep51_enabled {
                    let bytes = protocol::build_error(&tid, protocol::ERR_METHOD_UNKNOWN, "sample_infohashes disabled");
                    self.send_bytes(src, bytes);
                    return;
                }
                let samples = self.sample_discovered(protocol::MAX_SAMPLES);
                self.samples_sent += samples.len() as u64;
                let fields = ResponseFields {
                    nodes: Some(self.closest_compact(&target, 8)),
                    samples: Some(samples),
                    interval: Some(BEP51_INTERVAL_HINT),
                    num: Some(self.discovered.len() as i64),
                    ..Default::default()
                };
                let bytes = protocol::build_response(&tid, &self.own_id, &fields);
                self.send_bytes(src, bytes);
            }
            Query::Unknown(name) => {
                warn!("unknown method {:?} from {}", name, src);
                let bytes = protocol::build_error(&tid, protocol::ERR_METHOD_UNKNOWN, "method unknown");
                self.send_bytes(src, bytes);
            }
        }
    }

    fn handle_response(&mut self, tid: Vec<u8>, sender_id: NodeId, fields: ResponseFields, src: Endpoint) {
        let tid_arr: [u8; 2] = match tid.as_slice().try_into() {
            Ok(a) => a,
            Err(_) => {
                debug!("dropping response with non-2-byte tid from {}", src);
                return;
            }
        };

        let matches = self
            .transactions
            .get(&tid_arr)
            .map_or(false, |p| p.dest == src);
        if !matches {
            debug!("dropping unmatched response (tid/source) from {}", src);
            return;
        }
        let pending = self.transactions.remove(&tid_arr).expect("checked above");
        debug!("dispatching response for transaction {:?} ({:?}) from {}", tid_arr, pending.kind, src);

        let outcome = self.routing_table.insert(Contact::new(sender_id, src));
        debug!("routing table insert of sender {:?}: {:?}", sender_id, outcome);
        if let Some(nodes) = &fields.nodes {
            for n in nodes {
                let outcome = self.routing_table.insert(Contact::new(n.id, n.endpoint));
                debug!("routing table insert of {:?}: {:?}", n.id, outcome);
            }
        }
        if self.config.bep51_enabled {
            if let Some(samples) = &fields.samples {
                self.samples_received += samples.len() as u64;
                for &hash in samples {
                    self.record_discovery(hash, src, DiscoveryTag::Bep51);
                }
            }
        }

        if pending.kind == TransactionKind::GetPeersLookup {
            if let Some(lookup) = &mut self.active_lookup {
                lookup.pending.remove(&tid_arr);
                if let Some(nodes) = &fields.nodes {
                    for n in nodes {
                        if !lookup.candidates.iter().any(|c| c.id == n.id) {
                            lookup.candidates.push(Contact::new(n.id, n.endpoint));
                        }
                    }
                }
                if let Some(values) = &fields.values {
                    for v in values {
                        if lookup.peers_seen.insert(*v) {
                            lookup.peers.push(*v);
                        }
                    }
                }
            }
        }
    }

    /// Iteratively queries the network for peers sharing `info_hash`,
    /// returning the deduplicated peer set in first-seen order.
    pub fn scrape_peers(&mut self, info_hash: NodeId, timeout: Duration) -> Vec<Endpoint> {
        let deadline = Instant::now() + timeout;
        let alpha = self.config.alpha;
        let seed = self.routing_table.closest_nodes(&info_hash, alpha);
        if seed.is_empty() {
            warn!("scrape_peers: routing table is empty, nothing to query");
            return Vec::new();
        }

        let mut lookup = LookupState {
            target: info_hash,
            candidates: seed,
            queried: HashSet::new(),
            pending: HashSet::new(),
            peers: Vec::new(),
            peers_seen: HashSet::new(),
        };

        loop {
            if Instant::now() >= deadline || self.is_cancelled() {
                break;
            }

            lookup.candidates.sort_by_key(|c| c.id.distance(&info_hash));
            let best_before = lookup.candidates[0].id.distance(&info_hash);

            let round_targets: Vec<Contact> = lookup
                .candidates
                .iter()
                .filter(|c| !lookup.queried.contains(&c.id))
                .take(alpha)
                .cloned()
                .collect();
            if round_targets.is_empty() {
                break;
            }

            self.active_lookup = Some(lookup);
            for c in &round_targets {
                if let Some(active) = &mut self.active_lookup {
                    active.queried.insert(c.id);
                }
                if let Ok(tid) = self.send_query(c.endpoint, Query::GetPeers { info_hash }, TransactionKind::GetPeersLookup) {
                    if let Some(active) = &mut self.active_lookup {
                        active.pending.insert(tid);
                    }
                }
            }

            let round_deadline = (Instant::now() + self.config.query_timeout).min(deadline);
            loop {
                let now = Instant::now();
                if now >= round_deadline || self.is_cancelled() {
                    break;
                }
                let pending_empty = self
                    .active_lookup
                    .as_ref()
                    .map_or(true, |l| l.pending.is_empty());
                if pending_empty {
                    break;
                }
                let step = round_deadline.saturating_duration_since(now).min(Duration::from_millis(100));
                let _ = self.poll_once(step);
            }
            self.reap_expired_transactions();

            lookup = self.active_lookup.take().expect("set above");
            lookup.candidates.sort_by_key(|c| c.id.distance(&info_hash));
            let best_after = lookup.candidates[0].id.distance(&info_hash);
            if best_after >= best_before {
                break;
            }
        }

        lookup.peers
    }

    fn active_query_burst(&mut self) {
        let target = NodeId::random();
        let closest = self.routing_table.closest_nodes(&target, CRAWL_BATCH);
        for c in closest {
            let _ = self.send_query(c.endpoint, Query::FindNode { target }, TransactionKind::FindNode);
        }
    }

    /// Runs the crawl loop for `duration` (zero means until cancelled),
    /// driving the progress/discovery callbacks once per one-second tick.
    pub fn crawl_network(
        &mut self,
        duration: Duration,
        query_interval: u64,
        mut on_discovery: impl FnMut(DiscoveryEvent),
        mut on_progress: impl FnMut(&ProgressStats),
    ) {
        let query_interval = query_interval.max(1);
        let infinite = duration.is_zero();
        let start = Instant::now();
        let mut tick: u64 = 0;

        loop {
            if self.is_cancelled() {
                break;
            }
            if !infinite && start.elapsed() >= duration {
                break;
            }
            tick += 1;
            let tick_deadline = Instant::now() + Duration::from_secs(1);

            if should_active_query(tick, query_interval) {
                self.active_query_burst();
            }

            while Instant::now() < tick_deadline && !self.is_cancelled() {
                let remaining = tick_deadline.saturating_duration_since(Instant::now());
                let _ = self.poll_once(remaining.min(Duration::from_millis(100)));
            }

            if tick % REAP_INTERVAL_TICKS == 0 {
                self.reap_expired_transactions();
                self.routing_table.prune_stale(CONTACT_STALE_AFTER);
            }

            let events: Vec<DiscoveryEvent> = self.pending_discoveries.drain(..).collect();
            for event in events {
                on_discovery(event);
            }

            let elapsed = start.elapsed().as_secs_f64();
            let stats = ProgressStats {
                elapsed_secs: start.elapsed().as_secs(),
                unique_info_hashes: self.discovered.len(),
                discoveries_per_minute: if elapsed > 0.0 {
                    self.discovered.len() as f64 / (elapsed / 60.0)
                } else {
                    0.0
                },
                total_requests_seen: self.requests_seen,
                routing_table_size: self.routing_table.len(),
                bep51_samples_sent: self.samples_sent,
                bep51_samples_received: self.samples_received,
            };
            on_progress(&stats);
        }
    }
}

/// Whether tick `tick` (1-indexed) should trigger an active query burst.
fn should_active_query(tick: u64, query_interval: u64) -> bool {
    query_interval >= 1 && tick % query_interval == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn test_engine() -> Engine {
        let config = EngineConfig {
            port: 0,
            bootstrap: Vec::new(),
            ..EngineConfig::default()
        };
        Engine::new(config).expect("bind to ephemeral port should always succeed")
    }

    #[test]
    fn crawler_tick_schedule_matches_spec_example() {
        let interval = 3;
        let bursts: Vec<u64> = (1..=10).filter(|&t| should_active_query(t, interval)).collect();
        assert_eq!(bursts, vec![3, 6, 9]);
    }

    #[test]
    fn query_interval_of_zero_is_treated_as_one() {
        // crawl_network clamps via `.max(1)`; the predicate itself also
        // tolerates zero by firing every tick, matching "integer >= 1" input
        // validation living at the CLI boundary rather than here.
        assert!(should_active_query(1, 1));
        assert!(should_active_query(2, 1));
    }

    #[test]
    fn bep51_emission_samples_exactly_twenty_of_fifty() {
        let mut engine = test_engine();
        for i in 0u32..50 {
            let mut buf = [0u8; crate::node::ID_LEN];
            buf[0..4].copy_from_slice(&i.to_be_bytes());
            let hash = NodeId::from_bytes(buf);
            let source = Endpoint::new(Ipv4Addr::new(10, 0, 0, 1), 6881).unwrap();
            engine.record_discovery(hash, source, DiscoveryTag::GetPeers);
        }
        assert_eq!(engine.discovered.len(), 50);
        let samples = engine.sample_discovered(protocol::MAX_SAMPLES);
        assert_eq!(samples.len(), 20);
        let unique: HashSet<NodeId> = samples.iter().copied().collect();
        assert_eq!(unique.len(), 20, "samples must be drawn without replacement");
    }

    #[test]
    fn discovery_fires_only_on_first_sighting() {
        let mut engine = test_engine();
        let hash = NodeId::random();
        let source = Endpoint::new(Ipv4Addr::new(10, 0, 0, 1), 6881).unwrap();
        engine.record_discovery(hash, source, DiscoveryTag::GetPeers);
        engine.record_discovery(hash, source, DiscoveryTag::GetPeers);
        assert_eq!(engine.pending_discoveries.len(), 1);
        assert_eq!(engine.discovered.get(&hash).unwrap().request_count, 2);
    }

    #[test]
    fn discovered_cap_stops_new_sightings() {
        let mut config = EngineConfig {
            port: 0,
            bootstrap: Vec::new(),
            ..EngineConfig::default()
        };
        config.discovered_cap = Some(1);
        let mut engine = Engine::new(config).unwrap();
        let source = Endpoint::new(Ipv4Addr::new(10, 0, 0, 1), 6881).unwrap();
        engine.record_discovery(NodeId::random(), source, DiscoveryTag::GetPeers);
        engine.record_discovery(NodeId::random(), source, DiscoveryTag::GetPeers);
        assert_eq!(engine.discovered.len(), 1);
    }

    #[test]
    fn unmatched_response_is_dropped_without_touching_transactions() {
        let mut engine = test_engine();
        let dest = Endpoint::new(Ipv4Addr::new(10, 0, 0, 1), 6881).unwrap();
        let wrong_src = Endpoint::new(Ipv4Addr::new(10, 0, 0, 2), 6881).unwrap();
        let tid = [1u8, 2u8];
        engine.transactions.insert(
            tid,
            PendingTransaction {
                kind: TransactionKind::FindNode,
                dest,
                deadline: Instant::now() + Duration::from_secs(5),
            },
        );

        engine.handle_response(
            tid.to_vec(),
            NodeId::random(),
            ResponseFields::default(),
            wrong_src,
        );

        assert!(engine.transactions.contains_key(&tid), "mismatched source must not consume the transaction");
    }

    #[test]
    fn matched_response_consumes_the_transaction() {
        let mut engine = test_engine();
        let dest = Endpoint::new(Ipv4Addr::new(10, 0, 0, 1), 6881).unwrap();
        let tid = [1u8, 2u8];
        engine.transactions.insert(
            tid,
            PendingTransaction {
                kind: TransactionKind::FindNode,
                dest,
                deadline: Instant::now() + Duration::from_secs(5),
            },
        );

        engine.handle_response(tid.to_vec(), NodeId::random(), ResponseFields::default(), dest);

        assert!(!engine.transactions.contains_key(&tid));
    }

    #[test]
    fn malformed_query_is_answered_with_error_203() {
        let mut engine = test_engine();
        let peer = std::net::UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        peer.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        let peer_addr = match peer.local_addr().unwrap() {
            SocketAddr::V4(v4) => SocketAddr::V4(v4),
            SocketAddr::V6(_) => unreachable!("bound to an IPv4 loopback address"),
        };

        // get_peers with a 19-byte info_hash instead of 20.
        let raw = b"d1:ad2:id20:AAAAAAAAAAAAAAAAAAAA9:info_hash19:BBBBBBBBBBBBBBBBBBBe1:q9:get_peers1:t2:zz1:y1:qe";
        engine.handle_datagram(raw, peer_addr);

        let mut buf = [0u8; READ_BUF_LEN];
        let (len, _) = peer.recv_from(&mut buf).expect("engine should reply with an error");
        let msg = protocol::parse(&buf[..len]).expect("reply must itself be well-formed KRPC");
        match msg {
            protocol::Message::Error { tid, code, .. } => {
                assert_eq!(tid, b"zz");
                assert_eq!(code, protocol::ERR_PROTOCOL);
            }
            _ => panic!("expected an error message"),
        }
    }

    #[test]
    fn cancel_handle_is_observed() {
        let engine = test_engine();
        let handle = engine.cancel_handle();
        assert!(!handle.is_cancelled());
        handle.cancel();
        assert!(handle.is_cancelled());
        assert!(engine.is_cancelled());
    }
}
