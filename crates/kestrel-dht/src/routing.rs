//! K-bucket routing table with deferred insertion.
//!
//! Peers are bucketed by the common-prefix length of their id with the
//! local id: 160 flat buckets, bucket `i` holding peers agreeing with the
//! local id on exactly `i` leading bits. Within a bucket, order is
//! freshness: head = least-recently seen, tail = most-recently seen.
//!
//! Insertion into a full bucket is deferred: the candidate parks in that
//! bucket's insertion queue while the bucket head is probed for liveness.
//! A live head keeps its seat (it moves to the tail, the candidate is
//! discarded); a dead head is evicted and the oldest candidate admitted.
//! At most one probe per bucket is outstanding; the table only records
//! the discipline, the node's insertion worker performs the probes.
//!
//! The table is a plain data structure. Callers wrap it in a mutex and
//! hold the lock only for these non-blocking calls; probe callbacks run
//! with no lock held and feed results back through [`RoutingTable::on_probe_result`].

use crate::messages::PeerInfo;
use crate::node_id::NodeId;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Number of buckets, one per possible common-prefix length.
pub const NUM_BUCKETS: usize = 160;

/// Conventional bucket capacity.
pub const DEFAULT_K: usize = 20;

/// A known peer.
#[derive(Clone, Debug)]
pub struct Peer {
    /// Node identifier; unique across the whole table.
    pub id: NodeId,
    /// Last known network address.
    pub addr: SocketAddr,
    /// Most recent inbound evidence of liveness.
    pub last_seen: Instant,
}

impl Peer {
    /// Create a peer observed now.
    #[must_use]
    pub fn new(id: NodeId, addr: SocketAddr) -> Self {
        Self {
            id,
            addr,
            last_seen: Instant::now(),
        }
    }

    /// Compact wire representation.
    #[must_use]
    pub fn info(&self) -> PeerInfo {
        PeerInfo {
            id: self.id,
            addr: self.addr,
        }
    }
}

/// Freshness-ordered bucket of at most `capacity` peers.
#[derive(Clone, Debug)]
struct KBucket {
    /// Head = least-recently seen, tail = most-recently seen.
    peers: VecDeque<Peer>,
    capacity: usize,
    last_touched: Instant,
}

impl KBucket {
    fn new(capacity: usize) -> Self {
        Self {
            peers: VecDeque::with_capacity(capacity),
            capacity,
            last_touched: Instant::now(),
        }
    }

    fn len(&self) -> usize {
        self.peers.len()
    }

    fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    fn is_full(&self) -> bool {
        self.peers.len() >= self.capacity
    }

    fn contains(&self, id: &NodeId) -> bool {
        self.peers.iter().any(|p| p.id == *id)
    }

    fn head(&self) -> Option<&Peer> {
        self.peers.front()
    }

    /// Move an existing peer to the tail with fresh metadata.
    fn refresh(&mut self, id: &NodeId, addr: SocketAddr) -> bool {
        let Some(pos) = self.peers.iter().position(|p| p.id == *id) else {
            return false;
        };
        let mut peer = self.peers.remove(pos).expect("position just found");
        peer.addr = addr;
        peer.last_seen = Instant::now();
        self.peers.push_back(peer);
        true
    }

    /// Append at the tail. Caller checks capacity and duplicates.
    fn push_tail(&mut self, peer: Peer) {
        debug_assert!(!self.is_full());
        debug_assert!(!self.contains(&peer.id));
        self.peers.push_back(peer);
    }

    fn remove(&mut self, id: &NodeId) -> Option<Peer> {
        let pos = self.peers.iter().position(|p| p.id == *id)?;
        self.peers.remove(pos)
    }

    fn iter(&self) -> impl Iterator<Item = &Peer> {
        self.peers.iter()
    }

    fn touch(&mut self) {
        self.last_touched = Instant::now();
    }
}

/// Liveness probe the insertion worker must issue: ping `head` and report
/// the result back via [`RoutingTable::on_probe_result`].
#[derive(Clone, Debug)]
pub struct ProbeTarget {
    /// Bucket the probe reconciles.
    pub bucket: usize,
    /// Current head of that bucket (least-recently seen peer).
    pub head: Peer,
}

/// What `observe` did with the evidence.
#[derive(Debug)]
pub enum ObserveOutcome {
    /// The peer is the local node; ignored.
    SelfId,
    /// Peer was already present; freshness and address updated.
    Refreshed,
    /// Peer appended to a bucket with room.
    Inserted,
    /// Bucket full; candidate queued. When `probe` is `Some`, no probe was
    /// outstanding for the bucket and the caller must issue this one.
    Queued {
        /// Probe to issue, if this observation initiated one.
        probe: Option<ProbeTarget>,
    },
}

/// The k-bucket routing table plus its insertion queues.
///
/// Both live under the caller's single lock scope: queue state and bucket
/// state are reconciled together, which is what keeps the one-probe-per-
/// bucket and collapse-duplicate-candidates invariants simple.
#[derive(Debug)]
pub struct RoutingTable {
    local_id: NodeId,
    k: usize,
    buckets: Vec<KBucket>,
    /// Pending insertion candidates per bucket, oldest first.
    queues: Vec<VecDeque<Peer>>,
    /// Whether a liveness probe is outstanding for each bucket.
    probing: Vec<bool>,
    /// Most recent observe of any peer; drives idle self-lookup.
    last_observed: Instant,
}

impl RoutingTable {
    /// Create an empty table for `local_id` with bucket capacity `k`.
    #[must_use]
    pub fn new(local_id: NodeId, k: usize) -> Self {
        Self {
            local_id,
            k,
            buckets: (0..NUM_BUCKETS).map(|_| KBucket::new(k)).collect(),
            queues: (0..NUM_BUCKETS).map(|_| VecDeque::new()).collect(),
            probing: vec![false; NUM_BUCKETS],
            last_observed: Instant::now(),
        }
    }

    /// The local node's id. Never present in any bucket.
    #[must_use]
    pub const fn local_id(&self) -> &NodeId {
        &self.local_id
    }

    /// Bucket capacity.
    #[must_use]
    pub const fn k(&self) -> usize {
        self.k
    }

    /// Record inbound evidence of liveness for `peer`.
    ///
    /// Total: never fails. Refreshes a known peer, appends to a bucket
    /// with room, or queues the peer as an insertion candidate behind a
    /// liveness probe of the bucket head. Duplicate candidates for the
    /// same id collapse, most recent wins.
    pub fn observe(&mut self, peer: Peer) -> ObserveOutcome {
        let Some(bucket_idx) = peer.id.bucket_index(&self.local_id) else {
            trace!("observe of local id ignored");
            return ObserveOutcome::SelfId;
        };

        self.last_observed = Instant::now();
        let bucket = &mut self.buckets[bucket_idx];
        bucket.touch();

        if bucket.refresh(&peer.id, peer.addr) {
            trace!(peer = %peer.id, bucket = bucket_idx, "observe: refreshed");
            return ObserveOutcome::Refreshed;
        }

        if !bucket.is_full() {
            debug!(peer = %peer.id, bucket = bucket_idx, "observe: inserted");
            bucket.push_tail(peer);
            return ObserveOutcome::Inserted;
        }

        // Bucket full: park the candidate and ask for a probe of the head
        // unless one is already in flight for this bucket.
        let queue = &mut self.queues[bucket_idx];
        if let Some(pos) = queue.iter().position(|c| c.id == peer.id) {
            queue.remove(pos);
        } else if queue.len() >= self.k {
            // Bounded queue: the oldest candidate loses its place.
            queue.pop_front();
        }
        debug!(peer = %peer.id, bucket = bucket_idx, "observe: queued");
        queue.push_back(peer);

        let probe = if self.probing[bucket_idx] {
            None
        } else {
            let head = self.buckets[bucket_idx]
                .head()
                .cloned()
                .expect("full bucket has a head");
            self.probing[bucket_idx] = true;
            Some(ProbeTarget {
                bucket: bucket_idx,
                head,
            })
        };
        ObserveOutcome::Queued { probe }
    }

    /// Reconcile a completed liveness probe of a bucket head.
    ///
    /// Alive: the head moves to the tail and the oldest queued candidate
    /// is discarded (it cannot be admitted). Dead: the head is evicted
    /// and the oldest candidate admitted at the tail. Either way, any
    /// remaining free space absorbs queued candidates directly, and if
    /// the bucket is still full with candidates waiting, the next probe
    /// is handed back to the caller.
    pub fn on_probe_result(
        &mut self,
        bucket_idx: usize,
        head_id: &NodeId,
        alive: bool,
    ) -> Option<ProbeTarget> {
        debug_assert!(bucket_idx < NUM_BUCKETS);
        self.probing[bucket_idx] = false;

        debug!(head = %head_id, bucket = bucket_idx, alive, "probe result");
        if alive {
            let addr = self.buckets[bucket_idx]
                .iter()
                .find(|p| p.id == *head_id)
                .map(|p| p.addr);
            if let Some(addr) = addr {
                self.buckets[bucket_idx].refresh(head_id, addr);
            }
            if let Some(discarded) = self.queues[bucket_idx].pop_front() {
                trace!(candidate = %discarded.id, bucket = bucket_idx, "candidate discarded");
            }
        } else if let Some(evicted) = self.buckets[bucket_idx].remove(head_id) {
            debug!(peer = %evicted.id, bucket = bucket_idx, "evicted dead head");
        }

        self.admit_queued(bucket_idx);
        self.next_probe(bucket_idx)
    }

    /// Unconditional removal, used on definitive failures.
    ///
    /// Frees space in the peer's bucket, which queued candidates fill
    /// directly; no probe is needed once room exists. Returns the removed
    /// peer if it was present.
    pub fn remove(&mut self, id: &NodeId) -> Option<Peer> {
        let bucket_idx = id.bucket_index(&self.local_id)?;

        // A removed peer also stops being an insertion candidate.
        if let Some(pos) = self.queues[bucket_idx].iter().position(|c| c.id == *id) {
            self.queues[bucket_idx].remove(pos);
        }

        let removed = self.buckets[bucket_idx].remove(id);
        if let Some(peer) = &removed {
            debug!(peer = %peer.id, bucket = bucket_idx, "removed");
            self.admit_queued(bucket_idx);
        }
        removed
    }

    /// Up to `count` known peers, ascending XOR distance to `target`,
    /// ties broken by id order. Deterministic for identical table state.
    #[must_use]
    pub fn closest(&self, target: &NodeId, count: usize) -> Vec<Peer> {
        let mut all: Vec<Peer> = self
            .buckets
            .iter()
            .flat_map(|b| b.iter().cloned())
            .collect();
        all.sort_by(|a, b| {
            a.id.distance(target)
                .cmp(&b.id.distance(target))
                .then_with(|| a.id.cmp(&b.id))
        });
        all.truncate(count);
        all
    }

    /// Snapshot of every peer in the table.
    #[must_use]
    pub fn all_peers(&self) -> Vec<Peer> {
        self.buckets
            .iter()
            .flat_map(|b| b.iter().cloned())
            .collect()
    }

    /// Total peers across all buckets.
    #[must_use]
    pub fn peer_count(&self) -> usize {
        self.buckets.iter().map(KBucket::len).sum()
    }

    /// Indices of non-empty buckets that have seen no traffic within
    /// `horizon`; candidates for a CRON refresh lookup.
    #[must_use]
    pub fn stale_buckets(&self, horizon: Duration) -> Vec<usize> {
        self.buckets
            .iter()
            .enumerate()
            .filter(|(_, b)| !b.is_empty() && b.last_touched.elapsed() >= horizon)
            .map(|(idx, _)| idx)
            .collect()
    }

    /// Time since any peer was last observed.
    #[must_use]
    pub fn idle_for(&self) -> Duration {
        self.last_observed.elapsed()
    }

    /// Admit queued candidates into free bucket space, oldest first.
    fn admit_queued(&mut self, bucket_idx: usize) {
        while !self.buckets[bucket_idx].is_full() {
            let Some(candidate) = self.queues[bucket_idx].pop_front() else {
                break;
            };
            let bucket = &mut self.buckets[bucket_idx];
            if bucket.refresh(&candidate.id, candidate.addr) {
                continue;
            }
            debug!(peer = %candidate.id, bucket = bucket_idx, "admitted queued candidate");
            bucket.push_tail(candidate);
        }
    }

    /// Start the next probe for a bucket that is still full with
    /// candidates waiting.
    fn next_probe(&mut self, bucket_idx: usize) -> Option<ProbeTarget> {
        if self.probing[bucket_idx]
            || !self.buckets[bucket_idx].is_full()
            || self.queues[bucket_idx].is_empty()
        {
            return None;
        }
        let head = self.buckets[bucket_idx].head().cloned()?;
        self.probing[bucket_idx] = true;
        Some(ProbeTarget {
            bucket: bucket_idx,
            head,
        })
    }

    #[cfg(test)]
    fn bucket_ids(&self, bucket_idx: usize) -> Vec<NodeId> {
        self.buckets[bucket_idx].iter().map(|p| p.id).collect()
    }

    #[cfg(test)]
    fn queued_ids(&self, bucket_idx: usize) -> Vec<NodeId> {
        self.queues[bucket_idx].iter().map(|p| p.id).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    /// Id agreeing with `local` on exactly `prefix` leading bits, with
    /// `salt` distinguishing ids in the same bucket.
    fn id_in_bucket(local: &NodeId, prefix: usize, salt: u8) -> NodeId {
        let mut bytes = *local.as_bytes();
        let byte = prefix / 8;
        let bit = prefix % 8;
        bytes[byte] ^= 0x80 >> bit;
        // Vary trailing bytes without disturbing the prefix.
        if byte + 1 < NodeId::LEN {
            bytes[NodeId::LEN - 1] ^= salt;
        }
        NodeId::from_bytes(bytes)
    }

    #[test]
    fn test_fresh_insert() {
        // Scenario: empty table, one observation.
        let local = NodeId::from_bytes([0u8; 20]);
        let mut table = RoutingTable::new(local, 20);

        let mut bytes = [0u8; 20];
        bytes[19] = 0x01; // agrees on 159 leading bits
        let peer_id = NodeId::from_bytes(bytes);
        let peer = Peer::new(peer_id, addr(9000));

        assert!(matches!(
            table.observe(peer),
            ObserveOutcome::Inserted
        ));
        assert_eq!(table.bucket_ids(159), vec![peer_id]);

        let closest = table.closest(&peer_id, 1);
        assert_eq!(closest.len(), 1);
        assert_eq!(closest[0].id, peer_id);
    }

    #[test]
    fn test_observe_self_ignored() {
        let local = NodeId::random();
        let mut table = RoutingTable::new(local, 20);
        assert!(matches!(
            table.observe(Peer::new(local, addr(9000))),
            ObserveOutcome::SelfId
        ));
        assert_eq!(table.peer_count(), 0);
    }

    #[test]
    fn test_refresh_moves_to_tail() {
        // Scenario: three peers in one bucket, re-observe the first.
        let local = NodeId::from_bytes([0u8; 20]);
        let mut table = RoutingTable::new(local, 3);

        let p1 = id_in_bucket(&local, 5, 1);
        let p2 = id_in_bucket(&local, 5, 2);
        let p3 = id_in_bucket(&local, 5, 3);
        table.observe(Peer::new(p1, addr(1)));
        table.observe(Peer::new(p2, addr(2)));
        table.observe(Peer::new(p3, addr(3)));
        assert_eq!(table.bucket_ids(5), vec![p1, p2, p3]);

        assert!(matches!(
            table.observe(Peer::new(p1, addr(1))),
            ObserveOutcome::Refreshed
        ));
        assert_eq!(table.bucket_ids(5), vec![p2, p3, p1]);
        assert_eq!(table.peer_count(), 3);
    }

    #[test]
    fn test_refresh_updates_address() {
        let local = NodeId::from_bytes([0u8; 20]);
        let mut table = RoutingTable::new(local, 3);
        let p1 = id_in_bucket(&local, 5, 1);

        table.observe(Peer::new(p1, addr(1)));
        table.observe(Peer::new(p1, addr(99)));

        assert_eq!(table.peer_count(), 1);
        assert_eq!(table.all_peers()[0].addr, addr(99));
    }

    #[test]
    fn test_full_bucket_queues_and_requests_probe() {
        let local = NodeId::from_bytes([0u8; 20]);
        let mut table = RoutingTable::new(local, 2);

        let h = id_in_bucket(&local, 5, 1);
        let t = id_in_bucket(&local, 5, 2);
        let n = id_in_bucket(&local, 5, 3);
        table.observe(Peer::new(h, addr(1)));
        table.observe(Peer::new(t, addr(2)));

        let outcome = table.observe(Peer::new(n, addr(3)));
        let ObserveOutcome::Queued { probe: Some(probe) } = outcome else {
            panic!("expected queued with probe, got {outcome:?}");
        };
        assert_eq!(probe.bucket, 5);
        assert_eq!(probe.head.id, h);
        assert_eq!(table.bucket_ids(5), vec![h, t]);
        assert_eq!(table.queued_ids(5), vec![n]);
    }

    #[test]
    fn test_probe_head_alive_keeps_seat() {
        // Scenario: k=2, bucket [H, T], N arrives, H answers the probe.
        let local = NodeId::from_bytes([0u8; 20]);
        let mut table = RoutingTable::new(local, 2);

        let h = id_in_bucket(&local, 5, 1);
        let t = id_in_bucket(&local, 5, 2);
        let n = id_in_bucket(&local, 5, 3);
        table.observe(Peer::new(h, addr(1)));
        table.observe(Peer::new(t, addr(2)));
        table.observe(Peer::new(n, addr(3)));

        let next = table.on_probe_result(5, &h, true);
        assert!(next.is_none());
        assert_eq!(table.bucket_ids(5), vec![t, h]);
        assert!(table.queued_ids(5).is_empty());
    }

    #[test]
    fn test_probe_head_dead_admits_candidate() {
        // Scenario: same setup, H times out.
        let local = NodeId::from_bytes([0u8; 20]);
        let mut table = RoutingTable::new(local, 2);

        let h = id_in_bucket(&local, 5, 1);
        let t = id_in_bucket(&local, 5, 2);
        let n = id_in_bucket(&local, 5, 3);
        table.observe(Peer::new(h, addr(1)));
        table.observe(Peer::new(t, addr(2)));
        table.observe(Peer::new(n, addr(3)));

        let next = table.on_probe_result(5, &h, false);
        assert!(next.is_none());
        assert_eq!(table.bucket_ids(5), vec![t, n]);
        assert!(table.queued_ids(5).is_empty());
    }

    #[test]
    fn test_one_probe_per_bucket() {
        let local = NodeId::from_bytes([0u8; 20]);
        let mut table = RoutingTable::new(local, 2);

        let h = id_in_bucket(&local, 5, 1);
        let t = id_in_bucket(&local, 5, 2);
        table.observe(Peer::new(h, addr(1)));
        table.observe(Peer::new(t, addr(2)));

        let first = table.observe(Peer::new(id_in_bucket(&local, 5, 3), addr(3)));
        assert!(matches!(first, ObserveOutcome::Queued { probe: Some(_) }));

        // Second candidate while the probe is in flight: queued, no probe.
        let second = table.observe(Peer::new(id_in_bucket(&local, 5, 4), addr(4)));
        assert!(matches!(second, ObserveOutcome::Queued { probe: None }));
        assert_eq!(table.queued_ids(5).len(), 2);
    }

    #[test]
    fn test_probe_result_chains_next_probe() {
        let local = NodeId::from_bytes([0u8; 20]);
        let mut table = RoutingTable::new(local, 2);

        let h = id_in_bucket(&local, 5, 1);
        let t = id_in_bucket(&local, 5, 2);
        let n1 = id_in_bucket(&local, 5, 3);
        let n2 = id_in_bucket(&local, 5, 4);
        table.observe(Peer::new(h, addr(1)));
        table.observe(Peer::new(t, addr(2)));
        table.observe(Peer::new(n1, addr(3)));
        table.observe(Peer::new(n2, addr(4)));

        // H alive: n1 discarded, n2 still waiting, bucket still full, so
        // the new head (T) must be probed next.
        let next = table.on_probe_result(5, &h, true).expect("chained probe");
        assert_eq!(next.head.id, t);
        assert_eq!(table.queued_ids(5), vec![n2]);

        // T dead: n2 admitted, nothing left to probe.
        let next = table.on_probe_result(5, &t, false);
        assert!(next.is_none());
        assert_eq!(table.bucket_ids(5), vec![h, n2]);
    }

    #[test]
    fn test_duplicate_candidates_collapse() {
        let local = NodeId::from_bytes([0u8; 20]);
        let mut table = RoutingTable::new(local, 2);

        table.observe(Peer::new(id_in_bucket(&local, 5, 1), addr(1)));
        table.observe(Peer::new(id_in_bucket(&local, 5, 2), addr(2)));

        let n = id_in_bucket(&local, 5, 3);
        table.observe(Peer::new(n, addr(3)));
        table.observe(Peer::new(n, addr(33))); // same candidate, new address

        assert_eq!(table.queued_ids(5), vec![n]);
        // Most recent observation wins: the queued entry has the new address.
        let head_dead = table.bucket_ids(5)[0];
        table.on_probe_result(5, &head_dead, false);
        let admitted = table
            .all_peers()
            .into_iter()
            .find(|p| p.id == n)
            .expect("candidate admitted");
        assert_eq!(admitted.addr, addr(33));
    }

    #[test]
    fn test_remove_frees_space_for_candidate() {
        let local = NodeId::from_bytes([0u8; 20]);
        let mut table = RoutingTable::new(local, 2);

        let h = id_in_bucket(&local, 5, 1);
        let t = id_in_bucket(&local, 5, 2);
        let n = id_in_bucket(&local, 5, 3);
        table.observe(Peer::new(h, addr(1)));
        table.observe(Peer::new(t, addr(2)));
        table.observe(Peer::new(n, addr(3)));

        // Definitive failure of T: removed, and the queued candidate is
        // admitted directly without a probe.
        assert!(table.remove(&t).is_some());
        assert_eq!(table.bucket_ids(5), vec![h, n]);
        assert!(table.queued_ids(5).is_empty());

        // The probe requested when N was queued may still complete; a
        // stale result must not corrupt the bucket.
        let next = table.on_probe_result(5, &h, true);
        assert!(next.is_none());
        assert_eq!(table.bucket_ids(5), vec![n, h]);
    }

    #[test]
    fn test_remove_unknown_is_noop() {
        let local = NodeId::from_bytes([0u8; 20]);
        let mut table = RoutingTable::new(local, 2);
        assert!(table.remove(&NodeId::random()).is_none());
    }

    #[test]
    fn test_closest_sorted_and_deterministic() {
        let local = NodeId::random();
        let mut table = RoutingTable::new(local, 20);

        for i in 0..64 {
            table.observe(Peer::new(NodeId::random(), addr(8000 + i)));
        }

        let target = NodeId::random();
        let a = table.closest(&target, 20);
        let b = table.closest(&target, 20);
        assert_eq!(a.len().min(20), a.len());

        for w in a.windows(2) {
            assert!(w[0].id.distance(&target) < w[1].id.distance(&target));
        }
        let ids_a: Vec<_> = a.iter().map(|p| p.id).collect();
        let ids_b: Vec<_> = b.iter().map(|p| p.id).collect();
        assert_eq!(ids_a, ids_b);
    }

    #[test]
    fn test_closest_returns_fewer_when_table_small() {
        let local = NodeId::random();
        let mut table = RoutingTable::new(local, 20);
        table.observe(Peer::new(NodeId::random(), addr(1)));
        assert_eq!(table.closest(&NodeId::random(), 20).len(), 1);
        assert!(RoutingTable::new(local, 20)
            .closest(&NodeId::random(), 20)
            .is_empty());
    }

    #[test]
    fn test_bucket_placement_invariant() {
        let local = NodeId::random();
        let mut table = RoutingTable::new(local, 20);
        let ids: Vec<NodeId> = (0..128).map(|_| NodeId::random()).collect();
        for (i, id) in ids.iter().enumerate() {
            table.observe(Peer::new(*id, addr(i as u16 + 1)));
        }

        for (idx, bucket) in table.buckets.iter().enumerate() {
            assert!(bucket.len() <= table.k);
            for peer in bucket.iter() {
                assert_eq!(peer.id.bucket_index(&local), Some(idx));
                assert_ne!(peer.id, local);
            }
        }
        // Membership is unique table-wide.
        let mut all: Vec<NodeId> = table.all_peers().iter().map(|p| p.id).collect();
        let before = all.len();
        all.sort();
        all.dedup();
        assert_eq!(all.len(), before);
    }

    #[test]
    fn test_freshness_monotonic_within_bucket() {
        let local = NodeId::from_bytes([0u8; 20]);
        let mut table = RoutingTable::new(local, 8);

        for salt in 1..=8 {
            table.observe(Peer::new(id_in_bucket(&local, 3, salt), addr(salt as u16)));
        }
        table.observe(Peer::new(id_in_bucket(&local, 3, 4), addr(4)));
        table.observe(Peer::new(id_in_bucket(&local, 3, 2), addr(2)));

        let bucket = &table.buckets[3];
        for pair in bucket.peers.iter().collect::<Vec<_>>().windows(2) {
            assert!(pair[0].last_seen <= pair[1].last_seen);
        }
    }

    #[test]
    fn test_observe_idempotent_membership() {
        let local = NodeId::from_bytes([0u8; 20]);
        let mut table = RoutingTable::new(local, 4);
        let p = id_in_bucket(&local, 7, 1);

        table.observe(Peer::new(p, addr(1)));
        let before: Vec<NodeId> = table.all_peers().iter().map(|x| x.id).collect();
        for _ in 0..5 {
            table.observe(Peer::new(p, addr(1)));
        }
        let after: Vec<NodeId> = table.all_peers().iter().map(|x| x.id).collect();
        assert_eq!(before, after);
    }

    #[test]
    fn test_queue_bounded() {
        let local = NodeId::from_bytes([0u8; 20]);
        let k = 2;
        let mut table = RoutingTable::new(local, k);

        table.observe(Peer::new(id_in_bucket(&local, 5, 1), addr(1)));
        table.observe(Peer::new(id_in_bucket(&local, 5, 2), addr(2)));
        for salt in 3..20 {
            table.observe(Peer::new(id_in_bucket(&local, 5, salt), addr(salt as u16)));
        }
        assert!(table.queued_ids(5).len() <= k);
    }

    #[test]
    fn test_stale_buckets() {
        let local = NodeId::from_bytes([0u8; 20]);
        let mut table = RoutingTable::new(local, 4);
        table.observe(Peer::new(id_in_bucket(&local, 9, 1), addr(1)));

        // Everything was touched just now.
        assert!(table.stale_buckets(Duration::from_secs(60)).is_empty());
        // With a zero horizon the populated bucket is already stale;
        // empty buckets never are.
        assert_eq!(table.stale_buckets(Duration::ZERO), vec![9]);
    }
}
