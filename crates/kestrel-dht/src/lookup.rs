//! Iterative FIND_NODE lookup.
//!
//! The canonical Kademlia convergence procedure: keep a shortlist of the
//! closest candidates to the target, query the closest unqueried ones
//! with alpha requests in flight, merge every NODES answer back in, and
//! stop once the k closest candidates have all been queried and nothing
//! is outstanding. A round that discovers no closer peer leaves exactly
//! that state, so the classic no-progress termination falls out of the
//! same check.
//!
//! Non-responders are marked failed, excluded from the result, and
//! removed from the routing table.

use crate::messages::{Message, PeerInfo};
use crate::node::NodeInner;
use crate::node_id::NodeId;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// Query state of one shortlist candidate.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum CandidateState {
    Unqueried,
    InFlight,
    Responded,
    Failed,
}

struct Candidate {
    peer: PeerInfo,
    state: CandidateState,
}

/// Distance-sorted candidate list for one lookup.
///
/// Pure bookkeeping, no I/O: the async driver below feeds it query
/// results and asks it what to do next.
struct Shortlist {
    target: NodeId,
    k: usize,
    local_id: NodeId,
    /// Ascending distance to `target`; unique ids; never contains the
    /// local id.
    entries: Vec<Candidate>,
}

impl Shortlist {
    fn new(target: NodeId, k: usize, local_id: NodeId, seeds: Vec<PeerInfo>) -> Self {
        let mut shortlist = Self {
            target,
            k,
            local_id,
            entries: Vec::new(),
        };
        shortlist.merge(seeds);
        shortlist
    }

    /// Insert unseen peers at their distance rank. Returns how many were new.
    fn merge(&mut self, peers: impl IntoIterator<Item = PeerInfo>) -> usize {
        let mut added = 0;
        for peer in peers {
            if peer.id == self.local_id {
                continue;
            }
            if self.entries.iter().any(|c| c.peer.id == peer.id) {
                continue;
            }
            let distance = peer.id.distance(&self.target);
            let pos = self
                .entries
                .partition_point(|c| c.peer.id.distance(&self.target) <= distance);
            self.entries.insert(
                pos,
                Candidate {
                    peer,
                    state: CandidateState::Unqueried,
                },
            );
            added += 1;
        }
        added
    }

    /// The k closest candidates that have not failed.
    fn window(&self) -> impl Iterator<Item = &Candidate> {
        self.entries
            .iter()
            .filter(|c| c.state != CandidateState::Failed)
            .take(self.k)
    }

    /// Closest unqueried candidate within the k-closest window, marked
    /// in flight. `None` once the window is fully queried.
    fn next_unqueried(&mut self) -> Option<PeerInfo> {
        let id = self
            .window()
            .find(|c| c.state == CandidateState::Unqueried)
            .map(|c| c.peer.id)?;
        let entry = self
            .entries
            .iter_mut()
            .find(|c| c.peer.id == id)
            .expect("candidate just found in window");
        entry.state = CandidateState::InFlight;
        Some(entry.peer)
    }

    fn set_state(&mut self, id: &NodeId, state: CandidateState) {
        if let Some(entry) = self.entries.iter_mut().find(|c| c.peer.id == *id) {
            entry.state = state;
        }
    }

    fn in_flight(&self) -> usize {
        self.entries
            .iter()
            .filter(|c| c.state == CandidateState::InFlight)
            .count()
    }

    /// Final result: the k closest candidates that answered, ascending
    /// distance.
    fn closest_responded(&self) -> Vec<PeerInfo> {
        self.entries
            .iter()
            .filter(|c| c.state == CandidateState::Responded)
            .take(self.k)
            .map(|c| c.peer)
            .collect()
    }
}

/// Outcome of one query, fed back to the driver by supervisor callbacks.
enum QueryOutcome {
    /// The peer answered with its closest-known list.
    Responded {
        peer_id: NodeId,
        peers: Vec<PeerInfo>,
    },
    /// The peer timed out or could not be reached.
    Failed { peer_id: NodeId },
}

/// Run an iterative FIND_NODE toward `target`.
///
/// Seeds from the routing table, queries with `alpha` requests in
/// flight, and returns up to k responders closest to the target.
pub(crate) async fn iterative_find_node(inner: &Arc<NodeInner>, target: NodeId) -> Vec<PeerInfo> {
    let (seeds, k) = {
        let table = inner.table.lock().expect("routing table lock poisoned");
        let k = table.k();
        let seeds = table
            .closest(&target, k)
            .into_iter()
            .map(|p| p.info())
            .collect::<Vec<_>>();
        (seeds, k)
    };

    let mut shortlist = Shortlist::new(target, k, inner.local_id, seeds);
    let (outcome_tx, mut outcome_rx) = mpsc::unbounded_channel::<QueryOutcome>();
    let mut shutdown_rx = inner.subscribe_shutdown();
    let mut round: u64 = 0;

    loop {
        if *shutdown_rx.borrow() {
            break;
        }
        while shortlist.in_flight() < inner.config.alpha {
            let Some(next) = shortlist.next_unqueried() else {
                break;
            };
            query_peer(inner, next, target, outcome_tx.clone()).await;
        }

        if shortlist.in_flight() == 0 {
            break;
        }

        let outcome = tokio::select! {
            _ = shutdown_rx.changed() => break,
            outcome = outcome_rx.recv() => match outcome {
                Some(outcome) => outcome,
                None => break,
            },
        };
        round += 1;
        match outcome {
            QueryOutcome::Responded { peer_id, peers } => {
                shortlist.set_state(&peer_id, CandidateState::Responded);
                let added = shortlist.merge(peers);
                debug!(target = %target, round, peer = %peer_id, added, "lookup round");
            }
            QueryOutcome::Failed { peer_id } => {
                shortlist.set_state(&peer_id, CandidateState::Failed);
                inner
                    .table
                    .lock()
                    .expect("routing table lock poisoned")
                    .remove(&peer_id);
                debug!(target = %target, round, peer = %peer_id, "lookup round: peer failed");
            }
        }
    }

    let result = shortlist.closest_responded();
    debug!(target = %target, rounds = round, found = result.len(), "lookup complete");
    result
}

/// Send one FIND_NODE and wire its outcome back through the channel.
async fn query_peer(
    inner: &Arc<NodeInner>,
    peer: PeerInfo,
    target: NodeId,
    outcome_tx: mpsc::UnboundedSender<QueryOutcome>,
) {
    let token = inner.supervisor.next_token();
    let peer_id = peer.id;

    let response_tx = outcome_tx.clone();
    let on_response = Box::new(move |message: Message| {
        let peers = match message {
            Message::Nodes { peers, .. } => peers,
            // Correlated but wrong-kind response: counts as an answer
            // with nothing new to offer.
            _ => Vec::new(),
        };
        let _ = response_tx.send(QueryOutcome::Responded { peer_id, peers });
    });
    let timeout_tx = outcome_tx.clone();
    let on_timeout = Box::new(move |peer_id: NodeId| {
        let _ = timeout_tx.send(QueryOutcome::Failed { peer_id });
    });

    if inner
        .supervisor
        .register(
            token,
            peer_id,
            inner.config.request_timeout,
            on_response,
            on_timeout,
        )
        .is_err()
    {
        // Token collision cannot happen with the monotonic generator;
        // treat it as a failed query rather than poison the lookup.
        let _ = outcome_tx.send(QueryOutcome::Failed { peer_id });
        return;
    }

    let request = Message::FindNode {
        sender_id: inner.local_id,
        token,
        target,
    };
    trace!(token, peer = %peer_id, target = %target, "request sent");
    if inner.send_message(&request, peer.addr).await.is_err() {
        inner.supervisor.cancel(token);
        let _ = outcome_tx.send(QueryOutcome::Failed { peer_id });
    }
}
