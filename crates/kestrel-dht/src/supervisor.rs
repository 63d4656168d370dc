//! Outstanding-request supervision.
//!
//! Every request the node emits is registered here under its correlation
//! token. A matching response hands the message to the registered
//! response callback; a missed deadline hands the peer id to the timeout
//! callback. Exactly one of the two fires per registration, enforced by a
//! single point of removal: whichever path takes the entry out of the map
//! owns the terminal callback.
//!
//! Callbacks always run with the supervisor lock released, so a callback
//! may re-enter the supervisor (or take the routing-table lock) freely.
//! Lock ordering elsewhere in the crate: routing table before supervisor,
//! never the reverse.

use crate::messages::{Message, Token};
use crate::node_id::NodeId;
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, trace, warn};

/// Invoked with the correlated response message.
pub type ResponseCallback = Box<dyn FnOnce(Message) + Send>;

/// Invoked with the unresponsive peer's id after the deadline passes.
pub type TimeoutCallback = Box<dyn FnOnce(NodeId) + Send>;

/// A request awaiting its response.
struct OutstandingRequest {
    peer_id: NodeId,
    sent_at: Instant,
    deadline: Instant,
    on_response: ResponseCallback,
    on_timeout: TimeoutCallback,
}

/// Supervisor errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SupervisorError {
    /// The token is already registered to an outstanding request.
    #[error("Correlation token {0} already registered")]
    DuplicateToken(Token),
}

/// Registry of in-flight requests keyed by correlation token.
///
/// Tokens come from a process-local monotonic counter, so they are
/// globally unique for the life of the node; a counter wrap is beyond any
/// realistic retention window.
pub struct RequestSupervisor {
    entries: Mutex<HashMap<Token, OutstandingRequest>>,
    next_token: AtomicU64,
}

impl RequestSupervisor {
    /// Create an empty supervisor.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            next_token: AtomicU64::new(1),
        }
    }

    /// Draw a fresh correlation token.
    #[must_use]
    pub fn next_token(&self) -> Token {
        self.next_token.fetch_add(1, Ordering::Relaxed)
    }

    /// Register an outstanding request.
    ///
    /// # Errors
    ///
    /// Returns [`SupervisorError::DuplicateToken`] if `token` is already
    /// registered; the supplied callbacks are dropped unfired in that case.
    pub fn register(
        &self,
        token: Token,
        peer_id: NodeId,
        timeout: Duration,
        on_response: ResponseCallback,
        on_timeout: TimeoutCallback,
    ) -> Result<(), SupervisorError> {
        let now = Instant::now();
        let mut entries = self.entries.lock().expect("supervisor lock poisoned");
        if entries.contains_key(&token) {
            return Err(SupervisorError::DuplicateToken(token));
        }
        entries.insert(
            token,
            OutstandingRequest {
                peer_id,
                sent_at: now,
                deadline: now + timeout,
                on_response,
                on_timeout,
            },
        );
        trace!(token, peer = %peer_id, timeout_ms = timeout.as_millis() as u64, "request registered");
        Ok(())
    }

    /// Deliver a correlated response.
    ///
    /// If `token` is registered the entry is removed and its response
    /// callback invoked with `message`; returns `true`. Unknown tokens
    /// (never registered, already answered, or already timed out) drop
    /// the message and return `false`.
    pub fn deliver(&self, token: Token, message: Message) -> bool {
        let entry = {
            let mut entries = self.entries.lock().expect("supervisor lock poisoned");
            entries.remove(&token)
        };
        match entry {
            Some(request) => {
                trace!(token, peer = %request.peer_id, kind = message.kind(), "response delivered");
                (request.on_response)(message);
                true
            }
            None => {
                warn!(token, kind = message.kind(), "unsolicited response dropped");
                false
            }
        }
    }

    /// Remove an entry without firing either callback.
    pub fn cancel(&self, token: Token) -> bool {
        let removed = {
            let mut entries = self.entries.lock().expect("supervisor lock poisoned");
            entries.remove(&token)
        };
        removed.is_some()
    }

    /// Remove every entry without firing callbacks. Used on shutdown.
    pub fn cancel_all(&self) -> usize {
        let drained: Vec<OutstandingRequest> = {
            let mut entries = self.entries.lock().expect("supervisor lock poisoned");
            entries.drain().map(|(_, v)| v).collect()
        };
        if !drained.is_empty() {
            debug!(count = drained.len(), "outstanding requests cancelled");
        }
        drained.len()
    }

    /// Expire overdue entries, invoking each timeout callback.
    ///
    /// Entries whose deadline has passed are removed atomically under the
    /// lock; their callbacks then run with the lock released. Invocation
    /// order within one sweep is unspecified.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<(Token, OutstandingRequest)> = {
            let mut entries = self.entries.lock().expect("supervisor lock poisoned");
            let tokens: Vec<Token> = entries
                .iter()
                .filter(|(_, req)| now >= req.deadline)
                .map(|(token, _)| *token)
                .collect();
            tokens
                .into_iter()
                .filter_map(|t| entries.remove(&t).map(|req| (t, req)))
                .collect()
        };

        let count = expired.len();
        for (token, request) in expired {
            debug!(
                token,
                peer = %request.peer_id,
                waited_ms = request.sent_at.elapsed().as_millis() as u64,
                "request timed out"
            );
            (request.on_timeout)(request.peer_id);
        }
        count
    }

    /// Number of currently outstanding requests.
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.entries.lock().expect("supervisor lock poisoned").len()
    }
}

impl Default for RequestSupervisor {
    fn default() -> Self {
        Self::new()
    }
}
