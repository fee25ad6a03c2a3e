//! Pending discovery transactions
//!
//! Tracks discovery requests forwarded over the tunnel and routes replies back
//! to the client that broadcast them.
//!
//! The discovery payload carries no usable correlation key, so matching is
//! temporal. Transactions sit in a queue ordered by creation time. A reply
//! resolves the oldest live transaction for its origin, preferring ones that
//! have not been answered yet. A transaction stays live for the whole
//! staleness window so that several devices answering the same request all
//! reach the client. Expired transactions are evicted from the front of the
//! queue.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

/// Identifier of a pending transaction
pub type TransactionId = u64;

/// A forwarded request awaiting replies
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingTransaction {
    pub id: TransactionId,
    /// Client that broadcast the request
    pub origin: SocketAddr,
    pub created_at: Instant,
    /// Replies delivered so far
    pub replies: usize,
}

#[derive(Default)]
struct PendingQueue {
    /// Oldest first; creation times never decrease along the queue
    entries: VecDeque<PendingTransaction>,
    next_id: TransactionId,
}

/// Queue of pending transactions shared by the relay tasks
#[derive(Clone)]
pub struct PendingTransactions {
    inner: Arc<Mutex<PendingQueue>>,
    window: Duration,
}

impl PendingTransactions {
    /// `window` is how long a transaction waits for replies
    pub fn new(window: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(PendingQueue::default())),
            window,
        }
    }

    /// Record a request from `origin` about to be forwarded
    pub async fn register(&self, origin: SocketAddr) -> TransactionId {
        let mut queue = self.inner.lock().await;
        queue.next_id += 1;
        let id = queue.next_id;

        queue.entries.push_back(PendingTransaction {
            id,
            origin,
            created_at: Instant::now(),
            replies: 0,
        });

        debug!(id, origin = %origin, pending = queue.entries.len(), "Registered pending transaction");
        id
    }

    /// Drop a transaction whose request never left (e.g. tunnel went down)
    pub async fn cancel(&self, id: TransactionId) -> bool {
        let mut queue = self.inner.lock().await;
        match queue.entries.iter().position(|entry| entry.id == id) {
            Some(index) => {
                queue.entries.remove(index);
                true
            }
            None => false,
        }
    }

    /// Match a reply to a transaction
    ///
    /// With an origin, only transactions from that origin are candidates;
    /// without one, every live transaction is. Among candidates the oldest
    /// unanswered one wins, falling back to the oldest answered one. Returns
    /// `None` when nothing live matches.
    pub async fn resolve(&self, origin: Option<SocketAddr>) -> Option<PendingTransaction> {
        let now = Instant::now();
        let mut queue = self.inner.lock().await;

        let window = self.window;
        let is_candidate = |entry: &PendingTransaction| {
            now.duration_since(entry.created_at) < window
                && origin.map_or(true, |origin| entry.origin == origin)
        };

        let index = queue
            .entries
            .iter()
            .position(|entry| is_candidate(entry) && entry.replies == 0)
            .or_else(|| queue.entries.iter().position(|entry| is_candidate(entry)))?;

        let entry = &mut queue.entries[index];
        entry.replies += 1;
        Some(entry.clone())
    }

    /// Remove every transaction older than the window
    pub async fn evict_expired(&self) -> Vec<PendingTransaction> {
        let now = Instant::now();
        let mut queue = self.inner.lock().await;
        let mut expired = Vec::new();

        while let Some(front) = queue.entries.front() {
            if now.duration_since(front.created_at) < self.window {
                break;
            }
            if let Some(entry) = queue.entries.pop_front() {
                expired.push(entry);
            }
        }

        expired
    }

    /// Forget everything; returns how many transactions were dropped
    pub async fn clear(&self) -> usize {
        let mut queue = self.inner.lock().await;
        let count = queue.entries.len();
        queue.entries.clear();
        count
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.entries.is_empty()
    }
}
