//! Client identity and the shared connection registry.
//!
//! # Responsibilities
//! - Allocate collision-free 64-bit client identifiers
//! - Track the set of identifiers owned by live sessions
//! - Keep the approximate active-connection counter used for admission
//! - Hold per-client accumulated messages for the aggregating pipeline

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use dashmap::DashMap;
use rand::Rng;

/// Interval between registry checks while waiting for sessions to drain.
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Opaque identifier of an accepted client.
///
/// Unique among live sessions only; a value may be handed out again once the
/// session that held it has been torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(u64);

impl ClientId {
    pub const fn from_u64(raw: u64) -> Self {
        Self(raw)
    }

    /// Get the raw ID value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// State shared by the acceptor and every session task.
///
/// The identifier set is the source of truth for liveness: an id is a member
/// from the moment its socket is accepted until its teardown begins. The
/// connection counter and the message map are derived state.
#[derive(Debug, Default)]
pub struct Registry {
    active_ids: Mutex<HashSet<ClientId>>,
    /// Sessions past their handshake. Read without synchronization against
    /// concurrent updates, so it is only an admission heuristic.
    active_connections: AtomicUsize,
    messages: DashMap<ClientId, Vec<u8>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    fn ids(&self) -> MutexGuard<'_, HashSet<ClientId>> {
        self.active_ids.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Draw an identifier that is not active at the instant of return.
    ///
    /// The value is not reserved; pass it to [`Registry::claim`] once the
    /// socket it is meant for has been accepted.
    pub fn allocate(&self) -> ClientId {
        self.allocate_with(|| rand::thread_rng().gen())
    }

    /// [`Registry::allocate`] with a caller-supplied source of raw values.
    ///
    /// Retries until a free value comes up. There is no retry bound: with a
    /// 64-bit space and a connection ceiling many orders of magnitude smaller,
    /// a long run of collisions is not a practical concern.
    pub fn allocate_with(&self, mut draw: impl FnMut() -> u64) -> ClientId {
        let ids = self.ids();
        next_free(&ids, &mut draw)
    }

    /// Register `candidate` as active, or a fresh value if another session
    /// took it since it was drawn. Check and insert share one lock acquisition.
    pub fn claim(&self, candidate: ClientId) -> ClientId {
        self.claim_with(candidate, || rand::thread_rng().gen())
    }

    pub fn claim_with(&self, candidate: ClientId, mut draw: impl FnMut() -> u64) -> ClientId {
        let mut ids = self.ids();
        let id = if ids.contains(&candidate) {
            next_free(&ids, &mut draw)
        } else {
            candidate
        };
        ids.insert(id);
        id
    }

    /// Remove `id` from the active set. Returns false if it was not a member.
    pub fn release(&self, id: ClientId) -> bool {
        self.messages.remove(&id);
        self.ids().remove(&id)
    }

    pub fn is_active(&self, id: ClientId) -> bool {
        self.ids().contains(&id)
    }

    /// Number of registered identifiers, including sessions still handshaking.
    pub fn active_ids(&self) -> usize {
        self.ids().len()
    }

    /// Record a session that completed its handshake.
    pub fn connection_opened(&self) -> usize {
        self.active_connections.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Record the teardown of a session that completed its handshake.
    pub fn connection_closed(&self) -> usize {
        let previous = self
            .active_connections
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| Some(n.saturating_sub(1)))
            .unwrap_or_default();
        debug_assert!(previous > 0, "active connection counter underflow");
        previous.saturating_sub(1)
    }

    /// Approximate number of sessions doing I/O.
    pub fn active_connections(&self) -> usize {
        self.active_connections.load(Ordering::Relaxed)
    }

    /// Append a chunk to the client's accumulated message, creating it on the
    /// first chunk. Returns the accumulated length.
    pub fn append_message(&self, id: ClientId, chunk: &[u8]) -> usize {
        let mut entry = self.messages.entry(id).or_default();
        entry.extend_from_slice(chunk);
        entry.len()
    }

    /// Copy of the client's accumulated message.
    pub fn pending_message(&self, id: ClientId) -> Vec<u8> {
        self.messages
            .get(&id)
            .map(|entry| entry.value().clone())
            .unwrap_or_default()
    }

    /// Empty the client's accumulated message after it has been flushed.
    pub fn clear_message(&self, id: ClientId) {
        if let Some(mut entry) = self.messages.get_mut(&id) {
            entry.clear();
        }
    }

    /// Wait until every identifier has been released, or `grace` elapses.
    /// Returns true if the registry drained.
    pub async fn wait_until_drained(&self, grace: Duration) -> bool {
        let drained = async {
            while self.active_ids() > 0 {
                tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
            }
        };
        tokio::time::timeout(grace, drained).await.is_ok()
    }

    /// Forget every session. Used once the reactor is gone and no session task
    /// can run its own teardown. Returns the identifiers that were still live.
    pub fn purge(&self) -> Vec<ClientId> {
        let mut ids = self.ids();
        let mut leftover: Vec<_> = ids.drain().collect();
        leftover.sort();
        self.messages.clear();
        self.active_connections.store(0, Ordering::Relaxed);
        leftover
    }
}

fn next_free(ids: &HashSet<ClientId>, draw: &mut impl FnMut() -> u64) -> ClientId {
    loop {
        let id = ClientId(draw());
        if !ids.contains(&id) {
            return id;
        }
    }
}
