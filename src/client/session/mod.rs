//! Logical session ids, cluster time tracking, and the transaction state machine
//! (spec.md §4.4, §4.5).

mod cluster_time;
mod pool;
pub(crate) mod transaction;

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use bson::{Document, Timestamp};
use tokio::task::JoinHandle;

pub use cluster_time::ClusterTime;
use pool::{ServerSession, ServerSessionPool};
pub(crate) use transaction::{Transaction, TransactionState};

/// The idle threshold past which the sweeper evicts a pooled session (spec.md §4.4).
const DEFAULT_LOGICAL_SESSION_TIMEOUT: Duration = Duration::from_secs(29 * 60);

/// A checked-out logical session (spec.md §3, SessionId). Returns its id to the pool's
/// free-list on drop. Opaque from the outside: callers obtain one from
/// [`crate::client::Client::start_session`] and pass it back into `Client`'s session-bound
/// methods, but its fields are private to this crate.
#[derive(Debug)]
pub struct ClientSession {
    id: Document,
    cluster_time: Option<ClusterTime>,
    operation_time: Option<Timestamp>,
    transaction: Transaction,
    last_use: Instant,
    dirty: bool,
    pool: Arc<ServerSessionPool>,
    logical_session_timeout: Duration,
}

impl ClientSession {
    pub(crate) fn id(&self) -> &Document {
        &self.id
    }

    pub(crate) fn touch(&mut self) {
        self.last_use = Instant::now();
    }

    /// Retains the maximum `$clusterTime` seen, per spec.md §3.
    pub(crate) fn advance_cluster_time(&mut self, new_time: ClusterTime) {
        self.cluster_time = Some(match self.cluster_time.take() {
            Some(current) => current.max(new_time),
            None => new_time,
        });
    }

    pub(crate) fn cluster_time(&self) -> Option<&ClusterTime> {
        self.cluster_time.as_ref()
    }

    pub(crate) fn set_operation_time(&mut self, time: Timestamp) {
        self.operation_time = Some(time);
    }

    pub(crate) fn operation_time(&self) -> Option<Timestamp> {
        self.operation_time
    }

    pub(crate) fn transaction(&self) -> &Transaction {
        &self.transaction
    }

    pub(crate) fn transaction_mut(&mut self) -> &mut Transaction {
        &mut self.transaction
    }

    /// Marks the session unfit for reuse; a subsequent network error during a command is the
    /// canonical trigger (spec.md §4.4).
    pub(crate) fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub(crate) fn is_expired(&self) -> bool {
        self.last_use.elapsed() >= self.logical_session_timeout
    }
}

impl Drop for ClientSession {
    fn drop(&mut self) {
        let session = ServerSession {
            id: self.id.clone(),
            last_use: self.last_use,
            dirty: self.dirty,
        };
        self.pool.check_in(session, self.logical_session_timeout);
    }
}

/// Owns the free-list of server sessions and the idle-eviction sweeper (spec.md §4.4).
#[derive(Debug)]
pub(crate) struct SessionManager {
    pool: Arc<ServerSessionPool>,
    logical_session_timeout: Duration,
}

impl SessionManager {
    pub(crate) fn new() -> Self {
        Self::with_logical_session_timeout(DEFAULT_LOGICAL_SESSION_TIMEOUT)
    }

    /// `logical_session_timeout_minutes` from the `hello` reply overrides the 30-minute
    /// server default once the handshake completes (spec.md §6).
    pub(crate) fn with_logical_session_timeout(logical_session_timeout: Duration) -> Self {
        Self {
            pool: Arc::new(ServerSessionPool::new()),
            logical_session_timeout,
        }
    }

    /// Lazily allocates a `SessionId` on first need (spec.md §4.4).
    pub(crate) fn start_session(&self) -> ClientSession {
        let server_session = self.pool.check_out(self.logical_session_timeout);
        ClientSession {
            id: server_session.id,
            cluster_time: None,
            operation_time: None,
            transaction: Transaction::default(),
            last_use: server_session.last_use,
            dirty: false,
            pool: self.pool.clone(),
            logical_session_timeout: self.logical_session_timeout,
        }
    }

    /// Ids awaiting `endSessions`, already chunked to the batch size spec.md §4.4 requires.
    /// Sending them is the caller's responsibility (this core has no standalone `Client`).
    pub(crate) fn drain_ended_session_ids(&self) -> Vec<Vec<Document>> {
        self.pool.drain_ended_ids()
    }

    /// Spawns the background sweeper that evicts sessions idle beyond the timeout
    /// (spec.md §4.4). The returned handle should be aborted on pool shutdown.
    pub(crate) fn spawn_sweeper(&self) -> JoinHandle<()> {
        let pool = self.pool.clone();
        let timeout = self.logical_session_timeout;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(60));
            loop {
                interval.tick().await;
                pool.sweep(timeout);
            }
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn session_id_is_returned_to_pool_on_drop() {
        let manager = SessionManager::new();
        let session = manager.start_session();
        let id = session.id().clone();
        drop(session);

        let reused = manager.start_session();
        assert_eq!(*reused.id(), id);
    }

    #[test]
    fn dirty_session_is_not_reused() {
        let manager = SessionManager::new();
        let mut session = manager.start_session();
        let id = session.id().clone();
        session.mark_dirty();
        drop(session);

        let reused = manager.start_session();
        assert_ne!(*reused.id(), id);
    }
}
