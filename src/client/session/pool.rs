//! Free-list of ended server sessions, reused on the next `start_session` call
//! (spec.md §4.4).

use std::{
    collections::VecDeque,
    sync::Mutex,
    time::{Duration, Instant},
};

use bson::{doc, Document};
use uuid::Uuid;

/// A server-tracked logical session id plus the bookkeeping the pool needs to decide whether
/// it can still be reused (spec.md §3, SessionId).
#[derive(Debug, Clone)]
pub(crate) struct ServerSession {
    pub(crate) id: Document,
    pub(crate) last_use: Instant,
    pub(crate) dirty: bool,
}

impl ServerSession {
    fn new() -> Self {
        Self {
            id: doc! { "id": bson::Binary {
                subtype: bson::spec::BinarySubtype::Uuid,
                bytes: Uuid::new_v4().as_bytes().to_vec(),
            } },
            last_use: Instant::now(),
            dirty: false,
        }
    }

    /// True once within a minute of the server-side idle timeout, matching the margin real
    /// MongoDB drivers use to avoid handing out a session the server may have already reaped.
    fn is_about_to_expire(&self, logical_session_timeout: Duration) -> bool {
        let margin = Duration::from_secs(60);
        let limit = logical_session_timeout.saturating_sub(margin);
        self.last_use.elapsed() >= limit
    }
}

/// The batch size `endSessions` is issued in at pool shutdown (spec.md §4.4).
pub(crate) const END_SESSIONS_BATCH_SIZE: usize = 10_000;

#[derive(Debug, Default)]
pub(crate) struct ServerSessionPool {
    available: Mutex<VecDeque<ServerSession>>,
    ended: Mutex<Vec<Document>>,
}

impl ServerSessionPool {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Checks out a session, discarding any that are about to expire along the way, and
    /// allocating a new one if the pool is empty (spec.md §4.4).
    pub(crate) fn check_out(&self, logical_session_timeout: Duration) -> ServerSession {
        let mut pool = self.available.lock().unwrap();
        while let Some(session) = pool.pop_front() {
            if session.is_about_to_expire(logical_session_timeout) {
                continue;
            }
            return session;
        }
        ServerSession::new()
    }

    /// Returns a session to the free-list, or to the ended-ids list if it's dirty or expiring
    /// (spec.md §4.4, "returned to a free-list on close").
    pub(crate) fn check_in(&self, session: ServerSession, logical_session_timeout: Duration) {
        if session.dirty || session.is_about_to_expire(logical_session_timeout) {
            self.ended.lock().unwrap().push(session.id);
            return;
        }
        self.available.lock().unwrap().push_front(session);
    }

    /// Prunes sessions that went stale while sitting unused in the pool, per spec.md §4.4's
    /// "background sweeper evicts sessions idle > 29 minutes". Intended to be called on a
    /// timer by [`super::SessionManager::spawn_sweeper`].
    pub(crate) fn sweep(&self, logical_session_timeout: Duration) {
        let mut pool = self.available.lock().unwrap();
        let mut ended = self.ended.lock().unwrap();
        let mut retained = VecDeque::with_capacity(pool.len());
        for session in pool.drain(..) {
            if session.is_about_to_expire(logical_session_timeout) {
                ended.push(session.id.clone());
            } else {
                retained.push_back(session);
            }
        }
        *pool = retained;
    }

    /// Drains ids awaiting `endSessions`, chunked to [`END_SESSIONS_BATCH_SIZE`] per spec.md
    /// §4.4. Returns an empty vec of batches when there is nothing to report.
    pub(crate) fn drain_ended_ids(&self) -> Vec<Vec<Document>> {
        let mut ended = self.ended.lock().unwrap();
        let ids: Vec<Document> = ended.drain(..).collect();
        ids.chunks(END_SESSIONS_BATCH_SIZE)
            .map(|chunk| chunk.to_vec())
            .collect()
    }

    #[cfg(test)]
    pub(crate) fn available_count(&self) -> usize {
        self.available.lock().unwrap().len()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn checked_in_session_is_reused() {
        let pool = ServerSessionPool::new();
        let session = pool.check_out(Duration::from_secs(1800));
        let id = session.id.clone();
        pool.check_in(session, Duration::from_secs(1800));

        let reused = pool.check_out(Duration::from_secs(1800));
        assert_eq!(reused.id, id);
    }

    #[test]
    fn dirty_session_is_not_reused() {
        let pool = ServerSessionPool::new();
        let mut session = pool.check_out(Duration::from_secs(1800));
        session.dirty = true;
        let id = session.id.clone();
        pool.check_in(session, Duration::from_secs(1800));

        let reused = pool.check_out(Duration::from_secs(1800));
        assert_ne!(reused.id, id);
        assert_eq!(pool.available_count(), 0);
    }

    #[test]
    fn end_sessions_batches_are_capped() {
        let pool = ServerSessionPool::new();
        for _ in 0..(END_SESSIONS_BATCH_SIZE + 5) {
            let mut session = ServerSession::new();
            session.dirty = true;
            pool.check_in(session, Duration::from_secs(1800));
        }
        let batches = pool.drain_ended_ids();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].len(), END_SESSIONS_BATCH_SIZE);
        assert_eq!(batches[1].len(), 5);
    }
}
