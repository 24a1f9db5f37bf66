//! Cursor Engine: batches a `find`/`getMore` stream behind `next`/`map`/`decode`/`forEach`,
//! closing the server-side cursor on drop if it isn't already exhausted (spec.md §4.7).

use std::{collections::VecDeque, marker::PhantomData, sync::Arc};

use bson::{Document, RawDocumentBuf};
use serde::de::DeserializeOwned;

use crate::{
    client::session::ClusterTime,
    cmap::{command::Command, connection::Connection, pool::ConnectionHandle},
    error::Result,
    namespace::Namespace,
    operation::{get_more::GetMore, kill_cursors::KillCursors, Operation},
};

/// The Connection a [`Cursor`] drives its `getMore`/`killCursors` traffic over (spec.md §3,
/// "Cursor exclusively owns its pinned Connection while streaming"). `Shared` covers the one
/// exception: a cursor opened inside an in-progress transaction reuses the transaction's pinned
/// connection instead of checking one out for itself, since [`Connection::send`] takes `&self`
/// and tolerates concurrent callers sharing the same socket.
pub(crate) enum CursorConnection {
    Exclusive(ConnectionHandle),
    Shared(Arc<Connection>),
}

impl CursorConnection {
    fn as_connection(&self) -> &Connection {
        match self {
            CursorConnection::Exclusive(handle) => handle,
            CursorConnection::Shared(arc) => arc,
        }
    }
}

/// An open server-side cursor. Buffers one batch at a time and fetches the next via `getMore`
/// once drained; `T` controls what [`Cursor::next`] deserializes each document into
/// (spec.md §4.7). Not `Clone`: a cursor's pinned connection and server-side cursor id are
/// exclusively its own.
pub struct Cursor<T = Document> {
    id: i64,
    ns: Namespace,
    buffer: VecDeque<RawDocumentBuf>,
    batch_size: Option<u32>,
    lsid: Option<Document>,
    cluster_time: Option<ClusterTime>,
    conn: Option<CursorConnection>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Cursor<T> {
    pub(crate) fn new(
        conn: CursorConnection,
        ns: Namespace,
        id: i64,
        first_batch: Vec<RawDocumentBuf>,
        batch_size: Option<u32>,
        lsid: Option<Document>,
        cluster_time: Option<ClusterTime>,
    ) -> Self {
        Self {
            id,
            ns,
            buffer: first_batch.into(),
            batch_size: clamp_batch_size(batch_size),
            lsid,
            cluster_time,
            conn: Some(conn),
            _marker: PhantomData,
        }
    }

    /// The server-side cursor id; `0` once exhausted (spec.md §4.7).
    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn is_exhausted(&self) -> bool {
        self.id == 0 && self.buffer.is_empty()
    }

    /// Re-types the cursor without touching any network state, mirroring how a caller would
    /// switch from raw documents to a typed result partway through building a query.
    pub fn with_type<U>(self) -> Cursor<U> {
        Cursor {
            id: self.id,
            ns: self.ns,
            buffer: self.buffer,
            batch_size: self.batch_size,
            lsid: self.lsid,
            cluster_time: self.cluster_time,
            conn: self.conn,
            _marker: PhantomData,
        }
    }

    /// Exactly one `getMore` outstanding at a time, matching the exclusive ownership of the
    /// pinned connection: `&mut self` rules out a second concurrent call (spec.md §4.7).
    async fn fetch_more(&mut self) -> Result<()> {
        let conn = self
            .conn
            .as_ref()
            .expect("fetch_more only runs while the cursor still owns its pinned Connection")
            .as_connection();

        let op = GetMore::new(self.ns.clone(), self.id, self.batch_size, None);
        let body = op.build()?;
        let command = Command::new(GetMore::NAME, &self.ns.db, body).with_session_metadata(
            self.lsid.as_ref(),
            self.cluster_time.as_ref(),
            None,
            None,
            false,
        );

        let response = conn.send(command).await?;
        if let Some(cluster_time) = response.cluster_time() {
            self.cluster_time = Some(cluster_time);
        }
        let result = op.handle_response(response.into_result()?)?;
        self.id = result.id;
        self.buffer.extend(result.next_batch);
        Ok(())
    }

    /// Pops the next raw document, issuing a `getMore` when the current batch is drained
    /// (spec.md §4.7). `None` once the cursor reports a zero cursor id with an empty buffer.
    async fn next_raw(&mut self) -> Result<Option<RawDocumentBuf>> {
        loop {
            if let Some(raw) = self.buffer.pop_front() {
                return Ok(Some(raw));
            }
            if self.id == 0 {
                return Ok(None);
            }
            self.fetch_more().await?;
        }
    }

    /// Decodes the next document as `U`, independent of the cursor's own `T` (spec.md §4.7,
    /// "decode(T): like map, but specialized for deserializing into a target type").
    pub async fn decode<U: DeserializeOwned>(&mut self) -> Result<Option<U>> {
        match self.next_raw().await? {
            Some(raw) => Ok(Some(bson::from_slice(raw.as_bytes())?)),
            None => Ok(None),
        }
    }

    /// Drives the cursor to exhaustion, stopping at the first error `f` returns and killing the
    /// cursor at that point rather than leaving it dangling server-side (spec.md §4.7).
    pub async fn for_each<F>(mut self, mut f: F) -> Result<()>
    where
        F: FnMut(Document) -> Result<()>,
    {
        loop {
            match self.next_raw().await? {
                Some(raw) => {
                    let doc: Document = bson::from_slice(raw.as_bytes())?;
                    if let Err(err) = f(doc) {
                        self.kill().await;
                        return Err(err);
                    }
                }
                None => return Ok(()),
            }
        }
    }

    /// Best-effort `killCursors`, errors ignored (spec.md §4.7). Used both by [`Cursor::for_each`]
    /// and, via a spawned task, by [`Drop`].
    async fn kill(&mut self) {
        if self.id == 0 {
            return;
        }
        if let Some(conn) = self.conn.take() {
            let _ = send_kill_cursors(conn.as_connection(), &self.ns, self.id).await;
        }
        self.id = 0;
    }
}

impl Cursor<Document> {
    /// Decodes the next document, deferring to the crate's `Document` representation
    /// (spec.md §4.7, `next() -> Option<Document>`).
    pub async fn next(&mut self) -> Result<Option<Document>> {
        self.decode().await
    }

    /// Wraps the cursor in a lazy transform; failures from `f` surface to the consumer without
    /// otherwise touching the cursor (spec.md §4.7, "map(f)").
    pub fn map<F, U>(self, f: F) -> Map<F>
    where
        F: FnMut(Document) -> Result<U>,
    {
        Map { cursor: self, f }
    }
}

/// A lazily-mapped view over a [`Cursor`] (spec.md §4.7, "map(f)"). Produced by [`Cursor::map`].
pub struct Map<F> {
    cursor: Cursor<Document>,
    f: F,
}

impl<F, U> Map<F>
where
    F: FnMut(Document) -> Result<U>,
{
    pub async fn next(&mut self) -> Result<Option<U>> {
        match self.cursor.next().await? {
            Some(doc) => Ok(Some((self.f)(doc)?)),
            None => Ok(None),
        }
    }
}

impl<T> Drop for Cursor<T> {
    fn drop(&mut self) {
        if self.id == 0 {
            return;
        }
        if let Some(conn) = self.conn.take() {
            let ns = self.ns.clone();
            let id = self.id;
            // Drop can't be async; spawning a detached task is the only way to still issue the
            // best-effort killCursors (spec.md §4.7). Dropping outside a Tokio runtime (e.g.
            // during process teardown) just skips it rather than panicking.
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move {
                    let _ = send_kill_cursors(conn.as_connection(), &ns, id).await;
                });
            }
        }
    }
}

/// Invariant: batch size is clamped to `[1, 1_000_000]` (spec.md §4.7).
fn clamp_batch_size(batch_size: Option<u32>) -> Option<u32> {
    batch_size.map(|b| b.clamp(1, 1_000_000))
}

async fn send_kill_cursors(conn: &Connection, ns: &Namespace, cursor_id: i64) -> Result<()> {
    let op = KillCursors::new(ns.clone(), vec![cursor_id]);
    let body = op.build()?;
    let command = Command::new(KillCursors::NAME, &ns.db, body);
    conn.send(command).await?.into_result()?;
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    fn cursor_with_buffer(id: i64, docs: Vec<Document>) -> Cursor {
        let raw = docs
            .into_iter()
            .map(|doc| {
                let mut bytes = Vec::new();
                doc.to_writer(&mut bytes).unwrap();
                RawDocumentBuf::from_bytes(bytes).unwrap()
            })
            .collect();
        Cursor {
            id,
            ns: Namespace::new("db", "coll").unwrap(),
            buffer: raw,
            batch_size: None,
            lsid: None,
            cluster_time: None,
            conn: None,
            _marker: PhantomData,
        }
    }

    #[tokio::test]
    async fn drains_buffered_batch_without_a_connection() {
        let mut cursor = cursor_with_buffer(0, vec![bson::doc! { "_id": 1 }, bson::doc! { "_id": 2 }]);
        assert_eq!(cursor.next().await.unwrap().unwrap().get_i32("_id").unwrap(), 1);
        assert_eq!(cursor.next().await.unwrap().unwrap().get_i32("_id").unwrap(), 2);
        assert!(cursor.next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn is_exhausted_once_id_and_buffer_are_both_empty() {
        let cursor = cursor_with_buffer(0, vec![]);
        assert!(cursor.is_exhausted());

        let cursor = cursor_with_buffer(7, vec![]);
        assert!(!cursor.is_exhausted());
    }

    #[test]
    fn batch_size_is_clamped_to_the_allowed_range() {
        assert_eq!(clamp_batch_size(Some(5_000_000)), Some(1_000_000));
        assert_eq!(clamp_batch_size(Some(0)), Some(1));
        assert_eq!(clamp_batch_size(Some(100)), Some(100));
        assert_eq!(clamp_batch_size(None), None);
    }

    #[tokio::test]
    async fn map_applies_the_transform_lazily() {
        let cursor = cursor_with_buffer(0, vec![bson::doc! { "n": 2 }, bson::doc! { "n": 3 }]);
        let mut mapped = cursor.map(|doc| Ok(doc.get_i32("n").unwrap() * 10));
        assert_eq!(mapped.next().await.unwrap(), Some(20));
        assert_eq!(mapped.next().await.unwrap(), Some(30));
        assert_eq!(mapped.next().await.unwrap(), None);
    }

    #[tokio::test]
    async fn for_each_stops_at_the_first_callback_error() {
        let cursor = cursor_with_buffer(0, vec![bson::doc! { "n": 1 }, bson::doc! { "n": 2 }]);
        let mut seen = Vec::new();
        let result = cursor
            .for_each(|doc| {
                let n = doc.get_i32("n").unwrap();
                seen.push(n);
                if n == 2 {
                    Err(crate::error::ErrorKind::Internal {
                        message: "stop".to_string(),
                    }
                    .into())
                } else {
                    Ok(())
                }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(seen, vec![1, 2]);
    }
}
