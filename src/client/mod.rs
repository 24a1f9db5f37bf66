//! Top-level driver handle: wires the connection pool, session manager, and command
//! dispatcher together (spec.md §2 "Data flow", §4.6).

pub(crate) mod auth;
pub(crate) mod options;
pub(crate) mod session;
pub(crate) mod uri;

use std::sync::Arc;

use bson::Document;
use tokio::task::JoinHandle;

pub use options::{ClientOptions, Credential, ServerAddress, TlsOptions};
pub use session::{ClientSession, ClusterTime};

use crate::{
    cmap::pool::ConnectionPool,
    cursor::{Cursor, CursorConnection},
    error::{Error, ErrorKind, Result},
    namespace::Namespace,
    operation::{
        find::{Find, FindOptions},
        run_command::RunCommand,
        Dispatcher,
    },
};

/// The handle callers obtain sessions, run commands, and open cursors through. Cheap to
/// clone: every clone shares the same pool and session free-list (spec.md §2).
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    dispatcher: Dispatcher,
    sessions: session::SessionManager,
    options: ClientOptions,
    sweeper: JoinHandle<()>,
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        self.sweeper.abort();
    }
}

impl Client {
    /// Parses `uri` and connects with the resulting settings (spec.md §6, §8 scenario S1).
    pub fn with_uri_str(uri: &str) -> Result<Self> {
        Self::with_options(uri::parse(uri)?)
    }

    /// Builds a `Client` from already-resolved [`ClientOptions`] (spec.md §6).
    pub fn with_options(options: ClientOptions) -> Result<Self> {
        let address = options
            .hosts
            .first()
            .cloned()
            .ok_or_else(|| Error::from(ErrorKind::InvalidArgument {
                message: "ClientOptions must carry at least one host".to_string(),
            }))?;
        // Non-goals (spec.md §1): no SDAM/topology monitoring. Every connection this pool
        // opens targets the first host of a multi-host URI; the rest are accepted but unused.
        let pool = ConnectionPool::new(address, options.clone())?;
        let dispatcher = Dispatcher::new(pool);
        let sessions = session::SessionManager::new();
        let sweeper = sessions.spawn_sweeper();
        Ok(Self {
            inner: Arc::new(ClientInner {
                dispatcher,
                sessions,
                options,
                sweeper,
            }),
        })
    }

    pub fn options(&self) -> &ClientOptions {
        &self.inner.options
    }

    /// Lazily allocates a logical session (spec.md §4.4).
    pub fn start_session(&self) -> ClientSession {
        self.inner.sessions.start_session()
    }

    /// Runs an arbitrary command document with no session attached (spec.md §4.8).
    pub async fn run_command(&self, db: impl Into<String>, command: Document) -> Result<Document> {
        let op = RunCommand::new(db, command)?;
        self.inner.dispatcher.run(op).await
    }

    /// Runs an arbitrary command document against `session`, attaching `lsid`/`$clusterTime`/
    /// transaction metadata and honoring transaction pinning (spec.md §4.5, §4.8).
    pub async fn run_command_with_session(
        &self,
        db: impl Into<String>,
        command: Document,
        session: &mut ClientSession,
    ) -> Result<Document> {
        let op = RunCommand::new(db, command)?;
        self.inner.dispatcher.run_in_session(op, session).await
    }

    /// Opens a cursor over `filter` with no session attached (spec.md §4.7).
    pub async fn find(
        &self,
        ns: Namespace,
        filter: Document,
        options: FindOptions,
    ) -> Result<Cursor> {
        let batch_size = options.batch_size;
        let op = Find::new(ns, filter, options);
        let (result, handle) = self.inner.dispatcher.open_cursor(op).await?;
        Ok(Cursor::new(
            CursorConnection::Exclusive(handle),
            result.ns,
            result.id,
            result.first_batch,
            batch_size,
            None,
            None,
        ))
    }

    /// Session-bound `find` (spec.md §4.7, §4.5): the cursor carries `session`'s `lsid`/
    /// `$clusterTime` on every `getMore`; when `session` has a transaction in progress the
    /// cursor shares its pinned connection instead of checking one out of its own.
    pub async fn find_with_session(
        &self,
        ns: Namespace,
        filter: Document,
        options: FindOptions,
        session: &mut ClientSession,
    ) -> Result<Cursor> {
        let batch_size = options.batch_size;
        let op = Find::new(ns, filter, options);
        let (result, conn, lsid, cluster_time) = self
            .inner
            .dispatcher
            .open_cursor_in_session(op, session)
            .await?;
        Ok(Cursor::new(
            conn,
            result.ns,
            result.id,
            result.first_batch,
            batch_size,
            lsid,
            cluster_time,
        ))
    }

    /// Begins a transaction on `session` (spec.md §4.5).
    pub fn start_transaction(&self, session: &mut ClientSession) -> Result<()> {
        session.transaction_mut().begin()
    }

    /// Commits the transaction in progress on `session` (spec.md §4.5).
    pub async fn commit_transaction(&self, session: &mut ClientSession) -> Result<()> {
        match self
            .run_command_with_session("admin", bson::doc! { "commitTransaction": 1 }, session)
            .await
        {
            Ok(_) => {
                session.transaction_mut().mark_committed();
                Ok(())
            }
            Err(err) => Err(session.transaction_mut().fail_with(err)),
        }
    }

    /// Aborts the transaction in progress on `session` (spec.md §4.5). Best-effort: the
    /// transaction is marked `Aborted` locally regardless of whether the server command
    /// succeeds, since there is nothing further the caller can do with a failed abort.
    pub async fn abort_transaction(&self, session: &mut ClientSession) -> Result<()> {
        let result = self
            .run_command_with_session("admin", bson::doc! { "abortTransaction": 1 }, session)
            .await;
        session.transaction_mut().mark_aborted();
        result.map(|_| ())
    }

    /// Discards idle pooled connections and flushes any still-pending session ids via
    /// `endSessions`, batched per spec.md §4.4.
    pub async fn shutdown(self) {
        let db = self
            .inner
            .options
            .target_database
            .clone()
            .unwrap_or_else(|| "admin".to_string());
        for batch in self.inner.sessions.drain_ended_session_ids() {
            let _ = self
                .run_command(db.clone(), bson::doc! { "endSessions": batch })
                .await;
        }
        self.inner.dispatcher.pool().shutdown().await;
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn with_options_rejects_an_empty_host_list() {
        let options = ClientOptions::builder().hosts(vec![]).build();
        assert!(Client::with_options(options).is_err());
    }
}
