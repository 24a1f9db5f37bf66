//! Typed command shapes and the dispatcher that attaches session metadata, picks a
//! connection, and decodes replies (spec.md §4.8).

pub(crate) mod find;
pub(crate) mod get_more;
pub(crate) mod kill_cursors;
pub(crate) mod run_command;

use bson::Document;

use crate::{
    client::session::{ClientSession, ClusterTime},
    cmap::{
        command::Command,
        connection::Connection,
        pool::{ConnectionHandle, ConnectionPool},
    },
    cursor::CursorConnection,
    error::Result,
};

/// A tagged variant of known command shapes plus an escape hatch for arbitrary command
/// documents (spec.md §9: "Polymorphic command values... become a tagged variant... plus an
/// escape hatch"). The Dispatcher only inspects [`Operation::NAME`]/[`Operation::target_db`]
/// to decide metadata attachment, never to decode the reply.
pub(crate) trait Operation {
    type Output;

    const NAME: &'static str;

    /// The command's wire name, i.e. its leading key. Defaults to [`Operation::NAME`]; an
    /// escape-hatch operation like [`run_command::RunCommand`] overrides this since its wire
    /// name is only known at runtime.
    fn name(&self) -> &str {
        Self::NAME
    }

    /// The database the command targets.
    fn target_db(&self) -> &str;

    /// Builds the command body, without `$db`/session metadata: the Dispatcher attaches those.
    fn build(&self) -> Result<Document>;

    /// Decodes a successful reply into this operation's result type.
    fn handle_response(&self, response: Document) -> Result<Self::Output>;
}

/// Accepts typed command values, selects a Connection + session, writes the request, and
/// awaits a typed reply (spec.md §4.8).
pub(crate) struct Dispatcher {
    pool: ConnectionPool,
}

impl Dispatcher {
    pub(crate) fn new(pool: ConnectionPool) -> Self {
        Self { pool }
    }

    pub(crate) fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    /// Runs `op` with no session attached: used for the handshake probe and for callers that
    /// don't need causal consistency (spec.md §4.8).
    pub(crate) async fn run<Op: Operation>(&self, op: Op) -> Result<Op::Output> {
        let body = op.build()?;
        let command = Command::new(op.name(), op.target_db(), body);
        let handle = self.pool.checkout().await?;
        let reply = handle.send(command).await?.into_result()?;
        op.handle_response(reply)
    }

    /// Runs `op` against `session`, attaching `lsid`/`$clusterTime`/transaction metadata and
    /// routing to the pinned connection if a transaction is in progress (spec.md §4.8, §4.5).
    pub(crate) async fn run_in_session<Op: Operation>(
        &self,
        op: Op,
        session: &mut ClientSession,
    ) -> Result<Op::Output> {
        let body = op.build()?;

        let in_txn = session.transaction().in_transaction();
        if in_txn && session.transaction().pinned_connection().is_none() {
            let handle = self.pool.checkout().await?;
            session.transaction_mut().pin(handle);
        }
        let is_first = if in_txn {
            session.transaction_mut().note_command_issued()
        } else {
            false
        };

        let lsid = session.id().clone();
        let cluster_time = session.cluster_time().cloned();
        let txn_number = in_txn.then_some(session.transaction().id);
        let autocommit = session.transaction().autocommit();

        let command = Command::new(op.name(), op.target_db(), body).with_session_metadata(
            Some(&lsid),
            cluster_time.as_ref(),
            txn_number,
            autocommit,
            is_first,
        );

        // A pinned transaction reuses its own Connection; anything else checks one out for the
        // duration of this single command only.
        let outcome = if in_txn {
            let conn = session
                .transaction()
                .pinned_connection()
                .expect("pinned above whenever a transaction is in progress");
            send_on(conn, command).await
        } else {
            let handle = self.pool.checkout().await?;
            send_on(&handle, command).await
        };

        match outcome {
            Ok((reply, new_cluster_time)) => {
                session.touch();
                if let Some(ct) = new_cluster_time {
                    session.advance_cluster_time(ct);
                }
                op.handle_response(reply)
            }
            Err(err) => {
                if err.is_network_error() {
                    session.mark_dirty();
                }
                Err(session.transaction_mut().fail_with(err))
            }
        }
    }

    /// Opens a cursor with no session attached: checks out a Connection dedicated to `op`
    /// and returns it alongside the decoded result for [`crate::cursor::Cursor`] to pin
    /// (spec.md §4.7, §3 "Cursor exclusively owns its pinned Connection while streaming").
    pub(crate) async fn open_cursor<Op: Operation>(
        &self,
        op: Op,
    ) -> Result<(Op::Output, ConnectionHandle)> {
        let body = op.build()?;
        let command = Command::new(op.name(), op.target_db(), body);
        let handle = self.pool.checkout().await?;
        let reply = handle.send(command).await?.into_result()?;
        Ok((op.handle_response(reply)?, handle))
    }

    /// Session-aware cursor open (spec.md §4.7, §4.5): attaches `lsid`/`$clusterTime`, and
    /// when `session` has a transaction in progress, shares its pinned Connection rather than
    /// checking out a fresh one dedicated to the cursor.
    pub(crate) async fn open_cursor_in_session<Op: Operation>(
        &self,
        op: Op,
        session: &mut ClientSession,
    ) -> Result<(Op::Output, CursorConnection, Option<Document>, Option<ClusterTime>)> {
        let body = op.build()?;

        let in_txn = session.transaction().in_transaction();
        if in_txn && session.transaction().pinned_connection().is_none() {
            let handle = self.pool.checkout().await?;
            session.transaction_mut().pin(handle);
        }
        let is_first = if in_txn {
            session.transaction_mut().note_command_issued()
        } else {
            false
        };

        let lsid = session.id().clone();
        let cluster_time = session.cluster_time().cloned();
        let txn_number = in_txn.then_some(session.transaction().id);
        let autocommit = session.transaction().autocommit();

        let command = Command::new(op.name(), op.target_db(), body).with_session_metadata(
            Some(&lsid),
            cluster_time.as_ref(),
            txn_number,
            autocommit,
            is_first,
        );

        let (result, cursor_conn, new_cluster_time) = if in_txn {
            let conn = session
                .transaction()
                .pinned_connection()
                .expect("pinned above whenever a transaction is in progress")
                .share();
            let response = conn.send(command).await?;
            let ct = response.cluster_time();
            let reply = response.into_result()?;
            (op.handle_response(reply)?, CursorConnection::Shared(conn), ct)
        } else {
            let handle = self.pool.checkout().await?;
            let response = handle.send(command).await?;
            let ct = response.cluster_time();
            let reply = response.into_result()?;
            (
                op.handle_response(reply)?,
                CursorConnection::Exclusive(handle),
                ct,
            )
        };

        session.touch();
        if let Some(ct) = new_cluster_time.clone() {
            session.advance_cluster_time(ct);
        }

        Ok((result, cursor_conn, Some(lsid), new_cluster_time))
    }
}

async fn send_on(
    conn: &Connection,
    command: Command,
) -> Result<(Document, Option<crate::client::session::ClusterTime>)> {
    let response = conn.send(command).await?;
    let cluster_time = response.cluster_time();
    Ok((response.into_result()?, cluster_time))
}
