//! Bounded per-host pool of [`Connection`]s (spec.md §4.6).

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc, Mutex,
    },
};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use super::{
    connection::Connection,
    establish::{establish_connection, ServerDescription},
};
use crate::{
    client::options::{ClientOptions, ServerAddress},
    error::{ErrorKind, Result, TimeoutScope},
    runtime::{self, TlsConfig},
};

/// A live connection plus the permit that counts it against `maximumNumberOfConnections`. The
/// permit is held for exactly as long as the connection exists — idle or checked out — and is
/// released automatically when both are dropped (spec.md §4.6). The connection itself is
/// `Arc`-wrapped so a [`crate::cursor::Cursor`] opened inside a transaction can share the
/// transaction's pinned connection without taking ownership of it away from the session.
struct PooledConnection {
    conn: Arc<Connection>,
    permit: OwnedSemaphorePermit,
}

/// A checked-out connection; returns itself to the pool's idle queue on drop unless poisoned,
/// in which case both the connection and its permit are simply dropped (spec.md §4.6,
/// "A Connection returned in poisoned state is discarded").
pub(crate) struct ConnectionHandle {
    pooled: Option<PooledConnection>,
    pool: Arc<PoolInner>,
}

impl ConnectionHandle {
    /// Clones the underlying `Arc<Connection>` for a [`crate::cursor::Cursor`] to drive its own
    /// `getMore`/`killCursors` traffic over while this handle (and whatever holds it, e.g. a
    /// pinned transaction) keeps the pool permit alive (spec.md §4.7).
    pub(crate) fn share(&self) -> Arc<Connection> {
        self.pooled
            .as_ref()
            .expect("connection taken only on drop")
            .conn
            .clone()
    }
}

impl std::ops::Deref for ConnectionHandle {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        &self.pooled.as_ref().expect("connection taken only on drop").conn
    }
}

impl Drop for ConnectionHandle {
    fn drop(&mut self) {
        if let Some(pooled) = self.pooled.take() {
            self.pool.release(pooled);
        }
    }
}

struct PoolInner {
    address: ServerAddress,
    options: ClientOptions,
    tls_config: Option<TlsConfig>,
    idle: Mutex<VecDeque<PooledConnection>>,
    semaphore: Arc<Semaphore>,
    next_id: AtomicU32,
    description: Mutex<ServerDescription>,
}

impl PoolInner {
    fn release(&self, pooled: PooledConnection) {
        if pooled.conn.is_poisoned() {
            return;
        }
        self.idle.lock().unwrap().push_back(pooled);
    }
}

/// Per-host bounded pool. Public contract: `checkout`/`shutdown` (spec.md §4.6); release
/// happens implicitly when a [`ConnectionHandle`] is dropped.
pub(crate) struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    pub(crate) fn new(address: ServerAddress, options: ClientOptions) -> Result<Self> {
        let tls_config = if options.use_tls {
            Some(TlsConfig::new(options.tls_options.verify_certificates)?)
        } else {
            None
        };
        let max_pool_size = options.max_pool_size.max(1);
        Ok(Self {
            inner: Arc::new(PoolInner {
                address,
                options,
                tls_config,
                idle: Mutex::new(VecDeque::new()),
                semaphore: Arc::new(Semaphore::new(max_pool_size as usize)),
                next_id: AtomicU32::new(0),
                description: Mutex::new(ServerDescription::default()),
            }),
        })
    }

    pub(crate) fn server_description(&self) -> ServerDescription {
        *self.inner.description.lock().unwrap()
    }

    /// Checks out a connection, reusing an idle one when available and otherwise blocking (up
    /// to `connectTimeout`) for a free slot before lazily establishing a new one
    /// (spec.md §4.6).
    pub(crate) async fn checkout(&self) -> Result<ConnectionHandle> {
        loop {
            let maybe_idle = self.inner.idle.lock().unwrap().pop_front();
            match maybe_idle {
                Some(pooled) if pooled.conn.is_poisoned() => continue,
                Some(pooled) => {
                    return Ok(ConnectionHandle {
                        pooled: Some(pooled),
                        pool: self.inner.clone(),
                    })
                }
                None => break,
            }
        }

        let permit = runtime::timeout(
            self.inner.options.connect_timeout,
            TimeoutScope::Checkout,
            async {
                self.inner
                    .semaphore
                    .clone()
                    .acquire_owned()
                    .await
                    .map_err(|_| ErrorKind::PoolExhausted.into())
            },
        )
        .await?;

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let conn = self.establish_new(id).await?;
        Ok(ConnectionHandle {
            pooled: Some(PooledConnection {
                conn: Arc::new(conn),
                permit,
            }),
            pool: self.inner.clone(),
        })
    }

    async fn establish_new(&self, id: u32) -> Result<Connection> {
        // Hosts beyond the first in a multi-host URI are not load-balanced here (spec.md §1
        // Non-goals: no SDAM); every connection in this pool targets `self.inner.address`.
        let (conn, description) = establish_connection(
            id,
            self.inner.address.clone(),
            &self.inner.options,
            self.inner.tls_config.as_ref(),
        )
        .await?;
        *self.inner.description.lock().unwrap() = description;
        Ok(conn)
    }

    /// Discards all idle connections, releasing their permits. Checked-out connections close
    /// as their handles are dropped by the caller.
    pub(crate) async fn shutdown(&self) {
        let idle: Vec<PooledConnection> = self.inner.idle.lock().unwrap().drain(..).collect();
        for pooled in idle {
            pooled.conn.close().await;
        }
    }
}
