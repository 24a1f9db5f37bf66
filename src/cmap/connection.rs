//! A single socket to a mongod, with its own request-id allocator and in-flight reply map
//! (spec.md §3 "Connection", §4.2).

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicI32, Ordering},
        Arc,
    },
    time::Duration,
};

use bson::{Document, RawDocumentBuf};
use tokio::{
    io::{split, AsyncWriteExt, ReadHalf, WriteHalf},
    sync::{oneshot, Mutex},
    task::JoinHandle,
};

use super::command::{Command, RawCommandResponse};
use crate::{
    client::options::{ClientOptions, ServerAddress},
    error::{Error, ErrorKind, Result, TimeoutScope},
    runtime::{self, AsyncStream, TlsConfig},
    wire::{
        header::{Header, OpCode},
        message::{self, DocumentSequence, Message, DEFAULT_MAX_MESSAGE_SIZE_BYTES},
        RequestIdGenerator,
    },
};

type Waiters = Arc<Mutex<HashMap<i32, oneshot::Sender<Result<Document>>>>>;

/// One socket and everything needed to serialize requests and demultiplex replies onto it
/// (spec.md §4.2). Cheap to pass by reference; not `Clone` because exclusive write access is
/// the whole point of the write lock.
#[derive(Debug)]
pub(crate) struct Connection {
    pub(crate) id: u32,
    pub(crate) address: ServerAddress,
    write_half: Mutex<WriteHalf<AsyncStream>>,
    request_ids: RequestIdGenerator,
    waiters: Waiters,
    poisoned: Arc<AtomicBool>,
    reader_task: JoinHandle<()>,
    max_message_size_bytes: AtomicI32,
    use_op_msg: AtomicBool,
    socket_timeout: Duration,
}

impl Connection {
    /// Opens a TCP (optionally TLS) socket and starts the background reader task. Does not
    /// perform the `hello`/auth handshake; see [`crate::cmap::establish`].
    pub(crate) async fn connect(
        id: u32,
        address: ServerAddress,
        options: &ClientOptions,
        tls_config: Option<&TlsConfig>,
    ) -> Result<Self> {
        let stream = runtime::timeout(options.connect_timeout, TimeoutScope::Connect, async {
            AsyncStream::connect(&address, tls_config).await
        })
        .await?;

        let (read_half, write_half) = split(stream);
        let waiters: Waiters = Arc::new(Mutex::new(HashMap::new()));
        let poisoned = Arc::new(AtomicBool::new(false));

        let reader_task = tokio::spawn(reader_loop(
            read_half,
            waiters.clone(),
            poisoned.clone(),
            DEFAULT_MAX_MESSAGE_SIZE_BYTES,
        ));

        Ok(Self {
            id,
            address,
            write_half: Mutex::new(write_half),
            request_ids: RequestIdGenerator::new(),
            waiters,
            poisoned,
            reader_task,
            max_message_size_bytes: AtomicI32::new(DEFAULT_MAX_MESSAGE_SIZE_BYTES),
            use_op_msg: AtomicBool::new(false),
            socket_timeout: options.socket_timeout,
        })
    }

    /// A connection that has hit an unrecoverable I/O or protocol error (spec.md §4.1, §4.2
    /// "Failure model"). The pool must discard it rather than reuse it.
    pub(crate) fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::SeqCst)
    }

    fn mark_poisoned(&self) {
        self.poisoned.store(true, Ordering::SeqCst);
    }

    /// Records the server's advertised wire version (from the `hello`/`isMaster` reply),
    /// switching outgoing framing to OP_MSG once the server supports it (spec.md §6).
    pub(crate) fn set_max_wire_version(&self, max_wire_version: i32) {
        self.use_op_msg.store(max_wire_version >= 6, Ordering::SeqCst);
    }

    pub(crate) fn set_max_message_size_bytes(&self, bytes: i32) {
        self.max_message_size_bytes.store(bytes, Ordering::SeqCst);
    }

    /// Sends a fully-assembled command and awaits its reply, per spec.md §4.2 `execute`.
    pub(crate) async fn send(&self, command: Command) -> Result<RawCommandResponse> {
        self.execute_raw(command.into_raw_document()?, Vec::new())
            .await
    }

    /// The primitive used both by [`Connection::send`] and by the auth engine, which builds
    /// its own unadorned command documents (spec.md §4.3: "passes no session id").
    pub(crate) async fn execute_raw(
        &self,
        body: RawDocumentBuf,
        document_sequences: Vec<DocumentSequence>,
    ) -> Result<RawCommandResponse> {
        if self.is_poisoned() {
            return Err(ErrorKind::ConnectionClosed.into());
        }

        let request_id = self.request_ids.next();
        let (tx, rx) = oneshot::channel();
        self.waiters.lock().await.insert(request_id, tx);

        let write_result = self
            .write_frame(request_id, body, document_sequences)
            .await;
        if let Err(e) = write_result {
            self.waiters.lock().await.remove(&request_id);
            self.mark_poisoned();
            return Err(e);
        }

        let reply = runtime::timeout(self.socket_timeout, TimeoutScope::Socket, async {
            rx.await.map_err(|_| {
                Error::from(ErrorKind::ConnectionClosed)
            })?
        })
        .await;

        if reply.is_err() {
            // Either a timeout or a channel drop: the reader can no longer be trusted to match
            // a later, delayed reply to this request id (spec.md §5, "Cancellation").
            self.waiters.lock().await.remove(&request_id);
            self.mark_poisoned();
        }

        reply.map(RawCommandResponse::from_document)
    }

    async fn write_frame(
        &self,
        request_id: i32,
        body: RawDocumentBuf,
        document_sequences: Vec<DocumentSequence>,
    ) -> Result<()> {
        let max = self.max_message_size_bytes.load(Ordering::SeqCst);
        let mut write_half = self.write_half.lock().await;

        if self.use_op_msg.load(Ordering::SeqCst) {
            let msg = Message::new_request(request_id, body, document_sequences);
            msg.write_to(&mut *write_half, max).await
        } else {
            let full_collection_name = format!("{}.$cmd", command_db_name(&body)?);
            message::write_legacy_query(&mut *write_half, request_id, &full_collection_name, &body)
                .await
        }
    }

    /// Best-effort shutdown: stops the reader task and closes the socket. Errors are ignored,
    /// matching the pool's "discard, don't report" policy for connections being torn down.
    pub(crate) async fn close(&self) {
        self.mark_poisoned();
        self.reader_task.abort();
        let _ = self.write_half.lock().await.shutdown().await;
    }
}

/// `$db` is always present once [`Command::into_raw_document`] has run; this only matters for
/// the legacy OP_QUERY fallback, which needs the namespace rather than a bare document.
fn command_db_name(body: &RawDocumentBuf) -> Result<String> {
    body.get_str("$db")
        .ok()
        .flatten()
        .map(str::to_string)
        .ok_or_else(|| {
            Error::from(ErrorKind::Internal {
                message: "command body missing required $db field".to_string(),
            })
        })
}

async fn reader_loop(
    mut read_half: ReadHalf<AsyncStream>,
    waiters: Waiters,
    poisoned: Arc<AtomicBool>,
    max_message_size_bytes: i32,
) {
    loop {
        let header = match Header::read_from(&mut read_half).await {
            Ok(h) => h,
            Err(_) => {
                fail_all_waiters(&waiters, &poisoned).await;
                return;
            }
        };

        let body = match header.op_code {
            OpCode::Message => {
                Message::read_from(&mut read_half, header, max_message_size_bytes)
                    .await
                    .and_then(|msg| {
                        // This crate never sets `exhaustAllowed` on a request (spec.md §4.1),
                        // so a conforming server never replies with `moreToCome` either; treat
                        // one as a protocol violation rather than silently handing the caller
                        // only the first of an exhaust stream's frames.
                        if msg.flags.contains(message::MsgFlags::MORE_TO_COME) {
                            return Err(Error::protocol(
                                "server sent moreToCome on a reply to a non-exhaust request",
                            ));
                        }
                        bson::from_slice::<Document>(msg.document_payload.as_bytes())
                            .map(|doc| (msg.response_to, doc))
                            .map_err(Error::from)
                    })
            }
            OpCode::Reply => {
                message::LegacyReply::read_from(&mut read_half, header, max_message_size_bytes)
                    .await
                    .and_then(|reply| {
                        let doc = reply
                            .documents
                            .first()
                            .map(|d| bson::from_slice::<Document>(d.as_bytes()))
                            .transpose()
                            .map_err(Error::from)?
                            .unwrap_or_default();
                        Ok((header.response_to, doc))
                    })
            }
            OpCode::Query => Err(Error::protocol("server sent an OP_QUERY frame")),
        };

        match body {
            Ok((response_to, doc)) => {
                let mut waiters_guard = waiters.lock().await;
                if let Some(tx) = waiters_guard.remove(&response_to) {
                    let _ = tx.send(Ok(doc));
                }
                // An unknown responseTo poisons the connection per spec.md §4.1, since it
                // indicates the wire is desynchronized.
                else if response_to != 0 {
                    drop(waiters_guard);
                    fail_all_waiters(&waiters, &poisoned).await;
                    return;
                }
            }
            Err(e) => {
                let mut waiters_guard = waiters.lock().await;
                for (_, tx) in waiters_guard.drain() {
                    let _ = tx.send(Err(e.clone()));
                }
                drop(waiters_guard);
                poisoned.store(true, Ordering::SeqCst);
                return;
            }
        }
    }
}

async fn fail_all_waiters(waiters: &Waiters, poisoned: &Arc<AtomicBool>) {
    poisoned.store(true, Ordering::SeqCst);
    let mut waiters_guard = waiters.lock().await;
    for (_, tx) in waiters_guard.drain() {
        let _ = tx.send(Err(ErrorKind::ConnectionClosed.into()));
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.reader_task.abort();
    }
}
