//! Driver-side model of a database command and its raw reply (spec.md §4.8).

use bson::{doc, Bson, Document, RawDocumentBuf};
use serde::de::DeserializeOwned;

use crate::{
    client::session::ClusterTime,
    error::{Error, ErrorKind, Result},
};

/// A command about to be sent on a [`crate::cmap::connection::Connection`]. Built by the
/// dispatcher in [`crate::operation`]; metadata (`lsid`, `$clusterTime`, `txnNumber`, …) is
/// attached by [`Command::with_session_metadata`] before the body is framed.
#[derive(Debug, Clone)]
pub(crate) struct Command {
    pub(crate) name: String,
    pub(crate) target_db: String,
    pub(crate) body: Document,
}

impl Command {
    pub(crate) fn new(name: impl Into<String>, target_db: impl Into<String>, body: Document) -> Self {
        Self {
            name: name.into(),
            target_db: target_db.into(),
            body,
        }
    }

    /// Attaches session/transaction metadata per spec.md §4.8 item 1: `$db`, then `lsid`,
    /// `$clusterTime`, `txnNumber`, `autocommit`, `startTransaction`, in that order, omitting
    /// any field not applicable. `$db` is inserted here too (not just in
    /// [`Command::into_raw_document`]) so it lands before `lsid` in field order for commands
    /// that go through this path.
    pub(crate) fn with_session_metadata(
        mut self,
        lsid: Option<&Document>,
        cluster_time: Option<&ClusterTime>,
        txn_number: Option<i64>,
        autocommit: Option<bool>,
        start_transaction: bool,
    ) -> Self {
        self.body.insert("$db", self.target_db.clone());
        if let Some(lsid) = lsid {
            self.body.insert("lsid", lsid.clone());
        }
        if let Some(cluster_time) = cluster_time {
            self.body.insert("$clusterTime", cluster_time.to_document());
        }
        if let Some(txn_number) = txn_number {
            self.body.insert("txnNumber", txn_number);
        }
        if let Some(autocommit) = autocommit {
            self.body.insert("autocommit", autocommit);
        }
        if start_transaction {
            self.body.insert("startTransaction", true);
        }
        self
    }

    /// Serializes the command name as the leading key followed by the rest of `body`, since
    /// command encoding is position-sensitive (spec.md §3). `$db` is attached here rather than
    /// only in `with_session_metadata`, so every command this crate sends carries it — the
    /// handshake, SCRAM, and any session-less `Dispatcher`/cursor/`killCursors` path included
    /// (spec.md §4.8 item 1: "`$db`... on every outgoing command").
    pub(crate) fn into_raw_document(mut self) -> Result<RawDocumentBuf> {
        if !self.target_db.is_empty() && !self.body.contains_key("$db") {
            self.body.insert("$db", self.target_db.clone());
        }

        let mut ordered = Document::new();
        let name_value = self.body.remove(&self.name).unwrap_or(Bson::Int32(1));
        ordered.insert(self.name.clone(), name_value);
        ordered.extend(self.body);

        let mut bytes = Vec::new();
        ordered.to_writer(&mut bytes)?;
        RawDocumentBuf::from_bytes(bytes).map_err(Error::from)
    }
}

/// A reply body, still bson-typed, plus the numeric-coercion helpers spec.md §4.8 requires
/// (`ok`/`conversationId` may arrive as int32/int64/double).
#[derive(Debug, Clone)]
pub(crate) struct RawCommandResponse {
    pub(crate) body: Document,
}

impl RawCommandResponse {
    pub(crate) fn from_document(body: Document) -> Self {
        Self { body }
    }

    pub(crate) fn deserialize<T: DeserializeOwned>(&self) -> Result<T> {
        bson::from_document(self.body.clone()).map_err(Error::from)
    }

    /// `true` when the reply's `ok` field coerces to `>= 1` (spec.md §4.8: accept
    /// int32/int64/double).
    pub(crate) fn is_success(&self) -> bool {
        numeric_field(&self.body, "ok")
            .map(|n| n >= 1.0)
            .unwrap_or(false)
    }

    pub(crate) fn conversation_id(&self) -> Option<Bson> {
        self.body.get("conversationId").cloned()
    }

    pub(crate) fn cluster_time(&self) -> Option<ClusterTime> {
        self.body
            .get_document("$clusterTime")
            .ok()
            .and_then(|d| ClusterTime::from_document(d).ok())
    }

    /// Maps an `ok != 1` reply to [`ErrorKind::ServerError`], per spec.md §7.
    pub(crate) fn into_result(self) -> Result<Document> {
        if self.is_success() {
            return Ok(self.body);
        }
        let code = self.body.get_i32("code").unwrap_or(-1);
        let code_name = self
            .body
            .get_str("codeName")
            .unwrap_or("UnknownError")
            .to_string();
        let message = self
            .body
            .get_str("errmsg")
            .unwrap_or("command failed")
            .to_string();
        let labels: Vec<String> = self
            .body
            .get_array("errorLabels")
            .map(|arr| {
                arr.iter()
                    .filter_map(|b| b.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();

        let err: Error = ErrorKind::ServerError {
            code,
            code_name,
            message,
        }
        .into();
        Err(err.with_labels(labels))
    }
}

/// Coerces a BSON numeric field of unknown width to `f64` (spec.md §9, "dynamic typing in
/// replies").
pub(crate) fn numeric_field(doc: &Document, key: &str) -> Option<f64> {
    match doc.get(key)? {
        Bson::Int32(n) => Some(*n as f64),
        Bson::Int64(n) => Some(*n as f64),
        Bson::Double(n) => Some(*n),
        Bson::Boolean(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn command_name_is_leading_key() {
        let cmd = Command::new("ping", "admin", doc! {});
        let raw = cmd.into_raw_document().unwrap();
        let mut iter = raw.iter();
        let (key, _) = iter.next().unwrap().unwrap();
        assert_eq!(key, "ping");
    }

    #[test]
    fn db_is_attached_even_without_session_metadata() {
        let cmd = Command::new("isMaster", "admin", doc! {});
        let raw = cmd.into_raw_document().unwrap();
        let doc: Document = bson::from_slice(raw.as_bytes()).unwrap();
        assert_eq!(doc.get_str("$db").unwrap(), "admin");
    }

    #[test]
    fn an_explicit_db_field_is_not_overwritten() {
        let cmd = Command::new("ping", "admin", doc! { "$db": "already-set" });
        let raw = cmd.into_raw_document().unwrap();
        let doc: Document = bson::from_slice(raw.as_bytes()).unwrap();
        assert_eq!(doc.get_str("$db").unwrap(), "already-set");
    }

    #[test]
    fn ok_coerces_across_numeric_types() {
        for ok in [Bson::Int32(1), Bson::Int64(1), Bson::Double(1.0)] {
            let body = doc! { "ok": ok };
            assert!(RawCommandResponse::from_document(body).is_success());
        }
    }

    #[test]
    fn server_error_carries_labels() {
        let body = doc! {
            "ok": 0,
            "code": 251,
            "codeName": "NoSuchTransaction",
            "errmsg": "transaction not found",
            "errorLabels": ["TransientTransactionError"],
        };
        let err = RawCommandResponse::from_document(body).into_result().unwrap_err();
        assert!(err.contains_label("TransientTransactionError"));
    }
}
