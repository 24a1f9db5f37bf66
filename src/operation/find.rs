//! `find`: opens a cursor over documents matching a filter (spec.md §4.7).

use std::time::Duration;

use bson::{doc, Document, RawDocumentBuf};
use serde::Deserialize;

use super::Operation;
use crate::{
    error::{Error, ErrorKind, Result},
    namespace::Namespace,
};

/// Options accepted by [`Find`], mirroring the subset of the CRUD `find` command this core
/// supports (spec.md §1 Non-goals exclude CRUD helpers generally, but a `find` is required to
/// exercise the cursor engine end to end per spec.md §4.7).
#[derive(Debug, Clone, Default)]
pub struct FindOptions {
    pub sort: Option<Document>,
    pub projection: Option<Document>,
    pub limit: Option<i64>,
    pub skip: Option<u64>,
    pub batch_size: Option<u32>,
    pub max_time: Option<Duration>,
}

#[derive(Debug)]
pub(crate) struct Find {
    ns: Namespace,
    filter: Document,
    options: FindOptions,
}

impl Find {
    pub(crate) fn new(ns: Namespace, filter: Document, options: FindOptions) -> Self {
        Self {
            ns,
            filter,
            options,
        }
    }
}

/// The first batch plus enough of the cursor state to hand off to [`crate::cursor::Cursor`]
/// (spec.md §4.7).
#[derive(Debug)]
pub(crate) struct FindResult {
    pub(crate) id: i64,
    pub(crate) ns: Namespace,
    pub(crate) first_batch: Vec<RawDocumentBuf>,
    pub(crate) exhausted: bool,
}

#[derive(Debug, Deserialize)]
struct CursorBody {
    id: i64,
    ns: String,
    #[serde(rename = "firstBatch")]
    first_batch: Vec<Document>,
}

#[derive(Debug, Deserialize)]
struct FindReply {
    cursor: CursorBody,
}

impl Operation for Find {
    type Output = FindResult;

    const NAME: &'static str = "find";

    fn target_db(&self) -> &str {
        &self.ns.db
    }

    fn build(&self) -> Result<Document> {
        let mut body = doc! {
            Self::NAME: self.ns.coll.clone(),
            "filter": self.filter.clone(),
        };
        if let Some(sort) = &self.options.sort {
            body.insert("sort", sort.clone());
        }
        if let Some(projection) = &self.options.projection {
            body.insert("projection", projection.clone());
        }
        if let Some(limit) = self.options.limit {
            if limit < 0 {
                body.insert("singleBatch", true);
            }
            body.insert("limit", limit.unsigned_abs() as i64);
        }
        if let Some(skip) = self.options.skip {
            body.insert("skip", skip as i64);
        }
        if let Some(batch_size) = self.options.batch_size {
            body.insert("batchSize", batch_size as i32);
        }
        if let Some(max_time) = self.options.max_time {
            body.insert("maxTimeMS", max_time.as_millis().min(i32::MAX as u128) as i32);
        }
        Ok(body)
    }

    fn handle_response(&self, response: Document) -> Result<Self::Output> {
        let reply: FindReply = bson::from_document(response).map_err(|e| {
            Error::from(ErrorKind::InvalidResponse {
                document: e.to_string(),
            })
        })?;
        let (db, coll) = reply
            .cursor
            .ns
            .split_once('.')
            .ok_or_else(|| {
                Error::from(ErrorKind::InvalidResponse {
                    document: format!("malformed cursor namespace {:?}", reply.cursor.ns),
                })
            })?;
        let ns = Namespace::new(db, coll)?;
        let first_batch = reply
            .cursor
            .first_batch
            .into_iter()
            .map(|doc| {
                let mut bytes = Vec::new();
                doc.to_writer(&mut bytes)?;
                RawDocumentBuf::from_bytes(bytes).map_err(Error::from)
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(FindResult {
            id: reply.cursor.id,
            exhausted: reply.cursor.id == 0,
            ns,
            first_batch,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn negative_limit_requests_single_batch() {
        let op = Find::new(
            Namespace::new("db", "coll").unwrap(),
            doc! {},
            FindOptions {
                limit: Some(-5),
                ..Default::default()
            },
        );
        let body = op.build().unwrap();
        assert_eq!(body.get_bool("singleBatch").unwrap(), true);
        assert_eq!(body.get_i64("limit").unwrap(), 5);
    }

    #[test]
    fn decodes_first_batch() {
        let op = Find::new(Namespace::new("db", "coll").unwrap(), doc! {}, FindOptions::default());
        let reply = doc! {
            "cursor": { "id": 0i64, "ns": "db.coll", "firstBatch": [{"_id": 1}] },
            "ok": 1,
        };
        let result = op.handle_response(reply).unwrap();
        assert_eq!(result.first_batch.len(), 1);
        assert!(result.exhausted);
    }
}
