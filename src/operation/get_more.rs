//! `getMore`: fetches the next batch for an open cursor (spec.md §4.7).

use std::time::Duration;

use bson::{doc, Document, RawDocumentBuf};
use serde::Deserialize;

use super::Operation;
use crate::{
    error::{Error, ErrorKind, Result},
    namespace::Namespace,
};

#[derive(Debug)]
pub(crate) struct GetMore {
    ns: Namespace,
    cursor_id: i64,
    batch_size: Option<u32>,
    max_time: Option<Duration>,
}

impl GetMore {
    pub(crate) fn new(
        ns: Namespace,
        cursor_id: i64,
        batch_size: Option<u32>,
        max_time: Option<Duration>,
    ) -> Self {
        Self {
            ns,
            cursor_id,
            batch_size,
            max_time,
        }
    }
}

/// Decoded `cursor.nextBatch` plus the id needed to know whether to keep paging
/// (spec.md §4.7: "exhausted" is signaled by a zero cursor id).
#[derive(Debug)]
pub(crate) struct GetMoreResult {
    pub(crate) id: i64,
    pub(crate) next_batch: Vec<RawDocumentBuf>,
    pub(crate) exhausted: bool,
}

#[derive(Debug, Deserialize)]
struct CursorBody {
    id: i64,
    #[serde(rename = "nextBatch")]
    next_batch: Vec<Document>,
}

#[derive(Debug, Deserialize)]
struct GetMoreReply {
    cursor: CursorBody,
}

impl Operation for GetMore {
    type Output = GetMoreResult;

    const NAME: &'static str = "getMore";

    fn target_db(&self) -> &str {
        &self.ns.db
    }

    fn build(&self) -> Result<Document> {
        let mut body = doc! {
            Self::NAME: self.cursor_id,
            "collection": self.ns.coll.clone(),
        };
        if let Some(batch_size) = self.batch_size {
            if batch_size != 0 {
                body.insert("batchSize", batch_size as i32);
            }
        }
        if let Some(max_time) = self.max_time {
            body.insert("maxTimeMS", max_time.as_millis().min(i32::MAX as u128) as i32);
        }
        Ok(body)
    }

    fn handle_response(&self, response: Document) -> Result<Self::Output> {
        let reply: GetMoreReply = bson::from_document(response).map_err(|e| {
            Error::from(ErrorKind::InvalidResponse {
                document: e.to_string(),
            })
        })?;
        let next_batch = reply
            .cursor
            .next_batch
            .into_iter()
            .map(|doc| {
                let mut bytes = Vec::new();
                doc.to_writer(&mut bytes)?;
                RawDocumentBuf::from_bytes(bytes).map_err(Error::from)
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(GetMoreResult {
            id: reply.cursor.id,
            exhausted: reply.cursor.id == 0,
            next_batch,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn omits_zero_batch_size() {
        let op = GetMore::new(Namespace::new("db", "coll").unwrap(), 42, Some(0), None);
        let body = op.build().unwrap();
        assert!(!body.contains_key("batchSize"));
    }

    #[test]
    fn decodes_exhausted_cursor() {
        let op = GetMore::new(Namespace::new("db", "coll").unwrap(), 42, None, None);
        let reply = doc! {
            "cursor": { "id": 0i64, "nextBatch": [] },
            "ok": 1,
        };
        let result = op.handle_response(reply).unwrap();
        assert!(result.exhausted);
        assert_eq!(result.id, 0);
    }
}
