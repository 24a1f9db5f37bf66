//! `killCursors`: releases server-side cursor resources the client is abandoning
//! (spec.md §4.7, "the Cursor Engine... sends killCursors on drop if not already exhausted").

use bson::{doc, Bson, Document};

use super::Operation;
use crate::{error::Result, namespace::Namespace};

#[derive(Debug)]
pub(crate) struct KillCursors {
    ns: Namespace,
    cursor_ids: Vec<i64>,
}

impl KillCursors {
    pub(crate) fn new(ns: Namespace, cursor_ids: Vec<i64>) -> Self {
        Self { ns, cursor_ids }
    }
}

impl Operation for KillCursors {
    type Output = ();

    const NAME: &'static str = "killCursors";

    fn target_db(&self) -> &str {
        &self.ns.db
    }

    fn build(&self) -> Result<Document> {
        Ok(doc! {
            Self::NAME: self.ns.coll.clone(),
            "cursors": self.cursor_ids.iter().map(|id| Bson::Int64(*id)).collect::<Vec<_>>(),
        })
    }

    fn handle_response(&self, _response: Document) -> Result<Self::Output> {
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn builds_cursor_id_array() {
        let op = KillCursors::new(Namespace::new("db", "coll").unwrap(), vec![1, 2, 3]);
        let body = op.build().unwrap();
        let ids = body.get_array("cursors").unwrap();
        assert_eq!(ids.len(), 3);
    }
}
