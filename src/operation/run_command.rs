//! Escape hatch for arbitrary command documents the typed operations don't model
//! (spec.md §9, "a tagged variant of known command shapes plus an escape hatch").

use bson::Document;

use super::Operation;
use crate::error::{Error, ErrorKind, Result};

#[derive(Debug)]
pub(crate) struct RunCommand {
    db: String,
    name: String,
    body: Document,
}

impl RunCommand {
    /// `command` must be a single-key-or-more document whose first key is the command name,
    /// matching how a caller would hand-write it (e.g. `doc! { "ping": 1 }`).
    pub(crate) fn new(db: impl Into<String>, command: Document) -> Result<Self> {
        let name = command
            .keys()
            .next()
            .cloned()
            .ok_or_else(|| {
                Error::from(ErrorKind::InvalidArgument {
                    message: "an empty document cannot be run as a command".to_string(),
                })
            })?;
        Ok(Self {
            db: db.into(),
            name,
            body: command,
        })
    }
}

impl Operation for RunCommand {
    type Output = Document;

    const NAME: &'static str = "$genericRunCommand";

    /// The dispatcher calls this, not [`Operation::NAME`], to pick the wire command name: a
    /// `RunCommand`'s is whatever leading key the caller's document used, only known at runtime.
    fn name(&self) -> &str {
        &self.name
    }

    fn target_db(&self) -> &str {
        &self.db
    }

    fn build(&self) -> Result<Document> {
        Ok(self.body.clone())
    }

    fn handle_response(&self, response: Document) -> Result<Self::Output> {
        Ok(response)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use bson::doc;

    #[test]
    fn rejects_empty_document() {
        assert!(RunCommand::new("admin", doc! {}).is_err());
    }

    #[test]
    fn captures_leading_key_as_command_name() {
        let cmd = RunCommand::new("admin", doc! { "ping": 1 }).unwrap();
        assert_eq!(cmd.name(), "ping");
    }
}
