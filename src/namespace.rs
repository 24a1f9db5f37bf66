use std::fmt;

use crate::error::{Error, ErrorKind, Result};

/// A database name paired with a collection name, rendered on the wire as `"db.collection"`.
///
/// Neither half may contain `$` or a NUL byte; the database name must be non-empty and at
/// most 63 bytes, per spec.md §3.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Namespace {
    pub db: String,
    pub coll: String,
}

impl Namespace {
    pub fn new(db: impl Into<String>, coll: impl Into<String>) -> Result<Self> {
        let db = db.into();
        let coll = coll.into();
        validate_half(&db, "database")?;
        if db.is_empty() {
            return Err(invalid("database name must not be empty"));
        }
        if db.len() > 63 {
            return Err(invalid("database name must not exceed 63 bytes"));
        }
        validate_half(&coll, "collection")?;
        Ok(Self { db, coll })
    }
}

fn validate_half(s: &str, which: &str) -> Result<()> {
    if s.contains('$') || s.contains('\0') {
        return Err(invalid(format!(
            "{which} name must not contain '$' or a NUL byte"
        )));
    }
    Ok(())
}

fn invalid(message: impl Into<String>) -> Error {
    ErrorKind::InvalidArgument {
        message: message.into(),
    }
    .into()
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.db, self.coll)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn valid_namespace() {
        let ns = Namespace::new("app", "users").unwrap();
        assert_eq!(ns.to_string(), "app.users");
    }

    #[test]
    fn rejects_dollar_and_nul() {
        assert!(Namespace::new("a$b", "c").is_err());
        assert!(Namespace::new("a", "c\0d").is_err());
    }

    #[test]
    fn rejects_empty_or_oversized_db() {
        assert!(Namespace::new("", "c").is_err());
        assert!(Namespace::new("a".repeat(64), "c").is_err());
        assert!(Namespace::new("a".repeat(63), "c").is_ok());
    }
}
