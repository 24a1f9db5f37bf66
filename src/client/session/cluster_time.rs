//! Opaque `$clusterTime` tracking, monotone per session (spec.md §3, §4.4).

use bson::{Document, Timestamp};

use crate::error::{Error, ErrorKind, Result};

/// The opaque `{clusterTime: Timestamp, signature: {...}}` document a session echoes on every
/// subsequent request once seen on a reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterTime {
    document: Document,
    timestamp: Timestamp,
}

impl ClusterTime {
    pub(crate) fn from_document(document: &Document) -> Result<Self> {
        let timestamp = document
            .get_timestamp("clusterTime")
            .map_err(|_| invalid())?;
        Ok(Self {
            document: document.clone(),
            timestamp,
        })
    }

    pub(crate) fn to_document(&self) -> Document {
        self.document.clone()
    }

    /// Keeps `self` unless `other` is strictly newer, mirroring the "retain the maximum" rule
    /// of spec.md §3.
    pub(crate) fn max(self, other: ClusterTime) -> ClusterTime {
        if other.timestamp > self.timestamp {
            other
        } else {
            self
        }
    }
}

impl PartialOrd for ClusterTime {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ClusterTime {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.timestamp.cmp(&other.timestamp)
    }
}

fn invalid() -> Error {
    ErrorKind::InvalidResponse {
        document: "missing or malformed $clusterTime.clusterTime".to_string(),
    }
    .into()
}

#[cfg(test)]
mod test {
    use super::*;
    use bson::doc;

    fn ct(t: u32, i: u32) -> ClusterTime {
        ClusterTime::from_document(&doc! {
            "clusterTime": Timestamp { time: t, increment: i },
            "signature": { "hash": bson::Binary { subtype: bson::spec::BinarySubtype::Generic, bytes: vec![] }, "keyId": 0i64 },
        })
        .unwrap()
    }

    #[test]
    fn max_keeps_the_newer_time() {
        let a = ct(10, 0);
        let b = ct(20, 0);
        assert_eq!(a.clone().max(b.clone()), b);
        assert_eq!(b.clone().max(a), b);
    }
}
