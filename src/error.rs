//! Contains the `Error` and `Result` types that this crate uses.

use std::{collections::HashSet, fmt, sync::Arc};

use thiserror::Error;

/// The result type for all methods that can return an error in this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// An error that can occur in this crate. The inner [`ErrorKind`] is boxed so that
/// `Error` stays small and cheap to clone; `labels` carries the transaction/retry
/// labels described in the MongoDB sessions/transactions spec.
#[derive(Clone, Debug, Error)]
#[error("{kind}")]
pub struct Error {
    /// The type of error that occurred.
    pub kind: Box<ErrorKind>,
    labels: HashSet<String>,
    #[source]
    source: Option<Box<Error>>,
}

/// Error label applied to a network error or server selection error that occurs during a
/// transaction, signaling that the whole transaction may be retried.
pub const TRANSIENT_TRANSACTION_ERROR: &str = "TransientTransactionError";
/// Error label applied when the outcome of a `commitTransaction` attempt could not be
/// determined (e.g. the command was abandoned after a timeout).
pub const UNKNOWN_TRANSACTION_COMMIT_RESULT: &str = "UnknownTransactionCommitResult";

impl Error {
    pub(crate) fn new(kind: ErrorKind) -> Self {
        Self {
            kind: Box::new(kind),
            labels: HashSet::new(),
            source: None,
        }
    }

    pub(crate) fn with_label(mut self, label: impl Into<String>) -> Self {
        self.labels.insert(label.into());
        self
    }

    pub(crate) fn with_labels(mut self, labels: impl IntoIterator<Item = String>) -> Self {
        self.labels.extend(labels);
        self
    }

    pub(crate) fn with_source(mut self, source: Error) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// Returns true if this error carries the given label.
    pub fn contains_label(&self, label: &str) -> bool {
        self.labels.contains(label)
    }

    /// The set of error labels attached to this error.
    pub fn labels(&self) -> &HashSet<String> {
        &self.labels
    }

    pub(crate) fn authentication_failure(mechanism: &str, reason: AuthErrorReason) -> Self {
        ErrorKind::AuthenticationFailure {
            mechanism: mechanism.to_string(),
            reason,
        }
        .into()
    }

    pub(crate) fn invalid_uri(reason: InvalidUriReason) -> Self {
        ErrorKind::InvalidUri { reason }.into()
    }

    pub(crate) fn invalid_response(document: impl fmt::Debug) -> Self {
        ErrorKind::InvalidResponse {
            document: format!("{document:?}"),
        }
        .into()
    }

    pub(crate) fn protocol(message: impl Into<String>) -> Self {
        ErrorKind::ProtocolError {
            message: message.into(),
        }
        .into()
    }

    pub(crate) fn is_network_error(&self) -> bool {
        matches!(
            *self.kind,
            ErrorKind::Io(_) | ErrorKind::ConnectionClosed | ErrorKind::ProtocolError { .. }
        )
    }

    /// Whether this error should cause a transaction to transition to `Aborted` and be
    /// labeled as transient per spec.md §4.5 / §8 scenario S6.
    pub(crate) fn is_transient_transaction_error(&self) -> bool {
        self.is_network_error() || matches!(*self.kind, ErrorKind::Timeout { .. })
    }
}

/// The taxonomy of error kinds this crate can surface, per spec.md §7.
#[derive(Clone, Debug, Error)]
#[non_exhaustive]
pub enum ErrorKind {
    /// The connection string / URI could not be parsed.
    #[error("invalid connection string: {reason:?}")]
    InvalidUri { reason: InvalidUriReason },

    /// A SASL/SCRAM authentication conversation failed.
    #[error("{mechanism} authentication failed: {reason:?}")]
    AuthenticationFailure {
        mechanism: String,
        reason: AuthErrorReason,
    },

    /// A malformed wire frame, an unknown `responseTo`, or an oversize message.
    #[error("protocol error: {message}")]
    ProtocolError { message: String },

    /// The server replied with `ok: 0`.
    #[error("command failed with code {code} ({code_name}): {message}")]
    ServerError {
        code: i32,
        code_name: String,
        message: String,
    },

    /// A suspending operation exceeded its deadline.
    #[error("operation timed out: {scope:?}")]
    Timeout { scope: TimeoutScope },

    /// Checkout from the connection pool was not satisfied before `connectTimeout` elapsed.
    #[error("connection pool exhausted")]
    PoolExhausted,

    /// A reply parsed as a BSON document but was missing or mistyped a required field.
    #[error("invalid response from server: {document}")]
    InvalidResponse { document: String },

    /// A command could not be formed from the caller's input.
    #[error("cannot form command: {reason:?}")]
    CannotFormCommand { reason: CannotFormCommandReason },

    /// An operation was attempted on a poisoned or closed connection.
    #[error("connection closed")]
    ConnectionClosed,

    /// A low-level I/O error.
    #[error("io error: {0}")]
    Io(Arc<std::io::Error>),

    /// BSON serialization failed.
    #[error("bson serialization error: {0}")]
    BsonSerialization(Arc<bson::ser::Error>),

    /// BSON deserialization failed.
    #[error("bson deserialization error: {0}")]
    BsonDeserialization(Arc<bson::de::Error>),

    /// Invalid argument supplied by the caller (e.g. a malformed namespace).
    #[error("invalid argument: {message}")]
    InvalidArgument { message: String },

    /// Internal invariant violation; indicates a driver bug rather than caller error.
    #[error("internal error: {message}")]
    Internal { message: String },
}

/// Sub-reasons for [`ErrorKind::InvalidUri`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InvalidUriReason {
    MissingMongoDbScheme,
    UriIsMalformed,
    MalformedAuthenticationDetails,
    UnsupportedAuthenticationMechanism,
    InvalidPort,
}

/// Sub-reasons for [`ErrorKind::AuthenticationFailure`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AuthErrorReason {
    ScramFailure,
    MalformedAuthenticationDetails,
    UnsupportedMechanism,
}

/// The suspending operation that exceeded its deadline.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimeoutScope {
    Connect,
    Socket,
    Checkout,
}

/// Sub-reasons for [`ErrorKind::CannotFormCommand`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CannotFormCommandReason {
    NothingToDo,
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Error::new(kind)
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        ErrorKind::Io(Arc::new(e)).into()
    }
}

impl From<bson::ser::Error> for Error {
    fn from(e: bson::ser::Error) -> Self {
        ErrorKind::BsonSerialization(Arc::new(e)).into()
    }
}

impl From<bson::de::Error> for Error {
    fn from(e: bson::de::Error) -> Self {
        ErrorKind::BsonDeserialization(Arc::new(e)).into()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn labels_roundtrip() {
        let err: Error = ErrorKind::ConnectionClosed.into();
        let err = err.with_label(TRANSIENT_TRANSACTION_ERROR);
        assert!(err.contains_label(TRANSIENT_TRANSACTION_ERROR));
        assert!(!err.contains_label(UNKNOWN_TRANSACTION_COMMIT_RESULT));
    }

    #[test]
    fn network_errors_are_transient() {
        let err: Error = ErrorKind::ConnectionClosed.into();
        assert!(err.is_transient_transaction_error());

        let err: Error = ErrorKind::InvalidArgument {
            message: "bad".into(),
        }
        .into();
        assert!(!err.is_transient_transaction_error());
    }
}
