//! Per-session transaction state machine (spec.md §4.5).

use crate::{
    cmap::pool::ConnectionHandle,
    error::{Error, ErrorKind, Result},
};

/// Transaction lifecycle state, per spec.md §4.5:
///
/// ```text
/// None ──begin──▶ Starting ──first-op──▶ InProgress ──commit──▶ Committed
///                                     ╰──abort──▶ Aborted
/// Committed/Aborted ──begin──▶ Starting (with fresh txn number)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TransactionState {
    None,
    Starting,
    InProgress,
    Committed,
    Aborted,
}

/// The per-session transaction record (spec.md §3, Transaction).
#[derive(Debug, Default)]
pub(crate) struct Transaction {
    pub(crate) id: i64,
    pub(crate) state: TransactionStateCell,
    pinned_connection: Option<ConnectionHandle>,
}

/// Wraps [`TransactionState`] so `Transaction` can derive `Default` (the enum's "no
/// transaction" value is `None`, not the unit default).
#[derive(Debug)]
pub(crate) struct TransactionStateCell(pub(crate) TransactionState);

impl Default for TransactionStateCell {
    fn default() -> Self {
        Self(TransactionState::None)
    }
}

impl Transaction {
    pub(crate) fn state(&self) -> TransactionState {
        self.state.0
    }

    /// `transaction.id` strictly increases per session and is never reused (spec.md §3, §4.5).
    pub(crate) fn begin(&mut self) -> Result<()> {
        match self.state.0 {
            TransactionState::Starting | TransactionState::InProgress => {
                return Err(ErrorKind::InvalidArgument {
                    message: "a transaction is already in progress on this session".to_string(),
                }
                .into())
            }
            TransactionState::None | TransactionState::Committed | TransactionState::Aborted => {}
        }
        self.id += 1;
        self.state.0 = TransactionState::Starting;
        self.pinned_connection = None;
        Ok(())
    }

    /// Pins `handle` for the remainder of the transaction (spec.md §3: "once
    /// `pinned_connection` is set, all commands of the transaction run on that Connection
    /// until commit/abort"). The handle's pool permit is held for as long as the pin lasts.
    pub(crate) fn pin(&mut self, handle: ConnectionHandle) {
        self.pinned_connection = Some(handle);
    }

    /// The connection every command of an in-progress transaction must reuse.
    pub(crate) fn pinned_connection(&self) -> Option<&ConnectionHandle> {
        self.pinned_connection.as_ref()
    }

    /// Whether this command is the first operation of the transaction, i.e. the one that
    /// carries `startTransaction: true` (spec.md §4.5). Transitions `Starting` to
    /// `InProgress` on the first call.
    pub(crate) fn note_command_issued(&mut self) -> bool {
        let is_first = self.state.0 == TransactionState::Starting;
        if is_first {
            self.state.0 = TransactionState::InProgress;
        }
        is_first
    }

    pub(crate) fn in_transaction(&self) -> bool {
        matches!(
            self.state.0,
            TransactionState::Starting | TransactionState::InProgress
        )
    }

    pub(crate) fn autocommit(&self) -> Option<bool> {
        if self.in_transaction() {
            Some(false)
        } else {
            None
        }
    }

    fn end(&mut self, state: TransactionState) {
        self.state.0 = state;
        self.pinned_connection = None;
    }

    pub(crate) fn mark_committed(&mut self) {
        self.end(TransactionState::Committed);
    }

    /// Transitions to `Aborted`. Per spec.md §4.5, an error labeled `TransientTransactionError`
    /// drives this transition so the caller can retry the whole transaction.
    pub(crate) fn mark_aborted(&mut self) {
        self.end(TransactionState::Aborted);
    }

    /// Surfaces the `TransientTransactionError` label and transitions to `Aborted` when `err`
    /// qualifies, leaving the transaction untouched otherwise (spec.md §4.5, §8 scenario S6).
    pub(crate) fn fail_with(&mut self, err: Error) -> Error {
        if self.in_transaction() && err.is_transient_transaction_error() {
            self.mark_aborted();
            err.with_label(crate::error::TRANSIENT_TRANSACTION_ERROR)
        } else {
            err
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn txn_number_increases_monotonically_across_begins() {
        let mut txn = Transaction::default();
        txn.begin().unwrap();
        assert_eq!(txn.id, 1);
        txn.mark_committed();
        txn.begin().unwrap();
        assert_eq!(txn.id, 2);
    }

    #[test]
    fn begin_while_in_progress_is_rejected() {
        let mut txn = Transaction::default();
        txn.begin().unwrap();
        assert!(txn.begin().is_err());
    }

    #[test]
    fn autocommit_is_omitted_outside_a_transaction() {
        let txn = Transaction::default();
        assert_eq!(txn.autocommit(), None);
    }
}
