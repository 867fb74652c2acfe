use std::any::Any;

#[derive(Eq, PartialEq, Clone, Copy, Debug, thiserror::Error)]
pub enum StmError {
    /// The call failed, because a variable, the computation
    /// depends on, has changed.
    #[error("Transaction failure signal")]
    Failure,

    /// `retry` was called.
    ///
    /// It may block until at least one read variable has changed.
    #[error("Transaction retry signal")]
    Retry,
}

/// `StmResult` is a result of a single step of a STM calculation.
///
/// It informs of success or the type of failure. Normally you should not use
/// it directly. Especially recovering from an error, e.g. by using `action1.or(action2)`
/// can break the semantics of stm, and cause delayed wakeups or deadlocks.
///
/// For the later case, there is the `transaction.or(action1, action2)`, that
/// is safe to use.
pub type StmResult<T> = Result<T, StmError>;

/// Alias kept around for call sites that read better spelled out in full;
/// identical to [`StmResult`].
pub type StmClosureResult<T> = StmResult<T>;

/// Payload carried by a transaction body that panicked instead of returning
/// `Err(Abort(e))`.
///
/// The executor never lets a panic escape with a half-applied log: it is
/// caught with `std::panic::catch_unwind`, the log is discarded exactly as
/// on any other non-commit outcome, and the payload is downcast to a message
/// on a best-effort basis so it can be logged or converted into a caller's
/// own error type.
#[derive(Clone, Debug, thiserror::Error)]
#[error("transaction body panicked: {0}")]
pub struct FailurePayload(String);

impl FailurePayload {
    pub(crate) fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| (*s).to_owned())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "transaction body panicked with a non-string payload".to_owned());
        FailurePayload(message)
    }

    pub fn message(&self) -> &str {
        &self.0
    }
}

/// Result of a transaction with failure potential.
///
/// `Stm(Retry)` never escapes the executor: it is recovered internally by
/// parking on the read set and re-running the attempt. `Abort` and `Failed`
/// are the two terminal, non-commit outcomes that do reach the caller --
/// kept as distinct variants here even though most callers (see
/// [`crate::atomically_with_err`]) collapse them back into a single error
/// type, so diagnostics can still tell a user-requested abort from a host
/// error that escaped a transaction body.
#[derive(Clone, Debug, thiserror::Error)]
pub enum TransactionError<E> {
    /// Failed due to [`StmError`].
    #[error("transaction must retry: {0}")]
    Stm(#[from] StmError),

    /// `abort` was called.
    ///
    /// The transaction will be aborted and the error returned.
    #[error("transaction aborted")]
    Abort(E),

    /// A user function inside the transaction body panicked.
    #[error("transaction failed: {0}")]
    Failed(FailurePayload),
}

/// Result of a transaction with failure potential.
pub type TransactionResult<T, E> = Result<T, TransactionError<E>>;

/// Alias kept around for call sites that read better spelled out in full;
/// identical to [`TransactionResult`].
pub type TransactionClosureResult<T, E> = TransactionResult<T, E>;

/// The four ways a cancellable, typed-error attempt (see
/// `Transaction::with_control_and_err` / `Transaction::with_cancel`) can end.
///
/// `Aborted` and `Failed` mirror [`TransactionError::Abort`] /
/// [`TransactionError::Failed`]; `GivenUp` is reached only when a caller's
/// own `control` callback chooses to stop retrying, and `Cancelled` only
/// when an external [`crate::CancelToken`] fires. None of the four mutate
/// any `TVar`.
#[derive(Clone, Debug)]
pub enum Outcome<T, E> {
    Committed(T),
    Aborted(E),
    Failed(FailurePayload),
    GivenUp,
    Cancelled,
}
