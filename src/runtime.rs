//! Process-wide (or test-isolated) home for the id generator and the tuning
//! knobs the executor and wakeup registry pull from.
//!
//! [`GLOBAL`] is used implicitly by the free functions (`atomically`,
//! `TVar::new`, ...). Code that wants a clean, isolated id namespace -- most
//! commonly a test that must not see ids minted by unrelated tests running
//! concurrently -- builds its own [`Runtime`] and goes through its inherent
//! methods instead.

use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub use crate::id::{TxnId, VarId};
use crate::id::IdGenerator;
use crate::result::{FailurePayload, Outcome, StmClosureResult, TransactionClosureResult};
use crate::transaction::{Transaction, TransactionControl};
use crate::tvar::TVar;

/// Tuning knobs shared by every transaction attempt started through a given
/// [`Runtime`].
#[derive(Clone, Copy, Debug)]
pub struct RuntimeConfig {
    /// Upper bound on how long a retry-parked attempt sleeps before
    /// re-checking its control block, so a missed wakeup can't hang a thread
    /// forever. See `transaction::control_block::ControlBlock`.
    pub max_parked_time: Duration,

    /// Initial capacity reserved for a fresh `TVar`'s waiter vector. Cells
    /// that are rarely contended never grow past it; cells that are
    /// frequently retried on can be given a larger hint up front to avoid
    /// repeated reallocation under heavy contention.
    pub waiter_capacity_hint: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            max_parked_time: Duration::from_millis(1000),
            waiter_capacity_hint: 0,
        }
    }
}

/// An isolated id namespace plus the knobs that govern retry behaviour.
///
/// Encapsulating the id counters in a value instead of a bare process-wide
/// singleton means a test (or an embedder running several independent STM
/// worlds in one process) can construct its own `Runtime` and never shares
/// its `TxnId`/`VarId` streams with anyone else's.
pub struct Runtime {
    ids: IdGenerator,
    config: RuntimeConfig,
}

impl Runtime {
    pub const fn new() -> Self {
        Runtime {
            ids: IdGenerator::new(),
            config: RuntimeConfig {
                max_parked_time: Duration::from_millis(1000),
                waiter_capacity_hint: 0,
            },
        }
    }

    pub fn with_config(config: RuntimeConfig) -> Self {
        Runtime {
            ids: IdGenerator::new(),
            config,
        }
    }

    pub fn config(&self) -> RuntimeConfig {
        self.config
    }

    pub(crate) fn next_var_id(&self) -> VarId {
        self.ids.next_var_id()
    }

    pub(crate) fn next_txn_id(&self) -> TxnId {
        self.ids.next_txn_id()
    }

    /// Create a new committed `TVar`, minting its id from this runtime.
    pub fn make_tvar<T>(&self, val: T) -> TVar<T>
    where
        T: Any + Send + Sync + Clone,
    {
        TVar::new_in(self, val)
    }

    /// Run `f` atomically against this runtime's id namespace.
    pub fn atomically<T, F>(&self, f: F) -> T
    where
        F: Fn(&mut Transaction) -> StmClosureResult<T>,
    {
        match Transaction::with_control_in(self, |_| TransactionControl::Retry, f) {
            Some(t) => t,
            None => unreachable!("control never returns Abort above"),
        }
    }

    /// Run `f` atomically against this runtime's id namespace, surfacing
    /// aborts and host-level failures (see [`FailurePayload`]) as `E`.
    pub fn atomically_with_err<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: Fn(&mut Transaction) -> TransactionClosureResult<T, E>,
        E: From<FailurePayload>,
    {
        Transaction::with_err_in(self, f)
    }

    /// Run `f` atomically against this runtime's id namespace until it
    /// commits, aborts, panics, or `token` is cancelled.
    pub fn commit_cancellable<T, E, F>(&self, token: &CancelToken, f: F) -> Outcome<T, E>
    where
        F: Fn(&mut Transaction) -> TransactionClosureResult<T, E>,
    {
        Transaction::with_cancel_in(self, token, f)
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

/// The implicit [`Runtime`] backing the crate's free functions (`atomically`,
/// `TVar::new`, ...).
pub(crate) static GLOBAL: Runtime = Runtime::new();

/// Cooperative cancellation handle for a long-running or retry-parked
/// transaction attempt.
///
/// Cancelling a token never mutates any `TVar`. By the time
/// `Transaction::with_cancel` returns `Cancelled`, every waiter the attempt
/// installed has been removed from every cell it was parked on, and
/// cancelling the same token twice is harmless.
#[derive(Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        CancelToken(Arc::new(AtomicBool::new(false)))
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn isolated_runtimes_have_independent_id_streams() {
        let a = Runtime::new();
        let b = Runtime::new();

        let ta = a.make_tvar(1);
        let tb = b.make_tvar(1);

        // Both runtimes mint their first VarId as 1, independently of
        // GLOBAL and of each other; nothing aliases across them.
        assert_eq!(ta.read_atomic(), 1);
        assert_eq!(tb.read_atomic(), 1);
    }

    #[test]
    fn cancel_token_is_idempotent() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        token.cancel();
        token.cancel();
        assert!(token.is_cancelled());
    }
}
