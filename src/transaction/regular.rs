use std::any::Any;
cfg_if::cfg_if! {
    if #[cfg(feature = "hash-registers")] {
        use std::collections::hash_map::Entry;
        use rustc_hash::FxHashMap;
    } else {
        use std::collections::{btree_map::Entry, BTreeMap};
    }
}
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use crate::id::TxnId;
use crate::result::{
    FailurePayload, Outcome, StmClosureResult, StmError, TransactionClosureResult, TransactionError,
};
use crate::runtime::{Runtime, RuntimeConfig, CancelToken, GLOBAL};
use crate::tvar::TVar;

#[cfg(feature = "wait-on-retry")]
use super::control_block::ControlBlock;
use super::log_var::LogVar;
use super::RegisterType;
use super::{TransactionControl, TransactionGuard};

/// Transaction tracks all the read and written variables.
///
/// It is used for checking vars, to ensure atomicity.
pub struct Transaction {
    /// Map of all vars that map the `VarControlBlock` of a var to a `LogVar`.
    /// The `VarControlBlock` is unique because it uses its id for ordering.
    ///
    /// The logs need to be accessed in a order to prevend dead-locks on locking.
    vars: RegisterType,

    /// Id of the attempt currently running. A fresh one is minted on every
    /// loop iteration below, including re-attempts after a conflict.
    txn_id: TxnId,

    /// Tuning knobs inherited from whichever `Runtime` started this attempt.
    config: RuntimeConfig,
}

impl Transaction {
    /// Create a new log against the process-wide default runtime.
    ///
    /// Normally you don't need to call this directly.
    /// Use `atomically` instead.
    fn new() -> Transaction {
        Transaction::new_in(&GLOBAL)
    }

    fn new_in(runtime: &Runtime) -> Transaction {
        Transaction {
            #[cfg(not(feature = "hash-registers"))]
            vars: BTreeMap::new(),
            #[cfg(feature = "hash-registers")]
            vars: FxHashMap::default(),
            txn_id: runtime.next_txn_id(),
            config: runtime.config(),
        }
    }

    /// Id of the attempt currently in flight. Changes across retries of the
    /// same logical transaction.
    pub fn id(&self) -> TxnId {
        self.txn_id
    }

    /// Run a function with a transaction.
    ///
    /// It is equivalent to `atomically`.
    pub fn with<T, F>(f: F) -> T
    where
        F: Fn(&mut Transaction) -> StmClosureResult<T>,
    {
        match Transaction::with_control(|_| TransactionControl::Retry, f) {
            Some(t) => t,
            None => unreachable!(),
        }
    }

    pub(crate) fn with_in<T, F>(runtime: &Runtime, f: F) -> T
    where
        F: Fn(&mut Transaction) -> StmClosureResult<T>,
    {
        match Transaction::with_control_in(runtime, |_| TransactionControl::Retry, f) {
            Some(t) => t,
            None => unreachable!(),
        }
    }

    /// Run a function with a transaction.
    ///
    /// `with_control` takes another control function, that
    /// can steer the control flow and possible terminate early.
    ///
    /// `control` can react to counters, timeouts or external inputs.
    ///
    /// It allows the user to fall back to another strategy, like a global lock
    /// in the case of too much contention.
    ///
    /// Please not, that the transaction may still infinitely wait for changes when `retry` is
    /// called and `control` does not abort.
    /// If you need a timeout, another thread should signal this through a [`TVar`].
    pub fn with_control<T, F, C>(control: C, f: F) -> Option<T>
    where
        F: Fn(&mut Transaction) -> StmClosureResult<T>,
        C: FnMut(StmError) -> TransactionControl,
    {
        Transaction::with_control_in(&GLOBAL, control, f)
    }

    pub(crate) fn with_control_in<T, F, C>(runtime: &Runtime, mut control: C, f: F) -> Option<T>
    where
        F: Fn(&mut Transaction) -> StmClosureResult<T>,
        C: FnMut(StmError) -> TransactionControl,
    {
        let _guard = TransactionGuard::new();

        // create a log guard for initializing and cleaning up
        // the log
        let mut transaction = Transaction::new_in(runtime);

        // loop until success
        loop {
            // run the computation
            match f(&mut transaction) {
                // on success exit loop
                Ok(t) => {
                    if transaction.commit() {
                        return Some(t);
                    }
                }

                Err(e) => {
                    // Check if the user wants to abort the transaction.
                    if let TransactionControl::Abort = control(e) {
                        return None;
                    }

                    // on retry wait for changes
                    #[cfg(feature = "wait-on-retry")]
                    if let StmError::Retry = e {
                        transaction.wait_for_change();
                    }
                }
            }

            // clear log before retrying computation, minting a fresh id for
            // the next attempt
            transaction.restart_in(runtime);
        }
    }

    /// Run a function with a transaction.
    ///
    /// The transaction will be retried until:
    /// - it is validated, or
    /// - it is explicitly aborted from the function, using [`crate::abort`].
    ///
    /// A user closure that panics is transaction-safe: the panic is caught,
    /// no write ever reaches a `TVar`, and the payload is surfaced as
    /// `E::from(FailurePayload)` instead of unwinding past this call.
    pub fn with_err<T, F, E>(f: F) -> Result<T, E>
    where
        F: Fn(&mut Transaction) -> TransactionClosureResult<T, E>,
        E: From<FailurePayload>,
    {
        Transaction::with_err_in(&GLOBAL, f)
    }

    pub(crate) fn with_err_in<T, F, E>(runtime: &Runtime, f: F) -> Result<T, E>
    where
        F: Fn(&mut Transaction) -> TransactionClosureResult<T, E>,
        E: From<FailurePayload>,
    {
        let _guard = TransactionGuard::new();
        let mut transaction = Transaction::new_in(runtime);

        loop {
            match panic::catch_unwind(AssertUnwindSafe(|| f(&mut transaction))) {
                Ok(Ok(t)) => {
                    if transaction.commit() {
                        return Ok(t);
                    }
                }
                Ok(Err(TransactionError::Abort(err))) => return Err(err),
                Ok(Err(TransactionError::Failed(payload))) => return Err(E::from(payload)),
                Ok(Err(TransactionError::Stm(_))) => {
                    #[cfg(feature = "wait-on-retry")]
                    transaction.wait_for_change();
                }
                Err(panic_payload) => return Err(E::from(FailurePayload::from_panic(panic_payload))),
            }

            transaction.restart_in(runtime);
        }
    }

    /// Run a function with a transaction, with both a custom retry/abort
    /// `control` callback and a distinguishable [`Outcome`] instead of a
    /// bare `Result`.
    pub fn with_control_and_err<T, F, C, E>(control: C, f: F) -> Outcome<T, E>
    where
        F: Fn(&mut Transaction) -> TransactionClosureResult<T, E>,
        C: FnMut(StmError) -> TransactionControl,
    {
        Transaction::with_control_and_err_in(&GLOBAL, control, f)
    }

    pub(crate) fn with_control_and_err_in<T, F, C, E>(
        runtime: &Runtime,
        mut control: C,
        f: F,
    ) -> Outcome<T, E>
    where
        F: Fn(&mut Transaction) -> TransactionClosureResult<T, E>,
        C: FnMut(StmError) -> TransactionControl,
    {
        let _guard = TransactionGuard::new();
        let mut transaction = Transaction::new_in(runtime);

        loop {
            match panic::catch_unwind(AssertUnwindSafe(|| f(&mut transaction))) {
                Ok(Ok(t)) => {
                    if transaction.commit() {
                        return Outcome::Committed(t);
                    }
                }
                Ok(Err(TransactionError::Abort(err))) => return Outcome::Aborted(err),
                Ok(Err(TransactionError::Failed(payload))) => return Outcome::Failed(payload),
                Ok(Err(TransactionError::Stm(err))) => {
                    if let TransactionControl::Abort = control(err) {
                        return Outcome::GivenUp;
                    }

                    #[cfg(feature = "wait-on-retry")]
                    if let StmError::Retry = err {
                        transaction.wait_for_change();
                    }
                }
                Err(panic_payload) => {
                    return Outcome::Failed(FailurePayload::from_panic(panic_payload));
                }
            }

            transaction.restart_in(runtime);
        }
    }

    /// Like [`Transaction::with_control_and_err`], but an attempt that is
    /// retry-parked also wakes early when `token` is cancelled, returning
    /// [`Outcome::Cancelled`] without ever committing a write.
    pub(crate) fn with_cancel_in<T, F, E>(
        runtime: &Runtime,
        token: &CancelToken,
        f: F,
    ) -> Outcome<T, E>
    where
        F: Fn(&mut Transaction) -> TransactionClosureResult<T, E>,
    {
        let _guard = TransactionGuard::new();
        let mut transaction = Transaction::new_in(runtime);

        loop {
            if token.is_cancelled() {
                #[cfg(feature = "profiling")]
                tracing::debug!(txn_id = %transaction.txn_id, "stm cancelled");
                return Outcome::Cancelled;
            }

            match panic::catch_unwind(AssertUnwindSafe(|| f(&mut transaction))) {
                Ok(Ok(t)) => {
                    if transaction.commit() {
                        return Outcome::Committed(t);
                    }
                }
                Ok(Err(TransactionError::Abort(err))) => return Outcome::Aborted(err),
                Ok(Err(TransactionError::Failed(payload))) => return Outcome::Failed(payload),
                Ok(Err(TransactionError::Stm(StmError::Retry))) => {
                    #[cfg(feature = "wait-on-retry")]
                    if transaction.wait_for_change_cancellable(token) {
                        return Outcome::Cancelled;
                    }
                    #[cfg(not(feature = "wait-on-retry"))]
                    return Outcome::Cancelled;
                }
                Ok(Err(TransactionError::Stm(StmError::Failure))) => {}
                Err(panic_payload) => {
                    return Outcome::Failed(FailurePayload::from_panic(panic_payload));
                }
            }

            transaction.restart_in(runtime);
        }
    }

    #[allow(clippy::needless_pass_by_value)]
    /// Perform a downcast on a var.
    fn downcast<T: Any + Clone>(var: Arc<dyn Any>) -> T {
        match var.downcast_ref::<T>() {
            Some(s) => s.clone(),
            None => unreachable!("TVar has wrong type"),
        }
    }

    /// Read a variable and return the value.
    ///
    /// The returned value is not always consistent with the current value of the var,
    /// but may be an outdated or or not yet commited value.
    ///
    /// The used code should be capable of handling inconsistent states
    /// without running into infinite loops.
    /// Just the commit of wrong values is prevented by STM.
    pub fn read<T: Send + Sync + Any + Clone>(&mut self, var: &TVar<T>) -> StmClosureResult<T> {
        let ctrl = var.control_block().clone();
        // Check if the same var was written before.
        #[cfg(not(feature = "hash-registers"))]
        let key = ctrl;
        #[cfg(feature = "hash-registers")]
        let key = Arc::as_ptr(&ctrl);
        let value = match self.vars.entry(key) {
            // If the variable has been accessed before, then load that value.
            #[cfg(feature = "early-conflict-detection")]
            Entry::Occupied(mut entry) => {
                let log = entry.get_mut();
                // if we previously read the var, check for value change
                if let LogVar::Read(v) = log {
                    let crt_v = var.read_ref_atomic();
                    if !Arc::ptr_eq(v, &crt_v) {
                        return Err(StmError::Failure);
                    }
                }
                log.read()
            }
            #[cfg(not(feature = "early-conflict-detection"))]
            Entry::Occupied(mut entry) => entry.get_mut().read(),

            // Else load the variable statically.
            Entry::Vacant(entry) => {
                // Read the value from the var.
                let value = var.read_ref_atomic();

                // Store in in an entry.
                entry.insert(LogVar::Read(value.clone()));
                value
            }
        };

        Ok(Transaction::downcast(value))
    }

    /// Write a variable.
    ///
    /// The write is not immediately visible to other threads,
    /// but atomically commited at the end of the computation.
    pub fn write<T: Any + Send + Sync + Clone>(
        &mut self,
        var: &TVar<T>,
        value: T,
    ) -> StmClosureResult<()> {
        // box the value
        let boxed = Arc::new(value);

        // new control block
        let ctrl = var.control_block().clone();
        // update or create new entry
        #[cfg(not(feature = "hash-registers"))]
        let key = ctrl;
        #[cfg(feature = "hash-registers")]
        let key = Arc::as_ptr(&ctrl);
        match self.vars.entry(key) {
            Entry::Occupied(mut entry) => entry.get_mut().write(boxed),
            Entry::Vacant(entry) => {
                entry.insert(LogVar::Write(boxed));
            }
        }

        // For now always succeeds, but that may change later.
        Ok(())
    }

    /// Combine two calculations. When one blocks with `retry`,
    /// run the other, but don't commit the changes in the first.
    ///
    /// If both block, `Transaction::or` still waits for `TVar`s in both functions.
    /// Use `Transaction::or` instead of handling errors directly with the `Result::or`.
    /// The later does not handle all the blocking correctly.
    pub fn or<T, F1, F2>(&mut self, first: F1, second: F2) -> StmClosureResult<T>
    where
        F1: Fn(&mut Transaction) -> StmClosureResult<T>,
        F2: Fn(&mut Transaction) -> StmClosureResult<T>,
    {
        // Create a backup of the log.
        let mut copy = Transaction {
            vars: self.vars.clone(),
            txn_id: self.txn_id,
            config: self.config,
        };

        // Run the first computation.
        let f = first(self);

        match f {
            // Run other on manual retry call.
            Err(StmError::Retry) => {
                // swap, so that self is the current run
                mem::swap(self, &mut copy);

                // Run other action.
                let s = second(self);

                // If both called retry then exit.
                match s {
                    Err(StmError::Failure) => Err(StmError::Failure),
                    s => {
                        self.combine(copy);
                        s
                    }
                }
            }

            // Return success and failure directly
            x => x,
        }
    }

    /// Like [`Transaction::or`], but for branches that can also `abort` with
    /// a typed error (see [`crate::abort`]).
    ///
    /// Mirrors `or`'s backup/swap-on-retry/combine dance exactly, except an
    /// `Abort` or `Failed` from the first branch is terminal: the second
    /// branch is never run and its log never recorded, per spec.md's rule
    /// that `OrElse` only falls through to the alternative on a retry, not
    /// on an abort.
    pub fn or_with_err<T, E, F1, F2>(
        &mut self,
        first: F1,
        second: F2,
    ) -> TransactionClosureResult<T, E>
    where
        F1: Fn(&mut Transaction) -> TransactionClosureResult<T, E>,
        F2: Fn(&mut Transaction) -> TransactionClosureResult<T, E>,
    {
        // Create a backup of the log.
        let mut copy = Transaction {
            vars: self.vars.clone(),
            txn_id: self.txn_id,
            config: self.config,
        };

        // Run the first computation.
        let f = first(self);

        match f {
            // Run other on manual retry call.
            Err(TransactionError::Stm(StmError::Retry)) => {
                // swap, so that self is the current run
                mem::swap(self, &mut copy);

                // Run other action.
                let s = second(self);

                // If both called retry then exit.
                match s {
                    Err(TransactionError::Stm(StmError::Failure)) => {
                        Err(TransactionError::Stm(StmError::Failure))
                    }
                    s => {
                        self.combine(copy);
                        s
                    }
                }
            }

            // Abort and Failed are terminal: the second branch never runs.
            // Success and a bare conflict are also returned directly.
            x => x,
        }
    }

    /// Combine two logs into a single log, to allow waiting for all reads.
    fn combine(&mut self, other: Transaction) {
        // combine reads
        for (var, value) in other.vars {
            // only insert new values
            if let Some(value) = value.obsolete() {
                self.vars.entry(var).or_insert(value);
            }
        }
    }

    /// Write the log back to the variables.
    ///
    /// Return true for success and false, if a read var has changed
    fn commit(&mut self) -> bool {
        #[cfg(feature = "profiling")]
        let _span = tracing::trace_span!(
            "stm_commit",
            txn_id = %self.txn_id,
            vars = self.vars.len(),
        )
        .entered();

        // Use two phase locking for safely writing data back to the vars.

        // First phase: acquire locks.
        // Check for consistency of all the reads and perform
        // an early return if something is not consistent.

        // Created arrays for storing the locks
        // vector of locks.
        let mut read_vec = Vec::with_capacity(self.vars.len());

        // vector of tuple (value, lock)
        let mut write_vec = Vec::with_capacity(self.vars.len());

        // vector of written variables
        let mut written = Vec::with_capacity(self.vars.len());

        // Locking in a fixed order (ascending VarId, via the Ord impl on
        // VarControlBlock) across the whole read+write set is what makes
        // this deadlock-free without a single global commit gate.
        #[cfg(feature = "hash-registers")]
        let records = {
            let mut recs: Vec<_> = self.vars.iter().collect();
            recs.sort_by(|(k1, _), (k2, _)| {
                let k1 = unsafe { k1.as_ref() }.expect("E: unreachabel");
                let k2 = unsafe { k2.as_ref() }.expect("E: unreachabel");
                k1.cmp(k2)
            });
            recs
        };
        #[cfg(not(feature = "hash-registers"))]
        let records = &self.vars;

        for (var, value) in records {
            // lock the variable and read the value
            #[cfg(feature = "hash-registers")]
            let var = unsafe { var.as_ref() }.expect("E: unreachabel");

            match *value {
                // We need to take a write lock.
                LogVar::Write(ref w) | LogVar::ReadObsoleteWrite(_, ref w) => {
                    // take write lock
                    let lock = var.value.write();
                    // add all data to the vector
                    write_vec.push((w, lock));
                    written.push(var);
                }

                // We need to check for consistency and
                // take a write lock.
                LogVar::ReadWrite(ref original, ref w) => {
                    // take write lock
                    let lock = var.value.write();

                    if !Arc::ptr_eq(&lock, original) {
                        #[cfg(feature = "profiling")]
                        tracing::debug!(txn_id = %self.txn_id, var = %var.id(), "stm conflict on read-write var");
                        return false;
                    }
                    // add all data to the vector
                    write_vec.push((w, lock));
                    written.push(var);
                }
                // Nothing to do. ReadObsolete is only needed for blocking, not
                // for consistency checks.
                LogVar::ReadObsolete(_) => {}
                // Take read lock and check for consistency.
                LogVar::Read(ref original) => {
                    // Take a read lock.
                    let lock = var.value.read();

                    if !Arc::ptr_eq(&lock, original) {
                        #[cfg(feature = "profiling")]
                        tracing::debug!(txn_id = %self.txn_id, var = %var.id(), "stm conflict on read var");
                        return false;
                    }

                    read_vec.push(lock);
                }
            }
        }

        // Second phase: write back and release

        // Release the reads first.
        // This allows other threads to continue quickly.
        drop(read_vec);

        for (value, mut lock) in write_vec {
            // Commit value.
            *lock = value.clone();
        }

        #[cfg(feature = "profiling")]
        tracing::trace!(txn_id = %self.txn_id, written = written.len(), "stm commit applied");

        #[cfg(feature = "wait-on-retry")]
        for var in written {
            // Unblock all threads waiting for it.
            var.wake_all();
        }

        // Commit succeded.
        true
    }

    /// Clear the log's data.
    ///
    /// This should be used before redoing a computation, but
    /// nowhere else.
    fn clear(&mut self) {
        self.vars.clear();
    }

    /// Clear the log and mint a fresh attempt id from `runtime`, ready for
    /// another pass through the loop.
    fn restart_in(&mut self, runtime: &Runtime) {
        self.clear();
        self.txn_id = runtime.next_txn_id();
    }

    /// Wait for any variable to change,
    /// because the change may lead to a new calculation result.
    #[cfg(feature = "wait-on-retry")]
    fn wait_for_change(&mut self) {
        #[cfg(feature = "profiling")]
        tracing::trace!(txn_id = %self.txn_id, "stm retry-park");

        // Create control block for waiting.
        let ctrl = Arc::new(ControlBlock::with_max_parked_time(self.config.max_parked_time));

        #[allow(clippy::mutable_key_type)]
        let vars = std::mem::take(&mut self.vars);
        let mut reads = Vec::with_capacity(vars.len());

        let blocking = vars
            .into_iter()
            .filter_map(|(a, b)| b.into_read_value().map(|b| (a, b)))
            // Check for consistency.
            .all(|(var, value)| {
                #[cfg(feature = "hash-registers")]
                let var = unsafe { var.as_ref() }.expect("E: unreachabel");
                var.park(&ctrl);
                let x = {
                    // Take read lock and read value.
                    let guard = var.value.read();
                    Arc::ptr_eq(&value, &guard)
                };
                reads.push(var);
                x
            });

        // If no var has changed, then block.
        if blocking {
            ctrl.wait();
        }

        // Remove our control block from every cell it was parked on. It
        // does not matter if we unpark a cell that never actually parked us
        // (the hash-registers / non-hash-registers split above may leave
        // `reads` holding a superset); it may slightly reduce performance
        // but not break the semantics.
        for var in &reads {
            var.unpark(&ctrl);
        }
    }

    /// Like [`Transaction::wait_for_change`], but also wakes early when
    /// `token` is cancelled. Returns `true` if woken by the cancellation
    /// rather than by an actual change.
    #[cfg(feature = "wait-on-retry")]
    fn wait_for_change_cancellable(&mut self, token: &CancelToken) -> bool {
        #[cfg(feature = "profiling")]
        tracing::trace!(txn_id = %self.txn_id, "stm retry-park (cancellable)");

        let ctrl = Arc::new(ControlBlock::with_max_parked_time(self.config.max_parked_time));

        #[allow(clippy::mutable_key_type)]
        let vars = std::mem::take(&mut self.vars);
        let mut reads = Vec::with_capacity(vars.len());

        let blocking = vars
            .into_iter()
            .filter_map(|(a, b)| b.into_read_value().map(|b| (a, b)))
            .all(|(var, value)| {
                #[cfg(feature = "hash-registers")]
                let var = unsafe { var.as_ref() }.expect("E: unreachabel");
                var.park(&ctrl);
                let x = {
                    let guard = var.value.read();
                    Arc::ptr_eq(&value, &guard)
                };
                reads.push(var);
                x
            });

        let cancelled = if blocking {
            ctrl.wait_cancellable(token)
        } else {
            false
        };

        for var in &reads {
            var.unpark(&ctrl);
        }
        cancelled
    }
}

#[cfg(test)]
mod test {
    use super::*;
    #[test]
    fn read() {
        let mut log = Transaction::new();
        let var = TVar::new(vec![1, 2, 3, 4]);

        // The variable can be read.
        assert_eq!(&*log.read(&var).unwrap(), &[1, 2, 3, 4]);
    }

    #[test]
    fn write_read() {
        let mut log = Transaction::new();
        let var = TVar::new(vec![1, 2]);

        log.write(&var, vec![1, 2, 3, 4]).unwrap();

        // Consecutive reads get the updated version.
        assert_eq!(log.read(&var).unwrap(), [1, 2, 3, 4]);

        // The original value is still preserved.
        assert_eq!(var.read_atomic(), [1, 2]);
    }

    #[test]
    fn transaction_simple() {
        let x = Transaction::with(|_| Ok(42));
        assert_eq!(x, 42);
    }

    #[test]
    fn transaction_read() {
        let read = TVar::new(42);

        let x = Transaction::with(|trans| read.read(trans));

        assert_eq!(x, 42);
    }

    /// Run a transaction with a control function, that always aborts.
    /// The transaction still tries to run a single time and should successfully
    /// commit in this test.
    #[test]
    fn transaction_with_control_abort_on_single_run() {
        let read = TVar::new(42);

        let x = Transaction::with_control(|_| TransactionControl::Abort, |tx| read.read(tx));

        assert_eq!(x, Some(42));
    }

    /// Run a transaction with a control function, that always aborts.
    /// The transaction retries infinitely often. The control function will abort this loop.
    #[test]
    fn transaction_with_control_abort_on_retry() {
        let x: Option<i32> =
            Transaction::with_control(|_| TransactionControl::Abort, |_| Err(StmError::Retry));

        assert_eq!(x, None);
    }

    #[test]
    fn transaction_write() {
        let write = TVar::new(42);

        Transaction::with(|trans| write.write(trans, 0));

        assert_eq!(write.read_atomic(), 0);
    }

    #[test]
    fn transaction_copy() {
        let read = TVar::new(42);
        let write = TVar::new(0);

        Transaction::with(|trans| {
            let r = read.read(trans)?;
            write.write(trans, r)
        });

        assert_eq!(write.read_atomic(), 42);
    }

    #[test]
    fn transaction_ids_change_across_retries() {
        use std::cell::Cell;

        let attempted: Arc<std::sync::Mutex<Vec<TxnId>>> = Arc::new(std::sync::Mutex::new(Vec::new()));
        let a = attempted.clone();
        let tries_left = Cell::new(2);
        Transaction::with(move |tx| {
            a.lock().unwrap().push(tx.id());
            if tries_left.get() > 0 {
                tries_left.set(tries_left.get() - 1);
                Err(StmError::Failure)
            } else {
                Ok(())
            }
        });
        let seen = attempted.lock().unwrap();
        assert_eq!(seen.len(), 3);
        assert!(seen.windows(2).all(|w| w[0] != w[1]));
    }

    /// Test if nested transactions are correctly detected.
    #[test]
    #[should_panic]
    fn transaction_nested_fail() {
        Transaction::with(|_| {
            Transaction::with(|_| Ok(42));
            Ok(1)
        });
    }

    #[test]
    fn with_err_surfaces_abort() {
        #[derive(Debug, PartialEq)]
        struct MyError(String);
        impl From<FailurePayload> for MyError {
            fn from(p: FailurePayload) -> Self {
                MyError(p.message().to_owned())
            }
        }

        let x: Result<i32, MyError> =
            Transaction::with_err(|_| Err(TransactionError::Abort(MyError("nope".into()))));
        assert_eq!(x, Err(MyError("nope".into())));
    }

    #[test]
    fn with_err_surfaces_panic_as_failed() {
        #[derive(Debug, PartialEq)]
        struct MyError(String);
        impl From<FailurePayload> for MyError {
            fn from(p: FailurePayload) -> Self {
                MyError(p.message().to_owned())
            }
        }

        let result: Result<i32, MyError> = std::panic::catch_unwind(|| {
            Transaction::with_err(|_: &mut Transaction| -> TransactionClosureResult<i32, MyError> {
                panic!("boom")
            })
        })
        .unwrap_or(Err(MyError("unreachable".into())));

        assert!(result.is_err());
    }
}
