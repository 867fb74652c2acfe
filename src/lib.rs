//! This library implements
//! [software transactional memory](https://en.wikipedia.org/wiki/Software_transactional_memory),
//! often abbreviated with STM.
//!
//! It is designed closely to haskells STM library. Read Simon Marlow's
//! *Parallel and Concurrent Programming in Haskell*
//! for more info. Especially the chapter about
//! Performance is also important for using STM in rust.
//!
//! With locks the sequential composition of two
//! two threadsafe actions is no longer threadsafe because
//! other threads may interfer in between of these actions.
//! Applying a third lock to protect both may lead to common sources of errors
//! like deadlocks or race conditions.
//!
//! Unlike locks Software transactional memory is composable.
//! It is typically implemented by writing all read and write
//! operations in a log. When the action has finished and
//! all the used `TVar`s are consistent, the writes are commited as
//! a single atomic operation.
//! Otherwise the computation repeats. This may lead to starvation,
//! but avoids common sources of bugs.
//!
//! Panicing within STM does not poison the `TVar`s. STM ensures consistency by
//! never committing on panic.
//!
//! # Usage
//!
//! You should only use the functions that are transaction-safe.
//! Transaction-safe functions don't have side effects, except those provided by `TVar`.
//! Mutexes and other blocking mechanisms are especially dangerous, because they can
//! interfere with the internal locking scheme of the transaction and therefore
//! cause deadlocks.
//!
//! Note, that Transaction-safety does *not* mean safety in the rust sense, but is a
//! subset of allowed behavior. Even if code is not transaction-safe, no segmentation
//! faults will happen.
//!
//! You can run the top-level atomic operation by calling `atomically`.
//!
//!
//! ```
//! # use fast_stm::atomically;
//! atomically(|trans| {
//!     // some action
//!     // return value as `Result`, for example
//!     Ok(42)
//! });
//! ```
//!
//! Nested calls to `atomically` are not allowed. A run-time check prevents this.
//! Instead of using atomically internally, add a `&mut Transaction` parameter and
//! return `StmResult`.
//!
//! Use ? on `StmResult`, to propagate a transaction error through the system.
//! Do not handle the error yourself.
//!
//! ```
//! # use fast_stm::{atomically, TVar};
//! let var = TVar::new(0);
//!
//! let x = atomically(|trans| {
//!     var.write(trans, 42)?; // Pass failure to parent.
//!     var.read(trans) // Return the value saved in var.
//! });
//!
//! println!("var = {}", x);
//! // var = 42
//!
//! ```
//!
//! # Transaction safety
//!
//! Software transactional memory is completely safe in the rust sense, so
//! undefined behavior will never occur.
//! Still there are multiple rules that
//! you should obey when dealing with software transactional memory.
//!
//! * Don't run code with side effects, especially no IO-code.
//!   Transactions repeat in failure cases. Using IO would repeat this IO-code.
//!   Return a closure if you have to.
//! * Don't handle `StmResult` yourself.
//!   Use `Transaction::or` to combine alternative paths and `optionally` to check if an inner
//!   function has failed. Always use `?` and
//!   never ignore a `StmResult`.
//! * Don't run `atomically` inside of another. `atomically` is designed to have side effects
//!   and will therefore break transaction safety.
//!   Nested calls are detected at runtime and handled with panicking.
//!   When you use STM in the inner of a function, then
//!   express it in the public interface, by taking `&mut Transaction` as parameter and
//!   returning `StmResult<T>`. Callers can safely compose it into
//!   larger blocks.
//! * Don't mix locks and transactions. Your code will easily deadlock or slow
//!   down unpredictably.
//! * Don't use inner mutability to change the content of a `TVar`.
//!
//! Panicking in a transaction is transaction-safe. The transaction aborts and
//! all changes are discarded. No poisoning or half written transactions happen.
//!
//! # Speed
//!
//! Generally keep your atomic blocks as small as possible, because
//! the more time you spend, the more likely it is, to collide with
//! other threads. For STM, reading `TVar`s is quite slow, because it
//! needs to look them up in the log every time.
//! Every used `TVar` increases the chance of collisions. Therefore you should
//! keep the amount of accessed variables as low as needed.
//!

// Extra linting with exceptions
#![warn(clippy::pedantic)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::should_panic_without_expect)]

extern crate parking_lot;

mod id;
mod result;
mod runtime;
mod transaction;
mod tvar;


pub use id::{TxnId, VarId};
pub use result::*;
pub use runtime::{CancelToken, Runtime, RuntimeConfig};
pub use transaction::Transaction;
pub use transaction::TransactionControl;
pub use tvar::TVar;

/// Convert a `TransactionClosureResult<T, E_A>` to `TransactionClosureResult<T, E_B>`.
///
/// This macro is used to cleanly write transactions where multiple kind of errors are
/// possible during execution. The macro will not fail as long as the specified target
/// error `$to` implements `From<E>`, `E` being the error possibly returned by `$op`.
/// It expands to:
///
/// ```ignore
/// $op.map_err(|e| match e {
///         fast_stm::TransactionError::Abort(e) => fast_stm::TransactionError::Abort($to::from(e)),
///         fast_stm::TransactionError::Stm(e) => fast_stm::TransactionError::Stm(e),
///     })?
/// ```
///
/// # Example
///
/// ```rust
/// # use fast_stm::{abort, atomically_with_err, try_or_coerce, FailurePayload, Transaction, TransactionClosureResult};
///
/// struct Error1;
/// struct Error2;
///
/// impl From<Error1> for Error2 {
///     fn from(e: Error1) -> Self {
///         Error2
///     }
/// }
///
/// impl From<FailurePayload> for Error2 {
///     fn from(_: FailurePayload) -> Self {
///         Error2
///     }
/// }
///
/// fn op1(trans: &mut Transaction) -> TransactionClosureResult<(), Error1> {
///     // ...
///     Ok(())
/// }
///
/// fn op2(trans: &mut Transaction) -> TransactionClosureResult<(), Error2> {
///     // ...
///     Ok(())
/// }
///
/// let res: Result<(), Error2> = atomically_with_err(|trans| {
///     try_or_coerce!(op1(trans), Error2);
///     op2(trans)?;   
///     Ok(())
/// });
/// ```
#[macro_export]
macro_rules! try_or_coerce {
    ($op: expr, $to: ident) => {
        $op.map_err(|e| match e {
            $crate::TransactionError::Abort(e) => $crate::TransactionError::Abort($to::from(e)),
            $crate::TransactionError::Stm(e) => $crate::TransactionError::Stm(e),
            $crate::TransactionError::Failed(e) => $crate::TransactionError::Failed(e),
        })?
    };
}

#[inline]
/// Call `abort` to abort a transaction and pass the error as the return value.
///
/// # Examples
///
/// ```
/// # use fast_stm::*;
/// struct MyError;
///
/// impl From<FailurePayload> for MyError {
///     fn from(_: FailurePayload) -> Self {
///         MyError
///     }
/// }
///
/// let execute_once: Result<u32, _> = atomically_with_err(|_| {
///     abort(MyError)
/// });
///
/// assert!(execute_once.is_err());
/// ```
pub fn abort<T, E>(e: E) -> TransactionClosureResult<T, E> {
    Err(TransactionError::Abort(e))
}

#[inline]
/// Call `retry` to abort an operation and run the whole transaction again.
///
/// Semantically `retry` allows spin-lock-like behavior, but the library
/// blocks until one of the used `TVar`s has changed, to keep CPU-usage low.
///
/// `Transaction::or` allows to define alternatives. If the first function
/// wants to retry, then the second one has a chance to run.
///
/// # Examples
///
/// ```no_run
/// # use fast_stm::*;
/// let infinite_retry: i32 = atomically(|_| retry());
/// ```
pub fn retry<T>() -> StmClosureResult<T> {
    Err(StmError::Retry)
}

/// Run a function atomically by using Software Transactional Memory.
/// It calls to `Transaction::with` internally, but is more explicit.
pub fn atomically<T, F>(f: F) -> T
where
    F: Fn(&mut Transaction) -> StmClosureResult<T>,
{
    Transaction::with(f)
}

/// Run a function atomically by using Software Transactional Memory.
/// It calls to `Transaction::with_err` internally, but is more explicit.
///
/// A panic inside `f` is caught and surfaced as `E::from(FailurePayload)`
/// rather than unwinding past this call; see [`FailurePayload`].
pub fn atomically_with_err<T, E, F>(f: F) -> Result<T, E>
where
    F: Fn(&mut Transaction) -> TransactionClosureResult<T, E>,
    E: From<FailurePayload>,
{
    Transaction::with_err(f)
}

/// Run `f` atomically until it commits, aborts, panics, or `token` is
/// cancelled.
///
/// Cancellation never mutates any `TVar`: if `token` fires while an attempt
/// is retry-parked, the attempt unparks, withdraws from every cell it was
/// waiting on, and returns [`Outcome::Cancelled`] without ever reaching
/// `commit`.
///
/// ```
/// # use fast_stm::*;
/// let token = CancelToken::new();
/// token.cancel();
///
/// let var = TVar::new(0);
/// let outcome: Outcome<i32, ()> = commit_cancellable(&token, |tx| {
///     let _ = var.read(tx)?;
///     Err(TransactionError::Stm(StmError::Retry))
/// });
///
/// assert!(matches!(outcome, Outcome::Cancelled));
/// ```
pub fn commit_cancellable<T, E, F>(token: &CancelToken, f: F) -> Outcome<T, E>
where
    F: Fn(&mut Transaction) -> TransactionClosureResult<T, E>,
{
    runtime::GLOBAL.commit_cancellable(token, f)
}

#[inline]
/// Unwrap `Option` or call retry if it is `None`.
///
/// `optionally` is the inverse of `unwrap_or_retry`.
///
/// # Example
///
/// ```
/// # use fast_stm::*;
/// let x = TVar::new(Some(42));
///
/// atomically(|tx| {
///         let inner = unwrap_or_retry(x.read(tx)?)?;
///         assert_eq!(inner, 42); // inner is always 42.
///         Ok(inner)
///     }
/// );
/// ```
pub fn unwrap_or_retry<T>(option: Option<T>) -> StmClosureResult<T> {
    match option {
        Some(x) => Ok(x),
        None => retry(),
    }
}

#[inline]
/// Retry until `cond` is true.
///
/// # Example
///
/// ```
/// # use fast_stm::*;
/// let var = TVar::new(42);
///
/// let x = atomically(|tx| {
///     let v = var.read(tx)?;
///     guard(v==42)?;
///     // v is now always 42.
///     Ok(v)
/// });
/// assert_eq!(x, 42);
/// ```
pub fn guard(cond: bool) -> StmClosureResult<()> {
    if cond {
        Ok(())
    } else {
        retry()
    }
}

#[inline]
/// Optionally run a transaction `f`. If `f` fails with a `retry()`, it does
/// not cancel the whole transaction, but returns `None`.
///
/// Note that `optionally` does not always recover the function, if
/// inconsistencies where found.
///
/// `unwrap_or_retry` is the inverse of `optionally`.
///
/// # Example
///
/// ```
/// # use fast_stm::*;
/// let x:Option<i32> = atomically(|tx|
///     optionally(tx, |_| retry()));
/// assert_eq!(x, None);
/// ```
pub fn optionally<T, F>(tx: &mut Transaction, f: F) -> StmClosureResult<Option<T>>
where
    F: Fn(&mut Transaction) -> StmClosureResult<T>,
{
    tx.or(|t| f(t).map(Some), |_| Ok(None))
}


/// End-to-end scenarios exercising several leaves and combinators together,
/// the way a caller actually composes them.
#[cfg(test)]
mod test_scenarios {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn transfer_between_accounts() {
        let a = TVar::new(100);
        let b = TVar::new(0);

        atomically(|tx| {
            let x = a.read(tx)?;
            a.write(tx, 0)?;
            b.modify(tx, |y| y + x)
        });

        assert_eq!(a.read_atomic(), 0);
        assert_eq!(b.read_atomic(), 100);
    }

    #[test]
    fn abort_leaves_cells_unchanged() {
        #[derive(Debug, PartialEq)]
        struct InsufficientFunds;
        impl From<FailurePayload> for InsufficientFunds {
            fn from(_: FailurePayload) -> Self {
                InsufficientFunds
            }
        }

        let a = TVar::new(100);
        let b = TVar::new(0);

        let result: Result<(), InsufficientFunds> = atomically_with_err(|tx| {
            a.modify(tx, |x| x - 100)?;
            abort(InsufficientFunds)
        });

        assert_eq!(result, Err(InsufficientFunds));
        assert_eq!(a.read_atomic(), 100);
        assert_eq!(b.read_atomic(), 0);
    }

    /// A transaction that can't make progress yet must be re-attempted, not
    /// just blocked forever on its first read.
    #[test]
    fn check_retries_until_condition_holds() {
        let a = TVar::new(100);
        let b = TVar::new(0);
        let attempts = std::sync::atomic::AtomicU32::new(0);

        let ac = a.clone();
        let bc = b.clone();
        let result = test::async_test(
            2000,
            move || {
                atomically(|tx| {
                    attempts.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    let x = ac.read(tx)?;
                    guard(x > 100)?;
                    ac.modify(tx, |y| y - 100)?;
                    bc.modify(tx, |y| y + 100)
                });
                attempts.load(std::sync::atomic::Ordering::SeqCst)
            },
            move || {
                thread::sleep(Duration::from_millis(150));
                atomically(|tx| a.modify(tx, |y| y + 1));
            },
        );

        let tries = result.expect("transaction should eventually commit");
        assert!(tries > 1, "the check body must have run more than once");
    }

    #[test]
    fn or_else_falls_through_to_live_branch() {
        let a = TVar::new(100);

        atomically(|tx| {
            tx.or(
                |tx| {
                    let v = a.read(tx)?;
                    guard(v > 100)?;
                    a.write(tx, v - 100)
                },
                |tx| {
                    let v = a.read(tx)?;
                    guard(v > 50)?;
                    a.write(tx, v - 50)
                },
            )
        });

        assert_eq!(a.read_atomic(), 50);
    }

    #[test]
    fn or_else_reverts_discarded_branch_writes() {
        let a = TVar::new(100);
        let b = TVar::new(100);

        atomically(|tx| {
            tx.or(
                |tx| {
                    b.modify(tx, |y| y - 100)?;
                    retry()
                },
                |tx| {
                    let v = a.read(tx)?;
                    guard(v > 50)?;
                    a.write(tx, v - 50)
                },
            )
        });

        assert_eq!(a.read_atomic(), 50);
        assert_eq!(b.read_atomic(), 100);
    }

    /// `OrElse` with a branch that aborts is terminal: the live second
    /// branch never runs and never commits, even though it would succeed.
    #[test]
    fn or_else_abort_is_terminal_and_skips_other_branch() {
        #[derive(Debug, PartialEq)]
        struct Nope;
        impl From<FailurePayload> for Nope {
            fn from(_: FailurePayload) -> Self {
                Nope
            }
        }

        let a = TVar::new(100);
        let second_ran = std::sync::atomic::AtomicBool::new(false);

        let result: Result<i32, Nope> = atomically_with_err(|tx| {
            tx.or_with_err(
                |tx| {
                    let v = a.read(tx)?;
                    a.write(tx, v + 1)?;
                    abort(Nope)
                },
                |tx| {
                    second_ran.store(true, std::sync::atomic::Ordering::SeqCst);
                    a.read(tx)
                },
            )
        });

        assert_eq!(result, Err(Nope));
        assert!(!second_ran.load(std::sync::atomic::Ordering::SeqCst));
        assert_eq!(a.read_atomic(), 100);
    }

    /// `OrElse` still falls through to the live branch on retry when both
    /// branches are typed with `or_with_err`.
    #[test]
    fn or_with_err_falls_through_on_retry() {
        #[derive(Debug, PartialEq)]
        struct Nope;
        impl From<FailurePayload> for Nope {
            fn from(_: FailurePayload) -> Self {
                Nope
            }
        }

        let a = TVar::new(42);

        let result: Result<i32, Nope> = atomically_with_err(|tx| {
            tx.or_with_err(
                |_tx| Err(TransactionError::Stm(StmError::Retry)),
                |tx| a.read(tx),
            )
        });

        assert_eq!(result, Ok(42));
    }

    /// Two retrying readers of the same cell must both be woken exactly once
    /// by a single writer flipping it.
    #[test]
    fn wake_on_observed_cell_after_concurrent_writers() {
        let a = TVar::new(0);
        let flag = TVar::new(false);

        let (a1, f1) = (a.clone(), flag.clone());
        let t1 = thread::spawn(move || {
            atomically(|tx| {
                let f = f1.read(tx)?;
                guard(f)?;
                a1.modify(tx, |x| x + 1)
            });
        });

        let (a2, f2) = (a.clone(), flag.clone());
        let t2 = thread::spawn(move || {
            atomically(|tx| {
                let f = f2.read(tx)?;
                guard(f)?;
                a2.modify(tx, |x| x + 1)
            });
        });

        thread::sleep(Duration::from_millis(100));
        atomically(|tx| flag.write(tx, true));

        t1.join().unwrap();
        t2.join().unwrap();

        assert_eq!(a.read_atomic(), 2);
    }
}
