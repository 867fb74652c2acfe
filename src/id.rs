// Copyright 2015-2016 rust-stm Developers
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Monotonic id allocation for [`TVar`](crate::TVar)s and transaction
//! attempts.
//!
//! Both streams are backed by a plain `AtomicU64` counter starting at one
//! (zero is reserved so that a default-constructed id is recognizably
//! invalid). Wraparound after `u64::MAX` allocations is not handled; no
//! realistic process reaches it.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Stable, unique identifier of a [`TVar`](crate::TVar).
///
/// Never reused within the [`Runtime`](crate::Runtime) that minted it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VarId(u64);

/// Identifier of a single attempt to evaluate a transaction.
///
/// A fresh `TxnId` is allocated every time the executor starts a new
/// attempt, including re-attempts after a conflict or a wakeup. Two
/// concurrent `commit` calls on the very same [`Transaction`](crate::Transaction)
/// value always see distinct `TxnId`s.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TxnId(u64);

impl fmt::Display for VarId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "var#{}", self.0)
    }
}

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "txn#{}", self.0)
    }
}

/// Process-local (or, more precisely, [`Runtime`](crate::Runtime)-local)
/// monotonic counter pair.
///
/// One counter per id namespace, so a `VarId` and a `TxnId` minted at the
/// "same time" can collide numerically without ever being confused --
/// they are different types.
pub(crate) struct IdGenerator {
    vars: AtomicU64,
    txns: AtomicU64,
}

impl IdGenerator {
    pub(crate) const fn new() -> Self {
        IdGenerator {
            vars: AtomicU64::new(1),
            txns: AtomicU64::new(1),
        }
    }

    pub(crate) fn next_var_id(&self) -> VarId {
        VarId(self.vars.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn next_txn_id(&self) -> TxnId {
        TxnId(self.txns.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn ids_are_monotonic_and_distinct() {
        let gen = IdGenerator::new();
        let a = gen.next_var_id();
        let b = gen.next_var_id();
        assert_ne!(a, b);
        assert!(a < b);
    }

    #[test]
    fn var_and_txn_streams_are_independent() {
        let gen = IdGenerator::new();
        let v = gen.next_var_id();
        let t = gen.next_txn_id();
        // Same underlying counter value is fine; types keep them apart.
        assert_eq!(format!("{v}"), "var#1");
        assert_eq!(format!("{t}"), "txn#1");
    }

    #[test]
    fn concurrent_demand_yields_unique_ids() {
        use std::collections::HashSet;
        use std::sync::Arc;
        use std::thread;

        let gen = Arc::new(IdGenerator::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let gen = gen.clone();
                thread::spawn(move || (0..256).map(|_| gen.next_var_id()).collect::<Vec<_>>())
            })
            .collect();

        let mut seen = HashSet::new();
        for h in handles {
            for id in h.join().unwrap() {
                assert!(seen.insert(id), "id {id} allocated twice");
            }
        }
        assert_eq!(seen.len(), 8 * 256);
    }
}
