//! Round-robin selection over a fixed set of upstream service accounts.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::Result;

/// A fixed, non-empty, cyclically visited list of accounts.
///
/// Cloning is cheap and clones share the cursor, so every handler of a
/// transport draws from the same rotation.
#[derive(Debug)]
pub struct AccountPool<A> {
    inner: Arc<PoolInner<A>>,
}

#[derive(Debug)]
struct PoolInner<A> {
    accounts: Box<[A]>,
    cursor: AtomicUsize,
}

impl<A> Clone for AccountPool<A> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<A> AccountPool<A> {
    pub fn new(accounts: Vec<A>) -> Result<Self> {
        anyhow::ensure!(!accounts.is_empty(), "account pool must not be empty");
        Ok(Self {
            inner: Arc::new(PoolInner {
                accounts: accounts.into_boxed_slice(),
                cursor: AtomicUsize::new(0),
            }),
        })
    }

    /// Next account in strict rotation, wrapping to the first after the last.
    pub fn next(&self) -> &A {
        let n = self.inner.cursor.fetch_add(1, Ordering::Relaxed);
        &self.inner.accounts[n % self.inner.accounts.len()]
    }

    /// Number of draws so far.
    pub fn position(&self) -> usize {
        self.inner.cursor.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.inner.accounts.len()
    }
}
