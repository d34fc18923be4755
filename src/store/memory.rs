//! In-memory reference implementation of [`LeaseStore`].
//!
//! Strongly consistent and linearizable: every operation takes the table
//! lock, so conditional writes are atomic check-and-swap. Used by the test
//! suites and as the executable specification a production backend is
//! checked against.
//!
//! Supports fault injection: [`InMemoryStore::fail_next`] makes the next N
//! operations return a transient [`StoreError::Unavailable`], which is how
//! the retry and tick-dropping paths are exercised.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{Expected, LeaseStore, PutOutcome, Row, StoreError, StoreResult};

/// Shared in-memory lease table.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    table: Mutex<BTreeMap<String, Row>>,
    fail_budget: AtomicU32,
    applied_writes: AtomicU64,
    conflicts: AtomicU64,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` operations fail with a transient error.
    pub fn fail_next(&self, n: u32) {
        self.fail_budget.store(n, Ordering::SeqCst);
    }

    /// Number of conditional writes and deletes that were applied.
    pub fn applied_writes(&self) -> u64 {
        self.applied_writes.load(Ordering::SeqCst)
    }

    /// Number of conditional writes and deletes that hit a conflict.
    pub fn conflicts(&self) -> u64 {
        self.conflicts.load(Ordering::SeqCst)
    }

    /// Snapshot of every row, for test assertions.
    pub async fn dump(&self) -> Vec<Row> {
        self.table.lock().await.values().cloned().collect()
    }

    fn consume_fault(&self) -> StoreResult<()> {
        // Decrement the budget without going below zero under concurrency.
        let mut current = self.fail_budget.load(Ordering::SeqCst);
        while current > 0 {
            match self.fail_budget.compare_exchange(
                current,
                current - 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return Err(StoreError::Unavailable("injected fault".to_string())),
                Err(observed) => current = observed,
            }
        }
        Ok(())
    }
}

#[async_trait]
impl LeaseStore for InMemoryStore {
    async fn get(&self, row_id: &str) -> StoreResult<Option<Row>> {
        self.consume_fault()?;
        Ok(self.table.lock().await.get(row_id).cloned())
    }

    async fn conditional_put(&self, mut row: Row, expected: Expected) -> StoreResult<PutOutcome> {
        self.consume_fault()?;
        let mut table = self.table.lock().await;
        let row_id = row.row_id();

        let next_counter = match (table.get(&row_id), expected) {
            (None, Expected::Absent) => 1,
            (Some(current), Expected::Counter(expected)) if current.counter() == expected => {
                expected + 1
            }
            _ => {
                self.conflicts.fetch_add(1, Ordering::SeqCst);
                return Ok(PutOutcome::Conflict);
            }
        };

        row.set_counter(next_counter);
        table.insert(row_id, row);
        self.applied_writes.fetch_add(1, Ordering::SeqCst);
        Ok(PutOutcome::Applied {
            counter: next_counter,
        })
    }

    async fn scan(&self, prefix: &str) -> StoreResult<Vec<Row>> {
        self.consume_fault()?;
        let table = self.table.lock().await;
        Ok(table
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(_, row)| row.clone())
            .collect())
    }

    async fn delete(&self, row_id: &str, expected: u64) -> StoreResult<PutOutcome> {
        self.consume_fault()?;
        let mut table = self.table.lock().await;
        match table.get(row_id) {
            Some(current) if current.counter() == expected => {
                table.remove(row_id);
                self.applied_writes.fetch_add(1, Ordering::SeqCst);
                Ok(PutOutcome::Applied { counter: expected })
            }
            _ => {
                self.conflicts.fetch_add(1, Ordering::SeqCst);
                Ok(PutOutcome::Conflict)
            }
        }
    }
}
