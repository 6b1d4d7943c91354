use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};

use crate::common::{RecordId, TableOid, TxnId};

use super::lock_manager::LockMode;

/// Transaction isolation levels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
}

/// Transaction states under two-phase locking
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Growing,
    Shrinking,
    Committed,
    Aborted,
}

/// Locks currently held by a transaction, partitioned by mode and
/// granularity. Maintained by the lock manager as book-keeping.
#[derive(Debug, Default)]
pub struct LockSets {
    pub shared_tables: HashSet<TableOid>,
    pub exclusive_tables: HashSet<TableOid>,
    pub intention_shared_tables: HashSet<TableOid>,
    pub intention_exclusive_tables: HashSet<TableOid>,
    pub shared_intention_exclusive_tables: HashSet<TableOid>,
    pub shared_rows: HashMap<TableOid, HashSet<RecordId>>,
    pub exclusive_rows: HashMap<TableOid, HashSet<RecordId>>,
}

impl LockSets {
    fn table_set_mut(&mut self, mode: LockMode) -> &mut HashSet<TableOid> {
        match mode {
            LockMode::Shared => &mut self.shared_tables,
            LockMode::Exclusive => &mut self.exclusive_tables,
            LockMode::IntentionShared => &mut self.intention_shared_tables,
            LockMode::IntentionExclusive => &mut self.intention_exclusive_tables,
            LockMode::SharedIntentionExclusive => &mut self.shared_intention_exclusive_tables,
        }
    }
}

/// An active transaction. Shared between worker threads and the deadlock
/// detector, which may flip its state to `Aborted` at any wait point.
pub struct Transaction {
    id: TxnId,
    isolation_level: IsolationLevel,
    state: Mutex<TransactionState>,
    lock_sets: Mutex<LockSets>,
}

impl Transaction {
    /// Creates a new transaction in the GROWING state.
    pub fn new(id: TxnId, isolation_level: IsolationLevel) -> Arc<Self> {
        Arc::new(Self {
            id,
            isolation_level,
            state: Mutex::new(TransactionState::Growing),
            lock_sets: Mutex::new(LockSets::default()),
        })
    }

    pub fn id(&self) -> TxnId {
        self.id
    }

    pub fn isolation_level(&self) -> IsolationLevel {
        self.isolation_level
    }

    pub fn state(&self) -> TransactionState {
        *self.state.lock()
    }

    pub fn set_state(&self, state: TransactionState) {
        *self.state.lock() = state;
    }

    /// Direct access to the lock sets, for inspection.
    pub fn lock_sets(&self) -> MutexGuard<'_, LockSets> {
        self.lock_sets.lock()
    }

    /// The mode of the table lock this transaction holds on `oid`, if any.
    pub fn table_lock_mode(&self, oid: TableOid) -> Option<LockMode> {
        let sets = self.lock_sets.lock();
        if sets.exclusive_tables.contains(&oid) {
            Some(LockMode::Exclusive)
        } else if sets.shared_intention_exclusive_tables.contains(&oid) {
            Some(LockMode::SharedIntentionExclusive)
        } else if sets.intention_exclusive_tables.contains(&oid) {
            Some(LockMode::IntentionExclusive)
        } else if sets.shared_tables.contains(&oid) {
            Some(LockMode::Shared)
        } else if sets.intention_shared_tables.contains(&oid) {
            Some(LockMode::IntentionShared)
        } else {
            None
        }
    }

    /// Whether any row lock on the given table is still held.
    pub fn holds_row_locks_on(&self, oid: TableOid) -> bool {
        let sets = self.lock_sets.lock();
        sets.shared_rows.get(&oid).is_some_and(|rows| !rows.is_empty())
            || sets.exclusive_rows.get(&oid).is_some_and(|rows| !rows.is_empty())
    }

    pub(crate) fn insert_table_lock(&self, mode: LockMode, oid: TableOid) {
        self.lock_sets.lock().table_set_mut(mode).insert(oid);
    }

    pub(crate) fn remove_table_lock(&self, mode: LockMode, oid: TableOid) {
        self.lock_sets.lock().table_set_mut(mode).remove(&oid);
    }

    pub(crate) fn insert_row_lock(&self, mode: LockMode, oid: TableOid, rid: RecordId) {
        let mut sets = self.lock_sets.lock();
        let map = match mode {
            LockMode::Shared => &mut sets.shared_rows,
            LockMode::Exclusive => &mut sets.exclusive_rows,
            _ => unreachable!("row locks are only S or X"),
        };
        map.entry(oid).or_default().insert(rid);
    }

    pub(crate) fn remove_row_lock(&self, mode: LockMode, oid: TableOid, rid: RecordId) {
        let mut sets = self.lock_sets.lock();
        let map = match mode {
            LockMode::Shared => &mut sets.shared_rows,
            LockMode::Exclusive => &mut sets.exclusive_rows,
            _ => unreachable!("row locks are only S or X"),
        };
        if let Some(rows) = map.get_mut(&oid) {
            rows.remove(&rid);
            if rows.is_empty() {
                map.remove(&oid);
            }
        }
    }

    /// Drains every lock set, returning the distinct locked resources.
    /// Used when a transaction terminates.
    pub(crate) fn take_all_locks(&self) -> (Vec<TableOid>, Vec<(TableOid, RecordId)>) {
        let mut sets = self.lock_sets.lock();
        let drained = std::mem::take(&mut *sets);

        let mut tables = HashSet::new();
        tables.extend(drained.shared_tables);
        tables.extend(drained.exclusive_tables);
        tables.extend(drained.intention_shared_tables);
        tables.extend(drained.intention_exclusive_tables);
        tables.extend(drained.shared_intention_exclusive_tables);

        let mut rows = Vec::new();
        for (oid, rids) in drained.shared_rows.into_iter().chain(drained.exclusive_rows) {
            for rid in rids {
                rows.push((oid, rid));
            }
        }

        (tables.into_iter().collect(), rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{PageId, SlotId};

    fn rid(n: u32) -> RecordId {
        RecordId::new(PageId::new(n), SlotId::new(0))
    }

    #[test]
    fn test_transaction_new() {
        let txn = Transaction::new(1, IsolationLevel::RepeatableRead);
        assert_eq!(txn.id(), 1);
        assert_eq!(txn.state(), TransactionState::Growing);
        assert_eq!(txn.isolation_level(), IsolationLevel::RepeatableRead);
        assert_eq!(txn.table_lock_mode(1), None);
    }

    #[test]
    fn test_transaction_table_lock_bookkeeping() {
        let txn = Transaction::new(2, IsolationLevel::ReadCommitted);

        txn.insert_table_lock(LockMode::IntentionShared, 7);
        assert_eq!(txn.table_lock_mode(7), Some(LockMode::IntentionShared));

        txn.insert_table_lock(LockMode::Shared, 7);
        // the strongest held mode wins
        assert_eq!(txn.table_lock_mode(7), Some(LockMode::Shared));

        txn.remove_table_lock(LockMode::IntentionShared, 7);
        txn.remove_table_lock(LockMode::Shared, 7);
        assert_eq!(txn.table_lock_mode(7), None);
    }

    #[test]
    fn test_transaction_row_lock_bookkeeping() {
        let txn = Transaction::new(3, IsolationLevel::RepeatableRead);

        txn.insert_row_lock(LockMode::Shared, 5, rid(1));
        txn.insert_row_lock(LockMode::Exclusive, 5, rid(2));
        assert!(txn.holds_row_locks_on(5));
        assert!(!txn.holds_row_locks_on(6));

        txn.remove_row_lock(LockMode::Shared, 5, rid(1));
        assert!(txn.holds_row_locks_on(5));
        txn.remove_row_lock(LockMode::Exclusive, 5, rid(2));
        assert!(!txn.holds_row_locks_on(5));
    }

    #[test]
    fn test_transaction_take_all_locks() {
        let txn = Transaction::new(4, IsolationLevel::RepeatableRead);
        txn.insert_table_lock(LockMode::IntentionExclusive, 1);
        txn.insert_table_lock(LockMode::Shared, 2);
        txn.insert_row_lock(LockMode::Exclusive, 1, rid(9));

        let (mut tables, rows) = txn.take_all_locks();
        tables.sort_unstable();
        assert_eq!(tables, vec![1, 2]);
        assert_eq!(rows, vec![(1, rid(9))]);
        assert_eq!(txn.table_lock_mode(1), None);
    }
}
