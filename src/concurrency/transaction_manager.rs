use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use log::debug;
use parking_lot::Mutex;

use crate::common::TxnId;

use super::lock_manager::LockManager;
use super::transaction::{IsolationLevel, Transaction, TransactionState};

/// Registry of live transactions, shared with the deadlock detector so it
/// can abort victims by id.
pub type TxnRegistry = Arc<Mutex<HashMap<TxnId, Arc<Transaction>>>>;

/// Creates transactions and drives them to their terminal states. Both
/// commit and abort release every lock the transaction still holds.
pub struct TransactionManager {
    next_txn_id: AtomicU32,
    registry: TxnRegistry,
    lock_manager: Arc<LockManager>,
}

impl TransactionManager {
    /// Creates the manager and starts the lock manager's deadlock
    /// detection against its transaction registry.
    pub fn new(lock_manager: Arc<LockManager>) -> Arc<Self> {
        let registry: TxnRegistry = Arc::new(Mutex::new(HashMap::new()));
        LockManager::start_deadlock_detection(&lock_manager, Arc::clone(&registry));

        Arc::new(Self {
            next_txn_id: AtomicU32::new(0),
            registry,
            lock_manager,
        })
    }

    /// Begins a new transaction in the GROWING state.
    pub fn begin(&self, isolation_level: IsolationLevel) -> Arc<Transaction> {
        let id = self.next_txn_id.fetch_add(1, Ordering::SeqCst);
        let txn = Transaction::new(id, isolation_level);
        self.registry.lock().insert(id, Arc::clone(&txn));
        debug!("txn {} begins ({:?})", id, isolation_level);
        txn
    }

    /// Commits a transaction, releasing all of its locks.
    pub fn commit(&self, txn: &Arc<Transaction>) {
        self.lock_manager.release_all_locks(txn);
        txn.set_state(TransactionState::Committed);
        self.registry.lock().remove(&txn.id());
        debug!("txn {} committed", txn.id());
    }

    /// Aborts a transaction, releasing all of its locks.
    pub fn abort(&self, txn: &Arc<Transaction>) {
        txn.set_state(TransactionState::Aborted);
        self.lock_manager.release_all_locks(txn);
        self.registry.lock().remove(&txn.id());
        debug!("txn {} aborted", txn.id());
    }

    /// The transaction registry shared with the deadlock detector.
    pub fn registry(&self) -> &TxnRegistry {
        &self.registry
    }
}
