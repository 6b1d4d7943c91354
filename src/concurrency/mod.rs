mod lock_manager;
mod transaction;
mod transaction_manager;

pub use lock_manager::{LockManager, LockMode, LockRequest, LockRequestQueue};
pub use transaction::{IsolationLevel, LockSets, Transaction, TransactionState};
pub use transaction_manager::{TransactionManager, TxnRegistry};
