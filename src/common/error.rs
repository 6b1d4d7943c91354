use std::fmt;

use thiserror::Error;

use super::types::{FrameId, PageId, TxnId};

/// Database error types
#[derive(Error, Debug)]
pub enum KeelError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Page {0} is not resident in the buffer pool")]
    PageNotResident(PageId),

    #[error("Invalid page ID: {0}")]
    InvalidPageId(PageId),

    #[error("No available frame: buffer pool is full and nothing is evictable")]
    NoAvailableFrame,

    #[error("Page {0} still has a non-zero pin count")]
    PinCountNonZeroOnDelete(PageId),

    #[error("Frame {0} is out of range for this replacer")]
    FrameOutOfRange(FrameId),

    #[error("Frame {0} is unknown to the replacer")]
    FrameUnknown(FrameId),

    #[error("Frame {0} is not evictable")]
    NotEvictable(FrameId),

    #[error("Iterator is at the end")]
    IteratorEnd,

    #[error("Disk scheduler error: {0}")]
    DiskScheduler(String),

    #[error(transparent)]
    TransactionAbort(#[from] TransactionAbortError),
}

pub type Result<T> = std::result::Result<T, KeelError>;

/// Why the lock manager aborted a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    LockSharedOnReadUncommitted,
    LockOnShrinking,
    AttemptedUnlockButNoLockHeld,
    UpgradeConflict,
    IncompatibleUpgrade,
    TableUnlockedBeforeUnlockingRows,
    TableLockNotPresent,
    AttemptedIntentionLockOnRow,
    Deadlock,
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AbortReason::LockSharedOnReadUncommitted => {
                "shared lock requested under READ_UNCOMMITTED"
            }
            AbortReason::LockOnShrinking => "lock requested in the shrinking phase",
            AbortReason::AttemptedUnlockButNoLockHeld => "unlock without a held lock",
            AbortReason::UpgradeConflict => "another transaction is already upgrading",
            AbortReason::IncompatibleUpgrade => "requested upgrade is not in the lattice",
            AbortReason::TableUnlockedBeforeUnlockingRows => {
                "table unlocked while row locks are still held"
            }
            AbortReason::TableLockNotPresent => "no appropriate table lock for the row lock",
            AbortReason::AttemptedIntentionLockOnRow => "intention lock requested on a row",
            AbortReason::Deadlock => "chosen as deadlock victim",
        };
        f.write_str(s)
    }
}

/// Structured error raised when the lock manager aborts a transaction.
/// The transaction's state has already been set to `Aborted` when this is
/// returned.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("transaction {txn_id} aborted: {reason}")]
pub struct TransactionAbortError {
    pub txn_id: TxnId,
    pub reason: AbortReason,
}

impl TransactionAbortError {
    pub fn new(txn_id: TxnId, reason: AbortReason) -> Self {
        Self { txn_id, reason }
    }
}
