//! Keeldb - the storage and concurrency core of an embedded RDBMS
//!
//! This crate provides the correctness foundation a disk-oriented database
//! is built on: page residency, latch discipline and transactional locking.
//! Everything above it (executors, catalog, optimizer) consumes these
//! contracts.
//!
//! # Architecture
//!
//! - **Storage Layer** (`storage`): disk I/O
//!   - `DiskManager`: reads and writes pages of the page file
//!   - `DiskScheduler`: background worker thread for disk requests
//!
//! - **Buffer Pool** (`buffer`): memory management for database pages
//!   - `BufferPoolManager`: pins pages into frames and evicts victims
//!   - `LruKReplacer`: LRU-K page replacement policy
//!   - `FrameHeader`: per-frame metadata, pin count and page latch
//!   - `BasicPageGuard`/`ReadPageGuard`/`WritePageGuard`: RAII page access
//!
//! - **Index** (`index`): ordered key access
//!   - `BPlusTree`: concurrent B+ tree using latch crabbing
//!   - `BTreeIterator`: hand-over-hand range iteration over the leaf chain
//!
//! - **Concurrency** (`concurrency`): transactional locking
//!   - `LockManager`: hierarchical S/X/IS/IX/SIX locks with FIFO grants,
//!     upgrades and background deadlock detection
//!   - `Transaction`/`TransactionManager`: two-phase-locking state and
//!     lifecycle under three isolation levels
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use keeldb::buffer::BufferPoolManager;
//! use keeldb::index::{BPlusTree, IntegerComparator};
//! use keeldb::storage::disk::DiskManager;
//! use keeldb::common::{PageId, RecordId, SlotId};
//!
//! let disk_manager = Arc::new(DiskManager::new("test.db").unwrap());
//! let bpm = Arc::new(BufferPoolManager::new(64, 2, disk_manager));
//!
//! // page 0 conventionally holds the tree's header page
//! let header = bpm.new_page().unwrap();
//! bpm.unpin_page(header, false);
//!
//! let tree = BPlusTree::new(bpm, header, IntegerComparator, 64, 64).unwrap();
//! tree.insert(42, RecordId::new(PageId::new(7), SlotId::new(0))).unwrap();
//! assert!(tree.get_value(42).unwrap().is_some());
//! ```

pub mod buffer;
pub mod common;
pub mod concurrency;
pub mod index;
pub mod storage;

// Re-export commonly used types at the crate root
pub use common::{KeelError, PageId, RecordId, Result, SlotId};
