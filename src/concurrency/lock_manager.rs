use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, warn};
use parking_lot::{Condvar, Mutex};

use crate::common::{
    AbortReason, KeelError, RecordId, Result, TableOid, TransactionAbortError, TxnId,
};

use super::transaction::{IsolationLevel, Transaction, TransactionState};
use super::transaction_manager::TxnRegistry;

/// Lock modes of the hierarchical locking protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
    IntentionShared,
    IntentionExclusive,
    SharedIntentionExclusive,
}

impl LockMode {
    /// The standard compatibility matrix. Symmetric.
    pub fn compatible_with(self, other: LockMode) -> bool {
        use LockMode::*;
        match self {
            IntentionShared => !matches!(other, Exclusive),
            IntentionExclusive => matches!(other, IntentionShared | IntentionExclusive),
            Shared => matches!(other, IntentionShared | Shared),
            SharedIntentionExclusive => matches!(other, IntentionShared),
            Exclusive => false,
        }
    }

    /// The upgrade lattice: IS -> {S, X, IX, SIX}; S -> {X, SIX};
    /// IX -> {X, SIX}; SIX -> {X}.
    pub fn can_upgrade_to(self, requested: LockMode) -> bool {
        use LockMode::*;
        match self {
            IntentionShared => matches!(
                requested,
                Shared | Exclusive | IntentionExclusive | SharedIntentionExclusive
            ),
            Shared | IntentionExclusive => {
                matches!(requested, Exclusive | SharedIntentionExclusive)
            }
            SharedIntentionExclusive => matches!(requested, Exclusive),
            Exclusive => false,
        }
    }

    pub fn is_intention(self) -> bool {
        matches!(
            self,
            LockMode::IntentionShared | LockMode::IntentionExclusive | LockMode::SharedIntentionExclusive
        )
    }
}

/// One lock request, table- or row-granular.
#[derive(Debug, Clone)]
pub struct LockRequest {
    pub txn_id: TxnId,
    pub lock_mode: LockMode,
    pub oid: TableOid,
    /// Set for row requests, None for table requests
    pub rid: Option<RecordId>,
    pub granted: bool,
}

impl LockRequest {
    fn new(txn_id: TxnId, lock_mode: LockMode, oid: TableOid, rid: Option<RecordId>) -> Self {
        Self {
            txn_id,
            lock_mode,
            oid,
            rid,
            granted: false,
        }
    }
}

/// Queue state guarded by the per-resource mutex.
struct QueueState {
    /// FIFO list of requests, granted prefix interleaved with waiters
    queue: VecDeque<LockRequest>,
    /// The single transaction allowed to be upgrading on this resource
    upgrading: Option<TxnId>,
}

/// All lock requests for one resource plus the condition variable its
/// waiters block on.
pub struct LockRequestQueue {
    state: Mutex<QueueState>,
    cv: Condvar,
}

impl LockRequestQueue {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(QueueState {
                queue: VecDeque::new(),
                upgrading: None,
            }),
            cv: Condvar::new(),
        })
    }
}

/// LockManager handles transactions asking for locks on tables and rows.
///
/// Locks are granted FIFO per resource, with batching: a waiter may be
/// granted together with compatible waiters ahead of it, but never jumps an
/// incompatible one. Lock upgrades re-enter at the head of the ungranted
/// suffix. A background detector breaks deadlocks by aborting the youngest
/// transaction of each cycle.
pub struct LockManager {
    /// Lock request queues per table
    table_lock_map: Mutex<HashMap<TableOid, Arc<LockRequestQueue>>>,
    /// Lock request queues per row
    row_lock_map: Mutex<HashMap<(TableOid, RecordId), Arc<LockRequestQueue>>>,
    /// Waits-for graph, rebuilt from queue state on each detection pass
    waits_for: Mutex<HashMap<TxnId, Vec<TxnId>>>,
    /// Interval between detection passes
    detection_interval: Duration,
    shutdown: Arc<AtomicBool>,
    detector_handle: Mutex<Option<JoinHandle<()>>>,
}

impl LockManager {
    pub fn new(detection_interval: Duration) -> Arc<Self> {
        Arc::new(Self {
            table_lock_map: Mutex::new(HashMap::new()),
            row_lock_map: Mutex::new(HashMap::new()),
            waits_for: Mutex::new(HashMap::new()),
            detection_interval,
            shutdown: Arc::new(AtomicBool::new(false)),
            detector_handle: Mutex::new(None),
        })
    }

    /*****************************************************************
     * TABLE LOCKS
     *****************************************************************/

    /// Acquires (or upgrades to) a table lock, blocking until it is
    /// granted. Returns false if the transaction was aborted while
    /// waiting; policy violations abort the transaction and error.
    pub fn lock_table(&self, txn: &Arc<Transaction>, mode: LockMode, oid: TableOid) -> Result<bool> {
        if matches!(
            txn.state(),
            TransactionState::Committed | TransactionState::Aborted
        ) {
            return Ok(false);
        }
        self.validate_lock_request(txn, mode)?;

        let queue = self.table_queue(oid);
        self.acquire(txn, mode, oid, None, &queue)
    }

    /// Releases a table lock and wakes the resource's waiters.
    pub fn unlock_table(&self, txn: &Arc<Transaction>, oid: TableOid) -> Result<bool> {
        let queue = self.table_queue(oid);
        let mut state = queue.state.lock();

        let Some(pos) = state
            .queue
            .iter()
            .position(|r| r.txn_id == txn.id() && r.granted)
        else {
            drop(state);
            return Err(self.abort_txn(txn, AbortReason::AttemptedUnlockButNoLockHeld));
        };

        if txn.holds_row_locks_on(oid) {
            drop(state);
            return Err(self.abort_txn(txn, AbortReason::TableUnlockedBeforeUnlockingRows));
        }

        let mode = state.queue[pos].lock_mode;
        state.queue.remove(pos);
        txn.remove_table_lock(mode, oid);
        self.update_state_on_unlock(txn, mode);

        debug!("txn {} unlocked table {} ({:?})", txn.id(), oid, mode);
        queue.cv.notify_all();
        Ok(true)
    }

    /*****************************************************************
     * ROW LOCKS
     *****************************************************************/

    /// Acquires (or upgrades to) a row lock. Rows take only S and X; the
    /// transaction must already hold an appropriate table lock.
    pub fn lock_row(
        &self,
        txn: &Arc<Transaction>,
        mode: LockMode,
        oid: TableOid,
        rid: RecordId,
    ) -> Result<bool> {
        if matches!(
            txn.state(),
            TransactionState::Committed | TransactionState::Aborted
        ) {
            return Ok(false);
        }
        if mode.is_intention() {
            return Err(self.abort_txn(txn, AbortReason::AttemptedIntentionLockOnRow));
        }
        self.validate_lock_request(txn, mode)?;

        let table_mode = txn.table_lock_mode(oid);
        let parent_ok = match mode {
            LockMode::Exclusive => matches!(
                table_mode,
                Some(LockMode::Exclusive)
                    | Some(LockMode::IntentionExclusive)
                    | Some(LockMode::SharedIntentionExclusive)
            ),
            _ => table_mode.is_some(),
        };
        if !parent_ok {
            return Err(self.abort_txn(txn, AbortReason::TableLockNotPresent));
        }

        let queue = self.row_queue(oid, rid);
        self.acquire(txn, mode, oid, Some(rid), &queue)
    }

    /// Releases a row lock. With `force`, the isolation-level state
    /// transition is skipped (used when a fetched tuple turned out to be
    /// invisible).
    pub fn unlock_row(
        &self,
        txn: &Arc<Transaction>,
        oid: TableOid,
        rid: RecordId,
        force: bool,
    ) -> Result<bool> {
        let queue = self.row_queue(oid, rid);
        let mut state = queue.state.lock();

        let Some(pos) = state
            .queue
            .iter()
            .position(|r| r.txn_id == txn.id() && r.granted)
        else {
            drop(state);
            return Err(self.abort_txn(txn, AbortReason::AttemptedUnlockButNoLockHeld));
        };

        let mode = state.queue[pos].lock_mode;
        state.queue.remove(pos);
        txn.remove_row_lock(mode, oid, rid);
        if !force {
            self.update_state_on_unlock(txn, mode);
        }

        debug!("txn {} unlocked row {} of table {}", txn.id(), rid, oid);
        queue.cv.notify_all();
        Ok(true)
    }

    /*****************************************************************
     * ACQUISITION
     *****************************************************************/

    /// Queues the request (handling the upgrade path) and blocks on the
    /// queue's condition variable until it is grantable or the transaction
    /// is aborted.
    fn acquire(
        &self,
        txn: &Arc<Transaction>,
        mode: LockMode,
        oid: TableOid,
        rid: Option<RecordId>,
        queue: &Arc<LockRequestQueue>,
    ) -> Result<bool> {
        let mut state = queue.state.lock();

        if let Some(pos) = state
            .queue
            .iter()
            .position(|r| r.txn_id == txn.id() && r.granted)
        {
            let held_mode = state.queue[pos].lock_mode;
            if held_mode == mode {
                return Ok(true);
            }
            if state.upgrading.is_some() {
                drop(state);
                return Err(self.abort_txn(txn, AbortReason::UpgradeConflict));
            }
            if !held_mode.can_upgrade_to(mode) {
                drop(state);
                return Err(self.abort_txn(txn, AbortReason::IncompatibleUpgrade));
            }

            // Drop the held lock and re-enter at the head of the ungranted
            // suffix so the upgrade outranks ordinary waiters.
            state.queue.remove(pos);
            match rid {
                Some(rid) => txn.remove_row_lock(held_mode, oid, rid),
                None => txn.remove_table_lock(held_mode, oid),
            }
            let insert_at = state
                .queue
                .iter()
                .position(|r| !r.granted)
                .unwrap_or(state.queue.len());
            state
                .queue
                .insert(insert_at, LockRequest::new(txn.id(), mode, oid, rid));
            state.upgrading = Some(txn.id());
            debug!(
                "txn {} upgrading {:?} -> {:?} on table {}",
                txn.id(),
                held_mode,
                mode,
                oid
            );
        } else {
            state
                .queue
                .push_back(LockRequest::new(txn.id(), mode, oid, rid));
        }

        loop {
            if Self::can_grant(&state, txn.id()) {
                break;
            }
            debug!("txn {} blocking on {:?} lock, table {}", txn.id(), mode, oid);
            queue.cv.wait(&mut state);

            if txn.state() == TransactionState::Aborted {
                Self::remove_request(&mut state, txn.id());
                if state.upgrading == Some(txn.id()) {
                    state.upgrading = None;
                }
                queue.cv.notify_all();
                debug!("txn {} aborted while waiting on table {}", txn.id(), oid);
                return Ok(false);
            }
        }

        for request in state.queue.iter_mut() {
            if request.txn_id == txn.id() {
                request.granted = true;
                break;
            }
        }
        if state.upgrading == Some(txn.id()) {
            state.upgrading = None;
        }
        match rid {
            Some(rid) => txn.insert_row_lock(mode, oid, rid),
            None => txn.insert_table_lock(mode, oid),
        }

        debug!("txn {} granted {:?} on table {}", txn.id(), mode, oid);
        // other compatible waiters may be batch-grantable with this one
        if mode != LockMode::Exclusive {
            queue.cv.notify_all();
        }
        Ok(true)
    }

    /// A request is grantable iff it is compatible with every granted
    /// request and every ungranted request ahead of it could be granted in
    /// the same batch (FIFO with batching).
    fn can_grant(state: &QueueState, txn_id: TxnId) -> bool {
        let Some(my) = state.queue.iter().find(|r| r.txn_id == txn_id) else {
            return false;
        };
        let my_mode = my.lock_mode;

        for request in state.queue.iter() {
            if request.granted && !request.lock_mode.compatible_with(my_mode) {
                return false;
            }
        }

        for request in state.queue.iter() {
            if request.txn_id == txn_id {
                return true;
            }
            if !request.granted {
                if !request.lock_mode.compatible_with(my_mode) {
                    return false;
                }
                for holder in state.queue.iter() {
                    if holder.granted && !holder.lock_mode.compatible_with(request.lock_mode) {
                        return false;
                    }
                }
            }
        }
        true
    }

    fn remove_request(state: &mut QueueState, txn_id: TxnId) {
        state.queue.retain(|r| r.txn_id != txn_id);
    }

    /// Validates a request against the transaction's isolation level and
    /// two-phase-locking state; violations abort.
    fn validate_lock_request(&self, txn: &Arc<Transaction>, mode: LockMode) -> Result<()> {
        let state = txn.state();
        match txn.isolation_level() {
            IsolationLevel::ReadUncommitted => {
                if matches!(
                    mode,
                    LockMode::Shared | LockMode::IntentionShared | LockMode::SharedIntentionExclusive
                ) {
                    return Err(self.abort_txn(txn, AbortReason::LockSharedOnReadUncommitted));
                }
                if state == TransactionState::Shrinking {
                    return Err(self.abort_txn(txn, AbortReason::LockOnShrinking));
                }
            }
            IsolationLevel::ReadCommitted => {
                if state == TransactionState::Shrinking
                    && !matches!(mode, LockMode::Shared | LockMode::IntentionShared)
                {
                    return Err(self.abort_txn(txn, AbortReason::LockOnShrinking));
                }
            }
            IsolationLevel::RepeatableRead => {
                if state == TransactionState::Shrinking {
                    return Err(self.abort_txn(txn, AbortReason::LockOnShrinking));
                }
            }
        }
        Ok(())
    }

    /// Two-phase-locking state transition on unlock: only S and X
    /// movements change state, per isolation level.
    fn update_state_on_unlock(&self, txn: &Arc<Transaction>, mode: LockMode) {
        if txn.state() != TransactionState::Growing {
            return;
        }
        let shrink = match txn.isolation_level() {
            IsolationLevel::RepeatableRead => {
                matches!(mode, LockMode::Shared | LockMode::Exclusive)
            }
            IsolationLevel::ReadCommitted | IsolationLevel::ReadUncommitted => {
                mode == LockMode::Exclusive
            }
        };
        if shrink {
            txn.set_state(TransactionState::Shrinking);
        }
    }

    fn abort_txn(&self, txn: &Arc<Transaction>, reason: AbortReason) -> KeelError {
        txn.set_state(TransactionState::Aborted);
        warn!("aborting txn {}: {}", txn.id(), reason);
        KeelError::TransactionAbort(TransactionAbortError::new(txn.id(), reason))
    }

    /// Releases every lock a terminating transaction still holds,
    /// bypassing state transitions, and wakes the affected waiters.
    pub(crate) fn release_all_locks(&self, txn: &Transaction) {
        let (tables, rows) = txn.take_all_locks();

        for (oid, rid) in rows {
            let queue = self.row_queue(oid, rid);
            let mut state = queue.state.lock();
            Self::remove_request(&mut state, txn.id());
            if state.upgrading == Some(txn.id()) {
                state.upgrading = None;
            }
            queue.cv.notify_all();
        }
        for oid in tables {
            let queue = self.table_queue(oid);
            let mut state = queue.state.lock();
            Self::remove_request(&mut state, txn.id());
            if state.upgrading == Some(txn.id()) {
                state.upgrading = None;
            }
            queue.cv.notify_all();
        }
    }

    fn table_queue(&self, oid: TableOid) -> Arc<LockRequestQueue> {
        let mut map = self.table_lock_map.lock();
        Arc::clone(map.entry(oid).or_insert_with(LockRequestQueue::new))
    }

    fn row_queue(&self, oid: TableOid, rid: RecordId) -> Arc<LockRequestQueue> {
        let mut map = self.row_lock_map.lock();
        Arc::clone(map.entry((oid, rid)).or_insert_with(LockRequestQueue::new))
    }

    /*****************************************************************
     * DEADLOCK DETECTION
     *****************************************************************/

    /// Spawns the background detection thread. The thread holds only a
    /// weak reference so dropping the manager shuts it down.
    pub fn start_deadlock_detection(manager: &Arc<LockManager>, registry: TxnRegistry) {
        let mut handle = manager.detector_handle.lock();
        if handle.is_some() {
            return;
        }

        let weak: Weak<LockManager> = Arc::downgrade(manager);
        let shutdown = Arc::clone(&manager.shutdown);
        let interval = manager.detection_interval;

        *handle = Some(thread::spawn(move || loop {
            thread::sleep(interval);
            if shutdown.load(Ordering::Relaxed) {
                break;
            }
            let Some(manager) = weak.upgrade() else {
                break;
            };
            manager.run_detection_pass(&registry);
        }));
    }

    /// One detection round: rebuild the waits-for graph from queue state,
    /// then abort the youngest member of each cycle until acyclic.
    fn run_detection_pass(&self, registry: &TxnRegistry) {
        *self.waits_for.lock() = self.build_waits_for();

        let mut victim: TxnId = 0;
        while self.has_cycle(&mut victim) {
            warn!("deadlock detected; aborting youngest txn {}", victim);
            if let Some(txn) = registry.lock().get(&victim).cloned() {
                txn.set_state(TransactionState::Aborted);
            }
            self.remove_txn_vertex(victim);
            self.notify_all_queues();
        }
    }

    fn build_waits_for(&self) -> HashMap<TxnId, Vec<TxnId>> {
        let mut queues: Vec<Arc<LockRequestQueue>> = Vec::new();
        queues.extend(self.table_lock_map.lock().values().cloned());
        queues.extend(self.row_lock_map.lock().values().cloned());

        let mut graph: HashMap<TxnId, Vec<TxnId>> = HashMap::new();
        for queue in queues {
            let state = queue.state.lock();
            for waiter in state.queue.iter().filter(|r| !r.granted) {
                for holder in state.queue.iter().filter(|r| r.granted) {
                    if holder.txn_id != waiter.txn_id
                        && !holder.lock_mode.compatible_with(waiter.lock_mode)
                    {
                        let edges = graph.entry(waiter.txn_id).or_default();
                        if !edges.contains(&holder.txn_id) {
                            edges.push(holder.txn_id);
                        }
                    }
                }
            }
        }
        for edges in graph.values_mut() {
            edges.sort_unstable();
        }
        graph
    }

    /// Adds an edge `t1 -> t2` (t1 waits for t2) to the graph.
    pub fn add_edge(&self, t1: TxnId, t2: TxnId) {
        let mut graph = self.waits_for.lock();
        let edges = graph.entry(t1).or_default();
        if !edges.contains(&t2) {
            edges.push(t2);
            edges.sort_unstable();
        }
    }

    /// Removes the edge `t1 -> t2` from the graph.
    pub fn remove_edge(&self, t1: TxnId, t2: TxnId) {
        let mut graph = self.waits_for.lock();
        if let Some(edges) = graph.get_mut(&t1) {
            edges.retain(|&t| t != t2);
        }
    }

    /// All edges of the current graph, sorted for determinism.
    pub fn get_edge_list(&self) -> Vec<(TxnId, TxnId)> {
        let graph = self.waits_for.lock();
        let mut edges: Vec<(TxnId, TxnId)> = graph
            .iter()
            .flat_map(|(&from, tos)| tos.iter().map(move |&to| (from, to)))
            .collect();
        edges.sort_unstable();
        edges
    }

    /// Deterministic cycle search: vertices and adjacency explored in
    /// ascending txn-id order. On a cycle, `victim` receives the youngest
    /// (largest) txn id in it.
    pub fn has_cycle(&self, victim: &mut TxnId) -> bool {
        let graph = self.waits_for.lock();

        let mut starts: Vec<TxnId> = graph.keys().copied().collect();
        starts.sort_unstable();

        let mut visited = HashSet::new();
        for start in starts {
            if visited.contains(&start) {
                continue;
            }
            let mut path = Vec::new();
            let mut on_path = HashSet::new();
            if Self::find_cycle(&graph, start, &mut visited, &mut path, &mut on_path, victim) {
                return true;
            }
        }
        false
    }

    fn find_cycle(
        graph: &HashMap<TxnId, Vec<TxnId>>,
        node: TxnId,
        visited: &mut HashSet<TxnId>,
        path: &mut Vec<TxnId>,
        on_path: &mut HashSet<TxnId>,
        victim: &mut TxnId,
    ) -> bool {
        visited.insert(node);
        on_path.insert(node);
        path.push(node);

        static EMPTY: Vec<TxnId> = Vec::new();
        for &next in graph.get(&node).unwrap_or(&EMPTY) {
            if on_path.contains(&next) {
                let start = path
                    .iter()
                    .position(|&t| t == next)
                    .expect("node on path must be in the path vector");
                *victim = path[start..]
                    .iter()
                    .copied()
                    .max()
                    .expect("cycle cannot be empty");
                return true;
            }
            if !visited.contains(&next)
                && Self::find_cycle(graph, next, visited, path, on_path, victim)
            {
                return true;
            }
        }

        path.pop();
        on_path.remove(&node);
        false
    }

    /// Wakes every waiter in the system; aborted victims notice their
    /// state and give up their pending requests.
    fn notify_all_queues(&self) {
        let mut queues: Vec<Arc<LockRequestQueue>> = Vec::new();
        queues.extend(self.table_lock_map.lock().values().cloned());
        queues.extend(self.row_lock_map.lock().values().cloned());

        for queue in queues {
            // taking the mutex pairs the notify with the waiter's check
            let _state = queue.state.lock();
            queue.cv.notify_all();
        }
    }

    fn remove_txn_vertex(&self, txn_id: TxnId) {
        let mut graph = self.waits_for.lock();
        graph.remove(&txn_id);
        for edges in graph.values_mut() {
            edges.retain(|&t| t != txn_id);
        }
    }
}

impl Drop for LockManager {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.detector_handle.get_mut().take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_mode_compatibility_matrix() {
        use LockMode::*;
        let modes = [IntentionShared, IntentionExclusive, Shared, SharedIntentionExclusive, Exclusive];
        // rows: holder; columns: requester
        let expected = [
            [true, true, true, true, false],
            [true, true, false, false, false],
            [true, false, true, false, false],
            [true, false, false, false, false],
            [false, false, false, false, false],
        ];
        for (i, &holder) in modes.iter().enumerate() {
            for (j, &requester) in modes.iter().enumerate() {
                assert_eq!(
                    holder.compatible_with(requester),
                    expected[i][j],
                    "{:?} vs {:?}",
                    holder,
                    requester
                );
            }
        }
    }

    #[test]
    fn test_lock_mode_upgrade_lattice() {
        use LockMode::*;
        assert!(IntentionShared.can_upgrade_to(Shared));
        assert!(IntentionShared.can_upgrade_to(Exclusive));
        assert!(IntentionShared.can_upgrade_to(IntentionExclusive));
        assert!(IntentionShared.can_upgrade_to(SharedIntentionExclusive));
        assert!(Shared.can_upgrade_to(Exclusive));
        assert!(Shared.can_upgrade_to(SharedIntentionExclusive));
        assert!(!Shared.can_upgrade_to(IntentionShared));
        assert!(IntentionExclusive.can_upgrade_to(Exclusive));
        assert!(SharedIntentionExclusive.can_upgrade_to(Exclusive));
        assert!(!Exclusive.can_upgrade_to(Shared));
        assert!(!SharedIntentionExclusive.can_upgrade_to(Shared));
    }

    #[test]
    fn test_graph_api_cycle_detection() {
        let lm = LockManager::new(Duration::from_millis(50));

        lm.add_edge(1, 2);
        lm.add_edge(2, 3);
        let mut victim = 0;
        assert!(!lm.has_cycle(&mut victim));

        lm.add_edge(3, 1);
        assert!(lm.has_cycle(&mut victim));
        assert_eq!(victim, 3);

        lm.remove_edge(3, 1);
        assert!(!lm.has_cycle(&mut victim));

        assert_eq!(lm.get_edge_list(), vec![(1, 2), (2, 3)]);
    }

    #[test]
    fn test_graph_api_two_cycles() {
        let lm = LockManager::new(Duration::from_millis(50));

        // small cycle among older txns, bigger id elsewhere
        lm.add_edge(1, 2);
        lm.add_edge(2, 1);
        lm.add_edge(5, 6);

        let mut victim = 0;
        assert!(lm.has_cycle(&mut victim));
        assert_eq!(victim, 2);
    }
}
