use std::collections::{HashMap, LinkedList};
use std::sync::Arc;

use log::{debug, warn};
use parking_lot::Mutex;

use crate::common::{FrameId, KeelError, PageId, Result, INVALID_PAGE_ID, PAGE_SIZE};
use crate::storage::disk::{DiskManager, DiskScheduler};

use super::{BasicPageGuard, FrameHeader, LruKReplacer, ReadPageGuard, WritePageGuard};

/// Bookkeeping protected by the buffer pool's single coarse mutex
struct PoolState {
    /// Page table: maps resident page IDs to frame IDs
    page_table: HashMap<PageId, FrameId>,
    /// Frames that are not currently in use
    free_list: LinkedList<FrameId>,
    /// Next page ID to hand out
    next_page_id: u32,
}

/// State shared between the manager and the release callbacks of
/// outstanding page guards
struct Shared {
    /// The buffer pool frames
    frames: Vec<Arc<FrameHeader>>,
    /// LRU-K replacer for eviction decisions
    replacer: LruKReplacer,
    state: Mutex<PoolState>,
}

impl Shared {
    /// Unpins a page, optionally marking it dirty. Returns false if the
    /// page is not resident or its pin count is already zero.
    fn unpin(&self, page_id: PageId, is_dirty: bool) -> bool {
        let state = self.state.lock();
        let Some(&frame_id) = state.page_table.get(&page_id) else {
            return false;
        };

        let frame = &self.frames[frame_id.as_usize()];
        if is_dirty {
            frame.set_dirty(true);
        }

        match frame.unpin() {
            None => false,
            Some(0) => {
                if let Err(e) = self.replacer.set_evictable(frame_id, true) {
                    warn!("replacer lost track of {}: {}", frame_id, e);
                }
                true
            }
            Some(_) => true,
        }
    }
}

/// BufferPoolManager mediates between the disk-resident page file and the
/// in-memory frames. It owns a fixed number of frames, maps resident pages
/// to them, and uses the LRU-K replacement policy to pick eviction victims.
pub struct BufferPoolManager {
    /// Number of frames in the buffer pool
    pool_size: usize,
    shared: Arc<Shared>,
    /// Disk scheduler through which all page I/O goes
    disk_scheduler: DiskScheduler,
}

impl BufferPoolManager {
    /// Creates a new BufferPoolManager with the given pool size, k value
    /// for LRU-K, and disk manager.
    pub fn new(pool_size: usize, replacer_k: usize, disk_manager: Arc<DiskManager>) -> Self {
        let mut frames = Vec::with_capacity(pool_size);
        let mut free_list = LinkedList::new();

        for i in 0..pool_size {
            let frame_id = FrameId::new(i as u32);
            frames.push(Arc::new(FrameHeader::new(frame_id)));
            free_list.push_back(frame_id);
        }

        let shared = Arc::new(Shared {
            frames,
            replacer: LruKReplacer::new(replacer_k, pool_size),
            state: Mutex::new(PoolState {
                page_table: HashMap::new(),
                free_list,
                next_page_id: 0,
            }),
        });

        Self {
            pool_size,
            shared,
            disk_scheduler: DiskScheduler::new(disk_manager),
        }
    }

    /// Allocates a fresh page and pins it into a frame (pin count 1).
    /// The caller is responsible for unpinning it, directly or through a
    /// guard obtained from `fetch_page_*`.
    pub fn new_page(&self) -> Result<PageId> {
        self.new_page_internal().map(|(page_id, _)| page_id)
    }

    /// Allocates a fresh page and returns a guard owning its single pin.
    pub fn new_page_guarded(&self) -> Result<BasicPageGuard> {
        let (page_id, frame_id) = self.new_page_internal()?;
        let frame = Arc::clone(&self.shared.frames[frame_id.as_usize()]);
        Ok(BasicPageGuard::new(
            page_id,
            frame,
            self.make_release_callback(),
        ))
    }

    fn new_page_internal(&self) -> Result<(PageId, FrameId)> {
        let mut state = self.shared.state.lock();
        let frame_id = self.pick_frame(&mut state)?;

        let page_id = PageId::new(state.next_page_id);
        state.next_page_id += 1;

        let frame = &self.shared.frames[frame_id.as_usize()];
        frame.reset();
        frame.set_page_id(page_id);
        frame.pin();

        state.page_table.insert(page_id, frame_id);
        self.shared.replacer.record_access(frame_id)?;
        self.shared.replacer.set_evictable(frame_id, false)?;

        Ok((page_id, frame_id))
    }

    /// Fetches a page with no latch held; the guard keeps the pin only.
    pub fn fetch_page_basic(&self, page_id: PageId) -> Result<BasicPageGuard> {
        let frame_id = self.fetch_page(page_id)?;
        let frame = Arc::clone(&self.shared.frames[frame_id.as_usize()]);
        Ok(BasicPageGuard::new(
            page_id,
            frame,
            self.make_release_callback(),
        ))
    }

    /// Fetches a page and acquires its shared latch.
    pub fn fetch_page_read(&self, page_id: PageId) -> Result<ReadPageGuard> {
        let frame_id = self.fetch_page(page_id)?;
        let frame = Arc::clone(&self.shared.frames[frame_id.as_usize()]);

        // Safety: the Arc keeps the frame alive for the guard's lifetime,
        // and the pin taken in fetch_page keeps it resident.
        Ok(unsafe { ReadPageGuard::new(page_id, frame, self.make_release_callback()) })
    }

    /// Fetches a page and acquires its exclusive latch.
    pub fn fetch_page_write(&self, page_id: PageId) -> Result<WritePageGuard> {
        let frame_id = self.fetch_page(page_id)?;
        let frame = Arc::clone(&self.shared.frames[frame_id.as_usize()]);

        // Safety: as in fetch_page_read.
        Ok(unsafe { WritePageGuard::new(page_id, frame, self.make_release_callback()) })
    }

    /// Unpins a page, ORing `is_dirty` into its dirty flag. Returns false
    /// if the page is not resident or was not pinned.
    pub fn unpin_page(&self, page_id: PageId, is_dirty: bool) -> bool {
        self.shared.unpin(page_id, is_dirty)
    }

    /// Writes a page to disk and clears its dirty flag. Returns false if
    /// the page is invalid or not resident.
    pub fn flush_page(&self, page_id: PageId) -> Result<bool> {
        if page_id == INVALID_PAGE_ID {
            return Ok(false);
        }

        let state = self.shared.state.lock();
        let Some(&frame_id) = state.page_table.get(&page_id) else {
            return Ok(false);
        };

        let frame = &self.shared.frames[frame_id.as_usize()];
        let mut data = [0u8; PAGE_SIZE];
        frame.copy_to(&mut data);

        self.disk_scheduler.schedule_write_sync(page_id, &data)?;
        frame.set_dirty(false);

        Ok(true)
    }

    /// Flushes every resident page to disk.
    pub fn flush_all_pages(&self) -> Result<()> {
        let state = self.shared.state.lock();

        for (&page_id, &frame_id) in state.page_table.iter() {
            let frame = &self.shared.frames[frame_id.as_usize()];
            let mut data = [0u8; PAGE_SIZE];
            frame.copy_to(&mut data);

            self.disk_scheduler.schedule_write_sync(page_id, &data)?;
            frame.set_dirty(false);
        }

        Ok(())
    }

    /// Deletes a page from the buffer pool, returning its frame to the
    /// free list and informing the disk manager. Deleting a non-resident
    /// page succeeds trivially; deleting a pinned page is an error.
    pub fn delete_page(&self, page_id: PageId) -> Result<bool> {
        let mut state = self.shared.state.lock();

        let Some(&frame_id) = state.page_table.get(&page_id) else {
            return Ok(true);
        };

        let frame = &self.shared.frames[frame_id.as_usize()];
        if frame.pin_count() > 0 {
            return Err(KeelError::PinCountNonZeroOnDelete(page_id));
        }

        if frame.is_dirty() {
            let mut data = [0u8; PAGE_SIZE];
            frame.copy_to(&mut data);
            self.disk_scheduler.schedule_write_sync(page_id, &data)?;
        }

        state.page_table.remove(&page_id);
        self.shared.replacer.remove(frame_id)?;
        state.free_list.push_back(frame_id);
        frame.reset();

        self.disk_scheduler.disk_manager().deallocate_page(page_id)?;

        Ok(true)
    }

    /// Returns the pin count for a resident page.
    pub fn get_pin_count(&self, page_id: PageId) -> Option<u32> {
        let state = self.shared.state.lock();
        state
            .page_table
            .get(&page_id)
            .map(|&frame_id| self.shared.frames[frame_id.as_usize()].pin_count())
    }

    /// Returns the pool size.
    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    /// Returns the number of free frames.
    pub fn free_frame_count(&self) -> usize {
        self.shared.state.lock().free_list.len()
    }

    /// Pins a page into a frame and returns the frame ID. If the page is
    /// already resident its pin count is bumped; otherwise a frame is
    /// acquired and the page read from disk.
    fn fetch_page(&self, page_id: PageId) -> Result<FrameId> {
        if page_id == INVALID_PAGE_ID {
            return Err(KeelError::InvalidPageId(page_id));
        }

        let mut state = self.shared.state.lock();

        if let Some(&frame_id) = state.page_table.get(&page_id) {
            let frame = &self.shared.frames[frame_id.as_usize()];
            frame.pin();
            self.shared.replacer.record_access(frame_id)?;
            self.shared.replacer.set_evictable(frame_id, false)?;
            return Ok(frame_id);
        }

        let frame_id = self.pick_frame(&mut state)?;
        let frame = &self.shared.frames[frame_id.as_usize()];

        let data = self.disk_scheduler.schedule_read_sync(page_id)?;
        frame.set_page_id(page_id);
        frame.copy_from(&data[..]);
        frame.set_dirty(false);
        frame.pin();

        state.page_table.insert(page_id, frame_id);
        self.shared.replacer.record_access(frame_id)?;
        self.shared.replacer.set_evictable(frame_id, false)?;

        Ok(frame_id)
    }

    /// Acquires a frame for reuse: the free list first, then a replacer
    /// victim. A dirty victim is flushed before its frame is handed out.
    fn pick_frame(&self, state: &mut PoolState) -> Result<FrameId> {
        if let Some(frame_id) = state.free_list.pop_front() {
            return Ok(frame_id);
        }

        let Some(frame_id) = self.shared.replacer.evict() else {
            return Err(KeelError::NoAvailableFrame);
        };

        let frame = &self.shared.frames[frame_id.as_usize()];
        let old_page_id = frame.page_id();
        debug!("evicting {} from {}", old_page_id, frame_id);

        if frame.is_dirty() {
            let mut data = [0u8; PAGE_SIZE];
            frame.copy_to(&mut data);
            self.disk_scheduler.schedule_write_sync(old_page_id, &data)?;
        }

        state.page_table.remove(&old_page_id);
        frame.reset();

        Ok(frame_id)
    }

    fn make_release_callback(&self) -> Box<dyn FnOnce(PageId, bool) + Send + Sync> {
        let shared = Arc::clone(&self.shared);
        Box::new(move |page_id, is_dirty| {
            shared.unpin(page_id, is_dirty);
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn create_bpm(pool_size: usize) -> (BufferPoolManager, NamedTempFile) {
        let temp_file = NamedTempFile::new().unwrap();
        let dm = Arc::new(DiskManager::new(temp_file.path()).unwrap());
        let bpm = BufferPoolManager::new(pool_size, 2, dm);
        (bpm, temp_file)
    }

    #[test]
    fn test_buffer_pool_manager_new() {
        let (bpm, _temp) = create_bpm(10);
        assert_eq!(bpm.pool_size(), 10);
        assert_eq!(bpm.free_frame_count(), 10);
    }

    #[test]
    fn test_buffer_pool_manager_new_page_pins() {
        let (bpm, _temp) = create_bpm(10);

        let page_id = bpm.new_page().unwrap();
        assert_eq!(page_id, PageId::new(0));
        assert_eq!(bpm.get_pin_count(page_id), Some(1));
        assert_eq!(bpm.free_frame_count(), 9);

        assert!(bpm.unpin_page(page_id, false));
        assert_eq!(bpm.get_pin_count(page_id), Some(0));
        assert!(!bpm.unpin_page(page_id, false));
    }

    #[test]
    fn test_buffer_pool_manager_read_write() {
        let (bpm, _temp) = create_bpm(10);

        let page_id = bpm.new_page().unwrap();
        bpm.unpin_page(page_id, false);

        {
            let mut guard = bpm.fetch_page_write(page_id).unwrap();
            guard.data_mut()[0] = 42;
            guard.data_mut()[100] = 255;
        }

        assert_eq!(bpm.get_pin_count(page_id), Some(0));

        {
            let guard = bpm.fetch_page_read(page_id).unwrap();
            assert_eq!(guard.data()[0], 42);
            assert_eq!(guard.data()[100], 255);
        }
    }

    #[test]
    fn test_buffer_pool_manager_flush_restores_bytes() {
        let (bpm, temp) = create_bpm(10);

        let page_id = bpm.new_page().unwrap();
        bpm.unpin_page(page_id, false);

        {
            let mut guard = bpm.fetch_page_write(page_id).unwrap();
            guard.data_mut()[0] = 42;
        }

        assert!(bpm.flush_page(page_id).unwrap());
        drop(bpm);

        let dm = Arc::new(DiskManager::new(temp.path()).unwrap());
        let bpm2 = BufferPoolManager::new(10, 2, dm);
        let guard = bpm2.fetch_page_read(page_id).unwrap();
        assert_eq!(guard.data()[0], 42);
    }

    #[test]
    fn test_buffer_pool_manager_eviction_round_trip() {
        let (bpm, _temp) = create_bpm(3);

        let page_ids: Vec<_> = (0..3).map(|_| bpm.new_page().unwrap()).collect();
        for &pid in &page_ids {
            let mut guard = bpm.fetch_page_write(pid).unwrap();
            guard.data_mut()[0] = pid.as_u32() as u8;
            drop(guard);
            bpm.unpin_page(pid, true);
        }

        assert_eq!(bpm.free_frame_count(), 0);

        // Forces an eviction; the dirty victim must be flushed.
        let new_page_id = bpm.new_page().unwrap();
        assert_eq!(new_page_id, PageId::new(3));
        bpm.unpin_page(new_page_id, false);

        // Every original page still reads back its byte.
        for &pid in &page_ids {
            let guard = bpm.fetch_page_read(pid).unwrap();
            assert_eq!(guard.data()[0], pid.as_u32() as u8);
        }
    }

    #[test]
    fn test_buffer_pool_manager_delete_page() {
        let (bpm, _temp) = create_bpm(10);

        let page_id = bpm.new_page().unwrap();

        // Still pinned from new_page.
        assert!(matches!(
            bpm.delete_page(page_id),
            Err(KeelError::PinCountNonZeroOnDelete(_))
        ));

        bpm.unpin_page(page_id, false);
        assert!(bpm.delete_page(page_id).unwrap());
        assert_eq!(bpm.get_pin_count(page_id), None);

        // Deleting a non-resident page succeeds trivially.
        assert!(bpm.delete_page(PageId::new(999)).unwrap());
    }

    #[test]
    fn test_buffer_pool_manager_no_available_frame() {
        let (bpm, _temp) = create_bpm(2);

        let page_id1 = bpm.new_page().unwrap();
        let page_id2 = bpm.new_page().unwrap();

        // Both pages pinned; nothing can be evicted.
        assert!(matches!(bpm.new_page(), Err(KeelError::NoAvailableFrame)));

        bpm.unpin_page(page_id1, false);
        let page_id3 = bpm.new_page().unwrap();
        assert_eq!(page_id3, PageId::new(2));

        let _ = page_id2;
    }
}
