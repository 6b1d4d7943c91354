use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use parking_lot::{RwLockReadGuard, RwLockWriteGuard};

use crate::common::{PageId, PAGE_SIZE};

use super::FrameHeader;

/// Callback invoked exactly once when a guard releases its page.
/// Receives the page id and whether the guard dirtied the page.
type ReleaseCallback = Box<dyn FnOnce(PageId, bool) + Send + Sync>;

/// State common to all guard kinds: the pinned frame and the pending
/// release. Once the callback is taken, the guard is inert and further
/// drops are no-ops.
struct PageGuardBase {
    /// The page ID being guarded
    page_id: PageId,
    /// Reference to the frame header (kept alive for the guard's lifetime)
    frame: Arc<FrameHeader>,
    /// Callback to release the guard (unpins the page)
    release_callback: Option<ReleaseCallback>,
    /// Whether the page was marked dirty through this guard
    is_dirty: bool,
}

impl PageGuardBase {
    fn new(page_id: PageId, frame: Arc<FrameHeader>, release_callback: ReleaseCallback) -> Self {
        Self {
            page_id,
            frame,
            release_callback: Some(release_callback),
            is_dirty: false,
        }
    }

    fn release(&mut self) {
        if let Some(callback) = self.release_callback.take() {
            callback(self.page_id, self.is_dirty);
        }
    }
}

/// RAII guard holding only a pin on a page, no latch. Data access takes the
/// page latch transiently per call. Used for pages no other thread can
/// reach yet, such as freshly allocated ones.
pub struct BasicPageGuard {
    base: PageGuardBase,
}

impl BasicPageGuard {
    pub(crate) fn new(
        page_id: PageId,
        frame: Arc<FrameHeader>,
        release_callback: ReleaseCallback,
    ) -> Self {
        Self {
            base: PageGuardBase::new(page_id, frame, release_callback),
        }
    }

    /// Returns the page ID.
    pub fn page_id(&self) -> PageId {
        self.base.page_id
    }

    /// Returns read access to the page data, holding the shared latch for
    /// the borrow's duration.
    pub fn data(&self) -> RwLockReadGuard<'_, Box<[u8; PAGE_SIZE]>> {
        self.base.frame.data.read()
    }

    /// Returns write access to the page data, holding the exclusive latch
    /// for the borrow's duration. Marks the page dirty.
    pub fn data_mut(&mut self) -> RwLockWriteGuard<'_, Box<[u8; PAGE_SIZE]>> {
        self.base.is_dirty = true;
        self.base.frame.data.write()
    }

    /// Drops this guard, releasing the page.
    pub fn drop_guard(self) {
        drop(self);
    }
}

impl Drop for BasicPageGuard {
    fn drop(&mut self) {
        self.base.release();
    }
}

/// RAII guard for read access to a page. Holds the page's shared latch for
/// its whole lifetime and unpins the page when dropped.
pub struct ReadPageGuard {
    base: PageGuardBase,
    /// Shared latch on the page data. Taken (and therefore released) before
    /// the release callback runs, so no thread ever observes this frame
    /// unpinned while the latch is still held.
    data_guard: Option<RwLockReadGuard<'static, Box<[u8; PAGE_SIZE]>>>,
}

impl ReadPageGuard {
    /// Creates a new ReadPageGuard, blocking until the shared latch is
    /// acquired.
    ///
    /// # Safety
    /// The data guard's lifetime is extended to 'static; this is sound
    /// because `base.frame` keeps the `RwLock` alive at a stable address
    /// for at least as long as this guard, and `data_guard` is dropped
    /// before `base`.
    pub(crate) unsafe fn new(
        page_id: PageId,
        frame: Arc<FrameHeader>,
        release_callback: ReleaseCallback,
    ) -> Self {
        let data_guard = frame.data.read();
        let data_guard: RwLockReadGuard<'static, Box<[u8; PAGE_SIZE]>> =
            std::mem::transmute(data_guard);

        Self {
            base: PageGuardBase::new(page_id, frame, release_callback),
            data_guard: Some(data_guard),
        }
    }

    /// Returns the page ID.
    pub fn page_id(&self) -> PageId {
        self.base.page_id
    }

    /// Returns a reference to the page data.
    pub fn data(&self) -> &[u8] {
        &self.data_guard.as_ref().unwrap()[..]
    }

    /// Drops this guard, releasing the latch and then the pin.
    pub fn drop_guard(self) {
        drop(self);
    }
}

impl Deref for ReadPageGuard {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        self.data()
    }
}

impl Drop for ReadPageGuard {
    fn drop(&mut self) {
        // Latch first, then unpin. The reverse order would let another
        // thread evict this frame while the latch is still held.
        self.data_guard.take();
        self.base.release();
    }
}

/// RAII guard for write access to a page. Holds the page's exclusive latch
/// for its whole lifetime, marks the page dirty on mutation, and unpins it
/// when dropped.
pub struct WritePageGuard {
    base: PageGuardBase,
    /// Exclusive latch on the page data, released before the unpin.
    data_guard: Option<RwLockWriteGuard<'static, Box<[u8; PAGE_SIZE]>>>,
}

impl WritePageGuard {
    /// Creates a new WritePageGuard, blocking until the exclusive latch is
    /// acquired.
    ///
    /// # Safety
    /// Same argument as [`ReadPageGuard::new`].
    pub(crate) unsafe fn new(
        page_id: PageId,
        frame: Arc<FrameHeader>,
        release_callback: ReleaseCallback,
    ) -> Self {
        let data_guard = frame.data.write();
        let data_guard: RwLockWriteGuard<'static, Box<[u8; PAGE_SIZE]>> =
            std::mem::transmute(data_guard);

        Self {
            base: PageGuardBase::new(page_id, frame, release_callback),
            data_guard: Some(data_guard),
        }
    }

    /// Returns the page ID.
    pub fn page_id(&self) -> PageId {
        self.base.page_id
    }

    /// Returns a reference to the page data.
    pub fn data(&self) -> &[u8] {
        &self.data_guard.as_ref().unwrap()[..]
    }

    /// Returns a mutable reference to the page data and marks the page
    /// dirty.
    pub fn data_mut(&mut self) -> &mut [u8] {
        self.base.is_dirty = true;
        &mut self.data_guard.as_mut().unwrap()[..]
    }

    /// Drops this guard, releasing the latch and then the pin.
    pub fn drop_guard(self) {
        drop(self);
    }
}

impl Deref for WritePageGuard {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        self.data()
    }
}

impl DerefMut for WritePageGuard {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.data_mut()
    }
}

impl Drop for WritePageGuard {
    fn drop(&mut self) {
        // Latch first, then unpin; see ReadPageGuard::drop.
        self.data_guard.take();
        self.base.release();
    }
}
