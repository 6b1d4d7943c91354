use std::sync::Arc;

use crate::buffer::{BufferPoolManager, ReadPageGuard};
use crate::common::{Key, KeelError, PageId, RecordId, Result, INVALID_PAGE_ID};

use super::btree_page::LeafPageRef;

/// Forward iterator over the leaf chain of a B+ tree.
///
/// Holds the shared latch (and pin) of the leaf it is positioned on. When
/// it walks off the end of a leaf it latches the next leaf before releasing
/// the current one, so a concurrent structural change can never slip in
/// between. Not sharable across threads.
pub struct BTreeIterator {
    bpm: Arc<BufferPoolManager>,
    guard: Option<ReadPageGuard>,
    page_id: PageId,
    index: usize,
    is_end: bool,
}

impl BTreeIterator {
    pub(crate) fn new(bpm: Arc<BufferPoolManager>, guard: ReadPageGuard, index: usize) -> Self {
        let page_id = guard.page_id();
        Self {
            bpm,
            guard: Some(guard),
            page_id,
            index,
            is_end: false,
        }
    }

    /// The end sentinel: holds no leaf.
    pub(crate) fn end(bpm: Arc<BufferPoolManager>) -> Self {
        Self {
            bpm,
            guard: None,
            page_id: INVALID_PAGE_ID,
            index: 0,
            is_end: true,
        }
    }

    pub fn is_end(&self) -> bool {
        self.is_end
    }

    /// Returns the entry the iterator is positioned on.
    pub fn entry(&self) -> Result<(Key, RecordId)> {
        if self.is_end {
            return Err(KeelError::IteratorEnd);
        }
        let guard = self.guard.as_ref().expect("live iterator holds a leaf guard");
        let leaf = LeafPageRef::new(guard.data());
        Ok((leaf.key_at(self.index), leaf.value_at(self.index)))
    }

    /// Advances to the next entry, following the sibling chain hand over
    /// hand at leaf boundaries.
    pub fn advance(&mut self) -> Result<()> {
        if self.is_end {
            return Err(KeelError::IteratorEnd);
        }
        let guard = self.guard.as_ref().expect("live iterator holds a leaf guard");
        let leaf = LeafPageRef::new(guard.data());

        if self.index + 1 < leaf.size() {
            self.index += 1;
            return Ok(());
        }

        let next_page_id = leaf.next_page_id();
        if next_page_id == INVALID_PAGE_ID {
            self.guard = None;
            self.page_id = INVALID_PAGE_ID;
            self.index = 0;
            self.is_end = true;
            return Ok(());
        }

        // Latch the next leaf before the assignment drops the current one.
        let next_guard = self.bpm.fetch_page_read(next_page_id)?;
        self.guard = Some(next_guard);
        self.page_id = next_page_id;
        self.index = 0;
        Ok(())
    }
}

impl PartialEq for BTreeIterator {
    fn eq(&self, other: &Self) -> bool {
        if self.is_end || other.is_end {
            self.is_end == other.is_end
        } else {
            self.page_id == other.page_id && self.index == other.index
        }
    }
}

impl Iterator for BTreeIterator {
    type Item = Result<(Key, RecordId)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.is_end {
            return None;
        }
        let entry = match self.entry() {
            Ok(entry) => entry,
            Err(e) => return Some(Err(e)),
        };
        if let Err(e) = self.advance() {
            return Some(Err(e));
        }
        Some(Ok(entry))
    }
}
