use std::collections::VecDeque;
use std::fmt::Write as _;
use std::sync::Arc;

use log::debug;

use crate::buffer::{BufferPoolManager, WritePageGuard};
use crate::common::{Key, PageId, RecordId, Result, INVALID_PAGE_ID};

use super::btree_iterator::BTreeIterator;
use super::btree_page::{
    BTreePageRef, HeaderPage, HeaderPageRef, InternalPage, InternalPageRef, LeafPage, LeafPageRef,
};
use super::key_comparator::{IntegerComparator, KeyComparator};

/// Which structural operation a write descent serves; decides when a node
/// is safe enough to release the ancestor latches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TreeOp {
    Insert,
    Delete,
}

/// Latches held by one tree operation. Everything in here is released when
/// the context is dropped; crabbing releases the prefix early by clearing
/// `header` and `write_set`.
struct Context {
    /// Write guard on the header page, held while a root change is possible
    header: Option<WritePageGuard>,
    /// Root page id as read under the header latch
    root_page_id: PageId,
    /// Exclusive latches from the deepest safe node down to the leaf
    write_set: VecDeque<WritePageGuard>,
}

impl Default for Context {
    fn default() -> Self {
        Self {
            header: None,
            root_page_id: INVALID_PAGE_ID,
            write_set: VecDeque::new(),
        }
    }
}

impl Context {
    fn is_root(&self, page_id: PageId) -> bool {
        page_id == self.root_page_id
    }

    fn release_ancestors(&mut self) {
        self.write_set.clear();
        self.header = None;
    }
}

/// A concurrent B+ tree index over the buffer pool.
///
/// The header page stores the authoritative root page id. Readers crab down
/// with shared latches, writers with exclusive latches, releasing every
/// ancestor as soon as a node is safe (no split or merge can propagate past
/// it). Keys are unique; values are record ids.
pub struct BPlusTree<C: KeyComparator = IntegerComparator> {
    header_page_id: PageId,
    bpm: Arc<BufferPoolManager>,
    comparator: C,
    leaf_max_size: usize,
    internal_max_size: usize,
}

impl<C: KeyComparator> BPlusTree<C> {
    /// Creates a tree rooted at the given (already allocated) header page,
    /// resetting it to an empty tree.
    pub fn new(
        bpm: Arc<BufferPoolManager>,
        header_page_id: PageId,
        comparator: C,
        leaf_max_size: usize,
        internal_max_size: usize,
    ) -> Result<Self> {
        {
            let mut guard = bpm.fetch_page_write(header_page_id)?;
            let mut header = HeaderPage::new(guard.data_mut());
            header.set_root_page_id(INVALID_PAGE_ID);
        }

        Ok(Self {
            header_page_id,
            bpm,
            comparator,
            leaf_max_size,
            internal_max_size,
        })
    }

    /// Opens an existing tree without resetting the header page.
    pub fn open(
        bpm: Arc<BufferPoolManager>,
        header_page_id: PageId,
        comparator: C,
        leaf_max_size: usize,
        internal_max_size: usize,
    ) -> Self {
        Self {
            header_page_id,
            bpm,
            comparator,
            leaf_max_size,
            internal_max_size,
        }
    }

    /// Returns true if the tree holds no keys.
    pub fn is_empty(&self) -> Result<bool> {
        let guard = self.bpm.fetch_page_read(self.header_page_id)?;
        Ok(HeaderPageRef::new(guard.data()).root_page_id() == INVALID_PAGE_ID)
    }

    /// Returns the current root page id.
    pub fn root_page_id(&self) -> Result<PageId> {
        let guard = self.bpm.fetch_page_basic(self.header_page_id)?;
        let data = guard.data();
        Ok(HeaderPageRef::new(&data[..]).root_page_id())
    }

    /*****************************************************************
     * SEARCH
     *****************************************************************/

    /// Point lookup. Read-crabs down to the leaf that could hold `key`.
    pub fn get_value(&self, key: Key) -> Result<Option<RecordId>> {
        let header_guard = self.bpm.fetch_page_read(self.header_page_id)?;
        let root_id = HeaderPageRef::new(header_guard.data()).root_page_id();
        if root_id == INVALID_PAGE_ID {
            return Ok(None);
        }

        let mut guard = self.bpm.fetch_page_read(root_id)?;
        drop(header_guard);

        loop {
            if BTreePageRef::new(guard.data()).is_leaf() {
                break;
            }
            let child = InternalPageRef::new(guard.data()).child_for(&self.comparator, key);
            // the child latch is acquired before the parent guard is
            // released by the assignment
            guard = self.bpm.fetch_page_read(child)?;
        }

        Ok(LeafPageRef::new(guard.data()).lookup(&self.comparator, key))
    }

    /*****************************************************************
     * INSERT
     *****************************************************************/

    /// Inserts a key/value pair. Returns false if the key already exists;
    /// a failed insert leaves no structural change behind.
    pub fn insert(&self, key: Key, value: RecordId) -> Result<bool> {
        let mut ctx = Context::default();
        let header_guard = self.bpm.fetch_page_write(self.header_page_id)?;
        ctx.root_page_id = HeaderPageRef::new(header_guard.data()).root_page_id();
        ctx.header = Some(header_guard);

        if ctx.root_page_id == INVALID_PAGE_ID {
            return self.start_new_tree(&mut ctx, key, value);
        }

        self.traverse_write(&mut ctx, key, TreeOp::Insert)?;

        let mut leaf_guard = ctx
            .write_set
            .pop_back()
            .expect("write descent must end at a leaf");
        let leaf_page_id = leaf_guard.page_id();

        let (inserted, full) = {
            let mut leaf = LeafPage::new(leaf_guard.data_mut());
            if !leaf.insert(&self.comparator, key, value) {
                (false, false)
            } else {
                (true, leaf.size() == self.leaf_max_size)
            }
        };
        if !inserted {
            return Ok(false);
        }
        if !full {
            return Ok(true);
        }

        // Leaf reached max size: split, then push the separator upward.
        let (sep_key, new_leaf_id) = self.split_leaf(&mut leaf_guard)?;
        debug!("leaf {} split, new sibling {}", leaf_page_id, new_leaf_id);

        let mut child_key = sep_key;
        let mut child_id = new_leaf_id;
        if ctx.is_root(leaf_page_id) {
            self.grow_root(&mut ctx, child_key, child_id)?;
            return Ok(true);
        }
        drop(leaf_guard);

        while let Some(mut guard) = ctx.write_set.pop_back() {
            let page_id = guard.page_id();
            let full = InternalPageRef::new(guard.data()).size() == self.internal_max_size;

            if !full {
                let mut node = InternalPage::new(guard.data_mut());
                node.insert(&self.comparator, child_key, child_id);
                return Ok(true);
            }

            let (up_key, moved) = {
                let mut node = InternalPage::new(guard.data_mut());
                node.split_insert(&self.comparator, child_key, child_id)
            };

            let mut new_guard = self.bpm.new_page_guarded()?;
            let new_internal_id = new_guard.page_id();
            {
                let mut data = new_guard.data_mut();
                let mut new_node = InternalPage::new(&mut data[..]);
                new_node.init(self.internal_max_size);
                new_node.append_entries(&moved);
                new_node.set_key_at(0, 0);
            }
            debug!("internal {} split, new sibling {}", page_id, new_internal_id);

            child_key = up_key;
            child_id = new_internal_id;
            if ctx.is_root(page_id) {
                self.grow_root(&mut ctx, child_key, child_id)?;
                return Ok(true);
            }
        }

        Ok(true)
    }

    /// Creates the first leaf of an empty tree under the header latch.
    fn start_new_tree(&self, ctx: &mut Context, key: Key, value: RecordId) -> Result<bool> {
        let mut root_guard = self.bpm.new_page_guarded()?;
        let root_id = root_guard.page_id();
        {
            let mut data = root_guard.data_mut();
            let mut leaf = LeafPage::new(&mut data[..]);
            leaf.init(self.leaf_max_size);
            leaf.insert(&self.comparator, key, value);
        }

        let header_guard = ctx
            .header
            .as_mut()
            .expect("header latch must be held to create the tree");
        HeaderPage::new(header_guard.data_mut()).set_root_page_id(root_id);
        ctx.root_page_id = root_id;
        debug!("tree created with root {}", root_id);
        Ok(true)
    }

    /// Splits a full leaf, linking the new right sibling into the chain.
    /// Returns the separator key and the new leaf's page id.
    fn split_leaf(&self, leaf_guard: &mut WritePageGuard) -> Result<(Key, PageId)> {
        let (sep_key, moved, old_next) = {
            let mut leaf = LeafPage::new(leaf_guard.data_mut());
            let old_next = leaf.next_page_id();
            let (sep, moved) = leaf.split();
            (sep, moved, old_next)
        };

        let mut new_guard = self.bpm.new_page_guarded()?;
        let new_leaf_id = new_guard.page_id();
        {
            let mut data = new_guard.data_mut();
            let mut new_leaf = LeafPage::new(&mut data[..]);
            new_leaf.init(self.leaf_max_size);
            new_leaf.append_entries(&moved);
            new_leaf.set_next_page_id(old_next);
        }

        // The new leaf is fully formed before it becomes reachable here.
        let mut leaf = LeafPage::new(leaf_guard.data_mut());
        leaf.set_next_page_id(new_leaf_id);

        Ok((sep_key, new_leaf_id))
    }

    /// Installs a new internal root over the old root and a freshly split
    /// sibling, then updates the header.
    fn grow_root(&self, ctx: &mut Context, key: Key, right_child: PageId) -> Result<()> {
        let mut root_guard = self.bpm.new_page_guarded()?;
        let new_root_id = root_guard.page_id();
        {
            let mut data = root_guard.data_mut();
            let mut root = InternalPage::new(&mut data[..]);
            root.init(self.internal_max_size);
            root.populate_root(ctx.root_page_id, key, right_child);
        }

        let header_guard = ctx
            .header
            .as_mut()
            .expect("header latch must be held for root growth");
        HeaderPage::new(header_guard.data_mut()).set_root_page_id(new_root_id);
        debug!("root grew to {}", new_root_id);
        ctx.root_page_id = new_root_id;
        Ok(())
    }

    /*****************************************************************
     * DELETE
     *****************************************************************/

    /// Removes a key. Deleting an absent key is a silent no-op.
    pub fn remove(&self, key: Key) -> Result<()> {
        let mut ctx = Context::default();
        let header_guard = self.bpm.fetch_page_write(self.header_page_id)?;
        ctx.root_page_id = HeaderPageRef::new(header_guard.data()).root_page_id();
        ctx.header = Some(header_guard);

        if ctx.root_page_id == INVALID_PAGE_ID {
            return Ok(());
        }

        self.traverse_write(&mut ctx, key, TreeOp::Delete)?;

        let mut child_guard = ctx
            .write_set
            .pop_back()
            .expect("write descent must end at a leaf");

        {
            let present = LeafPageRef::new(child_guard.data())
                .lookup_index(&self.comparator, key)
                .is_some();
            if !present {
                return Ok(());
            }
            let mut leaf = LeafPage::new(child_guard.data_mut());
            leaf.remove(&self.comparator, key);
        }

        if ctx.is_root(child_guard.page_id()) {
            if LeafPageRef::new(child_guard.data()).size() == 0 {
                let old_root = child_guard.page_id();
                self.collapse_root(&mut ctx, INVALID_PAGE_ID)?;
                drop(child_guard);
                self.reclaim_page(old_root);
            }
            return Ok(());
        }

        // The leaf underflowed iff ancestors were retained; the first
        // iteration rebalances the leaf layer, the rest handle internal
        // underflow only.
        let mut leaf_layer = true;
        while let Some(mut parent_guard) = ctx.write_set.pop_back() {
            let parent_page_id = parent_guard.page_id();
            let (search_index, left_id, right_id) = {
                let parent = InternalPageRef::new(parent_guard.data());
                let si = parent.search_index(&self.comparator, key);
                (si, parent.child_at(si - 1), parent.child_at(si))
            };

            let child_is_left = child_guard.page_id() == left_id;
            let sibling_id = if child_is_left { right_id } else { left_id };
            let sibling_guard = self.bpm.fetch_page_write(sibling_id)?;
            let (mut left_guard, mut right_guard) = if child_is_left {
                (child_guard, sibling_guard)
            } else {
                (sibling_guard, child_guard)
            };

            let merged = if leaf_layer {
                self.rebalance_leaf(
                    &mut parent_guard,
                    &mut left_guard,
                    &mut right_guard,
                    search_index,
                )
            } else {
                self.rebalance_internal(
                    &mut parent_guard,
                    &mut left_guard,
                    &mut right_guard,
                    search_index,
                )
            };

            if !merged {
                return Ok(());
            }

            let right_page_id = right_guard.page_id();
            drop(left_guard);
            drop(right_guard);

            let (collapses, only_child) = {
                let parent = InternalPageRef::new(parent_guard.data());
                (parent.size() < 2, parent.child_at(0))
            };
            if ctx.is_root(parent_page_id) && collapses {
                self.collapse_root(&mut ctx, only_child)?;
                drop(parent_guard);
                self.reclaim_page(right_page_id);
                self.reclaim_page(parent_page_id);
                return Ok(());
            }

            child_guard = parent_guard;
            leaf_layer = false;
            self.reclaim_page(right_page_id);
        }

        Ok(())
    }

    /// Returns an unlinked page to the pool. A reader that pinned the page
    /// before it became unreachable may still be draining its pin; in that
    /// case the page is simply left to normal eviction.
    fn reclaim_page(&self, page_id: PageId) {
        if let Err(e) = self.bpm.delete_page(page_id) {
            debug!("unlinked page {} still pinned, leaving to eviction: {}", page_id, e);
        }
    }

    /// Redistributes or merges two leaf siblings. Returns true if they
    /// merged (the separator was removed and underflow may propagate).
    fn rebalance_leaf(
        &self,
        parent_guard: &mut WritePageGuard,
        left_guard: &mut WritePageGuard,
        right_guard: &mut WritePageGuard,
        search_index: usize,
    ) -> bool {
        let (lsize, rsize, min) = {
            let left = LeafPageRef::new(left_guard.data());
            let right = LeafPageRef::new(right_guard.data());
            (left.size(), right.size(), left.min_size())
        };

        if lsize > min || rsize > min {
            let up_key = {
                let mut left = LeafPage::new(left_guard.data_mut());
                let mut right = LeafPage::new(right_guard.data_mut());
                left.redistribute(&mut right)
            };
            let mut parent = InternalPage::new(parent_guard.data_mut());
            parent.set_key_at(search_index, up_key);
            return false;
        }

        let (entries, right_next) = {
            let mut right = LeafPage::new(right_guard.data_mut());
            let next = right.next_page_id();
            (right.take_entries(), next)
        };
        {
            let mut left = LeafPage::new(left_guard.data_mut());
            left.append_entries(&entries);
            left.set_next_page_id(right_next);
        }
        let mut parent = InternalPage::new(parent_guard.data_mut());
        parent.remove_at(search_index);
        debug!("leaf {} merged into {}", right_guard.page_id(), left_guard.page_id());
        true
    }

    /// Redistributes or merges two internal siblings, routing the parent
    /// separator down. Returns true if they merged.
    fn rebalance_internal(
        &self,
        parent_guard: &mut WritePageGuard,
        left_guard: &mut WritePageGuard,
        right_guard: &mut WritePageGuard,
        search_index: usize,
    ) -> bool {
        let separator = InternalPageRef::new(parent_guard.data()).key_at(search_index);
        let (lsize, rsize, min) = {
            let left = InternalPageRef::new(left_guard.data());
            let right = InternalPageRef::new(right_guard.data());
            (left.size(), right.size(), left.min_size())
        };

        if lsize > min || rsize > min {
            let up_key = {
                let mut left = InternalPage::new(left_guard.data_mut());
                let mut right = InternalPage::new(right_guard.data_mut());
                left.redistribute(&mut right, separator)
            };
            let mut parent = InternalPage::new(parent_guard.data_mut());
            parent.set_key_at(search_index, up_key);
            return false;
        }

        let entries = {
            let mut right = InternalPage::new(right_guard.data_mut());
            right.take_entries()
        };
        {
            let mut left = InternalPage::new(left_guard.data_mut());
            left.merge(separator, &entries);
        }
        let mut parent = InternalPage::new(parent_guard.data_mut());
        parent.remove_at(search_index);
        debug!(
            "internal {} merged into {}",
            right_guard.page_id(),
            left_guard.page_id()
        );
        true
    }

    /// Rebinds the header's root pointer during a root collapse.
    fn collapse_root(&self, ctx: &mut Context, new_root: PageId) -> Result<()> {
        let header_guard = ctx
            .header
            .as_mut()
            .expect("header latch must be held for root collapse");
        HeaderPage::new(header_guard.data_mut()).set_root_page_id(new_root);
        debug!("root collapsed to {}", new_root);
        ctx.root_page_id = new_root;
        Ok(())
    }

    /*****************************************************************
     * DESCENT
     *****************************************************************/

    /// Walks from the root to the leaf covering `key` with exclusive
    /// latches, releasing all ancestors (header included) whenever the
    /// just-latched node is safe for `op`.
    fn traverse_write(&self, ctx: &mut Context, key: Key, op: TreeOp) -> Result<()> {
        let mut page_id = ctx.root_page_id;
        loop {
            let guard = self.bpm.fetch_page_write(page_id)?;

            let (is_leaf, safe, next) = {
                let node = BTreePageRef::new(guard.data());
                let is_leaf = node.is_leaf();
                let safe = Self::is_safe(&node, op, ctx.is_root(page_id));
                let next = if is_leaf {
                    None
                } else {
                    let internal = InternalPageRef::new(guard.data());
                    debug_assert!(internal.size() >= 2);
                    Some(internal.child_for(&self.comparator, key))
                };
                (is_leaf, safe, next)
            };

            if safe {
                ctx.release_ancestors();
            }
            ctx.write_set.push_back(guard);

            if is_leaf {
                return Ok(());
            }
            page_id = next.expect("internal node routed to no child");
        }
    }

    /// A node is safe when the pending operation cannot propagate a split
    /// or merge past it.
    fn is_safe(node: &BTreePageRef<'_>, op: TreeOp, is_root: bool) -> bool {
        let size = node.size();
        let max = node.max_size();
        match op {
            // a post-insert size below max means no split
            TreeOp::Insert => {
                if node.is_leaf() {
                    size < max - 1
                } else {
                    size < max
                }
            }
            // a post-delete size at or above min means no merge
            TreeOp::Delete => {
                if is_root {
                    if node.is_leaf() {
                        size > 1
                    } else {
                        size > 2
                    }
                } else if node.is_leaf() {
                    size > max / 2
                } else {
                    size > (max + 1) / 2
                }
            }
        }
    }

    /*****************************************************************
     * ITERATION
     *****************************************************************/

    /// Iterator positioned at the first key of the tree.
    pub fn begin(&self) -> Result<BTreeIterator> {
        let header_guard = self.bpm.fetch_page_read(self.header_page_id)?;
        let root_id = HeaderPageRef::new(header_guard.data()).root_page_id();
        if root_id == INVALID_PAGE_ID {
            return Ok(BTreeIterator::end(Arc::clone(&self.bpm)));
        }

        let mut guard = self.bpm.fetch_page_read(root_id)?;
        drop(header_guard);

        loop {
            if BTreePageRef::new(guard.data()).is_leaf() {
                break;
            }
            let child = InternalPageRef::new(guard.data()).child_at(0);
            guard = self.bpm.fetch_page_read(child)?;
        }

        Ok(BTreeIterator::new(Arc::clone(&self.bpm), guard, 0))
    }

    /// Iterator positioned at `key`, or the end sentinel if the key is
    /// absent.
    pub fn begin_at(&self, key: Key) -> Result<BTreeIterator> {
        let header_guard = self.bpm.fetch_page_read(self.header_page_id)?;
        let root_id = HeaderPageRef::new(header_guard.data()).root_page_id();
        if root_id == INVALID_PAGE_ID {
            return Ok(BTreeIterator::end(Arc::clone(&self.bpm)));
        }

        let mut guard = self.bpm.fetch_page_read(root_id)?;
        drop(header_guard);

        loop {
            if BTreePageRef::new(guard.data()).is_leaf() {
                break;
            }
            let child = InternalPageRef::new(guard.data()).child_for(&self.comparator, key);
            guard = self.bpm.fetch_page_read(child)?;
        }

        let index = LeafPageRef::new(guard.data()).lookup_index(&self.comparator, key);
        match index {
            Some(index) => Ok(BTreeIterator::new(Arc::clone(&self.bpm), guard, index)),
            None => Ok(BTreeIterator::end(Arc::clone(&self.bpm))),
        }
    }

    /// The end sentinel iterator.
    pub fn end(&self) -> BTreeIterator {
        BTreeIterator::end(Arc::clone(&self.bpm))
    }

    /*****************************************************************
     * DEBUG
     *****************************************************************/

    /// Renders the tree structure as an indented outline, one node per
    /// line. For tests and debugging.
    pub fn draw(&self) -> Result<String> {
        let root_id = self.root_page_id()?;
        if root_id == INVALID_PAGE_ID {
            return Ok("()".to_string());
        }
        let mut out = String::new();
        self.draw_node(root_id, 0, &mut out)?;
        Ok(out)
    }

    fn draw_node(&self, page_id: PageId, depth: usize, out: &mut String) -> Result<()> {
        let guard = self.bpm.fetch_page_basic(page_id)?;
        let data = guard.data();

        let indent = "  ".repeat(depth);
        if BTreePageRef::new(&data[..]).is_leaf() {
            let leaf = LeafPageRef::new(&data[..]);
            let keys: Vec<String> = (0..leaf.size()).map(|i| leaf.key_at(i).to_string()).collect();
            let _ = writeln!(out, "{}leaf {} ({})", indent, page_id, keys.join(","));
        } else {
            let node = InternalPageRef::new(&data[..]);
            let keys: Vec<String> = (1..node.size()).map(|i| node.key_at(i).to_string()).collect();
            let _ = writeln!(out, "{}internal {} ({})", indent, page_id, keys.join(","));
            let children: Vec<PageId> = (0..node.size()).map(|i| node.child_at(i)).collect();
            drop(data);
            drop(guard);
            for child in children {
                self.draw_node(child, depth + 1, out)?;
            }
        }
        Ok(())
    }
}
