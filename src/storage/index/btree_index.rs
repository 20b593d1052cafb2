use std::cmp::Ordering;
use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::Ordering as AtomicOrdering;
use std::sync::Arc;

use log::debug;
use parking_lot::{RwLock, RwLockWriteGuard};

use crate::buffer::{
    AtomicPageId, BufferPoolManager, PageId, WritePageGuard, INVALID_PAGE_ID,
};
use crate::config::BTreeConfig;
use crate::error::{CrabTreeError, CrabTreeResult};
use crate::storage::codec::{
    BPlusTreeInternalPageCodec, BPlusTreeLeafPageCodec, BPlusTreePageCodec, HeaderPageCodec,
    IndexKeyCodec,
};
use crate::storage::index::btree_iterator::TreeIndexIterator;
use crate::storage::index::comparator::KeyComparator;
use crate::storage::page::{
    BPlusTreeInternalPage, BPlusTreeLeafPage, BPlusTreePage, HeaderPage, RecordId,
};

/// Write operations crab down with different safety predicates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteMode {
    Insert,
    Delete,
}

/// A node is safe when the pending operation cannot restructure it: an
/// insert below it cannot split it, a delete cannot underflow it. Once a
/// safe node is latched, every ancestor latch can go.
fn is_node_safe(page: &BPlusTreePage, mode: WriteMode) -> bool {
    match mode {
        WriteMode::Insert => page.current_size() < page.max_size() - 1,
        WriteMode::Delete => page.current_size() > page.min_size(),
    }
}

/// Per-operation scratch state: the latched ancestor chain, whether the
/// tree root latch is still held, and the pages to free at commit.
struct Context<'a> {
    root_latch: Option<RwLockWriteGuard<'a, ()>>,
    write_set: VecDeque<WritePageGuard>,
    deleted_pages: Vec<PageId>,
}

impl<'a> Context<'a> {
    fn new() -> Self {
        Self {
            root_latch: None,
            write_set: VecDeque::new(),
            deleted_pages: Vec::new(),
        }
    }

    /// Release every ancestor latch, including the tree root latch.
    fn release_ancestors(&mut self) {
        self.write_set.clear();
        self.root_latch = None;
    }
}

/// A concurrent, disk-backed B+ tree mapping byte-string keys to record
/// ids. Keys are unique. Readers crab down with shared latches; writers
/// crab down with exclusive latches and keep the unsafe ancestor chain
/// latched until commit.
#[derive(Debug)]
pub struct BPlusTreeIndex {
    pub index_name: String,
    pub buffer_pool: Arc<BufferPoolManager>,
    pub comparator: KeyComparator,
    pub leaf_max_size: u32,
    pub internal_max_size: u32,
    header_page_id: PageId,
    root_page_id: AtomicPageId,
    // guards root_page_id against concurrent root swaps
    root_latch: RwLock<()>,
}

impl BPlusTreeIndex {
    /// Create a new index with a fresh header page.
    pub fn new(
        index_name: impl Into<String>,
        buffer_pool: Arc<BufferPoolManager>,
        comparator: KeyComparator,
        leaf_max_size: u32,
        internal_max_size: u32,
    ) -> CrabTreeResult<Self> {
        let mut header_guard = buffer_pool.new_page()?;
        let header_page_id = header_guard.page_id();
        header_guard.overwrite(&HeaderPageCodec::encode(&HeaderPage::new()));
        drop(header_guard);

        Ok(Self {
            index_name: index_name.into(),
            buffer_pool,
            comparator,
            leaf_max_size,
            internal_max_size,
            header_page_id,
            root_page_id: AtomicPageId::new(INVALID_PAGE_ID),
            root_latch: RwLock::new(()),
        })
    }

    pub fn new_with_config(
        index_name: impl Into<String>,
        buffer_pool: Arc<BufferPoolManager>,
        comparator: KeyComparator,
        config: BTreeConfig,
    ) -> CrabTreeResult<Self> {
        Self::new(
            index_name,
            buffer_pool,
            comparator,
            config.leaf_max_size,
            config.internal_max_size,
        )
    }

    /// Re-attach to an index whose root id is recorded in an existing
    /// header page.
    pub fn open(
        index_name: impl Into<String>,
        buffer_pool: Arc<BufferPoolManager>,
        comparator: KeyComparator,
        leaf_max_size: u32,
        internal_max_size: u32,
        header_page_id: PageId,
    ) -> CrabTreeResult<Self> {
        let index_name = index_name.into();
        let root_page_id = {
            let guard = buffer_pool.fetch_page_read(header_page_id)?;
            let (header, _) = HeaderPageCodec::decode(guard.data())?;
            header.get_record(&index_name).unwrap_or(INVALID_PAGE_ID)
        };

        Ok(Self {
            index_name,
            buffer_pool,
            comparator,
            leaf_max_size,
            internal_max_size,
            header_page_id,
            root_page_id: AtomicPageId::new(root_page_id),
            root_latch: RwLock::new(()),
        })
    }

    pub fn header_page_id(&self) -> PageId {
        self.header_page_id
    }

    pub fn root_page_id(&self) -> PageId {
        self.root_page_id.load(AtomicOrdering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.root_page_id() == INVALID_PAGE_ID
    }

    /// Point lookup. Crabs down with shared latches, holding at most two
    /// page latches at a time.
    pub fn get(&self, key: &[u8]) -> CrabTreeResult<Option<RecordId>> {
        let root_latch = self.root_latch.read();
        let root_page_id = self.root_page_id();
        if root_page_id == INVALID_PAGE_ID {
            return Ok(None);
        }
        let mut root_latch = Some(root_latch);

        let mut guard = self.buffer_pool.fetch_page_read(root_page_id)?;
        let (mut page, _) = BPlusTreePageCodec::decode(guard.data())?;
        loop {
            match page {
                BPlusTreePage::Leaf(ref leaf) => {
                    return Ok(leaf.lookup(key, self.comparator));
                }
                BPlusTreePage::Internal(ref internal) => {
                    let child_page_id = internal.lookup(key, self.comparator);
                    let child_guard = self.buffer_pool.fetch_page_read(child_page_id)?;
                    let (child_page, _) = BPlusTreePageCodec::decode(child_guard.data())?;
                    // child latched: drop the parent latch and the root latch
                    guard = child_guard;
                    page = child_page;
                    root_latch.take();
                }
            }
        }
    }

    /// Insert a unique key. Returns false when the key is already present.
    pub fn insert(&self, key: &[u8], rid: RecordId) -> CrabTreeResult<bool> {
        let mut ctx = Context::new();
        ctx.root_latch = Some(self.root_latch.write());

        if self.is_empty() {
            self.start_new_tree(key, rid)?;
            return self.finish(ctx).map(|_| true);
        }

        let (mut leaf_guard, mut leaf) = self.find_leaf_page(key, WriteMode::Insert, &mut ctx)?;
        let old_size = leaf.header.current_size;
        let new_size = leaf.insert(key, rid, self.comparator);
        if new_size == old_size {
            drop(leaf_guard);
            return self.finish(ctx).map(|_| false);
        }

        if new_size == leaf.header.max_size {
            let mut sibling_guard = self.buffer_pool.new_page()?;
            let sibling_page_id = sibling_guard.page_id();
            let mut sibling = BPlusTreeLeafPage::new(
                sibling_page_id,
                leaf.header.parent_page_id,
                self.leaf_max_size,
            );
            leaf.move_half_to(&mut sibling);
            sibling.set_next_page_id(leaf.next_page_id());
            leaf.set_next_page_id(sibling_page_id);

            // copy-up: the sibling keeps its first key
            let middle_key = sibling.key_at(0).to_vec();
            let leaf_page_id = leaf_guard.page_id();
            let leaf_parent_id = leaf.header.parent_page_id;
            debug!(
                "split leaf {} into {} in index {:?}",
                leaf_page_id, sibling_page_id, self.index_name
            );

            leaf_guard.overwrite(&BPlusTreeLeafPageCodec::encode(&leaf));
            sibling_guard.overwrite(&BPlusTreeLeafPageCodec::encode(&sibling));
            drop(leaf_guard);
            drop(sibling_guard);

            self.insert_into_parent(
                leaf_page_id,
                leaf_parent_id,
                middle_key,
                sibling_page_id,
                &mut ctx,
            )?;
        } else {
            leaf_guard.overwrite(&BPlusTreeLeafPageCodec::encode(&leaf));
            drop(leaf_guard);
        }

        self.finish(ctx).map(|_| true)
    }

    /// Remove a key. Removing an absent key is a no-op.
    pub fn remove(&self, key: &[u8]) -> CrabTreeResult<()> {
        let mut ctx = Context::new();
        ctx.root_latch = Some(self.root_latch.write());

        if self.is_empty() {
            return self.finish(ctx);
        }

        let (mut leaf_guard, mut leaf) = self.find_leaf_page(key, WriteMode::Delete, &mut ctx)?;
        let old_size = leaf.header.current_size;
        let new_size = leaf.remove(key, self.comparator);
        if new_size == old_size {
            drop(leaf_guard);
            return self.finish(ctx);
        }
        leaf_guard.overwrite(&BPlusTreeLeafPageCodec::encode(&leaf));

        let leaf_page_id = leaf_guard.page_id();
        let leaf_page = BPlusTreePage::Leaf(leaf);
        if Self::node_underflows(&leaf_page) {
            if self.coalesce_or_redistribute(leaf_guard, &mut ctx)? {
                ctx.deleted_pages.push(leaf_page_id);
            }
        } else {
            drop(leaf_guard);
        }

        self.finish(ctx)
    }

    /// Iterator over the whole key range, positioned at the smallest key.
    pub fn begin(&self) -> CrabTreeResult<TreeIndexIterator> {
        let root_latch = self.root_latch.read();
        let root_page_id = self.root_page_id();
        if root_page_id == INVALID_PAGE_ID {
            return Ok(TreeIndexIterator::end(self.buffer_pool.clone()));
        }
        let mut root_latch = Some(root_latch);

        let mut guard = self.buffer_pool.fetch_page_read(root_page_id)?;
        let (mut page, _) = BPlusTreePageCodec::decode(guard.data())?;
        loop {
            match page {
                BPlusTreePage::Leaf(leaf) => {
                    return Ok(TreeIndexIterator::positioned(
                        self.buffer_pool.clone(),
                        guard.unlatch(),
                        leaf,
                        0,
                    ));
                }
                BPlusTreePage::Internal(ref internal) => {
                    let child_page_id = internal.value_at(0);
                    let child_guard = self.buffer_pool.fetch_page_read(child_page_id)?;
                    let (child_page, _) = BPlusTreePageCodec::decode(child_guard.data())?;
                    guard = child_guard;
                    page = child_page;
                    root_latch.take();
                }
            }
        }
    }

    /// Iterator positioned at the first key >= the probe key.
    pub fn begin_at(&self, key: &[u8]) -> CrabTreeResult<TreeIndexIterator> {
        let root_latch = self.root_latch.read();
        let root_page_id = self.root_page_id();
        if root_page_id == INVALID_PAGE_ID {
            return Ok(TreeIndexIterator::end(self.buffer_pool.clone()));
        }
        let mut root_latch = Some(root_latch);

        let mut guard = self.buffer_pool.fetch_page_read(root_page_id)?;
        let (mut page, _) = BPlusTreePageCodec::decode(guard.data())?;
        loop {
            match page {
                BPlusTreePage::Leaf(leaf) => {
                    let slot = leaf.key_index(key, self.comparator);
                    let at_end_of_leaf = slot >= leaf.header.current_size as usize;
                    let mut iter = TreeIndexIterator::positioned(
                        self.buffer_pool.clone(),
                        guard.unlatch(),
                        leaf,
                        slot,
                    );
                    if at_end_of_leaf {
                        iter.move_to_next_leaf()?;
                    }
                    return Ok(iter);
                }
                BPlusTreePage::Internal(ref internal) => {
                    let child_page_id = internal.lookup(key, self.comparator);
                    let child_guard = self.buffer_pool.fetch_page_read(child_page_id)?;
                    let (child_page, _) = BPlusTreePageCodec::decode(child_guard.data())?;
                    guard = child_guard;
                    page = child_page;
                    root_latch.take();
                }
            }
        }
    }

    /// The sentinel end iterator.
    pub fn end(&self) -> TreeIndexIterator {
        TreeIndexIterator::end(self.buffer_pool.clone())
    }

    /// Crab down to the leaf covering the key, exclusively latched. The
    /// latched ancestors that could still be restructured stay in the
    /// context's write set; everything above the deepest safe node has
    /// already been released.
    fn find_leaf_page(
        &self,
        key: &[u8],
        mode: WriteMode,
        ctx: &mut Context<'_>,
    ) -> CrabTreeResult<(WritePageGuard, BPlusTreeLeafPage)> {
        let root_page_id = self.root_page_id();
        let mut guard = self.buffer_pool.fetch_page_write(root_page_id)?;
        let (mut page, _) = BPlusTreePageCodec::decode(guard.data())?;
        loop {
            let internal = match page {
                BPlusTreePage::Leaf(leaf) => return Ok((guard, leaf)),
                BPlusTreePage::Internal(ref internal) => internal,
            };
            let child_page_id = internal.lookup(key, self.comparator);
            let child_guard = self.buffer_pool.fetch_page_write(child_page_id)?;
            let (child_page, _) = BPlusTreePageCodec::decode(child_guard.data())?;

            if is_node_safe(&child_page, mode) {
                ctx.release_ancestors();
                drop(guard);
            } else {
                ctx.write_set.push_back(guard);
            }
            guard = child_guard;
            page = child_page;
        }
    }

    fn start_new_tree(&self, key: &[u8], rid: RecordId) -> CrabTreeResult<()> {
        let mut guard = self.buffer_pool.new_page()?;
        let page_id = guard.page_id();
        let mut leaf = BPlusTreeLeafPage::new(page_id, INVALID_PAGE_ID, self.leaf_max_size);
        leaf.insert(key, rid, self.comparator);
        guard.overwrite(&BPlusTreeLeafPageCodec::encode(&leaf));
        drop(guard);

        self.root_page_id.store(page_id, AtomicOrdering::SeqCst);
        let first_root = {
            let header_guard = self.buffer_pool.fetch_page_read(self.header_page_id)?;
            let (header, _) = HeaderPageCodec::decode(header_guard.data())?;
            header.get_record(&self.index_name).is_none()
        };
        self.update_root_page_id(first_root)?;
        debug!(
            "started new tree for index {:?} with root {}",
            self.index_name, page_id
        );
        Ok(())
    }

    /// Link a freshly split right page into the parent of its left
    /// partner, splitting upward as needed. Both children are already
    /// written back and unlatched; parents are taken from the write set.
    fn insert_into_parent(
        &self,
        left_page_id: PageId,
        left_parent_id: PageId,
        middle_key: Vec<u8>,
        right_page_id: PageId,
        ctx: &mut Context<'_>,
    ) -> CrabTreeResult<()> {
        if left_parent_id == INVALID_PAGE_ID {
            // the left page was the root: grow the tree by one level
            if ctx.root_latch.is_none() {
                return Err(CrabTreeError::Internal(
                    "root latch lost before root split".to_string(),
                ));
            }
            let mut root_guard = self.buffer_pool.new_page()?;
            let new_root_id = root_guard.page_id();
            let mut new_root =
                BPlusTreeInternalPage::new(new_root_id, INVALID_PAGE_ID, self.internal_max_size);
            new_root.populate_new_root(left_page_id, middle_key, right_page_id);
            root_guard.overwrite(&BPlusTreeInternalPageCodec::encode(&new_root));
            drop(root_guard);

            for child_page_id in [left_page_id, right_page_id] {
                let mut child_guard = self.buffer_pool.fetch_page_write(child_page_id)?;
                let (mut child, _) = BPlusTreePageCodec::decode(child_guard.data())?;
                child.set_parent_page_id(new_root_id);
                child_guard.overwrite(&BPlusTreePageCodec::encode(&child));
            }

            self.root_page_id.store(new_root_id, AtomicOrdering::SeqCst);
            self.update_root_page_id(false)?;
            debug!(
                "grew index {:?} with new root {}",
                self.index_name, new_root_id
            );
            return Ok(());
        }

        let mut parent_guard = ctx.write_set.pop_back().ok_or_else(|| {
            CrabTreeError::Internal("ancestor latch missing during split".to_string())
        })?;
        if parent_guard.page_id() != left_parent_id {
            return Err(CrabTreeError::Internal(format!(
                "held ancestor {} does not match parent {}",
                parent_guard.page_id(),
                left_parent_id
            )));
        }
        let (mut parent, _) = BPlusTreeInternalPageCodec::decode(parent_guard.data())?;
        let new_size = parent.insert_after(left_page_id, middle_key, right_page_id)?;

        if new_size == parent.header.max_size {
            let mut sibling_guard = self.buffer_pool.new_page()?;
            let sibling_page_id = sibling_guard.page_id();
            let mut sibling = BPlusTreeInternalPage::new(
                sibling_page_id,
                parent.header.parent_page_id,
                self.internal_max_size,
            );
            parent.move_half_to(&mut sibling, &self.buffer_pool)?;

            // push-up: the sibling's slot-0 key moves to the grandparent
            let push_key = sibling.key_at(0).to_vec();
            let parent_page_id = parent_guard.page_id();
            let parent_parent_id = parent.header.parent_page_id;
            debug!(
                "split internal {} into {} in index {:?}",
                parent_page_id, sibling_page_id, self.index_name
            );

            parent_guard.overwrite(&BPlusTreeInternalPageCodec::encode(&parent));
            sibling_guard.overwrite(&BPlusTreeInternalPageCodec::encode(&sibling));
            drop(parent_guard);
            drop(sibling_guard);

            self.insert_into_parent(
                parent_page_id,
                parent_parent_id,
                push_key,
                sibling_page_id,
                ctx,
            )?;
        } else {
            parent_guard.overwrite(&BPlusTreeInternalPageCodec::encode(&parent));
        }
        Ok(())
    }

    /// Rebalance an underflowed node. Returns true when the caller must
    /// mark the node for deferred deletion.
    fn coalesce_or_redistribute(
        &self,
        node_guard: WritePageGuard,
        ctx: &mut Context<'_>,
    ) -> CrabTreeResult<bool> {
        let (node_page, _) = BPlusTreePageCodec::decode(node_guard.data())?;
        if node_page.parent_page_id() == INVALID_PAGE_ID {
            return self.adjust_root(node_guard, node_page, ctx);
        }

        let parent_guard = ctx.write_set.pop_back().ok_or_else(|| {
            CrabTreeError::Internal("ancestor latch missing during rebalance".to_string())
        })?;
        let (parent, _) = BPlusTreeInternalPageCodec::decode(parent_guard.data())?;
        let node_index = parent.value_index(node_guard.page_id()).ok_or_else(|| {
            CrabTreeError::Internal(format!(
                "node {} not found in parent {}",
                node_guard.page_id(),
                parent_guard.page_id()
            ))
        })?;

        let mut left_sibling = if node_index > 0 {
            let guard = self
                .buffer_pool
                .fetch_page_write(parent.value_at(node_index - 1))?;
            let (page, _) = BPlusTreePageCodec::decode(guard.data())?;
            Some((guard, page))
        } else {
            None
        };
        let mut right_sibling = if node_index + 1 < parent.header.current_size as usize {
            let guard = self
                .buffer_pool
                .fetch_page_write(parent.value_at(node_index + 1))?;
            let (page, _) = BPlusTreePageCodec::decode(guard.data())?;
            Some((guard, page))
        } else {
            None
        };

        let max_size = node_page.max_size();

        // coalescing prefers the left sibling; the left of the pair survives
        if let Some((left_guard, left_page)) = left_sibling.take() {
            if node_page.current_size() + left_page.current_size() < max_size {
                drop(right_sibling);
                self.coalesce(
                    left_guard,
                    left_page,
                    node_guard,
                    node_page,
                    parent_guard,
                    parent,
                    node_index,
                    ctx,
                )?;
                return Ok(true);
            }
            left_sibling = Some((left_guard, left_page));
        }
        if let Some((right_guard, right_page)) = right_sibling.take() {
            if node_page.current_size() + right_page.current_size() < max_size {
                drop(left_sibling);
                let right_page_id = right_guard.page_id();
                self.coalesce(
                    node_guard,
                    node_page,
                    right_guard,
                    right_page,
                    parent_guard,
                    parent,
                    node_index + 1,
                    ctx,
                )?;
                ctx.deleted_pages.push(right_page_id);
                return Ok(false);
            }
            right_sibling = Some((right_guard, right_page));
        }

        // otherwise borrow one entry, preferring the left sibling
        if let Some((left_guard, left_page)) = left_sibling.take() {
            drop(right_sibling);
            self.redistribute(
                left_guard,
                left_page,
                node_guard,
                node_page,
                parent_guard,
                parent,
                node_index,
                true,
            )?;
            return Ok(false);
        }
        if let Some((right_guard, right_page)) = right_sibling.take() {
            self.redistribute(
                right_guard,
                right_page,
                node_guard,
                node_page,
                parent_guard,
                parent,
                node_index,
                false,
            )?;
            return Ok(false);
        }

        Err(CrabTreeError::Internal(format!(
            "underflowed node {} has no siblings",
            node_guard.page_id()
        )))
    }

    /// Merge the right page of the pair into the left one and drop its
    /// separator from the parent, rebalancing the parent when it
    /// underflows in turn. `right_index` is the right page's slot in the
    /// parent. The caller marks the right page for deferred deletion.
    #[allow(clippy::too_many_arguments)]
    fn coalesce(
        &self,
        mut left_guard: WritePageGuard,
        mut left_page: BPlusTreePage,
        mut right_guard: WritePageGuard,
        mut right_page: BPlusTreePage,
        mut parent_guard: WritePageGuard,
        mut parent: BPlusTreeInternalPage,
        right_index: usize,
        ctx: &mut Context<'_>,
    ) -> CrabTreeResult<()> {
        debug!(
            "coalescing page {} into {} in index {:?}",
            right_guard.page_id(),
            left_guard.page_id(),
            self.index_name
        );
        match (&mut left_page, &mut right_page) {
            (BPlusTreePage::Leaf(left), BPlusTreePage::Leaf(right)) => {
                right.move_all_to(left);
            }
            (BPlusTreePage::Internal(left), BPlusTreePage::Internal(right)) => {
                let middle_key = parent.key_at(right_index).to_vec();
                right.move_all_to(left, middle_key, &self.buffer_pool)?;
            }
            _ => {
                return Err(CrabTreeError::Internal(
                    "cannot merge a leaf page with an internal page".to_string(),
                ))
            }
        }
        left_guard.overwrite(&BPlusTreePageCodec::encode(&left_page));
        right_guard.overwrite(&BPlusTreePageCodec::encode(&right_page));
        // release the pair before touching the parent chain; the parent
        // latch keeps the subtree unreachable
        drop(left_guard);
        drop(right_guard);

        parent.remove(right_index);
        parent_guard.overwrite(&BPlusTreeInternalPageCodec::encode(&parent));

        if Self::node_underflows(&BPlusTreePage::Internal(parent)) {
            let parent_page_id = parent_guard.page_id();
            if self.coalesce_or_redistribute(parent_guard, ctx)? {
                ctx.deleted_pages.push(parent_page_id);
            }
        }
        Ok(())
    }

    /// Move one entry from a sibling into the underflowed node and patch
    /// the parent separator.
    #[allow(clippy::too_many_arguments)]
    fn redistribute(
        &self,
        mut sibling_guard: WritePageGuard,
        mut sibling_page: BPlusTreePage,
        mut node_guard: WritePageGuard,
        mut node_page: BPlusTreePage,
        mut parent_guard: WritePageGuard,
        mut parent: BPlusTreeInternalPage,
        node_index: usize,
        sibling_is_left: bool,
    ) -> CrabTreeResult<()> {
        debug!(
            "redistributing from page {} into {} in index {:?}",
            sibling_guard.page_id(),
            node_guard.page_id(),
            self.index_name
        );
        match (&mut sibling_page, &mut node_page) {
            (BPlusTreePage::Leaf(sibling), BPlusTreePage::Leaf(node)) => {
                if sibling_is_left {
                    sibling.move_last_to_front_of(node);
                    parent.set_key_at(node_index, node.key_at(0).to_vec());
                } else {
                    sibling.move_first_to_end_of(node);
                    parent.set_key_at(node_index + 1, sibling.key_at(0).to_vec());
                }
            }
            (BPlusTreePage::Internal(sibling), BPlusTreePage::Internal(node)) => {
                if sibling_is_left {
                    let middle_key = parent.key_at(node_index).to_vec();
                    let new_separator = sibling
                        .key_at(sibling.header.current_size as usize - 1)
                        .to_vec();
                    sibling.move_last_to_front_of(node, middle_key, &self.buffer_pool)?;
                    parent.set_key_at(node_index, new_separator);
                } else {
                    let middle_key = parent.key_at(node_index + 1).to_vec();
                    let new_separator = sibling.key_at(1).to_vec();
                    sibling.move_first_to_end_of(node, middle_key, &self.buffer_pool)?;
                    parent.set_key_at(node_index + 1, new_separator);
                }
            }
            _ => {
                return Err(CrabTreeError::Internal(
                    "cannot redistribute between a leaf page and an internal page".to_string(),
                ))
            }
        }
        sibling_guard.overwrite(&BPlusTreePageCodec::encode(&sibling_page));
        node_guard.overwrite(&BPlusTreePageCodec::encode(&node_page));
        parent_guard.overwrite(&BPlusTreeInternalPageCodec::encode(&parent));
        Ok(())
    }

    /// Handle underflow at the root: an internal root with one child is
    /// collapsed, an empty leaf root empties the tree. Returns true when
    /// the old root must be marked for deferred deletion.
    fn adjust_root(
        &self,
        root_guard: WritePageGuard,
        root_page: BPlusTreePage,
        ctx: &Context<'_>,
    ) -> CrabTreeResult<bool> {
        if ctx.root_latch.is_none() {
            return Err(CrabTreeError::Internal(
                "root latch lost before root adjustment".to_string(),
            ));
        }
        match root_page {
            BPlusTreePage::Internal(mut internal) if internal.header.current_size == 1 => {
                let child_page_id = internal.remove_and_return_only_child();
                self.root_page_id
                    .store(child_page_id, AtomicOrdering::SeqCst);
                self.update_root_page_id(false)?;
                drop(root_guard);

                let mut child_guard = self.buffer_pool.fetch_page_write(child_page_id)?;
                let (mut child, _) = BPlusTreePageCodec::decode(child_guard.data())?;
                child.set_parent_page_id(INVALID_PAGE_ID);
                child_guard.overwrite(&BPlusTreePageCodec::encode(&child));
                debug!(
                    "collapsed root of index {:?} into page {}",
                    self.index_name, child_page_id
                );
                Ok(true)
            }
            BPlusTreePage::Leaf(ref leaf) if leaf.header.current_size == 0 => {
                self.root_page_id
                    .store(INVALID_PAGE_ID, AtomicOrdering::SeqCst);
                self.update_root_page_id(false)?;
                drop(root_guard);
                debug!("index {:?} is now empty", self.index_name);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// A root underflows only when it must be collapsed; other nodes
    /// underflow below half occupancy.
    fn node_underflows(page: &BPlusTreePage) -> bool {
        if page.parent_page_id() == INVALID_PAGE_ID {
            match page {
                BPlusTreePage::Leaf(leaf) => leaf.header.current_size == 0,
                BPlusTreePage::Internal(internal) => internal.header.current_size == 1,
            }
        } else {
            page.current_size() < page.min_size()
        }
    }

    /// Commit: drop every held latch and pin, then free the pages marked
    /// for deletion. A deferred page still pinned at this point is a bug.
    fn finish(&self, mut ctx: Context<'_>) -> CrabTreeResult<()> {
        ctx.write_set.clear();
        ctx.root_latch = None;
        let deleted_pages = std::mem::take(&mut ctx.deleted_pages);
        for page_id in deleted_pages {
            if !self.buffer_pool.delete_page(page_id)? {
                return Err(CrabTreeError::Internal(format!(
                    "deferred deletion of page {} found it still pinned",
                    page_id
                )));
            }
        }
        Ok(())
    }

    /// Persist the root page id into the header page, inserting the
    /// record on first root creation and updating it afterwards.
    fn update_root_page_id(&self, insert_record: bool) -> CrabTreeResult<()> {
        let mut guard = self.buffer_pool.fetch_page_write(self.header_page_id)?;
        let (mut header, _) = HeaderPageCodec::decode(guard.data())?;
        let root_page_id = self.root_page_id();
        let updated = if insert_record {
            header.insert_record(&self.index_name, root_page_id)
        } else {
            header.update_record(&self.index_name, root_page_id)
        };
        if !updated {
            return Err(CrabTreeError::Internal(format!(
                "header record bookkeeping failed for index {:?}",
                self.index_name
            )));
        }
        guard.overwrite(&HeaderPageCodec::encode(&header));
        Ok(())
    }

    /// Insert keys read from a whitespace-separated file of decimal
    /// integers; each key maps to an identity record id.
    pub fn insert_from_file(&self, path: impl AsRef<Path>) -> CrabTreeResult<()> {
        let content = std::fs::read_to_string(path)?;
        for token in content.split_whitespace() {
            let value: i64 = token.parse().map_err(|e| {
                CrabTreeError::Internal(format!("invalid key {:?} in key file: {}", token, e))
            })?;
            let key = IndexKeyCodec::encode_i64(value);
            self.insert(&key, RecordId::new(value as u32, value as u32))?;
        }
        Ok(())
    }

    /// Remove keys read from a whitespace-separated file of decimal
    /// integers.
    pub fn remove_from_file(&self, path: impl AsRef<Path>) -> CrabTreeResult<()> {
        let content = std::fs::read_to_string(path)?;
        for token in content.split_whitespace() {
            let value: i64 = token.parse().map_err(|e| {
                CrabTreeError::Internal(format!("invalid key {:?} in key file: {}", token, e))
            })?;
            let key = IndexKeyCodec::encode_i64(value);
            self.remove(&key)?;
        }
        Ok(())
    }

    /// Walk the whole tree checking its structural invariants: uniform
    /// leaf depth, sorted keys, separator bounds, size bounds, parent
    /// pointers, and the leaf chain. Intended for tests and debugging.
    pub fn verify_integrity(&self) -> CrabTreeResult<()> {
        let _root_latch = self.root_latch.read();
        let root_page_id = self.root_page_id();
        if root_page_id == INVALID_PAGE_ID {
            return Ok(());
        }

        let mut leaves = Vec::new();
        let mut keys: Vec<Vec<u8>> = Vec::new();
        self.verify_subtree(root_page_id, INVALID_PAGE_ID, None, None, 0, &mut leaves, &mut keys)?;

        if let Some(&(_, _, first_depth)) = leaves.first() {
            if leaves.iter().any(|&(_, _, depth)| depth != first_depth) {
                return Err(CrabTreeError::Internal(
                    "leaves are not all at the same depth".to_string(),
                ));
            }
        }
        for pair in keys.windows(2) {
            if (self.comparator)(pair[0].as_slice(), pair[1].as_slice()) != Ordering::Less {
                return Err(CrabTreeError::Internal(
                    "keys are not globally ascending".to_string(),
                ));
            }
        }
        for (i, &(page_id, next_page_id, _)) in leaves.iter().enumerate() {
            let expected = if i + 1 < leaves.len() {
                leaves[i + 1].0
            } else {
                INVALID_PAGE_ID
            };
            if next_page_id != expected {
                return Err(CrabTreeError::Internal(format!(
                    "leaf chain broken at page {}: next is {}, expected {}",
                    page_id, next_page_id, expected
                )));
            }
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn verify_subtree(
        &self,
        page_id: PageId,
        expected_parent: PageId,
        lower: Option<&[u8]>,
        upper: Option<&[u8]>,
        depth: usize,
        leaves: &mut Vec<(PageId, PageId, usize)>,
        keys: &mut Vec<Vec<u8>>,
    ) -> CrabTreeResult<()> {
        let guard = self.buffer_pool.fetch_page_read(page_id)?;
        let (page, _) = BPlusTreePageCodec::decode(guard.data())?;
        drop(guard);

        if page.page_id() != page_id {
            return Err(CrabTreeError::Internal(format!(
                "page {} stores page id {}",
                page_id,
                page.page_id()
            )));
        }
        if page.parent_page_id() != expected_parent {
            return Err(CrabTreeError::Internal(format!(
                "page {} stores parent {}, expected {}",
                page_id,
                page.parent_page_id(),
                expected_parent
            )));
        }

        let is_root = expected_parent == INVALID_PAGE_ID;
        let size = page.current_size();
        if size > page.max_size() - 1 {
            return Err(CrabTreeError::Internal(format!(
                "page {} holds {} slots, above the steady-state cap",
                page_id, size
            )));
        }
        if !is_root && size < page.min_size() {
            return Err(CrabTreeError::Internal(format!(
                "page {} holds {} slots, below half occupancy",
                page_id, size
            )));
        }

        let in_bounds = |key: &[u8]| -> bool {
            if let Some(lower) = lower {
                if (self.comparator)(key, lower) == Ordering::Less {
                    return false;
                }
            }
            if let Some(upper) = upper {
                if (self.comparator)(key, upper) != Ordering::Less {
                    return false;
                }
            }
            true
        };

        match page {
            BPlusTreePage::Leaf(leaf) => {
                for (key, _) in leaf.array.iter() {
                    if !in_bounds(key) {
                        return Err(CrabTreeError::Internal(format!(
                            "leaf {} holds a key outside its separator bounds",
                            page_id
                        )));
                    }
                }
                leaves.push((page_id, leaf.header.next_page_id, depth));
                keys.extend(leaf.array.iter().map(|(key, _)| key.clone()));
            }
            BPlusTreePage::Internal(internal) => {
                if is_root && size < 2 {
                    return Err(CrabTreeError::Internal(format!(
                        "internal root {} has fewer than two children",
                        page_id
                    )));
                }
                for i in 1..internal.array.len() {
                    if !in_bounds(internal.key_at(i)) {
                        return Err(CrabTreeError::Internal(format!(
                            "internal {} holds a separator outside its bounds",
                            page_id
                        )));
                    }
                    if i > 1
                        && (self.comparator)(internal.key_at(i - 1), internal.key_at(i))
                            != Ordering::Less
                    {
                        return Err(CrabTreeError::Internal(format!(
                            "internal {} separators are not strictly increasing",
                            page_id
                        )));
                    }
                }
                for i in 0..internal.array.len() {
                    let child_lower = if i == 0 {
                        lower
                    } else {
                        Some(internal.key_at(i))
                    };
                    let child_upper = if i + 1 < internal.array.len() {
                        Some(internal.key_at(i + 1))
                    } else {
                        upper
                    };
                    self.verify_subtree(
                        internal.value_at(i),
                        page_id,
                        child_lower,
                        child_upper,
                        depth + 1,
                        leaves,
                        keys,
                    )?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::{Arc, Barrier};
    use std::thread;

    use rand::seq::SliceRandom;
    use rand::Rng;
    use tempfile::TempDir;

    use crate::buffer::{BufferPoolManager, INVALID_PAGE_ID};
    use crate::storage::codec::{BPlusTreePageCodec, IndexKeyCodec};
    use crate::storage::disk_manager::DiskManager;
    use crate::storage::disk_scheduler::DiskScheduler;
    use crate::storage::index::comparator::default_comparator;
    use crate::storage::page::{BPlusTreeInternalPage, BPlusTreeLeafPage, BPlusTreePage, RecordId};
    use crate::utils::util::pretty_format_index_tree;

    use super::BPlusTreeIndex;

    fn key(value: i64) -> Vec<u8> {
        IndexKeyCodec::encode_i64(value)
    }

    fn rid(value: i64) -> RecordId {
        RecordId::new(value as u32, value as u32)
    }

    fn build_index(leaf_max_size: u32, internal_max_size: u32) -> (TempDir, Arc<BPlusTreeIndex>) {
        let temp_dir = TempDir::new().unwrap();
        let disk_manager = Arc::new(DiskManager::try_new(temp_dir.path().join("test.db")).unwrap());
        let disk_scheduler = Arc::new(DiskScheduler::new(disk_manager));
        let buffer_pool = Arc::new(BufferPoolManager::new(1000, disk_scheduler));
        let index = BPlusTreeIndex::new(
            "test_index",
            buffer_pool,
            default_comparator,
            leaf_max_size,
            internal_max_size,
        )
        .unwrap();
        (temp_dir, Arc::new(index))
    }

    fn collect_keys(index: &BPlusTreeIndex) -> Vec<i64> {
        let mut iter = index.begin().unwrap();
        let mut keys = Vec::new();
        while let Some((key, _)) = iter.next().unwrap() {
            keys.push(IndexKeyCodec::decode_i64(&key).unwrap());
        }
        keys
    }

    fn fetch_internal(index: &BPlusTreeIndex, page_id: u32) -> BPlusTreeInternalPage {
        let guard = index.buffer_pool.fetch_page_read(page_id).unwrap();
        match BPlusTreePageCodec::decode(guard.data()).unwrap().0 {
            BPlusTreePage::Internal(page) => page,
            BPlusTreePage::Leaf(_) => panic!("page {} is a leaf", page_id),
        }
    }

    fn fetch_leaf(index: &BPlusTreeIndex, page_id: u32) -> BPlusTreeLeafPage {
        let guard = index.buffer_pool.fetch_page_read(page_id).unwrap();
        match BPlusTreePageCodec::decode(guard.data()).unwrap().0 {
            BPlusTreePage::Leaf(page) => page,
            BPlusTreePage::Internal(_) => panic!("page {} is internal", page_id),
        }
    }

    fn leaf_keys(leaf: &BPlusTreeLeafPage) -> Vec<i64> {
        leaf.array
            .iter()
            .map(|(key, _)| IndexKeyCodec::decode_i64(key).unwrap())
            .collect()
    }

    #[test]
    fn test_insert_and_leaf_split() {
        let (_temp_dir, index) = build_index(4, 4);
        for value in [10, 20, 5, 15, 25] {
            assert!(index.insert(&key(value), rid(value)).unwrap());
        }

        let root = fetch_internal(&index, index.root_page_id());
        assert_eq!(root.header.current_size, 2);
        assert_eq!(root.key_at(1), key(15).as_slice());

        let left = fetch_leaf(&index, root.value_at(0));
        let right = fetch_leaf(&index, root.value_at(1));
        assert_eq!(leaf_keys(&left), vec![5, 10]);
        assert_eq!(leaf_keys(&right), vec![15, 20, 25]);
        assert_eq!(left.next_page_id(), right.header.page_id);
        assert_eq!(right.next_page_id(), INVALID_PAGE_ID);

        assert_eq!(collect_keys(&index), vec![5, 10, 15, 20, 25]);
        index.verify_integrity().unwrap();
        assert_eq!(index.buffer_pool.total_pin_count(), 0);
    }

    #[test]
    fn test_second_leaf_split_widens_root() {
        let (_temp_dir, index) = build_index(4, 4);
        for value in [10, 20, 5, 15, 25, 30] {
            assert!(index.insert(&key(value), rid(value)).unwrap());
        }

        let root = fetch_internal(&index, index.root_page_id());
        assert_eq!(root.header.current_size, 3);
        assert_eq!(root.key_at(1), key(15).as_slice());
        assert_eq!(root.key_at(2), key(25).as_slice());

        assert_eq!(leaf_keys(&fetch_leaf(&index, root.value_at(1))), vec![15, 20]);
        assert_eq!(leaf_keys(&fetch_leaf(&index, root.value_at(2))), vec![25, 30]);

        assert_eq!(collect_keys(&index), vec![5, 10, 15, 20, 25, 30]);
        index.verify_integrity().unwrap();
    }

    #[test]
    fn test_remove_coalesces_with_right_sibling() {
        let (_temp_dir, index) = build_index(4, 4);
        for value in [10, 20, 5, 15, 25, 30] {
            index.insert(&key(value), rid(value)).unwrap();
        }

        index.remove(&key(10)).unwrap();

        let root = fetch_internal(&index, index.root_page_id());
        assert_eq!(root.header.current_size, 2);
        assert_eq!(root.key_at(1), key(25).as_slice());
        assert_eq!(leaf_keys(&fetch_leaf(&index, root.value_at(0))), vec![5, 15, 20]);
        assert_eq!(leaf_keys(&fetch_leaf(&index, root.value_at(1))), vec![25, 30]);

        assert_eq!(collect_keys(&index), vec![5, 15, 20, 25, 30]);
        index.verify_integrity().unwrap();
        assert_eq!(index.buffer_pool.total_pin_count(), 0);
    }

    #[test]
    fn test_remove_redistributes_from_left_sibling() {
        let (_temp_dir, index) = build_index(4, 4);
        for value in [10, 20, 5, 15, 25, 30] {
            index.insert(&key(value), rid(value)).unwrap();
        }
        index.remove(&key(10)).unwrap();

        // the left leaf is too full to merge, so it donates its last key
        index.remove(&key(25)).unwrap();

        let root = fetch_internal(&index, index.root_page_id());
        assert_eq!(root.header.current_size, 2);
        assert_eq!(root.key_at(1), key(20).as_slice());
        assert_eq!(leaf_keys(&fetch_leaf(&index, root.value_at(0))), vec![5, 15]);
        assert_eq!(leaf_keys(&fetch_leaf(&index, root.value_at(1))), vec![20, 30]);

        assert_eq!(collect_keys(&index), vec![5, 15, 20, 30]);
        index.verify_integrity().unwrap();
    }

    #[test]
    fn test_root_collapse_and_empty_tree() {
        let (_temp_dir, index) = build_index(4, 4);
        for value in [10, 20, 5, 15, 25, 30] {
            index.insert(&key(value), rid(value)).unwrap();
        }
        for value in [10, 25, 5] {
            index.remove(&key(value)).unwrap();
        }

        // the last merge leaves a single child, which becomes the root leaf
        let root = fetch_leaf(&index, index.root_page_id());
        assert_eq!(root.header.parent_page_id, INVALID_PAGE_ID);
        assert_eq!(leaf_keys(&root), vec![15, 20, 30]);
        index.verify_integrity().unwrap();

        for value in [15, 20, 30] {
            index.remove(&key(value)).unwrap();
        }
        assert!(index.is_empty());
        assert_eq!(index.root_page_id(), INVALID_PAGE_ID);
        assert!(index.begin().unwrap().is_end());
        assert_eq!(index.buffer_pool.total_pin_count(), 0);

        // the emptied tree accepts new keys
        assert!(index.insert(&key(7), rid(7)).unwrap());
        assert_eq!(index.get(&key(7)).unwrap(), Some(rid(7)));
        index.verify_integrity().unwrap();
    }

    #[test]
    fn test_duplicate_insert_is_rejected() {
        let (_temp_dir, index) = build_index(4, 4);
        for value in 1..=10 {
            assert!(index.insert(&key(value), rid(value)).unwrap());
        }

        assert!(!index.insert(&key(5), rid(99)).unwrap());
        assert_eq!(index.get(&key(5)).unwrap(), Some(rid(5)));
        assert_eq!(collect_keys(&index), (1..=10).collect::<Vec<_>>());
        index.verify_integrity().unwrap();
        assert_eq!(index.buffer_pool.total_pin_count(), 0);
    }

    #[test]
    fn test_remove_absent_key_is_noop() {
        let (_temp_dir, index) = build_index(4, 4);
        index.remove(&key(1)).unwrap();
        assert!(index.is_empty());

        for value in 1..=5 {
            index.insert(&key(value), rid(value)).unwrap();
        }
        index.remove(&key(100)).unwrap();
        assert_eq!(collect_keys(&index), (1..=5).collect::<Vec<_>>());
        index.verify_integrity().unwrap();
    }

    #[test]
    fn test_sequential_insert_and_scan() {
        let (_temp_dir, index) = build_index(4, 4);
        for value in 1..=100 {
            assert!(index.insert(&key(value), rid(value)).unwrap());
        }
        for value in 1..=100 {
            assert_eq!(index.get(&key(value)).unwrap(), Some(rid(value)));
        }
        assert_eq!(index.get(&key(0)).unwrap(), None);
        assert_eq!(index.get(&key(101)).unwrap(), None);

        assert_eq!(collect_keys(&index), (1..=100).collect::<Vec<_>>());
        index.verify_integrity().unwrap();
        assert_eq!(index.buffer_pool.total_pin_count(), 0);
    }

    #[test]
    fn test_descending_insert_matches_ascending() {
        let (_temp_dir, index) = build_index(4, 4);
        for value in (1..=100).rev() {
            assert!(index.insert(&key(value), rid(value)).unwrap());
        }
        assert_eq!(collect_keys(&index), (1..=100).collect::<Vec<_>>());
        index.verify_integrity().unwrap();
    }

    #[test]
    fn test_random_workload_matches_reference() {
        let (_temp_dir, index) = build_index(5, 5);
        let mut reference = BTreeMap::new();
        let mut rng = rand::rng();

        let mut values: Vec<i64> = (0..300).collect();
        values.shuffle(&mut rng);
        for &value in values.iter() {
            index.insert(&key(value), rid(value)).unwrap();
            reference.insert(value, rid(value));
        }

        values.shuffle(&mut rng);
        for &value in values.iter().take(150) {
            index.remove(&key(value)).unwrap();
            reference.remove(&value);
        }

        for value in 0..300 {
            assert_eq!(
                index.get(&key(value)).unwrap(),
                reference.get(&value).copied(),
                "key {} diverged from the reference",
                value
            );
        }
        assert_eq!(
            collect_keys(&index),
            reference.keys().copied().collect::<Vec<_>>()
        );
        index.verify_integrity().unwrap();
        assert_eq!(index.buffer_pool.total_pin_count(), 0);
    }

    #[test]
    fn test_begin_at_positions_at_lower_bound() {
        let (_temp_dir, index) = build_index(4, 4);
        for value in (2..=100).step_by(2) {
            index.insert(&key(value), rid(value)).unwrap();
        }

        let mut iter = index.begin_at(&key(37)).unwrap();
        let mut keys = Vec::new();
        while let Some((key, _)) = iter.next().unwrap() {
            keys.push(IndexKeyCodec::decode_i64(&key).unwrap());
        }
        assert_eq!(keys, (38..=100).step_by(2).collect::<Vec<_>>());

        let iter = index.begin_at(&key(40)).unwrap();
        let (first, _) = iter.entry().unwrap();
        assert_eq!(first, key(40).as_slice());
        drop(iter);

        assert!(index.begin_at(&key(101)).unwrap().is_end());
        assert_eq!(index.buffer_pool.total_pin_count(), 0);
    }

    #[test]
    fn test_iterator_equality() {
        let (_temp_dir, index) = build_index(4, 4);
        assert!(index.begin().unwrap() == index.end());

        for value in 1..=10 {
            index.insert(&key(value), rid(value)).unwrap();
        }
        let first = index.begin().unwrap();
        let second = index.begin().unwrap();
        assert!(first == second);
        assert!(first != index.end());

        let mut walker = index.begin().unwrap();
        while !walker.is_end() {
            walker.advance().unwrap();
        }
        assert!(walker == index.end());
        // advancing past the end stays at the end
        walker.advance().unwrap();
        assert!(walker.is_end());
    }

    #[test]
    fn test_open_existing_index() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("test.db");
        let header_page_id;
        {
            let disk_manager = Arc::new(DiskManager::try_new(&path).unwrap());
            let disk_scheduler = Arc::new(DiskScheduler::new(disk_manager));
            let buffer_pool = Arc::new(BufferPoolManager::new(100, disk_scheduler));
            let index = BPlusTreeIndex::new(
                "orders_pk",
                buffer_pool.clone(),
                default_comparator,
                4,
                4,
            )
            .unwrap();
            header_page_id = index.header_page_id();
            for value in 1..=20 {
                index.insert(&key(value), rid(value)).unwrap();
            }
            buffer_pool.flush_all_pages().unwrap();
        }

        let disk_manager = Arc::new(DiskManager::try_new(&path).unwrap());
        let disk_scheduler = Arc::new(DiskScheduler::new(disk_manager));
        let buffer_pool = Arc::new(BufferPoolManager::new(100, disk_scheduler));
        let index = BPlusTreeIndex::open(
            "orders_pk",
            buffer_pool,
            default_comparator,
            4,
            4,
            header_page_id,
        )
        .unwrap();
        assert_eq!(index.get(&key(7)).unwrap(), Some(rid(7)));
        assert_eq!(collect_keys(&index), (1..=20).collect::<Vec<_>>());
        index.verify_integrity().unwrap();
    }

    #[test]
    fn test_insert_and_remove_from_file() {
        let (temp_dir, index) = build_index(4, 4);

        let insert_path = temp_dir.path().join("insert_keys.txt");
        std::fs::write(&insert_path, "1 2 3\n4 5").unwrap();
        index.insert_from_file(&insert_path).unwrap();
        assert_eq!(collect_keys(&index), vec![1, 2, 3, 4, 5]);

        let remove_path = temp_dir.path().join("remove_keys.txt");
        std::fs::write(&remove_path, "2 4").unwrap();
        index.remove_from_file(&remove_path).unwrap();
        assert_eq!(collect_keys(&index), vec![1, 3, 5]);
        index.verify_integrity().unwrap();
    }

    #[test]
    fn test_pretty_format() {
        let (_temp_dir, index) = build_index(4, 4);
        assert_eq!(pretty_format_index_tree(&index).unwrap(), "Empty tree.");

        for value in 1..=10 {
            index.insert(&key(value), rid(value)).unwrap();
        }
        let display = pretty_format_index_tree(&index).unwrap();
        println!("{display}");
        assert!(display.contains("B+ Tree Level No.1"));
        assert!(display.contains("B+ Tree Level No.2"));
    }

    #[test]
    fn test_concurrent_get() {
        let (_temp_dir, index) = build_index(10, 10);
        const TOTAL_KEYS: i64 = 1000;
        for value in 0..TOTAL_KEYS {
            index.insert(&key(value), rid(value)).unwrap();
        }

        let mut handles = Vec::new();
        for _ in 0..10 {
            let index = Arc::clone(&index);
            handles.push(thread::spawn(move || {
                let mut rng = rand::rng();
                for _ in 0..1000 {
                    let value = rng.random_range(0..TOTAL_KEYS);
                    assert_eq!(index.get(&key(value)).unwrap(), Some(rid(value)));
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(index.buffer_pool.total_pin_count(), 0);
    }

    #[test]
    fn test_concurrent_insert_then_remove() {
        const NUM_THREADS: usize = 8;
        const KEYS_PER_THREAD: i64 = 125;
        const TOTAL_KEYS: i64 = NUM_THREADS as i64 * KEYS_PER_THREAD;

        let (_temp_dir, index) = build_index(10, 10);

        // phase 1: concurrent partitioned inserts
        let barrier = Arc::new(Barrier::new(NUM_THREADS));
        let mut handles = Vec::new();
        for t in 0..NUM_THREADS {
            let index = Arc::clone(&index);
            let barrier = Arc::clone(&barrier);
            handles.push(thread::spawn(move || {
                let start = t as i64 * KEYS_PER_THREAD + 1;
                let end = start + KEYS_PER_THREAD;
                barrier.wait();
                for value in start..end {
                    assert!(index.insert(&key(value), rid(value)).unwrap());
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        for value in 1..=TOTAL_KEYS {
            assert_eq!(index.get(&key(value)).unwrap(), Some(rid(value)));
        }
        index.verify_integrity().unwrap();

        // phase 2: concurrent removal of every odd key
        let barrier = Arc::new(Barrier::new(NUM_THREADS));
        let mut handles = Vec::new();
        for t in 0..NUM_THREADS {
            let index = Arc::clone(&index);
            let barrier = Arc::clone(&barrier);
            handles.push(thread::spawn(move || {
                barrier.wait();
                for value in (1..=TOTAL_KEYS).step_by(2) {
                    if (value / 2) as usize % NUM_THREADS == t {
                        index.remove(&key(value)).unwrap();
                    }
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        let expected: Vec<i64> = (2..=TOTAL_KEYS).step_by(2).collect();
        assert_eq!(collect_keys(&index), expected);
        index.verify_integrity().unwrap();
        assert_eq!(index.buffer_pool.total_pin_count(), 0);
    }

    #[test]
    fn test_concurrent_readers_during_writes() {
        const WRITERS: usize = 4;
        const READERS: usize = 4;
        const KEYS_PER_WRITER: i64 = 200;

        let (_temp_dir, index) = build_index(10, 10);
        let barrier = Arc::new(Barrier::new(WRITERS + READERS));
        let mut handles = Vec::new();

        for t in 0..WRITERS {
            let index = Arc::clone(&index);
            let barrier = Arc::clone(&barrier);
            handles.push(thread::spawn(move || {
                let start = t as i64 * KEYS_PER_WRITER;
                barrier.wait();
                for value in start..start + KEYS_PER_WRITER {
                    index.insert(&key(value), rid(value)).unwrap();
                }
            }));
        }
        for _ in 0..READERS {
            let index = Arc::clone(&index);
            let barrier = Arc::clone(&barrier);
            handles.push(thread::spawn(move || {
                let mut rng = rand::rng();
                barrier.wait();
                for _ in 0..500 {
                    let value = rng.random_range(0..WRITERS as i64 * KEYS_PER_WRITER);
                    // a concurrent reader may miss a key still in flight,
                    // but a found key must carry the right record id
                    if let Some(found) = index.get(&key(value)).unwrap() {
                        assert_eq!(found, rid(value));
                    }
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        let total = WRITERS as i64 * KEYS_PER_WRITER;
        assert_eq!(collect_keys(&index), (0..total).collect::<Vec<_>>());
        index.verify_integrity().unwrap();
        assert_eq!(index.buffer_pool.total_pin_count(), 0);
    }
}
