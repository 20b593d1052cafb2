use std::sync::Arc;

use crate::buffer::{BufferPoolManager, PageRef, INVALID_PAGE_ID};
use crate::error::CrabTreeResult;
use crate::storage::codec::BPlusTreeLeafPageCodec;
use crate::storage::page::{BPlusTreeLeafPage, RecordId};

/// Forward cursor over the leaf chain. Holds exactly one pinned leaf at a
/// time and takes no latches after construction, so concurrent writers may
/// make it observe torn results; it is a point-in-time scan, not a
/// snapshot.
#[derive(Debug)]
pub struct TreeIndexIterator {
    buffer_pool: Arc<BufferPoolManager>,
    // pinned leaf plus the decoded image it was pinned with
    leaf: Option<(PageRef, BPlusTreeLeafPage)>,
    slot: usize,
}

impl TreeIndexIterator {
    pub(crate) fn end(buffer_pool: Arc<BufferPoolManager>) -> Self {
        Self {
            buffer_pool,
            leaf: None,
            slot: 0,
        }
    }

    pub(crate) fn positioned(
        buffer_pool: Arc<BufferPoolManager>,
        page: PageRef,
        leaf: BPlusTreeLeafPage,
        slot: usize,
    ) -> Self {
        Self {
            buffer_pool,
            leaf: Some((page, leaf)),
            slot,
        }
    }

    pub fn is_end(&self) -> bool {
        self.leaf.is_none()
    }

    /// The (key, record id) pair under the cursor, or None at the end.
    pub fn entry(&self) -> Option<(&[u8], RecordId)> {
        let (_, leaf) = self.leaf.as_ref()?;
        if self.slot >= leaf.header.current_size as usize {
            return None;
        }
        let (key, rid) = leaf.kv_at(self.slot);
        Some((key.as_slice(), *rid))
    }

    /// Step to the next slot, unpinning the current leaf and pinning its
    /// successor when the cursor crosses a leaf boundary. A no-op at the
    /// end.
    pub fn advance(&mut self) -> CrabTreeResult<()> {
        let Some((_, leaf)) = self.leaf.as_ref() else {
            return Ok(());
        };
        if self.slot + 1 < leaf.header.current_size as usize {
            self.slot += 1;
            Ok(())
        } else {
            self.move_to_next_leaf()
        }
    }

    pub(crate) fn move_to_next_leaf(&mut self) -> CrabTreeResult<()> {
        let next_page_id = match self.leaf.as_ref() {
            Some((_, leaf)) => leaf.header.next_page_id,
            None => return Ok(()),
        };
        if next_page_id == INVALID_PAGE_ID {
            self.leaf = None;
            self.slot = 0;
            return Ok(());
        }
        let guard = self.buffer_pool.fetch_page_read(next_page_id)?;
        let (next_leaf, _) = BPlusTreeLeafPageCodec::decode(guard.data())?;
        self.leaf = Some((guard.unlatch(), next_leaf));
        self.slot = 0;
        Ok(())
    }

    /// Yield the current entry and advance past it.
    pub fn next(&mut self) -> CrabTreeResult<Option<(Vec<u8>, RecordId)>> {
        let current = self.entry().map(|(key, rid)| (key.to_vec(), rid));
        if current.is_some() {
            self.advance()?;
        }
        Ok(current)
    }
}

impl PartialEq for TreeIndexIterator {
    fn eq(&self, other: &Self) -> bool {
        match (&self.leaf, &other.leaf) {
            (None, None) => true,
            (Some((a, _)), Some((b, _))) => a.page_id() == b.page_id() && self.slot == other.slot,
            _ => false,
        }
    }
}
