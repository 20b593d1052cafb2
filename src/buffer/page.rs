use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use log::error;
use parking_lot::lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use parking_lot::{RawRwLock, RwLock};

use crate::buffer::buffer_pool::FrameId;
use crate::utils::cache::lru_k::LRUKReplacer;
use crate::utils::cache::Replacer;

pub type PageId = u32;
pub type AtomicPageId = AtomicU32;

pub const INVALID_PAGE_ID: PageId = 0;
pub const PAGE_SIZE: usize = 4096;

/// An in-memory frame holding one page image. The `RwLock` wrapping each
/// frame in the pool doubles as the page latch.
#[derive(Debug)]
pub struct Page {
    pub page_id: PageId,
    data: [u8; PAGE_SIZE],
    pub pin_count: AtomicU32,
    pub is_dirty: bool,
}

impl Page {
    pub fn empty() -> Self {
        Self::new(INVALID_PAGE_ID)
    }

    pub fn new(page_id: PageId) -> Self {
        Self {
            page_id,
            data: [0; PAGE_SIZE],
            pin_count: AtomicU32::new(0),
            is_dirty: false,
        }
    }

    pub fn destroy(&mut self) {
        self.page_id = INVALID_PAGE_ID;
        self.data = [0; PAGE_SIZE];
        self.pin_count.store(0, Ordering::SeqCst);
        self.is_dirty = false;
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn set_data(&mut self, data: &[u8]) {
        debug_assert_eq!(data.len(), PAGE_SIZE);
        self.data.copy_from_slice(data);
        self.is_dirty = true;
    }

    /// Replace the page image without touching the dirty flag. Used when a
    /// frame is filled from disk.
    pub(crate) fn load_data(&mut self, data: &[u8]) {
        debug_assert_eq!(data.len(), PAGE_SIZE);
        self.data.copy_from_slice(data);
    }

    pub(crate) fn zero_data(&mut self) {
        self.data = [0; PAGE_SIZE];
    }
}

/// A pinned reference to a buffer frame. Dropping it unpins the page and
/// makes the frame evictable again once the pin count reaches zero.
#[derive(Debug)]
pub struct PageRef {
    pub(crate) page: Arc<RwLock<Page>>,
    page_id: PageId,
    frame_id: FrameId,
    replacer: Arc<RwLock<LRUKReplacer>>,
}

impl PageRef {
    pub(crate) fn new(
        page: Arc<RwLock<Page>>,
        page_id: PageId,
        frame_id: FrameId,
        replacer: Arc<RwLock<LRUKReplacer>>,
    ) -> Self {
        Self {
            page,
            page_id,
            frame_id,
            replacer,
        }
    }

    pub fn page_id(&self) -> PageId {
        self.page_id
    }
}

impl Drop for PageRef {
    fn drop(&mut self) {
        let remaining = {
            let guard = self.page.read();
            let prev = guard.pin_count.fetch_sub(1, Ordering::AcqRel);
            if prev == 0 {
                guard.pin_count.fetch_add(1, Ordering::AcqRel);
                error!("page {} unpinned with pin count already zero", self.page_id);
                return;
            }
            prev - 1
        };
        if remaining == 0 {
            if let Err(e) = self.replacer.write().set_evictable(self.frame_id, true) {
                error!(
                    "failed to mark frame {} (page {}) evictable: {}",
                    self.frame_id, self.page_id, e
                );
            }
        }
    }
}

/// A pinned page held under its shared latch.
#[derive(Debug)]
pub struct ReadPageGuard {
    // declared before `page` so the latch is released before the unpin
    latch: ArcRwLockReadGuard<RawRwLock, Page>,
    page: PageRef,
}

impl ReadPageGuard {
    pub(crate) fn new(latch: ArcRwLockReadGuard<RawRwLock, Page>, page: PageRef) -> Self {
        Self { latch, page }
    }

    pub fn page_id(&self) -> PageId {
        self.page.page_id()
    }

    pub fn data(&self) -> &[u8] {
        self.latch.data()
    }

    pub fn pin_count(&self) -> u32 {
        self.latch.pin_count.load(Ordering::Acquire)
    }

    /// Release the latch but keep the pin. The iterator uses this to hold a
    /// leaf across user code without blocking writers.
    pub(crate) fn unlatch(self) -> PageRef {
        let ReadPageGuard { latch, page } = self;
        drop(latch);
        page
    }
}

/// A pinned page held under its exclusive latch.
#[derive(Debug)]
pub struct WritePageGuard {
    latch: ArcRwLockWriteGuard<RawRwLock, Page>,
    page: PageRef,
}

impl WritePageGuard {
    pub(crate) fn new(latch: ArcRwLockWriteGuard<RawRwLock, Page>, page: PageRef) -> Self {
        Self { latch, page }
    }

    pub fn page_id(&self) -> PageId {
        self.page.page_id()
    }

    pub fn data(&self) -> &[u8] {
        self.latch.data()
    }

    pub fn pin_count(&self) -> u32 {
        self.latch.pin_count.load(Ordering::Acquire)
    }

    /// Replace the page image and mark the frame dirty.
    pub fn overwrite(&mut self, data: &[u8]) {
        self.latch.set_data(data);
    }
}
