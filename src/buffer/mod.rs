mod buffer_pool;
mod page;

pub use buffer_pool::{BufferPoolManager, FrameId};
pub use page::{
    AtomicPageId, Page, PageId, PageRef, ReadPageGuard, WritePageGuard, INVALID_PAGE_ID, PAGE_SIZE,
};
