use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use log::debug;
use parking_lot::{Mutex, RwLock};

use crate::buffer::page::{
    Page, PageId, PageRef, ReadPageGuard, WritePageGuard, INVALID_PAGE_ID,
};
use crate::config::BufferPoolConfig;
use crate::error::{CrabTreeError, CrabTreeResult};
use crate::storage::disk_scheduler::DiskScheduler;
use crate::utils::cache::lru_k::LRUKReplacer;
use crate::utils::cache::Replacer;

pub type FrameId = usize;

#[derive(Debug)]
pub struct BufferPoolManager {
    pool: Vec<Arc<RwLock<Page>>>,
    pub(crate) replacer: Arc<RwLock<LRUKReplacer>>,
    pub disk_scheduler: Arc<DiskScheduler>,
    page_table: DashMap<PageId, FrameId>,
    free_list: Mutex<VecDeque<FrameId>>,
    // serializes concurrent loads of the same page into the pool
    inflight_loads: DashMap<PageId, Arc<Mutex<()>>>,
}

impl BufferPoolManager {
    pub fn new(num_pages: usize, disk_scheduler: Arc<DiskScheduler>) -> Self {
        Self::new_with_config(
            BufferPoolConfig {
                buffer_pool_size: num_pages,
                ..Default::default()
            },
            disk_scheduler,
        )
    }

    pub fn new_with_config(config: BufferPoolConfig, disk_scheduler: Arc<DiskScheduler>) -> Self {
        let mut free_list = VecDeque::with_capacity(config.buffer_pool_size);
        let mut pool = Vec::with_capacity(config.buffer_pool_size);
        for i in 0..config.buffer_pool_size {
            free_list.push_back(i);
            pool.push(Arc::new(RwLock::new(Page::empty())));
        }

        Self {
            pool,
            replacer: Arc::new(RwLock::new(LRUKReplacer::with_k(
                config.buffer_pool_size,
                config.lru_k_k,
            ))),
            disk_scheduler,
            page_table: DashMap::new(),
            free_list: Mutex::new(free_list),
            inflight_loads: DashMap::new(),
        }
    }

    /// Allocate a fresh page on disk and return it pinned under its
    /// exclusive latch, zero-filled and marked dirty.
    pub fn new_page(&self) -> CrabTreeResult<WritePageGuard> {
        let frame_id = self.allocate_frame()?;

        let rx = self.disk_scheduler.schedule_allocate()?;
        let page_id = match rx.recv() {
            Ok(Ok(page_id)) => page_id,
            Ok(Err(e)) => {
                self.free_list.lock().push_back(frame_id);
                return Err(e);
            }
            Err(e) => {
                self.free_list.lock().push_back(frame_id);
                return Err(CrabTreeError::Internal(format!(
                    "failed to receive allocated page id: {}",
                    e
                )));
            }
        };

        let page = self.pool[frame_id].clone();
        let mut latch = page.write_arc();
        latch.page_id = page_id;
        latch.pin_count.store(1, Ordering::SeqCst);
        latch.is_dirty = true;
        latch.zero_data();

        self.page_table.insert(page_id, frame_id);
        {
            let mut replacer = self.replacer.write();
            replacer.record_access(frame_id)?;
            replacer.set_evictable(frame_id, false)?;
        }
        debug!("created page {} in frame {}", page_id, frame_id);

        let page_ref = PageRef::new(page.clone(), page_id, frame_id, self.replacer.clone());
        Ok(WritePageGuard::new(latch, page_ref))
    }

    /// Pin a page without latching it. The caller is responsible for
    /// latching before touching the payload.
    pub fn fetch_page(&self, page_id: PageId) -> CrabTreeResult<PageRef> {
        if page_id == INVALID_PAGE_ID {
            return Err(CrabTreeError::Internal(
                "cannot fetch the invalid page id".to_string(),
            ));
        }
        loop {
            if let Some(entry) = self.page_table.get(&page_id) {
                let frame_id = *entry;
                drop(entry);

                let page = self.pool[frame_id].clone();
                {
                    let guard = page.read();
                    if guard.page_id != page_id {
                        // the frame was recycled between the lookup and the pin
                        continue;
                    }
                    guard.pin_count.fetch_add(1, Ordering::AcqRel);
                }
                {
                    let mut replacer = self.replacer.write();
                    replacer.record_access(frame_id)?;
                    replacer.set_evictable(frame_id, false)?;
                }
                return Ok(PageRef::new(page, page_id, frame_id, self.replacer.clone()));
            }

            let load_lock = self
                .inflight_loads
                .entry(page_id)
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .value()
                .clone();
            let _load_guard = load_lock.lock();
            if self.page_table.contains_key(&page_id) {
                // another thread loaded the page while we waited
                continue;
            }

            let frame_id = self.allocate_frame()?;
            let rx = self.disk_scheduler.schedule_read(page_id)?;
            let data = match rx.recv() {
                Ok(Ok(data)) => data,
                Ok(Err(e)) => {
                    self.free_list.lock().push_back(frame_id);
                    return Err(e);
                }
                Err(e) => {
                    self.free_list.lock().push_back(frame_id);
                    return Err(CrabTreeError::Internal(format!(
                        "failed to receive page {} data: {}",
                        page_id, e
                    )));
                }
            };

            let page = self.pool[frame_id].clone();
            {
                let mut guard = page.write();
                guard.page_id = page_id;
                guard.is_dirty = false;
                guard.pin_count.store(1, Ordering::SeqCst);
                guard.load_data(&data);
            }
            self.page_table.insert(page_id, frame_id);
            {
                let mut replacer = self.replacer.write();
                replacer.record_access(frame_id)?;
                replacer.set_evictable(frame_id, false)?;
            }
            self.inflight_loads.remove(&page_id);
            debug!("fetched page {} into frame {}", page_id, frame_id);
            return Ok(PageRef::new(page, page_id, frame_id, self.replacer.clone()));
        }
    }

    pub fn fetch_page_read(&self, page_id: PageId) -> CrabTreeResult<ReadPageGuard> {
        let page_ref = self.fetch_page(page_id)?;
        let latch = page_ref.page.read_arc();
        Ok(ReadPageGuard::new(latch, page_ref))
    }

    pub fn fetch_page_write(&self, page_id: PageId) -> CrabTreeResult<WritePageGuard> {
        let page_ref = self.fetch_page(page_id)?;
        let latch = page_ref.page.write_arc();
        Ok(WritePageGuard::new(latch, page_ref))
    }

    pub fn flush_page(&self, page_id: PageId) -> CrabTreeResult<bool> {
        let Some(entry) = self.page_table.get(&page_id) else {
            return Ok(false);
        };
        let frame_id = *entry;
        drop(entry);

        let page = self.pool[frame_id].clone();
        let data = {
            let mut guard = page.write();
            if guard.page_id != page_id || !guard.is_dirty {
                return Ok(false);
            }
            guard.is_dirty = false;
            Bytes::copy_from_slice(guard.data())
        };

        let rx = self.disk_scheduler.schedule_write(page_id, data)?;
        rx.recv().map_err(|e| {
            CrabTreeError::Internal(format!("failed to receive flush result: {}", e))
        })??;
        Ok(true)
    }

    pub fn flush_all_pages(&self) -> CrabTreeResult<()> {
        let page_ids: Vec<PageId> = self.page_table.iter().map(|entry| *entry.key()).collect();
        for page_id in page_ids {
            self.flush_page(page_id)?;
        }
        Ok(())
    }

    /// Drop the page from the pool and release its disk space. Returns
    /// false when the page is still pinned.
    pub fn delete_page(&self, page_id: PageId) -> CrabTreeResult<bool> {
        if let Some(entry) = self.page_table.get(&page_id) {
            let frame_id = *entry;
            drop(entry);

            let page = self.pool[frame_id].clone();
            let mut guard = page.write();
            if guard.page_id == page_id {
                if guard.pin_count.load(Ordering::Acquire) > 0 {
                    return Ok(false);
                }
                guard.destroy();
                self.page_table.remove(&page_id);
                self.replacer.write().remove(frame_id);
                self.free_list.lock().push_back(frame_id);
                debug!("deleted page {} from frame {}", page_id, frame_id);
            }
        }

        let rx = self.disk_scheduler.schedule_deallocate(page_id)?;
        rx.recv().map_err(|e| {
            CrabTreeError::Internal(format!("failed to receive deallocate result: {}", e))
        })??;
        Ok(true)
    }

    /// Sum of the pin counts over every frame. Zero once all operations
    /// have quiesced.
    pub fn total_pin_count(&self) -> u32 {
        self.pool
            .iter()
            .map(|page| page.read().pin_count.load(Ordering::Acquire))
            .sum()
    }

    fn allocate_frame(&self) -> CrabTreeResult<FrameId> {
        if let Some(frame_id) = self.free_list.lock().pop_front() {
            return Ok(frame_id);
        }
        loop {
            let Some(frame_id) = self.replacer.write().evict() else {
                return Err(CrabTreeError::OutOfMemory(
                    "buffer pool is full and no frame is evictable".to_string(),
                ));
            };

            let page = self.pool[frame_id].clone();
            let mut guard = page.write();
            if guard.pin_count.load(Ordering::Acquire) > 0 {
                // a fetch pinned this frame after the replacer chose it;
                // record_access on the fetch path re-registered it
                continue;
            }

            let evicted_page_id = guard.page_id;
            if guard.is_dirty {
                let data = Bytes::copy_from_slice(guard.data());
                guard.is_dirty = false;
                let rx = self.disk_scheduler.schedule_write(evicted_page_id, data)?;
                rx.recv().map_err(|e| {
                    CrabTreeError::Internal(format!(
                        "failed to receive evicted page flush result: {}",
                        e
                    ))
                })??;
            }
            if evicted_page_id != INVALID_PAGE_ID {
                self.page_table.remove(&evicted_page_id);
            }
            guard.destroy();
            debug!("evicted page {} from frame {}", evicted_page_id, frame_id);
            return Ok(frame_id);
        }
    }
}
