use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::Mutex;

use bytes::BytesMut;
use log::debug;

use crate::buffer::{AtomicPageId, PageId, INVALID_PAGE_ID, PAGE_SIZE};
use crate::error::{CrabTreeError, CrabTreeResult};

static EMPTY_PAGE: [u8; PAGE_SIZE] = [0; PAGE_SIZE];

/// Page-granular storage over a single database file. Page id 0 is the
/// invalid id; ids map directly to file offsets.
#[derive(Debug)]
pub struct DiskManager {
    next_page_id: AtomicPageId,
    db_file: Mutex<File>,
    free_pages: Mutex<Vec<PageId>>,
}

impl DiskManager {
    pub fn try_new(db_path: impl AsRef<Path>) -> CrabTreeResult<Self> {
        let db_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(db_path.as_ref())?;
        let file_len = db_file.metadata()?.len() as usize;
        let next_page_id = (file_len.div_ceil(PAGE_SIZE)).max(1) as PageId;
        debug!(
            "opened db file {:?}, next page id {}",
            db_path.as_ref(),
            next_page_id
        );
        Ok(Self {
            next_page_id: AtomicPageId::new(next_page_id),
            db_file: Mutex::new(db_file),
            free_pages: Mutex::new(Vec::new()),
        })
    }

    pub fn read_page(&self, page_id: PageId) -> CrabTreeResult<BytesMut> {
        if page_id == INVALID_PAGE_ID {
            return Err(CrabTreeError::Internal(
                "cannot read the invalid page id".to_string(),
            ));
        }
        let mut file = self.lock_file()?;
        file.seek(SeekFrom::Start(page_id as u64 * PAGE_SIZE as u64))?;

        let mut buf = BytesMut::zeroed(PAGE_SIZE);
        let mut total = 0;
        while total < PAGE_SIZE {
            let n = file.read(&mut buf[total..])?;
            if n == 0 {
                // allocated but never written; the rest of the page is zero
                break;
            }
            total += n;
        }
        Ok(buf)
    }

    pub fn write_page(&self, page_id: PageId, data: &[u8]) -> CrabTreeResult<()> {
        if page_id == INVALID_PAGE_ID {
            return Err(CrabTreeError::Internal(
                "cannot write the invalid page id".to_string(),
            ));
        }
        if data.len() != PAGE_SIZE {
            return Err(CrabTreeError::Internal(format!(
                "page {} write of {} bytes, expected {}",
                page_id,
                data.len(),
                PAGE_SIZE
            )));
        }
        let mut file = self.lock_file()?;
        file.seek(SeekFrom::Start(page_id as u64 * PAGE_SIZE as u64))?;
        file.write_all(data)?;
        Ok(())
    }

    pub fn allocate_page(&self) -> CrabTreeResult<PageId> {
        if let Some(page_id) = self.lock_free_pages()?.pop() {
            return Ok(page_id);
        }
        Ok(self.next_page_id.fetch_add(1, Ordering::SeqCst))
    }

    pub fn deallocate_page(&self, page_id: PageId) -> CrabTreeResult<()> {
        if page_id == INVALID_PAGE_ID {
            return Err(CrabTreeError::Internal(
                "cannot deallocate the invalid page id".to_string(),
            ));
        }
        self.write_page(page_id, &EMPTY_PAGE)?;
        let mut free_pages = self.lock_free_pages()?;
        if !free_pages.contains(&page_id) {
            free_pages.push(page_id);
        }
        Ok(())
    }

    fn lock_file(&self) -> CrabTreeResult<std::sync::MutexGuard<'_, File>> {
        self.db_file
            .lock()
            .map_err(|e| CrabTreeError::Internal(format!("db file lock poisoned: {}", e)))
    }

    fn lock_free_pages(&self) -> CrabTreeResult<std::sync::MutexGuard<'_, Vec<PageId>>> {
        self.free_pages
            .lock()
            .map_err(|e| CrabTreeError::Internal(format!("free list lock poisoned: {}", e)))
    }
}
