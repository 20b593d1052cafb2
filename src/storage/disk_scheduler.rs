use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use bytes::{Bytes, BytesMut};
use log::error;
use parking_lot::Mutex;

use crate::buffer::PageId;
use crate::error::{CrabTreeError, CrabTreeResult};
use crate::storage::disk_manager::DiskManager;

enum DiskRequest {
    Read {
        page_id: PageId,
        resp: Sender<CrabTreeResult<BytesMut>>,
    },
    Write {
        page_id: PageId,
        data: Bytes,
        resp: Sender<CrabTreeResult<()>>,
    },
    Allocate {
        resp: Sender<CrabTreeResult<PageId>>,
    },
    Deallocate {
        page_id: PageId,
        resp: Sender<CrabTreeResult<()>>,
    },
    Shutdown,
}

/// Funnels page IO through a dedicated worker thread. Callers receive a
/// channel to wait on for the result of each scheduled request.
#[derive(Debug)]
pub struct DiskScheduler {
    request_tx: Sender<DiskRequest>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl DiskScheduler {
    pub fn new(disk_manager: Arc<DiskManager>) -> Self {
        let (request_tx, request_rx) = channel::<DiskRequest>();
        let worker = thread::spawn(move || {
            while let Ok(request) = request_rx.recv() {
                match request {
                    DiskRequest::Read { page_id, resp } => {
                        let _ = resp.send(disk_manager.read_page(page_id));
                    }
                    DiskRequest::Write {
                        page_id,
                        data,
                        resp,
                    } => {
                        let _ = resp.send(disk_manager.write_page(page_id, &data));
                    }
                    DiskRequest::Allocate { resp } => {
                        let _ = resp.send(disk_manager.allocate_page());
                    }
                    DiskRequest::Deallocate { page_id, resp } => {
                        let _ = resp.send(disk_manager.deallocate_page(page_id));
                    }
                    DiskRequest::Shutdown => break,
                }
            }
        });

        Self {
            request_tx,
            worker: Mutex::new(Some(worker)),
        }
    }

    pub fn schedule_read(&self, page_id: PageId) -> CrabTreeResult<Receiver<CrabTreeResult<BytesMut>>> {
        let (resp, rx) = channel();
        self.send(DiskRequest::Read { page_id, resp })?;
        Ok(rx)
    }

    pub fn schedule_write(
        &self,
        page_id: PageId,
        data: Bytes,
    ) -> CrabTreeResult<Receiver<CrabTreeResult<()>>> {
        let (resp, rx) = channel();
        self.send(DiskRequest::Write {
            page_id,
            data,
            resp,
        })?;
        Ok(rx)
    }

    pub fn schedule_allocate(&self) -> CrabTreeResult<Receiver<CrabTreeResult<PageId>>> {
        let (resp, rx) = channel();
        self.send(DiskRequest::Allocate { resp })?;
        Ok(rx)
    }

    pub fn schedule_deallocate(
        &self,
        page_id: PageId,
    ) -> CrabTreeResult<Receiver<CrabTreeResult<()>>> {
        let (resp, rx) = channel();
        self.send(DiskRequest::Deallocate { page_id, resp })?;
        Ok(rx)
    }

    fn send(&self, request: DiskRequest) -> CrabTreeResult<()> {
        self.request_tx
            .send(request)
            .map_err(|_| CrabTreeError::Internal("disk io worker is gone".to_string()))
    }
}

impl Drop for DiskScheduler {
    fn drop(&mut self) {
        let _ = self.request_tx.send(DiskRequest::Shutdown);
        if let Some(worker) = self.worker.lock().take() {
            if worker.join().is_err() {
                error!("disk io worker panicked");
            }
        }
    }
}
