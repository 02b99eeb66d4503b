//! Disk scheduler: a single-consumer FIFO queue serializing page I/O onto
//! one dedicated worker thread.
//!
//! Callers enqueue requests carrying a completion channel and block on it;
//! requests enqueued earlier complete no later than those enqueued later.
//! Dropping the scheduler enqueues a stop sentinel and joins the worker.

use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use bytes::Bytes;
use tracing::{error, trace};

use tempest_common::types::PageId;
use tempest_common::{Error, Result};

use crate::disk::DiskManager;
use crate::PAGE_SIZE;

/// Kind of work a disk request carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Read,
    Write,
    Deallocate,
}

/// A single disk request. Reads complete with the filled page buffer;
/// writes and deallocations complete with `None`.
pub struct DiskRequest {
    pub page_id: PageId,
    pub kind: RequestKind,
    /// Write payload; `None` for reads and deallocations.
    pub data: Option<Bytes>,
    /// Completion signal back to the issuer.
    pub completion: Sender<Result<Option<Bytes>>>,
}

/// Serializes read/write/deallocate requests onto the backing store.
pub struct DiskScheduler {
    queue: Sender<Option<DiskRequest>>,
    worker: Option<JoinHandle<()>>,
}

impl DiskScheduler {
    pub fn new(disk: Arc<DiskManager>) -> Self {
        let (queue, requests) = mpsc::channel::<Option<DiskRequest>>();
        let worker = thread::Builder::new()
            .name("tempest-disk-io".to_string())
            .spawn(move || Self::worker_loop(disk, requests))
            .expect("failed to spawn disk worker thread");

        Self { queue, worker: Some(worker) }
    }

    fn worker_loop(disk: Arc<DiskManager>, requests: Receiver<Option<DiskRequest>>) {
        // `None` is the stop sentinel; a closed channel also ends the loop.
        while let Ok(Some(request)) = requests.recv() {
            let result = Self::execute(&disk, &request);
            if let Err(e) = &result {
                error!(page_id = %request.page_id, "disk request failed: {e}");
            }
            // The issuer may have given up waiting; nothing to do then.
            let _ = request.completion.send(result);
        }
        trace!("disk worker stopped");
    }

    fn execute(disk: &DiskManager, request: &DiskRequest) -> Result<Option<Bytes>> {
        match request.kind {
            RequestKind::Read => {
                let mut buf = vec![0u8; PAGE_SIZE];
                disk.read_page(request.page_id, &mut buf)?;
                Ok(Some(Bytes::from(buf)))
            }
            RequestKind::Write => {
                let data = request
                    .data
                    .as_ref()
                    .ok_or_else(|| Error::invalid_argument("write request without payload"))?;
                disk.write_page(request.page_id, data)?;
                Ok(None)
            }
            RequestKind::Deallocate => {
                disk.deallocate_page(request.page_id)?;
                Ok(None)
            }
        }
    }

    /// Enqueue a request, FIFO relative to every other request.
    pub fn schedule(&self, request: DiskRequest) {
        // A send failure means the worker is gone; the issuer observes it
        // through its completion channel.
        let _ = self.queue.send(Some(request));
    }

    /// Schedule a read of `page_id` and block until it completes.
    pub fn read_page(&self, page_id: PageId) -> Result<Bytes> {
        let (completion, done) = mpsc::channel();
        self.schedule(DiskRequest {
            page_id,
            kind: RequestKind::Read,
            data: None,
            completion,
        });
        match Self::wait(done)? {
            Some(bytes) => Ok(bytes),
            None => Err(Error::internal("read request completed without data")),
        }
    }

    /// Schedule a write of `data` as `page_id` and block until durable
    /// in the backing file.
    pub fn write_page(&self, page_id: PageId, data: Bytes) -> Result<()> {
        let (completion, done) = mpsc::channel();
        self.schedule(DiskRequest {
            page_id,
            kind: RequestKind::Write,
            data: Some(data),
            completion,
        });
        Self::wait(done).map(|_| ())
    }

    /// Schedule a deallocation of `page_id` and block until it completes.
    pub fn deallocate_page(&self, page_id: PageId) -> Result<()> {
        let (completion, done) = mpsc::channel();
        self.schedule(DiskRequest {
            page_id,
            kind: RequestKind::Deallocate,
            data: None,
            completion,
        });
        Self::wait(done).map(|_| ())
    }

    fn wait(done: Receiver<Result<Option<Bytes>>>) -> Result<Option<Bytes>> {
        done.recv()
            .map_err(|_| Error::internal("disk worker stopped before completing the request"))?
    }
}

impl Drop for DiskScheduler {
    fn drop(&mut self) {
        let _ = self.queue.send(None);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempest_common::testing::fixtures;
    use tempfile::tempdir;

    fn create_scheduler() -> (DiskScheduler, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let disk = Arc::new(DiskManager::new(dir.path().join("test.db")).unwrap());
        (DiskScheduler::new(disk), dir)
    }

    #[test]
    fn test_write_then_read() {
        let (scheduler, _dir) = create_scheduler();

        let payload = Bytes::from(fixtures::stamped_page(PAGE_SIZE, 11));
        scheduler.write_page(PageId(5), payload.clone()).unwrap();

        let read = scheduler.read_page(PageId(5)).unwrap();
        assert_eq!(read, payload);
    }

    #[test]
    fn test_read_of_fresh_page_is_zeroed() {
        let (scheduler, _dir) = create_scheduler();
        let read = scheduler.read_page(PageId(33)).unwrap();
        assert_eq!(read.len(), PAGE_SIZE);
        assert!(read.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_deallocate_round_trip() {
        let (scheduler, _dir) = create_scheduler();

        let payload = Bytes::from(fixtures::page_fill(PAGE_SIZE, 0xCD));
        scheduler.write_page(PageId(0), payload).unwrap();
        scheduler.deallocate_page(PageId(0)).unwrap();

        let read = scheduler.read_page(PageId(0)).unwrap();
        assert!(read.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_requests_complete_in_order() {
        let (scheduler, _dir) = create_scheduler();

        // Raw `schedule` calls with a shared completion channel: the
        // worker must deliver completions in enqueue order.
        let (completion, done) = mpsc::channel();
        for i in 0..8u64 {
            scheduler.schedule(DiskRequest {
                page_id: PageId(i),
                kind: RequestKind::Write,
                data: Some(Bytes::from(fixtures::page_fill(PAGE_SIZE, i as u8))),
                completion: completion.clone(),
            });
        }
        for _ in 0..8 {
            done.recv().unwrap().unwrap();
        }

        for i in 0..8u64 {
            let read = scheduler.read_page(PageId(i)).unwrap();
            assert!(read.iter().all(|&b| b == i as u8));
        }
    }

    #[test]
    fn test_drop_joins_worker() {
        let (scheduler, _dir) = create_scheduler();
        scheduler
            .write_page(PageId(1), Bytes::from(fixtures::page_fill(PAGE_SIZE, 1)))
            .unwrap();
        drop(scheduler);
    }

    #[test]
    fn test_wrong_sized_write_surfaces_error() {
        let (scheduler, _dir) = create_scheduler();
        let result = scheduler.write_page(PageId(0), Bytes::from_static(b"short"));
        assert!(result.is_err());
    }
}
