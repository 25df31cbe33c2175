//! Shared page pools.
//!
//! Send and receive paths draw fixed-size byte pages from a bounded
//! pool. Workers keep local free lists refilled in batches to keep the
//! shared lock cool. Receive pages are reference counted: every message
//! descriptor carved out of a page holds one reference, and the page
//! returns to the pool when the last application thread lets go.

use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};
use std::sync::Arc;

use iclaustron_core::error::{IcError, IcResult};
use parking_lot::Mutex;

/// Default page size for framed send buffers.
pub const SEND_PAGE_SIZE: usize = 32 * 1024;

/// Default page size for receive buffers; one page must hold the largest
/// accepted message.
pub const RECV_PAGE_SIZE: usize = 128 * 1024;

/// How many pages a worker pulls from the shared pool per refill.
pub const LOCAL_REFILL_COUNT: usize = 8;

/// A bounded pool of byte pages.
#[derive(Debug)]
pub struct PagePool {
    page_size: usize,
    max_pages: usize,
    free: Mutex<Vec<Vec<u8>>>,
    allocated: AtomicUsize,
}

impl PagePool {
    #[must_use]
    pub fn new(page_size: usize, max_pages: usize) -> Arc<PagePool> {
        Arc::new(PagePool {
            page_size,
            max_pages,
            free: Mutex::new(Vec::new()),
            allocated: AtomicUsize::new(0),
        })
    }

    #[must_use]
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// One empty page, from the free list or freshly allocated.
    pub fn get_page(&self) -> IcResult<Vec<u8>> {
        if let Some(page) = self.free.lock().pop() {
            return Ok(page);
        }
        let allocated = self.allocated.fetch_add(1, Ordering::Relaxed);
        if allocated >= self.max_pages {
            self.allocated.fetch_sub(1, Ordering::Relaxed);
            return Err(IcError::MemAlloc);
        }
        Ok(Vec::with_capacity(self.page_size))
    }

    /// Refills a worker's local free list up to `count` pages, touching
    /// the shared lock once.
    pub fn refill_local(&self, local: &mut Vec<Vec<u8>>, count: usize) -> IcResult<()> {
        {
            let mut free = self.free.lock();
            while local.len() < count {
                match free.pop() {
                    Some(page) => local.push(page),
                    None => break,
                }
            }
        }
        while local.len() < count {
            local.push(self.get_page()?);
        }
        Ok(())
    }

    /// Returns a page; contents are cleared here so a fresh page is
    /// always empty.
    pub fn return_page(&self, mut page: Vec<u8>) {
        page.clear();
        let mut free = self.free.lock();
        free.push(page);
    }

    /// Returns a whole batch of pages under one lock.
    pub fn return_pages(&self, pages: impl IntoIterator<Item = Vec<u8>>) {
        let mut free = self.free.lock();
        for mut page in pages {
            page.clear();
            free.push(page);
        }
    }

    /// Pages currently handed out or cached in local lists.
    #[must_use]
    pub fn pages_outstanding(&self) -> usize {
        self.allocated.load(Ordering::Relaxed) - self.free.lock().len()
    }
}

/// A filled receive page shared by the message descriptors carved from
/// it.
///
/// The reference count tracks undelivered descriptors; the buffer goes
/// back to its pool when the last holder drops the page.
#[derive(Debug)]
pub struct RecvPage {
    buf: Vec<u8>,
    refs: AtomicI32,
    pool: Arc<PagePool>,
}

impl RecvPage {
    /// Wraps a filled page, starting with `refs` outstanding references.
    #[must_use]
    pub fn new(buf: Vec<u8>, refs: i32, pool: Arc<PagePool>) -> Arc<RecvPage> {
        Arc::new(RecvPage {
            buf,
            refs: AtomicI32::new(refs),
            pool,
        })
    }

    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Releases `count` references, as instructed by the last descriptor
    /// of a delivered batch.
    pub fn release(&self, count: i32) {
        let before = self.refs.fetch_sub(count, Ordering::AcqRel);
        debug_assert!(before >= count, "receive page over-released");
    }

    #[must_use]
    pub fn outstanding(&self) -> i32 {
        self.refs.load(Ordering::Acquire)
    }
}

impl Drop for RecvPage {
    fn drop(&mut self) {
        let buf = std::mem::take(&mut self.buf);
        self.pool.return_page(buf);
    }
}
