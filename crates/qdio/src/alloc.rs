//! Queue Storage Pool
//!
//! Cache-backed allocation of ring pages.
//!
//! # Design
//!
//! - Freed pages are zeroed and kept for reuse instead of going back to the
//!   system allocator
//! - An optional page budget turns exhaustion into a typed error
//! - Pages return to the pool when the last holder drops them, so an
//!   allocation that fails half way unwinds by simply dropping what it has

use std::mem::ManuallyDrop;
use std::ops::Deref;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{QdioError, QdioResult};
use crate::ring::RingPage;

/// Pool configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Upper bound on pages handed out at once, `None` for unbounded
    pub max_pages: Option<usize>,
    /// Pages allocated up front
    pub prealloc_pages: usize,
}

/// Pool of ring pages
pub struct QueuePool {
    /// Cached free pages
    free: Mutex<Vec<RingPage>>,
    /// Pages currently handed out
    outstanding: AtomicUsize,
    /// Total fresh allocations
    allocated: AtomicUsize,
    max_pages: Option<usize>,
}

impl QueuePool {
    /// Create new pool
    pub fn new(config: PoolConfig) -> Arc<Self> {
        let mut free = Vec::with_capacity(config.prealloc_pages);
        for _ in 0..config.prealloc_pages {
            match RingPage::new() {
                Some(page) => free.push(page),
                None => break,
            }
        }
        let allocated = free.len();

        Arc::new(Self {
            free: Mutex::new(free),
            outstanding: AtomicUsize::new(0),
            allocated: AtomicUsize::new(allocated),
            max_pages: config.max_pages,
        })
    }

    /// Unbounded pool with no preallocation
    pub fn unbounded() -> Arc<Self> {
        Self::new(PoolConfig::default())
    }

    /// Take a zeroed page from the pool
    pub fn get_page(self: &Arc<Self>) -> QdioResult<PooledPage> {
        let reserved = self
            .outstanding
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| match self.max_pages {
                Some(max) if n >= max => None,
                _ => Some(n + 1),
            });
        if reserved.is_err() {
            return Err(QdioError::OutOfMemory(format!(
                "queue pool budget of {} pages exhausted",
                self.max_pages.unwrap_or_default()
            )));
        }

        let cached = self.free.lock().pop();
        let page = match cached {
            Some(page) => page,
            None => match RingPage::new() {
                Some(page) => {
                    self.allocated.fetch_add(1, Ordering::Relaxed);
                    page
                }
                None => {
                    self.outstanding.fetch_sub(1, Ordering::AcqRel);
                    return Err(QdioError::OutOfMemory("ring page allocation failed".into()));
                }
            },
        };

        Ok(PooledPage {
            page: ManuallyDrop::new(page),
            pool: Arc::clone(self),
        })
    }

    fn put_page(&self, page: RingPage) {
        page.clear();
        self.free.lock().push(page);
        self.outstanding.fetch_sub(1, Ordering::AcqRel);
    }

    /// Pages currently handed out
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    /// Pages cached for reuse
    pub fn available(&self) -> usize {
        self.free.lock().len()
    }

    /// Pages ever allocated from the system
    pub fn allocated(&self) -> usize {
        self.allocated.load(Ordering::Relaxed)
    }
}

/// A ring page on loan from a [`QueuePool`]
pub struct PooledPage {
    page: ManuallyDrop<RingPage>,
    pool: Arc<QueuePool>,
}

impl Deref for PooledPage {
    type Target = RingPage;

    fn deref(&self) -> &RingPage {
        &self.page
    }
}

impl Drop for PooledPage {
    fn drop(&mut self) {
        // never touched again after this point
        let page = unsafe { ManuallyDrop::take(&mut self.page) };
        self.pool.put_page(page);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_alloc() {
        let pool = QueuePool::unbounded();
        let page = pool.get_page().unwrap();
        assert_eq!(pool.outstanding(), 1);
        assert_eq!(pool.allocated(), 1);
        drop(page);
        assert_eq!(pool.outstanding(), 0);
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn test_pool_reuses_zeroed_pages() {
        let pool = QueuePool::unbounded();
        let page = pool.get_page().unwrap();
        page.slsb()[7].store(0xa1, Ordering::Relaxed);
        let addr = page.addr();
        drop(page);

        let again = pool.get_page().unwrap();
        assert_eq!(again.addr(), addr);
        assert_eq!(again.slsb()[7].load(Ordering::Relaxed), 0);
        assert_eq!(pool.allocated(), 1);
    }

    #[test]
    fn test_pool_prealloc() {
        let pool = QueuePool::new(PoolConfig {
            max_pages: None,
            prealloc_pages: 4,
        });
        assert_eq!(pool.available(), 4);
        let _p = pool.get_page().unwrap();
        assert_eq!(pool.available(), 3);
        assert_eq!(pool.allocated(), 4);
    }

    #[test]
    fn test_pool_exhaustion() {
        let pool = QueuePool::new(PoolConfig {
            max_pages: Some(2),
            prealloc_pages: 0,
        });
        let _a = pool.get_page().unwrap();
        let _b = pool.get_page().unwrap();
        let err = pool.get_page().err().unwrap();
        assert!(matches!(err, QdioError::OutOfMemory(_)));
        assert_eq!(pool.outstanding(), 2);
    }
}
