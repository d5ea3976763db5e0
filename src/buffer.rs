use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam::queue::ArrayQueue;

use crate::instrument::Instrument;

const FREE_LIST_DEPTH: usize = 1024;

struct PoolInner {
    label: String,
    capacity: usize,
    free: ArrayQueue<Vec<u8>>,
    allocations: AtomicU64,
    instrument: Arc<dyn Instrument>,
}

/// A free list of fixed-capacity byte buffers.
///
/// `get` pops recycled storage when available and allocates otherwise;
/// dropping a [`Buffer`] pushes its storage back. The fast path is one
/// atomic counter bump plus a lock-free queue operation, so the pool can
/// be shared freely between the workers of a connection or listener.
#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

impl Pool {
    pub fn new(label: &str, capacity: usize, instrument: Arc<dyn Instrument>) -> Self {
        Pool {
            inner: Arc::new(PoolInner {
                label: label.to_string(),
                capacity,
                free: ArrayQueue::new(FREE_LIST_DEPTH),
                allocations: AtomicU64::new(0),
                instrument,
            }),
        }
    }

    pub fn get(&self) -> Buffer {
        self.inner.allocations.fetch_add(1, Ordering::Relaxed);
        let data = match self.inner.free.pop() {
            Some(data) => data,
            None => {
                self.inner.instrument.allocate(&self.inner.label);
                vec![0u8; self.inner.capacity]
            }
        };
        Buffer {
            data,
            used: 0,
            pool: Arc::clone(&self.inner),
        }
    }

    /// Capacity of every buffer this pool hands out.
    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Lifetime `get()` count. Grows monotonically; leak diagnostics only.
    pub fn allocations(&self) -> u64 {
        self.inner.allocations.load(Ordering::Relaxed)
    }

    /// Number of buffers currently sitting on the free list.
    pub fn pooled(&self) -> usize {
        self.inner.free.len()
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }
}

impl fmt::Debug for Pool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("label", &self.inner.label)
            .field("capacity", &self.inner.capacity)
            .field("allocations", &self.allocations())
            .finish()
    }
}

/// A fixed-capacity byte buffer owned by a [`Pool`].
///
/// `used` tracks how many leading bytes are meaningful; it never exceeds
/// the capacity. Dropping the buffer returns the storage to its pool.
/// Where a buffer must be aliased across workers (the in-flight window and
/// the retransmission monitor both hold a sent DATA), wrap the owning
/// message in an `Arc`; the storage is recycled when the last holder drops.
pub struct Buffer {
    data: Vec<u8>,
    used: usize,
    pool: Arc<PoolInner>,
}

impl Buffer {
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn used(&self) -> usize {
        self.used
    }

    pub fn set_used(&mut self, used: usize) {
        debug_assert!(used <= self.data.len());
        self.used = used;
    }

    /// The meaningful prefix, `[0..used)`.
    pub fn bytes(&self) -> &[u8] {
        &self.data[..self.used]
    }

    /// The whole storage, for writers that fill it before `set_used`.
    pub fn raw_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

impl Clone for Buffer {
    /// Copies contents into a fresh buffer drawn from the same pool.
    fn clone(&self) -> Self {
        let mut fresh = Pool {
            inner: Arc::clone(&self.pool),
        }
        .get();
        fresh.data[..self.used].copy_from_slice(&self.data[..self.used]);
        fresh.used = self.used;
        fresh
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        let data = std::mem::take(&mut self.data);
        if !data.is_empty() && self.pool.free.push(data).is_err() {
            self.pool.instrument.release(&self.pool.label);
        }
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("capacity", &self.data.len())
            .field("used", &self.used)
            .finish()
    }
}
