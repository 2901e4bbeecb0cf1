//! Per-pool object recycling: `objpool`/`structpool`/`plbpool`.
//!
//! Each pool is a free list guarded by a single lock plus an allocation
//! counter; on exhaustion the pool doubles its next allocation batch.
//! Objects are constructed on pop and (conceptually) destructed on push —
//! here that just means the value is dropped and rebuilt by `factory` on
//! the next pop past the free list, since Rust's `Drop` already does
//! per-object teardown without needing a separate destruct step.
//!
//! The underlying structure is conceptually a lock-free queue; the actual
//! allocator behind it is explicitly out of scope, so a
//! `parking_lot::Mutex<Vec<T>>` free list stands in for it here — correct
//! under contention, just not lock-free.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

struct PoolInner<T> {
    free: Mutex<Vec<T>>,
    total: AtomicUsize,
    next_batch: AtomicUsize,
    factory: Box<dyn Fn() -> T + Send + Sync>,
}

/// A recyclable object pool. `ObjPool`/`StructPool`/`PlbPool` are all this
/// type with different element types and factories.
pub struct Pool<T> {
    inner: Arc<PoolInner<T>>,
}

impl<T> Clone for Pool<T> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<T: Send + 'static> Pool<T> {
    pub fn new(initial_batch: usize, factory: impl Fn() -> T + Send + Sync + 'static) -> Self {
        let batch = initial_batch.max(1);
        let seeded: Vec<T> = (0..batch).map(|_| factory()).collect();
        Self {
            inner: Arc::new(PoolInner {
                free: Mutex::new(seeded),
                total: AtomicUsize::new(batch),
                next_batch: AtomicUsize::new(batch),
                factory: Box::new(factory),
            }),
        }
    }

    /// Pops a free object, growing (and doubling the next growth batch) if
    /// the free list is empty.
    pub fn acquire(&self) -> PoolGuard<T> {
        let value = {
            let mut free = self.inner.free.lock();
            free.pop()
        }
        .unwrap_or_else(|| self.grow_and_take());
        PoolGuard { pool: self.clone(), value: Some(value) }
    }

    fn grow_and_take(&self) -> T {
        let batch = self.inner.next_batch.load(Ordering::Relaxed).max(1);
        self.inner.next_batch.store(batch * 2, Ordering::Relaxed);
        self.inner.total.fetch_add(batch, Ordering::Relaxed);
        let mut free = self.inner.free.lock();
        for _ in 1..batch {
            free.push((self.inner.factory)());
        }
        (self.inner.factory)()
    }

    pub fn total(&self) -> usize {
        self.inner.total.load(Ordering::Relaxed)
    }

    pub fn free_count(&self) -> usize {
        self.inner.free.lock().len()
    }
}

/// A checked-out pool object; returns to the free list on drop.
pub struct PoolGuard<T: Send + 'static> {
    pool: Pool<T>,
    value: Option<T>,
}

impl<T: Send + 'static> std::ops::Deref for PoolGuard<T> {
    type Target = T;
    fn deref(&self) -> &T {
        self.value.as_ref().expect("PoolGuard value taken before drop")
    }
}

impl<T: Send + 'static> std::ops::DerefMut for PoolGuard<T> {
    fn deref_mut(&mut self) -> &mut T {
        self.value.as_mut().expect("PoolGuard value taken before drop")
    }
}

impl<T: Send + 'static> Drop for PoolGuard<T> {
    fn drop(&mut self) {
        if let Some(value) = self.value.take() {
            self.pool.inner.free.lock().push(value);
        } else {
            self.pool.inner.total.fetch_sub(1, Ordering::Relaxed);
        }
    }
}

/// Small fixed-layout objects handed out per-request (fan-in bookkeeping,
/// callback context structs).
pub type StructPool<T> = Pool<T>;

/// General-purpose heap objects recycled across requests.
pub type ObjPool<T> = Pool<T>;

/// Page-aligned-in-spirit extent buffers used by the backup/restore
/// workflows' read-write loop. True page alignment is an allocator concern
/// (out of scope); this hands out appropriately-sized, zero-filled `Vec<u8>`
/// buffers instead.
pub fn plb_pool(extent_size: usize) -> Pool<Vec<u8>> {
    Pool::new(2, move || vec![0u8; extent_size])
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn acquire_reuses_released_objects() {
        let created = Arc::new(AtomicU32::new(0));
        let created2 = created.clone();
        let pool: Pool<u32> = Pool::new(1, move || {
            created2.fetch_add(1, Ordering::SeqCst);
            0
        });
        {
            let _g = pool.acquire();
        }
        let _g2 = pool.acquire();
        assert_eq!(created.load(Ordering::SeqCst), 1, "second acquire must reuse the returned object");
    }

    #[test]
    fn exhaustion_doubles_next_batch_and_grows_total() {
        let pool: Pool<u32> = Pool::new(1, || 0);
        let initial_total = pool.total();
        let _guards: Vec<_> = (0..3).map(|_| pool.acquire()).collect();
        assert!(pool.total() > initial_total);
    }

    #[test]
    fn plb_pool_hands_out_correctly_sized_buffers() {
        let pool = plb_pool(4096);
        let buf = pool.acquire();
        assert_eq!(buf.len(), 4096);
    }
}
