use parking_lot::Mutex;
use std::collections::VecDeque;

/// The minimum number of display buffer indices to hand out before allowing
/// freed ones to be reclaimed. Protocols that rapidly create, use and destroy
/// buffers would otherwise reuse an index immediately, making draw operations
/// unnecessarily synchronous on the client.
pub const BUFFER_POOL_INITIAL_SIZE: i32 = 1024;

/// A pool of non-negative integers. Integers can be removed from and later
/// freed back into the pool. New integers are handed out while the pool has
/// not yet met its minimum size or when the free list is exhausted; freed
/// integers are returned otherwise, oldest first.
pub struct Pool {
    inner: Mutex<Inner>,
}

struct Inner {
    min_size: i32,
    next_value: i32,
    active: usize,
    free: VecDeque<i32>,
}

impl Pool {
    #[inline]
    pub fn new(min_size: i32) -> Pool {
        Pool {
            inner: Mutex::new(Inner {
                min_size,
                next_value: 0,
                active: 0,
                free: VecDeque::new(),
            }),
        }
    }

    /// Returns the next available integer. All integers returned are
    /// non-negative; fresh ones are returned in sequence starting from 0.
    pub fn next(&self) -> i32 {
        let mut inner = self.inner.lock();
        inner.active += 1;

        if inner.free.is_empty() || inner.next_value < inner.min_size {
            let value = inner.next_value;
            inner.next_value += 1;
            return value;
        }

        // Guarded by the emptiness check above.
        inner.free.pop_front().unwrap()
    }

    /// Returns the given integer to the pool, making it available to future
    /// calls to `next`.
    pub fn free(&self, value: i32) {
        let mut inner = self.inner.lock();
        inner.active -= 1;
        inner.free.push_back(value);
    }

    /// Number of integers currently handed out.
    #[inline]
    pub fn active(&self) -> usize {
        self.inner.lock().active
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_sequence() {
        let pool = Pool::new(10);
        for i in 0..100 {
            assert_eq!(pool.next(), i);
        }
        for i in 0..100 {
            pool.free(i);
        }
        // The pool was grown past its minimum, so the freed values come back
        // in FIFO order.
        for i in 0..100 {
            assert_eq!(pool.next(), i);
        }
    }

    #[test]
    fn test_active_count() {
        let pool = Pool::new(10);
        let values: Vec<_> = (0..50).map(|_| pool.next()).collect();
        assert_eq!(pool.active(), 50);
        for v in values {
            pool.free(v);
        }
        assert_eq!(pool.active(), 0);
    }

    #[test]
    fn test_immediate_reuse_at_zero_min() {
        let pool = Pool::new(0);
        assert_eq!(pool.next(), 0);
        pool.free(0);
        assert_eq!(pool.next(), 0);
    }

    #[test]
    fn test_min_size_defers_reuse() {
        let pool = Pool::new(4);
        assert_eq!(pool.next(), 0);
        pool.free(0);
        // 0 is in the free list, but the pool has not grown to its minimum
        // yet, so fresh values keep coming.
        assert_eq!(pool.next(), 1);
        assert_eq!(pool.next(), 2);
        assert_eq!(pool.next(), 3);
        // Minimum reached, the freed value is now preferred.
        assert_eq!(pool.next(), 0);
    }
}
