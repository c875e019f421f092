use std::sync::{Condvar, Mutex, MutexGuard};

use log::error;

/// Fixed set of large transfer buffers handed out in FIFO order.
///
/// Single producer, single consumer: the reader thread acquires buffers for
/// bulk-IN transfers and the parser thread releases them after draining.
/// Buffers must come back in the order they were handed out; an out-of-order
/// release means the pipeline lost track of a loan and is logged as misuse.
pub(crate) struct BufferPool {
    state: Mutex<PoolState>,
    available: Condvar,
    buf_size: usize,
}

struct PoolState {
    buffers: Vec<Box<[u8]>>,
    rd_idx: usize,
    wr_idx: usize,
    remain: usize,
}

fn relock<T>(guard: std::sync::LockResult<MutexGuard<'_, T>>) -> MutexGuard<'_, T> {
    match guard {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl BufferPool {
    pub(crate) fn new(buf_size: usize, count: usize) -> Self {
        let buffers = (0..count)
            .map(|_| vec![0u8; buf_size].into_boxed_slice())
            .collect::<Vec<_>>();
        Self {
            state: Mutex::new(PoolState {
                buffers,
                rd_idx: 0,
                wr_idx: 0,
                remain: count,
            }),
            available: Condvar::new(),
            buf_size,
        }
    }

    pub(crate) fn buf_size(&self) -> usize {
        self.buf_size
    }

    /// Number of buffers currently free.
    pub(crate) fn remaining(&self) -> usize {
        relock(self.state.lock()).remain
    }

    /// Blocks until a buffer is free and returns its stable heap address.
    pub(crate) fn acquire(&self) -> *mut u8 {
        let mut st = relock(self.state.lock());
        while st.remain == 0 {
            st = relock(self.available.wait(st));
        }
        let idx = st.rd_idx;
        let ptr = st.buffers[idx].as_mut_ptr();
        st.rd_idx = (st.rd_idx + 1) % st.buffers.len();
        st.remain -= 1;
        ptr
    }

    /// Returns a buffer to the pool. Must be the least recently acquired one
    /// still outstanding; anything else is misuse and corrupts the rotation.
    pub(crate) fn release(&self, ptr: *const u8) -> bool {
        let mut st = relock(self.state.lock());
        let in_order = std::ptr::eq(st.buffers[st.wr_idx].as_ptr(), ptr);
        if !in_order {
            error!("buffer pool release out of order, pool rotation is corrupted");
        }
        st.wr_idx = (st.wr_idx + 1) % st.buffers.len();
        st.remain += 1;
        drop(st);
        self.available.notify_one();
        in_order
    }

    /// Reverses the most recent acquire. Used by the reader at shutdown to
    /// hand back the buffer still attached to the in-flight transfer without
    /// disturbing the FIFO ordering of buffers the parser has yet to release.
    pub(crate) fn unget(&self, ptr: *const u8) -> bool {
        let mut st = relock(self.state.lock());
        let idx = (st.rd_idx + st.buffers.len() - 1) % st.buffers.len();
        let matches = std::ptr::eq(st.buffers[idx].as_ptr(), ptr);
        if !matches {
            error!("buffer pool unget does not match the last acquire");
            return false;
        }
        st.rd_idx = idx;
        st.remain += 1;
        drop(st);
        self.available.notify_one();
        true
    }
}

#[cfg(test)]
mod tests {
    use super::BufferPool;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn fifo_identity_across_loans() {
        let pool = BufferPool::new(64, 2);
        let a = pool.acquire();
        let b = pool.acquire();
        assert!(!std::ptr::eq(a, b));
        assert!(pool.release(a));
        assert!(pool.release(b));
        // The rotation wraps and hands the same storage back in the same order.
        assert!(std::ptr::eq(pool.acquire(), a as *const u8));
        assert!(std::ptr::eq(pool.acquire(), b as *const u8));
    }

    #[test]
    fn out_of_order_release_is_flagged() {
        let pool = BufferPool::new(64, 4);
        let a = pool.acquire();
        let b = pool.acquire();
        assert!(!pool.release(b));
        let _ = a;
    }

    #[test]
    fn acquire_blocks_until_release() {
        let pool = Arc::new(BufferPool::new(64, 1));
        let first = pool.acquire();
        assert_eq!(pool.remaining(), 0);

        let releaser = pool.clone();
        let first_addr = first as usize;
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            releaser.release(first_addr as *const u8);
        });

        // Blocks until the helper thread gives the single buffer back.
        let again = pool.acquire();
        assert_eq!(again as usize, first_addr);
        handle.join().unwrap();
    }

    #[test]
    fn unget_reverses_last_acquire() {
        let pool = BufferPool::new(64, 3);
        let a = pool.acquire();
        let b = pool.acquire();
        assert!(pool.unget(b));
        assert_eq!(pool.remaining(), 2);
        // b is next in line again.
        assert!(std::ptr::eq(pool.acquire(), b as *const u8));
        assert!(pool.release(a));
    }

    #[test]
    fn unget_rejects_wrong_pointer() {
        let pool = BufferPool::new(64, 3);
        let a = pool.acquire();
        let _b = pool.acquire();
        assert!(!pool.unget(a));
    }
}
