use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Blocking FIFO handing buffer descriptors and done tokens between the
/// capture threads. Posts never block; a sentinel value drives shutdown.
pub(crate) struct UpvQueue<T> {
    inner: Mutex<VecDeque<T>>,
    ready: Condvar,
}

fn relock<T>(guard: std::sync::LockResult<MutexGuard<'_, T>>) -> MutexGuard<'_, T> {
    match guard {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl<T> UpvQueue<T> {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(VecDeque::new()),
            ready: Condvar::new(),
        }
    }

    pub(crate) fn enqueue(&self, value: T) {
        let mut q = relock(self.inner.lock());
        q.push_back(value);
        drop(q);
        self.ready.notify_one();
    }

    /// Blocks until an element is available.
    pub(crate) fn dequeue(&self) -> T {
        let mut q = relock(self.inner.lock());
        loop {
            if let Some(value) = q.pop_front() {
                return value;
            }
            q = relock(self.ready.wait(q));
        }
    }

    /// Blocks until an element is available or the timeout expires. Spurious
    /// wakeups re-arm against the original deadline.
    pub(crate) fn dequeue_with_timeout(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut q = relock(self.inner.lock());
        loop {
            if let Some(value) = q.pop_front() {
                return Some(value);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (guard, _) = match self.ready.wait_timeout(q, deadline - now) {
                Ok(res) => res,
                Err(poisoned) => poisoned.into_inner(),
            };
            q = guard;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::UpvQueue;
    use std::sync::Arc;
    use std::thread;
    use std::time::{Duration, Instant};

    #[test]
    fn fifo_order() {
        let q = UpvQueue::new();
        q.enqueue(1);
        q.enqueue(2);
        q.enqueue(3);
        assert_eq!(q.dequeue(), 1);
        assert_eq!(q.dequeue(), 2);
        assert_eq!(q.dequeue(), 3);
    }

    #[test]
    fn timed_dequeue_expires() {
        let q: UpvQueue<i32> = UpvQueue::new();
        let start = Instant::now();
        assert_eq!(q.dequeue_with_timeout(Duration::from_millis(50)), None);
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn timed_dequeue_wakes_on_post() {
        let q = Arc::new(UpvQueue::new());
        let producer = q.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            producer.enqueue(7);
        });
        assert_eq!(q.dequeue_with_timeout(Duration::from_secs(5)), Some(7));
        handle.join().unwrap();
    }

    #[test]
    fn blocking_dequeue_crosses_threads() {
        let q = Arc::new(UpvQueue::new());
        let producer = q.clone();
        let handle = thread::spawn(move || {
            for i in 0..100 {
                producer.enqueue(i);
            }
        });
        for i in 0..100 {
            assert_eq!(q.dequeue(), i);
        }
        handle.join().unwrap();
    }
}
