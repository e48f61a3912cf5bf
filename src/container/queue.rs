//! Blocking FIFO hand-off between the reactor and container workers.

use crossbeam::channel::{unbounded, Receiver, Sender};

/// A synchronized FIFO queue. [`push`](SyncQueue::push) never blocks;
/// [`pop`](SyncQueue::pop) blocks while the queue is empty.
///
/// The queue holds both channel ends itself, so a push cannot fail while
/// the queue is alive and `pop` returns `None` only if the queue is being
/// torn down underneath the caller.
pub struct SyncQueue<T> {
    tx: Sender<T>,
    rx: Receiver<T>,
}

impl<T> SyncQueue<T> {
    pub fn new() -> Self {
        let (tx, rx) = unbounded();
        Self { tx, rx }
    }

    /// Appends an entry. Non-blocking; safe from any thread.
    #[inline]
    pub fn push(&self, item: T) {
        let _ = self.tx.send(item);
    }

    /// Removes the oldest entry, blocking while the queue is empty.
    #[inline]
    pub fn pop(&self) -> Option<T> {
        self.rx.recv().ok()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

impl<T> Default for SyncQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn fifo_order() {
        let queue = SyncQueue::new();
        for i in 0..10 {
            queue.push(i);
        }
        assert_eq!(queue.len(), 10);
        for i in 0..10 {
            assert_eq!(queue.pop(), Some(i));
        }
        assert!(queue.is_empty());
    }

    #[test]
    fn pop_blocks_until_push() {
        let queue = Arc::new(SyncQueue::new());

        let popper = {
            let queue = queue.clone();
            thread::spawn(move || queue.pop())
        };

        // Give the popper time to park on the empty queue.
        thread::sleep(Duration::from_millis(50));
        assert!(!popper.is_finished());

        queue.push(42u32);
        assert_eq!(popper.join().unwrap(), Some(42));
    }
}
