//! Bounded non-blocking FIFO for inter-stage queues.
//!
//! Every queue between pipeline stages is one of these: fixed capacity,
//! lock-free, and strictly non-blocking. A full queue rejects the push and
//! hands the value back, which is how backpressure propagates upstream
//! (the producer's step returns `Idle` instead of blocking).

use crossbeam_queue::ArrayQueue;

pub struct Fifo<T> {
    queue: ArrayQueue<T>,
}

impl<T> Fifo<T> {
    /// Create a queue with the given capacity.
    ///
    /// # Panics
    /// Panics if `capacity` is 0.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: ArrayQueue::new(capacity),
        }
    }

    /// Push an item; on a full queue the item is returned to the caller.
    pub fn push(&self, item: T) -> Result<(), T> {
        self.queue.push(item)
    }

    /// Pop the oldest item, or `None` when empty.
    #[must_use]
    pub fn pop(&self) -> Option<T> {
        self.queue.pop()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    #[must_use]
    pub fn is_full(&self) -> bool {
        self.queue.is_full()
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }

    /// Pop and drop everything currently queued; returns how many items
    /// were discarded. Used on shutdown so queued page references release
    /// their pages.
    pub fn drain(&self) -> usize {
        let mut n = 0;
        while self.queue.pop().is_some() {
            n += 1;
        }
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_push_pop_order() {
        let f = Fifo::new(4);
        for i in 0..4 {
            f.push(i).unwrap();
        }
        assert!(f.is_full());
        assert_eq!(f.push(99), Err(99));
        for i in 0..4 {
            assert_eq!(f.pop(), Some(i));
        }
        assert!(f.pop().is_none());
    }

    #[test]
    fn test_drain() {
        let f = Fifo::new(8);
        for i in 0..5 {
            f.push(i).unwrap();
        }
        assert_eq!(f.drain(), 5);
        assert!(f.is_empty());
    }

    #[test]
    fn test_mpmc_transfers_everything() {
        let f = Arc::new(Fifo::new(64));
        let total = 10_000u64;

        let producer = {
            let f = Arc::clone(&f);
            thread::spawn(move || {
                for i in 0..total {
                    let mut v = i;
                    loop {
                        match f.push(v) {
                            Ok(()) => break,
                            Err(back) => {
                                v = back;
                                thread::yield_now();
                            }
                        }
                    }
                }
            })
        };

        let consumer = {
            let f = Arc::clone(&f);
            thread::spawn(move || {
                let mut sum = 0u64;
                let mut seen = 0u64;
                while seen < total {
                    if let Some(v) = f.pop() {
                        sum += v;
                        seen += 1;
                    } else {
                        thread::yield_now();
                    }
                }
                sum
            })
        };

        producer.join().unwrap();
        let sum = consumer.join().unwrap();
        assert_eq!(sum, total * (total - 1) / 2);
    }
}
