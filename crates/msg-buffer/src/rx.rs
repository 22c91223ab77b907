//! Blocking Receive Buffer
//!
//! Wraps a `BoundedBuffer` in a mutex and condition variable so readers can
//! wait for arrivals with a timeout.

use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace};

use crate::buffer::BoundedBuffer;
use crate::BufferError;

/// Items taken by one read, with the overflow indication for that read
#[derive(Debug)]
pub struct Batch<T> {
    pub items: Vec<T>,
    /// Set on the first non-empty batch after an overflow
    pub overflow: bool,
}

impl<T> Batch<T> {
    fn empty() -> Self {
        Self {
            items: Vec::new(),
            overflow: false,
        }
    }
}

struct RxState<T> {
    buffer: BoundedBuffer<T>,
    closed: bool,
}

/// Thread-safe FIFO consumers can block on
pub struct RxBuffer<T> {
    state: Mutex<RxState<T>>,
    available: Condvar,
}

impl<T> RxBuffer<T> {
    pub fn new(capacity: usize) -> Result<Self, BufferError> {
        Ok(Self {
            state: Mutex::new(RxState {
                buffer: BoundedBuffer::new(capacity)?,
                closed: false,
            }),
            available: Condvar::new(),
        })
    }

    /// Append an item and wake one waiting reader
    pub fn push(&self, item: T) -> Result<(), BufferError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(BufferError::Closed);
        }
        state.buffer.push(item)?;
        drop(state);
        self.available.notify_one();
        Ok(())
    }

    /// Take up to `max` items in arrival order
    ///
    /// Waits until at least one item is present, the buffer is closed, or
    /// `timeout` elapses. A zero timeout polls once.
    pub fn pop_batch(&self, max: usize, timeout: Duration) -> Result<Batch<T>, BufferError> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();

        while state.buffer.is_empty() && !state.closed && !timeout.is_zero() {
            if self.available.wait_until(&mut state, deadline).timed_out() {
                break;
            }
        }
        if state.closed {
            return Err(BufferError::Closed);
        }
        if max == 0 || state.buffer.is_empty() {
            return Ok(Batch::empty());
        }

        let mut items = Vec::with_capacity(max.min(state.buffer.len()));
        while items.len() < max {
            match state.buffer.pop() {
                Some(item) => items.push(item),
                None => break,
            }
        }
        let overflow = state.buffer.take_overflow();
        trace!(count = items.len(), overflow, "RX batch taken");
        Ok(Batch { items, overflow })
    }

    /// Drop every item and the overflow flag
    pub fn clear(&self) {
        self.state.lock().buffer.clear();
    }

    /// Refuse further pushes, drop pending items and wake every reader
    ///
    /// Returns the number of items dropped.
    pub fn close(&self) -> usize {
        let mut state = self.state.lock();
        state.closed = true;
        let dropped = state.buffer.len();
        state.buffer.clear();
        drop(state);
        self.available.notify_all();
        if dropped > 0 {
            debug!(dropped, "RX buffer closed with pending items");
        }
        dropped
    }

    pub fn len(&self) -> usize {
        self.state.lock().buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().buffer.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.state.lock().buffer.capacity()
    }

    pub fn has_overflow(&self) -> bool {
        self.state.lock().buffer.has_overflow()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_poll_on_empty_returns_immediately() {
        let rx = RxBuffer::<u8>::new(4).unwrap();
        let start = Instant::now();
        let batch = rx.pop_batch(10, Duration::ZERO).unwrap();
        assert!(batch.items.is_empty());
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[test]
    fn test_timeout_elapses_without_data() {
        let rx = RxBuffer::<u8>::new(4).unwrap();
        let start = Instant::now();
        let batch = rx.pop_batch(1, Duration::from_millis(60)).unwrap();
        assert!(batch.items.is_empty());
        assert!(start.elapsed() >= Duration::from_millis(60));
    }

    #[test]
    fn test_reader_wakes_on_push() {
        let rx = Arc::new(RxBuffer::new(4).unwrap());
        let writer = Arc::clone(&rx);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            writer.push(7u32).unwrap();
        });

        let start = Instant::now();
        let batch = rx.pop_batch(4, Duration::from_secs(5)).unwrap();
        assert_eq!(batch.items, vec![7]);
        assert!(start.elapsed() < Duration::from_secs(1));
        handle.join().unwrap();
    }

    #[test]
    fn test_batch_respects_max() {
        let rx = RxBuffer::new(8).unwrap();
        for i in 0..5 {
            rx.push(i).unwrap();
        }
        let batch = rx.pop_batch(3, Duration::ZERO).unwrap();
        assert_eq!(batch.items, vec![0, 1, 2]);
        let batch = rx.pop_batch(3, Duration::ZERO).unwrap();
        assert_eq!(batch.items, vec![3, 4]);
    }

    #[test]
    fn test_overflow_reported_once() {
        let rx = RxBuffer::new(2).unwrap();
        rx.push(1).unwrap();
        rx.push(2).unwrap();
        assert!(rx.push(3).is_err());

        let first = rx.pop_batch(1, Duration::ZERO).unwrap();
        assert_eq!(first.items, vec![1]);
        assert!(first.overflow);

        let second = rx.pop_batch(1, Duration::ZERO).unwrap();
        assert_eq!(second.items, vec![2]);
        assert!(!second.overflow);
    }

    #[test]
    fn test_empty_read_keeps_overflow_pending() {
        let rx = RxBuffer::new(1).unwrap();
        rx.push(1).unwrap();
        let _ = rx.push(2);
        let _ = rx.pop_batch(0, Duration::ZERO).unwrap();
        assert!(rx.has_overflow());
    }

    #[test]
    fn test_close_wakes_readers() {
        let rx = Arc::new(RxBuffer::<u8>::new(4).unwrap());
        let reader = Arc::clone(&rx);
        let handle = thread::spawn(move || reader.pop_batch(1, Duration::from_secs(10)));

        thread::sleep(Duration::from_millis(30));
        rx.close();
        let result = handle.join().unwrap();
        assert_eq!(result.err(), Some(BufferError::Closed));
        assert_eq!(rx.push(1).err(), Some(BufferError::Closed));
    }

    #[test]
    fn test_concurrent_producers_keep_per_producer_order() {
        let rx = Arc::new(RxBuffer::new(1024).unwrap());
        let handles: Vec<_> = (0..4u32)
            .map(|producer| {
                let rx = Arc::clone(&rx);
                thread::spawn(move || {
                    for seq in 0..100u32 {
                        rx.push((producer, seq)).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let batch = rx.pop_batch(1024, Duration::ZERO).unwrap();
        assert_eq!(batch.items.len(), 400);
        for producer in 0..4u32 {
            let seqs: Vec<u32> = batch
                .items
                .iter()
                .filter(|(p, _)| *p == producer)
                .map(|(_, s)| *s)
                .collect();
            assert_eq!(seqs, (0..100).collect::<Vec<_>>());
        }
    }
}
