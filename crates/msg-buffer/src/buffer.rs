//! Bounded FIFO Implementation

use crate::BufferError;

/// Default buffer capacity in messages
pub const DEFAULT_CAPACITY: usize = 256;

/// Fixed-capacity FIFO with a sticky overflow flag
///
/// A push into a full buffer drops the pushed item and sets `overflow`. The
/// flag stays set until it is taken by a consumer or the buffer is cleared.
pub struct BoundedBuffer<T> {
    /// Pre-allocated slots
    slots: Box<[Option<T>]>,
    /// Index of the oldest item
    low: usize,
    /// Index of the next free slot
    high: usize,
    len: usize,
    capacity: usize,
    overflow: bool,
}

impl<T> BoundedBuffer<T> {
    /// Create a buffer holding at most `capacity` items
    pub fn new(capacity: usize) -> Result<Self, BufferError> {
        if capacity == 0 {
            return Err(BufferError::ZeroCapacity);
        }
        let slots: Vec<Option<T>> = (0..capacity).map(|_| None).collect();
        Ok(Self {
            slots: slots.into_boxed_slice(),
            low: 0,
            high: 0,
            len: 0,
            capacity,
            overflow: false,
        })
    }

    /// Append an item, or drop it and mark overflow when full
    pub fn push(&mut self, item: T) -> Result<(), BufferError> {
        if self.len == self.capacity {
            self.overflow = true;
            return Err(BufferError::Full {
                capacity: self.capacity,
            });
        }
        self.slots[self.high] = Some(item);
        self.high = (self.high + 1) % self.capacity;
        self.len += 1;
        Ok(())
    }

    /// Remove the oldest item
    pub fn pop(&mut self) -> Option<T> {
        if self.len == 0 {
            return None;
        }
        let item = self.slots[self.low].take();
        self.low = (self.low + 1) % self.capacity;
        self.len -= 1;
        item
    }

    /// Drop every item and reset the overflow flag
    pub fn clear(&mut self) {
        while self.pop().is_some() {}
        self.low = 0;
        self.high = 0;
        self.overflow = false;
    }

    /// Report the overflow flag and reset it
    pub fn take_overflow(&mut self) -> bool {
        std::mem::replace(&mut self.overflow, false)
    }

    pub fn has_overflow(&self) -> bool {
        self.overflow
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_full(&self) -> bool {
        self.len == self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_push_and_pop() {
        let mut buffer = BoundedBuffer::new(4).unwrap();
        for i in 0..3 {
            buffer.push(i).unwrap();
        }
        assert_eq!(buffer.len(), 3);
        assert_eq!(buffer.pop(), Some(0));
        assert_eq!(buffer.pop(), Some(1));
        assert_eq!(buffer.pop(), Some(2));
        assert_eq!(buffer.pop(), None);
    }

    #[test]
    fn test_wraps_around() {
        let mut buffer = BoundedBuffer::new(3).unwrap();
        for round in 0..5 {
            buffer.push(round * 2).unwrap();
            buffer.push(round * 2 + 1).unwrap();
            assert_eq!(buffer.pop(), Some(round * 2));
            assert_eq!(buffer.pop(), Some(round * 2 + 1));
        }
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_full_drops_newest_and_marks_overflow() {
        let mut buffer = BoundedBuffer::new(2).unwrap();
        buffer.push("a").unwrap();
        buffer.push("b").unwrap();
        assert!(buffer.is_full());
        assert_eq!(buffer.push("c"), Err(BufferError::Full { capacity: 2 }));
        assert!(buffer.has_overflow());

        // Draining does not reset the flag
        assert_eq!(buffer.pop(), Some("a"));
        assert_eq!(buffer.pop(), Some("b"));
        assert!(buffer.has_overflow());

        assert!(buffer.take_overflow());
        assert!(!buffer.take_overflow());
    }

    #[test]
    fn test_clear_resets_overflow() {
        let mut buffer = BoundedBuffer::new(1).unwrap();
        buffer.push(1).unwrap();
        let _ = buffer.push(2);
        buffer.clear();
        assert!(buffer.is_empty());
        assert!(!buffer.has_overflow());
        buffer.push(3).unwrap();
        assert_eq!(buffer.pop(), Some(3));
    }

    #[test]
    fn test_zero_capacity_rejected() {
        assert_eq!(
            BoundedBuffer::<u8>::new(0).err(),
            Some(BufferError::ZeroCapacity)
        );
    }

    proptest! {
        #[test]
        fn prop_fifo_order_preserved(
            items in proptest::collection::vec(any::<u32>(), 0..64),
            capacity in 1usize..32,
        ) {
            let mut buffer = BoundedBuffer::new(capacity).unwrap();
            let mut expected = Vec::new();
            let mut popped = Vec::new();
            for (i, item) in items.iter().enumerate() {
                if buffer.push(*item).is_ok() {
                    expected.push(*item);
                }
                if i % 3 == 2 {
                    if let Some(out) = buffer.pop() {
                        popped.push(out);
                    }
                }
            }
            while let Some(out) = buffer.pop() {
                popped.push(out);
            }
            prop_assert_eq!(popped, expected);
        }
    }
}
