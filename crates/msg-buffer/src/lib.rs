//! Bounded Message Buffer
//!
//! Fixed-capacity FIFO storage for received messages. Items move in on push
//! and out on pop; overflow is a sticky flag reported once to the reader.

mod buffer;
mod rx;

pub use buffer::{BoundedBuffer, DEFAULT_CAPACITY};
pub use rx::{Batch, RxBuffer};

use thiserror::Error;

/// Buffer errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BufferError {
    #[error("Buffer full (capacity {capacity})")]
    Full { capacity: usize },

    #[error("Buffer closed")]
    Closed,

    #[error("Buffer capacity must be non-zero")]
    ZeroCapacity,
}
