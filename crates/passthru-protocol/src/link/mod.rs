//! Device Links to the Translator Hardware
//!
//! - `SerialLink` talks to the translator over a serial port
//! - `MockLink` is an in-memory double for tests

pub mod mock;
mod serial;

pub use mock::MockLink;
pub use serial::SerialLink;

use std::time::Duration;

use crate::error::DeviceError;
use crate::frame::Frame;

/// Byte transport to the translator
///
/// Implementations must be usable from several threads at once: API callers
/// send while the inbound pump blocks in `receive`.
pub trait DeviceLink: Send + Sync {
    /// Send raw bytes, waiting at most `timeout` (zero means the link default)
    fn send(&self, bytes: &[u8], timeout: Duration) -> Result<(), DeviceError>;

    /// Receive the next chunk of bytes
    ///
    /// Blocks up to an internal poll timeout and returns `Ok(None)` when
    /// nothing arrived.
    fn receive(&self) -> Result<Option<Vec<u8>>, DeviceError>;

    /// Whether the translator is reachable
    fn is_connected(&self) -> bool;

    /// Open the link and wait for the translator to answer
    fn wait_until_initialized(
        &self,
        identifier: Option<&str>,
        timeout: Duration,
    ) -> Result<(), DeviceError>;

    /// Encode and send a frame
    fn send_frame(&self, frame: &Frame, timeout: Duration) -> Result<(), DeviceError> {
        self.send(&frame.encode(), timeout)
    }
}
