//! PassThru Protocol Definitions
//!
//! Message model, status codes, IOCTL identifiers and the framing spoken with
//! the translator hardware, plus the device links that carry those frames.

pub mod error;
pub mod frame;
pub mod ioctl;
pub mod link;
pub mod message;
pub mod protocol;
pub mod text;

pub use error::{DeviceError, PassThruError, Status};
pub use frame::{CanFrame, Frame, FrameDecoder, FrameError, FrameKind};
pub use ioctl::{ConfigParamId, IoctlId, IoctlRequest, IoctlResponse, SConfig};
pub use link::{DeviceLink, MockLink, SerialLink};
pub use message::{timestamp_us, PassThruMsg, RxStatus, TxFlags, CAN_ID_LEN, MAX_MSG_LEN};
pub use protocol::{ConnectFlags, ProtocolFamily, ProtocolId};
pub use text::{BoundedString, Description, DESCRIPTION_CAPACITY};

/// Driver wide limits
pub mod limits {
    /// Concurrently open channels
    pub const MAX_CHANNELS: usize = 8;
    /// Filters per channel set through the API
    pub const MAX_FILTERS: usize = 10;
    /// Periodic messages per channel
    pub const MAX_PERIODIC_MSGS: usize = 10;
    /// Default receive buffer depth in messages
    pub const MAX_RX_BUFFER_SIZE: usize = 256;
    /// Longest filter mask/pattern
    pub const MAX_FILTER_MSG_LEN: usize = 12;
    /// Shortest periodic interval in milliseconds
    pub const MIN_PERIODIC_INTERVAL_MS: u64 = 5;
    /// Longest periodic interval in milliseconds
    pub const MAX_PERIODIC_INTERVAL_MS: u64 = 65535;
}
