//! Message Filter Table
//!
//! Ordered pass/block/flow-control filters matched by mask and pattern
//! against inbound message data.

mod filter;
mod table;

pub use filter::{FilterKind, FilterOwner, MsgFilter};
pub use table::{FilterOutcome, FilterTable};

use passthru_protocol::PassThruError;
use thiserror::Error;

/// Filter errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FilterError {
    /// Mask/pattern shape is invalid
    #[error("Invalid filter: {0}")]
    InvalidFilter(String),

    #[error("Flow control filter requires a flow control message")]
    MissingFlowControl,

    #[error("Only flow control filters take a flow control message")]
    UnexpectedFlowControl,

    #[error("Unknown filter type 0x{0:X}")]
    InvalidKind(u32),

    #[error("Filter limit of {0} reached")]
    LimitExceeded(usize),

    #[error("Flow control filter duplicates an existing one")]
    NotUnique,

    #[error("Filter {0} not found")]
    NotFound(u32),
}

impl From<FilterError> for PassThruError {
    fn from(err: FilterError) -> Self {
        match err {
            FilterError::InvalidFilter(detail) => PassThruError::InvalidMsg(detail),
            FilterError::MissingFlowControl => PassThruError::NullParameter("flow control message"),
            FilterError::UnexpectedFlowControl => {
                PassThruError::InvalidMsg("flow control message on a non flow control filter".into())
            }
            FilterError::InvalidKind(kind) => {
                PassThruError::NotSupported(format!("filter type 0x{:X}", kind))
            }
            FilterError::LimitExceeded(_) => PassThruError::ExceededLimit("message filters"),
            FilterError::NotUnique => PassThruError::NotUnique,
            FilterError::NotFound(id) => PassThruError::InvalidFilterId(id),
        }
    }
}
