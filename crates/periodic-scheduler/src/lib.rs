//! Periodic Message Scheduler
//!
//! Re-submits registered messages to a channel's write path at fixed
//! intervals until stopped.

mod scheduler;

pub use scheduler::{FireOutcome, PeriodicScheduler, PeriodicSink, PeriodicStats, SchedulerConfig};

use passthru_protocol::PassThruError;
use thiserror::Error;

/// Scheduler errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchedulerError {
    #[error("Interval of {0}ms outside the accepted range")]
    InvalidInterval(u64),

    #[error("Periodic message limit of {0} reached")]
    LimitExceeded(usize),

    #[error("Periodic message {0} not found")]
    NotFound(u32),

    #[error("Failed to start timer thread: {0}")]
    Spawn(String),
}

impl From<SchedulerError> for PassThruError {
    fn from(err: SchedulerError) -> Self {
        match err {
            SchedulerError::InvalidInterval(ms) => PassThruError::InvalidTimeInterval(ms),
            SchedulerError::LimitExceeded(_) => PassThruError::ExceededLimit("periodic messages"),
            SchedulerError::NotFound(id) => PassThruError::InvalidMsgId(id),
            SchedulerError::Spawn(detail) => PassThruError::Failed(detail),
        }
    }
}
