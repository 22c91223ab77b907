//! PassThru Status Codes and Error Types

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Status codes returned across the driver boundary (J2534 v04.04 numbering)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum Status {
    NoError = 0x00,
    NotSupported = 0x01,
    InvalidChannelId = 0x02,
    InvalidProtocolId = 0x03,
    NullParameter = 0x04,
    InvalidIoctlValue = 0x05,
    InvalidFlags = 0x06,
    Failed = 0x07,
    DeviceNotConnected = 0x08,
    Timeout = 0x09,
    InvalidMsg = 0x0A,
    InvalidTimeInterval = 0x0B,
    ExceededLimit = 0x0C,
    InvalidMsgId = 0x0D,
    DeviceInUse = 0x0E,
    InvalidIoctlId = 0x0F,
    BufferEmpty = 0x10,
    BufferFull = 0x11,
    BufferOverflow = 0x12,
    PinInvalid = 0x13,
    ChannelInUse = 0x14,
    MsgProtocolId = 0x15,
    InvalidFilterId = 0x16,
    NoFlowControl = 0x17,
    NotUnique = 0x18,
    InvalidBaudrate = 0x19,
    InvalidDeviceId = 0x1A,
}

impl Status {
    /// Numeric status code
    pub fn code(&self) -> u32 {
        *self as u32
    }

    /// Fixed human readable description of the status
    pub fn description(&self) -> &'static str {
        match self {
            Status::NoError => "Function call successful",
            Status::NotSupported => "Device cannot support requested functionality",
            Status::InvalidChannelId => "Invalid ChannelID value",
            Status::InvalidProtocolId => "Invalid ProtocolID value",
            Status::NullParameter => "NULL pointer supplied where a valid pointer is required",
            Status::InvalidIoctlValue => "Invalid value for Ioctl parameter",
            Status::InvalidFlags => "Invalid flag values",
            Status::Failed => "Undefined error",
            Status::DeviceNotConnected => "Device not connected to PC",
            Status::Timeout => "Timeout",
            Status::InvalidMsg => "Message structure or length is invalid",
            Status::InvalidTimeInterval => "Time interval outside specified range",
            Status::ExceededLimit => "Exceeded the allowed limits",
            Status::InvalidMsgId => "Invalid MsgID value",
            Status::DeviceInUse => "Device already open and/or in use",
            Status::InvalidIoctlId => "Invalid IoctlID value",
            Status::BufferEmpty => "Protocol message buffer empty",
            Status::BufferFull => "Protocol message buffer full",
            Status::BufferOverflow => "Protocol message buffer overflow",
            Status::PinInvalid => "Invalid pin number",
            Status::ChannelInUse => "Channel already in use",
            Status::MsgProtocolId => "Protocol type does not match the protocol associated with the Channel ID",
            Status::InvalidFilterId => "Invalid Filter ID value",
            Status::NoFlowControl => "No flow control filter set or matched",
            Status::NotUnique => "CAN ID in pattern or flow control matches an existing flow control filter",
            Status::InvalidBaudrate => "Desired baud rate cannot be achieved within tolerance",
            Status::InvalidDeviceId => "Unable to communicate with device",
        }
    }

    /// Whether the status signals success (informational statuses included)
    pub fn is_ok(&self) -> bool {
        matches!(self, Status::NoError | Status::BufferOverflow)
    }
}

/// Errors surfaced by driver operations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PassThruError {
    #[error("Protocol not supported: {0}")]
    NotSupported(String),

    #[error("Invalid channel id {0}")]
    InvalidChannelId(u32),

    #[error("Invalid protocol id 0x{0:X}")]
    InvalidProtocolId(u32),

    #[error("Missing required parameter: {0}")]
    NullParameter(&'static str),

    #[error("Invalid ioctl value: {0}")]
    InvalidIoctlValue(String),

    #[error("Invalid flags 0x{0:X}")]
    InvalidFlags(u32),

    /// Generic failure carrying a detail string for the last-error side channel
    #[error("{0}")]
    Failed(String),

    #[error("Device not connected")]
    DeviceNotConnected,

    #[error("Operation timed out")]
    Timeout,

    #[error("Invalid message: {0}")]
    InvalidMsg(String),

    #[error("Time interval {0}ms outside allowed range")]
    InvalidTimeInterval(u64),

    #[error("Exceeded limit: {0}")]
    ExceededLimit(&'static str),

    #[error("Invalid message id {0}")]
    InvalidMsgId(u32),

    #[error("Invalid ioctl id 0x{0:X}")]
    InvalidIoctlId(u32),

    #[error("Pin assignment ({0}, {1}) invalid")]
    PinInvalid(u32, u32),

    #[error("Channel already in use")]
    ChannelInUse,

    #[error("Message protocol 0x{actual:X} does not match channel protocol 0x{expected:X}")]
    MsgProtocolId { expected: u32, actual: u32 },

    #[error("Invalid filter id {0}")]
    InvalidFilterId(u32),

    #[error("No flow control received from 0x{0:X}")]
    NoFlowControl(u32),

    #[error("Flow control filter is not unique")]
    NotUnique,

    #[error("Baudrate {0} not supported")]
    InvalidBaudrate(u32),
}

impl PassThruError {
    /// Map the error onto its boundary status code
    pub fn status(&self) -> Status {
        match self {
            PassThruError::NotSupported(_) => Status::NotSupported,
            PassThruError::InvalidChannelId(_) => Status::InvalidChannelId,
            PassThruError::InvalidProtocolId(_) => Status::InvalidProtocolId,
            PassThruError::NullParameter(_) => Status::NullParameter,
            PassThruError::InvalidIoctlValue(_) => Status::InvalidIoctlValue,
            PassThruError::InvalidFlags(_) => Status::InvalidFlags,
            PassThruError::Failed(_) => Status::Failed,
            PassThruError::DeviceNotConnected => Status::DeviceNotConnected,
            PassThruError::Timeout => Status::Timeout,
            PassThruError::InvalidMsg(_) => Status::InvalidMsg,
            PassThruError::InvalidTimeInterval(_) => Status::InvalidTimeInterval,
            PassThruError::ExceededLimit(_) => Status::ExceededLimit,
            PassThruError::InvalidMsgId(_) => Status::InvalidMsgId,
            PassThruError::InvalidIoctlId(_) => Status::InvalidIoctlId,
            PassThruError::PinInvalid(..) => Status::PinInvalid,
            PassThruError::ChannelInUse => Status::ChannelInUse,
            PassThruError::MsgProtocolId { .. } => Status::MsgProtocolId,
            PassThruError::InvalidFilterId(_) => Status::InvalidFilterId,
            PassThruError::NoFlowControl(_) => Status::NoFlowControl,
            PassThruError::NotUnique => Status::NotUnique,
            PassThruError::InvalidBaudrate(_) => Status::InvalidBaudrate,
        }
    }

    /// Detail text for the generic failure side channel
    pub fn detail(&self) -> Option<&str> {
        match self {
            PassThruError::Failed(detail) => Some(detail),
            _ => None,
        }
    }
}

/// Errors raised by a device link
#[derive(Debug, Clone, Error)]
pub enum DeviceError {
    /// Link is not open or was lost
    #[error("Device link not connected")]
    NotConnected,

    /// Serial port error
    #[error("Serial port error: {0}")]
    Serial(String),

    /// Timeout waiting for the translator
    #[error("Timeout waiting for translator after {0}ms")]
    Timeout(u64),

    /// Translator answered with something unexpected
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

impl From<std::io::Error> for DeviceError {
    fn from(err: std::io::Error) -> Self {
        DeviceError::Serial(err.to_string())
    }
}

impl From<DeviceError> for PassThruError {
    fn from(err: DeviceError) -> Self {
        match err {
            DeviceError::NotConnected => PassThruError::DeviceNotConnected,
            DeviceError::Timeout(_) => PassThruError::Timeout,
            other => PassThruError::Failed(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes_follow_j2534_numbering() {
        assert_eq!(Status::NoError.code(), 0);
        assert_eq!(Status::Failed.code(), 0x07);
        assert_eq!(Status::ChannelInUse.code(), 0x14);
        assert_eq!(Status::InvalidDeviceId.code(), 0x1A);
    }

    #[test]
    fn test_error_to_status() {
        assert_eq!(PassThruError::ChannelInUse.status(), Status::ChannelInUse);
        assert_eq!(
            PassThruError::Failed("boom".to_string()).status(),
            Status::Failed
        );
        assert_eq!(
            PassThruError::Failed("boom".to_string()).detail(),
            Some("boom")
        );
        assert_eq!(PassThruError::DeviceNotConnected.detail(), None);
    }

    #[test]
    fn test_device_error_conversion() {
        let err: PassThruError = DeviceError::NotConnected.into();
        assert_eq!(err, PassThruError::DeviceNotConnected);

        let err: PassThruError = DeviceError::Serial("port gone".into()).into();
        assert_eq!(err.status(), Status::Failed);
    }

    #[test]
    fn test_descriptions_fit_80_bytes() {
        let all = [
            Status::NoError,
            Status::MsgProtocolId,
            Status::NotUnique,
            Status::InvalidBaudrate,
            Status::NullParameter,
        ];
        for status in all {
            assert!(status.description().len() < 80, "{:?}", status);
        }
    }
}
