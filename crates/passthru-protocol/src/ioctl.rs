//! IOCTL Commands and Configuration Parameters

use serde::{Deserialize, Serialize};

use crate::error::PassThruError;
use crate::message::PassThruMsg;

/// IOCTL command identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum IoctlId {
    GetConfig = 0x01,
    SetConfig = 0x02,
    ReadVbatt = 0x03,
    FiveBaudInit = 0x04,
    FastInit = 0x05,
    ClearTxBuffer = 0x07,
    ClearRxBuffer = 0x08,
    ClearPeriodicMsgs = 0x09,
    ClearMsgFilters = 0x0A,
    ClearFunctMsgLookupTable = 0x0B,
    AddToFunctMsgLookupTable = 0x0C,
    DeleteFromFunctMsgLookupTable = 0x0D,
    ReadProgVoltage = 0x0E,
}

impl TryFrom<u32> for IoctlId {
    type Error = PassThruError;

    fn try_from(raw: u32) -> Result<Self, Self::Error> {
        Ok(match raw {
            0x01 => IoctlId::GetConfig,
            0x02 => IoctlId::SetConfig,
            0x03 => IoctlId::ReadVbatt,
            0x04 => IoctlId::FiveBaudInit,
            0x05 => IoctlId::FastInit,
            0x07 => IoctlId::ClearTxBuffer,
            0x08 => IoctlId::ClearRxBuffer,
            0x09 => IoctlId::ClearPeriodicMsgs,
            0x0A => IoctlId::ClearMsgFilters,
            0x0B => IoctlId::ClearFunctMsgLookupTable,
            0x0C => IoctlId::AddToFunctMsgLookupTable,
            0x0D => IoctlId::DeleteFromFunctMsgLookupTable,
            0x0E => IoctlId::ReadProgVoltage,
            other => return Err(PassThruError::InvalidIoctlId(other)),
        })
    }
}

/// Configuration parameters reachable through GET_CONFIG / SET_CONFIG
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum ConfigParamId {
    DataRate = 0x01,
    Loopback = 0x03,
    /// Block size sent in our flow control frames
    Iso15765Bs = 0x1E,
    /// Separation time sent in our flow control frames
    Iso15765StMin = 0x1F,
    /// Block size override for transmission (0xFFFF uses the peer's value)
    Iso15765BsTx = 0x22,
    /// STmin override for transmission (0xFFFF uses the peer's value)
    Iso15765StMinTx = 0x23,
    /// Pin pair for pin-switched protocols, encoded `(pin1 << 8) | pin2`
    J1962Pins = 0x8001,
}

impl TryFrom<u32> for ConfigParamId {
    type Error = PassThruError;

    fn try_from(raw: u32) -> Result<Self, Self::Error> {
        Ok(match raw {
            0x01 => ConfigParamId::DataRate,
            0x03 => ConfigParamId::Loopback,
            0x1E => ConfigParamId::Iso15765Bs,
            0x1F => ConfigParamId::Iso15765StMin,
            0x22 => ConfigParamId::Iso15765BsTx,
            0x23 => ConfigParamId::Iso15765StMinTx,
            0x8001 => ConfigParamId::J1962Pins,
            other => {
                return Err(PassThruError::NotSupported(format!(
                    "config parameter 0x{:X}",
                    other
                )))
            }
        })
    }
}

/// A parameter/value pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SConfig {
    pub parameter: ConfigParamId,
    pub value: u32,
}

impl SConfig {
    pub fn new(parameter: ConfigParamId, value: u32) -> Self {
        Self { parameter, value }
    }
}

/// Decode a J1962 pin pair value
pub fn decode_j1962_pins(value: u32) -> (u32, u32) {
    ((value >> 8) & 0xFF, value & 0xFF)
}

/// Encode a J1962 pin pair value
pub fn encode_j1962_pins(pin1: u32, pin2: u32) -> u32 {
    ((pin1 & 0xFF) << 8) | (pin2 & 0xFF)
}

/// Typed IOCTL request with its input
#[derive(Debug, Clone, PartialEq)]
pub enum IoctlRequest {
    GetConfig(Vec<ConfigParamId>),
    SetConfig(Vec<SConfig>),
    ReadVbatt,
    FiveBaudInit(Vec<u8>),
    FastInit(PassThruMsg),
    ClearTxBuffer,
    ClearRxBuffer,
    ClearPeriodicMsgs,
    ClearMsgFilters,
    ClearFunctMsgLookupTable,
    AddToFunctMsgLookupTable(Vec<u8>),
    DeleteFromFunctMsgLookupTable(Vec<u8>),
    ReadProgVoltage,
}

impl IoctlRequest {
    pub fn id(&self) -> IoctlId {
        match self {
            IoctlRequest::GetConfig(_) => IoctlId::GetConfig,
            IoctlRequest::SetConfig(_) => IoctlId::SetConfig,
            IoctlRequest::ReadVbatt => IoctlId::ReadVbatt,
            IoctlRequest::FiveBaudInit(_) => IoctlId::FiveBaudInit,
            IoctlRequest::FastInit(_) => IoctlId::FastInit,
            IoctlRequest::ClearTxBuffer => IoctlId::ClearTxBuffer,
            IoctlRequest::ClearRxBuffer => IoctlId::ClearRxBuffer,
            IoctlRequest::ClearPeriodicMsgs => IoctlId::ClearPeriodicMsgs,
            IoctlRequest::ClearMsgFilters => IoctlId::ClearMsgFilters,
            IoctlRequest::ClearFunctMsgLookupTable => IoctlId::ClearFunctMsgLookupTable,
            IoctlRequest::AddToFunctMsgLookupTable(_) => IoctlId::AddToFunctMsgLookupTable,
            IoctlRequest::DeleteFromFunctMsgLookupTable(_) => {
                IoctlId::DeleteFromFunctMsgLookupTable
            }
            IoctlRequest::ReadProgVoltage => IoctlId::ReadProgVoltage,
        }
    }
}

/// IOCTL output
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IoctlResponse {
    /// Command completed without output
    Done,
    /// Values for a GET_CONFIG request, in request order
    Config(Vec<SConfig>),
}
