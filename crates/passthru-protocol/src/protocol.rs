//! PassThru Protocol Identifiers

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::error::PassThruError;

/// Protocol identifiers (J2534 numbering)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum ProtocolId {
    /// SAE J1850 VPW (10.4 kbaud)
    J1850Vpw = 0x01,
    /// SAE J1850 PWM (41.6 kbaud)
    J1850Pwm = 0x02,
    /// ISO 9141
    Iso9141 = 0x03,
    /// ISO 14230-4 (KWP2000)
    Iso14230 = 0x04,
    /// Raw CAN frames
    Can = 0x05,
    /// ISO 15765-2 transport over CAN
    Iso15765 = 0x06,
    SciAEngine = 0x07,
    SciATrans = 0x08,
    SciBEngine = 0x09,
    SciBTrans = 0x0A,
    /// J1850 VPW on switchable J1962 pins
    J1850VpwPs = 0x8000,
    /// CAN on switchable J1962 pins
    CanPs = 0x8004,
    /// ISO 15765 on switchable J1962 pins
    Iso15765Ps = 0x8005,
}

impl ProtocolId {
    /// Numeric protocol id
    pub fn as_raw(&self) -> u32 {
        *self as u32
    }

    /// Translator frame family used by this protocol
    pub fn family(&self) -> ProtocolFamily {
        match self {
            ProtocolId::J1850Vpw | ProtocolId::J1850VpwPs => ProtocolFamily::Vpw,
            ProtocolId::Can
            | ProtocolId::CanPs
            | ProtocolId::Iso15765
            | ProtocolId::Iso15765Ps => ProtocolFamily::Can,
            _ => ProtocolFamily::Unsupported,
        }
    }

    /// Whether the protocol runs on switchable J1962 pins
    pub fn is_pin_switched(&self) -> bool {
        matches!(
            self,
            ProtocolId::J1850VpwPs | ProtocolId::CanPs | ProtocolId::Iso15765Ps
        )
    }

    /// Whether CAN style 4-byte id headers prefix the message data
    pub fn has_can_id(&self) -> bool {
        self.family() == ProtocolFamily::Can
    }
}

impl TryFrom<u32> for ProtocolId {
    type Error = PassThruError;

    fn try_from(raw: u32) -> Result<Self, Self::Error> {
        Ok(match raw {
            0x01 => ProtocolId::J1850Vpw,
            0x02 => ProtocolId::J1850Pwm,
            0x03 => ProtocolId::Iso9141,
            0x04 => ProtocolId::Iso14230,
            0x05 => ProtocolId::Can,
            0x06 => ProtocolId::Iso15765,
            0x07 => ProtocolId::SciAEngine,
            0x08 => ProtocolId::SciATrans,
            0x09 => ProtocolId::SciBEngine,
            0x0A => ProtocolId::SciBTrans,
            0x8000 => ProtocolId::J1850VpwPs,
            0x8004 => ProtocolId::CanPs,
            0x8005 => ProtocolId::Iso15765Ps,
            other => return Err(PassThruError::InvalidProtocolId(other)),
        })
    }
}

/// Group of protocols sharing a translator frame kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolFamily {
    /// J1850 VPW bus frames
    Vpw,
    /// CAN bus frames (raw CAN and ISO 15765)
    Can,
    /// Not handled by the translator
    Unsupported,
}

bitflags! {
    /// Flags passed to `Connect`
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ConnectFlags: u32 {
        const CAN_29BIT_ID = 0x0000_0100;
        const ISO9141_NO_CHECKSUM = 0x0000_0200;
        const CAN_ID_BOTH = 0x0000_0800;
        const ISO9141_K_LINE_ONLY = 0x0000_1000;
    }
}
