//! PassThru Message Definitions
//!
//! A `PassThruMsg` is immutable once built: fields are private and the
//! `with_*` builders consume the message. Ownership moves into the receive
//! buffer and out again to the caller, nothing is shared.

use std::sync::OnceLock;
use std::time::Instant;

use bitflags::bitflags;

use crate::error::PassThruError;
use crate::protocol::ProtocolId;

/// Maximum data length of a single message
pub const MAX_MSG_LEN: usize = 4128;

/// Length of the CAN id header prefixing CAN and ISO 15765 message data
pub const CAN_ID_LEN: usize = 4;

bitflags! {
    /// Receive status bits reported on inbound messages
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct RxStatus: u32 {
        /// Message is a loopback of a transmitted message
        const TX_MSG_TYPE = 0x0000_0001;
        const START_OF_MESSAGE = 0x0000_0002;
        const RX_BREAK = 0x0000_0004;
        const TX_INDICATION = 0x0000_0008;
        const ISO15765_PADDING_ERROR = 0x0000_0010;
        const ISO15765_ADDR_TYPE = 0x0000_0080;
        const CAN_29BIT_ID = 0x0000_0100;
        /// Receive buffer overflowed before this message was read
        const BUFFER_OVERFLOW = 0x0001_0000;
    }
}

impl RxStatus {
    /// First frame indication of a segmented ISO 15765 message
    pub const ISO15765_FIRST_FRAME: Self = Self::START_OF_MESSAGE;
}

bitflags! {
    /// Transmit flags supplied with outbound messages
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct TxFlags: u32 {
        const ISO15765_FRAME_PAD = 0x0000_0040;
        const ISO15765_ADDR_TYPE = 0x0000_0080;
        const CAN_29BIT_ID = 0x0000_0100;
        const WAIT_P3_MIN_ONLY = 0x0000_0200;
        const SCI_MODE = 0x0040_0000;
        const SCI_TX_VOLTAGE = 0x0080_0000;
    }
}

/// Microseconds since the driver clock started (wraps like the J2534 field)
pub fn timestamp_us() -> u32 {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    let epoch = EPOCH.get_or_init(Instant::now);
    epoch.elapsed().as_micros() as u32
}

/// A message exchanged through a channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PassThruMsg {
    protocol_id: ProtocolId,
    rx_status: RxStatus,
    tx_flags: TxFlags,
    timestamp: u32,
    extra_data_index: u32,
    data: Vec<u8>,
}

impl PassThruMsg {
    /// Create a message, rejecting data longer than `MAX_MSG_LEN`
    pub fn new(protocol_id: ProtocolId, data: impl Into<Vec<u8>>) -> Result<Self, PassThruError> {
        let data = data.into();
        if data.len() > MAX_MSG_LEN {
            return Err(PassThruError::InvalidMsg(format!(
                "{} bytes exceeds maximum of {}",
                data.len(),
                MAX_MSG_LEN
            )));
        }
        Ok(Self {
            protocol_id,
            rx_status: RxStatus::empty(),
            tx_flags: TxFlags::empty(),
            timestamp: 0,
            extra_data_index: 0,
            data,
        })
    }

    /// Create a CAN style message: 4-byte big-endian id followed by payload
    pub fn with_can_id(
        protocol_id: ProtocolId,
        can_id: u32,
        payload: &[u8],
    ) -> Result<Self, PassThruError> {
        let mut data = Vec::with_capacity(CAN_ID_LEN + payload.len());
        data.extend_from_slice(&can_id.to_be_bytes());
        data.extend_from_slice(payload);
        Self::new(protocol_id, data)
    }

    pub fn with_tx_flags(mut self, tx_flags: TxFlags) -> Self {
        self.tx_flags = tx_flags;
        self
    }

    pub fn with_rx_status(mut self, rx_status: RxStatus) -> Self {
        self.rx_status = rx_status;
        self
    }

    pub fn with_timestamp(mut self, timestamp: u32) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_extra_data_index(mut self, extra_data_index: u32) -> Self {
        self.extra_data_index = extra_data_index;
        self
    }

    pub fn protocol_id(&self) -> ProtocolId {
        self.protocol_id
    }

    pub fn rx_status(&self) -> RxStatus {
        self.rx_status
    }

    pub fn tx_flags(&self) -> TxFlags {
        self.tx_flags
    }

    /// Receive/transmit timestamp in microseconds
    pub fn timestamp(&self) -> u32 {
        self.timestamp
    }

    pub fn extra_data_index(&self) -> u32 {
        self.extra_data_index
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Take the data bytes out of the message
    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    /// CAN id header, if the message carries one
    pub fn can_id(&self) -> Option<u32> {
        if self.data.len() < CAN_ID_LEN {
            return None;
        }
        let mut id = [0u8; CAN_ID_LEN];
        id.copy_from_slice(&self.data[..CAN_ID_LEN]);
        Some(u32::from_be_bytes(id))
    }

    /// Data following the CAN id header (empty if there is no header)
    pub fn can_payload(&self) -> &[u8] {
        self.data.get(CAN_ID_LEN..).unwrap_or(&[])
    }

    /// Whether this message is a loopback copy of a transmitted message
    pub fn is_loopback(&self) -> bool {
        self.rx_status.contains(RxStatus::TX_MSG_TYPE)
    }

    /// Loopback copy of a transmitted message, tagged as such
    pub fn loopback_copy(&self) -> Self {
        let mut copy = self.clone();
        copy.rx_status = self.rx_status | RxStatus::TX_MSG_TYPE;
        copy.timestamp = timestamp_us();
        copy
    }
}
