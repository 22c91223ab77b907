//! Raw CAN
//!
//! Message data is the 4-byte big-endian CAN id followed by up to 8 data
//! bytes. `CanAddressing` holds the id width rules shared with ISO 15765.

use passthru_protocol::{
    timestamp_us, CanFrame, ConnectFlags, Frame, FrameKind, PassThruError, PassThruMsg,
    ProtocolId, RxStatus, TxFlags, CAN_ID_LEN,
};
use tracing::trace;

use super::ProtocolVariant;

/// Baudrates accepted for CAN based protocols
pub(crate) const CAN_BAUDRATES: [u32; 3] = [125_000, 250_000, 500_000];

/// Id width rules derived from the connect flags
#[derive(Debug, Clone, Copy)]
pub(crate) struct CanAddressing {
    flags: ConnectFlags,
}

impl CanAddressing {
    pub(crate) fn new(flags: ConnectFlags) -> Self {
        Self { flags }
    }

    pub(crate) fn validate_flags(flags: ConnectFlags) -> Result<(), PassThruError> {
        let allowed = ConnectFlags::CAN_29BIT_ID | ConnectFlags::CAN_ID_BOTH;
        if allowed.contains(flags) {
            Ok(())
        } else {
            Err(PassThruError::InvalidFlags(flags.bits()))
        }
    }

    pub(crate) fn validate_baudrate(baudrate: u32) -> Result<(), PassThruError> {
        if CAN_BAUDRATES.contains(&baudrate) {
            Ok(())
        } else {
            Err(PassThruError::InvalidBaudrate(baudrate))
        }
    }

    /// Whether frames of this id width reach the channel
    pub(crate) fn accepts(&self, extended: bool) -> bool {
        if self.flags.contains(ConnectFlags::CAN_ID_BOTH) {
            true
        } else {
            extended == self.flags.contains(ConnectFlags::CAN_29BIT_ID)
        }
    }

    /// Whether an outbound message uses a 29-bit id
    pub(crate) fn outbound_extended(&self, msg: &PassThruMsg) -> Result<bool, PassThruError> {
        let requested = msg.tx_flags().contains(TxFlags::CAN_29BIT_ID);
        if self.flags.contains(ConnectFlags::CAN_ID_BOTH) {
            return Ok(requested);
        }
        let channel = self.flags.contains(ConnectFlags::CAN_29BIT_ID);
        if requested && !channel {
            return Err(PassThruError::InvalidMsg(
                "29-bit id on an 11-bit channel".into(),
            ));
        }
        Ok(channel)
    }

    /// Build a CAN frame for `can_id`, validating the id width
    pub(crate) fn can_frame(
        &self,
        msg: &PassThruMsg,
        can_id: u32,
        data: Vec<u8>,
    ) -> Result<CanFrame, PassThruError> {
        let extended = self.outbound_extended(msg)?;
        CanFrame::new(can_id, extended, data).map_err(|e| PassThruError::InvalidMsg(e.to_string()))
    }

    /// Message view of a received CAN frame
    pub(crate) fn to_msg(&self, protocol_id: ProtocolId, can: &CanFrame) -> Option<PassThruMsg> {
        let status = if can.extended {
            RxStatus::CAN_29BIT_ID
        } else {
            RxStatus::empty()
        };
        PassThruMsg::with_can_id(protocol_id, can.id, &can.data)
            .ok()
            .map(|msg| msg.with_rx_status(status).with_timestamp(timestamp_us()))
    }

    /// Decode an inbound CAN frame the channel should see
    pub(crate) fn accept_frame(&self, frame: &Frame) -> Option<CanFrame> {
        if frame.kind() != FrameKind::CanRx {
            return None;
        }
        match frame.as_can() {
            Ok(can) if self.accepts(can.extended) => Some(can),
            Ok(can) => {
                trace!(id = can.id, extended = can.extended, "CAN id width not accepted");
                None
            }
            Err(e) => {
                trace!("Dropping malformed CAN frame: {}", e);
                None
            }
        }
    }
}

/// Raw CAN variant
pub struct CanVariant {
    protocol_id: ProtocolId,
    addressing: CanAddressing,
}

impl CanVariant {
    pub fn new(protocol_id: ProtocolId, flags: ConnectFlags) -> Self {
        Self {
            protocol_id,
            addressing: CanAddressing::new(flags),
        }
    }
}

impl ProtocolVariant for CanVariant {
    fn protocol_id(&self) -> ProtocolId {
        self.protocol_id
    }

    fn validate_connect(&self, flags: ConnectFlags, baudrate: u32) -> Result<(), PassThruError> {
        CanAddressing::validate_flags(flags)?;
        self.validate_baudrate(baudrate)
    }

    fn validate_baudrate(&self, baudrate: u32) -> Result<(), PassThruError> {
        CanAddressing::validate_baudrate(baudrate)
    }

    fn validate_msg(&self, msg: &PassThruMsg) -> Result<(), PassThruError> {
        if msg.len() < CAN_ID_LEN || msg.len() > CAN_ID_LEN + 8 {
            return Err(PassThruError::InvalidMsg(format!(
                "CAN message of {} bytes",
                msg.len()
            )));
        }
        Ok(())
    }

    fn parse_inbound(&self, frame: &Frame) -> Option<PassThruMsg> {
        let can = self.addressing.accept_frame(frame)?;
        self.addressing.to_msg(self.protocol_id, &can)
    }

    fn frame_outbound(&self, msg: &PassThruMsg) -> Result<Vec<Frame>, PassThruError> {
        self.validate_msg(msg)?;
        let can_id = msg
            .can_id()
            .ok_or_else(|| PassThruError::InvalidMsg("missing CAN id".into()))?;
        let can = self
            .addressing
            .can_frame(msg, can_id, msg.can_payload().to_vec())?;
        Ok(vec![Frame::can(FrameKind::CanTx, &can)])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn can_rx(id: u32, extended: bool, data: &[u8]) -> Frame {
        Frame::can(
            FrameKind::CanRx,
            &CanFrame::new(id, extended, data.to_vec()).unwrap(),
        )
    }

    #[test]
    fn test_connect_validation() {
        let can = CanVariant::new(ProtocolId::Can, ConnectFlags::empty());
        assert!(can.validate_connect(ConnectFlags::empty(), 500_000).is_ok());
        assert!(can
            .validate_connect(ConnectFlags::CAN_29BIT_ID | ConnectFlags::CAN_ID_BOTH, 250_000)
            .is_ok());
        assert_eq!(
            can.validate_connect(ConnectFlags::empty(), 10_400),
            Err(PassThruError::InvalidBaudrate(10_400))
        );
        assert_eq!(
            can.validate_connect(ConnectFlags::ISO9141_NO_CHECKSUM, 500_000),
            Err(PassThruError::InvalidFlags(0x200))
        );
    }

    #[test]
    fn test_parse_inbound_prefixes_id() {
        let can = CanVariant::new(ProtocolId::Can, ConnectFlags::empty());
        let msg = can.parse_inbound(&can_rx(0x7E8, false, &[0x03, 0x41, 0x0D])).unwrap();
        assert_eq!(msg.data(), &[0x00, 0x00, 0x07, 0xE8, 0x03, 0x41, 0x0D]);
        assert!(!msg.rx_status().contains(RxStatus::CAN_29BIT_ID));
    }

    #[test]
    fn test_id_width_acceptance() {
        let standard = CanVariant::new(ProtocolId::Can, ConnectFlags::empty());
        assert!(standard.parse_inbound(&can_rx(0x18DA_F110, true, &[0x01])).is_none());

        let extended = CanVariant::new(ProtocolId::Can, ConnectFlags::CAN_29BIT_ID);
        assert!(extended.parse_inbound(&can_rx(0x7E8, false, &[0x01])).is_none());
        let msg = extended
            .parse_inbound(&can_rx(0x18DA_F110, true, &[0x01]))
            .unwrap();
        assert!(msg.rx_status().contains(RxStatus::CAN_29BIT_ID));

        let both = CanVariant::new(ProtocolId::Can, ConnectFlags::CAN_ID_BOTH);
        assert!(both.parse_inbound(&can_rx(0x7E8, false, &[0x01])).is_some());
        assert!(both.parse_inbound(&can_rx(0x18DA_F110, true, &[0x01])).is_some());
    }

    #[test]
    fn test_frame_outbound() {
        let can = CanVariant::new(ProtocolId::Can, ConnectFlags::empty());
        let msg = PassThruMsg::with_can_id(ProtocolId::Can, 0x7DF, &[0x02, 0x01, 0x00]).unwrap();
        let frames = can.frame_outbound(&msg).unwrap();
        let decoded = frames[0].as_can().unwrap();
        assert_eq!(decoded.id, 0x7DF);
        assert!(!decoded.extended);
        assert_eq!(decoded.data, vec![0x02, 0x01, 0x00]);
    }

    #[test]
    fn test_frame_outbound_rejects_bad_messages() {
        let can = CanVariant::new(ProtocolId::Can, ConnectFlags::empty());

        let too_long = PassThruMsg::with_can_id(ProtocolId::Can, 0x7DF, &[0; 9]).unwrap();
        assert!(matches!(can.frame_outbound(&too_long), Err(PassThruError::InvalidMsg(_))));

        let wide_id = PassThruMsg::with_can_id(ProtocolId::Can, 0x800, &[0x01]).unwrap();
        assert!(matches!(can.frame_outbound(&wide_id), Err(PassThruError::InvalidMsg(_))));

        let flagged = PassThruMsg::with_can_id(ProtocolId::Can, 0x7DF, &[0x01])
            .unwrap()
            .with_tx_flags(TxFlags::CAN_29BIT_ID);
        assert!(matches!(can.frame_outbound(&flagged), Err(PassThruError::InvalidMsg(_))));
    }

    #[test]
    fn test_both_mode_follows_tx_flags() {
        let can = CanVariant::new(ProtocolId::Can, ConnectFlags::CAN_ID_BOTH);
        let msg = PassThruMsg::with_can_id(ProtocolId::Can, 0x18DB_33F1, &[0x01])
            .unwrap()
            .with_tx_flags(TxFlags::CAN_29BIT_ID);
        let frames = can.frame_outbound(&msg).unwrap();
        assert!(frames[0].as_can().unwrap().extended);
    }
}
