//! SAE J1850 VPW

use passthru_protocol::{
    timestamp_us, ConnectFlags, Frame, FrameKind, PassThruError, PassThruMsg, ProtocolId,
    MAX_MSG_LEN,
};
use tracing::trace;

use super::ProtocolVariant;

/// Standard and 4x high speed mode
const VPW_BAUDRATES: [u32; 2] = [10_400, 41_600];

/// J1850 VPW variant; the message data is the bus frame as is
pub struct VpwVariant {
    protocol_id: ProtocolId,
}

impl VpwVariant {
    pub fn new(protocol_id: ProtocolId) -> Self {
        Self { protocol_id }
    }
}

impl ProtocolVariant for VpwVariant {
    fn protocol_id(&self) -> ProtocolId {
        self.protocol_id
    }

    fn validate_connect(&self, flags: ConnectFlags, baudrate: u32) -> Result<(), PassThruError> {
        if !flags.is_empty() {
            return Err(PassThruError::InvalidFlags(flags.bits()));
        }
        self.validate_baudrate(baudrate)
    }

    fn validate_baudrate(&self, baudrate: u32) -> Result<(), PassThruError> {
        if VPW_BAUDRATES.contains(&baudrate) {
            Ok(())
        } else {
            Err(PassThruError::InvalidBaudrate(baudrate))
        }
    }

    fn validate_msg(&self, msg: &PassThruMsg) -> Result<(), PassThruError> {
        if msg.is_empty() || msg.len() > MAX_MSG_LEN {
            return Err(PassThruError::InvalidMsg(format!(
                "J1850 VPW message of {} bytes",
                msg.len()
            )));
        }
        Ok(())
    }

    fn parse_inbound(&self, frame: &Frame) -> Option<PassThruMsg> {
        if frame.kind() != FrameKind::VpwRx || frame.body().is_empty() {
            return None;
        }
        match PassThruMsg::new(self.protocol_id, frame.body().to_vec()) {
            Ok(msg) => Some(msg.with_timestamp(timestamp_us())),
            Err(e) => {
                trace!("Dropping VPW frame: {}", e);
                None
            }
        }
    }

    fn frame_outbound(&self, msg: &PassThruMsg) -> Result<Vec<Frame>, PassThruError> {
        self.validate_msg(msg)?;
        Ok(vec![Frame::new(FrameKind::VpwTx, msg.data().to_vec())])
    }
}
