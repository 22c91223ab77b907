//! Protocol Variants
//!
//! A variant owns the framing and addressing rules of one protocol. The
//! engine picks one at connect time and never swaps it:
//!
//! - `VpwVariant`: SAE J1850 VPW (also on switched pins)
//! - `CanVariant`: raw CAN frames
//! - `Iso15765Variant`: ISO 15765-2 segmentation and flow control over CAN

mod can;
mod iso15765;
mod vpw;

pub use can::CanVariant;
pub use iso15765::Iso15765Variant;
pub use vpw::VpwVariant;

use std::time::Duration;

use metrics::counter;
use msg_filter::MsgFilter;
use passthru_protocol::{
    ConfigParamId, ConnectFlags, DeviceLink, Frame, PassThruError, PassThruMsg, ProtocolFamily,
    ProtocolId,
};

use crate::config::IsoTpConfig;

/// What the engine should do with one inbound message
#[derive(Debug, Default)]
pub struct InboundActions {
    deliver: Vec<PassThruMsg>,
    respond: Vec<Frame>,
}

impl InboundActions {
    /// Push a message to the receive buffer
    pub fn deliver(&mut self, msg: PassThruMsg) {
        self.deliver.push(msg);
    }

    /// Send a frame back to the bus
    pub fn respond(&mut self, frame: Frame) {
        self.respond.push(frame);
    }

    pub fn deliveries(&self) -> &[PassThruMsg] {
        &self.deliver
    }

    pub fn responses(&self) -> &[Frame] {
        &self.respond
    }

    pub fn into_parts(self) -> (Vec<PassThruMsg>, Vec<Frame>) {
        (self.deliver, self.respond)
    }
}

/// Framing and addressing rules of one protocol
///
/// Methods take `&self`: the inbound pump and API callers use a variant
/// concurrently, so any mutable state lives behind the variant's own lock.
pub trait ProtocolVariant: Send + Sync {
    fn protocol_id(&self) -> ProtocolId;

    fn family(&self) -> ProtocolFamily {
        self.protocol_id().family()
    }

    /// Check connect flags and baudrate
    fn validate_connect(&self, flags: ConnectFlags, baudrate: u32) -> Result<(), PassThruError>;

    /// Check a baudrate for connect or DATA_RATE
    fn validate_baudrate(&self, baudrate: u32) -> Result<(), PassThruError>;

    /// Check an outbound message
    fn validate_msg(&self, msg: &PassThruMsg) -> Result<(), PassThruError>;

    /// Check a message for periodic transmission
    fn validate_periodic(&self, msg: &PassThruMsg) -> Result<(), PassThruError> {
        self.validate_msg(msg)
    }

    /// Turn a translator frame into a message for filtering
    ///
    /// Returns `None` for frames of another family, frames outside the
    /// channel's addressing mode and frames the variant consumes itself.
    fn parse_inbound(&self, frame: &Frame) -> Option<PassThruMsg>;

    /// Frames carrying a message that fits a single frame
    fn frame_outbound(&self, msg: &PassThruMsg) -> Result<Vec<Frame>, PassThruError>;

    /// Interpret a message that passed the filters
    ///
    /// `flow_control` is the response of the matching flow control filter.
    /// Returns whether the message was accepted.
    fn handle_msg(
        &self,
        msg: PassThruMsg,
        flow_control: Option<&PassThruMsg>,
        actions: &mut InboundActions,
    ) -> bool {
        if let Some(response) = flow_control {
            match self.frame_outbound(response) {
                Ok(frames) => frames.into_iter().for_each(|f| actions.respond(f)),
                Err(e) => tracing::debug!("Flow control response not sendable: {}", e),
            }
        }
        actions.deliver(msg);
        true
    }

    /// Transmit one validated message
    fn write_msg(
        &self,
        msg: &PassThruMsg,
        link: &dyn DeviceLink,
        timeout: Duration,
    ) -> Result<(), PassThruError> {
        let frames = self.frame_outbound(msg)?;
        send_frames(link, &frames, timeout)
    }

    /// Filters the variant installs on connect
    fn internal_filters(&self) -> Vec<MsgFilter> {
        Vec::new()
    }

    /// Read a variant specific configuration parameter
    fn get_param(&self, param: ConfigParamId) -> Result<u32, PassThruError> {
        Err(PassThruError::NotSupported(format!("{:?}", param)))
    }

    /// Write a variant specific configuration parameter
    fn set_param(&self, param: ConfigParamId, _value: u32) -> Result<(), PassThruError> {
        Err(PassThruError::NotSupported(format!("{:?}", param)))
    }

    /// Release variant state on disconnect
    fn teardown(&self) {}
}

/// Build the variant for a protocol
///
/// Unsupported protocols fail with `NotSupported` before any state exists.
pub fn create_variant(
    protocol_id: ProtocolId,
    flags: ConnectFlags,
    iso15765: &IsoTpConfig,
) -> Result<Box<dyn ProtocolVariant>, PassThruError> {
    match protocol_id {
        ProtocolId::J1850Vpw | ProtocolId::J1850VpwPs => Ok(Box::new(VpwVariant::new(protocol_id))),
        ProtocolId::Can | ProtocolId::CanPs => Ok(Box::new(CanVariant::new(protocol_id, flags))),
        ProtocolId::Iso15765 | ProtocolId::Iso15765Ps => Ok(Box::new(Iso15765Variant::new(
            protocol_id,
            flags,
            iso15765.clone(),
        ))),
        other => Err(PassThruError::NotSupported(format!("protocol {:?}", other))),
    }
}

/// Send frames in order, stopping at the first failure
pub(crate) fn send_frames(
    link: &dyn DeviceLink,
    frames: &[Frame],
    timeout: Duration,
) -> Result<(), PassThruError> {
    for frame in frames {
        link.send_frame(frame, timeout)?;
        counter!("passthru_tx_frames_total").increment(1);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unsupported_protocols_rejected() {
        let iso = IsoTpConfig::default();
        for protocol in [ProtocolId::Iso9141, ProtocolId::J1850Pwm, ProtocolId::SciAEngine] {
            let err = create_variant(protocol, ConnectFlags::empty(), &iso).err();
            assert!(matches!(err, Some(PassThruError::NotSupported(_))));
        }
    }

    #[test]
    fn test_pin_switched_variants_share_framing() {
        let iso = IsoTpConfig::default();
        let vpw = create_variant(ProtocolId::J1850VpwPs, ConnectFlags::empty(), &iso).unwrap();
        assert_eq!(vpw.protocol_id(), ProtocolId::J1850VpwPs);
        assert_eq!(vpw.family(), ProtocolFamily::Vpw);

        let iso_ps = create_variant(ProtocolId::Iso15765Ps, ConnectFlags::empty(), &iso).unwrap();
        assert_eq!(iso_ps.family(), ProtocolFamily::Can);
    }
}
