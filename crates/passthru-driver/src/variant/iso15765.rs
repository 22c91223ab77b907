//! ISO 15765-2 Transport over CAN
//!
//! Protocol control information (PCI) is the first byte of each CAN frame:
//!
//! | Type | PCI            | Payload             |
//! |------|----------------|---------------------|
//! | SF   | `0L`           | L bytes (1..=7)     |
//! | FF   | `1L LL`        | first 6 of 12-bit L |
//! | CF   | `2N`           | next 7, N = seq mod 16 |
//! | FC   | `3S BS STmin`  | S: 0 CTS, 1 WAIT, 2 OVFLW |
//!
//! Segmented writes run under the channel's TX lock and wait here for the
//! peer's flow control, which the inbound pump delivers via `parse_inbound`
//! without touching the TX lock.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use msg_filter::{FilterKind, MsgFilter};
use parking_lot::{Condvar, Mutex};
use passthru_protocol::{
    ConfigParamId, ConnectFlags, DeviceLink, Frame, FrameKind, PassThruError, PassThruMsg,
    ProtocolId, RxStatus, TxFlags, CAN_ID_LEN,
};
use tracing::{debug, trace, warn};

use super::can::CanAddressing;
use super::{send_frames, InboundActions, ProtocolVariant};
use crate::config::IsoTpConfig;

/// Largest payload a 12-bit first frame length can describe
pub const MAX_ISOTP_PAYLOAD: usize = 4095;

const SINGLE_FRAME_MAX: usize = 7;
const FIRST_FRAME_DATA: usize = 6;
const CONSECUTIVE_FRAME_DATA: usize = 7;
const CAN_DLC: usize = 8;
const PAD_BYTE: u8 = 0x00;

/// "Use the peer's value" marker for BS_TX and STMIN_TX
const USE_PEER_VALUE: u32 = 0xFFFF;

/// OBD-II physical response ids and the request ids they answer to
const OBD_RESPONSE_IDS: std::ops::RangeInclusive<u32> = 0x7E8..=0x7EF;
const OBD_REQUEST_OFFSET: u32 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FlowStatus {
    ContinueToSend,
    Wait,
    Overflow,
}

#[derive(Debug, Clone, Copy)]
struct FlowControl {
    status: FlowStatus,
    block_size: u8,
    st_min: u8,
}

impl FlowControl {
    fn parse(data: &[u8]) -> Option<Self> {
        let status = match data.first()? & 0x0F {
            0 => FlowStatus::ContinueToSend,
            1 => FlowStatus::Wait,
            2 => FlowStatus::Overflow,
            _ => return None,
        };
        Some(Self {
            status,
            block_size: data.get(1).copied().unwrap_or(0),
            st_min: data.get(2).copied().unwrap_or(0),
        })
    }
}

/// Decode an STmin byte; reserved values mean the maximum of 127 ms
pub fn st_min_duration(raw: u8) -> Duration {
    match raw {
        0x00..=0x7F => Duration::from_millis(raw as u64),
        0xF1..=0xF9 => Duration::from_micros((raw - 0xF0) as u64 * 100),
        _ => Duration::from_millis(0x7F),
    }
}

struct Reassembly {
    expected_len: usize,
    data: Vec<u8>,
    next_sn: u8,
    /// Consecutive frames received since the last flow control we sent
    in_block: u8,
    rx_status: RxStatus,
}

struct IsoTpState {
    block_size: u8,
    st_min: u8,
    block_size_tx: u32,
    st_min_tx: u32,
    /// A segmented write is waiting for flow control
    awaiting_fc: bool,
    pending_fc: Option<(u32, FlowControl)>,
    reassembly: HashMap<u32, Reassembly>,
}

/// ISO 15765 variant
pub struct Iso15765Variant {
    protocol_id: ProtocolId,
    flags: ConnectFlags,
    addressing: CanAddressing,
    config: IsoTpConfig,
    state: Mutex<IsoTpState>,
    fc_arrived: Condvar,
}

impl Iso15765Variant {
    pub fn new(protocol_id: ProtocolId, flags: ConnectFlags, config: IsoTpConfig) -> Self {
        let state = IsoTpState {
            block_size: config.block_size,
            st_min: config.st_min,
            block_size_tx: USE_PEER_VALUE,
            st_min_tx: USE_PEER_VALUE,
            awaiting_fc: false,
            pending_fc: None,
            reassembly: HashMap::new(),
        };
        Self {
            protocol_id,
            flags,
            addressing: CanAddressing::new(flags),
            config,
            state: Mutex::new(state),
            fc_arrived: Condvar::new(),
        }
    }

    fn pad(data: &mut Vec<u8>, pad: bool) {
        if pad {
            data.resize(CAN_DLC, PAD_BYTE);
        }
    }

    fn on_flow_control(&self, can_id: u32, data: &[u8]) {
        let Some(fc) = FlowControl::parse(data) else {
            debug!(id = can_id, "Ignoring malformed flow control frame");
            return;
        };
        let mut state = self.state.lock();
        if !state.awaiting_fc {
            trace!(id = can_id, "Unsolicited flow control frame");
            return;
        }
        state.pending_fc = Some((can_id, fc));
        drop(state);
        self.fc_arrived.notify_all();
    }

    /// Prepare to receive flow control for the frame about to be sent
    fn arm_flow_control(&self) {
        let mut state = self.state.lock();
        state.awaiting_fc = true;
        state.pending_fc = None;
    }

    fn disarm_flow_control(&self) {
        let mut state = self.state.lock();
        state.awaiting_fc = false;
        state.pending_fc = None;
    }

    /// Wait for a CTS flow control; WAIT frames restart the timer
    fn wait_flow_control(&self, target_id: u32) -> Result<(u8, Duration), PassThruError> {
        let timeout = self.config.flow_control_timeout();
        let mut deadline = Instant::now() + timeout;
        let mut waits = 0u32;
        let mut state = self.state.lock();

        loop {
            if let Some((from, fc)) = state.pending_fc.take() {
                match fc.status {
                    FlowStatus::ContinueToSend => {
                        state.awaiting_fc = false;
                        let block_size = match state.block_size_tx {
                            USE_PEER_VALUE => fc.block_size,
                            value => value as u8,
                        };
                        let st_min = match state.st_min_tx {
                            USE_PEER_VALUE => fc.st_min,
                            value => value as u8,
                        };
                        trace!(from, block_size, st_min, "Flow control CTS");
                        return Ok((block_size, st_min_duration(st_min)));
                    }
                    FlowStatus::Wait => {
                        waits += 1;
                        if waits > self.config.max_wait_frames {
                            state.awaiting_fc = false;
                            return Err(PassThruError::Failed(format!(
                                "0x{:X} sent more than {} flow control WAIT frames",
                                from, self.config.max_wait_frames
                            )));
                        }
                        deadline = Instant::now() + timeout;
                        continue;
                    }
                    FlowStatus::Overflow => {
                        state.awaiting_fc = false;
                        return Err(PassThruError::Failed(format!(
                            "0x{:X} reported receive buffer overflow",
                            from
                        )));
                    }
                }
            }

            if !state.awaiting_fc {
                // teardown released the wait
                return Err(PassThruError::NoFlowControl(target_id));
            }
            if self.fc_arrived.wait_until(&mut state, deadline).timed_out()
                && state.pending_fc.is_none()
            {
                state.awaiting_fc = false;
                warn!(id = target_id, "No flow control within {:?}", timeout);
                return Err(PassThruError::NoFlowControl(target_id));
            }
        }
    }

    fn send_segmented(
        &self,
        msg: &PassThruMsg,
        can_id: u32,
        payload: &[u8],
        link: &dyn DeviceLink,
        timeout: Duration,
    ) -> Result<(), PassThruError> {
        let pad = msg.tx_flags().contains(TxFlags::ISO15765_FRAME_PAD);
        let len = payload.len();

        let mut first = vec![0x10 | ((len >> 8) as u8 & 0x0F), (len & 0xFF) as u8];
        first.extend_from_slice(&payload[..FIRST_FRAME_DATA]);
        let first = self.addressing.can_frame(msg, can_id, first)?;

        self.arm_flow_control();
        if let Err(e) = send_frames(link, &[Frame::can(FrameKind::CanTx, &first)], timeout) {
            self.disarm_flow_control();
            return Err(e);
        }

        let mut offset = FIRST_FRAME_DATA;
        let mut sn: u8 = 1;
        while offset < len {
            let (block_size, separation) = self.wait_flow_control(can_id)?;
            let mut sent_in_block: u8 = 0;

            while offset < len {
                if sent_in_block > 0 && !separation.is_zero() {
                    std::thread::sleep(separation);
                }
                let end = (offset + CONSECUTIVE_FRAME_DATA).min(len);
                let mut data = Vec::with_capacity(CAN_DLC);
                data.push(0x20 | sn);
                data.extend_from_slice(&payload[offset..end]);
                Self::pad(&mut data, pad);
                let frame = self.addressing.can_frame(msg, can_id, data)?;

                sent_in_block = sent_in_block.wrapping_add(1);
                let block_done = block_size != 0 && sent_in_block == block_size && end < len;
                if block_done {
                    self.arm_flow_control();
                }
                if let Err(e) = send_frames(link, &[Frame::can(FrameKind::CanTx, &frame)], timeout)
                {
                    self.disarm_flow_control();
                    return Err(e);
                }

                offset = end;
                sn = (sn + 1) & 0x0F;
                if block_done {
                    break;
                }
            }
        }
        Ok(())
    }

    /// Flow control frame we send in answer to a first frame
    fn flow_control_frame(&self, response: &PassThruMsg) -> Option<Frame> {
        let can_id = response.can_id()?;
        let (block_size, st_min) = {
            let state = self.state.lock();
            (state.block_size, state.st_min)
        };
        let mut data = vec![0x30, block_size, st_min];
        Self::pad(&mut data, response.tx_flags().contains(TxFlags::ISO15765_FRAME_PAD));
        match self.addressing.can_frame(response, can_id, data) {
            Ok(can) => Some(Frame::can(FrameKind::CanTx, &can)),
            Err(e) => {
                warn!("Cannot build flow control frame: {}", e);
                None
            }
        }
    }

    fn deliver(&self, can_id: u32, payload: &[u8], status: RxStatus) -> Option<PassThruMsg> {
        PassThruMsg::with_can_id(self.protocol_id, can_id, payload)
            .ok()
            .map(|msg| {
                msg.with_rx_status(status)
                    .with_timestamp(passthru_protocol::timestamp_us())
            })
    }
}

impl ProtocolVariant for Iso15765Variant {
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
        if msg.len() < CAN_ID_LEN || msg.len() - CAN_ID_LEN > MAX_ISOTP_PAYLOAD {
            return Err(PassThruError::InvalidMsg(format!(
                "ISO 15765 message of {} bytes",
                msg.len()
            )));
        }
        if msg.len() == CAN_ID_LEN {
            return Err(PassThruError::InvalidMsg("ISO 15765 message without payload".into()));
        }
        Ok(())
    }

    fn validate_periodic(&self, msg: &PassThruMsg) -> Result<(), PassThruError> {
        self.validate_msg(msg)?;
        if msg.can_payload().len() > SINGLE_FRAME_MAX {
            return Err(PassThruError::InvalidMsg(
                "periodic ISO 15765 messages must fit a single frame".into(),
            ));
        }
        Ok(())
    }

    fn parse_inbound(&self, frame: &Frame) -> Option<PassThruMsg> {
        let can = self.addressing.accept_frame(frame)?;
        let pci = *can.data.first()?;
        if pci >> 4 == 0x3 {
            self.on_flow_control(can.id, &can.data);
            return None;
        }
        self.addressing.to_msg(self.protocol_id, &can)
    }

    fn frame_outbound(&self, msg: &PassThruMsg) -> Result<Vec<Frame>, PassThruError> {
        self.validate_msg(msg)?;
        let can_id = msg
            .can_id()
            .ok_or_else(|| PassThruError::InvalidMsg("missing CAN id".into()))?;
        let payload = msg.can_payload();
        if payload.len() > SINGLE_FRAME_MAX {
            return Err(PassThruError::InvalidMsg(
                "message needs segmentation".into(),
            ));
        }
        let mut data = Vec::with_capacity(CAN_DLC);
        data.push(payload.len() as u8);
        data.extend_from_slice(payload);
        Self::pad(&mut data, msg.tx_flags().contains(TxFlags::ISO15765_FRAME_PAD));
        let can = self.addressing.can_frame(msg, can_id, data)?;
        Ok(vec![Frame::can(FrameKind::CanTx, &can)])
    }

    fn handle_msg(
        &self,
        msg: PassThruMsg,
        flow_control: Option<&PassThruMsg>,
        actions: &mut InboundActions,
    ) -> bool {
        let Some(can_id) = msg.can_id() else {
            return false;
        };
        let data = msg.can_payload();
        let Some(&pci) = data.first() else {
            return false;
        };
        let status = msg.rx_status() & RxStatus::CAN_29BIT_ID;

        match pci >> 4 {
            0x0 => {
                let len = (pci & 0x0F) as usize;
                if len == 0 || len > SINGLE_FRAME_MAX || len + 1 > data.len() {
                    debug!(id = can_id, len, "Invalid single frame");
                    return false;
                }
                match self.deliver(can_id, &data[1..=len], status) {
                    Some(out) => {
                        actions.deliver(out);
                        true
                    }
                    None => false,
                }
            }
            0x1 => {
                // segmented reception needs a flow control target
                let Some(response) = flow_control else {
                    trace!(id = can_id, "First frame without flow control filter");
                    return false;
                };
                if data.len() < 2 {
                    return false;
                }
                let expected_len = (((pci & 0x0F) as usize) << 8) | data[1] as usize;
                if expected_len <= SINGLE_FRAME_MAX {
                    debug!(id = can_id, expected_len, "Invalid first frame length");
                    return false;
                }
                let first = &data[2..data.len().min(2 + FIRST_FRAME_DATA)];
                let mut buffer = Vec::with_capacity(expected_len);
                buffer.extend_from_slice(first);

                let replaced = self.state.lock().reassembly.insert(
                    can_id,
                    Reassembly {
                        expected_len,
                        data: buffer,
                        next_sn: 1,
                        in_block: 0,
                        rx_status: status,
                    },
                );
                if replaced.is_some() {
                    debug!(id = can_id, "First frame restarted an unfinished message");
                }

                if let Some(indication) =
                    self.deliver(can_id, &[], status | RxStatus::ISO15765_FIRST_FRAME)
                {
                    actions.deliver(indication);
                }
                if let Some(frame) = self.flow_control_frame(response) {
                    actions.respond(frame);
                }
                true
            }
            0x2 => {
                let sn = pci & 0x0F;
                let mut state = self.state.lock();
                let block_size = state.block_size;
                let Some(entry) = state.reassembly.get_mut(&can_id) else {
                    trace!(id = can_id, "Consecutive frame without first frame");
                    return false;
                };
                if sn != entry.next_sn {
                    debug!(id = can_id, expected = entry.next_sn, got = sn, "Sequence error");
                    state.reassembly.remove(&can_id);
                    return false;
                }

                let remaining = entry.expected_len - entry.data.len();
                let chunk = &data[1..data.len().min(1 + remaining)];
                entry.data.extend_from_slice(chunk);
                entry.next_sn = (entry.next_sn + 1) & 0x0F;
                entry.in_block = entry.in_block.wrapping_add(1);

                if entry.data.len() >= entry.expected_len {
                    let done = state.reassembly.remove(&can_id);
                    drop(state);
                    if let Some(done) = done {
                        if let Some(out) = self.deliver(can_id, &done.data, done.rx_status) {
                            actions.deliver(out);
                        }
                    }
                    return true;
                }

                let block_done = block_size != 0 && entry.in_block == block_size;
                if block_done {
                    entry.in_block = 0;
                }
                drop(state);
                if block_done {
                    match flow_control.and_then(|response| self.flow_control_frame(response)) {
                        Some(frame) => actions.respond(frame),
                        None => debug!(id = can_id, "No flow control target for next block"),
                    }
                }
                true
            }
            _ => false,
        }
    }

    fn write_msg(
        &self,
        msg: &PassThruMsg,
        link: &dyn DeviceLink,
        timeout: Duration,
    ) -> Result<(), PassThruError> {
        self.validate_msg(msg)?;
        let payload = msg.can_payload();
        if payload.len() <= SINGLE_FRAME_MAX {
            let frames = self.frame_outbound(msg)?;
            return send_frames(link, &frames, timeout);
        }
        let can_id = msg
            .can_id()
            .ok_or_else(|| PassThruError::InvalidMsg("missing CAN id".into()))?;
        self.send_segmented(msg, can_id, payload, link, timeout)
    }

    fn internal_filters(&self) -> Vec<MsgFilter> {
        let extended_only = self.flags.contains(ConnectFlags::CAN_29BIT_ID)
            && !self.flags.contains(ConnectFlags::CAN_ID_BOTH);
        if !self.config.auto_flow_control || extended_only {
            return Vec::new();
        }

        OBD_RESPONSE_IDS
            .filter_map(|response_id| {
                let request_id = response_id - OBD_REQUEST_OFFSET;
                let fc = PassThruMsg::with_can_id(self.protocol_id, request_id, &[])
                    .ok()?
                    .with_tx_flags(TxFlags::ISO15765_FRAME_PAD);
                MsgFilter::new(
                    FilterKind::FlowControl,
                    vec![0xFF; CAN_ID_LEN],
                    response_id.to_be_bytes().to_vec(),
                    Some(fc),
                )
                .ok()
            })
            .collect()
    }

    fn get_param(&self, param: ConfigParamId) -> Result<u32, PassThruError> {
        let state = self.state.lock();
        match param {
            ConfigParamId::Iso15765Bs => Ok(state.block_size as u32),
            ConfigParamId::Iso15765StMin => Ok(state.st_min as u32),
            ConfigParamId::Iso15765BsTx => Ok(state.block_size_tx),
            ConfigParamId::Iso15765StMinTx => Ok(state.st_min_tx),
            other => Err(PassThruError::NotSupported(format!("{:?}", other))),
        }
    }

    fn set_param(&self, param: ConfigParamId, value: u32) -> Result<(), PassThruError> {
        let byte = |value: u32| -> Result<u8, PassThruError> {
            u8::try_from(value).map_err(|_| {
                PassThruError::InvalidIoctlValue(format!("{:?} = 0x{:X}", param, value))
            })
        };
        let tx_value = |value: u32| -> Result<u32, PassThruError> {
            if value == USE_PEER_VALUE {
                Ok(value)
            } else {
                byte(value).map(u32::from)
            }
        };

        let mut state = self.state.lock();
        match param {
            ConfigParamId::Iso15765Bs => state.block_size = byte(value)?,
            ConfigParamId::Iso15765StMin => state.st_min = byte(value)?,
            ConfigParamId::Iso15765BsTx => state.block_size_tx = tx_value(value)?,
            ConfigParamId::Iso15765StMinTx => state.st_min_tx = tx_value(value)?,
            other => return Err(PassThruError::NotSupported(format!("{:?}", other))),
        }
        Ok(())
    }

    fn teardown(&self) {
        let mut state = self.state.lock();
        state.reassembly.clear();
        state.awaiting_fc = false;
        state.pending_fc = None;
        drop(state);
        self.fc_arrived.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use passthru_protocol::{CanFrame, MockLink};
    use std::sync::Arc;

    fn variant(config: IsoTpConfig) -> Iso15765Variant {
        Iso15765Variant::new(ProtocolId::Iso15765, ConnectFlags::empty(), config)
    }

    fn can_rx(id: u32, data: &[u8]) -> Frame {
        Frame::can(FrameKind::CanRx, &CanFrame::new(id, false, data.to_vec()).unwrap())
    }

    fn fc_response() -> PassThruMsg {
        PassThruMsg::with_can_id(ProtocolId::Iso15765, 0x7E0, &[]).unwrap()
    }

    fn sent_can(link: &MockLink) -> Vec<CanFrame> {
        link.sent_of_kind(FrameKind::CanTx)
            .iter()
            .map(|f| f.as_can().unwrap())
            .collect()
    }

    #[test]
    fn test_st_min_decoding() {
        assert_eq!(st_min_duration(0x0A), Duration::from_millis(10));
        assert_eq!(st_min_duration(0xF3), Duration::from_micros(300));
        assert_eq!(st_min_duration(0x80), Duration::from_millis(127));
    }

    #[test]
    fn test_single_frame_write() {
        let iso = variant(IsoTpConfig::default());
        let link = MockLink::new();
        let msg = PassThruMsg::with_can_id(ProtocolId::Iso15765, 0x7E0, &[0x01, 0x0C])
            .unwrap()
            .with_tx_flags(TxFlags::ISO15765_FRAME_PAD);
        iso.write_msg(&msg, &link, Duration::ZERO).unwrap();

        let sent = sent_can(&link);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].id, 0x7E0);
        assert_eq!(sent[0].data, vec![0x02, 0x01, 0x0C, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn test_segmented_write_honors_flow_control() {
        let iso = Arc::new(variant(IsoTpConfig::default()));
        let link = MockLink::new();

        // ECU answers the first frame and the end of each block with CTS, BS 1
        let ecu = Arc::clone(&iso);
        link.set_responder(move |frame| {
            if let Ok(can) = frame.as_can() {
                if can.data[0] == 0x10 || can.data[0] == 0x21 {
                    ecu.parse_inbound(&can_rx(0x7E8, &[0x30, 0x01, 0x00]));
                }
            }
            Vec::new()
        });

        let payload: Vec<u8> = (0..20).collect();
        let msg = PassThruMsg::with_can_id(ProtocolId::Iso15765, 0x7E0, &payload).unwrap();
        iso.write_msg(&msg, &link, Duration::ZERO).unwrap();

        let sent = sent_can(&link);
        assert_eq!(sent.len(), 3);
        assert_eq!(sent[0].data[..2], [0x10, 20]);
        assert_eq!(sent[0].data[2..], [0, 1, 2, 3, 4, 5]);
        assert_eq!(sent[1].data, vec![0x21, 6, 7, 8, 9, 10, 11, 12]);
        assert_eq!(sent[2].data, vec![0x22, 13, 14, 15, 16, 17, 18, 19]);
    }

    #[test]
    fn test_block_without_second_flow_control_times_out() {
        let iso = Arc::new(variant(IsoTpConfig {
            flow_control_timeout_ms: 50,
            ..Default::default()
        }));
        let link = MockLink::new();
        let ecu = Arc::clone(&iso);
        link.set_responder(move |frame| {
            if let Ok(can) = frame.as_can() {
                if can.data[0] == 0x10 {
                    ecu.parse_inbound(&can_rx(0x7E8, &[0x30, 0x01, 0x00]));
                }
            }
            Vec::new()
        });

        let msg = PassThruMsg::with_can_id(ProtocolId::Iso15765, 0x7E0, &[0u8; 20]).unwrap();
        assert_eq!(
            iso.write_msg(&msg, &link, Duration::ZERO),
            Err(PassThruError::NoFlowControl(0x7E0))
        );
        assert_eq!(sent_can(&link).len(), 2);
    }

    #[test]
    fn test_segmented_write_without_flow_control_times_out() {
        let iso = variant(IsoTpConfig {
            flow_control_timeout_ms: 50,
            ..Default::default()
        });
        let link = MockLink::new();
        let msg = PassThruMsg::with_can_id(ProtocolId::Iso15765, 0x7E0, &[0u8; 12]).unwrap();
        assert_eq!(
            iso.write_msg(&msg, &link, Duration::ZERO),
            Err(PassThruError::NoFlowControl(0x7E0))
        );
        assert_eq!(sent_can(&link).len(), 1);
    }

    #[test]
    fn test_overflow_flow_control_fails_write() {
        let iso = Arc::new(variant(IsoTpConfig::default()));
        let link = MockLink::new();
        let responder = Arc::clone(&iso);
        link.set_responder(move |frame| {
            if let Ok(can) = frame.as_can() {
                if can.data[0] >> 4 == 1 {
                    responder.parse_inbound(&can_rx(0x7E8, &[0x32, 0, 0]));
                }
            }
            Vec::new()
        });
        let msg = PassThruMsg::with_can_id(ProtocolId::Iso15765, 0x7E0, &[0u8; 12]).unwrap();
        assert!(matches!(
            iso.write_msg(&msg, &link, Duration::ZERO),
            Err(PassThruError::Failed(_))
        ));
    }

    #[test]
    fn test_single_frame_reception() {
        let iso = variant(IsoTpConfig::default());
        let raw = iso.parse_inbound(&can_rx(0x7E8, &[0x03, 0x41, 0x0D, 0x37, 0xAA])).unwrap();
        let mut actions = InboundActions::default();
        assert!(iso.handle_msg(raw, Some(&fc_response()), &mut actions));

        let (delivered, responses) = actions.into_parts();
        assert!(responses.is_empty());
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].data(), &[0x00, 0x00, 0x07, 0xE8, 0x41, 0x0D, 0x37]);
    }

    #[test]
    fn test_single_frame_needs_no_flow_control_filter() {
        let iso = variant(IsoTpConfig::default());
        let raw = iso.parse_inbound(&can_rx(0x7E8, &[0x02, 0x41, 0x00])).unwrap();
        let mut actions = InboundActions::default();
        assert!(iso.handle_msg(raw, None, &mut actions));

        let (delivered, responses) = actions.into_parts();
        assert!(responses.is_empty());
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].can_payload(), &[0x41, 0x00]);
    }

    #[test]
    fn test_first_frame_without_flow_control_filter_is_ignored() {
        let iso = variant(IsoTpConfig::default());
        let raw = iso
            .parse_inbound(&can_rx(0x7E8, &[0x10, 0x0A, 0x49, 0x02, 0x01, 0x31, 0x47, 0x31]))
            .unwrap();
        let mut actions = InboundActions::default();
        assert!(!iso.handle_msg(raw, None, &mut actions));
        assert!(actions.deliveries().is_empty());

        let next = iso.parse_inbound(&can_rx(0x7E8, &[0x21, 0x4A, 0x34, 0x41])).unwrap();
        let mut actions = InboundActions::default();
        assert!(!iso.handle_msg(next, None, &mut actions));
    }

    #[test]
    fn test_multi_frame_reception() {
        let iso = variant(IsoTpConfig {
            block_size: 0,
            st_min: 5,
            ..Default::default()
        });
        let fc = fc_response();

        let first = iso
            .parse_inbound(&can_rx(0x7E8, &[0x10, 0x0A, 0x49, 0x02, 0x01, 0x31, 0x47, 0x31]))
            .unwrap();
        let mut actions = InboundActions::default();
        assert!(iso.handle_msg(first, Some(&fc), &mut actions));
        let (delivered, responses) = actions.into_parts();
        assert_eq!(delivered.len(), 1);
        assert!(delivered[0].rx_status().contains(RxStatus::ISO15765_FIRST_FRAME));
        assert_eq!(delivered[0].data(), &[0x00, 0x00, 0x07, 0xE8]);
        assert_eq!(responses.len(), 1);
        let fc_frame = responses[0].as_can().unwrap();
        assert_eq!(fc_frame.id, 0x7E0);
        assert_eq!(fc_frame.data, vec![0x30, 0x00, 0x05]);

        let second = iso
            .parse_inbound(&can_rx(0x7E8, &[0x21, 0x4A, 0x34, 0x41, 0x00, 0x00, 0x00, 0x00]))
            .unwrap();
        let mut actions = InboundActions::default();
        assert!(iso.handle_msg(second, Some(&fc), &mut actions));
        let (delivered, _) = actions.into_parts();
        assert_eq!(delivered.len(), 1);
        assert_eq!(
            delivered[0].can_payload(),
            &[0x49, 0x02, 0x01, 0x31, 0x47, 0x31, 0x4A, 0x34, 0x41, 0x00]
        );
    }

    #[test]
    fn test_sequence_error_drops_message() {
        let iso = variant(IsoTpConfig::default());
        let fc = fc_response();
        let first = iso
            .parse_inbound(&can_rx(0x7E8, &[0x10, 0x10, 1, 2, 3, 4, 5, 6]))
            .unwrap();
        iso.handle_msg(first, Some(&fc), &mut InboundActions::default());

        let wrong = iso.parse_inbound(&can_rx(0x7E8, &[0x22, 7, 8, 9, 10, 11, 12, 13])).unwrap();
        let mut actions = InboundActions::default();
        assert!(!iso.handle_msg(wrong, Some(&fc), &mut actions));
        assert!(actions.deliveries().is_empty());
    }

    #[test]
    fn test_auto_flow_control_filters() {
        let iso = variant(IsoTpConfig::default());
        let filters = iso.internal_filters();
        assert_eq!(filters.len(), 8);
        assert_eq!(filters[0].pattern(), &[0x00, 0x00, 0x07, 0xE8]);
        assert_eq!(filters[0].flow_control().unwrap().can_id(), Some(0x7E0));
        assert_eq!(filters[7].flow_control().unwrap().can_id(), Some(0x7E7));

        let disabled = variant(IsoTpConfig {
            auto_flow_control: false,
            ..Default::default()
        });
        assert!(disabled.internal_filters().is_empty());
    }

    #[test]
    fn test_params() {
        let iso = variant(IsoTpConfig::default());
        assert_eq!(iso.get_param(ConfigParamId::Iso15765BsTx), Ok(0xFFFF));
        iso.set_param(ConfigParamId::Iso15765Bs, 8).unwrap();
        assert_eq!(iso.get_param(ConfigParamId::Iso15765Bs), Ok(8));
        assert!(matches!(
            iso.set_param(ConfigParamId::Iso15765StMin, 0x100),
            Err(PassThruError::InvalidIoctlValue(_))
        ));
        assert!(matches!(
            iso.get_param(ConfigParamId::DataRate),
            Err(PassThruError::NotSupported(_))
        ));
    }

    #[test]
    fn test_periodic_must_fit_single_frame() {
        let iso = variant(IsoTpConfig::default());
        let short = PassThruMsg::with_can_id(ProtocolId::Iso15765, 0x7DF, &[0x3E, 0x00]).unwrap();
        assert!(iso.validate_periodic(&short).is_ok());
        let long = PassThruMsg::with_can_id(ProtocolId::Iso15765, 0x7DF, &[0; 8]).unwrap();
        assert!(iso.validate_periodic(&long).is_err());
    }
}
