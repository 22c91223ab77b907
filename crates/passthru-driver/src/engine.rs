//! Channel Protocol Engine
//!
//! One engine per open channel. It owns the channel's receive buffer,
//! filter table and periodic scheduler, and routes traffic between the API,
//! the protocol variant and the device link.
//!
//! Locking: the TX mutex guards the write path and channel settings. Filter
//! mutations take TX first, then the filter `RwLock`; the inbound path only
//! takes the filter read lock so it keeps flowing while a segmented write
//! holds TX. The RX buffer lock is always taken last.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use metrics::counter;
use msg_buffer::{BufferError, RxBuffer};
use msg_filter::{FilterKind, FilterOutcome, FilterOwner, FilterTable, MsgFilter};
use parking_lot::{Mutex, RwLock};
use passthru_protocol::ioctl::{decode_j1962_pins, encode_j1962_pins};
use passthru_protocol::{
    ConfigParamId, ConnectFlags, DeviceLink, Frame, IoctlRequest, IoctlResponse, PassThruError,
    PassThruMsg, ProtocolId, RxStatus, SConfig, Status,
};
use periodic_scheduler::{FireOutcome, PeriodicScheduler, PeriodicSink, PeriodicStats, SchedulerConfig};
use thiserror::Error;
use tracing::{debug, info, trace, warn};

use crate::config::DriverConfig;
use crate::variant::{send_frames, InboundActions, ProtocolVariant};

/// J1962 pins that carry ground and battery
const RESERVED_J1962_PINS: [u32; 3] = [4, 5, 16];

/// Per channel limits and timings
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub rx_capacity: usize,
    pub max_filters: usize,
    /// Bound on the TX lock wait of a periodic firing
    pub periodic_lock_wait: Duration,
    pub scheduler: SchedulerConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::from(&DriverConfig::default())
    }
}

impl From<&DriverConfig> for EngineConfig {
    fn from(config: &DriverConfig) -> Self {
        Self {
            rx_capacity: config.rx_buffer_capacity,
            max_filters: config.max_filters,
            periodic_lock_wait: config.periodic_lock_wait(),
            scheduler: SchedulerConfig {
                max_entries: config.max_periodic_msgs,
                ..SchedulerConfig::default()
            },
        }
    }
}

/// Messages returned by one read
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReadBatch {
    pub msgs: Vec<PassThruMsg>,
    /// Messages were dropped since the previous non-empty read
    pub overflow: bool,
}

impl ReadBatch {
    /// Boundary status of the read
    pub fn status(&self) -> Status {
        if self.overflow {
            Status::BufferOverflow
        } else if self.msgs.is_empty() {
            Status::BufferEmpty
        } else {
            Status::NoError
        }
    }

    pub fn len(&self) -> usize {
        self.msgs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.msgs.is_empty()
    }
}

/// A write that stopped at a failing message
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{written} message(s) written before failure: {error}")]
pub struct PartialWrite {
    /// Messages transmitted before the failure
    pub written: usize,
    #[source]
    pub error: PassThruError,
}

impl PartialWrite {
    fn nothing_written(error: PassThruError) -> Self {
        Self { written: 0, error }
    }
}

/// Failure of a write with a bounded lock wait
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WriteError {
    #[error("Write path busy")]
    Busy,

    #[error(transparent)]
    Partial(#[from] PartialWrite),
}

/// Channel settings guarded by the TX lock
struct TxState {
    flags: ConnectFlags,
    data_rate: u32,
    loopback: bool,
    pins: Option<(u32, u32)>,
}

pub struct ProtocolEngine {
    channel_id: u32,
    protocol_id: ProtocolId,
    variant: Box<dyn ProtocolVariant>,
    link: Arc<dyn DeviceLink>,
    connected: AtomicBool,
    rx: RxBuffer<PassThruMsg>,
    tx: Mutex<TxState>,
    filters: RwLock<FilterTable>,
    scheduler: PeriodicScheduler<PassThruMsg>,
    periodic_lock_wait: Duration,
    self_ref: Weak<ProtocolEngine>,
}

impl ProtocolEngine {
    /// Open the protocol on the translator and build a connected engine
    pub fn connect(
        channel_id: u32,
        variant: Box<dyn ProtocolVariant>,
        link: Arc<dyn DeviceLink>,
        flags: ConnectFlags,
        baudrate: u32,
        config: EngineConfig,
    ) -> Result<Arc<Self>, PassThruError> {
        variant.validate_connect(flags, baudrate)?;
        let protocol_id = variant.protocol_id();

        let rx = RxBuffer::new(config.rx_capacity)
            .map_err(|e| PassThruError::Failed(format!("RX buffer: {}", e)))?;
        let mut filters = FilterTable::with_limit(config.max_filters);
        for filter in variant.internal_filters() {
            filters.add(filter, FilterOwner::Variant)?;
        }

        link.send_frame(&Frame::protocol_open(protocol_id, flags, baudrate), Duration::ZERO)?;

        let engine = Arc::new_cyclic(|self_ref| Self {
            channel_id,
            protocol_id,
            variant,
            link,
            connected: AtomicBool::new(true),
            rx,
            tx: Mutex::new(TxState {
                flags,
                data_rate: baudrate,
                loopback: false,
                pins: None,
            }),
            filters: RwLock::new(filters),
            scheduler: PeriodicScheduler::new(config.scheduler),
            periodic_lock_wait: config.periodic_lock_wait,
            self_ref: self_ref.clone(),
        });

        info!(
            channel = channel_id,
            protocol = ?protocol_id,
            flags = flags.bits(),
            baudrate,
            "Channel connected"
        );
        Ok(engine)
    }

    pub fn channel_id(&self) -> u32 {
        self.channel_id
    }

    pub fn protocol_id(&self) -> ProtocolId {
        self.protocol_id
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn ensure_connected(&self) -> Result<(), PassThruError> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(PassThruError::InvalidChannelId(self.channel_id))
        }
    }

    fn check_protocol(&self, msg: &PassThruMsg) -> Result<(), PassThruError> {
        if msg.protocol_id() != self.protocol_id {
            return Err(PassThruError::MsgProtocolId {
                expected: self.protocol_id.as_raw(),
                actual: msg.protocol_id().as_raw(),
            });
        }
        Ok(())
    }

    /// Read up to `max` messages, waiting up to `timeout` for the first
    pub fn read_msgs(&self, max: usize, timeout: Duration) -> Result<ReadBatch, PassThruError> {
        self.ensure_connected()?;
        let batch = self
            .rx
            .pop_batch(max, timeout)
            .map_err(|_| PassThruError::InvalidChannelId(self.channel_id))?;

        let mut msgs = batch.items;
        if batch.overflow {
            if let Some(first) = msgs.first_mut() {
                let status = first.rx_status() | RxStatus::BUFFER_OVERFLOW;
                *first = first.clone().with_rx_status(status);
            }
            debug!(channel = self.channel_id, "Reporting RX overflow");
        }
        Ok(ReadBatch {
            msgs,
            overflow: batch.overflow,
        })
    }

    /// Transmit messages in order, stopping at the first failure
    pub fn write_msgs(
        &self,
        msgs: &[PassThruMsg],
        timeout: Duration,
    ) -> Result<usize, PartialWrite> {
        self.ensure_connected().map_err(PartialWrite::nothing_written)?;
        let tx = self.tx.lock();
        self.write_locked(&tx, msgs, timeout)
    }

    /// `write_msgs` giving up with `Busy` if the write path stays taken
    /// longer than `lock_wait`
    pub fn write_msgs_within(
        &self,
        msgs: &[PassThruMsg],
        timeout: Duration,
        lock_wait: Duration,
    ) -> Result<usize, WriteError> {
        self.ensure_connected().map_err(PartialWrite::nothing_written)?;
        let tx = self.tx.try_lock_for(lock_wait).ok_or(WriteError::Busy)?;
        Ok(self.write_locked(&tx, msgs, timeout)?)
    }

    fn write_locked(
        &self,
        tx: &TxState,
        msgs: &[PassThruMsg],
        timeout: Duration,
    ) -> Result<usize, PartialWrite> {
        // disconnect may have won the race for the lock
        self.ensure_connected().map_err(PartialWrite::nothing_written)?;

        for (written, msg) in msgs.iter().enumerate() {
            if let Err(error) = self.write_one(tx, msg, timeout) {
                debug!(channel = self.channel_id, written, "Write stopped: {}", error);
                return Err(PartialWrite { written, error });
            }
        }
        trace!(channel = self.channel_id, count = msgs.len(), "Messages written");
        Ok(msgs.len())
    }

    fn write_one(
        &self,
        tx: &TxState,
        msg: &PassThruMsg,
        timeout: Duration,
    ) -> Result<(), PassThruError> {
        self.check_protocol(msg)?;
        self.variant.validate_msg(msg)?;
        self.variant.write_msg(msg, &*self.link, timeout)?;
        if tx.loopback {
            self.deliver(msg.loopback_copy());
        }
        Ok(())
    }

    /// Register a message for periodic transmission
    pub fn start_periodic_msg(
        &self,
        msg: &PassThruMsg,
        interval: Duration,
    ) -> Result<u32, PassThruError> {
        self.ensure_connected()?;
        self.check_protocol(msg)?;
        self.variant.validate_periodic(msg)?;

        let sink: Weak<dyn PeriodicSink<PassThruMsg>> = self.self_ref.clone();
        let id = self.scheduler.start(msg.clone(), interval, sink)?;
        debug!(channel = self.channel_id, id, "Periodic message registered");
        Ok(id)
    }

    /// Stop a periodic message; returns once its timer has exited
    pub fn stop_periodic_msg(&self, id: u32) -> Result<PeriodicStats, PassThruError> {
        self.ensure_connected()?;
        Ok(self.scheduler.stop(id)?)
    }

    pub fn periodic_stats(&self, id: u32) -> Option<PeriodicStats> {
        self.scheduler.stats(id)
    }

    /// Add an API filter
    pub fn start_msg_filter(
        &self,
        kind: FilterKind,
        mask: &[u8],
        pattern: &[u8],
        flow_control: Option<&PassThruMsg>,
    ) -> Result<u32, PassThruError> {
        self.ensure_connected()?;
        if let Some(response) = flow_control {
            self.check_protocol(response)?;
        }
        let filter = MsgFilter::new(kind, mask.to_vec(), pattern.to_vec(), flow_control.cloned())?;

        let _tx = self.tx.lock();
        let id = self.filters.write().add(filter, FilterOwner::Api)?;
        Ok(id)
    }

    /// Remove an API filter
    pub fn stop_msg_filter(&self, id: u32) -> Result<(), PassThruError> {
        self.ensure_connected()?;
        let _tx = self.tx.lock();
        self.filters.write().remove(id)?;
        Ok(())
    }

    pub fn ioctl(&self, request: IoctlRequest) -> Result<IoctlResponse, PassThruError> {
        self.ensure_connected()?;
        match request {
            IoctlRequest::GetConfig(params) => {
                let tx = self.tx.lock();
                let values = params
                    .into_iter()
                    .map(|param| self.get_config(&tx, param).map(|v| SConfig::new(param, v)))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(IoctlResponse::Config(values))
            }
            IoctlRequest::SetConfig(params) => {
                let mut tx = self.tx.lock();
                for config in &params {
                    self.set_config(&mut tx, config.parameter, config.value)?;
                }
                Ok(IoctlResponse::Done)
            }
            // writes complete before returning, so nothing is ever queued
            IoctlRequest::ClearTxBuffer => Ok(IoctlResponse::Done),
            IoctlRequest::ClearRxBuffer => {
                self.rx.clear();
                Ok(IoctlResponse::Done)
            }
            IoctlRequest::ClearPeriodicMsgs => {
                let stopped = self.scheduler.stop_all();
                debug!(channel = self.channel_id, stopped, "Periodic messages cleared");
                Ok(IoctlResponse::Done)
            }
            IoctlRequest::ClearMsgFilters => {
                let _tx = self.tx.lock();
                self.filters.write().clear_api();
                Ok(IoctlResponse::Done)
            }
            other => Err(PassThruError::NotSupported(format!("IOCTL {:?}", other.id()))),
        }
    }

    fn get_config(&self, tx: &TxState, param: ConfigParamId) -> Result<u32, PassThruError> {
        match param {
            ConfigParamId::DataRate => Ok(tx.data_rate),
            ConfigParamId::Loopback => Ok(tx.loopback as u32),
            ConfigParamId::J1962Pins => {
                if !self.protocol_id.is_pin_switched() {
                    return Err(PassThruError::PinInvalid(0, 0));
                }
                Ok(tx
                    .pins
                    .map(|(pin1, pin2)| encode_j1962_pins(pin1, pin2))
                    .unwrap_or(0))
            }
            other => self.variant.get_param(other),
        }
    }

    fn set_config(
        &self,
        tx: &mut TxState,
        param: ConfigParamId,
        value: u32,
    ) -> Result<(), PassThruError> {
        match param {
            ConfigParamId::DataRate => {
                self.variant.validate_baudrate(value)?;
                self.link.send_frame(
                    &Frame::protocol_open(self.protocol_id, tx.flags, value),
                    Duration::ZERO,
                )?;
                tx.data_rate = value;
                info!(channel = self.channel_id, baudrate = value, "Data rate changed");
            }
            ConfigParamId::Loopback => {
                tx.loopback = match value {
                    0 => false,
                    1 => true,
                    other => {
                        return Err(PassThruError::InvalidIoctlValue(format!(
                            "LOOPBACK = {}",
                            other
                        )))
                    }
                };
            }
            ConfigParamId::J1962Pins => {
                let (pin1, pin2) = decode_j1962_pins(value);
                if !self.protocol_id.is_pin_switched() || !valid_pin_pair(pin1, pin2) {
                    return Err(PassThruError::PinInvalid(pin1, pin2));
                }
                tx.pins = (pin1 != 0).then_some((pin1, pin2));
                debug!(channel = self.channel_id, pin1, pin2, "J1962 pins set");
            }
            other => self.variant.set_param(other, value)?,
        }
        Ok(())
    }

    /// Route one inbound translator frame through filters into RX
    ///
    /// Called from the inbound pump; never takes the TX lock.
    pub fn ingest(&self, frame: &Frame) {
        if !self.is_connected() {
            return;
        }
        let Some(msg) = self.variant.parse_inbound(frame) else {
            return;
        };

        let flow_control = match self.filters.read().evaluate(&msg) {
            FilterOutcome::Block => {
                trace!(channel = self.channel_id, "Inbound message blocked");
                return;
            }
            FilterOutcome::Pass => None,
            FilterOutcome::FlowControl(response) => Some(response),
        };

        let mut actions = InboundActions::default();
        if !self.variant.handle_msg(msg, flow_control.as_ref(), &mut actions) {
            return;
        }

        let (deliveries, responses) = actions.into_parts();
        if !responses.is_empty() {
            if let Err(e) = send_frames(&*self.link, &responses, Duration::ZERO) {
                warn!(channel = self.channel_id, "Failed to send response frame: {}", e);
            }
        }
        for msg in deliveries {
            self.deliver(msg);
        }
    }

    fn deliver(&self, msg: PassThruMsg) {
        match self.rx.push(msg) {
            Ok(()) => {}
            Err(BufferError::Full { capacity }) => {
                counter!("passthru_rx_overflow_total").increment(1);
                debug!(channel = self.channel_id, capacity, "RX buffer full, message dropped");
            }
            Err(e) => trace!(channel = self.channel_id, "Message not delivered: {}", e),
        }
    }

    /// Tear the channel down; every later call fails with `InvalidChannelId`
    pub fn disconnect(&self) -> Result<(), PassThruError> {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return Err(PassThruError::InvalidChannelId(self.channel_id));
        }

        let stopped = self.scheduler.stop_all();
        // releases a segmented write waiting for flow control
        self.variant.teardown();

        {
            let _tx = self.tx.lock();
            let mut filters = self.filters.write();
            let internal = filters.remove_variant_filters();
            filters.clear();
            drop(filters);
            trace!(channel = self.channel_id, internal, "Filters removed");

            if let Err(e) = self
                .link
                .send_frame(&Frame::protocol_close(self.protocol_id), Duration::ZERO)
            {
                warn!(channel = self.channel_id, "Protocol close not sent: {}", e);
            }
        }

        let dropped = self.rx.close();
        info!(
            channel = self.channel_id,
            protocol = ?self.protocol_id,
            stopped_periodic = stopped,
            dropped_msgs = dropped,
            "Channel disconnected"
        );
        Ok(())
    }
}

impl PeriodicSink<PassThruMsg> for ProtocolEngine {
    fn fire(&self, id: u32, msg: &PassThruMsg) -> FireOutcome {
        match self.write_msgs_within(std::slice::from_ref(msg), Duration::ZERO, self.periodic_lock_wait)
        {
            Ok(_) => FireOutcome::Sent,
            Err(WriteError::Busy) => {
                debug!(channel = self.channel_id, id, "Write path busy, periodic tick missed");
                FireOutcome::Busy
            }
            Err(WriteError::Partial(failure)) => {
                warn!(channel = self.channel_id, id, "Periodic message failed: {}", failure.error);
                FireOutcome::Failed
            }
        }
    }
}

/// `(0, 0)` releases the pins; otherwise two distinct signal pins
fn valid_pin_pair(pin1: u32, pin2: u32) -> bool {
    if pin1 == 0 && pin2 == 0 {
        return true;
    }
    let usable = |pin: u32| (1..=16).contains(&pin) && !RESERVED_J1962_PINS.contains(&pin);
    pin1 != pin2 && usable(pin1) && usable(pin2)
}
