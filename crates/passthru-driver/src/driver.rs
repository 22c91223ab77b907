//! Driver Facade
//!
//! `PassThruDriver` is the one object an application talks to. It owns the
//! device link, the channel registry and the inbound pump, and records the
//! status of every call for the last-error side channel.

use std::sync::Arc;
use std::time::Duration;

use msg_filter::FilterKind;
use parking_lot::Mutex;
use passthru_protocol::{
    ConnectFlags, Description, DeviceLink, IoctlId, IoctlRequest, IoctlResponse, PassThruError,
    PassThruMsg, ProtocolId, SConfig, SerialLink, Status,
};
use periodic_scheduler::PeriodicStats;
use tracing::{debug, info, warn};

use crate::config::DriverConfig;
use crate::engine::{EngineConfig, PartialWrite, ProtocolEngine, ReadBatch};
use crate::pump::InboundPump;
use crate::registry::{Channel, ChannelRegistry, RegistryError};
use crate::variant::create_variant;

struct LastError {
    status: Status,
    detail: Option<String>,
}

/// Passthrough driver instance
pub struct PassThruDriver {
    link: Arc<dyn DeviceLink>,
    registry: Arc<ChannelRegistry>,
    config: DriverConfig,
    pump: Mutex<Option<InboundPump>>,
    /// Serializes connect, disconnect and close
    lifecycle: Mutex<()>,
    last_error: Mutex<LastError>,
}

impl PassThruDriver {
    /// Create a driver over an existing device link
    pub fn new(link: Arc<dyn DeviceLink>, config: DriverConfig) -> Self {
        Self {
            link,
            registry: Arc::new(ChannelRegistry::new(config.max_channels)),
            config,
            pump: Mutex::new(None),
            lifecycle: Mutex::new(()),
            last_error: Mutex::new(LastError {
                status: Status::NoError,
                detail: None,
            }),
        }
    }

    /// Create a driver talking to the translator over the configured serial port
    pub fn with_serial(config: DriverConfig) -> Self {
        let link = SerialLink::new(&config.serial.port, config.serial.baud_rate)
            .with_read_timeout(Duration::from_millis(config.serial.read_timeout_ms));
        Self::new(Arc::new(link), config)
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    /// Number of open channels
    pub fn channel_count(&self) -> usize {
        self.registry.len()
    }

    /// Bring up the device link and start receiving
    ///
    /// `identifier` selects the port; `None` uses the configured one.
    pub fn open(&self, identifier: Option<&str>) -> Result<(), PassThruError> {
        let result = self.open_inner(identifier);
        self.record(result)
    }

    fn open_inner(&self, identifier: Option<&str>) -> Result<(), PassThruError> {
        self.link
            .wait_until_initialized(identifier, self.config.init_timeout())?;

        let mut pump = self.pump.lock();
        if pump.is_none() {
            let started = InboundPump::start(Arc::clone(&self.link), Arc::clone(&self.registry))
                .map_err(|e| PassThruError::Failed(format!("inbound pump: {}", e)))?;
            *pump = Some(started);
        }
        info!("Driver open");
        Ok(())
    }

    /// Disconnect every channel and stop receiving
    pub fn close(&self) -> Result<(), PassThruError> {
        self.shutdown();
        self.record(Ok(()))
    }

    fn shutdown(&self) {
        {
            let _lifecycle = self.lifecycle.lock();
            for channel in self.registry.drain() {
                if let Err(e) = channel.engine.disconnect() {
                    debug!(channel = channel.id, "Channel already closed: {}", e);
                }
            }
        }
        let pump = self.pump.lock().take();
        if let Some(mut pump) = pump {
            pump.stop();
            info!("Driver closed");
        }
    }

    /// Open a channel and return its id
    pub fn connect(
        &self,
        protocol_id: ProtocolId,
        flags: ConnectFlags,
        baudrate: u32,
    ) -> Result<u32, PassThruError> {
        let result = self.connect_inner(protocol_id, flags, baudrate);
        self.record(result)
    }

    /// `connect` with raw protocol id and flag values
    pub fn connect_raw(
        &self,
        protocol_id: u32,
        flags: u32,
        baudrate: u32,
    ) -> Result<u32, PassThruError> {
        let result = ProtocolId::try_from(protocol_id).and_then(|protocol_id| {
            let flags = ConnectFlags::from_bits(flags).ok_or(PassThruError::InvalidFlags(flags))?;
            self.connect_inner(protocol_id, flags, baudrate)
        });
        self.record(result)
    }

    fn connect_inner(
        &self,
        protocol_id: ProtocolId,
        flags: ConnectFlags,
        baudrate: u32,
    ) -> Result<u32, PassThruError> {
        let _lifecycle = self.lifecycle.lock();

        if self.registry.find_by_protocol(protocol_id).is_some() {
            return Err(PassThruError::ChannelInUse);
        }
        self.ensure_device()?;
        let variant = create_variant(protocol_id, flags, &self.config.iso15765)?;
        if !self.registry.has_capacity() {
            return Err(RegistryError::CapacityExceeded(self.registry.capacity()).into());
        }

        let channel_id = self.registry.allocate_id();
        let engine = ProtocolEngine::connect(
            channel_id,
            variant,
            Arc::clone(&self.link),
            flags,
            baudrate,
            EngineConfig::from(&self.config),
        )?;

        let channel = Channel {
            id: channel_id,
            protocol_id,
            engine: Arc::clone(&engine),
        };
        if let Err(e) = self.registry.add(channel) {
            warn!(channel = channel_id, "Registration failed after connect: {}", e);
            if let Err(rollback) = engine.disconnect() {
                debug!(channel = channel_id, "Rollback disconnect failed: {}", rollback);
            }
            return Err(e.into());
        }
        Ok(channel_id)
    }

    /// Close a channel
    pub fn disconnect(&self, channel_id: u32) -> Result<(), PassThruError> {
        let result = self.disconnect_inner(channel_id);
        self.record(result)
    }

    fn disconnect_inner(&self, channel_id: u32) -> Result<(), PassThruError> {
        let _lifecycle = self.lifecycle.lock();
        let channel = self.channel(channel_id)?;
        channel.engine.disconnect()?;
        self.registry.remove_by_id(channel_id)?;
        Ok(())
    }

    /// Read up to `max` messages, waiting up to `timeout` for the first
    ///
    /// The recorded status is the batch status, so an empty read leaves
    /// `BufferEmpty` behind.
    pub fn read_msgs(
        &self,
        channel_id: u32,
        max: usize,
        timeout: Duration,
    ) -> Result<ReadBatch, PassThruError> {
        let result = self
            .channel(channel_id)
            .and_then(|channel| channel.engine.read_msgs(max, timeout));
        match result {
            Ok(batch) => {
                self.record_status(batch.status(), None);
                Ok(batch)
            }
            Err(e) => self.record(Err(e)),
        }
    }

    pub fn write_msgs(
        &self,
        channel_id: u32,
        msgs: &[PassThruMsg],
        timeout: Duration,
    ) -> Result<usize, PartialWrite> {
        let result = match self.channel(channel_id) {
            Ok(channel) => channel.engine.write_msgs(msgs, timeout),
            Err(error) => Err(PartialWrite { written: 0, error }),
        };
        match &result {
            Ok(_) => self.record_status(Status::NoError, None),
            Err(failure) => self.record_error(&failure.error),
        }
        result
    }

    pub fn start_periodic_msg(
        &self,
        channel_id: u32,
        msg: &PassThruMsg,
        interval: Duration,
    ) -> Result<u32, PassThruError> {
        let result = self
            .channel(channel_id)
            .and_then(|channel| channel.engine.start_periodic_msg(msg, interval));
        self.record(result)
    }

    pub fn stop_periodic_msg(
        &self,
        channel_id: u32,
        msg_id: u32,
    ) -> Result<PeriodicStats, PassThruError> {
        let result = self
            .channel(channel_id)
            .and_then(|channel| channel.engine.stop_periodic_msg(msg_id));
        self.record(result)
    }

    pub fn start_msg_filter(
        &self,
        channel_id: u32,
        kind: FilterKind,
        mask: &[u8],
        pattern: &[u8],
        flow_control: Option<&PassThruMsg>,
    ) -> Result<u32, PassThruError> {
        let result = self.channel(channel_id).and_then(|channel| {
            channel
                .engine
                .start_msg_filter(kind, mask, pattern, flow_control)
        });
        self.record(result)
    }

    pub fn stop_msg_filter(&self, channel_id: u32, filter_id: u32) -> Result<(), PassThruError> {
        let result = self
            .channel(channel_id)
            .and_then(|channel| channel.engine.stop_msg_filter(filter_id));
        self.record(result)
    }

    pub fn ioctl(
        &self,
        channel_id: u32,
        request: IoctlRequest,
    ) -> Result<IoctlResponse, PassThruError> {
        let result = self
            .channel(channel_id)
            .and_then(|channel| channel.engine.ioctl(request));
        self.record(result)
    }

    /// `ioctl` with a raw IOCTL id
    ///
    /// `config` is the SCONFIG list for GET_CONFIG and SET_CONFIG; only the
    /// parameter ids are used for GET_CONFIG.
    pub fn ioctl_raw(
        &self,
        channel_id: u32,
        ioctl_id: u32,
        config: Option<&[SConfig]>,
    ) -> Result<IoctlResponse, PassThruError> {
        let result = self.channel(channel_id).and_then(|channel| {
            let request = raw_request(IoctlId::try_from(ioctl_id)?, config)?;
            channel.engine.ioctl(request)
        });
        self.record(result)
    }

    /// Status of the most recent call
    pub fn last_error(&self) -> Status {
        self.last_error.lock().status
    }

    /// Fixed description of the most recent status
    pub fn last_error_description(&self) -> Result<Description, PassThruError> {
        Description::new(self.last_error().description())
    }

    /// Detail of the most recent `Failed` call, cleared once taken
    pub fn take_last_error_detail(&self) -> Result<Option<Description>, PassThruError> {
        self.last_error
            .lock()
            .detail
            .take()
            .map(Description::new)
            .transpose()
    }

    fn ensure_device(&self) -> Result<(), PassThruError> {
        if self.link.is_connected() {
            Ok(())
        } else {
            Err(PassThruError::DeviceNotConnected)
        }
    }

    fn channel(&self, channel_id: u32) -> Result<Arc<Channel>, PassThruError> {
        self.ensure_device()?;
        self.registry
            .find_by_id(channel_id)
            .ok_or(PassThruError::InvalidChannelId(channel_id))
    }

    fn record<T>(&self, result: Result<T, PassThruError>) -> Result<T, PassThruError> {
        match &result {
            Ok(_) => self.record_status(Status::NoError, None),
            Err(e) => self.record_error(e),
        }
        result
    }

    fn record_error(&self, error: &PassThruError) {
        debug!(status = ?error.status(), "Call failed: {}", error);
        self.record_status(error.status(), error.detail());
    }

    fn record_status(&self, status: Status, detail: Option<&str>) {
        let mut last = self.last_error.lock();
        last.status = status;
        // the detail only describes the call that produced it
        last.detail = detail.map(str::to_string);
    }
}

impl Drop for PassThruDriver {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn raw_request(id: IoctlId, config: Option<&[SConfig]>) -> Result<IoctlRequest, PassThruError> {
    let input = || config.ok_or(PassThruError::NullParameter("ioctl input"));
    Ok(match id {
        IoctlId::GetConfig => {
            IoctlRequest::GetConfig(input()?.iter().map(|c| c.parameter).collect())
        }
        IoctlId::SetConfig => IoctlRequest::SetConfig(input()?.to_vec()),
        IoctlId::ReadVbatt => IoctlRequest::ReadVbatt,
        IoctlId::ReadProgVoltage => IoctlRequest::ReadProgVoltage,
        IoctlId::ClearTxBuffer => IoctlRequest::ClearTxBuffer,
        IoctlId::ClearRxBuffer => IoctlRequest::ClearRxBuffer,
        IoctlId::ClearPeriodicMsgs => IoctlRequest::ClearPeriodicMsgs,
        IoctlId::ClearMsgFilters => IoctlRequest::ClearMsgFilters,
        IoctlId::ClearFunctMsgLookupTable => IoctlRequest::ClearFunctMsgLookupTable,
        other => return Err(PassThruError::NotSupported(format!("IOCTL {:?}", other))),
    })
}
