//! Inbound Pump
//!
//! Background thread that reads the device link, decodes translator frames
//! and hands each one to every channel of the frame's protocol family.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use metrics::counter;
use passthru_protocol::{DeviceError, DeviceLink, Frame, FrameDecoder, FrameKind};
use tracing::{debug, error, info, trace, warn};

use crate::registry::ChannelRegistry;

/// Back-off after a link error
const ERROR_BACKOFF: Duration = Duration::from_millis(50);

pub struct InboundPump {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl InboundPump {
    pub fn start(
        link: Arc<dyn DeviceLink>,
        registry: Arc<ChannelRegistry>,
    ) -> Result<Self, std::io::Error> {
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&stop);
        let handle = thread::Builder::new()
            .name("passthru-rx".to_string())
            .spawn(move || run(link, registry, thread_stop))?;
        info!("Inbound pump started");
        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }

    /// Stop the thread and wait for it to exit
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("Inbound pump thread panicked");
            }
            info!("Inbound pump stopped");
        }
    }
}

impl Drop for InboundPump {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(link: Arc<dyn DeviceLink>, registry: Arc<ChannelRegistry>, stop: Arc<AtomicBool>) {
    let mut decoder = FrameDecoder::new();
    let mut link_down = false;

    while !stop.load(Ordering::SeqCst) {
        match link.receive() {
            Ok(Some(bytes)) => {
                link_down = false;
                for frame in decoder.push(&bytes) {
                    counter!("passthru_rx_frames_total").increment(1);
                    dispatch(&registry, &frame);
                }
            }
            Ok(None) => {
                link_down = false;
            }
            Err(DeviceError::NotConnected) => {
                if !link_down {
                    warn!("Device link lost, waiting for it to return");
                    link_down = true;
                }
                thread::sleep(ERROR_BACKOFF);
            }
            Err(e) => {
                debug!("Link receive failed: {}", e);
                thread::sleep(ERROR_BACKOFF);
            }
        }
    }
}

fn dispatch(registry: &ChannelRegistry, frame: &Frame) {
    let Some(family) = frame.kind().inbound_family() else {
        if frame.kind() != FrameKind::Version {
            trace!(kind = ?frame.kind(), "Ignoring non-bus frame");
        }
        return;
    };
    // registry lock is released before any channel runs
    let channels = registry.channels_for_family(family);
    for channel in channels {
        channel.engine.ingest(frame);
    }
}
