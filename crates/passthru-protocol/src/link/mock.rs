//! In-memory Device Link for Tests
//!
//! Records every frame the driver sends and lets a test inject inbound
//! frames, either directly or through a responder that reacts to sent frames
//! the way an ECU would.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use super::DeviceLink;
use crate::error::DeviceError;
use crate::frame::{Frame, FrameDecoder, FrameKind};

/// How long `receive` blocks before reporting an idle poll
const POLL_INTERVAL: Duration = Duration::from_millis(10);

type Responder = Box<dyn Fn(&Frame) -> Vec<Frame> + Send + Sync>;

/// Mock translator link
pub struct MockLink {
    connected: AtomicBool,
    fail_sends: AtomicBool,
    sent: Mutex<Vec<Frame>>,
    decoder: Mutex<FrameDecoder>,
    inbound: Mutex<VecDeque<Vec<u8>>>,
    inbound_ready: Condvar,
    responder: Mutex<Option<Responder>>,
    send_delay: Mutex<Duration>,
    version: String,
}

impl MockLink {
    /// Create a connected mock link
    pub fn new() -> Self {
        Self {
            connected: AtomicBool::new(true),
            fail_sends: AtomicBool::new(false),
            sent: Mutex::new(Vec::new()),
            decoder: Mutex::new(FrameDecoder::new()),
            inbound: Mutex::new(VecDeque::new()),
            inbound_ready: Condvar::new(),
            responder: Mutex::new(None),
            send_delay: Mutex::new(Duration::ZERO),
            version: "MOCK-1.0".to_string(),
        }
    }

    /// Simulate plugging or unplugging the translator
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Make every following send fail with a serial error
    pub fn set_fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    /// Delay applied to each send, to emulate a slow bus
    pub fn set_send_delay(&self, delay: Duration) {
        *self.send_delay.lock() = delay;
    }

    /// React to sent frames with inbound frames
    pub fn set_responder<F>(&self, responder: F)
    where
        F: Fn(&Frame) -> Vec<Frame> + Send + Sync + 'static,
    {
        *self.responder.lock() = Some(Box::new(responder));
    }

    /// Queue raw inbound bytes
    pub fn inject_bytes(&self, bytes: Vec<u8>) {
        self.inbound.lock().push_back(bytes);
        self.inbound_ready.notify_one();
    }

    /// Queue an inbound frame
    pub fn inject_frame(&self, frame: &Frame) {
        self.inject_bytes(frame.encode());
    }

    /// Frames sent so far
    pub fn sent_frames(&self) -> Vec<Frame> {
        self.sent.lock().clone()
    }

    /// Sent frames of one kind
    pub fn sent_of_kind(&self, kind: FrameKind) -> Vec<Frame> {
        self.sent
            .lock()
            .iter()
            .filter(|f| f.kind() == kind)
            .cloned()
            .collect()
    }

    /// Drain the record of sent frames
    pub fn take_sent(&self) -> Vec<Frame> {
        std::mem::take(&mut *self.sent.lock())
    }
}

impl Default for MockLink {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceLink for MockLink {
    fn send(&self, bytes: &[u8], _timeout: Duration) -> Result<(), DeviceError> {
        if !self.is_connected() {
            return Err(DeviceError::NotConnected);
        }
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(DeviceError::Serial("injected send failure".to_string()));
        }

        let delay = *self.send_delay.lock();
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }

        let frames = self.decoder.lock().push(bytes);
        let mut replies = Vec::new();
        {
            let responder = self.responder.lock();
            for frame in &frames {
                if frame.kind() == FrameKind::Version {
                    replies.push(Frame::new(FrameKind::Version, self.version.as_bytes().to_vec()));
                }
                if let Some(respond) = responder.as_ref() {
                    replies.extend(respond(frame));
                }
            }
        }
        self.sent.lock().extend(frames);

        for reply in &replies {
            self.inject_frame(reply);
        }
        Ok(())
    }

    fn receive(&self) -> Result<Option<Vec<u8>>, DeviceError> {
        if !self.is_connected() {
            return Err(DeviceError::NotConnected);
        }

        let mut inbound = self.inbound.lock();
        if inbound.is_empty() {
            self.inbound_ready.wait_for(&mut inbound, POLL_INTERVAL);
        }
        Ok(inbound.pop_front())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn wait_until_initialized(
        &self,
        _identifier: Option<&str>,
        _timeout: Duration,
    ) -> Result<(), DeviceError> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(DeviceError::NotConnected)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::CanFrame;

    #[test]
    fn test_records_sent_frames() {
        let link = MockLink::new();
        let frame = Frame::new(FrameKind::VpwTx, vec![0x68, 0x6A, 0xF1, 0x01, 0x00]);
        link.send_frame(&frame, Duration::ZERO).unwrap();

        assert_eq!(link.sent_frames(), vec![frame.clone()]);
        assert_eq!(link.sent_of_kind(FrameKind::VpwTx).len(), 1);
        assert_eq!(link.take_sent().len(), 1);
        assert!(link.sent_frames().is_empty());
    }

    #[test]
    fn test_answers_version_request() {
        let link = MockLink::new();
        link.send_frame(&Frame::version_request(), Duration::ZERO).unwrap();

        let bytes = link.receive().unwrap().unwrap();
        let frames = FrameDecoder::new().push(&bytes);
        assert_eq!(frames[0].kind(), FrameKind::Version);
        assert_eq!(frames[0].body(), b"MOCK-1.0");
    }

    #[test]
    fn test_responder_injects_replies() {
        let link = MockLink::new();
        link.set_responder(|frame| {
            if frame.kind() != FrameKind::CanTx {
                return Vec::new();
            }
            let fc = CanFrame::new(0x7E8, false, vec![0x30, 0x00, 0x00]).unwrap();
            vec![Frame::can(FrameKind::CanRx, &fc)]
        });

        let ff = CanFrame::new(0x7E0, false, vec![0x10, 0x14, 0, 0, 0, 0, 0, 0]).unwrap();
        link.send_frame(&Frame::can(FrameKind::CanTx, &ff), Duration::ZERO)
            .unwrap();

        let bytes = link.receive().unwrap().unwrap();
        let frames = FrameDecoder::new().push(&bytes);
        assert_eq!(frames[0].as_can().unwrap().data, vec![0x30, 0x00, 0x00]);
    }

    #[test]
    fn test_disconnected_link() {
        let link = MockLink::new();
        link.set_connected(false);
        assert!(matches!(
            link.send(&[0x02], Duration::ZERO),
            Err(DeviceError::NotConnected)
        ));
        assert!(link.wait_until_initialized(None, Duration::ZERO).is_err());
    }

    #[test]
    fn test_idle_receive_returns_none() {
        let link = MockLink::new();
        assert_eq!(link.receive().unwrap(), None);
    }

    #[test]
    fn test_injected_send_failure() {
        let link = MockLink::new();
        link.set_fail_sends(true);
        assert!(matches!(
            link.send(&[0x02, 0x00, 0x01, 0xE0], Duration::ZERO),
            Err(DeviceError::Serial(_))
        ));
    }
}
