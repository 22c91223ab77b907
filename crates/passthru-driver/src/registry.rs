//! Channel Registry

use std::sync::Arc;

use parking_lot::Mutex;
use passthru_protocol::{PassThruError, ProtocolFamily, ProtocolId};
use thiserror::Error;
use tracing::debug;

use crate::engine::ProtocolEngine;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("Too many channels open!")]
    CapacityExceeded(usize),

    #[error("Protocol {0:?} already has an open channel")]
    ProtocolInUse(ProtocolId),

    #[error("Channel {0} not found")]
    NotFound(u32),
}

impl From<RegistryError> for PassThruError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::CapacityExceeded(_) => PassThruError::Failed(err.to_string()),
            RegistryError::ProtocolInUse(_) => PassThruError::ChannelInUse,
            RegistryError::NotFound(id) => PassThruError::InvalidChannelId(id),
        }
    }
}

/// An open channel
pub struct Channel {
    pub id: u32,
    pub protocol_id: ProtocolId,
    pub engine: Arc<ProtocolEngine>,
}

struct Inner {
    channels: Vec<Arc<Channel>>,
    next_id: u32,
}

/// Open channels keyed by id, at most one per protocol
///
/// Lookups hand out `Arc<Channel>` clones so callers never hold the registry
/// lock while talking to a channel.
pub struct ChannelRegistry {
    inner: Mutex<Inner>,
    capacity: usize,
}

impl ChannelRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                channels: Vec::with_capacity(capacity),
                next_id: 1,
            }),
            capacity,
        }
    }

    /// Reserve the next channel id; ids are never reused
    pub fn allocate_id(&self) -> u32 {
        let mut inner = self.inner.lock();
        let id = inner.next_id;
        inner.next_id = inner.next_id.wrapping_add(1).max(1);
        id
    }

    pub fn has_capacity(&self) -> bool {
        self.inner.lock().channels.len() < self.capacity
    }

    pub fn add(&self, channel: Channel) -> Result<Arc<Channel>, RegistryError> {
        let mut inner = self.inner.lock();
        if inner.channels.len() >= self.capacity {
            return Err(RegistryError::CapacityExceeded(self.capacity));
        }
        if inner
            .channels
            .iter()
            .any(|c| c.protocol_id == channel.protocol_id)
        {
            return Err(RegistryError::ProtocolInUse(channel.protocol_id));
        }
        let channel = Arc::new(channel);
        inner.channels.push(Arc::clone(&channel));
        debug!(channel = channel.id, open = inner.channels.len(), "Channel registered");
        Ok(channel)
    }

    pub fn remove_by_id(&self, id: u32) -> Result<Arc<Channel>, RegistryError> {
        let mut inner = self.inner.lock();
        let pos = inner
            .channels
            .iter()
            .position(|c| c.id == id)
            .ok_or(RegistryError::NotFound(id))?;
        Ok(inner.channels.remove(pos))
    }

    pub fn find_by_id(&self, id: u32) -> Option<Arc<Channel>> {
        self.inner
            .lock()
            .channels
            .iter()
            .find(|c| c.id == id)
            .cloned()
    }

    pub fn find_by_protocol(&self, protocol_id: ProtocolId) -> Option<Arc<Channel>> {
        self.inner
            .lock()
            .channels
            .iter()
            .find(|c| c.protocol_id == protocol_id)
            .cloned()
    }

    /// Channels whose protocol uses the given translator frame family
    pub fn channels_for_family(&self, family: ProtocolFamily) -> Vec<Arc<Channel>> {
        self.inner
            .lock()
            .channels
            .iter()
            .filter(|c| c.protocol_id.family() == family)
            .cloned()
            .collect()
    }

    /// Remove and return every channel
    pub fn drain(&self) -> Vec<Arc<Channel>> {
        std::mem::take(&mut self.inner.lock().channels)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().channels.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineConfig;
    use crate::variant::{CanVariant, VpwVariant};
    use passthru_protocol::{ConnectFlags, MockLink};

    fn channel(registry: &ChannelRegistry, protocol_id: ProtocolId) -> Channel {
        let link = Arc::new(MockLink::new());
        let (variant, baud): (Box<dyn crate::variant::ProtocolVariant>, u32) =
            match protocol_id.family() {
                ProtocolFamily::Vpw => (Box::new(VpwVariant::new(protocol_id)), 10_400),
                _ => (Box::new(CanVariant::new(protocol_id, ConnectFlags::empty())), 500_000),
            };
        let id = registry.allocate_id();
        let engine = ProtocolEngine::connect(
            id,
            variant,
            link,
            ConnectFlags::empty(),
            baud,
            EngineConfig::default(),
        )
        .unwrap();
        Channel {
            id,
            protocol_id,
            engine,
        }
    }

    #[test]
    fn test_one_channel_per_protocol() {
        let registry = ChannelRegistry::new(8);
        registry.add(channel(&registry, ProtocolId::J1850Vpw)).unwrap();
        let err = registry
            .add(channel(&registry, ProtocolId::J1850Vpw))
            .err();
        assert_eq!(err, Some(RegistryError::ProtocolInUse(ProtocolId::J1850Vpw)));
        assert_eq!(
            PassThruError::from(RegistryError::ProtocolInUse(ProtocolId::J1850Vpw)),
            PassThruError::ChannelInUse
        );
    }

    #[test]
    fn test_capacity() {
        let registry = ChannelRegistry::new(1);
        registry.add(channel(&registry, ProtocolId::J1850Vpw)).unwrap();
        assert!(!registry.has_capacity());
        let err = registry.add(channel(&registry, ProtocolId::Can)).err().unwrap();
        assert_eq!(
            PassThruError::from(err),
            PassThruError::Failed("Too many channels open!".to_string())
        );
    }

    #[test]
    fn test_ids_strictly_increase() {
        let registry = ChannelRegistry::new(8);
        let first = registry.add(channel(&registry, ProtocolId::Can)).unwrap();
        registry.remove_by_id(first.id).unwrap();
        let second = registry.add(channel(&registry, ProtocolId::Can)).unwrap();
        assert!(second.id > first.id);
        assert!(registry.find_by_id(first.id).is_none());
        assert_eq!(
            registry.remove_by_id(first.id).err(),
            Some(RegistryError::NotFound(first.id))
        );
    }

    #[test]
    fn test_family_lookup() {
        let registry = ChannelRegistry::new(8);
        registry.add(channel(&registry, ProtocolId::J1850Vpw)).unwrap();
        registry.add(channel(&registry, ProtocolId::Can)).unwrap();
        registry.add(channel(&registry, ProtocolId::CanPs)).unwrap();

        assert_eq!(registry.channels_for_family(ProtocolFamily::Can).len(), 2);
        assert_eq!(registry.channels_for_family(ProtocolFamily::Vpw).len(), 1);
        assert_eq!(registry.drain().len(), 3);
        assert!(registry.is_empty());
    }
}
