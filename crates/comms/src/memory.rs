//! In-process message fabric.
//!
//! Channels come in two modes. A queue channel has one backlog shared by
//! all its listeners, so each message is taken by exactly one of them. A
//! broadcast channel gives every listener its own backlog and a transmit
//! reaches all of them. Messages cross the fabric as encoded envelopes,
//! exactly as they would over a network transport.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use stellwerk_core::{ServiceMessage, TransmissionPayload};
use tracing::trace;

use crate::client::{ListenerClient, SenderClient};
use crate::error::CommsError;

type Backlog = Arc<Mutex<VecDeque<Vec<u8>>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelMode {
    Queue,
    Broadcast,
}

struct MemoryChannel {
    mode: ChannelMode,
    shared: Backlog,
    subscribers: Mutex<Vec<Backlog>>,
}

impl MemoryChannel {
    fn new(mode: ChannelMode) -> Self {
        Self {
            mode,
            shared: Arc::default(),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    fn attach(&self) -> Backlog {
        match self.mode {
            ChannelMode::Queue => Arc::clone(&self.shared),
            ChannelMode::Broadcast => {
                let backlog: Backlog = Arc::default();
                self.subscribers.lock().push(Arc::clone(&backlog));
                backlog
            }
        }
    }

    fn publish(&self, bytes: Vec<u8>) {
        match self.mode {
            ChannelMode::Queue => self.shared.lock().push_back(bytes),
            ChannelMode::Broadcast => {
                for backlog in self.subscribers.lock().iter() {
                    backlog.lock().push_back(bytes.clone());
                }
            }
        }
    }
}

/// A set of named channels shared by every client created from it.
#[derive(Clone, Default)]
pub struct MemoryFabric {
    channels: Arc<DashMap<String, Arc<MemoryChannel>>>,
}

impl MemoryFabric {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a channel. Declaring an existing channel keeps its mode and
    /// backlog.
    pub fn declare(&self, channel_id: &str, mode: ChannelMode) {
        self.channels
            .entry(channel_id.to_lowercase())
            .or_insert_with(|| Arc::new(MemoryChannel::new(mode)));
    }

    pub fn has_channel(&self, channel_id: &str) -> bool {
        self.channels.contains_key(&channel_id.to_lowercase())
    }

    fn channel(&self, channel_id: &str) -> Result<Arc<MemoryChannel>, CommsError> {
        self.channels
            .get(&channel_id.to_lowercase())
            .map(|c| Arc::clone(c.value()))
            .ok_or_else(|| CommsError::UnknownChannel(channel_id.to_string()))
    }

    /// Listener on a declared channel.
    pub fn listener(
        &self,
        id: impl Into<String>,
        channel_id: &str,
        priority: usize,
    ) -> Result<MemoryListener, CommsError> {
        let backlog = self.channel(channel_id)?.attach();
        Ok(MemoryListener {
            id: id.into(),
            channel_id: channel_id.to_lowercase(),
            priority,
            weighting: 1.0,
            backlog,
        })
    }

    /// Sender for the given channels. Channels need not be declared yet.
    pub fn sender<I, S>(&self, id: impl Into<String>, channels: I) -> MemorySender
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        MemorySender {
            id: id.into(),
            channels: channels
                .into_iter()
                .map(|c| c.as_ref().to_lowercase())
                .collect(),
            fabric: self.clone(),
        }
    }

    /// Messages waiting in a queue channel's shared backlog.
    pub fn depth(&self, channel_id: &str) -> Option<usize> {
        let channel = self.channel(channel_id).ok()?;
        let depth = channel.shared.lock().len();
        Some(depth)
    }
}

pub struct MemoryListener {
    id: String,
    channel_id: String,
    priority: usize,
    weighting: f64,
    backlog: Backlog,
}

impl MemoryListener {
    pub fn with_weighting(mut self, weighting: f64) -> Self {
        self.weighting = weighting;
        self
    }
}

#[async_trait]
impl ListenerClient for MemoryListener {
    fn id(&self) -> &str {
        &self.id
    }

    fn channel_id(&self) -> &str {
        &self.channel_id
    }

    fn priority(&self) -> usize {
        self.priority
    }

    fn weighting(&self) -> f64 {
        self.weighting
    }

    fn depth(&self) -> Option<u64> {
        Some(self.backlog.lock().len() as u64)
    }

    async fn poll(&self, max: usize) -> Result<Vec<TransmissionPayload>, CommsError> {
        let raw: Vec<Vec<u8>> = {
            let mut backlog = self.backlog.lock();
            let take = max.min(backlog.len());
            backlog.drain(..take).collect()
        };
        let mut payloads = Vec::with_capacity(raw.len());
        for bytes in raw {
            let message = ServiceMessage::from_bytes(&bytes)?;
            payloads.push(TransmissionPayload::from_source(message, self.id.clone()));
        }
        trace!(listener = %self.id, received = payloads.len(), "memory poll");
        Ok(payloads)
    }
}

pub struct MemorySender {
    id: String,
    channels: Vec<String>,
    fabric: MemoryFabric,
}

#[async_trait]
impl SenderClient for MemorySender {
    fn id(&self) -> &str {
        &self.id
    }

    fn supports_channel(&self, channel_id: &str) -> bool {
        self.channels.iter().any(|c| c.eq_ignore_ascii_case(channel_id))
    }

    async fn transmit(&self, payload: TransmissionPayload) -> Result<(), CommsError> {
        let channel = self.fabric.channel(payload.channel_id())?;
        channel.publish(payload.message.to_bytes()?);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use stellwerk_core::{ServiceIdentity, ServiceMessageHeader};

    use super::*;

    fn payload(channel: &str, n: u32) -> TransmissionPayload {
        let identity = ServiceIdentity::new("test", "test-1");
        let message =
            ServiceMessage::new(ServiceMessageHeader::new(channel, "tick", None), &identity, &n)
                .unwrap();
        TransmissionPayload::new(message)
    }

    #[tokio::test]
    async fn queue_listeners_compete() {
        let fabric = MemoryFabric::new();
        fabric.declare("work", ChannelMode::Queue);
        let a = fabric.listener("a", "work", 0).unwrap();
        let b = fabric.listener("b", "work", 0).unwrap();
        let sender = fabric.sender("s", ["work"]);

        for n in 0..3 {
            sender.transmit(payload("work", n)).await.unwrap();
        }
        assert_eq!(fabric.depth("work"), Some(3));

        let first = a.poll(2).await.unwrap();
        let rest = b.poll(10).await.unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].message.decode::<u32>().unwrap(), 2);
        assert_eq!(rest[0].source.as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn broadcast_reaches_every_listener() {
        let fabric = MemoryFabric::new();
        fabric.declare("events", ChannelMode::Broadcast);
        let a = fabric.listener("a", "events", 0).unwrap();
        let b = fabric.listener("b", "events", 0).unwrap();
        fabric
            .sender("s", ["events"])
            .transmit(payload("events", 7))
            .await
            .unwrap();

        assert_eq!(a.poll(5).await.unwrap().len(), 1);
        assert_eq!(b.poll(5).await.unwrap().len(), 1);
        assert!(a.poll(5).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn undeclared_channels_are_errors() {
        let fabric = MemoryFabric::new();
        assert!(matches!(
            fabric.listener("a", "nowhere", 0),
            Err(CommsError::UnknownChannel(_))
        ));
        let sender = fabric.sender("s", ["nowhere"]);
        assert!(sender.supports_channel("NOWHERE"));
        assert!(matches!(
            sender.transmit(payload("nowhere", 1)).await,
            Err(CommsError::UnknownChannel(_))
        ));
    }
}
