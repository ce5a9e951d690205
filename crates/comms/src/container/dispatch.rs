use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use stellwerk_core::{Dispatcher, TransmissionPayload};
use tokio::runtime::Handle;
use tracing::{debug, warn};

use super::CommunicationContainer;
use crate::client::SenderClient;
use crate::error::CommsError;

#[derive(Debug, Clone, Serialize)]
pub struct SenderStatistics {
    pub id: String,
    pub transmitted: u64,
    pub failed: u64,
}

/// A sender client plus its counters.
pub struct SenderHolder {
    client: Arc<dyn SenderClient>,
    transmitted: AtomicU64,
    failed: AtomicU64,
}

impl SenderHolder {
    pub fn new(client: Arc<dyn SenderClient>) -> Self {
        Self {
            client,
            transmitted: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> &str {
        self.client.id()
    }

    pub async fn transmit(&self, payload: TransmissionPayload) -> Result<(), CommsError> {
        match self.client.transmit(payload).await {
            Ok(()) => {
                self.transmitted.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(e) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
        }
    }

    pub fn statistics(&self) -> SenderStatistics {
        SenderStatistics {
            id: self.client.id().to_string(),
            transmitted: self.transmitted.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

impl CommunicationContainer {
    /// First registered sender supporting `channel_id`. Lookups, misses
    /// included, are cached until the next sender registration.
    pub fn resolve_sender(&self, channel_id: &str) -> Option<Arc<SenderHolder>> {
        let key = channel_id.to_lowercase();
        if let Some(cached) = self.sender_cache.get(&key) {
            return cached.clone();
        }
        let found = self
            .senders
            .read()
            .iter()
            .find(|s| s.client.supports_channel(&key))
            .cloned();
        self.sender_cache.insert(key, found.clone());
        found
    }

    /// Transmit on the caller's task and report the outcome.
    pub async fn transmit(&self, payload: TransmissionPayload) -> Result<(), CommsError> {
        let sender = self
            .resolve_sender(payload.channel_id())
            .ok_or_else(|| CommsError::NoSender(payload.channel_id().to_string()))?;
        self.counters.dispatched.fetch_add(1, Ordering::Relaxed);
        sender.transmit(payload).await
    }
}

impl Dispatcher for CommunicationContainer {
    /// Hands the payload to its sender on a spawned task. Failures are
    /// logged and counted on the sender.
    fn dispatch(&self, payload: TransmissionPayload) {
        if !payload.options.route_external {
            self.counters.not_routed.fetch_add(1, Ordering::Relaxed);
            debug!(channel = %payload.channel_id(), "payload not routed externally");
            return;
        }
        let Some(sender) = self.resolve_sender(payload.channel_id()) else {
            self.counters.undeliverable.fetch_add(1, Ordering::Relaxed);
            warn!(channel = %payload.channel_id(), "no sender for channel, dropping payload");
            return;
        };
        let Ok(runtime) = Handle::try_current() else {
            self.counters.undeliverable.fetch_add(1, Ordering::Relaxed);
            warn!(channel = %payload.channel_id(), "dispatch outside the runtime, dropping payload");
            return;
        };
        self.counters.dispatched.fetch_add(1, Ordering::Relaxed);
        runtime.spawn(async move {
            let channel = payload.channel_id().to_string();
            if let Err(e) = sender.transmit(payload).await {
                warn!(sender = %sender.id(), %channel, error = %e, "transmit failed");
            }
        });
    }
}
