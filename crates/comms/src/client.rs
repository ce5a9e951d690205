use std::sync::Arc;

use async_trait::async_trait;
use stellwerk_core::TransmissionPayload;
use stellwerk_tasks::TaskError;

use crate::error::CommsError;

/// Pulls inbound payloads from a transport.
///
/// Implementations handle the specifics of one transport (queue, topic
/// subscription, in-memory channel). The runtime never calls `poll` on the
/// same client concurrently.
#[async_trait]
pub trait ListenerClient: Send + Sync {
    /// Unique client id; stamped as the source of every payload it yields.
    fn id(&self) -> &str;

    /// Channel the client listens on.
    fn channel_id(&self) -> &str;

    /// Priority level the client's payloads are processed at.
    fn priority(&self) -> usize {
        0
    }

    /// Relative share of polls among clients of the same level.
    fn weighting(&self) -> f64 {
        1.0
    }

    /// Approximate number of messages waiting, when the transport knows.
    fn depth(&self) -> Option<u64> {
        None
    }

    /// Fetch up to `max` payloads. Returns an empty vec when nothing is
    /// waiting.
    async fn poll(&self, max: usize) -> Result<Vec<TransmissionPayload>, CommsError>;
}

/// Blanket implementation so `Arc<dyn ListenerClient>` can be used directly.
#[async_trait]
impl<T: ListenerClient + ?Sized> ListenerClient for Arc<T> {
    fn id(&self) -> &str {
        (**self).id()
    }

    fn channel_id(&self) -> &str {
        (**self).channel_id()
    }

    fn priority(&self) -> usize {
        (**self).priority()
    }

    fn weighting(&self) -> f64 {
        (**self).weighting()
    }

    fn depth(&self) -> Option<u64> {
        (**self).depth()
    }

    async fn poll(&self, max: usize) -> Result<Vec<TransmissionPayload>, CommsError> {
        (**self).poll(max).await
    }
}

/// Pushes outbound payloads onto a transport.
#[async_trait]
pub trait SenderClient: Send + Sync {
    fn id(&self) -> &str;

    fn supports_channel(&self, channel_id: &str) -> bool;

    async fn transmit(&self, payload: TransmissionPayload) -> Result<(), CommsError>;
}

#[async_trait]
impl<T: SenderClient + ?Sized> SenderClient for Arc<T> {
    fn id(&self) -> &str {
        (**self).id()
    }

    fn supports_channel(&self, channel_id: &str) -> bool {
        (**self).supports_channel(channel_id)
    }

    async fn transmit(&self, payload: TransmissionPayload) -> Result<(), CommsError> {
        (**self).transmit(payload).await
    }
}

/// Receives every payload a listener produced, one call per payload, inside
/// a task-manager tracker at the listener's priority level.
#[async_trait]
pub trait PayloadProcessor: Send + Sync {
    async fn process_payload(&self, payload: TransmissionPayload) -> Result<(), TaskError>;
}
