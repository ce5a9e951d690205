//! Where payloads go once they leave a command or arrive from a listener.
//!
//! Outbound payloads a local command can handle are looped back into the
//! task manager; everything else goes to the communication container.
//! Inbound payloads are handed to the first command supporting their header.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Serialize;
use stellwerk_command::{Command, CommandError};
use stellwerk_comms::{CommunicationContainer, PayloadProcessor};
use stellwerk_core::{
    Dispatcher, MessageStatus, ServiceIdentity, ServiceMessageHeader, TransmissionPayload,
};
use stellwerk_tasks::{TaskError, TaskSubmitter, TaskTracker, TrackerKind, TrackerPriority};
use tracing::{debug, warn};

#[derive(Debug, Default)]
struct RoutingCounters {
    internal: AtomicU64,
    external: AtomicU64,
    dropped: AtomicU64,
    processed: AtomicU64,
    failed: AtomicU64,
    not_supported: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RoutingStatistics {
    pub internal: u64,
    pub external: u64,
    pub dropped: u64,
    pub processed: u64,
    pub failed: u64,
    pub not_supported: u64,
}

pub struct MessageRouter {
    me: Weak<MessageRouter>,
    identity: ServiceIdentity,
    commands: RwLock<Vec<Arc<Command>>>,
    comms: Arc<CommunicationContainer>,
    submitter: TaskSubmitter,
    counters: RoutingCounters,
}

impl MessageRouter {
    pub(crate) fn new(
        identity: ServiceIdentity,
        comms: Arc<CommunicationContainer>,
        submitter: TaskSubmitter,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            identity,
            commands: RwLock::new(Vec::new()),
            comms,
            submitter,
            counters: RoutingCounters::default(),
        })
    }

    pub(crate) fn add_command(&self, command: Arc<Command>) {
        self.commands.write().push(command);
    }

    pub fn commands(&self) -> Vec<Arc<Command>> {
        self.commands.read().clone()
    }

    /// First registered command that supports `header`.
    pub fn resolve(&self, header: &ServiceMessageHeader) -> Option<Arc<Command>> {
        self.commands
            .read()
            .iter()
            .find(|c| c.supports(header))
            .cloned()
    }

    pub fn supported_channels(&self) -> BTreeSet<String> {
        self.commands
            .read()
            .iter()
            .flat_map(|c| c.supported_messages())
            .map(|f| f.channel_id)
            .collect()
    }

    /// Tell the communication container which channels are worth polling.
    pub fn refresh_supported_channels(&self) {
        let channels = self.supported_channels();
        debug!(channels = channels.len(), "supported channels changed");
        self.comms.update_supported_channels(channels);
    }

    /// Process one inbound payload with the command that supports it and
    /// send on whatever it produced.
    pub async fn route(&self, payload: TransmissionPayload) -> Result<(), TaskError> {
        let Some(command) = self.resolve(&payload.message.header) else {
            self.reject(&payload);
            return Ok(());
        };
        let mut responses = Vec::new();
        let result = command.process_message(payload, &mut responses).await;
        for response in responses {
            self.dispatch(response);
        }
        match result {
            Ok(()) => {
                self.counters.processed.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(CommandError::NotSupported(header)) => {
                self.counters.not_supported.fetch_add(1, Ordering::Relaxed);
                debug!(command = %command.name(), %header, "command declined message");
                Ok(())
            }
            Err(e) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                Err(e.into())
            }
        }
    }

    /// Count an unsupported message and, if the sender waits for a reply,
    /// answer `NotSupported`.
    fn reject(&self, payload: &TransmissionPayload) {
        self.counters.not_supported.fetch_add(1, Ordering::Relaxed);
        let message = &payload.message;
        warn!(header = %message.header, source = ?payload.source, "no command supports message");
        if message.response_header.is_none() || message.is_response() {
            return;
        }
        let mut reply = message.to_response(&self.identity, MessageStatus::NotSupported);
        reply.status_description = Some(format!("{} is not supported", message.header));
        self.dispatch(TransmissionPayload::new(reply));
    }

    pub fn statistics(&self) -> RoutingStatistics {
        let c = &self.counters;
        RoutingStatistics {
            internal: c.internal.load(Ordering::Relaxed),
            external: c.external.load(Ordering::Relaxed),
            dropped: c.dropped.load(Ordering::Relaxed),
            processed: c.processed.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
            not_supported: c.not_supported.load(Ordering::Relaxed),
        }
    }

    fn loop_back(&self, router: Arc<Self>, payload: TransmissionPayload) {
        let level = usize::from(payload.message.channel_priority);
        let limit = payload.max_processing_time;
        let tracker = TaskTracker::new(
            format!("internal:{}", payload.message.header),
            TrackerKind::Payload,
            TrackerPriority::Level(level),
            move |_| async move { router.route(payload).await },
        );
        let tracker = match limit {
            Some(limit) => tracker.with_max_processing_time(limit),
            None => tracker,
        };
        self.counters.internal.fetch_add(1, Ordering::Relaxed);
        self.submitter.execute_or_enqueue(tracker);
    }
}

impl Dispatcher for MessageRouter {
    fn dispatch(&self, payload: TransmissionPayload) {
        let options = payload.options;
        if options.route_internal && self.resolve(&payload.message.header).is_some() {
            if let Some(router) = self.me.upgrade() {
                self.loop_back(router, payload);
                return;
            }
        }
        if options.route_external {
            self.counters.external.fetch_add(1, Ordering::Relaxed);
            self.comms.dispatch(payload);
            return;
        }
        self.counters.dropped.fetch_add(1, Ordering::Relaxed);
        warn!(header = %payload.message.header, "internal-only payload has no local handler");
    }
}

#[async_trait]
impl PayloadProcessor for MessageRouter {
    async fn process_payload(&self, payload: TransmissionPayload) -> Result<(), TaskError> {
        self.route(payload).await
    }
}
