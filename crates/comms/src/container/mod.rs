//! Owns the transport clients of a service.
//!
//! Outbound, the container resolves a sender per channel and transmits
//! without blocking the caller. Inbound, it runs as a task-manager process:
//! every cycle it hands idle listeners as many slots as their level has
//! free, polls them in internal trackers and feeds each payload back as a
//! level tracker.

mod dispatch;
mod polling;
#[cfg(test)]
mod tests;

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::algorithm::{DefaultPriorityAlgorithm, ListenerPriorityAlgorithm};
use crate::client::{ListenerClient, PayloadProcessor, SenderClient};
use crate::collection::{ClientPriorityCollection, CollectionStatistics};
use crate::error::CommsError;
use crate::holder::{ClientHolder, ListenerStatistics};
use crate::policy::CommunicationPolicy;

pub use self::dispatch::{SenderHolder, SenderStatistics};

#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub dispatched: AtomicU64,
    pub not_routed: AtomicU64,
    pub undeliverable: AtomicU64,
    pub polls_started: AtomicU64,
    pub payloads_received: AtomicU64,
    pub recalculations: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CommunicationStatistics {
    pub listeners: Vec<ListenerStatistics>,
    pub senders: Vec<SenderStatistics>,
    pub collection: CollectionStatistics,
    pub dispatched: u64,
    pub not_routed: u64,
    pub undeliverable: u64,
    pub polls_started: u64,
    pub payloads_received: u64,
    pub recalculations: u64,
    /// Slots promised to polls in flight and payloads still queued.
    pub pending_slots: i64,
}

pub struct CommunicationContainer {
    policy: CommunicationPolicy,
    algorithm: Arc<dyn ListenerPriorityAlgorithm>,
    listeners: RwLock<Vec<Arc<ClientHolder>>>,
    senders: RwLock<Vec<Arc<SenderHolder>>>,
    sender_cache: DashMap<String, Option<Arc<SenderHolder>>>,
    supported_channels: RwLock<Option<HashSet<String>>>,
    collection: RwLock<Arc<ClientPriorityCollection>>,
    generation: AtomicU64,
    dirty: AtomicBool,
    last_recalculation: Mutex<Option<Instant>>,
    processor: RwLock<Option<Arc<dyn PayloadProcessor>>>,
    pending: Arc<AtomicI64>,
    counters: Arc<Counters>,
}

impl CommunicationContainer {
    pub fn new(policy: CommunicationPolicy) -> Result<Self, CommsError> {
        let algorithm = Arc::new(DefaultPriorityAlgorithm::new(policy.max_batch));
        Self::with_algorithm(policy, algorithm)
    }

    pub fn with_algorithm(
        policy: CommunicationPolicy,
        algorithm: Arc<dyn ListenerPriorityAlgorithm>,
    ) -> Result<Self, CommsError> {
        policy.validate()?;
        Ok(Self {
            policy,
            algorithm,
            listeners: RwLock::new(Vec::new()),
            senders: RwLock::new(Vec::new()),
            sender_cache: DashMap::new(),
            supported_channels: RwLock::new(None),
            collection: RwLock::new(Arc::new(ClientPriorityCollection::empty())),
            generation: AtomicU64::new(0),
            dirty: AtomicBool::new(true),
            last_recalculation: Mutex::new(None),
            processor: RwLock::new(None),
            pending: Arc::new(AtomicI64::new(0)),
            counters: Arc::new(Counters::default()),
        })
    }

    pub fn policy(&self) -> &CommunicationPolicy {
        &self.policy
    }

    pub fn register_listener(&self, client: Arc<dyn ListenerClient>) {
        info!(listener = %client.id(), channel = %client.channel_id(), "registered listener");
        self.listeners.write().push(Arc::new(ClientHolder::new(client)));
        self.mark_dirty();
    }

    /// Senders are consulted in registration order; the first one that
    /// supports a channel serves it.
    pub fn register_sender(&self, client: Arc<dyn SenderClient>) {
        info!(sender = %client.id(), "registered sender");
        self.senders.write().push(Arc::new(SenderHolder::new(client)));
        self.sender_cache.clear();
    }

    /// Where polled payloads go. Listeners are not polled until one is set.
    pub fn set_processor(&self, processor: Arc<dyn PayloadProcessor>) {
        *self.processor.write() = Some(processor);
    }

    /// Replace the set of channels local commands handle and schedule a
    /// recalculation.
    pub fn update_supported_channels<I, S>(&self, channels: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let set = channels
            .into_iter()
            .map(|c| c.as_ref().to_lowercase())
            .collect();
        *self.supported_channels.write() = Some(set);
        self.mark_dirty();
    }

    /// Rebuild the collection on the next cycle.
    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    pub fn needs_recalculation(&self, now: Instant) -> bool {
        if self.dirty.load(Ordering::Acquire) {
            return true;
        }
        match *self.last_recalculation.lock() {
            Some(last) => now.saturating_duration_since(last) >= self.policy.recalculate_interval(),
            None => true,
        }
    }

    /// Rank the listeners into a fresh collection and swap it in. The
    /// previous collection is closed. Returns the new generation.
    pub fn recalculate(&self, priority_levels: usize) -> u64 {
        self.dirty.store(false, Ordering::Release);
        *self.last_recalculation.lock() = Some(Instant::now());

        let eligible: Vec<Arc<ClientHolder>> = {
            let supported = self.supported_channels.read();
            self.listeners
                .read()
                .iter()
                .filter(|h| self.is_listening(supported.as_ref(), h))
                .cloned()
                .collect()
        };
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let next = Arc::new(ClientPriorityCollection::build(
            generation,
            &eligible,
            priority_levels,
            Arc::clone(&self.algorithm),
        ));
        let previous = std::mem::replace(&mut *self.collection.write(), next);
        previous.close();
        self.counters.recalculations.fetch_add(1, Ordering::Relaxed);
        debug!(generation, listeners = eligible.len(), "recalculated listener priorities");
        generation
    }

    fn is_listening(&self, supported: Option<&HashSet<String>>, holder: &ClientHolder) -> bool {
        if !self.policy.listen_supported_only {
            return true;
        }
        supported.map_or(true, |set| {
            set.contains(&holder.client().channel_id().to_lowercase())
        })
    }

    pub fn collection(&self) -> Arc<ClientPriorityCollection> {
        self.collection.read().clone()
    }

    pub fn pending_slots(&self) -> i64 {
        self.pending.load(Ordering::Acquire)
    }

    pub fn listener_statistics(&self, id: &str) -> Option<ListenerStatistics> {
        self.listeners
            .read()
            .iter()
            .find(|h| h.id() == id)
            .map(|h| h.statistics())
    }

    pub fn statistics(&self) -> CommunicationStatistics {
        let c = &self.counters;
        CommunicationStatistics {
            listeners: self.listeners.read().iter().map(|h| h.statistics()).collect(),
            senders: self.senders.read().iter().map(|s| s.statistics()).collect(),
            collection: self.collection().statistics(),
            dispatched: c.dispatched.load(Ordering::Relaxed),
            not_routed: c.not_routed.load(Ordering::Relaxed),
            undeliverable: c.undeliverable.load(Ordering::Relaxed),
            polls_started: c.polls_started.load(Ordering::Relaxed),
            payloads_received: c.payloads_received.load(Ordering::Relaxed),
            recalculations: c.recalculations.load(Ordering::Relaxed),
            pending_slots: self.pending_slots(),
        }
    }
}
